//! This module contains the batch pipeline: price history -> indicators -> patterns,
//! joined with auxiliary market data and persisted as one snapshot.

use crate::error::{ProviderError, SymbolFailure};
use crate::indicators::compute_indicators;
use crate::market_info::{
    InstitutionalFlowSource, NameCache, NameLookup, NetFlowTable, resolve_net_flows,
};
use crate::patterns::classify;
use crate::price_history::{Bar, PriceHistorySource, validate_series};
use crate::snapshot::{NetFlow, Snapshot, SymbolRecord, round2, write_snapshot};
use crate::storage_utils::{AppConfig, AsyncStorageManager};
use anyhow::Result;
use chrono::NaiveDate;
use std::path::PathBuf;
use std::time::Duration;

/// The upstream collaborators a run talks to.
pub struct Sources<'a> {
    pub prices: &'a dyn PriceHistorySource,
    pub names: &'a dyn NameLookup,
    pub flows: &'a dyn InstitutionalFlowSource,
}

#[derive(Debug)]
pub enum SymbolOutcome {
    Classified(SymbolRecord),
    Failed { symbol: String, reason: SymbolFailure },
}

#[derive(Debug, Default)]
pub struct BatchReport {
    pub outcomes: Vec<SymbolOutcome>,
}

impl BatchReport {
    /// Successful records keyed by cleaned code, in processing order.
    pub fn snapshot(&self) -> Snapshot {
        self.outcomes
            .iter()
            .filter_map(|outcome| match outcome {
                SymbolOutcome::Classified(record) => Some((record.symbol.clone(), record.clone())),
                SymbolOutcome::Failed { .. } => None,
            })
            .collect()
    }

    pub fn failures(&self) -> impl Iterator<Item = (&str, &SymbolFailure)> {
        self.outcomes.iter().filter_map(|outcome| match outcome {
            SymbolOutcome::Failed { symbol, reason } => Some((symbol.as_str(), reason)),
            SymbolOutcome::Classified(_) => None,
        })
    }

    pub fn classified_count(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o, SymbolOutcome::Classified(_)))
            .count()
    }
}

/// Strips the exchange suffix: "2330.TW" -> "2330", "6488.TWO" -> "6488".
pub fn clean_symbol(symbol: &str) -> &str {
    symbol
        .strip_suffix(".TWO")
        .or_else(|| symbol.strip_suffix(".TW"))
        .unwrap_or(symbol)
}

/// Processes every configured symbol in order, one at a time.
/// A failing symbol is recorded and skipped; the batch itself never fails.
pub async fn run_batch(config: &AppConfig, sources: &Sources<'_>, run_date: NaiveDate) -> BatchReport {
    let flows = resolve_net_flows(
        sources.flows,
        run_date,
        config.flow_net_column,
        config.shares_per_lot,
    )
    .await;
    let mut names = NameCache::default();
    let delay = Duration::from_millis(config.request_delay_ms);

    let mut report = BatchReport::default();
    for (i, symbol) in config.symbols.iter().enumerate() {
        let fetched = sources.prices.fetch_history(symbol, &config.history).await;
        let got_bars = matches!(&fetched, Ok(bars) if !bars.is_empty());

        let outcome = match build_record(symbol, fetched, &flows, &mut names, sources, run_date).await {
            Ok(record) => {
                tracing::info!(
                    symbol = %symbol,
                    regime = %record.regime,
                    patterns = ?record.patterns,
                    "classified"
                );
                SymbolOutcome::Classified(record)
            }
            Err(reason) => {
                tracing::warn!(symbol = %symbol, error = %reason, "symbol skipped");
                SymbolOutcome::Failed {
                    symbol: symbol.clone(),
                    reason,
                }
            }
        };
        report.outcomes.push(outcome);

        // Every fetch that returned bars counts against the upstream's patience,
        // even when the series is later rejected.
        let is_last = i + 1 == config.symbols.len();
        if got_bars && !is_last && !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }

    tracing::debug!(names = names.len(), "name cache at end of run");
    report
}

async fn build_record(
    symbol: &str,
    fetched: Result<Vec<Bar>, ProviderError>,
    flows: &NetFlowTable,
    names: &mut NameCache,
    sources: &Sources<'_>,
    run_date: NaiveDate,
) -> Result<SymbolRecord, SymbolFailure> {
    let series = fetched.map_err(SymbolFailure::History)?;

    let Some(latest) = series.last() else {
        return Err(SymbolFailure::EmptyHistory);
    };
    validate_series(&series)?;

    let indicators = compute_indicators(&series);
    let result = classify(&series, &indicators);

    let code = clean_symbol(symbol);
    let name = names.resolve(sources.names, code, run_date).await;
    let institutional_net_flow = flows
        .get(code)
        .copied()
        .map_or(NetFlow::Unavailable, NetFlow::Lots);

    Ok(SymbolRecord {
        symbol: code.to_string(),
        name,
        price: round2(latest.close),
        patterns: result.patterns,
        regime: result.regime,
        institutional_net_flow,
        date: run_date,
    })
}

/// Runs the batch and replaces the stored snapshot, even when every symbol failed.
/// Only an invalid config or a failed write is returned as an error.
pub async fn run_analysis_pipeline(
    config: &AppConfig,
    sources: &Sources<'_>,
    storage: &AsyncStorageManager,
    run_date: NaiveDate,
) -> Result<PipelineOutput> {
    config.validate()?;

    let report = run_batch(config, sources, run_date).await;
    let snapshot = report.snapshot();

    let path = write_snapshot(storage, &config.snapshot_name, &snapshot).await?;
    tracing::info!(
        path = %path.display(),
        records = snapshot.len(),
        failed = report.failures().count(),
        "snapshot written"
    );

    Ok(PipelineOutput {
        report,
        snapshot,
        path,
    })
}

/// What a completed run produced: per-symbol outcomes and the document that was written.
#[derive(Debug)]
pub struct PipelineOutput {
    pub report: BatchReport,
    pub snapshot: Snapshot,
    pub path: PathBuf,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market_info::UNAVAILABLE;
    use crate::patterns::{Pattern, Regime};
    use crate::snapshot::read_snapshot;
    use crate::storage_utils::HistoryConfig;
    use async_trait::async_trait;
    use chrono::Duration as Days;
    use serde_json::{Value, json};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakePrices {
        series: HashMap<String, Vec<Bar>>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl PriceHistorySource for FakePrices {
        async fn fetch_history(
            &self,
            symbol: &str,
            _history: &HistoryConfig,
        ) -> Result<Vec<Bar>, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.series.get(symbol) {
                Some(bars) => Ok(bars.clone()),
                None => Err(ProviderError::Status(404)),
            }
        }
    }

    struct FakeNames {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl NameLookup for FakeNames {
        async fn lookup_name(&self, code: &str, _date: NaiveDate) -> Result<String, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match code {
                "2330" => Ok("台積電".to_string()),
                "2317" => Ok("鴻海".to_string()),
                _ => Err(ProviderError::Malformed("no title".to_string())),
            }
        }
    }

    struct FakeFlows {
        rows: Option<Vec<Vec<Value>>>,
    }

    #[async_trait]
    impl InstitutionalFlowSource for FakeFlows {
        async fn fetch_flow_rows(&self, _date: NaiveDate) -> Result<Vec<Vec<Value>>, ProviderError> {
            self.rows.clone().ok_or(ProviderError::Status(500))
        }
    }

    fn run_date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 10, 19).unwrap()
    }

    fn trending(len: usize, start: f64, step: f64) -> Vec<Bar> {
        let first = NaiveDate::from_ymd_opt(2026, 4, 1).unwrap();
        (0..len)
            .map(|i| {
                let close = start + step * i as f64;
                Bar {
                    date: first + Days::days(i as i64),
                    open: close - step / 2.0,
                    high: close + 1.0,
                    low: close - 1.0,
                    close,
                }
            })
            .collect()
    }

    fn config(symbols: &[&str]) -> AppConfig {
        AppConfig {
            symbols: symbols.iter().map(|s| s.to_string()).collect(),
            request_delay_ms: 0,
            flow_net_column: 2,
            ..AppConfig::default()
        }
    }

    fn flow_rows() -> Vec<Vec<Value>> {
        vec![
            vec![json!("2330"), json!("台積電"), json!("5,432,100")],
            vec![json!("2317"), json!("鴻海"), json!("-1,250")],
            vec![json!("2454"), json!("聯發科"), json!("")],
        ]
    }

    fn prices(entries: Vec<(&str, Vec<Bar>)>) -> FakePrices {
        FakePrices {
            series: entries.into_iter().map(|(s, b)| (s.to_string(), b)).collect(),
            calls: AtomicUsize::new(0),
        }
    }

    #[tokio::test]
    async fn one_empty_series_leaves_four_records() {
        let symbols = ["2330.TW", "2317.TW", "2454.TW", "0050.TW", "2603.TW"];
        let prices = prices(vec![
            ("2330.TW", trending(40, 500.0, 2.0)),
            ("2317.TW", trending(40, 200.0, -1.0)),
            ("2454.TW", Vec::new()),
            ("0050.TW", trending(10, 150.0, 0.5)),
            ("2603.TW", trending(30, 180.0, 0.25)),
        ]);
        let names = FakeNames { calls: AtomicUsize::new(0) };
        let flows = FakeFlows { rows: Some(flow_rows()) };
        let sources = Sources { prices: &prices, names: &names, flows: &flows };

        let report = run_batch(&config(&symbols), &sources, run_date()).await;
        let snapshot = report.snapshot();

        assert_eq!(snapshot.len(), 4);
        assert_eq!(
            snapshot.keys().collect::<Vec<_>>(),
            vec!["2330", "2317", "0050", "2603"]
        );
        let failures: Vec<_> = report.failures().collect();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0, "2454.TW");
        assert!(matches!(failures[0].1, SymbolFailure::EmptyHistory));

        let tsmc = &snapshot["2330"];
        assert_eq!(tsmc.name, "台積電");
        assert_eq!(tsmc.price, 578.0);
        assert_eq!(tsmc.regime, Regime::BullishMaCross);
        assert_eq!(tsmc.institutional_net_flow, NetFlow::Lots(5432.1));
        assert_eq!(tsmc.date, run_date());

        assert_eq!(snapshot["2317"].regime, Regime::BearishMaCross);
        assert_eq!(snapshot["2317"].institutional_net_flow, NetFlow::Lots(-1.25));

        let etf = &snapshot["0050"];
        assert_eq!(etf.patterns, vec![Pattern::InsufficientData]);
        assert_eq!(etf.name, UNAVAILABLE);
        assert_eq!(etf.institutional_net_flow, NetFlow::Unavailable);
    }

    #[tokio::test]
    async fn failed_flow_fetch_marks_every_record_unavailable() {
        let prices = prices(vec![
            ("2330.TW", trending(30, 500.0, 1.0)),
            ("2317.TW", trending(30, 100.0, 1.0)),
        ]);
        let names = FakeNames { calls: AtomicUsize::new(0) };
        let flows = FakeFlows { rows: None };
        let sources = Sources { prices: &prices, names: &names, flows: &flows };

        let dir = tempfile::tempdir().unwrap();
        let storage = AsyncStorageManager::new_at(dir.path()).await.unwrap();
        let config = config(&["2330.TW", "2317.TW"]);

        let output = run_analysis_pipeline(&config, &sources, &storage, run_date())
            .await
            .unwrap();
        assert_eq!(output.report.classified_count(), 2);

        let written = read_snapshot(&storage, &config.snapshot_name).await.unwrap();
        assert_eq!(written.len(), 2);
        assert_eq!(written, output.snapshot);
        assert!(written
            .values()
            .all(|r| r.institutional_net_flow == NetFlow::Unavailable));
    }

    #[tokio::test]
    async fn zero_successes_still_overwrite_the_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let storage = AsyncStorageManager::new_at(dir.path()).await.unwrap();
        let config = config(&["2330.TW", "9999.TWO"]);

        let names = FakeNames { calls: AtomicUsize::new(0) };
        let flows = FakeFlows { rows: Some(flow_rows()) };

        let good = prices(vec![("2330.TW", trending(25, 500.0, 1.0))]);
        let sources = Sources { prices: &good, names: &names, flows: &flows };
        run_analysis_pipeline(&config, &sources, &storage, run_date()).await.unwrap();

        let broken = prices(Vec::new());
        let sources = Sources { prices: &broken, names: &names, flows: &flows };
        let output = run_analysis_pipeline(&config, &sources, &storage, run_date())
            .await
            .unwrap();

        assert_eq!(output.report.failures().count(), 2);
        assert!(output.snapshot.is_empty());
        assert_eq!(broken.calls.load(Ordering::SeqCst), 2);
        let written = read_snapshot(&storage, &config.snapshot_name).await.unwrap();
        assert!(written.is_empty());
    }

    #[tokio::test]
    async fn malformed_series_fails_only_that_symbol() {
        let mut out_of_order = trending(25, 100.0, 1.0);
        out_of_order.swap(3, 4);
        let prices = prices(vec![
            ("2330.TW", out_of_order),
            ("2317.TW", trending(25, 100.0, 1.0)),
        ]);
        let names = FakeNames { calls: AtomicUsize::new(0) };
        let flows = FakeFlows { rows: Some(flow_rows()) };
        let sources = Sources { prices: &prices, names: &names, flows: &flows };

        let report = run_batch(&config(&["2330.TW", "2317.TW"]), &sources, run_date()).await;

        let failures: Vec<_> = report.failures().collect();
        assert_eq!(failures.len(), 1);
        assert!(matches!(failures[0].1, SymbolFailure::MalformedSeries(_)));
        assert_eq!(report.snapshot().keys().collect::<Vec<_>>(), vec!["2317"]);
    }

    #[tokio::test]
    async fn repeated_symbol_is_looked_up_once() {
        let prices = prices(vec![("2330.TW", trending(25, 500.0, 1.0))]);
        let names = FakeNames { calls: AtomicUsize::new(0) };
        let flows = FakeFlows { rows: None };
        let sources = Sources { prices: &prices, names: &names, flows: &flows };

        let report = run_batch(&config(&["2330.TW", "2330.TW"]), &sources, run_date()).await;

        assert_eq!(report.classified_count(), 2);
        assert_eq!(names.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn zero_lot_scale_is_rejected_before_anything_is_written() {
        let prices = prices(vec![("2330.TW", trending(25, 500.0, 1.0))]);
        let names = FakeNames { calls: AtomicUsize::new(0) };
        let flows = FakeFlows {
            rows: Some(vec![vec![json!("2330"), json!("台積電"), json!("1,000")]]),
        };
        let sources = Sources { prices: &prices, names: &names, flows: &flows };

        let dir = tempfile::tempdir().unwrap();
        let storage = AsyncStorageManager::new_at(dir.path()).await.unwrap();
        let config = AppConfig {
            shares_per_lot: 0.0,
            ..config(&["2330.TW"])
        };

        let err = run_analysis_pipeline(&config, &sources, &storage, run_date())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("shares_per_lot"));
        assert!(!storage.path_for(&config.snapshot_name).exists());
        assert_eq!(prices.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn delay_follows_every_fetch_with_bars_except_the_last() {
        let mut out_of_order = trending(25, 100.0, 1.0);
        out_of_order.swap(3, 4);
        // fetched ok, fetched but malformed, fetch error, empty, fetched ok (last)
        let prices = prices(vec![
            ("2330.TW", trending(25, 500.0, 1.0)),
            ("2317.TW", out_of_order),
            ("2603.TW", Vec::new()),
            ("0050.TW", trending(25, 150.0, 0.5)),
        ]);
        let names = FakeNames { calls: AtomicUsize::new(0) };
        let flows = FakeFlows { rows: None };
        let sources = Sources { prices: &prices, names: &names, flows: &flows };
        let config = AppConfig {
            request_delay_ms: 1000,
            ..config(&["2330.TW", "2317.TW", "9999.TWO", "2603.TW", "0050.TW"])
        };

        let started = tokio::time::Instant::now();
        let report = run_batch(&config, &sources, run_date()).await;
        let elapsed = started.elapsed();

        assert_eq!(report.classified_count(), 2);
        assert_eq!(report.failures().count(), 3);
        assert!(elapsed >= Duration::from_millis(2000), "elapsed {:?}", elapsed);
        assert!(elapsed < Duration::from_millis(3000), "elapsed {:?}", elapsed);
    }

    #[tokio::test(start_paused = true)]
    async fn single_symbol_run_does_not_wait() {
        let prices = prices(vec![("2330.TW", trending(25, 500.0, 1.0))]);
        let names = FakeNames { calls: AtomicUsize::new(0) };
        let flows = FakeFlows { rows: None };
        let sources = Sources { prices: &prices, names: &names, flows: &flows };
        let config = AppConfig {
            request_delay_ms: 1000,
            ..config(&["2330.TW"])
        };

        let started = tokio::time::Instant::now();
        run_batch(&config, &sources, run_date()).await;
        assert!(started.elapsed() < Duration::from_millis(1000));
    }

    #[test]
    fn exchange_suffix_is_stripped() {
        assert_eq!(clean_symbol("2330.TW"), "2330");
        assert_eq!(clean_symbol("6488.TWO"), "6488");
        assert_eq!(clean_symbol("AAPL"), "AAPL");
    }
}
