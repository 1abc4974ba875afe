use crate::error::{ProviderError, SymbolFailure};
use crate::storage_utils::HistoryConfig;
use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, NaiveDate};
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;

const CHART_URL: &str = "https://query1.finance.yahoo.com/v8/finance/chart";
// Yahoo rejects requests without a browser-looking agent.
const USER_AGENT: &str = "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0 Safari/537.36";
const TAIPEI_UTC_OFFSET_SECS: i32 = 8 * 3600;

/// One trading day.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bar {
    pub date: NaiveDate,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
}

impl ta::High for Bar {
    fn high(&self) -> f64 {
        self.high
    }
}

impl ta::Low for Bar {
    fn low(&self) -> f64 {
        self.low
    }
}

/// Source of daily bars for one symbol over a trailing window.
#[async_trait]
pub trait PriceHistorySource: Send + Sync {
    async fn fetch_history(
        &self,
        symbol: &str,
        history: &HistoryConfig,
    ) -> Result<Vec<Bar>, ProviderError>;
}

/// Shared HTTP client for every upstream we talk to.
pub fn build_http_client() -> reqwest::Result<Client> {
    Client::builder()
        .user_agent(USER_AGENT)
        .timeout(Duration::from_secs(30))
        .build()
}

/// Rejects series that violate the Bar invariants: finite, non-negative
/// prices and strictly increasing dates.
pub fn validate_series(series: &[Bar]) -> Result<(), SymbolFailure> {
    for bar in series {
        let prices = [bar.open, bar.high, bar.low, bar.close];
        if prices.iter().any(|p| !p.is_finite() || *p < 0.0) {
            return Err(SymbolFailure::MalformedSeries(format!(
                "invalid price on {}",
                bar.date
            )));
        }
    }

    if let Some(pair) = series.windows(2).find(|w| w[0].date >= w[1].date) {
        return Err(SymbolFailure::MalformedSeries(format!(
            "dates out of order: {} then {}",
            pair[0].date, pair[1].date
        )));
    }

    Ok(())
}

// --- Yahoo chart API ---

#[derive(Deserialize, Debug)]
struct ChartResponse {
    chart: Chart,
}

#[derive(Deserialize, Debug)]
struct Chart {
    result: Option<Vec<ChartResult>>,
    error: Option<ChartError>,
}

#[derive(Deserialize, Debug)]
struct ChartError {
    code: String,
    description: String,
}

#[derive(Deserialize, Debug)]
struct ChartResult {
    meta: Option<ChartMeta>,
    #[serde(default)]
    timestamp: Vec<i64>,
    indicators: ChartIndicators,
}

#[derive(Deserialize, Debug)]
struct ChartMeta {
    gmtoffset: Option<i32>,
}

#[derive(Deserialize, Debug)]
struct ChartIndicators {
    #[serde(default)]
    quote: Vec<Quote>,
}

#[derive(Deserialize, Debug)]
struct Quote {
    #[serde(default)]
    open: Vec<Option<f64>>,
    #[serde(default)]
    high: Vec<Option<f64>>,
    #[serde(default)]
    low: Vec<Option<f64>>,
    #[serde(default)]
    close: Vec<Option<f64>>,
}

fn bars_from_chart(response: ChartResponse) -> Result<Vec<Bar>, ProviderError> {
    if let Some(err) = response.chart.error {
        return Err(ProviderError::Malformed(format!(
            "{}: {}",
            err.code, err.description
        )));
    }

    let Some(result) = response.chart.result.and_then(|r| r.into_iter().next()) else {
        return Err(ProviderError::Empty);
    };
    let Some(quote) = result.indicators.quote.into_iter().next() else {
        return Ok(Vec::new());
    };

    let offset_secs = result
        .meta
        .and_then(|m| m.gmtoffset)
        .unwrap_or(TAIPEI_UTC_OFFSET_SECS);
    let offset = FixedOffset::east_opt(offset_secs)
        .ok_or_else(|| ProviderError::Malformed(format!("bad gmtoffset {}", offset_secs)))?;

    let mut bars: Vec<Bar> = Vec::with_capacity(result.timestamp.len());
    for (i, ts) in result.timestamp.iter().enumerate() {
        let field = |col: &[Option<f64>]| col.get(i).copied().flatten();
        // Halted days and the in-progress session come back as nulls.
        let (Some(open), Some(high), Some(low), Some(close)) = (
            field(&quote.open),
            field(&quote.high),
            field(&quote.low),
            field(&quote.close),
        ) else {
            continue;
        };
        let Some(utc) = DateTime::from_timestamp(*ts, 0) else {
            continue;
        };

        let bar = Bar {
            date: utc.with_timezone(&offset).date_naive(),
            open,
            high,
            low,
            close,
        };

        // The live session can be reported as an extra bar on the same date.
        match bars.last_mut() {
            Some(last) if last.date == bar.date => *last = bar,
            _ => bars.push(bar),
        }
    }

    Ok(bars)
}

pub struct YahooChartClient {
    client: Client,
}

impl YahooChartClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl PriceHistorySource for YahooChartClient {
    async fn fetch_history(
        &self,
        symbol: &str,
        history: &HistoryConfig,
    ) -> Result<Vec<Bar>, ProviderError> {
        let url = format!("{}/{}", CHART_URL, symbol);
        let response = self
            .client
            .get(url)
            .query(&[
                ("range", history.range.as_str()),
                ("interval", history.interval.as_str()),
            ])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(ProviderError::Status(status.as_u16()));
        }

        let chart: ChartResponse = response.json().await?;
        bars_from_chart(chart)
    }
}
