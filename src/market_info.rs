//! Auxiliary per-symbol data: display names and institutional net flow.
//! Both degrade to "unavailable" instead of failing the symbol.

use crate::error::{ProviderError, RowError};
use crate::snapshot::round2;
use async_trait::async_trait;
use chrono::NaiveDate;
use regex::Regex;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::LazyLock;

pub const UNAVAILABLE: &str = "unavailable";

const TWSE_BASE_URL: &str = "https://www.twse.com.tw/rwd/zh";

// e.g. "115年10月 2330 台積電           各日成交資訊"
static REPORT_TITLE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*\d+年\d+月\s+(\S+)\s+(.+?)\s+各日成交資訊").expect("title pattern is valid")
});

/// Resolves a bare symbol code (no exchange suffix) to its display name.
#[async_trait]
pub trait NameLookup: Send + Sync {
    async fn lookup_name(&self, code: &str, date: NaiveDate) -> Result<String, ProviderError>;
}

/// Market-wide institutional trading table for one day, one row per security.
#[async_trait]
pub trait InstitutionalFlowSource: Send + Sync {
    async fn fetch_flow_rows(&self, date: NaiveDate) -> Result<Vec<Vec<Value>>, ProviderError>;
}

/// Run-scoped memo of display names. Failed lookups are remembered too,
/// so each code reaches the upstream at most once per run.
#[derive(Debug, Default)]
pub struct NameCache {
    names: HashMap<String, String>,
}

impl NameCache {
    pub async fn resolve(&mut self, lookup: &dyn NameLookup, code: &str, date: NaiveDate) -> String {
        if let Some(name) = self.names.get(code) {
            return name.clone();
        }

        let name = match lookup.lookup_name(code, date).await {
            Ok(name) => name,
            Err(e) => {
                tracing::warn!(code, error = %e, "name lookup failed");
                UNAVAILABLE.to_string()
            }
        };
        self.names.insert(code.to_string(), name.clone());
        name
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }
}

/// Net flow per code, in lots.
pub type NetFlowTable = HashMap<String, f64>;

/// One batched fetch for the whole run. Any failure yields an empty table.
pub async fn resolve_net_flows(
    source: &dyn InstitutionalFlowSource,
    date: NaiveDate,
    net_column: usize,
    shares_per_lot: f64,
) -> NetFlowTable {
    match source.fetch_flow_rows(date).await {
        Ok(rows) => {
            let table = parse_net_flows(&rows, net_column, shares_per_lot);
            tracing::info!(%date, rows = rows.len(), parsed = table.len(), "institutional flow loaded");
            table
        }
        Err(e) => {
            tracing::warn!(%date, error = %e, "institutional flow unavailable");
            NetFlowTable::new()
        }
    }
}

/// Extracts `code -> net lots` from raw table rows, skipping rows that do not parse.
pub fn parse_net_flows(rows: &[Vec<Value>], net_column: usize, shares_per_lot: f64) -> NetFlowTable {
    let mut table = NetFlowTable::with_capacity(rows.len());
    for (index, row) in rows.iter().enumerate() {
        match parse_row(row, net_column, shares_per_lot) {
            Ok((code, lots)) => {
                table.insert(code, lots);
            }
            Err(e) => tracing::debug!(index, error = %e, "skipping flow row"),
        }
    }
    table
}

fn parse_row(row: &[Value], net_column: usize, shares_per_lot: f64) -> Result<(String, f64), RowError> {
    let code = row
        .first()
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .ok_or(RowError::MissingColumn(0))?;
    let cell = row.get(net_column).ok_or(RowError::MissingColumn(net_column))?;

    let shares = parse_quantity(cell)?;
    let lots = shares / shares_per_lot;
    if !lots.is_finite() {
        return Err(RowError::BadNumber(format!("{} / {}", shares, shares_per_lot)));
    }
    Ok((code.to_string(), round2(lots)))
}

/// Accepts plain numbers and strings with thousands separators ("-1,234,000").
fn parse_quantity(cell: &Value) -> Result<f64, RowError> {
    let parsed = match cell {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().replace(',', "").parse::<f64>().ok(),
        _ => None,
    };

    parsed
        .filter(|v| v.is_finite())
        .ok_or_else(|| RowError::BadNumber(cell.to_string()))
}

fn name_from_title(title: &str, code: &str) -> Option<String> {
    let caps = REPORT_TITLE.captures(title)?;
    if &caps[1] != code {
        return None;
    }
    Some(caps[2].trim().to_string())
}

// --- TWSE endpoints ---

#[derive(Deserialize, Debug)]
struct TwseReport {
    stat: String,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    data: Vec<Vec<Value>>,
}

pub struct TwseClient {
    client: Client,
}

impl TwseClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn get_report(&self, path: &str, query: &[(&str, String)]) -> Result<TwseReport, ProviderError> {
        let url = format!("{}/{}", TWSE_BASE_URL, path);
        let response = self.client.get(url).query(query).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(ProviderError::Status(status.as_u16()));
        }

        let report: TwseReport = response.json().await?;
        // Holidays and not-yet-published days come back with a localized stat message.
        if report.stat != "OK" {
            return Err(ProviderError::Malformed(report.stat));
        }
        Ok(report)
    }
}

#[async_trait]
impl NameLookup for TwseClient {
    async fn lookup_name(&self, code: &str, date: NaiveDate) -> Result<String, ProviderError> {
        let query = [
            ("date", date.format("%Y%m%d").to_string()),
            ("stockNo", code.to_string()),
            ("response", "json".to_string()),
        ];
        let report = self.get_report("afterTrading/STOCK_DAY", &query).await?;

        let title = report
            .title
            .ok_or_else(|| ProviderError::Malformed("report has no title".to_string()))?;
        name_from_title(&title, code)
            .ok_or_else(|| ProviderError::Malformed(format!("unexpected title {:?}", title)))
    }
}

#[async_trait]
impl InstitutionalFlowSource for TwseClient {
    async fn fetch_flow_rows(&self, date: NaiveDate) -> Result<Vec<Vec<Value>>, ProviderError> {
        let query = [
            ("date", date.format("%Y%m%d").to_string()),
            ("selectType", "ALL".to_string()),
            ("response", "json".to_string()),
        ];
        let report = self.get_report("fund/T86", &query).await?;

        if report.data.is_empty() {
            return Err(ProviderError::Empty);
        }
        Ok(report.data)
    }
}
