use crate::market_info::UNAVAILABLE;
use crate::patterns::{Pattern, Regime};
use crate::storage_utils::AsyncStorageManager;
use anyhow::{Context, Result};
use chrono::NaiveDate;
use indexmap::IndexMap;
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::path::PathBuf;

pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Institutional net flow in lots. Persisted as a number or the string "unavailable".
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum NetFlow {
    Lots(f64),
    Unavailable,
}

impl Serialize for NetFlow {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            NetFlow::Lots(v) => serializer.serialize_f64(*v),
            NetFlow::Unavailable => serializer.serialize_str(UNAVAILABLE),
        }
    }
}

struct NetFlowVisitor;

impl<'de> Visitor<'de> for NetFlowVisitor {
    type Value = NetFlow;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("a number or \"unavailable\"")
    }

    fn visit_f64<E>(self, v: f64) -> Result<Self::Value, E> {
        Ok(NetFlow::Lots(v))
    }

    fn visit_i64<E>(self, v: i64) -> Result<Self::Value, E> {
        Ok(NetFlow::Lots(v as f64))
    }

    fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E> {
        Ok(NetFlow::Lots(v as f64))
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        if v == UNAVAILABLE {
            Ok(NetFlow::Unavailable)
        } else {
            Err(E::invalid_value(de::Unexpected::Str(v), &self))
        }
    }
}

impl<'de> Deserialize<'de> for NetFlow {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(NetFlowVisitor)
    }
}

/// One symbol's entry in the snapshot document.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SymbolRecord {
    pub symbol: String,
    pub name: String,
    pub price: f64,
    pub patterns: Vec<Pattern>,
    pub regime: Regime,
    pub institutional_net_flow: NetFlow,
    /// Day of the run, not the last trading day in the data.
    pub date: NaiveDate,
}

/// Cleaned code -> record, in configured symbol order.
pub type Snapshot = IndexMap<String, SymbolRecord>;

/// Replaces the stored snapshot document. Errors here end the run.
pub async fn write_snapshot(storage: &AsyncStorageManager, name: &str, snapshot: &Snapshot) -> Result<PathBuf> {
    storage
        .save(name, snapshot)
        .await
        .with_context(|| format!("failed to write snapshot {}", storage.path_for(name).display()))
}

#[cfg(test)]
pub async fn read_snapshot(storage: &AsyncStorageManager, name: &str) -> Result<Snapshot> {
    storage
        .load(name)
        .await
        .with_context(|| format!("failed to read snapshot {}", storage.path_for(name).display()))
}
