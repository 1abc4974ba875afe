use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::path::{Path, PathBuf};
use tokio::fs;

// CONFIGURATION STRUCTS
// storage/config.json deserializes straight into these types.

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct HistoryConfig {
    pub range: String,    // trailing window, e.g. "6mo"
    pub interval: String, // bar size, e.g. "1d"
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            range: "6mo".to_string(),
            interval: "1d".to_string(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    /// Exchange-qualified codes, processed in this order: `.TW` listed, `.TWO` over-the-counter.
    pub symbols: Vec<String>,
    pub history: HistoryConfig,
    /// Pause after every successful price fetch so the upstream does not throttle us.
    pub request_delay_ms: u64,
    /// Net flow arrives in shares; dividing by this gives lots.
    pub shares_per_lot: f64,
    /// Position of the total net-quantity column in the institutional flow table.
    pub flow_net_column: usize,
    /// File stem of the snapshot document inside the storage directory.
    pub snapshot_name: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            symbols: ["2330.TW", "2317.TW", "2454.TW", "0050.TW", "2603.TW"]
                .into_iter()
                .map(String::from)
                .collect(),
            history: HistoryConfig::default(),
            request_delay_ms: 1500,
            shares_per_lot: 1000.0,
            flow_net_column: 18,
            snapshot_name: "stock_data".to_string(),
        }
    }
}

impl AppConfig {
    /// Rejects settings that would corrupt the snapshot instead of failing loudly.
    pub fn validate(&self) -> anyhow::Result<()> {
        if !self.shares_per_lot.is_finite() || self.shares_per_lot <= 0.0 {
            anyhow::bail!(
                "shares_per_lot must be a positive number, got {}",
                self.shares_per_lot
            );
        }
        if self.snapshot_name.trim().is_empty() {
            anyhow::bail!("snapshot_name must not be empty");
        }
        Ok(())
    }
}

// STORAGE MANAGER

pub struct AsyncStorageManager {
    // Absolute path of the storage directory (e.g. ".../target/debug/storage")
    pub base_dir: PathBuf,
}

impl AsyncStorageManager {
    /// **Constructor: new_relative**
    /// Resolves the storage directory relative to the running executable.
    pub async fn new_relative<P: AsRef<Path>>(relative_path: P) -> anyhow::Result<Self> {
        let exe_path = std::env::current_exe()?;

        let base_dir = exe_path
            .parent()
            .ok_or_else(|| anyhow::anyhow!("Could not find binary directory"))?
            .join(relative_path);

        Self::new_at(base_dir).await
    }

    /// **Constructor: new_at**
    /// Uses `base_dir` as-is. The directory is created up front so `save`
    /// never has to check for it.
    pub async fn new_at<P: Into<PathBuf>>(base_dir: P) -> anyhow::Result<Self> {
        let base_dir = base_dir.into();
        if !base_dir.exists() {
            fs::create_dir_all(&base_dir).await?;
        }
        Ok(Self { base_dir })
    }

    /// Full path of the JSON document stored under `filename`.
    pub fn path_for(&self, filename: &str) -> PathBuf {
        self.base_dir.join(format!("{}.json", filename))
    }

    /// **Generic Save Function**
    /// Serializes `data` as pretty JSON and replaces `<filename>.json`.
    /// The bytes go to a `.tmp` sibling first and are renamed into place, so a
    /// crash mid-write leaves the previous document intact.
    pub async fn save<T: Serialize>(&self, filename: &str, data: &T) -> anyhow::Result<PathBuf> {
        let final_path = self.path_for(filename);
        let tmp_path = self.base_dir.join(format!("{}.json.tmp", filename));

        let json_bytes = serde_json::to_vec_pretty(data)?;

        fs::write(&tmp_path, json_bytes).await?;
        fs::rename(&tmp_path, &final_path).await?;

        Ok(final_path)
    }

    /// **Generic Load Function**
    /// Reads `<filename>.json` and deserializes it into `T`.
    pub async fn load<T: DeserializeOwned>(&self, filename: &str) -> anyhow::Result<T> {
        // serde_json validates UTF-8 while parsing, so read raw bytes.
        let content = fs::read(self.path_for(filename)).await?;
        let data = serde_json::from_slice(&content)?;
        Ok(data)
    }

    /// Loads `<filename>.json`, or writes `T::default()` there when the file is absent.
    pub async fn load_or_init<T>(&self, filename: &str) -> anyhow::Result<T>
    where
        T: DeserializeOwned + Serialize + Default,
    {
        if self.path_for(filename).exists() {
            return self.load(filename).await;
        }

        let data = T::default();
        let path = self.save(filename, &data).await?;
        tracing::info!(path = %path.display(), "no config found, wrote defaults");
        Ok(data)
    }
}
