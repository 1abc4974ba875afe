mod analysis;
mod error;
mod indicators;
mod market_info;
mod patterns;
mod price_history;
mod snapshot;
mod storage_utils;
mod summary_table;

use analysis::Sources;
use anyhow::Context;
use market_info::TwseClient;
use price_history::{YahooChartClient, build_http_client};
use storage_utils::{AppConfig, AsyncStorageManager};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tw_pattern_screener=info".into()),
        )
        .init();

    // Step 1: Load configuration
    let storage = AsyncStorageManager::new_relative("storage").await?;
    let config: AppConfig = storage.load_or_init("config").await?;
    config
        .validate()
        .with_context(|| format!("invalid {}", storage.path_for("config").display()))?;
    tracing::info!(symbols = config.symbols.len(), storage = %storage.base_dir.display(), "starting run");

    // Step 2: Classify every symbol and write the snapshot
    let client = build_http_client()?;
    let prices = YahooChartClient::new(client.clone());
    let twse = TwseClient::new(client);
    let sources = Sources {
        prices: &prices,
        names: &twse,
        flows: &twse,
    };

    let run_date = chrono::Local::now().date_naive();
    let output = analysis::run_analysis_pipeline(&config, &sources, &storage, run_date).await?;

    tracing::info!(
        classified = output.report.classified_count(),
        failed = output.report.failures().count(),
        total = config.symbols.len(),
        snapshot = %output.path.display(),
        "run complete"
    );

    // Step 3: Display results
    summary_table::print_summary(&output.snapshot);

    Ok(())
}
