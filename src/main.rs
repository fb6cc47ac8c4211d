use anyhow::Context;
use config_manager::SystemConfig;
use job_orchestrator::PipelineOrchestrator;
use persistence_layer::JsonFileStore;
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,job_orchestrator=debug".into()),
        )
        .init();

    info!("Starting wallet price history run...");

    let config = SystemConfig::load().context("loading configuration")?;
    if config.system.debug_mode {
        info!("Configuration: {}", config.to_json_value());
    }

    let store = JsonFileStore::open(&config.system.data_dir)
        .await
        .with_context(|| format!("opening data directory {}", config.system.data_dir))?;
    info!("Using data directory: {}", store.dir().display());

    let orchestrator = PipelineOrchestrator::from_system_config(&config, Arc::new(store))?;

    let input = orchestrator.load_input().await?;
    let output = orchestrator.run_and_store(&input).await?;

    info!(
        "🏁 Run {} finished: {} wallet(s), {} signatures, {} transactions, {} enhanced, {} valid / {} null prices in {}ms",
        output.stats.run_id,
        output.stats.wallets,
        output.stats.signatures,
        output.stats.transactions,
        output.stats.enhanced,
        output.stats.valid_prices,
        output.stats.null_prices,
        output.stats.elapsed_ms
    );

    Ok(())
}
