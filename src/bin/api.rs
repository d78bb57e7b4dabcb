use capital_call_agent::{agent::Orchestrator, api::start_server, config::AppConfig};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load environment variables
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = AppConfig::from_env()?;

    info!("Capital Call Agent - API Server");
    info!(port = config.port, accounting = %config.accounting.base_url, "Configuration loaded");

    let orchestrator = Arc::new(Orchestrator::from_config(&config)?);
    info!(checkpoints = orchestrator.store().backend_name(), "Orchestrator initialized");

    start_server(orchestrator, config.port).await?;

    Ok(())
}
