//! Relay gateway - main entry point.

use anyhow::Result;
use relay_common::config::RelayConfig;
use relay_common::logging::init_logging;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = RelayConfig::load()?;

    // Initialize logging
    init_logging(
        &config.observability.log_level,
        &config.observability.log_format,
    );

    tracing::info!("Relay gateway v{}", env!("CARGO_PKG_VERSION"));

    // Start the gateway server
    relay_gateway::start_server(&config).await
}
