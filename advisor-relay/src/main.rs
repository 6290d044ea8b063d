//! Advisor Relay binary.

use advisor_common::config::Config;
use advisor_common::logging::init_logging;
use anyhow::Result;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load_with_env()?;

    init_logging(
        &config.observability.log_level,
        &config.observability.log_format,
    );

    tracing::info!("Advisor Relay v{}", env!("CARGO_PKG_VERSION"));

    if let Err(e) = advisor_relay::start_server(&config).await {
        tracing::error!(error = %e, "Advisor Relay failed to start");
        return Err(e);
    }

    Ok(())
}
