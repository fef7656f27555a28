use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use freeq_bnc::config::BncConfig;
use freeq_bnc::relay::Relay;

#[tokio::main]
async fn main() -> Result<()> {
    let config = BncConfig::parse();

    // Use JSON logs in production (FREEQ_LOG_JSON=1), human-readable otherwise
    let json_logs = std::env::var("FREEQ_LOG_JSON").unwrap_or_default() == "1";
    let level = if config.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::from_default_env().add_directive(format!("freeq_bnc={level}").parse()?);
    if json_logs {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .init();
    }

    config.validate().context("invalid configuration")?;
    tracing::info!(
        server = config.upstream(),
        prefix = %config.prefix,
        "Starting bouncer on {}",
        config.listen_addr()
    );

    // Upstream loss ends the process; there is no reconnect.
    Relay::new(config).run().await.context("relay stopped")
}
