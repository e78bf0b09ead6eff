use anyhow::{Context, Result};

use gateway_relay::config::Config;
use gateway_relay::{logging, run};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load().context("failed to load configuration from environment")?;
    let _logging_guard = logging::init_tracing(&config.logging).context("failed to initialize logging")?;

    run::run(config).await
}
