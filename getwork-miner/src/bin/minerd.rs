//! Main entry point for the getwork-miner daemon.

use anyhow::Context;
use getwork_miner::{config::Config, daemon::Daemon, tracing};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing::init_journald_or_stdout();

    let config = Config::load().context("loading configuration")?;
    let daemon = Daemon::new(config);
    daemon.run().await
}
