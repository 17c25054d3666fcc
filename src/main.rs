use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use drover_core::observability::{self, LogFormat};
use drover_pool::{PoolManager, RunnerConfig};

#[derive(Parser)]
#[command(
    name = "droverd",
    version,
    about = "CI pipeline runner that executes build steps on warm pools of cloud VMs"
)]
struct Cli {
    /// Path to the runner configuration file.
    #[arg(long, default_value = "/etc/drover/config.toml")]
    config: PathBuf,
    /// Log output format: human or json.
    #[arg(long, default_value = "human")]
    log_format: String,
    /// Validate the configuration and exit.
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = RunnerConfig::load(&cli.config)?;
    if cli.check {
        println!(
            "config ok: runner {} with {} pool(s)",
            config.runner.name,
            config.pools.len()
        );
        return Ok(());
    }

    let format: LogFormat = cli
        .log_format
        .parse()
        .map_err(|e: String| anyhow::anyhow!(e))?;
    observability::init(format);

    let manager = Arc::new(PoolManager::new(
        config.runner.name.clone(),
        config.runner.version.clone(),
    )?);
    for entry in &config.pools {
        manager.register(entry.build()?).await?;
    }

    let cancel = CancellationToken::new();
    let built = manager.build_pools(&cancel).await;
    if !built.ok() {
        warn!(
            failures = built.failure_count(),
            "some pools missed min size at startup; repopulation will retry"
        );
    }
    for entry in &config.pools {
        if let Some(pool) = manager.get(&entry.name).await {
            info!(pool = %entry.name, counts = %pool.counts().await, "pool ready");
        }
    }

    info!(runner = %manager.runner_name(), "droverd running, ctrl-c to shut down");
    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;

    info!("shutting down, destroying all instances");
    let swept = manager.destroy_all(&cancel).await;
    if !swept.ok() {
        warn!(
            failures = swept.failure_count(),
            "teardown left instances behind, reaping"
        );
        let reaped = manager.reap_leaked(&cancel).await;
        if !reaped.ok() {
            warn!(
                failures = reaped.failure_count(),
                "reap incomplete; instances will be retried on the next run"
            );
        }
    }
    Ok(())
}
