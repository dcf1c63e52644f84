use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use pinball_core::telemetry;
use pinball_worker::{MasterClient, ShellExecutor, Worker, WorkerConfig};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    // Log filter comes from RUST_LOG or LOG_LEVEL (default: info)
    telemetry::init_tracing("pinball_worker", "pinball_worker=info");

    let master_addr = std::env::var("MASTER_ADDR").unwrap_or_else(|_| "127.0.0.1:9100".into());
    let config = WorkerConfig::from_env();

    info!(
        %master_addr,
        identity = %config.identity,
        generation = config.generation,
        "pinball-worker starting"
    );

    let master = MasterClient::connect(&master_addr)
        .await
        .context("failed to connect to master")?;
    let mut worker = Worker::new(Arc::new(master), Arc::new(ShellExecutor), config);

    tokio::select! {
        result = worker.run() => {
            result.context("worker loop failed")?;
        }
        _ = tokio::signal::ctrl_c() => {
            // Claims held by this worker are reclaimed by lease expiry.
            info!("shutdown signal received");
        }
    }

    info!("worker shutdown complete");
    Ok(())
}
