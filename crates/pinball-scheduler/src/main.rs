use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use pinball_core::{telemetry, ScheduleData};
use pinball_proto::MasterClient;
use pinball_scheduler::{GraphParser, Scheduler, SchedulerConfig};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    // Log filter comes from RUST_LOG or LOG_LEVEL (default: info)
    telemetry::init_tracing("pinball_scheduler", "pinball_scheduler=info");

    let master_addr = std::env::var("MASTER_ADDR").unwrap_or_else(|_| "127.0.0.1:9100".into());
    let workflows_path =
        std::env::var("PINBALL_WORKFLOWS").context("PINBALL_WORKFLOWS must point to a JSON workflow registry")?;

    let registry = std::fs::read_to_string(&workflows_path)
        .with_context(|| format!("failed to read {workflows_path}"))?;
    let parser = GraphParser::from_json(&registry).context("invalid workflow registry")?;
    info!(
        workflows = parser.workflows().count(),
        %master_addr,
        "pinball-scheduler starting"
    );

    let master = MasterClient::connect(&master_addr)
        .await
        .context("failed to connect to master")?;
    let mut scheduler = Scheduler::new(
        Arc::new(master),
        Arc::new(parser),
        SchedulerConfig::default(),
    );

    // Optional bootstrap: install schedule tokens that are not present yet.
    if let Ok(path) = std::env::var("PINBALL_SCHEDULES") {
        let json = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read {path}"))?;
        let schedules: Vec<ScheduleData> =
            serde_json::from_str(&json).context("invalid schedule list")?;
        scheduler
            .install_schedules(&schedules)
            .await
            .context("failed to install schedules")?;
    }

    tokio::select! {
        result = scheduler.run() => {
            result.context("scheduler loop failed")?;
        }
        _ = tokio::signal::ctrl_c() => {
            // Claimed schedules fall back into the pool at their lease end.
            info!("shutdown signal received");
        }
    }

    info!("scheduler shutdown complete");
    Ok(())
}
