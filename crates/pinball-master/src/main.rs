use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tonic::transport::Server;
use tracing::info;

use pinball_core::{telemetry, SystemClock};
use pinball_master::{Master, MasterConfig, MasterService, PostgresTokenStore};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    // Log filter comes from RUST_LOG or LOG_LEVEL (default: info)
    telemetry::init_tracing("pinball_master", "pinball_master=info");

    let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
    let bind_addr = std::env::var("MASTER_BIND_ADDR").unwrap_or_else(|_| "127.0.0.1:9100".into());
    let addr = bind_addr
        .parse()
        .with_context(|| format!("invalid MASTER_BIND_ADDR: {bind_addr}"))?;

    info!(%bind_addr, "pinball-master starting");

    let store = PostgresTokenStore::connect(&database_url)
        .await
        .context("failed to connect to the token database")?;
    store
        .ensure_schema()
        .await
        .context("failed to ensure the token schema")?;

    // The frontend starts serving immediately and answers a retryable
    // not-ready until the actor handle is published.
    let (state_tx, state_rx) = watch::channel(None);
    let service = MasterService::new(state_rx);

    let server = tokio::spawn(Server::builder().add_service(service.into_server()).serve_with_shutdown(
        addr,
        async {
            tokio::signal::ctrl_c().await.ok();
            info!("shutdown signal received, draining");
        },
    ));

    let master = Master::recover(Arc::new(store), Arc::new(SystemClock))
        .await
        .context("failed to recover master state")?;
    let (handle, actor) = master.spawn(MasterConfig::default());
    state_tx.send(Some(handle)).ok();
    info!("master serving");

    server.await.context("server task panicked")??;

    // Stop accepting, drop every handle, and let the actor finish any
    // in-flight batch before exiting.
    state_tx.send(None).ok();
    drop(state_tx);
    actor.await.context("master actor panicked")?;

    info!("master shutdown complete");
    Ok(())
}
