//! Queue broker binary
//!
//! Holds the ordered pending-task list for distributed workers. Seeded
//! at startup from whatever the store still reports as pending, so a
//! broker restart loses nothing.

use fifo_queue::Broker;
use ledger_system::{Config, MemoryStorage, OperationStatus, Storage};
use std::error::Error;
use std::sync::Arc;
use tokio::sync::watch;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let config = Config::from_env()?;
    tracing::info!(listen = %config.broker.listen_addr, "Starting ledger queue broker");

    // Re-seed the queue from the store's pending operations.
    let storage = Arc::new(MemoryStorage::new());
    let pending = storage
        .get_operations_by_status(&[OperationStatus::Init, OperationStatus::Processing])
        .await?;
    let seed: Vec<String> = pending.iter().map(|op| op.id.to_string()).collect();
    if !seed.is_empty() {
        tracing::info!(count = seed.len(), "Seeding queue with pending operations");
    }

    let broker = Broker::bind(&config.broker.listen_addr, seed).await?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let run = tokio::spawn(async move { broker.run(shutdown_rx).await });

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down broker");
    let _ = shutdown_tx.send(true);
    run.await??;
    Ok(())
}
