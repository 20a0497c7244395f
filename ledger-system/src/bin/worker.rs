//! Queue worker binary
//!
//! Connects to the broker, drains tasks and settles the corresponding
//! operations against the store, announcing `taskCompleted` after each
//! one.
//!
//! The in-memory store constructed here is a stand-in: it is private to
//! this process, so operations posted elsewhere are invisible to it. A
//! real deployment substitutes a `Storage` implementation backed by the
//! database the submitters write to.

use fifo_queue::{QueueClient, TaskProvider};
use ledger_system::storage::apply_validator;
use ledger_system::{Config, MemoryStorage, Storage};
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
    tracing::info!(broker = %config.broker.url, "Starting ledger worker");

    let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
    let client = QueueClient::connect(&config.broker.url).await?;
    tracing::info!("Connected to broker");

    let provider_storage = Arc::clone(&storage);
    let provider: TaskProvider = Arc::new(move |task_id: String| {
        let storage = Arc::clone(&provider_storage);
        Box::pin(async move {
            tracing::debug!(%task_id, "Settling operation");
            storage.apply_first_pending(apply_validator()).await?;
            Ok(())
        })
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let drain = {
        let client = client.clone();
        let poll = config.worker_poll_interval();
        tokio::spawn(async move { client.clear_queue(provider, poll, shutdown_rx).await })
    };

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down worker");
    let _ = shutdown_tx.send(true);
    drain.await??;
    Ok(())
}
