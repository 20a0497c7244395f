//! Apply worker
//!
//! A worker is a poll loop over [`Storage::apply_first_pending`]. Any
//! number of workers may run against the same store; the transactional
//! claim in the storage layer makes concurrent workers safe, so adding
//! workers only changes throughput, never correctness.
//!
//! Completion is announced through a [`CompletionSink`], which is
//! either a local wait-map (in-process mode) or a `taskCompleted`
//! broker notification (distributed mode).

use crate::error::Result;
use crate::storage::{apply_validator, Storage};
use crate::types::OperationId;
use async_trait::async_trait;
use dashmap::DashMap;
use fifo_queue::{QueueClient, EVENT_TASK_COMPLETED};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Receives the id of every operation a worker settles
#[async_trait]
pub trait CompletionSink: Send + Sync {
    /// Called after an operation reaches a terminal status
    async fn operation_completed(&self, id: OperationId);
}

/// Sink that discards completions
pub struct NullSink;

#[async_trait]
impl CompletionSink for NullSink {
    async fn operation_completed(&self, _id: OperationId) {}
}

/// Sink resolving local one-shot waiters registered by submitters
pub struct WaiterSink {
    waiters: Arc<DashMap<OperationId, oneshot::Sender<OperationId>>>,
}

impl WaiterSink {
    /// Wrap a shared wait-map
    pub fn new(waiters: Arc<DashMap<OperationId, oneshot::Sender<OperationId>>>) -> Self {
        Self { waiters }
    }
}

#[async_trait]
impl CompletionSink for WaiterSink {
    async fn operation_completed(&self, id: OperationId) {
        if let Some((_, waiter)) = self.waiters.remove(&id) {
            // The submitter may have stopped waiting; that is fine.
            let _ = waiter.send(id);
        }
    }
}

/// Sink announcing `taskCompleted` to every broker subscriber
pub struct NotifySink {
    client: QueueClient,
}

impl NotifySink {
    /// Wrap a connected queue client
    pub fn new(client: QueueClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl CompletionSink for NotifySink {
    async fn operation_completed(&self, id: OperationId) {
        if let Err(error) = self
            .client
            .notify(EVENT_TASK_COMPLETED, Value::String(id.to_string()))
            .await
        {
            warn!(operation_id = %id, %error, "completion notification failed");
        }
    }
}

/// Poll-loop worker settling pending operations one at a time
pub struct OperationWorker {
    storage: Arc<dyn Storage>,
    sink: Arc<dyn CompletionSink>,
    poll_interval: Duration,
}

impl OperationWorker {
    /// Create a worker over a store and completion sink
    pub fn new(
        storage: Arc<dyn Storage>,
        sink: Arc<dyn CompletionSink>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            storage,
            sink,
            poll_interval,
        }
    }

    /// Run until `shutdown` flips to true
    ///
    /// After settling an operation the loop polls again immediately, so
    /// a backlog drains at full speed; the interval only paces the
    /// empty-queue case.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        loop {
            if *shutdown.borrow() {
                debug!("worker stopping");
                return Ok(());
            }

            match self.storage.apply_first_pending(apply_validator()).await {
                Ok(Some(id)) => {
                    self.sink.operation_completed(id).await;
                    continue;
                }
                Ok(None) => {}
                Err(error) => warn!(%error, "apply poll failed"),
            }

            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = shutdown.changed() => {}
            }
        }
    }

    /// Spawn [`Self::run`] on the runtime
    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<Result<()>> {
        tokio::spawn(async move { self.run(shutdown).await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use crate::types::{
        AssetId, BookId, BookRequest, EntryRequest, OperationRequest, OperationStatus,
        OperationType,
    };
    use rust_decimal::Decimal;

    async fn seeded_storage(operations: u32) -> (Arc<MemoryStorage>, Vec<crate::types::Operation>) {
        let storage = Arc::new(MemoryStorage::new());
        let a = storage
            .insert_book(BookRequest {
                name: "a".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        let b = storage
            .insert_book(BookRequest {
                name: "b".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();

        let mut ops = Vec::new();
        for i in 0..operations {
            let op = storage
                .insert_operation(OperationRequest {
                    kind: OperationType::Transfer,
                    memo: format!("op {}", i),
                    entries: vec![
                        entry(&a.id, -1),
                        entry(&b.id, 1),
                    ],
                    metadata: None,
                })
                .await
                .unwrap();
            ops.push(op);
        }
        (storage, ops)
    }

    fn entry(book: &BookId, value: i64) -> EntryRequest {
        EntryRequest {
            book_id: book.clone(),
            asset_id: AssetId::new("USD"),
            value: Decimal::from(value),
            metadata: None,
        }
    }

    #[tokio::test]
    async fn test_worker_drains_backlog_and_signals_waiters() {
        let (storage, ops) = seeded_storage(3).await;
        let waiters = Arc::new(DashMap::new());

        let mut receivers = Vec::new();
        for op in &ops {
            let (tx, rx) = oneshot::channel();
            waiters.insert(op.id, tx);
            receivers.push(rx);
        }

        let worker = OperationWorker::new(
            storage.clone(),
            Arc::new(WaiterSink::new(waiters)),
            Duration::from_millis(1),
        );
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = worker.spawn(shutdown_rx);

        for (rx, op) in receivers.into_iter().zip(&ops) {
            assert_eq!(rx.await.unwrap(), op.id);
        }
        for op in &ops {
            let settled = storage.get_operation(op.id).await.unwrap().unwrap();
            assert_eq!(settled.status, OperationStatus::Applied);
        }

        let _ = shutdown_tx.send(true);
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_workers_settle_each_operation_once() {
        let (storage, ops) = seeded_storage(20).await;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut handles = Vec::new();
        for _ in 0..4 {
            let worker = OperationWorker::new(
                storage.clone(),
                Arc::new(NullSink),
                Duration::from_millis(1),
            );
            handles.push(worker.spawn(shutdown_rx.clone()));
        }

        // Wait until everything is terminal.
        loop {
            let pending = storage
                .get_operations_by_status(&[OperationStatus::Init, OperationStatus::Processing])
                .await
                .unwrap();
            if pending.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }

        let _ = shutdown_tx.send(true);
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        // Exactly one pair of entries per operation, no duplicates.
        assert_eq!(storage.entry_count(), ops.len() * 2);
    }
}
