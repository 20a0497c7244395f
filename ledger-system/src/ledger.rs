//! Ledger facade
//!
//! [`LedgerSystem`] ties the pieces together: storage, validation, the
//! scheduling queue and completion signalling. Submitters only ever
//! talk to this type.
//!
//! Scheduling has two modes. Without a broker connection, posted
//! operations are queued on the in-process [`FifoQueue`] and settled by
//! its drain loop. With [`LedgerSystem::connect_queue`], posting
//! submits the operation id to the broker instead and settlement
//! happens wherever a worker picks it up; completion comes back as a
//! `taskCompleted` notification.

use crate::config::Config;
use crate::error::{Error, Result};
use crate::queue::FifoQueue;
use crate::storage::{apply_validator, Storage};
use crate::types::{
    Balances, Book, BookId, BookRequest, JsonMap, Operation, OperationId, OperationRequest,
    OperationStatus, PostingEntry, TransferRequest,
};
use dashmap::DashMap;
use futures::future::BoxFuture;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tracing::{debug, info};

/// A book together with its derived balances
#[derive(Debug, Clone, serde::Serialize)]
pub struct BookView {
    /// The book record
    #[serde(flatten)]
    pub book: Book,

    /// Net entry sums per asset
    pub balances: Balances,
}

/// The ledger engine facade
pub struct LedgerSystem {
    storage: Arc<dyn Storage>,
    config: Config,
    queue: FifoQueue,
    waiters: Arc<DashMap<OperationId, oneshot::Sender<OperationId>>>,
    queue_client: Option<fifo_queue::QueueClient>,
    shutdown: watch::Sender<bool>,
}

impl LedgerSystem {
    /// Start the engine over a store
    ///
    /// Creates the default book if missing, re-offers every operation
    /// still pending in the store to the in-process queue (oldest
    /// first), and starts the drain loop.
    pub async fn new(storage: Arc<dyn Storage>, config: Config) -> Result<Self> {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let system = Self {
            storage,
            config,
            queue: FifoQueue::new(),
            waiters: Arc::new(DashMap::new()),
            queue_client: None,
            shutdown,
        };

        if system
            .storage
            .get_book(&BookId::default_book())
            .await?
            .is_none()
        {
            let book = system
                .storage
                .insert_book(BookRequest {
                    name: system.config.default_book_name.clone(),
                    ..Default::default()
                })
                .await?;
            info!(book_id = %book.id, "default book created");
        }

        // The operation table is the durable queue: whatever is still
        // pending after a restart gets re-offered, oldest first.
        let pending = system
            .storage
            .get_operations_by_status(&[OperationStatus::Init, OperationStatus::Processing])
            .await?;
        if !pending.is_empty() {
            info!(count = pending.len(), "re-offering pending operations");
            for _ in &pending {
                system.enqueue_apply();
            }
        }

        system
            .queue
            .start(system.config.local_poll_interval(), shutdown_rx);
        Ok(system)
    }

    /// Switch scheduling to a broker connection
    ///
    /// From here on, posted operations are submitted to the broker and
    /// settled by whichever worker drains it; the in-process queue is
    /// no longer fed.
    pub fn connect_queue(&mut self, client: fifo_queue::QueueClient) {
        self.queue_client = Some(client);
    }

    /// The underlying store
    pub fn storage(&self) -> Arc<dyn Storage> {
        Arc::clone(&self.storage)
    }

    /// Create a book
    pub async fn create_book(&self, request: BookRequest) -> Result<Book> {
        self.storage.insert_book(request).await
    }

    /// Fetch a book with its current balances
    pub async fn get_book(&self, id: &BookId) -> Result<BookView> {
        let book = self.require_book(id).await?;
        let balances = self.derive_balances(id, None).await?;
        Ok(BookView { book, balances })
    }

    /// Balances of a book, optionally restricted to entries matching a
    /// metadata filter
    ///
    /// Balances are derived by summing posting entries; nothing is
    /// cached, so they always reflect exactly the applied operations.
    pub async fn get_book_balances(
        &self,
        id: &BookId,
        metadata_filter: Option<&JsonMap>,
    ) -> Result<Balances> {
        // Existence check first so an unknown book is an error, not an
        // empty balance map.
        self.require_book(id).await?;
        self.derive_balances(id, metadata_filter).await
    }

    /// Posting entries of a book
    pub async fn get_book_entries(
        &self,
        id: &BookId,
        metadata_filter: Option<&JsonMap>,
    ) -> Result<Vec<PostingEntry>> {
        self.require_book(id).await?;
        self.storage.get_book_entries(id, metadata_filter).await
    }

    async fn require_book(&self, id: &BookId) -> Result<Book> {
        self.storage
            .get_book(id)
            .await?
            .ok_or_else(|| Error::BookNotFound(id.clone()))
    }

    async fn derive_balances(
        &self,
        id: &BookId,
        metadata_filter: Option<&JsonMap>,
    ) -> Result<Balances> {
        let entries = self.storage.get_book_entries(id, metadata_filter).await?;
        let mut balances = Balances::new();
        for entry in entries {
            *balances.entry(entry.asset_id).or_default() += entry.value;
        }
        Ok(balances)
    }

    /// Operations that touched a book, ascending by id
    ///
    /// Resolved through the book's posting entries, so only applied
    /// operations appear. The filter matches against operation
    /// metadata, any declared key.
    pub async fn get_book_operations(
        &self,
        id: &BookId,
        metadata_filter: Option<&JsonMap>,
    ) -> Result<Vec<Operation>> {
        let entries = self.get_book_entries(id, None).await?;
        let mut ids: Vec<OperationId> = entries.iter().map(|e| e.operation_id).collect();
        ids.sort_unstable();
        ids.dedup();

        let operations = self.storage.get_operations_by_ids(&ids).await?;
        Ok(operations
            .into_iter()
            .filter(|op| match metadata_filter {
                None => true,
                Some(filter) if filter.is_empty() => true,
                Some(filter) => op.metadata.as_ref().is_some_and(|meta| {
                    filter.iter().any(|(key, expected)| meta.get(key) == Some(expected))
                }),
            })
            .collect())
    }

    /// Fetch an operation
    pub async fn get_operation(&self, id: OperationId) -> Result<Operation> {
        self.storage
            .get_operation(id)
            .await?
            .ok_or(Error::OperationNotFound(id))
    }

    /// Post an operation
    ///
    /// Records it as `INIT` and schedules it. With `sync` the call
    /// parks until the operation reaches a terminal status and returns
    /// it settled; otherwise it returns immediately with the `INIT`
    /// snapshot. A rejection is reported through the returned
    /// operation's status, never as an `Err`.
    pub async fn post_operation(&self, request: OperationRequest, sync: bool) -> Result<Operation> {
        let operation = self.storage.insert_operation(request).await?;
        debug!(operation_id = %operation.id, sync, "operation posted");

        match &self.queue_client {
            Some(client) => {
                // Subscribe before submitting so the completion cannot
                // race past us.
                let completion = sync.then(|| client.subscribe_completion(&operation.id.to_string()));
                client.submit_task(&operation.id.to_string()).await?;
                if let Some(completion) = completion {
                    completion.await.map_err(|_| {
                        Error::Concurrency("completion notification channel closed".to_string())
                    })?;
                    return self.get_operation(operation.id).await;
                }
            }
            None => {
                let completion = sync.then(|| {
                    let (tx, rx) = oneshot::channel();
                    self.waiters.insert(operation.id, tx);
                    rx
                });
                self.enqueue_apply();
                if let Some(completion) = completion {
                    completion.await.map_err(|_| {
                        Error::Concurrency("apply queue stopped before completion".to_string())
                    })?;
                    return self.get_operation(operation.id).await;
                }
            }
        }
        Ok(operation)
    }

    /// Post a two-legged transfer
    pub async fn post_transfer(&self, request: TransferRequest, sync: bool) -> Result<Operation> {
        self.post_operation(request.into_operation_request(), sync)
            .await
    }

    /// Stop the drain loop
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Queue one settle pass
    ///
    /// The task settles the oldest pending operation, which is not
    /// necessarily the one that triggered the enqueue; with one task
    /// queued per posted operation the counts match and the store's id
    /// order decides who goes first.
    fn enqueue_apply(&self) {
        self.queue.enqueue(settle_task(
            Arc::clone(&self.storage),
            Arc::clone(&self.waiters),
            self.queue.clone(),
            self.config.local_poll_interval(),
        ));
    }
}

/// One settle pass, re-queueing itself if the pass came back empty
/// while work is still pending
///
/// An empty pass with pending operations means the apply transaction
/// lost its lock to a concurrent reader. Leaving it at that would
/// strand the operation in `INIT` with no one left to retry, hanging
/// any sync submitter parked on it.
fn settle_task(
    storage: Arc<dyn Storage>,
    waiters: Arc<DashMap<OperationId, oneshot::Sender<OperationId>>>,
    queue: FifoQueue,
    retry_delay: Duration,
) -> BoxFuture<'static, crate::error::Result<()>> {
    Box::pin(async move {
        match storage.apply_first_pending(apply_validator()).await? {
            Some(id) => {
                if let Some((_, waiter)) = waiters.remove(&id) {
                    let _ = waiter.send(id);
                }
            }
            None => {
                let pending = storage
                    .get_operations_by_status(&[
                        OperationStatus::Init,
                        OperationStatus::Processing,
                    ])
                    .await?;
                if !pending.is_empty() {
                    debug!(pending = pending.len(), "settle pass contended, retrying");
                    tokio::time::sleep(retry_delay).await;
                    queue.enqueue(settle_task(storage, waiters, queue.clone(), retry_delay));
                }
            }
        }
        Ok(())
    })
}

impl Drop for LedgerSystem {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}
