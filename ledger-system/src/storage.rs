//! Storage layer
//!
//! The [`Storage`] trait is the seam between the ledger engine and its
//! backing store. [`MemoryStorage`] is the in-process implementation;
//! all tables live under one mutex so that [`Storage::apply_first_pending`]
//! can read, validate and write as a single transaction.
//!
//! Id assignment is storage-owned: books, operations and entries all
//! draw from per-table monotonically increasing counters, so ascending
//! operation id is submission order.

use crate::error::{Error, Result, ValidationError};
use crate::types::{
    AssetId, Book, BookId, BookRequest, EntryRequest, JsonMap, NewPostingEntry, Operation,
    OperationId, OperationRequest, OperationStatus, PostingEntry,
};
use crate::validator;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Consistent read view handed to the validator during a transactional
/// apply
///
/// Lookups go through the same transaction that will write the
/// entries, so a concurrent apply can never interleave between the
/// balance check and the write.
pub trait TxView {
    /// Look up a book
    fn book(&self, id: &BookId) -> Option<Book>;

    /// Net entry sum for one book/asset pair
    fn balance(&self, book_id: &BookId, asset_id: &AssetId) -> Decimal;
}

/// Validation hook run inside the apply transaction
pub type ApplyValidator =
    Arc<dyn Fn(&[EntryRequest], &dyn TxView) -> std::result::Result<(), ValidationError> + Send + Sync>;

/// Storage backend for books, operations and posting entries
#[async_trait]
pub trait Storage: Send + Sync {
    /// Create a book, assigning its id
    async fn insert_book(&self, request: BookRequest) -> Result<Book>;

    /// Fetch a book by id
    async fn get_book(&self, id: &BookId) -> Result<Option<Book>>;

    /// Record a new operation in `INIT` status, assigning its id
    async fn insert_operation(&self, request: OperationRequest) -> Result<Operation>;

    /// Fetch an operation by id
    async fn get_operation(&self, id: OperationId) -> Result<Option<Operation>>;

    /// Fetch several operations; unknown ids are skipped
    async fn get_operations_by_ids(&self, ids: &[OperationId]) -> Result<Vec<Operation>>;

    /// Operations in any of the given statuses, ascending by id
    async fn get_operations_by_status(
        &self,
        statuses: &[OperationStatus],
    ) -> Result<Vec<Operation>>;

    /// Move an operation to `next`, enforcing the lifecycle table
    ///
    /// Re-asserting the current status is a no-op success, so retried
    /// transitions are idempotent. Any other illegal move fails with
    /// [`Error::InvalidTransition`].
    async fn update_operation_status(
        &self,
        id: OperationId,
        next: OperationStatus,
        rejection_reason: Option<String>,
    ) -> Result<Operation>;

    /// Write posting entries, assigning their ids
    ///
    /// Normally invoked from inside the apply transaction; exposed for
    /// backends that materialize entries elsewhere (migrations,
    /// replays).
    async fn insert_entries(&self, entries: Vec<NewPostingEntry>) -> Result<Vec<PostingEntry>>;

    /// Posting entries of one book, optionally filtered by metadata
    ///
    /// A filter matches an entry when *any* of its keys is present in
    /// the entry's metadata with an equal value.
    async fn get_book_entries(
        &self,
        book_id: &BookId,
        metadata_filter: Option<&JsonMap>,
    ) -> Result<Vec<PostingEntry>>;

    /// Atomically settle the oldest pending operation
    ///
    /// Claims the lowest-id operation still `INIT` or `PROCESSING`,
    /// runs `validator` against a transaction-consistent view, and
    /// either writes the posting entries (`APPLIED`) or records the
    /// failure (`REJECTED`). The claim, validation and write are one
    /// transaction: with N concurrent callers exactly one performs the
    /// transition.
    ///
    /// Returns the settled operation's id, or `None` when nothing is
    /// pending or the transaction lock is contended. `None` is not an
    /// error; the caller polls again.
    async fn apply_first_pending(&self, validator: ApplyValidator) -> Result<Option<OperationId>>;
}

#[derive(Default)]
struct Tables {
    books: BTreeMap<BookId, Book>,
    operations: BTreeMap<OperationId, Operation>,
    entries: Vec<PostingEntry>,
    next_book_id: u64,
    next_operation_id: u64,
    next_entry_id: u64,
}

impl Tables {
    fn write_entries(
        &mut self,
        entries: Vec<NewPostingEntry>,
        now: DateTime<Utc>,
    ) -> Vec<PostingEntry> {
        let mut written = Vec::with_capacity(entries.len());
        for entry in entries {
            self.next_entry_id += 1;
            let entry = PostingEntry {
                id: self.next_entry_id.to_string(),
                operation_id: entry.operation_id,
                book_id: entry.book_id,
                asset_id: entry.asset_id,
                value: entry.value,
                metadata: entry.metadata,
                created_at: now,
            };
            self.entries.push(entry.clone());
            written.push(entry);
        }
        written
    }

    fn balance(&self, book_id: &BookId, asset_id: &AssetId) -> Decimal {
        self.entries
            .iter()
            .filter(|e| &e.book_id == book_id && &e.asset_id == asset_id)
            .map(|e| e.value)
            .sum()
    }
}

impl TxView for Tables {
    fn book(&self, id: &BookId) -> Option<Book> {
        self.books.get(id).cloned()
    }

    fn balance(&self, book_id: &BookId, asset_id: &AssetId) -> Decimal {
        Tables::balance(self, book_id, asset_id)
    }
}

/// In-process storage backend
///
/// One mutex over all tables. Plain reads take the lock briefly;
/// `apply_first_pending` uses `try_lock` so contending workers back
/// off instead of queueing behind the transaction.
pub struct MemoryStorage {
    tables: Mutex<Tables>,
}

impl MemoryStorage {
    /// Create an empty store
    pub fn new() -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
        }
    }

    /// Current number of posting entries, for diagnostics
    pub fn entry_count(&self) -> usize {
        self.tables.lock().entries.len()
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn insert_book(&self, request: BookRequest) -> Result<Book> {
        let mut tables = self.tables.lock();
        tables.next_book_id += 1;
        let book = Book {
            id: BookId::new(tables.next_book_id.to_string()),
            name: request.name,
            metadata: request.metadata,
            restrictions: request.restrictions,
            created_at: Utc::now(),
        };
        tables.books.insert(book.id.clone(), book.clone());
        info!(book_id = %book.id, name = %book.name, "book created");
        Ok(book)
    }

    async fn get_book(&self, id: &BookId) -> Result<Option<Book>> {
        Ok(self.tables.lock().books.get(id).cloned())
    }

    async fn insert_operation(&self, request: OperationRequest) -> Result<Operation> {
        let mut tables = self.tables.lock();
        tables.next_operation_id += 1;
        let now = Utc::now();
        let operation = Operation {
            id: OperationId::new(tables.next_operation_id),
            kind: request.kind,
            memo: request.memo,
            entries: request.entries,
            status: OperationStatus::Init,
            rejection_reason: None,
            metadata: request.metadata,
            created_at: now,
            updated_at: now,
        };
        tables
            .operations
            .insert(operation.id, operation.clone());
        debug!(operation_id = %operation.id, "operation recorded");
        Ok(operation)
    }

    async fn get_operation(&self, id: OperationId) -> Result<Option<Operation>> {
        Ok(self.tables.lock().operations.get(&id).cloned())
    }

    async fn get_operations_by_ids(&self, ids: &[OperationId]) -> Result<Vec<Operation>> {
        let tables = self.tables.lock();
        Ok(ids
            .iter()
            .filter_map(|id| tables.operations.get(id).cloned())
            .collect())
    }

    async fn get_operations_by_status(
        &self,
        statuses: &[OperationStatus],
    ) -> Result<Vec<Operation>> {
        let tables = self.tables.lock();
        Ok(tables
            .operations
            .values()
            .filter(|op| statuses.contains(&op.status))
            .cloned()
            .collect())
    }

    async fn update_operation_status(
        &self,
        id: OperationId,
        next: OperationStatus,
        rejection_reason: Option<String>,
    ) -> Result<Operation> {
        let mut tables = self.tables.lock();
        let operation = tables
            .operations
            .get_mut(&id)
            .ok_or(Error::OperationNotFound(id))?;

        if operation.status == next {
            return Ok(operation.clone());
        }
        if !operation.status.can_transition_to(next) {
            return Err(Error::InvalidTransition {
                id,
                from: operation.status,
                to: next,
            });
        }

        operation.status = next;
        operation.updated_at = Utc::now();
        if next == OperationStatus::Rejected {
            operation.rejection_reason = rejection_reason;
        }
        Ok(operation.clone())
    }

    async fn insert_entries(&self, entries: Vec<NewPostingEntry>) -> Result<Vec<PostingEntry>> {
        let mut tables = self.tables.lock();
        Ok(tables.write_entries(entries, Utc::now()))
    }

    async fn get_book_entries(
        &self,
        book_id: &BookId,
        metadata_filter: Option<&JsonMap>,
    ) -> Result<Vec<PostingEntry>> {
        let tables = self.tables.lock();
        Ok(tables
            .entries
            .iter()
            .filter(|e| &e.book_id == book_id)
            .filter(|e| metadata_matches(e.metadata.as_ref(), metadata_filter))
            .cloned()
            .collect())
    }

    async fn apply_first_pending(&self, validator: ApplyValidator) -> Result<Option<OperationId>> {
        // Back off under contention; the poll loop retries.
        let Some(mut tables) = self.tables.try_lock() else {
            debug!("apply transaction lock contended, backing off");
            return Ok(None);
        };

        let Some(claimed) = tables
            .operations
            .values()
            .find(|op| op.status.is_pending())
            .map(|op| op.id)
        else {
            return Ok(None);
        };

        // A PROCESSING claim here is a crashed worker's leftover being
        // retried; the entries were never written, so re-running the
        // apply is safe.
        let now = Utc::now();
        let (entries, op_metadata) = {
            let operation = tables
                .operations
                .get_mut(&claimed)
                .ok_or(Error::OperationNotFound(claimed))?;
            if operation.status == OperationStatus::Init {
                operation.status = OperationStatus::Processing;
                operation.updated_at = now;
            }
            (operation.entries.clone(), operation.metadata.clone())
        };

        match validator(&entries, &*tables) {
            Ok(()) => {
                let new_entries = entries
                    .into_iter()
                    .map(|request| NewPostingEntry {
                        operation_id: claimed,
                        book_id: request.book_id,
                        asset_id: request.asset_id,
                        value: request.value,
                        metadata: request.metadata.or_else(|| op_metadata.clone()),
                    })
                    .collect();
                tables.write_entries(new_entries, now);
                if let Some(operation) = tables.operations.get_mut(&claimed) {
                    operation.status = OperationStatus::Applied;
                    operation.updated_at = now;
                }
                info!(operation_id = %claimed, "operation applied");
            }
            Err(reason) => {
                if let Some(operation) = tables.operations.get_mut(&claimed) {
                    operation.status = OperationStatus::Rejected;
                    operation.rejection_reason = Some(reason.to_string());
                    operation.updated_at = now;
                }
                info!(operation_id = %claimed, %reason, "operation rejected");
            }
        }

        Ok(Some(claimed))
    }
}

/// Validator wired to the transaction view, for use with
/// [`Storage::apply_first_pending`]
pub fn apply_validator() -> ApplyValidator {
    Arc::new(|entries, view| {
        validator::validate_entries(entries, |id| view.book(id), |b, a| view.balance(b, a))
    })
}

fn metadata_matches(metadata: Option<&JsonMap>, filter: Option<&JsonMap>) -> bool {
    let Some(filter) = filter else {
        return true;
    };
    if filter.is_empty() {
        return true;
    }
    let Some(metadata) = metadata else {
        return false;
    };
    filter
        .iter()
        .any(|(key, expected)| metadata.get(key) == Some(expected))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AssetId, OperationType};
    use serde_json::json;

    fn entry_request(book: &BookId, asset: &str, value: i64) -> EntryRequest {
        EntryRequest {
            book_id: book.clone(),
            asset_id: AssetId::new(asset),
            value: Decimal::from(value),
            metadata: None,
        }
    }

    fn transfer(from: &BookId, to: &BookId, asset: &str, value: i64) -> OperationRequest {
        OperationRequest {
            kind: OperationType::Transfer,
            memo: "test transfer".to_string(),
            entries: vec![
                entry_request(from, asset, -value),
                entry_request(to, asset, value),
            ],
            metadata: None,
        }
    }

    async fn two_books(storage: &MemoryStorage) -> (BookId, BookId) {
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
        (a.id, b.id)
    }

    #[tokio::test]
    async fn test_operation_ids_ascend_with_submission_order() {
        let storage = MemoryStorage::new();
        let (a, b) = two_books(&storage).await;

        let first = storage.insert_operation(transfer(&a, &b, "USD", 1)).await.unwrap();
        let second = storage.insert_operation(transfer(&a, &b, "USD", 2)).await.unwrap();
        assert!(first.id < second.id);
        assert_eq!(first.status, OperationStatus::Init);
    }

    #[tokio::test]
    async fn test_apply_writes_entries_and_transitions() {
        let storage = MemoryStorage::new();
        let (a, b) = two_books(&storage).await;
        let op = storage.insert_operation(transfer(&a, &b, "USD", 100)).await.unwrap();

        let applied = storage.apply_first_pending(apply_validator()).await.unwrap();
        assert_eq!(applied, Some(op.id));

        let op = storage.get_operation(op.id).await.unwrap().unwrap();
        assert_eq!(op.status, OperationStatus::Applied);

        let entries = storage.get_book_entries(&a, None).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].value, Decimal::from(-100));
        assert_eq!(entries[0].operation_id, op.id);
    }

    #[tokio::test]
    async fn test_apply_rejects_and_records_reason() {
        let storage = MemoryStorage::new();
        let (a, _) = two_books(&storage).await;

        let op = storage
            .insert_operation(OperationRequest {
                kind: OperationType::Transfer,
                memo: "unbalanced".to_string(),
                entries: vec![entry_request(&a, "USD", -100)],
                metadata: None,
            })
            .await
            .unwrap();

        let settled = storage.apply_first_pending(apply_validator()).await.unwrap();
        assert_eq!(settled, Some(op.id));

        let op = storage.get_operation(op.id).await.unwrap().unwrap();
        assert_eq!(op.status, OperationStatus::Rejected);
        let reason = op.rejection_reason.unwrap();
        assert!(reason.contains("zeroSum"), "reason: {reason}");

        // No entries written for a rejected operation.
        assert_eq!(storage.entry_count(), 0);
    }

    #[tokio::test]
    async fn test_insert_entries_assigns_distinct_ids() {
        let storage = MemoryStorage::new();
        let (a, b) = two_books(&storage).await;
        let op = storage.insert_operation(transfer(&a, &b, "USD", 1)).await.unwrap();

        let written = storage
            .insert_entries(vec![
                NewPostingEntry {
                    operation_id: op.id,
                    book_id: a.clone(),
                    asset_id: AssetId::new("USD"),
                    value: Decimal::from(-1),
                    metadata: None,
                },
                NewPostingEntry {
                    operation_id: op.id,
                    book_id: b.clone(),
                    asset_id: AssetId::new("USD"),
                    value: Decimal::from(1),
                    metadata: None,
                },
            ])
            .await
            .unwrap();

        assert_eq!(written.len(), 2);
        assert_ne!(written[0].id, written[1].id);
        assert_eq!(storage.get_book_entries(&a, None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_apply_returns_none_when_nothing_pending() {
        let storage = MemoryStorage::new();
        let settled = storage.apply_first_pending(apply_validator()).await.unwrap();
        assert_eq!(settled, None);
    }

    #[tokio::test]
    async fn test_apply_settles_in_submission_order() {
        let storage = MemoryStorage::new();
        let (a, b) = two_books(&storage).await;

        let mut ids = Vec::new();
        for value in 1..=5 {
            let op = storage.insert_operation(transfer(&a, &b, "USD", value)).await.unwrap();
            ids.push(op.id);
        }

        let mut settled = Vec::new();
        while let Some(id) = storage.apply_first_pending(apply_validator()).await.unwrap() {
            settled.push(id);
        }
        assert_eq!(settled, ids);
    }

    #[tokio::test]
    async fn test_contended_apply_backs_off_and_leaves_init() {
        let storage = MemoryStorage::new();
        let (a, b) = two_books(&storage).await;
        let op = storage.insert_operation(transfer(&a, &b, "USD", 1)).await.unwrap();

        // Hold the transaction lock; the apply must back off, not wait.
        let guard = storage.tables.lock();
        let settled = storage.apply_first_pending(apply_validator()).await.unwrap();
        assert_eq!(settled, None);
        drop(guard);

        let parked = storage.get_operation(op.id).await.unwrap().unwrap();
        assert_eq!(parked.status, OperationStatus::Init);
        assert_eq!(storage.entry_count(), 0);

        // Once the lock frees, the same call claims and settles it.
        let settled = storage.apply_first_pending(apply_validator()).await.unwrap();
        assert_eq!(settled, Some(op.id));
    }

    #[tokio::test]
    async fn test_terminal_operations_never_reselected() {
        let storage = MemoryStorage::new();
        let (a, b) = two_books(&storage).await;
        storage.insert_operation(transfer(&a, &b, "USD", 1)).await.unwrap();

        assert!(storage.apply_first_pending(apply_validator()).await.unwrap().is_some());
        assert!(storage.apply_first_pending(apply_validator()).await.unwrap().is_none());
        assert_eq!(storage.entry_count(), 2);
    }

    #[tokio::test]
    async fn test_status_transition_is_idempotent_but_never_backward() {
        let storage = MemoryStorage::new();
        let (a, b) = two_books(&storage).await;
        let op = storage.insert_operation(transfer(&a, &b, "USD", 1)).await.unwrap();

        storage
            .update_operation_status(op.id, OperationStatus::Processing, None)
            .await
            .unwrap();
        // Re-asserting the same status succeeds.
        storage
            .update_operation_status(op.id, OperationStatus::Processing, None)
            .await
            .unwrap();
        storage
            .update_operation_status(op.id, OperationStatus::Applied, None)
            .await
            .unwrap();

        let err = storage
            .update_operation_status(op.id, OperationStatus::Processing, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_min_balance_checked_against_transaction_view() {
        let storage = MemoryStorage::new();
        let funded = storage
            .insert_book(BookRequest {
                name: "funded".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        let restricted = storage
            .insert_book(BookRequest {
                name: "restricted".to_string(),
                metadata: Default::default(),
                restrictions: crate::types::BookRestrictions {
                    min_balance: Some(Decimal::from(50)),
                },
            })
            .await
            .unwrap();

        // Fund the restricted book to exactly its minimum.
        storage
            .insert_operation(transfer(&funded.id, &restricted.id, "USD", 50))
            .await
            .unwrap();
        // Then try to drain it below the minimum.
        storage
            .insert_operation(transfer(&restricted.id, &funded.id, "USD", 10))
            .await
            .unwrap();

        storage.apply_first_pending(apply_validator()).await.unwrap();
        let second = storage.apply_first_pending(apply_validator()).await.unwrap().unwrap();

        let op = storage.get_operation(second).await.unwrap().unwrap();
        assert_eq!(op.status, OperationStatus::Rejected);
        assert!(op.rejection_reason.unwrap().contains("Minimum credit balance"));
    }

    #[tokio::test]
    async fn test_entry_metadata_falls_back_to_operation_metadata() {
        let storage = MemoryStorage::new();
        let (a, b) = two_books(&storage).await;

        let mut op_meta = JsonMap::new();
        op_meta.insert("invoice".to_string(), json!("INV-7"));
        let mut entry_meta = JsonMap::new();
        entry_meta.insert("leg".to_string(), json!("credit"));

        storage
            .insert_operation(OperationRequest {
                kind: OperationType::Transfer,
                memo: "tagged".to_string(),
                entries: vec![
                    entry_request(&a, "USD", -5),
                    EntryRequest {
                        book_id: b.clone(),
                        asset_id: AssetId::new("USD"),
                        value: Decimal::from(5),
                        metadata: Some(entry_meta),
                    },
                ],
                metadata: Some(op_meta),
            })
            .await
            .unwrap();
        storage.apply_first_pending(apply_validator()).await.unwrap();

        let debit = &storage.get_book_entries(&a, None).await.unwrap()[0];
        assert_eq!(debit.metadata.as_ref().unwrap()["invoice"], json!("INV-7"));

        let credit = &storage.get_book_entries(&b, None).await.unwrap()[0];
        assert_eq!(credit.metadata.as_ref().unwrap()["leg"], json!("credit"));
        assert!(credit.metadata.as_ref().unwrap().get("invoice").is_none());
    }

    #[tokio::test]
    async fn test_metadata_filter_matches_any_declared_key() {
        let storage = MemoryStorage::new();
        let (a, b) = two_books(&storage).await;

        let mut meta = JsonMap::new();
        meta.insert("invoice".to_string(), json!("INV-7"));
        storage
            .insert_operation(OperationRequest {
                kind: OperationType::Transfer,
                memo: "tagged".to_string(),
                entries: vec![entry_request(&a, "USD", -5), entry_request(&b, "USD", 5)],
                metadata: Some(meta),
            })
            .await
            .unwrap();
        storage
            .insert_operation(transfer(&a, &b, "USD", 3))
            .await
            .unwrap();
        while storage.apply_first_pending(apply_validator()).await.unwrap().is_some() {}

        let mut filter = JsonMap::new();
        filter.insert("invoice".to_string(), json!("INV-7"));
        filter.insert("unrelated".to_string(), json!("x"));
        let filtered = storage.get_book_entries(&a, Some(&filter)).await.unwrap();
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].value, Decimal::from(-5));

        let all = storage.get_book_entries(&a, None).await.unwrap();
        assert_eq!(all.len(), 2);
    }
}
