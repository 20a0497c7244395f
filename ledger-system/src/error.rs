//! Error types for the ledger

use crate::types::{AssetId, BookId, OperationId, OperationStatus};
use rust_decimal::Decimal;
use thiserror::Error;

/// Result type for ledger operations
pub type Result<T> = std::result::Result<T, Error>;

/// Posting-entry validation failure
///
/// Always recoverable: a validation failure rejects the operation with
/// the failure's message as `rejection_reason`, it is never raised to
/// the submitter synchronously. The display strings are the rejection
/// reasons persisted on the operation, so their wording is stable.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// Operation carries no entries
    #[error("No entries specified!")]
    EmptyEntries,

    /// Entries for one asset do not net to zero
    #[error("Entries for asset {asset_id} do not add up to be zeroSum!")]
    NotZeroSum {
        /// Asset whose entries fail to cancel
        asset_id: AssetId,
    },

    /// Referenced book does not exist
    #[error("Book ID ({book_id}) is invalid!")]
    UnknownBook {
        /// The unknown book id
        book_id: BookId,
    },

    /// Applying would push a restricted book below its minimum balance
    #[error(
        "Minimum credit balance required on book {book_id} is {required} {asset_id} | \
         Current book balance: {current} {asset_id}"
    )]
    BelowMinBalance {
        /// The restricted book
        book_id: BookId,
        /// Asset the restriction failed for
        asset_id: AssetId,
        /// Declared minimum balance
        required: Decimal,
        /// Balance before the operation
        current: Decimal,
    },
}

/// Ledger errors
#[derive(Debug, Error)]
pub enum Error {
    /// Posting-entry validation failed
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Book not found
    #[error("Book not found: {0}")]
    BookNotFound(BookId),

    /// Operation not found
    #[error("Operation not found: {0}")]
    OperationNotFound(OperationId),

    /// Illegal lifecycle transition (terminal states are final)
    #[error("Illegal status transition for operation {id}: {from:?} -> {to:?}")]
    InvalidTransition {
        /// Operation being transitioned
        id: OperationId,
        /// Current status
        from: OperationStatus,
        /// Requested status
        to: OperationStatus,
    },

    /// Malformed identifier
    #[error("Invalid id: {0}")]
    InvalidId(String),

    /// Queue transport error
    #[error("Queue error: {0}")]
    Queue(#[from] fifo_queue::Error),

    /// Concurrency error (queue loop stopped, wait channel closed)
    #[error("Concurrency error: {0}")]
    Concurrency(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
