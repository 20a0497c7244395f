//! Double-entry ledger with ordered, exactly-once operation apply
//!
//! Monetary movements are recorded as atomic, balanced operations made
//! of posting entries against named books. The engine guarantees:
//!
//! - **Conservation**: an operation's entries net to zero per asset
//! - **Ordered application**: operations are offered for apply in
//!   submission order (FIFO, by ascending operation id)
//! - **Exactly-once apply**: at most one worker executes the apply
//!   side effects for a given operation, even with N concurrent
//!   workers against the same store
//!
//! The operation table itself is the durable queue of record: anything
//! still `INIT` or `PROCESSING` at startup is re-offered to the queue,
//! so no separate recovery log exists.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod config;
pub mod error;
pub mod ledger;
pub mod queue;
pub mod storage;
pub mod types;
pub mod validator;
pub mod worker;

// Re-exports
pub use config::Config;
pub use error::{Error, Result, ValidationError};
pub use ledger::{BookView, LedgerSystem};
pub use storage::{MemoryStorage, Storage};
pub use types::{
    AssetId, Balances, Book, BookId, BookRequest, EntryRequest, NewPostingEntry, Operation,
    OperationId, OperationRequest, OperationStatus, OperationType, PostingEntry, TransferRequest,
};
