//! Core types for the ledger
//!
//! All monetary values are exact decimals (`rust_decimal`), serialized
//! as decimal strings; floating point never touches a `value` field.
//! Operation ids are storage-assigned, monotonically increasing
//! integers carried as strings on the wire and compared numerically.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Free-form metadata map attached to books, operations and entries
pub type JsonMap = serde_json::Map<String, serde_json::Value>;

/// Balances of one book: asset id to net entry sum
pub type Balances = BTreeMap<AssetId, Decimal>;

/// Book identifier (storage-assigned counter string)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BookId(String);

impl BookId {
    /// Create from a raw id string
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The reserved default book, lazily created at startup
    pub fn default_book() -> Self {
        Self("1".to_string())
    }

    /// Get as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BookId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Asset identifier ("USD", "BTC", loyalty points, ...)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AssetId(String);

impl AssetId {
    /// Create from a raw asset code
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AssetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Operation identifier
///
/// Numeric and monotonically increasing so id order is submission
/// order; serialized as a string for the wire and API surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OperationId(#[serde(with = "id_string")] u64);

impl OperationId {
    /// Create from a raw numeric id
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Numeric value
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for OperationId {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<u64>()
            .map(Self)
            .map_err(|_| crate::Error::InvalidId(s.to_string()))
    }
}

mod id_string {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(id: &u64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&id.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Balance restrictions a book declares
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookRestrictions {
    /// Minimum post-application balance per asset
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "rust_decimal::serde::str_option"
    )]
    pub min_balance: Option<Decimal>,
}

impl BookRestrictions {
    /// Whether any restriction is declared
    pub fn is_empty(&self) -> bool {
        self.min_balance.is_none()
    }
}

/// A named account-like container that owns posting entries
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Book {
    /// Book id (storage-assigned)
    pub id: BookId,

    /// Human-readable name
    pub name: String,

    /// Additional metadata
    #[serde(default)]
    pub metadata: JsonMap,

    /// Balance restrictions
    #[serde(default)]
    pub restrictions: BookRestrictions,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,
}

/// Request to create a book
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BookRequest {
    /// Human-readable name
    pub name: String,

    /// Additional metadata
    #[serde(default)]
    pub metadata: JsonMap,

    /// Balance restrictions
    #[serde(default)]
    pub restrictions: BookRestrictions,
}

/// Operation type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationType {
    /// Balanced transfer between books
    Transfer,
}

/// Operation lifecycle status
///
/// `Init -> Processing -> {Applied | Rejected}`, each transition at
/// most once; `Applied` and `Rejected` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationStatus {
    /// Created, waiting in the queue
    Init,
    /// Claimed by a worker for application
    Processing,
    /// Entries written (terminal)
    Applied,
    /// Validation failed (terminal)
    Rejected,
}

impl OperationStatus {
    /// Whether this status is final
    pub fn is_terminal(&self) -> bool {
        matches!(self, OperationStatus::Applied | OperationStatus::Rejected)
    }

    /// Whether an operation in this status must be re-offered to the
    /// queue at startup
    pub fn is_pending(&self) -> bool {
        matches!(self, OperationStatus::Init | OperationStatus::Processing)
    }

    /// Lifecycle transition table
    pub fn can_transition_to(&self, next: OperationStatus) -> bool {
        matches!(
            (self, next),
            (OperationStatus::Init, OperationStatus::Processing)
                | (OperationStatus::Processing, OperationStatus::Applied)
                | (OperationStatus::Processing, OperationStatus::Rejected)
        )
    }
}

/// One requested movement inside an operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryRequest {
    /// Book the value moves against
    pub book_id: BookId,

    /// Asset being moved
    pub asset_id: AssetId,

    /// Signed amount (decimal string on the wire)
    #[serde(with = "rust_decimal::serde::str")]
    pub value: Decimal,

    /// Entry metadata; falls back to the operation's metadata when
    /// absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<JsonMap>,
}

/// Request to post an operation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationRequest {
    /// Operation type
    #[serde(rename = "type")]
    pub kind: OperationType,

    /// Free-text memo
    pub memo: String,

    /// Requested entries
    pub entries: Vec<EntryRequest>,

    /// Operation metadata
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<JsonMap>,
}

/// Request for a two-legged transfer between books
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferRequest {
    /// Book the value leaves
    pub from_book_id: BookId,

    /// Book the value enters
    pub to_book_id: BookId,

    /// Asset being moved
    pub asset_id: AssetId,

    /// Positive amount to move
    #[serde(with = "rust_decimal::serde::str")]
    pub value: Decimal,

    /// Free-text memo
    pub memo: String,

    /// Operation metadata
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<JsonMap>,
}

impl TransferRequest {
    /// Expand into the balanced two-entry operation request
    pub fn into_operation_request(self) -> OperationRequest {
        OperationRequest {
            kind: OperationType::Transfer,
            memo: self.memo,
            entries: vec![
                EntryRequest {
                    book_id: self.from_book_id,
                    asset_id: self.asset_id.clone(),
                    value: -self.value,
                    metadata: None,
                },
                EntryRequest {
                    book_id: self.to_book_id,
                    asset_id: self.asset_id,
                    value: self.value,
                    metadata: None,
                },
            ],
            metadata: self.metadata,
        }
    }
}

/// A user-submitted, multi-entry change request applied as a unit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Operation {
    /// Operation id (storage-assigned, ascending)
    pub id: OperationId,

    /// Operation type
    #[serde(rename = "type")]
    pub kind: OperationType,

    /// Free-text memo
    pub memo: String,

    /// Requested entries (posting entries are created from these on a
    /// successful apply)
    pub entries: Vec<EntryRequest>,

    /// Lifecycle status
    pub status: OperationStatus,

    /// Why the operation was rejected, when it was
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejection_reason: Option<String>,

    /// Operation metadata
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<JsonMap>,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// Last status change timestamp
    pub updated_at: DateTime<Utc>,
}

/// A posting entry about to be written, before storage assigns its id
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewPostingEntry {
    /// Operation producing this entry
    pub operation_id: OperationId,

    /// Book the value moves against
    pub book_id: BookId,

    /// Asset moved
    pub asset_id: AssetId,

    /// Signed amount
    #[serde(with = "rust_decimal::serde::str")]
    pub value: Decimal,

    /// Entry metadata
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<JsonMap>,
}

/// An immutable, signed movement of one asset amount against one book
///
/// Created only as a side effect of successfully applying an
/// operation; the set of entries for a book/asset pair is the sole
/// source of truth for its balance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostingEntry {
    /// Entry id (storage-assigned)
    pub id: String,

    /// Operation that produced this entry
    pub operation_id: OperationId,

    /// Book the value moved against
    pub book_id: BookId,

    /// Asset moved
    pub asset_id: AssetId,

    /// Signed amount
    #[serde(with = "rust_decimal::serde::str")]
    pub value: Decimal,

    /// Entry metadata
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<JsonMap>,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,
}
