//! Posting-entry validation
//!
//! Pure functions; callers decide whether a failure rejects the
//! operation or aborts a larger transaction. During a transactional
//! apply the lookups read inside the same transaction, so balance
//! checks are consistent with concurrent writers.
//!
//! The zero-sum check groups entries by asset before summing: an
//! operation must conserve value within every asset it touches. (The
//! alternative, a raw sum across assets, would let `+1 USD / -1 EUR`
//! pass despite conserving nothing.)

use crate::error::ValidationError;
use crate::types::{AssetId, Book, BookId, EntryRequest};
use rust_decimal::Decimal;
use std::collections::BTreeMap;

/// Validate an operation's entries
///
/// Checks, in order: non-empty, per-asset zero sum, per-book
/// existence and minimum-balance restrictions.
pub fn validate_entries<B, L>(
    entries: &[EntryRequest],
    book_lookup: B,
    balance_lookup: L,
) -> Result<(), ValidationError>
where
    B: Fn(&BookId) -> Option<Book>,
    L: Fn(&BookId, &AssetId) -> Decimal,
{
    if entries.is_empty() {
        return Err(ValidationError::EmptyEntries);
    }

    let mut asset_sums: BTreeMap<&AssetId, Decimal> = BTreeMap::new();
    for entry in entries {
        *asset_sums.entry(&entry.asset_id).or_default() += entry.value;
    }
    for (asset_id, sum) in &asset_sums {
        if !sum.is_zero() {
            return Err(ValidationError::NotZeroSum {
                asset_id: (*asset_id).clone(),
            });
        }
    }

    // Book checks, in first-reference order.
    let mut seen: Vec<&BookId> = Vec::new();
    for entry in entries {
        if seen.contains(&&entry.book_id) {
            continue;
        }
        seen.push(&entry.book_id);

        let book = book_lookup(&entry.book_id).ok_or_else(|| ValidationError::UnknownBook {
            book_id: entry.book_id.clone(),
        })?;

        let Some(min_balance) = book.restrictions.min_balance else {
            continue;
        };

        let mut deltas: BTreeMap<&AssetId, Decimal> = BTreeMap::new();
        for book_entry in entries.iter().filter(|e| e.book_id == entry.book_id) {
            *deltas.entry(&book_entry.asset_id).or_default() += book_entry.value;
        }

        for (asset_id, delta) in deltas {
            let current = balance_lookup(&book.id, asset_id);
            if current + delta < min_balance {
                return Err(ValidationError::BelowMinBalance {
                    book_id: book.id.clone(),
                    asset_id: asset_id.clone(),
                    required: min_balance,
                    current,
                });
            }
        }
    }

    Ok(())
}
