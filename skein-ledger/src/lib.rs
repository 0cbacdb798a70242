//! Trade bookkeeping: the ledger of logical trades, the order store, the
//! SQLite journal behind them, and the reconciliation engine that correlates
//! streamed exchange events with local state.

use thiserror::Error;

mod journal;
mod ledger;
mod orders;
mod reconcile;

pub use journal::Journal;
pub use ledger::{CloseOutcome, FillOutcome, OpenParams, TradeLedger};
pub use orders::{OrderStore, UpsertOutcome};
pub use reconcile::{OrderFill, ReconciliationEngine};

/// Result alias for ledger operations.
pub type LedgerResult<T> = Result<T, LedgerError>;

/// Errors surfaced by ledger and journal operations.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// A fill or close referenced a client order id the ledger has never
    /// seen. Surfaced to the caller; stream workers route it to the orphan
    /// journal instead.
    #[error("unknown trade: {0}")]
    UnknownTrade(String),
    /// The underlying journal store failed.
    #[error("journal error: {0}")]
    Journal(String),
    /// A persisted row could not be decoded back into its domain type.
    #[error("corrupt journal row: {0}")]
    Corrupt(String),
}

impl From<rusqlite::Error> for LedgerError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Journal(err.to_string())
    }
}
