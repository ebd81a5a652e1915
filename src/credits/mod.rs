//! Credit ledger for Lumishot.
//!
//! Owns the per-user balance state, the recovery computation, and the
//! deduct/reset operations backed by SQLite.
//!
//! ## Design
//! - Pure recovery arithmetic in [`ledger`], persistence in [`store`]
//! - Every balance read runs recovery and writes the result back — there is
//!   no background sweep
//! - Deduction uses a conditional SQL update so two concurrent spends can
//!   never both succeed against one balance

pub mod ledger;
pub mod store;

use thiserror::Error;

/// Errors surfaced by the credit ledger.
#[derive(Debug, Error)]
pub enum CreditError {
    /// No ledger row exists and creating one did not produce it.
    #[error("no credit record for user {0}")]
    NotFound(String),

    /// Deduction asked for more than the balance holds.
    #[error("insufficient credits: required {required}, available {available}")]
    InsufficientCredits { required: i64, available: i64 },

    /// Amount was zero, negative, or otherwise malformed.
    #[error("invalid credit amount: {0}")]
    InvalidAmount(String),

    /// The backing store failed. Propagated unchanged, never retried here.
    #[error("credit store error: {0}")]
    Persistence(#[from] rusqlite::Error),
}

pub use ledger::{recover, LedgerRecord, DAILY_BASELINE, DAILY_RECOVERY_CAP, MAX_BALANCE};
pub use store::CreditStore;
