//! Error types for the ledger

use crate::types::{AccountId, PrizeId, StandId, StockLineId, TicketId, TombolaId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type for ledger operations
pub type Result<T> = std::result::Result<T, Error>;

/// Ledger errors
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed or missing input
    #[error("Validation error: {0}")]
    Validation(String),

    /// Account not found
    #[error("Account not found: {0}")]
    AccountNotFound(AccountId),

    /// Stand not found
    #[error("Stand not found: {0}")]
    StandNotFound(StandId),

    /// Stock line not found
    #[error("Stock line not found: {0}")]
    StockLineNotFound(StockLineId),

    /// Tombola not found
    #[error("Tombola not found: {0}")]
    TombolaNotFound(TombolaId),

    /// Prize not found
    #[error("Prize not found: {0}")]
    PrizeNotFound(PrizeId),

    /// Ticket not found
    #[error("Ticket not found: {0}")]
    TicketNotFound(TicketId),

    /// Stand has no stock line to sell from
    #[error("No stock available for stand {0}")]
    NoStock(StandId),

    /// Account is neither a parent nor a child
    #[error("Account {0} is neither a parent nor a child")]
    UnresolvedAccount(AccountId),

    /// Balance too low for the operation
    #[error("Insufficient balance on account {account}: required {required}, available {available}")]
    InsufficientBalance {
        /// Debited account
        account: AccountId,
        /// Tokens required
        required: i64,
        /// Tokens available
        available: i64,
    },

    /// Stock decrement would go negative
    #[error("Stock exhausted on line {stock_line}: requested {requested}, available {available}")]
    StockExhausted {
        /// Stock line
        stock_line: StockLineId,
        /// Units requested
        requested: i64,
        /// Units left
        available: i64,
    },

    /// Child is not linked to the parent
    #[error("Account {child} is not a child of account {parent}")]
    RelationshipViolation {
        /// Claimed parent
        parent: AccountId,
        /// Claimed child
        child: AccountId,
    },

    /// Payment reference already credited
    #[error("Payment already credited: {0}")]
    DuplicatePayment(String),

    /// Draw without eligible tickets
    #[error("No tickets available for the draw of tombola {0}")]
    NoTicketsAvailable(TombolaId),

    /// Draw without open prizes
    #[error("No lots available for the draw of tombola {0}")]
    NoLotsAvailable(TombolaId),

    /// Draw produced no assignment
    #[error("No winners were selected in the draw of tombola {0}")]
    NoWinnersSelected(TombolaId),

    /// Store detected a serialization failure, retrying is safe
    #[error("Concurrency conflict: {0}")]
    ConcurrencyConflict(String),

    /// Storage error (RocksDB)
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Stable error classification exposed to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Caller input must be corrected
    ValidationError,
    /// Referenced entity absent
    NotFound,
    /// Balance too low
    InsufficientBalance,
    /// Stock too low
    StockExhausted,
    /// Parent/child link missing
    RelationshipViolation,
    /// Retry the whole operation
    ConcurrencyConflict,
    /// Ledger misconfigured or a collaborator missing
    #[serde(rename = "configuration_error")]
    Configuration,
    /// Infrastructure failure
    StoreUnavailable,
}

impl ErrorKind {
    /// Stable code
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ValidationError => "validation_error",
            ErrorKind::NotFound => "not_found",
            ErrorKind::InsufficientBalance => "insufficient_balance",
            ErrorKind::StockExhausted => "stock_exhausted",
            ErrorKind::RelationshipViolation => "relationship_violation",
            ErrorKind::ConcurrencyConflict => "concurrency_conflict",
            ErrorKind::Configuration => "configuration_error",
            ErrorKind::StoreUnavailable => "store_unavailable",
        }
    }
}

/// Error payload for the external boundary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Stable kind
    pub kind: ErrorKind,
    /// Human readable message
    pub message: String,
}

impl Error {
    /// Stable classification
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Validation(_)
            | Error::DuplicatePayment(_)
            | Error::NoTicketsAvailable(_)
            | Error::NoLotsAvailable(_)
            | Error::NoWinnersSelected(_) => ErrorKind::ValidationError,
            Error::AccountNotFound(_)
            | Error::StandNotFound(_)
            | Error::StockLineNotFound(_)
            | Error::TombolaNotFound(_)
            | Error::PrizeNotFound(_)
            | Error::TicketNotFound(_)
            | Error::NoStock(_)
            | Error::UnresolvedAccount(_) => ErrorKind::NotFound,
            Error::InsufficientBalance { .. } => ErrorKind::InsufficientBalance,
            Error::StockExhausted { .. } => ErrorKind::StockExhausted,
            Error::RelationshipViolation { .. } => ErrorKind::RelationshipViolation,
            Error::ConcurrencyConflict(_) => ErrorKind::ConcurrencyConflict,
            Error::Config(_) => ErrorKind::Configuration,
            Error::StoreUnavailable(_) | Error::Serialization(_) | Error::Io(_) => {
                ErrorKind::StoreUnavailable
            }
        }
    }

    /// Whether the whole operation may be retried automatically
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::ConcurrencyConflict
    }

    /// Boundary payload; store internals never leak
    pub fn to_body(&self) -> ErrorBody {
        let kind = self.kind();
        let message = match kind {
            ErrorKind::StoreUnavailable => "Ledger store unavailable".to_string(),
            ErrorKind::ConcurrencyConflict => {
                "Concurrent update detected, retry the operation".to_string()
            }
            _ => self.to_string(),
        };
        ErrorBody { kind, message }
    }
}

impl From<rocksdb::Error> for Error {
    fn from(err: rocksdb::Error) -> Self {
        use rocksdb::ErrorKind as StoreKind;

        match err.kind() {
            StoreKind::Busy | StoreKind::TimedOut | StoreKind::TryAgain | StoreKind::Expired => {
                Error::ConcurrencyConflict(err.to_string())
            }
            _ => Error::StoreUnavailable(err.to_string()),
        }
    }
}
