//! Jeton Ledger
//!
//! Token ledger and tombola draw engine for a school fair. Users buy tokens
//! ("jetons"), parents hand them to their children, everyone spends them at
//! stands and on raffle tickets, and the tombola draw assigns prizes to
//! tickets.
//!
//! # Architecture
//!
//! - **Units of work**: Every operation commits all of its rows or none
//! - **Row locks**: Pessimistic RocksDB transactions, writers of the same row serialize
//! - **Append-only history**: Transaction and winner records are never modified
//! - **Pure draw**: Selection is a function of the pools and an injected RNG
//!
//! # Invariants
//!
//! - Balances and stock quantities are never negative
//! - Value conservation: Σ balances + Σ stand tokens + Σ tombola tokens
//!   changes only through confirmed payments and manual adjustments
//! - Per account: balance − opening balance == net of its applied records
//! - A ticket wins at most one prize, a prize is awarded at most once

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    clippy::all
)]

pub mod admin;
pub mod config;
pub mod draw;
pub mod engine;
pub mod error;
pub mod ledger;
pub mod metrics;
pub mod notify;
pub mod payment;
pub mod query;
pub mod retry;
pub mod stock;
pub mod storage;
pub mod types;

// Re-exports
pub use config::Config;
pub use draw::DrawReceipt;
pub use engine::ManualEntry;
pub use error::{Error, ErrorBody, ErrorKind, Result};
pub use ledger::Ledger;
pub use storage::Storage;
pub use types::{
    Account, AccountId, AccountKind, Prize, PrizeId, Stand, StandCategory, StandId, StockLine,
    StockLineId, Ticket, TicketId, TokenOrder, Tombola, TombolaId, TransactionId,
    TransactionKind, TransactionRecord, WinnerRecord,
};
