//! Post-commit notifications
//!
//! Delivery is fire-and-forget: it happens after the unit of work committed
//! and can never fail the ledger operation. A full or closed connection loses
//! the notification, which is logged.

use crate::types::{AccountId, PrizeId, StandId, TicketId, TombolaId, TransactionId};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use uuid::Uuid;

/// Event pushed to an account's live connections
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Notification {
    /// Balance changed by a committed operation
    #[serde(rename_all = "camelCase")]
    BalanceChanged {
        /// Record that caused the change
        transaction_id: TransactionId,
        /// Balance after the change
        balance_tokens: i64,
    },

    /// Tokens received from a parent
    #[serde(rename_all = "camelCase")]
    TransferReceived {
        /// Sending parent
        from_account_id: AccountId,
        /// Tokens received
        amount: i64,
        /// Balance after the transfer
        balance_tokens: i64,
    },

    /// Loyalty points earned
    #[serde(rename_all = "camelCase")]
    PointsAwarded {
        /// Activity stand
        stand_id: StandId,
        /// Points earned by the purchase
        points: i64,
    },

    /// Ticket bought
    #[serde(rename_all = "camelCase")]
    TicketPurchased {
        /// Tombola
        tombola_id: TombolaId,
        /// Ticket
        ticket_id: TicketId,
        /// Serial printed on the ticket
        serial_number: String,
    },

    /// Ticket won a prize
    #[serde(rename_all = "camelCase")]
    PrizeWon {
        /// Tombola
        tombola_id: TombolaId,
        /// Prize
        prize_id: PrizeId,
        /// Winning ticket
        ticket_id: TicketId,
    },
}

/// Outbound delivery collaborator
pub trait Notifier: Send + Sync + fmt::Debug {
    /// Deliver without waiting; failures are absorbed
    fn deliver(&self, account: AccountId, notification: &Notification);
}

/// Discards every notification
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotifier;

impl Notifier for NoopNotifier {
    fn deliver(&self, _account: AccountId, _notification: &Notification) {}
}

type Connection = (Uuid, mpsc::Sender<Notification>);

/// Live connections keyed by account
pub struct ConnectionDirectory {
    connections: DashMap<AccountId, Vec<Connection>>,
    capacity: usize,
}

impl ConnectionDirectory {
    /// Create a directory with a per-connection buffer of `capacity`
    pub fn new(capacity: usize) -> Self {
        Self {
            connections: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    /// Register a connection for `account`
    pub fn connect(&self, account: AccountId) -> (Uuid, mpsc::Receiver<Notification>) {
        let (tx, rx) = mpsc::channel(self.capacity);
        let connection_id = Uuid::new_v4();
        self.connections
            .entry(account)
            .or_default()
            .push((connection_id, tx));

        tracing::debug!(account_id = %account, connection_id = %connection_id, "Connection registered");
        (connection_id, rx)
    }

    /// Remove a connection; returns whether it was registered
    pub fn disconnect(&self, account: AccountId, connection_id: Uuid) -> bool {
        let mut removed = false;
        if let Some(mut entry) = self.connections.get_mut(&account) {
            let before = entry.len();
            entry.retain(|(id, _)| *id != connection_id);
            removed = entry.len() != before;
        }
        self.connections.remove_if(&account, |_, conns| conns.is_empty());
        removed
    }

    /// Open connections of `account`
    pub fn connection_count(&self, account: AccountId) -> usize {
        self.connections.get(&account).map(|c| c.len()).unwrap_or(0)
    }

    /// Push to every connection of `account`; returns how many accepted it
    pub fn send(&self, account: AccountId, notification: &Notification) -> usize {
        let mut delivered = 0;
        if let Some(mut entry) = self.connections.get_mut(&account) {
            entry.retain(|(connection_id, tx)| match tx.try_send(notification.clone()) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(TrySendError::Full(_)) => {
                    tracing::warn!(
                        account_id = %account,
                        connection_id = %connection_id,
                        "Notification dropped, connection buffer full"
                    );
                    true
                }
                Err(TrySendError::Closed(_)) => false,
            });
        }
        self.connections.remove_if(&account, |_, conns| conns.is_empty());
        delivered
    }
}

impl fmt::Debug for ConnectionDirectory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionDirectory")
            .field("accounts", &self.connections.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}

/// Delivers through a [`ConnectionDirectory`]
#[derive(Debug, Clone)]
pub struct DirectoryNotifier {
    directory: Arc<ConnectionDirectory>,
}

impl DirectoryNotifier {
    /// Wrap a directory
    pub fn new(directory: Arc<ConnectionDirectory>) -> Self {
        Self { directory }
    }
}

impl Notifier for DirectoryNotifier {
    fn deliver(&self, account: AccountId, notification: &Notification) {
        self.directory.send(account, notification);
    }
}
