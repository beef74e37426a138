//! Token ledger engine
//!
//! Every operation validates its input, then runs as a single unit of work:
//! balances, stand totals, stock, tickets and the transaction record commit
//! together or not at all.
//!
//! # Lock order
//!
//! Rows are locked stand → account → stock line, account → tombola and
//! payment order → account. Two accounts are always locked in ascending id
//! order.

use crate::{
    config::Config,
    error::{Error, Result},
    stock::StockAdapter,
    storage::{Lock, Storage, UnitOfWork},
    types::{
        Account, AccountId, NewTransaction, StandId, StockLineId, Ticket, TombolaId,
        TransactionKind, TransactionRecord,
    },
};
use chrono::Utc;
use rand::Rng;
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;

/// Attempts at drawing an unused ticket serial
const SERIAL_ATTEMPTS: usize = 8;

/// Result of a stand purchase
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PurchaseOutcome {
    /// Buyer balance after the purchase
    pub new_balance: i64,
    /// Tokens debited
    pub total_cost: i64,
    /// Loyalty points awarded (activity stands only)
    pub points_awarded: i64,
    /// Appended record
    pub record: TransactionRecord,
}

/// Result of crediting purchased tokens
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenPurchaseOutcome {
    /// Balance after the credit
    pub new_balance: i64,
    /// Payment reference credited
    pub payment_ref: String,
    /// Appended record
    pub record: TransactionRecord,
}

/// Result of a parent to child transfer
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferOutcome {
    /// Parent balance after the transfer
    pub parent_balance: i64,
    /// Child balance after the transfer
    pub child_balance: i64,
    /// Appended record
    pub record: TransactionRecord,
}

/// Result of a manual balance adjustment
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdjustmentOutcome {
    /// Balance after the adjustment
    pub new_balance: i64,
    /// Appended record
    pub record: TransactionRecord,
}

/// Result of a ticket purchase
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TicketPurchaseOutcome {
    /// Ticket created
    pub ticket: Ticket,
    /// Buyer balance after the purchase
    pub new_balance: i64,
    /// Appended record
    pub record: TransactionRecord,
}

/// Manual ledger entry request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManualEntry {
    /// Account the entry is booked on
    pub account_id: AccountId,
    /// Signed amount
    pub amount: i64,
    /// Kind
    pub kind: TransactionKind,
    /// Description
    pub description: String,
    /// Optional stand reference
    pub stand_id: Option<StandId>,
}

/// Balance-mutating operations
#[derive(Debug)]
pub struct TokenEngine {
    storage: Arc<Storage>,
    stock: StockAdapter,
    ticket_price: i64,
}

impl TokenEngine {
    /// Create engine over `storage`
    pub fn new(storage: Arc<Storage>, config: &Config) -> Self {
        Self {
            storage,
            stock: StockAdapter::new(&config.stands),
            ticket_price: config.tombola.ticket_price_tokens,
        }
    }

    /// Buy `quantity` units at a stand with tokens
    pub fn purchase_with_tokens(
        &self,
        buyer_id: AccountId,
        stand_id: StandId,
        quantity: i64,
        stock_line: Option<StockLineId>,
    ) -> Result<PurchaseOutcome> {
        if quantity <= 0 {
            return Err(Error::Validation("Quantity must be positive".to_string()));
        }

        let outcome = self.storage.in_unit_of_work(|uow| {
            let mut stand = uow.stand_for_update(stand_id)?;
            let line_id = self.stock.select_line(&stand, stock_line)?;
            let mut buyer = uow.account_for_update(buyer_id)?;
            let mut line = uow.stock_line(line_id, Lock::Exclusive)?;

            let total_cost = line
                .price_tokens
                .checked_mul(quantity)
                .ok_or_else(|| Error::Validation("Purchase cost overflow".to_string()))?;
            debit(&mut buyer, total_cost)?;
            stand.tokens_collected = stand
                .tokens_collected
                .checked_add(total_cost)
                .ok_or_else(|| Error::Validation("Stand token total overflow".to_string()))?;

            let points_awarded =
                self.stock
                    .apply_purchase_effects(uow, &mut stand, &mut line, &mut buyer, quantity)?;

            uow.put_account(&buyer)?;
            uow.put_stand(&stand)?;

            let mut entry = NewTransaction::new(
                buyer_id,
                -total_cost,
                TransactionKind::Purchase,
                format!("{} x {} at {}", quantity, line.product_name, stand.name),
            );
            entry.stand_id = Some(stand_id);
            let record = uow.append_transaction(entry)?;

            Ok(PurchaseOutcome {
                new_balance: buyer.balance_tokens,
                total_cost,
                points_awarded,
                record,
            })
        });

        match &outcome {
            Ok(outcome) => tracing::info!(
                account_id = %buyer_id,
                stand_id = %stand_id,
                quantity,
                total_cost = outcome.total_cost,
                new_balance = outcome.new_balance,
                "Stand purchase committed"
            ),
            Err(err) => tracing::warn!(
                account_id = %buyer_id,
                stand_id = %stand_id,
                quantity,
                error = %err,
                "Stand purchase rejected"
            ),
        }

        outcome
    }

    /// Credit tokens bought with a confirmed payment
    pub fn buy_tokens(
        &self,
        account_id: AccountId,
        fiat_amount: Decimal,
        token_amount: i64,
        payment_ref: &str,
    ) -> Result<TokenPurchaseOutcome> {
        if fiat_amount <= Decimal::ZERO {
            return Err(Error::Validation("Fiat amount must be positive".to_string()));
        }
        if token_amount <= 0 {
            return Err(Error::Validation("Token amount must be positive".to_string()));
        }
        if payment_ref.trim().is_empty() {
            return Err(Error::Validation("Payment reference is required".to_string()));
        }

        let outcome = self.storage.in_unit_of_work(|uow| {
            // A caller-confirmed payment retires any order left for it
            uow.take_payment_order(payment_ref)?;
            credit_tokens(uow, account_id, fiat_amount, token_amount, payment_ref)
        });

        match &outcome {
            Ok(outcome) => tracing::info!(
                account_id = %account_id,
                token_amount,
                fiat_amount = %fiat_amount,
                payment_ref,
                new_balance = outcome.new_balance,
                "Tokens credited"
            ),
            Err(err) => tracing::warn!(
                account_id = %account_id,
                payment_ref,
                error = %err,
                "Token credit rejected"
            ),
        }

        outcome
    }

    /// Credit the pending order of a succeeded payment
    ///
    /// The order is removed in the same unit of work as the credit, so a
    /// confirmation either credits and retires the order or leaves both as
    /// they were.
    pub fn credit_token_order(&self, payment_ref: &str) -> Result<TokenPurchaseOutcome> {
        let outcome = self.storage.in_unit_of_work(|uow| {
            let order = match uow.take_payment_order(payment_ref)? {
                Some(order) => order,
                None if uow.payment_credited(payment_ref)? => {
                    return Err(Error::DuplicatePayment(payment_ref.to_string()))
                }
                None => {
                    return Err(Error::Validation(format!(
                        "Unknown payment reference {}",
                        payment_ref
                    )))
                }
            };
            credit_tokens(
                uow,
                order.account_id,
                order.fiat_amount,
                order.token_amount,
                payment_ref,
            )
        });

        match &outcome {
            Ok(outcome) => tracing::info!(
                account_id = %outcome.record.account_id,
                token_amount = outcome.record.amount,
                payment_ref,
                new_balance = outcome.new_balance,
                "Token order credited"
            ),
            Err(err) => tracing::warn!(
                payment_ref,
                error = %err,
                "Token order credit rejected"
            ),
        }

        outcome
    }

    /// Move tokens from a parent to one of their children
    pub fn transfer_tokens(
        &self,
        parent_id: AccountId,
        child_id: AccountId,
        amount: i64,
    ) -> Result<TransferOutcome> {
        if amount <= 0 {
            return Err(Error::Validation("Transfer amount must be positive".to_string()));
        }

        let outcome = self.storage.in_unit_of_work(|uow| {
            // Relationship is checked before any balance is looked at
            let parent = uow.account(parent_id, Lock::None)?;
            if !parent.has_child(child_id) {
                return Err(Error::RelationshipViolation {
                    parent: parent_id,
                    child: child_id,
                });
            }

            let (mut parent, mut child) = lock_pair(uow, parent_id, child_id)?;
            if !parent.has_child(child_id) {
                return Err(Error::RelationshipViolation {
                    parent: parent_id,
                    child: child_id,
                });
            }

            debit(&mut parent, amount)?;
            child.balance_tokens = child
                .balance_tokens
                .checked_add(amount)
                .ok_or_else(|| Error::Validation("Balance overflow".to_string()))?;
            uow.put_account(&parent)?;
            uow.put_account(&child)?;

            let mut entry = NewTransaction::new(
                parent_id,
                -amount,
                TransactionKind::Transfer,
                format!("Transfer to {}", child.name),
            );
            entry.counterparty_account_id = Some(child_id);
            let record = uow.append_transaction(entry)?;

            Ok(TransferOutcome {
                parent_balance: parent.balance_tokens,
                child_balance: child.balance_tokens,
                record,
            })
        });

        match &outcome {
            Ok(outcome) => tracing::info!(
                parent_id = %parent_id,
                child_id = %child_id,
                amount,
                parent_balance = outcome.parent_balance,
                child_balance = outcome.child_balance,
                "Transfer committed"
            ),
            Err(err) => tracing::warn!(
                parent_id = %parent_id,
                child_id = %child_id,
                amount,
                error = %err,
                "Transfer rejected"
            ),
        }

        outcome
    }

    /// Append a record-only administrative entry; no balance changes
    pub fn record_manual_transaction(&self, entry: ManualEntry) -> Result<TransactionRecord> {
        validate_manual(&entry)?;

        let record = self.storage.in_unit_of_work(|uow| {
            uow.account(entry.account_id, Lock::None)?;
            if let Some(stand_id) = entry.stand_id {
                uow.stand(stand_id, Lock::None)?;
            }

            let mut new = manual_transaction(&entry);
            new.applied = false;
            uow.append_transaction(new)
        })?;

        tracing::info!(
            transaction_id = %record.id,
            account_id = %record.account_id,
            amount = record.amount,
            kind = %record.kind,
            "Manual entry recorded"
        );

        Ok(record)
    }

    /// Append an administrative entry and apply it to the balance
    pub fn post_manual_adjustment(&self, entry: ManualEntry) -> Result<AdjustmentOutcome> {
        validate_manual(&entry)?;

        let outcome = self.storage.in_unit_of_work(|uow| {
            let mut account = uow.account_for_update(entry.account_id)?;
            if let Some(stand_id) = entry.stand_id {
                uow.stand(stand_id, Lock::None)?;
            }

            if entry.amount < 0 {
                debit(&mut account, -entry.amount)?;
            } else {
                account.balance_tokens = account
                    .balance_tokens
                    .checked_add(entry.amount)
                    .ok_or_else(|| Error::Validation("Balance overflow".to_string()))?;
            }
            uow.put_account(&account)?;

            let record = uow.append_transaction(manual_transaction(&entry))?;
            Ok(AdjustmentOutcome {
                new_balance: account.balance_tokens,
                record,
            })
        });

        match &outcome {
            Ok(outcome) => tracing::info!(
                account_id = %entry.account_id,
                amount = entry.amount,
                new_balance = outcome.new_balance,
                "Manual adjustment committed"
            ),
            Err(err) => tracing::warn!(
                account_id = %entry.account_id,
                amount = entry.amount,
                error = %err,
                "Manual adjustment rejected"
            ),
        }

        outcome
    }

    /// Buy one raffle ticket at the configured price
    pub fn buy_ticket(&self, buyer_id: AccountId, tombola_id: TombolaId) -> Result<TicketPurchaseOutcome> {
        let price = self.ticket_price;

        let outcome = self.storage.in_unit_of_work(|uow| {
            let mut buyer = uow.account_for_update(buyer_id)?;
            let mut tombola = uow.tombola(tombola_id, Lock::Exclusive)?;

            debit(&mut buyer, price)?;
            tombola.tokens_collected = tombola
                .tokens_collected
                .checked_add(price)
                .ok_or_else(|| Error::Validation("Tombola token total overflow".to_string()))?;

            let ticket = Ticket {
                id: uow.next_ticket_id()?,
                tombola_id,
                owner_account_id: buyer_id,
                serial_number: unused_serial(uow)?,
                price_tokens: price,
                won: false,
                purchased_at: Utc::now(),
            };
            uow.insert_ticket(&ticket)?;
            uow.put_tombola(&tombola)?;
            uow.put_account(&buyer)?;

            let mut entry = NewTransaction::new(
                buyer_id,
                -price,
                TransactionKind::Purchase,
                format!("Ticket {} for {}", ticket.serial_number, tombola.name),
            );
            entry.tombola_id = Some(tombola_id);
            let record = uow.append_transaction(entry)?;

            Ok(TicketPurchaseOutcome {
                ticket,
                new_balance: buyer.balance_tokens,
                record,
            })
        });

        match &outcome {
            Ok(outcome) => tracing::info!(
                account_id = %buyer_id,
                tombola_id = %tombola_id,
                serial = %outcome.ticket.serial_number,
                new_balance = outcome.new_balance,
                "Ticket purchase committed"
            ),
            Err(err) => tracing::warn!(
                account_id = %buyer_id,
                tombola_id = %tombola_id,
                error = %err,
                "Ticket purchase rejected"
            ),
        }

        outcome
    }
}

fn credit_tokens(
    uow: &UnitOfWork<'_>,
    account_id: AccountId,
    fiat_amount: Decimal,
    token_amount: i64,
    payment_ref: &str,
) -> Result<TokenPurchaseOutcome> {
    let mut account = uow.account_for_update(account_id)?;

    let mut entry = NewTransaction::new(
        account_id,
        token_amount,
        TransactionKind::Purchase,
        format!("Purchase of {} tokens", token_amount),
    );
    entry.payment_ref = Some(payment_ref.to_string());
    entry.fiat_amount = Some(fiat_amount);
    let record = uow.append_transaction(entry)?;

    account.balance_tokens = account
        .balance_tokens
        .checked_add(token_amount)
        .ok_or_else(|| Error::Validation("Balance overflow".to_string()))?;
    uow.put_account(&account)?;

    Ok(TokenPurchaseOutcome {
        new_balance: account.balance_tokens,
        payment_ref: payment_ref.to_string(),
        record,
    })
}

fn debit(account: &mut Account, amount: i64) -> Result<()> {
    if account.balance_tokens < amount {
        return Err(Error::InsufficientBalance {
            account: account.id,
            required: amount,
            available: account.balance_tokens,
        });
    }
    account.balance_tokens -= amount;
    Ok(())
}

/// Lock two accounts in ascending id order, returned as (first, second) of the arguments
fn lock_pair(uow: &UnitOfWork<'_>, first: AccountId, second: AccountId) -> Result<(Account, Account)> {
    if first == second {
        return Err(Error::Validation("Accounts must differ".to_string()));
    }
    if first < second {
        let a = uow.account_for_update(first)?;
        let b = uow.account_for_update(second)?;
        Ok((a, b))
    } else {
        let b = uow.account_for_update(second)?;
        let a = uow.account_for_update(first)?;
        Ok((a, b))
    }
}

fn validate_manual(entry: &ManualEntry) -> Result<()> {
    if entry.amount == 0 {
        return Err(Error::Validation("Amount must not be zero".to_string()));
    }
    if entry.description.trim().is_empty() {
        return Err(Error::Validation("Description is required".to_string()));
    }
    Ok(())
}

fn manual_transaction(entry: &ManualEntry) -> NewTransaction {
    let mut new = NewTransaction::new(
        entry.account_id,
        entry.amount,
        entry.kind,
        entry.description.clone(),
    );
    new.stand_id = entry.stand_id;
    new.manual = true;
    new
}

/// `T-<unix nanos>-<4 digits>`
fn ticket_serial<R: Rng + ?Sized>(rng: &mut R) -> String {
    let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
    format!("T-{}-{:04}", nanos, rng.gen_range(0..10_000))
}

fn unused_serial(uow: &UnitOfWork<'_>) -> Result<String> {
    let mut rng = rand::thread_rng();
    for _ in 0..SERIAL_ATTEMPTS {
        let serial = ticket_serial(&mut rng);
        if !uow.serial_taken(&serial)? {
            return Ok(serial);
        }
    }
    Err(Error::ConcurrencyConflict(
        "Could not allocate a unique ticket serial".to_string(),
    ))
}
