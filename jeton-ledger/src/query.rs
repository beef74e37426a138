//! Read-only views over committed ledger state

use crate::{
    error::Result,
    storage::Storage,
    types::{
        Account, AccountId, Prize, Stand, StandId, StockLine, Ticket, TokenOrder, Tombola,
        TombolaId, TransactionKind, TransactionRecord, WinnerRecord,
    },
};
use serde::Serialize;
use std::sync::Arc;

/// Totals for one transaction kind
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KindSummary {
    /// Kind
    pub kind: TransactionKind,
    /// Number of records
    pub count: u64,
    /// Sum of positive amounts
    pub credited: i64,
    /// Sum of negative amounts, as a positive number
    pub debited: i64,
    /// credited - debited
    pub net: i64,
}

/// Per-kind summary of the whole history
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionSummary {
    /// One entry per kind, in [`TransactionKind::ALL`] order
    pub kinds: Vec<KindSummary>,
    /// Total number of records
    pub total_records: u64,
}

impl TransactionSummary {
    /// Entry for `kind`
    pub fn get(&self, kind: TransactionKind) -> Option<&KindSummary> {
        self.kinds.iter().find(|k| k.kind == kind)
    }
}

/// Account balance checked against its history
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConservationReport {
    /// Account
    pub account_id: AccountId,
    /// Balance at creation
    pub opening_balance: i64,
    /// Current balance
    pub balance: i64,
    /// Net effect of the applied history
    pub recorded_net: i64,
    /// `balance - opening_balance == recorded_net`
    pub balanced: bool,
}

/// System-wide token totals
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValueTotals {
    /// Sum of account balances
    pub account_balances: i64,
    /// Sum of opening balances
    pub opening_balances: i64,
    /// Tokens collected by stands
    pub stand_tokens: i64,
    /// Tokens collected by tombolas
    pub tombola_tokens: i64,
    /// Tokens created by confirmed payments
    pub tokens_minted: i64,
    /// Net of applied manual adjustments
    pub manual_adjustments: i64,
}

impl ValueTotals {
    /// Value held equals value brought in
    pub fn is_conserved(&self) -> bool {
        self.account_balances + self.stand_tokens + self.tombola_tokens
            == self.opening_balances + self.tokens_minted + self.manual_adjustments
    }
}

/// Query service
#[derive(Debug)]
pub struct LedgerQuery {
    storage: Arc<Storage>,
}

impl LedgerQuery {
    /// Create over `storage`
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }

    /// Account by id
    pub fn account(&self, id: AccountId) -> Result<Account> {
        self.storage.get_account(id)
    }

    /// Stand by id
    pub fn stand(&self, id: StandId) -> Result<Stand> {
        self.storage.get_stand(id)
    }

    /// Stock lines of a stand, first line first
    pub fn stock_lines(&self, id: StandId) -> Result<Vec<StockLine>> {
        self.storage
            .get_stand(id)?
            .stock_lines
            .into_iter()
            .map(|line| self.storage.get_stock_line(line))
            .collect()
    }

    /// Tombola by id
    pub fn tombola(&self, id: TombolaId) -> Result<Tombola> {
        self.storage.get_tombola(id)
    }

    /// All tombolas, creation order
    pub fn tombolas(&self) -> Result<Vec<Tombola>> {
        self.storage.all_tombolas()
    }

    /// Tombolas of one kermesse, creation order
    pub fn tombolas_for_event(&self, event_id: u64) -> Result<Vec<Tombola>> {
        Ok(self
            .storage
            .all_tombolas()?
            .into_iter()
            .filter(|t| t.event_id == event_id)
            .collect())
    }

    /// Prizes of a tombola in draw order
    pub fn prizes(&self, id: TombolaId) -> Result<Vec<Prize>> {
        self.storage
            .get_tombola(id)?
            .prizes
            .into_iter()
            .map(|prize| self.storage.get_prize(prize))
            .collect()
    }

    /// Per-kind counts and sums over the full history
    pub fn transaction_summary(&self) -> Result<TransactionSummary> {
        let records = self.storage.all_transactions()?;
        Ok(summarize(&records))
    }

    /// Records owned by or naming the account, creation order
    pub fn account_history(&self, id: AccountId) -> Result<Vec<TransactionRecord>> {
        self.storage.get_account(id)?;
        self.storage.transactions_for_account(id)
    }

    /// Records made at a stand, creation order
    pub fn stand_history(&self, id: StandId) -> Result<Vec<TransactionRecord>> {
        self.storage.get_stand(id)?;
        self.storage.transactions_for_stand(id)
    }

    /// Winners of a tombola, draw order
    pub fn winners(&self, id: TombolaId) -> Result<Vec<WinnerRecord>> {
        self.storage.get_tombola(id)?;
        self.storage.winners_for_tombola(id)
    }

    /// All tickets of a tombola
    pub fn tickets(&self, id: TombolaId) -> Result<Vec<Ticket>> {
        self.storage.get_tombola(id)?;
        self.storage.tickets_for_tombola(id)
    }

    /// Tickets of a tombola owned by `account`
    pub fn tickets_of(&self, id: TombolaId, account: AccountId) -> Result<Vec<Ticket>> {
        Ok(self
            .tickets(id)?
            .into_iter()
            .filter(|t| t.owner_account_id == account)
            .collect())
    }

    /// Token orders awaiting payment confirmation, by payment reference
    pub fn pending_payment_orders(&self) -> Result<Vec<(String, TokenOrder)>> {
        self.storage.pending_payment_orders()
    }

    /// Check an account's balance against its applied history
    pub fn verify_conservation(&self, id: AccountId) -> Result<ConservationReport> {
        let snapshot = self.storage.snapshot();
        let account = snapshot.account(id)?;
        let recorded_net = snapshot
            .transactions_for_account(id)?
            .iter()
            .map(|record| record.effect_on(id))
            .sum();
        let report = ConservationReport {
            account_id: id,
            opening_balance: account.opening_balance,
            balance: account.balance_tokens,
            recorded_net,
            balanced: account.balance_tokens - account.opening_balance == recorded_net,
        };

        if !report.balanced {
            tracing::error!(
                account_id = %id,
                balance = report.balance,
                opening_balance = report.opening_balance,
                recorded_net,
                "Account balance does not match its history"
            );
        }

        Ok(report)
    }

    /// Token totals across accounts, stands and tombolas
    ///
    /// All rows are read from one snapshot, so commits landing during the scan
    /// are either fully counted or not at all.
    pub fn value_totals(&self) -> Result<ValueTotals> {
        let snapshot = self.storage.snapshot();
        let accounts = snapshot.all_accounts()?;
        let stands = snapshot.all_stands()?;
        let tombolas = snapshot.all_tombolas()?;
        let records = snapshot.all_transactions()?;

        let applied = records.iter().filter(|r| r.applied);
        let mut tokens_minted = 0;
        let mut manual_adjustments = 0;
        for record in applied {
            if record.manual {
                manual_adjustments += record.amount;
            } else if record.payment_ref.is_some() {
                tokens_minted += record.amount;
            }
        }

        Ok(ValueTotals {
            account_balances: accounts.iter().map(|a| a.balance_tokens).sum(),
            opening_balances: accounts.iter().map(|a| a.opening_balance).sum(),
            stand_tokens: stands.iter().map(|s| s.tokens_collected).sum(),
            tombola_tokens: tombolas.iter().map(|t| t.tokens_collected).sum(),
            tokens_minted,
            manual_adjustments,
        })
    }
}

/// Group records by kind
pub fn summarize(records: &[TransactionRecord]) -> TransactionSummary {
    let kinds = TransactionKind::ALL
        .iter()
        .map(|&kind| {
            let mut summary = KindSummary {
                kind,
                count: 0,
                credited: 0,
                debited: 0,
                net: 0,
            };
            for record in records.iter().filter(|r| r.kind == kind) {
                summary.count += 1;
                if record.amount >= 0 {
                    summary.credited += record.amount;
                } else {
                    summary.debited -= record.amount;
                }
            }
            summary.net = summary.credited - summary.debited;
            summary
        })
        .collect();

    TransactionSummary {
        kinds,
        total_records: records.len() as u64,
    }
}
