//! Stock and loyalty-point side effects of stand purchases
//!
//! The adapter never opens its own unit of work for purchases: it mutates the
//! rows the engine already locked, inside the engine's unit, so a stock failure
//! rolls back the debit that preceded it.

use crate::{
    config::{StandConfig, StockSelection},
    error::{Error, Result},
    storage::{Lock, Storage, UnitOfWork},
    types::{Account, AccountId, AccountKind, Stand, StockLine, StockLineId},
};

/// Account that receives activity points
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpendingAccount {
    /// Parent spending on their own behalf
    Parent(AccountId),
    /// Child spending their own tokens
    Child(AccountId),
}

impl SpendingAccount {
    /// Underlying account id
    pub fn id(&self) -> AccountId {
        match self {
            SpendingAccount::Parent(id) | SpendingAccount::Child(id) => *id,
        }
    }
}

/// Resolve the spender from the account kind tag
pub fn resolve_spending_account(account: &Account) -> Result<SpendingAccount> {
    match account.kind {
        AccountKind::Parent => Ok(SpendingAccount::Parent(account.id)),
        AccountKind::Child => Ok(SpendingAccount::Child(account.id)),
        AccountKind::User => Err(Error::UnresolvedAccount(account.id)),
    }
}

/// Applies stock decrements and activity points
#[derive(Debug, Clone)]
pub struct StockAdapter {
    selection: StockSelection,
    points_per_activity_unit: i64,
}

impl StockAdapter {
    /// Create from stand configuration
    pub fn new(config: &StandConfig) -> Self {
        Self {
            selection: config.stock_selection,
            points_per_activity_unit: config.points_per_activity_unit,
        }
    }

    /// Pick the stock line a purchase draws from
    pub fn select_line(&self, stand: &Stand, requested: Option<StockLineId>) -> Result<StockLineId> {
        let first = *stand.stock_lines.first().ok_or(Error::NoStock(stand.id))?;

        match (self.selection, requested) {
            (_, None) => Ok(first),
            (StockSelection::FirstLine, Some(line)) if line == first => Ok(first),
            (StockSelection::FirstLine, Some(line)) => Err(Error::Validation(format!(
                "Stand {} sells from its first stock line only, got line {}",
                stand.id, line
            ))),
            (StockSelection::ByProduct, Some(line)) if stand.stock_lines.contains(&line) => Ok(line),
            (StockSelection::ByProduct, Some(line)) => Err(Error::Validation(format!(
                "Stock line {} does not belong to stand {}",
                line, stand.id
            ))),
        }
    }

    /// Decrement stock and award activity points
    ///
    /// `line`, `stand` and `buyer` must be rows the caller locked in `uow`.
    /// The stock line is written here; the caller writes `stand` and `buyer`.
    /// Returns the points awarded.
    pub fn apply_purchase_effects(
        &self,
        uow: &UnitOfWork<'_>,
        stand: &mut Stand,
        line: &mut StockLine,
        buyer: &mut Account,
        quantity: i64,
    ) -> Result<i64> {
        if line.quantity < quantity {
            return Err(Error::StockExhausted {
                stock_line: line.id,
                requested: quantity,
                available: line.quantity,
            });
        }
        line.quantity -= quantity;
        uow.put_stock_line(line)?;

        if !stand.category.awards_points() {
            return Ok(0);
        }

        let spender = resolve_spending_account(buyer)?;
        let points = self
            .points_per_activity_unit
            .checked_mul(quantity)
            .ok_or_else(|| Error::Validation("Points overflow".to_string()))?;

        let accumulated = buyer
            .accumulated_points
            .checked_add(points)
            .ok_or_else(|| Error::Validation("Accumulated points overflow".to_string()))?;
        let awarded = stand
            .points_awarded
            .checked_add(points)
            .ok_or_else(|| Error::Validation("Stand points overflow".to_string()))?;
        buyer.accumulated_points = accumulated;
        stand.points_awarded = awarded;

        tracing::debug!(
            account_id = %spender.id(),
            stand_id = %stand.id,
            points,
            "Activity points awarded"
        );

        Ok(points)
    }
}

/// Restock or correct a stock line in its own unit of work
pub fn adjust_stock(storage: &Storage, line_id: StockLineId, delta: i64) -> Result<StockLine> {
    let line = storage.in_unit_of_work(|uow| {
        let mut line = uow.stock_line(line_id, Lock::Exclusive)?;
        let quantity = line
            .quantity
            .checked_add(delta)
            .ok_or_else(|| Error::Validation("Stock quantity overflow".to_string()))?;
        if quantity < 0 {
            return Err(Error::StockExhausted {
                stock_line: line.id,
                requested: -delta,
                available: line.quantity,
            });
        }
        line.quantity = quantity;
        uow.put_stock_line(&line)?;
        Ok(line)
    })?;

    tracing::info!(
        stock_line_id = %line.id,
        delta,
        quantity = line.quantity,
        "Stock adjusted"
    );

    Ok(line)
}
