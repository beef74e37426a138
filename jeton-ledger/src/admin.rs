//! Account, stand, tombola and prize registry
//!
//! Each call runs in its own unit of work.

use crate::{
    error::{Error, Result},
    storage::{Lock, Storage},
    types::{
        Account, AccountId, AccountKind, Prize, Stand, StandCategory, StandId, StockLine, Tombola,
        TombolaId,
    },
};
use chrono::Utc;
use rust_decimal::Decimal;
use std::sync::Arc;

/// Administrative registry
#[derive(Debug)]
pub struct Administration {
    storage: Arc<Storage>,
}

impl Administration {
    /// Create registry over `storage`
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }

    /// Create an account with an opening balance
    pub fn create_account(&self, name: &str, kind: AccountKind, opening_balance: i64) -> Result<Account> {
        require_name(name)?;
        if opening_balance < 0 {
            return Err(Error::Validation(
                "Opening balance must not be negative".to_string(),
            ));
        }

        let account = self.storage.in_unit_of_work(|uow| {
            let account = Account {
                id: uow.next_account_id()?,
                name: name.to_string(),
                balance_tokens: opening_balance,
                opening_balance,
                accumulated_points: 0,
                kind,
                parent: None,
                children: Vec::new(),
                created_at: Utc::now(),
            };
            uow.put_account(&account)?;
            Ok(account)
        })?;

        tracing::info!(
            account_id = %account.id,
            kind = %account.kind,
            opening_balance,
            "Account created"
        );

        Ok(account)
    }

    /// Link a child account to a parent account
    ///
    /// Linking a child to the parent it already has is a no-op.
    pub fn link_child(&self, parent_id: AccountId, child_id: AccountId) -> Result<(Account, Account)> {
        if parent_id == child_id {
            return Err(Error::Validation("An account cannot parent itself".to_string()));
        }

        let (parent, child) = self.storage.in_unit_of_work(|uow| {
            let (mut parent, mut child) = if parent_id < child_id {
                let parent = uow.account_for_update(parent_id)?;
                (parent, uow.account_for_update(child_id)?)
            } else {
                let child = uow.account_for_update(child_id)?;
                (uow.account_for_update(parent_id)?, child)
            };

            if parent.kind != AccountKind::Parent {
                return Err(Error::Validation(format!("Account {} is not a parent", parent_id)));
            }
            if child.kind != AccountKind::Child {
                return Err(Error::Validation(format!("Account {} is not a child", child_id)));
            }
            match child.parent {
                Some(existing) if existing == parent_id => return Ok((parent, child)),
                Some(existing) => {
                    return Err(Error::Validation(format!(
                        "Account {} is already linked to parent {}",
                        child_id, existing
                    )))
                }
                None => {}
            }

            child.parent = Some(parent_id);
            parent.children.push(child_id);
            uow.put_account(&parent)?;
            uow.put_account(&child)?;
            Ok((parent, child))
        })?;

        tracing::info!(parent_id = %parent_id, child_id = %child_id, "Child linked");
        Ok((parent, child))
    }

    /// Create a stand without stock
    pub fn create_stand(&self, name: &str, category: StandCategory) -> Result<Stand> {
        require_name(name)?;

        let stand = self.storage.in_unit_of_work(|uow| {
            let stand = Stand {
                id: uow.next_stand_id()?,
                name: name.to_string(),
                category,
                tokens_collected: 0,
                points_awarded: 0,
                stock_lines: Vec::new(),
            };
            uow.put_stand(&stand)?;
            Ok(stand)
        })?;

        tracing::info!(stand_id = %stand.id, category = %stand.category, "Stand created");
        Ok(stand)
    }

    /// Append a stock line to a stand
    pub fn add_stock_line(
        &self,
        stand_id: StandId,
        product_name: &str,
        quantity: i64,
        price_tokens: i64,
    ) -> Result<StockLine> {
        require_name(product_name)?;
        if quantity < 0 {
            return Err(Error::Validation("Quantity must not be negative".to_string()));
        }
        if price_tokens <= 0 {
            return Err(Error::Validation("Price must be positive".to_string()));
        }

        let line = self.storage.in_unit_of_work(|uow| {
            let mut stand = uow.stand_for_update(stand_id)?;
            let line = StockLine {
                id: uow.next_stock_line_id()?,
                stand_id,
                product_name: product_name.to_string(),
                quantity,
                price_tokens,
            };
            uow.put_stock_line(&line)?;
            stand.stock_lines.push(line.id);
            uow.put_stand(&stand)?;
            Ok(line)
        })?;

        tracing::info!(
            stand_id = %stand_id,
            stock_line_id = %line.id,
            quantity,
            price_tokens,
            "Stock line added"
        );
        Ok(line)
    }

    /// Create a tombola for an event
    pub fn create_tombola(&self, event_id: u64, name: &str) -> Result<Tombola> {
        require_name(name)?;

        let tombola = self.storage.in_unit_of_work(|uow| {
            let tombola = Tombola {
                id: uow.next_tombola_id()?,
                event_id,
                name: name.to_string(),
                tokens_collected: 0,
                prizes: Vec::new(),
                draw_count: 0,
            };
            uow.put_tombola(&tombola)?;
            Ok(tombola)
        })?;

        tracing::info!(tombola_id = %tombola.id, event_id, "Tombola created");
        Ok(tombola)
    }

    /// Append a prize to a tombola; prizes are drawn in insertion order
    pub fn add_prize(
        &self,
        tombola_id: TombolaId,
        name: &str,
        description: &str,
        value: Decimal,
    ) -> Result<Prize> {
        require_name(name)?;
        if value < Decimal::ZERO {
            return Err(Error::Validation("Prize value must not be negative".to_string()));
        }

        let prize = self.storage.in_unit_of_work(|uow| {
            let mut tombola = uow.tombola(tombola_id, Lock::Exclusive)?;
            let prize = Prize {
                id: uow.next_prize_id()?,
                tombola_id,
                name: name.to_string(),
                description: description.to_string(),
                value,
            };
            uow.put_prize(&prize)?;
            tombola.prizes.push(prize.id);
            uow.put_tombola(&tombola)?;
            Ok(prize)
        })?;

        tracing::info!(tombola_id = %tombola_id, prize_id = %prize.id, "Prize added");
        Ok(prize)
    }
}

fn require_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(Error::Validation("Name is required".to_string()));
    }
    Ok(())
}
