//! Payment collaborator for token purchases
//!
//! The provider integration is opaque: a payment intent is created, and later
//! a confirmation arrives for its reference. Only a `Succeeded` confirmation
//! credits tokens, and the credit happens outside any provider call.
//!
//! Orders between intent and confirmation live in the `payment_orders` column
//! family, so a confirmation arriving after a restart still finds its order.
//! Orders never confirmed are removed by [`expire_orders`].

use crate::{
    error::{Error, Result},
    storage::Storage,
    types::{AccountId, TokenOrder},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

/// Intent returned by the provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentIntent {
    /// Provider reference, credited at most once
    pub payment_ref: String,
    /// Secret handed to the paying client
    pub client_secret: String,
}

/// Outcome reported by the provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    /// Funds captured
    Succeeded,
    /// Payment declined or abandoned
    Failed,
}

/// Confirmation event for a payment reference
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentConfirmation {
    /// Reference from the intent
    pub payment_ref: String,
    /// Outcome
    pub status: PaymentStatus,
}

/// External payment provider
#[async_trait]
pub trait PaymentProvider: Send + Sync + std::fmt::Debug {
    /// Create a payment intent for `amount` in `currency`
    async fn create_intent(&self, amount: Decimal, currency: &str) -> Result<PaymentIntent>;
}

/// Provider for local runs and tests; every intent is accepted
#[derive(Debug, Default, Clone, Copy)]
pub struct OfflinePaymentProvider;

#[async_trait]
impl PaymentProvider for OfflinePaymentProvider {
    async fn create_intent(&self, amount: Decimal, currency: &str) -> Result<PaymentIntent> {
        let id = Uuid::new_v4().simple();
        tracing::debug!(amount = %amount, currency, "Offline payment intent created");
        Ok(PaymentIntent {
            payment_ref: format!("pi_{}", id),
            client_secret: format!("pi_{}_secret", id),
        })
    }
}

/// Provider front for token purchases
#[derive(Debug)]
pub struct PaymentGateway {
    provider: Arc<dyn PaymentProvider>,
    currency: String,
}

impl PaymentGateway {
    /// Create a gateway charging in `currency`
    pub fn new(provider: Arc<dyn PaymentProvider>, currency: impl Into<String>) -> Self {
        Self {
            provider,
            currency: currency.into(),
        }
    }

    /// Currency charged
    pub fn currency(&self) -> &str {
        &self.currency
    }

    /// Start a token purchase; returns the intent and the order to persist
    pub async fn initiate(
        &self,
        account_id: AccountId,
        fiat_amount: Decimal,
        token_amount: i64,
    ) -> Result<(PaymentIntent, TokenOrder)> {
        if fiat_amount <= Decimal::ZERO {
            return Err(Error::Validation("Fiat amount must be positive".to_string()));
        }
        if token_amount <= 0 {
            return Err(Error::Validation("Token amount must be positive".to_string()));
        }

        let intent = self.provider.create_intent(fiat_amount, &self.currency).await?;
        let order = TokenOrder {
            account_id,
            fiat_amount,
            token_amount,
            created_at: Utc::now(),
        };
        Ok((intent, order))
    }
}

/// Persist an order until its confirmation arrives
pub fn record_order(storage: &Storage, payment_ref: &str, order: &TokenOrder) -> Result<()> {
    if payment_ref.trim().is_empty() {
        return Err(Error::Validation("Payment reference is required".to_string()));
    }
    storage.in_unit_of_work(|uow| uow.put_payment_order(payment_ref, order))?;

    tracing::info!(
        account_id = %order.account_id,
        payment_ref,
        fiat_amount = %order.fiat_amount,
        token_amount = order.token_amount,
        "Token order pending"
    );
    Ok(())
}

/// Retire the order of a failed payment; nothing is credited
pub fn cancel_order(storage: &Storage, payment_ref: &str) -> Result<TokenOrder> {
    let order = storage
        .in_unit_of_work(|uow| uow.take_payment_order(payment_ref))?
        .ok_or_else(|| Error::Validation(format!("Unknown payment reference {}", payment_ref)))?;

    tracing::warn!(
        account_id = %order.account_id,
        payment_ref,
        "Payment failed, no tokens credited"
    );
    Ok(order)
}

/// Remove orders created before `cutoff`; returns how many were removed
pub fn expire_orders(storage: &Storage, cutoff: DateTime<Utc>) -> Result<usize> {
    let stale: Vec<String> = storage
        .pending_payment_orders()?
        .into_iter()
        .filter(|(_, order)| order.created_at < cutoff)
        .map(|(payment_ref, _)| payment_ref)
        .collect();
    if stale.is_empty() {
        return Ok(0);
    }

    let expired = storage.in_unit_of_work(|uow| {
        let mut expired = Vec::with_capacity(stale.len());
        for payment_ref in &stale {
            // A confirmation may have taken it since the scan
            if let Some(order) = uow.take_payment_order(payment_ref)? {
                expired.push((payment_ref, order));
            }
        }
        Ok(expired)
    })?;

    for (payment_ref, order) in &expired {
        tracing::warn!(
            account_id = %order.account_id,
            payment_ref = %payment_ref,
            created_at = %order.created_at,
            "Token order expired unconfirmed"
        );
    }
    Ok(expired.len())
}
