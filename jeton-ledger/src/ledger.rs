//! Main ledger orchestration layer
//!
//! This module ties together storage, the token engine, the draw engine and
//! the collaborators into a high-level async API.
//!
//! Operations are request-parallel: each one runs on a blocking worker inside
//! its own unit of work, and row locks serialize only the callers that touch
//! the same rows. Concurrency conflicts are retried with bounded backoff.
//! Notifications go out after commit.
//!
//! # Example
//!
//! ```no_run
//! use jeton_ledger::{AccountKind, Config, Ledger, StandCategory};
//!
//! #[tokio::main]
//! async fn main() -> jeton_ledger::Result<()> {
//!     let ledger = Ledger::open(Config::default()).await?;
//!
//!     let child = ledger.create_account("Lea", AccountKind::Child, 10).await?;
//!     let stand = ledger.create_stand("Crepes", StandCategory::Food).await?;
//!     ledger.add_stock_line(stand.id, "Crepe", 5, 2).await?;
//!
//!     let outcome = ledger.purchase_with_tokens(child.id, stand.id, 3, None).await?;
//!     assert_eq!(outcome.new_balance, 4);
//!
//!     ledger.shutdown().await
//! }
//! ```

use crate::{
    admin::Administration,
    draw::{DrawEngine, DrawReceipt},
    engine::{
        AdjustmentOutcome, ManualEntry, PurchaseOutcome, TicketPurchaseOutcome, TokenEngine,
        TokenPurchaseOutcome, TransferOutcome,
    },
    metrics::Metrics,
    notify::{ConnectionDirectory, DirectoryNotifier, NoopNotifier, Notification, Notifier},
    payment::{
        self, PaymentConfirmation, PaymentGateway, PaymentIntent, PaymentProvider, PaymentStatus,
    },
    query::LedgerQuery,
    retry::RetryPolicy,
    stock,
    types::{
        Account, AccountId, AccountKind, Prize, Stand, StandCategory, StandId, StockLine,
        StockLineId, TombolaId, Tombola, TransactionRecord,
    },
    Config, Error, Result, Storage,
};
use chrono::Utc;
use rand::{rngs::StdRng, SeedableRng};
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Instant;

/// Main ledger interface
#[derive(Debug)]
pub struct Ledger {
    /// Shared store
    storage: Arc<Storage>,

    /// Balance-mutating operations
    engine: Arc<TokenEngine>,

    /// Tombola draws
    draws: Arc<DrawEngine>,

    /// Registry operations
    admin: Arc<Administration>,

    /// Direct storage access (for reads)
    query: LedgerQuery,

    /// Live connections
    connections: Arc<ConnectionDirectory>,

    /// Post-commit delivery
    notifier: Arc<dyn Notifier>,

    /// Payment provider front (if a provider is set)
    payments: Option<PaymentGateway>,

    /// Conflict retry policy
    retry: RetryPolicy,

    /// Metrics
    metrics: Metrics,

    /// Configuration
    config: Config,
}

impl Ledger {
    /// Open ledger with configuration
    pub async fn open(config: Config) -> Result<Self> {
        config.validate()?;

        // Open storage
        let storage = Arc::new(Storage::open(&config)?);

        let metrics = Metrics::new()
            .map_err(|e| Error::Config(format!("Failed to create metrics: {}", e)))?;

        let connections = Arc::new(ConnectionDirectory::new(
            config.notifications.channel_capacity,
        ));
        let notifier: Arc<dyn Notifier> = if config.notifications.enabled {
            Arc::new(DirectoryNotifier::new(connections.clone()))
        } else {
            Arc::new(NoopNotifier)
        };

        let retry =
            RetryPolicy::new(&config.retry).with_conflict_counter(metrics.conflicts_retried.clone());

        tracing::info!(
            service = %config.service_name,
            version = %config.service_version,
            data_dir = ?config.data_dir,
            "Ledger opened"
        );

        Ok(Self {
            engine: Arc::new(TokenEngine::new(storage.clone(), &config)),
            draws: Arc::new(DrawEngine::new(storage.clone())),
            admin: Arc::new(Administration::new(storage.clone())),
            query: LedgerQuery::new(storage.clone()),
            storage,
            connections,
            notifier,
            payments: None,
            retry,
            metrics,
            config,
        })
    }

    /// Replace the notification collaborator
    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Enable token purchases through `provider`, charging in the configured currency
    pub fn with_payment_provider(mut self, provider: Arc<dyn PaymentProvider>) -> Self {
        self.payments = Some(PaymentGateway::new(
            provider,
            self.config.payments.currency.clone(),
        ));
        self
    }

    /// Run a blocking operation on a worker with conflict retry
    async fn execute<T, F>(&self, operation: &'static str, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnMut() -> Result<T> + Send + 'static,
    {
        let retry = self.retry.clone();
        let started = Instant::now();

        let result = match tokio::task::spawn_blocking(move || retry.run(operation, op)).await {
            Ok(result) => result,
            Err(e) => Err(Error::StoreUnavailable(format!("Ledger worker failed: {}", e))),
        };

        self.metrics
            .record_operation(operation, &result, started.elapsed());
        result
    }

    fn notify(&self, account: AccountId, notification: Notification) {
        self.notifier.deliver(account, &notification);
    }

    // Registry

    /// Create an account
    pub async fn create_account(
        &self,
        name: impl Into<String>,
        kind: AccountKind,
        opening_balance: i64,
    ) -> Result<Account> {
        let admin = self.admin.clone();
        let name = name.into();
        self.execute("create_account", move || {
            admin.create_account(&name, kind, opening_balance)
        })
        .await
    }

    /// Link a child to a parent
    pub async fn link_child(&self, parent: AccountId, child: AccountId) -> Result<(Account, Account)> {
        let admin = self.admin.clone();
        self.execute("link_child", move || admin.link_child(parent, child))
            .await
    }

    /// Create a stand
    pub async fn create_stand(&self, name: impl Into<String>, category: StandCategory) -> Result<Stand> {
        let admin = self.admin.clone();
        let name = name.into();
        self.execute("create_stand", move || admin.create_stand(&name, category))
            .await
    }

    /// Append a stock line to a stand
    pub async fn add_stock_line(
        &self,
        stand: StandId,
        product_name: impl Into<String>,
        quantity: i64,
        price_tokens: i64,
    ) -> Result<StockLine> {
        let admin = self.admin.clone();
        let product_name = product_name.into();
        self.execute("add_stock_line", move || {
            admin.add_stock_line(stand, &product_name, quantity, price_tokens)
        })
        .await
    }

    /// Restock or correct a stock line
    pub async fn adjust_stock(&self, line: StockLineId, delta: i64) -> Result<StockLine> {
        let storage = self.storage.clone();
        self.execute("adjust_stock", move || stock::adjust_stock(&storage, line, delta))
            .await
    }

    /// Create a tombola
    pub async fn create_tombola(&self, event_id: u64, name: impl Into<String>) -> Result<Tombola> {
        let admin = self.admin.clone();
        let name = name.into();
        self.execute("create_tombola", move || admin.create_tombola(event_id, &name))
            .await
    }

    /// Add a prize to a tombola
    pub async fn add_prize(
        &self,
        tombola: TombolaId,
        name: impl Into<String>,
        description: impl Into<String>,
        value: Decimal,
    ) -> Result<Prize> {
        let admin = self.admin.clone();
        let name = name.into();
        let description = description.into();
        self.execute("add_prize", move || {
            admin.add_prize(tombola, &name, &description, value)
        })
        .await
    }

    // Tokens

    /// Buy at a stand with tokens
    pub async fn purchase_with_tokens(
        &self,
        buyer: AccountId,
        stand: StandId,
        quantity: i64,
        stock_line: Option<StockLineId>,
    ) -> Result<PurchaseOutcome> {
        let engine = self.engine.clone();
        let outcome = self
            .execute("purchase_with_tokens", move || {
                engine.purchase_with_tokens(buyer, stand, quantity, stock_line)
            })
            .await?;

        self.notify(
            buyer,
            Notification::BalanceChanged {
                transaction_id: outcome.record.id,
                balance_tokens: outcome.new_balance,
            },
        );
        if outcome.points_awarded > 0 {
            self.notify(
                buyer,
                Notification::PointsAwarded {
                    stand_id: stand,
                    points: outcome.points_awarded,
                },
            );
        }

        Ok(outcome)
    }

    /// Credit tokens for a payment confirmed by the caller
    pub async fn buy_tokens(
        &self,
        account: AccountId,
        fiat_amount: Decimal,
        token_amount: i64,
        payment_ref: impl Into<String>,
    ) -> Result<TokenPurchaseOutcome> {
        let engine = self.engine.clone();
        let payment_ref = payment_ref.into();
        let outcome = self
            .execute("buy_tokens", move || {
                engine.buy_tokens(account, fiat_amount, token_amount, &payment_ref)
            })
            .await?;

        self.metrics.record_minted(token_amount);
        self.notify(
            account,
            Notification::BalanceChanged {
                transaction_id: outcome.record.id,
                balance_tokens: outcome.new_balance,
            },
        );

        Ok(outcome)
    }

    /// Start a token purchase with the payment provider
    ///
    /// The order is stored before the intent is returned, so its confirmation
    /// can be applied after a restart.
    pub async fn initiate_token_purchase(
        &self,
        account: AccountId,
        fiat_amount: Decimal,
        token_amount: i64,
    ) -> Result<PaymentIntent> {
        let gateway = self.gateway()?;

        let storage = self.storage.clone();
        self.execute("initiate_token_purchase", move || {
            storage.get_account(account).map(|_| ())
        })
        .await?;

        let (intent, order) = gateway.initiate(account, fiat_amount, token_amount).await?;

        let storage = self.storage.clone();
        let payment_ref = intent.payment_ref.clone();
        self.execute("record_token_order", move || {
            payment::record_order(&storage, &payment_ref, &order)
        })
        .await?;

        Ok(intent)
    }

    /// Apply a payment confirmation; tokens are credited on success only
    pub async fn confirm_payment(
        &self,
        confirmation: PaymentConfirmation,
    ) -> Result<Option<TokenPurchaseOutcome>> {
        self.gateway()?;
        let PaymentConfirmation {
            payment_ref,
            status,
        } = confirmation;

        match status {
            PaymentStatus::Failed => {
                let storage = self.storage.clone();
                self.execute("cancel_token_order", move || {
                    payment::cancel_order(&storage, &payment_ref)
                })
                .await?;
                Ok(None)
            }
            PaymentStatus::Succeeded => {
                let engine = self.engine.clone();
                let outcome = self
                    .execute("confirm_payment", move || {
                        engine.credit_token_order(&payment_ref)
                    })
                    .await?;

                self.metrics.record_minted(outcome.record.amount);
                self.notify(
                    outcome.record.account_id,
                    Notification::BalanceChanged {
                        transaction_id: outcome.record.id,
                        balance_tokens: outcome.new_balance,
                    },
                );
                Ok(Some(outcome))
            }
        }
    }

    /// Remove token orders older than the configured lifetime
    pub async fn expire_payment_orders(&self) -> Result<usize> {
        let storage = self.storage.clone();
        let ttl = chrono::Duration::seconds(self.config.payments.order_ttl_secs as i64);
        self.execute("expire_payment_orders", move || {
            payment::expire_orders(&storage, Utc::now() - ttl)
        })
        .await
    }

    fn gateway(&self) -> Result<&PaymentGateway> {
        self.payments
            .as_ref()
            .ok_or_else(|| Error::Config("No payment provider configured".to_string()))
    }

    /// Transfer tokens from a parent to their child
    pub async fn transfer_tokens(
        &self,
        parent: AccountId,
        child: AccountId,
        amount: i64,
    ) -> Result<TransferOutcome> {
        let engine = self.engine.clone();
        let outcome = self
            .execute("transfer_tokens", move || {
                engine.transfer_tokens(parent, child, amount)
            })
            .await?;

        self.notify(
            parent,
            Notification::BalanceChanged {
                transaction_id: outcome.record.id,
                balance_tokens: outcome.parent_balance,
            },
        );
        self.notify(
            child,
            Notification::TransferReceived {
                from_account_id: parent,
                amount,
                balance_tokens: outcome.child_balance,
            },
        );

        Ok(outcome)
    }

    /// Append a record-only manual entry
    pub async fn record_manual_transaction(&self, entry: ManualEntry) -> Result<TransactionRecord> {
        let engine = self.engine.clone();
        self.execute("record_manual_transaction", move || {
            engine.record_manual_transaction(entry.clone())
        })
        .await
    }

    /// Append a manual entry and apply it to the balance
    pub async fn post_manual_adjustment(&self, entry: ManualEntry) -> Result<AdjustmentOutcome> {
        let engine = self.engine.clone();
        let account = entry.account_id;
        let outcome = self
            .execute("post_manual_adjustment", move || {
                engine.post_manual_adjustment(entry.clone())
            })
            .await?;

        self.notify(
            account,
            Notification::BalanceChanged {
                transaction_id: outcome.record.id,
                balance_tokens: outcome.new_balance,
            },
        );

        Ok(outcome)
    }

    // Tombola

    /// Buy a raffle ticket
    pub async fn buy_ticket(&self, buyer: AccountId, tombola: TombolaId) -> Result<TicketPurchaseOutcome> {
        let engine = self.engine.clone();
        let outcome = self
            .execute("buy_ticket", move || engine.buy_ticket(buyer, tombola))
            .await?;

        self.notify(
            buyer,
            Notification::BalanceChanged {
                transaction_id: outcome.record.id,
                balance_tokens: outcome.new_balance,
            },
        );
        self.notify(
            buyer,
            Notification::TicketPurchased {
                tombola_id: tombola,
                ticket_id: outcome.ticket.id,
                serial_number: outcome.ticket.serial_number.clone(),
            },
        );

        Ok(outcome)
    }

    /// Draw the open prizes of a tombola
    pub async fn draw(&self, tombola: TombolaId) -> Result<DrawReceipt> {
        let draws = self.draws.clone();
        let receipt = self
            .execute("draw", move || draws.perform_draw(tombola))
            .await?;
        self.announce(&receipt);
        Ok(receipt)
    }

    /// Draw with a seeded RNG, for reproducible draws
    pub async fn draw_with_seed(&self, tombola: TombolaId, seed: u64) -> Result<DrawReceipt> {
        let draws = self.draws.clone();
        let receipt = self
            .execute("draw", move || {
                draws.perform_draw_with(tombola, &mut StdRng::seed_from_u64(seed))
            })
            .await?;
        self.announce(&receipt);
        Ok(receipt)
    }

    fn announce(&self, receipt: &DrawReceipt) {
        self.metrics.record_draw(receipt.winners.len());
        for winner in &receipt.winners {
            self.notify(
                winner.owner_account_id,
                Notification::PrizeWon {
                    tombola_id: winner.tombola_id,
                    prize_id: winner.prize_id,
                    ticket_id: winner.ticket_id,
                },
            );
        }
    }

    // Accessors

    /// Read-only queries
    pub fn query(&self) -> &LedgerQuery {
        &self.query
    }

    /// Live connection directory
    pub fn connections(&self) -> &Arc<ConnectionDirectory> {
        &self.connections
    }

    /// Metrics
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Shutdown ledger
    pub async fn shutdown(self) -> Result<()> {
        let Ledger {
            storage,
            engine,
            draws,
            admin,
            query,
            ..
        } = self;
        drop((engine, draws, admin, query));

        match Arc::try_unwrap(storage) {
            Ok(storage) => storage.close(),
            Err(_) => {
                tracing::warn!("Storage still in use at shutdown, leaving it to the last owner");
                Ok(())
            }
        }
    }
}
