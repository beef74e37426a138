//! Ledger server binary

use anyhow::Context;
use jeton_ledger::{Config, Ledger};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config = match std::env::var("JETON_CONFIG") {
        Ok(path) => Config::from_file(&path)
            .with_context(|| format!("Failed to load config from {}", path))?,
        Err(_) => Config::from_env().context("Invalid JETON_* environment")?,
    };

    // Initialize tracing
    let filter = EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into());
    if config.json_logs {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    tracing::info!(
        service = %config.service_name,
        version = %config.service_version,
        "Starting jeton ledger"
    );

    let sweep_interval = Duration::from_secs(config.payments.sweep_interval_secs);

    // Open ledger
    let ledger = Arc::new(Ledger::open(config).await.context("Failed to open ledger")?);

    let totals = ledger.query().value_totals()?;
    if totals.is_conserved() {
        tracing::info!(
            balances = totals.account_balances,
            stands = totals.stand_tokens,
            tombolas = totals.tombola_tokens,
            minted = totals.tokens_minted,
            "Token totals conserved"
        );
    } else {
        tracing::error!(?totals, "Token totals do not balance");
    }

    // Expire abandoned token orders
    let sweeper = {
        let ledger = ledger.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(sweep_interval);
            loop {
                interval.tick().await;
                match ledger.expire_payment_orders().await {
                    Ok(0) => {}
                    Ok(expired) => tracing::info!(expired, "Expired token orders removed"),
                    Err(e) => tracing::warn!(error = %e, "Token order sweep failed"),
                }
            }
        })
    };

    tokio::signal::ctrl_c().await?;

    tracing::info!("Shutting down ledger");
    sweeper.abort();
    let _ = sweeper.await;

    tracing::debug!(metrics = %ledger.metrics().render(), "Final metrics");
    match Arc::try_unwrap(ledger) {
        Ok(ledger) => ledger.shutdown().await?,
        Err(_) => tracing::warn!("Ledger still shared at shutdown"),
    }
    Ok(())
}
