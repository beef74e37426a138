//! Metrics collection for observability
//!
//! Prometheus metrics on a private registry, one per ledger instance.
//!
//! # Metrics
//!
//! - `jeton_operations_total{operation,outcome}` - Operations by outcome (`ok` or error kind)
//! - `jeton_operation_duration_seconds{operation}` - Histogram of operation latencies
//! - `jeton_conflicts_retried_total` - Concurrency conflicts retried
//! - `jeton_tokens_minted_total` - Tokens credited from confirmed payments
//! - `jeton_draw_winners_total` - Prizes awarded by draws

use crate::error::Result as LedgerResult;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};
use std::sync::Arc;
use std::time::Duration;

/// Metrics collector
#[derive(Clone)]
pub struct Metrics {
    /// Operations by outcome
    pub operations_total: IntCounterVec,

    /// Operation duration histogram
    pub operation_duration: HistogramVec,

    /// Retried concurrency conflicts
    pub conflicts_retried: IntCounter,

    /// Tokens minted
    pub tokens_minted: IntCounter,

    /// Prizes awarded
    pub draw_winners: IntCounter,

    /// Prometheus registry
    pub registry: Arc<Registry>,
}

impl Metrics {
    /// Create new metrics collector
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let operations_total = IntCounterVec::new(
            Opts::new("jeton_operations_total", "Ledger operations by outcome"),
            &["operation", "outcome"],
        )?;
        registry.register(Box::new(operations_total.clone()))?;

        let operation_duration = HistogramVec::new(
            HistogramOpts::new(
                "jeton_operation_duration_seconds",
                "Histogram of operation latencies",
            )
            .buckets(vec![0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.0]),
            &["operation"],
        )?;
        registry.register(Box::new(operation_duration.clone()))?;

        let conflicts_retried = IntCounter::new(
            "jeton_conflicts_retried_total",
            "Concurrency conflicts retried",
        )?;
        registry.register(Box::new(conflicts_retried.clone()))?;

        let tokens_minted = IntCounter::new(
            "jeton_tokens_minted_total",
            "Tokens credited from confirmed payments",
        )?;
        registry.register(Box::new(tokens_minted.clone()))?;

        let draw_winners = IntCounter::new("jeton_draw_winners_total", "Prizes awarded by draws")?;
        registry.register(Box::new(draw_winners.clone()))?;

        Ok(Self {
            operations_total,
            operation_duration,
            conflicts_retried,
            tokens_minted,
            draw_winners,
            registry,
        })
    }

    /// Record the outcome and latency of an operation
    pub fn record_operation<T>(&self, operation: &str, result: &LedgerResult<T>, elapsed: Duration) {
        let outcome = match result {
            Ok(_) => "ok",
            Err(err) => err.kind().as_str(),
        };
        self.operations_total
            .with_label_values(&[operation, outcome])
            .inc();
        self.operation_duration
            .with_label_values(&[operation])
            .observe(elapsed.as_secs_f64());
    }

    /// Record minted tokens
    pub fn record_minted(&self, tokens: i64) {
        if tokens > 0 {
            self.tokens_minted.inc_by(tokens as u64);
        }
    }

    /// Record prizes awarded by a draw
    pub fn record_draw(&self, winners: usize) {
        self.draw_winners.inc_by(winners as u64);
    }

    /// Get metrics registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Text exposition of all metrics
    pub fn render(&self) -> String {
        let mut buffer = Vec::new();
        if let Err(err) = TextEncoder::new().encode(&self.registry.gather(), &mut buffer) {
            tracing::warn!(error = %err, "Failed to encode metrics");
        }
        String::from_utf8_lossy(&buffer).into_owned()
    }
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics")
            .field("conflicts_retried", &self.conflicts_retried.get())
            .field("tokens_minted", &self.tokens_minted.get())
            .field("draw_winners", &self.draw_winners.get())
            .finish_non_exhaustive()
    }
}
