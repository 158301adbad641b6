//! Observability: engine counters and structured bot logging

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::models::BotStatus;
use crate::state_machine::BotEvent;

/// Process-wide counters and gauges
#[derive(Clone)]
pub struct MetricsCollector {
    inner: Arc<RwLock<MetricsInner>>,
}

struct MetricsInner {
    counters: HashMap<String, u64>,
    gauges: HashMap<String, f64>,
    start_time: Instant,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(MetricsInner {
                counters: HashMap::new(),
                gauges: HashMap::new(),
                start_time: Instant::now(),
            })),
        }
    }

    /// Increment a counter
    pub async fn increment(&self, name: &str, value: u64) {
        let mut inner = self.inner.write().await;
        let counter = inner.counters.entry(name.to_string()).or_insert(0);
        *counter += value;
    }

    /// Set a gauge value
    pub async fn gauge(&self, name: &str, value: f64) {
        let mut inner = self.inner.write().await;
        inner.gauges.insert(name.to_string(), value);
    }

    pub async fn snapshot(&self) -> MetricsSnapshot {
        let inner = self.inner.read().await;
        MetricsSnapshot {
            counters: inner.counters.clone(),
            gauges: inner.gauges.clone(),
            uptime_secs: inner.start_time.elapsed().as_secs(),
        }
    }

    pub async fn get_counter(&self, name: &str) -> u64 {
        let inner = self.inner.read().await;
        inner.counters.get(name).copied().unwrap_or(0)
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct MetricsSnapshot {
    pub counters: HashMap<String, u64>,
    pub gauges: HashMap<String, f64>,
    pub uptime_secs: u64,
}

/// Structured logger for consistent bot log lines
pub struct Logger;

impl Logger {
    /// A status change written by the state machine
    pub fn transition(bot_id: Uuid, event: BotEvent, from: BotStatus, to: BotStatus, version: i64) {
        tracing::info!(
            bot_id = %bot_id,
            event = %event,
            from = %from,
            to = %to,
            status_version = version,
            "bot_transition"
        );
    }

    /// Anything else worth a line in a bot's history
    pub fn bot_event(bot_id: Uuid, event_type: &str, details: &str) {
        tracing::info!(
            bot_id = %bot_id,
            event_type = %event_type,
            details = %details,
            "bot_event"
        );
    }

    pub fn order_event(bot_id: Uuid, client_order_id: &str, action: &str, details: &str) {
        tracing::info!(
            bot_id = %bot_id,
            client_order_id = %client_order_id,
            action = %action,
            details = %details,
            "order_event"
        );
    }
}

/// Predefined metric names
pub mod metrics {
    // Lifecycle
    pub const BOT_TRANSITIONS: &str = "bot_transitions_total";
    pub const BOT_TRANSITION_CONFLICTS: &str = "bot_transition_conflicts_total";
    pub const BOT_ERRORS: &str = "bot_errors_total";

    // Orders
    pub const ORDER_INTENTS: &str = "order_intents_total";
    pub const ORDER_SUBMITTED: &str = "order_submitted_total";
    pub const ORDER_SUBMIT_RETRIES: &str = "order_submit_retries_total";
    pub const ORDER_SUBMIT_FAILED: &str = "order_submit_failed_total";
    pub const ORDER_GATE_REJECTED: &str = "order_gate_rejected_total";
    pub const ORDER_CANCELED: &str = "order_canceled_total";

    // Reconcile
    pub const RECONCILE_RUNS: &str = "reconcile_runs_total";
    pub const RECONCILE_FAILURES: &str = "reconcile_failures_total";
    pub const TRADES_INGESTED: &str = "trades_ingested_total";
    pub const SNAPSHOTS_WRITTEN: &str = "snapshots_written_total";

    // Risk and kill switch
    pub const RISK_TRIGGERED: &str = "risk_triggered_total";
    pub const KILL_SWITCH_ENABLED: &str = "kill_switch_enabled_total";
    pub const KILL_SWITCH_BOTS_STOPPED: &str = "kill_switch_bots_stopped_total";

    // Worker
    pub const WORKER_TICKS: &str = "worker_ticks_total";
    pub const WORKER_BOT_TIMEOUTS: &str = "worker_bot_timeouts_total";
    pub const WORKER_ACTIVE_BOTS: &str = "worker_active_bots";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_counters_accumulate() {
        let collector = MetricsCollector::new();
        collector.increment(metrics::ORDER_SUBMITTED, 1).await;
        collector.increment(metrics::ORDER_SUBMITTED, 2).await;
        collector.gauge(metrics::WORKER_ACTIVE_BOTS, 4.0).await;

        assert_eq!(collector.get_counter(metrics::ORDER_SUBMITTED).await, 3);
        assert_eq!(collector.get_counter(metrics::RECONCILE_RUNS).await, 0);
        let snapshot = collector.snapshot().await;
        assert_eq!(snapshot.gauges.get(metrics::WORKER_ACTIVE_BOTS), Some(&4.0));
    }
}
