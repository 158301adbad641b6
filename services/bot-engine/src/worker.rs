//! Worker - periodic tick over every bot with exchange-side state
//!
//! Bots run in parallel, each bounded by a timeout so a stuck exchange call
//! only costs that bot its tick. Work for one bot stays sequential.

use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::WorkerSettings;
use crate::engine::{BotTickReport, Engine};
use crate::error::EngineError;
use crate::models::BotStatus;
use crate::observability::metrics;

/// Statuses the worker visits. ERROR bots are visited so an order left open
/// by a failed submit is still reconciled.
pub const ACTIVE_STATUSES: [BotStatus; 5] = [
    BotStatus::WaitingTrigger,
    BotStatus::Running,
    BotStatus::Paused,
    BotStatus::Stopping,
    BotStatus::Error,
];

/// Totals for one pass over all active bots
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PassSummary {
    pub bots: usize,
    pub completed: usize,
    pub failed: usize,
    pub timed_out: usize,
    pub reports: Vec<BotTickReport>,
}

pub struct Worker {
    engine: Engine,
    settings: WorkerSettings,
    permits: Arc<Semaphore>,
}

impl Worker {
    pub fn new(engine: Engine, settings: WorkerSettings) -> Self {
        let permits = Arc::new(Semaphore::new(settings.max_concurrent_bots.max(1)));
        Self {
            engine,
            settings,
            permits,
        }
    }

    /// Tick until `shutdown` resolves
    pub async fn run(self, shutdown: impl Future<Output = ()>) {
        info!(
            "Worker starting: tick every {:?}, up to {} bots in parallel",
            self.settings.tick_interval(),
            self.settings.max_concurrent_bots
        );

        let mut ticker = interval(self.settings.tick_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.run_once().await {
                        Ok(summary) => debug!(
                            "Pass done: {} bots, {} ok, {} failed, {} timed out",
                            summary.bots, summary.completed, summary.failed, summary.timed_out
                        ),
                        Err(e) => error!("Worker pass failed: {}", e),
                    }
                }
                _ = &mut shutdown => {
                    info!("Worker shutting down");
                    break;
                }
            }
        }
    }

    /// One pass over all active bots
    pub async fn run_once(&self) -> Result<PassSummary, EngineError> {
        let bots = self.engine.store().list_bots_in(&ACTIVE_STATUSES).await?;
        let engine_metrics = self.engine.metrics().clone();
        engine_metrics.increment(metrics::WORKER_TICKS, 1).await;
        engine_metrics
            .gauge(metrics::WORKER_ACTIVE_BOTS, bots.len() as f64)
            .await;

        let mut summary = PassSummary {
            bots: bots.len(),
            ..PassSummary::default()
        };
        let bot_timeout = self.settings.bot_timeout();
        let mut set = JoinSet::new();

        for bot in bots {
            let engine = self.engine.clone();
            let permits = self.permits.clone();
            set.spawn(async move {
                // The semaphore is never closed
                let _permit = permits.acquire_owned().await.ok();
                (bot.id, timeout(bot_timeout, engine.tick_bot(bot.id)).await)
            });
        }

        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((_, Ok(Ok(report)))) => {
                    summary.completed += 1;
                    summary.reports.push(report);
                }
                Ok((bot_id, Ok(Err(e)))) => {
                    warn!(bot_id = %bot_id, "Bot tick failed: {}", e);
                    summary.failed += 1;
                }
                Ok((bot_id, Err(_))) => {
                    warn!(bot_id = %bot_id, "Bot tick timed out after {:?}", bot_timeout);
                    engine_metrics.increment(metrics::WORKER_BOT_TIMEOUTS, 1).await;
                    summary.timed_out += 1;
                }
                Err(e) => {
                    error!("Bot tick task panicked: {}", e);
                    summary.failed += 1;
                }
            }
        }

        Ok(summary)
    }
}
