//! Engine wiring and the per-bot tick
//!
//! [`Engine`] owns one executor, one store and the services built on them. It
//! is the bot-control surface operators call, and the unit of work the worker
//! schedules: [`Engine::tick_bot`] reconciles a bot and then either drains it
//! (STOPPING) or runs the order processor.

use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::Settings;
use crate::error::Result;
use crate::exchange::{ExchangeExecutor, MarketDataProvider};
use crate::ids;
use crate::kill_switch::{KillSwitch, KillSwitchOutcome};
use crate::lifecycle::{Lifecycle, TransitionNote};
use crate::models::{Bot, BotStatus, KillSwitchState, NewBot, OrderStatus};
use crate::observability::MetricsCollector;
use crate::processor::{OrderProcessor, RetryPolicy, TickOutcome};
use crate::reconciler::{ReconcileReport, Reconciler};
use crate::state_machine::{BotEvent, RunTargetPolicy, TriggerArmedPolicy};
use crate::store::{BotStore, OrderProgress};

/// What one bot tick did
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BotTickReport {
    pub bot_id: Uuid,
    pub reconcile: Option<ReconcileReport>,
    pub outcome: Option<TickOutcome>,
    pub orders_cancel_requested: usize,
    /// STOPPED_COMPLETE fired this tick
    pub stop_completed: bool,
}

#[derive(Clone)]
pub struct Engine {
    store: Arc<dyn BotStore>,
    executor: Arc<dyn ExchangeExecutor>,
    lifecycle: Lifecycle,
    processor: Arc<OrderProcessor>,
    reconciler: Arc<Reconciler>,
    kill_switch: Arc<KillSwitch>,
    metrics: MetricsCollector,
}

impl Engine {
    pub fn new(
        settings: &Settings,
        store: Arc<dyn BotStore>,
        executor: Arc<dyn ExchangeExecutor>,
        market: Arc<dyn MarketDataProvider>,
    ) -> Self {
        Self::with_policy(settings, store, executor, market, Arc::new(TriggerArmedPolicy))
    }

    pub fn with_policy(
        settings: &Settings,
        store: Arc<dyn BotStore>,
        executor: Arc<dyn ExchangeExecutor>,
        market: Arc<dyn MarketDataProvider>,
        policy: Arc<dyn RunTargetPolicy>,
    ) -> Self {
        let metrics = MetricsCollector::new();
        let lifecycle = Lifecycle::new(store.clone(), market.clone(), policy, metrics.clone());
        let processor = OrderProcessor::new(
            store.clone(),
            executor.clone(),
            market,
            lifecycle.clone(),
            RetryPolicy::from_settings(&settings.submit),
            metrics.clone(),
        )
        .with_fill_tolerance(settings.reconcile.fill_tolerance);
        let reconciler = Reconciler::new(
            store.clone(),
            executor.clone(),
            settings.reconcile.clone(),
            metrics.clone(),
        );
        let kill_switch = KillSwitch::new(
            store.clone(),
            lifecycle.clone(),
            settings.kill_switch.max_cas_retries,
            metrics.clone(),
        );

        Self {
            store,
            executor,
            lifecycle,
            processor: Arc::new(processor),
            reconciler: Arc::new(reconciler),
            kill_switch: Arc::new(kill_switch),
            metrics,
        }
    }

    pub fn store(&self) -> &Arc<dyn BotStore> {
        &self.store
    }

    pub fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    pub fn processor(&self) -> &OrderProcessor {
        &self.processor
    }

    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    pub fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }

    // -- bot-control surface ------------------------------------------------

    pub async fn create_bot(&self, new: NewBot) -> Result<Bot> {
        self.lifecycle.create_bot(new).await
    }

    pub async fn start(&self, bot_id: Uuid) -> Result<Bot> {
        self.lifecycle.start(bot_id).await
    }

    pub async fn pause(&self, bot_id: Uuid) -> Result<Bot> {
        self.lifecycle.pause(bot_id).await
    }

    pub async fn resume(&self, bot_id: Uuid) -> Result<Bot> {
        self.lifecycle.resume(bot_id).await
    }

    pub async fn stop(&self, bot_id: Uuid) -> Result<Bot> {
        self.lifecycle.stop(bot_id).await
    }

    pub async fn update_config(&self, bot_id: Uuid, config: serde_json::Value) -> Result<Bot> {
        self.lifecycle.update_config(bot_id, config).await
    }

    pub async fn enable_kill_switch(&self, user_id: Uuid, reason: &str) -> Result<KillSwitchOutcome> {
        self.kill_switch.enable(user_id, reason).await
    }

    pub async fn disable_kill_switch(&self, user_id: Uuid) -> Result<KillSwitchState> {
        self.kill_switch.disable(user_id).await
    }

    pub async fn kill_switch_status(&self, user_id: Uuid) -> Result<KillSwitchState> {
        self.kill_switch.status(user_id).await
    }

    // -- background work ----------------------------------------------------

    /// Reconcile the bot, then drain it if stopping or trade if active.
    /// A failed bot is only reconciled, and only while it holds an open order.
    pub async fn tick_bot(&self, bot_id: Uuid) -> Result<BotTickReport> {
        let bot = self.lifecycle.get_bot(bot_id).await?;
        let mut report = BotTickReport {
            bot_id,
            ..BotTickReport::default()
        };
        if bot.status == BotStatus::Error {
            // A submit that failed as UNKNOWN or TIMEOUT may still have landed
            if self.store.open_order(bot.id).await?.is_some() {
                report.reconcile = Some(self.reconciler.reconcile(&bot).await?);
            }
            return Ok(report);
        }
        if !bot.status.needs_reconcile() {
            return Ok(report);
        }

        if bot.status == BotStatus::Stopping {
            return self.drain(&bot, report).await;
        }

        report.reconcile = Some(self.reconciler.reconcile(&bot).await?);
        if bot.status.is_trading() {
            report.outcome = Some(self.processor.tick(&bot).await?);
        }
        Ok(report)
    }

    /// Cancel everything the bot has open; fire STOPPED_COMPLETE once
    /// reconcile shows nothing open
    async fn drain(&self, bot: &Bot, mut report: BotTickReport) -> Result<BotTickReport> {
        match self.executor.fetch_open_orders(&bot.symbol).await {
            Ok(remote) => {
                for order in remote.iter().filter(|o| {
                    o.client_order_id
                        .as_deref()
                        .map(|coid| ids::belongs_to(coid, bot.id))
                        .unwrap_or(false)
                }) {
                    match self
                        .executor
                        .cancel_order(&order.exchange_order_id, &bot.symbol)
                        .await
                    {
                        Ok(()) => report.orders_cancel_requested += 1,
                        Err(e) => warn!(
                            bot_id = %bot.id,
                            "Cancel of {} failed: {}",
                            order.exchange_order_id,
                            e
                        ),
                    }
                }
            }
            Err(e) => {
                warn!(bot_id = %bot.id, "Drain could not list open orders: {}", e);
                return Ok(report);
            }
        }

        // Intents that never reached the exchange are dropped
        for order in self.store.list_orders(bot.id).await? {
            if order.status.is_open() && !order.is_submitted() {
                self.store
                    .update_order_progress(&OrderProgress {
                        order_id: order.id,
                        exchange_order_id: None,
                        filled_amount: order.filled_amount,
                        avg_fill_price: order.avg_fill_price,
                        status: OrderStatus::Canceled,
                    })
                    .await?;
            }
        }

        let reconcile = self.reconciler.reconcile(bot).await?;
        let drained = reconcile.success && self.store.open_order(bot.id).await?.is_none();
        report.reconcile = Some(reconcile);

        if drained {
            self.lifecycle
                .transition(bot, BotEvent::StoppedComplete, TransitionNote::default())
                .await?;
            info!(bot_id = %bot.id, "Bot drained and stopped");
            report.stop_completed = true;
        }
        Ok(report)
    }
}
