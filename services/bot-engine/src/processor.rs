//! Trigger/order processor
//!
//! One tick per active bot: risk guard, outbox recovery, trigger evaluation,
//! pre-submission gates, intent write, submission. The order row always exists
//! before the exchange hears about it, and an un-submitted row is resubmitted
//! under its original client order id rather than replaced. The intent is
//! only written while the bot is still trading at the version the tick read.

use chrono::{DateTime, Utc};
use rand::Rng;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::SubmitSettings;
use crate::error::{EngineError, ErrorCode, Result};
use crate::exchange::{ExchangeError, ExchangeExecutor, MarketDataProvider, OrderRequest};
use crate::lifecycle::{Lifecycle, TransitionNote};
use crate::models::{Bot, BotStatus, Order, OrderDraft, OrderType};
use crate::observability::{metrics, Logger, MetricsCollector};
use crate::risk;
use crate::state_machine::BotEvent;
use crate::store::{AutoCloseMark, BotStore, StoreError};
use crate::strategy::{evaluate_trigger, order_amount, round_price, Anchor, GridConfig};

/// Bounded exponential backoff with jitter
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total submission attempts before the bot is failed
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: Duration,
}

impl RetryPolicy {
    pub fn from_settings(settings: &SubmitSettings) -> Self {
        Self {
            max_attempts: settings.max_attempts.max(1),
            base_delay: Duration::from_millis(settings.base_delay_ms),
            max_delay: Duration::from_millis(settings.max_delay_ms),
            jitter: Duration::from_millis(settings.jitter_ms),
        }
    }

    /// Delay after the `failures`-th failed attempt. A server hint wins when
    /// it is longer; the result never exceeds `max_delay`.
    pub fn backoff(&self, failures: u32, hint: Option<Duration>) -> Duration {
        let exponent = failures.saturating_sub(1).min(16);
        let exp = self.base_delay.saturating_mul(1u32 << exponent);
        let jitter_ms = self.jitter.as_millis() as u64;
        let jitter = if jitter_ms > 0 {
            Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
        } else {
            Duration::ZERO
        };
        let delay = exp.saturating_add(jitter);
        delay.max(hint.unwrap_or(Duration::ZERO)).min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_settings(&SubmitSettings::default())
    }
}

/// What a tick did
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// Bot is not in WAITING_TRIGGER/RUNNING
    Inactive,
    /// The open order is on the exchange; waiting for reconcile
    AwaitingFill,
    /// The open order is un-submitted and its retry time has not come
    BackingOff,
    NoTrigger,
    /// Triggered leg priced outside [priceMin, priceMax]
    OutOfBounds,
    Submitted(Order),
    /// Retryable submit failure; the intent stays for the next tick
    SubmitDeferred { attempts: i32 },
    RiskStopped,
    /// The owner's kill switch was found on; KILL_SWITCH applied
    KillSwitched,
    /// The bot moved (command, kill switch, another tick) after it was read;
    /// nothing was written or sent
    Preempted,
    /// Bot moved to ERROR with this code
    Failed(ErrorCode),
}

pub struct OrderProcessor {
    store: Arc<dyn BotStore>,
    executor: Arc<dyn ExchangeExecutor>,
    market: Arc<dyn MarketDataProvider>,
    lifecycle: Lifecycle,
    retry: RetryPolicy,
    /// Fill shortfall below which a closed order counts as fully accounted for
    fill_tolerance: Decimal,
    metrics: MetricsCollector,
}

impl OrderProcessor {
    pub fn new(
        store: Arc<dyn BotStore>,
        executor: Arc<dyn ExchangeExecutor>,
        market: Arc<dyn MarketDataProvider>,
        lifecycle: Lifecycle,
        retry: RetryPolicy,
        metrics: MetricsCollector,
    ) -> Self {
        Self {
            store,
            executor,
            market,
            lifecycle,
            retry,
            fill_tolerance: Decimal::ZERO,
            metrics,
        }
    }

    pub fn with_fill_tolerance(mut self, tolerance: Decimal) -> Self {
        self.fill_tolerance = tolerance;
        self
    }

    /// Run one tick against the current ticker
    pub async fn tick(&self, bot: &Bot) -> Result<TickOutcome> {
        if !bot.status.is_trading() {
            return Ok(TickOutcome::Inactive);
        }
        let ticker = self.market.get_ticker(&bot.symbol).await?;
        self.tick_at(bot, ticker.last).await
    }

    /// Run one tick against a given price
    pub async fn tick_at(&self, bot: &Bot, price: Decimal) -> Result<TickOutcome> {
        if !bot.status.is_trading() {
            return Ok(TickOutcome::Inactive);
        }

        let config = match GridConfig::from_json(&bot.config) {
            Ok(config) => config,
            Err(e) => return self.fail(bot, e).await,
        };

        let switch = self.store.get_kill_switch(bot.user_id).await?;
        if switch.enabled {
            return self.kill(bot, switch.reason.as_deref().unwrap_or("enabled")).await;
        }

        if let Some(reason) = risk::check_auto_close(&config, bot.auto_close_reference_price, price) {
            return self.risk_stop(bot, reason).await;
        }

        if let Some(order) = self.store.open_order(bot.id).await? {
            if order.is_submitted() {
                return Ok(TickOutcome::AwaitingFill);
            }
            if order.next_submit_at.map(|at| at > Utc::now()).unwrap_or(false) {
                return Ok(TickOutcome::BackingOff);
            }
            if !self.still_trading(bot).await? {
                return Ok(TickOutcome::Preempted);
            }
            info!(
                bot_id = %bot.id,
                client_order_id = %order.client_order_id,
                "Resubmitting pending order intent"
            );
            return self.submit(bot, order).await;
        }

        if self.fills_unresolved(bot).await? {
            return Ok(TickOutcome::AwaitingFill);
        }

        let anchor = match self.store.latest_filled_order(bot.id).await? {
            Some(fill) => Anchor::Fill {
                side: fill.side,
                avg_price: fill.avg_fill_price.unwrap_or(fill.price),
            },
            None => match bot.base_price {
                Some(base) => Anchor::Base(base),
                None => {
                    let err = EngineError::ConfigValidation("no base price frozen for this run".to_string());
                    return self.fail(bot, err).await;
                }
            },
        };

        let leg = match evaluate_trigger(&config, anchor, price) {
            Ok(Some(leg)) => leg,
            Ok(None) => return Ok(TickOutcome::NoTrigger),
            Err(e) => return self.fail(bot, e).await,
        };

        // Market info failure aborts the tick without touching the bot
        let market = self.market.get_market_info(&bot.symbol).await?;

        let leg_price = round_price(leg.price, market.price_precision);
        if !config.within_bounds(leg_price) {
            debug!(bot_id = %bot.id, "Leg price {} outside bounds, skipping", leg_price);
            return Ok(TickOutcome::OutOfBounds);
        }

        let Some(amount) = order_amount(config.order_size, leg_price, market.amount_precision) else {
            let err = EngineError::ConfigValidation(format!(
                "orderSize at price {} overflows",
                leg_price
            ));
            return self.fail(bot, err).await;
        };
        if amount < market.min_amount {
            self.metrics.increment(metrics::ORDER_GATE_REJECTED, 1).await;
            let err = EngineError::BelowMinAmount {
                amount,
                min: market.min_amount,
            };
            return self.fail(bot, err).await;
        }
        let Some(notional) = amount.checked_mul(leg_price) else {
            let err = EngineError::ConfigValidation(format!(
                "notional of {} at {} overflows",
                amount, leg_price
            ));
            return self.fail(bot, err).await;
        };
        if notional < market.min_notional {
            self.metrics.increment(metrics::ORDER_GATE_REJECTED, 1).await;
            let err = EngineError::BelowMinNotional {
                notional,
                min: market.min_notional,
            };
            return self.fail(bot, err).await;
        }

        let draft = OrderDraft {
            side: leg.side,
            order_type: OrderType::Limit,
            price: leg_price,
            amount,
        };
        let order = match self
            .store
            .create_order_intent(bot.id, bot.status_version, self.executor.name(), &draft)
            .await
        {
            Ok(order) => order,
            // Another tick got there first
            Err(StoreError::OrderInFlight(_)) => return Ok(TickOutcome::AwaitingFill),
            Err(StoreError::VersionConflict { .. }) | Err(StoreError::KillSwitchEnabled(_)) => {
                info!(bot_id = %bot.id, "Bot moved during tick, no order placed");
                return Ok(TickOutcome::Preempted);
            }
            Err(e) => return Err(e.into()),
        };
        self.metrics.increment(metrics::ORDER_INTENTS, 1).await;
        Logger::order_event(
            bot.id,
            &order.client_order_id,
            "intent",
            &format!("{} {} @ {} (ticker {})", order.side, order.amount, order.price, price),
        );

        self.submit(bot, order).await
    }

    async fn submit(&self, bot: &Bot, order: Order) -> Result<TickOutcome> {
        let request = OrderRequest {
            symbol: bot.symbol.clone(),
            client_order_id: order.client_order_id.clone(),
            side: order.side,
            order_type: order.order_type,
            price: order.price,
            amount: order.amount,
        };

        let submitted = match self.executor.create_order(&request).await {
            Ok(placed) => {
                self.store
                    .mark_order_submitted(order.id, Some(&placed.exchange_order_id), placed.accepted_at)
                    .await?
            }
            Err(ExchangeError::DuplicateOrder(message)) => {
                // Already on the exchange; reconcile fills in the exchange id
                info!(
                    bot_id = %bot.id,
                    client_order_id = %order.client_order_id,
                    "Exchange already has this order: {}",
                    message
                );
                self.store
                    .mark_order_submitted(order.id, None, Utc::now())
                    .await?
            }
            Err(e) => return self.submit_failed(bot, &order, e).await,
        };

        self.metrics.increment(metrics::ORDER_SUBMITTED, 1).await;
        Logger::order_event(
            bot.id,
            &submitted.client_order_id,
            "submitted",
            submitted.exchange_order_id.as_deref().unwrap_or("-"),
        );

        if bot.status == BotStatus::WaitingTrigger {
            if let Err(e) = self
                .lifecycle
                .transition(bot, BotEvent::TriggerHit, TransitionNote::default())
                .await
            {
                // The order stands; the next tick sees the bot as it now is
                warn!(bot_id = %bot.id, "TRIGGER_HIT not applied: {}", e);
            }
        }

        Ok(TickOutcome::Submitted(submitted))
    }

    async fn submit_failed(&self, bot: &Bot, order: &Order, err: ExchangeError) -> Result<TickOutcome> {
        let attempts = order.submit_attempts + 1;
        let message = err.to_string();

        if err.is_retryable() && (attempts as u32) < self.retry.max_attempts {
            let delay = self.retry.backoff(attempts as u32, err.retry_after());
            let next_at = after(delay);
            self.store
                .record_submit_failure(order.id, attempts, Some(next_at), &message)
                .await?;
            self.metrics.increment(metrics::ORDER_SUBMIT_RETRIES, 1).await;
            warn!(
                bot_id = %bot.id,
                client_order_id = %order.client_order_id,
                "Submit attempt {} failed ({}), retrying in {:?}",
                attempts,
                message,
                delay
            );
            return Ok(TickOutcome::SubmitDeferred { attempts });
        }

        self.store
            .record_submit_failure(order.id, attempts, None, &message)
            .await?;
        self.metrics.increment(metrics::ORDER_SUBMIT_FAILED, 1).await;
        let detail = if err.is_retryable() {
            format!("gave up after {} attempts: {}", attempts, message)
        } else {
            message
        };
        let err = EngineError::OrderSubmitFailed {
            cause: err.kind(),
            message: detail,
        };
        self.fail(bot, err).await
    }

    async fn risk_stop(&self, bot: &Bot, reason: String) -> Result<TickOutcome> {
        warn!(bot_id = %bot.id, "Auto-close triggered: {}", reason);
        let note = TransitionNote {
            last_error: None,
            auto_close: Some(AutoCloseMark {
                triggered_at: Utc::now(),
                reason,
            }),
        };
        self.lifecycle
            .transition(bot, BotEvent::RiskTriggered, note)
            .await?;
        self.metrics.increment(metrics::RISK_TRIGGERED, 1).await;
        Ok(TickOutcome::RiskStopped)
    }

    /// Stop a bot whose owner's kill switch is on but which was not swept
    async fn kill(&self, bot: &Bot, reason: &str) -> Result<TickOutcome> {
        let note = TransitionNote::error(format!("KILL_SWITCH: {}", reason));
        match self
            .lifecycle
            .transition(bot, BotEvent::KillSwitch, note)
            .await
        {
            Ok(_) => {
                Logger::bot_event(bot.id, "kill_switch", reason);
                self.metrics.increment(metrics::KILL_SWITCH_BOTS_STOPPED, 1).await;
                Ok(TickOutcome::KillSwitched)
            }
            Err(EngineError::ConcurrentModification(_)) => Ok(TickOutcome::Preempted),
            Err(e) => Err(e),
        }
    }

    /// True if the bot is still at the version and trading status it was read with
    async fn still_trading(&self, bot: &Bot) -> Result<bool> {
        Ok(self
            .store
            .get_bot(bot.id)
            .await?
            .map(|current| {
                current.status_version == bot.status_version && current.status.is_trading()
            })
            .unwrap_or(false))
    }

    /// True if the latest closed order reports more fill than its recorded
    /// trades. The next leg waits until the trade feed catches up.
    async fn fills_unresolved(&self, bot: &Bot) -> Result<bool> {
        let orders = self.store.list_orders(bot.id).await?;
        let Some(last) = orders
            .iter()
            .filter(|o| !o.status.is_open() && o.filled_amount > Decimal::ZERO)
            .max_by_key(|o| o.intent_seq)
        else {
            return Ok(false);
        };
        let recorded: Decimal = self
            .store
            .list_trades_for_order(&last.exchange, &last.client_order_id)
            .await?
            .iter()
            .map(|t| t.amount)
            .sum();
        let unresolved = last.filled_amount - recorded > self.fill_tolerance;
        if unresolved {
            debug!(
                bot_id = %bot.id,
                client_order_id = %last.client_order_id,
                "Waiting for trades: filled {} recorded {}",
                last.filled_amount,
                recorded
            );
        }
        Ok(unresolved)
    }

    async fn fail(&self, bot: &Bot, err: EngineError) -> Result<TickOutcome> {
        let code = err.code();
        self.lifecycle.fail(bot, &err).await?;
        Ok(TickOutcome::Failed(code))
    }
}

fn after(delay: Duration) -> DateTime<Utc> {
    Utc::now() + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(jitter_ms: u64) -> RetryPolicy {
        RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            jitter: Duration::from_millis(jitter_ms),
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = policy(0);
        assert_eq!(policy.backoff(1, None), Duration::from_millis(100));
        assert_eq!(policy.backoff(2, None), Duration::from_millis(200));
        assert_eq!(policy.backoff(4, None), Duration::from_millis(800));
        assert_eq!(policy.backoff(10, None), Duration::from_secs(2));
        assert_eq!(policy.backoff(40, None), Duration::from_secs(2));
    }

    #[test]
    fn test_backoff_respects_retry_after() {
        let policy = policy(0);
        assert_eq!(
            policy.backoff(1, Some(Duration::from_millis(700))),
            Duration::from_millis(700)
        );
        assert_eq!(
            policy.backoff(3, Some(Duration::from_millis(10))),
            Duration::from_millis(400)
        );
        assert_eq!(
            policy.backoff(1, Some(Duration::from_secs(60))),
            Duration::from_secs(2)
        );
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let policy = policy(50);
        for _ in 0..100 {
            let delay = policy.backoff(1, None);
            assert!(delay >= Duration::from_millis(100));
            assert!(delay <= Duration::from_millis(150));
        }
    }
}
