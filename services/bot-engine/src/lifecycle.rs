//! Bot control surface: create, start, pause, resume, stop, config edits
//!
//! Every status write goes through [`Lifecycle::transition`]: pre-checks run
//! against the bot as read, then one conditional write re-verifies the
//! version (and, for START/RESUME, the kill switch).

use chrono::Utc;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::exchange::MarketDataProvider;
use crate::ids;
use crate::models::{Bot, BotStatus, NewBot};
use crate::observability::{metrics, Logger, MetricsCollector};
use crate::state_machine::{next_status, BotEvent, RunTarget, RunTargetPolicy, Transition};
use crate::store::{AutoCloseMark, BotStore, RunStart, StatusChange, StoreError};
use crate::strategy::{BasePriceType, GridConfig};

/// Extra fields written alongside a status change
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransitionNote {
    pub last_error: Option<String>,
    pub auto_close: Option<AutoCloseMark>,
}

impl TransitionNote {
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            last_error: Some(message.into()),
            auto_close: None,
        }
    }
}

#[derive(Clone)]
pub struct Lifecycle {
    store: Arc<dyn BotStore>,
    market: Arc<dyn MarketDataProvider>,
    policy: Arc<dyn RunTargetPolicy>,
    metrics: MetricsCollector,
}

impl Lifecycle {
    pub fn new(
        store: Arc<dyn BotStore>,
        market: Arc<dyn MarketDataProvider>,
        policy: Arc<dyn RunTargetPolicy>,
        metrics: MetricsCollector,
    ) -> Self {
        Self {
            store,
            market,
            policy,
            metrics,
        }
    }

    /// Create a DRAFT bot. At most one bot per (user, account, symbol) may be
    /// outside STOPPED/ERROR.
    pub async fn create_bot(&self, new: NewBot) -> Result<Bot> {
        GridConfig::from_json(&new.config)?;

        let existing = self.store.list_bots_for_user(new.user_id).await?;
        if let Some(active) = existing.iter().find(|b| {
            b.exchange_account_id == new.exchange_account_id
                && b.symbol == new.symbol
                && !matches!(b.status, BotStatus::Stopped | BotStatus::Error)
        }) {
            return Err(EngineError::ConfigValidation(format!(
                "bot {} already trades {} on this account",
                active.id, active.symbol
            )));
        }

        let bot = Bot::draft(new);
        self.store.insert_bot(&bot).await?;
        Logger::bot_event(bot.id, "created", &bot.symbol);
        Ok(bot)
    }

    pub async fn get_bot(&self, bot_id: Uuid) -> Result<Bot> {
        self.store
            .get_bot(bot_id)
            .await?
            .ok_or(EngineError::BotNotFound(bot_id))
    }

    pub async fn list_bots(&self, user_id: Uuid) -> Result<Vec<Bot>> {
        Ok(self.store.list_bots_for_user(user_id).await?)
    }

    pub async fn start(&self, bot_id: Uuid) -> Result<Bot> {
        self.dispatch(bot_id, BotEvent::Start).await
    }

    pub async fn pause(&self, bot_id: Uuid) -> Result<Bot> {
        self.dispatch(bot_id, BotEvent::Pause).await
    }

    pub async fn resume(&self, bot_id: Uuid) -> Result<Bot> {
        self.dispatch(bot_id, BotEvent::Resume).await
    }

    pub async fn stop(&self, bot_id: Uuid) -> Result<Bot> {
        self.dispatch(bot_id, BotEvent::Stop).await
    }

    /// Load the bot and apply `event`
    pub async fn dispatch(&self, bot_id: Uuid, event: BotEvent) -> Result<Bot> {
        let bot = self.get_bot(bot_id).await?;
        self.transition(&bot, event, TransitionNote::default()).await
    }

    /// Apply `event` to `bot` as read by the caller.
    ///
    /// Returns the bot after the write, or `bot` itself when the event was
    /// already satisfied. A stale `bot` fails with CONCURRENT_MODIFICATION.
    pub async fn transition(&self, bot: &Bot, event: BotEvent, note: TransitionNote) -> Result<Bot> {
        if event.enters_run() {
            let switch = self.store.get_kill_switch(bot.user_id).await?;
            if switch.enabled {
                return Err(EngineError::KillSwitchLocked(bot.user_id));
            }
        }

        // Validity and idempotency first; the placeholder target is never written
        let to = match next_status(bot.status, event, || RunTarget::Running)? {
            Transition::Unchanged => return Ok(bot.clone()),
            Transition::Move(to) => to,
        };

        let mut change = StatusChange::new(bot, to);
        change.last_error = note.last_error;
        change.auto_close = note.auto_close;
        if event.enters_run() {
            let (target, run) = self.prepare_run(bot).await?;
            change.to = target.into();
            change.run = Some(run);
            change.guard_kill_switch = true;
        }

        match self.store.apply_status_change(&change).await {
            Ok(updated) => {
                Logger::transition(bot.id, event, bot.status, updated.status, updated.status_version);
                self.metrics.increment(metrics::BOT_TRANSITIONS, 1).await;
                if updated.status == BotStatus::Error {
                    self.metrics.increment(metrics::BOT_ERRORS, 1).await;
                }
                Ok(updated)
            }
            Err(StoreError::VersionConflict { bot_id, expected }) => {
                warn!(
                    bot_id = %bot_id,
                    event = %event,
                    "status_version {} is stale",
                    expected
                );
                self.metrics.increment(metrics::BOT_TRANSITION_CONFLICTS, 1).await;
                Err(EngineError::ConcurrentModification(bot_id))
            }
            Err(StoreError::KillSwitchEnabled(user_id)) => Err(EngineError::KillSwitchLocked(user_id)),
            Err(e) => Err(e.into()),
        }
    }

    /// Move the bot to ERROR, recording `err` (which starts with its code)
    pub async fn fail(&self, bot: &Bot, err: &EngineError) -> Result<Bot> {
        warn!(bot_id = %bot.id, "Bot failed: {}", err);
        self.transition(bot, BotEvent::FatalError, TransitionNote::error(err.to_string()))
            .await
    }

    /// Replace the strategy config. Allowed in DRAFT, PAUSED, STOPPED, ERROR.
    pub async fn update_config(&self, bot_id: Uuid, config: serde_json::Value) -> Result<Bot> {
        let bot = self.get_bot(bot_id).await?;
        if !bot.status.allows_config_edit() {
            return Err(EngineError::ConfigValidation(format!(
                "config cannot be edited while {}",
                bot.status
            )));
        }
        GridConfig::from_json(&config)?;

        match self
            .store
            .update_config(bot.id, bot.status_version, &config)
            .await
        {
            Ok(updated) => {
                info!(
                    bot_id = %bot.id,
                    "Config updated to revision {}",
                    updated.config_revision
                );
                Ok(updated)
            }
            Err(StoreError::VersionConflict { bot_id, .. }) => {
                Err(EngineError::ConcurrentModification(bot_id))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Config checks and frozen values for entering a run
    async fn prepare_run(&self, bot: &Bot) -> Result<(RunTarget, RunStart)> {
        let config = GridConfig::from_json(&bot.config)?;
        let base_price = match config.base_price_type()? {
            BasePriceType::Fixed => config.base_price.ok_or_else(|| {
                EngineError::ConfigValidation("basePrice is required".to_string())
            })?,
            BasePriceType::Current => self.market.get_ticker(&bot.symbol).await?.last,
        };

        let run = RunStart {
            run_id: ids::new_run_id(),
            started_at: Utc::now(),
            base_price,
            reference_price: base_price,
        };
        Ok((self.policy.resolve(&config), run))
    }
}
