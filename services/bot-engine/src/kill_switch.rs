//! Per-user emergency stop
//!
//! Enabling sets the persisted flag and sends KILL_SWITCH to every bot of the
//! user that is trading. The flag then blocks START/RESUME and new order
//! intents until disabled, and the order processor stops any trading bot it
//! finds under an enabled switch. Disabling resumes nothing.

use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::lifecycle::{Lifecycle, TransitionNote};
use crate::models::{BotStatus, KillSwitchState};
use crate::observability::{metrics, Logger, MetricsCollector};
use crate::state_machine::BotEvent;
use crate::store::BotStore;

/// Result of an enable call
#[derive(Debug, Clone, PartialEq)]
pub struct KillSwitchOutcome {
    pub state: KillSwitchState,
    /// Bots moved to STOPPING by this call
    pub affected_bots: usize,
}

pub struct KillSwitch {
    store: Arc<dyn BotStore>,
    lifecycle: Lifecycle,
    max_cas_retries: u32,
    metrics: MetricsCollector,
}

impl KillSwitch {
    pub fn new(
        store: Arc<dyn BotStore>,
        lifecycle: Lifecycle,
        max_cas_retries: u32,
        metrics: MetricsCollector,
    ) -> Self {
        Self {
            store,
            lifecycle,
            max_cas_retries,
            metrics,
        }
    }

    pub async fn status(&self, user_id: Uuid) -> Result<KillSwitchState> {
        Ok(self.store.get_kill_switch(user_id).await?)
    }

    /// Turn the switch on and stop the user's trading bots.
    ///
    /// Every call sweeps, so repeating it finishes a sweep an earlier call
    /// did not. One bot failing does not spare the rest; the first failure is
    /// returned once all were tried.
    pub async fn enable(&self, user_id: Uuid, reason: &str) -> Result<KillSwitchOutcome> {
        let (state, changed) = self
            .store
            .set_kill_switch(user_id, true, Some(reason))
            .await?;
        if changed {
            warn!(user_id = %user_id, "Kill switch enabled: {}", reason);
            self.metrics.increment(metrics::KILL_SWITCH_ENABLED, 1).await;
        }

        let mut affected_bots = 0;
        let mut first_error = None;
        for bot in self.store.list_bots_for_user(user_id).await? {
            match self.stop_bot(bot.id, reason).await {
                Ok(true) => affected_bots += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!(bot_id = %bot.id, "Kill switch could not stop bot: {}", e);
                    first_error.get_or_insert(e);
                }
            }
        }

        if affected_bots > 0 {
            self.metrics
                .increment(metrics::KILL_SWITCH_BOTS_STOPPED, affected_bots as u64)
                .await;
            info!(user_id = %user_id, "Kill switch stopped {} bots", affected_bots);
        }
        if let Some(e) = first_error {
            return Err(e);
        }
        Ok(KillSwitchOutcome {
            state,
            affected_bots,
        })
    }

    /// Turn the switch off. Bots stay where they are.
    pub async fn disable(&self, user_id: Uuid) -> Result<KillSwitchState> {
        let (state, changed) = self.store.set_kill_switch(user_id, false, None).await?;
        if changed {
            info!(user_id = %user_id, "Kill switch disabled");
        }
        Ok(state)
    }

    /// Send KILL_SWITCH to one bot if it is trading, re-reading on conflict.
    /// Returns true if this call moved it.
    async fn stop_bot(&self, bot_id: Uuid, reason: &str) -> Result<bool> {
        let note = TransitionNote::error(format!("KILL_SWITCH: {}", reason));
        let mut attempt = 0;
        loop {
            let Some(bot) = self.store.get_bot(bot_id).await? else {
                return Ok(false);
            };
            if !matches!(bot.status, BotStatus::Running | BotStatus::WaitingTrigger) {
                return Ok(false);
            }

            match self
                .lifecycle
                .transition(&bot, BotEvent::KillSwitch, note.clone())
                .await
            {
                Ok(_) => {
                    Logger::bot_event(bot_id, "kill_switch", reason);
                    return Ok(true);
                }
                Err(EngineError::ConcurrentModification(_)) if attempt < self.max_cas_retries => {
                    attempt += 1;
                }
                Err(EngineError::ConcurrentModification(_)) => {
                    warn!(bot_id = %bot_id, "Kill switch gave up after {} conflicts", attempt + 1);
                    return Err(EngineError::ConcurrentModification(bot_id));
                }
                Err(e) => return Err(e),
            }
        }
    }
}
