//! Bot lifecycle state machine
//!
//! Pure transition table; persistence and the kill-switch guard live in
//! [`crate::lifecycle`]. Every status write in the engine is decided here.
//!
//! ```text
//!  DRAFT --START--> (run target)            PAUSED --RESUME--> (run target)
//!  WAITING_TRIGGER --TRIGGER_HIT--> RUNNING
//!  WAITING_TRIGGER | RUNNING --PAUSE--> PAUSED
//!  WAITING_TRIGGER | RUNNING | PAUSED --STOP--> STOPPING --STOPPED_COMPLETE--> STOPPED
//!  any --RISK_TRIGGERED | KILL_SWITCH--> STOPPING
//!  any --FATAL_ERROR--> ERROR
//! ```

use serde::{Deserialize, Serialize};

use crate::models::BotStatus;
use crate::strategy::GridConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BotEvent {
    Start,
    TriggerHit,
    Pause,
    Resume,
    Stop,
    RiskTriggered,
    KillSwitch,
    FatalError,
    StoppedComplete,
}

impl BotEvent {
    pub const ALL: [BotEvent; 9] = [
        BotEvent::Start,
        BotEvent::TriggerHit,
        BotEvent::Pause,
        BotEvent::Resume,
        BotEvent::Stop,
        BotEvent::RiskTriggered,
        BotEvent::KillSwitch,
        BotEvent::FatalError,
        BotEvent::StoppedComplete,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BotEvent::Start => "START",
            BotEvent::TriggerHit => "TRIGGER_HIT",
            BotEvent::Pause => "PAUSE",
            BotEvent::Resume => "RESUME",
            BotEvent::Stop => "STOP",
            BotEvent::RiskTriggered => "RISK_TRIGGERED",
            BotEvent::KillSwitch => "KILL_SWITCH",
            BotEvent::FatalError => "FATAL_ERROR",
            BotEvent::StoppedComplete => "STOPPED_COMPLETE",
        }
    }

    /// Statuses in which this event is already satisfied
    pub fn already_there(&self) -> &'static [BotStatus] {
        match self {
            BotEvent::Start | BotEvent::Resume => &[BotStatus::Running, BotStatus::WaitingTrigger],
            BotEvent::Pause => &[BotStatus::Paused],
            BotEvent::Stop => &[BotStatus::Stopping, BotStatus::Stopped],
            _ => &[],
        }
    }

    /// START and RESUME enter an active run and are blocked by the kill switch
    pub fn enters_run(&self) -> bool {
        matches!(self, BotEvent::Start | BotEvent::Resume)
    }
}

impl std::fmt::Display for BotEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of applying an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Already in an accepted state; status_version must not change
    Unchanged,
    Move(BotStatus),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("INVALID_STATE_TRANSITION: {event} is not allowed from {from}")]
pub struct InvalidTransition {
    pub from: BotStatus,
    pub event: BotEvent,
}

/// Where START/RESUME land
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunTarget {
    Running,
    WaitingTrigger,
}

impl From<RunTarget> for BotStatus {
    fn from(target: RunTarget) -> Self {
        match target {
            RunTarget::Running => BotStatus::Running,
            RunTarget::WaitingTrigger => BotStatus::WaitingTrigger,
        }
    }
}

/// Decides the data-driven target of START/RESUME from a bot's config
pub trait RunTargetPolicy: Send + Sync {
    fn resolve(&self, config: &GridConfig) -> RunTarget;
}

/// Waits for a trigger when either side of the grid is armed
#[derive(Debug, Clone, Copy, Default)]
pub struct TriggerArmedPolicy;

impl RunTargetPolicy for TriggerArmedPolicy {
    fn resolve(&self, config: &GridConfig) -> RunTarget {
        if config.has_armed_trigger() {
            RunTarget::WaitingTrigger
        } else {
            RunTarget::Running
        }
    }
}

/// Apply `event` to a bot in `from`.
///
/// `run_target` is only consulted for START/RESUME that actually move.
pub fn next_status(
    from: BotStatus,
    event: BotEvent,
    run_target: impl FnOnce() -> RunTarget,
) -> Result<Transition, InvalidTransition> {
    if event.already_there().contains(&from) {
        return Ok(Transition::Unchanged);
    }

    let to = match (from, event) {
        (_, BotEvent::RiskTriggered) | (_, BotEvent::KillSwitch) => BotStatus::Stopping,
        (_, BotEvent::FatalError) => BotStatus::Error,
        (BotStatus::Draft, BotEvent::Start) | (BotStatus::Paused, BotEvent::Resume) => {
            run_target().into()
        }
        (BotStatus::WaitingTrigger, BotEvent::TriggerHit) => BotStatus::Running,
        (BotStatus::WaitingTrigger, BotEvent::Pause) | (BotStatus::Running, BotEvent::Pause) => {
            BotStatus::Paused
        }
        (BotStatus::WaitingTrigger, BotEvent::Stop)
        | (BotStatus::Running, BotEvent::Stop)
        | (BotStatus::Paused, BotEvent::Stop) => BotStatus::Stopping,
        (BotStatus::Stopping, BotEvent::StoppedComplete) => BotStatus::Stopped,
        _ => return Err(InvalidTransition { from, event }),
    };

    if to == from {
        Ok(Transition::Unchanged)
    } else {
        Ok(Transition::Move(to))
    }
}
