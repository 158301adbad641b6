//! Engine error taxonomy and the codes surfaced to callers

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::exchange::{ExchangeError, ExchangeErrorKind};
use crate::models::BotStatus;
use crate::state_machine::{BotEvent, InvalidTransition};
use crate::store::StoreError;

/// Bot-domain error codes. Also embedded at the start of `bots.last_error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidStateTransition,
    ConcurrentModification,
    KillSwitchLocked,
    ConfigValidationError,
    BelowMinAmount,
    BelowMinNotional,
    OrderSubmitFailed,
    UnsupportedBasePriceType,
    ExchangeUnavailable,
    BotNotFound,
    StoreError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InvalidStateTransition => "INVALID_STATE_TRANSITION",
            ErrorCode::ConcurrentModification => "CONCURRENT_MODIFICATION",
            ErrorCode::KillSwitchLocked => "KILL_SWITCH_LOCKED",
            ErrorCode::ConfigValidationError => "CONFIG_VALIDATION_ERROR",
            ErrorCode::BelowMinAmount => "BELOW_MIN_AMOUNT",
            ErrorCode::BelowMinNotional => "BELOW_MIN_NOTIONAL",
            ErrorCode::OrderSubmitFailed => "ORDER_SUBMIT_FAILED",
            ErrorCode::UnsupportedBasePriceType => "UNSUPPORTED_BASE_PRICE_TYPE",
            ErrorCode::ExchangeUnavailable => "EXCHANGE_UNAVAILABLE",
            ErrorCode::BotNotFound => "BOT_NOT_FOUND",
            ErrorCode::StoreError => "STORE_ERROR",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("INVALID_STATE_TRANSITION: {event} is not allowed from {from}")]
    InvalidStateTransition { from: BotStatus, event: BotEvent },

    #[error("CONCURRENT_MODIFICATION: bot {0} changed since it was read, retry")]
    ConcurrentModification(Uuid),

    #[error("KILL_SWITCH_LOCKED: kill switch is enabled for user {0}")]
    KillSwitchLocked(Uuid),

    #[error("CONFIG_VALIDATION_ERROR: {0}")]
    ConfigValidation(String),

    #[error("UNSUPPORTED_BASE_PRICE_TYPE: {0}")]
    UnsupportedBasePriceType(String),

    #[error("BELOW_MIN_AMOUNT: amount {amount} is below exchange minimum {min}")]
    BelowMinAmount { amount: Decimal, min: Decimal },

    #[error("BELOW_MIN_NOTIONAL: notional {notional} is below exchange minimum {min}")]
    BelowMinNotional { notional: Decimal, min: Decimal },

    #[error("ORDER_SUBMIT_FAILED: {cause}: {message}")]
    OrderSubmitFailed {
        cause: ExchangeErrorKind,
        message: String,
    },

    #[error("EXCHANGE_UNAVAILABLE: {0}")]
    Exchange(#[from] ExchangeError),

    #[error("BOT_NOT_FOUND: {0}")]
    BotNotFound(Uuid),

    #[error("STORE_ERROR: {0}")]
    Store(#[from] StoreError),
}

impl EngineError {
    pub fn code(&self) -> ErrorCode {
        match self {
            EngineError::InvalidStateTransition { .. } => ErrorCode::InvalidStateTransition,
            EngineError::ConcurrentModification(_) => ErrorCode::ConcurrentModification,
            EngineError::KillSwitchLocked(_) => ErrorCode::KillSwitchLocked,
            EngineError::ConfigValidation(_) => ErrorCode::ConfigValidationError,
            EngineError::UnsupportedBasePriceType(_) => ErrorCode::UnsupportedBasePriceType,
            EngineError::BelowMinAmount { .. } => ErrorCode::BelowMinAmount,
            EngineError::BelowMinNotional { .. } => ErrorCode::BelowMinNotional,
            EngineError::OrderSubmitFailed { .. } => ErrorCode::OrderSubmitFailed,
            EngineError::Exchange(_) => ErrorCode::ExchangeUnavailable,
            EngineError::BotNotFound(_) => ErrorCode::BotNotFound,
            EngineError::Store(_) => ErrorCode::StoreError,
        }
    }
}

impl From<InvalidTransition> for EngineError {
    fn from(err: InvalidTransition) -> Self {
        EngineError::InvalidStateTransition {
            from: err.from,
            event: err.event,
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
