//! Bot Engine Library
//!
//! Execution core for exchange trading bots: lifecycle state machine,
//! outbox-based order submission, reconciliation against the exchange and a
//! per-user kill switch.

pub mod config;
pub mod engine;
pub mod error;
pub mod exchange;
pub mod ids;
pub mod kill_switch;
pub mod lifecycle;
pub mod models;
pub mod observability;
pub mod paper;
pub mod processor;
pub mod reconciler;
pub mod risk;
pub mod state_machine;
pub mod store;
pub mod strategy;
pub mod worker;

// Re-export main types for convenience
pub use config::Settings;
pub use engine::{BotTickReport, Engine};
pub use error::{EngineError, ErrorCode, Result};
pub use exchange::{
    Balance, ExchangeError, ExchangeErrorKind, ExchangeExecutor, MarketDataProvider, MarketInfo,
    OrderRequest, PlacedOrder, RemoteOrder, RemoteTrade, Ticker,
};
pub use kill_switch::{KillSwitch, KillSwitchOutcome};
pub use lifecycle::{Lifecycle, TransitionNote};
pub use models::{
    Bot, BotSnapshot, BotStatus, KillSwitchState, NewBot, Order, OrderSide, OrderStatus,
    OrderType, Trade,
};
pub use paper::PaperExchange;
pub use processor::{OrderProcessor, RetryPolicy, TickOutcome};
pub use reconciler::{ReconcileReport, Reconciler};
pub use state_machine::{BotEvent, RunTarget, RunTargetPolicy, TriggerArmedPolicy};
pub use store::{BotStore, MemoryStore, PgStore, StoreError};
pub use strategy::GridConfig;
pub use worker::Worker;
