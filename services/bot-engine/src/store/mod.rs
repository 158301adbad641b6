//! Persistence contract for bots, order intents, trades, snapshots and kill
//! switches.
//!
//! Defined as a trait so the engine runs against PostgreSQL in production and
//! an in-process store in tests. Implementations must provide:
//! - unique (exchange, client_order_id) and (exchange, trade_id) keys
//! - status writes conditional on `status_version`
//! - multi-row writes inside one transaction

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::models::{
    Bot, BotSnapshot, BotStatus, KillSwitchState, Order, OrderDraft, OrderStatus, Trade,
};

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::{init_db, PgStore};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("bot {bot_id} is no longer at status_version {expected}")]
    VersionConflict { bot_id: Uuid, expected: i64 },

    #[error("kill switch is enabled for user {0}")]
    KillSwitchEnabled(Uuid),

    #[error("bot {0} already has an open order intent")]
    OrderInFlight(Uuid),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

/// Fields written when a bot enters an active run (START/RESUME)
#[derive(Debug, Clone, PartialEq)]
pub struct RunStart {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub base_price: Decimal,
    pub reference_price: Decimal,
}

/// Auto-close bookkeeping written with RISK_TRIGGERED
#[derive(Debug, Clone, PartialEq)]
pub struct AutoCloseMark {
    pub triggered_at: DateTime<Utc>,
    pub reason: String,
}

/// A CAS-guarded status write
#[derive(Debug, Clone, PartialEq)]
pub struct StatusChange {
    pub bot_id: Uuid,
    /// Write only if the row still carries this version
    pub expected_version: i64,
    pub to: BotStatus,
    /// Re-check the owner's kill switch inside the same transaction
    pub guard_kill_switch: bool,
    pub run: Option<RunStart>,
    pub last_error: Option<String>,
    pub auto_close: Option<AutoCloseMark>,
}

impl StatusChange {
    pub fn new(bot: &Bot, to: BotStatus) -> Self {
        Self {
            bot_id: bot.id,
            expected_version: bot.status_version,
            to,
            guard_kill_switch: false,
            run: None,
            last_error: None,
            auto_close: None,
        }
    }
}

/// Order fields reconcile is allowed to advance
#[derive(Debug, Clone, PartialEq)]
pub struct OrderProgress {
    pub order_id: Uuid,
    pub exchange_order_id: Option<String>,
    pub filled_amount: Decimal,
    pub avg_fill_price: Option<Decimal>,
    pub status: OrderStatus,
}

#[async_trait]
pub trait BotStore: Send + Sync {
    // -- bots ---------------------------------------------------------------

    async fn insert_bot(&self, bot: &Bot) -> Result<(), StoreError>;

    async fn get_bot(&self, bot_id: Uuid) -> Result<Option<Bot>, StoreError>;

    async fn list_bots_for_user(&self, user_id: Uuid) -> Result<Vec<Bot>, StoreError>;

    async fn list_bots_in(&self, statuses: &[BotStatus]) -> Result<Vec<Bot>, StoreError>;

    /// Conditional status write. Bumps `status_version` by one.
    ///
    /// Fails with `VersionConflict` if the version moved, and with
    /// `KillSwitchEnabled` if `guard_kill_switch` is set and the owner's switch
    /// is on, both without writing anything.
    async fn apply_status_change(&self, change: &StatusChange) -> Result<Bot, StoreError>;

    /// Replace the strategy config and bump `config_revision`, provided the
    /// status has not changed since `expected_version`. Leaves
    /// `status_version` untouched.
    async fn update_config(
        &self,
        bot_id: Uuid,
        expected_version: i64,
        config: &serde_json::Value,
    ) -> Result<Bot, StoreError>;

    // -- orders -------------------------------------------------------------

    /// Reserve the next intent sequence and write the NEW, un-submitted order
    /// in one transaction, provided the bot is still trading at
    /// `expected_version`.
    ///
    /// Fails with `VersionConflict` if the bot moved or left
    /// WAITING_TRIGGER/RUNNING, `KillSwitchEnabled` if the owner's switch is
    /// on, and `OrderInFlight` if the bot already has an open order. Nothing is
    /// written on failure.
    async fn create_order_intent(
        &self,
        bot_id: Uuid,
        expected_version: i64,
        exchange: &str,
        draft: &OrderDraft,
    ) -> Result<Order, StoreError>;

    /// Insert an order learned from the exchange that has no local row,
    /// keeping the bot's intent sequence ahead of it. Returns the existing row
    /// if one appeared concurrently.
    async fn insert_recovered_order(&self, order: &Order) -> Result<Order, StoreError>;

    async fn get_order(
        &self,
        exchange: &str,
        client_order_id: &str,
    ) -> Result<Option<Order>, StoreError>;

    async fn find_order_by_exchange_id(
        &self,
        exchange: &str,
        exchange_order_id: &str,
    ) -> Result<Option<Order>, StoreError>;

    /// The bot's single NEW/PARTIALLY_FILLED order, if any
    async fn open_order(&self, bot_id: Uuid) -> Result<Option<Order>, StoreError>;

    async fn list_orders(&self, bot_id: Uuid) -> Result<Vec<Order>, StoreError>;

    /// Most recent FILLED order by intent sequence
    async fn latest_filled_order(&self, bot_id: Uuid) -> Result<Option<Order>, StoreError>;

    /// Stamp the outbox entry as accepted by the exchange
    async fn mark_order_submitted(
        &self,
        order_id: Uuid,
        exchange_order_id: Option<&str>,
        submitted_at: DateTime<Utc>,
    ) -> Result<Order, StoreError>;

    async fn record_submit_failure(
        &self,
        order_id: Uuid,
        attempts: i32,
        next_submit_at: Option<DateTime<Utc>>,
        error: &str,
    ) -> Result<Order, StoreError>;

    async fn update_order_progress(&self, progress: &OrderProgress) -> Result<Order, StoreError>;

    // -- trades -------------------------------------------------------------

    /// Insert unless (exchange, trade_id) exists. Returns whether a row was
    /// written.
    async fn insert_trade(&self, trade: &Trade) -> Result<bool, StoreError>;

    async fn list_trades(&self, bot_id: Uuid) -> Result<Vec<Trade>, StoreError>;

    async fn list_trades_for_order(
        &self,
        exchange: &str,
        client_order_id: &str,
    ) -> Result<Vec<Trade>, StoreError>;

    // -- snapshots ----------------------------------------------------------

    async fn latest_snapshot(&self, bot_id: Uuid) -> Result<Option<BotSnapshot>, StoreError>;

    /// Write a snapshot tagged with the bot's current run id
    async fn insert_snapshot(
        &self,
        bot_id: Uuid,
        reconciled_at: DateTime<Utc>,
        state_json: &serde_json::Value,
        state_hash: &str,
    ) -> Result<BotSnapshot, StoreError>;

    async fn list_snapshots(&self, bot_id: Uuid) -> Result<Vec<BotSnapshot>, StoreError>;

    // -- kill switch --------------------------------------------------------

    async fn get_kill_switch(&self, user_id: Uuid) -> Result<KillSwitchState, StoreError>;

    /// Set the flag. Returns the new state and whether it actually changed.
    async fn set_kill_switch(
        &self,
        user_id: Uuid,
        enabled: bool,
        reason: Option<&str>,
    ) -> Result<(KillSwitchState, bool), StoreError>;
}
