//! Persistent entities: bots, order intents, trades, snapshots, kill switches

use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Bot lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, sqlx::Type, Serialize, Deserialize)]
#[sqlx(type_name = "bot_status", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BotStatus {
    Draft,
    WaitingTrigger,
    Running,
    Paused,
    Stopping,
    Stopped,
    Error,
}

impl BotStatus {
    pub const ALL: [BotStatus; 7] = [
        BotStatus::Draft,
        BotStatus::WaitingTrigger,
        BotStatus::Running,
        BotStatus::Paused,
        BotStatus::Stopping,
        BotStatus::Stopped,
        BotStatus::Error,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BotStatus::Draft => "DRAFT",
            BotStatus::WaitingTrigger => "WAITING_TRIGGER",
            BotStatus::Running => "RUNNING",
            BotStatus::Paused => "PAUSED",
            BotStatus::Stopping => "STOPPING",
            BotStatus::Stopped => "STOPPED",
            BotStatus::Error => "ERROR",
        }
    }

    /// Statuses in which the trigger/order processor may place or submit orders
    pub fn is_trading(&self) -> bool {
        matches!(self, BotStatus::WaitingTrigger | BotStatus::Running)
    }

    /// Statuses that may still have open state on the exchange
    pub fn needs_reconcile(&self) -> bool {
        matches!(
            self,
            BotStatus::WaitingTrigger | BotStatus::Running | BotStatus::Paused | BotStatus::Stopping
        )
    }

    /// Statuses in which the strategy config may be edited
    pub fn allows_config_edit(&self) -> bool {
        matches!(
            self,
            BotStatus::Draft | BotStatus::Paused | BotStatus::Stopped | BotStatus::Error
        )
    }
}

impl std::fmt::Display for BotStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type, Serialize, Deserialize)]
#[sqlx(type_name = "order_side", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn opposite(&self) -> OrderSide {
        match self {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "BUY"),
            OrderSide::Sell => write!(f, "SELL"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type, Serialize, Deserialize)]
#[sqlx(type_name = "order_type", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderType {
    Limit,
    Market,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type, Serialize, Deserialize)]
#[sqlx(type_name = "order_status", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Canceled,
}

impl OrderStatus {
    /// NEW and PARTIALLY_FILLED orders count against the single in-flight slot
    pub fn is_open(&self) -> bool {
        matches!(self, OrderStatus::New | OrderStatus::PartiallyFilled)
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderStatus::New => write!(f, "NEW"),
            OrderStatus::PartiallyFilled => write!(f, "PARTIALLY_FILLED"),
            OrderStatus::Filled => write!(f, "FILLED"),
            OrderStatus::Canceled => write!(f, "CANCELED"),
        }
    }
}

/// Bot entity
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Bot {
    pub id: Uuid,
    pub user_id: Uuid,
    pub exchange_account_id: Uuid,
    pub symbol: String,
    pub status: BotStatus,
    /// Optimistic-lock token; bumped on every real status change
    pub status_version: i64,
    pub run_id: Option<Uuid>,
    pub last_error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub config: serde_json::Value,
    pub config_revision: i64,
    /// Grid anchor, frozen when the bot enters an active run
    pub base_price: Option<Decimal>,
    pub auto_close_reference_price: Option<Decimal>,
    pub auto_close_triggered_at: Option<DateTime<Utc>>,
    pub auto_close_reason: Option<String>,
    /// Last allocated intent sequence number
    pub intent_seq: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for creating a bot
#[derive(Debug, Clone, Deserialize)]
pub struct NewBot {
    pub user_id: Uuid,
    pub exchange_account_id: Uuid,
    pub symbol: String,
    pub config: serde_json::Value,
}

impl Bot {
    /// A fresh DRAFT bot
    pub fn draft(new: NewBot) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            user_id: new.user_id,
            exchange_account_id: new.exchange_account_id,
            symbol: new.symbol,
            status: BotStatus::Draft,
            status_version: 0,
            run_id: None,
            last_error: None,
            started_at: None,
            config: new.config,
            config_revision: 1,
            base_price: None,
            auto_close_reference_price: None,
            auto_close_triggered_at: None,
            auto_close_reason: None,
            intent_seq: 0,
            created_at: now,
            updated_at: now,
        }
    }
}

/// One order intent. `exchange_order_id`/`submitted_at` stay `None` until the
/// exchange accepts it; that pair is the outbox state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Order {
    pub id: Uuid,
    pub bot_id: Uuid,
    pub exchange: String,
    pub client_order_id: String,
    pub intent_seq: i64,
    pub exchange_order_id: Option<String>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub price: Decimal,
    pub amount: Decimal,
    pub filled_amount: Decimal,
    pub avg_fill_price: Option<Decimal>,
    pub status: OrderStatus,
    pub submit_attempts: i32,
    pub next_submit_at: Option<DateTime<Utc>>,
    pub last_submit_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    pub fn is_submitted(&self) -> bool {
        self.submitted_at.is_some()
    }
}

/// What the processor decided to place; the store turns it into an `Order`
#[derive(Debug, Clone, PartialEq)]
pub struct OrderDraft {
    pub side: OrderSide,
    pub order_type: OrderType,
    pub price: Decimal,
    pub amount: Decimal,
}

/// One exchange-reported fill
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Trade {
    pub bot_id: Uuid,
    pub exchange: String,
    pub trade_id: String,
    pub client_order_id: String,
    pub exchange_order_id: Option<String>,
    pub side: OrderSide,
    pub price: Decimal,
    pub amount: Decimal,
    pub fee: Decimal,
    pub fee_currency: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Point-in-time reconcile record, deduplicated by `state_hash`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BotSnapshot {
    pub id: Uuid,
    pub bot_id: Uuid,
    pub run_id: Option<Uuid>,
    pub reconciled_at: DateTime<Utc>,
    pub state_json: serde_json::Value,
    pub state_hash: String,
}

/// Per-user emergency stop flag
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KillSwitchState {
    pub user_id: Uuid,
    pub enabled: bool,
    pub reason: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl KillSwitchState {
    pub fn disabled(user_id: Uuid) -> Self {
        Self {
            user_id,
            enabled: false,
            reason: None,
            updated_at: None,
        }
    }
}

// Helper conversions between BigDecimal and Decimal
pub fn decimal_from_bigdecimal(bd: BigDecimal) -> Decimal {
    bd.to_string().parse().unwrap_or_default()
}

pub fn bigdecimal_from_decimal(d: Decimal) -> BigDecimal {
    d.to_string().parse().unwrap_or_default()
}
