//! PostgreSQL store
//!
//! Status writes are a single conditional UPDATE; the affected-row count is
//! the CAS result. The kill-switch guard is evaluated in the same statement.

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgPoolOptions, FromRow, Pool, Postgres};
use std::time::Duration;
use uuid::Uuid;

use super::{BotStore, OrderProgress, StatusChange, StoreError};
use crate::ids;
use crate::models::{
    bigdecimal_from_decimal, decimal_from_bigdecimal, Bot, BotSnapshot, BotStatus,
    KillSwitchState, Order, OrderDraft, OrderSide, OrderStatus, OrderType, Trade,
};

pub type Db = Pool<Postgres>;

/// Partial unique index allowing one NEW/PARTIALLY_FILLED order per bot
const ONE_OPEN_ORDER_INDEX: &str = "orders_one_open_per_bot";

pub async fn init_db(database_url: &str, max_connections: u32) -> Result<Db, StoreError> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(3))
        .connect(database_url)
        .await?;

    Ok(pool)
}

#[derive(Clone)]
pub struct PgStore {
    db: Db,
}

impl PgStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.db).await?;
        Ok(())
    }
}

#[derive(FromRow)]
struct BotRow {
    id: Uuid,
    user_id: Uuid,
    exchange_account_id: Uuid,
    symbol: String,
    status: BotStatus,
    status_version: i64,
    run_id: Option<Uuid>,
    last_error: Option<String>,
    started_at: Option<DateTime<Utc>>,
    config: serde_json::Value,
    config_revision: i64,
    base_price: Option<BigDecimal>,
    auto_close_reference_price: Option<BigDecimal>,
    auto_close_triggered_at: Option<DateTime<Utc>>,
    auto_close_reason: Option<String>,
    intent_seq: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<BotRow> for Bot {
    fn from(row: BotRow) -> Self {
        Bot {
            id: row.id,
            user_id: row.user_id,
            exchange_account_id: row.exchange_account_id,
            symbol: row.symbol,
            status: row.status,
            status_version: row.status_version,
            run_id: row.run_id,
            last_error: row.last_error,
            started_at: row.started_at,
            config: row.config,
            config_revision: row.config_revision,
            base_price: row.base_price.map(decimal_from_bigdecimal),
            auto_close_reference_price: row.auto_close_reference_price.map(decimal_from_bigdecimal),
            auto_close_triggered_at: row.auto_close_triggered_at,
            auto_close_reason: row.auto_close_reason,
            intent_seq: row.intent_seq,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(FromRow)]
struct OrderRow {
    id: Uuid,
    bot_id: Uuid,
    exchange: String,
    client_order_id: String,
    intent_seq: i64,
    exchange_order_id: Option<String>,
    submitted_at: Option<DateTime<Utc>>,
    side: OrderSide,
    order_type: OrderType,
    price: BigDecimal,
    amount: BigDecimal,
    filled_amount: BigDecimal,
    avg_fill_price: Option<BigDecimal>,
    status: OrderStatus,
    submit_attempts: i32,
    next_submit_at: Option<DateTime<Utc>>,
    last_submit_error: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<OrderRow> for Order {
    fn from(row: OrderRow) -> Self {
        Order {
            id: row.id,
            bot_id: row.bot_id,
            exchange: row.exchange,
            client_order_id: row.client_order_id,
            intent_seq: row.intent_seq,
            exchange_order_id: row.exchange_order_id,
            submitted_at: row.submitted_at,
            side: row.side,
            order_type: row.order_type,
            price: decimal_from_bigdecimal(row.price),
            amount: decimal_from_bigdecimal(row.amount),
            filled_amount: decimal_from_bigdecimal(row.filled_amount),
            avg_fill_price: row.avg_fill_price.map(decimal_from_bigdecimal),
            status: row.status,
            submit_attempts: row.submit_attempts,
            next_submit_at: row.next_submit_at,
            last_submit_error: row.last_submit_error,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(FromRow)]
struct TradeRow {
    bot_id: Uuid,
    exchange: String,
    trade_id: String,
    client_order_id: String,
    exchange_order_id: Option<String>,
    side: OrderSide,
    price: BigDecimal,
    amount: BigDecimal,
    fee: BigDecimal,
    fee_currency: Option<String>,
    timestamp: DateTime<Utc>,
}

impl From<TradeRow> for Trade {
    fn from(row: TradeRow) -> Self {
        Trade {
            bot_id: row.bot_id,
            exchange: row.exchange,
            trade_id: row.trade_id,
            client_order_id: row.client_order_id,
            exchange_order_id: row.exchange_order_id,
            side: row.side,
            price: decimal_from_bigdecimal(row.price),
            amount: decimal_from_bigdecimal(row.amount),
            fee: decimal_from_bigdecimal(row.fee),
            fee_currency: row.fee_currency,
            timestamp: row.timestamp,
        }
    }
}

#[derive(FromRow)]
struct SnapshotRow {
    id: Uuid,
    bot_id: Uuid,
    run_id: Option<Uuid>,
    reconciled_at: DateTime<Utc>,
    state_json: serde_json::Value,
    state_hash: String,
}

impl From<SnapshotRow> for BotSnapshot {
    fn from(row: SnapshotRow) -> Self {
        BotSnapshot {
            id: row.id,
            bot_id: row.bot_id,
            run_id: row.run_id,
            reconciled_at: row.reconciled_at,
            state_json: row.state_json,
            state_hash: row.state_hash,
        }
    }
}

#[derive(FromRow)]
struct KillSwitchRow {
    user_id: Uuid,
    enabled: bool,
    reason: Option<String>,
    updated_at: Option<DateTime<Utc>>,
}

impl From<KillSwitchRow> for KillSwitchState {
    fn from(row: KillSwitchRow) -> Self {
        KillSwitchState {
            user_id: row.user_id,
            enabled: row.enabled,
            reason: row.reason,
            updated_at: row.updated_at,
        }
    }
}

fn violates(err: &sqlx::Error, constraint: &str) -> bool {
    match err {
        sqlx::Error::Database(db) => db.constraint() == Some(constraint),
        _ => false,
    }
}

#[async_trait]
impl BotStore for PgStore {
    async fn insert_bot(&self, bot: &Bot) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO bots (id, user_id, exchange_account_id, symbol, status, status_version,
                run_id, last_error, started_at, config, config_revision, base_price,
                auto_close_reference_price, auto_close_triggered_at, auto_close_reason,
                intent_seq, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)",
        )
        .bind(bot.id)
        .bind(bot.user_id)
        .bind(bot.exchange_account_id)
        .bind(&bot.symbol)
        .bind(bot.status)
        .bind(bot.status_version)
        .bind(bot.run_id)
        .bind(&bot.last_error)
        .bind(bot.started_at)
        .bind(&bot.config)
        .bind(bot.config_revision)
        .bind(bot.base_price.map(bigdecimal_from_decimal))
        .bind(bot.auto_close_reference_price.map(bigdecimal_from_decimal))
        .bind(bot.auto_close_triggered_at)
        .bind(&bot.auto_close_reason)
        .bind(bot.intent_seq)
        .bind(bot.created_at)
        .bind(bot.updated_at)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn get_bot(&self, bot_id: Uuid) -> Result<Option<Bot>, StoreError> {
        let row = sqlx::query_as::<_, BotRow>("SELECT * FROM bots WHERE id = $1")
            .bind(bot_id)
            .fetch_optional(&self.db)
            .await?;
        Ok(row.map(Bot::from))
    }

    async fn list_bots_for_user(&self, user_id: Uuid) -> Result<Vec<Bot>, StoreError> {
        let rows = sqlx::query_as::<_, BotRow>(
            "SELECT * FROM bots WHERE user_id = $1 ORDER BY created_at",
        )
        .bind(user_id)
        .fetch_all(&self.db)
        .await?;
        Ok(rows.into_iter().map(Bot::from).collect())
    }

    async fn list_bots_in(&self, statuses: &[BotStatus]) -> Result<Vec<Bot>, StoreError> {
        let names: Vec<String> = statuses.iter().map(|s| s.as_str().to_string()).collect();
        let rows = sqlx::query_as::<_, BotRow>(
            "SELECT * FROM bots WHERE status::text = ANY($1) ORDER BY created_at",
        )
        .bind(names)
        .fetch_all(&self.db)
        .await?;
        Ok(rows.into_iter().map(Bot::from).collect())
    }

    async fn apply_status_change(&self, change: &StatusChange) -> Result<Bot, StoreError> {
        let run = change.run.as_ref();
        let row = sqlx::query_as::<_, BotRow>(
            "UPDATE bots SET
                status = $3,
                status_version = status_version + 1,
                run_id = CASE WHEN $5 THEN $6 ELSE run_id END,
                started_at = CASE WHEN $5 THEN $7 ELSE started_at END,
                base_price = CASE WHEN $5 THEN $8 ELSE base_price END,
                auto_close_reference_price = CASE WHEN $5 THEN $9 ELSE auto_close_reference_price END,
                auto_close_triggered_at = CASE WHEN $5 THEN NULL
                    ELSE COALESCE($11, auto_close_triggered_at) END,
                auto_close_reason = CASE WHEN $5 THEN NULL
                    ELSE COALESCE($12, auto_close_reason) END,
                last_error = COALESCE($10, last_error),
                updated_at = NOW()
             WHERE id = $1 AND status_version = $2
               AND NOT ($4 AND EXISTS (
                   SELECT 1 FROM kill_switches k WHERE k.user_id = bots.user_id AND k.enabled))
             RETURNING *",
        )
        .bind(change.bot_id)
        .bind(change.expected_version)
        .bind(change.to)
        .bind(change.guard_kill_switch)
        .bind(run.is_some())
        .bind(run.map(|r| r.run_id))
        .bind(run.map(|r| r.started_at))
        .bind(run.map(|r| bigdecimal_from_decimal(r.base_price)))
        .bind(run.map(|r| bigdecimal_from_decimal(r.reference_price)))
        .bind(&change.last_error)
        .bind(change.auto_close.as_ref().map(|m| m.triggered_at))
        .bind(change.auto_close.as_ref().map(|m| m.reason.clone()))
        .fetch_optional(&self.db)
        .await?;

        if let Some(row) = row {
            return Ok(row.into());
        }

        // Nothing written; work out which guard failed
        let current = self
            .get_bot(change.bot_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("bot {}", change.bot_id)))?;
        if current.status_version != change.expected_version {
            return Err(StoreError::VersionConflict {
                bot_id: change.bot_id,
                expected: change.expected_version,
            });
        }
        Err(StoreError::KillSwitchEnabled(current.user_id))
    }

    async fn update_config(
        &self,
        bot_id: Uuid,
        expected_version: i64,
        config: &serde_json::Value,
    ) -> Result<Bot, StoreError> {
        let row = sqlx::query_as::<_, BotRow>(
            "UPDATE bots SET config = $3, config_revision = config_revision + 1, updated_at = NOW()
             WHERE id = $1 AND status_version = $2
             RETURNING *",
        )
        .bind(bot_id)
        .bind(expected_version)
        .bind(config)
        .fetch_optional(&self.db)
        .await?;

        match row {
            Some(row) => Ok(row.into()),
            None => match self.get_bot(bot_id).await? {
                Some(_) => Err(StoreError::VersionConflict {
                    bot_id,
                    expected: expected_version,
                }),
                None => Err(StoreError::NotFound(format!("bot {}", bot_id))),
            },
        }
    }

    async fn create_order_intent(
        &self,
        bot_id: Uuid,
        expected_version: i64,
        exchange: &str,
        draft: &OrderDraft,
    ) -> Result<Order, StoreError> {
        let mut tx = self.db.begin().await?;

        // Row lock on the bot serializes intent allocation against status writes
        let seq: Option<i64> = sqlx::query_scalar(
            "UPDATE bots SET intent_seq = intent_seq + 1, updated_at = NOW()
             WHERE id = $1 AND status_version = $2
               AND status IN ('WAITING_TRIGGER', 'RUNNING')
               AND NOT EXISTS (
                   SELECT 1 FROM kill_switches k WHERE k.user_id = bots.user_id AND k.enabled)
             RETURNING intent_seq",
        )
        .bind(bot_id)
        .bind(expected_version)
        .fetch_optional(&mut *tx)
        .await?;
        let seq = match seq {
            Some(seq) => seq,
            None => {
                tx.rollback().await?;
                let current = self
                    .get_bot(bot_id)
                    .await?
                    .ok_or_else(|| StoreError::NotFound(format!("bot {}", bot_id)))?;
                if current.status_version != expected_version || !current.status.is_trading() {
                    return Err(StoreError::VersionConflict {
                        bot_id,
                        expected: expected_version,
                    });
                }
                return Err(StoreError::KillSwitchEnabled(current.user_id));
            }
        };

        let open: Option<Uuid> = sqlx::query_scalar(
            "SELECT id FROM orders WHERE bot_id = $1 AND status IN ('NEW', 'PARTIALLY_FILLED') LIMIT 1",
        )
        .bind(bot_id)
        .fetch_optional(&mut *tx)
        .await?;
        if open.is_some() {
            return Err(StoreError::OrderInFlight(bot_id));
        }

        let row = sqlx::query_as::<_, OrderRow>(
            "INSERT INTO orders (id, bot_id, exchange, client_order_id, intent_seq, side,
                order_type, price, amount, filled_amount, status)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, 0, 'NEW')
             RETURNING *",
        )
        .bind(Uuid::new_v4())
        .bind(bot_id)
        .bind(exchange)
        .bind(ids::client_order_id(bot_id, seq))
        .bind(seq)
        .bind(draft.side)
        .bind(draft.order_type)
        .bind(bigdecimal_from_decimal(draft.price))
        .bind(bigdecimal_from_decimal(draft.amount))
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| {
            if violates(&e, ONE_OPEN_ORDER_INDEX) {
                StoreError::OrderInFlight(bot_id)
            } else {
                StoreError::Database(e)
            }
        })?;

        tx.commit().await?;
        Ok(row.into())
    }

    async fn insert_recovered_order(&self, order: &Order) -> Result<Order, StoreError> {
        let mut tx = self.db.begin().await?;

        let inserted = sqlx::query_as::<_, OrderRow>(
            "INSERT INTO orders (id, bot_id, exchange, client_order_id, intent_seq,
                exchange_order_id, submitted_at, side, order_type, price, amount,
                filled_amount, avg_fill_price, status, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
             ON CONFLICT (exchange, client_order_id) DO NOTHING
             RETURNING *",
        )
        .bind(order.id)
        .bind(order.bot_id)
        .bind(&order.exchange)
        .bind(&order.client_order_id)
        .bind(order.intent_seq)
        .bind(&order.exchange_order_id)
        .bind(order.submitted_at)
        .bind(order.side)
        .bind(order.order_type)
        .bind(bigdecimal_from_decimal(order.price))
        .bind(bigdecimal_from_decimal(order.amount))
        .bind(bigdecimal_from_decimal(order.filled_amount))
        .bind(order.avg_fill_price.map(bigdecimal_from_decimal))
        .bind(order.status)
        .bind(order.created_at)
        .bind(order.updated_at)
        .fetch_optional(&mut *tx)
        .await?;

        let row = match inserted {
            Some(row) => {
                sqlx::query("UPDATE bots SET intent_seq = GREATEST(intent_seq, $2) WHERE id = $1")
                    .bind(order.bot_id)
                    .bind(order.intent_seq)
                    .execute(&mut *tx)
                    .await?;
                row
            }
            None => {
                sqlx::query_as::<_, OrderRow>(
                    "SELECT * FROM orders WHERE exchange = $1 AND client_order_id = $2",
                )
                .bind(&order.exchange)
                .bind(&order.client_order_id)
                .fetch_one(&mut *tx)
                .await?
            }
        };

        tx.commit().await?;
        Ok(row.into())
    }

    async fn get_order(
        &self,
        exchange: &str,
        client_order_id: &str,
    ) -> Result<Option<Order>, StoreError> {
        let row = sqlx::query_as::<_, OrderRow>(
            "SELECT * FROM orders WHERE exchange = $1 AND client_order_id = $2",
        )
        .bind(exchange)
        .bind(client_order_id)
        .fetch_optional(&self.db)
        .await?;
        Ok(row.map(Order::from))
    }

    async fn find_order_by_exchange_id(
        &self,
        exchange: &str,
        exchange_order_id: &str,
    ) -> Result<Option<Order>, StoreError> {
        let row = sqlx::query_as::<_, OrderRow>(
            "SELECT * FROM orders WHERE exchange = $1 AND exchange_order_id = $2",
        )
        .bind(exchange)
        .bind(exchange_order_id)
        .fetch_optional(&self.db)
        .await?;
        Ok(row.map(Order::from))
    }

    async fn open_order(&self, bot_id: Uuid) -> Result<Option<Order>, StoreError> {
        let row = sqlx::query_as::<_, OrderRow>(
            "SELECT * FROM orders WHERE bot_id = $1 AND status IN ('NEW', 'PARTIALLY_FILLED')",
        )
        .bind(bot_id)
        .fetch_optional(&self.db)
        .await?;
        Ok(row.map(Order::from))
    }

    async fn list_orders(&self, bot_id: Uuid) -> Result<Vec<Order>, StoreError> {
        let rows = sqlx::query_as::<_, OrderRow>(
            "SELECT * FROM orders WHERE bot_id = $1 ORDER BY intent_seq",
        )
        .bind(bot_id)
        .fetch_all(&self.db)
        .await?;
        Ok(rows.into_iter().map(Order::from).collect())
    }

    async fn latest_filled_order(&self, bot_id: Uuid) -> Result<Option<Order>, StoreError> {
        let row = sqlx::query_as::<_, OrderRow>(
            "SELECT * FROM orders WHERE bot_id = $1 AND status = 'FILLED'
             ORDER BY intent_seq DESC LIMIT 1",
        )
        .bind(bot_id)
        .fetch_optional(&self.db)
        .await?;
        Ok(row.map(Order::from))
    }

    async fn mark_order_submitted(
        &self,
        order_id: Uuid,
        exchange_order_id: Option<&str>,
        submitted_at: DateTime<Utc>,
    ) -> Result<Order, StoreError> {
        let row = sqlx::query_as::<_, OrderRow>(
            "UPDATE orders SET exchange_order_id = COALESCE($2, exchange_order_id),
                submitted_at = $3, next_submit_at = NULL, updated_at = NOW()
             WHERE id = $1 RETURNING *",
        )
        .bind(order_id)
        .bind(exchange_order_id)
        .bind(submitted_at)
        .fetch_optional(&self.db)
        .await?;
        row.map(Order::from)
            .ok_or_else(|| StoreError::NotFound(format!("order {}", order_id)))
    }

    async fn record_submit_failure(
        &self,
        order_id: Uuid,
        attempts: i32,
        next_submit_at: Option<DateTime<Utc>>,
        error: &str,
    ) -> Result<Order, StoreError> {
        let row = sqlx::query_as::<_, OrderRow>(
            "UPDATE orders SET submit_attempts = $2, next_submit_at = $3,
                last_submit_error = $4, updated_at = NOW()
             WHERE id = $1 RETURNING *",
        )
        .bind(order_id)
        .bind(attempts)
        .bind(next_submit_at)
        .bind(error)
        .fetch_optional(&self.db)
        .await?;
        row.map(Order::from)
            .ok_or_else(|| StoreError::NotFound(format!("order {}", order_id)))
    }

    async fn update_order_progress(&self, progress: &OrderProgress) -> Result<Order, StoreError> {
        let row = sqlx::query_as::<_, OrderRow>(
            "UPDATE orders SET exchange_order_id = COALESCE($2, exchange_order_id),
                filled_amount = $3, avg_fill_price = $4, status = $5, updated_at = NOW()
             WHERE id = $1 RETURNING *",
        )
        .bind(progress.order_id)
        .bind(&progress.exchange_order_id)
        .bind(bigdecimal_from_decimal(progress.filled_amount))
        .bind(progress.avg_fill_price.map(bigdecimal_from_decimal))
        .bind(progress.status)
        .fetch_optional(&self.db)
        .await?;
        row.map(Order::from)
            .ok_or_else(|| StoreError::NotFound(format!("order {}", progress.order_id)))
    }

    async fn insert_trade(&self, trade: &Trade) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "INSERT INTO trades (bot_id, exchange, trade_id, client_order_id, exchange_order_id,
                side, price, amount, fee, fee_currency, timestamp)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
             ON CONFLICT (exchange, trade_id) DO NOTHING",
        )
        .bind(trade.bot_id)
        .bind(&trade.exchange)
        .bind(&trade.trade_id)
        .bind(&trade.client_order_id)
        .bind(&trade.exchange_order_id)
        .bind(trade.side)
        .bind(bigdecimal_from_decimal(trade.price))
        .bind(bigdecimal_from_decimal(trade.amount))
        .bind(bigdecimal_from_decimal(trade.fee))
        .bind(&trade.fee_currency)
        .bind(trade.timestamp)
        .execute(&self.db)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn list_trades(&self, bot_id: Uuid) -> Result<Vec<Trade>, StoreError> {
        let rows = sqlx::query_as::<_, TradeRow>(
            "SELECT * FROM trades WHERE bot_id = $1 ORDER BY timestamp, trade_id",
        )
        .bind(bot_id)
        .fetch_all(&self.db)
        .await?;
        Ok(rows.into_iter().map(Trade::from).collect())
    }

    async fn list_trades_for_order(
        &self,
        exchange: &str,
        client_order_id: &str,
    ) -> Result<Vec<Trade>, StoreError> {
        let rows = sqlx::query_as::<_, TradeRow>(
            "SELECT * FROM trades WHERE exchange = $1 AND client_order_id = $2
             ORDER BY timestamp, trade_id",
        )
        .bind(exchange)
        .bind(client_order_id)
        .fetch_all(&self.db)
        .await?;
        Ok(rows.into_iter().map(Trade::from).collect())
    }

    async fn latest_snapshot(&self, bot_id: Uuid) -> Result<Option<BotSnapshot>, StoreError> {
        let row = sqlx::query_as::<_, SnapshotRow>(
            "SELECT * FROM bot_snapshots WHERE bot_id = $1
             ORDER BY reconciled_at DESC, seq DESC LIMIT 1",
        )
        .bind(bot_id)
        .fetch_optional(&self.db)
        .await?;
        Ok(row.map(BotSnapshot::from))
    }

    async fn insert_snapshot(
        &self,
        bot_id: Uuid,
        reconciled_at: DateTime<Utc>,
        state_json: &serde_json::Value,
        state_hash: &str,
    ) -> Result<BotSnapshot, StoreError> {
        // run_id is read from the bot row in the same statement
        let row = sqlx::query_as::<_, SnapshotRow>(
            "INSERT INTO bot_snapshots (id, bot_id, run_id, reconciled_at, state_json, state_hash)
             SELECT $1, b.id, b.run_id, $3, $4, $5 FROM bots b WHERE b.id = $2
             RETURNING id, bot_id, run_id, reconciled_at, state_json, state_hash",
        )
        .bind(Uuid::new_v4())
        .bind(bot_id)
        .bind(reconciled_at)
        .bind(state_json)
        .bind(state_hash)
        .fetch_optional(&self.db)
        .await?;
        row.map(BotSnapshot::from)
            .ok_or_else(|| StoreError::NotFound(format!("bot {}", bot_id)))
    }

    async fn list_snapshots(&self, bot_id: Uuid) -> Result<Vec<BotSnapshot>, StoreError> {
        let rows = sqlx::query_as::<_, SnapshotRow>(
            "SELECT id, bot_id, run_id, reconciled_at, state_json, state_hash
             FROM bot_snapshots WHERE bot_id = $1 ORDER BY reconciled_at, seq",
        )
        .bind(bot_id)
        .fetch_all(&self.db)
        .await?;
        Ok(rows.into_iter().map(BotSnapshot::from).collect())
    }

    async fn get_kill_switch(&self, user_id: Uuid) -> Result<KillSwitchState, StoreError> {
        let row = sqlx::query_as::<_, KillSwitchRow>(
            "SELECT * FROM kill_switches WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.db)
        .await?;
        Ok(row
            .map(KillSwitchState::from)
            .unwrap_or_else(|| KillSwitchState::disabled(user_id)))
    }

    async fn set_kill_switch(
        &self,
        user_id: Uuid,
        enabled: bool,
        reason: Option<&str>,
    ) -> Result<(KillSwitchState, bool), StoreError> {
        let mut tx = self.db.begin().await?;

        sqlx::query(
            "INSERT INTO kill_switches (user_id, enabled) VALUES ($1, FALSE)
             ON CONFLICT (user_id) DO NOTHING",
        )
        .bind(user_id)
        .execute(&mut *tx)
        .await?;

        let flipped = sqlx::query_as::<_, KillSwitchRow>(
            "UPDATE kill_switches SET enabled = $2, reason = $3, updated_at = NOW()
             WHERE user_id = $1 AND enabled <> $2
             RETURNING *",
        )
        .bind(user_id)
        .bind(enabled)
        .bind(reason)
        .fetch_optional(&mut *tx)
        .await?;

        let result = match flipped {
            Some(row) => (row.into(), true),
            None => {
                let row = sqlx::query_as::<_, KillSwitchRow>(
                    "SELECT * FROM kill_switches WHERE user_id = $1",
                )
                .bind(user_id)
                .fetch_one(&mut *tx)
                .await?;
                (row.into(), false)
            }
        };

        tx.commit().await?;
        Ok(result)
    }
}
