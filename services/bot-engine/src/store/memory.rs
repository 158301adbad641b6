//! In-process store. One mutex guards all tables, so every method is a
//! transaction.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{BotStore, OrderProgress, StatusChange, StoreError};
use crate::ids;
use crate::models::{
    Bot, BotSnapshot, BotStatus, KillSwitchState, Order, OrderDraft, Trade,
};
use rust_decimal::Decimal;

#[derive(Default)]
struct Tables {
    bots: HashMap<Uuid, Bot>,
    orders: Vec<Order>,
    trades: Vec<Trade>,
    snapshots: Vec<BotSnapshot>,
    kill_switches: HashMap<Uuid, KillSwitchState>,
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Tables>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn order_mut(tables: &mut Tables, order_id: Uuid) -> Result<&mut Order, StoreError> {
    tables
        .orders
        .iter_mut()
        .find(|o| o.id == order_id)
        .ok_or_else(|| StoreError::NotFound(format!("order {}", order_id)))
}

#[async_trait]
impl BotStore for MemoryStore {
    async fn insert_bot(&self, bot: &Bot) -> Result<(), StoreError> {
        let mut tables = self.inner.lock().await;
        tables.bots.insert(bot.id, bot.clone());
        Ok(())
    }

    async fn get_bot(&self, bot_id: Uuid) -> Result<Option<Bot>, StoreError> {
        let tables = self.inner.lock().await;
        Ok(tables.bots.get(&bot_id).cloned())
    }

    async fn list_bots_for_user(&self, user_id: Uuid) -> Result<Vec<Bot>, StoreError> {
        let tables = self.inner.lock().await;
        let mut bots: Vec<Bot> = tables
            .bots
            .values()
            .filter(|b| b.user_id == user_id)
            .cloned()
            .collect();
        bots.sort_by_key(|b| b.created_at);
        Ok(bots)
    }

    async fn list_bots_in(&self, statuses: &[BotStatus]) -> Result<Vec<Bot>, StoreError> {
        let tables = self.inner.lock().await;
        let mut bots: Vec<Bot> = tables
            .bots
            .values()
            .filter(|b| statuses.contains(&b.status))
            .cloned()
            .collect();
        bots.sort_by_key(|b| b.created_at);
        Ok(bots)
    }

    async fn apply_status_change(&self, change: &StatusChange) -> Result<Bot, StoreError> {
        let mut tables = self.inner.lock().await;

        let (user_id, version) = tables
            .bots
            .get(&change.bot_id)
            .map(|b| (b.user_id, b.status_version))
            .ok_or_else(|| StoreError::NotFound(format!("bot {}", change.bot_id)))?;

        if version != change.expected_version {
            return Err(StoreError::VersionConflict {
                bot_id: change.bot_id,
                expected: change.expected_version,
            });
        }
        if change.guard_kill_switch
            && tables
                .kill_switches
                .get(&user_id)
                .map(|k| k.enabled)
                .unwrap_or(false)
        {
            return Err(StoreError::KillSwitchEnabled(user_id));
        }

        let bot = tables
            .bots
            .get_mut(&change.bot_id)
            .ok_or_else(|| StoreError::NotFound(format!("bot {}", change.bot_id)))?;
        bot.status = change.to;
        bot.status_version += 1;
        if let Some(run) = &change.run {
            bot.run_id = Some(run.run_id);
            bot.started_at = Some(run.started_at);
            bot.base_price = Some(run.base_price);
            bot.auto_close_reference_price = Some(run.reference_price);
            bot.auto_close_triggered_at = None;
            bot.auto_close_reason = None;
        }
        if let Some(error) = &change.last_error {
            bot.last_error = Some(error.clone());
        }
        if let Some(mark) = &change.auto_close {
            bot.auto_close_triggered_at = Some(mark.triggered_at);
            bot.auto_close_reason = Some(mark.reason.clone());
        }
        bot.updated_at = Utc::now();
        Ok(bot.clone())
    }

    async fn update_config(
        &self,
        bot_id: Uuid,
        expected_version: i64,
        config: &serde_json::Value,
    ) -> Result<Bot, StoreError> {
        let mut tables = self.inner.lock().await;
        let bot = tables
            .bots
            .get_mut(&bot_id)
            .ok_or_else(|| StoreError::NotFound(format!("bot {}", bot_id)))?;
        if bot.status_version != expected_version {
            return Err(StoreError::VersionConflict {
                bot_id,
                expected: expected_version,
            });
        }
        bot.config = config.clone();
        bot.config_revision += 1;
        bot.updated_at = Utc::now();
        Ok(bot.clone())
    }

    async fn create_order_intent(
        &self,
        bot_id: Uuid,
        expected_version: i64,
        exchange: &str,
        draft: &OrderDraft,
    ) -> Result<Order, StoreError> {
        let mut tables = self.inner.lock().await;

        let (user_id, status, version) = tables
            .bots
            .get(&bot_id)
            .map(|b| (b.user_id, b.status, b.status_version))
            .ok_or_else(|| StoreError::NotFound(format!("bot {}", bot_id)))?;
        if version != expected_version || !status.is_trading() {
            return Err(StoreError::VersionConflict {
                bot_id,
                expected: expected_version,
            });
        }
        if tables
            .kill_switches
            .get(&user_id)
            .map(|k| k.enabled)
            .unwrap_or(false)
        {
            return Err(StoreError::KillSwitchEnabled(user_id));
        }

        if tables
            .orders
            .iter()
            .any(|o| o.bot_id == bot_id && o.status.is_open())
        {
            return Err(StoreError::OrderInFlight(bot_id));
        }

        let bot = tables
            .bots
            .get_mut(&bot_id)
            .ok_or_else(|| StoreError::NotFound(format!("bot {}", bot_id)))?;
        bot.intent_seq += 1;
        let intent_seq = bot.intent_seq;

        let now = Utc::now();
        let order = Order {
            id: Uuid::new_v4(),
            bot_id,
            exchange: exchange.to_string(),
            client_order_id: ids::client_order_id(bot_id, intent_seq),
            intent_seq,
            exchange_order_id: None,
            submitted_at: None,
            side: draft.side,
            order_type: draft.order_type,
            price: draft.price,
            amount: draft.amount,
            filled_amount: Decimal::ZERO,
            avg_fill_price: None,
            status: crate::models::OrderStatus::New,
            submit_attempts: 0,
            next_submit_at: None,
            last_submit_error: None,
            created_at: now,
            updated_at: now,
        };
        tables.orders.push(order.clone());
        Ok(order)
    }

    async fn insert_recovered_order(&self, order: &Order) -> Result<Order, StoreError> {
        let mut tables = self.inner.lock().await;
        if let Some(existing) = tables
            .orders
            .iter()
            .find(|o| o.exchange == order.exchange && o.client_order_id == order.client_order_id)
        {
            return Ok(existing.clone());
        }
        if let Some(bot) = tables.bots.get_mut(&order.bot_id) {
            bot.intent_seq = bot.intent_seq.max(order.intent_seq);
        }
        tables.orders.push(order.clone());
        Ok(order.clone())
    }

    async fn get_order(
        &self,
        exchange: &str,
        client_order_id: &str,
    ) -> Result<Option<Order>, StoreError> {
        let tables = self.inner.lock().await;
        Ok(tables
            .orders
            .iter()
            .find(|o| o.exchange == exchange && o.client_order_id == client_order_id)
            .cloned())
    }

    async fn find_order_by_exchange_id(
        &self,
        exchange: &str,
        exchange_order_id: &str,
    ) -> Result<Option<Order>, StoreError> {
        let tables = self.inner.lock().await;
        Ok(tables
            .orders
            .iter()
            .find(|o| {
                o.exchange == exchange && o.exchange_order_id.as_deref() == Some(exchange_order_id)
            })
            .cloned())
    }

    async fn open_order(&self, bot_id: Uuid) -> Result<Option<Order>, StoreError> {
        let tables = self.inner.lock().await;
        Ok(tables
            .orders
            .iter()
            .find(|o| o.bot_id == bot_id && o.status.is_open())
            .cloned())
    }

    async fn list_orders(&self, bot_id: Uuid) -> Result<Vec<Order>, StoreError> {
        let tables = self.inner.lock().await;
        let mut orders: Vec<Order> = tables
            .orders
            .iter()
            .filter(|o| o.bot_id == bot_id)
            .cloned()
            .collect();
        orders.sort_by_key(|o| o.intent_seq);
        Ok(orders)
    }

    async fn latest_filled_order(&self, bot_id: Uuid) -> Result<Option<Order>, StoreError> {
        let tables = self.inner.lock().await;
        Ok(tables
            .orders
            .iter()
            .filter(|o| o.bot_id == bot_id && o.status == crate::models::OrderStatus::Filled)
            .max_by_key(|o| o.intent_seq)
            .cloned())
    }

    async fn mark_order_submitted(
        &self,
        order_id: Uuid,
        exchange_order_id: Option<&str>,
        submitted_at: DateTime<Utc>,
    ) -> Result<Order, StoreError> {
        let mut tables = self.inner.lock().await;
        let order = order_mut(&mut tables, order_id)?;
        if let Some(id) = exchange_order_id {
            order.exchange_order_id = Some(id.to_string());
        }
        order.submitted_at = Some(submitted_at);
        order.next_submit_at = None;
        order.updated_at = Utc::now();
        Ok(order.clone())
    }

    async fn record_submit_failure(
        &self,
        order_id: Uuid,
        attempts: i32,
        next_submit_at: Option<DateTime<Utc>>,
        error: &str,
    ) -> Result<Order, StoreError> {
        let mut tables = self.inner.lock().await;
        let order = order_mut(&mut tables, order_id)?;
        order.submit_attempts = attempts;
        order.next_submit_at = next_submit_at;
        order.last_submit_error = Some(error.to_string());
        order.updated_at = Utc::now();
        Ok(order.clone())
    }

    async fn update_order_progress(&self, progress: &OrderProgress) -> Result<Order, StoreError> {
        let mut tables = self.inner.lock().await;
        let order = order_mut(&mut tables, progress.order_id)?;
        if progress.exchange_order_id.is_some() {
            order.exchange_order_id = progress.exchange_order_id.clone();
        }
        order.filled_amount = progress.filled_amount;
        order.avg_fill_price = progress.avg_fill_price;
        order.status = progress.status;
        order.updated_at = Utc::now();
        Ok(order.clone())
    }

    async fn insert_trade(&self, trade: &Trade) -> Result<bool, StoreError> {
        let mut tables = self.inner.lock().await;
        if tables
            .trades
            .iter()
            .any(|t| t.exchange == trade.exchange && t.trade_id == trade.trade_id)
        {
            return Ok(false);
        }
        tables.trades.push(trade.clone());
        Ok(true)
    }

    async fn list_trades(&self, bot_id: Uuid) -> Result<Vec<Trade>, StoreError> {
        let tables = self.inner.lock().await;
        Ok(tables
            .trades
            .iter()
            .filter(|t| t.bot_id == bot_id)
            .cloned()
            .collect())
    }

    async fn list_trades_for_order(
        &self,
        exchange: &str,
        client_order_id: &str,
    ) -> Result<Vec<Trade>, StoreError> {
        let tables = self.inner.lock().await;
        Ok(tables
            .trades
            .iter()
            .filter(|t| t.exchange == exchange && t.client_order_id == client_order_id)
            .cloned()
            .collect())
    }

    async fn latest_snapshot(&self, bot_id: Uuid) -> Result<Option<BotSnapshot>, StoreError> {
        let tables = self.inner.lock().await;
        Ok(tables
            .snapshots
            .iter()
            .rev()
            .find(|s| s.bot_id == bot_id)
            .cloned())
    }

    async fn insert_snapshot(
        &self,
        bot_id: Uuid,
        reconciled_at: DateTime<Utc>,
        state_json: &serde_json::Value,
        state_hash: &str,
    ) -> Result<BotSnapshot, StoreError> {
        let mut tables = self.inner.lock().await;
        let run_id = tables
            .bots
            .get(&bot_id)
            .ok_or_else(|| StoreError::NotFound(format!("bot {}", bot_id)))?
            .run_id;
        let snapshot = BotSnapshot {
            id: Uuid::new_v4(),
            bot_id,
            run_id,
            reconciled_at,
            state_json: state_json.clone(),
            state_hash: state_hash.to_string(),
        };
        tables.snapshots.push(snapshot.clone());
        Ok(snapshot)
    }

    async fn list_snapshots(&self, bot_id: Uuid) -> Result<Vec<BotSnapshot>, StoreError> {
        let tables = self.inner.lock().await;
        Ok(tables
            .snapshots
            .iter()
            .filter(|s| s.bot_id == bot_id)
            .cloned()
            .collect())
    }

    async fn get_kill_switch(&self, user_id: Uuid) -> Result<KillSwitchState, StoreError> {
        let tables = self.inner.lock().await;
        Ok(tables
            .kill_switches
            .get(&user_id)
            .cloned()
            .unwrap_or_else(|| KillSwitchState::disabled(user_id)))
    }

    async fn set_kill_switch(
        &self,
        user_id: Uuid,
        enabled: bool,
        reason: Option<&str>,
    ) -> Result<(KillSwitchState, bool), StoreError> {
        let mut tables = self.inner.lock().await;
        let state = tables
            .kill_switches
            .entry(user_id)
            .or_insert_with(|| KillSwitchState::disabled(user_id));
        if state.enabled == enabled {
            return Ok((state.clone(), false));
        }
        state.enabled = enabled;
        state.reason = reason.map(str::to_string);
        state.updated_at = Some(Utc::now());
        Ok((state.clone(), true))
    }
}
