//! Exchange reconciliation - absorb remote orders and fills into local state
//!
//! The exchange is ground truth. Each pass upserts our open orders, ingests
//! new fills exactly once, advances order status from cumulative fills and
//! writes a snapshot when the reconciled state changed. A failed fetch never
//! touches bot status.

use chrono::Utc;
use rust_decimal::Decimal;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::ReconcileSettings;
use crate::error::Result;
use crate::exchange::{ExchangeErrorKind, ExchangeExecutor, RemoteOrder, RemoteTrade};
use crate::ids;
use crate::models::{Bot, BotStatus, Order, OrderStatus, Trade};
use crate::observability::{metrics, MetricsCollector};
use crate::store::{BotStore, OrderProgress};

pub struct Reconciler {
    store: Arc<dyn BotStore>,
    executor: Arc<dyn ExchangeExecutor>,
    settings: ReconcileSettings,
    metrics: MetricsCollector,
}

/// Outcome of one reconcile pass
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcileReport {
    pub bot_id: Uuid,
    pub success: bool,
    /// Transport classification when a fetch failed
    pub error_kind: Option<ExchangeErrorKind>,
    pub error: Option<String>,
    pub orders_seen: usize,
    pub orders_recovered: usize,
    pub trades_inserted: usize,
    /// Foreign, unresolvable or already recorded
    pub trades_skipped: usize,
    pub orders_advanced: usize,
    pub snapshot_written: bool,
}

impl ReconcileReport {
    fn failed(bot_id: Uuid, kind: ExchangeErrorKind, error: String) -> Self {
        Self {
            bot_id,
            success: false,
            error_kind: Some(kind),
            error: Some(error),
            ..Self::default()
        }
    }
}

/// What the exchange told us about one local order this pass
#[derive(Debug, Clone, PartialEq)]
enum Sighting {
    /// In the open-orders list
    Listed(RemoteOrder),
    /// Answer of a per-order lookup after it left the open list
    LookedUp(RemoteOrder),
    /// Stopping bot, absent from the open list, no exchange id to look up
    Drained,
    /// No evidence either way
    Unseen,
}

impl Sighting {
    fn remote(&self) -> Option<&RemoteOrder> {
        match self {
            Sighting::Listed(remote) | Sighting::LookedUp(remote) => Some(remote),
            Sighting::Drained | Sighting::Unseen => None,
        }
    }
}

/// Fill totals computed from recorded trades
struct FillSum {
    amount: Decimal,
    avg_price: Option<Decimal>,
}

fn sum_fills(trades: &[Trade]) -> FillSum {
    let amount: Decimal = trades.iter().map(|t| t.amount).sum();
    let cost: Decimal = trades.iter().map(|t| t.amount * t.price).sum();
    let avg_price = if amount > Decimal::ZERO {
        Some(cost / amount)
    } else {
        None
    };
    FillSum { amount, avg_price }
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn BotStore>,
        executor: Arc<dyn ExchangeExecutor>,
        settings: ReconcileSettings,
        metrics: MetricsCollector,
    ) -> Self {
        Self {
            store,
            executor,
            settings,
            metrics,
        }
    }

    /// Reconcile one bot against the exchange
    pub async fn reconcile(&self, bot: &Bot) -> Result<ReconcileReport> {
        self.metrics.increment(metrics::RECONCILE_RUNS, 1).await;

        let remote_orders = match self.executor.fetch_open_orders(&bot.symbol).await {
            Ok(orders) => orders,
            Err(e) => return Ok(self.fetch_failed(bot, e.kind(), e.to_string()).await),
        };
        let remote_trades = match self.executor.fetch_my_trades(&bot.symbol).await {
            Ok(trades) => trades,
            Err(e) => return Ok(self.fetch_failed(bot, e.kind(), e.to_string()).await),
        };

        let mut report = ReconcileReport {
            bot_id: bot.id,
            success: true,
            ..ReconcileReport::default()
        };

        let ours: HashMap<String, RemoteOrder> = remote_orders
            .into_iter()
            .filter_map(|o| {
                let coid = o.client_order_id.clone()?;
                ids::belongs_to(&coid, bot.id).then_some((coid, o))
            })
            .collect();
        report.orders_seen = ours.len();

        for (coid, remote) in &ours {
            if self.upsert_remote_order(bot, coid, remote).await? {
                report.orders_recovered += 1;
            }
        }

        let mut touched: BTreeSet<String> = BTreeSet::new();
        for trade in &remote_trades {
            if let Some(coid) = self.ingest_trade(bot, trade).await? {
                report.trades_inserted += 1;
                touched.insert(coid);
            }
        }
        report.trades_skipped = remote_trades.len().saturating_sub(report.trades_inserted);
        if report.trades_inserted > 0 {
            self.metrics
                .increment(metrics::TRADES_INGESTED, report.trades_inserted as u64)
                .await;
        }

        // Every open local order, plus any order that just received fills
        let orders = self.store.list_orders(bot.id).await?;
        for order in orders
            .iter()
            .filter(|o| o.status.is_open() || touched.contains(&o.client_order_id))
        {
            let sighting = match ours.get(&order.client_order_id) {
                Some(remote) => Sighting::Listed(remote.clone()),
                None => self.look_up_missing(bot, order).await,
            };
            if self.advance_order(bot, order, &sighting).await? {
                report.orders_advanced += 1;
            }
        }

        report.snapshot_written = self.write_snapshot(bot).await?;

        debug!(
            bot_id = %bot.id,
            "Reconciled: {} open remote, {} recovered, {} new trades, {} advanced",
            report.orders_seen,
            report.orders_recovered,
            report.trades_inserted,
            report.orders_advanced
        );
        Ok(report)
    }

    async fn fetch_failed(&self, bot: &Bot, kind: ExchangeErrorKind, error: String) -> ReconcileReport {
        warn!(bot_id = %bot.id, "Reconcile fetch failed: {}", error);
        self.metrics.increment(metrics::RECONCILE_FAILURES, 1).await;
        ReconcileReport::failed(bot.id, kind, error)
    }

    /// Link a remote open order to its local row, creating the row if the
    /// exchange knows an order of ours we lost. Returns true if recovered.
    async fn upsert_remote_order(&self, bot: &Bot, coid: &str, remote: &RemoteOrder) -> Result<bool> {
        let exchange = self.executor.name();
        match self.store.get_order(exchange, coid).await? {
            Some(local) => {
                if local.status.is_open() && (local.exchange_order_id.is_none() || !local.is_submitted()) {
                    let submitted_at = local.submitted_at.unwrap_or_else(Utc::now);
                    self.store
                        .mark_order_submitted(local.id, Some(&remote.exchange_order_id), submitted_at)
                        .await?;
                } else if !local.status.is_open() {
                    warn!(
                        bot_id = %bot.id,
                        client_order_id = %coid,
                        "Exchange reports {} open but it is {} locally",
                        coid,
                        local.status
                    );
                }
                Ok(false)
            }
            None => {
                let Some((_, intent_seq)) = ids::parse_client_order_id(coid) else {
                    return Ok(false);
                };
                let now = Utc::now();
                let order = Order {
                    id: Uuid::new_v4(),
                    bot_id: bot.id,
                    exchange: exchange.to_string(),
                    client_order_id: coid.to_string(),
                    intent_seq,
                    exchange_order_id: Some(remote.exchange_order_id.clone()),
                    submitted_at: Some(now),
                    side: remote.side,
                    order_type: remote.order_type,
                    price: remote.price,
                    amount: remote.amount,
                    filled_amount: remote.filled_amount,
                    avg_fill_price: remote.avg_fill_price,
                    status: if remote.filled_amount > Decimal::ZERO {
                        OrderStatus::PartiallyFilled
                    } else {
                        OrderStatus::New
                    },
                    submit_attempts: 1,
                    next_submit_at: None,
                    last_submit_error: None,
                    created_at: now,
                    updated_at: now,
                };
                self.store.insert_recovered_order(&order).await?;
                info!(
                    bot_id = %bot.id,
                    client_order_id = %coid,
                    "Recovered order {} from exchange",
                    remote.exchange_order_id
                );
                Ok(true)
            }
        }
    }

    /// Resolve and insert one remote fill. Returns the client order id if a
    /// new trade row was written.
    async fn ingest_trade(&self, bot: &Bot, trade: &RemoteTrade) -> Result<Option<String>> {
        let exchange = self.executor.name();

        // The exchange order id is authoritative over the trade's own tag
        let by_exchange_id = match &trade.exchange_order_id {
            Some(eoid) => self.store.find_order_by_exchange_id(exchange, eoid).await?,
            None => None,
        };
        let coid = match by_exchange_id {
            Some(order) if order.bot_id == bot.id => order.client_order_id,
            Some(_) => return Ok(None),
            None => match &trade.client_order_id {
                Some(coid) if ids::belongs_to(coid, bot.id) => coid.clone(),
                _ => return Ok(None),
            },
        };

        let row = Trade {
            bot_id: bot.id,
            exchange: exchange.to_string(),
            trade_id: trade.trade_id.clone(),
            client_order_id: coid.clone(),
            exchange_order_id: trade.exchange_order_id.clone(),
            side: trade.side,
            price: trade.price,
            amount: trade.amount,
            fee: trade.fee,
            fee_currency: trade.fee_currency.clone(),
            timestamp: trade.timestamp,
        };
        if self.store.insert_trade(&row).await? {
            Ok(Some(coid))
        } else {
            Ok(None)
        }
    }

    /// Ask the venue about an open order that left the open list. Only done
    /// once the grace period has passed, or right away while stopping.
    async fn look_up_missing(&self, bot: &Bot, order: &Order) -> Sighting {
        if !order.status.is_open() || !order.is_submitted() {
            return Sighting::Unseen;
        }
        let stopping = bot.status == BotStatus::Stopping;
        if !stopping && !self.past_grace(order) {
            return Sighting::Unseen;
        }
        let Some(eoid) = order.exchange_order_id.as_deref() else {
            // Nothing to look up. A drain has just listed everything open
            // under our prefix, so absence there is final.
            return if stopping { Sighting::Drained } else { Sighting::Unseen };
        };

        match self.executor.fetch_order(eoid, &bot.symbol).await {
            Ok(remote) => Sighting::LookedUp(remote),
            Err(e) => {
                warn!(
                    bot_id = %bot.id,
                    client_order_id = %order.client_order_id,
                    "Lookup of missing order {} failed: {}",
                    eoid,
                    e
                );
                Sighting::Unseen
            }
        }
    }

    /// Recompute fill state of one order. Returns true if its status moved.
    async fn advance_order(&self, bot: &Bot, order: &Order, sighting: &Sighting) -> Result<bool> {
        let remote = sighting.remote();
        let trades = self
            .store
            .list_trades_for_order(&order.exchange, &order.client_order_id)
            .await?;
        let fills = sum_fills(&trades);

        let remote_filled = remote.map(|r| r.filled_amount).unwrap_or(Decimal::ZERO);
        let filled = fills.amount.max(remote_filled).max(order.filled_amount);
        let avg_fill_price = fills
            .avg_price
            .or_else(|| remote.and_then(|r| r.avg_fill_price))
            .or(order.avg_fill_price);

        let remote_status = remote.map(|r| r.status);
        let status = if filled >= order.amount - self.settings.fill_tolerance
            || remote_status == Some(OrderStatus::Filled)
        {
            OrderStatus::Filled
        } else if !order.status.is_open() {
            order.status
        } else if remote_status == Some(OrderStatus::Canceled) || *sighting == Sighting::Drained {
            OrderStatus::Canceled
        } else if filled > Decimal::ZERO {
            OrderStatus::PartiallyFilled
        } else {
            order.status
        };

        let exchange_order_id = match (&order.exchange_order_id, remote) {
            (None, Some(r)) => Some(r.exchange_order_id.clone()),
            (None, None) => trades.iter().find_map(|t| t.exchange_order_id.clone()),
            _ => None,
        };

        let changed = status != order.status
            || filled != order.filled_amount
            || avg_fill_price != order.avg_fill_price
            || exchange_order_id.is_some();
        // A remote sighting refreshes updated_at, which tracks when we last
        // saw the order open
        if changed || remote.is_some() {
            self.store
                .update_order_progress(&OrderProgress {
                    order_id: order.id,
                    exchange_order_id,
                    filled_amount: filled,
                    avg_fill_price,
                    status,
                })
                .await?;
        }

        if status != order.status {
            info!(
                bot_id = %bot.id,
                client_order_id = %order.client_order_id,
                "Order {} -> {} (filled {} of {})",
                order.status,
                status,
                filled,
                order.amount
            );
            if status == OrderStatus::Canceled {
                self.metrics.increment(metrics::ORDER_CANCELED, 1).await;
            }
            return Ok(true);
        }
        Ok(false)
    }

    /// Not seen open within the grace period
    fn past_grace(&self, order: &Order) -> bool {
        let grace = chrono::Duration::from_std(self.settings.missing_order_grace())
            .unwrap_or_else(|_| chrono::Duration::zero());
        Utc::now() - order.updated_at > grace
    }

    /// Write a snapshot unless the state hash matches the latest one
    async fn write_snapshot(&self, bot: &Bot) -> Result<bool> {
        let orders = self.store.list_orders(bot.id).await?;
        let open: Vec<&Order> = orders.iter().filter(|o| o.status.is_open()).collect();
        let open_ids: Vec<String> = open.iter().map(|o| o.client_order_id.clone()).collect();
        let trade_ids: Vec<String> = self
            .store
            .list_trades(bot.id)
            .await?
            .into_iter()
            .map(|t| t.trade_id)
            .collect();

        let hash = ids::state_hash(&open_ids, &trade_ids);
        if let Some(latest) = self.store.latest_snapshot(bot.id).await? {
            if latest.state_hash == hash {
                return Ok(false);
            }
        }

        let state = serde_json::json!({
            "status": bot.status,
            "openOrders": open,
            "tradeIds": trade_ids,
        });
        let snapshot = self
            .store
            .insert_snapshot(bot.id, Utc::now(), &state, &hash)
            .await?;
        self.metrics.increment(metrics::SNAPSHOTS_WRITTEN, 1).await;
        debug!(bot_id = %bot.id, "Snapshot {} written", snapshot.id);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::OrderSide;
    use rust_decimal_macros::dec;

    fn trade(amount: Decimal, price: Decimal) -> Trade {
        Trade {
            bot_id: Uuid::nil(),
            exchange: "paper".to_string(),
            trade_id: format!("t-{}-{}", amount, price),
            client_order_id: "gbot-x-1".to_string(),
            exchange_order_id: None,
            side: OrderSide::Buy,
            price,
            amount,
            fee: Decimal::ZERO,
            fee_currency: None,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_fill_sum_is_volume_weighted() {
        let fills = sum_fills(&[trade(dec!(1), dec!(100)), trade(dec!(3), dec!(96))]);
        assert_eq!(fills.amount, dec!(4));
        assert_eq!(fills.avg_price, Some(dec!(97)));
    }

    #[test]
    fn test_fill_sum_empty() {
        let fills = sum_fills(&[]);
        assert_eq!(fills.amount, Decimal::ZERO);
        assert_eq!(fills.avg_price, None);
    }
}
