//! Paper exchange - in-process venue for running the engine without real funds
//!
//! Every ticker read moves the price by a random step within
//! `volatility_percent`. Resting limit orders fill in full at their limit price
//! once the ticker crosses them; market orders fill at the current price.

use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use tokio::sync::Mutex;
use tracing::debug;

use crate::config::PaperSettings;
use crate::exchange::{
    Balance, ExchangeError, ExchangeExecutor, MarketDataProvider, MarketInfo, OrderRequest,
    PlacedOrder, RemoteOrder, RemoteTrade, Ticker,
};
use crate::models::{OrderSide, OrderStatus, OrderType};
use crate::strategy::round_price;

pub struct PaperExchange {
    settings: PaperSettings,
    book: Mutex<PaperBook>,
}

#[derive(Default)]
struct PaperBook {
    prices: HashMap<String, Decimal>,
    open: Vec<RemoteOrder>,
    /// Filled and canceled orders, kept for lookups
    closed: Vec<RemoteOrder>,
    trades: Vec<RemoteTrade>,
    client_ids: HashSet<String>,
    base_balances: HashMap<String, Decimal>,
    quote_balance: Decimal,
    next_order: u64,
    next_trade: u64,
}

impl PaperBook {
    fn price(&mut self, symbol: &str, initial: Decimal) -> Decimal {
        *self.prices.entry(symbol.to_string()).or_insert(initial)
    }

    /// Fill every resting order of `symbol` the price has crossed
    fn match_orders(&mut self, symbol: &str, price: Decimal) {
        let (crossed, resting): (Vec<RemoteOrder>, Vec<RemoteOrder>) =
            std::mem::take(&mut self.open).into_iter().partition(|o| {
                o.symbol == symbol
                    && match (o.order_type, o.side) {
                        (OrderType::Market, _) => true,
                        (OrderType::Limit, OrderSide::Buy) => price <= o.price,
                        (OrderType::Limit, OrderSide::Sell) => price >= o.price,
                    }
            });
        self.open = resting;

        for mut order in crossed {
            let fill_price = match order.order_type {
                OrderType::Limit => order.price,
                OrderType::Market => price,
            };
            let amount = order.amount - order.filled_amount;
            self.next_trade += 1;
            self.trades.push(RemoteTrade {
                trade_id: format!("paper-t-{}", self.next_trade),
                exchange_order_id: Some(order.exchange_order_id.clone()),
                client_order_id: order.client_order_id.clone(),
                symbol: order.symbol.clone(),
                side: order.side,
                price: fill_price,
                amount,
                fee: Decimal::ZERO,
                fee_currency: None,
                timestamp: Utc::now(),
            });

            let base = self.base_balances.entry(order.symbol.clone()).or_default();
            match order.side {
                OrderSide::Buy => {
                    *base += amount;
                    self.quote_balance -= amount * fill_price;
                }
                OrderSide::Sell => {
                    *base -= amount;
                    self.quote_balance += amount * fill_price;
                }
            }
            debug!(
                "Paper fill {} {} {} @ {}",
                order.exchange_order_id, order.side, amount, fill_price
            );

            order.filled_amount = order.amount;
            order.avg_fill_price = Some(fill_price);
            order.status = OrderStatus::Filled;
            self.closed.push(order);
        }
    }
}

/// Uniform step in [-1, 1]
fn random_step() -> Decimal {
    let step: f64 = rand::thread_rng().gen_range(-1.0..=1.0);
    Decimal::from_f64(step).unwrap_or_default()
}

impl PaperExchange {
    pub fn new(settings: PaperSettings) -> Self {
        let book = PaperBook {
            quote_balance: settings.quote_balance,
            ..PaperBook::default()
        };
        Self {
            settings,
            book: Mutex::new(book),
        }
    }

    /// Pin the price of `symbol` and fill whatever it crosses
    pub async fn set_price(&self, symbol: &str, price: Decimal) {
        let mut book = self.book.lock().await;
        book.prices.insert(symbol.to_string(), price);
        book.match_orders(symbol, price);
    }
}

#[async_trait]
impl ExchangeExecutor for PaperExchange {
    fn name(&self) -> &str {
        &self.settings.name
    }

    async fn fetch_open_orders(&self, symbol: &str) -> Result<Vec<RemoteOrder>, ExchangeError> {
        let book = self.book.lock().await;
        Ok(book
            .open
            .iter()
            .filter(|o| o.symbol == symbol)
            .cloned()
            .collect())
    }

    async fn fetch_my_trades(&self, symbol: &str) -> Result<Vec<RemoteTrade>, ExchangeError> {
        let book = self.book.lock().await;
        Ok(book
            .trades
            .iter()
            .filter(|t| t.symbol == symbol)
            .cloned()
            .collect())
    }

    async fn create_order(&self, request: &OrderRequest) -> Result<PlacedOrder, ExchangeError> {
        if request.amount <= Decimal::ZERO {
            return Err(ExchangeError::BadRequest("amount must be positive".to_string()));
        }

        let mut book = self.book.lock().await;
        if !book.client_ids.insert(request.client_order_id.clone()) {
            return Err(ExchangeError::DuplicateOrder(request.client_order_id.clone()));
        }

        book.next_order += 1;
        let exchange_order_id = format!("paper-{}", book.next_order);
        book.open.push(RemoteOrder {
            exchange_order_id: exchange_order_id.clone(),
            client_order_id: Some(request.client_order_id.clone()),
            symbol: request.symbol.clone(),
            side: request.side,
            order_type: request.order_type,
            price: request.price,
            amount: request.amount,
            filled_amount: Decimal::ZERO,
            avg_fill_price: None,
            status: OrderStatus::New,
        });

        // Marketable orders fill on arrival
        let price = book.price(&request.symbol, self.settings.initial_price);
        book.match_orders(&request.symbol, price);

        Ok(PlacedOrder {
            exchange_order_id,
            client_order_id: request.client_order_id.clone(),
            accepted_at: Utc::now(),
        })
    }

    async fn cancel_order(&self, exchange_order_id: &str, symbol: &str) -> Result<(), ExchangeError> {
        let mut book = self.book.lock().await;
        let Some(index) = book
            .open
            .iter()
            .position(|o| o.exchange_order_id == exchange_order_id && o.symbol == symbol)
        else {
            return Err(ExchangeError::BadRequest(format!(
                "unknown open order {}",
                exchange_order_id
            )));
        };
        let mut order = book.open.remove(index);
        order.status = OrderStatus::Canceled;
        book.closed.push(order);
        Ok(())
    }

    async fn fetch_order(&self, exchange_order_id: &str, symbol: &str) -> Result<RemoteOrder, ExchangeError> {
        let book = self.book.lock().await;
        book.open
            .iter()
            .chain(book.closed.iter())
            .find(|o| o.exchange_order_id == exchange_order_id && o.symbol == symbol)
            .cloned()
            .ok_or_else(|| ExchangeError::BadRequest(format!("unknown order {}", exchange_order_id)))
    }
}

#[async_trait]
impl MarketDataProvider for PaperExchange {
    async fn get_market_info(&self, symbol: &str) -> Result<MarketInfo, ExchangeError> {
        Ok(MarketInfo {
            symbol: symbol.to_string(),
            min_amount: self.settings.min_amount,
            min_notional: self.settings.min_notional,
            price_precision: self.settings.price_precision,
            amount_precision: self.settings.amount_precision,
        })
    }

    async fn get_ticker(&self, symbol: &str) -> Result<Ticker, ExchangeError> {
        let step = if self.settings.volatility_percent > Decimal::ZERO {
            random_step() * self.settings.volatility_percent / Decimal::ONE_HUNDRED
        } else {
            Decimal::ZERO
        };

        let mut book = self.book.lock().await;
        let current = book.price(symbol, self.settings.initial_price);
        let next = round_price(current * (Decimal::ONE + step), self.settings.price_precision);
        let next = if next > Decimal::ZERO { next } else { current };
        book.prices.insert(symbol.to_string(), next);
        book.match_orders(symbol, next);

        Ok(Ticker {
            symbol: symbol.to_string(),
            last: next,
            timestamp: Utc::now(),
        })
    }

    async fn get_balance(&self, symbol: &str) -> Result<Balance, ExchangeError> {
        let book = self.book.lock().await;
        Ok(Balance {
            symbol: symbol.to_string(),
            base_free: book.base_balances.get(symbol).copied().unwrap_or_default(),
            quote_free: book.quote_balance,
        })
    }
}
