//! Scripted exchange for testing without a venue
#![allow(dead_code)]

use async_trait::async_trait;
use bot_engine::exchange::{
    Balance, ExchangeError, ExchangeExecutor, MarketDataProvider, MarketInfo, OrderRequest,
    PlacedOrder, RemoteOrder, RemoteTrade, Ticker,
};
use bot_engine::models::{OrderSide, OrderStatus, OrderType};
use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::VecDeque;
use std::sync::Mutex;

pub const SYMBOL: &str = "BTC/USDT";

struct MockState {
    price: Decimal,
    market: MarketInfo,
    open_orders: Vec<RemoteOrder>,
    closed_orders: Vec<RemoteOrder>,
    trades: Vec<RemoteTrade>,
    trades_hidden: bool,
    create_failures: VecDeque<ExchangeError>,
    fetch_failure: Option<ExchangeError>,
    market_failure: Option<ExchangeError>,
    created: Vec<OrderRequest>,
    canceled: Vec<String>,
    next_id: u64,
}

/// Exchange double: orders rest until the test fills them, failures are
/// queued up front
pub struct MockExchange {
    state: Mutex<MockState>,
}

impl MockExchange {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState {
                price: dec!(100),
                market: MarketInfo {
                    symbol: SYMBOL.to_string(),
                    min_amount: dec!(0.001),
                    min_notional: dec!(1),
                    price_precision: 2,
                    amount_precision: 6,
                },
                open_orders: Vec::new(),
                closed_orders: Vec::new(),
                trades: Vec::new(),
                trades_hidden: false,
                create_failures: VecDeque::new(),
                fetch_failure: None,
                market_failure: None,
                created: Vec::new(),
                canceled: Vec::new(),
                next_id: 0,
            }),
        }
    }

    pub fn with_market(self, market: MarketInfo) -> Self {
        self.state.lock().unwrap().market = market;
        self
    }

    pub fn set_price(&self, price: Decimal) {
        self.state.lock().unwrap().price = price;
    }

    /// Fail the next `create_order` calls, in order
    pub fn fail_next_creates(&self, errors: Vec<ExchangeError>) {
        self.state.lock().unwrap().create_failures.extend(errors);
    }

    /// Keep recorded fills out of `fetch_my_trades`, as a lagging trade feed
    /// would
    pub fn hide_trades(&self, hidden: bool) {
        self.state.lock().unwrap().trades_hidden = hidden;
    }

    /// Fail every fetch (including lookups) until cleared
    pub fn fail_fetches(&self, error: Option<ExchangeError>) {
        self.state.lock().unwrap().fetch_failure = error;
    }

    pub fn fail_market_info(&self, error: Option<ExchangeError>) {
        self.state.lock().unwrap().market_failure = error;
    }

    /// Accepted order requests
    pub fn created(&self) -> Vec<OrderRequest> {
        self.state.lock().unwrap().created.clone()
    }

    pub fn canceled(&self) -> Vec<String> {
        self.state.lock().unwrap().canceled.clone()
    }

    pub fn open_orders(&self) -> Vec<RemoteOrder> {
        self.state.lock().unwrap().open_orders.clone()
    }

    /// Put an order on the book as if placed elsewhere
    pub fn push_open_order(&self, order: RemoteOrder) {
        self.state.lock().unwrap().open_orders.push(order);
    }

    pub fn push_trade(&self, trade: RemoteTrade) {
        self.state.lock().unwrap().trades.push(trade);
    }

    /// Cancel an order venue-side, without a fill
    pub fn drop_order(&self, client_order_id: &str) {
        let mut state = self.state.lock().unwrap();
        if let Some(index) = state
            .open_orders
            .iter()
            .position(|o| o.client_order_id.as_deref() == Some(client_order_id))
        {
            let mut order = state.open_orders.remove(index);
            order.status = OrderStatus::Canceled;
            state.closed_orders.push(order);
        }
    }

    /// Lose every trace of an order, so lookups fail
    pub fn forget_order(&self, client_order_id: &str) {
        let mut state = self.state.lock().unwrap();
        let other = |o: &RemoteOrder| o.client_order_id.as_deref() != Some(client_order_id);
        state.open_orders.retain(other);
        state.closed_orders.retain(other);
    }

    /// Fill `amount` of a resting order at `price`, recording a trade
    pub fn fill(&self, client_order_id: &str, trade_id: &str, price: Decimal, amount: Decimal) {
        let mut state = self.state.lock().unwrap();
        let index = state
            .open_orders
            .iter()
            .position(|o| o.client_order_id.as_deref() == Some(client_order_id))
            .expect("no resting order with that client order id");

        let order = &mut state.open_orders[index];
        order.filled_amount += amount;
        order.avg_fill_price = Some(price);
        order.status = if order.filled_amount >= order.amount {
            OrderStatus::Filled
        } else {
            OrderStatus::PartiallyFilled
        };
        let trade = RemoteTrade {
            trade_id: trade_id.to_string(),
            exchange_order_id: Some(order.exchange_order_id.clone()),
            client_order_id: order.client_order_id.clone(),
            symbol: order.symbol.clone(),
            side: order.side,
            price,
            amount,
            fee: Decimal::ZERO,
            fee_currency: Some("USDT".to_string()),
            timestamp: Utc::now(),
        };
        if order.status == OrderStatus::Filled {
            let done = state.open_orders.remove(index);
            state.closed_orders.push(done);
        }
        state.trades.push(trade);
    }

    pub fn remote_order(
        exchange_order_id: &str,
        client_order_id: &str,
        side: OrderSide,
        price: Decimal,
        amount: Decimal,
    ) -> RemoteOrder {
        RemoteOrder {
            exchange_order_id: exchange_order_id.to_string(),
            client_order_id: Some(client_order_id.to_string()),
            symbol: SYMBOL.to_string(),
            side,
            order_type: OrderType::Limit,
            price,
            amount,
            filled_amount: Decimal::ZERO,
            avg_fill_price: None,
            status: OrderStatus::New,
        }
    }
}

#[async_trait]
impl ExchangeExecutor for MockExchange {
    fn name(&self) -> &str {
        "mock"
    }

    async fn fetch_open_orders(&self, symbol: &str) -> Result<Vec<RemoteOrder>, ExchangeError> {
        let state = self.state.lock().unwrap();
        if let Some(err) = &state.fetch_failure {
            return Err(err.clone());
        }
        Ok(state
            .open_orders
            .iter()
            .filter(|o| o.symbol == symbol)
            .cloned()
            .collect())
    }

    async fn fetch_my_trades(&self, symbol: &str) -> Result<Vec<RemoteTrade>, ExchangeError> {
        let state = self.state.lock().unwrap();
        if let Some(err) = &state.fetch_failure {
            return Err(err.clone());
        }
        if state.trades_hidden {
            return Ok(Vec::new());
        }
        Ok(state
            .trades
            .iter()
            .filter(|t| t.symbol == symbol)
            .cloned()
            .collect())
    }

    async fn create_order(&self, request: &OrderRequest) -> Result<PlacedOrder, ExchangeError> {
        let mut state = self.state.lock().unwrap();
        if let Some(err) = state.create_failures.pop_front() {
            return Err(err);
        }

        state.next_id += 1;
        let exchange_order_id = format!("mock-{}", state.next_id);
        state.created.push(request.clone());
        state.open_orders.push(RemoteOrder {
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

        Ok(PlacedOrder {
            exchange_order_id,
            client_order_id: request.client_order_id.clone(),
            accepted_at: Utc::now(),
        })
    }

    async fn cancel_order(&self, exchange_order_id: &str, _symbol: &str) -> Result<(), ExchangeError> {
        let mut state = self.state.lock().unwrap();
        if let Some(index) = state
            .open_orders
            .iter()
            .position(|o| o.exchange_order_id == exchange_order_id)
        {
            let mut order = state.open_orders.remove(index);
            order.status = OrderStatus::Canceled;
            state.closed_orders.push(order);
        }
        state.canceled.push(exchange_order_id.to_string());
        Ok(())
    }

    async fn fetch_order(&self, exchange_order_id: &str, _symbol: &str) -> Result<RemoteOrder, ExchangeError> {
        let state = self.state.lock().unwrap();
        if let Some(err) = &state.fetch_failure {
            return Err(err.clone());
        }
        state
            .open_orders
            .iter()
            .chain(state.closed_orders.iter())
            .find(|o| o.exchange_order_id == exchange_order_id)
            .cloned()
            .ok_or_else(|| ExchangeError::BadRequest(format!("unknown order {}", exchange_order_id)))
    }
}

#[async_trait]
impl MarketDataProvider for MockExchange {
    async fn get_market_info(&self, _symbol: &str) -> Result<MarketInfo, ExchangeError> {
        let state = self.state.lock().unwrap();
        if let Some(err) = &state.market_failure {
            return Err(err.clone());
        }
        Ok(state.market.clone())
    }

    async fn get_ticker(&self, symbol: &str) -> Result<Ticker, ExchangeError> {
        let state = self.state.lock().unwrap();
        if let Some(err) = &state.market_failure {
            return Err(err.clone());
        }
        Ok(Ticker {
            symbol: symbol.to_string(),
            last: state.price,
            timestamp: Utc::now(),
        })
    }

    async fn get_balance(&self, symbol: &str) -> Result<Balance, ExchangeError> {
        Ok(Balance {
            symbol: symbol.to_string(),
            base_free: Decimal::ZERO,
            quote_free: dec!(10000),
        })
    }
}
