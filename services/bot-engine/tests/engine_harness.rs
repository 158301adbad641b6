//! End-to-end engine scenarios against a scripted exchange and the in-memory
//! store

mod mock_exchange;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bot_engine::config::{Settings, SubmitSettings, WorkerSettings};
use bot_engine::exchange::{
    Balance, ExchangeError, ExchangeErrorKind, MarketDataProvider, MarketInfo, RemoteTrade, Ticker,
};
use bot_engine::models::{Bot, BotStatus, NewBot, OrderDraft, OrderSide, OrderStatus, OrderType};
use bot_engine::observability;
use bot_engine::store::BotStore;
use bot_engine::{ids, Engine, EngineError, ErrorCode, MemoryStore, TickOutcome, Worker};
use chrono::Utc;
use mock_exchange::{MockExchange, SYMBOL};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use uuid::Uuid;

struct Harness {
    engine: Engine,
    store: Arc<MemoryStore>,
    exchange: Arc<MockExchange>,
    user_id: Uuid,
    account_id: Uuid,
}

fn test_settings() -> Settings {
    Settings {
        submit: SubmitSettings {
            max_attempts: 3,
            base_delay_ms: 0,
            max_delay_ms: 0,
            jitter_ms: 0,
        },
        ..Settings::default()
    }
}

fn harness_with(settings: Settings, exchange: MockExchange) -> Harness {
    let store = Arc::new(MemoryStore::new());
    let exchange = Arc::new(exchange);
    let engine = Engine::new(&settings, store.clone(), exchange.clone(), exchange.clone());
    Harness {
        engine,
        store,
        exchange,
        user_id: Uuid::new_v4(),
        account_id: Uuid::new_v4(),
    }
}

fn harness() -> Harness {
    harness_with(test_settings(), MockExchange::new())
}

/// Something an operator does while a tick is between reading the bot and
/// writing its order
enum Interjection {
    Stop(Uuid),
    KillSwitch(Uuid),
}

/// Market data that runs one interjection inside `get_market_info`, the last
/// exchange read before the order intent is written
struct MidTick {
    inner: Arc<MockExchange>,
    engine: Mutex<Option<Engine>>,
    pending: Mutex<Option<Interjection>>,
}

impl MidTick {
    fn arm(&self, engine: &Engine, action: Interjection) {
        *self.engine.lock().unwrap() = Some(engine.clone());
        *self.pending.lock().unwrap() = Some(action);
    }
}

#[async_trait]
impl MarketDataProvider for MidTick {
    async fn get_market_info(&self, symbol: &str) -> Result<MarketInfo, ExchangeError> {
        let action = self.pending.lock().unwrap().take();
        let engine = self.engine.lock().unwrap().clone();
        if let (Some(action), Some(engine)) = (action, engine) {
            match action {
                Interjection::Stop(bot_id) => {
                    engine.stop(bot_id).await.unwrap();
                }
                Interjection::KillSwitch(user_id) => {
                    engine.enable_kill_switch(user_id, "operator").await.unwrap();
                }
            }
        }
        self.inner.get_market_info(symbol).await
    }

    async fn get_ticker(&self, symbol: &str) -> Result<Ticker, ExchangeError> {
        self.inner.get_ticker(symbol).await
    }

    async fn get_balance(&self, symbol: &str) -> Result<Balance, ExchangeError> {
        self.inner.get_balance(symbol).await
    }
}

fn hooked_harness() -> (Harness, Arc<MidTick>) {
    let settings = test_settings();
    let store = Arc::new(MemoryStore::new());
    let exchange = Arc::new(MockExchange::new());
    let hook = Arc::new(MidTick {
        inner: exchange.clone(),
        engine: Mutex::new(None),
        pending: Mutex::new(None),
    });
    let engine = Engine::new(&settings, store.clone(), exchange.clone(), hook.clone());
    let h = Harness {
        engine,
        store,
        exchange,
        user_id: Uuid::new_v4(),
        account_id: Uuid::new_v4(),
    };
    (h, hook)
}

/// Fixed base 100, +/-5% legs, one unit per leg
fn grid_config() -> serde_json::Value {
    serde_json::json!({
        "basePriceType": "fixed",
        "basePrice": "100",
        "riseSell": { "type": "percent", "value": "5" },
        "fallBuy": { "type": "percent", "value": "5" },
        "orderSize": { "base": "1" }
    })
}

impl Harness {
    async fn create(&self, symbol: &str, config: serde_json::Value) -> Bot {
        self.engine
            .create_bot(NewBot {
                user_id: self.user_id,
                exchange_account_id: self.account_id,
                symbol: symbol.to_string(),
                config,
            })
            .await
            .unwrap()
    }

    async fn started(&self, config: serde_json::Value) -> Bot {
        let bot = self.create(SYMBOL, config).await;
        self.engine.start(bot.id).await.unwrap()
    }

    async fn bot(&self, bot_id: Uuid) -> Bot {
        self.store.get_bot(bot_id).await.unwrap().unwrap()
    }
}

#[tokio::test]
async fn test_invalid_transition_leaves_bot_untouched() {
    let h = harness();
    let bot = h.create(SYMBOL, grid_config()).await;

    let err = h.engine.pause(bot.id).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidStateTransition);

    let after = h.bot(bot.id).await;
    assert_eq!(after.status, BotStatus::Draft);
    assert_eq!(after.status_version, 0);
}

#[tokio::test]
async fn test_repeated_commands_are_idempotent() {
    let h = harness();
    let bot = h.started(grid_config()).await;
    let again = h.engine.start(bot.id).await.unwrap();
    assert_eq!(again.status_version, bot.status_version);

    let paused = h.engine.pause(bot.id).await.unwrap();
    let paused_again = h.engine.pause(bot.id).await.unwrap();
    assert_eq!(paused_again.status, BotStatus::Paused);
    assert_eq!(paused_again.status_version, paused.status_version);
}

#[tokio::test]
async fn test_kill_switch_stops_only_trading_bots() {
    let h = harness();
    let running = h
        .started(serde_json::json!({ "basePrice": "100", "orderSize": { "base": "1" } }))
        .await;
    assert_eq!(running.status, BotStatus::Running);

    let paused = h.create("ETH/USDT", grid_config()).await;
    h.engine.start(paused.id).await.unwrap();
    let paused = h.engine.pause(paused.id).await.unwrap();

    let outcome = h
        .engine
        .enable_kill_switch(h.user_id, "manual")
        .await
        .unwrap();
    assert!(outcome.state.enabled);
    assert_eq!(outcome.affected_bots, 1);

    let stopped = h.bot(running.id).await;
    assert_eq!(stopped.status, BotStatus::Stopping);
    assert_eq!(stopped.status_version, running.status_version + 1);
    assert!(stopped.last_error.unwrap().contains("KILL_SWITCH"));

    let untouched = h.bot(paused.id).await;
    assert_eq!(untouched.status, BotStatus::Paused);
    assert_eq!(untouched.status_version, paused.status_version);

    // Locked until disabled
    let err = h.engine.resume(paused.id).await.unwrap_err();
    assert!(matches!(err, EngineError::KillSwitchLocked(_)));
    assert_eq!(h.bot(paused.id).await.status, BotStatus::Paused);
}

#[tokio::test]
async fn test_kill_switch_enable_and_disable_are_idempotent() {
    let h = harness();
    h.started(serde_json::json!({ "basePrice": "100", "orderSize": { "base": "1" } }))
        .await;

    let first = h.engine.enable_kill_switch(h.user_id, "panic").await.unwrap();
    let second = h.engine.enable_kill_switch(h.user_id, "panic").await.unwrap();
    assert_eq!(first.affected_bots, 1);
    assert_eq!(second.affected_bots, 0);
    assert!(second.state.enabled);

    assert!(!h.engine.disable_kill_switch(h.user_id).await.unwrap().enabled);
    assert!(!h.engine.disable_kill_switch(h.user_id).await.unwrap().enabled);
    assert!(!h.engine.kill_switch_status(h.user_id).await.unwrap().enabled);

    // Disabling resumes nothing
    let bots = h.store.list_bots_for_user(h.user_id).await.unwrap();
    assert!(bots.iter().all(|b| b.status == BotStatus::Stopping));
}

#[tokio::test]
async fn test_first_trigger_places_one_order_and_runs_bot() {
    let h = harness();
    let bot = h.started(grid_config()).await;
    assert_eq!(bot.status, BotStatus::WaitingTrigger);

    let outcome = h.engine.processor().tick_at(&bot, dec!(94)).await.unwrap();
    let TickOutcome::Submitted(order) = outcome else {
        panic!("expected a submitted order, got {:?}", outcome);
    };
    assert_eq!(order.intent_seq, 1);
    assert_eq!(order.side, OrderSide::Buy);
    assert_eq!(order.price, dec!(95));
    assert_eq!(order.client_order_id, ids::client_order_id(bot.id, 1));
    assert!(order.is_submitted());

    let running = h.bot(bot.id).await;
    assert_eq!(running.status, BotStatus::Running);
    assert_eq!(running.status_version, bot.status_version + 1);

    // Same price again: the open order blocks a second one
    let again = h.engine.processor().tick_at(&running, dec!(94)).await.unwrap();
    assert_eq!(again, TickOutcome::AwaitingFill);
    assert_eq!(h.store.list_orders(bot.id).await.unwrap().len(), 1);
    assert_eq!(h.exchange.created().len(), 1);
}

#[tokio::test]
async fn test_fill_anchors_next_leg() {
    let h = harness();
    let bot = h.started(grid_config()).await;
    let TickOutcome::Submitted(buy) = h.engine.processor().tick_at(&bot, dec!(94)).await.unwrap() else {
        panic!("expected a submitted order");
    };

    h.exchange.fill(&buy.client_order_id, "t-1", dec!(94), dec!(1));
    let running = h.bot(bot.id).await;
    let report = h.engine.reconciler().reconcile(&running).await.unwrap();
    assert!(report.success);
    assert_eq!(report.trades_inserted, 1);

    let filled = h
        .store
        .get_order("mock", &buy.client_order_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(filled.status, OrderStatus::Filled);
    assert_eq!(filled.avg_fill_price, Some(dec!(94)));

    // Sell leg anchors on the 94 fill: 94 * 1.05 = 98.70
    assert_eq!(
        h.engine.processor().tick_at(&running, dec!(98)).await.unwrap(),
        TickOutcome::NoTrigger
    );
    let TickOutcome::Submitted(sell) = h.engine.processor().tick_at(&running, dec!(99)).await.unwrap() else {
        panic!("expected a sell order");
    };
    assert_eq!(sell.side, OrderSide::Sell);
    assert_eq!(sell.price, dec!(98.70));
    assert_eq!(sell.intent_seq, 2);
}

#[tokio::test]
async fn test_reconcile_twice_writes_nothing_new() {
    let h = harness();
    let bot = h.started(grid_config()).await;
    let TickOutcome::Submitted(buy) = h.engine.processor().tick_at(&bot, dec!(94)).await.unwrap() else {
        panic!("expected a submitted order");
    };
    h.exchange.fill(&buy.client_order_id, "t-1", dec!(95), dec!(1));

    let bot = h.bot(bot.id).await;
    let first = h.engine.reconciler().reconcile(&bot).await.unwrap();
    assert_eq!(first.trades_inserted, 1);
    assert!(first.snapshot_written);

    let second = h.engine.reconciler().reconcile(&bot).await.unwrap();
    assert!(second.success);
    assert_eq!(second.trades_inserted, 0);
    assert_eq!(second.trades_skipped, 1);
    assert!(!second.snapshot_written);

    assert_eq!(h.store.list_trades(bot.id).await.unwrap().len(), 1);
    let snapshots = h.store.list_snapshots(bot.id).await.unwrap();
    assert_eq!(snapshots.len(), 1);
    assert_eq!(snapshots[0].run_id, bot.run_id);
}

#[tokio::test]
async fn test_amount_below_minimum_fails_bot() {
    let exchange = MockExchange::new().with_market(MarketInfo {
        symbol: SYMBOL.to_string(),
        min_amount: dec!(1),
        min_notional: dec!(1),
        price_precision: 2,
        amount_precision: 6,
    });
    let h = harness_with(test_settings(), exchange);
    let mut config = grid_config();
    config["orderSize"] = serde_json::json!({ "base": "0.5" });
    let bot = h.started(config).await;

    let outcome = h.engine.processor().tick_at(&bot, dec!(94)).await.unwrap();
    assert_eq!(outcome, TickOutcome::Failed(ErrorCode::BelowMinAmount));

    let failed = h.bot(bot.id).await;
    assert_eq!(failed.status, BotStatus::Error);
    assert!(failed.last_error.unwrap().starts_with("BELOW_MIN_AMOUNT"));
    assert!(h.store.list_orders(bot.id).await.unwrap().is_empty());
    assert!(h.exchange.created().is_empty());

    // Failed with nothing open: the worker leaves it alone
    let report = h.engine.tick_bot(bot.id).await.unwrap();
    assert!(report.reconcile.is_none());
    assert!(report.outcome.is_none());
}

#[tokio::test]
async fn test_notional_below_minimum_fails_bot() {
    let exchange = MockExchange::new().with_market(MarketInfo {
        symbol: SYMBOL.to_string(),
        min_amount: dec!(0.001),
        min_notional: dec!(1000),
        price_precision: 2,
        amount_precision: 6,
    });
    let h = harness_with(test_settings(), exchange);
    let bot = h.started(grid_config()).await;

    let outcome = h.engine.processor().tick_at(&bot, dec!(94)).await.unwrap();
    assert_eq!(outcome, TickOutcome::Failed(ErrorCode::BelowMinNotional));
    assert!(h.store.list_orders(bot.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_restart_resubmits_pending_intent() {
    let h = harness();
    let bot = h.started(grid_config()).await;

    // Intent written, process died before the exchange call
    let pending = h
        .store
        .create_order_intent(
            bot.id,
            bot.status_version,
            "mock",
            &OrderDraft {
                side: OrderSide::Buy,
                order_type: OrderType::Limit,
                price: dec!(95),
                amount: dec!(1),
            },
        )
        .await
        .unwrap();
    assert!(!pending.is_submitted());

    h.exchange.set_price(dec!(94));
    let report = h.engine.tick_bot(bot.id).await.unwrap();
    assert!(matches!(report.outcome, Some(TickOutcome::Submitted(_))));

    let created = h.exchange.created();
    assert_eq!(created.len(), 1);
    assert_eq!(created[0].client_order_id, pending.client_order_id);

    let orders = h.store.list_orders(bot.id).await.unwrap();
    assert_eq!(orders.len(), 1);
    assert!(orders[0].is_submitted());
    assert_eq!(orders[0].exchange_order_id.as_deref(), Some("mock-1"));
    assert_eq!(h.bot(bot.id).await.status, BotStatus::Running);
}

#[tokio::test]
async fn test_retryable_failures_defer_then_submit() {
    let h = harness();
    let bot = h.started(grid_config()).await;
    h.exchange.fail_next_creates(vec![
        ExchangeError::Timeout("read timed out".to_string()),
        ExchangeError::RateLimit {
            message: "slow down".to_string(),
            retry_after: None,
        },
    ]);

    let processor = h.engine.processor();
    assert_eq!(
        processor.tick_at(&bot, dec!(94)).await.unwrap(),
        TickOutcome::SubmitDeferred { attempts: 1 }
    );
    let pending = h.store.open_order(bot.id).await.unwrap().unwrap();
    assert_eq!(pending.submit_attempts, 1);
    assert!(pending.last_submit_error.unwrap().starts_with("TIMEOUT"));

    assert_eq!(
        processor.tick_at(&bot, dec!(94)).await.unwrap(),
        TickOutcome::SubmitDeferred { attempts: 2 }
    );
    let outcome = processor.tick_at(&bot, dec!(94)).await.unwrap();
    let TickOutcome::Submitted(order) = outcome else {
        panic!("expected submission on the third attempt, got {:?}", outcome);
    };
    assert_eq!(order.client_order_id, pending.client_order_id);
    assert_eq!(h.store.list_orders(bot.id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_retries_exhausted_fails_bot() {
    let h = harness();
    let bot = h.started(grid_config()).await;
    h.exchange.fail_next_creates(vec![
        ExchangeError::Unavailable("503".to_string()),
        ExchangeError::Unavailable("503".to_string()),
        ExchangeError::Unavailable("503".to_string()),
    ]);

    let processor = h.engine.processor();
    processor.tick_at(&bot, dec!(94)).await.unwrap();
    processor.tick_at(&bot, dec!(94)).await.unwrap();
    let outcome = processor.tick_at(&bot, dec!(94)).await.unwrap();
    assert_eq!(outcome, TickOutcome::Failed(ErrorCode::OrderSubmitFailed));

    let failed = h.bot(bot.id).await;
    assert_eq!(failed.status, BotStatus::Error);
    assert!(failed.last_error.unwrap().starts_with("ORDER_SUBMIT_FAILED"));
    assert!(h.exchange.created().is_empty());
}

#[tokio::test]
async fn test_non_retryable_failure_fails_immediately() {
    let h = harness();
    let bot = h.started(grid_config()).await;
    h.exchange
        .fail_next_creates(vec![ExchangeError::Auth("invalid api key".to_string())]);

    let outcome = h.engine.processor().tick_at(&bot, dec!(94)).await.unwrap();
    assert_eq!(outcome, TickOutcome::Failed(ErrorCode::OrderSubmitFailed));
    let failed = h.bot(bot.id).await;
    assert!(failed.last_error.unwrap().contains("AUTH"));
}

#[tokio::test]
async fn test_duplicate_order_counts_as_submitted() {
    let h = harness();
    let bot = h.started(grid_config()).await;
    let coid = ids::client_order_id(bot.id, 1);
    h.exchange.push_open_order(MockExchange::remote_order(
        "ext-9",
        &coid,
        OrderSide::Buy,
        dec!(95),
        dec!(1),
    ));
    h.exchange
        .fail_next_creates(vec![ExchangeError::DuplicateOrder("client id in use".to_string())]);

    let outcome = h.engine.processor().tick_at(&bot, dec!(94)).await.unwrap();
    let TickOutcome::Submitted(order) = outcome else {
        panic!("expected duplicate to count as submitted, got {:?}", outcome);
    };
    assert!(order.is_submitted());
    assert_eq!(order.exchange_order_id, None);

    let bot = h.bot(bot.id).await;
    assert_eq!(bot.status, BotStatus::Running);
    h.engine.reconciler().reconcile(&bot).await.unwrap();
    let linked = h.store.get_order("mock", &coid).await.unwrap().unwrap();
    assert_eq!(linked.exchange_order_id.as_deref(), Some("ext-9"));
}

#[tokio::test]
async fn test_trades_resolve_by_exchange_order_id() {
    let h = harness();
    let bot = h.started(grid_config()).await;
    let TickOutcome::Submitted(buy) = h.engine.processor().tick_at(&bot, dec!(94)).await.unwrap() else {
        panic!("expected a submitted order");
    };

    let trade = |trade_id: &str, eoid: Option<&str>, coid: Option<&str>| RemoteTrade {
        trade_id: trade_id.to_string(),
        exchange_order_id: eoid.map(str::to_string),
        client_order_id: coid.map(str::to_string),
        symbol: SYMBOL.to_string(),
        side: OrderSide::Buy,
        price: dec!(95),
        amount: dec!(0.4),
        fee: Decimal::ZERO,
        fee_currency: None,
        timestamp: Utc::now(),
    };
    // Mislabelled by the venue but carrying our exchange order id
    h.exchange
        .push_trade(trade("t-ours", Some("mock-1"), Some("someone-else-7")));
    // Not ours at all
    h.exchange.push_trade(trade("t-foreign", None, Some("manual-42")));

    let bot = h.bot(bot.id).await;
    let report = h.engine.reconciler().reconcile(&bot).await.unwrap();
    assert_eq!(report.trades_inserted, 1);
    assert_eq!(report.trades_skipped, 1);

    let trades = h.store.list_trades(bot.id).await.unwrap();
    assert_eq!(trades.len(), 1);
    assert_eq!(trades[0].client_order_id, buy.client_order_id);

    let partial = h.store.open_order(bot.id).await.unwrap().unwrap();
    assert_eq!(partial.status, OrderStatus::PartiallyFilled);
    assert_eq!(partial.filled_amount, dec!(0.4));
}

#[tokio::test]
async fn test_reconcile_recovers_unknown_order() {
    let h = harness();
    let bot = h.started(grid_config()).await;
    let coid = ids::client_order_id(bot.id, 3);
    h.exchange.push_open_order(MockExchange::remote_order(
        "ext-3",
        &coid,
        OrderSide::Sell,
        dec!(105),
        dec!(1),
    ));

    let report = h.engine.reconciler().reconcile(&bot).await.unwrap();
    assert_eq!(report.orders_recovered, 1);

    let recovered = h.store.open_order(bot.id).await.unwrap().unwrap();
    assert_eq!(recovered.client_order_id, coid);
    assert_eq!(recovered.intent_seq, 3);
    assert_eq!(h.bot(bot.id).await.intent_seq, 3);
}

#[tokio::test]
async fn test_reconcile_fetch_failure_changes_nothing() {
    let h = harness();
    let bot = h.started(grid_config()).await;
    h.exchange
        .fail_fetches(Some(ExchangeError::Timeout("gateway timeout".to_string())));

    let report = h.engine.reconciler().reconcile(&bot).await.unwrap();
    assert!(!report.success);
    assert_eq!(report.error_kind, Some(ExchangeErrorKind::Timeout));

    let after = h.bot(bot.id).await;
    assert_eq!(after.status, bot.status);
    assert_eq!(after.status_version, bot.status_version);
    assert!(h.store.list_snapshots(bot.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_missing_order_canceled_after_grace() {
    let mut settings = test_settings();
    settings.reconcile.missing_order_grace_secs = 0;
    let h = harness_with(settings, MockExchange::new());
    let bot = h.started(grid_config()).await;
    let TickOutcome::Submitted(buy) = h.engine.processor().tick_at(&bot, dec!(94)).await.unwrap() else {
        panic!("expected a submitted order");
    };

    h.exchange.drop_order(&buy.client_order_id);
    tokio::time::sleep(Duration::from_millis(5)).await;

    // The lookup confirms the venue canceled it
    let bot = h.bot(bot.id).await;
    let report = h.engine.reconciler().reconcile(&bot).await.unwrap();
    assert_eq!(report.orders_advanced, 1);
    let canceled = h
        .store
        .get_order("mock", &buy.client_order_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(canceled.status, OrderStatus::Canceled);
}

#[tokio::test]
async fn test_missing_order_without_answer_stays_open() {
    let mut settings = test_settings();
    settings.reconcile.missing_order_grace_secs = 0;
    let h = harness_with(settings, MockExchange::new());
    let bot = h.started(grid_config()).await;
    let TickOutcome::Submitted(buy) = h.engine.processor().tick_at(&bot, dec!(94)).await.unwrap() else {
        panic!("expected a submitted order");
    };

    h.exchange.forget_order(&buy.client_order_id);
    tokio::time::sleep(Duration::from_millis(5)).await;

    let bot = h.bot(bot.id).await;
    let report = h.engine.reconciler().reconcile(&bot).await.unwrap();
    assert!(report.success);
    assert_eq!(report.orders_advanced, 0);
    let open = h.store.open_order(bot.id).await.unwrap().unwrap();
    assert_eq!(open.status, OrderStatus::New);

    // Still blocks a second leg
    assert_eq!(
        h.engine.processor().tick_at(&bot, dec!(94)).await.unwrap(),
        TickOutcome::AwaitingFill
    );
    assert_eq!(h.exchange.created().len(), 1);
}

#[tokio::test]
async fn test_lagging_trade_feed_blocks_next_leg() {
    let mut settings = test_settings();
    settings.reconcile.missing_order_grace_secs = 0;
    let h = harness_with(settings, MockExchange::new());
    let bot = h.started(grid_config()).await;
    let TickOutcome::Submitted(buy) = h.engine.processor().tick_at(&bot, dec!(94)).await.unwrap() else {
        panic!("expected a submitted order");
    };

    // Filled venue-side, but the fill is not in the trade feed yet
    h.exchange.hide_trades(true);
    h.exchange.fill(&buy.client_order_id, "t-1", dec!(94), dec!(1));
    tokio::time::sleep(Duration::from_millis(5)).await;

    let running = h.bot(bot.id).await;
    let report = h.engine.reconciler().reconcile(&running).await.unwrap();
    assert!(report.success);
    assert_eq!(report.trades_inserted, 0);
    let filled = h
        .store
        .get_order("mock", &buy.client_order_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(filled.status, OrderStatus::Filled);
    assert_eq!(filled.filled_amount, dec!(1));

    // No second buy, and no sell until the fill is recorded
    let processor = h.engine.processor();
    assert_eq!(processor.tick_at(&running, dec!(94)).await.unwrap(), TickOutcome::AwaitingFill);
    assert_eq!(processor.tick_at(&running, dec!(99)).await.unwrap(), TickOutcome::AwaitingFill);
    assert_eq!(h.exchange.created().len(), 1);

    h.exchange.hide_trades(false);
    let report = h.engine.reconciler().reconcile(&running).await.unwrap();
    assert_eq!(report.trades_inserted, 1);

    let TickOutcome::Submitted(sell) = processor.tick_at(&running, dec!(99)).await.unwrap() else {
        panic!("expected the sell leg once the fill is recorded");
    };
    assert_eq!(sell.side, OrderSide::Sell);
    assert_eq!(sell.price, dec!(98.70));
    assert_eq!(h.exchange.created().len(), 2);
}

#[tokio::test]
async fn test_failed_bot_still_reconciles_landed_order() {
    let h = harness();
    let bot = h.started(grid_config()).await;
    let coid = ids::client_order_id(bot.id, 1);

    // The venue took the order, but the reply was lost
    h.exchange.push_open_order(MockExchange::remote_order(
        "ext-1",
        &coid,
        OrderSide::Buy,
        dec!(95),
        dec!(1),
    ));
    h.exchange
        .fail_next_creates(vec![ExchangeError::Unknown("connection reset".to_string())]);
    let outcome = h.engine.processor().tick_at(&bot, dec!(94)).await.unwrap();
    assert_eq!(outcome, TickOutcome::Failed(ErrorCode::OrderSubmitFailed));
    assert_eq!(h.bot(bot.id).await.status, BotStatus::Error);

    let worker = Worker::new(h.engine.clone(), WorkerSettings::default());
    let summary = worker.run_once().await.unwrap();
    assert_eq!(summary.bots, 1);
    assert!(summary.reports[0].reconcile.is_some());
    assert!(summary.reports[0].outcome.is_none());
    let linked = h.store.get_order("mock", &coid).await.unwrap().unwrap();
    assert_eq!(linked.exchange_order_id.as_deref(), Some("ext-1"));
    assert!(linked.is_submitted());

    h.exchange.fill(&coid, "t-1", dec!(95), dec!(1));
    worker.run_once().await.unwrap();

    let filled = h.store.get_order("mock", &coid).await.unwrap().unwrap();
    assert_eq!(filled.status, OrderStatus::Filled);
    assert_eq!(filled.avg_fill_price, Some(dec!(95)));
    assert_eq!(h.store.list_trades(bot.id).await.unwrap().len(), 1);
    assert_eq!(h.bot(bot.id).await.status, BotStatus::Error);
    assert!(h.exchange.created().is_empty());

    // Nothing open any more: the next pass skips it
    let summary = worker.run_once().await.unwrap();
    assert!(summary.reports[0].reconcile.is_none());
}

#[tokio::test]
async fn test_missing_order_kept_within_grace() {
    let h = harness();
    let bot = h.started(grid_config()).await;
    let TickOutcome::Submitted(buy) = h.engine.processor().tick_at(&bot, dec!(94)).await.unwrap() else {
        panic!("expected a submitted order");
    };
    h.exchange.drop_order(&buy.client_order_id);

    let bot = h.bot(bot.id).await;
    h.engine.reconciler().reconcile(&bot).await.unwrap();
    let open = h.store.open_order(bot.id).await.unwrap().unwrap();
    assert_eq!(open.status, OrderStatus::New);
}

#[tokio::test]
async fn test_stop_drains_then_stops() {
    let h = harness();
    let bot = h.started(grid_config()).await;
    let TickOutcome::Submitted(buy) = h.engine.processor().tick_at(&bot, dec!(94)).await.unwrap() else {
        panic!("expected a submitted order");
    };

    let stopping = h.engine.stop(bot.id).await.unwrap();
    assert_eq!(stopping.status, BotStatus::Stopping);

    let report = h.engine.tick_bot(bot.id).await.unwrap();
    assert_eq!(report.orders_cancel_requested, 1);
    assert!(report.stop_completed);
    assert_eq!(h.exchange.canceled(), vec!["mock-1".to_string()]);

    let stopped = h.bot(bot.id).await;
    assert_eq!(stopped.status, BotStatus::Stopped);
    let order = h
        .store
        .get_order("mock", &buy.client_order_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(order.status, OrderStatus::Canceled);

    // Stopped bots are not ticked
    let idle = h.engine.tick_bot(bot.id).await.unwrap();
    assert!(idle.reconcile.is_none());
}

#[tokio::test]
async fn test_stop_waits_while_exchange_unreachable() {
    let h = harness();
    let bot = h.started(grid_config()).await;
    h.engine.processor().tick_at(&bot, dec!(94)).await.unwrap();
    h.engine.stop(bot.id).await.unwrap();

    h.exchange
        .fail_fetches(Some(ExchangeError::Unavailable("down".to_string())));
    let report = h.engine.tick_bot(bot.id).await.unwrap();
    assert!(!report.stop_completed);
    assert_eq!(h.bot(bot.id).await.status, BotStatus::Stopping);

    h.exchange.fail_fetches(None);
    let report = h.engine.tick_bot(bot.id).await.unwrap();
    assert!(report.stop_completed);
    assert_eq!(h.bot(bot.id).await.status, BotStatus::Stopped);
}

#[tokio::test]
async fn test_auto_close_moves_bot_to_stopping() {
    let h = harness();
    let mut config = grid_config();
    config["autoClose"] = serde_json::json!({ "dropPercent": "20" });
    let bot = h.started(config).await;

    let outcome = h.engine.processor().tick_at(&bot, dec!(80)).await.unwrap();
    assert_eq!(outcome, TickOutcome::RiskStopped);

    let stopping = h.bot(bot.id).await;
    assert_eq!(stopping.status, BotStatus::Stopping);
    assert!(stopping.auto_close_triggered_at.is_some());
    assert!(stopping.auto_close_reason.unwrap().contains("floor 80"));
    assert!(h.store.list_orders(bot.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_auto_close_not_hit_above_floor() {
    let h = harness();
    let mut config = grid_config();
    config["autoClose"] = serde_json::json!({ "dropPercent": "20" });
    let bot = h.started(config).await;

    let outcome = h.engine.processor().tick_at(&bot, dec!(81)).await.unwrap();
    assert!(matches!(outcome, TickOutcome::Submitted(_)));
    assert!(h.bot(bot.id).await.auto_close_reason.is_none());
}

#[tokio::test]
async fn test_price_bounds_skip_leg() {
    let h = harness();
    let mut config = grid_config();
    config["priceMin"] = serde_json::json!("96");
    let bot = h.started(config).await;

    let outcome = h.engine.processor().tick_at(&bot, dec!(94)).await.unwrap();
    assert_eq!(outcome, TickOutcome::OutOfBounds);
    assert!(h.store.list_orders(bot.id).await.unwrap().is_empty());
    assert_eq!(h.bot(bot.id).await.status, BotStatus::WaitingTrigger);
}

#[tokio::test]
async fn test_market_info_failure_leaves_bot_alone() {
    let h = harness();
    let bot = h.started(grid_config()).await;
    h.exchange
        .fail_market_info(Some(ExchangeError::Unavailable("503".to_string())));

    let err = h.engine.processor().tick_at(&bot, dec!(94)).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::ExchangeUnavailable);
    assert_eq!(h.bot(bot.id).await.status, BotStatus::WaitingTrigger);
    assert!(h.store.list_orders(bot.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_worker_pass_ticks_active_bots() {
    let h = harness();
    let trading = h.started(grid_config()).await;
    let draft = h.create("ETH/USDT", grid_config()).await;
    h.exchange.set_price(dec!(94));

    let worker = Worker::new(h.engine.clone(), WorkerSettings::default());
    let summary = worker.run_once().await.unwrap();
    assert_eq!(summary.bots, 1);
    assert_eq!(summary.completed, 1);
    assert_eq!(summary.reports[0].bot_id, trading.id);
    assert!(matches!(
        summary.reports[0].outcome,
        Some(TickOutcome::Submitted(_))
    ));

    assert_eq!(h.bot(draft.id).await.status, BotStatus::Draft);
    assert_eq!(h.bot(trading.id).await.status, BotStatus::Running);

    let metrics = h.engine.metrics();
    assert_eq!(metrics.get_counter(observability::metrics::WORKER_TICKS).await, 1);
    assert_eq!(metrics.get_counter(observability::metrics::ORDER_SUBMITTED).await, 1);
}

#[tokio::test]
async fn test_config_edit_only_when_not_trading() {
    let h = harness();
    let bot = h.started(grid_config()).await;

    let mut edited = grid_config();
    edited["basePrice"] = serde_json::json!("110");
    let err = h.engine.update_config(bot.id, edited.clone()).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::ConfigValidationError);

    let paused = h.engine.pause(bot.id).await.unwrap();
    let updated = h.engine.update_config(bot.id, edited).await.unwrap();
    assert_eq!(updated.config_revision, paused.config_revision + 1);
    assert_eq!(updated.status_version, paused.status_version);

    // The new base price is frozen on resume
    let resumed = h.engine.resume(bot.id).await.unwrap();
    assert_eq!(resumed.base_price, Some(dec!(110)));
}

#[tokio::test]
async fn test_stop_during_tick_places_nothing() {
    let (h, hook) = hooked_harness();
    let bot = h.started(grid_config()).await;
    hook.arm(&h.engine, Interjection::Stop(bot.id));

    let outcome = h.engine.processor().tick_at(&bot, dec!(94)).await.unwrap();
    assert_eq!(outcome, TickOutcome::Preempted);
    assert!(h.store.list_orders(bot.id).await.unwrap().is_empty());
    assert!(h.exchange.created().is_empty());

    let stopping = h.bot(bot.id).await;
    assert_eq!(stopping.status, BotStatus::Stopping);
    assert_eq!(stopping.intent_seq, 0);

    let report = h.engine.tick_bot(bot.id).await.unwrap();
    assert!(report.stop_completed);
    assert_eq!(h.bot(bot.id).await.status, BotStatus::Stopped);
}

#[tokio::test]
async fn test_kill_switch_during_tick_places_nothing() {
    let (h, hook) = hooked_harness();
    let bot = h.started(grid_config()).await;
    hook.arm(&h.engine, Interjection::KillSwitch(h.user_id));

    let outcome = h.engine.processor().tick_at(&bot, dec!(94)).await.unwrap();
    assert_eq!(outcome, TickOutcome::Preempted);
    assert!(h.store.list_orders(bot.id).await.unwrap().is_empty());
    assert!(h.exchange.created().is_empty());

    let stopped = h.bot(bot.id).await;
    assert_eq!(stopped.status, BotStatus::Stopping);
    assert!(stopped.last_error.unwrap().starts_with("KILL_SWITCH"));
    assert!(h.engine.kill_switch_status(h.user_id).await.unwrap().enabled);
}

#[tokio::test]
async fn test_stale_tick_does_not_resubmit_pending_intent() {
    let h = harness();
    let bot = h.started(grid_config()).await;
    h.exchange
        .fail_next_creates(vec![ExchangeError::Timeout("read timed out".to_string())]);
    assert_eq!(
        h.engine.processor().tick_at(&bot, dec!(94)).await.unwrap(),
        TickOutcome::SubmitDeferred { attempts: 1 }
    );

    // Stopped between this tick's read and its resubmission
    h.engine.stop(bot.id).await.unwrap();
    let outcome = h.engine.processor().tick_at(&bot, dec!(94)).await.unwrap();
    assert_eq!(outcome, TickOutcome::Preempted);
    assert!(h.exchange.created().is_empty());
    let pending = h.store.open_order(bot.id).await.unwrap().unwrap();
    assert!(!pending.is_submitted());
}

#[tokio::test]
async fn test_enabled_switch_stops_unswept_bot_on_tick() {
    let h = harness();
    let bot = h.started(grid_config()).await;

    // Flag persisted but the sweep never reached this bot
    h.store
        .set_kill_switch(h.user_id, true, Some("sweep interrupted"))
        .await
        .unwrap();

    let outcome = h.engine.processor().tick_at(&bot, dec!(94)).await.unwrap();
    assert_eq!(outcome, TickOutcome::KillSwitched);
    assert!(h.store.list_orders(bot.id).await.unwrap().is_empty());
    assert!(h.exchange.created().is_empty());

    let stopping = h.bot(bot.id).await;
    assert_eq!(stopping.status, BotStatus::Stopping);
    assert_eq!(
        stopping.last_error.as_deref(),
        Some("KILL_SWITCH: sweep interrupted")
    );
}

#[tokio::test]
async fn test_repeat_enable_sweeps_remaining_bots() {
    let h = harness();
    let bot = h.started(grid_config()).await;
    h.store
        .set_kill_switch(h.user_id, true, Some("first"))
        .await
        .unwrap();

    let outcome = h.engine.enable_kill_switch(h.user_id, "again").await.unwrap();
    assert_eq!(outcome.affected_bots, 1);
    assert_eq!(h.bot(bot.id).await.status, BotStatus::Stopping);
}

#[tokio::test]
async fn test_oversized_order_fails_instead_of_overflowing() {
    let h = harness();
    let mut config = grid_config();
    config["orderSize"] = serde_json::json!({ "base": "79228162514264337593543950335" });
    let bot = h.started(config).await;

    let outcome = h.engine.processor().tick_at(&bot, dec!(94)).await.unwrap();
    assert_eq!(outcome, TickOutcome::Failed(ErrorCode::ConfigValidationError));

    let failed = h.bot(bot.id).await;
    assert_eq!(failed.status, BotStatus::Error);
    assert!(failed.last_error.unwrap().starts_with("CONFIG_VALIDATION_ERROR"));
    assert!(h.store.list_orders(bot.id).await.unwrap().is_empty());
    assert!(h.exchange.created().is_empty());
}
