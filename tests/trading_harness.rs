//! End-to-end tests: a mocked broker and control transport drive the full
//! decision loop without any network access.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, TimeZone, Utc};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use tokio::sync::Mutex;

use quantbot::broker::{
    BrokerConnector, BrokerError, BrokerFill, OrderRequest, PlacementResponse,
};
use quantbot::config::{AppConfig, TradingMode};
use quantbot::control::{dispatch, ChannelError, CommandTransport, ControlMessage};
use quantbot::execution::OrderState;
use quantbot::market::{Candle, MarketDepth, Quote, Side};
use quantbot::risk::RiskConfig;
use quantbot::runner::BotRunner;
use quantbot::singleton::ProcessSingleton;

#[derive(Clone, Copy)]
enum Placement {
    Fill,
    Decline,
    AcceptWithoutId,
    TransportFail,
}

struct MockBroker {
    closes: Vec<f64>,
    last_volume_multiplier: f64,
    placement: Placement,
    placed: Mutex<Vec<OrderRequest>>,
    fills: Mutex<Vec<BrokerFill>>,
    balance: Decimal,
}

impl MockBroker {
    fn new(closes: Vec<f64>, placement: Placement) -> Self {
        Self {
            closes,
            last_volume_multiplier: 1.0,
            placement,
            placed: Mutex::new(Vec::new()),
            fills: Mutex::new(Vec::new()),
            balance: Decimal::from(500_000),
        }
    }

    fn candles(&self) -> Vec<Candle> {
        let start = Utc.with_ymd_and_hms(2026, 1, 5, 17, 0, 0).unwrap();
        let n = self.closes.len();
        self.closes
            .iter()
            .enumerate()
            .map(|(i, &px)| {
                let close = Decimal::from_f64(px).unwrap();
                let volume = if i == n - 1 {
                    100_000.0 * self.last_volume_multiplier
                } else {
                    100_000.0
                };
                Candle {
                    timestamp: start + ChronoDuration::days(i as i64),
                    open: close,
                    high: Decimal::from_f64(px * 1.01).unwrap(),
                    low: Decimal::from_f64(px * 0.99).unwrap(),
                    close,
                    volume: Decimal::from_f64(volume).unwrap(),
                }
            })
            .collect()
    }

    async fn add_fill(&self, symbol: &str, side: Side, quantity: u64, price: Decimal) {
        let mut fills = self.fills.lock().await;
        let order_id = format!("broker-{}", fills.len() + 1);
        fills.push(BrokerFill {
            order_id,
            symbol: symbol.to_string(),
            side,
            quantity,
            price,
            executed_at: Utc::now(),
        });
    }
}

#[async_trait]
impl BrokerConnector for MockBroker {
    async fn quote(&self, symbol: &str) -> Result<Quote, BrokerError> {
        let last = Decimal::from_f64(*self.closes.last().unwrap()).unwrap();
        Ok(Quote {
            symbol: symbol.to_string(),
            last,
            bid: Some(last * Decimal::new(999, 3)),
            ask: Some(last * Decimal::new(1001, 3)),
            timestamp: Utc::now(),
        })
    }

    async fn history(&self, _symbol: &str, _days: u32) -> Result<Vec<Candle>, BrokerError> {
        Ok(self.candles())
    }

    async fn depth(&self, _symbol: &str) -> Result<MarketDepth, BrokerError> {
        Err(BrokerError::Api {
            status: 404,
            body: "depth not available".to_string(),
        })
    }

    async fn place_order(&self, request: &OrderRequest) -> Result<PlacementResponse, BrokerError> {
        self.placed.lock().await.push(request.clone());
        match self.placement {
            Placement::Fill => Ok(PlacementResponse {
                order_id: Some("123456".to_string()),
                declined: None,
            }),
            Placement::Decline => Ok(PlacementResponse {
                order_id: None,
                declined: Some("insufficient buying power".to_string()),
            }),
            Placement::AcceptWithoutId => Ok(PlacementResponse {
                order_id: None,
                declined: None,
            }),
            Placement::TransportFail => Err(BrokerError::Api {
                status: 502,
                body: "bad gateway".to_string(),
            }),
        }
    }

    async fn available_balance(&self) -> Result<Decimal, BrokerError> {
        Ok(self.balance)
    }

    async fn recent_fills(&self) -> Result<Vec<BrokerFill>, BrokerError> {
        Ok(self.fills.lock().await.clone())
    }
}

struct MockTransport {
    sent: Mutex<Vec<(i64, String)>>,
}

#[async_trait]
impl CommandTransport for MockTransport {
    async fn get_updates(
        &self,
        _offset: i64,
        _timeout: Duration,
    ) -> Result<Vec<ControlMessage>, ChannelError> {
        Ok(Vec::new())
    }

    async fn send_message(&self, chat_id: i64, text: &str) -> Result<(), ChannelError> {
        self.sent.lock().await.push((chat_id, text.to_string()));
        Ok(())
    }
}

fn test_config(state_dir: &std::path::Path, mode: TradingMode) -> AppConfig {
    AppConfig {
        mode,
        continuous: false,
        interval_mins: 30,
        symbols: vec!["GGAL".to_string()],
        peers: Vec::new(),
        state_dir: state_dir.to_path_buf(),
        initial_capital: Decimal::from(100_000),
        broker_base_url: "http://mock.invalid".to_string(),
        broker_token: None,
        telegram_token: None,
        telegram_chat_id: None,
        risk: RiskConfig::default(),
        buy_threshold: 4,
        sell_threshold: -4,
    }
}

/// 1%/day uptrend with shallow periodic dips: positive expectancy and an
/// impulse structure, well inside a trending regime.
fn uptrend_closes(n: usize) -> Vec<f64> {
    (0..n)
        .map(|i| {
            let base = 100.0 * 1.01f64.powi(i as i32);
            if i % 3 == 0 {
                base * 0.995
            } else {
                base
            }
        })
        .collect()
}

fn downtrend_closes(n: usize) -> Vec<f64> {
    (0..n)
        .map(|i| {
            let base = 100.0 * 0.99f64.powi(i as i32);
            if i % 3 == 0 {
                base * 1.005
            } else {
                base
            }
        })
        .collect()
}

#[tokio::test]
async fn paper_tick_buys_on_strong_signal() {
    let dir = tempfile::TempDir::new().unwrap();
    let broker = Arc::new(MockBroker::new(uptrend_closes(120), Placement::Fill));
    let config = test_config(dir.path(), TradingMode::Paper);
    let mut runner = BotRunner::new(config, broker.clone(), None).unwrap();

    runner.run_tick().await.unwrap();

    // paper mode never calls the broker's order endpoint
    assert!(broker.placed.lock().await.is_empty());

    let orders = runner.coordinator().orders().await;
    assert_eq!(orders.len(), 1, "expected exactly one buy order");
    let order = &orders[0];
    assert_eq!(order.symbol, "GGAL");
    assert_eq!(order.side, Side::Buy);
    assert_eq!(order.state, OrderState::Executed);
    assert!(order.broker_order_id.as_deref().unwrap().starts_with("paper-"));

    let portfolio = runner.portfolio();
    let portfolio = portfolio.lock().await;
    let position = portfolio.position("GGAL").expect("position opened");
    assert_eq!(position.quantity, order.quantity);
}

#[tokio::test]
async fn live_tick_places_broker_order() {
    let dir = tempfile::TempDir::new().unwrap();
    let broker = Arc::new(MockBroker::new(uptrend_closes(120), Placement::Fill));
    let config = test_config(dir.path(), TradingMode::Live);
    let mut runner = BotRunner::new(config, broker.clone(), None).unwrap();

    runner.run_tick().await.unwrap();

    let placed = broker.placed.lock().await;
    assert_eq!(placed.len(), 1);
    assert_eq!(placed[0].symbol, "GGAL");

    let orders = runner.coordinator().orders().await;
    assert_eq!(orders[0].state, OrderState::Executed);
    assert_eq!(orders[0].broker_order_id.as_deref(), Some("123456"));
}

#[tokio::test]
async fn sell_signal_closes_position_and_books_pnl() {
    let dir = tempfile::TempDir::new().unwrap();
    let broker = Arc::new(MockBroker::new(downtrend_closes(120), Placement::Fill));
    let config = test_config(dir.path(), TradingMode::Paper);
    let mut runner = BotRunner::new(config, broker.clone(), None).unwrap();

    // seed an open position bought well above the current price
    runner
        .portfolio()
        .lock()
        .await
        .apply_fill("GGAL", Side::Buy, 100, Decimal::from(100))
        .unwrap();

    runner.run_tick().await.unwrap();

    let orders = runner.coordinator().orders().await;
    let sell = orders
        .iter()
        .find(|o| o.side == Side::Sell)
        .expect("sell order placed");
    assert_eq!(sell.quantity, 100);
    assert_eq!(sell.state, OrderState::Executed);

    assert!(runner.portfolio().lock().await.position("GGAL").is_none());
    // the losing sale was booked into risk state
    let risk = runner.risk();
    let risk = risk.lock().await;
    assert!(risk.state().daily_pnl < Decimal::ZERO);
    assert_eq!(risk.state().consecutive_losses, 1);
}

#[tokio::test]
async fn ambiguous_acceptance_is_recorded_unknown_then_reconciled() {
    let dir = tempfile::TempDir::new().unwrap();
    let broker = Arc::new(MockBroker::new(
        uptrend_closes(120),
        Placement::AcceptWithoutId,
    ));
    let config = test_config(dir.path(), TradingMode::Live);
    let runner = BotRunner::new(config, broker.clone(), None).unwrap();
    let coordinator = runner.coordinator();

    let order = coordinator
        .submit("GGAL", Side::Buy, 40, Decimal::from(100))
        .await
        .unwrap();
    assert_eq!(order.state, OrderState::Unknown);

    // nothing to match yet: reconcile settles nothing and stays Unknown
    assert!(coordinator.reconcile().await.unwrap().is_empty());
    assert_eq!(
        coordinator.orders().await[0].state,
        OrderState::Unknown,
        "order must never be counted executed without confirmation"
    );

    // broker's fill history later shows the trade went through
    broker
        .add_fill("GGAL", Side::Buy, 40, Decimal::from(100))
        .await;
    assert_eq!(coordinator.reconcile().await.unwrap().len(), 1);
    let settled = &coordinator.orders().await[0];
    assert_eq!(settled.state, OrderState::Executed);
    assert_eq!(settled.broker_order_id.as_deref(), Some("broker-1"));

    // idempotent: a second pass settles nothing
    assert!(coordinator.reconcile().await.unwrap().is_empty());
}

#[tokio::test]
async fn transport_failure_leaves_order_pending() {
    let dir = tempfile::TempDir::new().unwrap();
    let broker = Arc::new(MockBroker::new(uptrend_closes(120), Placement::TransportFail));
    let config = test_config(dir.path(), TradingMode::Live);
    let runner = BotRunner::new(config, broker.clone(), None).unwrap();
    let coordinator = runner.coordinator();

    let result = coordinator
        .submit("GGAL", Side::Buy, 25, Decimal::from(100))
        .await;
    assert!(result.is_err());
    assert_eq!(coordinator.orders().await[0].state, OrderState::Pending);

    broker
        .add_fill("GGAL", Side::Buy, 25, Decimal::from(100))
        .await;
    assert_eq!(coordinator.reconcile().await.unwrap().len(), 1);
    assert_eq!(coordinator.orders().await[0].state, OrderState::Executed);
}

#[tokio::test]
async fn rejected_order_stays_rejected() {
    let dir = tempfile::TempDir::new().unwrap();
    let broker = Arc::new(MockBroker::new(uptrend_closes(120), Placement::Decline));
    let config = test_config(dir.path(), TradingMode::Live);
    let runner = BotRunner::new(config, broker.clone(), None).unwrap();
    let coordinator = runner.coordinator();

    let order = coordinator
        .submit("GGAL", Side::Buy, 10, Decimal::from(100))
        .await
        .unwrap();
    assert_eq!(order.state, OrderState::Rejected);
    assert_eq!(order.note.as_deref(), Some("insufficient buying power"));
    // rejected is final: reconciliation ignores it
    broker
        .add_fill("GGAL", Side::Buy, 10, Decimal::from(100))
        .await;
    assert!(coordinator.reconcile().await.unwrap().is_empty());
}

#[tokio::test]
async fn reconciled_fill_is_booked_into_the_portfolio() {
    let dir = tempfile::TempDir::new().unwrap();
    let broker = Arc::new(MockBroker::new(
        uptrend_closes(120),
        Placement::AcceptWithoutId,
    ));
    let config = test_config(dir.path(), TradingMode::Live);
    let runner = BotRunner::new(config, broker.clone(), None).unwrap();
    let coordinator = runner.coordinator();

    let order = coordinator
        .submit("GGAL", Side::Buy, 40, Decimal::from(100))
        .await
        .unwrap();
    assert_eq!(order.state, OrderState::Unknown);
    // unconfirmed exposure is not booked
    assert!(runner.portfolio().lock().await.position("GGAL").is_none());

    broker
        .add_fill("GGAL", Side::Buy, 40, Decimal::from(100))
        .await;
    let settled = runner.reconcile_open_orders().await.unwrap();
    assert_eq!(settled.len(), 1);

    let portfolio = runner.portfolio();
    let portfolio = portfolio.lock().await;
    assert_eq!(portfolio.position("GGAL").unwrap().quantity, 40);
    assert_eq!(portfolio.cash, Decimal::from(96_000));
}

#[tokio::test]
async fn reconciled_sell_books_realized_pnl_into_risk() {
    let dir = tempfile::TempDir::new().unwrap();
    let broker = Arc::new(MockBroker::new(
        uptrend_closes(120),
        Placement::AcceptWithoutId,
    ));
    let config = test_config(dir.path(), TradingMode::Live);
    let runner = BotRunner::new(config, broker.clone(), None).unwrap();

    runner
        .portfolio()
        .lock()
        .await
        .apply_fill("GGAL", Side::Buy, 40, Decimal::from(110))
        .unwrap();

    let order = runner
        .coordinator()
        .submit("GGAL", Side::Sell, 40, Decimal::from(100))
        .await
        .unwrap();
    assert_eq!(order.state, OrderState::Unknown);

    broker
        .add_fill("GGAL", Side::Sell, 40, Decimal::from(100))
        .await;
    runner.reconcile_open_orders().await.unwrap();

    assert!(runner.portfolio().lock().await.position("GGAL").is_none());
    let risk = runner.risk();
    let risk = risk.lock().await;
    assert_eq!(risk.state().daily_pnl, Decimal::from(-400));
    assert_eq!(risk.state().consecutive_losses, 1);
}

#[tokio::test]
async fn one_fill_settles_only_one_of_two_identical_orders() {
    let dir = tempfile::TempDir::new().unwrap();
    let broker = Arc::new(MockBroker::new(
        uptrend_closes(120),
        Placement::AcceptWithoutId,
    ));
    let config = test_config(dir.path(), TradingMode::Live);
    let runner = BotRunner::new(config, broker.clone(), None).unwrap();
    let coordinator = runner.coordinator();

    let a = coordinator
        .submit("GGAL", Side::Buy, 40, Decimal::from(100))
        .await
        .unwrap();
    let b = coordinator
        .submit("GGAL", Side::Buy, 40, Decimal::from(100))
        .await
        .unwrap();
    assert_eq!(a.state, OrderState::Unknown);
    assert_eq!(b.state, OrderState::Unknown);

    broker
        .add_fill("GGAL", Side::Buy, 40, Decimal::from(100))
        .await;
    assert_eq!(coordinator.reconcile().await.unwrap().len(), 1);
    // the same fill must not settle the second order on a later pass
    assert!(coordinator.reconcile().await.unwrap().is_empty());

    let orders = coordinator.orders().await;
    let executed = orders.iter().filter(|o| o.state == OrderState::Executed).count();
    let unknown = orders.iter().filter(|o| o.state == OrderState::Unknown).count();
    assert_eq!(executed, 1);
    assert_eq!(unknown, 1);
}

#[tokio::test]
async fn paper_fill_records_the_slipped_price() {
    let dir = tempfile::TempDir::new().unwrap();
    let broker = Arc::new(MockBroker::new(uptrend_closes(120), Placement::Fill));
    let config = test_config(dir.path(), TradingMode::Paper);
    let runner = BotRunner::new(config, broker, None).unwrap();

    let order = runner
        .coordinator()
        .submit("GGAL", Side::Buy, 10, Decimal::from(100))
        .await
        .unwrap();
    assert_eq!(order.state, OrderState::Executed);
    assert!(order.broker_order_id.as_deref().unwrap().starts_with("paper-"));
    // slippage is bounded at 5 bps either side and recorded on the order
    assert!(order.price >= Decimal::new(9995, 2));
    assert!(order.price <= Decimal::new(10005, 2));
}

#[tokio::test]
async fn halted_risk_state_blocks_new_buys() {
    let dir = tempfile::TempDir::new().unwrap();
    let broker = Arc::new(MockBroker::new(uptrend_closes(120), Placement::Fill));
    let config = test_config(dir.path(), TradingMode::Paper);
    let mut runner = BotRunner::new(config, broker.clone(), None).unwrap();

    // breach the 5% daily loss limit up front
    runner
        .risk()
        .lock()
        .await
        .record_fill(Decimal::from(-6_000))
        .unwrap();

    runner.run_tick().await.unwrap();
    assert!(
        runner.coordinator().orders().await.is_empty(),
        "no orders may be placed while halted"
    );
}

#[tokio::test]
async fn control_commands_drive_the_runner() {
    let dir = tempfile::TempDir::new().unwrap();
    let broker = Arc::new(MockBroker::new(uptrend_closes(120), Placement::Fill));
    let config = test_config(dir.path(), TradingMode::Paper);
    let runner = BotRunner::new(config, broker.clone(), None).unwrap();

    let guard = Arc::new(ProcessSingleton::new(dir.path()));
    let ctx = quantbot::control::ControlContext {
        risk: runner.risk(),
        portfolio: runner.portfolio(),
        coordinator: runner.coordinator(),
        broker: broker.clone(),
        paused: Arc::new(std::sync::atomic::AtomicBool::new(false)),
        analyze_request: Arc::new(Mutex::new(None)),
        guard: guard.clone(),
        mode: "paper".to_string(),
        symbols: vec!["GGAL".to_string()],
        started_at: Utc::now(),
    };

    let status = dispatch("/status", &ctx).await;
    assert!(status.contains("mode: paper"));
    assert!(status.contains("capital: 100000"));

    let balance = dispatch("/balance", &ctx).await;
    assert!(balance.contains("500000"));

    dispatch("/pause", &ctx).await;
    assert!(ctx.paused.load(Ordering::SeqCst));
    dispatch("/resume", &ctx).await;
    assert!(!ctx.paused.load(Ordering::SeqCst));

    let reply = dispatch("/analyze ggal", &ctx).await;
    assert!(reply.contains("GGAL"));
    assert_eq!(ctx.analyze_request.lock().await.as_deref(), Some("GGAL"));

    assert!(!guard.stop_requested());
    dispatch("/stop", &ctx).await;
    assert!(guard.stop_requested());

    let unknown = dispatch("/frobnicate", &ctx).await;
    assert!(unknown.contains("/help"));
}

#[tokio::test]
async fn notifier_pushes_trade_events_through_the_transport() {
    let dir = tempfile::TempDir::new().unwrap();
    let broker = Arc::new(MockBroker::new(uptrend_closes(120), Placement::Fill));
    let transport = Arc::new(MockTransport {
        sent: Mutex::new(Vec::new()),
    });
    let mut config = test_config(dir.path(), TradingMode::Paper);
    config.telegram_chat_id = Some(777);
    let mut runner = BotRunner::new(config, broker, Some(transport.clone())).unwrap();

    runner.run_tick().await.unwrap();

    let sent = transport.sent.lock().await;
    assert!(
        sent.iter().any(|(chat, text)| *chat == 777 && text.contains("executed")),
        "expected an execution notification, got {:?}",
        *sent
    );
}
