//! The unattended decision loop: market data in, scored decision out,
//! risk-gated order placement, ledger reconciliation, operator pings.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use rust_decimal::Decimal;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::broker::BrokerConnector;
use crate::config::{AppConfig, TradingMode};
use crate::control::{CommandTransport, ControlChannel, ControlContext, Notifier};
use crate::execution::{ExecutionCoordinator, ExecutionError, ExecutionMode, Order, OrderState};
use crate::market::{dec_f64, Side};
use crate::portfolio::Portfolio;
use crate::rate_limit::RateLimiter;
use crate::regime::{AggregateDecision, Combiner, RegimeDetector};
use crate::risk::RiskManager;
use crate::signal::{all_modules, Score, SignalContext};
use crate::singleton::ProcessSingleton;

const HISTORY_DAYS: u32 = 365;
const CONTROL_POLL_EVERY: Duration = Duration::from_secs(2);

/// One symbol's analysis result for a tick.
pub struct TickReport {
    pub symbol: String,
    pub decision: AggregateDecision,
    pub price: Decimal,
    pub scores: Vec<(String, Score)>,
}

pub struct BotRunner {
    config: AppConfig,
    broker: Arc<dyn BrokerConnector>,
    coordinator: Arc<ExecutionCoordinator>,
    risk: Arc<Mutex<RiskManager>>,
    portfolio: Arc<Mutex<Portfolio>>,
    limiter: Arc<RateLimiter>,
    notifier: Notifier,
    transport: Option<Arc<dyn CommandTransport>>,
    paused: Arc<AtomicBool>,
    analyze_request: Arc<Mutex<Option<String>>>,
    combiner: Combiner,
}

impl BotRunner {
    pub fn new(
        config: AppConfig,
        broker: Arc<dyn BrokerConnector>,
        transport: Option<Arc<dyn CommandTransport>>,
    ) -> anyhow::Result<Self> {
        std::fs::create_dir_all(&config.state_dir)
            .with_context(|| format!("creating state dir {}", config.state_dir.display()))?;

        let limiter = Arc::new(RateLimiter::new(30, Duration::from_secs(60)));
        let mode = match config.mode {
            TradingMode::Paper => ExecutionMode::Paper,
            TradingMode::Live => ExecutionMode::Live,
        };
        let coordinator = Arc::new(ExecutionCoordinator::new(
            &config.state_dir,
            broker.clone(),
            limiter.clone(),
            mode,
        )?);
        let risk = Arc::new(Mutex::new(RiskManager::load(
            &config.state_dir,
            config.risk.clone(),
            config.initial_capital,
            Utc::now().date_naive(),
        )?));
        let portfolio = Arc::new(Mutex::new(Portfolio::load(
            &config.state_dir,
            config.initial_capital,
        )?));
        let notifier = match (&transport, config.telegram_chat_id) {
            (Some(t), Some(chat)) => Notifier::new(Some(t.clone()), limiter.clone(), Some(chat)),
            _ => Notifier::disabled(limiter.clone()),
        };

        Ok(Self {
            config,
            broker,
            coordinator,
            risk,
            portfolio,
            limiter,
            notifier,
            transport,
            paused: Arc::new(AtomicBool::new(false)),
            analyze_request: Arc::new(Mutex::new(None)),
            combiner: Combiner::new(),
        })
    }

    pub fn coordinator(&self) -> Arc<ExecutionCoordinator> {
        self.coordinator.clone()
    }

    pub fn risk(&self) -> Arc<Mutex<RiskManager>> {
        self.risk.clone()
    }

    pub fn portfolio(&self) -> Arc<Mutex<Portfolio>> {
        self.portfolio.clone()
    }

    fn control_context(&self, guard: Arc<ProcessSingleton>) -> ControlContext {
        ControlContext {
            risk: self.risk.clone(),
            portfolio: self.portfolio.clone(),
            coordinator: self.coordinator.clone(),
            broker: self.broker.clone(),
            paused: self.paused.clone(),
            analyze_request: self.analyze_request.clone(),
            guard,
            mode: self.config.mode.to_string(),
            symbols: self.config.symbols.clone(),
            started_at: Utc::now(),
        }
    }

    pub async fn run(&mut self) -> anyhow::Result<()> {
        let mut singleton = ProcessSingleton::new(&self.config.state_dir);
        singleton
            .acquire()
            .context("refusing to start a second instance")?;
        if singleton.stop_requested() {
            // leftover flag from a previous shutdown
            singleton.clear_stop();
        }

        info!(
            mode = %self.config.mode,
            continuous = self.config.continuous,
            symbols = ?self.config.symbols,
            "bot starting"
        );
        self.notifier
            .notify(&format!(
                "bot started ({} mode, {})",
                self.config.mode,
                if self.config.continuous {
                    "continuous"
                } else {
                    "single pass"
                }
            ))
            .await;

        let mut control_task = None;
        if self.config.continuous {
            if let Some(transport) = &self.transport {
                let channel = ControlChannel::new(
                    transport.clone(),
                    self.limiter.clone(),
                    self.config.telegram_chat_id,
                );
                let guard = Arc::new(ProcessSingleton::new(&self.config.state_dir));
                let ctx = self.control_context(guard);
                control_task = Some(tokio::spawn(channel.run(ctx)));
            }
        }

        let result = self.main_loop(&singleton).await;

        if let Some(task) = control_task {
            task.abort();
        }
        self.notifier.notify("bot stopped").await;
        singleton.clear_stop();
        singleton.release();
        result
    }

    async fn main_loop(&mut self, singleton: &ProcessSingleton) -> anyhow::Result<()> {
        let mut tick_interval =
            tokio::time::interval(Duration::from_secs(self.config.interval_mins * 60));
        let mut control_interval = tokio::time::interval(CONTROL_POLL_EVERY);

        loop {
            tokio::select! {
                _ = tick_interval.tick() => {
                    if singleton.stop_requested() {
                        info!("stop flag observed, shutting down");
                        return Ok(());
                    }
                    if self.paused.load(Ordering::SeqCst) {
                        info!("paused, skipping tick");
                    } else if let Err(e) = self.run_tick().await {
                        // a failed tick is logged and retried next interval
                        error!(error = %e, "tick failed");
                    }
                    if !self.config.continuous {
                        return Ok(());
                    }
                }
                _ = control_interval.tick() => {
                    if singleton.stop_requested() {
                        info!("stop flag observed, shutting down");
                        return Ok(());
                    }
                    let requested = self.analyze_request.lock().await.take();
                    if let Some(symbol) = requested {
                        match self.analyze_symbol(&symbol).await {
                            Ok(report) => {
                                self.notifier.notify(&describe_report(&report)).await;
                            }
                            Err(e) => {
                                warn!(symbol, error = %e, "on-demand analysis failed");
                                self.notifier
                                    .notify(&format!("analysis of {} failed: {}", symbol, e))
                                    .await;
                            }
                        }
                    }
                }
            }
        }
    }

    /// One full pass: analyze every configured symbol, trade where the
    /// aggregate crosses a threshold, then settle open orders.
    pub async fn run_tick(&mut self) -> anyhow::Result<()> {
        let today = Utc::now().date_naive();
        self.risk.lock().await.roll_day(today)?;

        for symbol in self.config.symbols.clone() {
            match self.analyze_symbol(&symbol).await {
                Ok(report) => {
                    info!(
                        symbol = %report.symbol,
                        score = report.decision.score,
                        regime = %report.decision.regime,
                        price = %report.price,
                        "analysis complete"
                    );
                    if let Err(e) = self.act_on(&report).await {
                        error!(symbol, error = %e, "trade execution failed");
                    }
                }
                Err(e) => warn!(symbol, error = %e, "analysis failed, skipping symbol"),
            }
        }

        if let Err(e) = self.reconcile_open_orders().await {
            warn!(error = %e, "reconciliation failed");
        }
        Ok(())
    }

    /// Settle Pending/Unknown orders against the broker's fill history and
    /// book every confirmed fill into portfolio and risk state, exactly as
    /// if it had executed synchronously.
    pub async fn reconcile_open_orders(&self) -> anyhow::Result<Vec<Order>> {
        let settled = self.coordinator.reconcile().await?;
        if settled.is_empty() {
            return Ok(settled);
        }
        info!(settled = settled.len(), "reconciled open orders");
        self.notifier
            .notify(&format!(
                "reconciliation settled {} open order(s)",
                settled.len()
            ))
            .await;
        for order in &settled {
            if let Err(e) = self.book_fill(order).await {
                error!(order_id = %order.id, error = %e, "failed to book reconciled fill");
            }
        }
        Ok(settled)
    }

    /// Fetch market data and run the full signal stack for one symbol.
    pub async fn analyze_symbol(&self, symbol: &str) -> anyhow::Result<TickReport> {
        self.limiter.acquire("broker").await;
        let history = self
            .broker
            .history(symbol, HISTORY_DAYS)
            .await
            .with_context(|| format!("fetching history for {}", symbol))?;
        if history.is_empty() {
            anyhow::bail!("empty history for {}", symbol);
        }

        // quote, depth and peer data are optional enrichments
        self.limiter.acquire("broker").await;
        let quote = match self.broker.quote(symbol).await {
            Ok(q) => Some(q),
            Err(e) => {
                warn!(symbol, error = %e, "quote unavailable");
                None
            }
        };
        self.limiter.acquire("broker").await;
        let depth = match self.broker.depth(symbol).await {
            Ok(d) => Some(d),
            Err(e) => {
                warn!(symbol, error = %e, "depth unavailable");
                None
            }
        };
        let peer_history = match self.config.peer_for(symbol) {
            Some(peer) => {
                self.limiter.acquire("broker").await;
                match self.broker.history(peer, HISTORY_DAYS).await {
                    Ok(h) => Some(h),
                    Err(e) => {
                        warn!(symbol, peer, error = %e, "peer history unavailable");
                        None
                    }
                }
            }
            None => None,
        };

        let mut ctx = SignalContext::new(Utc::now());
        ctx.quote = quote.as_ref();
        ctx.depth = depth.as_ref();
        ctx.peer_history = peer_history.as_deref();

        let scores: Vec<(String, Score)> = all_modules()
            .iter()
            .map(|module| {
                let score = module.evaluate(&history, &ctx);
                (module.name().to_string(), score)
            })
            .collect();
        let reading = RegimeDetector::detect(&history);
        let decision = self.combiner.combine(&scores, &reading);

        let price = quote
            .as_ref()
            .map(|q| q.last)
            .unwrap_or(history[history.len() - 1].close);
        self.portfolio.lock().await.mark(symbol, price);

        Ok(TickReport {
            symbol: symbol.to_string(),
            decision,
            price,
            scores,
        })
    }

    /// Apply thresholds and the risk gate, then hand off to execution.
    async fn act_on(&self, report: &TickReport) -> anyhow::Result<()> {
        let symbol = &report.symbol;
        let score = report.decision.score;

        if score >= self.config.buy_threshold {
            let (can_trade, quantity) = {
                let risk = self.risk.lock().await;
                if !risk.can_trade(Utc::now().time()) {
                    info!(symbol, "risk gate closed, skipping buy");
                    (false, 0)
                } else {
                    let stop = risk.stop_loss(report.price)?;
                    (true, risk.position_size(report.price, stop)?)
                }
            };
            if !can_trade {
                return Ok(());
            }
            if quantity == 0 {
                info!(symbol, "position size rounded to zero, skipping buy");
                return Ok(());
            }
            let outcome = self
                .coordinator
                .submit(symbol, Side::Buy, quantity, report.price)
                .await;
            self.settle(outcome).await?;
        } else if score <= self.config.sell_threshold {
            let held = self
                .portfolio
                .lock()
                .await
                .position(symbol)
                .map(|p| p.quantity)
                .unwrap_or(0);
            if held == 0 {
                info!(symbol, score, "sell signal with no position, nothing to do");
                return Ok(());
            }
            let outcome = self
                .coordinator
                .submit(symbol, Side::Sell, held, report.price)
                .await;
            self.settle(outcome).await?;
        }
        Ok(())
    }

    /// Route an execution outcome: executed orders are booked, everything
    /// else is surfaced to the operator.
    async fn settle(&self, outcome: Result<Order, ExecutionError>) -> anyhow::Result<()> {
        let order = match outcome {
            Ok(o) => o,
            Err(ExecutionError::Transport(id, e)) => {
                warn!(order_id = %id, error = %e, "order left pending after transport failure");
                self.notifier
                    .notify(&format!("order {} left pending: broker unreachable", id))
                    .await;
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        match order.state {
            OrderState::Executed => self.book_fill(&order).await?,
            OrderState::Rejected => {
                self.notifier
                    .notify(&format!(
                        "{} {} x{} rejected: {}",
                        order.symbol,
                        order.side,
                        order.quantity,
                        order.note.as_deref().unwrap_or("no reason given")
                    ))
                    .await;
            }
            OrderState::Unknown => {
                self.notifier
                    .notify(&format!(
                        "ATTENTION: {} {} x{} in UNKNOWN state - broker accepted without an id, will reconcile",
                        order.symbol, order.side, order.quantity
                    ))
                    .await;
            }
            OrderState::Pending => {}
        }
        Ok(())
    }

    /// Book a confirmed execution into portfolio and risk state. Shared by
    /// the synchronous path and reconciliation, so a late-confirmed fill
    /// lands in the books exactly like an immediate one.
    async fn book_fill(&self, order: &Order) -> anyhow::Result<()> {
        let realized = self.portfolio.lock().await.apply_fill(
            &order.symbol,
            order.side,
            order.quantity,
            order.price,
        )?;
        self.notifier
            .notify(&format!(
                "{} {} x{} @ {:.2} executed",
                order.symbol, order.side, order.quantity, order.price
            ))
            .await;
        if let Some(pnl) = realized {
            let tripped = self.risk.lock().await.record_fill(pnl)?;
            info!(symbol = %order.symbol, pnl = dec_f64(pnl), "realized P&L booked");
            if tripped {
                self.notifier
                    .notify("DAILY LOSS LIMIT HIT - trading halted until tomorrow")
                    .await;
            }
        }
        Ok(())
    }
}

fn describe_report(report: &TickReport) -> String {
    let mut lines = vec![format!(
        "{} @ {:.2}: score {} ({} regime)",
        report.symbol, report.price, report.decision.score, report.decision.regime
    )];
    for (name, score) in &report.scores {
        if score.is_insufficient() {
            lines.push(format!("  {}: insufficient data", name));
        } else if !score.factors.is_empty() {
            let reasons: Vec<&str> = score
                .factors
                .iter()
                .map(|f| f.label.as_str())
                .collect();
            lines.push(format!("  {}: {} [{}]", name, score.value, reasons.join(", ")));
        }
    }
    lines.join("\n")
}
