//! Order execution: ledger discipline first, broker call second.
//!
//! Every intent is written to `orders.json` as Pending before any network
//! traffic, so a crash mid-call leaves a visible open question instead of
//! silent exposure. A 2xx response without an order id is recorded as
//! Unknown and excluded from success accounting until reconciliation
//! confirms or clears it.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rand::Rng;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::broker::{BrokerConnector, BrokerError, OrderRequest};
use crate::market::Side;
use crate::rate_limit::RateLimiter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderState {
    Pending,
    Executed,
    Rejected,
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: Uuid,
    pub symbol: String,
    pub side: Side,
    pub quantity: u64,
    pub price: Decimal,
    pub state: OrderState,
    pub broker_order_id: Option<String>,
    pub note: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("order ledger io: {0}")]
    Io(#[from] std::io::Error),
    #[error("order ledger serialization: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("broker transport failed, order {0} left pending")]
    Transport(Uuid, #[source] BrokerError),
    #[error("unknown order id {0}")]
    NoSuchOrder(Uuid),
}

/// Append-only order record. Entries are status-updated in place but never
/// removed, so the file is a complete audit trail.
pub struct Ledger {
    path: PathBuf,
    orders: Vec<Order>,
}

impl Ledger {
    pub fn load(state_dir: &Path) -> Result<Self, ExecutionError> {
        let path = state_dir.join("orders.json");
        let orders = if path.exists() {
            serde_json::from_str(&std::fs::read_to_string(&path)?)?
        } else {
            Vec::new()
        };
        Ok(Self { path, orders })
    }

    fn persist(&self) -> Result<(), ExecutionError> {
        std::fs::write(&self.path, serde_json::to_string_pretty(&self.orders)?)?;
        Ok(())
    }

    pub fn append(&mut self, order: Order) -> Result<(), ExecutionError> {
        self.orders.push(order);
        self.persist()
    }

    pub fn update(
        &mut self,
        id: Uuid,
        state: OrderState,
        broker_order_id: Option<String>,
        note: Option<String>,
        fill_price: Option<Decimal>,
    ) -> Result<Order, ExecutionError> {
        let order = self
            .orders
            .iter_mut()
            .find(|o| o.id == id)
            .ok_or(ExecutionError::NoSuchOrder(id))?;
        order.state = state;
        if broker_order_id.is_some() {
            order.broker_order_id = broker_order_id;
        }
        if note.is_some() {
            order.note = note;
        }
        if let Some(price) = fill_price {
            order.price = price;
        }
        order.updated_at = Utc::now();
        let updated = order.clone();
        self.persist()?;
        Ok(updated)
    }

    pub fn all(&self) -> &[Order] {
        &self.orders
    }

    /// Orders whose final state is still open (Pending or Unknown).
    pub fn unresolved(&self) -> Vec<Order> {
        self.orders
            .iter()
            .filter(|o| matches!(o.state, OrderState::Pending | OrderState::Unknown))
            .cloned()
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    Paper,
    Live,
}

pub struct ExecutionCoordinator {
    broker: std::sync::Arc<dyn BrokerConnector>,
    limiter: std::sync::Arc<RateLimiter>,
    ledger: tokio::sync::Mutex<Ledger>,
    mode: ExecutionMode,
}

impl ExecutionCoordinator {
    pub fn new(
        state_dir: &Path,
        broker: std::sync::Arc<dyn BrokerConnector>,
        limiter: std::sync::Arc<RateLimiter>,
        mode: ExecutionMode,
    ) -> Result<Self, ExecutionError> {
        Ok(Self {
            broker,
            limiter,
            ledger: tokio::sync::Mutex::new(Ledger::load(state_dir)?),
            mode,
        })
    }

    pub async fn orders(&self) -> Vec<Order> {
        self.ledger.lock().await.all().to_vec()
    }

    pub async fn unresolved(&self) -> Vec<Order> {
        self.ledger.lock().await.unresolved()
    }

    /// Submit an order. The returned `Order` carries the outcome state;
    /// only transport failures surface as `Err` (the order stays Pending
    /// in the ledger for later reconciliation).
    pub async fn submit(
        &self,
        symbol: &str,
        side: Side,
        quantity: u64,
        price: Decimal,
    ) -> Result<Order, ExecutionError> {
        let order = Order {
            id: Uuid::new_v4(),
            symbol: symbol.to_string(),
            side,
            quantity,
            price,
            state: OrderState::Pending,
            broker_order_id: None,
            note: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        self.ledger.lock().await.append(order.clone())?;

        if self.mode == ExecutionMode::Paper {
            return self.fill_paper(order).await;
        }

        self.limiter.acquire("broker").await;
        let request = OrderRequest {
            symbol: order.symbol.clone(),
            side,
            quantity,
            price,
        };
        let response = match self.broker.place_order(&request).await {
            Ok(r) => r,
            Err(e) => {
                warn!(order_id = %order.id, error = %e, "broker call failed, order stays pending");
                return Err(ExecutionError::Transport(order.id, e));
            }
        };

        let mut ledger = self.ledger.lock().await;
        let updated = if let Some(reason) = response.declined {
            info!(order_id = %order.id, %reason, "order rejected by broker");
            ledger.update(order.id, OrderState::Rejected, None, Some(reason), None)?
        } else if let Some(broker_id) = response.order_id {
            info!(order_id = %order.id, broker_id, "order executed");
            ledger.update(order.id, OrderState::Executed, Some(broker_id), None, None)?
        } else {
            warn!(order_id = %order.id, "broker acknowledged without an order id");
            ledger.update(
                order.id,
                OrderState::Unknown,
                None,
                Some("accepted without order id".to_string()),
                None,
            )?
        };
        Ok(updated)
    }

    /// Paper fill: same ledger path, fill synthesized locally with a touch
    /// of random slippage instead of a network call. The fill price is
    /// recorded on the order so the portfolio books the slipped price.
    async fn fill_paper(&self, order: Order) -> Result<Order, ExecutionError> {
        let slip_bps: i32 = rand::thread_rng().gen_range(-5..=5);
        let slip = Decimal::from(slip_bps) / Decimal::from(10_000);
        let fill_price = order.price * (Decimal::ONE + slip);
        let broker_id = format!("paper-{}", &order.id.to_string()[..8]);
        info!(order_id = %order.id, %fill_price, "paper fill");
        self.ledger.lock().await.update(
            order.id,
            OrderState::Executed,
            Some(broker_id),
            Some("paper fill".to_string()),
            Some(fill_price),
        )
    }

    /// Re-query the broker's fill history and settle Pending/Unknown
    /// orders, returning the orders settled so the caller can book them.
    /// Idempotent: resolved orders are never touched again, and a broker
    /// fill already claimed by any ledger entry cannot settle a second
    /// order.
    pub async fn reconcile(&self) -> Result<Vec<Order>, ExecutionError> {
        let open = self.unresolved().await;
        if open.is_empty() {
            return Ok(Vec::new());
        }
        self.limiter.acquire("broker").await;
        let fills = match self.broker.recent_fills().await {
            Ok(f) => f,
            Err(e) => {
                warn!(error = %e, "reconciliation fetch failed, will retry next tick");
                return Ok(Vec::new());
            }
        };

        let mut settled = Vec::new();
        let mut ledger = self.ledger.lock().await;
        let mut claimed: std::collections::HashSet<String> = ledger
            .all()
            .iter()
            .filter_map(|o| o.broker_order_id.clone())
            .collect();
        for order in open {
            let matched = fills.iter().find(|f| {
                !claimed.contains(&f.order_id)
                    && f.symbol == order.symbol
                    && f.side == order.side
                    && f.quantity == order.quantity
                    && f.executed_at >= order.created_at
            });
            if let Some(fill) = matched {
                info!(order_id = %order.id, broker_id = %fill.order_id, "reconciled open order");
                claimed.insert(fill.order_id.clone());
                let updated = ledger.update(
                    order.id,
                    OrderState::Executed,
                    Some(fill.order_id.clone()),
                    Some("settled by reconciliation".to_string()),
                    Some(fill.price),
                )?;
                settled.push(updated);
            }
        }
        Ok(settled)
    }
}
