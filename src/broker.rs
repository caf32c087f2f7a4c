//! Brokerage connectivity.
//!
//! `BrokerConnector` is the seam the coordinator and the tests mock; the
//! production implementation is a token-authenticated REST client.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::market::{Candle, MarketDepth, Quote, Side};

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("http transport: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("broker api {status}: {body}")]
    Api { status: u16, body: String },
    #[error("broker credentials missing")]
    MissingCredentials,
}

/// What we ask the broker to do.
#[derive(Debug, Clone)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: Side,
    pub quantity: u64,
    pub price: Decimal,
}

/// What the broker answered. `order_id: None` with `declined: None` is the
/// ambiguous case: the request may or may not have filled.
#[derive(Debug, Clone)]
pub struct PlacementResponse {
    pub order_id: Option<String>,
    pub declined: Option<String>,
}

/// Historical fill as reported by the broker, used for reconciliation.
#[derive(Debug, Clone, Deserialize)]
pub struct BrokerFill {
    pub order_id: String,
    pub symbol: String,
    pub side: Side,
    pub quantity: u64,
    pub price: Decimal,
    pub executed_at: DateTime<Utc>,
}

#[async_trait]
pub trait BrokerConnector: Send + Sync {
    async fn quote(&self, symbol: &str) -> Result<Quote, BrokerError>;
    async fn history(&self, symbol: &str, days: u32) -> Result<Vec<Candle>, BrokerError>;
    async fn depth(&self, symbol: &str) -> Result<MarketDepth, BrokerError>;
    async fn place_order(&self, request: &OrderRequest) -> Result<PlacementResponse, BrokerError>;
    async fn available_balance(&self) -> Result<Decimal, BrokerError>;
    /// Recent fills, newest first.
    async fn recent_fills(&self) -> Result<Vec<BrokerFill>, BrokerError>;
}

#[derive(Debug, Deserialize)]
struct PlacementBody {
    order_id: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BalanceBody {
    available: Decimal,
}

pub struct HttpBroker {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

impl HttpBroker {
    pub fn new(base_url: String, token: String) -> Result<Self, BrokerError> {
        if token.is_empty() {
            return Err(BrokerError::MissingCredentials);
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        })
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T, BrokerError> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.token)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BrokerError::Api {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response.json().await?)
    }
}

#[async_trait]
impl BrokerConnector for HttpBroker {
    async fn quote(&self, symbol: &str) -> Result<Quote, BrokerError> {
        self.get_json(&format!("/v1/quotes/{}", symbol)).await
    }

    async fn history(&self, symbol: &str, days: u32) -> Result<Vec<Candle>, BrokerError> {
        self.get_json(&format!("/v1/history/{}?days={}", symbol, days))
            .await
    }

    async fn depth(&self, symbol: &str) -> Result<MarketDepth, BrokerError> {
        self.get_json(&format!("/v1/depth/{}", symbol)).await
    }

    async fn place_order(&self, request: &OrderRequest) -> Result<PlacementResponse, BrokerError> {
        let url = format!("{}/v1/orders", self.base_url);
        let body = serde_json::json!({
            "symbol": request.symbol,
            "side": request.side.to_string(),
            "quantity": request.quantity,
            "price": request.price,
        });
        debug!(symbol = %request.symbol, side = %request.side, qty = request.quantity, "placing order");
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await?;
        let status = response.status();

        // 4xx is an explicit decline; other failures are transport-level
        if status.is_client_error() {
            let body = response.text().await.unwrap_or_default();
            return Ok(PlacementResponse {
                order_id: None,
                declined: Some(format!("{}: {}", status.as_u16(), body)),
            });
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BrokerError::Api {
                status: status.as_u16(),
                body,
            });
        }

        // a 2xx that omits the id is the ambiguous case; parse leniently
        let parsed: PlacementBody = response.json().await.unwrap_or(PlacementBody {
            order_id: None,
            message: None,
        });
        if status == StatusCode::OK || status == StatusCode::CREATED {
            if let Some(msg) = &parsed.message {
                debug!(message = %msg, "broker acknowledged order");
            }
        }
        Ok(PlacementResponse {
            order_id: parsed.order_id,
            declined: None,
        })
    }

    async fn available_balance(&self) -> Result<Decimal, BrokerError> {
        let body: BalanceBody = self.get_json("/v1/account/balance").await?;
        Ok(body.available)
    }

    async fn recent_fills(&self) -> Result<Vec<BrokerFill>, BrokerError> {
        self.get_json("/v1/account/fills").await
    }
}
