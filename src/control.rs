//! Remote control channel: long-polled operator commands plus outbound
//! notifications.
//!
//! The transport is abstract so tests drive the dispatcher directly; the
//! production transport is the Telegram bot API. HTTP 409 on getUpdates
//! means another process is polling with our token; the loser backs off
//! and gives up after a few rounds instead of fighting for updates.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::broker::BrokerConnector;
use crate::execution::{ExecutionCoordinator, OrderState};
use crate::portfolio::Portfolio;
use crate::rate_limit::RateLimiter;
use crate::risk::RiskManager;
use crate::singleton::ProcessSingleton;

const POLL_TIMEOUT_SECS: u64 = 25;
const MAX_CONFLICTS: u32 = 3;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("another poller owns this token (http 409)")]
    Conflict,
    #[error("control transport: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("control api: {0}")]
    Api(String),
}

#[derive(Debug, Clone)]
pub struct ControlMessage {
    pub update_id: i64,
    pub chat_id: i64,
    pub sender: String,
    pub text: String,
}

#[async_trait]
pub trait CommandTransport: Send + Sync {
    /// Fetch messages with update_id > offset, long-polling up to `timeout`.
    async fn get_updates(
        &self,
        offset: i64,
        timeout: Duration,
    ) -> Result<Vec<ControlMessage>, ChannelError>;

    async fn send_message(&self, chat_id: i64, text: &str) -> Result<(), ChannelError>;
}

#[derive(Debug, Deserialize)]
struct TgResponse<T> {
    ok: bool,
    #[serde(default)]
    description: Option<String>,
    result: Option<T>,
}

#[derive(Debug, Deserialize)]
struct TgUpdate {
    update_id: i64,
    message: Option<TgMessage>,
}

#[derive(Debug, Deserialize)]
struct TgMessage {
    text: Option<String>,
    chat: TgChat,
    from: Option<TgUser>,
}

#[derive(Debug, Deserialize)]
struct TgChat {
    id: i64,
}

#[derive(Debug, Deserialize)]
struct TgUser {
    #[serde(default)]
    username: Option<String>,
}

pub struct TelegramTransport {
    client: reqwest::Client,
    base_url: String,
}

impl TelegramTransport {
    pub fn new(token: &str) -> Result<Self, ChannelError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(POLL_TIMEOUT_SECS + 10))
            .build()?;
        Ok(Self {
            client,
            base_url: format!("https://api.telegram.org/bot{}", token),
        })
    }
}

#[async_trait]
impl CommandTransport for TelegramTransport {
    async fn get_updates(
        &self,
        offset: i64,
        timeout: Duration,
    ) -> Result<Vec<ControlMessage>, ChannelError> {
        let url = format!(
            "{}/getUpdates?offset={}&timeout={}",
            self.base_url,
            offset,
            timeout.as_secs()
        );
        let response = self.client.get(&url).send().await?;
        if response.status().as_u16() == 409 {
            return Err(ChannelError::Conflict);
        }
        let body: TgResponse<Vec<TgUpdate>> = response.json().await?;
        if !body.ok {
            return Err(ChannelError::Api(
                body.description.unwrap_or_else(|| "unknown error".to_string()),
            ));
        }
        Ok(to_messages(body.result.unwrap_or_default()))
    }

    async fn send_message(&self, chat_id: i64, text: &str) -> Result<(), ChannelError> {
        let url = format!("{}/sendMessage", self.base_url);
        let body = serde_json::json!({ "chat_id": chat_id, "text": text });
        let response = self.client.post(&url).json(&body).send().await?;
        let parsed: TgResponse<serde_json::Value> = response.json().await?;
        if !parsed.ok {
            return Err(ChannelError::Api(
                parsed.description.unwrap_or_else(|| "send failed".to_string()),
            ));
        }
        Ok(())
    }
}

/// Every update keeps its update_id so the poll offset always advances,
/// even past stickers, photos and other non-text payloads. Those map to an
/// empty text the dispatcher skips.
fn to_messages(updates: Vec<TgUpdate>) -> Vec<ControlMessage> {
    updates
        .into_iter()
        .map(|u| {
            let (chat_id, sender, text) = match u.message {
                Some(m) => (
                    m.chat.id,
                    m.from
                        .and_then(|f| f.username)
                        .unwrap_or_else(|| "unknown".to_string()),
                    m.text.unwrap_or_default(),
                ),
                None => (0, "unknown".to_string(), String::new()),
            };
            ControlMessage {
                update_id: u.update_id,
                chat_id,
                sender,
                text,
            }
        })
        .collect()
}

/// Outbound operator notifications. Failures are logged and swallowed so a
/// messaging outage can never stall the trading loop.
#[derive(Clone)]
pub struct Notifier {
    transport: Option<Arc<dyn CommandTransport>>,
    limiter: Arc<RateLimiter>,
    chat_id: Option<i64>,
}

impl Notifier {
    pub fn new(
        transport: Option<Arc<dyn CommandTransport>>,
        limiter: Arc<RateLimiter>,
        chat_id: Option<i64>,
    ) -> Self {
        Self {
            transport,
            limiter,
            chat_id,
        }
    }

    pub fn disabled(limiter: Arc<RateLimiter>) -> Self {
        Self::new(None, limiter, None)
    }

    pub async fn notify(&self, text: &str) {
        let (transport, chat_id) = match (&self.transport, self.chat_id) {
            (Some(t), Some(c)) => (t, c),
            _ => return,
        };
        self.limiter.acquire("control_send").await;
        if let Err(e) = transport.send_message(chat_id, text).await {
            warn!(error = %e, "notification failed");
        }
    }
}

/// Shared handles the command dispatcher reads and pokes.
pub struct ControlContext {
    pub risk: Arc<Mutex<RiskManager>>,
    pub portfolio: Arc<Mutex<Portfolio>>,
    pub coordinator: Arc<ExecutionCoordinator>,
    pub broker: Arc<dyn BrokerConnector>,
    pub paused: Arc<AtomicBool>,
    /// Symbol queued by /analyze, picked up by the next tick.
    pub analyze_request: Arc<Mutex<Option<String>>>,
    /// Non-acquired view of the state dir, used for the stop flag and the
    /// pid-ownership check after a 409.
    pub guard: Arc<ProcessSingleton>,
    pub mode: String,
    pub symbols: Vec<String>,
    pub started_at: DateTime<Utc>,
}

pub struct ControlChannel {
    transport: Arc<dyn CommandTransport>,
    limiter: Arc<RateLimiter>,
    allowed_chat: Option<i64>,
    offset: i64,
}

impl ControlChannel {
    pub fn new(
        transport: Arc<dyn CommandTransport>,
        limiter: Arc<RateLimiter>,
        allowed_chat: Option<i64>,
    ) -> Self {
        Self {
            transport,
            limiter,
            allowed_chat,
            offset: 0,
        }
    }

    /// Poll-and-dispatch until shutdown or a persistent 409 conflict.
    pub async fn run(mut self, ctx: ControlContext) {
        let mut conflicts = 0u32;
        loop {
            if ctx.guard.stop_requested() {
                info!("control channel observed stop flag, exiting");
                return;
            }
            self.limiter.acquire("control_poll").await;
            let updates = match self
                .transport
                .get_updates(self.offset + 1, Duration::from_secs(POLL_TIMEOUT_SECS))
                .await
            {
                Ok(u) => {
                    conflicts = 0;
                    u
                }
                Err(ChannelError::Conflict) => {
                    conflicts += 1;
                    warn!(conflicts, "getUpdates conflict, another poller is active");
                    if !ctx.guard.owned_by_current_process() {
                        error!("instance lock lost to another process, stopping the control channel");
                        return;
                    }
                    if conflicts >= MAX_CONFLICTS {
                        error!("persistent polling conflict, giving up the control channel");
                        return;
                    }
                    tokio::time::sleep(Duration::from_secs(5 * conflicts as u64)).await;
                    continue;
                }
                Err(e) => {
                    warn!(error = %e, "getUpdates failed, retrying");
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    continue;
                }
            };

            for update in updates {
                // advance past every retrieved update, even ones we drop
                self.offset = self.offset.max(update.update_id);
                if update.text.is_empty() {
                    continue;
                }
                if let Some(allowed) = self.allowed_chat {
                    if update.chat_id != allowed {
                        warn!(chat_id = update.chat_id, "ignoring command from unknown chat");
                        continue;
                    }
                }
                info!(sender = %update.sender, text = %update.text, "control command");
                let reply = dispatch(&update.text, &ctx).await;
                self.limiter.acquire("control_send").await;
                if let Err(e) = self.transport.send_message(update.chat_id, &reply).await {
                    warn!(error = %e, "failed to send command reply");
                }
            }
        }
    }
}

const HELP_TEXT: &str = "commands:\n\
    /status - loop state, capital, daily P&L\n\
    /balance - broker cash balance\n\
    /portfolio - open positions\n\
    /orders - recent order ledger\n\
    /analyze [SYMBOL] - queue an immediate analysis\n\
    /pause - stop opening new positions\n\
    /resume - resume trading\n\
    /stop - shut the bot down\n\
    /help - this text";

/// Map one command line to its reply, applying side effects.
pub async fn dispatch(text: &str, ctx: &ControlContext) -> String {
    let mut parts = text.split_whitespace();
    let command = parts.next().unwrap_or("");
    let arg = parts.next();

    match command {
        "/status" => {
            let risk = ctx.risk.lock().await;
            let state = risk.state();
            let paused = ctx.paused.load(Ordering::SeqCst);
            format!(
                "mode: {}\nsymbols: {}\nup since: {}\npaused: {}\nhalted: {}\ncapital: {:.2}\ndaily P&L: {:.2}\nconsecutive losses: {}",
                ctx.mode,
                ctx.symbols.join(", "),
                ctx.started_at.format("%Y-%m-%d %H:%M UTC"),
                paused,
                state.trading_halted,
                state.capital,
                state.daily_pnl,
                state.consecutive_losses,
            )
        }
        "/balance" => match ctx.broker.available_balance().await {
            Ok(balance) => format!("broker available balance: {:.2}", balance),
            Err(e) => format!("balance lookup failed: {}", e),
        },
        "/portfolio" => ctx.portfolio.lock().await.describe(),
        "/orders" => {
            let orders = ctx.coordinator.orders().await;
            if orders.is_empty() {
                return "no orders yet".to_string();
            }
            orders
                .iter()
                .rev()
                .take(10)
                .map(|o| {
                    format!(
                        "{} {} {} x{} @ {:.2} [{}]",
                        o.created_at.format("%m-%d %H:%M"),
                        o.symbol,
                        o.side,
                        o.quantity,
                        o.price,
                        match o.state {
                            OrderState::Pending => "pending",
                            OrderState::Executed => "executed",
                            OrderState::Rejected => "rejected",
                            OrderState::Unknown => "UNKNOWN",
                        }
                    )
                })
                .collect::<Vec<_>>()
                .join("\n")
        }
        "/analyze" => {
            let symbol = arg
                .map(|s| s.to_uppercase())
                .or_else(|| ctx.symbols.first().cloned());
            match symbol {
                Some(s) => {
                    *ctx.analyze_request.lock().await = Some(s.clone());
                    format!("analysis of {} queued for the next tick", s)
                }
                None => "no symbol configured".to_string(),
            }
        }
        "/pause" => {
            ctx.paused.store(true, Ordering::SeqCst);
            "paused: no new positions will be opened".to_string()
        }
        "/resume" => {
            ctx.paused.store(false, Ordering::SeqCst);
            "resumed".to_string()
        }
        "/stop" => match ctx.guard.request_stop() {
            Ok(()) => "stop flag written, shutting down after the current iteration".to_string(),
            Err(e) => format!("failed to write stop flag: {}", e),
        },
        "/help" => HELP_TEXT.to_string(),
        other => format!("unknown command {}; try /help", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn telegram_update_parsing() {
        let raw = r#"{
            "ok": true,
            "result": [{
                "update_id": 42,
                "message": {
                    "text": "/status",
                    "chat": {"id": 777},
                    "from": {"username": "ops"}
                }
            }]
        }"#;
        let body: TgResponse<Vec<TgUpdate>> = serde_json::from_str(raw).unwrap();
        assert!(body.ok);
        let updates = body.result.unwrap();
        assert_eq!(updates[0].update_id, 42);
        assert_eq!(updates[0].message.as_ref().unwrap().chat.id, 777);
    }

    #[test]
    fn non_text_updates_keep_their_update_id() {
        // a sticker (no message body) and a photo caption-less message must
        // still surface so the poll offset can advance past them
        let raw = r#"{"ok": true, "result": [
            {"update_id": 7, "message": null},
            {"update_id": 8, "message": {"text": null, "chat": {"id": 777}, "from": null}},
            {"update_id": 9, "message": {"text": "/status", "chat": {"id": 777}, "from": null}}
        ]}"#;
        let body: TgResponse<Vec<TgUpdate>> = serde_json::from_str(raw).unwrap();
        let messages = to_messages(body.result.unwrap());
        assert_eq!(
            messages.iter().map(|m| m.update_id).collect::<Vec<_>>(),
            vec![7, 8, 9]
        );
        assert!(messages[0].text.is_empty());
        assert!(messages[1].text.is_empty());
        assert_eq!(messages[2].text, "/status");
    }

    #[test]
    fn error_body_parses_description() {
        let raw = r#"{"ok": false, "description": "Unauthorized", "result": null}"#;
        let body: TgResponse<Vec<TgUpdate>> = serde_json::from_str(raw).unwrap();
        assert!(!body.ok);
        assert_eq!(body.description.as_deref(), Some("Unauthorized"));
    }
}
