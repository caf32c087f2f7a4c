//! Configuration: command-line flags plus environment credentials.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use rust_decimal::Decimal;

use crate::risk::RiskConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TradingMode {
    Paper,
    Live,
}

impl std::fmt::Display for TradingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TradingMode::Paper => write!(f, "paper"),
            TradingMode::Live => write!(f, "live"),
        }
    }
}

#[derive(Debug, Parser)]
#[command(name = "quantbot", about = "unattended multi-signal trading loop")]
pub struct Cli {
    /// Trade with real money through the broker API
    #[arg(long, conflicts_with = "paper")]
    pub live: bool,

    /// Simulate fills locally (default)
    #[arg(long)]
    pub paper: bool,

    /// Keep running on an interval instead of a single analysis pass
    #[arg(long, conflicts_with = "once")]
    pub continuous: bool,

    /// Run one analysis pass and exit
    #[arg(long)]
    pub once: bool,

    /// Minutes between analysis passes in continuous mode
    #[arg(long, default_value_t = 30)]
    pub interval_mins: u64,

    /// Symbols to trade, comma separated
    #[arg(long, value_delimiter = ',', default_value = "GGAL,YPFD,PAMP")]
    pub symbols: Vec<String>,

    /// Directory for state files (ledger, risk state, pid, stop flag)
    #[arg(long, default_value = "./state")]
    pub state_dir: PathBuf,

    /// Starting paper capital
    #[arg(long, default_value = "1000000")]
    pub initial_capital: Decimal,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub mode: TradingMode,
    pub continuous: bool,
    pub interval_mins: u64,
    pub symbols: Vec<String>,
    /// symbol -> correlated peer used for pair analysis
    pub peers: Vec<(String, String)>,
    pub state_dir: PathBuf,
    pub initial_capital: Decimal,
    pub broker_base_url: String,
    pub broker_token: Option<String>,
    pub telegram_token: Option<String>,
    pub telegram_chat_id: Option<i64>,
    pub risk: RiskConfig,
    pub buy_threshold: i32,
    pub sell_threshold: i32,
}

impl AppConfig {
    pub fn from_cli(cli: Cli) -> anyhow::Result<Self> {
        let mode = if cli.live {
            TradingMode::Live
        } else {
            TradingMode::Paper
        };

        let broker_base_url = std::env::var("BROKER_API_URL")
            .unwrap_or_else(|_| "https://api.invertironline.com".to_string());
        let broker_token = std::env::var("BROKER_API_TOKEN").ok().filter(|t| !t.is_empty());
        if mode == TradingMode::Live && broker_token.is_none() {
            anyhow::bail!("live mode requires BROKER_API_TOKEN");
        }

        let telegram_token = std::env::var("TELEGRAM_BOT_TOKEN").ok().filter(|t| !t.is_empty());
        let telegram_chat_id = match std::env::var("TELEGRAM_CHAT_ID") {
            Ok(raw) => Some(
                raw.parse::<i64>()
                    .context("TELEGRAM_CHAT_ID must be an integer")?,
            ),
            Err(_) => None,
        };

        let symbols: Vec<String> = cli
            .symbols
            .iter()
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .collect();
        if symbols.is_empty() {
            anyhow::bail!("at least one symbol is required");
        }

        Ok(Self {
            mode,
            continuous: cli.continuous && !cli.once,
            interval_mins: cli.interval_mins.max(1),
            symbols,
            peers: default_peers(),
            state_dir: cli.state_dir,
            initial_capital: cli.initial_capital,
            broker_base_url,
            broker_token,
            telegram_token,
            telegram_chat_id,
            risk: RiskConfig::default(),
            buy_threshold: 15,
            sell_threshold: -15,
        })
    }

    pub fn peer_for(&self, symbol: &str) -> Option<&str> {
        self.peers
            .iter()
            .find(|(s, _)| s == symbol)
            .map(|(_, p)| p.as_str())
    }
}

/// Historically correlated bank/energy pairs on the local exchange.
fn default_peers() -> Vec<(String, String)> {
    vec![
        ("GGAL".to_string(), "BMA".to_string()),
        ("BMA".to_string(), "GGAL".to_string()),
        ("YPFD".to_string(), "PAMP".to_string()),
        ("PAMP".to_string(), "YPFD".to_string()),
    ]
}
