use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};

use quantbot::broker::{BrokerConnector, HttpBroker};
use quantbot::config::{AppConfig, Cli, TradingMode};
use quantbot::control::{CommandTransport, TelegramTransport};
use quantbot::runner::BotRunner;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let cli = Cli::parse();
    let config = match AppConfig::from_cli(cli) {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "configuration invalid");
            std::process::exit(1);
        }
    };

    info!(mode = %config.mode, symbols = ?config.symbols, "quantbot starting");

    let broker: Arc<dyn BrokerConnector> = {
        // paper mode without credentials still reads public market data;
        // a placeholder token keeps the client constructible
        let token = config
            .broker_token
            .clone()
            .unwrap_or_else(|| "anonymous".to_string());
        match HttpBroker::new(config.broker_base_url.clone(), token) {
            Ok(b) => Arc::new(b),
            Err(e) => {
                error!(error = %e, "broker client init failed");
                std::process::exit(1);
            }
        }
    };

    let transport: Option<Arc<dyn CommandTransport>> = match &config.telegram_token {
        Some(token) => match TelegramTransport::new(token) {
            Ok(t) => Some(Arc::new(t)),
            Err(e) => {
                error!(error = %e, "telegram transport init failed");
                std::process::exit(1);
            }
        },
        None => {
            if config.mode == TradingMode::Live {
                info!("no TELEGRAM_BOT_TOKEN set, running live without remote control");
            }
            None
        }
    };

    let mut runner = match BotRunner::new(config, broker, transport) {
        Ok(r) => r,
        Err(e) => {
            error!(error = %e, "startup failed");
            std::process::exit(1);
        }
    };

    match runner.run().await {
        Ok(()) => {
            info!("clean shutdown");
        }
        Err(e) => {
            error!(error = %e, "runner exited with error");
            std::process::exit(1);
        }
    }
}
