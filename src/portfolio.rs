//! Cash and open positions, persisted to `portfolio.json`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::market::Side;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub quantity: u64,
    pub avg_entry: Decimal,
    pub last_price: Option<Decimal>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Portfolio {
    pub cash: Decimal,
    pub positions: BTreeMap<String, Position>,
    #[serde(skip)]
    path: PathBuf,
}

impl Portfolio {
    pub fn load(state_dir: &Path, initial_cash: Decimal) -> anyhow::Result<Self> {
        let path = state_dir.join("portfolio.json");
        let mut portfolio: Portfolio = if path.exists() {
            serde_json::from_str(&std::fs::read_to_string(&path)?)?
        } else {
            Portfolio {
                cash: initial_cash,
                positions: BTreeMap::new(),
                path: PathBuf::new(),
            }
        };
        portfolio.path = path;
        Ok(portfolio)
    }

    fn persist(&self) -> anyhow::Result<()> {
        std::fs::write(&self.path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn position(&self, symbol: &str) -> Option<&Position> {
        self.positions.get(symbol)
    }

    /// Apply an executed fill. Sells return the realized P&L against the
    /// average entry; buys return None.
    pub fn apply_fill(
        &mut self,
        symbol: &str,
        side: Side,
        quantity: u64,
        price: Decimal,
    ) -> anyhow::Result<Option<Decimal>> {
        let notional = price * Decimal::from(quantity);
        let realized = match side {
            Side::Buy => {
                self.cash -= notional;
                let entry = self.positions.entry(symbol.to_string()).or_insert(Position {
                    symbol: symbol.to_string(),
                    quantity: 0,
                    avg_entry: Decimal::ZERO,
                    last_price: None,
                    updated_at: Utc::now(),
                });
                let old_notional = entry.avg_entry * Decimal::from(entry.quantity);
                entry.quantity += quantity;
                entry.avg_entry = (old_notional + notional) / Decimal::from(entry.quantity);
                entry.last_price = Some(price);
                entry.updated_at = Utc::now();
                None
            }
            Side::Sell => {
                self.cash += notional;
                let mut realized = None;
                if let Some(pos) = self.positions.get_mut(symbol) {
                    let sold = quantity.min(pos.quantity);
                    realized = Some((price - pos.avg_entry) * Decimal::from(sold));
                    pos.quantity -= sold;
                    pos.last_price = Some(price);
                    pos.updated_at = Utc::now();
                    if pos.quantity == 0 {
                        self.positions.remove(symbol);
                    }
                }
                realized
            }
        };
        self.persist()?;
        Ok(realized)
    }

    pub fn mark(&mut self, symbol: &str, price: Decimal) {
        if let Some(pos) = self.positions.get_mut(symbol) {
            pos.last_price = Some(price);
            pos.updated_at = Utc::now();
        }
    }

    /// Cash plus positions at their last marked price.
    pub fn equity(&self) -> Decimal {
        let held: Decimal = self
            .positions
            .values()
            .map(|p| p.last_price.unwrap_or(p.avg_entry) * Decimal::from(p.quantity))
            .sum();
        self.cash + held
    }

    /// Human-readable snapshot for the /portfolio command.
    pub fn describe(&self) -> String {
        let mut lines = vec![format!("cash: {:.2}", self.cash)];
        if self.positions.is_empty() {
            lines.push("no open positions".to_string());
        }
        for pos in self.positions.values() {
            lines.push(format!(
                "{}: {} @ avg {:.2} (last {})",
                pos.symbol,
                pos.quantity,
                pos.avg_entry,
                pos.last_price
                    .map(|p| format!("{:.2}", p))
                    .unwrap_or_else(|| "-".to_string()),
            ));
        }
        lines.push(format!("equity: {:.2}", self.equity()));
        lines.join("\n")
    }
}
