//! Capital protection: position sizing, stop placement, the daily-loss
//! halt and the consecutive-loss/drawdown brakes.
//!
//! Every mutation persists `RiskState` to `risk_state.json` so a restart
//! picks up exactly where the previous process stopped. The halt is
//! monotonic for the day: once set it survives winning trades and only a
//! new trading date clears it.

use std::path::{Path, PathBuf};

use chrono::{NaiveDate, NaiveTime};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum RiskError {
    #[error("stop price {stop} must be below entry price {entry}")]
    InvalidStop { entry: Decimal, stop: Decimal },
    #[error("price must be positive, got {0}")]
    InvalidPrice(Decimal),
    #[error("risk state io: {0}")]
    Io(#[from] std::io::Error),
    #[error("risk state serialization: {0}")]
    Serde(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskState {
    pub capital: Decimal,
    pub start_of_day_capital: Decimal,
    pub peak_capital: Decimal,
    pub daily_pnl: Decimal,
    pub trading_halted: bool,
    pub consecutive_losses: u32,
    pub last_reset: NaiveDate,
}

impl RiskState {
    fn fresh(capital: Decimal, today: NaiveDate) -> Self {
        Self {
            capital,
            start_of_day_capital: capital,
            peak_capital: capital,
            daily_pnl: Decimal::ZERO,
            trading_halted: false,
            consecutive_losses: 0,
            last_reset: today,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RiskConfig {
    /// Fraction of capital risked per trade (0.02 = 2%).
    pub risk_per_trade: Decimal,
    /// Daily loss fraction of start-of-day capital that halts trading.
    pub max_daily_loss: Decimal,
    pub default_stop_pct: Decimal,
    pub default_take_profit_pct: Decimal,
    pub max_consecutive_losses: u32,
    /// Local trading window; None disables the check.
    pub trading_hours: Option<(NaiveTime, NaiveTime)>,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            risk_per_trade: Decimal::new(2, 2),          // 0.02
            max_daily_loss: Decimal::new(5, 2),          // 0.05
            default_stop_pct: Decimal::new(2, 2),        // 0.02
            default_take_profit_pct: Decimal::new(3, 2), // 0.03
            max_consecutive_losses: 3,
            trading_hours: None,
        }
    }
}

pub struct RiskManager {
    state: RiskState,
    config: RiskConfig,
    path: PathBuf,
}

impl RiskManager {
    /// Load persisted state, or start fresh with `initial_capital`.
    pub fn load(
        state_dir: &Path,
        config: RiskConfig,
        initial_capital: Decimal,
        today: NaiveDate,
    ) -> Result<Self, RiskError> {
        let path = state_dir.join("risk_state.json");
        let state = if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            serde_json::from_str(&raw)?
        } else {
            RiskState::fresh(initial_capital, today)
        };
        let mut manager = Self {
            state,
            config,
            path,
        };
        manager.roll_day(today)?;
        Ok(manager)
    }

    pub fn state(&self) -> &RiskState {
        &self.state
    }

    fn persist(&self) -> Result<(), RiskError> {
        let json = serde_json::to_string_pretty(&self.state)?;
        std::fs::write(&self.path, json)?;
        Ok(())
    }

    /// Reset the daily counters when a new trading date is observed.
    pub fn roll_day(&mut self, today: NaiveDate) -> Result<(), RiskError> {
        if self.state.last_reset == today {
            return Ok(());
        }
        info!(%today, "new trading day, resetting daily risk counters");
        self.state.daily_pnl = Decimal::ZERO;
        self.state.start_of_day_capital = self.state.capital;
        self.state.trading_halted = false;
        self.state.consecutive_losses = 0;
        self.state.last_reset = today;
        self.persist()
    }

    /// Whether a new position may be opened right now.
    pub fn can_trade(&self, now_local: NaiveTime) -> bool {
        if self.state.trading_halted {
            return false;
        }
        if self.state.consecutive_losses >= self.config.max_consecutive_losses {
            return false;
        }
        if let Some((open, close)) = self.config.trading_hours {
            if now_local < open || now_local > close {
                return false;
            }
        }
        true
    }

    /// Drawdown-scaled budget multiplier: deep drawdowns shrink sizing.
    fn drawdown_multiplier(&self) -> Decimal {
        if self.state.peak_capital <= Decimal::ZERO {
            return Decimal::ONE;
        }
        let drawdown = (self.state.peak_capital - self.state.capital) / self.state.peak_capital;
        if drawdown > Decimal::new(10, 2) {
            Decimal::new(5, 1) // 0.5
        } else if drawdown > Decimal::new(5, 2) {
            Decimal::new(75, 2) // 0.75
        } else {
            Decimal::ONE
        }
    }

    /// Whole shares such that losing the stop distance costs at most the
    /// per-trade risk budget; never more than the capital can buy.
    pub fn position_size(&self, entry: Decimal, stop: Decimal) -> Result<u64, RiskError> {
        if entry <= Decimal::ZERO {
            return Err(RiskError::InvalidPrice(entry));
        }
        if stop >= entry {
            return Err(RiskError::InvalidStop { entry, stop });
        }
        let budget = self.state.capital * self.config.risk_per_trade * self.drawdown_multiplier();
        let per_share = entry - stop;
        let by_risk = (budget / per_share).floor();
        let by_capital = (self.state.capital / entry).floor();
        let shares = by_risk.min(by_capital).max(Decimal::ZERO);
        Ok(shares.to_u64().unwrap_or(0))
    }

    pub fn stop_loss(&self, entry: Decimal) -> Result<Decimal, RiskError> {
        if entry <= Decimal::ZERO {
            return Err(RiskError::InvalidPrice(entry));
        }
        Ok(entry * (Decimal::ONE - self.config.default_stop_pct))
    }

    pub fn take_profit(&self, entry: Decimal) -> Result<Decimal, RiskError> {
        if entry <= Decimal::ZERO {
            return Err(RiskError::InvalidPrice(entry));
        }
        Ok(entry * (Decimal::ONE + self.config.default_take_profit_pct))
    }

    /// Record a realized P&L. Returns true when this fill tripped the
    /// daily-loss halt (callers notify the operator).
    pub fn record_fill(&mut self, pnl: Decimal) -> Result<bool, RiskError> {
        self.state.capital += pnl;
        self.state.daily_pnl += pnl;
        if self.state.capital > self.state.peak_capital {
            self.state.peak_capital = self.state.capital;
        }
        if pnl < Decimal::ZERO {
            self.state.consecutive_losses += 1;
        } else if pnl > Decimal::ZERO {
            self.state.consecutive_losses = 0;
        }

        let mut tripped = false;
        let loss_limit = self.state.start_of_day_capital * self.config.max_daily_loss;
        if !self.state.trading_halted && self.state.daily_pnl <= -loss_limit {
            warn!(
                daily_pnl = %self.state.daily_pnl,
                limit = %loss_limit,
                "daily loss limit breached, halting trading for the day"
            );
            self.state.trading_halted = true;
            tripped = true;
        }
        self.persist()?;
        Ok(tripped)
    }
}
