//! Market data types shared by the signal modules and the runner.

use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Single OHLCV bar.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candle {
    pub timestamp: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
}

/// Top-of-book quote.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Quote {
    pub symbol: String,
    pub last: Decimal,
    pub bid: Option<Decimal>,
    pub ask: Option<Decimal>,
    pub timestamp: DateTime<Utc>,
}

impl Quote {
    /// Relative bid/ask spread, when both sides are present and sane.
    pub fn spread_pct(&self) -> Option<f64> {
        let bid = dec_f64(self.bid?);
        let ask = dec_f64(self.ask?);
        if bid <= 0.0 || ask <= bid {
            return None;
        }
        let mid = (bid + ask) / 2.0;
        Some((ask - bid) / mid)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DepthLevel {
    pub price: Decimal,
    pub quantity: Decimal,
}

/// Aggregated order book snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketDepth {
    pub symbol: String,
    pub bids: Vec<DepthLevel>,
    pub asks: Vec<DepthLevel>,
}

impl MarketDepth {
    /// Bid volume as a fraction of total resting volume; 0.5 means balanced.
    pub fn bid_pressure(&self) -> Option<f64> {
        let bid_vol: f64 = self.bids.iter().map(|l| dec_f64(l.quantity)).sum();
        let ask_vol: f64 = self.asks.iter().map(|l| dec_f64(l.quantity)).sum();
        let total = bid_vol + ask_vol;
        if total <= 0.0 {
            return None;
        }
        Some(bid_vol / total)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Buy,
    Sell,
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Buy => write!(f, "buy"),
            Side::Sell => write!(f, "sell"),
        }
    }
}

/// Lossy conversion for statistical math. Prices that fail to convert
/// (absurd magnitudes) collapse to 0.0 and wash out of the statistics.
pub fn dec_f64(d: Decimal) -> f64 {
    d.to_f64().unwrap_or(0.0)
}

pub fn closes(history: &[Candle]) -> Vec<f64> {
    history.iter().map(|c| dec_f64(c.close)).collect()
}

/// Simple returns between consecutive closes.
pub fn returns(history: &[Candle]) -> Vec<f64> {
    history
        .windows(2)
        .filter_map(|w| {
            let prev = dec_f64(w[0].close);
            let next = dec_f64(w[1].close);
            if prev > 0.0 {
                Some(next / prev - 1.0)
            } else {
                None
            }
        })
        .collect()
}

pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

pub fn stddev(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let m = mean(values);
    let var = values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / (values.len() - 1) as f64;
    var.sqrt()
}

/// Annualized volatility of daily returns (252 trading days).
pub fn annualized_volatility(history: &[Candle]) -> f64 {
    stddev(&returns(history)) * (252.0_f64).sqrt()
}

/// Mean (high-low)/close over the last `window` bars.
pub fn avg_range(history: &[Candle], window: usize) -> f64 {
    let tail = &history[history.len().saturating_sub(window)..];
    let ranges: Vec<f64> = tail
        .iter()
        .filter_map(|c| {
            let close = dec_f64(c.close);
            if close > 0.0 {
                Some((dec_f64(c.high) - dec_f64(c.low)) / close)
            } else {
                None
            }
        })
        .collect();
    mean(&ranges)
}
