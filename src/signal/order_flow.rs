//! Order-flow structure: book imbalance, order blocks, fair value gaps and
//! liquidity sweeps.

use crate::market::{dec_f64, Candle};

use super::{Confidence, Factor, Score, SignalContext, SignalModule};

const MIN_HISTORY: usize = 50;

pub struct OrderFlowModule;

impl OrderFlowModule {
    /// Last strong down-candle immediately before an impulsive up-move.
    /// Re-entry into its body is a buy zone.
    fn bullish_order_block(history: &[Candle]) -> Option<(f64, f64)> {
        let n = history.len();
        for i in (n.saturating_sub(20)..n.saturating_sub(3)).rev() {
            let block = &history[i];
            let open = dec_f64(block.open);
            let close = dec_f64(block.close);
            if close >= open {
                continue; // need a down candle
            }
            let impulse_end = dec_f64(history[i + 2].close);
            if open > 0.0 && impulse_end / open - 1.0 > 0.03 {
                return Some((close.min(open), close.max(open)));
            }
        }
        None
    }

    /// Unfilled gap between candle i's high and candle i+2's low.
    fn fair_value_gap(history: &[Candle]) -> Option<(f64, f64)> {
        let n = history.len();
        for i in (n.saturating_sub(15)..n.saturating_sub(3)).rev() {
            let lower = dec_f64(history[i].high);
            let upper = dec_f64(history[i + 2].low);
            if upper > lower && lower > 0.0 && (upper - lower) / lower > 0.005 {
                return Some((lower, upper));
            }
        }
        None
    }

    /// Wick below the recent low range that closes back inside it.
    fn liquidity_sweep(history: &[Candle]) -> bool {
        let n = history.len();
        if n < 12 {
            return false;
        }
        let last = &history[n - 1];
        let prior_low = history[n - 11..n - 1]
            .iter()
            .map(|c| dec_f64(c.low))
            .fold(f64::INFINITY, f64::min);
        dec_f64(last.low) < prior_low && dec_f64(last.close) > prior_low
    }
}

impl SignalModule for OrderFlowModule {
    fn name(&self) -> &'static str {
        "order_flow"
    }

    fn min_history(&self) -> usize {
        MIN_HISTORY
    }

    fn evaluate(&self, history: &[Candle], ctx: &SignalContext) -> Score {
        if history.len() < self.min_history() {
            return Score::insufficient_data();
        }

        let price = dec_f64(history[history.len() - 1].close);
        if price <= 0.0 {
            return Score::neutral();
        }
        let mut factors = Vec::new();

        if let Some(pressure) = ctx.depth.and_then(|d| d.bid_pressure()) {
            if pressure > 0.65 {
                factors.push(Factor::new(
                    "bid_heavy_book",
                    10,
                    format!("{:.0}% of resting volume on the bid", pressure * 100.0),
                ));
            } else if pressure < 0.35 {
                factors.push(Factor::new(
                    "ask_heavy_book",
                    -10,
                    format!("{:.0}% of resting volume on the bid", pressure * 100.0),
                ));
            }
        }

        if let Some((lo, hi)) = Self::bullish_order_block(history) {
            if price >= lo && price <= hi {
                factors.push(Factor::new(
                    "order_block_reentry",
                    25,
                    format!("price back inside demand zone {:.2}-{:.2}", lo, hi),
                ));
            }
        }

        if let Some((lo, hi)) = Self::fair_value_gap(history) {
            if price >= lo && price <= hi {
                factors.push(Factor::new(
                    "fvg_fill",
                    20,
                    format!("filling fair value gap {:.2}-{:.2}", lo, hi),
                ));
            }
        }

        if Self::liquidity_sweep(history) {
            factors.push(Factor::new(
                "liquidity_sweep",
                25,
                "swept the 10-bar low and reclaimed it",
            ));
        }

        let confidence = if factors.iter().any(|f| f.delta >= 25) {
            Confidence::High
        } else if factors.is_empty() {
            Confidence::Low
        } else {
            Confidence::Medium
        };
        Score::from_factors(factors, confidence)
    }
}
