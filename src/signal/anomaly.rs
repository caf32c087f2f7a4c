//! Volume, price-move and spread anomaly scoring.

use crate::market::{dec_f64, Candle};

use super::{Confidence, Factor, Score, SignalContext, SignalModule};

const MIN_HISTORY: usize = 21;

pub struct AnomalyModule;

impl SignalModule for AnomalyModule {
    fn name(&self) -> &'static str {
        "anomaly"
    }

    fn min_history(&self) -> usize {
        MIN_HISTORY
    }

    fn evaluate(&self, history: &[Candle], ctx: &SignalContext) -> Score {
        if history.len() < self.min_history() {
            return Score::insufficient_data();
        }

        let mut factors = Vec::new();
        let last = &history[history.len() - 1];
        let prior = &history[history.len() - MIN_HISTORY..history.len() - 1];

        // Volume spike vs the 20-bar average
        let avg_volume: f64 =
            prior.iter().map(|c| dec_f64(c.volume)).sum::<f64>() / prior.len() as f64;
        let volume = dec_f64(last.volume);
        if avg_volume > 0.0 {
            let ratio = volume / avg_volume;
            if ratio >= 5.0 {
                factors.push(Factor::new(
                    "volume_spike",
                    25,
                    format!("volume {:.1}x the 20-bar average", ratio),
                ));
            } else if ratio >= 3.0 {
                factors.push(Factor::new(
                    "volume_elevated",
                    15,
                    format!("volume {:.1}x the 20-bar average", ratio),
                ));
            }
        }

        // Outsized single-bar move
        let prev_close = dec_f64(history[history.len() - 2].close);
        let close = dec_f64(last.close);
        if prev_close > 0.0 {
            let change = close / prev_close - 1.0;
            if change.abs() >= 0.10 {
                let delta = if change > 0.0 { 25 } else { -25 };
                factors.push(Factor::new(
                    "price_shock",
                    delta,
                    format!("{:+.1}% single-bar move", change * 100.0),
                ));
            } else if change.abs() >= 0.05 {
                let delta = if change > 0.0 { 10 } else { -10 };
                factors.push(Factor::new(
                    "price_move",
                    delta,
                    format!("{:+.1}% single-bar move", change * 100.0),
                ));
            }
        }

        // Wide spread signals thin liquidity; penalize regardless of direction
        if let Some(spread) = ctx.quote.and_then(|q| q.spread_pct()) {
            if spread > 0.03 {
                factors.push(Factor::new(
                    "wide_spread",
                    -10,
                    format!("{:.1}% bid/ask spread", spread * 100.0),
                ));
            }
        }

        let confidence = if factors.len() >= 2 {
            Confidence::High
        } else if factors.is_empty() {
            Confidence::Low
        } else {
            Confidence::Medium
        };
        Score::from_factors(factors, confidence)
    }
}
