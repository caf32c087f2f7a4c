//! Pair mean-reversion: z-score of the price ratio against a peer series.

use crate::market::{dec_f64, mean, stddev, Candle};

use super::{Confidence, Factor, Score, SignalContext, SignalModule};

const MIN_HISTORY: usize = 60;
const Z_THRESHOLD: f64 = 2.0;

pub struct PairsModule;

impl SignalModule for PairsModule {
    fn name(&self) -> &'static str {
        "pairs"
    }

    fn min_history(&self) -> usize {
        MIN_HISTORY
    }

    fn evaluate(&self, history: &[Candle], ctx: &SignalContext) -> Score {
        let peer = match ctx.peer_history {
            Some(p) => p,
            None => return Score::insufficient_data(),
        };
        let n = history.len().min(peer.len());
        if n < self.min_history() {
            return Score::insufficient_data();
        }

        // align on the most recent n bars of each series
        let ours = &history[history.len() - n..];
        let theirs = &peer[peer.len() - n..];
        let ratios: Vec<f64> = ours
            .iter()
            .zip(theirs)
            .filter_map(|(a, b)| {
                let pb = dec_f64(b.close);
                if pb > 0.0 {
                    Some(dec_f64(a.close) / pb)
                } else {
                    None
                }
            })
            .collect();
        if ratios.len() < self.min_history() {
            return Score::insufficient_data();
        }

        let m = mean(&ratios);
        let sd = stddev(&ratios);
        if sd <= 0.0 {
            return Score::neutral();
        }
        let z = (ratios[ratios.len() - 1] - m) / sd;

        let mut factors = Vec::new();
        if z > Z_THRESHOLD {
            factors.push(Factor::new(
                "ratio_stretched_high",
                -20,
                format!("pair ratio z-score {:+.2}, reversion favors selling", z),
            ));
        } else if z < -Z_THRESHOLD {
            factors.push(Factor::new(
                "ratio_stretched_low",
                20,
                format!("pair ratio z-score {:+.2}, reversion favors buying", z),
            ));
        }

        let confidence = if z.abs() > 3.0 {
            Confidence::High
        } else if factors.is_empty() {
            Confidence::Low
        } else {
            Confidence::Medium
        };
        Score::from_factors(factors, confidence)
    }
}
