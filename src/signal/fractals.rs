//! Williams fractal support/resistance proximity.

use crate::market::{dec_f64, Candle};

use super::{Confidence, Factor, Score, SignalContext, SignalModule};

const MIN_HISTORY: usize = 20;
const PROXIMITY: f64 = 0.02;

pub struct FractalModule;

impl FractalModule {
    /// A low flanked by two higher lows on each side (support), and the
    /// mirror image for highs (resistance).
    fn fractal_levels(history: &[Candle]) -> (Vec<f64>, Vec<f64>) {
        let mut supports = Vec::new();
        let mut resistances = Vec::new();
        for w in history.windows(5) {
            let lows: Vec<f64> = w.iter().map(|c| dec_f64(c.low)).collect();
            let highs: Vec<f64> = w.iter().map(|c| dec_f64(c.high)).collect();
            if lows[2] < lows[0] && lows[2] < lows[1] && lows[2] < lows[3] && lows[2] < lows[4] {
                supports.push(lows[2]);
            }
            if highs[2] > highs[0]
                && highs[2] > highs[1]
                && highs[2] > highs[3]
                && highs[2] > highs[4]
            {
                resistances.push(highs[2]);
            }
        }
        (supports, resistances)
    }
}

impl SignalModule for FractalModule {
    fn name(&self) -> &'static str {
        "fractals"
    }

    fn min_history(&self) -> usize {
        MIN_HISTORY
    }

    fn evaluate(&self, history: &[Candle], _ctx: &SignalContext) -> Score {
        if history.len() < self.min_history() {
            return Score::insufficient_data();
        }

        let price = dec_f64(history[history.len() - 1].close);
        if price <= 0.0 {
            return Score::neutral();
        }
        let (supports, resistances) = Self::fractal_levels(history);

        let mut factors = Vec::new();

        // Nearest support below, nearest resistance above
        let support = supports
            .iter()
            .filter(|&&s| s <= price)
            .cloned()
            .fold(None::<f64>, |acc, s| Some(acc.map_or(s, |a| a.max(s))));
        let resistance = resistances
            .iter()
            .filter(|&&r| r >= price)
            .cloned()
            .fold(None::<f64>, |acc, r| Some(acc.map_or(r, |a| a.min(r))));

        if let Some(s) = support {
            let dist = (price - s) / price;
            if dist < PROXIMITY {
                factors.push(Factor::new(
                    "near_support",
                    15,
                    format!("{:.1}% above fractal support {:.2}", dist * 100.0, s),
                ));
            }
        }
        if let Some(r) = resistance {
            let dist = (r - price) / price;
            if dist < PROXIMITY {
                factors.push(Factor::new(
                    "near_resistance",
                    -15,
                    format!("{:.1}% below fractal resistance {:.2}", dist * 100.0, r),
                ));
            }
        }

        let confidence = if factors.is_empty() {
            Confidence::Low
        } else {
            Confidence::Medium
        };
        Score::from_factors(factors, confidence)
    }
}
