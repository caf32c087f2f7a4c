//! Coarse impulse/correction wave classification from swing pivots.

use crate::market::{closes, Candle};

use super::{Confidence, Factor, Score, SignalContext, SignalModule};

const MIN_HISTORY: usize = 50;
const PIVOT_WING: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq)]
enum Pivot {
    High(f64),
    Low(f64),
}

pub struct WaveModule;

impl WaveModule {
    /// Local extrema with `PIVOT_WING` bars on each side.
    fn pivots(prices: &[f64]) -> Vec<Pivot> {
        let mut out = Vec::new();
        for i in PIVOT_WING..prices.len().saturating_sub(PIVOT_WING) {
            let p = prices[i];
            let wing = &prices[i - PIVOT_WING..=i + PIVOT_WING];
            if wing.iter().all(|&v| v <= p) && wing.iter().filter(|&&v| v == p).count() == 1 {
                out.push(Pivot::High(p));
            } else if wing.iter().all(|&v| v >= p) && wing.iter().filter(|&&v| v == p).count() == 1
            {
                out.push(Pivot::Low(p));
            }
        }
        out
    }

    /// Classify the position within the most recent swing structure.
    /// Looks at the last four alternating pivots: higher-high/higher-low
    /// sequences read as an impulse; the third advance is the strongest.
    fn classify(pivots: &[Pivot], price: f64) -> Option<Factor> {
        let lows: Vec<f64> = pivots
            .iter()
            .filter_map(|p| match p {
                Pivot::Low(v) => Some(*v),
                _ => None,
            })
            .collect();
        let highs: Vec<f64> = pivots
            .iter()
            .filter_map(|p| match p {
                Pivot::High(v) => Some(*v),
                _ => None,
            })
            .collect();
        if lows.len() < 2 || highs.len() < 2 {
            return None;
        }

        let (l2, l1) = (lows[lows.len() - 2], lows[lows.len() - 1]);
        let (h2, h1) = (highs[highs.len() - 2], highs[highs.len() - 1]);
        let higher_lows = l1 > l2;
        let higher_highs = h1 > h2;

        if higher_lows && higher_highs && price > h1 {
            // breaking above the prior swing high after two advances
            return Some(Factor::new(
                "wave3_breakout",
                25,
                "third-wave breakout above the prior swing high",
            ));
        }
        if higher_lows && price > l1 && price < h1 {
            return Some(Factor::new(
                "wave1_building",
                10,
                "early impulse: higher low held, below the swing high",
            ));
        }
        if !higher_lows && !higher_highs && price < l1 {
            // terminal leg of a correction often exhausts sellers
            return Some(Factor::new(
                "wavec_exhaustion",
                15,
                "C-leg undercut of a falling swing sequence",
            ));
        }
        if !higher_highs && price < h1 {
            return Some(Factor::new(
                "correction_underway",
                -10,
                "lower highs, corrective structure in control",
            ));
        }
        None
    }
}

impl SignalModule for WaveModule {
    fn name(&self) -> &'static str {
        "waves"
    }

    fn min_history(&self) -> usize {
        MIN_HISTORY
    }

    fn evaluate(&self, history: &[Candle], _ctx: &SignalContext) -> Score {
        if history.len() < self.min_history() {
            return Score::insufficient_data();
        }
        let prices = closes(history);
        let price = prices[prices.len() - 1];
        let pivots = Self::pivots(&prices);

        let factors = Self::classify(&pivots, price).into_iter().collect::<Vec<_>>();
        let confidence = match factors.first() {
            Some(f) if f.delta >= 25 => Confidence::High,
            Some(_) => Confidence::Medium,
            None => Confidence::Low,
        };
        Score::from_factors(factors, confidence)
    }
}
