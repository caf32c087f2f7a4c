//! Signal modules: independent, pure analyzers that each turn market data
//! into a bounded score. Positive favors buying, negative favors selling.
//!
//! Modules never perform I/O and never fail: when they cannot form an
//! opinion (short history, missing context) they return
//! [`Score::insufficient_data`] and the combiner weighs them accordingly.

pub mod anomaly;
pub mod fractals;
pub mod monte_carlo;
pub mod order_flow;
pub mod pairs;
pub mod seasonal;
pub mod waves;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::market::{Candle, MarketDepth, Quote};

/// Hard bound on every module score and on the aggregate.
pub const SCORE_BOUND: i32 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    Low,
    Medium,
    High,
}

/// One named contribution to a score, kept for operator-facing explanations.
#[derive(Debug, Clone, Serialize)]
pub struct Factor {
    pub label: String,
    pub delta: i32,
    pub reason: String,
}

impl Factor {
    pub fn new(label: &str, delta: i32, reason: impl Into<String>) -> Self {
        Self {
            label: label.to_string(),
            delta,
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Score {
    pub value: i32,
    pub factors: Vec<Factor>,
    pub confidence: Confidence,
}

impl Score {
    /// Sum the factor deltas and clamp to the shared bound.
    pub fn from_factors(factors: Vec<Factor>, confidence: Confidence) -> Self {
        let raw: i32 = factors.iter().map(|f| f.delta).sum();
        Self {
            value: raw.clamp(-SCORE_BOUND, SCORE_BOUND),
            factors,
            confidence,
        }
    }

    pub fn neutral() -> Self {
        Self {
            value: 0,
            factors: Vec::new(),
            confidence: Confidence::Low,
        }
    }

    /// Canonical "not enough history" result. Distinguishable from a
    /// genuine neutral opinion by its single marker factor.
    pub fn insufficient_data() -> Self {
        Self {
            value: 0,
            factors: vec![Factor::new(
                "insufficient_data",
                0,
                "history shorter than module minimum",
            )],
            confidence: Confidence::Low,
        }
    }

    pub fn is_insufficient(&self) -> bool {
        self.factors
            .iter()
            .any(|f| f.label == "insufficient_data")
    }
}

/// Optional per-tick context beyond the candle history.
pub struct SignalContext<'a> {
    pub quote: Option<&'a Quote>,
    pub depth: Option<&'a MarketDepth>,
    /// Aligned candle history of a correlated peer, for pair analysis.
    pub peer_history: Option<&'a [Candle]>,
    pub now: DateTime<Utc>,
}

impl<'a> SignalContext<'a> {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            quote: None,
            depth: None,
            peer_history: None,
            now,
        }
    }
}

pub trait SignalModule: Send + Sync {
    fn name(&self) -> &'static str;

    /// Minimum candles required before the module forms an opinion.
    fn min_history(&self) -> usize;

    fn evaluate(&self, history: &[Candle], ctx: &SignalContext) -> Score;
}

/// The full module roster, in evaluation order.
pub fn all_modules() -> Vec<Box<dyn SignalModule>> {
    vec![
        Box::new(anomaly::AnomalyModule),
        Box::new(fractals::FractalModule),
        Box::new(monte_carlo::MonteCarloModule::default()),
        Box::new(pairs::PairsModule),
        Box::new(seasonal::SeasonalModule),
        Box::new(order_flow::OrderFlowModule),
        Box::new(waves::WaveModule),
    ]
}
