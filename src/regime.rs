//! Market regime detection and score aggregation.
//!
//! The combiner weighs the per-module scores by regime. A calibrated
//! weight model can be plugged in; any malfunction (error, NaN, wrong
//! arity, non-positive mass) silently degrades to the static tables so a
//! bad model can never take the decision loop down.

use std::collections::BTreeMap;

use serde::Serialize;
use tracing::{debug, warn};

use crate::market::{annualized_volatility, avg_range, dec_f64, Candle};
use crate::signal::{Confidence, Score, SCORE_BOUND};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Regime {
    Trending,
    Ranging,
    Volatile,
    Unknown,
}

impl std::fmt::Display for Regime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Regime::Trending => write!(f, "trending"),
            Regime::Ranging => write!(f, "ranging"),
            Regime::Volatile => write!(f, "volatile"),
            Regime::Unknown => write!(f, "unknown"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RegimeReading {
    pub regime: Regime,
    pub adx: f64,
    pub volatility: f64,
    pub avg_range: f64,
    pub confidence: Confidence,
}

pub struct RegimeDetector;

impl RegimeDetector {
    const MIN_BARS: usize = 30;
    const ADX_PERIOD: usize = 14;

    pub fn detect(history: &[Candle]) -> RegimeReading {
        if history.len() < Self::MIN_BARS {
            return RegimeReading {
                regime: Regime::Unknown,
                adx: 0.0,
                volatility: 0.0,
                avg_range: 0.0,
                confidence: Confidence::Low,
            };
        }

        let adx = Self::adx(history);
        let volatility = annualized_volatility(history);
        let range = avg_range(history, 20);

        let regime = if volatility > 0.30 || range > 0.05 {
            Regime::Volatile
        } else if adx > 25.0 {
            Regime::Trending
        } else if adx < 20.0 {
            Regime::Ranging
        } else {
            // grey zone: let volatility break the tie
            if volatility > 0.20 {
                Regime::Volatile
            } else {
                Regime::Ranging
            }
        };

        let confidence = match regime {
            Regime::Trending if adx > 35.0 => Confidence::High,
            Regime::Volatile if volatility > 0.45 => Confidence::High,
            Regime::Ranging if adx < 12.0 => Confidence::High,
            Regime::Unknown => Confidence::Low,
            _ => Confidence::Medium,
        };

        debug!(%regime, adx, volatility, range, "regime detected");
        RegimeReading {
            regime,
            adx,
            volatility,
            avg_range: range,
            confidence,
        }
    }

    /// Wilder's average directional index over the last bars.
    fn adx(history: &[Candle]) -> f64 {
        let period = Self::ADX_PERIOD;
        if history.len() < period * 2 {
            return 0.0;
        }
        let mut dx_values = Vec::new();
        let mut tr_sum = 0.0;
        let mut plus_sum = 0.0;
        let mut minus_sum = 0.0;

        for w in history.windows(2) {
            let (prev, cur) = (&w[0], &w[1]);
            let high = dec_f64(cur.high);
            let low = dec_f64(cur.low);
            let prev_high = dec_f64(prev.high);
            let prev_low = dec_f64(prev.low);
            let prev_close = dec_f64(prev.close);

            let tr = (high - low)
                .max((high - prev_close).abs())
                .max((low - prev_close).abs());
            let up = high - prev_high;
            let down = prev_low - low;
            let plus_dm = if up > down && up > 0.0 { up } else { 0.0 };
            let minus_dm = if down > up && down > 0.0 { down } else { 0.0 };

            // Wilder smoothing
            tr_sum = tr_sum - tr_sum / period as f64 + tr;
            plus_sum = plus_sum - plus_sum / period as f64 + plus_dm;
            minus_sum = minus_sum - minus_sum / period as f64 + minus_dm;

            if tr_sum > 0.0 {
                let plus_di = 100.0 * plus_sum / tr_sum;
                let minus_di = 100.0 * minus_sum / tr_sum;
                let di_sum = plus_di + minus_di;
                if di_sum > 0.0 {
                    dx_values.push(100.0 * (plus_di - minus_di).abs() / di_sum);
                }
            }
        }

        let tail = &dx_values[dx_values.len().saturating_sub(period)..];
        if tail.is_empty() {
            0.0
        } else {
            tail.iter().sum::<f64>() / tail.len() as f64
        }
    }
}

/// Features handed to a calibrated weight model.
#[derive(Debug, Clone)]
pub struct WeightFeatures<'a> {
    pub scores: &'a [(String, i32)],
    pub volatility: f64,
    pub regime: Regime,
}

/// Pluggable calibrated model. Must return one non-negative weight per
/// score, in order. Anything else triggers the static fallback.
pub trait WeightModel: Send + Sync {
    fn predict_weights(&self, features: &WeightFeatures) -> anyhow::Result<Vec<f64>>;
}

#[derive(Debug, Clone, Serialize)]
pub struct AggregateDecision {
    pub score: i32,
    pub regime: Regime,
    pub weights: BTreeMap<String, f64>,
}

pub struct Combiner {
    model: Option<Box<dyn WeightModel>>,
}

impl Combiner {
    pub fn new() -> Self {
        Self { model: None }
    }

    pub fn with_model(model: Box<dyn WeightModel>) -> Self {
        Self { model: Some(model) }
    }

    /// Regime-keyed table, tuned from live performance reviews.
    fn static_weight(regime: Regime, module: &str) -> f64 {
        match regime {
            Regime::Trending => match module {
                "waves" => 0.25,
                "anomaly" => 0.20,
                "monte_carlo" => 0.15,
                "order_flow" => 0.15,
                "fractals" => 0.10,
                "pairs" => 0.10,
                "seasonal" => 0.05,
                _ => 0.10,
            },
            Regime::Ranging => match module {
                "fractals" => 0.25,
                "pairs" => 0.25,
                "seasonal" => 0.15,
                "anomaly" => 0.15,
                "order_flow" => 0.10,
                "waves" => 0.05,
                "monte_carlo" => 0.05,
                _ => 0.10,
            },
            Regime::Volatile => match module {
                "monte_carlo" => 0.35,
                "anomaly" => 0.25,
                "order_flow" => 0.15,
                "fractals" => 0.10,
                "waves" => 0.05,
                "pairs" => 0.05,
                "seasonal" => 0.05,
                _ => 0.10,
            },
            Regime::Unknown => 1.0,
        }
    }

    fn model_weights(&self, scores: &[(String, Score)], reading: &RegimeReading) -> Option<Vec<f64>> {
        let model = self.model.as_ref()?;
        let flat: Vec<(String, i32)> = scores
            .iter()
            .map(|(name, s)| (name.clone(), s.value))
            .collect();
        let features = WeightFeatures {
            scores: &flat,
            volatility: reading.volatility,
            regime: reading.regime,
        };
        let weights = match model.predict_weights(&features) {
            Ok(w) => w,
            Err(e) => {
                warn!(error = %e, "weight model failed, using static weights");
                return None;
            }
        };
        if weights.len() != scores.len() {
            warn!(
                got = weights.len(),
                want = scores.len(),
                "weight model returned wrong arity, using static weights"
            );
            return None;
        }
        if weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
            warn!("weight model returned invalid weights, using static weights");
            return None;
        }
        let mass: f64 = weights.iter().sum();
        if mass <= 0.0 {
            warn!("weight model returned zero mass, using static weights");
            return None;
        }
        Some(weights)
    }

    /// Weighted aggregate of the module scores. Modules that reported
    /// insufficient data carry zero weight.
    pub fn combine(&self, scores: &[(String, Score)], reading: &RegimeReading) -> AggregateDecision {
        let raw: Vec<f64> = match self.model_weights(scores, reading) {
            Some(w) => w,
            None => scores
                .iter()
                .map(|(name, _)| Self::static_weight(reading.regime, name))
                .collect(),
        };

        // zero out modules without an opinion, then normalize
        let masked: Vec<f64> = scores
            .iter()
            .zip(&raw)
            .map(|((_, s), &w)| if s.is_insufficient() { 0.0 } else { w })
            .collect();
        let mass: f64 = masked.iter().sum();

        let mut weights = BTreeMap::new();
        let mut total = 0.0;
        for ((name, score), w) in scores.iter().zip(&masked) {
            let norm = if mass > 0.0 { w / mass } else { 0.0 };
            weights.insert(name.clone(), norm);
            total += score.value as f64 * norm;
        }

        AggregateDecision {
            score: (total.round() as i32).clamp(-SCORE_BOUND, SCORE_BOUND),
            regime: reading.regime,
            weights,
        }
    }
}

impl Default for Combiner {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::testutil::candles_from_closes;
    use crate::signal::Factor;

    fn reading(regime: Regime) -> RegimeReading {
        RegimeReading {
            regime,
            adx: 30.0,
            volatility: 0.2,
            avg_range: 0.02,
            confidence: Confidence::Medium,
        }
    }

    fn score(v: i32) -> Score {
        Score::from_factors(vec![Factor::new("t", v, "test")], Confidence::Medium)
    }

    #[test]
    fn short_history_is_unknown_regime() {
        let candles = candles_from_closes(&[100.0; 10]);
        let r = RegimeDetector::detect(&candles);
        assert_eq!(r.regime, Regime::Unknown);
    }

    #[test]
    fn steady_climb_reads_trending() {
        let closes: Vec<f64> = (0..60).map(|i| 100.0 + i as f64 * 0.4).collect();
        let r = RegimeDetector::detect(&candles_from_closes(&closes));
        assert_eq!(r.regime, Regime::Trending, "adx={} vol={}", r.adx, r.volatility);
    }

    #[test]
    fn wild_swings_read_volatile() {
        let closes: Vec<f64> = (0..60)
            .map(|i| if i % 2 == 0 { 100.0 } else { 106.0 })
            .collect();
        let r = RegimeDetector::detect(&candles_from_closes(&closes));
        assert_eq!(r.regime, Regime::Volatile);
    }

    #[test]
    fn equal_weights_when_regime_unknown() {
        let combiner = Combiner::new();
        let scores = vec![
            ("anomaly".to_string(), score(30)),
            ("fractals".to_string(), score(-30)),
        ];
        let decision = combiner.combine(&scores, &reading(Regime::Unknown));
        assert_eq!(decision.score, 0);
    }

    #[test]
    fn insufficient_modules_carry_no_weight() {
        let combiner = Combiner::new();
        let scores = vec![
            ("anomaly".to_string(), score(20)),
            ("seasonal".to_string(), Score::insufficient_data()),
        ];
        let decision = combiner.combine(&scores, &reading(Regime::Trending));
        assert_eq!(decision.score, 20);
        assert_eq!(decision.weights["seasonal"], 0.0);
    }

    struct BrokenModel(fn() -> anyhow::Result<Vec<f64>>);
    impl WeightModel for BrokenModel {
        fn predict_weights(&self, _: &WeightFeatures) -> anyhow::Result<Vec<f64>> {
            (self.0)()
        }
    }

    #[test]
    fn model_error_falls_back_to_static_table() {
        let combiner = Combiner::with_model(Box::new(BrokenModel(|| {
            Err(anyhow::anyhow!("model file corrupt"))
        })));
        let scores = vec![("anomaly".to_string(), score(20))];
        let decision = combiner.combine(&scores, &reading(Regime::Trending));
        assert_eq!(decision.score, 20);
    }

    #[test]
    fn nan_weights_fall_back_to_static_table() {
        let combiner =
            Combiner::with_model(Box::new(BrokenModel(|| Ok(vec![f64::NAN]))));
        let scores = vec![("anomaly".to_string(), score(20))];
        let decision = combiner.combine(&scores, &reading(Regime::Volatile));
        assert_eq!(decision.score, 20);
    }

    #[test]
    fn wrong_arity_falls_back_to_static_table() {
        let combiner =
            Combiner::with_model(Box::new(BrokenModel(|| Ok(vec![0.5, 0.5, 0.5]))));
        let scores = vec![
            ("anomaly".to_string(), score(10)),
            ("waves".to_string(), score(20)),
        ];
        let decision = combiner.combine(&scores, &reading(Regime::Trending));
        // trending table: waves 0.25, anomaly 0.20 → (10*0.2 + 20*0.25)/0.45
        assert_eq!(decision.score, 16);
    }

    struct SkewModel;
    impl WeightModel for SkewModel {
        fn predict_weights(&self, features: &WeightFeatures) -> anyhow::Result<Vec<f64>> {
            Ok(features
                .scores
                .iter()
                .map(|(name, _)| if name == "waves" { 1.0 } else { 0.0 })
                .collect())
        }
    }

    #[test]
    fn healthy_model_output_is_used() {
        let combiner = Combiner::with_model(Box::new(SkewModel));
        let scores = vec![
            ("anomaly".to_string(), score(-30)),
            ("waves".to_string(), score(10)),
        ];
        let decision = combiner.combine(&scores, &reading(Regime::Ranging));
        assert_eq!(decision.score, 10);
    }
}
