//! Monte-Carlo price projection from historical drift and volatility.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::market::{dec_f64, mean, returns, stddev, Candle};

use super::{Confidence, Factor, Score, SignalContext, SignalModule};

const MIN_HISTORY: usize = 60;

pub struct MonteCarloModule {
    pub simulations: usize,
    pub horizon_days: usize,
    /// Fixed seed keeps the module pure for a given input.
    pub seed: u64,
}

impl Default for MonteCarloModule {
    fn default() -> Self {
        Self {
            simulations: 500,
            horizon_days: 10,
            seed: 0x5eed_cafe,
        }
    }
}

/// Box-Muller standard normal draw.
fn normal(rng: &mut StdRng) -> f64 {
    let u1: f64 = rng.gen_range(f64::EPSILON..1.0);
    let u2: f64 = rng.gen_range(0.0..1.0);
    (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
}

impl SignalModule for MonteCarloModule {
    fn name(&self) -> &'static str {
        "monte_carlo"
    }

    fn min_history(&self) -> usize {
        MIN_HISTORY
    }

    fn evaluate(&self, history: &[Candle], _ctx: &SignalContext) -> Score {
        if history.len() < self.min_history() {
            return Score::insufficient_data();
        }

        let rets = returns(history);
        let drift = mean(&rets);
        let vol = stddev(&rets);
        let start = dec_f64(history[history.len() - 1].close);
        if start <= 0.0 || vol <= 0.0 {
            return Score::neutral();
        }

        let mut rng = StdRng::seed_from_u64(self.seed);
        let mut wins = 0usize;
        let mut sum_terminal = 0.0;
        for _ in 0..self.simulations {
            let mut price = start;
            for _ in 0..self.horizon_days {
                price *= 1.0 + drift + vol * normal(&mut rng);
            }
            if price > start {
                wins += 1;
            }
            sum_terminal += price;
        }

        let win_rate = wins as f64 / self.simulations as f64;
        let expected_return = sum_terminal / self.simulations as f64 / start - 1.0;

        let mut factors = Vec::new();
        if expected_return > 0.0 && win_rate > 0.55 {
            // scale with EV, saturating at the bound
            let delta = ((expected_return * 500.0).round() as i32).clamp(10, 30);
            factors.push(Factor::new(
                "positive_expectancy",
                delta,
                format!(
                    "EV {:+.1}% over {} days, {:.0}% of paths up",
                    expected_return * 100.0,
                    self.horizon_days,
                    win_rate * 100.0
                ),
            ));
        } else if expected_return < 0.0 {
            let delta = ((expected_return * 500.0).round() as i32).clamp(-25, -5);
            factors.push(Factor::new(
                "negative_expectancy",
                delta,
                format!("EV {:+.1}% over {} days", expected_return * 100.0, self.horizon_days),
            ));
        }
        if win_rate > 0.65 {
            factors.push(Factor::new(
                "high_win_rate",
                10,
                format!("{:.0}% of simulated paths finish up", win_rate * 100.0),
            ));
        } else if win_rate < 0.40 {
            factors.push(Factor::new(
                "low_win_rate",
                -15,
                format!("only {:.0}% of simulated paths finish up", win_rate * 100.0),
            ));
        }

        let confidence = if win_rate > 0.65 || win_rate < 0.35 {
            Confidence::High
        } else if factors.is_empty() {
            Confidence::Low
        } else {
            Confidence::Medium
        };
        Score::from_factors(factors, confidence)
    }
}
