//! Calendar seasonality: historical month/weekday tendencies plus the
//! well-known fixed effects (January, Santa rally, September slump).

use chrono::{Datelike, Weekday};

use crate::market::{mean, Candle};

use super::{Confidence, Factor, Score, SignalContext, SignalModule};

// roughly one trading year
const MIN_HISTORY: usize = 250;

pub struct SeasonalModule;

impl SeasonalModule {
    /// Mean historical return of bars matching `pred`, in percent.
    fn mean_return_pct(history: &[Candle], pred: impl Fn(&Candle) -> bool) -> Option<f64> {
        let matched: Vec<f64> = history
            .windows(2)
            .filter(|w| pred(&w[1]))
            .filter_map(|w| {
                let prev = crate::market::dec_f64(w[0].close);
                let next = crate::market::dec_f64(w[1].close);
                if prev > 0.0 {
                    Some((next / prev - 1.0) * 100.0)
                } else {
                    None
                }
            })
            .collect();
        if matched.len() < 5 {
            return None;
        }
        Some(mean(&matched))
    }
}

impl SignalModule for SeasonalModule {
    fn name(&self) -> &'static str {
        "seasonal"
    }

    fn min_history(&self) -> usize {
        MIN_HISTORY
    }

    fn evaluate(&self, history: &[Candle], ctx: &SignalContext) -> Score {
        if history.len() < self.min_history() {
            return Score::insufficient_data();
        }

        let mut factors = Vec::new();
        let now = ctx.now;
        let month = now.month();
        let day = now.day();
        let weekday = now.weekday();

        // Fixed calendar effects
        if month == 1 {
            factors.push(Factor::new("january_effect", 5, "January tends to run positive"));
        }
        if month == 12 && day >= 20 {
            factors.push(Factor::new("santa_rally", 8, "late-December rally window"));
        }
        if month == 9 {
            factors.push(Factor::new("september_slump", -5, "historically the weakest month"));
        }
        if month == 10 {
            factors.push(Factor::new("october_caution", -3, "elevated crash frequency"));
        }
        match weekday {
            Weekday::Mon => {
                factors.push(Factor::new("monday_drift", -3, "Mondays skew negative"))
            }
            Weekday::Fri => factors.push(Factor::new("friday_drift", 5, "Fridays skew positive")),
            _ => {}
        }

        // This symbol's own measured tendency for the current month
        if let Some(avg) = Self::mean_return_pct(history, |c| c.timestamp.month() == month) {
            if avg.abs() >= 0.15 {
                let delta = (avg * 20.0).round() as i32;
                factors.push(Factor::new(
                    "month_history",
                    delta.clamp(-10, 10),
                    format!("this month averaged {:+.2}%/bar historically", avg),
                ));
            }
        }

        let confidence = if factors.len() >= 2 {
            Confidence::Medium
        } else {
            Confidence::Low
        };
        Score::from_factors(factors, confidence)
    }
}
