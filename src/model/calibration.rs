//! Probability calibration (Platt scaling).
//!
//! The model is `p_calibrated = sigmoid(a * logit(p_raw) + b)`.
use serde::{Deserialize, Serialize};

use crate::db::models::BetRecord;

const EPS: f64 = 1e-6;
pub const MIN_SAMPLES: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PlattCalibration {
    pub a: f64,
    pub b: f64,
}

/// Mean log loss and Brier score of one set of probabilities.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Score {
    pub logloss: f64,
    pub brier: f64,
}

impl Score {
    fn of(samples: &[(f64, f64)], prob: impl Fn(f64) -> f64) -> Score {
        let n = samples.len().max(1) as f64;
        let (ll, br) = samples.iter().fold((0.0, 0.0), |(ll, br), &(raw, y)| {
            let p = clamp_prob(prob(raw));
            (
                ll - (y * p.ln() + (1.0 - y) * (1.0 - p).ln()),
                br + (p - y).powi(2),
            )
        });
        Score {
            logloss: ll / n,
            brier: br / n,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FitResult {
    pub calibration: PlattCalibration,
    pub before: Score,
    pub after: Score,
    pub samples: usize,
    /// Gradient steps taken before convergence or the iteration cap
    pub iterations: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct FitOptions {
    pub max_iters: usize,
    pub learning_rate: f64,
    pub l2: f64,
    /// Stop once both gradient components fall below this
    pub tolerance: f64,
}

impl Default for FitOptions {
    fn default() -> Self {
        FitOptions {
            max_iters: 500,
            learning_rate: 0.2,
            l2: 1e-3,
            tolerance: 1e-7,
        }
    }
}

fn clamp_prob(p: f64) -> f64 {
    p.clamp(EPS, 1.0 - EPS)
}

pub fn logit(p: f64) -> f64 {
    let p = clamp_prob(p);
    p.ln() - (1.0 - p).ln()
}

/// Logistic function, split by sign so `exp` never overflows.
pub fn sigmoid(x: f64) -> f64 {
    let z = (-x.abs()).exp();
    if x >= 0.0 {
        1.0 / (1.0 + z)
    } else {
        z / (1.0 + z)
    }
}

impl PlattCalibration {
    pub fn apply(&self, raw_prob: f64) -> f64 {
        sigmoid(self.a * logit(raw_prob) + self.b).clamp(0.0, 1.0)
    }

    /// Mean log-loss gradient (with L2 on the slope) over pre-computed logits.
    fn gradient(&self, points: &[(f64, f64)], l2: f64) -> (f64, f64) {
        let n = points.len() as f64;
        let (ga, gb) = points.iter().fold((0.0, 0.0), |(ga, gb), &(x, y)| {
            let err = sigmoid(self.a * x + self.b) - y;
            (ga + err * x, gb + err)
        });
        (ga / n + l2 * self.a, gb / n)
    }

    /// Gradient-descent fit on `(raw probability, outcome)` pairs.
    /// Needs at least `MIN_SAMPLES` samples with both outcomes present.
    pub fn fit(samples: &[(f64, f64)], opts: FitOptions) -> Option<FitResult> {
        let positives = samples.iter().filter(|(_, y)| *y > 0.5).count();
        if samples.len() < MIN_SAMPLES || positives == 0 || positives == samples.len() {
            return None;
        }

        let points: Vec<(f64, f64)> = samples.iter().map(|&(p, y)| (logit(p), y)).collect();
        let mut model = PlattCalibration { a: 1.0, b: 0.0 };
        let mut iterations = 0;
        while iterations < opts.max_iters.max(1) {
            let (ga, gb) = model.gradient(&points, opts.l2);
            if ga.abs() < opts.tolerance && gb.abs() < opts.tolerance {
                break;
            }
            // step size decays slowly with the iteration count
            let lr = opts.learning_rate / (1.0 + 0.01 * iterations as f64);
            model.a -= lr * ga;
            model.b -= lr * gb;
            if !model.a.is_finite() || !model.b.is_finite() {
                return None;
            }
            iterations += 1;
        }

        Some(FitResult {
            calibration: model,
            before: Score::of(samples, |p| p),
            after: Score::of(samples, |p| model.apply(p)),
            samples: samples.len(),
            iterations,
        })
    }
}

/// `(win_probability_home, home won)` for every settled ledger record.
pub fn samples_from_ledger(records: &[BetRecord]) -> Vec<(f64, f64)> {
    records
        .iter()
        .filter_map(|r| {
            let winner = r.outcome().real_winner.as_deref()?;
            let home_won = if winner == r.key.home_team { 1.0 } else { 0.0 };
            Some((r.system.win_probability_home, home_won))
        })
        .collect()
}
