//! Which Neyman toy combinations are worth scoring.
//!
//! Scoring every toy batch against every trained hypothesis costs
//! `O(n_thetas^2)` batch evaluations. Only combinations that can matter for
//! the confidence interval are kept: anything involving the observed
//! hypothesis, the diagonal, and pairs of nearby hypotheses.

use crate::shared::settings::{Settings, SettingsError};
use ndarray::Array2;

#[derive(Debug, Clone)]
pub struct ToySelection {
    thetas: Array2<f64>,
    observed: usize,
    radius: f64,
}

impl ToySelection {
    pub fn new(thetas: Array2<f64>, observed: usize, radius: f64) -> Self {
        Self {
            thetas,
            observed,
            radius,
        }
    }

    pub fn from_settings(settings: &Settings) -> Result<Self, SettingsError> {
        Ok(Self::new(
            settings.theta_matrix()?,
            settings.theta_observed,
            settings.toy_evaluation_radius,
        ))
    }

    /// Whether toys generated under `tt` are scored by the estimator trained
    /// for `t`. Symmetric in its arguments and free of state.
    pub fn decide_toy_evaluation(&self, tt: usize, t: usize) -> bool {
        if tt == self.observed || t == self.observed || tt == t {
            return true;
        }
        if tt >= self.thetas.nrows() || t >= self.thetas.nrows() {
            return false;
        }
        let (a, b) = (self.thetas.row(tt), self.thetas.row(t));
        let distance_squared: f64 = a.iter().zip(b.iter()).map(|(x, y)| (x - y).powi(2)).sum();
        distance_squared <= self.radius * self.radius
    }

    /// Number of `tt` selected for the estimator trained at `t`.
    pub fn n_selected(&self, t: usize) -> usize {
        (0..self.thetas.nrows())
            .filter(|&tt| self.decide_toy_evaluation(tt, t))
            .count()
    }
}
