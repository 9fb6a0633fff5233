//! Weighted isotonic calibration of classifier scores.
//!
//! The map is fit with the pool-adjacent-violators algorithm on
//! `(raw score, label, weight)` triples and evaluated by linear interpolation
//! between block end points. Inputs below the lowest or above the highest
//! fitted score are clipped to the boundary values.

use ndarray::{Array1, ArrayView1};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CalibrationError {
    #[error("Scores ({scores}), targets ({targets}) and weights ({weights}) have different lengths.")]
    LengthMismatch {
        scores: usize,
        targets: usize,
        weights: usize,
    },
    #[error("The calibration sample is empty or has zero total weight.")]
    EmptySample,
    #[error("Non-finite {0} in the calibration sample.")]
    NonFinite(&'static str),
    #[error("Negative calibration weight {0}.")]
    NegativeWeight(f64),
}

/// Fitted monotone non-decreasing map from raw score to probability.
#[derive(Debug, Clone, PartialEq)]
pub struct IsotonicCalibrator {
    /// Sorted raw-score knots.
    thresholds: Vec<f64>,
    /// Calibrated value at each knot, non-decreasing, within `[0, 1]`.
    values: Vec<f64>,
}

#[derive(Debug, Clone, Copy)]
struct Block {
    x_min: f64,
    x_max: f64,
    weighted_sum: f64,
    weight: f64,
}

impl Block {
    fn mean(&self) -> f64 {
        self.weighted_sum / self.weight
    }
}

impl IsotonicCalibrator {
    pub fn fit(
        scores: ArrayView1<f64>,
        targets: ArrayView1<f64>,
        weights: Option<ArrayView1<f64>>,
    ) -> Result<Self, CalibrationError> {
        let n = scores.len();
        let n_weights = weights.map_or(n, |w| w.len());
        if targets.len() != n || n_weights != n {
            return Err(CalibrationError::LengthMismatch {
                scores: n,
                targets: targets.len(),
                weights: n_weights,
            });
        }
        if scores.iter().any(|v| !v.is_finite()) {
            return Err(CalibrationError::NonFinite("score"));
        }
        if targets.iter().any(|v| !v.is_finite()) {
            return Err(CalibrationError::NonFinite("target"));
        }

        let mut triples: Vec<(f64, f64, f64)> = Vec::with_capacity(n);
        for i in 0..n {
            let w = weights.map_or(1.0, |w| w[i]);
            if !w.is_finite() {
                return Err(CalibrationError::NonFinite("weight"));
            }
            if w < 0.0 {
                return Err(CalibrationError::NegativeWeight(w));
            }
            if w > 0.0 {
                triples.push((scores[i], targets[i], w));
            }
        }
        if triples.is_empty() {
            return Err(CalibrationError::EmptySample);
        }
        triples.sort_by(|a, b| a.0.total_cmp(&b.0));

        // Equal scores collapse into one point before any pooling.
        let mut points: Vec<Block> = Vec::with_capacity(triples.len());
        for (x, y, w) in triples {
            match points.last_mut() {
                Some(last) if last.x_max == x => {
                    last.weighted_sum += w * y;
                    last.weight += w;
                }
                _ => points.push(Block {
                    x_min: x,
                    x_max: x,
                    weighted_sum: w * y,
                    weight: w,
                }),
            }
        }

        // Pool adjacent violators on the unique points.
        let mut blocks: Vec<Block> = Vec::with_capacity(points.len());
        for mut current in points {
            while let Some(last) = blocks.last() {
                if last.mean() < current.mean() {
                    break;
                }
                current = Block {
                    x_min: last.x_min,
                    x_max: current.x_max,
                    weighted_sum: last.weighted_sum + current.weighted_sum,
                    weight: last.weight + current.weight,
                };
                blocks.pop();
            }
            blocks.push(current);
        }

        let mut thresholds = Vec::with_capacity(2 * blocks.len());
        let mut values = Vec::with_capacity(2 * blocks.len());
        for block in &blocks {
            let value = block.mean().clamp(0.0, 1.0);
            thresholds.push(block.x_min);
            values.push(value);
            if block.x_max > block.x_min {
                thresholds.push(block.x_max);
                values.push(value);
            }
        }

        Ok(Self { thresholds, values })
    }

    /// Calibrated value of one raw score. Non-finite scores pass through as NaN.
    pub fn transform_one(&self, score: f64) -> f64 {
        if score.is_nan() {
            return f64::NAN;
        }
        let last = self.thresholds.len() - 1;
        if score <= self.thresholds[0] {
            return self.values[0];
        }
        if score >= self.thresholds[last] {
            return self.values[last];
        }
        let upper = self.thresholds.partition_point(|&t| t <= score);
        let (x0, x1) = (self.thresholds[upper - 1], self.thresholds[upper]);
        let (y0, y1) = (self.values[upper - 1], self.values[upper]);
        y0 + (y1 - y0) * (score - x0) / (x1 - x0)
    }

    pub fn transform(&self, scores: ArrayView1<f64>) -> Array1<f64> {
        scores.mapv(|s| self.transform_one(s))
    }

    pub fn knots(&self) -> (&[f64], &[f64]) {
        (&self.thresholds, &self.values)
    }
}
