//! Scalar quality metrics of a ratio estimate and per-toy LLR aggregation.

use ndarray::{Array1, ArrayView1, Axis};
use thiserror::Error;

/// Scores are kept this far away from 0 and 1 inside logarithms.
const LOG_CLAMP: f64 = 1e-12;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MetricsError {
    #[error("Arrays of length {0} and {1} cannot be compared element-wise.")]
    LengthMismatch(usize, usize),
    #[error(
        "{n_events} toy events cannot be split into experiments of {events_per_toy} events each."
    )]
    ToyShape {
        n_events: usize,
        events_per_toy: usize,
    },
    #[error("Trim fraction {0} is outside [0, 1).")]
    InvalidTrimFraction(f64),
}

/// Outlier handling for the mean squared error.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Trim {
    None,
    /// Discard this fraction of the largest squared residuals.
    Fraction(f64),
    /// Discard squared residuals above `Q3 + 3 IQR` of their own distribution.
    Auto,
}

/// Linear-interpolation quantile of pre-sorted data, `p` in `[0, 1]`.
pub fn quantile_sorted(sorted: &[f64], p: f64) -> f64 {
    let n = sorted.len();
    if n == 0 {
        return f64::NAN;
    }
    let float_idx = (n as f64 - 1.0) * p.clamp(0.0, 1.0);
    let lower_idx = float_idx.floor() as usize;
    let upper_idx = (float_idx.ceil() as usize).min(n - 1);
    if lower_idx == upper_idx {
        sorted[lower_idx]
    } else {
        let fraction = float_idx - lower_idx as f64;
        sorted[lower_idx] * (1.0 - fraction) + sorted[upper_idx] * fraction
    }
}

pub fn median(values: &[f64]) -> f64 {
    let mut sorted = values.to_vec();
    sorted.sort_unstable_by(|a, b| a.total_cmp(b));
    quantile_sorted(&sorted, 0.5)
}

/// `-2 * n_expected / n_test * sum(log r_hat)`: the expected log-likelihood
/// ratio for a data set of `n_expected` events, estimated on the test sample.
pub fn expected_llr(log_r_hat: ArrayView1<f64>, n_expected_events: usize) -> f64 {
    let n_test = log_r_hat.len();
    if n_test == 0 {
        return f64::NAN;
    }
    -2.0 * n_expected_events as f64 / n_test as f64 * log_r_hat.sum()
}

/// Mean squared difference between `truth` and `prediction`, optionally
/// discarding the largest residuals.
///
/// Untrimmed, a non-finite residual makes the result non-finite. The trimmed
/// variants discard non-finite residuals before ranking the rest, and give NaN
/// when none is left.
pub fn mean_squared_error(
    truth: ArrayView1<f64>,
    prediction: ArrayView1<f64>,
    trim: Trim,
) -> Result<f64, MetricsError> {
    if truth.len() != prediction.len() {
        return Err(MetricsError::LengthMismatch(truth.len(), prediction.len()));
    }
    let mut squared: Vec<f64> = truth
        .iter()
        .zip(prediction.iter())
        .map(|(t, p)| (t - p).powi(2))
        .collect();
    if squared.is_empty() {
        return Ok(f64::NAN);
    }

    if trim != Trim::None {
        squared.retain(|v| v.is_finite());
        if squared.is_empty() {
            return Ok(f64::NAN);
        }
    }

    let kept: &[f64] = match trim {
        Trim::None => &squared,
        Trim::Fraction(fraction) => {
            if !(0.0..1.0).contains(&fraction) {
                return Err(MetricsError::InvalidTrimFraction(fraction));
            }
            squared.sort_unstable_by(|a, b| a.total_cmp(b));
            let n_keep = ((1.0 - fraction) * squared.len() as f64).ceil() as usize;
            &squared[..n_keep.clamp(1, squared.len())]
        }
        Trim::Auto => {
            squared.sort_unstable_by(|a, b| a.total_cmp(b));
            let q1 = quantile_sorted(&squared, 0.25);
            let q3 = quantile_sorted(&squared, 0.75);
            let fence = q3 + 3.0 * (q3 - q1);
            let n_keep = squared.partition_point(|&v| v <= fence);
            &squared[..n_keep.max(1)]
        }
    };

    Ok(kept.iter().sum::<f64>() / kept.len() as f64)
}

/// Mean binary cross-entropy of scores `s` against labels `y`.
pub fn cross_entropy(y: ArrayView1<f64>, s: ArrayView1<f64>) -> Result<f64, MetricsError> {
    if y.len() != s.len() {
        return Err(MetricsError::LengthMismatch(y.len(), s.len()));
    }
    if y.is_empty() {
        return Ok(f64::NAN);
    }
    let total: f64 = y
        .iter()
        .zip(s.iter())
        .map(|(&label, &score)| {
            let score = score.clamp(LOG_CLAMP, 1.0 - LOG_CLAMP);
            -(label * score.ln() + (1.0 - label) * (1.0 - score).ln())
        })
        .sum();
    Ok(total / y.len() as f64)
}

/// Per-toy log-likelihood ratio: the flat per-event `log r_hat` of a toy batch
/// is regrouped into experiments of `events_per_toy` events and summed,
/// giving `-2 * sum(log r_hat)` for each experiment.
pub fn toy_llr(log_r_hat: ArrayView1<f64>, events_per_toy: usize) -> Result<Array1<f64>, MetricsError> {
    let n_events = log_r_hat.len();
    if events_per_toy == 0 || n_events % events_per_toy != 0 {
        return Err(MetricsError::ToyShape {
            n_events,
            events_per_toy,
        });
    }
    let per_toy = log_r_hat
        .to_owned()
        .into_shape_with_order((n_events / events_per_toy, events_per_toy))
        .map_err(|_| MetricsError::ToyShape {
            n_events,
            events_per_toy,
        })?;
    Ok(per_toy.sum_axis(Axis(1)) * -2.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn expected_llr_scales_to_expected_event_count() {
        let log_r = array![0.5, -0.25, 0.25, 0.5];
        // -2 * 36 / 4 * 1.0
        assert_abs_diff_eq!(expected_llr(log_r.view(), 36), -18.0, epsilon = 1e-12);
    }

    #[test]
    fn plain_and_fraction_trimmed_mse() {
        let truth = array![0.0, 0.0, 0.0, 0.0];
        let pred = array![1.0, 1.0, 1.0, 3.0];
        let full = mean_squared_error(truth.view(), pred.view(), Trim::None).unwrap();
        assert_abs_diff_eq!(full, 3.0, epsilon = 1e-12);
        let trimmed = mean_squared_error(truth.view(), pred.view(), Trim::Fraction(0.25)).unwrap();
        assert_abs_diff_eq!(trimmed, 1.0, epsilon = 1e-12);
    }

    #[test]
    fn auto_trim_drops_gross_outliers_only() {
        let truth = Array1::zeros(20);
        let mut pred = Array1::from_iter((0..20).map(|i| 0.1 * (i % 5) as f64));
        let clean = mean_squared_error(truth.view(), pred.view(), Trim::Auto).unwrap();
        let full = mean_squared_error(truth.view(), pred.view(), Trim::None).unwrap();
        assert_abs_diff_eq!(clean, full, epsilon = 1e-12);

        pred[7] = 100.0;
        let robust = mean_squared_error(truth.view(), pred.view(), Trim::Auto).unwrap();
        assert!(robust < 1.0, "outlier survived the trim: {robust}");
    }

    #[test]
    fn trimmed_mse_skips_non_finite_residuals() {
        let truth = Array1::zeros(8);
        let mut pred = Array1::from_elem(8, 0.5);
        pred[2] = f64::NAN;
        pred[5] = f64::INFINITY;

        assert!(mean_squared_error(truth.view(), pred.view(), Trim::None).unwrap().is_nan());
        for trim in [Trim::Auto, Trim::Fraction(0.0)] {
            let mse = mean_squared_error(truth.view(), pred.view(), trim).unwrap();
            assert_abs_diff_eq!(mse, 0.25, epsilon = 1e-12);
        }

        let all_bad = array![f64::NAN, f64::NAN];
        let zeros = array![0.0, 0.0];
        let mse = mean_squared_error(zeros.view(), all_bad.view(), Trim::Auto).unwrap();
        assert!(mse.is_nan());
    }

    #[test]
    fn cross_entropy_is_finite_at_saturated_scores() {
        let y = array![1.0, 0.0];
        let s = array![0.0, 1.0];
        let ce = cross_entropy(y.view(), s.view()).unwrap();
        assert!(ce.is_finite());
        assert!(ce > 20.0);

        let perfect = cross_entropy(y.view(), array![1.0, 0.0].view()).unwrap();
        assert!(perfect < 1e-9);
    }

    #[test]
    fn toy_llr_has_one_entry_per_experiment() {
        for n_toys in 1..5 {
            let log_r = Array1::from_elem(n_toys * 3, 0.5);
            let llr = toy_llr(log_r.view(), 3).unwrap();
            assert_eq!(llr.len(), n_toys);
            assert!(llr.iter().all(|&v| (v + 3.0).abs() < 1e-12));
        }
        assert!(matches!(
            toy_llr(array![1.0, 2.0, 3.0].view(), 2),
            Err(MetricsError::ToyShape { .. })
        ));
    }

    #[test]
    fn quantiles_interpolate_linearly() {
        let data = [1.0, 2.0, 3.0, 4.0];
        assert_eq!(quantile_sorted(&data, 0.0), 1.0);
        assert_eq!(quantile_sorted(&data, 1.0), 4.0);
        assert_abs_diff_eq!(quantile_sorted(&data, 0.5), 2.5, epsilon = 1e-12);
        assert_abs_diff_eq!(median(&[3.0, 1.0, 2.0]), 2.0, epsilon = 1e-12);
    }
}
