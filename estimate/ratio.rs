//! # Density Ratio Estimators
//!
//! Every estimator answers the same question: what is `log r(x)`, the log of
//! the density of hypothesis `theta_t` over the density of the reference
//! hypothesis, at each event `x`?
//!
//! Classification-based estimators (histogram, classifier, calibrated
//! classifier) produce a score `s` for the reference class (label 1) first. The
//! ratio follows from Bayes' rule on balanced classes as `r = (1 - s) / s`,
//! evaluated through [`r_from_s`], which keeps `s = 0` and `s = 1` away from
//! the poles of the logarithm. Every caller converts scores through that
//! function.
//!
//! The regression estimator predicts `log r` directly and has no score.

use crate::estimate::histogram::{HistogramError, HistogramRatio};
use crate::estimate::isotonic::{CalibrationError, IsotonicCalibrator};
use crate::estimate::network::{ScorerError, TrainableScorer, TrainingReport};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis, concatenate};
use thiserror::Error;

/// Guard added to numerator and denominator of `(1 - s) / s`, and lower
/// bound of the resulting ratio.
pub const SCORE_EPSILON: f64 = 1e-6;

/// Likelihood ratio from a reference-class score. NaN passes through.
pub fn r_from_s(s: f64) -> f64 {
    if s.is_nan() {
        return f64::NAN;
    }
    ((1.0 - s + SCORE_EPSILON) / (s + SCORE_EPSILON)).max(SCORE_EPSILON)
}

pub fn log_r_from_s(scores: ArrayView1<f64>) -> Array1<f64> {
    scores.mapv(|s| r_from_s(s).ln())
}

#[derive(Error, Debug)]
pub enum RatioError {
    #[error("Histogram estimator failed: {0}")]
    Histogram(#[from] HistogramError),
    #[error("Scorer failed: {0}")]
    Scorer(#[from] ScorerError),
    #[error("Calibration failed: {0}")]
    Calibration(#[from] CalibrationError),
    #[error(
        "The log-ratio training target is not finite at row {row}. The regression estimator needs strictly positive, finite training ratios."
    )]
    NonFiniteTarget { row: usize },
    #[error("{what}: expected {expected} entries, found {found}.")]
    LengthMismatch {
        what: &'static str,
        expected: usize,
        found: usize,
    },
    #[error("The estimator has no class score, so it cannot be calibrated.")]
    NoScore,
}

/// A fitted estimator, evaluated on transformed features.
pub trait RatioEstimator {
    /// Reference-class score `s` of every event, if the estimator has one.
    fn score(&self, x: ArrayView2<f64>) -> Result<Option<Array1<f64>>, RatioError>;

    /// Estimated `log r` of every event.
    fn log_ratio(&self, x: ArrayView2<f64>) -> Result<Array1<f64>, RatioError> {
        match self.score(x)? {
            Some(s) => Ok(log_r_from_s(s.view())),
            None => Err(RatioError::NoScore),
        }
    }
}

impl RatioEstimator for HistogramRatio {
    fn score(&self, x: ArrayView2<f64>) -> Result<Option<Array1<f64>>, RatioError> {
        Ok(Some(self.predict(x)?))
    }
}

/// Likelihood-ratio trick: a classifier trained to separate events of
/// `theta_t` (label 0) from events of the reference hypothesis (label 1).
#[derive(Debug, Clone)]
pub struct ClassifierRatio<S> {
    scorer: S,
}

impl<S: TrainableScorer> ClassifierRatio<S> {
    pub fn fit(
        mut scorer: S,
        x: ArrayView2<f64>,
        y: ArrayView1<f64>,
        weights: Option<ArrayView1<f64>>,
    ) -> Result<(Self, TrainingReport), RatioError> {
        let report = scorer.fit(x, y, weights)?;
        Ok((Self { scorer }, report))
    }
}

impl<S: TrainableScorer> RatioEstimator for ClassifierRatio<S> {
    fn score(&self, x: ArrayView2<f64>) -> Result<Option<Array1<f64>>, RatioError> {
        Ok(Some(self.scorer.predict(x)?))
    }
}

/// Classifier whose scores are passed through an isotonic map fit on a
/// calibration mixture before being turned into ratios.
pub struct CalibratedClassifierRatio {
    base: Box<dyn RatioEstimator>,
    calibrator: IsotonicCalibrator,
}

impl CalibratedClassifierRatio {
    /// Fits the calibration map of an already trained estimator. The mixture's
    /// features must be transformed the same way as the training sample.
    pub fn fit(
        base: Box<dyn RatioEstimator>,
        mixture: &CalibrationMixture,
    ) -> Result<Self, RatioError> {
        let raw = base.score(mixture.x.view())?.ok_or(RatioError::NoScore)?;
        let calibrator =
            IsotonicCalibrator::fit(raw.view(), mixture.y.view(), Some(mixture.weights.view()))?;
        Ok(Self { base, calibrator })
    }

    /// The uncalibrated estimator.
    pub fn base(&self) -> &dyn RatioEstimator {
        self.base.as_ref()
    }

    pub fn calibrator(&self) -> &IsotonicCalibrator {
        &self.calibrator
    }
}

impl RatioEstimator for CalibratedClassifierRatio {
    fn score(&self, x: ArrayView2<f64>) -> Result<Option<Array1<f64>>, RatioError> {
        let raw = self.base.score(x)?.ok_or(RatioError::NoScore)?;
        Ok(Some(self.calibrator.transform(raw.view())))
    }
}

/// Direct regression of `log r` on the features.
#[derive(Debug, Clone)]
pub struct RegressionRatio<S> {
    scorer: S,
}

impl<S: TrainableScorer> RegressionRatio<S> {
    /// Training targets must be finite; this is checked before any fitting.
    pub fn fit(
        mut scorer: S,
        x: ArrayView2<f64>,
        log_r: ArrayView1<f64>,
    ) -> Result<(Self, TrainingReport), RatioError> {
        if let Some(row) = log_r.iter().position(|v| !v.is_finite()) {
            return Err(RatioError::NonFiniteTarget { row });
        }
        let report = scorer.fit(x, log_r, None)?;
        Ok((Self { scorer }, report))
    }
}

impl<S: TrainableScorer> RatioEstimator for RegressionRatio<S> {
    fn score(&self, _x: ArrayView2<f64>) -> Result<Option<Array1<f64>>, RatioError> {
        Ok(None)
    }

    /// Non-finite predictions are reported and returned unchanged.
    fn log_ratio(&self, x: ArrayView2<f64>) -> Result<Array1<f64>, RatioError> {
        let log_r = self.scorer.predict(x)?;
        let n_bad = log_r.iter().filter(|v| !v.is_finite()).count();
        if n_bad > 0 {
            log::warn!(
                "Regression produced {n_bad} non-finite log r predictions out of {}",
                log_r.len()
            );
        }
        Ok(log_r)
    }
}

/// Two-hypothesis sample the isotonic map is fit on.
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationMixture {
    pub x: Array2<f64>,
    pub y: Array1<f64>,
    pub weights: Array1<f64>,
}

/// Stacks the calibration sample twice: the first copy is labelled 0 and
/// weighted by the sample's weights under `theta_t`, the second is labelled 1
/// and weighted by its weights under the reference hypothesis.
pub fn build_calibration_mixture<'a>(
    x: ArrayView2<f64>,
    weights_hypothesis: ArrayView1<'a, f64>,
    weights_reference: ArrayView1<'a, f64>,
) -> Result<CalibrationMixture, RatioError> {
    let n = x.nrows();
    for (what, w) in [
        ("hypothesis weights", weights_hypothesis),
        ("reference weights", weights_reference),
    ] {
        if w.len() != n {
            return Err(RatioError::LengthMismatch {
                what,
                expected: n,
                found: w.len(),
            });
        }
    }

    let stacked = concatenate![Axis(0), x, x];
    let mut labels = Array1::<f64>::zeros(2 * n);
    labels.slice_mut(ndarray::s![n..]).fill(1.0);
    let weights = concatenate![Axis(0), weights_hypothesis, weights_reference];

    Ok(CalibrationMixture {
        x: stacked,
        y: labels,
        weights,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    /// Scorer that returns the first feature clamped to [0, 1].
    #[derive(Debug, Clone, Default)]
    struct IdentityScorer {
        fitted: bool,
    }

    impl TrainableScorer for IdentityScorer {
        fn fit(
            &mut self,
            _x: ArrayView2<f64>,
            _y: ArrayView1<f64>,
            _weights: Option<ArrayView1<f64>>,
        ) -> Result<TrainingReport, ScorerError> {
            self.fitted = true;
            Ok(TrainingReport {
                epochs_run: 0,
                final_training_loss: 0.0,
                best_validation_loss: None,
                stopped_early: false,
            })
        }

        fn predict(&self, x: ArrayView2<f64>) -> Result<Array1<f64>, ScorerError> {
            if !self.fitted {
                return Err(ScorerError::NotFitted);
            }
            Ok(x.column(0).mapv(|v| v.clamp(0.0, 1.0)))
        }
    }

    #[test]
    fn r_from_s_is_guarded_at_the_boundaries() {
        assert_abs_diff_eq!(r_from_s(0.5), 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(r_from_s(0.2), 4.0, epsilon = 1e-4);
        assert!(r_from_s(0.0).is_finite());
        assert!(r_from_s(1.0) >= SCORE_EPSILON);
        assert!(r_from_s(1.0).ln().is_finite());
        assert!(r_from_s(f64::NAN).is_nan());
    }

    #[test]
    fn calibration_mixture_layout() {
        let x = array![[1.0, 2.0], [3.0, 4.0], [5.0, 6.0]];
        let wt = array![0.1, 0.2, 0.3];
        let wr = array![0.7, 0.8, 0.9];
        let mixture = build_calibration_mixture(x.view(), wt.view(), wr.view()).unwrap();

        assert_eq!(mixture.x.nrows(), 6);
        assert_eq!(mixture.x.slice(ndarray::s![..3, ..]), x);
        assert_eq!(mixture.x.slice(ndarray::s![3.., ..]), x);
        assert_eq!(mixture.y, array![0.0, 0.0, 0.0, 1.0, 1.0, 1.0]);
        assert_eq!(mixture.weights, array![0.1, 0.2, 0.3, 0.7, 0.8, 0.9]);

        let err = build_calibration_mixture(x.view(), wt.view(), array![1.0].view()).unwrap_err();
        assert!(matches!(err, RatioError::LengthMismatch { found: 1, .. }));
    }

    #[test]
    fn classifier_ratio_converts_scores() {
        let x = array![[0.5], [0.2]];
        let (ratio, _) =
            ClassifierRatio::fit(IdentityScorer::default(), x.view(), array![0.0, 1.0].view(), None)
                .unwrap();
        let log_r = ratio.log_ratio(x.view()).unwrap();
        assert_abs_diff_eq!(log_r[0], 0.0, epsilon = 1e-9);
        assert_abs_diff_eq!(log_r[1], 4.0f64.ln(), epsilon = 1e-4);
    }

    #[test]
    fn calibration_corrects_a_distorted_score() {
        // Raw scores 0.1 and 0.9 are overconfident: the mixture weights put
        // the reference fraction at 0.25 and 0.75.
        let x = array![[0.1], [0.9]];
        let (base, _) =
            ClassifierRatio::fit(IdentityScorer::default(), x.view(), array![0.0, 1.0].view(), None)
                .unwrap();
        let mixture = build_calibration_mixture(
            x.view(),
            array![3.0, 1.0].view(),
            array![1.0, 3.0].view(),
        )
        .unwrap();
        let calibrated = CalibratedClassifierRatio::fit(Box::new(base), &mixture).unwrap();

        let s = calibrated.score(x.view()).unwrap().unwrap();
        assert_abs_diff_eq!(s[0], 0.25, epsilon = 1e-12);
        assert_abs_diff_eq!(s[1], 0.75, epsilon = 1e-12);
        let raw = calibrated.base().score(x.view()).unwrap().unwrap();
        assert_eq!(raw, array![0.1, 0.9]);
    }

    #[test]
    fn regression_rejects_non_finite_targets_but_not_predictions() {
        let x = array![[0.1], [0.2]];
        let err = RegressionRatio::fit(
            IdentityScorer::default(),
            x.view(),
            array![0.0, f64::NEG_INFINITY].view(),
        )
        .unwrap_err();
        assert!(matches!(err, RatioError::NonFiniteTarget { row: 1 }));

        let (ratio, _) =
            RegressionRatio::fit(IdentityScorer::default(), x.view(), array![0.0, 0.5].view())
                .unwrap();
        assert!(ratio.score(x.view()).unwrap().is_none());
        assert_eq!(ratio.log_ratio(x.view()).unwrap(), array![0.1, 0.2]);
    }
}
