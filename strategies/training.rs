//! # Per-Hypothesis Training Loop
//!
//! For every training hypothesis `t`, in order:
//!
//! 1. load the `t`-specific training sample;
//! 2. let the strategy's [`EstimatorFactory`] fit a feature transform and an
//!    estimator on it (plus a calibration map where the strategy has one);
//! 3. score the shared test sample with every series of the estimator (raw,
//!    and calibrated where present) and record the metrics;
//! 4. store per-event ratios at the benchmark hypotheses;
//! 5. hand the fitted estimator to the Neyman evaluator, if any;
//! 6. drop the estimator before moving on.
//!
//! The shared samples (test, illustration, calibration) are loaded once by the
//! caller and never modified. Only one fitted estimator is alive at a time.

use crate::estimate::features::FeatureTransform;
use crate::estimate::metrics::{self, Trim};
use crate::estimate::ratio::{CalibratedClassifierRatio, RatioEstimator};
use crate::shared::settings::{Settings, format_theta};
use crate::shared::store::{ResultKey, ResultSink, SampleKey, SampleRole, SampleStore};
use crate::strategies::PipelineError;
use crate::strategies::interpolate::LinearInterpolator;
use crate::strategies::neyman::NeymanEvaluator;
use ndarray::{Array1, Array2, ArrayView2};
use std::time::Instant;

/// One estimator output tracked as its own metric series.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Series {
    Raw,
    Calibrated,
}

impl Series {
    /// Infix in output names.
    pub fn infix(self) -> &'static str {
        match self {
            Self::Raw => "",
            Self::Calibrated => "_calibrated",
        }
    }
}

/// Training sample of one hypothesis, before any transform.
#[derive(Debug, Clone)]
pub struct TrainingSample {
    pub x: Array2<f64>,
    /// Class labels: 0 for `theta_t`, 1 for the reference hypothesis.
    pub y: Option<Array1<f64>>,
    /// `log r` of every event, when the true ratio is known.
    pub log_r: Option<Array1<f64>>,
}

/// Calibration sample with per-hypothesis event weights.
#[derive(Debug, Clone)]
pub struct CalibrationData {
    pub x: Array2<f64>,
    /// One row per hypothesis.
    pub weights: Array2<f64>,
    /// Reference hypothesis of this run.
    pub reference: usize,
}

/// Samples shared by every hypothesis of a run.
#[derive(Debug, Clone)]
pub struct SharedSamples {
    pub x_test: Array2<f64>,
    /// True `log r` of the test sample, one row per hypothesis.
    pub log_r_test: Array2<f64>,
    pub x_illustration: Option<Array2<f64>>,
    pub calibration: Option<CalibrationData>,
}

impl SharedSamples {
    /// Loads the test sample, its true ratios, and the illustration and
    /// calibration samples if requested and present.
    pub fn load<S: SampleStore + ?Sized>(
        store: &S,
        template: &SampleKey,
        n_thetas: usize,
        calibration_reference: Option<usize>,
    ) -> Result<Self, PipelineError> {
        let key = |role| with_role(template, role);

        let x_test = store.load(&key(SampleRole::TestFeatures))?;
        let r_test = store.load(&key(SampleRole::TestRatios))?;
        if r_test.nrows() != n_thetas {
            return Err(PipelineError::ShapeMismatch {
                what: "hypotheses in the true test ratios".to_string(),
                expected: n_thetas,
                found: r_test.nrows(),
            });
        }
        if r_test.ncols() != x_test.nrows() {
            return Err(PipelineError::ShapeMismatch {
                what: "events in the true test ratios".to_string(),
                expected: x_test.nrows(),
                found: r_test.ncols(),
            });
        }

        let illustration_key = key(SampleRole::IllustrationFeatures);
        let x_illustration = if store.contains(&illustration_key) {
            Some(store.load(&illustration_key)?)
        } else {
            log::info!("No illustration sample found, skipping illustration ratios");
            None
        };

        let calibration = match calibration_reference {
            Some(reference) => {
                let x = store.load(&key(SampleRole::CalibrationFeatures))?;
                let weights = store.load(&key(SampleRole::CalibrationWeights))?;
                if weights.nrows() != n_thetas || weights.ncols() != x.nrows() {
                    return Err(PipelineError::ShapeMismatch {
                        what: format!(
                            "calibration weights of shape {:?} for {} events",
                            weights.shape(),
                            x.nrows()
                        ),
                        expected: n_thetas,
                        found: weights.nrows(),
                    });
                }
                Some(CalibrationData {
                    x,
                    weights,
                    reference,
                })
            }
            None => None,
        };

        Ok(Self {
            x_test,
            log_r_test: r_test.mapv(f64::ln),
            x_illustration,
            calibration,
        })
    }
}

fn with_role(template: &SampleKey, role: SampleRole) -> SampleKey {
    SampleKey {
        role,
        ..template.clone()
    }
}

/// A fitted estimator in one of its two shapes.
pub enum FittedEstimator {
    Single(Box<dyn RatioEstimator>),
    Calibrated(CalibratedClassifierRatio),
}

impl FittedEstimator {
    /// Every series this estimator contributes, raw first.
    pub fn series(&self) -> Vec<(Series, &dyn RatioEstimator)> {
        match self {
            Self::Single(estimator) => vec![(Series::Raw, estimator.as_ref())],
            Self::Calibrated(calibrated) => vec![
                (Series::Raw, calibrated.base()),
                (Series::Calibrated, calibrated as &dyn RatioEstimator),
            ],
        }
    }
}

/// Estimator and transform for one hypothesis.
pub struct Fitted {
    pub transform: FeatureTransform,
    pub estimator: FittedEstimator,
}

/// Strategy-specific fitting step.
pub trait EstimatorFactory {
    fn fit(
        &mut self,
        hypothesis: usize,
        sample: &TrainingSample,
        calibration: Option<&CalibrationData>,
    ) -> Result<Fitted, PipelineError>;
}

/// Naming of every output of a run.
#[derive(Debug, Clone)]
pub struct OutputNaming {
    /// Strategy directory, `histo` or `point_by_point`.
    pub strategy: &'static str,
    pub algorithm: String,
    /// Configuration suffix, e.g. `_2d_finebinning_smeared`.
    pub suffix: String,
}

impl OutputNaming {
    pub fn result(&self, metric: &str, series: Series) -> ResultKey {
        ResultKey::result(
            self.strategy,
            format!("{metric}_{}{}{}", self.algorithm, series.infix(), self.suffix),
        )
    }

    /// `kind` is `distribution` or `observed`.
    pub fn neyman(&self, set: &str, kind: &str, series: Series, hypothesis: usize) -> ResultKey {
        ResultKey::neyman(
            self.strategy,
            format!(
                "{set}_llr_{kind}_{}{}_{hypothesis}{}",
                self.algorithm,
                series.infix(),
                self.suffix
            ),
        )
    }
}

/// Metric values of one series, in training-hypothesis order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricSeries {
    pub llr: Vec<f64>,
    pub mse_logr: Vec<f64>,
    pub trimmed_mse_logr: Vec<f64>,
    pub mse_logr_train: Vec<f64>,
    pub cross_entropy_train: Vec<f64>,
}

impl MetricSeries {
    fn named(&self) -> [(&'static str, &Vec<f64>); 5] {
        [
            ("llr", &self.llr),
            ("mse_logr", &self.mse_logr),
            ("trimmed_mse_logr", &self.trimmed_mse_logr),
            ("mse_logr_train", &self.mse_logr_train),
            ("cross_entropy_train", &self.cross_entropy_train),
        ]
    }
}

/// Fixed inputs of a training loop.
pub struct LoopConfig<'a> {
    pub settings: &'a Settings,
    /// Full hypothesis grid, one row per hypothesis.
    pub thetas: ArrayView2<'a, f64>,
    pub training_thetas: &'a [usize],
    pub naming: &'a OutputNaming,
    /// Smearing, variant suffix and sample-set flags for every sample key.
    pub sample_template: &'a SampleKey,
}

#[derive(Debug, Clone, Default)]
pub struct TrainingOutcome {
    pub metrics: Vec<(Series, MetricSeries)>,
    /// Seconds spent scoring the test sample, one entry per hypothesis.
    pub evaluation_seconds: Vec<f64>,
}

impl TrainingOutcome {
    fn series_mut(&mut self, series: Series) -> &mut MetricSeries {
        let position = match self.metrics.iter().position(|(s, _)| *s == series) {
            Some(position) => position,
            None => {
                self.metrics.push((series, MetricSeries::default()));
                self.metrics.len() - 1
            }
        };
        &mut self.metrics[position].1
    }

    pub fn series(&self, series: Series) -> Option<&MetricSeries> {
        self.metrics.iter().find(|(s, _)| *s == series).map(|(_, m)| m)
    }
}

/// Loads the training sample of hypothesis `t`. Labels and true ratios are
/// read when present.
pub fn load_training_sample<S: SampleStore + ?Sized>(
    store: &S,
    template: &SampleKey,
    hypothesis: usize,
) -> Result<TrainingSample, PipelineError> {
    let key = |role| with_role(template, role).hypothesis(hypothesis);

    let x = store.load(&key(SampleRole::TrainFeatures))?;
    let y_key = key(SampleRole::TrainLabels);
    let y = if store.contains(&y_key) {
        Some(store.load_vector(&y_key)?)
    } else {
        None
    };
    let r_key = key(SampleRole::TrainRatios);
    let log_r = if store.contains(&r_key) {
        Some(store.load_vector(&r_key)?.mapv(f64::ln))
    } else {
        None
    };

    for (what, len) in [
        ("labels", y.as_ref().map(|v| v.len())),
        ("ratios", log_r.as_ref().map(|v| v.len())),
    ] {
        if let Some(len) = len {
            if len != x.nrows() {
                return Err(PipelineError::ShapeMismatch {
                    what: format!("training {what} for hypothesis {hypothesis}"),
                    expected: x.nrows(),
                    found: len,
                });
            }
        }
    }

    Ok(TrainingSample { x, y, log_r })
}

/// Runs the loop over `config.training_thetas`.
pub fn run_training_loop<S: SampleStore + ResultSink>(
    store: &mut S,
    factory: &mut dyn EstimatorFactory,
    config: &LoopConfig<'_>,
    shared: &SharedSamples,
    neyman: Option<&NeymanEvaluator>,
) -> Result<TrainingOutcome, PipelineError> {
    let settings = config.settings;
    let naming = config.naming;
    let n_training = config.training_thetas.len();
    let mut outcome = TrainingOutcome::default();

    for (i, &t) in config.training_thetas.iter().enumerate() {
        log::info!(
            "Starting theta {}/{}: number {} ({})",
            i + 1,
            n_training,
            t,
            format_theta(config.thetas.row(t))
        );

        let sample = load_training_sample(&*store, config.sample_template, t)?;
        let fitted = factory.fit(t, &sample, shared.calibration.as_ref())?;

        let x_test = fitted.transform.apply(shared.x_test.view(), "test")?;
        let x_train = fitted.transform.apply(sample.x.view(), "train")?;
        let log_r_true = shared.log_r_test.row(t);

        for (series, estimator) in fitted.estimator.series() {
            let started = Instant::now();
            let log_r_hat = estimator.log_ratio(x_test.view())?;
            if series == Series::Raw {
                outcome.evaluation_seconds.push(started.elapsed().as_secs_f64());
            }

            let n_bad = log_r_hat.iter().filter(|v| !v.is_finite()).count();
            if n_bad > 0 {
                log::warn!(
                    "{} of {} test log ratios are not finite for theta {} ({})",
                    n_bad,
                    log_r_hat.len(),
                    t,
                    series.infix()
                );
            }

            let mse_logr_train = match &sample.log_r {
                Some(log_r_train) => {
                    let log_r_hat_train = estimator.log_ratio(x_train.view())?;
                    metrics::mean_squared_error(
                        log_r_train.view(),
                        log_r_hat_train.view(),
                        Trim::None,
                    )?
                }
                None => f64::NAN,
            };
            let cross_entropy_train = match (&sample.y, estimator.score(x_train.view())?) {
                (Some(y), Some(s)) => metrics::cross_entropy(y.view(), s.view())?,
                _ => f64::NAN,
            };

            let entry = outcome.series_mut(series);
            entry
                .llr
                .push(metrics::expected_llr(log_r_hat.view(), settings.n_expected_events));
            entry.mse_logr.push(metrics::mean_squared_error(
                log_r_true,
                log_r_hat.view(),
                Trim::None,
            )?);
            entry.trimmed_mse_logr.push(metrics::mean_squared_error(
                log_r_true,
                log_r_hat.view(),
                Trim::Auto,
            )?);
            entry.mse_logr_train.push(mse_logr_train);
            entry.cross_entropy_train.push(cross_entropy_train);

            let benchmark = if t == settings.theta_benchmark_trained {
                Some("trained")
            } else if t == settings.theta_benchmark_nottrained {
                Some("nottrained")
            } else {
                None
            };
            if let Some(label) = benchmark {
                let r_hat = log_r_hat.mapv(f64::exp);
                store.put_vector(&naming.result(&format!("r_{label}"), series), r_hat.view())?;
            }

            if t == settings.theta_benchmark_illustration {
                if let Some(x_illustration) = &shared.x_illustration {
                    let x = fitted.transform.apply(x_illustration.view(), "illustration")?;
                    let r_hat = estimator.log_ratio(x.view())?.mapv(f64::exp);
                    store.put_vector(&naming.result("r_illustration", series), r_hat.view())?;
                }
            }
        }

        if let (FittedEstimator::Calibrated(calibrated), Some(calibration)) =
            (&fitted.estimator, &shared.calibration)
        {
            for (label, benchmark) in [
                ("trained", settings.theta_benchmark_trained),
                ("nottrained", settings.theta_benchmark_nottrained),
            ] {
                if t != benchmark {
                    continue;
                }
                let x = fitted.transform.apply(calibration.x.view(), "calibration")?;
                if let Some(raw) = calibrated.base().score(x.view())? {
                    store.put_vector(
                        &naming.result(&format!("calvalues_{label}"), Series::Raw),
                        raw.view(),
                    )?;
                }
            }
        }

        if let Some(evaluator) = neyman {
            evaluator.evaluate(store, t, &fitted)?;
        }
    }

    if !outcome.evaluation_seconds.is_empty() {
        let mean = outcome.evaluation_seconds.iter().sum::<f64>()
            / outcome.evaluation_seconds.len() as f64;
        log::info!(
            "Evaluation timing: median {:.6} s, mean {:.6} s",
            metrics::median(&outcome.evaluation_seconds),
            mean
        );
    }

    Ok(outcome)
}

/// Stores every metric series that has at least one finite value.
///
/// When the training hypotheses cover the whole grid the metrics are stored as
/// they are. Otherwise the expected LLR is interpolated to the full grid and
/// the remaining metrics are stored at the training hypotheses only.
pub fn persist_metrics<S: ResultSink + ?Sized>(
    sink: &mut S,
    config: &LoopConfig<'_>,
    outcome: &TrainingOutcome,
) -> Result<(), PipelineError> {
    let n_thetas = config.thetas.nrows();
    let full_grid = config.training_thetas.len() == n_thetas
        && config.training_thetas.iter().enumerate().all(|(i, &t)| i == t);

    let interpolator = if full_grid {
        None
    } else {
        log::info!("Starting interpolation");
        let points = config.thetas.select(ndarray::Axis(0), config.training_thetas);
        Some(LinearInterpolator::new(points.view())?)
    };

    for (series, metrics) in &outcome.metrics {
        for (name, values) in metrics.named() {
            if values.iter().all(|v| v.is_nan()) {
                continue;
            }
            let values = Array1::from_vec(values.clone());
            let stored = match (&interpolator, name) {
                (Some(interpolator), "llr") => interpolator.interpolate(values.view(), config.thetas)?,
                _ => values,
            };
            sink.put_vector(&config.naming.result(name, *series), stored.view())?;
        }

        let cross_entropy: Vec<f64> = metrics
            .cross_entropy_train
            .iter()
            .copied()
            .filter(|v| v.is_finite())
            .collect();
        if !cross_entropy.is_empty() {
            log::info!(
                "Mean training cross-entropy{}: {:.6}",
                series.infix(),
                cross_entropy.iter().sum::<f64>() / cross_entropy.len() as f64
            );
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_names_follow_the_results_layout() {
        let naming = OutputNaming {
            strategy: "point_by_point",
            algorithm: "carl".to_string(),
            suffix: "_deep_denom1".to_string(),
        };
        let key = naming.result("llr", Series::Calibrated);
        assert_eq!(key.strategy, "point_by_point");
        assert_eq!(key.name, "llr_carl_calibrated_deep_denom1");

        let key = naming.neyman("neyman2", "distribution", Series::Raw, 17);
        assert_eq!(key.name, "neyman2_llr_distribution_carl_17_deep_denom1");
    }

    #[test]
    fn metric_series_are_created_on_demand_in_order() {
        let mut outcome = TrainingOutcome::default();
        outcome.series_mut(Series::Raw).llr.push(1.0);
        outcome.series_mut(Series::Calibrated).llr.push(2.0);
        outcome.series_mut(Series::Raw).llr.push(3.0);
        assert_eq!(outcome.series(Series::Raw).unwrap().llr, vec![1.0, 3.0]);
        assert_eq!(outcome.series(Series::Calibrated).unwrap().llr, vec![2.0]);
        assert_eq!(outcome.metrics[0].0, Series::Raw);
    }
}
