//! Point-by-point strategies: a separate network per training hypothesis.
//!
//! `carl` trains a classifier between `theta_t` and the reference hypothesis
//! and reports both the raw ratio and the ratio after isotonic calibration on
//! the calibration mixture. `regression` fits `log r` directly. Both
//! standardise the features with statistics of the hypothesis's own training
//! sample.

use crate::estimate::features::FeatureTransform;
use crate::estimate::network::{NetworkConfig, NeuralScorer, Objective, TrainingReport};
use crate::estimate::ratio::{
    CalibratedClassifierRatio, ClassifierRatio, RegressionRatio, build_calibration_mixture,
};
use crate::shared::settings::Settings;
use crate::shared::store::{ResultSink, SampleKey, SampleRole, SampleStore};
use crate::strategies::neyman::NeymanEvaluator;
use crate::strategies::training::{
    self, CalibrationData, EstimatorFactory, Fitted, FittedEstimator, LoopConfig, OutputNaming,
    SharedSamples, TrainingSample,
};
use crate::strategies::{Algorithm, ExperimentRequest, PipelineError};

fn log_report(hypothesis: usize, report: &TrainingReport) {
    log::debug!(
        "Trained theta {} for {} epochs{}: training loss {:.6}, best validation loss {}",
        hypothesis,
        report.epochs_run,
        if report.stopped_early { " (stopped early)" } else { "" },
        report.final_training_loss,
        report
            .best_validation_loss
            .map_or_else(|| "n/a".to_string(), |loss| format!("{loss:.6}")),
    );
}

/// Classifier-based ratio estimation with isotonic calibration.
pub struct CarlFactory {
    config: NetworkConfig,
    objective: Objective,
}

impl CarlFactory {
    /// `learn_log_r` makes the network output `log r` instead of the score's
    /// logit. The loss is the same cross-entropy either way.
    pub fn new(config: NetworkConfig, learn_log_r: bool) -> Self {
        let objective = if learn_log_r {
            Objective::CrossEntropyLogR
        } else {
            Objective::CrossEntropy
        };
        Self { config, objective }
    }
}

impl EstimatorFactory for CarlFactory {
    fn fit(
        &mut self,
        hypothesis: usize,
        sample: &TrainingSample,
        calibration: Option<&CalibrationData>,
    ) -> Result<Fitted, PipelineError> {
        let y = sample.y.as_ref().ok_or(PipelineError::MissingTrainingInput {
            what: "labels",
            hypothesis,
        })?;

        let transform = FeatureTransform::standardize(sample.x.view())?;
        let x = transform.apply(sample.x.view(), "train")?;

        let scorer = NeuralScorer::new(self.config.clone(), self.objective);
        let (classifier, report) = ClassifierRatio::fit(scorer, x.view(), y.view(), None)?;
        log_report(hypothesis, &report);

        let estimator = match calibration {
            Some(calibration) => {
                let x_calibration = transform.apply(calibration.x.view(), "calibration")?;
                let mixture = build_calibration_mixture(
                    x_calibration.view(),
                    calibration.weights.row(hypothesis),
                    calibration.weights.row(calibration.reference),
                )?;
                FittedEstimator::Calibrated(CalibratedClassifierRatio::fit(
                    Box::new(classifier),
                    &mixture,
                )?)
            }
            None => FittedEstimator::Single(Box::new(classifier)),
        };

        Ok(Fitted {
            transform,
            estimator,
        })
    }
}

/// Direct regression of `log r`.
pub struct RegressionFactory {
    config: NetworkConfig,
}

impl RegressionFactory {
    pub fn new(config: NetworkConfig) -> Self {
        Self { config }
    }
}

impl EstimatorFactory for RegressionFactory {
    fn fit(
        &mut self,
        hypothesis: usize,
        sample: &TrainingSample,
        _calibration: Option<&CalibrationData>,
    ) -> Result<Fitted, PipelineError> {
        let log_r = sample
            .log_r
            .as_ref()
            .ok_or(PipelineError::MissingTrainingInput {
                what: "true ratios",
                hypothesis,
            })?;
        if let Some(row) = log_r.iter().position(|v| !v.is_finite()) {
            return Err(PipelineError::NonFiniteTrainingTarget { hypothesis, row });
        }

        let transform = FeatureTransform::standardize(sample.x.view())?;
        let x = transform.apply(sample.x.view(), "train")?;

        let scorer = NeuralScorer::new(self.config.clone(), Objective::SquaredErrorLogR);
        let (regression, report) = RegressionRatio::fit(scorer, x.view(), log_r.view())?;
        log_report(hypothesis, &report);

        Ok(Fitted {
            transform,
            estimator: FittedEstimator::Single(Box::new(regression)),
        })
    }
}

/// Runs `carl` or `regression` on the point-by-point training hypotheses and
/// interpolates the expected LLR to the full grid.
pub fn point_by_point_inference<S: SampleStore + ResultSink>(
    store: &mut S,
    settings: &Settings,
    request: &ExperimentRequest,
) -> Result<(), PipelineError> {
    let algorithm = request.algorithm;
    log::info!("Starting point-by-point {} inference", algorithm.name());

    let options = &request.options;
    let thetas = settings.theta_matrix()?;
    let n_thetas = thetas.nrows();
    let reference = options.denominator(settings);
    let config = NetworkConfig::for_run(settings, options);
    let naming = OutputNaming {
        strategy: "point_by_point",
        algorithm: algorithm.name().to_string(),
        suffix: options.point_by_point_suffix(request.smearing),
    };

    log::info!("Settings:");
    log::info!("  Algorithm:               {}", algorithm.name());
    log::info!("  Reference hypothesis:    {}", reference);
    log::info!("  Smearing:                {}", request.smearing);
    log::info!("  Hidden layers:           {}", config.hidden_layers);
    log::info!("  Units per layer:         {}", config.units);
    log::info!("  Epochs:                  {}", config.epochs);
    log::info!("  Early stopping patience: {:?}", config.patience);
    log::info!("  Learn log r:             {}", options.learn_log_r);
    log::info!("  Neyman sample set:       {}", options.neyman_set.name());
    log::info!("  Training hypotheses:     {}", settings.pbp_training_thetas.len());
    log::info!("  Output suffix:           {}", naming.suffix);

    let template = SampleKey::new(SampleRole::TrainFeatures)
        .smeared(request.smearing)
        .input_suffix(options.input_suffix())
        .new_samples(options.new_samples);

    let calibration_reference = match algorithm {
        Algorithm::Carl => Some(reference),
        _ => None,
    };
    let shared = SharedSamples::load(&*store, &template, n_thetas, calibration_reference)?;
    let neyman = NeymanEvaluator::new(
        &*store,
        settings,
        options.neyman_set,
        &template,
        naming.clone(),
    )?;

    let loop_config = LoopConfig {
        settings,
        thetas: thetas.view(),
        training_thetas: &settings.pbp_training_thetas,
        naming: &naming,
        sample_template: &template,
    };

    let mut factory: Box<dyn EstimatorFactory> = match algorithm {
        Algorithm::Carl => Box::new(CarlFactory::new(config, options.learn_log_r)),
        Algorithm::Regression => Box::new(RegressionFactory::new(config)),
        Algorithm::Histo => {
            return Err(PipelineError::UnknownAlgorithm(algorithm.name().to_string()));
        }
    };

    let outcome = training::run_training_loop(
        store,
        factory.as_mut(),
        &loop_config,
        &shared,
        Some(&neyman),
    )?;
    training::persist_metrics(store, &loop_config, &outcome)?;

    log::info!("Point-by-point {} inference finished", algorithm.name());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{Array1, Array2};

    fn tiny_config() -> NetworkConfig {
        NetworkConfig {
            hidden_layers: 1,
            units: 4,
            epochs: 3,
            patience: None,
            validation_split: 0.0,
            batch_size: 8,
            learning_rate: 1e-2,
            seed: 7,
        }
    }

    fn sample(n: usize) -> TrainingSample {
        let x = Array2::from_shape_fn((n, 2), |(i, j)| (i as f64 * 0.37 + j as f64).sin());
        let y = Array1::from_shape_fn(n, |i| (i % 2) as f64);
        let log_r = x.column(0).to_owned();
        TrainingSample {
            x,
            y: Some(y),
            log_r: Some(log_r),
        }
    }

    #[test]
    fn regression_rejects_non_finite_targets() {
        let mut sample = sample(16);
        if let Some(log_r) = sample.log_r.as_mut() {
            log_r[5] = f64::NEG_INFINITY;
        }
        let mut factory = RegressionFactory::new(tiny_config());
        assert!(matches!(
            factory.fit(3, &sample, None),
            Err(PipelineError::NonFiniteTrainingTarget {
                hypothesis: 3,
                row: 5
            })
        ));
    }

    #[test]
    fn carl_without_calibration_has_one_series() {
        let mut factory = CarlFactory::new(tiny_config(), true);
        let fitted = factory.fit(0, &sample(32), None).unwrap();
        assert_eq!(fitted.estimator.series().len(), 1);
        assert!(matches!(fitted.transform, FeatureTransform::Standardize(_)));
    }

    #[test]
    fn carl_with_calibration_has_raw_and_calibrated_series() {
        let n_cal = 20;
        let calibration = CalibrationData {
            x: Array2::from_shape_fn((n_cal, 2), |(i, j)| (i as f64 * 0.11 - j as f64).cos()),
            weights: Array2::from_shape_fn((3, n_cal), |(t, i)| 1.0 + 0.1 * (t * i) as f64),
            reference: 2,
        };
        let mut factory = CarlFactory::new(tiny_config(), false);
        let fitted = factory.fit(1, &sample(32), Some(&calibration)).unwrap();
        let series: Vec<_> = fitted.estimator.series().into_iter().map(|(s, _)| s).collect();
        assert_eq!(
            series,
            vec![training::Series::Raw, training::Series::Calibrated]
        );
    }

    #[test]
    fn carl_calibration_follows_the_calibration_weights() {
        let n_cal = 24;
        let x_cal = Array2::from_shape_fn((n_cal, 2), |(i, j)| (i as f64 * 0.23 - j as f64).cos());
        let train = sample(32);
        let mut factory = CarlFactory::new(tiny_config(), false);

        // The network is seeded, so a second fit reproduces these raw scores.
        let uncalibrated = factory.fit(1, &train, None).unwrap();
        let z = uncalibrated.transform.apply(x_cal.view(), "calibration").unwrap();
        let raw_s = uncalibrated.estimator.series()[0]
            .1
            .score(z.view())
            .unwrap()
            .unwrap();
        let lo = raw_s.iter().copied().fold(f64::INFINITY, f64::min);
        let hi = raw_s.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        assert!(hi > lo);

        // Reference fraction rising linearly from 0.2 to 0.8 with the raw score.
        let target = raw_s.mapv(|s| 0.2 + 0.6 * (s - lo) / (hi - lo));
        let mut weights = Array2::<f64>::ones((3, n_cal));
        weights.row_mut(1).assign(&target.mapv(|q| 1.0 - q));
        weights.row_mut(2).assign(&target);
        let calibration = CalibrationData {
            x: x_cal,
            weights,
            reference: 2,
        };

        let fitted = factory.fit(1, &train, Some(&calibration)).unwrap();
        let z = fitted.transform.apply(calibration.x.view(), "calibration").unwrap();
        let series = fitted.estimator.series();
        let raw_log_r = series[0].1.log_ratio(z.view()).unwrap();
        let calibrated_s = series[1].1.score(z.view()).unwrap().unwrap();
        let calibrated_log_r = series[1].1.log_ratio(z.view()).unwrap();

        for (&s, &q) in calibrated_s.iter().zip(target.iter()) {
            assert_abs_diff_eq!(s, q, epsilon = 1e-9);
        }
        let spread = calibrated_log_r.iter().copied().fold(f64::NEG_INFINITY, f64::max)
            - calibrated_log_r.iter().copied().fold(f64::INFINITY, f64::min);
        assert!(spread > 2.0, "calibrated log r spread {spread}");
        assert!(
            raw_log_r
                .iter()
                .zip(calibrated_log_r.iter())
                .any(|(a, b)| (a - b).abs() > 0.1)
        );
        // Calibration is monotone in the raw score, so it keeps the ordering.
        for i in 0..n_cal {
            for j in 0..n_cal {
                if raw_log_r[i] < raw_log_r[j] {
                    assert!(calibrated_log_r[i] <= calibrated_log_r[j] + 1e-12);
                }
            }
        }
    }
}
