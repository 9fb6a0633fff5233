//! # Trainable Scorer
//!
//! The density ratio estimators only need something that can be fit on a
//! labelled sample and then asked for a score per event. That contract is the
//! [`TrainableScorer`] trait. [`NeuralScorer`] implements it with a small fully
//! connected network:
//!
//! - `tanh` hidden layers of equal width, linear output unit;
//! - Glorot-uniform weights and zero biases, drawn from a seeded RNG, so a fit
//!   is reproducible for a given seed;
//! - mini-batch Adam with the training rows reshuffled every epoch;
//! - the last `validation_split` fraction of rows held out (before shuffling)
//!   for early stopping on the validation loss. The weights of the final epoch
//!   are kept, not the best ones.
//!
//! ## Objectives
//!
//! With `o` the network output and `y` the target:
//!
//! | Objective            | meaning of `o` | loss                        | `dL/do`  |
//! |----------------------|----------------|-----------------------------|----------|
//! | `CrossEntropy`       | logit of `s`   | BCE(`sigmoid(o)`, y)        | `s - y`  |
//! | `CrossEntropyLogR`   | `log r`        | BCE(`sigmoid(-o)`, y)       | `y - s`  |
//! | `SquaredErrorLogR`   | `log r`        | `(o - y)^2`                 | `2(o-y)` |
//!
//! For the two classification objectives `predict` returns the reference-class
//! score `s`; for the regression objective it returns `log r`.

use crate::shared::options::RunOptions;
use crate::shared::settings::Settings;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis, s};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand_distr::{Distribution, Uniform};
use thiserror::Error;

const ADAM_BETA1: f64 = 0.9;
const ADAM_BETA2: f64 = 0.999;
const ADAM_EPSILON: f64 = 1e-7;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ScorerError {
    #[error("Non-finite value in the {0} passed to the scorer.")]
    NonFiniteInput(&'static str),
    #[error("Features ({features}), targets ({targets}) and weights ({weights}) have different lengths.")]
    LengthMismatch {
        features: usize,
        targets: usize,
        weights: usize,
    },
    #[error("Classification targets must lie in [0, 1], found {0}.")]
    InvalidLabel(f64),
    #[error("Not enough rows to train: {n_rows} rows with validation split {validation_split}.")]
    NotEnoughRows { n_rows: usize, validation_split: f64 },
    #[error("Training diverged in epoch {epoch}: the loss is no longer finite.")]
    Diverged { epoch: usize },
    #[error("The scorer expects {expected} features, but the sample has {found}.")]
    FeatureCountMismatch { expected: usize, found: usize },
    #[error("The scorer has not been fit yet.")]
    NotFitted,
    #[error("Invalid network configuration: {0}")]
    InvalidConfig(String),
}

/// Something that learns a per-event score from a labelled sample.
pub trait TrainableScorer {
    fn fit(
        &mut self,
        x: ArrayView2<f64>,
        y: ArrayView1<f64>,
        weights: Option<ArrayView1<f64>>,
    ) -> Result<TrainingReport, ScorerError>;

    fn predict(&self, x: ArrayView2<f64>) -> Result<Array1<f64>, ScorerError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Objective {
    CrossEntropy,
    CrossEntropyLogR,
    SquaredErrorLogR,
}

impl Objective {
    pub fn is_classification(self) -> bool {
        !matches!(self, Self::SquaredErrorLogR)
    }

    fn loss(self, output: f64, target: f64) -> f64 {
        match self {
            Self::CrossEntropy => logit_cross_entropy(output, target),
            Self::CrossEntropyLogR => logit_cross_entropy(-output, target),
            Self::SquaredErrorLogR => (output - target).powi(2),
        }
    }

    fn gradient(self, output: f64, target: f64) -> f64 {
        match self {
            Self::CrossEntropy => sigmoid(output) - target,
            Self::CrossEntropyLogR => target - sigmoid(-output),
            Self::SquaredErrorLogR => 2.0 * (output - target),
        }
    }

    fn prediction(self, output: f64) -> f64 {
        match self {
            Self::CrossEntropy => sigmoid(output),
            Self::CrossEntropyLogR => sigmoid(-output),
            Self::SquaredErrorLogR => output,
        }
    }
}

fn sigmoid(z: f64) -> f64 {
    if z >= 0.0 {
        1.0 / (1.0 + (-z).exp())
    } else {
        let e = z.exp();
        e / (1.0 + e)
    }
}

/// Binary cross-entropy of `sigmoid(z)` against `y`, stable for large `|z|`.
fn logit_cross_entropy(z: f64, y: f64) -> f64 {
    z.max(0.0) - y * z + (-z.abs()).exp().ln_1p()
}

/// Hyperparameters of one fit.
#[derive(Debug, Clone, PartialEq)]
pub struct NetworkConfig {
    pub hidden_layers: usize,
    pub units: usize,
    pub epochs: usize,
    /// `None` trains for the full epoch budget.
    pub patience: Option<usize>,
    pub validation_split: f64,
    pub batch_size: usize,
    pub learning_rate: f64,
    pub seed: u64,
}

impl NetworkConfig {
    /// Resolves the depth and epoch presets of a run.
    pub fn for_run(settings: &Settings, options: &RunOptions) -> Self {
        let (epochs, patience) = options.epoch_budget(settings);
        Self {
            hidden_layers: options.hidden_layers(settings),
            units: settings.network.n_units,
            epochs,
            patience,
            validation_split: settings.network.validation_split,
            batch_size: settings.network.batch_size,
            learning_rate: settings.network.learning_rate,
            seed: settings.network.seed,
        }
    }

    fn validate(&self) -> Result<(), ScorerError> {
        if self.units == 0 || self.batch_size == 0 {
            return Err(ScorerError::InvalidConfig(
                "units and batch size must be positive".to_string(),
            ));
        }
        if !(self.learning_rate > 0.0 && self.learning_rate.is_finite()) {
            return Err(ScorerError::InvalidConfig(format!(
                "learning rate {} must be positive",
                self.learning_rate
            )));
        }
        if !(0.0..1.0).contains(&self.validation_split) {
            return Err(ScorerError::InvalidConfig(format!(
                "validation split {} must lie in [0, 1)",
                self.validation_split
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrainingReport {
    pub epochs_run: usize,
    pub final_training_loss: f64,
    /// Lowest validation loss seen, if rows were held out.
    pub best_validation_loss: Option<f64>,
    pub stopped_early: bool,
}

#[derive(Debug, Clone)]
struct Dense {
    weights: Array2<f64>,
    bias: Array1<f64>,
}

type Gradients = Vec<(Array2<f64>, Array1<f64>)>;

struct Adam {
    first: Gradients,
    second: Gradients,
    step: i32,
}

impl Adam {
    fn new(layers: &[Dense]) -> Self {
        let zeros: Gradients = layers
            .iter()
            .map(|l| (Array2::zeros(l.weights.raw_dim()), Array1::zeros(l.bias.len())))
            .collect();
        Self {
            first: zeros.clone(),
            second: zeros,
            step: 0,
        }
    }

    fn update(&mut self, layers: &mut [Dense], gradients: &Gradients, learning_rate: f64) {
        self.step += 1;
        let correction = (1.0 - ADAM_BETA2.powi(self.step)).sqrt() / (1.0 - ADAM_BETA1.powi(self.step));
        let rate = learning_rate * correction;

        for (i, layer) in layers.iter_mut().enumerate() {
            let (gw, gb) = &gradients[i];
            let (mw, mb) = &mut self.first[i];
            let (vw, vb) = &mut self.second[i];

            *mw = &*mw * ADAM_BETA1 + gw * (1.0 - ADAM_BETA1);
            *mb = &*mb * ADAM_BETA1 + gb * (1.0 - ADAM_BETA1);
            *vw = &*vw * ADAM_BETA2 + &gw.mapv(|g| g * g) * (1.0 - ADAM_BETA2);
            *vb = &*vb * ADAM_BETA2 + &gb.mapv(|g| g * g) * (1.0 - ADAM_BETA2);

            layer.weights = &layer.weights - &(&*mw / &vw.mapv(|v| v.sqrt() + ADAM_EPSILON) * rate);
            layer.bias = &layer.bias - &(&*mb / &vb.mapv(|v| v.sqrt() + ADAM_EPSILON) * rate);
        }
    }
}

/// Fully connected network trained with mini-batch Adam.
#[derive(Debug, Clone)]
pub struct NeuralScorer {
    config: NetworkConfig,
    objective: Objective,
    layers: Vec<Dense>,
}

impl NeuralScorer {
    pub fn new(config: NetworkConfig, objective: Objective) -> Self {
        Self {
            config,
            objective,
            layers: Vec::new(),
        }
    }

    pub fn objective(&self) -> Objective {
        self.objective
    }

    fn initialise(&mut self, n_features: usize, rng: &mut StdRng) {
        let mut widths = vec![n_features];
        widths.extend(std::iter::repeat_n(self.config.units, self.config.hidden_layers));
        widths.push(1);

        self.layers = widths
            .windows(2)
            .map(|pair| {
                let (fan_in, fan_out) = (pair[0], pair[1]);
                let limit = (6.0 / (fan_in + fan_out) as f64).sqrt();
                let uniform = Uniform::new(-limit, limit);
                Dense {
                    weights: Array2::from_shape_simple_fn((fan_in, fan_out), || {
                        uniform.sample(&mut *rng)
                    }),
                    bias: Array1::zeros(fan_out),
                }
            })
            .collect();
    }

    /// Activations of every layer, starting with the input itself.
    fn forward(&self, x: ArrayView2<f64>) -> Vec<Array2<f64>> {
        let mut activations = Vec::with_capacity(self.layers.len() + 1);
        activations.push(x.to_owned());
        for (i, layer) in self.layers.iter().enumerate() {
            let z = activations[i].dot(&layer.weights) + &layer.bias;
            let a = if i + 1 < self.layers.len() {
                z.mapv(f64::tanh)
            } else {
                z
            };
            activations.push(a);
        }
        activations
    }

    fn output(&self, x: ArrayView2<f64>) -> Array1<f64> {
        let activations = self.forward(x);
        activations
            .last()
            .map(|out| out.column(0).to_owned())
            .unwrap_or_else(|| Array1::zeros(x.nrows()))
    }

    fn mean_loss(&self, x: ArrayView2<f64>, y: ArrayView1<f64>, w: ArrayView1<f64>) -> f64 {
        let output = self.output(x);
        let total_weight = w.sum();
        let weighted: f64 = output
            .iter()
            .zip(y.iter())
            .zip(w.iter())
            .map(|((&o, &t), &wi)| wi * self.objective.loss(o, t))
            .sum();
        weighted / total_weight
    }

    fn gradients(&self, x: ArrayView2<f64>, y: ArrayView1<f64>, w: ArrayView1<f64>) -> Gradients {
        let activations = self.forward(x);
        let n_layers = self.layers.len();
        let total_weight = w.sum();

        let output = activations[n_layers].column(0);
        let mut delta: Array2<f64> = Array1::from_iter(
            output
                .iter()
                .zip(y.iter())
                .zip(w.iter())
                .map(|((&o, &t), &wi)| wi * self.objective.gradient(o, t) / total_weight),
        )
        .insert_axis(Axis(1));

        let mut gradients = Vec::with_capacity(n_layers);
        for l in (0..n_layers).rev() {
            let grad_w = activations[l].t().dot(&delta);
            let grad_b = delta.sum_axis(Axis(0));
            if l > 0 {
                let back = delta.dot(&self.layers[l].weights.t());
                delta = back * &activations[l].mapv(|a| 1.0 - a * a);
            }
            gradients.push((grad_w, grad_b));
        }
        gradients.reverse();
        gradients
    }

    fn check_inputs(
        &self,
        x: ArrayView2<f64>,
        y: ArrayView1<f64>,
        weights: Option<ArrayView1<f64>>,
    ) -> Result<(), ScorerError> {
        let n_weights = weights.map_or(x.nrows(), |w| w.len());
        if y.len() != x.nrows() || n_weights != x.nrows() {
            return Err(ScorerError::LengthMismatch {
                features: x.nrows(),
                targets: y.len(),
                weights: n_weights,
            });
        }
        if x.iter().any(|v| !v.is_finite()) {
            return Err(ScorerError::NonFiniteInput("features"));
        }
        if y.iter().any(|v| !v.is_finite()) {
            return Err(ScorerError::NonFiniteInput("targets"));
        }
        if let Some(w) = weights {
            if w.iter().any(|v| !v.is_finite() || *v < 0.0) {
                return Err(ScorerError::NonFiniteInput("weights"));
            }
        }
        if self.objective.is_classification() {
            if let Some(&bad) = y.iter().find(|&&t| !(0.0..=1.0).contains(&t)) {
                return Err(ScorerError::InvalidLabel(bad));
            }
        }
        Ok(())
    }
}

impl TrainableScorer for NeuralScorer {
    fn fit(
        &mut self,
        x: ArrayView2<f64>,
        y: ArrayView1<f64>,
        weights: Option<ArrayView1<f64>>,
    ) -> Result<TrainingReport, ScorerError> {
        self.config.validate()?;
        self.check_inputs(x, y, weights)?;

        let n_rows = x.nrows();
        let n_train = (n_rows as f64 * (1.0 - self.config.validation_split)).floor() as usize;
        if n_train == 0 {
            return Err(ScorerError::NotEnoughRows {
                n_rows,
                validation_split: self.config.validation_split,
            });
        }

        let mut rng = StdRng::seed_from_u64(self.config.seed);
        self.initialise(x.ncols(), &mut rng);

        let w = weights.map_or_else(|| Array1::ones(n_rows), |w| w.to_owned());
        let (x_train, x_val) = (x.slice(s![..n_train, ..]), x.slice(s![n_train.., ..]));
        let (y_train, y_val) = (y.slice(s![..n_train]), y.slice(s![n_train..]));
        let (w_train, w_val) = (w.slice(s![..n_train]), w.slice(s![n_train..]));
        let has_validation = !x_val.is_empty() && w_val.sum() > 0.0;

        let mut adam = Adam::new(&self.layers);
        let mut order: Vec<usize> = (0..n_train).collect();
        let mut best_validation: Option<f64> = None;
        let mut epochs_without_improvement = 0;
        let mut report = TrainingReport {
            epochs_run: 0,
            final_training_loss: f64::NAN,
            best_validation_loss: None,
            stopped_early: false,
        };

        for epoch in 0..self.config.epochs {
            order.shuffle(&mut rng);
            for batch in order.chunks(self.config.batch_size) {
                let wb = w_train.select(Axis(0), batch);
                if wb.sum() <= 0.0 {
                    continue;
                }
                let xb = x_train.select(Axis(0), batch);
                let yb = y_train.select(Axis(0), batch);
                let gradients = self.gradients(xb.view(), yb.view(), wb.view());
                adam.update(&mut self.layers, &gradients, self.config.learning_rate);
            }

            let training_loss = self.mean_loss(x_train, y_train, w_train);
            if !training_loss.is_finite() {
                return Err(ScorerError::Diverged { epoch });
            }
            report.epochs_run = epoch + 1;
            report.final_training_loss = training_loss;

            if !has_validation {
                log::debug!("Epoch {}: loss {:.6}", epoch + 1, training_loss);
                continue;
            }
            let validation_loss = self.mean_loss(x_val, y_val, w_val);
            log::debug!(
                "Epoch {}: loss {:.6}, validation loss {:.6}",
                epoch + 1,
                training_loss,
                validation_loss
            );

            if best_validation.is_none_or(|best| validation_loss < best) {
                best_validation = Some(validation_loss);
                epochs_without_improvement = 0;
            } else {
                epochs_without_improvement += 1;
            }
            if let Some(patience) = self.config.patience {
                if epochs_without_improvement >= patience {
                    report.stopped_early = true;
                    break;
                }
            }
        }

        report.best_validation_loss = best_validation;
        log::info!(
            "Trained scorer for {} epochs: loss {:.5}{}",
            report.epochs_run,
            report.final_training_loss,
            if report.stopped_early { " (early stopping)" } else { "" }
        );
        Ok(report)
    }

    fn predict(&self, x: ArrayView2<f64>) -> Result<Array1<f64>, ScorerError> {
        let expected = self
            .layers
            .first()
            .map(|l| l.weights.nrows())
            .ok_or(ScorerError::NotFitted)?;
        if x.ncols() != expected {
            return Err(ScorerError::FeatureCountMismatch {
                expected,
                found: x.ncols(),
            });
        }
        if x.iter().any(|v| !v.is_finite()) {
            return Err(ScorerError::NonFiniteInput("features"));
        }
        let objective = self.objective;
        Ok(self.output(x).mapv(|o| objective.prediction(o)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;
    use rand_distr::Normal;

    fn config(epochs: usize, patience: Option<usize>) -> NetworkConfig {
        NetworkConfig {
            hidden_layers: 1,
            units: 16,
            epochs,
            patience,
            validation_split: 0.2,
            batch_size: 32,
            learning_rate: 1e-2,
            seed: 7,
        }
    }

    /// Two unit Gaussians at -1 (label 0) and +1 (label 1), interleaved.
    fn gaussian_classes(n: usize, seed: u64) -> (Array2<f64>, Array1<f64>) {
        let mut rng = StdRng::seed_from_u64(seed);
        let normal = Normal::new(0.0, 1.0).unwrap();
        let y = Array1::from_iter((0..n).map(|i| (i % 2) as f64));
        let x = Array2::from_shape_fn((n, 1), |(i, _)| {
            2.0 * y[i] - 1.0 + normal.sample(&mut rng)
        });
        (x, y)
    }

    #[test]
    fn gradients_match_finite_differences() {
        let mut scorer = NeuralScorer::new(config(1, None), Objective::CrossEntropyLogR);
        let mut rng = StdRng::seed_from_u64(3);
        scorer.initialise(2, &mut rng);
        let x = Array2::from_shape_fn((5, 2), |(i, j)| 0.3 * i as f64 - 0.5 * j as f64);
        let y = ndarray::array![0.0, 1.0, 1.0, 0.0, 1.0];
        let w = ndarray::array![1.0, 2.0, 0.5, 1.0, 1.0];

        let analytic = scorer.gradients(x.view(), y.view(), w.view());
        let h = 1e-6;
        for (layer, (gw, _)) in analytic.iter().enumerate() {
            let (r, c) = (0, 0);
            let mut plus = scorer.clone();
            plus.layers[layer].weights[[r, c]] += h;
            let mut minus = scorer.clone();
            minus.layers[layer].weights[[r, c]] -= h;
            let numeric = (plus.mean_loss(x.view(), y.view(), w.view())
                - minus.mean_loss(x.view(), y.view(), w.view()))
                / (2.0 * h);
            assert!(
                (numeric - gw[[r, c]]).abs() < 1e-6,
                "layer {layer}: numeric {numeric} vs analytic {}",
                gw[[r, c]]
            );
        }
    }

    #[test]
    fn classifier_separates_shifted_gaussians() {
        let (x, y) = gaussian_classes(1000, 11);
        let mut scorer = NeuralScorer::new(config(30, None), Objective::CrossEntropy);
        let report = scorer.fit(x.view(), y.view(), None).unwrap();
        assert_eq!(report.epochs_run, 30);
        assert!(report.final_training_loss < std::f64::consts::LN_2);

        let s = scorer.predict(ndarray::array![[-2.0], [0.0], [2.0]].view()).unwrap();
        assert!(s[0] < 0.3 && s[2] > 0.7, "scores {s}");
        assert!(s[0] < s[1] && s[1] < s[2]);
    }

    #[test]
    fn log_r_objective_scores_the_reference_class() {
        let (x, y) = gaussian_classes(1000, 12);
        let mut scorer = NeuralScorer::new(config(30, None), Objective::CrossEntropyLogR);
        scorer.fit(x.view(), y.view(), None).unwrap();
        // Label 1 sits at +1, so its score must be high there.
        let s = scorer.predict(ndarray::array![[-2.0], [2.0]].view()).unwrap();
        assert!(s[0] < 0.3 && s[1] > 0.7, "scores {s}");
    }

    #[test]
    fn regression_learns_a_smooth_target() {
        let mut rng = StdRng::seed_from_u64(5);
        let x = Array2::from_shape_simple_fn((800, 1), || rng.gen_range(-1.0..1.0));
        let t = x.column(0).mapv(|v| 0.8 * v);
        let mut scorer = NeuralScorer::new(config(60, None), Objective::SquaredErrorLogR);
        let report = scorer.fit(x.view(), t.view(), None).unwrap();
        assert!(report.final_training_loss < 0.01, "{report:?}");
        let p = scorer.predict(ndarray::array![[0.5]].view()).unwrap();
        assert!((p[0] - 0.4).abs() < 0.1, "prediction {}", p[0]);
    }

    #[test]
    fn early_stopping_halts_on_noise() {
        let mut rng = StdRng::seed_from_u64(9);
        let x = Array2::from_shape_simple_fn((200, 1), || rng.gen_range(-1.0..1.0));
        let y = Array1::from_iter((0..200).map(|_| if rng.gen_bool(0.5) { 1.0 } else { 0.0 }));
        let mut cfg = config(500, Some(3));
        cfg.validation_split = 0.5;
        let mut scorer = NeuralScorer::new(cfg, Objective::CrossEntropy);
        let report = scorer.fit(x.view(), y.view(), None).unwrap();
        assert!(report.stopped_early);
        assert!(report.epochs_run < 500);
        assert!(report.best_validation_loss.is_some());
    }

    #[test]
    fn same_seed_gives_identical_predictions() {
        let (x, y) = gaussian_classes(300, 1);
        let probe = ndarray::array![[0.3], [-0.7]];
        let mut a = NeuralScorer::new(config(5, None), Objective::CrossEntropy);
        let mut b = NeuralScorer::new(config(5, None), Objective::CrossEntropy);
        a.fit(x.view(), y.view(), None).unwrap();
        b.fit(x.view(), y.view(), None).unwrap();
        assert_eq!(a.predict(probe.view()).unwrap(), b.predict(probe.view()).unwrap());
    }

    #[test]
    fn invalid_inputs_are_rejected() {
        let mut scorer = NeuralScorer::new(config(1, None), Objective::CrossEntropy);
        let x = ndarray::array![[0.0], [f64::INFINITY]];
        let y = ndarray::array![0.0, 1.0];
        assert_eq!(
            scorer.fit(x.view(), y.view(), None).unwrap_err(),
            ScorerError::NonFiniteInput("features")
        );
        assert_eq!(
            scorer.predict(ndarray::array![[0.0]].view()).unwrap_err(),
            ScorerError::NotFitted
        );
        let x = ndarray::array![[0.0], [1.0]];
        assert_eq!(
            scorer.fit(x.view(), ndarray::array![0.0, 2.0].view(), None).unwrap_err(),
            ScorerError::InvalidLabel(2.0)
        );
    }
}
