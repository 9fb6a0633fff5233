//! # Run Settings
//!
//! Every constant the inference pipeline needs is gathered in a single
//! [`Settings`] value that is constructed once (usually from a TOML file) and
//! handed by reference to each component. Nothing in the crate reads global
//! state.
//!
//! All fields carry defaults, so an empty file is a valid configuration. The
//! defaults describe a two-dimensional coupling grid on `[-1, 1] x [-1, 1]`
//! with 21 points per axis.

use itertools::Itertools;
use ndarray::{Array2, ArrayView1};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

const DEFAULT_GRID_STEPS: usize = 21;
const DEFAULT_TRAINING_STRIDE: usize = 5;

/// Configuration errors. These are raised before any sample is touched.
#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("Failed to read the settings file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse the TOML settings file: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error(
        "The hypothesis grid is malformed: {0}. Provide either explicit 'points' or matching 'min', 'max' and 'steps' lists."
    )]
    InvalidGrid(String),
    #[error("Setting '{name}' refers to hypothesis {index}, but the grid only has {n_thetas} points.")]
    IndexOutOfRange {
        name: &'static str,
        index: usize,
        n_thetas: usize,
    },
    #[error("The point-by-point training subset is empty. At least one training hypothesis is required.")]
    EmptyTrainingSubset,
    #[error("Setting '{0}' must be strictly positive.")]
    NonPositive(&'static str),
    #[error("The validation split must lie in [0, 1), got {0}.")]
    InvalidValidationSplit(f64),
}

/// The hypothesis grid, either listed explicitly or as a rectangular grid.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ThetaGrid {
    /// Explicit hypothesis points. Takes precedence over the rectangular grid.
    pub points: Option<Vec<Vec<f64>>>,
    pub min: Vec<f64>,
    pub max: Vec<f64>,
    pub steps: Vec<usize>,
}

impl Default for ThetaGrid {
    fn default() -> Self {
        Self {
            points: None,
            min: vec![-1.0, -1.0],
            max: vec![1.0, 1.0],
            steps: vec![DEFAULT_GRID_STEPS, DEFAULT_GRID_STEPS],
        }
    }
}

impl ThetaGrid {
    /// Expands the grid into an `[n_thetas, n_dims]` matrix. Rectangular grids
    /// are enumerated in row-major order (last dimension varies fastest).
    pub fn expand(&self) -> Result<Array2<f64>, SettingsError> {
        if let Some(points) = &self.points {
            let dim = points
                .first()
                .map(Vec::len)
                .ok_or_else(|| SettingsError::InvalidGrid("the point list is empty".into()))?;
            if dim == 0 || points.iter().any(|p| p.len() != dim) {
                return Err(SettingsError::InvalidGrid(
                    "all points must have the same, non-zero dimension".into(),
                ));
            }
            let flat: Vec<f64> = points.iter().flatten().copied().collect();
            return Array2::from_shape_vec((points.len(), dim), flat)
                .map_err(|e| SettingsError::InvalidGrid(e.to_string()));
        }

        let dim = self.steps.len();
        if dim == 0 || self.min.len() != dim || self.max.len() != dim {
            return Err(SettingsError::InvalidGrid(format!(
                "got {} minima, {} maxima and {} step counts",
                self.min.len(),
                self.max.len(),
                dim
            )));
        }
        if self.steps.iter().any(|&s| s == 0) {
            return Err(SettingsError::InvalidGrid("step counts must be positive".into()));
        }

        let axes: Vec<Vec<f64>> = (0..dim)
            .map(|d| {
                let n = self.steps[d];
                if n == 1 {
                    return vec![self.min[d]];
                }
                let h = (self.max[d] - self.min[d]) / (n as f64 - 1.0);
                (0..n).map(|i| self.min[d] + i as f64 * h).collect()
            })
            .collect();

        let flat: Vec<f64> = axes
            .iter()
            .map(|axis| axis.iter().copied())
            .multi_cartesian_product()
            .flatten()
            .collect();
        let n_thetas = self.steps.iter().product();
        Array2::from_shape_vec((n_thetas, dim), flat)
            .map_err(|e| SettingsError::InvalidGrid(e.to_string()))
    }
}

/// Hyperparameter presets for the neural scorer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkSettings {
    pub n_hidden_layers_shallow: usize,
    pub n_hidden_layers_default: usize,
    pub n_hidden_layers_deep: usize,
    pub n_units: usize,
    pub n_epochs_short: usize,
    pub n_epochs_default: usize,
    pub n_epochs_long: usize,
    pub early_stopping_patience: usize,
    pub validation_split: f64,
    pub batch_size: usize,
    pub learning_rate: f64,
    pub seed: u64,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            n_hidden_layers_shallow: 1,
            n_hidden_layers_default: 2,
            n_hidden_layers_deep: 3,
            n_units: 100,
            n_epochs_short: 10,
            n_epochs_default: 50,
            n_epochs_long: 200,
            early_stopping_patience: 10,
            validation_split: 0.2,
            batch_size: 128,
            learning_rate: 1e-3,
            seed: 1337,
        }
    }
}

/// The complete, immutable configuration of one inference run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub base_dir: PathBuf,
    pub events_dir: PathBuf,
    pub results_dir: PathBuf,
    pub neyman_dir: PathBuf,

    pub thetas: ThetaGrid,

    pub theta_observed: usize,
    /// Reference (denominator) hypothesis.
    pub theta1_default: usize,
    /// Reference hypothesis used with the `denom1` option.
    pub theta1_alternative: usize,
    pub theta_benchmark_trained: usize,
    pub theta_benchmark_nottrained: usize,
    pub theta_benchmark_illustration: usize,

    /// Hypotheses that get their own estimator in the point-by-point strategies.
    pub pbp_training_thetas: Vec<usize>,

    pub n_expected_events: usize,
    pub n_expected_events_neyman: usize,
    pub n_expected_events_neyman2: usize,
    pub n_expected_events_neyman3: usize,
    pub n_neyman_distribution_experiments: usize,

    /// Maximum hypothesis distance for which a toy combination is scored.
    pub toy_evaluation_radius: f64,

    pub network: NetworkSettings,
}

impl Default for Settings {
    fn default() -> Self {
        let n = DEFAULT_GRID_STEPS;
        let centre = (n / 2) * n + n / 2;
        Self {
            base_dir: PathBuf::from("."),
            events_dir: PathBuf::from("data/unweighted_events"),
            results_dir: PathBuf::from("results"),
            neyman_dir: PathBuf::from("results/neyman"),
            thetas: ThetaGrid::default(),
            theta_observed: centre,
            theta1_default: 0,
            theta1_alternative: n * n - 1,
            theta_benchmark_trained: centre,
            theta_benchmark_nottrained: centre + 2 * n + 1,
            theta_benchmark_illustration: centre,
            pbp_training_thetas: strided_subset(n, DEFAULT_TRAINING_STRIDE),
            n_expected_events: 36,
            n_expected_events_neyman: 36,
            n_expected_events_neyman2: 100,
            n_expected_events_neyman3: 1000,
            n_neyman_distribution_experiments: 1000,
            toy_evaluation_radius: 0.3,
            network: NetworkSettings::default(),
        }
    }
}

/// Indices of every `stride`-th row and column of an `n x n` grid,
/// always including the last row and column.
fn strided_subset(n: usize, stride: usize) -> Vec<usize> {
    let mut axis: Vec<usize> = (0..n).step_by(stride).collect();
    if axis.last() != Some(&(n - 1)) {
        axis.push(n - 1);
    }
    axis.iter()
        .cartesian_product(axis.iter())
        .map(|(&i, &j)| i * n + j)
        .collect()
}

impl Settings {
    /// Loads settings from a TOML file.
    pub fn load(path: &Path) -> Result<Self, SettingsError> {
        let toml_string = fs::read_to_string(path)?;
        let settings = toml::from_str(&toml_string)?;
        Ok(settings)
    }

    /// Checks every cross-field invariant. Call once before the run starts.
    pub fn validate(&self) -> Result<(), SettingsError> {
        let n_thetas = self.n_thetas()?;

        let indices = [
            ("theta_observed", self.theta_observed),
            ("theta1_default", self.theta1_default),
            ("theta1_alternative", self.theta1_alternative),
            ("theta_benchmark_trained", self.theta_benchmark_trained),
            ("theta_benchmark_nottrained", self.theta_benchmark_nottrained),
            ("theta_benchmark_illustration", self.theta_benchmark_illustration),
        ];
        for (name, index) in indices {
            if index >= n_thetas {
                return Err(SettingsError::IndexOutOfRange {
                    name,
                    index,
                    n_thetas,
                });
            }
        }

        if self.pbp_training_thetas.is_empty() {
            return Err(SettingsError::EmptyTrainingSubset);
        }
        if let Some(&index) = self.pbp_training_thetas.iter().find(|&&t| t >= n_thetas) {
            return Err(SettingsError::IndexOutOfRange {
                name: "pbp_training_thetas",
                index,
                n_thetas,
            });
        }

        let counts = [
            ("n_expected_events", self.n_expected_events),
            ("n_expected_events_neyman", self.n_expected_events_neyman),
            ("n_expected_events_neyman2", self.n_expected_events_neyman2),
            ("n_expected_events_neyman3", self.n_expected_events_neyman3),
            (
                "n_neyman_distribution_experiments",
                self.n_neyman_distribution_experiments,
            ),
            ("network.n_units", self.network.n_units),
            ("network.batch_size", self.network.batch_size),
        ];
        for (name, value) in counts {
            if value == 0 {
                return Err(SettingsError::NonPositive(name));
            }
        }
        if !(self.network.learning_rate > 0.0) {
            return Err(SettingsError::NonPositive("network.learning_rate"));
        }

        let split = self.network.validation_split;
        if !(0.0..1.0).contains(&split) {
            return Err(SettingsError::InvalidValidationSplit(split));
        }

        Ok(())
    }

    /// The hypothesis grid as an `[n_thetas, n_dims]` matrix.
    pub fn theta_matrix(&self) -> Result<Array2<f64>, SettingsError> {
        self.thetas.expand()
    }

    pub fn n_thetas(&self) -> Result<usize, SettingsError> {
        Ok(self.theta_matrix()?.nrows())
    }

    pub fn events_dir(&self) -> PathBuf {
        self.base_dir.join(&self.events_dir)
    }

    pub fn results_dir(&self) -> PathBuf {
        self.base_dir.join(&self.results_dir)
    }

    pub fn neyman_dir(&self) -> PathBuf {
        self.base_dir.join(&self.neyman_dir)
    }
}

/// Formats a hypothesis point for log messages.
pub fn format_theta(theta: ArrayView1<f64>) -> String {
    format!(
        "({})",
        theta.iter().map(|v| format!("{v:.3}")).join(", ")
    )
}
