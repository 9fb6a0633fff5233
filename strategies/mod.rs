//! # Inference Strategies
//!
//! A run trains one density ratio estimator per hypothesis, scores the shared
//! samples with it, optionally evaluates the Neyman toy batches, and stores
//! the resulting metric curves. The strategies differ only in how an
//! estimator is fit ([`training::EstimatorFactory`]) and on which hypotheses:
//!
//! - `histo`: a histogram of one or two observables, at every grid point.
//! - `carl` and `regression` (point by point): a neural network per training
//!   hypothesis, with the expected LLR interpolated to the full grid.

pub mod histo;
pub mod interpolate;
pub mod neyman;
pub mod point_by_point;
pub mod selection;
pub mod training;

use crate::estimate::binning::{BinningError, BinningMode};
use crate::estimate::features::TransformError;
use crate::estimate::histogram::HistogramError;
use crate::estimate::metrics::MetricsError;
use crate::estimate::ratio::RatioError;
use crate::shared::options::RunOptions;
use crate::shared::settings::{Settings, SettingsError};
use crate::shared::store::{ResultSink, SampleStore, StoreError};
use interpolate::InterpolationError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Configuration error: {0}")]
    Settings(#[from] SettingsError),
    #[error("Storage error: {0}")]
    Store(#[from] StoreError),
    #[error("Binning error: {0}")]
    Binning(#[from] BinningError),
    #[error("Histogram error: {0}")]
    Histogram(#[from] HistogramError),
    #[error("Feature transform error: {0}")]
    Transform(#[from] TransformError),
    #[error("Ratio estimator error: {0}")]
    Ratio(#[from] RatioError),
    #[error("Metric error: {0}")]
    Metrics(#[from] MetricsError),
    #[error("Interpolation error: {0}")]
    Interpolation(#[from] InterpolationError),
    #[error("Unknown algorithm '{0}'. Available: histo, carl, regression.")]
    UnknownAlgorithm(String),
    #[error("The algorithm '{0}' is not available in this build. Available: histo, carl, regression.")]
    UnavailableAlgorithm(String),
    #[error(
        "The parameterized setup is not available for '{0}'. Run it point by point with --pointbypoint."
    )]
    ParameterizedUnavailable(String),
    #[error(
        "log(r) of the training sample for hypothesis {hypothesis} is not finite at row {row}."
    )]
    NonFiniteTrainingTarget { hypothesis: usize, row: usize },
    #[error("The {what} of the training sample for hypothesis {hypothesis} are missing.")]
    MissingTrainingInput {
        what: &'static str,
        hypothesis: usize,
    },
    #[error(
        "The toy batch for hypothesis {hypothesis} has {found} events, but {expected} were expected ({n_toys} experiments of {events_per_toy} events)."
    )]
    ToyCountMismatch {
        hypothesis: usize,
        found: usize,
        expected: usize,
        n_toys: usize,
        events_per_toy: usize,
    },
    #[error("{what}: expected {expected}, found {found}.")]
    ShapeMismatch {
        what: String,
        expected: usize,
        found: usize,
    },
}

/// Algorithm names of the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Algorithm {
    Histo,
    Carl,
    Regression,
}

/// Names accepted on the command line that have no implementation here.
const UNAVAILABLE_ALGORITHMS: &[&str] = &[
    "p",
    "cl",
    "pvalues",
    "truth",
    "localmodel",
    "afc",
    "score",
    "combined",
    "combinedregression",
    "scoreregression",
];

impl Algorithm {
    pub fn parse(name: &str) -> Result<Self, PipelineError> {
        match name {
            "histo" => Ok(Self::Histo),
            "carl" => Ok(Self::Carl),
            "regression" => Ok(Self::Regression),
            other if UNAVAILABLE_ALGORITHMS.contains(&other) => {
                Err(PipelineError::UnavailableAlgorithm(other.to_string()))
            }
            other => Err(PipelineError::UnknownAlgorithm(other.to_string())),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Histo => "histo",
            Self::Carl => "carl",
            Self::Regression => "regression",
        }
    }
}

/// Everything the command line decides about one run.
#[derive(Debug, Clone)]
pub struct ExperimentRequest {
    pub algorithm: Algorithm,
    pub point_by_point: bool,
    pub smearing: bool,
    /// Histogrammed observables.
    pub x_indices: Vec<usize>,
    /// Evaluate Neyman toys in the histogram strategy.
    pub neyman: bool,
    pub binning: BinningMode,
    pub options: RunOptions,
}

/// Validates the request against the settings and runs the selected strategy.
pub fn run_experiment<S: SampleStore + ResultSink>(
    store: &mut S,
    settings: &Settings,
    request: &ExperimentRequest,
) -> Result<(), PipelineError> {
    settings.validate()?;

    match request.algorithm {
        Algorithm::Histo => histo::histo_inference(store, settings, request),
        Algorithm::Carl | Algorithm::Regression => {
            if !request.point_by_point {
                return Err(PipelineError::ParameterizedUnavailable(
                    request.algorithm.name().to_string(),
                ));
            }
            point_by_point::point_by_point_inference(store, settings, request)
        }
    }
}
