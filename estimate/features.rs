//! Per-hypothesis feature transforms.
//!
//! A transform is fit on the training sample of one hypothesis and then applied
//! unchanged to every other sample scored by that hypothesis's estimator (test,
//! calibration, illustration and toy batches). It is never shared across
//! hypotheses.

use ndarray::{Array1, Array2, ArrayView2, Axis};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransformError {
    #[error(
        "Non-finite value after transforming the {sample} sample (row {row}, column {column}). Check the input sample for NaN or infinite entries."
    )]
    NonFinite {
        sample: String,
        row: usize,
        column: usize,
    },
    #[error("Feature index {index} is out of range for a sample with {n_features} columns.")]
    IndexOutOfRange { index: usize, n_features: usize },
    #[error("The transform was fit on {expected} features, but the sample has {found}.")]
    FeatureCountMismatch { expected: usize, found: usize },
    #[error("Cannot fit a standard scaler on an empty sample.")]
    EmptySample,
}

/// Mean/variance normalisation of every column.
#[derive(Debug, Clone, PartialEq)]
pub struct StandardScaler {
    pub mean: Array1<f64>,
    /// Population standard deviation; columns without variance keep scale 1.
    pub scale: Array1<f64>,
}

impl StandardScaler {
    pub fn fit(x: ArrayView2<f64>) -> Result<Self, TransformError> {
        if x.nrows() == 0 {
            return Err(TransformError::EmptySample);
        }
        let mean = x.mean_axis(Axis(0)).ok_or(TransformError::EmptySample)?;
        let scale = x
            .std_axis(Axis(0), 0.0)
            .mapv(|s| if s > 0.0 && s.is_finite() { s } else { 1.0 });
        Ok(Self { mean, scale })
    }

    pub fn transform(&self, x: ArrayView2<f64>) -> Result<Array2<f64>, TransformError> {
        if x.ncols() != self.mean.len() {
            return Err(TransformError::FeatureCountMismatch {
                expected: self.mean.len(),
                found: x.ncols(),
            });
        }
        Ok((&x - &self.mean) / &self.scale)
    }
}

/// Transform applied to every sample an estimator sees.
#[derive(Debug, Clone, PartialEq)]
pub enum FeatureTransform {
    /// Standardise all columns (point-by-point strategies).
    Standardize(StandardScaler),
    /// Keep the listed columns, in order (histogram strategy).
    Select(Vec<usize>),
}

impl FeatureTransform {
    pub fn standardize(train: ArrayView2<f64>) -> Result<Self, TransformError> {
        Ok(Self::Standardize(StandardScaler::fit(train)?))
    }

    /// Applies the transform and checks that the result is finite.
    /// `sample` names the input in the error message.
    pub fn apply(&self, x: ArrayView2<f64>, sample: &str) -> Result<Array2<f64>, TransformError> {
        let transformed = match self {
            Self::Standardize(scaler) => scaler.transform(x)?,
            Self::Select(indices) => {
                if let Some(&index) = indices.iter().find(|&&i| i >= x.ncols()) {
                    return Err(TransformError::IndexOutOfRange {
                        index,
                        n_features: x.ncols(),
                    });
                }
                x.select(Axis(1), indices)
            }
        };
        ensure_finite(transformed.view(), sample)?;
        Ok(transformed)
    }
}

/// Fails on the first non-finite entry.
pub fn ensure_finite(x: ArrayView2<f64>, sample: &str) -> Result<(), TransformError> {
    match x.indexed_iter().find(|(_, v)| !v.is_finite()) {
        Some(((row, column), _)) => Err(TransformError::NonFinite {
            sample: sample.to_string(),
            row,
            column,
        }),
        None => Ok(()),
    }
}
