//! # Histogram Density Ratio
//!
//! Fills one n-dimensional histogram per class over the edges produced by the
//! binning policy and turns the two per-bin mass fractions into a class score.
//!
//! For a point in cell `k`, with `p0[k]` and `p1[k]` the (weighted) fractions of
//! the hypothesis class (label 0) and reference class (label 1) that fall into
//! that cell, the score is
//!
//! ```text
//! s = (p1 + eps) / (p0 + p1 + 2 eps)
//! ```
//!
//! The bin volume cancels in the ratio, so fractions are enough. The pseudo
//! mass `eps` keeps `s` strictly inside `(0, 1)` for cells populated by only
//! one class, so the derived log ratio is always finite. Empty cells give 0.5.
//!
//! Points outside the outermost edges, infinities included, are assigned to the
//! first or last bin of that dimension. NaN features are rejected.

use crate::estimate::binning::Binning;
use ndarray::{Array1, ArrayView1, ArrayView2, Axis};
use rayon::prelude::*;
use thiserror::Error;

/// Pseudo mass added to both classes in every cell.
pub const HISTOGRAM_EPSILON: f64 = 1e-6;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum HistogramError {
    #[error("The binning has {expected} dimensions, but the sample has {found} columns.")]
    DimensionMismatch { expected: usize, found: usize },
    #[error("Features ({features}), labels ({labels}) and weights ({weights}) have different lengths.")]
    LengthMismatch {
        features: usize,
        labels: usize,
        weights: usize,
    },
    #[error("Label {0} is not a class label. Histogram training labels must be 0 or 1.")]
    InvalidLabel(f64),
    #[error("No training events with label {0}. Both classes must be populated.")]
    EmptyClass(u8),
    #[error("Dimension {0} has fewer than two bin edges.")]
    DegenerateDimension(usize),
    #[error("The histogram has not been fit yet.")]
    NotFitted,
    #[error("Feature {column} of event {row} is NaN and has no bin.")]
    NanFeature { row: usize, column: usize },
}

/// Two-class histogram over a fixed binning.
#[derive(Debug, Clone)]
pub struct HistogramRatio {
    binning: Binning,
    /// Row-major strides of the flattened cell index.
    strides: Vec<usize>,
    /// Per-cell mass fractions of (label 0, label 1).
    fractions: Option<(Array1<f64>, Array1<f64>)>,
}

impl HistogramRatio {
    pub fn new(binning: Binning) -> Result<Self, HistogramError> {
        let shape = binning.shape();
        if let Some(dim) = shape.iter().position(|&n| n == 0) {
            return Err(HistogramError::DegenerateDimension(dim));
        }
        let mut strides = vec![1; shape.len()];
        for d in (0..shape.len().saturating_sub(1)).rev() {
            strides[d] = strides[d + 1] * shape[d + 1];
        }
        Ok(Self {
            binning,
            strides,
            fractions: None,
        })
    }

    pub fn binning(&self) -> &Binning {
        &self.binning
    }

    /// Fills both class histograms. `weights` defaults to unit weights.
    pub fn fit(
        &mut self,
        x: ArrayView2<f64>,
        y: ArrayView1<f64>,
        weights: Option<ArrayView1<f64>>,
    ) -> Result<(), HistogramError> {
        self.check_input(x)?;
        let n_weights = weights.map_or(x.nrows(), |w| w.len());
        if y.len() != x.nrows() || n_weights != x.nrows() {
            return Err(HistogramError::LengthMismatch {
                features: x.nrows(),
                labels: y.len(),
                weights: n_weights,
            });
        }

        let n_cells = self.binning.n_cells();
        let mut mass = [Array1::<f64>::zeros(n_cells), Array1::<f64>::zeros(n_cells)];

        for (i, row) in x.axis_iter(Axis(0)).enumerate() {
            let class = match y[i] {
                label if label == 0.0 => 0,
                label if label == 1.0 => 1,
                label => return Err(HistogramError::InvalidLabel(label)),
            };
            let weight = weights.map_or(1.0, |w| w[i]);
            mass[class][self.cell_index(row)] += weight;
        }

        let [mass0, mass1] = mass;
        let total0 = mass0.sum();
        let total1 = mass1.sum();
        if total0 <= 0.0 {
            return Err(HistogramError::EmptyClass(0));
        }
        if total1 <= 0.0 {
            return Err(HistogramError::EmptyClass(1));
        }

        self.fractions = Some((mass0 / total0, mass1 / total1));
        Ok(())
    }

    /// Score `s` of the reference class for every row.
    pub fn predict(&self, x: ArrayView2<f64>) -> Result<Array1<f64>, HistogramError> {
        self.check_input(x)?;
        let (p0, p1) = self.fractions.as_ref().ok_or(HistogramError::NotFitted)?;

        let scores: Vec<f64> = x
            .axis_iter(Axis(0))
            .into_par_iter()
            .map(|row| {
                let cell = self.cell_index(row);
                (p1[cell] + HISTOGRAM_EPSILON) / (p0[cell] + p1[cell] + 2.0 * HISTOGRAM_EPSILON)
            })
            .collect();
        Ok(Array1::from_vec(scores))
    }

    /// Column count must match the binning, and no value may be NaN.
    fn check_input(&self, x: ArrayView2<f64>) -> Result<(), HistogramError> {
        if x.ncols() != self.binning.dims() {
            return Err(HistogramError::DimensionMismatch {
                expected: self.binning.dims(),
                found: x.ncols(),
            });
        }
        if let Some(((row, column), _)) = x.indexed_iter().find(|(_, v)| v.is_nan()) {
            return Err(HistogramError::NanFeature { row, column });
        }
        Ok(())
    }

    fn cell_index(&self, row: ArrayView1<f64>) -> usize {
        row.iter()
            .zip(&self.binning.edges)
            .zip(&self.strides)
            .map(|((&value, edges), stride)| bin_index(edges.view(), value) * stride)
            .sum()
    }
}

/// Bin of `value` given sorted `edges`; bins are closed on the left, and the
/// last bin is also closed on the right. Out-of-range values are clamped.
fn bin_index(edges: ArrayView1<f64>, value: f64) -> usize {
    let n_bins = edges.len() - 1;
    let slice = match edges.as_slice() {
        Some(slice) => slice,
        None => return bin_index_strided(edges, value),
    };
    let upper = slice.partition_point(|&edge| edge <= value);
    upper.saturating_sub(1).min(n_bins - 1)
}

fn bin_index_strided(edges: ArrayView1<f64>, value: f64) -> usize {
    let n_bins = edges.len() - 1;
    let upper = edges.iter().take_while(|&&edge| edge <= value).count();
    upper.saturating_sub(1).min(n_bins - 1)
}
