//! # Histogram Binning Policy
//!
//! Derives the bin edges used by the histogram ratio estimator. Only a closed
//! set of observable combinations is supported: the leading-jet transverse
//! momentum, the azimuthal angle between the tagging jets, and the 2-D
//! combination of both (in either order for the fixed scheme).
//!
//! Two modes exist:
//!
//! - **Fixed:** hand-tuned edges. For the 2-D combination the granularity picks
//!   one of four pre-tabulated edge sets (roughly 10, 20, 40 and 80 bins in pT).
//! - **Adaptive:** edges at evenly spaced percentiles of the training sample.
//!   The outermost edges are then overwritten with the physical range of the
//!   observable, so that every event of every sample falls into a bin no matter
//!   which training draw produced the interior edges.

use crate::estimate::metrics::quantile_sorted;
use crate::shared::options::Granularity;
use ndarray::{Array1, ArrayView1, ArrayView2};
use std::f64::consts::PI;
use thiserror::Error;

/// Feature index of the leading-jet transverse momentum.
pub const PT_J1_INDEX: usize = 1;
/// Feature index of the azimuthal angle between the two tagging jets.
pub const DELTA_PHI_JJ_INDEX: usize = 41;

/// Kinematic limit on the jet transverse momentum, in GeV.
pub const PT_MAX: f64 = 14000.0;
/// Margin added around `[0, pi]` for adaptive angular edges.
pub const DELTA_PHI_MARGIN: f64 = 0.1;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum BinningError {
    #[error(
        "Unsupported observable combination {indices:?} for {mode:?} binning. Supported: [1], [41], [1, 41] and (fixed only) [41, 1]."
    )]
    UnsupportedObservables {
        indices: Vec<usize>,
        mode: BinningMode,
    },
    #[error(
        "The training sample has {found} columns, but {expected} observables were requested."
    )]
    ColumnMismatch { found: usize, expected: usize },
    #[error("Adaptive binning requires a non-empty training sample.")]
    EmptyTrainingSample,
    #[error("The training sample contains non-finite values in observable column {0}.")]
    NonFiniteTrainingValue(usize),
}

/// How bin edges are chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinningMode {
    Fixed,
    Adaptive,
}

/// An observable the binning policy knows the physical range of.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observable {
    JetPt,
    DeltaPhi,
}

impl Observable {
    pub fn from_index(index: usize) -> Option<Self> {
        match index {
            PT_J1_INDEX => Some(Self::JetPt),
            DELTA_PHI_JJ_INDEX => Some(Self::DeltaPhi),
            _ => None,
        }
    }

    /// Outermost edges enforced by the adaptive mode.
    pub fn physical_range(self) -> (f64, f64) {
        match self {
            Self::JetPt => (0.0, PT_MAX),
            Self::DeltaPhi => (-DELTA_PHI_MARGIN, PI + DELTA_PHI_MARGIN),
        }
    }
}

/// Ordered per-dimension bin edges.
#[derive(Debug, Clone, PartialEq)]
pub struct Binning {
    pub edges: Vec<Array1<f64>>,
}

impl Binning {
    pub fn dims(&self) -> usize {
        self.edges.len()
    }

    /// Number of bins along each dimension.
    pub fn shape(&self) -> Vec<usize> {
        self.edges.iter().map(|e| e.len().saturating_sub(1)).collect()
    }

    /// Total number of cells of the n-dimensional histogram.
    pub fn n_cells(&self) -> usize {
        self.shape().iter().product()
    }

    /// Label used in output names: `_ptj` and `_deltaphi` for the 1-D schemes,
    /// `_{d}d` otherwise.
    pub fn label(indices: &[usize]) -> String {
        match indices {
            [PT_J1_INDEX] => "_ptj".to_string(),
            [DELTA_PHI_JJ_INDEX] => "_deltaphi".to_string(),
            _ => format!("_{}d", indices.len()),
        }
    }
}

/// Fails if `indices` has no binning scheme in `mode`. Lets callers reject a
/// configuration before any sample is loaded.
pub fn check_observables(indices: &[usize], mode: BinningMode) -> Result<(), BinningError> {
    let supported = match indices {
        [PT_J1_INDEX, DELTA_PHI_JJ_INDEX] | [PT_J1_INDEX] | [DELTA_PHI_JJ_INDEX] => true,
        [DELTA_PHI_JJ_INDEX, PT_J1_INDEX] => mode == BinningMode::Fixed,
        _ => false,
    };
    if supported {
        Ok(())
    } else {
        Err(BinningError::UnsupportedObservables {
            indices: indices.to_vec(),
            mode,
        })
    }
}

/// Derives bin edges for the observables `indices`.
///
/// `train` holds the training sample restricted to those observables, in the
/// same order. It is only read in adaptive mode.
pub fn derive_bins(
    indices: &[usize],
    mode: BinningMode,
    granularity: Granularity,
    train: ArrayView2<f64>,
) -> Result<Binning, BinningError> {
    let unsupported = || BinningError::UnsupportedObservables {
        indices: indices.to_vec(),
        mode,
    };

    match mode {
        BinningMode::Fixed => {
            let edges = match indices {
                [PT_J1_INDEX, DELTA_PHI_JJ_INDEX] => {
                    vec![fixed::pt_edges(granularity), fixed::delta_phi_edges(granularity)]
                }
                [DELTA_PHI_JJ_INDEX, PT_J1_INDEX] => {
                    vec![fixed::delta_phi_edges(granularity), fixed::pt_edges(granularity)]
                }
                [PT_J1_INDEX] => vec![Array1::from_vec(fixed::PT_40.to_vec())],
                [DELTA_PHI_JJ_INDEX] => vec![Array1::linspace(0.0, PI, 21)],
                _ => return Err(unsupported()),
            };
            Ok(Binning { edges })
        }
        BinningMode::Adaptive => {
            let counts: Vec<usize> = match indices {
                [PT_J1_INDEX, DELTA_PHI_JJ_INDEX] => {
                    let (pt, dphi) = adaptive_edge_counts(granularity);
                    vec![pt, dphi]
                }
                [PT_J1_INDEX] => vec![80],
                [DELTA_PHI_JJ_INDEX] => vec![20],
                _ => return Err(unsupported()),
            };

            if train.ncols() != indices.len() {
                return Err(BinningError::ColumnMismatch {
                    found: train.ncols(),
                    expected: indices.len(),
                });
            }
            if train.nrows() == 0 {
                return Err(BinningError::EmptyTrainingSample);
            }

            let mut edges = Vec::with_capacity(indices.len());
            for (dim, (&index, &n_edges)) in indices.iter().zip(&counts).enumerate() {
                let column = train.column(dim);
                if column.iter().any(|v| !v.is_finite()) {
                    return Err(BinningError::NonFiniteTrainingValue(index));
                }
                let observable = Observable::from_index(index).ok_or_else(unsupported)?;
                let mut dim_edges = percentile_edges(column, n_edges);
                let (low, high) = observable.physical_range();
                dim_edges[0] = low;
                dim_edges[n_edges - 1] = high;
                edges.push(dim_edges);
            }
            Ok(Binning { edges })
        }
    }
}

/// Number of adaptive edges for (pT, delta phi) in the 2-D scheme.
fn adaptive_edge_counts(granularity: Granularity) -> (usize, usize) {
    match granularity {
        Granularity::Rough => (10, 5),
        Granularity::Default => (20, 10),
        Granularity::Fine => (30, 15),
        Granularity::Superfine => (50, 20),
        Granularity::Asymmetric => (50, 5),
    }
}

/// `n_edges` percentiles at evenly spaced levels from 0 to 100.
fn percentile_edges(data: ArrayView1<f64>, n_edges: usize) -> Array1<f64> {
    let mut sorted = data.to_vec();
    sorted.sort_unstable_by(|a, b| a.total_cmp(b));
    let denominator = n_edges.saturating_sub(1).max(1) as f64;
    Array1::from_iter((0..n_edges).map(|k| quantile_sorted(&sorted, k as f64 / denominator)))
}

/// Hand-tuned edge tables.
mod fixed {
    use super::*;

    pub(super) const PT_10: [f64; 10] = [
        0., 59., 77., 94., 113., 136., 166., 213., 315., 14000.,
    ];

    pub(super) const PT_20: [f64; 20] = [
        0., 48., 58., 67., 75., 83., 91., 100., 109., 119., 130., 141., 155., 172., 193., 221.,
        260., 325., 462., 14000.,
    ];

    pub(super) const PT_40: [f64; 40] = [
        0., 40., 47., 53., 58., 62., 67., 70., 74., 78., 82., 86., 90., 94., 98., 103., 107.,
        111., 116., 122., 127., 132., 138., 144., 151., 158., 166., 174., 184., 196., 209., 224.,
        242., 264., 292., 329., 382., 468., 654., 14000.,
    ];

    pub(super) const PT_80: [f64; 80] = [
        0., 35., 40., 44., 47., 50., 53., 55., 58., 60., 62., 64., 66., 68., 70., 72., 74., 76.,
        78., 80., 82., 84., 86., 88., 90., 92., 94., 95., 97., 100., 102., 104., 106., 108., 110.,
        113., 115., 118., 120., 123., 125., 128., 131., 134., 137., 139., 142., 145., 149., 152.,
        156., 159., 163., 167., 172., 176., 181., 186., 192., 197., 203., 210., 218., 225., 235.,
        244., 255., 266., 280., 294., 311., 331., 355., 385., 424., 470., 539., 657., 872.,
        14000.,
    ];

    pub(super) fn pt_edges(granularity: Granularity) -> Array1<f64> {
        let table: &[f64] = match granularity {
            Granularity::Rough => &PT_10,
            Granularity::Default | Granularity::Asymmetric => &PT_20,
            Granularity::Fine => &PT_40,
            Granularity::Superfine => &PT_80,
        };
        Array1::from_vec(table.to_vec())
    }

    pub(super) fn delta_phi_edges(granularity: Granularity) -> Array1<f64> {
        let n_bins = match granularity {
            Granularity::Rough => 6,
            Granularity::Default | Granularity::Asymmetric => 10,
            Granularity::Fine => 12,
            Granularity::Superfine => 15,
        };
        Array1::linspace(0.0, PI, n_bins + 1)
    }
}
