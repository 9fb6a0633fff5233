//! # Sample Store and Result Sink
//!
//! The pipeline reads event samples and writes result arrays through two small
//! traits, [`SampleStore`] and [`ResultSink`], so that the storage backend can
//! vary without touching pipeline logic. Two backends are provided:
//!
//! - [`TsvStore`]: tab-separated tables with a header row, read and written
//!   through `polars`. This is the on-disk format used by the command line.
//! - [`MemoryStore`]: an in-memory map, used by tests and embedding callers.
//!
//! Every array is two-dimensional on the storage side. One-dimensional results
//! are stored as single-column tables, and toy batches are stored flattened as
//! `(toys * events_per_toy)` rows.

use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use polars::prelude::*;
use std::collections::HashMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Extension of every table written or read by [`TsvStore`].
pub const TABLE_EXTENSION: &str = "tsv";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Error from the underlying Polars DataFrame library: {0}")]
    PolarsError(#[from] PolarsError),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("The array '{0}' was not found in the store.")]
    NotFound(String),
    #[error(
        "Missing or null values were found in '{0}'. Sample and result tables must be complete."
    )]
    MissingValues(String),
    #[error("The array '{name}' has shape {found:?}, but {expected} was expected.")]
    UnexpectedShape {
        name: String,
        found: Vec<usize>,
        expected: String,
    },
}

/// Role of an event sample in the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SampleRole {
    TrainFeatures,
    TrainLabels,
    TrainRatios,
    TestFeatures,
    /// True likelihood ratios of the test sample, one row per hypothesis.
    TestRatios,
    CalibrationFeatures,
    /// Calibration-sample weights, one row per hypothesis.
    CalibrationWeights,
    IllustrationFeatures,
    /// Toy batch generated under one hypothesis, for the Neyman distributions.
    NeymanDistribution,
    /// Toy batch playing the role of observed data.
    NeymanObserved,
}

impl SampleRole {
    /// Feature tables can be substituted by their detector-smeared version.
    fn is_feature_table(self) -> bool {
        matches!(
            self,
            Self::TrainFeatures
                | Self::TestFeatures
                | Self::CalibrationFeatures
                | Self::IllustrationFeatures
                | Self::NeymanDistribution
                | Self::NeymanObserved
        )
    }
}

/// Deterministic name of an input sample.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SampleKey {
    pub role: SampleRole,
    pub hypothesis: Option<usize>,
    pub smeared: bool,
    /// Reference-hypothesis variant suffix, e.g. `_denom1`.
    pub input_suffix: String,
    pub new_samples: bool,
    /// Toy sample set prefix for the Neyman roles.
    pub neyman_set: &'static str,
}

impl SampleKey {
    pub fn new(role: SampleRole) -> Self {
        Self {
            role,
            hypothesis: None,
            smeared: false,
            input_suffix: String::new(),
            new_samples: false,
            neyman_set: "neyman",
        }
    }

    pub fn hypothesis(mut self, t: usize) -> Self {
        self.hypothesis = Some(t);
        self
    }

    pub fn smeared(mut self, smeared: bool) -> Self {
        self.smeared = smeared;
        self
    }

    pub fn input_suffix(mut self, suffix: &str) -> Self {
        self.input_suffix = suffix.to_string();
        self
    }

    pub fn new_samples(mut self, new_samples: bool) -> Self {
        self.new_samples = new_samples;
        self
    }

    pub fn neyman_set(mut self, name: &'static str) -> Self {
        self.neyman_set = name;
        self
    }

    /// Relative path of the sample, without extension.
    ///
    /// Training samples live under `point_by_point/`, toy batches under
    /// `neyman/`, everything else at the top of the events directory.
    pub fn relative_stem(&self) -> String {
        let prefix = if self.smeared && self.role.is_feature_table() {
            "smeared_"
        } else {
            ""
        };
        let index = self.hypothesis.map(|t| format!("_{t}")).unwrap_or_default();
        let new = if self.new_samples { "_new" } else { "" };
        let variant = &self.input_suffix;
        let neyman = self.neyman_set;

        match self.role {
            SampleRole::TrainFeatures => {
                format!("point_by_point/{prefix}X_train_point_by_point{index}{variant}{new}")
            }
            SampleRole::TrainLabels => {
                format!("point_by_point/y_train_point_by_point{index}{variant}{new}")
            }
            SampleRole::TrainRatios => {
                format!("point_by_point/r_train_point_by_point{index}{variant}{new}")
            }
            SampleRole::TestFeatures => format!("{prefix}X_test{variant}"),
            SampleRole::TestRatios => format!("r_test{variant}"),
            SampleRole::CalibrationFeatures => format!("{prefix}X_calibration{variant}"),
            SampleRole::CalibrationWeights => format!("weights_calibration{variant}"),
            SampleRole::IllustrationFeatures => format!("{prefix}X_illustration{variant}"),
            SampleRole::NeymanDistribution => {
                format!("neyman/{prefix}X_{neyman}_distribution{index}")
            }
            SampleRole::NeymanObserved => format!("neyman/{prefix}X_{neyman}_observed"),
        }
    }
}

/// Which results tree an array belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResultGroup {
    /// Metrics, per-event ratios, calibration diagnostics.
    Results,
    /// Per-toy log-likelihood-ratio arrays.
    Neyman,
}

/// Deterministic name of a result array.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResultKey {
    pub group: ResultGroup,
    /// Strategy directory, e.g. `histo` or `point_by_point`.
    pub strategy: String,
    pub name: String,
}

impl ResultKey {
    pub fn result(strategy: &str, name: impl Into<String>) -> Self {
        Self {
            group: ResultGroup::Results,
            strategy: strategy.to_string(),
            name: name.into(),
        }
    }

    pub fn neyman(strategy: &str, name: impl Into<String>) -> Self {
        Self {
            group: ResultGroup::Neyman,
            strategy: strategy.to_string(),
            name: name.into(),
        }
    }

    fn relative_stem(&self) -> String {
        let group = match self.group {
            ResultGroup::Results => "results",
            ResultGroup::Neyman => "neyman",
        };
        format!("{group}/{}/{}", self.strategy, self.name)
    }
}

/// Read access to input samples.
pub trait SampleStore {
    fn load(&self, key: &SampleKey) -> Result<Array2<f64>, StoreError>;

    fn contains(&self, key: &SampleKey) -> bool;

    /// Loads a sample that must have exactly one column.
    fn load_vector(&self, key: &SampleKey) -> Result<Array1<f64>, StoreError> {
        let table = self.load(key)?;
        single_column(table, &key.relative_stem())
    }
}

/// Write access to result arrays.
pub trait ResultSink {
    fn put(&mut self, key: &ResultKey, values: ArrayView2<f64>) -> Result<(), StoreError>;

    fn get(&self, key: &ResultKey) -> Result<Array2<f64>, StoreError>;

    fn put_vector(&mut self, key: &ResultKey, values: ArrayView1<f64>) -> Result<(), StoreError> {
        self.put(key, values.insert_axis(Axis(1)))
    }

    fn get_vector(&self, key: &ResultKey) -> Result<Array1<f64>, StoreError> {
        let table = self.get(key)?;
        single_column(table, &key.name)
    }
}

fn single_column(table: Array2<f64>, name: &str) -> Result<Array1<f64>, StoreError> {
    if table.ncols() != 1 {
        return Err(StoreError::UnexpectedShape {
            name: name.to_string(),
            found: table.shape().to_vec(),
            expected: "a single column".to_string(),
        });
    }
    Ok(table.column(0).to_owned())
}

/// File-backed store of tab-separated tables.
#[derive(Debug, Clone)]
pub struct TsvStore {
    events_dir: PathBuf,
    results_dir: PathBuf,
    neyman_dir: PathBuf,
}

impl TsvStore {
    pub fn new(events_dir: PathBuf, results_dir: PathBuf, neyman_dir: PathBuf) -> Self {
        Self {
            events_dir,
            results_dir,
            neyman_dir,
        }
    }

    pub fn sample_path(&self, key: &SampleKey) -> PathBuf {
        self.events_dir
            .join(format!("{}.{TABLE_EXTENSION}", key.relative_stem()))
    }

    pub fn result_path(&self, key: &ResultKey) -> PathBuf {
        let root = match key.group {
            ResultGroup::Results => &self.results_dir,
            ResultGroup::Neyman => &self.neyman_dir,
        };
        root.join(&key.strategy)
            .join(format!("{}.{TABLE_EXTENSION}", key.name))
    }
}

impl SampleStore for TsvStore {
    fn load(&self, key: &SampleKey) -> Result<Array2<f64>, StoreError> {
        let path = self.sample_path(key);
        log::debug!("Loading sample '{}'", path.display());
        read_table(&path)
    }

    fn contains(&self, key: &SampleKey) -> bool {
        self.sample_path(key).is_file()
    }
}

impl ResultSink for TsvStore {
    fn put(&mut self, key: &ResultKey, values: ArrayView2<f64>) -> Result<(), StoreError> {
        let path = self.result_path(key);
        log::debug!("Writing result '{}'", path.display());
        write_table(&path, values)
    }

    fn get(&self, key: &ResultKey) -> Result<Array2<f64>, StoreError> {
        read_table(&self.result_path(key))
    }
}

/// Reads a numeric table. Integer columns are widened to `f64`.
pub fn read_table(path: &Path) -> Result<Array2<f64>, StoreError> {
    if !path.is_file() {
        return Err(StoreError::NotFound(path.display().to_string()));
    }

    let df = CsvReader::new(File::open(path)?)
        .with_options(
            CsvReadOptions::default()
                .with_has_header(true)
                .with_parse_options(CsvParseOptions::default().with_separator(b'\t')),
        )
        .finish()?;

    if df.get_columns().iter().any(|c| c.null_count() > 0) {
        return Err(StoreError::MissingValues(path.display().to_string()));
    }

    Ok(df.to_ndarray::<Float64Type>(IndexOrder::C)?)
}

/// Writes a numeric table with generic column names `c0`, `c1`, ...
/// Parent directories are created on demand.
pub fn write_table(path: &Path, values: ArrayView2<f64>) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let columns: Vec<Column> = values
        .axis_iter(Axis(1))
        .enumerate()
        .map(|(j, column)| Column::new(format!("c{j}").into(), column.to_vec()))
        .collect();
    let mut df = DataFrame::new(columns)?;

    let mut file = File::create(path)?;
    CsvWriter::new(&mut file)
        .include_header(true)
        .with_separator(b'\t')
        .finish(&mut df)?;
    Ok(())
}

/// In-memory store. Samples and results live in separate namespaces.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    samples: HashMap<String, Array2<f64>>,
    results: HashMap<String, Array2<f64>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_sample(&mut self, key: &SampleKey, values: Array2<f64>) {
        self.samples.insert(key.relative_stem(), values);
    }

    pub fn insert_sample_vector(&mut self, key: &SampleKey, values: Array1<f64>) {
        self.insert_sample(key, values.insert_axis(Axis(1)));
    }

    /// Names of every stored result, sorted.
    pub fn result_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.results.keys().cloned().collect();
        names.sort();
        names
    }
}

impl SampleStore for MemoryStore {
    fn load(&self, key: &SampleKey) -> Result<Array2<f64>, StoreError> {
        let stem = key.relative_stem();
        self.samples
            .get(&stem)
            .cloned()
            .ok_or(StoreError::NotFound(stem))
    }

    fn contains(&self, key: &SampleKey) -> bool {
        self.samples.contains_key(&key.relative_stem())
    }
}

impl ResultSink for MemoryStore {
    fn put(&mut self, key: &ResultKey, values: ArrayView2<f64>) -> Result<(), StoreError> {
        self.results.insert(key.relative_stem(), values.to_owned());
        Ok(())
    }

    fn get(&self, key: &ResultKey) -> Result<Array2<f64>, StoreError> {
        let stem = key.relative_stem();
        self.results
            .get(&stem)
            .cloned()
            .ok_or(StoreError::NotFound(stem))
    }
}
