//! Histogram strategy: a one- or two-dimensional histogram of selected
//! observables, fit separately at every grid hypothesis.

use crate::estimate::binning::{self, Binning, BinningMode};
use crate::estimate::features::FeatureTransform;
use crate::estimate::histogram::HistogramRatio;
use crate::shared::options::Granularity;
use crate::shared::settings::Settings;
use crate::shared::store::{ResultSink, SampleKey, SampleRole, SampleStore};
use crate::strategies::neyman::NeymanEvaluator;
use crate::strategies::training::{
    self, CalibrationData, EstimatorFactory, Fitted, FittedEstimator, LoopConfig, OutputNaming,
    SharedSamples, TrainingSample,
};
use crate::strategies::{ExperimentRequest, PipelineError};

/// Fits one histogram per hypothesis on the selected observables.
pub struct HistogramFactory {
    indices: Vec<usize>,
    mode: BinningMode,
    granularity: Granularity,
}

impl HistogramFactory {
    pub fn new(indices: Vec<usize>, mode: BinningMode, granularity: Granularity) -> Self {
        Self {
            indices,
            mode,
            granularity,
        }
    }
}

impl EstimatorFactory for HistogramFactory {
    fn fit(
        &mut self,
        hypothesis: usize,
        sample: &TrainingSample,
        _calibration: Option<&CalibrationData>,
    ) -> Result<Fitted, PipelineError> {
        let y = sample.y.as_ref().ok_or(PipelineError::MissingTrainingInput {
            what: "labels",
            hypothesis,
        })?;

        let transform = FeatureTransform::Select(self.indices.clone());
        let x = transform.apply(sample.x.view(), "train")?;
        let bins = binning::derive_bins(&self.indices, self.mode, self.granularity, x.view())?;
        log::debug!("Bin edges for theta {}: {:?}", hypothesis, bins.edges);

        let mut histogram = HistogramRatio::new(bins)?;
        histogram.fit(x.view(), y.view(), None)?;

        Ok(Fitted {
            transform,
            estimator: FittedEstimator::Single(Box::new(histogram)),
        })
    }
}

/// Runs the histogram strategy on every grid hypothesis.
pub fn histo_inference<S: SampleStore + ResultSink>(
    store: &mut S,
    settings: &Settings,
    request: &ExperimentRequest,
) -> Result<(), PipelineError> {
    log::info!("Starting histogram-based inference");
    binning::check_observables(&request.x_indices, request.binning)?;

    let options = &request.options;
    let thetas = settings.theta_matrix()?;
    let n_thetas = thetas.nrows();
    let naming = OutputNaming {
        strategy: "histo",
        algorithm: "histo".to_string(),
        suffix: options
            .histogram_suffix(&Binning::label(&request.x_indices), request.smearing),
    };

    log::info!("Settings:");
    log::info!("  Statistics:              x {:?}", request.x_indices);
    log::info!("  Binning:                 {:?} ({:?})", request.binning, options.granularity);
    log::info!("  Smearing:                {}", request.smearing);
    log::info!("  Reference hypothesis:    {}", options.denominator(settings));
    log::info!("  Neyman toys:             {}", request.neyman);
    log::info!("  Output suffix:           {}", naming.suffix);

    let template = SampleKey::new(SampleRole::TrainFeatures)
        .smeared(request.smearing)
        .input_suffix(options.input_suffix())
        .new_samples(options.new_samples);

    let shared = SharedSamples::load(&*store, &template, n_thetas, None)?;
    let neyman = if request.neyman {
        Some(NeymanEvaluator::new(
            &*store,
            settings,
            options.neyman_set,
            &template,
            naming.clone(),
        )?)
    } else {
        None
    };

    let training_thetas: Vec<usize> = (0..n_thetas).collect();
    let config = LoopConfig {
        settings,
        thetas: thetas.view(),
        training_thetas: &training_thetas,
        naming: &naming,
        sample_template: &template,
    };

    let mut factory = HistogramFactory::new(
        request.x_indices.clone(),
        request.binning,
        options.granularity,
    );
    let outcome =
        training::run_training_loop(store, &mut factory, &config, &shared, neyman.as_ref())?;
    training::persist_metrics(store, &config, &outcome)?;

    log::info!("Histogram-based inference finished");
    Ok(())
}
