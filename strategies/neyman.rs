//! Neyman toy evaluation.
//!
//! Toy batches are stored flattened: `n_toys * events_per_toy` rows of
//! features, toy after toy. Each batch is transformed with the estimator's own
//! transform, scored event by event, and regrouped into one log-likelihood
//! ratio per toy.
//!
//! For the estimator trained at `t`, the distribution array has one row per
//! candidate hypothesis `tt`. Rows of skipped `(tt, t)` combinations are NaN.
//! The observed batch is scored for every `t`.

use crate::estimate::metrics;
use crate::estimate::ratio::RatioEstimator;
use crate::shared::options::NeymanSet;
use crate::shared::settings::Settings;
use crate::shared::store::{ResultSink, SampleKey, SampleRole, SampleStore};
use crate::strategies::PipelineError;
use crate::strategies::selection::ToySelection;
use crate::strategies::training::{Fitted, OutputNaming};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use ndarray::{Array1, Array2, ArrayView2};
use std::io::IsTerminal;

pub struct NeymanEvaluator {
    selection: ToySelection,
    set: NeymanSet,
    events_per_toy: usize,
    n_toys: usize,
    n_thetas: usize,
    template: SampleKey,
    naming: OutputNaming,
    observed: Array2<f64>,
}

impl NeymanEvaluator {
    /// Loads the observed batch once. `template` carries the smearing flag.
    pub fn new<S: SampleStore + ?Sized>(
        store: &S,
        settings: &Settings,
        set: NeymanSet,
        template: &SampleKey,
        naming: OutputNaming,
    ) -> Result<Self, PipelineError> {
        let template = SampleKey {
            hypothesis: None,
            ..template.clone()
        }
        .neyman_set(set.name());
        let observed_key = SampleKey {
            role: SampleRole::NeymanObserved,
            ..template.clone()
        };
        let observed = store.load(&observed_key)?;
        let events_per_toy = set.events_per_toy(settings);
        if events_per_toy == 0 || observed.nrows() % events_per_toy != 0 {
            return Err(PipelineError::ShapeMismatch {
                what: format!(
                    "events in the observed {} batch, a multiple of {events_per_toy}",
                    set.name()
                ),
                expected: (observed.nrows() / events_per_toy.max(1)) * events_per_toy,
                found: observed.nrows(),
            });
        }

        Ok(Self {
            selection: ToySelection::from_settings(settings)?,
            set,
            events_per_toy,
            n_toys: settings.n_neyman_distribution_experiments,
            n_thetas: settings.n_thetas()?,
            template,
            naming,
            observed,
        })
    }

    pub fn selection(&self) -> &ToySelection {
        &self.selection
    }

    /// Scores the observed batch and every selected distribution batch with
    /// the estimator trained at `t`, and stores the per-toy LLR arrays.
    pub fn evaluate<S: SampleStore + ResultSink + ?Sized>(
        &self,
        store: &mut S,
        t: usize,
        fitted: &Fitted,
    ) -> Result<(), PipelineError> {
        let series = fitted.estimator.series();
        let set = self.set.name();

        let observed = fitted.transform.apply(self.observed.view(), "Neyman observed")?;
        for (name, estimator) in &series {
            let llr = self.per_toy_llr(observed.view(), *estimator)?;
            store.put_vector(&self.naming.neyman(set, "observed", *name, t), llr.view())?;
        }

        let mut distributions: Vec<Array2<f64>> = series
            .iter()
            .map(|_| Array2::from_elem((self.n_thetas, self.n_toys), f64::NAN))
            .collect();

        let n_selected = self.selection.n_selected(t);
        log::info!(
            "Evaluating {} of {} toy batches for theta {}",
            n_selected,
            self.n_thetas,
            t
        );
        let pb = create_progress_bar(n_selected as u64, "Neyman toys");

        for tt in 0..self.n_thetas {
            if !self.selection.decide_toy_evaluation(tt, t) {
                continue;
            }
            let key = SampleKey {
                role: SampleRole::NeymanDistribution,
                ..self.template.clone()
            }
            .hypothesis(tt);
            let batch = store.load(&key)?;
            let expected = self.n_toys * self.events_per_toy;
            if batch.nrows() != expected {
                return Err(PipelineError::ToyCountMismatch {
                    hypothesis: tt,
                    found: batch.nrows(),
                    expected,
                    n_toys: self.n_toys,
                    events_per_toy: self.events_per_toy,
                });
            }
            let batch = fitted.transform.apply(batch.view(), "Neyman distribution")?;

            for ((_, estimator), distribution) in series.iter().zip(distributions.iter_mut()) {
                let llr = self.per_toy_llr(batch.view(), *estimator)?;
                distribution.row_mut(tt).assign(&llr);
            }
            pb.inc(1);
        }
        pb.finish_and_clear();

        for ((name, _), distribution) in series.iter().zip(&distributions) {
            store.put(
                &self.naming.neyman(set, "distribution", *name, t),
                distribution.view(),
            )?;
        }
        Ok(())
    }

    fn per_toy_llr(
        &self,
        x: ArrayView2<f64>,
        estimator: &dyn RatioEstimator,
    ) -> Result<Array1<f64>, PipelineError> {
        let log_r = estimator.log_ratio(x)?;
        Ok(metrics::toy_llr(log_r.view(), self.events_per_toy)?)
    }
}

fn create_progress_bar(len: u64, message: &str) -> ProgressBar {
    let pb = ProgressBar::new(len);
    let draw_target = if std::io::stderr().is_terminal() {
        ProgressDrawTarget::stderr_with_hz(20)
    } else {
        ProgressDrawTarget::hidden()
    };
    pb.set_draw_target(draw_target);
    if let Ok(style) = ProgressStyle::with_template(
        "\n> [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}",
    ) {
        pb.set_style(style.progress_chars("█▉▊▋▌▍▎▏  "));
    }
    pb.set_message(message.to_string());
    pb
}
