//! Typed view of the free-form options bag (`-o debug deep neyman2 ...`).
//!
//! The bag is parsed exactly once. Unknown words are reported and ignored so
//! that option lists written for other strategies keep working.

use crate::shared::settings::Settings;

/// Histogram resolution presets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Granularity {
    Rough,
    Default,
    Fine,
    Superfine,
    /// Many bins in the first observable, few in the second.
    Asymmetric,
}

impl Granularity {
    fn suffix(self) -> &'static str {
        match self {
            Self::Rough => "_roughbinning",
            Self::Default => "",
            Self::Fine => "_finebinning",
            Self::Superfine => "_superfinebinning",
            Self::Asymmetric => "_asymmetricbinning",
        }
    }
}

/// Network depth presets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Depth {
    Shallow,
    Default,
    Deep,
}

/// Training length presets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EpochPreset {
    Debug,
    Short,
    Default,
    Long,
}

/// Which pre-generated toy sample set the Neyman construction reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NeymanSet {
    Neyman,
    Neyman2,
    Neyman3,
}

impl NeymanSet {
    /// File prefix of the sample set and its results.
    pub fn name(self) -> &'static str {
        match self {
            Self::Neyman => "neyman",
            Self::Neyman2 => "neyman2",
            Self::Neyman3 => "neyman3",
        }
    }

    /// Number of events in each toy experiment of this set.
    pub fn events_per_toy(self, settings: &Settings) -> usize {
        match self {
            Self::Neyman => settings.n_expected_events_neyman,
            Self::Neyman2 => settings.n_expected_events_neyman2,
            Self::Neyman3 => settings.n_expected_events_neyman3,
        }
    }
}

/// Parsed options bag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOptions {
    pub granularity: Granularity,
    pub depth: Depth,
    pub epochs: EpochPreset,
    pub neyman_set: NeymanSet,
    /// Use the alternative reference hypothesis (`denom1`).
    pub alternative_denominator: bool,
    /// Network output is log r rather than a plain score. Disabled by `learns`.
    pub learn_log_r: bool,
    /// Read the re-generated training samples (`new`).
    pub new_samples: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            granularity: Granularity::Default,
            depth: Depth::Default,
            epochs: EpochPreset::Default,
            neyman_set: NeymanSet::Neyman,
            alternative_denominator: false,
            learn_log_r: true,
            new_samples: false,
        }
    }
}

impl RunOptions {
    /// Parses the options bag. Precedence between conflicting words follows the
    /// order in which they are checked below, not the order on the command line.
    pub fn parse<S: AsRef<str>>(words: &[S]) -> Self {
        let has = |flag: &str| words.iter().any(|w| w.as_ref() == flag);

        for word in words {
            if !KNOWN_OPTIONS.contains(&word.as_ref()) {
                log::warn!("Ignoring unknown option '{}'", word.as_ref());
            }
        }

        let granularity = if has("asymmetricbinning") {
            Granularity::Asymmetric
        } else if has("superbinning") {
            Granularity::Superfine
        } else if has("finebinning") {
            Granularity::Fine
        } else if has("roughbinning") {
            Granularity::Rough
        } else {
            Granularity::Default
        };

        let depth = if has("shallow") {
            Depth::Shallow
        } else if has("deep") {
            Depth::Deep
        } else {
            Depth::Default
        };

        let epochs = if has("debug") {
            EpochPreset::Debug
        } else if has("long") {
            EpochPreset::Long
        } else if has("short") {
            EpochPreset::Short
        } else {
            EpochPreset::Default
        };

        let neyman_set = if has("neyman3") {
            NeymanSet::Neyman3
        } else if has("neyman2") {
            NeymanSet::Neyman2
        } else {
            NeymanSet::Neyman
        };

        Self {
            granularity,
            depth,
            epochs,
            neyman_set,
            alternative_denominator: has("denom1"),
            learn_log_r: !has("learns"),
            new_samples: has("new"),
        }
    }

    /// Index of the reference hypothesis for this run.
    pub fn denominator(&self, settings: &Settings) -> usize {
        if self.alternative_denominator {
            settings.theta1_alternative
        } else {
            settings.theta1_default
        }
    }

    /// Suffix identifying the reference-hypothesis sample variant on disk.
    pub fn input_suffix(&self) -> &'static str {
        if self.alternative_denominator { "_denom1" } else { "" }
    }

    /// Hidden-layer count implied by the depth preset.
    pub fn hidden_layers(&self, settings: &Settings) -> usize {
        match self.depth {
            Depth::Shallow => settings.network.n_hidden_layers_shallow,
            Depth::Default => settings.network.n_hidden_layers_default,
            Depth::Deep => settings.network.n_hidden_layers_deep,
        }
    }

    /// Epoch budget and early-stopping patience implied by the epoch preset.
    /// Short and debug runs train for the full budget without early stopping.
    pub fn epoch_budget(&self, settings: &Settings) -> (usize, Option<usize>) {
        let patience = Some(settings.network.early_stopping_patience);
        match self.epochs {
            EpochPreset::Debug | EpochPreset::Short => (settings.network.n_epochs_short, None),
            EpochPreset::Default => (settings.network.n_epochs_default, patience),
            EpochPreset::Long => (settings.network.n_epochs_long, patience),
        }
    }

    /// Output-name suffix for the histogram strategy. `observables` is the
    /// label of the histogrammed observable combination (`_2d`, `_ptj`, ...).
    pub fn histogram_suffix(&self, observables: &str, smeared: bool) -> String {
        let mut suffix = String::from(observables);
        suffix.push_str(self.granularity.suffix());
        if smeared {
            suffix.push_str("_smeared");
        }
        suffix.push_str(self.input_suffix());
        if self.new_samples {
            suffix.push_str("_new");
        }
        suffix
    }

    /// Output-name suffix for the point-by-point strategies.
    pub fn point_by_point_suffix(&self, smeared: bool) -> String {
        let mut suffix = String::new();
        if !self.learn_log_r {
            suffix.push_str("_learns");
        }
        match self.depth {
            Depth::Shallow => suffix.push_str("_shallow"),
            Depth::Deep => suffix.push_str("_deep"),
            Depth::Default => {}
        }
        match self.epochs {
            EpochPreset::Debug => suffix.push_str("_debug"),
            EpochPreset::Long => suffix.push_str("_long"),
            EpochPreset::Short => suffix.push_str("_short"),
            EpochPreset::Default => {}
        }
        if smeared {
            suffix.push_str("_smeared");
        }
        suffix.push_str(self.input_suffix());
        suffix
    }
}

const KNOWN_OPTIONS: &[&str] = &[
    "debug",
    "short",
    "long",
    "deep",
    "shallow",
    "roughbinning",
    "finebinning",
    "superbinning",
    "asymmetricbinning",
    "denom1",
    "learns",
    "neyman2",
    "neyman3",
    "new",
];
