#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]

use clap::{Parser, ValueEnum};
use std::io::Write;
use std::path::PathBuf;
use std::process;

use higgs_inference::estimate::binning::BinningMode;
use higgs_inference::shared::options::RunOptions;
use higgs_inference::shared::settings::Settings;
use higgs_inference::shared::store::TsvStore;
use higgs_inference::strategies::{Algorithm, ExperimentRequest, run_experiment};

/// Which training sample the parameterized setups would use.
#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum TrainingSampleCli {
    Baseline,
    Basis,
    Random,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum BinningCli {
    Fixed,
    Adaptive,
}

impl From<BinningCli> for BinningMode {
    fn from(value: BinningCli) -> Self {
        match value {
            BinningCli::Fixed => BinningMode::Fixed,
            BinningCli::Adaptive => BinningMode::Adaptive,
        }
    }
}

#[derive(Parser, Debug)]
#[command(
    name = "higgs-inference",
    about = "Likelihood-ratio inference experiments for Higgs EFT couplings",
    long_about = "Trains density ratio estimators per hypothesis, evaluates them on the shared \
                  test sample and on Neyman toy experiments, and writes the metric curves."
)]
pub struct Cli {
    /// Inference algorithm: histo, carl or regression
    #[arg(value_name = "ALGORITHM")]
    algorithm: String,

    /// Train a separate estimator per hypothesis instead of a parameterized one
    #[arg(long = "pointbypoint", visible_alias = "pbp")]
    point_by_point: bool,

    /// Use the physics-aware network architecture (parameterized setups only)
    #[arg(short = 'a', long)]
    aware: bool,

    /// Use the detector-smeared samples
    #[arg(short = 's', long)]
    smearing: bool,

    /// Training sample of the parameterized setups
    #[arg(short = 't', long, value_enum, default_value_t = TrainingSampleCli::Baseline)]
    training: TrainingSampleCli,

    /// Observable indices used by the histogram strategy
    #[arg(short = 'x', long = "xindices", num_args = 1.., default_values_t = vec![1usize, 41])]
    x_indices: Vec<usize>,

    /// Weight of the score term in the combined losses
    #[arg(long, default_value_t = 5.0)]
    alpha: f64,

    /// Acceptance tolerance of approximate frequentist computation
    #[arg(short = 'e', long, default_value_t = 0.05)]
    epsilon: f64,

    /// Evaluate Neyman toy experiments in the histogram strategy
    #[arg(short = 'n', long)]
    neyman: bool,

    /// Option words: debug, short, long, deep, shallow, roughbinning,
    /// finebinning, superbinning, asymmetricbinning, denom1, learns,
    /// neyman2, neyman3, new
    #[arg(short = 'o', long, num_args = 1..)]
    options: Vec<String>,

    /// How histogram bin edges are chosen
    #[arg(long, value_enum, default_value_t = BinningCli::Adaptive)]
    binning: BinningCli,

    /// Settings file (.toml). Built-in defaults are used when omitted
    #[arg(long, value_name = "PATH")]
    settings: Option<PathBuf>,

    /// Overrides the base directory of the settings
    #[arg(long, value_name = "DIR")]
    base_dir: Option<PathBuf>,
}

fn init_logging() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(|buf, record| {
            writeln!(
                buf,
                "{} {:<7} {}",
                buf.timestamp(),
                record.level(),
                record.args()
            )
        })
        .init();
}

fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let mut settings = match &cli.settings {
        Some(path) => Settings::load(path)?,
        None => Settings::default(),
    };
    if let Some(base_dir) = cli.base_dir {
        settings.base_dir = base_dir;
    }

    let algorithm = Algorithm::parse(&cli.algorithm)?;
    let options = RunOptions::parse(&cli.options);

    log::info!("Hi!");
    log::info!("Algorithm:              {}", algorithm.name());
    log::info!("Point by point:         {}", cli.point_by_point);
    log::info!("Smearing:               {}", cli.smearing);
    log::info!("Training sample:        {:?}", cli.training);
    log::info!("Physics-aware:          {}", cli.aware);
    log::info!("Observables:            {:?}", cli.x_indices);
    log::info!("alpha:                  {}", cli.alpha);
    log::info!("epsilon:                {}", cli.epsilon);
    log::info!("Neyman (histograms):    {}", cli.neyman);
    log::info!("Options:                {:?}", cli.options);
    log::debug!("Parsed options: {:?}", options);

    let request = ExperimentRequest {
        algorithm,
        point_by_point: cli.point_by_point,
        smearing: cli.smearing,
        x_indices: cli.x_indices,
        neyman: cli.neyman,
        binning: cli.binning.into(),
        options,
    };

    let mut store = TsvStore::new(
        settings.events_dir(),
        settings.results_dir(),
        settings.neyman_dir(),
    );
    run_experiment(&mut store, &settings, &request)?;

    log::info!("That's it -- have a great day!");
    Ok(())
}

fn main() {
    let cli = Cli::parse();
    init_logging();

    if let Err(e) = run(cli) {
        log::error!("{e}");
        eprintln!("Error: {e}");
        process::exit(1);
    }
}
