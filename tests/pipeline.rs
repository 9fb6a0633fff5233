use approx::assert_abs_diff_eq;
use higgs_inference::estimate::binning::{BinningMode, DELTA_PHI_JJ_INDEX};
use higgs_inference::shared::options::RunOptions;
use higgs_inference::shared::settings::{Settings, ThetaGrid};
use higgs_inference::shared::store::{
    MemoryStore, ResultKey, ResultSink, SampleKey, SampleRole,
};
use higgs_inference::strategies::{Algorithm, ExperimentRequest, PipelineError, run_experiment};
use ndarray::{Array1, Array2, array};

const N_FEATURES: usize = 42;
/// Angle inside the first of the twenty fixed delta-phi bins.
const CELL_A: f64 = 0.05;
/// Angle inside the last one.
const CELL_B: f64 = 3.0;

fn events(delta_phi: &[f64]) -> Array2<f64> {
    let mut x = Array2::<f64>::zeros((delta_phi.len(), N_FEATURES));
    for (i, &value) in delta_phi.iter().enumerate() {
        x[[i, 1]] = 50.0 + 10.0 * i as f64;
        x[[i, DELTA_PHI_JJ_INDEX]] = value;
        x[[i, 2]] = (i as f64 * 0.7).sin();
    }
    x
}

/// Events whose features depend only on their delta-phi cell.
fn cell_events(delta_phi: &[f64]) -> Array2<f64> {
    let mut x = Array2::<f64>::zeros((delta_phi.len(), N_FEATURES));
    for (i, &value) in delta_phi.iter().enumerate() {
        let in_a = value == CELL_A;
        x[[i, 1]] = if in_a { 60.0 } else { 90.0 };
        x[[i, 2]] = if in_a { 0.3 } else { -0.3 };
        x[[i, DELTA_PHI_JJ_INDEX]] = value;
    }
    x
}

/// Three hypotheses on a line, the middle one observed.
fn line_settings() -> Settings {
    Settings {
        thetas: ThetaGrid {
            points: Some(vec![vec![0.0], vec![0.5], vec![1.0]]),
            ..ThetaGrid::default()
        },
        theta_observed: 1,
        theta1_default: 0,
        theta1_alternative: 2,
        theta_benchmark_trained: 1,
        theta_benchmark_nottrained: 2,
        theta_benchmark_illustration: 1,
        pbp_training_thetas: vec![0, 2],
        n_expected_events: 10,
        n_expected_events_neyman: 2,
        n_neyman_distribution_experiments: 3,
        ..Settings::default()
    }
}

/// Number of the ten hypothesis-class training events that land in cell A.
/// The reference class always splits five and five.
const EVENTS_IN_A: [usize; 3] = [5, 8, 2];

fn true_ratios(t: usize) -> (f64, f64) {
    let k = EVENTS_IN_A[t] as f64;
    (k / 5.0, (10.0 - k) / 5.0)
}

fn populate(store: &mut MemoryStore, settings: &Settings) {
    let n_thetas = 3;
    for t in 0..n_thetas {
        let k = EVENTS_IN_A[t];
        let mut delta_phi = Vec::new();
        let mut labels = Vec::new();
        for i in 0..10 {
            delta_phi.push(if i < k { CELL_A } else { CELL_B });
            labels.push(0.0);
        }
        for i in 0..10 {
            delta_phi.push(if i < 5 { CELL_A } else { CELL_B });
            labels.push(1.0);
        }
        let (r_a, r_b) = true_ratios(t);
        let r: Vec<f64> = delta_phi
            .iter()
            .map(|&v| if v == CELL_A { r_a } else { r_b })
            .collect();

        store.insert_sample(
            &SampleKey::new(SampleRole::TrainFeatures).hypothesis(t),
            events(&delta_phi),
        );
        store.insert_sample_vector(
            &SampleKey::new(SampleRole::TrainLabels).hypothesis(t),
            Array1::from_vec(labels),
        );
        store.insert_sample_vector(
            &SampleKey::new(SampleRole::TrainRatios).hypothesis(t),
            Array1::from_vec(r),
        );
    }

    let test = [CELL_A, CELL_A, CELL_B, CELL_B];
    store.insert_sample(&SampleKey::new(SampleRole::TestFeatures), events(&test));
    let r_test = Array2::from_shape_fn((n_thetas, test.len()), |(t, i)| {
        let (r_a, r_b) = true_ratios(t);
        if test[i] == CELL_A { r_a } else { r_b }
    });
    store.insert_sample(&SampleKey::new(SampleRole::TestRatios), r_test);
    store.insert_sample(
        &SampleKey::new(SampleRole::IllustrationFeatures),
        events(&[CELL_A, CELL_B]),
    );

    let n_per_batch =
        settings.n_neyman_distribution_experiments * settings.n_expected_events_neyman;
    for tt in 0..n_thetas {
        store.insert_sample(
            &SampleKey::new(SampleRole::NeymanDistribution).hypothesis(tt),
            events(&vec![CELL_A; n_per_batch]),
        );
    }
    store.insert_sample(
        &SampleKey::new(SampleRole::NeymanObserved),
        events(&[CELL_A, CELL_B, CELL_A, CELL_A]),
    );

    let n_cal = 12;
    let cal_phi: Vec<f64> = (0..n_cal)
        .map(|i| if i % 3 == 0 { CELL_B } else { CELL_A })
        .collect();
    store.insert_sample(
        &SampleKey::new(SampleRole::CalibrationFeatures),
        events(&cal_phi),
    );
    store.insert_sample(
        &SampleKey::new(SampleRole::CalibrationWeights),
        Array2::from_shape_fn((n_thetas, n_cal), |(t, i)| 1.0 + 0.25 * ((t + i) % 3) as f64),
    );
}

fn histo_request(options: &[&str]) -> ExperimentRequest {
    ExperimentRequest {
        algorithm: Algorithm::Histo,
        point_by_point: false,
        smearing: false,
        x_indices: vec![DELTA_PHI_JJ_INDEX],
        neyman: true,
        binning: BinningMode::Fixed,
        options: RunOptions::parse(options),
    }
}

fn result(store: &MemoryStore, strategy: &str, name: &str) -> Array1<f64> {
    store
        .get_vector(&ResultKey::result(strategy, name))
        .unwrap_or_else(|e| panic!("missing result {name}: {e}"))
}

fn neyman(store: &MemoryStore, strategy: &str, name: &str) -> Array2<f64> {
    store
        .get(&ResultKey::neyman(strategy, name))
        .unwrap_or_else(|e| panic!("missing Neyman array {name}: {e}"))
}

#[test]
fn histogram_pipeline_reproduces_the_closed_form_llr() {
    let settings = line_settings();
    let mut store = MemoryStore::new();
    populate(&mut store, &settings);

    run_experiment(&mut store, &settings, &histo_request(&[])).unwrap();

    // Half of the test events sit in each cell, so the expected LLR is
    // -2 * n_expected * mean(log r).
    let llr = result(&store, "histo", "llr_histo_deltaphi");
    assert_eq!(llr.len(), 3);
    for t in 0..3 {
        let (r_a, r_b) = true_ratios(t);
        let expected = -2.0 * 10.0 * (r_a.ln() + r_b.ln()) / 2.0;
        assert_abs_diff_eq!(llr[t], expected, epsilon = 1e-3);
    }
    assert_abs_diff_eq!(llr[0], 0.0, epsilon = 1e-3);

    let mse = result(&store, "histo", "mse_logr_histo_deltaphi");
    let trimmed = result(&store, "histo", "trimmed_mse_logr_histo_deltaphi");
    let mse_train = result(&store, "histo", "mse_logr_train_histo_deltaphi");
    for t in 0..3 {
        assert!(mse[t] < 1e-8);
        assert!(trimmed[t] <= mse[t] + 1e-12);
        assert!(mse_train[t] < 1e-8);
    }
    let cross_entropy = result(&store, "histo", "cross_entropy_train_histo_deltaphi");
    assert!(cross_entropy.iter().all(|v| v.is_finite() && *v > 0.0));

    let r_trained = result(&store, "histo", "r_trained_histo_deltaphi");
    assert_abs_diff_eq!(r_trained[0], 1.6, epsilon = 1e-4);
    assert_abs_diff_eq!(r_trained[3], 0.4, epsilon = 1e-4);
    let r_nottrained = result(&store, "histo", "r_nottrained_histo_deltaphi");
    assert_abs_diff_eq!(r_nottrained[0], 0.4, epsilon = 1e-4);
    let r_illustration = result(&store, "histo", "r_illustration_histo_deltaphi");
    assert_eq!(r_illustration.len(), 2);
}

#[test]
fn histogram_neyman_arrays_have_skipped_rows() {
    let settings = line_settings();
    let mut store = MemoryStore::new();
    populate(&mut store, &settings);

    run_experiment(&mut store, &settings, &histo_request(&[])).unwrap();

    // For t = 0: tt = 0 is the diagonal and tt = 1 is observed. tt = 2 is a
    // full grid unit away and is skipped.
    let distribution = neyman(&store, "histo", "neyman_llr_distribution_histo_0_deltaphi");
    assert_eq!(distribution.shape(), &[3, 3]);
    assert!(distribution.row(0).iter().all(|v| v.is_finite()));
    assert!(distribution.row(1).iter().all(|v| v.is_finite()));
    assert!(distribution.row(2).iter().all(|v| v.is_nan()));

    // The estimator trained at the observed hypothesis scores every batch.
    let distribution = neyman(&store, "histo", "neyman_llr_distribution_histo_1_deltaphi");
    assert!(distribution.iter().all(|v| v.is_finite()));

    // Every toy of every batch sits in cell A: llr = -2 * 2 * ln(r_A).
    let distribution = neyman(&store, "histo", "neyman_llr_distribution_histo_2_deltaphi");
    let (r_a, _) = true_ratios(2);
    for &value in distribution.row(2) {
        assert_abs_diff_eq!(value, -4.0 * r_a.ln(), epsilon = 1e-3);
    }

    // Observed: two toys of two events, scored for every t.
    for t in 0..3 {
        let observed = neyman(
            &store,
            "histo",
            &format!("neyman_llr_observed_histo_{t}_deltaphi"),
        );
        assert_eq!(observed.shape(), &[2, 1]);
        let (r_a, r_b) = true_ratios(t);
        assert_abs_diff_eq!(observed[[0, 0]], -2.0 * (r_a.ln() + r_b.ln()), epsilon = 1e-3);
        assert_abs_diff_eq!(observed[[1, 0]], -4.0 * r_a.ln(), epsilon = 1e-3);
    }
}

#[test]
fn histogram_without_neyman_flag_writes_no_toy_arrays() {
    let settings = line_settings();
    let mut store = MemoryStore::new();
    populate(&mut store, &settings);

    let mut request = histo_request(&["finebinning"]);
    request.neyman = false;
    run_experiment(&mut store, &settings, &request).unwrap();

    let names = store.result_names();
    assert!(names.iter().all(|n| !n.starts_with("neyman/")));
    assert!(names.contains(&"results/histo/llr_histo_deltaphi_finebinning".to_string()));
}

#[test]
fn wrong_toy_batch_size_is_rejected() {
    let settings = line_settings();
    let mut store = MemoryStore::new();
    populate(&mut store, &settings);
    store.insert_sample(
        &SampleKey::new(SampleRole::NeymanDistribution).hypothesis(0),
        events(&[CELL_A; 5]),
    );

    let err = run_experiment(&mut store, &settings, &histo_request(&[])).unwrap_err();
    assert!(matches!(
        err,
        PipelineError::ToyCountMismatch {
            hypothesis: 0,
            found: 5,
            expected: 6,
            ..
        }
    ));
}

fn small_network(settings: &mut Settings) {
    settings.network.n_units = 4;
    settings.network.n_epochs_short = 2;
    settings.network.batch_size = 8;
    settings.network.learning_rate = 1e-2;
}

fn point_by_point_request(algorithm: Algorithm) -> ExperimentRequest {
    ExperimentRequest {
        algorithm,
        point_by_point: true,
        smearing: false,
        x_indices: vec![1, 41],
        neyman: false,
        binning: BinningMode::Adaptive,
        options: RunOptions::parse(&["short", "shallow"]),
    }
}

#[test]
fn carl_stores_raw_and_calibrated_series_and_interpolates_the_llr() {
    let mut settings = line_settings();
    small_network(&mut settings);
    settings.theta_benchmark_trained = 0;
    let mut store = MemoryStore::new();
    populate(&mut store, &settings);

    // Calibration and test events share one feature row per cell, and the
    // calibration weights are the true ratios of the hypothesis.
    let cal_phi: Vec<f64> = (0..12)
        .map(|i| if i % 3 == 0 { CELL_B } else { CELL_A })
        .collect();
    store.insert_sample(
        &SampleKey::new(SampleRole::CalibrationFeatures),
        cell_events(&cal_phi),
    );
    store.insert_sample(
        &SampleKey::new(SampleRole::CalibrationWeights),
        Array2::from_shape_fn((3, cal_phi.len()), |(t, i)| {
            let (r_a, r_b) = true_ratios(t);
            if cal_phi[i] == CELL_A { r_a } else { r_b }
        }),
    );
    store.insert_sample(
        &SampleKey::new(SampleRole::TestFeatures),
        cell_events(&[CELL_A, CELL_A, CELL_B, CELL_B]),
    );

    run_experiment(&mut store, &settings, &point_by_point_request(Algorithm::Carl)).unwrap();

    // Whether the raw scores separate the two cells or not, the calibrated
    // ratio averages to the closed form: the reference hypothesis gets zero
    // and hypothesis 2 gets -20 * ln(0.8).
    let raw = result(&store, "point_by_point", "llr_carl_shallow_short");
    let calibrated = result(&store, "point_by_point", "llr_carl_calibrated_shallow_short");
    let (r_a, r_b) = true_ratios(2);
    let closed_form = -10.0 * (r_a.ln() + r_b.ln());
    assert!(closed_form > 1.0);
    assert_abs_diff_eq!(calibrated[0], 0.0, epsilon = 1e-6);
    assert_abs_diff_eq!(calibrated[2], closed_form, epsilon = 1e-3);
    assert!(calibrated[2] > calibrated[0]);
    assert!((calibrated[2] - raw[2]).abs() > 1e-3);

    for series in ["carl", "carl_calibrated"] {
        let llr = result(&store, "point_by_point", &format!("llr_{series}_shallow_short"));
        assert_eq!(llr.len(), 3);
        assert!(llr.iter().all(|v| v.is_finite()));
        // The middle hypothesis is not trained and lies halfway between the
        // two training points.
        assert_abs_diff_eq!(llr[1], 0.5 * (llr[0] + llr[2]), epsilon = 1e-9);

        let mse = result(
            &store,
            "point_by_point",
            &format!("mse_logr_{series}_shallow_short"),
        );
        assert_eq!(mse.len(), 2);
    }

    let calvalues = result(&store, "point_by_point", "calvalues_trained_carl_shallow_short");
    assert_eq!(calvalues.len(), 12);
    assert!(calvalues.iter().all(|s| (0.0..=1.0).contains(s)));

    let names = store.result_names();
    for t in [0, 2] {
        for series in ["carl", "carl_calibrated"] {
            let name = format!(
                "neyman/point_by_point/neyman_llr_distribution_{series}_{t}_shallow_short"
            );
            assert!(names.contains(&name), "{name} missing");
        }
    }
    assert!(!names.iter().any(|n| n.contains("_1_shallow_short")));
}

#[test]
fn regression_has_no_calibrated_series() {
    let mut settings = line_settings();
    small_network(&mut settings);
    let mut store = MemoryStore::new();
    populate(&mut store, &settings);

    run_experiment(
        &mut store,
        &settings,
        &point_by_point_request(Algorithm::Regression),
    )
    .unwrap();

    let names = store.result_names();
    assert!(names.contains(&"results/point_by_point/llr_regression_shallow_short".to_string()));
    assert!(!names.iter().any(|n| n.contains("calibrated")));
    // Regression has no class score, so no training cross-entropy either.
    assert!(!names.iter().any(|n| n.contains("cross_entropy_train")));
}

#[test]
fn regression_rejects_infinite_training_targets() {
    let mut settings = line_settings();
    small_network(&mut settings);
    let mut store = MemoryStore::new();
    populate(&mut store, &settings);
    let mut r = Array1::from_elem(20, 1.0);
    r[4] = 0.0;
    store.insert_sample_vector(&SampleKey::new(SampleRole::TrainRatios).hypothesis(0), r);

    let err = run_experiment(
        &mut store,
        &settings,
        &point_by_point_request(Algorithm::Regression),
    )
    .unwrap_err();
    assert!(matches!(
        err,
        PipelineError::NonFiniteTrainingTarget {
            hypothesis: 0,
            row: 4
        }
    ));
}

#[test]
fn configuration_errors_stop_the_run_before_any_output() {
    let mut store = MemoryStore::new();
    let settings = line_settings();
    populate(&mut store, &settings);

    let mut bad = settings.clone();
    bad.theta_observed = 9;
    assert!(matches!(
        run_experiment(&mut store, &bad, &histo_request(&[])),
        Err(PipelineError::Settings(_))
    ));

    let mut request = histo_request(&[]);
    request.x_indices = vec![2, 3];
    assert!(matches!(
        run_experiment(&mut store, &settings, &request),
        Err(PipelineError::Binning(_))
    ));

    let mut request = point_by_point_request(Algorithm::Carl);
    request.point_by_point = false;
    assert!(matches!(
        run_experiment(&mut store, &settings, &request),
        Err(PipelineError::ParameterizedUnavailable(_))
    ));

    assert!(store.result_names().is_empty());
}

#[test]
fn missing_test_ratios_rows_are_reported() {
    let settings = line_settings();
    let mut store = MemoryStore::new();
    populate(&mut store, &settings);
    store.insert_sample(
        &SampleKey::new(SampleRole::TestRatios),
        array![[1.0, 1.0, 1.0, 1.0]],
    );

    let err = run_experiment(&mut store, &settings, &histo_request(&[])).unwrap_err();
    assert!(matches!(
        err,
        PipelineError::ShapeMismatch {
            expected: 3,
            found: 1,
            ..
        }
    ));
}
