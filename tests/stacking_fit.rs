use approx::assert_abs_diff_eq;
use gam_stack::{
    ParameterBlockInput, ReferenceExpert, StackingConfig, StackingFitOptions, StackingSpec,
    fit_stacking, log_score, mixture_log_density, normal_log_pdf, sigmoid,
};
use ndarray::{Array1, Array2, array};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};

struct TwoExpertData {
    x: Array1<f64>,
    log_densities: Array2<f64>,
}

/// Expert 0 is N(-2, 1), expert 1 is N(2, 1); expert 0 generates an
/// observation with probability sigmoid(slope * x).
fn simulate_two_experts(seed: u64, n: usize, slope: f64) -> TwoExpertData {
    let mut rng = StdRng::seed_from_u64(seed);
    let noise = Normal::new(0.0, 1.0).expect("normal");
    let mut x = Array1::<f64>::zeros(n);
    let mut log_densities = Array2::<f64>::zeros((n, 2));
    for i in 0..n {
        let xi = rng.random_range(-2.0..2.0);
        let from_first = rng.random::<f64>() < sigmoid(slope * xi);
        let mean = if from_first { -2.0 } else { 2.0 };
        let y = mean + noise.sample(&mut rng);
        x[i] = xi;
        log_densities[[i, 0]] = normal_log_pdf(y, -2.0, 1.0);
        log_densities[[i, 1]] = normal_log_pdf(y, 2.0, 1.0);
    }
    TwoExpertData { x, log_densities }
}

fn linear_design(x: &Array1<f64>) -> Array2<f64> {
    let mut design = Array2::<f64>::ones((x.len(), 2));
    design.column_mut(1).assign(x);
    design
}

fn linear_block(x: &Array1<f64>, slope_log_lambda: Option<f64>) -> ParameterBlockInput {
    let (penalties, log_lambdas) = match slope_log_lambda {
        Some(rho) => (vec![array![[0.0, 0.0], [0.0, 1.0]]], Some(array![rho])),
        None => (Vec::new(), None),
    };
    ParameterBlockInput {
        design: linear_design(x),
        offset: Array1::zeros(x.len()),
        penalties,
        log_lambdas,
        initial_beta: None,
    }
}

#[test]
fn recovers_covariate_dependent_weights() {
    let data = simulate_two_experts(42, 2000, 1.5);
    let fit = fit_stacking(
        StackingSpec {
            log_densities: data.log_densities.clone(),
            config: StackingConfig::default(),
            weights: None,
            blocks: vec![linear_block(&data.x, None)],
        },
        &StackingFitOptions::default(),
    )
    .expect("stacking fit");

    assert!(fit.fit.converged);
    let beta = fit.coefficients()[0];
    assert!((beta[0]).abs() < 0.3, "intercept {}", beta[0]);
    assert!((beta[1] - 1.5).abs() < 0.4, "slope {}", beta[1]);
    for row in fit.mixing_weights.rows() {
        assert_abs_diff_eq!(row.sum(), 1.0, epsilon = 1e-12);
    }

    let design = linear_design(&data.x);
    let se = fit
        .eta_standard_errors(&[design.view()])
        .expect("standard errors");
    assert!(se.iter().all(|v| v.is_finite() && *v > 0.0));
}

#[test]
fn strong_penalty_shrinks_slope() {
    let data = simulate_two_experts(5, 800, 1.5);
    let fit = fit_stacking(
        StackingSpec {
            log_densities: data.log_densities,
            config: StackingConfig::default(),
            weights: None,
            blocks: vec![linear_block(&data.x, Some(12.0))],
        },
        &StackingFitOptions::default(),
    )
    .expect("penalized fit");
    assert!(fit.fit.converged);
    assert!(fit.coefficients()[0][1].abs() < 0.05);
    assert_abs_diff_eq!(fit.fit.lambdas[0], 12f64.exp(), epsilon = 1e-6);
}

#[test]
fn fitted_weights_do_not_depend_on_reference_expert() {
    let data = simulate_two_experts(9, 600, -1.0);
    let fit_with = |reference| {
        fit_stacking(
            StackingSpec {
                log_densities: data.log_densities.clone(),
                config: StackingConfig {
                    reference,
                    ..StackingConfig::default()
                },
                weights: None,
                blocks: vec![linear_block(&data.x, None)],
            },
            &StackingFitOptions::default(),
        )
        .expect("stacking fit")
    };
    let last = fit_with(ReferenceExpert::Last);
    let first = fit_with(ReferenceExpert::Index(0));
    for (a, b) in last.mixing_weights.iter().zip(first.mixing_weights.iter()) {
        assert_abs_diff_eq!(a, b, epsilon = 1e-5);
    }
    assert_abs_diff_eq!(last.fit.log_likelihood, first.fit.log_likelihood, epsilon = 1e-6);
}

#[test]
fn stacked_density_beats_single_experts_on_held_out_data() {
    let train = simulate_two_experts(100, 1500, 2.0);
    let test = simulate_two_experts(101, 1500, 2.0);
    let fit = fit_stacking(
        StackingSpec {
            log_densities: train.log_densities,
            config: StackingConfig::default(),
            weights: None,
            blocks: vec![linear_block(&train.x, Some(-2.0))],
        },
        &StackingFitOptions::default(),
    )
    .expect("stacking fit");

    let design = linear_design(&test.x);
    let stacked = fit
        .predict_log_density(&[design.view()], None, test.log_densities.view())
        .expect("predict");
    let uniform = Array2::from_elem(test.log_densities.dim(), 0.5);
    let uniform_mix =
        mixture_log_density(uniform.view(), test.log_densities.view()).expect("uniform mixture");

    let stacked_score = log_score(stacked.view());
    assert!(stacked_score > log_score(uniform_mix.view()));
    assert!(stacked_score > log_score(test.log_densities.column(0)));
    assert!(stacked_score > log_score(test.log_densities.column(1)));

    let weights = fit.predict_weights(&[design.view()], None).expect("weights");
    assert_eq!(weights.dim(), (1500, 2));
}

#[test]
fn intercept_only_three_expert_fit_matches_generating_weights() {
    let mut rng = StdRng::seed_from_u64(77);
    let noise = Normal::new(0.0, 1.0).expect("normal");
    let truth = [0.5, 0.3, 0.2];
    let means = [-3.0, 0.0, 3.0];
    let n = 3000;
    let mut l = Array2::<f64>::zeros((n, 3));
    for i in 0..n {
        let u = rng.random::<f64>();
        let k = if u < truth[0] {
            0
        } else if u < truth[0] + truth[1] {
            1
        } else {
            2
        };
        let y = means[k] + noise.sample(&mut rng);
        for j in 0..3 {
            l[[i, j]] = normal_log_pdf(y, means[j], 1.0);
        }
    }
    let intercept = || ParameterBlockInput {
        design: Array2::ones((n, 1)),
        offset: Array1::zeros(n),
        penalties: Vec::new(),
        log_lambdas: None,
        initial_beta: None,
    };
    let fit = fit_stacking(
        StackingSpec {
            log_densities: l,
            config: StackingConfig::default(),
            weights: None,
            blocks: vec![intercept(), intercept()],
        },
        &StackingFitOptions::default(),
    )
    .expect("three expert fit");
    assert!(fit.fit.converged);
    for (k, &w) in truth.iter().enumerate() {
        assert!(
            (fit.mixing_weights[[0, k]] - w).abs() < 0.05,
            "expert {k}: fitted {} vs {w}",
            fit.mixing_weights[[0, k]]
        );
    }
}

#[test]
fn prior_weight_two_matches_duplicated_observation() {
    let data = simulate_two_experts(21, 300, 1.2);
    let n = data.x.len();
    let dup = 3;

    let mut weights = Array1::<f64>::ones(n);
    weights[dup] = 2.0;
    let weighted = fit_stacking(
        StackingSpec {
            log_densities: data.log_densities.clone(),
            config: StackingConfig::default(),
            weights: Some(weights),
            blocks: vec![linear_block(&data.x, Some(0.5))],
        },
        &StackingFitOptions::default(),
    )
    .expect("weighted fit");

    let mut x = data.x.to_vec();
    x.push(data.x[dup]);
    let x = Array1::from(x);
    let mut l = Array2::<f64>::zeros((n + 1, 2));
    l.slice_mut(ndarray::s![..n, ..]).assign(&data.log_densities);
    l.row_mut(n).assign(&data.log_densities.row(dup));
    let duplicated = fit_stacking(
        StackingSpec {
            log_densities: l,
            config: StackingConfig::default(),
            weights: None,
            blocks: vec![linear_block(&x, Some(0.5))],
        },
        &StackingFitOptions::default(),
    )
    .expect("duplicated fit");

    assert!(weighted.fit.converged && duplicated.fit.converged);
    let (a, b) = (weighted.coefficients()[0], duplicated.coefficients()[0]);
    assert_abs_diff_eq!(a[0], b[0], epsilon = 1e-6);
    assert_abs_diff_eq!(a[1], b[1], epsilon = 1e-6);
    assert_abs_diff_eq!(
        weighted.fit.log_likelihood,
        duplicated.fit.log_likelihood,
        epsilon = 1e-8
    );
    let (ca, cb) = (
        weighted.fit.covariance_conditional.as_ref().expect("covariance"),
        duplicated.fit.covariance_conditional.as_ref().expect("covariance"),
    );
    for (u, v) in ca.iter().zip(cb.iter()) {
        assert_abs_diff_eq!(u, v, epsilon = 1e-8);
    }
}

#[test]
fn degenerate_training_rows_are_skipped() {
    let mut data = simulate_two_experts(13, 400, 1.0);
    data.log_densities
        .row_mut(7)
        .fill(f64::NEG_INFINITY);
    let fit = fit_stacking(
        StackingSpec {
            log_densities: data.log_densities,
            config: StackingConfig::default(),
            weights: None,
            blocks: vec![linear_block(&data.x, None)],
        },
        &StackingFitOptions::default(),
    )
    .expect("fit with a degenerate row");
    assert!(fit.fit.log_likelihood.is_finite());
    assert!(fit.fit.converged);
}

#[test]
fn design_row_mismatch_is_reported() {
    let data = simulate_two_experts(1, 50, 1.0);
    let short_x = data.x.slice(ndarray::s![..49]).to_owned();
    let err = fit_stacking(
        StackingSpec {
            log_densities: data.log_densities,
            config: StackingConfig::default(),
            weights: None,
            blocks: vec![linear_block(&short_x, None)],
        },
        &StackingFitOptions::default(),
    )
    .unwrap_err();
    assert!(err.contains("expected 50 rows, found 49"), "{err}");
}

#[test]
fn wrong_block_count_is_reported() {
    let data = simulate_two_experts(2, 20, 1.0);
    let err = fit_stacking(
        StackingSpec {
            log_densities: data.log_densities,
            config: StackingConfig::default(),
            weights: None,
            blocks: vec![linear_block(&data.x, None), linear_block(&data.x, None)],
        },
        &StackingFitOptions::default(),
    )
    .unwrap_err();
    assert!(err.contains("needs 1 predictor blocks, got 2"), "{err}");
}
