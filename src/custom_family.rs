use crate::faer_ndarray::{FaerCholesky, FaerSolve, solve_spd, solve_symmetric, to_faer_mat};
use crate::types::StackingFitOptions;
use ndarray::{Array1, Array2, s};

/// Static specification for one parameter block in a custom family.
#[derive(Clone, Debug)]
pub struct ParameterBlockSpec {
    pub name: String,
    pub design: Array2<f64>,
    pub offset: Array1<f64>,
    /// Block-local penalty matrices (all p_block x p_block).
    pub penalties: Vec<Array2<f64>>,
    /// Log-smoothing parameters for this block (same length as `penalties`).
    /// They are held fixed during the fit.
    pub log_lambdas: Array1<f64>,
    /// Optional initial coefficients (defaults to zeros if omitted).
    pub initial_beta: Option<Array1<f64>>,
}

/// Current state for a parameter block.
#[derive(Clone, Debug)]
pub struct ParameterBlockState {
    pub beta: Array1<f64>,
    pub eta: Array1<f64>,
}

/// Working quantities supplied by a custom family for one block.
#[derive(Clone, Debug)]
pub enum BlockWorkingSet {
    /// Standard IRLS/GLM-style diagonal working set for eta-space updates.
    Diagonal {
        /// IRLS pseudo-response for this block's linear predictor.
        working_response: Array1<f64>,
        /// IRLS working weights for this block (non-negative, length n).
        working_weights: Array1<f64>,
    },
    /// Exact Newton block update in coefficient space.
    ///
    /// `gradient` is ∇ log L wrt block coefficients.
    /// `hessian` is -∇² log L wrt block coefficients. Families that implement
    /// [`CustomFamily::exact_newton_joint_hessian`] may leave it at zero, since
    /// the joint matrix replaces it.
    ExactNewton {
        gradient: Array1<f64>,
        hessian: Array2<f64>,
    },
}

/// Family evaluation over all parameter blocks.
#[derive(Clone, Debug)]
pub struct FamilyEvaluation {
    pub log_likelihood: f64,
    pub block_working_sets: Vec<BlockWorkingSet>,
}

/// User-defined family contract for multi-block generalized models.
pub trait CustomFamily {
    /// Evaluate log-likelihood and per-block working quantities at current block predictors.
    fn evaluate(&self, block_states: &[ParameterBlockState]) -> Result<FamilyEvaluation, String>;

    /// Optional exact joint coefficient-space Hessian across all blocks.
    ///
    /// Returns the unpenalized matrix `H = -∇² log L` in the flattened block order.
    fn exact_newton_joint_hessian(
        &self,
        _block_states: &[ParameterBlockState],
    ) -> Result<Option<Array2<f64>>, String> {
        Ok(None)
    }
}

#[derive(Clone, Debug)]
pub struct BlockwiseFitResult {
    pub block_states: Vec<ParameterBlockState>,
    pub log_likelihood: f64,
    pub lambdas: Array1<f64>,
    /// `-loglik + ½ Σ λ βᵀSβ` at the returned coefficients.
    pub penalized_objective: f64,
    /// Inverse penalized Hessian in flattened block order, when it is positive definite.
    pub covariance_conditional: Option<Array2<f64>>,
    pub iterations: usize,
    pub converged: bool,
}

fn validate_block_specs(specs: &[ParameterBlockSpec]) -> Result<usize, String> {
    if specs.is_empty() {
        return Err("fit_custom_family requires at least one parameter block".to_string());
    }
    let n = specs[0].design.nrows();
    for (b, spec) in specs.iter().enumerate() {
        if spec.design.nrows() != n {
            return Err(format!(
                "block {b} row mismatch: got {}, expected {n}",
                spec.design.nrows()
            ));
        }
        if spec.offset.len() != n {
            return Err(format!(
                "block {b} offset length mismatch: got {}, expected {n}",
                spec.offset.len()
            ));
        }
        let p = spec.design.ncols();
        if let Some(beta0) = &spec.initial_beta
            && beta0.len() != p
        {
            return Err(format!(
                "block {b} initial_beta length mismatch: got {}, expected {p}",
                beta0.len()
            ));
        }
        if spec.log_lambdas.len() != spec.penalties.len() {
            return Err(format!(
                "block {b} log_lambdas length {} does not match penalties {}",
                spec.log_lambdas.len(),
                spec.penalties.len()
            ));
        }
        if spec.log_lambdas.iter().any(|v| !v.is_finite()) {
            return Err(format!("block {b} log_lambdas must be finite"));
        }
        for (k, s) in spec.penalties.iter().enumerate() {
            let (r, c) = s.dim();
            if r != p || c != p {
                return Err(format!(
                    "block {b} penalty {k} must be {p}x{p}, got {r}x{c}"
                ));
            }
        }
    }
    Ok(n)
}

fn block_param_ranges(specs: &[ParameterBlockSpec]) -> Vec<(usize, usize)> {
    let mut ranges = Vec::with_capacity(specs.len());
    let mut at = 0usize;
    for spec in specs {
        let p = spec.design.ncols();
        ranges.push((at, at + p));
        at += p;
    }
    ranges
}

/// Σ_k λ_k S_k for each block.
fn block_penalty_matrices(specs: &[ParameterBlockSpec]) -> Vec<Array2<f64>> {
    specs
        .iter()
        .map(|spec| {
            let p = spec.design.ncols();
            let mut s_lambda = Array2::<f64>::zeros((p, p));
            for (s_k, &rho) in spec.penalties.iter().zip(spec.log_lambdas.iter()) {
                s_lambda.scaled_add(rho.exp(), s_k);
            }
            s_lambda
        })
        .collect()
}

fn build_block_states(specs: &[ParameterBlockSpec]) -> Vec<ParameterBlockState> {
    specs
        .iter()
        .map(|spec| {
            let beta = spec
                .initial_beta
                .clone()
                .unwrap_or_else(|| Array1::<f64>::zeros(spec.design.ncols()));
            let eta = spec.design.dot(&beta) + &spec.offset;
            ParameterBlockState { beta, eta }
        })
        .collect()
}

fn states_from_flat_beta(
    specs: &[ParameterBlockSpec],
    ranges: &[(usize, usize)],
    flat: &Array1<f64>,
) -> Vec<ParameterBlockState> {
    specs
        .iter()
        .zip(ranges)
        .map(|(spec, &(start, end))| {
            let beta = flat.slice(s![start..end]).to_owned();
            let eta = spec.design.dot(&beta) + &spec.offset;
            ParameterBlockState { beta, eta }
        })
        .collect()
}

fn flatten_state_betas(states: &[ParameterBlockState], total: usize) -> Array1<f64> {
    let mut out = Array1::<f64>::zeros(total);
    let mut at = 0usize;
    for state in states {
        let p = state.beta.len();
        out.slice_mut(s![at..at + p]).assign(&state.beta);
        at += p;
    }
    out
}

fn total_quadratic_penalty(states: &[ParameterBlockState], s_lambdas: &[Array2<f64>]) -> f64 {
    states
        .iter()
        .zip(s_lambdas)
        .map(|(state, s_lambda)| 0.5 * state.beta.dot(&s_lambda.dot(&state.beta)))
        .sum()
}

/// Coefficient-space gradient and curvature of a single block's working set.
fn block_newton_terms(
    spec: &ParameterBlockSpec,
    state: &ParameterBlockState,
    working_set: &BlockWorkingSet,
) -> Result<(Array1<f64>, Array2<f64>), String> {
    let x = &spec.design;
    let (n, p) = x.dim();
    match working_set {
        BlockWorkingSet::Diagonal {
            working_response,
            working_weights,
        } => {
            if working_response.len() != n || working_weights.len() != n {
                return Err(format!(
                    "block '{}' diagonal working set has wrong length",
                    spec.name
                ));
            }
            // Score X'W(z - eta) and Fisher curvature X'WX.
            let mut xw = x.clone();
            let mut score_eta = Array1::<f64>::zeros(n);
            for i in 0..n {
                let wi = working_weights[i].max(0.0);
                score_eta[i] = wi * (working_response[i] - state.eta[i]);
                let mut row = xw.row_mut(i);
                row *= wi;
            }
            Ok((x.t().dot(&score_eta), x.t().dot(&xw)))
        }
        BlockWorkingSet::ExactNewton { gradient, hessian } => {
            if gradient.len() != p || hessian.dim() != (p, p) {
                return Err(format!(
                    "block '{}' exact Newton working set must have gradient {p} and hessian {p}x{p}",
                    spec.name
                ));
            }
            Ok((gradient.clone(), hessian.clone()))
        }
    }
}

fn assemble_newton_system<F: CustomFamily>(
    family: &F,
    specs: &[ParameterBlockSpec],
    ranges: &[(usize, usize)],
    states: &[ParameterBlockState],
    evaluation: &FamilyEvaluation,
    s_lambdas: &[Array2<f64>],
    total: usize,
) -> Result<(Array1<f64>, Array2<f64>), String> {
    if evaluation.block_working_sets.len() != specs.len() {
        return Err(format!(
            "family returned {} working sets for {} blocks",
            evaluation.block_working_sets.len(),
            specs.len()
        ));
    }
    let mut gradient = Array1::<f64>::zeros(total);
    let mut hessian = Array2::<f64>::zeros((total, total));
    for (b, spec) in specs.iter().enumerate() {
        let (start, end) = ranges[b];
        let (g, h) = block_newton_terms(spec, &states[b], &evaluation.block_working_sets[b])?;
        gradient.slice_mut(s![start..end]).assign(&g);
        hessian.slice_mut(s![start..end, start..end]).assign(&h);
    }
    if let Some(joint) = family.exact_newton_joint_hessian(states)? {
        if joint.dim() != (total, total) {
            return Err(format!(
                "joint Hessian must be {total}x{total}, got {}x{}",
                joint.nrows(),
                joint.ncols()
            ));
        }
        hessian = joint;
    }
    // Gradient of the penalized objective's negative, and its curvature.
    for (b, s_lambda) in s_lambdas.iter().enumerate() {
        let (start, end) = ranges[b];
        let penalty_grad = s_lambda.dot(&states[b].beta);
        let mut g = gradient.slice_mut(s![start..end]);
        g -= &penalty_grad;
        let mut h = hessian.slice_mut(s![start..end, start..end]);
        h += s_lambda;
    }
    Ok((gradient, hessian))
}

/// Newton direction for `hessian · delta = gradient`, adding ridge until the
/// system is positive definite.
fn newton_direction(
    hessian: &Array2<f64>,
    gradient: &Array1<f64>,
    ridge_floor: f64,
) -> Result<Array1<f64>, String> {
    let p = hessian.nrows();
    let scale = (0..p)
        .map(|i| hessian[[i, i]].abs())
        .fold(0.0_f64, f64::max)
        .max(1.0);
    let mut ridge = 0.0_f64;
    for attempt in 0..12 {
        let mut h = hessian.clone();
        for i in 0..p {
            h[[i, i]] += ridge;
        }
        if let Ok(delta) = solve_spd(&h, gradient) {
            if attempt > 0 {
                log::debug!("Newton system stabilized with ridge {:.1e}.", ridge);
            }
            return Ok(delta);
        }
        ridge = if ridge == 0.0 {
            ridge_floor.max(1e-12) * scale
        } else {
            ridge * 10.0
        };
    }
    log::debug!("Newton system not positive definite; using symmetric indefinite solve.");
    solve_symmetric(hessian, gradient).map_err(|e| e.to_string())
}

fn inverse_spd(matrix: &Array2<f64>) -> Option<Array2<f64>> {
    let p = matrix.nrows();
    let llt = matrix.cholesky_factor().ok()?;
    let mut rhs = to_faer_mat(&Array2::<f64>::eye(p));
    llt.solve_in_place(rhs.as_mut());
    let inv = Array2::from_shape_fn((p, p), |(i, j)| rhs[(i, j)]);
    inv.iter().all(|v| v.is_finite()).then_some(inv)
}

fn penalized_objective(log_likelihood: f64, penalty: f64) -> f64 {
    -log_likelihood + penalty
}

/// Fit a multi-block custom family by penalized Newton iterations at fixed
/// smoothing parameters.
///
/// Trial steps whose objective is non-finite or worse than the current one
/// are halved; the fit stops without converging when halving runs out.
pub fn fit_custom_family<F: CustomFamily>(
    family: &F,
    specs: &[ParameterBlockSpec],
    options: &StackingFitOptions,
) -> Result<BlockwiseFitResult, String> {
    validate_block_specs(specs)?;
    let ranges = block_param_ranges(specs);
    let total = ranges.last().map(|&(_, end)| end).unwrap_or(0);
    let s_lambdas = block_penalty_matrices(specs);
    let lambdas = Array1::from_iter(
        specs
            .iter()
            .flat_map(|spec| spec.log_lambdas.iter().map(|rho| rho.exp())),
    );

    let mut states = build_block_states(specs);
    let mut evaluation = family.evaluate(&states)?;
    let mut objective =
        penalized_objective(evaluation.log_likelihood, total_quadratic_penalty(&states, &s_lambdas));
    if !objective.is_finite() {
        return Err(format!(
            "custom-family objective is non-finite at the initial coefficients ({objective})"
        ));
    }

    let mut converged = false;
    let mut iterations = 0usize;
    let mut last_hessian: Option<Array2<f64>> = None;

    while iterations < options.max_iter {
        let (gradient, hessian) = assemble_newton_system(
            family,
            specs,
            &ranges,
            &states,
            &evaluation,
            &s_lambdas,
            total,
        )?;
        let grad_norm = gradient.iter().fold(0.0_f64, |acc, v| acc.max(v.abs()));
        last_hessian = Some(hessian.clone());
        if grad_norm <= options.tol {
            converged = true;
            break;
        }
        iterations += 1;

        let delta = newton_direction(&hessian, &gradient, options.ridge_floor)?;
        let beta = flatten_state_betas(&states, total);

        let mut step = 1.0;
        let mut accepted = None;
        for _ in 0..=options.max_step_halvings {
            let trial_beta = &beta + &(&delta * step);
            let trial_states = states_from_flat_beta(specs, &ranges, &trial_beta);
            match family.evaluate(&trial_states) {
                Ok(trial_eval) => {
                    let trial_obj = penalized_objective(
                        trial_eval.log_likelihood,
                        total_quadratic_penalty(&trial_states, &s_lambdas),
                    );
                    if trial_obj.is_finite() && trial_obj <= objective + 1e-12 * objective.abs() {
                        accepted = Some((trial_states, trial_eval, trial_obj));
                        break;
                    }
                }
                Err(e) => {
                    log::debug!("trial step {step:.3e} rejected: {e}");
                }
            }
            step *= 0.5;
        }

        let Some((new_states, new_eval, new_obj)) = accepted else {
            log::debug!(
                "step halving exhausted at iteration {iterations} (objective {objective:.6e}, |g|={grad_norm:.3e})"
            );
            break;
        };

        let change = (objective - new_obj).abs();
        log::debug!(
            "iteration {iterations}: objective {new_obj:.10e}, step {step:.3e}, |g|={grad_norm:.3e}"
        );
        states = new_states;
        evaluation = new_eval;
        objective = new_obj;
        if change <= options.tol * (objective.abs() + 1.0) {
            converged = true;
            let (_, hessian) = assemble_newton_system(
                family,
                specs,
                &ranges,
                &states,
                &evaluation,
                &s_lambdas,
                total,
            )?;
            last_hessian = Some(hessian);
            break;
        }
    }

    if !converged {
        log::warn!(
            "custom-family fit did not converge after {iterations} iterations (objective {objective:.6e})"
        );
    }

    let covariance_conditional = last_hessian.as_ref().and_then(inverse_spd);

    Ok(BlockwiseFitResult {
        block_states: states,
        log_likelihood: evaluation.log_likelihood,
        lambdas,
        penalized_objective: objective,
        covariance_conditional,
        iterations,
        converged,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[derive(Clone)]
    struct OneBlockGaussianFamily {
        y: Array1<f64>,
    }

    impl CustomFamily for OneBlockGaussianFamily {
        fn evaluate(
            &self,
            block_states: &[ParameterBlockState],
        ) -> Result<FamilyEvaluation, String> {
            let eta = &block_states[0].eta;
            let resid = eta - &self.y;
            let ll = -0.5 * resid.dot(&resid);
            Ok(FamilyEvaluation {
                log_likelihood: ll,
                block_working_sets: vec![BlockWorkingSet::Diagonal {
                    working_response: self.y.clone(),
                    working_weights: Array1::ones(self.y.len()),
                }],
            })
        }
    }

    /// Two exact-Newton blocks for `-½(b0 - 1)² - ½(b1 + 2)² - ρ b0 b1`.
    #[derive(Clone)]
    struct CoupledQuadraticFamily {
        rho: f64,
    }

    impl CustomFamily for CoupledQuadraticFamily {
        fn evaluate(
            &self,
            block_states: &[ParameterBlockState],
        ) -> Result<FamilyEvaluation, String> {
            let b0 = block_states[0].beta[0];
            let b1 = block_states[1].beta[0];
            let ll = -0.5 * (b0 - 1.0).powi(2) - 0.5 * (b1 + 2.0).powi(2) - self.rho * b0 * b1;
            Ok(FamilyEvaluation {
                log_likelihood: ll,
                block_working_sets: vec![
                    BlockWorkingSet::ExactNewton {
                        gradient: array![-(b0 - 1.0) - self.rho * b1],
                        hessian: array![[1.0]],
                    },
                    BlockWorkingSet::ExactNewton {
                        gradient: array![-(b1 + 2.0) - self.rho * b0],
                        hessian: array![[1.0]],
                    },
                ],
            })
        }

        fn exact_newton_joint_hessian(
            &self,
            _block_states: &[ParameterBlockState],
        ) -> Result<Option<Array2<f64>>, String> {
            Ok(Some(array![[1.0, self.rho], [self.rho, 1.0]]))
        }
    }

    fn intercept_spec(name: &str, n: usize, penalty: Option<f64>) -> ParameterBlockSpec {
        let (penalties, log_lambdas) = match penalty {
            Some(rho) => (vec![Array2::eye(1)], array![rho]),
            None => (Vec::new(), Array1::zeros(0)),
        };
        ParameterBlockSpec {
            name: name.to_string(),
            design: Array2::from_elem((n, 1), 1.0),
            offset: Array1::zeros(n),
            penalties,
            log_lambdas,
            initial_beta: None,
        }
    }

    #[test]
    fn penalized_gaussian_intercept_matches_closed_form() {
        let y = array![0.4, -0.2, 0.8, 1.0, -0.5, 0.3, 0.1, -0.7];
        let n = y.len();
        let lambda = 2.0_f64;
        let spec = intercept_spec("b0", n, Some(lambda.ln()));
        let fit = fit_custom_family(
            &OneBlockGaussianFamily { y: y.clone() },
            std::slice::from_ref(&spec),
            &StackingFitOptions::default(),
        )
        .expect("gaussian fit");
        assert!(fit.converged);
        let expected = y.sum() / (n as f64 + lambda);
        assert_abs_diff_eq!(fit.block_states[0].beta[0], expected, epsilon = 1e-8);
        assert_abs_diff_eq!(fit.lambdas[0], lambda, epsilon = 1e-12);
        let cov = fit.covariance_conditional.expect("covariance");
        assert_abs_diff_eq!(cov[[0, 0]], 1.0 / (n as f64 + lambda), epsilon = 1e-10);
    }

    #[test]
    fn joint_hessian_drives_coupled_blocks_to_optimum() {
        let rho = 0.5;
        let specs = vec![intercept_spec("a", 3, None), intercept_spec("b", 3, None)];
        let fit = fit_custom_family(
            &CoupledQuadraticFamily { rho },
            &specs,
            &StackingFitOptions::default(),
        )
        .expect("coupled fit");
        // Stationary point of the coupled quadratic.
        let det = 1.0 - rho * rho;
        let b0 = (1.0 + 2.0 * rho) / det;
        let b1 = (-2.0 - rho) / det;
        assert!(fit.converged);
        assert_abs_diff_eq!(fit.block_states[0].beta[0], b0, epsilon = 1e-8);
        assert_abs_diff_eq!(fit.block_states[1].beta[0], b1, epsilon = 1e-8);
        assert!(fit.iterations <= 2);
    }

    #[test]
    fn block_spec_validation_names_the_mismatch() {
        let mut spec = intercept_spec("b0", 4, Some(0.0));
        spec.offset = Array1::zeros(3);
        let err = fit_custom_family(
            &OneBlockGaussianFamily { y: Array1::zeros(4) },
            std::slice::from_ref(&spec),
            &StackingFitOptions::default(),
        )
        .unwrap_err();
        assert!(err.contains("offset length mismatch"), "{err}");

        let mut spec = intercept_spec("b0", 4, Some(0.0));
        spec.penalties = vec![Array2::eye(2)];
        let err = fit_custom_family(
            &OneBlockGaussianFamily { y: Array1::zeros(4) },
            std::slice::from_ref(&spec),
            &StackingFitOptions::default(),
        )
        .unwrap_err();
        assert!(err.contains("penalty 0 must be 1x1"), "{err}");
    }

    #[test]
    fn newton_direction_adds_ridge_for_indefinite_curvature() {
        let h = array![[1.0, 0.0], [0.0, -1e-3]];
        let g = array![1.0, 0.0];
        let delta = newton_direction(&h, &g, 1e-10).expect("direction");
        assert!(delta.iter().all(|v| v.is_finite()));
        assert!(delta.dot(&g) > 0.0);
    }
}
