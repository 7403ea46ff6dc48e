//! Probabilistic additive stacking family.
//!
//! `K` experts supply fixed per-observation log-densities `L`. The stacked
//! density of observation `i` is `Σ_k w_ik exp(L_ik)` where the mixing weights
//! are a multinomial-logit transform of `K-1` linear predictors, with one
//! reference expert pinned at zero.

use crate::custom_family::{
    BlockWorkingSet, BlockwiseFitResult, CustomFamily, FamilyEvaluation, ParameterBlockSpec,
    ParameterBlockState, fit_custom_family,
};
use crate::faer_ndarray::solve_spd;
use crate::probability::{log_sum_exp, softmax_into};
use crate::types::{ReferenceExpert, StackingConfig, StackingFitOptions};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, ArrayViewMut1, Zip};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum StackingError {
    #[error("stacking requires at least 2 experts, but the log-density matrix has {found} column(s)")]
    TooFewExperts { found: usize },

    #[error("log-density for expert {expert} at observation {row} is {value}; only finite values or -inf are allowed")]
    NonFiniteLogDensity { row: usize, expert: usize, value: f64 },

    #[error("reference expert {reference} is out of range for {experts} experts")]
    ReferenceOutOfRange { reference: usize, experts: usize },

    #[error("{context}: expected {expected} rows, found {found}")]
    RowMismatch {
        context: &'static str,
        expected: usize,
        found: usize,
    },

    #[error("{context}: expected {expected} columns, found {found}")]
    ColumnMismatch {
        context: &'static str,
        expected: usize,
        found: usize,
    },

    #[error("linear predictor at observation {row}, column {column} is not finite")]
    NonFiniteLinearPredictor { row: usize, column: usize },

    #[error("prior weight at observation {row} is {value}; weights must be finite and non-negative")]
    InvalidPriorWeight { row: usize, value: f64 },
}

/// An observation whose log-density is `-inf` under every expert.
///
/// Its log-likelihood is `-inf` regardless of the linear predictors, and its
/// gradient and Hessian are reported as zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DegenerateRow {
    pub index: usize,
}

/// Index of `(a, b)` in a row-major packed upper triangle of an `m x m` matrix.
#[inline]
pub fn packed_index(m: usize, a: usize, b: usize) -> usize {
    let (a, b) = if a <= b { (a, b) } else { (b, a) };
    a * (2 * m - a + 1) / 2 + (b - a)
}

#[inline]
pub fn packed_len(m: usize) -> usize {
    m * (m + 1) / 2
}

/// Row-wise output of [`StackingFamily::evaluate`].
#[derive(Debug, Clone)]
pub struct StackingEvaluation {
    /// `ll_i = log Σ_k w_ik exp(L_ik)`.
    pub loglik: Array1<f64>,
    /// `n x (K-1)` score `p_ik - w_ik` for each free expert.
    pub gradient: Array2<f64>,
    /// Per-row negative second derivative of `ll_i` over the free linear
    /// predictors, packed as the upper triangle (`n x (K-1)K/2`).
    pub hessian: Array2<f64>,
    pub degenerate_rows: Vec<DegenerateRow>,
}

impl StackingEvaluation {
    pub fn num_linear_predictors(&self) -> usize {
        self.gradient.ncols()
    }

    /// Sum of the finite row log-likelihoods.
    pub fn finite_log_likelihood(&self) -> f64 {
        self.loglik.iter().filter(|v| v.is_finite()).sum()
    }

    #[inline]
    pub fn hessian_entry(&self, row: usize, a: usize, b: usize) -> f64 {
        self.hessian[[row, packed_index(self.num_linear_predictors(), a, b)]]
    }

    /// Dense `(K-1) x (K-1)` Hessian of one observation.
    pub fn hessian_row(&self, row: usize) -> Array2<f64> {
        let m = self.num_linear_predictors();
        Array2::from_shape_fn((m, m), |(a, b)| self.hessian_entry(row, a, b))
    }
}

/// Stacking family over a shared, read-only expert log-density matrix.
#[derive(Debug, Clone)]
pub struct StackingFamily {
    log_densities: Arc<Array2<f64>>,
    reference: usize,
    config: StackingConfig,
}

/// Build a stacking family from an `n x K` log-density matrix.
///
/// `reference_index` is 0-based and defaults to the last expert.
pub fn make_stacking_family(
    log_densities: Array2<f64>,
    reference_index: Option<usize>,
) -> Result<StackingFamily, StackingError> {
    let reference = match reference_index {
        Some(k) => ReferenceExpert::Index(k),
        None => ReferenceExpert::Last,
    };
    StackingFamily::new(
        log_densities,
        StackingConfig {
            reference,
            ..StackingConfig::default()
        },
    )
}

impl StackingFamily {
    pub fn new(log_densities: Array2<f64>, config: StackingConfig) -> Result<Self, StackingError> {
        Self::from_shared(Arc::new(log_densities), config)
    }

    pub fn from_shared(
        log_densities: Arc<Array2<f64>>,
        config: StackingConfig,
    ) -> Result<Self, StackingError> {
        let experts = log_densities.ncols();
        if experts < 2 {
            return Err(StackingError::TooFewExperts { found: experts });
        }
        for ((row, expert), &value) in log_densities.indexed_iter() {
            if value.is_nan() || value == f64::INFINITY {
                return Err(StackingError::NonFiniteLogDensity { row, expert, value });
            }
        }
        let reference = config.reference.resolve(experts);
        if reference >= experts {
            return Err(StackingError::ReferenceOutOfRange { reference, experts });
        }
        Ok(Self {
            log_densities,
            reference,
            config,
        })
    }

    pub fn num_experts(&self) -> usize {
        self.log_densities.ncols()
    }

    pub fn num_observations(&self) -> usize {
        self.log_densities.nrows()
    }

    /// Number of free linear predictors, `K - 1`.
    pub fn num_linear_predictors(&self) -> usize {
        self.num_experts() - 1
    }

    pub fn reference(&self) -> usize {
        self.reference
    }

    pub fn config(&self) -> &StackingConfig {
        &self.config
    }

    pub fn log_densities(&self) -> ArrayView2<'_, f64> {
        self.log_densities.view()
    }

    /// Expert driven by linear-predictor column `column` (the reference is skipped).
    #[inline]
    pub fn expert_for_column(&self, column: usize) -> usize {
        expert_for_column(column, self.reference)
    }

    /// Fail unless `n` matches the number of rows of the log-density matrix.
    pub fn check_observations(&self, n: usize, context: &'static str) -> Result<(), StackingError> {
        if n != self.num_observations() {
            return Err(StackingError::RowMismatch {
                context,
                expected: self.num_observations(),
                found: n,
            });
        }
        Ok(())
    }

    fn check_eta(&self, eta: ArrayView2<'_, f64>) -> Result<(), StackingError> {
        self.check_observations(eta.nrows(), "linear predictor rows vs log-density rows")?;
        if eta.ncols() != self.num_linear_predictors() {
            return Err(StackingError::ColumnMismatch {
                context: "linear predictor columns vs K-1 free experts",
                expected: self.num_linear_predictors(),
                found: eta.ncols(),
            });
        }
        for ((row, column), v) in eta.indexed_iter() {
            if !v.is_finite() {
                return Err(StackingError::NonFiniteLinearPredictor { row, column });
            }
        }
        Ok(())
    }

    fn use_parallel(&self) -> bool {
        self.num_observations() >= self.config.parallel_threshold
    }

    /// Log-likelihood, score and negative Hessian at `eta` (`n x (K-1)`).
    ///
    /// Observations with zero density under every expert are reported in
    /// `degenerate_rows` and logged as a warning.
    pub fn evaluate(&self, eta: ArrayView2<'_, f64>) -> Result<StackingEvaluation, StackingError> {
        let evaluation = self.evaluate_rows(eta)?;
        if !evaluation.degenerate_rows.is_empty() {
            let preview: Vec<usize> = evaluation
                .degenerate_rows
                .iter()
                .take(8)
                .map(|r| r.index)
                .collect();
            log::warn!(
                "[stacking] {} observation(s) have zero density under every expert (first: {:?})",
                evaluation.degenerate_rows.len(),
                preview
            );
        }
        Ok(evaluation)
    }

    /// Same as [`Self::evaluate`] without logging degenerate rows.
    fn evaluate_rows(&self, eta: ArrayView2<'_, f64>) -> Result<StackingEvaluation, StackingError> {
        self.check_eta(eta)?;
        let n = self.num_observations();
        let m = self.num_linear_predictors();
        let reference = self.reference;

        let mut loglik = Array1::<f64>::zeros(n);
        let mut gradient = Array2::<f64>::zeros((n, m));
        let mut hessian = Array2::<f64>::zeros((n, packed_len(m)));

        let zip = Zip::from(&mut loglik)
            .and(gradient.rows_mut())
            .and(hessian.rows_mut())
            .and(self.log_densities.rows())
            .and(eta.rows());
        if self.use_parallel() {
            zip.par_for_each(|ll, g, h, l, e| {
                *ll = evaluate_row(l, e, reference, g, h);
            });
        } else {
            zip.for_each(|ll, g, h, l, e| {
                *ll = evaluate_row(l, e, reference, g, h);
            });
        }

        let degenerate_rows: Vec<DegenerateRow> = loglik
            .iter()
            .enumerate()
            .filter(|(_, v)| !v.is_finite())
            .map(|(index, _)| DegenerateRow { index })
            .collect();

        Ok(StackingEvaluation {
            loglik,
            gradient,
            hessian,
            degenerate_rows,
        })
    }

    /// Mixing weights `w` (`n x K`) implied by `eta`.
    pub fn predict_weights(&self, eta: ArrayView2<'_, f64>) -> Result<Array2<f64>, StackingError> {
        self.check_eta(eta)?;
        Ok(weights_from_eta(eta, self.num_experts(), self.reference))
    }

    /// Starting linear predictors for an iterative fitter: all zeros, i.e.
    /// uniform mixing weights.
    ///
    /// The response is already encoded in the expert log-densities, so `y`
    /// and `prior_weights` are only checked against the number of observations.
    pub fn initialize(
        &self,
        y: Option<ArrayView1<'_, f64>>,
        prior_weights: Option<ArrayView1<'_, f64>>,
    ) -> Result<Array2<f64>, StackingError> {
        if let Some(y) = y {
            self.check_observations(y.len(), "response length vs log-density rows")?;
        }
        if let Some(w) = prior_weights {
            self.check_observations(w.len(), "prior weights length vs log-density rows")?;
            check_prior_weights(w)?;
        }
        Ok(Array2::zeros((
            self.num_observations(),
            self.num_linear_predictors(),
        )))
    }

    /// Re-express `eta` (relative to this family's reference) against
    /// `new_reference`. The implied mixing weights are unchanged.
    pub fn reparametrize_eta(
        &self,
        eta: ArrayView2<'_, f64>,
        new_reference: usize,
    ) -> Result<Array2<f64>, StackingError> {
        self.check_eta(eta)?;
        let k = self.num_experts();
        if new_reference >= k {
            return Err(StackingError::ReferenceOutOfRange {
                reference: new_reference,
                experts: k,
            });
        }
        let m = self.num_linear_predictors();
        let mut out = Array2::<f64>::zeros((eta.nrows(), m));
        let mut z = vec![0.0; k];
        for (e, mut o) in eta.rows().into_iter().zip(out.rows_mut()) {
            fill_scores(e, self.reference, &mut z);
            let base = z[new_reference];
            for c in 0..m {
                o[c] = z[expert_for_column(c, new_reference)] - base;
            }
        }
        Ok(out)
    }

    /// Per-row stacked log-density at `eta` for another set of expert
    /// log-densities (e.g. held-out data), with the same number of experts.
    pub fn mixture_log_density_at(
        &self,
        eta: ArrayView2<'_, f64>,
        log_densities: ArrayView2<'_, f64>,
    ) -> Result<Array1<f64>, StackingError> {
        if log_densities.ncols() != self.num_experts() {
            return Err(StackingError::ColumnMismatch {
                context: "log-density columns vs number of experts",
                expected: self.num_experts(),
                found: log_densities.ncols(),
            });
        }
        if eta.nrows() != log_densities.nrows() {
            return Err(StackingError::RowMismatch {
                context: "linear predictor rows vs log-density rows",
                expected: log_densities.nrows(),
                found: eta.nrows(),
            });
        }
        if eta.ncols() != self.num_linear_predictors() {
            return Err(StackingError::ColumnMismatch {
                context: "linear predictor columns vs K-1 free experts",
                expected: self.num_linear_predictors(),
                found: eta.ncols(),
            });
        }
        for ((row, column), v) in eta.indexed_iter() {
            if !v.is_finite() {
                return Err(StackingError::NonFiniteLinearPredictor { row, column });
            }
        }
        for ((row, expert), &value) in log_densities.indexed_iter() {
            if value.is_nan() || value == f64::INFINITY {
                return Err(StackingError::NonFiniteLogDensity { row, expert, value });
            }
        }
        let k = self.num_experts();
        let mut out = Array1::<f64>::zeros(eta.nrows());
        let mut w = vec![0.0; k];
        Zip::from(&mut out)
            .and(log_densities.rows())
            .and(eta.rows())
            .for_each(|ll, l, e| {
                *ll = log_sum_exp(&log_weighted_densities(l, e, self.reference, &mut w));
            });
        Ok(out)
    }
}

#[inline]
fn expert_for_column(column: usize, reference: usize) -> usize {
    if column < reference { column } else { column + 1 }
}

/// Full score vector `z` (length K) with the reference pinned at zero.
#[inline]
fn fill_scores(eta: ArrayView1<'_, f64>, reference: usize, z: &mut [f64]) {
    z[reference] = 0.0;
    for (c, &v) in eta.iter().enumerate() {
        z[expert_for_column(c, reference)] = v;
    }
}

fn weights_from_eta(eta: ArrayView2<'_, f64>, k: usize, reference: usize) -> Array2<f64> {
    let mut weights = Array2::<f64>::zeros((eta.nrows(), k));
    let mut z = vec![0.0; k];
    let mut w = vec![0.0; k];
    for (e, mut out) in eta.rows().into_iter().zip(weights.rows_mut()) {
        fill_scores(e, reference, &mut z);
        softmax_into(&z, &mut w);
        for (o, &v) in out.iter_mut().zip(&w) {
            *o = v;
        }
    }
    weights
}

fn check_prior_weights(weights: ArrayView1<'_, f64>) -> Result<(), StackingError> {
    for (row, &value) in weights.iter().enumerate() {
        if !value.is_finite() || value < 0.0 {
            return Err(StackingError::InvalidPriorWeight { row, value });
        }
    }
    Ok(())
}

/// `log w_k + L_k` for one observation, with `log w_k = z_k - logsumexp(z)`
/// kept in log space. Writes the mixing weights into `weights`.
fn log_weighted_densities(
    log_densities: ArrayView1<'_, f64>,
    eta: ArrayView1<'_, f64>,
    reference: usize,
    weights: &mut [f64],
) -> Vec<f64> {
    let mut z = vec![0.0; log_densities.len()];
    fill_scores(eta, reference, &mut z);
    let log_norm = softmax_into(&z, weights);
    z.iter()
        .zip(log_densities.iter())
        .map(|(&zk, &lk)| zk - log_norm + lk)
        .collect()
}

/// Evaluate one observation. Returns `ll_i`; writes the score and packed
/// negative Hessian into `gradient` and `hessian`.
fn evaluate_row(
    log_densities: ArrayView1<'_, f64>,
    eta: ArrayView1<'_, f64>,
    reference: usize,
    mut gradient: ArrayViewMut1<'_, f64>,
    mut hessian: ArrayViewMut1<'_, f64>,
) -> f64 {
    let k = log_densities.len();
    let m = k - 1;
    let mut w = vec![0.0; k];

    // log w_k + L_k, then responsibilities p_k in place.
    let mut p = log_weighted_densities(log_densities, eta, reference, &mut w);
    let ll = log_sum_exp(&p);
    if ll == f64::NEG_INFINITY {
        gradient.fill(0.0);
        hessian.fill(0.0);
        return ll;
    }
    for v in p.iter_mut() {
        *v = (*v - ll).exp();
    }

    for c in 0..m {
        let e = expert_for_column(c, reference);
        gradient[c] = p[e] - w[e];
    }

    let mut at = 0usize;
    for a in 0..m {
        let ea = expert_for_column(a, reference);
        for b in a..m {
            let eb = expert_for_column(b, reference);
            let diag = if a == b { 1.0 } else { 0.0 };
            let posterior = p[ea] * diag - p[ea] * p[eb];
            let prior = w[ea] * diag - w[ea] * w[eb];
            hessian[at] = prior - posterior;
            at += 1;
        }
    }
    ll
}

/// Design, offset and penalties for one non-reference expert's linear predictor.
#[derive(Clone, Debug)]
pub struct ParameterBlockInput {
    pub design: Array2<f64>,
    pub offset: Array1<f64>,
    pub penalties: Vec<Array2<f64>>,
    pub log_lambdas: Option<Array1<f64>>,
    pub initial_beta: Option<Array1<f64>>,
}

impl ParameterBlockInput {
    pub fn into_spec(self, name: &str) -> Result<ParameterBlockSpec, String> {
        let p = self.design.ncols();
        let n = self.design.nrows();
        if self.offset.len() != n {
            return Err(format!(
                "block '{name}' offset length mismatch: got {}, expected {n}",
                self.offset.len()
            ));
        }
        let k = self.penalties.len();
        let log_lambdas = self.log_lambdas.unwrap_or_else(|| Array1::<f64>::zeros(k));
        if log_lambdas.len() != k {
            return Err(format!(
                "block '{name}' log_lambdas length mismatch: got {}, expected {k}",
                log_lambdas.len()
            ));
        }
        if let Some(beta0) = &self.initial_beta
            && beta0.len() != p
        {
            return Err(format!(
                "block '{name}' initial_beta length mismatch: got {}, expected {p}",
                beta0.len()
            ));
        }
        Ok(ParameterBlockSpec {
            name: name.to_string(),
            design: self.design,
            offset: self.offset,
            penalties: self.penalties,
            log_lambdas,
            initial_beta: self.initial_beta,
        })
    }
}

/// Stacking family bound to per-block design matrices, so that it can report
/// coefficient-space Newton quantities to [`fit_custom_family`].
#[derive(Clone, Debug)]
pub struct StackingBlockFamily {
    pub family: StackingFamily,
    pub designs: Vec<Array2<f64>>,
    /// Prior observation weights scaling each row's log-likelihood.
    pub weights: Array1<f64>,
}

impl StackingBlockFamily {
    fn eta_matrix(&self, block_states: &[ParameterBlockState]) -> Result<Array2<f64>, String> {
        let m = self.family.num_linear_predictors();
        if block_states.len() != m {
            return Err(format!(
                "StackingBlockFamily expects {m} blocks, got {}",
                block_states.len()
            ));
        }
        let n = self.family.num_observations();
        if self.weights.len() != n {
            return Err(format!(
                "StackingBlockFamily weights length mismatch: got {}, expected {n}",
                self.weights.len()
            ));
        }
        if self.designs.len() != m {
            return Err(format!(
                "StackingBlockFamily expects {m} designs, got {}",
                self.designs.len()
            ));
        }
        let mut eta = Array2::<f64>::zeros((n, m));
        for (c, state) in block_states.iter().enumerate() {
            if state.eta.len() != n {
                return Err(format!(
                    "block {c} eta length mismatch: got {}, expected {n}",
                    state.eta.len()
                ));
            }
            eta.column_mut(c).assign(&state.eta);
        }
        Ok(eta)
    }

    /// Row-wise family evaluation at the current block predictors.
    ///
    /// Runs on every Newton and step-halving trial, so degenerate rows are
    /// only logged at debug level here; [`fit_stacking`] warns once up front.
    fn evaluate_family(
        &self,
        block_states: &[ParameterBlockState],
    ) -> Result<StackingEvaluation, String> {
        let eta = self.eta_matrix(block_states)?;
        let evaluation = self
            .family
            .evaluate_rows(eta.view())
            .map_err(|e| e.to_string())?;
        if !evaluation.degenerate_rows.is_empty() {
            log::debug!(
                "[stacking] skipping {} degenerate observation(s) in the fit objective",
                evaluation.degenerate_rows.len()
            );
        }
        Ok(evaluation)
    }

    /// `X_a' diag(weights * H_ab) X_b` summed over non-degenerate rows.
    fn cross_block_curvature(
        &self,
        evaluation: &StackingEvaluation,
        a: usize,
        b: usize,
    ) -> Array2<f64> {
        let xa = &self.designs[a];
        let xb = &self.designs[b];
        let mut scaled = xb.clone();
        for (i, mut row) in scaled.rows_mut().into_iter().enumerate() {
            row *= self.weights[i] * evaluation.hessian_entry(i, a, b);
        }
        xa.t().dot(&scaled)
    }
}

impl CustomFamily for StackingBlockFamily {
    /// Per-block working sets carry the score only; the curvature, including
    /// its cross-block terms, comes from [`Self::exact_newton_joint_hessian`].
    fn evaluate(&self, block_states: &[ParameterBlockState]) -> Result<FamilyEvaluation, String> {
        let evaluation = self.evaluate_family(block_states)?;

        // Degenerate rows do not depend on eta and are left out of the total.
        let log_likelihood: f64 = evaluation
            .loglik
            .iter()
            .zip(self.weights.iter())
            .filter(|(ll, _)| ll.is_finite())
            .map(|(ll, w)| w * ll)
            .sum();

        let block_working_sets = (0..self.designs.len())
            .map(|c| {
                let score = &evaluation.gradient.column(c) * &self.weights;
                let p = self.designs[c].ncols();
                BlockWorkingSet::ExactNewton {
                    gradient: self.designs[c].t().dot(&score),
                    hessian: Array2::zeros((p, p)),
                }
            })
            .collect();

        Ok(FamilyEvaluation {
            log_likelihood,
            block_working_sets,
        })
    }

    fn exact_newton_joint_hessian(
        &self,
        block_states: &[ParameterBlockState],
    ) -> Result<Option<Array2<f64>>, String> {
        let evaluation = self.evaluate_family(block_states)?;
        let offsets: Vec<usize> = self
            .designs
            .iter()
            .scan(0usize, |at, x| {
                let start = *at;
                *at += x.ncols();
                Some(start)
            })
            .collect();
        let total: usize = self.designs.iter().map(|x| x.ncols()).sum();
        let mut joint = Array2::<f64>::zeros((total, total));
        for a in 0..self.designs.len() {
            for b in a..self.designs.len() {
                let block = self.cross_block_curvature(&evaluation, a, b);
                let (ra, rb) = (offsets[a], offsets[b]);
                let (pa, pb) = block.dim();
                joint
                    .slice_mut(ndarray::s![ra..ra + pa, rb..rb + pb])
                    .assign(&block);
                if a != b {
                    joint
                        .slice_mut(ndarray::s![rb..rb + pb, ra..ra + pa])
                        .assign(&block.t());
                }
            }
        }
        Ok(Some(joint))
    }
}

/// Inputs for fitting a stacking model with one additive predictor per
/// non-reference expert.
#[derive(Clone, Debug)]
pub struct StackingSpec {
    /// `n x K` expert log-densities on the training data.
    pub log_densities: Array2<f64>,
    pub config: StackingConfig,
    /// Optional prior observation weights (default 1).
    pub weights: Option<Array1<f64>>,
    /// One block per non-reference expert, in expert order.
    pub blocks: Vec<ParameterBlockInput>,
}

#[derive(Clone, Debug)]
pub struct StackingFit {
    pub family: StackingFamily,
    pub fit: BlockwiseFitResult,
    /// Fitted linear predictors, `n x (K-1)`.
    pub eta: Array2<f64>,
    /// Fitted mixing weights, `n x K`.
    pub mixing_weights: Array2<f64>,
}

impl StackingFit {
    pub fn coefficients(&self) -> Vec<&Array1<f64>> {
        self.fit.block_states.iter().map(|s| &s.beta).collect()
    }

    /// Linear predictors for new covariate designs, one per block.
    pub fn linear_predictors(
        &self,
        designs: &[ArrayView2<'_, f64>],
        offsets: Option<&[Array1<f64>]>,
    ) -> Result<Array2<f64>, String> {
        let m = self.family.num_linear_predictors();
        if designs.len() != m {
            return Err(format!("expected {m} design matrices, got {}", designs.len()));
        }
        if let Some(off) = offsets
            && off.len() != m
        {
            return Err(format!("expected {m} offsets, got {}", off.len()));
        }
        let n = designs[0].nrows();
        let mut eta = Array2::<f64>::zeros((n, m));
        for (c, (x, state)) in designs.iter().zip(&self.fit.block_states).enumerate() {
            if x.nrows() != n {
                return Err(format!(
                    "design {c} row mismatch: got {}, expected {n}",
                    x.nrows()
                ));
            }
            if x.ncols() != state.beta.len() {
                return Err(format!(
                    "design {c} column mismatch: got {}, expected {}",
                    x.ncols(),
                    state.beta.len()
                ));
            }
            let mut col = x.dot(&state.beta);
            if let Some(off) = offsets {
                if off[c].len() != n {
                    return Err(format!(
                        "offset {c} length mismatch: got {}, expected {n}",
                        off[c].len()
                    ));
                }
                col += &off[c];
            }
            eta.column_mut(c).assign(&col);
        }
        Ok(eta)
    }

    pub fn predict_weights(
        &self,
        designs: &[ArrayView2<'_, f64>],
        offsets: Option<&[Array1<f64>]>,
    ) -> Result<Array2<f64>, String> {
        let eta = self.linear_predictors(designs, offsets)?;
        Ok(weights_from_eta(
            eta.view(),
            self.family.num_experts(),
            self.family.reference(),
        ))
    }

    /// Stacked predictive log-density on new data given its expert log-densities.
    pub fn predict_log_density(
        &self,
        designs: &[ArrayView2<'_, f64>],
        offsets: Option<&[Array1<f64>]>,
        log_densities: ArrayView2<'_, f64>,
    ) -> Result<Array1<f64>, String> {
        let eta = self.linear_predictors(designs, offsets)?;
        self.family
            .mixture_log_density_at(eta.view(), log_densities)
            .map_err(|e| e.to_string())
    }

    /// Approximate standard errors of the fitted linear predictors from the
    /// conditional coefficient covariance, one column per block.
    pub fn eta_standard_errors(&self, designs: &[ArrayView2<'_, f64>]) -> Option<Array2<f64>> {
        let cov = self.fit.covariance_conditional.as_ref()?;
        let m = self.family.num_linear_predictors();
        if designs.len() != m {
            return None;
        }
        let n = designs[0].nrows();
        let mut out = Array2::<f64>::zeros((n, m));
        let mut at = 0usize;
        for (c, x) in designs.iter().enumerate() {
            let p = x.ncols();
            if x.nrows() != n || at + p > cov.nrows() {
                return None;
            }
            let block = cov.slice(ndarray::s![at..at + p, at..at + p]);
            let xv = x.dot(&block);
            for i in 0..n {
                out[[i, c]] = xv.row(i).dot(&x.row(i)).max(0.0).sqrt();
            }
            at += p;
        }
        Some(out)
    }
}

/// Least-squares coefficients reproducing `target_eta - offset` with a small ridge.
fn solve_weighted_projection(
    design: &Array2<f64>,
    offset: &Array1<f64>,
    target_eta: ArrayView1<'_, f64>,
    weights: &Array1<f64>,
    ridge_floor: f64,
) -> Result<Array1<f64>, String> {
    let n = design.nrows();
    let p = design.ncols();
    if offset.len() != n || target_eta.len() != n || weights.len() != n {
        return Err("solve_weighted_projection dimension mismatch".to_string());
    }
    let mut xw = design.clone();
    for (i, mut row) in xw.rows_mut().into_iter().enumerate() {
        row *= weights[i].max(0.0);
    }
    let mut xtwx = design.t().dot(&xw);
    for a in 0..p {
        xtwx[[a, a]] += ridge_floor.max(1e-12);
    }
    let target = &target_eta - offset;
    let xtwy = xw.t().dot(&target);
    solve_spd(&xtwx, &xtwy).map_err(|e| format!("solve_weighted_projection failed: {e}"))
}

/// Fit the stacking family with fixed smoothing parameters.
pub fn fit_stacking(
    spec: StackingSpec,
    options: &StackingFitOptions,
) -> Result<StackingFit, String> {
    let StackingSpec {
        log_densities,
        config,
        weights,
        blocks,
    } = spec;
    let family = StackingFamily::new(log_densities, config).map_err(|e| e.to_string())?;
    let n = family.num_observations();
    let m = family.num_linear_predictors();
    if blocks.len() != m {
        return Err(format!(
            "stacking with {} experts needs {m} predictor blocks, got {}",
            family.num_experts(),
            blocks.len()
        ));
    }
    let weights = weights.unwrap_or_else(|| Array1::ones(n));
    let eta0 = family
        .initialize(None, Some(weights.view()))
        .map_err(|e| e.to_string())?;

    let mut specs = Vec::with_capacity(m);
    for (c, mut block) in blocks.into_iter().enumerate() {
        family
            .check_observations(block.design.nrows(), "predictor design rows vs log-density rows")
            .map_err(|e| format!("block {c}: {e}"))?;
        if block.initial_beta.is_none() {
            block.initial_beta = Some(solve_weighted_projection(
                &block.design,
                &block.offset,
                eta0.column(c),
                &weights,
                options.ridge_floor,
            )?);
        }
        let name = format!("expert_{}", family.expert_for_column(c));
        specs.push(block.into_spec(&name)?);
    }

    let degenerate = family
        .log_densities()
        .rows()
        .into_iter()
        .filter(|row| row.iter().all(|&v| v == f64::NEG_INFINITY))
        .count();
    if degenerate > 0 {
        log::warn!(
            "[stacking] {degenerate} of {n} training observations have zero density under every expert and do not inform the weights"
        );
    }

    let block_family = StackingBlockFamily {
        family: family.clone(),
        designs: specs.iter().map(|s| s.design.clone()).collect(),
        weights,
    };
    let fit = fit_custom_family(&block_family, &specs, options)?;
    let eta = block_family.eta_matrix(&fit.block_states)?;
    let mixing_weights = family.predict_weights(eta.view()).map_err(|e| e.to_string())?;
    log::debug!(
        "[stacking] fit finished: loglik={:.6e}, iterations={}, converged={}",
        fit.log_likelihood,
        fit.iterations,
        fit.converged
    );
    Ok(StackingFit {
        family,
        fit,
        eta,
        mixing_weights,
    })
}
