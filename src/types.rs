use serde::{Deserialize, Serialize};

pub fn default_parallel_threshold() -> usize {
    4096
}

/// Which expert is pinned at `eta = 0` in the multinomial-logit link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ReferenceExpert {
    /// The last column of the log-density matrix.
    #[default]
    Last,
    /// An explicit 0-based column index.
    Index(usize),
}

impl ReferenceExpert {
    pub fn resolve(self, num_experts: usize) -> usize {
        match self {
            ReferenceExpert::Last => num_experts.saturating_sub(1),
            ReferenceExpert::Index(k) => k,
        }
    }
}

/// Family-level configuration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StackingConfig {
    #[serde(default)]
    pub reference: ReferenceExpert,
    /// Row count at or above which evaluation runs on the rayon pool.
    #[serde(default = "default_parallel_threshold")]
    pub parallel_threshold: usize,
}

impl Default for StackingConfig {
    fn default() -> Self {
        Self {
            reference: ReferenceExpert::Last,
            parallel_threshold: default_parallel_threshold(),
        }
    }
}

/// Options for the penalized Newton fitter in `custom_family`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StackingFitOptions {
    pub max_iter: usize,
    /// Convergence tolerance on the gradient infinity norm and on the
    /// relative change of the penalized objective.
    pub tol: f64,
    pub ridge_floor: f64,
    pub max_step_halvings: usize,
}

impl Default for StackingFitOptions {
    fn default() -> Self {
        Self {
            max_iter: 200,
            tol: 1e-8,
            ridge_floor: 1e-10,
            max_step_halvings: 30,
        }
    }
}
