#![deny(dead_code)]
#![deny(unused_imports)]
#![allow(non_snake_case)]

pub mod custom_family;
pub mod faer_ndarray;
pub mod families;
pub mod probability;
pub mod types;

pub use custom_family::{
    BlockWorkingSet, BlockwiseFitResult, CustomFamily, FamilyEvaluation, ParameterBlockSpec,
    ParameterBlockState, fit_custom_family,
};
pub use families::stacking::{
    DegenerateRow, ParameterBlockInput, StackingBlockFamily, StackingError, StackingEvaluation,
    StackingFamily, StackingFit, StackingSpec, fit_stacking, make_stacking_family, packed_index,
    packed_len,
};
pub use probability::{
    log_score, log_sum_exp, mixture_log_density, normal_log_pdf, normal_pdf, sigmoid,
};
pub use types::{ReferenceExpert, StackingConfig, StackingFitOptions};
