use faer::linalg::solvers;
pub use faer::linalg::solvers::{Ldlt as FaerLdlt, Llt as FaerLlt, Solve as FaerSolve};
use faer::{Mat, MatRef, Side};
use ndarray::{Array1, Array2, ArrayBase, Data, Ix1, Ix2};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FaerLinalgError {
    #[error("Cholesky factorization failed: {0:?}")]
    Cholesky(solvers::LltError),
    #[error("LDLT factorization failed: {0:?}")]
    Ldlt(solvers::LdltError),
    #[error("dimension mismatch: matrix is {rows}x{cols}, right-hand side has length {rhs}")]
    DimensionMismatch { rows: usize, cols: usize, rhs: usize },
    #[error("solve produced non-finite values")]
    NonFiniteSolution,
}

pub enum FaerSymmetricFactor {
    Llt(FaerLlt<f64>),
    Ldlt(FaerLdlt<f64>),
}

impl FaerSymmetricFactor {
    #[inline]
    pub fn solve(&self, rhs: MatRef<'_, f64>) -> Mat<f64> {
        match self {
            FaerSymmetricFactor::Llt(f) => f.solve(rhs),
            FaerSymmetricFactor::Ldlt(f) => f.solve(rhs),
        }
    }
}

/// Factorize a symmetric system with an LLT first attempt and LDLT fallback.
#[inline]
pub fn factorize_symmetric_with_fallback(
    matrix: MatRef<'_, f64>,
    side: Side,
) -> Result<FaerSymmetricFactor, FaerLinalgError> {
    if let Ok(llt) = FaerLlt::new(matrix, side) {
        return Ok(FaerSymmetricFactor::Llt(llt));
    }
    let ldlt = FaerLdlt::new(matrix, side).map_err(FaerLinalgError::Ldlt)?;
    Ok(FaerSymmetricFactor::Ldlt(ldlt))
}

/// Copy an ndarray matrix into an owned faer matrix.
#[inline]
pub fn to_faer_mat<S: Data<Elem = f64>>(array: &ArrayBase<S, Ix2>) -> Mat<f64> {
    Mat::from_fn(array.nrows(), array.ncols(), |i, j| array[[i, j]])
}

#[inline]
pub fn to_faer_col<S: Data<Elem = f64>>(array: &ArrayBase<S, Ix1>) -> Mat<f64> {
    Mat::from_fn(array.len(), 1, |i, _| array[i])
}

pub trait FaerCholesky {
    /// Cholesky factor of a symmetric positive definite matrix (lower side).
    fn cholesky_factor(&self) -> Result<FaerLlt<f64>, FaerLinalgError>;
}

impl<S: Data<Elem = f64>> FaerCholesky for ArrayBase<S, Ix2> {
    fn cholesky_factor(&self) -> Result<FaerLlt<f64>, FaerLinalgError> {
        let mat = to_faer_mat(self);
        FaerLlt::new(mat.as_ref(), Side::Lower).map_err(FaerLinalgError::Cholesky)
    }
}

/// Solve `A x = b` for symmetric `A` using Cholesky only.
///
/// Fails when `A` is not positive definite so callers can add ridge and retry.
pub fn solve_spd(a: &Array2<f64>, b: &Array1<f64>) -> Result<Array1<f64>, FaerLinalgError> {
    let (rows, cols) = a.dim();
    if rows != cols || b.len() != rows {
        return Err(FaerLinalgError::DimensionMismatch {
            rows,
            cols,
            rhs: b.len(),
        });
    }
    let llt = a.cholesky_factor()?;
    let mut rhs = to_faer_col(b);
    llt.solve_in_place(rhs.as_mut());
    let out = Array1::from_shape_fn(rows, |i| rhs[(i, 0)]);
    if out.iter().any(|v| !v.is_finite()) {
        return Err(FaerLinalgError::NonFiniteSolution);
    }
    Ok(out)
}

/// Solve `A x = b` for symmetric `A`, falling back to LDLT when `A` is indefinite.
pub fn solve_symmetric(a: &Array2<f64>, b: &Array1<f64>) -> Result<Array1<f64>, FaerLinalgError> {
    let (rows, cols) = a.dim();
    if rows != cols || b.len() != rows {
        return Err(FaerLinalgError::DimensionMismatch {
            rows,
            cols,
            rhs: b.len(),
        });
    }
    let mat = to_faer_mat(a);
    let factor = factorize_symmetric_with_fallback(mat.as_ref(), Side::Lower)?;
    let rhs = to_faer_col(b);
    let sol = factor.solve(rhs.as_ref());
    let out = Array1::from_shape_fn(rows, |i| sol[(i, 0)]);
    if out.iter().any(|v| !v.is_finite()) {
        return Err(FaerLinalgError::NonFiniteSolution);
    }
    Ok(out)
}
