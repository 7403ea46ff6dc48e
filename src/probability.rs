use ndarray::{Array1, ArrayView1, ArrayView2, Zip};

/// Standard normal PDF φ(x).
#[inline]
pub fn normal_pdf(x: f64) -> f64 {
    const INV_SQRT_2PI: f64 = 0.398_942_280_401_432_7;
    INV_SQRT_2PI * (-0.5 * x * x).exp()
}

/// Gaussian log-density of `y` under N(mu, sigma²).
#[inline]
pub fn normal_log_pdf(y: f64, mu: f64, sigma: f64) -> f64 {
    const HALF_LN_2PI: f64 = 0.918_938_533_204_672_8;
    if !(sigma > 0.0) {
        return f64::NAN;
    }
    let r = (y - mu) / sigma;
    -0.5 * r * r - sigma.ln() - HALF_LN_2PI
}

/// Logistic function, clamped so `exp` never overflows.
#[inline]
pub fn sigmoid(x: f64) -> f64 {
    let z = x.clamp(-700.0, 700.0);
    1.0 / (1.0 + (-z).exp())
}

/// log Σ exp(x_k). Returns `-inf` when every term is `-inf` (or the input is empty).
#[inline]
pub fn log_sum_exp(values: &[f64]) -> f64 {
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if max == f64::NEG_INFINITY {
        return f64::NEG_INFINITY;
    }
    if max == f64::INFINITY {
        return f64::INFINITY;
    }
    let sum: f64 = values.iter().map(|&v| (v - max).exp()).sum();
    max + sum.ln()
}

/// Softmax of `scores` written into `out`. Returns the log normalizer.
#[inline]
pub fn softmax_into(scores: &[f64], out: &mut [f64]) -> f64 {
    debug_assert_eq!(scores.len(), out.len());
    let max = scores.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let mut sum = 0.0;
    for (o, &s) in out.iter_mut().zip(scores) {
        *o = (s - max).exp();
        sum += *o;
    }
    for o in out.iter_mut() {
        *o /= sum;
    }
    max + sum.ln()
}

/// Per-row mixture log-density `log Σ_k w_k exp(L_k)`.
///
/// Zero weights contribute nothing even when the matching log-density is
/// `-inf`, which is how the predictive mixture is evaluated on held-out data.
pub fn mixture_log_density(
    weights: ArrayView2<'_, f64>,
    log_densities: ArrayView2<'_, f64>,
) -> Result<Array1<f64>, String> {
    if weights.dim() != log_densities.dim() {
        return Err(format!(
            "mixture_log_density shape mismatch: weights {:?}, log-densities {:?}",
            weights.dim(),
            log_densities.dim()
        ));
    }
    let k = weights.ncols();
    let mut out = Array1::<f64>::zeros(weights.nrows());
    let mut terms = vec![0.0; k];
    Zip::from(&mut out)
        .and(weights.rows())
        .and(log_densities.rows())
        .for_each(|o, w, l| {
            for j in 0..k {
                terms[j] = if w[j] > 0.0 {
                    w[j].ln() + l[j]
                } else {
                    f64::NEG_INFINITY
                };
            }
            *o = log_sum_exp(&terms);
        });
    Ok(out)
}

/// Total log score of per-observation predictive log-densities.
#[inline]
pub fn log_score(log_densities: ArrayView1<'_, f64>) -> f64 {
    log_densities.sum()
}
