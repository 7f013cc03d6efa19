//! Linear algebra and Gaussian density helpers shared by the filters and the sampler.
//!
//! Public API:
//!     pub fn matrix_square_root(matrix: &DMatrix<f64>) -> DMatrix<f64>
//!     pub fn spd_solve(a: &DMatrix<f64>, b: &DMatrix<f64>) -> DMatrix<f64>
//!     pub struct GaussianPrecision
//!     pub fn log_mean_exp(values: &[f64]) -> f64
//!     pub fn sample_gaussian(rng, mean, cov) -> DVector<f64>
//!
//! Strategy for factorizations (each step isolated for testing):
//! 1) Symmetrize P ← 0.5 (P + Pᵀ)
//! 2) Cholesky
//! 3) Jittered Cholesky (geometric ramp)
//! 4) Symmetric EVD with eigenvalue floor → S = U * sqrt(Λ⁺) * Uᵀ, or an SVD pseudo-inverse
//!    when a solve is requested

use nalgebra::linalg::{Cholesky, SymmetricEigen};
use nalgebra::{DMatrix, DVector, Dyn};
use rand::Rng;
use rand_distr::StandardNormal;

pub(crate) const LN_2PI: f64 = 1.837_877_066_409_345_5;
const PINV_EPS: f64 = 1e-12;

/// Compute a robust square root `S` such that approximately `matrix ≈ S * Sᵀ`.
///
/// Attempts a Cholesky decomposition first (yielding a lower triangular factor). If that
/// fails even with diagonal jitter, the symmetric eigenvalue square root is returned with
/// negative eigenvalues floored to zero, which is what covariance matrices of degenerate
/// states (e.g. deterministic components) need.
///
/// # Panics
/// If `matrix` is not square.
pub fn matrix_square_root(matrix: &DMatrix<f64>) -> DMatrix<f64> {
    assert!(
        matrix.is_square(),
        "matrix_square_root: matrix must be square"
    );
    const INITIAL_JITTER: f64 = 1e-12;
    const MAX_JITTER: f64 = 1e-8;
    const MAX_TRIES: usize = 5;
    const EIGEN_FLOOR: f64 = 0.0;
    if matrix.nrows() == 0 {
        return matrix.clone();
    }
    let p = symmetrize(matrix);
    if let Some(s) = chol_sqrt(&p) {
        return s;
    }
    if let Some(s) = chol_sqrt_with_jitter(&p, INITIAL_JITTER, MAX_JITTER, MAX_TRIES) {
        return s;
    }
    evd_symmetric_sqrt_with_floor(&p, EIGEN_FLOOR)
}

/// Symmetrize a matrix: P ← 0.5 (P + Pᵀ)
#[inline]
pub fn symmetrize(m: &DMatrix<f64>) -> DMatrix<f64> {
    0.5 * (m + m.transpose())
}

/// Cholesky factorization that also rejects zero or non-finite pivots.
fn checked_cholesky(p: DMatrix<f64>) -> Option<Cholesky<f64, Dyn>> {
    let ch = Cholesky::new(p)?;
    if ch
        .l_dirty()
        .diagonal()
        .iter()
        .all(|d| d.is_finite() && *d > 0.0)
    {
        Some(ch)
    } else {
        None
    }
}

fn chol_sqrt(p: &DMatrix<f64>) -> Option<DMatrix<f64>> {
    checked_cholesky(p.clone()).map(|ch| ch.l())
}

/// Cholesky with diagonal jitter on a geometric ramp. Returns None if all tries fail.
fn chol_with_jitter(
    p: &DMatrix<f64>,
    initial_jitter: f64,
    max_jitter: f64,
    max_tries: usize,
) -> Option<Cholesky<f64, Dyn>> {
    let n = p.nrows();
    let mut jitter = initial_jitter;
    for _ in 0..max_tries {
        let mut pj = p.clone();
        for i in 0..n {
            pj[(i, i)] += jitter;
        }
        if let Some(ch) = checked_cholesky(pj) {
            return Some(ch);
        }
        jitter *= 10.0;
        if jitter > max_jitter {
            break;
        }
    }
    None
}

fn chol_sqrt_with_jitter(
    p: &DMatrix<f64>,
    initial_jitter: f64,
    max_jitter: f64,
    max_tries: usize,
) -> Option<DMatrix<f64>> {
    chol_with_jitter(p, initial_jitter, max_jitter, max_tries).map(|ch| ch.l())
}

/// Symmetric EVD square root with eigenvalue flooring:
/// S = U * sqrt(max(λ, floor)) * Uᵀ
fn evd_symmetric_sqrt_with_floor(p: &DMatrix<f64>, floor: f64) -> DMatrix<f64> {
    let se = SymmetricEigen::new(p.clone());
    let u = se.eigenvectors;
    let sqrt_vals = se.eigenvalues.map(|l| l.max(floor).sqrt());
    let sigma_half = DMatrix::<f64>::from_diagonal(&sqrt_vals);
    &u * sigma_half * u.transpose()
}

/// Solve A X = B for a symmetric positive (semi-)definite A.
///
/// Plain Cholesky first and the eigen pseudo-inverse of A otherwise, so the call never
/// fails. Singular A (e.g. a predicted covariance of a state without process noise) is
/// handled in the least-squares sense instead of being jittered into huge gains.
pub fn spd_solve(a: &DMatrix<f64>, b: &DMatrix<f64>) -> DMatrix<f64> {
    assert!(a.is_square(), "spd_solve: A must be square");
    assert_eq!(a.nrows(), b.nrows(), "spd_solve: A and B incompatible");
    let a_sym = symmetrize(a);
    match checked_cholesky(a_sym.clone()) {
        Some(ch) => ch.solve(b),
        None => pseudo_inverse(&a_sym) * b,
    }
}

/// Moore–Penrose pseudo-inverse of a symmetric matrix through its eigendecomposition.
pub fn pseudo_inverse(a: &DMatrix<f64>) -> DMatrix<f64> {
    let se = SymmetricEigen::new(symmetrize(a));
    let scale = se.eigenvalues.amax().max(1.0);
    let inv_vals = se
        .eigenvalues
        .map(|l| if l > PINV_EPS * scale { 1.0 / l } else { 0.0 });
    &se.eigenvectors * DMatrix::from_diagonal(&inv_vals) * se.eigenvectors.transpose()
}

/// Precomputed precision of a multivariate normal covariance.
///
/// Built once per distinct covariance and reused for every particle, so filters do not
/// refactorize the same noise covariance N times per step.
#[derive(Clone, Debug)]
pub struct GaussianPrecision {
    precision: DMatrix<f64>,
    log_det: f64,
    dim: usize,
    degenerate: bool,
}

impl GaussianPrecision {
    /// Factorize `cov` through Cholesky. Singular covariances fall back to the
    /// pseudo-inverse and the pseudo-determinant, and the density is flagged degenerate.
    pub fn new(cov: &DMatrix<f64>) -> Self {
        let dim = cov.nrows();
        let sym = symmetrize(cov);
        match checked_cholesky(sym.clone()) {
            Some(ch) => {
                let log_det = 2.0 * ch.l_dirty().diagonal().iter().map(|d| d.ln()).sum::<f64>();
                GaussianPrecision {
                    precision: ch.inverse(),
                    log_det,
                    dim,
                    degenerate: false,
                }
            }
            None => {
                let se = SymmetricEigen::new(sym.clone());
                let scale = se.eigenvalues.amax().max(1.0);
                let log_det = se
                    .eigenvalues
                    .iter()
                    .filter(|l| **l > PINV_EPS * scale)
                    .map(|l| l.ln())
                    .sum();
                GaussianPrecision {
                    precision: pseudo_inverse(&sym),
                    log_det,
                    dim,
                    degenerate: true,
                }
            }
        }
    }
    /// Whether the covariance had to be pseudo-inverted.
    pub fn is_degenerate(&self) -> bool {
        self.degenerate
    }
    /// Σ⁻¹, or its pseudo-inverse for degenerate Σ.
    pub fn precision(&self) -> &DMatrix<f64> {
        &self.precision
    }
    /// Mahalanobis form rᵀ Σ⁻¹ r.
    pub fn quadratic(&self, residual: &DVector<f64>) -> f64 {
        residual.dot(&(&self.precision * residual))
    }
    /// Full log density of N(0, Σ) evaluated at `residual`.
    pub fn log_density(&self, residual: &DVector<f64>) -> f64 {
        -0.5 * (self.dim as f64 * LN_2PI + self.log_det + self.quadratic(residual))
    }
    /// log N(x; μ₁, Σ) − log N(x; μ₂, Σ). The normalizing constants cancel, so this stays
    /// well defined for degenerate Σ.
    pub fn log_ratio(&self, residual_num: &DVector<f64>, residual_den: &DVector<f64>) -> f64 {
        -0.5 * (self.quadratic(residual_num) - self.quadratic(residual_den))
    }
}

/// Numerically stable log of the arithmetic mean of `exp(values)`.
///
/// Returns −∞ when every value is −∞ and NaN if any value is NaN or +∞.
pub fn log_mean_exp(values: &[f64]) -> f64 {
    if values.is_empty() {
        return f64::NEG_INFINITY;
    }
    let max = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    if max == f64::NEG_INFINITY {
        return f64::NEG_INFINITY;
    }
    if !max.is_finite() || values.iter().any(|v| v.is_nan()) {
        return f64::NAN;
    }
    let sum: f64 = values.iter().map(|v| (v - max).exp()).sum();
    max + (sum / values.len() as f64).ln()
}

/// Normalize log weights into probabilities that sum to one.
///
/// Degenerate inputs (all −∞ or non-finite) fall back to uniform weights.
pub fn normalize_log_weights(log_weights: &[f64]) -> Vec<f64> {
    let n = log_weights.len();
    let max = log_weights.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    if !max.is_finite() {
        return vec![1.0 / n as f64; n];
    }
    let mut weights: Vec<f64> = log_weights.iter().map(|w| (w - max).exp()).collect();
    let sum: f64 = weights.iter().sum();
    if sum > 0.0 && sum.is_finite() {
        for w in &mut weights {
            *w /= sum;
        }
        weights
    } else {
        vec![1.0 / n as f64; n]
    }
}

/// Draw a vector of independent standard normal variates.
pub fn standard_normal_vector<R: Rng + ?Sized>(rng: &mut R, dim: usize) -> DVector<f64> {
    DVector::from_iterator(dim, (0..dim).map(|_| rng.sample::<f64, _>(StandardNormal)))
}

/// Draw from N(mean, cov) through the robust square root of `cov`.
pub fn sample_gaussian<R: Rng + ?Sized>(
    rng: &mut R,
    mean: &DVector<f64>,
    cov: &DMatrix<f64>,
) -> DVector<f64> {
    let z = standard_normal_vector(rng, mean.len());
    mean + matrix_square_root(cov) * z
}

/* =============================== Tests ==================================== */
