//! Linear-Gaussian state-space model used as the surrogate of a nonlinear model.
//!
//! The model is
//!
//! $$
//! y_t = D_t + Z_t \alpha_t + H_t \epsilon_t, \qquad
//! \alpha_{t+1} = C_t + T_t \alpha_t + R_t \eta_t, \qquad
//! \alpha_1 \sim N(a_1, P_1)
//! $$
//!
//! with time varying system matrices. `H` and `R` hold either a single slice (constant) or one slice
//! per time point. Observations with any non-finite component are treated as missing and skip the
//! measurement update.
//!
//! The filter follows the same predict/update cycle as an extended Kalman filter, with the
//! covariance update written in Joseph form:
//!
//! $$
//! \begin{aligned}
//! F_t &= Z_t P_t Z_t^T + H_t H_t^T \\\\
//! K_t &= P_t Z_t^T F_t^{-1} \\\\
//! a_{t|t} &= a_t + K_t (y_t - Z_t a_t - D_t) \\\\
//! P_{t|t} &= (I - K_t Z_t) P_t (I - K_t Z_t)^T + K_t H_t H_t^T K_t^T \\\\
//! a_{t+1} &= T_t a_{t|t} + C_t \\\\
//! P_{t+1} &= T_t P_{t|t} T_t^T + R_t R_t^T
//! \end{aligned}
//! $$
use nalgebra::{DMatrix, DVector};
use rand::Rng;

use crate::linalg::{GaussianPrecision, sample_gaussian, spd_solve, symmetrize};

/// Observation row `t` of an `n x p` matrix, or `None` if any component is missing.
pub fn observed_row(y: &DMatrix<f64>, t: usize) -> Option<DVector<f64>> {
    let row: DVector<f64> = y.row(t).transpose();
    if row.iter().all(|v| v.is_finite()) {
        Some(row)
    } else {
        None
    }
}

/// Linear-Gaussian state-space model with time varying system matrices.
#[derive(Clone, Debug)]
pub struct LinearGaussianSsm {
    /// Observations, `n x p`
    pub y: DMatrix<f64>,
    /// Observation matrices, `n` slices of `p x m`
    pub z: Vec<DMatrix<f64>>,
    /// Observation noise loadings, `1` or `n` slices of `p x p`
    pub h: Vec<DMatrix<f64>>,
    /// Transition matrices, `n` slices of `m x m`
    pub t: Vec<DMatrix<f64>>,
    /// Process noise loadings, `1` or `n` slices of `m x k`
    pub r: Vec<DMatrix<f64>>,
    /// Observation intercepts, `n` vectors of length `p`
    pub d: Vec<DVector<f64>>,
    /// Transition intercepts, `n` vectors of length `m`
    pub c: Vec<DVector<f64>>,
    pub a1: DVector<f64>,
    pub p1: DMatrix<f64>,
}

/// Predicted and filtered moments from [LinearGaussianSsm::filter].
#[derive(Clone, Debug)]
pub struct KalmanFilterOutput {
    /// $a_t$ for `t = 0..=n`; the last entry is the one step ahead prediction past the data
    pub predicted_mean: Vec<DVector<f64>>,
    pub predicted_covariance: Vec<DMatrix<f64>>,
    /// $a_{t|t}$ for `t = 0..n`
    pub filtered_mean: Vec<DVector<f64>>,
    pub filtered_covariance: Vec<DMatrix<f64>>,
    pub log_likelihood: f64,
}

/// Smoothed moments from [LinearGaussianSsm::smoother].
#[derive(Clone, Debug)]
pub struct SmootherOutput {
    /// Smoothed means, `m x n`
    pub mean: DMatrix<f64>,
    /// Smoothed covariances $V_t$, `n` slices
    pub covariance: Vec<DMatrix<f64>>,
    /// Lag-one cross-covariances $Cov(\alpha_t, \alpha_{t+1} | y)$, `n - 1` slices
    pub cross_covariance: Vec<DMatrix<f64>>,
    pub log_likelihood: f64,
}

impl SmootherOutput {
    /// Mean and covariance of $\alpha_{t+1} | \alpha_t, y$ as `(offset, gain, covariance)` so that
    /// the conditional mean is `offset + gain * alpha_t`.
    pub fn conditional(&self, t: usize) -> (DVector<f64>, DMatrix<f64>, DMatrix<f64>) {
        let cross = &self.cross_covariance[t];
        // G = Cᵀ V_t⁻¹
        let gain = spd_solve(&self.covariance[t], cross).transpose();
        let offset = self.mean.column(t + 1).clone_owned() - &gain * self.mean.column(t);
        let covariance = symmetrize(&(&self.covariance[t + 1] - &gain * cross));
        (offset, gain, covariance)
    }
}

/// Slice `t` of a possibly constant sequence of system matrices.
pub(crate) fn slice_at<T>(slices: &[T], t: usize) -> &T {
    if slices.len() == 1 { &slices[0] } else { &slices[t] }
}

impl LinearGaussianSsm {
    /// Time invariant model with zero intercepts, replicated over the rows of `y`.
    pub fn time_invariant(
        y: DMatrix<f64>,
        z: DMatrix<f64>,
        h: DMatrix<f64>,
        t: DMatrix<f64>,
        r: DMatrix<f64>,
        a1: DVector<f64>,
        p1: DMatrix<f64>,
    ) -> Self {
        let n = y.nrows();
        let p = y.ncols();
        let m = a1.len();
        LinearGaussianSsm {
            y,
            z: vec![z; n],
            h: vec![h],
            t: vec![t; n],
            r: vec![r],
            d: vec![DVector::zeros(p); n],
            c: vec![DVector::zeros(m); n],
            a1,
            p1,
        }
    }
    pub fn n_time(&self) -> usize {
        self.y.nrows()
    }
    pub fn observation_dim(&self) -> usize {
        self.y.ncols()
    }
    pub fn state_dim(&self) -> usize {
        self.a1.len()
    }
    pub fn noise_dim(&self) -> usize {
        self.r.first().map_or(0, |r| r.ncols())
    }
    /// $H_t H_t^T$
    pub fn observation_covariance(&self, t: usize) -> DMatrix<f64> {
        let h = slice_at(&self.h, t);
        h * h.transpose()
    }
    /// $R_t R_t^T$
    pub fn state_covariance(&self, t: usize) -> DMatrix<f64> {
        let r = slice_at(&self.r, t);
        r * r.transpose()
    }
    /// $N(0, H_t H_t^T)$ densities, one per `H` slice (use with the slice index rules of `H`).
    pub fn observation_densities(&self) -> Vec<GaussianPrecision> {
        self.h
            .iter()
            .map(|h| GaussianPrecision::new(&(h * h.transpose())))
            .collect()
    }
    /// $N(0, R_t R_t^T)$ densities, one per `R` slice.
    pub fn state_densities(&self) -> Vec<GaussianPrecision> {
        self.r
            .iter()
            .map(|r| GaussianPrecision::new(&(r * r.transpose())))
            .collect()
    }
    /// Check the number of slices and the shape of every system matrix.
    pub fn validate(&self) -> anyhow::Result<()> {
        let n = self.n_time();
        let p = self.observation_dim();
        let m = self.state_dim();
        let k = self.noise_dim();
        anyhow::ensure!(
            self.z.len() == n && self.t.len() == n && self.d.len() == n && self.c.len() == n,
            "Z, T, D and C need one slice per time point ({n})"
        );
        anyhow::ensure!(
            self.h.len() == 1 || self.h.len() == n,
            "H needs 1 or {n} slices, got {}",
            self.h.len()
        );
        anyhow::ensure!(
            self.r.len() == 1 || self.r.len() == n,
            "R needs 1 or {n} slices, got {}",
            self.r.len()
        );
        anyhow::ensure!(self.p1.shape() == (m, m), "P1 must be {m} x {m}");
        for t in 0..n {
            anyhow::ensure!(self.z[t].shape() == (p, m), "Z[{t}] must be {p} x {m}");
            anyhow::ensure!(self.t[t].shape() == (m, m), "T[{t}] must be {m} x {m}");
            anyhow::ensure!(self.d[t].len() == p, "D[{t}] must have length {p}");
            anyhow::ensure!(self.c[t].len() == m, "C[{t}] must have length {m}");
        }
        for (i, h) in self.h.iter().enumerate() {
            anyhow::ensure!(h.shape() == (p, p), "H[{i}] must be {p} x {p}");
        }
        for (i, r) in self.r.iter().enumerate() {
            anyhow::ensure!(r.shape() == (m, k), "R[{i}] must be {m} x {k}");
        }
        Ok(())
    }

    /// Run the Kalman filter and return predicted and filtered moments together with the
    /// prediction error decomposition of the log-likelihood.
    ///
    /// A singular innovation covariance makes the log-likelihood −∞; the moments are still
    /// computed with a pseudo-inverse gain.
    pub fn filter(&self) -> KalmanFilterOutput {
        let n = self.n_time();
        let m = self.state_dim();
        let mut predicted_mean = Vec::with_capacity(n + 1);
        let mut predicted_covariance = Vec::with_capacity(n + 1);
        let mut filtered_mean = Vec::with_capacity(n);
        let mut filtered_covariance = Vec::with_capacity(n);
        let mut log_likelihood = 0.0;

        let mut a = self.a1.clone();
        let mut p = symmetrize(&self.p1);
        for t in 0..n {
            predicted_mean.push(a.clone());
            predicted_covariance.push(p.clone());
            let (att, ptt) = match observed_row(&self.y, t) {
                None => (a, p),
                Some(y_t) => {
                    let z = &self.z[t];
                    let hh = self.observation_covariance(t);
                    let innovation = y_t - z * &a - &self.d[t];
                    let f = symmetrize(&(z * &p * z.transpose() + &hh));
                    let density = GaussianPrecision::new(&f);
                    if density.is_degenerate() {
                        log_likelihood = f64::NEG_INFINITY;
                    } else {
                        log_likelihood += density.log_density(&innovation);
                    }
                    let gain = &p * z.transpose() * density.precision();
                    let att = &a + &gain * &innovation;
                    let i_kz = DMatrix::identity(m, m) - &gain * z;
                    let ptt = symmetrize(
                        &(&i_kz * &p * i_kz.transpose() + &gain * &hh * gain.transpose()),
                    );
                    (att, ptt)
                }
            };
            let tt = &self.t[t];
            a = tt * &att + &self.c[t];
            p = symmetrize(&(tt * &ptt * tt.transpose() + self.state_covariance(t)));
            filtered_mean.push(att);
            filtered_covariance.push(ptt);
        }
        predicted_mean.push(a);
        predicted_covariance.push(p);
        KalmanFilterOutput {
            predicted_mean,
            predicted_covariance,
            filtered_mean,
            filtered_covariance,
            log_likelihood,
        }
    }

    pub fn log_likelihood(&self) -> f64 {
        self.filter().log_likelihood
    }

    /// $J_t = P_{t|t} T_t^T P_{t+1}^{-1}$
    fn smoother_gain(&self, kf: &KalmanFilterOutput, t: usize) -> DMatrix<f64> {
        spd_solve(
            &kf.predicted_covariance[t + 1],
            &(&self.t[t] * &kf.filtered_covariance[t]),
        )
        .transpose()
    }

    /// Fixed-interval (Rauch-Tung-Striebel) smoother.
    pub fn smoother(&self) -> SmootherOutput {
        let n = self.n_time();
        let m = self.state_dim();
        let kf = self.filter();
        let mut mean = DMatrix::zeros(m, n);
        let mut covariance = vec![DMatrix::zeros(m, m); n];
        let mut cross_covariance = vec![DMatrix::zeros(m, m); n.saturating_sub(1)];
        if n == 0 {
            return SmootherOutput {
                mean,
                covariance,
                cross_covariance,
                log_likelihood: kf.log_likelihood,
            };
        }
        let mut next_mean = kf.filtered_mean[n - 1].clone();
        let mut next_cov = kf.filtered_covariance[n - 1].clone();
        mean.set_column(n - 1, &next_mean);
        covariance[n - 1] = next_cov.clone();
        for t in (0..n - 1).rev() {
            let gain = self.smoother_gain(&kf, t);
            let m_t = &kf.filtered_mean[t] + &gain * (&next_mean - &kf.predicted_mean[t + 1]);
            let v_t = symmetrize(
                &(&kf.filtered_covariance[t]
                    + &gain * (&next_cov - &kf.predicted_covariance[t + 1]) * gain.transpose()),
            );
            cross_covariance[t] = &gain * &next_cov;
            mean.set_column(t, &m_t);
            covariance[t] = v_t.clone();
            next_mean = m_t;
            next_cov = v_t;
        }
        SmootherOutput {
            mean,
            covariance,
            cross_covariance,
            log_likelihood: kf.log_likelihood,
        }
    }

    /// Draw one state trajectory (`m x n`) from $\tilde p(\alpha | y)$ by forward filtering and
    /// backward sampling.
    pub fn simulate_states<R: Rng + ?Sized>(&self, rng: &mut R) -> DMatrix<f64> {
        let n = self.n_time();
        let m = self.state_dim();
        let mut draws = DMatrix::zeros(m, n);
        if n == 0 {
            return draws;
        }
        let kf = self.filter();
        let mut next = sample_gaussian(
            rng,
            &kf.filtered_mean[n - 1],
            &kf.filtered_covariance[n - 1],
        );
        draws.set_column(n - 1, &next);
        for t in (0..n - 1).rev() {
            let gain = self.smoother_gain(&kf, t);
            let mean = &kf.filtered_mean[t] + &gain * (&next - &kf.predicted_mean[t + 1]);
            let cov = symmetrize(
                &(&kf.filtered_covariance[t]
                    - &gain * &kf.predicted_covariance[t + 1] * gain.transpose()),
            );
            next = sample_gaussian(rng, &mean, &cov);
            draws.set_column(t, &next);
        }
        draws
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn scalar(v: f64) -> DMatrix<f64> {
        DMatrix::from_element(1, 1, v)
    }

    /// Constant level observed three times with unit noise and a N(0, 1) prior.
    fn static_level() -> LinearGaussianSsm {
        LinearGaussianSsm::time_invariant(
            DMatrix::from_row_slice(3, 1, &[1.0, 2.0, 3.0]),
            scalar(1.0),
            scalar(1.0),
            scalar(1.0),
            scalar(0.0),
            DVector::from_element(1, 0.0),
            scalar(1.0),
        )
    }

    fn normal_log_pdf(x: f64, mean: f64, var: f64) -> f64 {
        -0.5 * ((2.0 * std::f64::consts::PI * var).ln() + (x - mean).powi(2) / var)
    }

    #[test]
    fn t_single_observation_log_likelihood() {
        let model = LinearGaussianSsm::time_invariant(
            DMatrix::from_element(1, 1, 0.7),
            scalar(2.0),
            scalar(0.5),
            scalar(1.0),
            scalar(1.0),
            DVector::from_element(1, 0.1),
            scalar(3.0),
        );
        // y ~ N(2 * 0.1, 4 * 3 + 0.25)
        assert_approx_eq!(
            model.log_likelihood(),
            normal_log_pdf(0.7, 0.2, 12.25),
            1e-12
        );
    }

    #[test]
    fn t_missing_observation_skips_update() {
        let mut model = LinearGaussianSsm::time_invariant(
            DMatrix::from_row_slice(2, 1, &[0.5, f64::NAN]),
            scalar(1.0),
            scalar(1.0),
            scalar(1.0),
            scalar(1.0),
            DVector::from_element(1, 0.0),
            scalar(1.0),
        );
        assert_approx_eq!(model.log_likelihood(), normal_log_pdf(0.5, 0.0, 2.0), 1e-12);
        let kf = model.filter();
        assert_eq!(kf.filtered_mean[1], kf.predicted_mean[1]);
        assert_eq!(kf.predicted_mean.len(), 3);

        model.y[(1, 0)] = f64::INFINITY;
        assert_approx_eq!(model.log_likelihood(), normal_log_pdf(0.5, 0.0, 2.0), 1e-12);
    }

    #[test]
    fn t_singular_innovation_gives_negative_infinity() {
        let model = LinearGaussianSsm::time_invariant(
            DMatrix::from_element(1, 1, 1.0),
            scalar(1.0),
            scalar(0.0),
            scalar(1.0),
            scalar(0.0),
            DVector::from_element(1, 0.0),
            scalar(0.0),
        );
        assert_eq!(model.log_likelihood(), f64::NEG_INFINITY);
    }

    #[test]
    fn t_smoother_static_level() {
        let out = static_level().smoother();
        // Posterior of the level: precision 1 + 3, mean 6 / 4.
        for t in 0..3 {
            assert_approx_eq!(out.mean[(0, t)], 1.5, 1e-10);
            assert_approx_eq!(out.covariance[t][(0, 0)], 0.25, 1e-10);
        }
        for cross in &out.cross_covariance {
            assert_approx_eq!(cross[(0, 0)], 0.25, 1e-10);
        }
        let (offset, gain, cov) = out.conditional(0);
        assert_approx_eq!(gain[(0, 0)], 1.0, 1e-10);
        assert_approx_eq!(offset[0], 0.0, 1e-10);
        assert_approx_eq!(cov[(0, 0)], 0.0, 1e-10);
    }

    #[test]
    fn t_smoother_last_step_equals_filter() {
        let mut model = static_level();
        model.r = vec![scalar(0.3)];
        let kf = model.filter();
        let out = model.smoother();
        assert_approx_eq!(out.mean[(0, 2)], kf.filtered_mean[2][0], 1e-12);
        assert_approx_eq!(
            out.covariance[2][(0, 0)],
            kf.filtered_covariance[2][(0, 0)],
            1e-12
        );
        assert_approx_eq!(out.log_likelihood, kf.log_likelihood, 1e-12);
    }

    #[test]
    fn t_simulation_smoother_matches_smoothed_mean() {
        let model = static_level();
        let mut rng = StdRng::seed_from_u64(11);
        let draws: Vec<DMatrix<f64>> = (0..4000).map(|_| model.simulate_states(&mut rng)).collect();
        for d in &draws {
            // Without process noise the level is constant over time.
            assert_approx_eq!(d[(0, 0)], d[(0, 2)], 1e-4);
        }
        let mean = draws.iter().map(|d| d[(0, 1)]).sum::<f64>() / draws.len() as f64;
        assert_approx_eq!(mean, 1.5, 0.05);
        let var = draws.iter().map(|d| (d[(0, 1)] - mean).powi(2)).sum::<f64>()
            / (draws.len() - 1) as f64;
        assert_approx_eq!(var, 0.25, 0.03);
    }

    #[test]
    fn t_validate_shapes() {
        let mut model = static_level();
        assert!(model.validate().is_ok());
        model.h = vec![scalar(1.0), scalar(1.0)];
        assert!(model.validate().is_err());
        let mut model = static_level();
        model.z[1] = DMatrix::zeros(2, 1);
        assert!(model.validate().is_err());
    }
}
