//! Linearization of nonlinear state-space models and the iterated Gaussian approximation
//!
//! A [StateSpaceModel] is turned into a [LinearGaussianSsm] by a first order Taylor expansion of the
//! observation and transition functions around a state trajectory $\hat\alpha$:
//!
//! $$
//! \begin{aligned}
//! Z_t &= \frac{\partial Z}{\partial \alpha}\big|_{\hat\alpha_t}, &
//! D_t &= Z(t, \hat\alpha_t) - Z_t \hat\alpha_t \\\\
//! T_t &= \frac{\partial T}{\partial \alpha}\big|_{\hat\alpha_t}, &
//! C_t &= T(t, \hat\alpha_t) - T_t \hat\alpha_t
//! \end{aligned}
//! $$
//!
//! [approximate] repeats smoothing and relinearization until the smoothed trajectory (the mode)
//! stops moving. The extended Kalman smoother provides the starting trajectory when no previous mode
//! is available, optionally refined by a few rounds of the iterated extended smoother
//! ([iekf_smoother]).
use log::debug;
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::StateSpaceModel;
use crate::linalg::{GaussianPrecision, symmetrize};
use crate::surrogate::{KalmanFilterOutput, LinearGaussianSsm, observed_row, slice_at};

fn default_max_iter() -> usize {
    100
}
fn default_conv_tol() -> f64 {
    1e-8
}

/// Stopping rules of the iterated linearization.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ApproximationOptions {
    /// Maximum number of smoothing/relinearization rounds
    #[serde(default = "default_max_iter")]
    pub max_iter: usize,
    /// Tolerance on the mean squared change of the mode between rounds
    #[serde(default = "default_conv_tol")]
    pub conv_tol: f64,
    /// Rounds of the iterated extended smoother refining the starting trajectory; zero starts
    /// from the plain extended smoother
    #[serde(default)]
    pub iekf_iter: usize,
}

impl Default for ApproximationOptions {
    fn default() -> Self {
        ApproximationOptions {
            max_iter: default_max_iter(),
            conv_tol: default_conv_tol(),
            iekf_iter: 0,
        }
    }
}

/// Result of [approximate].
#[derive(Clone, Debug)]
pub struct Approximation {
    /// Linear-Gaussian model linearized at `mode`
    pub surrogate: LinearGaussianSsm,
    /// Approximate posterior mode of the states, `m x n`
    pub mode: DMatrix<f64>,
    /// Sum of the per time point scaling factors
    pub scales: f64,
    /// Surrogate log-likelihood plus `scales`
    pub log_likelihood: f64,
    pub iterations: usize,
    pub converged: bool,
}

fn noise_slices<F>(time_varying: bool, n: usize, f: F) -> Vec<DMatrix<f64>>
where
    F: Fn(usize) -> DMatrix<f64>,
{
    if time_varying {
        (0..n).map(f).collect()
    } else {
        vec![f(0)]
    }
}

/// Linearize `model` around the trajectory `mode` (`m x n`).
pub fn linearize<M: StateSpaceModel>(
    model: &M,
    theta: &DVector<f64>,
    mode: &DMatrix<f64>,
) -> LinearGaussianSsm {
    let n = model.n_time();
    let mut z = Vec::with_capacity(n);
    let mut t_mats = Vec::with_capacity(n);
    let mut d = Vec::with_capacity(n);
    let mut c = Vec::with_capacity(n);
    for t in 0..n {
        let point: DVector<f64> = mode.column(t).clone_owned();
        let zt = model.observation_jacobian(t, &point, theta);
        let tt = model.transition_jacobian(t, &point, theta);
        d.push(model.observation(t, &point, theta) - &zt * &point);
        c.push(model.transition(t, &point, theta) - &tt * &point);
        z.push(zt);
        t_mats.push(tt);
    }
    LinearGaussianSsm {
        y: model.observations().clone(),
        z,
        h: noise_slices(model.observation_noise_time_varying(), n, |t| {
            model.observation_noise(t, theta)
        }),
        t: t_mats,
        r: noise_slices(model.process_noise_time_varying(), n, |t| {
            model.process_noise(t, theta)
        }),
        d,
        c,
        a1: model.initial_mean(theta),
        p1: model.initial_covariance(theta),
    }
}

/// Per time point log ratios between the nonlinear and the linearized densities at `mode`:
///
/// $$
/// \log g(y_t | \hat\alpha_t) - \log \tilde g(y_t | \hat\alpha_t)
/// + \log f(\hat\alpha_{t+1} | \hat\alpha_t) - \log \tilde f(\hat\alpha_{t+1} | \hat\alpha_t)
/// $$
///
/// Both densities share the noise covariance so the normalizing constants cancel.
pub fn scaling_factors<M: StateSpaceModel>(
    model: &M,
    theta: &DVector<f64>,
    surrogate: &LinearGaussianSsm,
    mode: &DMatrix<f64>,
) -> DVector<f64> {
    let n = model.n_time();
    let observation_densities = surrogate.observation_densities();
    let state_densities = surrogate.state_densities();
    DVector::from_iterator(
        n,
        (0..n).map(|t| {
            let point: DVector<f64> = mode.column(t).clone_owned();
            let mut scale = 0.0;
            if let Some(y_t) = observed_row(&surrogate.y, t) {
                let exact = &y_t - model.observation(t, &point, theta);
                let approx = &y_t - &surrogate.z[t] * &point - &surrogate.d[t];
                scale += slice_at(&observation_densities, t).log_ratio(&exact, &approx);
            }
            if t + 1 < n {
                let next: DVector<f64> = mode.column(t + 1).clone_owned();
                let exact = &next - model.transition(t, &point, theta);
                let approx = &next - &surrogate.t[t] * &point - &surrogate.c[t];
                scale += slice_at(&state_densities, t).log_ratio(&exact, &approx);
            }
            scale
        }),
    )
}

/// Output of the extended Kalman filter.
#[derive(Clone, Debug)]
pub struct EkfOutput {
    /// Linear model holding the EKF linearization: `Z_t` at the predicted and `T_t` at the
    /// filtered state. Running the Kalman filter on it reproduces the EKF exactly.
    pub linearization: LinearGaussianSsm,
    pub filter: KalmanFilterOutput,
}

/// Extended Kalman filter.
///
/// The observation function is linearized at the predicted state $a_t$ and the transition at the
/// filtered state $a_{t|t}$, as in the usual predict/update cycle. The predicted and filtered
/// moments and the log-likelihood are returned together with the linearization itself so that an
/// extended smoother is a plain linear smoother on it.
pub fn ekf_filter<M: StateSpaceModel>(model: &M, theta: &DVector<f64>) -> EkfOutput {
    let n = model.n_time();
    let m = model.state_dim();
    let y = model.observations();
    let mut linearization = LinearGaussianSsm {
        y: y.clone(),
        z: Vec::with_capacity(n),
        h: noise_slices(model.observation_noise_time_varying(), n, |t| {
            model.observation_noise(t, theta)
        }),
        t: Vec::with_capacity(n),
        r: noise_slices(model.process_noise_time_varying(), n, |t| {
            model.process_noise(t, theta)
        }),
        d: Vec::with_capacity(n),
        c: Vec::with_capacity(n),
        a1: model.initial_mean(theta),
        p1: model.initial_covariance(theta),
    };

    let mut a = linearization.a1.clone();
    let mut p = symmetrize(&linearization.p1);
    for t in 0..n {
        // Update: linearize Z at the predicted state
        let zt = model.observation_jacobian(t, &a, theta);
        linearization
            .d
            .push(model.observation(t, &a, theta) - &zt * &a);
        let (att, ptt) = match observed_row(y, t) {
            None => (a, p),
            Some(y_t) => {
                let hh = linearization.observation_covariance(t);
                let innovation = y_t - &zt * &a - &linearization.d[t];
                let f = symmetrize(&(&zt * &p * zt.transpose() + &hh));
                let gain = &p * zt.transpose() * GaussianPrecision::new(&f).precision();
                let i_kz = DMatrix::identity(m, m) - &gain * &zt;
                let ptt =
                    symmetrize(&(&i_kz * &p * i_kz.transpose() + &gain * &hh * gain.transpose()));
                (&a + &gain * innovation, ptt)
            }
        };
        linearization.z.push(zt);
        // Predict: linearize T at the filtered state
        let tt = model.transition_jacobian(t, &att, theta);
        a = model.transition(t, &att, theta);
        linearization.c.push(&a - &tt * &att);
        p = symmetrize(&(&tt * &ptt * tt.transpose() + linearization.state_covariance(t)));
        linearization.t.push(tt);
    }
    let filter = linearization.filter();
    EkfOutput {
        linearization,
        filter,
    }
}

/// Extended Kalman smoother estimate of the states (`m x n`).
pub fn ekf_smoother<M: StateSpaceModel>(model: &M, theta: &DVector<f64>) -> DMatrix<f64> {
    ekf_filter(model, theta).linearization.smoother().mean
}

/// Iterated extended Kalman smoother estimate of the states (`m x n`).
///
/// Unlike [ekf_smoother], which linearizes at the running predicted and filtered states, both
/// Jacobians are evaluated at the columns of `guess`.
pub fn iekf_smoother<M: StateSpaceModel>(
    model: &M,
    theta: &DVector<f64>,
    guess: &DMatrix<f64>,
) -> DMatrix<f64> {
    linearize(model, theta, guess).smoother().mean
}

fn mean_squared_change(new: &DMatrix<f64>, old: &DMatrix<f64>) -> f64 {
    (new - old).norm_squared() / (new.nrows() * new.ncols()).max(1) as f64
}

/// Starting trajectory of [approximate]: the extended smoother, relinearized by up to `iekf_iter`
/// rounds of [iekf_smoother] until the mean squared change drops below `conv_tol`.
fn starting_mode<M: StateSpaceModel>(
    model: &M,
    theta: &DVector<f64>,
    options: &ApproximationOptions,
) -> DMatrix<f64> {
    let mut mode = ekf_smoother(model, theta);
    for _ in 0..options.iekf_iter {
        let new_mode = iekf_smoother(model, theta, &mode);
        let diff = mean_squared_change(&new_mode, &mode);
        mode = new_mode;
        if !diff.is_finite() || diff < options.conv_tol {
            break;
        }
    }
    mode
}

/// Find the Gaussian approximation of `model` at `theta`.
///
/// Starting from `initial_mode` (or the extended Kalman smoother estimate, refined by `iekf_iter`
/// iterated smoother rounds), the model is
/// linearized, smoothed and relinearized at the smoothed means until the mean squared change of the
/// mode falls below `conv_tol` or `max_iter` rounds ran. Non-convergence is not an error: the last
/// mode is used.
pub fn approximate<M: StateSpaceModel>(
    model: &M,
    theta: &DVector<f64>,
    initial_mode: Option<&DMatrix<f64>>,
    options: &ApproximationOptions,
) -> Approximation {
    let mut mode = match initial_mode {
        Some(mode) => mode.clone(),
        None => starting_mode(model, theta, options),
    };
    let mut surrogate = linearize(model, theta, &mode);
    let mut iterations = 0;
    let mut converged = false;
    while iterations < options.max_iter {
        iterations += 1;
        let new_mode = surrogate.smoother().mean;
        let diff = mean_squared_change(&new_mode, &mode);
        mode = new_mode;
        surrogate = linearize(model, theta, &mode);
        if !diff.is_finite() {
            break;
        }
        if diff < options.conv_tol {
            converged = true;
            break;
        }
    }
    if !converged {
        debug!(
            "Linearization did not converge after {} iterations at theta = {:?}",
            iterations,
            theta.as_slice()
        );
    }
    let scales = scaling_factors(model, theta, &surrogate, &mode).sum();
    let log_likelihood = surrogate.log_likelihood() + scales;
    Approximation {
        surrogate,
        mode,
        scales,
        log_likelihood,
        iterations,
        converged,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{LocalLevelModel, LogisticGrowthModel};
    use assert_approx_eq::assert_approx_eq;

    fn local_level() -> (LocalLevelModel, DVector<f64>) {
        let y = DMatrix::from_row_slice(6, 1, &[1.0, 1.4, f64::NAN, 0.8, 1.9, 2.2]);
        (
            LocalLevelModel::new(y, 0.0, 10.0),
            DVector::from_vec(vec![0.7, 0.4]),
        )
    }

    fn logistic() -> (LogisticGrowthModel, DVector<f64>) {
        let y = DMatrix::from_row_slice(
            8,
            1,
            &[1.1, 1.5, 2.3, 3.0, f64::NAN, 5.6, 6.9, 7.8],
        );
        (
            LogisticGrowthModel::new(y, 0.5, 1.0, 10.0),
            DVector::from_vec(vec![-3.0, -2.0, -1.0]),
        )
    }

    #[test]
    fn t_linear_model_is_exact() {
        let (model, theta) = local_level();
        let approx = approximate(&model, &theta, None, &ApproximationOptions::default());
        assert!(approx.converged);
        assert!(approx.iterations <= 2);
        assert_approx_eq!(approx.scales, 0.0, 1e-12);
        let exact = linearize(&model, &theta, &DMatrix::zeros(1, 6));
        assert_approx_eq!(approx.log_likelihood, exact.log_likelihood(), 1e-9);
        let smoothed = exact.smoother().mean;
        for t in 0..6 {
            assert_approx_eq!(approx.mode[(0, t)], smoothed[(0, t)], 1e-9);
        }
    }

    #[test]
    fn t_ekf_on_linear_model_matches_kalman_filter() {
        let (model, theta) = local_level();
        let ekf = ekf_filter(&model, &theta);
        let kf = linearize(&model, &theta, &DMatrix::zeros(1, 6)).filter();
        assert_approx_eq!(ekf.filter.log_likelihood, kf.log_likelihood, 1e-12);
        assert_approx_eq!(ekf.filter.filtered_mean[5][0], kf.filtered_mean[5][0], 1e-12);
    }

    #[test]
    fn t_logistic_approximation_converges_deterministically() {
        let (model, theta) = logistic();
        let options = ApproximationOptions::default();
        let first = approximate(&model, &theta, None, &options);
        let second = approximate(&model, &theta, None, &options);
        assert!(first.converged);
        assert!(first.log_likelihood.is_finite());
        assert_eq!(first.mode, second.mode);
        assert_eq!(first.log_likelihood, second.log_likelihood);

        // Restarting from the converged mode needs a single round.
        let restart = approximate(&model, &theta, Some(&first.mode), &options);
        assert!(restart.converged);
        assert_eq!(restart.iterations, 1);
        assert_approx_eq!(restart.log_likelihood, first.log_likelihood, 1e-6);
    }

    #[test]
    fn t_scaling_factors_vanish_at_linearization_point() {
        let (model, theta) = logistic();
        let approx = approximate(&model, &theta, None, &ApproximationOptions::default());
        let at_mode = scaling_factors(&model, &theta, &approx.surrogate, &approx.mode);
        assert!(at_mode.iter().all(|s| s.abs() < 1e-8));

        // Linearized elsewhere the linear densities differ from the nonlinear ones.
        let shifted = approx.mode.map(|v| v * 1.3);
        let elsewhere = linearize(&model, &theta, &shifted);
        let off = scaling_factors(&model, &theta, &elsewhere, &approx.mode);
        assert!(off.iter().any(|s| s.abs() > 1e-6));
    }

    #[test]
    fn t_zero_iterations_keeps_initial_mode() {
        let (model, theta) = logistic();
        let options = ApproximationOptions {
            max_iter: 0,
            ..ApproximationOptions::default()
        };
        let guess = ekf_smoother(&model, &theta);
        let approx = approximate(&model, &theta, None, &options);
        assert!(!approx.converged);
        assert_eq!(approx.iterations, 0);
        assert_eq!(approx.mode, guess);
    }

    #[test]
    fn t_iterated_smoother_starts_closer_to_the_mode() {
        let (model, theta) = logistic();
        let converged = approximate(&model, &theta, None, &ApproximationOptions::default());
        let plain = ApproximationOptions {
            max_iter: 0,
            ..ApproximationOptions::default()
        };
        let iterated = ApproximationOptions {
            iekf_iter: 3,
            ..plain
        };
        let ekf_start = approximate(&model, &theta, None, &plain).mode;
        let iekf_start = approximate(&model, &theta, None, &iterated).mode;
        let ekf_gap = mean_squared_change(&ekf_start, &converged.mode);
        let iekf_gap = mean_squared_change(&iekf_start, &converged.mode);
        assert!(ekf_gap > 0.0);
        assert!(iekf_gap < ekf_gap, "iekf {iekf_gap} ekf {ekf_gap}");

        // The warm start changes where the iteration begins, not where it ends.
        let warm = approximate(
            &model,
            &theta,
            None,
            &ApproximationOptions {
                iekf_iter: 3,
                ..ApproximationOptions::default()
            },
        );
        assert!(warm.converged);
        assert_approx_eq!(warm.log_likelihood, converged.log_likelihood, 1e-6);
    }

    #[test]
    fn t_iterated_smoother_is_exact_for_linear_model() {
        let (model, theta) = local_level();
        let smoothed = linearize(&model, &theta, &DMatrix::zeros(1, 6)).smoother().mean;
        let guess = DMatrix::from_element(1, 6, 5.0);
        let iekf = iekf_smoother(&model, &theta, &guess);
        for t in 0..6 {
            assert_approx_eq!(iekf[(0, t)], smoothed[(0, t)], 1e-9);
        }
    }
}
