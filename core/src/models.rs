//! Ready-made state-space models
//!
//! - [LocalLevelModel]: a Gaussian random walk observed in Gaussian noise. The model is linear, so
//!   the Gaussian approximation is exact and its Kalman filter likelihood can be used as a
//!   reference for the whole pipeline.
//! - [LogisticGrowthModel]: a population following discretized logistic growth with an unknown,
//!   slowly drifting growth rate.
use nalgebra::{DMatrix, DVector};

use crate::StateSpaceModel;
use crate::linalg::LN_2PI;

/// Log density of $N(\mu, \sigma^2)$ at `x`
fn normal_log_density(x: f64, mu: f64, sigma: f64) -> f64 {
    let z = (x - mu) / sigma;
    -0.5 * (LN_2PI + z * z) - sigma.ln()
}

/// Local level model
///
/// $$
/// y_t = \mu_t + \sigma_y \epsilon_t, \qquad \mu_{t+1} = \mu_t + \sigma_\eta \eta_t
/// $$
///
/// with $\theta = (\sigma_y, \sigma_\eta)$ and independent half-normal priors on both standard
/// deviations.
#[derive(Clone, Debug)]
pub struct LocalLevelModel {
    pub y: DMatrix<f64>,
    pub initial_mean: f64,
    pub initial_variance: f64,
    /// Scale of the half-normal priors
    pub prior_sd: f64,
}

impl LocalLevelModel {
    /// `y` is an `n x 1` matrix of observations, `NaN` marking missing values.
    pub fn new(y: DMatrix<f64>, initial_mean: f64, initial_variance: f64) -> Self {
        LocalLevelModel {
            y,
            initial_mean,
            initial_variance,
            prior_sd: 5.0,
        }
    }
}

impl StateSpaceModel for LocalLevelModel {
    fn observations(&self) -> &DMatrix<f64> {
        &self.y
    }
    fn state_dim(&self) -> usize {
        1
    }
    fn noise_dim(&self) -> usize {
        1
    }
    fn n_parameters(&self) -> Option<usize> {
        Some(2)
    }
    fn observation(&self, _t: usize, state: &DVector<f64>, _theta: &DVector<f64>) -> DVector<f64> {
        state.clone()
    }
    fn observation_jacobian(
        &self,
        _t: usize,
        _state: &DVector<f64>,
        _theta: &DVector<f64>,
    ) -> DMatrix<f64> {
        DMatrix::identity(1, 1)
    }
    fn transition(&self, _t: usize, state: &DVector<f64>, _theta: &DVector<f64>) -> DVector<f64> {
        state.clone()
    }
    fn transition_jacobian(
        &self,
        _t: usize,
        _state: &DVector<f64>,
        _theta: &DVector<f64>,
    ) -> DMatrix<f64> {
        DMatrix::identity(1, 1)
    }
    fn observation_noise(&self, _t: usize, theta: &DVector<f64>) -> DMatrix<f64> {
        DMatrix::from_element(1, 1, theta[0])
    }
    fn process_noise(&self, _t: usize, theta: &DVector<f64>) -> DMatrix<f64> {
        DMatrix::from_element(1, 1, theta[1])
    }
    fn initial_mean(&self, _theta: &DVector<f64>) -> DVector<f64> {
        DVector::from_element(1, self.initial_mean)
    }
    fn initial_covariance(&self, _theta: &DVector<f64>) -> DMatrix<f64> {
        DMatrix::from_element(1, 1, self.initial_variance)
    }
    fn log_prior(&self, theta: &DVector<f64>) -> f64 {
        if theta.iter().any(|s| *s < 0.0) {
            return f64::NEG_INFINITY;
        }
        theta
            .iter()
            .map(|s| std::f64::consts::LN_2 + normal_log_density(*s, 0.0, self.prior_sd))
            .sum()
    }
}

/// Logistic growth model with a drifting growth rate
///
/// The state is $\alpha_t = (r_t, p_t)$, the growth rate and the population. With
/// $e_t = \exp(r_t \Delta t)$ and capacity $K$,
///
/// $$
/// r_{t+1} = r_t + \sigma_r \eta_{1,t}, \qquad
/// p_{t+1} = \frac{K p_t e_t}{K + p_t (e_t - 1)} + \sigma_p \eta_{2,t}, \qquad
/// y_t = p_t + \sigma_y \epsilon_t
/// $$
///
/// The parameters are the log standard deviations
/// $\theta = (\log \sigma_r, \log \sigma_p, \log \sigma_y)$, each with an independent normal prior.
#[derive(Clone, Debug)]
pub struct LogisticGrowthModel {
    pub y: DMatrix<f64>,
    /// Time step $\Delta t$
    pub dt: f64,
    /// Carrying capacity $K$
    pub capacity: f64,
    pub initial_rate: f64,
    pub initial_population: f64,
    /// Diagonal of the initial state covariance, (rate, population)
    pub initial_variance: (f64, f64),
    pub prior_mean: f64,
    pub prior_sd: f64,
}

impl LogisticGrowthModel {
    pub fn new(y: DMatrix<f64>, dt: f64, initial_population: f64, capacity: f64) -> Self {
        LogisticGrowthModel {
            y,
            dt,
            capacity,
            initial_rate: 0.5,
            initial_population,
            initial_variance: (0.1, 0.25),
            prior_mean: -2.0,
            prior_sd: 2.0,
        }
    }

    fn growth(&self, r: f64, p: f64) -> (f64, f64) {
        let e = (r * self.dt).exp();
        (e, self.capacity + p * (e - 1.0))
    }
}

impl StateSpaceModel for LogisticGrowthModel {
    fn observations(&self) -> &DMatrix<f64> {
        &self.y
    }
    fn state_dim(&self) -> usize {
        2
    }
    fn noise_dim(&self) -> usize {
        2
    }
    fn n_parameters(&self) -> Option<usize> {
        Some(3)
    }
    fn observation(&self, _t: usize, state: &DVector<f64>, _theta: &DVector<f64>) -> DVector<f64> {
        DVector::from_element(1, state[1])
    }
    fn observation_jacobian(
        &self,
        _t: usize,
        _state: &DVector<f64>,
        _theta: &DVector<f64>,
    ) -> DMatrix<f64> {
        DMatrix::from_row_slice(1, 2, &[0.0, 1.0])
    }
    fn transition(&self, _t: usize, state: &DVector<f64>, _theta: &DVector<f64>) -> DVector<f64> {
        let (r, p) = (state[0], state[1]);
        let (e, denom) = self.growth(r, p);
        DVector::from_vec(vec![r, self.capacity * p * e / denom])
    }
    fn transition_jacobian(
        &self,
        _t: usize,
        state: &DVector<f64>,
        _theta: &DVector<f64>,
    ) -> DMatrix<f64> {
        let (r, p) = (state[0], state[1]);
        let k = self.capacity;
        let (e, denom) = self.growth(r, p);
        let d2 = denom * denom;
        let dp_dr = self.dt * e * k * p * (k - p) / d2;
        let dp_dp = k * k * e / d2;
        DMatrix::from_row_slice(2, 2, &[1.0, 0.0, dp_dr, dp_dp])
    }
    fn observation_noise(&self, _t: usize, theta: &DVector<f64>) -> DMatrix<f64> {
        DMatrix::from_element(1, 1, theta[2].exp())
    }
    fn process_noise(&self, _t: usize, theta: &DVector<f64>) -> DMatrix<f64> {
        DMatrix::from_diagonal(&DVector::from_vec(vec![theta[0].exp(), theta[1].exp()]))
    }
    fn initial_mean(&self, _theta: &DVector<f64>) -> DVector<f64> {
        DVector::from_vec(vec![self.initial_rate, self.initial_population])
    }
    fn initial_covariance(&self, _theta: &DVector<f64>) -> DMatrix<f64> {
        let (var_r, var_p) = self.initial_variance;
        DMatrix::from_diagonal(&DVector::from_vec(vec![var_r, var_p]))
    }
    fn log_prior(&self, theta: &DVector<f64>) -> f64 {
        theta
            .iter()
            .map(|x| normal_log_density(*x, self.prior_mean, self.prior_sd))
            .sum()
    }
}
