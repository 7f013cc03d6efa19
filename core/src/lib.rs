//! Approximate MCMC with importance-sampling correction for nonlinear Gaussian state-space models
//!
//! This crate performs Bayesian inference for both the parameters and the latent state trajectory of
//! nonlinear state-space models observed in discrete time. The model is supplied through the
//! [StateSpaceModel] trait and the inference runs in two stages:
//!
//! 1. An adaptive Metropolis sampler ([mcmc]) explores parameter space using a cheap Gaussian
//!    approximation of the model. The approximation is found by iterated linearization around the
//!    posterior mode of the states ([linearize]) and yields a linear-Gaussian surrogate ([surrogate])
//!    whose Kalman filter likelihood replaces the intractable one.
//! 2. Every stored draw of the chain is then reweighted with an unbiased particle filter estimate of
//!    the exact likelihood ([particle], [correction]). The ratio between the exact and the approximate
//!    likelihood is the importance weight of the draw and a single state trajectory is drawn for each
//!    draw by tracing the ancestry of the particle system.
//!
//! Weighted posterior moments of the state paths are merged across worker threads by [summary].
//! Configuration files and the end-to-end pipeline live in [config], and CSV input/output plus a data
//! simulator live in [sim]. Two ready-made models are provided in [models].
//!
//! ## Model
//!
//! The state-space model handled by the crate is
//!
//! $$
//! y_t = Z(t, \alpha_t, \theta) + H_t(\theta) \epsilon_t, \qquad
//! \alpha_{t+1} = T(t, \alpha_t, \theta) + R_t(\theta) \eta_t, \qquad
//! \alpha_1 \sim N(a_1(\theta), P_1(\theta))
//! $$
//!
//! with $\epsilon_t$ and $\eta_t$ standard normal. $H_t$ and $R_t$ are *loadings*, so the noise
//! covariances are $H_t H_t^T$ and $R_t R_t^T$. Time is indexed from zero in code: column `t` of a
//! trajectory matrix is the state at time `t` and `transition(t, ..)` maps the state at time `t` to the
//! state at time `t + 1`.
//!
//! ## Crate overview
//!
//! - [linalg]: robust factorizations, Gaussian densities and log-sum-exp helpers.
//! - [surrogate]: the linear-Gaussian model with Kalman filter, smoother and simulation smoother.
//! - [linearize]: extended Kalman filtering and iterated linearization of a [StateSpaceModel].
//! - [mcmc]: robust adaptive Metropolis with run-length compressed storage.
//! - [particle]: bootstrap and psi particle filters with an ancestor table.
//! - [correction]: the parallel importance-sampling correction of a stored chain.
//! - [summary]: the weighted mean and covariance reducer.
//! - [models]: a local level model and a logistic growth model.
//! - [config]: serializable run configuration and the inference pipeline.
//! - [sim]: CSV readers and writers and synthetic data generation.
pub mod config;
pub mod correction;
pub mod linalg;
pub mod linearize;
pub mod mcmc;
pub mod models;
pub mod particle;
pub mod sim;
pub mod summary;
pub mod surrogate;

use nalgebra::{DMatrix, DVector};

pub use config::{InferenceConfig, InferenceOutput, run_inference};
pub use correction::{
    CorrectedPosterior, CorrectionConfig, CorrectionMethod, DuplicateHandling, correct,
};
pub use linearize::{Approximation, ApproximationOptions, approximate};
pub use mcmc::{AdaptiveSampler, ChainStorage, McmcConfig, McmcOutput};
pub use models::{LocalLevelModel, LogisticGrowthModel};
pub use summary::{StateSummary, WeightedSummary};
pub use surrogate::LinearGaussianSsm;

/// Capabilities a nonlinear Gaussian state-space model has to provide.
///
/// Implementors carry the observations and any known constant or time-varying covariates as their
/// own fields. The engine clones the model once per worker thread, so cloning should be cheap. All
/// functions take the parameter vector explicitly and must not keep state between calls.
///
/// Dimensions: `n` time points, `p` observation components, `m` states and `k` state disturbances.
pub trait StateSpaceModel: Clone + Send + Sync {
    /// Observations as an `n x p` matrix. Non-finite entries mark missing observations.
    fn observations(&self) -> &DMatrix<f64>;
    /// Number of states `m`
    fn state_dim(&self) -> usize;
    /// Number of state disturbances `k`
    fn noise_dim(&self) -> usize;
    /// Number of time points `n`
    fn n_time(&self) -> usize {
        self.observations().nrows()
    }
    /// Number of observation components `p`
    fn observation_dim(&self) -> usize {
        self.observations().ncols()
    }
    /// Length of the parameter vector the model expects, or `None` when it accepts any length
    fn n_parameters(&self) -> Option<usize> {
        None
    }
    /// Observation function $Z(t, \alpha_t, \theta)$, a vector of length `p`
    fn observation(&self, t: usize, state: &DVector<f64>, theta: &DVector<f64>) -> DVector<f64>;
    /// Jacobian of [StateSpaceModel::observation] with respect to the state (`p x m`)
    fn observation_jacobian(
        &self,
        t: usize,
        state: &DVector<f64>,
        theta: &DVector<f64>,
    ) -> DMatrix<f64>;
    /// Transition function $T(t, \alpha_t, \theta)$ giving the mean of the state at `t + 1`
    fn transition(&self, t: usize, state: &DVector<f64>, theta: &DVector<f64>) -> DVector<f64>;
    /// Jacobian of [StateSpaceModel::transition] with respect to the state (`m x m`)
    fn transition_jacobian(
        &self,
        t: usize,
        state: &DVector<f64>,
        theta: &DVector<f64>,
    ) -> DMatrix<f64>;
    /// Observation noise loading $H_t$ (`p x p`); the covariance is $H_t H_t^T$
    fn observation_noise(&self, t: usize, theta: &DVector<f64>) -> DMatrix<f64>;
    /// Process noise loading $R_t$ (`m x k`); the covariance is $R_t R_t^T$
    fn process_noise(&self, t: usize, theta: &DVector<f64>) -> DMatrix<f64>;
    /// Mean of the initial state
    fn initial_mean(&self, theta: &DVector<f64>) -> DVector<f64>;
    /// Covariance of the initial state
    fn initial_covariance(&self, theta: &DVector<f64>) -> DMatrix<f64>;
    /// Log prior density of the parameters. Non-finite values mark points outside the support.
    fn log_prior(&self, theta: &DVector<f64>) -> f64;
    /// Whether [StateSpaceModel::observation_noise] depends on `t`
    fn observation_noise_time_varying(&self) -> bool {
        false
    }
    /// Whether [StateSpaceModel::process_noise] depends on `t`
    fn process_noise_time_varying(&self) -> bool {
        false
    }
}

/// Check that a model returns system matrices of consistent shapes at `theta`.
///
/// This is run once before any sampling so that shape errors surface as configuration errors and
/// not in the middle of a chain.
pub fn validate_model<M: StateSpaceModel>(model: &M, theta: &DVector<f64>) -> anyhow::Result<()> {
    let n = model.n_time();
    let p = model.observation_dim();
    let m = model.state_dim();
    let k = model.noise_dim();
    anyhow::ensure!(n > 0, "model has no observations");
    anyhow::ensure!(m > 0, "model has no states");
    if let Some(d) = model.n_parameters() {
        anyhow::ensure!(
            theta.len() == d,
            "parameter vector has length {}, the model expects {d}",
            theta.len()
        );
    }
    let a1 = model.initial_mean(theta);
    anyhow::ensure!(a1.len() == m, "initial mean has length {}, expected {m}", a1.len());
    let p1 = model.initial_covariance(theta);
    anyhow::ensure!(
        p1.shape() == (m, m),
        "initial covariance is {:?}, expected ({m}, {m})",
        p1.shape()
    );
    let z = model.observation(0, &a1, theta);
    anyhow::ensure!(z.len() == p, "observation has length {}, expected {p}", z.len());
    let zj = model.observation_jacobian(0, &a1, theta);
    anyhow::ensure!(
        zj.shape() == (p, m),
        "observation Jacobian is {:?}, expected ({p}, {m})",
        zj.shape()
    );
    let t = model.transition(0, &a1, theta);
    anyhow::ensure!(t.len() == m, "transition has length {}, expected {m}", t.len());
    let tj = model.transition_jacobian(0, &a1, theta);
    anyhow::ensure!(
        tj.shape() == (m, m),
        "transition Jacobian is {:?}, expected ({m}, {m})",
        tj.shape()
    );
    let h = model.observation_noise(0, theta);
    anyhow::ensure!(
        h.shape() == (p, p),
        "observation noise loading is {:?}, expected ({p}, {p})",
        h.shape()
    );
    let r = model.process_noise(0, theta);
    anyhow::ensure!(
        r.shape() == (m, k),
        "process noise loading is {:?}, expected ({m}, {k})",
        r.shape()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn t_validate_builtin_models() {
        let y = DMatrix::from_row_slice(3, 1, &[1.0, f64::NAN, 2.0]);
        let ll = LocalLevelModel::new(y.clone(), 0.0, 10.0);
        assert!(validate_model(&ll, &DVector::from_vec(vec![1.0, 0.5])).is_ok());
        let lg = LogisticGrowthModel::new(y, 0.1, 1.0, 10.0);
        let theta = DVector::from_vec(vec![-2.0, -1.0, -1.0]);
        assert!(validate_model(&lg, &theta).is_ok());
    }

    #[test]
    fn t_validate_rejects_empty_data() {
        let ll = LocalLevelModel::new(DMatrix::zeros(0, 1), 0.0, 10.0);
        let err = validate_model(&ll, &DVector::from_vec(vec![1.0, 0.5])).unwrap_err();
        assert!(err.to_string().contains("no observations"));
    }

    #[test]
    fn t_validate_rejects_wrong_parameter_length() {
        let y = DMatrix::from_row_slice(2, 1, &[1.0, 2.0]);
        let ll = LocalLevelModel::new(y.clone(), 0.0, 10.0);
        let err = validate_model(&ll, &DVector::from_vec(vec![1.0])).unwrap_err();
        assert!(err.to_string().contains("expects 2"), "{err}");
        let lg = LogisticGrowthModel::new(y, 0.1, 1.0, 10.0);
        assert!(validate_model(&lg, &DVector::from_vec(vec![-2.0, -1.0])).is_err());
        assert!(validate_model(&lg, &DVector::zeros(4)).is_err());
    }
}
