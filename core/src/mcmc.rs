//! Robust adaptive Metropolis over the model parameters with the approximate likelihood
//!
//! Each iteration proposes $\theta' = \theta + S u$ with $u \sim N(0, I)$, finds the Gaussian
//! approximation at $\theta'$ and accepts with probability
//! $\min(1, \exp(\ell(\theta') - \ell(\theta) + \log p(\theta') - \log p(\theta)))$, where $\ell$ is
//! the approximate log-likelihood (surrogate log-likelihood plus scaling factors).
//!
//! The proposal factor $S$ is adapted with the robust adaptive Metropolis rule of Vihola (2012):
//!
//! $$
//! S_i S_i^T = S_{i-1} \left(I + \eta_i (\alpha_i - \alpha^*) \frac{u_i u_i^T}{\|u_i\|^2}\right) S_{i-1}^T,
//! \qquad \eta_i = \min(1, d\, i^{-\gamma})
//! $$
//!
//! which is carried out as a rank one Cholesky update (or downdate when the acceptance probability
//! is below the target).
//!
//! Retained iterations are stored run-length compressed: consecutive records of the same state are
//! collapsed into one draw with a repeat count.
use std::sync::atomic::{AtomicBool, Ordering};

use log::{debug, info, warn};
use nalgebra::linalg::Cholesky;
use nalgebra::{DMatrix, DVector};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::StateSpaceModel;
use crate::linalg::{standard_normal_vector, symmetrize};
use crate::linearize::{ApproximationOptions, approximate};

/// How often the interruption flag is polled, in iterations
const INTERRUPT_CHECK_INTERVAL: usize = 16;

fn default_n_iter() -> usize {
    10_000
}
fn default_n_burnin() -> usize {
    5_000
}
fn default_n_thin() -> usize {
    1
}
fn default_target_acceptance() -> f64 {
    0.234
}
fn default_gamma() -> f64 {
    2.0 / 3.0
}
fn default_seed() -> u64 {
    1
}

/// Settings of the adaptive Metropolis sampler.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct McmcConfig {
    /// Total number of iterations including burn-in
    #[serde(default = "default_n_iter")]
    pub n_iter: usize,
    #[serde(default = "default_n_burnin")]
    pub n_burnin: usize,
    /// Record every `n_thin`-th iteration after burn-in
    #[serde(default = "default_n_thin")]
    pub n_thin: usize,
    #[serde(default = "default_target_acceptance")]
    pub target_acceptance: f64,
    /// Decay exponent of the adaptation step size, in (0.5, 1]
    #[serde(default = "default_gamma")]
    pub gamma: f64,
    /// Freeze the proposal after burn-in
    #[serde(default)]
    pub end_adaptation: bool,
    /// Keep the mode of every stored draw
    #[serde(default)]
    pub store_modes: bool,
    #[serde(default = "default_seed")]
    pub seed: u64,
}

impl Default for McmcConfig {
    fn default() -> Self {
        McmcConfig {
            n_iter: default_n_iter(),
            n_burnin: default_n_burnin(),
            n_thin: default_n_thin(),
            target_acceptance: default_target_acceptance(),
            gamma: default_gamma(),
            end_adaptation: false,
            store_modes: false,
            seed: default_seed(),
        }
    }
}

impl McmcConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.n_iter > self.n_burnin,
            "n_iter ({}) must exceed n_burnin ({})",
            self.n_iter,
            self.n_burnin
        );
        anyhow::ensure!(self.n_thin >= 1, "n_thin must be at least 1");
        anyhow::ensure!(
            self.target_acceptance > 0.0 && self.target_acceptance < 1.0,
            "target_acceptance must be in (0, 1), got {}",
            self.target_acceptance
        );
        anyhow::ensure!(
            self.gamma > 0.5 && self.gamma <= 1.0,
            "gamma must be in (0.5, 1], got {}",
            self.gamma
        );
        Ok(())
    }
    /// Number of retained iterations, `floor((n_iter - n_burnin) / n_thin)`
    pub fn n_retained(&self) -> usize {
        self.n_iter.saturating_sub(self.n_burnin) / self.n_thin.max(1)
    }
}

/// Run-length compressed storage of the chain.
///
/// All vectors are indexed by stored draw. The sum of `counts` is the number of retained
/// iterations and [ChainStorage::expand] reproduces the retained sequence.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ChainStorage {
    pub theta: Vec<DVector<f64>>,
    pub approx_log_likelihood: Vec<f64>,
    pub log_prior: Vec<f64>,
    pub scales: Vec<f64>,
    pub counts: Vec<usize>,
    /// Modes of the stored draws when they are kept
    pub modes: Option<Vec<DMatrix<f64>>>,
}

impl ChainStorage {
    pub fn new(store_modes: bool) -> Self {
        ChainStorage {
            modes: store_modes.then(Vec::new),
            ..Default::default()
        }
    }
    pub fn len(&self) -> usize {
        self.theta.len()
    }
    pub fn is_empty(&self) -> bool {
        self.theta.is_empty()
    }
    /// Sum of the repeat counts
    pub fn total_count(&self) -> usize {
        self.counts.iter().sum()
    }
    pub fn n_parameters(&self) -> usize {
        self.theta.first().map_or(0, |t| t.len())
    }
    fn push(
        &mut self,
        theta: &DVector<f64>,
        approx_log_likelihood: f64,
        log_prior: f64,
        scales: f64,
        mode: &DMatrix<f64>,
    ) {
        self.theta.push(theta.clone());
        self.approx_log_likelihood.push(approx_log_likelihood);
        self.log_prior.push(log_prior);
        self.scales.push(scales);
        self.counts.push(1);
        if let Some(modes) = self.modes.as_mut() {
            modes.push(mode.clone());
        }
    }
    fn increment_last(&mut self) {
        if let Some(last) = self.counts.last_mut() {
            *last += 1;
        }
    }
    fn trim(&mut self) {
        self.theta.shrink_to_fit();
        self.approx_log_likelihood.shrink_to_fit();
        self.log_prior.shrink_to_fit();
        self.scales.shrink_to_fit();
        self.counts.shrink_to_fit();
        if let Some(modes) = self.modes.as_mut() {
            modes.shrink_to_fit();
        }
    }
    /// Replicate every draw `count` times so that each stored draw has count one.
    pub fn expand(&self) -> ChainStorage {
        fn repeat<T: Clone>(values: &[T], counts: &[usize]) -> Vec<T> {
            values
                .iter()
                .zip(counts)
                .flat_map(|(v, &c)| std::iter::repeat_n(v.clone(), c))
                .collect()
        }
        let total = self.total_count();
        ChainStorage {
            theta: repeat(&self.theta, &self.counts),
            approx_log_likelihood: repeat(&self.approx_log_likelihood, &self.counts),
            log_prior: repeat(&self.log_prior, &self.counts),
            scales: repeat(&self.scales, &self.counts),
            counts: vec![1; total],
            modes: self.modes.as_ref().map(|m| repeat(m, &self.counts)),
        }
    }
}

/// Result of [AdaptiveSampler::run].
#[derive(Clone, Debug)]
pub struct McmcOutput {
    pub storage: ChainStorage,
    /// Post burn-in acceptances divided by post burn-in iterations
    pub acceptance_rate: f64,
    /// Final proposal factor $S$
    pub scale: DMatrix<f64>,
    /// Whether the run stopped early on the interruption flag
    pub interrupted: bool,
    /// Number of iterations carried out
    pub iterations: usize,
}

/// Robust adaptive Metropolis sampler driven by the Gaussian approximation.
#[derive(Clone, Debug)]
pub struct AdaptiveSampler {
    pub config: McmcConfig,
    pub approximation: ApproximationOptions,
    /// Lower triangular proposal factor, `d x d`
    pub scale: DMatrix<f64>,
}

/// Rank one update (`sign > 0`) or downdate of the factor `S`, refactorized as lower Cholesky.
///
/// Returns `None` when the result is not positive definite.
fn rank_one_update(s: &DMatrix<f64>, v: &DVector<f64>, sign: f64) -> Option<DMatrix<f64>> {
    let m = symmetrize(&(s * s.transpose() + sign * v * v.transpose()));
    let ch = Cholesky::new(m)?;
    let l = ch.l();
    if l.diagonal().iter().all(|d| d.is_finite() && *d > 0.0) {
        Some(l)
    } else {
        None
    }
}

/// One robust adaptive Metropolis step on the factor `s`.
pub fn adapt_scale(
    s: &mut DMatrix<f64>,
    u: &DVector<f64>,
    acceptance_prob: f64,
    target: f64,
    iteration: usize,
    gamma: f64,
) {
    let norm = u.norm();
    if norm == 0.0 || !acceptance_prob.is_finite() {
        return;
    }
    let d = u.len() as f64;
    let step = (d * (iteration as f64).powf(-gamma)).min(1.0);
    let change = acceptance_prob - target;
    let v = &*s * u / norm * (step * change.abs()).sqrt();
    let sign = if change >= 0.0 { 1.0 } else { -1.0 };
    match rank_one_update(s, &v, sign) {
        Some(updated) => *s = updated,
        None => debug!("RAM downdate at iteration {iteration} lost positive definiteness"),
    }
}

impl AdaptiveSampler {
    pub fn new(
        config: McmcConfig,
        approximation: ApproximationOptions,
        initial_scale: DMatrix<f64>,
    ) -> Self {
        AdaptiveSampler {
            config,
            approximation,
            scale: initial_scale,
        }
    }

    /// Run the chain from `theta0`.
    ///
    /// Configuration errors (invalid settings, a proposal factor of the wrong shape, a starting
    /// point outside the prior support or with a non-finite approximate likelihood) are reported
    /// before the first iteration. `interrupt` is polled every 16 iterations; an interrupted run
    /// returns the draws stored so far.
    pub fn run<M: StateSpaceModel>(
        &self,
        model: &M,
        theta0: &DVector<f64>,
        interrupt: Option<&AtomicBool>,
    ) -> anyhow::Result<McmcOutput> {
        let config = &self.config;
        config.validate()?;
        let d = theta0.len();
        anyhow::ensure!(d > 0, "the parameter vector is empty");
        anyhow::ensure!(
            self.scale.shape() == (d, d),
            "initial proposal factor is {:?}, expected ({d}, {d})",
            self.scale.shape()
        );
        crate::validate_model(model, theta0)?;

        let mut theta = theta0.clone();
        let mut log_prior = model.log_prior(&theta);
        anyhow::ensure!(
            log_prior.is_finite(),
            "initial theta {:?} is outside the prior support",
            theta.as_slice()
        );
        let approx = approximate(model, &theta, None, &self.approximation);
        anyhow::ensure!(
            approx.log_likelihood.is_finite(),
            "approximate log-likelihood at the initial theta is not finite"
        );
        let mut log_likelihood = approx.log_likelihood;
        let mut scales = approx.scales;
        let mut mode = approx.mode;

        info!(
            "Starting approximate MCMC: {} iterations, {} burn-in, thin {}, {} parameters",
            config.n_iter, config.n_burnin, config.n_thin, d
        );

        let mut rng = StdRng::seed_from_u64(config.seed);
        let mut s = self.scale.clone();
        let mut storage = ChainStorage::new(config.store_modes);
        let mut accepted = 0usize;
        let mut new_value = true;
        let mut interrupted = false;
        let mut iterations = 0;

        for i in 1..=config.n_iter {
            if i % INTERRUPT_CHECK_INTERVAL == 0
                && interrupt.is_some_and(|flag| flag.load(Ordering::Relaxed))
            {
                interrupted = true;
                break;
            }
            iterations = i;

            let u = standard_normal_vector(&mut rng, d);
            let theta_prop = &theta + &s * &u;
            let log_prior_prop = model.log_prior(&theta_prop);
            let mut acceptance_prob = 0.0;
            if log_prior_prop.is_finite() {
                let approx = approximate(model, &theta_prop, None, &self.approximation);
                if approx.log_likelihood.is_finite() {
                    acceptance_prob = (approx.log_likelihood - log_likelihood + log_prior_prop
                        - log_prior)
                        .exp()
                        .min(1.0);
                }
                if rng.random::<f64>() < acceptance_prob {
                    if i > config.n_burnin {
                        accepted += 1;
                    }
                    theta = theta_prop;
                    log_prior = log_prior_prop;
                    log_likelihood = approx.log_likelihood;
                    scales = approx.scales;
                    mode = approx.mode;
                    new_value = true;
                }
            }

            if i > config.n_burnin && (i - config.n_burnin) % config.n_thin == 0 {
                if new_value {
                    storage.push(&theta, log_likelihood, log_prior, scales, &mode);
                    new_value = false;
                } else {
                    storage.increment_last();
                }
            }

            if !config.end_adaptation || i <= config.n_burnin {
                adapt_scale(
                    &mut s,
                    &u,
                    acceptance_prob,
                    config.target_acceptance,
                    i,
                    config.gamma,
                );
            }
        }
        storage.trim();

        let post_burnin = iterations.saturating_sub(config.n_burnin);
        let acceptance_rate = if post_burnin > 0 {
            accepted as f64 / post_burnin as f64
        } else {
            0.0
        };
        if interrupted {
            warn!(
                "Approximate MCMC interrupted after {} of {} iterations",
                iterations, config.n_iter
            );
        }
        info!(
            "Approximate MCMC finished: {} stored draws, {} retained iterations, acceptance rate {:.3}",
            storage.len(),
            storage.total_count(),
            acceptance_rate
        );
        Ok(McmcOutput {
            storage,
            acceptance_rate,
            scale: s,
            interrupted,
            iterations,
        })
    }
}
