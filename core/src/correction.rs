//! Importance-sampling correction of an approximate chain
//!
//! Every stored draw of the approximate chain is reweighted by an unbiased particle filter
//! estimate of its exact likelihood:
//!
//! $$
//! w_i = \exp\left(\log \hat p(y | \theta_i) - \log \tilde p(y | \theta_i)\right)
//! $$
//!
//! and one state trajectory per draw is sampled from the particle genealogy. Draws are split into
//! contiguous ranges, one per worker of a fixed-size rayon pool. Each worker owns a clone of the
//! model and an explicitly seeded generator and writes into its own slice of the output.
use std::ops::Range;

use anyhow::Context;
use log::{info, warn};
use nalgebra::DMatrix;
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

use crate::StateSpaceModel;
use crate::linearize::{ApproximationOptions, approximate, linearize};
use crate::mcmc::ChainStorage;
use crate::particle::{ResamplingStrategy, bootstrap_filter, psi_filter};
use crate::summary::StateMoments;
use crate::surrogate::LinearGaussianSsm;

/// Particle filter used for the correction.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorrectionMethod {
    /// Auxiliary filter proposing from the surrogate smoother
    #[default]
    Psi,
    /// Bootstrap filter proposing from the model transition
    Bootstrap,
    /// No correction: one simulation smoother draw from the surrogate, all weights one
    ApproximateOnly,
}

/// How repeated draws of the compressed chain are corrected.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicateHandling {
    /// `n_particles` for every stored draw, whatever its repeat count
    #[default]
    Flat,
    /// `n_particles * count` particles for a draw repeated `count` times
    CountExpanded,
}

fn default_n_particles() -> usize {
    10
}
fn default_n_threads() -> usize {
    1
}
fn default_seeds() -> Vec<u64> {
    vec![1]
}

/// Settings of the correction stage.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CorrectionConfig {
    #[serde(default)]
    pub method: CorrectionMethod,
    #[serde(default)]
    pub duplicates: DuplicateHandling,
    #[serde(default)]
    pub resampling: ResamplingStrategy,
    #[serde(default = "default_n_particles")]
    pub n_particles: usize,
    #[serde(default = "default_n_threads")]
    pub n_threads: usize,
    /// One seed per worker, or a single seed used by every worker
    #[serde(default = "default_seeds")]
    pub seeds: Vec<u64>,
}

impl Default for CorrectionConfig {
    fn default() -> Self {
        CorrectionConfig {
            method: CorrectionMethod::default(),
            duplicates: DuplicateHandling::default(),
            resampling: ResamplingStrategy::default(),
            n_particles: default_n_particles(),
            n_threads: default_n_threads(),
            seeds: default_seeds(),
        }
    }
}

impl CorrectionConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.n_particles >= 1, "n_particles must be at least 1");
        anyhow::ensure!(self.n_threads >= 1, "n_threads must be at least 1");
        anyhow::ensure!(
            self.seeds.len() == 1 || self.seeds.len() == self.n_threads,
            "expected 1 or {} seeds, got {}",
            self.n_threads,
            self.seeds.len()
        );
        Ok(())
    }
    /// Seed of worker `w`
    pub fn seed(&self, w: usize) -> u64 {
        if self.seeds.len() == 1 {
            self.seeds[0]
        } else {
            self.seeds[w]
        }
    }
}

/// Corrected posterior, indexed like the storage it was computed from.
#[derive(Clone, Debug)]
pub struct CorrectedPosterior {
    /// Importance weights; zero marks a draw whose filter failed
    pub weights: Vec<f64>,
    pub exact_log_likelihood: Vec<f64>,
    /// Log prior plus exact log-likelihood
    pub log_posterior: Vec<f64>,
    /// One sampled state trajectory (`m x n`) per draw, zero for failed draws
    pub trajectories: Vec<DMatrix<f64>>,
    /// Weighted genealogy moments per draw (surrogate smoother moments without correction)
    pub state_moments: Vec<StateMoments>,
}

impl CorrectedPosterior {
    pub fn len(&self) -> usize {
        self.weights.len()
    }
    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }
    /// Number of draws whose exact likelihood estimate failed
    pub fn zero_weight_draws(&self) -> usize {
        self.weights.iter().filter(|w| **w == 0.0).count()
    }
    /// Effective sample size of the importance weights over the retained iterations, each stored
    /// draw standing for `counts[i]` iterations
    pub fn effective_sample_size(&self, counts: &[usize]) -> f64 {
        let (sum, sum_sq) = self
            .weights
            .iter()
            .zip(counts)
            .fold((0.0, 0.0), |(s, sq), (w, c)| {
                let c = *c as f64;
                (s + w * c, sq + w * w * c)
            });
        if sum_sq > 0.0 { sum * sum / sum_sq } else { 0.0 }
    }
}

/// Correction of a single stored draw.
#[derive(Clone, Debug)]
struct DrawCorrection {
    weight: f64,
    exact_log_likelihood: f64,
    trajectory: DMatrix<f64>,
    moments: StateMoments,
}

/// Split `0..n` into `n_threads` contiguous ranges of `floor(n / n_threads)` items; the last range
/// takes the remainder.
pub fn chunk_ranges(n: usize, n_threads: usize) -> Vec<Range<usize>> {
    let n_threads = n_threads.max(1);
    let size = n / n_threads;
    (0..n_threads)
        .map(|w| {
            let start = w * size;
            let end = if w + 1 == n_threads { n } else { start + size };
            start..end
        })
        .collect()
}

/// Surrogate of stored draw `index`, linearized at its stored mode when the chain kept modes.
pub(crate) fn surrogate_for<M: StateSpaceModel>(
    model: &M,
    storage: &ChainStorage,
    index: usize,
    options: &ApproximationOptions,
) -> LinearGaussianSsm {
    let theta = &storage.theta[index];
    match storage.modes.as_ref() {
        Some(modes) => linearize(model, theta, &modes[index]),
        None => approximate(model, theta, None, options).surrogate,
    }
}

fn correct_draw<M: StateSpaceModel>(
    model: &M,
    storage: &ChainStorage,
    index: usize,
    config: &CorrectionConfig,
    options: &ApproximationOptions,
    rng: &mut StdRng,
) -> DrawCorrection {
    let theta = &storage.theta[index];
    let approx_log_likelihood = storage.approx_log_likelihood[index];
    let n_particles = match config.duplicates {
        DuplicateHandling::Flat => config.n_particles,
        DuplicateHandling::CountExpanded => config.n_particles * storage.counts[index],
    };
    let output = match config.method {
        CorrectionMethod::ApproximateOnly => {
            let surrogate = surrogate_for(model, storage, index, options);
            let smoothed = surrogate.smoother();
            return DrawCorrection {
                weight: 1.0,
                exact_log_likelihood: approx_log_likelihood,
                trajectory: surrogate.simulate_states(rng),
                moments: StateMoments {
                    mean: smoothed.mean,
                    covariance: smoothed.covariance,
                },
            };
        }
        CorrectionMethod::Bootstrap => {
            bootstrap_filter(model, theta, n_particles, config.resampling, rng)
        }
        CorrectionMethod::Psi => {
            let surrogate = surrogate_for(model, storage, index, options);
            psi_filter(model, theta, &surrogate, n_particles, config.resampling, rng)
        }
    };
    let weight = (output.log_likelihood - approx_log_likelihood).exp();
    if output.log_likelihood.is_finite() && weight.is_finite() {
        let (mean, covariance) = output.genealogy_moments();
        DrawCorrection {
            weight,
            exact_log_likelihood: output.log_likelihood,
            trajectory: output.sample_trajectory(rng),
            moments: StateMoments { mean, covariance },
        }
    } else {
        let m = model.state_dim();
        let n = model.n_time();
        DrawCorrection {
            weight: 0.0,
            exact_log_likelihood: output.log_likelihood,
            trajectory: DMatrix::zeros(m, n),
            moments: StateMoments::zeros(m, n),
        }
    }
}

fn correct_range<M: StateSpaceModel>(
    model: &M,
    storage: &ChainStorage,
    range: Range<usize>,
    seed: u64,
    config: &CorrectionConfig,
    options: &ApproximationOptions,
    out: &mut [Option<DrawCorrection>],
) {
    let mut rng = StdRng::seed_from_u64(seed);
    for (slot, index) in out.iter_mut().zip(range) {
        *slot = Some(correct_draw(model, storage, index, config, options, &mut rng));
    }
}

/// Correct every draw in `storage` with the configured particle filter.
///
/// `options` is used only when the storage carries no modes and the surrogate of a draw has to be
/// found again.
pub fn correct<M: StateSpaceModel>(
    model: &M,
    storage: &ChainStorage,
    config: &CorrectionConfig,
    options: &ApproximationOptions,
) -> anyhow::Result<CorrectedPosterior> {
    config.validate()?;
    let n_draws = storage.len();
    info!(
        "Correcting {} stored draws with {:?} ({} particles, {:?} duplicates, {} threads)",
        n_draws, config.method, config.n_particles, config.duplicates, config.n_threads
    );
    let mut results: Vec<Option<DrawCorrection>> = vec![None; n_draws];
    if config.n_threads == 1 {
        correct_range(
            model,
            storage,
            0..n_draws,
            config.seed(0),
            config,
            options,
            &mut results,
        );
    } else {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.n_threads)
            .build()
            .context("failed to build the correction worker pool")?;
        pool.scope(|s| {
            let mut rest = results.as_mut_slice();
            for (w, range) in chunk_ranges(n_draws, config.n_threads)
                .into_iter()
                .enumerate()
            {
                let (chunk, tail) = std::mem::take(&mut rest).split_at_mut(range.len());
                rest = tail;
                let worker_model = model.clone();
                let seed = config.seed(w);
                s.spawn(move |_| {
                    correct_range(&worker_model, storage, range, seed, config, options, chunk)
                });
            }
        });
    }

    let mut posterior = CorrectedPosterior {
        weights: Vec::with_capacity(n_draws),
        exact_log_likelihood: Vec::with_capacity(n_draws),
        log_posterior: Vec::with_capacity(n_draws),
        trajectories: Vec::with_capacity(n_draws),
        state_moments: Vec::with_capacity(n_draws),
    };
    for (i, result) in results.into_iter().enumerate() {
        let draw = result.with_context(|| format!("draw {i} was not corrected"))?;
        posterior.weights.push(draw.weight);
        posterior
            .log_posterior
            .push(storage.log_prior[i] + draw.exact_log_likelihood);
        posterior.exact_log_likelihood.push(draw.exact_log_likelihood);
        posterior.trajectories.push(draw.trajectory);
        posterior.state_moments.push(draw.moments);
    }
    let failed = posterior.zero_weight_draws();
    if failed > 0 {
        warn!("{failed} of {n_draws} draws got zero weight");
    }
    info!(
        "Correction finished: effective sample size {:.1} of {} retained iterations",
        posterior.effective_sample_size(&storage.counts),
        storage.total_count()
    );
    Ok(posterior)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcmc::{AdaptiveSampler, McmcConfig};
    use crate::models::LocalLevelModel;
    use crate::summary::{corrected_summary, summarize_parallel};
    use assert_approx_eq::assert_approx_eq;
    use nalgebra::DVector;

    #[test]
    fn t_chunk_ranges() {
        assert_eq!(chunk_ranges(10, 3), vec![0..3, 3..6, 6..10]);
        assert_eq!(chunk_ranges(2, 4), vec![0..0, 0..0, 0..0, 0..2]);
        assert_eq!(chunk_ranges(5, 1), vec![0..5]);
    }

    #[test]
    fn t_seed_broadcast() {
        let config = CorrectionConfig {
            n_threads: 3,
            seeds: vec![7],
            ..Default::default()
        };
        assert!(config.validate().is_ok());
        assert_eq!(config.seed(2), 7);
        let bad = CorrectionConfig {
            n_threads: 3,
            seeds: vec![1, 2],
            ..Default::default()
        };
        assert!(bad.validate().is_err());
    }

    fn short_chain(store_modes: bool) -> (LocalLevelModel, ChainStorage) {
        let y = DMatrix::from_row_slice(
            8,
            1,
            &[0.3, 0.9, 1.2, f64::NAN, 1.0, 1.7, 2.1, 1.8],
        );
        let model = LocalLevelModel::new(y, 0.0, 10.0);
        let config = McmcConfig {
            n_iter: 400,
            n_burnin: 200,
            n_thin: 2,
            store_modes,
            seed: 3,
            ..Default::default()
        };
        let sampler = AdaptiveSampler::new(
            config,
            ApproximationOptions::default(),
            DMatrix::identity(2, 2) * 0.1,
        );
        let out = sampler
            .run(&model, &DVector::from_vec(vec![0.5, 0.5]), None)
            .unwrap();
        (model, out.storage)
    }

    #[test]
    fn t_psi_weights_are_one_for_linear_model() {
        let (model, storage) = short_chain(true);
        let posterior = correct(
            &model,
            &storage,
            &CorrectionConfig::default(),
            &ApproximationOptions::default(),
        )
        .unwrap();
        assert_eq!(posterior.len(), storage.len());
        for (i, w) in posterior.weights.iter().enumerate() {
            assert!((w - 1.0).abs() < 1e-8, "draw {i}: weight {w}");
            assert!(
                (posterior.log_posterior[i]
                    - storage.log_prior[i]
                    - storage.approx_log_likelihood[i])
                    .abs()
                    < 1e-8
            );
        }
    }

    #[test]
    fn t_correction_is_reproducible_for_fixed_seeds() {
        let (model, storage) = short_chain(false);
        let config = CorrectionConfig {
            method: CorrectionMethod::Bootstrap,
            duplicates: DuplicateHandling::CountExpanded,
            n_particles: 20,
            n_threads: 2,
            seeds: vec![11, 12],
            ..Default::default()
        };
        let options = ApproximationOptions::default();
        let first = correct(&model, &storage, &config, &options).unwrap();
        let second = correct(&model, &storage, &config, &options).unwrap();
        assert_eq!(first.weights, second.weights);
        assert!(first.weights.iter().all(|w| *w >= 0.0 && w.is_finite()));
        assert_eq!(first.trajectories[0].shape(), (1, 8));
    }

    #[test]
    fn t_approximate_only_has_unit_weights() {
        let (model, storage) = short_chain(false);
        let config = CorrectionConfig {
            method: CorrectionMethod::ApproximateOnly,
            ..Default::default()
        };
        let posterior = correct(&model, &storage, &config, &ApproximationOptions::default())
            .unwrap();
        assert!(posterior.weights.iter().all(|w| *w == 1.0));
        assert_eq!(posterior.zero_weight_draws(), 0);
        let ess = posterior.effective_sample_size(&storage.counts);
        assert!(ess > 0.0 && ess <= storage.total_count() as f64 + 1e-9);
    }

    /// Local level model whose transition breaks down for a state noise above `limit`.
    #[derive(Clone, Debug)]
    struct BrittleLevelModel {
        inner: LocalLevelModel,
        limit: f64,
    }

    impl StateSpaceModel for BrittleLevelModel {
        fn observations(&self) -> &DMatrix<f64> {
            self.inner.observations()
        }
        fn state_dim(&self) -> usize {
            1
        }
        fn noise_dim(&self) -> usize {
            1
        }
        fn observation(&self, t: usize, state: &DVector<f64>, theta: &DVector<f64>) -> DVector<f64> {
            self.inner.observation(t, state, theta)
        }
        fn observation_jacobian(
            &self,
            t: usize,
            state: &DVector<f64>,
            theta: &DVector<f64>,
        ) -> DMatrix<f64> {
            self.inner.observation_jacobian(t, state, theta)
        }
        fn transition(&self, t: usize, state: &DVector<f64>, theta: &DVector<f64>) -> DVector<f64> {
            if theta[1] > self.limit {
                DVector::from_element(1, f64::NAN)
            } else {
                self.inner.transition(t, state, theta)
            }
        }
        fn transition_jacobian(
            &self,
            t: usize,
            state: &DVector<f64>,
            theta: &DVector<f64>,
        ) -> DMatrix<f64> {
            self.inner.transition_jacobian(t, state, theta)
        }
        fn observation_noise(&self, t: usize, theta: &DVector<f64>) -> DMatrix<f64> {
            self.inner.observation_noise(t, theta)
        }
        fn process_noise(&self, t: usize, theta: &DVector<f64>) -> DMatrix<f64> {
            self.inner.process_noise(t, theta)
        }
        fn initial_mean(&self, theta: &DVector<f64>) -> DVector<f64> {
            self.inner.initial_mean(theta)
        }
        fn initial_covariance(&self, theta: &DVector<f64>) -> DMatrix<f64> {
            self.inner.initial_covariance(theta)
        }
        fn log_prior(&self, theta: &DVector<f64>) -> f64 {
            self.inner.log_prior(theta)
        }
    }

    #[test]
    fn t_failed_draws_get_zero_weight() {
        let (inner, _) = short_chain(false);
        let model = BrittleLevelModel {
            inner: inner.clone(),
            limit: 0.6,
        };
        let options = ApproximationOptions::default();
        let mut storage = ChainStorage::new(false);
        for (sigma_y, sigma_eta, count) in [
            (0.5, 0.3, 2),
            (0.5, 0.8, 1),
            (0.7, 0.2, 3),
            (0.6, 0.9, 1),
            (0.4, 0.4, 1),
        ] {
            let theta = DVector::from_vec(vec![sigma_y, sigma_eta]);
            let approx = approximate(&inner, &theta, None, &options);
            storage.approx_log_likelihood.push(approx.log_likelihood);
            storage.scales.push(approx.scales);
            storage.log_prior.push(inner.log_prior(&theta));
            storage.theta.push(theta);
            storage.counts.push(count);
        }
        let config = CorrectionConfig {
            method: CorrectionMethod::Bootstrap,
            n_particles: 50,
            n_threads: 2,
            seeds: vec![9],
            ..Default::default()
        };
        let posterior = correct(&model, &storage, &config, &options).unwrap();
        let failed = [1, 3];
        assert_eq!(posterior.zero_weight_draws(), failed.len());
        for i in 0..storage.len() {
            if failed.contains(&i) {
                assert_eq!(posterior.weights[i], 0.0);
                assert!(!posterior.exact_log_likelihood[i].is_finite());
                assert!(posterior.trajectories[i].iter().all(|x| *x == 0.0));
                assert!(posterior.state_moments[i].mean.iter().all(|x| *x == 0.0));
            } else {
                assert!(posterior.weights[i] > 0.0, "draw {i}");
                assert!(posterior.trajectories[i].iter().all(|x| x.is_finite()));
            }
        }

        let summary = corrected_summary(&posterior, &storage.counts, 2).unwrap();
        let healthy: Vec<usize> = (0..storage.len()).filter(|i| !failed.contains(i)).collect();
        let moments: Vec<StateMoments> = healthy
            .iter()
            .map(|i| posterior.state_moments[*i].clone())
            .collect();
        let weights: Vec<f64> = healthy
            .iter()
            .map(|i| posterior.weights[*i] * storage.counts[*i] as f64)
            .collect();
        let counts: Vec<usize> = healthy.iter().map(|i| storage.counts[*i]).collect();
        let reference = summarize_parallel(&moments, &weights, &counts, 1).unwrap();
        assert_eq!(summary.total_count, reference.total_count);
        assert_approx_eq!(summary.total_weight, reference.total_weight, 1e-12);
        for t in 0..8 {
            assert_approx_eq!(summary.mean[(0, t)], reference.mean[(0, t)], 1e-10);
            assert_approx_eq!(
                summary.covariance[t][(0, 0)],
                reference.covariance[t][(0, 0)],
                1e-10
            );
        }
    }
}
