//! Particle filters for unbiased likelihood estimation and state sampling
//!
//! Two sequential Monte Carlo variants are provided:
//!
//! - [bootstrap_filter] propagates particles through the model transition and weights them by the
//!   observation density.
//! - [psi_filter] proposes from the smoothing distribution of the linear-Gaussian surrogate and
//!   weights by the ratio between the nonlinear and the linearized densities,
//!   $\frac{g(y_t|\alpha_t)}{\tilde g(y_t|\alpha_t)} \frac{f(\alpha_t|\alpha_{t-1})}{\tilde f(\alpha_t|\alpha_{t-1})}$.
//!   When the surrogate is close to the model the weights are nearly flat and very few particles
//!   are needed.
//!
//! Both resample at every step and record the parent of every particle in an [AncestorTable], so a
//! full trajectory is recovered from any terminal particle with a single backward pass.
use nalgebra::{DMatrix, DVector};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::StateSpaceModel;
use crate::linalg::{
    GaussianPrecision, log_mean_exp, matrix_square_root, normalize_log_weights,
    standard_normal_vector,
};
use crate::surrogate::{LinearGaussianSsm, observed_row, slice_at};

/// Resampling scheme applied after every weighting step.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResamplingStrategy {
    #[default]
    Systematic,
    Multinomial,
    Stratified,
    Residual,
}

impl ResamplingStrategy {
    /// Draw `n` ancestor indices from normalized `weights`.
    pub fn resample<R: Rng + ?Sized>(&self, weights: &[f64], n: usize, rng: &mut R) -> Vec<usize> {
        match self {
            ResamplingStrategy::Systematic => systematic_resample(weights, n, rng),
            ResamplingStrategy::Multinomial => multinomial_resample(weights, n, rng),
            ResamplingStrategy::Stratified => stratified_resample(weights, n, rng),
            ResamplingStrategy::Residual => residual_resample(weights, n, rng),
        }
    }
}

fn cumulative(weights: &[f64]) -> Vec<f64> {
    weights
        .iter()
        .scan(0.0, |acc, w| {
            *acc += w;
            Some(*acc)
        })
        .collect()
}

/// Map sorted positions in [0, total) to indices of the cumulative weights.
fn search_sorted(cumsum: &[f64], positions: impl Iterator<Item = f64>) -> Vec<usize> {
    let last = cumsum.len().saturating_sub(1);
    let mut i = 0;
    positions
        .map(|u| {
            while i < last && u >= cumsum[i] {
                i += 1;
            }
            i
        })
        .collect()
}

/// Index of the first cumulative weight strictly above `u`. Zero weight entries are never picked
/// and ties resolve to the lowest index.
pub fn inverse_cdf(cumsum: &[f64], u: f64) -> usize {
    cumsum
        .partition_point(|c| *c <= u)
        .min(cumsum.len().saturating_sub(1))
}

pub fn systematic_resample<R: Rng + ?Sized>(weights: &[f64], n: usize, rng: &mut R) -> Vec<usize> {
    let cumsum = cumulative(weights);
    let total = cumsum.last().copied().unwrap_or(0.0);
    let u: f64 = rng.random();
    search_sorted(
        &cumsum,
        (0..n).map(|i| (i as f64 + u) / n as f64 * total),
    )
}

pub fn stratified_resample<R: Rng + ?Sized>(weights: &[f64], n: usize, rng: &mut R) -> Vec<usize> {
    let cumsum = cumulative(weights);
    let total = cumsum.last().copied().unwrap_or(0.0);
    let positions: Vec<f64> = (0..n)
        .map(|i| (i as f64 + rng.random::<f64>()) / n as f64 * total)
        .collect();
    search_sorted(&cumsum, positions.into_iter())
}

pub fn multinomial_resample<R: Rng + ?Sized>(
    weights: &[f64],
    n: usize,
    rng: &mut R,
) -> Vec<usize> {
    let cumsum = cumulative(weights);
    let total = cumsum.last().copied().unwrap_or(0.0);
    (0..n)
        .map(|_| inverse_cdf(&cumsum, rng.random::<f64>() * total))
        .collect()
}

/// Deterministic copies of `floor(n w_i)` followed by systematic resampling of the residuals.
pub fn residual_resample<R: Rng + ?Sized>(weights: &[f64], n: usize, rng: &mut R) -> Vec<usize> {
    let total: f64 = weights.iter().sum();
    let mut indices = Vec::with_capacity(n);
    let mut residual = Vec::with_capacity(weights.len());
    for (i, w) in weights.iter().enumerate() {
        let expected = w / total * n as f64;
        let copies = expected.floor() as usize;
        indices.extend(std::iter::repeat_n(i, copies));
        residual.push(expected - copies as f64);
    }
    let remaining = n.saturating_sub(indices.len());
    if remaining > 0 {
        indices.extend(systematic_resample(&residual, remaining, rng));
    }
    indices.truncate(n);
    indices
}

/// Parent indices of the particle system as a flat `(n_time - 1) x n_particles` table.
///
/// Row `t` holds, for every particle at time `t + 1`, the index of its parent at time `t`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AncestorTable {
    n_time: usize,
    n_particles: usize,
    parents: Vec<usize>,
}

impl AncestorTable {
    pub fn new(n_time: usize, n_particles: usize) -> Self {
        AncestorTable {
            n_time,
            n_particles,
            parents: vec![0; n_time.saturating_sub(1) * n_particles],
        }
    }
    pub fn n_time(&self) -> usize {
        self.n_time
    }
    pub fn n_particles(&self) -> usize {
        self.n_particles
    }
    /// Record the parents of the particles at time `t + 1`.
    pub fn set(&mut self, t: usize, parents: &[usize]) {
        let start = t * self.n_particles;
        self.parents[start..start + self.n_particles].copy_from_slice(parents);
    }
    /// Parent at time `t` of particle `i` at time `t + 1`
    pub fn parent(&self, t: usize, i: usize) -> usize {
        self.parents[t * self.n_particles + i]
    }
    /// Indices of the ancestors of terminal particle `terminal` at every time point.
    pub fn trace(&self, terminal: usize) -> Vec<usize> {
        let mut path = vec![0; self.n_time];
        if self.n_time == 0 {
            return path;
        }
        let mut index = terminal;
        path[self.n_time - 1] = index;
        for t in (0..self.n_time - 1).rev() {
            index = self.parent(t, index);
            path[t] = index;
        }
        path
    }
}

/// Particle system produced by [bootstrap_filter] or [psi_filter].
#[derive(Clone, Debug)]
pub struct ParticleFilterOutput {
    /// Log-likelihood estimate; non-finite when every particle got zero weight at some step
    pub log_likelihood: f64,
    /// Particles at every time point before resampling, `n` slices of `m x N`
    pub particles: Vec<DMatrix<f64>>,
    /// Normalized weights at every time point, `n` vectors of length `N`
    pub weights: Vec<Vec<f64>>,
    pub ancestors: AncestorTable,
}

impl ParticleFilterOutput {
    pub fn n_particles(&self) -> usize {
        self.ancestors.n_particles()
    }
    pub fn final_weights(&self) -> &[f64] {
        self.weights.last().map(|w| w.as_slice()).unwrap_or(&[])
    }
    /// State trajectory (`m x n`) of the genealogy ending in terminal particle `terminal`.
    pub fn trajectory(&self, terminal: usize) -> DMatrix<f64> {
        let m = self.particles.first().map_or(0, |p| p.nrows());
        let n = self.particles.len();
        let mut alpha = DMatrix::zeros(m, n);
        for (t, index) in self.ancestors.trace(terminal).into_iter().enumerate() {
            alpha.set_column(t, &self.particles[t].column(index));
        }
        alpha
    }
    /// Draw a terminal particle from the final weights with one uniform and trace its genealogy.
    pub fn sample_trajectory<R: Rng + ?Sized>(&self, rng: &mut R) -> DMatrix<f64> {
        let cumsum = cumulative(self.final_weights());
        let total = cumsum.last().copied().unwrap_or(0.0);
        let u = rng.random::<f64>() * total;
        self.trajectory(inverse_cdf(&cumsum, u))
    }
    /// Weighted mean (`m x n`) and covariances of the traced genealogies of all terminal
    /// particles, weighted by the final weights.
    pub fn genealogy_moments(&self) -> (DMatrix<f64>, Vec<DMatrix<f64>>) {
        let n = self.particles.len();
        let m = self.particles.first().map_or(0, |p| p.nrows());
        let weights = self.final_weights();
        let mut mean = DMatrix::zeros(m, n);
        let mut covariance = vec![DMatrix::zeros(m, m); n];
        let mut index: Vec<usize> = (0..self.n_particles()).collect();
        for t in (0..n).rev() {
            if t + 1 < n {
                for i in index.iter_mut() {
                    *i = self.ancestors.parent(t, *i);
                }
            }
            let particles = &self.particles[t];
            let mut mu = DVector::zeros(m);
            for (w, &i) in weights.iter().zip(&index) {
                mu += *w * particles.column(i);
            }
            let mut cov = DMatrix::zeros(m, m);
            for (w, &i) in weights.iter().zip(&index) {
                let diff = particles.column(i) - &mu;
                cov += *w * &diff * diff.transpose();
            }
            mean.set_column(t, &mu);
            covariance[t] = cov;
        }
        (mean, covariance)
    }
}

/// Running state shared by the two filters.
struct ParticleSystem {
    particles: Vec<DMatrix<f64>>,
    weights: Vec<Vec<f64>>,
    ancestors: AncestorTable,
    log_likelihood: f64,
}

impl ParticleSystem {
    fn new(n_time: usize, n_particles: usize) -> Self {
        ParticleSystem {
            particles: Vec::with_capacity(n_time),
            weights: Vec::with_capacity(n_time),
            ancestors: AncestorTable::new(n_time, n_particles),
            log_likelihood: 0.0,
        }
    }
    fn push(&mut self, particles: DMatrix<f64>, log_weights: &[f64]) {
        self.log_likelihood += log_mean_exp(log_weights);
        self.weights.push(normalize_log_weights(log_weights));
        self.particles.push(particles);
    }
    /// Resample the latest step and record the parents of the next one.
    fn resample<R: Rng + ?Sized>(
        &mut self,
        t: usize,
        strategy: ResamplingStrategy,
        rng: &mut R,
    ) -> Vec<usize> {
        let n = self.ancestors.n_particles();
        let parents = strategy.resample(&self.weights[t], n, rng);
        self.ancestors.set(t, &parents);
        parents
    }
    fn finish(self) -> ParticleFilterOutput {
        let log_likelihood = if self.log_likelihood.is_nan() {
            f64::NEG_INFINITY
        } else {
            self.log_likelihood
        };
        ParticleFilterOutput {
            log_likelihood,
            particles: self.particles,
            weights: self.weights,
            ancestors: self.ancestors,
        }
    }
}

fn gaussian_cloud<R: Rng + ?Sized>(
    rng: &mut R,
    mean: &DVector<f64>,
    cov: &DMatrix<f64>,
    n_particles: usize,
) -> DMatrix<f64> {
    let sqrt = matrix_square_root(cov);
    let mut cloud = DMatrix::zeros(mean.len(), n_particles);
    for i in 0..n_particles {
        let draw = mean + &sqrt * standard_normal_vector(rng, mean.len());
        cloud.set_column(i, &draw);
    }
    cloud
}

fn noise_densities<F>(time_varying: bool, n: usize, f: F) -> Vec<GaussianPrecision>
where
    F: Fn(usize) -> DMatrix<f64>,
{
    let build = |t| {
        let loading = f(t);
        GaussianPrecision::new(&(&loading * loading.transpose()))
    };
    if time_varying {
        (0..n).map(build).collect()
    } else {
        vec![build(0)]
    }
}

/// Bootstrap particle filter with `n_particles` particles.
pub fn bootstrap_filter<M: StateSpaceModel, R: Rng + ?Sized>(
    model: &M,
    theta: &DVector<f64>,
    n_particles: usize,
    resampling: ResamplingStrategy,
    rng: &mut R,
) -> ParticleFilterOutput {
    let n = model.n_time();
    let y = model.observations();
    let observation_densities = noise_densities(model.observation_noise_time_varying(), n, |t| {
        model.observation_noise(t, theta)
    });
    let process_loadings: Vec<DMatrix<f64>> = if model.process_noise_time_varying() {
        (0..n).map(|t| model.process_noise(t, theta)).collect()
    } else {
        vec![model.process_noise(0, theta)]
    };
    let k = model.noise_dim();

    let mut system = ParticleSystem::new(n, n_particles);
    let mut particles = gaussian_cloud(
        rng,
        &model.initial_mean(theta),
        &model.initial_covariance(theta),
        n_particles,
    );
    for t in 0..n {
        if t > 0 {
            let parents = system.resample(t - 1, resampling, rng);
            let previous = &system.particles[t - 1];
            let loading = slice_at(&process_loadings, t - 1);
            for (i, parent) in parents.into_iter().enumerate() {
                let state: DVector<f64> = previous.column(parent).clone_owned();
                let next = model.transition(t - 1, &state, theta)
                    + loading * standard_normal_vector(rng, k);
                particles.set_column(i, &next);
            }
        }
        let log_weights: Vec<f64> = match observed_row(y, t) {
            None => vec![0.0; n_particles],
            Some(y_t) => {
                let density = slice_at(&observation_densities, t);
                particles
                    .column_iter()
                    .map(|x| {
                        let state: DVector<f64> = x.clone_owned();
                        density.log_density(&(&y_t - model.observation(t, &state, theta)))
                    })
                    .collect()
            }
        };
        system.push(particles.clone(), &log_weights);
    }
    system.finish()
}

/// Psi (auxiliary) particle filter driven by the linear-Gaussian `surrogate` of `model` at `theta`.
///
/// Particles are proposed from the surrogate smoothing distribution: the first state from
/// $N(\hat\alpha_1, V_1)$ and later states from the Gaussian conditional of $\alpha_{t+1}$ given
/// $\alpha_t$ and all observations. The returned log-likelihood is the surrogate log-likelihood
/// plus the sum over time of the log mean incremental weights.
pub fn psi_filter<M: StateSpaceModel, R: Rng + ?Sized>(
    model: &M,
    theta: &DVector<f64>,
    surrogate: &LinearGaussianSsm,
    n_particles: usize,
    resampling: ResamplingStrategy,
    rng: &mut R,
) -> ParticleFilterOutput {
    let n = model.n_time();
    let y = model.observations();
    let smoothed = surrogate.smoother();
    let observation_densities = surrogate.observation_densities();
    let state_densities = surrogate.state_densities();

    let mut system = ParticleSystem::new(n, n_particles);
    if n == 0 {
        return system.finish();
    }
    let mut particles = gaussian_cloud(
        rng,
        &smoothed.mean.column(0).clone_owned(),
        &smoothed.covariance[0],
        n_particles,
    );
    for t in 0..n {
        let mut log_weights = vec![0.0; n_particles];
        if t > 0 {
            let parents = system.resample(t - 1, resampling, rng);
            let previous = &system.particles[t - 1];
            let (offset, gain, cov) = smoothed.conditional(t - 1);
            let sqrt = matrix_square_root(&cov);
            let density = slice_at(&state_densities, t - 1);
            for (i, parent) in parents.into_iter().enumerate() {
                let state: DVector<f64> = previous.column(parent).clone_owned();
                let next = &offset + &gain * &state + &sqrt * standard_normal_vector(rng, cov.nrows());
                let exact = &next - model.transition(t - 1, &state, theta);
                let approx = &next - &surrogate.t[t - 1] * &state - &surrogate.c[t - 1];
                log_weights[i] += density.log_ratio(&exact, &approx);
                particles.set_column(i, &next);
            }
        }
        if let Some(y_t) = observed_row(y, t) {
            let density = slice_at(&observation_densities, t);
            for (i, x) in particles.column_iter().enumerate() {
                let state: DVector<f64> = x.clone_owned();
                let exact = &y_t - model.observation(t, &state, theta);
                let approx = &y_t - &surrogate.z[t] * &state - &surrogate.d[t];
                log_weights[i] += density.log_ratio(&exact, &approx);
            }
        }
        system.push(particles.clone(), &log_weights);
    }
    system.log_likelihood += smoothed.log_likelihood;
    system.finish()
}
