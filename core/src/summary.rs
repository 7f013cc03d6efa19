//! Weighted posterior moments of the state paths
//!
//! Every stored draw contributes a mean path and a covariance path (from the surrogate smoother or
//! from its particle genealogy) together with a weight. The posterior covariance follows the law of
//! total variance: the weighted mean of the within-draw covariances plus the weighted covariance of
//! the draw means.
//!
//! Accumulators are combined with the pairwise weighted merge rule
//!
//! $$
//! \begin{aligned}
//! W &= W_a + W_b, \quad \delta = \mu_b - \mu_a \\\\
//! \mu &= \mu_a + \delta W_b / W \\\\
//! V &= V_a + (V_b - V_a) W_b / W \\\\
//! M_2 &= M_{2,a} + M_{2,b} + \delta \delta^T W_a W_b / W
//! \end{aligned}
//! $$
//!
//! so per-thread partial sums can be merged in any order, and adding a single draw is the same rule
//! with $M_{2,b} = 0$.
use std::ops::Range;
use std::sync::{Mutex, PoisonError};

use anyhow::Context;
use nalgebra::{DMatrix, DVector};

use crate::StateSpaceModel;
use crate::correction::{CorrectedPosterior, chunk_ranges, surrogate_for};
use crate::linearize::ApproximationOptions;
use crate::mcmc::ChainStorage;

/// Mean path (`m x n`) and covariance path (`n` slices of `m x m`) of one draw.
#[derive(Clone, Debug, PartialEq)]
pub struct StateMoments {
    pub mean: DMatrix<f64>,
    pub covariance: Vec<DMatrix<f64>>,
}

impl StateMoments {
    pub fn zeros(m: usize, n: usize) -> Self {
        StateMoments {
            mean: DMatrix::zeros(m, n),
            covariance: vec![DMatrix::zeros(m, m); n],
        }
    }
}

/// Final posterior state summary.
#[derive(Clone, Debug, PartialEq)]
pub struct StateSummary {
    /// Weighted mean path, `m x n`
    pub mean: DMatrix<f64>,
    /// Posterior covariances, `n` slices of `m x m`
    pub covariance: Vec<DMatrix<f64>>,
    pub total_weight: f64,
    /// Sum of the repeat counts of the draws with positive weight
    pub total_count: usize,
}

/// Running (weight, mean, within-covariance, between-scatter) accumulator.
#[derive(Clone, Debug, PartialEq)]
pub struct WeightedSummary {
    weight: f64,
    count: usize,
    mean: DMatrix<f64>,
    within: Vec<DMatrix<f64>>,
    scatter: Vec<DMatrix<f64>>,
}

impl WeightedSummary {
    pub fn new(m: usize, n: usize) -> Self {
        WeightedSummary {
            weight: 0.0,
            count: 0,
            mean: DMatrix::zeros(m, n),
            within: vec![DMatrix::zeros(m, m); n],
            scatter: vec![DMatrix::zeros(m, m); n],
        }
    }
    pub fn total_weight(&self) -> f64 {
        self.weight
    }
    pub fn total_count(&self) -> usize {
        self.count
    }
    /// Fold one draw into the accumulator. Draws with zero (or non-finite) weight are skipped.
    pub fn add(&mut self, moments: &StateMoments, weight: f64, count: usize) {
        if !(weight > 0.0 && weight.is_finite()) {
            return;
        }
        self.combine(weight, count, &moments.mean, &moments.covariance, None);
    }
    /// Merge another accumulator into this one.
    pub fn merge(&mut self, other: &WeightedSummary) {
        if other.weight <= 0.0 {
            return;
        }
        self.combine(
            other.weight,
            other.count,
            &other.mean,
            &other.within,
            Some(other.scatter.as_slice()),
        );
    }
    fn combine(
        &mut self,
        weight: f64,
        count: usize,
        mean: &DMatrix<f64>,
        within: &[DMatrix<f64>],
        scatter: Option<&[DMatrix<f64>]>,
    ) {
        let total = self.weight + weight;
        let ratio = weight / total;
        let cross = self.weight * weight / total;
        let delta = mean - &self.mean;
        for t in 0..self.within.len() {
            let d: DVector<f64> = delta.column(t).clone_owned();
            let step = (&within[t] - &self.within[t]) * ratio;
            self.within[t] += step;
            self.scatter[t] += &d * d.transpose() * cross;
            if let Some(scatter) = scatter {
                self.scatter[t] += &scatter[t];
            }
        }
        self.mean += delta * ratio;
        self.weight = total;
        self.count += count;
    }
    /// Posterior mean and covariance paths. The between-draw part is scaled by `C / (C - 1)`
    /// where `C` is the total repeat count; no correction is applied when `C <= 1`.
    pub fn finish(&self) -> StateSummary {
        let correction = if self.count > 1 {
            self.count as f64 / (self.count - 1) as f64
        } else {
            1.0
        };
        let covariance = self
            .within
            .iter()
            .zip(&self.scatter)
            .map(|(v, s)| {
                if self.weight > 0.0 {
                    v + s * (correction / self.weight)
                } else {
                    v.clone()
                }
            })
            .collect();
        StateSummary {
            mean: self.mean.clone(),
            covariance,
            total_weight: self.weight,
            total_count: self.count,
        }
    }
}

/// Fold draws `0..n_draws` with `n_threads` workers over contiguous ranges and merge the partial
/// accumulators into a shared one under a mutex.
///
/// `fold` adds draw `i` to the given accumulator.
pub fn parallel_fold<F>(
    n_draws: usize,
    m: usize,
    n: usize,
    n_threads: usize,
    fold: F,
) -> anyhow::Result<StateSummary>
where
    F: Fn(usize, &mut WeightedSummary) + Sync,
{
    let fold_range = |range: Range<usize>| {
        let mut local = WeightedSummary::new(m, n);
        for i in range {
            fold(i, &mut local);
        }
        local
    };
    if n_threads <= 1 {
        return Ok(fold_range(0..n_draws).finish());
    }
    let shared = Mutex::new(WeightedSummary::new(m, n));
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(n_threads)
        .build()
        .context("failed to build the summary worker pool")?;
    pool.scope(|s| {
        for range in chunk_ranges(n_draws, n_threads) {
            let shared = &shared;
            let fold_range = &fold_range;
            s.spawn(move |_| {
                let local = fold_range(range);
                shared
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .merge(&local);
            });
        }
    });
    let summary = shared.into_inner().unwrap_or_else(PoisonError::into_inner);
    Ok(summary.finish())
}

/// Weighted summary of precomputed per-draw moments.
pub fn summarize_parallel(
    moments: &[StateMoments],
    weights: &[f64],
    counts: &[usize],
    n_threads: usize,
) -> anyhow::Result<StateSummary> {
    anyhow::ensure!(
        moments.len() == weights.len() && weights.len() == counts.len(),
        "moments, weights and counts differ in length ({}, {}, {})",
        moments.len(),
        weights.len(),
        counts.len()
    );
    let (m, n) = moments.first().map_or((0, 0), |mo| mo.mean.shape());
    parallel_fold(moments.len(), m, n, n_threads, |i, acc| {
        acc.add(&moments[i], weights[i], counts[i])
    })
}

/// Summary of the approximate posterior: surrogate smoother moments at the mode of every stored
/// draw, weighted by the repeat count.
pub fn approximate_summary<M: StateSpaceModel>(
    model: &M,
    storage: &ChainStorage,
    options: &ApproximationOptions,
    n_threads: usize,
) -> anyhow::Result<StateSummary> {
    let m = model.state_dim();
    let n = model.n_time();
    parallel_fold(storage.len(), m, n, n_threads, |i, acc| {
        let smoothed = surrogate_for(model, storage, i, options).smoother();
        let moments = StateMoments {
            mean: smoothed.mean,
            covariance: smoothed.covariance,
        };
        acc.add(&moments, storage.counts[i] as f64, storage.counts[i]);
    })
}

/// Summary of the corrected posterior: genealogy moments of every draw weighted by its importance
/// weight times its repeat count.
pub fn corrected_summary(
    posterior: &CorrectedPosterior,
    counts: &[usize],
    n_threads: usize,
) -> anyhow::Result<StateSummary> {
    let weights: Vec<f64> = posterior
        .weights
        .iter()
        .zip(counts)
        .map(|(w, c)| w * *c as f64)
        .collect();
    summarize_parallel(&posterior.state_moments, &weights, counts, n_threads)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn scalar_moments(mean: f64, var: f64) -> StateMoments {
        StateMoments {
            mean: DMatrix::from_element(1, 1, mean),
            covariance: vec![DMatrix::from_element(1, 1, var)],
        }
    }

    fn random_moments(rng: &mut StdRng, count: usize) -> Vec<StateMoments> {
        (0..count)
            .map(|_| {
                let mean = DMatrix::from_fn(2, 4, |_, _| rng.random::<f64>() * 4.0 - 2.0);
                let covariance = (0..4)
                    .map(|_| {
                        let a = DMatrix::from_fn(2, 2, |_, _| rng.random::<f64>());
                        &a * a.transpose()
                    })
                    .collect();
                StateMoments { mean, covariance }
            })
            .collect()
    }

    fn assert_summary_eq(a: &StateSummary, b: &StateSummary) {
        assert_eq!(a.total_count, b.total_count);
        assert_approx_eq!(a.total_weight, b.total_weight, 1e-10);
        for (x, y) in a.mean.iter().zip(b.mean.iter()) {
            assert_approx_eq!(x, y, 1e-10);
        }
        for (ca, cb) in a.covariance.iter().zip(&b.covariance) {
            for (x, y) in ca.iter().zip(cb.iter()) {
                assert_approx_eq!(x, y, 1e-10);
            }
        }
    }

    #[test]
    fn t_law_of_total_variance() {
        let mut acc = WeightedSummary::new(1, 1);
        acc.add(&scalar_moments(0.0, 1.0), 1.0, 1);
        acc.add(&scalar_moments(2.0, 1.0), 1.0, 1);
        let summary = acc.finish();
        assert_approx_eq!(summary.mean[(0, 0)], 1.0, 1e-12);
        // Within 1, sample variance of {0, 2} is 2.
        assert_approx_eq!(summary.covariance[0][(0, 0)], 3.0, 1e-12);
    }

    #[test]
    fn t_single_count_has_no_bessel_correction() {
        let mut acc = WeightedSummary::new(1, 1);
        acc.add(&scalar_moments(0.5, 2.0), 3.0, 1);
        let summary = acc.finish();
        assert_eq!(summary.total_count, 1);
        assert_approx_eq!(summary.covariance[0][(0, 0)], 2.0, 1e-12);
    }

    #[test]
    fn t_zero_weight_draw_changes_nothing() {
        let mut rng = StdRng::seed_from_u64(9);
        let moments = random_moments(&mut rng, 5);
        let weights = [0.3, 1.2, 0.0, 2.0, 0.7];
        let counts = [1, 2, 5, 1, 3];
        let with_zero = summarize_parallel(&moments, &weights, &counts, 1).unwrap();
        let keep = [0usize, 1, 3, 4];
        let without = summarize_parallel(
            &keep.iter().map(|&i| moments[i].clone()).collect::<Vec<_>>(),
            &keep.iter().map(|&i| weights[i]).collect::<Vec<_>>(),
            &keep.iter().map(|&i| counts[i]).collect::<Vec<_>>(),
            1,
        )
        .unwrap();
        assert_summary_eq(&with_zero, &without);
    }

    #[test]
    fn t_parallel_merge_matches_sequential() {
        let mut rng = StdRng::seed_from_u64(10);
        let moments = random_moments(&mut rng, 11);
        let equal = vec![1.0; 11];
        let skewed: Vec<f64> = (0..11).map(|i| 10f64.powi(i % 4) * 0.01).collect();
        let counts: Vec<usize> = (0..11).map(|i| 1 + i % 3).collect();
        for weights in [&equal, &skewed] {
            let sequential = summarize_parallel(&moments, weights, &counts, 1).unwrap();
            for threads in [2, 4] {
                let parallel = summarize_parallel(&moments, weights, &counts, threads).unwrap();
                assert_summary_eq(&sequential, &parallel);
            }
        }
    }

    #[test]
    fn t_merge_equals_direct_computation() {
        let mut rng = StdRng::seed_from_u64(12);
        let moments = random_moments(&mut rng, 6);
        let weights = [0.5, 1.0, 1.5, 2.0, 2.5, 3.0];
        let counts = [1usize; 6];
        let summary = summarize_parallel(&moments, &weights, &counts, 1).unwrap();
        let w_sum: f64 = weights.iter().sum();
        for t in 0..4 {
            let mean: DVector<f64> = moments
                .iter()
                .zip(&weights)
                .map(|(mo, w)| mo.mean.column(t) * *w)
                .fold(DVector::zeros(2), |acc, x| acc + x)
                / w_sum;
            let mut within = DMatrix::zeros(2, 2);
            let mut between = DMatrix::zeros(2, 2);
            for (mo, w) in moments.iter().zip(&weights) {
                within += &mo.covariance[t] * *w;
                let d = mo.mean.column(t) - &mean;
                between += &d * d.transpose() * *w;
            }
            let expected = within / w_sum + between / w_sum * (6.0 / 5.0);
            for (x, y) in summary.covariance[t].iter().zip(expected.iter()) {
                assert_approx_eq!(x, y, 1e-10);
            }
            for (x, y) in summary.mean.column(t).iter().zip(mean.iter()) {
                assert_approx_eq!(x, y, 1e-12);
            }
        }
    }
}
