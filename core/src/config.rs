//! Run configuration and the end-to-end inference pipeline
//!
//! [InferenceConfig] bundles the settings of every stage and can be stored as JSON, YAML or TOML.
//! [run_inference] runs the approximate chain, the importance-sampling correction and both state
//! summaries in one call.
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;
use std::sync::atomic::AtomicBool;

use log::{info, warn};
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::StateSpaceModel;
use crate::correction::{CorrectedPosterior, CorrectionConfig, correct};
use crate::linearize::ApproximationOptions;
use crate::mcmc::{AdaptiveSampler, McmcConfig, McmcOutput};
use crate::summary::{StateSummary, approximate_summary, corrected_summary};

fn default_initial_scale() -> f64 {
    0.1
}

/// Settings of a complete inference run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InferenceConfig {
    /// Starting parameter vector; empty means the caller supplies one
    #[serde(default)]
    pub initial_theta: Vec<f64>,
    /// Diagonal of the initial proposal factor
    #[serde(default = "default_initial_scale")]
    pub initial_scale: f64,
    /// Replicate repeated draws before the correction so every draw is corrected separately
    #[serde(default)]
    pub expand_storage: bool,
    #[serde(default)]
    pub mcmc: McmcConfig,
    #[serde(default)]
    pub approximation: ApproximationOptions,
    #[serde(default)]
    pub correction: CorrectionConfig,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        InferenceConfig {
            initial_theta: Vec::new(),
            initial_scale: default_initial_scale(),
            expand_storage: false,
            mcmc: McmcConfig::default(),
            approximation: ApproximationOptions::default(),
            correction: CorrectionConfig::default(),
        }
    }
}

impl InferenceConfig {
    /// Write the configuration to a JSON file (pretty-printed).
    pub fn to_json<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let file = File::create(path)?;
        serde_json::to_writer_pretty(file, self).map_err(io::Error::other)
    }
    pub fn from_json<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = File::open(path)?;
        serde_json::from_reader(file).map_err(io::Error::other)
    }
    pub fn to_yaml<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let mut file = File::create(path)?;
        let s = serde_yaml::to_string(self).map_err(io::Error::other)?;
        file.write_all(s.as_bytes())
    }
    pub fn from_yaml<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = File::open(path)?;
        serde_yaml::from_reader(file).map_err(io::Error::other)
    }
    pub fn to_toml<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let mut file = File::create(path)?;
        let s = toml::to_string(self).map_err(io::Error::other)?;
        file.write_all(s.as_bytes())
    }
    pub fn from_toml<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let mut s = String::new();
        File::open(path)?.read_to_string(&mut s)?;
        toml::from_str(&s).map_err(io::Error::other)
    }
    /// Write in the format given by the file extension (.json, .yaml, .yml or .toml).
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let p = path.as_ref();
        match extension(p).as_deref() {
            Some("json") => self.to_json(p),
            Some("yaml") | Some("yml") => self.to_yaml(p),
            Some("toml") => self.to_toml(p),
            _ => Err(unsupported(p)),
        }
    }
    /// Read in the format given by the file extension (.json, .yaml, .yml or .toml).
    pub fn from_file<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let p = path.as_ref();
        match extension(p).as_deref() {
            Some("json") => Self::from_json(p),
            Some("yaml") | Some("yml") => Self::from_yaml(p),
            Some("toml") => Self::from_toml(p),
            _ => Err(unsupported(p)),
        }
    }
    /// Check every stage's settings.
    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.initial_scale.is_finite() && self.initial_scale > 0.0,
            "initial_scale must be positive, got {}",
            self.initial_scale
        );
        anyhow::ensure!(
            self.approximation.max_iter >= 1,
            "approximation.max_iter must be at least 1"
        );
        self.mcmc.validate()?;
        self.correction.validate()
    }
}

fn extension(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|s| s.to_str())
        .map(|s| s.to_lowercase())
}

fn unsupported(path: &Path) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidInput,
        format!("unsupported file extension: {}", path.display()),
    )
}

/// Everything produced by [run_inference].
#[derive(Clone, Debug)]
pub struct InferenceOutput {
    /// Approximate chain; its storage is the one that was corrected
    pub mcmc: McmcOutput,
    pub posterior: CorrectedPosterior,
    /// State moments under the approximate posterior
    pub approximate_summary: StateSummary,
    /// State moments under the corrected posterior
    pub corrected_summary: StateSummary,
}

/// Run the approximate chain from `theta0` and correct it.
///
/// An interrupted chain is still corrected and summarized with the draws stored so far.
pub fn run_inference<M: StateSpaceModel>(
    model: &M,
    theta0: &DVector<f64>,
    config: &InferenceConfig,
    interrupt: Option<&AtomicBool>,
) -> anyhow::Result<InferenceOutput> {
    config.validate()?;
    let d = theta0.len();
    let sampler = AdaptiveSampler::new(
        config.mcmc.clone(),
        config.approximation,
        DMatrix::identity(d, d) * config.initial_scale,
    );
    let mut mcmc = sampler.run(model, theta0, interrupt)?;
    if mcmc.storage.is_empty() {
        warn!("No draws were stored; the correction and summaries are empty");
    }
    if config.expand_storage {
        mcmc.storage = mcmc.storage.expand();
    }
    let storage = &mcmc.storage;
    let n_threads = config.correction.n_threads;

    let approximate = approximate_summary(model, storage, &config.approximation, n_threads)?;
    let posterior = correct(model, storage, &config.correction, &config.approximation)?;
    let corrected = corrected_summary(&posterior, &storage.counts, n_threads)?;
    info!(
        "Inference finished: {} draws, acceptance rate {:.3}, {} zero-weight draws",
        storage.len(),
        mcmc.acceptance_rate,
        posterior.zero_weight_draws()
    );
    Ok(InferenceOutput {
        mcmc,
        posterior,
        approximate_summary: approximate,
        corrected_summary: corrected,
    })
}
