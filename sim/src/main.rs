//! NLGSSM SIM: approximate MCMC with importance-sampling correction from the command line.
//!
//! The program has three subcommands:
//!
//! - `simulate`: generate synthetic observations (and the true states) from the logistic growth
//!   model.
//! - `run`: read observations from CSV, run the approximate chain and its particle filter
//!   correction, and write the draws and the approximate and corrected state summaries.
//! - `config`: write a template run configuration.
//!
//! Run settings come from a configuration file (TOML/JSON/YAML) given with the global `--config`
//! flag; anything not in the file takes its default.

mod common;

use clap::{Args, Parser, Subcommand, ValueEnum};
use common::{ensure_parent_dir, init_logger, interrupt_after, validate_input_csv};
use log::{error, info, warn};
use nalgebra::{DMatrix, DVector};
use nlgssm::sim::{
    read_observations, simulate_data, write_draws, write_observations, write_states, write_summary,
};
use nlgssm::{
    InferenceConfig, LocalLevelModel, LogisticGrowthModel, StateSpaceModel, run_inference,
    validate_model,
};
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::error::Error;
use std::path::PathBuf;
use std::time::Duration;

const LONG_ABOUT: &str = "NLGSSM SIM: approximate MCMC with importance-sampling correction for nonlinear Gaussian state-space models.

Parameters are sampled with a robust adaptive Metropolis chain that uses a Gaussian approximation of the
model found by iterated linearization. Every stored draw is then reweighted with a particle filter
estimate of the exact likelihood, and a state trajectory is sampled for each draw.

Observation files are CSV with a header row, one row per time point and one column per observation
component. Empty cells, NaN and NA mark missing observations.";

/// Command line arguments
#[derive(Parser)]
#[command(author, version, about = "Approximate MCMC for nonlinear Gaussian state-space models.", long_about = LONG_ABOUT)]
struct Cli {
    /// Run configuration file (TOML/JSON/YAML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,

    /// Log level (off, error, warn, info, debug, trace)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// Log file path (if not specified, logs to stderr)
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,
}

#[derive(Subcommand, Clone)]
enum Command {
    #[command(
        name = "simulate",
        about = "Simulate data from the logistic growth model",
        long_about = "Simulate a population path and noisy observations of it from the logistic growth model at the given log standard deviations. The observations are written in the format read by `run`."
    )]
    Simulate(SimulateArgs),
    #[command(
        name = "run",
        about = "Run approximate MCMC and its importance-sampling correction",
        long_about = "Read observations, run the approximate chain from the configured starting point, correct every stored draw with a particle filter and write the draws together with the approximate and corrected state summaries."
    )]
    Run(RunArgs),
    #[command(name = "config", about = "Write a template configuration file")]
    CreateConfig(CreateConfigArgs),
}

/// Built-in models
#[derive(Clone, Copy, Debug, ValueEnum)]
enum ModelKind {
    LocalLevel,
    LogisticGrowth,
}

/// Settings of the logistic growth model
#[derive(Args, Clone, Debug)]
struct GrowthArgs {
    /// Time step between observations
    #[arg(long, default_value_t = 0.1)]
    dt: f64,
    /// Carrying capacity
    #[arg(long, default_value_t = 10.0)]
    capacity: f64,
    /// Mean of the initial population
    #[arg(long, default_value_t = 1.0)]
    initial_population: f64,
}

#[derive(Args, Clone, Debug)]
struct SimulateArgs {
    /// Output CSV file for the observations
    #[arg(short, long)]
    output: PathBuf,
    /// Optional CSV file for the simulated states
    #[arg(long)]
    states: Option<PathBuf>,
    /// Number of time points
    #[arg(short, long, default_value_t = 100)]
    n_time: usize,
    /// Log standard deviations of the rate, population and observation noise
    #[arg(long, value_delimiter = ',', allow_hyphen_values = true, default_values_t = [-3.0, -2.0, -1.0])]
    theta: Vec<f64>,
    #[arg(long, default_value_t = 1)]
    seed: u64,
    #[command(flatten)]
    growth: GrowthArgs,
}

#[derive(Args, Clone, Debug)]
struct RunArgs {
    /// Observation CSV file
    #[arg(short, long)]
    input: PathBuf,
    /// Output directory for draws.csv, approximate_summary.csv and corrected_summary.csv
    #[arg(short, long)]
    output: PathBuf,
    #[arg(long, value_enum, default_value_t = ModelKind::LogisticGrowth)]
    model: ModelKind,
    /// Starting parameters; overrides `initial_theta` of the configuration
    #[arg(long, value_delimiter = ',', allow_hyphen_values = true)]
    theta: Option<Vec<f64>>,
    /// Stop the chain after this many seconds and correct the draws stored so far
    #[arg(long)]
    time_limit: Option<f64>,
    #[command(flatten)]
    growth: GrowthArgs,
}

#[derive(Args, Clone, Debug)]
struct CreateConfigArgs {
    /// Output path (.toml, .json, .yaml or .yml)
    #[arg(short, long)]
    output: PathBuf,
}

fn load_config(path: Option<&PathBuf>) -> Result<InferenceConfig, Box<dyn Error>> {
    match path {
        Some(path) => {
            info!("Reading configuration from {}", path.display());
            Ok(InferenceConfig::from_file(path)?)
        }
        None => Ok(InferenceConfig::default()),
    }
}

fn growth_model(y: DMatrix<f64>, args: &GrowthArgs) -> LogisticGrowthModel {
    LogisticGrowthModel::new(y, args.dt, args.initial_population, args.capacity)
}

fn run_simulate(args: &SimulateArgs) -> Result<(), Box<dyn Error>> {
    let model = growth_model(DMatrix::zeros(args.n_time, 1), &args.growth);
    let theta = DVector::from_vec(args.theta.clone());
    validate_model(&model, &theta)?;
    let mut rng = StdRng::seed_from_u64(args.seed);
    let (states, y) = simulate_data(&model, &theta, &mut rng);
    ensure_parent_dir(&args.output)?;
    write_observations(&y, &args.output)?;
    info!(
        "Wrote {} simulated observations to {}",
        args.n_time,
        args.output.display()
    );
    if let Some(path) = &args.states {
        ensure_parent_dir(path)?;
        write_states(&states, path)?;
        info!("Wrote simulated states to {}", path.display());
    }
    Ok(())
}

fn default_theta(model: ModelKind) -> Vec<f64> {
    match model {
        ModelKind::LocalLevel => vec![1.0, 1.0],
        ModelKind::LogisticGrowth => vec![-2.0, -2.0, -2.0],
    }
}

fn run_model<M: StateSpaceModel>(
    model: &M,
    theta0: &DVector<f64>,
    config: &InferenceConfig,
    args: &RunArgs,
) -> Result<(), Box<dyn Error>> {
    let limit = args.time_limit.map(Duration::from_secs_f64);
    let interrupt = interrupt_after(limit);
    let output = run_inference(model, theta0, config, Some(interrupt.as_ref()))?;
    if output.mcmc.interrupted {
        warn!("Time limit reached; results are based on a shortened chain");
    }

    std::fs::create_dir_all(&args.output)?;
    let out = |name: &str| -> PathBuf { args.output.join(name) };
    write_draws(&output.mcmc.storage, Some(&output.posterior), out("draws.csv"))?;
    write_summary(&output.approximate_summary, out("approximate_summary.csv"))?;
    write_summary(&output.corrected_summary, out("corrected_summary.csv"))?;

    let counts = &output.mcmc.storage.counts;
    info!(
        "Acceptance rate {:.3}; {} stored draws covering {} iterations",
        output.mcmc.acceptance_rate,
        output.mcmc.storage.len(),
        output.mcmc.storage.total_count()
    );
    info!(
        "Importance weights: effective sample size {:.1}, {} zero-weight draws",
        output.posterior.effective_sample_size(counts),
        output.posterior.zero_weight_draws()
    );
    info!("Results written to {}", args.output.display());
    Ok(())
}

fn run_cli(args: &RunArgs, config_path: Option<&PathBuf>) -> Result<(), Box<dyn Error>> {
    validate_input_csv(&args.input)?;
    let mut config = load_config(config_path)?;
    if let Some(theta) = &args.theta {
        config.initial_theta = theta.clone();
    }
    if config.initial_theta.is_empty() {
        config.initial_theta = default_theta(args.model);
    }
    let theta0 = DVector::from_vec(config.initial_theta.clone());
    let y = read_observations(&args.input)?;
    info!(
        "Read {} time points with {} components from {}",
        y.nrows(),
        y.ncols(),
        args.input.display()
    );
    match args.model {
        ModelKind::LocalLevel => {
            let model = LocalLevelModel::new(y, 0.0, 10.0);
            run_model(&model, &theta0, &config, args)
        }
        ModelKind::LogisticGrowth => {
            let model = growth_model(y, &args.growth);
            run_model(&model, &theta0, &config, args)
        }
    }
}

fn create_config_file(args: &CreateConfigArgs) -> Result<(), Box<dyn Error>> {
    ensure_parent_dir(&args.output)?;
    InferenceConfig::default().to_file(&args.output)?;
    info!("Wrote template configuration to {}", args.output.display());
    Ok(())
}

fn dispatch(cli: &Cli) -> Result<(), Box<dyn Error>> {
    match &cli.command {
        Some(Command::Simulate(args)) => run_simulate(args),
        Some(Command::Run(args)) => run_cli(args, cli.config.as_ref()),
        Some(Command::CreateConfig(args)) => create_config_file(args),
        None => Err("No command provided. Use -h or --help for usage information.".into()),
    }
}

fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    init_logger(&cli.log_level, cli.log_file.as_ref())?;
    if let Err(e) = dispatch(&cli) {
        error!("{e}");
        return Err(e);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_negative_theta_list_parses() {
        let cli = Cli::try_parse_from([
            "nlgssm-sim",
            "simulate",
            "--output",
            "y.csv",
            "--theta",
            "-1.5,-2,-0.5",
        ])
        .unwrap();
        match cli.command {
            Some(Command::Simulate(args)) => assert_eq!(args.theta, vec![-1.5, -2.0, -0.5]),
            _ => panic!("expected the simulate subcommand"),
        }
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "nlgssm-sim",
            "run",
            "-i",
            "y.csv",
            "-o",
            "out",
            "--model",
            "local-level",
            "--config",
            "run.toml",
            "--log-level",
            "debug",
        ])
        .unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("run.toml")));
        assert_eq!(cli.log_level, "debug");
        assert!(matches!(
            cli.command,
            Some(Command::Run(RunArgs {
                model: ModelKind::LocalLevel,
                ..
            }))
        ));
    }

    #[test]
    fn test_simulate_then_run() {
        let dir = tempfile::tempdir().unwrap();
        let data = dir.path().join("y.csv");
        let sim = SimulateArgs {
            output: data.clone(),
            states: Some(dir.path().join("states.csv")),
            n_time: 20,
            theta: vec![-3.0, -2.0, -1.0],
            seed: 5,
            growth: GrowthArgs {
                dt: 0.5,
                capacity: 10.0,
                initial_population: 1.0,
            },
        };
        run_simulate(&sim).unwrap();

        let config_path = dir.path().join("run.yaml");
        let mut config = InferenceConfig::default();
        config.mcmc.n_iter = 300;
        config.mcmc.n_burnin = 100;
        config.correction.n_particles = 20;
        config.to_file(&config_path).unwrap();

        let run = RunArgs {
            input: data,
            output: dir.path().join("out"),
            model: ModelKind::LogisticGrowth,
            theta: Some(vec![-3.0, -2.0, -1.0]),
            time_limit: None,
            growth: sim.growth.clone(),
        };
        run_cli(&run, Some(&config_path)).unwrap();
        for name in ["draws.csv", "approximate_summary.csv", "corrected_summary.csv"] {
            assert!(dir.path().join("out").join(name).is_file(), "{name}");
        }
    }

    #[test]
    fn test_run_rejects_short_theta() {
        let dir = tempfile::tempdir().unwrap();
        let data = dir.path().join("y.csv");
        std::fs::write(&data, "y1\n1.0\n1.2\n0.9\n").unwrap();
        let run = RunArgs {
            input: data,
            output: dir.path().join("out"),
            model: ModelKind::LocalLevel,
            theta: Some(vec![1.0]),
            time_limit: None,
            growth: GrowthArgs {
                dt: 1.0,
                capacity: 10.0,
                initial_population: 1.0,
            },
        };
        let err = run_cli(&run, None).unwrap_err();
        assert!(err.to_string().contains("parameter vector"), "{err}");
        assert!(!dir.path().join("out").exists());
    }
}
