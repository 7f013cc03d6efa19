//! Data simulation and CSV input/output
//!
//! This module provides:
//! - [read_observations] and [write_observations] for observation matrices stored as CSV, one row
//!   per time point and one column per observation component. Empty cells, `NaN` and `NA` mark
//!   missing observations.
//! - [write_states] for state trajectories (one row per time point, one column per state).
//! - [write_draws] for the stored draws of a chain together with their correction.
//! - [write_summary] for posterior state moments in long format.
//! - [simulate_data] for generating synthetic data from any [StateSpaceModel].
use std::io;
use std::path::Path;

use nalgebra::{DMatrix, DVector};
use rand::Rng;

use crate::StateSpaceModel;
use crate::correction::CorrectedPosterior;
use crate::linalg::{sample_gaussian, standard_normal_vector};
use crate::mcmc::ChainStorage;
use crate::summary::StateSummary;

fn parse_cell(cell: &str) -> Result<f64, std::num::ParseFloatError> {
    let cell = cell.trim();
    if cell.is_empty() || cell.eq_ignore_ascii_case("na") {
        Ok(f64::NAN)
    } else {
        cell.parse::<f64>()
    }
}

/// Keep I/O failures as they are and report malformed CSV as invalid data.
fn csv_error(err: csv::Error) -> io::Error {
    if !err.is_io_error() {
        return io::Error::new(io::ErrorKind::InvalidData, err);
    }
    match err.into_kind() {
        csv::ErrorKind::Io(e) => e,
        kind => io::Error::new(io::ErrorKind::InvalidData, format!("{kind:?}")),
    }
}

fn format_cell(value: f64) -> String {
    if value.is_nan() {
        String::new()
    } else {
        value.to_string()
    }
}

/// Read an `n x p` observation matrix from a CSV file with a header row.
///
/// ```no_run
/// let y = nlgssm::sim::read_observations("data/observations.csv").expect("Failed to read data");
/// println!("Loaded {} time points", y.nrows());
/// ```
pub fn read_observations<P: AsRef<Path>>(path: P) -> io::Result<DMatrix<f64>> {
    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_path(path)
        .map_err(csv_error)?;
    let p = rdr.headers().map_err(csv_error)?.len();
    let mut values = Vec::new();
    let mut n = 0;
    for (row, record) in rdr.records().enumerate() {
        let record = record.map_err(csv_error)?;
        if record.len() != p {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("row {} has {} fields, expected {}", row + 1, record.len(), p),
            ));
        }
        for (col, cell) in record.iter().enumerate() {
            let value = parse_cell(cell).map_err(|e| {
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("row {}, column {}: '{}': {e}", row + 1, col + 1, cell.trim()),
                )
            })?;
            values.push(value);
        }
        n += 1;
    }
    Ok(DMatrix::from_row_slice(n, p, &values))
}

/// Write an `n x p` observation matrix with columns `y1, .., yp`; missing values are left empty.
pub fn write_observations<P: AsRef<Path>>(y: &DMatrix<f64>, path: P) -> io::Result<()> {
    let header: Vec<String> = (1..=y.ncols()).map(|j| format!("y{j}")).collect();
    write_rows(path, &header, y.row_iter().map(|row| row.iter().copied().collect()))
}

/// Write an `m x n` state trajectory as one row per time point with columns `time, x1, .., xm`.
pub fn write_states<P: AsRef<Path>>(states: &DMatrix<f64>, path: P) -> io::Result<()> {
    let mut header = vec!["time".to_string()];
    header.extend((1..=states.nrows()).map(|i| format!("x{i}")));
    write_rows(
        path,
        &header,
        states.column_iter().enumerate().map(|(t, col)| {
            std::iter::once(t as f64)
                .chain(col.iter().copied())
                .collect()
        }),
    )
}

/// Write the stored draws of a chain.
///
/// Columns are `theta1, .., thetad, count, approx_log_likelihood, log_prior` followed by
/// `exact_log_likelihood, log_posterior, weight` when a correction is given.
pub fn write_draws<P: AsRef<Path>>(
    storage: &ChainStorage,
    posterior: Option<&CorrectedPosterior>,
    path: P,
) -> io::Result<()> {
    if let Some(posterior) = posterior {
        if posterior.len() != storage.len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "correction has {} draws but the chain stores {}",
                    posterior.len(),
                    storage.len()
                ),
            ));
        }
    }
    let mut header: Vec<String> = (1..=storage.n_parameters())
        .map(|j| format!("theta{j}"))
        .collect();
    header.extend(["count", "approx_log_likelihood", "log_prior"].map(String::from));
    if posterior.is_some() {
        header.extend(["exact_log_likelihood", "log_posterior", "weight"].map(String::from));
    }
    write_rows(
        path,
        &header,
        (0..storage.len()).map(|i| {
            let mut row: Vec<f64> = storage.theta[i].iter().copied().collect();
            row.extend([
                storage.counts[i] as f64,
                storage.approx_log_likelihood[i],
                storage.log_prior[i],
            ]);
            if let Some(posterior) = posterior {
                row.extend([
                    posterior.exact_log_likelihood[i],
                    posterior.log_posterior[i],
                    posterior.weights[i],
                ]);
            }
            row
        }),
    )
}

/// Write posterior state moments in long format: `time, state, mean, variance`.
pub fn write_summary<P: AsRef<Path>>(summary: &StateSummary, path: P) -> io::Result<()> {
    let header = ["time", "state", "mean", "variance"].map(String::from);
    let m = summary.mean.nrows();
    write_rows(
        path,
        &header,
        (0..summary.mean.ncols()).flat_map(|t| {
            (0..m).map(move |i| {
                vec![
                    t as f64,
                    (i + 1) as f64,
                    summary.mean[(i, t)],
                    summary.covariance[t][(i, i)],
                ]
            })
        }),
    )
}

fn write_rows<P, I>(path: P, header: &[String], rows: I) -> io::Result<()>
where
    P: AsRef<Path>,
    I: IntoIterator<Item = Vec<f64>>,
{
    let mut writer = csv::Writer::from_path(path)?;
    writer.write_record(header)?;
    for row in rows {
        writer.write_record(row.into_iter().map(format_cell))?;
    }
    writer.flush()?;
    Ok(())
}

/// Simulate a state trajectory (`m x n`) and observations (`n x p`) from `model` at `theta`.
///
/// The number of time points is the model's `n`; the observations stored in the model are not
/// used. Cells that are missing in the model's observations are also missing in the simulated
/// ones.
pub fn simulate_data<M: StateSpaceModel, R: Rng + ?Sized>(
    model: &M,
    theta: &DVector<f64>,
    rng: &mut R,
) -> (DMatrix<f64>, DMatrix<f64>) {
    let n = model.n_time();
    let p = model.observation_dim();
    let m = model.state_dim();
    let k = model.noise_dim();
    let observed = model.observations();
    let mut states = DMatrix::zeros(m, n);
    let mut y = DMatrix::zeros(n, p);
    if n == 0 {
        return (states, y);
    }
    let mut alpha = sample_gaussian(
        rng,
        &model.initial_mean(theta),
        &model.initial_covariance(theta),
    );
    for t in 0..n {
        states.set_column(t, &alpha);
        let h = model.observation_noise(t, theta);
        let y_t = model.observation(t, &alpha, theta) + h * standard_normal_vector(rng, p);
        for j in 0..p {
            y[(t, j)] = if observed[(t, j)].is_nan() {
                f64::NAN
            } else {
                y_t[j]
            };
        }
        if t + 1 < n {
            let r = model.process_noise(t, theta);
            alpha = model.transition(t, &alpha, theta) + r * standard_normal_vector(rng, k);
        }
    }
    (states, y)
}
