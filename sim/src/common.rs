//! Shared helpers for the command line front end: logger setup, output paths and the interruption
//! deadline.
use std::error::Error;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Crates whose records follow the requested level; everything else is held at `warn`.
const LOG_TARGETS: [&str; 2] = ["nlgssm", "nlgssm_sim"];

/// Environment variable with `env_logger` directives that override the defaults.
pub const LOG_ENV: &str = "NLGSSM_LOG";

/// Logger filtering the inference crates at `level` and all other crates at `warn`, with
/// overrides from [LOG_ENV].
pub fn logger_builder(level: log::LevelFilter) -> env_logger::Builder {
    let mut builder = env_logger::Builder::new();
    builder.filter_level(level.min(log::LevelFilter::Warn));
    for target in LOG_TARGETS {
        builder.filter_module(target, level);
    }
    builder.parse_env(env_logger::Env::new().filter(LOG_ENV));
    builder.format(|buf, record| {
        writeln!(
            buf,
            "{} {:<5} {}: {}",
            chrono::Local::now().format("%H:%M:%S%.3f"),
            record.level(),
            record.target(),
            record.args()
        )
    });
    builder
}

/// Install the logger at `log_level` (off, error, warn, info, debug, trace), appending to `log_file`
/// when given and writing to stderr otherwise.
pub fn init_logger(log_level: &str, log_file: Option<&PathBuf>) -> Result<(), Box<dyn Error>> {
    let level = log_level
        .parse::<log::LevelFilter>()
        .map_err(|_| format!("invalid log level '{log_level}'"))?;
    let mut builder = logger_builder(level);
    if let Some(log_path) = log_file {
        ensure_parent_dir(log_path)?;
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)?;
        builder.target(env_logger::Target::Pipe(Box::new(file)));
    }
    builder.try_init()?;
    Ok(())
}

/// Create the parent directory of `path` if it is missing.
pub fn ensure_parent_dir(path: &Path) -> Result<(), Box<dyn Error>> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }
    Ok(())
}

/// Check that `input` is an existing CSV file.
pub fn validate_input_csv(input: &Path) -> Result<(), Box<dyn Error>> {
    if !input.is_file() {
        return Err(format!("Input file '{}' does not exist.", input.display()).into());
    }
    if input.extension().and_then(|s| s.to_str()) != Some("csv") {
        return Err(format!("Input file '{}' is not a CSV file.", input.display()).into());
    }
    Ok(())
}

/// Interruption flag raised after `limit`, or never when no limit is given.
///
/// The watcher thread is detached; it only sets the flag.
pub fn interrupt_after(limit: Option<Duration>) -> Arc<AtomicBool> {
    let flag = Arc::new(AtomicBool::new(false));
    if let Some(limit) = limit {
        let watcher = Arc::clone(&flag);
        std::thread::spawn(move || {
            std::thread::sleep(limit);
            watcher.store(true, Ordering::Relaxed);
        });
    }
    flag
}

#[cfg(test)]
mod tests {
    use super::*;
    use log::{Level, Log, Metadata};

    fn enabled(logger: &env_logger::Logger, target: &str, level: Level) -> bool {
        logger.enabled(&Metadata::builder().target(target).level(level).build())
    }

    #[test]
    fn test_logger_filters_other_crates() {
        let logger = logger_builder(log::LevelFilter::Debug).build();
        assert!(enabled(&logger, "nlgssm::mcmc", Level::Debug));
        assert!(enabled(&logger, "nlgssm_sim", Level::Info));
        assert!(!enabled(&logger, "nlgssm::mcmc", Level::Trace));
        assert!(!enabled(&logger, "rayon_core", Level::Info));
        assert!(enabled(&logger, "rayon_core", Level::Warn));

        let quiet = logger_builder(log::LevelFilter::Error).build();
        assert!(!enabled(&quiet, "nlgssm::correction", Level::Warn));
        assert!(!enabled(&quiet, "csv", Level::Warn));
    }

    #[test]
    fn test_invalid_log_level_is_rejected() {
        assert!(init_logger("loud", None).is_err());
    }

    #[test]
    fn test_ensure_parent_dir_creates_nested_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a/b/out.csv");
        ensure_parent_dir(&path).unwrap();
        assert!(dir.path().join("a/b").is_dir());
    }

    #[test]
    fn test_validate_input_csv() {
        let dir = tempfile::tempdir().unwrap();
        let csv = dir.path().join("y.csv");
        std::fs::write(&csv, "y1\n1.0\n").unwrap();
        assert!(validate_input_csv(&csv).is_ok());
        let txt = dir.path().join("y.txt");
        std::fs::write(&txt, "y1\n1.0\n").unwrap();
        assert!(validate_input_csv(&txt).is_err());
        assert!(validate_input_csv(&dir.path().join("missing.csv")).is_err());
    }

    #[test]
    fn test_interrupt_without_limit_stays_clear() {
        let flag = interrupt_after(None);
        assert!(!flag.load(Ordering::Relaxed));
        let flag = interrupt_after(Some(Duration::from_millis(1)));
        std::thread::sleep(Duration::from_millis(200));
        assert!(flag.load(Ordering::Relaxed));
    }
}
