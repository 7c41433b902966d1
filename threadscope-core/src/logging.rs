//! Tracing setup for the watch daemon.
//!
//! The daemon logs to a daily-rolling file under the XDG state directory
//! (see [`Config::log_path`]) and, with `logging.stderr`, mirrors the same
//! events to the terminal. One-shot commands leave logging uninitialized.

use crate::config::{Config, LoggingConfig};
use crate::error::{Error, Result};
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

const FALLBACK_LEVEL: &str = "info";

/// Keeps the background log writer running; pending lines flush on drop.
pub struct LoggingGuard {
    _writer: WorkerGuard,
}

/// Install the global subscriber. `RUST_LOG` overrides `config.level`.
pub fn init(config: &LoggingConfig) -> Result<LoggingGuard> {
    let log_path = Config::log_path();
    let (log_dir, file_name) = split_log_path(&log_path)?;
    std::fs::create_dir_all(log_dir)?;

    let appender = RollingFileAppender::new(Rotation::DAILY, log_dir, file_name);
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let file_layer = fmt::layer()
        .with_writer(writer)
        .with_ansi(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);
    let stderr_layer = config
        .stderr
        .then(|| fmt::layer().with_writer(std::io::stderr).with_target(false));

    tracing_subscriber::registry()
        .with(filter(config))
        .with(file_layer)
        .with(stderr_layer)
        .try_init()
        .map_err(|e| Error::Config(format!("logging already initialized: {}", e)))?;

    tracing::info!(
        log_file = %log_path.display(),
        level = %config.level,
        stderr = config.stderr,
        "Logging initialized"
    );
    Ok(LoggingGuard { _writer: guard })
}

/// Subscriber for tests; output is captured per test.
pub fn init_test() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .with_span_events(FmtSpan::CLOSE)
        .try_init();
}

fn filter(config: &LoggingConfig) -> EnvFilter {
    if let Ok(from_env) = EnvFilter::try_from_default_env() {
        return from_env;
    }
    EnvFilter::try_new(&config.level).unwrap_or_else(|e| {
        eprintln!(
            "threadscope: invalid log level {:?} ({}), using {}",
            config.level, e, FALLBACK_LEVEL
        );
        EnvFilter::new(FALLBACK_LEVEL)
    })
}

fn split_log_path(path: &Path) -> Result<(&Path, &std::ffi::OsStr)> {
    match (path.parent(), path.file_name()) {
        (Some(dir), Some(name)) => Ok((dir, name)),
        _ => Err(Error::Config(format!(
            "log path {} has no file name",
            path.display()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_path_splits_into_state_dir_and_file() {
        let path = Config::log_path();
        let (dir, name) = split_log_path(&path).unwrap();
        assert_eq!(name, "threadscope.log");
        assert_eq!(dir, Config::state_dir());
        assert!(split_log_path(Path::new("/")).is_err());
    }

    #[test]
    fn test_bad_level_falls_back() {
        let config = LoggingConfig {
            level: "loud=[[".to_string(),
            stderr: false,
        };
        // Only meaningful without RUST_LOG in the environment.
        if std::env::var_os("RUST_LOG").is_none() {
            assert_eq!(filter(&config).to_string(), FALLBACK_LEVEL);
        }
    }
}
