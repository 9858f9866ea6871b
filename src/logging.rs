//! Logging configuration and initialization for strata.

use std::fs::{self, File};
use std::path::Path;
use std::sync::Arc;

use tracing::Level;
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;
use crate::Result;

/// Level names accepted in configuration, most severe first.
const LEVEL_NAMES: &[(&str, Level)] = &[
    ("error", Level::ERROR),
    ("warn", Level::WARN),
    ("warning", Level::WARN),
    ("info", Level::INFO),
    ("debug", Level::DEBUG),
    ("trace", Level::TRACE),
];

fn resolve_level(name: &str) -> Level {
    LEVEL_NAMES
        .iter()
        .find(|(candidate, _)| name.eq_ignore_ascii_case(candidate))
        .map(|(_, level)| *level)
        .unwrap_or(Level::INFO)
}

/// Initialize the logging system with the given configuration.
///
/// Writes to the console, and additionally to the configured log file when
/// one is set.
pub fn init(config: &LoggingConfig) -> Result<()> {
    let filter =
        EnvFilter::from_default_env().add_directive(resolve_level(&config.level).into());

    match &config.file {
        Some(path) => {
            if let Some(parent) = Path::new(path).parent() {
                if !parent.exists() {
                    fs::create_dir_all(parent)?;
                }
            }
            let log_file = Arc::new(File::create(path)?);
            let writer = std::io::stdout.and(log_file);

            tracing_subscriber::registry()
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(writer)
                        .with_ansi(false)
                        .with_target(true),
                )
                .with(filter)
                .init();
        }
        None => {
            tracing_subscriber::registry()
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(std::io::stdout)
                        .with_ansi(true)
                        .with_target(true),
                )
                .with(filter)
                .init();
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_level_known() {
        assert_eq!(resolve_level("trace"), Level::TRACE);
        assert_eq!(resolve_level("DEBUG"), Level::DEBUG);
        assert_eq!(resolve_level("info"), Level::INFO);
        assert_eq!(resolve_level("warning"), Level::WARN);
        assert_eq!(resolve_level("warn"), Level::WARN);
        assert_eq!(resolve_level("error"), Level::ERROR);
    }

    #[test]
    fn test_resolve_level_falls_back_to_info() {
        assert_eq!(resolve_level("verbose"), Level::INFO);
        assert_eq!(resolve_level(""), Level::INFO);
    }
}
