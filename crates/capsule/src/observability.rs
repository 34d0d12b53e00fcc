//! Tracing setup for the runtime binary. The child re-exec goes through
//! the same code path, so its initialization failures are captured too.
use std::borrow::Cow;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tracing::Level;
use tracing_subscriber::prelude::*;

const LOG_FORMAT_TEXT: &str = "text";
const LOG_FORMAT_JSON: &str = "json";

enum LogFormat {
    Text,
    Json,
}

#[cfg(debug_assertions)]
const DEFAULT_LOG_LEVEL: &str = "debug";

#[cfg(not(debug_assertions))]
const DEFAULT_LOG_LEVEL: &str = "warn";

fn detect_log_format(log_format: Option<&str>) -> Result<LogFormat> {
    match log_format {
        None | Some(LOG_FORMAT_TEXT) => Ok(LogFormat::Text),
        Some(LOG_FORMAT_JSON) => Ok(LogFormat::Json),
        Some(unknown) => bail!("unknown log format: {unknown}"),
    }
}

fn detect_log_level(input: Option<&str>, is_debug: bool) -> Result<Level> {
    let log_level: Cow<str> = match input {
        None if is_debug => "debug".into(),
        None => DEFAULT_LOG_LEVEL.into(),
        Some(level) => level.into(),
    };
    Ok(Level::from_str(log_level.as_ref())?)
}

#[derive(Debug, Default)]
pub struct ObservabilityConfig {
    pub log_debug_flag: bool,
    pub log_level: Option<String>,
    pub log_file: Option<PathBuf>,
    pub log_format: Option<String>,
}

pub fn init(config: &ObservabilityConfig) -> Result<()> {
    let level = detect_log_level(config.log_level.as_deref(), config.log_debug_flag)
        .context("failed to parse log level")?;
    let level_filter = tracing_subscriber::filter::LevelFilter::from(level);
    let format = detect_log_format(config.log_format.as_deref())?;

    match &config.log_file {
        Some(log_file) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(log_file)
                .context("failed to open log file")?;
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(Arc::new(file));
            match format {
                LogFormat::Text => tracing_subscriber::registry()
                    .with(level_filter)
                    .with(layer)
                    .init(),
                LogFormat::Json => tracing_subscriber::registry()
                    .with(level_filter)
                    .with(layer.json())
                    .init(),
            }
        }
        None => {
            let layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);
            match format {
                LogFormat::Text => tracing_subscriber::registry()
                    .with(level_filter)
                    .with(layer)
                    .init(),
                LogFormat::Json => tracing_subscriber::registry()
                    .with(level_filter)
                    .with(layer.json())
                    .init(),
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_log_level() {
        assert_eq!(detect_log_level(None, true).unwrap(), Level::DEBUG);
        assert_eq!(
            detect_log_level(Some("error"), false).unwrap(),
            Level::ERROR
        );
        assert!(detect_log_level(Some("not-a-level"), false).is_err());
    }

    #[test]
    fn test_detect_log_format_rejects_unknown() {
        assert!(detect_log_format(Some("yaml")).is_err());
        assert!(detect_log_format(None).is_ok());
    }
}
