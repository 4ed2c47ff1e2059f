use clap::ValueEnum;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::OnceLock;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

const FILTER_VAR: &str = "SFU_LOG_FILTER";

// Event targets used across the crate, on top of the module paths.
const PUBLISHER_TARGETS: &[&str] = &[
    "sfu_publisher",
    "signaling",
    "negotiation",
    "publisher",
    "media",
];

#[derive(Clone, Copy, Debug, Default, ValueEnum, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct LogConfig {
    pub level: LogLevel,
    pub file: Option<PathBuf>,
}

#[derive(thiserror::Error, Debug)]
pub enum InitError {
    #[error("failed to open log file {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to configure logger: {0}")]
    Configure(String),
}

static GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Installs the global subscriber. Later calls are no-ops.
pub fn init(config: &LogConfig) -> Result<(), InitError> {
    if GUARD.get().is_some() {
        return Ok(());
    }

    let (writer, guard) = match &config.file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|source| InitError::Io {
                    path: path.clone(),
                    source,
                })?;
            tracing_appender::non_blocking(file)
        }
        None => tracing_appender::non_blocking(std::io::stderr()),
    };

    let filter = std::env::var(FILTER_VAR).unwrap_or_else(|_| default_filter(config.level));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_target(config.level >= LogLevel::Debug)
        .with_ansi(config.file.is_none())
        .with_writer(writer)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|err| InitError::Configure(err.to_string()))?;
    let _ = GUARD.set(guard);
    Ok(())
}

/// Below debug the level applies everywhere; at debug and trace only this
/// crate's events get louder and dependencies stay at info.
fn default_filter(level: LogLevel) -> String {
    if level < LogLevel::Debug {
        return level.as_str().to_owned();
    }
    let mut filter = String::from("info");
    for target in PUBLISHER_TARGETS {
        filter.push_str(&format!(",{target}={}", level.as_str()));
    }
    filter
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quiet_levels_apply_globally() {
        assert_eq!(default_filter(LogLevel::Info), "info");
        assert_eq!(default_filter(LogLevel::Error), "error");
    }

    #[test]
    fn verbose_levels_only_raise_publisher_targets() {
        let filter = default_filter(LogLevel::Trace);
        assert!(filter.starts_with("info,"));
        assert!(filter.contains("signaling=trace"));
        assert!(filter.contains("negotiation=trace"));
        assert!(!filter.contains("tungstenite"));
        assert!(default_filter(LogLevel::Debug).contains("publisher=debug"));
    }

    #[test]
    fn default_filters_parse() {
        for level in LogLevel::value_variants() {
            EnvFilter::try_new(default_filter(*level)).unwrap();
        }
    }
}
