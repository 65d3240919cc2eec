//! Logging setup
//!
//! The library itself only emits `tracing` events. Applications (and the
//! integration tests) install a subscriber with [`init_logging`]: an
//! `EnvFilter` honoring `RUST_LOG`, a stderr layer, and optionally a daily
//! rolling file through `tracing-appender`.

use crate::config::LoggingConfig;
use crate::error::{AdaptioError, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the global subscriber described by `config`.
///
/// Returns the file writer's guard when a log directory is configured; keep
/// it alive for as long as events should reach the file. Installing twice is
/// not an error: the second call leaves the first subscriber in place.
pub fn init_logging(config: &LoggingConfig) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.filter))
        .map_err(|e| AdaptioError::Config(format!("Invalid log filter '{}': {}", config.filter, e)))?;

    let (file_layer, guard) = match &config.directory {
        Some(directory) => {
            std::fs::create_dir_all(directory).map_err(|e| {
                AdaptioError::Config(format!("Failed to create log directory {:?}: {}", directory, e))
            })?;
            let appender = tracing_appender::rolling::daily(directory, &config.file_prefix);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().with_ansi(false).with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_target(true)
                .with_ansi(config.ansi)
                .with_writer(std::io::stderr),
        )
        .with(file_layer)
        .try_init();

    match installed {
        Ok(()) => tracing::debug!("Logging initialized with filter '{}'", config.filter),
        Err(e) => tracing::trace!("Subscriber already installed: {}", e),
    }
    Ok(guard)
}

/// Quiet subscriber for tests: warnings only unless `RUST_LOG` says otherwise
pub fn init_test_logging() {
    let config = LoggingConfig {
        filter: "warn".to_string(),
        ansi: false,
        ..LoggingConfig::default()
    };
    let _ = init_logging(&config);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repeated_init_is_harmless() {
        init_test_logging();
        init_test_logging();
        tracing::info!("still logging");
    }

    #[test]
    fn test_invalid_filter_is_config_error() {
        if std::env::var_os("RUST_LOG").is_some() {
            return;
        }
        let config = LoggingConfig {
            filter: "adaptio=notalevel".to_string(),
            ..LoggingConfig::default()
        };
        assert!(matches!(init_logging(&config), Err(AdaptioError::Config(_))));
    }

    #[test]
    fn test_file_output_returns_guard() {
        let dir = tempfile::tempdir().unwrap();
        let config = LoggingConfig {
            directory: Some(dir.path().join("logs")),
            ..LoggingConfig::default()
        };
        let guard = init_logging(&config).unwrap();
        assert!(guard.is_some());
        assert!(dir.path().join("logs").is_dir());
    }
}
