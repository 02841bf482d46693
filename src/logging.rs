//! # Logging Setup
//!
//! Console output plus an optional rolling log file.

use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::LoggingConfig;

/// Build the filter: `RUST_LOG` wins, `logging.level` otherwise
fn env_filter(config: &LoggingConfig) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level))
}

/// Rolling appender for the configured rotation, if a directory is set
fn file_appender(config: &LoggingConfig) -> Option<rolling::RollingFileAppender> {
    if config.dir.is_empty() {
        return None;
    }

    let appender = match config.rotation.as_str() {
        "hourly" => rolling::hourly(&config.dir, &config.file_prefix),
        "never" => rolling::never(&config.dir, &config.file_prefix),
        _ => rolling::daily(&config.dir, &config.file_prefix),
    };
    Some(appender)
}

/// Install the global subscriber
///
/// The returned guard flushes the file writer on drop and must be held
/// for the lifetime of the process.
pub fn init(config: &LoggingConfig) -> Option<WorkerGuard> {
    let registry = tracing_subscriber::registry()
        .with(env_filter(config))
        .with(fmt::layer());

    match file_appender(config) {
        Some(appender) => {
            let (writer, guard) = tracing_appender::non_blocking(appender);
            registry
                .with(fmt::layer().with_ansi(false).with_writer(writer))
                .init();
            Some(guard)
        }
        None => {
            registry.init();
            None
        }
    }
}
