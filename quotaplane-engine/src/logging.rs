//! Logging setup
//! Console output plus an optional rolling JSON log file

use crate::config::{LogRotation, LoggingConfig};
use std::io;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::{non_blocking, rolling};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const LOG_FILE_NAME: &str = "quotaplane.log";

#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("Invalid log filter '{0}': {1}")]
    Filter(String, String),

    #[error("Logging already initialized: {0}")]
    Init(String),
}

/// Initialize the global subscriber
///
/// `RUST_LOG` wins over the configured level. The returned guard must be held
/// for as long as file logging should keep flushing.
pub fn init(config: &LoggingConfig) -> Result<Option<WorkerGuard>, LoggingError> {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.level)
            .map_err(|e| LoggingError::Filter(config.level.clone(), e.to_string()))?,
    };

    let console_layer = if config.json_format {
        fmt::layer()
            .json()
            .with_target(true)
            .with_writer(io::stdout)
            .boxed()
    } else {
        fmt::layer()
            .with_target(true)
            .with_level(true)
            .with_thread_ids(false)
            .with_ansi(true)
            .with_writer(io::stdout)
            .boxed()
    };

    let mut layers = vec![console_layer];
    let mut guard = None;

    if config.file_logging_enabled {
        let file_appender = match config.rotation {
            LogRotation::Hourly => rolling::hourly(&config.log_dir, LOG_FILE_NAME),
            LogRotation::Daily => rolling::daily(&config.log_dir, LOG_FILE_NAME),
            LogRotation::Never => rolling::never(&config.log_dir, LOG_FILE_NAME),
        };
        let (writer, worker_guard) = non_blocking(file_appender);

        layers.push(
            fmt::layer()
                .with_target(true)
                .with_level(true)
                .with_thread_ids(true)
                .with_ansi(false)
                .json()
                .with_writer(writer)
                .boxed(),
        );
        guard = Some(worker_guard);
    }

    tracing_subscriber::registry()
        .with(env_filter)
        .with(layers)
        .try_init()
        .map_err(|e| LoggingError::Init(e.to_string()))?;

    tracing::info!(
        level = %config.level,
        file_logging = config.file_logging_enabled,
        "Logging initialized"
    );

    Ok(guard)
}

/// Log an admission event for a reservation
#[macro_export]
macro_rules! log_reservation {
    ($event:expr, $reservation:expr) => {
        tracing::info!(
            event = $event,
            reservation_id = %$reservation.id,
            quota = %$reservation.quota,
            scope = %$reservation.scope,
            "Reservation"
        )
    };
}

/// Log performance metric
#[macro_export]
macro_rules! log_performance {
    ($operation:expr, $duration:expr) => {
        tracing::debug!(
            operation = $operation,
            duration_us = $duration.as_micros() as u64,
            "Performance metric"
        )
    };
}
