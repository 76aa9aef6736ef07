//! Tracing setup.
//!
//! JSON or pretty output with an env-filter default taken from config,
//! plus optional daily-rotated file output. Key material never reaches a
//! log line: the signing layer only handles derived keys, and messages
//! that might embed secrets go through [`scrub_for_log`] first.

use anyhow::Result;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::domain::models::LoggingConfig;
use crate::services::sanitizer::Sanitizer;

/// Initialise the global subscriber. The returned guard must be held for
/// the process lifetime when file output is enabled.
pub fn init(config: &LoggingConfig) -> Result<Option<WorkerGuard>> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.clone()));

    match &config.log_dir {
        Some(dir) => {
            let file_appender = rolling::daily(dir, "cadence.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            let file_layer = tracing_subscriber::fmt::layer()
                .json()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(true);

            if config.format == "pretty" {
                let stdout_layer = tracing_subscriber::fmt::layer().pretty();
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(file_layer)
                    .with(stdout_layer)
                    .init();
            } else {
                let stdout_layer = tracing_subscriber::fmt::layer().json();
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(file_layer)
                    .with(stdout_layer)
                    .init();
            }
            Ok(Some(guard))
        }
        None => {
            if config.format == "pretty" {
                let stdout_layer = tracing_subscriber::fmt::layer().pretty().boxed();
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(stdout_layer)
                    .init();
            } else {
                let stdout_layer = tracing_subscriber::fmt::layer().json().boxed();
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(stdout_layer)
                    .init();
            }
            Ok(None)
        }
    }
}

/// Scrub free-form text (user descriptions, upstream error strings)
/// before it is logged.
pub fn scrub_for_log(message: &str) -> String {
    Sanitizer::new().sanitise(message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scrub_for_log_removes_key_material() {
        let scrubbed = scrub_for_log("failed with key sk-abc123def456 attached");
        assert!(!scrubbed.contains("sk-abc123def456"));
    }
}
