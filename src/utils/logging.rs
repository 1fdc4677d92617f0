//! Structured logging setup
//!
//! Installs a global `tracing` subscriber built from [`LoggingConfig`].
//! `RUST_LOG`, when set, overrides the configured level.

use std::fs::OpenOptions;
use std::sync::Mutex;

use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

use crate::config::LoggingConfig;
use crate::error::{ProtocolError, Result};

/// Install the global subscriber. Fails if one is already installed.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let errors = config.validate();
    if !errors.is_empty() {
        return Err(ProtocolError::ConfigError(errors.join("; ")));
    }

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::default().add_directive(LevelFilter::from_level(config.log_level).into())
    });

    let console = config.log_to_console.then(|| {
        if config.json_format {
            fmt::layer().json().with_current_span(true).boxed()
        } else {
            fmt::layer().compact().with_target(true).boxed()
        }
    });

    let file = match (config.log_to_file, config.log_file_path.as_deref()) {
        (true, Some(path)) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            let writer = Mutex::new(file);
            Some(if config.json_format {
                fmt::layer().json().with_writer(writer).boxed()
            } else {
                fmt::layer().with_ansi(false).with_writer(writer).boxed()
            })
        }
        _ => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(file)
        .try_init()
        .map_err(|e| ProtocolError::Custom(format!("Failed to install subscriber: {e}")))?;

    tracing::info!(app = %config.app_name, level = %config.log_level, "logging initialised");
    Ok(())
}
