use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Mutex;

use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use crate::backup::{BackupError, Result};

/// Send log events to the console and append them to `log_file`
///
/// The level comes from `RUST_LOG` and defaults to `info`.
pub fn init_logging(log_file: &Path) -> Result<()> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_file)
        .map_err(|e| {
            BackupError::Config(format!("Failed to open log file {}: {}", log_file.display(), e))
        })?;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .with(
            fmt::layer()
                .with_target(false)
                .with_ansi(false)
                .with_writer(Mutex::new(file)),
        )
        .try_init()
        .map_err(|e| BackupError::Config(format!("Failed to initialize logging: {}", e)))?;

    info!("Logging to console and {}", log_file.display());
    Ok(())
}
