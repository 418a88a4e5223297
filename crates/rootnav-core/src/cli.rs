//! Shared CLI helpers for workspace tools.

use std::fs::{self, File};
use std::path::Path;
use std::sync::Mutex;

use serde::de::DeserializeOwned;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::{Error, Result};

/// Installs console logging and, when `log_file` is given, a plain-text copy
/// of every event in that file.
pub fn setup_cli_logging(verbose: bool, log_file: Option<&Path>) -> Result<()> {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    let file_layer = match log_file {
        Some(path) => {
            let file = File::create(path).map_err(|e| {
                Error::Config(format!("Failed to create log file {}: {e}", path.display()))
            })?;
            Some(
                fmt::layer()
                    .with_ansi(false)
                    .with_target(false)
                    .with_writer(Mutex::new(file)),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(file_layer)
        .with(filter)
        .try_init()
        .map_err(|e| Error::Config(format!("Failed to initialize logger: {e}")))?;

    Ok(())
}

pub fn load_toml_config<T>(path: &Path) -> Result<T>
where
    T: DeserializeOwned,
{
    let content = fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("Failed to read config {}: {e}", path.display())))?;

    toml::from_str(&content)
        .map_err(|e| Error::Config(format!("Failed to parse config {}: {e}", path.display())))
}
