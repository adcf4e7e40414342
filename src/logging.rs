//! File-backed logging for the relay.
//!
//! The relay runs as a background process next to a foreground CLI, so
//! diagnostics must never land on stdout/stderr. Everything goes to one log
//! file per instance under the user's home directory.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};

/// Default log location: `~/.gateway-relay/relay.log`.
pub fn default_log_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".gateway-relay").join("relay.log"))
}

/// Route all tracing output to `path` (or the default location), creating the
/// directory if needed. Returns the resolved path so callers can point users
/// at the logs.
pub fn init_logging(path: Option<PathBuf>, default_level: &str) -> Result<PathBuf> {
    let path = match path {
        Some(path) => path,
        None => default_log_path().context("could not resolve a home directory for relay logs")?,
    };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create log directory {}", parent.display()))?;
    }
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("failed to open log file {}", path.display()))?;

    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_target(true)
        .with_ansi(false)
        .with_writer(Arc::new(file))
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);

    Ok(path)
}
