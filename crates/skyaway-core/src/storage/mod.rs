mod config;
pub mod database;
pub mod migrations;
mod users;

pub use config::{AnnounceConfig, Config, DaemonConfig, DatabaseConfig, EventConfig, LogConfig};
pub use database::{Database, SharedDatabase};

use std::path::PathBuf;

/// Returns `~/.config/skyaway[-dev]/` based on SKYAWAY_ENV.
///
/// Set SKYAWAY_ENV=dev to use development data directory.
///
/// # Errors
/// Returns an error if creating the config directory fails.
pub fn data_dir() -> std::io::Result<PathBuf> {
    let base_dir = dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config");

    let env = std::env::var("SKYAWAY_ENV").unwrap_or_else(|_| "production".to_string());

    let dir = if env == "dev" {
        base_dir.join("skyaway-dev")
    } else {
        base_dir.join("skyaway")
    };

    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}
