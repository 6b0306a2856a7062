//! Environment-backed settings, read once at startup. `.env` files are
//! honored when present.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Settings {
    /// Path of the sqlite database file.
    pub database_url: String,
    /// Directory for file uploads; unset means data-URL inlining.
    pub upload_dir: Option<String>,
    pub poll_interval: Duration,
    pub heartbeat_interval: Duration,
}

impl Settings {
    pub fn from_env() -> Settings {
        Settings {
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "peermesh.db".to_string()),
            upload_dir: std::env::var("UPLOAD_DIR").ok(),
            poll_interval: interval_from_env("POLL_INTERVAL_MS", 1000),
            heartbeat_interval: interval_from_env("HEARTBEAT_INTERVAL_MS", 1000),
        }
    }
}

fn interval_from_env(key: &str, default_ms: u64) -> Duration {
    let ms = std::env::var(key)
        .ok()
        .and_then(|raw| raw.parse::<u64>().ok())
        .filter(|ms| *ms > 0)
        .unwrap_or(default_ms);
    Duration::from_millis(ms)
}
