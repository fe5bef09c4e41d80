//! Configuration for pingtrail.
//!
//! Loads configuration from environment variables with sensible defaults.

use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// HTTP port for the web server (default: 8080)
    pub http_port: u16,
    /// Path to the SQLite database file (default: "pingtrail.db")
    pub db_path: String,
    /// Directory for spreadsheet exports (default: "exports")
    pub export_dir: String,
    /// Admission ceiling for concurrently running jobs (default: 5)
    pub max_concurrent_jobs: usize,
    /// Window applied by the periodic cleanup (default: 30 days)
    pub retention_days: u32,
    /// Window applied once at startup (default: 30 days)
    pub startup_retention_days: u32,
    pub cleanup_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_port: 8080,
            db_path: "pingtrail.db".to_string(),
            export_dir: "exports".to_string(),
            max_concurrent_jobs: 5,
            retention_days: 30,
            startup_retention_days: 30,
            cleanup_interval: Duration::from_secs(3600),
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `PINGTRAIL_HTTP_PORT`
    /// - `PINGTRAIL_DB_PATH`
    /// - `PINGTRAIL_EXPORT_DIR`
    /// - `PINGTRAIL_MAX_CONCURRENT_JOBS`
    /// - `PINGTRAIL_RETENTION_DAYS`
    /// - `PINGTRAIL_STARTUP_RETENTION_DAYS`
    /// - `PINGTRAIL_CLEANUP_INTERVAL_SECS`
    ///
    /// Values that fail to parse keep their defaults.
    pub fn load() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut cfg = Self::default();

        override_parsed(&lookup, "PINGTRAIL_HTTP_PORT", &mut cfg.http_port);
        if let Some(db_path) = lookup("PINGTRAIL_DB_PATH") {
            cfg.db_path = db_path;
        }
        if let Some(export_dir) = lookup("PINGTRAIL_EXPORT_DIR") {
            cfg.export_dir = export_dir;
        }
        override_parsed(&lookup, "PINGTRAIL_MAX_CONCURRENT_JOBS", &mut cfg.max_concurrent_jobs);
        override_parsed(&lookup, "PINGTRAIL_RETENTION_DAYS", &mut cfg.retention_days);
        override_parsed(&lookup, "PINGTRAIL_STARTUP_RETENTION_DAYS", &mut cfg.startup_retention_days);

        let mut interval_secs = cfg.cleanup_interval.as_secs();
        override_parsed(&lookup, "PINGTRAIL_CLEANUP_INTERVAL_SECS", &mut interval_secs);
        if interval_secs > 0 {
            cfg.cleanup_interval = Duration::from_secs(interval_secs);
        }

        cfg
    }
}

fn override_parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut T) {
    if let Some(raw) = lookup(key) {
        match raw.trim().parse() {
            Ok(v) => *slot = v,
            Err(_) => tracing::warn!("Ignoring unparseable {}={:?}", key, raw),
        }
    }
}
