//! Configuration Module
//!
//! Handles loading client configuration from environment variables.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Client configuration parameters.
///
/// All values can be configured via environment variables with sensible defaults.
#[derive(Debug, Clone)]
pub struct Config {
    /// Base URL every request path is resolved against (no trailing slash)
    pub api_base_url: String,
    /// Directory holding the persisted credential slots
    pub token_dir: PathBuf,
    /// Default time in milliseconds before a fetched entry becomes stale
    pub stale_time_ms: u64,
    /// Time in milliseconds an unobserved entry may sit idle before collection
    pub gc_time_ms: u64,
    /// Background garbage collection interval in seconds
    pub gc_interval: u64,
    /// Transport timeout in seconds
    pub request_timeout: u64,
}

impl Config {
    /// Creates a new Config by loading values from environment variables.
    ///
    /// # Environment Variables
    /// - `API_BASE_URL` - Backend base URL (default: http://127.0.0.1:8000/api)
    /// - `TOKEN_DIR` - Credential slot directory (default: platform data dir)
    /// - `STALE_TIME_MS` - Default stale time (default: 0)
    /// - `GC_TIME_MS` - Idle time before collection (default: 300000)
    /// - `GC_INTERVAL` - Collection frequency in seconds (default: 60)
    /// - `REQUEST_TIMEOUT` - Transport timeout in seconds (default: 30)
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            api_base_url: env::var("API_BASE_URL")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(|v| normalize_base_url(&v))
                .unwrap_or(defaults.api_base_url),
            token_dir: env::var("TOKEN_DIR")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from)
                .unwrap_or(defaults.token_dir),
            stale_time_ms: env::var("STALE_TIME_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.stale_time_ms),
            gc_time_ms: env::var("GC_TIME_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.gc_time_ms),
            gc_interval: env::var("GC_INTERVAL")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.gc_interval),
            request_timeout: env::var("REQUEST_TIMEOUT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.request_timeout),
        }
    }

    /// Config pointing at `base_url`, everything else default.
    pub fn with_base_url(base_url: &str) -> Self {
        Self {
            api_base_url: normalize_base_url(base_url),
            ..Self::default()
        }
    }

    pub fn stale_time(&self) -> Duration {
        Duration::from_millis(self.stale_time_ms)
    }

    pub fn gc_time(&self) -> Duration {
        Duration::from_millis(self.gc_time_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_base_url: "http://127.0.0.1:8000/api".to_string(),
            token_dir: default_token_dir(),
            stale_time_ms: 0,
            gc_time_ms: 300_000,
            gc_interval: 60,
            request_timeout: 30,
        }
    }
}

fn normalize_base_url(url: &str) -> String {
    url.trim().trim_end_matches('/').to_string()
}

fn default_token_dir() -> PathBuf {
    dirs::data_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(env::temp_dir)
        .join("campus-sync")
}
