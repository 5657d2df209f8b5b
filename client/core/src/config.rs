//! Client Configuration
//!
//! Tunable knobs for the streaming core: watchdog duration, render flush
//! interval, request timeouts, and transient-failure retry policy. Values
//! come from defaults, an optional TOML file under the platform config dir,
//! and `PARLEY_*` environment variables, in that order of precedence.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

// ============================================================================
// Retry Policy
// ============================================================================

/// Retry policy for transient transport failures.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of retries after the initial attempt.
    pub max_retries: u32,
    /// Initial backoff delay in milliseconds.
    pub initial_backoff_ms: u64,
    /// Backoff multiplier per attempt.
    pub backoff_multiplier: f32,
    /// Add up to 25% random jitter to each backoff.
    pub use_jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 1,
            initial_backoff_ms: 400,
            backoff_multiplier: 2.0,
            use_jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Backoff duration before retry attempt N (0-indexed).
    #[must_use]
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let base =
            self.initial_backoff_ms as f64 * f64::from(self.backoff_multiplier).powi(attempt as i32);
        let duration_ms = if self.use_jitter {
            let jitter = rand::random::<f64>() * 0.25;
            (base * (1.0 + jitter)) as u64
        } else {
            base as u64
        };
        Duration::from_millis(duration_ms)
    }
}

// ============================================================================
// Client Configuration
// ============================================================================

/// Configuration for the streaming chat client.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Time allowed from send to first content before fallback kicks in.
    pub watchdog: Duration,
    /// Minimum time between render flushes (one flush per frame).
    pub flush_interval: Duration,
    /// Overall HTTP request timeout.
    pub request_timeout: Duration,
    /// Timeout for the cheap reachability probe.
    pub probe_timeout: Duration,
    /// Retry policy for transient transport failures.
    pub retry: RetryPolicy,
    /// Primary backend base URL, when configured.
    pub backend_url: Option<String>,
    /// Alternate known-good backend base URLs, tried in order when the
    /// primary is unreachable.
    pub backend_fallback_urls: Vec<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            watchdog: Duration::from_secs(12),
            flush_interval: Duration::from_millis(33), // ~30 FPS
            request_timeout: Duration::from_secs(120),
            probe_timeout: Duration::from_secs(5),
            retry: RetryPolicy::default(),
            backend_url: None,
            backend_fallback_urls: Vec::new(),
        }
    }
}

impl ClientConfig {
    /// Create configuration from environment variables, over defaults.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    /// Overlay `PARLEY_*` environment variables onto this configuration.
    pub fn apply_env(&mut self) {
        if let Some(ms) = env_u64("PARLEY_WATCHDOG_MS") {
            self.watchdog = Duration::from_millis(ms);
        }
        if let Some(ms) = env_u64("PARLEY_FLUSH_INTERVAL_MS") {
            self.flush_interval = Duration::from_millis(ms);
        }
        if let Some(secs) = env_u64("PARLEY_REQUEST_TIMEOUT_SECS") {
            self.request_timeout = Duration::from_secs(secs);
        }
        if let Some(retries) = env_u64("PARLEY_MAX_RETRIES") {
            self.retry.max_retries = retries as u32;
        }
        if let Some(ms) = env_u64("PARLEY_RETRY_BACKOFF_MS") {
            self.retry.initial_backoff_ms = ms;
        }
        if let Ok(url) = std::env::var("PARLEY_BACKEND_URL") {
            if !url.trim().is_empty() {
                self.backend_url = Some(url.trim().to_string());
            }
        }
        if let Ok(urls) = std::env::var("PARLEY_BACKEND_FALLBACK_URLS") {
            self.backend_fallback_urls = urls
                .split(',')
                .map(str::trim)
                .filter(|u| !u.is_empty())
                .map(str::to_string)
                .collect();
        }
    }
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

// ============================================================================
// Config File
// ============================================================================

/// Errors loading the configuration file.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The file exists but could not be read.
    #[error("failed to read config file {path}: {source}")]
    Io {
        /// Path that failed.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },
    /// The file is not valid TOML for this schema.
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        /// Path that failed.
        path: PathBuf,
        /// Underlying TOML error.
        #[source]
        source: toml::de::Error,
    },
}

/// On-disk schema. All fields optional; absent fields keep their defaults.
#[derive(Debug, Default, Deserialize)]
struct ClientConfigFile {
    watchdog_ms: Option<u64>,
    flush_interval_ms: Option<u64>,
    request_timeout_secs: Option<u64>,
    retry: Option<RetryPolicy>,
    backend: Option<BackendSection>,
}

#[derive(Debug, Default, Deserialize)]
struct BackendSection {
    url: Option<String>,
    fallback_urls: Option<Vec<String>>,
}

/// Default config file location: `<config dir>/parley/config.toml`.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("parley").join("config.toml"))
}

/// Load configuration from a specific TOML file, over defaults.
pub fn load_config_from_path(path: &Path) -> Result<ClientConfig, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let file: ClientConfigFile = toml::from_str(&raw).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;

    let mut config = ClientConfig::default();
    if let Some(ms) = file.watchdog_ms {
        config.watchdog = Duration::from_millis(ms);
    }
    if let Some(ms) = file.flush_interval_ms {
        config.flush_interval = Duration::from_millis(ms);
    }
    if let Some(secs) = file.request_timeout_secs {
        config.request_timeout = Duration::from_secs(secs);
    }
    if let Some(retry) = file.retry {
        config.retry = retry;
    }
    if let Some(backend) = file.backend {
        config.backend_url = backend.url;
        config.backend_fallback_urls = backend.fallback_urls.unwrap_or_default();
    }
    Ok(config)
}

/// Load configuration: defaults, then the default config file if present,
/// then environment overrides. File errors are logged and skipped rather
/// than fatal.
#[must_use]
pub fn load_config() -> ClientConfig {
    let mut config = match default_config_path() {
        Some(path) if path.exists() => match load_config_from_path(&path) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!(error = %e, "Ignoring unreadable config file");
                ClientConfig::default()
            }
        },
        _ => ClientConfig::default(),
    };
    config.apply_env();
    config
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.watchdog, Duration::from_secs(12));
        assert_eq!(config.flush_interval, Duration::from_millis(33));
        assert_eq!(config.retry.max_retries, 1);
        assert_eq!(config.retry.initial_backoff_ms, 400);
        assert!(config.backend_url.is_none());
    }

    #[test]
    fn test_backoff_growth_without_jitter() {
        let retry = RetryPolicy {
            max_retries: 3,
            initial_backoff_ms: 100,
            backoff_multiplier: 2.0,
            use_jitter: false,
        };
        assert_eq!(retry.backoff_for_attempt(0), Duration::from_millis(100));
        assert_eq!(retry.backoff_for_attempt(1), Duration::from_millis(200));
        assert_eq!(retry.backoff_for_attempt(2), Duration::from_millis(400));
    }

    #[test]
    fn test_backoff_jitter_bounded() {
        let retry = RetryPolicy {
            use_jitter: true,
            ..Default::default()
        };
        for attempt in 0..3 {
            let backoff = retry.backoff_for_attempt(attempt);
            let base = 400u64 * 2u64.pow(attempt);
            assert!(backoff >= Duration::from_millis(base));
            assert!(backoff <= Duration::from_millis(base + base / 4 + 1));
        }
    }

    #[test]
    fn test_load_config_from_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
watchdog_ms = 5000
flush_interval_ms = 16

[retry]
max_retries = 2
initial_backoff_ms = 250
backoff_multiplier = 1.5
use_jitter = false

[backend]
url = "http://127.0.0.1:8000"
fallback_urls = ["http://localhost:8000"]
"#,
        )
        .unwrap();

        let config = load_config_from_path(&path).unwrap();
        assert_eq!(config.watchdog, Duration::from_millis(5000));
        assert_eq!(config.flush_interval, Duration::from_millis(16));
        assert_eq!(config.retry.max_retries, 2);
        assert_eq!(config.backend_url.as_deref(), Some("http://127.0.0.1:8000"));
        assert_eq!(config.backend_fallback_urls.len(), 1);
    }

    #[test]
    fn test_load_config_bad_toml_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "watchdog_ms = [not a number").unwrap();
        assert!(matches!(
            load_config_from_path(&path),
            Err(ConfigError::Parse { .. })
        ));
    }
}
