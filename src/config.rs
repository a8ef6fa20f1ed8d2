//! Configuration file parser for ~/.config/feedharvest/config.toml.
//!
//! The config file is optional: a missing file yields `Config::default()`.
//! Unknown keys are accepted by serde and logged as warnings so typos
//! don't go unnoticed.
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TOML in config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// SEC-014: Config file exceeds maximum allowed size.
    #[error("Config file too large: {0}")]
    TooLarge(String),
}

// ============================================================================
// Configuration Structs
// ============================================================================

/// Top-level configuration.
///
/// Every section uses `#[serde(default)]` so any subset of keys can be given.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// SQLite database path. `None` means `<config dir>/harvest.db`.
    pub database_path: Option<PathBuf>,
    pub http: HttpConfig,
    pub rate_limit: RateLimitConfig,
    pub discovery: DiscoveryConfig,
    pub pipeline: PipelineConfig,
}

/// Outbound HTTP settings shared by feed, sitemap and article fetches.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Per-attempt request timeout in seconds.
    pub timeout_secs: u64,
    /// Additional attempts after a timeout. Other errors are never retried.
    pub max_retries: u32,
    /// Response bodies above this size are rejected.
    pub max_body_bytes: usize,
    pub user_agent: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 15,
            max_retries: 2,
            max_body_bytes: 10 * 1024 * 1024,
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                         (KHTML, like Gecko) Chrome/124.0 Safari/537.36"
                .to_string(),
        }
    }
}

impl HttpConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Minimum gap between two requests to the same origin, in milliseconds.
    pub min_interval_ms: u64,
    /// Number of origins whose last-request time is remembered.
    pub max_origins: usize,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            min_interval_ms: 1000,
            max_origins: 1024,
        }
    }
}

impl RateLimitConfig {
    pub fn min_interval(&self) -> Duration {
        Duration::from_millis(self.min_interval_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Timeout for speculative probes (common paths, robots.txt).
    pub timeout_secs: u64,
    /// Maximum sitemap-index nesting followed before a URL is left unexpanded.
    pub sitemap_max_depth: usize,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 10,
            sitemap_max_depth: 2,
        }
    }
}

impl DiscoveryConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Number of tasks the worker pool runs at once.
    pub concurrency: usize,
    /// Consecutive failed polls after which a feed is deactivated.
    pub circuit_breaker_threshold: i64,
    /// Sitemap URLs longer than this are skipped.
    pub max_url_length: usize,
    /// Stub titles are truncated to this many characters.
    pub max_title_length: usize,
    /// Default retention for `cleanup`.
    pub log_retention_days: i64,
    /// Give sitemap stubs `published_date = now` instead of leaving it unknown.
    pub stamp_sitemap_stubs: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            concurrency: 10,
            circuit_breaker_threshold: 5,
            max_url_length: 2048,
            max_title_length: 500,
            log_retention_days: 30,
            stamp_sitemap_stubs: false,
        }
    }
}

impl Config {
    /// SEC-014: Maximum config file size (1 MB).
    const MAX_FILE_SIZE: u64 = 1_048_576;

    /// Load configuration from a TOML file.
    ///
    /// - Missing file → `Ok(Config::default())`
    /// - Empty file → `Ok(Config::default())`
    /// - Invalid TOML → `Err(ConfigError::Parse)` with line number info
    /// - Unknown keys → accepted, logged as warning
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::metadata(path) {
            Ok(meta) if meta.len() > Self::MAX_FILE_SIZE => {
                return Err(ConfigError::TooLarge(format!(
                    "Config file is {} bytes (max {} bytes)",
                    meta.len(),
                    Self::MAX_FILE_SIZE
                )));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No config file found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
            Ok(_) => {}
        }

        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // Deleted between metadata and read
                tracing::debug!(path = %path.display(), "Config file disappeared, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
        };

        if content.trim().is_empty() {
            tracing::debug!(path = %path.display(), "Config file is empty, using defaults");
            return Ok(Self::default());
        }

        if let Ok(raw) = content.parse::<toml::Table>() {
            warn_unknown_keys(&raw);
        }

        let config: Config = toml::from_str(&content)?;
        tracing::info!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    /// Resolves the database path: explicit setting, else `<config_dir>/harvest.db`.
    pub fn database_path_in(&self, config_dir: &Path) -> PathBuf {
        self.database_path
            .clone()
            .unwrap_or_else(|| config_dir.join("harvest.db"))
    }
}

fn warn_unknown_keys(raw: &toml::Table) {
    const SECTIONS: [(&str, &[&str]); 4] = [
        (
            "http",
            &["timeout_secs", "max_retries", "max_body_bytes", "user_agent"],
        ),
        ("rate_limit", &["min_interval_ms", "max_origins"]),
        ("discovery", &["timeout_secs", "sitemap_max_depth"]),
        (
            "pipeline",
            &[
                "concurrency",
                "circuit_breaker_threshold",
                "max_url_length",
                "max_title_length",
                "log_retention_days",
                "stamp_sitemap_stubs",
            ],
        ),
    ];

    for (key, value) in raw {
        if key == "database_path" {
            continue;
        }
        match SECTIONS.iter().find(|(name, _)| name == key) {
            Some((section, known)) => {
                if let Some(table) = value.as_table() {
                    for inner in table.keys() {
                        if !known.contains(&inner.as_str()) {
                            tracing::warn!(section = %section, key = %inner, "Unknown key in config file, ignoring");
                        }
                    }
                }
            }
            None => tracing::warn!(key = %key, "Unknown key in config file, ignoring"),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn write_config(name: &str, content: &str) -> (PathBuf, PathBuf) {
        let dir = std::env::temp_dir().join(format!("feedharvest_config_test_{}", name));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.toml");
        std::fs::write(&path, content).unwrap();
        (dir, path)
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.database_path.is_none());
        assert_eq!(config.http.timeout_secs, 15);
        assert_eq!(config.http.max_retries, 2);
        assert_eq!(config.rate_limit.min_interval_ms, 1000);
        assert_eq!(config.discovery.sitemap_max_depth, 2);
        assert_eq!(config.pipeline.circuit_breaker_threshold, 5);
        assert_eq!(config.pipeline.max_url_length, 2048);
        assert!(!config.pipeline.stamp_sitemap_stubs);
    }

    #[test]
    fn test_missing_file_returns_default() {
        let path = Path::new("/tmp/feedharvest_test_nonexistent_config.toml");
        let config = Config::load(path).unwrap();
        assert_eq!(config.http.max_retries, 2);
    }

    #[test]
    fn test_whitespace_only_file_returns_default() {
        let (dir, path) = write_config("whitespace", "   \n  \n");
        let config = Config::load(&path).unwrap();
        assert_eq!(config.pipeline.concurrency, 10);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_partial_section_keeps_other_defaults() {
        let (dir, path) = write_config("partial", "[http]\ntimeout_secs = 5\n");
        let config = Config::load(&path).unwrap();
        assert_eq!(config.http.timeout_secs, 5);
        assert_eq!(config.http.max_retries, 2);
        assert_eq!(config.rate_limit.min_interval_ms, 1000);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_full_config() {
        let content = r#"
database_path = "/var/lib/feedharvest/db.sqlite"

[http]
timeout_secs = 20
max_retries = 4
user_agent = "TestAgent/1.0"

[rate_limit]
min_interval_ms = 250

[discovery]
sitemap_max_depth = 3

[pipeline]
concurrency = 4
stamp_sitemap_stubs = true
"#;
        let (dir, path) = write_config("full", content);
        let config = Config::load(&path).unwrap();
        assert_eq!(
            config.database_path.as_deref(),
            Some(Path::new("/var/lib/feedharvest/db.sqlite"))
        );
        assert_eq!(config.http.timeout_secs, 20);
        assert_eq!(config.http.max_retries, 4);
        assert_eq!(config.http.user_agent, "TestAgent/1.0");
        assert_eq!(config.rate_limit.min_interval(), Duration::from_millis(250));
        assert_eq!(config.discovery.sitemap_max_depth, 3);
        assert_eq!(config.pipeline.concurrency, 4);
        assert!(config.pipeline.stamp_sitemap_stubs);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_invalid_toml_returns_error() {
        let (dir, path) = write_config("invalid", "this is not [valid toml");
        let err = Config::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
        assert!(err.to_string().contains("Invalid TOML"));
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_unknown_keys_accepted() {
        let (dir, path) = write_config(
            "unknown",
            "totally_fake = 1\n[http]\nmystery = true\ntimeout_secs = 3\n",
        );
        let config = Config::load(&path).unwrap();
        assert_eq!(config.http.timeout_secs, 3);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_wrong_type_returns_error() {
        let (dir, path) = write_config("wrongtype", "[http]\ntimeout_secs = \"soon\"\n");
        assert!(Config::load(&path).is_err());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_too_large_file_rejected() {
        let (dir, path) = write_config("too_large", &"a".repeat(1_048_577));
        let err = Config::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::TooLarge(_)));
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_database_path_defaults_into_config_dir() {
        let config = Config::default();
        assert_eq!(
            config.database_path_in(Path::new("/home/u/.config/feedharvest")),
            PathBuf::from("/home/u/.config/feedharvest/harvest.db")
        );
    }
}
