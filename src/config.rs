//! Configuration management
//!
//! Provides the full configuration surface with TOML file support,
//! environment variable overrides and sensible defaults. Defaults are
//! tuned for Redis with `hash-max-ziplist-entries 1024` so bucketized
//! counters stay in the compact hash encoding.

use crate::types::Context;
use serde::{Deserialize, Serialize};

/// Seconds in one minute
pub const MINUTE: u64 = 60;
/// Seconds in one hour
pub const HOUR: u64 = 3_600;
/// Seconds in one day
pub const DAY: u64 = 86_400;
/// Seconds in one week
pub const WEEK: u64 = 604_800;
/// Seconds in one average Gregorian month
pub const MONTH: u64 = 2_629_746;
/// Seconds in one average Gregorian year
pub const YEAR: u64 = 31_556_952;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Redis server URL (e.g. "redis://127.0.0.1:6379")
    #[serde(default = "default_url")]
    pub url: String,

    /// Maximum number of concurrently borrowed connections
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,

    /// Seconds a borrow may block when the pool is exhausted
    #[serde(default = "default_pool_timeout")]
    pub pool_timeout: u64,

    /// Key namespace prefix; short names save memory
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Swallow store errors and return conservative empty results
    #[serde(default)]
    pub silent: bool,

    /// Key segment separator, a single character
    #[serde(default = "default_separator")]
    pub separator: String,

    /// Bucketize counter object ids into shared hashes
    #[serde(default = "default_true")]
    pub bucket: bool,

    /// Ids per bucket; 1000 performs best with default ziplist limits
    #[serde(default = "default_bucket_size")]
    pub bucket_size: u64,

    /// Warn when query nodes are dropped with undisposed temporary keys
    #[serde(default = "default_true")]
    pub auto_clean: bool,

    /// Numeric encoding toggles
    #[serde(default)]
    pub encode: EncodeConfig,

    /// Ordered granularity table, finest first; ordering is load-bearing
    /// for span resolution
    #[serde(default = "default_granularities")]
    pub granularities: Vec<GranularityConfig>,

    /// Counter key TTL per granularity, in seconds
    #[serde(default = "default_counter_expirations")]
    pub counter_expirations: Vec<ExpirationConfig>,

    /// Tracker key TTL per granularity, in seconds
    #[serde(default = "default_tracker_expirations")]
    pub tracker_expirations: Vec<ExpirationConfig>,

    /// Default counter granularity span, inclusive catalog positions
    #[serde(default = "default_span")]
    pub counter_granularity: (String, String),

    /// Default tracker granularity span, inclusive catalog positions
    #[serde(default = "default_span")]
    pub tracker_granularity: (String, String),

    /// TTL for temporary operation-result keys, in seconds
    #[serde(default = "default_operation_expiration")]
    pub operation_expiration: u64,
}

/// Toggles for the numeric pair encoding
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EncodeConfig {
    /// Encode purely numeric event name segments
    #[serde(default = "default_true")]
    pub events: bool,

    /// Encode object ids and bucket offsets
    #[serde(default = "default_true")]
    pub ids: bool,
}

impl Default for EncodeConfig {
    fn default() -> Self {
        Self { events: true, ids: true }
    }
}

/// One named time granularity
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GranularityConfig {
    /// Granularity name (e.g. "daily")
    pub name: String,

    /// Bucket step in seconds
    pub step: u64,

    /// strftime pattern for the key time label
    pub pattern: String,
}

/// TTL for one granularity's keys
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExpirationConfig {
    /// Granularity name
    pub name: String,

    /// TTL in seconds
    pub ttl: u64,
}

// Default value functions
fn default_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}
fn default_pool_size() -> u32 {
    5
}
fn default_pool_timeout() -> u64 {
    5
}
fn default_namespace() -> String {
    "rl".to_string()
}
fn default_separator() -> String {
    ":".to_string()
}
fn default_bucket_size() -> u64 {
    1000
}
fn default_operation_expiration() -> u64 {
    DAY
}
fn default_span() -> (String, String) {
    ("daily".to_string(), "yearly".to_string())
}
fn default_true() -> bool {
    true
}

fn default_granularities() -> Vec<GranularityConfig> {
    [
        ("minutely", MINUTE, "%Y%m%d%H%M"),
        ("hourly", HOUR, "%Y%m%d%H"),
        ("daily", DAY, "%Y%m%d"),
        ("weekly", WEEK, "%GW%V"),
        ("monthly", MONTH, "%Y%m"),
        ("yearly", YEAR, "%Y"),
    ]
    .into_iter()
    .map(|(name, step, pattern)| GranularityConfig {
        name: name.to_string(),
        step,
        pattern: pattern.to_string(),
    })
    .collect()
}

fn default_expirations() -> Vec<ExpirationConfig> {
    [
        ("minutely", DAY),
        ("hourly", WEEK),
        ("daily", 3 * MONTH),
        ("weekly", YEAR),
        ("monthly", YEAR),
        ("yearly", YEAR),
    ]
    .into_iter()
    .map(|(name, ttl)| ExpirationConfig { name: name.to_string(), ttl })
    .collect()
}

fn default_counter_expirations() -> Vec<ExpirationConfig> {
    default_expirations()
}

fn default_tracker_expirations() -> Vec<ExpirationConfig> {
    default_expirations()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            url: default_url(),
            pool_size: default_pool_size(),
            pool_timeout: default_pool_timeout(),
            namespace: default_namespace(),
            silent: false,
            separator: default_separator(),
            bucket: true,
            bucket_size: default_bucket_size(),
            auto_clean: true,
            encode: EncodeConfig::default(),
            granularities: default_granularities(),
            counter_expirations: default_counter_expirations(),
            tracker_expirations: default_tracker_expirations(),
            counter_granularity: default_span(),
            tracker_granularity: default_span(),
            operation_expiration: default_operation_expiration(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &str) -> Result<Self, String> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read config file {}: {}", path, e))?;

        toml::from_str(&contents)
            .map_err(|e| format!("Failed to parse config file {}: {}", path, e))
    }

    /// Load configuration from a TOML file with environment overrides
    pub fn from_file_with_env(path: &str) -> Result<Self, String> {
        let mut config = Self::from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load from environment variables only
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    /// Apply environment variable overrides
    pub fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("REDISTAT_URL") {
            self.url = url;
        }
        if let Ok(namespace) = std::env::var("REDISTAT_NAMESPACE") {
            self.namespace = namespace;
        }
        if let Ok(size) = std::env::var("REDISTAT_POOL_SIZE") {
            if let Ok(s) = size.parse() {
                self.pool_size = s;
            }
        }
        if let Ok(silent) = std::env::var("REDISTAT_SILENT") {
            self.silent = silent == "1" || silent.eq_ignore_ascii_case("true");
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.url.is_empty() {
            return Err("Redis URL cannot be empty".to_string());
        }
        if self.pool_size == 0 {
            return Err("Pool size must be greater than 0".to_string());
        }
        if self.separator.chars().count() != 1 {
            return Err("Separator must be exactly one character".to_string());
        }
        if self.bucket_size == 0 {
            return Err("Bucket size must be greater than 0".to_string());
        }
        if self.granularities.is_empty() {
            return Err("At least one granularity must be configured".to_string());
        }
        for g in &self.granularities {
            if g.step == 0 {
                return Err(format!("Granularity '{}' has step 0", g.name));
            }
            if g.pattern.is_empty() {
                return Err(format!("Granularity '{}' has an empty pattern", g.name));
            }
        }
        Ok(())
    }

    /// The separator as a char
    pub fn separator_char(&self) -> char {
        // validate() guarantees exactly one char; ':' covers the
        // unvalidated-default path
        self.separator.chars().next().unwrap_or(':')
    }

    /// Look up a granularity by name
    pub fn granularity(&self, name: &str) -> Option<&GranularityConfig> {
        self.granularities.iter().find(|g| g.name == name)
    }

    /// Ordered granularity names, finest first
    pub fn granularity_names(&self) -> Vec<&str> {
        self.granularities.iter().map(|g| g.name.as_str()).collect()
    }

    /// Configured key TTL for a context and granularity, in seconds.
    ///
    /// Falls back to the operation TTL when a granularity has no entry.
    pub fn expiration(&self, context: Context, granularity: &str) -> u64 {
        let table = match context {
            Context::Counter => &self.counter_expirations,
            Context::Tracker => &self.tracker_expirations,
            Context::Operation => return self.operation_expiration,
        };
        table
            .iter()
            .find(|e| e.name == granularity)
            .map(|e| e.ttl)
            .unwrap_or(self.operation_expiration)
    }

    /// Default granularity span for a context
    pub fn default_span(&self, context: Context) -> &(String, String) {
        match context {
            Context::Tracker => &self.tracker_granularity,
            _ => &self.counter_granularity,
        }
    }

    /// Pool borrow timeout as a Duration
    pub fn pool_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.pool_timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.pool_size, 5);
        assert_eq!(config.namespace, "rl");
        assert_eq!(config.separator, ":");
        assert!(config.bucket);
        assert_eq!(config.bucket_size, 1000);
        assert_eq!(config.granularities.len(), 6);
        assert_eq!(config.granularities[0].name, "minutely");
        assert_eq!(config.granularities[5].name, "yearly");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_expiration_lookup() {
        let config = Config::default();
        assert_eq!(config.expiration(Context::Counter, "minutely"), DAY);
        assert_eq!(config.expiration(Context::Counter, "daily"), 3 * MONTH);
        assert_eq!(config.expiration(Context::Tracker, "yearly"), YEAR);
        assert_eq!(config.expiration(Context::Operation, "daily"), DAY);
        // Unknown granularity falls back to the operation TTL
        assert_eq!(config.expiration(Context::Counter, "nope"), DAY);
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();
        config.separator = "::".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.pool_size = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.granularities.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_env_override() {
        std::env::set_var("REDISTAT_NAMESPACE", "stats");
        let config = Config::from_env();
        assert_eq!(config.namespace, "stats");
        std::env::remove_var("REDISTAT_NAMESPACE");
    }

    #[test]
    fn test_toml_roundtrip() {
        let config = Config::default();
        let toml = toml::to_string(&config).unwrap();
        let parsed: Config = toml::from_str(&toml).unwrap();
        assert_eq!(parsed.namespace, config.namespace);
        assert_eq!(parsed.granularities.len(), config.granularities.len());
    }
}
