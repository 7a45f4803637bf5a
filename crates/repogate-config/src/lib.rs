//! Layered configuration for the proxy: a TOML file provides defaults,
//! `REPOGATE_*` environment variables override it, and CLI flags win over
//! both. Mirrors the file → env → CLI precedence used throughout the
//! workspace's config tooling, scoped down to this proxy's own options.

mod cli;

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use url::Url;

pub use cli::Cli;

/// Errors that can occur while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CleanStrategy {
    Lru,
    Lfu,
    Fifo,
}

impl Default for CleanStrategy {
    fn default() -> Self {
        CleanStrategy::Lru
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct ServerConfig {
    pub addr: String,
    pub locale: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: "0.0.0.0:3142".to_string(),
            locale: "en".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct UpstreamConfig {
    pub url: Url,
    #[serde(default)]
    pub proxy: Option<Url>,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct CacheConfig {
    pub dir: PathBuf,
    #[serde(with = "humantime_serde_secs")]
    pub index_duration: std::time::Duration,
    #[serde(with = "humantime_serde_secs")]
    pub pkg_duration: std::time::Duration,
    #[serde(with = "humantime_serde_secs")]
    pub cleanup_interval: std::time::Duration,
    /// Bytes; parsed from strings like `"10GB"` at the edges (CLI/env),
    /// stored as a plain integer here.
    pub max_size: u64,
    pub clean_strategy: CleanStrategy,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("/var/cache/repogate"),
            index_duration: std::time::Duration::from_secs(3600),
            pkg_duration: std::time::Duration::from_secs(30 * 24 * 3600),
            cleanup_interval: std::time::Duration::from_secs(600),
            max_size: 10 * 1024 * 1024 * 1024,
            clean_strategy: CleanStrategy::Lru,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct MemoryCacheConfig {
    pub enabled: bool,
    pub size: u64,
    pub max_items: usize,
    #[serde(with = "humantime_serde_secs")]
    pub ttl: std::time::Duration,
    pub max_file_size: u64,
}

impl Default for MemoryCacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            size: 256 * 1024 * 1024,
            max_items: 4096,
            ttl: std::time::Duration::from_secs(600),
            max_file_size: 8 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct HealthCheckConfig {
    #[serde(with = "humantime_serde_secs")]
    pub interval: std::time::Duration,
    #[serde(with = "humantime_serde_secs")]
    pub timeout: std::time::Duration,
    pub enable_self_healing: bool,
    /// Candidate probe paths, left as configuration rather than
    /// hard-coded Alpine-specific defaults.
    pub probe_paths: Vec<String>,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            interval: std::time::Duration::from_secs(60),
            timeout: std::time::Duration::from_secs(10),
            enable_self_healing: true,
            probe_paths: vec![
                "/".to_string(),
                "/alpine/".to_string(),
                "/debian/".to_string(),
                "/ubuntu/".to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub rate: u32,
    pub burst: u32,
    pub exempt_paths: Vec<String>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            rate: 100,
            burst: 200,
            exempt_paths: vec!["/_health".to_string(), "/metrics".to_string()],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct DataIntegrityConfig {
    #[serde(with = "humantime_serde_secs")]
    pub check_interval: std::time::Duration,
    pub auto_repair: bool,
    pub periodic_check: bool,
    pub initialize_existing_files: bool,
}

impl Default for DataIntegrityConfig {
    fn default() -> Self {
        Self {
            check_interval: std::time::Duration::from_secs(3600),
            auto_repair: true,
            periodic_check: false,
            initialize_existing_files: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct AuthConfig {
    pub admin_user: Option<String>,
    pub admin_password: Option<String>,
    pub proxy_user: Option<String>,
    pub proxy_password: Option<String>,
    pub exempt_cidrs: Vec<String>,
    pub trusted_proxy_cidrs: Vec<String>,
}

/// Root configuration document, as loaded from TOML and merged with
/// environment overrides and CLI flags.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct Config {
    pub server: ServerConfig,
    pub upstreams: Vec<UpstreamConfig>,
    pub cache: CacheConfig,
    pub memory_cache: MemoryCacheConfig,
    pub health_check: HealthCheckConfig,
    pub rate_limit: RateLimitConfig,
    pub data_integrity: DataIntegrityConfig,
    pub auth: AuthConfig,
}

impl Config {
    /// Loads configuration from `path` if it exists, applies `REPOGATE_*`
    /// environment overrides, then applies CLI flags from `cli`. CLI flags
    /// take precedence over environment, which takes precedence over the
    /// file; unset layers leave the built-in default untouched.
    pub fn load(path: Option<&Path>, cli: &Cli) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) if path.exists() => {
                let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })?;
                toml::from_str(&text).map_err(|source| ConfigError::Parse {
                    path: path.to_path_buf(),
                    source,
                })?
            }
            _ => Config::default(),
        };

        config.apply_env();
        cli.apply(&mut config);
        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Ok(addr) = std::env::var("REPOGATE_SERVER_ADDR") {
            self.server.addr = addr;
        }
        if let Ok(dir) = std::env::var("REPOGATE_CACHE_DIR") {
            self.cache.dir = PathBuf::from(dir);
        }
        if let Ok(size) = std::env::var("REPOGATE_CACHE_MAX_SIZE") {
            if let Some(bytes) = parse_size(&size) {
                self.cache.max_size = bytes;
            }
        }
        if let Ok(user) = std::env::var("REPOGATE_ADMIN_USER") {
            self.auth.admin_user = Some(user);
        }
        if let Ok(password) = std::env::var("REPOGATE_ADMIN_PASSWORD") {
            self.auth.admin_password = Some(password);
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.upstreams.is_empty() {
            return Err(ConfigError::Invalid(
                "at least one upstream must be configured".to_string(),
            ));
        }
        if self.memory_cache.max_file_size > self.memory_cache.size && self.memory_cache.enabled {
            return Err(ConfigError::Invalid(
                "memory-cache.max-file-size cannot exceed memory-cache.size".to_string(),
            ));
        }
        Ok(())
    }
}

/// Parses sizes like `"10GB"`, `"512MiB"`, or a bare byte count.
pub fn parse_size(text: &str) -> Option<u64> {
    let text = text.trim();
    if let Ok(bytes) = text.parse::<u64>() {
        return Some(bytes);
    }
    let split_at = text.find(|c: char| !c.is_ascii_digit() && c != '.')?;
    let (number, unit) = text.split_at(split_at);
    let number: f64 = number.parse().ok()?;
    let multiplier: u64 = match unit.trim().to_ascii_uppercase().as_str() {
        "B" => 1,
        "KB" | "K" => 1000,
        "KIB" => 1024,
        "MB" | "M" => 1000 * 1000,
        "MIB" => 1024 * 1024,
        "GB" | "G" => 1000 * 1000 * 1000,
        "GIB" => 1024 * 1024 * 1024,
        "TB" | "T" => 1000 * 1000 * 1000 * 1000,
        "TIB" => 1024 * 1024 * 1024 * 1024,
        _ => return None,
    };
    Some((number * multiplier as f64) as u64)
}

mod humantime_serde_secs {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, s: S) -> Result<S::Ok, S::Error> {
        humantime::format_duration(*duration)
            .to_string()
            .serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let text = String::deserialize(d)?;
        humantime::parse_duration(&text).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults_round_trip_through_toml() {
        let mut config = Config::default();
        config.upstreams.push(UpstreamConfig {
            url: Url::parse("https://dl-cdn.alpinelinux.org").unwrap(),
            proxy: None,
            name: "alpine".to_string(),
        });
        let text = toml::to_string(&config).unwrap();
        let parsed: Config = toml::from_str(&text).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn load_without_file_falls_back_to_defaults_but_requires_upstreams() {
        let cli = Cli::default();
        let err = Config::load(None, &cli).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn parse_size_handles_common_units() {
        assert_eq!(parse_size("10GB"), Some(10_000_000_000));
        assert_eq!(parse_size("1MiB"), Some(1_048_576));
        assert_eq!(parse_size("2048"), Some(2048));
        assert_eq!(parse_size("bogus"), None);
    }

    #[test]
    fn env_override_wins_over_file_default() {
        std::env::set_var("REPOGATE_CACHE_DIR", "/tmp/repogate-test-env-override");
        let mut config = Config::default();
        config.apply_env();
        assert_eq!(
            config.cache.dir,
            PathBuf::from("/tmp/repogate-test-env-override")
        );
        std::env::remove_var("REPOGATE_CACHE_DIR");
    }
}
