//! Configuration for the remote filesystem and its HTTP cache.
//!
//! Both types are plain values built by the caller and handed to the owning
//! handle at open time; nothing here is global. They load from TOML or from
//! the string environment map a filesystem is opened with.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use url::Url;

use crate::error::{Error, Result};

// ============================================================================
// Cache Modes
// ============================================================================

/// Where cache entries live.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, Display, EnumString,
)]
#[strum(ascii_case_insensitive)]
pub enum CacheMode {
    /// No caching at all.
    #[serde(rename = "none")]
    #[strum(to_string = "none")]
    None,
    #[default]
    #[serde(rename = "memory-only", alias = "memory")]
    #[strum(to_string = "memory-only", serialize = "memory")]
    MemoryOnly,
    /// In memory, persisted to a locked disk location on close.
    #[serde(rename = "memory+disk", alias = "disk")]
    #[strum(to_string = "memory+disk", serialize = "disk")]
    MemoryAndDisk,
}

/// When a cached entry may be trusted without asking the server.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, Display, EnumString,
)]
#[strum(ascii_case_insensitive)]
pub enum FallbackPolicy {
    /// Bypass the cache entirely.
    #[serde(rename = "never")]
    #[strum(to_string = "never")]
    Never,
    /// Always revalidate; serve the cache only when the server is unreachable.
    #[default]
    #[serde(rename = "offline")]
    #[strum(to_string = "offline")]
    Offline,
    /// Serve any cached entry without revalidating. A miss that cannot reach
    /// the server is reported as offline.
    #[serde(rename = "always")]
    #[strum(to_string = "always")]
    Always,
    /// Serve any cached entry without revalidating; on a miss use the
    /// network as if there were no cache.
    #[serde(rename = "when-possible", alias = "when_possible")]
    #[strum(to_string = "when-possible", serialize = "when_possible")]
    WhenPossible,
}

// ============================================================================
// Cache Config
// ============================================================================

pub const DEFAULT_REGION: &str = "default";

fn default_region() -> String {
    DEFAULT_REGION.to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub mode: CacheMode,
    pub fallback: FallbackPolicy,
    /// Disk location; `None` uses [`CacheConfig::default_location`].
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<PathBuf>,
    /// Use a sibling location when the primary one is locked by another
    /// instance instead of failing.
    pub allow_alternate_location: bool,
    /// Log hits, misses and revalidations at info level.
    pub verbose: bool,
    /// Namespace inside the cache.
    #[serde(default = "default_region")]
    pub region: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            mode: CacheMode::default(),
            fallback: FallbackPolicy::default(),
            location: None,
            allow_alternate_location: false,
            verbose: false,
            region: default_region(),
        }
    }
}

impl CacheConfig {
    /// `<user cache dir>/strata/http-cache`.
    pub fn default_location() -> Option<PathBuf> {
        dirs::cache_dir().map(|d| d.join("strata").join("http-cache"))
    }

    /// Configured disk location, or the default one.
    pub fn disk_location(&self) -> Option<PathBuf> {
        self.location.clone().or_else(Self::default_location)
    }

    /// Whether lookups and stores do anything.
    pub fn is_enabled(&self) -> bool {
        self.mode != CacheMode::None && self.fallback != FallbackPolicy::Never
    }
}

// ============================================================================
// Filesystem Config
// ============================================================================

fn default_host() -> String {
    "localhost".to_string()
}

/// Everything needed to open a remote filesystem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FsConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    /// URL prefix the endpoints live under, e.g. `files/api`.
    pub root: String,
    pub tls: bool,
    pub cache: CacheConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connect_timeout_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub read_timeout_ms: Option<u64>,
}

impl Default for FsConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: None,
            root: String::new(),
            tls: false,
            cache: CacheConfig::default(),
            connect_timeout_ms: None,
            read_timeout_ms: None,
        }
    }
}

impl FsConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port: Some(port),
            ..Self::default()
        }
    }

    /// Parse a TOML document.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| Error::InvalidConfig(e.to_string()))
    }

    /// Load a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::InvalidConfig(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&text)
    }

    /// Defaults overridden by an open-time environment map.
    pub fn from_env(env: &HashMap<String, String>) -> Result<Self> {
        Self::default().with_env(env)
    }

    /// Apply the recognised keys of `env`. Keys this layer does not know are
    /// left for other consumers of the map.
    pub fn with_env(mut self, env: &HashMap<String, String>) -> Result<Self> {
        for (key, value) in env {
            match key.as_str() {
                "host" => self.host = value.clone(),
                "port" => self.port = Some(parse_number(key, value)?),
                "root" => self.root = value.clone(),
                "tls" => self.tls = parse_bool(key, value)?,
                "cache" => self.cache.mode = parse_enum(key, value)?,
                "cacheFallback" => self.cache.fallback = parse_enum(key, value)?,
                "cacheLocation" => self.cache.location = Some(PathBuf::from(value)),
                "cacheAllowAlternateLocation" => {
                    self.cache.allow_alternate_location = parse_bool(key, value)?
                }
                "cacheVerbose" => self.cache.verbose = parse_bool(key, value)?,
                "cacheRegion" => self.cache.region = value.clone(),
                "connectTimeoutMs" => self.connect_timeout_ms = Some(parse_number(key, value)?),
                "readTimeoutMs" => self.read_timeout_ms = Some(parse_number(key, value)?),
                _ => {}
            }
        }
        Ok(self)
    }

    /// Base URL every endpoint is resolved against; always ends in `/`.
    pub fn base_url(&self) -> Result<Url> {
        let scheme = if self.tls { "https" } else { "http" };
        let port = self.port.map(|p| format!(":{p}")).unwrap_or_default();
        let root = self.root.trim_matches('/');
        let raw = if root.is_empty() {
            format!("{scheme}://{}{port}/", self.host)
        } else {
            format!("{scheme}://{}{port}/{root}/", self.host)
        };
        Url::parse(&raw).map_err(|e| Error::InvalidConfig(format!("{raw}: {e}")))
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout_ms.map(Duration::from_millis)
    }

    pub fn read_timeout(&self) -> Option<Duration> {
        self.read_timeout_ms.map(Duration::from_millis)
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(Error::InvalidConfig(format!("{key}: expected a boolean, got {value:?}"))),
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::InvalidConfig(format!("{key}: expected a number, got {value:?}")))
}

fn parse_enum<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::InvalidConfig(format!("{key}: unrecognised value {value:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_defaults() {
        let config = FsConfig::default();
        assert_eq!(config.cache.mode, CacheMode::MemoryOnly);
        assert_eq!(config.cache.fallback, FallbackPolicy::Offline);
        assert_eq!(config.cache.region, "default");
        assert!(!config.tls);
        assert!(config.cache.is_enabled());
    }

    #[test]
    fn test_mode_and_policy_spellings() {
        assert_eq!("memory+disk".parse::<CacheMode>().unwrap(), CacheMode::MemoryAndDisk);
        assert_eq!("None".parse::<CacheMode>().unwrap(), CacheMode::None);
        assert_eq!(
            "when-possible".parse::<FallbackPolicy>().unwrap(),
            FallbackPolicy::WhenPossible
        );
        assert_eq!(FallbackPolicy::WhenPossible.to_string(), "when-possible");
        assert_eq!(CacheMode::MemoryAndDisk.to_string(), "memory+disk");
    }

    #[test]
    fn test_from_env() {
        let config = FsConfig::from_env(&env(&[
            ("host", "files.example"),
            ("port", "8443"),
            ("tls", "true"),
            ("cache", "memory+disk"),
            ("cacheFallback", "always"),
            ("cacheLocation", "/tmp/strata-cache"),
            ("cacheAllowAlternateLocation", "yes"),
            ("cacheVerbose", "1"),
            ("readTimeoutMs", "2500"),
            ("unrelated", "ignored"),
        ]))
        .unwrap();
        assert_eq!(config.host, "files.example");
        assert_eq!(config.port, Some(8443));
        assert!(config.tls);
        assert_eq!(config.cache.mode, CacheMode::MemoryAndDisk);
        assert_eq!(config.cache.fallback, FallbackPolicy::Always);
        assert_eq!(config.cache.location, Some(PathBuf::from("/tmp/strata-cache")));
        assert!(config.cache.allow_alternate_location);
        assert!(config.cache.verbose);
        assert_eq!(config.read_timeout(), Some(Duration::from_millis(2500)));
    }

    #[test]
    fn test_from_env_rejects_unknown_values() {
        let err = FsConfig::from_env(&env(&[("cacheFallback", "sometimes")])).unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
        let err = FsConfig::from_env(&env(&[("tls", "maybe")])).unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }

    #[test]
    fn test_never_disables_cache() {
        let config = CacheConfig {
            fallback: FallbackPolicy::Never,
            ..CacheConfig::default()
        };
        assert!(!config.is_enabled());
    }

    #[test]
    fn test_from_toml() {
        let config = FsConfig::from_toml_str(
            r#"
host = "127.0.0.1"
port = 9000
root = "/api/"

[cache]
mode = "memory+disk"
fallback = "when-possible"
region = "docs"
"#,
        )
        .unwrap();
        assert_eq!(config.cache.mode, CacheMode::MemoryAndDisk);
        assert_eq!(config.cache.fallback, FallbackPolicy::WhenPossible);
        assert_eq!(config.cache.region, "docs");
        assert_eq!(config.base_url().unwrap().as_str(), "http://127.0.0.1:9000/api/");
    }

    #[test]
    fn test_base_url_without_root() {
        let mut config = FsConfig::new("example.org", 8443);
        config.tls = true;
        assert_eq!(config.base_url().unwrap().as_str(), "https://example.org:8443/");
    }
}
