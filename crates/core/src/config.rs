//! Environment-driven configuration, grounded on `spatio::types::Config`'s
//! builder-style `with_*` methods, `validate()` and JSON/TOML (de)serialization.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

fn default_port() -> String {
    ":8080".to_string()
}

fn default_path() -> String {
    "/tmp/geodb".to_string()
}

fn default_gc_interval_secs() -> u64 {
    300
}

fn default_gmaps_cache_duration_secs() -> u64 {
    3600
}

/// Process configuration, sourced from the `GEODB_*` environment variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_port")]
    pub port: String,

    #[serde(default = "default_path")]
    pub path: String,

    #[serde(default = "default_gc_interval_secs")]
    pub gc_interval_secs: u64,

    #[serde(default)]
    pub password: Option<String>,

    #[serde(default)]
    pub gmaps_key: Option<String>,

    #[serde(default = "default_gmaps_cache_duration_secs")]
    pub gmaps_cache_duration_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: default_port(),
            path: default_path(),
            gc_interval_secs: default_gc_interval_secs(),
            password: None,
            gmaps_key: None,
            gmaps_cache_duration_secs: default_gmaps_cache_duration_secs(),
        }
    }
}

impl Config {
    /// Build a `Config` from the `GEODB_*` environment variables, falling
    /// back to defaults for anything unset.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Ok(v) = std::env::var("GEODB_PORT") {
            cfg.port = v;
        }
        if let Ok(v) = std::env::var("GEODB_PATH") {
            cfg.path = v;
        }
        if let Ok(v) = std::env::var("GEODB_GC_INTERVAL") {
            if let Some(secs) = parse_duration_secs(&v) {
                cfg.gc_interval_secs = secs;
            }
        }
        if let Ok(v) = std::env::var("GEODB_PASSWORD") {
            cfg.password = Some(v);
        }
        if let Ok(v) = std::env::var("GEODB_GMAPS_KEY") {
            cfg.gmaps_key = Some(v);
        }
        if let Ok(v) = std::env::var("GEODB_GMAPS_CACHE_DURATION") {
            if let Some(secs) = parse_duration_secs(&v) {
                cfg.gmaps_cache_duration_secs = secs;
            }
        }
        cfg
    }

    pub fn with_port(mut self, port: impl Into<String>) -> Self {
        self.port = port.into();
        self
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    pub fn with_gc_interval(mut self, interval: Duration) -> Self {
        self.gc_interval_secs = interval.as_secs();
        self
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn with_gmaps_key(mut self, key: impl Into<String>) -> Self {
        self.gmaps_key = Some(key.into());
        self
    }

    /// Effective directions TTL. A zero value never means "expire
    /// immediately"; it is treated as unset and the 1h default is used
    /// instead.
    pub fn gmaps_cache_duration(&self) -> Duration {
        if self.gmaps_cache_duration_secs == 0 {
            Duration::from_secs(default_gmaps_cache_duration_secs())
        } else {
            Duration::from_secs(self.gmaps_cache_duration_secs)
        }
    }

    pub fn gc_interval(&self) -> Duration {
        Duration::from_secs(self.gc_interval_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.path.trim().is_empty() {
            return Err(Error::validation("path must not be empty"));
        }
        if self.port.trim().is_empty() {
            return Err(Error::validation("port must not be empty"));
        }
        Ok(())
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let cfg: Config = serde_json::from_str(json).map_err(|e| Error::Codec(e.into()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::Codec(e.into()))
    }

    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let cfg: Config = toml::from_str(toml_str)
            .map_err(|e| Error::internal(format!("invalid config toml: {e}")))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| Error::internal(format!("cannot serialize config: {e}")))
    }
}

/// Parses durations of the form `5m`, `300s`, `1h`; a bare number is seconds.
fn parse_duration_secs(raw: &str) -> Option<u64> {
    let raw = raw.trim();
    if let Some(digits) = raw.strip_suffix('s') {
        return digits.parse().ok();
    }
    if let Some(digits) = raw.strip_suffix('m') {
        return digits.parse::<u64>().ok().map(|m| m * 60);
    }
    if let Some(digits) = raw.strip_suffix('h') {
        return digits.parse::<u64>().ok().map(|h| h * 3600);
    }
    raw.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cfg = Config::default();
        assert_eq!(cfg.port, ":8080");
        assert_eq!(cfg.path, "/tmp/geodb");
        assert_eq!(cfg.gc_interval_secs, 300);
        assert!(cfg.password.is_none());
    }

    #[test]
    fn duration_parsing() {
        assert_eq!(parse_duration_secs("5m"), Some(300));
        assert_eq!(parse_duration_secs("1h"), Some(3600));
        assert_eq!(parse_duration_secs("30s"), Some(30));
        assert_eq!(parse_duration_secs("30"), Some(30));
    }

    #[test]
    fn zero_directions_ttl_falls_back_to_default() {
        let cfg = Config {
            gmaps_cache_duration_secs: 0,
            ..Config::default()
        };
        assert_eq!(cfg.gmaps_cache_duration(), Duration::from_secs(3600));
    }

    #[test]
    fn json_roundtrip() {
        let cfg = Config::default().with_port(":9090").with_password("s3cr3t");
        let json = cfg.to_json().unwrap();
        let back = Config::from_json(&json).unwrap();
        assert_eq!(back.port, ":9090");
        assert_eq!(back.password.as_deref(), Some("s3cr3t"));
    }

    #[test]
    fn validate_rejects_empty_path() {
        let cfg = Config {
            path: "".into(),
            ..Config::default()
        };
        assert!(cfg.validate().is_err());
    }
}
