//! Application configuration management.
//!
//! This module handles loading and saving the configuration, which includes
//! the sync backend URL, cache timings, and the last used username.
//!
//! Configuration is stored at `~/.config/schoolcache/config.json`.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::cache::CacheConfig;
use crate::source::SourceConfig;

/// Application name used for config/cache directory paths
pub const APP_NAME: &str = "schoolcache";

/// Config file name
const CONFIG_FILE: &str = "config.json";

/// Overrides `api_base_url` when set, e.g. from a `.env` file
pub const API_URL_ENV: &str = "SCHOOLCACHE_API_URL";

const DEFAULT_API_BASE_URL: &str = "https://sync.schoolcache.app/api/v1";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub api_base_url: Option<String>,
    pub cache_ttl_minutes: Option<i64>,
    pub stream_grace_millis: Option<u64>,
    pub last_username: Option<String>,
}

impl Config {
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        if path.exists() {
            let contents = std::fs::read_to_string(&path)?;
            Ok(serde_json::from_str(&contents)?)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    pub fn cache_dir(&self) -> Result<PathBuf> {
        let cache_dir = dirs::cache_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find cache directory"))?;
        Ok(cache_dir.join(APP_NAME))
    }

    /// Backend URL: environment override, then config file, then default.
    pub fn api_base_url(&self) -> String {
        std::env::var(API_URL_ENV)
            .ok()
            .filter(|url| !url.trim().is_empty())
            .or_else(|| self.api_base_url.clone())
            .unwrap_or_else(|| DEFAULT_API_BASE_URL.to_string())
    }

    pub fn source_config(&self) -> SourceConfig {
        let defaults = SourceConfig::default();
        SourceConfig {
            cache: self
                .cache_ttl_minutes
                .map(|minutes| CacheConfig::with_ttl(chrono::Duration::minutes(minutes)))
                .unwrap_or(defaults.cache),
            grace_period: self
                .stream_grace_millis
                .map(Duration::from_millis)
                .unwrap_or(defaults.grace_period),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: Config =
            serde_json::from_str(r#"{"cache_ttl_minutes": 5}"#).expect("parse config");
        let source = config.source_config();
        assert_eq!(source.cache.ttl, chrono::Duration::minutes(5));
        assert_eq!(source.grace_period, SourceConfig::default().grace_period);
        assert!(config.last_username.is_none());
    }

    #[test]
    fn test_config_round_trips_through_json() {
        let config = Config {
            api_base_url: Some("http://localhost:8080/api".to_string()),
            stream_grace_millis: Some(250),
            ..Config::default()
        };
        let json = serde_json::to_string(&config).expect("serialize");
        let parsed: Config = serde_json::from_str(&json).expect("parse");
        assert_eq!(parsed.api_base_url, config.api_base_url);
        assert_eq!(
            parsed.source_config().grace_period,
            Duration::from_millis(250)
        );
    }
}
