//! Client configuration.
//!
//! Stored at `~/.config/gridrr/config.json`. `GRIDRR_API_URL` and
//! `GRIDRR_TOKEN_BACKEND` override the file when set.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

use crate::api::transport::{DEFAULT_API_BASE_URL, DEFAULT_REQUEST_TIMEOUT_SECS};
use crate::auth::session::DEFAULT_REFRESH_MARGIN_SECS;
use crate::auth::{FileTokenStore, KeyringTokenStore, MemoryTokenStore, TokenStore};

/// Application name used for config/data directory paths
const APP_NAME: &str = "gridrr";

/// Config file name
const CONFIG_FILE: &str = "config.json";

const ENV_API_URL: &str = "GRIDRR_API_URL";
const ENV_TOKEN_BACKEND: &str = "GRIDRR_TOKEN_BACKEND";

/// Where the access token is persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TokenBackend {
    #[default]
    File,
    Keyring,
    Memory,
}

impl std::str::FromStr for TokenBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "file" => Ok(TokenBackend::File),
            "keyring" => Ok(TokenBackend::Keyring),
            "memory" => Ok(TokenBackend::Memory),
            other => bail!("Unknown token backend '{}' (expected file, keyring or memory)", other),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub api_base_url: String,
    pub request_timeout_secs: u64,
    pub refresh_margin_secs: i64,
    pub token_backend: TokenBackend,
    pub last_email: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            refresh_margin_secs: DEFAULT_REFRESH_MARGIN_SECS,
            token_backend: TokenBackend::default(),
            last_email: None,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        let config = if path.exists() {
            let contents = std::fs::read_to_string(&path)?;
            serde_json::from_str(&contents)?
        } else {
            Self::default()
        };
        config.with_env(|key| std::env::var(key).ok())
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

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    /// Directory for the file token store.
    pub fn data_dir() -> Result<PathBuf> {
        let data_dir = dirs::data_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find data directory"))?;
        Ok(data_dir.join(APP_NAME))
    }

    fn with_env(mut self, var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(url) = var(ENV_API_URL).filter(|v| !v.trim().is_empty()) {
            self.api_base_url = url.trim().trim_end_matches('/').to_string();
        }
        if let Some(backend) = var(ENV_TOKEN_BACKEND).filter(|v| !v.trim().is_empty()) {
            self.token_backend = backend.parse()?;
        }
        Ok(self)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn refresh_margin(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.refresh_margin_secs.max(0))
    }

    pub fn token_store(&self) -> Result<Box<dyn TokenStore>> {
        Ok(match self.token_backend {
            TokenBackend::File => Box::new(FileTokenStore::new(Self::data_dir()?)),
            TokenBackend::Keyring => Box::new(KeyringTokenStore),
            TokenBackend::Memory => Box::new(MemoryTokenStore::new()),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.api_base_url, "https://api.gridrr.com/api");
        assert_eq!(config.request_timeout(), Duration::from_secs(30));
        assert_eq!(config.refresh_margin(), chrono::Duration::minutes(2));
        assert_eq!(config.token_backend, TokenBackend::File);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let config: Config =
            serde_json::from_str(r#"{"token_backend":"keyring","last_email":"ada@example.com"}"#)
                .expect("parse");
        assert_eq!(config.token_backend, TokenBackend::Keyring);
        assert_eq!(config.last_email.as_deref(), Some("ada@example.com"));
        assert_eq!(config.refresh_margin_secs, 120);
    }

    #[test]
    fn test_env_overrides() {
        let config = Config::default()
            .with_env(env(&[
                ("GRIDRR_API_URL", "http://localhost:3000/api/"),
                ("GRIDRR_TOKEN_BACKEND", "Memory"),
            ]))
            .expect("env");
        assert_eq!(config.api_base_url, "http://localhost:3000/api");
        assert_eq!(config.token_backend, TokenBackend::Memory);
    }

    #[test]
    fn test_unknown_backend_is_an_error() {
        let err = Config::default()
            .with_env(env(&[("GRIDRR_TOKEN_BACKEND", "floppy")]))
            .expect_err("unknown");
        assert!(err.to_string().contains("floppy"));
    }

    #[test]
    fn test_memory_store_from_config() {
        let config = Config {
            token_backend: TokenBackend::Memory,
            ..Config::default()
        };
        let store = config.token_store().expect("store");
        store.set("abc").expect("set");
        assert_eq!(store.get().expect("get").as_deref(), Some("abc"));
    }
}
