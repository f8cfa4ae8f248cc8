//! Application configuration management.
//!
//! This module handles loading and saving the application configuration:
//! the API base URL, timeouts, refresh queue limit, where the session is
//! stored and how it is sealed, and the last e-mail used to sign in.
//!
//! Configuration is stored at `~/.config/ignitegym/config.json`.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::api::transport::REQUEST_TIMEOUT_SECS;
use crate::auth::interceptor::{RefreshPolicy, DEFAULT_MAX_PENDING, DEFAULT_REFRESH_TIMEOUT_SECS};
use crate::store::{CredentialStore, FileStore, KeyringStore, MemoryStore, SealedStore, SealingKey};

/// Application name used for config/data directory paths
pub const APP_NAME: &str = "ignitegym";

/// Config file name
const CONFIG_FILE: &str = "config.json";

/// Backend used when no URL is configured (the API's dev server).
pub const DEFAULT_API_URL: &str = "http://localhost:3333";

/// Environment variable overriding `api_url`.
pub const API_URL_ENV: &str = "IGNITEGYM_API_URL";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    File,
    Keyring,
    /// Nothing survives the process. Useful for scripted runs.
    Memory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Sealing {
    #[default]
    None,
    /// Random key kept in the OS keychain.
    Keychain,
    /// Key derived from a passphrase.
    Passphrase,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub api_url: String,
    pub request_timeout_secs: u64,
    pub refresh_timeout_secs: u64,
    pub max_pending_requests: usize,
    pub storage: StorageBackend,
    pub sealing: Sealing,
    pub last_email: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            request_timeout_secs: REQUEST_TIMEOUT_SECS,
            refresh_timeout_secs: DEFAULT_REFRESH_TIMEOUT_SECS,
            max_pending_requests: DEFAULT_MAX_PENDING,
            storage: StorageBackend::default(),
            sealing: Sealing::default(),
            last_email: None,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            serde_json::from_str(&contents).with_context(|| format!("Failed to parse {}", path.display()))
        } else {
            Ok(Self::default())
        }
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir().ok_or_else(|| anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    /// Apply environment overrides.
    pub fn apply_env(&mut self) {
        if let Ok(url) = std::env::var(API_URL_ENV) {
            if !url.trim().is_empty() {
                debug!(url = %url, "API URL overridden from environment");
                self.api_url = url;
            }
        }
    }

    /// Directory for the file store and logs.
    pub fn data_dir() -> Result<PathBuf> {
        let data_dir = dirs::data_dir().ok_or_else(|| anyhow!("Could not find data directory"))?;
        Ok(data_dir.join(APP_NAME))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    pub fn refresh_policy(&self) -> RefreshPolicy {
        RefreshPolicy {
            max_pending: self.max_pending_requests.max(1),
            refresh_timeout: Duration::from_secs(self.refresh_timeout_secs.max(1)),
        }
    }

    /// Build the configured credential store.
    ///
    /// `passphrase` is required when sealing is `Passphrase` and ignored otherwise.
    pub async fn open_store(&self, passphrase: Option<&str>) -> Result<Arc<dyn CredentialStore>> {
        let backend: Arc<dyn CredentialStore> = match self.storage {
            StorageBackend::File => Arc::new(FileStore::new(Self::data_dir()?.join("session"))),
            StorageBackend::Keyring => Arc::new(KeyringStore::new()),
            StorageBackend::Memory => Arc::new(MemoryStore::new()),
        };

        let key = match self.sealing {
            Sealing::None => return Ok(backend),
            Sealing::Keychain => SealingKey::from_keychain(&KeyringStore::new())
                .await
                .context("Failed to load sealing key from keychain")?,
            Sealing::Passphrase => {
                let Some(passphrase) = passphrase.filter(|p| !p.is_empty()) else {
                    bail!("A passphrase is required to open the sealed session store");
                };
                SealingKey::from_passphrase(backend.as_ref(), passphrase)
                    .await
                    .context("Failed to derive sealing key")?
            }
        };
        Ok(Arc::new(SealedStore::new(backend, &key)))
    }
}
