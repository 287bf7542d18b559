//! Configuration management for Crosspost
//!
//! Configuration lives in a TOML file (see [`resolve_config_path`]). Secrets
//! never appear in the file itself: vault keys, OAuth client secrets and
//! webhook secrets are named by environment variable and read on demand.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use secrecy::SecretString;
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Result};
use crate::types::Provider;

pub const CONFIG_ENV: &str = "CROSSPOST_CONFIG";
pub const DB_PATH_ENV: &str = "CROSSPOST_DB_PATH";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    #[serde(default)]
    pub vault: VaultConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    /// Per-provider settings keyed by lowercase provider name
    #[serde(default)]
    pub providers: BTreeMap<String, ProviderConfig>,
    #[serde(default)]
    pub webhooks: WebhookConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultConfig {
    /// Key version used for every new encryption
    pub current_version: u32,
    #[serde(default)]
    pub keys: Vec<VaultKeyConfig>,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            current_version: 1,
            keys: vec![VaultKeyConfig {
                version: 1,
                secret_env: "CROSSPOST_VAULT_KEY".to_string(),
            }],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultKeyConfig {
    pub version: u32,
    /// Environment variable holding the secret this key version is derived from
    pub secret_env: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueBackend {
    /// Durable jobs stored next to the posts
    Sqlite,
    /// Process-local jobs, lost on restart
    Memory,
    /// No queue: schedules stay awaiting enqueue
    Disabled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_backend")]
    pub backend: QueueBackend,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_base_secs")]
    pub backoff_base_secs: u64,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
}

fn default_backend() -> QueueBackend {
    QueueBackend::Sqlite
}

fn default_concurrency() -> usize {
    4
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_base_secs() -> u64 {
    5
}

fn default_poll_interval_secs() -> u64 {
    5
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            concurrency: default_concurrency(),
            max_attempts: default_max_attempts(),
            backoff_base_secs: default_backoff_base_secs(),
            poll_interval_secs: default_poll_interval_secs(),
        }
    }
}

/// Endpoints and secret references for one provider
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub api_base: Option<String>,
    pub token_url: Option<String>,
    pub client_id: Option<String>,
    pub client_secret_env: Option<String>,
    pub webhook_secret_env: Option<String>,
    pub verify_token_env: Option<String>,
}

impl ProviderConfig {
    pub fn client_secret(&self) -> Option<SecretString> {
        self.client_secret_env.as_deref().and_then(read_secret_env)
    }

    pub fn webhook_secret(&self) -> Option<SecretString> {
        self.webhook_secret_env.as_deref().and_then(read_secret_env)
    }

    pub fn verify_token(&self) -> Option<SecretString> {
        self.verify_token_env.as_deref().and_then(read_secret_env)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

fn default_bind() -> String {
    "127.0.0.1:8787".to_string()
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

impl Config {
    /// Load configuration from the default location
    pub fn load() -> Result<Self> {
        let config_path = resolve_config_path()?;
        Self::load_from_path(&config_path)
    }

    /// Load and validate configuration from a specific path
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::ReadError)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).map_err(ConfigError::ParseError)?;
        config.validate()?;
        Ok(config)
    }

    /// Create a default configuration
    pub fn default_config() -> Self {
        Self {
            database: DatabaseConfig {
                path: "~/.local/share/crosspost/crosspost.db".to_string(),
            },
            vault: VaultConfig::default(),
            queue: QueueConfig::default(),
            providers: BTreeMap::new(),
            webhooks: WebhookConfig::default(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !self
            .vault
            .keys
            .iter()
            .any(|k| k.version == self.vault.current_version)
        {
            return Err(ConfigError::InvalidValue {
                field: "vault.current_version".to_string(),
                reason: format!(
                    "no [[vault.keys]] entry has version {}",
                    self.vault.current_version
                ),
            }
            .into());
        }

        if self.queue.concurrency == 0 {
            return Err(ConfigError::InvalidValue {
                field: "queue.concurrency".to_string(),
                reason: "must be at least 1".to_string(),
            }
            .into());
        }

        if self.queue.max_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                field: "queue.max_attempts".to_string(),
                reason: "must be at least 1".to_string(),
            }
            .into());
        }

        for name in self.providers.keys() {
            name.parse::<Provider>().map_err(|_| ConfigError::InvalidValue {
                field: format!("providers.{}", name),
                reason: "unknown provider".to_string(),
            })?;
        }

        Ok(())
    }

    /// Settings for `provider`, or defaults when the section is absent
    pub fn provider(&self, provider: Provider) -> ProviderConfig {
        self.providers
            .get(provider.as_str())
            .cloned()
            .unwrap_or_default()
    }

    /// Database path after `CROSSPOST_DB_PATH` override and tilde expansion
    pub fn resolve_db_path(&self) -> PathBuf {
        let raw = std::env::var(DB_PATH_ENV).unwrap_or_else(|_| self.database.path.clone());
        PathBuf::from(shellexpand::tilde(&raw).to_string())
    }
}

/// Read a secret from the named environment variable. Empty values count as unset.
pub fn read_secret_env(var: &str) -> Option<SecretString> {
    std::env::var(var)
        .ok()
        .filter(|v| !v.is_empty())
        .map(SecretString::from)
}

/// Resolve the configuration file path following XDG Base Directory conventions
pub fn resolve_config_path() -> Result<PathBuf> {
    if let Ok(path) = std::env::var(CONFIG_ENV) {
        return Ok(PathBuf::from(shellexpand::tilde(&path).to_string()));
    }

    let config_dir = dirs::config_dir()
        .ok_or_else(|| ConfigError::MissingField("config directory".to_string()))?;

    Ok(config_dir.join("crosspost").join("config.toml"))
}
