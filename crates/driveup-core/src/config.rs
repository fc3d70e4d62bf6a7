//! Application configuration management.
//!
//! Configuration is stored at `~/.config/driveup/config.json`; environment
//! variables (usually from a `.env` file) override individual fields.
//! Persistent state (tokens and transfer sessions) lives under the data
//! directory, `~/.local/share/driveup` unless `DRIVEUP_HOME` is set.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::auth::{SecretStore, TokenCipher, TokenStore};
use crate::error::Error;
use crate::orchestrator::DEFAULT_CHUNK_SIZE;
use crate::store::ResumeStore;
use crate::transfer::retry::DEFAULT_MAX_ATTEMPTS;
use crate::transfer::scheduler::DEFAULT_STALL_TIMEOUT_SECS;
use crate::transfer::RetryPolicy;

/// Application name used for config/data directory paths
const APP_NAME: &str = "driveup";

/// Config file name
const CONFIG_FILE: &str = "config.json";

/// Drive accepts resumable upload chunks in multiples of 256 KiB.
pub const CHUNK_GRANULARITY: u64 = 256 * 1024;

pub const ENV_CLIENT_ID: &str = "DRIVEUP_CLIENT_ID";
pub const ENV_CLIENT_SECRET: &str = "DRIVEUP_CLIENT_SECRET";
pub const ENV_CHUNK_SIZE: &str = "DRIVEUP_CHUNK_SIZE";
pub const ENV_HOME: &str = "DRIVEUP_HOME";
pub const ENV_TOKEN_PASSPHRASE: &str = "DRIVEUP_TOKEN_PASSPHRASE";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub client_id: Option<String>,
    /// Prefer the OS keychain; a value here is used as-is.
    pub client_secret: Option<String>,
    pub chunk_size: u64,
    pub stall_timeout_secs: u64,
    pub max_chunk_attempts: u32,
    /// Seal token files with a key kept in the OS keychain.
    pub encrypt_tokens: bool,
    /// Overrides the data directory.
    pub home: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            client_id: None,
            client_secret: None,
            chunk_size: DEFAULT_CHUNK_SIZE,
            stall_timeout_secs: DEFAULT_STALL_TIMEOUT_SECS,
            max_chunk_attempts: DEFAULT_MAX_ATTEMPTS,
            encrypt_tokens: false,
            home: None,
        }
    }
}

impl Config {
    /// Load the config file (defaults when missing), then apply environment
    /// overrides and validate.
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            serde_json::from_str(&contents)
                .with_context(|| format!("Failed to parse {}", path.display()))?
        } else {
            Self::default()
        };

        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        debug!(chunk_size = config.chunk_size, "Configuration loaded");
        Ok(config)
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    /// Apply overrides from `lookup` (the process environment in practice).
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(id) = non_empty(ENV_CLIENT_ID) {
            self.client_id = Some(id.trim().to_string());
        }
        if let Some(secret) = non_empty(ENV_CLIENT_SECRET) {
            self.client_secret = Some(secret.trim().to_string());
        }
        if let Some(size) = non_empty(ENV_CHUNK_SIZE) {
            self.chunk_size = size
                .trim()
                .parse()
                .with_context(|| format!("{} must be a byte count, got '{}'", ENV_CHUNK_SIZE, size))?;
        }
        if let Some(home) = non_empty(ENV_HOME) {
            self.home = Some(PathBuf::from(home));
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.chunk_size == 0 || self.chunk_size % CHUNK_GRANULARITY != 0 {
            return Err(Error::Config(format!(
                "chunk size {} is not a positive multiple of {} bytes",
                self.chunk_size, CHUNK_GRANULARITY
            )));
        }
        if self.max_chunk_attempts == 0 {
            return Err(Error::Config(
                "max_chunk_attempts must be at least 1".to_string(),
            ));
        }
        if self.stall_timeout_secs == 0 {
            return Err(Error::Config(
                "stall_timeout_secs must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn data_dir(&self) -> Result<PathBuf> {
        if let Some(ref home) = self.home {
            return Ok(home.clone());
        }
        let data_dir = dirs::data_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find data directory"))?;
        Ok(data_dir.join(APP_NAME))
    }

    pub fn tokens_dir(&self) -> Result<PathBuf> {
        Ok(self.data_dir()?.join("tokens"))
    }

    pub fn sessions_dir(&self) -> Result<PathBuf> {
        Ok(self.data_dir()?.join("sessions"))
    }

    pub fn stall_timeout(&self) -> Duration {
        Duration::from_secs(self.stall_timeout_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_chunk_attempts)
    }

    /// OAuth client id, required for every remote call.
    pub fn require_client_id(&self) -> Result<&str, Error> {
        self.client_id.as_deref().ok_or_else(|| {
            Error::Config(format!(
                "no OAuth client id configured (set {} or client_id in the config file)",
                ENV_CLIENT_ID
            ))
        })
    }

    /// Client secret from config/environment, falling back to the keychain.
    pub fn resolve_client_secret(&self) -> Result<Option<String>> {
        if let Some(ref secret) = self.client_secret {
            return Ok(Some(secret.clone()));
        }
        match self.client_id {
            Some(ref id) => SecretStore::client_secret(id),
            None => Ok(None),
        }
    }

    /// Cipher for token files: a passphrase from the environment wins, then
    /// a keychain key when `encrypt_tokens` is set, else none.
    pub fn token_cipher(&self) -> Result<Option<TokenCipher>> {
        if let Some(passphrase) = std::env::var(ENV_TOKEN_PASSPHRASE)
            .ok()
            .filter(|p| !p.is_empty())
        {
            return Ok(Some(TokenCipher::with_passphrase(passphrase)));
        }
        if self.encrypt_tokens {
            return Ok(Some(TokenCipher::with_key(SecretStore::token_key()?)));
        }
        Ok(None)
    }

    pub fn token_store(&self) -> Result<TokenStore> {
        let store = TokenStore::new(self.tokens_dir()?);
        Ok(match self.token_cipher()? {
            Some(cipher) => store.with_cipher(cipher),
            None => store,
        })
    }

    pub fn resume_store(&self) -> Result<ResumeStore> {
        Ok(ResumeStore::new(self.sessions_dir()?))
    }
}
