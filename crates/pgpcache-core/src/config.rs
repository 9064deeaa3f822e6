use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{PgpCacheError, PgpCacheResult};

/// Top-level configuration (loaded from config.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PgpCacheConfig {
    pub cache: CacheConfig,
    pub store: StoreConfig,
    pub passphrase: PassphraseConfig,
    pub log: LogConfig,
}

/// Which secure-cache implementation backs the scopes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackend {
    /// Platform keychain (Secret Service, Keychain Services, Credential Manager)
    Keychain,
    /// Process-local registry; nothing outlives the process
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Secure cache backend (default: keychain)
    pub backend: CacheBackend,
    /// Keychain service name all entries are filed under (default: pgpcache)
    pub service: String,
    /// Emit a trace event for every secure-cache call
    pub trace_calls: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Seconds a decrypted private key stays in the live scope (0 = no expiry)
    pub live_ttl_secs: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PassphraseConfig {
    /// Scope name cached passphrases are stored under
    pub scope: String,
    /// Seconds a cached passphrase survives (0 = no expiry)
    pub ttl_secs: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level (default: info)
    pub level: String,
    /// Log format: "json" or "text"
    pub format: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            backend: CacheBackend::Keychain,
            service: "pgpcache".into(),
            trace_calls: false,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self { live_ttl_secs: 5 }
    }
}

impl Default for PassphraseConfig {
    fn default() -> Self {
        Self {
            scope: "pgp-passphrase".into(),
            ttl_secs: 300,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
        }
    }
}

impl StoreConfig {
    pub fn live_ttl(&self) -> Option<u32> {
        (self.live_ttl_secs > 0).then_some(self.live_ttl_secs)
    }
}

impl PassphraseConfig {
    pub fn ttl(&self) -> Option<u32> {
        (self.ttl_secs > 0).then_some(self.ttl_secs)
    }
}

impl PgpCacheConfig {
    /// Load from `path`, falling back to defaults when the file does not exist.
    pub fn load(path: &Path) -> PgpCacheResult<Self> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "config file absent, using defaults");
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|e| PgpCacheError::Config(format!("parsing {}: {e}", path.display())))
    }
}

/// Default config location: $XDG_CONFIG_HOME/pgpcache/config.toml
pub fn default_config_path() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| ".".into());
            PathBuf::from(home).join(".config")
        })
        .join("pgpcache")
        .join("config.toml")
}
