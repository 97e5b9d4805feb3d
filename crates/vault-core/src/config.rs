use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{VaultError, VaultResult};

/// Top-level configuration (loaded from vault.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultConfig {
    pub codec: CodecConfig,
    pub keys: KeysConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CodecConfig {
    /// Plaintext bytes per chunk for new containers (default: 1 MiB)
    pub chunk_size_bytes: u32,
    /// Wrap a fresh content key into each header (default: true).
    /// When false, containers use an externally supplied content key.
    pub embed_wrapped_key: bool,
}

/// Master key storage
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeysConfig {
    /// "keychain" (OS credential store) or "file" (passphrase-sealed key file)
    pub backend: String,
    /// Keychain service name
    pub keychain_service: String,
    /// Keychain account under which the master key is stored
    pub keychain_account: String,
    /// Sealed master key file for the "file" backend
    pub key_file: PathBuf,
    /// Argon2id memory cost in KiB (default: 65536 = 64 MiB)
    pub argon2_mem_cost_kib: u32,
    /// Argon2id time cost (iterations, default: 3)
    pub argon2_time_cost: u32,
    /// Argon2id parallelism (default: 4)
    pub argon2_parallelism: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (default: info)
    pub level: String,
    /// Log format: "json" or "text"
    pub format: String,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            chunk_size_bytes: 1024 * 1024,
            embed_wrapped_key: true,
        }
    }
}

impl Default for KeysConfig {
    fn default() -> Self {
        Self {
            backend: "keychain".into(),
            keychain_service: "vault".into(),
            keychain_account: "master-key".into(),
            key_file: PathBuf::from("~/.config/vault/master.key"),
            argon2_mem_cost_kib: 65536,
            argon2_time_cost: 3,
            argon2_parallelism: 4,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
        }
    }
}

const KEY_BACKENDS: &[&str] = &["keychain", "file"];
const LOG_FORMATS: &[&str] = &["json", "text"];

impl VaultConfig {
    /// Read and validate `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> VaultResult<Self> {
        if !path.exists() {
            tracing::warn!(
                "config file not found: {}  (using defaults)",
                path.display()
            );
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| VaultError::Config(format!("parsing {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> VaultResult<()> {
        if self.codec.chunk_size_bytes == 0 {
            return Err(VaultError::Config(
                "codec.chunk_size_bytes must be greater than zero".into(),
            ));
        }
        if !KEY_BACKENDS.contains(&self.keys.backend.as_str()) {
            return Err(VaultError::Config(format!(
                "keys.backend must be one of {KEY_BACKENDS:?}, got {:?}",
                self.keys.backend
            )));
        }
        if self.keys.argon2_time_cost == 0 || self.keys.argon2_parallelism == 0 {
            return Err(VaultError::Config(
                "argon2 time cost and parallelism must be at least 1".into(),
            ));
        }
        if !LOG_FORMATS.contains(&self.logging.format.as_str()) {
            return Err(VaultError::Config(format!(
                "logging.format must be one of {LOG_FORMATS:?}, got {:?}",
                self.logging.format
            )));
        }
        Ok(())
    }
}

impl KeysConfig {
    pub fn key_file_path(&self) -> PathBuf {
        expand_tilde(&self.key_file)
    }
}

/// Expand a leading `~/` to `$HOME`.
pub fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    match s.strip_prefix("~/") {
        Some(rest) => {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".into());
            PathBuf::from(home).join(rest)
        }
        None => path.to_path_buf(),
    }
}
