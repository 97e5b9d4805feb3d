//! vault-secrets: device master key storage
//!
//! Backends (selected by `[keys] backend` in vault.toml):
//!   - keychain: platform credential store via `keyring` (default)
//!   - file:     Argon2id passphrase-sealed JSON key file
//!
//! Both are exposed as a `vault_crypto::KeyProvider`, caching the master key
//! after the first successful load.

pub mod kdf;
pub mod keychain;
pub mod keyfile;
pub mod provider;

pub use kdf::KdfParams;
pub use keychain::{KeychainKeyProvider, KeychainStore};
pub use keyfile::{KeyFileProvider, KeyFileStore};
pub use provider::{MasterKeyStore, StoredKeyProvider};

use std::sync::Arc;

use secrecy::SecretString;
use vault_core::config::KeysConfig;
use vault_core::{VaultError, VaultResult};
use vault_crypto::KeyProvider;

/// Build the configured Key Provider.
///
/// `passphrase` is only called for the key-file backend.
pub fn provider_from_config(
    keys: &KeysConfig,
    passphrase: impl FnOnce() -> anyhow::Result<SecretString>,
) -> VaultResult<Arc<dyn KeyProvider>> {
    match keys.backend.as_str() {
        "keychain" => {
            tracing::debug!(service = %keys.keychain_service, "using keychain key provider");
            Ok(Arc::new(KeychainKeyProvider::keychain(
                keys.keychain_service.clone(),
                keys.keychain_account.clone(),
            )))
        }
        "file" => {
            let path = keys.key_file_path();
            tracing::debug!(path = %path.display(), "using key file provider");
            let passphrase = passphrase().map_err(|e| VaultError::Secrets(format!("{e:#}")))?;
            Ok(Arc::new(KeyFileProvider::key_file(
                path,
                passphrase,
                KdfParams::from(keys),
            )))
        }
        other => Err(VaultError::Config(format!("unknown key backend: {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vault_crypto::ContentKey;

    #[test]
    fn test_file_backend_from_config() {
        let dir = tempfile::tempdir().unwrap();
        let keys = KeysConfig {
            backend: "file".into(),
            key_file: dir.path().join("master.key"),
            argon2_mem_cost_kib: 1024,
            argon2_time_cost: 1,
            argon2_parallelism: 1,
            ..KeysConfig::default()
        };

        let provider = provider_from_config(&keys, || Ok(SecretString::from("pw"))).unwrap();
        let key = ContentKey::generate();
        let wrapped = provider.wrap_key(&key).unwrap();
        assert_eq!(provider.unwrap_key(&wrapped).unwrap().as_bytes(), key.as_bytes());
        assert!(dir.path().join("master.key").exists());
    }

    #[test]
    fn test_passphrase_failure_is_secrets_error() {
        let keys = KeysConfig {
            backend: "file".into(),
            ..KeysConfig::default()
        };
        let err = provider_from_config(&keys, || anyhow::bail!("no tty"))
            .err()
            .unwrap();
        assert!(matches!(err, VaultError::Secrets(_)));
    }

    #[test]
    fn test_unknown_backend() {
        let keys = KeysConfig {
            backend: "tpm".into(),
            ..KeysConfig::default()
        };
        let err = provider_from_config(&keys, || unreachable!()).err().unwrap();
        assert!(matches!(err, VaultError::Config(_)));
    }
}
