//! Platform keychain integration for storing the device master key.
//!
//! Uses the `keyring` crate for cross-platform access:
//! - macOS: Keychain Services
//! - Linux: GNOME Keyring / Secret Service (D-Bus)
//! - Windows: Credential Manager (DPAPI)
//!
//! The master key is stored base64-encoded under `(service, account)`.

use anyhow::Result;
use base64::{engine::general_purpose::STANDARD, Engine};
use secrecy::{ExposeSecret, SecretString};
use zeroize::{Zeroize, Zeroizing};

use vault_crypto::{MasterKey, KEY_SIZE};

use crate::provider::{MasterKeyStore, StoredKeyProvider};

/// Keychain-backed Key Provider.
pub type KeychainKeyProvider = StoredKeyProvider<KeychainStore>;

/// One keychain service namespace.
#[derive(Debug, Clone)]
pub struct KeychainStore {
    service: String,
    account: String,
}

impl KeychainStore {
    pub fn new(service: impl Into<String>, account: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            account: account.into(),
        }
    }

    fn entry(&self, key_name: &str) -> Result<keyring::Entry> {
        keyring::Entry::new(&self.service, key_name)
            .map_err(|e| anyhow::anyhow!("keychain entry creation: {e}"))
    }

    /// Store a secret in the platform keychain.
    pub fn store_secret(&self, key_name: &str, secret: &SecretString) -> Result<()> {
        self.entry(key_name)?
            .set_password(secret.expose_secret())
            .map_err(|e| anyhow::anyhow!("keychain store for '{key_name}': {e}"))?;
        tracing::debug!(
            service = %self.service,
            key = key_name,
            "stored secret in platform keychain"
        );
        Ok(())
    }

    /// Retrieve a secret from the platform keychain.
    pub fn get_secret(&self, key_name: &str) -> Result<Option<SecretString>> {
        match self.entry(key_name)?.get_password() {
            Ok(mut password) => {
                let secret = SecretString::from(password.clone());
                password.zeroize();
                Ok(Some(secret))
            }
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(anyhow::anyhow!("keychain get for '{key_name}': {e}")),
        }
    }
}

impl MasterKeyStore for KeychainStore {
    fn load(&self) -> Result<Option<MasterKey>> {
        let Some(secret) = self.get_secret(&self.account)? else {
            return Ok(None);
        };
        decode_master(secret.expose_secret()).map(Some)
    }

    fn store(&self, key: &MasterKey) -> Result<()> {
        let encoded = SecretString::from(STANDARD.encode(key.as_bytes()));
        self.store_secret(&self.account, &encoded)
    }

    fn describe(&self) -> String {
        format!("keychain {}/{}", self.service, self.account)
    }
}

fn decode_master(encoded: &str) -> Result<MasterKey> {
    let raw = Zeroizing::new(
        STANDARD
            .decode(encoded.trim())
            .map_err(|e| anyhow::anyhow!("master key is not valid base64: {e}"))?,
    );
    let bytes: [u8; KEY_SIZE] = raw.as_slice().try_into().map_err(|_| {
        anyhow::anyhow!(
            "master key is {} bytes (expected {KEY_SIZE})",
            raw.len()
        )
    })?;
    Ok(MasterKey::from_bytes(bytes))
}

impl KeychainKeyProvider {
    pub fn keychain(service: impl Into<String>, account: impl Into<String>) -> Self {
        StoredKeyProvider::new(KeychainStore::new(service, account))
    }
}
