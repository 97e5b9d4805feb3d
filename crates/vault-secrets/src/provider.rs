//! Key Provider backed by a persistent master key store.

use std::sync::Mutex;

use vault_crypto::{CipherError, ContentKey, KeyProvider, MasterKey, SoftwareKeyProvider};

/// Somewhere a device master key lives between runs.
pub trait MasterKeyStore: Send + Sync {
    /// `Ok(None)` when no key has been stored yet.
    fn load(&self) -> anyhow::Result<Option<MasterKey>>;

    fn store(&self, key: &MasterKey) -> anyhow::Result<()>;

    /// Human-readable location, for logs and errors.
    fn describe(&self) -> String;
}

/// [`KeyProvider`] over a [`MasterKeyStore`].
///
/// The master key is fetched on first use and kept for the provider's
/// lifetime. Encrypting with an empty store creates and stores a new master
/// key; unwrapping never does.
pub struct StoredKeyProvider<S> {
    store: S,
    cached: Mutex<Option<SoftwareKeyProvider>>,
}

impl<S: MasterKeyStore> StoredKeyProvider<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            cached: Mutex::new(None),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    fn master(&self, create: bool) -> vault_crypto::Result<SoftwareKeyProvider> {
        let mut cached = self
            .cached
            .lock()
            .map_err(|_| CipherError::KeyUnavailable("key provider lock poisoned".into()))?;
        if let Some(provider) = cached.as_ref() {
            return Ok(provider.clone());
        }

        let loaded = self.store.load().map_err(|e| {
            CipherError::KeyUnavailable(format!("{}: {e:#}", self.store.describe()))
        })?;
        let master = match loaded {
            Some(master) => master,
            None if create => {
                let master = MasterKey::generate();
                self.store.store(&master).map_err(|e| {
                    CipherError::KeyUnavailable(format!("{}: {e:#}", self.store.describe()))
                })?;
                tracing::info!(store = %self.store.describe(), "created new master key");
                master
            }
            None => {
                return Err(CipherError::KeyUnavailable(format!(
                    "no master key in {}",
                    self.store.describe()
                )))
            }
        };

        let provider = SoftwareKeyProvider::new(master);
        *cached = Some(provider.clone());
        Ok(provider)
    }
}

impl<S: MasterKeyStore> KeyProvider for StoredKeyProvider<S> {
    fn generate_content_key(&self) -> vault_crypto::Result<ContentKey> {
        Ok(ContentKey::generate())
    }

    fn wrap_key(&self, key: &ContentKey) -> vault_crypto::Result<Vec<u8>> {
        self.master(true)?.wrap_key(key)
    }

    fn unwrap_key(&self, wrapped: &[u8]) -> vault_crypto::Result<ContentKey> {
        self.master(false)?.unwrap_key(wrapped)
    }
}
