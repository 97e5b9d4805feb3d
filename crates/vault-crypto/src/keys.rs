//! Content keys, the Key Provider contract, and key wrapping.

use std::sync::Arc;

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use rand::RngCore;
use zeroize::Zeroize;

use crate::error::{CipherError, Result};
use crate::{KEY_SIZE, NONCE_SIZE, TAG_SIZE};

/// Length of a wrapped content key: nonce + sealed key + tag.
pub const WRAPPED_KEY_SIZE: usize = NONCE_SIZE + KEY_SIZE + TAG_SIZE;

/// A 256-bit content key. Zeroized on drop.
#[derive(Clone)]
pub struct ContentKey {
    bytes: [u8; KEY_SIZE],
}

impl ContentKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }

    /// Fresh random key from the thread-local CSPRNG.
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self::from_bytes(bytes)
    }
}

impl Drop for ContentKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for ContentKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// A device-bound 256-bit key used only to wrap content keys.
#[derive(Clone)]
pub struct MasterKey {
    bytes: [u8; KEY_SIZE],
}

impl MasterKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }

    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self::from_bytes(bytes)
    }
}

impl Drop for MasterKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MasterKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Source of content keys, backed by some device-bound master key.
///
/// Implementations serialize their own key-store access; the codec may call
/// them from several worker threads at once.
pub trait KeyProvider: Send + Sync {
    /// A fresh random content key.
    fn generate_content_key(&self) -> Result<ContentKey>;

    /// Encrypt key material under the master key. The output is opaque.
    fn wrap_key(&self, key: &ContentKey) -> Result<Vec<u8>>;

    /// Inverse of [`wrap_key`](Self::wrap_key). Fails with
    /// [`CipherError::KeyUnavailable`] when the master key is absent or differs.
    fn unwrap_key(&self, wrapped: &[u8]) -> Result<ContentKey>;
}

impl<P: KeyProvider + ?Sized> KeyProvider for Arc<P> {
    fn generate_content_key(&self) -> Result<ContentKey> {
        (**self).generate_content_key()
    }

    fn wrap_key(&self, key: &ContentKey) -> Result<Vec<u8>> {
        (**self).wrap_key(key)
    }

    fn unwrap_key(&self, wrapped: &[u8]) -> Result<ContentKey> {
        (**self).unwrap_key(wrapped)
    }
}

/// Wrap a content key with AES-256-GCM under `master`.
///
/// Output: `[12-byte nonce][32-byte sealed key][16-byte tag]`
pub fn wrap_key(master: &MasterKey, key: &ContentKey) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new(master.as_bytes().into());

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let sealed = cipher
        .encrypt(nonce, key.as_bytes().as_ref())
        .map_err(|e| CipherError::key_unavailable(format!("key wrapping failed: {e}")))?;

    let mut out = Vec::with_capacity(NONCE_SIZE + sealed.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&sealed);
    Ok(out)
}

/// Unwrap the output of [`wrap_key`].
pub fn unwrap_key(master: &MasterKey, wrapped: &[u8]) -> Result<ContentKey> {
    if wrapped.len() != WRAPPED_KEY_SIZE {
        return Err(CipherError::key_unavailable(format!(
            "wrapped key is {} bytes (expected {WRAPPED_KEY_SIZE})",
            wrapped.len()
        )));
    }

    let (nonce_bytes, sealed) = wrapped.split_at(NONCE_SIZE);
    let cipher = Aes256Gcm::new(master.as_bytes().into());

    let mut plain = cipher
        .decrypt(Nonce::from_slice(nonce_bytes), sealed)
        .map_err(|_| {
            CipherError::key_unavailable(
                "unwrap failed: master key differs or wrapped key is corrupted",
            )
        })?;

    let mut bytes = [0u8; KEY_SIZE];
    bytes.copy_from_slice(&plain);
    plain.zeroize();
    Ok(ContentKey::from_bytes(bytes))
}

/// Key Provider holding its master key in process memory.
///
/// Suitable for tests and as the inner half of store-backed providers.
#[derive(Debug, Clone)]
pub struct SoftwareKeyProvider {
    master: MasterKey,
}

impl SoftwareKeyProvider {
    pub fn new(master: MasterKey) -> Self {
        Self { master }
    }

    /// Provider with a freshly generated master key.
    pub fn ephemeral() -> Self {
        Self::new(MasterKey::generate())
    }
}

impl KeyProvider for SoftwareKeyProvider {
    fn generate_content_key(&self) -> Result<ContentKey> {
        Ok(ContentKey::generate())
    }

    fn wrap_key(&self, key: &ContentKey) -> Result<Vec<u8>> {
        wrap_key(&self.master, key)
    }

    fn unwrap_key(&self, wrapped: &[u8]) -> Result<ContentKey> {
        unwrap_key(&self.master, wrapped)
    }
}

/// How a container's content key is managed.
#[derive(Clone, Copy)]
pub enum KeySource<'a> {
    /// Fresh per-file key, wrapped by the provider and embedded in the header.
    Wrapped(&'a dyn KeyProvider),
    /// Caller-managed key; the header carries none.
    External(&'a ContentKey),
}

impl std::fmt::Debug for KeySource<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KeySource::Wrapped(_) => f.write_str("KeySource::Wrapped"),
            KeySource::External(_) => f.write_str("KeySource::External"),
        }
    }
}

impl<'a> KeySource<'a> {
    /// Key to seal a new container with, plus the wrapped form to embed.
    pub(crate) fn for_encrypt(&self) -> Result<(ContentKey, Option<Vec<u8>>)> {
        match self {
            KeySource::Wrapped(provider) => {
                let key = provider.generate_content_key()?;
                let wrapped = provider.wrap_key(&key)?;
                Ok((key, Some(wrapped)))
            }
            KeySource::External(key) => Ok(((*key).clone(), None)),
        }
    }

    /// Key for a container whose header carries `wrapped` (or no key).
    pub(crate) fn for_decrypt(&self, wrapped: Option<&[u8]>) -> Result<ContentKey> {
        match (self, wrapped) {
            (KeySource::Wrapped(provider), Some(wrapped)) => provider.unwrap_key(wrapped),
            (KeySource::External(key), None) => Ok((*key).clone()),
            (KeySource::Wrapped(_), None) => Err(CipherError::key_unavailable(
                "container key is managed externally; no provider key applies",
            )),
            (KeySource::External(_), Some(_)) => Err(CipherError::key_unavailable(
                "container embeds a wrapped key; a key provider is required",
            )),
        }
    }

    /// The caller-managed key, required by the legacy codec.
    pub(crate) fn external(&self) -> Result<&'a ContentKey> {
        match self {
            KeySource::External(key) => Ok(*key),
            KeySource::Wrapped(_) => Err(CipherError::key_unavailable(
                "legacy blobs have no header to embed a key; an external key is required",
            )),
        }
    }
}
