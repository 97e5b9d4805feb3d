//! Passphrase-sealed master key file.
//!
//! For hosts without a usable platform keychain. The master key is sealed
//! with AES-256-GCM under a key derived from the passphrase with Argon2id;
//! salt, nonce and KDF parameters are stored alongside as JSON.

use std::path::{Path, PathBuf};

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine};
use rand::RngCore;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use vault_crypto::{MasterKey, KEY_SIZE, NONCE_SIZE};

use crate::kdf::{derive_key, KdfParams};
use crate::provider::{MasterKeyStore, StoredKeyProvider};

/// Key-file-backed Key Provider.
pub type KeyFileProvider = StoredKeyProvider<KeyFileStore>;

const KEY_FILE_VERSION: u32 = 1;

/// On-disk layout of a sealed master key.
#[derive(Debug, Serialize, Deserialize)]
struct SealedKeyFile {
    version: u32,
    kdf: String,
    mem_cost_kib: u32,
    time_cost: u32,
    parallelism: u32,
    salt: String,
    nonce: String,
    ciphertext: String,
}

pub struct KeyFileStore {
    path: PathBuf,
    passphrase: SecretString,
    /// Used when sealing a new file; existing files carry their own.
    params: KdfParams,
}

impl std::fmt::Debug for KeyFileStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyFileStore")
            .field("path", &self.path)
            .field("params", &self.params)
            .finish_non_exhaustive()
    }
}

impl KeyFileStore {
    pub fn new(path: impl Into<PathBuf>, passphrase: SecretString, params: KdfParams) -> Self {
        Self {
            path: path.into(),
            passphrase,
            params,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl MasterKeyStore for KeyFileStore {
    fn load(&self) -> Result<Option<MasterKey>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&self.path)
            .with_context(|| format!("reading key file: {}", self.path.display()))?;
        let sealed: SealedKeyFile = serde_json::from_str(&content)
            .with_context(|| format!("parsing key file: {}", self.path.display()))?;
        open(&sealed, &self.passphrase).map(Some)
    }

    fn store(&self, key: &MasterKey) -> Result<()> {
        let sealed = seal(key, &self.passphrase, &self.params)?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let json = serde_json::to_string_pretty(&sealed)?;
        std::fs::write(&self.path, json)
            .with_context(|| format!("writing key file: {}", self.path.display()))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&self.path, std::fs::Permissions::from_mode(0o600))?;
        }

        tracing::debug!(path = %self.path.display(), "sealed master key to file");
        Ok(())
    }

    fn describe(&self) -> String {
        format!("key file {}", self.path.display())
    }
}

fn seal(key: &MasterKey, passphrase: &SecretString, params: &KdfParams) -> Result<SealedKeyFile> {
    let mut salt = [0u8; 16];
    let mut nonce = [0u8; NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut salt);
    rand::thread_rng().fill_bytes(&mut nonce);

    let kek = derive_key(passphrase, &salt, params)?;
    let cipher = Aes256Gcm::new((&*kek).into());
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), key.as_bytes().as_ref())
        .map_err(|e| anyhow::anyhow!("sealing master key: {e}"))?;

    Ok(SealedKeyFile {
        version: KEY_FILE_VERSION,
        kdf: "argon2id".into(),
        mem_cost_kib: params.mem_cost_kib,
        time_cost: params.time_cost,
        parallelism: params.parallelism,
        salt: STANDARD.encode(salt),
        nonce: STANDARD.encode(nonce),
        ciphertext: STANDARD.encode(ciphertext),
    })
}

fn open(sealed: &SealedKeyFile, passphrase: &SecretString) -> Result<MasterKey> {
    if sealed.version != KEY_FILE_VERSION || sealed.kdf != "argon2id" {
        anyhow::bail!(
            "unsupported key file (version {}, kdf {})",
            sealed.version,
            sealed.kdf
        );
    }
    let salt: [u8; 16] = decode_fixed(&sealed.salt, "salt")?;
    let nonce: [u8; NONCE_SIZE] = decode_fixed(&sealed.nonce, "nonce")?;
    let ciphertext = STANDARD
        .decode(&sealed.ciphertext)
        .context("key file ciphertext is not valid base64")?;

    let params = KdfParams {
        mem_cost_kib: sealed.mem_cost_kib,
        time_cost: sealed.time_cost,
        parallelism: sealed.parallelism,
    };
    let kek = derive_key(passphrase, &salt, &params)?;
    let cipher = Aes256Gcm::new((&*kek).into());
    let plain = Zeroizing::new(
        cipher
            .decrypt(Nonce::from_slice(&nonce), ciphertext.as_slice())
            .map_err(|_| anyhow::anyhow!("wrong passphrase or corrupted key file"))?,
    );

    let bytes: [u8; KEY_SIZE] = plain
        .as_slice()
        .try_into()
        .map_err(|_| anyhow::anyhow!("sealed master key has the wrong length"))?;
    Ok(MasterKey::from_bytes(bytes))
}

fn decode_fixed<const N: usize>(encoded: &str, what: &str) -> Result<[u8; N]> {
    let raw = STANDARD
        .decode(encoded)
        .with_context(|| format!("key file {what} is not valid base64"))?;
    raw.as_slice()
        .try_into()
        .map_err(|_| anyhow::anyhow!("key file {what} is {} bytes (expected {N})", raw.len()))
}

impl KeyFileProvider {
    pub fn key_file(path: impl Into<PathBuf>, passphrase: SecretString, params: KdfParams) -> Self {
        StoredKeyProvider::new(KeyFileStore::new(path, passphrase, params))
    }
}
