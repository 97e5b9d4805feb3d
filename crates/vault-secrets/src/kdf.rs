//! Key derivation: Argon2id passphrase → key-encryption key

use argon2::{Algorithm, Argon2, Params, Version};
use secrecy::{ExposeSecret, SecretString};
use zeroize::Zeroizing;

use vault_crypto::KEY_SIZE;

/// Argon2id parameters for KDF
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KdfParams {
    /// Memory cost in KiB (default: 65536 = 64 MiB)
    pub mem_cost_kib: u32,
    /// Time cost / iterations (default: 3)
    pub time_cost: u32,
    /// Parallelism (default: 4)
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            mem_cost_kib: 65536,
            time_cost: 3,
            parallelism: 4,
        }
    }
}

impl From<&vault_core::config::KeysConfig> for KdfParams {
    fn from(keys: &vault_core::config::KeysConfig) -> Self {
        Self {
            mem_cost_kib: keys.argon2_mem_cost_kib,
            time_cost: keys.argon2_time_cost,
            parallelism: keys.argon2_parallelism,
        }
    }
}

/// Derive a 256-bit key from a passphrase and 16-byte salt using Argon2id.
pub fn derive_key(
    passphrase: &SecretString,
    salt: &[u8; 16],
    params: &KdfParams,
) -> anyhow::Result<Zeroizing<[u8; KEY_SIZE]>> {
    let argon2_params = Params::new(
        params.mem_cost_kib,
        params.time_cost,
        params.parallelism,
        Some(KEY_SIZE),
    )
    .map_err(|e| anyhow::anyhow!("invalid Argon2id params: {e}"))?;

    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, argon2_params);

    let mut key = Zeroizing::new([0u8; KEY_SIZE]);
    argon2
        .hash_password_into(passphrase.expose_secret().as_bytes(), salt, &mut key[..])
        .map_err(|e| anyhow::anyhow!("Argon2id KDF failed: {e}"))?;

    Ok(key)
}
