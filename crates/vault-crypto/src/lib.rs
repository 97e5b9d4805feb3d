//! vault-crypto: tamper-evident, seekable AES-256-GCM containers
//!
//! Two on-disk codecs share one key model:
//!
//! ```text
//! chunked (current):  header ── record 0 ── record 1 ── ... ── record n-1
//!                      record = nonce(12) | ctLen(4) | ciphertext | tag(16)
//!                      no associated data
//! legacy (read-compat): nonce(12) ── AES-GCM stream over the whole file ── tag(16)
//! ```
//!
//! Key hierarchy:
//! ```text
//! Device master key (KeyProvider: keychain, key file, or in-memory)
//!   └── Content key (per file, 256-bit random, wrapped into the header)
//!       or an externally managed content key (wrappedKeyLen = 0, legacy blobs)
//! ```
//!
//! Sequential access goes through [`chunked`] and [`legacy`]; seeking
//! consumers open a [`reader::RandomAccessReader`]. Cancellation and progress
//! flow through [`progress::Monitor`], checked once per chunk.

pub mod chunked;
pub mod error;
pub mod file;
pub mod format;
pub mod keys;
pub mod legacy;
pub mod progress;
pub mod reader;
pub mod worker;

pub use chunked::{decrypt, encrypt, EncryptOptions};
pub use error::{CipherError, FormatError, Result};
pub use file::{
    decrypt_any, decrypt_file, decrypt_to_temp, decrypt_to_vec, encrypt_file, FileMode, FileOptions,
};
pub use format::{detect_format, ContainerHeader, ContainerKind};
pub use keys::{ContentKey, KeyProvider, KeySource, MasterKey, SoftwareKeyProvider};
pub use progress::{Monitor, Progress};
pub use reader::{ChunkIndex, ChunkIndexEntry, PlaintextCursor, RandomAccessReader};
pub use worker::{spawn_decrypt, spawn_encrypt, JobHandle, OwnedKeySource};
pub use tokio_util::sync::CancellationToken;

/// "VMVP"
pub const MAGIC: [u8; 4] = *b"VMVP";

/// The only container version this build reads or writes.
pub const VERSION: u8 = 1;

/// `totalPlaintext` value for streams of unknown length.
pub const UNKNOWN_TOTAL: u64 = u64::MAX;

/// Default plaintext bytes per chunk (1 MiB)
pub const DEFAULT_CHUNK_SIZE: u32 = 1024 * 1024;

/// AES-256 key size in bytes
pub const KEY_SIZE: usize = 32;

/// AES-GCM nonce size (96-bit)
pub const NONCE_SIZE: usize = 12;

/// GCM authentication tag size
pub const TAG_SIZE: usize = 16;

/// Outcome of a completed encrypt or decrypt run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Summary {
    pub kind: ContainerKind,
    /// Records written or read; zero for legacy blobs.
    pub chunks: u64,
    pub plaintext_bytes: u64,
}
