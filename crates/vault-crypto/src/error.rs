//! Error taxonomy for the container codec.
//!
//! `FormatError` means the bytes are not a container this build can parse.
//! `CipherError` covers everything an engine or reader operation can fail with,
//! including format problems found along the way.

use thiserror::Error;

pub type Result<T, E = CipherError> = std::result::Result<T, E>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FormatError {
    #[error("bad magic: expected {expected:02x?}, found {found:02x?}")]
    BadMagic { expected: [u8; 4], found: [u8; 4] },

    #[error("unsupported container version {0}")]
    UnsupportedVersion(u8),

    #[error("truncated {what}: needed {needed} bytes, got {got}")]
    Truncated {
        what: &'static str,
        needed: usize,
        got: usize,
    },

    #[error("wrapped key is {0} bytes, header length field holds at most 65535")]
    KeyTooLarge(usize),

    #[error("header declares a chunk size of zero")]
    InvalidChunkSize,

    #[error("record {index} carries {found} ciphertext bytes, expected {expected}")]
    RecordLength {
        index: u64,
        expected: String,
        found: u32,
    },
}

#[derive(Debug, Error)]
pub enum CipherError {
    #[error("file is corrupted or has been tampered with (authentication failed{})",
        .chunk.map(|c| format!(" at chunk {c}")).unwrap_or_default())]
    AuthenticationFailed { chunk: Option<u64> },

    #[error("operation cancelled")]
    Cancelled,

    #[error("content key unavailable: {0}")]
    KeyUnavailable(String),

    #[error("container truncated mid-record")]
    Truncated,

    #[error(transparent)]
    Format(#[from] FormatError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CipherError {
    /// `Cancelled` is an expected outcome the caller turns into cleanup.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, CipherError::Cancelled)
    }

    pub fn is_auth_failure(&self) -> bool {
        matches!(self, CipherError::AuthenticationFailed { .. })
    }

    pub(crate) fn key_unavailable(msg: impl Into<String>) -> Self {
        CipherError::KeyUnavailable(msg.into())
    }
}

/// Surface codec failures through `std::io` adapters such as the plaintext cursor.
impl From<CipherError> for std::io::Error {
    fn from(err: CipherError) -> Self {
        use std::io::ErrorKind;
        match err {
            CipherError::Io(e) => e,
            CipherError::Truncated => std::io::Error::new(ErrorKind::UnexpectedEof, err),
            CipherError::Cancelled => std::io::Error::other(err),
            CipherError::KeyUnavailable(_) => {
                std::io::Error::new(ErrorKind::PermissionDenied, err)
            }
            other => std::io::Error::new(ErrorKind::InvalidData, other),
        }
    }
}
