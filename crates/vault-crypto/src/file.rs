//! Path-level encrypt and decrypt with cleanup.
//!
//! The stream engines leave partial output behind on failure. These wrappers
//! own the files involved: a failed encrypt removes its partial container, and
//! decryption goes through a temporary file that only replaces the destination
//! once every chunk (or the legacy tag) has authenticated.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;

use tempfile::NamedTempFile;
use tracing::{debug, warn};
use zeroize::Zeroizing;

use crate::chunked::{self, EncryptOptions};
use crate::error::{CipherError, Result};
use crate::format::{detect_format, ContainerKind};
use crate::keys::KeySource;
use crate::legacy;
use crate::progress::Monitor;
use crate::{Summary, DEFAULT_CHUNK_SIZE, NONCE_SIZE};

/// Buffered I/O size for file operations (512 KiB).
const IO_BUFFER_SIZE: usize = 512 * 1024;

/// Container format to produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FileMode {
    #[default]
    Chunked,
    /// Single-stream AES-GCM, for readers that predate the chunked format.
    Legacy,
}

#[derive(Debug, Clone, Copy)]
pub struct FileOptions {
    pub mode: FileMode,
    /// Plaintext bytes per chunk; ignored in legacy mode.
    pub chunk_size: u32,
}

impl Default for FileOptions {
    fn default() -> Self {
        Self {
            mode: FileMode::Chunked,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

/// Encrypt the file at `src` into a new container at `dst`.
///
/// The source length becomes the declared total. On any failure, including
/// cancellation, the partial container is deleted before the error returns.
pub fn encrypt_file(
    src: &Path,
    dst: &Path,
    options: &FileOptions,
    keys: KeySource<'_>,
    monitor: &mut Monitor<'_>,
) -> Result<Summary> {
    let input = File::open(src)?;
    let total = input.metadata()?.len();
    let output = File::create(dst)?;

    debug!(
        src = %src.display(),
        dst = %dst.display(),
        mode = ?options.mode,
        bytes = total,
        "encrypt_file"
    );

    match encrypt_into(input, output, total, options, keys, monitor) {
        Ok(summary) => Ok(summary),
        Err(e) => {
            remove_partial(dst);
            Err(e)
        }
    }
}

fn encrypt_into(
    input: File,
    output: File,
    total: u64,
    options: &FileOptions,
    keys: KeySource<'_>,
    monitor: &mut Monitor<'_>,
) -> Result<Summary> {
    let mut reader = BufReader::with_capacity(IO_BUFFER_SIZE, input);
    let mut writer = BufWriter::with_capacity(IO_BUFFER_SIZE, output);

    let summary = match options.mode {
        FileMode::Chunked => chunked::encrypt(
            &mut reader,
            &mut writer,
            &EncryptOptions {
                chunk_size: options.chunk_size,
                total_plaintext: Some(total),
            },
            keys,
            monitor,
        )?,
        FileMode::Legacy => {
            let key = keys.external()?;
            legacy::encrypt_legacy(&mut reader, &mut writer, key, Some(total), monitor)?
        }
    };

    let output = writer.into_inner().map_err(|e| e.into_error())?;
    output.sync_all()?;
    Ok(summary)
}

fn remove_partial(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        warn!(path = %path.display(), "failed to remove partial container: {e}");
    } else {
        debug!(path = %path.display(), "removed partial container");
    }
}

/// Decrypt whichever format `src` holds into `dst`.
///
/// Chunked containers are recognized by their magic; anything else is read
/// as a legacy blob, which needs an external key. The legacy progress estimate
/// uses the stream length minus the nonce.
pub fn decrypt_any<R: Read + Seek, W: Write>(
    src: &mut R,
    dst: &mut W,
    keys: KeySource<'_>,
    monitor: &mut Monitor<'_>,
) -> Result<Summary> {
    match detect_format(src)? {
        ContainerKind::Chunked => chunked::decrypt(src, dst, keys, monitor),
        ContainerKind::Legacy => {
            let key = keys.external()?;
            let len = src.seek(SeekFrom::End(0))?;
            src.seek(SeekFrom::Start(0))?;
            let ciphertext_len = len.saturating_sub(NONCE_SIZE as u64);
            legacy::decrypt_legacy(src, dst, key, Some(ciphertext_len), monitor)
        }
    }
}

/// Decrypt the container at `src` to `dst`.
///
/// Plaintext is staged in a temporary file beside `dst` and renamed into
/// place on success. On failure `dst` is left untouched.
pub fn decrypt_file(
    src: &Path,
    dst: &Path,
    keys: KeySource<'_>,
    monitor: &mut Monitor<'_>,
) -> Result<Summary> {
    let mut reader = BufReader::with_capacity(IO_BUFFER_SIZE, File::open(src)?);
    let dir = match dst.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut staged = NamedTempFile::new_in(dir)?;

    debug!(src = %src.display(), dst = %dst.display(), "decrypt_file");

    let result = {
        let mut writer = BufWriter::with_capacity(IO_BUFFER_SIZE, staged.as_file_mut());
        decrypt_any(&mut reader, &mut writer, keys, monitor).and_then(|summary| {
            writer.into_inner().map_err(|e| e.into_error())?.sync_all()?;
            Ok(summary)
        })
    };

    match result {
        Ok(summary) => {
            staged.persist(dst).map_err(|e| CipherError::Io(e.error))?;
            Ok(summary)
        }
        Err(e) => {
            if let Err(close_err) = staged.close() {
                warn!("failed to remove staged plaintext: {close_err}");
            }
            Err(e)
        }
    }
}

/// Decrypt a whole container into memory. The buffer is wiped when dropped,
/// including on the error path.
///
/// Plaintext is never longer than the container, so the buffer is sized from
/// the file length up front and never reallocates, leaving no unwiped copies.
pub fn decrypt_to_vec(
    src: &Path,
    keys: KeySource<'_>,
    monitor: &mut Monitor<'_>,
) -> Result<Zeroizing<Vec<u8>>> {
    let file = File::open(src)?;
    let capacity = usize::try_from(file.metadata()?.len()).map_err(|_| {
        std::io::Error::new(
            std::io::ErrorKind::OutOfMemory,
            "container is too large to decrypt into memory",
        )
    })?;
    let mut reader = BufReader::with_capacity(IO_BUFFER_SIZE, file);
    let mut out = Zeroizing::new(Vec::with_capacity(capacity));
    decrypt_any(&mut reader, &mut *out, keys, monitor)?;
    Ok(out)
}

/// Decrypt into an anonymous-path temporary file, rewound to the start.
///
/// The file is removed when the returned handle drops.
pub fn decrypt_to_temp(
    src: &Path,
    keys: KeySource<'_>,
    monitor: &mut Monitor<'_>,
) -> Result<NamedTempFile> {
    let mut reader = BufReader::with_capacity(IO_BUFFER_SIZE, File::open(src)?);
    let mut staged = NamedTempFile::new()?;
    {
        let mut writer = BufWriter::with_capacity(IO_BUFFER_SIZE, staged.as_file_mut());
        decrypt_any(&mut reader, &mut writer, keys, monitor)?;
        writer.into_inner().map_err(|e| e.into_error())?;
    }
    staged.as_file_mut().seek(SeekFrom::Start(0))?;
    Ok(staged)
}
