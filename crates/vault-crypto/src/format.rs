//! Container header and chunk record framing.
//!
//! Layout (little-endian throughout):
//! ```text
//! Header:
//!   magic            4 bytes   "VMVP"
//!   version          1 byte    currently 1
//!   chunkSizeBytes   4 bytes   plaintext bytes per chunk
//!   totalPlaintext   8 bytes   u64::MAX means "unknown"
//!   wrappedKeyLen    2 bytes   0 if the key is managed externally
//!   wrappedKey       wrappedKeyLen bytes
//!
//! Repeated ChunkRecord:
//!   nonce            12 bytes
//!   ciphertextLen    4 bytes   excludes the tag
//!   ciphertext       ciphertextLen bytes
//!   tag              16 bytes
//! ```

use std::io::{self, Read, Seek, SeekFrom, Write};

use crate::error::{CipherError, FormatError, Result};
use crate::{MAGIC, NONCE_SIZE, TAG_SIZE, UNKNOWN_TOTAL, VERSION};

/// magic + version + chunk size + total + wrapped key length
pub const FIXED_HEADER_LEN: usize = 4 + 1 + 4 + 8 + 2;

/// nonce + ciphertext length, read before the payload
pub const RECORD_PREFIX_LEN: usize = NONCE_SIZE + 4;

/// Bytes a record occupies on disk beyond its ciphertext
pub const RECORD_OVERHEAD: usize = RECORD_PREFIX_LEN + TAG_SIZE;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerHeader {
    pub version: u8,
    /// Plaintext bytes per chunk; only the final chunk may be shorter.
    pub chunk_size: u32,
    /// `None` when the producer did not know the stream length.
    pub total_plaintext: Option<u64>,
    /// Present only when the per-file key is embedded.
    pub wrapped_key: Option<Vec<u8>>,
}

impl ContainerHeader {
    pub fn new(
        chunk_size: u32,
        total_plaintext: Option<u64>,
        wrapped_key: Option<Vec<u8>>,
    ) -> Self {
        Self {
            version: VERSION,
            chunk_size,
            total_plaintext,
            wrapped_key: wrapped_key.filter(|k| !k.is_empty()),
        }
    }

    /// Size of the encoded header, i.e. the file offset of the first record.
    pub fn encoded_len(&self) -> usize {
        FIXED_HEADER_LEN + self.wrapped_key.as_ref().map_or(0, Vec::len)
    }

    /// Number of records a complete container holds, if the total is known.
    pub fn chunk_count(&self) -> Option<u64> {
        self.total_plaintext
            .map(|total| total.div_ceil(u64::from(self.chunk_size)))
    }

    /// Plaintext length record `index` must decrypt to, if the total is known.
    pub fn expected_chunk_len(&self, index: u64) -> Option<u32> {
        let total = self.total_plaintext?;
        let start = index.checked_mul(u64::from(self.chunk_size))?;
        let remaining = total.checked_sub(start)?;
        Some(remaining.min(u64::from(self.chunk_size)) as u32)
    }

    /// Check record `index`'s ciphertext length against the header before
    /// anything is allocated for it.
    ///
    /// With a known total the length must be exactly the chunk's share. With
    /// an unknown total it must be `1..=chunk_size`, and only the last record
    /// may be short (`after_short` says a short record was already seen).
    pub fn check_record_len(
        &self,
        index: u64,
        ciphertext_len: u32,
        after_short: bool,
    ) -> std::result::Result<(), FormatError> {
        let mismatch = |expected: String| FormatError::RecordLength {
            index,
            expected,
            found: ciphertext_len,
        };
        if self.total_plaintext.is_some() {
            return match self.expected_chunk_len(index) {
                Some(expected) if expected == ciphertext_len && expected > 0 => Ok(()),
                Some(expected) => Err(mismatch(expected.to_string())),
                None => Err(mismatch("no record past the declared total".into())),
            };
        }
        if after_short {
            return Err(mismatch("end of stream after a short record".into()));
        }
        if ciphertext_len == 0 || ciphertext_len > self.chunk_size {
            return Err(mismatch(format!("1..={}", self.chunk_size)));
        }
        Ok(())
    }

    pub fn encode(&self) -> std::result::Result<Vec<u8>, FormatError> {
        encode_header(
            self.chunk_size,
            self.total_plaintext,
            self.wrapped_key.as_deref(),
        )
    }
}

/// Encode a version-1 header.
pub fn encode_header(
    chunk_size: u32,
    total_plaintext: Option<u64>,
    wrapped_key: Option<&[u8]>,
) -> std::result::Result<Vec<u8>, FormatError> {
    if chunk_size == 0 {
        return Err(FormatError::InvalidChunkSize);
    }
    let key = wrapped_key.unwrap_or_default();
    let key_len = u16::try_from(key.len()).map_err(|_| FormatError::KeyTooLarge(key.len()))?;

    let mut out = Vec::with_capacity(FIXED_HEADER_LEN + key.len());
    out.extend_from_slice(&MAGIC);
    out.push(VERSION);
    out.extend_from_slice(&chunk_size.to_le_bytes());
    out.extend_from_slice(&total_plaintext.unwrap_or(UNKNOWN_TOTAL).to_le_bytes());
    out.extend_from_slice(&key_len.to_le_bytes());
    out.extend_from_slice(key);
    Ok(out)
}

/// Decode a header from the start of `bytes`.
///
/// Returns the header and the number of bytes it occupies.
pub fn decode_header(bytes: &[u8]) -> std::result::Result<(ContainerHeader, usize), FormatError> {
    let (chunk_size, total_plaintext, key_len) = parse_fixed(bytes)?;
    let header_len = FIXED_HEADER_LEN + key_len;
    if bytes.len() < header_len {
        return Err(FormatError::Truncated {
            what: "wrapped key",
            needed: header_len,
            got: bytes.len(),
        });
    }
    let wrapped = (key_len > 0).then(|| bytes[FIXED_HEADER_LEN..header_len].to_vec());
    Ok((
        ContainerHeader {
            version: VERSION,
            chunk_size,
            total_plaintext,
            wrapped_key: wrapped,
        },
        header_len,
    ))
}

/// Validate magic and version before length, so a foreign or future file is
/// reported as such even when it is short.
fn parse_fixed(bytes: &[u8]) -> std::result::Result<(u32, Option<u64>, usize), FormatError> {
    if bytes.len() < MAGIC.len() {
        return Err(FormatError::Truncated {
            what: "header",
            needed: FIXED_HEADER_LEN,
            got: bytes.len(),
        });
    }
    let found: [u8; 4] = field(bytes, 0);
    if found != MAGIC {
        return Err(FormatError::BadMagic {
            expected: MAGIC,
            found,
        });
    }
    match bytes.get(4) {
        Some(&VERSION) => {}
        Some(&other) => return Err(FormatError::UnsupportedVersion(other)),
        None => {
            return Err(FormatError::Truncated {
                what: "header",
                needed: FIXED_HEADER_LEN,
                got: bytes.len(),
            })
        }
    }
    if bytes.len() < FIXED_HEADER_LEN {
        return Err(FormatError::Truncated {
            what: "header",
            needed: FIXED_HEADER_LEN,
            got: bytes.len(),
        });
    }

    let chunk_size = u32::from_le_bytes(field(bytes, 5));
    let total = u64::from_le_bytes(field(bytes, 9));
    let key_len = u16::from_le_bytes(field(bytes, 17));

    if chunk_size == 0 {
        return Err(FormatError::InvalidChunkSize);
    }
    let total = (total != UNKNOWN_TOTAL).then_some(total);
    Ok((chunk_size, total, usize::from(key_len)))
}

/// Copy `N` bytes at `at`; callers have checked the length.
fn field<const N: usize>(bytes: &[u8], at: usize) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes[at..at + N]);
    out
}

/// Read and validate a header from the current position of `r`.
pub fn read_header<R: Read>(r: &mut R) -> Result<ContainerHeader> {
    let mut fixed = [0u8; FIXED_HEADER_LEN];
    let got = read_full(r, &mut fixed)?;
    let (chunk_size, total_plaintext, key_len) = parse_fixed(&fixed[..got])?;

    let wrapped_key = if key_len > 0 {
        let mut key = vec![0u8; key_len];
        let got = read_full(r, &mut key)?;
        if got < key_len {
            return Err(FormatError::Truncated {
                what: "wrapped key",
                needed: key_len,
                got,
            }
            .into());
        }
        Some(key)
    } else {
        None
    };

    Ok(ContainerHeader {
        version: VERSION,
        chunk_size,
        total_plaintext,
        wrapped_key,
    })
}

/// One sealed chunk as it sits on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkRecord {
    pub nonce: [u8; NONCE_SIZE],
    pub ciphertext: Vec<u8>,
    pub tag: [u8; TAG_SIZE],
}

impl ChunkRecord {
    pub fn encoded_len(&self) -> usize {
        RECORD_OVERHEAD + self.ciphertext.len()
    }

    pub fn encode(&self) -> io::Result<Vec<u8>> {
        let mut out = Vec::with_capacity(self.encoded_len());
        write_record(&mut out, &self.nonce, &self.ciphertext, &self.tag)?;
        Ok(out)
    }
}

/// The fixed-size front of a record: enough to locate or size its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordPrefix {
    pub nonce: [u8; NONCE_SIZE],
    pub ciphertext_len: u32,
}

/// Write one record: nonce, length, ciphertext, tag.
pub fn write_record<W: Write>(
    w: &mut W,
    nonce: &[u8; NONCE_SIZE],
    ciphertext: &[u8],
    tag: &[u8; TAG_SIZE],
) -> io::Result<()> {
    let len = record_len(ciphertext.len())?;
    w.write_all(nonce)?;
    w.write_all(&len.to_le_bytes())?;
    w.write_all(ciphertext)?;
    w.write_all(tag)
}

/// The on-disk length field for `len` ciphertext bytes.
fn record_len(len: usize) -> io::Result<u32> {
    u32::try_from(len).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("record of {len} bytes exceeds the u32 length field"),
        )
    })
}

/// Read a record prefix.
///
/// `Ok(None)` is a clean end of stream: not a single byte of a new record was
/// present. Running out partway through the prefix is `Truncated`.
pub fn read_record_prefix<R: Read>(r: &mut R) -> Result<Option<RecordPrefix>> {
    let mut buf = [0u8; RECORD_PREFIX_LEN];
    let got = read_full(r, &mut buf)?;
    if got == 0 {
        return Ok(None);
    }
    if got < RECORD_PREFIX_LEN {
        return Err(FormatError::Truncated {
            what: "record prefix",
            needed: RECORD_PREFIX_LEN,
            got,
        }
        .into());
    }
    let mut nonce = [0u8; NONCE_SIZE];
    nonce.copy_from_slice(&buf[..NONCE_SIZE]);
    let mut len = [0u8; 4];
    len.copy_from_slice(&buf[NONCE_SIZE..]);
    let ciphertext_len = u32::from_le_bytes(len);
    Ok(Some(RecordPrefix {
        nonce,
        ciphertext_len,
    }))
}

/// Read exactly `prefix.ciphertext_len` ciphertext bytes and the tag.
pub fn read_record_body<R: Read>(r: &mut R, prefix: RecordPrefix) -> Result<ChunkRecord> {
    let len = prefix.ciphertext_len as usize;
    let mut ciphertext = vec![0u8; len];
    let got = read_full(r, &mut ciphertext)?;
    if got < len {
        return Err(FormatError::Truncated {
            what: "record ciphertext",
            needed: len,
            got,
        }
        .into());
    }
    let mut tag = [0u8; TAG_SIZE];
    let got = read_full(r, &mut tag)?;
    if got < TAG_SIZE {
        return Err(FormatError::Truncated {
            what: "record tag",
            needed: TAG_SIZE,
            got,
        }
        .into());
    }
    Ok(ChunkRecord {
        nonce: prefix.nonce,
        ciphertext,
        tag,
    })
}

/// Read a whole record; `Ok(None)` at a clean end of stream.
pub fn read_record<R: Read>(r: &mut R) -> Result<Option<ChunkRecord>> {
    match read_record_prefix(r)? {
        Some(prefix) => read_record_body(r, prefix).map(Some),
        None => Ok(None),
    }
}

/// Decode one record from the front of `bytes`.
///
/// Returns `Ok(None)` for empty input, otherwise the record and its length.
pub fn decode_record(
    bytes: &[u8],
) -> std::result::Result<Option<(ChunkRecord, usize)>, FormatError> {
    let mut cursor = bytes;
    match read_record(&mut cursor) {
        Ok(Some(record)) => {
            let used = bytes.len() - cursor.len();
            Ok(Some((record, used)))
        }
        Ok(None) => Ok(None),
        Err(CipherError::Format(e)) => Err(e),
        // Reading from a slice cannot fail with an I/O error.
        Err(e) => unreachable!("slice read failed: {e}"),
    }
}

/// Which codec produced a blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerKind {
    /// Header + chunk records.
    Chunked,
    /// 12-byte nonce followed by one AES-GCM stream.
    Legacy,
}

/// Sniff the magic and rewind to the start.
///
/// A legacy blob starts with a random nonce, so it collides with the magic
/// with probability 2^-32.
pub fn detect_format<R: Read + Seek>(r: &mut R) -> Result<ContainerKind> {
    r.seek(SeekFrom::Start(0))?;
    let mut magic = [0u8; 4];
    let got = read_full(r, &mut magic)?;
    r.seek(SeekFrom::Start(0))?;
    if got == magic.len() && magic == MAGIC {
        Ok(ContainerKind::Chunked)
    } else {
        Ok(ContainerKind::Legacy)
    }
}

/// Fill `buf` as far as the source allows; returns bytes read.
///
/// Short count only at end of stream.
pub(crate) fn read_full<R: Read>(r: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match r.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
