//! Random access into a chunked container.
//!
//! Opening a reader validates the header, resolves the content key and scans
//! the records once, reading only each 4-byte length and seeking past the
//! payload. Reads then decrypt just the chunks that overlap the requested
//! range; chunks are atomic AEAD units, so a partial read still opens the
//! whole chunk. Nothing is cached across [`RandomAccessReader::read_at`] calls.

use std::io::{self, Read, Seek, SeekFrom};

use tracing::debug;

use crate::chunked::{mid_record, ChunkCipher};
use crate::error::{CipherError, FormatError, Result};
use crate::format::{
    read_full, read_header, read_record_body, read_record_prefix, ContainerHeader, RECORD_OVERHEAD,
};
use crate::keys::KeySource;
use crate::progress::Monitor;
use crate::NONCE_SIZE;

/// Location of one record inside the container file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkIndexEntry {
    /// File offset of the record's nonce.
    pub record_offset: u64,
    /// Ciphertext bytes, excluding the tag. Equal to the chunk's plaintext length.
    pub ciphertext_len: u32,
}

/// In-memory offset table for a container. Needs no key to build.
#[derive(Debug, Clone)]
pub struct ChunkIndex {
    header: ContainerHeader,
    entries: Vec<ChunkIndexEntry>,
    plaintext_len: u64,
    container_len: u64,
}

impl ChunkIndex {
    /// Read the header at offset 0 and index every record.
    pub fn scan<R: Read + Seek>(source: &mut R) -> Result<Self> {
        source.seek(SeekFrom::Start(0))?;
        let header = read_header(source)?;
        Self::build(source, header)
    }

    /// Index records following an already-decoded `header`.
    ///
    /// With a known total the scan stops once the declared plaintext is
    /// covered; otherwise it runs to end of file, which must fall exactly on
    /// a record boundary.
    pub fn build<R: Read + Seek>(source: &mut R, header: ContainerHeader) -> Result<Self> {
        let container_len = source.seek(SeekFrom::End(0))?;
        let mut pos = header.encoded_len() as u64;
        let mut produced = 0u64;
        let mut after_short = false;
        // The header is untrusted: never reserve more entries than the file can hold.
        let room = container_len.saturating_sub(pos) / RECORD_OVERHEAD as u64;
        let capacity = header.chunk_count().unwrap_or(0).min(room);
        let mut entries = Vec::with_capacity(capacity as usize);
        let mut len_buf = [0u8; 4];

        loop {
            match header.total_plaintext {
                Some(total) if produced >= total => break,
                None if pos == container_len => break,
                _ => {}
            }
            if pos + RECORD_OVERHEAD as u64 > container_len {
                return Err(CipherError::Truncated);
            }

            source.seek(SeekFrom::Start(pos + NONCE_SIZE as u64))?;
            if read_full(source, &mut len_buf)? < len_buf.len() {
                return Err(CipherError::Truncated);
            }
            let ciphertext_len = u32::from_le_bytes(len_buf);
            let index = entries.len() as u64;
            header.check_record_len(index, ciphertext_len, after_short)?;

            let end = pos + RECORD_OVERHEAD as u64 + u64::from(ciphertext_len);
            if end > container_len {
                return Err(CipherError::Truncated);
            }

            entries.push(ChunkIndexEntry {
                record_offset: pos,
                ciphertext_len,
            });
            produced += u64::from(ciphertext_len);
            after_short = ciphertext_len < header.chunk_size;
            pos = end;
        }

        debug!(
            chunks = entries.len(),
            plaintext = produced,
            container = container_len,
            "chunk index built"
        );

        Ok(Self {
            header,
            entries,
            plaintext_len: produced,
            container_len,
        })
    }

    pub fn header(&self) -> &ContainerHeader {
        &self.header
    }

    pub fn entries(&self) -> &[ChunkIndexEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Logical plaintext length covered by the indexed records.
    pub fn plaintext_len(&self) -> u64 {
        self.plaintext_len
    }

    /// Total container size on disk, including any trailing bytes.
    pub fn container_len(&self) -> u64 {
        self.container_len
    }
}

/// Seekable plaintext view over one chunked container.
///
/// Owns its source exclusively for its lifetime. Dropping or
/// [`close`](Self::close)-ing releases the handle and the key schedule.
pub struct RandomAccessReader<R> {
    source: R,
    index: ChunkIndex,
    cipher: ChunkCipher,
}

impl<R> std::fmt::Debug for RandomAccessReader<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RandomAccessReader")
            .field("chunks", &self.index.len())
            .field("plaintext_len", &self.index.plaintext_len())
            .finish_non_exhaustive()
    }
}

impl<R: Read + Seek> RandomAccessReader<R> {
    /// Validate the header, obtain the content key, then index the records.
    pub fn open(mut source: R, keys: KeySource<'_>) -> Result<Self> {
        source.seek(SeekFrom::Start(0))?;
        let header = read_header(&mut source)?;
        let key = keys.for_decrypt(header.wrapped_key.as_deref())?;
        let index = ChunkIndex::build(&mut source, header)?;
        Ok(Self {
            source,
            index,
            cipher: ChunkCipher::new(&key),
        })
    }

    pub fn index(&self) -> &ChunkIndex {
        &self.index
    }

    /// Logical plaintext length.
    pub fn len(&self) -> u64 {
        self.index.plaintext_len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn chunk_size(&self) -> u32 {
        self.index.header().chunk_size
    }

    pub fn chunk_count(&self) -> usize {
        self.index.len()
    }

    /// Decrypt one whole chunk.
    pub fn read_chunk(&mut self, index: usize) -> Result<Vec<u8>> {
        let entry = *self.index.entries.get(index).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("chunk {index} out of range ({} chunks)", self.index.len()),
            )
        })?;

        self.source.seek(SeekFrom::Start(entry.record_offset))?;
        let prefix = read_record_prefix(&mut self.source)
            .map_err(mid_record)?
            .ok_or(CipherError::Truncated)?;
        if prefix.ciphertext_len != entry.ciphertext_len {
            // The file changed underneath the index.
            return Err(FormatError::RecordLength {
                index: index as u64,
                expected: entry.ciphertext_len.to_string(),
                found: prefix.ciphertext_len,
            }
            .into());
        }
        let record = read_record_body(&mut self.source, prefix).map_err(mid_record)?;
        self.cipher.open(index as u64, record)
    }

    /// Plaintext bytes `[offset, offset + len)`, clamped at the end.
    ///
    /// Returns fewer bytes than requested (possibly none) past the end.
    pub fn read_at(&mut self, offset: u64, len: usize) -> Result<Vec<u8>> {
        self.read_range(offset, len, None)
    }

    /// [`read_at`](Self::read_at) that checks `monitor` for cancellation
    /// before each chunk it opens.
    pub fn read_at_with(
        &mut self,
        offset: u64,
        len: usize,
        monitor: &Monitor<'_>,
    ) -> Result<Vec<u8>> {
        self.read_range(offset, len, Some(monitor))
    }

    fn read_range(
        &mut self,
        offset: u64,
        len: usize,
        monitor: Option<&Monitor<'_>>,
    ) -> Result<Vec<u8>> {
        let total = self.len();
        if offset >= total || len == 0 {
            return Ok(Vec::new());
        }
        let end = offset.saturating_add(len as u64).min(total);
        let chunk_size = u64::from(self.chunk_size());

        let mut out = Vec::with_capacity((end - offset) as usize);
        let mut pos = offset;
        while pos < end {
            if let Some(monitor) = monitor {
                monitor.checkpoint()?;
            }
            let chunk_index = pos / chunk_size;
            let intra = (pos % chunk_size) as usize;
            let plain = self.read_chunk(chunk_index as usize)?;
            let take = ((end - pos) as usize).min(plain.len() - intra);
            out.extend_from_slice(&plain[intra..intra + take]);
            pos += take as u64;
        }
        Ok(out)
    }

    /// A `Read + Seek` cursor over the plaintext, starting at offset 0.
    ///
    /// The cursor keeps the most recently decrypted chunk so that small
    /// sequential reads do not reopen it.
    pub fn cursor(&mut self) -> PlaintextCursor<'_, R> {
        PlaintextCursor {
            reader: self,
            pos: 0,
            cached: None,
        }
    }

    /// Release the container handle and drop the key.
    pub fn close(self) {
        debug!(chunks = self.index.len(), "random-access reader closed");
    }

    /// Close the reader and hand back the source.
    pub fn into_inner(self) -> R {
        self.source
    }
}

/// Byte cursor over a reader's plaintext, for consumers that expect
/// `std::io::Read + Seek` (media players, parsers).
pub struct PlaintextCursor<'r, R> {
    reader: &'r mut RandomAccessReader<R>,
    pos: u64,
    cached: Option<(usize, Vec<u8>)>,
}

impl<R> PlaintextCursor<'_, R> {
    pub fn position(&self) -> u64 {
        self.pos
    }
}

impl<R: Read + Seek> Read for PlaintextCursor<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let total = self.reader.len();
        if buf.is_empty() || self.pos >= total {
            return Ok(0);
        }
        let chunk_size = u64::from(self.reader.chunk_size());
        let chunk_index = (self.pos / chunk_size) as usize;
        let intra = (self.pos % chunk_size) as usize;

        let hit = matches!(&self.cached, Some((index, _)) if *index == chunk_index);
        if !hit {
            let plain = self.reader.read_chunk(chunk_index)?;
            self.cached = Some((chunk_index, plain));
        }
        let Some((_, plain)) = &self.cached else {
            return Ok(0);
        };

        let n = buf.len().min(plain.len() - intra);
        buf[..n].copy_from_slice(&plain[intra..intra + n]);
        self.pos += n as u64;
        Ok(n)
    }
}

impl<R: Read + Seek> Seek for PlaintextCursor<'_, R> {
    fn seek(&mut self, target: SeekFrom) -> io::Result<u64> {
        let (base, delta) = match target {
            SeekFrom::Start(n) => {
                self.pos = n;
                return Ok(n);
            }
            SeekFrom::End(d) => (self.reader.len(), d),
            SeekFrom::Current(d) => (self.pos, d),
        };
        match base.checked_add_signed(delta) {
            Some(n) => {
                self.pos = n;
                Ok(n)
            }
            None => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek to a negative or overflowing position",
            )),
        }
    }
}
