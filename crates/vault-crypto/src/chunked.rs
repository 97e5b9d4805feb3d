//! Chunked streaming engine: plaintext source ⇄ container, one record per chunk.
//!
//! Each chunk is sealed independently with AES-256-GCM under a fresh random
//! nonce and no associated data, so a version-1 record is a plain GCM seal of
//! its chunk. Record order is not authenticated in version 1; the declared
//! total and the per-record length checks are what bound the layout.

use std::io::{self, Read, Write};

use aes_gcm::{
    aead::{AeadInPlace, KeyInit},
    Aes256Gcm, Nonce, Tag,
};
use rand::RngCore;
use tracing::debug;

use crate::error::{CipherError, FormatError, Result};
use crate::format::{
    read_full, read_header, read_record_body, read_record_prefix, write_record, ChunkRecord,
    ContainerHeader, ContainerKind,
};
use crate::keys::{ContentKey, KeySource};
use crate::progress::Monitor;
use crate::{Summary, DEFAULT_CHUNK_SIZE, NONCE_SIZE, TAG_SIZE};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncryptOptions {
    /// Plaintext bytes per record.
    pub chunk_size: u32,
    /// Declared plaintext length, written into the header. `None` for streams
    /// of unknown length.
    pub total_plaintext: Option<u64>,
}

impl Default for EncryptOptions {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            total_plaintext: None,
        }
    }
}

/// AES-256-GCM bound to one content key, sealing and opening whole chunks.
pub(crate) struct ChunkCipher {
    aead: Aes256Gcm,
}

impl ChunkCipher {
    pub(crate) fn new(key: &ContentKey) -> Self {
        Self {
            aead: Aes256Gcm::new(key.as_bytes().into()),
        }
    }

    /// Encrypt `buf` in place; returns the nonce and tag for the record.
    pub(crate) fn seal(
        &self,
        index: u64,
        buf: &mut [u8],
    ) -> Result<([u8; NONCE_SIZE], [u8; TAG_SIZE])> {
        let mut nonce = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce);

        let tag = self
            .aead
            .encrypt_in_place_detached(Nonce::from_slice(&nonce), b"", buf)
            .map_err(|e| io::Error::other(format!("chunk {index} encryption failed: {e}")))?;

        let mut tag_bytes = [0u8; TAG_SIZE];
        tag_bytes.copy_from_slice(&tag);
        Ok((nonce, tag_bytes))
    }

    /// Verify and decrypt a record. On failure no plaintext is returned.
    pub(crate) fn open(&self, index: u64, record: ChunkRecord) -> Result<Vec<u8>> {
        let mut buf = record.ciphertext;
        self.aead
            .decrypt_in_place_detached(
                Nonce::from_slice(&record.nonce),
                b"",
                &mut buf,
                Tag::from_slice(&record.tag),
            )
            .map_err(|_| CipherError::AuthenticationFailed { chunk: Some(index) })?;
        Ok(buf)
    }
}

/// Once a record has started, running out of bytes is corruption.
pub(crate) fn mid_record(e: CipherError) -> CipherError {
    match e {
        CipherError::Format(FormatError::Truncated { .. }) => CipherError::Truncated,
        other => other,
    }
}

/// Encrypt `src` into a chunked container written to `dst`.
///
/// On `Cancelled` or any other error `dst` holds a partial container; deleting
/// it is the caller's job.
pub fn encrypt<R: Read, W: Write>(
    src: &mut R,
    dst: &mut W,
    options: &EncryptOptions,
    keys: KeySource<'_>,
    monitor: &mut Monitor<'_>,
) -> Result<Summary> {
    let (key, wrapped) = keys.for_encrypt()?;
    let header = ContainerHeader::new(options.chunk_size, options.total_plaintext, wrapped);
    dst.write_all(&header.encode()?)?;

    debug!(
        chunk_size = options.chunk_size,
        total = ?options.total_plaintext,
        embedded_key = header.wrapped_key.is_some(),
        "chunked encrypt: begin"
    );

    let cipher = ChunkCipher::new(&key);
    let chunk_size = options.chunk_size as usize;
    let mut buf = vec![0u8; chunk_size];
    let mut processed = 0u64;
    let mut index = 0u64;

    loop {
        let want = match options.total_plaintext {
            Some(total) => (total - processed).min(chunk_size as u64) as usize,
            None => chunk_size,
        };
        if want == 0 {
            break;
        }
        monitor.checkpoint()?;

        let n = read_full(src, &mut buf[..want])?;
        if n == 0 {
            break;
        }

        let (nonce, tag) = cipher.seal(index, &mut buf[..n])?;
        write_record(dst, &nonce, &buf[..n], &tag)?;

        processed += n as u64;
        index += 1;
        monitor.advance(processed, options.total_plaintext);

        if n < want {
            break;
        }
    }

    if let Some(total) = options.total_plaintext {
        if processed != total {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("source ended after {processed} of {total} declared bytes"),
            )
            .into());
        }
    }

    dst.flush()?;
    monitor.finish(options.total_plaintext);
    debug!(chunks = index, bytes = processed, "chunked encrypt: done");

    Ok(Summary {
        kind: ContainerKind::Chunked,
        chunks: index,
        plaintext_bytes: processed,
    })
}

/// Decrypt a chunked container from `src` into `dst`, record by record.
///
/// Stops once the declared total has been produced, or at a clean end of
/// stream when the total is unknown. A record that fails authentication
/// contributes nothing to `dst`; earlier records have already been written.
pub fn decrypt<R: Read, W: Write>(
    src: &mut R,
    dst: &mut W,
    keys: KeySource<'_>,
    monitor: &mut Monitor<'_>,
) -> Result<Summary> {
    let header = read_header(src)?;
    let key = keys.for_decrypt(header.wrapped_key.as_deref())?;
    let cipher = ChunkCipher::new(&key);
    let total = header.total_plaintext;

    debug!(
        chunk_size = header.chunk_size,
        total = ?total,
        embedded_key = header.wrapped_key.is_some(),
        "chunked decrypt: begin"
    );

    let mut produced = 0u64;
    let mut index = 0u64;
    let mut after_short = false;

    loop {
        if total.is_some_and(|total| produced >= total) {
            break;
        }
        monitor.checkpoint()?;

        let prefix = match read_record_prefix(src).map_err(mid_record)? {
            Some(prefix) => prefix,
            None if total.is_some() => return Err(CipherError::Truncated),
            None => break,
        };
        header.check_record_len(index, prefix.ciphertext_len, after_short)?;
        let record = read_record_body(src, prefix).map_err(mid_record)?;

        let plain = cipher.open(index, record)?;
        dst.write_all(&plain)?;

        produced += plain.len() as u64;
        after_short = plain.len() < header.chunk_size as usize;
        index += 1;
        monitor.advance(produced, total);
    }

    dst.flush()?;
    monitor.finish(total);
    debug!(chunks = index, bytes = produced, "chunked decrypt: done");

    Ok(Summary {
        kind: ContainerKind::Chunked,
        chunks: index,
        plaintext_bytes: produced,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{decode_header, decode_record, RECORD_PREFIX_LEN};
    use crate::keys::SoftwareKeyProvider;
    use crate::progress::Progress;
    use crate::CancellationToken;
    use aes_gcm::aead::Aead;
    use proptest::prelude::*;
    use std::sync::{Arc, Mutex};

    fn make_data(size: usize) -> Vec<u8> {
        (0..size)
            .map(|i| (i.wrapping_mul(7) ^ (i >> 3)) as u8)
            .collect()
    }

    fn seal(plain: &[u8], chunk_size: u32, provider: &SoftwareKeyProvider) -> Vec<u8> {
        let mut out = Vec::new();
        let options = EncryptOptions {
            chunk_size,
            total_plaintext: Some(plain.len() as u64),
        };
        encrypt(
            &mut &plain[..],
            &mut out,
            &options,
            KeySource::Wrapped(provider),
            &mut Monitor::silent(),
        )
        .unwrap();
        out
    }

    fn open(container: &[u8], provider: &SoftwareKeyProvider) -> (Result<Summary>, Vec<u8>) {
        let mut out = Vec::new();
        let result = decrypt(
            &mut &container[..],
            &mut out,
            KeySource::Wrapped(provider),
            &mut Monitor::silent(),
        );
        (result, out)
    }

    /// Offsets and ciphertext lengths of every record in a container.
    fn records(container: &[u8]) -> Vec<(usize, usize)> {
        let (_, mut pos) = decode_header(container).unwrap();
        let mut out = Vec::new();
        while let Some((record, used)) = decode_record(&container[pos..]).unwrap() {
            out.push((pos, record.ciphertext.len()));
            pos += used;
        }
        out
    }

    #[test]
    fn test_roundtrip_multi_chunk() {
        let provider = SoftwareKeyProvider::ephemeral();
        let plain = make_data(10_000);
        let container = seal(&plain, 1024, &provider);

        let (result, out) = open(&container, &provider);
        let summary = result.unwrap();
        assert_eq!(out, plain);
        assert_eq!(summary.chunks, 10);
        assert_eq!(summary.plaintext_bytes, 10_000);
    }

    #[test]
    fn test_chunk_count_and_lengths() {
        let provider = SoftwareKeyProvider::ephemeral();
        for (len, chunk) in [(0usize, 8u32), (1, 8), (8, 8), (9, 8), (100, 7), (64, 1)] {
            let container = seal(&make_data(len), chunk, &provider);
            let recs = records(&container);
            let expected = len.div_ceil(chunk as usize);
            assert_eq!(recs.len(), expected, "len={len} chunk={chunk}");
            for (i, (_, ct_len)) in recs.iter().enumerate() {
                let want = if i + 1 < expected || len % chunk as usize == 0 {
                    chunk as usize
                } else {
                    len % chunk as usize
                };
                assert_eq!(*ct_len, want, "record {i} of len={len} chunk={chunk}");
            }
        }
    }

    #[test]
    fn test_empty_input_has_no_records() {
        let provider = SoftwareKeyProvider::ephemeral();
        let container = seal(b"", 16, &provider);
        let header = ContainerHeader::new(16, Some(0), None);
        assert_eq!(container.len(), header.encoded_len() + 60);

        let (result, out) = open(&container, &provider);
        assert_eq!(result.unwrap().chunks, 0);
        assert!(out.is_empty());
    }

    #[test]
    fn test_every_bit_flip_in_payload_fails_closed() {
        let provider = SoftwareKeyProvider::ephemeral();
        let chunk = 16usize;
        let plain = make_data(40);
        let container = seal(&plain, chunk as u32, &provider);

        for (index, (offset, ct_len)) in records(&container).into_iter().enumerate() {
            let start = offset + RECORD_PREFIX_LEN;
            let payload = start..start + ct_len + TAG_SIZE;
            for (n, byte) in payload.enumerate() {
                let mut tampered = container.clone();
                tampered[byte] ^= 1 << (n % 8);

                let (result, out) = open(&tampered, &provider);
                match result {
                    Err(CipherError::AuthenticationFailed { chunk }) => {
                        assert_eq!(chunk, Some(index as u64));
                    }
                    other => panic!("byte {byte}: expected auth failure, got {other:?}"),
                }
                // Nothing from the tampered record or after it reaches the sink.
                assert_eq!(out, &plain[..index * chunk]);
            }
        }
    }

    #[test]
    fn test_flipped_nonce_fails() {
        let provider = SoftwareKeyProvider::ephemeral();
        let container = seal(&make_data(32), 16, &provider);
        let (offset, _) = records(&container)[1];
        let mut tampered = container.clone();
        tampered[offset] ^= 0x80;

        let (result, _) = open(&tampered, &provider);
        assert!(matches!(
            result,
            Err(CipherError::AuthenticationFailed { chunk: Some(1) })
        ));
    }

    #[test]
    fn test_reads_records_sealed_without_associated_data() {
        let key = ContentKey::generate();
        let aead = Aes256Gcm::new(key.as_bytes().into());
        let plain = make_data(25);

        let mut container = ContainerHeader::new(10, Some(25), None).encode().unwrap();
        for (i, chunk) in plain.chunks(10).enumerate() {
            let nonce = [i as u8 + 1; NONCE_SIZE];
            let sealed = aead.encrypt(Nonce::from_slice(&nonce), chunk).unwrap();
            let (ciphertext, tag) = sealed.split_at(chunk.len());
            let tag: [u8; TAG_SIZE] = tag.try_into().unwrap();
            write_record(&mut container, &nonce, ciphertext, &tag).unwrap();
        }

        let mut out = Vec::new();
        let summary = decrypt(
            &mut &container[..],
            &mut out,
            KeySource::External(&key),
            &mut Monitor::silent(),
        )
        .unwrap();
        assert_eq!(summary.chunks, 3);
        assert_eq!(out, plain);
    }

    #[test]
    fn test_records_open_as_plain_aes_gcm() {
        let key = ContentKey::generate();
        let plain = make_data(40);
        let mut container = Vec::new();
        encrypt(
            &mut &plain[..],
            &mut container,
            &EncryptOptions {
                chunk_size: 16,
                total_plaintext: Some(40),
            },
            KeySource::External(&key),
            &mut Monitor::silent(),
        )
        .unwrap();

        let aead = Aes256Gcm::new(key.as_bytes().into());
        let (_, mut pos) = decode_header(&container).unwrap();
        let mut recovered = Vec::new();
        while let Some((record, used)) = decode_record(&container[pos..]).unwrap() {
            let mut sealed = record.ciphertext.clone();
            sealed.extend_from_slice(&record.tag);
            let chunk = aead
                .decrypt(Nonce::from_slice(&record.nonce), sealed.as_slice())
                .unwrap();
            recovered.extend_from_slice(&chunk);
            pos += used;
        }
        assert_eq!(recovered, plain);
    }

    #[test]
    fn test_length_field_tamper_is_format_error() {
        let provider = SoftwareKeyProvider::ephemeral();
        let container = seal(&make_data(32), 16, &provider);
        let (offset, _) = records(&container)[0];
        let mut tampered = container.clone();
        tampered[offset + NONCE_SIZE..offset + RECORD_PREFIX_LEN]
            .copy_from_slice(&u32::MAX.to_le_bytes());

        let (result, _) = open(&tampered, &provider);
        assert!(matches!(
            result,
            Err(CipherError::Format(FormatError::RecordLength { index: 0, .. }))
        ));
    }

    #[test]
    fn test_truncation_mid_record_and_between_records() {
        let provider = SoftwareKeyProvider::ephemeral();
        let container = seal(&make_data(48), 16, &provider);
        let recs = records(&container);

        let (result, _) = open(&container[..container.len() - 3], &provider);
        assert!(matches!(result, Err(CipherError::Truncated)));

        let (result, _) = open(&container[..recs[1].0 + 5], &provider);
        assert!(matches!(result, Err(CipherError::Truncated)));

        // Clean cut between records, but the header promised more.
        let (result, out) = open(&container[..recs[2].0], &provider);
        assert!(matches!(result, Err(CipherError::Truncated)));
        assert_eq!(out.len(), 32);
    }

    #[test]
    fn test_unknown_total_roundtrip() {
        let provider = SoftwareKeyProvider::ephemeral();
        let plain = make_data(1000);
        let mut container = Vec::new();
        let options = EncryptOptions {
            chunk_size: 300,
            total_plaintext: None,
        };
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let mut monitor = Monitor::silent().on_progress(move |p| sink.lock().unwrap().push(p));
        let summary = encrypt(
            &mut &plain[..],
            &mut container,
            &options,
            KeySource::Wrapped(&provider),
            &mut monitor,
        )
        .unwrap();
        assert_eq!(summary.chunks, 4);
        assert!(seen
            .lock()
            .unwrap()
            .iter()
            .all(|p| *p == Progress::Indeterminate));

        let (header, _) = decode_header(&container).unwrap();
        assert_eq!(header.total_plaintext, None);

        let (result, out) = open(&container, &provider);
        assert_eq!(result.unwrap().plaintext_bytes, 1000);
        assert_eq!(out, plain);
    }

    #[test]
    fn test_external_key_roundtrip() {
        let key = ContentKey::generate();
        let plain = make_data(77);
        let mut container = Vec::new();
        encrypt(
            &mut &plain[..],
            &mut container,
            &EncryptOptions {
                chunk_size: 10,
                total_plaintext: Some(77),
            },
            KeySource::External(&key),
            &mut Monitor::silent(),
        )
        .unwrap();

        let (header, _) = decode_header(&container).unwrap();
        assert_eq!(header.wrapped_key, None);

        let mut out = Vec::new();
        decrypt(
            &mut &container[..],
            &mut out,
            KeySource::External(&key),
            &mut Monitor::silent(),
        )
        .unwrap();
        assert_eq!(out, plain);

        let provider = SoftwareKeyProvider::ephemeral();
        let (result, out) = open(&container, &provider);
        assert!(matches!(result, Err(CipherError::KeyUnavailable(_))));
        assert!(out.is_empty());
    }

    #[test]
    fn test_wrong_provider_is_key_unavailable() {
        let a = SoftwareKeyProvider::ephemeral();
        let b = SoftwareKeyProvider::ephemeral();
        let container = seal(b"for a only", 4, &a);
        let (result, out) = open(&container, &b);
        assert!(matches!(result, Err(CipherError::KeyUnavailable(_))));
        assert!(out.is_empty());
    }

    #[test]
    fn test_short_source_against_declared_total() {
        let provider = SoftwareKeyProvider::ephemeral();
        let plain = make_data(10);
        let err = encrypt(
            &mut &plain[..],
            &mut Vec::new(),
            &EncryptOptions {
                chunk_size: 4,
                total_plaintext: Some(20),
            },
            KeySource::Wrapped(&provider),
            &mut Monitor::silent(),
        )
        .unwrap_err();
        match err {
            CipherError::Io(e) => assert_eq!(e.kind(), io::ErrorKind::UnexpectedEof),
            other => panic!("expected io error, got {other:?}"),
        }
    }

    #[test]
    fn test_cancel_after_k_chunks_writes_no_more() {
        let provider = SoftwareKeyProvider::ephemeral();
        let plain = make_data(100);
        let (k, n) = (3usize, 10usize);

        let token = CancellationToken::new();
        let trigger = token.clone();
        let mut reports = 0usize;
        let mut monitor = Monitor::new(token).on_progress(move |_| {
            reports += 1;
            if reports == k {
                trigger.cancel();
            }
        });

        let mut container = Vec::new();
        let err = encrypt(
            &mut &plain[..],
            &mut container,
            &EncryptOptions {
                chunk_size: (plain.len() / n) as u32,
                total_plaintext: Some(plain.len() as u64),
            },
            KeySource::Wrapped(&provider),
            &mut monitor,
        )
        .unwrap_err();

        assert!(err.is_cancelled());
        assert_eq!(records(&container).len(), k);
    }

    #[test]
    fn test_cancel_during_decrypt() {
        let provider = SoftwareKeyProvider::ephemeral();
        let plain = make_data(100);
        let container = seal(&plain, 10, &provider);

        let token = CancellationToken::new();
        let trigger = token.clone();
        let mut monitor = Monitor::new(token).on_progress(move |p| {
            if p.fraction().unwrap_or(0.0) >= 0.4 {
                trigger.cancel();
            }
        });

        let mut out = Vec::new();
        let err = decrypt(
            &mut &container[..],
            &mut out,
            KeySource::Wrapped(&provider),
            &mut monitor,
        )
        .unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(out, &plain[..40]);
    }

    #[test]
    fn test_progress_monotonic_and_finishes_at_one() {
        let provider = SoftwareKeyProvider::ephemeral();
        let plain = make_data(1000);
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = seen.clone();
        let mut monitor = Monitor::silent().on_progress(move |p| sink.lock().unwrap().push(p));
        let mut container = Vec::new();
        encrypt(
            &mut &plain[..],
            &mut container,
            &EncryptOptions {
                chunk_size: 64,
                total_plaintext: Some(1000),
            },
            KeySource::Wrapped(&provider),
            &mut monitor,
        )
        .unwrap();

        let sink = seen.clone();
        sink.lock().unwrap().clear();
        let mut monitor = Monitor::silent().on_progress(move |p| sink.lock().unwrap().push(p));
        decrypt(
            &mut &container[..],
            &mut Vec::new(),
            KeySource::Wrapped(&provider),
            &mut monitor,
        )
        .unwrap();

        let values: Vec<f32> = seen
            .lock()
            .unwrap()
            .iter()
            .map(|p| p.fraction().expect("known total"))
            .collect();
        assert!(values.len() >= 16);
        assert!(values.windows(2).all(|w| w[0] <= w[1]), "{values:?}");
        assert_eq!(*values.last().unwrap(), 1.0);
    }

    proptest! {
        #[test]
        fn prop_roundtrip(
            data in proptest::collection::vec(any::<u8>(), 0..=4096),
            chunk_size in 1u32..=600,
        ) {
            let provider = SoftwareKeyProvider::ephemeral();
            let container = seal(&data, chunk_size, &provider);
            prop_assert_eq!(
                records(&container).len(),
                data.len().div_ceil(chunk_size as usize)
            );
            let (result, out) = open(&container, &provider);
            prop_assert!(result.is_ok());
            prop_assert_eq!(out, data);
        }
    }
}
