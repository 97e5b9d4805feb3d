//! Legacy whole-file codec, kept as a read-compatibility path.
//!
//! Layout: `[12-byte nonce][AES-256-GCM ciphertext ... ][16-byte tag]`, no
//! AAD, no chunk framing. The stream is processed incrementally, so bytes
//! reach the sink before the final tag has been checked. A tag mismatch still
//! fails the run with `AuthenticationFailed`; callers that must not keep
//! unverified plaintext write into a temporary sink and discard it on error
//! (see [`crate::file::decrypt_file`]).
//!
//! Progress on decrypt is estimated from ciphertext bytes consumed against the
//! total ciphertext length. Plaintext produced trails that by up to one tag,
//! so the figure is an approximation, not an exact plaintext count.

use std::io::{Read, Write};

use aes::cipher::{generic_array::GenericArray, BlockEncrypt, KeyInit, KeyIvInit, StreamCipher};
use aes::Aes256;
use ghash::universal_hash::UniversalHash;
use ghash::GHash;
use rand::RngCore;
use subtle::ConstantTimeEq;
use tracing::debug;

use crate::error::{CipherError, Result};
use crate::format::{read_full, ContainerKind};
use crate::keys::ContentKey;
use crate::progress::Monitor;
use crate::{Summary, NONCE_SIZE, TAG_SIZE};

/// Bytes processed between cancellation checks.
pub const LEGACY_BUFFER_SIZE: usize = 128 * 1024;

const BLOCK: usize = 16;

type Aes256Ctr = ctr::Ctr32BE<Aes256>;

/// Incremental AES-256-GCM with a 96-bit nonce and empty AAD.
struct GcmStream {
    keystream: Aes256Ctr,
    ghash: GHash,
    /// Ciphertext not yet a whole GHASH block.
    partial: Vec<u8>,
    ciphertext_len: u64,
    /// E_K(J0), XORed into the GHASH output to form the tag.
    tag_mask: [u8; BLOCK],
}

impl GcmStream {
    fn new(key: &ContentKey, nonce: &[u8; NONCE_SIZE]) -> Self {
        let block_cipher = <Aes256 as KeyInit>::new(key.as_bytes().into());

        let mut h = GenericArray::default();
        block_cipher.encrypt_block(&mut h);

        let mut j0 = [0u8; BLOCK];
        j0[..NONCE_SIZE].copy_from_slice(nonce);
        j0[BLOCK - 1] = 1;
        let mut mask = GenericArray::clone_from_slice(&j0);
        block_cipher.encrypt_block(&mut mask);

        // Payload keystream starts at inc32(J0).
        let mut counter = j0;
        counter[BLOCK - 1] = 2;
        let keystream = <Aes256Ctr as KeyIvInit>::new(
            key.as_bytes().into(),
            GenericArray::from_slice(&counter),
        );

        let mut tag_mask = [0u8; BLOCK];
        tag_mask.copy_from_slice(&mask);

        Self {
            keystream,
            ghash: <GHash as KeyInit>::new(&h),
            partial: Vec::with_capacity(BLOCK),
            ciphertext_len: 0,
            tag_mask,
        }
    }

    fn encrypt(&mut self, buf: &mut [u8]) {
        self.keystream.apply_keystream(buf);
        self.absorb(buf);
    }

    fn decrypt(&mut self, buf: &mut [u8]) {
        self.absorb(buf);
        self.keystream.apply_keystream(buf);
    }

    fn absorb(&mut self, mut ciphertext: &[u8]) {
        self.ciphertext_len += ciphertext.len() as u64;

        if !self.partial.is_empty() {
            let take = (BLOCK - self.partial.len()).min(ciphertext.len());
            self.partial.extend_from_slice(&ciphertext[..take]);
            ciphertext = &ciphertext[take..];
            if self.partial.len() < BLOCK {
                return;
            }
            self.ghash.update_padded(&self.partial);
            self.partial.clear();
        }

        let whole = ciphertext.len() / BLOCK * BLOCK;
        self.ghash.update_padded(&ciphertext[..whole]);
        self.partial.extend_from_slice(&ciphertext[whole..]);
    }

    fn finish(mut self) -> [u8; TAG_SIZE] {
        if !self.partial.is_empty() {
            self.ghash.update_padded(&self.partial);
        }
        // len(A) = 0 bits, len(C) in bits, both big-endian u64.
        let mut lengths = [0u8; BLOCK];
        lengths[8..].copy_from_slice(&(self.ciphertext_len * 8).to_be_bytes());
        self.ghash.update_padded(&lengths);

        let s = self.ghash.finalize();
        let mut tag = [0u8; TAG_SIZE];
        for (i, byte) in tag.iter_mut().enumerate() {
            *byte = s[i] ^ self.tag_mask[i];
        }
        tag
    }
}

/// Encrypt `src` as one legacy AES-GCM stream.
///
/// `total_plaintext`, when known, drives `processed / total` progress.
pub fn encrypt_legacy<R: Read, W: Write>(
    src: &mut R,
    dst: &mut W,
    key: &ContentKey,
    total_plaintext: Option<u64>,
    monitor: &mut Monitor<'_>,
) -> Result<Summary> {
    let mut nonce = [0u8; NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut nonce);
    dst.write_all(&nonce)?;

    debug!(total = ?total_plaintext, "legacy encrypt: begin");

    let mut gcm = GcmStream::new(key, &nonce);
    let mut buf = vec![0u8; LEGACY_BUFFER_SIZE];
    let mut processed = 0u64;

    loop {
        monitor.checkpoint()?;
        let n = read_full(src, &mut buf)?;
        if n == 0 {
            break;
        }
        gcm.encrypt(&mut buf[..n]);
        dst.write_all(&buf[..n])?;
        processed += n as u64;
        monitor.advance(processed, total_plaintext);
        if n < buf.len() {
            break;
        }
    }

    dst.write_all(&gcm.finish())?;
    dst.flush()?;
    monitor.finish(total_plaintext);
    debug!(bytes = processed, "legacy encrypt: done");

    Ok(Summary {
        kind: ContainerKind::Legacy,
        chunks: 0,
        plaintext_bytes: processed,
    })
}

/// Decrypt a legacy blob, forwarding plaintext as it becomes available.
///
/// `ciphertext_len` is the blob length minus the 12-byte nonce (tag
/// included), used only for the progress estimate. Progress is emitted when
/// the whole percentage changes.
pub fn decrypt_legacy<R: Read, W: Write>(
    src: &mut R,
    dst: &mut W,
    key: &ContentKey,
    ciphertext_len: Option<u64>,
    monitor: &mut Monitor<'_>,
) -> Result<Summary> {
    let mut nonce = [0u8; NONCE_SIZE];
    if read_full(src, &mut nonce)? < NONCE_SIZE {
        return Err(CipherError::Truncated);
    }

    debug!(ciphertext_len = ?ciphertext_len, "legacy decrypt: begin");

    let mut gcm = GcmStream::new(key, &nonce);
    let mut buf = vec![0u8; LEGACY_BUFFER_SIZE];
    // Trailing bytes that may still turn out to be the tag.
    let mut held: Vec<u8> = Vec::with_capacity(LEGACY_BUFFER_SIZE + TAG_SIZE);
    let mut consumed = 0u64;
    let mut produced = 0u64;
    let mut last_percent: Option<u64> = None;

    loop {
        monitor.checkpoint()?;
        let n = read_full(src, &mut buf)?;
        if n == 0 {
            break;
        }
        consumed += n as u64;
        held.extend_from_slice(&buf[..n]);

        if held.len() > TAG_SIZE {
            let ready = held.len() - TAG_SIZE;
            let mut out: Vec<u8> = held.drain(..ready).collect();
            gcm.decrypt(&mut out);
            dst.write_all(&out)?;
            produced += ready as u64;
        }

        match ciphertext_len {
            Some(total) if total > 0 => {
                let percent = (consumed.min(total) * 100) / total;
                if last_percent != Some(percent) {
                    last_percent = Some(percent);
                    monitor.report_fraction(percent as f32 / 100.0);
                }
            }
            _ => monitor.indeterminate(),
        }

        if n < buf.len() {
            break;
        }
    }

    if held.len() < TAG_SIZE {
        return Err(CipherError::Truncated);
    }
    let expected = gcm.finish();
    if !bool::from(expected[..].ct_eq(&held[..])) {
        return Err(CipherError::AuthenticationFailed { chunk: None });
    }

    dst.flush()?;
    if ciphertext_len.is_some_and(|total| total > 0) {
        monitor.finish(ciphertext_len);
    }
    debug!(bytes = produced, "legacy decrypt: done");

    Ok(Summary {
        kind: ContainerKind::Legacy,
        chunks: 0,
        plaintext_bytes: produced,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::Progress;
    use aes_gcm::{aead::Aead, Aes256Gcm, Nonce};
    use proptest::prelude::*;
    use std::sync::{Arc, Mutex};

    fn make_data(size: usize) -> Vec<u8> {
        (0..size).map(|i| (i * 31 + 7) as u8).collect()
    }

    fn seal(plain: &[u8], key: &ContentKey) -> Vec<u8> {
        let mut out = Vec::new();
        encrypt_legacy(
            &mut &plain[..],
            &mut out,
            key,
            Some(plain.len() as u64),
            &mut Monitor::silent(),
        )
        .unwrap();
        out
    }

    fn open(blob: &[u8], key: &ContentKey) -> (Result<Summary>, Vec<u8>) {
        let mut out = Vec::new();
        let result = decrypt_legacy(
            &mut &blob[..],
            &mut out,
            key,
            Some((blob.len() - NONCE_SIZE.min(blob.len())) as u64),
            &mut Monitor::silent(),
        );
        (result, out)
    }

    #[test]
    fn test_matches_one_shot_aes_gcm() {
        let key = ContentKey::generate();
        let cipher = Aes256Gcm::new(key.as_bytes().into());
        for len in [0usize, 1, 15, 16, 17, 100, LEGACY_BUFFER_SIZE + 33] {
            let plain = make_data(len);
            let blob = seal(&plain, &key);
            let (nonce, body) = blob.split_at(NONCE_SIZE);
            let reference = cipher
                .encrypt(Nonce::from_slice(nonce), plain.as_slice())
                .unwrap();
            assert_eq!(body, reference.as_slice(), "len={len}");
        }
    }

    #[test]
    fn test_reads_one_shot_aes_gcm_output() {
        let key = ContentKey::generate();
        let cipher = Aes256Gcm::new(key.as_bytes().into());
        let nonce = [9u8; NONCE_SIZE];
        let plain = make_data(3 * LEGACY_BUFFER_SIZE + 5);

        let mut blob = nonce.to_vec();
        blob.extend(
            cipher
                .encrypt(Nonce::from_slice(&nonce), plain.as_slice())
                .unwrap(),
        );

        let (result, out) = open(&blob, &key);
        assert_eq!(result.unwrap().plaintext_bytes, plain.len() as u64);
        assert_eq!(out, plain);
    }

    #[test]
    fn test_tampered_tag_and_body_fail() {
        let key = ContentKey::generate();
        let blob = seal(&make_data(500), &key);

        for pos in [NONCE_SIZE, NONCE_SIZE + 250, blob.len() - 1] {
            let mut tampered = blob.clone();
            tampered[pos] ^= 0x04;
            let (result, _) = open(&tampered, &key);
            assert!(
                matches!(result, Err(CipherError::AuthenticationFailed { chunk: None })),
                "flip at {pos}"
            );
        }
    }

    #[test]
    fn test_wrong_key_fails() {
        let blob = seal(b"legacy secret", &ContentKey::generate());
        let (result, _) = open(&blob, &ContentKey::generate());
        assert!(result.unwrap_err().is_auth_failure());
    }

    #[test]
    fn test_truncated_blobs() {
        let key = ContentKey::generate();
        for blob in [vec![], vec![1u8; 5], vec![1u8; NONCE_SIZE + 15]] {
            let mut out = Vec::new();
            let err = decrypt_legacy(&mut &blob[..], &mut out, &key, None, &mut Monitor::silent())
                .unwrap_err();
            assert!(matches!(err, CipherError::Truncated), "len {}", blob.len());
        }
    }

    #[test]
    fn test_decrypt_progress_whole_percent_steps() {
        let key = ContentKey::generate();
        let blob = seal(&make_data(10 * LEGACY_BUFFER_SIZE), &key);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let mut monitor = Monitor::silent().on_progress(move |p| sink.lock().unwrap().push(p));

        decrypt_legacy(
            &mut &blob[..],
            &mut Vec::new(),
            &key,
            Some((blob.len() - NONCE_SIZE) as u64),
            &mut monitor,
        )
        .unwrap();

        let values: Vec<f32> = seen
            .lock()
            .unwrap()
            .iter()
            .filter_map(|p| p.fraction())
            .collect();
        assert!(values.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(*values.last().unwrap(), 1.0);
        for v in &values {
            let pct = v * 100.0;
            assert!((pct - pct.round()).abs() < 1e-3, "not a whole percent: {v}");
        }
    }

    #[test]
    fn test_decrypt_unknown_length_is_indeterminate() {
        let key = ContentKey::generate();
        let blob = seal(&make_data(1000), &key);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let mut monitor = Monitor::silent().on_progress(move |p| sink.lock().unwrap().push(p));

        decrypt_legacy(&mut &blob[..], &mut Vec::new(), &key, None, &mut monitor).unwrap();
        assert!(seen
            .lock()
            .unwrap()
            .iter()
            .all(|p| *p == Progress::Indeterminate));
    }

    proptest! {
        #[test]
        fn prop_legacy_roundtrip(data in proptest::collection::vec(any::<u8>(), 0..=8192)) {
            let key = ContentKey::generate();
            let blob = seal(&data, &key);
            prop_assert_eq!(blob.len(), NONCE_SIZE + data.len() + TAG_SIZE);
            let (result, out) = open(&blob, &key);
            prop_assert!(result.is_ok());
            prop_assert_eq!(out, data);
        }
    }
}
