//! Chunked HMAC integrity
//!
//! Ciphertext is split into `chunk_size` chunks (the last may be short) and
//! each chunk gets one HMAC. The first chunk's HMAC also covers the stream
//! header, which binds the nonce and chunk size to the content.

use std::fmt::Debug;
use std::sync::Arc;

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use zeroize::Zeroize;

use ctrv_core::types::{
    EncryptionMode, BLOCK_SIZE, DEFAULT_CHUNK_SIZE, HASH_RESULT_LENGTH, MAX_CHUNK_SIZE,
};
use ctrv_core::{CtrvError, CtrvResult};

type HmacSha256 = Hmac<Sha256>;

/// Keyed hash over a sequence of byte slices, treated as one concatenated input.
pub trait HashProvider: Send + Sync + Debug {
    fn hash_length(&self) -> usize;

    fn calc(&self, key: &[u8], parts: &[&[u8]]) -> CtrvResult<Vec<u8>>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct HmacSha256Provider;

impl HashProvider for HmacSha256Provider {
    fn hash_length(&self) -> usize {
        HASH_RESULT_LENGTH
    }

    fn calc(&self, key: &[u8], parts: &[&[u8]]) -> CtrvResult<Vec<u8>> {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(key)
            .map_err(|_| CtrvError::Security("invalid hash key".into()))?;
        for part in parts {
            mac.update(part);
        }
        Ok(mac.finalize().into_bytes().to_vec())
    }
}

pub struct Integrity {
    enabled: bool,
    key: Option<Vec<u8>>,
    chunk_size: usize,
    provider: Arc<dyn HashProvider>,
    hash_size: usize,
}

impl Integrity {
    /// `chunk_size == 0` selects `DEFAULT_CHUNK_SIZE` when integrity is enabled.
    pub fn new(
        enabled: bool,
        key: Option<&[u8]>,
        chunk_size: usize,
        provider: Arc<dyn HashProvider>,
    ) -> CtrvResult<Self> {
        if chunk_size % BLOCK_SIZE != 0 || chunk_size > MAX_CHUNK_SIZE {
            return Err(CtrvError::Integrity(format!(
                "invalid chunk size {chunk_size}: use 0 for the default or a multiple of \
                 {BLOCK_SIZE} no larger than {MAX_CHUNK_SIZE}"
            )));
        }
        if enabled && key.is_none() {
            return Err(CtrvError::Security(
                "a hash key is required to use integrity".into(),
            ));
        }
        let chunk_size = if enabled && chunk_size == 0 {
            DEFAULT_CHUNK_SIZE
        } else {
            chunk_size
        };
        let hash_size = provider.hash_length();
        Ok(Self {
            enabled,
            key: key.map(<[u8]>::to_vec),
            chunk_size,
            provider,
            hash_size,
        })
    }

    /// Integrity off, no chunking
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            key: None,
            chunk_size: 0,
            provider: Arc::new(HmacSha256Provider),
            hash_size: HASH_RESULT_LENGTH,
        }
    }

    /// HMAC-SHA256 integrity with `key`
    pub fn hmac_sha256(key: &[u8], chunk_size: usize) -> CtrvResult<Self> {
        Self::new(true, Some(key), chunk_size, Arc::new(HmacSha256Provider))
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn hash_size(&self) -> usize {
        self.hash_size
    }

    fn key(&self) -> CtrvResult<&[u8]> {
        self.key
            .as_deref()
            .ok_or_else(|| CtrvError::Security("hash key is missing".into()))
    }

    fn hash_chunk(&self, chunk: &[u8], header: Option<&[u8]>) -> CtrvResult<Vec<u8>> {
        match header {
            Some(header) => self.provider.calc(self.key()?, &[header, chunk]),
            None => self.provider.calc(self.key()?, &[chunk]),
        }
    }

    /// One hash per chunk of `buffer`, in order. `header` is prepended to the
    /// first chunk's input only. `None` when integrity is disabled.
    pub fn generate_hashes(
        &self,
        buffer: &[u8],
        header: Option<&[u8]>,
    ) -> CtrvResult<Option<Vec<Vec<u8>>>> {
        if !self.enabled {
            return Ok(None);
        }
        let hashes = buffer
            .chunks(self.chunk_size)
            .enumerate()
            .map(|(i, chunk)| self.hash_chunk(chunk, if i == 0 { header } else { None }))
            .collect::<CtrvResult<Vec<_>>>()?;
        Ok(Some(hashes))
    }

    /// Recompute and compare in chunk order. The first mismatch fails the
    /// whole buffer; nothing past it may be trusted.
    pub fn verify_hashes(
        &self,
        hashes: &[Vec<u8>],
        buffer: &[u8],
        header: Option<&[u8]>,
    ) -> CtrvResult<()> {
        if !self.enabled {
            return Ok(());
        }
        let expected_chunks = buffer.len().div_ceil(self.chunk_size);
        if hashes.len() < expected_chunks {
            return Err(CtrvError::Integrity(format!(
                "expected {expected_chunks} chunk hashes, found {}",
                hashes.len()
            )));
        }
        for (i, (chunk, stored)) in buffer.chunks(self.chunk_size).zip(hashes).enumerate() {
            let computed = self.hash_chunk(chunk, if i == 0 { header } else { None })?;
            if !bool::from(computed.as_slice().ct_eq(stored.as_slice())) {
                tracing::warn!(chunk = i, "chunk hash mismatch");
                return Err(CtrvError::Integrity("data corrupt or tampered".into()));
            }
        }
        Ok(())
    }

    /// Split the hash values out of a physical `[hash][chunk]...` buffer that
    /// starts on a chunk boundary.
    pub fn hashes_from_stream(&self, buffer: &[u8]) -> CtrvResult<Option<Vec<Vec<u8>>>> {
        if !self.enabled {
            return Ok(None);
        }
        let stride = self.hash_size + self.chunk_size;
        let mut hashes = Vec::with_capacity(buffer.len().div_ceil(stride));
        for group in buffer.chunks(stride) {
            if group.len() < self.hash_size {
                return Err(CtrvError::Integrity("truncated chunk hash".into()));
            }
            hashes.push(group[..self.hash_size].to_vec());
        }
        Ok(Some(hashes))
    }

    /// Hash overhead inside `count` physical bytes that start on a chunk
    /// boundary.
    pub fn hash_data_length(&self, count: u64, hash_offset: u64) -> u64 {
        if self.chunk_size == 0 {
            return 0;
        }
        Self::total_hash_data_length(
            EncryptionMode::Decrypt,
            count,
            self.chunk_size as u64,
            hash_offset,
            self.hash_size as u64,
        )
    }

    /// Bytes of hash table for a region of `length` bytes.
    ///
    /// In `Decrypt` mode `length` is physical (hashes included) and each group
    /// spans `chunk_size + hash_offset` bytes; in `Encrypt` mode `length` is
    /// content only. A trailing partial group counts when it holds more than
    /// `hash_offset` bytes.
    pub fn total_hash_data_length(
        mode: EncryptionMode,
        length: u64,
        chunk_size: u64,
        hash_offset: u64,
        hash_length: u64,
    ) -> u64 {
        let group = match mode {
            EncryptionMode::Decrypt => chunk_size + hash_offset,
            EncryptionMode::Encrypt => chunk_size,
        };
        if group == 0 {
            return 0;
        }
        let mut chunks = length / group;
        if length % group > hash_offset {
            chunks += 1;
        }
        chunks * hash_length
    }
}

impl Drop for Integrity {
    fn drop(&mut self) {
        if let Some(key) = self.key.as_mut() {
            key.zeroize();
        }
    }
}

impl Debug for Integrity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Integrity")
            .field("enabled", &self.enabled)
            .field("key", &self.key.as_ref().map(|_| "[REDACTED]"))
            .field("chunk_size", &self.chunk_size)
            .field("hash_size", &self.hash_size)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const KEY: [u8; 32] = [0x42; 32];

    fn integrity(chunk: usize) -> Integrity {
        Integrity::hmac_sha256(&KEY, chunk).unwrap()
    }

    #[test]
    fn test_construction_rules() {
        assert_eq!(integrity(0).chunk_size(), DEFAULT_CHUNK_SIZE);
        assert_eq!(integrity(64).chunk_size(), 64);
        assert!(matches!(
            Integrity::new(true, None, 64, Arc::new(HmacSha256Provider)),
            Err(CtrvError::Security(_))
        ));
        assert!(matches!(
            Integrity::hmac_sha256(&KEY, 100),
            Err(CtrvError::Integrity(_))
        ));
        assert!(Integrity::hmac_sha256(&KEY, MAX_CHUNK_SIZE + BLOCK_SIZE).is_err());
        assert!(Integrity::hmac_sha256(&KEY, MAX_CHUNK_SIZE).is_ok());

        let off = Integrity::new(false, None, 0, Arc::new(HmacSha256Provider)).unwrap();
        assert_eq!(off.chunk_size(), 0);
    }

    #[test]
    fn test_generate_one_hash_per_chunk() {
        let i = integrity(32);
        let hashes = i.generate_hashes(&[7u8; 100], None).unwrap().unwrap();
        assert_eq!(hashes.len(), 4);
        assert!(hashes.iter().all(|h| h.len() == HASH_RESULT_LENGTH));
        assert!(i.generate_hashes(&[], None).unwrap().unwrap().is_empty());
    }

    #[test]
    fn test_header_binds_first_chunk_only() {
        let i = integrity(32);
        let data = [3u8; 64];
        let plain = i.generate_hashes(&data, None).unwrap().unwrap();
        let with_header = i.generate_hashes(&data, Some(b"header")).unwrap().unwrap();
        assert_ne!(plain[0], with_header[0]);
        assert_eq!(plain[1], with_header[1]);

        assert!(i.verify_hashes(&with_header, &data, Some(b"header")).is_ok());
        assert!(i.verify_hashes(&with_header, &data, None).is_err());
    }

    #[test]
    fn test_disabled_is_noop() {
        let off = Integrity::disabled();
        assert!(off.generate_hashes(&[1, 2, 3], None).unwrap().is_none());
        assert!(off.verify_hashes(&[], &[1, 2, 3], None).is_ok());
        assert_eq!(off.hash_data_length(1000, 32), 0);
    }

    #[test]
    fn test_tamper_first_middle_final_chunk() {
        let i = integrity(64);
        let data: Vec<u8> = (0..64 * 4 + 20).map(|b| b as u8).collect();
        let hashes = i.generate_hashes(&data, Some(b"hdr")).unwrap().unwrap();
        assert_eq!(hashes.len(), 5);

        for pos in [0usize, 64 * 2 + 5, data.len() - 1] {
            let mut tampered = data.clone();
            tampered[pos] ^= 0x01;
            let err = i.verify_hashes(&hashes, &tampered, Some(b"hdr")).unwrap_err();
            assert!(matches!(err, CtrvError::Integrity(_)), "pos {pos}");
        }

        for chunk in [0usize, 2, 4] {
            let mut bad = hashes.clone();
            bad[chunk][31] ^= 0x80;
            assert!(i.verify_hashes(&bad, &data, Some(b"hdr")).is_err());
        }
    }

    #[test]
    fn test_missing_hashes_rejected() {
        let i = integrity(16);
        let data = [0u8; 48];
        let hashes = i.generate_hashes(&data, None).unwrap().unwrap();
        assert!(i.verify_hashes(&hashes[..2], &data, None).is_err());
    }

    #[test]
    fn test_total_hash_data_length() {
        let c = 256 * 1024;
        let h = HASH_RESULT_LENGTH as u64;
        // content: 2 full chunks and 1 byte
        assert_eq!(
            Integrity::total_hash_data_length(EncryptionMode::Encrypt, 2 * c + 1, c, 0, h),
            3 * h
        );
        assert_eq!(
            Integrity::total_hash_data_length(EncryptionMode::Encrypt, 2 * c, c, 0, h),
            2 * h
        );
        // physical: a trailing group holding only a hash has no content
        assert_eq!(
            Integrity::total_hash_data_length(EncryptionMode::Decrypt, 2 * (c + h) + h, c, h, h),
            2 * h
        );
        assert_eq!(
            Integrity::total_hash_data_length(EncryptionMode::Decrypt, 2 * (c + h) + h + 1, c, h, h),
            3 * h
        );
        assert_eq!(integrity(c as usize).hash_data_length(c + h, h), h);
    }

    #[test]
    fn test_hashes_from_stream() {
        let i = integrity(16);
        let data = [9u8; 40];
        let hashes = i.generate_hashes(&data, None).unwrap().unwrap();

        let mut physical = Vec::new();
        for (hash, chunk) in hashes.iter().zip(data.chunks(16)) {
            physical.extend_from_slice(hash);
            physical.extend_from_slice(chunk);
        }
        assert_eq!(i.hashes_from_stream(&physical).unwrap().unwrap(), hashes);
        assert!(i.hashes_from_stream(&physical[..48 + 10]).is_err());
    }

    proptest! {
        #[test]
        fn prop_single_bit_flip_detected(
            data in proptest::collection::vec(any::<u8>(), 1..300),
            bit in any::<usize>(),
        ) {
            let i = integrity(32);
            let hashes = i.generate_hashes(&data, None).unwrap().unwrap();
            let mut tampered = data.clone();
            let bit = bit % (tampered.len() * 8);
            tampered[bit / 8] ^= 1 << (bit % 8);
            prop_assert!(i.verify_hashes(&hashes, &tampered, None).is_err());
        }
    }
}
