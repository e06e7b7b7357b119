//! Random-access encrypted stream
//!
//! Logical positions address plaintext. With a chunk size `c` and hash size
//! `h`, the group holding logical chunk `k` starts at physical offset
//! `HEADER_LENGTH + k * (c + h)`. Reads verify every chunk they touch before
//! decrypting it. Writes must start on a chunk boundary (or a block boundary
//! when there are no hashes) so each write produces whole hash groups.

use std::io::{self, Read, Seek, SeekFrom, Write};
use std::sync::Arc;

use ctrv_core::types::{EncryptionMode, BLOCK_SIZE, HASH_RESULT_LENGTH};
use ctrv_core::{CtrvError, CtrvResult};
use ctrv_storage::RandomAccessStream;

use crate::header::{StreamHeader, HEADER_LENGTH};
use crate::integrity::{HmacSha256Provider, Integrity};
use crate::keys::DriveKey;
use crate::provider::BlockCipherProvider;
use crate::transform::CtrTransformer;

pub struct AesStream<S: RandomAccessStream> {
    inner: S,
    mode: EncryptionMode,
    header: StreamHeader,
    header_bytes: [u8; HEADER_LENGTH],
    transformer: CtrTransformer,
    integrity: Integrity,
    chunk_size: u64,
    hash_size: u64,
    position: u64,
    allow_range_write: bool,
}

impl<S: RandomAccessStream> AesStream<S> {
    /// Encrypting stream that writes `header` at offset 0 right away.
    pub fn create(
        inner: S,
        key: &DriveKey,
        header: StreamHeader,
        provider: Arc<dyn BlockCipherProvider>,
    ) -> CtrvResult<Self> {
        let mut stream = Self::encryptor(inner, key, header, provider)?;
        stream.write_header()?;
        Ok(stream)
    }

    /// Encrypting stream over a target whose header is written by someone
    /// else. Parallel workers use this with range writes allowed.
    pub fn encryptor(
        inner: S,
        key: &DriveKey,
        header: StreamHeader,
        provider: Arc<dyn BlockCipherProvider>,
    ) -> CtrvResult<Self> {
        let integrity = header.chunk_size > 0;
        Self::build(inner, EncryptionMode::Encrypt, key, header, integrity, provider)
    }

    /// Decrypting stream; reads the header from offset 0.
    pub fn open(
        mut inner: S,
        key: &DriveKey,
        verify: bool,
        provider: Arc<dyn BlockCipherProvider>,
    ) -> CtrvResult<Self> {
        inner.seek(SeekFrom::Start(0))?;
        let header = StreamHeader::read_from(&mut inner)?;
        Self::decryptor(inner, key, header, verify, provider)
    }

    /// Decrypting stream for an already parsed header. With `verify` off the
    /// hashes are skipped, not checked.
    pub fn decryptor(
        inner: S,
        key: &DriveKey,
        header: StreamHeader,
        verify: bool,
        provider: Arc<dyn BlockCipherProvider>,
    ) -> CtrvResult<Self> {
        if verify && header.chunk_size == 0 {
            return Err(CtrvError::Integrity(
                "integrity requested but the stream carries no hashes".into(),
            ));
        }
        Self::build(inner, EncryptionMode::Decrypt, key, header, verify, provider)
    }

    fn build(
        inner: S,
        mode: EncryptionMode,
        key: &DriveKey,
        header: StreamHeader,
        integrity: bool,
        provider: Arc<dyn BlockCipherProvider>,
    ) -> CtrvResult<Self> {
        let mut transformer = CtrTransformer::new(provider);
        transformer.init(key.enc_key(), &header.nonce)?;
        let integrity = Integrity::new(
            integrity,
            Some(key.hash_key()),
            header.chunk_size(),
            Arc::new(HmacSha256Provider),
        )?;
        let chunk_size = header.chunk_size as u64;
        let hash_size = if chunk_size > 0 {
            integrity.hash_size() as u64
        } else {
            0
        };
        Ok(Self {
            inner,
            mode,
            header_bytes: header.to_bytes(),
            header,
            transformer,
            integrity,
            chunk_size,
            hash_size,
            position: 0,
            allow_range_write: false,
        })
    }

    /// Physical size of a stream holding `length` logical bytes
    /// (`Encrypt`), or logical size of a physical stream of `length` bytes
    /// (`Decrypt`).
    pub fn output_size(mode: EncryptionMode, length: u64, chunk_size: u64) -> u64 {
        let hash = HASH_RESULT_LENGTH as u64;
        if chunk_size == 0 {
            return match mode {
                EncryptionMode::Encrypt => HEADER_LENGTH as u64 + length,
                EncryptionMode::Decrypt => length.saturating_sub(HEADER_LENGTH as u64),
            };
        }
        match mode {
            EncryptionMode::Encrypt => {
                HEADER_LENGTH as u64
                    + length
                    + Integrity::total_hash_data_length(mode, length, chunk_size, 0, hash)
            }
            EncryptionMode::Decrypt => logical_length(length, chunk_size, hash),
        }
    }

    /// True when a physical stream of `length` bytes ends inside a hash, i.e.
    /// its final group carries no data. Writers never produce such a stream.
    pub fn ends_in_hash(length: u64, chunk_size: u64) -> bool {
        if chunk_size == 0 {
            return false;
        }
        let hash = HASH_RESULT_LENGTH as u64;
        let rem = length.saturating_sub(HEADER_LENGTH as u64) % (chunk_size + hash);
        rem > 0 && rem <= hash
    }

    pub fn write_header(&mut self) -> CtrvResult<()> {
        self.inner.seek(SeekFrom::Start(0))?;
        self.header.write_to(&mut self.inner)?;
        Ok(())
    }

    pub fn header(&self) -> &StreamHeader {
        &self.header
    }

    pub fn mode(&self) -> EncryptionMode {
        self.mode
    }

    pub fn is_integrity_enabled(&self) -> bool {
        self.integrity.is_enabled()
    }

    pub fn set_allow_range_write(&mut self, allow: bool) {
        self.allow_range_write = allow;
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    /// Encrypting streams may only move away from 0 with range writes allowed.
    pub fn set_position(&mut self, position: u64) -> CtrvResult<()> {
        if self.mode == EncryptionMode::Encrypt && position != 0 && !self.allow_range_write {
            return Err(CtrvError::Security(
                "range writes are not allowed on this stream".into(),
            ));
        }
        self.position = position;
        Ok(())
    }

    /// Logical (plaintext) length
    pub fn length(&mut self) -> CtrvResult<u64> {
        let physical = self.inner.length()?;
        Ok(logical_length(physical, self.chunk_size, self.hash_size))
    }

    fn physical_offset(&self, logical: u64) -> u64 {
        let hashes = if self.chunk_size > 0 {
            logical.div_ceil(self.chunk_size) * self.hash_size
        } else {
            0
        };
        HEADER_LENGTH as u64 + logical + hashes
    }

    fn alignment(&self) -> u64 {
        if self.chunk_size > 0 {
            self.chunk_size
        } else {
            BLOCK_SIZE as u64
        }
    }

    /// Read and decrypt up to `buf.len()` bytes at the current position.
    pub fn read_data(&mut self, buf: &mut [u8]) -> CtrvResult<usize> {
        if self.mode != EncryptionMode::Decrypt {
            return Err(CtrvError::Security("stream is open for encryption".into()));
        }
        let len = self.length()?;
        if buf.is_empty() || self.position >= len {
            return Ok(0);
        }
        let want = (buf.len() as u64).min(len - self.position);
        let align = self.alignment();
        let start = self.position - self.position % align;
        let end = if self.chunk_size > 0 {
            (self.position + want).div_ceil(align).saturating_mul(align).min(len)
        } else {
            self.position + want
        };

        let phys_start = self.physical_offset(start);
        let mut physical = vec![0u8; (self.physical_offset(end) - phys_start) as usize];
        self.inner.seek(SeekFrom::Start(phys_start))?;
        self.inner.read_exact(&mut physical)?;

        let ciphertext = if self.chunk_size > 0 {
            let data = self.strip_hashes(&physical);
            if self.integrity.is_enabled() {
                let hashes = self
                    .integrity
                    .hashes_from_stream(&physical)?
                    .unwrap_or_default();
                let header = (start == 0).then_some(&self.header_bytes[..]);
                self.integrity.verify_hashes(&hashes, &data, header)?;
            }
            data
        } else {
            physical
        };

        let mut plain = vec![0u8; ciphertext.len()];
        self.transformer.sync_counter(start)?;
        self.transformer.decrypt_data(&ciphertext, &mut plain)?;

        let skip = (self.position - start) as usize;
        let want = want as usize;
        buf[..want].copy_from_slice(&plain[skip..skip + want]);
        self.position += want as u64;
        Ok(want)
    }

    fn strip_hashes(&self, physical: &[u8]) -> Vec<u8> {
        let hash = self.hash_size as usize;
        let group = self.chunk_size as usize + hash;
        let mut data = Vec::with_capacity(physical.len());
        for g in physical.chunks(group) {
            data.extend_from_slice(&g[hash.min(g.len())..]);
        }
        data
    }

    /// Encrypt and write `buf` at the current position, hashing each chunk.
    pub fn write_data(&mut self, buf: &[u8]) -> CtrvResult<usize> {
        if self.mode != EncryptionMode::Encrypt {
            return Err(CtrvError::Security("stream is open for decryption".into()));
        }
        if buf.is_empty() {
            return Ok(0);
        }
        let align = self.alignment();
        if self.position % align != 0 {
            return Err(CtrvError::Security(format!(
                "writes must start on a {align}-byte boundary, position is {}",
                self.position
            )));
        }

        let mut ciphertext = vec![0u8; buf.len()];
        self.transformer.sync_counter(self.position)?;
        self.transformer.encrypt_data(buf, &mut ciphertext)?;

        let physical = if self.chunk_size > 0 {
            let header = (self.position == 0).then_some(&self.header_bytes[..]);
            let hashes = self
                .integrity
                .generate_hashes(&ciphertext, header)?
                .unwrap_or_default();
            let mut out =
                Vec::with_capacity(ciphertext.len() + hashes.len() * self.hash_size as usize);
            for (hash, chunk) in hashes.iter().zip(ciphertext.chunks(self.chunk_size as usize)) {
                out.extend_from_slice(hash);
                out.extend_from_slice(chunk);
            }
            out
        } else {
            ciphertext
        };

        self.inner.seek(SeekFrom::Start(self.physical_offset(self.position)))?;
        self.inner.write_all(&physical)?;
        self.position += buf.len() as u64;
        Ok(buf.len())
    }

    pub fn flush(&mut self) -> CtrvResult<()> {
        self.inner.flush()?;
        Ok(())
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

/// Plaintext bytes in a physical stream. A trailing group holding only
/// (part of) a hash contributes nothing.
fn logical_length(physical: u64, chunk_size: u64, hash_size: u64) -> u64 {
    let body = physical.saturating_sub(HEADER_LENGTH as u64);
    if chunk_size == 0 {
        return body;
    }
    let group = chunk_size + hash_size;
    body / group * chunk_size + (body % group).saturating_sub(hash_size)
}

fn to_io(err: CtrvError) -> io::Error {
    match err {
        CtrvError::Io(e) => e,
        CtrvError::Integrity(_) => io::Error::new(io::ErrorKind::InvalidData, err),
        other => io::Error::other(other),
    }
}

impl<S: RandomAccessStream> Read for AesStream<S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.read_data(buf).map_err(to_io)
    }
}

impl<S: RandomAccessStream> Write for AesStream<S> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_data(buf).map_err(to_io)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl<S: RandomAccessStream> Seek for AesStream<S> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(p) => Some(p),
            SeekFrom::End(off) => self.length().map_err(to_io)?.checked_add_signed(off),
            SeekFrom::Current(off) => self.position.checked_add_signed(off),
        };
        let target = target.ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "seek to a negative or overflowing position")
        })?;
        self.set_position(target).map_err(to_io)?;
        Ok(target)
    }
}

impl<S: RandomAccessStream> std::fmt::Debug for AesStream<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AesStream")
            .field("mode", &self.mode)
            .field("chunk_size", &self.chunk_size)
            .field("position", &self.position)
            .field("integrity", &self.integrity.is_enabled())
            .finish()
    }
}
