//! AES-256-CTR transform engine
//!
//! One `CtrTransformer` per open stream. It owns the key schedule, the nonce
//! and the running counter, and is never shared between threads; parallel
//! workers each build their own from the same `(key, nonce)`.

use std::sync::Arc;

use aes::cipher::KeyInit;
use aes::Aes256;

use ctrv_core::types::{BLOCK_SIZE, KEY_LENGTH};
use ctrv_core::{CtrvError, CtrvResult};

use crate::provider::BlockCipherProvider;

pub struct CtrTransformer {
    provider: Arc<dyn BlockCipherProvider>,
    cipher: Option<Aes256>,
    nonce: Vec<u8>,
    counter: [u8; BLOCK_SIZE],
    block: u64,
}

impl CtrTransformer {
    /// An uninitialized transformer. Every data call fails until `init`.
    pub fn new(provider: Arc<dyn BlockCipherProvider>) -> Self {
        Self {
            provider,
            cipher: None,
            nonce: Vec::new(),
            counter: [0u8; BLOCK_SIZE],
            block: 0,
        }
    }

    /// Load the key schedule and place the nonce at the head of the counter.
    pub fn init(&mut self, key: &[u8], nonce: &[u8]) -> CtrvResult<()> {
        if key.len() != KEY_LENGTH {
            return Err(CtrvError::Security(format!(
                "key must be {KEY_LENGTH} bytes, got {}",
                key.len()
            )));
        }
        if nonce.is_empty() || nonce.len() > BLOCK_SIZE {
            return Err(CtrvError::Security(format!(
                "nonce must be 1..={BLOCK_SIZE} bytes, got {}",
                nonce.len()
            )));
        }
        let cipher = Aes256::new_from_slice(key)
            .map_err(|_| CtrvError::Security("invalid key length".into()))?;
        self.cipher = Some(cipher);
        self.nonce = nonce.to_vec();
        self.reset_counter()
    }

    pub fn is_initialized(&self) -> bool {
        self.cipher.is_some()
    }

    fn ensure_initialized(&self) -> CtrvResult<&Aes256> {
        self.cipher
            .as_ref()
            .ok_or_else(|| CtrvError::Security("not initialized".into()))
    }

    /// Counter back to `nonce ++ 0`.
    pub fn reset_counter(&mut self) -> CtrvResult<()> {
        self.ensure_initialized()?;
        self.counter = [0u8; BLOCK_SIZE];
        self.counter[..self.nonce.len()].copy_from_slice(&self.nonce);
        self.block = 0;
        Ok(())
    }

    /// Point the counter at the block containing logical `position`.
    pub fn sync_counter(&mut self, position: u64) -> CtrvResult<()> {
        self.reset_counter()?;
        self.increase_counter(position / BLOCK_SIZE as u64)
    }

    /// Advance the block index by `value`. A carry that would reach a nonce
    /// byte fails with `RangeExceeded` and leaves the counter as it was.
    pub fn increase_counter(&mut self, value: u64) -> CtrvResult<()> {
        self.ensure_initialized()?;
        let (counter, block) = self.advanced(value)?;
        self.counter = counter;
        self.block = block;
        Ok(())
    }

    fn advanced(&self, value: u64) -> CtrvResult<([u8; BLOCK_SIZE], u64)> {
        let exceeded = || {
            CtrvError::RangeExceeded(format!(
                "counter for a {}-byte nonce cannot advance {value} more blocks",
                self.nonce.len()
            ))
        };
        let mut counter = self.counter;
        let mut carry = value as u128;
        let mut index = BLOCK_SIZE;
        while carry > 0 {
            if index == self.nonce.len() {
                return Err(exceeded());
            }
            index -= 1;
            let sum = counter[index] as u128 + (carry & 0xFF);
            counter[index] = sum as u8;
            carry = (carry >> 8) + (sum >> 8);
        }
        let block = self.block.checked_add(value).ok_or_else(exceeded)?;
        Ok((counter, block))
    }

    /// XOR keystream over `src` into `dest`, advancing one counter value per
    /// started block. A partial final block still consumes its whole counter
    /// value, so callers continuing mid-block must `sync_counter` first.
    pub fn encrypt_data(&mut self, src: &[u8], dest: &mut [u8]) -> CtrvResult<usize> {
        let cipher = self.ensure_initialized()?;
        let count = src.len().min(dest.len());
        if count == 0 {
            return Ok(0);
        }
        let blocks = count.div_ceil(BLOCK_SIZE) as u64;
        // Validate before producing output so an overflow never emits keystream
        // generated from a wrapped counter.
        let (counter, block) = self.advanced(blocks)?;
        let written = self
            .provider
            .transform(cipher, &self.counter, &src[..count], &mut dest[..count]);
        self.counter = counter;
        self.block = block;
        Ok(written)
    }

    /// CTR decryption is the same keystream XOR.
    pub fn decrypt_data(&mut self, src: &[u8], dest: &mut [u8]) -> CtrvResult<usize> {
        self.encrypt_data(src, dest)
    }

    pub fn nonce(&self) -> &[u8] {
        &self.nonce
    }

    pub fn counter(&self) -> &[u8; BLOCK_SIZE] {
        &self.counter
    }

    /// Blocks advanced since the nonce position
    pub fn block(&self) -> u64 {
        self.block
    }

    pub fn provider_name(&self) -> &'static str {
        self.provider.name()
    }
}

impl std::fmt::Debug for CtrTransformer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CtrTransformer")
            .field("provider", &self.provider.name())
            .field("initialized", &self.is_initialized())
            .field("nonce_len", &self.nonce.len())
            .field("block", &self.block)
            .finish()
    }
}
