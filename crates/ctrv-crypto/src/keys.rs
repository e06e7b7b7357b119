//! Drive keys: one AES-256 encryption key plus one HMAC-SHA256 key

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rand::RngCore;
use zeroize::Zeroize;

use ctrv_core::types::{HASH_KEY_LENGTH, KEY_LENGTH};
use ctrv_core::{CtrvError, CtrvResult};

/// Combined length of the encryption and hash keys
pub const DRIVE_KEY_LENGTH: usize = KEY_LENGTH + HASH_KEY_LENGTH;

/// The key pair a drive encrypts and authenticates with. Zeroized on drop.
#[derive(Clone)]
pub struct DriveKey {
    enc_key: [u8; KEY_LENGTH],
    hash_key: [u8; HASH_KEY_LENGTH],
}

impl DriveKey {
    pub fn from_parts(enc_key: [u8; KEY_LENGTH], hash_key: [u8; HASH_KEY_LENGTH]) -> Self {
        Self { enc_key, hash_key }
    }

    /// Parse `enc_key ++ hash_key`
    pub fn from_bytes(bytes: &[u8]) -> CtrvResult<Self> {
        if bytes.len() != DRIVE_KEY_LENGTH {
            return Err(CtrvError::Security(format!(
                "drive key must be {DRIVE_KEY_LENGTH} bytes, got {}",
                bytes.len()
            )));
        }
        let mut enc_key = [0u8; KEY_LENGTH];
        let mut hash_key = [0u8; HASH_KEY_LENGTH];
        enc_key.copy_from_slice(&bytes[..KEY_LENGTH]);
        hash_key.copy_from_slice(&bytes[KEY_LENGTH..]);
        Ok(Self { enc_key, hash_key })
    }

    pub fn from_base64(encoded: &str) -> CtrvResult<Self> {
        let mut bytes = BASE64
            .decode(encoded.trim())
            .map_err(|e| CtrvError::Security(format!("invalid drive key encoding: {e}")))?;
        let key = Self::from_bytes(&bytes);
        bytes.zeroize();
        key
    }

    /// `enc_key ++ hash_key`, base64 encoded
    pub fn to_base64(&self) -> String {
        let mut bytes = [0u8; DRIVE_KEY_LENGTH];
        bytes[..KEY_LENGTH].copy_from_slice(&self.enc_key);
        bytes[KEY_LENGTH..].copy_from_slice(&self.hash_key);
        let encoded = BASE64.encode(bytes);
        bytes.zeroize();
        encoded
    }

    pub fn enc_key(&self) -> &[u8; KEY_LENGTH] {
        &self.enc_key
    }

    pub fn hash_key(&self) -> &[u8; HASH_KEY_LENGTH] {
        &self.hash_key
    }
}

impl Drop for DriveKey {
    fn drop(&mut self) {
        self.enc_key.zeroize();
        self.hash_key.zeroize();
    }
}

impl std::fmt::Debug for DriveKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriveKey")
            .field("enc_key", &"[REDACTED]")
            .field("hash_key", &"[REDACTED]")
            .finish()
    }
}

/// Generate a random drive key pair.
pub fn generate_drive_key() -> DriveKey {
    let mut enc_key = [0u8; KEY_LENGTH];
    let mut hash_key = [0u8; HASH_KEY_LENGTH];
    rand::thread_rng().fill_bytes(&mut enc_key);
    rand::thread_rng().fill_bytes(&mut hash_key);
    DriveKey::from_parts(enc_key, hash_key)
}
