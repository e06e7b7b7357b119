//! Encrypted stream header
//!
//! ```text
//! [ magic "CTV" (3) | version (1) | chunk size u32 BE (4) | nonce (8) ]
//! ```

use std::io::{Read, Write};

use ctrv_core::types::{MAX_CHUNK_SIZE, NONCE_LENGTH};
use ctrv_core::{CtrvError, CtrvResult};

pub const MAGIC: &[u8; 3] = b"CTV";
pub const VERSION: u8 = 1;
pub const HEADER_LENGTH: usize = MAGIC.len() + 1 + 4 + NONCE_LENGTH;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamHeader {
    /// Integrity chunk size, 0 when the body carries no hashes
    pub chunk_size: u32,
    pub nonce: [u8; NONCE_LENGTH],
}

impl StreamHeader {
    pub fn new(chunk_size: usize, nonce: [u8; NONCE_LENGTH]) -> CtrvResult<Self> {
        if chunk_size > MAX_CHUNK_SIZE {
            return Err(CtrvError::Integrity(format!(
                "chunk size {chunk_size} exceeds {MAX_CHUNK_SIZE}"
            )));
        }
        Ok(Self {
            chunk_size: chunk_size as u32,
            nonce,
        })
    }

    pub fn to_bytes(&self) -> [u8; HEADER_LENGTH] {
        let mut out = [0u8; HEADER_LENGTH];
        out[..3].copy_from_slice(MAGIC);
        out[3] = VERSION;
        out[4..8].copy_from_slice(&self.chunk_size.to_be_bytes());
        out[8..].copy_from_slice(&self.nonce);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> CtrvResult<Self> {
        if bytes.len() < HEADER_LENGTH {
            return Err(CtrvError::Integrity(format!(
                "stream header truncated: {} bytes",
                bytes.len()
            )));
        }
        if &bytes[..3] != MAGIC {
            return Err(CtrvError::Integrity("not an encrypted stream (bad magic)".into()));
        }
        if bytes[3] != VERSION {
            return Err(CtrvError::Integrity(format!(
                "unsupported stream version {}",
                bytes[3]
            )));
        }
        let mut chunk = [0u8; 4];
        chunk.copy_from_slice(&bytes[4..8]);
        let mut nonce = [0u8; NONCE_LENGTH];
        nonce.copy_from_slice(&bytes[8..HEADER_LENGTH]);
        Self::new(u32::from_be_bytes(chunk) as usize, nonce)
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size as usize
    }

    pub fn read_from<R: Read + ?Sized>(reader: &mut R) -> CtrvResult<Self> {
        let mut buf = [0u8; HEADER_LENGTH];
        reader.read_exact(&mut buf)?;
        Self::from_bytes(&buf)
    }

    pub fn write_to<W: Write + ?Sized>(&self, writer: &mut W) -> CtrvResult<()> {
        writer.write_all(&self.to_bytes())?;
        Ok(())
    }
}
