use serde::{Deserialize, Serialize};

/// AES block size, also the CTR counter width
pub const BLOCK_SIZE: usize = 16;

/// AES-256 key length
pub const KEY_LENGTH: usize = 32;

/// HMAC-SHA256 key length
pub const HASH_KEY_LENGTH: usize = 32;

/// HMAC-SHA256 output length
pub const HASH_RESULT_LENGTH: usize = 32;

/// Nonce length used by drives and the sequencer
pub const NONCE_LENGTH: usize = 8;

/// Default integrity chunk size (256 KiB)
pub const DEFAULT_CHUNK_SIZE: usize = 256 * 1024;

/// Largest accepted integrity chunk size (8 MiB)
pub const MAX_CHUNK_SIZE: usize = 8 * 1024 * 1024;

/// Direction of a stream or size computation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EncryptionMode {
    Encrypt,
    Decrypt,
}

/// Block cipher provider selection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderType {
    /// Accelerated when the CPU has AES instructions, portable otherwise
    #[default]
    Auto,
    /// One AES block per counter value
    Portable,
    /// Pipelined keystream generation (AES-NI / ARMv8 AES)
    Accelerated,
}

impl std::str::FromStr for ProviderType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(ProviderType::Auto),
            "portable" => Ok(ProviderType::Portable),
            "accelerated" => Ok(ProviderType::Accelerated),
            other => Err(format!("unknown provider type: {other}")),
        }
    }
}

impl std::fmt::Display for ProviderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderType::Auto => write!(f, "auto"),
            ProviderType::Portable => write!(f, "portable"),
            ProviderType::Accelerated => write!(f, "accelerated"),
        }
    }
}
