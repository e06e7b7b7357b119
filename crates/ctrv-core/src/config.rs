use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{CtrvError, CtrvResult};
use crate::types::{ProviderType, BLOCK_SIZE, DEFAULT_CHUNK_SIZE, MAX_CHUNK_SIZE};

/// Top-level configuration (loaded from ctrv.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CtrvConfig {
    pub transfer: TransferConfig,
    pub integrity: IntegrityConfig,
    pub crypto: CryptoConfig,
    pub sequencer: SequencerConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Worker thread count per file (0 = cpu_count)
    pub threads: usize,
    /// Read/write buffer per worker in bytes, aligned down to the part size
    pub buffer_size: usize,
    /// Delete the source file after a successful import/export
    pub delete_source: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IntegrityConfig {
    /// Interleave an HMAC-SHA256 before every chunk of ciphertext
    pub enabled: bool,
    /// Chunk size in bytes (0 = default 256 KiB when enabled)
    pub chunk_size: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CryptoConfig {
    /// Block cipher provider: "auto", "portable" or "accelerated"
    pub provider: ProviderType,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SequencerConfig {
    /// Nonce sequence file (JSON)
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level (default: info)
    pub level: String,
    /// Log format: "json" or "text"
    pub format: String,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            threads: 0,
            buffer_size: 512 * 1024,
            delete_source: false,
        }
    }
}

impl Default for IntegrityConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

impl Default for SequencerConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("~/.local/share/ctrv/sequencer.json"),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
        }
    }
}

impl TransferConfig {
    /// Thread count with `0` resolved to the available parallelism.
    pub fn effective_threads(&self) -> usize {
        if self.threads > 0 {
            return self.threads;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }
}

impl CtrvConfig {
    /// Load a config file, falling back to defaults when it does not exist.
    pub fn load(path: &Path) -> CtrvResult<Self> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        let config: CtrvConfig = toml::from_str(&content)
            .map_err(|e| CtrvError::Config(format!("parsing {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> CtrvResult<()> {
        let chunk = self.integrity.chunk_size;
        if chunk % BLOCK_SIZE != 0 || chunk > MAX_CHUNK_SIZE {
            return Err(CtrvError::Config(format!(
                "integrity.chunk_size must be a multiple of {BLOCK_SIZE} and at most {MAX_CHUNK_SIZE}, got {chunk}"
            )));
        }
        if self.transfer.buffer_size == 0 {
            return Err(CtrvError::Config("transfer.buffer_size must be non-zero".into()));
        }
        if !matches!(self.log.format.as_str(), "json" | "text") {
            return Err(CtrvError::Config(format!(
                "log.format must be \"json\" or \"text\", got {:?}",
                self.log.format
            )));
        }
        Ok(())
    }
}
