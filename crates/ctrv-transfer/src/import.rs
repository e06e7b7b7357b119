//! Plaintext → encrypted file

use std::io::Write;
use std::sync::Arc;

use tracing::debug;

use ctrv_core::config::IntegrityConfig;
use ctrv_core::types::{EncryptionMode, BLOCK_SIZE, DEFAULT_CHUNK_SIZE, MAX_CHUNK_SIZE};
use ctrv_core::{CtrvError, CtrvResult};
use ctrv_crypto::{AesStream, BlockCipherProvider, DriveKey, StreamHeader};
use ctrv_sequence::NonceSequencer;
use ctrv_storage::{RandomAccessStream, RealFile};

use crate::engine::{ProgressFn, TransferEngine, TransferJob};
use crate::parts::{PartSource, PartTarget, PlainPart};

/// Encrypts files into a drive. Each import takes exactly one nonce from the
/// sequencer, shared by every worker of that file.
#[derive(Debug)]
pub struct FileImporter {
    key: DriveKey,
    provider: Arc<dyn BlockCipherProvider>,
    chunk_size: usize,
}

impl FileImporter {
    /// `integrity == false` writes raw ciphertext; otherwise `chunk_size == 0`
    /// selects the default chunk size.
    pub fn new(
        key: DriveKey,
        provider: Arc<dyn BlockCipherProvider>,
        integrity: bool,
        chunk_size: usize,
    ) -> CtrvResult<Self> {
        if chunk_size % BLOCK_SIZE != 0 || chunk_size > MAX_CHUNK_SIZE {
            return Err(CtrvError::Integrity(format!(
                "invalid chunk size {chunk_size}: must be a multiple of {BLOCK_SIZE} \
                 no larger than {MAX_CHUNK_SIZE}"
            )));
        }
        let chunk_size = match (integrity, chunk_size) {
            (false, _) => 0,
            (true, 0) => DEFAULT_CHUNK_SIZE,
            (true, n) => n,
        };
        Ok(Self {
            key,
            provider,
            chunk_size,
        })
    }

    pub fn from_config(
        key: DriveKey,
        provider: Arc<dyn BlockCipherProvider>,
        config: &IntegrityConfig,
    ) -> CtrvResult<Self> {
        Self::new(key, provider, config.enabled, config.chunk_size)
    }

    /// Chunk size written to stream headers, 0 without integrity
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Encrypt `source` into `target` under a fresh nonce for `drive_id`.
    ///
    /// Returns the target, or `None` if the transfer was cancelled. A failed
    /// or cancelled import leaves no target behind; the nonce is spent
    /// either way.
    pub fn import(
        &self,
        engine: &TransferEngine,
        sequencer: &dyn NonceSequencer,
        drive_id: &str,
        source: Arc<dyn RealFile>,
        target: Arc<dyn RealFile>,
        delete_source: bool,
        progress: Option<&ProgressFn>,
    ) -> CtrvResult<Option<Arc<dyn RealFile>>> {
        if engine.is_running() {
            return Err(CtrvError::Transfer("another transfer is already running".into()));
        }
        let file_size = source.length()?;
        let nonce = sequencer.next_nonce(drive_id)?;
        let header = StreamHeader::new(self.chunk_size, nonce)?;
        debug!(
            source = %source.name(),
            dest = %target.name(),
            file_size,
            chunk_size = self.chunk_size,
            "importing"
        );

        let job = ImportJob {
            importer: self,
            header,
            source,
            target,
            file_size,
        };
        engine.run(&job, delete_source, progress)
    }
}

struct ImportJob<'a> {
    importer: &'a FileImporter,
    header: StreamHeader,
    source: Arc<dyn RealFile>,
    target: Arc<dyn RealFile>,
    file_size: u64,
}

impl TransferJob for ImportJob<'_> {
    fn file_size(&self) -> u64 {
        self.file_size
    }

    fn minimum_part_size(&self) -> u64 {
        match self.header.chunk_size {
            0 => BLOCK_SIZE as u64,
            n => n as u64,
        }
    }

    /// Truncate, write the header and pre-size to the final physical length
    /// so workers can write their ranges in any order.
    fn prepare(&self) -> CtrvResult<()> {
        let mut out = self.target.open_write()?;
        out.set_length(0)?;
        self.header.write_to(&mut out)?;
        out.set_length(AesStream::<Box<dyn RandomAccessStream>>::output_size(
            EncryptionMode::Encrypt,
            self.file_size,
            self.header.chunk_size as u64,
        ))?;
        out.flush()?;
        Ok(())
    }

    fn open_source(&self, start: u64) -> CtrvResult<Box<dyn PartSource>> {
        Ok(Box::new(PlainPart::open(self.source.open_read()?, start)?))
    }

    fn open_target(&self, start: u64) -> CtrvResult<Box<dyn PartTarget>> {
        let mut stream = AesStream::encryptor(
            self.target.open_write()?,
            &self.importer.key,
            self.header,
            self.importer.provider.clone(),
        )?;
        stream.set_allow_range_write(true);
        stream.set_position(start)?;
        Ok(Box::new(stream))
    }

    fn target(&self) -> Arc<dyn RealFile> {
        self.target.clone()
    }

    fn source(&self) -> Arc<dyn RealFile> {
        self.source.clone()
    }
}
