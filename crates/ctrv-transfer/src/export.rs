//! Encrypted → plaintext file

use std::io::Write;
use std::sync::Arc;

use tracing::debug;

use ctrv_core::types::{EncryptionMode, BLOCK_SIZE};
use ctrv_core::{CtrvError, CtrvResult};
use ctrv_crypto::{AesStream, BlockCipherProvider, DriveKey, StreamHeader};
use ctrv_storage::{RandomAccessStream, RealFile};

use crate::engine::{ProgressFn, TransferEngine, TransferJob};
use crate::parts::{PartSource, PartTarget, PlainPart};

/// Decrypts files out of a drive, verifying chunk hashes when asked to.
#[derive(Debug)]
pub struct FileExporter {
    key: DriveKey,
    provider: Arc<dyn BlockCipherProvider>,
    verify: bool,
}

impl FileExporter {
    pub fn new(key: DriveKey, provider: Arc<dyn BlockCipherProvider>, verify: bool) -> Self {
        Self {
            key,
            provider,
            verify,
        }
    }

    /// Decrypt `source` into `target`.
    ///
    /// With verification on, a stream without hashes is rejected and any
    /// tampered chunk fails the export with an integrity error. Returns
    /// `None` if cancelled; failed or cancelled exports delete the target.
    pub fn export(
        &self,
        engine: &TransferEngine,
        source: Arc<dyn RealFile>,
        target: Arc<dyn RealFile>,
        delete_source: bool,
        progress: Option<&ProgressFn>,
    ) -> CtrvResult<Option<Arc<dyn RealFile>>> {
        let mut input = source.open_read()?;
        let header = StreamHeader::read_from(&mut input)?;
        if self.verify && header.chunk_size == 0 {
            return Err(CtrvError::Integrity(format!(
                "{} carries no integrity hashes",
                source.name()
            )));
        }
        let physical = input.length()?;
        if AesStream::<Box<dyn RandomAccessStream>>::ends_in_hash(
            physical,
            header.chunk_size as u64,
        ) {
            return Err(CtrvError::Integrity(format!(
                "{} is truncated inside a chunk hash",
                source.name()
            )));
        }
        let file_size = AesStream::<Box<dyn RandomAccessStream>>::output_size(
            EncryptionMode::Decrypt,
            physical,
            header.chunk_size as u64,
        );
        drop(input);
        debug!(
            source = %source.name(),
            dest = %target.name(),
            file_size,
            chunk_size = header.chunk_size,
            verify = self.verify,
            "exporting"
        );

        let job = ExportJob {
            exporter: self,
            header,
            source,
            target,
            file_size,
        };
        engine.run(&job, delete_source, progress)
    }
}

struct ExportJob<'a> {
    exporter: &'a FileExporter,
    header: StreamHeader,
    source: Arc<dyn RealFile>,
    target: Arc<dyn RealFile>,
    file_size: u64,
}

impl TransferJob for ExportJob<'_> {
    fn file_size(&self) -> u64 {
        self.file_size
    }

    fn minimum_part_size(&self) -> u64 {
        match self.header.chunk_size {
            0 => BLOCK_SIZE as u64,
            n => n as u64,
        }
    }

    fn prepare(&self) -> CtrvResult<()> {
        let mut out = self.target.open_write()?;
        out.set_length(0)?;
        out.set_length(self.file_size)?;
        out.flush()?;
        Ok(())
    }

    fn open_source(&self, start: u64) -> CtrvResult<Box<dyn PartSource>> {
        let mut stream = AesStream::decryptor(
            self.source.open_read()?,
            &self.exporter.key,
            self.header,
            self.exporter.verify,
            self.exporter.provider.clone(),
        )?;
        stream.set_position(start)?;
        Ok(Box::new(stream))
    }

    fn open_target(&self, start: u64) -> CtrvResult<Box<dyn PartTarget>> {
        Ok(Box::new(PlainPart::open(self.target.open_write()?, start)?))
    }

    fn target(&self) -> Arc<dyn RealFile> {
        self.target.clone()
    }

    fn source(&self) -> Arc<dyn RealFile> {
        self.source.clone()
    }
}
