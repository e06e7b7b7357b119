//! ctrv-transfer: parallel import (plaintext → encrypted) and export
//! (encrypted → plaintext)
//!
//! A file is cut into partitions whose boundaries fall on integrity chunks
//! (or AES blocks), so every worker can encrypt, hash and write its range
//! with its own transformer and no coordination beyond a few atomics.

pub mod engine;
pub mod export;
pub mod import;
pub mod parts;

pub use engine::{
    PartitionPlan, ProgressFn, StopHandle, TransferEngine, TransferJob,
    MIN_FILE_SIZE_FOR_PARALLELISM,
};
pub use export::FileExporter;
pub use import::FileImporter;
pub use parts::{PartSource, PartTarget, PlainPart};
