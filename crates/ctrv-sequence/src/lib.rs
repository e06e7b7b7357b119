//! ctrv-sequence: durable nonce allocation
//!
//! Every mutation is a full read-modify-write of the record set under one
//! lock, and the advanced nonce is persisted before the allocated one is
//! returned. A crash can therefore skip a nonce but never hand one out twice.

pub mod record;
pub mod sequencer;
pub mod serializer;

pub use record::{NonceSequence, SequenceStatus};
pub use sequencer::{FileSequencer, NonceSequencer};
pub use serializer::{JsonSequenceSerializer, SequenceMap, SequenceSerializer};
