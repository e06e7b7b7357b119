//! ctrv-storage: the positioned stream/file boundary consumed by the crypto core
//!
//! Backends only need to honor positioned reads and writes; each worker of a
//! parallel transfer opens its own handle, so no cross-handle locking is
//! required of them.

pub mod file;
pub mod local;
pub mod memory;

pub use file::{RandomAccessStream, RealFile};
pub use local::LocalFile;
pub use memory::{MemoryFile, MemoryStream};
