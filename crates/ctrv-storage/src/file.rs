//! Stream and file traits implemented by every backend

use std::fmt::Debug;
use std::io::{self, Read, Seek, SeekFrom, Write};

/// A seekable byte stream with a queryable and settable length.
pub trait RandomAccessStream: Read + Write + Seek + Send {
    /// Current length of the underlying storage in bytes
    fn length(&mut self) -> io::Result<u64>;

    /// Truncate or extend the underlying storage
    fn set_length(&mut self, len: u64) -> io::Result<()>;
}

impl<S: RandomAccessStream + ?Sized> RandomAccessStream for Box<S> {
    fn length(&mut self) -> io::Result<u64> {
        (**self).length()
    }

    fn set_length(&mut self, len: u64) -> io::Result<()> {
        (**self).set_length(len)
    }
}

impl RandomAccessStream for std::fs::File {
    fn length(&mut self) -> io::Result<u64> {
        Ok(self.metadata()?.len())
    }

    fn set_length(&mut self, len: u64) -> io::Result<()> {
        std::fs::File::set_len(self, len)
    }
}

/// A file on some backend. Handles are cheap to share across worker threads;
/// every `open_*` call returns an independent stream.
pub trait RealFile: Send + Sync + Debug {
    /// Base name of the file
    fn name(&self) -> String;

    fn exists(&self) -> bool;

    /// Length in bytes, or NotFound
    fn length(&self) -> io::Result<u64>;

    /// Open a new read handle positioned at 0
    fn open_read(&self) -> io::Result<Box<dyn RandomAccessStream>>;

    /// Open a new read/write handle positioned at 0, creating the file if
    /// missing. Existing contents are kept.
    fn open_write(&self) -> io::Result<Box<dyn RandomAccessStream>>;

    /// Delete the file. Returns false if it did not exist.
    fn delete(&self) -> io::Result<bool>;

    /// Read the whole file
    fn read_contents(&self) -> io::Result<Vec<u8>> {
        let mut stream = self.open_read()?;
        let mut data = Vec::new();
        stream.read_to_end(&mut data)?;
        Ok(data)
    }

    /// Replace the whole file with `data`, leaving no trace of the previous
    /// contents. Backends that can do better than truncate-and-write (e.g.
    /// rename over the old file) override this.
    fn replace_contents(&self, data: &[u8]) -> io::Result<()> {
        let mut stream = self.open_write()?;
        stream.set_length(0)?;
        stream.seek(SeekFrom::Start(0))?;
        stream.write_all(data)?;
        stream.flush()
    }
}
