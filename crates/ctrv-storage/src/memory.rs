//! In-memory backend, used by tests and for small scratch buffers

use std::io::{self, Read, Seek, SeekFrom, Write};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::file::{RandomAccessStream, RealFile};

type Shared = Arc<Mutex<Option<Vec<u8>>>>;

fn lock(inner: &Shared) -> io::Result<MutexGuard<'_, Option<Vec<u8>>>> {
    inner
        .lock()
        .map_err(|_| io::Error::other("memory file lock poisoned"))
}

/// A file whose contents live in a shared buffer. Clones refer to the same
/// contents, so a test can keep one handle and hand another to a transfer.
#[derive(Debug, Clone)]
pub struct MemoryFile {
    name: String,
    inner: Shared,
}

impl MemoryFile {
    /// A file that does not exist yet
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            inner: Arc::new(Mutex::new(None)),
        }
    }

    pub fn with_contents(name: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            inner: Arc::new(Mutex::new(Some(data))),
        }
    }

    /// Snapshot of the contents, None if the file does not exist
    pub fn contents(&self) -> Option<Vec<u8>> {
        lock(&self.inner).ok().and_then(|g| g.clone())
    }
}

impl RealFile for MemoryFile {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn exists(&self) -> bool {
        lock(&self.inner).map(|g| g.is_some()).unwrap_or(false)
    }

    fn length(&self) -> io::Result<u64> {
        match lock(&self.inner)?.as_ref() {
            Some(data) => Ok(data.len() as u64),
            None => Err(not_found(&self.name)),
        }
    }

    fn open_read(&self) -> io::Result<Box<dyn RandomAccessStream>> {
        if !self.exists() {
            return Err(not_found(&self.name));
        }
        Ok(Box::new(MemoryStream::new(self.inner.clone())))
    }

    fn open_write(&self) -> io::Result<Box<dyn RandomAccessStream>> {
        lock(&self.inner)?.get_or_insert_with(Vec::new);
        Ok(Box::new(MemoryStream::new(self.inner.clone())))
    }

    fn delete(&self) -> io::Result<bool> {
        Ok(lock(&self.inner)?.take().is_some())
    }
}

fn not_found(name: &str) -> io::Error {
    io::Error::new(io::ErrorKind::NotFound, format!("{name}: no such memory file"))
}

/// Positioned handle over a [`MemoryFile`]
#[derive(Debug)]
pub struct MemoryStream {
    inner: Shared,
    position: u64,
}

impl MemoryStream {
    fn new(inner: Shared) -> Self {
        Self { inner, position: 0 }
    }
}

impl Read for MemoryStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let guard = lock(&self.inner)?;
        let data = guard.as_ref().ok_or_else(|| not_found("stream"))?;
        let start = (self.position as usize).min(data.len());
        let n = buf.len().min(data.len() - start);
        buf[..n].copy_from_slice(&data[start..start + n]);
        self.position += n as u64;
        Ok(n)
    }
}

impl Write for MemoryStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut guard = lock(&self.inner)?;
        let data = guard.as_mut().ok_or_else(|| not_found("stream"))?;
        let start = self.position as usize;
        let end = start + buf.len();
        if data.len() < end {
            data.resize(end, 0);
        }
        data[start..end].copy_from_slice(buf);
        self.position = end as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Seek for MemoryStream {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let len = self.length()? as i128;
        let target = match pos {
            SeekFrom::Start(p) => p as i128,
            SeekFrom::End(off) => len + off as i128,
            SeekFrom::Current(off) => self.position as i128 + off as i128,
        };
        if target < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek before start of stream",
            ));
        }
        self.position = target as u64;
        Ok(self.position)
    }
}

impl RandomAccessStream for MemoryStream {
    fn length(&mut self) -> io::Result<u64> {
        let guard = lock(&self.inner)?;
        Ok(guard.as_ref().map(|d| d.len() as u64).unwrap_or(0))
    }

    fn set_length(&mut self, len: u64) -> io::Result<()> {
        let mut guard = lock(&self.inner)?;
        let data = guard.as_mut().ok_or_else(|| not_found("stream"))?;
        data.resize(len as usize, 0);
        Ok(())
    }
}
