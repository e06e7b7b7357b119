//! Per-worker source and target handles

use std::io::{Read, Seek, SeekFrom, Write};

use ctrv_core::CtrvResult;
use ctrv_crypto::AesStream;
use ctrv_storage::RandomAccessStream;

/// Sequential reader over one worker's range
pub trait PartSource: Send {
    /// Read up to `buf.len()` bytes; 0 means end of data.
    fn read_part(&mut self, buf: &mut [u8]) -> CtrvResult<usize>;
}

/// Sequential writer over one worker's range
pub trait PartTarget: Send {
    fn write_part(&mut self, buf: &[u8]) -> CtrvResult<()>;

    fn flush_part(&mut self) -> CtrvResult<()>;
}

/// Unencrypted stream positioned at a worker's range start
pub struct PlainPart(Box<dyn RandomAccessStream>);

impl PlainPart {
    pub fn open(mut stream: Box<dyn RandomAccessStream>, start: u64) -> CtrvResult<Self> {
        stream.seek(SeekFrom::Start(start))?;
        Ok(Self(stream))
    }
}

impl PartSource for PlainPart {
    fn read_part(&mut self, buf: &mut [u8]) -> CtrvResult<usize> {
        Ok(self.0.read(buf)?)
    }
}

impl PartTarget for PlainPart {
    fn write_part(&mut self, buf: &[u8]) -> CtrvResult<()> {
        self.0.write_all(buf)?;
        Ok(())
    }

    fn flush_part(&mut self) -> CtrvResult<()> {
        self.0.flush()?;
        Ok(())
    }
}

impl<S: RandomAccessStream> PartSource for AesStream<S> {
    fn read_part(&mut self, buf: &mut [u8]) -> CtrvResult<usize> {
        self.read_data(buf)
    }
}

impl<S: RandomAccessStream> PartTarget for AesStream<S> {
    fn write_part(&mut self, buf: &[u8]) -> CtrvResult<()> {
        self.write_data(buf)?;
        Ok(())
    }

    fn flush_part(&mut self) -> CtrvResult<()> {
        self.flush()
    }
}

/// Fill `buf` unless the source ends first. Targets need whole buffers so
/// every write but the last stays chunk aligned.
pub fn read_full(source: &mut dyn PartSource, buf: &mut [u8]) -> CtrvResult<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = source.read_part(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ctrv_storage::{MemoryFile, RealFile};

    /// Hands out at most 3 bytes per call
    struct Trickle(Vec<u8>, usize);

    impl PartSource for Trickle {
        fn read_part(&mut self, buf: &mut [u8]) -> CtrvResult<usize> {
            let n = buf.len().min(3).min(self.0.len() - self.1);
            buf[..n].copy_from_slice(&self.0[self.1..self.1 + n]);
            self.1 += n;
            Ok(n)
        }
    }

    #[test]
    fn test_read_full_loops_short_reads() {
        let mut src = Trickle((0..20).collect(), 0);
        let mut buf = [0u8; 16];
        assert_eq!(read_full(&mut src, &mut buf).unwrap(), 16);
        assert_eq!(read_full(&mut src, &mut buf).unwrap(), 4);
        assert_eq!(read_full(&mut src, &mut buf).unwrap(), 0);
    }

    #[test]
    fn test_plain_part_positions() {
        let file = MemoryFile::with_contents("p", b"abcdefgh".to_vec());
        let mut part = PlainPart::open(file.open_read().unwrap(), 5).unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(read_full(&mut part, &mut buf).unwrap(), 3);
        assert_eq!(&buf[..3], b"fgh");

        let mut out = PlainPart::open(file.open_write().unwrap(), 2).unwrap();
        out.write_part(b"XY").unwrap();
        out.flush_part().unwrap();
        assert_eq!(file.contents().unwrap(), b"abXYefgh");
    }
}
