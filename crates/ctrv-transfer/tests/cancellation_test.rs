//! Stopping a transfer: user cancellation, a failing worker and a busy engine.
//!
//! In every case the partial target must be gone afterwards and the source
//! must be untouched.

use std::io::{self, Read, Seek, SeekFrom, Write};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use ctrv_core::{CtrvError, ProviderType};
use ctrv_crypto::{create_provider, nonce_from_u64, DriveKey};
use ctrv_sequence::{FileSequencer, NonceSequencer};
use ctrv_storage::{MemoryFile, RandomAccessStream, RealFile};
use ctrv_transfer::{FileExporter, FileImporter, ProgressFn, TransferEngine};

const MIB: usize = 1024 * 1024;
const DRIVE: &str = "drive-1";

fn key() -> DriveKey {
    DriveKey::from_parts([3u8; 32], [4u8; 32])
}

fn sample(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

fn sequencer() -> FileSequencer {
    let seq = FileSequencer::json(Arc::new(MemoryFile::new("sequencer.json")));
    seq.create_sequence(DRIVE, "device").unwrap();
    seq.initialize_sequence(DRIVE, "device", &nonce_from_u64(1), &nonce_from_u64(1_000))
        .unwrap();
    seq
}

fn importer() -> FileImporter {
    FileImporter::new(key(), create_provider(ProviderType::Portable), true, 0).unwrap()
}

/// Progress callback that requests a stop on its first call
fn cancel_on_first_progress(engine: &TransferEngine, calls: Arc<AtomicUsize>) -> ProgressFn {
    let stop = engine.stop_handle();
    Box::new(move |_, _| {
        calls.fetch_add(1, Ordering::Relaxed);
        stop.stop();
    })
}

#[test]
fn cancelled_import_leaves_no_target() {
    let engine = TransferEngine::new(4, 256 * 1024).unwrap();
    let seq = sequencer();
    let data = sample(10 * MIB);
    let src = Arc::new(MemoryFile::with_contents("src", data.clone()));
    let enc = Arc::new(MemoryFile::new("enc"));
    let calls = Arc::new(AtomicUsize::new(0));
    let progress = cancel_on_first_progress(&engine, calls.clone());

    let result = importer()
        .import(&engine, &seq, DRIVE, src.clone(), enc.clone(), true, Some(&progress))
        .unwrap();
    assert!(result.is_none());
    assert!(!enc.exists());
    assert_eq!(src.contents().unwrap(), data, "source untouched");
    // At most one buffer per worker after the stop
    assert!(calls.load(Ordering::Relaxed) <= 4);
    assert!(!engine.is_running());
}

#[test]
fn cancelled_export_leaves_no_target() {
    let engine = TransferEngine::new(4, 256 * 1024).unwrap();
    let seq = sequencer();
    let src = Arc::new(MemoryFile::with_contents("src", sample(8 * MIB)));
    let enc = Arc::new(MemoryFile::new("enc"));
    importer()
        .import(&engine, &seq, DRIVE, src, enc.clone(), false, None)
        .unwrap()
        .unwrap();
    let physical = enc.contents().unwrap();

    let out = Arc::new(MemoryFile::new("out"));
    let progress = cancel_on_first_progress(&engine, Arc::new(AtomicUsize::new(0)));
    let result = FileExporter::new(key(), create_provider(ProviderType::Auto), true)
        .export(&engine, enc.clone(), out.clone(), true, Some(&progress))
        .unwrap();
    assert!(result.is_none());
    assert!(!out.exists());
    assert_eq!(enc.contents().unwrap(), physical);
}

#[test]
fn engine_is_reusable_after_cancel() {
    let engine = TransferEngine::new(2, 256 * 1024).unwrap();
    let seq = sequencer();
    let src = Arc::new(MemoryFile::with_contents("src", sample(3 * MIB)));

    let progress = cancel_on_first_progress(&engine, Arc::new(AtomicUsize::new(0)));
    let first = Arc::new(MemoryFile::new("first"));
    assert!(importer()
        .import(&engine, &seq, DRIVE, src.clone(), first, false, Some(&progress))
        .unwrap()
        .is_none());

    let second = Arc::new(MemoryFile::new("second"));
    assert!(importer()
        .import(&engine, &seq, DRIVE, src, second.clone(), false, None)
        .unwrap()
        .is_some());
    assert!(second.exists());
}

/// Memory file whose read handles fail once they pass `fail_at`
#[derive(Debug)]
struct FailingFile {
    inner: MemoryFile,
    fail_at: u64,
}

struct FailingStream {
    inner: Box<dyn RandomAccessStream>,
    position: u64,
    fail_at: u64,
}

impl Read for FailingStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.position + buf.len() as u64 > self.fail_at {
            return Err(io::Error::other("device unplugged"));
        }
        let n = self.inner.read(buf)?;
        self.position += n as u64;
        Ok(n)
    }
}

impl Write for FailingStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl Seek for FailingStream {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.position = self.inner.seek(pos)?;
        Ok(self.position)
    }
}

impl RandomAccessStream for FailingStream {
    fn length(&mut self) -> io::Result<u64> {
        self.inner.length()
    }

    fn set_length(&mut self, len: u64) -> io::Result<()> {
        self.inner.set_length(len)
    }
}

impl RealFile for FailingFile {
    fn name(&self) -> String {
        self.inner.name()
    }

    fn exists(&self) -> bool {
        self.inner.exists()
    }

    fn length(&self) -> io::Result<u64> {
        self.inner.length()
    }

    fn open_read(&self) -> io::Result<Box<dyn RandomAccessStream>> {
        Ok(Box::new(FailingStream {
            inner: self.inner.open_read()?,
            position: 0,
            fail_at: self.fail_at,
        }))
    }

    fn open_write(&self) -> io::Result<Box<dyn RandomAccessStream>> {
        self.inner.open_write()
    }

    fn delete(&self) -> io::Result<bool> {
        self.inner.delete()
    }
}

#[test]
fn worker_error_propagates_and_removes_target() {
    let engine = TransferEngine::new(4, 256 * 1024).unwrap();
    let seq = sequencer();
    let data = sample(6 * MIB);
    let src = Arc::new(FailingFile {
        inner: MemoryFile::with_contents("flaky", data.clone()),
        fail_at: 5 * MIB as u64,
    });
    let enc = Arc::new(MemoryFile::new("enc"));

    let err = importer()
        .import(&engine, &seq, DRIVE, src.clone(), enc.clone(), true, None)
        .unwrap_err();
    match err {
        CtrvError::Io(e) => assert_eq!(e.to_string(), "device unplugged"),
        other => panic!("expected the worker's I/O error, got {other}"),
    }
    assert!(!enc.exists());
    assert!(src.exists(), "delete_source only applies after success");
    assert_eq!(src.inner.contents().unwrap(), data);
    assert!(!engine.is_running());
}

#[test]
fn second_transfer_on_busy_engine_fails() {
    let engine = Arc::new(TransferEngine::new(2, 256 * 1024).unwrap());
    let seq = Arc::new(sequencer());
    let imp = Arc::new(importer());
    let src = Arc::new(MemoryFile::with_contents("src", sample(2 * MIB)));
    let enc = Arc::new(MemoryFile::new("enc"));

    let nested: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
    let tried = Arc::new(AtomicBool::new(false));
    let progress: ProgressFn = {
        let (engine, seq, imp, src, nested, tried) = (
            engine.clone(),
            seq.clone(),
            imp.clone(),
            src.clone(),
            nested.clone(),
            tried.clone(),
        );
        Box::new(move |_, _| {
            if tried.swap(true, Ordering::AcqRel) {
                return;
            }
            let other = Arc::new(MemoryFile::new("other"));
            let result = imp.import(&engine, seq.as_ref(), DRIVE, src.clone(), other, false, None);
            *nested.lock().unwrap() = Some(match result {
                Err(e) => e.to_string(),
                Ok(_) => "succeeded".into(),
            });
        })
    };

    imp.import(&engine, seq.as_ref(), DRIVE, src, enc.clone(), false, Some(&progress))
        .unwrap()
        .unwrap();
    let nested = nested.lock().unwrap().clone().unwrap();
    assert!(nested.contains("already running"), "{nested}");
    assert!(enc.exists());

    // The refused import did not spend a nonce
    let stored = seq.get_sequence(DRIVE).unwrap().unwrap();
    assert_eq!(stored.next_nonce.unwrap(), nonce_from_u64(2).to_vec());
}
