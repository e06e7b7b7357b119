//! Import/export through the parallel engine.
//!
//! Covers the 10 MiB / 4 thread partitioning, small and empty files, one
//! nonce per file, integrity failures surfacing from workers, and local files
//! on disk.

use std::io::{Read, Seek, SeekFrom};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ctrv_core::types::{EncryptionMode, DEFAULT_CHUNK_SIZE};
use ctrv_core::{CtrvError, ProviderType};
use ctrv_crypto::{create_provider, nonce_from_u64, AesStream, DriveKey, StreamHeader};
use ctrv_sequence::{FileSequencer, NonceSequencer};
use ctrv_storage::{LocalFile, MemoryFile, RandomAccessStream, RealFile};
use ctrv_transfer::{FileExporter, FileImporter, PartitionPlan, ProgressFn, TransferEngine};

const MIB: usize = 1024 * 1024;
const DRIVE: &str = "drive-1";
const DEVICE: &str = "laptop";

fn test_key() -> DriveKey {
    DriveKey::from_parts([7u8; 32], [9u8; 32])
}

fn sample(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i.wrapping_mul(31) ^ (i >> 9)) as u8).collect()
}

fn sequencer() -> FileSequencer {
    let seq = FileSequencer::json(Arc::new(MemoryFile::new("sequencer.json")));
    seq.create_sequence(DRIVE, DEVICE).unwrap();
    seq.initialize_sequence(DRIVE, DEVICE, &nonce_from_u64(100), &nonce_from_u64(10_000))
        .unwrap();
    seq
}

fn importer(integrity: bool, chunk_size: usize) -> FileImporter {
    FileImporter::new(
        test_key(),
        create_provider(ProviderType::Auto),
        integrity,
        chunk_size,
    )
    .unwrap()
}

fn exporter(verify: bool) -> FileExporter {
    FileExporter::new(test_key(), create_provider(ProviderType::Auto), verify)
}

fn header_of(file: &dyn RealFile) -> StreamHeader {
    let mut stream = file.open_read().unwrap();
    StreamHeader::read_from(&mut stream).unwrap()
}

#[test]
fn ten_mib_four_threads_roundtrip() {
    let data = sample(10 * MIB);
    let engine = TransferEngine::new(4, 512 * 1024).unwrap();
    let seq = sequencer();
    let source = Arc::new(MemoryFile::with_contents("plain.bin", data.clone()));
    let encrypted = Arc::new(MemoryFile::new("plain.bin.ctv"));
    let restored = Arc::new(MemoryFile::new("restored.bin"));

    let plan = PartitionPlan::new(data.len() as u64, 4, DEFAULT_CHUNK_SIZE as u64);
    assert_eq!(plan.partition_count, 4);
    assert_eq!(plan.partition_size, (10 * MIB / 4) as u64);

    let seen = Arc::new(AtomicU64::new(0));
    let seen_cb = seen.clone();
    let progress: ProgressFn = Box::new(move |done, total| {
        assert!(done <= total);
        seen_cb.fetch_max(done, Ordering::Relaxed);
    });

    let out = importer(true, 0)
        .import(&engine, &seq, DRIVE, source.clone(), encrypted.clone(), false, Some(&progress))
        .unwrap()
        .expect("import not cancelled");
    assert_eq!(out.name(), "plain.bin.ctv");
    assert_eq!(seen.load(Ordering::Relaxed), data.len() as u64);

    let physical = encrypted.contents().unwrap();
    assert_eq!(
        physical.len() as u64,
        AesStream::<Box<dyn RandomAccessStream>>::output_size(
            EncryptionMode::Encrypt,
            data.len() as u64,
            DEFAULT_CHUNK_SIZE as u64,
        )
    );
    assert_eq!(header_of(encrypted.as_ref()).chunk_size as usize, DEFAULT_CHUNK_SIZE);
    assert_ne!(&physical[64..1024], &data[..960]);

    exporter(true)
        .export(&engine, encrypted.clone(), restored.clone(), false, None)
        .unwrap()
        .expect("export not cancelled");
    assert_eq!(restored.contents().unwrap(), data);
    assert!(source.exists());
    assert!(encrypted.exists());
}

#[test]
fn parallel_output_matches_single_thread() {
    let data = sample(3 * MIB + 100);
    let seq = sequencer();
    let imp = importer(true, 64 * 1024);

    let single = Arc::new(MemoryFile::new("single"));
    let parallel = Arc::new(MemoryFile::new("parallel"));
    let src = Arc::new(MemoryFile::with_contents("src", data.clone()));

    let one = TransferEngine::new(1, 64 * 1024).unwrap();
    let five = TransferEngine::new(5, 96 * 1024).unwrap();
    imp.import(&one, &seq, DRIVE, src.clone(), single.clone(), false, None)
        .unwrap();
    imp.import(&five, &seq, DRIVE, src, parallel.clone(), false, None)
        .unwrap();

    // Different nonces, so compare what each decrypts to
    assert_eq!(single.length().unwrap(), parallel.length().unwrap());
    assert_ne!(header_of(single.as_ref()).nonce, header_of(parallel.as_ref()).nonce);
    for enc in [single, parallel] {
        let out = Arc::new(MemoryFile::new("out"));
        exporter(true)
            .export(&five, enc, out.clone(), false, None)
            .unwrap()
            .unwrap();
        assert_eq!(out.contents().unwrap(), data);
    }
}

#[test]
fn small_and_empty_files_roundtrip() {
    let engine = TransferEngine::new(4, 64 * 1024).unwrap();
    let seq = sequencer();
    for integrity in [true, false] {
        for len in [0usize, 1, 15, 16, 17, 4096, MIB + 1] {
            let data = sample(len);
            let src = Arc::new(MemoryFile::with_contents("src", data.clone()));
            let enc = Arc::new(MemoryFile::new("enc"));
            let out = Arc::new(MemoryFile::new("out"));

            importer(integrity, 4096)
                .import(&engine, &seq, DRIVE, src, enc.clone(), false, None)
                .unwrap()
                .unwrap();
            exporter(integrity)
                .export(&engine, enc, out.clone(), false, None)
                .unwrap()
                .unwrap();
            assert_eq!(out.contents().unwrap(), data, "len {len} integrity {integrity}");
        }
    }
}

#[test]
fn each_import_takes_one_nonce() {
    let engine = TransferEngine::new(4, 256 * 1024).unwrap();
    let seq = sequencer();
    let imp = importer(true, 0);
    let mut nonces = Vec::new();
    for _ in 0..3 {
        let src = Arc::new(MemoryFile::with_contents("src", sample(2 * MIB)));
        let enc = Arc::new(MemoryFile::new("enc"));
        imp.import(&engine, &seq, DRIVE, src, enc.clone(), false, None)
            .unwrap();
        nonces.push(header_of(enc.as_ref()).nonce);
    }
    assert_eq!(
        nonces,
        vec![nonce_from_u64(100), nonce_from_u64(101), nonce_from_u64(102)]
    );
    let stored = seq.get_sequence(DRIVE).unwrap().unwrap();
    assert_eq!(stored.next_nonce.unwrap(), nonce_from_u64(103).to_vec());
}

#[test]
fn revoked_drive_refuses_import() {
    let engine = TransferEngine::new(2, 64 * 1024).unwrap();
    let seq = sequencer();
    seq.revoke_sequence(DRIVE).unwrap();

    let src = Arc::new(MemoryFile::with_contents("src", sample(100)));
    let enc = Arc::new(MemoryFile::new("enc"));
    let err = importer(true, 0)
        .import(&engine, &seq, DRIVE, src, enc.clone(), false, None)
        .unwrap_err();
    assert!(err.requires_authorization(), "{err}");
    assert!(!enc.exists());
}

#[test]
fn delete_source_after_success() {
    let engine = TransferEngine::new(3, 128 * 1024).unwrap();
    let seq = sequencer();
    let data = sample(2 * MIB);
    let src = Arc::new(MemoryFile::with_contents("src", data.clone()));
    let enc = Arc::new(MemoryFile::new("enc"));
    let out = Arc::new(MemoryFile::new("out"));

    importer(true, 0)
        .import(&engine, &seq, DRIVE, src.clone(), enc.clone(), true, None)
        .unwrap()
        .unwrap();
    assert!(!src.exists());

    exporter(true)
        .export(&engine, enc.clone(), out.clone(), true, None)
        .unwrap()
        .unwrap();
    assert!(!enc.exists());
    assert_eq!(out.contents().unwrap(), data);
}

#[test]
fn tampered_chunk_fails_export_and_removes_target() {
    let engine = TransferEngine::new(4, 256 * 1024).unwrap();
    let seq = sequencer();
    let data = sample(4 * MIB);
    let src = Arc::new(MemoryFile::with_contents("src", data.clone()));
    let enc = Arc::new(MemoryFile::new("enc"));
    importer(true, 0)
        .import(&engine, &seq, DRIVE, src, enc.clone(), false, None)
        .unwrap();

    // Inside the ciphertext of chunk 5, past its hash
    let mut physical = enc.contents().unwrap();
    let group = 32 + DEFAULT_CHUNK_SIZE;
    physical[16 + 5 * group + 32 + 1000] ^= 0x01;
    let tampered = Arc::new(MemoryFile::with_contents("tampered", physical));

    let out = Arc::new(MemoryFile::new("out"));
    let err = exporter(true)
        .export(&engine, tampered.clone(), out.clone(), true, None)
        .unwrap_err();
    assert!(matches!(err, CtrvError::Integrity(_)), "{err}");
    assert!(!out.exists());
    assert!(tampered.exists(), "source kept after a failed export");

    // Without verification the flipped bit passes through as one wrong byte
    let unchecked = Arc::new(MemoryFile::new("unchecked"));
    exporter(false)
        .export(&engine, tampered, unchecked.clone(), false, None)
        .unwrap()
        .unwrap();
    let restored = unchecked.contents().unwrap();
    assert_eq!(restored.len(), data.len());
    assert_eq!(restored.iter().zip(&data).filter(|(a, b)| a != b).count(), 1);
}

#[test]
fn verify_rejects_stream_without_hashes() {
    let engine = TransferEngine::new(2, 64 * 1024).unwrap();
    let seq = sequencer();
    let src = Arc::new(MemoryFile::with_contents("src", sample(1000)));
    let enc = Arc::new(MemoryFile::new("enc"));
    importer(false, 0)
        .import(&engine, &seq, DRIVE, src, enc.clone(), false, None)
        .unwrap();

    let out = Arc::new(MemoryFile::new("out"));
    let err = exporter(true)
        .export(&engine, enc, out.clone(), false, None)
        .unwrap_err();
    assert!(matches!(err, CtrvError::Integrity(_)));
    assert!(!out.exists());
}

#[test]
fn truncated_inside_hash_is_integrity_error() {
    let engine = TransferEngine::new(4, 256 * 1024).unwrap();
    let seq = sequencer();
    let src = Arc::new(MemoryFile::with_contents("src", sample(2 * MIB)));
    let enc = Arc::new(MemoryFile::new("enc"));
    importer(true, 0)
        .import(&engine, &seq, DRIVE, src, enc.clone(), false, None)
        .unwrap();

    // Keep the first group plus 10 bytes of the second group's hash
    let mut physical = enc.contents().unwrap();
    physical.truncate(16 + 32 + DEFAULT_CHUNK_SIZE + 10);
    let torn = Arc::new(MemoryFile::with_contents("torn", physical));

    for verify in [true, false] {
        let out = Arc::new(MemoryFile::new("out"));
        let err = exporter(verify)
            .export(&engine, torn.clone(), out.clone(), false, None)
            .unwrap_err();
        assert!(matches!(err, CtrvError::Integrity(_)), "{err}");
        assert!(!out.exists());
    }
}

#[test]
fn local_files_end_to_end() {
    let tmp = tempfile::TempDir::new().unwrap();
    let data = sample(3 * MIB + 5);
    std::fs::write(tmp.path().join("photo.raw"), &data).unwrap();

    let store = tmp.path().join("seq/sequencer.json");
    let seq = FileSequencer::json(Arc::new(LocalFile::new(&store)));
    seq.initialize().unwrap();
    seq.create_sequence(DRIVE, DEVICE).unwrap();
    seq.initialize_sequence(DRIVE, DEVICE, &nonce_from_u64(1), &nonce_from_u64(1 << 40))
        .unwrap();

    let engine = TransferEngine::new(3, 256 * 1024).unwrap();
    let src = Arc::new(LocalFile::new(tmp.path().join("photo.raw")));
    let enc = Arc::new(LocalFile::new(tmp.path().join("vault/photo.raw.ctv")));
    let out = Arc::new(LocalFile::new(tmp.path().join("out/photo.raw")));

    importer(true, 128 * 1024)
        .import(&engine, &seq, DRIVE, src, enc.clone(), false, None)
        .unwrap()
        .unwrap();
    exporter(true)
        .export(&engine, enc.clone(), out, false, None)
        .unwrap()
        .unwrap();
    assert_eq!(std::fs::read(tmp.path().join("out/photo.raw")).unwrap(), data);

    // Random access into the encrypted file agrees with the plaintext
    let mut stream = AesStream::open(
        enc.open_read().unwrap(),
        &test_key(),
        true,
        create_provider(ProviderType::Portable),
    )
    .unwrap();
    stream.seek(SeekFrom::Start(2 * MIB as u64 + 3)).unwrap();
    let mut buf = vec![0u8; 1000];
    stream.read_exact(&mut buf).unwrap();
    assert_eq!(buf, &data[2 * MIB + 3..2 * MIB + 1003]);

    // The nonce store on disk reflects the allocation
    let reopened = FileSequencer::json(Arc::new(LocalFile::new(&store)));
    let stored = reopened.get_sequence(DRIVE).unwrap().unwrap();
    assert_eq!(stored.next_nonce.unwrap(), nonce_from_u64(2).to_vec());
}

#[test]
fn ciphertext_hides_repeated_plaintext() {
    let engine = TransferEngine::new(2, 64 * 1024).unwrap();
    let seq = sequencer();
    let data = vec![0x41u8; 2 * MIB];
    let src = Arc::new(MemoryFile::with_contents("src", data));
    let enc = Arc::new(MemoryFile::new("enc"));
    importer(false, 0)
        .import(&engine, &seq, DRIVE, src, enc.clone(), false, None)
        .unwrap();
    let physical = enc.contents().unwrap();
    let runs = physical
        .windows(32)
        .filter(|w| w.iter().all(|&b| b == 0x41))
        .count();
    assert_eq!(runs, 0);
}
