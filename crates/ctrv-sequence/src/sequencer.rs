//! File-backed nonce sequencer

use std::cmp::Ordering;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, MutexGuard};

use ctrv_core::types::NONCE_LENGTH;
use ctrv_core::{CtrvError, CtrvResult, SequenceError};
use ctrv_crypto::nonce::{
    compare_nonce, increase_nonce, nonce_from_u64, nonce_to_u64, split_nonce_range,
};
use ctrv_storage::RealFile;

use crate::record::{record_key, NonceSequence, SequenceStatus};
use crate::serializer::{JsonSequenceSerializer, SequenceMap, SequenceSerializer};

/// Durable nonce allocation per drive.
///
/// Implementations serialize every call; two callers never observe the same
/// stored state for a mutation.
pub trait NonceSequencer: Send + Sync {
    /// Register this device for `drive_id` with no range yet.
    fn create_sequence(&self, drive_id: &str, auth_id: &str) -> CtrvResult<()>;

    /// Assign `[start, max]` and activate. Runs at most once per record.
    fn initialize_sequence(
        &self,
        drive_id: &str,
        auth_id: &str,
        start: &[u8],
        max: &[u8],
    ) -> CtrvResult<()>;

    /// Lower the range's upper bound. Raising it fails.
    fn set_max_nonce(&self, drive_id: &str, auth_id: &str, max: &[u8]) -> CtrvResult<()>;

    /// Hand out the next nonce. The advanced value is persisted first.
    fn next_nonce(&self, drive_id: &str) -> CtrvResult<[u8; NONCE_LENGTH]>;

    fn revoke_sequence(&self, drive_id: &str) -> CtrvResult<()>;

    /// The open (New or Active) record for `drive_id`
    fn get_sequence(&self, drive_id: &str) -> CtrvResult<Option<NonceSequence>>;

    /// Further calls fail with `SequenceError::Closed`. Idempotent.
    fn close(&self) -> CtrvResult<()>;
}

/// Sequencer persisting the whole record set to one file.
pub struct FileSequencer {
    file: Arc<dyn RealFile>,
    serializer: Box<dyn SequenceSerializer>,
    lock: Mutex<()>,
    closed: AtomicBool,
}

impl FileSequencer {
    pub fn new(file: Arc<dyn RealFile>, serializer: Box<dyn SequenceSerializer>) -> Self {
        Self {
            file,
            serializer,
            lock: Mutex::new(()),
            closed: AtomicBool::new(false),
        }
    }

    /// JSON-encoded store in `file`
    pub fn json(file: Arc<dyn RealFile>) -> Self {
        Self::new(file, Box::new(JsonSequenceSerializer))
    }

    pub fn file(&self) -> &Arc<dyn RealFile> {
        &self.file
    }

    /// Create an empty store if the file does not exist yet.
    pub fn initialize(&self) -> CtrvResult<()> {
        let _guard = self.guard()?;
        if !self.file.exists() {
            self.save(&SequenceMap::new())?;
            tracing::debug!(file = %self.file.name(), "created empty sequence store");
        }
        Ok(())
    }

    /// Give the upper half of this device's remaining range away, e.g. to
    /// authorize another device. Returns `(start, max)` for the new device
    /// and lowers this device's max to `start - 1`.
    pub fn split_range(
        &self,
        drive_id: &str,
        auth_id: &str,
    ) -> CtrvResult<([u8; NONCE_LENGTH], [u8; NONCE_LENGTH])> {
        self.mutate("split_range", |sequences| {
            let seq = open_sequence_mut(sequences, drive_id)?;
            check_auth(seq, auth_id)?;
            let (next, max) = initialized_range(seq)?;
            let start = split_nonce_range(&next, &max)?;
            let max = nonce_from_u64(nonce_to_u64(&max)?);
            let new_max = nonce_from_u64(nonce_to_u64(&start)? - 1);
            seq.max_nonce = Some(new_max.to_vec());
            Ok((start, max))
        })
    }

    fn guard(&self) -> CtrvResult<MutexGuard<'_, ()>> {
        if self.closed.load(AtomicOrdering::Acquire) {
            return Err(SequenceError::Closed.into());
        }
        self.lock
            .lock()
            .map_err(|_| SequenceError::Store("sequencer lock poisoned".into()).into())
    }

    fn load(&self) -> CtrvResult<SequenceMap> {
        if !self.file.exists() {
            return Ok(SequenceMap::new());
        }
        let bytes = self
            .file
            .read_contents()
            .map_err(|e| SequenceError::Store(format!("reading {}: {e}", self.file.name())))?;
        let contents = String::from_utf8(bytes)
            .map_err(|_| SequenceError::Store("sequence store is not UTF-8".into()))?;
        self.serializer.deserialize(&contents)
    }

    fn save(&self, sequences: &SequenceMap) -> CtrvResult<()> {
        let contents = self.serializer.serialize(sequences)?;
        self.file
            .replace_contents(contents.as_bytes())
            .map_err(|e| SequenceError::Store(format!("writing {}: {e}", self.file.name())).into())
    }

    /// Lock, load, apply `op`, persist. Nothing is written when `op` fails.
    fn mutate<T>(
        &self,
        name: &str,
        op: impl FnOnce(&mut SequenceMap) -> CtrvResult<T>,
    ) -> CtrvResult<T> {
        let _guard = self.guard()?;
        let mut sequences = self.load()?;
        let result = op(&mut sequences)?;
        self.save(&sequences)?;
        tracing::debug!(op = name, records = sequences.len(), "sequence store updated");
        Ok(result)
    }
}

/// Key of the single open record for `drive_id`. Two open records is corruption.
fn open_key(sequences: &SequenceMap, drive_id: &str) -> CtrvResult<Option<String>> {
    let mut found = None;
    for (key, seq) in sequences {
        if seq.matches_drive(drive_id) && seq.is_open() {
            if found.is_some() {
                return Err(SequenceError::Corrupt.into());
            }
            found = Some(key.clone());
        }
    }
    Ok(found)
}

fn has_revoked(sequences: &SequenceMap, drive_id: &str) -> bool {
    sequences
        .values()
        .any(|s| s.matches_drive(drive_id) && s.status == SequenceStatus::Revoked)
}

/// The open record, or `missing` (Revoked if only revoked records exist).
fn open_sequence_or<'a>(
    sequences: &'a mut SequenceMap,
    drive_id: &str,
    missing: SequenceError,
) -> CtrvResult<&'a mut NonceSequence> {
    match open_key(sequences, drive_id)? {
        Some(key) => sequences
            .get_mut(&key)
            .ok_or_else(|| SequenceError::NotFound.into()),
        None if has_revoked(sequences, drive_id) => Err(SequenceError::Revoked.into()),
        None => Err(missing.into()),
    }
}

fn open_sequence_mut<'a>(
    sequences: &'a mut SequenceMap,
    drive_id: &str,
) -> CtrvResult<&'a mut NonceSequence> {
    open_sequence_or(sequences, drive_id, SequenceError::NotFound)
}

fn check_auth(seq: &NonceSequence, auth_id: &str) -> CtrvResult<()> {
    if seq.auth_id != auth_id {
        return Err(SequenceError::NotAuthorized.into());
    }
    Ok(())
}

fn initialized_range(seq: &NonceSequence) -> CtrvResult<(Vec<u8>, Vec<u8>)> {
    match (&seq.next_nonce, &seq.max_nonce) {
        (Some(next), Some(max)) => Ok((next.clone(), max.clone())),
        _ => Err(SequenceError::NotAuthorized.into()),
    }
}

impl NonceSequencer for FileSequencer {
    fn create_sequence(&self, drive_id: &str, auth_id: &str) -> CtrvResult<()> {
        self.mutate("create_sequence", |sequences| {
            if open_key(sequences, drive_id)?.is_some() {
                return Err(SequenceError::AlreadyExists.into());
            }
            // Revoked is terminal: a device never gets a second record on a drive
            if sequences
                .values()
                .any(|s| s.matches_drive(drive_id) && s.auth_id == auth_id)
            {
                return Err(SequenceError::Revoked.into());
            }
            let seq = NonceSequence::new(drive_id, auth_id);
            sequences.insert(seq.key(), seq);
            Ok(())
        })
    }

    fn initialize_sequence(
        &self,
        drive_id: &str,
        auth_id: &str,
        start: &[u8],
        max: &[u8],
    ) -> CtrvResult<()> {
        let start_value = nonce_to_u64(start)?;
        let max_value = nonce_to_u64(max)?;
        if start_value > max_value {
            return Err(CtrvError::RangeExceeded(
                "start nonce is past the max nonce".into(),
            ));
        }
        self.mutate("initialize_sequence", |sequences| {
            let seq = open_sequence_mut(sequences, drive_id)?;
            check_auth(seq, auth_id)?;
            if seq.next_nonce.is_some() {
                return Err(SequenceError::AlreadyInitialized.into());
            }
            seq.next_nonce = Some(start.to_vec());
            seq.max_nonce = Some(max.to_vec());
            seq.status = SequenceStatus::Active;
            Ok(())
        })
    }

    fn set_max_nonce(&self, drive_id: &str, auth_id: &str, max: &[u8]) -> CtrvResult<()> {
        nonce_to_u64(max)?;
        self.mutate("set_max_nonce", |sequences| {
            let seq = open_sequence_mut(sequences, drive_id)?;
            check_auth(seq, auth_id)?;
            let (_, current) = initialized_range(seq)?;
            if compare_nonce(max, &current) == Ordering::Greater {
                return Err(SequenceError::MaxNonceCannotIncrease.into());
            }
            seq.max_nonce = Some(max.to_vec());
            Ok(())
        })
    }

    fn next_nonce(&self, drive_id: &str) -> CtrvResult<[u8; NONCE_LENGTH]> {
        self.mutate("next_nonce", |sequences| {
            let seq = open_sequence_or(sequences, drive_id, SequenceError::NotAuthorized)?;
            let (next, max) = initialized_range(seq)?;
            let allocated = nonce_from_u64(nonce_to_u64(&next)?);
            seq.next_nonce = Some(increase_nonce(&next, &max)?.to_vec());
            Ok(allocated)
        })
    }

    fn revoke_sequence(&self, drive_id: &str) -> CtrvResult<()> {
        self.mutate("revoke_sequence", |sequences| {
            let seq = open_sequence_mut(sequences, drive_id)?;
            seq.status = SequenceStatus::Revoked;
            tracing::info!(drive_id, auth_id = %seq.auth_id, "sequence revoked");
            Ok(())
        })
    }

    fn get_sequence(&self, drive_id: &str) -> CtrvResult<Option<NonceSequence>> {
        let _guard = self.guard()?;
        let sequences = self.load()?;
        Ok(open_key(&sequences, drive_id)?.and_then(|key| sequences.get(&key).cloned()))
    }

    fn close(&self) -> CtrvResult<()> {
        self.closed.store(true, AtomicOrdering::Release);
        Ok(())
    }
}

impl std::fmt::Debug for FileSequencer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileSequencer")
            .field("file", &self.file)
            .field("closed", &self.closed.load(AtomicOrdering::Relaxed))
            .finish()
    }
}
