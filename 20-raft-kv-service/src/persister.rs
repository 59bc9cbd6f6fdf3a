//! Durable storage for the consensus log state and the latest snapshot.
//!
//! The two blobs are opaque here. [`Persister::save_state_and_snapshot`]
//! replaces both together so a reader never pairs a compacted log with an
//! older snapshot.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::debug;

use crate::error::PersistError;

pub trait Persister: Send + Sync + 'static {
    fn save_raft_state(&self, state: Vec<u8>) -> Result<(), PersistError>;

    fn save_state_and_snapshot(&self, state: Vec<u8>, snapshot: Vec<u8>)
        -> Result<(), PersistError>;

    fn read_raft_state(&self) -> Result<Vec<u8>, PersistError>;

    /// Latest snapshot, or an empty vector if none was ever saved.
    fn read_snapshot(&self) -> Result<Vec<u8>, PersistError>;

    fn raft_state_size(&self) -> usize;
}

#[derive(Default)]
struct Blobs {
    raft_state: Vec<u8>,
    snapshot: Vec<u8>,
}

/// Keeps both blobs in memory. Clones share storage, which is how tests
/// simulate a restart: drop the server, keep the persister.
#[derive(Clone, Default)]
pub struct MemoryPersister {
    blobs: Arc<Mutex<Blobs>>,
}

impl MemoryPersister {
    pub fn new() -> Self {
        Self::default()
    }

    fn blobs(&self) -> MutexGuard<'_, Blobs> {
        self.blobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn snapshot_size(&self) -> usize {
        self.blobs().snapshot.len()
    }
}

impl Persister for MemoryPersister {
    fn save_raft_state(&self, state: Vec<u8>) -> Result<(), PersistError> {
        self.blobs().raft_state = state;
        Ok(())
    }

    fn save_state_and_snapshot(
        &self,
        state: Vec<u8>,
        snapshot: Vec<u8>,
    ) -> Result<(), PersistError> {
        let mut blobs = self.blobs();
        blobs.raft_state = state;
        blobs.snapshot = snapshot;
        Ok(())
    }

    fn read_raft_state(&self) -> Result<Vec<u8>, PersistError> {
        Ok(self.blobs().raft_state.clone())
    }

    fn read_snapshot(&self) -> Result<Vec<u8>, PersistError> {
        Ok(self.blobs().snapshot.clone())
    }

    fn raft_state_size(&self) -> usize {
        self.blobs().raft_state.len()
    }
}

const RAFT_STATE_FILE: &str = "raft-state.bin";
const SNAPSHOT_FILE: &str = "snapshot.bin";

/// Stores both blobs as files in one directory.
///
/// Each file is written to a temporary sibling and renamed into place, so a
/// crash mid-write leaves the previous version intact.
pub struct FilePersister {
    dir: PathBuf,
    raft_state_size: AtomicUsize,
    write_lock: Mutex<()>,
}

impl FilePersister {
    /// Opens (creating if needed) a persister rooted at `dir`.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, PersistError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        let size = read_or_empty(&dir.join(RAFT_STATE_FILE))?.len();
        debug!(dir = %dir.display(), raft_state_size = size, "opened file persister");
        Ok(Self {
            dir,
            raft_state_size: AtomicUsize::new(size),
            write_lock: Mutex::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn write_atomic(&self, name: &str, bytes: &[u8]) -> io::Result<()> {
        let target = self.dir.join(name);
        let tmp = self.dir.join(format!("{name}.tmp"));
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, &target)
    }
}

impl Persister for FilePersister {
    fn save_raft_state(&self, state: Vec<u8>) -> Result<(), PersistError> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.write_atomic(RAFT_STATE_FILE, &state)?;
        self.raft_state_size.store(state.len(), Ordering::Release);
        Ok(())
    }

    fn save_state_and_snapshot(
        &self,
        state: Vec<u8>,
        snapshot: Vec<u8>,
    ) -> Result<(), PersistError> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        // Snapshot first: a crash in between leaves a log that still covers
        // everything after the new snapshot.
        self.write_atomic(SNAPSHOT_FILE, &snapshot)?;
        self.write_atomic(RAFT_STATE_FILE, &state)?;
        self.raft_state_size.store(state.len(), Ordering::Release);
        Ok(())
    }

    fn read_raft_state(&self) -> Result<Vec<u8>, PersistError> {
        Ok(read_or_empty(&self.dir.join(RAFT_STATE_FILE))?)
    }

    fn read_snapshot(&self) -> Result<Vec<u8>, PersistError> {
        Ok(read_or_empty(&self.dir.join(SNAPSHOT_FILE))?)
    }

    fn raft_state_size(&self) -> usize {
        self.raft_state_size.load(Ordering::Acquire)
    }
}

fn read_or_empty(path: &Path) -> io::Result<Vec<u8>> {
    match fs::read(path) {
        Ok(bytes) => Ok(bytes),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(err) => Err(err),
    }
}
