use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::pty::lock_or_recover;
use crate::scrollback::Snapshot;

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("snapshot is not valid JSON: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("snapshot is invalid: {0}")]
    Invalid(String),
}

/// Persistence for scrollback snapshots, keyed by session id.
pub trait SnapshotStore: Send + Sync {
    fn save(&self, snapshot: &Snapshot) -> Result<(), SnapshotError>;
    /// `Ok(None)` when no snapshot exists for the session.
    fn load(&self, session_id: Uuid) -> Result<Option<Snapshot>, SnapshotError>;
    /// Deleting a missing snapshot is not an error.
    fn delete(&self, session_id: Uuid) -> Result<(), SnapshotError>;
    /// Every readable snapshot. Entries that fail to decode are skipped.
    fn list(&self) -> Result<Vec<Snapshot>, SnapshotError>;
}

// ---------------------------------------------------------------------------
// FileSnapshotStore
// ---------------------------------------------------------------------------

/// One pretty-printed JSON file per session under a directory.
#[derive(Debug, Clone)]
pub struct FileSnapshotStore {
    dir: PathBuf,
}

impl FileSnapshotStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, session_id: Uuid) -> PathBuf {
        self.dir.join(format!("{session_id}.json"))
    }
}

impl SnapshotStore for FileSnapshotStore {
    fn save(&self, snapshot: &Snapshot) -> Result<(), SnapshotError> {
        let json = serde_json::to_string_pretty(snapshot)?;
        std::fs::create_dir_all(&self.dir)?;
        let path = self.path_for(snapshot.session_id);
        // The file at `path` is always a complete snapshot.
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &path)?;
        debug!(session_id = %snapshot.session_id, path = %path.display(), "snapshot saved");
        Ok(())
    }

    fn load(&self, session_id: Uuid) -> Result<Option<Snapshot>, SnapshotError> {
        let path = self.path_for(session_id);
        if !path.exists() {
            return Ok(None);
        }
        read_snapshot(&path).map(Some)
    }

    fn delete(&self, session_id: Uuid) -> Result<(), SnapshotError> {
        match std::fs::remove_file(self.path_for(session_id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn list(&self) -> Result<Vec<Snapshot>, SnapshotError> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut out = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match read_snapshot(&path) {
                Ok(snapshot) => out.push(snapshot),
                Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable snapshot"),
            }
        }
        Ok(out)
    }
}

fn read_snapshot(path: &Path) -> Result<Snapshot, SnapshotError> {
    let json = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&json)?)
}

// ---------------------------------------------------------------------------
// MemorySnapshotStore
// ---------------------------------------------------------------------------

/// Keeps serialized snapshots in memory. Stores the JSON text rather than
/// the struct so loading goes through the same decoding as the file store.
#[derive(Debug, Default)]
pub struct MemorySnapshotStore {
    entries: Mutex<HashMap<Uuid, String>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store raw JSON for a session, bypassing serialization.
    pub fn insert_raw(&self, session_id: Uuid, json: impl Into<String>) {
        lock_or_recover(&self.entries, "snapshot store").insert(session_id, json.into());
    }

    pub fn contains(&self, session_id: Uuid) -> bool {
        lock_or_recover(&self.entries, "snapshot store").contains_key(&session_id)
    }

    pub fn len(&self) -> usize {
        lock_or_recover(&self.entries, "snapshot store").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SnapshotStore for MemorySnapshotStore {
    fn save(&self, snapshot: &Snapshot) -> Result<(), SnapshotError> {
        let json = serde_json::to_string(snapshot)?;
        self.insert_raw(snapshot.session_id, json);
        Ok(())
    }

    fn load(&self, session_id: Uuid) -> Result<Option<Snapshot>, SnapshotError> {
        let entries = lock_or_recover(&self.entries, "snapshot store");
        match entries.get(&session_id) {
            Some(json) => Ok(Some(serde_json::from_str(json)?)),
            None => Ok(None),
        }
    }

    fn delete(&self, session_id: Uuid) -> Result<(), SnapshotError> {
        lock_or_recover(&self.entries, "snapshot store").remove(&session_id);
        Ok(())
    }

    fn list(&self) -> Result<Vec<Snapshot>, SnapshotError> {
        let entries = lock_or_recover(&self.entries, "snapshot store");
        Ok(entries
            .iter()
            .filter_map(|(id, json)| match serde_json::from_str(json) {
                Ok(snapshot) => Some(snapshot),
                Err(e) => {
                    warn!(session_id = %id, error = %e, "skipping unreadable snapshot");
                    None
                }
            })
            .collect())
    }
}
