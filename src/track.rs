//! # Track Buffer
//!
//! The ordered, timestamp-keyed sequence of fixes for the active session, plus
//! the local durable copy that survives a process restart.
//!
//! ## Write rules
//!
//! - `append` keeps the first fix seen for a timestamp.
//! - `merge_snapped` is the only way an existing fix changes. It fills in the
//!   snapped coordinate of the fix with the same timestamp (last write wins)
//!   and never touches the raw coordinate or removes a snap.
//!
//! ## Storage
//!
//! The buffer is written whole, as one JSON document, through a [`TrackStore`].
//! Each backend replaces the stored value atomically so a reader sees either
//! the previous snapshot or the new one.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use log::{debug, info, warn};

use crate::error::{Result, TrackerError};
use crate::{best_estimate_track, Fix, GpsPoint};

// ============================================================================
// Key-value stores
// ============================================================================

/// Durable key-value storage for the track buffer and local profile.
pub trait TrackStore: Send + Sync {
    fn load(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Replace the value for `key` atomically.
    fn save(&self, key: &str, value: &[u8]) -> Result<()>;

    fn remove(&self, key: &str) -> Result<()>;
}

/// In-process store, for tests and hosts without durable storage.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    entries: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TrackStore for MemoryStore {
    fn load(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let entries = self
            .entries
            .lock()
            .map_err(|_| TrackerError::persistence("memory store poisoned"))?;
        Ok(entries.get(key).cloned())
    }

    fn save(&self, key: &str, value: &[u8]) -> Result<()> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| TrackerError::persistence("memory store poisoned"))?;
        entries.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| TrackerError::persistence("memory store poisoned"))?;
        entries.remove(key);
        Ok(())
    }
}

/// One file per key under a directory.
///
/// Writes go to a temporary sibling which is then renamed over the target.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    /// Use `dir`, creating it if needed.
    pub fn new(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let safe: String = key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
            .collect();
        self.dir.join(format!("{}.json", safe))
    }
}

impl TrackStore for FileStore {
    fn load(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match std::fs::read(self.path_for(key)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn save(&self, key: &str, value: &[u8]) -> Result<()> {
        let target = self.path_for(key);
        let tmp = target.with_extension("json.tmp");
        std::fs::write(&tmp, value)?;
        std::fs::rename(&tmp, &target)?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        match std::fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// SQLite-backed store with a single key-value table.
#[cfg(feature = "persistence")]
pub struct SqliteStore {
    db: Mutex<rusqlite::Connection>,
}

#[cfg(feature = "persistence")]
impl SqliteStore {
    /// Open (or create) the database at `db_path`.
    pub fn new(db_path: &str) -> Result<Self> {
        let db = rusqlite::Connection::open(db_path).map_err(sql_err)?;
        db.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY,
                value BLOB NOT NULL,
                updated_at INTEGER DEFAULT (strftime('%s', 'now'))
            );
        "#,
        )
        .map_err(sql_err)?;
        Ok(Self { db: Mutex::new(db) })
    }

    /// Create an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        Self::new(":memory:")
    }

    fn conn(&self) -> Result<std::sync::MutexGuard<'_, rusqlite::Connection>> {
        self.db
            .lock()
            .map_err(|_| TrackerError::persistence("sqlite store poisoned"))
    }
}

#[cfg(feature = "persistence")]
fn sql_err(e: rusqlite::Error) -> TrackerError {
    TrackerError::persistence(e.to_string())
}

#[cfg(feature = "persistence")]
impl TrackStore for SqliteStore {
    fn load(&self, key: &str) -> Result<Option<Vec<u8>>> {
        use rusqlite::OptionalExtension;
        self.conn()?
            .query_row("SELECT value FROM kv WHERE key = ?", [key], |row| row.get(0))
            .optional()
            .map_err(sql_err)
    }

    fn save(&self, key: &str, value: &[u8]) -> Result<()> {
        self.conn()?
            .execute(
                "INSERT OR REPLACE INTO kv (key, value) VALUES (?, ?)",
                rusqlite::params![key, value],
            )
            .map_err(sql_err)?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.conn()?
            .execute("DELETE FROM kv WHERE key = ?", [key])
            .map_err(sql_err)?;
        Ok(())
    }
}

// ============================================================================
// Track Buffer
// ============================================================================

/// The session's sequence of record.
pub struct TrackBuffer {
    fixes: Vec<Fix>,
    /// Timestamp -> position in `fixes`
    index: HashMap<DateTime<Utc>, usize>,
    store: Arc<dyn TrackStore>,
    key: String,
    dirty: bool,
}

impl TrackBuffer {
    /// Create an empty buffer persisted under `key`.
    pub fn new(store: Arc<dyn TrackStore>, key: impl Into<String>) -> Self {
        Self {
            fixes: Vec::new(),
            index: HashMap::new(),
            store,
            key: key.into(),
            dirty: false,
        }
    }

    pub fn fixes(&self) -> &[Fix] {
        &self.fixes
    }

    pub fn len(&self) -> usize {
        self.fixes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fixes.is_empty()
    }

    pub fn last(&self) -> Option<&Fix> {
        self.fixes.last()
    }

    pub fn get(&self, timestamp: &DateTime<Utc>) -> Option<&Fix> {
        self.index.get(timestamp).map(|&i| &self.fixes[i])
    }

    /// Whether there are changes not yet written to the store.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Append a fix. A fix whose timestamp is already present is ignored.
    ///
    /// Returns whether the fix was added.
    pub fn append(&mut self, fix: Fix) -> bool {
        if self.index.contains_key(&fix.timestamp) {
            debug!("[TrackBuffer] Duplicate timestamp {}, keeping first", fix.timestamp);
            return false;
        }
        self.index.insert(fix.timestamp, self.fixes.len());
        self.fixes.push(fix);
        self.dirty = true;
        true
    }

    /// Merge snapped coordinates back into the track by timestamp.
    ///
    /// Only snapped fields are written; a merged fix without a snapped
    /// coordinate leaves its target as it was. Fixes not present in the track
    /// are ignored. Returns the fixes that changed, as they now stand.
    pub fn merge_snapped(&mut self, snapped: &[Fix]) -> Vec<Fix> {
        let mut changed = Vec::new();
        for update in snapped {
            let Some(point) = update.snapped_point() else {
                continue;
            };
            let Some(&i) = self.index.get(&update.timestamp) else {
                continue;
            };
            let fix = &mut self.fixes[i];
            if fix.snapped && fix.snapped_point() == Some(point) {
                continue;
            }
            fix.set_snapped(point);
            changed.push(fix.clone());
        }
        if !changed.is_empty() {
            self.dirty = true;
        }
        changed
    }

    /// Best-estimate coordinates of the whole track.
    pub fn best_estimate(&self) -> Vec<GpsPoint> {
        best_estimate_track(&self.fixes)
    }

    /// Best-estimate coordinates of the last `n` fixes.
    pub fn best_estimate_tail(&self, n: usize) -> Vec<GpsPoint> {
        let start = self.fixes.len().saturating_sub(n);
        best_estimate_track(&self.fixes[start..])
    }

    /// The most recent `n` fixes, oldest first.
    pub fn window(&self, n: usize) -> Vec<Fix> {
        let start = self.fixes.len().saturating_sub(n);
        self.fixes[start..].to_vec()
    }

    /// Write the current track to the store.
    pub fn persist(&mut self) -> Result<()> {
        let bytes = serde_json::to_vec(&self.fixes)?;
        self.store.save(&self.key, &bytes)?;
        self.dirty = false;
        debug!("[TrackBuffer] Persisted {} fixes", self.fixes.len());
        Ok(())
    }

    /// Replace the in-memory track with the last persisted one.
    ///
    /// A missing buffer rehydrates as empty. So does an undecodable one, with a
    /// warning, since the local copy is a convenience and not the record.
    /// Returns the number of fixes loaded.
    pub fn rehydrate(&mut self) -> Result<usize> {
        let fixes: Vec<Fix> = match self.store.load(&self.key)? {
            None => Vec::new(),
            Some(bytes) => match serde_json::from_slice(&bytes) {
                Ok(fixes) => fixes,
                Err(e) => {
                    warn!("[TrackBuffer] Discarding unreadable buffer: {}", e);
                    Vec::new()
                }
            },
        };

        self.fixes.clear();
        self.index.clear();
        for fix in fixes {
            self.append(fix);
        }
        self.dirty = false;
        info!("[TrackBuffer] Rehydrated {} fixes", self.fixes.len());
        Ok(self.fixes.len())
    }

    /// Empty the track in memory and in the store.
    pub fn clear(&mut self) -> Result<()> {
        self.fixes.clear();
        self.index.clear();
        self.dirty = false;
        self.store.remove(&self.key)?;
        info!("[TrackBuffer] Cleared");
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
