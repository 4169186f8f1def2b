//! Full-sync status, sync health, and their persistence across restarts.

use crate::error::{Result, SyncError};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{error, info, warn};

/// Outcome of the most recent full sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum FullSyncStatus {
    /// No full sync has run yet.
    #[default]
    NotStarted,
    /// A full sync is running.
    InProgress,
    /// The last full sync finished.
    Completed,
    /// The last full sync had failures.
    Failed,
}

impl FullSyncStatus {
    /// Persisted tag.
    pub fn as_str(self) -> &'static str {
        match self {
            FullSyncStatus::NotStarted => "NotStarted",
            FullSyncStatus::InProgress => "InProgress",
            FullSyncStatus::Completed => "Completed",
            FullSyncStatus::Failed => "Failed",
        }
    }
}

impl FromStr for FullSyncStatus {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "NotStarted" => Ok(FullSyncStatus::NotStarted),
            "InProgress" => Ok(FullSyncStatus::InProgress),
            "Completed" => Ok(FullSyncStatus::Completed),
            "Failed" => Ok(FullSyncStatus::Failed),
            other => Err(SyncError::Persist {
                msg: format!("unknown full sync status {:?}", other),
            }),
        }
    }
}

impl fmt::Display for FullSyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Health of ongoing replication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SyncEventsHealth {
    /// Replication is running normally.
    #[default]
    Ok,
    /// Replication hit an unrecoverable failure.
    Critical,
    /// Replication is disabled.
    Paused,
}

impl SyncEventsHealth {
    /// Persisted tag.
    pub fn as_str(self) -> &'static str {
        match self {
            SyncEventsHealth::Ok => "Ok",
            SyncEventsHealth::Critical => "Critical",
            SyncEventsHealth::Paused => "Paused",
        }
    }
}

impl FromStr for SyncEventsHealth {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "Ok" => Ok(SyncEventsHealth::Ok),
            "Critical" => Ok(SyncEventsHealth::Critical),
            "Paused" => Ok(SyncEventsHealth::Paused),
            other => Err(SyncError::Persist {
                msg: format!("unknown sync events health {:?}", other),
            }),
        }
    }
}

impl fmt::Display for SyncEventsHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Keys under which status values are persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusKey {
    /// `fullSyncStatus`
    FullSyncStatus,
    /// `syncEventsHealth`
    SyncEventsHealth,
}

impl StatusKey {
    /// Key as stored.
    pub fn as_str(self) -> &'static str {
        match self {
            StatusKey::FullSyncStatus => "fullSyncStatus",
            StatusKey::SyncEventsHealth => "syncEventsHealth",
        }
    }
}

/// Durable key/value storage for status values.
pub trait StatusStore: Send + Sync {
    /// Persist `value` under `key`.
    fn write(&self, key: StatusKey, value: &str) -> Result<()>;
    /// Read the value under `key`, if any.
    fn read(&self, key: StatusKey) -> Result<Option<String>>;
}

/// Status store backed by one JSON object file.
#[derive(Debug)]
pub struct JsonStatusStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonStatusStore {
    /// Store persisting to `path`. The file is created on first write.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    /// Backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Map<String, Value> {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Map::new(),
            Err(e) => {
                error!("Error reading status file {:?}: {}", self.path, e);
                return Map::new();
            }
        };
        match serde_json::from_str::<Value>(&contents) {
            Ok(Value::Object(map)) => map,
            Ok(_) => {
                error!("Status file {:?} is not a JSON object, ignoring it", self.path);
                Map::new()
            }
            Err(e) => {
                error!("Error parsing JSON in {:?}: {}", self.path, e);
                Map::new()
            }
        }
    }
}

impl StatusStore for JsonStatusStore {
    fn write(&self, key: StatusKey, value: &str) -> Result<()> {
        let _guard = lock(&self.lock);
        let mut map = self.load();
        map.insert(key.as_str().to_string(), Value::String(value.to_string()));

        let persist = |e: std::io::Error| SyncError::Persist {
            msg: format!("failed writing {:?}: {}", self.path, e),
        };
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(persist)?;
        }
        let body = serde_json::to_string_pretty(&Value::Object(map))?;
        std::fs::write(&self.path, body).map_err(persist)?;
        Ok(())
    }

    fn read(&self, key: StatusKey) -> Result<Option<String>> {
        let _guard = lock(&self.lock);
        Ok(self
            .load()
            .get(key.as_str())
            .and_then(Value::as_str)
            .map(str::to_string))
    }
}

/// In-memory status store, optionally failing every write.
#[derive(Debug, Default)]
pub struct MemoryStatusStore {
    values: Mutex<HashMap<StatusKey, String>>,
    fail_writes: std::sync::atomic::AtomicBool,
}

impl MemoryStatusStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent writes fail (or succeed again).
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes
            .store(fail, std::sync::atomic::Ordering::SeqCst);
    }
}

impl StatusStore for MemoryStatusStore {
    fn write(&self, key: StatusKey, value: &str) -> Result<()> {
        if self.fail_writes.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(SyncError::Persist {
                msg: "store is read-only".to_string(),
            });
        }
        lock(&self.values).insert(key, value.to_string());
        Ok(())
    }

    fn read(&self, key: StatusKey) -> Result<Option<String>> {
        Ok(lock(&self.values).get(&key).cloned())
    }
}

#[derive(Debug, Clone, Copy)]
struct StatusValues {
    full_sync: FullSyncStatus,
    health: SyncEventsHealth,
    disable_sync: bool,
}

/// Process-wide replication status, written through to a [`StatusStore`].
///
/// Setters update memory first, so a failed write only affects durability.
/// The store write happens under the same lock, so the store always ends
/// up holding the last value set in memory.
pub struct SyncStatus {
    values: Mutex<StatusValues>,
    store: Arc<dyn StatusStore>,
}

impl SyncStatus {
    /// Seed status from `store`, falling back to `NotStarted`/`Ok`.
    pub fn restore(store: Arc<dyn StatusStore>, disable_sync: bool) -> Self {
        let full_sync =
            restore_value(store.as_ref(), StatusKey::FullSyncStatus).unwrap_or_default();
        let health = restore_value(store.as_ref(), StatusKey::SyncEventsHealth).unwrap_or_default();
        info!(
            "Restored status: fullSyncStatus={}, syncEventsHealth={}",
            full_sync, health
        );
        Self {
            values: Mutex::new(StatusValues {
                full_sync,
                health,
                disable_sync,
            }),
            store,
        }
    }

    /// Current full-sync status.
    pub fn full_sync_status(&self) -> FullSyncStatus {
        lock(&self.values).full_sync
    }

    /// Current replication health.
    pub fn sync_events_health(&self) -> SyncEventsHealth {
        lock(&self.values).health
    }

    /// Current disable toggle.
    pub fn disable_sync(&self) -> bool {
        lock(&self.values).disable_sync
    }

    /// Update and persist the full-sync status. No-op when unchanged.
    pub fn set_full_sync_status(&self, status: FullSyncStatus) {
        let mut values = lock(&self.values);
        if values.full_sync == status {
            return;
        }
        values.full_sync = status;
        self.persist(StatusKey::FullSyncStatus, status.as_str());
    }

    /// Update and persist the health. No-op when unchanged.
    pub fn set_sync_events_health(&self, health: SyncEventsHealth) {
        let mut values = lock(&self.values);
        if values.health == health {
            return;
        }
        values.health = health;
        self.persist(StatusKey::SyncEventsHealth, health.as_str());
    }

    /// Flip the disable toggle. Returns false if it already had that value.
    pub fn set_disable_sync(&self, disable: bool) -> bool {
        let mut values = lock(&self.values);
        if values.disable_sync == disable {
            return false;
        }
        values.disable_sync = disable;
        true
    }

    fn persist(&self, key: StatusKey, value: &str) {
        if let Err(e) = self.store.write(key, value) {
            error!("Error writing {} property: {}", key.as_str(), e);
        }
    }
}

fn restore_value<T>(store: &dyn StatusStore, key: StatusKey) -> Option<T>
where
    T: FromStr<Err = SyncError>,
{
    match store.read(key) {
        Ok(Some(raw)) => match raw.parse() {
            Ok(value) => Some(value),
            Err(e) => {
                warn!("Ignoring persisted {}: {}", key.as_str(), e);
                None
            }
        },
        Ok(None) => None,
        Err(e) => {
            error!("Error restoring {}: {}", key.as_str(), e);
            None
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    mod json_store {
        use super::*;

        #[test]
        fn test_write_then_read() {
            let dir = TempDir::new().unwrap();
            let store = JsonStatusStore::new(dir.path().join("persistence/status.json"));
            assert_eq!(store.read(StatusKey::FullSyncStatus).unwrap(), None);

            store.write(StatusKey::FullSyncStatus, "Completed").unwrap();
            store.write(StatusKey::SyncEventsHealth, "Paused").unwrap();

            assert_eq!(
                store.read(StatusKey::FullSyncStatus).unwrap().as_deref(),
                Some("Completed")
            );
            assert_eq!(
                store.read(StatusKey::SyncEventsHealth).unwrap().as_deref(),
                Some("Paused")
            );
        }

        #[test]
        fn test_file_uses_exact_keys() {
            let dir = TempDir::new().unwrap();
            let store = JsonStatusStore::new(dir.path().join("status.json"));
            store.write(StatusKey::FullSyncStatus, "InProgress").unwrap();
            store.write(StatusKey::SyncEventsHealth, "Ok").unwrap();

            let raw: Value =
                serde_json::from_str(&std::fs::read_to_string(store.path()).unwrap()).unwrap();
            let keys: Vec<&String> = raw.as_object().unwrap().keys().collect();
            assert_eq!(keys.len(), 2);
            assert_eq!(raw["fullSyncStatus"], "InProgress");
            assert_eq!(raw["syncEventsHealth"], "Ok");
        }

        #[test]
        fn test_corrupt_file_reads_as_empty() {
            let dir = TempDir::new().unwrap();
            let path = dir.path().join("status.json");
            std::fs::write(&path, "{ broken").unwrap();
            let store = JsonStatusStore::new(&path);
            assert_eq!(store.read(StatusKey::SyncEventsHealth).unwrap(), None);
            store.write(StatusKey::SyncEventsHealth, "Critical").unwrap();
            assert_eq!(
                store.read(StatusKey::SyncEventsHealth).unwrap().as_deref(),
                Some("Critical")
            );
        }
    }

    mod sync_status {
        use super::*;

        #[test]
        fn test_restore_defaults() {
            let status = SyncStatus::restore(Arc::new(MemoryStatusStore::new()), false);
            assert_eq!(status.full_sync_status(), FullSyncStatus::NotStarted);
            assert_eq!(status.sync_events_health(), SyncEventsHealth::Ok);
            assert!(!status.disable_sync());
        }

        #[test]
        fn test_restart_restores_persisted_values() {
            let dir = TempDir::new().unwrap();
            let path = dir.path().join("status.json");
            {
                let status = SyncStatus::restore(Arc::new(JsonStatusStore::new(&path)), false);
                status.set_full_sync_status(FullSyncStatus::Failed);
                status.set_sync_events_health(SyncEventsHealth::Critical);
            }
            let status = SyncStatus::restore(Arc::new(JsonStatusStore::new(&path)), false);
            assert_eq!(status.full_sync_status(), FullSyncStatus::Failed);
            assert_eq!(status.sync_events_health(), SyncEventsHealth::Critical);
        }

        #[test]
        fn test_unknown_persisted_tag_falls_back() {
            let store = Arc::new(MemoryStatusStore::new());
            store.write(StatusKey::FullSyncStatus, "Sideways").unwrap();
            let status = SyncStatus::restore(store, false);
            assert_eq!(status.full_sync_status(), FullSyncStatus::NotStarted);
        }

        #[test]
        fn test_persist_failure_still_updates_memory() {
            let store = Arc::new(MemoryStatusStore::new());
            store.set_fail_writes(true);
            let status = SyncStatus::restore(store.clone(), false);
            status.set_sync_events_health(SyncEventsHealth::Paused);
            assert_eq!(status.sync_events_health(), SyncEventsHealth::Paused);
            assert_eq!(store.read(StatusKey::SyncEventsHealth).unwrap(), None);
        }

        #[test]
        fn test_disable_toggle_reports_change() {
            let status = SyncStatus::restore(Arc::new(MemoryStatusStore::new()), false);
            assert!(status.set_disable_sync(true));
            assert!(!status.set_disable_sync(true));
            assert!(status.disable_sync());
        }

        /// Stalls every write of `slow_value` before passing it on.
        struct SlowStore {
            inner: MemoryStatusStore,
            slow_value: &'static str,
        }

        impl StatusStore for SlowStore {
            fn write(&self, key: StatusKey, value: &str) -> Result<()> {
                if value == self.slow_value {
                    std::thread::sleep(std::time::Duration::from_millis(100));
                }
                self.inner.write(key, value)
            }

            fn read(&self, key: StatusKey) -> Result<Option<String>> {
                self.inner.read(key)
            }
        }

        #[test]
        fn test_concurrent_setters_leave_store_matching_memory() {
            let store = Arc::new(SlowStore {
                inner: MemoryStatusStore::new(),
                slow_value: "Paused",
            });
            let status = Arc::new(SyncStatus::restore(store.clone(), false));

            let slow = {
                let status = Arc::clone(&status);
                std::thread::spawn(move || status.set_sync_events_health(SyncEventsHealth::Paused))
            };
            std::thread::sleep(std::time::Duration::from_millis(20));
            status.set_sync_events_health(SyncEventsHealth::Critical);
            slow.join().unwrap();

            let persisted = store.read(StatusKey::SyncEventsHealth).unwrap();
            assert_eq!(
                persisted.as_deref(),
                Some(status.sync_events_health().as_str())
            );
        }
    }
}
