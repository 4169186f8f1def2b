//! Diagnostic snapshot of the paths currently under watch.

use crate::error::Result;
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::info;

#[derive(Debug)]
struct Snapshot {
    launch: u64,
    paths: Vec<PathBuf>,
}

/// Per-item record of watched paths, keyed by item path.
///
/// Each snapshot is tagged with the launch that wrote it, so a loop from an
/// older launch cannot overwrite or remove the entry of its replacement.
#[derive(Debug, Default)]
pub struct WatchRegistry {
    items: Mutex<HashMap<PathBuf, Snapshot>>,
}

impl WatchRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the watched paths of `item` for `launch`.
    pub async fn update(&self, item: &Path, launch: u64, paths: Vec<PathBuf>) {
        let mut items = self.items.lock().await;
        match items.get_mut(item) {
            Some(existing) if existing.launch > launch => {}
            Some(existing) => {
                existing.launch = launch;
                existing.paths = paths;
            }
            None => {
                items.insert(item.to_path_buf(), Snapshot { launch, paths });
            }
        }
    }

    /// Drop the entry of `item` if it still belongs to `launch`.
    pub async fn remove(&self, item: &Path, launch: u64) {
        let mut items = self.items.lock().await;
        if items.get(item).is_some_and(|s| s.launch <= launch) {
            items.remove(item);
        }
    }

    /// All watched paths, sorted and de-duplicated.
    pub async fn snapshot(&self) -> Vec<PathBuf> {
        let items = self.items.lock().await;
        items
            .values()
            .flat_map(|s| s.paths.iter().cloned())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}

/// Write the registry as a JSON array of paths to `file`.
pub async fn dump_watched_paths(registry: &WatchRegistry, file: &Path) -> Result<usize> {
    let paths: Vec<String> = registry
        .snapshot()
        .await
        .iter()
        .map(|p| p.to_string_lossy().into_owned())
        .collect();
    if let Some(parent) = file.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let body = serde_json::to_string_pretty(&paths)?;
    tokio::fs::write(file, body).await?;
    info!("Dumped {} watched paths to {:?}", paths.len(), file);
    Ok(paths.len())
}
