//! Sibling notification: after a successful copy, tell the sibling which
//! path changed so it can react (restart a service, reload a file, ...).

use crate::error::{Result, SyncError};
use serde_json::{json, Map, Value};
use std::path::{Path, PathBuf};
use tracing::debug;

const NOTIFY_ON_PATHS_KEY: &str = "NotifyOnPaths";

/// Notification request attached to an item.
#[derive(Debug, Clone, PartialEq)]
pub struct NotifySiblingSpec {
    /// Paths that trigger a notification; `None` means every path.
    pub paths: Option<Vec<PathBuf>>,
    /// Opaque payload forwarded to the sibling as `NotifyInfo`.
    pub info: Value,
}

impl NotifySiblingSpec {
    /// Parse a `NotifySibling` config object. `NotifyOnPaths` is extracted,
    /// every other key becomes the notify info.
    pub fn from_json(value: &Value) -> Result<Self> {
        let object = value.as_object().ok_or_else(|| SyncError::InvalidItem {
            msg: "NotifySibling must be an object".to_string(),
        })?;

        let mut info = Map::new();
        let mut paths = None;
        for (key, entry) in object {
            if key == NOTIFY_ON_PATHS_KEY {
                let list = entry.as_array().ok_or_else(|| SyncError::InvalidItem {
                    msg: format!("{} must be an array", NOTIFY_ON_PATHS_KEY),
                })?;
                let parsed = list
                    .iter()
                    .map(|p| {
                        p.as_str().map(PathBuf::from).ok_or_else(|| SyncError::InvalidItem {
                            msg: format!("{} entries must be strings", NOTIFY_ON_PATHS_KEY),
                        })
                    })
                    .collect::<Result<Vec<_>>>()?;
                paths = Some(parsed);
            } else {
                info.insert(key.clone(), entry.clone());
            }
        }

        Ok(Self {
            paths,
            info: Value::Object(info),
        })
    }

    /// True if a change to `path` should be announced.
    pub fn applies_to(&self, path: &Path) -> bool {
        match &self.paths {
            None => true,
            Some(paths) => paths.iter().any(|p| path.starts_with(p)),
        }
    }

    /// The descriptor body for a change to `modified_path`.
    pub fn request(&self, modified_path: &Path) -> Value {
        json!({
            "ModifiedDataPath": modified_path.to_string_lossy(),
            "NotifyInfo": self.info,
        })
    }
}

/// Write a notify descriptor into `staging_dir` and return its path.
pub fn write_notify_request(
    staging_dir: &Path,
    spec: &NotifySiblingSpec,
    modified_path: &Path,
) -> Result<PathBuf> {
    std::fs::create_dir_all(staging_dir)?;
    let file = staging_dir.join(format!("notify_{}.json", uuid::Uuid::new_v4()));
    let body = serde_json::to_string_pretty(&spec.request(modified_path))?;
    std::fs::write(&file, body)?;
    debug!("Notify request for {:?} written to {:?}", modified_path, file);
    Ok(file)
}
