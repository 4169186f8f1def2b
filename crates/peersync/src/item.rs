//! Replication items: the configured files and directories to keep in sync.
//!
//! Items are read from JSON files in the config directory. Each file may
//! carry a `"Files"` and a `"Directories"` array of item records. A broken
//! file or record is logged and skipped; everything else still loads.

use crate::error::{Result, SyncError};
use crate::notify::NotifySiblingSpec;
use peersync_watch::PathFilter;
use serde::Deserialize;
use serde_json::Value;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, error, info};

/// Which node pushes changes for an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
pub enum SyncDirection {
    /// Synced while the local node is active.
    #[serde(rename = "Active2Passive")]
    ActiveToPassive,
    /// Synced while the local node is passive.
    #[serde(rename = "Passive2Active")]
    PassiveToActive,
    /// Synced from either node.
    Bidirectional,
}

impl fmt::Display for SyncDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncDirection::ActiveToPassive => write!(f, "Active2Passive"),
            SyncDirection::PassiveToActive => write!(f, "Passive2Active"),
            SyncDirection::Bidirectional => write!(f, "Bidirectional"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
enum SyncType {
    Immediate,
    Periodic,
}

/// When an item is synced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncTrigger {
    /// On every filesystem change.
    Immediate,
    /// On a fixed timer.
    Periodic(Duration),
}

/// Vanished-source retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum retry attempts.
    pub attempts: u32,
    /// Delay before each attempt.
    pub interval: Duration,
}

/// One configured replication target.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplicationItem {
    /// Source path on the local node.
    pub path: PathBuf,
    /// Whether the item was configured under `"Directories"`.
    pub is_dir: bool,
    /// Free-form description.
    pub description: String,
    /// Which role pushes this item.
    pub direction: SyncDirection,
    /// When the item is synced.
    pub trigger: SyncTrigger,
    /// Destination override on the peer.
    pub destination: Option<PathBuf>,
    /// Paths excluded from watching and copying.
    pub excludes: PathFilter,
    /// Vanished-source retry policy.
    pub retry: Option<RetryPolicy>,
    /// Sibling notification after a successful copy.
    pub notify_sibling: Option<NotifySiblingSpec>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ItemRecord {
    path: String,
    destination_path: Option<String>,
    #[serde(default)]
    description: String,
    sync_direction: SyncDirection,
    sync_type: SyncType,
    periodicity: Option<String>,
    retry_attempts: Option<u32>,
    retry_interval: Option<String>,
    exclude_list: Option<Vec<String>>,
    notify_sibling: Option<Value>,
}

impl ReplicationItem {
    /// Build an item from one JSON record.
    pub fn from_json(value: &Value, is_dir: bool) -> Result<Self> {
        let record = ItemRecord::deserialize(value).map_err(|e| SyncError::InvalidItem {
            msg: e.to_string(),
        })?;

        let path = normalize(&record.path);
        if !path.is_absolute() {
            return Err(SyncError::InvalidItem {
                msg: format!("Path {:?} is not absolute", record.path),
            });
        }

        let trigger = match record.sync_type {
            SyncType::Immediate => SyncTrigger::Immediate,
            SyncType::Periodic => {
                let text = record.periodicity.as_deref().ok_or_else(|| SyncError::InvalidItem {
                    msg: format!("Periodic item {:?} has no Periodicity", path),
                })?;
                let period = parse_iso8601_duration(text)?;
                if period.is_zero() {
                    return Err(SyncError::InvalidItem {
                        msg: format!("Periodic item {:?} has a zero period", path),
                    });
                }
                SyncTrigger::Periodic(period)
            }
        };

        let retry = match (record.retry_attempts, record.retry_interval.as_deref()) {
            (None, None) => None,
            (Some(attempts), Some(interval)) => Some(RetryPolicy {
                attempts,
                interval: parse_iso8601_duration(interval)?,
            }),
            _ => {
                return Err(SyncError::InvalidItem {
                    msg: format!(
                        "{:?}: RetryAttempts and RetryInterval must be given together",
                        path
                    ),
                })
            }
        };

        let excludes = record
            .exclude_list
            .map(PathFilter::from_entries)
            .unwrap_or_default();

        let notify_sibling = record
            .notify_sibling
            .as_ref()
            .map(NotifySiblingSpec::from_json)
            .transpose()?;

        Ok(Self {
            path,
            is_dir,
            description: record.description,
            direction: record.sync_direction,
            trigger,
            destination: record.destination_path.as_deref().map(normalize),
            excludes,
            retry,
            notify_sibling,
        })
    }
}

/// Strip trailing separators, keeping `/` itself.
fn normalize(raw: &str) -> PathBuf {
    let trimmed = raw.trim_end_matches('/');
    if trimmed.is_empty() && raw.starts_with('/') {
        PathBuf::from("/")
    } else {
        PathBuf::from(trimmed)
    }
}

/// Load every item from the JSON files in `dir`, in file-name order.
pub fn load_items(dir: &Path) -> Vec<ReplicationItem> {
    if !dir.is_dir() {
        info!("Config directory {:?} not found, no items loaded", dir);
        return Vec::new();
    }

    let mut files: Vec<PathBuf> = match std::fs::read_dir(dir) {
        Ok(entries) => entries
            .flatten()
            .map(|e| e.path())
            .filter(|p| p.is_file())
            .collect(),
        Err(e) => {
            error!("Failed to list config directory {:?}: {}", dir, e);
            return Vec::new();
        }
    };
    files.sort();

    let mut items = Vec::new();
    for file in &files {
        match load_file(file) {
            Ok(loaded) => {
                debug!("Loaded {} items from {:?}", loaded.len(), file);
                items.extend(loaded);
            }
            Err(e) => error!("Failed to parse the configuration file: {}", e),
        }
    }
    info!("Loaded {} replication items from {:?}", items.len(), dir);
    items
}

fn load_file(file: &Path) -> Result<Vec<ReplicationItem>> {
    let parse_error = |msg: String| SyncError::ConfigParse {
        file: file.to_path_buf(),
        msg,
    };
    let contents = std::fs::read_to_string(file).map_err(|e| parse_error(e.to_string()))?;
    let document: Value = serde_json::from_str(&contents).map_err(|e| parse_error(e.to_string()))?;
    if !document.is_object() {
        return Err(parse_error("top level is not an object".to_string()));
    }

    let mut items = Vec::new();
    for (key, is_dir) in [("Files", false), ("Directories", true)] {
        let Some(section) = document.get(key) else {
            continue;
        };
        let Some(records) = section.as_array() else {
            error!("{:?}: {:?} is not an array, skipping", file, key);
            continue;
        };
        for record in records {
            match ReplicationItem::from_json(record, is_dir) {
                Ok(item) => items.push(item),
                Err(e) => error!("{:?}: skipping entry in {:?}: {}", file, key, e),
            }
        }
    }
    Ok(items)
}

/// Parse an ISO-8601 duration of the form `PnDTnHnMnS`.
///
/// Every component is optional but at least one must be present. Only the
/// seconds component may carry a fraction.
pub fn parse_iso8601_duration(text: &str) -> Result<Duration> {
    let invalid = || SyncError::InvalidItem {
        msg: format!("invalid ISO-8601 duration {:?}", text),
    };

    let body = text.strip_prefix('P').ok_or_else(invalid)?;
    let (date, time) = match body.split_once('T') {
        Some((date, time)) => (date, Some(time)),
        None => (body, None),
    };

    let mut total = Duration::ZERO;
    let mut any = false;

    if !date.is_empty() {
        let days = date.strip_suffix('D').and_then(whole).ok_or_else(invalid)?;
        let days = Duration::from_secs(days.checked_mul(86_400).ok_or_else(invalid)?);
        total = total.checked_add(days).ok_or_else(invalid)?;
        any = true;
    }

    if let Some(time) = time {
        if time.is_empty() {
            return Err(invalid());
        }
        let mut rest = time;
        let mut last_rank = 0;
        while !rest.is_empty() {
            let split = rest
                .find(|c: char| !(c.is_ascii_digit() || c == '.'))
                .ok_or_else(invalid)?;
            let (number, tail) = rest.split_at(split);
            let mut chars = tail.chars();
            let designator = chars.next().ok_or_else(invalid)?;
            rest = chars.as_str();

            let (rank, unit) = match designator {
                'H' => (1, 3_600),
                'M' => (2, 60),
                'S' => (3, 1),
                _ => return Err(invalid()),
            };
            if rank <= last_rank {
                return Err(invalid());
            }
            last_rank = rank;

            if designator == 'S' && number.contains('.') {
                let secs: f64 = number.parse().map_err(|_| invalid())?;
                let secs = Duration::try_from_secs_f64(secs).map_err(|_| invalid())?;
                total = total.checked_add(secs).ok_or_else(invalid)?;
            } else {
                let value = whole(number).ok_or_else(invalid)?;
                let value = Duration::from_secs(value.checked_mul(unit).ok_or_else(invalid)?);
                total = total.checked_add(value).ok_or_else(invalid)?;
            }
            any = true;
        }
    }

    if any {
        Ok(total)
    } else {
        Err(invalid())
    }
}

fn whole(digits: &str) -> Option<u64> {
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}
