//! Daemon configuration, loaded from TOML or JSON.

use crate::orchestrator::{FullSyncPolicy, OrchestratorSettings};
use crate::role::PeerRole;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// How replicated data reaches the peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum TransferConfig {
    /// Shell out to rsync.
    Rsync {
        /// rsync binary.
        #[serde(default = "default_rsync_program")]
        program: PathBuf,
        /// Prefix put in front of every destination, e.g. `peer:` for a remote host.
        #[serde(default)]
        remote_prefix: String,
    },
    /// Mirror into a local directory tree.
    Local {
        /// Destination root.
        root: PathBuf,
    },
}

fn default_rsync_program() -> PathBuf {
    PathBuf::from("rsync")
}

impl Default for TransferConfig {
    fn default() -> Self {
        TransferConfig::Rsync {
            program: default_rsync_program(),
            remote_prefix: String::new(),
        }
    }
}

/// Top-level daemon configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Directory of item configuration files.
    pub config_dir: PathBuf,
    /// Persisted status file.
    pub status_file: PathBuf,
    /// Where sibling-notify descriptors are written before transfer.
    pub notify_staging_dir: PathBuf,
    /// Descriptor destination on the sibling.
    pub sibling_inbox_dir: PathBuf,
    /// Diagnostic dump of watched paths.
    pub watched_paths_dump: PathBuf,
    /// Full-sync completion poll interval.
    pub full_sync_poll_ms: u64,
    /// What a full sync reports when some items failed to copy.
    pub full_sync_policy: FullSyncPolicy,
    /// Local role for the static role provider.
    pub role: PeerRole,
    /// Whether a redundant peer exists to replicate to.
    pub redundancy_enabled: bool,
    /// Start with sync disabled.
    pub disable_sync: bool,
    /// Copy backend.
    pub transfer: TransferConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            config_dir: PathBuf::from("/etc/peersync/config"),
            status_file: PathBuf::from("/var/lib/peersync/persistence/status.json"),
            notify_staging_dir: PathBuf::from("/var/lib/peersync/notify"),
            sibling_inbox_dir: PathBuf::from("/var/lib/peersync/notify-inbox"),
            watched_paths_dump: PathBuf::from("/tmp/peersync_watched_paths.json"),
            full_sync_poll_ms: 50,
            full_sync_policy: FullSyncPolicy::ForceCompleted,
            role: PeerRole::Unknown,
            redundancy_enabled: false,
            disable_sync: false,
            transfer: TransferConfig::default(),
        }
    }
}

impl DaemonConfig {
    /// Load a config file, parsed as TOML or JSON by its extension.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        match ext.to_lowercase().as_str() {
            "toml" => {
                let config: DaemonConfig = toml::from_str(&contents)?;
                Ok(config)
            }
            "json" => {
                let config: DaemonConfig = serde_json::from_str(&contents)?;
                Ok(config)
            }
            _ => anyhow::bail!("Unsupported config file extension: {}", ext),
        }
    }

    /// Orchestrator knobs derived from this config.
    pub fn orchestrator_settings(&self) -> OrchestratorSettings {
        OrchestratorSettings {
            full_sync_policy: self.full_sync_policy,
            full_sync_poll: Duration::from_millis(self.full_sync_poll_ms.max(1)),
            notify_staging_dir: self.notify_staging_dir.clone(),
            sibling_inbox_dir: self.sibling_inbox_dir.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_values() {
        let config = DaemonConfig::default();
        assert_eq!(config.config_dir, PathBuf::from("/etc/peersync/config"));
        assert_eq!(config.full_sync_poll_ms, 50);
        assert_eq!(config.full_sync_policy, FullSyncPolicy::ForceCompleted);
        assert_eq!(config.role, PeerRole::Unknown);
        assert!(!config.disable_sync);
        assert!(matches!(config.transfer, TransferConfig::Rsync { .. }));
    }

    #[test]
    fn test_from_file_toml() {
        let mut file = NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(
            file,
            r#"
config_dir = "/opt/sync/config"
full_sync_poll_ms = 10
full_sync_policy = "strict"
role = "active"
redundancy_enabled = true

[transfer]
mode = "rsync"
remote_prefix = "rsync://peer:873/root"
            "#
        )
        .unwrap();

        let config = DaemonConfig::from_file(file.path()).unwrap();
        assert_eq!(config.config_dir, PathBuf::from("/opt/sync/config"));
        assert_eq!(config.full_sync_poll_ms, 10);
        assert_eq!(config.full_sync_policy, FullSyncPolicy::Strict);
        assert_eq!(config.role, PeerRole::Active);
        assert!(config.redundancy_enabled);
        assert_eq!(
            config.transfer,
            TransferConfig::Rsync {
                program: PathBuf::from("rsync"),
                remote_prefix: "rsync://peer:873/root".to_string(),
            }
        );
        assert_eq!(
            config.status_file,
            PathBuf::from("/var/lib/peersync/persistence/status.json")
        );
    }

    #[test]
    fn test_from_file_json() {
        let mut file = NamedTempFile::with_suffix(".json").unwrap();
        writeln!(
            file,
            r#"{{
                "role": "passive",
                "disable_sync": true,
                "transfer": {{ "mode": "local", "root": "/srv/mirror" }}
            }}"#
        )
        .unwrap();

        let config = DaemonConfig::from_file(file.path()).unwrap();
        assert_eq!(config.role, PeerRole::Passive);
        assert!(config.disable_sync);
        assert_eq!(
            config.transfer,
            TransferConfig::Local {
                root: PathBuf::from("/srv/mirror")
            }
        );
    }

    #[test]
    fn test_unsupported_extension() {
        let file = NamedTempFile::with_suffix(".yaml").unwrap();
        assert!(DaemonConfig::from_file(file.path()).is_err());
    }

    #[test]
    fn test_orchestrator_settings() {
        let config = DaemonConfig {
            full_sync_poll_ms: 0,
            ..DaemonConfig::default()
        };
        let settings = config.orchestrator_settings();
        assert_eq!(settings.full_sync_poll, Duration::from_millis(1));
        assert_eq!(settings.sibling_inbox_dir, config.sibling_inbox_dir);
    }
}
