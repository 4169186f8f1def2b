//! Common fixtures for orchestrator integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use peersync::{
    CopyOutcome, CopyRequest, DataCopier, DaemonConfig, FullSyncPolicy, ItemState,
    LocalMirrorCopier, MemoryStatusStore, OrchestratorSettings, PeerRole, ReplicationItem,
    RetryPolicy, StaticRoleProvider, SyncDirection, SyncOrchestrator, SyncStatus, SyncTrigger,
};
use peersync_watch::PathFilter;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

/// Upper bound for anything a test waits on.
pub const WAIT: Duration = Duration::from_secs(5);

/// Source tree, mirror root and staging area inside one temp dir.
pub struct Fixture {
    pub tmp: TempDir,
    pub src: PathBuf,
    pub mirror: LocalMirrorCopier,
}

impl Fixture {
    pub fn new() -> Self {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("src/data");
        std::fs::create_dir_all(&src).unwrap();
        let mirror = LocalMirrorCopier::new(tmp.path().join("peer"));
        Self { tmp, src, mirror }
    }

    /// Where `source` lands on the mirror.
    pub fn dest(&self, source: &Path) -> PathBuf {
        self.mirror.target_for(None, source)
    }

    pub fn settings(&self, policy: FullSyncPolicy) -> OrchestratorSettings {
        OrchestratorSettings {
            full_sync_policy: policy,
            full_sync_poll: Duration::from_millis(10),
            notify_staging_dir: self.tmp.path().join("staging"),
            sibling_inbox_dir: PathBuf::from("/inbox"),
        }
    }
}

pub fn item(path: &Path, is_dir: bool, trigger: SyncTrigger) -> ReplicationItem {
    ReplicationItem {
        path: path.to_path_buf(),
        is_dir,
        description: "test item".to_string(),
        direction: SyncDirection::Bidirectional,
        trigger,
        destination: None,
        excludes: PathFilter::new(),
        retry: None,
        notify_sibling: None,
    }
}

pub fn retry(attempts: u32, interval_ms: u64) -> Option<RetryPolicy> {
    Some(RetryPolicy {
        attempts,
        interval: Duration::from_millis(interval_ms),
    })
}

pub fn status() -> Arc<SyncStatus> {
    Arc::new(SyncStatus::restore(Arc::new(MemoryStatusStore::new()), false))
}

pub fn orchestrator(
    settings: OrchestratorSettings,
    items: Vec<ReplicationItem>,
    role: PeerRole,
    redundancy_enabled: bool,
    copier: Arc<dyn DataCopier>,
) -> Arc<SyncOrchestrator> {
    SyncOrchestrator::new(
        settings,
        items,
        Arc::new(StaticRoleProvider::new(role, redundancy_enabled)),
        copier,
        status(),
    )
}

/// Default daemon settings, with a fast full-sync poll.
pub fn default_settings() -> OrchestratorSettings {
    let mut settings = DaemonConfig::default().orchestrator_settings();
    settings.full_sync_poll = Duration::from_millis(10);
    settings
}

type Responder = Box<dyn Fn(&CopyRequest) -> Option<CopyOutcome> + Send + Sync>;

/// Records every request. A responder can short-circuit a request with a
/// fixed outcome, everything else goes to the mirror.
pub struct RecordingCopier {
    mirror: LocalMirrorCopier,
    respond: Responder,
    requests: Mutex<Vec<CopyRequest>>,
}

impl RecordingCopier {
    pub fn new(mirror: LocalMirrorCopier) -> Self {
        Self::with_responder(mirror, |_| None)
    }

    pub fn with_responder<F>(mirror: LocalMirrorCopier, respond: F) -> Self
    where
        F: Fn(&CopyRequest) -> Option<CopyOutcome> + Send + Sync + 'static,
    {
        Self {
            mirror,
            respond: Box::new(respond),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<CopyRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn count(&self, source: &Path, mirror_missing: bool) -> usize {
        self.requests()
            .iter()
            .filter(|r| r.source == source && r.mirror_missing == mirror_missing)
            .count()
    }
}

#[async_trait]
impl DataCopier for RecordingCopier {
    async fn copy(&self, request: &CopyRequest) -> CopyOutcome {
        self.requests.lock().unwrap().push(request.clone());
        match (self.respond)(request) {
            Some(outcome) => outcome,
            None => self.mirror.copy(request).await,
        }
    }

    async fn notify(&self, descriptor: &Path, inbox: &Path) -> bool {
        self.mirror.notify(descriptor, inbox).await
    }
}

/// Poll `check` until it holds or [`WAIT`] runs out.
pub async fn wait_until<F: FnMut() -> bool>(mut check: F) -> bool {
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}

/// Wait until the loop of the item at `path` reaches `state`.
pub async fn wait_for_state(
    orchestrator: &SyncOrchestrator,
    path: &Path,
    state: ItemState,
) -> bool {
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        if orchestrator.item_state(path).await == Some(state) {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Contents of `path`, if readable.
pub fn read(path: &Path) -> Option<Vec<u8>> {
    std::fs::read(path).ok()
}
