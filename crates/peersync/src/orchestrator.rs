//! Sync orchestrator: owns the replication items and drives their full-sync,
//! immediate and periodic replication.
//!
//! Every launch of the per-item loops carries an epoch. Disabling sync,
//! shutting down or relaunching publishes a new control value; loops check
//! it at each iteration and at every suspension point, and exit once it no
//! longer matches their launch. A copy in flight is always allowed to finish.

use crate::diagnostics::WatchRegistry;
use crate::error::{Result, SyncError};
use crate::item::{ReplicationItem, RetryPolicy, SyncTrigger};
use crate::notify::write_notify_request;
use crate::role::{is_eligible, RoleProvider};
use crate::status::{FullSyncStatus, SyncEventsHealth, SyncStatus};
use crate::transfer::{CopyOutcome, CopyRequest, DataCopier};
use peersync_watch::{ChangeWatcher, DataOp, DataOperation, EventMask};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Events an immediate item's watcher subscribes to.
const WATCH_MASK: EventMask = EventMask::from_bits(
    EventMask::CLOSE_WRITE.bits()
        | EventMask::MOVE.bits()
        | EventMask::DELETE_SELF.bits()
        | EventMask::CREATE.bits()
        | EventMask::DELETE.bits(),
);

/// How a full sync with failed copies is reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FullSyncPolicy {
    /// Report `Completed` with health `Ok` even if some copies failed.
    #[default]
    ForceCompleted,
    /// Report `Failed` with health `Critical` if any copy failed.
    Strict,
}

/// Orchestrator knobs.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Reporting policy for partially failed full syncs.
    pub full_sync_policy: FullSyncPolicy,
    /// Poll interval while waiting for full-sync copies.
    pub full_sync_poll: Duration,
    /// Where notify descriptors are written before transfer.
    pub notify_staging_dir: PathBuf,
    /// Sibling directory receiving notify descriptors.
    pub sibling_inbox_dir: PathBuf,
}

/// Lifecycle state of one item's loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemState {
    /// Not started.
    Idle,
    /// Waiting for changes or for the next period.
    Watching,
    /// Copying.
    Syncing,
    /// Retrying a copy whose source vanished.
    Retrying,
    /// Loop exited.
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
struct Control {
    disabled: bool,
    shutdown: bool,
    epoch: u64,
}

/// Drives replication for a set of items.
pub struct SyncOrchestrator {
    settings: OrchestratorSettings,
    items: Vec<ReplicationItem>,
    role: Arc<dyn RoleProvider>,
    copier: Arc<dyn DataCopier>,
    status: Arc<SyncStatus>,
    control: watch::Sender<Control>,
    registry: Arc<WatchRegistry>,
    states: Mutex<HashMap<PathBuf, (u64, ItemState)>>,
    full_sync_running: AtomicBool,
}

impl SyncOrchestrator {
    /// Create an orchestrator. Nothing runs until [`SyncOrchestrator::run`].
    pub fn new(
        settings: OrchestratorSettings,
        items: Vec<ReplicationItem>,
        role: Arc<dyn RoleProvider>,
        copier: Arc<dyn DataCopier>,
        status: Arc<SyncStatus>,
    ) -> Arc<Self> {
        let (control, _) = watch::channel(Control {
            disabled: status.disable_sync(),
            ..Control::default()
        });
        let states = items
            .iter()
            .map(|item| (item.path.clone(), (0, ItemState::Idle)))
            .collect();
        Arc::new(Self {
            settings,
            items,
            role,
            copier,
            status,
            control,
            registry: Arc::new(WatchRegistry::new()),
            states: Mutex::new(states),
            full_sync_running: AtomicBool::new(false),
        })
    }

    /// Refresh the role, run the startup full sync if redundancy is
    /// enabled, then launch the item loops.
    pub async fn run(self: &Arc<Self>) {
        self.role.refresh().await;
        info!(
            "Starting sync orchestrator: role={}, redundancy={}, items={}",
            self.role.role(),
            self.role.redundancy_enabled(),
            self.items.len()
        );

        if self.status.disable_sync() {
            info!("Sync is disabled, not starting sync events");
            self.status.set_sync_events_health(SyncEventsHealth::Paused);
            return;
        }
        if self.status.sync_events_health() == SyncEventsHealth::Paused {
            self.status.set_sync_events_health(SyncEventsHealth::Ok);
        }

        if self.role.redundancy_enabled() {
            self.start_full_sync().await;
        } else {
            info!("Redundancy is not enabled, skipping full sync");
        }
        self.start_sync_events(false);
    }

    /// Copy every eligible item once and wait for all copies.
    ///
    /// Returns the resulting status. If a full sync is already running this
    /// returns immediately with the current status.
    pub async fn start_full_sync(self: &Arc<Self>) -> FullSyncStatus {
        if self.full_sync_running.swap(true, Ordering::SeqCst) {
            warn!("Full sync already in progress");
            return self.status.full_sync_status();
        }
        self.run_full_sync().await
    }

    /// Start a full sync in the background on demand.
    pub fn request_full_sync(self: &Arc<Self>) -> Result<()> {
        if self.status.disable_sync() {
            return Err(SyncError::SyncDisabled);
        }
        if self.full_sync_running.swap(true, Ordering::SeqCst) {
            return Err(SyncError::FullSyncInProgress);
        }
        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.run_full_sync().await;
        });
        Ok(())
    }

    async fn run_full_sync(self: &Arc<Self>) -> FullSyncStatus {
        self.status.set_full_sync_status(FullSyncStatus::InProgress);
        let role = self.role.role();
        let eligible: Vec<ReplicationItem> = self
            .items
            .iter()
            .filter(|item| is_eligible(item.direction, role))
            .cloned()
            .collect();
        info!("Full sync started for {} items", eligible.len());

        let launched = eligible.len();
        let pending = Arc::new(AtomicUsize::new(launched));
        let results = Arc::new(std::sync::Mutex::new(Vec::with_capacity(launched)));
        for item in eligible {
            let this = Arc::clone(self);
            let pending = Arc::clone(&pending);
            let results = Arc::clone(&results);
            tokio::spawn(async move {
                let _done = CompletionGuard(pending);
                let outcome = this.sync_path(&item, &item.path, true).await;
                if !outcome.is_success() {
                    error!("Full sync of {:?} failed: {:?}", item.path, outcome);
                }
                results
                    .lock()
                    .unwrap_or_else(|p| p.into_inner())
                    .push(outcome.is_success());
            });
        }

        while pending.load(Ordering::SeqCst) > 0 {
            tokio::time::sleep(self.settings.full_sync_poll).await;
        }

        let all_succeeded = {
            let results = results.lock().unwrap_or_else(|p| p.into_inner());
            results.len() == launched && results.iter().all(|ok| *ok)
        };
        let status = if all_succeeded {
            info!("Full sync completed");
            self.complete_full_sync()
        } else {
            match self.settings.full_sync_policy {
                FullSyncPolicy::ForceCompleted => {
                    warn!("Full sync had failures, forcing status to Completed");
                    self.complete_full_sync()
                }
                FullSyncPolicy::Strict => {
                    error!("Full sync failed");
                    self.status.set_full_sync_status(FullSyncStatus::Failed);
                    self.status.set_sync_events_health(SyncEventsHealth::Critical);
                    FullSyncStatus::Failed
                }
            }
        };
        self.full_sync_running.store(false, Ordering::SeqCst);
        status
    }

    fn complete_full_sync(&self) -> FullSyncStatus {
        self.status.set_full_sync_status(FullSyncStatus::Completed);
        if !self.status.disable_sync() {
            self.status.set_sync_events_health(SyncEventsHealth::Ok);
        }
        FullSyncStatus::Completed
    }

    /// Launch the loops of all eligible items, superseding earlier launches.
    ///
    /// With `catch_up`, each immediate item is copied once after its watcher
    /// is in place, so changes made while no loop was running propagate.
    pub fn start_sync_events(self: &Arc<Self>, catch_up: bool) {
        let mut epoch = 0;
        let mut runnable = false;
        self.control.send_modify(|c| {
            if !c.shutdown && !c.disabled {
                c.epoch += 1;
                runnable = true;
            }
            epoch = c.epoch;
        });
        if !runnable {
            debug!("Sync stopped or disabled, not starting sync events");
            return;
        }

        let role = self.role.role();
        for item in &self.items {
            if !is_eligible(item.direction, role) {
                debug!(
                    "Skipping {:?}: direction {} not eligible for role {}",
                    item.path, item.direction, role
                );
                continue;
            }
            let this = Arc::clone(self);
            let item = item.clone();
            match item.trigger {
                SyncTrigger::Immediate => {
                    tokio::spawn(async move {
                        this.immediate_loop(item, epoch, catch_up).await;
                    });
                }
                SyncTrigger::Periodic(period) => {
                    tokio::spawn(async move {
                        this.periodic_loop(item, epoch, period).await;
                    });
                }
            }
        }
    }

    /// Toggle global sync. Returns false if nothing changed.
    ///
    /// Disabling pauses health and lets running loops stop at their next
    /// check. Enabling restores health and relaunches the loops with a
    /// catch-up copy. A `Critical` health is left untouched either way.
    pub fn set_disable_sync(self: &Arc<Self>, disable: bool) -> bool {
        if !self.status.set_disable_sync(disable) {
            return false;
        }
        let critical = self.status.sync_events_health() == SyncEventsHealth::Critical;
        self.control.send_modify(|c| c.disabled = disable);
        if disable {
            info!("Sync disabled");
            if !critical {
                self.status.set_sync_events_health(SyncEventsHealth::Paused);
            }
        } else {
            info!("Sync enabled");
            if !critical {
                self.status.set_sync_events_health(SyncEventsHealth::Ok);
            }
            self.start_sync_events(true);
        }
        true
    }

    /// Ask all loops to stop.
    pub fn shutdown(&self) {
        info!("Shutting down sync orchestrator");
        self.control.send_modify(|c| c.shutdown = true);
    }

    /// True if `item` is one of the configured items.
    pub fn contains_item(&self, item: &ReplicationItem) -> bool {
        self.items.contains(item)
    }

    /// Loop state of the item configured at `path`.
    pub async fn item_state(&self, path: &Path) -> Option<ItemState> {
        self.states.lock().await.get(path).map(|(_, state)| *state)
    }

    /// Current full-sync status.
    pub fn full_sync_status(&self) -> FullSyncStatus {
        self.status.full_sync_status()
    }

    /// Current replication health.
    pub fn sync_events_health(&self) -> SyncEventsHealth {
        self.status.sync_events_health()
    }

    /// Current disable toggle.
    pub fn disable_sync(&self) -> bool {
        self.status.disable_sync()
    }

    /// Paths currently under watch across all items.
    pub async fn watched_paths(&self) -> Vec<PathBuf> {
        self.registry.snapshot().await
    }

    /// Registry backing [`SyncOrchestrator::watched_paths`].
    pub fn registry(&self) -> Arc<WatchRegistry> {
        Arc::clone(&self.registry)
    }

    async fn immediate_loop(self: Arc<Self>, item: ReplicationItem, epoch: u64, catch_up: bool) {
        let mut control = self.control.subscribe();
        let watcher = ChangeWatcher::new(item.path.clone(), WATCH_MASK, item.excludes.clone());
        let mut watcher = match watcher {
            Ok(watcher) => watcher,
            Err(e) => {
                error!("Failed to watch {:?}: {}", item.path, e);
                self.set_state(&item.path, epoch, ItemState::Stopped).await;
                return;
            }
        };
        self.registry
            .update(&item.path, epoch, watcher.watched_paths())
            .await;
        self.set_state(&item.path, epoch, ItemState::Watching).await;
        info!("Watching {:?} for changes", item.path);

        if catch_up && item.path.exists() {
            self.set_state(&item.path, epoch, ItemState::Syncing).await;
            self.sync_path(&item, &item.path, true).await;
            self.set_state(&item.path, epoch, ItemState::Watching).await;
        }

        loop {
            if halted(&mut control, epoch) {
                break;
            }

            if watcher.is_inert() {
                debug!("Watch root {:?} removed, rebuilding watcher", item.path);
                let rebuilt =
                    ChangeWatcher::new(item.path.clone(), WATCH_MASK, item.excludes.clone());
                watcher = match rebuilt {
                    Ok(watcher) => watcher,
                    Err(e) => {
                        error!("Failed to re-watch {:?}: {}", item.path, e);
                        break;
                    }
                };
                self.registry
                    .update(&item.path, epoch, watcher.watched_paths())
                    .await;
                if !watcher.is_fallback() {
                    // Root came back before the new watch was in place.
                    self.sync_path(&item, &item.path, true).await;
                }
                continue;
            }

            let batch = tokio::select! {
                batch = watcher.wait_for_change() => batch,
                changed = control.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
            };
            let operations = match batch {
                Ok(operations) => operations,
                Err(e) => {
                    error!("Failed to read changes for {:?}: {}", item.path, e);
                    break;
                }
            };

            self.set_state(&item.path, epoch, ItemState::Syncing).await;
            for operation in &operations {
                self.apply(&item, &mut control, epoch, operation).await;
            }
            self.registry
                .update(&item.path, epoch, watcher.watched_paths())
                .await;
            self.set_state(&item.path, epoch, ItemState::Watching).await;
        }

        self.registry.remove(&item.path, epoch).await;
        self.set_state(&item.path, epoch, ItemState::Stopped).await;
        debug!("Stopped watching {:?}", item.path);
    }

    async fn periodic_loop(self: Arc<Self>, item: ReplicationItem, epoch: u64, period: Duration) {
        let mut control = self.control.subscribe();
        self.set_state(&item.path, epoch, ItemState::Watching).await;
        info!("Syncing {:?} every {:?}", item.path, period);

        while pause(&mut control, epoch, period).await {
            self.set_state(&item.path, epoch, ItemState::Syncing).await;
            let outcome = self.sync_path(&item, &item.path, true).await;
            if !outcome.is_success() {
                error!("Periodic sync of {:?} failed: {:?}", item.path, outcome);
            }
            self.set_state(&item.path, epoch, ItemState::Watching).await;
        }

        self.set_state(&item.path, epoch, ItemState::Stopped).await;
        debug!("Stopped periodic sync of {:?}", item.path);
    }

    async fn apply(
        &self,
        item: &ReplicationItem,
        control: &mut watch::Receiver<Control>,
        epoch: u64,
        operation: &DataOperation,
    ) {
        let mirror_missing = operation.op == DataOp::Delete;
        match self.sync_path(item, &operation.path, mirror_missing).await {
            CopyOutcome::Success => {}
            CopyOutcome::Failed => {
                error!("Failed to sync {:?} ({:?})", operation.path, operation.op);
            }
            CopyOutcome::SourceVanished => match item.retry {
                Some(policy) if policy.attempts > 0 => {
                    self.set_state(&item.path, epoch, ItemState::Retrying).await;
                    self.retry(item, control, epoch, &operation.path, policy).await;
                    self.set_state(&item.path, epoch, ItemState::Syncing).await;
                }
                _ => warn!("Source {:?} vanished before it could be synced", operation.path),
            },
        }
    }

    async fn retry(
        &self,
        item: &ReplicationItem,
        control: &mut watch::Receiver<Control>,
        epoch: u64,
        vanished: &Path,
        policy: RetryPolicy,
    ) {
        for attempt in 1..=policy.attempts {
            if !pause(control, epoch, policy.interval).await {
                return;
            }
            let source = surviving_ancestor(&item.path, vanished);
            info!(
                "Retry {}/{} for vanished {:?} using {:?}",
                attempt, policy.attempts, vanished, source
            );
            if self.sync_path(item, &source, true).await.is_success() {
                return;
            }
        }
        error!(
            "Giving up on {:?} after {} retry attempts",
            vanished, policy.attempts
        );
    }

    /// Copy `source` under the settings of `item`, then notify the sibling
    /// if the item asks for it.
    async fn sync_path(
        &self,
        item: &ReplicationItem,
        source: &Path,
        mirror_missing: bool,
    ) -> CopyOutcome {
        let request = CopyRequest {
            source: source.to_path_buf(),
            destination: item.destination.clone(),
            excludes: item.excludes.clone(),
            recursive: item.is_dir,
            mirror_deletes: item.is_dir,
            mirror_missing,
        };
        let outcome = self.copier.copy(&request).await;
        debug!("Synced {:?}: {:?}", source, outcome);

        if outcome.is_success() {
            if let Some(spec) = item.notify_sibling.as_ref().filter(|s| s.applies_to(source)) {
                match write_notify_request(&self.settings.notify_staging_dir, spec, source) {
                    Ok(descriptor) => {
                        if !self
                            .copier
                            .notify(&descriptor, &self.settings.sibling_inbox_dir)
                            .await
                        {
                            warn!("Sibling notify for {:?} was not delivered", source);
                            if let Err(e) = tokio::fs::remove_file(&descriptor).await {
                                debug!("Could not remove {:?}: {}", descriptor, e);
                            }
                        }
                    }
                    Err(e) => warn!("Failed to write notify request for {:?}: {}", source, e),
                }
            }
        }
        outcome
    }

    async fn set_state(&self, item: &Path, epoch: u64, state: ItemState) {
        let mut states = self.states.lock().await;
        let entry = states
            .entry(item.to_path_buf())
            .or_insert((epoch, ItemState::Idle));
        if entry.0 <= epoch {
            *entry = (epoch, state);
        }
    }
}

/// Decrements the outstanding full-sync copy count when dropped.
struct CompletionGuard(Arc<AtomicUsize>);

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// True once loops of the launch `epoch` must exit.
fn halted(control: &mut watch::Receiver<Control>, epoch: u64) -> bool {
    let c = control.borrow_and_update();
    c.shutdown || c.disabled || c.epoch != epoch
}

/// Sleep for `period`, waking early on control changes. Returns false if the
/// launch was halted.
///
/// A period too long to represent as a deadline sleeps until halted.
async fn pause(control: &mut watch::Receiver<Control>, epoch: u64, period: Duration) -> bool {
    let deadline = Instant::now().checked_add(period);
    loop {
        if halted(control, epoch) {
            return false;
        }
        tokio::select! {
            _ = sleep_until(deadline) => break,
            changed = control.changed() => {
                if changed.is_err() {
                    return false;
                }
            }
        }
    }
    !halted(control, epoch)
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Nearest existing strict ancestor of `vanished` inside `root`, or `root`.
fn surviving_ancestor(root: &Path, vanished: &Path) -> PathBuf {
    vanished
        .ancestors()
        .skip(1)
        .take_while(|p| p.starts_with(root))
        .find(|p| p.exists())
        .unwrap_or(root)
        .to_path_buf()
}
