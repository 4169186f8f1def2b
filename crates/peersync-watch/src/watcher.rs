//! Change watcher: turns raw inotify events for one monitored root into
//! normalized `Copy`/`Delete` operations.
//!
//! The root may be a file or a directory and does not need to exist. A
//! missing root is tracked through its nearest existing ancestor (fallback
//! mode) until it appears. Once the root is removed the watcher goes inert and
//! has to be rebuilt by its owner.

use crate::error::{Result, WatchError};
use crate::event::{DataOp, DataOperation, EventMask, RawEvent, WatchHandle};
use crate::filter::PathFilter;
use crate::table::WatchTable;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, trace, warn};

/// How long a rename-away waits for its rename-into counterpart.
pub const MOVE_PAIR_WINDOW: Duration = Duration::from_millis(20);

/// Mask used on ancestors while the root does not exist.
const FALLBACK_MASK: EventMask = EventMask::from_bits(
    EventMask::CREATE.bits()
        | EventMask::CLOSE_WRITE.bits()
        | EventMask::MOVED_TO.bits()
        | EventMask::DELETE.bits()
        | EventMask::DELETE_SELF.bits(),
);

/// Flags every directory watch needs for bookkeeping.
const DIR_BOOKKEEPING: EventMask = EventMask::from_bits(
    EventMask::CREATE.bits() | EventMask::MOVE.bits() | EventMask::DELETE_SELF.bits(),
);

/// A rename-away waiting for its counterpart until `deadline`.
#[derive(Debug, Clone)]
struct PendingMove {
    path: PathBuf,
    is_dir: bool,
    hidden: bool,
    deadline: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    /// Root exists and is watched.
    Armed,
    /// Root is missing; an ancestor is watched.
    Fallback,
    /// Root was removed; nothing is watched.
    Inert,
}

/// Watches one root path and reports normalized change operations.
pub struct ChangeWatcher {
    root: PathBuf,
    mask: EventMask,
    excludes: PathFilter,
    table: WatchTable,
    mode: Mode,
    pending_moves: HashMap<u32, PendingMove>,
    batch: Vec<DataOperation>,
}

impl ChangeWatcher {
    /// Start watching `root` for the events in `mask`.
    ///
    /// Succeeds for a missing root as long as some ancestor directory exists.
    pub fn new(root: impl Into<PathBuf>, mask: EventMask, excludes: PathFilter) -> Result<Self> {
        let mut watcher = Self {
            root: root.into(),
            mask,
            excludes,
            table: WatchTable::new()?,
            mode: Mode::Fallback,
            pending_moves: HashMap::new(),
            batch: Vec::new(),
        };

        if watcher.root.exists() {
            watcher.arm()?;
        } else {
            debug!("Given path {:?} doesn't exist to watch", watcher.root);
            let ancestor = existing_ancestor(&watcher.root).ok_or_else(|| {
                WatchError::NoExistingAncestor {
                    path: watcher.root.clone(),
                }
            })?;
            watcher.table.add(&ancestor, FALLBACK_MASK)?;
        }
        Ok(watcher)
    }

    /// The monitored root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// True once the root has been removed; no further operations will be reported.
    pub fn is_inert(&self) -> bool {
        self.mode == Mode::Inert
    }

    /// True while the root is missing and an ancestor is watched in its place.
    pub fn is_fallback(&self) -> bool {
        self.mode == Mode::Fallback
    }

    /// Paths that currently hold a watch, sorted.
    pub fn watched_paths(&self) -> Vec<PathBuf> {
        self.table.paths()
    }

    /// Wait for the next batch of operations.
    ///
    /// Never returns an empty list. Cancel-safe: events already read stay
    /// buffered in the watcher for the next call. An inert watcher never
    /// completes.
    pub async fn wait_for_change(&mut self) -> Result<Vec<DataOperation>> {
        loop {
            if self.mode == Mode::Inert && self.batch.is_empty() {
                return std::future::pending().await;
            }

            match self.earliest_move_deadline() {
                None => {
                    if !self.batch.is_empty() {
                        return Ok(self.take_batch());
                    }
                    let events = self.table.read_events().await?;
                    self.process_events(events);
                }
                Some(deadline) => {
                    // Deadlines are fixed at insertion, so a busy stream
                    // cannot hold the batch back past the earliest one.
                    let window = deadline.saturating_duration_since(Instant::now());
                    let events = self.table.try_read_events(window).await?;
                    self.process_events(events);
                    let now = Instant::now();
                    self.expire_pending_moves(now);
                    if now >= deadline && !self.batch.is_empty() {
                        return Ok(self.take_batch());
                    }
                }
            }
        }
    }

    fn earliest_move_deadline(&self) -> Option<Instant> {
        self.pending_moves.values().map(|m| m.deadline).min()
    }

    fn process_events(&mut self, events: Vec<RawEvent>) {
        for event in events {
            if self.mode == Mode::Inert {
                trace!("Watcher for {:?} is inert, dropping {}", self.root, event.mask);
                continue;
            }
            trace!(
                "Received {} for {} name {:?} cookie {}",
                event.mask,
                event.handle,
                event.name,
                event.cookie
            );
            match self.mode {
                Mode::Armed => self.process_armed(event),
                Mode::Fallback => self.process_fallback(event),
                Mode::Inert => {}
            }
        }
    }

    fn process_armed(&mut self, event: RawEvent) {
        if event.mask.contains(EventMask::Q_OVERFLOW) {
            warn!("Event queue overflowed for {:?}, resyncing root", self.root);
            self.batch.push(DataOperation::copy(self.root.clone()));
            return;
        }

        let Some(base) = self.table.path_of(event.handle).map(Path::to_path_buf) else {
            trace!("Discarding {} for unknown {}", event.mask, event.handle);
            return;
        };

        if event.mask.contains(EventMask::IGNORED) {
            self.table.forget(event.handle);
            return;
        }

        let hidden = event
            .name
            .as_ref()
            .is_some_and(|n| n.as_bytes().starts_with(b"."));
        let path = match &event.name {
            Some(name) => base.join(name),
            None => base.clone(),
        };

        if hidden && !event.mask.contains(EventMask::MOVED_FROM) {
            debug!("Ignoring {} as received for the hidden file {:?}", event.mask, path);
            return;
        }
        if self.excludes.is_excluded(&path) {
            debug!("{:?} is in exclude list. Hence skipping", path);
            return;
        }

        let is_dir = event.mask.contains(EventMask::ISDIR);

        if event.mask.contains(EventMask::CLOSE_WRITE) {
            self.batch.push(DataOperation::copy(path));
        } else if event.mask.contains(EventMask::CREATE) {
            self.on_create(path, is_dir);
        } else if event.mask.contains(EventMask::MOVED_FROM) {
            debug!("Received an IN_MOVED_FROM for {:?} with cookie {}", path, event.cookie);
            let deadline = Instant::now() + MOVE_PAIR_WINDOW;
            self.pending_moves.insert(
                event.cookie,
                PendingMove {
                    path,
                    is_dir,
                    hidden,
                    deadline,
                },
            );
        } else if event.mask.contains(EventMask::MOVED_TO) {
            self.on_moved_to(path, is_dir, event.cookie);
        } else if event.mask.contains(EventMask::DELETE_SELF) {
            if path == self.root {
                self.on_root_removed();
            } else {
                self.table.forget(event.handle);
                self.batch.push(DataOperation::delete(path));
            }
        } else if event.mask.contains(EventMask::DELETE) {
            if is_dir {
                self.table.remove_subtree(&path);
            }
            self.batch.push(DataOperation::delete(path));
        }
    }

    fn on_create(&mut self, path: PathBuf, is_dir: bool) {
        if is_dir {
            if let Err(e) = self.register_tree(&path) {
                warn!("Failed to watch created directory {:?}: {}", path, e);
            }
            self.batch.push(DataOperation::copy(path));
            return;
        }
        match fs::symlink_metadata(&path) {
            // Regular files are reported by their CLOSE_WRITE.
            Ok(meta) if meta.file_type().is_file() => {}
            Ok(_) => self.batch.push(DataOperation::copy(path)),
            Err(_) => trace!("{:?} vanished before it could be inspected", path),
        }
    }

    fn on_moved_to(&mut self, path: PathBuf, is_dir: bool, cookie: u32) {
        debug!("Received an IN_MOVED_TO for {:?} with cookie {}", path, cookie);
        if let Some(pending) = self.pending_moves.remove(&cookie) {
            if pending.hidden {
                debug!("Ignoring IN_MOVED_TO for {:?}, moved into place from a hidden file", path);
                return;
            }
            debug!("{:?} renamed/moved to {:?}", pending.path, path);
            if pending.is_dir {
                self.table.rename_subtree(&pending.path, &path);
            }
            self.batch.push(DataOperation::delete(pending.path));
        }
        if is_dir {
            if let Err(e) = self.register_tree(&path) {
                warn!("Failed to watch moved-in directory {:?}: {}", path, e);
            }
        }
        self.batch.push(DataOperation::copy(path));
    }

    fn on_root_removed(&mut self) {
        debug!("Watched root {:?} was removed", self.root);
        let root = self.root.clone();
        self.batch.retain(|op| !op.path.starts_with(&root));
        self.batch.push(DataOperation::delete(root));
        for handle in self.handles() {
            self.table.remove(handle);
        }
        self.pending_moves.clear();
        self.mode = Mode::Inert;
    }

    /// Resolve moves whose window closed by `now` as moves out of scope.
    fn expire_pending_moves(&mut self, now: Instant) {
        let cookies: Vec<u32> = self
            .pending_moves
            .iter()
            .filter(|(_, m)| m.deadline <= now)
            .map(|(cookie, _)| *cookie)
            .collect();
        let mut expired: Vec<(u32, PendingMove)> = cookies
            .into_iter()
            .filter_map(|cookie| self.pending_moves.remove_entry(&cookie))
            .collect();
        expired.sort_by_key(|(cookie, m)| (m.deadline, *cookie));
        for (cookie, pending) in expired {
            if pending.hidden {
                trace!("Dropping unmatched hidden move {:?} (cookie {})", pending.path, cookie);
                continue;
            }
            debug!("{:?} moved out of scope (cookie {})", pending.path, cookie);
            if pending.is_dir {
                self.table.remove_subtree(&pending.path);
            }
            self.batch.push(DataOperation::delete(pending.path));
        }
    }

    fn process_fallback(&mut self, event: RawEvent) {
        if event.mask.contains(EventMask::Q_OVERFLOW) {
            self.refallback();
            return;
        }

        let Some(base) = self.table.path_of(event.handle).map(Path::to_path_buf) else {
            return;
        };

        if event.mask.contains(EventMask::IGNORED) {
            self.table.forget(event.handle);
            return;
        }

        if event.mask.contains(EventMask::DELETE_SELF) {
            self.table.forget(event.handle);
            debug!("Fallback watch on {:?} removed, moving up", base);
            self.refallback();
            return;
        }

        let Some(name) = event.name else {
            return;
        };
        let path = base.join(name);
        if !self.root.starts_with(&path) {
            return;
        }

        if path == self.root {
            if event.mask.contains(EventMask::DELETE) {
                return;
            }
            // A new regular file is armed on its CLOSE_WRITE.
            let regular_create = event.mask.contains(EventMask::CREATE)
                && fs::symlink_metadata(&path).is_ok_and(|m| m.file_type().is_file());
            if regular_create {
                return;
            }
        } else if !event.mask.intersects(EventMask::CREATE | EventMask::MOVED_TO) {
            return;
        }

        self.refallback();
    }

    /// Re-evaluate the missing root: arm it if it exists, otherwise move the
    /// fallback watch down to the deepest existing ancestor.
    fn refallback(&mut self) {
        loop {
            if self.root.exists() {
                match self.arm() {
                    Ok(()) => self.batch.push(DataOperation::copy(self.root.clone())),
                    Err(e) => warn!("Failed to arm watch for {:?}: {}", self.root, e),
                }
                return;
            }

            let Some(target) = existing_ancestor(&self.root) else {
                error!("Parent path not found for the path {:?}", self.root);
                self.release_all();
                self.mode = Mode::Inert;
                return;
            };
            if self.table.is_watched(&target) && self.table.len() == 1 {
                return;
            }
            match self.table.add(&target, FALLBACK_MASK) {
                Ok(keep) => {
                    for handle in self.handles() {
                        if handle != keep {
                            self.table.remove(handle);
                        }
                    }
                }
                Err(e) => {
                    warn!("Failed to move fallback watch to {:?}: {}", target, e);
                    return;
                }
            }
            // Levels created before the new watch landed would go unseen.
            let unchanged = existing_ancestor(&self.root).as_deref() == Some(target.as_path());
            if unchanged && !self.root.exists() {
                return;
            }
        }
    }

    /// Register the real watches for an existing root and drop any fallback watches.
    fn arm(&mut self) -> Result<()> {
        let fallback: Vec<WatchHandle> = self.handles();
        let root = self.root.clone();

        if root.is_dir() {
            self.register_tree(&root)?;
        } else {
            self.table.add(&root, self.mask | EventMask::DELETE_SELF)?;
        }

        for handle in fallback {
            let outside = self
                .table
                .path_of(handle)
                .is_some_and(|p| !p.starts_with(&root));
            if outside {
                self.table.remove(handle);
            }
        }
        self.mode = Mode::Armed;
        debug!("Watching {:?} ({} watches)", root, self.table.len());
        Ok(())
    }

    /// Watch `dir` and every directory below it, without following symlinks.
    fn register_tree(&mut self, dir: &Path) -> Result<()> {
        let mask = self.mask | DIR_BOOKKEEPING;
        self.table.add(dir, mask)?;

        let mut stack = vec![dir.to_path_buf()];
        while let Some(current) = stack.pop() {
            let entries = match fs::read_dir(&current) {
                Ok(entries) => entries,
                Err(e) => {
                    debug!("Cannot list {:?}: {}", current, e);
                    continue;
                }
            };
            for entry in entries.flatten() {
                let is_dir = entry.file_type().is_ok_and(|t| t.is_dir());
                if !is_dir {
                    continue;
                }
                let child = entry.path();
                if self.excludes.is_excluded(&child) {
                    debug!("{:?} is in exclude list. Hence not watching", child);
                    continue;
                }
                match self.table.add(&child, mask) {
                    Ok(_) => stack.push(child),
                    Err(e) => warn!("Skipping subdirectory: {}", e),
                }
            }
        }
        Ok(())
    }

    fn handles(&self) -> Vec<WatchHandle> {
        self.table
            .paths()
            .iter()
            .filter_map(|p| self.table.handle_of(p))
            .collect()
    }

    fn release_all(&mut self) {
        for handle in self.handles() {
            self.table.remove(handle);
        }
    }

    /// Drain the batch, dropping duplicates and ordering deletions first.
    fn take_batch(&mut self) -> Vec<DataOperation> {
        let mut seen = HashSet::new();
        let (mut ordered, copies): (Vec<_>, Vec<_>) = self
            .batch
            .drain(..)
            .filter(|op| seen.insert(op.clone()))
            .partition(|op| op.op == DataOp::Delete);
        ordered.extend(copies);
        ordered
    }
}

/// Deepest existing directory strictly above `path`.
fn existing_ancestor(path: &Path) -> Option<PathBuf> {
    path.ancestors()
        .skip(1)
        .find(|p| !p.as_os_str().is_empty() && p.is_dir())
        .map(Path::to_path_buf)
}
