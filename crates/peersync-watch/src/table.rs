//! Watch table: one inotify instance plus the set of live registrations.
//!
//! The table keeps a two-way mapping between kernel watch handles and the
//! paths they were registered for. At most one handle maps to a path; the
//! only time two paths briefly refer to the same subtree is while a directory
//! rename is being re-keyed through [`WatchTable::rename_subtree`].

use crate::error::{Result, WatchError};
use crate::event::{EventMask, RawEvent, WatchHandle};
use std::collections::HashMap;
use std::ffi::{CString, OsStr};
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::unix::AsyncFd;
use tracing::{debug, trace, warn};

/// Size of the kernel read buffer; large enough for a few hundred events.
const EVENT_BUFFER_SIZE: usize = 64 * 1024;

const EVENT_HEADER_SIZE: usize = std::mem::size_of::<libc::inotify_event>();

/// Owner of one kernel event channel and its watch registrations.
pub struct WatchTable {
    fd: AsyncFd<OwnedFd>,
    by_handle: HashMap<WatchHandle, PathBuf>,
    by_path: HashMap<PathBuf, WatchHandle>,
    buffer: Vec<u8>,
}

impl WatchTable {
    /// Create a non-blocking inotify instance registered with the tokio reactor.
    pub fn new() -> Result<Self> {
        let raw = unsafe { libc::inotify_init1(libc::IN_NONBLOCK | libc::IN_CLOEXEC) };
        if raw < 0 {
            return Err(WatchError::Init(io::Error::last_os_error()));
        }
        let owned = unsafe { OwnedFd::from_raw_fd(raw) };
        let fd = AsyncFd::new(owned).map_err(WatchError::Init)?;
        Ok(Self {
            fd,
            by_handle: HashMap::new(),
            by_path: HashMap::new(),
            buffer: vec![0u8; EVENT_BUFFER_SIZE],
        })
    }

    /// Register `path` for the events in `mask`.
    ///
    /// Registering a path that is already watched replaces its mask and
    /// returns the existing handle.
    pub fn add(&mut self, path: &Path, mask: EventMask) -> Result<WatchHandle> {
        let invalid = |_: std::ffi::NulError| WatchError::InvalidPath {
            path: path.to_path_buf(),
        };
        let c_path = CString::new(path.as_os_str().as_bytes()).map_err(invalid)?;

        let wd = unsafe { libc::inotify_add_watch(self.raw_fd(), c_path.as_ptr(), mask.bits()) };
        if wd < 0 {
            return Err(WatchError::AddWatch {
                path: path.to_path_buf(),
                source: io::Error::last_os_error(),
            });
        }
        let handle = WatchHandle(wd);

        if let Some(previous) = self.by_path.get(path).copied() {
            if previous != handle {
                // The path now refers to a different inode; the old watch is stale.
                self.remove(previous);
            }
        }
        if let Some(old_path) = self.by_handle.get(&handle) {
            if old_path != path {
                let old_path = old_path.clone();
                self.by_path.remove(&old_path);
            }
        }

        self.by_handle.insert(handle, path.to_path_buf());
        self.by_path.insert(path.to_path_buf(), handle);
        debug!("Watch added: {:?} ({}, mask {})", path, handle, mask);
        Ok(handle)
    }

    /// Release a registration and return the path it was watching.
    pub fn remove(&mut self, handle: WatchHandle) -> Option<PathBuf> {
        let path = self.unmap(handle)?;
        let rc = unsafe { libc::inotify_rm_watch(self.raw_fd(), handle.0) };
        if rc < 0 {
            // EINVAL means the kernel already dropped it.
            trace!(
                "inotify_rm_watch({}) for {:?}: {}",
                handle,
                path,
                io::Error::last_os_error()
            );
        }
        debug!("Stopped monitoring {:?} ({})", path, handle);
        Some(path)
    }

    /// Drop a registration the kernel has already invalidated.
    pub fn forget(&mut self, handle: WatchHandle) -> Option<PathBuf> {
        let path = self.unmap(handle)?;
        debug!("Watch {} for {:?} invalidated by kernel", handle, path);
        Some(path)
    }

    /// Release every registration at or below `prefix`. Returns how many were removed.
    pub fn remove_subtree(&mut self, prefix: &Path) -> usize {
        let handles: Vec<WatchHandle> = self
            .by_handle
            .iter()
            .filter(|(_, path)| path.starts_with(prefix))
            .map(|(handle, _)| *handle)
            .collect();
        for handle in &handles {
            self.remove(*handle);
        }
        handles.len()
    }

    /// Re-key every registration under `old` to live under `new`.
    ///
    /// Used after a watched directory is renamed: the kernel watches follow the
    /// inodes, only the recorded paths are stale.
    pub fn rename_subtree(&mut self, old: &Path, new: &Path) -> usize {
        let moved: Vec<(WatchHandle, PathBuf)> = self
            .by_handle
            .iter()
            .filter_map(|(handle, path)| {
                let rest = path.strip_prefix(old).ok()?;
                let renamed = if rest.as_os_str().is_empty() {
                    new.to_path_buf()
                } else {
                    new.join(rest)
                };
                Some((*handle, renamed))
            })
            .collect();

        for (handle, renamed) in &moved {
            if let Some(previous) = self.by_handle.insert(*handle, renamed.clone()) {
                if self.by_path.get(&previous) == Some(handle) {
                    self.by_path.remove(&previous);
                }
            }
        }
        for (handle, renamed) in &moved {
            if let Some(displaced) = self.by_path.insert(renamed.clone(), *handle) {
                if displaced != *handle {
                    self.remove(displaced);
                    self.by_path.insert(renamed.clone(), *handle);
                }
            }
        }
        if !moved.is_empty() {
            debug!("Re-keyed {} watches from {:?} to {:?}", moved.len(), old, new);
        }
        moved.len()
    }

    /// Path registered for `handle`.
    pub fn path_of(&self, handle: WatchHandle) -> Option<&Path> {
        self.by_handle.get(&handle).map(PathBuf::as_path)
    }

    /// Handle registered for `path`.
    pub fn handle_of(&self, path: &Path) -> Option<WatchHandle> {
        self.by_path.get(path).copied()
    }

    /// True if `path` has a live registration.
    pub fn is_watched(&self, path: &Path) -> bool {
        self.by_path.contains_key(path)
    }

    /// All watched paths, sorted.
    pub fn paths(&self) -> Vec<PathBuf> {
        let mut paths: Vec<PathBuf> = self.by_path.keys().cloned().collect();
        paths.sort();
        paths
    }

    /// Number of live registrations.
    pub fn len(&self) -> usize {
        self.by_handle.len()
    }

    /// True if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.by_handle.is_empty()
    }

    /// Suspend until the channel is readable, then decode one buffer of events.
    ///
    /// Cancel-safe: no data is consumed until the read itself happens, and the
    /// read and decode complete without yielding.
    pub async fn read_events(&mut self) -> Result<Vec<RawEvent>> {
        let fd = &self.fd;
        let buffer = &mut self.buffer;
        loop {
            let mut guard = fd.readable().await.map_err(WatchError::Read)?;
            match guard.try_io(|inner| read_into(inner.get_ref().as_raw_fd(), buffer)) {
                Ok(Ok(0)) => return Ok(Vec::new()),
                Ok(Ok(n)) => return Ok(decode_events(&buffer[..n])),
                Ok(Err(e)) if e.kind() == io::ErrorKind::Interrupted => continue,
                Ok(Err(e)) => return Err(WatchError::Read(e)),
                Err(_would_block) => continue,
            }
        }
    }

    /// Like [`read_events`](Self::read_events) but gives up after `window`.
    pub async fn try_read_events(&mut self, window: Duration) -> Result<Vec<RawEvent>> {
        match tokio::time::timeout(window, self.read_events()).await {
            Ok(result) => result,
            Err(_elapsed) => Ok(Vec::new()),
        }
    }

    fn unmap(&mut self, handle: WatchHandle) -> Option<PathBuf> {
        let path = self.by_handle.remove(&handle)?;
        if self.by_path.get(&path) == Some(&handle) {
            self.by_path.remove(&path);
        }
        Some(path)
    }

    fn raw_fd(&self) -> i32 {
        self.fd.get_ref().as_raw_fd()
    }
}

impl Drop for WatchTable {
    fn drop(&mut self) {
        let fd = self.raw_fd();
        for handle in self.by_handle.keys() {
            unsafe {
                libc::inotify_rm_watch(fd, handle.0);
            }
        }
        if !self.by_handle.is_empty() {
            debug!("Released {} watches", self.by_handle.len());
        }
        self.by_handle.clear();
        self.by_path.clear();
    }
}

fn read_into(fd: i32, buffer: &mut [u8]) -> io::Result<usize> {
    let n = unsafe { libc::read(fd, buffer.as_mut_ptr() as *mut libc::c_void, buffer.len()) };
    if n < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}

/// Decode a buffer of packed `inotify_event` records.
fn decode_events(buffer: &[u8]) -> Vec<RawEvent> {
    let mut events = Vec::new();
    let mut offset = 0;

    while offset + EVENT_HEADER_SIZE <= buffer.len() {
        // The buffer is a byte vector, so the header may be unaligned.
        let header: libc::inotify_event = unsafe {
            std::ptr::read_unaligned(buffer.as_ptr().add(offset) as *const libc::inotify_event)
        };
        let name_start = offset + EVENT_HEADER_SIZE;
        let name_end = name_start + header.len as usize;
        if name_end > buffer.len() {
            warn!("Truncated inotify event at offset {}", offset);
            break;
        }

        let raw_name = &buffer[name_start..name_end];
        let trimmed = match raw_name.iter().position(|b| *b == 0) {
            Some(nul) => &raw_name[..nul],
            None => raw_name,
        };
        let name = if trimmed.is_empty() {
            None
        } else {
            Some(OsStr::from_bytes(trimmed).to_os_string())
        };

        events.push(RawEvent {
            handle: WatchHandle(header.wd),
            mask: EventMask::from_bits(header.mask),
            cookie: header.cookie,
            name,
        });
        offset = name_end;
    }

    events
}
