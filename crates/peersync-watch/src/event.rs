//! Raw kernel events and the normalized operations derived from them.

use std::ffi::OsString;
use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use std::path::PathBuf;

/// Set of inotify event flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct EventMask(u32);

impl EventMask {
    /// File opened for writing was closed.
    pub const CLOSE_WRITE: EventMask = EventMask(libc::IN_CLOSE_WRITE);
    /// Entry created in a watched directory.
    pub const CREATE: EventMask = EventMask(libc::IN_CREATE);
    /// Entry removed from a watched directory.
    pub const DELETE: EventMask = EventMask(libc::IN_DELETE);
    /// The watched path itself was removed.
    pub const DELETE_SELF: EventMask = EventMask(libc::IN_DELETE_SELF);
    /// Entry renamed away from a watched directory.
    pub const MOVED_FROM: EventMask = EventMask(libc::IN_MOVED_FROM);
    /// Entry renamed into a watched directory.
    pub const MOVED_TO: EventMask = EventMask(libc::IN_MOVED_TO);
    /// Both halves of a rename.
    pub const MOVE: EventMask = EventMask(libc::IN_MOVED_FROM | libc::IN_MOVED_TO);
    /// The kernel dropped the watch.
    pub const IGNORED: EventMask = EventMask(libc::IN_IGNORED);
    /// The subject of the event is a directory.
    pub const ISDIR: EventMask = EventMask(libc::IN_ISDIR);
    /// The kernel event queue overflowed.
    pub const Q_OVERFLOW: EventMask = EventMask(libc::IN_Q_OVERFLOW);

    /// No flags.
    pub const fn empty() -> Self {
        EventMask(0)
    }

    /// Build a mask from raw bits.
    pub const fn from_bits(bits: u32) -> Self {
        EventMask(bits)
    }

    /// Raw bits.
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// True if every flag of `other` is set.
    pub const fn contains(self, other: EventMask) -> bool {
        self.0 & other.0 == other.0
    }

    /// True if any flag of `other` is set.
    pub const fn intersects(self, other: EventMask) -> bool {
        self.0 & other.0 != 0
    }

    /// True if no flag is set.
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for EventMask {
    type Output = EventMask;

    fn bitor(self, rhs: EventMask) -> EventMask {
        EventMask(self.0 | rhs.0)
    }
}

impl BitOrAssign for EventMask {
    fn bitor_assign(&mut self, rhs: EventMask) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for EventMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(EventMask, &str); 9] = [
            (EventMask::CLOSE_WRITE, "IN_CLOSE_WRITE"),
            (EventMask::CREATE, "IN_CREATE"),
            (EventMask::DELETE, "IN_DELETE"),
            (EventMask::DELETE_SELF, "IN_DELETE_SELF"),
            (EventMask::MOVED_FROM, "IN_MOVED_FROM"),
            (EventMask::MOVED_TO, "IN_MOVED_TO"),
            (EventMask::IGNORED, "IN_IGNORED"),
            (EventMask::ISDIR, "IN_ISDIR"),
            (EventMask::Q_OVERFLOW, "IN_Q_OVERFLOW"),
        ];
        let names: Vec<&str> = NAMES
            .iter()
            .filter(|(flag, _)| self.intersects(*flag))
            .map(|(_, name)| *name)
            .collect();
        if names.is_empty() {
            write!(f, "0x{:x}", self.0)
        } else {
            write!(f, "{}", names.join("|"))
        }
    }
}

/// Opaque kernel-assigned identifier of one watch registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WatchHandle(pub(crate) i32);

impl WatchHandle {
    /// Raw watch descriptor value.
    pub fn raw(self) -> i32 {
        self.0
    }
}

impl fmt::Display for WatchHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "wd:{}", self.0)
    }
}

/// One decoded `inotify_event` record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEvent {
    /// Watch the event was reported on.
    pub handle: WatchHandle,
    /// Event flags.
    pub mask: EventMask,
    /// Rename correlation token (zero when unused).
    pub cookie: u32,
    /// Entry name relative to the watched directory, if any.
    pub name: Option<OsString>,
}

/// Operation a consumer has to replicate for a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataOp {
    /// Path was created or modified.
    Copy,
    /// Path was removed.
    Delete,
}

/// A path paired with the operation to replicate for it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DataOperation {
    /// Absolute path of the affected entry.
    pub path: PathBuf,
    /// Operation to perform.
    pub op: DataOp,
}

impl DataOperation {
    /// A `Copy` operation for `path`.
    pub fn copy(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            op: DataOp::Copy,
        }
    }

    /// A `Delete` operation for `path`.
    pub fn delete(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            op: DataOp::Delete,
        }
    }
}
