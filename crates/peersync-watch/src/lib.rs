#![warn(missing_docs)]

//! peersync change-detection engine: inotify watch table, recursive and
//! fallback watch management, rename pairing, normalized copy/delete operations

pub mod error;
pub mod event;
pub mod filter;
pub mod table;
pub mod watcher;

pub use error::{Result, WatchError};
pub use event::{DataOp, DataOperation, EventMask, RawEvent, WatchHandle};
pub use filter::PathFilter;
pub use table::WatchTable;
pub use watcher::{ChangeWatcher, MOVE_PAIR_WINDOW};
