//! Platform file-change sources behind one contract.
//!
//! Each adapter watches a directory tree and delivers [`Notice`]s: batches
//! of raw `(path, action mask)` events, an overflow signal when the kernel
//! dropped events, or a stop acknowledgement. The listener owns the
//! classification and publishing; adapters only translate their platform's
//! vocabulary.

use std::path::PathBuf;

use bitflags::bitflags;

bitflags! {
    /// Action mask reported with each raw event.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EventFlags: u32 {
        /// A file or directory appeared.
        const CREATED = 1 << 0;
        /// Contents or metadata changed.
        const MODIFIED = 1 << 1;
        /// The path is gone.
        const DELETED = 1 << 2;
        /// Renamed away from this path.
        const RENAMED_FROM = 1 << 3;
        /// Renamed onto this path.
        const RENAMED_TO = 1 << 4;
        /// The path is (or was) a directory.
        const IS_DIR = 1 << 5;
    }
}

impl EventFlags {
    /// Whether the path stopped existing under this name.
    pub fn went_away(self) -> bool {
        self.intersects(EventFlags::DELETED | EventFlags::RENAMED_FROM)
    }
}

/// One raw event from the platform watcher; paths are absolute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsEvent {
    /// Absolute path the event applies to.
    pub path: PathBuf,
    /// What happened.
    pub flags: EventFlags,
}

/// One delivery from the watcher.
#[derive(Debug)]
pub enum Notice {
    /// A batch of events, in kernel order.
    Events(Vec<FsEvent>),
    /// The kernel (or the adapter's buffer) dropped events; history is no
    /// longer trustworthy.
    Overflow,
    /// The stop handle was used; no further notices follow.
    Stopped,
}

/// Whether this build carries a watcher for the running platform.
pub const fn is_supported() -> bool {
    cfg!(any(target_os = "linux", target_os = "macos", windows))
}

#[cfg(target_os = "linux")]
mod inotify;
#[cfg(target_os = "linux")]
pub use self::inotify::Watcher;
#[cfg(target_os = "linux")]
pub use self::inotify::WatcherStop;

#[cfg(target_os = "macos")]
mod fsevents;
#[cfg(target_os = "macos")]
pub use self::fsevents::Watcher;
#[cfg(target_os = "macos")]
pub use self::fsevents::WatcherStop;

#[cfg(windows)]
mod windows;
#[cfg(windows)]
pub use self::windows::IdleWaiter;
#[cfg(windows)]
pub use self::windows::Watcher;
#[cfg(windows)]
pub use self::windows::WatcherStop;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn went_away_covers_delete_and_rename() {
        assert!(EventFlags::DELETED.went_away());
        assert!((EventFlags::RENAMED_FROM | EventFlags::IS_DIR).went_away());
        assert!(!EventFlags::CREATED.went_away());
        assert!(!EventFlags::RENAMED_TO.went_away());
    }
}
