//! Linux watcher backed by inotify.
//!
//! inotify watches are per-directory, so the adapter walks the tree at
//! startup and adds a watch for every directory (the metadata directory
//! included; the listener needs its cookie and removal events). Directories
//! created later are picked up from their creation events. A self-pipe
//! unblocks the poll for shutdown.

use std::collections::HashMap;
use std::io;
use std::os::fd::AsFd;
use std::os::fd::OwnedFd;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use log::debug;
use log::warn;
use nix::poll::PollFd;
use nix::poll::PollFlags;
use nix::poll::PollTimeout;
use nix::poll::poll;
use nix::sys::inotify::AddWatchFlags;
use nix::sys::inotify::InitFlags;
use nix::sys::inotify::Inotify;
use nix::sys::inotify::WatchDescriptor;

use super::EventFlags;
use super::FsEvent;
use super::Notice;

/// Wakes a [`Watcher`] blocked in [`Watcher::next`]; cheap to clone.
#[derive(Debug, Clone)]
pub struct WatcherStop {
    pipe_w: Arc<OwnedFd>,
}

impl WatcherStop {
    /// Ask the watcher to deliver [`Notice::Stopped`].
    pub fn stop(&self) {
        let _ = nix::unistd::write(self.pipe_w.as_fd(), b"s");
    }
}

/// Recursive inotify watcher over one worktree.
#[derive(Debug)]
pub struct Watcher {
    fd: Inotify,
    pipe_r: OwnedFd,
    pipe_w: Arc<OwnedFd>,
    watches: HashMap<WatchDescriptor, PathBuf>,
}

impl Watcher {
    /// Watch `root` and everything below it.
    pub fn new(root: &Path) -> io::Result<Watcher> {
        let fd = Inotify::init(InitFlags::IN_CLOEXEC | InitFlags::IN_NONBLOCK)?;
        let (pipe_r, pipe_w) = nix::unistd::pipe()?;
        let mut watcher = Watcher {
            fd,
            pipe_r,
            pipe_w: Arc::new(pipe_w),
            watches: HashMap::new(),
        };
        // The initial tree is the baseline, not a change; discard the scan.
        watcher.watch_tree(root)?;
        debug!("inotify: {} directories watched", watcher.watches.len());
        Ok(watcher)
    }

    /// Handle for stopping the watcher from another thread.
    pub fn stop_handle(&self) -> WatcherStop {
        WatcherStop {
            pipe_w: Arc::clone(&self.pipe_w),
        }
    }

    /// Block for the next delivery.
    pub fn next(&mut self) -> io::Result<Notice> {
        loop {
            let mut fds = [
                PollFd::new(self.fd.as_fd(), PollFlags::POLLIN),
                PollFd::new(self.pipe_r.as_fd(), PollFlags::POLLIN),
            ];
            match poll(&mut fds, PollTimeout::NONE) {
                Ok(_) => {}
                Err(nix::errno::Errno::EINTR) => continue,
                Err(err) => return Err(err.into()),
            }
            if fds[1]
                .revents()
                .is_some_and(|r| r.intersects(PollFlags::POLLIN | PollFlags::POLLHUP))
            {
                return Ok(Notice::Stopped);
            }

            let raw = match self.fd.read_events() {
                Ok(raw) => raw,
                Err(nix::errno::Errno::EAGAIN) => continue,
                Err(err) => return Err(err.into()),
            };

            let mut events = Vec::with_capacity(raw.len());
            for ev in raw {
                if ev.mask.contains(AddWatchFlags::IN_Q_OVERFLOW) {
                    warn!("inotify queue overflowed");
                    return Ok(Notice::Overflow);
                }
                if ev.mask.contains(AddWatchFlags::IN_IGNORED) {
                    self.watches.remove(&ev.wd);
                    continue;
                }
                let Some(dir) = self.watches.get(&ev.wd) else {
                    continue;
                };
                let path = match &ev.name {
                    Some(name) => dir.join(name),
                    None => dir.clone(),
                };

                let mut flags = EventFlags::empty();
                if ev.mask.contains(AddWatchFlags::IN_CREATE) {
                    flags |= EventFlags::CREATED;
                }
                if ev.mask.intersects(
                    AddWatchFlags::IN_MODIFY
                        | AddWatchFlags::IN_CLOSE_WRITE
                        | AddWatchFlags::IN_ATTRIB,
                ) {
                    flags |= EventFlags::MODIFIED;
                }
                if ev.mask.intersects(AddWatchFlags::IN_DELETE | AddWatchFlags::IN_DELETE_SELF) {
                    flags |= EventFlags::DELETED;
                }
                if ev.mask.contains(AddWatchFlags::IN_MOVED_FROM) {
                    flags |= EventFlags::RENAMED_FROM;
                }
                if ev.mask.contains(AddWatchFlags::IN_MOVED_TO) {
                    flags |= EventFlags::RENAMED_TO;
                }
                if ev.mask.contains(AddWatchFlags::IN_ISDIR) {
                    flags |= EventFlags::IS_DIR;
                }
                if flags.is_empty() {
                    continue;
                }

                // A new directory needs a watch, and anything that landed
                // in it before the watch took is reported from the scan
                // (duplicates are deduplicated downstream).
                if flags.contains(EventFlags::IS_DIR)
                    && flags.intersects(EventFlags::CREATED | EventFlags::RENAMED_TO)
                {
                    match self.watch_tree(&path) {
                        Ok(found) => events.extend(found),
                        Err(err) => {
                            warn!("cannot watch new directory {}: {err}", path.display());
                        }
                    }
                }

                events.push(FsEvent { path, flags });
            }

            if !events.is_empty() {
                return Ok(Notice::Events(events));
            }
        }
    }

    /// Add watches for `dir` and every directory below it. Returns the
    /// entries found while scanning, so callers adding a watch for a
    /// just-created directory can report anything that raced in ahead of
    /// the watch.
    fn watch_tree(&mut self, dir: &Path) -> io::Result<Vec<FsEvent>> {
        self.add_watch(dir)?;
        let mut found = Vec::new();
        let mut pending = vec![dir.to_path_buf()];
        while let Some(dir) = pending.pop() {
            let entries = match std::fs::read_dir(&dir) {
                Ok(entries) => entries,
                // The directory may vanish while we walk; events for its
                // parent already cover that.
                Err(err) => {
                    debug!("skipping unreadable directory {}: {err}", dir.display());
                    continue;
                }
            };
            for entry in entries.flatten() {
                let Ok(file_type) = entry.file_type() else {
                    continue;
                };
                let child = entry.path();
                if file_type.is_dir() && !file_type.is_symlink() {
                    if self.add_watch(&child).is_ok() {
                        pending.push(child.clone());
                    }
                    found.push(FsEvent {
                        path: child,
                        flags: EventFlags::CREATED | EventFlags::IS_DIR,
                    });
                } else {
                    found.push(FsEvent {
                        path: child,
                        flags: EventFlags::CREATED,
                    });
                }
            }
        }
        Ok(found)
    }

    fn add_watch(&mut self, dir: &Path) -> io::Result<()> {
        let mask = AddWatchFlags::IN_CREATE
            | AddWatchFlags::IN_DELETE
            | AddWatchFlags::IN_DELETE_SELF
            | AddWatchFlags::IN_MODIFY
            | AddWatchFlags::IN_CLOSE_WRITE
            | AddWatchFlags::IN_ATTRIB
            | AddWatchFlags::IN_MOVED_FROM
            | AddWatchFlags::IN_MOVED_TO;
        let wd = self.fd.add_watch(dir, mask)?;
        self.watches.insert(wd, dir.to_path_buf());
        Ok(())
    }
}
