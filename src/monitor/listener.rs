//! Listener thread: classify raw events and publish batches.
//!
//! The listener owns a mutex-free scratch area (the batch and cookie lists
//! it builds per delivery) and merges it into the daemon state under the
//! lock once per delivery. It is also the daemon's dead-man switch: losing
//! the metadata directory forces a server shutdown, and kernel-side event
//! drops force a session resync.

use std::path::Path;
use std::sync::Arc;

use log::debug;
use log::error;
use log::warn;

use crate::ipc::StopHandle;

use super::backend::Notice;
use super::backend::Watcher;
use super::state::COOKIE_PREFIX;
use super::state::MonitorState;
use super::token::PathPool;

/// Name of the metadata directory inside the watched root.
pub const GIT_DIR_NAME: &str = ".git";

/// Where a path stands relative to the watched root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathKind {
    /// Ordinary worktree content; reported to clients.
    Worktree,
    /// The metadata directory itself.
    DotGit,
    /// Inside the metadata directory; invisible to clients.
    InsideDotGit,
    /// A synchronization cookie, carrying its bare name.
    InsideDotGitCookie(String),
}

/// Classify a root-relative path (forward slashes, no leading `./`).
pub fn classify(rel: &str) -> PathKind {
    if rel == GIT_DIR_NAME {
        return PathKind::DotGit;
    }
    match rel.strip_prefix(GIT_DIR_NAME) {
        Some(rest) if rest.starts_with('/') => {
            let inner = &rest[1..];
            if !inner.contains('/') && inner.starts_with(COOKIE_PREFIX) {
                PathKind::InsideDotGitCookie(inner.to_string())
            } else {
                PathKind::InsideDotGit
            }
        }
        _ => PathKind::Worktree,
    }
}

/// The listener half of the daemon.
#[derive(Debug)]
pub struct Listener {
    state: Arc<MonitorState>,
    root: std::path::PathBuf,
    server_stop: StopHandle,
    pool: PathPool,
}

impl Listener {
    /// Build a listener publishing into `state` and stopping the IPC server
    /// through `server_stop` when the metadata directory goes away.
    pub fn new(state: Arc<MonitorState>, root: &Path, server_stop: StopHandle) -> Self {
        Listener {
            state,
            root: root.to_path_buf(),
            server_stop,
            pool: PathPool::default(),
        }
    }

    /// Consume watcher deliveries until the watcher stops or the metadata
    /// directory disappears.
    pub fn run(&mut self, watcher: &mut Watcher) {
        loop {
            match watcher.next() {
                Ok(Notice::Stopped) => {
                    debug!("listener: watcher stopped");
                    return;
                }
                Ok(Notice::Overflow) => {
                    // Whatever was built locally no longer tells the whole
                    // story; clients must be told to rescan.
                    warn!("listener: event overflow, forcing resync");
                    self.state.force_resync();
                }
                Ok(Notice::Events(events)) => {
                    if !self.consume(events) {
                        warn!("listener: metadata directory is gone, shutting down");
                        self.server_stop.stop();
                        return;
                    }
                }
                Err(err) => {
                    error!("listener: watcher failed: {err}");
                    self.server_stop.stop();
                    return;
                }
            }
        }
    }

    /// Classify one delivery. Returns `false` when the daemon must shut
    /// down (`.git` removed or renamed away).
    fn consume(&mut self, events: Vec<super::backend::FsEvent>) -> bool {
        let mut paths = Vec::new();
        let mut cookies = Vec::new();

        for ev in events {
            let Ok(rel) = ev.path.strip_prefix(&self.root) else {
                continue;
            };
            let rel = rel.to_string_lossy();
            if rel.is_empty() {
                continue;
            }
            match classify(&rel) {
                PathKind::Worktree => {
                    let mut owned = rel.into_owned();
                    if ev.flags.contains(super::backend::EventFlags::IS_DIR) {
                        owned.push('/');
                    }
                    paths.push(self.pool.intern(&owned));
                }
                PathKind::InsideDotGitCookie(name) => cookies.push(name),
                PathKind::InsideDotGit => {}
                PathKind::DotGit => {
                    if ev.flags.went_away() {
                        return false;
                    }
                }
            }
        }

        if !paths.is_empty() || !cookies.is_empty() {
            self.state.publish(paths, &cookies);
        }
        true
    }
}
