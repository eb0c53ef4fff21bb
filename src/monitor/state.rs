//! Daemon shared state.
//!
//! One mutex guards the current token (with its batch list) and the pending
//! cookie map; `cookies_cv` wakes query threads when the listener resolves a
//! cookie or a resync aborts it. The listener keeps its scratch batch
//! outside the lock and merges it in through [`MonitorState::publish`].

use std::fs::File;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;
use std::time::Instant;

use log::debug;
use log::info;
use log::warn;
use parking_lot::Condvar;
use parking_lot::Mutex;
use parking_lot::MutexGuard;

use super::cookie::CookieJar;
use super::cookie::CookieResult;
use super::token::TokenState;
use super::token::new_session_id;

/// File-name prefix of cookies inside the metadata directory.
pub const COOKIE_PREFIX: &str = "fsmonitor-cookie-";

/// Upper bound on one cookie wait. The listener has no sweep of its own
/// (yet), so a cookie whose events were lost must not hang its client.
const COOKIE_TIMEOUT: Duration = Duration::from_secs(15);

/// Everything the daemon lock guards.
#[derive(Debug)]
pub(crate) struct Shared {
    /// Current session and its batch history.
    pub(crate) token: TokenState,
    /// Sessions replaced by a resync while a pinned reader was still
    /// walking them; each is freed by its last reader.
    pub(crate) retired: Vec<TokenState>,
    /// Pending synchronization cookies.
    pub(crate) cookies: CookieJar,
}

/// Shared state of one fsmonitor daemon.
#[derive(Debug)]
pub struct MonitorState {
    shared: Mutex<Shared>,
    cookies_cv: Condvar,
    start: Instant,
    cookie_seq: AtomicU64,
}

impl Default for MonitorState {
    fn default() -> Self {
        Self::new()
    }
}

impl MonitorState {
    /// Fresh state with a newly minted session.
    pub fn new() -> Self {
        let session = new_session_id();
        info!("fsmonitor session {session}");
        MonitorState {
            shared: Mutex::new(Shared {
                token: TokenState::new(session),
                retired: Vec::new(),
                cookies: CookieJar::default(),
            }),
            cookies_cv: Condvar::new(),
            start: Instant::now(),
            cookie_seq: AtomicU64::new(0),
        }
    }

    /// Milliseconds since daemon start; never zero, so it can double as a
    /// batch pin time.
    pub fn now_ms(&self) -> u64 {
        (self.start.elapsed().as_millis() as u64).max(1)
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock()
    }

    /// Current session id; test hook.
    pub fn session_id(&self) -> String {
        self.lock().token.session_id.clone()
    }

    /// Merge one listener delivery: worktree paths become (part of) the head
    /// batch, observed cookie names resolve their waiters.
    pub fn publish(&self, paths: Vec<Arc<str>>, cookie_names: &[String]) {
        let mut shared = self.lock();
        shared.token.publish(paths);
        let mut resolved = false;
        for name in cookie_names {
            resolved |= shared.cookies.mark_seen(name);
        }
        drop(shared);
        if resolved {
            self.cookies_cv.notify_all();
        }
    }

    /// Start a fresh session: every pending cookie is aborted and the old
    /// token is freed right away when nobody holds it, or parked on the
    /// retired list for its last reader to free. Returns the new session id.
    pub fn force_resync(&self) -> String {
        let session = new_session_id();
        let mut shared = self.lock();
        shared.cookies.abort_all();
        let old = std::mem::replace(&mut shared.token, TokenState::new(session.clone()));
        let old_session = old.session_id.clone();
        let dropped = old.batch_count();
        if old.client_ref_count > 0 {
            shared.retired.push(old);
        }
        drop(shared);
        self.cookies_cv.notify_all();
        info!("forced resync: session {old_session} -> {session} ({dropped} batches dropped)");
        session
    }

    /// Release one reader's pin on the session named by `sid`.
    ///
    /// The last reader out of the current session prunes its history from
    /// the head it pinned; the last reader out of a retired session frees
    /// it. The counter always belongs to the token instance that was
    /// pinned, never to whatever happens to be current.
    pub(crate) fn finish_query(&self, sid: &str, head_seq: u64) {
        let mut shared = self.lock();
        if shared.token.session_id == sid {
            debug_assert!(shared.token.client_ref_count > 0, "unbalanced reader pin");
            shared.token.client_ref_count -= 1;
            if shared.token.client_ref_count == 0 {
                shared.token.truncate(head_seq);
            }
            return;
        }
        if let Some(idx) = shared
            .retired
            .iter()
            .position(|token| token.session_id == sid)
        {
            debug_assert!(
                shared.retired[idx].client_ref_count > 0,
                "unbalanced reader pin"
            );
            shared.retired[idx].client_ref_count -= 1;
            if shared.retired[idx].client_ref_count == 0 {
                shared.retired.swap_remove(idx);
            }
        }
    }

    /// Synchronize with the listener by touching a cookie file in `git_dir`
    /// and waiting for the listener to observe it.
    ///
    /// The cookie is registered before the file exists so the listener can
    /// never observe an unregistered name.
    pub fn sync_with_listener(&self, git_dir: &Path) -> CookieResult {
        let name = format!(
            "{COOKIE_PREFIX}{}-{}",
            std::process::id(),
            self.cookie_seq.fetch_add(1, Ordering::Relaxed)
        );
        let path = git_dir.join(&name);

        self.lock().cookies.register(&name);

        let created = File::create(&path).map(drop);
        match created {
            Ok(()) => {
                // The creation event is already queued with the kernel; the
                // file itself has served its purpose.
                let _ = std::fs::remove_file(&path);
            }
            Err(err) => {
                warn!("cookie {} could not be created: {err}", path.display());
                self.lock().cookies.mark_error(&name);
            }
        }

        let mut shared = self.lock();
        let deadline = Instant::now() + COOKIE_TIMEOUT;
        loop {
            match shared.cookies.result(&name) {
                Some(CookieResult::Init) => {}
                Some(result) => {
                    shared.cookies.remove(&name);
                    return result;
                }
                None => return CookieResult::Error,
            }
            let timeout = deadline.saturating_duration_since(Instant::now());
            if timeout.is_zero()
                || self
                    .cookies_cv
                    .wait_for(&mut shared, timeout)
                    .timed_out()
            {
                debug!("cookie {name} timed out");
                shared.cookies.remove(&name);
                return CookieResult::Error;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn publish_resolves_matching_cookies() {
        let state = Arc::new(MonitorState::new());
        let dir = tempfile::tempdir().unwrap();

        let waiter = {
            let state = Arc::clone(&state);
            let git_dir = dir.path().to_path_buf();
            thread::spawn(move || state.sync_with_listener(&git_dir))
        };

        // Poll for the cookie the waiter registered and echo it back the
        // way the listener would.
        let seen = loop {
            if let Some(name) = state.lock().cookies.names().next().cloned() {
                break name;
            }
            thread::sleep(Duration::from_millis(5));
        };
        state.publish(Vec::new(), &[seen]);

        assert_eq!(waiter.join().unwrap(), CookieResult::Seen);
        assert!(state.lock().cookies.is_empty());
    }

    #[test]
    fn resync_aborts_pending_cookies() {
        let state = Arc::new(MonitorState::new());
        let dir = tempfile::tempdir().unwrap();
        let before = state.session_id();

        let waiter = {
            let state = Arc::clone(&state);
            let git_dir = dir.path().to_path_buf();
            thread::spawn(move || state.sync_with_listener(&git_dir))
        };
        while state.lock().cookies.is_empty() {
            thread::sleep(Duration::from_millis(5));
        }

        let after = state.force_resync();
        assert_ne!(before, after);
        assert_eq!(state.session_id(), after);
        assert_eq!(waiter.join().unwrap(), CookieResult::Abort);
    }

    #[test]
    fn cookie_creation_failure_yields_error() {
        let state = MonitorState::new();
        // A git dir that does not exist: creation must fail.
        let result = state.sync_with_listener(Path::new("/nonexistent/gone"));
        assert_eq!(result, CookieResult::Error);
    }

    /// Pin the current head the way a query's phase 3 does; returns the
    /// session id and pinned head sequence number.
    fn pin_reader(state: &MonitorState) -> (String, u64) {
        let mut shared = state.lock();
        let head = shared.token.head().cloned().expect("a published batch");
        head.pin(state.now_ms());
        shared.token.client_ref_count += 1;
        (shared.token.session_id.clone(), head.seq_nr)
    }

    #[test]
    fn resync_frees_unobserved_history_immediately() {
        let state = MonitorState::new();
        state.publish(vec![Arc::from("a")], &[]);

        state.force_resync();
        assert!(state.lock().retired.is_empty());
    }

    #[test]
    fn resync_parks_pinned_history_for_its_last_reader() {
        let state = MonitorState::new();
        state.publish(vec![Arc::from("a")], &[]);
        let (sid, head_seq) = pin_reader(&state);

        state.force_resync();
        {
            let shared = state.lock();
            assert_eq!(shared.retired.len(), 1);
            assert_eq!(shared.retired[0].session_id, sid);
            assert_eq!(shared.retired[0].client_ref_count, 1);
            // The fresh session starts with no readers.
            assert_eq!(shared.token.client_ref_count, 0);
        }

        // The in-flight reader finishing must resolve the retired instance,
        // not the current one.
        state.finish_query(&sid, head_seq);
        let shared = state.lock();
        assert!(shared.retired.is_empty());
        assert_eq!(shared.token.client_ref_count, 0);
    }

    #[test]
    fn finish_query_on_the_current_session_prunes_in_place() {
        let state = MonitorState::new();
        state.publish(vec![Arc::from("a")], &[]);
        let (sid, head_seq) = pin_reader(&state);

        state.finish_query(&sid, head_seq);
        let shared = state.lock();
        assert_eq!(shared.token.client_ref_count, 0);
        assert_eq!(shared.token.session_id, sid);
        assert_eq!(shared.token.batch_count(), 1);
    }

    #[test]
    fn overlapping_readers_across_a_resync_stay_balanced() {
        let state = MonitorState::new();
        state.publish(vec![Arc::from("a")], &[]);
        let (old_sid, old_head) = pin_reader(&state);

        state.force_resync();
        state.publish(vec![Arc::from("b")], &[]);
        let (new_sid, new_head) = pin_reader(&state);
        assert_ne!(old_sid, new_sid);

        // Readers resolve in either order without touching each other.
        state.finish_query(&new_sid, new_head);
        assert_eq!(state.lock().retired.len(), 1);
        state.finish_query(&old_sid, old_head);

        let shared = state.lock();
        assert!(shared.retired.is_empty());
        assert_eq!(shared.token.client_ref_count, 0);
        assert_eq!(shared.token.batch_count(), 1);
    }
}
