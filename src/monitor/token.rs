//! Tokens and change batches.
//!
//! A token names a point in one daemon session's event history:
//! `:internal:<session_id>:<seq_nr>`. Batches of changed paths hang off the
//! current session newest-first; a client query pins the head batch it
//! observed, and the answer to "what changed since token T" is the walk from
//! the current head down to T's sequence number.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use log::debug;

/// Prefix of every token this daemon mints.
pub const TOKEN_PREFIX: &str = ":internal:";

/// Most paths one head batch may accumulate before new events stop being
/// folded into it.
pub const COMBINE_LIMIT: usize = 1024;

/// Grace period batches stay reachable after the head they were observed
/// with, accommodating slow concurrent queries.
pub const TRUNCATE_DELAY_MS: u64 = 5 * 60 * 1000;

/// A client-presented token, parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    /// Fixed per daemon lifetime, reset on resync.
    pub session_id: String,
    /// Monotonically non-decreasing within a session.
    pub seq_nr: u64,
}

impl Token {
    /// Parse `:internal:<sid>:<seq>`. Anything else (V1 timestamps, garbage)
    /// is `None` and answered trivially.
    pub fn parse(raw: &str) -> Option<Token> {
        let rest = raw.strip_prefix(TOKEN_PREFIX)?;
        let (session_id, seq) = rest.rsplit_once(':')?;
        if session_id.is_empty() {
            return None;
        }
        Some(Token {
            session_id: session_id.to_string(),
            seq_nr: seq.parse().ok()?,
        })
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{TOKEN_PREFIX}{}:{}", self.session_id, self.seq_nr)
    }
}

/// Interned worktree paths. Batches share `Arc<str>` clones; the pool is the
/// sole owner of the backing storage.
#[derive(Debug, Default)]
pub struct PathPool {
    strings: HashSet<Arc<str>>,
}

impl PathPool {
    /// Intern one path string.
    pub fn intern(&mut self, path: &str) -> Arc<str> {
        if let Some(existing) = self.strings.get(path) {
            return Arc::clone(existing);
        }
        let owned: Arc<str> = Arc::from(path);
        self.strings.insert(Arc::clone(&owned));
        owned
    }

    /// Number of distinct interned strings; test hook.
    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.strings.len()
    }
}

/// One listener callback's worth of changed paths.
///
/// `pinned` is zero until some client observes the batch; from then on the
/// batch contents and sequence number are frozen.
#[derive(Debug)]
pub struct Batch {
    /// Position in the session; strictly decreasing from head to tail.
    pub seq_nr: u64,
    pinned: AtomicU64,
    /// Interned worktree-relative paths, directories carrying a `/` suffix.
    pub paths: Vec<Arc<str>>,
}

impl Batch {
    fn new(seq_nr: u64, paths: Vec<Arc<str>>) -> Self {
        Batch {
            seq_nr,
            pinned: AtomicU64::new(0),
            paths,
        }
    }

    /// Mark the batch observed at `now_ms` (milliseconds since daemon
    /// start; zero is reserved for "never observed").
    pub fn pin(&self, now_ms: u64) {
        self.pinned.store(now_ms.max(1), Ordering::Release);
    }

    /// Observation time, or zero when never observed.
    pub fn pinned(&self) -> u64 {
        self.pinned.load(Ordering::Acquire)
    }
}

/// Current-session state: the batch list plus reader bookkeeping.
///
/// Readers snapshot a prefix of `batches` under the daemon lock and walk it
/// without the lock; `Arc` keeps snapshotted batches alive across a
/// truncation or resync, so freeing old history is simply dropping the last
/// reference.
#[derive(Debug)]
pub struct TokenState {
    /// Fixed portion of every token this state answers with.
    pub session_id: String,
    /// Newest first.
    batches: Vec<Arc<Batch>>,
    /// Queries currently between pin and cleanup.
    pub client_ref_count: usize,
}

impl TokenState {
    /// Fresh state with no history.
    pub fn new(session_id: String) -> Self {
        TokenState {
            session_id,
            batches: Vec::new(),
            client_ref_count: 0,
        }
    }

    /// Newest batch, if any.
    pub fn head(&self) -> Option<&Arc<Batch>> {
        self.batches.first()
    }

    /// Oldest reachable sequence number.
    pub fn tail_seq(&self) -> Option<u64> {
        self.batches.last().map(|b| b.seq_nr)
    }

    /// Sequence number a response token carries: one past the head.
    pub fn response_seq(&self) -> u64 {
        self.head().map_or(0, |b| b.seq_nr + 1)
    }

    /// Install one batch of freshly observed paths.
    ///
    /// An unpinned head that stays under [`COMBINE_LIMIT`] absorbs the new
    /// paths in place; a pinned or oversized head gets a new batch prepended
    /// with the next sequence number.
    pub fn publish(&mut self, paths: Vec<Arc<str>>) {
        if paths.is_empty() {
            return;
        }
        match self.batches.first_mut() {
            None => self.batches.push(Arc::new(Batch::new(0, paths))),
            Some(head) => {
                let fold = head.pinned() == 0 && head.paths.len() + paths.len() <= COMBINE_LIMIT;
                if fold {
                    // An unpinned head has no reader references, so unique
                    // access must succeed; a pinned head falls through to a
                    // prepend.
                    if let Some(head) = Arc::get_mut(head) {
                        head.paths.extend(paths);
                        return;
                    }
                    debug!("head batch unexpectedly shared, prepending instead");
                }
                let seq_nr = self.batches[0].seq_nr + 1;
                self.batches.insert(0, Arc::new(Batch::new(seq_nr, paths)));
            }
        }
    }

    /// Snapshot the whole reachable batch list, newest first.
    pub fn snapshot(&self) -> Vec<Arc<Batch>> {
        self.batches.clone()
    }

    /// Drop history too old to matter: starting from the batch a finished
    /// reader pinned, keep everything younger than the grace period and
    /// free the rest.
    pub fn truncate(&mut self, head_seq: u64) {
        let Some(head_idx) = self.batches.iter().position(|b| b.seq_nr == head_seq) else {
            return;
        };
        let head_pinned = self.batches[head_idx].pinned();
        if head_pinned == 0 {
            return;
        }
        let cutoff = self.batches[head_idx..].iter().position(|b| {
            let pinned = b.pinned();
            pinned != 0 && pinned + TRUNCATE_DELAY_MS <= head_pinned
        });
        if let Some(rel) = cutoff {
            self.batches.truncate(head_idx + rel + 1);
        }
    }

    /// Number of reachable batches; test hook.
    pub fn batch_count(&self) -> usize {
        self.batches.len()
    }
}

/// Mint a session id: unique per daemon lifetime and after every resync.
///
/// With `GIT_TEST_FSMONITOR_TOKEN` set the ids come from a deterministic
/// process-global sequence instead, so tests can predict them.
pub fn new_session_id() -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let nr = COUNTER.fetch_add(1, Ordering::Relaxed);

    if std::env::var_os("GIT_TEST_FSMONITOR_TOKEN").is_some() {
        return format!("test_{nr:08}");
    }

    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |d| d.as_nanos() as u64);
    format!("{}-{}-{nr}", now, std::process::id())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn interned(pool: &mut PathPool, paths: &[&str]) -> Vec<Arc<str>> {
        paths.iter().map(|p| pool.intern(p)).collect()
    }

    #[test]
    fn token_parse_and_format() {
        let token = Token::parse(":internal:abc-123:42").unwrap();
        assert_eq!(token.session_id, "abc-123");
        assert_eq!(token.seq_nr, 42);
        assert_eq!(token.to_string(), ":internal:abc-123:42");

        // Session ids may themselves contain colons.
        let token = Token::parse(":internal:17:99:3").unwrap();
        assert_eq!(token.session_id, "17:99");
        assert_eq!(token.seq_nr, 3);

        assert!(Token::parse("1234567890").is_none());
        assert!(Token::parse(":internal:").is_none());
        assert!(Token::parse(":internal:sid:notanumber").is_none());
    }

    #[test]
    fn intern_dedupes() {
        let mut pool = PathPool::default();
        let a = pool.intern("src/lib.rs");
        let b = pool.intern("src/lib.rs");
        assert!(Arc::ptr_eq(&a, &b));
        pool.intern("other");
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn publish_folds_into_unpinned_head() {
        let mut pool = PathPool::default();
        let mut state = TokenState::new("s".to_string());
        state.publish(interned(&mut pool, &["a"]));
        state.publish(interned(&mut pool, &["b", "c"]));

        assert_eq!(state.batch_count(), 1);
        let head = state.head().unwrap();
        assert_eq!(head.seq_nr, 0);
        assert_eq!(head.paths.len(), 3);
        assert_eq!(state.response_seq(), 1);
    }

    #[test]
    fn publish_prepends_after_pin() {
        let mut pool = PathPool::default();
        let mut state = TokenState::new("s".to_string());
        state.publish(interned(&mut pool, &["a"]));
        state.head().unwrap().pin(10);

        state.publish(interned(&mut pool, &["b"]));
        assert_eq!(state.batch_count(), 2);
        assert_eq!(state.head().unwrap().seq_nr, 1);
        assert_eq!(state.tail_seq(), Some(0));
        assert_eq!(state.response_seq(), 2);

        // The pinned batch is immutable: its paths did not grow.
        assert_eq!(state.snapshot()[1].paths.len(), 1);
    }

    #[test]
    fn publish_prepends_past_combine_limit() {
        let mut pool = PathPool::default();
        let mut state = TokenState::new("s".to_string());
        let big: Vec<Arc<str>> = (0..COMBINE_LIMIT)
            .map(|i| pool.intern(&format!("f{i}")))
            .collect();
        state.publish(big);
        state.publish(interned(&mut pool, &["straw"]));

        assert_eq!(state.batch_count(), 2);
        assert_eq!(state.head().unwrap().paths.len(), 1);
    }

    #[test]
    fn snapshot_survives_truncation() {
        let mut pool = PathPool::default();
        let mut state = TokenState::new("s".to_string());
        state.publish(interned(&mut pool, &["oldest"]));
        state.head().unwrap().pin(5);
        state.publish(interned(&mut pool, &["old"]));
        state.head().unwrap().pin(10);
        state.publish(interned(&mut pool, &["new"]));

        let snapshot = state.snapshot();
        state.head().unwrap().pin(10 + TRUNCATE_DELAY_MS);
        state.truncate(2);

        // "old" becomes the tail; "oldest" is freed from the state.
        assert_eq!(state.batch_count(), 2);
        assert_eq!(state.tail_seq(), Some(1));
        // The reader's snapshot still sees all three batches.
        assert_eq!(snapshot.len(), 3);
        assert_eq!(snapshot[2].paths[0].as_ref(), "oldest");
    }

    #[test]
    fn truncate_respects_grace_period() {
        let mut pool = PathPool::default();
        let mut state = TokenState::new("s".to_string());
        state.publish(interned(&mut pool, &["a"]));
        state.head().unwrap().pin(1000);
        state.publish(interned(&mut pool, &["b"]));
        state.head().unwrap().pin(1500);

        // Within the grace period nothing is freed.
        state.truncate(1);
        assert_eq!(state.batch_count(), 2);

        state.publish(interned(&mut pool, &["c"]));
        state.head().unwrap().pin(1500 + TRUNCATE_DELAY_MS);
        state.truncate(2);
        assert_eq!(state.batch_count(), 2);
        assert_eq!(state.tail_seq(), Some(1));
    }

    #[test]
    fn seq_numbers_decrease_from_head_to_tail() {
        let mut pool = PathPool::default();
        let mut state = TokenState::new("s".to_string());
        for i in 0..5 {
            state.publish(interned(&mut pool, &[&format!("p{i}")]));
            state.head().unwrap().pin(10 + i);
        }
        let snapshot = state.snapshot();
        for pair in snapshot.windows(2) {
            assert!(pair[0].seq_nr > pair[1].seq_nr);
        }
    }

    #[test]
    fn test_token_env_gives_deterministic_prefix() {
        // Not exercising the env var itself (process-global); the plain
        // path must still be unique per call.
        assert_ne!(new_session_id(), new_session_id());
    }
}
