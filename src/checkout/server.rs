//! Helper-side item queue and thread pool.
//!
//! One [`ItemServer`] owns the ordered item vector for a helper process plus
//! the threads that advance items through their state machine: a single
//! preload thread reading blobs into a bounded in-memory window, and a pool
//! of writer threads smudging and writing them to disk. All shared state
//! lives behind one mutex with three condition variables:
//!
//! - `preload_cv`: the preload thread sleeps here while the window is full
//!   or the vector is exhausted;
//! - `writer_cv`: writers sleep here while nothing is loaded or authorized;
//! - `done_cv`: `wait_done` callers sleep here for a specific item.

use std::sync::Arc;
use std::thread;
use std::thread::JoinHandle;

use log::debug;
use log::warn;
use parking_lot::Condvar;
use parking_lot::Mutex;

use crate::convert::Converter;
use crate::odb::ObjectKind;
use crate::odb::ObjectStore;

use super::item::ErrorClass;
use super::item::Item;
use super::item::ItemResult;
use super::item::ItemState;
use super::item::Watermark;
use super::write::populate_file;

/// Tuning for one helper's server context.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Maximum items whose blobs may be resident at once.
    pub preload_limit: usize,
    /// Writer pool size.
    pub writers: usize,
    /// Start with the watermark at [`Watermark::Auto`].
    pub start_auto: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            preload_limit: 16,
            writers: 2,
            start_auto: false,
        }
    }
}

/// Appending an item whose `helper_nr` does not equal the vector length is a
/// caller bug; the protocol layer treats it as fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotMismatch {
    /// The `helper_nr` the record claimed.
    pub claimed: u32,
    /// The slot the vector would actually assign.
    pub expected: usize,
}

/// A finished item, as handed to the protocol layer.
#[derive(Debug, Clone, Copy)]
pub struct ItemDone {
    /// Position in the foreground's eligible-items vector.
    pub pc_nr: u32,
    /// Position inside this helper's item vector.
    pub helper_nr: u32,
    /// The recorded outcome.
    pub result: ItemResult,
}

struct State {
    items: Vec<Item>,
    /// `[window_end - window_count, window_end)` holds loaded blobs.
    window_end: usize,
    window_count: usize,
    authorized: Watermark,
    completed: usize,
    shutdown: bool,
}

struct Shared {
    state: Mutex<State>,
    preload_cv: Condvar,
    writer_cv: Condvar,
    done_cv: Condvar,
    preload_limit: usize,
}

/// Server context for one helper process.
pub struct ItemServer {
    shared: Arc<Shared>,
    preload: Option<JoinHandle<()>>,
    writers: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for ItemServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("ItemServer")
            .field("items", &state.items.len())
            .field("completed", &state.completed)
            .field("authorized", &state.authorized)
            .finish()
    }
}

impl ItemServer {
    /// Spawn the preload thread and writer pool.
    pub fn spawn<S, C>(config: ServerConfig, store: Arc<S>, convert: Arc<C>) -> std::io::Result<Self>
    where
        S: ObjectStore + 'static,
        C: Converter + 'static,
    {
        assert!(config.preload_limit > 0, "preload window must hold at least one item");
        assert!(config.writers > 0, "writer pool must hold at least one thread");

        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                items: Vec::new(),
                window_end: 0,
                window_count: 0,
                authorized: if config.start_auto {
                    Watermark::Auto
                } else {
                    Watermark::At(0)
                },
                completed: 0,
                shutdown: false,
            }),
            preload_cv: Condvar::new(),
            writer_cv: Condvar::new(),
            done_cv: Condvar::new(),
            preload_limit: config.preload_limit,
        });

        let preload = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name("checkout-preload".to_string())
                .spawn(move || preload_main(&shared, &*store))?
        };

        let mut writers = Vec::with_capacity(config.writers);
        for idx in 0..config.writers {
            let shared = Arc::clone(&shared);
            let convert = Arc::clone(&convert);
            writers.push(
                thread::Builder::new()
                    .name(format!("checkout-writer-{idx}"))
                    .spawn(move || writer_main(&shared, &*convert))?,
            );
        }

        Ok(ItemServer {
            shared,
            preload: Some(preload),
            writers,
        })
    }

    /// Append one item. The record's `helper_nr` must equal the slot it will
    /// occupy; anything else is a protocol-layer bug.
    pub fn enqueue(&self, mut item: Item) -> Result<(), SlotMismatch> {
        let mut state = self.shared.state.lock();
        let expected = state.items.len();
        if item.helper_nr as usize != expected {
            return Err(SlotMismatch {
                claimed: item.helper_nr,
                expected,
            });
        }
        item.advance(ItemState::Queued);
        state.items.push(item);
        let window_open = state.window_count < self.shared.preload_limit;
        drop(state);
        if window_open {
            self.shared.preload_cv.notify_one();
        }
        Ok(())
    }

    /// Widen the authorization watermark. `Auto` is sticky; bounded values
    /// only grow.
    pub fn authorize(&self, end: Watermark) {
        let mut state = self.shared.state.lock();
        let delta = state.authorized.widen(end);
        drop(state);
        match delta {
            0 => {}
            1 => {
                self.shared.writer_cv.notify_one();
            }
            _ => {
                self.shared.writer_cv.notify_all();
            }
        }
    }

    /// Block until item `helper_nr` is done and return its result, or `None`
    /// when the slot does not exist.
    pub fn wait_done(&self, helper_nr: usize) -> Option<ItemDone> {
        let mut state = self.shared.state.lock();
        if helper_nr >= state.items.len() {
            return None;
        }
        while state.items[helper_nr].state() != ItemState::Done {
            if state.shutdown {
                return None;
            }
            self.shared.done_cv.wait(&mut state);
        }
        let item = &state.items[helper_nr];
        Some(ItemDone {
            pc_nr: item.pc_nr,
            helper_nr: item.helper_nr,
            result: item.result,
        })
    }

    /// Number of items whose results have been recorded; test hook.
    pub fn completed(&self) -> usize {
        self.shared.state.lock().completed
    }

    /// Number of queued items; test hook.
    pub fn len(&self) -> usize {
        self.shared.state.lock().items.len()
    }

    /// Whether no items were ever queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cooperative shutdown: flag, wake both worker cvs, join all threads.
    pub fn shutdown(mut self) {
        self.begin_shutdown();
        if let Some(preload) = self.preload.take() {
            let _ = preload.join();
        }
        for writer in self.writers.drain(..) {
            let _ = writer.join();
        }
    }

    fn begin_shutdown(&self) {
        let mut state = self.shared.state.lock();
        state.shutdown = true;
        drop(state);
        self.shared.preload_cv.notify_one();
        self.shared.writer_cv.notify_all();
        self.shared.done_cv.notify_all();
    }
}

impl Drop for ItemServer {
    fn drop(&mut self) {
        self.begin_shutdown();
        if let Some(preload) = self.preload.take() {
            let _ = preload.join();
        }
        for writer in self.writers.drain(..) {
            let _ = writer.join();
        }
    }
}

fn preload_main<S: ObjectStore + ?Sized>(shared: &Shared, store: &S) {
    let mut state = shared.state.lock();
    loop {
        if state.shutdown {
            return;
        }
        if state.window_end >= state.items.len() || state.window_count >= shared.preload_limit {
            shared.preload_cv.wait(&mut state);
            continue;
        }

        let nr = state.window_end;
        state.items[nr].advance(ItemState::Loading);
        let oid = state.items[nr].oid;
        drop(state);

        let loaded = store.read_object(&oid);

        state = shared.state.lock();
        let item = &mut state.items[nr];
        match loaded {
            Ok(obj) if obj.kind == ObjectKind::Blob => {
                item.content = Some(obj.data);
            }
            Ok(_) => {
                warn!("object {} is not a blob", oid);
                item.result = ItemResult::error(ErrorClass::Load, libc::EINVAL);
            }
            Err(err) => {
                debug!("load of {} failed: {}", oid, err);
                item.result = ItemResult::error(
                    ErrorClass::Load,
                    err.raw_os_error().unwrap_or(libc::EIO),
                );
            }
        }
        item.advance(ItemState::Loaded);
        state.window_end += 1;
        state.window_count += 1;
        shared.writer_cv.notify_one();
    }
}

fn writer_main<C: Converter + ?Sized>(shared: &Shared, convert: &C) {
    let mut state = shared.state.lock();
    loop {
        if state.shutdown {
            return;
        }
        if state.window_count == 0 {
            shared.writer_cv.wait(&mut state);
            continue;
        }
        // Writers always claim the oldest loaded item, so per-helper write
        // order matches enqueue order.
        let nr = state.window_end - state.window_count;
        if !state.authorized.allows(nr) {
            shared.writer_cv.wait(&mut state);
            continue;
        }

        state.window_count -= 1;
        shared.preload_cv.notify_one();

        let item = &mut state.items[nr];
        item.advance(ItemState::Writing);
        let content = item.content.take();
        let load_failure = item.result;
        let path = item.path.clone();
        let exec_bit = item.wants_exec_bit();
        let attrs = item.attrs.clone();
        drop(state);

        let result = match content {
            Some(bytes) => populate_file(&path, exec_bit, &attrs, &bytes, convert),
            // The preload step already recorded a load error; carry it.
            None => load_failure,
        };

        state = shared.state.lock();
        let item = &mut state.items[nr];
        item.result = result;
        item.advance(ItemState::Done);
        state.completed += 1;
        shared.done_cv.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convert::ConvertAttrs;
    use crate::convert::DefaultConverter;
    use crate::odb::BlobDir;
    use crate::odb::ObjectId;
    use std::path::Path;
    use std::path::PathBuf;
    use std::time::Duration;

    fn oid(n: u8) -> ObjectId {
        ObjectId::from_hex(&format!("{n:02x}").repeat(20)).unwrap()
    }

    fn fixture(items: usize) -> (tempfile::TempDir, Arc<BlobDir>, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobDir::new(dir.path().join("odb"));
        for n in 0..items {
            store.insert(&oid(n as u8), format!("blob {n}\n").as_bytes()).unwrap();
        }
        let worktree = dir.path().join("wt");
        std::fs::create_dir(&worktree).unwrap();
        (dir, Arc::new(store), worktree)
    }

    fn queue_items(server: &ItemServer, worktree: &Path, count: usize) {
        for n in 0..count {
            let item = Item::new(
                n as u32,
                n as u32,
                oid(n as u8),
                0o100644,
                worktree.join(format!("file-{n}")),
                ConvertAttrs::default(),
            );
            server.enqueue(item).unwrap();
        }
    }

    #[test]
    fn drains_in_enqueue_order_with_saturated_window() {
        let (_dir, store, worktree) = fixture(10);
        let config = ServerConfig {
            preload_limit: 2,
            writers: 1,
            start_auto: true,
        };
        let server = ItemServer::spawn(config, store, Arc::new(DefaultConverter)).unwrap();
        queue_items(&server, &worktree, 10);

        for n in 0..10 {
            let done = server.wait_done(n).unwrap();
            assert_eq!(done.helper_nr, n as u32);
            assert_eq!(done.result.class, ErrorClass::Ok);
        }
        assert_eq!(server.completed(), 10);
        for n in 0..10 {
            let body = std::fs::read(worktree.join(format!("file-{n}"))).unwrap();
            assert_eq!(body, format!("blob {n}\n").as_bytes());
        }
        server.shutdown();
    }

    #[test]
    fn writers_hold_back_until_authorized() {
        let (_dir, store, worktree) = fixture(2);
        let server =
            ItemServer::spawn(ServerConfig::default(), store, Arc::new(DefaultConverter)).unwrap();
        queue_items(&server, &worktree, 2);

        // Nothing is authorized yet; give the threads a moment to prove they
        // do not write ahead of the watermark.
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(server.completed(), 0);
        assert!(!worktree.join("file-0").exists());

        server.authorize(Watermark::At(1));
        let done = server.wait_done(0).unwrap();
        assert_eq!(done.result.class, ErrorClass::Ok);
        assert!(worktree.join("file-0").exists());

        server.authorize(Watermark::Auto);
        let done = server.wait_done(1).unwrap();
        assert_eq!(done.result.class, ErrorClass::Ok);
        server.shutdown();
    }

    #[test]
    fn load_errors_are_carried_not_fatal() {
        let (_dir, store, worktree) = fixture(1);
        let server = ItemServer::spawn(
            ServerConfig {
                start_auto: true,
                ..ServerConfig::default()
            },
            store,
            Arc::new(DefaultConverter),
        )
        .unwrap();

        // Slot 0 references a blob the store does not have.
        let missing = Item::new(
            0,
            0,
            ObjectId::from_hex(&"ee".repeat(20)).unwrap(),
            0o100644,
            worktree.join("missing"),
            ConvertAttrs::default(),
        );
        server.enqueue(missing).unwrap();
        let good = Item::new(
            1,
            1,
            oid(0),
            0o100644,
            worktree.join("good"),
            ConvertAttrs::default(),
        );
        server.enqueue(good).unwrap();

        let done = server.wait_done(0).unwrap();
        assert_eq!(done.result.class, ErrorClass::Load);
        assert!(!worktree.join("missing").exists());

        let done = server.wait_done(1).unwrap();
        assert_eq!(done.result.class, ErrorClass::Ok);
        server.shutdown();
    }

    #[test]
    fn enqueue_rejects_slot_mismatch() {
        let (_dir, store, worktree) = fixture(1);
        let server = ItemServer::spawn(
            ServerConfig::default(),
            store,
            Arc::new(DefaultConverter),
        )
        .unwrap();

        let item = Item::new(
            0,
            3,
            oid(0),
            0o100644,
            worktree.join("x"),
            ConvertAttrs::default(),
        );
        assert_eq!(
            server.enqueue(item),
            Err(SlotMismatch {
                claimed: 3,
                expected: 0
            })
        );
        server.shutdown();
    }

    #[test]
    fn wait_done_on_missing_slot_returns_none() {
        let (_dir, store, _worktree) = fixture(0);
        let server = ItemServer::spawn(
            ServerConfig::default(),
            store,
            Arc::new(DefaultConverter),
        )
        .unwrap();
        assert!(server.wait_done(0).is_none());
        server.shutdown();
    }
}
