//! macOS watcher backed by FSEvents.
//!
//! A dedicated thread owns the event stream and its CFRunLoop; the callback
//! translates stream events and hands them over a channel. Stopping means
//! stopping the run loop, which lets the thread tear the stream down. The
//! bindings below are the minimal slice of CoreFoundation/CoreServices this
//! needs, declared by hand.

use std::ffi::CStr;
use std::ffi::c_void;
use std::io;
use std::os::raw::c_char;
use std::path::Path;
use std::path::PathBuf;
use std::sync::mpsc;
use std::thread::JoinHandle;

use log::warn;

use super::EventFlags;
use super::FsEvent;
use super::Notice;

#[allow(non_camel_case_types)]
type CFRef = *mut c_void;
#[allow(non_camel_case_types)]
type CFStringRef = CFRef;
#[allow(non_camel_case_types)]
type CFArrayRef = CFRef;
#[allow(non_camel_case_types)]
type CFRunLoopRef = CFRef;
#[allow(non_camel_case_types)]
type FSEventStreamRef = CFRef;

const K_CFSTRING_ENCODING_UTF8: u32 = 0x0800_0100;
const K_FSEVENT_STREAM_CREATE_FLAG_NO_DEFER: u32 = 0x0000_0002;
const K_FSEVENT_STREAM_CREATE_FLAG_FILE_EVENTS: u32 = 0x0000_0010;
const K_FSEVENT_STREAM_EVENT_ID_SINCE_NOW: u64 = u64::MAX;

const FLAG_MUST_SCAN_SUBDIRS: u32 = 0x0000_0001;
const FLAG_KERNEL_DROPPED: u32 = 0x0000_0004;
const FLAG_USER_DROPPED: u32 = 0x0000_0008;
const FLAG_ROOT_CHANGED: u32 = 0x0000_0020;
const FLAG_ITEM_CREATED: u32 = 0x0000_0100;
const FLAG_ITEM_REMOVED: u32 = 0x0000_0200;
const FLAG_ITEM_RENAMED: u32 = 0x0000_0800;
const FLAG_ITEM_MODIFIED: u32 = 0x0000_1000;
const FLAG_ITEM_INODE_META: u32 = 0x0000_0400;
const FLAG_ITEM_XATTR_MOD: u32 = 0x0000_8000;
const FLAG_ITEM_IS_DIR: u32 = 0x0002_0000;

#[repr(C)]
struct FSEventStreamContext {
    version: isize,
    info: *mut c_void,
    retain: *const c_void,
    release: *const c_void,
    copy_description: *const c_void,
}

type FSEventStreamCallback = extern "C" fn(
    stream: FSEventStreamRef,
    info: *mut c_void,
    num_events: usize,
    event_paths: *mut c_void,
    event_flags: *const u32,
    event_ids: *const u64,
);

#[link(name = "CoreFoundation", kind = "framework")]
#[link(name = "CoreServices", kind = "framework")]
unsafe extern "C" {
    fn CFStringCreateWithBytes(
        alloc: CFRef,
        bytes: *const u8,
        num_bytes: isize,
        encoding: u32,
        is_external: u8,
    ) -> CFStringRef;
    fn CFArrayCreate(
        alloc: CFRef,
        values: *const *const c_void,
        num_values: isize,
        callbacks: *const c_void,
    ) -> CFArrayRef;
    fn CFRelease(cf: CFRef);
    fn CFRunLoopGetCurrent() -> CFRunLoopRef;
    fn CFRunLoopRun();
    fn CFRunLoopStop(rl: CFRunLoopRef);
    static kCFRunLoopDefaultMode: CFStringRef;

    fn FSEventStreamCreate(
        alloc: CFRef,
        callback: FSEventStreamCallback,
        context: *const FSEventStreamContext,
        paths_to_watch: CFArrayRef,
        since_when: u64,
        latency: f64,
        flags: u32,
    ) -> FSEventStreamRef;
    fn FSEventStreamScheduleWithRunLoop(
        stream: FSEventStreamRef,
        run_loop: CFRunLoopRef,
        mode: CFStringRef,
    );
    fn FSEventStreamStart(stream: FSEventStreamRef) -> u8;
    fn FSEventStreamStop(stream: FSEventStreamRef);
    fn FSEventStreamInvalidate(stream: FSEventStreamRef);
    fn FSEventStreamRelease(stream: FSEventStreamRef);
}

/// Wakes a [`Watcher`] blocked in [`Watcher::next`]; cheap to clone.
#[derive(Debug, Clone)]
pub struct WatcherStop {
    run_loop: RunLoopHandle,
}

impl WatcherStop {
    /// Ask the watcher to deliver [`Notice::Stopped`].
    pub fn stop(&self) {
        unsafe { CFRunLoopStop(self.run_loop.0) };
    }
}

/// CFRunLoopRef is documented thread-safe for `CFRunLoopStop`.
#[derive(Debug, Clone, Copy)]
struct RunLoopHandle(CFRunLoopRef);
unsafe impl Send for RunLoopHandle {}
unsafe impl Sync for RunLoopHandle {}

struct CallbackState {
    tx: mpsc::Sender<Notice>,
}

/// FSEvents watcher over one worktree.
#[derive(Debug)]
pub struct Watcher {
    rx: mpsc::Receiver<Notice>,
    run_loop: RunLoopHandle,
    thread: Option<JoinHandle<()>>,
}

impl Watcher {
    /// Watch `root` and everything below it.
    pub fn new(root: &Path) -> io::Result<Watcher> {
        let (tx, rx) = mpsc::channel();
        let (ready_tx, ready_rx) = mpsc::channel();
        let root = root.to_path_buf();

        let thread = std::thread::Builder::new()
            .name("fsevents-stream".to_string())
            .spawn(move || stream_thread(root, tx, ready_tx))?;

        match ready_rx.recv() {
            Ok(Ok(run_loop)) => Ok(Watcher {
                rx,
                run_loop,
                thread: Some(thread),
            }),
            Ok(Err(err)) => {
                let _ = thread.join();
                Err(err)
            }
            Err(_) => {
                let _ = thread.join();
                Err(io::Error::other("fsevents stream thread died during setup"))
            }
        }
    }

    /// Handle for stopping the watcher from another thread.
    pub fn stop_handle(&self) -> WatcherStop {
        WatcherStop {
            run_loop: self.run_loop,
        }
    }

    /// Block for the next delivery.
    pub fn next(&mut self) -> io::Result<Notice> {
        match self.rx.recv() {
            Ok(notice) => Ok(notice),
            // Sender gone: the run loop was stopped and the stream released.
            Err(_) => Ok(Notice::Stopped),
        }
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        unsafe { CFRunLoopStop(self.run_loop.0) };
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn stream_thread(
    root: PathBuf,
    tx: mpsc::Sender<Notice>,
    ready_tx: mpsc::Sender<io::Result<RunLoopHandle>>,
) {
    let state = Box::new(CallbackState { tx });
    let path = root.as_os_str().as_encoded_bytes();

    unsafe {
        let cf_path = CFStringCreateWithBytes(
            std::ptr::null_mut(),
            path.as_ptr(),
            path.len() as isize,
            K_CFSTRING_ENCODING_UTF8,
            0,
        );
        if cf_path.is_null() {
            let _ = ready_tx.send(Err(io::Error::other("CFString allocation failed")));
            return;
        }
        let paths = CFArrayCreate(
            std::ptr::null_mut(),
            &(cf_path as *const c_void),
            1,
            std::ptr::null(),
        );

        let state_ptr = Box::into_raw(state);
        let context = FSEventStreamContext {
            version: 0,
            info: state_ptr.cast(),
            retain: std::ptr::null(),
            release: std::ptr::null(),
            copy_description: std::ptr::null(),
        };
        let stream = FSEventStreamCreate(
            std::ptr::null_mut(),
            stream_callback,
            &context,
            paths,
            K_FSEVENT_STREAM_EVENT_ID_SINCE_NOW,
            0.001,
            K_FSEVENT_STREAM_CREATE_FLAG_NO_DEFER | K_FSEVENT_STREAM_CREATE_FLAG_FILE_EVENTS,
        );
        CFRelease(paths);
        CFRelease(cf_path);
        if stream.is_null() {
            drop(Box::from_raw(state_ptr));
            let _ = ready_tx.send(Err(io::Error::other("FSEventStreamCreate failed")));
            return;
        }

        let run_loop = CFRunLoopGetCurrent();
        FSEventStreamScheduleWithRunLoop(stream, run_loop, kCFRunLoopDefaultMode);
        if FSEventStreamStart(stream) == 0 {
            FSEventStreamInvalidate(stream);
            FSEventStreamRelease(stream);
            drop(Box::from_raw(state_ptr));
            let _ = ready_tx.send(Err(io::Error::other("FSEventStreamStart failed")));
            return;
        }

        let _ = ready_tx.send(Ok(RunLoopHandle(run_loop)));
        CFRunLoopRun();

        FSEventStreamStop(stream);
        FSEventStreamInvalidate(stream);
        FSEventStreamRelease(stream);
        drop(Box::from_raw(state_ptr));
    }
}

extern "C" fn stream_callback(
    _stream: FSEventStreamRef,
    info: *mut c_void,
    num_events: usize,
    event_paths: *mut c_void,
    event_flags: *const u32,
    _event_ids: *const u64,
) {
    let state = unsafe { &*(info as *const CallbackState) };
    let paths = event_paths as *const *const c_char;

    let mut events = Vec::with_capacity(num_events);
    for i in 0..num_events {
        let flags_raw = unsafe { *event_flags.add(i) };

        if flags_raw & (FLAG_MUST_SCAN_SUBDIRS | FLAG_KERNEL_DROPPED | FLAG_USER_DROPPED) != 0 {
            warn!("fsevents dropped events (flags {flags_raw:#x})");
            let _ = state.tx.send(Notice::Overflow);
            return;
        }
        if flags_raw & FLAG_ROOT_CHANGED != 0 {
            // The watched root itself moved; treat like a drop.
            let _ = state.tx.send(Notice::Overflow);
            return;
        }

        let c_path = unsafe { CStr::from_ptr(*paths.add(i)) };
        let path = PathBuf::from(String::from_utf8_lossy(c_path.to_bytes()).into_owned());

        let mut flags = EventFlags::empty();
        if flags_raw & FLAG_ITEM_CREATED != 0 {
            flags |= EventFlags::CREATED;
        }
        if flags_raw & (FLAG_ITEM_MODIFIED | FLAG_ITEM_INODE_META | FLAG_ITEM_XATTR_MOD) != 0 {
            flags |= EventFlags::MODIFIED;
        }
        if flags_raw & FLAG_ITEM_REMOVED != 0 {
            flags |= EventFlags::DELETED;
        }
        if flags_raw & FLAG_ITEM_RENAMED != 0 {
            // FSEvents does not say which side of the rename this is; the
            // classifier treats either side of a `.git` rename as fatal, so
            // report both.
            flags |= EventFlags::RENAMED_FROM | EventFlags::RENAMED_TO;
        }
        if flags_raw & FLAG_ITEM_IS_DIR != 0 {
            flags |= EventFlags::IS_DIR;
        }
        if flags.is_empty() {
            continue;
        }
        events.push(FsEvent { path, flags });
    }

    if !events.is_empty() {
        let _ = state.tx.send(Notice::Events(events));
    }
}
