//! Windows watcher backed by `ReadDirectoryChangesW`.
//!
//! One overlapped read is kept in flight against the worktree handle; the
//! completion event and a manual stop event are waited on together. Windows
//! also provides the wait-for-idle primitive the query path can use instead
//! of a cookie file: [`IdleWaiter`] resolves once the read loop has drained
//! everything queued before the call.

use std::io;
use std::os::windows::ffi::OsStrExt;
use std::os::windows::ffi::OsStringExt;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use log::warn;
use parking_lot::Condvar;
use parking_lot::Mutex;

use windows_sys::Win32::Foundation::CloseHandle;
use windows_sys::Win32::Foundation::ERROR_NOTIFY_ENUM_DIR;
use windows_sys::Win32::Foundation::GetLastError;
use windows_sys::Win32::Foundation::HANDLE;
use windows_sys::Win32::Foundation::INVALID_HANDLE_VALUE;
use windows_sys::Win32::Foundation::WAIT_OBJECT_0;
use windows_sys::Win32::Storage::FileSystem::CreateFileW;
use windows_sys::Win32::Storage::FileSystem::FILE_ACTION_ADDED;
use windows_sys::Win32::Storage::FileSystem::FILE_ACTION_MODIFIED;
use windows_sys::Win32::Storage::FileSystem::FILE_ACTION_REMOVED;
use windows_sys::Win32::Storage::FileSystem::FILE_ACTION_RENAMED_NEW_NAME;
use windows_sys::Win32::Storage::FileSystem::FILE_ACTION_RENAMED_OLD_NAME;
use windows_sys::Win32::Storage::FileSystem::FILE_FLAG_BACKUP_SEMANTICS;
use windows_sys::Win32::Storage::FileSystem::FILE_FLAG_OVERLAPPED;
use windows_sys::Win32::Storage::FileSystem::FILE_LIST_DIRECTORY;
use windows_sys::Win32::Storage::FileSystem::FILE_NOTIFY_CHANGE_ATTRIBUTES;
use windows_sys::Win32::Storage::FileSystem::FILE_NOTIFY_CHANGE_CREATION;
use windows_sys::Win32::Storage::FileSystem::FILE_NOTIFY_CHANGE_DIR_NAME;
use windows_sys::Win32::Storage::FileSystem::FILE_NOTIFY_CHANGE_FILE_NAME;
use windows_sys::Win32::Storage::FileSystem::FILE_NOTIFY_CHANGE_LAST_WRITE;
use windows_sys::Win32::Storage::FileSystem::FILE_NOTIFY_CHANGE_SIZE;
use windows_sys::Win32::Storage::FileSystem::FILE_NOTIFY_INFORMATION;
use windows_sys::Win32::Storage::FileSystem::FILE_SHARE_DELETE;
use windows_sys::Win32::Storage::FileSystem::FILE_SHARE_READ;
use windows_sys::Win32::Storage::FileSystem::FILE_SHARE_WRITE;
use windows_sys::Win32::Storage::FileSystem::OPEN_EXISTING;
use windows_sys::Win32::Storage::FileSystem::ReadDirectoryChangesW;
use windows_sys::Win32::System::IO::GetOverlappedResult;
use windows_sys::Win32::System::IO::OVERLAPPED;
use windows_sys::Win32::System::Threading::CreateEventW;
use windows_sys::Win32::System::Threading::INFINITE;
use windows_sys::Win32::System::Threading::SetEvent;
use windows_sys::Win32::System::Threading::WaitForMultipleObjects;

use super::EventFlags;
use super::FsEvent;
use super::Notice;

const BUFFER_SIZE: usize = 64 * 1024;

/// Generation counter the read loop bumps whenever it is about to block
/// with nothing queued; waiting for the next bump means every previously
/// queued event has been delivered.
#[derive(Debug, Default)]
struct IdleGen {
    generation: Mutex<u64>,
    bumped: Condvar,
}

/// Windows' substitute for the cookie flush.
#[derive(Debug, Clone)]
pub struct IdleWaiter {
    idle: Arc<IdleGen>,
}

impl IdleWaiter {
    /// Block until every filesystem event queued before this call has been
    /// handed to the listener. Returns `false` on timeout.
    pub fn wait_for_idle(&self, timeout: Duration) -> bool {
        let mut generation = self.idle.generation.lock();
        let seen = *generation;
        while *generation == seen {
            if self
                .idle
                .bumped
                .wait_for(&mut generation, timeout)
                .timed_out()
            {
                return false;
            }
        }
        true
    }
}

/// Wakes a [`Watcher`] blocked in [`Watcher::next`]; cheap to clone.
#[derive(Debug, Clone)]
pub struct WatcherStop {
    stop_event: HandleRef,
}

impl WatcherStop {
    /// Ask the watcher to deliver [`Notice::Stopped`].
    pub fn stop(&self) {
        unsafe { SetEvent(self.stop_event.0) };
    }
}

/// Event handles may be signalled from any thread.
#[derive(Debug, Clone, Copy)]
struct HandleRef(HANDLE);
unsafe impl Send for HandleRef {}
unsafe impl Sync for HandleRef {}

/// `ReadDirectoryChangesW` watcher over one worktree.
pub struct Watcher {
    dir: HANDLE,
    overlapped_event: HANDLE,
    stop_event: HandleRef,
    buffer: Box<[u8; BUFFER_SIZE]>,
    overlapped: Box<OVERLAPPED>,
    read_pending: bool,
    root: PathBuf,
    idle: Arc<IdleGen>,
}

unsafe impl Send for Watcher {}

impl std::fmt::Debug for Watcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Watcher")
            .field("root", &self.root)
            .field("read_pending", &self.read_pending)
            .finish_non_exhaustive()
    }
}

impl Watcher {
    /// Watch `root` and everything below it.
    pub fn new(root: &Path) -> io::Result<Watcher> {
        let wide: Vec<u16> = root.as_os_str().encode_wide().chain(Some(0)).collect();
        let dir = unsafe {
            CreateFileW(
                wide.as_ptr(),
                FILE_LIST_DIRECTORY,
                FILE_SHARE_READ | FILE_SHARE_WRITE | FILE_SHARE_DELETE,
                std::ptr::null(),
                OPEN_EXISTING,
                FILE_FLAG_BACKUP_SEMANTICS | FILE_FLAG_OVERLAPPED,
                std::ptr::null_mut(),
            )
        };
        if dir == INVALID_HANDLE_VALUE {
            return Err(io::Error::last_os_error());
        }

        let overlapped_event = unsafe { CreateEventW(std::ptr::null(), 1, 0, std::ptr::null()) };
        let stop_event = unsafe { CreateEventW(std::ptr::null(), 1, 0, std::ptr::null()) };
        if overlapped_event.is_null() || stop_event.is_null() {
            unsafe { CloseHandle(dir) };
            return Err(io::Error::last_os_error());
        }

        Ok(Watcher {
            dir,
            overlapped_event,
            stop_event: HandleRef(stop_event),
            buffer: Box::new([0u8; BUFFER_SIZE]),
            overlapped: Box::new(unsafe { std::mem::zeroed() }),
            read_pending: false,
            root: root.to_path_buf(),
            idle: Arc::new(IdleGen::default()),
        })
    }

    /// Handle for stopping the watcher from another thread.
    pub fn stop_handle(&self) -> WatcherStop {
        WatcherStop {
            stop_event: self.stop_event,
        }
    }

    /// Handle for the wait-for-idle primitive.
    pub fn idle_waiter(&self) -> IdleWaiter {
        IdleWaiter {
            idle: Arc::clone(&self.idle),
        }
    }

    /// Block for the next delivery.
    pub fn next(&mut self) -> io::Result<Notice> {
        if !self.read_pending {
            self.issue_read()?;
        }

        // Everything queued so far has been handed out; anyone waiting for
        // idle may proceed once we are about to block.
        {
            let mut generation = self.idle.generation.lock();
            *generation += 1;
            self.idle.bumped.notify_all();
        }

        let handles = [self.overlapped_event, self.stop_event.0];
        let waited = unsafe { WaitForMultipleObjects(2, handles.as_ptr(), 0, INFINITE) };
        if waited == WAIT_OBJECT_0 + 1 {
            return Ok(Notice::Stopped);
        }
        if waited != WAIT_OBJECT_0 {
            return Err(io::Error::last_os_error());
        }

        self.read_pending = false;
        let mut bytes = 0u32;
        let ok = unsafe { GetOverlappedResult(self.dir, &*self.overlapped, &mut bytes, 0) };
        if ok == 0 {
            let code = unsafe { GetLastError() };
            if code == ERROR_NOTIFY_ENUM_DIR {
                return Ok(Notice::Overflow);
            }
            return Err(io::Error::from_raw_os_error(code as i32));
        }
        if bytes == 0 {
            // The kernel could not fit the backlog into our buffer.
            warn!("ReadDirectoryChangesW overflowed its buffer");
            return Ok(Notice::Overflow);
        }

        Ok(Notice::Events(self.parse(bytes as usize)))
    }

    fn issue_read(&mut self) -> io::Result<()> {
        *self.overlapped = unsafe { std::mem::zeroed() };
        self.overlapped.hEvent = self.overlapped_event;
        let filter = FILE_NOTIFY_CHANGE_FILE_NAME
            | FILE_NOTIFY_CHANGE_DIR_NAME
            | FILE_NOTIFY_CHANGE_ATTRIBUTES
            | FILE_NOTIFY_CHANGE_SIZE
            | FILE_NOTIFY_CHANGE_LAST_WRITE
            | FILE_NOTIFY_CHANGE_CREATION;
        let ok = unsafe {
            ReadDirectoryChangesW(
                self.dir,
                self.buffer.as_mut_ptr().cast(),
                BUFFER_SIZE as u32,
                1,
                filter,
                std::ptr::null_mut(),
                &mut *self.overlapped,
                None,
            )
        };
        if ok == 0 {
            return Err(io::Error::last_os_error());
        }
        self.read_pending = true;
        Ok(())
    }

    fn parse(&mut self, len: usize) -> Vec<FsEvent> {
        let mut events = Vec::new();
        let mut offset = 0usize;
        loop {
            if offset + std::mem::size_of::<FILE_NOTIFY_INFORMATION>() > len {
                break;
            }
            let info = unsafe {
                &*(self.buffer.as_ptr().add(offset) as *const FILE_NOTIFY_INFORMATION)
            };
            let name_len = info.FileNameLength as usize / 2;
            let name_ptr = unsafe {
                std::slice::from_raw_parts(info.FileName.as_ptr(), name_len)
            };
            let rel = std::ffi::OsString::from_wide(name_ptr);
            let path = self.root.join(&rel);

            let flags = match info.Action {
                FILE_ACTION_ADDED => EventFlags::CREATED,
                FILE_ACTION_REMOVED => EventFlags::DELETED,
                FILE_ACTION_MODIFIED => EventFlags::MODIFIED,
                FILE_ACTION_RENAMED_OLD_NAME => EventFlags::RENAMED_FROM,
                FILE_ACTION_RENAMED_NEW_NAME => EventFlags::RENAMED_TO,
                _ => EventFlags::empty(),
            };
            if !flags.is_empty() {
                // The notification record does not say whether the path is
                // a directory; the listener treats missing IS_DIR as a file,
                // which only costs the trailing slash decoration.
                events.push(FsEvent { path, flags });
            }

            if info.NextEntryOffset == 0 {
                break;
            }
            offset += info.NextEntryOffset as usize;
        }
        events
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        unsafe {
            CloseHandle(self.dir);
            CloseHandle(self.overlapped_event);
            CloseHandle(self.stop_event.0);
        }
    }
}
