//! Daemon assembly and client-side commands.
//!
//! `run` wires the three halves together in one process: the platform
//! watcher feeding the listener thread, the shared state, and the IPC server
//! answering queries. The remaining functions are the client side: probing,
//! starting in the background, stopping, and querying over the socket.

use std::io;
use std::io::Write;
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use std::time::Instant;

use log::info;
use log::warn;

use crate::ipc::IpcServer;
use crate::pkt;

use super::backend;
use super::backend::Watcher;
use super::client::ClientHandler;
use super::ewah::EwahBitmap;
use super::index_ext;
use super::listener::GIT_DIR_NAME;
use super::listener::Listener;
use super::state::MonitorState;

/// Socket file name inside the metadata directory.
const SOCKET_NAME: &str = "fsmonitor.ipc";

/// File carrying the persisted token + dirty bitmap payload.
const STATE_NAME: &str = "fsmonitor.state";

/// How long `stop` and `start` wait for the daemon to (dis)appear.
const SETTLE_TIMEOUT: Duration = Duration::from_secs(10);

/// Tuning for one daemon instance.
#[derive(Debug, Clone)]
pub struct MonitorSettings {
    /// Root of the watched working directory.
    pub worktree: PathBuf,
    /// IPC worker threads (`fsmonitor.ipcThreads`).
    pub ipc_threads: usize,
}

impl MonitorSettings {
    /// Defaults for a worktree.
    pub fn new(worktree: impl Into<PathBuf>) -> Self {
        MonitorSettings {
            worktree: worktree.into(),
            ipc_threads: 8,
        }
    }

    /// The watched metadata directory.
    pub fn git_dir(&self) -> PathBuf {
        self.worktree.join(GIT_DIR_NAME)
    }

    /// Where the daemon listens.
    pub fn socket_path(&self) -> PathBuf {
        self.git_dir().join(SOCKET_NAME)
    }

    /// Where the persisted extension payload lives.
    pub fn state_path(&self) -> PathBuf {
        self.git_dir().join(STATE_NAME)
    }
}

/// One parsed daemon response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryReply {
    /// Token to present next time.
    pub token: String,
    /// Changed paths, newest first, deduplicated.
    pub paths: Vec<String>,
    /// Whether the daemon told us to assume everything is dirty.
    pub trivial: bool,
}

/// Whether a watcher exists for this platform.
pub fn is_supported() -> bool {
    backend::is_supported()
}

/// Run the daemon in the foreground until it is stopped.
pub fn run(settings: &MonitorSettings) -> io::Result<()> {
    let git_dir = settings.git_dir();
    if !git_dir.is_dir() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("{} is not a directory", git_dir.display()),
        ));
    }

    let state = Arc::new(MonitorState::new());
    let handler = Arc::new(ClientHandler::new(Arc::clone(&state), &git_dir));
    let server = IpcServer::bind(&settings.socket_path(), settings.ipc_threads, handler)?;

    let mut watcher = match Watcher::new(&settings.worktree) {
        Ok(watcher) => watcher,
        Err(err) => {
            server.stop_handle().stop();
            server.join();
            return Err(err);
        }
    };
    let watcher_stop = watcher.stop_handle();

    let listener = {
        let mut listener = Listener::new(Arc::clone(&state), &settings.worktree, server.stop_handle());
        let spawned = thread::Builder::new()
            .name("fsmonitor-listener".to_string())
            .spawn(move || listener.run(&mut watcher));
        match spawned {
            Ok(listener) => listener,
            Err(err) => {
                server.stop_handle().stop();
                server.join();
                return Err(err);
            }
        }
    };

    info!("fsmonitor daemon watching {}", settings.worktree.display());
    server.join();

    watcher_stop.stop();
    if listener.join().is_err() {
        warn!("listener thread panicked");
    }
    info!("fsmonitor daemon for {} exited", settings.worktree.display());
    Ok(())
}

/// Spawn a background daemon unless one is already listening.
pub fn start(settings: &MonitorSettings) -> io::Result<()> {
    if is_running(settings) {
        info!("fsmonitor daemon already running");
        return Ok(());
    }
    let exe = std::env::current_exe()?;
    std::process::Command::new(exe)
        .arg("run")
        .arg("--worktree")
        .arg(&settings.worktree)
        .arg("--ipc-threads")
        .arg(settings.ipc_threads.to_string())
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .spawn()?;

    let deadline = Instant::now() + SETTLE_TIMEOUT;
    while Instant::now() < deadline {
        if is_running(settings) {
            return Ok(());
        }
        thread::sleep(Duration::from_millis(50));
    }
    Err(io::Error::new(
        io::ErrorKind::TimedOut,
        "daemon did not come up in time",
    ))
}

/// Whether a daemon currently answers on the socket.
pub fn is_running(settings: &MonitorSettings) -> bool {
    UnixStream::connect(settings.socket_path()).is_ok()
}

/// Ask a running daemon to quit and wait for its socket to disappear.
/// Returns `false` when no daemon was listening in the first place.
pub fn stop(settings: &MonitorSettings) -> io::Result<bool> {
    let socket = settings.socket_path();
    let mut stream = match UnixStream::connect(&socket) {
        Ok(stream) => stream,
        Err(_) => return Ok(false),
    };
    stream.write_all(b"quit\0")?;
    drop(stream);

    let deadline = Instant::now() + SETTLE_TIMEOUT;
    while Instant::now() < deadline {
        if !socket.exists() {
            return Ok(true);
        }
        thread::sleep(Duration::from_millis(50));
    }
    Err(io::Error::new(
        io::ErrorKind::TimedOut,
        "daemon did not shut down in time",
    ))
}

/// Send one command and parse the framed response.
pub fn query(settings: &MonitorSettings, command: &str) -> io::Result<QueryReply> {
    let mut stream = UnixStream::connect(settings.socket_path())?;
    stream.write_all(command.as_bytes())?;
    stream.write_all(b"\0")?;
    stream.flush()?;

    let mut token = None;
    let mut paths = Vec::new();
    let mut trivial = false;
    while let Some(frame) = pkt::read_frame(&mut stream)? {
        let Some(payload) = frame.data() else {
            continue;
        };
        let line = match payload.split_last() {
            Some((0, line)) => line,
            _ => payload,
        };
        let line = String::from_utf8_lossy(line).into_owned();
        if token.is_none() {
            token = Some(line);
        } else if line == "/" {
            trivial = true;
        } else {
            paths.push(line);
        }
    }

    Ok(QueryReply {
        token: token.ok_or_else(|| {
            io::Error::new(io::ErrorKind::UnexpectedEof, "daemon sent no response token")
        })?,
        paths,
        trivial,
    })
}

/// Trigger a resync; test and debugging aid.
pub fn flush(settings: &MonitorSettings) -> io::Result<QueryReply> {
    query(settings, "flush")
}

/// Query with the token stored in the persisted state file.
pub fn query_index(settings: &MonitorSettings) -> io::Result<QueryReply> {
    let payload = std::fs::read(settings.state_path())?;
    let ext = index_ext::decode(&payload)
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err.to_string()))?;
    query(settings, &ext.token)
}

/// Persist `token` plus the dirty bitmap for a later `query-index`.
pub fn save_state(settings: &MonitorSettings, token: &str, dirty: &EwahBitmap) -> io::Result<()> {
    std::fs::write(settings.state_path(), index_ext::encode(token, dirty))
}
