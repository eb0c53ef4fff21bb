//! Generic Unix-socket IPC server.
//!
//! An accept thread polls the listen socket plus a self-pipe for shutdown
//! and hands accepted clients to a bounded FIFO; a pool of worker threads
//! pops clients, waits briefly for the first command bytes (silent
//! connections are dropped), and runs the application handler with a
//! packet-line reply writer. The accept thread also watches the socket's
//! inode: if another process force-rebinds the path, the server shuts down.

use std::io;
use std::io::Read;
use std::io::Write;
use std::os::fd::AsFd;
use std::os::fd::OwnedFd;
use std::os::unix::net::UnixListener;
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::thread;
use std::thread::JoinHandle;

use log::debug;
use log::error;
use log::info;
use log::warn;
use nix::poll::PollFd;
use nix::poll::PollFlags;
use nix::poll::PollTimeout;
use nix::poll::poll;

use crate::fifo::Fifo;
use crate::pkt;

/// FIFO capacity per worker thread.
const FIFO_SCALE: usize = 2;

/// How long the accept thread sleeps per poll; doubles as the interval of
/// the socket-inode theft check.
const ACCEPT_TICK_MS: u16 = 1000;

/// How long a worker waits for a client's first bytes before dropping it.
const FIRST_BYTES_TIMEOUT_MS: u16 = 5000;

/// Upper bound on one command's length.
const MAX_COMMAND: usize = 64 * 1024;

/// What the application wants after handling one command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Keep serving.
    Continue,
    /// Shut the server down.
    Quit,
}

/// Application callback run once per client connection.
pub trait Handler: Send + Sync + 'static {
    /// Handle one command; write any response through `reply`.
    fn handle(&self, command: &[u8], reply: &mut Reply<'_>) -> Outcome;
}

/// Packet-line reply writer handed to the application.
#[derive(Debug)]
pub struct Reply<'a> {
    stream: &'a mut UnixStream,
    failed: bool,
}

impl Reply<'_> {
    /// Send one reply frame. Write failures are remembered and subsequent
    /// sends become no-ops; a client hanging up mid-reply is not an error
    /// worth surfacing past the connection.
    pub fn send(&mut self, payload: &[u8]) {
        if self.failed {
            return;
        }
        if let Err(err) = pkt::write_frame(self.stream, payload) {
            debug!("client went away mid-reply: {err}");
            self.failed = true;
        }
    }

    /// Send the flush marker.
    pub fn flush(&mut self) {
        if self.failed {
            return;
        }
        if pkt::write_flush(self.stream).is_err() || self.stream.flush().is_err() {
            self.failed = true;
        }
    }
}

/// Wakes the accept thread and flags shutdown; cheap to clone.
#[derive(Debug, Clone)]
pub struct StopHandle {
    pipe_w: Arc<OwnedFd>,
    stopping: Arc<AtomicBool>,
}

impl StopHandle {
    /// Ask the server to stop accepting and wind down.
    pub fn stop(&self) {
        if !self.stopping.swap(true, Ordering::SeqCst) {
            // One byte is enough; the accept thread only polls readability.
            let _ = nix::unistd::write(self.pipe_w.as_fd(), b"q");
        }
    }

    /// Whether a stop was requested.
    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    /// Handle wired to no server; only the flag is observable. Test hook.
    #[cfg(test)]
    pub(crate) fn disconnected() -> StopHandle {
        let (pipe_r, pipe_w) = nix::unistd::pipe().expect("self-pipe");
        std::mem::forget(pipe_r);
        StopHandle {
            pipe_w: Arc::new(pipe_w),
            stopping: Arc::new(AtomicBool::new(false)),
        }
    }
}

/// A running IPC server.
#[derive(Debug)]
pub struct IpcServer {
    path: PathBuf,
    ino: u64,
    accept: Option<JoinHandle<()>>,
    workers: Vec<JoinHandle<()>>,
    stop: StopHandle,
}

impl IpcServer {
    /// Bind `path` and start the accept thread plus `worker_count` workers.
    pub fn bind(path: &Path, worker_count: usize, handler: Arc<dyn Handler>) -> io::Result<IpcServer> {
        let worker_count = worker_count.max(1);
        let listener = bind_socket(path)?;
        listener.set_nonblocking(true)?;
        let ino = nix::sys::stat::lstat(path)?.st_ino;

        let (pipe_r, pipe_w) = nix::unistd::pipe()?;
        let stop = StopHandle {
            pipe_w: Arc::new(pipe_w),
            stopping: Arc::new(AtomicBool::new(false)),
        };

        let fifo = Arc::new(Fifo::new(worker_count * FIFO_SCALE));

        let accept = {
            let fifo = Arc::clone(&fifo);
            let path = path.to_path_buf();
            let stop = stop.clone();
            thread::Builder::new()
                .name("ipc-accept".to_string())
                .spawn(move || accept_main(listener, pipe_r, &fifo, &path, ino, &stop))?
        };

        let mut workers = Vec::with_capacity(worker_count);
        for idx in 0..worker_count {
            let fifo = Arc::clone(&fifo);
            let handler = Arc::clone(&handler);
            let stop = stop.clone();
            workers.push(
                thread::Builder::new()
                    .name(format!("ipc-worker-{idx}"))
                    .spawn(move || worker_main(&fifo, &*handler, &stop))?,
            );
        }

        info!("ipc server listening on {}", path.display());
        Ok(IpcServer {
            path: path.to_path_buf(),
            ino,
            accept: Some(accept),
            workers,
            stop,
        })
    }

    /// Handle for asking the server to stop from another thread.
    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Block until the server has wound down, then remove the socket unless
    /// someone re-bound the path in the meantime.
    pub fn join(mut self) {
        if let Some(accept) = self.accept.take() {
            let _ = accept.join();
        }
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
        match nix::sys::stat::lstat(&self.path) {
            Ok(st) if st.st_ino == self.ino => {
                let _ = std::fs::remove_file(&self.path);
            }
            _ => {}
        }
    }
}

/// Bind, and when the address is busy probe whether a live server holds it:
/// a successful connect means yes; a dead socket file is unlinked and the
/// bind retried.
fn bind_socket(path: &Path) -> io::Result<UnixListener> {
    match UnixListener::bind(path) {
        Ok(listener) => Ok(listener),
        Err(err) if err.kind() == io::ErrorKind::AddrInUse => {
            if UnixStream::connect(path).is_ok() {
                return Err(io::Error::new(
                    io::ErrorKind::AddrInUse,
                    format!("{} already has a live server", path.display()),
                ));
            }
            warn!("removing stale socket {}", path.display());
            std::fs::remove_file(path)?;
            UnixListener::bind(path)
        }
        Err(err) => Err(err),
    }
}

fn accept_main(
    listener: UnixListener,
    pipe_r: OwnedFd,
    fifo: &Fifo<UnixStream>,
    path: &Path,
    ino: u64,
    stop: &StopHandle,
) {
    loop {
        let mut fds = [
            PollFd::new(listener.as_fd(), PollFlags::POLLIN),
            PollFd::new(pipe_r.as_fd(), PollFlags::POLLIN),
        ];
        let ready = match poll(&mut fds, PollTimeout::from(ACCEPT_TICK_MS)) {
            Ok(n) => n,
            Err(nix::errno::Errno::EINTR) => continue,
            Err(err) => {
                error!("ipc accept poll failed: {err}");
                break;
            }
        };

        if fds[1]
            .revents()
            .is_some_and(|r| r.intersects(PollFlags::POLLIN | PollFlags::POLLHUP))
        {
            debug!("ipc accept thread: shutdown requested");
            break;
        }

        if ready == 0 || stop.is_stopping() {
            if stop.is_stopping() {
                break;
            }
            // Idle tick: make sure nobody stole our socket path.
            match nix::sys::stat::lstat(path) {
                Ok(st) if st.st_ino == ino => continue,
                _ => {
                    warn!("socket {} was re-bound under us, shutting down", path.display());
                    break;
                }
            }
        }

        loop {
            match listener.accept() {
                Ok((stream, _addr)) => {
                    if fifo.push(stream).is_err() {
                        // Queue full: shed the connection.
                        debug!("ipc fifo full, dropping client");
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    // Per-connection accept errors are not fatal.
                    debug!("accept failed: {err}");
                    break;
                }
            }
        }
    }
    fifo.close();
}

fn worker_main(fifo: &Fifo<UnixStream>, handler: &dyn Handler, stop: &StopHandle) {
    block_sigpipe();
    while let Some(mut stream) = fifo.pop() {
        let command = match read_command(&mut stream) {
            Ok(Some(command)) => command,
            Ok(None) => continue,
            Err(err) => {
                debug!("client read failed: {err}");
                continue;
            }
        };
        let mut reply = Reply {
            stream: &mut stream,
            failed: false,
        };
        if handler.handle(&command, &mut reply) == Outcome::Quit {
            info!("ipc handler requested shutdown");
            stop.stop();
        }
    }
}

/// Workers never want a SIGPIPE kill for a client that hung up mid-reply.
fn block_sigpipe() {
    use nix::sys::signal::SigSet;
    use nix::sys::signal::SigmaskHow;
    use nix::sys::signal::Signal;
    use nix::sys::signal::pthread_sigmask;

    let mut set = SigSet::empty();
    set.add(Signal::SIGPIPE);
    if let Err(err) = pthread_sigmask(SigmaskHow::SIG_BLOCK, Some(&set), None) {
        warn!("failed to block SIGPIPE: {err}");
    }
}

/// Wait briefly for the client's first bytes, then read one NUL-terminated
/// command. `Ok(None)` means the client never sent anything (port scans and
/// liveness probes land here).
fn read_command(stream: &mut UnixStream) -> io::Result<Option<Vec<u8>>> {
    let mut fds = [PollFd::new(stream.as_fd(), PollFlags::POLLIN)];
    match poll(&mut fds, PollTimeout::from(FIRST_BYTES_TIMEOUT_MS)) {
        Ok(0) => return Ok(None),
        Ok(_) => {}
        Err(nix::errno::Errno::EINTR) => return Ok(None),
        Err(err) => return Err(err.into()),
    }

    let mut command = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let n = match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        };
        if let Some(nul) = memchr::memchr(0, &chunk[..n]) {
            command.extend_from_slice(&chunk[..nul]);
            return Ok(Some(command));
        }
        command.extend_from_slice(&chunk[..n]);
        if command.len() > MAX_COMMAND {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "command exceeds length limit",
            ));
        }
    }
    if command.is_empty() {
        Ok(None)
    } else {
        Ok(Some(command))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pkt::Frame;
    use std::time::Duration;
    use std::time::Instant;

    struct Echo;

    impl Handler for Echo {
        fn handle(&self, command: &[u8], reply: &mut Reply<'_>) -> Outcome {
            if command == b"quit" {
                return Outcome::Quit;
            }
            reply.send(command);
            reply.flush();
            Outcome::Continue
        }
    }

    fn query(path: &Path, command: &[u8]) -> Vec<u8> {
        let mut stream = UnixStream::connect(path).unwrap();
        stream.write_all(command).unwrap();
        stream.write_all(b"\0").unwrap();
        match pkt::expect_frame(&mut stream).unwrap() {
            Frame::Data(payload) => payload,
            Frame::Flush => panic!("expected data"),
        }
    }

    #[test]
    fn serves_concurrent_echo_clients() {
        let dir = tempfile::tempdir().unwrap();
        let sock = dir.path().join("echo.sock");
        let server = IpcServer::bind(&sock, 4, Arc::new(Echo)).unwrap();

        let mut clients = Vec::new();
        for i in 0..8 {
            let sock = sock.clone();
            clients.push(thread::spawn(move || {
                let msg = format!("hello-{i}");
                assert_eq!(query(&sock, msg.as_bytes()), msg.as_bytes());
            }));
        }
        for client in clients {
            client.join().unwrap();
        }

        server.stop_handle().stop();
        server.join();
        assert!(!sock.exists());
    }

    #[test]
    fn second_bind_fails_while_server_is_alive() {
        let dir = tempfile::tempdir().unwrap();
        let sock = dir.path().join("one.sock");
        let server = IpcServer::bind(&sock, 1, Arc::new(Echo)).unwrap();

        let err = IpcServer::bind(&sock, 1, Arc::new(Echo)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AddrInUse);

        server.stop_handle().stop();
        server.join();
    }

    #[test]
    fn stale_socket_file_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let sock = dir.path().join("stale.sock");
        // A socket file nobody listens on.
        drop(UnixListener::bind(&sock).unwrap());
        assert!(sock.exists());

        let server = IpcServer::bind(&sock, 1, Arc::new(Echo)).unwrap();
        assert_eq!(query(&sock, b"ping"), b"ping");
        server.stop_handle().stop();
        server.join();
    }

    #[test]
    fn quit_command_stops_the_server() {
        let dir = tempfile::tempdir().unwrap();
        let sock = dir.path().join("quit.sock");
        let server = IpcServer::bind(&sock, 2, Arc::new(Echo)).unwrap();

        let mut stream = UnixStream::connect(&sock).unwrap();
        stream.write_all(b"quit\0").unwrap();
        drop(stream);

        let deadline = Instant::now() + Duration::from_secs(10);
        server.join();
        assert!(Instant::now() < deadline);
        assert!(!sock.exists());
    }

    #[test]
    fn silent_client_is_dropped_without_killing_the_server() {
        let dir = tempfile::tempdir().unwrap();
        let sock = dir.path().join("probe.sock");
        let server = IpcServer::bind(&sock, 1, Arc::new(Echo)).unwrap();

        // Liveness probe: connect and immediately hang up.
        drop(UnixStream::connect(&sock).unwrap());
        assert_eq!(query(&sock, b"still-here"), b"still-here");

        server.stop_handle().stop();
        server.join();
    }
}
