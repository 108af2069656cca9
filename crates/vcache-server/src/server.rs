//! Server assembly: binds the socket, starts the dispatcher and workers,
//! runs the accept loop and performs the orderly shutdown.

use std::fs;
use std::io::{self, ErrorKind};
use std::os::fd::AsFd;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use vcache_config::{log_server_debug, log_server_error, log_server_info, log_server_warn, Config};
use vcache_ipc::Compression;

use crate::dispatcher::{drain_waker, wake, waker_pair, ControlHandle, ControlMsg, DispatchStats, Dispatcher};
use crate::error::{Result, ServerError};
use crate::handler::RequestHandler;
use crate::queue::WorkQueue;
use crate::session::SessionTable;
use crate::signals::{self, BlockedSignals};
use crate::store::{FileStore, StoreStats};
use crate::worker::spawn_workers;
use crate::{ClientId, ShutdownMode};

/// Bound on a blocking read once a connection polled readable.
///
/// The dispatcher reads each frame on its own thread, so a client that
/// sends a partial frame and stalls holds every other connection up to
/// this long before it is dropped as a protocol error.
const READ_TIMEOUT: Duration = Duration::from_millis(500);
/// Bound on a worker's reply write to a client that stopped reading
const WRITE_TIMEOUT: Duration = Duration::from_secs(5);
/// Longest a drain waits for queued requests before failing held-lock waits
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Peer credentials (uid/gid) of a connected client
#[derive(Debug, Clone, Copy)]
struct PeerCredentials {
    uid: u32,
    gid: u32,
}

impl PeerCredentials {
    #[cfg(target_os = "linux")]
    fn from_stream(stream: &UnixStream) -> Option<Self> {
        use std::os::unix::io::AsRawFd;
        let fd = stream.as_raw_fd();
        let mut cred: libc::ucred = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of::<libc::ucred>() as libc::socklen_t;
        let ret = unsafe {
            libc::getsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_PEERCRED,
                &mut cred as *mut _ as *mut libc::c_void,
                &mut len,
            )
        };
        if ret == 0 {
            Some(Self {
                uid: cred.uid,
                gid: cred.gid,
            })
        } else {
            None
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn from_stream(_stream: &UnixStream) -> Option<Self> {
        None
    }
}

/// Requests a shutdown from another thread.
#[derive(Clone)]
pub struct ServerHandle {
    requested: Arc<AtomicU8>,
    waker: Arc<UnixStream>,
}

impl ServerHandle {
    /// Ask the server to stop. A later `Stop` overrides an earlier `Drain`.
    pub fn shutdown(&self, mode: ShutdownMode) {
        self.requested.fetch_max(signals::encode(mode), Ordering::SeqCst);
        wake(&self.waker);
    }

    fn requested(&self) -> Option<ShutdownMode> {
        signals::decode(self.requested.load(Ordering::SeqCst))
    }
}

/// What the server did before it exited
#[derive(Debug, Clone)]
pub struct ServerReport {
    pub mode: ShutdownMode,
    pub store: StoreStats,
    /// Files still stored, least recently used first
    pub files: Vec<String>,
    pub requests_handled: u64,
    /// Refused by a full queue, or left queued by a `Stop`
    pub requests_dropped: u64,
    pub connections: u64,
}

pub struct Server {
    config: Config,
    listener: UnixListener,
    socket_path: PathBuf,
    /// Read end of the acceptor waker; the write end lives in `handle`
    waker: UnixStream,
    handle: ServerHandle,
    handle_signals: bool,
}

impl Server {
    /// Bind the listening socket, replacing a stale socket file.
    pub fn bind(config: Config) -> Result<Self> {
        let socket_path = config.server.socket_path.clone();
        remove_stale_socket(&socket_path)?;

        let listener = UnixListener::bind(&socket_path).map_err(|source| ServerError::Bind {
            path: socket_path.clone(),
            source,
        })?;
        listener.set_nonblocking(true)?;

        let (waker, waker_tx) = waker_pair()?;
        let handle = ServerHandle {
            requested: Arc::new(AtomicU8::new(0)),
            waker: Arc::new(waker_tx),
        };

        Ok(Self {
            config,
            listener,
            socket_path,
            waker,
            handle,
            handle_signals: false,
        })
    }

    /// Shut down on SIGINT/SIGQUIT (stop) and SIGHUP (drain).
    pub fn with_signals(mut self) -> Self {
        self.handle_signals = true;
        self
    }

    pub fn handle(&self) -> ServerHandle {
        self.handle.clone()
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Bind on the calling thread and serve on a new one.
    pub fn spawn(config: Config) -> Result<(ServerHandle, JoinHandle<Result<ServerReport>>)> {
        let server = Self::bind(config)?;
        let handle = server.handle();
        let thread = thread::Builder::new()
            .name("vcache-acceptor".to_string())
            .spawn(move || server.run())?;
        Ok((handle, thread))
    }

    /// Serve until a shutdown is requested, then wind down.
    pub fn run(self) -> Result<ServerReport> {
        let Server {
            config,
            listener,
            socket_path,
            waker,
            handle,
            handle_signals,
        } = self;
        let server_config = &config.server;

        if handle_signals {
            signals::install(&handle.waker)?;
        }

        let store = Arc::new(FileStore::from_config(&config.store));
        let sessions = Arc::new(SessionTable::new(server_config.max_clients));
        let handler = RequestHandler::new(store.clone(), sessions);
        let queue = Arc::new(WorkQueue::new(server_config.queue_capacity));
        let (dispatcher, control) =
            Dispatcher::new(queue.clone(), handler.clone(), server_config.max_frame_bytes)?;
        let compression = Compression::from(server_config.compression);

        let (dispatch, workers) = {
            // threads inherit the mask, leaving signals to the acceptor
            let _blocked = if handle_signals {
                Some(BlockedSignals::block()?)
            } else {
                None
            };
            let dispatch = thread::Builder::new()
                .name("vcache-dispatch".to_string())
                .spawn(move || dispatcher.run())?;
            let workers = spawn_workers(
                server_config.num_workers,
                &queue,
                &handler,
                &control,
                compression,
            )?;
            (dispatch, workers)
        };

        log_server_info!(
            "Server listening",
            socket = socket_path.display().to_string(),
            workers = server_config.num_workers,
            max_clients = server_config.max_clients,
            queue_capacity = server_config.queue_capacity,
            bytes_max = store.stats().bytes_max,
            slots_max = store.stats().slots_max,
        );

        let mode = accept_loop(&listener, &waker, &handle, handle_signals, &control);
        log_server_info!("Shutting down", mode = format!("{:?}", mode));
        drop(listener);

        control.send(ControlMsg::Shutdown);
        let dispatch_stats = match dispatch.join() {
            Ok(Ok(stats)) => stats,
            Ok(Err(e)) => {
                log_server_error!("Dispatcher failed", error = e.to_string());
                DispatchStats::default()
            }
            Err(_) => return Err(ServerError::ThreadPanicked("dispatcher")),
        };

        queue.close(mode);
        if mode == ShutdownMode::Drain && !queue.wait_empty(DRAIN_TIMEOUT) {
            log_server_warn!("Drain timed out", queued = queue.len());
        }
        // workers still blocked on a held lock give up with `Unavailable`
        store.shutdown();
        let mut requests_handled = 0;
        for worker in workers {
            requests_handled += worker
                .join()
                .map_err(|_| ServerError::ThreadPanicked("worker"))?;
        }
        let abandoned = queue.drain_remaining().len() as u64;
        if abandoned > 0 {
            log_server_warn!("Queued requests dropped", count = abandoned);
        }

        store.log_summary();
        let report = ServerReport {
            mode,
            store: store.stats(),
            files: store.file_names(),
            requests_handled,
            requests_dropped: dispatch_stats.requests_dropped + abandoned,
            connections: dispatch_stats.connections,
        };

        if let Err(e) = fs::remove_file(&socket_path) {
            if e.kind() != ErrorKind::NotFound {
                log_server_warn!("Cannot remove socket", error = e.to_string());
            }
        }
        if handle_signals {
            signals::uninstall();
        }
        drop(handle);

        log_server_info!(
            "Server stopped",
            handled = report.requests_handled,
            dropped = report.requests_dropped,
            connections = report.connections,
        );
        Ok(report)
    }
}

/// Remove a socket file left by a dead server. A live one is an error.
fn remove_stale_socket(path: &Path) -> Result<()> {
    if !path.exists() {
        return Ok(());
    }
    if UnixStream::connect(path).is_ok() {
        return Err(ServerError::Bind {
            path: path.to_path_buf(),
            source: io::Error::new(ErrorKind::AddrInUse, "another server is listening"),
        });
    }
    log_server_debug!("Removing stale socket", socket = path.display().to_string());
    fs::remove_file(path).map_err(|source| ServerError::Bind {
        path: path.to_path_buf(),
        source,
    })
}

fn is_ready(fd: &PollFd<'_>) -> bool {
    fd.revents()
        .is_some_and(|r| r.intersects(PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR))
}

/// Accept connections until a shutdown is requested.
fn accept_loop(
    listener: &UnixListener,
    waker: &UnixStream,
    handle: &ServerHandle,
    handle_signals: bool,
    control: &ControlHandle,
) -> ShutdownMode {
    let mut next_client = 0u64;
    loop {
        let requested = match (handle.requested(), handle_signals) {
            (Some(mode), _) => Some(mode),
            (None, true) => signals::requested(),
            (None, false) => None,
        };
        if let Some(mode) = requested {
            return mode;
        }

        let (listener_ready, waker_ready) = {
            let mut fds = [
                PollFd::new(listener.as_fd(), PollFlags::POLLIN),
                PollFd::new(waker.as_fd(), PollFlags::POLLIN),
            ];
            match poll(&mut fds, PollTimeout::NONE) {
                Ok(_) => {}
                Err(Errno::EINTR) => continue,
                Err(e) => {
                    log_server_error!("Acceptor poll failed", error = e.to_string());
                    return ShutdownMode::Stop;
                }
            }
            (is_ready(&fds[0]), is_ready(&fds[1]))
        };

        if waker_ready {
            drain_waker(waker);
        }
        if !listener_ready {
            continue;
        }

        loop {
            match listener.accept() {
                Ok((stream, _)) => {
                    next_client += 1;
                    if !admit(stream, ClientId(next_client), control) {
                        log_server_error!("Dispatcher is gone, stopping");
                        return ShutdownMode::Stop;
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    log_server_warn!("Accept failed", error = e.to_string());
                    break;
                }
            }
        }
    }
}

/// Configure a fresh connection and hand it to the dispatcher. `false`
/// means the dispatcher has exited.
fn admit(stream: UnixStream, client: ClientId, control: &ControlHandle) -> bool {
    let configured = stream
        .set_nonblocking(false)
        .and_then(|_| stream.set_read_timeout(Some(READ_TIMEOUT)))
        .and_then(|_| stream.set_write_timeout(Some(WRITE_TIMEOUT)));
    if let Err(e) = configured {
        log_server_warn!("Rejecting connection", client = client.0, error = e.to_string());
        return true;
    }

    match PeerCredentials::from_stream(&stream) {
        Some(peer) => log_server_debug!(
            "Client connected",
            client = client.0,
            uid = peer.uid,
            gid = peer.gid,
        ),
        None => log_server_debug!("Client connected", client = client.0),
    }
    control.send(ControlMsg::NewConnection(client, stream))
}

#[cfg(test)]
mod tests {
    use super::*;
    use vcache_config::testing::TestEnvironment;

    #[test]
    fn test_bind_replaces_stale_socket() {
        let env = TestEnvironment::new().unwrap();
        // a bound-then-dropped listener leaves its file behind
        drop(UnixListener::bind(&env.socket_path).unwrap());
        assert!(env.is_socket_present());

        let server = Server::bind(env.server_config()).unwrap();
        assert_eq!(server.socket_path(), env.socket_path.as_path());
    }

    #[test]
    fn test_bind_refuses_live_socket() {
        let env = TestEnvironment::new().unwrap();
        let _live = UnixListener::bind(&env.socket_path).unwrap();
        let err = Server::bind(env.server_config()).err().unwrap();
        assert!(matches!(err, ServerError::Bind { .. }));
    }

    #[test]
    fn test_idle_server_stops_and_cleans_up() {
        let env = TestEnvironment::new().unwrap();
        let (handle, thread) = Server::spawn(env.server_config()).unwrap();
        handle.shutdown(ShutdownMode::Drain);
        handle.shutdown(ShutdownMode::Stop);

        let report = thread.join().unwrap().unwrap();
        assert_eq!(report.mode, ShutdownMode::Stop);
        assert_eq!(report.requests_handled, 0);
        assert!(report.files.is_empty());
        assert!(!env.is_socket_present());
    }
}
