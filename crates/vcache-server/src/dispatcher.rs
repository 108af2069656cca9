//! Single-threaded I/O multiplexer.
//!
//! The dispatcher waits on its control waker plus every idle client
//! connection. Control messages are handled first; then each readable
//! connection yields exactly one frame, which is pushed to the work queue
//! together with the connection itself. The connection stays out of the
//! poll set until a worker hands it back with [`ControlMsg::Resume`].

use std::collections::BTreeMap;
use std::io::{self, ErrorKind, Read, Write};
use std::os::fd::AsFd;
use std::os::unix::net::UnixStream;
use std::sync::Arc;

use crossbeam_channel::{unbounded, Receiver, Sender};
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use vcache_config::{log_dispatch_debug, log_dispatch_info, log_dispatch_warn};
use vcache_ipc::{read_frame, write_frame, Body, Compression, Message, MessageId, Request, Status};

use crate::error::Result;
use crate::handler::RequestHandler;
use crate::queue::WorkQueue;
use crate::ClientId;

/// A decoded request paired with the connection it came from.
pub struct WorkItem {
    pub client: ClientId,
    pub stream: UnixStream,
    pub id: MessageId,
    pub request: Request,
}

pub enum ControlMsg {
    /// Fresh connection from the acceptor
    NewConnection(ClientId, UnixStream),
    /// Reply written; poll this connection again
    Resume(ClientId, UnixStream),
    /// Reply could not be written; the connection is gone
    Close(ClientId),
    Shutdown,
}

/// Sending side of the dispatcher's control channel.
#[derive(Clone)]
pub struct ControlHandle {
    tx: Sender<ControlMsg>,
    waker: Arc<UnixStream>,
}

impl ControlHandle {
    /// Queue a control message and wake the dispatcher. Returns `false` once
    /// the dispatcher has exited.
    pub fn send(&self, msg: ControlMsg) -> bool {
        if self.tx.send(msg).is_err() {
            return false;
        }
        wake(&self.waker);
        true
    }
}

/// Nudge a poll loop through its waker socket.
pub(crate) fn wake(waker: &UnixStream) {
    match (&*waker).write(&[1]) {
        Ok(_) => {}
        // a full buffer already guarantees a wakeup
        Err(e) if e.kind() == ErrorKind::WouldBlock => {}
        Err(e) => log_dispatch_debug!("Waker write failed", error = e.to_string()),
    }
}

/// Empty a nonblocking waker socket.
pub(crate) fn drain_waker(waker: &UnixStream) {
    let mut buf = [0u8; 64];
    loop {
        match (&*waker).read(&mut buf) {
            Ok(0) => break,
            Ok(_) => continue,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(_) => break,
        }
    }
}

/// Nonblocking socket pair: (read end, write end)
pub(crate) fn waker_pair() -> io::Result<(UnixStream, UnixStream)> {
    let (rx, tx) = UnixStream::pair()?;
    rx.set_nonblocking(true)?;
    tx.set_nonblocking(true)?;
    Ok((rx, tx))
}

fn is_ready(fd: &PollFd<'_>) -> bool {
    fd.revents().is_some_and(|r| {
        r.intersects(PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR | PollFlags::POLLNVAL)
    })
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub connections: u64,
    pub requests_enqueued: u64,
    /// Requests discarded because the work queue was full
    pub requests_dropped: u64,
}

pub struct Dispatcher {
    control: Receiver<ControlMsg>,
    waker: UnixStream,
    /// Idle connections, polled for the next request
    connections: BTreeMap<ClientId, UnixStream>,
    queue: Arc<WorkQueue<WorkItem>>,
    handler: RequestHandler,
    max_frame: usize,
    scratch: Vec<u8>,
    stats: DispatchStats,
}

impl Dispatcher {
    pub fn new(
        queue: Arc<WorkQueue<WorkItem>>,
        handler: RequestHandler,
        max_frame: usize,
    ) -> io::Result<(Self, ControlHandle)> {
        let (tx, rx) = unbounded();
        let (waker_rx, waker_tx) = waker_pair()?;
        let dispatcher = Self {
            control: rx,
            waker: waker_rx,
            connections: BTreeMap::new(),
            queue,
            handler,
            max_frame,
            scratch: Vec::with_capacity(max_frame),
            stats: DispatchStats::default(),
        };
        let handle = ControlHandle {
            tx,
            waker: Arc::new(waker_tx),
        };
        Ok((dispatcher, handle))
    }

    /// Run until [`ControlMsg::Shutdown`]. Idle connections are closed on exit.
    pub fn run(mut self) -> Result<DispatchStats> {
        log_dispatch_debug!("Dispatcher started", max_frame = self.max_frame);
        loop {
            let (control_ready, ready) = {
                let ids: Vec<ClientId> = self.connections.keys().copied().collect();
                let mut fds = Vec::with_capacity(ids.len() + 1);
                fds.push(PollFd::new(self.waker.as_fd(), PollFlags::POLLIN));
                fds.extend(
                    self.connections
                        .values()
                        .map(|stream| PollFd::new(stream.as_fd(), PollFlags::POLLIN)),
                );

                match poll(&mut fds, PollTimeout::NONE) {
                    Ok(_) => {}
                    Err(Errno::EINTR) => continue,
                    Err(e) => return Err(e.into()),
                }

                let ready: Vec<ClientId> = ids
                    .iter()
                    .zip(&fds[1..])
                    .filter(|(_, fd)| is_ready(fd))
                    .map(|(id, _)| *id)
                    .collect();
                (is_ready(&fds[0]), ready)
            };

            if control_ready {
                drain_waker(&self.waker);
            }
            if !self.handle_control() {
                log_dispatch_info!(
                    "Dispatcher stopped",
                    idle_connections = self.connections.len(),
                    enqueued = self.stats.requests_enqueued,
                    dropped = self.stats.requests_dropped,
                );
                return Ok(self.stats);
            }

            for client in ready {
                self.service(client);
            }
        }
    }

    /// Apply pending control messages. `false` means shut down.
    fn handle_control(&mut self) -> bool {
        while let Ok(msg) = self.control.try_recv() {
            match msg {
                ControlMsg::NewConnection(client, stream) => {
                    self.stats.connections += 1;
                    log_dispatch_debug!("Connection added", client = client.0);
                    self.connections.insert(client, stream);
                }
                ControlMsg::Resume(client, stream) => {
                    self.connections.insert(client, stream);
                }
                ControlMsg::Close(client) => {
                    log_dispatch_debug!("Connection closed by worker", client = client.0);
                    self.handler.disconnect(client);
                }
                ControlMsg::Shutdown => return false,
            }
        }
        true
    }

    /// Read one frame from a ready connection and hand it to the workers.
    fn service(&mut self, client: ClientId) {
        let Some(mut stream) = self.connections.remove(&client) else {
            return;
        };

        match read_frame(&mut stream, &mut self.scratch, self.max_frame) {
            Ok(None) => {
                log_dispatch_debug!("Client disconnected", client = client.0);
                self.handler.disconnect(client);
            }
            Ok(Some(Message {
                id,
                body: Body::Request(request),
            })) => {
                log_dispatch_debug!(
                    "Request decoded",
                    client = client.0,
                    id = id.to_string(),
                    kind = format!("{:?}", request.kind()),
                );
                let item = WorkItem {
                    client,
                    stream,
                    id,
                    request,
                };
                match self.queue.try_push(item) {
                    Ok(()) => self.stats.requests_enqueued += 1,
                    Err(item) => {
                        self.stats.requests_dropped += 1;
                        log_dispatch_warn!(
                            "Work queue full, request dropped",
                            client = client.0,
                            id = item.id.to_string(),
                        );
                        self.connections.insert(item.client, item.stream);
                    }
                }
            }
            Ok(Some(message)) => {
                log_dispatch_warn!(
                    "Client sent a response frame, closing",
                    client = client.0,
                    kind = format!("{:?}", message.kind()),
                );
                let refusal = Message::response(Status::BadRequest.into());
                if let Err(e) = write_frame(&mut stream, &refusal, Compression::Disabled) {
                    log_dispatch_debug!("Refusal not delivered", client = client.0, error = e.to_string());
                }
                self.handler.disconnect(client);
            }
            Err(e) => {
                log_dispatch_warn!("Protocol error, closing", client = client.0, error = e.to_string());
                self.handler.disconnect(client);
            }
        }
    }
}
