//! Blocking client for `vcached`.
//!
//! A [`Client`] owns one connection and one server-side session. Every call
//! sends a single request and waits for its reply.

use std::io;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::frame::{self, Compression, WireError};
use crate::message::{Body, FileData, Kind, Message, OpenFlags, Request, ResourcePath, Status};
use crate::CLIENT_MAX_FRAME;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("cannot connect to {}: {source}", path.display())]
    Connect { path: PathBuf, source: io::Error },

    #[error(transparent)]
    Wire(#[from] WireError),

    #[error("server closed the connection")]
    Disconnected,

    #[error("request failed: {0}")]
    Status(Status),

    #[error("unexpected reply of kind {0:?}")]
    UnexpectedReply(Kind),
}

impl ClientError {
    /// The server status, when the request reached the server and was refused.
    pub fn status(&self) -> Option<Status> {
        match self {
            ClientError::Status(status) => Some(*status),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;

/// Bytes moved by this client, content only.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BytesInfo {
    pub written: u64,
    pub read: u64,
}

pub struct Client {
    stream: UnixStream,
    scratch: Vec<u8>,
    compression: Compression,
    max_frame: usize,
    bytes: BytesInfo,
}

impl Client {
    /// Connect and open a session.
    pub fn connect(socket_path: impl AsRef<Path>) -> Result<Self> {
        let path = socket_path.as_ref();
        let stream = UnixStream::connect(path).map_err(|source| ClientError::Connect {
            path: path.to_path_buf(),
            source,
        })?;
        Self::with_stream(stream)
    }

    /// Keep trying to connect every `interval` until `timeout` elapses.
    pub fn connect_with_retry(
        socket_path: impl AsRef<Path>,
        interval: Duration,
        timeout: Duration,
    ) -> Result<Self> {
        let path = socket_path.as_ref();
        let deadline = Instant::now() + timeout;
        loop {
            match UnixStream::connect(path) {
                Ok(stream) => return Self::with_stream(stream),
                Err(source) => {
                    if Instant::now() + interval > deadline {
                        return Err(ClientError::Connect {
                            path: path.to_path_buf(),
                            source,
                        });
                    }
                    debug!(path = %path.display(), error = %source, "connect failed, retrying");
                    thread::sleep(interval);
                }
            }
        }
    }

    fn with_stream(stream: UnixStream) -> Result<Self> {
        let mut client = Self {
            stream,
            scratch: Vec::new(),
            compression: Compression::Disabled,
            max_frame: CLIENT_MAX_FRAME,
            bytes: BytesInfo::default(),
        };
        client.call(Request::OpenSession)?;
        Ok(client)
    }

    pub fn with_compression(mut self, compression: Compression) -> Self {
        self.compression = compression;
        self
    }

    /// Largest reply frame accepted from the server.
    pub fn with_max_frame(mut self, max_frame: usize) -> Self {
        self.max_frame = max_frame;
        self
    }

    /// Bound how long a reply may take. The server drops requests when its
    /// queue is full, so callers that cannot wait forever should set this.
    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.stream.set_read_timeout(timeout)
    }

    pub fn bytes_info(&self) -> BytesInfo {
        self.bytes
    }

    /// Send one request and wait for the reply. Non-`Ok` statuses become
    /// [`ClientError::Status`].
    pub fn call(&mut self, request: Request) -> Result<Vec<FileData>> {
        let message = Message::request(request);
        trace!(id = %message.id, kind = ?message.kind(), "sending request");
        frame::write_frame(&mut self.stream, &message, self.compression)?;

        let reply = frame::read_frame(&mut self.stream, &mut self.scratch, self.max_frame)?
            .ok_or(ClientError::Disconnected)?;
        let response = match reply.body {
            Body::Response(response) => response,
            Body::Request(request) => return Err(ClientError::UnexpectedReply(request.kind())),
        };
        trace!(id = %reply.id, status = ?response.status(), "received reply");

        match response.status() {
            Status::Ok => Ok(response.into_files()),
            status => Err(ClientError::Status(status)),
        }
    }

    /// Returns the files evicted to make room, if any.
    pub fn open_file(&mut self, path: &str, flags: OpenFlags) -> Result<Vec<FileData>> {
        self.call(Request::OpenFile {
            path: ResourcePath::resolve(path),
            flags,
        })
    }

    pub fn close_file(&mut self, path: &str) -> Result<()> {
        self.call(Request::CloseFile {
            path: ResourcePath::resolve(path),
        })
        .map(drop)
    }

    pub fn read_file(&mut self, path: &str) -> Result<Vec<u8>> {
        let files = self.call(Request::ReadFile {
            path: ResourcePath::resolve(path),
        })?;
        let content = files
            .into_iter()
            .next()
            .map(|file| file.content)
            .unwrap_or_default();
        self.bytes.read += content.len() as u64;
        Ok(content)
    }

    /// Fetch up to `n` stored files; `0` fetches all of them.
    pub fn read_n_files(&mut self, n: u32) -> Result<Vec<FileData>> {
        let files = self.call(Request::ReadNFiles { n })?;
        self.bytes.read += files.iter().map(|f| f.content.len() as u64).sum::<u64>();
        Ok(files)
    }

    /// Replace the content of a file opened with `CREATE | LOCK`.
    /// Returns the files evicted to make room.
    pub fn write_file(&mut self, path: &str, content: &[u8]) -> Result<Vec<FileData>> {
        let evicted = self.call(Request::WriteFile {
            path: ResourcePath::resolve(path),
            content: content.to_vec(),
        })?;
        self.bytes.written += content.len() as u64;
        Ok(evicted)
    }

    pub fn append_to_file(&mut self, path: &str, content: &[u8]) -> Result<Vec<FileData>> {
        let evicted = self.call(Request::AppendFile {
            path: ResourcePath::resolve(path),
            content: content.to_vec(),
        })?;
        self.bytes.written += content.len() as u64;
        Ok(evicted)
    }

    /// Blocks until the lock is granted.
    pub fn lock_file(&mut self, path: &str) -> Result<()> {
        self.call(Request::LockFile {
            path: ResourcePath::resolve(path),
        })
        .map(drop)
    }

    pub fn unlock_file(&mut self, path: &str) -> Result<()> {
        self.call(Request::UnlockFile {
            path: ResourcePath::resolve(path),
        })
        .map(drop)
    }

    pub fn remove_file(&mut self, path: &str) -> Result<()> {
        self.call(Request::RemoveFile {
            path: ResourcePath::resolve(path),
        })
        .map(drop)
    }

    /// Close the session and the connection.
    pub fn close(mut self) -> Result<()> {
        self.call(Request::CloseSession).map(drop)
    }
}
