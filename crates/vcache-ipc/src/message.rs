//! Message model shared by `vcached` and its clients.
//!
//! One request in, one response out, same connection, in order. The
//! [`MessageId`] travels with every frame but only serves log correlation.

use std::fmt;
use std::path::{Component, Path, PathBuf};

use bitflags::bitflags;

/// 128-bit message identifier (random UUID v4)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageId([u8; 16]);

impl MessageId {
    /// Generate a fresh random id.
    pub fn new() -> Self {
        Self(*uuid::Uuid::new_v4().as_bytes())
    }

    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", uuid::Uuid::from_bytes(self.0).hyphenated())
    }
}

bitflags! {
    /// Flags accepted by an open-file request.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct OpenFlags: u32 {
        /// Reserve an empty entry when the file does not exist yet
        const CREATE = 0x0001;
        /// Acquire exclusive ownership while opening
        const LOCK = 0x0002;
    }
}

/// Identifies a stored file both by its canonical absolute name and by the
/// name the client used, which is what gets echoed back (e.g. for evictions).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourcePath {
    absolute: String,
    relative: String,
}

impl ResourcePath {
    pub fn new(absolute: impl Into<String>, relative: impl Into<String>) -> Self {
        Self {
            absolute: absolute.into(),
            relative: relative.into(),
        }
    }

    /// Build a path from a client-supplied name.
    ///
    /// The absolute form is made lexically canonical against the current
    /// working directory; the file does not need to exist locally.
    pub fn resolve(name: &str) -> Self {
        let path = Path::new(name);
        let joined = if path.is_absolute() {
            path.to_path_buf()
        } else {
            std::env::current_dir()
                .unwrap_or_else(|_| PathBuf::from("/"))
                .join(path)
        };
        Self {
            absolute: lexical_normalize(&joined).to_string_lossy().into_owned(),
            relative: name.to_string(),
        }
    }

    pub fn absolute(&self) -> &str {
        &self.absolute
    }

    pub fn relative(&self) -> &str {
        &self.relative
    }

    /// Length of the canonical name in bytes
    pub fn len(&self) -> usize {
        self.absolute.len()
    }

    pub fn is_empty(&self) -> bool {
        self.absolute.is_empty()
    }
}

impl From<&str> for ResourcePath {
    fn from(name: &str) -> Self {
        Self::resolve(name)
    }
}

impl fmt::Display for ResourcePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.absolute)
    }
}

fn lexical_normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Outcome of a request as seen by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, thiserror::Error)]
#[repr(u32)]
pub enum Status {
    #[error("ok")]
    Ok = 1,
    #[error("session already exists")]
    AlreadyExists = 10,
    #[error("session does not exist")]
    NotExist = 11,
    #[error("file already opened in this session")]
    AlreadyOpened = 12,
    #[error("file never opened in this session")]
    NeverOpened = 13,
    #[error("no free slot for a new file")]
    OutOfSlots = 14,
    #[error("too many clients")]
    TooManyClients = 15,
    #[error("file not found")]
    NotFound = 20,
    #[error("operation not permitted")]
    NotPermitted = 21,
    #[error("out of memory")]
    OutOfMemory = 22,
    #[error("server unavailable")]
    Unavailable = 30,
    #[error("bad request")]
    BadRequest = 31,
}

impl Status {
    pub fn code(self) -> u32 {
        self as u32
    }

    pub fn from_code(code: u32) -> Option<Self> {
        Some(match code {
            1 => Self::Ok,
            10 => Self::AlreadyExists,
            11 => Self::NotExist,
            12 => Self::AlreadyOpened,
            13 => Self::NeverOpened,
            14 => Self::OutOfSlots,
            15 => Self::TooManyClients,
            20 => Self::NotFound,
            21 => Self::NotPermitted,
            22 => Self::OutOfMemory,
            30 => Self::Unavailable,
            31 => Self::BadRequest,
            _ => return None,
        })
    }

    pub fn is_ok(self) -> bool {
        self == Self::Ok
    }
}

/// Message kind as carried in the frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Kind {
    OpenSession = 1,
    CloseSession = 2,
    OpenFile = 3,
    CloseFile = 4,
    ReadFile = 5,
    LockFile = 6,
    UnlockFile = 7,
    RemoveFile = 8,
    ReadNFiles = 9,
    WriteFile = 10,
    AppendFile = 11,
    SimpleResponse = 20,
    ResponseWithFiles = 21,
}

impl Kind {
    pub fn code(self) -> u32 {
        self as u32
    }

    pub fn from_code(code: u32) -> Option<Self> {
        Some(match code {
            1 => Self::OpenSession,
            2 => Self::CloseSession,
            3 => Self::OpenFile,
            4 => Self::CloseFile,
            5 => Self::ReadFile,
            6 => Self::LockFile,
            7 => Self::UnlockFile,
            8 => Self::RemoveFile,
            9 => Self::ReadNFiles,
            10 => Self::WriteFile,
            11 => Self::AppendFile,
            20 => Self::SimpleResponse,
            21 => Self::ResponseWithFiles,
            _ => return None,
        })
    }
}

/// A named file travelling over the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileData {
    pub path: ResourcePath,
    pub content: Vec<u8>,
}

impl FileData {
    pub fn new(path: ResourcePath, content: Vec<u8>) -> Self {
        Self { path, content }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    OpenSession,
    CloseSession,
    OpenFile { path: ResourcePath, flags: OpenFlags },
    CloseFile { path: ResourcePath },
    ReadFile { path: ResourcePath },
    /// `n == 0` asks for every stored file
    ReadNFiles { n: u32 },
    WriteFile { path: ResourcePath, content: Vec<u8> },
    AppendFile { path: ResourcePath, content: Vec<u8> },
    LockFile { path: ResourcePath },
    UnlockFile { path: ResourcePath },
    RemoveFile { path: ResourcePath },
}

impl Request {
    pub fn kind(&self) -> Kind {
        match self {
            Request::OpenSession => Kind::OpenSession,
            Request::CloseSession => Kind::CloseSession,
            Request::OpenFile { .. } => Kind::OpenFile,
            Request::CloseFile { .. } => Kind::CloseFile,
            Request::ReadFile { .. } => Kind::ReadFile,
            Request::ReadNFiles { .. } => Kind::ReadNFiles,
            Request::WriteFile { .. } => Kind::WriteFile,
            Request::AppendFile { .. } => Kind::AppendFile,
            Request::LockFile { .. } => Kind::LockFile,
            Request::UnlockFile { .. } => Kind::UnlockFile,
            Request::RemoveFile { .. } => Kind::RemoveFile,
        }
    }

    /// Target file, for requests that carry one
    pub fn path(&self) -> Option<&ResourcePath> {
        match self {
            Request::OpenFile { path, .. }
            | Request::CloseFile { path }
            | Request::ReadFile { path }
            | Request::WriteFile { path, .. }
            | Request::AppendFile { path, .. }
            | Request::LockFile { path }
            | Request::UnlockFile { path }
            | Request::RemoveFile { path } => Some(path),
            Request::OpenSession | Request::CloseSession | Request::ReadNFiles { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Simple { status: Status },
    WithFiles { status: Status, files: Vec<FileData> },
}

impl Response {
    pub fn ok() -> Self {
        Response::Simple { status: Status::Ok }
    }

    pub fn error(status: Status) -> Self {
        Response::Simple { status }
    }

    /// Successful reply carrying files; collapses to a simple reply when
    /// there is nothing to attach.
    pub fn ok_with_files(files: Vec<FileData>) -> Self {
        if files.is_empty() {
            Self::ok()
        } else {
            Response::WithFiles {
                status: Status::Ok,
                files,
            }
        }
    }

    pub fn kind(&self) -> Kind {
        match self {
            Response::Simple { .. } => Kind::SimpleResponse,
            Response::WithFiles { .. } => Kind::ResponseWithFiles,
        }
    }

    pub fn status(&self) -> Status {
        match self {
            Response::Simple { status } | Response::WithFiles { status, .. } => *status,
        }
    }

    pub fn into_files(self) -> Vec<FileData> {
        match self {
            Response::Simple { .. } => Vec::new(),
            Response::WithFiles { files, .. } => files,
        }
    }
}

impl From<Status> for Response {
    fn from(status: Status) -> Self {
        Response::Simple { status }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Body {
    Request(Request),
    Response(Response),
}

/// A single unit exchanged over the socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    pub body: Body,
}

impl Message {
    pub fn request(request: Request) -> Self {
        Self {
            id: MessageId::new(),
            body: Body::Request(request),
        }
    }

    pub fn response(response: Response) -> Self {
        Self {
            id: MessageId::new(),
            body: Body::Response(response),
        }
    }

    pub fn kind(&self) -> Kind {
        match &self.body {
            Body::Request(r) => r.kind(),
            Body::Response(r) => r.kind(),
        }
    }
}
