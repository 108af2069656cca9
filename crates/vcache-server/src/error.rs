//! Error types for the server.
//!
//! Store and session errors are per-request: they map onto a wire
//! [`Status`] and never take down a worker. [`ServerError`] covers startup
//! and the acceptor/dispatcher loops.

use std::io;
use std::path::PathBuf;

use vcache_ipc::Status;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("file not found")]
    NotFound,
    #[error("file already exists")]
    AlreadyExists,
    #[error("file is locked by another client")]
    NotPermitted,
    #[error("not enough unlocked space to reclaim")]
    OutOfMemory,
    #[error("no slot can be freed")]
    OutOfSlots,
    #[error("store is shutting down")]
    Unavailable,
}

impl From<StoreError> for Status {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound => Status::NotFound,
            // open-file with CREATE on a stored file
            StoreError::AlreadyExists => Status::AlreadyExists,
            StoreError::NotPermitted => Status::NotPermitted,
            StoreError::OutOfMemory => Status::OutOfMemory,
            StoreError::OutOfSlots => Status::OutOfSlots,
            StoreError::Unavailable => Status::Unavailable,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("session already exists")]
    AlreadyExists,
    #[error("session does not exist")]
    NotExist,
    #[error("file already opened")]
    AlreadyOpened,
    #[error("file never opened")]
    NeverOpened,
    #[error("too many opened files")]
    TooManyOpenFiles,
    #[error("too many clients")]
    TooManyClients,
}

impl From<SessionError> for Status {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::AlreadyExists => Status::AlreadyExists,
            SessionError::NotExist => Status::NotExist,
            SessionError::AlreadyOpened => Status::AlreadyOpened,
            SessionError::NeverOpened => Status::NeverOpened,
            SessionError::TooManyOpenFiles => Status::OutOfMemory,
            SessionError::TooManyClients => Status::TooManyClients,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("cannot bind {}: {source}", path.display())]
    Bind { path: PathBuf, source: io::Error },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("system call failed: {0}")]
    Sys(#[from] nix::Error),

    #[error("{0} thread panicked")]
    ThreadPanicked(&'static str),
}

pub type Result<T> = std::result::Result<T, ServerError>;
