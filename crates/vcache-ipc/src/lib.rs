//! Wire protocol and blocking client for the Velo Cache file server.

pub mod client;
pub mod compress;
pub mod frame;
pub mod message;

pub use client::{BytesInfo, Client, ClientError};
pub use frame::{
    attached_file_size, read_frame, write_frame, Compression, WireError, FILES_RESPONSE_HEADER_SIZE,
};
pub use message::{
    Body, FileData, Kind, Message, MessageId, OpenFlags, Request, ResourcePath, Response, Status,
};

/// Default server socket path
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/vcache.sock";

/// Default server receive buffer, in bytes
pub const DEFAULT_MAX_FRAME: usize = 4096;

/// Largest reply a client accepts (16MB)
pub const CLIENT_MAX_FRAME: usize = 16 * 1024 * 1024;

/// Default server socket path
pub fn default_socket_path() -> &'static str {
    DEFAULT_SOCKET_PATH
}

/// Check if a server socket exists at the default path
pub fn is_server_running() -> bool {
    std::path::Path::new(default_socket_path()).exists()
}
