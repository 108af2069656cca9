//! Request handler: runs one decoded request against sessions and the store.

use std::sync::{Arc, MutexGuard};

use vcache_config::{log_server_debug, log_server_info, log_worker_debug};
use vcache_ipc::{
    OpenFlags, Request, ResourcePath, Response, Status, CLIENT_MAX_FRAME, FILES_RESPONSE_HEADER_SIZE,
};

use crate::error::{SessionError, StoreError};
use crate::session::{FileOp, Session, SessionTable};
use crate::store::FileStore;
use crate::sync::lock;
use crate::ClientId;

/// Room for files in a read-N reply, keeping it within what clients accept
const MAX_REPLY: usize = CLIENT_MAX_FRAME - FILES_RESPONSE_HEADER_SIZE;

/// Why a request failed
enum Failure {
    Session(SessionError),
    Store(StoreError),
}

impl From<SessionError> for Failure {
    fn from(err: SessionError) -> Self {
        Failure::Session(err)
    }
}

impl From<StoreError> for Failure {
    fn from(err: StoreError) -> Self {
        Failure::Store(err)
    }
}

impl From<Failure> for Status {
    fn from(failure: Failure) -> Self {
        match failure {
            Failure::Session(err) => err.into(),
            Failure::Store(err) => err.into(),
        }
    }
}

type Outcome = Result<Response, Failure>;

/// Shared by all workers (and the dispatcher, for disconnect cleanup)
#[derive(Clone)]
pub struct RequestHandler {
    store: Arc<FileStore>,
    sessions: Arc<SessionTable>,
}

impl RequestHandler {
    pub fn new(store: Arc<FileStore>, sessions: Arc<SessionTable>) -> Self {
        Self { store, sessions }
    }

    pub fn store(&self) -> &FileStore {
        &self.store
    }

    pub fn sessions(&self) -> &SessionTable {
        &self.sessions
    }

    /// Handle incoming request. Failures become a status reply.
    pub fn handle(&self, client: ClientId, request: Request) -> Response {
        let kind = request.kind();
        let outcome = match request {
            Request::OpenSession => self.open_session(client),
            Request::CloseSession => self.close_session(client),
            Request::OpenFile { path, flags } => self.open_file(client, &path, flags),
            Request::CloseFile { path } => self.close_file(client, &path),
            Request::ReadFile { path } => self.read_file(client, &path),
            Request::ReadNFiles { n } => self.read_n_files(client, n),
            Request::WriteFile { path, content } => self.write_file(client, &path, content),
            Request::AppendFile { path, content } => self.append_file(client, &path, &content),
            Request::LockFile { path } => self.lock_file(client, &path),
            Request::UnlockFile { path } => self.unlock_file(client, &path),
            Request::RemoveFile { path } => self.remove_file(client, &path),
        };

        match outcome {
            Ok(response) => response,
            Err(failure) => {
                let status = Status::from(failure);
                log_worker_debug!(
                    "Request refused",
                    client = client.0,
                    kind = format!("{:?}", kind),
                    status = status.to_string(),
                );
                Response::error(status)
            }
        }
    }

    /// Release everything a vanished client held.
    pub fn disconnect(&self, client: ClientId) {
        if self.sessions.destroy(client).is_ok() {
            log_server_debug!("Session dropped on disconnect", client = client.0);
        }
        self.store.release_client(client);
    }

    fn with_session<T>(
        &self,
        client: ClientId,
        f: impl FnOnce(&mut MutexGuard<'_, Session>) -> Result<T, Failure>,
    ) -> Result<T, Failure> {
        let session = self.sessions.get(client)?;
        let mut guard = lock(&session, "session");
        let result = f(&mut guard);
        guard.touch();
        result
    }

    // ========================================================================
    // Sessions
    // ========================================================================

    fn open_session(&self, client: ClientId) -> Outcome {
        self.sessions.create(client)?;
        log_server_info!("Session opened", client = client.0, sessions = self.sessions.len());
        Ok(Response::ok())
    }

    fn close_session(&self, client: ClientId) -> Outcome {
        let age = self.with_session(client, |session| Ok(session.created_at().elapsed()))?;
        self.sessions.destroy(client)?;
        let released = self.store.release_client(client);
        log_server_info!(
            "Session closed",
            client = client.0,
            age_ms = age.as_millis() as u64,
            locks_released = released,
        );
        Ok(Response::ok())
    }

    // ========================================================================
    // Opened files
    // ========================================================================

    fn open_file(&self, client: ClientId, path: &ResourcePath, flags: OpenFlags) -> Outcome {
        let name = path.absolute();
        let wants_lock = flags.contains(OpenFlags::LOCK);

        let evicted = self.with_session(client, |session| {
            session.check_open(name)?;

            // an existing file is never re-created, so CREATE cannot be used
            // to gain write permission on it
            let evicted = if flags.contains(OpenFlags::CREATE) {
                self.store.create(client, path, wants_lock)?
            } else {
                if !self.store.contains(name) {
                    return Err(StoreError::NotFound.into());
                }
                if wants_lock {
                    self.store.lock(client, name)?;
                }
                Vec::new()
            };
            session.open(name, flags)?;
            Ok(evicted)
        })?;

        self.drop_if_orphaned(client, wants_lock)?;
        Ok(Response::ok_with_files(evicted))
    }

    fn close_file(&self, client: ClientId, path: &ResourcePath) -> Outcome {
        self.with_session(client, |session| Ok(session.close(path.absolute())?))?;
        Ok(Response::ok())
    }

    fn read_file(&self, client: ClientId, path: &ResourcePath) -> Outcome {
        let name = path.absolute();
        let file = self.with_session(client, |session| {
            session.ensure_opened(name)?;
            let file = self.store.read(client, name)?;
            session.record(name, FileOp::Read);
            Ok(file)
        })?;
        Ok(Response::ok_with_files(vec![file]))
    }

    fn read_n_files(&self, client: ClientId, n: u32) -> Outcome {
        let files =
            self.with_session(client, |_| Ok(self.store.read_n(client, n as usize, MAX_REPLY)))?;
        log_worker_debug!("Read N files", client = client.0, requested = n, returned = files.len());
        Ok(Response::ok_with_files(files))
    }

    fn write_file(&self, client: ClientId, path: &ResourcePath, content: Vec<u8>) -> Outcome {
        let name = path.absolute();
        let evicted = self.with_session(client, |session| {
            if !session.can_write(name)? {
                return Err(StoreError::NotPermitted.into());
            }
            let evicted = self.store.write(client, name, content)?;
            session.record(name, FileOp::Write);
            Ok(evicted)
        })?;
        Ok(Response::ok_with_files(evicted))
    }

    fn append_file(&self, client: ClientId, path: &ResourcePath, content: &[u8]) -> Outcome {
        let name = path.absolute();
        let evicted = self.with_session(client, |session| {
            session.ensure_opened(name)?;
            let evicted = self.store.append(client, name, content)?;
            session.record(name, FileOp::Append);
            Ok(evicted)
        })?;
        Ok(Response::ok_with_files(evicted))
    }

    // ========================================================================
    // Locks
    // ========================================================================

    fn lock_file(&self, client: ClientId, path: &ResourcePath) -> Outcome {
        let name = path.absolute();
        self.with_session(client, |session| {
            self.store.lock(client, name)?;
            session.record(name, FileOp::Lock);
            Ok(())
        })?;
        self.drop_if_orphaned(client, true)?;
        Ok(Response::ok())
    }

    fn unlock_file(&self, client: ClientId, path: &ResourcePath) -> Outcome {
        let name = path.absolute();
        self.with_session(client, |session| {
            self.store.unlock(client, name)?;
            session.record(name, FileOp::Unlock);
            Ok(())
        })?;
        Ok(Response::ok())
    }

    fn remove_file(&self, client: ClientId, path: &ResourcePath) -> Outcome {
        let name = path.absolute();
        self.with_session(client, |session| {
            self.store.remove(client, name)?;
            session.forget(name);
            Ok(())
        })?;
        Ok(Response::ok())
    }

    /// A lock may be granted after a long wait, by which time the client
    /// may have disconnected; do not leave it holding anything.
    fn drop_if_orphaned(&self, client: ClientId, acquired_lock: bool) -> Result<(), Failure> {
        if acquired_lock && !self.sessions.contains(client) {
            self.store.release_client(client);
            return Err(SessionError::NotExist.into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: ClientId = ClientId(1);
    const B: ClientId = ClientId(2);

    fn handler(bytes: u64, slots: usize) -> RequestHandler {
        RequestHandler::new(
            Arc::new(FileStore::new(bytes, slots, 16)),
            Arc::new(SessionTable::new(8)),
        )
    }

    fn path(name: &str) -> ResourcePath {
        ResourcePath::new(format!("/h/{}", name), name)
    }

    fn status(response: &Response) -> Status {
        response.status()
    }

    fn open(h: &RequestHandler, client: ClientId, name: &str, flags: OpenFlags) -> Response {
        h.handle(
            client,
            Request::OpenFile {
                path: path(name),
                flags,
            },
        )
    }

    #[test]
    fn test_requests_need_a_session() {
        let h = handler(1024, 4);
        let response = h.handle(A, Request::ReadNFiles { n: 0 });
        assert_eq!(status(&response), Status::NotExist);
        assert_eq!(status(&h.handle(A, Request::CloseSession)), Status::NotExist);
        assert_eq!(status(&h.handle(A, Request::OpenSession)), Status::Ok);
        assert_eq!(status(&h.handle(A, Request::OpenSession)), Status::AlreadyExists);
    }

    #[test]
    fn test_write_read_roundtrip_between_clients() {
        let h = handler(1024, 4);
        h.handle(A, Request::OpenSession);
        h.handle(B, Request::OpenSession);

        let content = vec![7u8; 100];
        assert!(open(&h, A, "f.txt", OpenFlags::CREATE | OpenFlags::LOCK).status().is_ok());
        let response = h.handle(
            A,
            Request::WriteFile {
                path: path("f.txt"),
                content: content.clone(),
            },
        );
        assert_eq!(status(&response), Status::Ok);
        assert!(h.handle(A, Request::UnlockFile { path: path("f.txt") }).status().is_ok());

        assert!(open(&h, B, "f.txt", OpenFlags::LOCK).status().is_ok());
        let files = h
            .handle(B, Request::ReadFile { path: path("f.txt") })
            .into_files();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].content, content);
    }

    #[test]
    fn test_write_needs_create_lock_open() {
        let h = handler(1024, 4);
        h.handle(A, Request::OpenSession);
        let write = |content: &[u8]| {
            h.handle(
                A,
                Request::WriteFile {
                    path: path("f"),
                    content: content.to_vec(),
                },
            )
        };
        assert_eq!(status(&write(b"x")), Status::NeverOpened);

        open(&h, A, "f", OpenFlags::CREATE | OpenFlags::LOCK);
        assert_eq!(status(&write(b"x")), Status::Ok);
        // a second full write is refused; appends remain allowed
        assert_eq!(status(&write(b"y")), Status::NotPermitted);
        let append = h.handle(
            A,
            Request::AppendFile {
                path: path("f"),
                content: b"z".to_vec(),
            },
        );
        assert_eq!(status(&append), Status::Ok);
    }

    #[test]
    fn test_open_rules() {
        let h = handler(1024, 4);
        h.handle(A, Request::OpenSession);
        assert_eq!(status(&open(&h, A, "missing", OpenFlags::empty())), Status::NotFound);
        assert_eq!(status(&open(&h, A, "f", OpenFlags::CREATE)), Status::Ok);
        assert_eq!(status(&open(&h, A, "f", OpenFlags::CREATE)), Status::AlreadyOpened);
        h.handle(A, Request::CloseFile { path: path("f") });
        assert_eq!(status(&open(&h, A, "f", OpenFlags::CREATE)), Status::AlreadyExists);
        assert_eq!(
            status(&h.handle(A, Request::CloseFile { path: path("f") })),
            Status::NeverOpened
        );
        assert_eq!(
            status(&h.handle(A, Request::CloseFile { path: path("g") })),
            Status::NeverOpened
        );
        assert_eq!(
            status(&h.handle(A, Request::ReadFile { path: path("g") })),
            Status::NeverOpened
        );
    }

    #[test]
    fn test_create_of_existing_file_cannot_overwrite_it() {
        let h = handler(1024, 4);
        h.handle(A, Request::OpenSession);
        h.handle(B, Request::OpenSession);
        open(&h, A, "f", OpenFlags::CREATE | OpenFlags::LOCK);
        h.handle(
            A,
            Request::WriteFile {
                path: path("f"),
                content: b"original".to_vec(),
            },
        );
        h.handle(A, Request::UnlockFile { path: path("f") });
        h.handle(A, Request::CloseFile { path: path("f") });

        let reopened = open(&h, B, "f", OpenFlags::CREATE | OpenFlags::LOCK);
        assert_eq!(status(&reopened), Status::AlreadyExists);
        let write = h.handle(
            B,
            Request::WriteFile {
                path: path("f"),
                content: b"clobbered".to_vec(),
            },
        );
        assert_eq!(status(&write), Status::NeverOpened);
        // the refused open took no lock either
        assert!(open(&h, A, "f", OpenFlags::LOCK).status().is_ok());
        let files = h.handle(A, Request::ReadFile { path: path("f") }).into_files();
        assert_eq!(files[0].content, b"original");
    }

    #[test]
    fn test_read_all_of_a_large_store_fits_one_client_frame() {
        use vcache_ipc::frame::{decode, encode, SIZE_PREFIX};
        use vcache_ipc::{Body, Compression, Message};

        let h = handler(20 * 1024 * 1024, 8);
        h.handle(A, Request::OpenSession);
        for name in ["a", "b", "c"] {
            open(&h, A, name, OpenFlags::CREATE | OpenFlags::LOCK);
            h.handle(
                A,
                Request::WriteFile {
                    path: path(name),
                    content: vec![0x5A; 6 * 1024 * 1024],
                },
            );
            h.handle(A, Request::UnlockFile { path: path(name) });
        }

        let response = h.handle(A, Request::ReadNFiles { n: 0 });
        assert_eq!(status(&response), Status::Ok);
        let frame = encode(&Message::response(response), Compression::Disabled).unwrap();
        assert!(frame.len() - SIZE_PREFIX <= CLIENT_MAX_FRAME);
        match decode(&frame[SIZE_PREFIX..]).unwrap().body {
            Body::Response(Response::WithFiles { files, .. }) => {
                let names: Vec<_> = files.iter().map(|f| f.path.relative()).collect();
                assert_eq!(names, vec!["c", "b"]);
            }
            other => panic!("unexpected body {:?}", other),
        }
    }

    #[test]
    fn test_remove_without_lock_is_refused() {
        let h = handler(1024, 4);
        h.handle(A, Request::OpenSession);
        h.handle(B, Request::OpenSession);
        open(&h, A, "f", OpenFlags::CREATE);

        let response = h.handle(B, Request::RemoveFile { path: path("f") });
        assert_eq!(status(&response), Status::NotPermitted);
        assert!(h.store().contains(path("f").absolute()));

        assert!(h.handle(B, Request::LockFile { path: path("f") }).status().is_ok());
        assert!(h.handle(B, Request::RemoveFile { path: path("f") }).status().is_ok());
        assert!(!h.store().contains(path("f").absolute()));
    }

    #[test]
    fn test_create_in_full_store_returns_evicted() {
        let h = handler(1024, 2);
        h.handle(A, Request::OpenSession);
        for name in ["a", "b"] {
            open(&h, A, name, OpenFlags::CREATE | OpenFlags::LOCK);
            h.handle(
                A,
                Request::WriteFile {
                    path: path(name),
                    content: name.as_bytes().to_vec(),
                },
            );
            h.handle(A, Request::UnlockFile { path: path(name) });
        }

        let evicted = open(&h, A, "c", OpenFlags::CREATE | OpenFlags::LOCK).into_files();
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].path.relative(), "a");
        assert_eq!(evicted[0].content, b"a");
    }

    #[test]
    fn test_disconnect_releases_locks() {
        let h = handler(1024, 4);
        h.handle(A, Request::OpenSession);
        h.handle(B, Request::OpenSession);
        open(&h, A, "f", OpenFlags::CREATE | OpenFlags::LOCK);

        h.disconnect(A);
        assert!(!h.sessions().contains(A));
        assert!(h.handle(B, Request::LockFile { path: path("f") }).status().is_ok());
    }

    #[test]
    fn test_session_opened_limit_is_out_of_memory() {
        let h = handler(1 << 20, 64);
        h.handle(A, Request::OpenSession);
        for i in 0..crate::session::MAX_OPENED_FILES {
            let response = open(&h, A, &format!("f{}", i), OpenFlags::CREATE);
            assert!(response.status().is_ok());
        }
        let response = open(&h, A, "overflow", OpenFlags::CREATE);
        assert_eq!(status(&response), Status::OutOfMemory);
        assert!(!h.store().contains(path("overflow").absolute()));
    }
}
