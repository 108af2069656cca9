//! Per-client sessions.
//!
//! The table lock is only held to insert, remove or look up a session; the
//! session's own mutex serializes the operations of one client.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use vcache_ipc::OpenFlags;

use crate::error::SessionError;
use crate::sync::lock;
use crate::ClientId;

type Result<T> = std::result::Result<T, SessionError>;

/// Files a single session may keep open
pub const MAX_OPENED_FILES: usize = 16;

/// Last thing a client did to one of its opened files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileOp {
    Open,
    Read,
    Write,
    Append,
    Lock,
    Unlock,
}

#[derive(Debug)]
struct OpenedFile {
    name: String,
    flags: OpenFlags,
    last_op: FileOp,
}

#[derive(Debug)]
pub struct Session {
    created_at: Instant,
    last_op_at: Instant,
    opened: Vec<OpenedFile>,
}

impl Session {
    fn new() -> Self {
        let now = Instant::now();
        Self {
            created_at: now,
            last_op_at: now,
            opened: Vec::with_capacity(MAX_OPENED_FILES),
        }
    }

    fn find(&self, name: &str) -> Option<&OpenedFile> {
        self.opened.iter().find(|f| f.name == name)
    }

    pub fn is_opened(&self, name: &str) -> bool {
        self.find(name).is_some()
    }

    pub fn ensure_opened(&self, name: &str) -> Result<()> {
        self.find(name).map(drop).ok_or(SessionError::NeverOpened)
    }

    /// Check that `name` can be added to the opened set.
    pub fn check_open(&self, name: &str) -> Result<()> {
        if self.is_opened(name) {
            return Err(SessionError::AlreadyOpened);
        }
        if self.opened.len() >= MAX_OPENED_FILES {
            return Err(SessionError::TooManyOpenFiles);
        }
        Ok(())
    }

    pub fn open(&mut self, name: &str, flags: OpenFlags) -> Result<()> {
        self.check_open(name)?;
        self.opened.push(OpenedFile {
            name: name.to_string(),
            flags,
            last_op: FileOp::Open,
        });
        self.touch();
        Ok(())
    }

    pub fn close(&mut self, name: &str) -> Result<()> {
        let index = self
            .opened
            .iter()
            .position(|f| f.name == name)
            .ok_or(SessionError::NeverOpened)?;
        self.opened.swap_remove(index);
        self.touch();
        Ok(())
    }

    /// Drop `name` from the opened set if present.
    pub fn forget(&mut self, name: &str) {
        self.opened.retain(|f| f.name != name);
    }

    /// A full write is only allowed right after an open with `CREATE | LOCK`.
    pub fn can_write(&self, name: &str) -> Result<bool> {
        let file = self.find(name).ok_or(SessionError::NeverOpened)?;
        Ok(file.flags == OpenFlags::CREATE | OpenFlags::LOCK && file.last_op == FileOp::Open)
    }

    /// Record an operation on `name` (opened or not) and refresh the clock.
    pub fn record(&mut self, name: &str, op: FileOp) {
        if let Some(file) = self.opened.iter_mut().find(|f| f.name == name) {
            file.last_op = op;
        }
        self.touch();
    }

    pub fn touch(&mut self) {
        self.last_op_at = Instant::now();
    }

    pub fn opened_count(&self) -> usize {
        self.opened.len()
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn last_op_at(&self) -> Instant {
        self.last_op_at
    }
}

pub type SessionRef = Arc<Mutex<Session>>;

pub struct SessionTable {
    sessions: Mutex<HashMap<ClientId, SessionRef>>,
    max_clients: usize,
}

impl SessionTable {
    pub fn new(max_clients: usize) -> Self {
        Self {
            sessions: Mutex::new(HashMap::with_capacity(max_clients)),
            max_clients,
        }
    }

    pub fn create(&self, client: ClientId) -> Result<()> {
        let mut sessions = lock(&self.sessions, "session table");
        if sessions.contains_key(&client) {
            return Err(SessionError::AlreadyExists);
        }
        if sessions.len() >= self.max_clients {
            return Err(SessionError::TooManyClients);
        }
        sessions.insert(client, Arc::new(Mutex::new(Session::new())));
        Ok(())
    }

    /// Remove the session. Never waits on the session's own mutex.
    pub fn destroy(&self, client: ClientId) -> Result<()> {
        lock(&self.sessions, "session table")
            .remove(&client)
            .map(drop)
            .ok_or(SessionError::NotExist)
    }

    pub fn get(&self, client: ClientId) -> Result<SessionRef> {
        lock(&self.sessions, "session table")
            .get(&client)
            .cloned()
            .ok_or(SessionError::NotExist)
    }

    pub fn contains(&self, client: ClientId) -> bool {
        lock(&self.sessions, "session table").contains_key(&client)
    }

    pub fn len(&self) -> usize {
        lock(&self.sessions, "session table").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
