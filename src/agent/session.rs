use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::db::ConnectionManager;

/// Per-caller state: working directory and database connection.
///
/// Created by the collaborator on a caller's first instruction and passed by
/// `&mut` into every core call. The core never destroys a session.
pub struct Session {
    id: String,
    /// Working directory relative to the sandbox root (empty = root)
    cwd: PathBuf,
    pub db: ConnectionManager,
}

impl Session {
    pub fn new(id: impl Into<String>, db: ConnectionManager) -> Self {
        Self {
            id: id.into(),
            cwd: PathBuf::new(),
            db,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn cwd(&self) -> &Path {
        &self.cwd
    }

    /// `cwd` must already be checked against the sandbox.
    pub(crate) fn set_cwd(&mut self, cwd: PathBuf) {
        self.cwd = cwd;
    }

    /// Working directory as shown to the caller: `/` for the root.
    pub fn display_cwd(&self) -> String {
        format!("/{}", self.cwd.display())
    }
}

pub type SharedSession = Arc<tokio::sync::Mutex<Session>>;

/// Sessions keyed by caller identity.
///
/// Each session sits behind its own async mutex, so instructions from the
/// same caller run one at a time while different callers proceed
/// independently.
#[derive(Default)]
pub struct SessionStore {
    sessions: Mutex<HashMap<String, SharedSession>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the caller's session, creating it with `create` on first use.
    pub fn get_or_create(&self, id: &str, create: impl FnOnce() -> Session) -> SharedSession {
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        sessions
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(create())))
            .clone()
    }

    pub fn remove(&self, id: &str) -> Option<SharedSession> {
        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id)
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}
