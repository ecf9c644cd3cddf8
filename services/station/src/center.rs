//! Session center: process-wide index of user → active sessions.
//!
//! One user may hold several sessions (several devices).  Insertions and
//! removals happen only from session lifecycle code; readers get a
//! cloned snapshot so no I/O ever runs under the lock.

use crate::session::SessionHandle;
use dim_core::Id;
use std::collections::HashMap;
use std::sync::RwLock;
use tracing::debug;

#[derive(Default)]
pub struct SessionCenter {
    map: RwLock<HashMap<Id, Vec<SessionHandle>>>,
}

impl SessionCenter {
    pub fn new() -> SessionCenter {
        SessionCenter::default()
    }

    /// Bind a session under an identifier.  Re-inserting the same session
    /// key is a no-op.
    pub fn insert(&self, id: &Id, handle: SessionHandle) {
        let mut map = self.map.write().unwrap();
        let sessions = map.entry(id.clone()).or_default();
        if sessions.iter().any(|s| s.state.key == handle.state.key) {
            return;
        }
        debug!(user = %id, key = %handle.state.key, "session bound");
        sessions.push(handle);
    }

    /// Remove one session (by key) from an identifier's set.
    pub fn remove(&self, id: &Id, session_key: &str) {
        let mut map = self.map.write().unwrap();
        if let Some(sessions) = map.get_mut(id) {
            sessions.retain(|s| s.state.key != session_key);
            if sessions.is_empty() {
                map.remove(id);
            }
        }
    }

    /// All sessions bound to an identifier (snapshot).
    pub fn sessions(&self, id: &Id) -> Vec<SessionHandle> {
        self.map
            .read()
            .unwrap()
            .get(id)
            .cloned()
            .unwrap_or_default()
    }

    /// Active sessions only.
    pub fn active_sessions(&self, id: &Id) -> Vec<SessionHandle> {
        self.sessions(id)
            .into_iter()
            .filter(|s| s.state.is_active())
            .collect()
    }

    pub fn is_online(&self, id: &Id) -> bool {
        !self.active_sessions(id).is_empty()
    }

    /// Every identifier with at least one bound session (snapshot).
    pub fn all_users(&self) -> Vec<Id> {
        self.map.read().unwrap().keys().cloned().collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
