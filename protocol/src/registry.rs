//! # Session Registry
//!
//! Process-local table of sessions in flight, shared by every worker of a
//! node. Drivers hold a [`SessionGuard`] for the lifetime of a session;
//! dropping it (on success, error or panic) removes the entry.
//!
//! The registry also hands out seller session ids. It is seeded from the
//! record store so ids keep increasing across restarts.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::debug;

use crate::mode::TransactionKind;
use crate::transaction::{RecordStore, Role, StoreError};

/// One active session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ActiveSession {
    pub role: Role,
    /// Record key: the hex session id for sellers, `<seller>/<id>` for buyers.
    pub key: String,
    pub kind: TransactionKind,
    /// Counterparty chain address.
    pub peer: String,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug)]
pub struct SessionRegistry {
    next_id: AtomicU64,
    active: Mutex<HashMap<(Role, String), ActiveSession>>,
}

impl SessionRegistry {
    /// Registry whose first seller session id is `first_id`.
    pub fn new(first_id: u64) -> Arc<Self> {
        Arc::new(Self {
            next_id: AtomicU64::new(first_id.max(1)),
            active: Mutex::new(HashMap::new()),
        })
    }

    /// Registry continuing after the highest seller id in `store`.
    pub fn from_store(store: &RecordStore) -> Result<Arc<Self>, StoreError> {
        let next = store.max_seller_session_id()?.map_or(1, |max| max + 1);
        Ok(Self::new(next))
    }

    /// Assign a fresh seller session id.
    pub fn allocate_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    pub fn register(self: &Arc<Self>, entry: ActiveSession) -> SessionGuard {
        let key = (entry.role, entry.key.clone());
        debug!(role = %entry.role, session = %entry.key, "session registered");
        self.active.lock().insert(key.clone(), entry);
        SessionGuard {
            registry: Arc::clone(self),
            key,
        }
    }

    pub fn get(&self, role: Role, key: &str) -> Option<ActiveSession> {
        self.active.lock().get(&(role, key.to_string())).cloned()
    }

    /// Snapshot of active sessions, oldest first.
    pub fn active(&self) -> Vec<ActiveSession> {
        let mut list: Vec<_> = self.active.lock().values().cloned().collect();
        list.sort_by_key(|s| s.started_at);
        list
    }

    pub fn count(&self, role: Role) -> usize {
        self.active.lock().keys().filter(|(r, _)| *r == role).count()
    }

    pub fn len(&self) -> usize {
        self.active.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.lock().is_empty()
    }
}

/// Removes its session from the registry when dropped.
#[derive(Debug)]
pub struct SessionGuard {
    registry: Arc<SessionRegistry>,
    key: (Role, String),
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.registry.active.lock().remove(&self.key);
        debug!(role = %self.key.0, session = %self.key.1, "session released");
    }
}
