use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

/// SessionId identifies one accepted connection for its whole life
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl SessionId {
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// SessionKind is the listener protocol a session arrived on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    Socks5,
    Http,
}

/// SessionState is where a session is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    AwaitingHandshake,
    AwaitingRequest,
    Relaying,
    Closed,
}

/// SessionInfo is the registry's view of a live session
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub peer: SocketAddr,
    pub kind: SessionKind,
    pub state: SessionState,
    pub target: Option<String>,
    pub started: Instant,
}

/// ConnectionRegistry tracks live sessions by id. The lock is only held
/// for the map operation itself, never across I/O
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    sessions: Mutex<HashMap<SessionId, SessionInfo>>,
    next_id: AtomicU64,
}

/// ConnectionRegistry implementation block
impl ConnectionRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// register adds a session and returns the guard that removes it again
    pub fn register(self: &Arc<Self>, peer: SocketAddr, kind: SessionKind) -> SessionGuard {
        let id = SessionId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);

        let info = SessionInfo {
            peer,
            kind,
            state: match kind {
                SessionKind::Socks5 => SessionState::AwaitingHandshake,
                SessionKind::Http => SessionState::AwaitingRequest,
            },
            target: None,
            started: Instant::now(),
        };

        self.lock().insert(id, info);

        SessionGuard {
            id,
            registry: Arc::clone(self),
        }
    }

    pub fn get(&self, id: SessionId) -> Option<SessionInfo> {
        self.lock().get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// snapshot copies out every live session, ordered by id
    pub fn snapshot(&self) -> Vec<(SessionId, SessionInfo)> {
        let mut sessions: Vec<_> = self
            .lock()
            .iter()
            .map(|(id, info)| (*id, info.clone()))
            .collect();
        sessions.sort_by_key(|(id, _)| *id);
        sessions
    }

    fn update(&self, id: SessionId, f: impl FnOnce(&mut SessionInfo)) {
        if let Some(info) = self.lock().get_mut(&id) {
            f(info);
        }
    }

    fn remove(&self, id: SessionId) -> Option<SessionInfo> {
        self.lock().remove(&id)
    }

    // A panic elsewhere cannot leave the map half-updated, so a poisoned
    // lock is still usable
    fn lock(&self) -> MutexGuard<'_, HashMap<SessionId, SessionInfo>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// SessionGuard owns a registry entry; dropping it deregisters the session
#[derive(Debug)]
pub struct SessionGuard {
    id: SessionId,
    registry: Arc<ConnectionRegistry>,
}

impl SessionGuard {
    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn set_state(&self, state: SessionState) {
        self.registry.update(self.id, |info| info.state = state);
    }

    pub fn set_target(&self, target: impl Into<String>) {
        let target = target.into();
        self.registry.update(self.id, |info| info.target = Some(target));
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.registry.remove(self.id);
    }
}
