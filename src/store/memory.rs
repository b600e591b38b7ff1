//! In-Memory Coordination Store
//!
//! A [`DataTree`] plus the session table that gives ephemeral nodes
//! their lifetime. Shared by every local backend and by the network
//! server, so clones are cheap handles onto the same state.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use super::tree::{DataTree, Fired, Watcher};
use super::types::{Request, Response};
use crate::error::StoreError;

/// A live session
struct Session {
    /// Authenticated identities, as `(scheme, id)`
    auth: Vec<(String, String)>,
    /// Idle timeout, `None` for sessions that only end explicitly
    timeout: Option<Duration>,
    last_seen: Instant,
}

struct StoreInner {
    tree: DataTree,
    sessions: HashMap<u64, Session>,
    next_session: u64,
}

/// Shared in-memory coordination store
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Mutex<StoreInner>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        // Random high bits keep session ids from different store
        // instances apart in logs
        let base = (rand::random::<u32>() as u64) << 24;
        Self {
            inner: Arc::new(Mutex::new(StoreInner {
                tree: DataTree::new(),
                sessions: HashMap::new(),
                next_session: base + 1,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, StoreInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Open a new session
    pub fn open_session(&self, timeout: Option<Duration>, auth: Vec<(String, String)>) -> u64 {
        let mut inner = self.lock();
        let id = inner.next_session;
        inner.next_session += 1;
        inner.sessions.insert(
            id,
            Session {
                auth,
                timeout,
                last_seen: Instant::now(),
            },
        );
        tracing::debug!(session = id, "session opened");
        id
    }

    /// Record activity on a session
    pub fn touch(&self, session: u64) -> Result<(), StoreError> {
        let mut inner = self.lock();
        match inner.sessions.get_mut(&session) {
            Some(s) => {
                s.last_seen = Instant::now();
                Ok(())
            }
            None => Err(StoreError::SessionExpired),
        }
    }

    /// Check if a session is still alive
    pub fn is_alive(&self, session: u64) -> bool {
        self.lock().sessions.contains_key(&session)
    }

    /// Idle timeout of a session
    pub fn session_timeout(&self, session: u64) -> Option<Duration> {
        self.lock().sessions.get(&session).and_then(|s| s.timeout)
    }

    /// End a session on request of its owner
    pub fn close_session(&self, session: u64) -> bool {
        let ended = self.end_session(session);
        if ended {
            tracing::debug!(session, "session closed");
        }
        ended
    }

    /// End a session because its owner went quiet
    pub fn expire_session(&self, session: u64) -> bool {
        let ended = self.end_session(session);
        if ended {
            tracing::info!(session, "session expired");
        }
        ended
    }

    /// Expire every session idle for longer than its timeout
    pub fn expire_idle(&self) -> Vec<u64> {
        let idle: Vec<u64> = {
            let inner = self.lock();
            inner
                .sessions
                .iter()
                .filter(|(_, s)| matches!(s.timeout, Some(t) if s.last_seen.elapsed() > t))
                .map(|(id, _)| *id)
                .collect()
        };
        idle.into_iter().filter(|id| self.expire_session(*id)).collect()
    }

    fn end_session(&self, session: u64) -> bool {
        let mut fired = Fired::default();
        {
            let mut inner = self.lock();
            if inner.sessions.remove(&session).is_none() {
                return false;
            }
            inner.tree.remove_watches(session);
            let removed = inner.tree.remove_ephemerals(session, &mut fired);
            if !removed.is_empty() {
                tracing::debug!(session, count = removed.len(), "removed ephemeral nodes");
            }
        }
        fired.deliver();
        true
    }

    /// Apply a request for a session, arming `watcher` if the read succeeds
    pub fn apply(
        &self,
        session: u64,
        request: Request,
        watcher: Option<Watcher>,
    ) -> Result<Response, StoreError> {
        let mut fired = Fired::default();
        let result = {
            let mut inner = self.lock();
            let inner = &mut *inner;
            let state = inner
                .sessions
                .get_mut(&session)
                .ok_or(StoreError::SessionExpired)?;
            state.last_seen = Instant::now();

            let watch = request.watch_type();
            let path = request.path().to_string();
            let result = inner.tree.apply(session, &state.auth, request, &mut fired);

            if let (Ok(_), Some(watch), Some(watcher)) = (&result, watch, watcher) {
                inner.tree.add_watch(session, &path, watch, watcher);
            }
            result
        };
        fired.deliver();
        result
    }

    /// Number of nodes, root included
    pub fn node_count(&self) -> usize {
        self.lock().tree.len()
    }

    /// Number of armed watches across all sessions
    pub fn watch_count(&self) -> usize {
        self.lock().tree.watch_count()
    }

    /// Number of live sessions
    pub fn session_count(&self) -> usize {
        self.lock().sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::types::{Acl, CreateMode};

    fn create(store: &MemoryStore, session: u64, path: &str, mode: CreateMode) -> String {
        match store
            .apply(
                session,
                Request::Create {
                    path: path.to_string(),
                    data: Vec::new(),
                    acl: Acl::open_unsafe(),
                    mode,
                },
                None,
            )
            .unwrap()
        {
            Response::Created { path } => path,
            other => panic!("unexpected response {other:?}"),
        }
    }

    #[test]
    fn test_unknown_session_is_expired() {
        let store = MemoryStore::new();
        let err = store
            .apply(42, Request::Exists { path: "/".into() }, None)
            .unwrap_err();
        assert_eq!(err, StoreError::SessionExpired);
    }

    #[test]
    fn test_close_session_removes_ephemerals() {
        let store = MemoryStore::new();
        let a = store.open_session(None, Vec::new());
        let b = store.open_session(None, Vec::new());

        create(&store, a, "/e", CreateMode::Persistent);
        create(&store, a, "/e/n_", CreateMode::EphemeralSequential);
        create(&store, b, "/e/n_", CreateMode::EphemeralSequential);
        assert_eq!(store.node_count(), 4);

        assert!(store.close_session(a));
        assert!(!store.close_session(a));
        assert_eq!(store.node_count(), 3);
        assert!(store.is_alive(b));
    }

    #[test]
    fn test_expire_idle() {
        let store = MemoryStore::new();
        let short = store.open_session(Some(Duration::from_millis(10)), Vec::new());
        let forever = store.open_session(None, Vec::new());

        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(store.expire_idle(), vec![short]);
        assert!(!store.is_alive(short));
        assert!(store.is_alive(forever));
    }

    #[test]
    fn test_watch_only_armed_on_success() {
        let store = MemoryStore::new();
        let s = store.open_session(None, Vec::new());

        let result = store.apply(
            s,
            Request::GetChildren { path: "/missing".into() },
            Some(Box::new(|_| {})),
        );
        assert!(matches!(result, Err(StoreError::NoNode(_))));
        assert_eq!(store.watch_count(), 0);

        // Exists arms a watch even when the node is absent
        store
            .apply(s, Request::Exists { path: "/missing".into() }, Some(Box::new(|_| {})))
            .unwrap();
        assert_eq!(store.watch_count(), 1);

        store.close_session(s);
        assert_eq!(store.watch_count(), 0);
    }
}
