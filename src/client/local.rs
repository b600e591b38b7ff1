//! Local Backend
//!
//! In-process [`Backend`] bound to one session of a shared
//! [`MemoryStore`]. Exposes fault-injection controls so embedders and
//! tests can suspend, partition or expire the session on demand.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::backend::{is_write, Backend, Callback, StateHandler, Watcher};
use crate::error::StoreError;
use crate::store::{ConnectionState, MemoryStore, Request};

struct LocalState {
    /// Current store session, `None` after `expire` until the next `reconnect`
    session: Option<u64>,
    last_session: u64,
    suspended: bool,
    partitioned: bool,
    read_only: bool,
    closed: bool,
    current: ConnectionState,
    handler: Option<StateHandler>,
}

/// In-process backend over a [`MemoryStore`]
pub struct LocalBackend {
    store: MemoryStore,
    auth: Vec<(String, String)>,
    state: Mutex<LocalState>,
}

impl LocalBackend {
    /// Open a session with no identities
    pub fn new(store: &MemoryStore) -> Arc<Self> {
        Self::with_auth(store, Vec::new())
    }

    /// Open a session authenticated as the given `(scheme, id)` pairs
    pub fn with_auth(store: &MemoryStore, auth: Vec<(String, String)>) -> Arc<Self> {
        let session = store.open_session(None, auth.clone());
        Arc::new(Self {
            store: store.clone(),
            auth,
            state: Mutex::new(LocalState {
                session: Some(session),
                last_session: session,
                suspended: false,
                partitioned: false,
                read_only: false,
                closed: false,
                current: ConnectionState::Connected,
                handler: None,
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, LocalState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Update state under the lock, then notify the handler outside it
    fn transition(&self, f: impl FnOnce(&mut LocalState) -> Option<ConnectionState>) {
        let notify = {
            let mut state = self.lock();
            if state.closed {
                return;
            }
            match f(&mut state) {
                Some(next) => {
                    state.current = next;
                    state.handler.clone().map(|h| (h, next))
                }
                None => None,
            }
        };
        if let Some((handler, next)) = notify {
            handler(next);
        }
    }

    /// Drop the link: requests fail with `ConnectionLoss`, `Suspended` is signalled
    pub fn suspend(&self) {
        self.transition(|state| {
            state.suspended = true;
            Some(ConnectionState::Suspended)
        });
    }

    /// Restore the link, opening a fresh session if the old one expired
    pub fn reconnect(&self) {
        let store = self.store.clone();
        let auth = self.auth.clone();
        self.transition(move |state| {
            state.suspended = false;
            state.read_only = false;
            if state.session.is_none() {
                let session = store.open_session(None, auth);
                state.session = Some(session);
                state.last_session = session;
            }
            Some(ConnectionState::Reconnected)
        });
    }

    /// Expire the session in the store and signal `Lost`
    pub fn expire(&self) {
        let expired = {
            let mut state = self.lock();
            if state.closed {
                return;
            }
            state.suspended = true;
            state.session.take()
        };
        if let Some(session) = expired {
            self.store.expire_session(session);
        }
        self.transition(|_| Some(ConnectionState::Lost));
    }

    /// Fail every request with `ConnectionLoss` without signalling anything
    pub fn partition(&self) {
        self.transition(|state| {
            state.partitioned = true;
            None
        });
    }

    /// Undo [`partition`](Self::partition)
    pub fn heal(&self) {
        self.transition(|state| {
            state.partitioned = false;
            None
        });
    }

    /// Enter or leave read-only mode, where writes fail with `ConnectionLoss`
    pub fn set_read_only(&self, read_only: bool) {
        self.transition(|state| {
            if state.read_only == read_only {
                return None;
            }
            state.read_only = read_only;
            Some(if read_only {
                ConnectionState::ReadOnly
            } else {
                ConnectionState::Reconnected
            })
        });
    }

    /// Store this backend talks to
    pub fn store(&self) -> &MemoryStore {
        &self.store
    }
}

impl Backend for LocalBackend {
    fn submit(&self, request: Request, watcher: Option<Watcher>, callback: Callback) {
        let session = {
            let state = self.lock();
            if state.closed {
                Err(StoreError::Closed)
            } else if state.suspended || state.partitioned {
                Err(StoreError::ConnectionLoss)
            } else if state.read_only && is_write(&request) {
                Err(StoreError::ConnectionLoss)
            } else {
                state.session.ok_or(StoreError::ConnectionLoss)
            }
        };

        let result = session.and_then(|session| self.store.apply(session, request, watcher));
        callback(result);
    }

    fn attach(&self, handler: StateHandler) {
        let current = {
            let mut state = self.lock();
            state.handler = Some(handler.clone());
            state.current
        };
        handler(current);
    }

    fn session_id(&self) -> u64 {
        let state = self.lock();
        state.session.unwrap_or(state.last_session)
    }

    fn close(&self) {
        let session = {
            let mut state = self.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.handler = None;
            state.session.take()
        };
        if let Some(session) = session {
            self.store.close_session(session);
        }
    }
}
