//! Coordination Client Module
//!
//! [`Connection`] is the shared handle elections use to talk to the
//! coordination store. It wraps a callback-based [`Backend`], tracks the
//! session's connection state, and keeps the registry of state
//! listeners, before-close hooks and armed watches that every user of
//! the connection adds to and removes from.

mod backend;
mod endpoint;
mod local;
mod ops;
mod registry;

pub use backend::{is_write, Backend, Callback, StateHandler, Watcher};
pub use endpoint::Endpoint;
pub use local::LocalBackend;
pub use ops::{Children, CreateOptions, NodeData, Watch};
pub use registry::{Registry, Subscription};

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::watch;

use crate::store::{ConnectionState, MemoryStore};

/// Default time `close` waits for before-close hooks
pub const DEFAULT_CLOSE_GRACE: Duration = Duration::from_secs(5);

/// Observer of connection-state changes
pub type StateListener = Arc<dyn Fn(ConnectionState) + Send + Sync>;

/// Hook run by [`Connection::close`] before the session ends
pub type CloseHook = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Number of observers currently registered on a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ObserverCounts {
    pub state_listeners: usize,
    pub close_hooks: usize,
    pub watches: usize,
}

impl ObserverCounts {
    pub fn total(&self) -> usize {
        self.state_listeners + self.close_hooks + self.watches
    }
}

pub(crate) struct ConnectionInner {
    backend: Arc<dyn Backend>,
    state: watch::Sender<Option<ConnectionState>>,
    state_listeners: Registry<StateListener>,
    close_hooks: Registry<CloseHook>,
    pub(crate) watches: Registry<String>,
    /// `close` has been called
    closing: AtomicBool,
    /// The backend session has ended
    closed: AtomicBool,
    close_grace: Duration,
}

/// Shared handle to a live session with the coordination store
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl Connection {
    /// Wrap a backend
    pub fn open(backend: Arc<dyn Backend>) -> Self {
        Self::with_close_grace(backend, DEFAULT_CLOSE_GRACE)
    }

    /// Wrap a backend, bounding how long `close` waits for hooks
    pub fn with_close_grace(backend: Arc<dyn Backend>, close_grace: Duration) -> Self {
        let (state, _) = watch::channel(None);
        let inner = Arc::new(ConnectionInner {
            backend: Arc::clone(&backend),
            state,
            state_listeners: Registry::new(),
            close_hooks: Registry::new(),
            watches: Registry::new(),
            closing: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            close_grace,
        });

        backend.attach(state_handler(Arc::downgrade(&inner)));
        Self { inner }
    }

    /// Open an in-process connection to a memory store
    pub fn local(store: &MemoryStore) -> (Self, Arc<LocalBackend>) {
        let backend = LocalBackend::new(store);
        (Self::open(backend.clone()), backend)
    }

    pub(crate) fn inner(&self) -> &Arc<ConnectionInner> {
        &self.inner
    }

    pub(crate) fn backend(&self) -> &Arc<dyn Backend> {
        &self.inner.backend
    }

    /// Latest connection state, `None` until the backend reported one
    pub fn state(&self) -> Option<ConnectionState> {
        *self.inner.state.borrow()
    }

    /// Current session id
    pub fn session_id(&self) -> u64 {
        self.inner.backend.session_id()
    }

    /// Check if the session has been closed
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Check if `close` has been called
    pub fn is_closing(&self) -> bool {
        self.inner.closing.load(Ordering::SeqCst)
    }

    /// Wait until the connection reports a connected state
    ///
    /// Returns `false` if `timeout` elapses or the connection is closed first.
    pub async fn block_until_connected(&self, timeout: Duration) -> bool {
        let mut rx = self.inner.state.subscribe();
        let connected = async {
            loop {
                if self.is_closing() {
                    return false;
                }
                if matches!(*rx.borrow_and_update(), Some(s) if s.is_connected()) {
                    return true;
                }
                if rx.changed().await.is_err() {
                    return false;
                }
            }
        };
        tokio::time::timeout(timeout, connected).await.unwrap_or(false)
    }

    /// Register a connection-state observer
    pub fn on_state_change(
        &self,
        listener: impl Fn(ConnectionState) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.inner.state_listeners.add(Arc::new(listener));
        let weak = Arc::downgrade(&self.inner);
        Subscription::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.state_listeners.remove(id);
            }
        })
    }

    /// Register a hook that `close` runs, and waits for, before ending the session
    pub fn on_before_close<F, Fut>(&self, hook: F) -> Subscription
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let boxed: CloseHook = Arc::new(move || -> BoxFuture<'static, ()> { Box::pin(hook()) });
        let id = self.inner.close_hooks.add(boxed);
        let weak = Arc::downgrade(&self.inner);
        Subscription::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.close_hooks.remove(id);
            }
        })
    }

    /// Observers currently registered on this connection
    pub fn observer_counts(&self) -> ObserverCounts {
        ObserverCounts {
            state_listeners: self.inner.state_listeners.len(),
            close_hooks: self.inner.close_hooks.len(),
            watches: self.inner.watches.len(),
        }
    }

    /// Close the connection
    ///
    /// Runs every before-close hook and waits for them (bounded by the
    /// close grace), then ends the session. Idempotent.
    pub async fn close(&self) {
        if self.inner.closing.swap(true, Ordering::SeqCst) {
            return;
        }

        let hooks = self.inner.close_hooks.snapshot();
        tracing::debug!(
            session = self.session_id(),
            hooks = hooks.len(),
            "closing connection"
        );

        let pending = futures::future::join_all(hooks.iter().map(|hook| hook()));
        if tokio::time::timeout(self.inner.close_grace, pending).await.is_err() {
            tracing::warn!(
                grace_ms = self.inner.close_grace.as_millis() as u64,
                "before-close hooks did not finish in time"
            );
        }

        self.inner.backend.close();
        self.inner.closed.store(true, Ordering::SeqCst);
        tracing::info!(session = self.session_id(), "connection closed");
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("session", &self.session_id())
            .field("state", &self.state())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Build the handler a backend reports state changes through
fn state_handler(inner: Weak<ConnectionInner>) -> StateHandler {
    Arc::new(move |state| {
        let Some(inner) = inner.upgrade() else {
            return;
        };
        if inner.closed.load(Ordering::SeqCst) {
            return;
        }

        tracing::info!(session = inner.backend.session_id(), %state, "connection state changed");
        inner.state.send_replace(Some(state));
        for listener in inner.state_listeners.snapshot() {
            listener(state);
        }
    })
}
