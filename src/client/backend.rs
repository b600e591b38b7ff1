//! Backend Interface
//!
//! The callback-style client a [`Connection`](super::Connection) drives.
//! A backend owns one session with the store; it reports results and
//! connection-state changes through callbacks and never retries a
//! request on its own.

use std::sync::Arc;

use crate::error::StoreError;
use crate::store::{ConnectionState, Request, Response};

pub use crate::store::Watcher;

/// Completion callback, invoked exactly once per submitted request
pub type Callback = Box<dyn FnOnce(Result<Response, StoreError>) + Send>;

/// Receives every connection-state change of a backend
pub type StateHandler = Arc<dyn Fn(ConnectionState) + Send + Sync>;

/// Connection-oriented, callback-based coordination client
pub trait Backend: Send + Sync + 'static {
    /// Submit a request. `watcher` is armed only if the read succeeds;
    /// otherwise it is dropped without being called.
    fn submit(&self, request: Request, watcher: Option<Watcher>, callback: Callback);

    /// Install the state handler. The backend reports its current state
    /// through it before returning.
    fn attach(&self, handler: StateHandler);

    /// Current session id
    fn session_id(&self) -> u64;

    /// End the session. Later submissions complete with
    /// [`StoreError::Closed`]; armed watchers are dropped.
    fn close(&self);
}

/// Check if a request mutates the store
pub fn is_write(request: &Request) -> bool {
    matches!(
        request,
        Request::Create { .. }
            | Request::Delete { .. }
            | Request::SetData { .. }
            | Request::SetAcl { .. }
    )
}
