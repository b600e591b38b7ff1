//! Leader Election Module
//!
//! Turns ephemeral-sequential registrations under an election path into an
//! ordered, cancellable stream of [`LeadershipState`] values for one
//! participant.
//!
//! ```ignore
//! let (handle, mut states) = Election::new(&conn, "/services/db/leader", "10.0.0.7:5432")
//!     .stale_timeout(Duration::from_secs(5))
//!     .spawn()?;
//!
//! while let Some(state) = states.next().await {
//!     println!("{}", state?);
//! }
//! handle.stopped().await;
//! ```

mod engine;
pub mod rank;

#[cfg(test)]
mod tests;

use std::fmt;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::client::Connection;
use crate::error::{Error, Result};
use crate::store::path;

pub use rank::Ranking;

/// Default bound on how long a participant may present unconfirmed leadership
pub const DEFAULT_STALE_TIMEOUT: Duration = Duration::from_secs(10);

/// Default number of transitions buffered for a slow consumer
pub const DEFAULT_BUFFER: usize = 16;

/// Leadership as seen by one participant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LeadershipState {
    /// This participant holds the lowest rank
    ElectedAsLeader,
    /// Another participant leads (`Some(id)`), or leadership is unknown (`None`)
    Standby(Option<String>),
}

impl LeadershipState {
    pub fn is_leader(&self) -> bool {
        matches!(self, LeadershipState::ElectedAsLeader)
    }

    /// Id of the known leader while in standby
    pub fn leader_id(&self) -> Option<&str> {
        match self {
            LeadershipState::Standby(Some(id)) => Some(id),
            _ => None,
        }
    }

    /// Check if leadership is currently unknown
    pub fn is_unknown(&self) -> bool {
        matches!(self, LeadershipState::Standby(None))
    }
}

impl fmt::Display for LeadershipState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LeadershipState::ElectedAsLeader => write!(f, "leader"),
            LeadershipState::Standby(Some(id)) => write!(f, "standby (leader: {})", id),
            LeadershipState::Standby(None) => write!(f, "standby (leader unknown)"),
        }
    }
}

/// Builder for one participant in an election
#[derive(Debug, Clone)]
pub struct Election {
    conn: Connection,
    path: String,
    id: String,
    stale_timeout: Duration,
    buffer: usize,
}

impl Election {
    pub fn new(conn: &Connection, path: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            conn: conn.clone(),
            path: path.into(),
            id: id.into(),
            stale_timeout: DEFAULT_STALE_TIMEOUT,
            buffer: DEFAULT_BUFFER,
        }
    }

    /// Bound on how long unconfirmed leadership may be presented
    pub fn stale_timeout(mut self, stale_timeout: Duration) -> Self {
        self.stale_timeout = stale_timeout;
        self
    }

    /// Number of transitions buffered before the engine waits for the consumer
    pub fn buffer(mut self, buffer: usize) -> Self {
        self.buffer = buffer;
        self
    }

    fn validate(&self) -> Result<()> {
        path::validate(&self.path)
            .map_err(|e| Error::Config(format!("election path: {}", e)))?;
        if self.path == "/" {
            return Err(Error::Config("election path must not be the root".into()));
        }
        if self.id.is_empty() {
            return Err(Error::Config("participant id must not be empty".into()));
        }
        if self.stale_timeout.is_zero() {
            return Err(Error::Config("stale timeout must be positive".into()));
        }
        if self.buffer == 0 {
            return Err(Error::Config("buffer must hold at least one transition".into()));
        }
        Ok(())
    }

    /// Start the participant on the current tokio runtime
    pub fn spawn(self) -> Result<(ElectionHandle, LeadershipStream)> {
        self.spawn_on(&tokio::runtime::Handle::current())
    }

    /// Start the participant on the given runtime
    ///
    /// Registration is deferred until the returned stream is first polled.
    pub fn spawn_on(
        self,
        runtime: &tokio::runtime::Handle,
    ) -> Result<(ElectionHandle, LeadershipStream)> {
        self.validate()?;

        let (tx, rx) = mpsc::channel(self.buffer);
        let (start_tx, start_rx) = oneshot::channel();
        let (done_tx, done_rx) = watch::channel(false);
        let cancel = CancellationToken::new();

        let handle = ElectionHandle {
            participant: self.id.clone(),
            path: self.path.clone(),
            cancel: cancel.clone(),
            done: done_rx,
        };
        let stream = LeadershipStream {
            inner: ReceiverStream::new(rx),
            start: Some(start_tx),
            cancel: cancel.clone(),
        };

        let engine = engine::Engine::new(
            self.conn,
            self.path,
            self.id,
            self.stale_timeout,
            tx,
            cancel,
        );
        runtime.spawn(engine.run(start_rx, done_tx));

        Ok((handle, stream))
    }
}

/// Control handle of a running participant
#[derive(Debug, Clone)]
pub struct ElectionHandle {
    participant: String,
    path: String,
    cancel: CancellationToken,
    done: watch::Receiver<bool>,
}

impl ElectionHandle {
    /// Withdraw from the election. Idempotent.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Wait until the participant has deleted its node and released its observers
    pub async fn stopped(&self) {
        let mut done = self.done.clone();
        let _ = done.wait_for(|stopped| *stopped).await;
    }

    /// Check if cleanup has completed
    pub fn is_stopped(&self) -> bool {
        *self.done.borrow()
    }

    pub fn participant_id(&self) -> &str {
        &self.participant
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

/// Ordered leadership transitions of one participant
///
/// Ends after a final `Standby(None)` when the participant is cancelled,
/// its connection closes or its session is gone, or with an error on a
/// fatal failure. Dropping the stream withdraws the participant.
#[must_use = "the participant registers only once the stream is polled"]
pub struct LeadershipStream {
    inner: ReceiverStream<Result<LeadershipState>>,
    start: Option<oneshot::Sender<()>>,
    cancel: CancellationToken,
}

impl Stream for LeadershipStream {
    type Item = Result<LeadershipState>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if let Some(start) = self.start.take() {
            let _ = start.send(());
        }
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

impl Drop for LeadershipStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl fmt::Debug for LeadershipStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeadershipStream")
            .field("started", &self.start.is_none())
            .finish()
    }
}
