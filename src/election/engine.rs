//! Election engine
//!
//! One actor task per participant. Connection-state changes, watch fires,
//! probe ticks and the staleness deadline are all handled on this task,
//! so the sibling set is never evaluated concurrently with itself.

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::rank::Ranking;
use super::LeadershipState;
use crate::client::{Connection, CreateOptions, Subscription, Watch};
use crate::error::{Error, Result, StoreError};
use crate::store::{path, ConnectionState, CreateMode, WatchEvent};

/// Why the participant stopped
#[derive(Debug)]
enum Outcome {
    /// Caller cancelled
    Cancelled,
    /// Connection owner is closing the connection
    Closed,
    /// Session or own node is gone for good
    Ended,
    /// Consumer dropped the stream
    Abandoned,
    Failed(Error),
}

/// Result of one store interaction inside the engine
enum Step {
    Store(StoreError),
    Done(Outcome),
}

impl From<Outcome> for Step {
    fn from(outcome: Outcome) -> Self {
        Step::Done(outcome)
    }
}

/// Close hooks waiting for the participant to finish cleanup
#[derive(Default)]
struct CloseAcks {
    finished: bool,
    waiters: Vec<oneshot::Sender<()>>,
}

pub(super) struct Engine {
    conn: Connection,
    path: String,
    id: String,
    stale_timeout: Duration,
    tx: mpsc::Sender<Result<LeadershipState>>,
    cancel: CancellationToken,
    closing: CancellationToken,
    /// Name prefix that lets a retried registration find its own node
    prefix: String,
    /// Full path of the registered node
    node: Option<String>,
    create_attempted: bool,
    /// Duplicate check has passed for the registered node
    checked: bool,
    /// Armed sibling watch, kept until it fires
    watch: Option<Watch>,
    last: Option<LeadershipState>,
    /// Sibling set must be re-fetched
    stale: bool,
    /// Leadership currently reported as unknown
    degraded: bool,
    /// Connection reported Suspended, Lost or ReadOnly
    signalled_down: bool,
    /// Wait for the next probe tick before retrying
    backoff: bool,
    confirmed: Instant,
}

impl Engine {
    pub(super) fn new(
        conn: Connection,
        path: String,
        id: String,
        stale_timeout: Duration,
        tx: mpsc::Sender<Result<LeadershipState>>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            conn,
            path,
            id,
            stale_timeout,
            tx,
            cancel,
            closing: CancellationToken::new(),
            prefix: format!("_c_{}-n_", Uuid::new_v4()),
            node: None,
            create_attempted: false,
            checked: false,
            watch: None,
            last: None,
            stale: true,
            degraded: false,
            signalled_down: false,
            backoff: false,
            confirmed: Instant::now(),
        }
    }

    pub(super) async fn run(mut self, start: oneshot::Receiver<()>, done: watch::Sender<bool>) {
        let started = tokio::select! {
            result = start => result.is_ok(),
            _ = self.cancel.cancelled() => false,
        };
        if !started {
            tracing::debug!(
                participant = %self.id,
                path = %self.path,
                "Election cancelled before start"
            );
            let _ = done.send(true);
            return;
        }
        self.confirmed = Instant::now();

        tracing::info!(participant = %self.id, path = %self.path, "Joining election");

        let (state_tx, mut state_rx) = mpsc::unbounded_channel();
        let state_sub = self.conn.on_state_change(move |state| {
            let _ = state_tx.send(state);
        });

        let acks = Arc::new(Mutex::new(CloseAcks::default()));
        let close_sub = self.close_hook(acks.clone());

        let outcome = self.participate(&mut state_rx).await;
        tracing::debug!(participant = %self.id, ?outcome, "Leaving election");

        self.watch = None;
        self.release_node().await;
        release(state_sub, close_sub);

        {
            let mut acks = acks.lock().unwrap_or_else(PoisonError::into_inner);
            acks.finished = true;
            for waiter in acks.waiters.drain(..) {
                let _ = waiter.send(());
            }
        }

        match outcome {
            Outcome::Cancelled => {
                let _ = self.tx.send(Ok(LeadershipState::Standby(None))).await;
            }
            Outcome::Closed | Outcome::Ended => {
                if !matches!(self.last, Some(LeadershipState::Standby(None))) {
                    let _ = self.tx.send(Ok(LeadershipState::Standby(None))).await;
                }
            }
            Outcome::Failed(e) => {
                tracing::error!(
                    participant = %self.id,
                    path = %self.path,
                    "Election failed: {}",
                    e
                );
                let _ = self.tx.send(Err(e)).await;
            }
            Outcome::Abandoned => {}
        }

        tracing::info!(participant = %self.id, path = %self.path, "Left election");
        drop(self.tx);
        let _ = done.send(true);
    }

    /// Hook that makes `Connection::close` wait for this participant's cleanup
    fn close_hook(&self, acks: Arc<Mutex<CloseAcks>>) -> Subscription {
        let closing = self.closing.clone();
        self.conn.on_before_close(move || {
            let acks = acks.clone();
            let closing = closing.clone();
            async move {
                let ack = {
                    let mut acks = acks.lock().unwrap_or_else(PoisonError::into_inner);
                    if acks.finished {
                        return;
                    }
                    let (tx, rx) = oneshot::channel();
                    acks.waiters.push(tx);
                    rx
                };
                closing.cancel();
                let _ = ack.await;
            }
        })
    }

    async fn participate(
        &mut self,
        state_rx: &mut mpsc::UnboundedReceiver<ConnectionState>,
    ) -> Outcome {
        if matches!(self.conn.state(), Some(s) if !usable(s)) {
            self.signalled_down = true;
            if let Err(outcome) = self.degrade().await {
                return outcome;
            }
        }

        let probe_every = (self.stale_timeout / 3).max(Duration::from_millis(1));
        let mut probe = tokio::time::interval_at(Instant::now() + probe_every, probe_every);
        probe.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            if self.stale && !self.signalled_down && !self.backoff {
                match self.evaluate().await {
                    Ok(()) => {}
                    Err(Step::Store(e)) => {
                        if let Err(outcome) = self.on_store_error(e).await {
                            return outcome;
                        }
                    }
                    Err(Step::Done(outcome)) => return outcome,
                }
                continue;
            }

            let deadline = self.deadline();
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => return Outcome::Cancelled,
                _ = self.closing.cancelled() => return Outcome::Closed,
                _ = self.tx.closed() => return Outcome::Abandoned,

                state = state_rx.recv() => {
                    let Some(state) = state else {
                        return Outcome::Ended;
                    };
                    tracing::debug!(participant = %self.id, %state, "Connection state changed");
                    if usable(state) {
                        self.signalled_down = false;
                        self.backoff = false;
                        self.stale = true;
                    } else {
                        self.signalled_down = true;
                        if let Err(outcome) = self.degrade().await {
                            return outcome;
                        }
                    }
                }

                event = next_event(&mut self.watch) => {
                    self.watch = None;
                    match event {
                        Some(event) => {
                            tracing::trace!(participant = %self.id, ?event.kind, "Siblings changed")
                        }
                        None => tracing::debug!(participant = %self.id, "Sibling watch dropped"),
                    }
                    self.stale = true;
                }

                _ = tokio::time::sleep_until(deadline), if !self.degraded => {
                    tracing::warn!(
                        participant = %self.id,
                        stale_timeout_ms = self.stale_timeout.as_millis() as u64,
                        "Leadership unconfirmed within stale timeout"
                    );
                    if let Err(outcome) = self.degrade().await {
                        return outcome;
                    }
                }

                _ = probe.tick() => {
                    if let Err(outcome) = self.on_probe().await {
                        return outcome;
                    }
                }
            }
        }
    }

    /// Register if needed, then fetch the sibling set and emit
    ///
    /// A new sibling watch is armed only when none is pending, so the store
    /// holds at most one watch for this participant.
    async fn evaluate(&mut self) -> std::result::Result<(), Step> {
        let node = match &self.node {
            Some(node) => node.clone(),
            None => {
                let node = self.register().await?;
                tracing::info!(participant = %self.id, node = %node, "Registered in election");
                self.node = Some(node.clone());
                node
            }
        };
        if !self.checked {
            self.check_duplicate(&node).await?;
            self.checked = true;
        }
        let own = path::node_name(&node).to_string();

        loop {
            let fetched = if self.watch.is_some() {
                self.op(self.conn.children(&self.path))
                    .await
                    .map(|children| (children, None))
            } else {
                self.op(self.conn.children_watched(&self.path))
                    .await
                    .map(|(children, watch)| (children, Some(watch)))
            };
            let (children, watch) = match fetched {
                Err(Step::Store(StoreError::NoNode(_))) => return Err(Outcome::Ended.into()),
                other => other?,
            };
            let ranking = Ranking::new(children.names);

            if ranking.rank_of(&own).is_none() {
                tracing::warn!(participant = %self.id, node = %node, "Own election node is gone");
                return Err(Outcome::Ended.into());
            }

            let next = match ranking.leader() {
                Some(leader) if leader == own => LeadershipState::ElectedAsLeader,
                Some(leader) => {
                    let leader_path = path::join(&self.path, leader);
                    match self.op(self.conn.data(&leader_path)).await {
                        Ok(data) => LeadershipState::Standby(Some(
                            String::from_utf8_lossy(&data.data).into_owned(),
                        )),
                        // Leader left between the two reads
                        Err(Step::Store(StoreError::NoNode(_))) => continue,
                        Err(e) => return Err(e),
                    }
                }
                None => return Err(Outcome::Ended.into()),
            };

            if watch.is_some() {
                self.watch = watch;
            }
            self.stale = false;
            self.degraded = false;
            self.confirmed = Instant::now();
            self.emit(next).await?;
            return Ok(());
        }
    }

    /// Create this participant's node, adopting one a lost reply already created
    async fn register(&mut self) -> std::result::Result<String, Step> {
        if self.create_attempted {
            if let Some(node) = self.find_own_node().await? {
                tracing::info!(
                    participant = %self.id,
                    node = %node,
                    "Adopting node from interrupted registration"
                );
                return Ok(node);
            }
        }

        self.create_attempted = true;
        let target = path::join(&self.path, &self.prefix);
        let options = CreateOptions::new()
            .data(self.id.as_bytes())
            .mode(CreateMode::EphemeralSequential)
            .create_parents(true);
        self.op(self.conn.create(&target, options)).await
    }

    async fn find_own_node(&self) -> std::result::Result<Option<String>, Step> {
        match self.op(self.conn.children(&self.path)).await {
            Ok(children) => Ok(children
                .names
                .iter()
                .find(|name| name.starts_with(&self.prefix))
                .map(|name| path::join(&self.path, name))),
            Err(Step::Store(StoreError::NoNode(_))) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Fail if a sibling registered earlier carries the same id
    async fn check_duplicate(&self, node: &str) -> std::result::Result<(), Step> {
        let children = self.op(self.conn.children(&self.path)).await?;
        let ranking = Ranking::new(children.names);
        let own = path::node_name(node);

        for sibling in ranking.ahead_of(own) {
            let sibling_path = path::join(&self.path, sibling);
            match self.op(self.conn.data(&sibling_path)).await {
                Ok(data) if data.data == self.id.as_bytes() => {
                    tracing::error!(
                        participant = %self.id,
                        sibling = %sibling_path,
                        "Duplicate participant id"
                    );
                    let error = Error::DuplicateParticipant(self.id.clone());
                    return Err(Outcome::Failed(error).into());
                }
                Ok(_) | Err(Step::Store(StoreError::NoNode(_))) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Confirm the own node still exists, or retry a pending evaluation
    async fn on_probe(&mut self) -> std::result::Result<(), Outcome> {
        if self.stale || self.signalled_down {
            self.backoff = false;
            return Ok(());
        }
        let Some(node) = self.node.clone() else {
            return Ok(());
        };

        match self.op(self.conn.exists(&node)).await {
            Ok(Some(_)) => {
                self.confirmed = Instant::now();
                Ok(())
            }
            Ok(None) => {
                tracing::warn!(participant = %self.id, node = %node, "Own election node is gone");
                Err(Outcome::Ended)
            }
            Err(Step::Store(e)) if e.is_transient() && Instant::now() < self.deadline() => {
                tracing::debug!(participant = %self.id, "Probe failed: {}", e);
                Ok(())
            }
            Err(Step::Store(e)) => self.on_store_error(e).await,
            Err(Step::Done(outcome)) => Err(outcome),
        }
    }

    async fn on_store_error(&mut self, error: StoreError) -> std::result::Result<(), Outcome> {
        if error.is_transient() {
            tracing::debug!(participant = %self.id, "Store unavailable: {}", error);
            self.backoff = true;
            self.degrade().await
        } else if error.is_terminal() {
            tracing::info!(participant = %self.id, "Session ended: {}", error);
            Err(Outcome::Ended)
        } else {
            Err(Outcome::Failed(error.into()))
        }
    }

    /// Report leadership as unknown until the next successful evaluation
    async fn degrade(&mut self) -> std::result::Result<(), Outcome> {
        self.stale = true;
        self.degraded = true;
        self.emit(LeadershipState::Standby(None)).await
    }

    /// Deliver a transition, skipping repeats of the current one
    async fn emit(&mut self, state: LeadershipState) -> std::result::Result<(), Outcome> {
        if self.last.as_ref() == Some(&state) {
            return Ok(());
        }
        tracing::info!(participant = %self.id, path = %self.path, %state, "Leadership changed");

        tokio::select! {
            sent = self.tx.send(Ok(state.clone())) => {
                if sent.is_err() {
                    return Err(Outcome::Abandoned);
                }
            }
            _ = self.cancel.cancelled() => return Err(Outcome::Cancelled),
            _ = self.closing.cancelled() => return Err(Outcome::Closed),
        }
        self.last = Some(state);
        Ok(())
    }

    /// Instant by which leadership must be confirmed again
    fn deadline(&self) -> Instant {
        self.confirmed + self.stale_timeout
    }

    /// Run one store operation, interruptible and time-bounded
    ///
    /// While leadership is presented as known the bound is the staleness
    /// deadline, so a store that stops answering cannot delay degrading.
    async fn op<T>(
        &self,
        fut: impl Future<Output = std::result::Result<T, StoreError>>,
    ) -> std::result::Result<T, Step> {
        let bound = if self.degraded {
            Instant::now() + self.stale_timeout
        } else {
            self.deadline()
        };
        tokio::select! {
            result = fut => result.map_err(Step::Store),
            _ = self.cancel.cancelled() => Err(Outcome::Cancelled.into()),
            _ = self.closing.cancelled() => Err(Outcome::Closed.into()),
            _ = tokio::time::sleep_until(bound) => Err(Step::Store(StoreError::ConnectionLoss)),
        }
    }

    /// Best-effort removal of this participant's node
    async fn release_node(&mut self) {
        if self.conn.is_closed() {
            return;
        }

        let node = match self.node.take() {
            Some(node) => Some(node),
            // A create may have landed even though its reply never arrived
            None if self.create_attempted => {
                let listing = self.conn.children(&self.path);
                match tokio::time::timeout(self.stale_timeout, listing).await {
                    Ok(Ok(children)) => children
                        .names
                        .iter()
                        .find(|name| name.starts_with(&self.prefix))
                        .map(|name| path::join(&self.path, name)),
                    _ => None,
                }
            }
            None => None,
        };
        let Some(node) = node else {
            return;
        };

        match tokio::time::timeout(self.stale_timeout, self.conn.delete(&node, false)).await {
            Ok(Ok(_)) => {
                tracing::debug!(participant = %self.id, node = %node, "Deleted election node")
            }
            Ok(Err(StoreError::NoNode(_))) => {}
            Ok(Err(e)) => tracing::debug!(
                participant = %self.id,
                node = %node,
                "Could not delete election node: {}",
                e
            ),
            Err(_) => tracing::debug!(participant = %self.id, node = %node, "Delete timed out"),
        }
    }
}

/// Drop the participant's connection observers
fn release(state: Subscription, close: Subscription) {
    state.cancel();
    close.cancel();
}

/// Connection states in which leadership can be confirmed
fn usable(state: ConnectionState) -> bool {
    matches!(state, ConnectionState::Connected | ConnectionState::Reconnected)
}

/// Next fire of the armed sibling watch; pending forever if none is armed
async fn next_event(watch: &mut Option<Watch>) -> Option<WatchEvent> {
    match watch {
        Some(watch) => watch.await,
        None => std::future::pending().await,
    }
}
