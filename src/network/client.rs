//! Remote Backend
//!
//! [`Backend`] that talks to a [`CoordinationServer`](super::CoordinationServer)
//! over TCP. A background link task keeps the session alive with pings,
//! detects dead links, and resumes or replaces the session after an
//! outage. Requests are never retried: anything in flight on a dead
//! link fails with `ConnectionLoss`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;

use super::{read_message, write_message, Message};
use crate::client::{Backend, Callback, Connection, Endpoint, StateHandler};
use crate::error::{Error, Result, StoreError};
use crate::store::{ConnectionState, Request, WatchEvent, Watcher};

/// Session parameters for a remote connection
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Idle time after which the server expires the session
    pub session_timeout: Duration,
    /// Per-host limit for connecting and the session handshake
    pub connect_timeout: Duration,
    /// Identities to authenticate as, as `(scheme, id)`
    pub auth: Vec<(String, String)>,
    /// How long `Connection::close` waits for before-close hooks
    pub close_grace: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            session_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(5),
            auth: Vec::new(),
            close_grace: crate::client::DEFAULT_CLOSE_GRACE,
        }
    }
}

/// A request waiting for its response
struct Pending {
    callback: Callback,
    watcher: Option<Watcher>,
}

struct LinkState {
    session_id: u64,
    timeout: Duration,
    /// Outbound queue of the live link
    link: Option<mpsc::UnboundedSender<Message>>,
    pending: HashMap<u64, Pending>,
    /// Watches armed on the server, by the xid that armed them
    armed: HashMap<u64, Watcher>,
    /// Watch events that overtook their request's response
    early: HashMap<u64, WatchEvent>,
    current: ConnectionState,
    handler: Option<StateHandler>,
    closed: bool,
}

struct Shared {
    hosts: Vec<String>,
    options: SessionOptions,
    next_xid: AtomicU64,
    state: Mutex<LinkState>,
    shutdown: CancellationToken,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, LinkState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn signal(&self, next: ConnectionState) {
        let handler = {
            let mut state = self.lock();
            if state.closed {
                return;
            }
            state.current = next;
            state.handler.clone()
        };
        if let Some(handler) = handler {
            handler(next);
        }
    }

    fn send(&self, message: Message) -> bool {
        match &self.lock().link {
            Some(link) => link.send(message).is_ok(),
            None => false,
        }
    }

    /// Tear down the live link, failing everything in flight
    fn drop_link(&self) {
        let failed: Vec<Pending> = {
            let mut state = self.lock();
            state.link = None;
            state.early.clear();
            state.pending.drain().map(|(_, p)| p).collect()
        };
        for pending in failed {
            (pending.callback)(Err(StoreError::ConnectionLoss));
        }
    }

    fn dispatch(&self, message: Message) {
        match message {
            Message::Pong => {}
            Message::Response { xid, result } => {
                let (pending, fire) = {
                    let mut state = self.lock();
                    let Some(mut pending) = state.pending.remove(&xid) else {
                        tracing::debug!(xid, "Response for unknown request");
                        return;
                    };
                    let mut fire = None;
                    if result.is_ok() {
                        if let Some(watcher) = pending.watcher.take() {
                            match state.early.remove(&xid) {
                                Some(event) => fire = Some((watcher, event)),
                                None => {
                                    state.armed.insert(xid, watcher);
                                }
                            }
                        }
                    } else {
                        state.early.remove(&xid);
                    }
                    (pending, fire)
                };

                (pending.callback)(result);
                if let Some((watcher, event)) = fire {
                    watcher(event);
                }
            }
            Message::WatchFired { xid, event } => {
                let watcher = {
                    let mut state = self.lock();
                    match state.armed.remove(&xid) {
                        Some(watcher) => Some(watcher),
                        None => {
                            if state.pending.contains_key(&xid) {
                                state.early.insert(xid, event.clone());
                            }
                            None
                        }
                    }
                };
                if let Some(watcher) = watcher {
                    watcher(event);
                }
            }
            other => {
                tracing::warn!("Unexpected {} from server", other.type_name());
            }
        }
    }
}

/// Outcome of a session handshake
enum Handshake {
    Accepted {
        stream: TcpStream,
        session_id: u64,
        timeout: Duration,
    },
    Expired,
}

/// TCP backend for a remote coordination server
pub struct RemoteBackend {
    shared: Arc<Shared>,
}

impl RemoteBackend {
    /// Connect to the first reachable host and open a session
    pub async fn connect(endpoint: &Endpoint, options: SessionOptions) -> Result<Arc<Self>> {
        let hosts = endpoint.hosts.clone();
        let (stream, session_id, timeout) = match handshake(&hosts, &options, None).await? {
            Handshake::Accepted {
                stream,
                session_id,
                timeout,
            } => (stream, session_id, timeout),
            Handshake::Expired => {
                return Err(Error::Network("Server refused to open a session".into()))
            }
        };
        tracing::info!(session = session_id, %endpoint, "Connected to coordination server");

        let shared = Arc::new(Shared {
            hosts,
            options,
            next_xid: AtomicU64::new(1),
            state: Mutex::new(LinkState {
                session_id,
                timeout,
                link: None,
                pending: HashMap::new(),
                armed: HashMap::new(),
                early: HashMap::new(),
                current: ConnectionState::Connected,
                handler: None,
                closed: false,
            }),
            shutdown: CancellationToken::new(),
        });

        let link = start_link(&shared, stream);
        tokio::spawn(maintain(shared.clone(), link));
        Ok(Arc::new(Self { shared }))
    }

    /// Session timeout granted by the server
    pub fn session_timeout(&self) -> Duration {
        self.shared.lock().timeout
    }
}

impl Backend for RemoteBackend {
    fn submit(&self, request: Request, watcher: Option<Watcher>, callback: Callback) {
        let xid = self.shared.next_xid.fetch_add(1, Ordering::Relaxed);
        let rejected = {
            let mut state = self.shared.lock();
            if state.closed {
                Some((callback, StoreError::Closed))
            } else {
                match state.link.clone() {
                    None => Some((callback, StoreError::ConnectionLoss)),
                    Some(link) => {
                        let watch = watcher.is_some();
                        state.pending.insert(xid, Pending { callback, watcher });
                        if link.send(Message::Request { xid, request, watch }).is_ok() {
                            None
                        } else {
                            state
                                .pending
                                .remove(&xid)
                                .map(|p| (p.callback, StoreError::ConnectionLoss))
                        }
                    }
                }
            }
        };

        if let Some((callback, error)) = rejected {
            callback(Err(error));
        }
    }

    fn attach(&self, handler: StateHandler) {
        let current = {
            let mut state = self.shared.lock();
            state.handler = Some(handler.clone());
            state.current
        };
        handler(current);
    }

    fn session_id(&self) -> u64 {
        self.shared.lock().session_id
    }

    fn close(&self) {
        let (pending, session) = {
            let mut state = self.shared.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.handler = None;
            state.armed.clear();
            state.early.clear();
            if let Some(link) = state.link.take() {
                let _ = link.send(Message::Close);
            }
            let pending: Vec<Pending> = state.pending.drain().map(|(_, p)| p).collect();
            (pending, state.session_id)
        };
        self.shared.shutdown.cancel();

        for p in pending {
            (p.callback)(Err(StoreError::Closed));
        }
        tracing::debug!(session, "Remote session closed");
    }
}

impl Drop for RemoteBackend {
    fn drop(&mut self) {
        self.close();
    }
}

impl Connection {
    /// Connect to a remote coordination server
    pub async fn connect(url: &str, options: SessionOptions) -> Result<Connection> {
        let endpoint = Endpoint::parse(url)?;
        let close_grace = options.close_grace;
        let backend = RemoteBackend::connect(&endpoint, options).await?;
        Ok(Connection::with_close_grace(backend, close_grace))
    }
}

/// Try every host in order and run the session handshake on the first that answers
async fn handshake(
    hosts: &[String],
    options: &SessionOptions,
    resume: Option<u64>,
) -> Result<Handshake> {
    let mut last_error = None;

    for host in hosts {
        match timeout(options.connect_timeout, try_host(host, options, resume)).await {
            Ok(Ok(handshake)) => return Ok(handshake),
            Ok(Err(e)) => {
                tracing::debug!(%host, "Connect attempt failed: {}", e);
                last_error = Some(e);
            }
            Err(_) => {
                tracing::debug!(%host, "Connect attempt timed out");
                last_error = Some(Error::ConnectionTimeout(host.clone()));
            }
        }
    }

    Err(last_error.unwrap_or_else(|| Error::Config("endpoint has no hosts".into())))
}

async fn try_host(host: &str, options: &SessionOptions, resume: Option<u64>) -> Result<Handshake> {
    let mut stream = TcpStream::connect(host)
        .await
        .map_err(|e| Error::ConnectionFailed {
            address: host.to_string(),
            reason: e.to_string(),
        })?;
    stream.set_nodelay(true)?;

    write_message(
        &mut stream,
        &Message::Connect {
            session_id: resume,
            timeout_ms: options.session_timeout.as_millis() as u64,
            auth: options.auth.clone(),
        },
    )
    .await?;

    match read_message(&mut stream).await? {
        Message::ConnectResponse {
            session_id,
            timeout_ms,
        } => Ok(Handshake::Accepted {
            stream,
            session_id,
            timeout: Duration::from_millis(timeout_ms),
        }),
        Message::SessionExpired => Ok(Handshake::Expired),
        other => Err(Error::Network(format!(
            "Expected ConnectResponse, got {}",
            other.type_name()
        ))),
    }
}

/// Spawn the socket tasks for a fresh link and publish its outbound queue
///
/// Returns the inbound message channel; it closes when the socket does.
fn start_link(shared: &Arc<Shared>, stream: TcpStream) -> mpsc::UnboundedReceiver<Message> {
    let (mut reader, mut writer) = stream.into_split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
    let (in_tx, in_rx) = mpsc::unbounded_channel::<Message>();

    tokio::spawn(async move {
        while let Some(message) = out_rx.recv().await {
            if write_message(&mut writer, &message).await.is_err() {
                break;
            }
        }
    });

    tokio::spawn(async move {
        loop {
            match read_message(&mut reader).await {
                Ok(message) => {
                    if in_tx.send(message).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    tracing::debug!("Link read ended: {}", e);
                    break;
                }
            }
        }
    });

    shared.lock().link = Some(out_tx);
    in_rx
}

/// Keep the session alive until the backend is closed
async fn maintain(shared: Arc<Shared>, mut inbound: mpsc::UnboundedReceiver<Message>) {
    loop {
        serve_link(&shared, &mut inbound).await;
        shared.drop_link();
        if shared.shutdown.is_cancelled() {
            return;
        }

        let session = shared.lock().session_id;
        tracing::warn!(session, "Lost link to coordination server");
        shared.signal(ConnectionState::Suspended);

        match reestablish(&shared, session).await {
            Some(next) => inbound = next,
            None => return,
        }
    }
}

/// Pump one link until it dies: dispatch inbound messages, ping, and watch for silence
async fn serve_link(shared: &Shared, inbound: &mut mpsc::UnboundedReceiver<Message>) {
    let timeout = shared.lock().timeout;
    let ping_every = (timeout / 3).max(Duration::from_millis(10));
    let dead_after = (timeout * 2 / 3).max(Duration::from_millis(20));

    let mut ping = tokio::time::interval(ping_every);
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut deadline = Instant::now() + dead_after;

    loop {
        tokio::select! {
            message = inbound.recv() => match message {
                Some(message) => {
                    deadline = Instant::now() + dead_after;
                    shared.dispatch(message);
                }
                None => return,
            },
            _ = ping.tick() => {
                if !shared.send(Message::Ping) {
                    return;
                }
            }
            _ = tokio::time::sleep_until(deadline) => {
                tracing::debug!("No traffic from server within {:?}", dead_after);
                return;
            }
            _ = shared.shutdown.cancelled() => return,
        }
    }
}

/// Resume the session, or replace it if the server expired it
async fn reestablish(
    shared: &Arc<Shared>,
    session: u64,
) -> Option<mpsc::UnboundedReceiver<Message>> {
    let retry_every = (shared.lock().timeout / 3).max(Duration::from_millis(10));
    let mut resume = Some(session);

    loop {
        let attempt = tokio::select! {
            result = handshake(&shared.hosts, &shared.options, resume) => result,
            _ = shared.shutdown.cancelled() => return None,
        };

        match attempt {
            Ok(Handshake::Accepted {
                stream,
                session_id,
                timeout,
            }) => {
                {
                    let mut state = shared.lock();
                    if state.closed {
                        return None;
                    }
                    state.session_id = session_id;
                    state.timeout = timeout;
                }
                let inbound = start_link(shared, stream);
                tracing::info!(session = session_id, "Reconnected to coordination server");
                shared.signal(ConnectionState::Reconnected);
                return Some(inbound);
            }
            Ok(Handshake::Expired) => {
                tracing::warn!(session, "Coordination session expired");
                shared.lock().armed.clear();
                shared.signal(ConnectionState::Lost);
                resume = None;
                continue;
            }
            Err(e) => {
                tracing::debug!("Reconnect failed: {}", e);
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(retry_every) => {}
            _ = shared.shutdown.cancelled() => return None,
        }
    }
}
