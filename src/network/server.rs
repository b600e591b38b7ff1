//! Coordination Server
//!
//! TCP front-end over a [`MemoryStore`]. Each TCP connection carries one
//! session; a session outlives its connection until its timeout elapses
//! and can be resumed from a new connection in the meantime.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};

use super::{is_disconnect, read_message, write_message, Message};
use crate::error::{Error, Result};
use crate::store::{MemoryStore, Watcher};

/// Outbound queue of the connection currently serving a session
struct Route {
    conn_id: u64,
    tx: mpsc::UnboundedSender<Message>,
}

/// Session id -> current connection
#[derive(Clone, Default)]
struct Routes {
    inner: Arc<Mutex<HashMap<u64, Route>>>,
}

impl Routes {
    fn lock(&self) -> MutexGuard<'_, HashMap<u64, Route>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn bind(&self, session: u64, conn_id: u64, tx: mpsc::UnboundedSender<Message>) {
        self.lock().insert(session, Route { conn_id, tx });
    }

    /// Remove the route only if `conn_id` still owns it
    fn unbind(&self, session: u64, conn_id: u64) {
        let mut routes = self.lock();
        if routes.get(&session).map(|r| r.conn_id) == Some(conn_id) {
            routes.remove(&session);
        }
    }

    fn remove(&self, session: u64) {
        self.lock().remove(&session);
    }

    fn send(&self, session: u64, message: Message) -> bool {
        match self.lock().get(&session) {
            Some(route) => route.tx.send(message).is_ok(),
            None => false,
        }
    }
}

/// TCP server for remote coordination sessions
pub struct CoordinationServer {
    listener: TcpListener,
    store: MemoryStore,
    /// Session reaper interval
    tick: Duration,
    routes: Routes,
    next_conn: Arc<AtomicU64>,
    /// Shutdown signal
    shutdown: watch::Sender<bool>,
}

impl CoordinationServer {
    /// Bind the listening socket
    pub async fn bind(bind_address: &str, store: MemoryStore, tick: Duration) -> Result<Self> {
        let listener = TcpListener::bind(bind_address).await?;
        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            listener,
            store,
            tick,
            routes: Routes::default(),
            next_conn: Arc::new(AtomicU64::new(1)),
            shutdown,
        })
    }

    /// Address the server is listening on
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Store being served
    pub fn store(&self) -> &MemoryStore {
        &self.store
    }

    /// Run the accept loop and session reaper until [`stop`](Self::stop)
    pub async fn run(&self) -> Result<()> {
        tracing::info!(address = %self.local_addr()?, "Coordination server listening");

        let mut shutdown_rx = self.shutdown.subscribe();
        let mut reaper = tokio::time::interval(self.tick);
        reaper.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((socket, addr)) => {
                            let peer = addr.to_string();
                            let handler = ConnectionHandler {
                                store: self.store.clone(),
                                routes: self.routes.clone(),
                                conn_id: self.next_conn.fetch_add(1, Ordering::Relaxed),
                                shutdown: self.shutdown.subscribe(),
                            };

                            tokio::spawn(async move {
                                if let Err(e) = handler.run(socket).await {
                                    tracing::warn!(%peer, "Connection error: {}", e);
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!("Accept error: {}", e);
                        }
                    }
                }
                _ = reaper.tick() => {
                    for session in self.store.expire_idle() {
                        self.routes.remove(session);
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("Coordination server stopped");
        Ok(())
    }

    /// Stop the server and drop every client connection
    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }
}

/// Serves one TCP connection
struct ConnectionHandler {
    store: MemoryStore,
    routes: Routes,
    conn_id: u64,
    shutdown: watch::Receiver<bool>,
}

impl ConnectionHandler {
    async fn run(mut self, socket: TcpStream) -> Result<()> {
        socket.set_nodelay(true)?;
        let (mut reader, mut writer) = socket.into_split();

        let session = match read_message(&mut reader).await? {
            Message::Connect {
                session_id,
                timeout_ms,
                auth,
            } => match self.accept(session_id, timeout_ms, auth) {
                Some(session) => session,
                None => {
                    write_message(&mut writer, &Message::SessionExpired).await?;
                    return Ok(());
                }
            },
            other => {
                return Err(Error::Network(format!(
                    "Expected Connect, got {}",
                    other.type_name()
                )))
            }
        };

        let timeout_ms = self
            .store
            .session_timeout(session)
            .map(|t| t.as_millis() as u64)
            .unwrap_or_default();
        write_message(
            &mut writer,
            &Message::ConnectResponse {
                session_id: session,
                timeout_ms,
            },
        )
        .await?;

        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        self.routes.bind(session, self.conn_id, tx.clone());

        let writer_task = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                if let Err(e) = write_message(&mut writer, &message).await {
                    tracing::debug!("Write failed: {}", e);
                    break;
                }
            }
        });

        let result = loop {
            tokio::select! {
                message = read_message(&mut reader) => match message {
                    Ok(Message::Close) => {
                        self.store.close_session(session);
                        break Ok(());
                    }
                    Ok(message) => self.handle(session, message, &tx),
                    Err(ref e) if is_disconnect(e) => break Ok(()),
                    Err(e) => break Err(e),
                },
                _ = self.shutdown.changed() => break Ok(()),
            }
        };

        self.routes.unbind(session, self.conn_id);
        drop(tx);
        let _ = writer_task.await;
        tracing::debug!(session, "Client connection ended");
        result
    }

    /// Open or resume a session, `None` if the resumed one is gone
    fn accept(
        &self,
        session_id: Option<u64>,
        timeout_ms: u64,
        auth: Vec<(String, String)>,
    ) -> Option<u64> {
        match session_id {
            Some(id) if self.store.touch(id).is_ok() => {
                tracing::debug!(session = id, "Session resumed");
                Some(id)
            }
            Some(id) => {
                tracing::debug!(session = id, "Refusing to resume expired session");
                None
            }
            None => {
                let timeout = Duration::from_millis(timeout_ms.max(1));
                Some(self.store.open_session(Some(timeout), auth))
            }
        }
    }

    fn handle(&self, session: u64, message: Message, tx: &mpsc::UnboundedSender<Message>) {
        tracing::trace!(session, "Received {}", message.type_name());

        match message {
            Message::Ping => {
                if self.store.touch(session).is_ok() {
                    let _ = tx.send(Message::Pong);
                }
            }
            Message::Request { xid, request, watch } => {
                let watcher: Option<Watcher> = watch.then(|| {
                    let routes = self.routes.clone();
                    Box::new(move |event| {
                        if !routes.send(session, Message::WatchFired { xid, event }) {
                            tracing::debug!(session, xid, "Watch fired with no live connection");
                        }
                    }) as Watcher
                });

                let result = self.store.apply(session, request, watcher);
                let _ = tx.send(Message::Response { xid, result });
            }
            other => {
                tracing::warn!(session, "Unexpected {} from client", other.type_name());
            }
        }
    }
}
