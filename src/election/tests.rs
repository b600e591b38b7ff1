use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;

use futures::StreamExt;

use super::*;
use crate::client::{Backend, Callback, LocalBackend, StateHandler};
use crate::error::StoreError;
use crate::store::{CreateMode, MemoryStore, Request, Watcher};

const PATH: &str = "/services/db/leader";

/// Stale timeout used by `join`
const STALE: Duration = Duration::from_millis(600);

fn leader() -> LeadershipState {
    LeadershipState::ElectedAsLeader
}

fn standby(id: &str) -> LeadershipState {
    LeadershipState::Standby(Some(id.to_string()))
}

fn unknown() -> LeadershipState {
    LeadershipState::Standby(None)
}

async fn next(stream: &mut LeadershipStream) -> Option<Result<LeadershipState>> {
    tokio::time::timeout(Duration::from_secs(5), stream.next())
        .await
        .expect("no transition within 5s")
}

async fn expect(stream: &mut LeadershipStream, expected: LeadershipState) {
    match next(stream).await {
        Some(Ok(state)) => assert_eq!(state, expected),
        other => panic!("expected {expected}, got {other:?}"),
    }
}

async fn expect_end(stream: &mut LeadershipStream) {
    match next(stream).await {
        None => {}
        other => panic!("expected end of stream, got {other:?}"),
    }
}

fn join(conn: &Connection, id: &str) -> (ElectionHandle, LeadershipStream) {
    Election::new(conn, PATH, id)
        .stale_timeout(STALE)
        .spawn()
        .unwrap()
}

async fn registered(conn: &Connection) -> usize {
    match conn.children(PATH).await {
        Ok(children) => children.names.len(),
        Err(StoreError::NoNode(_)) => 0,
        Err(e) => panic!("children failed: {e}"),
    }
}

#[tokio::test]
async fn test_cancel_ends_with_unknown_leader() {
    let store = MemoryStore::new();
    let (conn, _) = Connection::local(&store);

    let (handle, mut states) = join(&conn, "10.0.0.1:5432");
    expect(&mut states, leader()).await;
    assert_eq!(registered(&conn).await, 1);

    handle.cancel();
    handle.cancel();
    expect(&mut states, unknown()).await;
    expect_end(&mut states).await;

    handle.stopped().await;
    assert!(handle.is_stopped());
    assert_eq!(registered(&conn).await, 0);
    assert_eq!(conn.observer_counts().total(), 0);
}

#[tokio::test]
async fn test_cancel_before_first_poll_does_nothing() {
    let store = MemoryStore::new();
    let (conn, _) = Connection::local(&store);

    let (handle, mut states) = join(&conn, "a");
    handle.cancel();
    handle.stopped().await;

    expect_end(&mut states).await;
    assert_eq!(registered(&conn).await, 0);
    assert_eq!(conn.observer_counts().total(), 0);
}

#[tokio::test]
async fn test_invalid_arguments_fail_synchronously() {
    let store = MemoryStore::new();
    let (conn, _) = Connection::local(&store);

    for (path, id) in [("election", "a"), ("/election/", "a"), ("/", "a"), ("/election", "")] {
        let err = Election::new(&conn, path, id).spawn().unwrap_err();
        assert!(matches!(err, Error::Config(_)), "{path:?} {id:?}");
    }

    let err = Election::new(&conn, PATH, "a")
        .stale_timeout(Duration::ZERO)
        .spawn()
        .unwrap_err();
    assert!(matches!(err, Error::Config(_)));
}

#[tokio::test]
async fn test_closing_connection_abdicates() {
    let store = MemoryStore::new();
    let (conn, _) = Connection::local(&store);
    let (observer, _) = Connection::local(&store);

    let (handle, mut states) = join(&conn, "a");
    expect(&mut states, leader()).await;

    let started = Instant::now();
    let closer = conn.clone();
    let closed = tokio::spawn(async move { closer.close().await });

    expect(&mut states, unknown()).await;
    assert!(started.elapsed() < STALE, "abdicated after {:?}", started.elapsed());
    expect_end(&mut states).await;
    closed.await.unwrap();
    handle.stopped().await;

    assert!(conn.is_closed());
    assert_eq!(registered(&observer).await, 0);
    assert_eq!(conn.observer_counts().total(), 0);
}

#[tokio::test]
async fn test_standby_promoted_when_leader_leaves() {
    let store = MemoryStore::new();
    let (conn_a, _) = Connection::local(&store);
    let (conn_b, _) = Connection::local(&store);

    let (a, mut a_states) = join(&conn_a, "a");
    expect(&mut a_states, leader()).await;

    let (_b, mut b_states) = join(&conn_b, "b");
    expect(&mut b_states, standby("a")).await;

    a.cancel();
    expect(&mut a_states, unknown()).await;
    expect_end(&mut a_states).await;

    expect(&mut b_states, leader()).await;
    assert_eq!(registered(&conn_b).await, 1);
}

#[tokio::test]
async fn test_leader_session_expiry_promotes_standby() {
    let store = MemoryStore::new();
    let (conn_a, backend_a) = Connection::local(&store);
    let (conn_b, _) = Connection::local(&store);

    let (_a, mut a_states) = join(&conn_a, "a");
    expect(&mut a_states, leader()).await;
    let (_b, mut b_states) = join(&conn_b, "b");
    expect(&mut b_states, standby("a")).await;

    backend_a.expire();
    expect(&mut a_states, unknown()).await;
    expect(&mut b_states, leader()).await;

    // Back online with a fresh session, a finds its node gone and stops
    backend_a.reconnect();
    expect_end(&mut a_states).await;
    assert_eq!(conn_a.observer_counts().total(), 0);
}

#[tokio::test]
async fn test_duplicate_id_fails_exactly_one() {
    let store = MemoryStore::new();
    let (conn, _) = Connection::local(&store);

    let (h1, mut s1) = join(&conn, "dup");
    let (h2, mut s2) = join(&conn, "dup");
    let (r1, r2) = tokio::join!(next(&mut s1), next(&mut s2));

    let mut results = [r1, r2];
    let failed: Vec<usize> = results
        .iter()
        .enumerate()
        .filter(|(_, r)| matches!(r, Some(Err(Error::DuplicateParticipant(_)))))
        .map(|(i, _)| i)
        .collect();
    assert_eq!(failed.len(), 1, "{results:?}");

    let loser = failed[0];
    match results[loser].take() {
        Some(Err(e)) => assert!(e.to_string().contains("dup")),
        other => panic!("unexpected {other:?}"),
    }
    assert!(matches!(results[1 - loser], Some(Ok(LeadershipState::ElectedAsLeader))));

    let (winner_handle, winner_states, loser_states) = if loser == 0 {
        (h2, &mut s2, &mut s1)
    } else {
        (h1, &mut s1, &mut s2)
    };
    expect_end(loser_states).await;

    winner_handle.cancel();
    expect(winner_states, unknown()).await;
    expect_end(winner_states).await;
    assert_eq!(registered(&conn).await, 0);
}

#[tokio::test]
async fn test_suspension_reports_unknown_then_reaffirms() {
    let store = MemoryStore::new();
    let (conn_a, backend_a) = Connection::local(&store);
    let (conn_b, backend_b) = Connection::local(&store);

    let (_a, mut a_states) = join(&conn_a, "a");
    expect(&mut a_states, leader()).await;
    let (_b, mut b_states) = join(&conn_b, "b");
    expect(&mut b_states, standby("a")).await;

    backend_a.suspend();
    backend_b.suspend();
    expect(&mut a_states, unknown()).await;
    expect(&mut b_states, unknown()).await;

    backend_a.reconnect();
    backend_b.reconnect();
    expect(&mut a_states, leader()).await;
    expect(&mut b_states, standby("a")).await;
}

#[tokio::test]
async fn test_read_only_connection_reports_unknown() {
    let store = MemoryStore::new();
    let (conn, backend) = Connection::local(&store);

    let (_h, mut states) = join(&conn, "a");
    expect(&mut states, leader()).await;

    backend.set_read_only(true);
    expect(&mut states, unknown()).await;
    backend.set_read_only(false);
    expect(&mut states, leader()).await;
}

#[tokio::test]
async fn test_silent_outage_detected_within_stale_timeout() {
    let store = MemoryStore::new();
    let (conn, backend) = Connection::local(&store);
    let stale_timeout = Duration::from_millis(300);

    let (_h, mut states) = Election::new(&conn, PATH, "a")
        .stale_timeout(stale_timeout)
        .spawn()
        .unwrap();
    expect(&mut states, leader()).await;

    let started = tokio::time::Instant::now();
    backend.partition();
    expect(&mut states, unknown()).await;
    // Scheduling slack on top of the bound
    assert!(started.elapsed() <= stale_timeout + Duration::from_millis(150));

    backend.heal();
    expect(&mut states, leader()).await;
}

#[tokio::test]
async fn test_dropping_stream_withdraws() {
    let store = MemoryStore::new();
    let (conn, _) = Connection::local(&store);

    let (handle, mut states) = join(&conn, "a");
    expect(&mut states, leader()).await;
    drop(states);

    tokio::time::timeout(Duration::from_secs(5), handle.stopped())
        .await
        .unwrap();
    assert_eq!(registered(&conn).await, 0);
    assert_eq!(conn.observer_counts().total(), 0);
}

#[tokio::test]
async fn test_repeated_cycles_do_not_leak_observers() {
    let store = MemoryStore::new();
    let (conn, _) = Connection::local(&store);
    let baseline = conn.observer_counts();

    for i in 0..5 {
        let (handle, mut states) = join(&conn, &format!("p{i}"));
        expect(&mut states, leader()).await;
        assert!(conn.observer_counts().total() > baseline.total());

        handle.cancel();
        expect(&mut states, unknown()).await;
        expect_end(&mut states).await;
        handle.stopped().await;
        assert_eq!(conn.observer_counts(), baseline);
    }
    assert_eq!(store.watch_count(), 0);
}

#[tokio::test]
async fn test_at_most_one_leader_through_failovers() {
    let store = MemoryStore::new();
    let ids = ["n0", "n1", "n2", "n3"];
    let mut members: Vec<_> = ids
        .iter()
        .map(|id| {
            let (conn, _) = Connection::local(&store);
            let (handle, states) = join(&conn, id);
            (id.to_string(), handle, states, None::<LeadershipState>)
        })
        .collect();

    while !members.is_empty() {
        // Read until every live member agrees on one leader
        loop {
            for member in members.iter_mut() {
                while let Ok(Some(Ok(state))) =
                    tokio::time::timeout(Duration::from_millis(50), member.2.next()).await
                {
                    member.3 = Some(state);
                }
            }

            let leaders: Vec<&String> = members
                .iter()
                .filter(|m| m.3 == Some(LeadershipState::ElectedAsLeader))
                .map(|m| &m.0)
                .collect();
            assert!(leaders.len() <= 1, "two leaders at once: {leaders:?}");

            if let [leader] = leaders.as_slice() {
                let agreed = members
                    .iter()
                    .filter(|m| &m.0 != *leader)
                    .all(|m| m.3.as_ref().and_then(|s| s.leader_id()) == Some(leader.as_str()));
                if agreed {
                    break;
                }
            }
        }

        let index = members
            .iter()
            .position(|m| m.3 == Some(LeadershipState::ElectedAsLeader))
            .unwrap();
        let (_, handle, mut states, _) = members.remove(index);
        handle.cancel();
        expect(&mut states, unknown()).await;
        expect_end(&mut states).await;
    }
}

#[tokio::test]
async fn test_slow_consumer_sees_every_transition_in_order() {
    let store = MemoryStore::new();
    let (conn, backend) = Connection::local(&store);

    let (_h, mut states) = Election::new(&conn, PATH, "a")
        .buffer(1)
        .spawn()
        .unwrap();
    expect(&mut states, leader()).await;

    for _ in 0..3 {
        backend.suspend();
        backend.reconnect();
    }

    let mut seen = vec![leader()];
    while let Ok(Some(Ok(state))) =
        tokio::time::timeout(Duration::from_millis(300), states.next()).await
    {
        seen.push(state);
    }

    assert_eq!(seen.last(), Some(&leader()));
    assert!(seen.len() >= 3, "{seen:?}");
    for pair in seen.windows(2) {
        assert_ne!(pair[0], pair[1], "{seen:?}");
    }
}

/// Backend whose first registration lands in the store but reports a lost connection
struct LostReplyBackend {
    inner: Arc<LocalBackend>,
    dropped: AtomicBool,
}

impl Backend for LostReplyBackend {
    fn submit(&self, request: Request, watcher: Option<Watcher>, callback: Callback) {
        let registration = matches!(
            request,
            Request::Create {
                mode: CreateMode::EphemeralSequential,
                ..
            }
        );
        if registration && !self.dropped.swap(true, Ordering::SeqCst) {
            let lost: Callback = Box::new(move |_| callback(Err(StoreError::ConnectionLoss)));
            self.inner.submit(request, watcher, lost);
        } else {
            self.inner.submit(request, watcher, callback);
        }
    }

    fn attach(&self, handler: StateHandler) {
        self.inner.attach(handler);
    }

    fn session_id(&self) -> u64 {
        self.inner.session_id()
    }

    fn close(&self) {
        self.inner.close();
    }
}

#[tokio::test]
async fn test_registration_adopts_node_after_lost_reply() {
    let store = MemoryStore::new();
    let backend = Arc::new(LostReplyBackend {
        inner: LocalBackend::new(&store),
        dropped: AtomicBool::new(false),
    });
    let conn = Connection::open(backend);

    let (_h, mut states) = Election::new(&conn, PATH, "a")
        .stale_timeout(Duration::from_millis(300))
        .spawn()
        .unwrap();

    // The lost reply degrades first; the retry finds the node instead of creating another
    expect(&mut states, unknown()).await;
    expect(&mut states, leader()).await;
    assert_eq!(registered(&conn).await, 1);
}

/// Backend that fails the first sibling listing after registering
struct FlakyListingBackend {
    inner: Arc<LocalBackend>,
    registered: AtomicBool,
    failed: AtomicBool,
}

impl Backend for FlakyListingBackend {
    fn submit(&self, request: Request, watcher: Option<Watcher>, callback: Callback) {
        match &request {
            Request::Create {
                mode: CreateMode::EphemeralSequential,
                ..
            } => self.registered.store(true, Ordering::SeqCst),
            Request::GetChildren { .. }
                if self.registered.load(Ordering::SeqCst)
                    && !self.failed.swap(true, Ordering::SeqCst) =>
            {
                callback(Err(StoreError::ConnectionLoss));
                return;
            }
            _ => {}
        }
        self.inner.submit(request, watcher, callback);
    }

    fn attach(&self, handler: StateHandler) {
        self.inner.attach(handler);
    }

    fn session_id(&self) -> u64 {
        self.inner.session_id()
    }

    fn close(&self) {
        self.inner.close();
    }
}

#[tokio::test]
async fn test_duplicate_detected_after_interrupted_check() {
    let store = MemoryStore::new();
    let (conn_a, _) = Connection::local(&store);
    let (_a, mut a_states) = join(&conn_a, "dup");
    expect(&mut a_states, leader()).await;

    let conn_b = Connection::open(Arc::new(FlakyListingBackend {
        inner: LocalBackend::new(&store),
        registered: AtomicBool::new(false),
        failed: AtomicBool::new(false),
    }));
    let (b, mut b_states) = join(&conn_b, "dup");

    expect(&mut b_states, unknown()).await;
    match next(&mut b_states).await {
        Some(Err(Error::DuplicateParticipant(id))) => assert_eq!(id, "dup"),
        other => panic!("expected duplicate participant error, got {other:?}"),
    }
    expect_end(&mut b_states).await;
    b.stopped().await;

    assert_eq!(registered(&conn_a).await, 1);
}

/// Backend that stops answering once stalled, holding every callback
struct StalledBackend {
    inner: Arc<LocalBackend>,
    stalled: AtomicBool,
    parked: Mutex<Vec<Callback>>,
}

impl Backend for StalledBackend {
    fn submit(&self, request: Request, watcher: Option<Watcher>, callback: Callback) {
        if self.stalled.load(Ordering::SeqCst) {
            self.parked.lock().unwrap().push(callback);
        } else {
            self.inner.submit(request, watcher, callback);
        }
    }

    fn attach(&self, handler: StateHandler) {
        self.inner.attach(handler);
    }

    fn session_id(&self) -> u64 {
        self.inner.session_id()
    }

    fn close(&self) {
        self.inner.close();
    }
}

#[tokio::test]
async fn test_unresponsive_store_reports_unknown_within_stale_timeout() {
    let store = MemoryStore::new();
    let backend = Arc::new(StalledBackend {
        inner: LocalBackend::new(&store),
        stalled: AtomicBool::new(false),
        parked: Mutex::new(Vec::new()),
    });
    let conn = Connection::open(backend.clone());

    let (_h, mut states) = join(&conn, "a");
    expect(&mut states, leader()).await;

    let started = Instant::now();
    backend.stalled.store(true, Ordering::SeqCst);
    expect(&mut states, unknown()).await;
    assert!(
        started.elapsed() <= STALE + Duration::from_millis(200),
        "degraded after {:?}",
        started.elapsed()
    );
    assert!(!backend.parked.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_reconnect_cycles_keep_one_sibling_watch() {
    let store = MemoryStore::new();
    let (conn, backend) = Connection::local(&store);

    let (_h, mut states) = join(&conn, "a");
    expect(&mut states, leader()).await;
    assert_eq!(store.watch_count(), 1);

    for _ in 0..20 {
        backend.suspend();
        expect(&mut states, unknown()).await;
        backend.reconnect();
        expect(&mut states, leader()).await;
    }
    backend.set_read_only(true);
    expect(&mut states, unknown()).await;
    backend.set_read_only(false);
    expect(&mut states, leader()).await;

    assert_eq!(store.watch_count(), 1);
    assert_eq!(conn.observer_counts().watches, 1);
}
