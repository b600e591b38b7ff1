//! Store Operations
//!
//! Future-returning wrappers over the backend's callback API. Each call
//! is a single submission; nothing here retries.

use std::collections::BTreeSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

use tokio::sync::oneshot;

use super::{Connection, ConnectionInner};
use crate::error::StoreError;
use crate::store::path;
use crate::store::{Acl, CreateMode, Request, Response, Stat, WatchEvent, Watcher};

/// Options for [`Connection::create`]
#[derive(Debug, Clone)]
pub struct CreateOptions {
    pub data: Vec<u8>,
    pub acl: Vec<Acl>,
    pub mode: CreateMode,
    /// Create missing ancestors as persistent nodes
    pub create_parents: bool,
}

impl Default for CreateOptions {
    fn default() -> Self {
        Self {
            data: Vec::new(),
            acl: Acl::open_unsafe(),
            mode: CreateMode::Persistent,
            create_parents: false,
        }
    }
}

impl CreateOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn data(mut self, data: impl Into<Vec<u8>>) -> Self {
        self.data = data.into();
        self
    }

    pub fn acl(mut self, acl: Vec<Acl>) -> Self {
        self.acl = acl;
        self
    }

    pub fn mode(mut self, mode: CreateMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn create_parents(mut self, create_parents: bool) -> Self {
        self.create_parents = create_parents;
        self
    }
}

/// Children of a node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Children {
    pub path: String,
    pub names: BTreeSet<String>,
    pub stat: Stat,
}

/// Payload of a node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeData {
    pub path: String,
    pub data: Vec<u8>,
    pub stat: Stat,
}

/// One-shot watch armed through a [`Connection`]
///
/// Resolves with the triggering event, or `None` if the store dropped
/// the watch (session closed). Dropping it deregisters the watch from
/// the connection's registry.
#[must_use = "a dropped Watch never reports its event"]
pub struct Watch {
    id: u64,
    path: String,
    rx: oneshot::Receiver<WatchEvent>,
    registry: Weak<ConnectionInner>,
}

impl Watch {
    /// Path the watch was armed on
    pub fn path(&self) -> &str {
        &self.path
    }
}

impl Future for Watch {
    type Output = Option<WatchEvent>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(Result::ok)
    }
}

impl Drop for Watch {
    fn drop(&mut self) {
        if let Some(inner) = self.registry.upgrade() {
            inner.watches.remove(self.id);
        }
    }
}

impl std::fmt::Debug for Watch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Watch")
            .field("id", &self.id)
            .field("path", &self.path)
            .finish()
    }
}

fn unexpected<T>(request: &'static str, response: Response) -> Result<T, StoreError> {
    tracing::error!(request, ?response, "backend answered with the wrong response type");
    Err(StoreError::UnexpectedResponse(request.to_string()))
}

impl Connection {
    /// Submit one request and wait for its completion
    fn call(
        &self,
        request: Request,
        watcher: Option<Watcher>,
    ) -> impl Future<Output = Result<Response, StoreError>> + Send + 'static {
        let (tx, rx) = oneshot::channel();
        tracing::trace!(op = request.type_name(), path = request.path(), "submitting request");
        self.backend().submit(
            request,
            watcher,
            Box::new(move |result| {
                let _ = tx.send(result);
            }),
        );
        async move { rx.await.unwrap_or(Err(StoreError::Closed)) }
    }

    /// Submit a watchable read, arming a watch registered on this connection
    async fn call_watched(&self, request: Request) -> Result<(Response, Watch), StoreError> {
        let path = request.path().to_string();
        let id = self.inner().watches.add(path.clone());
        let (tx, rx) = oneshot::channel();

        let registry = Arc::downgrade(self.inner());
        let watcher: Watcher = Box::new(move |event| {
            if let Some(inner) = registry.upgrade() {
                if inner.watches.remove(id).is_some() {
                    let _ = tx.send(event);
                }
            }
        });

        // The guard exists before the first await so every exit path deregisters
        let watch = Watch {
            id,
            path,
            rx,
            registry: Arc::downgrade(self.inner()),
        };
        let response = self.call(request, Some(watcher)).await?;
        Ok((response, watch))
    }

    async fn create_one(
        &self,
        path: &str,
        options: &CreateOptions,
        data: Vec<u8>,
        mode: CreateMode,
    ) -> Result<String, StoreError> {
        let request = Request::Create {
            path: path.to_string(),
            data,
            acl: options.acl.clone(),
            mode,
        };
        match self.call(request, None).await? {
            Response::Created { path } => Ok(path),
            other => unexpected("Create", other),
        }
    }

    /// Create a node, returning the path actually created
    pub async fn create(&self, path: &str, options: CreateOptions) -> Result<String, StoreError> {
        path::validate(path)?;

        if options.create_parents {
            for ancestor in path::ancestors(path) {
                match self
                    .create_one(ancestor, &options, Vec::new(), CreateMode::Persistent)
                    .await
                {
                    Ok(_) | Err(StoreError::NodeExists(_)) => {}
                    Err(e) => return Err(e),
                }
            }
        }

        let data = options.data.clone();
        self.create_one(path, &options, data, options.mode).await
    }

    /// Delete a node, returning its path
    ///
    /// With `delete_children` the whole subtree goes, deepest nodes first.
    pub async fn delete(&self, path: &str, delete_children: bool) -> Result<String, StoreError> {
        path::validate(path)?;

        if delete_children {
            let mut order = Vec::new();
            let mut pending = vec![path.to_string()];
            while let Some(current) = pending.pop() {
                match self.children(&current).await {
                    Ok(children) => {
                        pending.extend(children.names.iter().map(|c| path::join(&current, c)));
                    }
                    Err(StoreError::NoNode(_)) if current != path => {}
                    Err(e) => return Err(e),
                }
                order.push(current);
            }

            // Parents precede their children in `order`
            for descendant in order.iter().skip(1).rev() {
                match self.delete_one(descendant).await {
                    Ok(()) | Err(StoreError::NoNode(_)) => {}
                    Err(e) => return Err(e),
                }
            }
        }

        self.delete_one(path).await?;
        Ok(path.to_string())
    }

    async fn delete_one(&self, path: &str) -> Result<(), StoreError> {
        let request = Request::Delete {
            path: path.to_string(),
            version: None,
        };
        match self.call(request, None).await? {
            Response::Deleted => Ok(()),
            other => unexpected("Delete", other),
        }
    }

    /// List the children of a node
    pub async fn children(&self, path: &str) -> Result<Children, StoreError> {
        path::validate(path)?;
        let request = Request::GetChildren { path: path.to_string() };
        match self.call(request, None).await? {
            Response::Children { children, stat } => Ok(Children {
                path: path.to_string(),
                names: children.into_iter().collect(),
                stat,
            }),
            other => unexpected("GetChildren", other),
        }
    }

    /// List the children of a node and watch for the next change to them
    pub async fn children_watched(&self, path: &str) -> Result<(Children, Watch), StoreError> {
        path::validate(path)?;
        let request = Request::GetChildren { path: path.to_string() };
        match self.call_watched(request).await? {
            (Response::Children { children, stat }, watch) => Ok((
                Children {
                    path: path.to_string(),
                    names: children.into_iter().collect(),
                    stat,
                },
                watch,
            )),
            (other, _) => unexpected("GetChildren", other),
        }
    }

    /// Read the payload of a node
    pub async fn data(&self, path: &str) -> Result<NodeData, StoreError> {
        path::validate(path)?;
        let request = Request::GetData { path: path.to_string() };
        match self.call(request, None).await? {
            Response::Data { data, stat } => Ok(NodeData {
                path: path.to_string(),
                data,
                stat,
            }),
            other => unexpected("GetData", other),
        }
    }

    /// Replace the payload of a node
    pub async fn set_data(&self, path: &str, data: impl Into<Vec<u8>>) -> Result<Stat, StoreError> {
        self.set_data_versioned(path, data, None).await
    }

    /// Replace the payload of a node if its version still matches
    pub async fn set_data_versioned(
        &self,
        path: &str,
        data: impl Into<Vec<u8>>,
        version: Option<i32>,
    ) -> Result<Stat, StoreError> {
        path::validate(path)?;
        let request = Request::SetData {
            path: path.to_string(),
            data: data.into(),
            version,
        };
        match self.call(request, None).await? {
            Response::Stat { stat } => Ok(stat),
            other => unexpected("SetData", other),
        }
    }

    /// Metadata of a node, `None` if it does not exist
    pub async fn exists(&self, path: &str) -> Result<Option<Stat>, StoreError> {
        path::validate(path)?;
        let request = Request::Exists { path: path.to_string() };
        match self.call(request, None).await? {
            Response::Exists { stat } => Ok(stat),
            other => unexpected("Exists", other),
        }
    }

    /// Metadata of a node, watching for its creation, change or deletion
    pub async fn exists_watched(&self, path: &str) -> Result<(Option<Stat>, Watch), StoreError> {
        path::validate(path)?;
        let request = Request::Exists { path: path.to_string() };
        match self.call_watched(request).await? {
            (Response::Exists { stat }, watch) => Ok((stat, watch)),
            (other, _) => unexpected("Exists", other),
        }
    }

    /// Consistency barrier for subsequent reads of `path`
    pub async fn sync(&self, path: &str) -> Result<(), StoreError> {
        path::validate(path)?;
        let request = Request::Sync { path: path.to_string() };
        match self.call(request, None).await? {
            Response::Synced => Ok(()),
            other => unexpected("Sync", other),
        }
    }

    /// Access-control list of a node
    pub async fn acl(&self, path: &str) -> Result<(Vec<Acl>, Stat), StoreError> {
        path::validate(path)?;
        let request = Request::GetAcl { path: path.to_string() };
        match self.call(request, None).await? {
            Response::Acl { acl, stat } => Ok((acl, stat)),
            other => unexpected("GetAcl", other),
        }
    }

    /// Replace the access-control list of a node
    pub async fn set_acl(&self, path: &str, acl: Vec<Acl>) -> Result<Stat, StoreError> {
        path::validate(path)?;
        let request = Request::SetAcl {
            path: path.to_string(),
            acl,
            version: None,
        };
        match self.call(request, None).await? {
            Response::Stat { stat } => Ok(stat),
            other => unexpected("SetAcl", other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{EventKind, MemoryStore, Perms};
    use std::time::Duration;

    fn connect() -> (MemoryStore, Connection) {
        let store = MemoryStore::new();
        let (conn, _) = Connection::local(&store);
        (store, conn)
    }

    #[tokio::test]
    async fn test_create_validates_path() {
        let (_, conn) = connect();
        let err = conn.create("election", CreateOptions::new()).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_create_parents() {
        let (_, conn) = connect();
        let err = conn.create("/a/b/c", CreateOptions::new()).await.unwrap_err();
        assert_eq!(err, StoreError::NoNode("/a/b".into()));

        let created = conn
            .create("/a/b/c", CreateOptions::new().data("x").create_parents(true))
            .await
            .unwrap();
        assert_eq!(created, "/a/b/c");
        assert!(conn.exists("/a/b").await.unwrap().is_some());
        assert_eq!(conn.data("/a/b/c").await.unwrap().data, b"x");

        // Existing parents are fine
        conn.create("/a/b/d", CreateOptions::new().create_parents(true))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_sequential_create_returns_assigned_path() {
        let (_, conn) = connect();
        let options = CreateOptions::new()
            .mode(CreateMode::EphemeralSequential)
            .create_parents(true);
        let first = conn.create("/e/n_", options.clone()).await.unwrap();
        let second = conn.create("/e/n_", options).await.unwrap();
        assert_eq!(first, "/e/n_0000000000");
        assert_eq!(second, "/e/n_0000000001");

        let children = conn.children("/e").await.unwrap();
        assert_eq!(children.names.len(), 2);
        assert_eq!(children.stat.num_children, 2);
    }

    #[tokio::test]
    async fn test_delete_children() {
        let (store, conn) = connect();
        for p in ["/t/a/x", "/t/a/y", "/t/b"] {
            conn.create(p, CreateOptions::new().create_parents(true))
                .await
                .unwrap();
        }

        let err = conn.delete("/t", false).await.unwrap_err();
        assert_eq!(err, StoreError::NotEmpty("/t".into()));

        assert_eq!(conn.delete("/t", true).await.unwrap(), "/t");
        assert!(conn.exists("/t").await.unwrap().is_none());
        assert_eq!(store.node_count(), 1);
    }

    #[tokio::test]
    async fn test_set_data_versions() {
        let (_, conn) = connect();
        conn.create("/cfg", CreateOptions::new()).await.unwrap();

        let first = conn.set_data("/cfg", "a").await.unwrap();
        let second = conn.set_data("/cfg", "b").await.unwrap();
        assert_eq!(first.version + 1, second.version);

        let err = conn
            .set_data_versioned("/cfg", "c", Some(first.version))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::BadVersion { .. }));
    }

    #[tokio::test]
    async fn test_exists_and_sync() {
        let (_, conn) = connect();
        assert_eq!(conn.exists("/nope").await.unwrap(), None);
        conn.sync("/nope").await.unwrap();
    }

    #[tokio::test]
    async fn test_acl_roundtrip_and_enforcement() {
        let (_, conn) = connect();
        conn.create("/secure", CreateOptions::new()).await.unwrap();
        conn.set_acl("/secure", Acl::read_unsafe()).await.unwrap();

        let (acl, stat) = conn.acl("/secure").await.unwrap();
        assert_eq!(acl, vec![Acl::world(Perms::READ)]);
        assert_eq!(stat.aversion, 1);

        let err = conn.set_data("/secure", "x").await.unwrap_err();
        assert!(matches!(err, StoreError::NoAuth(_)));
    }

    #[tokio::test]
    async fn test_children_watch() {
        let (_, conn) = connect();
        conn.create("/e", CreateOptions::new()).await.unwrap();

        let (children, watch) = conn.children_watched("/e").await.unwrap();
        assert!(children.names.is_empty());
        assert_eq!(conn.observer_counts().watches, 1);

        conn.create("/e/a", CreateOptions::new()).await.unwrap();
        let event = tokio::time::timeout(Duration::from_secs(1), watch)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.kind, EventKind::NodeChildrenChanged);
        assert_eq!(conn.observer_counts().watches, 0);
    }

    #[tokio::test]
    async fn test_dropped_watch_deregisters() {
        let (_, conn) = connect();
        let (stat, watch) = conn.exists_watched("/later").await.unwrap();
        assert!(stat.is_none());
        assert_eq!(conn.observer_counts().watches, 1);

        drop(watch);
        assert_eq!(conn.observer_counts().watches, 0);

        // Firing a dropped watch is harmless
        conn.create("/later", CreateOptions::new()).await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_read_does_not_leak_watch() {
        let (_, conn) = connect();
        let err = conn.children_watched("/missing").await.unwrap_err();
        assert_eq!(err, StoreError::NoNode("/missing".into()));
        assert_eq!(conn.observer_counts().watches, 0);
    }

    #[tokio::test]
    async fn test_closed_connection_fails_requests() {
        let (_, conn) = connect();
        conn.close().await;
        let err = conn.exists("/").await.unwrap_err();
        assert_eq!(err, StoreError::Closed);
    }
}
