//! Data Tree
//!
//! Hierarchical node namespace with one-shot typed watches. The tree is
//! a plain state machine: it never calls a watcher itself, it hands the
//! triggered ones back so the caller can run them after dropping its lock.

use std::collections::{BTreeSet, HashMap};

use super::path;
use super::types::{
    Acl, CreateMode, EventKind, Perms, Request, Response, Stat, WatchEvent, WatchType,
};
use crate::error::StoreError;

/// One-shot watch callback
pub type Watcher = Box<dyn FnOnce(WatchEvent) + Send>;

/// Watchers triggered by a mutation, waiting to be run outside the lock
#[derive(Default)]
pub struct Fired {
    pending: Vec<(Watcher, WatchEvent)>,
}

impl Fired {
    /// Run every triggered watcher
    pub fn deliver(self) {
        for (watcher, event) in self.pending {
            watcher(event);
        }
    }

    /// Number of triggered watchers
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// A single node
struct Node {
    data: Vec<u8>,
    acl: Vec<Acl>,
    stat: Stat,
    children: BTreeSet<String>,
    /// Next suffix handed to a sequential child; never decreases
    next_sequence: u64,
}

impl Node {
    fn new(data: Vec<u8>, acl: Vec<Acl>, stat: Stat) -> Self {
        Self {
            data,
            acl,
            stat,
            children: BTreeSet::new(),
            next_sequence: 0,
        }
    }
}

/// In-memory node tree
pub struct DataTree {
    nodes: HashMap<String, Node>,
    /// Last transaction id
    zxid: u64,
    /// Armed watches with their owning session
    watches: HashMap<(String, WatchType), Vec<(u64, Watcher)>>,
}

impl Default for DataTree {
    fn default() -> Self {
        Self::new()
    }
}

impl DataTree {
    /// Create a tree holding only the root node
    pub fn new() -> Self {
        let mut nodes = HashMap::new();
        nodes.insert("/".to_string(), Node::new(Vec::new(), Acl::open_unsafe(), Stat::default()));
        Self {
            nodes,
            zxid: 0,
            watches: HashMap::new(),
        }
    }

    /// Number of nodes, root included
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.len() <= 1
    }

    /// Last transaction id
    pub fn zxid(&self) -> u64 {
        self.zxid
    }

    /// Number of armed watches
    pub fn watch_count(&self) -> usize {
        self.watches.values().map(Vec::len).sum()
    }

    /// Metadata of a node
    pub fn stat(&self, path: &str) -> Option<Stat> {
        self.nodes.get(path).map(|n| n.stat)
    }

    /// Arm a one-shot watch
    pub fn add_watch(&mut self, session: u64, path: &str, watch: WatchType, watcher: Watcher) {
        self.watches
            .entry((path.to_string(), watch))
            .or_default()
            .push((session, watcher));
    }

    /// Drop every watch a session armed, returning how many went
    pub fn remove_watches(&mut self, session: u64) -> usize {
        let before = self.watch_count();
        self.watches.retain(|_, watchers| {
            watchers.retain(|(owner, _)| *owner != session);
            !watchers.is_empty()
        });
        before - self.watch_count()
    }

    /// Apply one request on behalf of a session
    pub fn apply(
        &mut self,
        session: u64,
        auth: &[(String, String)],
        request: Request,
        fired: &mut Fired,
    ) -> Result<Response, StoreError> {
        path::validate(request.path())?;

        match request {
            Request::Create { path, data, acl, mode } => {
                self.create(session, auth, &path, data, acl, mode, fired)
            }
            Request::Delete { path, version } => self.delete(auth, &path, version, fired),
            Request::GetChildren { path } => {
                let node = self.readable(&path, auth)?;
                Ok(Response::Children {
                    children: node.children.iter().cloned().collect(),
                    stat: node.stat,
                })
            }
            Request::GetData { path } => {
                let node = self.readable(&path, auth)?;
                Ok(Response::Data {
                    data: node.data.clone(),
                    stat: node.stat,
                })
            }
            Request::SetData { path, data, version } => {
                self.set_data(auth, &path, data, version, fired)
            }
            Request::Exists { path } => Ok(Response::Exists {
                stat: self.stat(&path),
            }),
            Request::Sync { .. } => Ok(Response::Synced),
            Request::GetAcl { path } => {
                let node = self.node(&path)?;
                Ok(Response::Acl {
                    acl: node.acl.clone(),
                    stat: node.stat,
                })
            }
            Request::SetAcl { path, acl, version } => self.set_acl(auth, &path, acl, version),
        }
    }

    /// Delete every ephemeral node owned by a session
    pub fn remove_ephemerals(&mut self, session: u64, fired: &mut Fired) -> Vec<String> {
        let owned: Vec<String> = self
            .nodes
            .iter()
            .filter(|(_, node)| node.stat.ephemeral_owner == session)
            .map(|(path, _)| path.clone())
            .collect();

        for path in &owned {
            self.unlink(path, fired);
        }
        owned
    }

    #[allow(clippy::too_many_arguments)]
    fn create(
        &mut self,
        session: u64,
        auth: &[(String, String)],
        path: &str,
        data: Vec<u8>,
        acl: Vec<Acl>,
        mode: CreateMode,
        fired: &mut Fired,
    ) -> Result<Response, StoreError> {
        let parent_path = match path::parent(path) {
            Some(p) => p.to_string(),
            None => return Err(StoreError::NodeExists(path.to_string())),
        };
        if acl.is_empty() {
            return Err(StoreError::InvalidArgument(format!("{path}: empty ACL")));
        }

        self.check(&parent_path, auth, Perms::CREATE)?;
        let zxid = self.zxid + 1;
        let parent = self
            .nodes
            .get_mut(&parent_path)
            .ok_or_else(|| StoreError::NoNode(parent_path.clone()))?;
        if parent.stat.is_ephemeral() {
            return Err(StoreError::NoChildrenForEphemerals(parent_path));
        }

        let full_path = if mode.is_sequential() {
            let seq = parent.next_sequence;
            path::with_sequence(path, seq)
        } else {
            path.to_string()
        };
        let name = path::node_name(&full_path).to_string();
        if parent.children.contains(&name) {
            return Err(StoreError::NodeExists(full_path));
        }

        if mode.is_sequential() {
            parent.next_sequence += 1;
        }
        parent.children.insert(name);
        parent.stat.cversion += 1;
        parent.stat.pzxid = zxid;
        parent.stat.num_children = parent.children.len();

        let now = chrono::Utc::now().timestamp_millis();
        let stat = Stat {
            czxid: zxid,
            mzxid: zxid,
            pzxid: zxid,
            ctime: now,
            mtime: now,
            ephemeral_owner: if mode.is_ephemeral() { session } else { 0 },
            data_length: data.len(),
            ..Stat::default()
        };
        self.nodes.insert(full_path.clone(), Node::new(data, acl, stat));
        self.zxid = zxid;

        self.trigger(WatchEvent::new(EventKind::NodeCreated, full_path.clone()), fired);
        self.trigger(WatchEvent::new(EventKind::NodeChildrenChanged, parent_path), fired);

        Ok(Response::Created { path: full_path })
    }

    fn delete(
        &mut self,
        auth: &[(String, String)],
        path: &str,
        version: Option<i32>,
        fired: &mut Fired,
    ) -> Result<Response, StoreError> {
        let parent_path = path::parent(path)
            .ok_or_else(|| StoreError::InvalidArgument("cannot delete the root node".into()))?;
        let node = self.node(path)?;
        check_version(path, version, node.stat.version)?;
        if !node.children.is_empty() {
            return Err(StoreError::NotEmpty(path.to_string()));
        }
        self.check(parent_path, auth, Perms::DELETE)?;

        self.unlink(path, fired);
        Ok(Response::Deleted)
    }

    fn set_data(
        &mut self,
        auth: &[(String, String)],
        path: &str,
        data: Vec<u8>,
        version: Option<i32>,
        fired: &mut Fired,
    ) -> Result<Response, StoreError> {
        self.check(path, auth, Perms::WRITE)?;
        let zxid = self.zxid + 1;
        let node = self
            .nodes
            .get_mut(path)
            .ok_or_else(|| StoreError::NoNode(path.to_string()))?;
        check_version(path, version, node.stat.version)?;

        node.stat.data_length = data.len();
        node.data = data;
        node.stat.version += 1;
        node.stat.mzxid = zxid;
        node.stat.mtime = chrono::Utc::now().timestamp_millis();
        let stat = node.stat;
        self.zxid = zxid;

        self.trigger(WatchEvent::new(EventKind::NodeDataChanged, path), fired);
        Ok(Response::Stat { stat })
    }

    fn set_acl(
        &mut self,
        auth: &[(String, String)],
        path: &str,
        acl: Vec<Acl>,
        version: Option<i32>,
    ) -> Result<Response, StoreError> {
        if acl.is_empty() {
            return Err(StoreError::InvalidArgument(format!("{path}: empty ACL")));
        }
        self.check(path, auth, Perms::ADMIN)?;
        let zxid = self.zxid + 1;
        let node = self
            .nodes
            .get_mut(path)
            .ok_or_else(|| StoreError::NoNode(path.to_string()))?;
        check_version(path, version, node.stat.aversion)?;

        node.acl = acl;
        node.stat.aversion += 1;
        let stat = node.stat;
        self.zxid = zxid;
        Ok(Response::Stat { stat })
    }

    /// Remove a childless node and fire its watches
    fn unlink(&mut self, path: &str, fired: &mut Fired) {
        if self.nodes.remove(path).is_none() {
            return;
        }
        self.zxid += 1;
        let zxid = self.zxid;

        let parent_path = path::parent(path).map(str::to_string);
        if let Some(parent_path) = &parent_path {
            if let Some(parent) = self.nodes.get_mut(parent_path) {
                parent.children.remove(path::node_name(path));
                parent.stat.cversion += 1;
                parent.stat.pzxid = zxid;
                parent.stat.num_children = parent.children.len();
            }
        }

        self.trigger(WatchEvent::new(EventKind::NodeDeleted, path), fired);
        if let Some(parent_path) = parent_path {
            self.trigger(WatchEvent::new(EventKind::NodeChildrenChanged, parent_path), fired);
        }
    }

    fn trigger(&mut self, event: WatchEvent, fired: &mut Fired) {
        for watch in [WatchType::Data, WatchType::Exists, WatchType::Children] {
            if !event.triggers(watch) {
                continue;
            }
            if let Some(watchers) = self.watches.remove(&(event.path.clone(), watch)) {
                fired
                    .pending
                    .extend(watchers.into_iter().map(|(_, w)| (w, event.clone())));
            }
        }
    }

    fn node(&self, path: &str) -> Result<&Node, StoreError> {
        self.nodes
            .get(path)
            .ok_or_else(|| StoreError::NoNode(path.to_string()))
    }

    fn readable(&self, path: &str, auth: &[(String, String)]) -> Result<&Node, StoreError> {
        self.check(path, auth, Perms::READ)?;
        self.node(path)
    }

    /// Check that a session may perform `perm` on an existing node
    fn check(&self, path: &str, auth: &[(String, String)], perm: Perms) -> Result<(), StoreError> {
        let node = self.node(path)?;
        if node
            .acl
            .iter()
            .any(|entry| entry.perms.contains(perm) && entry.matches(auth))
        {
            Ok(())
        } else {
            Err(StoreError::NoAuth(format!("{path} requires {perm}")))
        }
    }
}

fn check_version(path: &str, expected: Option<i32>, actual: i32) -> Result<(), StoreError> {
    match expected {
        Some(expected) if expected != actual => Err(StoreError::BadVersion {
            path: path.to_string(),
            expected,
            actual,
        }),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn create(tree: &mut DataTree, path: &str, mode: CreateMode) -> Result<String, StoreError> {
        let mut fired = Fired::default();
        let response = tree.apply(
            7,
            &[],
            Request::Create {
                path: path.to_string(),
                data: b"payload".to_vec(),
                acl: Acl::open_unsafe(),
                mode,
            },
            &mut fired,
        )?;
        fired.deliver();
        match response {
            Response::Created { path } => Ok(path),
            other => panic!("unexpected response {other:?}"),
        }
    }

    #[test]
    fn test_create_requires_parent() {
        let mut tree = DataTree::new();
        let err = create(&mut tree, "/a/b", CreateMode::Persistent).unwrap_err();
        assert_eq!(err, StoreError::NoNode("/a".into()));

        create(&mut tree, "/a", CreateMode::Persistent).unwrap();
        create(&mut tree, "/a/b", CreateMode::Persistent).unwrap();
        assert_eq!(tree.stat("/a").unwrap().num_children, 1);
        assert!(matches!(
            create(&mut tree, "/a/b", CreateMode::Persistent),
            Err(StoreError::NodeExists(_))
        ));
    }

    #[test]
    fn test_sequence_numbers_increase() {
        let mut tree = DataTree::new();
        create(&mut tree, "/e", CreateMode::Persistent).unwrap();
        let first = create(&mut tree, "/e/n_", CreateMode::EphemeralSequential).unwrap();
        let second = create(&mut tree, "/e/n_", CreateMode::EphemeralSequential).unwrap();
        assert_eq!(first, "/e/n_0000000000");
        assert_eq!(second, "/e/n_0000000001");

        // Deleting does not reuse a suffix
        let mut fired = Fired::default();
        tree.apply(7, &[], Request::Delete { path: second, version: None }, &mut fired)
            .unwrap();
        let third = create(&mut tree, "/e/n_", CreateMode::EphemeralSequential).unwrap();
        assert_eq!(third, "/e/n_0000000002");
    }

    #[test]
    fn test_ephemeral_cannot_have_children() {
        let mut tree = DataTree::new();
        create(&mut tree, "/eph", CreateMode::Ephemeral).unwrap();
        let err = create(&mut tree, "/eph/child", CreateMode::Persistent).unwrap_err();
        assert_eq!(err, StoreError::NoChildrenForEphemerals("/eph".into()));
    }

    #[test]
    fn test_set_data_bumps_version_once() {
        let mut tree = DataTree::new();
        create(&mut tree, "/cfg", CreateMode::Persistent).unwrap();
        let mut fired = Fired::default();
        for expected in 1..=3 {
            let response = tree
                .apply(
                    7,
                    &[],
                    Request::SetData {
                        path: "/cfg".into(),
                        data: vec![expected as u8],
                        version: None,
                    },
                    &mut fired,
                )
                .unwrap();
            assert!(matches!(response, Response::Stat { stat } if stat.version == expected));
        }

        let err = tree
            .apply(
                7,
                &[],
                Request::SetData {
                    path: "/cfg".into(),
                    data: Vec::new(),
                    version: Some(0),
                },
                &mut fired,
            )
            .unwrap_err();
        assert!(matches!(err, StoreError::BadVersion { expected: 0, actual: 3, .. }));
    }

    #[test]
    fn test_delete_not_empty() {
        let mut tree = DataTree::new();
        create(&mut tree, "/p", CreateMode::Persistent).unwrap();
        create(&mut tree, "/p/c", CreateMode::Persistent).unwrap();
        let mut fired = Fired::default();
        let err = tree
            .apply(7, &[], Request::Delete { path: "/p".into(), version: None }, &mut fired)
            .unwrap_err();
        assert_eq!(err, StoreError::NotEmpty("/p".into()));
    }

    #[test]
    fn test_child_watch_fires_once() {
        let mut tree = DataTree::new();
        create(&mut tree, "/e", CreateMode::Persistent).unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        tree.add_watch(
            7,
            "/e",
            WatchType::Children,
            Box::new(move |event| sink.lock().unwrap().push(event)),
        );
        assert_eq!(tree.watch_count(), 1);

        create(&mut tree, "/e/a", CreateMode::Persistent).unwrap();
        create(&mut tree, "/e/b", CreateMode::Persistent).unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0], WatchEvent::new(EventKind::NodeChildrenChanged, "/e"));
        assert_eq!(tree.watch_count(), 0);
    }

    #[test]
    fn test_remove_session_watches() {
        let mut tree = DataTree::new();
        tree.add_watch(1, "/a", WatchType::Exists, Box::new(|_| {}));
        tree.add_watch(2, "/a", WatchType::Exists, Box::new(|_| {}));
        tree.add_watch(1, "/b", WatchType::Data, Box::new(|_| {}));

        assert_eq!(tree.remove_watches(1), 2);
        assert_eq!(tree.watch_count(), 1);
    }

    #[test]
    fn test_remove_ephemerals() {
        let mut tree = DataTree::new();
        create(&mut tree, "/e", CreateMode::Persistent).unwrap();
        create(&mut tree, "/e/n_", CreateMode::EphemeralSequential).unwrap();
        create(&mut tree, "/e/n_", CreateMode::EphemeralSequential).unwrap();

        let mut fired = Fired::default();
        let removed = tree.remove_ephemerals(7, &mut fired);
        assert_eq!(removed.len(), 2);
        assert_eq!(tree.stat("/e").unwrap().num_children, 0);
        assert!(tree.stat("/e").is_some());
    }

    #[test]
    fn test_acl_enforced() {
        let mut tree = DataTree::new();
        let mut fired = Fired::default();
        tree.apply(
            7,
            &[],
            Request::Create {
                path: "/locked".into(),
                data: Vec::new(),
                acl: Acl::read_unsafe(),
                mode: CreateMode::Persistent,
            },
            &mut fired,
        )
        .unwrap();

        let err = create(&mut tree, "/locked/child", CreateMode::Persistent).unwrap_err();
        assert!(matches!(err, StoreError::NoAuth(_)));
    }
}
