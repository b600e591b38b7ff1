//! Coordination Store Types
//!
//! Node metadata, access control, watch events and the request/response
//! pairs every backend speaks.

use serde::{Deserialize, Serialize};

/// Node metadata
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Stat {
    /// Transaction that created the node
    pub czxid: u64,
    /// Transaction that last modified the node's data
    pub mzxid: u64,
    /// Transaction that last modified the node's children
    pub pzxid: u64,
    /// Creation time (epoch millis)
    pub ctime: i64,
    /// Last data modification time (epoch millis)
    pub mtime: i64,
    /// Number of data changes
    pub version: i32,
    /// Number of child changes
    pub cversion: i32,
    /// Number of ACL changes
    pub aversion: i32,
    /// Owning session for ephemeral nodes, 0 otherwise
    pub ephemeral_owner: u64,
    /// Payload length in bytes
    pub data_length: usize,
    /// Number of children
    pub num_children: usize,
}

impl Stat {
    /// Check if the node is ephemeral
    pub fn is_ephemeral(&self) -> bool {
        self.ephemeral_owner != 0
    }
}

/// Permission bits of an ACL entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Perms(u8);

impl Perms {
    pub const READ: Perms = Perms(1);
    pub const WRITE: Perms = Perms(1 << 1);
    pub const CREATE: Perms = Perms(1 << 2);
    pub const DELETE: Perms = Perms(1 << 3);
    pub const ADMIN: Perms = Perms(1 << 4);
    pub const ALL: Perms = Perms(0b1_1111);
    pub const NONE: Perms = Perms(0);

    /// Check whether every bit of `other` is set
    pub fn contains(self, other: Perms) -> bool {
        self.0 & other.0 == other.0
    }

    /// Union of two permission sets
    pub fn with(self, other: Perms) -> Perms {
        Perms(self.0 | other.0)
    }
}

impl std::fmt::Display for Perms {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (perm, c) in [
            (Perms::READ, 'r'),
            (Perms::WRITE, 'w'),
            (Perms::CREATE, 'c'),
            (Perms::DELETE, 'd'),
            (Perms::ADMIN, 'a'),
        ] {
            if self.contains(perm) {
                write!(f, "{c}")?;
            }
        }
        Ok(())
    }
}

/// Access control entry
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Acl {
    pub perms: Perms,
    pub scheme: String,
    pub id: String,
}

impl Acl {
    /// Entry granting `perms` to everyone
    pub fn world(perms: Perms) -> Self {
        Self {
            perms,
            scheme: "world".to_string(),
            id: "anyone".to_string(),
        }
    }

    /// Entry granting `perms` to one authenticated identity
    pub fn identity(scheme: impl Into<String>, id: impl Into<String>, perms: Perms) -> Self {
        Self {
            perms,
            scheme: scheme.into(),
            id: id.into(),
        }
    }

    /// Completely open ACL
    pub fn open_unsafe() -> Vec<Acl> {
        vec![Acl::world(Perms::ALL)]
    }

    /// World-readable, nothing else
    pub fn read_unsafe() -> Vec<Acl> {
        vec![Acl::world(Perms::READ)]
    }

    /// Check whether this entry applies to a session with the given identities
    pub fn matches(&self, auth: &[(String, String)]) -> bool {
        (self.scheme == "world" && self.id == "anyone")
            || auth.iter().any(|(scheme, id)| *scheme == self.scheme && *id == self.id)
    }
}

/// How a node is created
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CreateMode {
    Persistent,
    Ephemeral,
    PersistentSequential,
    EphemeralSequential,
}

impl CreateMode {
    /// Node is deleted when its session ends
    pub fn is_ephemeral(self) -> bool {
        matches!(self, CreateMode::Ephemeral | CreateMode::EphemeralSequential)
    }

    /// Node name gets a store-assigned sequence suffix
    pub fn is_sequential(self) -> bool {
        matches!(self, CreateMode::PersistentSequential | CreateMode::EphemeralSequential)
    }
}

/// State of the session between a connection and the store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    /// First successful connection
    Connected,
    /// Connection interrupted, session may still be alive
    Suspended,
    /// Session gone, its ephemeral nodes with it
    Lost,
    /// Connection re-established after Suspended or Lost
    Reconnected,
    /// Connected to a server that only serves reads
    ReadOnly,
}

impl ConnectionState {
    /// Check if requests can currently reach the store
    pub fn is_connected(self) -> bool {
        matches!(
            self,
            ConnectionState::Connected | ConnectionState::Reconnected | ConnectionState::ReadOnly
        )
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Connected => write!(f, "CONNECTED"),
            ConnectionState::Suspended => write!(f, "SUSPENDED"),
            ConnectionState::Lost => write!(f, "LOST"),
            ConnectionState::Reconnected => write!(f, "RECONNECTED"),
            ConnectionState::ReadOnly => write!(f, "READ_ONLY"),
        }
    }
}

/// Which read armed a watch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WatchType {
    Data,
    Exists,
    Children,
}

/// What happened to a watched node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    NodeCreated,
    NodeDeleted,
    NodeDataChanged,
    NodeChildrenChanged,
}

/// Notification delivered to a one-shot watch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchEvent {
    pub kind: EventKind,
    pub path: String,
}

impl WatchEvent {
    pub fn new(kind: EventKind, path: impl Into<String>) -> Self {
        Self {
            kind,
            path: path.into(),
        }
    }

    /// Check whether this event fires a watch of the given type on the same path
    pub fn triggers(&self, watch: WatchType) -> bool {
        match self.kind {
            EventKind::NodeCreated => watch == WatchType::Exists,
            EventKind::NodeDataChanged => matches!(watch, WatchType::Data | WatchType::Exists),
            EventKind::NodeDeleted => true,
            EventKind::NodeChildrenChanged => watch == WatchType::Children,
        }
    }
}

/// Primitive store operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Request {
    Create {
        path: String,
        data: Vec<u8>,
        acl: Vec<Acl>,
        mode: CreateMode,
    },
    Delete {
        path: String,
        version: Option<i32>,
    },
    GetChildren {
        path: String,
    },
    GetData {
        path: String,
    },
    SetData {
        path: String,
        data: Vec<u8>,
        version: Option<i32>,
    },
    Exists {
        path: String,
    },
    Sync {
        path: String,
    },
    GetAcl {
        path: String,
    },
    SetAcl {
        path: String,
        acl: Vec<Acl>,
        version: Option<i32>,
    },
}

impl Request {
    /// Target path of the operation
    pub fn path(&self) -> &str {
        match self {
            Request::Create { path, .. }
            | Request::Delete { path, .. }
            | Request::GetChildren { path }
            | Request::GetData { path }
            | Request::SetData { path, .. }
            | Request::Exists { path }
            | Request::Sync { path }
            | Request::GetAcl { path }
            | Request::SetAcl { path, .. } => path,
        }
    }

    /// Watch type this request can arm, if it is a watchable read
    pub fn watch_type(&self) -> Option<WatchType> {
        match self {
            Request::GetData { .. } => Some(WatchType::Data),
            Request::Exists { .. } => Some(WatchType::Exists),
            Request::GetChildren { .. } => Some(WatchType::Children),
            _ => None,
        }
    }

    /// Get the request type name (for logging)
    pub fn type_name(&self) -> &'static str {
        match self {
            Request::Create { .. } => "Create",
            Request::Delete { .. } => "Delete",
            Request::GetChildren { .. } => "GetChildren",
            Request::GetData { .. } => "GetData",
            Request::SetData { .. } => "SetData",
            Request::Exists { .. } => "Exists",
            Request::Sync { .. } => "Sync",
            Request::GetAcl { .. } => "GetAcl",
            Request::SetAcl { .. } => "SetAcl",
        }
    }
}

/// Successful result of a [`Request`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Response {
    Created { path: String },
    Deleted,
    Children { children: Vec<String>, stat: Stat },
    Data { data: Vec<u8>, stat: Stat },
    Stat { stat: Stat },
    Exists { stat: Option<Stat> },
    Synced,
    Acl { acl: Vec<Acl>, stat: Stat },
}
