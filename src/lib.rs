//! WolfElect - Leader Election over a Coordination Store
//!
//! Multiple process instances race to become the single active leader of a
//! clustered service; all others observe, in near-real time, who currently
//! holds leadership and are promoted automatically when the leader goes away.
//!
//! # Architecture
//!
//! Participants register ephemeral-sequential nodes under a shared election
//! path in a hierarchical, watch-capable coordination store. The node with
//! the lowest sequence number leads. Each participant turns the store's
//! create, watch, delete and session-loss primitives into an ordered,
//! backpressured stream of [`election::LeadershipState`] transitions.
//!
//! # Features
//!
//! - Future-based coordination client over a callback-based backend
//! - In-memory coordination store with sessions, ephemeral nodes and watches
//! - TCP coordination server and remote backend with session resumption
//! - Duplicate participant detection
//! - Stale-leadership bound when the store goes quiet
//! - Leak-free observer registration across start/stop cycles
//! - HTTP status API

pub mod api;
pub mod client;
pub mod config;
pub mod election;
pub mod error;
pub mod network;
pub mod store;

pub use config::ElectConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::client::{Connection, CreateOptions};
    pub use crate::config::ElectConfig;
    pub use crate::election::{Election, ElectionHandle, LeadershipState, LeadershipStream};
    pub use crate::error::{Error, Result, StoreError};
    pub use crate::network::{CoordinationServer, SessionOptions};
    pub use crate::store::{ConnectionState, CreateMode, MemoryStore};
}
