//! Coordination Store Module
//!
//! The hierarchical, watch-capable node store that elections run against:
//! its data model, path rules and an in-memory implementation.

pub mod path;
pub mod types;
mod tree;
mod memory;

pub use tree::{DataTree, Fired, Watcher};
pub use memory::MemoryStore;
pub use types::{
    Acl, ConnectionState, CreateMode, EventKind, Perms, Request, Response, Stat, WatchEvent,
    WatchType,
};
