//! Coordination Protocol
//!
//! Defines the wire protocol between remote backends and the
//! coordination server.

use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::store::{Request, Response, WatchEvent};

/// Largest frame body either side accepts
pub const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// Protocol messages between a client session and the server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    // ========== Session ==========
    /// Open a session, or resume `session_id`
    Connect {
        session_id: Option<u64>,
        timeout_ms: u64,
        auth: Vec<(String, String)>,
    },

    /// Session accepted
    ConnectResponse { session_id: u64, timeout_ms: u64 },

    /// The session asked to resume no longer exists
    SessionExpired,

    /// Keep-alive
    Ping,

    /// Keep-alive reply
    Pong,

    /// End the session
    Close,

    // ========== Operations ==========
    /// Store request. `watch` arms a watch if the read succeeds.
    Request {
        xid: u64,
        request: Request,
        watch: bool,
    },

    /// Result of the request with the same `xid`
    Response {
        xid: u64,
        result: Result<Response, StoreError>,
    },

    /// The watch armed by request `xid` fired
    WatchFired { xid: u64, event: WatchEvent },
}

impl Message {
    /// Serialize message to bytes
    pub fn serialize(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize message from bytes
    pub fn deserialize(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }

    /// Get the message type name (for logging)
    pub fn type_name(&self) -> &'static str {
        match self {
            Message::Connect { .. } => "Connect",
            Message::ConnectResponse { .. } => "ConnectResponse",
            Message::SessionExpired => "SessionExpired",
            Message::Ping => "Ping",
            Message::Pong => "Pong",
            Message::Close => "Close",
            Message::Request { .. } => "Request",
            Message::Response { .. } => "Response",
            Message::WatchFired { .. } => "WatchFired",
        }
    }
}

/// Frame header for length-prefixed messages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Message length
    pub length: u32,
    /// Message checksum
    pub checksum: u32,
}

impl FrameHeader {
    /// Header size in bytes
    pub const SIZE: usize = 8;

    /// Create a new frame header
    pub fn new(data: &[u8]) -> Self {
        Self {
            length: data.len() as u32,
            checksum: crc32fast::hash(data),
        }
    }

    /// Serialize header to bytes
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..4].copy_from_slice(&self.length.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.checksum.to_le_bytes());
        bytes
    }

    /// Deserialize header from bytes
    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        Self {
            length: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            checksum: u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
        }
    }
}
