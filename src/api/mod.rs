//! HTTP API Module
//!
//! Provides a REST API for querying a participant's leadership status.

mod http;

pub use http::{AppState, HealthResponse, HttpServer, ParticipantStatus, StatusResponse};
