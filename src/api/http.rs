//! HTTP API Server
//!
//! Read-only status API of a running election participant.

use std::sync::Arc;

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tower_http::trace::TraceLayer;

use crate::client::Connection;
use crate::config::ApiConfig;
use crate::election::LeadershipState;
use crate::error::{Error, Result};
use crate::store::ConnectionState;

/// Participant status as last observed on its leadership stream
#[derive(Debug, Clone, Default)]
pub struct ParticipantStatus {
    /// Latest leadership state, `None` before the first transition
    pub state: Option<LeadershipState>,
    /// Number of transitions observed
    pub transitions: u64,
    pub last_change: Option<DateTime<Utc>>,
    /// The leadership stream is still open
    pub running: bool,
}

/// Shared application state
pub struct AppState {
    /// Participant id
    pub participant: String,
    /// Election path
    pub election_path: String,
    /// Connection the participant runs on
    pub conn: Connection,
    /// Latest observed status
    pub status: RwLock<ParticipantStatus>,
}

impl AppState {
    pub fn new(participant: String, election_path: String, conn: Connection) -> Self {
        Self {
            participant,
            election_path,
            conn,
            status: RwLock::new(ParticipantStatus {
                running: true,
                ..Default::default()
            }),
        }
    }

    /// Record a transition
    pub async fn record(&self, state: LeadershipState) {
        let mut status = self.status.write().await;
        status.state = Some(state);
        status.transitions += 1;
        status.last_change = Some(Utc::now());
    }

    /// Mark the leadership stream as ended
    pub async fn finish(&self) {
        self.status.write().await.running = false;
    }
}

/// HTTP API server
pub struct HttpServer {
    config: ApiConfig,
    state: Arc<AppState>,
}

impl HttpServer {
    /// Create a new HTTP server
    pub fn new(config: ApiConfig, state: Arc<AppState>) -> Self {
        Self { config, state }
    }

    /// Get the state for sharing with other components
    pub fn state(&self) -> Arc<AppState> {
        Arc::clone(&self.state)
    }

    /// Create the router
    fn create_router(state: Arc<AppState>) -> Router {
        Router::new()
            .route("/status", get(handle_status))
            .route("/health", get(handle_health))
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }

    /// Start the HTTP server
    pub async fn start(&self) -> Result<()> {
        if !self.config.enabled {
            tracing::info!("HTTP API disabled");
            return Ok(());
        }

        let app = Self::create_router(Arc::clone(&self.state));

        let listener = tokio::net::TcpListener::bind(&self.config.bind_address).await?;
        tracing::info!("HTTP API listening on {}", self.config.bind_address);

        axum::serve(listener, app)
            .await
            .map_err(|e| Error::Network(format!("HTTP server error: {}", e)))?;

        Ok(())
    }
}

// ============ Request/Response Types ============

/// Status response
#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub participant_id: String,
    pub election_path: String,
    pub state: Option<String>,
    pub is_leader: bool,
    pub leader_id: Option<String>,
    pub transitions: u64,
    pub last_change: Option<DateTime<Utc>>,
    pub running: bool,
    pub connection_state: Option<ConnectionState>,
    pub session_id: u64,
}

/// Health response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub healthy: bool,
    pub participant_id: String,
    pub is_leader: bool,
}

// ============ Handlers ============

async fn handle_status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let status = state.status.read().await.clone();
    let current = status.state.as_ref();

    Json(StatusResponse {
        participant_id: state.participant.clone(),
        election_path: state.election_path.clone(),
        state: current.map(|s| s.to_string()),
        is_leader: current.map(LeadershipState::is_leader).unwrap_or(false),
        leader_id: current.and_then(|s| s.leader_id()).map(str::to_string),
        transitions: status.transitions,
        last_change: status.last_change,
        running: status.running,
        connection_state: state.conn.state(),
        session_id: state.conn.session_id(),
    })
}

/// Healthy while the stream runs on a usable connection
async fn handle_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let status = state.status.read().await;
    let connected = matches!(
        state.conn.state(),
        Some(ConnectionState::Connected | ConnectionState::Reconnected)
    );
    let healthy = status.running && connected;

    let code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        code,
        Json(HealthResponse {
            healthy,
            participant_id: state.participant.clone(),
            is_leader: status.state.as_ref().map(LeadershipState::is_leader).unwrap_or(false),
        }),
    )
}
