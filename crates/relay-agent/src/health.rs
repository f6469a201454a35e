//! Health endpoint
//!
//! `/health` answers 200 only when the current state file validates and a
//! sync attempt with it succeeds, 503 otherwise.

use crate::error::AgentError;
use crate::state_file::load_state;
use crate::sync::Syncer;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

#[derive(Clone)]
pub struct HealthState {
    state_path: PathBuf,
    syncer: Arc<Syncer>,
}

impl HealthState {
    #[must_use]
    pub fn new(state_path: PathBuf, syncer: Arc<Syncer>) -> Self {
        Self { state_path, syncer }
    }

    async fn check(&self) -> Result<(), AgentError> {
        let (state, _) = load_state(&self.state_path).await?;
        state.validate()?;
        self.syncer.sync(&state).await
    }
}

async fn health(State(health): State<HealthState>) -> (StatusCode, String) {
    match health.check().await {
        Ok(()) => (StatusCode::OK, "ok".to_string()),
        Err(e) => {
            warn!("Health check failed: {}", e);
            (StatusCode::SERVICE_UNAVAILABLE, e.to_string())
        }
    }
}

pub fn health_routes(state: HealthState) -> Router {
    Router::new()
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the health endpoint until the listener fails.
///
/// # Errors
///
/// Returns an error when the address cannot be bound or serving fails.
pub async fn serve(addr: SocketAddr, state: HealthState) -> Result<(), AgentError> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Health endpoint listening on {}", addr);
    axum::serve(listener, health_routes(state)).await?;
    Ok(())
}
