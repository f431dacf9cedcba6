//! HTTP listener and routes

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;

use crate::negotiation::run_negotiation_sweeper;
use crate::state::HubState;

use super::{agent, viewer};

/// Body of the health endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Health {
    pub status: String,
    pub agents: usize,
    pub viewers: usize,
    pub negotiations: usize,
}

/// Build the hub's router
pub fn router(state: Arc<HubState>) -> Router {
    Router::new()
        .route("/api/ws/agent/:agent_id", get(agent::agent_ws))
        .route("/api/ws/viewer", get(viewer::viewer_ws))
        .route("/healthz", get(healthz))
        .with_state(state)
}

async fn healthz(State(state): State<Arc<HubState>>) -> Json<Health> {
    let coordinator = &state.coordinator;
    Json(Health {
        status: "ok".to_string(),
        agents: coordinator.registry.agent_count(),
        viewers: coordinator.registry.viewer_count(),
        negotiations: coordinator.broker.pending_count(),
    })
}

/// Serve the hub on a bound listener until `state.shutdown` is cancelled.
///
/// Also runs the negotiation sweeper for the lifetime of the server.
pub async fn serve(state: Arc<HubState>, listener: TcpListener) -> Result<()> {
    let local_addr = listener.local_addr()?;
    tracing::info!("Relay hub listening on {}", local_addr);

    let cancel = state.shutdown.clone();
    let sweeper = tokio::spawn(run_negotiation_sweeper(
        Arc::clone(&state.coordinator),
        state.config.negotiation_timeout,
        state.config.sweep_interval,
        cancel.clone(),
    ));

    let shutdown = cancel.clone();
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("Relay hub server failed")?;

    cancel.cancel();
    if let Err(e) = sweeper.await {
        tracing::warn!("Negotiation sweeper ended abnormally: {}", e);
    }

    tracing::info!("Relay hub stopped");
    Ok(())
}
