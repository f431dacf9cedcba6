//! Agent control connections

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures::StreamExt;
use serde::Deserialize;

use watchsec_protocol::message::decode;
use watchsec_protocol::{AgentId, AgentMessage, ConnectionId, TenantId};

use crate::channel::ChannelHandle;
use crate::state::HubState;

use super::socket::pump_outbound;

/// Longest agent id that fits the frame header
const MAX_AGENT_ID_LEN: usize = u8::MAX as usize;

#[derive(Debug, Deserialize)]
pub(super) struct AgentQuery {
    #[serde(default)]
    api_key: String,
}

/// `GET /api/ws/agent/:agent_id?api_key=...`
///
/// The key is checked before the upgrade; a rejected agent never gets a
/// websocket.
pub(super) async fn agent_ws(
    Path(agent_id): Path<String>,
    Query(query): Query<AgentQuery>,
    State(state): State<Arc<HubState>>,
    ws: WebSocketUpgrade,
) -> Response {
    if agent_id.is_empty() || agent_id.len() > MAX_AGENT_ID_LEN {
        return (StatusCode::BAD_REQUEST, "invalid agent id").into_response();
    }

    let agent_id = AgentId::new(agent_id);
    let Some(tenant) = state.auth.agent_tenant(&agent_id, &query.api_key) else {
        tracing::warn!("Rejected agent {}: invalid API key", agent_id);
        return StatusCode::UNAUTHORIZED.into_response();
    };

    ws.on_upgrade(move |socket| handle_agent_socket(socket, state, agent_id, tenant))
}

async fn handle_agent_socket(
    socket: WebSocket,
    state: Arc<HubState>,
    agent_id: AgentId,
    tenant: TenantId,
) {
    let conn = ConnectionId::next();
    let (control, rx) = ChannelHandle::new(
        conn,
        state.config.outbound_queue,
        state.config.max_write_failures,
    );
    let (sink, mut stream) = socket.split();
    let writer = tokio::spawn(pump_outbound(sink, rx, control.clone()));

    let coordinator = Arc::clone(&state.coordinator);
    let session = coordinator
        .connect_agent(agent_id.clone(), tenant, control.clone())
        .await;
    tracing::info!(agent = %agent_id, conn = %conn, "Agent connected");

    loop {
        tokio::select! {
            _ = control.closed() => {
                tracing::info!(agent = %agent_id, conn = %conn, "Agent connection closed by hub");
                break;
            }
            _ = state.shutdown.cancelled() => break,
            msg = stream.next() => match msg {
                Some(Ok(Message::Text(text))) => match decode::<AgentMessage>(&text) {
                    Ok(msg) => coordinator.agent_message(&session, msg).await,
                    Err(e) => tracing::warn!("Malformed message from agent {}: {}", agent_id, e),
                },
                Some(Ok(Message::Binary(data))) => {
                    if let Err(e) = coordinator.agent_frame(&agent_id, Bytes::from(data)) {
                        tracing::debug!("Dropped frame from agent {}: {}", agent_id, e);
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::debug!("Agent {} socket error: {}", agent_id, e);
                    break;
                }
            },
        }
    }

    control.close();
    coordinator.connection_closed(conn).await;
    let _ = writer.await;
    tracing::info!(agent = %agent_id, conn = %conn, "Agent disconnected");
}
