//! Viewer connections

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use futures::StreamExt;
use serde::Deserialize;

use watchsec_protocol::message::decode;
use watchsec_protocol::{ConnectionId, ErrorCode, HubToViewer, ViewerMessage};

use crate::auth::ViewerIdentity;
use crate::channel::ChannelHandle;
use crate::state::HubState;

use super::socket::pump_outbound;

#[derive(Debug, Deserialize)]
pub(super) struct ViewerQuery {
    token: Option<String>,
}

/// Bearer token from the `Authorization` header, else the `token` query
fn presented_token(headers: &HeaderMap, query: ViewerQuery) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(|token| token.trim().to_string())
        .or(query.token)
}

/// `GET /api/ws/viewer` with a bearer token
pub(super) async fn viewer_ws(
    headers: HeaderMap,
    Query(query): Query<ViewerQuery>,
    State(state): State<Arc<HubState>>,
    ws: WebSocketUpgrade,
) -> Response {
    let identity = presented_token(&headers, query)
        .and_then(|token| state.auth.viewer_identity(&token));
    let Some(identity) = identity else {
        tracing::warn!("Rejected viewer: missing or invalid token");
        return StatusCode::UNAUTHORIZED.into_response();
    };

    ws.on_upgrade(move |socket| handle_viewer_socket(socket, state, identity))
}

async fn handle_viewer_socket(socket: WebSocket, state: Arc<HubState>, identity: ViewerIdentity) {
    let conn = ConnectionId::next();
    let (viewer, rx) = ChannelHandle::new(
        conn,
        state.config.outbound_queue,
        state.config.max_write_failures,
    );
    let (sink, mut stream) = socket.split();
    let writer = tokio::spawn(pump_outbound(sink, rx, viewer.clone()));
    let coordinator = Arc::clone(&state.coordinator);

    tracing::info!(
        viewer = %identity.name,
        tenant = %identity.tenant,
        conn = %conn,
        "Viewer connected"
    );

    loop {
        tokio::select! {
            _ = viewer.closed() => break,
            _ = state.shutdown.cancelled() => break,
            msg = stream.next() => match msg {
                Some(Ok(Message::Text(text))) => match decode::<ViewerMessage>(&text) {
                    Ok(msg) => coordinator.viewer_message(&viewer, &identity, msg).await,
                    Err(e) => {
                        tracing::debug!("Malformed message from viewer {}: {}", conn, e);
                        let _ = viewer.send_message(&HubToViewer::Error {
                            code: ErrorCode::BadRequest,
                            message: e.to_string(),
                        });
                    }
                },
                Some(Ok(Message::Binary(_))) => {
                    tracing::debug!("Ignoring binary message from viewer {}", conn);
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::debug!("Viewer {} socket error: {}", conn, e);
                    break;
                }
            },
        }
    }

    viewer.close();
    coordinator.connection_closed(conn).await;
    let _ = writer.await;
    tracing::info!(viewer = %identity.name, conn = %conn, "Viewer disconnected");
}
