//! Agent runtime: worker startup, hub reconnect loop and shutdown
//!
//! The capture thread, input thread and frame pump live for the whole
//! process. Each hub connection gets a fresh [`HubLink`](crate::hub::HubLink); its sender is
//! published to the frame pump through a watch channel.

mod session;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::capture::{CaptureLoop, CaptureStats, FrameEncoder};
use crate::hub::{ConnectionError, ExponentialBackoff, HubConnector, HubSender};
use crate::input::InputExecutor;
use crate::negotiator::{PeerFactory, PeerNegotiator, WebRtcPeerFactory};
use crate::state::AgentState;
use crate::stream::{FramePump, StreamController};

use session::Session;

/// Commands waiting for the input thread
const INPUT_QUEUE_CAPACITY: usize = 256;

/// Events from peer links
const PEER_EVENT_CAPACITY: usize = 256;

/// Pause between a disconnect and the next connection attempt
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Pause after a connection error that is not retried by the connector
const ERROR_DELAY: Duration = Duration::from_secs(5);

/// How long shutdown waits for each worker
const WORKER_GRACE: Duration = Duration::from_secs(2);

/// The agent daemon
pub struct AgentRuntime {
    state: AgentState,
    peer_factory: Option<Arc<dyn PeerFactory>>,
}

impl AgentRuntime {
    pub fn new(state: AgentState) -> Self {
        let peer_factory: Option<Arc<dyn PeerFactory>> = if state.config.peer.enabled {
            Some(Arc::new(WebRtcPeerFactory::from_config(&state.config.peer)))
        } else {
            None
        };
        Self {
            state,
            peer_factory,
        }
    }

    pub fn state(&self) -> &AgentState {
        &self.state
    }

    /// Run until `cancel` fires or the hub rejects the agent's credentials
    pub async fn run(self, cancel: CancellationToken) -> Result<(), ConnectionError> {
        let AgentRuntime {
            state,
            peer_factory,
        } = self;
        let config = &state.config;
        let workers = cancel.child_token();

        // Capture thread -> frame pump
        let (frame_tx, frame_rx) = mpsc::channel(1);
        let stats = Arc::new(CaptureStats::default());
        let capture = CaptureLoop {
            backend: Arc::clone(&state.backend),
            encoder: FrameEncoder::from_config(&config.stream),
            interval: config.stream.frame_interval(),
            gate: Arc::clone(&state.gate),
            stats: Arc::clone(&stats),
        }
        .spawn(frame_tx, workers.clone());

        let (hub_tx, hub_rx) = watch::channel::<Option<HubSender>>(None);
        let pump = FramePump {
            agent_id: state.agent_id.clone(),
            gate: Arc::clone(&state.gate),
            hub: hub_rx,
            paths: state.paths.clone(),
            recorder: Arc::clone(&state.recorder),
            send_timeout: config.stream.frame_interval(),
        };
        let pump = tokio::spawn(pump.run(frame_rx, workers.clone()));

        let (input_tx, input_rx) = mpsc::channel(INPUT_QUEUE_CAPACITY);
        let input = InputExecutor::new(Arc::clone(&state.backend)).spawn(input_rx);

        let (peer_tx, peer_rx) = mpsc::channel(PEER_EVENT_CAPACITY);
        let negotiator = PeerNegotiator::new(
            peer_factory,
            config.peer.negotiation_timeout,
            state.paths.clone(),
            peer_tx,
        );
        if !negotiator.is_enabled() {
            tracing::info!("Peer-to-peer disabled, frames go through the hub");
        }
        let mut session = Session {
            gate: Arc::clone(&state.gate),
            controller: StreamController::new(Arc::clone(&state.gate), config.stream.max_session),
            negotiator,
            peer_rx,
            input_tx,
            recorder: Arc::clone(&state.recorder),
            uploader: state.uploader.clone(),
        };

        let connector = HubConnector::new(config.clone(), state.agent_id.clone());
        tracing::info!("Agent {} connecting to {}", state.agent_id, config.hub_url);

        let result = loop {
            let backoff = ExponentialBackoff::from_config(&config.backoff);
            let connected = tokio::select! {
                _ = cancel.cancelled() => break Ok(()),
                connected = connector.connect_with_retry(backoff) => connected,
            };

            let mut link = match connected {
                Ok(link) => link,
                Err(ConnectionError::AuthRejected) => {
                    tracing::error!("Hub rejected the API key. Check api_key in the agent config.");
                    break Err(ConnectionError::AuthRejected);
                }
                Err(e @ ConnectionError::InvalidUrl { .. }) => {
                    tracing::error!("{}", e);
                    break Err(e);
                }
                Err(e) => {
                    tracing::error!("Failed to connect: {}", e);
                    if pause(ERROR_DELAY, &cancel).await {
                        break Ok(());
                    }
                    continue;
                }
            };

            tracing::info!("Connected to hub, entering event loop");
            hub_tx.send_replace(Some(link.sender()));

            let reason = session.run(&mut link, &cancel).await;

            hub_tx.send_replace(None);
            session.reset().await;
            link.close().await;

            if cancel.is_cancelled() {
                break Ok(());
            }
            tracing::warn!("Disconnected: {}", reason);
            if pause(RECONNECT_DELAY, &cancel).await {
                break Ok(());
            }
            tracing::info!("Reconnecting...");
        };

        workers.cancel();
        drop(session);
        finish_recording(&state).await;
        join_worker("capture", capture).await;
        join_worker("input", input).await;
        join_worker("frame pump", pump).await;
        tracing::info!(
            "Agent stopped ({} frames captured, {} dropped, {} failed)",
            stats.captured(),
            stats.dropped(),
            stats.failed()
        );
        result
    }
}

/// Sleep unless cancelled first. Returns true if cancelled.
async fn pause(delay: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => true,
        _ = tokio::time::sleep(delay) => false,
    }
}

/// Close an open recording so its file is complete on disk
async fn finish_recording(state: &AgentState) {
    state.gate.set_recording(false);
    let mut recorder = state.recorder.lock().await;
    if !recorder.is_recording() {
        return;
    }
    match recorder.stop().await {
        Ok(finished) => tracing::info!(
            "Recording {:?} closed at shutdown and kept on disk",
            finished.path
        ),
        Err(e) => tracing::warn!("Failed to close recording at shutdown: {}", e),
    }
}

async fn join_worker(name: &str, handle: JoinHandle<()>) {
    match tokio::time::timeout(WORKER_GRACE, handle).await {
        Ok(Ok(())) => tracing::debug!("{} worker stopped", name),
        Ok(Err(e)) => tracing::warn!("{} worker failed: {}", name, e),
        Err(_) => tracing::warn!("{} worker did not stop in time", name),
    }
}
