//! Event loop for one hub connection

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use watchsec_protocol::{AgentMessage, CommandAck, ConnectionId, ControlCommand, HubToAgent};

use crate::hub::{HubEvent, HubLink, HubSender};
use crate::input::InputRequest;
use crate::negotiator::{PeerEvent, PeerNegotiator};
use crate::recording::{Recorder, RecordingUploader};
use crate::stream::{StreamController, StreamGate};

/// How often pending negotiations are checked against the window
const NEGOTIATION_TICK: Duration = Duration::from_secs(1);

/// Interval between keep-alive pings
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Connection-independent parts of the event loop.
///
/// Survives reconnects; [`Session::reset`] clears what belonged to the
/// previous connection.
pub(crate) struct Session {
    pub gate: Arc<StreamGate>,
    pub controller: StreamController,
    pub negotiator: PeerNegotiator,
    pub peer_rx: mpsc::Receiver<PeerEvent>,
    pub input_tx: mpsc::Sender<InputRequest>,
    pub recorder: Arc<Mutex<Recorder>>,
    pub uploader: Option<Arc<RecordingUploader>>,
}

impl Session {
    /// Run until the connection drops or `cancel` fires.
    /// Returns the disconnect reason.
    pub async fn run(&mut self, link: &mut HubLink, cancel: &CancellationToken) -> String {
        let hub = link.sender();

        let mut expiry = tokio::time::interval(NEGOTIATION_TICK);
        expiry.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut keepalive =
            tokio::time::interval_at(Instant::now() + KEEPALIVE_INTERVAL, KEEPALIVE_INTERVAL);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let deadline = self.controller.deadline();

            tokio::select! {
                _ = cancel.cancelled() => return "Shutting down".to_string(),

                event = link.recv_event() => match event {
                    Some(HubEvent::Message(msg)) => self.handle_hub(&hub, msg).await,
                    Some(HubEvent::Disconnected(reason)) => return reason,
                    None => return "Event channel closed".to_string(),
                },

                Some(event) = self.peer_rx.recv() => self.handle_peer(&hub, event).await,

                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    tracing::info!("Live session reached its time limit");
                    self.stop_live().await;
                }

                _ = expiry.tick() => {
                    for report in self.negotiator.expire().await {
                        send(&hub, &report);
                    }
                }

                _ = keepalive.tick() => send(&hub, &AgentMessage::Ping),
            }
        }
    }

    /// Drop live state tied to the lost connection
    pub async fn reset(&mut self) {
        self.stop_live().await;
    }

    async fn stop_live(&mut self) {
        if self.controller.stop() {
            tracing::info!("Live session stopped");
        }
        self.negotiator.close_all().await;
    }

    async fn handle_hub(&mut self, hub: &HubSender, msg: HubToAgent) {
        match msg {
            HubToAgent::Registered { agent_id } => {
                tracing::info!("Registered with hub as {}", agent_id);
            }

            HubToAgent::StartSession { viewer_id } => {
                if self.controller.start() {
                    tracing::info!("Live session started for {}", viewer_id);
                } else {
                    tracing::debug!("Live session extended for {}", viewer_id);
                }
                let reply = self.negotiator.start(viewer_id).await;
                send(hub, &reply);
            }

            HubToAgent::StopSession => self.stop_live().await,

            HubToAgent::Answer { viewer_id, sdp } => {
                if let Some(report) = self.negotiator.answer(viewer_id, sdp).await {
                    send(hub, &report);
                }
            }

            HubToAgent::Candidate {
                viewer_id,
                candidate,
            } => self.negotiator.remote_candidate(viewer_id, candidate).await,

            HubToAgent::TransportSelected { transport } => {
                tracing::info!("Hub selected {:?} transport", transport);
                self.controller.set_transport(transport);
            }

            HubToAgent::Command { viewer_id, command } => {
                self.dispatch(hub, viewer_id, command).await;
            }

            HubToAgent::PeerFailed { viewer_id, reason } => {
                self.negotiator.hub_failed(viewer_id, &reason).await;
            }

            HubToAgent::ViewerLeft { viewer_id } => {
                tracing::debug!("Viewer {} left", viewer_id);
                self.negotiator.remove(viewer_id).await;
            }

            HubToAgent::Pong => tracing::trace!("Pong"),
        }
    }

    async fn handle_peer(&mut self, hub: &HubSender, event: PeerEvent) {
        let report = match event {
            PeerEvent::LocalCandidate { key, candidate } => {
                self.negotiator.local_candidate(key, candidate)
            }
            PeerEvent::Connected { key } => self.negotiator.connected(key).await,
            PeerEvent::Failed { key, reason } => self.negotiator.link_failed(key, reason).await,
            PeerEvent::Command { key, command } => {
                self.dispatch(hub, key.viewer_id, command).await;
                None
            }
        };
        if let Some(report) = report {
            send(hub, &report);
        }
    }

    /// Route a command to the recorder or the input thread
    async fn dispatch(&mut self, hub: &HubSender, viewer_id: ConnectionId, command: ControlCommand) {
        match command {
            ControlCommand::StartRecording => {
                let ack = match self.recorder.lock().await.start().await {
                    Ok(path) => {
                        self.gate.set_recording(true);
                        let name = path.file_name().map(|n| n.to_string_lossy().into_owned());
                        CommandAck::ok(&command, name)
                    }
                    Err(e) => CommandAck::failed(&command, e.to_string()),
                };
                send(hub, &AgentMessage::CommandAck { viewer_id, ack });
            }

            ControlCommand::StopRecording => {
                let result = {
                    let mut recorder = self.recorder.lock().await;
                    self.gate.set_recording(false);
                    recorder.stop().await
                };
                match result {
                    Ok(finished) => {
                        let ack = CommandAck::ok(&command, Some(finished.file_name()));
                        send(hub, &AgentMessage::CommandAck { viewer_id, ack });
                        match &self.uploader {
                            Some(uploader) => {
                                uploader.spawn(finished);
                            }
                            None => tracing::warn!("Keeping {:?}, no uploader", finished.path),
                        }
                    }
                    Err(e) => {
                        let ack = CommandAck::failed(&command, e.to_string());
                        send(hub, &AgentMessage::CommandAck { viewer_id, ack });
                    }
                }
            }

            command => {
                let kind = command.kind();
                match self.input_tx.try_send(InputRequest { viewer_id, command }) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        tracing::warn!("Input queue full, dropping {} from {}", kind, viewer_id);
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        tracing::warn!("Input executor gone, dropping {}", kind);
                    }
                }
            }
        }
    }
}

fn send(hub: &HubSender, msg: &AgentMessage) {
    if let Err(e) = hub.send(msg) {
        tracing::warn!("Failed to send to hub: {}", e);
    }
}
