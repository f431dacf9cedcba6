//! Coordinator for the registry and the signaling broker
//!
//! Connection handlers never touch the [`SessionRegistry`] and the
//! [`SignalingBroker`] separately; they go through the `Coordinator`, which
//! keeps the two consistent. A negotiation only exists while its agent is
//! live: it is opened under the agent's room lock and cleared under the same
//! lock when the agent registers again or goes away. There is no hub-wide
//! lock, so traffic for one agent never waits on another agent.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;

use watchsec_core::config::HubConfig;
use watchsec_core::RelayError;
use watchsec_protocol::frame::peek_agent_id;
use watchsec_protocol::{
    AgentId, AgentMessage, ConnectionId, ErrorCode, HubToAgent, HubToViewer, ProtocolError,
    TenantId, ViewerMessage,
};

use crate::auth::ViewerIdentity;
use crate::channel::ChannelHandle;
use crate::negotiation::{CandidateOrigin, SignalingBroker};
use crate::registry::{AgentSession, Departure, FanOut, SessionRegistry};

/// Why an inbound binary frame was not relayed
#[derive(Error, Debug)]
pub enum FrameRejection {
    #[error("Malformed frame: {0}")]
    Malformed(#[from] ProtocolError),

    #[error("Frame claims agent {claimed} on the connection of {actual}")]
    AgentMismatch { claimed: String, actual: AgentId },

    #[error("Frame of {size} bytes exceeds limit of {max}")]
    TooLarge { size: usize, max: usize },
}

/// Routes agent and viewer traffic through the registry and the broker
pub struct Coordinator {
    /// Agent sessions and viewer rooms
    pub registry: Arc<SessionRegistry>,

    /// Pending peer negotiations
    pub broker: Arc<SignalingBroker>,

    /// Largest binary frame accepted from an agent
    max_frame_bytes: usize,
}

impl Coordinator {
    /// Create a coordinator with fresh collections
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            registry: Arc::new(SessionRegistry::new()),
            broker: Arc::new(SignalingBroker::new()),
            max_frame_bytes,
        }
    }

    /// Create a coordinator from the hub configuration
    pub fn from_config(config: &HubConfig) -> Self {
        Self::new(config.max_frame_bytes)
    }

    /// Register an authenticated agent connection.
    ///
    /// A negotiation left over from the agent's previous connection is
    /// dropped and its viewer told so.
    pub async fn connect_agent(
        &self,
        agent_id: AgentId,
        tenant: TenantId,
        control: ChannelHandle,
    ) -> AgentSession {
        let mut leftover = None;
        let session = self.registry.register_agent_with(
            agent_id.clone(),
            tenant,
            control.clone(),
            || leftover = self.broker.remove_agent(&agent_id),
        );

        if let Some(viewer_id) = leftover {
            self.send_to_viewer(
                &agent_id,
                viewer_id,
                HubToViewer::PeerFailed {
                    agent_id: agent_id.clone(),
                    reason: "agent reconnected".to_string(),
                },
            );
        }

        if let Err(e) = control.send_message(&HubToAgent::Registered { agent_id }) {
            tracing::warn!("Failed to acknowledge registration: {}", e);
        }
        session
    }

    /// Handle a control message from an agent
    pub async fn agent_message(&self, session: &AgentSession, msg: AgentMessage) {
        let agent_id = &session.agent_id;

        match msg {
            AgentMessage::Offer { viewer_id, sdp } => {
                match self.broker.offer(agent_id, viewer_id, &sdp) {
                    Ok(()) => self.send_to_viewer(
                        agent_id,
                        viewer_id,
                        HubToViewer::Offer {
                            agent_id: agent_id.clone(),
                            sdp,
                        },
                    ),
                    Err(e) => tracing::debug!("Ignoring offer from {}: {}", agent_id, e),
                }
            }
            AgentMessage::Candidate {
                viewer_id,
                candidate,
            } => {
                match self
                    .broker
                    .candidate(agent_id, viewer_id, CandidateOrigin::Agent, &candidate)
                {
                    Ok(()) => self.send_to_viewer(
                        agent_id,
                        viewer_id,
                        HubToViewer::Candidate {
                            agent_id: agent_id.clone(),
                            candidate,
                        },
                    ),
                    Err(e) => tracing::debug!("Ignoring candidate from {}: {}", agent_id, e),
                }
            }
            AgentMessage::PeerConnected { viewer_id } => {
                match self.broker.connect(agent_id, viewer_id) {
                    Ok(_) => {
                        self.registry.settle_peer(agent_id, viewer_id, true);
                    }
                    Err(e) => tracing::debug!("Ignoring peer_connected from {}: {}", agent_id, e),
                }
            }
            AgentMessage::PeerFailed { viewer_id, reason } => {
                self.broker.fail(agent_id, viewer_id);
                tracing::info!(
                    agent = %agent_id,
                    conn = %viewer_id,
                    "Agent reported peer failure: {}",
                    reason
                );
                self.send_to_viewer(
                    agent_id,
                    viewer_id,
                    HubToViewer::PeerFailed {
                        agent_id: agent_id.clone(),
                        reason,
                    },
                );
                if self.registry.is_subscribed(agent_id, viewer_id) {
                    self.registry.settle_peer(agent_id, viewer_id, false);
                }
            }
            AgentMessage::CommandAck { viewer_id, ack } => {
                self.send_to_viewer(
                    agent_id,
                    viewer_id,
                    HubToViewer::CommandAck {
                        agent_id: agent_id.clone(),
                        ack,
                    },
                );
            }
            AgentMessage::Ping => {
                if let Err(e) = session.control.send_message(&HubToAgent::Pong) {
                    tracing::debug!("Failed to answer ping from {}: {}", agent_id, e);
                }
            }
        }
    }

    /// Relay a binary frame from an agent's connection
    pub fn agent_frame(&self, agent_id: &AgentId, data: Bytes) -> Result<FanOut, FrameRejection> {
        if data.len() > self.max_frame_bytes {
            return Err(FrameRejection::TooLarge {
                size: data.len(),
                max: self.max_frame_bytes,
            });
        }

        let claimed = peek_agent_id(&data)?;
        if claimed != agent_id.as_str() {
            return Err(FrameRejection::AgentMismatch {
                claimed: claimed.to_string(),
                actual: agent_id.clone(),
            });
        }

        Ok(self.registry.relay_frame(agent_id, data))
    }

    /// Handle a control message from a viewer
    pub async fn viewer_message(
        &self,
        viewer: &ChannelHandle,
        identity: &ViewerIdentity,
        msg: ViewerMessage,
    ) {
        let viewer_id = viewer.id();

        match msg {
            ViewerMessage::Join { agent_id } => {
                match self
                    .registry
                    .subscribe_viewer(&agent_id, identity, viewer.clone())
                {
                    Ok(transport) => reply(viewer, &HubToViewer::Joined { agent_id, transport }),
                    Err(RelayError::TargetUnavailable(agent_id)) => {
                        tracing::debug!("Viewer {} joined offline agent {}", viewer_id, agent_id);
                        reply(viewer, &HubToViewer::AgentOffline { agent_id });
                    }
                    Err(e) => reply(viewer, &error_reply(&e)),
                }
            }
            ViewerMessage::Leave { agent_id } => {
                self.broker.abandon(&agent_id, viewer_id);
                self.registry.unsubscribe_viewer(&agent_id, viewer_id);
                reply(viewer, &HubToViewer::Left { agent_id });
            }
            ViewerMessage::StartViewing { agent_id } => {
                if !self.registry.is_subscribed(&agent_id, viewer_id) {
                    reply(viewer, &not_subscribed(&agent_id));
                    return;
                }
                let begun = self.registry.with_live_agent(&agent_id, |session| {
                    let previous = self.broker.begin(&agent_id, viewer_id);
                    (session.control.clone(), previous)
                });
                let Some((control, previous)) = begun else {
                    reply(viewer, &HubToViewer::AgentOffline { agent_id });
                    return;
                };

                if let Some(previous) = previous {
                    self.fall_back(&agent_id, previous, "superseded by a newer session request");
                }
                if let Err(e) = control.send_message(&HubToAgent::StartSession { viewer_id }) {
                    tracing::warn!("Failed to request session from {}: {}", agent_id, e);
                }
            }
            ViewerMessage::Answer { agent_id, sdp } => {
                match self.broker.answer(&agent_id, viewer_id, &sdp) {
                    Ok(()) => self.send_to_agent(&agent_id, HubToAgent::Answer { viewer_id, sdp }),
                    Err(e) => tracing::debug!("Ignoring answer from {}: {}", viewer_id, e),
                }
            }
            ViewerMessage::Candidate {
                agent_id,
                candidate,
            } => {
                match self
                    .broker
                    .candidate(&agent_id, viewer_id, CandidateOrigin::Viewer, &candidate)
                {
                    Ok(()) => self.send_to_agent(
                        &agent_id,
                        HubToAgent::Candidate {
                            viewer_id,
                            candidate,
                        },
                    ),
                    Err(e) => tracing::debug!("Ignoring candidate from {}: {}", viewer_id, e),
                }
            }
            ViewerMessage::PeerFailed { agent_id, reason } => {
                if !self.registry.is_subscribed(&agent_id, viewer_id) {
                    reply(viewer, &not_subscribed(&agent_id));
                    return;
                }
                self.broker.fail(&agent_id, viewer_id);
                self.send_to_agent(&agent_id, HubToAgent::PeerFailed { viewer_id, reason });
                self.registry.settle_peer(&agent_id, viewer_id, false);
            }
            ViewerMessage::Command { agent_id, command } => {
                if !self.registry.is_subscribed(&agent_id, viewer_id) {
                    reply(viewer, &not_subscribed(&agent_id));
                    return;
                }
                match self
                    .registry
                    .relay_command(&agent_id, viewer_id, identity, command)
                {
                    Ok(()) => {}
                    Err(e) if e.is_user_facing() => reply(viewer, &error_reply(&e)),
                    Err(e) => tracing::debug!("Command from {} not delivered: {}", viewer_id, e),
                }
            }
            ViewerMessage::Ping => reply(viewer, &HubToViewer::Pong),
        }
    }

    /// Remove everything tied to a closed connection
    pub async fn connection_closed(&self, conn: ConnectionId) -> Departure {
        let mut orphaned = None;
        let departure = self
            .registry
            .unregister_with(conn, |agent_id| orphaned = self.broker.remove_agent(agent_id));

        match &departure {
            Departure::Agent(agent_id) => {
                if let Some(viewer_id) = orphaned {
                    self.send_to_viewer(
                        agent_id,
                        viewer_id,
                        HubToViewer::PeerFailed {
                            agent_id: agent_id.clone(),
                            reason: "agent disconnected".to_string(),
                        },
                    );
                }
            }
            Departure::Superseded(_) => {}
            Departure::Viewer(_) | Departure::Unknown => {
                for agent_id in self.broker.abandon_viewer(conn) {
                    tracing::debug!("Dropped negotiation of {} with closed viewer {}", agent_id, conn);
                }
            }
        }

        departure
    }

    /// Fall back to relay for every negotiation older than `window`.
    ///
    /// Returns the number of negotiations that timed out.
    pub async fn expire_negotiations(&self, window: Duration) -> usize {
        let expired = self.broker.expire(window);
        for (agent_id, viewer_id) in &expired {
            let reason = RelayError::NegotiationTimeout(agent_id.clone()).to_string();
            self.fall_back(agent_id, *viewer_id, &reason);
        }
        expired.len()
    }

    /// Tell both sides a negotiation is over and move the viewer to relay
    fn fall_back(&self, agent_id: &AgentId, viewer_id: ConnectionId, reason: &str) {
        self.send_to_agent(
            agent_id,
            HubToAgent::PeerFailed {
                viewer_id,
                reason: reason.to_string(),
            },
        );
        if !self.registry.is_subscribed(agent_id, viewer_id) {
            return;
        }
        self.send_to_viewer(
            agent_id,
            viewer_id,
            HubToViewer::PeerFailed {
                agent_id: agent_id.clone(),
                reason: reason.to_string(),
            },
        );
        self.registry.settle_peer(agent_id, viewer_id, false);
    }

    fn send_to_agent(&self, agent_id: &AgentId, msg: HubToAgent) {
        match self.registry.agent_handle(agent_id) {
            Some(control) => {
                if let Err(e) = control.send_message(&msg) {
                    tracing::debug!("Message to agent {} dropped: {}", agent_id, e);
                }
            }
            None => tracing::debug!("{}", RelayError::TargetUnavailable(agent_id.clone())),
        }
    }

    fn send_to_viewer(&self, agent_id: &AgentId, viewer_id: ConnectionId, msg: HubToViewer) {
        match self.registry.viewer_handle(agent_id, viewer_id) {
            Some(viewer) => reply(&viewer, &msg),
            None => tracing::debug!("Viewer {} left room of {}", viewer_id, agent_id),
        }
    }
}

fn reply(viewer: &ChannelHandle, msg: &HubToViewer) {
    if let Err(e) = viewer.send_message(msg) {
        tracing::debug!("Message to viewer {} dropped: {}", viewer.id(), e);
    }
}

fn not_subscribed(agent_id: &AgentId) -> HubToViewer {
    HubToViewer::Error {
        code: ErrorCode::NotSubscribed,
        message: format!("Not subscribed to agent {}", agent_id),
    }
}

fn error_reply(err: &RelayError) -> HubToViewer {
    let code = match err {
        RelayError::Authorization { .. } => ErrorCode::Unauthorized,
        _ => ErrorCode::BadRequest,
    };
    HubToViewer::Error {
        code,
        message: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Outbound;
    use tokio::sync::mpsc;
    use watchsec_protocol::message::decode;
    use watchsec_protocol::{ControlCommand, IceCandidate, StreamFrame, Transport};

    const MAX_FRAME: usize = 1024 * 1024;

    fn channel() -> (ChannelHandle, mpsc::Receiver<Outbound>) {
        ChannelHandle::new(ConnectionId::next(), 32, 3)
    }

    fn agent_msgs(rx: &mut mpsc::Receiver<Outbound>) -> Vec<HubToAgent> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            if let Outbound::Text(text) = msg {
                out.push(decode(&text).unwrap());
            }
        }
        out
    }

    fn viewer_msgs(rx: &mut mpsc::Receiver<Outbound>) -> Vec<HubToViewer> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            if let Outbound::Text(text) = msg {
                out.push(decode(&text).unwrap());
            }
        }
        out
    }

    fn frame_bytes(agent: &str, seq: u64) -> Bytes {
        StreamFrame::new(AgentId::new(agent), seq, 0, Bytes::from_static(b"jpeg"))
            .to_bytes()
            .unwrap()
    }

    struct Fixture {
        coordinator: Coordinator,
        session: AgentSession,
        agent_rx: mpsc::Receiver<Outbound>,
        viewer: ChannelHandle,
        viewer_rx: mpsc::Receiver<Outbound>,
        identity: ViewerIdentity,
    }

    fn a1() -> AgentId {
        AgentId::new("A1")
    }

    /// Agent A1 (tenant 7) connected with one joined viewer
    async fn fixture() -> Fixture {
        let coordinator = Coordinator::new(MAX_FRAME);
        let (control, mut agent_rx) = channel();
        let session = coordinator
            .connect_agent(a1(), TenantId::new("7"), control)
            .await;
        assert_eq!(
            agent_msgs(&mut agent_rx),
            vec![HubToAgent::Registered { agent_id: a1() }]
        );

        let (viewer, mut viewer_rx) = channel();
        let identity = ViewerIdentity::user("7", "v1");
        coordinator
            .viewer_message(&viewer, &identity, ViewerMessage::Join { agent_id: a1() })
            .await;
        assert_eq!(
            viewer_msgs(&mut viewer_rx),
            vec![HubToViewer::Joined {
                agent_id: a1(),
                transport: Transport::None
            }]
        );

        Fixture {
            coordinator,
            session,
            agent_rx,
            viewer,
            viewer_rx,
            identity,
        }
    }

    #[tokio::test]
    async fn test_join_other_tenant_rejected() {
        let mut fx = fixture().await;
        let (v2, mut rx2) = channel();
        fx.coordinator
            .viewer_message(
                &v2,
                &ViewerIdentity::user("9", "v2"),
                ViewerMessage::Join { agent_id: a1() },
            )
            .await;

        match viewer_msgs(&mut rx2).as_slice() {
            [HubToViewer::Error { code, .. }] => assert_eq!(*code, ErrorCode::Unauthorized),
            other => panic!("Unexpected reply: {:?}", other),
        }
        assert_eq!(fx.coordinator.registry.room_members(&a1()), vec![fx.viewer.id()]);
        assert!(agent_msgs(&mut fx.agent_rx).is_empty());
    }

    #[tokio::test]
    async fn test_join_offline_agent() {
        let coordinator = Coordinator::new(MAX_FRAME);
        let (viewer, mut rx) = channel();
        coordinator
            .viewer_message(
                &viewer,
                &ViewerIdentity::user("7", "v1"),
                ViewerMessage::Join {
                    agent_id: AgentId::new("ghost"),
                },
            )
            .await;
        assert_eq!(
            viewer_msgs(&mut rx),
            vec![HubToViewer::AgentOffline {
                agent_id: AgentId::new("ghost")
            }]
        );
    }

    #[tokio::test]
    async fn test_signaling_routes_to_requesting_viewer_only() {
        let mut fx = fixture().await;
        let (bystander, mut bystander_rx) = channel();
        fx.coordinator
            .viewer_message(&bystander, &fx.identity, ViewerMessage::Join { agent_id: a1() })
            .await;
        viewer_msgs(&mut bystander_rx);

        fx.coordinator
            .viewer_message(&fx.viewer, &fx.identity, ViewerMessage::StartViewing { agent_id: a1() })
            .await;
        let viewer_id = fx.viewer.id();
        assert_eq!(
            agent_msgs(&mut fx.agent_rx),
            vec![HubToAgent::StartSession { viewer_id }]
        );

        fx.coordinator
            .agent_message(
                &fx.session,
                AgentMessage::Offer {
                    viewer_id,
                    sdp: "offer".to_string(),
                },
            )
            .await;
        let candidate = IceCandidate {
            candidate: "candidate:1".to_string(),
            sdp_mid: None,
            sdp_mline_index: Some(0),
        };
        fx.coordinator
            .agent_message(
                &fx.session,
                AgentMessage::Candidate {
                    viewer_id,
                    candidate: candidate.clone(),
                },
            )
            .await;
        assert_eq!(
            viewer_msgs(&mut fx.viewer_rx),
            vec![
                HubToViewer::Offer {
                    agent_id: a1(),
                    sdp: "offer".to_string()
                },
                HubToViewer::Candidate {
                    agent_id: a1(),
                    candidate: candidate.clone()
                },
            ]
        );
        assert!(viewer_msgs(&mut bystander_rx).is_empty());

        fx.coordinator
            .viewer_message(
                &fx.viewer,
                &fx.identity,
                ViewerMessage::Answer {
                    agent_id: a1(),
                    sdp: "answer".to_string(),
                },
            )
            .await;
        assert_eq!(
            agent_msgs(&mut fx.agent_rx),
            vec![HubToAgent::Answer {
                viewer_id,
                sdp: "answer".to_string()
            }]
        );

        fx.coordinator
            .agent_message(&fx.session, AgentMessage::PeerConnected { viewer_id })
            .await;
        assert_eq!(
            fx.coordinator.registry.transport(&a1()),
            Transport::Relayed,
            "the bystander still needs the relay"
        );
        assert_eq!(fx.coordinator.broker.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_agent_failure_selects_relay() {
        let mut fx = fixture().await;
        let viewer_id = fx.viewer.id();
        fx.coordinator
            .viewer_message(&fx.viewer, &fx.identity, ViewerMessage::StartViewing { agent_id: a1() })
            .await;
        agent_msgs(&mut fx.agent_rx);

        fx.coordinator
            .agent_message(
                &fx.session,
                AgentMessage::PeerFailed {
                    viewer_id,
                    reason: "peer transport disabled".to_string(),
                },
            )
            .await;

        assert_eq!(fx.coordinator.registry.transport(&a1()), Transport::Relayed);
        assert_eq!(
            agent_msgs(&mut fx.agent_rx),
            vec![HubToAgent::TransportSelected {
                transport: Transport::Relayed
            }]
        );
        assert_eq!(
            viewer_msgs(&mut fx.viewer_rx),
            vec![
                HubToViewer::PeerFailed {
                    agent_id: a1(),
                    reason: "peer transport disabled".to_string()
                },
                HubToViewer::TransportChanged {
                    agent_id: a1(),
                    transport: Transport::Relayed
                },
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_negotiation_timeout_falls_back() {
        let mut fx = fixture().await;
        let viewer_id = fx.viewer.id();
        let window = Duration::from_secs(10);

        fx.coordinator
            .viewer_message(&fx.viewer, &fx.identity, ViewerMessage::StartViewing { agent_id: a1() })
            .await;
        fx.coordinator
            .agent_message(
                &fx.session,
                AgentMessage::Offer {
                    viewer_id,
                    sdp: "offer".to_string(),
                },
            )
            .await;
        agent_msgs(&mut fx.agent_rx);
        viewer_msgs(&mut fx.viewer_rx);

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(fx.coordinator.expire_negotiations(window).await, 0);

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(fx.coordinator.expire_negotiations(window).await, 1);
        assert_eq!(fx.coordinator.registry.transport(&a1()), Transport::Relayed);

        let to_agent = agent_msgs(&mut fx.agent_rx);
        assert!(matches!(to_agent[0], HubToAgent::PeerFailed { viewer_id: v, .. } if v == viewer_id));
        assert!(matches!(
            viewer_msgs(&mut fx.viewer_rx)[0],
            HubToViewer::PeerFailed { .. }
        ));

        // A late answer no longer matches any exchange
        fx.coordinator
            .viewer_message(
                &fx.viewer,
                &fx.identity,
                ViewerMessage::Answer {
                    agent_id: a1(),
                    sdp: "late".to_string(),
                },
            )
            .await;
        assert!(agent_msgs(&mut fx.agent_rx).is_empty());
    }

    #[tokio::test]
    async fn test_newer_start_viewing_supersedes_pending() {
        let mut fx = fixture().await;
        let (v2, mut rx2) = channel();
        fx.coordinator
            .viewer_message(&v2, &fx.identity, ViewerMessage::Join { agent_id: a1() })
            .await;
        viewer_msgs(&mut rx2);

        fx.coordinator
            .viewer_message(&fx.viewer, &fx.identity, ViewerMessage::StartViewing { agent_id: a1() })
            .await;
        fx.coordinator
            .viewer_message(&v2, &fx.identity, ViewerMessage::StartViewing { agent_id: a1() })
            .await;

        assert_eq!(fx.coordinator.broker.exchange(&a1()).unwrap().viewer, v2.id());
        assert!(viewer_msgs(&mut fx.viewer_rx)
            .iter()
            .any(|m| matches!(m, HubToViewer::PeerFailed { .. })));
        let to_agent = agent_msgs(&mut fx.agent_rx);
        assert_eq!(
            to_agent.last(),
            Some(&HubToAgent::StartSession { viewer_id: v2.id() })
        );
    }

    #[tokio::test]
    async fn test_start_viewing_requires_subscription() {
        let mut fx = fixture().await;
        let (stranger, mut rx) = channel();
        fx.coordinator
            .viewer_message(&stranger, &fx.identity, ViewerMessage::StartViewing { agent_id: a1() })
            .await;
        match viewer_msgs(&mut rx).as_slice() {
            [HubToViewer::Error { code, .. }] => assert_eq!(*code, ErrorCode::NotSubscribed),
            other => panic!("Unexpected reply: {:?}", other),
        }
        assert!(agent_msgs(&mut fx.agent_rx).is_empty());
    }

    #[tokio::test]
    async fn test_command_relay_and_ack() {
        let mut fx = fixture().await;
        let viewer_id = fx.viewer.id();
        let command = ControlCommand::Click {
            x: 0.5,
            y: 0.5,
            button: Default::default(),
        };
        fx.coordinator
            .viewer_message(
                &fx.viewer,
                &fx.identity,
                ViewerMessage::Command {
                    agent_id: a1(),
                    command: command.clone(),
                },
            )
            .await;
        assert_eq!(
            agent_msgs(&mut fx.agent_rx),
            vec![HubToAgent::Command { viewer_id, command }]
        );

        let ack = watchsec_protocol::CommandAck::ok(&ControlCommand::Lock, None);
        fx.coordinator
            .agent_message(
                &fx.session,
                AgentMessage::CommandAck {
                    viewer_id,
                    ack: ack.clone(),
                },
            )
            .await;
        assert_eq!(
            viewer_msgs(&mut fx.viewer_rx),
            vec![HubToViewer::CommandAck { agent_id: a1(), ack }]
        );
    }

    #[tokio::test]
    async fn test_command_to_disconnected_agent_absorbed() {
        let mut fx = fixture().await;
        fx.coordinator.connection_closed(fx.session.control.id()).await;
        viewer_msgs(&mut fx.viewer_rx);

        fx.coordinator
            .viewer_message(
                &fx.viewer,
                &fx.identity,
                ViewerMessage::Command {
                    agent_id: a1(),
                    command: ControlCommand::Lock,
                },
            )
            .await;
        assert!(viewer_msgs(&mut fx.viewer_rx).is_empty());
    }

    #[tokio::test]
    async fn test_frames_checked_against_connection() {
        let mut fx = fixture().await;

        let fan_out = fx.coordinator.agent_frame(&a1(), frame_bytes("A1", 1)).unwrap();
        assert_eq!(fan_out.delivered, 1);

        let spoofed = fx.coordinator.agent_frame(&a1(), frame_bytes("A2", 2));
        assert!(matches!(spoofed, Err(FrameRejection::AgentMismatch { .. })));

        let garbage = fx.coordinator.agent_frame(&a1(), Bytes::from_static(b"\x01"));
        assert!(matches!(garbage, Err(FrameRejection::Malformed(_))));

        let small = Coordinator::new(8);
        let too_large = small.agent_frame(&a1(), frame_bytes("A1", 3));
        assert!(matches!(too_large, Err(FrameRejection::TooLarge { .. })));

        let received: Vec<_> = std::iter::from_fn(|| fx.viewer_rx.try_recv().ok())
            .filter(|m| matches!(m, Outbound::Binary(_)))
            .collect();
        assert_eq!(received.len(), 1);
    }

    #[tokio::test]
    async fn test_agent_disconnect_drops_negotiation() {
        let mut fx = fixture().await;
        fx.coordinator
            .viewer_message(&fx.viewer, &fx.identity, ViewerMessage::StartViewing { agent_id: a1() })
            .await;
        viewer_msgs(&mut fx.viewer_rx);

        let departure = fx.coordinator.connection_closed(fx.session.control.id()).await;
        assert_eq!(departure, Departure::Agent(a1()));
        assert_eq!(fx.coordinator.broker.pending_count(), 0);

        let msgs = viewer_msgs(&mut fx.viewer_rx);
        assert!(msgs.contains(&HubToViewer::AgentOffline { agent_id: a1() }));
        assert!(msgs
            .iter()
            .any(|m| matches!(m, HubToViewer::PeerFailed { .. })));
    }

    #[tokio::test]
    async fn test_viewer_disconnect_cleans_up() {
        let mut fx = fixture().await;
        fx.coordinator
            .viewer_message(&fx.viewer, &fx.identity, ViewerMessage::StartViewing { agent_id: a1() })
            .await;
        agent_msgs(&mut fx.agent_rx);

        let departure = fx.coordinator.connection_closed(fx.viewer.id()).await;
        assert_eq!(departure, Departure::Viewer(vec![a1()]));
        assert_eq!(fx.coordinator.broker.pending_count(), 0);
        assert!(fx.coordinator.registry.room_members(&a1()).is_empty());
        assert_eq!(
            agent_msgs(&mut fx.agent_rx),
            vec![
                HubToAgent::ViewerLeft {
                    viewer_id: fx.viewer.id()
                },
                HubToAgent::StopSession
            ]
        );

        let fan_out = fx.coordinator.agent_frame(&a1(), frame_bytes("A1", 9)).unwrap();
        assert_eq!(fan_out.delivered, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_negotiation_never_outlives_agent() {
        let fx = fixture().await;
        let coordinator = Arc::new(fx.coordinator);
        let _viewer_rx = fx.viewer_rx;

        // A1 keeps reconnecting while its viewer keeps asking for sessions
        let churn = {
            let coordinator = Arc::clone(&coordinator);
            let mut control = fx.session.control;
            tokio::spawn(async move {
                let mut receivers = Vec::new();
                for _ in 0..200 {
                    coordinator.connection_closed(control.id()).await;
                    let (next, rx) = channel();
                    receivers.push(rx);
                    coordinator
                        .connect_agent(a1(), TenantId::new("7"), next.clone())
                        .await;
                    control = next;
                }
                coordinator.connection_closed(control.id()).await;
            })
        };
        let viewing = {
            let coordinator = Arc::clone(&coordinator);
            let (viewer, identity) = (fx.viewer, fx.identity);
            tokio::spawn(async move {
                for _ in 0..400 {
                    coordinator
                        .viewer_message(&viewer, &identity, ViewerMessage::StartViewing { agent_id: a1() })
                        .await;
                    tokio::task::yield_now().await;
                }
            })
        };
        // Unrelated agents come and go at the same time
        let others: Vec<_> = (2..10)
            .map(|n| {
                let coordinator = Arc::clone(&coordinator);
                tokio::spawn(async move {
                    let agent_id = AgentId::new(format!("A{}", n));
                    for _ in 0..50 {
                        let (control, _rx) = channel();
                        coordinator
                            .connect_agent(agent_id.clone(), TenantId::new("7"), control.clone())
                            .await;
                        coordinator.connection_closed(control.id()).await;
                    }
                })
            })
            .collect();

        churn.await.unwrap();
        viewing.await.unwrap();
        for task in others {
            task.await.unwrap();
        }

        assert!(!coordinator.registry.is_live(&a1()));
        assert_eq!(coordinator.registry.agent_count(), 0);
        assert!(coordinator.broker.exchange(&a1()).is_none());
        assert_eq!(coordinator.broker.pending_count(), 0);
    }
}
