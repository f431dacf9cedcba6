//! WebRTC peer links
//!
//! Each viewer gets its own peer connection with a single data channel.
//! The channel is unordered with no retransmits, so a lost frame is simply
//! superseded by the next one. Frames larger than one SCTP message travel
//! as [`watchsec_protocol::chunk`] pieces.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use watchsec_core::config::PeerConfig;
use watchsec_protocol::{message, ControlCommand, IceCandidate};

use super::{LinkKey, PeerEvent, PeerFactory, PeerLink};
use crate::error::PeerError;

/// Label of the frame and command channel
pub const FRAME_CHANNEL_LABEL: &str = "watchsec-stream";

/// Largest data channel message sent, below the 64 KiB SCTP limit
pub const MAX_MESSAGE_SIZE: usize = 60_000;

fn rtc_error(err: impl std::error::Error) -> PeerError {
    PeerError::Rtc(err.to_string())
}

/// Decode a command sent by the viewer over the data channel
pub fn parse_peer_command(msg: &DataChannelMessage) -> Result<ControlCommand, PeerError> {
    if !msg.is_string {
        return Err(PeerError::Rtc("expected text payload for command".into()));
    }
    let text = std::str::from_utf8(&msg.data)
        .map_err(|err| PeerError::Rtc(format!("invalid utf8 payload: {err}")))?;
    message::decode(text).map_err(|err| PeerError::Rtc(format!("invalid command: {err}")))
}

/// Builds WebRTC peer connections from the agent's peer settings
pub struct WebRtcPeerFactory {
    ice_servers: Vec<String>,
}

impl WebRtcPeerFactory {
    pub fn new(ice_servers: Vec<String>) -> Self {
        Self { ice_servers }
    }

    pub fn from_config(config: &PeerConfig) -> Self {
        Self::new(config.ice_servers.clone())
    }

    fn configuration(&self) -> RTCConfiguration {
        let ice_servers = if self.ice_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }]
        };
        RTCConfiguration {
            ice_servers,
            ..Default::default()
        }
    }
}

#[async_trait]
impl PeerFactory for WebRtcPeerFactory {
    async fn create(
        &self,
        key: LinkKey,
        events: mpsc::Sender<PeerEvent>,
    ) -> Result<Arc<dyn PeerLink>, PeerError> {
        let api = APIBuilder::new().build();
        let pc = Arc::new(
            api.new_peer_connection(self.configuration())
                .await
                .map_err(rtc_error)?,
        );

        let init = RTCDataChannelInit {
            ordered: Some(false),
            max_retransmits: Some(0),
            ..Default::default()
        };
        let dc = pc
            .create_data_channel(FRAME_CHANNEL_LABEL, Some(init))
            .await
            .map_err(rtc_error)?;

        wire_peer_events(&pc, key, events.clone());
        wire_channel_events(&dc, key, events);

        Ok(Arc::new(WebRtcPeerLink { key, pc, dc }))
    }
}

fn wire_peer_events(pc: &Arc<RTCPeerConnection>, key: LinkKey, events: mpsc::Sender<PeerEvent>) {
    let candidate_events = events.clone();
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let events = candidate_events.clone();
        Box::pin(async move {
            let Some(candidate) = candidate else {
                return;
            };
            match candidate.to_json() {
                Ok(json) => {
                    let candidate = IceCandidate {
                        candidate: json.candidate,
                        sdp_mid: json.sdp_mid,
                        sdp_mline_index: json.sdp_mline_index,
                    };
                    let _ = events
                        .send(PeerEvent::LocalCandidate { key, candidate })
                        .await;
                }
                Err(e) => tracing::warn!("Failed to serialize local candidate: {}", e),
            }
        })
    }));

    pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        let events = events.clone();
        Box::pin(async move {
            tracing::debug!("Peer connection to {} is {}", key.viewer_id, state);
            if matches!(
                state,
                RTCPeerConnectionState::Failed | RTCPeerConnectionState::Disconnected
            ) {
                let _ = events
                    .send(PeerEvent::Failed {
                        key,
                        reason: format!("peer connection {}", state),
                    })
                    .await;
            }
        })
    }));
}

fn wire_channel_events(dc: &Arc<RTCDataChannel>, key: LinkKey, events: mpsc::Sender<PeerEvent>) {
    let open_events = events.clone();
    dc.on_open(Box::new(move || {
        let events = open_events.clone();
        Box::pin(async move {
            tracing::debug!("Data channel to {} open", key.viewer_id);
            let _ = events.send(PeerEvent::Connected { key }).await;
        })
    }));

    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        let events = events.clone();
        Box::pin(async move {
            match parse_peer_command(&msg) {
                Ok(command) => {
                    let _ = events.send(PeerEvent::Command { key, command }).await;
                }
                Err(e) => tracing::warn!("Dropping data channel message from {}: {}", key.viewer_id, e),
            }
        })
    }));
}

/// A peer connection to one viewer
pub struct WebRtcPeerLink {
    key: LinkKey,
    pc: Arc<RTCPeerConnection>,
    dc: Arc<RTCDataChannel>,
}

#[async_trait]
impl PeerLink for WebRtcPeerLink {
    async fn create_offer(&self) -> Result<String, PeerError> {
        let offer = self.pc.create_offer(None).await.map_err(rtc_error)?;
        self.pc
            .set_local_description(offer.clone())
            .await
            .map_err(rtc_error)?;
        Ok(offer.sdp)
    }

    async fn apply_answer(&self, sdp: String) -> Result<(), PeerError> {
        let answer = RTCSessionDescription::answer(sdp).map_err(rtc_error)?;
        self.pc
            .set_remote_description(answer)
            .await
            .map_err(rtc_error)
    }

    async fn add_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            ..Default::default()
        };
        self.pc.add_ice_candidate(init).await.map_err(rtc_error)
    }

    async fn send_message(&self, message: Bytes) -> Result<(), PeerError> {
        self.dc.send(&message).await.map(|_| ()).map_err(rtc_error)
    }

    fn max_message_size(&self) -> usize {
        MAX_MESSAGE_SIZE
    }

    fn is_open(&self) -> bool {
        self.dc.ready_state() == RTCDataChannelState::Open
    }

    async fn close(&self) {
        if let Err(e) = self.pc.close().await {
            tracing::debug!("Closing peer connection to {}: {}", self.key.viewer_id, e);
        }
    }
}
