//! JSON control messages
//!
//! Every message is a JSON object tagged by a snake_case `type` field with
//! camelCase payload fields. Signaling payloads (`sdp`, candidates) are
//! carried verbatim; the hub only reads the routing fields.
//!
//! There is one enum per direction and hop:
//! - [`AgentMessage`]: agent -> hub
//! - [`HubToAgent`]: hub -> agent
//! - [`ViewerMessage`]: viewer -> hub
//! - [`HubToViewer`]: hub -> viewer

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::command::{CommandAck, ControlCommand};
use crate::error::ProtocolError;
use crate::ids::{AgentId, ConnectionId};

/// Path a live stream currently takes from agent to viewers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transport {
    /// No stream is flowing
    #[default]
    None,
    /// Frames are pushed through the hub
    Relayed,
    /// Frames flow directly between agent and viewer
    PeerToPeer,
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::None => write!(f, "none"),
            Transport::Relayed => write!(f, "relayed"),
            Transport::PeerToPeer => write!(f, "peer_to_peer"),
        }
    }
}

/// A single ICE candidate, in the browser's `RTCIceCandidateInit` shape
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_mline_index: Option<u16>,
}

/// Messages sent by an agent over its control connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum AgentMessage {
    /// Session description offer for the viewer that requested a session
    Offer { viewer_id: ConnectionId, sdp: String },
    /// Local ICE candidate for a viewer
    Candidate {
        viewer_id: ConnectionId,
        #[serde(flatten)]
        candidate: IceCandidate,
    },
    /// Direct path to the viewer is up
    PeerConnected { viewer_id: ConnectionId },
    /// Direct path could not be established
    PeerFailed { viewer_id: ConnectionId, reason: String },
    /// Result of a command that reports back to the issuing viewer
    CommandAck { viewer_id: ConnectionId, ack: CommandAck },
    /// Keep-alive
    Ping,
}

/// Messages the hub sends to an agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum HubToAgent {
    /// Registration accepted
    Registered { agent_id: AgentId },
    /// A viewer wants to watch: start (or renegotiate) a live session
    StartSession { viewer_id: ConnectionId },
    /// Nobody is watching anymore
    StopSession,
    /// The viewer's answer to the agent's offer
    Answer { viewer_id: ConnectionId, sdp: String },
    /// Remote ICE candidate from a viewer
    Candidate {
        viewer_id: ConnectionId,
        #[serde(flatten)]
        candidate: IceCandidate,
    },
    /// Transport the hub decided on for this agent's stream
    TransportSelected { transport: Transport },
    /// Input or session-control command from a viewer
    Command {
        viewer_id: ConnectionId,
        command: ControlCommand,
    },
    /// The viewer gave up on the direct path, or the negotiation timed out
    PeerFailed { viewer_id: ConnectionId, reason: String },
    /// A viewer left the room
    ViewerLeft { viewer_id: ConnectionId },
    /// Keep-alive reply
    Pong,
}

/// Messages sent by a viewer over its connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ViewerMessage {
    /// Subscribe to an agent's room
    Join { agent_id: AgentId },
    /// Leave an agent's room
    Leave { agent_id: AgentId },
    /// Ask the agent to start a live session (and negotiate a peer path)
    StartViewing { agent_id: AgentId },
    /// Answer to the agent's offer
    Answer { agent_id: AgentId, sdp: String },
    /// Local ICE candidate from the viewer
    Candidate {
        agent_id: AgentId,
        #[serde(flatten)]
        candidate: IceCandidate,
    },
    /// The viewer gave up on the direct path
    PeerFailed { agent_id: AgentId, reason: String },
    /// Input or session-control command for the agent
    Command {
        agent_id: AgentId,
        command: ControlCommand,
    },
    /// Keep-alive
    Ping,
}

/// Messages the hub sends to a viewer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum HubToViewer {
    /// Subscription accepted
    Joined { agent_id: AgentId, transport: Transport },
    /// Subscription removed
    Left { agent_id: AgentId },
    /// Agent's session description offer
    Offer { agent_id: AgentId, sdp: String },
    /// Agent's ICE candidate
    Candidate {
        agent_id: AgentId,
        #[serde(flatten)]
        candidate: IceCandidate,
    },
    /// The agent gave up on the direct path, or the negotiation timed out
    PeerFailed { agent_id: AgentId, reason: String },
    /// The agent's stream switched paths
    TransportChanged { agent_id: AgentId, transport: Transport },
    /// The agent (re)connected
    AgentOnline { agent_id: AgentId },
    /// The agent disconnected or is not connected
    AgentOffline { agent_id: AgentId },
    /// Agent's acknowledgement of a command
    CommandAck { agent_id: AgentId, ack: CommandAck },
    /// Request rejected
    Error { code: ErrorCode, message: String },
    /// Keep-alive reply
    Pong,
}

/// Machine-readable error codes reported to viewers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// The caller's tenant does not own the agent
    Unauthorized,
    /// The message could not be parsed
    BadRequest,
    /// The caller is not subscribed to the agent
    NotSubscribed,
}

/// Encode a control message as JSON text
pub fn encode<T: Serialize>(message: &T) -> Result<String, ProtocolError> {
    Ok(serde_json::to_string(message)?)
}

/// Decode a control message from JSON text
pub fn decode<T: DeserializeOwned>(text: &str) -> Result<T, ProtocolError> {
    Ok(serde_json::from_str(text)?)
}
