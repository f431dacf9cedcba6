//! watchsec-protocol: Wire protocol for WatchSec remote sessions
//!
//! This crate defines the JSON control messages exchanged between agents,
//! the relay hub and viewers, the control commands viewers send to agents,
//! and the binary stream frame that carries encoded screen captures.

pub mod chunk;
pub mod codec;
pub mod command;
pub mod error;
pub mod frame;
pub mod ids;
pub mod message;

pub use chunk::{split_frame, ChunkAssembler, FrameChunk};
pub use codec::RecordingCodec;
pub use command::{CommandAck, ControlCommand, MouseButton};
pub use error::ProtocolError;
pub use frame::{StreamFrame, FRAME_VERSION, HEADER_SIZE, MAX_PAYLOAD_SIZE};
pub use ids::{AgentId, ConnectionId, TenantId};
pub use message::{
    AgentMessage, ErrorCode, HubToAgent, HubToViewer, IceCandidate, Transport, ViewerMessage,
};
