//! watchsec-hub: Relay hub for WatchSec remote sessions
//!
//! The hub accepts long-lived websocket connections from agents and
//! viewers, keeps one room per agent, brokers the peer-to-peer negotiation
//! between an agent and a viewer, relays stream frames when no direct path
//! exists, and forwards viewer commands to agents. Every room operation is
//! checked against the tenant owning the agent.

pub mod auth;
pub mod channel;
pub mod coordinator;
pub mod negotiation;
pub mod registry;
pub mod server;
pub mod state;

pub use coordinator::Coordinator;
pub use registry::SessionRegistry;
pub use state::HubState;
