//! watchsec-agent: Host agent for WatchSec remote sessions
//!
//! The agent keeps an outbound control connection to the relay hub. On
//! request it captures the screen, negotiates a direct WebRTC path to each
//! viewer and falls back to pushing frames through the hub. Viewer commands
//! are replayed against the local input subsystem, and sessions can be
//! recorded to disk and uploaded when the recording stops.

pub mod capture;
pub mod error;
pub mod hub;
pub mod input;
pub mod negotiator;
pub mod platform;
pub mod recording;
pub mod runtime;
pub mod state;
pub mod stream;

#[cfg(test)]
mod testing;

pub use runtime::AgentRuntime;
pub use state::AgentState;
