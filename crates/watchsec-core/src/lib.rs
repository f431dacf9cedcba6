//! watchsec-core: Core abstractions and configuration for WatchSec
//!
//! This crate provides the configuration structures, error taxonomy and the
//! transport negotiation state machine shared by the hub and the agent.

pub mod config;
pub mod error;
pub mod negotiation;
pub mod time;

pub use error::{ConfigError, NegotiationError, RelayError};
pub use negotiation::{NegotiationEvent, NegotiationState};
pub use watchsec_protocol::Transport;
