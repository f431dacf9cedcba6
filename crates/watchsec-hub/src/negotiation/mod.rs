//! Peer-to-peer negotiation brokering
//!
//! The hub never takes part in a direct session itself. It forwards offers,
//! answers and candidates between one agent and the viewer that asked for a
//! session, and falls the pair back to the relay when no direct path forms
//! within the negotiation window.

mod broker;
mod sweeper;

pub use broker::{CandidateOrigin, SignalingBroker, SignalingError, SignalingExchange};
pub use sweeper::run_negotiation_sweeper;
