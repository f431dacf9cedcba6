//! Core error types for WatchSec

use std::path::PathBuf;
use thiserror::Error;

use watchsec_protocol::{AgentId, TenantId};

use crate::negotiation::{NegotiationEvent, NegotiationState};

/// Errors raised by the relay hub's registry
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    /// The caller's tenant does not own the agent
    #[error("Tenant {tenant} is not authorized for agent {agent_id}")]
    Authorization { agent_id: AgentId, tenant: TenantId },

    /// The agent has no live control channel
    #[error("Agent not connected: {0}")]
    TargetUnavailable(AgentId),

    /// No direct path was established within the negotiation window
    #[error("Negotiation timed out for agent {0}")]
    NegotiationTimeout(AgentId),

    /// A connection's outbound queue rejected the message
    #[error("Transport write failed: {0}")]
    TransportWriteFailure(String),
}

impl RelayError {
    /// Whether the error must be reported back to the caller
    pub fn is_user_facing(&self) -> bool {
        matches!(self, RelayError::Authorization { .. })
    }
}

/// Illegal negotiation state transition
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NegotiationError {
    #[error("Cannot apply {event:?} in state {from:?}")]
    IllegalTransition {
        from: NegotiationState,
        event: NegotiationEvent,
    },
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file not found
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    /// Invalid configuration
    #[error("Invalid config: {0}")]
    Invalid(String),

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialize error
    #[error("TOML serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// Missing required field
    #[error("Missing required field: {0}")]
    MissingField(String),
}
