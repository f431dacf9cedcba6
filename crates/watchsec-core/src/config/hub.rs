//! Relay hub configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::serde_utils::{duration_millis, duration_secs};
use crate::error::ConfigError;

/// Configuration for the relay hub daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// Address to bind the HTTP/websocket server to
    pub bind_address: String,

    /// Capacity of each connection's outbound queue
    pub outbound_queue: usize,

    /// How long a peer-to-peer negotiation may take before falling back to relay
    #[serde(with = "duration_secs")]
    pub negotiation_timeout: Duration,

    /// How often pending negotiations are checked against the timeout
    #[serde(with = "duration_millis")]
    pub sweep_interval: Duration,

    /// Largest binary frame accepted from an agent
    pub max_frame_bytes: usize,

    /// Consecutive failed writes after which a connection is dropped
    pub max_write_failures: u32,

    /// Tenants and the API keys their agents authenticate with
    pub tenants: Vec<TenantConfig>,

    /// Bearer tokens accepted from viewers
    pub viewers: Vec<ViewerCredential>,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
            outbound_queue: 64,
            negotiation_timeout: Duration::from_secs(10),
            sweep_interval: Duration::from_millis(500),
            max_frame_bytes: 4 * 1024 * 1024,
            max_write_failures: 3,
            tenants: Vec::new(),
            viewers: Vec::new(),
        }
    }
}

impl HubConfig {
    /// Reject settings the hub cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.outbound_queue == 0 {
            return Err(ConfigError::Invalid(
                "outbound_queue must be at least 1".to_string(),
            ));
        }
        if self.negotiation_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "negotiation_timeout must be positive".to_string(),
            ));
        }
        if self.sweep_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "sweep_interval must be positive".to_string(),
            ));
        }
        if self.max_write_failures == 0 {
            return Err(ConfigError::Invalid(
                "max_write_failures must be at least 1".to_string(),
            ));
        }
        for tenant in &self.tenants {
            if tenant.id.is_empty() {
                return Err(ConfigError::MissingField("tenants.id".to_string()));
            }
        }
        for viewer in &self.viewers {
            if viewer.token.is_empty() {
                return Err(ConfigError::MissingField("viewers.token".to_string()));
            }
        }
        Ok(())
    }
}

/// A tenant and the keys its agents present
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TenantConfig {
    /// Tenant identifier
    pub id: String,
    /// Agent API keys. Either the plain key or `sha256:<hex digest>`.
    pub agent_keys: Vec<String>,
}

/// A viewer bearer token and what it grants
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ViewerCredential {
    /// Bearer token. Either the plain token or `sha256:<hex digest>`.
    pub token: String,
    /// Tenant the viewer belongs to
    pub tenant: String,
    /// Display name used in logs
    #[serde(default)]
    pub name: Option<String>,
    /// Access role
    #[serde(default)]
    pub role: ViewerRole,
}

/// Viewer access role
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ViewerRole {
    /// Sees agents of its own tenant only
    #[default]
    User,
    /// Sees agents of every tenant
    Super,
}
