//! Authentication and room authorization for the hub
//!
//! Agents authenticate with a per-tenant API key, viewers with a bearer
//! token. Both are resolved by an [`Authenticator`]; the hub ships with a
//! static, config-driven implementation. Room access is then decided by the
//! [`RoomGate`] on every subscribe and command.

mod gate;
mod keys;

pub use gate::RoomGate;
pub use keys::{secret_digest, StaticAuthenticator};

use watchsec_core::config::ViewerRole;
use watchsec_protocol::{AgentId, TenantId};

/// Resolved identity of a viewer connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewerIdentity {
    /// Tenant the viewer belongs to
    pub tenant: TenantId,
    /// Access role
    pub role: ViewerRole,
    /// Display name used in logs
    pub name: String,
}

impl ViewerIdentity {
    /// Identity with the default (tenant-scoped) role
    pub fn user(tenant: impl Into<TenantId>, name: impl Into<String>) -> Self {
        Self {
            tenant: tenant.into(),
            role: ViewerRole::User,
            name: name.into(),
        }
    }

    /// Identity allowed to see every tenant's agents
    pub fn super_user(tenant: impl Into<TenantId>, name: impl Into<String>) -> Self {
        Self {
            tenant: tenant.into(),
            role: ViewerRole::Super,
            name: name.into(),
        }
    }
}

/// Resolves presented credentials to tenants and identities
pub trait Authenticator: Send + Sync {
    /// Tenant owning the agent key, if the key is valid
    fn agent_tenant(&self, agent_id: &AgentId, api_key: &str) -> Option<TenantId>;

    /// Identity behind a viewer bearer token, if the token is valid
    fn viewer_identity(&self, token: &str) -> Option<ViewerIdentity>;
}
