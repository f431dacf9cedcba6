//! Tenant check applied to every room operation

use watchsec_core::config::ViewerRole;
use watchsec_core::RelayError;
use watchsec_protocol::{AgentId, TenantId};

use super::ViewerIdentity;

/// Decides whether a viewer may enter (or act in) an agent's room
pub struct RoomGate;

impl RoomGate {
    /// Allow if the viewer's tenant owns the agent, or the viewer is super
    pub fn authorize(
        viewer: &ViewerIdentity,
        agent_id: &AgentId,
        agent_tenant: &TenantId,
    ) -> Result<(), RelayError> {
        if viewer.role == ViewerRole::Super || &viewer.tenant == agent_tenant {
            return Ok(());
        }

        tracing::warn!(
            viewer = %viewer.name,
            viewer_tenant = %viewer.tenant,
            agent = %agent_id,
            agent_tenant = %agent_tenant,
            "Authorization denied"
        );
        Err(RelayError::Authorization {
            agent_id: agent_id.clone(),
            tenant: viewer.tenant.clone(),
        })
    }
}
