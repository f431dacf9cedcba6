//! Global hub state

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use watchsec_core::config::HubConfig;

use crate::auth::{Authenticator, StaticAuthenticator};
use crate::coordinator::Coordinator;

/// State shared by every connection handler
pub struct HubState {
    /// Configuration
    pub config: HubConfig,
    /// Credential store
    pub auth: Arc<dyn Authenticator>,
    /// Registry and signaling broker
    pub coordinator: Arc<Coordinator>,
    /// Cancelled when the hub shuts down
    pub shutdown: CancellationToken,
}

impl HubState {
    /// Create hub state with credentials from the config
    pub fn new(config: HubConfig) -> Self {
        let auth = StaticAuthenticator::from_config(&config);
        if auth.agent_key_count() == 0 {
            tracing::warn!("No agent keys configured - all agents will be rejected");
        }
        if auth.viewer_token_count() == 0 {
            tracing::warn!("No viewer tokens configured - all viewers will be rejected");
        }
        Self::with_auth(config, Arc::new(auth))
    }

    /// Create hub state with a provided authenticator
    pub fn with_auth(config: HubConfig, auth: Arc<dyn Authenticator>) -> Self {
        let coordinator = Arc::new(Coordinator::from_config(&config));
        Self {
            config,
            auth,
            coordinator,
            shutdown: CancellationToken::new(),
        }
    }
}
