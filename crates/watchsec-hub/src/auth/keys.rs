//! Config-driven credential store

use std::collections::HashMap;

use sha2::{Digest, Sha256};

use watchsec_core::config::HubConfig;
use watchsec_protocol::{AgentId, TenantId};

use super::{Authenticator, ViewerIdentity};

/// Prefix marking a pre-hashed secret in the config file
const DIGEST_PREFIX: &str = "sha256:";

/// Hex SHA-256 digest of a secret
pub fn secret_digest(secret: &str) -> String {
    hex::encode(Sha256::digest(secret.as_bytes()))
}

/// Normalize a configured secret to its digest
fn configured_digest(entry: &str) -> String {
    match entry.strip_prefix(DIGEST_PREFIX) {
        Some(hex) => hex.to_ascii_lowercase(),
        None => secret_digest(entry),
    }
}

/// Agent keys and viewer tokens loaded from the hub config.
///
/// Only digests are held in memory; presented secrets are hashed before
/// lookup.
#[derive(Debug, Default)]
pub struct StaticAuthenticator {
    /// Key digest -> tenant
    agent_keys: HashMap<String, TenantId>,
    /// Token digest -> viewer
    viewer_tokens: HashMap<String, ViewerIdentity>,
}

impl StaticAuthenticator {
    /// Create an empty store that rejects everything
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the store from configuration
    pub fn from_config(config: &HubConfig) -> Self {
        let mut store = Self::new();

        for tenant in &config.tenants {
            for key in &tenant.agent_keys {
                store.add_agent_key(key, TenantId::new(tenant.id.clone()));
            }
        }

        for viewer in &config.viewers {
            let identity = ViewerIdentity {
                tenant: TenantId::new(viewer.tenant.clone()),
                role: viewer.role,
                name: viewer
                    .name
                    .clone()
                    .unwrap_or_else(|| format!("viewer@{}", viewer.tenant)),
            };
            store.add_viewer_token(&viewer.token, identity);
        }

        store
    }

    /// Register an agent key (plain or `sha256:` digest)
    pub fn add_agent_key(&mut self, key: &str, tenant: TenantId) {
        let digest = configured_digest(key);
        if let Some(previous) = self.agent_keys.insert(digest, tenant.clone()) {
            if previous != tenant {
                tracing::warn!(
                    "Agent key configured for both tenant {} and tenant {}; using {}",
                    previous,
                    tenant,
                    tenant
                );
            }
        }
    }

    /// Register a viewer token (plain or `sha256:` digest)
    pub fn add_viewer_token(&mut self, token: &str, identity: ViewerIdentity) {
        self.viewer_tokens.insert(configured_digest(token), identity);
    }

    /// Number of configured agent keys
    pub fn agent_key_count(&self) -> usize {
        self.agent_keys.len()
    }

    /// Number of configured viewer tokens
    pub fn viewer_token_count(&self) -> usize {
        self.viewer_tokens.len()
    }
}

impl Authenticator for StaticAuthenticator {
    fn agent_tenant(&self, agent_id: &AgentId, api_key: &str) -> Option<TenantId> {
        if api_key.is_empty() {
            return None;
        }
        let tenant = self.agent_keys.get(&secret_digest(api_key)).cloned();
        if tenant.is_none() {
            tracing::debug!("Unknown API key presented by agent {}", agent_id);
        }
        tenant
    }

    fn viewer_identity(&self, token: &str) -> Option<ViewerIdentity> {
        if token.is_empty() {
            return None;
        }
        self.viewer_tokens.get(&secret_digest(token)).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use watchsec_core::config::{TenantConfig, ViewerCredential, ViewerRole};

    fn config() -> HubConfig {
        let mut config = HubConfig::default();
        config.tenants.push(TenantConfig {
            id: "7".to_string(),
            agent_keys: vec![
                "plain-key".to_string(),
                format!("sha256:{}", secret_digest("hashed-key").to_uppercase()),
            ],
        });
        config.viewers.push(ViewerCredential {
            token: "viewer-token".to_string(),
            tenant: "7".to_string(),
            name: Some("alice".to_string()),
            role: ViewerRole::User,
        });
        config.viewers.push(ViewerCredential {
            token: "root-token".to_string(),
            tenant: "0".to_string(),
            name: None,
            role: ViewerRole::Super,
        });
        config
    }

    #[test]
    fn test_digest_is_hex_sha256() {
        assert_eq!(
            secret_digest("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_agent_keys_resolve_to_tenant() {
        let auth = StaticAuthenticator::from_config(&config());
        let agent = AgentId::new("A1");

        assert_eq!(
            auth.agent_tenant(&agent, "plain-key"),
            Some(TenantId::new("7"))
        );
        assert_eq!(
            auth.agent_tenant(&agent, "hashed-key"),
            Some(TenantId::new("7"))
        );
        assert_eq!(auth.agent_tenant(&agent, "wrong"), None);
        assert_eq!(auth.agent_tenant(&agent, ""), None);
        assert_eq!(auth.agent_key_count(), 2);
    }

    #[test]
    fn test_viewer_tokens() {
        let auth = StaticAuthenticator::from_config(&config());

        let alice = auth.viewer_identity("viewer-token").unwrap();
        assert_eq!(alice.tenant, TenantId::new("7"));
        assert_eq!(alice.name, "alice");
        assert_eq!(alice.role, ViewerRole::User);

        let root = auth.viewer_identity("root-token").unwrap();
        assert_eq!(root.role, ViewerRole::Super);
        assert_eq!(root.name, "viewer@0");

        assert!(auth.viewer_identity("nope").is_none());
    }

    #[test]
    fn test_empty_store_rejects_everything() {
        let auth = StaticAuthenticator::new();
        assert!(auth.agent_tenant(&AgentId::new("A1"), "k").is_none());
        assert!(auth.viewer_identity("t").is_none());
    }
}
