use crate::{
    error::{NegotiationError, Result},
    model::AgentIdentity,
};
use async_trait::async_trait;
use parking_lot::RwLock;

/// Source of an agent's authenticated identity (wallet, DID resolver, ...).
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn get_identity(&self) -> Result<AgentIdentity>;
}

/// Identity provider holding a fixed identity that can be disconnected.
pub struct StaticIdentityProvider {
    identity: RwLock<Option<AgentIdentity>>,
}

impl StaticIdentityProvider {
    pub fn connected(identity: AgentIdentity) -> Self {
        Self {
            identity: RwLock::new(Some(identity)),
        }
    }

    pub fn disconnected() -> Self {
        Self {
            identity: RwLock::new(None),
        }
    }

    pub fn disconnect(&self) {
        self.identity.write().take();
    }
}

#[async_trait]
impl IdentityProvider for StaticIdentityProvider {
    async fn get_identity(&self) -> Result<AgentIdentity> {
        self.identity.read().clone().ok_or(NegotiationError::NotConnected)
    }
}
