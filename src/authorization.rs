use crate::{
    error::{NegotiationError, Result},
    model::{AuthorizationDecision, Did},
};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

#[async_trait]
pub trait AuthorizationOracle: Send + Sync {
    /// Decides whether `supplier` may quote `item` to `buyer`. Pure query.
    async fn authorize(&self, buyer: &Did, supplier: &Did, item: &str) -> Result<AuthorizationDecision>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "scope", content = "buyers")]
pub enum AccessScope {
    AnyBuyer,
    Buyers(HashSet<Did>),
}

#[derive(Default)]
struct Registry {
    agents: HashSet<Did>,
    rules: HashMap<(Did, String), AccessScope>,
}

/// Access-control list keyed by (supplier, item), shared by all negotiations.
#[derive(Default)]
pub struct RegistryOracle {
    registry: RwLock<Registry>,
}

impl RegistryOracle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, did: Did) {
        tracing::debug!(did = %did, "Registering agent");
        self.registry.write().agents.insert(did);
    }

    pub fn allow(&self, supplier: &Did, item: &str, scope: AccessScope) -> Result<()> {
        let mut registry = self.registry.write();
        if !registry.agents.contains(supplier) {
            return Err(NegotiationError::NotRegistered(supplier.clone()));
        }
        tracing::info!(supplier = %supplier, item, "Granting quote authorization");
        registry.rules.insert((supplier.clone(), item.to_string()), scope);
        Ok(())
    }

    pub fn revoke(&self, supplier: &Did, item: &str) -> bool {
        tracing::info!(supplier = %supplier, item, "Revoking quote authorization");
        self.registry
            .write()
            .rules
            .remove(&(supplier.clone(), item.to_string()))
            .is_some()
    }

    fn decide(&self, buyer: &Did, supplier: &Did, item: &str) -> Result<bool> {
        let registry = self.registry.read();
        for did in [buyer, supplier] {
            if !registry.agents.contains(did) {
                return Err(NegotiationError::NotRegistered(did.clone()));
            }
        }
        let authorized = match registry.rules.get(&(supplier.clone(), item.to_string())) {
            Some(AccessScope::AnyBuyer) => true,
            Some(AccessScope::Buyers(buyers)) => buyers.contains(buyer),
            None => false,
        };
        Ok(authorized)
    }
}

#[async_trait]
impl AuthorizationOracle for RegistryOracle {
    async fn authorize(&self, buyer: &Did, supplier: &Did, item: &str) -> Result<AuthorizationDecision> {
        let authorized = self.decide(buyer, supplier, item)?;
        tracing::debug!(buyer = %buyer, supplier = %supplier, item, authorized, "Authorization decided");

        Ok(AuthorizationDecision {
            supplier: supplier.clone(),
            buyer: buyer.clone(),
            item: item.to_string(),
            authorized,
            timestamp: Utc::now(),
        })
    }
}
