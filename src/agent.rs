use crate::{
    crypto::{self, AgentKeys},
    error::{NegotiationError, Result},
    identity::IdentityProvider,
    model::*,
    proof::{InventoryProof, ProofEngine},
};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// What a buyer-side negotiator may ask of a supplier.
#[async_trait]
pub trait SupplierEndpoint: Send + Sync {
    fn identity(&self) -> &AgentIdentity;

    async fn request_proof(&self, request: &QuoteRequest, threshold: i64) -> Result<InventoryProof>;

    async fn countersign(
        &self,
        terms: &AgreementTerms,
        hash: &str,
        buyer: &AgentIdentity,
        buyer_signature: &AgreementSignature,
    ) -> Result<AgreementSignature>;

    /// Tells the supplier that the negotiation behind `request` ended in `reason`.
    async fn negotiation_failed(&self, request: &QuoteRequest, reason: FailureReason) -> Result<()>;
}

pub struct BuyerAgent {
    keys: AgentKeys,
    provider: Arc<dyn IdentityProvider>,
}

impl BuyerAgent {
    pub fn new(keys: AgentKeys, provider: Arc<dyn IdentityProvider>) -> Self {
        Self { keys, provider }
    }

    /// Obtains the buyer identity and checks it belongs to this agent's key.
    pub async fn connect(&self) -> Result<AgentIdentity> {
        let identity = self.provider.get_identity().await?;
        if identity.role != Role::Buyer {
            return Err(NegotiationError::Validation(format!("{} is not a buyer identity", identity.did)));
        }
        if identity.verifying_key != self.keys.verifying_key() {
            return Err(NegotiationError::Validation(format!(
                "Identity {} does not match the buyer signing key",
                identity.did
            )));
        }
        Ok(identity)
    }

    pub fn sign(&self, identity: &AgentIdentity, hash: &str) -> AgreementSignature {
        self.keys.sign(&identity.did, hash.as_bytes())
    }
}

/// Supplier agent. Its inventory and signing key never leave this struct; the
/// outside world only sees proofs and signatures.
pub struct SupplierAgent {
    keys: AgentKeys,
    identity: AgentIdentity,
    inventory: RwLock<HashMap<String, u64>>,
    engine: Arc<dyn ProofEngine>,
    /// Proof reference to the quote request it answered, until countersigned or failed.
    issued_proofs: Mutex<HashMap<String, Uuid>>,
    failures: Mutex<HashMap<Uuid, FailureReason>>,
}

impl SupplierAgent {
    pub fn new(keys: AgentKeys, did: Did, engine: Arc<dyn ProofEngine>) -> Self {
        let identity = keys.identity(did, Role::Supplier);
        Self {
            keys,
            identity,
            inventory: RwLock::new(HashMap::new()),
            engine,
            issued_proofs: Mutex::new(HashMap::new()),
            failures: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_stock(self, item: impl Into<String>, quantity: u64) -> Self {
        self.set_stock(item, quantity);
        self
    }

    pub fn set_stock(&self, item: impl Into<String>, quantity: u64) {
        self.inventory.write().insert(item.into(), quantity);
    }

    /// Failure reported for the negotiation behind `request_id`, if any.
    pub fn failure(&self, request_id: Uuid) -> Option<FailureReason> {
        self.failures.lock().get(&request_id).copied()
    }

    /// Proofs issued but not yet consumed by a countersignature or a failure.
    pub fn outstanding_proofs(&self) -> usize {
        self.issued_proofs.lock().len()
    }
}

#[async_trait]
impl SupplierEndpoint for SupplierAgent {
    fn identity(&self) -> &AgentIdentity {
        &self.identity
    }

    async fn request_proof(&self, request: &QuoteRequest, threshold: i64) -> Result<InventoryProof> {
        request.validate()?;
        let secret_quantity = self.inventory.read().get(&request.item).copied().unwrap_or(0);
        let engine = Arc::clone(&self.engine);

        tracing::debug!(supplier = %self.identity.did, item = %request.item, threshold, "Generating inventory proof");
        let proof = tokio::task::spawn_blocking(move || engine.prove(secret_quantity, threshold))
            .await
            .map_err(|e| NegotiationError::Internal(format!("Proof task failed: {}", e)))??;

        self.issued_proofs.lock().insert(proof.reference(), request.id);
        Ok(proof)
    }

    async fn countersign(
        &self,
        terms: &AgreementTerms,
        hash: &str,
        buyer: &AgentIdentity,
        buyer_signature: &AgreementSignature,
    ) -> Result<AgreementSignature> {
        if terms.supplier != self.identity.did {
            return Err(NegotiationError::Signature("Agreement names a different supplier".to_string()));
        }
        if terms.buyer != buyer.did || buyer_signature.signer != buyer.did {
            return Err(NegotiationError::Signature("Buyer signature does not match agreement".to_string()));
        }
        if terms.hash()? != hash {
            return Err(NegotiationError::Signature("Agreement hash does not match terms".to_string()));
        }
        if !self.issued_proofs.lock().contains_key(&terms.proof_ref) {
            return Err(NegotiationError::Signature("Agreement references an unknown proof".to_string()));
        }
        crypto::verify_signature(&buyer.verifying_key, hash.as_bytes(), &buyer_signature.signature)?;

        // Each proof backs at most one agreement.
        self.issued_proofs.lock().remove(&terms.proof_ref);
        tracing::debug!(supplier = %self.identity.did, hash, "Countersigning agreement");
        Ok(self.keys.sign(&self.identity.did, hash.as_bytes()))
    }

    async fn negotiation_failed(&self, request: &QuoteRequest, reason: FailureReason) -> Result<()> {
        tracing::info!(
            supplier = %self.identity.did,
            buyer = %request.requester.did,
            item = %request.item,
            reason = %reason,
            "Negotiation failed"
        );
        self.issued_proofs.lock().retain(|_, request_id| *request_id != request.id);
        self.failures.lock().insert(request.id, reason);
        Ok(())
    }
}
