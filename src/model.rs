use crate::{crypto, NegotiationError, NegotiationId, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Decentralized identifier of an agent, e.g. `did:example:buyer1`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Did(String);

impl Did {
    pub fn new(value: impl Into<String>) -> Result<Self> {
        let value = value.into();
        if value.trim().is_empty() {
            return Err(NegotiationError::Validation("DID cannot be empty".to_string()));
        }
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Did {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Buyer,
    Supplier,
}

/// Identity issued to an agent by its identity provider. The verifying key is
/// the public half of the agent's signing key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentIdentity {
    pub did: Did,
    pub role: Role,
    #[serde(with = "crypto::hex_array")]
    pub verifying_key: [u8; 32],
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuoteRequest {
    pub id: Uuid,
    pub requester: AgentIdentity,
    pub item: String,
    pub quantity: u64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorizationDecision {
    pub supplier: Did,
    pub buyer: Did,
    pub item: String,
    pub authorized: bool,
    pub timestamp: DateTime<Utc>,
}

/// The signed-over part of an agreement. Its canonical JSON encoding is hashed
/// to produce the agreement hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgreementTerms {
    pub id: Uuid,
    pub negotiation_id: NegotiationId,
    pub buyer: Did,
    pub supplier: Did,
    pub item: String,
    pub quantity: u64,
    pub threshold: i64,
    pub proof_ref: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgreementSignature {
    pub signer: Did,
    #[serde(with = "crypto::hex_bytes")]
    pub signature: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Agreement {
    pub terms: AgreementTerms,
    pub hash: String,
    pub buyer_signature: AgreementSignature,
    pub supplier_signature: AgreementSignature,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReputationScore {
    pub agent: Did,
    pub score: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReputationDelta {
    pub agent: Did,
    pub delta: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitReceipt {
    pub agreement_hash: String,
    pub sequence: u64,
    pub committed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    NotRegistered,
    Unauthorized,
    InsufficientQuantity,
    ProofRejected,
    SignatureRejected,
    Timeout,
    Cancelled,
}

impl FailureReason {
    /// Maps an error raised during a negotiation step to the terminal reason,
    /// or `None` if the error does not end the negotiation.
    pub fn from_error(err: &NegotiationError) -> Option<Self> {
        match err {
            NegotiationError::NotRegistered(_) => Some(FailureReason::NotRegistered),
            NegotiationError::Unauthorized => Some(FailureReason::Unauthorized),
            NegotiationError::InvalidThreshold(_) | NegotiationError::ProofRejected => {
                Some(FailureReason::ProofRejected)
            }
            NegotiationError::InsufficientQuantity => Some(FailureReason::InsufficientQuantity),
            NegotiationError::Signature(_) => Some(FailureReason::SignatureRejected),
            NegotiationError::Timeout(_) => Some(FailureReason::Timeout),
            NegotiationError::Cancelled => Some(FailureReason::Cancelled),
            _ => None,
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureReason::NotRegistered => "not_registered",
            FailureReason::Unauthorized => "unauthorized",
            FailureReason::InsufficientQuantity => "insufficient_quantity",
            FailureReason::ProofRejected => "proof_rejected",
            FailureReason::SignatureRejected => "signature_rejected",
            FailureReason::Timeout => "timeout",
            FailureReason::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "reason")]
pub enum NegotiationState {
    Disconnected,
    Connected,
    Requested,
    Authorized,
    Proofed,
    Signed,
    Failed(FailureReason),
}

impl NegotiationState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, NegotiationState::Signed | NegotiationState::Failed(_))
    }
}

impl fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NegotiationState::Disconnected => f.write_str("disconnected"),
            NegotiationState::Connected => f.write_str("connected"),
            NegotiationState::Requested => f.write_str("requested"),
            NegotiationState::Authorized => f.write_str("authorized"),
            NegotiationState::Proofed => f.write_str("proofed"),
            NegotiationState::Signed => f.write_str("signed"),
            NegotiationState::Failed(reason) => write!(f, "failed({})", reason),
        }
    }
}

impl QuoteRequest {
    pub fn new(requester: AgentIdentity, item: String, quantity: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            requester,
            item,
            quantity,
            created_at: Utc::now(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.quantity == 0 {
            return Err(NegotiationError::Validation("Quantity must be greater than 0".to_string()));
        }
        if self.item.trim().is_empty() {
            return Err(NegotiationError::Validation("Item cannot be empty".to_string()));
        }
        if self.requester.role != Role::Buyer {
            return Err(NegotiationError::Validation("Quotes can only be requested by a buyer".to_string()));
        }
        Ok(())
    }
}

impl AgreementTerms {
    /// Hex-encoded SHA-256 over the canonical JSON encoding of the terms.
    pub fn hash(&self) -> Result<String> {
        let canonical = serde_json::to_vec(self)?;
        Ok(hex::encode(crypto::sha256(&canonical)))
    }
}

impl Agreement {
    /// Recomputes the hash from the terms and checks both signatures against
    /// the given identities.
    pub fn verify(&self, buyer: &AgentIdentity, supplier: &AgentIdentity) -> Result<()> {
        if self.terms.hash()? != self.hash {
            return Err(NegotiationError::Signature("agreement hash does not match terms".to_string()));
        }
        if self.buyer_signature.signer != buyer.did || self.terms.buyer != buyer.did {
            return Err(NegotiationError::Signature("buyer signature signer mismatch".to_string()));
        }
        if self.supplier_signature.signer != supplier.did || self.terms.supplier != supplier.did {
            return Err(NegotiationError::Signature("supplier signature signer mismatch".to_string()));
        }
        crypto::verify_signature(&buyer.verifying_key, self.hash.as_bytes(), &self.buyer_signature.signature)?;
        crypto::verify_signature(&supplier.verifying_key, self.hash.as_bytes(), &self.supplier_signature.signature)?;
        Ok(())
    }
}
