//! # BESACP - Blockchain-Enhanced Secure Agent-to-Agent Communication Protocol
//!
//! Verifiable negotiation between a buyer agent and a supplier agent.
//!
//! ## Architecture
//!
//! - **Identity**: Ed25519-keyed DIDs obtained from an identity provider
//! - **Authorization Oracle**: registry deciding whether a supplier may quote an item to a buyer
//! - **Proof Engine**: zero-knowledge proof that inventory meets a threshold, over Ristretto
//! - **Negotiator**: per-negotiation state machine with timeouts and cancellation
//! - **Commitment Ledger**: deduplicated, append-only agreement hashes plus reputation (memory or SQLite)
//! - **Event Log**: ordered protocol events for display sinks

pub mod agent;
pub mod authorization;
pub mod config;
pub mod crypto;
pub mod database;
pub mod error;
pub mod events;
pub mod identity;
pub mod ledger;
pub mod model;
pub mod negotiator;
pub mod proof;
pub mod reputation;

pub use agent::{BuyerAgent, SupplierAgent, SupplierEndpoint};
pub use authorization::{AccessScope, AuthorizationOracle, RegistryOracle};
pub use config::AppConfig;
pub use crypto::AgentKeys;
pub use database::SqliteLedger;
pub use error::{NegotiationError, Result};
pub use events::{EventLog, ProtocolEvent};
pub use identity::{IdentityProvider, StaticIdentityProvider};
pub use ledger::{CommitmentLedger, InMemoryLedger, LedgerEntry};
pub use model::{
    AgentIdentity, Agreement, AgreementTerms, CommitReceipt, Did, FailureReason, NegotiationState, Role,
};
pub use negotiator::{CancelHandle, Negotiation, NegotiationSettings, Negotiator, ProtocolServices};
pub use proof::{InventoryProof, ProofEngine, RangeProofEngine};
pub use reputation::{ReputationPolicy, TrustLevel};

pub type NegotiationId = uuid::Uuid;
