use thiserror::Error;
use crate::Did;

pub type Result<T> = std::result::Result<T, NegotiationError>;

#[derive(Error, Debug)]
pub enum NegotiationError {
    #[error("Agent is not connected to an identity provider")]
    NotConnected,

    #[error("DID is not registered: {0}")]
    NotRegistered(Did),

    #[error("Supplier is not authorized to quote this item")]
    Unauthorized,

    #[error("Threshold must be positive, got {0}")]
    InvalidThreshold(i64),

    #[error("Secret quantity is below the requested threshold")]
    InsufficientQuantity,

    #[error("Inventory proof rejected")]
    ProofRejected,

    #[error("Commitment ledger unavailable: {0}")]
    LedgerUnavailable(String),

    #[error("Agreement already committed: {0}")]
    DuplicateCommit(String),

    #[error("Timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("Negotiation cancelled")]
    Cancelled,

    #[error("Event '{event}' is not valid in state {state}")]
    InvalidTransition { state: String, event: &'static str },

    #[error("Signature error: {0}")]
    Signature(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl NegotiationError {
    /// Transient faults the caller may retry. Only ledger availability qualifies;
    /// authorization and proof outcomes are final for a negotiation.
    pub fn is_retryable(&self) -> bool {
        matches!(self, NegotiationError::LedgerUnavailable(_))
    }

    pub fn is_benign(&self) -> bool {
        matches!(self, NegotiationError::DuplicateCommit(_))
    }
}

impl From<serde_json::Error> for NegotiationError {
    fn from(err: serde_json::Error) -> Self {
        NegotiationError::Serialization(err.to_string())
    }
}

impl From<hex::FromHexError> for NegotiationError {
    fn from(err: hex::FromHexError) -> Self {
        NegotiationError::Serialization(err.to_string())
    }
}

impl From<ed25519_dalek::SignatureError> for NegotiationError {
    fn from(err: ed25519_dalek::SignatureError) -> Self {
        NegotiationError::Signature(err.to_string())
    }
}

impl From<toml::de::Error> for NegotiationError {
    fn from(err: toml::de::Error) -> Self {
        NegotiationError::Config(format!("Failed to parse config file: {}", err))
    }
}

impl From<std::io::Error> for NegotiationError {
    fn from(err: std::io::Error) -> Self {
        NegotiationError::Io(err.to_string())
    }
}
