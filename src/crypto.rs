//! Hashing, agent signing keys and hex serde helpers shared across the protocol.

use crate::{
    error::{NegotiationError, Result},
    model::{AgentIdentity, AgreementSignature, Did, Role},
};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::RngCore;
use sha2::{Digest, Sha256};

pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// An agent's ed25519 signing key. Never leaves the owning agent.
pub struct AgentKeys {
    signing_key: SigningKey,
}

impl AgentKeys {
    pub fn generate() -> Self {
        let mut seed = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut seed);
        Self::from_seed(seed)
    }

    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(&seed),
        }
    }

    pub fn verifying_key(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    pub fn identity(&self, did: Did, role: Role) -> AgentIdentity {
        AgentIdentity {
            did,
            role,
            verifying_key: self.verifying_key(),
        }
    }

    pub fn sign(&self, signer: &Did, message: &[u8]) -> AgreementSignature {
        let signature = self.signing_key.sign(message);
        AgreementSignature {
            signer: signer.clone(),
            signature: signature.to_bytes().to_vec(),
        }
    }
}

pub fn verify_signature(verifying_key: &[u8; 32], message: &[u8], signature: &[u8]) -> Result<()> {
    let key = VerifyingKey::from_bytes(verifying_key)?;
    let signature = Signature::from_slice(signature)?;
    key.verify(message, &signature)
        .map_err(|e| NegotiationError::Signature(format!("Invalid signature: {}", e)))
}

pub mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}

pub mod hex_array {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<[u8; 32], D::Error> {
        let s = String::deserialize(deserializer)?;
        let mut out = [0u8; 32];
        hex::decode_to_slice(s, &mut out).map_err(serde::de::Error::custom)?;
        Ok(out)
    }
}
