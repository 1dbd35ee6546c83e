//! Zero-knowledge inventory proofs.
//!
//! The supplier commits to its secret quantity `q` with a Pedersen commitment
//! `C = q·G + r·H` over the Ristretto group and proves `q >= T` by showing that
//! `C - T·G` opens to a 64-bit value. The excess `q - T` is decomposed into bit
//! commitments `C_i = b_i·G + r_i·H` with `Σ 2^i·r_i = r`, and each bit carries
//! a non-interactive OR-proof that it commits to 0 or 1. Challenges are derived
//! with SHA-512 over a transcript binding the threshold, `C` and every `C_i`.

use crate::{
    crypto,
    error::{NegotiationError, Result},
};
use curve25519_dalek::{
    constants::RISTRETTO_BASEPOINT_POINT,
    ristretto::{CompressedRistretto, RistrettoPoint},
    scalar::Scalar,
    traits::Identity,
};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha512};

pub const PROOF_VERSION: u16 = 1;
pub const PROOF_SCHEME: &str = "ristretto-bitwise-range";

const RANGE_BITS: usize = 64;
// bit commitment, e0, s0, e1, s1
const BIT_PROOF_LEN: usize = 32 * 5;
const TRANSCRIPT_DOMAIN: &[u8] = b"besacp/inventory-range/v1";
const GENERATOR_H_SEED: &[u8] = b"besacp/pedersen-generator-h";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryProof {
    pub version: u16,
    pub scheme: String,
    pub threshold: i64,
    #[serde(with = "crypto::hex_bytes")]
    pub commitment: Vec<u8>,
    #[serde(with = "crypto::hex_bytes")]
    pub proof: Vec<u8>,
}

impl InventoryProof {
    /// Stable reference to this proof, used by agreements instead of a copy.
    pub fn reference(&self) -> String {
        let mut data = Vec::with_capacity(self.commitment.len() + self.proof.len());
        data.extend_from_slice(&self.commitment);
        data.extend_from_slice(&self.proof);
        hex::encode(crypto::sha256(&data))
    }
}

pub trait ProofEngine: Send + Sync {
    /// Proves `secret_quantity >= threshold` without revealing the quantity.
    fn prove(&self, secret_quantity: u64, threshold: i64) -> Result<InventoryProof>;

    /// Accepts only proofs generated for exactly `threshold`.
    fn verify(&self, proof: &InventoryProof, threshold: i64) -> bool;
}

#[derive(Clone)]
pub struct RangeProofEngine {
    g: RistrettoPoint,
    h: RistrettoPoint,
}

impl Default for RangeProofEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl RangeProofEngine {
    pub fn new() -> Self {
        let mut wide = [0u8; 64];
        wide.copy_from_slice(&Sha512::digest(GENERATOR_H_SEED));
        Self {
            g: RISTRETTO_BASEPOINT_POINT,
            h: RistrettoPoint::from_uniform_bytes(&wide),
        }
    }

    fn check(&self, proof: &InventoryProof, threshold: i64) -> std::result::Result<(), &'static str> {
        if threshold <= 0 {
            return Err("non-positive threshold");
        }
        if proof.version != PROOF_VERSION || proof.scheme != PROOF_SCHEME {
            return Err("unsupported proof version or scheme");
        }
        if proof.threshold != threshold {
            return Err("proof was generated for a different threshold");
        }
        if proof.commitment.len() != 32 || proof.proof.len() != RANGE_BITS * BIT_PROOF_LEN {
            return Err("malformed proof length");
        }

        let commitment = CompressedRistretto(read32(&proof.commitment));
        let commitment_point = commitment.decompress().ok_or("invalid commitment point")?;

        let mut bits = Vec::with_capacity(RANGE_BITS);
        for chunk in proof.proof.chunks_exact(BIT_PROOF_LEN) {
            bits.push(BitProof::decode(chunk).ok_or("malformed bit proof")?);
        }

        let transcript = Transcript::new(threshold, &commitment, bits.iter().map(|b| &b.commitment));

        let mut weighted_sum = RistrettoPoint::identity();
        let mut weight = Scalar::ONE;
        let two = Scalar::from(2u64);
        for (index, bit) in bits.iter().enumerate() {
            let point = bit.commitment.decompress().ok_or("invalid bit commitment")?;
            let a0 = bit.s0 * self.h - bit.e0 * point;
            let a1 = bit.s1 * self.h - bit.e1 * (point - self.g);
            let challenge = transcript.bit_challenge(index, &bit.commitment, &a0.compress(), &a1.compress());
            if bit.e0 + bit.e1 != challenge {
                return Err("bit proof challenge mismatch");
            }
            weighted_sum += weight * point;
            weight *= two;
        }

        if weighted_sum != commitment_point - Scalar::from(threshold as u64) * self.g {
            return Err("bit commitments do not open the thresholded commitment");
        }
        Ok(())
    }
}

impl ProofEngine for RangeProofEngine {
    fn prove(&self, secret_quantity: u64, threshold: i64) -> Result<InventoryProof> {
        if threshold <= 0 {
            return Err(NegotiationError::InvalidThreshold(threshold));
        }
        let threshold_units = threshold as u64;
        if secret_quantity < threshold_units {
            return Err(NegotiationError::InsufficientQuantity);
        }
        let excess = secret_quantity - threshold_units;

        let two = Scalar::from(2u64);
        let mut weight = Scalar::ONE;
        let mut blinding = Scalar::ZERO;
        let mut openings = Vec::with_capacity(RANGE_BITS);
        for index in 0..RANGE_BITS {
            let bit = (excess >> index) & 1;
            let r = random_scalar();
            let point = Scalar::from(bit) * self.g + r * self.h;
            openings.push((bit, r, point, point.compress()));
            blinding += weight * r;
            weight *= two;
        }

        let commitment = (Scalar::from(secret_quantity) * self.g + blinding * self.h).compress();
        let transcript = Transcript::new(threshold, &commitment, openings.iter().map(|o| &o.3));

        let mut encoded = Vec::with_capacity(RANGE_BITS * BIT_PROOF_LEN);
        for (index, (bit, r, point, compressed)) in openings.into_iter().enumerate() {
            let k = random_scalar();
            let e_sim = random_scalar();
            let s_sim = random_scalar();
            let (a0, a1) = if bit == 0 {
                (k * self.h, s_sim * self.h - e_sim * (point - self.g))
            } else {
                (s_sim * self.h - e_sim * point, k * self.h)
            };
            let challenge = transcript.bit_challenge(index, &compressed, &a0.compress(), &a1.compress());
            let e_real = challenge - e_sim;
            let s_real = k + e_real * r;
            let proof = if bit == 0 {
                BitProof { commitment: compressed, e0: e_real, s0: s_real, e1: e_sim, s1: s_sim }
            } else {
                BitProof { commitment: compressed, e0: e_sim, s0: s_sim, e1: e_real, s1: s_real }
            };
            proof.encode_into(&mut encoded);
        }

        Ok(InventoryProof {
            version: PROOF_VERSION,
            scheme: PROOF_SCHEME.to_string(),
            threshold,
            commitment: commitment.as_bytes().to_vec(),
            proof: encoded,
        })
    }

    fn verify(&self, proof: &InventoryProof, threshold: i64) -> bool {
        match self.check(proof, threshold) {
            Ok(()) => true,
            Err(reason) => {
                tracing::debug!(threshold, reason, "Inventory proof rejected");
                false
            }
        }
    }
}

struct BitProof {
    commitment: CompressedRistretto,
    e0: Scalar,
    s0: Scalar,
    e1: Scalar,
    s1: Scalar,
}

impl BitProof {
    fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self.commitment.as_bytes());
        for scalar in [&self.e0, &self.s0, &self.e1, &self.s1] {
            out.extend_from_slice(scalar.as_bytes());
        }
    }

    fn decode(chunk: &[u8]) -> Option<Self> {
        let scalar = |offset: usize| -> Option<Scalar> {
            Scalar::from_canonical_bytes(read32(&chunk[offset..offset + 32])).into()
        };
        Some(Self {
            commitment: CompressedRistretto(read32(&chunk[0..32])),
            e0: scalar(32)?,
            s0: scalar(64)?,
            e1: scalar(96)?,
            s1: scalar(128)?,
        })
    }
}

struct Transcript {
    base: Sha512,
}

impl Transcript {
    fn new<'a>(
        threshold: i64,
        commitment: &CompressedRistretto,
        bit_commitments: impl Iterator<Item = &'a CompressedRistretto>,
    ) -> Self {
        let mut base = Sha512::new();
        base.update(TRANSCRIPT_DOMAIN);
        base.update(threshold.to_le_bytes());
        base.update(commitment.as_bytes());
        for bit in bit_commitments {
            base.update(bit.as_bytes());
        }
        Self { base }
    }

    fn bit_challenge(
        &self,
        index: usize,
        commitment: &CompressedRistretto,
        a0: &CompressedRistretto,
        a1: &CompressedRistretto,
    ) -> Scalar {
        let mut hasher = self.base.clone();
        hasher.update((index as u64).to_le_bytes());
        hasher.update(commitment.as_bytes());
        hasher.update(a0.as_bytes());
        hasher.update(a1.as_bytes());
        let mut wide = [0u8; 64];
        wide.copy_from_slice(&hasher.finalize());
        Scalar::from_bytes_mod_order_wide(&wide)
    }
}

fn random_scalar() -> Scalar {
    let mut wide = [0u8; 64];
    rand::thread_rng().fill_bytes(&mut wide);
    Scalar::from_bytes_mod_order_wide(&wide)
}

fn read32(bytes: &[u8]) -> [u8; 32] {
    let mut out = [0u8; 32];
    out.copy_from_slice(bytes);
    out
}
