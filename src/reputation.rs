use crate::model::{AgreementTerms, ReputationDelta};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustLevel {
    Untrusted,     // < 0
    Neutral,       // 0-49
    Trusted,       // 50-89
    HighlyTrusted, // 90+
}

impl From<i64> for TrustLevel {
    fn from(score: i64) -> Self {
        match score {
            i64::MIN..=-1 => TrustLevel::Untrusted,
            0..=49 => TrustLevel::Neutral,
            50..=89 => TrustLevel::Trusted,
            _ => TrustLevel::HighlyTrusted,
        }
    }
}

/// Reputation rewards applied when an agreement is committed. Deltas are
/// recorded by the ledger under the agreement hash, so a retried commit never
/// counts twice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReputationPolicy {
    pub supplier_reward: i64,
    pub buyer_reward: i64,
}

impl Default for ReputationPolicy {
    fn default() -> Self {
        Self {
            supplier_reward: 10,
            buyer_reward: 0,
        }
    }
}

impl ReputationPolicy {
    pub fn deltas(&self, terms: &AgreementTerms) -> Vec<ReputationDelta> {
        let mut deltas = Vec::with_capacity(2);
        if self.supplier_reward != 0 {
            deltas.push(ReputationDelta {
                agent: terms.supplier.clone(),
                delta: self.supplier_reward,
            });
        }
        if self.buyer_reward != 0 {
            deltas.push(ReputationDelta {
                agent: terms.buyer.clone(),
                delta: self.buyer_reward,
            });
        }
        deltas
    }
}
