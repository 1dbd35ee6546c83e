use crate::{
    error::{NegotiationError, Result},
    model::{Agreement, CommitReceipt, Did, ReputationDelta, ReputationScore},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// A ledger entry references its agreement by hash rather than holding a copy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub sequence: u64,
    pub agreement_hash: String,
    pub buyer: Did,
    pub supplier: Did,
    pub item: String,
    pub quantity: u64,
    pub proof_ref: String,
    pub committed_at: DateTime<Utc>,
}

impl LedgerEntry {
    pub fn receipt(&self) -> CommitReceipt {
        CommitReceipt {
            agreement_hash: self.agreement_hash.clone(),
            sequence: self.sequence,
            committed_at: self.committed_at,
        }
    }
}

/// Append-only store of agreement hashes and reputation deltas.
///
/// `commit` is all-or-nothing and deduplicated by agreement hash: a second
/// commit of the same hash fails with `DuplicateCommit` and changes nothing.
#[async_trait]
pub trait CommitmentLedger: Send + Sync {
    async fn commit(&self, agreement: &Agreement, reputation: &[ReputationDelta]) -> Result<CommitReceipt>;

    async fn entry(&self, agreement_hash: &str) -> Result<Option<LedgerEntry>>;

    async fn entries(&self) -> Result<Vec<LedgerEntry>>;

    async fn reputation(&self, agent: &Did) -> Result<ReputationScore>;

    async fn contains(&self, agreement_hash: &str) -> Result<bool> {
        Ok(self.entry(agreement_hash).await?.is_some())
    }

    async fn len(&self) -> Result<u64> {
        Ok(self.entries().await?.len() as u64)
    }
}

pub(crate) fn check_agreement_hash(agreement: &Agreement) -> Result<()> {
    if agreement.terms.hash()? != agreement.hash {
        return Err(NegotiationError::Validation(
            "Agreement hash does not match its terms".to_string(),
        ));
    }
    Ok(())
}

#[derive(Default)]
struct LedgerState {
    entries: Vec<LedgerEntry>,
    index: HashMap<String, usize>,
    applied: HashSet<(String, Did)>,
    scores: HashMap<Did, i64>,
}

#[derive(Default)]
pub struct InMemoryLedger {
    state: Mutex<LedgerState>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CommitmentLedger for InMemoryLedger {
    async fn commit(&self, agreement: &Agreement, reputation: &[ReputationDelta]) -> Result<CommitReceipt> {
        check_agreement_hash(agreement)?;

        let mut state = self.state.lock();
        if state.index.contains_key(&agreement.hash) {
            return Err(NegotiationError::DuplicateCommit(agreement.hash.clone()));
        }

        let entry = LedgerEntry {
            sequence: state.entries.len() as u64 + 1,
            agreement_hash: agreement.hash.clone(),
            buyer: agreement.terms.buyer.clone(),
            supplier: agreement.terms.supplier.clone(),
            item: agreement.terms.item.clone(),
            quantity: agreement.terms.quantity,
            proof_ref: agreement.terms.proof_ref.clone(),
            committed_at: Utc::now(),
        };
        let receipt = entry.receipt();

        for delta in reputation {
            if state.applied.insert((agreement.hash.clone(), delta.agent.clone())) {
                *state.scores.entry(delta.agent.clone()).or_insert(0) += delta.delta;
            }
        }
        let position = state.entries.len();
        state.index.insert(agreement.hash.clone(), position);
        state.entries.push(entry);

        tracing::info!(hash = %receipt.agreement_hash, sequence = receipt.sequence, "Agreement committed to ledger");
        Ok(receipt)
    }

    async fn entry(&self, agreement_hash: &str) -> Result<Option<LedgerEntry>> {
        let state = self.state.lock();
        Ok(state.index.get(agreement_hash).map(|&i| state.entries[i].clone()))
    }

    async fn entries(&self) -> Result<Vec<LedgerEntry>> {
        Ok(self.state.lock().entries.clone())
    }

    async fn reputation(&self, agent: &Did) -> Result<ReputationScore> {
        let score = self.state.lock().scores.get(agent).copied().unwrap_or(0);
        Ok(ReputationScore {
            agent: agent.clone(),
            score,
        })
    }
}
