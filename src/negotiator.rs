//! Agreement negotiation between a buyer and a supplier.
//!
//! [`Negotiation`] is the pure state machine: it validates each input against
//! the current state and either moves to the next state or rejects the input
//! leaving the state untouched. [`Negotiator`] drives one negotiation instance
//! against the authorization oracle, the supplier, the proof engine and the
//! commitment ledger, emitting a [`ProtocolEvent`](crate::events::ProtocolEvent)
//! for every step.

use crate::{
    agent::{BuyerAgent, SupplierEndpoint},
    authorization::AuthorizationOracle,
    config::AppConfig,
    crypto,
    error::{NegotiationError, Result},
    events::EventLog,
    ledger::CommitmentLedger,
    model::*,
    proof::{InventoryProof, ProofEngine},
    reputation::ReputationPolicy,
    NegotiationId,
};
use backoff::{backoff::Backoff, ExponentialBackoffBuilder};
use chrono::Utc;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use uuid::Uuid;

const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

/// Inputs accepted by the negotiation state machine.
#[derive(Debug, Clone)]
pub enum Input {
    Connect(AgentIdentity),
    Disconnect,
    RequestQuote(QuoteRequest),
    Authorize(AuthorizationDecision),
    ProofReceived { proof: InventoryProof, verified: bool },
    Sign { agreement: Agreement, receipt: CommitReceipt },
    Fail(FailureReason),
}

impl Input {
    pub fn name(&self) -> &'static str {
        match self {
            Input::Connect(_) => "connect",
            Input::Disconnect => "disconnect",
            Input::RequestQuote(_) => "request_quote",
            Input::Authorize(_) => "authorize",
            Input::ProofReceived { .. } => "proof_received",
            Input::Sign { .. } => "sign",
            Input::Fail(FailureReason::Timeout) => "timeout",
            Input::Fail(FailureReason::Cancelled) => "cancel",
            Input::Fail(_) => "fail",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Negotiation {
    id: NegotiationId,
    supplier: AgentIdentity,
    state: NegotiationState,
    buyer: Option<AgentIdentity>,
    request: Option<QuoteRequest>,
    proof: Option<InventoryProof>,
    agreement: Option<Agreement>,
    receipt: Option<CommitReceipt>,
}

impl Negotiation {
    pub fn new(supplier: AgentIdentity) -> Self {
        Self {
            id: Uuid::new_v4(),
            supplier,
            state: NegotiationState::Disconnected,
            buyer: None,
            request: None,
            proof: None,
            agreement: None,
            receipt: None,
        }
    }

    pub fn id(&self) -> NegotiationId {
        self.id
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    pub fn supplier(&self) -> &AgentIdentity {
        &self.supplier
    }

    pub fn buyer(&self) -> Option<&AgentIdentity> {
        self.buyer.as_ref()
    }

    pub fn request(&self) -> Option<&QuoteRequest> {
        self.request.as_ref()
    }

    pub fn proof(&self) -> Option<&InventoryProof> {
        self.proof.as_ref()
    }

    pub fn agreement(&self) -> Option<&Agreement> {
        self.agreement.as_ref()
    }

    pub fn receipt(&self) -> Option<&CommitReceipt> {
        self.receipt.as_ref()
    }

    /// Applies `input` and returns the new state. Inputs that are not valid in
    /// the current state, or whose guard data is inconsistent, are rejected and
    /// leave the negotiation unchanged.
    pub fn apply(&mut self, input: Input) -> Result<NegotiationState> {
        use NegotiationState::*;

        let event = input.name();
        let next = match (self.state, input) {
            (Disconnected, Input::Connect(identity)) => {
                if identity.role != Role::Buyer {
                    return Err(NegotiationError::Validation("Only a buyer can open a negotiation".to_string()));
                }
                self.buyer = Some(identity);
                Connected
            }
            (Connected, Input::Disconnect) => {
                self.buyer = None;
                Disconnected
            }
            (Connected, Input::RequestQuote(request)) => {
                request.validate()?;
                if Some(&request.requester.did) != self.buyer.as_ref().map(|b| &b.did) {
                    return Err(NegotiationError::Validation("Quote requester is not the connected buyer".to_string()));
                }
                self.request = Some(request);
                Requested
            }
            (Requested, Input::Authorize(decision)) => {
                self.check_decision(&decision)?;
                if decision.authorized {
                    Authorized
                } else {
                    Failed(FailureReason::Unauthorized)
                }
            }
            (Authorized, Input::ProofReceived { proof, verified }) => {
                if verified {
                    self.proof = Some(proof);
                    Proofed
                } else {
                    Failed(FailureReason::ProofRejected)
                }
            }
            (Proofed, Input::Sign { agreement, receipt }) => {
                self.check_agreement(&agreement, &receipt)?;
                self.agreement = Some(agreement);
                self.receipt = Some(receipt);
                Signed
            }
            (state, Input::Disconnect) if !state.is_terminal() && state != Disconnected => {
                Failed(FailureReason::Cancelled)
            }
            (state, Input::Fail(reason)) if !state.is_terminal() => Failed(reason),
            (state, _) => {
                return Err(NegotiationError::InvalidTransition {
                    state: state.to_string(),
                    event,
                })
            }
        };

        self.state = next;
        Ok(next)
    }

    fn check_decision(&self, decision: &AuthorizationDecision) -> Result<()> {
        let (buyer, request) = match (&self.buyer, &self.request) {
            (Some(buyer), Some(request)) => (buyer, request),
            _ => return Err(NegotiationError::Validation("No pending quote request".to_string())),
        };
        if decision.buyer != buyer.did || decision.supplier != self.supplier.did || decision.item != request.item {
            return Err(NegotiationError::Validation(
                "Authorization decision is for a different negotiation".to_string(),
            ));
        }
        Ok(())
    }

    fn check_agreement(&self, agreement: &Agreement, receipt: &CommitReceipt) -> Result<()> {
        let (buyer, request, proof) = match (&self.buyer, &self.request, &self.proof) {
            (Some(buyer), Some(request), Some(proof)) => (buyer, request, proof),
            _ => return Err(NegotiationError::Validation("Negotiation has no verified proof".to_string())),
        };
        agreement.verify(buyer, &self.supplier)?;
        if agreement.terms.negotiation_id != self.id
            || agreement.terms.item != request.item
            || agreement.terms.quantity != request.quantity
            || agreement.terms.proof_ref != proof.reference()
        {
            return Err(NegotiationError::Validation("Agreement terms do not match the negotiation".to_string()));
        }
        if receipt.agreement_hash != agreement.hash {
            return Err(NegotiationError::Validation("Commit receipt is for a different agreement".to_string()));
        }
        Ok(())
    }
}

/// Cloneable cancellation signal for one negotiation instance.
#[derive(Clone)]
pub struct CancelHandle {
    sender: Arc<watch::Sender<bool>>,
}

impl Default for CancelHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelHandle {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn cancel(&self) {
        self.sender.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.sender.borrow()
    }

    pub async fn cancelled(&self) {
        let mut receiver = self.sender.subscribe();
        // The sender lives as long as `self`, so this only returns once cancelled.
        let _ = receiver.wait_for(|cancelled| *cancelled).await;
    }
}

#[derive(Debug, Clone)]
pub struct NegotiationSettings {
    pub authorization_timeout: Duration,
    pub proof_timeout: Duration,
    pub signature_timeout: Duration,
    pub commit_timeout: Duration,
    pub max_commit_attempts: u32,
    pub retry_base_delay: Duration,
    pub threshold_from_quantity: bool,
    pub reputation: ReputationPolicy,
}

impl Default for NegotiationSettings {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

impl NegotiationSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            authorization_timeout: config.negotiation.authorization_timeout(),
            proof_timeout: config.negotiation.proof_timeout(),
            signature_timeout: config.negotiation.signature_timeout(),
            commit_timeout: config.negotiation.commit_timeout(),
            max_commit_attempts: config.ledger.max_commit_attempts.max(1),
            retry_base_delay: Duration::from_millis(config.ledger.retry_base_delay_ms),
            threshold_from_quantity: config.negotiation.threshold_from_quantity,
            reputation: config.reputation.policy(),
        }
    }
}

/// Components shared by every negotiation instance.
#[derive(Clone)]
pub struct ProtocolServices {
    pub oracle: Arc<dyn AuthorizationOracle>,
    pub engine: Arc<dyn ProofEngine>,
    pub ledger: Arc<dyn CommitmentLedger>,
    pub events: EventLog,
    pub settings: NegotiationSettings,
}

/// Awaits `future` unless the step times out or the negotiation is cancelled.
async fn suspend<T, F>(cancel: &CancelHandle, step: &'static str, limit: Duration, future: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(NegotiationError::Cancelled),
        outcome = tokio::time::timeout(limit, future) => match outcome {
            Ok(result) => result,
            Err(_) => Err(NegotiationError::Timeout(step)),
        },
    }
}

/// Drives a single negotiation instance. Instances share nothing mutable
/// besides the services they are handed.
pub struct Negotiator {
    negotiation: Negotiation,
    buyer: Arc<BuyerAgent>,
    supplier: Arc<dyn SupplierEndpoint>,
    services: ProtocolServices,
    cancel: CancelHandle,
    threshold: Option<i64>,
    pending_agreement: Option<Agreement>,
}

impl Negotiator {
    pub fn new(buyer: Arc<BuyerAgent>, supplier: Arc<dyn SupplierEndpoint>, services: ProtocolServices) -> Self {
        Self {
            negotiation: Negotiation::new(supplier.identity().clone()),
            buyer,
            supplier,
            services,
            cancel: CancelHandle::new(),
            threshold: None,
            pending_agreement: None,
        }
    }

    pub fn id(&self) -> NegotiationId {
        self.negotiation.id()
    }

    pub fn state(&self) -> NegotiationState {
        self.negotiation.state()
    }

    pub fn negotiation(&self) -> &Negotiation {
        &self.negotiation
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Signed agreement whose ledger commit could not be confirmed. The caller
    /// must reconcile it against the ledger.
    pub fn pending_agreement(&self) -> Option<&Agreement> {
        self.pending_agreement.as_ref()
    }

    fn emit(&self, before: NegotiationState, message: impl Into<String>) {
        let message = message.into();
        tracing::info!(
            negotiation_id = %self.id(),
            state_before = %before,
            state_after = %self.state(),
            "{}",
            message
        );
        self.services.events.record(self.id(), before, self.state(), message);
    }

    fn note(&self, message: impl Into<String>) {
        self.emit(self.state(), message);
    }

    async fn transition(&mut self, input: Input, message: impl Into<String>) -> Result<NegotiationState> {
        let before = self.state();
        let after = self.negotiation.apply(input)?;
        self.emit(before, message);
        if let NegotiationState::Failed(reason) = after {
            self.report_failure(reason).await;
        }
        Ok(after)
    }

    /// Tells the supplier how the negotiation ended. Best effort; the
    /// negotiation is already terminal.
    async fn report_failure(&self, reason: FailureReason) {
        let request = match self.negotiation.request() {
            Some(request) => request,
            None => return,
        };
        let report = tokio::time::timeout(
            self.services.settings.signature_timeout,
            self.supplier.negotiation_failed(request, reason),
        )
        .await;
        match report {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(negotiation_id = %self.id(), error = %e, "Supplier rejected failure report"),
            Err(_) => tracing::warn!(negotiation_id = %self.id(), "Supplier did not acknowledge failure report"),
        }
    }

    /// Moves the negotiation to `Failed` when `err` is a terminal outcome and
    /// hands the error back to the caller.
    async fn abort(&mut self, err: NegotiationError) -> NegotiationError {
        if let Some(reason) = FailureReason::from_error(&err) {
            if !self.state().is_terminal() {
                let message = format!("Negotiation failed: {}", err);
                if let Err(e) = self.transition(Input::Fail(reason), message).await {
                    tracing::warn!(negotiation_id = %self.id(), error = %e, "Could not record failure");
                }
            }
        }
        err
    }

    async fn ensure_active(&mut self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(self.abort(NegotiationError::Cancelled).await);
        }
        Ok(())
    }

    fn expect_state(&self, expected: NegotiationState, event: &'static str) -> Result<()> {
        if self.state() != expected {
            return Err(NegotiationError::InvalidTransition {
                state: self.state().to_string(),
                event,
            });
        }
        Ok(())
    }

    fn buyer_identity(&self) -> Result<AgentIdentity> {
        self.negotiation.buyer().cloned().ok_or(NegotiationError::NotConnected)
    }

    pub async fn connect(&mut self) -> Result<AgentIdentity> {
        self.expect_state(NegotiationState::Disconnected, "connect")?;
        self.ensure_active().await?;
        self.note("Buyer agent connecting");

        let identity = self.buyer.connect().await?;
        let message = format!("Buyer authenticated with DID {}", identity.did);
        self.transition(Input::Connect(identity.clone()), message).await?;
        Ok(identity)
    }

    /// From `Connected` this returns to `Disconnected`; later it cancels, with
    /// the same ledger reconciliation as [`Negotiator::cancel`].
    pub async fn disconnect(&mut self) -> Result<NegotiationState> {
        if self.reconcile().await?.is_some() {
            return Ok(self.state());
        }
        self.transition(Input::Disconnect, "Buyer disconnected").await
    }

    pub async fn request_quote(&mut self, item: &str, quantity: u64) -> Result<QuoteRequest> {
        self.expect_state(NegotiationState::Connected, "request_quote")?;
        self.ensure_active().await?;

        let request = QuoteRequest::new(self.buyer_identity()?, item.to_string(), quantity);
        let message = format!("Buyer requests quote for {} units of {}", quantity, item);
        self.transition(Input::RequestQuote(request.clone()), message).await?;
        Ok(request)
    }

    pub async fn authorize(&mut self) -> Result<AuthorizationDecision> {
        self.expect_state(NegotiationState::Requested, "authorize")?;
        self.ensure_active().await?;
        self.note("Querying authorization registry");

        let buyer = self.buyer_identity()?.did;
        let supplier = self.negotiation.supplier().did.clone();
        let item = self.negotiation.request().map(|r| r.item.clone()).unwrap_or_default();

        let outcome = suspend(
            &self.cancel,
            "authorization",
            self.services.settings.authorization_timeout,
            self.services.oracle.authorize(&buyer, &supplier, &item),
        )
        .await;
        let decision = match outcome {
            Ok(decision) => decision,
            Err(e) => return Err(self.abort(e).await),
        };

        let message = if decision.authorized {
            "Supplier authorized to provide quotes".to_string()
        } else {
            format!("Supplier {} is not authorized to quote {}", supplier, item)
        };
        self.transition(Input::Authorize(decision.clone()), message).await?;

        if decision.authorized {
            Ok(decision)
        } else {
            Err(NegotiationError::Unauthorized)
        }
    }

    /// Asks the supplier for an inventory proof at `threshold`. Does not change
    /// state: the proof still has to be received and verified.
    pub async fn request_proof(&mut self, threshold: i64) -> Result<InventoryProof> {
        self.expect_state(NegotiationState::Authorized, "request_proof")?;
        self.ensure_active().await?;
        if threshold <= 0 {
            return Err(NegotiationError::InvalidThreshold(threshold));
        }
        self.note(format!("Requesting ZKP for inventory proof (threshold {} units)", threshold));

        let request = self
            .negotiation
            .request()
            .cloned()
            .ok_or_else(|| NegotiationError::Validation("No pending quote request".to_string()))?;
        let outcome = suspend(
            &self.cancel,
            "inventory proof",
            self.services.settings.proof_timeout,
            self.supplier.request_proof(&request, threshold),
        )
        .await;
        let proof = match outcome {
            Ok(proof) => proof,
            Err(e) => return Err(self.abort(e).await),
        };

        self.threshold = Some(threshold);
        Ok(proof)
    }

    pub async fn receive_proof(&mut self, proof: InventoryProof) -> Result<()> {
        self.expect_state(NegotiationState::Authorized, "proof_received")?;
        self.ensure_active().await?;
        let threshold = self
            .threshold
            .ok_or_else(|| NegotiationError::Validation("No inventory proof was requested".to_string()))?;

        let engine = Arc::clone(&self.services.engine);
        let candidate = proof.clone();
        let outcome = suspend(
            &self.cancel,
            "proof verification",
            self.services.settings.proof_timeout,
            async move {
                tokio::task::spawn_blocking(move || engine.verify(&candidate, threshold))
                    .await
                    .map_err(|e| NegotiationError::Internal(format!("Verification task failed: {}", e)))
            },
        )
        .await;
        let verified = match outcome {
            Ok(verified) => verified,
            Err(e) => return Err(self.abort(e).await),
        };

        if verified {
            self.note(format!("ZKP received: supplier has inventory >= {} units", threshold));
            self.transition(
                Input::ProofReceived { proof, verified },
                "Proof verified without revealing exact inventory",
            )
            .await?;
            Ok(())
        } else {
            self.transition(Input::ProofReceived { proof, verified }, "Inventory proof rejected")
                .await?;
            Err(NegotiationError::ProofRejected)
        }
    }

    pub async fn sign(&mut self) -> Result<CommitReceipt> {
        self.expect_state(NegotiationState::Proofed, "sign")?;
        if self.cancel.is_cancelled() {
            if let Some(receipt) = self.reconcile().await? {
                return Ok(receipt);
            }
            return Err(self.abort(NegotiationError::Cancelled).await);
        }

        let agreement = match self.pending_agreement.clone() {
            Some(agreement) => agreement,
            None => {
                let agreement = self.build_agreement().await?;
                // A fresh agreement has not reached the ledger, so it can still be dropped.
                if self.cancel.is_cancelled() {
                    self.pending_agreement = None;
                    return Err(self.abort(NegotiationError::Cancelled).await);
                }
                agreement
            }
        };
        let receipt = match self.commit_with_retry(&agreement).await {
            Ok(receipt) => receipt,
            Err(err) => {
                self.note(format!("Ledger commit failed, agreement {} left uncommitted: {}", agreement.hash, err));
                return Err(err);
            }
        };

        self.complete(agreement, receipt.clone()).await?;
        Ok(receipt)
    }

    async fn complete(&mut self, agreement: Agreement, receipt: CommitReceipt) -> Result<()> {
        let deltas = self.services.settings.reputation.deltas(&agreement.terms);
        let supplier = agreement.terms.supplier.clone();
        let message = format!("Agreement signed and hash {} committed to ledger", agreement.hash);
        self.transition(Input::Sign { agreement, receipt }, message).await?;
        self.pending_agreement = None;

        for delta in deltas {
            let role = if delta.agent == supplier { "Supplier" } else { "Buyer" };
            self.note(format!("{} reputation updated {:+}", role, delta.delta));
        }
        Ok(())
    }

    /// Settles a signed agreement whose commit outcome is unknown by looking
    /// it up on the ledger. A landed agreement completes the negotiation and
    /// its receipt is returned; one confirmed absent is discarded.
    async fn reconcile(&mut self) -> Result<Option<CommitReceipt>> {
        let agreement = match self.pending_agreement.clone() {
            Some(agreement) => agreement,
            None => return Ok(None),
        };

        let lookup = tokio::time::timeout(
            self.services.settings.commit_timeout,
            self.services.ledger.entry(&agreement.hash),
        )
        .await;
        let entry = match lookup {
            Ok(Ok(entry)) => entry,
            Ok(Err(err)) if err.is_retryable() => return Err(err),
            Ok(Err(err)) => return Err(NegotiationError::LedgerUnavailable(err.to_string())),
            Err(_) => return Err(NegotiationError::LedgerUnavailable("lookup timed out".to_string())),
        };

        match entry {
            Some(entry) => {
                let receipt = entry.receipt();
                self.note(format!("Agreement {} found on ledger", agreement.hash));
                self.complete(agreement, receipt.clone()).await?;
                Ok(Some(receipt))
            }
            None => {
                tracing::info!(negotiation_id = %self.id(), hash = %agreement.hash, "Pending agreement not on ledger, discarding");
                self.pending_agreement = None;
                Ok(None)
            }
        }
    }

    async fn build_agreement(&mut self) -> Result<Agreement> {
        self.note("Preparing agreement");

        let buyer = self.buyer_identity()?;
        let supplier = self.negotiation.supplier().clone();
        let (item, quantity) = self
            .negotiation
            .request()
            .map(|r| (r.item.clone(), r.quantity))
            .ok_or_else(|| NegotiationError::Validation("No pending quote request".to_string()))?;
        let proof = self
            .negotiation
            .proof()
            .ok_or_else(|| NegotiationError::Validation("No verified proof".to_string()))?;

        let terms = AgreementTerms {
            id: Uuid::new_v4(),
            negotiation_id: self.id(),
            buyer: buyer.did.clone(),
            supplier: supplier.did.clone(),
            item,
            quantity,
            threshold: proof.threshold,
            proof_ref: proof.reference(),
            created_at: Utc::now(),
        };
        let hash = terms.hash()?;
        let buyer_signature = self.buyer.sign(&buyer, &hash);

        let outcome = suspend(
            &self.cancel,
            "countersignature",
            self.services.settings.signature_timeout,
            self.supplier.countersign(&terms, &hash, &buyer, &buyer_signature),
        )
        .await;
        let supplier_signature = match outcome {
            Ok(signature) => signature,
            Err(e) => return Err(self.abort(e).await),
        };

        let checked = crypto::verify_signature(&supplier.verifying_key, hash.as_bytes(), &supplier_signature.signature)
            .and_then(|_| {
                if supplier_signature.signer == supplier.did {
                    Ok(())
                } else {
                    Err(NegotiationError::Signature("Countersignature from unexpected signer".to_string()))
                }
            });
        if let Err(e) = checked {
            return Err(self.abort(e).await);
        }

        let agreement = Agreement {
            terms,
            hash,
            buyer_signature,
            supplier_signature,
        };
        self.pending_agreement = Some(agreement.clone());
        Ok(agreement)
    }

    /// Commits with exponential backoff. Safe to retry because the ledger
    /// deduplicates by agreement hash; a duplicate means an earlier attempt
    /// landed.
    async fn commit_with_retry(&self, agreement: &Agreement) -> Result<CommitReceipt> {
        let settings = &self.services.settings;
        let deltas = settings.reputation.deltas(&agreement.terms);
        let mut schedule = ExponentialBackoffBuilder::new()
            .with_initial_interval(settings.retry_base_delay)
            .with_multiplier(2.0)
            .with_randomization_factor(0.0)
            .with_max_interval(MAX_RETRY_DELAY)
            .with_max_elapsed_time(None)
            .build();
        let mut attempt = 1;

        loop {
            let outcome = match tokio::time::timeout(
                settings.commit_timeout,
                self.services.ledger.commit(agreement, &deltas),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(NegotiationError::LedgerUnavailable("commit timed out".to_string())),
            };

            match outcome {
                Ok(receipt) => return Ok(receipt),
                Err(NegotiationError::DuplicateCommit(hash)) => {
                    tracing::info!(negotiation_id = %self.id(), hash = %hash, "Agreement already on ledger");
                    return match self.services.ledger.entry(&hash).await? {
                        Some(entry) => Ok(entry.receipt()),
                        None => Err(NegotiationError::DuplicateCommit(hash)),
                    };
                }
                Err(err) if err.is_retryable() && attempt < settings.max_commit_attempts => {
                    let delay = schedule.next_backoff().unwrap_or(MAX_RETRY_DELAY);
                    tracing::warn!(
                        negotiation_id = %self.id(),
                        attempt,
                        error = %err,
                        "Ledger commit failed, retrying in {:?}",
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => {
                    tracing::error!(negotiation_id = %self.id(), attempt, error = %err, "Ledger commit abandoned");
                    return Err(err);
                }
            }
        }
    }

    /// Cancels the negotiation unless it already reached a terminal state.
    ///
    /// A signed agreement whose commit was never confirmed is settled against
    /// the ledger first: if it landed the negotiation completes as `Signed`,
    /// and if the ledger cannot be reached the cancel is refused with
    /// `LedgerUnavailable` so the caller can try again.
    pub async fn cancel(&mut self) -> Result<NegotiationState> {
        if self.state().is_terminal() {
            return Err(NegotiationError::InvalidTransition {
                state: self.state().to_string(),
                event: "cancel",
            });
        }
        if self.reconcile().await?.is_some() {
            return Ok(self.state());
        }
        self.cancel.cancel();
        self.transition(Input::Fail(FailureReason::Cancelled), "Negotiation cancelled")
            .await
    }

    /// Runs the whole protocol: connect, quote, authorization, proof and
    /// signed commitment. The threshold defaults to the requested quantity.
    pub async fn run(&mut self, item: &str, quantity: u64, threshold: Option<i64>) -> Result<CommitReceipt> {
        let threshold = match threshold {
            Some(threshold) => threshold,
            None if self.services.settings.threshold_from_quantity => i64::try_from(quantity)
                .map_err(|_| NegotiationError::Validation("Quantity exceeds threshold range".to_string()))?,
            None => 1,
        };

        self.connect().await?;
        self.request_quote(item, quantity).await?;
        self.authorize().await?;
        let proof = self.request_proof(threshold).await?;
        self.receive_proof(proof).await?;
        self.sign().await
    }
}
