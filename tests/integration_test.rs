use async_trait::async_trait;
use besacp::{
    agent::{BuyerAgent, SupplierAgent, SupplierEndpoint},
    authorization::{AccessScope, AuthorizationOracle, RegistryOracle},
    crypto::AgentKeys,
    database::SqliteLedger,
    error::{NegotiationError, Result},
    events::EventLog,
    identity::StaticIdentityProvider,
    ledger::{CommitmentLedger, InMemoryLedger, LedgerEntry},
    model::*,
    negotiator::{NegotiationSettings, Negotiator, ProtocolServices},
    proof::{InventoryProof, RangeProofEngine},
};
use parking_lot::Mutex;
use std::sync::Arc;
use tempfile::NamedTempFile;
use tokio::time::{sleep, Duration};

struct Harness {
    oracle: Arc<RegistryOracle>,
    events: EventLog,
    buyer: Arc<BuyerAgent>,
    buyer_identity: AgentIdentity,
    supplier: Arc<SupplierAgent>,
}

impl Harness {
    fn new() -> Self {
        let buyer_keys = AgentKeys::generate();
        let buyer_identity = buyer_keys.identity(Did::new("did:example:buyer1").unwrap(), Role::Buyer);
        let buyer = Arc::new(BuyerAgent::new(
            buyer_keys,
            Arc::new(StaticIdentityProvider::connected(buyer_identity.clone())),
        ));
        let supplier = Arc::new(
            SupplierAgent::new(
                AgentKeys::generate(),
                Did::new("did:example:supplier1").unwrap(),
                Arc::new(RangeProofEngine::new()),
            )
            .with_stock("widget", 150),
        );

        let oracle = Arc::new(RegistryOracle::new());
        oracle.register(buyer_identity.did.clone());
        oracle.register(supplier.identity().did.clone());
        oracle
            .allow(&supplier.identity().did, "widget", AccessScope::AnyBuyer)
            .unwrap();

        Self {
            oracle,
            events: EventLog::new(),
            buyer,
            buyer_identity,
            supplier,
        }
    }

    fn supplier_did(&self) -> Did {
        self.supplier.identity().did.clone()
    }

    fn services(&self, ledger: Arc<dyn CommitmentLedger>) -> ProtocolServices {
        self.services_with(self.oracle.clone(), ledger)
    }

    fn services_with(&self, oracle: Arc<dyn AuthorizationOracle>, ledger: Arc<dyn CommitmentLedger>) -> ProtocolServices {
        let mut settings = NegotiationSettings::default();
        settings.retry_base_delay = Duration::from_millis(1);
        ProtocolServices {
            oracle,
            engine: Arc::new(RangeProofEngine::new()),
            ledger,
            events: self.events.clone(),
            settings,
        }
    }

    fn negotiator(&self, ledger: Arc<dyn CommitmentLedger>) -> Negotiator {
        Negotiator::new(self.buyer.clone(), self.supplier.clone(), self.services(ledger))
    }
}

/// Oracle that answers after a delay.
struct SlowOracle {
    inner: Arc<RegistryOracle>,
    delay: Duration,
}

#[async_trait]
impl AuthorizationOracle for SlowOracle {
    async fn authorize(&self, buyer: &Did, supplier: &Did, item: &str) -> Result<AuthorizationDecision> {
        sleep(self.delay).await;
        self.inner.authorize(buyer, supplier, item).await
    }
}

#[derive(Clone, Copy, PartialEq)]
enum Stall {
    Proof,
    Countersign,
}

/// Supplier that stalls at one step.
struct StallingSupplier {
    inner: Arc<SupplierAgent>,
    stall: Stall,
}

#[async_trait]
impl SupplierEndpoint for StallingSupplier {
    fn identity(&self) -> &AgentIdentity {
        self.inner.identity()
    }

    async fn request_proof(&self, request: &QuoteRequest, threshold: i64) -> Result<InventoryProof> {
        if self.stall == Stall::Proof {
            sleep(Duration::from_secs(60)).await;
        }
        self.inner.request_proof(request, threshold).await
    }

    async fn countersign(
        &self,
        terms: &AgreementTerms,
        hash: &str,
        buyer: &AgentIdentity,
        buyer_signature: &AgreementSignature,
    ) -> Result<AgreementSignature> {
        if self.stall == Stall::Countersign {
            sleep(Duration::from_secs(60)).await;
        }
        self.inner.countersign(terms, hash, buyer, buyer_signature).await
    }

    async fn negotiation_failed(&self, request: &QuoteRequest, reason: FailureReason) -> Result<()> {
        self.inner.negotiation_failed(request, reason).await
    }
}

/// Ledger that reports the first `failures` commits as unavailable. When
/// `land_anyway` is set the failed commits still reach the inner ledger, as if
/// the acknowledgement was lost.
struct FlakyLedger {
    inner: InMemoryLedger,
    failures: Mutex<u32>,
    land_anyway: bool,
    attempts: Mutex<u32>,
}

impl FlakyLedger {
    fn new(failures: u32, land_anyway: bool) -> Self {
        Self {
            inner: InMemoryLedger::new(),
            failures: Mutex::new(failures),
            land_anyway,
            attempts: Mutex::new(0),
        }
    }

    fn attempts(&self) -> u32 {
        *self.attempts.lock()
    }

    fn recover(&self) {
        *self.failures.lock() = 0;
    }
}

#[async_trait]
impl CommitmentLedger for FlakyLedger {
    async fn commit(&self, agreement: &Agreement, reputation: &[ReputationDelta]) -> Result<CommitReceipt> {
        *self.attempts.lock() += 1;
        let fail = {
            let mut failures = self.failures.lock();
            if *failures > 0 {
                *failures -= 1;
                true
            } else {
                false
            }
        };
        if fail {
            if self.land_anyway {
                self.inner.commit(agreement, reputation).await?;
            }
            return Err(NegotiationError::LedgerUnavailable("connection reset".to_string()));
        }
        self.inner.commit(agreement, reputation).await
    }

    async fn entry(&self, agreement_hash: &str) -> Result<Option<LedgerEntry>> {
        self.inner.entry(agreement_hash).await
    }

    async fn entries(&self) -> Result<Vec<LedgerEntry>> {
        self.inner.entries().await
    }

    async fn reputation(&self, agent: &Did) -> Result<ReputationScore> {
        self.inner.reputation(agent).await
    }
}

/// Ledger whose first commit lands without being acknowledged, after which it
/// is unreachable until restored.
struct BlackoutLedger {
    inner: InMemoryLedger,
    tripped: Mutex<bool>,
    down: Mutex<bool>,
}

impl BlackoutLedger {
    fn new() -> Self {
        Self {
            inner: InMemoryLedger::new(),
            tripped: Mutex::new(false),
            down: Mutex::new(false),
        }
    }

    fn restore(&self) {
        *self.down.lock() = false;
    }

    fn unavailable() -> NegotiationError {
        NegotiationError::LedgerUnavailable("ledger unreachable".to_string())
    }
}

#[async_trait]
impl CommitmentLedger for BlackoutLedger {
    async fn commit(&self, agreement: &Agreement, reputation: &[ReputationDelta]) -> Result<CommitReceipt> {
        if *self.down.lock() {
            return Err(Self::unavailable());
        }
        let first = !std::mem::replace(&mut *self.tripped.lock(), true);
        let receipt = self.inner.commit(agreement, reputation).await?;
        if first {
            *self.down.lock() = true;
            return Err(Self::unavailable());
        }
        Ok(receipt)
    }

    async fn entry(&self, agreement_hash: &str) -> Result<Option<LedgerEntry>> {
        if *self.down.lock() {
            return Err(Self::unavailable());
        }
        self.inner.entry(agreement_hash).await
    }

    async fn entries(&self) -> Result<Vec<LedgerEntry>> {
        self.inner.entries().await
    }

    async fn reputation(&self, agent: &Did) -> Result<ReputationScore> {
        self.inner.reputation(agent).await
    }
}

/// Cancels the negotiation as soon as an event starting with `trigger` is recorded.
fn cancel_on(events: &EventLog, negotiator: &Negotiator, trigger: &'static str) {
    let mut feed = events.subscribe();
    let handle = negotiator.cancel_handle();
    tokio::spawn(async move {
        while let Ok(event) = feed.recv().await {
            if event.message.starts_with(trigger) {
                handle.cancel();
                break;
            }
        }
    });
}

#[tokio::test]
async fn test_negotiation_flow() -> Result<()> {
    let harness = Harness::new();
    let ledger = Arc::new(InMemoryLedger::new());
    let mut negotiator = harness.negotiator(ledger.clone());

    let receipt = negotiator.run("widget", 50, Some(50)).await?;

    assert_eq!(negotiator.state(), NegotiationState::Signed);
    assert_eq!(ledger.len().await?, 1);
    assert!(ledger.contains(&receipt.agreement_hash).await?);
    assert_eq!(ledger.reputation(&harness.supplier_did()).await?.score, 10);
    assert_eq!(ledger.reputation(&harness.buyer_identity.did).await?.score, 0);

    let agreement = negotiator.negotiation().agreement().unwrap();
    agreement.verify(&harness.buyer_identity, harness.supplier.identity())?;
    assert_eq!(agreement.terms.hash()?, receipt.agreement_hash);

    let states: Vec<NegotiationState> = harness
        .events
        .for_negotiation(negotiator.id())
        .into_iter()
        .filter(|e| e.state_before != e.state_after)
        .map(|e| e.state_after)
        .collect();
    assert_eq!(
        states,
        vec![
            NegotiationState::Connected,
            NegotiationState::Requested,
            NegotiationState::Authorized,
            NegotiationState::Proofed,
            NegotiationState::Signed,
        ]
    );

    // The secret stock level never appears in the protocol narration.
    assert!(harness.events.snapshot().iter().all(|e| !e.message.contains("150 units")));
    Ok(())
}

#[tokio::test]
async fn test_unauthorized_supplier_commits_nothing() -> Result<()> {
    let harness = Harness::new();
    harness.oracle.revoke(&harness.supplier_did(), "widget");
    let ledger = Arc::new(InMemoryLedger::new());
    let mut negotiator = harness.negotiator(ledger.clone());

    let result = negotiator.run("widget", 50, None).await;
    assert!(matches!(result, Err(NegotiationError::Unauthorized)));
    assert_eq!(negotiator.state(), NegotiationState::Failed(FailureReason::Unauthorized));
    assert_eq!(ledger.len().await?, 0);
    assert_eq!(ledger.reputation(&harness.supplier_did()).await?.score, 0);
    Ok(())
}

#[tokio::test]
async fn test_buyer_scoped_authorization() -> Result<()> {
    let harness = Harness::new();
    let other = Did::new("did:example:buyer2")?;
    harness.oracle.register(other.clone());
    harness.oracle.allow(
        &harness.supplier_did(),
        "widget",
        AccessScope::Buyers([other].into_iter().collect()),
    )?;

    let mut negotiator = harness.negotiator(Arc::new(InMemoryLedger::new()));
    assert!(negotiator.run("widget", 50, None).await.is_err());
    assert_eq!(negotiator.state(), NegotiationState::Failed(FailureReason::Unauthorized));
    Ok(())
}

#[tokio::test]
async fn test_unregistered_supplier() -> Result<()> {
    let harness = Harness::new();
    let stranger = Arc::new(
        SupplierAgent::new(
            AgentKeys::generate(),
            Did::new("did:example:stranger")?,
            Arc::new(RangeProofEngine::new()),
        )
        .with_stock("widget", 500),
    );
    let ledger = Arc::new(InMemoryLedger::new());
    let mut negotiator = Negotiator::new(harness.buyer.clone(), stranger, harness.services(ledger.clone()));

    let result = negotiator.run("widget", 50, None).await;
    assert!(matches!(result, Err(NegotiationError::NotRegistered(_))));
    assert_eq!(negotiator.state(), NegotiationState::Failed(FailureReason::NotRegistered));
    assert_eq!(ledger.len().await?, 0);
    Ok(())
}

#[tokio::test]
async fn test_disconnected_buyer_cannot_start() -> Result<()> {
    let harness = Harness::new();
    let offline = Arc::new(BuyerAgent::new(
        AgentKeys::generate(),
        Arc::new(StaticIdentityProvider::disconnected()),
    ));
    let mut negotiator = Negotiator::new(
        offline,
        harness.supplier.clone(),
        harness.services(Arc::new(InMemoryLedger::new())),
    );

    assert!(matches!(negotiator.connect().await, Err(NegotiationError::NotConnected)));
    assert_eq!(negotiator.state(), NegotiationState::Disconnected);
    Ok(())
}

#[tokio::test]
async fn test_duplicate_commit_is_rejected() -> Result<()> {
    let harness = Harness::new();
    let ledger = Arc::new(InMemoryLedger::new());
    let mut negotiator = harness.negotiator(ledger.clone());
    negotiator.run("widget", 50, None).await?;

    let agreement = negotiator.negotiation().agreement().unwrap().clone();
    let reward = vec![ReputationDelta {
        agent: harness.supplier_did(),
        delta: 10,
    }];
    let duplicate = ledger.commit(&agreement, &reward).await;
    assert!(matches!(duplicate, Err(NegotiationError::DuplicateCommit(_))));
    assert!(duplicate.unwrap_err().is_benign());

    assert_eq!(ledger.len().await?, 1);
    assert_eq!(ledger.reputation(&harness.supplier_did()).await?.score, 10);
    Ok(())
}

#[tokio::test]
async fn test_cancel_during_authorization() -> Result<()> {
    let harness = Harness::new();
    let ledger = Arc::new(InMemoryLedger::new());
    let oracle = Arc::new(SlowOracle {
        inner: harness.oracle.clone(),
        delay: Duration::from_secs(60),
    });
    let mut negotiator = Negotiator::new(
        harness.buyer.clone(),
        harness.supplier.clone(),
        harness.services_with(oracle, ledger.clone()),
    );

    cancel_on(&harness.events, &negotiator, "Querying authorization registry");

    let result = negotiator.run("widget", 50, None).await;
    assert!(matches!(result, Err(NegotiationError::Cancelled)));
    assert_eq!(negotiator.state(), NegotiationState::Failed(FailureReason::Cancelled));
    assert_eq!(ledger.len().await?, 0);

    let request_id = negotiator.negotiation().request().unwrap().id;
    assert_eq!(harness.supplier.failure(request_id), Some(FailureReason::Cancelled));
    Ok(())
}

#[tokio::test]
async fn test_cancel_while_waiting_on_supplier() -> Result<()> {
    for stall in [Stall::Proof, Stall::Countersign] {
        let harness = Harness::new();
        let ledger = Arc::new(InMemoryLedger::new());
        let supplier = Arc::new(StallingSupplier {
            inner: harness.supplier.clone(),
            stall,
        });
        let mut negotiator = Negotiator::new(harness.buyer.clone(), supplier, harness.services(ledger.clone()));

        let trigger = match stall {
            Stall::Proof => "Requesting ZKP",
            Stall::Countersign => "Preparing agreement",
        };
        cancel_on(&harness.events, &negotiator, trigger);

        let result = negotiator.run("widget", 50, None).await;
        assert!(matches!(result, Err(NegotiationError::Cancelled)));
        assert_eq!(negotiator.state(), NegotiationState::Failed(FailureReason::Cancelled));
        assert!(negotiator.negotiation().agreement().is_none());
        assert_eq!(ledger.len().await?, 0);
        assert_eq!(ledger.reputation(&harness.supplier_did()).await?.score, 0);

        let request_id = negotiator.negotiation().request().unwrap().id;
        assert_eq!(harness.supplier.failure(request_id), Some(FailureReason::Cancelled));
        assert_eq!(harness.supplier.outstanding_proofs(), 0);
    }
    Ok(())
}

#[tokio::test]
async fn test_cancel_before_commit() -> Result<()> {
    let harness = Harness::new();
    let ledger = Arc::new(InMemoryLedger::new());
    let mut negotiator = harness.negotiator(ledger.clone());

    negotiator.connect().await?;
    negotiator.request_quote("widget", 50).await?;
    negotiator.authorize().await?;
    let proof = negotiator.request_proof(50).await?;
    negotiator.receive_proof(proof).await?;
    assert_eq!(negotiator.state(), NegotiationState::Proofed);

    assert_eq!(negotiator.cancel().await?, NegotiationState::Failed(FailureReason::Cancelled));
    assert!(matches!(negotiator.sign().await, Err(NegotiationError::InvalidTransition { .. })));
    assert_eq!(ledger.len().await?, 0);
    assert_eq!(harness.supplier.outstanding_proofs(), 0);

    // Cancelling a terminal negotiation changes nothing.
    assert!(negotiator.cancel().await.is_err());
    assert_eq!(negotiator.state(), NegotiationState::Failed(FailureReason::Cancelled));
    Ok(())
}

#[tokio::test]
async fn test_disconnect_mid_negotiation_cancels() -> Result<()> {
    let harness = Harness::new();
    let mut negotiator = harness.negotiator(Arc::new(InMemoryLedger::new()));

    negotiator.connect().await?;
    assert_eq!(negotiator.disconnect().await?, NegotiationState::Disconnected);

    negotiator.connect().await?;
    negotiator.request_quote("widget", 50).await?;
    assert_eq!(
        negotiator.disconnect().await?,
        NegotiationState::Failed(FailureReason::Cancelled)
    );
    Ok(())
}

#[tokio::test]
async fn test_authorization_timeout() -> Result<()> {
    let harness = Harness::new();
    let oracle = Arc::new(SlowOracle {
        inner: harness.oracle.clone(),
        delay: Duration::from_secs(60),
    });
    let mut services = harness.services_with(oracle, Arc::new(InMemoryLedger::new()));
    services.settings.authorization_timeout = Duration::from_millis(50);
    let mut negotiator = Negotiator::new(harness.buyer.clone(), harness.supplier.clone(), services);

    let result = negotiator.run("widget", 50, None).await;
    assert!(matches!(result, Err(NegotiationError::Timeout(_))));
    assert_eq!(negotiator.state(), NegotiationState::Failed(FailureReason::Timeout));

    let request_id = negotiator.negotiation().request().unwrap().id;
    assert_eq!(harness.supplier.failure(request_id), Some(FailureReason::Timeout));
    Ok(())
}

#[tokio::test]
async fn test_insufficient_inventory() -> Result<()> {
    let harness = Harness::new();
    let ledger = Arc::new(InMemoryLedger::new());
    let mut negotiator = harness.negotiator(ledger.clone());

    let result = negotiator.run("widget", 50, Some(151)).await;
    assert!(matches!(result, Err(NegotiationError::InsufficientQuantity)));
    assert_eq!(negotiator.state(), NegotiationState::Failed(FailureReason::InsufficientQuantity));
    assert_eq!(ledger.len().await?, 0);
    Ok(())
}

#[tokio::test]
async fn test_commit_retries_transient_failures() -> Result<()> {
    let harness = Harness::new();
    let ledger = Arc::new(FlakyLedger::new(2, false));
    let mut negotiator = harness.negotiator(ledger.clone());

    negotiator.run("widget", 50, None).await?;
    assert_eq!(negotiator.state(), NegotiationState::Signed);
    assert_eq!(ledger.attempts(), 3);
    assert_eq!(ledger.len().await?, 1);
    assert_eq!(ledger.reputation(&harness.supplier_did()).await?.score, 10);
    Ok(())
}

#[tokio::test]
async fn test_lost_acknowledgement_is_not_double_counted() -> Result<()> {
    let harness = Harness::new();
    let ledger = Arc::new(FlakyLedger::new(1, true));
    let mut negotiator = harness.negotiator(ledger.clone());

    let receipt = negotiator.run("widget", 50, None).await?;
    assert_eq!(negotiator.state(), NegotiationState::Signed);
    assert_eq!(ledger.attempts(), 2);
    assert_eq!(receipt.sequence, 1);
    assert_eq!(ledger.len().await?, 1);
    assert_eq!(ledger.reputation(&harness.supplier_did()).await?.score, 10);
    Ok(())
}

#[tokio::test]
async fn test_ledger_outage_leaves_agreement_pending() -> Result<()> {
    let harness = Harness::new();
    let ledger = Arc::new(FlakyLedger::new(u32::MAX, false));
    let mut negotiator = harness.negotiator(ledger.clone());

    let result = negotiator.run("widget", 50, None).await;
    let err = result.unwrap_err();
    assert!(matches!(err, NegotiationError::LedgerUnavailable(_)));
    assert!(err.is_retryable());
    assert_eq!(negotiator.state(), NegotiationState::Proofed);
    assert_eq!(ledger.attempts(), NegotiationSettings::default().max_commit_attempts);
    let pending_hash = negotiator.pending_agreement().unwrap().hash.clone();
    assert_eq!(ledger.len().await?, 0);

    // Once the ledger recovers the same agreement is committed.
    ledger.recover();
    let receipt = negotiator.sign().await?;
    assert_eq!(receipt.agreement_hash, pending_hash);
    assert_eq!(negotiator.state(), NegotiationState::Signed);
    assert!(negotiator.pending_agreement().is_none());
    assert_eq!(ledger.reputation(&harness.supplier_did()).await?.score, 10);
    Ok(())
}

#[tokio::test]
async fn test_cancel_discards_agreement_missing_from_ledger() -> Result<()> {
    let harness = Harness::new();
    let ledger = Arc::new(FlakyLedger::new(u32::MAX, false));
    let mut negotiator = harness.negotiator(ledger.clone());

    let result = negotiator.run("widget", 50, None).await;
    assert!(matches!(result, Err(NegotiationError::LedgerUnavailable(_))));
    assert!(negotiator.pending_agreement().is_some());

    assert_eq!(negotiator.cancel().await?, NegotiationState::Failed(FailureReason::Cancelled));
    assert!(negotiator.pending_agreement().is_none());
    assert_eq!(ledger.len().await?, 0);

    let request_id = negotiator.negotiation().request().unwrap().id;
    assert_eq!(harness.supplier.failure(request_id), Some(FailureReason::Cancelled));
    Ok(())
}

#[tokio::test]
async fn test_cancel_after_lost_acknowledgement_waits_for_ledger() -> Result<()> {
    let harness = Harness::new();
    let ledger = Arc::new(BlackoutLedger::new());
    let mut negotiator = harness.negotiator(ledger.clone());

    let result = negotiator.run("widget", 50, None).await;
    assert!(matches!(result, Err(NegotiationError::LedgerUnavailable(_))));
    assert_eq!(negotiator.state(), NegotiationState::Proofed);
    let pending_hash = negotiator.pending_agreement().unwrap().hash.clone();
    assert_eq!(ledger.len().await?, 1);

    // The agreement is on the ledger but the negotiator cannot confirm it yet.
    assert!(matches!(negotiator.cancel().await, Err(NegotiationError::LedgerUnavailable(_))));
    assert!(matches!(negotiator.disconnect().await, Err(NegotiationError::LedgerUnavailable(_))));
    assert_eq!(negotiator.state(), NegotiationState::Proofed);
    assert!(negotiator.pending_agreement().is_some());

    ledger.restore();
    assert_eq!(negotiator.cancel().await?, NegotiationState::Signed);
    let receipt = negotiator.negotiation().receipt().unwrap();
    assert_eq!(receipt.agreement_hash, pending_hash);
    assert_eq!(receipt.sequence, 1);
    assert!(negotiator.pending_agreement().is_none());
    assert!(!negotiator.cancel_handle().is_cancelled());

    assert_eq!(ledger.len().await?, 1);
    assert_eq!(ledger.reputation(&harness.supplier_did()).await?.score, 10);
    let request_id = negotiator.negotiation().request().unwrap().id;
    assert_eq!(harness.supplier.failure(request_id), None);
    Ok(())
}

#[tokio::test]
async fn test_signal_after_lost_acknowledgement_completes_on_sign() -> Result<()> {
    let harness = Harness::new();
    let ledger = Arc::new(BlackoutLedger::new());
    let mut negotiator = harness.negotiator(ledger.clone());

    let result = negotiator.run("widget", 50, None).await;
    assert!(matches!(result, Err(NegotiationError::LedgerUnavailable(_))));

    negotiator.cancel_handle().cancel();
    assert!(matches!(negotiator.sign().await, Err(NegotiationError::LedgerUnavailable(_))));
    assert_eq!(negotiator.state(), NegotiationState::Proofed);

    ledger.restore();
    let receipt = negotiator.sign().await?;
    assert_eq!(negotiator.state(), NegotiationState::Signed);
    assert_eq!(Some(&receipt), negotiator.negotiation().receipt());
    assert_eq!(ledger.len().await?, 1);
    Ok(())
}

#[tokio::test]
async fn test_concurrent_negotiations_on_sqlite_ledger() -> Result<()> {
    let temp_file = NamedTempFile::new().unwrap();
    let db_url = format!("sqlite://{}", temp_file.path().to_string_lossy());
    let ledger = Arc::new(SqliteLedger::new(&db_url).await?);
    let harness = Harness::new();

    let mut handles = Vec::new();
    for _ in 0..8 {
        // Eight proofs compete for the blocking pool at once.
        let mut services = harness.services(ledger.clone());
        services.settings.proof_timeout = Duration::from_secs(300);
        let mut negotiator = Negotiator::new(harness.buyer.clone(), harness.supplier.clone(), services);
        handles.push(tokio::spawn(async move {
            let outcome = negotiator.run("widget", 50, None).await;
            (negotiator.state(), outcome)
        }));
    }

    for handle in handles {
        let (state, outcome) = handle.await.unwrap();
        outcome?;
        assert_eq!(state, NegotiationState::Signed);
    }

    assert_eq!(ledger.len().await?, 8);
    assert_eq!(ledger.reputation(&harness.supplier_did()).await?.score, 80);

    let sequences: Vec<u64> = ledger.entries().await?.iter().map(|e| e.sequence).collect();
    assert_eq!(sequences, (1..=8).collect::<Vec<u64>>());
    Ok(())
}

#[tokio::test]
async fn test_event_stream_is_totally_ordered() -> Result<()> {
    let harness = Harness::new();
    let ledger = Arc::new(InMemoryLedger::new());
    let mut live = harness.events.subscribe();

    let mut first = harness.negotiator(ledger.clone());
    let mut second = harness.negotiator(ledger.clone());
    let (a, b) = tokio::join!(first.run("widget", 10, None), second.run("widget", 20, None));
    a?;
    b?;

    let snapshot = harness.events.snapshot();
    assert!(snapshot.windows(2).all(|w| w[0].sequence + 1 == w[1].sequence));
    for expected in &snapshot {
        let received = live.recv().await.unwrap();
        assert_eq!(&received, expected);
    }
    assert!(!harness.events.for_negotiation(first.id()).is_empty());
    assert!(!harness.events.for_negotiation(second.id()).is_empty());
    Ok(())
}
