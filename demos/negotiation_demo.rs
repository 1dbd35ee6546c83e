//! Example demonstrating a complete verifiable negotiation
//!
//! This example shows how to:
//! 1. Register a buyer and a supplier with the authorization oracle
//! 2. Run a negotiation that proves inventory without revealing it
//! 3. Commit the signed agreement to a SQLite ledger
//! 4. Watch an unauthorized negotiation fail without touching the ledger

use besacp::{
    agent::{BuyerAgent, SupplierAgent, SupplierEndpoint},
    authorization::{AccessScope, RegistryOracle},
    crypto::AgentKeys,
    database::SqliteLedger,
    error::Result,
    events::EventLog,
    identity::StaticIdentityProvider,
    ledger::CommitmentLedger,
    model::{Did, Role},
    negotiator::{NegotiationSettings, Negotiator, ProtocolServices},
    proof::RangeProofEngine,
    reputation::TrustLevel,
};
use std::sync::Arc;
use tempfile::NamedTempFile;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::WARN)
        .init();

    println!("🤝 BESACP Negotiation Demo");
    println!("==========================\n");

    let temp_file = NamedTempFile::new()?;
    let db_url = format!("sqlite://{}", temp_file.path().to_string_lossy());
    let ledger = Arc::new(SqliteLedger::new(&db_url).await?);

    println!("1. Setting up agents...");
    let buyer_keys = AgentKeys::generate();
    let buyer_identity = buyer_keys.identity(Did::new("did:example:buyer1")?, Role::Buyer);
    let buyer = Arc::new(BuyerAgent::new(
        buyer_keys,
        Arc::new(StaticIdentityProvider::connected(buyer_identity.clone())),
    ));

    let engine = Arc::new(RangeProofEngine::new());
    let supplier = Arc::new(
        SupplierAgent::new(AgentKeys::generate(), Did::new("did:example:supplier1")?, engine.clone())
            .with_stock("widget", 150)
            .with_stock("gadget", 40),
    );
    let supplier_did = supplier.identity().did.clone();

    let oracle = Arc::new(RegistryOracle::new());
    oracle.register(buyer_identity.did.clone());
    oracle.register(supplier_did.clone());
    oracle.allow(&supplier_did, "widget", AccessScope::AnyBuyer)?;
    println!("   ✅ {} may quote widgets to any buyer\n", supplier_did);

    let events = EventLog::new();
    let services = ProtocolServices {
        oracle,
        engine,
        ledger: ledger.clone(),
        events: events.clone(),
        settings: NegotiationSettings::default(),
    };

    println!("2. Negotiating 50 widgets (supplier privately holds more)...");
    let mut negotiator = Negotiator::new(buyer.clone(), supplier.clone(), services.clone());
    match negotiator.run("widget", 50, None).await {
        Ok(receipt) => println!("   ✅ Committed as ledger entry #{}\n", receipt.sequence),
        Err(e) => println!("   ❌ Negotiation failed: {}\n", e),
    }
    for event in events.for_negotiation(negotiator.id()) {
        println!("   [{}] {}", event.state_after, event.message);
    }
    println!();

    println!("3. Negotiating gadgets, which the supplier is not authorized to quote...");
    let mut denied = Negotiator::new(buyer, supplier, services);
    match denied.run("gadget", 10, None).await {
        Ok(_) => println!("   ⚠️  Unexpectedly signed\n"),
        Err(e) => println!("   ✅ Rejected as expected: {} ({})\n", e, denied.state()),
    }

    println!("4. Ledger summary");
    for entry in ledger.entries().await? {
        println!("   #{} {} x{} hash {}", entry.sequence, entry.item, entry.quantity, entry.agreement_hash);
    }
    let score = ledger.reputation(&supplier_did).await?;
    println!(
        "   {} reputation: {} ({:?})",
        score.agent,
        score.score,
        TrustLevel::from(score.score)
    );

    ledger.close().await;
    println!("\n🎉 Demo completed!");
    Ok(())
}
