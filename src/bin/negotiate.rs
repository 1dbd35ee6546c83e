use anyhow::Context;
use besacp::{
    agent::{BuyerAgent, SupplierAgent, SupplierEndpoint},
    authorization::{AccessScope, RegistryOracle},
    config::{AppConfig, LedgerBackend},
    crypto::AgentKeys,
    database::SqliteLedger,
    events::EventLog,
    identity::StaticIdentityProvider,
    ledger::{CommitmentLedger, InMemoryLedger},
    model::{Did, Role},
    negotiator::{NegotiationSettings, Negotiator, ProtocolServices},
    proof::RangeProofEngine,
    reputation::TrustLevel,
};
use clap::Parser;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;

#[derive(Parser)]
#[command(name = "besacp-negotiate")]
#[command(about = "Run buyer/supplier negotiations end to end")]
struct Args {
    #[arg(short, long, default_value = "besacp.toml")]
    config: String,

    #[arg(long, default_value = "did:example:buyer1")]
    buyer: String,

    #[arg(long, default_value = "did:example:supplier1")]
    supplier: String,

    #[arg(short, long, default_value = "widget")]
    item: String,

    #[arg(short, long, default_value = "50")]
    quantity: u64,

    /// Inventory threshold to prove; defaults per configuration
    #[arg(short, long)]
    threshold: Option<i64>,

    /// Supplier's private stock of the item
    #[arg(long, default_value = "150")]
    inventory: u64,

    /// Number of independent negotiations to run concurrently
    #[arg(long, default_value = "1")]
    count: usize,

    /// Leave the supplier unauthorized for the item
    #[arg(long)]
    deny: bool,

    /// Write a default configuration file to --config and exit
    #[arg(long)]
    init_config: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if args.init_config {
        besacp::config::create_default_config_file(&args.config)?;
        println!("Wrote default configuration to {}", args.config);
        return Ok(());
    }

    let config = if Path::new(&args.config).exists() {
        AppConfig::load_with_env_overrides(&args.config)?
    } else {
        let mut config = AppConfig::default();
        config.apply_env_overrides()?;
        config
    };
    config.validate()?;
    config.logging.init_tracing()?;

    let ledger: Arc<dyn CommitmentLedger> = match config.ledger.backend {
        LedgerBackend::Memory => Arc::new(InMemoryLedger::new()),
        LedgerBackend::Sqlite => Arc::new(
            SqliteLedger::from_config(&config.ledger)
                .await
                .with_context(|| format!("opening ledger at {}", config.ledger.url))?,
        ),
    };

    let buyer_keys = AgentKeys::generate();
    let buyer_identity = buyer_keys.identity(Did::new(args.buyer.clone())?, Role::Buyer);
    let buyer = Arc::new(BuyerAgent::new(
        buyer_keys,
        Arc::new(StaticIdentityProvider::connected(buyer_identity.clone())),
    ));

    let engine = Arc::new(RangeProofEngine::new());
    let supplier = Arc::new(
        SupplierAgent::new(AgentKeys::generate(), Did::new(args.supplier.clone())?, engine.clone())
            .with_stock(args.item.clone(), args.inventory),
    );
    let supplier_did = supplier.identity().did.clone();

    let oracle = Arc::new(RegistryOracle::new());
    oracle.register(buyer_identity.did.clone());
    oracle.register(supplier_did.clone());
    if !args.deny {
        oracle.allow(&supplier_did, &args.item, AccessScope::AnyBuyer)?;
    }

    let events = EventLog::new();
    let mut feed = events.subscribe();
    let printer = tokio::spawn(async move {
        loop {
            match feed.recv().await {
                Ok(event) => println!(
                    "[{}] {} -> {}: {}",
                    event.sequence, event.state_before, event.state_after, event.message
                ),
                Err(RecvError::Lagged(skipped)) => tracing::warn!(skipped, "Event printer fell behind"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let services = ProtocolServices {
        oracle,
        engine,
        ledger: ledger.clone(),
        events: events.clone(),
        settings: NegotiationSettings::from_config(&config),
    };

    let mut handles = Vec::with_capacity(args.count);
    for _ in 0..args.count.max(1) {
        let mut negotiator = Negotiator::new(buyer.clone(), supplier.clone(), services.clone());
        let item = args.item.clone();
        let (quantity, threshold) = (args.quantity, args.threshold);
        handles.push(tokio::spawn(async move {
            let outcome = negotiator.run(&item, quantity, threshold).await;
            (negotiator.id(), negotiator.state(), outcome)
        }));
    }

    let mut signed = 0;
    for handle in handles {
        let (id, state, outcome) = handle.await?;
        match outcome {
            Ok(receipt) => {
                signed += 1;
                tracing::info!(negotiation_id = %id, sequence = receipt.sequence, hash = %receipt.agreement_hash, "Negotiation signed");
            }
            Err(e) => tracing::warn!(negotiation_id = %id, state = %state, error = %e, "Negotiation did not complete"),
        }
    }

    // Let the printer drain before reporting.
    drop(services);
    drop(events);
    let _ = printer.await;

    let score = ledger.reputation(&supplier_did).await?;
    println!(
        "{} of {} negotiations signed; ledger holds {} agreements; {} reputation {} ({:?})",
        signed,
        args.count.max(1),
        ledger.len().await?,
        supplier_did,
        score.score,
        TrustLevel::from(score.score)
    );

    Ok(())
}
