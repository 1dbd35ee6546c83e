use besacp::{
    config::AppConfig,
    database::SqliteLedger,
    ledger::CommitmentLedger,
    model::Did,
    reputation::TrustLevel,
};
use clap::{Parser, Subcommand};
use std::path::Path;

#[derive(Parser)]
#[command(name = "besacp-ledger")]
#[command(about = "Inspect a SQLite commitment ledger")]
struct Args {
    #[arg(short, long, default_value = "besacp.toml")]
    config: String,

    /// Overrides the ledger URL from the configuration
    #[arg(short, long)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List committed agreements in commit order
    Entries,
    /// Show a single agreement by hash
    Show { hash: String },
    /// List reputation scores, or one agent's score
    Reputation { did: Option<String> },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = if Path::new(&args.config).exists() {
        AppConfig::load_with_env_overrides(&args.config)?
    } else {
        let mut config = AppConfig::default();
        config.apply_env_overrides()?;
        config
    };
    if let Some(url) = args.database_url {
        config.ledger.url = url;
    }
    config.logging.init_tracing()?;

    let ledger = SqliteLedger::from_config(&config.ledger).await?;

    match args.command {
        Command::Entries => {
            let entries = ledger.entries().await?;
            println!("{} committed agreements", entries.len());
            for entry in entries {
                println!(
                    "#{} {} {} -> {} {} x{} at {}",
                    entry.sequence,
                    entry.agreement_hash,
                    entry.supplier,
                    entry.buyer,
                    entry.item,
                    entry.quantity,
                    entry.committed_at.to_rfc3339()
                );
            }
        }
        Command::Show { hash } => match ledger.entry(&hash).await? {
            Some(entry) => println!("{}", serde_json::to_string_pretty(&entry)?),
            None => println!("No agreement with hash {}", hash),
        },
        Command::Reputation { did: Some(did) } => {
            let score = ledger.reputation(&Did::new(did)?).await?;
            println!("{}: {} ({:?})", score.agent, score.score, TrustLevel::from(score.score));
        }
        Command::Reputation { did: None } => {
            for score in ledger.reputations().await? {
                println!("{}: {} ({:?})", score.agent, score.score, TrustLevel::from(score.score));
            }
        }
    }

    ledger.close().await;
    Ok(())
}
