use crate::{
    error::{NegotiationError, Result},
    reputation::ReputationPolicy,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone, Serialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub negotiation: NegotiationConfig,
    #[serde(default)]
    pub ledger: LedgerConfig,
    #[serde(default)]
    pub reputation: ReputationConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone, Serialize)]
#[serde(default)]
pub struct NegotiationConfig {
    pub authorization_timeout_ms: u64,
    pub proof_timeout_ms: u64,
    pub signature_timeout_ms: u64,
    pub commit_timeout_ms: u64,
    /// When set, the proof threshold equals the requested quantity.
    pub threshold_from_quantity: bool,
}

#[derive(Debug, Deserialize, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LedgerBackend {
    Memory,
    Sqlite,
}

#[derive(Debug, Deserialize, Clone, Serialize)]
#[serde(default)]
pub struct LedgerConfig {
    pub backend: LedgerBackend,
    pub url: String,
    pub max_commit_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub max_connections: Option<u32>,
    pub acquire_timeout_seconds: Option<u64>,
    /// How long SQLite waits on a locked database before reporting it busy.
    pub busy_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Clone, Serialize)]
#[serde(default)]
pub struct ReputationConfig {
    pub supplier_reward: i64,
    pub buyer_reward: i64,
}

#[derive(Debug, Deserialize, Clone, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: Option<String>,
}

impl Default for NegotiationConfig {
    fn default() -> Self {
        Self {
            authorization_timeout_ms: 5_000,
            proof_timeout_ms: 30_000,
            signature_timeout_ms: 5_000,
            commit_timeout_ms: 10_000,
            threshold_from_quantity: true,
        }
    }
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            backend: LedgerBackend::Memory,
            url: "sqlite://besacp-ledger.db".to_string(),
            max_commit_attempts: 5,
            retry_base_delay_ms: 100,
            max_connections: Some(5),
            acquire_timeout_seconds: Some(30),
            busy_timeout_ms: Some(5_000),
        }
    }
}

impl Default for ReputationConfig {
    fn default() -> Self {
        let policy = ReputationPolicy::default();
        Self {
            supplier_reward: policy.supplier_reward,
            buyer_reward: policy.buyer_reward,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: Some("plain".to_string()),
        }
    }
}

impl NegotiationConfig {
    pub fn authorization_timeout(&self) -> Duration {
        Duration::from_millis(self.authorization_timeout_ms)
    }

    pub fn proof_timeout(&self) -> Duration {
        Duration::from_millis(self.proof_timeout_ms)
    }

    pub fn signature_timeout(&self) -> Duration {
        Duration::from_millis(self.signature_timeout_ms)
    }

    pub fn commit_timeout(&self) -> Duration {
        Duration::from_millis(self.commit_timeout_ms)
    }
}

impl ReputationConfig {
    pub fn policy(&self) -> ReputationPolicy {
        ReputationPolicy {
            supplier_reward: self.supplier_reward,
            buyer_reward: self.buyer_reward,
        }
    }
}

impl LoggingConfig {
    /// Installs the global tracing subscriber. `RUST_LOG` takes precedence over
    /// the configured level.
    pub fn init_tracing(&self) -> Result<()> {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&self.level));
        let builder = tracing_subscriber::fmt().with_env_filter(filter);

        let result = match self.format.as_deref() {
            Some("json") => builder.json().try_init(),
            _ => builder.try_init(),
        };
        result.map_err(|e| NegotiationError::Config(format!("Failed to initialize tracing: {}", e)))
    }
}

impl AppConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config_str = std::fs::read_to_string(path)
            .map_err(|e| NegotiationError::Config(format!("Failed to read config file: {}", e)))?;

        let config: AppConfig = toml::from_str(&config_str)?;

        Ok(config)
    }

    pub fn load_with_env_overrides<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut config = Self::load(path)?;
        config.apply_env_overrides()?;
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(url) = std::env::var("BESACP_LEDGER_URL") {
            self.ledger.backend = LedgerBackend::Sqlite;
            self.ledger.url = url;
        }

        if let Ok(reward) = std::env::var("BESACP_SUPPLIER_REWARD") {
            self.reputation.supplier_reward = reward
                .parse()
                .map_err(|e| NegotiationError::Config(format!("Invalid BESACP_SUPPLIER_REWARD: {}", e)))?;
        }

        if let Ok(log_level) = std::env::var("RUST_LOG") {
            self.logging.level = log_level;
        }

        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let negotiation = &self.negotiation;
        for (name, value) in [
            ("authorization_timeout_ms", negotiation.authorization_timeout_ms),
            ("proof_timeout_ms", negotiation.proof_timeout_ms),
            ("signature_timeout_ms", negotiation.signature_timeout_ms),
            ("commit_timeout_ms", negotiation.commit_timeout_ms),
        ] {
            if value == 0 {
                return Err(NegotiationError::Config(format!("{} cannot be 0", name)));
            }
        }

        if self.ledger.max_commit_attempts == 0 {
            return Err(NegotiationError::Config("Ledger max_commit_attempts cannot be 0".to_string()));
        }

        if self.ledger.backend == LedgerBackend::Sqlite && self.ledger.url.is_empty() {
            return Err(NegotiationError::Config("Ledger URL cannot be empty".to_string()));
        }

        if self.logging.level.is_empty() {
            return Err(NegotiationError::Config("Logging level cannot be empty".to_string()));
        }

        Ok(())
    }
}

pub fn create_default_config_file<P: AsRef<Path>>(path: P) -> Result<()> {
    let default_config = AppConfig::default();
    let toml_str = toml::to_string_pretty(&default_config)
        .map_err(|e| NegotiationError::Config(format!("Failed to serialize default config: {}", e)))?;

    std::fs::write(path, toml_str)
        .map_err(|e| NegotiationError::Config(format!("Failed to write default config file: {}", e)))?;

    Ok(())
}
