use crate::{
    config::LedgerConfig,
    ledger::{check_agreement_hash, CommitmentLedger, LedgerEntry},
    model::{Agreement, CommitReceipt, Did, ReputationDelta, ReputationScore},
    NegotiationError, Result,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Row, SqlitePool,
};
use std::str::FromStr;
use std::time::Duration;

/// Commitment ledger persisted in SQLite. Each commit writes the entry and its
/// reputation deltas in a single transaction.
#[derive(Clone)]
pub struct SqliteLedger {
    pool: SqlitePool,
}

impl SqliteLedger {
    pub async fn new(database_url: &str) -> Result<Self> {
        Self::from_config(&LedgerConfig {
            url: database_url.to_string(),
            ..LedgerConfig::default()
        })
        .await
    }

    pub async fn from_config(config: &LedgerConfig) -> Result<Self> {
        Self::connect(
            &config.url,
            config.max_connections.unwrap_or(5),
            Duration::from_secs(config.acquire_timeout_seconds.unwrap_or(30)),
            Duration::from_millis(config.busy_timeout_ms.unwrap_or(5_000)),
        )
        .await
    }

    async fn connect(
        database_url: &str,
        max_connections: u32,
        acquire_timeout: Duration,
        busy_timeout: Duration,
    ) -> Result<Self> {
        let in_memory = database_url.contains(":memory:");
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .busy_timeout(busy_timeout);

        // Every connection to an in-memory database sees its own database.
        let pool = SqlitePoolOptions::new()
            .max_connections(if in_memory { 1 } else { max_connections })
            .min_connections(if in_memory { 1 } else { 0 })
            .idle_timeout(if in_memory { None } else { Some(Duration::from_secs(600)) })
            .max_lifetime(if in_memory { None } else { Some(Duration::from_secs(1800)) })
            .acquire_timeout(acquire_timeout)
            .connect_with(options)
            .await
            .map_err(classify)?;

        let ledger = Self { pool };
        ledger.migrate().await?;
        Ok(ledger)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS ledger_entries (
                sequence INTEGER PRIMARY KEY AUTOINCREMENT,
                agreement_hash TEXT NOT NULL UNIQUE,
                buyer TEXT NOT NULL,
                supplier TEXT NOT NULL,
                item TEXT NOT NULL,
                quantity INTEGER NOT NULL,
                proof_ref TEXT NOT NULL,
                committed_at DATETIME NOT NULL
            );

            CREATE TABLE IF NOT EXISTS reputation_events (
                agreement_hash TEXT NOT NULL,
                did TEXT NOT NULL,
                delta INTEGER NOT NULL,
                PRIMARY KEY (agreement_hash, did),
                FOREIGN KEY (agreement_hash) REFERENCES ledger_entries(agreement_hash)
            );

            CREATE TABLE IF NOT EXISTS reputation (
                did TEXT PRIMARY KEY,
                score INTEGER NOT NULL DEFAULT 0
            );

            CREATE INDEX IF NOT EXISTS idx_entries_supplier ON ledger_entries(supplier);
            CREATE INDEX IF NOT EXISTS idx_entries_buyer ON ledger_entries(buyer);
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn reputations(&self) -> Result<Vec<ReputationScore>> {
        let rows = sqlx::query("SELECT did, score FROM reputation ORDER BY score DESC, did ASC")
            .fetch_all(&self.pool)
            .await
            .map_err(classify)?;

        let mut scores = Vec::with_capacity(rows.len());
        for row in rows {
            scores.push(ReputationScore {
                agent: Did::new(row.try_get::<String, _>("did")?)?,
                score: row.try_get("score")?,
            });
        }
        Ok(scores)
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// Connectivity problems and lock contention are retryable; everything else
/// is a hard database error.
fn classify(err: sqlx::Error) -> NegotiationError {
    let transient = match &err {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) | sqlx::Error::WorkerCrashed => true,
        sqlx::Error::Database(db) => db.code().as_deref().map_or(false, is_lock_contention),
        _ => false,
    };
    if transient {
        NegotiationError::LedgerUnavailable(err.to_string())
    } else {
        NegotiationError::Database(err)
    }
}

/// SQLITE_BUSY (5) and SQLITE_LOCKED (6), including their extended codes.
fn is_lock_contention(code: &str) -> bool {
    code.parse::<i32>().map_or(false, |code| matches!(code & 0xff, 5 | 6))
}

fn entry_from_row(row: &SqliteRow) -> Result<LedgerEntry> {
    Ok(LedgerEntry {
        sequence: row.try_get::<i64, _>("sequence")? as u64,
        agreement_hash: row.try_get("agreement_hash")?,
        buyer: Did::new(row.try_get::<String, _>("buyer")?)?,
        supplier: Did::new(row.try_get::<String, _>("supplier")?)?,
        item: row.try_get("item")?,
        quantity: row.try_get::<i64, _>("quantity")? as u64,
        proof_ref: row.try_get("proof_ref")?,
        committed_at: row.try_get::<DateTime<Utc>, _>("committed_at")?,
    })
}

#[async_trait]
impl CommitmentLedger for SqliteLedger {
    async fn commit(&self, agreement: &Agreement, reputation: &[ReputationDelta]) -> Result<CommitReceipt> {
        check_agreement_hash(agreement)?;
        let quantity = i64::try_from(agreement.terms.quantity)
            .map_err(|_| NegotiationError::Validation("Quantity exceeds ledger range".to_string()))?;
        let committed_at = Utc::now();

        let mut tx = self.pool.begin().await.map_err(classify)?;

        let inserted = sqlx::query(
            r#"
            INSERT OR IGNORE INTO ledger_entries (agreement_hash, buyer, supplier, item, quantity, proof_ref, committed_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&agreement.hash)
        .bind(agreement.terms.buyer.as_str())
        .bind(agreement.terms.supplier.as_str())
        .bind(&agreement.terms.item)
        .bind(quantity)
        .bind(&agreement.terms.proof_ref)
        .bind(committed_at)
        .execute(&mut *tx)
        .await
        .map_err(classify)?;

        if inserted.rows_affected() == 0 {
            tx.rollback().await.map_err(classify)?;
            return Err(NegotiationError::DuplicateCommit(agreement.hash.clone()));
        }
        let sequence = inserted.last_insert_rowid() as u64;

        for delta in reputation {
            let recorded = sqlx::query(
                "INSERT OR IGNORE INTO reputation_events (agreement_hash, did, delta) VALUES (?, ?, ?)",
            )
            .bind(&agreement.hash)
            .bind(delta.agent.as_str())
            .bind(delta.delta)
            .execute(&mut *tx)
            .await
            .map_err(classify)?;

            if recorded.rows_affected() == 1 {
                sqlx::query(
                    r#"
                    INSERT INTO reputation (did, score) VALUES (?, ?)
                    ON CONFLICT(did) DO UPDATE SET score = score + excluded.score
                    "#,
                )
                .bind(delta.agent.as_str())
                .bind(delta.delta)
                .execute(&mut *tx)
                .await
                .map_err(classify)?;
            }
        }

        tx.commit().await.map_err(classify)?;

        tracing::info!(hash = %agreement.hash, sequence, "Agreement committed to SQLite ledger");
        Ok(CommitReceipt {
            agreement_hash: agreement.hash.clone(),
            sequence,
            committed_at,
        })
    }

    async fn entry(&self, agreement_hash: &str) -> Result<Option<LedgerEntry>> {
        let row = sqlx::query(
            r#"
            SELECT sequence, agreement_hash, buyer, supplier, item, quantity, proof_ref, committed_at
            FROM ledger_entries WHERE agreement_hash = ?
            "#,
        )
        .bind(agreement_hash)
        .fetch_optional(&self.pool)
        .await
        .map_err(classify)?;

        row.as_ref().map(entry_from_row).transpose()
    }

    async fn entries(&self) -> Result<Vec<LedgerEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT sequence, agreement_hash, buyer, supplier, item, quantity, proof_ref, committed_at
            FROM ledger_entries ORDER BY sequence ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(classify)?;

        rows.iter().map(entry_from_row).collect()
    }

    async fn reputation(&self, agent: &Did) -> Result<ReputationScore> {
        let score: Option<i64> = sqlx::query_scalar("SELECT score FROM reputation WHERE did = ?")
            .bind(agent.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(classify)?;

        Ok(ReputationScore {
            agent: agent.clone(),
            score: score.unwrap_or(0),
        })
    }

    async fn len(&self) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM ledger_entries")
            .fetch_one(&self.pool)
            .await
            .map_err(classify)?;
        Ok(count as u64)
    }
}
