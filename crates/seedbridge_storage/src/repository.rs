use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;
use tracing::{debug, info};

const SCHEMA_SQL: &str = include_str!("sql/schema.sql");

const STATUS_CLAIMED: &str = "claimed";
const STATUS_FETCHED: &str = "fetched";
const STATUS_DOWNLOADED: &str = "downloaded";

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub sqlite_path: String,
}

/// Result of a single atomic claim attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClaimOutcome {
    Claimed,
    AlreadyClaimed,
    AlreadyDownloaded,
}

/// Durable claim states. A transfer with no record is unclaimed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClaimState {
    Claimed,
    /// Files are on local disk; cleanup has not run yet.
    Fetched,
    Downloaded,
}

impl ClaimState {
    fn from_column(raw: &str) -> Self {
        match raw {
            STATUS_DOWNLOADED => Self::Downloaded,
            STATUS_FETCHED => Self::Fetched,
            _ => Self::Claimed,
        }
    }
}

/// Serializes work on a transfer across every poller sharing the store.
#[async_trait]
pub trait ClaimStore: Send + Sync {
    /// Atomically moves `transfer_id` from unclaimed to claimed.
    async fn claim_transfer(&self, transfer_id: &str) -> Result<ClaimOutcome>;

    /// Records that the transfer's files were written locally. Only a
    /// `claimed` record moves; returns `false` otherwise.
    async fn mark_fetched(&self, transfer_id: &str) -> Result<bool>;

    /// Moves a claim to the terminal downloaded state. Returns `false` when it
    /// was already there.
    async fn mark_downloaded(&self, transfer_id: &str) -> Result<bool>;

    /// Drops a claim that never reached downloaded, making the transfer
    /// claimable again.
    async fn release_claim(&self, transfer_id: &str) -> Result<bool>;

    async fn claim_state(&self, transfer_id: &str) -> Result<Option<ClaimState>>;
}

#[derive(Debug, Clone)]
pub struct SqliteClaimStore {
    pool: SqlitePool,
}

impl SqliteClaimStore {
    pub async fn connect(config: &StorageConfig) -> Result<Self> {
        let uri = normalize_sqlite_uri(&config.sqlite_path);
        let in_memory = uri.contains(":memory:");
        let mut options = SqliteConnectOptions::from_str(&uri)
            .with_context(|| format!("invalid sqlite URI: {}", uri))?
            .create_if_missing(true);
        if !in_memory {
            options = options.journal_mode(SqliteJournalMode::Wal);
        }

        // An in-memory database lives exactly as long as its one connection.
        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };

        let pool = pool_options
            .connect_with(options)
            .await
            .context("failed to connect sqlite pool")?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<()> {
        for statement in SCHEMA_SQL.split(';') {
            let sql = statement.trim();
            if sql.is_empty() {
                continue;
            }
            sqlx::query(sql)
                .execute(&self.pool)
                .await
                .with_context(|| format!("migration failed for statement: {sql}"))?;
        }
        info!("claim store schema ready");
        Ok(())
    }
}

#[async_trait]
impl ClaimStore for SqliteClaimStore {
    async fn claim_transfer(&self, transfer_id: &str) -> Result<ClaimOutcome> {
        let now = Utc::now().to_rfc3339();
        let inserted = sqlx::query(
            "INSERT INTO transfer_claims(transfer_id, status, claimed_at, updated_at) VALUES (?, ?, ?, ?) ON CONFLICT(transfer_id) DO NOTHING",
        )
        .bind(transfer_id)
        .bind(STATUS_CLAIMED)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await
        .with_context(|| format!("claim transfer {transfer_id}"))?;

        if inserted.rows_affected() == 1 {
            debug!(transfer_id = %transfer_id, "transfer claimed");
            return Ok(ClaimOutcome::Claimed);
        }

        // States only move forward from claimed, so the loser can read the
        // winner's state without racing it.
        let state = self.claim_state(transfer_id).await?;
        Ok(match state {
            Some(ClaimState::Downloaded) => ClaimOutcome::AlreadyDownloaded,
            _ => ClaimOutcome::AlreadyClaimed,
        })
    }

    async fn mark_fetched(&self, transfer_id: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE transfer_claims SET status = ?, updated_at = ? WHERE transfer_id = ? AND status = ?",
        )
        .bind(STATUS_FETCHED)
        .bind(Utc::now().to_rfc3339())
        .bind(transfer_id)
        .bind(STATUS_CLAIMED)
        .execute(&self.pool)
        .await
        .with_context(|| format!("mark transfer {transfer_id} fetched"))?;
        Ok(result.rows_affected() > 0)
    }

    async fn mark_downloaded(&self, transfer_id: &str) -> Result<bool> {
        let now = Utc::now().to_rfc3339();
        let result = sqlx::query(
            "INSERT INTO transfer_claims(transfer_id, status, claimed_at, updated_at) VALUES (?, ?, ?, ?) ON CONFLICT(transfer_id) DO UPDATE SET status = excluded.status, updated_at = excluded.updated_at WHERE transfer_claims.status <> excluded.status",
        )
        .bind(transfer_id)
        .bind(STATUS_DOWNLOADED)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await
        .with_context(|| format!("mark transfer {transfer_id} downloaded"))?;
        Ok(result.rows_affected() > 0)
    }

    async fn release_claim(&self, transfer_id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM transfer_claims WHERE transfer_id = ? AND status = ?")
            .bind(transfer_id)
            .bind(STATUS_CLAIMED)
            .execute(&self.pool)
            .await
            .with_context(|| format!("release claim {transfer_id}"))?;
        Ok(result.rows_affected() > 0)
    }

    async fn claim_state(&self, transfer_id: &str) -> Result<Option<ClaimState>> {
        let status = sqlx::query_scalar::<_, String>(
            "SELECT status FROM transfer_claims WHERE transfer_id = ?",
        )
        .bind(transfer_id)
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("query claim state {transfer_id}"))?;
        Ok(status.as_deref().map(ClaimState::from_column))
    }
}

fn normalize_sqlite_uri(raw: &str) -> String {
    if raw.starts_with("sqlite:") {
        raw.to_string()
    } else if raw == ":memory:" {
        "sqlite::memory:".to_string()
    } else {
        format!("sqlite://{raw}")
    }
}
