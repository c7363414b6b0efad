//! PostgreSQL ledger implementation.
//!
//! Production backend using sqlx with:
//! - Append-only `usage_events` / `outcome_events` tables indexed on
//!   `(model, recorded_at)` so windowed sums stay cheap
//! - Transactional outcome recording: the event insert and the aggregate
//!   counter bump commit together or not at all
//! - `INSERT .. ON CONFLICT` upserts that preserve history and counters
//! - Connection pooling via sqlx

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPool;
use sqlx::Row;

use crate::error::{Result, SwitchboardError};
use crate::types::{
    Model, ModelAvailability, ModelDescriptor, OutcomeRecord, PruneReport, UsageSnapshot,
    DAY_WINDOW_SECS, MINUTE_WINDOW_SECS, OUTCOME_RETENTION_SECS, USAGE_RETENTION_SECS,
};

use super::QuotaLedger;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS models (
    name TEXT PRIMARY KEY,
    origin TEXT NOT NULL,
    rank INTEGER NOT NULL,
    description TEXT NOT NULL DEFAULT '',
    enabled BOOLEAN NOT NULL DEFAULT TRUE,
    rpm_allowed BIGINT NOT NULL,
    tpm_total BIGINT NOT NULL,
    rpd_total BIGINT NOT NULL,
    tpd_total BIGINT NOT NULL,
    successful_tasks BIGINT NOT NULL DEFAULT 0,
    failed_tasks BIGINT NOT NULL DEFAULT 0,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE TABLE IF NOT EXISTS usage_events (
    id BIGSERIAL PRIMARY KEY,
    model TEXT NOT NULL,
    requests BIGINT NOT NULL,
    tokens BIGINT NOT NULL,
    recorded_at TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE INDEX IF NOT EXISTS usage_events_model_recorded_at
    ON usage_events (model, recorded_at);

CREATE TABLE IF NOT EXISTS outcome_events (
    id BIGSERIAL PRIMARY KEY,
    model TEXT NOT NULL,
    task_type TEXT NOT NULL,
    success BOOLEAN NOT NULL,
    error_message TEXT,
    tokens_used BIGINT NOT NULL,
    recorded_at TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE INDEX IF NOT EXISTS outcome_events_model_recorded_at
    ON outcome_events (model, recorded_at);
"#;

/// PostgreSQL ledger backend.
///
/// # Example
/// ```ignore
/// let pool = PgPool::connect("postgresql://localhost/switchboard").await?;
/// let ledger = PostgresLedger::new(pool);
/// ledger.ensure_schema().await?;
/// ```
#[derive(Clone)]
pub struct PostgresLedger {
    pool: PgPool,
}

impl PostgresLedger {
    /// Create a new ledger over an existing connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect to the given database URL and bootstrap the schema.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = PgPool::connect(url)
            .await
            .map_err(|e| SwitchboardError::Other(anyhow!("failed to connect to database: {e}")))?;
        let ledger = Self::new(pool);
        ledger.ensure_schema().await?;
        Ok(ledger)
    }

    /// Create the ledger tables and indexes if they do not exist yet.
    pub async fn ensure_schema(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(|e| SwitchboardError::Other(anyhow!("failed to create schema: {e}")))?;
        Ok(())
    }

    /// Get the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn usage_snapshot(&self, model: &str, now: DateTime<Utc>) -> Result<UsageSnapshot> {
        let minute_cutoff = now - chrono::Duration::seconds(MINUTE_WINDOW_SECS);
        let day_cutoff = now - chrono::Duration::seconds(DAY_WINDOW_SECS);

        let row = sqlx::query(
            r#"
            SELECT
                COALESCE(SUM(requests) FILTER (WHERE recorded_at >= $2), 0)::BIGINT AS requests_minute,
                COALESCE(SUM(tokens)   FILTER (WHERE recorded_at >= $2), 0)::BIGINT AS tokens_minute,
                COALESCE(SUM(requests), 0)::BIGINT AS requests_day,
                COALESCE(SUM(tokens),   0)::BIGINT AS tokens_day
            FROM usage_events
            WHERE model = $1 AND recorded_at >= $3
            "#,
        )
        .bind(model)
        .bind(minute_cutoff)
        .bind(day_cutoff)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| SwitchboardError::Other(anyhow!("failed to query usage: {e}")))?;

        Ok(UsageSnapshot {
            requests_minute: row
                .try_get::<i64, _>("requests_minute")
                .map_err(|e| SwitchboardError::Other(anyhow!("bad usage row: {e}")))?
                as u32,
            tokens_minute: row
                .try_get::<i64, _>("tokens_minute")
                .map_err(|e| SwitchboardError::Other(anyhow!("bad usage row: {e}")))?
                as u64,
            requests_day: row
                .try_get::<i64, _>("requests_day")
                .map_err(|e| SwitchboardError::Other(anyhow!("bad usage row: {e}")))?
                as u32,
            tokens_day: row
                .try_get::<i64, _>("tokens_day")
                .map_err(|e| SwitchboardError::Other(anyhow!("bad usage row: {e}")))?
                as u64,
        })
    }
}

fn model_from_row(row: &sqlx::postgres::PgRow) -> Result<Model> {
    let get_err = |e: sqlx::Error| SwitchboardError::Other(anyhow!("bad model row: {e}"));

    Ok(Model {
        name: row.try_get("name").map_err(get_err)?,
        origin: row.try_get("origin").map_err(get_err)?,
        rank: row.try_get::<i32, _>("rank").map_err(get_err)?,
        description: row.try_get("description").map_err(get_err)?,
        enabled: row.try_get("enabled").map_err(get_err)?,
        rpm_allowed: row.try_get::<i64, _>("rpm_allowed").map_err(get_err)? as u32,
        tpm_total: row.try_get::<i64, _>("tpm_total").map_err(get_err)? as u64,
        rpd_total: row.try_get::<i64, _>("rpd_total").map_err(get_err)? as u32,
        tpd_total: row.try_get::<i64, _>("tpd_total").map_err(get_err)? as u64,
        successful_tasks: row.try_get::<i64, _>("successful_tasks").map_err(get_err)? as u64,
        failed_tasks: row.try_get::<i64, _>("failed_tasks").map_err(get_err)? as u64,
        created_at: row.try_get("created_at").map_err(get_err)?,
        updated_at: row.try_get("updated_at").map_err(get_err)?,
    })
}

impl QuotaLedger for PostgresLedger {
    async fn upsert_models(&self, descriptors: Vec<ModelDescriptor>) -> Result<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| SwitchboardError::Other(anyhow!("failed to begin upsert: {e}")))?;

        for descriptor in descriptors {
            sqlx::query(
                r#"
                INSERT INTO models (
                    name, origin, rank, description, enabled,
                    rpm_allowed, tpm_total, rpd_total, tpd_total
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                ON CONFLICT (name) DO UPDATE SET
                    origin = EXCLUDED.origin,
                    rank = EXCLUDED.rank,
                    description = EXCLUDED.description,
                    enabled = EXCLUDED.enabled,
                    rpm_allowed = EXCLUDED.rpm_allowed,
                    tpm_total = EXCLUDED.tpm_total,
                    rpd_total = EXCLUDED.rpd_total,
                    tpd_total = EXCLUDED.tpd_total,
                    updated_at = now()
                "#,
            )
            .bind(&descriptor.name)
            .bind(&descriptor.origin)
            .bind(descriptor.rank)
            .bind(&descriptor.description)
            .bind(descriptor.enabled)
            .bind(descriptor.rpm_allowed as i64)
            .bind(descriptor.tpm_total as i64)
            .bind(descriptor.rpd_total as i64)
            .bind(descriptor.tpd_total as i64)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                SwitchboardError::Other(anyhow!("failed to upsert model {}: {e}", descriptor.name))
            })?;
        }

        tx.commit()
            .await
            .map_err(|e| SwitchboardError::Other(anyhow!("failed to commit upsert: {e}")))?;
        Ok(())
    }

    async fn record_usage(&self, model: &str, requests: u32, tokens: u64) -> Result<()> {
        sqlx::query("INSERT INTO usage_events (model, requests, tokens) VALUES ($1, $2, $3)")
            .bind(model)
            .bind(requests as i64)
            .bind(tokens as i64)
            .execute(&self.pool)
            .await
            .map_err(|e| SwitchboardError::Other(anyhow!("failed to record usage: {e}")))?;
        Ok(())
    }

    async fn record_outcome(&self, outcome: OutcomeRecord) -> Result<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| SwitchboardError::Other(anyhow!("failed to begin outcome: {e}")))?;

        let counter = if outcome.success {
            "successful_tasks"
        } else {
            "failed_tasks"
        };
        let updated = sqlx::query(&format!(
            "UPDATE models SET {counter} = {counter} + 1, updated_at = now() WHERE name = $1"
        ))
        .bind(&outcome.model)
        .execute(&mut *tx)
        .await
        .map_err(|e| SwitchboardError::Other(anyhow!("failed to update counters: {e}")))?
        .rows_affected();

        if updated == 0 {
            return Err(SwitchboardError::ModelNotFound(outcome.model));
        }

        sqlx::query(
            r#"
            INSERT INTO outcome_events (model, task_type, success, error_message, tokens_used)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(&outcome.model)
        .bind(&outcome.task_type)
        .bind(outcome.success)
        .bind(&outcome.error_message)
        .bind(outcome.tokens_used as i64)
        .execute(&mut *tx)
        .await
        .map_err(|e| SwitchboardError::Other(anyhow!("failed to record outcome: {e}")))?;

        tx.commit()
            .await
            .map_err(|e| SwitchboardError::Other(anyhow!("failed to commit outcome: {e}")))?;
        Ok(())
    }

    async fn get_usage(&self, model: &str) -> Result<UsageSnapshot> {
        self.usage_snapshot(model, Utc::now()).await
    }

    async fn list_available(&self, min_tokens: u64) -> Result<Vec<ModelAvailability>> {
        let now = Utc::now();

        let rows = sqlx::query("SELECT * FROM models WHERE enabled ORDER BY rank ASC, name ASC")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| SwitchboardError::Other(anyhow!("failed to list models: {e}")))?;

        let mut available = Vec::with_capacity(rows.len());
        for row in &rows {
            let model = model_from_row(row)?;
            let usage = self.usage_snapshot(&model.name, now).await?;
            let candidate = ModelAvailability { model, usage };
            if candidate.has_capacity_for(min_tokens) {
                available.push(candidate);
            }
        }

        Ok(available)
    }

    async fn failure_rate(&self, model: &str, window: std::time::Duration) -> Result<f64> {
        let cutoff = Utc::now() - chrono::Duration::seconds(window.as_secs() as i64);

        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) AS total,
                COUNT(*) FILTER (WHERE NOT success) AS failed
            FROM outcome_events
            WHERE model = $1 AND recorded_at >= $2
            "#,
        )
        .bind(model)
        .bind(cutoff)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| SwitchboardError::Other(anyhow!("failed to query failure rate: {e}")))?;

        let total: i64 = row
            .try_get("total")
            .map_err(|e| SwitchboardError::Other(anyhow!("bad failure-rate row: {e}")))?;
        let failed: i64 = row
            .try_get("failed")
            .map_err(|e| SwitchboardError::Other(anyhow!("bad failure-rate row: {e}")))?;

        if total == 0 {
            return Ok(0.0);
        }
        Ok(failed as f64 / total as f64 * 100.0)
    }

    async fn get_model(&self, name: &str) -> Result<Option<Model>> {
        let row = sqlx::query("SELECT * FROM models WHERE name = $1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| SwitchboardError::Other(anyhow!("failed to get model: {e}")))?;

        row.as_ref().map(model_from_row).transpose()
    }

    async fn list_models(&self) -> Result<Vec<Model>> {
        let rows = sqlx::query("SELECT * FROM models ORDER BY rank ASC, name ASC")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| SwitchboardError::Other(anyhow!("failed to list models: {e}")))?;

        rows.iter().map(model_from_row).collect()
    }

    async fn prune_expired(&self) -> Result<PruneReport> {
        let now = Utc::now();
        let usage_cutoff = now - chrono::Duration::seconds(USAGE_RETENTION_SECS);
        let outcome_cutoff = now - chrono::Duration::seconds(OUTCOME_RETENTION_SECS);

        let usage_removed = sqlx::query("DELETE FROM usage_events WHERE recorded_at < $1")
            .bind(usage_cutoff)
            .execute(&self.pool)
            .await
            .map_err(|e| SwitchboardError::Other(anyhow!("failed to prune usage events: {e}")))?
            .rows_affected();

        let outcomes_removed = sqlx::query("DELETE FROM outcome_events WHERE recorded_at < $1")
            .bind(outcome_cutoff)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                SwitchboardError::Other(anyhow!("failed to prune outcome events: {e}"))
            })?
            .rows_affected();

        Ok(PruneReport {
            usage_events_removed: usage_removed,
            outcome_events_removed: outcomes_removed,
        })
    }
}
