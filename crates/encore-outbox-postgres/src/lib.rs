//! PostgreSQL implementation of the encore durable outbox.
//!
//! This crate persists dispatched envelopes as job rows for an out-of-process
//! worker, implementing the `DurableDispatcher` trait from `encore-core`.
//!
//! # Features
//!
//! - Idempotent enqueue keyed by envelope id (`ON CONFLICT DO NOTHING`)
//! - Optimistic claiming with `FOR UPDATE SKIP LOCKED`
//! - Exponential backoff retry logic
//! - Dead letter state for permanently failed deliveries
//! - Configurable lease timeouts with lease reclaim
//!
//! # Database Schema
//!
//! ```sql
//! CREATE TYPE outbox_status AS ENUM ('pending', 'running', 'delivered', 'dead_letter');
//!
//! CREATE TABLE mutation_outbox_jobs (
//!     id BIGSERIAL PRIMARY KEY,
//!     envelope_id UUID NOT NULL UNIQUE,
//!     kind TEXT NOT NULL,
//!     topic TEXT NOT NULL,
//!     queue_class TEXT NOT NULL DEFAULT 'default',
//!     envelope JSONB NOT NULL,
//!
//!     -- Execution
//!     status outbox_status NOT NULL DEFAULT 'pending',
//!     attempt INTEGER NOT NULL DEFAULT 1,
//!     max_retries INTEGER NOT NULL DEFAULT 3,
//!
//!     -- Scheduling
//!     run_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
//!
//!     -- Worker tracking
//!     worker_id TEXT,
//!     lease_expires_at TIMESTAMPTZ,
//!
//!     -- Error tracking
//!     error_message TEXT,
//!
//!     -- Timestamps
//!     created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
//!     updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
//! );
//!
//! CREATE INDEX idx_outbox_ready ON mutation_outbox_jobs (queue_class, run_at)
//!     WHERE status = 'pending';
//! CREATE INDEX idx_outbox_lease ON mutation_outbox_jobs (lease_expires_at)
//!     WHERE status = 'running' AND lease_expires_at IS NOT NULL;
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use encore_outbox_postgres::PgOutboxStore;
//! use sqlx::PgPool;
//!
//! let pool = PgPool::connect("postgres://localhost/mydb").await?;
//! let store = Arc::new(PgOutboxStore::new(pool));
//!
//! let runtime = Runtime::builder(registry).durable(store).build();
//! ```

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use encore_core::error::DispatchError;
use encore_core::outbox::{DurableDispatcher, EmitReceipt, MUTATION_DISPATCH_KIND};
use encore_core::payload::Envelope;
use encore_core::topic::TopicPolicy;
use sqlx::{PgPool, Row};
use uuid::Uuid;

/// PostgreSQL outbox store.
#[derive(Clone)]
pub struct PgOutboxStore {
    pool: PgPool,
    default_lease_ms: i64,
}

impl PgOutboxStore {
    /// Create a new PostgreSQL outbox store.
    ///
    /// # Default Settings
    ///
    /// - Lease timeout: 60 seconds
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            default_lease_ms: 60_000,
        }
    }

    /// Create an outbox store with a custom lease timeout.
    ///
    /// The lease timeout determines how long a worker can hold a claimed
    /// envelope before it's considered abandoned.
    pub fn with_lease_timeout(pool: PgPool, lease_ms: i64) -> Self {
        Self {
            pool,
            default_lease_ms: lease_ms,
        }
    }

    /// Get the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl DurableDispatcher for PgOutboxStore {
    /// Persist an envelope as a pending job.
    ///
    /// Enqueueing the same envelope id twice is not an error; the second call
    /// returns a duplicate receipt and writes nothing.
    async fn dispatch_durable(
        &self,
        envelope: &Envelope,
        policy: &TopicPolicy,
    ) -> Result<EmitReceipt, DispatchError> {
        let raw = serde_json::to_value(envelope)
            .map_err(|err| DispatchError::Envelope(encore_core::error::CodecError::Encode(err)))?;

        let row = sqlx::query(
            r#"
            INSERT INTO mutation_outbox_jobs (envelope_id, kind, topic, queue_class, envelope)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (envelope_id) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(envelope.id)
        .bind(MUTATION_DISPATCH_KIND)
        .bind(&envelope.topic)
        .bind(&policy.queue_class)
        .bind(raw)
        .fetch_optional(&self.pool)
        .await
        .map_err(|err| DispatchError::Enqueue(err.into()))?;

        Ok(EmitReceipt {
            envelope_id: envelope.id,
            topic: envelope.topic.clone(),
            queue_class: policy.queue_class.clone(),
            job_id: row.as_ref().map(|r| r.get("id")),
            duplicate: row.is_none(),
        })
    }
}

/// An envelope claimed by a worker for delivery.
#[derive(Debug, Clone)]
pub struct ClaimedEnvelope {
    pub job_id: i64,
    pub envelope: Envelope,
    pub attempt: i32,
}

/// Worker-side operations.
impl PgOutboxStore {
    /// Claim ready envelopes for delivery.
    ///
    /// Uses `FOR UPDATE SKIP LOCKED` so concurrent workers never contend for
    /// the same row.
    pub async fn claim_ready(&self, worker_id: &str, limit: i64) -> Result<Vec<ClaimedEnvelope>> {
        let lease_expires_at = Utc::now() + Duration::milliseconds(self.default_lease_ms);

        let rows = sqlx::query(
            r#"
            WITH claimable AS (
                SELECT id
                FROM mutation_outbox_jobs
                WHERE status = 'pending'
                  AND run_at <= NOW()
                ORDER BY run_at ASC
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE mutation_outbox_jobs
            SET status = 'running',
                worker_id = $2,
                lease_expires_at = $3,
                updated_at = NOW()
            WHERE id IN (SELECT id FROM claimable)
            RETURNING id, envelope, attempt
            "#,
        )
        .bind(limit)
        .bind(worker_id)
        .bind(lease_expires_at)
        .fetch_all(&self.pool)
        .await?;

        let mut claimed = Vec::with_capacity(rows.len());
        for row in rows {
            let raw: serde_json::Value = row.get("envelope");
            let envelope: Envelope = serde_json::from_value(raw)?;
            claimed.push(ClaimedEnvelope {
                job_id: row.get("id"),
                envelope,
                attempt: row.get("attempt"),
            });
        }

        Ok(claimed)
    }

    /// Mark a claimed envelope as delivered.
    pub async fn mark_delivered(&self, job_id: i64) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE mutation_outbox_jobs
            SET status = 'delivered',
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(job_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Mark a claimed envelope as failed.
    ///
    /// # Retry Logic
    ///
    /// - Retryable failures: schedules a retry with exponential backoff
    ///   (2^attempt seconds, max 1 hour)
    /// - Non-retryable failures or exhausted retries: moves to dead letter
    pub async fn mark_failed(&self, job_id: i64, error: &str, retryable: bool) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let job = sqlx::query(
            "SELECT attempt, max_retries FROM mutation_outbox_jobs WHERE id = $1 FOR UPDATE",
        )
        .bind(job_id)
        .fetch_one(&mut *tx)
        .await?;

        let attempt: i32 = job.get("attempt");
        let max_retries: i32 = job.get("max_retries");

        if retryable && attempt < max_retries {
            let delay_secs = 2i64.pow(attempt as u32).min(3600);
            let retry_at = Utc::now() + Duration::seconds(delay_secs);

            sqlx::query(
                r#"
                UPDATE mutation_outbox_jobs
                SET status = 'pending',
                    run_at = $1,
                    attempt = attempt + 1,
                    error_message = $2,
                    worker_id = NULL,
                    lease_expires_at = NULL,
                    updated_at = NOW()
                WHERE id = $3
                "#,
            )
            .bind(retry_at)
            .bind(error)
            .bind(job_id)
            .execute(&mut *tx)
            .await?;
        } else {
            sqlx::query(
                r#"
                UPDATE mutation_outbox_jobs
                SET status = 'dead_letter',
                    error_message = $1,
                    updated_at = NOW()
                WHERE id = $2
                "#,
            )
            .bind(error)
            .bind(job_id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Extend the lease for a running delivery.
    ///
    /// Workers should call this periodically for slow listeners to keep the
    /// claim from being reclaimed.
    pub async fn heartbeat(&self, job_id: i64) -> Result<()> {
        let lease_expires_at = Utc::now() + Duration::milliseconds(self.default_lease_ms);

        sqlx::query(
            r#"
            UPDATE mutation_outbox_jobs
            SET lease_expires_at = $1,
                updated_at = NOW()
            WHERE id = $2 AND status = 'running'
            "#,
        )
        .bind(lease_expires_at)
        .bind(job_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

/// Maintenance operations.
impl PgOutboxStore {
    /// Reclaim abandoned deliveries (lease expired).
    ///
    /// This should be run periodically by a maintenance worker.
    pub async fn reclaim_expired(&self) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE mutation_outbox_jobs
            SET status = 'pending',
                worker_id = NULL,
                lease_expires_at = NULL,
                updated_at = NOW()
            WHERE status = 'running'
              AND lease_expires_at < NOW()
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Clean up old delivered envelopes.
    ///
    /// # Arguments
    ///
    /// * `older_than` - Delete rows delivered before this timestamp
    pub async fn cleanup_delivered(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM mutation_outbox_jobs
            WHERE status = 'delivered'
              AND updated_at < $1
            "#,
        )
        .bind(older_than)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Look up the job id for an envelope, if one exists.
    pub async fn job_for_envelope(&self, envelope_id: Uuid) -> Result<Option<i64>> {
        let row = sqlx::query("SELECT id FROM mutation_outbox_jobs WHERE envelope_id = $1")
            .bind(envelope_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|r| r.get("id")))
    }

    /// Get statistics about outbox health.
    pub async fn stats(&self) -> Result<OutboxStats> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status = 'pending') as pending,
                COUNT(*) FILTER (WHERE status = 'running') as running,
                COUNT(*) FILTER (WHERE status = 'delivered') as delivered,
                COUNT(*) FILTER (WHERE status = 'dead_letter') as dead_letter
            FROM mutation_outbox_jobs
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(OutboxStats {
            pending: row.get("pending"),
            running: row.get("running"),
            delivered: row.get("delivered"),
            dead_letter: row.get("dead_letter"),
        })
    }
}

/// Outbox statistics.
#[derive(Debug, Clone, Copy)]
pub struct OutboxStats {
    pub pending: i64,
    pub running: i64,
    pub delivered: i64,
    pub dead_letter: i64,
}
