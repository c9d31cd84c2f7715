//! PostgreSQL-backed invocation store.
//!
//! Claiming uses `FOR UPDATE SKIP LOCKED` so concurrent workers never
//! block each other on the same row; every mutation carries the `version`
//! compare-and-set in its `WHERE` clause and reports a lost race through
//! its return value.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::{InvocationStore, JobStatistics, StoreResult, WorkerStatistics};
use crate::clock::Clock;
use crate::invocation::{ExecutionResult, Invocation, InvocationStatus};
use crate::payload::Payload;

const DEFAULT_LEASE_CAP: Duration = Duration::from_secs(2 * 60 * 60);

const COLUMNS: &str = "id, job_name, source, payload, status, result, queued_at, \
     next_visible_at, updated_at, last_dequeued_at, last_suspended_at, completed_at, \
     dequeue_count, is_continuation, result_message, log_url, dequeued_by, version";

fn millis(period: Duration) -> String {
    period.as_millis().to_string()
}

pub struct PostgresInvocationStore {
    pool: PgPool,
    clock: Arc<dyn Clock>,
    lease_cap: Duration,
}

impl PostgresInvocationStore {
    pub fn new(pool: PgPool, clock: Arc<dyn Clock>) -> Self {
        Self::with_lease_cap(pool, clock, DEFAULT_LEASE_CAP)
    }

    pub fn with_lease_cap(pool: PgPool, clock: Arc<dyn Clock>, lease_cap: Duration) -> Self {
        Self {
            pool,
            clock,
            lease_cap,
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn now_plus(&self, delay: Duration) -> DateTime<Utc> {
        self.clock.now() + chrono::Duration::from_std(delay).unwrap_or(chrono::TimeDelta::MAX)
    }
}

#[async_trait]
impl InvocationStore for PostgresInvocationStore {
    async fn enqueue(
        &self,
        job_name: &str,
        source: &str,
        payload: Payload,
        visibility_delay: Duration,
    ) -> StoreResult<Invocation> {
        let now = self.clock.now();
        let sql = format!(
            r#"
            INSERT INTO invocations (
                id, job_name, source, payload, status, result,
                queued_at, next_visible_at, updated_at,
                dequeue_count, is_continuation, version
            )
            VALUES ($1, $2, $3, $4, 'queued', 'incomplete', $5, $6, $5, 0, FALSE, 0)
            RETURNING {COLUMNS}
            "#
        );

        let row = sqlx::query_as::<_, Invocation>(&sql)
            .bind(Uuid::new_v4())
            .bind(job_name)
            .bind(source)
            .bind(Json(&payload))
            .bind(now)
            .bind(self.now_plus(visibility_delay))
            .fetch_one(&self.pool)
            .await?;

        Ok(row)
    }

    async fn dequeue(
        &self,
        instance: &str,
        invisibility: Duration,
        cancel: &CancellationToken,
    ) -> StoreResult<Option<Invocation>> {
        if cancel.is_cancelled() {
            return Ok(None);
        }

        let now = self.clock.now();
        let sql = format!(
            r#"
            WITH candidate AS (
                SELECT id FROM invocations
                WHERE next_visible_at <= $1
                  AND (status = 'queued'
                       OR (status = 'suspended' AND last_suspended_at IS NULL))
                ORDER BY next_visible_at ASC, queued_at ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE invocations AS i
            SET status = 'dequeued',
                next_visible_at = GREATEST(i.next_visible_at, $1)
                    + ($2 || ' milliseconds')::INTERVAL,
                dequeue_count = i.dequeue_count + 1,
                last_dequeued_at = $1,
                dequeued_by = $3,
                version = i.version + 1,
                updated_at = $1
            FROM candidate
            WHERE i.id = candidate.id
            RETURNING i.id, i.job_name, i.source, i.payload, i.status, i.result,
                      i.queued_at, i.next_visible_at, i.updated_at, i.last_dequeued_at,
                      i.last_suspended_at, i.completed_at, i.dequeue_count,
                      i.is_continuation, i.result_message, i.log_url, i.dequeued_by,
                      i.version
            "#
        );

        let fetch = sqlx::query_as::<_, Invocation>(&sql)
            .bind(now)
            .bind(millis(invisibility))
            .bind(instance)
            .fetch_optional(&self.pool);

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Ok(None),
            row = fetch => Ok(row?),
        }
    }

    async fn update_status(
        &self,
        inv: &Invocation,
        status: InvocationStatus,
        result: ExecutionResult,
    ) -> StoreResult<Option<Invocation>> {
        let sql = format!(
            r#"
            UPDATE invocations
            SET status = $1, result = $2, version = version + 1, updated_at = $3
            WHERE id = $4 AND version = $5
            RETURNING {COLUMNS}
            "#
        );

        let row = sqlx::query_as::<_, Invocation>(&sql)
            .bind(status)
            .bind(result)
            .bind(self.clock.now())
            .bind(inv.id)
            .bind(inv.version)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row)
    }

    async fn complete(
        &self,
        inv: &Invocation,
        result: ExecutionResult,
        message: Option<String>,
        log_url: Option<String>,
    ) -> StoreResult<bool> {
        let now = self.clock.now();
        let committed = sqlx::query(
            r#"
            UPDATE invocations
            SET status = 'executed',
                result = $1,
                result_message = $2,
                log_url = COALESCE($3, log_url),
                completed_at = $4,
                updated_at = $4,
                version = version + 1
            WHERE id = $5 AND version = $6
            "#,
        )
        .bind(result)
        .bind(message)
        .bind(log_url)
        .bind(now)
        .bind(inv.id)
        .bind(inv.version)
        .execute(&self.pool)
        .await?;

        Ok(committed.rows_affected() > 0)
    }

    async fn suspend(
        &self,
        inv: &Invocation,
        continuation_payload: Payload,
        wait: Duration,
        log_url: Option<String>,
    ) -> StoreResult<Option<Invocation>> {
        let now = self.clock.now();
        let visible = self.now_plus(wait);

        let mut tx = self.pool.begin().await?;

        let parked = sqlx::query(
            r#"
            UPDATE invocations
            SET status = 'suspended',
                last_suspended_at = $1,
                log_url = COALESCE($2, log_url),
                version = version + 1,
                updated_at = $1
            WHERE id = $3 AND version = $4
            "#,
        )
        .bind(now)
        .bind(log_url)
        .bind(inv.id)
        .bind(inv.version)
        .execute(&mut *tx)
        .await?;

        if parked.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(None);
        }

        let mut parent = inv.clone();
        parent.version += 1;
        let continuation = Invocation::continuation(&parent, continuation_payload, visible, now);

        let sql = format!(
            r#"
            INSERT INTO invocations (
                id, job_name, source, payload, status, result,
                queued_at, next_visible_at, updated_at,
                dequeue_count, is_continuation, version
            )
            VALUES ($1, $2, $3, $4, 'suspended', 'incomplete', $5, $6, $5, 0, TRUE, $7)
            RETURNING {COLUMNS}
            "#
        );
        let inserted = sqlx::query_as::<_, Invocation>(&sql)
            .bind(continuation.id)
            .bind(&continuation.job_name)
            .bind(&continuation.source)
            .bind(Json(&continuation.payload))
            .bind(now)
            .bind(visible)
            .bind(continuation.version)
            .fetch_one(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(Some(inserted))
    }

    async fn extend(
        &self,
        inv: &Invocation,
        additional: Duration,
    ) -> StoreResult<Option<Invocation>> {
        let sql = format!(
            r#"
            UPDATE invocations
            SET next_visible_at = LEAST(
                    next_visible_at + ($1 || ' milliseconds')::INTERVAL,
                    $2 + ($3 || ' milliseconds')::INTERVAL
                ),
                version = version + 1,
                updated_at = $2
            WHERE id = $4 AND version = $5 AND status IN ('dequeued', 'executing')
            RETURNING {COLUMNS}
            "#
        );

        let row = sqlx::query_as::<_, Invocation>(&sql)
            .bind(millis(additional))
            .bind(self.clock.now())
            .bind(millis(self.lease_cap))
            .bind(inv.id)
            .bind(inv.version)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row)
    }

    async fn cancel(&self, id: Uuid) -> StoreResult<bool> {
        let cancelled = sqlx::query(
            r#"
            UPDATE invocations
            SET status = 'cancelled', result = 'cancelled',
                completed_at = $1, version = version + 1, updated_at = $1
            WHERE id = $2
              AND status IN ('queued', 'suspended')
              AND last_suspended_at IS NULL
            "#,
        )
        .bind(self.clock.now())
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(cancelled.rows_affected() > 0)
    }

    async fn get(&self, id: Uuid) -> StoreResult<Option<Invocation>> {
        let sql = format!("SELECT {COLUMNS} FROM invocations WHERE id = $1");
        let row = sqlx::query_as::<_, Invocation>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn get_by_job(
        &self,
        job_name: &str,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
        limit: Option<i64>,
    ) -> StoreResult<Vec<Invocation>> {
        let sql = format!(
            r#"
            SELECT {COLUMNS} FROM invocations
            WHERE lower(job_name) = lower($1)
              AND ($2::timestamptz IS NULL OR queued_at >= $2)
              AND ($3::timestamptz IS NULL OR queued_at <= $3)
            ORDER BY queued_at DESC
            LIMIT $4
            "#
        );

        let rows = sqlx::query_as::<_, Invocation>(&sql)
            .bind(job_name)
            .bind(start)
            .bind(end)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows)
    }

    async fn get_latest_for_job(&self, job_name: &str) -> StoreResult<Option<Invocation>> {
        let sql = format!(
            r#"
            SELECT {COLUMNS} FROM invocations
            WHERE lower(job_name) = lower($1)
            ORDER BY queued_at DESC
            LIMIT 1
            "#
        );

        let row = sqlx::query_as::<_, Invocation>(&sql)
            .bind(job_name)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row)
    }

    async fn get_job_statistics(&self) -> StoreResult<Vec<JobStatistics>> {
        let rows = sqlx::query_as::<_, JobStatistics>(
            r#"
            SELECT job_name,
                COUNT(*) FILTER (WHERE status = 'queued') AS queued,
                COUNT(*) FILTER (WHERE status = 'dequeued') AS dequeued,
                COUNT(*) FILTER (WHERE status = 'executing') AS executing,
                COUNT(*) FILTER (WHERE status = 'suspended') AS suspended,
                COUNT(*) FILTER (WHERE status = 'cancelled'
                                 OR (status = 'executed' AND result = 'cancelled')) AS cancelled,
                COUNT(*) FILTER (WHERE status = 'executed' AND result = 'completed') AS completed,
                COUNT(*) FILTER (WHERE status = 'executed' AND result = 'faulted') AS faulted,
                COUNT(*) FILTER (WHERE status = 'executed' AND result = 'crashed') AS crashed,
                COUNT(*) FILTER (WHERE status = 'executed' AND result = 'aborted') AS aborted
            FROM invocations
            GROUP BY job_name
            ORDER BY job_name
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    async fn get_worker_statistics(&self) -> StoreResult<Vec<WorkerStatistics>> {
        let rows = sqlx::query_as::<_, WorkerStatistics>(
            r#"
            SELECT dequeued_by AS instance,
                COALESCE(SUM(dequeue_count), 0)::BIGINT AS dequeues,
                COUNT(*) FILTER (WHERE result = 'completed') AS completes,
                COUNT(*) FILTER (WHERE result = 'faulted') AS faults,
                COUNT(*) FILTER (WHERE result = 'crashed') AS crashes,
                COUNT(*) FILTER (WHERE result IN ('aborted', 'cancelled')) AS cancels
            FROM invocations
            WHERE dequeued_by IS NOT NULL
            GROUP BY dequeued_by
            ORDER BY dequeued_by
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    async fn reinitialize(&self, instance_name: &str) -> StoreResult<u64> {
        let repaired = sqlx::query(
            r#"
            UPDATE invocations
            SET status = 'queued', next_visible_at = $1,
                version = version + 1, updated_at = $1
            WHERE dequeued_by = $2 AND status IN ('dequeued', 'executing')
            "#,
        )
        .bind(self.clock.now())
        .bind(instance_name)
        .execute(&self.pool)
        .await?;

        Ok(repaired.rows_affected())
    }
}
