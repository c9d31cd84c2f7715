//! Durable invocation queue.
//!
//! The store is the only shared mutable resource in the scheduler. All
//! mutations are compare-and-set on the row's `version`; a lost race is a
//! signal (`None` / `false`), not an error. Transient outages surface as
//! [`StoreError::Unavailable`] and the dispatch loop retries next cycle.

mod memory;
mod postgres;

pub use memory::MemoryInvocationStore;
pub use postgres::PostgresInvocationStore;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::StoreError;
use crate::invocation::{ExecutionResult, Invocation, InvocationStatus};
use crate::payload::Payload;

pub type StoreResult<T> = Result<T, StoreError>;

/// Per-job queue occupancy and terminal result counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct JobStatistics {
    pub job_name: String,
    pub queued: i64,
    pub dequeued: i64,
    pub executing: i64,
    pub suspended: i64,
    pub cancelled: i64,
    pub completed: i64,
    pub faulted: i64,
    pub crashed: i64,
    pub aborted: i64,
}

/// Per-instance dispatch counters, attributed to the last lease holder.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct WorkerStatistics {
    pub instance: String,
    pub dequeues: i64,
    pub completes: i64,
    pub faults: i64,
    pub crashes: i64,
    pub cancels: i64,
}

/// Durable at-most-one-consumer queue over invocations.
#[async_trait]
pub trait InvocationStore: Send + Sync {
    /// Insert a fresh `Queued` row visible at `now + visibility_delay`.
    async fn enqueue(
        &self,
        job_name: &str,
        source: &str,
        payload: Payload,
        visibility_delay: Duration,
    ) -> StoreResult<Invocation>;

    /// Atomically lease one eligible row for `invisibility`, recording
    /// `instance` as the lease holder.
    ///
    /// Selection is ascending `next_visible_at`, ties broken by ascending
    /// `queued_at`. Returns `None` when nothing is eligible or the token
    /// fired before a row was leased.
    async fn dequeue(
        &self,
        instance: &str,
        invisibility: Duration,
        cancel: &CancellationToken,
    ) -> StoreResult<Option<Invocation>>;

    /// Compare-and-set the status/result pair against `inv.version`.
    ///
    /// Returns the updated row, or `None` when the version advanced since
    /// the caller's snapshot; the caller was raced out by another actor.
    async fn update_status(
        &self,
        inv: &Invocation,
        status: InvocationStatus,
        result: ExecutionResult,
    ) -> StoreResult<Option<Invocation>>;

    /// Commit a terminal result. Returns `false` when the version advanced
    /// (a late commit after lease expiry); the loss is silent by contract.
    async fn complete(
        &self,
        inv: &Invocation,
        result: ExecutionResult,
        message: Option<String>,
        log_url: Option<String>,
    ) -> StoreResult<bool>;

    /// Park `inv` as a suspended predecessor and insert its continuation
    /// row, visible after `wait`. Returns the continuation, or `None` on a
    /// version conflict.
    async fn suspend(
        &self,
        inv: &Invocation,
        continuation_payload: Payload,
        wait: Duration,
        log_url: Option<String>,
    ) -> StoreResult<Option<Invocation>>;

    /// Push the lease out by `additional`, never past the configured hard
    /// cap. No-op (returns `None`) on terminal rows or version conflicts.
    async fn extend(&self, inv: &Invocation, additional: Duration) -> StoreResult<Option<Invocation>>;

    /// Cancel a row that has not started executing. Returns whether a row
    /// was cancelled.
    async fn cancel(&self, id: Uuid) -> StoreResult<bool>;

    async fn get(&self, id: Uuid) -> StoreResult<Option<Invocation>>;

    /// Invocations for a job, newest first, optionally bounded to a
    /// `queued_at` window.
    async fn get_by_job(
        &self,
        job_name: &str,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
        limit: Option<i64>,
    ) -> StoreResult<Vec<Invocation>>;

    /// Most recent invocation for a job, any status.
    async fn get_latest_for_job(&self, job_name: &str) -> StoreResult<Option<Invocation>>;

    async fn get_job_statistics(&self) -> StoreResult<Vec<JobStatistics>>;

    async fn get_worker_statistics(&self) -> StoreResult<Vec<WorkerStatistics>>;

    /// Crashed-worker repair: rows leased by `instance_name` that are
    /// still `Dequeued`/`Executing` go back to `Queued`, visible now.
    /// Returns the number of repaired rows.
    async fn reinitialize(&self, instance_name: &str) -> StoreResult<u64>;
}
