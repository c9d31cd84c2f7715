//! In-memory invocation store.
//!
//! A test double with the same observable semantics as the Postgres
//! store: compare-and-set on `version`, single-consumer dequeue, the
//! two-row suspend representation. All state sits behind one mutex, which
//! also serialises concurrent dequeues the way row locking does in
//! Postgres.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::{InvocationStore, JobStatistics, StoreResult, WorkerStatistics};
use crate::clock::Clock;
use crate::invocation::{ExecutionResult, Invocation, InvocationStatus};
use crate::payload::Payload;

const DEFAULT_LEASE_CAP: Duration = Duration::from_secs(2 * 60 * 60);

pub struct MemoryInvocationStore {
    rows: Mutex<HashMap<Uuid, Invocation>>,
    clock: Arc<dyn Clock>,
    lease_cap: Duration,
}

impl MemoryInvocationStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self::with_lease_cap(clock, DEFAULT_LEASE_CAP)
    }

    pub fn with_lease_cap(clock: Arc<dyn Clock>, lease_cap: Duration) -> Self {
        Self {
            rows: Mutex::new(HashMap::new()),
            clock,
            lease_cap,
        }
    }

    /// Snapshot of every row, for assertions.
    pub fn snapshot(&self) -> Vec<Invocation> {
        self.rows
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    fn now_plus(&self, delay: Duration) -> DateTime<Utc> {
        self.clock.now() + chrono::Duration::from_std(delay).unwrap_or(chrono::TimeDelta::MAX)
    }
}

#[async_trait]
impl InvocationStore for MemoryInvocationStore {
    async fn enqueue(
        &self,
        job_name: &str,
        source: &str,
        payload: Payload,
        visibility_delay: Duration,
    ) -> StoreResult<Invocation> {
        let now = self.clock.now();
        let row = Invocation::builder()
            .job_name(job_name)
            .source(source)
            .payload(payload)
            .queued_at(now)
            .next_visible_at(self.now_plus(visibility_delay))
            .updated_at(now)
            .build();

        self.rows
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(row.id, row.clone());
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
        let mut rows = self.rows.lock().unwrap_or_else(|e| e.into_inner());

        let candidate = rows
            .values()
            .filter(|row| row.is_dequeue_eligible(now))
            .min_by_key(|row| (row.next_visible_at, row.queued_at, row.id))
            .map(|row| row.id);

        let Some(id) = candidate else {
            return Ok(None);
        };

        let row = rows.get_mut(&id).ok_or(crate::error::StoreError::NotFound(id))?;
        row.status = InvocationStatus::Dequeued;
        row.next_visible_at = row.next_visible_at.max(now)
            + chrono::Duration::from_std(invisibility).unwrap_or(chrono::TimeDelta::MAX);
        row.dequeue_count += 1;
        row.last_dequeued_at = Some(now);
        row.dequeued_by = Some(instance.to_string());
        row.version += 1;
        row.updated_at = now;
        Ok(Some(row.clone()))
    }

    async fn update_status(
        &self,
        inv: &Invocation,
        status: InvocationStatus,
        result: ExecutionResult,
    ) -> StoreResult<Option<Invocation>> {
        let now = self.clock.now();
        let mut rows = self.rows.lock().unwrap_or_else(|e| e.into_inner());
        let Some(row) = rows.get_mut(&inv.id) else {
            return Ok(None);
        };
        if row.version != inv.version {
            return Ok(None);
        }
        row.status = status;
        row.result = result;
        row.version += 1;
        row.updated_at = now;
        Ok(Some(row.clone()))
    }

    async fn complete(
        &self,
        inv: &Invocation,
        result: ExecutionResult,
        message: Option<String>,
        log_url: Option<String>,
    ) -> StoreResult<bool> {
        let now = self.clock.now();
        let mut rows = self.rows.lock().unwrap_or_else(|e| e.into_inner());
        let Some(row) = rows.get_mut(&inv.id) else {
            return Ok(false);
        };
        if row.version != inv.version {
            return Ok(false);
        }
        row.status = InvocationStatus::Executed;
        row.result = result;
        row.result_message = message;
        if log_url.is_some() {
            row.log_url = log_url;
        }
        row.completed_at = Some(now);
        row.version += 1;
        row.updated_at = now;
        Ok(true)
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
        let mut rows = self.rows.lock().unwrap_or_else(|e| e.into_inner());

        let Some(row) = rows.get_mut(&inv.id) else {
            return Ok(None);
        };
        if row.version != inv.version {
            return Ok(None);
        }
        row.status = InvocationStatus::Suspended;
        row.last_suspended_at = Some(now);
        if log_url.is_some() {
            row.log_url = log_url;
        }
        row.version += 1;
        row.updated_at = now;

        let parent = row.clone();
        let continuation = Invocation::continuation(&parent, continuation_payload, visible, now);
        rows.insert(continuation.id, continuation.clone());
        Ok(Some(continuation))
    }

    async fn extend(
        &self,
        inv: &Invocation,
        additional: Duration,
    ) -> StoreResult<Option<Invocation>> {
        let now = self.clock.now();
        let cap = now + chrono::Duration::from_std(self.lease_cap).unwrap_or(chrono::TimeDelta::MAX);
        let mut rows = self.rows.lock().unwrap_or_else(|e| e.into_inner());
        let Some(row) = rows.get_mut(&inv.id) else {
            return Ok(None);
        };
        if row.version != inv.version
            || !matches!(
                row.status,
                InvocationStatus::Dequeued | InvocationStatus::Executing
            )
        {
            return Ok(None);
        }
        let extended = row.next_visible_at
            + chrono::Duration::from_std(additional).unwrap_or(chrono::TimeDelta::MAX);
        row.next_visible_at = extended.min(cap);
        row.version += 1;
        row.updated_at = now;
        Ok(Some(row.clone()))
    }

    async fn cancel(&self, id: Uuid) -> StoreResult<bool> {
        let now = self.clock.now();
        let mut rows = self.rows.lock().unwrap_or_else(|e| e.into_inner());
        let Some(row) = rows.get_mut(&id) else {
            return Ok(false);
        };
        let cancellable = matches!(
            row.status,
            InvocationStatus::Queued | InvocationStatus::Suspended
        ) && row.last_suspended_at.is_none();
        if !cancellable {
            return Ok(false);
        }
        row.status = InvocationStatus::Cancelled;
        row.result = ExecutionResult::Cancelled;
        row.completed_at = Some(now);
        row.version += 1;
        row.updated_at = now;
        Ok(true)
    }

    async fn get(&self, id: Uuid) -> StoreResult<Option<Invocation>> {
        Ok(self
            .rows
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&id)
            .cloned())
    }

    async fn get_by_job(
        &self,
        job_name: &str,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
        limit: Option<i64>,
    ) -> StoreResult<Vec<Invocation>> {
        let rows = self.rows.lock().unwrap_or_else(|e| e.into_inner());
        let mut matched: Vec<Invocation> = rows
            .values()
            .filter(|row| row.job_name.eq_ignore_ascii_case(job_name))
            .filter(|row| start.map_or(true, |s| row.queued_at >= s))
            .filter(|row| end.map_or(true, |e| row.queued_at <= e))
            .cloned()
            .collect();
        matched.sort_by(|a, b| b.queued_at.cmp(&a.queued_at));
        if let Some(limit) = limit {
            matched.truncate(limit.max(0) as usize);
        }
        Ok(matched)
    }

    async fn get_latest_for_job(&self, job_name: &str) -> StoreResult<Option<Invocation>> {
        Ok(self
            .get_by_job(job_name, None, None, Some(1))
            .await?
            .into_iter()
            .next())
    }

    async fn get_job_statistics(&self) -> StoreResult<Vec<JobStatistics>> {
        let rows = self.rows.lock().unwrap_or_else(|e| e.into_inner());
        let mut by_job: HashMap<String, JobStatistics> = HashMap::new();
        for row in rows.values() {
            let stats = by_job
                .entry(row.job_name.clone())
                .or_insert_with(|| JobStatistics {
                    job_name: row.job_name.clone(),
                    ..JobStatistics::default()
                });
            match row.status {
                InvocationStatus::Queued => stats.queued += 1,
                InvocationStatus::Dequeued => stats.dequeued += 1,
                InvocationStatus::Executing => stats.executing += 1,
                InvocationStatus::Suspended => stats.suspended += 1,
                InvocationStatus::Cancelled => stats.cancelled += 1,
                InvocationStatus::Executed => match row.result {
                    ExecutionResult::Completed => stats.completed += 1,
                    ExecutionResult::Faulted => stats.faulted += 1,
                    ExecutionResult::Crashed => stats.crashed += 1,
                    ExecutionResult::Aborted => stats.aborted += 1,
                    ExecutionResult::Cancelled => stats.cancelled += 1,
                    ExecutionResult::Incomplete => {}
                },
            }
        }
        let mut stats: Vec<JobStatistics> = by_job.into_values().collect();
        stats.sort_by(|a, b| a.job_name.cmp(&b.job_name));
        Ok(stats)
    }

    async fn get_worker_statistics(&self) -> StoreResult<Vec<WorkerStatistics>> {
        let rows = self.rows.lock().unwrap_or_else(|e| e.into_inner());
        let mut by_instance: HashMap<String, WorkerStatistics> = HashMap::new();
        for row in rows.values() {
            let Some(instance) = &row.dequeued_by else {
                continue;
            };
            let stats = by_instance
                .entry(instance.clone())
                .or_insert_with(|| WorkerStatistics {
                    instance: instance.clone(),
                    ..WorkerStatistics::default()
                });
            stats.dequeues += i64::from(row.dequeue_count);
            match row.result {
                ExecutionResult::Completed => stats.completes += 1,
                ExecutionResult::Faulted => stats.faults += 1,
                ExecutionResult::Crashed => stats.crashes += 1,
                ExecutionResult::Aborted | ExecutionResult::Cancelled => stats.cancels += 1,
                ExecutionResult::Incomplete => {}
            }
        }
        let mut stats: Vec<WorkerStatistics> = by_instance.into_values().collect();
        stats.sort_by(|a, b| a.instance.cmp(&b.instance));
        Ok(stats)
    }

    async fn reinitialize(&self, instance_name: &str) -> StoreResult<u64> {
        let now = self.clock.now();
        let mut rows = self.rows.lock().unwrap_or_else(|e| e.into_inner());
        let mut repaired = 0;
        for row in rows.values_mut() {
            let held_here = row.dequeued_by.as_deref() == Some(instance_name);
            let stuck = matches!(
                row.status,
                InvocationStatus::Dequeued | InvocationStatus::Executing
            );
            if held_here && stuck {
                row.status = InvocationStatus::Queued;
                row.next_visible_at = now;
                row.version += 1;
                row.updated_at = now;
                repaired += 1;
            }
        }
        Ok(repaired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::invocation::SOURCE_BACKGROUND;
    use crate::testing::ManualClock;

    fn store() -> (Arc<ManualClock>, MemoryInvocationStore) {
        let clock = Arc::new(ManualClock::default());
        let store = MemoryInvocationStore::new(clock.clone());
        (clock, store)
    }

    fn token() -> CancellationToken {
        CancellationToken::new()
    }

    async fn dequeue(store: &MemoryInvocationStore) -> Option<Invocation> {
        store
            .dequeue("worker-a", Duration::from_secs(60), &token())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn enqueue_then_dequeue_leases_the_row() {
        let (_, store) = store();
        let queued = store
            .enqueue("Echo", SOURCE_BACKGROUND, Payload::new(), Duration::ZERO)
            .await
            .unwrap();

        let leased = store
            .dequeue("worker-a", Duration::from_secs(1_800), &token())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(leased.id, queued.id);
        assert_eq!(leased.status, InvocationStatus::Dequeued);
        assert_eq!(leased.dequeue_count, 1);
        assert_eq!(leased.version, queued.version + 1);
        assert_eq!(leased.dequeued_by.as_deref(), Some("worker-a"));
        assert!(leased.last_dequeued_at.is_some());
    }

    #[tokio::test]
    async fn dequeue_skips_invisible_rows() {
        let (clock, store) = store();
        store
            .enqueue("Echo", SOURCE_BACKGROUND, Payload::new(), Duration::from_secs(60))
            .await
            .unwrap();

        assert!(dequeue(&store).await.is_none());

        clock.advance(Duration::from_secs(61));
        assert!(dequeue(&store).await.is_some());
    }

    #[tokio::test]
    async fn dequeue_orders_by_visibility_then_enqueue_time() {
        let (clock, store) = store();
        let later = store
            .enqueue("B", SOURCE_BACKGROUND, Payload::new(), Duration::from_secs(30))
            .await
            .unwrap();
        clock.advance(Duration::from_secs(1));
        let earlier = store
            .enqueue("A", SOURCE_BACKGROUND, Payload::new(), Duration::ZERO)
            .await
            .unwrap();
        clock.advance(Duration::from_secs(60));

        let first = dequeue(&store).await.unwrap();
        let second = dequeue(&store).await.unwrap();

        assert_eq!(first.id, earlier.id);
        assert_eq!(second.id, later.id);
    }

    #[tokio::test]
    async fn dequeue_honours_cancellation_with_rows_available() {
        let (_, store) = store();
        store
            .enqueue("Echo", SOURCE_BACKGROUND, Payload::new(), Duration::ZERO)
            .await
            .unwrap();

        let cancel = token();
        cancel.cancel();
        assert!(store
            .dequeue("worker-a", Duration::from_secs(60), &cancel)
            .await
            .unwrap()
            .is_none());

        // The row was not leased.
        let row = store.snapshot().pop().unwrap();
        assert_eq!(row.status, InvocationStatus::Queued);
        assert_eq!(row.dequeue_count, 0);
    }

    #[tokio::test]
    async fn concurrent_dequeues_lease_exactly_once() {
        let (_, store) = store();
        let store = Arc::new(store);
        store
            .enqueue("Echo", SOURCE_BACKGROUND, Payload::new(), Duration::ZERO)
            .await
            .unwrap();

        let mut tasks = Vec::new();
        for worker in 0..8 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                store
                    .dequeue(&format!("worker-{worker}"), Duration::from_secs(60), &token())
                    .await
            }));
        }

        let mut leased = 0;
        for task in tasks {
            if task.await.unwrap().unwrap().is_some() {
                leased += 1;
            }
        }
        assert_eq!(leased, 1);
    }

    #[tokio::test]
    async fn update_status_under_contention_admits_one_winner() {
        let (_, store) = store();
        store
            .enqueue("Echo", SOURCE_BACKGROUND, Payload::new(), Duration::ZERO)
            .await
            .unwrap();
        let leased = dequeue(&store).await.unwrap();

        let winner = store
            .update_status(&leased, InvocationStatus::Executing, ExecutionResult::Incomplete)
            .await
            .unwrap();
        assert!(winner.is_some());

        // Second caller holds the stale snapshot.
        let loser = store
            .update_status(&leased, InvocationStatus::Executing, ExecutionResult::Incomplete)
            .await
            .unwrap();
        assert!(loser.is_none());
    }

    #[tokio::test]
    async fn late_commit_after_lease_steal_is_dropped() {
        let (clock, store) = store();
        store
            .enqueue("Slow", SOURCE_BACKGROUND, Payload::new(), Duration::ZERO)
            .await
            .unwrap();

        let first_lease = store
            .dequeue("worker-a", Duration::from_secs(1_800), &token())
            .await
            .unwrap()
            .unwrap();
        let executing = store
            .update_status(&first_lease, InvocationStatus::Executing, ExecutionResult::Incomplete)
            .await
            .unwrap()
            .unwrap();

        // Lease expires; a second worker steals the row.
        clock.advance(Duration::from_secs(1_900));
        let second_lease = store
            .dequeue("worker-b", Duration::from_secs(1_800), &token())
            .await
            .unwrap()
            .unwrap();

        // The first worker's terminal commit loses the version race.
        assert!(!store
            .complete(&executing, ExecutionResult::Completed, None, None)
            .await
            .unwrap());

        // The second worker's commit path wins.
        let executing2 = store
            .update_status(&second_lease, InvocationStatus::Executing, ExecutionResult::Incomplete)
            .await
            .unwrap()
            .unwrap();
        assert!(store
            .complete(&executing2, ExecutionResult::Completed, None, None)
            .await
            .unwrap());

        let row = store.snapshot().pop().unwrap();
        assert_eq!(row.status, InvocationStatus::Executed);
        assert_eq!(row.result, ExecutionResult::Completed);
    }

    #[tokio::test]
    async fn suspend_parks_parent_and_inserts_continuation() {
        let (clock, store) = store();
        store
            .enqueue("Step", SOURCE_BACKGROUND, Payload::new(), Duration::ZERO)
            .await
            .unwrap();
        let leased = dequeue(&store).await.unwrap();

        let mut next = Payload::new();
        next.set("step", "1");
        let continuation = store
            .suspend(&leased, next.clone(), Duration::from_secs(2), None)
            .await
            .unwrap()
            .unwrap();

        assert!(continuation.is_continuation);
        assert_eq!(continuation.source, leased.id_hex());
        assert_eq!(continuation.payload, next);
        assert_eq!(continuation.status, InvocationStatus::Suspended);

        let parent = store.get(leased.id).await.unwrap().unwrap();
        assert_eq!(parent.status, InvocationStatus::Suspended);
        assert!(parent.last_suspended_at.is_some());
        assert!(parent.is_terminal());

        // Only the continuation becomes dequeueable, and only after the wait.
        assert!(dequeue(&store).await.is_none());
        clock.advance(Duration::from_secs(3));
        let resumed = dequeue(&store).await.unwrap();
        assert_eq!(resumed.id, continuation.id);
    }

    #[tokio::test]
    async fn extend_pushes_lease_up_to_the_cap() {
        let clock = Arc::new(ManualClock::default());
        let store =
            MemoryInvocationStore::with_lease_cap(clock.clone(), Duration::from_secs(3_600));
        store
            .enqueue("Slow", SOURCE_BACKGROUND, Payload::new(), Duration::ZERO)
            .await
            .unwrap();
        let leased = store
            .dequeue("worker-a", Duration::from_secs(600), &token())
            .await
            .unwrap()
            .unwrap();

        let extended = store
            .extend(&leased, Duration::from_secs(600))
            .await
            .unwrap()
            .unwrap();
        assert!(extended.next_visible_at > leased.next_visible_at);

        // A huge extension clamps to now + cap.
        let clamped = store
            .extend(&extended, Duration::from_secs(86_400))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            clamped.next_visible_at,
            clock.now() + chrono::Duration::seconds(3_600)
        );
    }

    #[tokio::test]
    async fn extend_is_a_no_op_on_terminal_rows() {
        let (_, store) = store();
        store
            .enqueue("Echo", SOURCE_BACKGROUND, Payload::new(), Duration::ZERO)
            .await
            .unwrap();
        let leased = dequeue(&store).await.unwrap();
        let executing = store
            .update_status(&leased, InvocationStatus::Executing, ExecutionResult::Incomplete)
            .await
            .unwrap()
            .unwrap();
        assert!(store
            .complete(&executing, ExecutionResult::Completed, None, None)
            .await
            .unwrap());

        let terminal = store.get(leased.id).await.unwrap().unwrap();
        assert!(store
            .extend(&terminal, Duration::from_secs(60))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn cancel_only_touches_unstarted_rows() {
        let (_, store) = store();
        let queued = store
            .enqueue("Echo", SOURCE_BACKGROUND, Payload::new(), Duration::ZERO)
            .await
            .unwrap();
        assert!(store.cancel(queued.id).await.unwrap());

        let row = store.get(queued.id).await.unwrap().unwrap();
        assert_eq!(row.status, InvocationStatus::Cancelled);
        assert_eq!(row.result, ExecutionResult::Cancelled);
        assert!(row.completed_at.is_some());

        // Cancelling again, or cancelling a leased row, is a no-op.
        assert!(!store.cancel(queued.id).await.unwrap());
        let other = store
            .enqueue("Echo", SOURCE_BACKGROUND, Payload::new(), Duration::ZERO)
            .await
            .unwrap();
        dequeue(&store).await.unwrap();
        assert!(!store.cancel(other.id).await.unwrap());
    }

    #[tokio::test]
    async fn reinitialize_requeues_rows_held_by_the_instance() {
        let (_, store) = store();
        store
            .enqueue("Echo", SOURCE_BACKGROUND, Payload::new(), Duration::ZERO)
            .await
            .unwrap();
        let leased = store
            .dequeue("worker-a", Duration::from_secs(1_800), &token())
            .await
            .unwrap()
            .unwrap();
        store
            .update_status(&leased, InvocationStatus::Executing, ExecutionResult::Incomplete)
            .await
            .unwrap();

        assert_eq!(store.reinitialize("worker-b").await.unwrap(), 0);
        assert_eq!(store.reinitialize("worker-a").await.unwrap(), 1);

        let row = store.get(leased.id).await.unwrap().unwrap();
        assert_eq!(row.status, InvocationStatus::Queued);
        assert!(dequeue(&store).await.is_some());
    }

    #[tokio::test]
    async fn statistics_reflect_row_states() {
        let (_, store) = store();
        store
            .enqueue("Echo", SOURCE_BACKGROUND, Payload::new(), Duration::ZERO)
            .await
            .unwrap();
        store
            .enqueue("Echo", SOURCE_BACKGROUND, Payload::new(), Duration::ZERO)
            .await
            .unwrap();
        let leased = dequeue(&store).await.unwrap();
        let executing = store
            .update_status(&leased, InvocationStatus::Executing, ExecutionResult::Incomplete)
            .await
            .unwrap()
            .unwrap();
        store
            .complete(&executing, ExecutionResult::Faulted, Some("boom".into()), None)
            .await
            .unwrap();

        let jobs = store.get_job_statistics().await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].job_name, "Echo");
        assert_eq!(jobs[0].queued, 1);
        assert_eq!(jobs[0].faulted, 1);

        let workers = store.get_worker_statistics().await.unwrap();
        assert_eq!(workers.len(), 1);
        assert_eq!(workers[0].instance, "worker-a");
        assert_eq!(workers[0].dequeues, 1);
        assert_eq!(workers[0].faults, 1);
    }

    #[tokio::test]
    async fn get_by_job_filters_and_orders_newest_first() {
        let (clock, store) = store();
        store
            .enqueue("Echo", SOURCE_BACKGROUND, Payload::new(), Duration::ZERO)
            .await
            .unwrap();
        clock.advance(Duration::from_secs(10));
        let newer = store
            .enqueue("echo", SOURCE_BACKGROUND, Payload::new(), Duration::ZERO)
            .await
            .unwrap();
        store
            .enqueue("Other", SOURCE_BACKGROUND, Payload::new(), Duration::ZERO)
            .await
            .unwrap();

        let all = store.get_by_job("ECHO", None, None, None).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].id, newer.id);

        let latest = store.get_latest_for_job("Echo").await.unwrap().unwrap();
        assert_eq!(latest.id, newer.id);

        let windowed = store
            .get_by_job("Echo", Some(newer.queued_at), None, None)
            .await
            .unwrap();
        assert_eq!(windowed.len(), 1);
    }

    #[tokio::test]
    async fn version_is_strictly_increasing_across_a_lifecycle() {
        let (_, store) = store();
        let queued = store
            .enqueue("Echo", SOURCE_BACKGROUND, Payload::new(), Duration::ZERO)
            .await
            .unwrap();
        let leased = dequeue(&store).await.unwrap();
        let executing = store
            .update_status(&leased, InvocationStatus::Executing, ExecutionResult::Incomplete)
            .await
            .unwrap()
            .unwrap();
        store
            .complete(&executing, ExecutionResult::Completed, None, None)
            .await
            .unwrap();
        let done = store.get(queued.id).await.unwrap().unwrap();

        let versions = [queued.version, leased.version, executing.version, done.version];
        assert!(versions.windows(2).all(|w| w[0] < w[1]));
    }
}
