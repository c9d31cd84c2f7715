//! End-to-end scheduler scenarios: a real runner task over the in-memory
//! store, driven by a hand-advanced clock.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use work_service::capture::{
    blob_key, BlobCaptureFactory, BlobStore, CaptureFactory, MemoryBlobStore, MemoryCaptureFactory,
};
use work_service::testing::ManualClock;
use work_service::{
    BindPayload, Clock, ExecutionResult, InvocationContext, InvocationEvent, InvocationStatus,
    InvocationStore, JobContinuation, JobHandler, JobOutcome, JobRegistry, JobRunner,
    MemoryInvocationStore, OutcomeKind, Payload, PayloadBinder, PayloadError, RunnerConfig,
    SOURCE_BACKGROUND, SOURCE_REPEAT,
};

const POLL: Duration = Duration::from_secs(1);
const INVISIBILITY: Duration = Duration::from_secs(1_800);

struct Harness {
    clock: Arc<ManualClock>,
    store: Arc<MemoryInvocationStore>,
    blobs: Arc<MemoryBlobStore>,
    events: broadcast::Sender<InvocationEvent>,
}

impl Harness {
    fn new() -> Self {
        let clock = Arc::new(ManualClock::default());
        let store = Arc::new(MemoryInvocationStore::new(clock.clone()));
        let (events, _) = broadcast::channel(256);
        Self {
            clock,
            store,
            blobs: Arc::new(MemoryBlobStore::new()),
            events,
        }
    }

    fn spawn_worker(&self, registry: JobRegistry) -> CancellationToken {
        self.spawn_worker_with(registry, false, false)
    }

    fn spawn_worker_with(
        &self,
        registry: JobRegistry,
        capture_blobs: bool,
        inline_continuations: bool,
    ) -> CancellationToken {
        let captures: Arc<dyn CaptureFactory> = if capture_blobs {
            Arc::new(BlobCaptureFactory::new(
                self.blobs.clone(),
                self.clock.clone(),
            ))
        } else {
            Arc::new(MemoryCaptureFactory::new(self.clock.clone()))
        };
        let runner = JobRunner::new(
            self.store.clone(),
            Arc::new(registry),
            captures,
            self.clock.clone(),
            RunnerConfig {
                instance_name: "worker-0".into(),
                poll_interval: POLL,
                invisibility: INVISIBILITY,
                include_continuations_inline: inline_continuations,
            },
            self.events.clone(),
        );
        let cancel = CancellationToken::new();
        tokio::spawn(runner.run(cancel.clone()));
        cancel
    }

    async fn enqueue(&self, job: &str, payload: Payload) -> work_service::Invocation {
        self.store
            .enqueue(job, SOURCE_BACKGROUND, payload, Duration::ZERO)
            .await
            .unwrap()
    }

    /// Nudge a sleeping runner past its poll interval.
    fn tick(&self) {
        self.clock.advance(POLL + Duration::from_millis(100));
    }
}

async fn wait_until<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if condition().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

/// Like [`wait_until`], but keeps nudging the manual clock past the poll
/// interval so a runner can never be left parked in a sleep that started
/// after the last advance.
async fn wait_until_ticking<F, Fut>(harness: &Harness, mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if condition().await {
                return;
            }
            harness.tick();
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

// ---------------------------------------------------------------------------
// Test jobs
// ---------------------------------------------------------------------------

struct EchoJob {
    message: String,
}

impl BindPayload for EchoJob {
    fn bind(binder: &mut PayloadBinder<'_>) -> Result<Self, PayloadError> {
        Ok(Self {
            message: binder.require_str("msg")?,
        })
    }
}

#[async_trait]
impl JobHandler for EchoJob {
    async fn invoke(&mut self, ctx: &mut InvocationContext) -> anyhow::Result<JobOutcome> {
        ctx.log().info(self.message.clone());
        Ok(JobOutcome::completed())
    }
}

/// Suspends on the first invocation, completes on the resume; records the
/// payload each call saw.
struct StepJob {
    seen: Arc<Mutex<Vec<Payload>>>,
}

#[async_trait]
impl JobHandler for StepJob {
    async fn invoke(&mut self, ctx: &mut InvocationContext) -> anyhow::Result<JobOutcome> {
        self.seen.lock().unwrap().push(ctx.payload().clone());
        let mut next = Payload::new();
        next.set("step", "1");
        Ok(JobOutcome::suspended(JobContinuation::new(
            Duration::from_secs(2),
            next,
        )))
    }

    async fn resume(&mut self, ctx: &mut InvocationContext) -> anyhow::Result<JobOutcome> {
        self.seen.lock().unwrap().push(ctx.payload().clone());
        Ok(JobOutcome::completed())
    }
}

/// Completes with a 5s reschedule on the first run only.
struct TickJob {
    runs: Arc<AtomicUsize>,
}

#[async_trait]
impl JobHandler for TickJob {
    async fn invoke(&mut self, _ctx: &mut InvocationContext) -> anyhow::Result<JobOutcome> {
        if self.runs.fetch_add(1, Ordering::SeqCst) == 0 {
            Ok(JobOutcome::completed_with_reschedule(Duration::from_secs(5)))
        } else {
            Ok(JobOutcome::completed())
        }
    }
}

struct BoomJob;

#[async_trait]
impl JobHandler for BoomJob {
    async fn invoke(&mut self, ctx: &mut InvocationContext) -> anyhow::Result<JobOutcome> {
        ctx.log().error("about to blow up");
        anyhow::bail!("kapow")
    }
}

struct ForgetfulJob;

#[async_trait]
impl JobHandler for ForgetfulJob {
    async fn invoke(&mut self, _ctx: &mut InvocationContext) -> anyhow::Result<JobOutcome> {
        // Incomplete without a continuation: a handler bug.
        Ok(JobOutcome {
            kind: OutcomeKind::Incomplete,
            error: None,
            reschedule_in: None,
            continuation: None,
        })
    }
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn simple_completion() {
    let harness = Harness::new();
    let mut payload = Payload::new();
    payload.set("msg", "hi");
    let queued = harness.enqueue("Echo", payload).await;

    let mut registry = JobRegistry::new();
    registry.register_bound::<EchoJob>("Echo");
    let cancel = harness.spawn_worker(registry);

    let store = harness.store.clone();
    wait_until(|| {
        let store = store.clone();
        async move {
            store
                .get(queued.id)
                .await
                .unwrap()
                .is_some_and(|row| row.status == InvocationStatus::Executed)
        }
    })
    .await;

    let row = harness.store.get(queued.id).await.unwrap().unwrap();
    assert_eq!(row.result, ExecutionResult::Completed);
    assert_eq!(row.result_message, None);
    assert_eq!(row.dequeue_count, 1);
    assert!(row.completed_at.is_some());

    cancel.cancel();
}

#[tokio::test]
async fn suspend_and_resume() {
    let harness = Harness::new();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let first = harness.enqueue("Step", Payload::new()).await;

    let mut registry = JobRegistry::new();
    let handler_seen = seen.clone();
    registry.register("Step", move |_payload| {
        Ok(StepJob {
            seen: handler_seen.clone(),
        })
    });
    let cancel = harness.spawn_worker(registry);

    // First attempt runs and suspends.
    let store = harness.store.clone();
    wait_until(|| {
        let store = store.clone();
        async move {
            store
                .get(first.id)
                .await
                .unwrap()
                .is_some_and(|row| row.status == InvocationStatus::Suspended)
        }
    })
    .await;

    let parent = harness.store.get(first.id).await.unwrap().unwrap();
    assert!(parent.last_suspended_at.is_some());

    // The continuation row exists, linked through `source`, invisible
    // until its wait elapses.
    let continuation = harness
        .store
        .snapshot()
        .into_iter()
        .find(|row| row.is_continuation)
        .expect("continuation row");
    assert_eq!(continuation.source, parent.id_hex());
    assert_eq!(continuation.payload.get("step"), Some(Some("1")));
    assert!(continuation.next_visible_at > harness.clock.now());

    // Let the wait elapse; the worker resumes and completes the chain.
    let store = harness.store.clone();
    let continuation_id = continuation.id;
    wait_until_ticking(&harness, || {
        let store = store.clone();
        async move {
            store
                .get(continuation_id)
                .await
                .unwrap()
                .is_some_and(|row| row.status == InvocationStatus::Executed)
        }
    })
    .await;

    let resumed = harness.store.get(continuation.id).await.unwrap().unwrap();
    assert_eq!(resumed.result, ExecutionResult::Completed);

    // The resume saw the continuation payload, not the original.
    let calls = seen.lock().unwrap();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].get("step"), None);
    assert_eq!(calls[1].get("step"), Some(Some("1")));

    cancel.cancel();
}

#[tokio::test]
async fn repeat_enqueues_a_fresh_chain() {
    let harness = Harness::new();
    let runs = Arc::new(AtomicUsize::new(0));
    let mut payload = Payload::new();
    payload.set("cursor", "abc");
    let first = harness.enqueue("Tick", payload.clone()).await;

    let mut registry = JobRegistry::new();
    let handler_runs = runs.clone();
    registry.register("Tick", move |_payload| {
        Ok(TickJob {
            runs: handler_runs.clone(),
        })
    });
    let cancel = harness.spawn_worker(registry);

    let store = harness.store.clone();
    wait_until(|| {
        let store = store.clone();
        async move {
            store
                .get(first.id)
                .await
                .unwrap()
                .is_some_and(|row| row.status == InvocationStatus::Executed)
        }
    })
    .await;

    // The repeat row: same job, same payload, RepeatingJob provenance,
    // visible five seconds out.
    let repeat = harness
        .store
        .snapshot()
        .into_iter()
        .find(|row| row.source == SOURCE_REPEAT)
        .expect("repeat row");
    assert_eq!(repeat.job_name, "Tick");
    assert_eq!(repeat.payload, payload);
    assert!(!repeat.is_continuation);
    assert!(repeat.next_visible_at > harness.clock.now());

    // And it runs once its visibility delay passes.
    let store = harness.store.clone();
    let repeat_id = repeat.id;
    wait_until_ticking(&harness, || {
        let store = store.clone();
        async move {
            store
                .get(repeat_id)
                .await
                .unwrap()
                .is_some_and(|row| row.status == InvocationStatus::Executed)
        }
    })
    .await;

    assert_eq!(runs.load(Ordering::SeqCst), 2);
    cancel.cancel();
}

#[tokio::test]
async fn crash_captures_error_and_log_blob() {
    let harness = Harness::new();
    let queued = harness.enqueue("Boom", Payload::new()).await;

    let mut registry = JobRegistry::new();
    registry.register("Boom", |_payload| Ok(BoomJob));
    let cancel = harness.spawn_worker_with(registry, true, false);

    let store = harness.store.clone();
    wait_until(|| {
        let store = store.clone();
        async move {
            store
                .get(queued.id)
                .await
                .unwrap()
                .is_some_and(|row| row.status == InvocationStatus::Executed)
        }
    })
    .await;

    let row = harness.store.get(queued.id).await.unwrap().unwrap();
    assert_eq!(row.result, ExecutionResult::Crashed);
    assert!(row.result_message.unwrap().contains("kapow"));

    // The log blob was uploaded and linked.
    let log_url = row.log_url.expect("log url");
    assert_eq!(log_url, format!("memory://{}", blob_key(row.id)));
    let body = harness.blobs.get(&blob_key(row.id)).await.unwrap().unwrap();
    let text = std::str::from_utf8(&body).unwrap();
    assert!(text.contains("about to blow up"));

    cancel.cancel();
}

#[tokio::test]
async fn unknown_job_crashes_without_retry() {
    let harness = Harness::new();
    let queued = harness.enqueue("Ghost", Payload::new()).await;

    let cancel = harness.spawn_worker(JobRegistry::new());

    let store = harness.store.clone();
    wait_until(|| {
        let store = store.clone();
        async move {
            store
                .get(queued.id)
                .await
                .unwrap()
                .is_some_and(|row| row.status == InvocationStatus::Executed)
        }
    })
    .await;

    let row = harness.store.get(queued.id).await.unwrap().unwrap();
    assert_eq!(row.result, ExecutionResult::Crashed);
    assert!(row.result_message.unwrap().contains("unknown job"));

    cancel.cancel();
}

#[tokio::test]
async fn incomplete_without_continuation_is_a_crash() {
    let harness = Harness::new();
    let queued = harness.enqueue("Forgetful", Payload::new()).await;

    let mut registry = JobRegistry::new();
    registry.register("Forgetful", |_payload| Ok(ForgetfulJob));
    let cancel = harness.spawn_worker(registry);

    let store = harness.store.clone();
    wait_until(|| {
        let store = store.clone();
        async move {
            store
                .get(queued.id)
                .await
                .unwrap()
                .is_some_and(|row| row.status == InvocationStatus::Executed)
        }
    })
    .await;

    let row = harness.store.get(queued.id).await.unwrap().unwrap();
    assert_eq!(row.result, ExecutionResult::Crashed);
    assert!(row
        .result_message
        .unwrap()
        .contains("incomplete result without continuation"));

    cancel.cancel();
}

#[tokio::test]
async fn cancelled_row_is_skipped_by_the_worker() {
    let harness = Harness::new();
    let queued = harness.enqueue("Echo", Payload::new()).await;
    assert!(harness.store.cancel(queued.id).await.unwrap());

    let mut registry = JobRegistry::new();
    registry.register_bound::<EchoJob>("Echo");
    let cancel = harness.spawn_worker(registry);

    // Give the worker a few cycles; the cancelled row must stay terminal
    // and untouched.
    for _ in 0..3 {
        harness.tick();
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let row = harness.store.get(queued.id).await.unwrap().unwrap();
    assert_eq!(row.status, InvocationStatus::Cancelled);
    assert_eq!(row.result, ExecutionResult::Cancelled);
    assert_eq!(row.dequeue_count, 0);

    cancel.cancel();
}

#[tokio::test]
async fn inline_continuations_run_the_chain_in_one_dispatch() {
    let harness = Harness::new();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let first = harness.enqueue("Step", Payload::new()).await;

    let mut registry = JobRegistry::new();
    let handler_seen = seen.clone();
    registry.register("Step", move |_payload| {
        Ok(StepJob {
            seen: handler_seen.clone(),
        })
    });
    let cancel = harness.spawn_worker_with(registry, false, true);

    // The worker suspends, then waits out the continuation in-process;
    // advancing past the wait lets it re-enter dispatch inline.
    let store = harness.store.clone();
    wait_until(|| {
        let store = store.clone();
        async move {
            store
                .get(first.id)
                .await
                .unwrap()
                .is_some_and(|row| row.status == InvocationStatus::Suspended)
        }
    })
    .await;

    let store = harness.store.clone();
    wait_until_ticking(&harness, || {
        let store = store.clone();
        async move {
            store
                .snapshot()
                .into_iter()
                .any(|row| row.is_continuation && row.status == InvocationStatus::Executed)
        }
    })
    .await;

    assert_eq!(seen.lock().unwrap().len(), 2);
    cancel.cancel();
}

#[tokio::test]
async fn worker_emits_lifecycle_events() {
    let harness = Harness::new();
    let mut events = harness.events.subscribe();
    let mut payload = Payload::new();
    payload.set("msg", "hi");
    let queued = harness.enqueue("Echo", payload).await;

    let mut registry = JobRegistry::new();
    registry.register_bound::<EchoJob>("Echo");
    let cancel = harness.spawn_worker(registry);

    let started = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .unwrap()
        .unwrap();
    let committed = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .unwrap()
        .unwrap();

    match started {
        InvocationEvent::Started { invocation_id, .. } => assert_eq!(invocation_id, queued.id),
        other => panic!("expected Started, got {other:?}"),
    }
    match committed {
        InvocationEvent::Committed { result, .. } => {
            assert_eq!(result, ExecutionResult::Completed)
        }
        other => panic!("expected Committed, got {other:?}"),
    }

    cancel.cancel();
}

#[tokio::test]
async fn statistics_summarise_a_days_work() {
    let harness = Harness::new();
    let mut payload = Payload::new();
    payload.set("msg", "hi");
    harness.enqueue("Echo", payload).await;
    let boom = harness.enqueue("Boom", Payload::new()).await;

    let mut registry = JobRegistry::new();
    registry.register_bound::<EchoJob>("Echo");
    registry.register("Boom", |_payload| Ok(BoomJob));
    let cancel = harness.spawn_worker(registry);

    let store = harness.store.clone();
    wait_until(|| {
        let store = store.clone();
        async move {
            store
                .get(boom.id)
                .await
                .unwrap()
                .is_some_and(|row| row.status == InvocationStatus::Executed)
                && store
                    .get_latest_for_job("Echo")
                    .await
                    .unwrap()
                    .is_some_and(|row| row.status == InvocationStatus::Executed)
        }
    })
    .await;

    let jobs = harness.store.get_job_statistics().await.unwrap();
    let echo = jobs.iter().find(|j| j.job_name == "Echo").unwrap();
    let boom_stats = jobs.iter().find(|j| j.job_name == "Boom").unwrap();
    assert_eq!(echo.completed, 1);
    assert_eq!(boom_stats.crashed, 1);

    let workers = harness.store.get_worker_statistics().await.unwrap();
    assert_eq!(workers.len(), 1);
    assert_eq!(workers[0].instance, "worker-0");
    assert_eq!(workers[0].dequeues, 2);
    assert_eq!(workers[0].completes, 1);
    assert_eq!(workers[0].crashes, 1);

    cancel.cancel();
}
