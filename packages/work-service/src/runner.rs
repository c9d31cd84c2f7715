//! The dispatch loop: poll → dispatch → commit.
//!
//! One runner per worker. Each cycle leases at most one invocation,
//! wins the `Executing` transition through the version compare-and-set
//! (losing it means another worker raced us in and we walk away), runs
//! the handler under log capture, and commits the outcome per the rule
//! table: terminal results complete the row (optionally enqueueing a
//! repeat chain), an incomplete result with a continuation suspends the
//! chain, and an incomplete result without one is a handler bug
//! committed as `Crashed`.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::capture::CaptureFactory;
use crate::clock::Clock;
use crate::context::InvocationContext;
use crate::dispatch::{JobDispatcher, JobRegistry, OutcomeKind};
use crate::events::InvocationEvent;
use crate::invocation::{ExecutionResult, Invocation, InvocationStatus, SOURCE_REPEAT};
use crate::store::InvocationStore;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);
pub const DEFAULT_INVISIBILITY: Duration = Duration::from_secs(30 * 60);
const ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Where the runner currently is in its loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunnerStatus {
    Working,
    Dequeuing,
    Dispatching,
    Sleeping,
    Stopping,
    Error,
}

/// Heartbeat snapshot published on every status change.
#[derive(Debug, Clone, Serialize)]
pub struct RunnerSnapshot {
    pub instance: String,
    pub status: RunnerStatus,
    pub current_invocation: Option<Uuid>,
    pub last_invocation: Option<Uuid>,
    pub error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Unique instance name advertised to the store for lease tracking
    /// and crash repair.
    pub instance_name: String,
    /// Sleep between polls when the queue is empty.
    pub poll_interval: Duration,
    /// Lease length applied on dequeue.
    pub invisibility: Duration,
    /// Test-only: wait out a continuation in-process and re-dispatch it
    /// instead of leaving it for a later poll.
    pub include_continuations_inline: bool,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            instance_name: format!("worker-{}", Uuid::new_v4()),
            poll_interval: DEFAULT_POLL_INTERVAL,
            invisibility: DEFAULT_INVISIBILITY,
            include_continuations_inline: false,
        }
    }
}

impl RunnerConfig {
    pub fn with_instance_name(instance_name: impl Into<String>) -> Self {
        Self {
            instance_name: instance_name.into(),
            ..Default::default()
        }
    }
}

pub struct JobRunner {
    store: Arc<dyn InvocationStore>,
    dispatcher: JobDispatcher,
    captures: Arc<dyn CaptureFactory>,
    clock: Arc<dyn Clock>,
    config: RunnerConfig,
    status: watch::Sender<RunnerSnapshot>,
    events: broadcast::Sender<InvocationEvent>,
}

impl JobRunner {
    pub fn new(
        store: Arc<dyn InvocationStore>,
        registry: Arc<JobRegistry>,
        captures: Arc<dyn CaptureFactory>,
        clock: Arc<dyn Clock>,
        config: RunnerConfig,
        events: broadcast::Sender<InvocationEvent>,
    ) -> Self {
        let initial = RunnerSnapshot {
            instance: config.instance_name.clone(),
            status: RunnerStatus::Working,
            current_invocation: None,
            last_invocation: None,
            error: None,
            updated_at: clock.now(),
        };
        let (status, _) = watch::channel(initial);
        Self {
            store,
            dispatcher: JobDispatcher::new(registry),
            captures,
            clock,
            config,
            status,
            events,
        }
    }

    /// Watch the runner's heartbeat snapshots.
    pub fn status(&self) -> watch::Receiver<RunnerSnapshot> {
        self.status.subscribe()
    }

    pub fn instance_name(&self) -> &str {
        &self.config.instance_name
    }

    fn set_status(&self, status: RunnerStatus) {
        self.status.send_modify(|snapshot| {
            snapshot.status = status;
            snapshot.updated_at = self.clock.now();
        });
    }

    fn set_current(&self, current: Option<Uuid>) {
        self.status.send_modify(|snapshot| {
            if let Some(id) = current {
                snapshot.current_invocation = Some(id);
            } else {
                snapshot.last_invocation = snapshot.current_invocation.take();
            }
            snapshot.updated_at = self.clock.now();
        });
    }

    fn emit(&self, event: InvocationEvent) {
        // No observers is fine.
        let _ = self.events.send(event);
    }

    /// Run until `cancel` fires. A panic escaping the loop parks the
    /// runner in `Error`; a clean exit ends in `Stopping`.
    pub async fn run(self, cancel: CancellationToken) {
        match AssertUnwindSafe(self.run_loop(&cancel)).catch_unwind().await {
            Ok(()) => {
                self.set_status(RunnerStatus::Stopping);
                info!(instance = %self.config.instance_name, "runner stopped");
            }
            Err(panic) => {
                let message = panic_text(panic);
                self.status.send_modify(|snapshot| {
                    snapshot.status = RunnerStatus::Error;
                    snapshot.error = Some(message.clone());
                    snapshot.updated_at = self.clock.now();
                });
                error!(instance = %self.config.instance_name, error = %message, "runner failed");
            }
        }
    }

    async fn run_loop(&self, cancel: &CancellationToken) {
        info!(
            instance = %self.config.instance_name,
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            invisibility_ms = self.config.invisibility.as_millis() as u64,
            "runner starting"
        );

        match self.store.reinitialize(&self.config.instance_name).await {
            Ok(0) => {}
            Ok(repaired) => {
                info!(
                    instance = %self.config.instance_name,
                    repaired,
                    "requeued invocations from a previous run"
                );
            }
            Err(err) => {
                warn!(
                    instance = %self.config.instance_name,
                    error = %err,
                    "failed to reinitialize invocation state"
                );
            }
        }

        loop {
            if cancel.is_cancelled() {
                break;
            }

            self.set_status(RunnerStatus::Dequeuing);
            let claimed = match self
                .store
                .dequeue(&self.config.instance_name, self.config.invisibility, cancel)
                .await
            {
                Ok(claimed) => claimed,
                Err(err) => {
                    error!(instance = %self.config.instance_name, error = %err, "dequeue failed");
                    self.set_status(RunnerStatus::Sleeping);
                    if !self.clock.delay(ERROR_BACKOFF, cancel).await {
                        break;
                    }
                    continue;
                }
            };

            if cancel.is_cancelled() {
                break;
            }

            let Some(invocation) = claimed else {
                self.set_status(RunnerStatus::Sleeping);
                if !self.clock.delay(self.config.poll_interval, cancel).await {
                    break;
                }
                continue;
            };

            // An admin may cancel between enqueue and dequeue; such a row
            // is already terminal.
            if invocation.status == InvocationStatus::Cancelled {
                info!(
                    invocation_id = %invocation.id,
                    job = %invocation.job_name,
                    "skipping cancelled invocation"
                );
                continue;
            }

            self.set_status(RunnerStatus::Dispatching);
            self.set_current(Some(invocation.id));
            self.dispatch_invocation(invocation, cancel).await;
            self.set_current(None);
            self.set_status(RunnerStatus::Working);
        }
    }

    /// One dispatch attempt: win the executing transition, run the
    /// handler under capture, commit the outcome. Never raises; every
    /// failure path is logged and the loop moves on.
    async fn dispatch_invocation(&self, invocation: Invocation, cancel: &CancellationToken) {
        if invocation.is_continuation {
            info!(
                invocation_id = %invocation.id,
                job = %invocation.job_name,
                source = %invocation.source,
                dequeue_count = invocation.dequeue_count,
                "resuming invocation"
            );
            self.emit(InvocationEvent::Resumed {
                invocation_id: invocation.id,
                job_name: invocation.job_name.clone(),
                instance: self.config.instance_name.clone(),
                source: invocation.source.clone(),
            });
        } else {
            info!(
                invocation_id = %invocation.id,
                job = %invocation.job_name,
                dequeue_count = invocation.dequeue_count,
                "starting invocation"
            );
            self.emit(InvocationEvent::Started {
                invocation_id: invocation.id,
                job_name: invocation.job_name.clone(),
                instance: self.config.instance_name.clone(),
            });
        }

        let executing = match self
            .store
            .update_status(&invocation, InvocationStatus::Executing, ExecutionResult::Incomplete)
            .await
        {
            Ok(Some(row)) => row,
            Ok(None) => {
                // Another worker raced us in; walk away.
                info!(
                    invocation_id = %invocation.id,
                    job = %invocation.job_name,
                    "invocation aborted, another worker holds it"
                );
                self.emit(InvocationEvent::Aborted {
                    invocation_id: invocation.id,
                    job_name: invocation.job_name.clone(),
                    instance: self.config.instance_name.clone(),
                });
                return;
            }
            Err(err) => {
                // The lease will expire and the row re-dequeues.
                error!(
                    invocation_id = %invocation.id,
                    error = %err,
                    "failed to mark invocation executing"
                );
                return;
            }
        };

        let mut capture = self.captures.for_invocation(&executing);
        if let Err(err) = capture.start().await {
            warn!(invocation_id = %executing.id, error = %err, "log capture failed to start");
        }

        let mut ctx = InvocationContext::new(
            executing,
            self.store.clone(),
            capture.sink(),
            self.clock.clone(),
            cancel.child_token(),
        );
        let outcome = self.dispatcher.dispatch(&mut ctx).await;
        let invocation = ctx.into_invocation();

        let now = self.clock.now();
        if now > invocation.next_visible_at {
            let overrun_ms = (now - invocation.next_visible_at).num_milliseconds();
            warn!(
                invocation_id = %invocation.id,
                job = %invocation.job_name,
                overrun_ms,
                "invocation exceeded its lease"
            );
            self.emit(InvocationEvent::LeaseExceeded {
                invocation_id: invocation.id,
                job_name: invocation.job_name.clone(),
                overrun_ms,
            });
        }

        let log_url = capture.end().await;

        match outcome.kind {
            OutcomeKind::Completed | OutcomeKind::Faulted => {
                // Enqueue the repeat before the terminal commit so a crash
                // between the two duplicates a repeat instead of losing
                // the chain.
                if let Some(period) = outcome.reschedule_in {
                    self.enqueue_repeat(&invocation, period).await;
                }
                let result = if outcome.kind == OutcomeKind::Completed {
                    ExecutionResult::Completed
                } else {
                    ExecutionResult::Faulted
                };
                self.commit(&invocation, result, outcome.error, log_url).await;
            }
            OutcomeKind::Crashed => {
                self.commit(&invocation, ExecutionResult::Crashed, outcome.error, log_url)
                    .await;
            }
            OutcomeKind::Aborted => {
                self.commit(&invocation, ExecutionResult::Aborted, outcome.error, log_url)
                    .await;
            }
            OutcomeKind::Incomplete => match outcome.continuation {
                Some(continuation) => {
                    self.commit_suspend(&invocation, continuation, log_url, cancel)
                        .await;
                }
                None => {
                    self.commit(
                        &invocation,
                        ExecutionResult::Crashed,
                        Some("incomplete result without continuation".to_string()),
                        log_url,
                    )
                    .await;
                }
            },
        }
    }

    async fn enqueue_repeat(&self, invocation: &Invocation, period: Duration) {
        match self
            .store
            .enqueue(&invocation.job_name, SOURCE_REPEAT, invocation.payload.clone(), period)
            .await
        {
            Ok(next) => {
                debug!(
                    invocation_id = %invocation.id,
                    next_id = %next.id,
                    job = %invocation.job_name,
                    reschedule_ms = period.as_millis() as u64,
                    "enqueued repeat"
                );
                self.emit(InvocationEvent::Repeated {
                    invocation_id: invocation.id,
                    next_id: next.id,
                    job_name: invocation.job_name.clone(),
                    reschedule_ms: period.as_millis() as i64,
                });
            }
            Err(err) => {
                error!(
                    invocation_id = %invocation.id,
                    job = %invocation.job_name,
                    error = %err,
                    "failed to enqueue repeat"
                );
            }
        }
    }

    async fn commit(
        &self,
        invocation: &Invocation,
        result: ExecutionResult,
        message: Option<String>,
        log_url: Option<String>,
    ) {
        match self
            .store
            .complete(invocation, result, message, log_url.clone())
            .await
        {
            Ok(true) => {
                info!(
                    invocation_id = %invocation.id,
                    job = %invocation.job_name,
                    result = ?result,
                    "invocation committed"
                );
                self.emit(InvocationEvent::Committed {
                    invocation_id: invocation.id,
                    job_name: invocation.job_name.clone(),
                    result,
                    log_url,
                });
            }
            Ok(false) => {
                // Late commit after a lease steal; dropped by contract.
                info!(
                    invocation_id = %invocation.id,
                    job = %invocation.job_name,
                    "terminal commit dropped, invocation version advanced"
                );
            }
            Err(err) => {
                error!(
                    invocation_id = %invocation.id,
                    error = %err,
                    "failed to commit invocation outcome"
                );
            }
        }
    }

    async fn commit_suspend(
        &self,
        invocation: &Invocation,
        continuation: crate::dispatch::JobContinuation,
        log_url: Option<String>,
        cancel: &CancellationToken,
    ) {
        let wait = continuation.wait_period;
        match self
            .store
            .suspend(invocation, continuation.parameters, wait, log_url)
            .await
        {
            Ok(Some(next)) => {
                info!(
                    invocation_id = %invocation.id,
                    continuation_id = %next.id,
                    job = %invocation.job_name,
                    wait_ms = wait.as_millis() as u64,
                    "invocation suspended"
                );
                self.emit(InvocationEvent::Suspended {
                    invocation_id: invocation.id,
                    continuation_id: next.id,
                    job_name: invocation.job_name.clone(),
                    wait_ms: wait.as_millis() as i64,
                });

                if self.config.include_continuations_inline {
                    // Test-only mode: wait the continuation out and re-enter
                    // dispatch with the new row instead of leaving it for a
                    // later poll cycle.
                    if self.clock.delay(wait, cancel).await {
                        Box::pin(self.dispatch_invocation(next, cancel)).await;
                    }
                }
            }
            Ok(None) => {
                info!(
                    invocation_id = %invocation.id,
                    job = %invocation.job_name,
                    "suspend dropped, invocation version advanced"
                );
            }
            Err(err) => {
                error!(
                    invocation_id = %invocation.id,
                    error = %err,
                    "failed to suspend invocation"
                );
            }
        }
    }
}

fn panic_text(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "runner panicked".to_string()
    }
}
