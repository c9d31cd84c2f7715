//! Job handlers, the registry that names them, and the dispatcher that
//! runs one invocation through its handler.
//!
//! A handler is constructed fresh per invocation by its registered
//! factory, which binds the invocation payload onto the handler's
//! configuration. Everything that can go wrong inside the handler
//! (bind failures, returned errors, panics) is folded into a `Crashed`
//! outcome; the dispatcher itself never raises past the runner.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;

use crate::context::InvocationContext;
use crate::error::PayloadError;
use crate::payload::{Payload, PayloadBinder};

/// How an attempt ended, as reported by the handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeKind {
    Completed,
    Faulted,
    Crashed,
    Aborted,
    /// Not finished: the outcome must carry a continuation.
    Incomplete,
}

/// A handler's request to be re-invoked later on the same chain.
#[derive(Debug, Clone)]
pub struct JobContinuation {
    pub wait_period: Duration,
    pub parameters: Payload,
}

impl JobContinuation {
    pub fn new(wait_period: Duration, parameters: Payload) -> Self {
        Self {
            wait_period,
            parameters,
        }
    }

    /// Build the continuation payload from a typed options struct.
    pub fn from_options<T: serde::Serialize>(
        wait_period: Duration,
        options: &T,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            wait_period,
            parameters: Payload::from_options(options)?,
        })
    }
}

/// The result a dispatch produces for the outcome commit.
///
/// `reschedule_in` and a continuation are orthogonal: the former enqueues
/// a fresh chain after a terminal result, the latter continues this one.
#[derive(Debug, Clone)]
pub struct JobOutcome {
    pub kind: OutcomeKind,
    pub error: Option<String>,
    pub reschedule_in: Option<Duration>,
    pub continuation: Option<JobContinuation>,
}

impl JobOutcome {
    pub fn completed() -> Self {
        Self {
            kind: OutcomeKind::Completed,
            error: None,
            reschedule_in: None,
            continuation: None,
        }
    }

    /// Completed, with a fresh chain enqueued after `period`.
    pub fn completed_with_reschedule(period: Duration) -> Self {
        Self {
            reschedule_in: Some(period),
            ..Self::completed()
        }
    }

    pub fn faulted(error: impl std::fmt::Display) -> Self {
        Self {
            kind: OutcomeKind::Faulted,
            error: Some(error.to_string()),
            reschedule_in: None,
            continuation: None,
        }
    }

    /// Faulted, but keep the repeat schedule alive.
    pub fn faulted_with_reschedule(error: impl std::fmt::Display, period: Duration) -> Self {
        Self {
            reschedule_in: Some(period),
            ..Self::faulted(error)
        }
    }

    pub fn crashed(error: impl std::fmt::Display) -> Self {
        Self {
            kind: OutcomeKind::Crashed,
            error: Some(error.to_string()),
            reschedule_in: None,
            continuation: None,
        }
    }

    /// The handler observed cancellation and declined to finish.
    pub fn aborted() -> Self {
        Self {
            kind: OutcomeKind::Aborted,
            error: None,
            reschedule_in: None,
            continuation: None,
        }
    }

    /// Suspend this chain and resume after the continuation's wait period.
    pub fn suspended(continuation: JobContinuation) -> Self {
        Self {
            kind: OutcomeKind::Incomplete,
            error: None,
            reschedule_in: None,
            continuation: Some(continuation),
        }
    }
}

/// The code that realises one named job. Constructed per invocation.
#[async_trait]
pub trait JobHandler: Send {
    async fn invoke(&mut self, ctx: &mut InvocationContext) -> anyhow::Result<JobOutcome>;

    /// Called instead of `invoke` when the invocation is a continuation.
    ///
    /// Handlers that never suspend keep the default, which turns an
    /// unexpected continuation into a crash.
    async fn resume(&mut self, ctx: &mut InvocationContext) -> anyhow::Result<JobOutcome> {
        let _ = ctx;
        anyhow::bail!("job does not support continuations")
    }
}

/// Handlers whose configuration binds from the invocation payload.
pub trait BindPayload: Sized {
    fn bind(binder: &mut PayloadBinder<'_>) -> Result<Self, PayloadError>;
}

type HandlerFactory = Box<dyn Fn(&Payload) -> Result<Box<dyn JobHandler>, PayloadError> + Send + Sync>;

pub struct JobDescription {
    name: String,
    factory: HandlerFactory,
}

impl JobDescription {
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Case-insensitive registry of named jobs. The set of jobs is closed at
/// startup; registration happens once while wiring the service.
#[derive(Default)]
pub struct JobRegistry {
    jobs: HashMap<String, JobDescription>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a job under `name` with an explicit construction closure.
    ///
    /// # Panics
    ///
    /// Panics if the name (case-insensitively) is already registered.
    pub fn register<H, F>(&mut self, name: &str, factory: F)
    where
        H: JobHandler + 'static,
        F: Fn(&Payload) -> Result<H, PayloadError> + Send + Sync + 'static,
    {
        let key = name.to_ascii_lowercase();
        if self.jobs.contains_key(&key) {
            panic!("job already registered: {name}");
        }
        let boxed: HandlerFactory =
            Box::new(move |payload| Ok(Box::new(factory(payload)?) as Box<dyn JobHandler>));
        self.jobs.insert(
            key,
            JobDescription {
                name: name.to_string(),
                factory: boxed,
            },
        );
    }

    /// Register a job whose handler binds itself from the payload. Unknown
    /// payload keys are warned about after a successful bind.
    pub fn register_bound<H>(&mut self, name: &str)
    where
        H: JobHandler + BindPayload + 'static,
    {
        self.register(name, |payload| {
            let mut binder = PayloadBinder::new(payload);
            let handler = H::bind(&mut binder)?;
            binder.finish();
            Ok(handler)
        });
    }

    pub fn get(&self, name: &str) -> Option<&JobDescription> {
        self.jobs.get(&name.to_ascii_lowercase())
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn job_names(&self) -> Vec<&str> {
        self.jobs.values().map(|job| job.name.as_str()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

/// Runs one invocation through its handler and reports the outcome.
pub struct JobDispatcher {
    registry: Arc<JobRegistry>,
}

impl JobDispatcher {
    pub fn new(registry: Arc<JobRegistry>) -> Self {
        Self { registry }
    }

    pub async fn dispatch(&self, ctx: &mut InvocationContext) -> JobOutcome {
        let job_name = ctx.invocation().job_name.clone();
        let Some(description) = self.registry.get(&job_name) else {
            return JobOutcome::crashed(format!("unknown job: {job_name}"));
        };

        let mut handler = match (description.factory)(ctx.payload()) {
            Ok(handler) => handler,
            Err(err) => return JobOutcome::crashed(format!("payload binding failed: {err}")),
        };

        let run = async {
            if ctx.is_continuation() {
                handler.resume(ctx).await
            } else {
                handler.invoke(ctx).await
            }
        };

        match AssertUnwindSafe(run).catch_unwind().await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(err)) => JobOutcome::crashed(format!("{err:#}")),
            Err(panic) => JobOutcome::crashed(panic_message(panic)),
        }
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("handler panicked: {message}")
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("handler panicked: {message}")
    } else {
        "handler panicked".to_string()
    }
}
