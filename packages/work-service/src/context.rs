//! The narrow surface a handler sees while executing.
//!
//! Handlers never write invocation rows directly: the context exposes
//! enqueue and lease extension, the capture sink for logging, the clock,
//! and the cancellation token. Suspension is requested by returning a
//! continuation in the outcome; the runner owns the commit.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::capture::CaptureSink;
use crate::clock::Clock;
use crate::invocation::Invocation;
use crate::payload::Payload;
use crate::store::{InvocationStore, StoreResult};

pub struct InvocationContext {
    invocation: Invocation,
    store: Arc<dyn InvocationStore>,
    log: CaptureSink,
    clock: Arc<dyn Clock>,
    cancel: CancellationToken,
}

impl InvocationContext {
    pub fn new(
        invocation: Invocation,
        store: Arc<dyn InvocationStore>,
        log: CaptureSink,
        clock: Arc<dyn Clock>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            invocation,
            store,
            log,
            clock,
            cancel,
        }
    }

    pub fn invocation(&self) -> &Invocation {
        &self.invocation
    }

    pub fn payload(&self) -> &Payload {
        &self.invocation.payload
    }

    pub fn is_continuation(&self) -> bool {
        self.invocation.is_continuation
    }

    /// Structured log sink captured into this invocation's artifact.
    pub fn log(&self) -> &CaptureSink {
        &self.log
    }

    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    /// Cooperative cancellation: handlers should check this at their own
    /// suspension points and return promptly once it fires.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Enqueue a child invocation; its `source` records this invocation
    /// as the origin.
    pub async fn enqueue(
        &self,
        job_name: &str,
        payload: Payload,
        visibility_delay: Duration,
    ) -> StoreResult<Invocation> {
        self.store
            .enqueue(job_name, &self.invocation.id_hex(), payload, visibility_delay)
            .await
    }

    /// Push this invocation's lease out by `additional` (capped by the
    /// store). Must be called before the lease expires. Returns `false`
    /// when the lease is no longer ours.
    pub async fn extend(&mut self, additional: Duration) -> StoreResult<bool> {
        match self.store.extend(&self.invocation, additional).await? {
            Some(updated) => {
                self.invocation = updated;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub(crate) fn into_invocation(self) -> Invocation {
        self.invocation
    }
}
