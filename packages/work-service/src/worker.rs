//! Workers and the service that owns them.
//!
//! A [`Worker`] is one runner bound to an id and a cancellation token,
//! running as one tokio task. The [`WorkService`] spawns N of them over
//! shared store/registry/capture handles, aggregates their heartbeat
//! snapshots, and shuts them down together.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::capture::CaptureFactory;
use crate::clock::Clock;
use crate::dispatch::JobRegistry;
use crate::events::InvocationEvent;
use crate::runner::{JobRunner, RunnerConfig, RunnerSnapshot};
use crate::store::InvocationStore;

const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct WorkServiceConfig {
    /// Base instance name; workers advertise `<name>-<index>`.
    pub instance_name: String,
    pub worker_count: usize,
    pub poll_interval: Duration,
    pub invisibility: Duration,
}

impl Default for WorkServiceConfig {
    fn default() -> Self {
        Self {
            instance_name: format!("worker-{}", uuid::Uuid::new_v4()),
            worker_count: 2,
            poll_interval: crate::runner::DEFAULT_POLL_INTERVAL,
            invisibility: crate::runner::DEFAULT_INVISIBILITY,
        }
    }
}

/// One runner task plus the handles to observe and stop it.
pub struct Worker {
    pub id: usize,
    pub instance_name: String,
    status: watch::Receiver<RunnerSnapshot>,
    task: JoinHandle<()>,
}

impl Worker {
    pub fn snapshot(&self) -> RunnerSnapshot {
        self.status.borrow().clone()
    }
}

pub struct WorkService {
    config: WorkServiceConfig,
    store: Arc<dyn InvocationStore>,
    registry: Arc<JobRegistry>,
    captures: Arc<dyn CaptureFactory>,
    clock: Arc<dyn Clock>,
    events: broadcast::Sender<InvocationEvent>,
    cancel: CancellationToken,
    workers: Vec<Worker>,
}

impl WorkService {
    pub fn new(
        config: WorkServiceConfig,
        store: Arc<dyn InvocationStore>,
        registry: Arc<JobRegistry>,
        captures: Arc<dyn CaptureFactory>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            config,
            store,
            registry,
            captures,
            clock,
            events,
            cancel: CancellationToken::new(),
            workers: Vec::new(),
        }
    }

    /// Spawn the configured number of workers. Idempotent only in the
    /// sense that it should be called once at startup.
    pub fn start(&mut self) {
        if self.registry.is_empty() {
            warn!("starting work service with no registered jobs");
        }
        info!(
            instance = %self.config.instance_name,
            workers = self.config.worker_count,
            "starting work service"
        );

        for id in 0..self.config.worker_count {
            let instance_name = format!("{}-{id}", self.config.instance_name);
            let runner = JobRunner::new(
                self.store.clone(),
                self.registry.clone(),
                self.captures.clone(),
                self.clock.clone(),
                RunnerConfig {
                    instance_name: instance_name.clone(),
                    poll_interval: self.config.poll_interval,
                    invisibility: self.config.invisibility,
                    include_continuations_inline: false,
                },
                self.events.clone(),
            );
            let status = runner.status();
            let task = tokio::spawn(runner.run(self.cancel.child_token()));
            self.workers.push(Worker {
                id,
                instance_name,
                status,
                task,
            });
        }
    }

    /// Aggregated heartbeat snapshots across all workers.
    pub fn status(&self) -> Vec<RunnerSnapshot> {
        self.workers.iter().map(Worker::snapshot).collect()
    }

    /// Live stream of invocation lifecycle events from every worker.
    pub fn subscribe_events(&self) -> broadcast::Receiver<InvocationEvent> {
        self.events.subscribe()
    }

    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Cancel every worker and wait for the runners to wind down.
    pub async fn stop(&mut self) {
        info!(instance = %self.config.instance_name, "stopping work service");
        self.cancel.cancel();
        for worker in self.workers.drain(..) {
            if let Err(err) = worker.task.await {
                warn!(worker = worker.id, error = %err, "worker task ended abnormally");
            }
        }
    }

    /// Start the workers and run until ctrl-c.
    pub async fn run_until_shutdown(mut self) -> Result<()> {
        self.start();
        tokio::signal::ctrl_c().await?;
        info!("received shutdown signal");
        self.stop().await;
        Ok(())
    }
}
