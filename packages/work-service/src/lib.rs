//! Background-job execution service for the package registry.
//!
//! Worker processes dequeue durable invocation records from a shared
//! queue, dispatch each to a named job handler, capture the handler's
//! log stream to an object-store blob, and commit the outcome back to
//! the durable store. Optimistic versioning on every row gives
//! at-most-once committed execution; suspend/resume continuations and
//! repeat scheduling provide cooperative long-running work.
//!
//! Layout mirrors the data flow:
//! - [`store`] - the durable queue (Postgres, plus an in-memory double)
//! - [`capture`] - per-invocation log capture and the blob store
//! - [`dispatch`] - handlers, the registry, payload binding, outcomes
//! - [`runner`] - the poll, dispatch, commit loop
//! - [`worker`] - N workers per process and their aggregated status

pub mod capture;
pub mod clock;
pub mod config;
pub mod context;
pub mod cursor;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod invocation;
pub mod payload;
pub mod runner;
pub mod store;
pub mod testing;
pub mod worker;

pub use capture::{BlobCaptureFactory, BlobStore, CaptureFactory, FsBlobStore, MemoryBlobStore};
pub use clock::{Clock, SystemClock};
pub use config::WorkConfig;
pub use context::InvocationContext;
pub use cursor::JobCursor;
pub use dispatch::{
    BindPayload, JobContinuation, JobDispatcher, JobHandler, JobOutcome, JobRegistry, OutcomeKind,
};
pub use error::{CaptureError, PayloadError, StoreError};
pub use events::InvocationEvent;
pub use invocation::{
    ExecutionResult, Invocation, InvocationStatus, SOURCE_BACKGROUND, SOURCE_REPEAT,
};
pub use payload::{Payload, PayloadBinder, PayloadEnum};
pub use runner::{JobRunner, RunnerConfig, RunnerSnapshot, RunnerStatus};
pub use store::{
    InvocationStore, JobStatistics, MemoryInvocationStore, PostgresInvocationStore,
    WorkerStatistics,
};
pub use worker::{WorkService, WorkServiceConfig, Worker};
