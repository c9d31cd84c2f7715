//! Per-invocation log capture.
//!
//! For the lifetime of one dispatch attempt, structured records emitted
//! through the invocation's [`CaptureSink`] are buffered, streamed to
//! in-process subscribers, and (for the blob-backed variant) uploaded as
//! a JSON-lines artifact when the attempt ends. Records written while no
//! capture is armed are dropped.
//!
//! Capture failure is never fatal to the dispatch cycle: `end()` reports
//! `None` and the outcome commit proceeds with an unset log url.

mod blob;
mod blob_store;
mod memory;

pub use blob::{blob_key, BlobCaptureFactory, BlobLogCapture};
pub use blob_store::{BlobStore, FsBlobStore, MemoryBlobStore};
pub use memory::{InMemoryLogCapture, MemoryCaptureFactory};

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::clock::Clock;
use crate::error::CaptureError;
use crate::invocation::Invocation;

const LIVE_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

/// One structured event in an invocation's log stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRecord {
    pub at: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub fields: BTreeMap<String, serde_json::Value>,
}

/// Cloneable handle handlers write their log records through.
///
/// Buffers for the artifact upload and fans out to live subscribers.
/// Writes are silently dropped until the owning capture arms the sink
/// and after it ends.
#[derive(Clone)]
pub struct CaptureSink {
    inner: Arc<SinkInner>,
}

struct SinkInner {
    armed: AtomicBool,
    clock: Arc<dyn Clock>,
    records: Mutex<Vec<LogRecord>>,
    live: broadcast::Sender<LogRecord>,
}

impl CaptureSink {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        let (live, _) = broadcast::channel(LIVE_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(SinkInner {
                armed: AtomicBool::new(false),
                clock,
                records: Mutex::new(Vec::new()),
                live,
            }),
        }
    }

    pub fn record(&self, level: LogLevel, message: impl Into<String>) {
        self.record_with(level, message, BTreeMap::new());
    }

    pub fn record_with(
        &self,
        level: LogLevel,
        message: impl Into<String>,
        fields: BTreeMap<String, serde_json::Value>,
    ) {
        if !self.inner.armed.load(Ordering::Acquire) {
            return;
        }
        let record = LogRecord {
            at: self.inner.clock.now(),
            level,
            message: message.into(),
            fields,
        };
        self.inner
            .records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(record.clone());
        // No live subscribers is fine.
        let _ = self.inner.live.send(record);
    }

    pub fn debug(&self, message: impl Into<String>) {
        self.record(LogLevel::Debug, message);
    }

    pub fn info(&self, message: impl Into<String>) {
        self.record(LogLevel::Info, message);
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.record(LogLevel::Warning, message);
    }

    pub fn error(&self, message: impl Into<String>) {
        self.record(LogLevel::Error, message);
    }

    /// Live stream of records as they are written.
    pub fn subscribe(&self) -> broadcast::Receiver<LogRecord> {
        self.inner.live.subscribe()
    }

    /// Everything recorded so far.
    pub fn records(&self) -> Vec<LogRecord> {
        self.inner
            .records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub(crate) fn arm(&self) {
        self.inner.armed.store(true, Ordering::Release);
    }

    pub(crate) fn disarm(&self) {
        self.inner.armed.store(false, Ordering::Release);
    }
}

/// One capture per dispatch attempt.
#[async_trait]
pub trait LogCapture: Send {
    /// The sink handlers write through.
    fn sink(&self) -> CaptureSink;

    /// Arm the sink; on a resumed continuation the blob variant pulls the
    /// prior artifact so the new records append to it.
    async fn start(&mut self) -> Result<(), CaptureError>;

    /// Detach, flush and upload. Returns the artifact address, `None` for
    /// the in-memory variant or when the upload failed.
    async fn end(&mut self) -> Option<String>;
}

/// Builds a capture for each invocation a runner dispatches.
pub trait CaptureFactory: Send + Sync {
    fn for_invocation(&self, invocation: &Invocation) -> Box<dyn LogCapture>;
}
