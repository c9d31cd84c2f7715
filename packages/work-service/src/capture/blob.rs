//! Blob-backed log capture.
//!
//! The artifact lives at `invocations/<id-hex>.json` as a JSON-lines
//! sequence. Blob names derive from the invocation id alone, so the key
//! is case-stable across re-deliveries of the same row. A continuation
//! row seeds from its predecessor's artifact (named by the row's
//! `source` link) and uploads the combined body under its own key, so
//! every resume carries the chain's full log forward.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tracing::warn;
use uuid::Uuid;

use super::{BlobStore, CaptureFactory, CaptureSink, LogCapture};
use crate::clock::Clock;
use crate::error::CaptureError;
use crate::invocation::Invocation;

/// Artifact key for an invocation's log blob. Case-stable: the same id
/// always maps to the same key.
pub fn blob_key(invocation_id: Uuid) -> String {
    format!("invocations/{}.json", invocation_id.simple())
}

pub struct BlobLogCapture {
    key: String,
    /// Artifact to download and append to on start, when one exists.
    prior_key: Option<String>,
    blobs: Arc<dyn BlobStore>,
    sink: CaptureSink,
    prior: Option<Bytes>,
}

impl BlobLogCapture {
    pub fn new(invocation: &Invocation, blobs: Arc<dyn BlobStore>, clock: Arc<dyn Clock>) -> Self {
        let key = blob_key(invocation.id);
        let prior_key = if invocation.is_continuation {
            Uuid::parse_str(&invocation.source)
                .ok()
                .map(blob_key)
        } else if invocation.dequeue_count > 1 {
            // Redelivery after lease expiry appends to this row's own blob.
            Some(key.clone())
        } else {
            None
        };
        Self {
            key,
            prior_key,
            blobs,
            sink: CaptureSink::new(clock),
            prior: None,
        }
    }
}

#[async_trait]
impl LogCapture for BlobLogCapture {
    fn sink(&self) -> CaptureSink {
        self.sink.clone()
    }

    async fn start(&mut self) -> Result<(), CaptureError> {
        if let Some(prior_key) = &self.prior_key {
            match self.blobs.get(prior_key).await {
                Ok(prior) => self.prior = prior,
                Err(err) => {
                    // Start fresh rather than lose the new attempt's records.
                    warn!(key = %prior_key, error = %err, "failed to download prior log blob");
                }
            }
        }
        self.sink.arm();
        Ok(())
    }

    async fn end(&mut self) -> Option<String> {
        self.sink.disarm();

        let mut body = BytesMut::new();
        if let Some(prior) = &self.prior {
            body.extend_from_slice(prior);
            if !prior.is_empty() && !prior.ends_with(b"\n") {
                body.extend_from_slice(b"\n");
            }
        }
        for record in self.sink.records() {
            match serde_json::to_vec(&record) {
                Ok(line) => {
                    body.extend_from_slice(&line);
                    body.extend_from_slice(b"\n");
                }
                Err(err) => warn!(error = %err, "skipping unserializable log record"),
            }
        }

        // An attempt with no events still produces a well-formed (empty)
        // artifact.
        match self.blobs.put(&self.key, body.freeze()).await {
            Ok(url) => Some(url),
            Err(err) => {
                warn!(key = %self.key, error = %err, "failed to upload log blob");
                None
            }
        }
    }
}

pub struct BlobCaptureFactory {
    blobs: Arc<dyn BlobStore>,
    clock: Arc<dyn Clock>,
}

impl BlobCaptureFactory {
    pub fn new(blobs: Arc<dyn BlobStore>, clock: Arc<dyn Clock>) -> Self {
        Self { blobs, clock }
    }
}

impl CaptureFactory for BlobCaptureFactory {
    fn for_invocation(&self, invocation: &Invocation) -> Box<dyn LogCapture> {
        Box::new(BlobLogCapture::new(
            invocation,
            self.blobs.clone(),
            self.clock.clone(),
        ))
    }
}
