//! Cursor blobs for repeat jobs that track an external watermark.
//!
//! A cursor is a tiny JSON document with a single timestamp field, stored
//! next to the log blobs. The contract is between a job and its own
//! cursor; the scheduler never interprets the value.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::capture::BlobStore;
use crate::error::CaptureError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct CursorDocument {
    value: DateTime<Utc>,
}

/// A named watermark a repeat job reads before working and advances after.
pub struct JobCursor {
    key: String,
    blobs: Arc<dyn BlobStore>,
}

impl JobCursor {
    pub fn new(name: &str, blobs: Arc<dyn BlobStore>) -> Self {
        Self {
            key: format!("cursors/{name}.json"),
            blobs,
        }
    }

    /// The stored watermark, `None` when the job has never advanced it.
    pub async fn get(&self) -> Result<Option<DateTime<Utc>>, CaptureError> {
        match self.blobs.get(&self.key).await? {
            None => Ok(None),
            Some(body) => {
                let document: CursorDocument = serde_json::from_slice(&body)?;
                Ok(Some(document.value))
            }
        }
    }

    /// Overwrite the watermark.
    pub async fn set(&self, value: DateTime<Utc>) -> Result<(), CaptureError> {
        let body = serde_json::to_vec(&CursorDocument { value })?;
        self.blobs.put(&self.key, body.into()).await?;
        Ok(())
    }
}
