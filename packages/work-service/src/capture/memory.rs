//! In-memory log capture: records are buffered and streamable but no
//! artifact is persisted.

use std::sync::Arc;

use async_trait::async_trait;

use super::{CaptureFactory, CaptureSink, LogCapture};
use crate::clock::Clock;
use crate::error::CaptureError;
use crate::invocation::Invocation;

pub struct InMemoryLogCapture {
    sink: CaptureSink,
}

impl InMemoryLogCapture {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            sink: CaptureSink::new(clock),
        }
    }
}

#[async_trait]
impl LogCapture for InMemoryLogCapture {
    fn sink(&self) -> CaptureSink {
        self.sink.clone()
    }

    async fn start(&mut self) -> Result<(), CaptureError> {
        self.sink.arm();
        Ok(())
    }

    async fn end(&mut self) -> Option<String> {
        self.sink.disarm();
        None
    }
}

pub struct MemoryCaptureFactory {
    clock: Arc<dyn Clock>,
}

impl MemoryCaptureFactory {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }
}

impl CaptureFactory for MemoryCaptureFactory {
    fn for_invocation(&self, _invocation: &Invocation) -> Box<dyn LogCapture> {
        Box::new(InMemoryLogCapture::new(self.clock.clone()))
    }
}
