use std::sync::Mutex;

use futures::future::BoxFuture;
use serde_json::Value;

use weft_core::error::{Result, WeftError};
use weft_core::traits::TraceSink;
use weft_core::types::{InstanceId, SpanHandle, SpanStart};

/// A span as recorded by [`RecordingTraceSink`].
#[derive(Debug, Clone)]
pub struct RecordedSpan {
    pub handle: SpanHandle,
    pub trace_id: String,
    pub instance_id: InstanceId,
    pub step_id: String,
    pub step_name: String,
    pub node_type: String,
    pub metadata: Value,
    pub completed: bool,
    pub outputs: Option<Value>,
    /// `(error_code, error_message)` when the span failed.
    pub failure: Option<(String, String)>,
    pub details: Option<Value>,
}

/// Trace sink that keeps every span in memory.
#[derive(Default)]
pub struct RecordingTraceSink {
    spans: Mutex<Vec<RecordedSpan>>,
}

impl RecordingTraceSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spans(&self) -> Vec<RecordedSpan> {
        self.spans.lock().unwrap().clone()
    }

    fn update(&self, handle: &SpanHandle, f: impl FnOnce(&mut RecordedSpan)) -> Result<()> {
        let mut spans = self.spans.lock().unwrap();
        let span = spans
            .iter_mut()
            .find(|s| &s.handle == handle)
            .ok_or_else(|| WeftError::Database(format!("unknown span: {}", handle.0)))?;
        f(span);
        Ok(())
    }
}

impl TraceSink for RecordingTraceSink {
    fn start_span(&self, span: SpanStart) -> BoxFuture<'_, Result<SpanHandle>> {
        let handle = {
            let mut spans = self.spans.lock().unwrap();
            let handle = SpanHandle(format!("span-{}", spans.len() + 1));
            spans.push(RecordedSpan {
                handle: handle.clone(),
                trace_id: span.trace_id,
                instance_id: span.instance_id,
                step_id: span.step_id,
                step_name: span.step_name,
                node_type: span.node_type,
                metadata: span.metadata,
                completed: false,
                outputs: None,
                failure: None,
                details: None,
            });
            handle
        };
        Box::pin(async move { Ok(handle) })
    }

    fn complete_span(&self, handle: &SpanHandle, outputs: Value) -> BoxFuture<'_, Result<()>> {
        let result = self.update(handle, |s| {
            s.completed = true;
            s.outputs = Some(outputs);
        });
        Box::pin(async move { result })
    }

    fn fail_span(
        &self,
        handle: &SpanHandle,
        error_code: &str,
        error_message: &str,
        details: Option<Value>,
    ) -> BoxFuture<'_, Result<()>> {
        let result = self.update(handle, |s| {
            s.failure = Some((error_code.to_string(), error_message.to_string()));
            s.details = details;
        });
        Box::pin(async move { result })
    }
}
