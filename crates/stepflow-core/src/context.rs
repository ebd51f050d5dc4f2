use std::sync::Arc;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::{Result, StepflowError};
use crate::event::{EventBus, EventKind, WorkflowEvent};
use crate::traits::EventSink;

const DEFAULT_STREAM_BUFFER: usize = 64;

/// Run-scoped context threaded from `Workflow::run` through every node.
///
/// Carries the cancellation token for the run, the identifiers stamped on
/// emitted events, and the streaming switch. Cloning is cheap; clones share
/// the same token and event bus.
#[derive(Clone)]
pub struct RunContext {
    run_id: String,
    workflow_id: String,
    session_id: Option<String>,
    cancel: CancellationToken,
    events: Option<Arc<EventBus>>,
    sink: Option<Arc<dyn EventSink>>,
    stream: bool,
    stream_buffer: usize,
}

impl RunContext {
    pub fn new(
        run_id: impl Into<String>,
        workflow_id: impl Into<String>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            workflow_id: workflow_id.into(),
            session_id: None,
            cancel,
            events: None,
            sink: None,
            stream: false,
            stream_buffer: DEFAULT_STREAM_BUFFER,
        }
    }

    /// A context with its own token and no event delivery, for running a
    /// node outside a workflow.
    pub fn detached() -> Self {
        Self::new(
            uuid::Uuid::new_v4().to_string(),
            "detached",
            CancellationToken::new(),
        )
    }

    pub fn with_events(mut self, bus: Arc<EventBus>) -> Self {
        self.events = Some(bus);
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Enable streaming for agent steps that support it. `buffer` bounds the
    /// chunk channel.
    pub fn with_streaming(mut self, buffer: usize) -> Self {
        self.stream = true;
        self.stream_buffer = buffer.max(1);
        self
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn workflow_id(&self) -> &str {
        &self.workflow_id
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn streaming(&self) -> bool {
        self.stream
    }

    pub fn stream_buffer(&self) -> usize {
        self.stream_buffer
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the run is cancelled.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    /// Fail with `Cancelled` if the run has been cancelled.
    pub fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(StepflowError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Publish an event to the bus and forward it to the sink, if any.
    /// Sink failures are logged, never propagated.
    pub async fn emit(&self, kind: EventKind, payload: Value) {
        if self.events.is_none() && self.sink.is_none() {
            return;
        }
        let mut event = WorkflowEvent::new(kind, &self.run_id, &self.workflow_id, payload);
        if let Some(ref sid) = self.session_id {
            event = event.with_metadata("session_id", Value::String(sid.clone()));
        }
        if let Some(ref bus) = self.events {
            bus.publish(event.clone());
        }
        if let Some(ref sink) = self.sink {
            if let Err(e) = sink.send(&event).await {
                warn!(event = %kind, error = %e, "Event sink rejected event");
            }
        }
    }
}

impl std::fmt::Debug for RunContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunContext")
            .field("run_id", &self.run_id)
            .field("workflow_id", &self.workflow_id)
            .field("session_id", &self.session_id)
            .field("cancelled", &self.cancel.is_cancelled())
            .field("events", &self.events.is_some())
            .field("sink", &self.sink.is_some())
            .field("stream", &self.stream)
            .finish()
    }
}
