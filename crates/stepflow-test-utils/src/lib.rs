//! Mocks and fixtures shared by the stepflow test suites.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use futures::future::BoxFuture;
use futures::stream::BoxStream;
use serde_json::Value;

use stepflow_core::context::RunContext;
use stepflow_core::error::{Result, StepflowError};
use stepflow_core::event::{EventKind, WorkflowEvent};
use stepflow_core::traits::{EventSink, Executor};
use stepflow_core::types::StepInput;

enum Behavior {
    /// Scripted replies; the last one repeats once exhausted.
    Scripted(Vec<String>),
    /// Reply with the message unchanged.
    Echo,
    /// Stream these chunks; a non-streaming call returns them joined.
    Chunks(Vec<String>),
}

/// A scripted agent that counts its calls.
pub struct MockAgent {
    name: String,
    behavior: Behavior,
    fail_first: usize,
    calls: AtomicUsize,
}

impl MockAgent {
    pub fn new<I, S>(name: impl Into<String>, responses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::with_behavior(
            name,
            Behavior::Scripted(responses.into_iter().map(Into::into).collect()),
        )
    }

    pub fn echo(name: impl Into<String>) -> Self {
        Self::with_behavior(name, Behavior::Echo)
    }

    pub fn streaming<I, S>(name: impl Into<String>, chunks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::with_behavior(
            name,
            Behavior::Chunks(chunks.into_iter().map(Into::into).collect()),
        )
    }

    fn with_behavior(name: impl Into<String>, behavior: Behavior) -> Self {
        Self {
            name: name.into(),
            behavior,
            fail_first: 0,
            calls: AtomicUsize::new(0),
        }
    }

    /// Fail the first `n` calls with an executor error.
    pub fn failing_first(mut self, n: usize) -> Self {
        self.fail_first = n;
        self
    }

    /// Number of calls so far, failed ones included.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn next_call(&self) -> Result<usize> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.fail_first {
            return Err(StepflowError::executor(format!(
                "{} failed on call {}",
                self.name,
                call + 1
            )));
        }
        Ok(call - self.fail_first)
    }

    fn reply(&self, index: usize, message: Value) -> Value {
        match self.behavior {
            Behavior::Scripted(ref responses) => match responses.len() {
                0 => Value::Null,
                len => Value::String(responses[index.min(len - 1)].clone()),
            },
            Behavior::Echo => message,
            Behavior::Chunks(ref chunks) => Value::String(chunks.concat()),
        }
    }
}

impl Executor for MockAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn execute<'a>(&'a self, _ctx: &'a RunContext, message: Value) -> BoxFuture<'a, Result<Value>> {
        Box::pin(async move {
            let index = self.next_call()?;
            Ok(self.reply(index, message))
        })
    }

    fn supports_streaming(&self) -> bool {
        matches!(self.behavior, Behavior::Chunks(_))
    }

    fn execute_stream<'a>(
        &'a self,
        _ctx: &'a RunContext,
        _message: Value,
    ) -> BoxFuture<'a, Result<BoxStream<'a, Result<String>>>> {
        Box::pin(async move {
            self.next_call()?;
            let chunks = match self.behavior {
                Behavior::Chunks(ref chunks) => chunks.clone(),
                _ => Vec::new(),
            };
            let stream: BoxStream<'a, Result<String>> =
                Box::pin(futures::stream::iter(chunks.into_iter().map(Ok)));
            Ok(stream)
        })
    }
}

/// An executor that always fails.
pub struct FailingExecutor {
    name: String,
    calls: AtomicUsize,
}

impl FailingExecutor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Executor for FailingExecutor {
    fn name(&self) -> &str {
        &self.name
    }

    fn execute<'a>(&'a self, _ctx: &'a RunContext, _message: Value) -> BoxFuture<'a, Result<Value>> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(StepflowError::executor(format!("{} always fails", self.name)))
        })
    }
}

/// Event sink that keeps every event it receives.
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<WorkflowEvent>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<WorkflowEvent> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn kinds(&self) -> Vec<EventKind> {
        self.events().into_iter().map(|e| e.kind).collect()
    }

    /// Events of one kind, in arrival order.
    pub fn of_kind(&self, kind: EventKind) -> Vec<WorkflowEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.kind == kind)
            .collect()
    }
}

impl EventSink for RecordingSink {
    fn send(&self, event: &WorkflowEvent) -> BoxFuture<'_, Result<()>> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event.clone());
        Box::pin(futures::future::ready(Ok(())))
    }
}

/// A step input carrying `content` as the previous step's output.
pub fn chained_input(message: &str, content: impl Into<Value>) -> StepInput {
    StepInput::new(message).with_previous_content(content.into())
}
