use futures::future::BoxFuture;
use futures::stream::BoxStream;
use serde_json::Value;

use crate::context::RunContext;
use crate::error::{Result, StepflowError};
use crate::event::WorkflowEvent;
use crate::types::WorkflowSession;

/// Executor capability: an agent, a team of agents, or any other
/// long-running unit that accepts a message and returns a result.
pub trait Executor: Send + Sync + 'static {
    /// Stable display name.
    fn name(&self) -> &str;

    /// Run against a plain-text or structured message.
    fn execute<'a>(&'a self, ctx: &'a RunContext, message: Value) -> BoxFuture<'a, Result<Value>>;

    /// Whether `execute_stream` yields incremental output.
    fn supports_streaming(&self) -> bool {
        false
    }

    /// Run and receive the output as a stream of text chunks.
    fn execute_stream<'a>(
        &'a self,
        ctx: &'a RunContext,
        message: Value,
    ) -> BoxFuture<'a, Result<BoxStream<'a, Result<String>>>> {
        let _ = (ctx, message);
        Box::pin(async move {
            Err(StepflowError::Configuration(format!(
                "executor '{}' does not support streaming",
                self.name()
            )))
        })
    }
}

/// Session store: persistence backend for workflow sessions.
pub trait SessionStorage: Send + Sync + 'static {
    /// Insert or replace a session.
    fn save<'a>(&'a self, session: &'a WorkflowSession) -> BoxFuture<'a, Result<()>>;

    /// Load a session, `None` if it does not exist.
    fn load<'a>(&'a self, session_id: &'a str) -> BoxFuture<'a, Result<Option<WorkflowSession>>>;

    /// Delete a session. Deleting a missing session is not an error.
    fn delete<'a>(&'a self, session_id: &'a str) -> BoxFuture<'a, Result<()>>;
}

/// Transport-level event sink (e.g. push to a remote subscriber).
pub trait EventSink: Send + Sync + 'static {
    fn send(&self, event: &WorkflowEvent) -> BoxFuture<'_, Result<()>>;
}
