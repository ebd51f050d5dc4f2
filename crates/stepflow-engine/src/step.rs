use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use stepflow_core::config::NodeDefaults;
use stepflow_core::context::RunContext;
use stepflow_core::error::{Result, StepflowError};
use stepflow_core::event::EventKind;
use stepflow_core::traits::Executor;
use stepflow_core::types::{ExecutorType, StepInput, StepMetrics, StepOutput};

use crate::executor::{FunctionExecutor, StepExecutor};
use crate::node::finish_output;

const DEFAULT_BACKOFF_BASE: Duration = Duration::from_secs(1);

/// A single unit of work with retry, timeout, and skip policy.
pub struct Step {
    name: Option<String>,
    description: Option<String>,
    executor: StepExecutor,
    max_retries: u32,
    backoff_base: Duration,
    timeout: Option<Duration>,
    skip_on_failure: bool,
}

/// Builder for [`Step`]. Exactly one of `function`, `agent`, or `team` must
/// be set.
#[derive(Default)]
pub struct StepBuilder {
    name: Option<String>,
    description: Option<String>,
    function: Option<FunctionExecutor>,
    agent: Option<Arc<dyn Executor>>,
    team: Option<Arc<dyn Executor>>,
    max_retries: u32,
    backoff_base: Option<Duration>,
    timeout: Option<Duration>,
    skip_on_failure: bool,
}

impl StepBuilder {
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn function(mut self, function: FunctionExecutor) -> Self {
        self.function = Some(function);
        self
    }

    pub fn agent(mut self, agent: Arc<dyn Executor>) -> Self {
        self.agent = Some(agent);
        self
    }

    pub fn team(mut self, team: Arc<dyn Executor>) -> Self {
        self.team = Some(team);
        self
    }

    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Attempt N waits `N x base` before attempt N + 1.
    pub fn backoff_base(mut self, base: Duration) -> Self {
        self.backoff_base = Some(base);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn skip_on_failure(mut self, skip: bool) -> Self {
        self.skip_on_failure = skip;
        self
    }

    /// Apply retry, backoff, and timeout defaults from config.
    pub fn defaults(mut self, defaults: &NodeDefaults) -> Self {
        self.max_retries = defaults.max_retries;
        self.backoff_base = Some(defaults.backoff_base());
        self.timeout = defaults.timeout();
        self
    }

    pub fn build(self) -> Result<Step> {
        let label = self.name.clone().unwrap_or_else(|| "<unnamed>".to_string());
        let mut executors = Vec::with_capacity(1);
        if let Some(f) = self.function {
            executors.push(StepExecutor::Function(f));
        }
        if let Some(a) = self.agent {
            executors.push(StepExecutor::Agent(a));
        }
        if let Some(t) = self.team {
            executors.push(StepExecutor::Team(t));
        }
        if executors.len() > 1 {
            return Err(StepflowError::Configuration(format!(
                "step '{}' has {} executors; set exactly one of function, agent, or team",
                label,
                executors.len()
            )));
        }
        let Some(executor) = executors.pop() else {
            return Err(StepflowError::Configuration(format!(
                "step '{}' has no executor; set one of function, agent, or team",
                label
            )));
        };

        Ok(Step {
            name: self.name,
            description: self.description,
            executor,
            max_retries: self.max_retries,
            backoff_base: self.backoff_base.unwrap_or(DEFAULT_BACKOFF_BASE),
            timeout: self.timeout,
            skip_on_failure: self.skip_on_failure,
        })
    }
}

impl Step {
    pub fn builder() -> StepBuilder {
        StepBuilder::default()
    }

    /// An unnamed step around a function, with default policy.
    pub fn from_function(function: FunctionExecutor) -> Self {
        Self {
            name: None,
            description: None,
            executor: StepExecutor::Function(function),
            max_retries: 0,
            backoff_base: DEFAULT_BACKOFF_BASE,
            timeout: None,
            skip_on_failure: false,
        }
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn executor(&self) -> &StepExecutor {
        &self.executor
    }

    pub fn executor_type(&self) -> ExecutorType {
        self.executor.executor_type()
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn skips_on_failure(&self) -> bool {
        self.skip_on_failure
    }

    pub(crate) fn display_name(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| self.executor.name().to_string())
    }

    pub async fn execute(&self, ctx: &RunContext, input: StepInput) -> Result<StepOutput> {
        let name = self.display_name();
        ctx.check_cancelled()?;
        let start = Utc::now();
        let output = self.run(ctx, input, &name).await?;
        Ok(finish_output(output, &name, self.executor_type(), start))
    }

    pub(crate) async fn run(&self, ctx: &RunContext, input: StepInput, name: &str) -> Result<StepOutput> {
        let start = Utc::now();
        let deadline = self.timeout.map(|t| tokio::time::Instant::now() + t);
        let max_attempts = self.max_retries + 1;
        let mut attempt = 0u32;

        let failure = loop {
            attempt += 1;
            debug!(step = %name, attempt, max_attempts, "Executing step");

            let result = match deadline {
                Some(deadline) => self.attempt_until(ctx, &input, name, deadline).await,
                None => self.attempt(ctx, &input, name).await,
            };

            let err = match result {
                Ok(output) => return Ok(self.complete(output, name, start, attempt)),
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => e,
            };

            let timed_out = matches!(err, StepflowError::Timeout { .. });
            if timed_out || attempt >= max_attempts {
                break err;
            }

            let backoff = self.backoff_base * attempt;
            warn!(
                step = %name,
                attempt,
                max_attempts,
                backoff_ms = backoff.as_millis() as u64,
                error = %err,
                "Step attempt failed, retrying"
            );
            tokio::select! {
                _ = ctx.cancelled() => return Err(StepflowError::Cancelled),
                _ = tokio::time::sleep(backoff) => {}
            }
        };

        let metrics = StepMetrics::new(name, self.executor_type(), start)
            .failed(failure.to_string())
            .with_retries(attempt - 1);

        if self.skip_on_failure {
            info!(step = %name, attempts = attempt, error = %failure, "Step failed, skipping");
            let mut output = StepOutput::new(Value::Null)
                .with_name(name)
                .with_executor(self.executor.name(), self.executor_type())
                .with_event(EventKind::StepSkipped)
                .with_metadata("skip_on_failure", true)
                .with_metadata("skipped", true)
                .with_metadata("error", failure.to_string())
                .with_metadata("attempts", attempt);
            output.metrics = Some(metrics);
            return Ok(output);
        }

        error!(step = %name, attempts = attempt, error = %failure, "Step failed");
        Err(StepflowError::StepFailed {
            step: name.to_string(),
            attempts: attempt,
            source: Box::new(failure),
        })
    }

    async fn attempt_until(
        &self,
        ctx: &RunContext,
        input: &StepInput,
        name: &str,
        deadline: tokio::time::Instant,
    ) -> Result<StepOutput> {
        let timeout_ms = self.timeout.map_or(0, |t| t.as_millis() as u64);
        let expired = || StepflowError::Timeout {
            step: name.to_string(),
            timeout_ms,
        };
        if tokio::time::Instant::now() >= deadline {
            return Err(expired());
        }
        match tokio::time::timeout_at(deadline, self.attempt(ctx, input, name)).await {
            Ok(result) => result,
            Err(_) => Err(expired()),
        }
    }

    async fn attempt(&self, ctx: &RunContext, input: &StepInput, name: &str) -> Result<StepOutput> {
        match &self.executor {
            StepExecutor::Function(f) => f.call(ctx, input.clone()).await,
            StepExecutor::Agent(exec) | StepExecutor::Team(exec) => {
                let message = input.effective_content().clone();
                let content = if ctx.streaming() && exec.supports_streaming() {
                    Value::String(stream_executor(ctx, exec.as_ref(), message, name).await?)
                } else {
                    exec.execute(ctx, message).await?
                };
                Ok(StepOutput::new(content))
            }
        }
    }

    fn complete(&self, mut output: StepOutput, name: &str, start: chrono::DateTime<Utc>, attempts: u32) -> StepOutput {
        if output.step_name.is_empty() {
            output.step_name = name.to_string();
        }
        if output.executor_name.is_empty() {
            output.executor_name = self.executor.name().to_string();
            output.executor_type = self.executor_type();
        }
        output.metrics =
            Some(StepMetrics::new(name, self.executor_type(), start).with_retries(attempts - 1));
        debug!(step = %name, attempts, "Step completed");
        output
    }
}

/// Drive an executor's output stream through a bounded channel, emitting a
/// `step_output` event per chunk and returning the accumulated text.
async fn stream_executor(
    ctx: &RunContext,
    exec: &dyn Executor,
    message: Value,
    name: &str,
) -> Result<String> {
    let mut stream = exec.execute_stream(ctx, message).await?;
    let (tx, mut rx) = mpsc::channel::<Result<String>>(ctx.stream_buffer());

    let producer = async move {
        loop {
            let item = tokio::select! {
                _ = tx.closed() => break,
                item = stream.next() => item,
            };
            let Some(item) = item else { break };
            let stop = item.is_err();
            if tx.send(item).await.is_err() || stop {
                break;
            }
        }
    };

    let consumer = async move {
        let mut text = String::new();
        let mut chunks = 0usize;
        loop {
            let received = tokio::select! {
                _ = ctx.cancelled() => return Err(StepflowError::Cancelled),
                received = rx.recv() => received,
            };
            match received {
                Some(Ok(chunk)) => {
                    chunks += 1;
                    ctx.emit(
                        EventKind::StepOutput,
                        json!({ "step": name, "chunk": chunk, "index": chunks }),
                    )
                    .await;
                    text.push_str(&chunk);
                }
                Some(Err(e)) => return Err(e),
                None => break,
            }
        }
        debug!(step = %name, chunks, "Stream finished");
        Ok(text)
    };

    let ((), result) = tokio::join!(producer, consumer);
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use stepflow_core::event::EventBus;
    use stepflow_test_utils::{MockAgent, FailingExecutor};
    use tokio_util::sync::CancellationToken;

    fn counting_failure(counter: Arc<AtomicU32>) -> FunctionExecutor {
        FunctionExecutor::sync("always-fails", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(StepflowError::executor("nope"))
        })
    }

    #[test]
    fn build_requires_exactly_one_executor() {
        let err = Step::builder().name("empty").build().err().unwrap();
        assert!(matches!(err, StepflowError::Configuration(ref m) if m.contains("no executor")));

        let err = Step::builder()
            .name("two")
            .function(FunctionExecutor::sync("f", |_| Ok(StepOutput::default())))
            .agent(Arc::new(MockAgent::new("a", vec!["x"])))
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, StepflowError::Configuration(ref m) if m.contains("2 executors")));
    }

    #[tokio::test]
    async fn retries_then_fails_with_attempt_count() {
        let calls = Arc::new(AtomicU32::new(0));
        let step = Step::builder()
            .name("flaky")
            .function(counting_failure(calls.clone()))
            .max_retries(2)
            .backoff_base(Duration::from_millis(1))
            .build()
            .unwrap();

        let err = step
            .execute(&RunContext::detached(), StepInput::new("x"))
            .await
            .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        match err {
            StepflowError::StepFailed { step, attempts, .. } => {
                assert_eq!(step, "flaky");
                assert_eq!(attempts, 3);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn skip_on_failure_returns_marked_output() {
        let calls = Arc::new(AtomicU32::new(0));
        let step = Step::builder()
            .name("optional")
            .function(counting_failure(calls.clone()))
            .max_retries(1)
            .backoff_base(Duration::from_millis(1))
            .skip_on_failure(true)
            .build()
            .unwrap();

        let out = step
            .execute(&RunContext::detached(), StepInput::new("x"))
            .await
            .unwrap();
        assert!(out.is_skipped());
        assert_eq!(out.content, Value::Null);
        assert_eq!(out.metadata.get("skip_on_failure"), Some(&json!(true)));
        assert_eq!(out.metadata.get("attempts"), Some(&json!(2)));
        assert!(out.metadata["error"].as_str().unwrap().contains("nope"));
        let metrics = out.metrics.unwrap();
        assert!(!metrics.success);
        assert_eq!(metrics.retry_count, 1);
    }

    #[tokio::test]
    async fn success_after_retry_records_retry_count() {
        let agent = Arc::new(MockAgent::new("writer", vec!["done"]).failing_first(1));
        let step = Step::builder()
            .agent(agent.clone())
            .max_retries(3)
            .backoff_base(Duration::from_millis(1))
            .build()
            .unwrap();

        let out = step
            .execute(&RunContext::detached(), StepInput::new("draft"))
            .await
            .unwrap();
        assert_eq!(out.content, json!("done"));
        assert_eq!(out.step_name, "writer");
        assert_eq!(out.executor_type, ExecutorType::Agent);
        assert_eq!(out.metrics.unwrap().retry_count, 1);
        assert_eq!(agent.calls(), 2);
    }

    #[tokio::test]
    async fn agent_receives_previous_content_when_present() {
        let agent = Arc::new(MockAgent::echo("echo"));
        let step = Step::builder().agent(agent.clone()).build().unwrap();

        let input = StepInput::new("original").with_previous_content(json!("chained"));
        let out = step.execute(&RunContext::detached(), input).await.unwrap();
        assert_eq!(out.content, json!("chained"));

        let out = step
            .execute(&RunContext::detached(), StepInput::new("original"))
            .await
            .unwrap();
        assert_eq!(out.content, json!("original"));
    }

    #[tokio::test]
    async fn timeout_stops_retries() {
        let slow = FunctionExecutor::new("slow", |_ctx, _input| async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(StepOutput::new("late"))
        });
        let step = Step::builder()
            .name("slow")
            .function(slow)
            .max_retries(5)
            .backoff_base(Duration::from_millis(1))
            .timeout(Duration::from_millis(20))
            .build()
            .unwrap();

        let err = step
            .execute(&RunContext::detached(), StepInput::new("x"))
            .await
            .unwrap_err();
        match err {
            StepflowError::StepFailed { attempts, source, .. } => {
                assert_eq!(attempts, 1);
                assert!(matches!(*source, StepflowError::Timeout { timeout_ms: 20, .. }));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn cancellation_during_backoff_is_not_wrapped() {
        let token = CancellationToken::new();
        let ctx = RunContext::new("r", "w", token.clone());
        let step = Step::builder()
            .agent(Arc::new(FailingExecutor::new("broken")))
            .max_retries(3)
            .backoff_base(Duration::from_secs(30))
            .skip_on_failure(true)
            .build()
            .unwrap();

        let cancel = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel.cancel();
        });

        let err = step.execute(&ctx, StepInput::new("x")).await.unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn streaming_accumulates_chunks_and_emits_events() {
        let bus = Arc::new(EventBus::new(64));
        let mut rx = bus.subscribe();
        let ctx = RunContext::detached()
            .with_events(bus.clone())
            .with_streaming(2);
        let agent = Arc::new(MockAgent::streaming("streamer", vec!["Hel", "lo", "!"]));
        let step = Step::builder().name("talk").agent(agent).build().unwrap();

        let out = step.execute(&ctx, StepInput::new("hi")).await.unwrap();
        assert_eq!(out.content, json!("Hello!"));

        let mut chunks = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if event.kind == EventKind::StepOutput {
                chunks.push(event.payload["chunk"].as_str().unwrap().to_string());
            }
        }
        assert_eq!(chunks, vec!["Hel", "lo", "!"]);
    }

    #[tokio::test]
    async fn streaming_is_ignored_when_disabled() {
        let agent = Arc::new(MockAgent::streaming("streamer", vec!["a", "b"]));
        let step = Step::builder().agent(agent).build().unwrap();
        let out = step
            .execute(&RunContext::detached(), StepInput::new("hi"))
            .await
            .unwrap();
        assert_eq!(out.content, json!("ab"));
    }
}
