use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use stepflow_core::config::AppConfig;
use stepflow_core::context::RunContext;
use stepflow_core::error::{Result, StepflowError};
use stepflow_core::event::{EventBus, EventKind, WorkflowEvent};
use stepflow_core::traits::{EventSink, SessionStorage};
use stepflow_core::types::{
    OutputLog, RunId, RunResponse, RunStatus, StepInput, WorkflowMetrics, WorkflowSession,
};

use crate::executor::FunctionExecutor;
use crate::input::WorkflowInput;
use crate::node::{child_input, Node};
use crate::step::Step;
use crate::store::RunStore;
use crate::validation::InputSchema;

const DEFAULT_STREAM_BUFFER: usize = 64;
const DEFAULT_EVENT_CAPACITY: usize = 256;

/// The step collection shapes a workflow accepts.
pub enum StepCollection {
    Steps(Vec<Step>),
    Functions(Vec<FunctionExecutor>),
    Function(FunctionExecutor),
    Nodes(Vec<Node>),
}

impl StepCollection {
    pub fn len(&self) -> usize {
        match self {
            Self::Steps(s) => s.len(),
            Self::Functions(f) => f.len(),
            Self::Function(_) => 1,
            Self::Nodes(n) => n.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn into_nodes(self) -> Vec<Node> {
        match self {
            Self::Steps(steps) => steps.into_iter().map(Node::Step).collect(),
            Self::Functions(functions) => functions
                .into_iter()
                .map(|f| Node::Step(Step::from_function(f)))
                .collect(),
            Self::Function(f) => vec![Node::Step(Step::from_function(f))],
            Self::Nodes(nodes) => nodes,
        }
    }
}

impl From<Vec<Step>> for StepCollection {
    fn from(steps: Vec<Step>) -> Self {
        Self::Steps(steps)
    }
}

impl From<Vec<FunctionExecutor>> for StepCollection {
    fn from(functions: Vec<FunctionExecutor>) -> Self {
        Self::Functions(functions)
    }
}

impl From<FunctionExecutor> for StepCollection {
    fn from(function: FunctionExecutor) -> Self {
        Self::Function(function)
    }
}

impl From<Vec<Node>> for StepCollection {
    fn from(nodes: Vec<Node>) -> Self {
        Self::Nodes(nodes)
    }
}

pub struct WorkflowBuilder {
    name: String,
    id: Option<String>,
    description: Option<String>,
    steps: Option<StepCollection>,
    input_schema: Option<InputSchema>,
    storage: Option<Arc<dyn SessionStorage>>,
    session_id: Option<String>,
    sink: Option<Arc<dyn EventSink>>,
    stream: bool,
    stream_buffer: usize,
    events_enabled: bool,
    event_capacity: usize,
}

impl WorkflowBuilder {
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            id: None,
            description: None,
            steps: None,
            input_schema: None,
            storage: None,
            session_id: None,
            sink: None,
            stream: false,
            stream_buffer: DEFAULT_STREAM_BUFFER,
            events_enabled: true,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }

    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn steps(mut self, steps: impl Into<StepCollection>) -> Self {
        self.steps = Some(steps.into());
        self
    }

    pub fn input_schema(mut self, schema: InputSchema) -> Self {
        self.input_schema = Some(schema);
        self
    }

    pub fn storage(mut self, storage: Arc<dyn SessionStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Stream output from agent steps that support it.
    pub fn stream(mut self, enabled: bool) -> Self {
        self.stream = enabled;
        self
    }

    pub fn stream_buffer(mut self, buffer: usize) -> Self {
        self.stream_buffer = buffer.max(1);
        self
    }

    /// Publish events to in-process handlers and subscribers.
    pub fn events(mut self, enabled: bool) -> Self {
        self.events_enabled = enabled;
        self
    }

    /// Apply `[workflow]` and `[events]` settings.
    pub fn config(mut self, config: &AppConfig) -> Self {
        if let Some(ref id) = config.workflow.id {
            self.id = Some(id.clone());
        }
        if let Some(ref session_id) = config.workflow.session_id {
            self.session_id = Some(session_id.clone());
        }
        self.stream = config.workflow.stream;
        self.stream_buffer = config.workflow.stream_buffer.max(1);
        self.events_enabled = config.events.enabled;
        self.event_capacity = config.events.capacity;
        self
    }

    pub fn build(self) -> Result<Workflow> {
        let steps = match self.steps {
            Some(steps) if !steps.is_empty() => steps,
            _ => {
                return Err(StepflowError::Configuration(format!(
                    "workflow '{}' has no steps",
                    self.name
                )))
            }
        };
        let id = self.id.unwrap_or_else(|| slug(&self.name));

        Ok(Workflow {
            store: RunStore::new(&id),
            id,
            name: self.name,
            description: self.description,
            nodes: steps.into_nodes(),
            input_schema: self.input_schema,
            storage: self.storage,
            session_id: self.session_id,
            sink: self.sink,
            events: Arc::new(EventBus::new(self.event_capacity)),
            events_enabled: self.events_enabled,
            stream: self.stream,
            stream_buffer: self.stream_buffer,
            run_lock: Mutex::new(()),
            cancel: CancellationToken::new(),
        })
    }
}

fn slug(name: &str) -> String {
    let slug: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect();
    let slug = slug.trim_matches('-').to_string();
    if slug.is_empty() {
        "workflow".to_string()
    } else {
        slug
    }
}

/// Top-level driver: runs a node list, records outputs and metrics, emits
/// lifecycle events, and persists the session.
pub struct Workflow {
    id: String,
    name: String,
    description: Option<String>,
    nodes: Vec<Node>,
    input_schema: Option<InputSchema>,
    storage: Option<Arc<dyn SessionStorage>>,
    session_id: Option<String>,
    sink: Option<Arc<dyn EventSink>>,
    events: Arc<EventBus>,
    events_enabled: bool,
    stream: bool,
    stream_buffer: usize,
    store: RunStore,
    run_lock: Mutex<()>,
    cancel: CancellationToken,
}

impl Workflow {
    pub fn builder(name: impl Into<String>) -> WorkflowBuilder {
        WorkflowBuilder::new(name)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// The bus every run publishes to.
    pub fn events(&self) -> Arc<EventBus> {
        self.events.clone()
    }

    /// Register a synchronous handler for one event kind.
    pub fn on<F>(&self, kind: EventKind, handler: F)
    where
        F: Fn(&WorkflowEvent) + Send + Sync + 'static,
    {
        self.events.on(kind, Arc::new(handler));
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<WorkflowEvent> {
        self.events.subscribe()
    }

    /// Parent token of every run. Cancelling it cancels the current run and
    /// any later one.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub async fn status(&self) -> RunStatus {
        self.store.status().await
    }

    /// Metrics of the current or most recent run.
    pub async fn metrics(&self) -> WorkflowMetrics {
        self.store.metrics().await
    }

    /// Outputs of the current or most recent run.
    pub async fn outputs(&self) -> OutputLog {
        self.store.snapshot().await
    }

    pub async fn run(&self, input: impl Into<WorkflowInput>) -> Result<RunResponse> {
        self.run_with_cancel(input, self.cancel.child_token()).await
    }

    /// Run with a caller-provided cancellation token.
    pub async fn run_with_cancel(
        &self,
        input: impl Into<WorkflowInput>,
        cancel: CancellationToken,
    ) -> Result<RunResponse> {
        let input = input.into();
        let _guard = self.run_lock.lock().await;

        if let Some(ref schema) = self.input_schema {
            schema.validate(&input.as_value())?;
        }

        let run_id = RunId::new().to_string();
        self.store.reset(&run_id, &self.id).await;
        let ctx = self.context(&run_id, cancel);

        let mut step_input = input.into_step_input()?;
        let mut session = self.load_session().await;
        if let Some(ref session) = session {
            if !session.state.is_empty() {
                step_input
                    .additional_data
                    .insert("session_state".to_string(), serde_json::to_value(&session.state)?);
            }
        }

        self.store.set_status(RunStatus::Running).await;
        info!(workflow = %self.name, run_id = %run_id, nodes = self.nodes.len(), "Workflow started");
        ctx.emit(
            EventKind::WorkflowStarted,
            json!({ "workflow": self.name, "message": step_input.message }),
        )
        .await;

        match self.execute_nodes(&ctx, step_input).await {
            Ok(content) => {
                let (metrics, outputs) = self.store.finish(RunStatus::Completed, None).await;
                info!(
                    workflow = %self.name,
                    run_id = %run_id,
                    steps = metrics.steps_executed,
                    duration_ms = metrics.duration_ms,
                    "Workflow completed"
                );
                ctx.emit(
                    EventKind::WorkflowCompleted,
                    json!({ "workflow": self.name, "content": content, "metrics": metrics }),
                )
                .await;

                let response = RunResponse {
                    run_id,
                    workflow_id: self.id.clone(),
                    workflow_name: self.name.clone(),
                    session_id: self.session_id.clone(),
                    status: RunStatus::Completed,
                    content,
                    created_at: metrics.start_time,
                    updated_at: metrics.end_time.unwrap_or_else(Utc::now),
                    metrics,
                    step_outputs: outputs,
                };
                if let Some(ref mut session) = session {
                    self.save_session(session, &response).await;
                }
                Ok(response)
            }
            Err(e) if e.is_cancelled() => {
                self.store
                    .finish(RunStatus::Cancelled, Some(e.to_string()))
                    .await;
                warn!(workflow = %self.name, run_id = %run_id, "Workflow cancelled");
                ctx.emit(EventKind::WorkflowCancelled, json!({ "workflow": self.name }))
                    .await;
                Err(e)
            }
            Err(e) => {
                self.store
                    .finish(RunStatus::Failed, Some(e.to_string()))
                    .await;
                error!(workflow = %self.name, run_id = %run_id, error = %e, "Workflow failed");
                ctx.emit(
                    EventKind::WorkflowFailed,
                    json!({ "workflow": self.name, "error": e.to_string() }),
                )
                .await;
                Err(e)
            }
        }
    }

    fn context(&self, run_id: &str, cancel: CancellationToken) -> RunContext {
        let mut ctx = RunContext::new(run_id, &self.id, cancel);
        if self.events_enabled {
            ctx = ctx.with_events(self.events.clone());
        }
        if let Some(ref sink) = self.sink {
            ctx = ctx.with_sink(sink.clone());
        }
        if let Some(ref session_id) = self.session_id {
            ctx = ctx.with_session(session_id);
        }
        if self.stream {
            ctx = ctx.with_streaming(self.stream_buffer);
        }
        ctx
    }

    async fn execute_nodes(&self, ctx: &RunContext, input: StepInput) -> Result<Value> {
        let mut previous = input.previous_content.clone();

        for (index, node) in self.nodes.iter().enumerate() {
            ctx.check_cancelled()?;
            let name = node.resolved_name(&format!("step_{}", index + 1));
            ctx.emit(
                EventKind::StepStarted,
                json!({ "step": name, "index": index, "executor_type": node.executor_type() }),
            )
            .await;

            let node_input = child_input(&input, previous.clone(), self.store.snapshot().await);
            let start = Utc::now();
            match node.execute_named(ctx, node_input, name.clone()).await {
                Ok(output) => {
                    self.store.record(&name, &output).await;
                    if output.is_skipped() {
                        ctx.emit(
                            EventKind::StepSkipped,
                            json!({
                                "step": name,
                                "index": index,
                                "error": output.metadata.get("error"),
                            }),
                        )
                        .await;
                    } else {
                        previous = output.content.clone();
                        ctx.emit(
                            EventKind::StepCompleted,
                            json!({
                                "step": name,
                                "index": index,
                                "content": output.content,
                                "metrics": output.metrics,
                            }),
                        )
                        .await;
                    }
                }
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => {
                    self.store
                        .record_failure(&name, node.executor_type(), start, &e)
                        .await;
                    ctx.emit(
                        EventKind::StepFailed,
                        json!({ "step": name, "index": index, "error": e.to_string() }),
                    )
                    .await;
                    return Err(StepflowError::RunFailed {
                        run_id: ctx.run_id().to_string(),
                        step: name,
                        source: Box::new(e),
                    });
                }
            }
        }
        Ok(previous)
    }

    async fn load_session(&self) -> Option<WorkflowSession> {
        let storage = self.storage.as_ref()?;
        let session_id = self.session_id.as_deref()?;
        match storage.load(session_id).await {
            Ok(Some(session)) => Some(session),
            Ok(None) => Some(WorkflowSession::new(session_id, &self.id)),
            Err(e) => {
                warn!(session_id, error = %e, "Failed to load session, starting fresh");
                Some(WorkflowSession::new(session_id, &self.id))
            }
        }
    }

    async fn save_session(&self, session: &mut WorkflowSession, response: &RunResponse) {
        let Some(ref storage) = self.storage else {
            return;
        };
        session.state.insert(
            "last_run".to_string(),
            json!({
                "run_id": response.run_id,
                "status": response.status,
                "content": response.content,
            }),
        );
        session.touch();
        if let Err(e) = storage.save(session).await {
            warn!(session_id = %session.session_id, error = %e, "Failed to save session");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use stepflow_core::types::StepOutput;
    use stepflow_memory::InMemorySessionStorage;
    use stepflow_test_utils::RecordingSink;

    use crate::condition::{message_longer_than, Condition};
    use crate::loops::{for_count, Loop};
    use crate::parallel::Parallel;
    use crate::steps::Steps;

    fn upper() -> FunctionExecutor {
        FunctionExecutor::sync("upper", |input| {
            Ok(StepOutput::new(input.message_text().to_uppercase()))
        })
    }

    fn prefix() -> FunctionExecutor {
        FunctionExecutor::sync("prefix", |input| {
            Ok(StepOutput::new(format!("Processed: {}", input.previous_content_text())))
        })
    }

    #[tokio::test]
    async fn sequential_functions_record_every_output() {
        let workflow = Workflow::builder("text pipeline")
            .steps(vec![upper(), prefix()])
            .build()
            .unwrap();

        let response = workflow.run("hello world").await.unwrap();
        assert_eq!(response.content, json!("Processed: HELLO WORLD"));
        assert_eq!(response.status, RunStatus::Completed);
        assert_eq!(response.step_outputs.len(), 2);
        assert_eq!(response.step_outputs.names(), &["step_1".to_string(), "step_2".to_string()]);
        assert_eq!(response.metrics.steps_executed, 2);
        assert_eq!(response.metrics.steps_succeeded, 2);
        assert_eq!(response.workflow_id, "text-pipeline");
        assert_eq!(workflow.status().await, RunStatus::Completed);
    }

    #[tokio::test]
    async fn identical_runs_are_deterministic() {
        let workflow = Workflow::builder("twice")
            .steps(vec![upper(), prefix()])
            .build()
            .unwrap();
        let first = workflow.run("abc").await.unwrap();
        let second = workflow.run("abc").await.unwrap();
        assert_eq!(first.content, second.content);
        assert_eq!(first.metrics.steps_executed, second.metrics.steps_executed);
        assert_eq!(first.metrics.steps_succeeded, second.metrics.steps_succeeded);
        assert_ne!(first.run_id, second.run_id);
    }

    #[test]
    fn empty_collection_is_rejected() {
        let err = Workflow::builder("empty")
            .steps(Vec::<Node>::new())
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, StepflowError::Configuration(_)));
        assert!(Workflow::builder("none").build().is_err());
    }

    #[tokio::test]
    async fn heterogeneous_nodes_and_nested_outputs() {
        let counter = Arc::new(AtomicUsize::new(0));
        let tick = counter.clone();
        let loop_node = Loop::new(vec![Step::builder()
            .name("tick")
            .function(FunctionExecutor::sync("tick", move |_| {
                Ok(StepOutput::new(tick.fetch_add(1, Ordering::SeqCst) + 1))
            }))
            .build()
            .unwrap()
            .into()])
        .named("repeat")
        .condition(for_count(3))
        .max_iterations(3);

        let condition = Condition::builder()
            .name("length")
            .evaluator(message_longer_than(5))
            .then_steps(vec![Step::from_function(FunctionExecutor::sync("long", |_| {
                Ok(StepOutput::new("Long message"))
            }))
            .into()])
            .else_steps(vec![Step::from_function(FunctionExecutor::sync("short", |_| {
                Ok(StepOutput::new("Short message"))
            }))
            .into()])
            .build()
            .unwrap();

        let nodes: Vec<Node> = vec![
            loop_node.into(),
            Parallel::new(vec![Step::from_function(upper()).into()])
                .named("fan")
                .combine_outputs(true)
                .into(),
            condition.into(),
        ];
        let workflow = Workflow::builder("mixed").steps(nodes).build().unwrap();
        let response = workflow.run("hi").await.unwrap();

        assert_eq!(counter.load(Ordering::SeqCst), 3);
        assert_eq!(response.content, json!("Short message"));
        let outputs = &response.step_outputs;
        assert!(outputs.contains("repeat_iteration_3"));
        assert!(outputs.contains("tick_iteration_2"));
        assert!(outputs.contains("fan_func_1"));
        assert_eq!(outputs.get("repeat").unwrap().loop_outputs.as_ref().unwrap().len(), 3);
        assert_eq!(response.metrics.steps_executed, 3);
        assert!(response.metrics.step_metrics.contains_key("repeat"));
    }

    #[tokio::test]
    async fn sequence_children_are_visible_to_later_nodes() {
        let inner: Node = Step::builder()
            .name("inner")
            .function(FunctionExecutor::sync("inner", |_| Ok(StepOutput::new("from inside"))))
            .build()
            .unwrap()
            .into();
        let after = FunctionExecutor::sync("after", |input| {
            let seen = input
                .previous_outputs
                .get("inner")
                .map(|o| o.content_text())
                .unwrap_or_default();
            Ok(StepOutput::new(format!("saw {}", seen)))
        });
        let nodes: Vec<Node> = vec![
            Steps::new(vec![inner]).named("seq").into(),
            Step::builder().name("after").function(after).build().unwrap().into(),
        ];
        let workflow = Workflow::builder("nested").steps(nodes).build().unwrap();
        let response = workflow.run("go").await.unwrap();

        assert_eq!(response.content, json!("saw from inside"));
        assert_eq!(
            response.step_outputs.names(),
            &["inner".to_string(), "seq".to_string(), "after".to_string()]
        );
    }

    #[tokio::test]
    async fn parallel_branches_are_recorded_in_declaration_order() {
        let branch = |name: &'static str| -> Node {
            Step::builder()
                .name(name)
                .function(FunctionExecutor::sync(name, move |_| Ok(StepOutput::new(name))))
                .build()
                .unwrap()
                .into()
        };
        let nodes: Vec<Node> = vec![Parallel::new(vec![branch("zeta"), branch("alpha")])
            .named("fan")
            .into()];
        let workflow = Workflow::builder("fan out").steps(nodes).build().unwrap();
        let response = workflow.run("go").await.unwrap();

        assert_eq!(
            response.step_outputs.names(),
            &["zeta".to_string(), "alpha".to_string(), "fan".to_string()]
        );
    }

    #[tokio::test]
    async fn failure_marks_run_failed_and_emits_event() {
        let sink = Arc::new(RecordingSink::new());
        let workflow = Workflow::builder("fails")
            .steps(vec![
                upper(),
                FunctionExecutor::sync("broken", |_| Err(StepflowError::executor("kaput"))),
                prefix(),
            ])
            .event_sink(sink.clone())
            .build()
            .unwrap();

        let err = workflow.run("x").await.unwrap_err();
        assert!(matches!(err, StepflowError::RunFailed { ref step, .. } if step == "step_2"));
        assert_eq!(workflow.status().await, RunStatus::Failed);

        let metrics = workflow.metrics().await;
        assert_eq!(metrics.steps_executed, 2);
        assert_eq!(metrics.steps_failed, 1);
        assert!(!metrics.success);

        let kinds = sink.kinds();
        assert_eq!(kinds.first(), Some(&EventKind::WorkflowStarted));
        assert_eq!(kinds.last(), Some(&EventKind::WorkflowFailed));
        assert!(kinds.contains(&EventKind::StepFailed));
    }

    #[tokio::test]
    async fn skipped_step_does_not_stop_run() {
        let optional = Step::builder()
            .name("optional")
            .function(FunctionExecutor::sync("flaky", |_| Err(StepflowError::executor("meh"))))
            .skip_on_failure(true)
            .build()
            .unwrap();
        let workflow = Workflow::builder("skips")
            .steps(vec![Step::from_function(upper()), optional, Step::from_function(prefix())])
            .build()
            .unwrap();

        let response = workflow.run("ok").await.unwrap();
        assert_eq!(response.content, json!("Processed: OK"));
        assert_eq!(response.metrics.steps_skipped, 1);
        assert_eq!(response.metrics.steps_succeeded, 2);
        assert!(response.step_outputs.get("optional").unwrap().is_skipped());
    }

    #[tokio::test]
    async fn cancellation_before_node_stops_run() {
        let ran = Arc::new(AtomicUsize::new(0));
        let counter = ran.clone();
        let token = CancellationToken::new();
        let cancel = token.clone();

        let first = FunctionExecutor::sync("cancel-after", move |_| {
            cancel.cancel();
            Ok(StepOutput::new("first"))
        });
        let second = FunctionExecutor::sync("never", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(StepOutput::new("second"))
        });
        let workflow = Workflow::builder("cancel")
            .steps(vec![first, second])
            .build()
            .unwrap();

        let err = workflow.run_with_cancel("x", token).await.unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert_eq!(workflow.status().await, RunStatus::Cancelled);
    }

    #[tokio::test]
    async fn workflow_cancel_reaches_running_step() {
        let slow = FunctionExecutor::new("slow", |ctx: RunContext, _input| async move {
            tokio::select! {
                _ = ctx.cancelled() => Err(StepflowError::Cancelled),
                _ = tokio::time::sleep(Duration::from_secs(30)) => Ok(StepOutput::new("late")),
            }
        });
        let workflow = Arc::new(Workflow::builder("slow").steps(slow).build().unwrap());
        let handle = {
            let workflow = workflow.clone();
            tokio::spawn(async move { workflow.run("x").await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        workflow.cancel();
        let result = handle.await.unwrap();
        assert!(result.unwrap_err().is_cancelled());
    }

    #[tokio::test]
    async fn handlers_and_subscribers_see_events() {
        let workflow = Workflow::builder("observed")
            .steps(vec![upper()])
            .build()
            .unwrap();
        let completed = Arc::new(AtomicUsize::new(0));
        let seen = completed.clone();
        workflow.on(EventKind::StepCompleted, move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        let mut rx = workflow.subscribe();

        workflow.run("x").await.unwrap();
        assert_eq!(completed.load(Ordering::SeqCst), 1);

        let mut kinds = Vec::new();
        while let Ok(event) = rx.try_recv() {
            kinds.push(event.kind);
        }
        assert_eq!(
            kinds,
            vec![
                EventKind::WorkflowStarted,
                EventKind::StepStarted,
                EventKind::StepCompleted,
                EventKind::WorkflowCompleted,
            ]
        );
    }

    #[tokio::test]
    async fn input_schema_is_checked_first() {
        let workflow = Workflow::builder("strict")
            .steps(vec![upper()])
            .input_schema(InputSchema::new(crate::validation::InputKind::Object).require("message"))
            .build()
            .unwrap();
        let err = workflow.run("plain text").await.unwrap_err();
        assert!(matches!(err, StepflowError::Validation(_)));
        assert_eq!(workflow.status().await, RunStatus::Pending);

        let response = workflow.run(json!({"message": "ok"})).await.unwrap();
        assert_eq!(response.content, json!("OK"));
    }

    #[tokio::test]
    async fn session_is_hydrated_and_saved() {
        let storage = Arc::new(InMemorySessionStorage::new());
        let echo_state = FunctionExecutor::sync("state", |input| {
            let runs = input
                .additional_data
                .get("session_state")
                .and_then(|s| s.get("last_run"))
                .map_or(0, |_| 1);
            Ok(StepOutput::new(runs))
        });
        let workflow = Workflow::builder("stateful")
            .steps(echo_state)
            .storage(storage.clone())
            .session_id("sess-1")
            .build()
            .unwrap();

        let first = workflow.run("x").await.unwrap();
        assert_eq!(first.content, json!(0));
        assert_eq!(first.session_id.as_deref(), Some("sess-1"));

        let saved = storage.load("sess-1").await.unwrap().unwrap();
        assert_eq!(saved.state["last_run"]["run_id"], json!(first.run_id));
        assert_eq!(saved.state["last_run"]["status"], json!("completed"));

        let second = workflow.run("x").await.unwrap();
        assert_eq!(second.content, json!(1));
    }

    #[test]
    fn slug_ids() {
        assert_eq!(slug("My Pipeline!"), "my-pipeline");
        assert_eq!(slug("***"), "workflow");
    }
}
