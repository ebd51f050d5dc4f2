use std::collections::{BTreeMap, HashMap};

use indexmap::IndexMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::event::EventKind;

/// Unique run identifier.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct RunId(pub String);

impl RunId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What kind of executor produced an output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutorType {
    Agent,
    Team,
    #[default]
    Function,
    Steps,
    Loop,
    Parallel,
    Condition,
    Router,
}

impl ExecutorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Agent => "agent",
            Self::Team => "team",
            Self::Function => "function",
            Self::Steps => "steps",
            Self::Loop => "loop",
            Self::Parallel => "parallel",
            Self::Condition => "condition",
            Self::Router => "router",
        }
    }
}

impl std::fmt::Display for ExecutorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of media attached to a workflow input.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Audio,
    Video,
    File,
}

/// A media attachment carried alongside the message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MediaAttachment {
    pub kind: MediaKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

/// Render a content value as text: strings verbatim, null as empty,
/// everything else as compact JSON.
pub fn content_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Named step outputs in insertion order.
///
/// Recording a name that already exists moves it to the end, so
/// `latest()` always returns the most recent write.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OutputLog {
    order: Vec<String>,
    outputs: HashMap<String, StepOutput>,
}

impl OutputLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, output: StepOutput) {
        let name = name.into();
        if self.outputs.insert(name.clone(), output).is_some() {
            self.order.retain(|n| n != &name);
        }
        self.order.push(name);
    }

    /// Append every entry of `other`, preserving its order.
    pub fn merge(&mut self, other: &OutputLog) {
        for (name, output) in other.iter() {
            self.insert(name, output.clone());
        }
    }

    pub fn get(&self, name: &str) -> Option<&StepOutput> {
        self.outputs.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.outputs.contains_key(name)
    }

    /// The most recently recorded output.
    pub fn latest(&self) -> Option<(&str, &StepOutput)> {
        let name = self.order.last()?;
        self.outputs.get(name).map(|o| (name.as_str(), o))
    }

    pub fn names(&self) -> &[String] {
        &self.order
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &StepOutput)> {
        self.order
            .iter()
            .filter_map(|n| self.outputs.get(n).map(|o| (n.as_str(), o)))
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// The execution context handed to every node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepInput {
    /// The original workflow input.
    pub message: Value,
    /// Output content of the immediately preceding node.
    #[serde(default)]
    pub previous_content: Value,
    /// Outputs recorded so far, keyed by resolved step name.
    #[serde(default)]
    pub previous_outputs: OutputLog,
    #[serde(default)]
    pub additional_data: HashMap<String, Value>,
    #[serde(default)]
    pub media: Vec<MediaAttachment>,
}

impl StepInput {
    pub fn new(message: impl Into<Value>) -> Self {
        Self {
            message: message.into(),
            ..Default::default()
        }
    }

    pub fn with_previous_content(mut self, content: Value) -> Self {
        self.previous_content = content;
        self
    }

    pub fn with_previous_outputs(mut self, outputs: OutputLog) -> Self {
        self.previous_outputs = outputs;
        self
    }

    pub fn with_additional_data(mut self, key: impl Into<String>, value: Value) -> Self {
        self.additional_data.insert(key.into(), value);
        self
    }

    pub fn message_text(&self) -> String {
        content_text(&self.message)
    }

    pub fn previous_content_text(&self) -> String {
        content_text(&self.previous_content)
    }

    pub fn has_previous_content(&self) -> bool {
        !self.previous_content.is_null()
    }

    /// Previous content when there is any, otherwise the original message.
    pub fn effective_content(&self) -> &Value {
        if self.has_previous_content() {
            &self.previous_content
        } else {
            &self.message
        }
    }

    pub fn step_output(&self, name: &str) -> Option<&StepOutput> {
        self.previous_outputs.get(name)
    }

    pub fn step_content(&self, name: &str) -> Option<&Value> {
        self.previous_outputs.get(name).map(|o| &o.content)
    }

    pub fn latest_output(&self) -> Option<&StepOutput> {
        self.previous_outputs.latest().map(|(_, o)| o)
    }
}

/// Timing and outcome of a single node execution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepMetrics {
    pub step_name: String,
    pub executor_type: ExecutorType,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub duration_ms: u64,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub retry_count: u32,
}

impl StepMetrics {
    pub fn new(
        step_name: impl Into<String>,
        executor_type: ExecutorType,
        start_time: DateTime<Utc>,
    ) -> Self {
        let end_time = Utc::now();
        Self {
            step_name: step_name.into(),
            executor_type,
            start_time,
            end_time,
            duration_ms: duration_ms(start_time, end_time),
            success: true,
            error: None,
            retry_count: 0,
        }
    }

    pub fn failed(mut self, error: impl Into<String>) -> Self {
        self.success = false;
        self.error = Some(error.into());
        self
    }

    pub fn with_retries(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }
}

fn duration_ms(start: DateTime<Utc>, end: DateTime<Utc>) -> u64 {
    (end - start).num_milliseconds().max(0) as u64
}

/// The result of any node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepOutput {
    #[serde(default)]
    pub content: Value,
    #[serde(default)]
    pub step_name: String,
    #[serde(default)]
    pub executor_name: String,
    #[serde(default)]
    pub executor_type: ExecutorType,
    #[serde(default)]
    pub event: EventKind,
    /// Route chosen by a router.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_step: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallel_outputs: Option<IndexMap<String, StepOutput>>,
    /// Outputs of nested nodes that are not this node's primary payload.
    /// Recorded into the run's output map like `parallel_outputs`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub child_outputs: Option<IndexMap<String, StepOutput>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loop_outputs: Option<Vec<StepOutput>>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<StepMetrics>,
}

impl StepOutput {
    pub fn new(content: impl Into<Value>) -> Self {
        Self {
            content: content.into(),
            ..Default::default()
        }
    }

    pub fn with_name(mut self, step_name: impl Into<String>) -> Self {
        self.step_name = step_name.into();
        self
    }

    pub fn with_executor(mut self, name: impl Into<String>, executor_type: ExecutorType) -> Self {
        self.executor_name = name.into();
        self.executor_type = executor_type;
        self
    }

    pub fn with_event(mut self, event: EventKind) -> Self {
        self.event = event;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn content_text(&self) -> String {
        content_text(&self.content)
    }

    pub fn is_skipped(&self) -> bool {
        self.event == EventKind::StepSkipped
    }

    /// Child outputs carried by a parallel/sequence/loop node, depth first,
    /// each keyed by the name the owning node recorded it under.
    pub fn nested_outputs(&self) -> Vec<(String, &StepOutput)> {
        let mut nested = Vec::new();
        let keyed = self.parallel_outputs.iter().chain(self.child_outputs.iter());
        for children in keyed {
            for (name, child) in children {
                nested.extend(child.nested_outputs());
                nested.push((name.clone(), child));
            }
        }
        if let Some(ref iterations) = self.loop_outputs {
            for child in iterations {
                nested.extend(child.nested_outputs());
                nested.push((child.step_name.clone(), child));
            }
        }
        nested
    }
}

/// Run-level metrics, owned by the workflow driver.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowMetrics {
    pub run_id: String,
    pub workflow_id: String,
    pub start_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default)]
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub steps_executed: usize,
    #[serde(default)]
    pub steps_succeeded: usize,
    #[serde(default)]
    pub steps_failed: usize,
    #[serde(default)]
    pub steps_skipped: usize,
    #[serde(default)]
    pub step_metrics: BTreeMap<String, StepMetrics>,
}

impl WorkflowMetrics {
    pub fn new(run_id: impl Into<String>, workflow_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            workflow_id: workflow_id.into(),
            start_time: Utc::now(),
            end_time: None,
            duration_ms: 0,
            success: false,
            error: None,
            steps_executed: 0,
            steps_succeeded: 0,
            steps_failed: 0,
            steps_skipped: 0,
            step_metrics: BTreeMap::new(),
        }
    }

    pub fn finish(&mut self, success: bool, error: Option<String>) {
        let end = Utc::now();
        self.end_time = Some(end);
        self.duration_ms = duration_ms(self.start_time, end);
        self.success = success;
        self.error = error;
    }
}

/// Lifecycle state of a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// What a completed run hands back to its caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResponse {
    pub run_id: String,
    pub workflow_id: String,
    pub workflow_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub status: RunStatus,
    pub content: Value,
    pub metrics: WorkflowMetrics,
    pub step_outputs: OutputLog,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RunResponse {
    pub fn content_text(&self) -> String {
        content_text(&self.content)
    }
}

/// Session payload handed to and from the storage collaborator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowSession {
    pub session_id: String,
    pub workflow_id: String,
    #[serde(default)]
    pub state: HashMap<String, Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
}

impl WorkflowSession {
    pub fn new(session_id: impl Into<String>, workflow_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            session_id: session_id.into(),
            workflow_id: workflow_id.into(),
            state: HashMap::new(),
            created_at: now,
            updated_at: now,
            last_accessed_at: now,
        }
    }

    pub fn touch(&mut self) {
        let now = Utc::now();
        self.updated_at = now;
        self.last_accessed_at = now;
    }
}
