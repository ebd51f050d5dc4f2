use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use indexmap::IndexMap;
use serde_json::Value;

use stepflow_core::context::RunContext;
use stepflow_core::error::{Result, StepflowError};
use stepflow_core::types::{ExecutorType, OutputLog, StepInput, StepMetrics, StepOutput};

use crate::condition::Condition;
use crate::loops::Loop;
use crate::parallel::Parallel;
use crate::router::Router;
use crate::step::Step;
use crate::steps::Steps;

/// Any executable element of a workflow.
pub enum Node {
    Step(Step),
    Steps(Steps),
    Loop(Loop),
    Parallel(Parallel),
    Condition(Condition),
    Router(Router),
}

impl Node {
    /// The explicitly configured name, if any.
    pub fn name(&self) -> Option<&str> {
        match self {
            Self::Step(n) => n.name(),
            Self::Steps(n) => n.name(),
            Self::Loop(n) => n.name(),
            Self::Parallel(n) => n.name(),
            Self::Condition(n) => n.name(),
            Self::Router(n) => n.name(),
        }
    }

    pub fn executor_type(&self) -> ExecutorType {
        match self {
            Self::Step(n) => n.executor_type(),
            Self::Steps(_) => ExecutorType::Steps,
            Self::Loop(_) => ExecutorType::Loop,
            Self::Parallel(_) => ExecutorType::Parallel,
            Self::Condition(_) => ExecutorType::Condition,
            Self::Router(_) => ExecutorType::Router,
        }
    }

    /// The configured name, or `fallback` when the node is unnamed.
    pub fn resolved_name(&self, fallback: &str) -> String {
        self.name().unwrap_or(fallback).to_string()
    }

    fn display_name(&self) -> String {
        match self {
            Self::Step(n) => n.display_name(),
            Self::Steps(n) => n.display_name(),
            Self::Loop(n) => n.display_name(),
            Self::Parallel(n) => n.display_name(),
            Self::Condition(n) => n.display_name(),
            Self::Router(n) => n.display_name(),
        }
    }

    /// Execute this node under its own name.
    pub fn execute<'a>(
        &'a self,
        ctx: &'a RunContext,
        input: StepInput,
    ) -> BoxFuture<'a, Result<StepOutput>> {
        let name = self.display_name();
        self.execute_named(ctx, input, name)
    }

    /// Execute this node, recording its output under `name`.
    pub(crate) fn execute_named<'a>(
        &'a self,
        ctx: &'a RunContext,
        input: StepInput,
        name: String,
    ) -> BoxFuture<'a, Result<StepOutput>> {
        Box::pin(async move {
            ctx.check_cancelled()?;
            let start = Utc::now();
            let output = match self {
                Self::Step(n) => n.run(ctx, input, &name).await?,
                Self::Steps(n) => n.run(ctx, input, &name).await?,
                Self::Loop(n) => n.run(ctx, input, &name).await?,
                Self::Parallel(n) => n.run(ctx, input, &name).await?,
                Self::Condition(n) => n.run(ctx, input, &name).await?,
                Self::Router(n) => n.run(ctx, input, &name).await?,
            };
            Ok(finish_output(output, &name, self.executor_type(), start))
        })
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", self.executor_type(), self.display_name())
    }
}

impl From<Step> for Node {
    fn from(step: Step) -> Self {
        Self::Step(step)
    }
}

impl From<Steps> for Node {
    fn from(steps: Steps) -> Self {
        Self::Steps(steps)
    }
}

impl From<Loop> for Node {
    fn from(node: Loop) -> Self {
        Self::Loop(node)
    }
}

impl From<Parallel> for Node {
    fn from(node: Parallel) -> Self {
        Self::Parallel(node)
    }
}

impl From<Condition> for Node {
    fn from(node: Condition) -> Self {
        Self::Condition(node)
    }
}

impl From<Router> for Node {
    fn from(node: Router) -> Self {
        Self::Router(node)
    }
}

/// Fill in the name and metrics a node left blank.
pub(crate) fn finish_output(
    mut output: StepOutput,
    name: &str,
    executor_type: ExecutorType,
    start: DateTime<Utc>,
) -> StepOutput {
    if output.step_name.is_empty() {
        output.step_name = name.to_string();
    }
    if output.metrics.is_none() {
        output.metrics = Some(StepMetrics::new(name, executor_type, start));
    }
    output
}

/// Record an output and everything nested inside it, children first.
pub(crate) fn record_output(log: &mut OutputLog, name: &str, output: &StepOutput) {
    for (child, nested) in output.nested_outputs() {
        log.insert(child, nested.clone());
    }
    log.insert(name, output.clone());
}

/// Input for a nested node: same message and side data, new content and outputs.
pub(crate) fn child_input(base: &StepInput, previous_content: Value, outputs: OutputLog) -> StepInput {
    StepInput {
        message: base.message.clone(),
        previous_content,
        previous_outputs: outputs,
        additional_data: base.additional_data.clone(),
        media: base.media.clone(),
    }
}

/// Result of running a node list in order.
pub(crate) struct Chain {
    /// The last output that was not skipped.
    pub last: Option<StepOutput>,
    pub children: Vec<(String, StepOutput)>,
}

impl Chain {
    pub fn content(&self) -> Value {
        self.last.as_ref().map(|o| o.content.clone()).unwrap_or(Value::Null)
    }

    pub fn children_map(&self) -> IndexMap<String, StepOutput> {
        self.children.iter().cloned().collect()
    }
}

pub(crate) struct ChainFailure {
    pub step: String,
    pub error: StepflowError,
}

/// Run `nodes` sequentially, stopping at the first error. Each node sees the
/// previous node's content and every output recorded before it.
pub(crate) async fn run_chain<F>(
    ctx: &RunContext,
    nodes: &[Node],
    input: &StepInput,
    name_for: F,
) -> std::result::Result<Chain, ChainFailure>
where
    F: Fn(usize, &Node) -> String,
{
    let mut outputs = input.previous_outputs.clone();
    let mut previous = input.previous_content.clone();
    let mut chain = Chain {
        last: None,
        children: Vec::with_capacity(nodes.len()),
    };

    for (i, node) in nodes.iter().enumerate() {
        let name = name_for(i, node);
        let child = child_input(input, previous.clone(), outputs.clone());
        match node.execute_named(ctx, child, name.clone()).await {
            Ok(output) => {
                record_output(&mut outputs, &name, &output);
                if !output.is_skipped() {
                    previous = output.content.clone();
                    chain.last = Some(output.clone());
                }
                chain.children.push((name, output));
            }
            Err(error) => return Err(ChainFailure { step: name, error }),
        }
    }
    Ok(chain)
}
