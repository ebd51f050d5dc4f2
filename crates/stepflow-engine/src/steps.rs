use chrono::Utc;
use indexmap::IndexMap;
use serde_json::{json, Value};
use tracing::{debug, warn};

use stepflow_core::context::RunContext;
use stepflow_core::error::{Result, StepflowError};
use stepflow_core::event::EventKind;
use stepflow_core::types::{ExecutorType, StepInput, StepOutput};

use crate::node::{child_input, finish_output, record_output, Node};

/// An ordered sequence of nodes.
pub struct Steps {
    name: Option<String>,
    description: Option<String>,
    nodes: Vec<Node>,
    continue_on_error: bool,
    collect_outputs: bool,
}

impl Steps {
    pub fn new(nodes: Vec<Node>) -> Self {
        Self {
            name: None,
            description: None,
            nodes,
            continue_on_error: false,
            collect_outputs: false,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Keep executing after a failed node instead of stopping.
    pub fn continue_on_error(mut self, enabled: bool) -> Self {
        self.continue_on_error = enabled;
        self
    }

    /// Keep every node output in `parallel_outputs`. Otherwise they travel
    /// in `child_outputs` and only the content is the result.
    pub fn collect_outputs(mut self, enabled: bool) -> Self {
        self.collect_outputs = enabled;
        self
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub(crate) fn display_name(&self) -> String {
        self.name.clone().unwrap_or_else(|| "steps".to_string())
    }

    pub async fn execute(&self, ctx: &RunContext, input: StepInput) -> Result<StepOutput> {
        let name = self.display_name();
        ctx.check_cancelled()?;
        let start = Utc::now();
        let output = self.run(ctx, input, &name).await?;
        Ok(finish_output(output, &name, ExecutorType::Steps, start))
    }

    pub(crate) async fn run(&self, ctx: &RunContext, input: StepInput, name: &str) -> Result<StepOutput> {
        ctx.emit(
            EventKind::StepsStarted,
            json!({ "steps": name, "count": self.nodes.len() }),
        )
        .await;

        let mut outputs = input.previous_outputs.clone();
        let mut previous = input.previous_content.clone();
        let mut last_content = Value::Null;
        let mut collected = IndexMap::new();
        let mut errors: Vec<String> = Vec::new();
        let mut failed_steps: Vec<String> = Vec::new();
        let mut succeeded_steps: Vec<String> = Vec::new();

        for (i, node) in self.nodes.iter().enumerate() {
            ctx.check_cancelled()?;
            let step_name = node.resolved_name(&format!("{}_step_{}", name, i + 1));
            let child = child_input(&input, previous.clone(), outputs.clone());

            match node.execute_named(ctx, child, step_name.clone()).await {
                Ok(output) => {
                    record_output(&mut outputs, &step_name, &output);
                    if !output.is_skipped() {
                        previous = output.content.clone();
                        last_content = output.content.clone();
                    }
                    succeeded_steps.push(step_name.clone());
                    collected.insert(step_name, output);
                }
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) if self.continue_on_error => {
                    warn!(steps = %name, step = %step_name, error = %e, "Step failed, continuing");
                    errors.push(format!("{}: {}", step_name, e));
                    failed_steps.push(step_name);
                }
                Err(e) => {
                    return Err(StepflowError::SequenceFailed {
                        sequence: name.to_string(),
                        step: step_name,
                        source: Box::new(e),
                    });
                }
            }
        }

        let mut output = StepOutput::new(last_content)
            .with_name(name)
            .with_executor(name, ExecutorType::Steps)
            .with_metadata("step_count", self.nodes.len());
        if self.collect_outputs {
            output.parallel_outputs = Some(collected);
        } else {
            output.child_outputs = Some(collected);
        }
        if !errors.is_empty() {
            output = output
                .with_metadata("errors", errors.clone())
                .with_metadata("failed_steps", failed_steps.clone())
                .with_metadata("succeeded_steps", succeeded_steps.clone());
        }

        ctx.emit(
            EventKind::StepsCompleted,
            json!({
                "steps": name,
                "succeeded": succeeded_steps.len(),
                "failed": failed_steps.len(),
            }),
        )
        .await;

        if !self.nodes.is_empty() && succeeded_steps.is_empty() {
            return Err(StepflowError::SequenceExhausted {
                sequence: name.to_string(),
                errors,
                output: Box::new(output),
            });
        }

        debug!(steps = %name, succeeded = succeeded_steps.len(), failed = failed_steps.len(), "Sequence complete");
        Ok(output)
    }
}
