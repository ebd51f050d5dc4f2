use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Value};
use tracing::{debug, warn};

use stepflow_core::context::RunContext;
use stepflow_core::error::{Result, StepflowError};
use stepflow_core::event::EventKind;
use stepflow_core::types::{ExecutorType, OutputLog, StepInput, StepOutput};

use crate::node::{child_input, finish_output, record_output, run_chain, Node};

const DEFAULT_MAX_ITERATIONS: usize = 10;

/// Continuation predicate over `(iteration_index, last_output)`. The index
/// is zero-based; `last_output` is `None` before the first iteration.
pub type LoopCondition = Arc<dyn Fn(usize, Option<&StepOutput>) -> bool + Send + Sync>;

/// Repeats its nodes while a condition holds, up to `max_iterations`.
pub struct Loop {
    name: Option<String>,
    description: Option<String>,
    nodes: Vec<Node>,
    max_iterations: usize,
    condition: Option<LoopCondition>,
    break_on_error: bool,
    collect_outputs: bool,
}

impl Loop {
    pub fn new(nodes: Vec<Node>) -> Self {
        Self {
            name: None,
            description: None,
            nodes,
            max_iterations: DEFAULT_MAX_ITERATIONS,
            condition: None,
            break_on_error: false,
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

    /// Hard iteration ceiling. Always wins over the condition.
    pub fn max_iterations(mut self, max: usize) -> Self {
        self.max_iterations = max;
        self
    }

    pub fn condition(mut self, condition: LoopCondition) -> Self {
        self.condition = Some(condition);
        self
    }

    pub fn break_on_error(mut self, enabled: bool) -> Self {
        self.break_on_error = enabled;
        self
    }

    /// Make the content the list of every iteration's content.
    pub fn collect_outputs(mut self, enabled: bool) -> Self {
        self.collect_outputs = enabled;
        self
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub(crate) fn display_name(&self) -> String {
        self.name.clone().unwrap_or_else(|| "loop".to_string())
    }

    pub async fn execute(&self, ctx: &RunContext, input: StepInput) -> Result<StepOutput> {
        let name = self.display_name();
        ctx.check_cancelled()?;
        let start = Utc::now();
        let output = self.run(ctx, input, &name).await?;
        Ok(finish_output(output, &name, ExecutorType::Loop, start))
    }

    pub(crate) async fn run(&self, ctx: &RunContext, input: StepInput, name: &str) -> Result<StepOutput> {
        ctx.emit(
            EventKind::LoopStarted,
            json!({ "loop": name, "max_iterations": self.max_iterations }),
        )
        .await;

        let mut last: Option<StepOutput> = None;
        let mut iterations: Vec<StepOutput> = Vec::new();
        let mut iteration_errors: Vec<Value> = Vec::new();
        let mut recorded = OutputLog::new();

        for index in 0..self.max_iterations {
            if let Some(ref condition) = self.condition {
                if !condition(index, last.as_ref()) {
                    debug!(loop_name = %name, iteration = index, "Loop condition no longer holds");
                    break;
                }
            }
            ctx.check_cancelled()?;

            let iteration = index + 1;
            ctx.emit(
                EventKind::LoopIterationStarted,
                json!({ "loop": name, "iteration": iteration }),
            )
            .await;

            let mut outputs = input.previous_outputs.clone();
            outputs.merge(&recorded);
            let previous = last
                .as_ref()
                .map(|o| o.content.clone())
                .unwrap_or_else(|| input.previous_content.clone());
            let iteration_input = child_input(&input, previous, outputs);

            let chain = run_chain(ctx, &self.nodes, &iteration_input, |i, node| {
                let base = node.resolved_name(&format!("{}_step_{}", name, i + 1));
                format!("{}_iteration_{}", base, iteration)
            })
            .await;

            match chain {
                Ok(chain) => {
                    let iteration_name = format!("{}_iteration_{}", name, iteration);
                    let mut output = StepOutput::new(chain.content())
                        .with_name(&iteration_name)
                        .with_executor(name, ExecutorType::Loop);
                    // Markers set by the last inner node drive the loop condition.
                    if let Some(ref inner) = chain.last {
                        output.metadata = inner.metadata.clone();
                    }
                    output = output.with_metadata("iteration", iteration);
                    output.child_outputs = Some(chain.children_map());

                    record_output(&mut recorded, &iteration_name, &output);
                    ctx.emit(
                        EventKind::LoopIterationCompleted,
                        json!({ "loop": name, "iteration": iteration, "content": output.content }),
                    )
                    .await;
                    last = Some(output.clone());
                    iterations.push(output);
                }
                Err(failure) if failure.error.is_cancelled() => return Err(failure.error),
                Err(failure) if self.break_on_error => {
                    return Err(StepflowError::IterationFailed {
                        name: name.to_string(),
                        iteration,
                        source: Box::new(failure.error),
                    });
                }
                Err(failure) => {
                    warn!(
                        loop_name = %name,
                        iteration,
                        step = %failure.step,
                        error = %failure.error,
                        "Loop iteration failed, skipping"
                    );
                    iteration_errors.push(json!({
                        "iteration": iteration,
                        "step": failure.step,
                        "error": failure.error.to_string(),
                    }));
                }
            }
        }

        let content = if self.collect_outputs {
            Value::Array(iterations.iter().map(|o| o.content.clone()).collect())
        } else {
            last.as_ref().map(|o| o.content.clone()).unwrap_or(Value::Null)
        };

        let count = iterations.len();
        let mut output = StepOutput::new(content)
            .with_name(name)
            .with_executor(name, ExecutorType::Loop)
            .with_metadata("iterations", count)
            .with_metadata("max_iterations", self.max_iterations);
        if !iteration_errors.is_empty() {
            output = output.with_metadata("iteration_errors", Value::Array(iteration_errors));
        }
        output.loop_outputs = Some(iterations);

        ctx.emit(
            EventKind::LoopCompleted,
            json!({ "loop": name, "iterations": count }),
        )
        .await;
        Ok(output)
    }
}

/// Run exactly `n` iterations (still capped by `max_iterations`).
pub fn for_count(n: usize) -> LoopCondition {
    Arc::new(move |index: usize, _: Option<&StepOutput>| index < n)
}

/// Run until `max_iterations`.
pub fn forever() -> LoopCondition {
    Arc::new(|_: usize, _: Option<&StepOutput>| true)
}

/// Continue until the last iteration's content equals `value`.
pub fn until_content_equals(value: impl Into<Value>) -> LoopCondition {
    let value = value.into();
    Arc::new(move |_: usize, last: Option<&StepOutput>| last.map_or(true, |o| o.content != value))
}

/// Continue while the last iteration carries a non-null `error` in its metadata.
/// Always runs the first iteration.
pub fn while_error_marker() -> LoopCondition {
    Arc::new(|_: usize, last: Option<&StepOutput>| {
        last.map_or(true, |o| {
            o.metadata.get("error").is_some_and(|v| !v.is_null())
        })
    })
}

/// Continue until the last iteration's metadata has `success: true`.
pub fn until_success_marker() -> LoopCondition {
    Arc::new(|_: usize, last: Option<&StepOutput>| {
        last.map_or(true, |o| o.metadata.get("success") != Some(&Value::Bool(true)))
    })
}
