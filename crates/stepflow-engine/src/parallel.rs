use chrono::Utc;
use futures::future::join_all;
use indexmap::IndexMap;
use serde_json::{json, Map, Value};
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use stepflow_core::context::RunContext;
use stepflow_core::error::{BranchFailure, Result, StepflowError};
use stepflow_core::event::EventKind;
use stepflow_core::types::{ExecutorType, StepInput, StepOutput};

use crate::node::{finish_output, Node};

/// Runs a fixed set of nodes concurrently over independent input copies.
pub struct Parallel {
    name: Option<String>,
    description: Option<String>,
    nodes: Vec<Node>,
    max_concurrency: Option<usize>,
    combine_outputs: bool,
}

impl Parallel {
    pub fn new(nodes: Vec<Node>) -> Self {
        Self {
            name: None,
            description: None,
            nodes,
            max_concurrency: None,
            combine_outputs: false,
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

    /// Limit the number of branches running at once. Unlimited by default.
    pub fn max_concurrency(mut self, limit: usize) -> Self {
        self.max_concurrency = Some(limit.max(1));
        self
    }

    /// Make the content a `{branch: content}` object.
    pub fn combine_outputs(mut self, enabled: bool) -> Self {
        self.combine_outputs = enabled;
        self
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub(crate) fn display_name(&self) -> String {
        self.name.clone().unwrap_or_else(|| "parallel".to_string())
    }

    pub async fn execute(&self, ctx: &RunContext, input: StepInput) -> Result<StepOutput> {
        let name = self.display_name();
        ctx.check_cancelled()?;
        let start = Utc::now();
        let output = self.run(ctx, input, &name).await?;
        Ok(finish_output(output, &name, ExecutorType::Parallel, start))
    }

    pub(crate) async fn run(&self, ctx: &RunContext, input: StepInput, name: &str) -> Result<StepOutput> {
        let total = self.nodes.len();
        ctx.emit(
            EventKind::ParallelStarted,
            json!({ "parallel": name, "branches": total, "max_concurrency": self.max_concurrency }),
        )
        .await;

        let semaphore = self.max_concurrency.map(Semaphore::new);
        let semaphore = semaphore.as_ref();

        let branches = self.nodes.iter().enumerate().map(|(i, node)| {
            let branch = node.resolved_name(&format!("{}_func_{}", name, i + 1));
            let branch_input = input.clone();
            async move {
                // Held until the branch finishes.
                let _permit = match semaphore {
                    Some(s) => match s.acquire().await {
                        Ok(permit) => Some(permit),
                        Err(_) => {
                            return (branch, Err(StepflowError::executor("worker pool closed")))
                        }
                    },
                    None => None,
                };
                debug!(parallel = %name, branch = %branch, "Branch started");
                let result = node.execute_named(ctx, branch_input, branch.clone()).await;
                (branch, result)
            }
        });

        let results = tokio::select! {
            _ = ctx.cancelled() => return Err(StepflowError::Cancelled),
            results = join_all(branches) => results,
        };

        // join_all keeps declaration order.
        let mut outputs = IndexMap::new();
        let mut failures = Vec::new();
        for (branch, result) in results {
            match result {
                Ok(output) => {
                    outputs.insert(branch, output);
                }
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => {
                    warn!(parallel = %name, branch = %branch, error = %e, "Branch failed");
                    failures.push(BranchFailure {
                        branch,
                        error: Box::new(e),
                    });
                }
            }
        }

        if !failures.is_empty() {
            return Err(StepflowError::ParallelFailed {
                name: name.to_string(),
                total,
                failures,
            });
        }

        let skipped = outputs.values().filter(|o| o.is_skipped()).count();
        let content = if self.combine_outputs {
            let combined: Map<String, Value> = outputs
                .iter()
                .map(|(branch, o)| (branch.clone(), o.content.clone()))
                .collect();
            Value::Object(combined)
        } else {
            Value::Null
        };

        let mut output = StepOutput::new(content)
            .with_name(name)
            .with_executor(name, ExecutorType::Parallel)
            .with_metadata("branches", total)
            .with_metadata("skipped_branches", skipped);
        output.parallel_outputs = Some(outputs);

        ctx.emit(
            EventKind::ParallelCompleted,
            json!({ "parallel": name, "branches": total, "skipped": skipped }),
        )
        .await;
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::FunctionExecutor;
    use crate::step::Step;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn constant(name: &'static str, value: &'static str) -> Node {
        Step::builder()
            .name(name)
            .function(FunctionExecutor::sync(name, move |_| Ok(StepOutput::new(value))))
            .build()
            .unwrap()
            .into()
    }

    fn failing(name: &'static str, skip: bool) -> Node {
        Step::builder()
            .name(name)
            .function(FunctionExecutor::sync(name, |_| Err(StepflowError::executor("down"))))
            .skip_on_failure(skip)
            .build()
            .unwrap()
            .into()
    }

    #[tokio::test]
    async fn combines_branch_contents() {
        let node = Parallel::new(vec![constant("left", "L"), constant("right", "R")])
            .named("fan")
            .combine_outputs(true);
        let out = node
            .execute(&RunContext::detached(), StepInput::new("x"))
            .await
            .unwrap();
        assert_eq!(out.content, json!({"left": "L", "right": "R"}));
        assert_eq!(out.parallel_outputs.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn without_combine_content_is_empty() {
        let unnamed: Node =
            Step::from_function(FunctionExecutor::sync("f", |_| Ok(StepOutput::new(1)))).into();
        let node = Parallel::new(vec![unnamed, constant("named", "N")]).named("fan");
        let out = node
            .execute(&RunContext::detached(), StepInput::new("x"))
            .await
            .unwrap();
        assert_eq!(out.content, Value::Null);
        let branches = out.parallel_outputs.unwrap();
        assert!(branches.contains_key("fan_func_1"));
        assert!(branches.contains_key("named"));
    }

    #[tokio::test]
    async fn branches_keep_declaration_order() {
        let node = Parallel::new(vec![constant("zeta", "Z"), constant("alpha", "A")]).named("fan");
        let out = node
            .execute(&RunContext::detached(), StepInput::new("x"))
            .await
            .unwrap();
        let names: Vec<String> = out.nested_outputs().into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["zeta", "alpha"]);
    }

    #[tokio::test]
    async fn failures_are_aggregated_after_all_branches_run() {
        let ran = Arc::new(AtomicUsize::new(0));
        let counter = ran.clone();
        let slow: Node = Step::builder()
            .name("slow")
            .function(FunctionExecutor::new("slow", move |_ctx, _input| {
                let counter = counter.clone();
                async move {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(StepOutput::new("done"))
                }
            }))
            .build()
            .unwrap()
            .into();
        let node = Parallel::new(vec![failing("a", false), slow, failing("b", false)]).named("fan");
        let err = node
            .execute(&RunContext::detached(), StepInput::new("x"))
            .await
            .unwrap_err();

        assert_eq!(ran.load(Ordering::SeqCst), 1);
        match err {
            StepflowError::ParallelFailed { name, total, failures } => {
                assert_eq!(name, "fan");
                assert_eq!(total, 3);
                let branches: Vec<&str> = failures.iter().map(|f| f.branch.as_str()).collect();
                assert_eq!(branches, vec!["a", "b"]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn skippable_branches_do_not_fail_the_fan_out() {
        let node = Parallel::new(vec![constant("ok", "fine"), failing("optional", true)])
            .combine_outputs(true);
        let out = node
            .execute(&RunContext::detached(), StepInput::new("x"))
            .await
            .unwrap();
        assert_eq!(out.metadata["skipped_branches"], json!(1));
        assert_eq!(out.content["ok"], json!("fine"));
        assert!(out.parallel_outputs.unwrap()["optional"].is_skipped());
    }

    #[tokio::test]
    async fn concurrency_is_bounded() {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let nodes: Vec<Node> = (0..6)
            .map(|_| {
                let active = active.clone();
                let peak = peak.clone();
                Step::from_function(FunctionExecutor::new("worker", move |_ctx, _input| {
                    let active = active.clone();
                    let peak = peak.clone();
                    async move {
                        let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        active.fetch_sub(1, Ordering::SeqCst);
                        Ok(StepOutput::new(now))
                    }
                }))
                .into()
            })
            .collect();

        let node = Parallel::new(nodes).max_concurrency(2);
        node.execute(&RunContext::detached(), StepInput::new("x"))
            .await
            .unwrap();
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn cancellation_while_joining() {
        let ctx = RunContext::detached();
        let token = ctx.cancel_token().clone();
        let hang: Node = Step::from_function(FunctionExecutor::new("hang", |_ctx, _input| async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(StepOutput::new("never"))
        }))
        .into();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            token.cancel();
        });
        let err = Parallel::new(vec![hang])
            .execute(&ctx, StepInput::new("x"))
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
    }
}
