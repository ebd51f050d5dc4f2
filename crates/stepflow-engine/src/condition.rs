use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Value};
use tracing::debug;

use stepflow_core::context::RunContext;
use stepflow_core::error::{Result, StepflowError};
use stepflow_core::event::EventKind;
use stepflow_core::types::{ExecutorType, StepInput, StepOutput};

use crate::node::{finish_output, run_chain, Node};

/// Predicate evaluated once against the node's input.
pub type ConditionFn = Arc<dyn Fn(&StepInput) -> bool + Send + Sync>;

/// Binary branch: runs `then` or `else` depending on a predicate.
pub struct Condition {
    name: Option<String>,
    description: Option<String>,
    evaluator: ConditionFn,
    then_nodes: Vec<Node>,
    else_nodes: Vec<Node>,
}

#[derive(Default)]
pub struct ConditionBuilder {
    name: Option<String>,
    description: Option<String>,
    evaluator: Option<ConditionFn>,
    then_nodes: Vec<Node>,
    else_nodes: Vec<Node>,
}

impl ConditionBuilder {
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn evaluator(mut self, evaluator: ConditionFn) -> Self {
        self.evaluator = Some(evaluator);
        self
    }

    pub fn then_steps(mut self, nodes: Vec<Node>) -> Self {
        self.then_nodes = nodes;
        self
    }

    pub fn else_steps(mut self, nodes: Vec<Node>) -> Self {
        self.else_nodes = nodes;
        self
    }

    pub fn build(self) -> Result<Condition> {
        let Some(evaluator) = self.evaluator else {
            return Err(StepflowError::Configuration(format!(
                "condition '{}' has no evaluator",
                self.name.as_deref().unwrap_or("<unnamed>")
            )));
        };
        Ok(Condition {
            name: self.name,
            description: self.description,
            evaluator,
            then_nodes: self.then_nodes,
            else_nodes: self.else_nodes,
        })
    }
}

impl Condition {
    pub fn builder() -> ConditionBuilder {
        ConditionBuilder::default()
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub(crate) fn display_name(&self) -> String {
        self.name.clone().unwrap_or_else(|| "condition".to_string())
    }

    pub async fn execute(&self, ctx: &RunContext, input: StepInput) -> Result<StepOutput> {
        let name = self.display_name();
        ctx.check_cancelled()?;
        let start = Utc::now();
        let output = self.run(ctx, input, &name).await?;
        Ok(finish_output(output, &name, ExecutorType::Condition, start))
    }

    pub(crate) async fn run(&self, ctx: &RunContext, input: StepInput, name: &str) -> Result<StepOutput> {
        ctx.emit(EventKind::ConditionStarted, json!({ "condition": name }))
            .await;

        let result = (self.evaluator)(&input);
        let (branch, nodes) = match (result, self.else_nodes.is_empty()) {
            (true, _) => ("then", &self.then_nodes),
            (false, false) => ("else", &self.else_nodes),
            (false, true) => ("none", &self.else_nodes),
        };
        debug!(condition = %name, result, branch, "Condition evaluated");

        let mut output = if nodes.is_empty() {
            StepOutput::new(Value::Null)
        } else {
            let chain = run_chain(ctx, nodes, &input, |i, node| {
                node.resolved_name(&format!("{}_{}_step_{}", name, branch, i + 1))
            })
            .await
            .map_err(|failure| {
                if failure.error.is_cancelled() {
                    failure.error
                } else {
                    StepflowError::BranchFailed {
                        node: format!("Condition '{}'", name),
                        branch: branch.to_string(),
                        source: Box::new(failure.error),
                    }
                }
            })?;
            let mut output = StepOutput::new(chain.content());
            output.child_outputs = Some(chain.children_map());
            output
        };

        output = output
            .with_name(name)
            .with_executor(name, ExecutorType::Condition)
            .with_metadata("executed_branch", branch)
            .with_metadata("condition_result", result);

        ctx.emit(
            EventKind::ConditionCompleted,
            json!({ "condition": name, "result": result, "branch": branch }),
        )
        .await;
        Ok(output)
    }
}

/// Previous content equals `value`.
pub fn content_equals(value: impl Into<Value>) -> ConditionFn {
    let value = value.into();
    Arc::new(move |input: &StepInput| input.previous_content == value)
}

/// Previous content, as text, contains `needle`.
pub fn content_contains(needle: impl Into<String>) -> ConditionFn {
    let needle = needle.into();
    Arc::new(move |input: &StepInput| input.previous_content_text().contains(&needle))
}

/// Previous content, as text, matches a regular expression.
pub fn content_matches(pattern: &str) -> Result<ConditionFn> {
    let re = regex::Regex::new(pattern)
        .map_err(|e| StepflowError::Configuration(format!("invalid pattern '{}': {}", pattern, e)))?;
    Ok(Arc::new(move |input: &StepInput| re.is_match(&input.previous_content_text())))
}

/// The workflow message, as text, contains `needle`.
pub fn message_contains(needle: impl Into<String>) -> ConditionFn {
    let needle = needle.into();
    Arc::new(move |input: &StepInput| input.message_text().contains(&needle))
}

/// The workflow message is longer than `len` characters.
pub fn message_longer_than(len: usize) -> ConditionFn {
    Arc::new(move |input: &StepInput| input.message_text().chars().count() > len)
}

/// A step named `step` has recorded an output.
pub fn step_has_output(step: impl Into<String>) -> ConditionFn {
    let step = step.into();
    Arc::new(move |input: &StepInput| input.previous_outputs.contains(&step))
}

/// The most recent output carries metadata `key`.
pub fn metadata_exists(key: impl Into<String>) -> ConditionFn {
    let key = key.into();
    Arc::new(move |input: &StepInput| {
        input
            .latest_output()
            .is_some_and(|o| o.metadata.contains_key(&key))
    })
}

/// The most recent output's metadata `key` equals `value`.
pub fn metadata_equals(key: impl Into<String>, value: impl Into<Value>) -> ConditionFn {
    let key = key.into();
    let value = value.into();
    Arc::new(move |input: &StepInput| {
        input
            .latest_output()
            .and_then(|o| o.metadata.get(&key))
            .is_some_and(|v| *v == value)
    })
}

pub fn all(conditions: Vec<ConditionFn>) -> ConditionFn {
    Arc::new(move |input: &StepInput| conditions.iter().all(|c| c(input)))
}

pub fn any(conditions: Vec<ConditionFn>) -> ConditionFn {
    Arc::new(move |input: &StepInput| conditions.iter().any(|c| c(input)))
}

pub fn not(condition: ConditionFn) -> ConditionFn {
    Arc::new(move |input: &StepInput| !condition(input))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::FunctionExecutor;
    use crate::step::Step;
    use stepflow_core::types::OutputLog;

    fn reply(text: &'static str) -> Node {
        Step::from_function(FunctionExecutor::sync(text, move |_| Ok(StepOutput::new(text)))).into()
    }

    fn length_check() -> Condition {
        Condition::builder()
            .name("length")
            .evaluator(message_longer_than(5))
            .then_steps(vec![reply("Long message")])
            .else_steps(vec![reply("Short message")])
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn picks_branch_by_message_length() {
        let node = length_check();
        let ctx = RunContext::detached();

        let out = node.execute(&ctx, StepInput::new("hi")).await.unwrap();
        assert_eq!(out.content, json!("Short message"));
        assert_eq!(out.metadata["executed_branch"], json!("else"));
        assert_eq!(out.metadata["condition_result"], json!(false));

        let out = node.execute(&ctx, StepInput::new("hello world")).await.unwrap();
        assert_eq!(out.content, json!("Long message"));
        assert_eq!(out.metadata["executed_branch"], json!("then"));
    }

    #[tokio::test]
    async fn false_without_else_is_placeholder() {
        let node = Condition::builder()
            .evaluator(content_equals("go"))
            .then_steps(vec![reply("went")])
            .build()
            .unwrap();
        let out = node
            .execute(&RunContext::detached(), StepInput::new("x"))
            .await
            .unwrap();
        assert_eq!(out.content, Value::Null);
        assert_eq!(out.metadata["executed_branch"], json!("none"));
    }

    #[test]
    fn missing_evaluator_is_configuration_error() {
        let err = Condition::builder().name("c").build().err().unwrap();
        assert!(matches!(err, StepflowError::Configuration(_)));
    }

    #[tokio::test]
    async fn branch_failure_names_branch() {
        let failing: Node =
            Step::from_function(FunctionExecutor::sync("f", |_| Err(StepflowError::executor("no"))))
                .into();
        let node = Condition::builder()
            .name("gate")
            .evaluator(Arc::new(|_: &StepInput| true))
            .then_steps(vec![failing])
            .build()
            .unwrap();
        let err = node
            .execute(&RunContext::detached(), StepInput::new("x"))
            .await
            .unwrap_err();
        assert!(matches!(err, StepflowError::BranchFailed { ref branch, .. } if branch == "then"));
        assert!(err.to_string().starts_with("Condition 'gate' failed in branch 'then'"));
    }

    #[test]
    fn builtin_predicates() {
        let mut outputs = OutputLog::new();
        outputs.insert("fetch", StepOutput::new("ok").with_metadata("status", 200));
        let input = StepInput::new("hello there")
            .with_previous_content(json!("Result: error 42"))
            .with_previous_outputs(outputs);

        assert!(content_contains("error")(&input));
        assert!(!content_equals("nope")(&input));
        assert!(content_matches(r"error \d+").unwrap()(&input));
        assert!(message_contains("there")(&input));
        assert!(step_has_output("fetch")(&input));
        assert!(!step_has_output("missing")(&input));
        assert!(metadata_exists("status")(&input));
        assert!(metadata_equals("status", 200)(&input));
        assert!(all(vec![message_longer_than(3), content_contains("42")])(&input));
        assert!(any(vec![content_equals("x"), message_contains("hello")])(&input));
        assert!(not(message_contains("bye"))(&input));
    }

    #[test]
    fn invalid_pattern_is_rejected() {
        assert!(content_matches("(unclosed").is_err());
    }
}
