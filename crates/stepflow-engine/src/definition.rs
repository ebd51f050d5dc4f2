//! Declarative pipelines: TOML node definitions resolved against registered
//! functions and agents.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use stepflow_core::config::{expand_env_vars, AppConfig, NodeDefaults};
use stepflow_core::error::{Result, StepflowError};
use stepflow_core::traits::Executor;
use stepflow_core::types::{content_text, StepInput, StepOutput};

use crate::condition::{Condition, ConditionFn};
use crate::executor::FunctionExecutor;
use crate::loops::{for_count, forever, Loop, LoopCondition};
use crate::node::Node;
use crate::parallel::Parallel;
use crate::router::{by_content_keywords, by_content_type, by_message_type, by_metadata_key, Classifier, Router};
use crate::step::Step;
use crate::steps::Steps;
use crate::validation::InputSchema;
use crate::workflow::{Workflow, WorkflowBuilder};

/// A pipeline file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineDefinition {
    pub name: String,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub input: Option<InputSchema>,
    #[serde(default)]
    pub steps: Vec<NodeDefinition>,
}

impl PipelineDefinition {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| StepflowError::ConfigNotFound(path.display().to_string()))?;
        Self::from_toml(&content)
    }

    /// Parse a pipeline, expanding `${ENV_VAR}` references first.
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(&expand_env_vars(content)).map_err(|e| StepflowError::Config(e.to_string()))
    }
}

/// One node in a pipeline. `type` selects which of the other fields apply.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeDefinition {
    #[serde(rename = "type")]
    pub node_type: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,

    // function / agent / team
    #[serde(default)]
    pub function: Option<String>,
    /// Inline function with `{content}` and `{message}` placeholders.
    #[serde(default)]
    pub template: Option<String>,
    #[serde(default)]
    pub agent: Option<String>,
    #[serde(default)]
    pub team: Option<String>,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub backoff_base_ms: Option<u64>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub skip_on_failure: bool,

    // steps / loop / parallel
    #[serde(default)]
    pub steps: Vec<NodeDefinition>,
    #[serde(default)]
    pub continue_on_error: bool,
    #[serde(default)]
    pub collect_outputs: bool,

    // loop
    #[serde(default)]
    pub max_iterations: Option<usize>,
    #[serde(default)]
    pub count: Option<usize>,
    /// Stop once this expression holds for the last iteration's content.
    #[serde(default)]
    pub until: Option<String>,
    #[serde(default)]
    pub break_on_error: bool,

    // parallel
    #[serde(default)]
    pub max_concurrency: Option<usize>,
    #[serde(default)]
    pub combine: bool,

    // condition
    #[serde(default)]
    pub when: Option<String>,
    #[serde(default, rename = "then")]
    pub then_steps: Vec<NodeDefinition>,
    #[serde(default, rename = "else")]
    pub else_steps: Vec<NodeDefinition>,

    // router
    #[serde(default)]
    pub classifier: Option<String>,
    #[serde(default)]
    pub routes: Vec<RouteDefinition>,
    #[serde(default)]
    pub default_route: Option<String>,
    #[serde(default)]
    pub case_insensitive: bool,
    #[serde(default)]
    pub partial_match: bool,
}

impl NodeDefinition {
    fn label(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.node_type)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteDefinition {
    pub name: String,
    #[serde(default)]
    pub steps: Vec<NodeDefinition>,
}

/// Named functions available to pipelines.
#[derive(Debug, Clone, Default)]
pub struct FunctionRegistry {
    functions: HashMap<String, FunctionExecutor>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the text built-ins. All of them read the
    /// previous content, or the message when there is none.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(text_fn("uppercase", |s| s.to_uppercase()));
        registry.register(text_fn("lowercase", |s| s.to_lowercase()));
        registry.register(text_fn("trim", |s| s.trim().to_string()));
        registry.register(text_fn("reverse", |s| s.chars().rev().collect()));
        registry.register(FunctionExecutor::sync("echo", |input| {
            Ok(StepOutput::new(input.effective_content().clone()))
        }));
        registry.register(FunctionExecutor::sync("word_count", |input| {
            let words = content_text(input.effective_content())
                .split_whitespace()
                .count();
            Ok(StepOutput::new(words))
        }));
        registry
    }

    pub fn register(&mut self, function: FunctionExecutor) {
        self.functions.insert(function.name().to_string(), function);
    }

    pub fn get(&self, name: &str) -> Option<FunctionExecutor> {
        self.functions.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.functions.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// A function that renders `template`, substituting `{content}` and
    /// `{message}`.
    pub fn template(name: impl Into<String>, template: impl Into<String>) -> FunctionExecutor {
        let template = template.into();
        FunctionExecutor::sync(name, move |input: &StepInput| {
            let rendered = template
                .replace("{content}", &content_text(input.effective_content()))
                .replace("{message}", &input.message_text());
            Ok(StepOutput::new(rendered))
        })
    }
}

fn text_fn(name: &str, f: fn(&str) -> String) -> FunctionExecutor {
    FunctionExecutor::sync(name, move |input: &StepInput| {
        Ok(StepOutput::new(f(&content_text(input.effective_content()))))
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Subject {
    Content,
    Message,
}

impl Subject {
    fn parse(subject: &str, expr: &str) -> Result<Self> {
        match subject.trim() {
            "content" => Ok(Self::Content),
            "message" => Ok(Self::Message),
            other => Err(StepflowError::Configuration(format!(
                "unknown subject '{}' in expression '{}'",
                other, expr
            ))),
        }
    }

    fn text(&self, input: &StepInput) -> String {
        match self {
            Self::Content => input.previous_content_text(),
            Self::Message => input.message_text(),
        }
    }
}

/// Parse a condition expression.
///
/// Supported forms, where the subject is `content` (previous content) or
/// `message`:
/// - `content contains "text"`
/// - `content == "text"` / `content != "text"`
/// - `message length > 5` / `content length < 5`
pub fn parse_condition(expr: &str) -> Result<ConditionFn> {
    parse_expression(expr).map(|(_, condition)| condition)
}

fn parse_expression(expr: &str) -> Result<(Subject, ConditionFn)> {
    let expr = expr.trim();

    if let Some((subject, needle)) = parse_operator(expr, " contains ") {
        let subject = Subject::parse(subject, expr)?;
        let needle = needle.to_string();
        return Ok((
            subject,
            Arc::new(move |input: &StepInput| subject.text(input).contains(&needle)),
        ));
    }

    if let Some((subject, value)) = parse_operator(expr, "!=") {
        let subject = Subject::parse(subject, expr)?;
        let value = value.to_string();
        return Ok((subject, Arc::new(move |input: &StepInput| subject.text(input) != value)));
    }

    if let Some((subject, value)) = parse_operator(expr, "==") {
        let subject = Subject::parse(subject, expr)?;
        let value = value.to_string();
        return Ok((subject, Arc::new(move |input: &StepInput| subject.text(input) == value)));
    }

    for (op, greater) in [(">", true), ("<", false)] {
        let Some((lhs, rhs)) = parse_operator(expr, op) else {
            continue;
        };
        let Some(subject) = lhs.strip_suffix("length") else {
            return Err(StepflowError::Configuration(format!(
                "'{}' compares without 'length' in '{}'",
                op, expr
            )));
        };
        let subject = Subject::parse(subject, expr)?;
        let limit: usize = rhs.parse().map_err(|_| {
            StepflowError::Configuration(format!("'{}' is not a length in '{}'", rhs, expr))
        })?;
        return Ok((
            subject,
            Arc::new(move |input: &StepInput| {
                let len = subject.text(input).chars().count();
                if greater {
                    len > limit
                } else {
                    len < limit
                }
            }),
        ));
    }

    Err(StepflowError::Configuration(format!(
        "unsupported expression '{}'",
        expr
    )))
}

/// Split `subject OP "value"` into (subject, value).
fn parse_operator<'a>(expr: &'a str, op: &str) -> Option<(&'a str, &'a str)> {
    let (key, value) = expr.split_once(op)?;
    Some((key.trim(), value.trim().trim_matches('"')))
}

/// Parse a router classifier name: `content_keywords`, `content_type`,
/// `message_type`, or `metadata:<key>`.
pub fn parse_classifier(name: &str) -> Result<Classifier> {
    match name.trim() {
        "content_keywords" => Ok(by_content_keywords()),
        "content_type" => Ok(by_content_type()),
        "message_type" => Ok(by_message_type()),
        other => match other.strip_prefix("metadata:") {
            Some(key) if !key.is_empty() => Ok(by_metadata_key(key)),
            _ => Err(StepflowError::Configuration(format!(
                "unknown classifier '{}'",
                other
            ))),
        },
    }
}

/// Loop stop condition from `count` and `until`.
fn loop_condition(def: &NodeDefinition) -> Result<LoopCondition> {
    match (def.count, def.until.as_deref()) {
        (Some(_), Some(_)) => Err(StepflowError::Configuration(format!(
            "loop '{}' sets both count and until",
            def.label()
        ))),
        (Some(n), None) => Ok(for_count(n)),
        (None, Some(expr)) => {
            let (subject, done) = parse_expression(expr)?;
            // Only the last iteration's content is available to `until`.
            if subject == Subject::Message {
                return Err(StepflowError::Configuration(format!(
                    "loop '{}' can only test content in until, got '{}'",
                    def.label(),
                    expr
                )));
            }
            Ok(Arc::new(move |_: usize, last: Option<&StepOutput>| {
                last.map_or(true, |o| {
                    !done(&StepInput::default().with_previous_content(o.content.clone()))
                })
            }))
        }
        (None, None) => Ok(forever()),
    }
}

/// Turns pipeline definitions into nodes and workflows.
pub struct PipelineLoader {
    functions: FunctionRegistry,
    agents: HashMap<String, Arc<dyn Executor>>,
    defaults: NodeDefaults,
}

impl Default for PipelineLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineLoader {
    pub fn new() -> Self {
        Self {
            functions: FunctionRegistry::with_builtins(),
            agents: HashMap::new(),
            defaults: NodeDefaults::default(),
        }
    }

    pub fn with_defaults(mut self, defaults: NodeDefaults) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn register_function(&mut self, function: FunctionExecutor) {
        self.functions.register(function);
    }

    /// Register an agent (or team) under its name.
    pub fn register_agent(&mut self, agent: Arc<dyn Executor>) {
        self.agents.insert(agent.name().to_string(), agent);
    }

    pub fn functions(&self) -> &FunctionRegistry {
        &self.functions
    }

    pub fn load(&self, path: &Path) -> Result<PipelineDefinition> {
        PipelineDefinition::load(path)
    }

    pub fn build_nodes(&self, def: &PipelineDefinition) -> Result<Vec<Node>> {
        self.build_children(&def.steps)
    }

    pub fn build_workflow(&self, def: &PipelineDefinition, config: &AppConfig) -> Result<Workflow> {
        self.workflow_builder(def, config)?.build()
    }

    /// A builder with the pipeline's nodes and settings applied, for callers
    /// that attach storage or sinks before building.
    pub fn workflow_builder(&self, def: &PipelineDefinition, config: &AppConfig) -> Result<WorkflowBuilder> {
        let name = config
            .workflow
            .name
            .clone()
            .unwrap_or_else(|| def.name.clone());
        let mut builder = Workflow::builder(name);
        if let Some(ref id) = def.id {
            builder = builder.id(id);
        }
        if let Some(ref description) = def.description {
            builder = builder.description(description);
        }
        if let Some(ref schema) = def.input {
            builder = builder.input_schema(schema.clone());
        }
        let nodes = self.build_nodes(def)?;
        debug!(pipeline = %def.name, nodes = nodes.len(), "Pipeline built");
        Ok(builder.config(config).steps(nodes))
    }

    fn build_children(&self, defs: &[NodeDefinition]) -> Result<Vec<Node>> {
        defs.iter().map(|d| self.build_node(d)).collect()
    }

    fn build_node(&self, def: &NodeDefinition) -> Result<Node> {
        match def.node_type.as_str() {
            "function" | "agent" | "team" => self.build_step(def).map(Node::Step),
            "steps" => {
                let mut steps = Steps::new(self.build_children(&def.steps)?)
                    .continue_on_error(def.continue_on_error)
                    .collect_outputs(def.collect_outputs);
                if let Some(ref name) = def.name {
                    steps = steps.named(name);
                }
                if let Some(ref description) = def.description {
                    steps = steps.description(description);
                }
                Ok(steps.into())
            }
            "loop" => {
                let mut node = Loop::new(self.build_children(&def.steps)?)
                    .max_iterations(def.max_iterations.unwrap_or(self.defaults.max_iterations))
                    .condition(loop_condition(def)?)
                    .break_on_error(def.break_on_error)
                    .collect_outputs(def.collect_outputs);
                if let Some(ref name) = def.name {
                    node = node.named(name);
                }
                if let Some(ref description) = def.description {
                    node = node.description(description);
                }
                Ok(node.into())
            }
            "parallel" => {
                let mut node =
                    Parallel::new(self.build_children(&def.steps)?).combine_outputs(def.combine);
                if let Some(limit) = def.max_concurrency.or(self.defaults.max_concurrency) {
                    node = node.max_concurrency(limit);
                }
                if let Some(ref name) = def.name {
                    node = node.named(name);
                }
                if let Some(ref description) = def.description {
                    node = node.description(description);
                }
                Ok(node.into())
            }
            "condition" => {
                let Some(ref when) = def.when else {
                    return Err(StepflowError::Configuration(format!(
                        "condition '{}' has no 'when' expression",
                        def.label()
                    )));
                };
                let mut builder = Condition::builder()
                    .evaluator(parse_condition(when)?)
                    .then_steps(self.build_children(&def.then_steps)?)
                    .else_steps(self.build_children(&def.else_steps)?);
                if let Some(ref name) = def.name {
                    builder = builder.name(name);
                }
                if let Some(ref description) = def.description {
                    builder = builder.description(description);
                }
                builder.build().map(Node::from)
            }
            "router" => {
                let Some(ref classifier) = def.classifier else {
                    return Err(StepflowError::Configuration(format!(
                        "router '{}' has no classifier",
                        def.label()
                    )));
                };
                let mut builder = Router::builder()
                    .classifier(parse_classifier(classifier)?)
                    .case_insensitive(def.case_insensitive)
                    .partial_match(def.partial_match);
                for route in &def.routes {
                    builder = builder.route(&route.name, self.build_children(&route.steps)?);
                }
                if let Some(ref default) = def.default_route {
                    builder = builder.default_route(default);
                }
                if let Some(ref name) = def.name {
                    builder = builder.name(name);
                }
                if let Some(ref description) = def.description {
                    builder = builder.description(description);
                }
                builder.build().map(Node::from)
            }
            other => Err(StepflowError::UnsupportedNodeType(other.to_string())),
        }
    }

    fn build_step(&self, def: &NodeDefinition) -> Result<Step> {
        let mut builder = Step::builder().defaults(&self.defaults);
        builder = match def.node_type.as_str() {
            "function" => builder.function(self.resolve_function(def)?),
            "agent" => builder.agent(self.resolve_agent(def.agent.as_deref(), def)?),
            "team" => builder.team(self.resolve_agent(def.team.as_deref(), def)?),
            other => return Err(StepflowError::UnsupportedNodeType(other.to_string())),
        };
        if let Some(ref name) = def.name {
            builder = builder.name(name);
        }
        if let Some(ref description) = def.description {
            builder = builder.description(description);
        }
        if let Some(retries) = def.max_retries {
            builder = builder.max_retries(retries);
        }
        if let Some(ms) = def.backoff_base_ms {
            builder = builder.backoff_base(Duration::from_millis(ms));
        }
        if let Some(secs) = def.timeout_secs {
            builder = builder.timeout(Duration::from_secs(secs));
        }
        builder.skip_on_failure(def.skip_on_failure).build()
    }

    fn resolve_function(&self, def: &NodeDefinition) -> Result<FunctionExecutor> {
        if let Some(ref name) = def.function {
            return self.functions.get(name).ok_or_else(|| {
                StepflowError::Configuration(format!(
                    "unknown function '{}' (available: {})",
                    name,
                    self.functions.names().join(", ")
                ))
            });
        }
        if let Some(ref template) = def.template {
            return Ok(FunctionRegistry::template(def.label(), template.as_str()));
        }
        Err(StepflowError::Configuration(format!(
            "function step '{}' needs 'function' or 'template'",
            def.label()
        )))
    }

    fn resolve_agent(&self, name: Option<&str>, def: &NodeDefinition) -> Result<Arc<dyn Executor>> {
        let Some(name) = name else {
            return Err(StepflowError::Configuration(format!(
                "{} step '{}' names no executor",
                def.node_type,
                def.label()
            )));
        };
        self.agents
            .get(name)
            .cloned()
            .ok_or_else(|| StepflowError::Configuration(format!("unknown {} '{}'", def.node_type, name)))
    }
}
