use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Value};
use tracing::{debug, info};

use stepflow_core::context::RunContext;
use stepflow_core::error::{Result, StepflowError};
use stepflow_core::event::EventKind;
use stepflow_core::types::{content_text, ExecutorType, StepInput, StepOutput};

use crate::node::{finish_output, run_chain, Node};

/// Maps an input to a route name.
pub type Classifier = Arc<dyn Fn(&StepInput) -> String + Send + Sync>;

/// A named list of nodes a router can dispatch to.
pub struct Route {
    pub name: String,
    pub nodes: Vec<Node>,
}

/// How a route was selected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchKind {
    Exact,
    CaseInsensitive,
    Partial,
    Default,
}

impl MatchKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Exact => "exact",
            Self::CaseInsensitive => "case_insensitive",
            Self::Partial => "partial",
            Self::Default => "default",
        }
    }
}

/// Content-based dispatch to one of several named routes.
pub struct Router {
    name: Option<String>,
    description: Option<String>,
    classifier: Classifier,
    routes: Vec<Route>,
    default_route: Option<String>,
    case_insensitive: bool,
    partial_match: bool,
}

#[derive(Default)]
pub struct RouterBuilder {
    name: Option<String>,
    description: Option<String>,
    classifier: Option<Classifier>,
    routes: Vec<Route>,
    default_route: Option<String>,
    case_insensitive: bool,
    partial_match: bool,
}

impl RouterBuilder {
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn classifier(mut self, classifier: Classifier) -> Self {
        self.classifier = Some(classifier);
        self
    }

    /// Add a route. Routes are matched in declaration order.
    pub fn route(mut self, name: impl Into<String>, nodes: Vec<Node>) -> Self {
        self.routes.push(Route {
            name: name.into(),
            nodes,
        });
        self
    }

    /// Route to use when nothing matches.
    pub fn default_route(mut self, name: impl Into<String>) -> Self {
        self.default_route = Some(name.into());
        self
    }

    pub fn case_insensitive(mut self, enabled: bool) -> Self {
        self.case_insensitive = enabled;
        self
    }

    /// Match when the route name and the classifier output contain one another.
    pub fn partial_match(mut self, enabled: bool) -> Self {
        self.partial_match = enabled;
        self
    }

    pub fn build(self) -> Result<Router> {
        let label = self.name.as_deref().unwrap_or("<unnamed>").to_string();
        let Some(classifier) = self.classifier else {
            return Err(StepflowError::Configuration(format!(
                "router '{}' has no classifier",
                label
            )));
        };
        if let Some(ref default) = self.default_route {
            if !self.routes.iter().any(|r| &r.name == default) {
                return Err(StepflowError::Configuration(format!(
                    "router '{}' default route '{}' is not a declared route",
                    label, default
                )));
            }
        }
        Ok(Router {
            name: self.name,
            description: self.description,
            classifier,
            routes: self.routes,
            default_route: self.default_route,
            case_insensitive: self.case_insensitive,
            partial_match: self.partial_match,
        })
    }
}

impl Router {
    pub fn builder() -> RouterBuilder {
        RouterBuilder::default()
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn route_names(&self) -> impl Iterator<Item = &str> {
        self.routes.iter().map(|r| r.name.as_str())
    }

    pub(crate) fn display_name(&self) -> String {
        self.name.clone().unwrap_or_else(|| "router".to_string())
    }

    /// Find the route for a classifier result.
    pub fn select(&self, key: &str) -> Option<(&Route, MatchKind)> {
        if let Some(route) = self.routes.iter().find(|r| r.name == key) {
            return Some((route, MatchKind::Exact));
        }
        if self.case_insensitive {
            let key = key.to_lowercase();
            if let Some(route) = self.routes.iter().find(|r| r.name.to_lowercase() == key) {
                return Some((route, MatchKind::CaseInsensitive));
            }
        }
        if self.partial_match && !key.is_empty() {
            let fold = |s: &str| {
                if self.case_insensitive {
                    s.to_lowercase()
                } else {
                    s.to_string()
                }
            };
            let key = fold(key);
            if let Some(route) = self.routes.iter().find(|r| {
                let name = fold(&r.name);
                name.contains(&key) || key.contains(&name)
            }) {
                return Some((route, MatchKind::Partial));
            }
        }
        let default = self.default_route.as_deref()?;
        self.routes
            .iter()
            .find(|r| r.name == default)
            .map(|r| (r, MatchKind::Default))
    }

    pub async fn execute(&self, ctx: &RunContext, input: StepInput) -> Result<StepOutput> {
        let name = self.display_name();
        ctx.check_cancelled()?;
        let start = Utc::now();
        let output = self.run(ctx, input, &name).await?;
        Ok(finish_output(output, &name, ExecutorType::Router, start))
    }

    pub(crate) async fn run(&self, ctx: &RunContext, input: StepInput, name: &str) -> Result<StepOutput> {
        ctx.emit(EventKind::RouterStarted, json!({ "router": name }))
            .await;

        let key = (self.classifier)(&input);
        let Some((route, matched_by)) = self.select(&key) else {
            info!(router = %name, route = %key, "No route matched");
            let output = StepOutput::new(Value::Null)
                .with_name(name)
                .with_executor(name, ExecutorType::Router)
                .with_metadata("route", key.clone())
                .with_metadata("matched", false);
            ctx.emit(
                EventKind::RouterCompleted,
                json!({ "router": name, "route": key, "matched": false }),
            )
            .await;
            return Ok(output);
        };
        debug!(router = %name, route = %key, selected = %route.name, matched_by = matched_by.as_str(), "Route selected");

        let chain = run_chain(ctx, &route.nodes, &input, |i, node| {
            node.resolved_name(&format!("{}_{}_step_{}", name, route.name, i + 1))
        })
        .await
        .map_err(|failure| {
            if failure.error.is_cancelled() {
                failure.error
            } else {
                StepflowError::BranchFailed {
                    node: format!("Router '{}'", name),
                    branch: route.name.clone(),
                    source: Box::new(failure.error),
                }
            }
        })?;

        let mut output = StepOutput::new(chain.content())
            .with_name(name)
            .with_executor(name, ExecutorType::Router)
            .with_metadata("route", key)
            .with_metadata("matched", true)
            .with_metadata("selected_route", route.name.clone())
            .with_metadata("matched_by", matched_by.as_str());
        output.next_step = Some(route.name.clone());
        output.child_outputs = Some(chain.children_map());

        ctx.emit(
            EventKind::RouterCompleted,
            json!({ "router": name, "route": route.name, "matched_by": matched_by.as_str() }),
        )
        .await;
        Ok(output)
    }
}

fn route_key(value: &Value) -> String {
    content_text(value)
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// `error`, `success`, or `warning` when the content mentions it, else `default`.
/// Uses the previous content, or the message when there is none.
pub fn by_content_keywords() -> Classifier {
    Arc::new(|input: &StepInput| {
        let text = content_text(input.effective_content()).to_lowercase();
        let route = if text.contains("error") {
            "error"
        } else if text.contains("success") {
            "success"
        } else if text.contains("warning") {
            "warning"
        } else {
            "default"
        };
        route.to_string()
    })
}

/// Route on `additional_data[key]`.
pub fn by_metadata_key(key: impl Into<String>) -> Classifier {
    let key = key.into();
    Arc::new(move |input: &StepInput| {
        input
            .additional_data
            .get(&key)
            .map(route_key)
            .unwrap_or_default()
    })
}

/// Route on metadata `key` of the output recorded for `step`.
pub fn by_step_metadata(step: impl Into<String>, key: impl Into<String>) -> Classifier {
    let step = step.into();
    let key = key.into();
    Arc::new(move |input: &StepInput| {
        input
            .step_output(&step)
            .and_then(|o| o.metadata.get(&key))
            .map(route_key)
            .unwrap_or_default()
    })
}

/// Route on the JSON type of the previous content (or the message).
pub fn by_content_type() -> Classifier {
    Arc::new(|input: &StepInput| json_type(input.effective_content()).to_string())
}

/// Route on the JSON type of the workflow message.
pub fn by_message_type() -> Classifier {
    Arc::new(|input: &StepInput| json_type(&input.message).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::FunctionExecutor;
    use crate::step::Step;
    use stepflow_core::types::OutputLog;

    fn reply(text: &'static str) -> Vec<Node> {
        vec![Step::from_function(FunctionExecutor::sync(text, move |_| Ok(StepOutput::new(text)))).into()]
    }

    fn keyword_router() -> Router {
        Router::builder()
            .name("triage")
            .classifier(by_content_keywords())
            .route("error", reply("Error handled"))
            .route("success", reply("Success handled"))
            .route("default", reply("Default handled"))
            .default_route("default")
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn routes_by_keywords() {
        let router = keyword_router();
        let ctx = RunContext::detached();

        let out = router
            .execute(&ctx, StepInput::new("An error occurred"))
            .await
            .unwrap();
        assert_eq!(out.content, json!("Error handled"));
        assert_eq!(out.next_step.as_deref(), Some("error"));
        assert_eq!(out.metadata["matched_by"], json!("exact"));

        let out = router
            .execute(&ctx, StepInput::new("Operation success"))
            .await
            .unwrap();
        assert_eq!(out.content, json!("Success handled"));

        let out = router
            .execute(&ctx, StepInput::new("just a normal day"))
            .await
            .unwrap();
        assert_eq!(out.content, json!("Default handled"));
        assert_eq!(out.metadata["selected_route"], json!("default"));
    }

    #[test]
    fn lookup_order() {
        let router = Router::builder()
            .classifier(by_message_type())
            .route("Billing", vec![])
            .route("billing-disputes", vec![])
            .route("fallback", vec![])
            .default_route("fallback")
            .case_insensitive(true)
            .partial_match(true)
            .build()
            .unwrap();

        let (route, kind) = router.select("Billing").unwrap();
        assert_eq!((route.name.as_str(), kind), ("Billing", MatchKind::Exact));

        let (route, kind) = router.select("BILLING").unwrap();
        assert_eq!((route.name.as_str(), kind), ("Billing", MatchKind::CaseInsensitive));

        // First declared route wins among partial matches.
        let (route, kind) = router.select("disputes").unwrap();
        assert_eq!((route.name.as_str(), kind), ("billing-disputes", MatchKind::Partial));

        let (route, kind) = router.select("BILLING-DISPUTES-2024").unwrap();
        assert_eq!((route.name.as_str(), kind), ("Billing", MatchKind::Partial));

        let (route, kind) = router.select("shipping").unwrap();
        assert_eq!((route.name.as_str(), kind), ("fallback", MatchKind::Default));
    }

    #[test]
    fn case_folding_covers_unicode_names() {
        let router = Router::builder()
            .classifier(by_message_type())
            .route("Ärger", vec![])
            .case_insensitive(true)
            .partial_match(true)
            .build()
            .unwrap();

        let (route, kind) = router.select("ÄRGER").unwrap();
        assert_eq!((route.name.as_str(), kind), ("Ärger", MatchKind::CaseInsensitive));

        let (_, kind) = router.select("großer ärger").unwrap();
        assert_eq!(kind, MatchKind::Partial);
    }

    #[tokio::test]
    async fn no_match_without_default_is_noop() {
        let router = Router::builder()
            .classifier(Arc::new(|_: &StepInput| "unknown".to_string()))
            .route("known", reply("handled"))
            .build()
            .unwrap();
        let out = router
            .execute(&RunContext::detached(), StepInput::new("x"))
            .await
            .unwrap();
        assert_eq!(out.content, Value::Null);
        assert_eq!(out.metadata["matched"], json!(false));
        assert_eq!(out.metadata["route"], json!("unknown"));
        assert!(out.next_step.is_none());
    }

    #[test]
    fn build_validation() {
        assert!(matches!(
            Router::builder().route("a", vec![]).build(),
            Err(StepflowError::Configuration(_))
        ));
        assert!(matches!(
            Router::builder()
                .classifier(by_content_type())
                .route("a", vec![])
                .default_route("missing")
                .build(),
            Err(StepflowError::Configuration(_))
        ));
    }

    #[test]
    fn builtin_classifiers() {
        let mut outputs = OutputLog::new();
        outputs.insert("check", StepOutput::new("x").with_metadata("tier", "gold"));
        let input = StepInput::new(json!({"id": 1}))
            .with_previous_content(json!([1, 2]))
            .with_previous_outputs(outputs)
            .with_additional_data("channel", json!("email"));

        assert_eq!(by_content_type()(&input), "array");
        assert_eq!(by_message_type()(&input), "object");
        assert_eq!(by_metadata_key("channel")(&input), "email");
        assert_eq!(by_metadata_key("missing")(&input), "");
        assert_eq!(by_step_metadata("check", "tier")(&input), "gold");
        assert_eq!(by_content_keywords()(&StepInput::new("Warning: low disk")), "warning");
    }
}
