use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;

use stepflow_core::context::RunContext;
use stepflow_core::error::Result;
use stepflow_core::traits::Executor;
use stepflow_core::types::{ExecutorType, StepInput, StepOutput};

/// Boxed step function: receives the run context and the step input.
pub type StepFn =
    Arc<dyn Fn(RunContext, StepInput) -> BoxFuture<'static, Result<StepOutput>> + Send + Sync>;

/// A named in-process function that produces a `StepOutput`.
#[derive(Clone)]
pub struct FunctionExecutor {
    name: String,
    func: StepFn,
}

impl FunctionExecutor {
    /// Wrap an async function.
    pub fn new<F, Fut>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(RunContext, StepInput) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<StepOutput>> + Send + 'static,
    {
        Self {
            name: name.into(),
            func: Arc::new(
                move |ctx: RunContext, input: StepInput| -> BoxFuture<'static, Result<StepOutput>> {
                    Box::pin(func(ctx, input))
                },
            ),
        }
    }

    /// Wrap a synchronous function.
    pub fn sync<F>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(&StepInput) -> Result<StepOutput> + Send + Sync + 'static,
    {
        Self::new(name, move |_ctx, input: StepInput| {
            futures::future::ready(func(&input))
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) async fn call(&self, ctx: &RunContext, input: StepInput) -> Result<StepOutput> {
        (self.func)(ctx.clone(), input).await
    }
}

impl std::fmt::Debug for FunctionExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionExecutor")
            .field("name", &self.name)
            .finish()
    }
}

/// The single unit of work a `Step` wraps.
#[derive(Clone)]
pub enum StepExecutor {
    Function(FunctionExecutor),
    Agent(Arc<dyn Executor>),
    Team(Arc<dyn Executor>),
}

impl StepExecutor {
    pub fn name(&self) -> &str {
        match self {
            Self::Function(f) => f.name(),
            Self::Agent(a) | Self::Team(a) => a.name(),
        }
    }

    pub fn executor_type(&self) -> ExecutorType {
        match self {
            Self::Function(_) => ExecutorType::Function,
            Self::Agent(_) => ExecutorType::Agent,
            Self::Team(_) => ExecutorType::Team,
        }
    }
}

impl std::fmt::Debug for StepExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", self.executor_type(), self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn sync_function_sees_input() {
        let f = FunctionExecutor::sync("upper", |input| {
            Ok(StepOutput::new(input.message_text().to_uppercase()))
        });
        let out = f
            .call(&RunContext::detached(), StepInput::new("abc"))
            .await
            .unwrap();
        assert_eq!(out.content, json!("ABC"));
        assert_eq!(f.name(), "upper");
    }

    #[tokio::test]
    async fn async_function_gets_context() {
        let f = FunctionExecutor::new("run-id", |ctx: RunContext, _input| async move {
            Ok(StepOutput::new(ctx.workflow_id().to_string()))
        });
        let out = f
            .call(&RunContext::detached(), StepInput::default())
            .await
            .unwrap();
        assert_eq!(out.content, json!("detached"));
    }

    #[test]
    fn executor_type_follows_variant() {
        let f = StepExecutor::Function(FunctionExecutor::sync("f", |_| Ok(StepOutput::default())));
        assert_eq!(f.executor_type(), ExecutorType::Function);
        assert_eq!(f.name(), "f");
    }
}
