pub mod condition;
pub mod definition;
pub mod executor;
pub mod input;
pub mod loops;
pub mod node;
pub mod parallel;
pub mod router;
pub mod run_log;
pub mod step;
pub mod steps;
pub mod store;
pub mod validation;
pub mod workflow;

pub use condition::{Condition, ConditionBuilder, ConditionFn};
pub use definition::{FunctionRegistry, NodeDefinition, PipelineDefinition, PipelineLoader};
pub use executor::{FunctionExecutor, StepExecutor, StepFn};
pub use input::WorkflowInput;
pub use loops::{Loop, LoopCondition};
pub use node::Node;
pub use parallel::Parallel;
pub use router::{Classifier, MatchKind, Route, Router, RouterBuilder};
pub use run_log::RunLogger;
pub use step::{Step, StepBuilder};
pub use steps::Steps;
pub use store::RunStore;
pub use validation::{InputKind, InputSchema};
pub use workflow::{StepCollection, Workflow, WorkflowBuilder};
