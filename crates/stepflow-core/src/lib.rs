pub mod config;
pub mod context;
pub mod error;
pub mod event;
pub mod traits;
pub mod types;

pub use config::AppConfig;
pub use context::RunContext;
pub use error::{BranchFailure, Result, StepflowError};
pub use event::{EventBus, EventHandler, EventKind, WorkflowEvent};
pub use traits::{EventSink, Executor, SessionStorage};
pub use types::*;
