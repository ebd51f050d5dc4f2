use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use stepflow_core::error::StepflowError;
use stepflow_core::types::{
    ExecutorType, OutputLog, RunStatus, StepMetrics, StepOutput, WorkflowMetrics,
};

use crate::node::record_output;

struct RunState {
    outputs: OutputLog,
    metrics: WorkflowMetrics,
    status: RunStatus,
}

/// Run-scoped outputs, metrics, and status behind one lock.
pub struct RunStore {
    state: RwLock<RunState>,
}

impl RunStore {
    pub fn new(workflow_id: &str) -> Self {
        Self {
            state: RwLock::new(RunState {
                outputs: OutputLog::new(),
                metrics: WorkflowMetrics::new("", workflow_id),
                status: RunStatus::Pending,
            }),
        }
    }

    /// Clear everything for a fresh run.
    pub async fn reset(&self, run_id: &str, workflow_id: &str) {
        let mut state = self.state.write().await;
        state.outputs = OutputLog::new();
        state.metrics = WorkflowMetrics::new(run_id, workflow_id);
        state.status = RunStatus::Pending;
    }

    pub async fn set_status(&self, status: RunStatus) {
        self.state.write().await.status = status;
    }

    pub async fn status(&self) -> RunStatus {
        self.state.read().await.status
    }

    /// Copy of the outputs recorded so far.
    pub async fn snapshot(&self) -> OutputLog {
        self.state.read().await.outputs.clone()
    }

    pub async fn metrics(&self) -> WorkflowMetrics {
        self.state.read().await.metrics.clone()
    }

    /// Record a completed top-level node and everything nested in it.
    pub async fn record(&self, name: &str, output: &StepOutput) {
        let mut state = self.state.write().await;
        record_output(&mut state.outputs, name, output);

        for (child, nested) in output.nested_outputs() {
            if let Some(ref metrics) = nested.metrics {
                state.metrics.step_metrics.insert(child, metrics.clone());
            }
        }
        if let Some(ref metrics) = output.metrics {
            state.metrics.step_metrics.insert(name.to_string(), metrics.clone());
        }

        state.metrics.steps_executed += 1;
        if output.is_skipped() {
            state.metrics.steps_skipped += 1;
        } else {
            state.metrics.steps_succeeded += 1;
        }
    }

    /// Record a top-level node that failed.
    pub async fn record_failure(
        &self,
        name: &str,
        executor_type: ExecutorType,
        start: DateTime<Utc>,
        error: &StepflowError,
    ) {
        let mut state = self.state.write().await;
        state.metrics.steps_executed += 1;
        state.metrics.steps_failed += 1;
        state.metrics.step_metrics.insert(
            name.to_string(),
            StepMetrics::new(name, executor_type, start).failed(error.to_string()),
        );
    }

    /// Finalize metrics and set the terminal status.
    pub async fn finish(&self, status: RunStatus, error: Option<String>) -> (WorkflowMetrics, OutputLog) {
        let mut state = self.state.write().await;
        state.status = status;
        state
            .metrics
            .finish(status == RunStatus::Completed, error);
        (state.metrics.clone(), state.outputs.clone())
    }
}
