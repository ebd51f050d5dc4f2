use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Every event kind the engine emits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    WorkflowStarted,
    WorkflowCompleted,
    WorkflowFailed,
    WorkflowCancelled,
    StepStarted,
    #[default]
    StepCompleted,
    StepSkipped,
    StepFailed,
    /// A streaming chunk from an agent step.
    StepOutput,
    StepsStarted,
    StepsCompleted,
    LoopStarted,
    LoopIterationStarted,
    LoopIterationCompleted,
    LoopCompleted,
    ParallelStarted,
    ParallelCompleted,
    ConditionStarted,
    ConditionCompleted,
    RouterStarted,
    RouterCompleted,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WorkflowStarted => "workflow_started",
            Self::WorkflowCompleted => "workflow_completed",
            Self::WorkflowFailed => "workflow_failed",
            Self::WorkflowCancelled => "workflow_cancelled",
            Self::StepStarted => "step_started",
            Self::StepCompleted => "step_completed",
            Self::StepSkipped => "step_skipped",
            Self::StepFailed => "step_failed",
            Self::StepOutput => "step_output",
            Self::StepsStarted => "steps_started",
            Self::StepsCompleted => "steps_completed",
            Self::LoopStarted => "loop_started",
            Self::LoopIterationStarted => "loop_iteration_started",
            Self::LoopIterationCompleted => "loop_iteration_completed",
            Self::LoopCompleted => "loop_completed",
            Self::ParallelStarted => "parallel_started",
            Self::ParallelCompleted => "parallel_completed",
            Self::ConditionStarted => "condition_started",
            Self::ConditionCompleted => "condition_completed",
            Self::RouterStarted => "router_started",
            Self::RouterCompleted => "router_completed",
        }
    }

    /// Whether this event ends a run.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::WorkflowCompleted | Self::WorkflowFailed | Self::WorkflowCancelled
        )
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed event envelope delivered to handlers, subscribers, and sinks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowEvent {
    pub kind: EventKind,
    pub run_id: String,
    pub workflow_id: String,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

impl WorkflowEvent {
    pub fn new(
        kind: EventKind,
        run_id: impl Into<String>,
        workflow_id: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            kind,
            run_id: run_id.into(),
            workflow_id: workflow_id.into(),
            payload,
            timestamp: Utc::now(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// Synchronous in-process event handler.
pub type EventHandler = Arc<dyn Fn(&WorkflowEvent) + Send + Sync>;

/// Event bus using a tokio broadcast channel.
/// All subscribers receive all events; handlers registered for a kind are
/// called in registration order before the broadcast.
pub struct EventBus {
    tx: tokio::sync::broadcast::Sender<WorkflowEvent>,
    handlers: RwLock<HashMap<EventKind, Vec<EventHandler>>>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(capacity.max(1));
        Self {
            tx,
            handlers: RwLock::new(HashMap::new()),
        }
    }

    pub fn publish(&self, event: WorkflowEvent) {
        let handlers = {
            let map = self.handlers.read().unwrap_or_else(|e| e.into_inner());
            map.get(&event.kind).cloned().unwrap_or_default()
        };
        for handler in &handlers {
            handler(&event);
        }
        // Ignore error if no receivers
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<WorkflowEvent> {
        self.tx.subscribe()
    }

    pub fn on(&self, kind: EventKind, handler: EventHandler) {
        let mut map = self.handlers.write().unwrap_or_else(|e| e.into_inner());
        map.entry(kind).or_default().push(handler);
    }

    pub fn handler_count(&self, kind: EventKind) -> usize {
        let map = self.handlers.read().unwrap_or_else(|e| e.into_inner());
        map.get(&kind).map_or(0, Vec::len)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn handlers_run_in_registration_order() {
        let bus = EventBus::default();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for tag in ["first", "second"] {
            let seen = seen.clone();
            bus.on(
                EventKind::StepCompleted,
                Arc::new(move |_| seen.lock().unwrap().push(tag)),
            );
        }
        bus.publish(WorkflowEvent::new(
            EventKind::StepCompleted,
            "run",
            "wf",
            Value::Null,
        ));
        // Different kind: no handler fires.
        bus.publish(WorkflowEvent::new(
            EventKind::StepStarted,
            "run",
            "wf",
            Value::Null,
        ));

        assert_eq!(*seen.lock().unwrap(), vec!["first", "second"]);
        assert_eq!(bus.handler_count(EventKind::StepCompleted), 2);
        assert_eq!(bus.handler_count(EventKind::StepStarted), 0);
    }

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        bus.publish(WorkflowEvent::new(
            EventKind::WorkflowStarted,
            "run-1",
            "wf",
            serde_json::json!({"input": "hi"}),
        ));
        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind, EventKind::WorkflowStarted);
        assert_eq!(event.run_id, "run-1");
    }

    #[test]
    fn publish_without_subscribers_is_fine() {
        let bus = EventBus::default();
        bus.publish(WorkflowEvent::new(
            EventKind::WorkflowCompleted,
            "r",
            "w",
            Value::Null,
        ));
    }

    #[test]
    fn event_kind_names() {
        assert_eq!(EventKind::LoopIterationStarted.as_str(), "loop_iteration_started");
        assert_eq!(
            serde_json::to_string(&EventKind::RouterCompleted).unwrap(),
            "\"router_completed\""
        );
        assert!(EventKind::WorkflowCancelled.is_terminal());
        assert!(!EventKind::StepCompleted.is_terminal());
    }
}
