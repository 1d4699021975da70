//! Broadcast event bus for distributing `RunEvent` to multiple subscribers.
//!
//! Built on `tokio::sync::broadcast`. Publishing with no active subscribers is
//! a no-op.

use std::time::Duration;

use serde_json::Value;
use tokio::sync::broadcast;
use uuid::Uuid;
use weft_types::event::RunEvent;
use weft_types::workflow::{ExecutionPlan, StepDefinition};

use crate::workflow::executor::{ExecutorError, RunObserver};
use crate::workflow::step_runner::StepError;

/// Multi-consumer bus for run events.
///
/// Cloning the bus clones the sender, allowing multiple producers and
/// consumers.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<RunEvent>,
}

impl EventBus {
    /// Create a new event bus with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Create a new subscriber that will receive all future events.
    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.sender.subscribe()
    }

    /// Publish an event to all current subscribers.
    pub fn publish(&self, event: RunEvent) {
        let _ = self.sender.send(event);
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("receiver_count", &self.sender.receiver_count())
            .finish()
    }
}

impl RunObserver for EventBus {
    fn run_started(&self, run_id: Uuid, workflow: &str, plan: &ExecutionPlan) {
        self.publish(RunEvent::RunStarted {
            run_id,
            workflow_name: workflow.to_string(),
            total_steps: plan.step_ids().count(),
            layers: plan.len(),
        });
    }

    fn step_started(&self, run_id: Uuid, step: &StepDefinition) {
        self.publish(RunEvent::StepStarted {
            run_id,
            step_id: step.id.clone(),
            step_kind: step.tool.to_string(),
        });
    }

    fn step_completed(&self, run_id: Uuid, step_id: &str, output: &Value, duration: Duration) {
        self.publish(RunEvent::StepCompleted {
            run_id,
            step_id: step_id.to_string(),
            output: output.clone(),
            duration_ms: duration.as_millis() as u64,
        });
    }

    fn step_skipped(&self, run_id: Uuid, step_id: &str, reason: &str) {
        self.publish(RunEvent::StepSkipped {
            run_id,
            step_id: step_id.to_string(),
            reason: reason.to_string(),
        });
    }

    fn step_failed(&self, run_id: Uuid, step_id: &str, error: &StepError, continued: bool) {
        self.publish(RunEvent::StepFailed {
            run_id,
            step_id: step_id.to_string(),
            error: error.to_string(),
            continued,
        });
    }

    fn run_completed(&self, run_id: Uuid, workflow: &str, duration: Duration, steps_completed: usize) {
        self.publish(RunEvent::RunCompleted {
            run_id,
            workflow_name: workflow.to_string(),
            duration_ms: duration.as_millis() as u64,
            steps_completed,
        });
    }

    fn run_failed(&self, run_id: Uuid, workflow: &str, error: &ExecutorError) {
        self.publish(RunEvent::RunFailed {
            run_id,
            workflow_name: workflow.to_string(),
            error: error.to_string(),
        });
    }
}
