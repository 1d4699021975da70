//! Run lifecycle events.
//!
//! `RunEvent` is the typed form of the engine's observer callbacks. Hosts that
//! prefer a channel over a callback trait subscribe to these via the event bus.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Events emitted over the course of a single workflow run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    /// A run passed validation and planning and is about to execute.
    RunStarted {
        run_id: Uuid,
        workflow_name: String,
        total_steps: usize,
        layers: usize,
    },

    /// A step has started executing.
    StepStarted {
        run_id: Uuid,
        step_id: String,
        step_kind: String,
    },

    /// A step completed successfully.
    StepCompleted {
        run_id: Uuid,
        step_id: String,
        output: Value,
        duration_ms: u64,
    },

    /// A step was skipped (condition not met or branch not taken).
    StepSkipped {
        run_id: Uuid,
        step_id: String,
        reason: String,
    },

    /// A step failed. `continued` is true when `continueOnError` kept the run going.
    StepFailed {
        run_id: Uuid,
        step_id: String,
        error: String,
        continued: bool,
    },

    /// A run finished all layers.
    RunCompleted {
        run_id: Uuid,
        workflow_name: String,
        duration_ms: u64,
        steps_completed: usize,
    },

    /// A run aborted.
    RunFailed {
        run_id: Uuid,
        workflow_name: String,
        error: String,
    },
}

impl RunEvent {
    pub fn run_id(&self) -> Uuid {
        match self {
            RunEvent::RunStarted { run_id, .. }
            | RunEvent::StepStarted { run_id, .. }
            | RunEvent::StepCompleted { run_id, .. }
            | RunEvent::StepSkipped { run_id, .. }
            | RunEvent::StepFailed { run_id, .. }
            | RunEvent::RunCompleted { run_id, .. }
            | RunEvent::RunFailed { run_id, .. } => *run_id,
        }
    }

    /// The step this event concerns, if any.
    pub fn step_id(&self) -> Option<&str> {
        match self {
            RunEvent::StepStarted { step_id, .. }
            | RunEvent::StepCompleted { step_id, .. }
            | RunEvent::StepSkipped { step_id, .. }
            | RunEvent::StepFailed { step_id, .. } => Some(step_id),
            RunEvent::RunStarted { .. }
            | RunEvent::RunCompleted { .. }
            | RunEvent::RunFailed { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_step_skipped_serde_roundtrip() {
        let event = RunEvent::StepSkipped {
            run_id: Uuid::now_v7(),
            step_id: "rerank".to_string(),
            reason: "branch not taken".to_string(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"step_skipped\""));
        let parsed: RunEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, event);
    }

    #[test]
    fn test_step_completed_carries_output() {
        let event = RunEvent::StepCompleted {
            run_id: Uuid::nil(),
            step_id: "merge".to_string(),
            output: json!({ "resultCount": 4 }),
            duration_ms: 12,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["output"]["resultCount"], 4);
        assert_eq!(event.step_id(), Some("merge"));
    }

    #[test]
    fn test_run_level_events_have_no_step() {
        let event = RunEvent::RunFailed {
            run_id: Uuid::nil(),
            workflow_name: "wf".to_string(),
            error: "boom".to_string(),
        };
        assert_eq!(event.step_id(), None);
        assert_eq!(event.run_id(), Uuid::nil());
    }
}
