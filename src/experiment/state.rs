//! Orchestrator lifecycle and run summaries.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use uuid::Uuid;

use crate::warning::MeasurementWarning;

/// Orchestrator execution state.
///
/// # State Machine
///
/// ```text
/// Idle ──> Initializing ──> Running ──> Finished ──┐
///               ▲              │                   ├──> Reset
///               └── next plan ─┤                   │
///                              └──> Aborted ───────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OrchestratorState {
    /// No run active
    Idle,
    /// Bringing parameters to their starting values
    Initializing,
    /// Walking the plan
    Running,
    /// All plans completed
    Finished,
    /// Stopped by an error, a break condition or cancellation
    Aborted,
    /// Parameters restored to their pre-run values
    Reset,
}

impl fmt::Display for OrchestratorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrchestratorState::Idle => write!(f, "Idle"),
            OrchestratorState::Initializing => write!(f, "Initializing"),
            OrchestratorState::Running => write!(f, "Running"),
            OrchestratorState::Finished => write!(f, "Finished"),
            OrchestratorState::Aborted => write!(f, "Aborted"),
            OrchestratorState::Reset => write!(f, "Reset"),
        }
    }
}

impl OrchestratorState {
    /// Check if the state allows starting a new run.
    pub fn can_begin(&self) -> bool {
        matches!(self, OrchestratorState::Idle | OrchestratorState::Reset)
    }

    /// Check if the state allows executing plan steps.
    pub fn can_run(&self) -> bool {
        matches!(self, OrchestratorState::Initializing)
    }

    /// True once the run has ended, successfully or not.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrchestratorState::Finished | OrchestratorState::Aborted | OrchestratorState::Reset
        )
    }
}

/// One recorded state change.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StateTransition {
    /// Previous state
    pub from: OrchestratorState,
    /// New state
    pub to: OrchestratorState,
    /// Time of the change
    pub at: DateTime<Utc>,
}

/// Outcome of a successful [`execute`](super::orchestrator::MeasurementOrchestrator::execute).
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    /// Run identifier stamped on every record
    pub run_id: Uuid,
    /// Plans executed
    pub plans: usize,
    /// Records written to the sink
    pub records: usize,
    /// Backsweeps performed after break conditions
    pub backsweeps: usize,
    /// Warnings from planning and execution
    pub warnings: Vec<MeasurementWarning>,
    /// Start of the run
    pub started: DateTime<Utc>,
    /// End of the run, after reset
    pub finished: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_idle_or_reset_can_begin() {
        assert!(OrchestratorState::Idle.can_begin());
        assert!(OrchestratorState::Reset.can_begin());
        assert!(!OrchestratorState::Running.can_begin());
        assert!(!OrchestratorState::Aborted.can_begin());
        assert!(OrchestratorState::Aborted.is_terminal());
        assert_eq!(OrchestratorState::Initializing.to_string(), "Initializing");
    }
}
