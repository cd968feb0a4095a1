//! Sweep planning and execution.
//!
//! - [`sweep`]: builds [`SweepPlan`]s from the parameter model
//! - [`plan`]: the plan itself, with its step cursor and compensation rules
//! - [`break_condition`]: per-step stop predicates and the backsweep policy
//! - [`orchestrator`]: runs plans against registered instrument channels
//! - [`state`]: orchestrator lifecycle and run summaries

pub mod break_condition;
pub mod orchestrator;
pub mod plan;
pub mod state;
pub mod sweep;

pub use break_condition::{BreakCondition, BreakConditionEvaluator, BreakVerdict, EvaluatorState};
pub use orchestrator::{BufferedAcquisition, CancelHandle, MeasurementOrchestrator, RunMode};
pub use plan::{PlanStep, SweepDirection, SweepPlan, Timetrace};
pub use state::{OrchestratorState, RunSummary};
pub use sweep::{SweepBuilder, SweepMode};
