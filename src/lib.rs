//! # transport_daq
//!
//! Measurement orchestration for electronic transport experiments: gates and
//! contacts of a device are swept through setpoints while currents and
//! voltages are recorded.
//!
//! ## Crate Structure
//!
//! - **`parameter`**: the parameter model. Terminals own parameters, each
//!   with a role (static, dynamic, gettable, compensating), setpoints,
//!   limits and break conditions.
//! - **`experiment`**: sweep plans (sequential, parallel, grid, with
//!   compensation), break conditions with optional backsweep, and the
//!   `MeasurementOrchestrator` that runs the plans.
//! - **`buffer`**: resolves buffered acquisition settings (two of
//!   `num_points`, `sampling_rate`, `burst_duration`).
//! - **`hardware`**: capability traits for instrument channels, buffers and
//!   triggers, the channel registry, ramps, a live monitor and mocks.
//! - **`data`**: measurement records and data sinks (memory, channel, CSV).
//! - **`config`**: run settings loaded from TOML and the environment.
//! - **`logging`**: `tracing` subscriber setup.
//! - **`error`**: the `DaqError` enum and its categories.
//! - **`warning`**: non-fatal conditions reported back to the caller.
//!
//! ## Control flow
//!
//! ```text
//! config ─> ParameterModel ─> SweepBuilder ─> SweepPlan(s)
//!                                  │
//!        BufferSettingsResolver ───┘ (buffered only)
//!
//! SweepPlan(s) ─> MeasurementOrchestrator ─> DataSink
//!                      │
//!                      └─ BreakConditionEvaluator per step
//! ```

pub mod buffer;
pub mod config;
pub mod data;
pub mod error;
pub mod experiment;
pub mod hardware;
pub mod logging;
pub mod parameter;
pub mod warning;

pub use error::{AppResult, DaqError, ErrorCategory};
pub use parameter::{ParameterKey, ParameterModel, Value};
pub use warning::MeasurementWarning;
