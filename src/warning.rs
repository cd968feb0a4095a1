//! Non-fatal conditions reported back to the caller.
//!
//! Only a few situations are downgraded from errors: large grids, the buffer
//! taking precedence over a sweep's own point count, ignored buffered
//! setpoints/delays, and a trigger mode forced by the trigger adapter. Each
//! warning is logged where it is produced and also returned so callers can
//! surface it.

use serde::Serialize;
use std::fmt;

use crate::buffer::TriggerMode;
use crate::parameter::ParameterKey;

/// A documented, non-fatal deviation from the requested configuration.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MeasurementWarning {
    /// Grid step count above the configured threshold.
    LargeGrid {
        /// Total steps
        steps: usize,
        /// Configured threshold
        threshold: usize,
    },
    /// Buffer `num_points` replaced the sweep's own point count.
    BufferNumPointsOverride {
        /// Swept parameter
        key: ParameterKey,
        /// Points the sweep asked for
        requested: usize,
        /// Points the buffer will acquire
        resolved: usize,
    },
    /// Interior setpoints dropped; buffered sweeps use first and last only.
    IgnoredInteriorSetpoints {
        /// Swept parameter
        key: ParameterKey,
        /// Number of dropped setpoints
        count: usize,
    },
    /// Per-point delay dropped in buffered mode.
    IgnoredDelay {
        /// Swept parameter
        key: ParameterKey,
        /// Dropped delay in seconds
        delay: f64,
    },
    /// The trigger adapter changed the trigger mode.
    TriggerModeForced {
        /// Mode in the resolved configuration
        requested: TriggerMode,
        /// Mode the adapter applied
        forced: TriggerMode,
    },
}

impl MeasurementWarning {
    /// Emit the warning through `tracing`.
    pub fn log(&self) {
        tracing::warn!(warning = %self, "Measurement warning");
    }
}

impl fmt::Display for MeasurementWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MeasurementWarning::LargeGrid { steps, threshold } => write!(
                f,
                "grid sweep has {steps} steps (threshold {threshold}); runtime may be impractical"
            ),
            MeasurementWarning::BufferNumPointsOverride {
                key,
                requested,
                resolved,
            } => write!(
                f,
                "{key} requested {requested} points; buffer num_points={resolved} takes precedence"
            ),
            MeasurementWarning::IgnoredInteriorSetpoints { key, count } => write!(
                f,
                "{key}: {count} interior setpoints ignored, buffered sweeps use first and last setpoint"
            ),
            MeasurementWarning::IgnoredDelay { key, delay } => {
                write!(f, "{key}: delay of {delay} s ignored in buffered mode")
            }
            MeasurementWarning::TriggerModeForced { requested, forced } => write!(
                f,
                "trigger adapter forced trigger_mode {forced} (configured {requested})"
            ),
        }
    }
}
