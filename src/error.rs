//! Error types for the measurement core.
//!
//! `DaqError` is the single error type surfaced at the crate boundary. Using
//! `thiserror`, every failure carries the terminal/parameter key or the
//! numeric values that caused it so that the caller never has to guess.
//!
//! ## Error Categories
//!
//! - **Configuration**: unknown parameter, invalid role, missing field,
//!   sweep-length mismatch, over/underdetermined buffer settings. Raised
//!   before any instrument is touched.
//! - **Safety**: limit violation, compensation-limit violation, writes to a
//!   locked parameter. Abort the run; `reset()` always follows.
//! - **Runtime**: break condition, acquisition timeout or count mismatch,
//!   adapter failures, cancellation.
//! - **Capability**: break conditions in buffered mode, missing ramp support.
//!   Raised at setup, before `initialize()`.
//!
//! Adapter implementations return `anyhow::Result`; the orchestrator wraps
//! those failures into [`DaqError::Instrument`] together with the key of the
//! channel that failed.

use std::time::Duration;
use thiserror::Error;

use crate::parameter::ParameterKey;

/// Convenience alias for results using the crate error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

/// Coarse classification used to decide how a failure is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Raised before hardware interaction.
    Configuration,
    /// Aborts the run, followed by reset.
    Safety,
    /// Raised while the run is in progress.
    Runtime,
    /// Missing adapter support, raised at setup.
    Capability,
}

#[allow(missing_docs)]
#[derive(Error, Debug)]
pub enum DaqError {
    // ------------------------------------------------------------------
    // Configuration
    // ------------------------------------------------------------------
    #[error("Unknown parameter '{parameter}' on terminal '{terminal}'")]
    UnknownParameter { terminal: String, parameter: String },

    #[error("Invalid role '{role}' for {key}: {reason}")]
    InvalidRole {
        key: ParameterKey,
        role: String,
        reason: String,
    },

    #[error("{key} is missing required field '{field}'")]
    MissingField { key: ParameterKey, field: &'static str },

    #[error("Invalid value for {key}: {reason}")]
    InvalidParameter { key: ParameterKey, reason: String },

    #[error("Invalid break condition '{condition}': {reason}")]
    InvalidBreakCondition { condition: String, reason: String },

    #[error("Sweep length mismatch: {key} has {found} setpoints, expected {expected}")]
    SweepLengthMismatch {
        key: ParameterKey,
        expected: usize,
        found: usize,
    },

    #[error(
        "Overdetermined buffer settings: num_points={num_points} does not match \
         sampling_rate={sampling_rate} x burst_duration={burst_duration}"
    )]
    OverdeterminedBufferSettings {
        num_points: usize,
        sampling_rate: f64,
        burst_duration: f64,
    },

    #[error(
        "Underdetermined buffer settings: exactly two of num_points, sampling_rate, \
         burst_duration are required (got {given:?})"
    )]
    UnderdeterminedBufferSettings { given: Vec<&'static str> },

    #[error("Duration mismatch: duration={duration} but burst_duration={burst_duration}")]
    DurationMismatch { duration: f64, burst_duration: f64 },

    #[error("Invalid buffer setting: {0}")]
    InvalidBufferSetting(String),

    #[error("{key} is not mapped to an instrument channel")]
    UnmappedParameter { key: ParameterKey },

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("Configuration error: {0}")]
    Figment(#[from] Box<figment::Error>),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // ------------------------------------------------------------------
    // Safety
    // ------------------------------------------------------------------
    #[error("Limit violation: {key} commanded to {value}, allowed range [{min}, {max}]")]
    LimitViolation {
        key: ParameterKey,
        value: f64,
        min: f64,
        max: f64,
    },

    #[error(
        "Compensation limit exceeded: {key} would reach {value} at step {step}, \
         allowed range [{min}, {max}]"
    )]
    CompensationLimitExceeded {
        key: ParameterKey,
        step: usize,
        value: f64,
        min: f64,
        max: f64,
    },

    #[error("{key} is locked")]
    LockedParameter { key: ParameterKey },

    // ------------------------------------------------------------------
    // Runtime
    // ------------------------------------------------------------------
    #[error("Break condition triggered by {key} at step {step} (reading {reading})")]
    BreakConditionTriggered {
        key: ParameterKey,
        reading: f64,
        step: usize,
    },

    #[error("Acquisition timed out after {timeout:?}")]
    AcquisitionTimeout { timeout: Duration },

    #[error("Acquisition count mismatch: expected {expected} samples, got {actual}")]
    AcquisitionCountMismatch { expected: usize, actual: usize },

    #[error("Instrument error on {key}: {message}")]
    Instrument { key: String, message: String },

    #[error("Data sink error: {0}")]
    Storage(String),

    #[error("Measurement cancelled before step {step}")]
    Cancelled { step: usize },

    #[error("Invalid orchestrator state: cannot {operation} while {state}")]
    InvalidState {
        operation: &'static str,
        state: String,
    },

    // ------------------------------------------------------------------
    // Capability
    // ------------------------------------------------------------------
    #[error("Buffered mode does not support break conditions ({key})")]
    UnsupportedInBufferedMode { key: ParameterKey },

    #[error("{key} requires a ramp-capable instrument channel")]
    MissingRampCapability { key: ParameterKey },

    #[error("{key} is mapped to a read-only channel but must be set")]
    NotSettable { key: ParameterKey },

    #[error("Buffer capacity exceeded: requested {requested} points, limit is {limit}")]
    BufferCapacityExceeded { requested: usize, limit: usize },
}

impl DaqError {
    /// Wrap an adapter failure together with the key of the failing channel.
    pub fn instrument(key: impl ToString, err: anyhow::Error) -> Self {
        DaqError::Instrument {
            key: key.to_string(),
            message: format!("{err:#}"),
        }
    }

    /// Category deciding how the orchestrator treats this error.
    pub fn category(&self) -> ErrorCategory {
        match self {
            DaqError::UnknownParameter { .. }
            | DaqError::InvalidRole { .. }
            | DaqError::MissingField { .. }
            | DaqError::InvalidParameter { .. }
            | DaqError::InvalidBreakCondition { .. }
            | DaqError::SweepLengthMismatch { .. }
            | DaqError::OverdeterminedBufferSettings { .. }
            | DaqError::UnderdeterminedBufferSettings { .. }
            | DaqError::DurationMismatch { .. }
            | DaqError::InvalidBufferSetting(_)
            | DaqError::UnmappedParameter { .. }
            | DaqError::Configuration(_)
            | DaqError::Figment(_)
            | DaqError::Yaml(_)
            | DaqError::Json(_)
            | DaqError::Io(_) => ErrorCategory::Configuration,
            DaqError::LimitViolation { .. }
            | DaqError::CompensationLimitExceeded { .. }
            | DaqError::LockedParameter { .. } => ErrorCategory::Safety,
            DaqError::BreakConditionTriggered { .. }
            | DaqError::AcquisitionTimeout { .. }
            | DaqError::AcquisitionCountMismatch { .. }
            | DaqError::Instrument { .. }
            | DaqError::Storage(_)
            | DaqError::Cancelled { .. }
            | DaqError::InvalidState { .. } => ErrorCategory::Runtime,
            DaqError::UnsupportedInBufferedMode { .. }
            | DaqError::MissingRampCapability { .. }
            | DaqError::NotSettable { .. }
            | DaqError::BufferCapacityExceeded { .. } => ErrorCategory::Capability,
        }
    }
}

impl From<figment::Error> for DaqError {
    fn from(err: figment::Error) -> Self {
        DaqError::Figment(Box::new(err))
    }
}
