//! Buffered acquisition settings.
//!
//! A buffered burst is described by three coupled quantities:
//!
//! ```text
//! num_points = ceil(sampling_rate * burst_duration)
//! ```
//!
//! Exactly two of them are given and the third is derived. If all three are
//! given they must agree; the resolver never guesses which one to drop.
//! `duration` is the total acquisition time; only single bursts are modeled,
//! so it must equal `burst_duration`.
//!
//! ```rust,ignore
//! use transport_daq::buffer::{BufferSettingsResolver, RawBufferSettings};
//!
//! let raw = RawBufferSettings {
//!     sampling_rate: Some(10.0),
//!     burst_duration: Some(2.0),
//!     ..Default::default()
//! };
//! let config = BufferSettingsResolver::default().resolve(&raw, 4096)?;
//! assert_eq!(config.num_points, 20);
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::error::{AppResult, DaqError};
use crate::parameter::{ParameterModel, SetpointSource};
use crate::warning::MeasurementWarning;

/// Relative tolerance used when comparing timing values.
pub const DEFAULT_TOLERANCE: f64 = 1e-9;

/// Hardware trigger mode of the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerMode {
    /// Free running, no trigger
    #[default]
    Continuous,
    /// Analog edge
    Edge,
    /// Edge with tracking threshold
    TrackingEdge,
    /// Analog pulse
    Pulse,
    /// Pulse with tracking threshold
    TrackingPulse,
    /// Digital trigger input
    Digital,
}

impl fmt::Display for TriggerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TriggerMode::Continuous => "continuous",
            TriggerMode::Edge => "edge",
            TriggerMode::TrackingEdge => "tracking_edge",
            TriggerMode::Pulse => "pulse",
            TriggerMode::TrackingPulse => "tracking_pulse",
            TriggerMode::Digital => "digital",
        };
        f.write_str(name)
    }
}

/// Trigger slope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerPolarity {
    /// Rising
    #[default]
    Positive,
    /// Falling
    Negative,
    /// Either
    Both,
}

/// Partially specified buffer settings as written in a configuration file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RawBufferSettings {
    /// Samples per burst
    pub num_points: Option<usize>,
    /// Samples per second
    pub sampling_rate: Option<f64>,
    /// Seconds per burst
    pub burst_duration: Option<f64>,
    /// Total acquisition time in seconds
    pub duration: Option<f64>,
    /// Seconds between trigger and first sample
    pub delay: Option<f64>,
    /// Trigger mode
    pub trigger_mode: Option<TriggerMode>,
    /// Trigger slope
    #[serde(alias = "trigger_mode_polarity")]
    pub trigger_polarity: Option<TriggerPolarity>,
    /// Trigger level
    #[serde(alias = "trigger_threshold")]
    pub threshold: Option<f64>,
    /// Bursts per measurement (only 1 is supported)
    pub num_bursts: Option<usize>,
}

/// Fully resolved, consistent buffer configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BufferConfig {
    /// Samples per burst
    pub num_points: usize,
    /// Samples per second
    pub sampling_rate: f64,
    /// Seconds per burst
    pub burst_duration: f64,
    /// Total acquisition time (equals `burst_duration`)
    pub duration: f64,
    /// Seconds between trigger and first sample
    pub delay: f64,
    /// Trigger mode
    pub trigger_mode: TriggerMode,
    /// Trigger slope
    pub trigger_polarity: TriggerPolarity,
    /// Trigger level
    pub threshold: Option<f64>,
}

impl BufferConfig {
    /// Burst length as a [`Duration`].
    pub fn burst(&self) -> AppResult<Duration> {
        Duration::try_from_secs_f64(self.burst_duration).map_err(|e| {
            DaqError::InvalidBufferSetting(format!(
                "burst_duration={} is not a valid duration: {e}",
                self.burst_duration
            ))
        })
    }
}

/// Solves the two-of-three timing constraint and checks capacity.
#[derive(Debug, Clone, Copy)]
pub struct BufferSettingsResolver {
    tolerance: f64,
}

impl Default for BufferSettingsResolver {
    fn default() -> Self {
        Self {
            tolerance: DEFAULT_TOLERANCE,
        }
    }
}

impl BufferSettingsResolver {
    /// Resolver with a custom relative tolerance.
    pub fn with_tolerance(tolerance: f64) -> Self {
        Self { tolerance }
    }

    fn close(&self, a: f64, b: f64) -> bool {
        (a - b).abs() <= self.tolerance * a.abs().max(b.abs()).max(1.0)
    }

    /// `ceil` that does not round `20.000000000004` up to 21.
    fn ceil_tolerant(&self, x: f64) -> f64 {
        let nearest = x.round();
        if self.close(x, nearest) {
            nearest
        } else {
            x.ceil()
        }
    }

    /// Resolve `raw` into a consistent [`BufferConfig`] that fits a buffer of
    /// `capacity_limit` samples.
    pub fn resolve(&self, raw: &RawBufferSettings, capacity_limit: usize) -> AppResult<BufferConfig> {
        if let Some(bursts) = raw.num_bursts {
            if bursts != 1 {
                return Err(DaqError::InvalidBufferSetting(format!(
                    "num_bursts={bursts}; only single-burst acquisition is supported"
                )));
            }
        }

        let num_points = raw.num_points;
        if num_points == Some(0) {
            return Err(DaqError::InvalidBufferSetting(
                "num_points must be positive".to_string(),
            ));
        }
        let sampling_rate = positive("sampling_rate", raw.sampling_rate)?;
        let explicit_burst = positive("burst_duration", raw.burst_duration)?;
        let duration = positive("duration", raw.duration)?;
        // without burst_duration, a single burst lasts the whole duration
        let burst_duration = explicit_burst.or(duration);

        let mut given = Vec::new();
        if num_points.is_some() {
            given.push("num_points");
        }
        if sampling_rate.is_some() {
            given.push("sampling_rate");
        }
        if burst_duration.is_some() {
            given.push("burst_duration");
        }

        let (num_points, sampling_rate, burst_duration) = match (num_points, sampling_rate, burst_duration) {
            (Some(n), Some(rate), Some(burst)) => {
                let derived = self.ceil_tolerant(rate * burst);
                if derived != n as f64 {
                    return Err(DaqError::OverdeterminedBufferSettings {
                        num_points: n,
                        sampling_rate: rate,
                        burst_duration: burst,
                    });
                }
                (n, rate, burst)
            }
            (None, Some(rate), Some(burst)) => {
                let derived = self.ceil_tolerant(rate * burst);
                if derived > usize::MAX as f64 {
                    return Err(DaqError::BufferCapacityExceeded {
                        requested: usize::MAX,
                        limit: capacity_limit,
                    });
                }
                (derived as usize, rate, burst)
            }
            (Some(n), Some(rate), None) => (n, rate, n as f64 / rate),
            (Some(n), None, Some(burst)) => (n, n as f64 / burst, burst),
            _ => return Err(DaqError::UnderdeterminedBufferSettings { given }),
        };

        if let (Some(duration), Some(burst)) = (duration, explicit_burst) {
            if !self.close(duration, burst) {
                return Err(DaqError::DurationMismatch {
                    duration,
                    burst_duration: burst,
                });
            }
        }

        let delay = raw.delay.unwrap_or(0.0);
        if !(delay >= 0.0 && delay.is_finite()) {
            return Err(DaqError::InvalidBufferSetting(format!(
                "delay must be non-negative, got {delay}"
            )));
        }
        if let Some(threshold) = raw.threshold {
            if !threshold.is_finite() {
                return Err(DaqError::InvalidBufferSetting(format!(
                    "threshold must be finite, got {threshold}"
                )));
            }
        }

        if num_points > capacity_limit {
            return Err(DaqError::BufferCapacityExceeded {
                requested: num_points,
                limit: capacity_limit,
            });
        }

        let config = BufferConfig {
            num_points,
            sampling_rate,
            burst_duration,
            duration: burst_duration,
            delay,
            trigger_mode: raw.trigger_mode.unwrap_or_default(),
            trigger_polarity: raw.trigger_polarity.unwrap_or_default(),
            threshold: raw.threshold,
        };
        config.burst()?;
        tracing::debug!(
            num_points,
            sampling_rate,
            burst_duration,
            trigger_mode = %config.trigger_mode,
            "Resolved buffer settings"
        );
        Ok(config)
    }

    /// Report where the sweep configuration of `model` deviates from what a
    /// buffered burst of `config` will do. The buffer always wins.
    pub fn reconcile_sweep(&self, model: &ParameterModel, config: &BufferConfig) -> Vec<MeasurementWarning> {
        let mut warnings = Vec::new();
        for spec in model.dynamic() {
            if let Some(requested) = spec.requested_points() {
                if requested != config.num_points {
                    warnings.push(MeasurementWarning::BufferNumPointsOverride {
                        key: spec.key().clone(),
                        requested,
                        resolved: config.num_points,
                    });
                }
            }
            if spec.setpoint_source() == Some(SetpointSource::Explicit) {
                let count = spec.requested_points().unwrap_or(0);
                if count > 2 {
                    warnings.push(MeasurementWarning::IgnoredInteriorSetpoints {
                        key: spec.key().clone(),
                        count: count - 2,
                    });
                }
            }
            if spec.delay() > 0.0 {
                warnings.push(MeasurementWarning::IgnoredDelay {
                    key: spec.key().clone(),
                    delay: spec.delay(),
                });
            }
        }
        warnings
    }
}

fn positive(name: &str, value: Option<f64>) -> AppResult<Option<f64>> {
    match value {
        Some(v) if !(v > 0.0 && v.is_finite()) => Err(DaqError::InvalidBufferSetting(format!(
            "{name} must be positive, got {v}"
        ))),
        other => Ok(other),
    }
}
