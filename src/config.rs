//! Run settings loaded with Figment.
//!
//! Settings are layered:
//! 1. built-in defaults ([`Settings::default`])
//! 2. a TOML file (`config/transport_daq.toml` unless another path is given)
//! 3. environment variables prefixed with `TRANSPORT_DAQ_`, nested keys
//!    separated by a double underscore
//!
//! The resulting [`Settings`] value is passed explicitly to the components
//! that need it; nothing here is global.
//!
//! # Example
//! ```no_run
//! use transport_daq::config::Settings;
//!
//! // TRANSPORT_DAQ_RAMP__RATE=0.1 overrides [ramp] rate
//! let settings = Settings::load_from("config/transport_daq.toml")?;
//! settings.validate().map_err(anyhow::Error::msg)?;
//! # Ok::<(), anyhow::Error>(())
//! ```

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{AppResult, DaqError};
use crate::experiment::sweep::SweepMode;

/// Default location of the settings file.
pub const DEFAULT_CONFIG_PATH: &str = "config/transport_daq.toml";

/// Settings for ramping parameters to start values and back.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RampSettings {
    /// Ramp rate in parameter units per second
    pub rate: f64,
    /// Upper bound on the time a single ramp may take, in seconds
    pub max_time_secs: f64,
    /// Interval between intermediate sets of a software ramp, in seconds
    pub setpoint_interval_secs: f64,
    /// Step settable channels without hardware ramp instead of jumping
    pub software: bool,
}

impl Default for RampSettings {
    fn default() -> Self {
        Self {
            rate: 0.3,
            max_time_secs: 5.0,
            setpoint_interval_secs: 0.1,
            software: false,
        }
    }
}

impl RampSettings {
    /// Interval between software ramp steps.
    pub fn setpoint_interval(&self) -> AppResult<Duration> {
        seconds("ramp.setpoint_interval_secs", self.setpoint_interval_secs)
    }

    /// Time bound for one ramp.
    pub fn max_time(&self) -> AppResult<Duration> {
        seconds("ramp.max_time_secs", self.max_time_secs)
    }
}

/// Unswept recording of the gettables at a fixed interval.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimetraceSettings {
    /// Total recording time in seconds
    pub duration_secs: f64,
    /// Wait between two readings in seconds
    pub timestep_secs: f64,
}

impl Default for TimetraceSettings {
    fn default() -> Self {
        Self {
            duration_secs: 300.0,
            timestep_secs: 1.0,
        }
    }
}

impl TimetraceSettings {
    /// Total recording time.
    pub fn duration(&self) -> AppResult<Duration> {
        seconds("timetrace.duration_secs", self.duration_secs)
    }

    /// Wait between two readings.
    pub fn timestep(&self) -> AppResult<Duration> {
        seconds("timetrace.timestep_secs", self.timestep_secs)
    }
}

/// Seconds as a [`Duration`], rejecting negative, NaN and overflowing values.
pub(crate) fn seconds(field: &str, secs: f64) -> AppResult<Duration> {
    Duration::try_from_secs_f64(secs)
        .map_err(|e| DaqError::Configuration(format!("{field}={secs}: {e}")))
}

/// Top-level run settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Default sweep geometry
    pub sweep_mode: SweepMode,
    /// Settle time after initialization, in seconds
    pub wait_time_secs: f64,
    /// Retrace visited setpoints when a break condition triggers
    pub backsweep_after_break: bool,
    /// Dwell after a break condition triggers, before the retrace, in seconds
    pub wait_after_break_secs: f64,
    /// Record held swept parameters during sequential sub-plans
    pub log_idle_params: bool,
    /// Upper bound on a buffered burst drain, in seconds
    pub acquisition_timeout_secs: f64,
    /// Poll interval while draining a buffer, in milliseconds
    pub drain_poll_interval_ms: u64,
    /// Grid sizes above this produce a warning
    pub grid_warning_threshold: usize,
    /// Poll interval of the live monitor, in milliseconds
    pub monitor_interval_ms: u64,
    /// Ramp behavior during initialize/reset
    pub ramp: RampSettings,
    /// Timetrace duration and interval
    pub timetrace: TimetraceSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            sweep_mode: SweepMode::Grid,
            wait_time_secs: 0.0,
            backsweep_after_break: false,
            wait_after_break_secs: 0.0,
            log_idle_params: true,
            acquisition_timeout_secs: 30.0,
            drain_poll_interval_ms: 10,
            grid_warning_threshold: 100_000,
            monitor_interval_ms: 500,
            ramp: RampSettings::default(),
            timetrace: TimetraceSettings::default(),
        }
    }
}

impl Settings {
    /// Load from [`DEFAULT_CONFIG_PATH`] and the environment.
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load from a specific TOML file and the environment.
    ///
    /// A missing file is not an error; defaults and environment still apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let settings = Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("TRANSPORT_DAQ_").split("__"))
            .extract()?;
        Ok(settings)
    }

    /// Serialize to TOML.
    pub fn to_toml(&self) -> AppResult<String> {
        toml::to_string_pretty(self).map_err(|e| DaqError::Configuration(e.to_string()))
    }

    /// Validate settings after loading.
    pub fn validate(&self) -> Result<(), String> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.log_level.as_str()) {
            return Err(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.log_level,
                valid_levels.join(", ")
            ));
        }
        if !(self.ramp.rate > 0.0 && self.ramp.rate.is_finite()) {
            return Err(format!("ramp.rate must be positive, got {}", self.ramp.rate));
        }
        if !(self.ramp.max_time_secs > 0.0 && self.ramp.max_time_secs.is_finite()) {
            return Err(format!(
                "ramp.max_time_secs must be positive, got {}",
                self.ramp.max_time_secs
            ));
        }
        if !(self.ramp.setpoint_interval_secs > 0.0 && self.ramp.setpoint_interval_secs.is_finite()) {
            return Err(format!(
                "ramp.setpoint_interval_secs must be positive, got {}",
                self.ramp.setpoint_interval_secs
            ));
        }
        if !(self.wait_time_secs >= 0.0 && self.wait_time_secs.is_finite()) {
            return Err(format!(
                "wait_time_secs must be non-negative, got {}",
                self.wait_time_secs
            ));
        }
        if !(self.acquisition_timeout_secs > 0.0 && self.acquisition_timeout_secs.is_finite()) {
            return Err(format!(
                "acquisition_timeout_secs must be positive, got {}",
                self.acquisition_timeout_secs
            ));
        }
        if !(self.wait_after_break_secs >= 0.0 && self.wait_after_break_secs.is_finite()) {
            return Err(format!(
                "wait_after_break_secs must be non-negative, got {}",
                self.wait_after_break_secs
            ));
        }
        if !(self.timetrace.duration_secs > 0.0 && self.timetrace.duration_secs.is_finite()) {
            return Err(format!(
                "timetrace.duration_secs must be positive, got {}",
                self.timetrace.duration_secs
            ));
        }
        if !(self.timetrace.timestep_secs > 0.0 && self.timetrace.timestep_secs.is_finite()) {
            return Err(format!(
                "timetrace.timestep_secs must be positive, got {}",
                self.timetrace.timestep_secs
            ));
        }
        if self.drain_poll_interval_ms == 0 {
            return Err("drain_poll_interval_ms must be at least 1".to_string());
        }
        if self.monitor_interval_ms == 0 {
            return Err("monitor_interval_ms must be at least 1".to_string());
        }
        Ok(())
    }

    /// [`validate`](Self::validate) as a crate error.
    pub fn check(&self) -> AppResult<()> {
        self.validate()
            .map_err(|e| DaqError::Configuration(format!("invalid settings: {e}")))
    }

    /// Settle time after initialization.
    pub fn wait_time(&self) -> AppResult<Duration> {
        seconds("wait_time_secs", self.wait_time_secs)
    }

    /// Dwell between a triggered break condition and the retrace.
    pub fn wait_after_break(&self) -> AppResult<Duration> {
        seconds("wait_after_break_secs", self.wait_after_break_secs)
    }

    /// Drain timeout for buffered acquisition.
    pub fn acquisition_timeout(&self) -> AppResult<Duration> {
        seconds("acquisition_timeout_secs", self.acquisition_timeout_secs)
    }

    /// Poll interval while waiting for a burst to complete.
    pub fn drain_poll_interval(&self) -> Duration {
        Duration::from_millis(self.drain_poll_interval_ms)
    }

    /// Poll interval of the live monitor.
    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.ramp.rate, 0.3);
        assert_eq!(settings.grid_warning_threshold, 100_000);
    }

    #[test]
    #[serial]
    fn missing_file_falls_back_to_defaults() {
        let settings = Settings::load_from("does/not/exist.toml").unwrap();
        assert_eq!(settings, Settings::default());
    }

    #[test]
    #[serial]
    fn toml_file_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "log_level = \"debug\"\nsweep_mode = \"sequential\"\nbacksweep_after_break = true\n\n[ramp]\nrate = 0.05\n"
        )
        .unwrap();

        let settings = Settings::load_from(file.path()).unwrap();
        assert_eq!(settings.log_level, "debug");
        assert_eq!(settings.sweep_mode, SweepMode::Sequential);
        assert!(settings.backsweep_after_break);
        assert_eq!(settings.ramp.rate, 0.05);
        // untouched nested fields keep their defaults
        assert_eq!(settings.ramp.max_time_secs, 5.0);
    }

    #[test]
    #[serial]
    fn environment_overrides_file() {
        std::env::set_var("TRANSPORT_DAQ_RAMP__RATE", "0.7");
        std::env::set_var("TRANSPORT_DAQ_WAIT_TIME_SECS", "1.5");
        let settings = Settings::load_from("does/not/exist.toml");
        std::env::remove_var("TRANSPORT_DAQ_RAMP__RATE");
        std::env::remove_var("TRANSPORT_DAQ_WAIT_TIME_SECS");

        let settings = settings.unwrap();
        assert_eq!(settings.ramp.rate, 0.7);
        assert_eq!(settings.wait_time().unwrap(), Duration::from_millis(1500));
    }

    #[test]
    fn invalid_values_are_rejected() {
        let mut settings = Settings::default();
        settings.log_level = "loud".into();
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.ramp.rate = 0.0;
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.acquisition_timeout_secs = -1.0;
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.timetrace.timestep_secs = 0.0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn out_of_range_seconds_are_errors() {
        let mut settings = Settings::default();
        settings.wait_time_secs = -1.0;
        assert!(matches!(settings.wait_time(), Err(DaqError::Configuration(_))));
        assert!(matches!(settings.check(), Err(DaqError::Configuration(_))));

        settings.acquisition_timeout_secs = f64::NAN;
        assert!(settings.acquisition_timeout().is_err());

        settings.ramp.max_time_secs = f64::MAX;
        assert!(settings.ramp.max_time().is_err());
    }

    #[test]
    fn toml_round_trip_keeps_values() {
        let mut settings = Settings::default();
        settings.backsweep_after_break = true;
        let text = settings.to_toml().unwrap();
        let parsed: Settings = toml::from_str(&text).unwrap();
        assert_eq!(parsed, settings);
    }
}
