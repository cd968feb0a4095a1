//! Ramping parameters to a target instead of jumping.
//!
//! Channels registered as [`Rampable`](super::capabilities::Rampable) use
//! their hardware ramp. Settable channels without one are either set
//! directly or, with `ramp.software = true`, stepped through intermediate
//! setpoints:
//!
//! ```text
//! rate' = max(rate, |target - current| / max_time)
//! n     = floor(|target - current| / (rate' * interval)) + 2
//! ```

use tokio::time::sleep;

use crate::config::RampSettings;
use crate::error::{AppResult, DaqError};
use crate::experiment::sweep::linear_setpoints;
use crate::hardware::capabilities::RampSpeed;
use crate::hardware::registry::Channel;
use crate::parameter::{ParameterKey, Value};

/// Intermediate setpoints of a software ramp, including both ends.
pub fn ramp_setpoints(current: f64, target: f64, settings: &RampSettings) -> Vec<f64> {
    let distance = (target - current).abs();
    if distance == 0.0 {
        return vec![target];
    }
    let rate = settings.rate.max(distance / settings.max_time_secs);
    let num_points = (distance / (rate * settings.setpoint_interval_secs)).floor() as usize + 2;
    linear_setpoints(current, target, num_points)
}

/// Hardware ramp speed that respects the rate and the time bound.
pub fn hardware_speed(current: f64, target: f64, settings: &RampSettings) -> AppResult<RampSpeed> {
    let distance = (target - current).abs();
    if distance / settings.rate > settings.max_time_secs {
        Ok(RampSpeed::Time(settings.max_time()?))
    } else {
        Ok(RampSpeed::Rate(settings.rate))
    }
}

/// Bring `channel` to `target`.
///
/// Floats go through the hardware ramp if there is one, through a software
/// ramp if enabled, or are set directly. Other values are always set
/// directly. A channel already at the target is left alone.
pub async fn ramp_or_set(
    key: &ParameterKey,
    channel: &Channel,
    target: &Value,
    settings: &RampSettings,
) -> AppResult<()> {
    if !channel.can_set() {
        return Err(DaqError::NotSettable { key: key.clone() });
    }

    let Value::Float(target) = *target else {
        return channel
            .set(target.clone())
            .await
            .map_err(|e| DaqError::instrument(key, e));
    };

    let current = channel
        .get()
        .await
        .map_err(|e| DaqError::instrument(key, e))?
        .as_f64();
    let Some(current) = current else {
        return channel
            .set(Value::Float(target))
            .await
            .map_err(|e| DaqError::instrument(key, e));
    };
    if current == target {
        return Ok(());
    }

    if channel.can_ramp() {
        tracing::debug!(%key, current, target, "Hardware ramp");
        channel
            .ramp(target, hardware_speed(current, target, settings)?)
            .await
            .map_err(|e| DaqError::instrument(key, e))
    } else if settings.software {
        let interval = settings.setpoint_interval()?;
        let points = ramp_setpoints(current, target, settings);
        tracing::debug!(%key, current, target, steps = points.len(), "Software ramp");
        for (i, point) in points.iter().enumerate().skip(1) {
            channel
                .set(Value::Float(*point))
                .await
                .map_err(|e| DaqError::instrument(key, e))?;
            if i + 1 < points.len() {
                sleep(interval).await;
            }
        }
        Ok(())
    } else {
        channel
            .set(Value::Float(target))
            .await
            .map_err(|e| DaqError::instrument(key, e))
    }
}
