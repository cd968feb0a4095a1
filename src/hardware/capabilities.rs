//! Instrument, buffer and trigger capabilities.
//!
//! Instead of probing instrument objects for attributes at runtime, every
//! channel is registered with the capability it actually has:
//!
//! - a voltmeter channel implements [`Readable`]
//! - a DC source channel implements [`Settable`] (and therefore `Readable`)
//! - a DAC with a hardware ramp generator implements [`Rampable`]
//!
//! Buffered instruments additionally expose a [`BufferAdapter`], and the
//! device whose output starts a burst exposes a [`TriggerAdapter`].
//!
//! # Design Philosophy
//!
//! Each capability trait:
//! - Is async (uses #[async_trait])
//! - Is thread-safe (requires Send + Sync)
//! - Uses anyhow::Result for errors
//! - Focuses on ONE thing
//!
//! # Example
//!
//! ```rust,ignore
//! struct DacChannel { value: RwLock<f64> }
//!
//! #[async_trait]
//! impl Readable for DacChannel {
//!     async fn get(&self) -> Result<Value> {
//!         Ok(Value::Float(*self.value.read().await))
//!     }
//! }
//!
//! #[async_trait]
//! impl Settable for DacChannel {
//!     async fn set(&self, value: Value) -> Result<()> {
//!         let Some(v) = value.as_f64() else { anyhow::bail!("DAC accepts floats only") };
//!         *self.value.write().await = v;
//!         Ok(())
//!     }
//! }
//! ```

use anyhow::Result;
use async_trait::async_trait;
use indexmap::IndexMap;
use std::time::Duration;

use crate::buffer::{BufferConfig, TriggerMode};
use crate::parameter::{ParameterKey, Value};

/// Capability: read a value.
#[async_trait]
pub trait Readable: Send + Sync {
    /// Read the current value.
    async fn get(&self) -> Result<Value>;
}

/// Capability: command a value.
#[async_trait]
pub trait Settable: Readable {
    /// Set the output. Returns once the instrument accepted the value.
    async fn set(&self, value: Value) -> Result<()>;
}

/// How fast a hardware ramp should move.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RampSpeed {
    /// Units per second
    Rate(f64),
    /// Total time of the ramp
    Time(Duration),
}

/// Capability: hardware ramp to a target.
///
/// # Contract
/// - `ramp` returns when the target is reached
/// - the output changes continuously (or in instrument-sized steps) and
///   never jumps
#[async_trait]
pub trait Rampable: Settable {
    /// Ramp from the current output to `target`.
    async fn ramp(&self, target: f64, speed: RampSpeed) -> Result<()>;
}

/// One acquired sample: a reading per subscribed parameter.
pub type Sample = IndexMap<ParameterKey, Value>;

/// Capability: hardware-side sample buffer.
///
/// # Contract
/// - `configure` is called before `subscribe` and `start`
/// - `is_finished` turns true once the burst of `num_points` samples is
///   complete
/// - `read` returns the samples in acquisition order
#[async_trait]
pub trait BufferAdapter: Send + Sync {
    /// Largest `num_points` the buffer can hold.
    fn capacity_limit(&self) -> usize;

    /// Apply the resolved buffer configuration.
    async fn configure(&self, config: &BufferConfig) -> Result<()>;

    /// Record these parameters.
    async fn subscribe(&self, keys: &[ParameterKey]) -> Result<()>;

    /// Arm the buffer; acquisition starts on the trigger.
    async fn start(&self) -> Result<()>;

    /// Stop acquisition.
    async fn stop(&self) -> Result<()>;

    /// True once the burst is complete.
    async fn is_finished(&self) -> Result<bool>;

    /// Bulk read of the acquired samples.
    async fn read(&self) -> Result<Vec<Sample>>;
}

/// Capability: select the trigger input of a buffered instrument.
#[async_trait]
pub trait TriggerAdapter: Send + Sync {
    /// Trigger inputs in the order the instrument lists them.
    fn available_trigger_inputs(&self) -> Vec<String>;

    /// Select a trigger input (`None` for free running). Returns the trigger
    /// mode the instrument switched to if it had to change it.
    async fn set_trigger(&self, input: Option<&str>) -> Result<Option<TriggerMode>>;
}
