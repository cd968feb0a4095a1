//! Mock Hardware Implementations
//!
//! Simulated instruments for tests and dry runs. All mocks use async-safe
//! operations (tokio locks, `tokio::time::sleep`) and keep a history of what
//! they were asked to do so tests can assert on it.
//!
//! # Available Mocks
//!
//! - `MockDac` - settable channel with hardware ramp
//! - `MockSource` - settable channel without ramp
//! - `MockDmm` - read-only channel returning constant or scripted readings
//! - `MockBuffer` - buffered acquisition with configurable failure modes
//! - `MockTrigger` - trigger input selection, optionally forcing a mode

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::buffer::{BufferConfig, TriggerMode};
use crate::hardware::capabilities::{
    BufferAdapter, RampSpeed, Rampable, Readable, Sample, Settable, TriggerAdapter,
};
use crate::parameter::{ParameterKey, Value};

// =============================================================================
// MockDac - settable channel with ramp
// =============================================================================

/// Command received by a mock output channel.
#[derive(Debug, Clone, PartialEq)]
pub enum MockCommand {
    /// Direct set
    Set(Value),
    /// Hardware ramp
    Ramp {
        /// Target value
        target: f64,
        /// Requested speed
        speed: RampSpeed,
    },
}

/// Mock DAC channel with a hardware ramp.
///
/// Ramps complete instantly and are recorded in the command history.
///
/// # Example
///
/// ```rust,ignore
/// let dac = MockDac::new(0.0);
/// dac.ramp(0.5, RampSpeed::Rate(0.1)).await?;
/// assert_eq!(dac.value().await, Value::Float(0.5));
/// ```
#[derive(Debug, Clone)]
pub struct MockDac {
    value: Arc<RwLock<Value>>,
    history: Arc<RwLock<Vec<MockCommand>>>,
}

impl MockDac {
    /// Create a channel at `initial`.
    pub fn new(initial: f64) -> Self {
        Self {
            value: Arc::new(RwLock::new(Value::Float(initial))),
            history: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Current output.
    pub async fn value(&self) -> Value {
        self.value.read().await.clone()
    }

    /// All commands received so far.
    pub async fn history(&self) -> Vec<MockCommand> {
        self.history.read().await.clone()
    }

    /// Number of direct sets.
    pub async fn set_count(&self) -> usize {
        self.history
            .read()
            .await
            .iter()
            .filter(|c| matches!(c, MockCommand::Set(_)))
            .count()
    }

    /// Number of commands of any kind.
    pub async fn command_count(&self) -> usize {
        self.history.read().await.len()
    }
}

impl Default for MockDac {
    fn default() -> Self {
        Self::new(0.0)
    }
}

#[async_trait]
impl Readable for MockDac {
    async fn get(&self) -> Result<Value> {
        Ok(self.value.read().await.clone())
    }
}

#[async_trait]
impl Settable for MockDac {
    async fn set(&self, value: Value) -> Result<()> {
        self.history.write().await.push(MockCommand::Set(value.clone()));
        *self.value.write().await = value;
        Ok(())
    }
}

#[async_trait]
impl Rampable for MockDac {
    async fn ramp(&self, target: f64, speed: RampSpeed) -> Result<()> {
        self.history
            .write()
            .await
            .push(MockCommand::Ramp { target, speed });
        *self.value.write().await = Value::Float(target);
        Ok(())
    }
}

// =============================================================================
// MockSource - settable channel without ramp
// =============================================================================

/// Mock source channel without hardware ramp.
#[derive(Debug, Clone, Default)]
pub struct MockSource {
    inner: MockDac,
}

impl MockSource {
    /// Create a channel at `initial`.
    pub fn new(initial: f64) -> Self {
        Self {
            inner: MockDac::new(initial),
        }
    }

    /// Current output.
    pub async fn value(&self) -> Value {
        self.inner.value().await
    }

    /// All commands received so far.
    pub async fn history(&self) -> Vec<MockCommand> {
        self.inner.history().await
    }
}

#[async_trait]
impl Readable for MockSource {
    async fn get(&self) -> Result<Value> {
        self.inner.get().await
    }
}

#[async_trait]
impl Settable for MockSource {
    async fn set(&self, value: Value) -> Result<()> {
        self.inner.set(value).await
    }
}

// =============================================================================
// MockDmm - read-only channel
// =============================================================================

/// Mock multimeter.
///
/// Scripted readings are returned in order, one per `get`; the last reading
/// repeats once the script is exhausted.
#[derive(Debug, Clone)]
pub struct MockDmm {
    readings: Arc<Vec<f64>>,
    reads: Arc<AtomicUsize>,
}

impl MockDmm {
    /// Always return `reading`.
    pub fn constant(reading: f64) -> Self {
        Self::scripted(vec![reading])
    }

    /// Return `readings` in order.
    pub fn scripted(readings: Vec<f64>) -> Self {
        Self {
            readings: Arc::new(readings),
            reads: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Number of reads so far.
    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Readable for MockDmm {
    async fn get(&self) -> Result<Value> {
        let n = self.reads.fetch_add(1, Ordering::SeqCst);
        let reading = self
            .readings
            .get(n)
            .or_else(|| self.readings.last())
            .copied()
            .ok_or_else(|| anyhow!("MockDmm has no readings"))?;
        Ok(Value::Float(reading))
    }
}

// =============================================================================
// MockBuffer - buffered acquisition
// =============================================================================

/// How the mock buffer misbehaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MockBufferBehavior {
    /// Burst completes immediately with `num_points` samples
    #[default]
    Normal,
    /// Burst never completes
    NeverFinishes,
    /// Burst completes with this many samples missing
    DropSamples(usize),
}

#[derive(Debug, Default)]
struct MockBufferState {
    config: Option<BufferConfig>,
    subscribed: Vec<ParameterKey>,
    running: bool,
    starts: usize,
    stops: usize,
}

/// Mock buffered instrument.
///
/// Sample `k` of subscribed parameter `j` reads `k + 1000 * j`, so tests can
/// tell samples and parameters apart.
#[derive(Debug, Clone)]
pub struct MockBuffer {
    capacity: usize,
    behavior: MockBufferBehavior,
    state: Arc<RwLock<MockBufferState>>,
}

impl MockBuffer {
    /// Buffer holding up to `capacity` samples.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            behavior: MockBufferBehavior::Normal,
            state: Arc::new(RwLock::new(MockBufferState::default())),
        }
    }

    /// Change the failure mode.
    pub fn with_behavior(mut self, behavior: MockBufferBehavior) -> Self {
        self.behavior = behavior;
        self
    }

    /// Configuration applied by the last `configure`.
    pub async fn config(&self) -> Option<BufferConfig> {
        self.state.read().await.config.clone()
    }

    /// Subscribed parameters.
    pub async fn subscribed(&self) -> Vec<ParameterKey> {
        self.state.read().await.subscribed.clone()
    }

    /// `(starts, stops)` seen so far.
    pub async fn start_stop_counts(&self) -> (usize, usize) {
        let state = self.state.read().await;
        (state.starts, state.stops)
    }
}

#[async_trait]
impl BufferAdapter for MockBuffer {
    fn capacity_limit(&self) -> usize {
        self.capacity
    }

    async fn configure(&self, config: &BufferConfig) -> Result<()> {
        if config.num_points > self.capacity {
            bail!(
                "MockBuffer: {} points exceed capacity {}",
                config.num_points,
                self.capacity
            );
        }
        self.state.write().await.config = Some(config.clone());
        Ok(())
    }

    async fn subscribe(&self, keys: &[ParameterKey]) -> Result<()> {
        let mut state = self.state.write().await;
        for key in keys {
            if !state.subscribed.contains(key) {
                state.subscribed.push(key.clone());
            }
        }
        Ok(())
    }

    async fn start(&self) -> Result<()> {
        let mut state = self.state.write().await;
        if state.config.is_none() {
            bail!("MockBuffer: start before configure");
        }
        state.running = true;
        state.starts += 1;
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let mut state = self.state.write().await;
        state.running = false;
        state.stops += 1;
        Ok(())
    }

    async fn is_finished(&self) -> Result<bool> {
        let state = self.state.read().await;
        Ok(state.running && self.behavior != MockBufferBehavior::NeverFinishes)
    }

    async fn read(&self) -> Result<Vec<Sample>> {
        let state = self.state.read().await;
        let config = state
            .config
            .as_ref()
            .ok_or_else(|| anyhow!("MockBuffer: read before configure"))?;
        let count = match self.behavior {
            MockBufferBehavior::DropSamples(missing) => config.num_points.saturating_sub(missing),
            _ => config.num_points,
        };
        Ok((0..count)
            .map(|k| {
                state
                    .subscribed
                    .iter()
                    .enumerate()
                    .map(|(j, key)| (key.clone(), Value::Float((k + 1000 * j) as f64)))
                    .collect()
            })
            .collect())
    }
}

// =============================================================================
// MockTrigger - trigger input selection
// =============================================================================

/// Mock trigger input selector.
#[derive(Debug, Clone)]
pub struct MockTrigger {
    inputs: Vec<String>,
    forced_mode: Option<TriggerMode>,
    selected: Arc<RwLock<Option<String>>>,
}

impl MockTrigger {
    /// Selector offering `inputs`.
    pub fn new(inputs: &[&str]) -> Self {
        Self {
            inputs: inputs.iter().map(|s| s.to_string()).collect(),
            forced_mode: None,
            selected: Arc::new(RwLock::new(None)),
        }
    }

    /// Report `mode` as forced whenever an input is selected.
    pub fn forcing(mut self, mode: TriggerMode) -> Self {
        self.forced_mode = Some(mode);
        self
    }

    /// Currently selected input.
    pub async fn selected(&self) -> Option<String> {
        self.selected.read().await.clone()
    }
}

#[async_trait]
impl TriggerAdapter for MockTrigger {
    fn available_trigger_inputs(&self) -> Vec<String> {
        self.inputs.clone()
    }

    async fn set_trigger(&self, input: Option<&str>) -> Result<Option<TriggerMode>> {
        if let Some(name) = input {
            if !self.inputs.iter().any(|i| i == name) {
                bail!("MockTrigger: unknown trigger input '{name}'");
            }
        }
        *self.selected.write().await = input.map(str::to_string);
        Ok(input.and(self.forced_mode))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dac_records_commands() {
        let dac = MockDac::new(0.0);
        dac.set(Value::Float(0.1)).await.unwrap();
        dac.ramp(0.4, RampSpeed::Rate(0.3)).await.unwrap();
        assert_eq!(dac.value().await, Value::Float(0.4));
        assert_eq!(dac.set_count().await, 1);
        assert_eq!(dac.command_count().await, 2);
    }

    #[tokio::test]
    async fn dmm_repeats_last_scripted_reading() {
        let dmm = MockDmm::scripted(vec![0.5, 1.0]);
        assert_eq!(dmm.get().await.unwrap(), Value::Float(0.5));
        assert_eq!(dmm.get().await.unwrap(), Value::Float(1.0));
        assert_eq!(dmm.get().await.unwrap(), Value::Float(1.0));
        assert_eq!(dmm.read_count(), 3);
    }

    #[tokio::test]
    async fn trigger_rejects_unknown_inputs() {
        let trigger = MockTrigger::new(&["trigger_in_1", "trigger_in_2"]).forcing(TriggerMode::Edge);
        assert!(trigger.set_trigger(Some("aux")).await.is_err());
        assert_eq!(
            trigger.set_trigger(Some("trigger_in_2")).await.unwrap(),
            Some(TriggerMode::Edge)
        );
        assert_eq!(trigger.selected().await.as_deref(), Some("trigger_in_2"));
        assert_eq!(trigger.set_trigger(None).await.unwrap(), None);
    }
}
