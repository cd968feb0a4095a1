//! Shared fixtures for the integration tests.
#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use transport_daq::config::Settings;
use transport_daq::data::{DataSink, MeasurementRecord, MemorySink};
use transport_daq::error::AppResult;
use transport_daq::experiment::{CancelHandle, MeasurementOrchestrator};
use transport_daq::hardware::mock::{MockDac, MockDmm};
use transport_daq::hardware::ChannelRegistry;
use transport_daq::parameter::{ParameterKey, ParameterModel};

/// One gate swept over three points, one current recorded with a threshold.
pub const GATE_SWEEP: &str = "
gate:
  voltage: { type: dynamic, setpoints: [0.0, 0.5, 1.0] }
ohmic:
  current: { type: gettable, break_conditions: ['val > 0.95'] }
";

pub fn gate() -> ParameterKey {
    ParameterKey::new("gate", "voltage")
}

pub fn current() -> ParameterKey {
    ParameterKey::new("ohmic", "current")
}

/// Orchestrator for [`GATE_SWEEP`]-shaped models: `gate.voltage` on a DAC,
/// `ohmic.current` on `dmm`.
pub struct Bench {
    pub orchestrator: MeasurementOrchestrator,
    pub gate: MockDac,
    pub dmm: MockDmm,
    pub sink: MemorySink,
}

impl Bench {
    pub fn new(yaml: &str, dmm: MockDmm, settings: Settings) -> Self {
        let model = ParameterModel::from_yaml_str(yaml).unwrap();
        let gate_dac = MockDac::new(0.0);
        let mut registry = ChannelRegistry::new();
        registry.register_rampable(gate(), Arc::new(gate_dac.clone()));
        registry.register_readable(current(), Arc::new(dmm.clone()));
        let sink = MemorySink::new();
        let orchestrator = MeasurementOrchestrator::new(model, registry, settings, sink.clone());
        Self {
            orchestrator,
            gate: gate_dac,
            dmm,
            sink,
        }
    }
}

/// Memory sink that requests cancellation after `after` records.
#[derive(Clone)]
pub struct CancellingSink {
    pub inner: MemorySink,
    pub handle: Arc<Mutex<Option<CancelHandle>>>,
    pub after: usize,
}

impl CancellingSink {
    pub fn new(after: usize) -> Self {
        Self {
            inner: MemorySink::new(),
            handle: Arc::new(Mutex::new(None)),
            after,
        }
    }

    pub fn arm(&self, handle: CancelHandle) {
        *self.handle.lock().unwrap() = Some(handle);
    }
}

#[async_trait]
impl DataSink for CancellingSink {
    async fn write(&mut self, record: &MeasurementRecord) -> AppResult<()> {
        self.inner.write(record).await?;
        if self.inner.len().await >= self.after {
            if let Some(handle) = self.handle.lock().unwrap().as_ref() {
                handle.cancel();
            }
        }
        Ok(())
    }
}
