//! Integration tests for buffered runs: a hardware ramp across the sweep
//! while a mock buffer samples, with timeouts and trigger handling.

use std::sync::Arc;

use transport_daq::buffer::{BufferConfig, BufferSettingsResolver, RawBufferSettings, TriggerMode};
use transport_daq::config::Settings;
use transport_daq::data::MemorySink;
use transport_daq::experiment::{
    BufferedAcquisition, MeasurementOrchestrator, OrchestratorState, RunMode, SweepBuilder,
};
use transport_daq::hardware::mock::{
    MockBuffer, MockBufferBehavior, MockCommand, MockDac, MockDmm, MockSource, MockTrigger,
};
use transport_daq::hardware::{ChannelRegistry, RampSpeed};
use transport_daq::parameter::{ParameterKey, ParameterModel, Value};
use transport_daq::{DaqError, MeasurementWarning};

const SWEEP: &str = "
gate:
  voltage: { type: dynamic, start: 0.0, stop: 1.0, num_points: 10 }
ohmic:
  current: { type: gettable }
";

fn gate() -> ParameterKey {
    ParameterKey::new("gate", "voltage")
}

fn current() -> ParameterKey {
    ParameterKey::new("ohmic", "current")
}

fn config(num_points: usize) -> BufferConfig {
    let raw = RawBufferSettings {
        num_points: Some(num_points),
        sampling_rate: Some(100.0),
        ..Default::default()
    };
    BufferSettingsResolver::default().resolve(&raw, 4096).unwrap()
}

struct Rig {
    orchestrator: MeasurementOrchestrator,
    dac: MockDac,
    sink: MemorySink,
}

fn rig(yaml: &str, settings: Settings) -> Rig {
    let model = ParameterModel::from_yaml_str(yaml).unwrap();
    let dac = MockDac::new(0.0);
    let mut registry = ChannelRegistry::new();
    registry.register_rampable(gate(), Arc::new(dac.clone()));
    registry.register_readable(current(), Arc::new(MockDmm::constant(0.0)));
    let sink = MemorySink::new();
    let orchestrator = MeasurementOrchestrator::new(model, registry, settings, sink.clone());
    Rig {
        orchestrator,
        dac,
        sink,
    }
}

#[tokio::test]
async fn test_buffered_run_emits_one_record_per_sample() {
    let mut rig = rig(SWEEP, Settings::default());
    let config = config(10);
    let plan = SweepBuilder::new(rig.orchestrator.model())
        .build_buffered(&config)
        .unwrap();
    let buffer = MockBuffer::new(4096);
    let mode = RunMode::Buffered(BufferedAcquisition::new(Arc::new(buffer.clone()), config.clone()));

    let summary = rig.orchestrator.execute(vec![plan], mode).await.unwrap();

    assert_eq!(summary.records, 10);
    let records = rig.sink.records().await;
    assert_eq!(records.len(), 10);
    assert_eq!(records[3].reading(&current()), Some(&Value::Float(3.0)));
    assert_eq!(records[9].setpoint(&gate()), Some(&Value::Float(1.0)));
    assert_eq!(buffer.subscribed().await, vec![current()]);
    assert_eq!(buffer.start_stop_counts().await, (1, 1));
    assert_eq!(buffer.config().await, Some(config.clone()));

    // a single hardware ramp across the burst, then back to the start
    let ramps = rig
        .dac
        .history()
        .await
        .into_iter()
        .filter_map(|c| match c {
            MockCommand::Ramp { target, speed } => Some((target, speed)),
            MockCommand::Set(_) => None,
        })
        .collect::<Vec<_>>();
    assert!(ramps.contains(&(1.0, RampSpeed::Time(config.burst().unwrap()))));
    assert_eq!(rig.dac.value().await, Value::Float(0.0));
    assert_eq!(rig.orchestrator.state(), OrchestratorState::Reset);
}

#[tokio::test]
async fn test_buffered_timetrace_without_swept_parameters() {
    let yaml = "
ohmic:
  current: { type: gettable }
";
    let mut rig = rig(yaml, Settings::default());
    let config = config(10);
    let plan = SweepBuilder::new(rig.orchestrator.model())
        .build_buffered(&config)
        .unwrap();
    assert_eq!(plan.len(), 10);
    assert!(plan.steps().iter().all(|s| s.targets.is_empty()));

    let buffer = MockBuffer::new(4096);
    let mode = RunMode::Buffered(BufferedAcquisition::new(Arc::new(buffer.clone()), config));
    let summary = rig.orchestrator.execute(vec![plan], mode).await.unwrap();

    assert_eq!(summary.records, 10);
    let records = rig.sink.records().await;
    assert_eq!(records.len(), 10);
    assert_eq!(records[4].reading(&current()), Some(&Value::Float(4.0)));
    assert!(records.iter().all(|r| r.setpoints.is_empty()));
    assert_eq!(buffer.start_stop_counts().await, (1, 1));
    assert_eq!(rig.dac.command_count().await, 0);
}

#[tokio::test]
async fn test_timetrace_plan_is_rejected_in_buffered_mode() {
    let mut rig = rig(SWEEP, Settings::default());
    let plan = SweepBuilder::new(rig.orchestrator.model())
        .build_timetrace(&Default::default())
        .unwrap();
    let mode = RunMode::Buffered(BufferedAcquisition::new(Arc::new(MockBuffer::new(4096)), config(10)));

    assert!(matches!(
        rig.orchestrator.execute(vec![plan], mode).await,
        Err(DaqError::Configuration(_))
    ));
    assert_eq!(rig.orchestrator.state(), OrchestratorState::Idle);
}

#[tokio::test]
async fn test_buffer_that_never_finishes_times_out() {
    let settings = Settings {
        acquisition_timeout_secs: 0.05,
        drain_poll_interval_ms: 5,
        ..Settings::default()
    };
    let mut rig = rig(SWEEP, settings);
    let config = config(10);
    let plan = SweepBuilder::new(rig.orchestrator.model())
        .build_buffered(&config)
        .unwrap();
    let buffer = MockBuffer::new(4096).with_behavior(MockBufferBehavior::NeverFinishes);
    let mode = RunMode::Buffered(BufferedAcquisition::new(Arc::new(buffer.clone()), config));

    let err = rig.orchestrator.execute(vec![plan], mode).await.unwrap_err();

    assert!(matches!(err, DaqError::AcquisitionTimeout { .. }));
    // the burst is stopped even though it failed
    assert_eq!(buffer.start_stop_counts().await, (1, 1));
    assert!(rig.sink.is_empty().await);
    assert_eq!(rig.orchestrator.state(), OrchestratorState::Reset);
    assert_eq!(rig.dac.value().await, Value::Float(0.0));
}

#[tokio::test]
async fn test_missing_samples_are_reported() {
    let mut rig = rig(SWEEP, Settings::default());
    let config = config(10);
    let plan = SweepBuilder::new(rig.orchestrator.model())
        .build_buffered(&config)
        .unwrap();
    let buffer = MockBuffer::new(4096).with_behavior(MockBufferBehavior::DropSamples(2));
    let mode = RunMode::Buffered(BufferedAcquisition::new(Arc::new(buffer), config));

    match rig.orchestrator.execute(vec![plan], mode).await {
        Err(DaqError::AcquisitionCountMismatch { expected, actual }) => {
            assert_eq!(expected, 10);
            assert_eq!(actual, 8);
        }
        other => panic!("expected AcquisitionCountMismatch, got {other:?}"),
    }
    assert!(rig.sink.is_empty().await);
}

#[tokio::test]
async fn test_forced_trigger_mode_is_reported_as_a_warning() {
    let mut rig = rig(SWEEP, Settings::default());
    let config = config(10);
    assert_eq!(config.trigger_mode, TriggerMode::Continuous);
    let plan = SweepBuilder::new(rig.orchestrator.model())
        .build_buffered(&config)
        .unwrap();
    let trigger = MockTrigger::new(&["trigger_in_1", "trigger_in_2"]).forcing(TriggerMode::Edge);
    let acquisition = BufferedAcquisition::new(Arc::new(MockBuffer::new(4096)), config)
        .with_trigger(Arc::new(trigger.clone()), Some("trigger_in_2".to_string()));

    let summary = rig
        .orchestrator
        .execute(vec![plan], RunMode::Buffered(acquisition))
        .await
        .unwrap();

    assert!(summary.warnings.contains(&MeasurementWarning::TriggerModeForced {
        requested: TriggerMode::Continuous,
        forced: TriggerMode::Edge,
    }));
    assert_eq!(trigger.selected().await.as_deref(), Some("trigger_in_2"));
}

#[tokio::test]
async fn test_unknown_trigger_input_fails_setup() {
    let mut rig = rig(SWEEP, Settings::default());
    let config = config(10);
    let plan = SweepBuilder::new(rig.orchestrator.model())
        .build_buffered(&config)
        .unwrap();
    let acquisition = BufferedAcquisition::new(Arc::new(MockBuffer::new(4096)), config)
        .with_trigger(Arc::new(MockTrigger::new(&["trigger_in_1"])), Some("aux".to_string()));

    assert!(matches!(
        rig.orchestrator
            .execute(vec![plan], RunMode::Buffered(acquisition))
            .await,
        Err(DaqError::InvalidBufferSetting(_))
    ));
    assert_eq!(rig.dac.command_count().await, 0);
    assert_eq!(rig.orchestrator.state(), OrchestratorState::Idle);
}

#[tokio::test]
async fn test_break_conditions_are_rejected_in_buffered_mode() {
    let yaml = "
gate:
  voltage: { type: dynamic, start: 0.0, stop: 1.0, num_points: 10 }
ohmic:
  current: { type: gettable, break_conditions: ['val > 1e-9'] }
";
    let mut rig = rig(yaml, Settings::default());
    let config = config(10);
    let plan = SweepBuilder::new(rig.orchestrator.model())
        .build_buffered(&config)
        .unwrap();
    let mode = RunMode::Buffered(BufferedAcquisition::new(Arc::new(MockBuffer::new(4096)), config));

    match rig.orchestrator.execute(vec![plan], mode).await {
        Err(DaqError::UnsupportedInBufferedMode { key }) => assert_eq!(key, current()),
        other => panic!("expected UnsupportedInBufferedMode, got {other:?}"),
    }
    assert_eq!(rig.dac.command_count().await, 0);
}

#[tokio::test]
async fn test_swept_channel_without_ramp_fails_setup() {
    let model = ParameterModel::from_yaml_str(SWEEP).unwrap();
    let source = MockSource::new(0.0);
    let mut registry = ChannelRegistry::new();
    registry.register_settable(gate(), Arc::new(source.clone()));
    registry.register_readable(current(), Arc::new(MockDmm::constant(0.0)));
    let mut orchestrator =
        MeasurementOrchestrator::new(model, registry, Settings::default(), MemorySink::new());
    let config = config(10);
    let plan = SweepBuilder::new(orchestrator.model())
        .build_buffered(&config)
        .unwrap();
    let mode = RunMode::Buffered(BufferedAcquisition::new(Arc::new(MockBuffer::new(4096)), config));

    match orchestrator.execute(vec![plan], mode).await {
        Err(DaqError::MissingRampCapability { key }) => assert_eq!(key, gate()),
        other => panic!("expected MissingRampCapability, got {other:?}"),
    }
    assert!(source.history().await.is_empty());
}

#[tokio::test]
async fn test_buffer_capacity_is_checked_before_the_run() {
    let mut rig = rig(SWEEP, Settings::default());
    let config = config(10);
    let plan = SweepBuilder::new(rig.orchestrator.model())
        .build_buffered(&config)
        .unwrap();
    let mode = RunMode::Buffered(BufferedAcquisition::new(Arc::new(MockBuffer::new(8)), config));

    assert!(matches!(
        rig.orchestrator.execute(vec![plan], mode).await,
        Err(DaqError::BufferCapacityExceeded {
            requested: 10,
            limit: 8
        })
    ));
}
