//! The shipped settings and demo files must stay loadable.

use std::path::PathBuf;

use serial_test::serial;
use transport_daq::buffer::{BufferSettingsResolver, RawBufferSettings, TriggerMode};
use transport_daq::config::{Settings, DEFAULT_CONFIG_PATH};
use transport_daq::experiment::{SweepBuilder, SweepMode};
use transport_daq::parameter::ParameterModel;

fn repo_file(relative: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join(relative)
}

#[test]
#[serial]
fn test_default_settings_file_is_valid() {
    let settings = Settings::load_from(repo_file(DEFAULT_CONFIG_PATH)).unwrap();
    assert!(settings.validate().is_ok());
    assert_eq!(settings.sweep_mode, SweepMode::Grid);
    assert_eq!(settings.wait_time_secs, 0.5);
}

#[test]
fn test_gate_sweep_demo_builds_in_every_mode() {
    let model = ParameterModel::load(repo_file("demos/gate_sweep.yaml")).unwrap();
    assert_eq!(model.dynamic().len(), 2);
    assert_eq!(model.compensating().len(), 1);

    let builder = SweepBuilder::new(&model);
    assert_eq!(builder.build(SweepMode::Grid).unwrap()[0].len(), 63);
    assert_eq!(builder.build(SweepMode::Sequential).unwrap().len(), 2);
    // 21 plunger points against 3 barrier points
    assert!(builder.build(SweepMode::Parallel).is_err());
}

#[test]
fn test_buffer_demo_resolves() {
    let text = std::fs::read_to_string(repo_file("demos/buffer.yaml")).unwrap();
    let raw: RawBufferSettings = serde_yaml::from_str(&text).unwrap();
    let config = BufferSettingsResolver::default().resolve(&raw, 16_384).unwrap();
    assert_eq!(config.num_points, 500);
    assert_eq!(config.trigger_mode, TriggerMode::Edge);
    assert_eq!(config.threshold, Some(0.1));
}
