//! Measurement records emitted by the orchestrator.

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Serialize, Serializer};
use uuid::Uuid;

use crate::experiment::plan::SweepDirection;
use crate::parameter::{ParameterKey, Value};

/// One step (unbuffered) or one sample (buffered) of a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MeasurementRecord {
    /// Run this record belongs to
    pub run_id: Uuid,
    /// Name of the plan that produced it
    pub plan: String,
    /// Build index of the step, or sample index in a burst
    pub step: usize,
    /// Forward sweep or backsweep
    pub direction: SweepDirection,
    /// Time the readings were taken
    pub timestamp: DateTime<Utc>,
    /// Commanded targets at this step
    #[serde(serialize_with = "by_name")]
    pub setpoints: IndexMap<ParameterKey, Value>,
    /// Recorded readings
    #[serde(serialize_with = "by_name")]
    pub readings: IndexMap<ParameterKey, Value>,
}

impl MeasurementRecord {
    /// Reading of `key`, if it was recorded.
    pub fn reading(&self, key: &ParameterKey) -> Option<&Value> {
        self.readings.get(key)
    }

    /// Setpoint of `key`, if it was commanded at this step.
    pub fn setpoint(&self, key: &ParameterKey) -> Option<&Value> {
        self.setpoints.get(key)
    }
}

// JSON maps need string keys
fn by_name<S: Serializer>(map: &IndexMap<ParameterKey, Value>, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_map(map.iter().map(|(k, v)| (k.to_string(), v)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_keys_as_dotted_names() {
        let record = MeasurementRecord {
            run_id: Uuid::nil(),
            plan: "gate.voltage".into(),
            step: 2,
            direction: SweepDirection::Backward,
            timestamp: Utc::now(),
            setpoints: IndexMap::from([(ParameterKey::new("gate", "voltage"), Value::Float(0.5))]),
            readings: IndexMap::from([(ParameterKey::new("ohmic", "current"), Value::Float(1e-9))]),
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["setpoints"]["gate.voltage"], 0.5);
        assert_eq!(json["readings"]["ohmic.current"], 1e-9);
        assert_eq!(json["direction"], "backward");
    }
}
