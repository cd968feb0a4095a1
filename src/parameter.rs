//! Parameter model: terminals, parameter specs and their roles.
//!
//! A measurement is configured as a nested mapping
//! `terminal -> parameter -> attributes`. [`ParameterModel::build`] normalizes
//! that mapping into typed [`ParameterSpec`]s, each carrying a [`Role`] that
//! decides whether the parameter is held, swept, recorded or derived from
//! other parameters (compensation).
//!
//! # Example
//!
//! ```rust,ignore
//! use transport_daq::parameter::ParameterModel;
//!
//! let model = ParameterModel::from_yaml_str(r#"
//! gate:
//!   voltage: { type: dynamic, start: 0.0, stop: 1.0, num_points: 11 }
//! ohmic:
//!   current: { type: gettable, break_conditions: ["val > 1e-9"] }
//! "#)?;
//!
//! assert_eq!(model.dynamic().len(), 1);
//! ```
//!
//! The model never talks to instruments. Mapping a parameter to a channel is
//! done by [`crate::hardware::registry::ChannelRegistry`], keyed by
//! [`ParameterKey`], so mappings survive [`ParameterModel::update`].

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

use crate::error::{AppResult, DaqError};
use crate::experiment::break_condition::BreakCondition;
use crate::experiment::sweep::linear_setpoints;

/// Physical quantities accepted without the `extensible` flag.
pub const PARAMETER_NAMES: &[&str] = &[
    "voltage",
    "voltage_x_component",
    "voltage_y_component",
    "voltage_offset",
    "current",
    "current_x_component",
    "current_y_component",
    "current_compliance",
    "amplitude",
    "frequency",
    "output_enabled",
    "time_constant",
    "phase",
    "count",
    "aux_voltage_1",
    "aux_voltage_2",
    "temperature",
    "test_parameter",
    "demod0_aux_in_1",
    "demod0_aux_in_2",
];

// =============================================================================
// Keys and values
// =============================================================================

/// Unique `(terminal, parameter)` key across a configuration.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ParameterKey {
    /// Terminal (gate, contact) name
    pub terminal: String,
    /// Physical quantity name
    pub parameter: String,
}

impl ParameterKey {
    /// Create a key from terminal and parameter names.
    pub fn new(terminal: impl Into<String>, parameter: impl Into<String>) -> Self {
        Self {
            terminal: terminal.into(),
            parameter: parameter.into(),
        }
    }
}

impl fmt::Display for ParameterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.terminal, self.parameter)
    }
}

/// A value that can be commanded to or read from an instrument channel.
///
/// Sweeps, compensation, limits and break conditions only operate on
/// [`Value::Float`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    /// Boolean switch (e.g. `output_enabled`)
    Bool(bool),
    /// Numeric quantity
    Float(f64),
    /// Instrument-specific enumerations
    Text(String),
}

impl Value {
    /// Numeric view of the value, if it is a float.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(v) => Some(*v),
            _ => None,
        }
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Text(v) => write!(f, "{v}"),
        }
    }
}

// =============================================================================
// Roles
// =============================================================================

/// How a parameter is driven during a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Drive {
    /// Not commanded
    None,
    /// Held at a constant value
    Held,
    /// Swept across setpoints
    Swept,
    /// Derived from the displacement of other swept parameters
    Compensating,
}

/// Role of a parameter: a drive facet plus an orthogonal "recorded" flag.
///
/// Fields are private so only valid combinations exist: a compensating
/// parameter is never recorded and `none` is never combined with anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Role {
    drive: Drive,
    recorded: bool,
}

impl Role {
    /// Neither set nor recorded.
    pub const NONE: Role = Role::new(Drive::None, false);
    /// Held at `value`.
    pub const STATIC: Role = Role::new(Drive::Held, false);
    /// Swept across setpoints.
    pub const DYNAMIC: Role = Role::new(Drive::Swept, false);
    /// Recorded at each step.
    pub const GETTABLE: Role = Role::new(Drive::None, true);
    /// Held at `value` and recorded.
    pub const STATIC_GETTABLE: Role = Role::new(Drive::Held, true);
    /// Swept and recorded.
    pub const DYNAMIC_GETTABLE: Role = Role::new(Drive::Swept, true);
    /// Derived compensation.
    pub const COMPENSATING: Role = Role::new(Drive::Compensating, false);

    const fn new(drive: Drive, recorded: bool) -> Self {
        Self { drive, recorded }
    }

    /// Parse a type string of whitespace-separated tokens.
    ///
    /// Accepted tokens: `static`, `dynamic`, `gettable`, `compensating`,
    /// `none`, and the joined forms `static_gettable`, `dynamic_gettable`.
    pub fn parse(type_str: &str) -> Result<Self, String> {
        let mut drive = Drive::None;
        let mut recorded = false;
        let mut explicit_none = false;
        let mut seen_any = false;

        let tokens = type_str
            .split_whitespace()
            .flat_map(|token| match token {
                "static_gettable" => vec!["static", "gettable"],
                "dynamic_gettable" => vec!["dynamic", "gettable"],
                other => vec![other],
            })
            .collect::<Vec<_>>();

        for token in tokens {
            seen_any = true;
            let wanted = match token {
                "static" => Drive::Held,
                "dynamic" => Drive::Swept,
                "compensating" => Drive::Compensating,
                "gettable" => {
                    recorded = true;
                    continue;
                }
                "none" => {
                    explicit_none = true;
                    continue;
                }
                unknown => return Err(format!("unknown role token '{unknown}'")),
            };
            if drive != Drive::None && drive != wanted {
                return Err(format!("conflicting roles {drive:?} and {wanted:?}"));
            }
            drive = wanted;
        }

        if !seen_any {
            return Err("empty type string".to_string());
        }
        if explicit_none && (drive != Drive::None || recorded) {
            return Err("'none' cannot be combined with other roles".to_string());
        }
        if drive == Drive::Compensating && recorded {
            return Err("compensating parameters cannot be gettable".to_string());
        }
        Ok(Self { drive, recorded })
    }

    /// Drive facet.
    pub fn drive(&self) -> Drive {
        self.drive
    }

    /// True if the orchestrator commands this parameter.
    pub fn settable(&self) -> bool {
        self.drive != Drive::None
    }

    /// True if the parameter is sampled at each step.
    pub fn recorded(&self) -> bool {
        self.recorded
    }

    /// True if the parameter is swept.
    pub fn dynamic(&self) -> bool {
        self.drive == Drive::Swept
    }

    /// True if the parameter is derived compensation.
    pub fn compensating(&self) -> bool {
        self.drive == Drive::Compensating
    }

    /// Configuration name of the role.
    pub fn name(&self) -> &'static str {
        match (self.drive, self.recorded) {
            (Drive::None, false) => "none",
            (Drive::None, true) => "gettable",
            (Drive::Held, false) => "static",
            (Drive::Held, true) => "static gettable",
            (Drive::Swept, false) => "dynamic",
            (Drive::Swept, true) => "dynamic gettable",
            (Drive::Compensating, _) => "compensating",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// =============================================================================
// Raw configuration
// =============================================================================

/// Grid group identifier; the original configuration files use both
/// integers and names.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum GroupId {
    /// Numbered group
    Index(i64),
    /// Named group
    Name(String),
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GroupId::Index(i) => write!(f, "{i}"),
            GroupId::Name(n) => f.write_str(n),
        }
    }
}

/// Attributes of one parameter as written in a configuration file.
///
/// Unknown attributes are rejected so that a misspelled key fails at load.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ParameterConfig {
    /// Role type string, e.g. `"static gettable"`
    #[serde(rename = "type")]
    pub kind: Option<String>,
    /// Nominal / starting / baseline value
    pub value: Option<Value>,
    /// Explicit setpoints
    pub setpoints: Option<Vec<f64>>,
    /// Linear sweep start
    pub start: Option<f64>,
    /// Linear sweep stop
    pub stop: Option<f64>,
    /// Linear sweep point count
    pub num_points: Option<usize>,
    /// Seconds to wait after setting this parameter
    pub delay: Option<f64>,
    /// Conditions such as `"val > 0.95"`
    pub break_conditions: Vec<String>,
    /// `[min, max]`
    pub limits: Option<[f64; 2]>,
    /// Reject value changes
    pub locked: bool,
    /// Parameters whose displacement this one compensates
    #[serde(alias = "compensated_gates")]
    pub compensated_targets: Vec<ParameterKey>,
    /// One lever arm per compensated target
    pub leverarms: Vec<f64>,
    /// Grid axis group
    pub group: Option<GroupId>,
    /// Grid axis priority (lower varies faster)
    pub priority: Option<i64>,
    /// Accept a parameter name outside [`PARAMETER_NAMES`]
    pub extensible: bool,
    /// Append the reversed setpoints
    pub backsweep: bool,
}

/// `parameter -> attributes` for one terminal.
pub type TerminalConfig = IndexMap<String, ParameterConfig>;

/// `terminal -> parameter -> attributes`.
pub type ModelConfig = IndexMap<String, TerminalConfig>;

// =============================================================================
// Typed specs
// =============================================================================

/// Closed interval every commanded value must lie in.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Limits {
    /// Lower bound (inclusive)
    pub min: f64,
    /// Upper bound (inclusive)
    pub max: f64,
}

impl Limits {
    /// True if `value` lies in `[min, max]`.
    pub fn contains(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }
}

/// Where a dynamic parameter's setpoints came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetpointSource {
    /// Explicit `setpoints` list
    Explicit,
    /// Expanded from `(start, stop, num_points)`
    Linear,
}

/// Linear compensation against other swept parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct Compensation {
    /// Baseline value of the compensating parameter
    pub baseline: f64,
    /// `(target, leverarm)` in configuration order
    pub terms: Vec<(ParameterKey, f64)>,
}

/// One physical quantity of a terminal with its role and sweep data.
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterSpec {
    key: ParameterKey,
    role: Role,
    value: Option<Value>,
    setpoints: Option<Vec<f64>>,
    setpoint_source: Option<SetpointSource>,
    requested_points: Option<usize>,
    delay: f64,
    break_conditions: Vec<BreakCondition>,
    limits: Option<Limits>,
    locked: bool,
    compensation: Option<Compensation>,
    group: Option<GroupId>,
    priority: Option<i64>,
}

impl ParameterSpec {
    /// Parse and validate one parameter's attributes.
    pub fn from_config(key: ParameterKey, config: &ParameterConfig) -> AppResult<Self> {
        if !config.extensible && !PARAMETER_NAMES.contains(&key.parameter.as_str()) {
            return Err(DaqError::UnknownParameter {
                terminal: key.terminal,
                parameter: key.parameter,
            });
        }

        let type_str = config.kind.as_deref().ok_or_else(|| DaqError::MissingField {
            key: key.clone(),
            field: "type",
        })?;
        let role = Role::parse(type_str).map_err(|reason| DaqError::InvalidRole {
            key: key.clone(),
            role: type_str.to_string(),
            reason,
        })?;

        let delay = config.delay.unwrap_or(0.0);
        if !(delay >= 0.0 && delay.is_finite()) {
            return Err(DaqError::InvalidParameter {
                key,
                reason: format!("delay must be non-negative, got {delay}"),
            });
        }

        let limits = match config.limits {
            Some([min, max]) if min > max || min.is_nan() || max.is_nan() => {
                return Err(DaqError::InvalidParameter {
                    key,
                    reason: format!("limits [{min}, {max}] are not ordered"),
                });
            }
            Some([min, max]) => Some(Limits { min, max }),
            None => None,
        };

        let mut spec = Self {
            key,
            role,
            value: config.value.clone(),
            setpoints: None,
            setpoint_source: None,
            requested_points: None,
            delay,
            break_conditions: Vec::new(),
            limits,
            locked: config.locked,
            compensation: None,
            group: config.group.clone(),
            priority: config.priority,
        };

        match role.drive() {
            Drive::Swept => spec.parse_setpoints(config)?,
            Drive::Held if spec.value.is_none() => {
                return Err(DaqError::MissingField {
                    key: spec.key,
                    field: "value",
                });
            }
            Drive::Compensating => spec.parse_compensation(config)?,
            Drive::Held | Drive::None => {}
        }

        if !config.break_conditions.is_empty() {
            if role.recorded() {
                spec.break_conditions = config
                    .break_conditions
                    .iter()
                    .map(|c| BreakCondition::parse(c))
                    .collect::<AppResult<Vec<_>>>()?;
            } else {
                tracing::warn!(
                    key = %spec.key,
                    "Ignoring break conditions on a parameter that is not recorded"
                );
            }
        }

        Ok(spec)
    }

    fn parse_setpoints(&mut self, config: &ParameterConfig) -> AppResult<()> {
        let (mut setpoints, source, requested) = match (&config.setpoints, config.start, config.stop, config.num_points) {
            (Some(points), ..) if !points.is_empty() => {
                (points.clone(), SetpointSource::Explicit, points.len())
            }
            (Some(_), ..) => {
                return Err(DaqError::InvalidParameter {
                    key: self.key.clone(),
                    reason: "setpoints must not be empty".to_string(),
                });
            }
            (None, Some(start), Some(stop), Some(num_points)) => {
                if num_points == 0 {
                    return Err(DaqError::InvalidParameter {
                        key: self.key.clone(),
                        reason: "num_points must be at least 1".to_string(),
                    });
                }
                (
                    linear_setpoints(start, stop, num_points),
                    SetpointSource::Linear,
                    num_points,
                )
            }
            _ => {
                return Err(DaqError::MissingField {
                    key: self.key.clone(),
                    field: "setpoints",
                });
            }
        };

        if let Some(bad) = setpoints.iter().find(|v| !v.is_finite()) {
            return Err(DaqError::InvalidParameter {
                key: self.key.clone(),
                reason: format!("setpoint {bad} is not finite"),
            });
        }

        if config.backsweep {
            let reversed = setpoints.iter().rev().copied().collect::<Vec<_>>();
            setpoints.extend(reversed);
        }

        self.setpoints = Some(setpoints);
        self.setpoint_source = Some(source);
        self.requested_points = Some(requested);
        Ok(())
    }

    fn parse_compensation(&mut self, config: &ParameterConfig) -> AppResult<()> {
        let baseline = match &self.value {
            Some(Value::Float(v)) => *v,
            Some(other) => {
                return Err(DaqError::InvalidParameter {
                    key: self.key.clone(),
                    reason: format!("compensation baseline must be numeric, got {other}"),
                });
            }
            None => {
                return Err(DaqError::MissingField {
                    key: self.key.clone(),
                    field: "value",
                });
            }
        };
        if config.compensated_targets.is_empty() {
            return Err(DaqError::MissingField {
                key: self.key.clone(),
                field: "compensated_targets",
            });
        }
        if config.leverarms.is_empty() {
            return Err(DaqError::MissingField {
                key: self.key.clone(),
                field: "leverarms",
            });
        }
        if config.leverarms.len() != config.compensated_targets.len() {
            return Err(DaqError::InvalidParameter {
                key: self.key.clone(),
                reason: format!(
                    "{} leverarms for {} compensated targets",
                    config.leverarms.len(),
                    config.compensated_targets.len()
                ),
            });
        }
        self.compensation = Some(Compensation {
            baseline,
            terms: config
                .compensated_targets
                .iter()
                .cloned()
                .zip(config.leverarms.iter().copied())
                .collect(),
        });
        Ok(())
    }

    /// Unique key.
    pub fn key(&self) -> &ParameterKey {
        &self.key
    }

    /// Role.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Nominal value.
    pub fn value(&self) -> Option<&Value> {
        self.value.as_ref()
    }

    /// Expanded setpoints (dynamic parameters only).
    pub fn setpoints(&self) -> Option<&[f64]> {
        self.setpoints.as_deref()
    }

    /// Where the setpoints came from.
    pub fn setpoint_source(&self) -> Option<SetpointSource> {
        self.setpoint_source
    }

    /// Point count the configuration asked for, before backsweep expansion.
    pub fn requested_points(&self) -> Option<usize> {
        self.requested_points
    }

    /// Delay in seconds after each set.
    pub fn delay(&self) -> f64 {
        self.delay
    }

    /// Parsed break conditions.
    pub fn break_conditions(&self) -> &[BreakCondition] {
        &self.break_conditions
    }

    /// Limits, if any.
    pub fn limits(&self) -> Option<Limits> {
        self.limits
    }

    /// Locked flag.
    pub fn locked(&self) -> bool {
        self.locked
    }

    /// Compensation terms (compensating parameters only).
    pub fn compensation(&self) -> Option<&Compensation> {
        self.compensation.as_ref()
    }

    /// Grid group.
    pub fn group(&self) -> Option<&GroupId> {
        self.group.as_ref()
    }

    /// Grid priority.
    pub fn priority(&self) -> Option<i64> {
        self.priority
    }

    /// Value held before the sweep starts: `value` if set, otherwise the
    /// first setpoint, otherwise the compensation baseline.
    pub fn initial_value(&self) -> Option<Value> {
        match (&self.value, &self.setpoints) {
            (Some(v), _) => Some(v.clone()),
            (None, Some(points)) => points.first().copied().map(Value::Float),
            (None, None) => None,
        }
    }

    /// Fail unless `value` may be commanded to this parameter.
    pub fn check_value(&self, value: f64) -> AppResult<()> {
        if let Some(limits) = self.limits {
            if !limits.contains(value) {
                return Err(DaqError::LimitViolation {
                    key: self.key.clone(),
                    value,
                    min: limits.min,
                    max: limits.max,
                });
            }
        }
        Ok(())
    }

    /// Change the nominal value, honoring the lock and the limits.
    pub fn set_value(&mut self, value: Value) -> AppResult<()> {
        if self.locked {
            return Err(DaqError::LockedParameter {
                key: self.key.clone(),
            });
        }
        if let Value::Float(v) = value {
            self.check_value(v)?;
        }
        self.value = Some(value);
        Ok(())
    }
}

/// A named contact of the device with its parameters in declaration order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Terminal {
    /// Parameters keyed by name
    pub parameters: IndexMap<String, ParameterSpec>,
}

// =============================================================================
// Model
// =============================================================================

/// All terminals of a measurement, in declaration order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ParameterModel {
    terminals: IndexMap<String, Terminal>,
}

impl ParameterModel {
    /// Build a model from a nested configuration.
    pub fn build(config: &ModelConfig) -> AppResult<Self> {
        let mut model = Self::default();
        model.merge(config)?;
        Ok(model)
    }

    /// Return a new model with `config` merged into this one.
    ///
    /// Existing parameters that are not mentioned stay untouched; mentioned
    /// ones are replaced. Channel mappings are keyed by [`ParameterKey`] and
    /// therefore remain valid.
    pub fn update(&self, config: &ModelConfig) -> AppResult<Self> {
        let mut model = self.clone();
        model.merge(config)?;
        Ok(model)
    }

    fn merge(&mut self, config: &ModelConfig) -> AppResult<()> {
        for (terminal, parameters) in config {
            for (name, attributes) in parameters {
                let spec = ParameterSpec::from_config(ParameterKey::new(terminal, name), attributes)?;
                self.insert(spec);
            }
        }
        self.validate_references()
    }

    fn insert(&mut self, spec: ParameterSpec) {
        self.terminals
            .entry(spec.key.terminal.clone())
            .or_default()
            .parameters
            .insert(spec.key.parameter.clone(), spec);
    }

    /// Compensation targets must exist and be swept.
    fn validate_references(&self) -> AppResult<()> {
        for spec in self.compensating() {
            let Some(compensation) = spec.compensation() else {
                continue;
            };
            for (target, _) in &compensation.terms {
                match self.get(target) {
                    Some(t) if t.role().dynamic() => {}
                    Some(_) => {
                        return Err(DaqError::InvalidParameter {
                            key: spec.key.clone(),
                            reason: format!("compensated target {target} is not dynamic"),
                        });
                    }
                    None => {
                        return Err(DaqError::InvalidParameter {
                            key: spec.key.clone(),
                            reason: format!("compensated target {target} does not exist"),
                        });
                    }
                }
            }
        }
        Ok(())
    }

    /// Parse a YAML document and build the model.
    pub fn from_yaml_str(yaml: &str) -> AppResult<Self> {
        let config: ModelConfig = serde_yaml::from_str(yaml)?;
        Self::build(&config)
    }

    /// Parse a JSON document and build the model.
    pub fn from_json_str(json: &str) -> AppResult<Self> {
        let config: ModelConfig = serde_json::from_str(json)?;
        Self::build(&config)
    }

    /// Load a YAML or JSON file, chosen by extension.
    pub fn load(path: impl AsRef<Path>) -> AppResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json_str(&text),
            _ => Self::from_yaml_str(&text),
        }
    }

    /// Add or replace one parameter.
    pub fn add_parameter(&mut self, key: ParameterKey, config: &ParameterConfig) -> AppResult<()> {
        let spec = ParameterSpec::from_config(key, config)?;
        let previous = self.clone();
        self.insert(spec);
        if let Err(err) = self.validate_references() {
            *self = previous;
            return Err(err);
        }
        Ok(())
    }

    /// Remove one parameter. Empty terminals are dropped.
    pub fn remove_parameter(&mut self, key: &ParameterKey) -> AppResult<Option<ParameterSpec>> {
        let previous = self.clone();
        let removed = self
            .terminals
            .get_mut(&key.terminal)
            .and_then(|t| t.parameters.shift_remove(&key.parameter));
        self.terminals.retain(|_, t| !t.parameters.is_empty());
        if let Err(err) = self.validate_references() {
            *self = previous;
            return Err(err);
        }
        Ok(removed)
    }

    /// Remove a whole terminal.
    pub fn remove_terminal(&mut self, name: &str) -> AppResult<Option<Terminal>> {
        let previous = self.clone();
        let removed = self.terminals.shift_remove(name);
        if let Err(err) = self.validate_references() {
            *self = previous;
            return Err(err);
        }
        Ok(removed)
    }

    /// Terminals in declaration order.
    pub fn terminals(&self) -> impl Iterator<Item = (&String, &Terminal)> {
        self.terminals.iter()
    }

    /// Look up a spec.
    pub fn get(&self, key: &ParameterKey) -> Option<&ParameterSpec> {
        self.terminals
            .get(&key.terminal)
            .and_then(|t| t.parameters.get(&key.parameter))
    }

    /// Mutable lookup; value changes still go through [`ParameterSpec::set_value`].
    pub fn get_mut(&mut self, key: &ParameterKey) -> Option<&mut ParameterSpec> {
        self.terminals
            .get_mut(&key.terminal)
            .and_then(|t| t.parameters.get_mut(&key.parameter))
    }

    /// All specs in declaration order.
    pub fn specs(&self) -> impl Iterator<Item = &ParameterSpec> {
        self.terminals.values().flat_map(|t| t.parameters.values())
    }

    /// Number of specs.
    pub fn len(&self) -> usize {
        self.terminals.values().map(|t| t.parameters.len()).sum()
    }

    /// True if the model holds no parameters.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Swept parameters in declaration order.
    pub fn dynamic(&self) -> Vec<&ParameterSpec> {
        self.specs().filter(|s| s.role.dynamic()).collect()
    }

    /// Recorded parameters in declaration order.
    pub fn gettables(&self) -> Vec<&ParameterSpec> {
        self.specs().filter(|s| s.role.recorded()).collect()
    }

    /// Compensating parameters in declaration order.
    pub fn compensating(&self) -> Vec<&ParameterSpec> {
        self.specs().filter(|s| s.role.compensating()).collect()
    }

    /// Held parameters in declaration order.
    pub fn statics(&self) -> Vec<&ParameterSpec> {
        self.specs()
            .filter(|s| s.role.drive() == Drive::Held)
            .collect()
    }

    /// Every parameter the orchestrator commands.
    pub fn settables(&self) -> Vec<&ParameterSpec> {
        self.specs().filter(|s| s.role.settable()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dynamic_linear(start: f64, stop: f64, n: usize) -> ParameterConfig {
        ParameterConfig {
            kind: Some("dynamic".into()),
            start: Some(start),
            stop: Some(stop),
            num_points: Some(n),
            ..Default::default()
        }
    }

    #[test]
    fn linear_setpoints_are_uniform_and_hit_both_ends() {
        let spec = ParameterSpec::from_config(
            ParameterKey::new("gate", "voltage"),
            &dynamic_linear(-0.5, 0.7, 13),
        )
        .unwrap();
        let points = spec.setpoints().unwrap();
        assert_eq!(points.len(), 13);
        assert_eq!(points[0], -0.5);
        assert_eq!(points[12], 0.7);
        let step = (0.7 - -0.5) / 12.0;
        for pair in points.windows(2) {
            assert!((pair[1] - pair[0] - step).abs() < 1e-12);
        }
        assert_eq!(spec.setpoint_source(), Some(SetpointSource::Linear));
    }

    #[test]
    fn role_tokens_combine() {
        assert_eq!(Role::parse("static gettable").unwrap(), Role::STATIC_GETTABLE);
        assert_eq!(Role::parse("static_gettable").unwrap(), Role::STATIC_GETTABLE);
        assert_eq!(Role::parse("gettable").unwrap(), Role::GETTABLE);
        assert_eq!(Role::parse("  dynamic ").unwrap(), Role::DYNAMIC);
        assert!(Role::STATIC_GETTABLE.settable());
        assert!(Role::STATIC_GETTABLE.recorded());
        assert!(!Role::GETTABLE.settable());
    }

    #[test]
    fn invalid_role_combinations_are_rejected() {
        assert!(Role::parse("static dynamic").is_err());
        assert!(Role::parse("compensating gettable").is_err());
        assert!(Role::parse("none gettable").is_err());
        assert!(Role::parse("sweepable").is_err());
        assert!(Role::parse("").is_err());
    }

    #[test]
    fn unknown_parameter_names_the_terminal() {
        let yaml = "gate:\n  voltagee: { type: static, value: 0.1 }\n";
        match ParameterModel::from_yaml_str(yaml) {
            Err(DaqError::UnknownParameter {
                terminal,
                parameter,
            }) => {
                assert_eq!(terminal, "gate");
                assert_eq!(parameter, "voltagee");
            }
            other => panic!("expected UnknownParameter, got {other:?}"),
        }
    }

    #[test]
    fn extensible_parameters_skip_the_whitelist() {
        let yaml = "magnet:\n  field: { type: static, value: 0.5, extensible: true }\n";
        let model = ParameterModel::from_yaml_str(yaml).unwrap();
        assert_eq!(model.statics().len(), 1);
    }

    #[test]
    fn invalid_role_token_fails() {
        let yaml = "gate:\n  voltage: { type: sweeping, value: 0.1 }\n";
        assert!(matches!(
            ParameterModel::from_yaml_str(yaml),
            Err(DaqError::InvalidRole { .. })
        ));
    }

    #[test]
    fn required_fields_follow_the_role() {
        let missing_value = "gate:\n  voltage: { type: static }\n";
        assert!(matches!(
            ParameterModel::from_yaml_str(missing_value),
            Err(DaqError::MissingField { field: "value", .. })
        ));

        let missing_setpoints = "gate:\n  voltage: { type: dynamic, start: 0, stop: 1 }\n";
        assert!(matches!(
            ParameterModel::from_yaml_str(missing_setpoints),
            Err(DaqError::MissingField {
                field: "setpoints",
                ..
            })
        ));
    }

    #[test]
    fn compensation_requires_matching_leverarms() {
        let yaml = r#"
plunger:
  voltage: { type: dynamic, setpoints: [0.0, 0.1] }
sensor:
  voltage:
    type: compensating
    value: 0.3
    compensated_targets: [{ terminal: plunger, parameter: voltage }]
    leverarms: [0.1, 0.2]
"#;
        assert!(matches!(
            ParameterModel::from_yaml_str(yaml),
            Err(DaqError::InvalidParameter { .. })
        ));
    }

    #[test]
    fn compensation_target_must_be_dynamic() {
        let yaml = r#"
plunger:
  voltage: { type: static, value: 0.0 }
sensor:
  voltage:
    type: compensating
    value: 0.3
    compensated_gates: [{ terminal: plunger, parameter: voltage }]
    leverarms: [0.1]
"#;
        let err = ParameterModel::from_yaml_str(yaml).unwrap_err();
        assert!(err.to_string().contains("not dynamic"));
    }

    #[test]
    fn misspelled_attribute_is_rejected() {
        let yaml = "gate:\n  voltage: { type: dynamic, setpoint: [0.0, 1.0] }\n";
        match ParameterModel::from_yaml_str(yaml) {
            Err(DaqError::Yaml(e)) => assert!(e.to_string().contains("unknown field `setpoint`")),
            other => panic!("expected a YAML error, got {other:?}"),
        }

        // the legacy spelling is still accepted
        let yaml = "plunger:\n  voltage: { type: dynamic, setpoints: [0.0, 1.0] }\nsensor:\n  voltage:\n    type: compensating\n    value: 0.5\n    compensated_gates: [{ terminal: plunger, parameter: voltage }]\n    leverarms: [0.1]\n";
        let model = ParameterModel::from_yaml_str(yaml).unwrap();
        assert_eq!(model.compensating().len(), 1);
    }

    #[test]
    fn declaration_order_is_kept() {
        let yaml = r#"
zeta:
  voltage: { type: static, value: 0.0 }
alpha:
  current: { type: gettable }
  voltage: { type: static gettable, value: 1.0 }
"#;
        let model = ParameterModel::from_yaml_str(yaml).unwrap();
        let keys = model.specs().map(|s| s.key().to_string()).collect::<Vec<_>>();
        assert_eq!(keys, vec!["zeta.voltage", "alpha.current", "alpha.voltage"]);
    }

    #[test]
    fn update_merges_without_dropping_existing() {
        let model = ParameterModel::from_yaml_str(
            "gate:\n  voltage: { type: static, value: 0.0 }\nohmic:\n  current: { type: gettable }\n",
        )
        .unwrap();
        let mut extra = ModelConfig::new();
        extra
            .entry("gate".into())
            .or_default()
            .insert("voltage".into(), dynamic_linear(0.0, 1.0, 5));
        extra
            .entry("lockin".into())
            .or_default()
            .insert("frequency".into(), ParameterConfig {
                kind: Some("static".into()),
                value: Some(Value::Float(17.0)),
                ..Default::default()
            });

        let updated = model.update(&extra).unwrap();
        assert_eq!(updated.len(), 3);
        assert!(updated
            .get(&ParameterKey::new("gate", "voltage"))
            .unwrap()
            .role()
            .dynamic());
        assert!(updated.get(&ParameterKey::new("ohmic", "current")).is_some());
        // original model is untouched
        assert!(!model
            .get(&ParameterKey::new("gate", "voltage"))
            .unwrap()
            .role()
            .dynamic());
    }

    #[test]
    fn locked_parameter_rejects_value_changes() {
        let mut model = ParameterModel::from_yaml_str(
            "gate:\n  voltage: { type: static, value: 0.2, locked: true }\n",
        )
        .unwrap();
        let spec = model.get_mut(&ParameterKey::new("gate", "voltage")).unwrap();
        assert!(matches!(
            spec.set_value(Value::Float(0.3)),
            Err(DaqError::LockedParameter { .. })
        ));
    }

    #[test]
    fn break_conditions_need_a_recorded_role() {
        let model = ParameterModel::from_yaml_str(
            "gate:\n  voltage: { type: static, value: 0.2, break_conditions: ['val > 1'] }\n",
        )
        .unwrap();
        let spec = model.get(&ParameterKey::new("gate", "voltage")).unwrap();
        assert!(spec.break_conditions().is_empty());
    }

    #[test]
    fn backsweep_appends_reversed_setpoints() {
        let yaml = "gate:\n  voltage: { type: dynamic, setpoints: [0, 1, 2], backsweep: true }\n";
        let model = ParameterModel::from_yaml_str(yaml).unwrap();
        let spec = model.get(&ParameterKey::new("gate", "voltage")).unwrap();
        assert_eq!(spec.setpoints().unwrap(), &[0.0, 1.0, 2.0, 2.0, 1.0, 0.0]);
        assert_eq!(spec.requested_points(), Some(3));
    }

    #[test]
    fn json_and_yaml_agree() {
        let json = r#"{"gate":{"voltage":{"type":"dynamic","setpoints":[0,1,2]}},
                       "ohmic":{"current":{"type":"gettable","break_conditions":["val > 0.95"]}}}"#;
        let model = ParameterModel::from_json_str(json).unwrap();
        assert_eq!(model.dynamic().len(), 1);
        assert_eq!(model.gettables()[0].break_conditions().len(), 1);
    }
}
