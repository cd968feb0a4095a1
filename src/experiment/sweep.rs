//! Sweep geometry: turns swept and compensating specs into [`SweepPlan`]s.
//!
//! Three geometries are supported:
//!
//! - **Sequential**: one plan per swept parameter; the others are held at
//!   their `value` (or first setpoint) while it runs.
//! - **Parallel**: one plan whose step *i* sets every swept parameter to its
//!   own setpoint *i*. All setpoint counts must match.
//! - **Grid**: the Cartesian product of all axes. The first declared axis
//!   varies fastest; `priority` reorders axes and `group` makes several
//!   parameters share one axis.
//!
//! A **timetrace** sweeps nothing: the recorded parameters are read at a
//! fixed interval for a fixed time while every swept parameter is parked.
//!
//! Every commanded value is checked against its limits here, before any
//! instrument is touched.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::buffer::{BufferConfig, BufferSettingsResolver};
use crate::config::TimetraceSettings;
use crate::error::{AppResult, DaqError};
use crate::experiment::plan::{CompensationRule, PlanStep, SweepPlan, Timetrace};
use crate::parameter::{GroupId, ParameterKey, ParameterModel, ParameterSpec, Value};
use crate::warning::MeasurementWarning;

/// Grid sizes above this produce a [`MeasurementWarning::LargeGrid`].
pub const DEFAULT_GRID_WARNING_THRESHOLD: usize = 100_000;

/// Evenly spaced setpoints from `start` to `stop` inclusive.
///
/// `num_points == 1` yields `[start]`; the last point is exactly `stop`.
pub fn linear_setpoints(start: f64, stop: f64, num_points: usize) -> Vec<f64> {
    match num_points {
        0 => Vec::new(),
        1 => vec![start],
        n => {
            let step = (stop - start) / (n - 1) as f64;
            (0..n)
                .map(|i| if i == n - 1 { stop } else { start + step * i as f64 })
                .collect()
        }
    }
}

/// Sweep geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SweepMode {
    /// One plan per swept parameter
    Sequential,
    /// All swept parameters step together
    Parallel,
    /// Cartesian product
    Grid,
}

impl fmt::Display for SweepMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SweepMode::Sequential => write!(f, "sequential"),
            SweepMode::Parallel => write!(f, "parallel"),
            SweepMode::Grid => write!(f, "grid"),
        }
    }
}

impl FromStr for SweepMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sequential" => Ok(SweepMode::Sequential),
            "parallel" => Ok(SweepMode::Parallel),
            "grid" => Ok(SweepMode::Grid),
            other => Err(format!(
                "unknown sweep mode '{other}' (expected sequential, parallel or grid)"
            )),
        }
    }
}

/// One grid axis: parameters that step together.
#[derive(Debug, Clone)]
struct Axis {
    priority: Option<i64>,
    members: Vec<(ParameterKey, Vec<f64>)>,
}

impl Axis {
    fn len(&self) -> usize {
        self.members.first().map(|(_, p)| p.len()).unwrap_or(0)
    }

    fn push(&mut self, spec: &ParameterSpec, points: Vec<f64>) -> AppResult<()> {
        let expected = self.len();
        if !self.members.is_empty() && points.len() != expected {
            return Err(DaqError::SweepLengthMismatch {
                key: spec.key().clone(),
                expected,
                found: points.len(),
            });
        }
        if self.priority.is_none() {
            self.priority = spec.priority();
        }
        self.members.push((spec.key().clone(), points));
        Ok(())
    }
}

/// Builds sweep plans from a [`ParameterModel`].
#[derive(Debug, Clone)]
pub struct SweepBuilder<'a> {
    model: &'a ParameterModel,
    grid_warning_threshold: usize,
    record_idle: bool,
}

impl<'a> SweepBuilder<'a> {
    /// Create a builder over `model`.
    pub fn new(model: &'a ParameterModel) -> Self {
        Self {
            model,
            grid_warning_threshold: DEFAULT_GRID_WARNING_THRESHOLD,
            record_idle: true,
        }
    }

    /// Override the grid size above which a warning is produced.
    pub fn with_grid_warning_threshold(mut self, threshold: usize) -> Self {
        self.grid_warning_threshold = threshold;
        self
    }

    /// Whether sequential sub-plans also record the swept parameters they
    /// hold still. On by default.
    pub fn with_idle_params_recorded(mut self, record: bool) -> Self {
        self.record_idle = record;
        self
    }

    /// Build the plans for `mode`. Sequential mode yields one plan per swept
    /// parameter; the other modes yield exactly one.
    pub fn build(&self, mode: SweepMode) -> AppResult<Vec<SweepPlan>> {
        self.check_static_limits()?;
        let plans = match mode {
            SweepMode::Sequential => self.sequential()?,
            SweepMode::Parallel => vec![self.parallel()?],
            SweepMode::Grid => vec![self.grid()?],
        };
        for plan in &plans {
            self.check_step_limits(plan)?;
            plan.validate_compensation()?;
        }
        tracing::debug!(
            mode = %mode,
            plans = plans.len(),
            steps = plans.iter().map(SweepPlan::len).sum::<usize>(),
            "Built sweep plans"
        );
        Ok(plans)
    }

    /// Build the single plan of a buffered burst: every swept parameter moves
    /// linearly from its first to its last setpoint over `config.num_points`
    /// samples.
    ///
    /// Without swept parameters the burst is a buffered timetrace: the plan
    /// has `num_points` steps without targets.
    pub fn build_buffered(&self, config: &BufferConfig) -> AppResult<SweepPlan> {
        self.check_static_limits()?;
        let warnings = BufferSettingsResolver::default().reconcile_sweep(self.model, config);

        let dynamic = self.model.dynamic();
        let mut plan = if dynamic.is_empty() {
            let steps = (0..config.num_points)
                .map(|index| PlanStep {
                    index,
                    targets: IndexMap::new(),
                })
                .collect();
            self.plan_from("buffered", steps, IndexMap::new())
        } else {
            let mut axis = Axis {
                priority: None,
                members: Vec::new(),
            };
            for spec in dynamic {
                let (first, last) = sweep_endpoints(spec)?;
                axis.push(spec, linear_setpoints(first, last, config.num_points))?;
            }
            self.assemble("buffered", &[axis], IndexMap::new())
        }?;
        for warning in warnings {
            plan.push_warning(warning);
        }
        self.check_step_limits(&plan)?;
        plan.validate_compensation()?;
        Ok(plan)
    }

    /// Build a timetrace: one plan that reads every gettable and every swept
    /// parameter each `timestep` until `duration` has elapsed. Swept
    /// parameters are parked like the idle parameters of a sequential sweep.
    pub fn build_timetrace(&self, settings: &TimetraceSettings) -> AppResult<SweepPlan> {
        self.check_static_limits()?;
        let timetrace = Timetrace {
            duration: settings.duration()?,
            timestep: settings.timestep()?,
        };
        if timetrace.duration.is_zero() || timetrace.timestep.is_zero() {
            return Err(DaqError::Configuration(format!(
                "timetrace needs a positive duration and timestep, got {:?} and {:?}",
                timetrace.duration, timetrace.timestep
            )));
        }

        let dynamic = self.model.dynamic();
        let mut held = IndexMap::new();
        for spec in &dynamic {
            held.insert(spec.key().clone(), held_value(spec)?);
        }
        let step = PlanStep {
            index: 0,
            targets: IndexMap::new(),
        };
        let mut plan = self.plan_from("timetrace", vec![step], held)?;
        for spec in dynamic {
            plan.record_also(spec.key().clone());
        }
        plan.set_timetrace(timetrace);
        self.check_step_limits(&plan)?;
        plan.validate_compensation()?;
        tracing::debug!(
            duration = ?timetrace.duration,
            timestep = ?timetrace.timestep,
            "Built timetrace plan"
        );
        Ok(plan)
    }

    fn sequential(&self) -> AppResult<Vec<SweepPlan>> {
        let dynamic = self.model.dynamic();
        if dynamic.is_empty() {
            return Ok(vec![self.assemble("point", &[], IndexMap::new())?]);
        }

        let mut plans = Vec::with_capacity(dynamic.len());
        for active in &dynamic {
            let mut held = IndexMap::new();
            for other in dynamic.iter().filter(|s| s.key() != active.key()) {
                held.insert(other.key().clone(), held_value(other)?);
            }
            let axis = Axis {
                priority: None,
                members: vec![(active.key().clone(), setpoints_of(active)?)],
            };
            let idle = held.keys().cloned().collect::<Vec<_>>();
            let mut plan = self.assemble(active.key().to_string(), &[axis], held)?;
            if self.record_idle {
                for key in idle {
                    plan.record_also(key);
                }
            }
            plans.push(plan);
        }
        Ok(plans)
    }

    fn parallel(&self) -> AppResult<SweepPlan> {
        let mut axis = Axis {
            priority: None,
            members: Vec::new(),
        };
        for spec in self.model.dynamic() {
            axis.push(spec, setpoints_of(spec)?)?;
        }
        let axes = if axis.members.is_empty() {
            Vec::new()
        } else {
            vec![axis]
        };
        self.assemble("parallel", &axes, IndexMap::new())
    }

    fn grid(&self) -> AppResult<SweepPlan> {
        let axes = self.grid_axes()?;
        let steps = axes.iter().try_fold(1usize, |acc, axis| acc.checked_mul(axis.len()));
        let Some(steps) = steps else {
            return Err(DaqError::Configuration(
                "grid sweep step count overflows".to_string(),
            ));
        };

        let mut plan = self.assemble("grid", &axes, IndexMap::new())?;
        if steps > self.grid_warning_threshold {
            plan.push_warning(MeasurementWarning::LargeGrid {
                steps,
                threshold: self.grid_warning_threshold,
            });
        }
        Ok(plan)
    }

    /// Axes in fastest-first order.
    fn grid_axes(&self) -> AppResult<Vec<Axis>> {
        let mut axes: Vec<Axis> = Vec::new();
        let mut groups: IndexMap<GroupId, usize> = IndexMap::new();

        for spec in self.model.dynamic() {
            let points = setpoints_of(spec)?;
            match spec.group() {
                Some(group) => match groups.get(group) {
                    Some(&slot) => axes[slot].push(spec, points)?,
                    None => {
                        groups.insert(group.clone(), axes.len());
                        let mut axis = Axis {
                            priority: None,
                            members: Vec::new(),
                        };
                        axis.push(spec, points)?;
                        axes.push(axis);
                    }
                },
                None => {
                    let mut axis = Axis {
                        priority: None,
                        members: Vec::new(),
                    };
                    axis.push(spec, points)?;
                    axes.push(axis);
                }
            }
        }

        let mut seen: IndexMap<i64, &ParameterKey> = IndexMap::new();
        for axis in &axes {
            let (Some(priority), Some((key, _))) = (axis.priority, axis.members.first()) else {
                continue;
            };
            if let Some(other) = seen.insert(priority, key) {
                return Err(DaqError::Configuration(format!(
                    "grid priority {priority} is assigned to both {other} and {key}"
                )));
            }
        }

        // explicit priorities first (ascending), the rest in declaration order
        axes.sort_by_key(|axis| match axis.priority {
            Some(p) => (0, p),
            None => (1, 0),
        });
        Ok(axes)
    }

    fn assemble(
        &self,
        name: impl Into<String>,
        axes: &[Axis],
        held: IndexMap<ParameterKey, f64>,
    ) -> AppResult<SweepPlan> {
        let total = axes.iter().map(Axis::len).product::<usize>();
        let mut steps = Vec::with_capacity(total);
        for index in 0..total {
            let mut targets = IndexMap::new();
            let mut stride = 1;
            for axis in axes {
                let position = (index / stride) % axis.len();
                for (key, points) in &axis.members {
                    targets.insert(key.clone(), points[position]);
                }
                stride *= axis.len();
            }
            steps.push(PlanStep { index, targets });
        }
        self.plan_from(name, steps, held)
    }

    fn plan_from(
        &self,
        name: impl Into<String>,
        steps: Vec<PlanStep>,
        held: IndexMap<ParameterKey, f64>,
    ) -> AppResult<SweepPlan> {
        let compensation = self
            .model
            .compensating()
            .into_iter()
            .filter_map(|spec| {
                spec.compensation().map(|c| CompensationRule {
                    key: spec.key().clone(),
                    baseline: c.baseline,
                    terms: c.terms.clone(),
                    limits: spec.limits(),
                })
            })
            .collect::<Vec<_>>();

        let swept = steps
            .first()
            .map(|s| s.targets.keys().collect::<Vec<_>>())
            .unwrap_or_default();
        let delay = self
            .model
            .specs()
            .filter(|s| swept.contains(&s.key()) || s.role().compensating())
            .map(ParameterSpec::delay)
            .fold(0.0, f64::max);

        let recorded = self
            .model
            .gettables()
            .into_iter()
            .map(|s| s.key().clone())
            .collect();

        Ok(SweepPlan::new(name, steps, compensation, held, recorded, delay))
    }

    fn check_static_limits(&self) -> AppResult<()> {
        for spec in self.model.statics() {
            if let Some(Value::Float(v)) = spec.value() {
                spec.check_value(*v)?;
            }
        }
        Ok(())
    }

    fn check_step_limits(&self, plan: &SweepPlan) -> AppResult<()> {
        for (key, value) in plan.held() {
            self.check_limit(key, *value)?;
        }
        for step in plan.steps() {
            for (key, value) in &step.targets {
                self.check_limit(key, *value)?;
            }
        }
        Ok(())
    }

    fn check_limit(&self, key: &ParameterKey, value: f64) -> AppResult<()> {
        match self.model.get(key) {
            Some(spec) => spec.check_value(value),
            None => Ok(()),
        }
    }
}

fn setpoints_of(spec: &ParameterSpec) -> AppResult<Vec<f64>> {
    spec.setpoints()
        .map(<[f64]>::to_vec)
        .ok_or_else(|| DaqError::MissingField {
            key: spec.key().clone(),
            field: "setpoints",
        })
}

/// Value a swept parameter is parked at while another one is swept.
fn held_value(spec: &ParameterSpec) -> AppResult<f64> {
    match spec.initial_value() {
        Some(Value::Float(v)) => Ok(v),
        Some(other) => Err(DaqError::InvalidParameter {
            key: spec.key().clone(),
            reason: format!("swept parameter has non-numeric value {other}"),
        }),
        None => Err(DaqError::MissingField {
            key: spec.key().clone(),
            field: "setpoints",
        }),
    }
}

/// First and last setpoint of the forward sweep (a backsweep tail is ignored).
pub(crate) fn sweep_endpoints(spec: &ParameterSpec) -> AppResult<(f64, f64)> {
    let points = setpoints_of(spec)?;
    let forward = spec.requested_points().unwrap_or(points.len()).min(points.len());
    match (points.first(), forward.checked_sub(1).and_then(|i| points.get(i))) {
        (Some(first), Some(last)) => Ok((*first, *last)),
        _ => Err(DaqError::MissingField {
            key: spec.key().clone(),
            field: "setpoints",
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model(yaml: &str) -> ParameterModel {
        ParameterModel::from_yaml_str(yaml).unwrap()
    }

    fn key(t: &str) -> ParameterKey {
        ParameterKey::new(t, "voltage")
    }

    #[test]
    fn linear_setpoints_edge_cases() {
        assert!(linear_setpoints(0.0, 1.0, 0).is_empty());
        assert_eq!(linear_setpoints(0.3, 1.0, 1), vec![0.3]);
        assert_eq!(linear_setpoints(1.0, 0.0, 3), vec![1.0, 0.5, 0.0]);
    }

    #[test]
    fn parallel_requires_equal_lengths() {
        let m = model(
            r#"
a:
  voltage: { type: dynamic, setpoints: [0, 1, 2] }
b:
  voltage: { type: dynamic, setpoints: [0, 1] }
"#,
        );
        match SweepBuilder::new(&m).build(SweepMode::Parallel) {
            Err(DaqError::SweepLengthMismatch {
                expected, found, ..
            }) => {
                assert_eq!(expected, 3);
                assert_eq!(found, 2);
            }
            other => panic!("expected SweepLengthMismatch, got {other:?}"),
        }
    }

    #[test]
    fn parallel_steps_move_together() {
        let m = model(
            r#"
a:
  voltage: { type: dynamic, setpoints: [0, 1, 2] }
b:
  voltage: { type: dynamic, start: 5, stop: 3, num_points: 3 }
"#,
        );
        let plans = SweepBuilder::new(&m).build(SweepMode::Parallel).unwrap();
        assert_eq!(plans.len(), 1);
        let step = &plans[0].steps()[1];
        assert_eq!(step.targets[&key("a")], 1.0);
        assert_eq!(step.targets[&key("b")], 4.0);
    }

    #[test]
    fn grid_first_declared_varies_fastest() {
        let m = model(
            r#"
a:
  voltage: { type: dynamic, setpoints: [0, 1] }
b:
  voltage: { type: dynamic, setpoints: [10, 20, 30] }
c:
  voltage: { type: dynamic, setpoints: [100, 200] }
"#,
        );
        let plan = SweepBuilder::new(&m)
            .build(SweepMode::Grid)
            .unwrap()
            .remove(0);
        assert_eq!(plan.len(), 2 * 3 * 2);

        let a = plan.steps().iter().map(|s| s.targets[&key("a")]).collect::<Vec<_>>();
        let b = plan.steps().iter().map(|s| s.targets[&key("b")]).collect::<Vec<_>>();
        let c = plan.steps().iter().map(|s| s.targets[&key("c")]).collect::<Vec<_>>();
        // a changes every step, b every 2, c every 6
        assert_eq!(&a[..4], &[0.0, 1.0, 0.0, 1.0]);
        assert_eq!(&b[..6], &[10.0, 10.0, 20.0, 20.0, 30.0, 30.0]);
        assert_eq!(c[5], 100.0);
        assert_eq!(c[6], 200.0);
    }

    #[test]
    fn grid_priority_reorders_axes() {
        let m = model(
            r#"
a:
  voltage: { type: dynamic, setpoints: [0, 1] }
b:
  voltage: { type: dynamic, setpoints: [10, 20], priority: 0 }
"#,
        );
        let plan = SweepBuilder::new(&m)
            .build(SweepMode::Grid)
            .unwrap()
            .remove(0);
        let b = plan.steps().iter().map(|s| s.targets[&key("b")]).collect::<Vec<_>>();
        assert_eq!(b, vec![10.0, 20.0, 10.0, 20.0]);
    }

    #[test]
    fn grouped_parameters_share_an_axis() {
        let m = model(
            r#"
a:
  voltage: { type: dynamic, setpoints: [0, 1, 2], group: 1 }
b:
  voltage: { type: dynamic, setpoints: [5, 6, 7], group: 1 }
c:
  voltage: { type: dynamic, setpoints: [0, 1] }
"#,
        );
        let plan = SweepBuilder::new(&m)
            .build(SweepMode::Grid)
            .unwrap()
            .remove(0);
        assert_eq!(plan.len(), 6);
        for step in plan.steps() {
            assert_eq!(step.targets[&key("b")] - step.targets[&key("a")], 5.0);
        }
    }

    #[test]
    fn sequential_holds_the_other_parameters() {
        let m = model(
            r#"
a:
  voltage: { type: dynamic, setpoints: [0, 1, 2] }
b:
  voltage: { type: dynamic, setpoints: [5, 6], value: 0.25 }
c:
  voltage: { type: dynamic, setpoints: [7, 8] }
"#,
        );
        let plans = SweepBuilder::new(&m).build(SweepMode::Sequential).unwrap();
        assert_eq!(plans.len(), 3);
        assert_eq!(plans[0].len(), 3);
        assert_eq!(plans[0].held()[&key("b")], 0.25);
        assert_eq!(plans[0].held()[&key("c")], 7.0);
        assert_eq!(plans[1].held()[&key("a")], 0.0);
        assert_eq!(plans[2].name(), "c.voltage");
    }

    #[test]
    fn compensation_end_value_matches_leverarm() {
        let m = model(
            r#"
plunger:
  voltage: { type: dynamic, start: -0.1, stop: 0.4, num_points: 6 }
sensor:
  voltage:
    type: compensating
    value: 0.8
    leverarms: [0.3]
    compensated_targets: [{ terminal: plunger, parameter: voltage }]
"#,
        );
        let plan = SweepBuilder::new(&m)
            .build(SweepMode::Parallel)
            .unwrap()
            .remove(0);
        let last = plan.steps().last().cloned().unwrap();
        let value = plan.targets_at(&last)[&key("sensor")];
        assert!((value - (0.8 - 0.3 * (0.4 - -0.1))).abs() < 1e-9);
    }

    #[test]
    fn compensation_out_of_limits_fails_before_execution() {
        let m = model(
            r#"
plunger:
  voltage: { type: dynamic, start: 0, stop: 2, num_points: 3 }
sensor:
  voltage:
    type: compensating
    value: 0.0
    limits: [-1.0, 1.0]
    leverarms: [1.0]
    compensated_targets: [{ terminal: plunger, parameter: voltage }]
"#,
        );
        assert!(matches!(
            SweepBuilder::new(&m).build(SweepMode::Grid),
            Err(DaqError::CompensationLimitExceeded { step: 2, .. })
        ));
    }

    #[test]
    fn setpoints_outside_limits_are_rejected() {
        let m = model(
            "gate:\n  voltage: { type: dynamic, setpoints: [0, 1, 3], limits: [-2, 2] }\n",
        );
        assert!(matches!(
            SweepBuilder::new(&m).build(SweepMode::Grid),
            Err(DaqError::LimitViolation { value, .. }) if value == 3.0
        ));
    }

    #[test]
    fn large_grid_warns_without_blocking() {
        let m = model(
            r#"
a:
  voltage: { type: dynamic, start: 0, stop: 1, num_points: 50 }
b:
  voltage: { type: dynamic, start: 0, stop: 1, num_points: 50 }
"#,
        );
        let plan = SweepBuilder::new(&m)
            .with_grid_warning_threshold(1000)
            .build(SweepMode::Grid)
            .unwrap()
            .remove(0);
        assert_eq!(plan.len(), 2500);
        assert!(matches!(
            plan.warnings(),
            [MeasurementWarning::LargeGrid { steps: 2500, .. }]
        ));
    }

    #[test]
    fn no_swept_parameters_gives_a_single_point() {
        let m = model("ohmic:\n  current: { type: gettable }\n");
        let plan = SweepBuilder::new(&m)
            .build(SweepMode::Grid)
            .unwrap()
            .remove(0);
        assert_eq!(plan.len(), 1);
        assert_eq!(plan.recorded(), &[ParameterKey::new("ohmic", "current")]);
    }

    #[test]
    fn sweep_mode_parses_case_insensitively() {
        assert_eq!("Grid".parse::<SweepMode>().unwrap(), SweepMode::Grid);
        assert!("spiral".parse::<SweepMode>().is_err());
    }
}
