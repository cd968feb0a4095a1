//! Sweep plans: ordered setpoint steps with a cursor.
//!
//! A [`SweepPlan`] is built once per run by
//! [`SweepBuilder`](super::sweep::SweepBuilder) and then walked by the
//! orchestrator. Each step holds the target of every swept parameter.
//! Compensation targets are not stored; they are computed from the step and
//! the plan origin whenever a step is executed, so they always follow the
//! swept targets they compensate.
//!
//! The plan is immutable once execution starts, except that a backsweep
//! replaces the remaining steps with a retrace of the visited ones:
//!
//! ```text
//! order:   0 1 2 3 4 5        break after step 3
//!          ^^^^^^^ visited
//! retrace: 3 2 1 0
//! ```

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{AppResult, DaqError};
use crate::parameter::{Limits, ParameterKey};
use crate::warning::MeasurementWarning;

/// Target values of the swept parameters at one step.
#[derive(Debug, Clone, PartialEq)]
pub struct PlanStep {
    /// Index of the step in build order
    pub index: usize,
    /// Swept parameter targets
    pub targets: IndexMap<ParameterKey, f64>,
}

/// Direction in which the plan is being walked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SweepDirection {
    /// Build order
    Forward,
    /// Retrace after a break condition
    Backward,
}

/// Timing of a timetrace plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timetrace {
    /// Recording stops once this much time has elapsed
    pub duration: Duration,
    /// Wait after each reading
    pub timestep: Duration,
}

/// Linear compensation rule evaluated at every step.
#[derive(Debug, Clone, PartialEq)]
pub struct CompensationRule {
    /// Compensating parameter
    pub key: ParameterKey,
    /// Baseline value
    pub baseline: f64,
    /// `(target, leverarm)` pairs
    pub terms: Vec<(ParameterKey, f64)>,
    /// Limits of the compensating parameter
    pub limits: Option<Limits>,
}

impl CompensationRule {
    /// `baseline - sum(leverarm * (target[i] - target[origin]))`.
    ///
    /// Targets not swept by the plan do not move and contribute nothing.
    pub fn value_at(&self, step: &PlanStep, origin: &PlanStep) -> f64 {
        let displacement: f64 = self
            .terms
            .iter()
            .filter_map(|(target, leverarm)| {
                let now = step.targets.get(target)?;
                let start = origin.targets.get(target)?;
                Some(leverarm * (now - start))
            })
            .sum();
        self.baseline - displacement
    }
}

/// Ordered sweep steps plus everything needed to execute them.
#[derive(Debug, Clone)]
pub struct SweepPlan {
    name: String,
    steps: Vec<PlanStep>,
    compensation: Vec<CompensationRule>,
    held: IndexMap<ParameterKey, f64>,
    recorded: Vec<ParameterKey>,
    delay: f64,
    warnings: Vec<MeasurementWarning>,
    timetrace: Option<Timetrace>,
    order: Vec<usize>,
    cursor: usize,
    direction: SweepDirection,
}

impl SweepPlan {
    pub(crate) fn new(
        name: impl Into<String>,
        steps: Vec<PlanStep>,
        compensation: Vec<CompensationRule>,
        held: IndexMap<ParameterKey, f64>,
        recorded: Vec<ParameterKey>,
        delay: f64,
    ) -> Self {
        let order = (0..steps.len()).collect();
        Self {
            name: name.into(),
            steps,
            compensation,
            held,
            recorded,
            delay,
            warnings: Vec::new(),
            timetrace: None,
            order,
            cursor: 0,
            direction: SweepDirection::Forward,
        }
    }

    pub(crate) fn push_warning(&mut self, warning: MeasurementWarning) {
        warning.log();
        self.warnings.push(warning);
    }

    /// Sample `key` at every step as well, unless it already is.
    pub(crate) fn record_also(&mut self, key: ParameterKey) {
        if !self.recorded.contains(&key) {
            self.recorded.push(key);
        }
    }

    pub(crate) fn set_timetrace(&mut self, timetrace: Timetrace) {
        self.timetrace = Some(timetrace);
    }

    /// Timing if this plan is a timetrace rather than a sweep.
    pub fn timetrace(&self) -> Option<Timetrace> {
        self.timetrace
    }

    /// Plan name (the swept parameter, or the geometry).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of steps in build order.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// True if the plan has no steps.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Steps in build order.
    pub fn steps(&self) -> &[PlanStep] {
        &self.steps
    }

    /// Step by build index.
    pub fn step(&self, index: usize) -> Option<&PlanStep> {
        self.steps.get(index)
    }

    /// Parameters sampled at each step.
    pub fn recorded(&self) -> &[ParameterKey] {
        &self.recorded
    }

    /// Swept parameters held constant in this plan (sequential mode).
    pub fn held(&self) -> &IndexMap<ParameterKey, f64> {
        &self.held
    }

    /// Compensation rules.
    pub fn compensation(&self) -> &[CompensationRule] {
        &self.compensation
    }

    /// Seconds to wait after setting each step's targets.
    pub fn delay(&self) -> f64 {
        self.delay
    }

    /// Warnings produced while building the plan.
    pub fn warnings(&self) -> &[MeasurementWarning] {
        &self.warnings
    }

    /// Current walking direction.
    pub fn direction(&self) -> SweepDirection {
        self.direction
    }

    /// Every commanded target at `step`: swept targets followed by
    /// compensation values.
    pub fn targets_at(&self, step: &PlanStep) -> IndexMap<ParameterKey, f64> {
        let mut targets = step.targets.clone();
        if let Some(origin) = self.steps.first() {
            for rule in &self.compensation {
                targets.insert(rule.key.clone(), rule.value_at(step, origin));
            }
        }
        targets
    }

    /// Targets the device is brought to before the first step: held values,
    /// the first step's targets and compensation baselines.
    pub fn initial_targets(&self) -> IndexMap<ParameterKey, f64> {
        let mut targets = self.held.clone();
        match self.steps.first() {
            Some(first) => targets.extend(self.targets_at(first)),
            None => {
                for rule in &self.compensation {
                    targets.insert(rule.key.clone(), rule.baseline);
                }
            }
        }
        targets
    }

    /// Targets of the last step in build order.
    pub fn final_targets(&self) -> IndexMap<ParameterKey, f64> {
        self.steps
            .last()
            .map(|last| self.targets_at(last))
            .unwrap_or_default()
    }

    /// Check every compensation value against its limits.
    pub fn validate_compensation(&self) -> AppResult<()> {
        let Some(origin) = self.steps.first() else {
            return Ok(());
        };
        for rule in &self.compensation {
            let Some(limits) = rule.limits else {
                continue;
            };
            for step in &self.steps {
                let value = rule.value_at(step, origin);
                if !limits.contains(value) {
                    return Err(DaqError::CompensationLimitExceeded {
                        key: rule.key.clone(),
                        step: step.index,
                        value,
                        min: limits.min,
                        max: limits.max,
                    });
                }
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Cursor
    // ------------------------------------------------------------------

    /// Advance the cursor and return the next step.
    pub fn next_step(&mut self) -> Option<PlanStep> {
        let index = *self.order.get(self.cursor)?;
        self.cursor += 1;
        self.steps.get(index).cloned()
    }

    /// Build indices still to be executed.
    pub fn remaining(&self) -> &[usize] {
        self.order.get(self.cursor..).unwrap_or_default()
    }

    /// Build indices already executed in this pass.
    pub fn visited(&self) -> &[usize] {
        &self.order[..self.cursor.min(self.order.len())]
    }

    /// Replace the remaining steps by a retrace of the visited ones, last
    /// visited first, down to the sweep's starting point.
    pub fn retrace(&mut self) {
        let retrace = self.visited().iter().rev().copied().collect::<Vec<_>>();
        self.order = retrace;
        self.cursor = 0;
        self.direction = SweepDirection::Backward;
    }

    /// Rewind the cursor to the start of the build order.
    pub fn rewind(&mut self) {
        self.order = (0..self.steps.len()).collect();
        self.cursor = 0;
        self.direction = SweepDirection::Forward;
    }
}
