//! Break conditions and the backsweep state machine.
//!
//! A break condition is a per-step predicate over a recorded reading, written
//! as `"val <comparator> <threshold>"` with one of `<`, `>` or `=` (`==` is
//! accepted as well). The conditions of one parameter are combined with OR.
//!
//! ```text
//!            trigger, backsweep          retrace done
//! Running ─────────────────────> Backsweeping ─────────> Finished
//!    │  \
//!    │   \ trigger, no backsweep
//!    │    └────────────────────> Aborted
//!    └── plan done ─────────────────────────────────────> Finished
//! ```
//!
//! Break checks are disarmed while backsweeping. The retrace is only
//! guaranteed to be safe for signals that are monotonic in the swept
//! parameter.

use indexmap::IndexMap;
use std::fmt;

use crate::error::{AppResult, DaqError};
use crate::parameter::{ParameterKey, ParameterModel, ParameterSpec, Value};

/// Comparison operator of a break condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparator {
    /// `val < threshold`
    Less,
    /// `val > threshold`
    Greater,
    /// `val = threshold`
    Equal,
}

impl fmt::Display for Comparator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Comparator::Less => write!(f, "<"),
            Comparator::Greater => write!(f, ">"),
            Comparator::Equal => write!(f, "="),
        }
    }
}

/// A parsed break condition.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BreakCondition {
    /// Operator
    pub comparator: Comparator,
    /// Right-hand side
    pub threshold: f64,
}

impl BreakCondition {
    /// Parse `"val > 0.95"`. Exactly one comparator is allowed.
    pub fn parse(condition: &str) -> AppResult<Self> {
        let invalid = |reason: &str| DaqError::InvalidBreakCondition {
            condition: condition.to_string(),
            reason: reason.to_string(),
        };

        let rest = condition
            .trim()
            .strip_prefix("val")
            .ok_or_else(|| invalid("must start with 'val'"))?
            .trim_start();

        let (comparator, rest) = if let Some(rest) = rest.strip_prefix("==") {
            (Comparator::Equal, rest)
        } else if let Some(rest) = rest.strip_prefix('=') {
            (Comparator::Equal, rest)
        } else if let Some(rest) = rest.strip_prefix('<') {
            (Comparator::Less, rest)
        } else if let Some(rest) = rest.strip_prefix('>') {
            (Comparator::Greater, rest)
        } else {
            return Err(invalid("expected one of <, >, ="));
        };

        let rest = rest.trim();
        if rest.contains(['<', '>', '=']) {
            return Err(invalid("exactly one comparator per condition"));
        }
        let threshold = rest
            .parse::<f64>()
            .map_err(|_| invalid("threshold is not a number"))?;
        if threshold.is_nan() {
            return Err(invalid("threshold is NaN"));
        }
        Ok(Self {
            comparator,
            threshold,
        })
    }

    /// True if `reading` satisfies the condition.
    pub fn is_met(&self, reading: f64) -> bool {
        match self.comparator {
            Comparator::Less => reading < self.threshold,
            Comparator::Greater => reading > self.threshold,
            Comparator::Equal => {
                (reading - self.threshold).abs() <= 1e-12 * self.threshold.abs().max(1.0)
            }
        }
    }
}

impl fmt::Display for BreakCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "val {} {}", self.comparator, self.threshold)
    }
}

/// Evaluator lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvaluatorState {
    /// Checking every step
    Running,
    /// A condition was met; transient before the policy is applied
    BreakTriggered,
    /// Retracing visited steps, checks disarmed
    Backsweeping,
    /// Plan (or retrace) completed
    Finished,
    /// Stopped by a break condition
    Aborted,
}

impl fmt::Display for EvaluatorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EvaluatorState::Running => write!(f, "running"),
            EvaluatorState::BreakTriggered => write!(f, "break-triggered"),
            EvaluatorState::Backsweeping => write!(f, "backsweeping"),
            EvaluatorState::Finished => write!(f, "finished"),
            EvaluatorState::Aborted => write!(f, "aborted"),
        }
    }
}

/// Outcome of checking one step's readings.
#[derive(Debug, Clone, PartialEq)]
pub enum BreakVerdict {
    /// Keep going
    Continue,
    /// Abort the run
    Break {
        /// Parameter whose condition was met
        key: ParameterKey,
        /// The reading
        reading: f64,
    },
    /// Retrace the visited steps
    BacksweepRequested {
        /// Parameter whose condition was met
        key: ParameterKey,
        /// The reading
        reading: f64,
    },
}

/// Watches recorded parameters for their break conditions.
#[derive(Debug, Clone)]
pub struct BreakConditionEvaluator {
    watched: Vec<(ParameterKey, Vec<BreakCondition>)>,
    backsweep: bool,
    state: EvaluatorState,
}

impl BreakConditionEvaluator {
    /// Collect the break conditions of every recorded parameter in `model`.
    pub fn new(model: &ParameterModel, backsweep: bool) -> Self {
        let watched = model
            .gettables()
            .into_iter()
            .filter(|s| !s.break_conditions().is_empty())
            .map(|s| (s.key().clone(), s.break_conditions().to_vec()))
            .collect();
        Self {
            watched,
            backsweep,
            state: EvaluatorState::Running,
        }
    }

    /// True if any condition of `spec` is met by `reading`.
    pub fn evaluate(reading: f64, spec: &ParameterSpec) -> bool {
        spec.break_conditions().iter().any(|c| c.is_met(reading))
    }

    /// Current state.
    pub fn state(&self) -> EvaluatorState {
        self.state
    }

    /// True if any parameter carries break conditions.
    pub fn is_armed(&self) -> bool {
        !self.watched.is_empty()
    }

    /// Check one step's readings and apply the policy.
    pub fn check(&mut self, readings: &IndexMap<ParameterKey, Value>) -> BreakVerdict {
        if self.state != EvaluatorState::Running {
            return BreakVerdict::Continue;
        }

        let hit = self.watched.iter().find_map(|(key, conditions)| {
            let reading = readings.get(key)?.as_f64()?;
            conditions
                .iter()
                .any(|c| c.is_met(reading))
                .then(|| (key.clone(), reading))
        });
        let Some((key, reading)) = hit else {
            return BreakVerdict::Continue;
        };

        self.state = EvaluatorState::BreakTriggered;
        tracing::warn!(%key, reading, backsweep = self.backsweep, "Break condition triggered");
        if self.backsweep {
            self.state = EvaluatorState::Backsweeping;
            BreakVerdict::BacksweepRequested { key, reading }
        } else {
            self.state = EvaluatorState::Aborted;
            BreakVerdict::Break { key, reading }
        }
    }

    /// Mark the plan (or the retrace) as completed.
    pub fn finish(&mut self) {
        if matches!(
            self.state,
            EvaluatorState::Running | EvaluatorState::Backsweeping
        ) {
            self.state = EvaluatorState::Finished;
        }
    }

    /// Arm again for the next sub-plan.
    pub fn rearm(&mut self) {
        self.state = EvaluatorState::Running;
    }
}

/// Buffered acquisition cannot evaluate break conditions mid-burst.
pub fn ensure_unbuffered_compatible(model: &ParameterModel) -> AppResult<()> {
    match model
        .gettables()
        .into_iter()
        .find(|s| !s.break_conditions().is_empty())
    {
        Some(spec) => Err(DaqError::UnsupportedInBufferedMode {
            key: spec.key().clone(),
        }),
        None => Ok(()),
    }
}
