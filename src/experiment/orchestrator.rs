//! Measurement orchestrator.
//!
//! The orchestrator owns one run end to end: it checks that the plans can be
//! executed with the registered channels, brings every settable parameter to
//! its starting value, walks the plan, writes one record per step (or per
//! buffered sample) to the data sink, and finally restores the pre-run
//! values. Reset runs whether the run succeeded or not.
//!
//! # Architecture
//!
//! ```text
//! ParameterModel ─> SweepBuilder ─> SweepPlan ─┐
//!                                              ├─> MeasurementOrchestrator ─> DataSink
//! ChannelRegistry ─────────────────────────────┘          │
//!                                                         └─> BreakConditionEvaluator
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! let plans = SweepBuilder::new(&model).build(SweepMode::Grid)?;
//! let mut orchestrator = MeasurementOrchestrator::new(model, registry, settings, MemorySink::new());
//! let summary = orchestrator.execute(plans, RunMode::Unbuffered).await?;
//! println!("{} records", summary.records);
//! ```

use chrono::Utc;
use futures::future::try_join_all;
use indexmap::IndexMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::buffer::BufferConfig;
use crate::config::{seconds, Settings};
use crate::data::{DataSink, MeasurementRecord};
use crate::error::{AppResult, DaqError};
use crate::experiment::break_condition::{
    ensure_unbuffered_compatible, BreakConditionEvaluator, BreakVerdict,
};
use crate::experiment::plan::{SweepDirection, SweepPlan, Timetrace};
use crate::experiment::state::{OrchestratorState, RunSummary, StateTransition};
use crate::hardware::capabilities::{BufferAdapter, RampSpeed, Sample, TriggerAdapter};
use crate::hardware::monitor::ParameterMonitor;
use crate::hardware::ramp::ramp_or_set;
use crate::hardware::registry::{Channel, ChannelRegistry};
use crate::parameter::{ParameterKey, ParameterModel, Value};
use crate::warning::MeasurementWarning;

/// Cancellation request, honored only between steps.
///
/// A step that has started (sets, delay, reads) always completes, so no
/// output is left at an undefined level.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    flag: Arc<AtomicBool>,
}

impl CancelHandle {
    /// Request cancellation.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// True once cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    fn clear(&self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

/// Hardware taking part in a buffered burst.
#[derive(Clone)]
pub struct BufferedAcquisition {
    /// Buffered instrument
    pub buffer: Arc<dyn BufferAdapter>,
    /// Instrument whose trigger input starts the burst
    pub trigger: Option<Arc<dyn TriggerAdapter>>,
    /// Trigger input to select (`None` for free running)
    pub trigger_input: Option<String>,
    /// Resolved buffer configuration
    pub config: BufferConfig,
}

impl BufferedAcquisition {
    /// Burst on `buffer` without trigger selection.
    pub fn new(buffer: Arc<dyn BufferAdapter>, config: BufferConfig) -> Self {
        Self {
            buffer,
            trigger: None,
            trigger_input: None,
            config,
        }
    }

    /// Select `input` on `trigger` before the burst.
    pub fn with_trigger(mut self, trigger: Arc<dyn TriggerAdapter>, input: Option<String>) -> Self {
        self.trigger = Some(trigger);
        self.trigger_input = input;
        self
    }
}

impl fmt::Debug for BufferedAcquisition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferedAcquisition")
            .field("config", &self.config)
            .field("trigger_input", &self.trigger_input)
            .field("has_trigger", &self.trigger.is_some())
            .finish()
    }
}

/// How readings are acquired.
#[derive(Debug, Clone)]
pub enum RunMode {
    /// One `get` per recorded parameter per step
    Unbuffered,
    /// Hardware ramp across the sweep while the buffer samples
    Buffered(BufferedAcquisition),
}

impl RunMode {
    fn name(&self) -> &'static str {
        match self {
            RunMode::Unbuffered => "unbuffered",
            RunMode::Buffered(_) => "buffered",
        }
    }
}

/// Drives the device through sweep plans.
pub struct MeasurementOrchestrator {
    model: ParameterModel,
    registry: ChannelRegistry,
    settings: Settings,
    sink: Box<dyn DataSink>,
    state: OrchestratorState,
    history: Vec<StateTransition>,
    pre_run: IndexMap<ParameterKey, Value>,
    cancel: CancelHandle,
    warnings: Vec<MeasurementWarning>,
    run_id: Uuid,
    records: usize,
    backsweeps: usize,
}

impl MeasurementOrchestrator {
    /// Create an idle orchestrator.
    pub fn new(
        model: ParameterModel,
        registry: ChannelRegistry,
        settings: Settings,
        sink: impl DataSink + 'static,
    ) -> Self {
        Self {
            model,
            registry,
            settings,
            sink: Box::new(sink),
            state: OrchestratorState::Idle,
            history: Vec::new(),
            pre_run: IndexMap::new(),
            cancel: CancelHandle::default(),
            warnings: Vec::new(),
            run_id: Uuid::nil(),
            records: 0,
            backsweeps: 0,
        }
    }

    /// Current state.
    pub fn state(&self) -> OrchestratorState {
        self.state
    }

    /// State changes of the current (or last) run.
    pub fn history(&self) -> &[StateTransition] {
        &self.history
    }

    /// Parameter model the orchestrator runs against.
    pub fn model(&self) -> &ParameterModel {
        &self.model
    }

    /// Registered channels.
    pub fn registry(&self) -> &ChannelRegistry {
        &self.registry
    }

    /// Handle for cancelling the run from another task.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Warnings collected in the current (or last) run.
    pub fn warnings(&self) -> &[MeasurementWarning] {
        &self.warnings
    }

    /// Values captured before the run, restored by [`reset`](Self::reset).
    pub fn pre_run_values(&self) -> &IndexMap<ParameterKey, Value> {
        &self.pre_run
    }

    /// Start a read-only monitor of every mapped parameter in the model.
    pub fn spawn_monitor(&self) -> AppResult<ParameterMonitor> {
        self.settings.check()?;
        let keys = self.model.specs().map(|s| s.key()).collect::<Vec<_>>();
        Ok(ParameterMonitor::spawn(
            self.registry.snapshot(keys),
            self.settings.monitor_interval(),
            256,
        ))
    }

    fn transition(&mut self, to: OrchestratorState) {
        debug!(from = %self.state, to = %to, "Orchestrator state change");
        self.history.push(StateTransition {
            from: self.state,
            to,
            at: Utc::now(),
        });
        self.state = to;
    }

    // ------------------------------------------------------------------
    // Setup checks
    // ------------------------------------------------------------------

    /// Check that `plans` can run in `mode` with the registered channels.
    ///
    /// Nothing is sent to any instrument.
    pub fn check_setup(&self, plans: &[SweepPlan], mode: &RunMode) -> AppResult<()> {
        for spec in self.model.specs() {
            let role = spec.role();
            if !role.settable() && !role.recorded() {
                continue;
            }
            let channel = lookup(&self.registry, spec.key())?;
            if role.settable() && !channel.can_set() {
                return Err(DaqError::NotSettable {
                    key: spec.key().clone(),
                });
            }
        }

        for plan in plans {
            for key in commanded_keys(plan) {
                if self.model.get(&key).is_some_and(|s| s.locked()) {
                    return Err(DaqError::LockedParameter { key });
                }
            }
        }

        if let RunMode::Buffered(acquisition) = mode {
            ensure_unbuffered_compatible(&self.model)?;
            if let Some(plan) = plans.iter().find(|p| p.timetrace().is_some()) {
                return Err(DaqError::Configuration(format!(
                    "plan '{}' is an unbuffered timetrace; build a buffered plan instead",
                    plan.name()
                )));
            }

            let config = &acquisition.config;
            let limit = acquisition.buffer.capacity_limit();
            if config.num_points > limit {
                return Err(DaqError::BufferCapacityExceeded {
                    requested: config.num_points,
                    limit,
                });
            }

            for plan in plans {
                if plan.len() != config.num_points {
                    return Err(DaqError::Configuration(format!(
                        "buffered plan '{}' has {} steps but the buffer acquires {} points",
                        plan.name(),
                        plan.len(),
                        config.num_points
                    )));
                }
                let swept = plan
                    .steps()
                    .first()
                    .map(|s| s.targets.keys().cloned().collect::<Vec<_>>())
                    .unwrap_or_default();
                let compensating = plan.compensation().iter().map(|r| r.key.clone());
                for key in swept.into_iter().chain(compensating) {
                    if !self.registry.get(&key).is_some_and(Channel::can_ramp) {
                        return Err(DaqError::MissingRampCapability { key });
                    }
                }
            }

            if let (Some(trigger), Some(input)) = (&acquisition.trigger, &acquisition.trigger_input) {
                let available = trigger.available_trigger_inputs();
                if !available.iter().any(|i| i == input) {
                    return Err(DaqError::InvalidBufferSetting(format!(
                        "trigger input '{input}' is not one of {available:?}"
                    )));
                }
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Bring every settable parameter to its starting value for `plan`:
    /// static values, held values, the first step's targets and the
    /// compensation baselines.
    ///
    /// The first call of a run captures the pre-run values used by
    /// [`reset`](Self::reset). Locked parameters are never written; if one
    /// is not already at its target this fails with `LockedParameter`.
    #[instrument(skip(self, plan), fields(plan = %plan.name()), err)]
    pub async fn initialize(&mut self, plan: &SweepPlan) -> AppResult<()> {
        if matches!(
            self.state,
            OrchestratorState::Finished | OrchestratorState::Aborted
        ) {
            return Err(DaqError::InvalidState {
                operation: "initialize",
                state: self.state.to_string(),
            });
        }
        self.transition(OrchestratorState::Initializing);

        if self.pre_run.is_empty() {
            self.capture_pre_run().await?;
        }

        let mut targets: IndexMap<ParameterKey, Value> = self
            .model
            .statics()
            .into_iter()
            .filter_map(|s| s.value().map(|v| (s.key().clone(), v.clone())))
            .collect();
        targets.extend(
            plan.initial_targets()
                .into_iter()
                .map(|(k, v)| (k, Value::Float(v))),
        );

        for (key, target) in &targets {
            self.bring_to(key, target).await?;
        }

        let wait = self.settings.wait_time()?;
        if !wait.is_zero() {
            debug!(?wait, "Waiting after initialization");
            sleep(wait).await;
        }
        Ok(())
    }

    /// Execute `plan`. Returns the number of records written.
    ///
    /// Must follow [`initialize`](Self::initialize).
    #[instrument(skip(self, plan, mode), fields(plan = %plan.name(), mode = mode.name()), err)]
    pub async fn run(&mut self, plan: &mut SweepPlan, mode: &RunMode) -> AppResult<usize> {
        if !self.state.can_run() {
            return Err(DaqError::InvalidState {
                operation: "run",
                state: self.state.to_string(),
            });
        }
        self.transition(OrchestratorState::Running);
        match mode {
            RunMode::Unbuffered => match plan.timetrace() {
                Some(timetrace) => self.run_timetrace(plan, timetrace).await,
                None => self.run_unbuffered(plan).await,
            },
            RunMode::Buffered(acquisition) => self.run_buffered(plan, acquisition).await,
        }
    }

    /// Ramp every parameter back to its pre-run value.
    ///
    /// All parameters are attempted even if one fails; the first failure is
    /// returned.
    #[instrument(skip(self), err)]
    pub async fn reset(&mut self) -> AppResult<()> {
        let restored = self.restore().await;
        self.pre_run.clear();
        self.transition(OrchestratorState::Reset);
        restored
    }

    /// Check, initialize, run every plan, and reset.
    ///
    /// Invalid settings and failed setup checks return before any instrument
    /// is touched. Sequential sub-plans start from the pre-run values. Reset
    /// always runs once setup checks pass; if both the run and the reset
    /// fail, the run error is returned and the reset error is logged.
    #[instrument(skip_all, fields(plans = plans.len(), mode = mode.name()), err)]
    pub async fn execute(&mut self, mut plans: Vec<SweepPlan>, mode: RunMode) -> AppResult<RunSummary> {
        if !self.state.can_begin() {
            return Err(DaqError::InvalidState {
                operation: "execute",
                state: self.state.to_string(),
            });
        }
        self.settings.check()?;
        self.check_setup(&plans, &mode)?;

        self.history.clear();
        self.pre_run.clear();
        self.cancel.clear();
        self.run_id = Uuid::new_v4();
        self.records = 0;
        self.backsweeps = 0;
        self.warnings = plans
            .iter()
            .flat_map(|p| p.warnings().iter().cloned())
            .collect();
        let started = Utc::now();
        info!(run_id = %self.run_id, "Starting measurement");

        let outcome = self.execute_plans(&mut plans, &mode).await;
        match &outcome {
            Ok(()) => self.transition(OrchestratorState::Finished),
            Err(e) => {
                warn!(error = %e, category = ?e.category(), "Measurement aborted");
                self.transition(OrchestratorState::Aborted);
            }
        }

        let reset = self.reset().await;
        let flushed = self.sink.flush().await;

        match outcome {
            Ok(()) => {
                reset?;
                flushed?;
                let summary = RunSummary {
                    run_id: self.run_id,
                    plans: plans.len(),
                    records: self.records,
                    backsweeps: self.backsweeps,
                    warnings: self.warnings.clone(),
                    started,
                    finished: Utc::now(),
                };
                info!(
                    run_id = %summary.run_id,
                    records = summary.records,
                    backsweeps = summary.backsweeps,
                    "Measurement finished"
                );
                Ok(summary)
            }
            Err(e) => {
                if let Err(reset_err) = reset {
                    error!(error = %reset_err, "Reset after failed run also failed");
                }
                if let Err(flush_err) = flushed {
                    error!(error = %flush_err, "Flushing data sink failed");
                }
                Err(e)
            }
        }
    }

    async fn execute_plans(&mut self, plans: &mut [SweepPlan], mode: &RunMode) -> AppResult<()> {
        for (i, plan) in plans.iter_mut().enumerate() {
            if i > 0 {
                debug!(plan = %plan.name(), "Restoring pre-run values before next sub-plan");
                self.restore().await?;
            }
            self.initialize(plan).await?;
            let written = self.run(plan, mode).await?;
            info!(plan = %plan.name(), records = written, "Plan completed");
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Unbuffered
    // ------------------------------------------------------------------

    async fn run_unbuffered(&mut self, plan: &mut SweepPlan) -> AppResult<usize> {
        let mut evaluator =
            BreakConditionEvaluator::new(&self.model, self.settings.backsweep_after_break);
        let delay = seconds("delay", plan.delay())?;
        let wait_after_break = self.settings.wait_after_break()?;
        let recorded = plan.recorded().to_vec();
        let mut written = 0;

        while let Some(step) = plan.next_step() {
            if self.cancel.is_cancelled() {
                warn!(step = step.index, "Measurement cancelled");
                return Err(DaqError::Cancelled { step: step.index });
            }

            let targets = plan.targets_at(&step);
            for (key, value) in &targets {
                self.command(key, *value).await?;
            }
            if !delay.is_zero() {
                sleep(delay).await;
            }
            let readings = self.read_all(&recorded).await?;
            let verdict = evaluator.check(&readings);

            let setpoints = targets
                .into_iter()
                .map(|(k, v)| (k, Value::Float(v)))
                .collect();
            self.emit(plan.name(), step.index, plan.direction(), setpoints, readings)
                .await?;
            written += 1;

            match verdict {
                BreakVerdict::Continue => {}
                BreakVerdict::BacksweepRequested { key, reading } => {
                    if !wait_after_break.is_zero() {
                        debug!(?wait_after_break, "Waiting before the retrace");
                        sleep(wait_after_break).await;
                    }
                    info!(%key, reading, step = step.index, "Retracing visited setpoints");
                    plan.retrace();
                    self.backsweeps += 1;
                }
                BreakVerdict::Break { key, reading } => {
                    return Err(DaqError::BreakConditionTriggered {
                        key,
                        reading,
                        step: step.index,
                    });
                }
            }
        }

        evaluator.finish();
        debug!(evaluator = %evaluator.state(), records = written, "Plan walked");
        Ok(written)
    }

    /// Read the recorded parameters every timestep until the duration has
    /// elapsed. A met break condition ends the trace with an error; there is
    /// nothing to retrace.
    async fn run_timetrace(&mut self, plan: &SweepPlan, timetrace: Timetrace) -> AppResult<usize> {
        let mut evaluator = BreakConditionEvaluator::new(&self.model, false);
        let recorded = plan.recorded().to_vec();
        let setpoints = plan
            .initial_targets()
            .into_iter()
            .map(|(k, v)| (k, Value::Float(v)))
            .collect::<IndexMap<_, _>>();
        let started = Instant::now();
        let mut written = 0;

        while started.elapsed() < timetrace.duration {
            if self.cancel.is_cancelled() {
                warn!(step = written, "Timetrace cancelled");
                return Err(DaqError::Cancelled { step: written });
            }
            let readings = self.read_all(&recorded).await?;
            let verdict = evaluator.check(&readings);
            self.emit(
                plan.name(),
                written,
                SweepDirection::Forward,
                setpoints.clone(),
                readings,
            )
            .await?;
            written += 1;

            match verdict {
                BreakVerdict::Continue => {}
                BreakVerdict::Break { key, reading }
                | BreakVerdict::BacksweepRequested { key, reading } => {
                    return Err(DaqError::BreakConditionTriggered {
                        key,
                        reading,
                        step: written - 1,
                    });
                }
            }
            sleep(timetrace.timestep).await;
        }

        evaluator.finish();
        debug!(records = written, elapsed = ?started.elapsed(), "Timetrace complete");
        Ok(written)
    }

    async fn command(&self, key: &ParameterKey, value: f64) -> AppResult<()> {
        if let Some(spec) = self.model.get(key) {
            if spec.locked() {
                return Err(DaqError::LockedParameter { key: key.clone() });
            }
            spec.check_value(value)?;
        }
        lookup(&self.registry, key)?
            .set(Value::Float(value))
            .await
            .map_err(|e| DaqError::instrument(key, e))
    }

    async fn read_all(&self, keys: &[ParameterKey]) -> AppResult<IndexMap<ParameterKey, Value>> {
        let mut readings = IndexMap::with_capacity(keys.len());
        for key in keys {
            let value = lookup(&self.registry, key)?
                .get()
                .await
                .map_err(|e| DaqError::instrument(key, e))?;
            readings.insert(key.clone(), value);
        }
        Ok(readings)
    }

    // ------------------------------------------------------------------
    // Buffered
    // ------------------------------------------------------------------

    async fn run_buffered(
        &mut self,
        plan: &SweepPlan,
        acquisition: &BufferedAcquisition,
    ) -> AppResult<usize> {
        if self.cancel.is_cancelled() {
            return Err(DaqError::Cancelled { step: 0 });
        }

        let config = &acquisition.config;
        let buffer = &acquisition.buffer;
        buffer
            .configure(config)
            .await
            .map_err(|e| DaqError::instrument("buffer", e))?;

        if let Some(trigger) = &acquisition.trigger {
            let forced = trigger
                .set_trigger(acquisition.trigger_input.as_deref())
                .await
                .map_err(|e| DaqError::instrument("trigger", e))?;
            if let Some(forced) = forced.filter(|m| *m != config.trigger_mode) {
                let warning = MeasurementWarning::TriggerModeForced {
                    requested: config.trigger_mode,
                    forced,
                };
                warning.log();
                self.warnings.push(warning);
            }
        }

        buffer
            .subscribe(plan.recorded())
            .await
            .map_err(|e| DaqError::instrument("buffer", e))?;
        buffer
            .start()
            .await
            .map_err(|e| DaqError::instrument("buffer", e))?;

        let acquired = self.sweep_and_drain(plan, acquisition).await;
        let stopped = buffer
            .stop()
            .await
            .map_err(|e| DaqError::instrument("buffer", e));
        let samples = acquired?;
        stopped?;

        if samples.len() != config.num_points {
            return Err(DaqError::AcquisitionCountMismatch {
                expected: config.num_points,
                actual: samples.len(),
            });
        }

        let written = samples.len();
        for (index, sample) in samples.into_iter().enumerate() {
            let setpoints = plan
                .step(index)
                .map(|step| plan.targets_at(step))
                .unwrap_or_default()
                .into_iter()
                .map(|(k, v)| (k, Value::Float(v)))
                .collect();
            self.emit(plan.name(), index, SweepDirection::Forward, setpoints, sample)
                .await?;
        }
        Ok(written)
    }

    /// Ramp all swept and compensating channels to the last step over one
    /// burst, then wait for the buffer.
    async fn sweep_and_drain(
        &self,
        plan: &SweepPlan,
        acquisition: &BufferedAcquisition,
    ) -> AppResult<Vec<Sample>> {
        let speed = RampSpeed::Time(acquisition.config.burst()?);
        let ramps = plan
            .final_targets()
            .into_iter()
            .map(|(key, target)| {
                let channel = lookup(&self.registry, &key).cloned();
                async move {
                    channel?
                        .ramp(target, speed)
                        .await
                        .map_err(|e| DaqError::instrument(&key, e))
                }
            })
            .collect::<Vec<_>>();
        try_join_all(ramps).await?;

        let limit = self.settings.acquisition_timeout()?;
        let poll = self.settings.drain_poll_interval();
        let buffer = &acquisition.buffer;
        let drained = timeout(limit, async {
            loop {
                let finished = buffer
                    .is_finished()
                    .await
                    .map_err(|e| DaqError::instrument("buffer", e))?;
                if finished {
                    return Ok::<(), DaqError>(());
                }
                sleep(poll).await;
            }
        })
        .await;
        match drained {
            Ok(result) => result?,
            Err(_) => {
                error!(?limit, "Buffer did not finish in time");
                return Err(DaqError::AcquisitionTimeout { timeout: limit });
            }
        }

        buffer
            .read()
            .await
            .map_err(|e| DaqError::instrument("buffer", e))
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    async fn emit(
        &mut self,
        plan: &str,
        step: usize,
        direction: SweepDirection,
        setpoints: IndexMap<ParameterKey, Value>,
        readings: IndexMap<ParameterKey, Value>,
    ) -> AppResult<()> {
        let record = MeasurementRecord {
            run_id: self.run_id,
            plan: plan.to_string(),
            step,
            direction,
            timestamp: Utc::now(),
            setpoints,
            readings,
        };
        self.sink.write(&record).await?;
        self.records += 1;
        Ok(())
    }

    async fn capture_pre_run(&mut self) -> AppResult<()> {
        let keys = self
            .model
            .settables()
            .into_iter()
            .filter(|s| !s.locked())
            .map(|s| s.key().clone())
            .collect::<Vec<_>>();
        for key in keys {
            let value = lookup(&self.registry, &key)?
                .get()
                .await
                .map_err(|e| DaqError::instrument(&key, e))?;
            debug!(%key, %value, "Captured pre-run value");
            self.pre_run.insert(key, value);
        }
        Ok(())
    }

    async fn bring_to(&self, key: &ParameterKey, target: &Value) -> AppResult<()> {
        let channel = lookup(&self.registry, key)?;
        if let Some(spec) = self.model.get(key) {
            if let Value::Float(v) = target {
                spec.check_value(*v)?;
            }
            if spec.locked() {
                let current = channel
                    .get()
                    .await
                    .map_err(|e| DaqError::instrument(key, e))?;
                if &current != target {
                    return Err(DaqError::LockedParameter { key: key.clone() });
                }
                return Ok(());
            }
        }
        ramp_or_set(key, channel, target, &self.settings.ramp).await
    }

    async fn restore(&self) -> AppResult<()> {
        let mut first_error = None;
        for (key, value) in &self.pre_run {
            let result = match lookup(&self.registry, key) {
                Ok(channel) => ramp_or_set(key, channel, value, &self.settings.ramp).await,
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                error!(%key, error = %e, "Failed to restore pre-run value");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

fn lookup<'r>(registry: &'r ChannelRegistry, key: &ParameterKey) -> AppResult<&'r Channel> {
    registry
        .get(key)
        .ok_or_else(|| DaqError::UnmappedParameter { key: key.clone() })
}

/// Every key a plan writes: held values, swept targets and compensation.
fn commanded_keys(plan: &SweepPlan) -> Vec<ParameterKey> {
    let mut keys = plan.held().keys().cloned().collect::<Vec<_>>();
    if let Some(first) = plan.steps().first() {
        keys.extend(first.targets.keys().cloned());
    }
    keys.extend(plan.compensation().iter().map(|r| r.key.clone()));
    keys
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::MemorySink;
    use crate::experiment::sweep::{SweepBuilder, SweepMode};
    use crate::hardware::capabilities::Settable;
    use crate::hardware::mock::{MockDac, MockDmm};

    const GATE_SWEEP: &str = "
gate:
  voltage: { type: dynamic, setpoints: [0.0, 0.5, 1.0] }
ohmic:
  current: { type: gettable }
";

    fn setup(yaml: &str, dmm: MockDmm) -> (MeasurementOrchestrator, MockDac, MemorySink) {
        let model = ParameterModel::from_yaml_str(yaml).unwrap();
        let dac = MockDac::new(0.0);
        let mut registry = ChannelRegistry::new();
        registry.register_rampable(ParameterKey::new("gate", "voltage"), Arc::new(dac.clone()));
        registry.register_readable(ParameterKey::new("ohmic", "current"), Arc::new(dmm));
        let sink = MemorySink::new();
        let orchestrator =
            MeasurementOrchestrator::new(model, registry, Settings::default(), sink.clone());
        (orchestrator, dac, sink)
    }

    #[tokio::test]
    async fn run_requires_initialize() {
        let (mut orchestrator, _, _) = setup(GATE_SWEEP, MockDmm::constant(0.1));
        let mut plan = SweepBuilder::new(orchestrator.model())
            .build(SweepMode::Grid)
            .unwrap()
            .remove(0);
        assert!(matches!(
            orchestrator.run(&mut plan, &RunMode::Unbuffered).await,
            Err(DaqError::InvalidState { operation: "run", .. })
        ));
    }

    #[tokio::test]
    async fn manual_lifecycle_restores_pre_run_values() {
        let (mut orchestrator, dac, sink) = setup(GATE_SWEEP, MockDmm::constant(0.1));
        dac.set(Value::Float(0.25)).await.unwrap();
        let mut plan = SweepBuilder::new(orchestrator.model())
            .build(SweepMode::Grid)
            .unwrap()
            .remove(0);

        orchestrator.initialize(&plan).await.unwrap();
        assert_eq!(dac.value().await, Value::Float(0.0));
        assert_eq!(
            orchestrator.pre_run_values()[&ParameterKey::new("gate", "voltage")],
            Value::Float(0.25)
        );

        assert_eq!(orchestrator.run(&mut plan, &RunMode::Unbuffered).await.unwrap(), 3);
        assert_eq!(dac.value().await, Value::Float(1.0));
        orchestrator.reset().await.unwrap();
        assert_eq!(dac.value().await, Value::Float(0.25));
        assert_eq!(orchestrator.state(), OrchestratorState::Reset);
        assert_eq!(sink.len().await, 3);
    }

    #[tokio::test]
    async fn unmapped_gettable_fails_setup_without_commands() {
        let yaml = format!("{GATE_SWEEP}lockin:\n  amplitude: {{ type: gettable }}\n");
        let (mut orchestrator, dac, _) = setup(&yaml, MockDmm::constant(0.1));
        let plans = SweepBuilder::new(orchestrator.model())
            .build(SweepMode::Grid)
            .unwrap();
        assert!(matches!(
            orchestrator.execute(plans, RunMode::Unbuffered).await,
            Err(DaqError::UnmappedParameter { .. })
        ));
        assert_eq!(dac.command_count().await, 0);
        assert_eq!(orchestrator.state(), OrchestratorState::Idle);
    }

    #[tokio::test]
    async fn locked_static_must_already_be_at_its_value() {
        let yaml = format!("{GATE_SWEEP}bias:\n  voltage: {{ type: static, value: 0.1, locked: true }}\n");
        let (mut orchestrator, _, _) = setup(&yaml, MockDmm::constant(0.1));
        let bias = MockDac::new(0.0);
        orchestrator
            .registry
            .register_rampable(ParameterKey::new("bias", "voltage"), Arc::new(bias.clone()));
        let plans = SweepBuilder::new(orchestrator.model())
            .build(SweepMode::Grid)
            .unwrap();

        match orchestrator.execute(plans, RunMode::Unbuffered).await {
            Err(DaqError::LockedParameter { key }) => {
                assert_eq!(key, ParameterKey::new("bias", "voltage"))
            }
            other => panic!("expected LockedParameter, got {other:?}"),
        }
        assert_eq!(bias.command_count().await, 0);
        assert_eq!(orchestrator.state(), OrchestratorState::Reset);
    }
}
