//! ScheduleEngine - validates, sequences, and safely aborts a schedule.
//!
//! # State Machine
//!
//! ```text
//! ┌──────┐ execute() ┌────────────┐      ┌───────────┐      ┌────────────┐
//! │ Idle │──────────▶│ Validating │─────▶│ Reserving │─────▶│ Running(i) │──┐
//! └──────┘           └─────┬──────┘      └─────┬─────┘      └─────┬──────┘  │ next step
//!                          │ invalid           │ held elsewhere   │ ◀───────┘
//!                          ▼                   ▼                  ▼ done / failed / stop
//!                     ┌─────────┐         ┌─────────┐       ┌───────────┐
//!                     │ Aborted │         │ Aborted │       │ Releasing │──▶ Completed | Aborted
//!                     └─────────┘         └─────────┘       └───────────┘
//! ```
//!
//! Every operation is built before anything touches hardware. Once the
//! equipment is reserved it is released exactly once, whichever way the run
//! ends. A stop request is not an error: the attempt ends with
//! [`ExecutionOutcome::Cancelled`] after the current step's worker is joined.
//!
//! # Usage
//!
//! ```rust,ignore
//! let engine = ScheduleEngine::new(services, EngineSettings::default());
//! let (handle, signal) = cancel_pair();
//! let report = engine.execute(&schedule, &context, signal).await?;
//! ```

use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::cancel::CancelSignal;
use super::operations::{self, majority_source, Operation, OperationSettings};
use super::plans::{sources_to_resolve, Plan, PlanBuilder, PlanOrigin, PlanSettings, SourceTable};
use super::reservation::ReservationToken;
use super::runner::{StepOutcome, StepRunner};
use crate::error::{SchedError, SchedResult};
use crate::hardware::{Services, Severity};
use crate::schedule::{fields, Command, ExecutionContext, OperationTag, Schedule};

/// Engine state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum EngineState {
    /// Ready to accept a schedule
    Idle,
    /// Building every operation and checking the plan
    Validating,
    /// Acquiring the equipment envelope
    Reserving,
    /// Executing a step
    Running {
        /// Index into the steps after envelope lifting.
        step: usize,
    },
    /// Giving the equipment back
    Releasing,
    /// Last attempt ran every step
    Completed,
    /// Last attempt was refused, failed, or stopped
    Aborted,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineState::Idle => write!(f, "idle"),
            EngineState::Validating => write!(f, "validating"),
            EngineState::Reserving => write!(f, "reserving"),
            EngineState::Running { step } => write!(f, "running step {step}"),
            EngineState::Releasing => write!(f, "releasing"),
            EngineState::Completed => write!(f, "completed"),
            EngineState::Aborted => write!(f, "aborted"),
        }
    }
}

/// How an attempt that did not fail ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionOutcome {
    /// Every step ran.
    Completed,
    /// Stopped by request before `next_step` started.
    Cancelled {
        /// First step that did not start.
        next_step: usize,
    },
}

/// Summary of one attempt.
#[derive(Debug, Clone)]
pub struct ExecutionReport {
    /// Unique per call to `execute`, also logged.
    pub attempt_id: Uuid,
    /// Completed or stopped. Failures are returned as errors instead.
    pub outcome: ExecutionOutcome,
    /// Steps that ran to the end, including an interrupted last one.
    pub steps_completed: usize,
    /// One entry per step that ran, in order.
    pub steps: Vec<StepOutcome>,
}

/// Engine tuning, usually derived from `Settings`.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// How often a running step is checked for a stop request.
    pub poll_interval: Duration,
    /// Refuse to run schedules whose plan has errors.
    pub require_check: bool,
    /// Timings handed to each operation.
    pub operations: OperationSettings,
    /// Planner timings and site.
    pub plan: PlanSettings,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(200),
            require_check: true,
            operations: OperationSettings::default(),
            plan: PlanSettings::default(),
        }
    }
}

/// A schedule with its reservation envelope lifted out.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    /// Equipment to reserve before the first step and release after the last.
    pub equipment: Vec<String>,
    /// Commands to run as steps.
    pub steps: Vec<Command>,
}

impl Envelope {
    /// Lifts leading `reserve_equipment` and trailing `release_equipment`
    /// lines into the envelope. Either tag anywhere else is invalid.
    ///
    /// Commands must already be supplemented from the context.
    pub fn from_commands(mut commands: Vec<Command>, ctx: &ExecutionContext) -> SchedResult<Self> {
        let leading = commands
            .iter()
            .take_while(|c| c.tag() == OperationTag::ReserveEquipment)
            .count();
        let reserves: Vec<Command> = commands.drain(..leading).collect();
        let trailing = commands
            .iter()
            .rev()
            .take_while(|c| c.tag() == OperationTag::ReleaseEquipment)
            .count();
        let releases = commands.split_off(commands.len() - trailing);

        if let Some((i, c)) = commands.iter().enumerate().find(|(_, c)| {
            matches!(
                c.tag(),
                OperationTag::ReserveEquipment | OperationTag::ReleaseEquipment
            )
        }) {
            return Err(SchedError::InvalidSchedule(format!(
                "{} at step {} can only open or close a schedule",
                c.tag(),
                i + leading
            )));
        }

        let mut equipment: Vec<String> = Vec::new();
        for command in &reserves {
            command.check_required()?;
            extend_unique(&mut equipment, command.identifiers(fields::EQUIPMENT_LIST)?);
        }
        if reserves.is_empty() {
            extend_unique(&mut equipment, ctx.equipment.clone());
        }
        for command in &releases {
            command.check_required()?;
            extend_unique(&mut equipment, command.identifiers(fields::EQUIPMENT_LIST)?);
        }
        if equipment.is_empty() {
            return Err(SchedError::invalid(
                fields::EQUIPMENT_LIST,
                "no equipment selected for this execution",
            ));
        }

        Ok(Self {
            equipment,
            steps: commands,
        })
    }
}

fn extend_unique(into: &mut Vec<String>, ids: Vec<String>) {
    for id in ids {
        if !into.contains(&id) {
            into.push(id);
        }
    }
}

/// Marks an attempt aborted if it ends without reaching a final state, which
/// happens when the `execute` future is dropped or unwinds.
struct AttemptGuard<'a>(&'a RwLock<EngineState>);

impl Drop for AttemptGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.0.write();
        if !matches!(*state, EngineState::Completed | EngineState::Aborted) {
            warn!(state = %*state, "Schedule attempt abandoned");
            *state = EngineState::Aborted;
        }
    }
}

/// The ScheduleEngine runs one schedule at a time against injected services.
pub struct ScheduleEngine {
    services: Services,
    settings: EngineSettings,
    planner: PlanBuilder,
    runner: StepRunner,
    state: RwLock<EngineState>,
    running: Mutex<()>,
}

impl ScheduleEngine {
    /// Idle engine over `services`.
    pub fn new(services: Services, settings: EngineSettings) -> Self {
        Self {
            planner: PlanBuilder::new(settings.plan.clone()),
            runner: StepRunner::new(settings.poll_interval),
            services,
            settings,
            state: RwLock::new(EngineState::Idle),
            running: Mutex::new(()),
        }
    }

    /// Current state. Left at the last attempt's end state until the next one.
    pub fn state(&self) -> EngineState {
        *self.state.read()
    }

    /// Collaborators the steps run against.
    pub fn services(&self) -> &Services {
        &self.services
    }

    fn set_state(&self, state: EngineState) {
        debug!(%state, "Engine state");
        *self.state.write() = state;
    }

    /// Validates without touching hardware: supplements, lifts the
    /// envelope, and builds every operation.
    pub fn validate(
        &self,
        schedule: &Schedule,
        ctx: &ExecutionContext,
    ) -> SchedResult<(Envelope, Vec<Arc<dyn Operation>>)> {
        let envelope = Envelope::from_commands(schedule.supplemented(ctx), ctx)?;
        let operations = operations::build_all(&envelope.steps, &self.settings.operations)?;
        Ok((envelope, operations))
    }

    /// Predicts the timeline of `schedule`. Only read-only queries are made.
    #[instrument(skip_all, fields(commands = schedule.len()))]
    pub async fn check(&self, schedule: &Schedule, ctx: &ExecutionContext) -> SchedResult<Plan> {
        let commands = schedule.supplemented(ctx);
        let plan = self.plan_for(&commands, &ctx.equipment).await?;
        info!(status = %plan.status, blocks = plan.entries.len(), "Schedule checked");
        Ok(plan)
    }

    async fn plan_for(&self, commands: &[Command], fallback_ids: &[String]) -> SchedResult<Plan> {
        let (origin, sources) = self.survey(commands, fallback_ids).await?;
        Ok(self.planner.build(commands, &origin, &sources))
    }

    /// Collects the current pointing and source positions a plan needs.
    async fn survey(
        &self,
        commands: &[Command],
        fallback_ids: &[String],
    ) -> SchedResult<(PlanOrigin, SourceTable)> {
        let equipment = &self.services.equipment;
        let ids = commands
            .iter()
            .find_map(|c| c.identifiers(fields::EQUIPMENT_LIST).ok())
            .filter(|ids| !ids.is_empty())
            .unwrap_or_else(|| fallback_ids.to_vec());

        let mut origin = PlanOrigin::at(Utc::now());
        let mut sources = SourceTable::new();
        if let Some(first) = ids.first() {
            let pointing = equipment.current_pointing(&ids).await?;
            origin.pointed_source = majority_source(&ids, &pointing).map(|(s, _)| s);
            origin.position = equipment.pointing_coordinates(first).await.ok();
        }

        let mut names = sources_to_resolve(commands);
        if let Some(pointed) = &origin.pointed_source {
            names.push(pointed.clone());
        }
        for name in names {
            if let Some(position) = equipment.source_coordinates(&name).await? {
                sources.insert(name, position);
            }
        }
        Ok((origin, sources))
    }

    async fn publish_remaining(&self, steps: &[Command], fallback_ids: &[String]) {
        let plan = match self.plan_for(steps, fallback_ids).await {
            Ok(plan) => plan,
            Err(err) => {
                warn!(%err, "Could not build remaining plan");
                return;
            }
        };
        if let Err(err) = self.services.plans.publish_snapshot(&plan.entries) {
            warn!(%err, "Could not publish plan snapshot");
        }
    }

    /// Runs `schedule` to completion, failure, or a requested stop.
    ///
    /// Fails with `Busy` when another schedule is executing on this engine.
    #[instrument(skip_all, fields(commands = schedule.len(), operator = %ctx.operator))]
    pub async fn execute(
        &self,
        schedule: &Schedule,
        ctx: &ExecutionContext,
        cancel: CancelSignal,
    ) -> SchedResult<ExecutionReport> {
        let _running = self.running.try_lock().map_err(|_| SchedError::Busy)?;
        let _attempt = AttemptGuard(&self.state);
        let attempt_id = Uuid::new_v4();
        let status = &self.services.status;
        info!(%attempt_id, "Executing new schedule");

        if !ctx.has_operator() {
            status.error("Register an operator in charge before executing");
            self.set_state(EngineState::Aborted);
            return Err(SchedError::NoOperator);
        }

        self.set_state(EngineState::Validating);
        let (envelope, operations) = match self.validate(schedule, ctx) {
            Ok(validated) => validated,
            Err(err) => {
                status.error(format!("Schedule rejected: {err}"));
                self.set_state(EngineState::Aborted);
                return Err(err);
            }
        };

        if self.settings.require_check {
            let plan = match self.plan_for(&envelope.steps, &envelope.equipment).await {
                Ok(plan) => plan,
                Err(err) => {
                    status.error(format!("Pre-flight check failed: {err}"));
                    self.set_state(EngineState::Aborted);
                    return Err(err);
                }
            };
            if plan.is_rejected() {
                let reason = plan.describe(Severity::Error);
                status.error(format!("Pre-flight check rejected the schedule: {reason}"));
                self.set_state(EngineState::Aborted);
                return Err(SchedError::PlanRejected(reason));
            }
            if !plan.notes.is_empty() {
                status.warn(format!(
                    "Pre-flight check: {}",
                    plan.describe(Severity::Warning)
                ));
            }
        }

        self.set_state(EngineState::Reserving);
        let token = match ReservationToken::acquire(&self.services, envelope.equipment.clone()).await {
            Ok(token) => token,
            Err(err) => {
                status.error(format!(
                    "{err}. The equipment may already be reserved; release it with the site release tool"
                ));
                self.set_state(EngineState::Aborted);
                return Err(err);
            }
        };

        let result = self.run_steps(&envelope, &operations, &cancel).await;

        self.set_state(EngineState::Releasing);
        let released = token.release().await;

        let (outcome, steps) = match (result, released) {
            (Ok(run), Ok(())) => run,
            (Err(err), released) => {
                if let Err(release_err) = released {
                    error!(%release_err, "Release after failed step also failed");
                }
                status.error(format!("Schedule aborted: {err}"));
                self.set_state(EngineState::Aborted);
                return Err(err);
            }
            (Ok(_), Err(err)) => {
                status.error(format!("Schedule finished but releasing equipment failed: {err}"));
                self.set_state(EngineState::Aborted);
                return Err(err);
            }
        };

        match outcome {
            ExecutionOutcome::Completed => {
                status.info("Finished schedule");
                self.set_state(EngineState::Completed);
            }
            ExecutionOutcome::Cancelled { next_step } => {
                status.warn(format!("Schedule stopped before step {next_step}"));
                self.set_state(EngineState::Aborted);
            }
        }
        info!(%attempt_id, ?outcome, steps = steps.len(), "Schedule attempt ended");
        Ok(ExecutionReport {
            attempt_id,
            outcome,
            steps_completed: steps.len(),
            steps,
        })
    }

    async fn run_steps(
        &self,
        envelope: &Envelope,
        operations: &[Arc<dyn Operation>],
        cancel: &CancelSignal,
    ) -> SchedResult<(ExecutionOutcome, Vec<StepOutcome>)> {
        let mut completed = Vec::with_capacity(operations.len());
        for (index, (command, operation)) in envelope.steps.iter().zip(operations).enumerate() {
            self.publish_remaining(&envelope.steps[index..], &envelope.equipment)
                .await;

            if cancel.is_requested() {
                info!(next_step = index, "Stop observed between steps");
                return Ok((ExecutionOutcome::Cancelled { next_step: index }, completed));
            }

            self.set_state(EngineState::Running { step: index });
            self.services.status.progress(index, command);
            let outcome = self
                .runner
                .run(operation.clone(), &self.services, cancel)
                .await?;
            completed.push(outcome);
        }

        if cancel.is_requested() && completed.last().is_some_and(|s| s.stop_requested) {
            return Ok((
                ExecutionOutcome::Cancelled {
                    next_step: operations.len(),
                },
                completed,
            ));
        }
        Ok((ExecutionOutcome::Completed, completed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::ConfigValue;

    fn ctx() -> ExecutionContext {
        ExecutionContext::new("oic").with_equipment(["1a", "1c"])
    }

    fn reserve(ids: &[&str]) -> Command {
        Command::new(OperationTag::ReserveEquipment).with(fields::EQUIPMENT_LIST, ids)
    }

    fn release(ids: &[&str]) -> Command {
        Command::new(OperationTag::ReleaseEquipment).with(fields::EQUIPMENT_LIST, ids)
    }

    fn wait() -> Command {
        Command::new(OperationTag::WaitForDuration).with(fields::SECONDS, 1.0)
    }

    #[test]
    fn test_envelope_lifts_leading_and_trailing_lines() {
        let env = Envelope::from_commands(
            vec![reserve(&["2a"]), reserve(&["2b", "2a"]), wait(), release(&["2c"])],
            &ctx(),
        )
        .unwrap();
        assert_eq!(env.equipment, vec!["2a", "2b", "2c"]);
        assert_eq!(env.steps, vec![wait()]);
    }

    #[test]
    fn test_envelope_defaults_to_context_equipment() {
        let env = Envelope::from_commands(vec![wait()], &ctx()).unwrap();
        assert_eq!(env.equipment, vec!["1a", "1c"]);
    }

    #[test]
    fn test_reservation_inside_schedule_is_invalid() {
        let err = Envelope::from_commands(vec![wait(), reserve(&["2a"]), wait()], &ctx()).unwrap_err();
        assert!(matches!(err, SchedError::InvalidSchedule(_)));
    }

    #[test]
    fn test_envelope_without_equipment_is_invalid() {
        let none = ExecutionContext::new("oic");
        let empty = Command::new(OperationTag::ReserveEquipment)
            .with(fields::EQUIPMENT_LIST, ConfigValue::List(vec![]));
        assert!(Envelope::from_commands(vec![wait()], &none).is_err());
        assert!(Envelope::from_commands(vec![empty, wait()], &none).is_err());
    }

    #[test]
    fn test_engine_state_display() {
        assert_eq!(EngineState::Running { step: 2 }.to_string(), "running step 2");
        assert_eq!(EngineState::Idle.to_string(), "idle");
    }
}
