//! End-to-end schedule execution against the mock rig.

use obs_scheduler::engine::{
    cancel_pair, CancelSignal, EngineSettings, EngineState, ExecutionOutcome,
    ObservationPlanEntry, OperationSettings, PlanSettings, ScheduleEngine,
};
use obs_scheduler::error::{SchedError, SchedResult};
use obs_scheduler::hardware::catalog::Catalog;
use obs_scheduler::hardware::mock::{CallLog, HwCall, MockEquipment, MockRecorder, MockRig};
use obs_scheduler::hardware::{
    DigitizerMode, PlanPublisher, Services, Severity, SkyPosition, TuningChannel,
};
use obs_scheduler::schedule::{fields, file, Command, ExecutionContext, OperationTag, Schedule};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing_test::traced_test;

const LIMIT: Duration = Duration::from_secs(5);

fn settings(require_check: bool) -> EngineSettings {
    EngineSettings {
        poll_interval: Duration::from_millis(10),
        require_check,
        operations: OperationSettings {
            settle: Duration::ZERO,
            recording_lead: Duration::ZERO,
            safety_margin: Duration::ZERO,
            ..OperationSettings::default()
        },
        plan: PlanSettings::default(),
    }
}

fn ctx() -> ExecutionContext {
    ExecutionContext::new("oic")
        .with_equipment(["1a", "1c"])
        .with_recorder_targets(["seti-node3.0"])
}

fn ids(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn catalog() -> Catalog {
    Catalog::new()
        .with_backend("xgpu_1.5s", json!({"NANTS": 20}))
        .with_postprocessor("none", json!({}))
}

fn rig_with(equipment: impl FnOnce(MockEquipment) -> MockEquipment) -> MockRig {
    let log = CallLog::new();
    let equipment = equipment(MockEquipment::new(log.clone()));
    MockRig::from_parts(log.clone(), equipment, MockRecorder::new(log), catalog())
}

fn rig() -> MockRig {
    rig_with(|e| e.with_source("casa", SkyPosition::new(23.391, 58.808)))
}

fn reserve(items: &[&str]) -> Command {
    Command::new(OperationTag::ReserveEquipment).with(fields::EQUIPMENT_LIST, items)
}

fn release(items: &[&str]) -> Command {
    Command::new(OperationTag::ReleaseEquipment).with(fields::EQUIPMENT_LIST, items)
}

fn tuning(freqs: &[(&str, f64)], rf_gain: bool) -> Command {
    let mut command = Command::new(OperationTag::SetFrequencyTuning)
        .with(fields::RF_GAIN_FLAG, if rf_gain { "True" } else { "False" })
        .with(fields::IF_GAIN_FLAG, 0.0)
        .with(fields::EQ_LEVEL_FLAG, 0.0);
    for (field, freq) in freqs {
        command = command.with(field, *freq);
    }
    command
}

fn track(source: &str, obs_secs: f64) -> Command {
    Command::new(OperationTag::TrackAndObserve)
        .with(fields::SOURCE_NAME, source)
        .with(fields::OBS_TIME, obs_secs)
}

fn wait(secs: f64) -> Command {
    Command::new(OperationTag::WaitForDuration).with(fields::SECONDS, secs)
}

fn schedule(commands: Vec<Command>) -> Schedule {
    Schedule::from_commands(commands)
}

#[tokio::test]
async fn test_invalid_schedule_touches_no_hardware() {
    let rig = rig();
    let engine = ScheduleEngine::new(rig.services(), settings(true));
    let broken = Command::new(OperationTag::SetFrequencyTuning).with(fields::TUNING_A, 3000.0);

    let err = engine
        .execute(&schedule(vec![wait(0.0), broken]), &ctx(), CancelSignal::never())
        .await
        .unwrap_err();

    assert!(matches!(err, SchedError::MissingField { .. }));
    assert!(rig.log.is_empty());
    assert!(rig.status.contains("Schedule rejected"));
    assert_eq!(engine.state(), EngineState::Aborted);
}

#[tokio::test]
async fn test_blank_operator_is_refused() {
    let rig = rig();
    let engine = ScheduleEngine::new(rig.services(), settings(false));
    let ctx = ExecutionContext::new("   ").with_equipment(["1a"]);

    let err = engine
        .execute(&schedule(vec![wait(0.0)]), &ctx, CancelSignal::never())
        .await
        .unwrap_err();

    assert!(matches!(err, SchedError::NoOperator));
    assert!(rig.log.is_empty());
}

#[tokio::test]
async fn test_envelope_then_single_retune_autotune_release() {
    let rig = rig();
    let engine = ScheduleEngine::new(rig.services(), settings(false));
    let sched = schedule(vec![
        reserve(&["1a", "1c"]),
        tuning(&[(fields::TUNING_A, 3000.0)], true),
        release(&["1a", "1c"]),
    ]);

    let report = engine
        .execute(&sched, &ctx(), CancelSignal::never())
        .await
        .unwrap();

    assert_eq!(report.outcome, ExecutionOutcome::Completed);
    assert_eq!(report.steps_completed, 1);
    assert_eq!(
        rig.log.side_effects(),
        vec![
            HwCall::Reserve(ids(&["1a", "1c"])),
            HwCall::Retune {
                freq_mhz: 3000.0,
                channel: TuningChannel::A,
                defer_focus: false,
            },
            HwCall::Autotune(ids(&["1a", "1c"])),
            HwCall::Release(ids(&["1a", "1c"])),
        ]
    );
    assert!(!rig.equipment.is_reserved("1a"));
    assert_eq!(
        rig.status.last(),
        Some(("Finished schedule".to_string(), Severity::Info))
    );
    assert_eq!(engine.state(), EngineState::Completed);
}

#[tokio::test]
async fn test_only_the_highest_frequency_triggers_focus() {
    let rig = rig();
    let engine = ScheduleEngine::new(rig.services(), settings(false));
    let sched = schedule(vec![tuning(
        &[(fields::TUNING_A, 3000.0), (fields::TUNING_B, 1500.0)],
        false,
    )]);

    engine
        .execute(&sched, &ctx(), CancelSignal::never())
        .await
        .unwrap();

    let retunes: Vec<HwCall> = rig
        .log
        .side_effects()
        .into_iter()
        .filter(|c| c.name() == "retune")
        .collect();
    assert_eq!(
        retunes,
        vec![
            HwCall::Retune {
                freq_mhz: 3000.0,
                channel: TuningChannel::A,
                defer_focus: false,
            },
            HwCall::Retune {
                freq_mhz: 1500.0,
                channel: TuningChannel::B,
                defer_focus: true,
            },
        ]
    );
}

#[tokio::test]
async fn test_pointed_source_follows_the_majority() {
    let rig = rig_with(|e| {
        e.with_source("casa", SkyPosition::new(23.391, 58.808))
            .with_pointing("1a", "casa")
            .with_pointing("1c", "casa")
            .with_pointing("1f", "3c84")
    });
    let engine = ScheduleEngine::new(rig.services(), settings(false));
    let ctx = ctx().with_equipment(["1a", "1c", "1f"]);

    engine
        .execute(&schedule(vec![track("none", 0.05)]), &ctx, CancelSignal::never())
        .await
        .unwrap();

    assert_eq!(rig.log.count("track"), 0);
    assert_eq!(rig.log.count("begin_recording"), 1);
    assert!(rig.status.contains("using the most common: casa"));
    assert!(rig.status.contains("Recording casa"));
}

#[tokio::test]
async fn test_steps_run_one_after_another() {
    let rig = rig();
    let engine = ScheduleEngine::new(rig.services(), settings(false));
    let sched = schedule(vec![wait(0.03), wait(0.03), wait(0.03)]);

    let report = engine
        .execute(&sched, &ctx(), CancelSignal::never())
        .await
        .unwrap();

    assert_eq!(report.steps.len(), 3);
    for pair in report.steps.windows(2) {
        assert!(pair[0].finished <= pair[1].started);
    }
    assert!(report.steps.iter().all(|s| s.elapsed() >= Duration::from_millis(30)));
    // one snapshot of the remaining plan before each step
    assert_eq!(rig.plans.snapshots().len(), 3);
}

#[tokio::test]
async fn test_step_failure_releases_once_and_skips_the_rest() {
    let rig = rig_with(|e| e.failing_on("autotune"));
    let engine = ScheduleEngine::new(rig.services(), settings(false));
    let sched = schedule(vec![
        tuning(&[(fields::TUNING_A, 3000.0)], true),
        track("casa", 0.0),
    ]);

    let err = engine
        .execute(&sched, &ctx(), CancelSignal::never())
        .await
        .unwrap_err();

    assert!(matches!(err, SchedError::Hardware(_)));
    assert_eq!(rig.log.count("release"), 1);
    assert_eq!(rig.log.count("track"), 0);
    let (last, severity) = rig.status.last().unwrap();
    assert!(last.starts_with("Schedule aborted"));
    assert_eq!(severity, Severity::Error);
}

/// Waits until the mock reports `id` free again.
async fn until_released(rig: &MockRig, id: &str) {
    timeout(LIMIT, async {
        while rig.equipment.is_reserved(id) {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("equipment was never released");
}

#[tokio::test]
async fn test_step_panic_is_reported_and_releases_once() {
    let rig = rig_with(|e| e.panicking_on("autotune"));
    let engine = ScheduleEngine::new(rig.services(), settings(false));
    let sched = schedule(vec![
        tuning(&[(fields::TUNING_A, 3000.0)], true),
        track("casa", 0.0),
    ]);

    let err = engine
        .execute(&sched, &ctx(), CancelSignal::never())
        .await
        .unwrap_err();

    assert!(matches!(err, SchedError::StepPanicked(msg) if msg.contains("autotune")));
    assert_eq!(rig.log.count("release"), 1);
    assert_eq!(rig.log.count("track"), 0);
    assert!(!rig.equipment.is_reserved("1a"));
    let (last, severity) = rig.status.last().unwrap();
    assert!(last.starts_with("Schedule aborted"));
    assert_eq!(severity, Severity::Error);
    assert_eq!(engine.state(), EngineState::Aborted);
}

#[tokio::test]
async fn test_release_failure_after_success_is_an_error() {
    let rig = rig_with(|e| e.failing_on("release"));
    let engine = ScheduleEngine::new(rig.services(), settings(false));

    let err = engine
        .execute(&schedule(vec![wait(0.0)]), &ctx(), CancelSignal::never())
        .await
        .unwrap_err();

    assert!(matches!(err, SchedError::Hardware(_)));
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    assert_eq!(rig.log.count("release"), 1);
    assert!(rig.status.contains("releasing equipment failed"));
    assert_eq!(engine.state(), EngineState::Aborted);
}

#[tokio::test]
async fn test_abandoned_execution_still_releases() {
    let rig = rig();
    let engine = ScheduleEngine::new(rig.services(), settings(false));

    let abandoned = timeout(
        Duration::from_millis(100),
        engine.execute(&schedule(vec![wait(30.0)]), &ctx(), CancelSignal::never()),
    )
    .await;
    assert!(abandoned.is_err());

    until_released(&rig, "1a").await;
    assert_eq!(rig.log.count("release"), 1);
    assert_eq!(engine.state(), EngineState::Aborted);

    // the engine takes the next schedule
    let report = engine
        .execute(&schedule(vec![wait(0.0)]), &ctx(), CancelSignal::never())
        .await
        .unwrap();
    assert_eq!(report.outcome, ExecutionOutcome::Completed);
    assert_eq!(rig.log.count("release"), 2);
}

struct ExplodingSnapshots;

impl PlanPublisher for ExplodingSnapshots {
    fn publish_snapshot(&self, _: &[ObservationPlanEntry]) -> SchedResult<()> {
        panic!("snapshot store is on fire");
    }
}

#[tokio::test]
async fn test_orchestrator_panic_still_releases() {
    let rig = rig();
    let services = Services {
        plans: Arc::new(ExplodingSnapshots),
        ..rig.services()
    };
    let engine = Arc::new(ScheduleEngine::new(services, settings(false)));

    let task = tokio::spawn({
        let engine = engine.clone();
        async move {
            let sched = schedule(vec![wait(0.0)]);
            let context = ctx();
            engine.execute(&sched, &context, CancelSignal::never()).await
        }
    });
    let joined = timeout(LIMIT, task).await.expect("execution hung");
    assert!(joined.unwrap_err().is_panic());

    until_released(&rig, "1c").await;
    assert_eq!(rig.log.count("reserve"), 1);
    assert_eq!(rig.log.count("release"), 1);
    assert_eq!(engine.state(), EngineState::Aborted);
}

#[tokio::test]
async fn test_timeline_overflow_is_rejected_before_reserving() {
    let rig = rig();
    let engine = ScheduleEngine::new(rig.services(), settings(true));

    let err = engine
        .execute(&schedule(vec![wait(1e13), wait(1.0)]), &ctx(), CancelSignal::never())
        .await
        .unwrap_err();

    assert!(matches!(err, SchedError::PlanRejected(reason) if reason.contains("last representable date")));
    assert!(rig.log.side_effects().is_empty());
}

#[tokio::test]
async fn test_digitizer_switch_and_unfocused_retune() {
    let rig = rig();
    let engine = ScheduleEngine::new(rig.services(), settings(false));
    let sched = schedule(vec![
        Command::new(OperationTag::SetDigitizerMode)
            .with(fields::DIGITIZER_MODE, "Continuum mode"),
        tuning(&[(fields::TUNING_A, 3000.0)], false).with(fields::FOCUS_FLAG, 0.0),
    ]);

    engine
        .execute(&sched, &ctx(), CancelSignal::never())
        .await
        .unwrap();

    assert_eq!(
        rig.log.side_effects(),
        vec![
            HwCall::Reserve(ids(&["1a", "1c"])),
            HwCall::DigitizerMode(DigitizerMode::Continuum),
            HwCall::Retune {
                freq_mhz: 3000.0,
                channel: TuningChannel::A,
                defer_focus: true,
            },
            HwCall::Release(ids(&["1a", "1c"])),
        ]
    );
}

#[tokio::test]
async fn test_unknown_postprocessor_aborts_after_reservation() {
    let rig = rig();
    let engine = ScheduleEngine::new(rig.services(), settings(false));
    let backend = Command::new(OperationTag::SetBackend)
        .with(fields::PROJECT_ID, "p054")
        .with(fields::BACKEND_NAME, "xgpu_1.5s")
        .with(fields::POSTPROCESSOR_NAME, "gpu_raw");

    let err = engine
        .execute(&schedule(vec![backend, track("casa", 0.0)]), &ctx(), CancelSignal::never())
        .await
        .unwrap_err();

    assert!(matches!(err, SchedError::UnknownPostprocessor(name) if name == "gpu_raw"));
    assert_eq!(
        rig.log.side_effects(),
        vec![
            HwCall::Reserve(ids(&["1a", "1c"])),
            HwCall::Release(ids(&["1a", "1c"])),
        ]
    );
}

#[tokio::test]
async fn test_stop_during_third_step_of_five() {
    let rig = rig();
    let engine = ScheduleEngine::new(rig.services(), settings(false));
    let sched = schedule(vec![wait(0.0), wait(0.0), wait(30.0), wait(0.0), wait(0.0)]);
    let (handle, signal) = cancel_pair();

    let stopper = async {
        while engine.state() != (EngineState::Running { step: 2 }) {
            sleep(Duration::from_millis(5)).await;
        }
        handle.request();
    };
    let exec_ctx = ctx();
    let (report, ()) = timeout(LIMIT, async {
        tokio::join!(engine.execute(&sched, &exec_ctx, signal), stopper)
    })
    .await
    .expect("stop was not honoured in time");
    let report = report.unwrap();

    assert_eq!(report.outcome, ExecutionOutcome::Cancelled { next_step: 3 });
    assert_eq!(report.steps_completed, 3);
    assert!(report.steps[2].stop_requested);
    assert_eq!(rig.log.count("release"), 1);
    assert!(rig.status.contains("Schedule stopped before step 3"));
    assert_eq!(engine.state(), EngineState::Aborted);
}

#[tokio::test]
async fn test_second_execution_is_busy() {
    let rig = rig();
    let engine = ScheduleEngine::new(rig.services(), settings(false));
    let long = schedule(vec![wait(30.0)]);
    let short = schedule(vec![wait(0.0)]);
    let (handle, signal) = cancel_pair();

    let second = async {
        while !matches!(engine.state(), EngineState::Running { .. }) {
            sleep(Duration::from_millis(5)).await;
        }
        let result = engine.execute(&short, &ctx(), CancelSignal::never()).await;
        handle.request();
        result
    };
    let exec_ctx = ctx();
    let (first, second) = timeout(LIMIT, async {
        tokio::join!(engine.execute(&long, &exec_ctx, signal), second)
    })
    .await
    .expect("executions did not finish");

    assert!(matches!(second, Err(SchedError::Busy)));
    assert_eq!(
        first.unwrap().outcome,
        ExecutionOutcome::Cancelled { next_step: 1 }
    );
    assert_eq!(rig.log.count("reserve"), 1);
    assert_eq!(rig.log.count("release"), 1);
}

#[tokio::test]
async fn test_reservation_conflict_stops_before_any_step() {
    let rig = rig_with(|e| e.already_reserved(&["1c"]));
    let engine = ScheduleEngine::new(rig.services(), settings(false));

    let err = engine
        .execute(
            &schedule(vec![tuning(&[(fields::TUNING_A, 3000.0)], false)]),
            &ctx(),
            CancelSignal::never(),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, SchedError::Reservation(_)));
    assert_eq!(rig.log.count("retune"), 0);
    assert_eq!(rig.log.count("release"), 0);
    assert!(rig.status.contains("release it with the site release tool"));
}

#[tokio::test]
async fn test_unresolvable_source_rejects_preflight() {
    let rig = rig();
    let engine = ScheduleEngine::new(rig.services(), settings(true));

    let err = engine
        .execute(&schedule(vec![track("3c999", 60.0)]), &ctx(), CancelSignal::never())
        .await
        .unwrap_err();

    assert!(matches!(err, SchedError::PlanRejected(_)));
    assert!(rig.log.side_effects().is_empty());
}

#[tokio::test]
async fn test_check_only_queries() {
    let rig = rig();
    let engine = ScheduleEngine::new(rig.services(), settings(true));
    let sched = schedule(vec![
        tuning(&[(fields::TUNING_A, 3000.0)], false),
        track("casa", 600.0),
    ]);

    let plan = engine.check(&sched, &ctx()).await.unwrap();

    assert_eq!(plan.entries.len(), 1);
    assert_eq!(plan.entries[0].source_id, "casa");
    assert!(!plan.is_rejected());
    assert!(rig.log.side_effects().is_empty());
    assert_eq!(engine.state(), EngineState::Idle);
}

#[tokio::test]
async fn test_saved_schedule_executes_like_the_original() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("night.json");
    let original = schedule(vec![
        reserve(&["1a"]),
        tuning(&[(fields::TUNING_A, 3000.0), (fields::TUNING_B, 1500.0)], true),
        wait(0.0),
        release(&["1a"]),
    ]);
    file::save(&original, &path).unwrap();
    let loaded = file::load(&path).unwrap();
    assert_eq!(loaded, original);

    let mut calls = Vec::new();
    for sched in [&original, &loaded] {
        let rig = rig();
        let engine = ScheduleEngine::new(rig.services(), settings(false));
        engine
            .execute(sched, &ctx(), CancelSignal::never())
            .await
            .unwrap();
        calls.push(rig.log.side_effects());
    }
    assert_eq!(calls[0], calls[1]);
    assert_eq!(calls[0].len(), 5);
}

#[tokio::test]
#[traced_test]
async fn test_status_lines_are_mirrored_to_tracing() {
    let rig = rig();
    let engine = ScheduleEngine::new(rig.services(), settings(false));

    engine
        .execute(&schedule(vec![wait(0.0)]), &ctx(), CancelSignal::never())
        .await
        .unwrap();

    assert!(logs_contain("Finished schedule"));
    assert!(logs_contain("Starting step"));
}
