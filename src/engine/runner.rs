//! Runs one step in its own worker task.
//!
//! The orchestrator never awaits hardware itself. It waits on the worker's
//! join handle and a poll ticker together; on the first tick that observes a
//! stop request it asks the step to finish early through its interrupt hook.
//! Steps without a hook simply run to completion. A worker that panics is
//! reported as [`SchedError::StepPanicked`] once it has been joined. If the
//! orchestrator stops waiting altogether, the worker is aborted.

use std::any::Any;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::{AbortHandle, JoinError};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info};

use super::cancel::CancelSignal;
use super::operations::Operation;
use crate::error::{SchedError, SchedResult};
use crate::hardware::Services;
use crate::schedule::OperationTag;

/// What happened while one step ran.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepOutcome {
    /// Which variant ran.
    pub tag: OperationTag,
    /// Worker spawned.
    pub started: Instant,
    /// Worker joined.
    pub finished: Instant,
    /// A stop was observed while the step was running.
    pub stop_requested: bool,
}

impl StepOutcome {
    /// Wall time of the step.
    pub fn elapsed(&self) -> Duration {
        self.finished.duration_since(self.started)
    }
}

/// Aborts the worker when the waiting future is dropped. Aborting a finished
/// task does nothing.
struct AbortOnDrop(AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Runs steps one at a time, relaying stop requests to them.
#[derive(Debug, Clone)]
pub struct StepRunner {
    poll_interval: Duration,
}

impl Default for StepRunner {
    fn default() -> Self {
        Self::new(Duration::from_millis(200))
    }
}

impl StepRunner {
    /// Runner checking for stop requests every `poll_interval`.
    pub fn new(poll_interval: Duration) -> Self {
        Self { poll_interval }
    }

    /// Runs `operation` to completion, relaying at most one interrupt.
    pub async fn run(
        &self,
        operation: Arc<dyn Operation>,
        services: &Services,
        cancel: &CancelSignal,
    ) -> SchedResult<StepOutcome> {
        let tag = operation.tag();
        let started = Instant::now();

        let mut worker = {
            let operation = operation.clone();
            let services = services.clone();
            tokio::spawn(async move { operation.run(&services).await })
        };
        let _abort = AbortOnDrop(worker.abort_handle());

        let mut ticker = interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut stop_requested = false;

        let joined = loop {
            tokio::select! {
                joined = &mut worker => break joined,
                _ = ticker.tick() => {
                    if !stop_requested && cancel.is_requested() {
                        stop_requested = true;
                        if operation.interrupt() {
                            info!(%tag, "Stop requested, interrupting step");
                        } else {
                            info!(%tag, "Stop requested, step has no interrupt hook and will run to completion");
                        }
                    }
                }
            }
        };

        let finished = Instant::now();
        debug!(%tag, elapsed_ms = finished.duration_since(started).as_millis() as u64, "Step worker joined");
        joined.map_err(worker_failure)??;
        Ok(StepOutcome {
            tag,
            started,
            finished,
            stop_requested,
        })
    }
}

fn worker_failure(err: JoinError) -> SchedError {
    if err.is_panic() {
        SchedError::StepPanicked(panic_message(err.into_panic()))
    } else {
        SchedError::StepPanicked("step worker was cancelled".into())
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::cancel::cancel_pair;
    use crate::engine::operations::{build, OperationSettings};
    use crate::hardware::catalog::Catalog;
    use crate::hardware::mock::MockRig;
    use crate::schedule::{fields, Command};
    use async_trait::async_trait;

    struct Exploding;

    #[async_trait]
    impl Operation for Exploding {
        fn tag(&self) -> OperationTag {
            OperationTag::WaitForPrompt
        }

        async fn run(&self, _: &Services) -> SchedResult<()> {
            panic!("feed controller on fire");
        }
    }

    struct Stubborn;

    #[async_trait]
    impl Operation for Stubborn {
        fn tag(&self) -> OperationTag {
            OperationTag::SetFrequencyTuning
        }

        async fn run(&self, _: &Services) -> SchedResult<()> {
            tokio::time::sleep(Duration::from_millis(150)).await;
            Ok(())
        }
    }

    fn runner() -> StepRunner {
        StepRunner::new(Duration::from_millis(10))
    }

    #[tokio::test]
    async fn test_panic_is_captured() {
        let rig = MockRig::new(Catalog::new());
        let err = runner()
            .run(Arc::new(Exploding), &rig.services(), &CancelSignal::never())
            .await
            .unwrap_err();
        assert!(matches!(err, SchedError::StepPanicked(msg) if msg.contains("on fire")));
    }

    #[tokio::test]
    async fn test_stop_interrupts_hooked_step() {
        let rig = MockRig::new(Catalog::new());
        let wait = Command::new(OperationTag::WaitForDuration).with(fields::SECONDS, 3600.0);
        let op = build(&wait, &OperationSettings::default()).unwrap();
        let (handle, signal) = cancel_pair();

        let services = rig.services();
        let run = tokio::spawn(async move { runner().run(op, &services, &signal).await });
        tokio::time::sleep(Duration::from_millis(30)).await;
        handle.request();

        let outcome = tokio::time::timeout(Duration::from_secs(5), run)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(outcome.stop_requested);
        assert!(outcome.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_abandoned_step_worker_is_aborted() {
        let rig = MockRig::new(Catalog::new());
        let services = rig.services();
        let op = Arc::new(Stubborn);
        let watched: Arc<dyn Operation> = op.clone();

        let runner = runner();
        let never = CancelSignal::never();
        let run = runner.run(watched, &services, &never);
        assert!(tokio::time::timeout(Duration::from_millis(20), run).await.is_err());

        // the worker held the only other reference to the operation
        tokio::time::timeout(Duration::from_secs(5), async {
            while Arc::strong_count(&op) > 1 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_step_without_hook_runs_to_completion() {
        let rig = MockRig::new(Catalog::new());
        let (handle, signal) = cancel_pair();
        handle.request();

        let outcome = runner()
            .run(Arc::new(Stubborn), &rig.services(), &signal)
            .await
            .unwrap();
        assert!(outcome.stop_requested);
        assert!(outcome.elapsed() >= Duration::from_millis(150));
    }
}
