//! Step Execution
//!
//! This module provides the ONLY sanctioned way to execute a step. All step
//! runs MUST go through [`launch_step`] to ensure:
//!
//! - Every run is tagged with the engine's run generation, so a completion
//!   that arrives after the engine moved on is recognisably stale
//! - A panicking step is converted into a [`StepError::Panicked`] instead of
//!   taking the engine down
//! - Halting waits (bounded) for the run to reach a quiescent point, and a
//!   run that does not get there is reported instead of silently detached
//!
//! # Architecture Rule
//!
//! The engine never awaits `step.run()` itself. It launches the run on its own
//! task and learns about completion through the callback, which keeps the
//! engine free to process Stop/Pause/Skip while the step is moving.

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::ids::StepId;
use crate::registry::StepEntry;
use crate::step::{ExecutableStep, HaltMode, StepError};

/// Completion report of one launched run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepCompletion {
    pub generation: u64,
    pub step: StepId,
    pub outcome: Result<(), StepError>,
}

/// Handle on a step run in flight.
#[derive(Debug)]
pub struct ActiveRun {
    generation: u64,
    step_id: StepId,
    step: Arc<dyn ExecutableStep>,
    forwarder: JoinHandle<()>,
}

/// Launch `entry` on its own task.
///
/// `on_finish` is invoked exactly once with the run's outcome, from the
/// forwarding task, after `run()` returned or panicked.
pub fn launch_step<F>(entry: &StepEntry, generation: u64, on_finish: F) -> ActiveRun
where
    F: FnOnce(StepCompletion) + Send + 'static,
{
    let step = Arc::clone(&entry.step);
    let step_id = entry.id;
    info!(step = %step_id, name = step.name(), generation, "Launching step");

    let runner = Arc::clone(&step);
    let run_handle = tokio::spawn(async move { runner.run().await });

    let forwarder = tokio::spawn(async move {
        let outcome = match run_handle.await {
            Ok(result) => result,
            Err(join_err) if join_err.is_panic() => {
                Err(StepError::Panicked(panic_message(join_err.into_panic())))
            }
            Err(join_err) => Err(StepError::failed(format!("step task cancelled: {}", join_err))),
        };
        debug!(step = %step_id, generation, ok = outcome.is_ok(), "Step run returned");
        on_finish(StepCompletion {
            generation,
            step: step_id,
            outcome,
        });
    });

    ActiveRun {
        generation,
        step_id,
        step,
        forwarder,
    }
}

impl ActiveRun {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn step_id(&self) -> StepId {
        self.step_id
    }

    /// True once `run()` returned and the completion was forwarded.
    pub fn is_finished(&self) -> bool {
        self.forwarder.is_finished()
    }

    /// Ask the step to halt with `mode` and wait up to `grace` for `run()` to
    /// return. The hook itself counts against the same deadline.
    ///
    /// On timeout the run is left in place (never aborted) and
    /// [`StepError::StopTimedOut`] is returned, so the caller can escalate
    /// with another `halt` on the same run.
    pub async fn halt(&mut self, mode: HaltMode, grace: Duration) -> Result<(), StepError> {
        if self.is_finished() {
            debug!(step = %self.step_id, %mode, "Run already returned, nothing to halt");
            return Ok(());
        }

        info!(step = %self.step_id, name = self.step.name(), %mode, "Halting step");
        let step = Arc::clone(&self.step);
        let step_id = self.step_id;
        let forwarder = &mut self.forwarder;
        let quiesce = async move {
            let hook_result = mode.apply(step.as_ref()).await;
            if let Err(e) = &hook_result {
                warn!(step = %step_id, %mode, error = %e, "Halt hook failed");
            }
            let _ = forwarder.await;
            hook_result
        };

        match tokio::time::timeout(grace, quiesce).await {
            Ok(hook_result) => {
                debug!(step = %self.step_id, "Step reached quiescence");
                hook_result
            }
            Err(_) => {
                let grace_ms = grace.as_millis() as u64;
                warn!(step = %self.step_id, %mode, grace_ms, "Step did not stop within grace period");
                Err(StepError::StopTimedOut {
                    name: self.step.name().to_string(),
                    grace_ms,
                })
            }
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::StepId;
    use crate::simulated::{Activity, ActivityLog, SimulatedStep};
    use async_trait::async_trait;
    use tokio::sync::oneshot;

    #[derive(Debug)]
    struct PanickingStep;

    #[async_trait]
    impl ExecutableStep for PanickingStep {
        fn name(&self) -> &str {
            "panics"
        }
        async fn run(&self) -> Result<(), StepError> {
            panic!("servo driver crashed");
        }
        async fn stop(&self) -> Result<(), StepError> {
            Ok(())
        }
        async fn emergency_stop(&self) -> Result<(), StepError> {
            Ok(())
        }
        fn duplicate(&self) -> Arc<dyn ExecutableStep> {
            Arc::new(PanickingStep)
        }
    }

    fn entry(step: Arc<dyn ExecutableStep>) -> StepEntry {
        StepEntry {
            id: StepId::new(),
            step,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_completion_carries_generation() {
        let log = ActivityLog::new();
        let e = entry(Arc::new(SimulatedStep::new("a", Duration::from_millis(10), log)));
        let (tx, rx) = oneshot::channel();

        let _run = launch_step(&e, 7, move |c| {
            let _ = tx.send(c);
        });

        let completion = rx.await.expect("completion");
        assert_eq!(completion.generation, 7);
        assert_eq!(completion.step, e.id);
        assert_eq!(completion.outcome, Ok(()));
    }

    #[tokio::test]
    async fn test_panic_becomes_step_error() {
        let e = entry(Arc::new(PanickingStep));
        let (tx, rx) = oneshot::channel();

        let _run = launch_step(&e, 1, move |c| {
            let _ = tx.send(c);
        });

        let completion = rx.await.expect("completion");
        assert_eq!(
            completion.outcome,
            Err(StepError::Panicked("servo driver crashed".into()))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_halt_uses_emergency_hook_and_waits() {
        let log = ActivityLog::new();
        let e = entry(Arc::new(SimulatedStep::new("a", Duration::from_secs(30), log.clone())));

        let mut run = launch_step(&e, 1, |_| {});
        tokio::task::yield_now().await;
        run.halt(HaltMode::Emergency, Duration::from_secs(1))
            .await
            .expect("halt");

        assert_eq!(log.count(&Activity::StepEmergencyStopped("a".into())), 1);
        assert_eq!(log.count(&Activity::StepStopped("a".into())), 0);
        assert!(log.position(&Activity::StepFinished("a".into())).is_none());
    }

    /// Ignores `stop()`; optionally its hooks never return either.
    #[derive(Debug)]
    struct StubbornStep {
        hang_in_hooks: bool,
    }

    #[async_trait]
    impl ExecutableStep for StubbornStep {
        fn name(&self) -> &str {
            "stubborn"
        }
        async fn run(&self) -> Result<(), StepError> {
            tokio::time::sleep(Duration::from_secs(3_600)).await;
            Ok(())
        }
        async fn stop(&self) -> Result<(), StepError> {
            if self.hang_in_hooks {
                std::future::pending::<()>().await;
            }
            Ok(())
        }
        async fn emergency_stop(&self) -> Result<(), StepError> {
            self.stop().await
        }
        fn duplicate(&self) -> Arc<dyn ExecutableStep> {
            Arc::new(StubbornStep {
                hang_in_hooks: self.hang_in_hooks,
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_halt_reports_run_outliving_grace() {
        let e = entry(Arc::new(StubbornStep {
            hang_in_hooks: false,
        }));
        let mut run = launch_step(&e, 1, |_| {});
        tokio::task::yield_now().await;

        let result = run.halt(HaltMode::Graceful, Duration::from_millis(500)).await;
        assert_eq!(
            result,
            Err(StepError::StopTimedOut {
                name: "stubborn".into(),
                grace_ms: 500,
            })
        );
        assert!(!run.is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_hook_is_bounded_by_grace() {
        let e = entry(Arc::new(StubbornStep {
            hang_in_hooks: true,
        }));
        let mut run = launch_step(&e, 1, |_| {});
        tokio::task::yield_now().await;

        let started = tokio::time::Instant::now();
        let result = run.halt(HaltMode::Skip, Duration::from_secs(1)).await;
        assert!(matches!(result, Err(StepError::StopTimedOut { .. })));
        assert!(started.elapsed() >= Duration::from_secs(1));
        assert!(started.elapsed() < Duration::from_secs(2));
    }
}
