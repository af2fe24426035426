//! Simulated steps and constraints.
//!
//! Concrete plug-ins for running the engine without a robot: the operator
//! console uses them for its demo sequence and the tests use them to observe
//! hook ordering. Every hook call lands in a shared [`ActivityLog`].

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, info};

use crate::constraint::{Constraint, ConstraintError};
use crate::step::{ExecutableStep, StepError};

/// One observed hook call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Activity {
    StepStarted(String),
    StepFinished(String),
    StepStopped(String),
    StepEmergencyStopped(String),
    StepSkipHint(String),
    ConstraintApplied(String),
    ConstraintStopped(String),
    ConstraintVisualized(String),
    ConstraintVisualizationStopped(String),
}

/// Shared, append-only record of hook calls.
#[derive(Debug, Clone, Default)]
pub struct ActivityLog {
    entries: Arc<Mutex<Vec<Activity>>>,
}

impl ActivityLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Activity>> {
        // A panicking writer cannot leave a Vec half-pushed
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn record(&self, activity: Activity) {
        self.lock().push(activity);
    }

    pub fn entries(&self) -> Vec<Activity> {
        self.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Index of the first occurrence of `activity`.
    pub fn position(&self, activity: &Activity) -> Option<usize> {
        self.lock().iter().position(|a| a == activity)
    }

    /// Index of the last occurrence of `activity`.
    pub fn last_position(&self, activity: &Activity) -> Option<usize> {
        self.lock().iter().rposition(|a| a == activity)
    }

    /// Names of constraints that are applied and not stopped, in apply order.
    pub fn active_constraints(&self) -> Vec<String> {
        let mut active: Vec<String> = Vec::new();
        for entry in self.lock().iter() {
            match entry {
                Activity::ConstraintApplied(name) => {
                    if !active.contains(name) {
                        active.push(name.clone());
                    }
                }
                Activity::ConstraintStopped(name) => active.retain(|n| n != name),
                _ => {}
            }
        }
        active
    }

    /// Number of recorded occurrences of `activity`.
    pub fn count(&self, activity: &Activity) -> usize {
        self.lock().iter().filter(|a| *a == activity).count()
    }
}

/// A step that "moves" for a fixed duration.
#[derive(Debug)]
pub struct SimulatedStep {
    name: String,
    duration: Duration,
    failure: Option<String>,
    log: ActivityLog,
    halt: Notify,
}

impl SimulatedStep {
    pub fn new(name: impl Into<String>, duration: Duration, log: ActivityLog) -> Self {
        Self {
            name: name.into(),
            duration,
            failure: None,
            log,
            halt: Notify::new(),
        }
    }

    /// Make the step report `reason` as a failure once its duration elapses.
    pub fn failing(mut self, reason: impl Into<String>) -> Self {
        self.failure = Some(reason.into());
        self
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    fn request_halt(&self) {
        // notify_one keeps a permit if run() is not waiting yet
        self.halt.notify_one();
    }
}

#[async_trait]
impl ExecutableStep for SimulatedStep {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self) -> Result<(), StepError> {
        self.log.record(Activity::StepStarted(self.name.clone()));
        info!(step = %self.name, duration_ms = self.duration.as_millis() as u64, "Snippet running");

        tokio::select! {
            _ = tokio::time::sleep(self.duration) => {}
            _ = self.halt.notified() => {
                debug!(step = %self.name, "Snippet halted before completion");
                return Ok(());
            }
        }

        if let Some(reason) = &self.failure {
            return Err(StepError::failed(reason.clone()));
        }

        self.log.record(Activity::StepFinished(self.name.clone()));
        Ok(())
    }

    async fn stop(&self) -> Result<(), StepError> {
        self.log.record(Activity::StepStopped(self.name.clone()));
        self.request_halt();
        Ok(())
    }

    async fn emergency_stop(&self) -> Result<(), StepError> {
        self.log.record(Activity::StepEmergencyStopped(self.name.clone()));
        self.request_halt();
        Ok(())
    }

    async fn skip(&self) {
        self.log.record(Activity::StepSkipHint(self.name.clone()));
    }

    fn duplicate(&self) -> Arc<dyn ExecutableStep> {
        let mut copy = SimulatedStep::new(self.name.clone(), self.duration, self.log.clone());
        copy.failure = self.failure.clone();
        Arc::new(copy)
    }
}

/// A constraint that only records its hook calls.
#[derive(Debug)]
pub struct LoggingConstraint {
    name: String,
    log: ActivityLog,
    fail_apply: AtomicBool,
    fail_stop: AtomicBool,
}

impl LoggingConstraint {
    pub fn new(name: impl Into<String>, log: ActivityLog) -> Self {
        Self {
            name: name.into(),
            log,
            fail_apply: AtomicBool::new(false),
            fail_stop: AtomicBool::new(false),
        }
    }

    /// Make subsequent `apply()` calls fail.
    pub fn set_fail_apply(&self, fail: bool) {
        self.fail_apply.store(fail, Ordering::SeqCst);
    }

    /// Make subsequent `stop()` calls fail.
    pub fn set_fail_stop(&self, fail: bool) {
        self.fail_stop.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl Constraint for LoggingConstraint {
    fn name(&self) -> &str {
        &self.name
    }

    async fn apply(&self) -> Result<(), ConstraintError> {
        if self.fail_apply.load(Ordering::SeqCst) {
            return Err(ConstraintError::Apply {
                name: self.name.clone(),
                reason: "simulated apply failure".into(),
            });
        }
        self.log.record(Activity::ConstraintApplied(self.name.clone()));
        Ok(())
    }

    async fn stop(&self) -> Result<(), ConstraintError> {
        if self.fail_stop.load(Ordering::SeqCst) {
            return Err(ConstraintError::Stop {
                name: self.name.clone(),
                reason: "simulated stop failure".into(),
            });
        }
        self.log.record(Activity::ConstraintStopped(self.name.clone()));
        Ok(())
    }

    async fn visualize(&self) -> Result<(), ConstraintError> {
        self.log.record(Activity::ConstraintVisualized(self.name.clone()));
        Ok(())
    }

    async fn stop_visualization(&self) -> Result<(), ConstraintError> {
        self.log
            .record(Activity::ConstraintVisualizationStopped(self.name.clone()));
        Ok(())
    }

    fn duplicate(&self) -> Arc<dyn Constraint> {
        Arc::new(LoggingConstraint::new(self.name.clone(), self.log.clone()))
    }
}
