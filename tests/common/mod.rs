//! Shared fixtures for the integration tests.
//!
//! `ScriptedStep` only finishes when the test says so, which makes the
//! engine's progression fully deterministic.

#![allow(dead_code)]

use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

use snippet_sequencer::simulated::{Activity, ActivityLog, LoggingConstraint};
use snippet_sequencer::{
    ConstraintId, ConstraintScope, EngineConfig, EngineSnapshot, ExecutableStep,
    ProgressPhase, ProgressionPolicy, SequenceEngine, SequenceRegistry, SequenceState, StepError,
    StepId, TransportFlags,
};

pub const WAIT: Duration = Duration::from_secs(5);

/// Step whose `run()` returns when the test calls [`ScriptedStep::finish`]
/// or [`ScriptedStep::fail`], or when it is halted.
#[derive(Debug)]
pub struct ScriptedStep {
    name: String,
    log: ActivityLog,
    finish: Arc<Notify>,
    failure: Arc<Mutex<Option<String>>>,
    halt: Notify,
}

impl ScriptedStep {
    pub fn new(name: &str, log: &ActivityLog) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            log: log.clone(),
            finish: Arc::new(Notify::new()),
            failure: Arc::new(Mutex::new(None)),
            halt: Notify::new(),
        })
    }

    pub fn finish(&self) {
        self.finish.notify_one();
    }

    pub fn fail(&self, reason: &str) {
        *self.failure.lock().unwrap() = Some(reason.to_string());
        self.finish.notify_one();
    }
}

#[async_trait]
impl ExecutableStep for ScriptedStep {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self) -> Result<(), StepError> {
        self.log.record(Activity::StepStarted(self.name.clone()));
        tokio::select! {
            _ = self.finish.notified() => {}
            _ = self.halt.notified() => return Ok(()),
        }
        if let Some(reason) = self.failure.lock().unwrap().take() {
            return Err(StepError::failed(reason));
        }
        self.log.record(Activity::StepFinished(self.name.clone()));
        Ok(())
    }

    async fn stop(&self) -> Result<(), StepError> {
        self.log.record(Activity::StepStopped(self.name.clone()));
        self.halt.notify_one();
        Ok(())
    }

    async fn emergency_stop(&self) -> Result<(), StepError> {
        self.log.record(Activity::StepEmergencyStopped(self.name.clone()));
        self.halt.notify_one();
        Ok(())
    }

    async fn skip(&self) {
        self.log.record(Activity::StepSkipHint(self.name.clone()));
    }

    /// The copy shares the finish trigger: only one of them runs at a time.
    fn duplicate(&self) -> Arc<dyn ExecutableStep> {
        Arc::new(Self {
            name: self.name.clone(),
            log: self.log.clone(),
            finish: Arc::clone(&self.finish),
            failure: Arc::clone(&self.failure),
            halt: Notify::new(),
        })
    }
}

/// Step that records its hooks but never reacts to them; `run()` only
/// returns after an hour.
#[derive(Debug)]
pub struct StubbornStep {
    name: String,
    log: ActivityLog,
}

impl StubbornStep {
    pub fn new(name: &str, log: &ActivityLog) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            log: log.clone(),
        })
    }
}

#[async_trait]
impl ExecutableStep for StubbornStep {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self) -> Result<(), StepError> {
        self.log.record(Activity::StepStarted(self.name.clone()));
        tokio::time::sleep(Duration::from_secs(3_600)).await;
        self.log.record(Activity::StepFinished(self.name.clone()));
        Ok(())
    }

    async fn stop(&self) -> Result<(), StepError> {
        self.log.record(Activity::StepStopped(self.name.clone()));
        Ok(())
    }

    async fn emergency_stop(&self) -> Result<(), StepError> {
        self.log.record(Activity::StepEmergencyStopped(self.name.clone()));
        Ok(())
    }

    fn duplicate(&self) -> Arc<dyn ExecutableStep> {
        StubbornStep::new(&self.name, &self.log)
    }
}

pub struct Harness {
    pub engine: SequenceEngine,
    pub log: ActivityLog,
    pub steps: Vec<Arc<ScriptedStep>>,
    pub ids: Vec<StepId>,
    pub transport: TransportFlags,
}

impl Harness {
    pub fn new(names: &[&str], policy: ProgressionPolicy) -> Self {
        Self::build(names, policy, |_, _, _| {})
    }

    /// Build with a hook that may add constraints to the registry before the
    /// engine is spawned.
    pub fn build<F>(names: &[&str], policy: ProgressionPolicy, setup: F) -> Self
    where
        F: FnOnce(&mut SequenceRegistry, &[StepId], &ActivityLog),
    {
        Self::build_with_config(names, &EngineConfig::with_policy(policy), setup)
    }

    pub fn build_with_config<F>(names: &[&str], config: &EngineConfig, setup: F) -> Self
    where
        F: FnOnce(&mut SequenceRegistry, &[StepId], &ActivityLog),
    {
        let log = ActivityLog::new();
        let mut registry = SequenceRegistry::new();
        let mut steps = Vec::new();
        let mut ids = Vec::new();
        for name in names {
            let step = ScriptedStep::new(name, &log);
            ids.push(registry.push_step(step.clone()));
            steps.push(step);
        }
        setup(&mut registry, &ids, &log);

        let transport = TransportFlags::disabled();
        let engine = SequenceEngine::spawn(registry, config, Arc::new(transport.clone()))
        .expect("spawn engine");

        Self {
            engine,
            log,
            steps,
            ids,
            transport,
        }
    }

    pub async fn wait_for<F>(&self, predicate: F) -> EngineSnapshot
    where
        F: FnMut(&EngineSnapshot) -> bool,
    {
        tokio::time::timeout(WAIT, self.engine.wait_for(predicate))
            .await
            .expect("timed out waiting for engine")
            .expect("engine alive")
    }

    /// Wait until the step at `index` is executing.
    pub async fn executing(&self, index: usize) -> EngineSnapshot {
        self.wait_for(move |s| {
            s.state == SequenceState::Running
                && s.current_index == Some(index)
                && s.phase == ProgressPhase::Executing
        })
        .await
    }

    pub async fn state(&self, state: SequenceState) -> EngineSnapshot {
        self.wait_for(move |s| s.state == state).await
    }

    pub fn started(&self, name: &str) -> usize {
        self.log.count(&Activity::StepStarted(name.to_string()))
    }
}

pub fn add_global(registry: &mut SequenceRegistry, name: &str, log: &ActivityLog) -> ConstraintId {
    registry
        .add_constraint(
            ConstraintScope::Global,
            Arc::new(LoggingConstraint::new(name, log.clone())),
        )
        .expect("add global")
}

pub fn add_scoped(
    registry: &mut SequenceRegistry,
    owner: StepId,
    name: &str,
    log: &ActivityLog,
) -> ConstraintId {
    registry
        .add_constraint(
            ConstraintScope::Scoped(owner),
            Arc::new(LoggingConstraint::new(name, log.clone())),
        )
        .expect("add scoped")
}

pub fn sorted(mut names: Vec<String>) -> Vec<String> {
    names.sort();
    names
}

/// Poll `condition` until it holds (step runs log on their own tasks).
pub async fn until<F: FnMut() -> bool>(mut condition: F) {
    tokio::time::timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
