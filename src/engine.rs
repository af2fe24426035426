//! Sequence Execution Engine
//!
//! The engine owns the sequence state, the current step, the single in-flight
//! step run and the set of enforced constraints. It runs as an actor: one
//! task processes commands from a channel one at a time, so every state
//! transition (index change, constraint apply/stop, step launch) completes
//! before the next command is looked at.
//!
//! # Design Principles
//!
//! - **Single Writer**: only the actor task mutates engine state
//! - **Check Before Mutate**: every operation validates the transition table
//!   and its guards first; a rejected operation changes nothing
//! - **Generations**: each launch/halt bumps the run generation; a step
//!   completion or delay timer carrying an older generation is dropped
//! - **Safe Failure**: an external unit failure forces a stop through the
//!   emergency hook and always leaves the engine `Stopped`
//!
//! # Constraint ordering
//!
//! A step's scoped constraints are applied before its `run()` is launched and
//! stopped only after it completed, was halted, or the run ended. With
//! `ContinueWithDelay` the finishing step's scoped constraints are stopped
//! at completion and the next step's are applied after the delay; global
//! constraints stay enforced throughout.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{EngineConfig, ProgressionPolicy};
use crate::constraint::{Constraint, ConstraintError, ConstraintScope};
use crate::error::{Result, SequencerError};
use crate::events::{EngineEvent, EngineSnapshot, ProgressPhase};
use crate::ids::{ConstraintId, StepId};
use crate::registry::{ConstraintEntry, SequenceRegistry};
use crate::runner::{launch_step, ActiveRun, StepCompletion};
use crate::sequence_state::{SequenceContext, SequenceOperation as Op, SequenceState};
use crate::step::{ExecutableStep, HaltMode, StepError};
use crate::transport::{TransportReadiness, TransportStatus};

const EVENT_CAPACITY: usize = 256;

type Reply<T> = oneshot::Sender<Result<T>>;

/// Position, identity and name of one step, as seen by the UI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepSummary {
    pub position: usize,
    pub id: StepId,
    pub name: String,
}

enum Command {
    Start(Reply<()>),
    Restart(Reply<()>),
    Pause(Reply<SequenceState>),
    Resume(Reply<()>),
    Stop(Reply<()>),
    EmergencyStop(Reply<()>),
    Skip(Reply<()>),
    Repeat(Reply<StepId>),
    ReturnToPrevious(Reply<()>),

    AddStep(Arc<dyn ExecutableStep>, Reply<StepId>),
    InsertStep(usize, Arc<dyn ExecutableStep>, Reply<StepId>),
    RemoveStep(usize, Reply<StepId>),
    SwapSteps(usize, usize, Reply<()>),
    AddConstraint(ConstraintScope, Arc<dyn Constraint>, Reply<ConstraintId>),
    RemoveConstraint(ConstraintId, Reply<()>),
    SelectStep(usize, Reply<StepId>),
    Clear(Reply<()>),

    Visualize(ConstraintId, Reply<()>),
    StopVisualization(ConstraintId, Reply<()>),

    Steps(Reply<Vec<StepSummary>>),
    History(Reply<Vec<(SequenceState, u64)>>),
    Shutdown(Reply<()>),

    StepFinished(StepCompletion),
    DelayElapsed { generation: u64 },
}

/// Handle on a running engine. Cheap to clone; every clone talks to the
/// same actor.
#[derive(Clone)]
pub struct SequenceEngine {
    commands: mpsc::UnboundedSender<Command>,
    snapshot: watch::Receiver<EngineSnapshot>,
    events: broadcast::Sender<EngineEvent>,
}

impl SequenceEngine {
    /// Validate `config` and spawn the engine actor on the current tokio
    /// runtime.
    ///
    /// # Errors
    ///
    /// `Config` if the configuration is invalid (e.g. a delayed progression
    /// without a delay). Nothing is spawned in that case.
    pub fn spawn(
        registry: SequenceRegistry,
        config: &EngineConfig,
        transport: Arc<dyn TransportStatus>,
    ) -> Result<Self> {
        config.validate()?;
        let policy = config.policy()?;

        let (commands, inbox) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let initial = EngineSnapshot {
            step_count: registry.len(),
            policy,
            ..EngineSnapshot::default()
        };
        let (snapshot_tx, snapshot) = watch::channel(initial);

        info!(
            %policy,
            steps = registry.len(),
            transport = %TransportReadiness::of(transport.as_ref()),
            "Spawning sequence engine"
        );

        let actor = EngineActor {
            ctx: SequenceContext::new(),
            registry,
            policy,
            stop_grace: config.stop_grace(),
            transport,
            current: None,
            generation: 0,
            run: None,
            delay: None,
            phase: ProgressPhase::Idle,
            active_global: Vec::new(),
            active_scoped: Vec::new(),
            visualizing: Vec::new(),
            last_failure: None,
            self_tx: commands.downgrade(),
            snapshot_tx,
            events: events.clone(),
        };
        tokio::spawn(actor.run(inbox));

        Ok(Self {
            commands,
            snapshot,
            events,
        })
    }

    async fn request<T>(&self, make: impl FnOnce(Reply<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .map_err(|_| SequencerError::EngineUnavailable)?;
        rx.await.map_err(|_| SequencerError::EngineUnavailable)?
    }

    // =========================================================================
    // Run control
    // =========================================================================

    /// Start from `NotStarted`. A stopped sequence needs [`Self::restart`].
    pub async fn start(&self) -> Result<()> {
        self.request(Command::Start).await
    }

    /// Restart a stopped sequence from its first step.
    pub async fn restart(&self) -> Result<()> {
        self.request(Command::Restart).await
    }

    /// Toggle pause; returns the state after the toggle.
    pub async fn pause(&self) -> Result<SequenceState> {
        self.request(Command::Pause).await
    }

    /// Unpause a paused sequence.
    pub async fn resume(&self) -> Result<()> {
        self.request(Command::Resume).await
    }

    /// Graceful stop of the active run.
    pub async fn stop(&self) -> Result<()> {
        self.request(Command::Stop).await
    }

    /// Abort the running step through its emergency hook.
    pub async fn emergency_stop(&self) -> Result<()> {
        self.request(Command::EmergencyStop).await
    }

    /// Fire-and-forget emergency stop, callable from non-async contexts such
    /// as a signal handler. A rejection is logged by the engine and published
    /// as [`EngineEvent::EmergencyStopRejected`].
    pub fn request_emergency_stop(&self) {
        let (tx, _rx) = oneshot::channel();
        if self.commands.send(Command::EmergencyStop(tx)).is_err() {
            warn!("Emergency stop requested but the engine is gone");
        }
    }

    /// Halt the current step and continue with the next one.
    pub async fn skip(&self) -> Result<()> {
        self.request(Command::Skip).await
    }

    /// Duplicate the current step right after itself.
    pub async fn repeat(&self) -> Result<StepId> {
        self.request(Command::Repeat).await
    }

    /// Halt the current step and continue from the previous one.
    pub async fn return_to_previous(&self) -> Result<()> {
        self.request(Command::ReturnToPrevious).await
    }

    // =========================================================================
    // Registry editing
    // =========================================================================

    pub async fn add_step(&self, step: Arc<dyn ExecutableStep>) -> Result<StepId> {
        self.request(|r| Command::AddStep(step, r)).await
    }

    pub async fn insert_step(&self, position: usize, step: Arc<dyn ExecutableStep>) -> Result<StepId> {
        self.request(|r| Command::InsertStep(position, step, r)).await
    }

    /// Remove a step and its scoped constraints. The current step of an
    /// active run cannot be removed.
    pub async fn remove_step(&self, position: usize) -> Result<StepId> {
        self.request(|r| Command::RemoveStep(position, r)).await
    }

    pub async fn swap_steps(&self, a: usize, b: usize) -> Result<()> {
        self.request(|r| Command::SwapSteps(a, b, r)).await
    }

    pub async fn add_constraint(
        &self,
        scope: ConstraintScope,
        constraint: Arc<dyn Constraint>,
    ) -> Result<ConstraintId> {
        self.request(|r| Command::AddConstraint(scope, constraint, r))
            .await
    }

    pub async fn remove_constraint(&self, id: ConstraintId) -> Result<()> {
        self.request(|r| Command::RemoveConstraint(id, r)).await
    }

    pub async fn select_step(&self, position: usize) -> Result<StepId> {
        self.request(|r| Command::SelectStep(position, r)).await
    }

    /// Discard every step and constraint; rejected during an active run.
    pub async fn clear(&self) -> Result<()> {
        self.request(Command::Clear).await
    }

    // =========================================================================
    // Visualization
    // =========================================================================

    /// Show a constraint without enforcing it. Only while no run is active;
    /// a scoped constraint also needs its owning step selected.
    pub async fn visualize_constraint(&self, id: ConstraintId) -> Result<()> {
        self.request(|r| Command::Visualize(id, r)).await
    }

    pub async fn stop_visualization(&self, id: ConstraintId) -> Result<()> {
        self.request(|r| Command::StopVisualization(id, r)).await
    }

    // =========================================================================
    // Observation
    // =========================================================================

    pub async fn steps(&self) -> Result<Vec<StepSummary>> {
        self.request(Command::Steps).await
    }

    pub async fn transition_history(&self) -> Result<Vec<(SequenceState, u64)>> {
        self.request(Command::History).await
    }

    /// Latest published snapshot.
    pub fn snapshot(&self) -> EngineSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn state(&self) -> SequenceState {
        self.snapshot.borrow().state
    }

    pub fn subscribe_snapshots(&self) -> watch::Receiver<EngineSnapshot> {
        self.snapshot.clone()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    /// Wait until a published snapshot satisfies `predicate`.
    pub async fn wait_for<F>(&self, mut predicate: F) -> Result<EngineSnapshot>
    where
        F: FnMut(&EngineSnapshot) -> bool,
    {
        let mut rx = self.snapshot.clone();
        let snap = rx
            .wait_for(|s| predicate(s))
            .await
            .map_err(|_| SequencerError::EngineUnavailable)?;
        Ok(snap.clone())
    }

    /// Stop any active run and end the actor.
    pub async fn shutdown(&self) -> Result<()> {
        self.request(Command::Shutdown).await
    }
}

struct EngineActor {
    ctx: SequenceContext,
    registry: SequenceRegistry,
    policy: ProgressionPolicy,
    stop_grace: Duration,
    transport: Arc<dyn TransportStatus>,

    /// Current step by identity; its position is re-resolved on demand
    current: Option<StepId>,
    generation: u64,
    run: Option<ActiveRun>,
    delay: Option<JoinHandle<()>>,
    phase: ProgressPhase,

    active_global: Vec<ConstraintEntry>,
    active_scoped: Vec<ConstraintEntry>,
    visualizing: Vec<ConstraintEntry>,
    last_failure: Option<String>,

    self_tx: mpsc::WeakUnboundedSender<Command>,
    snapshot_tx: watch::Sender<EngineSnapshot>,
    events: broadcast::Sender<EngineEvent>,
}

impl EngineActor {
    async fn run(mut self, mut inbox: mpsc::UnboundedReceiver<Command>) {
        while let Some(command) = inbox.recv().await {
            let shutdown = matches!(command, Command::Shutdown(_));
            self.handle(command).await;
            self.publish_snapshot();
            if shutdown {
                break;
            }
        }

        if self.ctx.current().is_active() {
            warn!("Engine handle dropped during an active run, stopping");
            self.end_run(Op::Stop, HaltMode::Graceful).await.ok();
            self.publish_snapshot();
        }
        debug!("Sequence engine stopped");
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::Start(reply) => {
                let result = self.start().await;
                self.respond(reply, result);
            }
            Command::Restart(reply) => {
                let result = self.restart().await;
                self.respond(reply, result);
            }
            Command::Pause(reply) => {
                let result = self.toggle_pause().await;
                self.respond(reply, result);
            }
            Command::Resume(reply) => {
                let result = self.resume().await;
                self.respond(reply, result);
            }
            Command::Stop(reply) => {
                let result = self.stop(Op::Stop, HaltMode::Graceful).await;
                self.respond(reply, result);
            }
            Command::EmergencyStop(reply) => {
                let result = self.stop(Op::EmergencyStop, HaltMode::Emergency).await;
                if let Err(e) = &result {
                    if e.is_guard_violation() {
                        // Ctrl-C requests drop the reply receiver
                        warn!(error = %e, state = %self.ctx.current(), "Emergency stop rejected");
                        self.emit(EngineEvent::EmergencyStopRejected {
                            reason: e.to_string(),
                        });
                    }
                }
                self.respond(reply, result);
            }
            Command::Skip(reply) => {
                let result = self.skip().await;
                self.respond(reply, result);
            }
            Command::Repeat(reply) => {
                let result = self.repeat();
                self.respond(reply, result);
            }
            Command::ReturnToPrevious(reply) => {
                let result = self.return_to_previous().await;
                self.respond(reply, result);
            }

            Command::AddStep(step, reply) => {
                let id = self.registry.push_step(step);
                self.emit_edited();
                self.respond(reply, Ok(id));
            }
            Command::InsertStep(position, step, reply) => {
                let result = self.registry.insert_step(position, step);
                if result.is_ok() {
                    self.emit_edited();
                }
                self.respond(reply, result);
            }
            Command::RemoveStep(position, reply) => {
                let result = self.remove_step(position).await;
                self.respond(reply, result);
            }
            Command::SwapSteps(a, b, reply) => {
                let result = self.registry.swap_steps(a, b);
                if result.is_ok() {
                    self.emit_edited();
                }
                self.respond(reply, result);
            }
            Command::AddConstraint(scope, constraint, reply) => {
                let result = self.registry.add_constraint(scope, constraint);
                self.respond(reply, result);
            }
            Command::RemoveConstraint(id, reply) => {
                let result = self.remove_constraint(id).await;
                self.respond(reply, result);
            }
            Command::SelectStep(position, reply) => {
                let result = self.select_step(position).await;
                self.respond(reply, result);
            }
            Command::Clear(reply) => {
                let result = self.clear().await;
                self.respond(reply, result);
            }

            Command::Visualize(id, reply) => {
                let result = self.visualize(id).await;
                self.respond(reply, result);
            }
            Command::StopVisualization(id, reply) => {
                let result = self.stop_visualization(id).await;
                self.respond(reply, result);
            }

            Command::Steps(reply) => {
                let summaries = self
                    .registry
                    .steps()
                    .iter()
                    .enumerate()
                    .map(|(position, s)| StepSummary {
                        position,
                        id: s.id,
                        name: s.name().to_string(),
                    })
                    .collect();
                self.respond(reply, Ok(summaries));
            }
            Command::History(reply) => {
                let history = self.ctx.transition_history().to_vec();
                self.respond(reply, Ok(history));
            }
            Command::Shutdown(reply) => {
                let result = if self.ctx.current().is_active() {
                    self.end_run(Op::Stop, HaltMode::Graceful).await
                } else {
                    Ok(())
                };
                self.stop_all_visualizations().await;
                self.respond(reply, result);
            }

            Command::StepFinished(completion) => self.on_step_finished(completion).await,
            Command::DelayElapsed { generation } => self.on_delay_elapsed(generation).await,
        }
    }

    // =========================================================================
    // Start / Restart
    // =========================================================================

    async fn start(&mut self) -> Result<()> {
        self.ctx.check(Op::Start)?;
        self.check_start_guards()?;
        self.begin_run().await
    }

    async fn restart(&mut self) -> Result<()> {
        self.ctx.check(Op::Restart)?;
        self.check_start_guards()?;
        self.transition(Op::Restart)?;
        self.begin_run().await
    }

    /// Guards evaluated at call time, never cached.
    fn check_start_guards(&self) -> Result<()> {
        if self.registry.is_empty() {
            return Err(SequencerError::EmptySequence);
        }
        if !self.transport.permits_start() {
            return Err(SequencerError::TransportNotReady);
        }
        Ok(())
    }

    async fn begin_run(&mut self) -> Result<()> {
        self.stop_all_visualizations().await;
        self.transition(Op::Start)?;
        self.last_failure = None;

        let first = match self.registry.step_at(0) {
            Some(entry) => entry.id,
            None => return Err(SequencerError::EmptySequence),
        };
        self.current = Some(first);

        if let Err(e) = self.apply_globals().await {
            return Err(self.force_stop(e.into()).await);
        }
        if let Err(e) = self.apply_scoped(first).await {
            return Err(self.force_stop(e.into()).await);
        }
        self.launch_current();
        Ok(())
    }

    // =========================================================================
    // Pause / Resume
    // =========================================================================

    async fn toggle_pause(&mut self) -> Result<SequenceState> {
        if self.ctx.current() == SequenceState::Paused {
            self.resume().await?;
        } else {
            self.ctx.check(Op::Pause)?;
            self.enter_pause().await?;
        }
        Ok(self.ctx.current())
    }

    /// Running -> Paused: every enforced constraint is stopped. A pending
    /// inter-step delay is cancelled and progression resumes on unpause.
    async fn enter_pause(&mut self) -> Result<()> {
        if self.phase == ProgressPhase::Delaying {
            self.cancel_delay();
            self.generation += 1;
            self.phase = ProgressPhase::AwaitingResume;
        }

        if let Err(e) = self.stop_scoped().await {
            return Err(self.force_stop(e.into()).await);
        }
        if let Err(e) = self.stop_globals().await {
            return Err(self.force_stop(e.into()).await);
        }
        self.transition(Op::Pause)?;
        Ok(())
    }

    async fn resume(&mut self) -> Result<()> {
        self.ctx.check(Op::Resume)?;
        self.transition(Op::Resume)?;

        if let Err(e) = self.apply_globals().await {
            return Err(self.force_stop(e.into()).await);
        }

        if self.phase == ProgressPhase::AwaitingResume {
            // The current step finished while paused
            return self.next_or_finish().await;
        }

        if let Some(current) = self.current {
            if let Err(e) = self.apply_scoped(current).await {
                return Err(self.force_stop(e.into()).await);
            }
        }
        Ok(())
    }

    // =========================================================================
    // Stop / EmergencyStop
    // =========================================================================

    async fn stop(&mut self, op: Op, mode: HaltMode) -> Result<()> {
        self.ctx.check(op)?;
        self.end_run(op, mode).await
    }

    /// Halt the current step, tear down every constraint and enter Stopped.
    /// Teardown always completes; a failing hook is reported afterwards.
    async fn end_run(&mut self, op: Op, mode: HaltMode) -> Result<()> {
        let halted = self.halt_current(mode).await;
        let scoped = self.stop_scoped().await;
        let globals = self.stop_globals().await;

        self.transition(op)?;
        self.current = None;
        self.phase = ProgressPhase::Idle;

        let failure: Option<SequencerError> = match (halted, scoped, globals) {
            (Err(e), _, _) => Some(e.into()),
            (_, Err(e), _) | (_, _, Err(e)) => Some(e.into()),
            _ => None,
        };
        match failure {
            Some(err) => {
                self.record_failure(&err);
                Err(err)
            }
            None => Ok(()),
        }
    }

    // =========================================================================
    // Navigation
    // =========================================================================

    async fn skip(&mut self) -> Result<()> {
        self.ctx.check(Op::Skip)?;
        let index = self.require_current_index()?;

        if index + 1 >= self.registry.len() {
            info!(index, "Skip on the last step, stopping sequence");
            return self.end_run(Op::Stop, HaltMode::Skip).await;
        }

        info!(from = index, to = index + 1, "Skipping step");
        self.move_to(Op::Skip, HaltMode::Skip, index + 1).await
    }

    async fn return_to_previous(&mut self) -> Result<()> {
        self.ctx.check(Op::ReturnToPrevious)?;
        let index = self.require_current_index()?;
        if index == 0 {
            return Err(SequencerError::AtFirstStep);
        }

        info!(from = index, to = index - 1, "Returning to previous step");
        self.move_to(Op::ReturnToPrevious, HaltMode::Graceful, index - 1)
            .await
    }

    /// Shared path of Skip and ReturnToPrevious: halt, stop the current
    /// scoped constraints, re-enter Running (reapplying globals if we were
    /// paused) and launch `target`.
    async fn move_to(&mut self, op: Op, mode: HaltMode, target: usize) -> Result<()> {
        let was_paused = self.ctx.current() == SequenceState::Paused;

        if let Err(e) = self.halt_current(mode).await {
            return Err(self.force_stop(e.into()).await);
        }
        if let Err(e) = self.stop_scoped().await {
            return Err(self.force_stop(e.into()).await);
        }

        self.transition(op)?;
        if was_paused {
            if let Err(e) = self.apply_globals().await {
                return Err(self.force_stop(e.into()).await);
            }
        }
        self.advance_to(target).await
    }

    fn repeat(&mut self) -> Result<StepId> {
        self.ctx.check(Op::Repeat)?;
        let index = self.require_current_index()?;
        let copy = self.registry.duplicate_step(index)?;
        info!(index, copy = %copy, "Repeating step");
        self.emit_edited();
        Ok(copy)
    }

    // =========================================================================
    // Progression
    // =========================================================================

    async fn on_step_finished(&mut self, completion: StepCompletion) {
        let expected = self.run.as_ref().map(ActiveRun::generation);
        if completion.generation != self.generation || expected != Some(completion.generation) {
            debug!(
                generation = completion.generation,
                current = self.generation,
                "Dropping stale step completion"
            );
            return;
        }
        self.run = None;

        let index = self
            .current
            .and_then(|id| self.registry.position_of(id))
            .unwrap_or(0);

        if let Err(step_error) = completion.outcome {
            error!(index, step = %completion.step, error = %step_error, "Step failed");
            let failed = self.registry.step(completion.step).map(|e| Arc::clone(&e.step));
            if let Some(step) = failed {
                if let Err(e) = step.emergency_stop().await {
                    warn!(error = %e, "Emergency hook of failed step also failed");
                }
            }
            self.force_stop(step_error.into()).await;
            return;
        }

        info!(index, step = %completion.step, "Step completed");
        self.emit(EngineEvent::StepFinished {
            index,
            step: completion.step,
        });

        let is_last = index + 1 >= self.registry.len();
        if is_last {
            info!("Last step completed, stopping sequence");
            self.end_run(Op::Stop, HaltMode::Graceful).await.ok();
            return;
        }

        if self.ctx.current() == SequenceState::Paused {
            self.phase = ProgressPhase::AwaitingResume;
            return;
        }

        if self.transition(Op::StepCompleted).is_err() {
            return;
        }

        let result = match self.policy {
            ProgressionPolicy::AutoContinue => match self.stop_scoped().await {
                Ok(()) => self.advance_to(index + 1).await,
                Err(e) => Err(self.force_stop(e.into()).await),
            },
            ProgressionPolicy::PauseAfterEach => {
                self.phase = ProgressPhase::AwaitingResume;
                self.enter_pause().await
            }
            ProgressionPolicy::ContinueWithDelay(delay) => match self.stop_scoped().await {
                Ok(()) => {
                    self.schedule_delay(delay);
                    Ok(())
                }
                Err(e) => Err(self.force_stop(e.into()).await),
            },
        };
        if let Err(e) = result {
            debug!(error = %e, "Progression ended in a forced stop");
        }
    }

    async fn on_delay_elapsed(&mut self, generation: u64) {
        if generation != self.generation || self.phase != ProgressPhase::Delaying {
            debug!(generation, "Dropping stale delay timer");
            return;
        }
        self.delay = None;
        if let Err(e) = self.next_or_finish().await {
            debug!(error = %e, "Progression ended in a forced stop");
        }
    }

    fn schedule_delay(&mut self, delay: Duration) {
        let generation = self.generation;
        let tx = self.self_tx.clone();
        debug!(delay_ms = delay.as_millis() as u64, "Waiting before next step");
        self.delay = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(tx) = tx.upgrade() {
                let _ = tx.send(Command::DelayElapsed { generation });
            }
        }));
        self.phase = ProgressPhase::Delaying;
    }

    fn cancel_delay(&mut self) {
        if let Some(timer) = self.delay.take() {
            timer.abort();
        }
    }

    /// Advance past a finished current step, or end the run after the last.
    async fn next_or_finish(&mut self) -> Result<()> {
        let index = self.require_current_index()?;
        if index + 1 >= self.registry.len() {
            return self.end_run(Op::Stop, HaltMode::Graceful).await;
        }
        self.advance_to(index + 1).await
    }

    /// Make `target` current: apply its scoped constraints, then launch it.
    async fn advance_to(&mut self, target: usize) -> Result<()> {
        let id = match self.registry.step_at(target) {
            Some(entry) => entry.id,
            None => {
                let err = SequencerError::IndexOutOfRange {
                    index: target,
                    len: self.registry.len(),
                };
                return Err(self.force_stop(err).await);
            }
        };
        self.current = Some(id);

        if let Err(e) = self.apply_scoped(id).await {
            return Err(self.force_stop(e.into()).await);
        }
        self.launch_current();
        Ok(())
    }

    fn launch_current(&mut self) {
        let Some(id) = self.current else { return };
        let Some(index) = self.registry.position_of(id) else { return };
        let Some(entry) = self.registry.step_at(index).cloned() else { return };

        self.generation += 1;
        let tx = self.self_tx.clone();
        let run = launch_step(&entry, self.generation, move |completion| {
            if let Some(tx) = tx.upgrade() {
                let _ = tx.send(Command::StepFinished(completion));
            }
        });
        self.run = Some(run);
        self.phase = ProgressPhase::Executing;
        self.emit(EngineEvent::StepStarted {
            index,
            step: id,
            name: entry.name().to_string(),
        });
    }

    /// Halt the in-flight run (if any) and invalidate pending signals.
    ///
    /// A run that outlives the grace period is escalated to its emergency
    /// hook and reported as [`StepError::StopTimedOut`]; callers must not
    /// launch another step after that error.
    async fn halt_current(&mut self, mode: HaltMode) -> std::result::Result<(), StepError> {
        self.cancel_delay();
        self.generation += 1;

        let Some(mut run) = self.run.take() else {
            return Ok(());
        };
        let step = run.step_id();
        let index = self.registry.position_of(step).unwrap_or(0);
        self.emit(EngineEvent::StepHalted { index, step, mode });

        let result = run.halt(mode, self.stop_grace).await;
        if matches!(result, Err(StepError::StopTimedOut { .. })) && mode != HaltMode::Emergency {
            warn!(step = %step, %mode, "Step ignored the halt, escalating to emergency stop");
            if let Err(e) = run.halt(HaltMode::Emergency, self.stop_grace).await {
                warn!(step = %step, error = %e, "Step still not stopped, detaching");
            }
        }
        result
    }

    /// External-unit failure: emergency-halt whatever is in flight, tear
    /// everything down, end in Stopped and report.
    async fn force_stop(&mut self, err: SequencerError) -> SequencerError {
        error!(error = %err, state = %self.ctx.current(), "Forcing sequence stop");

        if let Err(e) = self.halt_current(HaltMode::Emergency).await {
            warn!(error = %e, "Emergency hook failed during forced stop");
        }
        if let Err(e) = self.stop_scoped().await {
            warn!(error = %e, "Scoped constraint teardown failed during forced stop");
        }
        if let Err(e) = self.stop_globals().await {
            warn!(error = %e, "Global constraint teardown failed during forced stop");
        }

        if self.ctx.check(Op::Fail).is_ok() {
            let _ = self.transition(Op::Fail);
        }
        self.current = None;
        self.phase = ProgressPhase::Idle;
        self.record_failure(&err);
        err
    }

    fn record_failure(&mut self, err: &SequencerError) {
        self.last_failure = Some(err.to_string());
        self.emit(EngineEvent::Failed {
            reason: err.to_string(),
        });
    }

    // =========================================================================
    // Constraints
    // =========================================================================

    async fn apply_globals(&mut self) -> std::result::Result<(), ConstraintError> {
        for entry in self.registry.global_constraints() {
            if self.active_global.iter().any(|c| c.id == entry.id) {
                continue;
            }
            entry.constraint.apply().await?;
            debug!(constraint = %entry.id, name = entry.name(), "Applied global constraint");
            self.emit(EngineEvent::ConstraintApplied {
                constraint: entry.id,
                name: entry.name().to_string(),
            });
            self.active_global.push(entry);
        }
        Ok(())
    }

    async fn apply_scoped(&mut self, step: StepId) -> std::result::Result<(), ConstraintError> {
        for entry in self.registry.scoped_constraints(step) {
            if self.active_scoped.iter().any(|c| c.id == entry.id) {
                continue;
            }
            entry.constraint.apply().await?;
            debug!(constraint = %entry.id, name = entry.name(), %step, "Applied scoped constraint");
            self.emit(EngineEvent::ConstraintApplied {
                constraint: entry.id,
                name: entry.name().to_string(),
            });
            self.active_scoped.push(entry);
        }
        Ok(())
    }

    async fn stop_scoped(&mut self) -> std::result::Result<(), ConstraintError> {
        let active = std::mem::take(&mut self.active_scoped);
        self.stop_entries(active).await
    }

    async fn stop_globals(&mut self) -> std::result::Result<(), ConstraintError> {
        let active = std::mem::take(&mut self.active_global);
        self.stop_entries(active).await
    }

    /// Stop in reverse apply order. Every entry is attempted; the first
    /// failure is returned.
    async fn stop_entries(
        &mut self,
        entries: Vec<ConstraintEntry>,
    ) -> std::result::Result<(), ConstraintError> {
        let mut first_error = None;
        for entry in entries.into_iter().rev() {
            match entry.constraint.stop().await {
                Ok(()) => {
                    debug!(constraint = %entry.id, name = entry.name(), "Stopped constraint");
                    self.emit(EngineEvent::ConstraintStopped {
                        constraint: entry.id,
                        name: entry.name().to_string(),
                    });
                }
                Err(e) => {
                    warn!(constraint = %entry.id, error = %e, "Constraint stop failed");
                    first_error.get_or_insert(e);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    async fn visualize(&mut self, id: ConstraintId) -> Result<()> {
        let state = self.ctx.current();
        if !state.is_idle() {
            return Err(SequencerError::visualization(format!(
                "sequence is {}",
                state
            )));
        }
        let entry = self
            .registry
            .constraint(id)
            .cloned()
            .ok_or(SequencerError::UnknownConstraint(id))?;
        if let Some(owner) = entry.scope.owner() {
            if self.registry.selected() != Some(owner) {
                return Err(SequencerError::visualization(
                    "select the owning step first",
                ));
            }
        }
        if self.visualizing.iter().any(|c| c.id == id) {
            return Ok(());
        }
        entry.constraint.visualize().await?;
        self.visualizing.push(entry);
        Ok(())
    }

    async fn stop_visualization(&mut self, id: ConstraintId) -> Result<()> {
        let Some(position) = self.visualizing.iter().position(|c| c.id == id) else {
            return Ok(());
        };
        let entry = self.visualizing.remove(position);
        entry.constraint.stop_visualization().await?;
        Ok(())
    }

    async fn stop_visualizations_where<F>(&mut self, mut predicate: F)
    where
        F: FnMut(&ConstraintEntry) -> bool,
    {
        let (stop, keep): (Vec<_>, Vec<_>) =
            std::mem::take(&mut self.visualizing).into_iter().partition(|c| predicate(c));
        self.visualizing = keep;
        for entry in stop {
            if let Err(e) = entry.constraint.stop_visualization().await {
                warn!(constraint = %entry.id, error = %e, "Stopping visualization failed");
            }
        }
    }

    async fn stop_all_visualizations(&mut self) {
        self.stop_visualizations_where(|_| true).await;
    }

    // =========================================================================
    // Registry editing
    // =========================================================================

    async fn remove_step(&mut self, position: usize) -> Result<StepId> {
        if self.ctx.current().is_active() {
            if let Some(current) = self.current {
                if self.registry.position_of(current) == Some(position) {
                    return Err(SequencerError::StepIsCurrent(current));
                }
            }
        }
        let removed = self.registry.remove_step(position)?;
        let orphaned: Vec<ConstraintId> =
            removed.orphaned_constraints.iter().map(|c| c.id).collect();
        self.stop_visualizations_where(|c| orphaned.contains(&c.id))
            .await;
        self.emit_edited();
        Ok(removed.entry.id)
    }

    async fn remove_constraint(&mut self, id: ConstraintId) -> Result<()> {
        let entry = self.registry.remove_constraint(id)?;

        let was_active = self.active_global.iter().any(|c| c.id == id)
            || self.active_scoped.iter().any(|c| c.id == id);
        self.active_global.retain(|c| c.id != id);
        self.active_scoped.retain(|c| c.id != id);
        if was_active {
            if let Err(e) = self.stop_entries(vec![entry]).await {
                // A failed teardown of an enforced constraint is a unit failure
                return Err(self.force_stop(e.into()).await);
            }
        } else {
            self.stop_visualizations_where(|c| c.id == id).await;
        }
        Ok(())
    }

    async fn select_step(&mut self, position: usize) -> Result<StepId> {
        let id = self.registry.select(position)?;
        self.stop_visualizations_where(|c| matches!(c.scope.owner(), Some(owner) if owner != id))
            .await;
        Ok(id)
    }

    async fn clear(&mut self) -> Result<()> {
        if self.ctx.current().is_active() {
            if let Some(current) = self.current {
                return Err(SequencerError::StepIsCurrent(current));
            }
        }
        self.stop_all_visualizations().await;
        self.registry.clear();
        self.emit_edited();
        Ok(())
    }

    // =========================================================================
    // Bookkeeping
    // =========================================================================

    fn require_current_index(&self) -> Result<usize> {
        let current = self
            .current
            .ok_or(SequencerError::IndexOutOfRange {
                index: 0,
                len: self.registry.len(),
            })?;
        self.registry
            .position_of(current)
            .ok_or(SequencerError::UnknownStep(current))
    }

    fn transition(&mut self, op: Op) -> Result<SequenceState> {
        let from = self.ctx.current();
        let to = self.ctx.apply(op)?;
        if from != to {
            info!(%from, %to, operation = %op, "Sequence state changed");
            self.emit(EngineEvent::StateChanged { from, to });
            // Restarting is observable even though it is left immediately
            self.publish_snapshot();
        }
        Ok(to)
    }

    /// Publish first so a caller woken by the reply sees the new snapshot.
    fn respond<T>(&self, reply: Reply<T>, result: Result<T>) {
        self.publish_snapshot();
        let _ = reply.send(result);
    }

    fn emit(&self, event: EngineEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn emit_edited(&self) {
        self.emit(EngineEvent::SequenceEdited {
            step_count: self.registry.len(),
        });
    }

    fn snapshot(&self) -> EngineSnapshot {
        let active = self.ctx.current().is_active();
        EngineSnapshot {
            state: self.ctx.current(),
            current_index: if active {
                self.current.and_then(|id| self.registry.position_of(id))
            } else {
                None
            },
            current_step: if active { self.current } else { None },
            step_count: self.registry.len(),
            phase: self.phase,
            policy: self.policy,
            active_global: self.active_global.iter().map(|c| c.id).collect(),
            active_scoped: self.active_scoped.iter().map(|c| c.id).collect(),
            visualizing: self.visualizing.iter().map(|c| c.id).collect(),
            last_failure: self.last_failure.clone(),
        }
    }

    fn publish_snapshot(&self) {
        self.snapshot_tx.send_replace(self.snapshot());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulated::{Activity, ActivityLog, LoggingConstraint, SimulatedStep};
    use crate::transport::TransportFlags;

    fn engine_with(steps: &[(&str, u64)], log: &ActivityLog, config: &EngineConfig) -> SequenceEngine {
        let mut registry = SequenceRegistry::new();
        for (name, ms) in steps {
            registry.push_step(Arc::new(SimulatedStep::new(
                *name,
                Duration::from_millis(*ms),
                log.clone(),
            )));
        }
        SequenceEngine::spawn(registry, config, Arc::new(TransportFlags::disabled()))
            .expect("spawn engine")
    }

    #[tokio::test(start_paused = true)]
    async fn test_runs_to_completion_and_stops() {
        let log = ActivityLog::new();
        let engine = engine_with(&[("a", 10), ("b", 10)], &log, &EngineConfig::default());

        engine.start().await.expect("start");
        let snap = engine
            .wait_for(|s| s.state == SequenceState::Stopped)
            .await
            .expect("engine alive");

        assert_eq!(snap.current_index, None);
        assert_eq!(snap.phase, ProgressPhase::Idle);
        assert_eq!(log.count(&Activity::StepFinished("a".into())), 1);
        assert_eq!(log.count(&Activity::StepFinished("b".into())), 1);
        assert!(snap.last_failure.is_none());
    }

    #[tokio::test]
    async fn test_start_empty_sequence_rejected() {
        let log = ActivityLog::new();
        let engine = engine_with(&[], &log, &EngineConfig::default());

        assert_eq!(engine.start().await, Err(SequencerError::EmptySequence));
        assert_eq!(engine.state(), SequenceState::NotStarted);
    }

    #[tokio::test]
    async fn test_transport_not_ready_rejected() {
        let transport = TransportFlags::ready();
        transport.set_ready(false);
        let mut registry = SequenceRegistry::new();
        registry.push_step(Arc::new(SimulatedStep::new(
            "a",
            Duration::from_millis(10),
            ActivityLog::new(),
        )));
        let engine =
            SequenceEngine::spawn(registry, &EngineConfig::default(), Arc::new(transport.clone()))
                .expect("spawn");

        assert_eq!(engine.start().await, Err(SequencerError::TransportNotReady));
        transport.set_ready(true);
        engine.start().await.expect("start once connected");
        engine.stop().await.expect("stop");
    }

    #[tokio::test]
    async fn test_invalid_config_fails_fast() {
        let config = EngineConfig {
            progression: crate::config::ProgressionMode::ContinueWithDelay,
            delay_ms: None,
            ..EngineConfig::default()
        };
        let result = SequenceEngine::spawn(
            SequenceRegistry::new(),
            &config,
            Arc::new(TransportFlags::disabled()),
        );
        assert!(matches!(result, Err(SequencerError::Config(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_global_constraint_stopped_on_stop() {
        let log = ActivityLog::new();
        let engine = engine_with(&[("a", 60_000)], &log, &EngineConfig::default());
        let g = engine
            .add_constraint(
                ConstraintScope::Global,
                Arc::new(LoggingConstraint::new("g", log.clone())),
            )
            .await
            .expect("add");

        engine.start().await.expect("start");
        assert_eq!(engine.snapshot().active_global, vec![g]);

        engine.stop().await.expect("stop");
        let snap = engine.snapshot();
        assert_eq!(snap.state, SequenceState::Stopped);
        assert!(!snap.has_active_constraints());
        assert_eq!(log.count(&Activity::ConstraintStopped("g".into())), 1);
        assert_eq!(log.count(&Activity::StepStopped("a".into())), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_step_forces_stop() {
        let log = ActivityLog::new();
        let mut registry = SequenceRegistry::new();
        registry.push_step(Arc::new(
            SimulatedStep::new("a", Duration::from_millis(5), log.clone()).failing("gripper jam"),
        ));
        let engine = SequenceEngine::spawn(
            registry,
            &EngineConfig::default(),
            Arc::new(TransportFlags::disabled()),
        )
        .expect("spawn");

        engine.start().await.expect("start");
        let snap = engine
            .wait_for(|s| s.state == SequenceState::Stopped)
            .await
            .expect("engine alive");

        let failure = snap.last_failure.expect("failure recorded");
        assert!(failure.contains("gripper jam"));
        assert_eq!(log.count(&Activity::StepEmergencyStopped("a".into())), 1);
    }

    #[tokio::test]
    async fn test_handle_reports_shutdown() {
        let log = ActivityLog::new();
        let engine = engine_with(&[("a", 10)], &log, &EngineConfig::default());

        engine.shutdown().await.expect("shutdown");
        assert_eq!(engine.start().await, Err(SequencerError::EngineUnavailable));
    }
}
