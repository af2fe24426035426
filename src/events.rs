//! Outbound notifications for UI collaborators.
//!
//! The engine never reads anything back from these: they exist so panels can
//! lock/unlock buttons and highlight the current step. Two channels are
//! published:
//!
//! - a `watch` of [`EngineSnapshot`], replaced after every processed command;
//! - a `broadcast` of [`EngineEvent`], one per observable side effect.

use crate::config::ProgressionPolicy;
use crate::ids::{ConstraintId, StepId};
use crate::sequence_state::SequenceState;
use crate::step::HaltMode;

/// Where the step progression currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProgressPhase {
    /// No run
    #[default]
    Idle,
    /// The current step's `run()` is in flight
    Executing,
    /// The current step finished; progression resumes on unpause
    AwaitingResume,
    /// The current step finished; waiting out the inter-step delay
    Delaying,
}

/// One observable side effect of the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    StateChanged {
        from: SequenceState,
        to: SequenceState,
    },
    StepStarted {
        index: usize,
        step: StepId,
        name: String,
    },
    StepFinished {
        index: usize,
        step: StepId,
    },
    StepHalted {
        index: usize,
        step: StepId,
        mode: HaltMode,
    },
    ConstraintApplied {
        constraint: ConstraintId,
        name: String,
    },
    ConstraintStopped {
        constraint: ConstraintId,
        name: String,
    },
    SequenceEdited {
        step_count: usize,
    },
    /// An external unit failed and the run was forced to stop
    Failed {
        reason: String,
    },
    /// An emergency stop was refused (e.g. while paused)
    EmergencyStopRejected {
        reason: String,
    },
}

/// Consistent view of the engine after a command was processed.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EngineSnapshot {
    pub state: SequenceState,
    /// Only meaningful while Running/Paused
    pub current_index: Option<usize>,
    pub current_step: Option<StepId>,
    pub step_count: usize,
    pub phase: ProgressPhase,
    pub policy: ProgressionPolicy,
    /// Global constraints currently enforced, in apply order
    pub active_global: Vec<ConstraintId>,
    /// Scoped constraints of the current step currently enforced
    pub active_scoped: Vec<ConstraintId>,
    pub visualizing: Vec<ConstraintId>,
    pub last_failure: Option<String>,
}

impl EngineSnapshot {
    /// Every enforced constraint, globals first.
    pub fn active_constraints(&self) -> Vec<ConstraintId> {
        self.active_global
            .iter()
            .chain(self.active_scoped.iter())
            .copied()
            .collect()
    }

    pub fn has_active_constraints(&self) -> bool {
        !self.active_global.is_empty() || !self.active_scoped.is_empty()
    }
}
