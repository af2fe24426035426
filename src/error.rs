//! Error handling module for the sequencer
//!
//! Provides centralized error handling with proper error types using thiserror.
//! Guard violations, external-unit failures and configuration problems all end
//! up in [`SequencerError`] so callers have one type to match on.

use thiserror::Error;

use crate::constraint::ConstraintError;
use crate::ids::{ConstraintId, StepId};
use crate::sequence_state::SequenceTransitionError;
use crate::step::StepError;

/// Main error type for the sequencer
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SequencerError {
    /// The requested operation is not valid for the current sequence state
    #[error(transparent)]
    Transition(#[from] SequenceTransitionError),

    /// Start/Restart was requested on a sequence with no steps
    #[error("Cannot start an empty sequence")]
    EmptySequence,

    /// A position argument does not address an existing step
    #[error("Index {index} is out of range for a sequence of {len} step(s)")]
    IndexOutOfRange { index: usize, len: usize },

    /// The robot transport is enabled but not connected
    #[error("Robot transport is not ready")]
    TransportNotReady,

    /// ReturnToPrevious was requested while already on the first step
    #[error("Already at the first step, there is no previous step")]
    AtFirstStep,

    /// A registry mutation would remove the step that is currently executing
    #[error("Step {0} is the current step of an active run")]
    StepIsCurrent(StepId),

    /// No step with this identity is registered
    #[error("Unknown step {0}")]
    UnknownStep(StepId),

    /// No constraint with this identity is registered
    #[error("Unknown constraint {0}")]
    UnknownConstraint(ConstraintId),

    /// Constraint visualization is not possible right now
    #[error("Cannot visualize constraint: {0}")]
    VisualizationUnavailable(String),

    /// A step signalled a failure while running or while being stopped
    #[error("Step failed: {0}")]
    Step(#[from] StepError),

    /// A constraint signalled a failure while being applied or stopped
    #[error("Constraint failed: {0}")]
    Constraint(#[from] ConstraintError),

    /// Configuration errors (loading, parsing, validation)
    #[error("Configuration error: {0}")]
    Config(String),

    /// The engine task is gone (shut down or panicked)
    #[error("Sequence engine is not running")]
    EngineUnavailable,
}

/// Result type alias for sequencer operations
pub type Result<T> = std::result::Result<T, SequencerError>;

impl SequencerError {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a visualization error
    pub fn visualization(msg: impl Into<String>) -> Self {
        Self::VisualizationUnavailable(msg.into())
    }

    /// Returns true for guard violations: the operation was rejected and
    /// nothing was mutated.
    pub fn is_guard_violation(&self) -> bool {
        matches!(
            self,
            Self::Transition(_)
                | Self::EmptySequence
                | Self::IndexOutOfRange { .. }
                | Self::TransportNotReady
                | Self::AtFirstStep
                | Self::StepIsCurrent(_)
                | Self::UnknownStep(_)
                | Self::UnknownConstraint(_)
                | Self::VisualizationUnavailable(_)
        )
    }

    /// Returns true when an external unit failed and the engine forced a stop.
    pub fn is_unit_failure(&self) -> bool {
        matches!(self, Self::Step(_) | Self::Constraint(_))
    }
}
