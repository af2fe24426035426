//! Sequence State Machine
//!
//! This module is the authoritative transition table for a snippet sequence.
//! It knows nothing about steps, constraints or timers: it only answers
//! "is this operation legal from this state, and where does it lead".
//! The engine consults it before touching anything else so that a rejected
//! operation never leaves half-applied side effects behind.
//!
//! # State Flow
//!
//! ```text
//!              Start                 Stop / EmergencyStop / last step done
//! NotStarted ───────► Running ◄──────────────────────────────┐
//!                      │  ▲                                  │
//!               Pause  │  │ Pause / Resume / Skip / Back     │
//!                      ▼  │                                  ▼
//!                     Paused ─────────── Stop ──────────► Stopped
//!                                                            │
//!                      Running ◄── Start ── Restarting ◄─────┘ Restart
//! ```
//!
//! There is no terminal state: `Stopped` is left through `Restart`.

use std::fmt;
use strum::{Display, EnumIter};
use thiserror::Error;

/// Lifecycle state of one workflow's sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, EnumIter)]
pub enum SequenceState {
    /// Sequence has never been started
    #[default]
    NotStarted,

    /// A step is executing (or progression is in flight)
    Running,

    /// Execution is suspended and every constraint is stopped
    Paused,

    /// Run was stopped, emergency-stopped, failed, or finished its last step
    Stopped,

    /// Transient state between Restart and the internal Start
    Restarting,
}

impl SequenceState {
    /// Returns true while a run owns the current step index
    #[inline]
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Running | Self::Paused)
    }

    /// Returns true when no run exists and the sequence may be edited freely
    #[inline]
    pub const fn is_idle(self) -> bool {
        matches!(self, Self::NotStarted | Self::Stopped)
    }

    /// Returns a human-readable description of this state
    pub const fn description(self) -> &'static str {
        match self {
            Self::NotStarted => "Not started",
            Self::Running => "Running",
            Self::Paused => "Paused",
            Self::Stopped => "Stopped",
            Self::Restarting => "Restarting",
        }
    }

    /// Compute the state reached by applying `operation` from `self`.
    ///
    /// This is a pure function; callers apply the result only after every
    /// other guard (sequence length, transport, index bounds) has passed.
    pub fn transition(
        self,
        operation: SequenceOperation,
    ) -> Result<SequenceState, SequenceTransitionError> {
        use SequenceOperation as Op;
        use SequenceState as S;

        let not_allowed = || SequenceTransitionError::NotAllowed {
            from: self,
            operation,
        };

        match (self, operation) {
            (S::NotStarted | S::Restarting, Op::Start) => Ok(S::Running),
            (S::Stopped, Op::Start) => Err(SequenceTransitionError::RestartRequired),
            (S::Running | S::Paused, Op::Start) => {
                Err(SequenceTransitionError::AlreadyActive { from: self })
            }

            (S::Stopped, Op::Restart) => Ok(S::Restarting),

            (S::Running, Op::Pause) => Ok(S::Paused),
            (S::Paused, Op::Pause | Op::Resume) => Ok(S::Running),

            (S::Running | S::Paused, Op::Stop) => Ok(S::Stopped),

            (S::Running, Op::EmergencyStop) => Ok(S::Stopped),
            (S::Paused, Op::EmergencyStop) => {
                Err(SequenceTransitionError::EmergencyStopWhilePaused)
            }

            (S::Running | S::Paused, Op::Skip | Op::ReturnToPrevious) => Ok(S::Running),
            (S::Running | S::Paused, Op::Repeat | Op::StepCompleted) => Ok(self),

            (S::Running | S::Paused | S::Restarting, Op::Fail) => Ok(S::Stopped),

            _ => Err(not_allowed()),
        }
    }
}

impl fmt::Display for SequenceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// Every operation the transition table knows about.
///
/// `StepCompleted` and `Fail` are internal: they are produced by the engine
/// itself when a step finishes or an external unit fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter)]
#[strum(serialize_all = "snake_case")]
pub enum SequenceOperation {
    Start,
    Restart,
    /// Toggle between Running and Paused
    Pause,
    /// Explicit unpause
    Resume,
    Stop,
    EmergencyStop,
    Skip,
    Repeat,
    ReturnToPrevious,
    StepCompleted,
    Fail,
}

/// Errors that can occur during state transitions
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SequenceTransitionError {
    /// Generic rejection: the operation has no edge from this state
    #[error("Cannot {operation} while {from}")]
    NotAllowed {
        from: SequenceState,
        operation: SequenceOperation,
    },

    /// Start was called on a stopped sequence
    #[error("Sequence is stopped, use restart instead of start")]
    RestartRequired,

    /// Start was called while a run is already active
    #[error("Sequence is already active ({from})")]
    AlreadyActive { from: SequenceState },

    /// Emergency stop only applies to a running sequence
    #[error("Cannot emergency stop while paused, use stop instead")]
    EmergencyStopWhilePaused,
}

/// Owner of the current sequence state.
///
/// Validates every transition through [`SequenceState::transition`] and keeps
/// a timestamped history of accepted state changes for diagnostics.
///
/// # Example
///
/// ```
/// use snippet_sequencer::sequence_state::{SequenceContext, SequenceOperation, SequenceState};
///
/// let mut ctx = SequenceContext::new();
/// ctx.apply(SequenceOperation::Start).unwrap();
/// assert_eq!(ctx.current(), SequenceState::Running);
///
/// // Paused sequences must be stopped, not emergency-stopped
/// ctx.apply(SequenceOperation::Pause).unwrap();
/// assert!(ctx.apply(SequenceOperation::EmergencyStop).is_err());
/// assert_eq!(ctx.current(), SequenceState::Paused);
/// ```
#[derive(Debug, Clone)]
pub struct SequenceContext {
    current: SequenceState,

    /// Accepted state changes as (new state, unix timestamp)
    history: Vec<(SequenceState, u64)>,
}

impl Default for SequenceContext {
    fn default() -> Self {
        Self::new()
    }
}

impl SequenceContext {
    /// Create a new context in the NotStarted state.
    pub fn new() -> Self {
        Self {
            current: SequenceState::NotStarted,
            history: Vec::new(),
        }
    }

    /// Returns the current state
    #[inline]
    pub fn current(&self) -> SequenceState {
        self.current
    }

    /// Returns the state history as a slice of (state, timestamp) pairs
    pub fn transition_history(&self) -> &[(SequenceState, u64)] {
        &self.history
    }

    /// Check an operation without applying it.
    pub fn check(&self, operation: SequenceOperation) -> Result<SequenceState, SequenceTransitionError> {
        self.current.transition(operation)
    }

    /// Validate and apply an operation.
    ///
    /// On error the current state is left untouched.
    pub fn apply(
        &mut self,
        operation: SequenceOperation,
    ) -> Result<SequenceState, SequenceTransitionError> {
        let next = self.current.transition(operation)?;
        if next != self.current {
            self.record(next);
            self.current = next;
        }
        Ok(next)
    }

    fn record(&mut self, state: SequenceState) {
        let timestamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);

        self.history.push((state, timestamp));
    }
}
