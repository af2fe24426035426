//! Snippet Sequencer Library
//!
//! Ordered execution of robot-program snippets: a validated state machine,
//! a registry of steps and constraints, and an engine that applies
//! constraints around each step and progresses through the sequence.

pub mod cli;
pub mod config;
pub mod console;
pub mod constraint;
pub mod engine;
pub mod error;
pub mod events;
pub mod ids;
pub mod registry;
pub mod runner;
pub mod sequence_state;
pub mod simulated;
pub mod step;
pub mod transport;

// Re-export main types for convenience
pub use config::{EngineConfig, ProgressionMode, ProgressionPolicy};
pub use constraint::{Constraint, ConstraintError, ConstraintScope};
pub use engine::{SequenceEngine, StepSummary};
pub use error::{Result, SequencerError};
pub use events::{EngineEvent, EngineSnapshot, ProgressPhase};
pub use ids::{ConstraintId, StepId};
pub use registry::{ConstraintEntry, SequenceRegistry, StepEntry};
pub use sequence_state::{
    SequenceContext, SequenceOperation, SequenceState, SequenceTransitionError,
};
pub use step::{ExecutableStep, HaltMode, StepError};
pub use transport::{TransportFlags, TransportReadiness, TransportStatus};
