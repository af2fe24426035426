//! Constraint contract and scoping.
//!
//! A constraint restricts robot behavior (a keep-out zone, a speed cap, a
//! force limit). Global constraints are enforced for the whole run; scoped
//! constraints only while their owning step is the current step.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

use crate::ids::StepId;

/// Failure reported by a constraint hook.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConstraintError {
    #[error("apply of '{name}' failed: {reason}")]
    Apply { name: String, reason: String },

    #[error("stop of '{name}' failed: {reason}")]
    Stop { name: String, reason: String },

    #[error("visualization of '{name}' failed: {reason}")]
    Visualize { name: String, reason: String },
}

/// An opaque restriction plugged in by the authoring layer.
#[async_trait]
pub trait Constraint: Send + Sync + fmt::Debug {
    /// Display name for logs.
    fn name(&self) -> &str;

    /// Start enforcing the restriction.
    async fn apply(&self) -> Result<(), ConstraintError>;

    /// Stop enforcing the restriction.
    async fn stop(&self) -> Result<(), ConstraintError>;

    /// Show the restriction's effect without enforcing it.
    async fn visualize(&self) -> Result<(), ConstraintError>;

    /// Hide a visualization started by [`Constraint::visualize`].
    async fn stop_visualization(&self) -> Result<(), ConstraintError>;

    /// Create an independent copy (used when a step is repeated).
    fn duplicate(&self) -> Arc<dyn Constraint>;
}

/// When a constraint is relevant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConstraintScope {
    /// Active for the whole run (except while paused)
    Global,
    /// Active only while the given step is current
    Scoped(StepId),
}

impl ConstraintScope {
    #[inline]
    pub fn is_global(&self) -> bool {
        matches!(self, Self::Global)
    }

    /// Owning step of a scoped constraint.
    #[inline]
    pub fn owner(&self) -> Option<StepId> {
        match self {
            Self::Global => None,
            Self::Scoped(id) => Some(*id),
        }
    }

    #[inline]
    pub fn is_owned_by(&self, step: StepId) -> bool {
        self.owner() == Some(step)
    }
}

impl fmt::Display for ConstraintScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Global => write!(f, "global"),
            Self::Scoped(id) => write!(f, "scoped to {}", id),
        }
    }
}
