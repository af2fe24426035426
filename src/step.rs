//! Executable step contract.
//!
//! A step (snippet) is an opaque unit of robot behavior supplied by the
//! authoring layer. The engine only ever drives it through [`ExecutableStep`];
//! it never inspects the concrete type.
//!
//! # Contract
//!
//! - `run()` completes when the step has finished its work. Returning `Err`
//!   is an external-unit failure and forces the sequence into a safe stop.
//! - `stop()` asks for a graceful stop. `run()` is expected to return soon
//!   after, once the unit reached a safe pose.
//! - `emergency_stop()` asks for an immediate abort (e.g. halt motion now).
//! - `skip()` is only a hint (fast-forward animations); the engine always
//!   follows it with `stop()`.
//!
//! `stop`, `emergency_stop` and `skip` are called from the engine while
//! `run` is in flight on another task, so implementors need interior
//! mutability (a `Notify`, a watch channel, an atomic flag).

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Failure reported by a step.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StepError {
    /// The step's own logic reported a failure
    #[error("{0}")]
    Failed(String),

    /// The step task panicked
    #[error("step task panicked: {0}")]
    Panicked(String),

    /// A stop or emergency-stop hook failed
    #[error("stop hook failed: {0}")]
    StopFailed(String),

    /// The halt hook or `run()` did not return within the grace period
    #[error("step '{name}' did not stop within {grace_ms} ms")]
    StopTimedOut { name: String, grace_ms: u64 },
}

impl StepError {
    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed(msg.into())
    }

    pub fn stop_failed(msg: impl Into<String>) -> Self {
        Self::StopFailed(msg.into())
    }
}

/// An opaque executable snippet.
#[async_trait]
pub trait ExecutableStep: Send + Sync + fmt::Debug {
    /// Display name for logs and the operator console.
    fn name(&self) -> &str;

    /// Execute the step; resolves when it is finished.
    async fn run(&self) -> Result<(), StepError>;

    /// Graceful stop.
    async fn stop(&self) -> Result<(), StepError>;

    /// Abort path, distinct from graceful stop.
    async fn emergency_stop(&self) -> Result<(), StepError>;

    /// Fast-forward hint issued before a skip.
    async fn skip(&self) {}

    /// Create an independent copy of this step (used by Repeat).
    fn duplicate(&self) -> Arc<dyn ExecutableStep>;
}

/// Which hook the engine uses to halt the current step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HaltMode {
    Graceful,
    Emergency,
    /// `skip()` hint followed by a graceful stop
    Skip,
}

impl HaltMode {
    /// Invoke the matching hook(s) on `step`.
    pub async fn apply(self, step: &dyn ExecutableStep) -> Result<(), StepError> {
        match self {
            Self::Graceful => step.stop().await,
            Self::Emergency => step.emergency_stop().await,
            Self::Skip => {
                step.skip().await;
                step.stop().await
            }
        }
    }
}

impl fmt::Display for HaltMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Graceful => write!(f, "stop"),
            Self::Emergency => write!(f, "emergency stop"),
            Self::Skip => write!(f, "skip"),
        }
    }
}
