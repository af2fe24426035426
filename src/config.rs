//! Engine configuration: progression policy and run tuning.
//!
//! The configuration file is plain JSON so operators can keep one per cell:
//!
//! ```json
//! {
//!   "progression": "continue_with_delay",
//!   "delay_ms": 1500,
//!   "stop_grace_ms": 2000,
//!   "transport_disabled": false
//! }
//! ```
//!
//! Invalid combinations (a delayed progression with no delay) are rejected by
//! [`EngineConfig::validate`] before any engine is spawned.

use anyhow::{Context, Result as AnyResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::Path;
use std::time::Duration;
use strum::{Display, EnumIter, EnumString};

use crate::error::{Result, SequencerError};

/// What the engine does after a step completes (file-level selector).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ProgressionMode {
    /// Pause after every step and wait for the operator
    PauseAfterEach,
    /// Start the next step immediately
    #[default]
    AutoContinue,
    /// Wait `delay_ms` between steps
    ContinueWithDelay,
}

/// Resolved progression policy, read-only during a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProgressionPolicy {
    PauseAfterEach,
    #[default]
    AutoContinue,
    ContinueWithDelay(Duration),
}

impl ProgressionPolicy {
    pub fn mode(&self) -> ProgressionMode {
        match self {
            Self::PauseAfterEach => ProgressionMode::PauseAfterEach,
            Self::AutoContinue => ProgressionMode::AutoContinue,
            Self::ContinueWithDelay(_) => ProgressionMode::ContinueWithDelay,
        }
    }
}

impl fmt::Display for ProgressionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ContinueWithDelay(delay) => {
                write!(f, "continue_with_delay ({} ms)", delay.as_millis())
            }
            other => write!(f, "{}", other.mode()),
        }
    }
}

/// Default time a stopped step gets to reach a quiescent point.
pub const DEFAULT_STOP_GRACE_MS: u64 = 2_000;

/// Engine configuration that can be saved/loaded
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub progression: ProgressionMode,
    /// Required when `progression` is `continue_with_delay`
    pub delay_ms: Option<u64>,
    pub stop_grace_ms: u64,
    pub transport_disabled: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            progression: ProgressionMode::AutoContinue,
            delay_ms: None,
            stop_grace_ms: DEFAULT_STOP_GRACE_MS,
            transport_disabled: false,
        }
    }
}

impl EngineConfig {
    /// Configuration for a given policy with default tuning.
    pub fn with_policy(policy: ProgressionPolicy) -> Self {
        let delay_ms = match policy {
            ProgressionPolicy::ContinueWithDelay(delay) => Some(delay.as_millis() as u64),
            _ => None,
        };
        Self {
            progression: policy.mode(),
            delay_ms,
            ..Self::default()
        }
    }

    /// Apply command-line overrides on top of a loaded file, then validate
    /// the result. A delayed progression without a delay is rejected here,
    /// never filled in.
    pub fn apply_overrides(
        &mut self,
        progression: Option<ProgressionMode>,
        delay_ms: Option<u64>,
    ) -> Result<()> {
        if let Some(mode) = progression {
            self.progression = mode;
        }
        if delay_ms.is_some() {
            self.delay_ms = delay_ms;
        }
        self.validate()
    }

    /// Save configuration to a JSON file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> AnyResult<()> {
        let json = serde_json::to_string_pretty(self)
            .context("Failed to serialize engine configuration to JSON")?;

        fs::write(&path, json).with_context(|| {
            format!("Failed to write engine configuration to {:?}", path.as_ref())
        })?;

        Ok(())
    }

    /// Load configuration from a JSON file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> AnyResult<Self> {
        let content = fs::read_to_string(&path).with_context(|| {
            format!("Failed to read engine configuration from {:?}", path.as_ref())
        })?;

        let config: Self =
            serde_json::from_str(&content).context("Failed to parse engine configuration JSON")?;

        Ok(config)
    }

    /// Resolve the progression policy, failing on a missing delay.
    pub fn policy(&self) -> Result<ProgressionPolicy> {
        match self.progression {
            ProgressionMode::PauseAfterEach => Ok(ProgressionPolicy::PauseAfterEach),
            ProgressionMode::AutoContinue => Ok(ProgressionPolicy::AutoContinue),
            ProgressionMode::ContinueWithDelay => self
                .delay_ms
                .map(|ms| ProgressionPolicy::ContinueWithDelay(Duration::from_millis(ms)))
                .ok_or_else(|| {
                    SequencerError::config("continue_with_delay requires delay_ms to be set")
                }),
        }
    }

    /// Grace period for a stopped step to return from `run()`.
    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.policy()?;

        if self.delay_ms.is_some() && self.progression != ProgressionMode::ContinueWithDelay {
            tracing::debug!(
                progression = %self.progression,
                "delay_ms is ignored for this progression mode"
            );
        }

        Ok(())
    }
}
