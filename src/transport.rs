//! Robot transport readiness.
//!
//! The engine does not talk to the robot middleware itself. It only needs to
//! know, at Start/Restart time, whether the transport is disabled (offline
//! authoring, simulation) or connected without error.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Readiness signal exposed by the transport layer.
pub trait TransportStatus: Send + Sync {
    /// Transport is switched off entirely; runs do not need it.
    fn is_disabled(&self) -> bool;

    /// Transport is connected without error.
    fn is_ready(&self) -> bool;

    /// Start guard: either disabled or ready.
    fn permits_start(&self) -> bool {
        self.is_disabled() || self.is_ready()
    }
}

/// Observable readiness summary, mostly for logs and the console.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportReadiness {
    Disabled,
    Ready,
    NotReady,
}

impl TransportReadiness {
    pub fn of(status: &dyn TransportStatus) -> Self {
        if status.is_disabled() {
            Self::Disabled
        } else if status.is_ready() {
            Self::Ready
        } else {
            Self::NotReady
        }
    }
}

impl fmt::Display for TransportReadiness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disabled => write!(f, "Disabled"),
            Self::Ready => write!(f, "Ready"),
            Self::NotReady => write!(f, "Not ready"),
        }
    }
}

/// Shared, clonable readiness flags.
///
/// The transport layer flips these as its connection comes and goes; the
/// engine reads them at call time.
#[derive(Debug, Clone, Default)]
pub struct TransportFlags {
    inner: Arc<Flags>,
}

#[derive(Debug, Default)]
struct Flags {
    disabled: AtomicBool,
    ready: AtomicBool,
}

impl TransportFlags {
    /// Flags for a transport that is switched off.
    pub fn disabled() -> Self {
        let flags = Self::default();
        flags.set_disabled(true);
        flags
    }

    /// Flags for a connected transport.
    pub fn ready() -> Self {
        let flags = Self::default();
        flags.set_ready(true);
        flags
    }

    pub fn set_disabled(&self, disabled: bool) {
        self.inner.disabled.store(disabled, Ordering::SeqCst);
    }

    pub fn set_ready(&self, ready: bool) {
        self.inner.ready.store(ready, Ordering::SeqCst);
        tracing::debug!(ready, "Transport readiness changed");
    }
}

impl TransportStatus for TransportFlags {
    fn is_disabled(&self) -> bool {
        self.inner.disabled.load(Ordering::SeqCst)
    }

    fn is_ready(&self) -> bool {
        self.inner.ready.load(Ordering::SeqCst)
    }
}
