//! Supervisor-side lifecycle states.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle state of one supervised VM instance.
///
/// Transitions are driven by caller commands and by notification events:
///
/// ```text
/// Created → Starting → Ready → {Pausing → Paused → Resuming → Ready}
///                                   → Stopping → Stopped
/// ```
///
/// `Failed` is reachable from `Starting`, `Pausing` and `Resuming`, and
/// always follows a best-effort teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LifecycleState {
    Created,
    Starting,
    Ready,
    Pausing,
    Paused,
    Resuming,
    Stopping,
    Stopped,
    Failed,
}

impl LifecycleState {
    /// `true` for states no further caller command except `start` can leave.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, LifecycleState::Stopped | LifecycleState::Failed)
    }

    /// `true` while a `start` attempt may still be issued.
    #[must_use]
    pub fn can_start(self) -> bool {
        matches!(
            self,
            LifecycleState::Created | LifecycleState::Stopped | LifecycleState::Failed
        )
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LifecycleState::Created => "Created",
            LifecycleState::Starting => "Starting",
            LifecycleState::Ready => "Ready",
            LifecycleState::Pausing => "Pausing",
            LifecycleState::Paused => "Paused",
            LifecycleState::Resuming => "Resuming",
            LifecycleState::Stopping => "Stopping",
            LifecycleState::Stopped => "Stopped",
            LifecycleState::Failed => "Failed",
        };
        write!(f, "{name}")
    }
}
