//! Typed notification events republished from child-process callbacks.

use std::fmt;

use serde::{Deserialize, Serialize};

/// The closed vocabulary of out-of-band events child processes may report.
///
/// Decoding happens exactly once, at the notification-server boundary;
/// unrecognized names are dropped there and never reach consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NotifyEventKind {
    /// The hypervisor is preparing guest resources.
    Initializing,
    /// The network proxy has bound its endpoints.
    ProxyReady,
    /// The guest connected to the ignition channel.
    IgnitionInProgress,
    /// First-boot configuration was delivered.
    IgnitionDone,
    /// The guest is fully booted and serviceable.
    Ready,
    /// A component reports a fatal condition; payload is human-readable.
    Error,
    /// A component is exiting.
    Exit,
}

impl NotifyEventKind {
    /// Decode a wire event name. Returns `None` for anything outside the
    /// closed vocabulary; callers drop those rather than erroring.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "Initializing" => Some(Self::Initializing),
            "ProxyReady" => Some(Self::ProxyReady),
            "IgnitionInProgress" => Some(Self::IgnitionInProgress),
            "IgnitionDone" => Some(Self::IgnitionDone),
            "Ready" => Some(Self::Ready),
            "Error" => Some(Self::Error),
            "Exit" => Some(Self::Exit),
            _ => None,
        }
    }

    /// The wire name, inverse of [`NotifyEventKind::from_name`].
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Initializing => "Initializing",
            Self::ProxyReady => "ProxyReady",
            Self::IgnitionInProgress => "IgnitionInProgress",
            Self::IgnitionDone => "IgnitionDone",
            Self::Ready => "Ready",
            Self::Error => "Error",
            Self::Exit => "Exit",
        }
    }
}

impl fmt::Display for NotifyEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One event on the notification stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct Notification {
    pub kind: NotifyEventKind,

    /// Free-form payload; empty for most kinds, the error text for
    /// [`NotifyEventKind::Error`].
    pub message: String,
}

impl Notification {
    #[must_use]
    pub fn new(kind: NotifyEventKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_round_trips_through_from_name() {
        for kind in [
            NotifyEventKind::Initializing,
            NotifyEventKind::ProxyReady,
            NotifyEventKind::IgnitionInProgress,
            NotifyEventKind::IgnitionDone,
            NotifyEventKind::Ready,
            NotifyEventKind::Error,
            NotifyEventKind::Exit,
        ] {
            assert_eq!(NotifyEventKind::from_name(kind.name()), Some(kind));
        }
    }

    #[test]
    fn notification_carries_message() {
        let n = Notification::new(NotifyEventKind::Error, "disk image missing");
        assert_eq!(n.kind, NotifyEventKind::Error);
        assert_eq!(n.message, "disk image missing");
    }
}
