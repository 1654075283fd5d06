//! Host power-event source abstraction.
//!
//! The OS power monitor is process-wide; the supervisor only ever sees this
//! narrow capability interface, so tests (and embedders on platforms without
//! a native source) drive sleep/wake deterministically. Each instance takes
//! its own receiver; dropping it is the per-instance unsubscription.

use tokio::sync::broadcast;

/// A host power transition the supervisor reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerEvent {
    /// The host is about to sleep; the guest should be paused.
    Sleep,
    /// The host woke up; the guest should be resumed.
    Wake,
}

/// Source of host sleep/wake signals.
pub trait PowerMonitor: Send + Sync {
    /// Subscribe to the event feed. Every subscriber sees every event sent
    /// after subscription.
    fn subscribe(&self) -> broadcast::Receiver<PowerEvent>;
}

/// A power source driven by explicit calls.
///
/// This is the deterministic in-tree implementation: embedders bridge their
/// platform's notifications into [`ManualPowerMonitor::announce`], and tests
/// fire transitions directly.
#[derive(Debug)]
pub struct ManualPowerMonitor {
    tx: broadcast::Sender<PowerEvent>,
}

impl ManualPowerMonitor {
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(8);
        Self { tx }
    }

    /// Publish a power transition to every subscribed instance.
    pub fn announce(&self, event: PowerEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for ManualPowerMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl PowerMonitor for ManualPowerMonitor {
    fn subscribe(&self) -> broadcast::Receiver<PowerEvent> {
        self.tx.subscribe()
    }
}
