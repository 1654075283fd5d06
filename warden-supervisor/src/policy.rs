//! Tunable timing policy.
//!
//! Historical deployments disagreed on several of these constants (10 s vs
//! 30 s launch windows, 100–500 ms RPC deadlines), so none of them is
//! hard-coded: callers override what they need and keep the defaults for the
//! rest.

use std::path::PathBuf;
use std::time::Duration;

/// Retry and timeout knobs for one supervisor instance.
#[derive(Debug, Clone)]
pub struct SupervisorPolicy {
    /// Upper bound on `start()` reaching `Ready` after ignition.
    pub launch_timeout: Duration,

    /// Per-call deadline for steady-state control RPCs. The socket is local;
    /// anything slower means the hypervisor is wedged.
    pub rpc_timeout: Duration,

    /// Deadline for the best-effort graceful stop RPC.
    pub stop_rpc_timeout: Duration,

    /// Upper bound on the guest dialing the ignition channel.
    pub ignition_timeout: Duration,

    /// Interval between component readiness probes.
    pub component_poll_interval: Duration,

    /// Probe budget per component before `ComponentStartTimeout`.
    pub component_poll_retries: u32,

    /// Grace period between SIGTERM and SIGKILL during stop.
    pub term_grace: Duration,

    /// Attempts at the post-resume guest clock resync.
    pub clock_sync_retries: u32,

    /// Interval between clock resync attempts.
    pub clock_sync_interval: Duration,

    /// Lowest host port probed for the guest SSH forward.
    pub ssh_port_floor: u16,

    /// Program used for guest shell access during clock resync. Tests point
    /// this at a recording stub.
    pub ssh_program: PathBuf,
}

impl Default for SupervisorPolicy {
    fn default() -> Self {
        Self {
            launch_timeout: Duration::from_secs(10),
            rpc_timeout: Duration::from_millis(200),
            stop_rpc_timeout: Duration::from_millis(500),
            ignition_timeout: Duration::from_secs(10),
            component_poll_interval: Duration::from_millis(100),
            component_poll_retries: 50,
            term_grace: Duration::from_secs(3),
            clock_sync_retries: 3,
            clock_sync_interval: Duration::from_secs(1),
            ssh_port_floor: 2222,
            ssh_program: PathBuf::from("ssh"),
        }
    }
}

impl SupervisorPolicy {
    /// Total time the component readiness poll may take.
    #[must_use]
    pub fn component_budget(&self) -> Duration {
        self.component_poll_interval * self.component_poll_retries
    }
}
