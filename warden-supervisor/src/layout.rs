//! Per-instance socket paths.

use std::io;
use std::path::{Path, PathBuf};

/// The fixed set of Unix-domain sockets one instance owns.
///
/// Paths are pure string construction from the instance socket directory and
/// name; instances in disjoint workspaces can never collide. Each socket
/// serves exactly one purpose.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct SocketSet {
    /// Hypervisor control RPC endpoint (served by the hypervisor process).
    pub control: PathBuf,

    /// Notification ingress (served by this process).
    pub notify: PathBuf,

    /// Guest first-boot ignition channel (served by this process, dialed by
    /// the guest through the hypervisor's virtual-socket bridge).
    pub ignition: PathBuf,

    /// Guest boot-complete signal (served by this process).
    pub ready: PathBuf,

    /// Network-proxy datapath endpoint (served by the proxy process).
    pub vmnet: PathBuf,

    /// Proxied container-runtime API socket (served by the proxy process).
    pub podman: PathBuf,
}

impl SocketSet {
    /// Derive the socket set for `name` under `socket_dir`. No I/O.
    #[must_use]
    pub fn for_instance(socket_dir: &Path, name: &str) -> Self {
        let sock = |suffix: &str| socket_dir.join(format!("{name}-{suffix}.sock"));
        Self {
            control: sock("control"),
            notify: sock("events"),
            ignition: sock("ignition"),
            ready: sock("ready"),
            vmnet: sock("vmnet"),
            podman: sock("podman"),
        }
    }

    /// All paths in the set.
    #[must_use]
    pub fn all(&self) -> [&Path; 6] {
        [
            &self.control,
            &self.notify,
            &self.ignition,
            &self.ready,
            &self.vmnet,
            &self.podman,
        ]
    }

    /// Unlink leftovers from a prior crashed run. A missing file is success.
    ///
    /// # Errors
    /// Returns the first unlink error other than `NotFound`.
    pub async fn unlink_stale(&self) -> io::Result<()> {
        for path in self.all() {
            match tokio::fs::remove_file(path).await {
                Ok(()) => {
                    tracing::debug!(socket = %path.display(), "removed stale socket");
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Best-effort removal of every socket during teardown.
    pub async fn remove_all(&self) {
        for path in self.all() {
            let _ = tokio::fs::remove_file(path).await;
        }
    }
}
