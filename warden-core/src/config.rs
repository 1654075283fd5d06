//! Instance configuration supplied by the embedding application.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::CoreError;

/// Paths to the external binaries and guest boot resources.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourcePaths {
    /// Path to the network-proxy binary.
    pub proxy_bin: PathBuf,

    /// Path to the hypervisor-control binary.
    pub hypervisor_bin: PathBuf,

    /// Path to the guest kernel image.
    pub kernel: PathBuf,

    /// Path to the initial ramdisk image.
    pub initrd: PathBuf,

    /// Path to the guest root filesystem image.
    pub rootfs: PathBuf,
}

/// A host directory exposed to the guest as a virtiofs share.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharedDir {
    /// Directory on the host.
    pub host_path: PathBuf,

    /// Mount point inside the guest.
    pub guest_path: String,

    /// virtiofs mount tag the hypervisor attaches the share under.
    pub tag: String,
}

impl SharedDir {
    /// Create a share with a tag derived from the guest mount point.
    #[must_use]
    pub fn new(host_path: PathBuf, guest_path: impl Into<String>, tag: impl Into<String>) -> Self {
        Self {
            host_path,
            guest_path: guest_path.into(),
            tag: tag.into(),
        }
    }
}

/// Immutable per-instance configuration, created by the caller.
///
/// One `InstanceConfig` describes one VM instance. Instances running
/// concurrently must use disjoint `workspace` directories; every socket and
/// log path is derived from it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceConfig {
    /// Instance name, used in socket filenames and child-process arguments.
    pub name: String,

    /// Number of virtual CPUs for the guest.
    pub cpus: u8,

    /// Guest memory size in mebibytes.
    pub memory_mib: u32,

    /// External binaries and guest boot resources.
    pub resources: ResourcePaths,

    /// Per-instance workspace directory. Sockets live in
    /// `<workspace>/sock`, logs in `<workspace>/log`, guest disks and the
    /// version manifest at the top level.
    pub workspace: PathBuf,

    /// Component name → version string; drives the materialized-resource
    /// refresh decision and is forwarded verbatim to the hypervisor.
    pub versions: BTreeMap<String, String>,

    /// SSH public key installed into the guest during ignition.
    pub ssh_public_key: String,

    /// Host directories mounted into the guest at first boot.
    pub shared_dirs: Vec<SharedDir>,

    /// Guest timezone, e.g. `"UTC"` or `"Asia/Shanghai"`.
    pub timezone: String,

    /// Ask the hypervisor to throttle the guest when the host is on battery.
    pub power_save: bool,
}

impl InstanceConfig {
    /// Check the fields that would otherwise fail deep inside the start
    /// sequence with a confusing error.
    ///
    /// # Errors
    /// Returns [`CoreError::InvalidConfig`] naming the offending field.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.name.is_empty() {
            return Err(CoreError::InvalidConfig {
                field: "name".to_owned(),
                reason: "must not be empty".to_owned(),
            });
        }
        if self.name.contains(['/', '\0']) {
            return Err(CoreError::InvalidConfig {
                field: "name".to_owned(),
                reason: "must not contain '/' or NUL".to_owned(),
            });
        }
        if self.cpus == 0 {
            return Err(CoreError::InvalidConfig {
                field: "cpus".to_owned(),
                reason: "must be at least 1".to_owned(),
            });
        }
        if self.memory_mib == 0 {
            return Err(CoreError::InvalidConfig {
                field: "memory_mib".to_owned(),
                reason: "must be at least 1 MiB".to_owned(),
            });
        }
        if self.workspace.as_os_str().is_empty() {
            return Err(CoreError::InvalidConfig {
                field: "workspace".to_owned(),
                reason: "must not be empty".to_owned(),
            });
        }
        Ok(())
    }

    /// Render the versions map as the `key=value,key=value` flag argument
    /// consumed by the hypervisor-control binary. `BTreeMap` keeps the
    /// rendering deterministic.
    #[must_use]
    pub fn versions_flag(&self) -> String {
        self.versions
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Directory the per-instance sockets are created in.
    #[must_use]
    pub fn socket_dir(&self) -> PathBuf {
        self.workspace.join("sock")
    }

    /// Directory the child-process log sinks write to.
    #[must_use]
    pub fn log_dir(&self) -> PathBuf {
        self.workspace.join("log")
    }
}

#[doc(hidden)]
pub mod tests_support {
    //! Fixture constructors shared by unit tests across the workspace.

    use std::collections::BTreeMap;
    use std::path::PathBuf;

    use super::{InstanceConfig, ResourcePaths};

    /// A syntactically valid config pointing at nonexistent paths.
    #[must_use]
    pub fn minimal_config() -> InstanceConfig {
        let mut versions = BTreeMap::new();
        versions.insert("image".to_owned(), "v1".to_owned());
        versions.insert("data".to_owned(), "v2".to_owned());

        InstanceConfig {
            name: "default".to_owned(),
            cpus: 1,
            memory_mib: 1024,
            resources: ResourcePaths {
                proxy_bin: PathBuf::from("/opt/warden/vmnet-proxy"),
                hypervisor_bin: PathBuf::from("/opt/warden/hyperctl"),
                kernel: PathBuf::from("/opt/warden/vmlinuz"),
                initrd: PathBuf::from("/opt/warden/initrd.img"),
                rootfs: PathBuf::from("/opt/warden/rootfs.img"),
            },
            workspace: PathBuf::from("/tmp/warden-test"),
            versions,
            ssh_public_key: "ssh-ed25519 AAAATESTKEY warden".to_owned(),
            shared_dirs: Vec::new(),
            timezone: "UTC".to_owned(),
            power_save: false,
        }
    }
}
