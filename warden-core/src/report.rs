//! Wire types for the hypervisor control API.
//!
//! Field names follow the hypervisor's JSON (camelCase); the capability
//! flags are computed by the hypervisor, never by the client.

use std::path::PathBuf;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Guest run state as reported by the hypervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuestRunState {
    Starting,
    Running,
    Pausing,
    Paused,
    Resuming,
    Stopping,
    Stopped,
    /// A state this supervisor version does not know. Capability flags still
    /// apply, so operations degrade safely instead of failing to parse.
    Unknown,
}

impl GuestRunState {
    /// Decode a wire state name; anything unfamiliar degrades to `Unknown`.
    #[must_use]
    pub fn from_name(name: &str) -> Self {
        match name {
            "Starting" => Self::Starting,
            "Running" => Self::Running,
            "Pausing" => Self::Pausing,
            "Paused" => Self::Paused,
            "Resuming" => Self::Resuming,
            "Stopping" => Self::Stopping,
            "Stopped" => Self::Stopped,
            _ => Self::Unknown,
        }
    }

    /// The wire name.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Starting => "Starting",
            Self::Running => "Running",
            Self::Pausing => "Pausing",
            Self::Paused => "Paused",
            Self::Resuming => "Resuming",
            Self::Stopping => "Stopping",
            Self::Stopped => "Stopped",
            Self::Unknown => "Unknown",
        }
    }
}

impl Serialize for GuestRunState {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.name())
    }
}

impl<'de> Deserialize<'de> for GuestRunState {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        Ok(Self::from_name(&name))
    }
}

/// Response body of `GET /state` on the control socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VmStateReport {
    pub state: GuestRunState,
    pub can_start: bool,
    pub can_pause: bool,
    pub can_resume: bool,
    pub can_request_stop: bool,
    pub can_stop: bool,
}

/// Response body of `GET /info` on the control socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceInfo {
    /// Host path of the proxied container-runtime socket.
    pub podman_socket_path: PathBuf,

    /// Host port forwarded to the guest's sshd.
    pub ssh_port: u16,

    pub ssh_user: String,
    pub ssh_public_key_path: PathBuf,
    pub ssh_private_key_path: PathBuf,
}
