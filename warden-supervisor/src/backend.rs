//! Backend capability interface.
//!
//! The lifecycle state machine is written once against this trait; each
//! platform supplies the concrete process/socket/RPC wiring. Selection
//! happens at construction, never through inheritance-style dispatch deeper
//! in the machine.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast;

use warden_core::{InstanceConfig, Notification};

use crate::control::{ControlApi, ControlClient};
use crate::layout::SocketSet;
use crate::policy::SupervisorPolicy;
use crate::port::find_usable_port;
use crate::process::ComponentSet;
use crate::SupervisorError;

/// Platform capabilities behind the lifecycle state machine.
#[async_trait]
pub trait Backend: Send + Sync + 'static {
    /// Spawn the helper components and wait for their readiness signals.
    /// `events` is the instance notification stream the components (and
    /// their watchers) publish into.
    async fn spawn_components(
        &self,
        events: broadcast::Sender<Notification>,
    ) -> Result<ComponentSet, SupervisorError>;

    /// Control client bound to this backend's hypervisor endpoint.
    fn control(&self) -> Arc<dyn ControlApi>;

    /// Host socket the guest dials for first-boot configuration.
    fn ignition_socket(&self) -> &Path;

    /// Host socket the guest pokes once boot completes.
    fn readiness_socket(&self) -> &Path;
}

/// Production backend: external network-proxy and hypervisor-control
/// processes reached over the instance socket set.
pub struct ProcessBackend {
    config: InstanceConfig,
    sockets: SocketSet,
    ssh_port: u16,
    policy: SupervisorPolicy,
    control: Arc<ControlClient>,
}

impl ProcessBackend {
    /// Wire a backend for `config`. Allocates the host SSH forward port
    /// immediately so a saturated port range fails before anything spawns.
    ///
    /// # Errors
    /// Returns [`SupervisorError::PortRangeExhausted`] when no port at or
    /// above the policy floor is free.
    pub fn new(
        config: InstanceConfig,
        sockets: SocketSet,
        policy: SupervisorPolicy,
    ) -> Result<Self, SupervisorError> {
        let ssh_port = find_usable_port(policy.ssh_port_floor)?;
        let control = Arc::new(ControlClient::new(sockets.control.clone(), policy.rpc_timeout));
        Ok(Self {
            config,
            sockets,
            ssh_port,
            policy,
            control,
        })
    }

    /// Host port forwarded to the guest's sshd.
    #[must_use]
    pub fn ssh_port(&self) -> u16 {
        self.ssh_port
    }
}

#[async_trait]
impl Backend for ProcessBackend {
    async fn spawn_components(
        &self,
        events: broadcast::Sender<Notification>,
    ) -> Result<ComponentSet, SupervisorError> {
        ComponentSet::spawn(
            &self.config,
            &self.sockets,
            self.ssh_port,
            &self.policy,
            events,
        )
        .await
    }

    fn control(&self) -> Arc<dyn ControlApi> {
        Arc::clone(&self.control) as Arc<dyn ControlApi>
    }

    fn ignition_socket(&self) -> &Path {
        &self.sockets.ignition
    }

    fn readiness_socket(&self) -> &Path {
        &self.sockets.ready
    }
}
