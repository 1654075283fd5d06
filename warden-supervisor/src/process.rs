//! Child-process supervision for the network proxy and hypervisor.
//!
//! Both components are spawned with a deterministic, fully specified
//! argument vector; the flag names are a compatibility contract with the
//! external binaries and must not drift. Children are detached into their
//! own process group so a host crash cannot reap a live guest; each child is
//! handed the host pid via `-bind-pid` and self-terminates if the host
//! vanishes. Within a running instance the pair is linked: if either process
//! exits outside an intentional stop, its sibling is killed immediately so a
//! half-running VM never survives.

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::process::{Child, Command};
use tokio::sync::{broadcast, Mutex};
use tokio::time::Instant;

use warden_core::{InstanceConfig, Notification, NotifyEventKind};

use crate::control::ControlApi;
use crate::layout::SocketSet;
use crate::logsink::LogSink;
use crate::policy::SupervisorPolicy;
use crate::SupervisorError;

/// Interval between liveness polls of a running child.
const WATCH_INTERVAL: Duration = Duration::from_millis(250);

/// Interval between reap polls while waiting out the SIGTERM grace period.
const REAP_INTERVAL: Duration = Duration::from_millis(50);

/// Argument vector for the network-proxy binary.
#[must_use]
pub fn build_proxy_args(config: &InstanceConfig, sockets: &SocketSet, ssh_port: u16) -> Vec<String> {
    vec![
        "-name".to_owned(),
        config.name.clone(),
        "-log-path".to_owned(),
        config.log_dir().display().to_string(),
        "-listen".to_owned(),
        format!("unix://{}", sockets.vmnet.display()),
        "-forward-sock".to_owned(),
        format!("unix://{}", sockets.podman.display()),
        "-ssh-port".to_owned(),
        ssh_port.to_string(),
        "-event-socket-path".to_owned(),
        sockets.notify.display().to_string(),
        "-bind-pid".to_owned(),
        std::process::id().to_string(),
    ]
}

/// Argument vector for the hypervisor-control binary.
#[must_use]
pub fn build_hypervisor_args(config: &InstanceConfig, sockets: &SocketSet) -> Vec<String> {
    vec![
        "-name".to_owned(),
        config.name.clone(),
        "-log-path".to_owned(),
        config.log_dir().display().to_string(),
        "-socket-path".to_owned(),
        sockets.control.display().to_string(),
        "-cpus".to_owned(),
        config.cpus.to_string(),
        "-memory".to_owned(),
        config.memory_mib.to_string(),
        "-kernel-path".to_owned(),
        config.resources.kernel.display().to_string(),
        "-initrd-path".to_owned(),
        config.resources.initrd.display().to_string(),
        "-rootfs-path".to_owned(),
        config.resources.rootfs.display().to_string(),
        "-target-path".to_owned(),
        config.workspace.display().to_string(),
        "-versions".to_owned(),
        config.versions_flag(),
        "-event-socket-path".to_owned(),
        sockets.notify.display().to_string(),
        "-ignition-socket-path".to_owned(),
        sockets.ignition.display().to_string(),
        "-ready-socket-path".to_owned(),
        sockets.ready.display().to_string(),
        "-vmnet-socket-path".to_owned(),
        sockets.vmnet.display().to_string(),
        "-bind-pid".to_owned(),
        std::process::id().to_string(),
        format!("-power-save-mode={}", config.power_save),
    ]
}

/// One supervised child process.
#[derive(Debug, Clone)]
struct ComponentHandle {
    name: &'static str,
    child: Arc<Mutex<Option<Child>>>,
}

impl ComponentHandle {
    fn new(name: &'static str, child: Child) -> Self {
        Self {
            name,
            child: Arc::new(Mutex::new(Some(child))),
        }
    }
}

/// The linked pair of child processes backing one instance.
pub struct ComponentSet {
    proxy: ComponentHandle,
    hypervisor: ComponentHandle,
    shutting_down: Arc<AtomicBool>,
}

impl ComponentSet {
    /// Spawn the network proxy, wait for its socket, spawn the hypervisor,
    /// wait for its control socket, and link the pair.
    ///
    /// # Errors
    /// Returns [`SupervisorError::Io`] when a binary cannot be spawned and
    /// [`SupervisorError::ComponentStartTimeout`] when a readiness socket
    /// never appears; in both cases anything already spawned is killed.
    pub async fn spawn(
        config: &InstanceConfig,
        sockets: &SocketSet,
        ssh_port: u16,
        policy: &SupervisorPolicy,
        events: broadcast::Sender<Notification>,
    ) -> Result<Self, SupervisorError> {
        let proxy_child = spawn_component(
            "vmnet-proxy",
            &config.resources.proxy_bin,
            &build_proxy_args(config, sockets, ssh_port),
            config,
        )
        .await?;
        let proxy = ComponentHandle::new("vmnet-proxy", proxy_child);

        if let Err(e) = wait_for_socket(&sockets.vmnet, "vmnet-proxy", policy).await {
            terminate(&proxy, policy.term_grace).await;
            return Err(e);
        }

        let hypervisor_child = match spawn_component(
            "hyperctl",
            &config.resources.hypervisor_bin,
            &build_hypervisor_args(config, sockets),
            config,
        )
        .await
        {
            Ok(child) => child,
            Err(e) => {
                terminate(&proxy, policy.term_grace).await;
                return Err(e);
            }
        };
        let hypervisor = ComponentHandle::new("hyperctl", hypervisor_child);

        if let Err(e) = wait_for_socket(&sockets.control, "hyperctl", policy).await {
            terminate(&hypervisor, policy.term_grace).await;
            terminate(&proxy, policy.term_grace).await;
            return Err(e);
        }

        Ok(Self::adopt(proxy, hypervisor, events))
    }

    /// Link two already-spawned children. Used by `spawn` and by test
    /// backends that bring their own processes.
    #[must_use]
    pub fn adopt_children(
        proxy: Child,
        hypervisor: Child,
        events: broadcast::Sender<Notification>,
    ) -> Self {
        Self::adopt(
            ComponentHandle::new("vmnet-proxy", proxy),
            ComponentHandle::new("hyperctl", hypervisor),
            events,
        )
    }

    fn adopt(
        proxy: ComponentHandle,
        hypervisor: ComponentHandle,
        events: broadcast::Sender<Notification>,
    ) -> Self {
        let shutting_down = Arc::new(AtomicBool::new(false));
        spawn_watcher(
            proxy.clone(),
            hypervisor.clone(),
            Arc::clone(&shutting_down),
            events.clone(),
        );
        spawn_watcher(
            hypervisor.clone(),
            proxy.clone(),
            Arc::clone(&shutting_down),
            events,
        );
        Self {
            proxy,
            hypervisor,
            shutting_down,
        }
    }

    /// `true` once an intentional stop has begun.
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Stop both components: a best-effort graceful stop RPC first (its
    /// failure is tolerated, the hypervisor may already be gone), then
    /// SIGTERM, a bounded wait, and SIGKILL for anything still alive.
    ///
    /// Safe to call repeatedly; never fails.
    pub async fn stop(&self, control: &dyn ControlApi, policy: &SupervisorPolicy) {
        self.shutting_down.store(true, Ordering::SeqCst);

        match tokio::time::timeout(policy.stop_rpc_timeout, control.stop()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::debug!(error = %e, "graceful stop RPC failed, falling back to signals");
            }
            Err(_) => {
                tracing::debug!("graceful stop RPC stalled, falling back to signals");
            }
        }

        terminate(&self.hypervisor, policy.term_grace).await;
        terminate(&self.proxy, policy.term_grace).await;
    }
}

async fn spawn_component(
    name: &'static str,
    bin: &std::path::Path,
    args: &[String],
    config: &InstanceConfig,
) -> Result<Child, SupervisorError> {
    let sink = LogSink::create(&config.log_dir(), name).await?;

    let mut cmd = Command::new(bin);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(false);
    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = cmd.spawn()?;

    tracing::info!(
        component = name,
        bin = %bin.display(),
        pid = ?child.id(),
        "component spawned"
    );

    match (child.stdout.take(), child.stderr.take()) {
        (Some(out), Some(err)) => {
            sink.drain_pair(out, err);
        }
        (Some(out), None) => {
            sink.drain(out);
        }
        _ => {}
    }

    Ok(child)
}

/// Poll for the socket file a component is expected to create.
async fn wait_for_socket(
    socket: &std::path::Path,
    component: &str,
    policy: &SupervisorPolicy,
) -> Result<(), SupervisorError> {
    for _ in 0..policy.component_poll_retries {
        if socket.exists() {
            return Ok(());
        }
        tokio::time::sleep(policy.component_poll_interval).await;
    }
    Err(SupervisorError::ComponentStartTimeout {
        component: component.to_owned(),
        waited_ms: u64::try_from(policy.component_budget().as_millis()).unwrap_or(u64::MAX),
    })
}

/// Watch one child; on an exit that was not part of a stop, publish `Exit`
/// and take the sibling down with it.
fn spawn_watcher(
    watched: ComponentHandle,
    sibling: ComponentHandle,
    shutting_down: Arc<AtomicBool>,
    events: broadcast::Sender<Notification>,
) {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(WATCH_INTERVAL).await;

            if shutting_down.load(Ordering::SeqCst) {
                return;
            }

            let status = {
                let mut guard = watched.child.lock().await;
                let Some(child) = guard.as_mut() else { return };
                match child.try_wait() {
                    Ok(Some(status)) => Some(status),
                    Ok(None) => None,
                    Err(e) => {
                        tracing::debug!(component = watched.name, error = %e, "try_wait failed");
                        None
                    }
                }
            };

            let Some(status) = status else { continue };

            if shutting_down.swap(true, Ordering::SeqCst) {
                return;
            }

            tracing::warn!(
                component = watched.name,
                code = ?status.code(),
                "component exited unexpectedly, killing sibling"
            );
            let _ = events.send(Notification::new(
                NotifyEventKind::Exit,
                format!("{} exited with code {:?}", watched.name, status.code()),
            ));

            let mut guard = sibling.child.lock().await;
            if let Some(child) = guard.as_mut() {
                if let Err(e) = child.kill().await {
                    tracing::debug!(component = sibling.name, error = %e, "sibling kill failed");
                }
            }
            return;
        }
    });
}

/// SIGTERM, wait out the grace period, then SIGKILL.
async fn terminate(handle: &ComponentHandle, grace: Duration) {
    let mut guard = handle.child.lock().await;
    let Some(child) = guard.as_mut() else { return };

    if let Ok(Some(status)) = child.try_wait() {
        tracing::debug!(component = handle.name, code = ?status.code(), "already exited");
        guard.take();
        return;
    }

    #[cfg(unix)]
    if let Some(pid) = child.id().and_then(|p| libc::pid_t::try_from(p).ok()) {
        // SAFETY: sending a signal to a pid we spawned and have not reaped.
        unsafe {
            libc::kill(pid, libc::SIGTERM);
        }
    }

    let deadline = Instant::now() + grace;
    loop {
        match child.try_wait() {
            Ok(Some(status)) => {
                tracing::info!(component = handle.name, code = ?status.code(), "component stopped");
                guard.take();
                return;
            }
            Ok(None) => {}
            Err(e) => {
                tracing::debug!(component = handle.name, error = %e, "try_wait failed");
                break;
            }
        }
        if Instant::now() >= deadline {
            tracing::warn!(component = handle.name, "grace period elapsed, escalating to SIGKILL");
            break;
        }
        tokio::time::sleep(REAP_INTERVAL).await;
    }

    if let Err(e) = child.kill().await {
        tracing::debug!(component = handle.name, error = %e, "kill failed");
    }
    let _ = child.wait().await;
    guard.take();
}
