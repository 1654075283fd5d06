//! The lifecycle state machine.
//!
//! One `VmSupervisor` owns one instance: its socket set, its child
//! processes, its notification stream, and its power-event subscription.
//! Every lifecycle-mutating call serializes on a single gate mutex, so a
//! `pause()` racing a `stop()` is impossible by construction. Every wait in
//! the machine is bounded by the policy; there is no unbounded suspension
//! anywhere in the lifecycle.

use std::process::Stdio;
use std::sync::{Arc, Weak};

use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;

use warden_core::{
    GuestRunState, InstanceConfig, InstanceId, InstanceInfo, LifecycleState, Notification,
    NotifyEventKind,
};

use crate::backend::{Backend, ProcessBackend};
use crate::control::ControlApi;
use crate::ignition;
use crate::layout::SocketSet;
use crate::manifest::VersionManifest;
use crate::notify::NotificationHub;
use crate::policy::SupervisorPolicy;
use crate::power::{PowerEvent, PowerMonitor};
use crate::process::ComponentSet;
use crate::SupervisorError;

/// Supervisor for one VM instance, generic over the platform [`Backend`].
pub struct VmSupervisor<B: Backend> {
    id: InstanceId,
    config: InstanceConfig,
    sockets: SocketSet,
    backend: B,
    policy: SupervisorPolicy,
    power: Arc<dyn PowerMonitor>,
    hub: Mutex<NotificationHub>,
    events: broadcast::Sender<Notification>,
    state: RwLock<LifecycleState>,
    /// Serializes start/stop/pause/resume on this instance.
    gate: Mutex<()>,
    components: Mutex<Option<ComponentSet>>,
    /// Power bridge and exit monitor, alive between Ready and stop.
    steady_tasks: Mutex<Vec<JoinHandle<()>>>,
    /// Handed to the steady-state tasks so they never keep a dropped
    /// supervisor alive.
    weak_self: Weak<Self>,
}

impl VmSupervisor<ProcessBackend> {
    /// Create a supervisor with the production process backend.
    ///
    /// # Errors
    /// Returns [`SupervisorError::Config`] for an invalid configuration and
    /// [`SupervisorError::PortRangeExhausted`] when no SSH forward port is
    /// free.
    pub fn create(
        config: InstanceConfig,
        policy: SupervisorPolicy,
        power: Arc<dyn PowerMonitor>,
    ) -> Result<Arc<Self>, SupervisorError> {
        config.validate()?;
        let sockets = SocketSet::for_instance(&config.socket_dir(), &config.name);
        let backend = ProcessBackend::new(config.clone(), sockets.clone(), policy.clone())?;
        Ok(Self::with_backend(config, backend, policy, power))
    }
}

impl<B: Backend> VmSupervisor<B> {
    /// Create a supervisor over an explicit backend. Tests use this with
    /// recording stubs; platform ports plug in here as well.
    #[must_use]
    pub fn with_backend(
        config: InstanceConfig,
        backend: B,
        policy: SupervisorPolicy,
        power: Arc<dyn PowerMonitor>,
    ) -> Arc<Self> {
        let sockets = SocketSet::for_instance(&config.socket_dir(), &config.name);
        let hub = NotificationHub::new();
        let events = hub.sender();
        Arc::new_cyclic(|weak_self| Self {
            id: InstanceId::new(),
            config,
            sockets,
            backend,
            policy,
            power,
            hub: Mutex::new(hub),
            events,
            state: RwLock::new(LifecycleState::Created),
            gate: Mutex::new(()),
            components: Mutex::new(None),
            steady_tasks: Mutex::new(Vec::new()),
            weak_self: weak_self.clone(),
        })
    }

    /// Identifier of this supervisor run, fresh per construction.
    #[must_use]
    pub fn id(&self) -> InstanceId {
        self.id
    }

    /// Current lifecycle state.
    pub async fn lifecycle_state(&self) -> LifecycleState {
        *self.state.read().await
    }

    /// Subscribe to the instance notification stream.
    #[must_use]
    pub fn notifications(&self) -> broadcast::Receiver<Notification> {
        self.events.subscribe()
    }

    /// Connection info reported by the hypervisor.
    ///
    /// # Errors
    /// Propagates control-RPC failures.
    pub async fn info(&self) -> Result<InstanceInfo, SupervisorError> {
        self.backend.control().info().await
    }

    /// Bring the instance from `Created`/`Stopped` to `Ready`.
    ///
    /// Sequence: workspace dirs → stale socket cleanup → version manifest →
    /// notification server → component spawn → ignition → bounded wait for
    /// the guest's ready signal. Any failure tears everything down before
    /// the error is returned, and is mirrored as an `Error` event on the
    /// notification stream.
    ///
    /// # Errors
    /// `IllegalStateTransition` when called in a non-startable state;
    /// otherwise the typed error of the failing step.
    pub async fn start(&self) -> Result<(), SupervisorError> {
        let _gate = self.gate.lock().await;

        let current = *self.state.read().await;
        if !current.can_start() {
            return Err(SupervisorError::IllegalStateTransition {
                operation: "start",
                state: current.to_string(),
            });
        }
        self.set_state(LifecycleState::Starting).await;

        match self.start_inner().await {
            Ok(()) => {
                self.set_state(LifecycleState::Ready).await;
                self.arm_steady_tasks().await;
                tracing::info!(instance = %self.id, name = %self.config.name, "instance ready");
                Ok(())
            }
            Err(e) => {
                tracing::error!(name = %self.config.name, error = %e, "start failed, tearing down");
                self.events
                    .send(Notification::new(NotifyEventKind::Error, e.to_string()))
                    .ok();
                self.teardown().await;
                self.set_state(LifecycleState::Failed).await;
                Err(e)
            }
        }
    }

    async fn start_inner(&self) -> Result<(), SupervisorError> {
        tokio::fs::create_dir_all(&self.config.workspace).await?;
        tokio::fs::create_dir_all(self.config.socket_dir()).await?;
        tokio::fs::create_dir_all(self.config.log_dir()).await?;
        self.sockets.unlink_stale().await?;

        let mut manifest = VersionManifest::load(&self.config.workspace).await;
        let stale = manifest.stale_components(&self.config.versions);
        if !stale.is_empty() {
            tracing::info!(
                components = ?stale,
                "materialized resource versions changed, hypervisor will refresh"
            );
        }

        // Subscribe before anything can emit so no event is lost.
        let mut notifications = self.events.subscribe();

        self.hub.lock().await.start(&self.sockets.notify)?;

        let components = self.backend.spawn_components(self.events.clone()).await?;
        *self.components.lock().await = Some(components);

        // The readiness listener binds before ignition delivers the script
        // that tells the guest to report there.
        let ready_socket = self.backend.readiness_socket().to_path_buf();
        let launch_timeout = self.policy.launch_timeout;
        let mut ready_wait: JoinHandle<Result<(), SupervisorError>> = {
            let ready_socket = ready_socket.clone();
            tokio::spawn(
                async move { ignition::await_guest_ready(&ready_socket, launch_timeout).await },
            )
        };

        let script = ignition::build_ignition_script(&self.config);
        ignition::serve_ignition(
            self.backend.ignition_socket(),
            &script,
            self.policy.ignition_timeout,
        )
        .await?;

        // Ready resolves on whichever lands first: the readiness-socket
        // connection or a Ready event over the notification stream. Both are
        // bounded by the launch timeout inside the spawned wait.
        let stream_wait = async {
            loop {
                match notifications.recv().await {
                    Ok(n) => match n.kind {
                        NotifyEventKind::Ready => return Ok(()),
                        NotifyEventKind::Exit | NotifyEventKind::Error => {
                            tracing::error!(kind = %n.kind, message = %n.message, "component failed during start");
                            return Err(SupervisorError::ProcessExited {
                                component: "vm".to_owned(),
                                code: None,
                            });
                        }
                        _ => {}
                    },
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(SupervisorError::ProcessExited {
                            component: "vm".to_owned(),
                            code: None,
                        });
                    }
                }
            }
        };

        let outcome: Result<(), SupervisorError> = tokio::select! {
            joined = &mut ready_wait => match joined {
                Ok(result) => result,
                Err(e) => Err(SupervisorError::Transport {
                    path: ready_socket,
                    reason: format!("readiness wait aborted: {e}"),
                }),
            },
            streamed = stream_wait => streamed,
        };
        // Whichever signal won, the other listener has no further purpose.
        ready_wait.abort();
        outcome?;

        manifest.record(&self.config.versions);
        manifest.store(&self.config.workspace).await?;
        Ok(())
    }

    /// Pause the guest. Idempotent: already paused (by either the supervisor
    /// or the hypervisor's own report) is success. When the hypervisor
    /// reports `canPause: false` this fails fast without issuing the pause
    /// RPC.
    ///
    /// # Errors
    /// `IllegalStateTransition` on a forbidden transition; RPC errors
    /// otherwise, after which the instance is torn down and `Failed`.
    pub async fn pause(&self) -> Result<(), SupervisorError> {
        let _gate = self.gate.lock().await;

        let current = *self.state.read().await;
        if matches!(current, LifecycleState::Paused | LifecycleState::Pausing) {
            return Ok(());
        }
        if current != LifecycleState::Ready {
            return Err(SupervisorError::IllegalStateTransition {
                operation: "pause",
                state: current.to_string(),
            });
        }

        let control = self.backend.control();
        let report = control.state().await?;
        if matches!(report.state, GuestRunState::Paused | GuestRunState::Pausing) {
            self.set_state(LifecycleState::Paused).await;
            return Ok(());
        }
        if !report.can_pause {
            return Err(SupervisorError::IllegalStateTransition {
                operation: "pause",
                state: format!("{:?}", report.state),
            });
        }

        self.set_state(LifecycleState::Pausing).await;
        match control.pause().await {
            Ok(()) => {
                self.set_state(LifecycleState::Paused).await;
                Ok(())
            }
            Err(e) => self.fail_locked(e).await,
        }
    }

    /// Resume a paused guest, then resynchronize its clock over SSH; the
    /// clock step is retried a bounded number of times and its failure never
    /// reverts the resume (drift is degraded mode, not fatal).
    ///
    /// # Errors
    /// Mirror of [`VmSupervisor::pause`].
    pub async fn resume(&self) -> Result<(), SupervisorError> {
        let _gate = self.gate.lock().await;

        let current = *self.state.read().await;
        if matches!(current, LifecycleState::Ready | LifecycleState::Resuming) {
            return Ok(());
        }
        if current != LifecycleState::Paused {
            return Err(SupervisorError::IllegalStateTransition {
                operation: "resume",
                state: current.to_string(),
            });
        }

        let control = self.backend.control();
        let report = control.state().await?;
        if matches!(report.state, GuestRunState::Running | GuestRunState::Resuming) {
            self.set_state(LifecycleState::Ready).await;
            return Ok(());
        }
        if !report.can_resume {
            return Err(SupervisorError::IllegalStateTransition {
                operation: "resume",
                state: format!("{:?}", report.state),
            });
        }

        self.set_state(LifecycleState::Resuming).await;
        match control.resume().await {
            Ok(()) => {
                self.resync_guest_clock().await;
                self.set_state(LifecycleState::Ready).await;
                Ok(())
            }
            Err(e) => self.fail_locked(e).await,
        }
    }

    /// Ask the guest to shut itself down (as opposed to [`stop`], which
    /// tears the instance down from the host side).
    ///
    /// # Errors
    /// `IllegalStateTransition` when the hypervisor reports
    /// `canRequestStop: false`; RPC errors otherwise.
    ///
    /// [`stop`]: VmSupervisor::stop
    pub async fn request_stop(&self) -> Result<(), SupervisorError> {
        let _gate = self.gate.lock().await;

        let control = self.backend.control();
        let report = control.state().await?;
        if !report.can_request_stop {
            return Err(SupervisorError::IllegalStateTransition {
                operation: "request-stop",
                state: format!("{:?}", report.state),
            });
        }
        control.request_stop().await
    }

    /// Toggle the hypervisor's power-save mode.
    ///
    /// # Errors
    /// Propagates control-RPC failures.
    pub async fn set_power_save(&self, enable: bool) -> Result<(), SupervisorError> {
        self.backend.control().set_power_save(enable).await
    }

    /// Stop the instance. Valid from any state, idempotent, and never fails:
    /// teardown errors are swallowed after logging. The power subscription
    /// is dropped before anything else so a late host sleep/wake cannot act
    /// on the dying instance.
    pub async fn stop(&self) {
        {
            let mut tasks = self.steady_tasks.lock().await;
            for task in tasks.drain(..) {
                task.abort();
            }
        }

        let _gate = self.gate.lock().await;
        if *self.state.read().await == LifecycleState::Stopped {
            return;
        }
        self.set_state(LifecycleState::Stopping).await;
        self.teardown().await;
        self.set_state(LifecycleState::Stopped).await;
        tracing::info!(instance = %self.id, name = %self.config.name, "instance stopped");
    }

    async fn set_state(&self, next: LifecycleState) {
        let mut state = self.state.write().await;
        tracing::debug!(name = %self.config.name, from = %*state, to = %next, "state transition");
        *state = next;
    }

    /// Mark the instance failed while already holding the gate: emit the
    /// error event, tear down, transition, and hand the error back.
    async fn fail_locked(&self, error: SupervisorError) -> Result<(), SupervisorError> {
        self.events
            .send(Notification::new(NotifyEventKind::Error, error.to_string()))
            .ok();
        self.teardown().await;
        self.set_state(LifecycleState::Failed).await;
        Err(error)
    }

    /// Best-effort release of everything the instance owns. Secondary
    /// errors are logged and swallowed; teardown always runs to the end.
    async fn teardown(&self) {
        if let Some(components) = self.components.lock().await.take() {
            let control = self.backend.control();
            let policy = self.policy.clone();
            // The kill runs on its own task: even if this teardown future is
            // cancelled mid-await, the children still come down.
            let kill = tokio::spawn(async move {
                components.stop(control.as_ref(), &policy).await;
            });
            let _ = kill.await;
        }
        self.hub.lock().await.stop().await;
        self.sockets.remove_all().await;
    }

    /// Arm the power bridge and the steady-state exit monitor. Both hold
    /// only a weak reference so a dropped supervisor ends them naturally;
    /// `stop()` aborts them explicitly first.
    async fn arm_steady_tasks(&self) {
        let mut tasks = self.steady_tasks.lock().await;

        let mut power_rx = self.power.subscribe();
        let weak = self.weak_self.clone();
        tasks.push(tokio::spawn(async move {
            loop {
                let event = match power_rx.recv().await {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return,
                };
                let Some(supervisor) = weak.upgrade() else { return };
                let result = match event {
                    PowerEvent::Sleep => supervisor.pause().await,
                    PowerEvent::Wake => supervisor.resume().await,
                };
                if let Err(e) = result {
                    tracing::warn!(?event, error = %e, "power-driven transition failed");
                }
            }
        }));

        let mut event_rx = self.events.subscribe();
        let weak = self.weak_self.clone();
        tasks.push(tokio::spawn(async move {
            loop {
                let notification = match event_rx.recv().await {
                    Ok(n) => n,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return,
                };
                if !matches!(
                    notification.kind,
                    NotifyEventKind::Exit | NotifyEventKind::Error
                ) {
                    continue;
                }
                let Some(supervisor) = weak.upgrade() else { return };
                let state = *supervisor.state.read().await;
                if matches!(
                    state,
                    LifecycleState::Stopping | LifecycleState::Stopped | LifecycleState::Failed
                ) {
                    return;
                }
                tracing::error!(
                    kind = %notification.kind,
                    message = %notification.message,
                    "component failure in steady state"
                );
                supervisor.fail_from_steady_state().await;
                return;
            }
        }));
    }

    async fn fail_from_steady_state(&self) {
        let _gate = self.gate.lock().await;
        let state = *self.state.read().await;
        if matches!(
            state,
            LifecycleState::Stopping | LifecycleState::Stopped | LifecycleState::Failed
        ) {
            return;
        }
        self.teardown().await;
        self.set_state(LifecycleState::Failed).await;
    }

    /// A paused guest's clock drifts against host wall-clock time; push the
    /// host's idea of now into the guest after resume.
    async fn resync_guest_clock(&self) {
        let info = match self.backend.control().info().await {
            Ok(info) => info,
            Err(e) => {
                tracing::warn!(error = %e, "cannot resync guest clock without connection info");
                return;
            }
        };

        for attempt in 1..=self.policy.clock_sync_retries {
            let epoch = chrono::Utc::now().timestamp();
            let status = tokio::process::Command::new(&self.policy.ssh_program)
                .args([
                    "-o", "StrictHostKeyChecking=no",
                    "-o", "UserKnownHostsFile=/dev/null",
                    "-o", "BatchMode=yes",
                    "-o", "LogLevel=ERROR",
                    "-o", "ConnectTimeout=2",
                ])
                .arg("-i")
                .arg(&info.ssh_private_key_path)
                .arg("-p")
                .arg(info.ssh_port.to_string())
                .arg(format!("{}@127.0.0.1", info.ssh_user))
                .arg(format!("date -u -s @{epoch}"))
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .await;

            match status {
                Ok(s) if s.success() => {
                    tracing::info!(attempt, "guest clock resynchronized");
                    return;
                }
                Ok(s) => {
                    tracing::debug!(attempt, code = ?s.code(), "clock resync attempt failed");
                }
                Err(e) => {
                    tracing::debug!(attempt, error = %e, "clock resync spawn failed");
                }
            }
            tokio::time::sleep(self.policy.clock_sync_interval).await;
        }
        tracing::warn!(
            retries = self.policy.clock_sync_retries,
            "guest clock resync failed; clock will drift until the guest's own sync runs"
        );
    }
}
