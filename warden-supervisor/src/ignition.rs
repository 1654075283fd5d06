//! Guest first-boot ignition.
//!
//! Before the guest has a network stack its init process dials out on a
//! virtual socket the hypervisor bridges to a host Unix socket. The host
//! answers exactly one connection with a shell script carrying the first-boot
//! configuration: share mounts, the SSH authorized key, the timezone, and the
//! ready-callback hook. A second single-connection socket carries the guest's
//! boot-complete signal back.

use std::path::Path;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::UnixListener;

use warden_core::InstanceConfig;

use crate::SupervisorError;

/// Guest-side device node the hypervisor maps to the readiness socket.
const READY_PORT: &str = "/dev/virtio-ports/ready";

/// Assemble the first-boot configuration script.
///
/// The content is an opaque shell string to everything but the guest init;
/// the ready hook must stay last so the boot-complete signal fires only
/// after every preceding step ran.
#[must_use]
pub fn build_ignition_script(config: &InstanceConfig) -> String {
    let mut lines = Vec::new();

    for share in &config.shared_dirs {
        lines.push(format!(
            "mkdir -p {guest} && mount -t virtiofs {tag} {guest}",
            guest = share.guest_path,
            tag = share.tag,
        ));
    }

    lines.push("install -d -m 700 /root/.ssh".to_owned());
    lines.push(format!(
        "printf '%s\\n' '{}' >> /root/.ssh/authorized_keys",
        config.ssh_public_key
    ));
    lines.push("chmod 600 /root/.ssh/authorized_keys".to_owned());

    lines.push(format!(
        "ln -sf /usr/share/zoneinfo/{} /etc/localtime",
        config.timezone
    ));

    lines.push(format!("printf ready > {READY_PORT}"));

    lines.join("\n")
}

/// Serve the ignition script to the single guest connection.
///
/// Binds `socket_path`, waits for exactly one inbound connection, writes
/// `script`, then closes both the connection and the listener.
///
/// # Errors
/// Returns [`SupervisorError::IgnitionTimeout`] when no connection arrives
/// within `timeout`; the caller's start sequence treats that as fatal for
/// the attempt. I/O failures on the accepted connection surface as
/// [`SupervisorError::Io`].
pub async fn serve_ignition(
    socket_path: &Path,
    script: &str,
    timeout: Duration,
) -> Result<(), SupervisorError> {
    let listener = UnixListener::bind(socket_path).map_err(|e| SupervisorError::Transport {
        path: socket_path.to_path_buf(),
        reason: format!("bind ignition listener: {e}"),
    })?;

    tracing::debug!(socket = %socket_path.display(), "awaiting ignition connection");

    let accepted = tokio::time::timeout(timeout, listener.accept()).await;
    let result = match accepted {
        Ok(Ok((mut stream, _))) => {
            tracing::info!(bytes = script.len(), "guest connected, delivering ignition script");
            stream.write_all(script.as_bytes()).await?;
            stream.shutdown().await?;
            Ok(())
        }
        Ok(Err(e)) => Err(SupervisorError::Io(e)),
        Err(_) => Err(SupervisorError::IgnitionTimeout {
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        }),
    };

    drop(listener);
    let _ = tokio::fs::remove_file(socket_path).await;
    result
}

/// Wait for the guest's boot-complete connection on the readiness socket.
///
/// Purely a synchronization signal: the connection content is ignored, the
/// accept itself resolves the Ready transition.
///
/// # Errors
/// Returns [`SupervisorError::ComponentStartTimeout`] (component `"guest"`)
/// when nothing connects within `timeout`.
pub async fn await_guest_ready(
    socket_path: &Path,
    timeout: Duration,
) -> Result<(), SupervisorError> {
    let listener = UnixListener::bind(socket_path).map_err(|e| SupervisorError::Transport {
        path: socket_path.to_path_buf(),
        reason: format!("bind readiness listener: {e}"),
    })?;

    let accepted = tokio::time::timeout(timeout, listener.accept()).await;
    let result = match accepted {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(e)) => Err(SupervisorError::Io(e)),
        Err(_) => Err(SupervisorError::ComponentStartTimeout {
            component: "guest".to_owned(),
            waited_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        }),
    };

    drop(listener);
    let _ = tokio::fs::remove_file(socket_path).await;
    result
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use tokio::io::AsyncReadExt;
    use tokio::net::UnixStream;

    use warden_core::config::tests_support::minimal_config;
    use warden_core::SharedDir;

    use super::*;

    #[test]
    fn script_orders_mounts_key_timezone_then_ready_hook() {
        let mut config = minimal_config();
        config.shared_dirs = vec![
            SharedDir::new("/Users".into(), "/mnt/hostusers", "hostusers"),
            SharedDir::new("/opt/data".into(), "/mnt/data", "data"),
        ];
        config.timezone = "Asia/Shanghai".to_owned();

        let script = build_ignition_script(&config);

        let mount_a = script.find("mount -t virtiofs hostusers /mnt/hostusers");
        let mount_b = script.find("mount -t virtiofs data /mnt/data");
        let key = script.find("authorized_keys");
        let tz = script.find("zoneinfo/Asia/Shanghai");
        let ready = script.find(READY_PORT);

        assert!(mount_a.is_some(), "first share missing:\n{script}");
        assert!(mount_b.is_some(), "second share missing:\n{script}");
        assert!(key.is_some(), "authorized key missing:\n{script}");
        assert!(tz.is_some(), "timezone missing:\n{script}");
        let ready = match ready {
            Some(pos) => pos,
            None => panic!("ready hook missing:\n{script}"),
        };
        for earlier in [mount_a, mount_b, key, tz].into_iter().flatten() {
            assert!(earlier < ready, "ready hook must come last:\n{script}");
        }
    }

    #[test]
    fn script_contains_the_configured_public_key() {
        let config = minimal_config();
        let script = build_ignition_script(&config);
        assert!(script.contains("ssh-ed25519 AAAATESTKEY warden"));
    }

    #[tokio::test]
    async fn ignition_delivers_script_to_single_connection() {
        let dir = match tempfile::tempdir() {
            Ok(d) => d,
            Err(e) => panic!("tempdir failed: {e}"),
        };
        let socket = dir.path().join("ignition.sock");
        let socket_for_guest = socket.clone();

        // Emulated guest init: dial in, read everything, close.
        let guest = tokio::spawn(async move {
            for _ in 0..50u8 {
                if socket_for_guest.exists() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            let mut stream = match UnixStream::connect(&socket_for_guest).await {
                Ok(s) => s,
                Err(e) => panic!("guest connect failed: {e}"),
            };
            let mut received = String::new();
            if let Err(e) = stream.read_to_string(&mut received).await {
                panic!("guest read failed: {e}");
            }
            received
        });

        let script = build_ignition_script(&minimal_config());
        if let Err(e) = serve_ignition(&socket, &script, Duration::from_secs(5)).await {
            panic!("serve_ignition failed: {e}");
        }

        let received = match guest.await {
            Ok(r) => r,
            Err(e) => panic!("guest task failed: {e}"),
        };
        assert_eq!(received, script);
        assert!(!socket.exists(), "ignition socket must be unlinked after use");
    }

    #[tokio::test]
    async fn ignition_without_guest_times_out_within_bound() {
        let dir = match tempfile::tempdir() {
            Ok(d) => d,
            Err(e) => panic!("tempdir failed: {e}"),
        };
        let socket = dir.path().join("ignition.sock");

        let started = Instant::now();
        let err = match serve_ignition(&socket, "noop", Duration::from_millis(200)).await {
            Err(e) => e,
            Ok(()) => panic!("no guest must mean timeout"),
        };
        let elapsed = started.elapsed();

        assert!(
            matches!(err, SupervisorError::IgnitionTimeout { timeout_ms: 200 }),
            "expected IgnitionTimeout, got {err}"
        );
        assert!(
            elapsed >= Duration::from_millis(200) && elapsed < Duration::from_millis(600),
            "timeout must be honored tightly, took {elapsed:?}"
        );
    }

    #[tokio::test]
    async fn readiness_listener_resolves_on_first_connection() {
        let dir = match tempfile::tempdir() {
            Ok(d) => d,
            Err(e) => panic!("tempdir failed: {e}"),
        };
        let socket = dir.path().join("ready.sock");
        let socket_for_guest = socket.clone();

        tokio::spawn(async move {
            for _ in 0..50u8 {
                if socket_for_guest.exists() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            let _ = UnixStream::connect(&socket_for_guest).await;
        });

        if let Err(e) = await_guest_ready(&socket, Duration::from_secs(5)).await {
            panic!("readiness wait failed: {e}");
        }
    }
}
