//! Control RPC client for the hypervisor management socket.
//!
//! The hypervisor exposes its management API via HTTP over a Unix domain
//! socket. Standard HTTP clients don't speak Unix sockets, so requests are
//! driven directly through hyper's http1 connection over a fresh
//! `UnixStream` per call; there is no connection reuse and none is needed at
//! this call volume.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Method, Request};
use hyper_util::rt::TokioIo;
use tokio::net::UnixStream;

use warden_core::{InstanceInfo, VmStateReport};

use crate::SupervisorError;

/// Typed operations against the hypervisor control socket.
///
/// The production implementation is [`ControlClient`]; tests substitute
/// recording stubs to observe exactly which RPCs the lifecycle machine
/// issues.
#[async_trait]
pub trait ControlApi: Send + Sync {
    /// `GET /state`: guest run state plus capability flags.
    async fn state(&self) -> Result<VmStateReport, SupervisorError>;

    /// `GET /info`: connection details (service socket, SSH endpoint).
    async fn info(&self) -> Result<InstanceInfo, SupervisorError>;

    /// `POST /state {"state":"Pause"}`.
    async fn pause(&self) -> Result<(), SupervisorError>;

    /// `POST /state {"state":"Resume"}`.
    async fn resume(&self) -> Result<(), SupervisorError>;

    /// `POST /state {"state":"Stop"}`: hard stop of the guest.
    async fn stop(&self) -> Result<(), SupervisorError>;

    /// `POST /state {"state":"RequestStop"}`: ask the guest to shut down.
    async fn request_stop(&self) -> Result<(), SupervisorError>;

    /// `PUT /power-save-mode {"enable":…}`.
    async fn set_power_save(&self, enable: bool) -> Result<(), SupervisorError>;
}

/// HTTP-over-Unix-socket implementation of [`ControlApi`].
#[derive(Debug, Clone)]
pub struct ControlClient {
    socket_path: PathBuf,
    timeout: Duration,
}

impl ControlClient {
    /// Client for the control socket at `socket_path`. `timeout` bounds every
    /// call end to end; the socket is local, so a stall past a few hundred
    /// milliseconds means the hypervisor is unresponsive.
    #[must_use]
    pub fn new(socket_path: PathBuf, timeout: Duration) -> Self {
        Self {
            socket_path,
            timeout,
        }
    }

    /// Same socket, different per-call deadline.
    #[must_use]
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        Self {
            socket_path: self.socket_path.clone(),
            timeout,
        }
    }

    async fn call(
        &self,
        method: Method,
        uri_path: &str,
        body: Option<String>,
    ) -> Result<String, SupervisorError> {
        let attempt = request_once(&self.socket_path, method, uri_path, body);
        match tokio::time::timeout(self.timeout, attempt).await {
            Ok(result) => result,
            Err(_) => Err(SupervisorError::Transport {
                path: self.socket_path.clone(),
                reason: format!("{uri_path} did not answer within {:?}", self.timeout),
            }),
        }
    }

    async fn set_state(&self, target: &str) -> Result<(), SupervisorError> {
        let body = serde_json::json!({ "state": target }).to_string();
        self.call(Method::POST, "/state", Some(body)).await?;
        Ok(())
    }
}

#[async_trait]
impl ControlApi for ControlClient {
    async fn state(&self) -> Result<VmStateReport, SupervisorError> {
        let body = self.call(Method::GET, "/state", None).await?;
        serde_json::from_str(&body).map_err(|e| SupervisorError::Transport {
            path: self.socket_path.clone(),
            reason: format!("malformed /state body: {e}"),
        })
    }

    async fn info(&self) -> Result<InstanceInfo, SupervisorError> {
        let body = self.call(Method::GET, "/info", None).await?;
        serde_json::from_str(&body).map_err(|e| SupervisorError::Transport {
            path: self.socket_path.clone(),
            reason: format!("malformed /info body: {e}"),
        })
    }

    async fn pause(&self) -> Result<(), SupervisorError> {
        self.set_state("Pause").await
    }

    async fn resume(&self) -> Result<(), SupervisorError> {
        self.set_state("Resume").await
    }

    async fn stop(&self) -> Result<(), SupervisorError> {
        self.set_state("Stop").await
    }

    async fn request_stop(&self) -> Result<(), SupervisorError> {
        self.set_state("RequestStop").await
    }

    async fn set_power_save(&self, enable: bool) -> Result<(), SupervisorError> {
        let body = serde_json::json!({ "enable": enable }).to_string();
        self.call(Method::PUT, "/power-save-mode", Some(body)).await?;
        Ok(())
    }
}

/// One HTTP exchange over the socket. The host header is fixed; the
/// hypervisor routes by path only.
async fn request_once(
    socket_path: &Path,
    method: Method,
    uri_path: &str,
    body: Option<String>,
) -> Result<String, SupervisorError> {
    let transport = |reason: String| SupervisorError::Transport {
        path: socket_path.to_path_buf(),
        reason,
    };

    let stream = UnixStream::connect(socket_path)
        .await
        .map_err(|e| transport(format!("connect: {e}")))?;

    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .map_err(|e| transport(format!("HTTP handshake: {e}")))?;

    // Drive the connection in the background.
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            tracing::debug!("control connection closed: {e}");
        }
    });

    let body_bytes = body.map(Bytes::from).unwrap_or_default();
    let content_len = body_bytes.len();

    let mut builder = Request::builder()
        .method(method)
        .uri(uri_path)
        .header("Host", "localhost");
    if content_len > 0 {
        builder = builder.header("Content-Type", "application/json");
        builder = builder.header("Content-Length", content_len.to_string());
    }

    let req = builder
        .body(Full::new(body_bytes))
        .map_err(|e| transport(format!("build request: {e}")))?;

    let resp = sender
        .send_request(req)
        .await
        .map_err(|e| transport(format!("send request: {e}")))?;

    let status = resp.status();
    let collected = resp
        .into_body()
        .collect()
        .await
        .map_err(|e| transport(format!("read response body: {e}")))?
        .to_bytes();
    let body_str = String::from_utf8_lossy(&collected).into_owned();

    if !status.is_success() {
        return Err(SupervisorError::RequestFailed {
            endpoint: uri_path.to_owned(),
            status: status.as_u16(),
            body: body_str,
        });
    }

    Ok(body_str)
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use http_body_util::Full;
    use hyper::body::Bytes;
    use hyper::service::service_fn;
    use hyper::{Response, StatusCode};
    use hyper_util::rt::TokioIo;
    use tokio::net::UnixListener;

    use warden_core::GuestRunState;

    use super::*;

    /// Serve canned responses on a Unix socket until the task is dropped.
    fn stub_server(socket: &Path, state_json: &'static str, status: StatusCode) {
        let listener = match UnixListener::bind(socket) {
            Ok(l) => l,
            Err(e) => panic!("stub bind failed: {e}"),
        };
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    let service = service_fn(move |_req| async move {
                        let mut resp = Response::new(Full::new(Bytes::from_static(
                            state_json.as_bytes(),
                        )));
                        *resp.status_mut() = status;
                        Ok::<_, hyper::Error>(resp)
                    });
                    let _ = hyper::server::conn::http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });
    }

    const RUNNING_STATE: &str = r#"{
        "state": "Running",
        "canStart": false,
        "canPause": true,
        "canResume": false,
        "canRequestStop": true,
        "canStop": true
    }"#;

    #[tokio::test]
    async fn state_decodes_report() {
        let dir = match tempfile::tempdir() {
            Ok(d) => d,
            Err(e) => panic!("tempdir failed: {e}"),
        };
        let socket = dir.path().join("control.sock");
        stub_server(&socket, RUNNING_STATE, StatusCode::OK);

        let client = ControlClient::new(socket, Duration::from_millis(500));
        let report = match client.state().await {
            Ok(r) => r,
            Err(e) => panic!("state failed: {e}"),
        };
        assert_eq!(report.state, GuestRunState::Running);
        assert!(report.can_pause);
    }

    #[tokio::test]
    async fn failure_status_maps_to_request_failed() {
        let dir = match tempfile::tempdir() {
            Ok(d) => d,
            Err(e) => panic!("tempdir failed: {e}"),
        };
        let socket = dir.path().join("control.sock");
        stub_server(&socket, "guest is wedged", StatusCode::INTERNAL_SERVER_ERROR);

        let client = ControlClient::new(socket, Duration::from_millis(500));
        let err = match client.pause().await {
            Err(e) => e,
            Ok(()) => panic!("500 must fail"),
        };
        match err {
            SupervisorError::RequestFailed { status, body, .. } => {
                assert_eq!(status, 500);
                assert_eq!(body, "guest is wedged");
            }
            other => panic!("expected RequestFailed, got {other}"),
        }
    }

    #[tokio::test]
    async fn missing_socket_maps_to_transport() {
        let client = ControlClient::new(
            PathBuf::from("/nonexistent/warden/control.sock"),
            Duration::from_millis(200),
        );
        let err = match client.state().await {
            Err(e) => e,
            Ok(_) => panic!("missing socket must fail"),
        };
        assert!(
            matches!(err, SupervisorError::Transport { .. }),
            "expected Transport, got {err}"
        );
    }

    #[tokio::test]
    async fn stalled_server_hits_the_deadline() {
        let dir = match tempfile::tempdir() {
            Ok(d) => d,
            Err(e) => panic!("tempdir failed: {e}"),
        };
        let socket = dir.path().join("control.sock");
        // Accept connections but never answer.
        let listener = match UnixListener::bind(&socket) {
            Ok(l) => l,
            Err(e) => panic!("bind failed: {e}"),
        };
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });

        let client = ControlClient::new(socket, Duration::from_millis(100));
        let started = std::time::Instant::now();
        let err = match client.state().await {
            Err(e) => e,
            Ok(_) => panic!("stalled server must time out"),
        };
        assert!(matches!(err, SupervisorError::Transport { .. }));
        assert!(
            started.elapsed() < Duration::from_secs(2),
            "deadline must bound the stall"
        );
    }
}
