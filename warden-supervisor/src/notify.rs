//! Local notification server.
//!
//! Child processes have no way to call back into the supervisor except via a
//! local socket, so each instance runs a minimal HTTP listener accepting
//! `GET /notify?event=<name>&message=<text>` and republishing the decoded
//! event on the instance's notification stream. Decoding happens here and
//! nowhere else; unknown event names are dropped at this boundary.

use std::path::{Path, PathBuf};

use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::UnixListener;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;

use warden_core::{Notification, NotifyEventKind};

use crate::SupervisorError;

/// Subscribers further behind than this lose the oldest events; the stream
/// is low-volume (a handful of events per boot), so this is generous.
const STREAM_CAPACITY: usize = 64;

/// Decode the query string of a `/notify` request into a typed event.
///
/// Returns `None` when the `event` parameter is absent or names something
/// outside the closed vocabulary; such callbacks are dropped, not errors.
#[must_use]
pub fn decode_notify_query(query: &str) -> Option<Notification> {
    let mut event: Option<String> = None;
    let mut message = String::new();

    for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
        match key.as_ref() {
            "event" => event = Some(value.into_owned()),
            "message" => message = value.into_owned(),
            _ => {}
        }
    }

    let kind = NotifyEventKind::from_name(event.as_deref()?)?;
    Some(Notification::new(kind, message))
}

struct ServerHandle {
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
    socket_path: PathBuf,
}

/// Publisher side of the notification stream plus the HTTP ingress serving it.
pub struct NotificationHub {
    tx: broadcast::Sender<Notification>,
    server: Option<ServerHandle>,
}

impl NotificationHub {
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(STREAM_CAPACITY);
        Self { tx, server: None }
    }

    /// New receiver over the stream. Every subscriber sees every event sent
    /// after subscription, in order.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.tx.subscribe()
    }

    /// The publish side of the stream, for components that report through
    /// the supervisor rather than over the socket.
    #[must_use]
    pub fn sender(&self) -> broadcast::Sender<Notification> {
        self.tx.clone()
    }

    /// Publish an event produced inside the supervisor itself (teardown
    /// errors use this path).
    pub fn emit(&self, notification: Notification) {
        let _ = self.tx.send(notification);
    }

    /// Bind the ingress listener at `socket_path` and start serving.
    ///
    /// Bind failures (typically the path being owned by another live
    /// instance) are returned once and never retried here; retrying would
    /// mask a configuration bug.
    ///
    /// # Errors
    /// Returns [`SupervisorError::Transport`] when the socket cannot be bound.
    pub fn start(&mut self, socket_path: &Path) -> Result<(), SupervisorError> {
        if self.server.is_some() {
            return Ok(());
        }

        let listener = UnixListener::bind(socket_path).map_err(|e| SupervisorError::Transport {
            path: socket_path.to_path_buf(),
            reason: format!("bind notify listener: {e}"),
        })?;

        tracing::debug!(socket = %socket_path.display(), "notification server listening");

        let tx = self.tx.clone();
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    accepted = listener.accept() => {
                        let stream = match accepted {
                            Ok((stream, _)) => stream,
                            Err(e) => {
                                tracing::debug!(error = %e, "notify accept failed");
                                continue;
                            }
                        };
                        let tx = tx.clone();
                        tokio::spawn(async move {
                            let service = service_fn(move |req| {
                                let tx = tx.clone();
                                async move { Ok::<_, hyper::Error>(handle(&req, &tx)) }
                            });
                            let conn = hyper::server::conn::http1::Builder::new()
                                .serve_connection(TokioIo::new(stream), service);
                            if let Err(e) = conn.await {
                                tracing::debug!(error = %e, "notify connection error");
                            }
                        });
                    }
                }
            }
        });

        self.server = Some(ServerHandle {
            shutdown: shutdown_tx,
            task,
            socket_path: socket_path.to_path_buf(),
        });
        Ok(())
    }

    /// Stop the listener and unlink its socket. Idempotent, and safe to call
    /// when `start` never ran or failed.
    pub async fn stop(&mut self) {
        let Some(handle) = self.server.take() else {
            return;
        };
        let _ = handle.shutdown.send(());
        let _ = handle.task.await;
        let _ = tokio::fs::remove_file(&handle.socket_path).await;
    }
}

impl Default for NotificationHub {
    fn default() -> Self {
        Self::new()
    }
}

fn handle(req: &Request<Incoming>, tx: &broadcast::Sender<Notification>) -> Response<Full<Bytes>> {
    if req.method() == Method::GET && req.uri().path() == "/notify" {
        if let Some(notification) = decode_notify_query(req.uri().query().unwrap_or("")) {
            tracing::debug!(kind = %notification.kind, "notify event received");
            let _ = tx.send(notification);
        } else {
            tracing::debug!(query = ?req.uri().query(), "unrecognized notify callback dropped");
        }
        Response::new(Full::new(Bytes::from_static(b"ok")))
    } else {
        let mut resp = Response::new(Full::new(Bytes::from_static(b"Not Found")));
        *resp.status_mut() = StatusCode::NOT_FOUND;
        resp
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::time::Duration;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::UnixStream;

    use super::*;

    async fn raw_get(socket: &Path, target: &str) -> (u16, String) {
        let mut stream = match UnixStream::connect(socket).await {
            Ok(s) => s,
            Err(e) => panic!("connect failed: {e}"),
        };
        let request = format!("GET {target} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
        if let Err(e) = stream.write_all(request.as_bytes()).await {
            panic!("write failed: {e}");
        }
        let mut raw = String::new();
        if let Err(e) = stream.read_to_string(&mut raw).await {
            panic!("read failed: {e}");
        }
        let status = raw
            .split_whitespace()
            .nth(1)
            .and_then(|s| s.parse::<u16>().ok())
            .unwrap_or(0);
        let body = raw.split("\r\n\r\n").nth(1).unwrap_or("").to_owned();
        (status, body)
    }

    #[tokio::test]
    async fn notify_ready_emits_exactly_one_event() {
        let dir = match tempfile::tempdir() {
            Ok(d) => d,
            Err(e) => panic!("tempdir failed: {e}"),
        };
        let socket = dir.path().join("events.sock");

        let mut hub = NotificationHub::new();
        let mut rx = hub.subscribe();
        if let Err(e) = hub.start(&socket) {
            panic!("start failed: {e}");
        }

        let (status, body) = raw_get(&socket, "/notify?event=Ready&message=").await;
        assert_eq!(status, 200);
        assert_eq!(body, "ok");

        let event = match tokio::time::timeout(Duration::from_secs(1), rx.recv()).await {
            Ok(Ok(n)) => n,
            Ok(Err(e)) => panic!("stream closed: {e}"),
            Err(_) => panic!("no event within 1s"),
        };
        assert_eq!(event.kind, NotifyEventKind::Ready);
        assert_eq!(event.message, "");

        // Exactly one: the stream must now be empty.
        assert!(
            matches!(rx.try_recv(), Err(broadcast::error::TryRecvError::Empty)),
            "a single callback must produce a single event"
        );

        hub.stop().await;
    }

    #[tokio::test]
    async fn unknown_event_is_dropped_but_acknowledged() {
        let dir = match tempfile::tempdir() {
            Ok(d) => d,
            Err(e) => panic!("tempdir failed: {e}"),
        };
        let socket = dir.path().join("events.sock");

        let mut hub = NotificationHub::new();
        let mut rx = hub.subscribe();
        if let Err(e) = hub.start(&socket) {
            panic!("start failed: {e}");
        }

        let (status, _) = raw_get(&socket, "/notify?event=Cataclysm&message=boom").await;
        assert_eq!(status, 200, "unknown events are acknowledged, not errors");
        assert!(
            matches!(rx.try_recv(), Err(broadcast::error::TryRecvError::Empty)),
            "unknown events must not reach the stream"
        );

        hub.stop().await;
    }

    #[tokio::test]
    async fn other_paths_get_404() {
        let dir = match tempfile::tempdir() {
            Ok(d) => d,
            Err(e) => panic!("tempdir failed: {e}"),
        };
        let socket = dir.path().join("events.sock");

        let mut hub = NotificationHub::new();
        if let Err(e) = hub.start(&socket) {
            panic!("start failed: {e}");
        }

        let (status, body) = raw_get(&socket, "/status").await;
        assert_eq!(status, 404);
        assert_eq!(body, "Not Found");

        hub.stop().await;
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_safe_without_start() {
        let mut hub = NotificationHub::new();
        hub.stop().await;
        hub.stop().await;

        let dir = match tempfile::tempdir() {
            Ok(d) => d,
            Err(e) => panic!("tempdir failed: {e}"),
        };
        let socket = dir.path().join("events.sock");
        if let Err(e) = hub.start(&socket) {
            panic!("start failed: {e}");
        }
        hub.stop().await;
        hub.stop().await;
        assert!(!socket.exists(), "stop must unlink the socket");
    }

    #[test]
    fn decode_handles_url_encoding() {
        let n = match decode_notify_query("event=Error&message=disk%20image%20missing") {
            Some(n) => n,
            None => panic!("valid query must decode"),
        };
        assert_eq!(n.kind, NotifyEventKind::Error);
        assert_eq!(n.message, "disk image missing");
    }

    #[test]
    fn decode_without_event_parameter_is_none() {
        assert!(decode_notify_query("message=hello").is_none());
        assert!(decode_notify_query("").is_none());
    }

    proptest::proptest! {
        #[test]
        fn proptest_decode_never_panics(query in ".{0,256}") {
            let _ = decode_notify_query(&query);
        }
    }
}
