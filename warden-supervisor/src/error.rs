//! Error types for the supervisor crate.

use std::path::PathBuf;

/// Errors that can occur during VM lifecycle operations.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum SupervisorError {
    /// Connection-level failure on a local socket: missing, refused, or the
    /// peer stalled past the per-call deadline.
    #[error("transport failure on {path}: {reason}")]
    Transport { path: PathBuf, reason: String },

    /// The remote end answered with a failure status.
    #[error("request {endpoint} failed with status {status}: {body}")]
    RequestFailed {
        endpoint: String,
        status: u16,
        body: String,
    },

    /// A child component did not reach its readiness signal in time.
    #[error("component '{component}' not ready after {waited_ms}ms")]
    ComponentStartTimeout { component: String, waited_ms: u64 },

    /// The guest never opened the ignition connection.
    #[error("guest did not connect to the ignition channel within {timeout_ms}ms")]
    IgnitionTimeout { timeout_ms: u64 },

    /// The requested transition is not legal in the current state. Signals a
    /// caller logic error; never retried.
    #[error("cannot {operation} while the instance is {state}")]
    IllegalStateTransition {
        operation: &'static str,
        state: String,
    },

    /// No free TCP port in the probed range.
    #[error("no usable port in {start}..=65535, last error: {last_error}")]
    PortRangeExhausted { start: u16, last_error: String },

    /// A child component exited outside an intentional stop.
    #[error("component '{component}' exited unexpectedly (code {code:?})")]
    ProcessExited {
        component: String,
        code: Option<i32>,
    },

    /// The instance configuration was rejected before any process spawned.
    #[error(transparent)]
    Config(#[from] warden_core::CoreError),

    /// Underlying I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
