/// Errors produced by the `warden-core` crate.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum CoreError {
    /// An instance configuration field failed validation.
    #[error("invalid instance configuration, field '{field}': {reason}")]
    InvalidConfig { field: String, reason: String },
}
