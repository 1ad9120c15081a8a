//! Error taxonomy shared by every core component.
//!
//! Remote faults are fatal everywhere except inside poll loops, where the
//! tracker logs them and keeps polling. Everything else is surfaced to the
//! command as a [`ToolboxError`].

use thiserror::Error;
use uuid::Uuid;

/// A failed call against the remote platform.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum RemoteError {
    /// The request never produced a usable response (connection, TLS, auth token).
    #[error("transport error: {0}")]
    Transport(String),
    /// The server answered with an error status.
    #[error("server fault (status {status}): {message}")]
    Fault { status: u16, message: String },
    /// The response body did not have the expected shape.
    #[error("could not decode response: {0}")]
    Decode(String),
}

#[derive(Debug, Error)]
pub enum ToolboxError {
    #[error(transparent)]
    Remote(#[from] RemoteError),

    /// A lookup that must be unique matched more than one record. Never retried.
    #[error("ambiguous identity: {count} '{entity}' records match {key}")]
    AmbiguousIdentity {
        entity: String,
        key: String,
        count: usize,
    },

    #[error("no '{entity}' record matches {key}")]
    NotFound { entity: String, key: String },

    /// The remote job ended in `Failed` or `Canceled`.
    #[error("job {job_id} did not succeed: {message}")]
    JobFailed { job_id: Uuid, message: String },

    #[error("could not resolve a tracking job for {key} after {attempts} attempts")]
    JobNotResolved { key: String, attempts: u32 },

    /// One or more plan items failed to apply; the rest were applied.
    #[error("{} of {} {kind} changes failed: {}", failed.len(), attempted, failed.join(", "))]
    PartialApply {
        kind: String,
        attempted: usize,
        failed: Vec<String>,
    },

    /// The local view is empty while the remote one is not.
    #[error("local {kind} view is empty but {remote} remote records exist; pass --allow-empty-source to delete them all")]
    EmptySource { kind: String, remote: usize },

    /// The sink cannot carry out this kind of change.
    #[error("{operation} is not supported for {kind}")]
    Unsupported { kind: String, operation: String },

    #[error("unsupported web resource file type: {0}")]
    UnsupportedFileType(String),

    #[error("package error: {0}")]
    Package(String),

    #[error("extension descriptor error: {0}")]
    Descriptor(String),

    #[error("unreadable flow definition: {0}")]
    FlowDefinition(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ToolboxError {
    pub fn not_found(entity: impl Into<String>, key: impl Into<String>) -> Self {
        ToolboxError::NotFound {
            entity: entity.into(),
            key: key.into(),
        }
    }
}

pub type Result<T, E = ToolboxError> = std::result::Result<T, E>;
