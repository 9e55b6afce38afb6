//! Error types for enclave-core.

use thiserror::Error;

use crate::tag::InstanceId;

/// Result type for enclave-core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in enclave-core.
///
/// Every failure inside an instance is reclassified into one of these kinds at
/// the session boundary; nothing below it escapes unclassified.
#[derive(Debug, Error)]
pub enum Error {
    /// Package or object not found, or its stored form is malformed.
    #[error("load failure: {0}")]
    LoadFailure(String),

    /// A callable rejected its arguments or failed while running.
    #[error("invocation failure: {0}")]
    InvocationFailure(String),

    /// A buffer owned by one instance was handed to another.
    #[error("tag mismatch: buffer owned by {owner} cannot be used by {requester}")]
    TagMismatch {
        owner: InstanceId,
        requester: InstanceId,
    },

    /// The instance (or the pool holding it) has been torn down.
    #[error("use after destroy: {0}")]
    UseAfterDestroy(String),

    /// Instance index outside the pool.
    #[error("pool exhausted: no instance at index {index} (pool size {size})")]
    PoolExhausted { index: usize, size: usize },

    /// Teardown of a slot that a session on this thread still holds.
    #[error("instance {index} is still held by an open session")]
    InstanceBusy { index: usize },
}

impl Error {
    pub(crate) fn load(message: impl Into<String>) -> Self {
        Self::LoadFailure(message.into())
    }

    pub(crate) fn invocation(message: impl Into<String>) -> Self {
        Self::InvocationFailure(message.into())
    }

    /// Suggested fix for the caller, where one is known.
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            Error::LoadFailure(_) => {
                Some("check the package path and that the object is listed in manifest.json")
            }
            Error::TagMismatch { .. } => {
                Some("tensors produced by one instance must be copied before use in another")
            }
            Error::PoolExhausted { .. } => Some("use an index below the pool size"),
            Error::InstanceBusy { .. } => Some("drop open sessions before resetting or shutting down"),
            Error::InvocationFailure(_) | Error::UseAfterDestroy(_) => None,
        }
    }

    /// Message followed by the hint, if any.
    pub fn with_hint(&self) -> String {
        match self.hint() {
            Some(hint) => format!("{}\n  hint: {}", self, hint),
            None => self.to_string(),
        }
    }
}
