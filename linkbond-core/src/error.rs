//! Group-level errors.
//!
//! Per-link failures are recovered inside the send paths (fall back to
//! another member, activate an idle one); an error only surfaces here when
//! no member could carry the operation.

use tracing::error;

/// Errors reported by group operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum GroupError {
    #[error("operation would block")]
    WouldBlock,

    #[error("operation timed out")]
    Timeout,

    #[error("group is closed")]
    Closed,

    #[error("no member link is connected")]
    NotConnected,

    #[error("invalid parameter: {0}")]
    InvalidParam(&'static str),

    #[error("sender buffer exhausted")]
    ResourceExhausted,

    #[error("internal inconsistency: {0}")]
    Internal(&'static str),
}

impl GroupError {
    /// Whether retrying the same call later can succeed.
    pub fn is_retriable(&self) -> bool {
        matches!(self, GroupError::WouldBlock | GroupError::Timeout)
    }

    /// Convert to the form shown at the public boundary.
    ///
    /// Invariant violations are logged and reported as `Closed`; they must
    /// never leak internals to the caller.
    pub(crate) fn surface(self) -> GroupError {
        match self {
            GroupError::Internal(what) => {
                error!(what, "internal inconsistency surfaced to caller");
                GroupError::Closed
            }
            other => other,
        }
    }
}
