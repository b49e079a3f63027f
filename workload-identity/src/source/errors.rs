use std::time::Duration;

use time::OffsetDateTime;

use crate::error::ErrorKind;
use crate::workload_api::WorkloadApiError;

/// Which resource limit an update exceeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum LimitKind {
    /// Number of identities in one update.
    MaxIdentities,
    /// Number of trust bundles in one update.
    MaxBundles,
    /// Summed DER size of one bundle's authorities.
    MaxBundleDerBytes,
}

/// Errors produced by [`crate::IdentitySource`].
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum SourceError {
    /// The Workload API client failed.
    #[error(transparent)]
    Source(#[from] WorkloadApiError),

    /// The initial fetch did not complete in time.
    #[error(
        "initial identity fetch did not complete within {timeout:?}: {}",
        .last_error.as_ref().map_or_else(|| "no attempt finished".to_string(), ToString::to_string)
    )]
    InitialFetchTimeout {
        /// Configured bound.
        timeout: Duration,
        /// Failure of the last attempt, if any attempt finished.
        #[source]
        last_error: Option<Box<SourceError>>,
    },

    /// The update stream ended without delivering an identity.
    #[error("workload api stream ended")]
    StreamEnded,

    /// No identity in the update could be selected.
    #[error("no suitable identity in update")]
    NoSuitableIdentity,

    /// The update's leaf expires no later than the current one.
    #[error("rejected identity update: notAfter {new} is not later than current {current}")]
    NotAfterRegression {
        /// Current leaf notAfter.
        current: OffsetDateTime,
        /// Rejected leaf notAfter.
        new: OffsetDateTime,
    },

    /// The update exceeds a resource limit.
    #[error("resource limit exceeded: {kind:?} (limit={limit}, actual={actual})")]
    ResourceLimitExceeded {
        /// Limit that was exceeded.
        kind: LimitKind,
        /// Configured limit.
        limit: usize,
        /// Observed value.
        actual: usize,
    },

    /// The source was closed.
    #[error("identity source is closed")]
    Closed,

    /// Background tasks did not stop in time and were aborted.
    #[error("identity source shutdown timed out")]
    ShutdownTimeout,
}

impl SourceError {
    /// Classifies the error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            SourceError::Source(e) => e.kind(),
            SourceError::InitialFetchTimeout { .. } | SourceError::StreamEnded => {
                ErrorKind::Connection
            }
            SourceError::NoSuitableIdentity
            | SourceError::NotAfterRegression { .. }
            | SourceError::ResourceLimitExceeded { .. } => ErrorKind::IdentityFormat,
            SourceError::Closed | SourceError::ShutdownTimeout => ErrorKind::Closed,
        }
    }
}
