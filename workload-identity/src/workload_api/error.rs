//! Workload API errors.

use thiserror::Error;

use crate::bundle::TrustBundleError;
use crate::error::ErrorKind;
use crate::identity::IdentityError;
use crate::subject_id::SubjectIdError;
use crate::transport::{EndpointError, TransportError};

/// Errors produced by Workload API operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum WorkloadApiError {
    /// The stream ended, or a response carried no identities.
    #[error("empty Workload API response")]
    EmptyResponse,

    /// The endpoint string is invalid.
    #[error("invalid workload api endpoint: {0}")]
    Endpoint(#[from] EndpointError),

    /// The provider has not issued an identity for this workload yet.
    ///
    /// Usually transient: the workload is not registered yet or its selectors do not match.
    #[error("no identity issued")]
    NoIdentityIssued,

    /// The provider denied the request for another reason.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Channel setup failed.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// gRPC status returned by the provider.
    #[error("gRPC status: {0}")]
    Status(#[source] tonic::Status),

    /// An identity in the response is malformed.
    #[error("failed to parse identity: {0}")]
    Identity(#[from] IdentityError),

    /// A trust bundle in the response is malformed.
    #[error("failed to parse trust bundle: {0}")]
    TrustBundle(#[from] TrustBundleError),

    /// A trust domain key in the response is malformed.
    #[error("failed to parse trust domain: {0}")]
    TrustDomain(#[from] SubjectIdError),
}

impl WorkloadApiError {
    /// Returns `true` when the provider answered but the content is unusable.
    ///
    /// Format errors are permanent for a given response; everything else is a
    /// connectivity problem worth retrying.
    pub fn is_format_error(&self) -> bool {
        matches!(
            self,
            WorkloadApiError::Identity(_)
                | WorkloadApiError::TrustBundle(_)
                | WorkloadApiError::TrustDomain(_)
        )
    }

    /// Classifies the error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            WorkloadApiError::Endpoint(_) => ErrorKind::Configuration,
            e if e.is_format_error() => ErrorKind::IdentityFormat,
            _ => ErrorKind::Connection,
        }
    }
}

impl From<tonic::Status> for WorkloadApiError {
    fn from(status: tonic::Status) -> Self {
        use tonic::Code;

        // SPIRE and tbot report an unregistered workload as PermissionDenied with this text.
        if status.code() == Code::PermissionDenied {
            let msg = status.message();

            if msg.contains("no identity issued") {
                return Self::NoIdentityIssued;
            }

            return Self::PermissionDenied(msg.to_owned());
        }

        Self::Status(status)
    }
}

impl From<tonic::transport::Error> for WorkloadApiError {
    fn from(e: tonic::transport::Error) -> Self {
        Self::Transport(TransportError::Tonic(e))
    }
}
