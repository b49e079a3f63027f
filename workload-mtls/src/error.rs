//! Error types for `workload-mtls`.

use std::io;

use thiserror::Error;
use time::OffsetDateTime;
use workload_identity::{ErrorKind, SourceError, SubjectId};

use crate::policy::PolicyError;

/// Errors returned while building TLS configurations or resolving local material.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// No rustls crypto provider is installed and none could be installed.
    #[error("rustls crypto provider is not installed")]
    MissingCryptoProvider,

    /// `build()` was called without an authorizer.
    #[error("no authorizer configured; call `.authorize(..)` before `.build()`")]
    MissingAuthorizer,

    /// The authorization policy is invalid.
    #[error(transparent)]
    Policy(#[from] PolicyError),

    /// The identity source is closed or otherwise unusable.
    #[error("identity source unavailable: {0}")]
    Source(#[from] SourceError),

    /// The local identity is past its `not_after` and is not presented.
    #[error("local identity {subject_id} expired at {not_after}")]
    IdentityExpired {
        /// Subject of the expired identity.
        subject_id: SubjectId,
        /// Leaf `not_after`.
        not_after: OffsetDateTime,
    },

    /// The local chain and key could not be turned into a rustls signing key.
    #[error("failed building certified key: {0}")]
    CertifiedKey(String),

    /// A rustls error.
    #[error("rustls error: {0}")]
    Rustls(#[from] rustls::Error),
}

impl Error {
    /// Classifies the error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::MissingCryptoProvider | Error::MissingAuthorizer | Error::Rustls(_) => {
                ErrorKind::Configuration
            }
            Error::Policy(e) => e.kind(),
            Error::Source(e) => e.kind(),
            Error::IdentityExpired { .. } => ErrorKind::Connection,
            Error::CertifiedKey(_) => ErrorKind::IdentityFormat,
        }
    }
}

/// Result type for this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// The one error every rejected peer verification reports to rustls.
///
/// The peer sees a generic `handshake_failure` alert; the specific reason is only logged
/// locally.
#[derive(Debug, Clone, Copy, Default, Error)]
#[error("peer is not authorized")]
pub struct AuthorizationError;

impl AuthorizationError {
    /// Always [`ErrorKind::Authorization`].
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Authorization
    }
}

/// Errors returned by [`TlsAcceptor::accept`](crate::TlsAcceptor::accept) and
/// [`TlsConnector::connect`](crate::TlsConnector::connect).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum HandshakeError {
    /// The TLS handshake failed: the peer was refused, refused us, or spoke bad TLS.
    #[error("TLS handshake rejected: {0}")]
    Rejected(#[source] rustls::Error),

    /// The handshake completed but the peer chain carries no usable subject id.
    #[error("peer presented no subject id")]
    MissingPeerIdentity,

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[source] io::Error),
}

impl HandshakeError {
    /// Classifies the error. Every rejection is [`ErrorKind::Authorization`].
    pub fn kind(&self) -> ErrorKind {
        match self {
            HandshakeError::Rejected(_) | HandshakeError::MissingPeerIdentity => {
                ErrorKind::Authorization
            }
            HandshakeError::Io(_) => ErrorKind::Connection,
        }
    }

    /// Returns `true` for a rejected handshake.
    pub fn is_rejected(&self) -> bool {
        self.kind() == ErrorKind::Authorization
    }
}

// tokio-rustls wraps rustls failures in `io::ErrorKind::InvalidData`.
impl From<io::Error> for HandshakeError {
    fn from(e: io::Error) -> Self {
        if let Some(tls) = e
            .get_ref()
            .and_then(|inner| inner.downcast_ref::<rustls::Error>())
        {
            return HandshakeError::Rejected(tls.clone());
        }
        HandshakeError::Io(e)
    }
}
