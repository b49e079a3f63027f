//! Errors raised while connecting to the identity provider.

use thiserror::Error;

/// Errors produced while opening a channel to the identity provider.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TransportError {
    /// The endpoint transport is unsupported on the current platform.
    #[error("unsupported endpoint transport: {scheme}")]
    UnsupportedEndpointTransport {
        /// The unsupported transport scheme.
        scheme: &'static str,
    },

    /// Connection or channel setup failed.
    #[error(transparent)]
    Tonic(#[from] tonic::transport::Error),
}
