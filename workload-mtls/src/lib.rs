#![deny(missing_docs)]
#![warn(missing_debug_implementations)]

//! # workload-mtls
//!
//! Mutual TLS with [`rustls`] backed by a live [`IdentitySource`].
//!
//! [`mtls_server`] and [`mtls_client`] build long-lived `rustls` configurations that
//! present the source's current identity on every handshake, verify the peer chain against
//! the current trust bundle for the peer's trust domain, and authorize the peer subject id
//! with an [`Authorizer`], typically an [`AuthorizationPolicy`]. When the identity rotates,
//! the next handshake uses the new material; configurations are never rebuilt.
//!
//! Every verification failure (missing subject id, missing bundle, untrusted or expired
//! chain, unauthorized peer, closed source) is reported to rustls as the same opaque
//! [`AuthorizationError`], so peers only ever see a generic `handshake_failure` alert. The
//! specific reason is logged locally.
//!
//! [`TlsAcceptor`] and [`TlsConnector`] wrap `tokio-rustls` and return the verified
//! [`PeerIdentity`] with the stream.
//!
//! ```no_run
//! use std::sync::Arc;
//! use workload_identity::IdentitySource;
//! use workload_mtls::{mtls_server, AuthorizationPolicy, TlsAcceptor};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let source = IdentitySource::open("unix:///tmp/agent.sock").await?;
//! let policy = AuthorizationPolicy::from_subject_ids(["spiffe://example.org/client"])?;
//! let config = mtls_server(source).authorize(policy).build()?;
//! let acceptor = TlsAcceptor::new(Arc::new(config));
//! # Ok(())
//! # }
//! ```
//!
//! ## Feature flags
//!
//! Exactly one `rustls` crypto provider must be enabled:
//!
//! * `ring` (default)
//! * `aws-lc-rs`
//!
//! Logging goes to `tracing` (default) or, with `logging`, to `log`.

#[cfg(all(feature = "ring", feature = "aws-lc-rs"))]
compile_error!("Enable only one crypto provider feature: `ring` or `aws-lc-rs`.");

#[cfg(not(any(feature = "ring", feature = "aws-lc-rs")))]
compile_error!("Enable one crypto provider feature: `ring` (default) or `aws-lc-rs`.");

mod observability;
mod prelude;

mod acceptor;
mod authorizer;
mod client;
mod connector;
mod crypto;
mod error;
mod identity;
mod material;
mod policy;
mod server;
mod verifier;

pub use acceptor::TlsAcceptor;
pub use authorizer::Authorizer;
pub use client::ClientConfigBuilder;
pub use connector::TlsConnector;
pub use error::{AuthorizationError, Error, HandshakeError, Result};
pub use identity::PeerIdentity;
pub use policy::{AuthorizationPolicy, PolicyError};
pub use server::ServerConfigBuilder;
pub use workload_identity::{IdentitySource, SubjectId};

/// Starts a server configuration builder over `source`.
///
/// Clients must present a certificate and pass the authorizer given to
/// [`ServerConfigBuilder::authorize`].
pub fn mtls_server(source: IdentitySource) -> ServerConfigBuilder {
    ServerConfigBuilder::new(source)
}

/// Starts a client configuration builder over `source`.
pub fn mtls_client(source: IdentitySource) -> ClientConfigBuilder {
    ClientConfigBuilder::new(source)
}
