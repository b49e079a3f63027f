#![deny(missing_docs)]
#![warn(missing_debug_implementations)]

//! Rotating X.509 workload identity from a SPIFFE Workload API endpoint.
//!
//! The entry point is [`IdentitySource`]: it fetches the workload's identity (certificate
//! chain, private key and trust bundles) from the local identity provider and keeps it
//! current across rotations. Reads are lock-free snapshots; a rotation never pairs a
//! certificate with the previous key.
//!
//! ```no_run
//! use workload_identity::{IdentitySource, StatusReporter};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let source = IdentitySource::open("unix:///run/tbot/workload.sock").await?;
//!
//! let identity = source.current()?;
//! println!("running as {}", identity.subject_id());
//!
//! let status = StatusReporter::new(source.clone()).status()?;
//! println!("expires in {}", status.expires_in_display());
//!
//! source.close_configured().await?;
//! # Ok(())
//! # }
//! ```
//!
//! Every error type exposes `kind()`, classifying it as one of the [`ErrorKind`]s.
//!
//! ## Features
//!
//! - **`tracing`** (default): log through `tracing`.
//! - **`logging`**: log through `log` when `tracing` is disabled.
//! - **`test-support`**: an in-memory certificate authority and a fake Workload API.

mod observability;
mod prelude;

pub mod bundle;
pub mod cert;
pub mod error;
pub mod identity;
pub mod source;
pub mod status;
pub mod subject_id;
pub mod transport;
pub mod workload_api;

#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

pub use crate::{
    bundle::{TrustBundle, TrustBundleError, TrustBundleSet},
    cert::{Certificate, PrivateKey},
    error::ErrorKind,
    identity::{Identity, IdentityError},
    source::{
        IdentityPicker, IdentitySnapshot, IdentitySource, IdentitySourceBuilder, IdentityUpdates,
        SourceError,
    },
    status::{format_duration, AggregateStatus, IdentityStatus, StatusDocument, StatusReporter},
    subject_id::{SubjectId, SubjectIdError, TrustDomain},
    transport::{Endpoint, EndpointError},
    workload_api::{IdentityContext, WorkloadApiClient, WorkloadApiError},
};
