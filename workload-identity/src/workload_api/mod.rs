//! Client for the SPIFFE Workload API, the local identity-issuing channel.
//!
//! [`crate::IdentitySource`] builds on this client to keep a current identity; the
//! client itself offers one-shot fetches and a raw update stream without reconnection.

// Generated protobuf bindings (see `build.rs`).
#[allow(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    unreachable_pub,
    unused_qualifications,
    unused_results
)]
pub(crate) mod pb {
    tonic::include_proto!("_");
}

pub(crate) mod supervisor_common;

pub mod client;
pub mod context;
pub mod error;

pub use client::WorkloadApiClient;
pub use context::IdentityContext;
pub use error::WorkloadApiError;
