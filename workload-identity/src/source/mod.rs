//! Identity Source: a live, self-refreshing view of the workload's X.509 identity.
//!
//! [`IdentitySource::open`] performs the initial fetch (bounded by the initial fetch
//! timeout) and returns once an identity is available. A background supervisor then
//! watches the Workload API for rotations, validates each update and swaps it in
//! atomically. Transient failures are handled by reconnecting with backoff while the last
//! accepted identity keeps being served; [`IdentitySource::is_stale`] reports that state.
//!
//! Updates are rejected when they exceed the [`ResourceLimits`], contain no selectable
//! identity, or carry a leaf that does not expire strictly later than the current one.
//!
//! # Example
//!
//! ```no_run
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! use workload_identity::{IdentitySource, TrustDomain};
//!
//! let source = IdentitySource::open("unix:///run/tbot/workload.sock").await?;
//!
//! let identity = source.current()?;
//! println!("{} expires at {}", identity.subject_id(), identity.not_after());
//!
//! let td = TrustDomain::new("example.org")?;
//! let bundle = source.bundle_for(&td)?.ok_or("missing bundle")?;
//! println!("{} authorities", bundle.authorities().len());
//!
//! source.close_configured().await?;
//! # Ok(())
//! # }
//! ```

mod builder;
mod errors;
mod limits;
#[allow(clippy::module_inception)]
mod source;
mod supervisor;
mod types;

pub use builder::{
    IdentitySourceBuilder, ReconnectConfig, ResourceLimits, DEFAULT_INITIAL_FETCH_TIMEOUT,
};
pub use errors::{LimitKind, SourceError};
pub use source::{IdentitySnapshot, IdentitySource, IdentityUpdates};
pub use types::{ClientFactory, ClientFuture, IdentityPicker};
