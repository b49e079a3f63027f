use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::identity::Identity;
use crate::workload_api::{WorkloadApiClient, WorkloadApiError};

/// Chooses which identity to use when the provider issues several.
///
/// Without a picker the provider's first (default) identity is used.
///
/// ```
/// use std::sync::Arc;
/// use workload_identity::{Identity, IdentityPicker};
///
/// #[derive(Debug)]
/// struct ByHint(&'static str);
///
/// impl IdentityPicker for ByHint {
///     fn pick(&self, identities: &[Arc<Identity>]) -> Option<usize> {
///         identities.iter().position(|i| i.hint() == Some(self.0))
///     }
/// }
/// ```
pub trait IdentityPicker: Send + Sync + 'static {
    /// Returns the index of the identity to use, or `None` if none fits.
    fn pick(&self, identities: &[Arc<Identity>]) -> Option<usize>;
}

/// Future returned by a [`ClientFactory`].
pub type ClientFuture =
    Pin<Box<dyn Future<Output = Result<WorkloadApiClient, WorkloadApiError>> + Send + 'static>>;

/// Creates Workload API clients; called for the initial fetch and on every reconnect.
pub type ClientFactory = Arc<dyn Fn() -> ClientFuture + Send + Sync + 'static>;
