//! One Workload API update: the issued identities and the trust bundles.

use std::sync::Arc;

use crate::bundle::TrustBundleSet;
use crate::identity::Identity;

/// Identities and bundles from a single Workload API message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityContext {
    identities: Vec<Arc<Identity>>,
    bundles: Arc<TrustBundleSet>,
}

impl IdentityContext {
    /// Creates a context.
    pub fn new(identities: Vec<Arc<Identity>>, bundles: Arc<TrustBundleSet>) -> Self {
        Self {
            identities,
            bundles,
        }
    }

    /// The provider's default identity (the first one).
    pub fn default_identity(&self) -> Option<&Arc<Identity>> {
        self.identities.first()
    }

    /// All identities, in provider order.
    pub fn identities(&self) -> &[Arc<Identity>] {
        &self.identities
    }

    /// The trust bundles, local and federated.
    pub fn bundles(&self) -> &Arc<TrustBundleSet> {
        &self.bundles
    }
}
