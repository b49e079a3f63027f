//! The authorization seam used by the verifiers.

use std::sync::Arc;

use workload_identity::SubjectId;

/// Decides whether a verified peer subject id may connect.
///
/// Runs only after the peer chain has been verified against the trust bundle for the
/// peer's trust domain. Implementations must be thread-safe.
pub trait Authorizer: Send + Sync + 'static {
    /// Returns `true` if `peer` is authorized.
    fn authorize(&self, peer: &SubjectId) -> bool;
}

impl<F> Authorizer for F
where
    F: Fn(&SubjectId) -> bool + Send + Sync + 'static,
{
    fn authorize(&self, peer: &SubjectId) -> bool {
        self(peer)
    }
}

impl Authorizer for Arc<dyn Authorizer> {
    fn authorize(&self, peer: &SubjectId) -> bool {
        (**self).authorize(peer)
    }
}

impl Authorizer for Box<dyn Authorizer> {
    fn authorize(&self, peer: &SubjectId) -> bool {
        (**self).authorize(peer)
    }
}
