use std::sync::Arc;

use arc_swap::ArcSwapOption;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::sign::CertifiedKey;
use rustls::RootCertStore;
use time::OffsetDateTime;
use workload_identity::{Identity, IdentitySource, TrustBundle};

use crate::error::{Error, Result};
use crate::prelude::debug;

/// The rustls signing material built from one source generation.
#[derive(Debug)]
struct MaterialSnapshot {
    generation: u64,
    certified_key: Arc<CertifiedKey>,
}

/// Presents the source's current identity to rustls.
///
/// The certified key is rebuilt lazily the first time a handshake sees a new source
/// generation, so rotations take effect on the next connection without a watcher task.
#[derive(Debug)]
pub(crate) struct IdentityMaterial {
    source: IdentitySource,
    provider: Arc<CryptoProvider>,
    cached: ArcSwapOption<MaterialSnapshot>,
}

impl IdentityMaterial {
    pub(crate) fn new(source: IdentitySource, provider: Arc<CryptoProvider>) -> Self {
        Self {
            source,
            provider,
            cached: ArcSwapOption::empty(),
        }
    }

    /// Returns the key to present now.
    ///
    /// Fails for a closed source and for an identity past its `not_after`.
    pub(crate) fn certified_key(&self) -> Result<Arc<CertifiedKey>> {
        self.certified_key_at(OffsetDateTime::now_utc())
    }

    pub(crate) fn certified_key_at(&self, now: OffsetDateTime) -> Result<Arc<CertifiedKey>> {
        let snapshot = self.source.snapshot()?;
        let identity = snapshot.identity();

        if identity.is_expired_at(now) {
            return Err(Error::IdentityExpired {
                subject_id: identity.subject_id().clone(),
                not_after: identity.not_after(),
            });
        }

        if let Some(cached) = self.cached.load_full() {
            if cached.generation == snapshot.generation() {
                return Ok(Arc::clone(&cached.certified_key));
            }
        }

        let certified_key = certified_key_from_identity(identity, &self.provider)?;
        debug!(
            "built certified key for {} (generation {})",
            identity.subject_id(),
            snapshot.generation()
        );
        self.cached.store(Some(Arc::new(MaterialSnapshot {
            generation: snapshot.generation(),
            certified_key: Arc::clone(&certified_key),
        })));

        Ok(certified_key)
    }
}

/// Builds a rustls `CertifiedKey` from an identity's chain and PKCS#8 key.
pub(crate) fn certified_key_from_identity(
    identity: &Identity,
    provider: &CryptoProvider,
) -> Result<Arc<CertifiedKey>> {
    let chain: Vec<CertificateDer<'static>> = identity
        .cert_chain()
        .iter()
        .map(|cert| CertificateDer::from(cert.as_bytes().to_vec()))
        .collect();

    let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(
        identity.private_key().as_bytes().to_vec(),
    ));

    let signing_key = provider
        .key_provider
        .load_private_key(key_der)
        .map_err(|e| Error::CertifiedKey(format!("{e:?}")))?;

    Ok(Arc::new(CertifiedKey::new(chain, signing_key)))
}

/// Builds a root store from a trust bundle's authorities.
///
/// Returns `None` when no authority is usable as a trust anchor.
pub(crate) fn roots_from_bundle(bundle: &TrustBundle) -> Option<Arc<RootCertStore>> {
    let mut store = RootCertStore::empty();
    let (added, ignored) = store.add_parsable_certificates(
        bundle
            .authorities()
            .iter()
            .map(|cert| CertificateDer::from(cert.as_bytes().to_vec())),
    );
    debug!(
        "loaded {added} root(s) for {} ({ignored} ignored)",
        bundle.trust_domain()
    );

    if store.is_empty() {
        return None;
    }
    Some(Arc::new(store))
}
