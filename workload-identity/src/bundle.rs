//! Trust bundles: the root authorities used to verify peers of a trust domain.

use std::collections::HashMap;
use std::sync::Arc;

use crate::cert::error::CertificateError;
use crate::cert::parsing::to_certificate_vec;
use crate::cert::Certificate;
use crate::subject_id::TrustDomain;

/// The X.509 authorities of one [`TrustDomain`].
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct TrustBundle {
    trust_domain: TrustDomain,
    authorities: Vec<Certificate>,
}

/// One [`TrustBundle`] per trust domain: the local domain plus any federated ones.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct TrustBundleSet {
    bundles: HashMap<TrustDomain, Arc<TrustBundle>>,
}

/// An error that can arise parsing a [`TrustBundle`].
#[derive(Debug, thiserror::Error, PartialEq)]
#[non_exhaustive]
pub enum TrustBundleError {
    /// One of the authorities is not a valid certificate.
    #[error(transparent)]
    Certificate(#[from] CertificateError),
}

impl TrustBundle {
    /// Creates an empty bundle.
    pub fn new(trust_domain: TrustDomain) -> Self {
        Self {
            trust_domain,
            authorities: Vec::new(),
        }
    }

    /// Parses concatenated DER certificates as the authorities of `trust_domain`.
    pub fn parse_from_der(
        trust_domain: TrustDomain,
        bundle_der: &[u8],
    ) -> Result<Self, TrustBundleError> {
        Ok(Self {
            trust_domain,
            authorities: to_certificate_vec(bundle_der, None)?,
        })
    }

    /// Adds one DER-encoded authority.
    pub fn add_authority(&mut self, authority_der: &[u8]) -> Result<(), TrustBundleError> {
        self.authorities.push(Certificate::try_from(authority_der)?);
        Ok(())
    }

    /// Returns the trust domain of the bundle.
    pub fn trust_domain(&self) -> &TrustDomain {
        &self.trust_domain
    }

    /// Returns the root authorities.
    pub fn authorities(&self) -> &[Certificate] {
        &self.authorities
    }
}

impl TrustBundleSet {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `bundle`, replacing any existing bundle for its trust domain.
    pub fn add_bundle(&mut self, bundle: TrustBundle) {
        self.bundles
            .insert(bundle.trust_domain().clone(), Arc::new(bundle));
    }

    /// Returns the bundle for `trust_domain`, if any.
    pub fn get(&self, trust_domain: &TrustDomain) -> Option<Arc<TrustBundle>> {
        self.bundles.get(trust_domain).cloned()
    }

    /// Iterates over every bundle in the set.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<TrustBundle>> {
        self.bundles.values()
    }

    /// Number of trust domains in the set.
    pub fn len(&self) -> usize {
        self.bundles.len()
    }

    /// Returns `true` when the set holds no bundles.
    pub fn is_empty(&self) -> bool {
        self.bundles.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::CertificateAuthority;

    #[test]
    fn parse_concatenated_authorities() {
        let a = CertificateAuthority::new("example.org");
        let b = CertificateAuthority::new("example.org");
        let mut der = a.cert_der().to_vec();
        der.extend_from_slice(b.cert_der());

        let td = TrustDomain::new("example.org").unwrap();
        let bundle = TrustBundle::parse_from_der(td.clone(), &der).unwrap();

        assert_eq!(bundle.trust_domain(), &td);
        assert_eq!(bundle.authorities().len(), 2);
        assert_eq!(bundle.authorities()[0].as_bytes(), a.cert_der());
    }

    #[test]
    fn parse_rejects_trailing_garbage() {
        let ca = CertificateAuthority::new("example.org");
        let mut der = ca.cert_der().to_vec();
        der.extend_from_slice(b"garbage");

        let td = TrustDomain::new("example.org").unwrap();
        assert!(TrustBundle::parse_from_der(td, &der).is_err());
    }

    #[test]
    fn add_bundle_replaces_same_trust_domain() {
        let td = TrustDomain::new("example.org").unwrap();
        let ca = CertificateAuthority::new("example.org");

        let mut set = TrustBundleSet::new();
        set.add_bundle(TrustBundle::new(td.clone()));

        let mut replacement = TrustBundle::new(td.clone());
        replacement.add_authority(ca.cert_der()).unwrap();
        set.add_bundle(replacement);

        assert_eq!(set.len(), 1);
        assert_eq!(set.get(&td).unwrap().authorities().len(), 1);
        assert!(set
            .get(&TrustDomain::new("other.org").unwrap())
            .is_none());
    }
}
