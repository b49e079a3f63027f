//! Helpers for tests: an in-memory certificate authority that issues workload
//! identities, and an in-process fake Workload API.
//!
//! Everything here panics on failure; it is not meant for production use.

#![allow(clippy::expect_used, clippy::unwrap_used, missing_docs)]

mod fake_workload_api;

pub use fake_workload_api::{FakeUpdate, FakeWorkloadApi};

use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, Ia5String, IsCa, KeyPair, KeyUsagePurpose, SanType,
};
use time::{Duration, OffsetDateTime};

use crate::bundle::TrustBundle;
use crate::identity::Identity;
use crate::subject_id::TrustDomain;

/// A CA able to issue leaf identities, optionally below a chain of intermediates.
pub struct CertificateAuthority {
    trust_domain: TrustDomain,
    key: KeyPair,
    cert: Certificate,
    // DER of the intermediates between this CA and the root, this CA first.
    chain: Vec<Vec<u8>>,
    root_der: Vec<u8>,
}

impl std::fmt::Debug for CertificateAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateAuthority")
            .field("trust_domain", &self.trust_domain)
            .field("intermediates", &self.chain.len())
            .finish_non_exhaustive()
    }
}

impl CertificateAuthority {
    /// Creates a self-signed root for `trust_domain`.
    pub fn new(trust_domain: &str) -> Self {
        let trust_domain = TrustDomain::new(trust_domain).expect("valid trust domain");
        let key = KeyPair::generate().expect("generate CA key");
        let params = ca_params(&format!("{trust_domain} root"));
        let cert = params.self_signed(&key).expect("self-sign CA");
        let root_der = cert.der().to_vec();

        Self {
            trust_domain,
            key,
            cert,
            chain: Vec::new(),
            root_der,
        }
    }

    /// Creates an intermediate CA signed by this one.
    pub fn intermediate(&self) -> Self {
        let key = KeyPair::generate().expect("generate intermediate key");
        let depth = self.chain.len() + 1;
        let params = ca_params(&format!("{} intermediate {depth}", self.trust_domain));
        let cert = params
            .signed_by(&key, &self.cert, &self.key)
            .expect("sign intermediate");

        let mut chain = vec![cert.der().to_vec()];
        chain.extend(self.chain.iter().cloned());

        Self {
            trust_domain: self.trust_domain.clone(),
            key,
            cert,
            chain,
            root_der: self.root_der.clone(),
        }
    }

    pub fn trust_domain(&self) -> &TrustDomain {
        &self.trust_domain
    }

    /// DER of the root certificate, the trust anchor for everything this CA issues.
    pub fn cert_der(&self) -> &[u8] {
        &self.root_der
    }

    /// A bundle holding the root.
    pub fn bundle(&self) -> TrustBundle {
        let mut bundle = TrustBundle::new(self.trust_domain.clone());
        bundle.add_authority(&self.root_der).expect("valid root");
        bundle
    }

    /// Issues a leaf identity.
    pub fn issue(&self, params: &IdentityParams) -> IssuedIdentity {
        let key = KeyPair::generate().expect("generate leaf key");

        let mut cert_params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, params.subject_id.as_str());
        cert_params.distinguished_name = dn;
        cert_params.is_ca = IsCa::ExplicitNoCa;
        cert_params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        cert_params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsagePurpose::ClientAuth,
        ];
        cert_params.subject_alt_names = params
            .uris()
            .map(|uri| SanType::URI(Ia5String::try_from(uri).expect("ASCII URI SAN")))
            .collect();
        cert_params.not_before = params.not_before;
        cert_params.not_after = params.not_after;

        let cert = cert_params
            .signed_by(&key, &self.cert, &self.key)
            .expect("sign leaf");

        let mut chain = vec![cert.der().to_vec()];
        chain.extend(self.chain.iter().cloned());

        IssuedIdentity {
            subject_id: params.subject_id.clone(),
            chain,
            key_der: key.serialize_der(),
            not_after: params.not_after,
        }
    }
}

fn ca_params(common_name: &str) -> CertificateParams {
    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, common_name);
    params.distinguished_name = dn;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];
    let now = whole_seconds(OffsetDateTime::now_utc());
    params.not_before = now - Duration::hours(1);
    params.not_after = now + Duration::days(30);
    params
}

/// Parameters for [`CertificateAuthority::issue`].
#[derive(Debug, Clone)]
pub struct IdentityParams {
    subject_id: String,
    extra_uris: Vec<String>,
    not_before: OffsetDateTime,
    not_after: OffsetDateTime,
}

impl IdentityParams {
    /// A leaf for `subject_id`, valid from a minute ago for one hour.
    pub fn new(subject_id: &str) -> Self {
        let now = whole_seconds(OffsetDateTime::now_utc());
        Self {
            subject_id: subject_id.to_string(),
            extra_uris: Vec::new(),
            not_before: now - Duration::minutes(1),
            not_after: now + Duration::hours(1),
        }
    }

    /// Sets the lifetime counted from now.
    #[must_use]
    pub fn lifetime(mut self, lifetime: Duration) -> Self {
        self.not_after = whole_seconds(OffsetDateTime::now_utc()) + lifetime;
        self
    }

    /// Sets an explicit validity window.
    #[must_use]
    pub fn validity(mut self, not_before: OffsetDateTime, not_after: OffsetDateTime) -> Self {
        self.not_before = whole_seconds(not_before);
        self.not_after = whole_seconds(not_after);
        self
    }

    /// Adds another URI SAN after the subject id.
    #[must_use]
    pub fn extra_uri(mut self, uri: &str) -> Self {
        self.extra_uris.push(uri.to_string());
        self
    }

    fn uris(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.subject_id.as_str()).chain(self.extra_uris.iter().map(String::as_str))
    }
}

/// A freshly issued leaf, its chain and its key.
#[derive(Debug, Clone)]
pub struct IssuedIdentity {
    pub subject_id: String,
    /// Leaf first, then intermediates. The root is not included.
    pub chain: Vec<Vec<u8>>,
    /// PKCS#8 DER.
    pub key_der: Vec<u8>,
    pub not_after: OffsetDateTime,
}

impl IssuedIdentity {
    /// Concatenated DER of the chain, as the Workload API sends it.
    pub fn chain_der(&self) -> Vec<u8> {
        self.chain.concat()
    }

    pub fn leaf_der(&self) -> &[u8] {
        &self.chain[0]
    }

    pub fn identity(&self) -> Identity {
        Identity::parse_from_der(&self.chain_der(), &self.key_der).expect("valid issued identity")
    }
}

fn whole_seconds(t: OffsetDateTime) -> OffsetDateTime {
    t.replace_nanosecond(0).expect("zero is a valid nanosecond")
}
