//! rustls verifiers that authenticate peers with the source's trust bundles and authorize
//! them by subject id.
//!
//! Every failure is reported to rustls as the same opaque [`AuthorizationError`]; the
//! specific reason is only logged.

use std::collections::HashMap;
use std::fmt::{self, Debug};
use std::sync::{Arc, Mutex};

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::server::{ParsedCertificate, WebPkiClientVerifier};
use rustls::{DigitallySignedStruct, DistinguishedName, RootCertStore, SignatureScheme};
use thiserror::Error;
use workload_identity::cert::error::CertificateError;
use workload_identity::cert::subject_id_from_der;
use workload_identity::{IdentitySource, SourceError, SubjectId, TrustDomain};

use crate::authorizer::Authorizer;
use crate::error::AuthorizationError;
use crate::material::roots_from_bundle;
use crate::prelude::warn;

/// Why a peer was refused. Logged locally, never sent to the peer.
#[derive(Debug, Error)]
enum Rejection {
    #[error("peer certificate has no usable subject id: {0}")]
    NoSubjectId(#[from] CertificateError),

    #[error("identity source unavailable: {0}")]
    Source(#[from] SourceError),

    #[error("no trust bundle for trust domain {0}")]
    NoBundle(TrustDomain),

    #[error("peer chain for {subject_id} failed verification: {source}")]
    Untrusted {
        subject_id: SubjectId,
        #[source]
        source: rustls::Error,
    },

    #[error("peer {0} is not authorized")]
    Unauthorized(SubjectId),
}

fn reject() -> rustls::Error {
    rustls::Error::Other(rustls::OtherError(Arc::new(AuthorizationError)))
}

/// Per-trust-domain values valid for one source generation.
struct GenerationCache<T> {
    entry: Mutex<Option<(u64, HashMap<TrustDomain, T>)>>,
}

impl<T: Clone> GenerationCache<T> {
    fn new() -> Self {
        Self {
            entry: Mutex::new(None),
        }
    }

    fn get_or_try_insert<E>(
        &self,
        generation: u64,
        trust_domain: &TrustDomain,
        build: impl FnOnce() -> Result<T, E>,
    ) -> Result<T, E> {
        // A poisoned lock only costs the cache.
        let Ok(mut guard) = self.entry.lock() else {
            return build();
        };

        let stale = guard.as_ref().is_none_or(|(g, _)| *g != generation);
        if stale {
            *guard = Some((generation, HashMap::new()));
        }

        let Some((_, values)) = guard.as_mut() else {
            return build();
        };
        if let Some(value) = values.get(trust_domain) {
            return Ok(value.clone());
        }

        let value = build()?;
        values.insert(trust_domain.clone(), value.clone());
        Ok(value)
    }
}

/// State shared by both verifier directions.
struct PeerCheck {
    source: IdentitySource,
    authorizer: Arc<dyn Authorizer>,
    provider: Arc<CryptoProvider>,
    roots: GenerationCache<Arc<RootCertStore>>,
}

impl PeerCheck {
    fn new(
        source: IdentitySource,
        authorizer: Arc<dyn Authorizer>,
        provider: Arc<CryptoProvider>,
    ) -> Self {
        Self {
            source,
            authorizer,
            provider,
            roots: GenerationCache::new(),
        }
    }

    /// Extracts the subject id, selects the bundle for its trust domain, runs `verify_chain`
    /// against it and finally applies the authorizer.
    fn verify<T>(
        &self,
        role: &str,
        end_entity: &CertificateDer<'_>,
        verify_chain: impl FnOnce(u64, &TrustDomain, Arc<RootCertStore>) -> Result<T, rustls::Error>,
    ) -> Result<T, rustls::Error> {
        self.check(end_entity, verify_chain).map_err(|rejection| {
            warn!("rejected {role} during handshake: {rejection}");
            reject()
        })
    }

    fn check<T>(
        &self,
        end_entity: &CertificateDer<'_>,
        verify_chain: impl FnOnce(u64, &TrustDomain, Arc<RootCertStore>) -> Result<T, rustls::Error>,
    ) -> Result<T, Rejection> {
        let subject_id = subject_id_from_der(end_entity.as_ref())?;
        let trust_domain = subject_id.trust_domain();

        let snapshot = self.source.snapshot()?;
        let generation = snapshot.generation();
        let roots = self.roots.get_or_try_insert(generation, trust_domain, || {
            snapshot
                .bundles()
                .get(trust_domain)
                .and_then(|bundle| roots_from_bundle(&bundle))
                .ok_or_else(|| Rejection::NoBundle(trust_domain.clone()))
        })?;

        let verified =
            verify_chain(generation, trust_domain, roots).map_err(|source| Rejection::Untrusted {
                subject_id: subject_id.clone(),
                source,
            })?;

        if !self.authorizer.authorize(&subject_id) {
            return Err(Rejection::Unauthorized(subject_id));
        }

        Ok(verified)
    }

    fn verify_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
        tls13: bool,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        let algorithms = &self.provider.signature_verification_algorithms;
        if tls13 {
            verify_tls13_signature(message, cert, dss, algorithms)
        } else {
            verify_tls12_signature(message, cert, dss, algorithms)
        }
    }

    fn supported_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

// ------------ Server verifier (client side) ------------

/// Verifies the server chain and authorizes the server subject id.
///
/// There is no DNS name check: the server is identified by its subject id.
pub(crate) struct ServerIdentityVerifier {
    check: PeerCheck,
}

impl ServerIdentityVerifier {
    pub(crate) fn new(
        source: IdentitySource,
        authorizer: Arc<dyn Authorizer>,
        provider: Arc<CryptoProvider>,
    ) -> Self {
        Self {
            check: PeerCheck::new(source, authorizer, provider),
        }
    }
}

impl Debug for ServerIdentityVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerIdentityVerifier").finish_non_exhaustive()
    }
}

impl ServerCertVerifier for ServerIdentityVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let algorithms = self.check.provider.signature_verification_algorithms.all;
        self.check.verify("server", end_entity, |_, _, roots| {
            let cert = ParsedCertificate::try_from(end_entity)?;
            rustls::client::verify_server_cert_signed_by_trust_anchor(
                &cert,
                &roots,
                intermediates,
                now,
                algorithms,
            )?;
            Ok(ServerCertVerified::assertion())
        })
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.check.verify_signature(message, cert, dss, false)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.check.verify_signature(message, cert, dss, true)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.check.supported_schemes()
    }
}

// ------------ Client verifier (server side) ------------

/// Requires a client certificate, verifies its chain and authorizes its subject id.
pub(crate) struct ClientIdentityVerifier {
    check: PeerCheck,
    webpki: GenerationCache<Arc<dyn ClientCertVerifier>>,
}

impl ClientIdentityVerifier {
    pub(crate) fn new(
        source: IdentitySource,
        authorizer: Arc<dyn Authorizer>,
        provider: Arc<CryptoProvider>,
    ) -> Self {
        Self {
            check: PeerCheck::new(source, authorizer, provider),
            webpki: GenerationCache::new(),
        }
    }

    fn webpki_for(
        &self,
        generation: u64,
        trust_domain: &TrustDomain,
        roots: Arc<RootCertStore>,
    ) -> Result<Arc<dyn ClientCertVerifier>, rustls::Error> {
        let provider = Arc::clone(&self.check.provider);
        self.webpki.get_or_try_insert(generation, trust_domain, || {
            WebPkiClientVerifier::builder_with_provider(roots, provider)
                .build()
                .map_err(|e| rustls::Error::General(format!("client verifier: {e}")))
        })
    }
}

impl Debug for ClientIdentityVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientIdentityVerifier").finish_non_exhaustive()
    }
}

impl ClientCertVerifier for ClientIdentityVerifier {
    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        // Hints only steer what the peer might send; verification does not depend on them.
        &[]
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        self.check
            .verify("client", end_entity, |generation, trust_domain, roots| {
                self.webpki_for(generation, trust_domain, roots)?
                    .verify_client_cert(end_entity, intermediates, now)
            })
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.check.verify_signature(message, cert, dss, false)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.check.verify_signature(message, cert, dss, true)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.check.supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::default_provider;
    use crate::policy::AuthorizationPolicy;
    use time::{Duration, OffsetDateTime};
    use workload_identity::test_support::{
        CertificateAuthority, FakeUpdate, FakeWorkloadApi, IdentityParams, IssuedIdentity,
    };

    const SERVER: &str = "spiffe://example.org/backend";
    const CLIENT: &str = "spiffe://example.org/client";

    struct Fixture {
        ca: CertificateAuthority,
        _api: FakeWorkloadApi,
        source: IdentitySource,
    }

    async fn fixture() -> Fixture {
        let ca = CertificateAuthority::new("example.org");
        let api = FakeWorkloadApi::start().await;
        api.push(FakeUpdate::new().identity(&ca.issue(&IdentityParams::new(SERVER)), &ca));
        let source = IdentitySource::open(api.endpoint()).await.unwrap();
        Fixture {
            ca,
            _api: api,
            source,
        }
    }

    fn accepting(ids: &[&str]) -> Arc<dyn Authorizer> {
        Arc::new(AuthorizationPolicy::from_subject_ids(ids).unwrap())
    }

    fn client_verifier(f: &Fixture, ids: &[&str]) -> ClientIdentityVerifier {
        ClientIdentityVerifier::new(f.source.clone(), accepting(ids), default_provider().unwrap())
    }

    fn verify_client(
        v: &ClientIdentityVerifier,
        issued: &IssuedIdentity,
    ) -> Result<ClientCertVerified, rustls::Error> {
        let chain: Vec<CertificateDer<'static>> = issued
            .chain
            .iter()
            .map(|der| CertificateDer::from(der.clone()))
            .collect();
        v.verify_client_cert(&chain[0], &chain[1..], UnixTime::now())
    }

    fn is_opaque_rejection(err: &rustls::Error) -> bool {
        matches!(err, rustls::Error::Other(other) if other.0.downcast_ref::<AuthorizationError>().is_some())
    }

    #[tokio::test]
    async fn accepted_client_passes() {
        let f = fixture().await;
        let v = client_verifier(&f, &[CLIENT]);
        verify_client(&v, &f.ca.issue(&IdentityParams::new(CLIENT))).unwrap();
    }

    #[tokio::test]
    async fn client_through_intermediate_passes() {
        let f = fixture().await;
        let v = client_verifier(&f, &[CLIENT]);
        let issued = f.ca.intermediate().issue(&IdentityParams::new(CLIENT));
        verify_client(&v, &issued).unwrap();
    }

    #[tokio::test]
    async fn every_failure_is_the_same_opaque_error() {
        let f = fixture().await;
        let v = client_verifier(&f, &[CLIENT]);
        let now = OffsetDateTime::now_utc();

        let unauthorized = f.ca.issue(&IdentityParams::new("spiffe://example.org/intruder"));
        let foreign_ca = CertificateAuthority::new("example.org");
        let untrusted = foreign_ca.issue(&IdentityParams::new(CLIENT));
        let other_domain =
            CertificateAuthority::new("other.org").issue(&IdentityParams::new("spiffe://other.org/client"));
        let expired = f.ca.issue(
            &IdentityParams::new(CLIENT).validity(now - Duration::hours(2), now - Duration::hours(1)),
        );

        for issued in [&unauthorized, &untrusted, &other_domain, &expired] {
            let err = verify_client(&v, issued).unwrap_err();
            assert!(is_opaque_rejection(&err), "{}: {err:?}", issued.subject_id);
        }

        let garbage = CertificateDer::from(b"not a certificate".to_vec());
        let err = v
            .verify_client_cert(&garbage, &[], UnixTime::now())
            .unwrap_err();
        assert!(is_opaque_rejection(&err));
    }

    #[tokio::test]
    async fn closed_source_rejects_peers() {
        let f = fixture().await;
        let v = client_verifier(&f, &[CLIENT]);
        f.source.close().await;

        let err = verify_client(&v, &f.ca.issue(&IdentityParams::new(CLIENT))).unwrap_err();
        assert!(is_opaque_rejection(&err));
    }

    #[tokio::test]
    async fn server_verification_ignores_the_dns_name() {
        let f = fixture().await;
        let v = ServerIdentityVerifier::new(
            f.source.clone(),
            accepting(&[SERVER]),
            default_provider().unwrap(),
        );
        let issued = f.ca.issue(&IdentityParams::new(SERVER));
        let leaf = CertificateDer::from(issued.leaf_der().to_vec());
        let name = ServerName::try_from("unrelated.example").unwrap();

        v.verify_server_cert(&leaf, &[], &name, &[], UnixTime::now())
            .unwrap();

        let other = f.ca.issue(&IdentityParams::new("spiffe://example.org/impostor"));
        let leaf = CertificateDer::from(other.leaf_der().to_vec());
        let err = v
            .verify_server_cert(&leaf, &[], &name, &[], UnixTime::now())
            .unwrap_err();
        assert!(is_opaque_rejection(&err));
    }

    #[test]
    fn generation_cache_resets_on_new_generation() {
        let cache = GenerationCache::<u32>::new();
        let td = TrustDomain::new("example.org").unwrap();

        let first: Result<u32, ()> = cache.get_or_try_insert(0, &td, || Ok(1));
        assert_eq!(first, Ok(1));
        let cached: Result<u32, ()> = cache.get_or_try_insert(0, &td, || Ok(2));
        assert_eq!(cached, Ok(1));
        let rebuilt: Result<u32, ()> = cache.get_or_try_insert(1, &td, || Ok(3));
        assert_eq!(rebuilt, Ok(3));
        let failed: Result<u32, &str> =
            cache.get_or_try_insert(1, &TrustDomain::new("other.org").unwrap(), || Err("no"));
        assert_eq!(failed, Err("no"));
    }
}
