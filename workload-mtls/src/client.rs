use std::sync::Arc;

use rustls::client::{ResolvesClientCert, Resumption};
use rustls::sign::CertifiedKey;
use rustls::{ClientConfig, SignatureScheme};
use workload_identity::IdentitySource;

use crate::authorizer::Authorizer;
use crate::error::{Error, Result};
use crate::material::IdentityMaterial;
use crate::prelude::warn;
use crate::verifier::ServerIdentityVerifier;

type ClientConfigCustomizer = Box<dyn FnOnce(&mut ClientConfig) + Send>;

/// Builds a [`rustls::ClientConfig`] backed by a live [`IdentitySource`].
///
/// The resulting configuration presents the current identity as the client certificate,
/// verifies the server chain against the bundle for the server's trust domain, and
/// authorizes the server subject id. The server name is used for SNI only; there is no
/// DNS hostname check. Session resumption is disabled.
///
/// ```no_run
/// use workload_identity::IdentitySource;
/// use workload_mtls::{mtls_client, AuthorizationPolicy};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let source = IdentitySource::open("unix:///tmp/agent.sock").await?;
/// let backend = AuthorizationPolicy::from_subject_ids(["spiffe://example.org/backend"])?;
/// let config = mtls_client(source).authorize(backend).build()?;
/// # Ok(())
/// # }
/// ```
pub struct ClientConfigBuilder {
    source: IdentitySource,
    authorizer: Option<Arc<dyn Authorizer>>,
    alpn_protocols: Vec<Vec<u8>>,
    config_customizer: Option<ClientConfigCustomizer>,
}

impl std::fmt::Debug for ClientConfigBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConfigBuilder")
            .field("source", &self.source)
            .field("authorizer", &self.authorizer.is_some())
            .field("alpn_protocols", &self.alpn_protocols)
            .field("config_customizer", &self.config_customizer.is_some())
            .finish()
    }
}

impl ClientConfigBuilder {
    /// Creates a builder. An authorizer must be set before [`ClientConfigBuilder::build`].
    pub fn new(source: IdentitySource) -> Self {
        Self {
            source,
            authorizer: None,
            alpn_protocols: Vec::new(),
            config_customizer: None,
        }
    }

    /// Sets the authorizer applied to the verified server subject id.
    ///
    /// Accepts an [`AuthorizationPolicy`](crate::AuthorizationPolicy) or any closure
    /// `Fn(&SubjectId) -> bool`.
    #[must_use]
    pub fn authorize<A: Authorizer>(mut self, authorizer: A) -> Self {
        self.authorizer = Some(Arc::new(authorizer));
        self
    }

    /// Sets the ALPN protocols, most preferred first.
    #[must_use]
    pub fn with_alpn_protocols<I, P>(mut self, protocols: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: AsRef<[u8]>,
    {
        self.alpn_protocols = protocols.into_iter().map(|p| p.as_ref().to_vec()).collect();
        self
    }

    /// Applies `customizer` to the built config, after every other setting.
    ///
    /// Do not replace the verifier or the client certificate resolver.
    #[must_use]
    pub fn with_config_customizer<F>(mut self, customizer: F) -> Self
    where
        F: FnOnce(&mut ClientConfig) + Send + 'static,
    {
        self.config_customizer = Some(Box::new(customizer));
        self
    }

    /// Builds the `rustls::ClientConfig`.
    ///
    /// # Errors
    ///
    /// * [`Error::MissingAuthorizer`] if no authorizer was set
    /// * [`Error::Source`] if the source is already closed
    /// * [`Error::MissingCryptoProvider`] if no rustls provider can be installed
    pub fn build(self) -> Result<ClientConfig> {
        let authorizer = self.authorizer.ok_or(Error::MissingAuthorizer)?;
        let provider = crate::crypto::default_provider()?;
        self.source.snapshot()?;

        let material = Arc::new(IdentityMaterial::new(
            self.source.clone(),
            Arc::clone(&provider),
        ));
        let resolver = Arc::new(IdentityClientResolver { material });
        let verifier = Arc::new(ServerIdentityVerifier::new(
            self.source,
            authorizer,
            provider,
        ));

        let mut cfg = ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(verifier)
            .with_client_cert_resolver(resolver);

        // A resumed session skips the server verifier.
        cfg.resumption = Resumption::disabled();
        cfg.alpn_protocols = self.alpn_protocols;

        if let Some(customizer) = self.config_customizer {
            customizer(&mut cfg);
        }

        Ok(cfg)
    }
}

#[derive(Debug)]
struct IdentityClientResolver {
    material: Arc<IdentityMaterial>,
}

impl ResolvesClientCert for IdentityClientResolver {
    fn resolve(
        &self,
        _root_hint_subjects: &[&[u8]],
        _sigschemes: &[SignatureScheme],
    ) -> Option<Arc<CertifiedKey>> {
        match self.material.certified_key() {
            Ok(key) => Some(key),
            Err(e) => {
                warn!("not presenting a client certificate: {e}");
                None
            }
        }
    }

    fn has_certs(&self) -> bool {
        true
    }
}
