use std::sync::Arc;

use rustls::server::{ClientHello, NoServerSessionStorage, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::ServerConfig;
use workload_identity::IdentitySource;

use crate::authorizer::Authorizer;
use crate::error::{Error, Result};
use crate::material::IdentityMaterial;
use crate::prelude::warn;
use crate::verifier::ClientIdentityVerifier;

type ServerConfigCustomizer = Box<dyn FnOnce(&mut ServerConfig) + Send>;

/// Builds a [`rustls::ServerConfig`] backed by a live [`IdentitySource`].
///
/// The resulting configuration:
///
/// * presents the source's current identity on every new handshake
/// * requires a client certificate and verifies it against the current bundle for the
///   client's trust domain
/// * authorizes the client subject id with the configured [`Authorizer`]
///
/// Rotations take effect on the next handshake; the configuration never needs rebuilding.
/// Session resumption is disabled so that every connection runs the full handshake.
pub struct ServerConfigBuilder {
    source: IdentitySource,
    authorizer: Option<Arc<dyn Authorizer>>,
    alpn_protocols: Vec<Vec<u8>>,
    config_customizer: Option<ServerConfigCustomizer>,
}

impl std::fmt::Debug for ServerConfigBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfigBuilder")
            .field("source", &self.source)
            .field("authorizer", &self.authorizer.is_some())
            .field("alpn_protocols", &self.alpn_protocols)
            .field("config_customizer", &self.config_customizer.is_some())
            .finish()
    }
}

impl ServerConfigBuilder {
    /// Creates a builder. An authorizer must be set before [`ServerConfigBuilder::build`].
    pub fn new(source: IdentitySource) -> Self {
        Self {
            source,
            authorizer: None,
            alpn_protocols: Vec::new(),
            config_customizer: None,
        }
    }

    /// Sets the authorizer applied to verified client subject ids.
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
    /// Do not replace the verifier or the certificate resolver.
    #[must_use]
    pub fn with_config_customizer<F>(mut self, customizer: F) -> Self
    where
        F: FnOnce(&mut ServerConfig) + Send + 'static,
    {
        self.config_customizer = Some(Box::new(customizer));
        self
    }

    /// Builds the `rustls::ServerConfig`.
    ///
    /// # Errors
    ///
    /// * [`Error::MissingAuthorizer`] if no authorizer was set
    /// * [`Error::Source`] if the source is already closed
    /// * [`Error::MissingCryptoProvider`] if no rustls provider can be installed
    pub fn build(self) -> Result<ServerConfig> {
        let authorizer = self.authorizer.ok_or(Error::MissingAuthorizer)?;
        let provider = crate::crypto::default_provider()?;
        self.source.snapshot()?;

        let material = Arc::new(IdentityMaterial::new(
            self.source.clone(),
            Arc::clone(&provider),
        ));
        let resolver = Arc::new(IdentityServerResolver { material });
        let verifier = Arc::new(ClientIdentityVerifier::new(
            self.source,
            authorizer,
            provider,
        ));

        let mut cfg = ServerConfig::builder()
            .with_client_cert_verifier(verifier)
            .with_cert_resolver(resolver);

        // A resumed session skips the resolver and the client verifier.
        cfg.session_storage = Arc::new(NoServerSessionStorage {});
        cfg.send_tls13_tickets = 0;
        cfg.alpn_protocols = self.alpn_protocols;

        if let Some(customizer) = self.config_customizer {
            customizer(&mut cfg);
        }

        Ok(cfg)
    }
}

#[derive(Debug)]
struct IdentityServerResolver {
    material: Arc<IdentityMaterial>,
}

impl ResolvesServerCert for IdentityServerResolver {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        match self.material.certified_key() {
            Ok(key) => Some(key),
            Err(e) => {
                warn!("not presenting a server certificate: {e}");
                None
            }
        }
    }
}
