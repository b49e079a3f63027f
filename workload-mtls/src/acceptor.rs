use std::sync::Arc;

use rustls::ServerConfig;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor as TokioTlsAcceptor;

use crate::error::HandshakeError;
use crate::identity::{peer_identity, PeerIdentity};

/// Accepts TLS connections and returns the verified client identity.
///
/// A rejected handshake only fails that connection; the acceptor and the listener feeding
/// it keep working.
///
/// ```no_run
/// # use std::sync::Arc;
/// # use tokio::net::TcpListener;
/// # use workload_identity::IdentitySource;
/// # use workload_mtls::{mtls_server, AuthorizationPolicy, TlsAcceptor};
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let source = IdentitySource::open("unix:///tmp/agent.sock").await?;
/// let policy = AuthorizationPolicy::from_subject_ids(["spiffe://example.org/client"])?;
/// let acceptor = TlsAcceptor::new(Arc::new(mtls_server(source).authorize(policy).build()?));
/// let listener = TcpListener::bind("127.0.0.1:8443").await?;
///
/// loop {
///     let (tcp, _) = listener.accept().await?;
///     let acceptor = acceptor.clone();
///     tokio::spawn(async move {
///         match acceptor.accept(tcp).await {
///             Ok((_tls, peer)) => println!("connected: {}", peer.subject_id()),
///             Err(e) => eprintln!("handshake failed: {e}"),
///         }
///     });
/// }
/// # }
/// ```
#[derive(Clone)]
pub struct TlsAcceptor {
    inner: TokioTlsAcceptor,
}

impl std::fmt::Debug for TlsAcceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsAcceptor").finish_non_exhaustive()
    }
}

impl TlsAcceptor {
    /// Creates an acceptor from a server config.
    pub fn new(config: Arc<ServerConfig>) -> Self {
        Self::from(config)
    }

    /// Runs the server handshake over `stream`.
    ///
    /// # Errors
    ///
    /// * [`HandshakeError::Rejected`] if the handshake fails for any TLS reason, including
    ///   an unauthorized client or a client that sent no certificate
    /// * [`HandshakeError::Io`] for transport errors
    pub async fn accept<IO>(
        &self,
        stream: IO,
    ) -> Result<(TlsStream<IO>, PeerIdentity), HandshakeError>
    where
        IO: AsyncRead + AsyncWrite + Unpin,
    {
        let tls_stream = self.inner.accept(stream).await?;

        let (_io, connection) = tls_stream.get_ref();
        let peer = peer_identity(connection.peer_certificates())?;

        Ok((tls_stream, peer))
    }
}

impl From<Arc<ServerConfig>> for TlsAcceptor {
    fn from(config: Arc<ServerConfig>) -> Self {
        Self {
            inner: TokioTlsAcceptor::from(config),
        }
    }
}
