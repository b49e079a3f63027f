use std::net::SocketAddr;
use std::sync::Arc;

use rustls::pki_types::ServerName;
use rustls::ClientConfig;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector as TokioTlsConnector;

use crate::error::HandshakeError;
use crate::identity::{peer_identity, PeerIdentity};

/// Connects over TLS and returns the verified server identity.
#[derive(Clone)]
pub struct TlsConnector {
    inner: TokioTlsConnector,
}

impl std::fmt::Debug for TlsConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsConnector").finish_non_exhaustive()
    }
}

impl TlsConnector {
    /// Creates a connector from a client config.
    pub fn new(config: Arc<ClientConfig>) -> Self {
        Self::from(config)
    }

    /// Runs the client handshake over `stream`.
    ///
    /// `server_name` is sent as SNI only; the server is authenticated by subject id.
    ///
    /// With TLS 1.3 the server verifies the client certificate after the client considers
    /// the handshake finished, so a refusal by the server can surface on the first read
    /// instead of here.
    ///
    /// # Errors
    ///
    /// * [`HandshakeError::Rejected`] if the handshake fails for any TLS reason
    /// * [`HandshakeError::Io`] for transport errors
    pub async fn connect<IO>(
        &self,
        server_name: ServerName<'static>,
        stream: IO,
    ) -> Result<(TlsStream<IO>, PeerIdentity), HandshakeError>
    where
        IO: AsyncRead + AsyncWrite + Unpin,
    {
        let tls_stream = self.inner.connect(server_name, stream).await?;

        let (_io, connection) = tls_stream.get_ref();
        let peer = peer_identity(connection.peer_certificates())?;

        Ok((tls_stream, peer))
    }

    /// Opens a TCP connection to `addr`, then runs [`TlsConnector::connect`].
    ///
    /// # Errors
    ///
    /// As [`TlsConnector::connect`]; a failed TCP connect is [`HandshakeError::Io`].
    pub async fn connect_addr(
        &self,
        addr: SocketAddr,
        server_name: ServerName<'static>,
    ) -> Result<(TlsStream<TcpStream>, PeerIdentity), HandshakeError> {
        let stream = TcpStream::connect(addr).await.map_err(HandshakeError::Io)?;
        self.connect(server_name, stream).await
    }
}

impl From<Arc<ClientConfig>> for TlsConnector {
    fn from(config: Arc<ClientConfig>) -> Self {
        Self {
            inner: TokioTlsConnector::from(config),
        }
    }
}
