use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rustls::client::Resumption;
use rustls::pki_types::ServerName;
use rustls::server::ServerSessionMemoryCache;
use rustls::{ClientConfig, HandshakeKind, ServerConfig};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use workload_identity::test_support::{
    CertificateAuthority, FakeUpdate, FakeWorkloadApi, IdentityParams, IssuedIdentity,
};
use workload_identity::{ErrorKind, IdentitySource};
use workload_mtls::{
    mtls_client, mtls_server, AuthorizationPolicy, HandshakeError, PeerIdentity, TlsAcceptor,
    TlsConnector,
};

const BACKEND: &str = "spiffe://example.org/backend";
const CLIENT: &str = "spiffe://example.org/client";
const PARTNER_CLIENT: &str = "spiffe://partner.org/client";

struct Workload {
    api: FakeWorkloadApi,
    source: IdentitySource,
}

async fn workload(update: FakeUpdate) -> Workload {
    let api = FakeWorkloadApi::start().await;
    api.push(update);
    let source = IdentitySource::open(api.endpoint()).await.unwrap();
    Workload { api, source }
}

async fn issued_workload(ca: &CertificateAuthority, issued: &IssuedIdentity) -> Workload {
    workload(FakeUpdate::new().identity(issued, ca)).await
}

async fn valid_workload(ca: &CertificateAuthority, id: &str) -> Workload {
    issued_workload(ca, &ca.issue(&IdentityParams::new(id))).await
}

fn accepting(id: &str) -> AuthorizationPolicy {
    AuthorizationPolicy::from_subject_ids([id]).unwrap()
}

type Accepted = Result<PeerIdentity, HandshakeError>;

/// Accepts connections until the test ends, reporting each handshake outcome.
async fn serve(
    source: &IdentitySource,
    policy: AuthorizationPolicy,
) -> (SocketAddr, mpsc::UnboundedReceiver<Accepted>) {
    serve_config(mtls_server(source.clone()).authorize(policy).build().unwrap()).await
}

async fn serve_config(config: ServerConfig) -> (SocketAddr, mpsc::UnboundedReceiver<Accepted>) {
    let acceptor = TlsAcceptor::new(Arc::new(config));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        loop {
            let Ok((tcp, _)) = listener.accept().await else {
                return;
            };
            let acceptor = acceptor.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                match acceptor.accept(tcp).await {
                    Ok((mut tls, peer)) => {
                        let _ = tls.write_all(b"hello").await;
                        let _ = tls.shutdown().await;
                        let _ = tx.send(Ok(peer));
                    }
                    Err(e) => {
                        let _ = tx.send(Err(e));
                    }
                }
            });
        }
    });

    (addr, rx)
}

fn connector(source: &IdentitySource, policy: AuthorizationPolicy) -> TlsConnector {
    let config = mtls_client(source.clone()).authorize(policy).build().unwrap();
    TlsConnector::new(Arc::new(config))
}

/// Connects twice and returns the client-side handshake kinds.
async fn handshake_kinds(config: ClientConfig, addr: SocketAddr) -> Vec<Option<HandshakeKind>> {
    let connector = TlsConnector::new(Arc::new(config));
    let mut kinds = Vec::new();
    for _ in 0..2 {
        let tcp = TcpStream::connect(addr).await.unwrap();
        let (mut tls, _) = connector
            .connect(ServerName::try_from("backend").unwrap(), tcp)
            .await
            .unwrap();
        // Reading to the end also consumes any session tickets.
        let mut greeting = Vec::new();
        tls.read_to_end(&mut greeting).await.unwrap();
        kinds.push(tls.get_ref().1.handshake_kind());
    }
    kinds
}

/// Connects, reads the greeting and returns the server identity with the server leaf.
async fn exchange(
    connector: &TlsConnector,
    addr: SocketAddr,
) -> Result<(PeerIdentity, Vec<u8>), String> {
    let tcp = TcpStream::connect(addr).await.map_err(|e| e.to_string())?;
    let name = ServerName::try_from("backend").unwrap();
    let (mut tls, peer) = connector
        .connect(name, tcp)
        .await
        .map_err(|e| e.to_string())?;

    let leaf = tls.get_ref().1.peer_certificates().unwrap()[0].to_vec();
    let mut greeting = Vec::new();
    tls.read_to_end(&mut greeting)
        .await
        .map_err(|e| e.to_string())?;
    assert_eq!(greeting, b"hello");
    Ok((peer, leaf))
}

async fn next(rx: &mut mpsc::UnboundedReceiver<Accepted>) -> Accepted {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("server reported no handshake")
        .expect("server loop stopped")
}

#[tokio::test]
async fn authorized_peers_see_each_other() {
    let ca = CertificateAuthority::new("example.org");
    let backend = valid_workload(&ca, BACKEND).await;
    let client = valid_workload(&ca, CLIENT).await;

    let (addr, mut accepted) = serve(&backend.source, accepting(CLIENT)).await;
    let (server_peer, _) = exchange(&connector(&client.source, accepting(BACKEND)), addr)
        .await
        .unwrap();

    assert_eq!(server_peer.subject_id().to_string(), BACKEND);
    let client_peer = next(&mut accepted).await.unwrap();
    assert_eq!(client_peer.subject_id().to_string(), CLIENT);
}

#[tokio::test]
async fn unauthorized_client_is_rejected_and_listener_keeps_accepting() {
    let ca = CertificateAuthority::new("example.org");
    let backend = valid_workload(&ca, BACKEND).await;
    let intruder = valid_workload(&ca, "spiffe://example.org/intruder").await;
    let client = valid_workload(&ca, CLIENT).await;

    let (addr, mut accepted) = serve(&backend.source, accepting(CLIENT)).await;

    assert!(exchange(&connector(&intruder.source, accepting(BACKEND)), addr)
        .await
        .is_err());
    let err = next(&mut accepted).await.unwrap_err();
    assert!(matches!(err, HandshakeError::Rejected(_)), "{err:?}");
    assert_eq!(err.kind(), ErrorKind::Authorization);

    exchange(&connector(&client.source, accepting(BACKEND)), addr)
        .await
        .unwrap();
    let peer = next(&mut accepted).await.unwrap();
    assert_eq!(peer.subject_id().to_string(), CLIENT);
}

#[tokio::test]
async fn client_refuses_unexpected_server() {
    let ca = CertificateAuthority::new("example.org");
    let impostor = valid_workload(&ca, "spiffe://example.org/impostor").await;
    let client = valid_workload(&ca, CLIENT).await;

    let (addr, mut accepted) = serve(&impostor.source, accepting(CLIENT)).await;

    let tcp = TcpStream::connect(addr).await.unwrap();
    let err = connector(&client.source, accepting(BACKEND))
        .connect(ServerName::try_from("backend").unwrap(), tcp)
        .await
        .unwrap_err();
    assert!(matches!(err, HandshakeError::Rejected(_)), "{err:?}");
    assert_eq!(err.kind(), ErrorKind::Authorization);

    // The server learns of the refusal through the alert.
    assert!(next(&mut accepted).await.is_err());
}

#[tokio::test]
async fn client_without_a_certificate_is_rejected_like_an_unauthorized_one() {
    let ca = CertificateAuthority::new("example.org");
    let backend = valid_workload(&ca, BACKEND).await;

    // An expired local identity is never presented, so this client sends no certificate.
    let now = time::OffsetDateTime::now_utc();
    let expired = ca.issue(
        &IdentityParams::new(CLIENT)
            .validity(now - time::Duration::hours(2), now - time::Duration::hours(1)),
    );
    let client = issued_workload(&ca, &expired).await;

    let (addr, mut accepted) = serve(&backend.source, accepting(CLIENT)).await;
    assert!(exchange(&connector(&client.source, accepting(BACKEND)), addr)
        .await
        .is_err());

    let err = next(&mut accepted).await.unwrap_err();
    assert!(matches!(err, HandshakeError::Rejected(_)), "{err:?}");
    assert_eq!(err.kind(), ErrorKind::Authorization);
}

#[tokio::test]
async fn server_with_expired_identity_fails_the_handshake() {
    let ca = CertificateAuthority::new("example.org");
    let now = time::OffsetDateTime::now_utc();
    let expired = ca.issue(
        &IdentityParams::new(BACKEND)
            .validity(now - time::Duration::hours(2), now - time::Duration::hours(1)),
    );
    let backend = issued_workload(&ca, &expired).await;
    let client = valid_workload(&ca, CLIENT).await;

    let (addr, mut accepted) = serve(&backend.source, accepting(CLIENT)).await;
    assert!(exchange(&connector(&client.source, accepting(BACKEND)), addr)
        .await
        .is_err());
    assert!(next(&mut accepted).await.unwrap_err().is_rejected());
}

#[tokio::test]
async fn rotation_takes_effect_on_the_next_handshake() {
    let ca = CertificateAuthority::new("example.org");
    let first = ca.issue(&IdentityParams::new(BACKEND));
    let backend = issued_workload(&ca, &first).await;
    let client = valid_workload(&ca, CLIENT).await;

    let (addr, mut accepted) = serve(&backend.source, accepting(CLIENT)).await;
    let connector = connector(&client.source, accepting(BACKEND));

    let (_, leaf) = exchange(&connector, addr).await.unwrap();
    assert_eq!(leaf, first.leaf_der());
    next(&mut accepted).await.unwrap();

    let mut updates = backend.source.updated();
    let rotated = ca.issue(&IdentityParams::new(BACKEND).lifetime(time::Duration::hours(2)));
    backend.api.push(FakeUpdate::new().identity(&rotated, &ca));
    updates.changed().await.unwrap();

    let (_, leaf) = exchange(&connector, addr).await.unwrap();
    assert_eq!(leaf, rotated.leaf_der());
    next(&mut accepted).await.unwrap();
}

#[tokio::test]
async fn server_never_resumes_sessions() {
    let ca = CertificateAuthority::new("example.org");
    let backend = valid_workload(&ca, BACKEND).await;
    let client = valid_workload(&ca, CLIENT).await;

    let (addr, mut accepted) = serve(&backend.source, accepting(CLIENT)).await;

    // Even a client willing to resume gets a full handshake every time.
    let config = mtls_client(client.source.clone())
        .authorize(accepting(BACKEND))
        .with_config_customizer(|cfg| cfg.resumption = Resumption::in_memory_sessions(32))
        .build()
        .unwrap();
    let kinds = handshake_kinds(config, addr).await;
    assert_eq!(kinds, [Some(HandshakeKind::Full), Some(HandshakeKind::Full)]);

    for _ in 0..2 {
        let peer = next(&mut accepted).await.unwrap();
        assert_eq!(peer.subject_id().to_string(), CLIENT);
    }
}

#[tokio::test]
async fn client_never_resumes_sessions() {
    let ca = CertificateAuthority::new("example.org");
    let backend = valid_workload(&ca, BACKEND).await;
    let client = valid_workload(&ca, CLIENT).await;

    // A server that issues tickets and caches sessions.
    let server_config = mtls_server(backend.source.clone())
        .authorize(accepting(CLIENT))
        .with_config_customizer(|cfg| {
            cfg.session_storage = ServerSessionMemoryCache::new(32);
            cfg.send_tls13_tickets = 2;
        })
        .build()
        .unwrap();
    let (addr, mut accepted) = serve_config(server_config).await;

    let config = mtls_client(client.source.clone())
        .authorize(accepting(BACKEND))
        .build()
        .unwrap();
    let kinds = handshake_kinds(config, addr).await;
    assert_eq!(kinds, [Some(HandshakeKind::Full), Some(HandshakeKind::Full)]);

    for _ in 0..2 {
        next(&mut accepted).await.unwrap();
    }
}

#[tokio::test]
async fn federated_client_is_verified_with_its_own_bundle() {
    let local = CertificateAuthority::new("example.org");
    let partner = CertificateAuthority::new("partner.org");

    let backend = workload(
        FakeUpdate::new()
            .identity(&local.issue(&IdentityParams::new(BACKEND)), &local)
            .federated(&partner),
    )
    .await;
    let client = workload(
        FakeUpdate::new()
            .identity(&partner.issue(&IdentityParams::new(PARTNER_CLIENT)), &partner)
            .federated(&local),
    )
    .await;

    let (addr, mut accepted) = serve(&backend.source, accepting(PARTNER_CLIENT)).await;
    exchange(&connector(&client.source, accepting(BACKEND)), addr)
        .await
        .unwrap();
    let peer = next(&mut accepted).await.unwrap();
    assert_eq!(peer.subject_id().to_string(), PARTNER_CLIENT);
}

#[tokio::test]
async fn closed_source_cannot_build_configs() {
    let ca = CertificateAuthority::new("example.org");
    let backend = valid_workload(&ca, BACKEND).await;
    backend.source.close().await;

    let err = mtls_server(backend.source.clone())
        .authorize(accepting(CLIENT))
        .build()
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Closed);
}

#[tokio::test]
async fn build_requires_an_authorizer() {
    let ca = CertificateAuthority::new("example.org");
    let backend = valid_workload(&ca, BACKEND).await;

    let err = mtls_client(backend.source.clone()).build().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Configuration);
}
