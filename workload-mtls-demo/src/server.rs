//! Backend role: an mTLS listener that only admits approved client identities.
//!
//! Every connection goes through a full mutual handshake before any HTTP is read. A
//! rejected handshake is logged and dropped; the accept loop keeps running.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::server::conn::auto;
use hyper_util::service::TowerToHyperService;
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use workload_identity::{IdentitySource, SourceError, StatusDocument, StatusReporter};
use workload_mtls::{mtls_server, AuthorizationPolicy, TlsAcceptor};

use crate::cli::ServerArgs;
use crate::identity::open_source;

/// Remark attached to `/whoami` responses.
pub const WHOAMI_NOTE: &str = "Authentication via mTLS certificate, not API key";

const HEADER_READ_TIMEOUT: Duration = Duration::from_secs(10);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// State shared by the backend handlers.
#[derive(Debug, Clone)]
pub struct BackendState {
    reporter: StatusReporter,
    svid: String,
    name: String,
    infra: String,
    accepted: String,
}

impl BackendState {
    /// Captures the subject id at startup; `/whoami` reads the live identity instead.
    pub fn new(
        source: IdentitySource,
        name: impl Into<String>,
        infra: impl Into<String>,
        policy: &AuthorizationPolicy,
    ) -> Result<Self, SourceError> {
        let svid = source.current()?.subject_id().to_string();
        Ok(Self {
            reporter: StatusReporter::new(source),
            svid,
            name: name.into(),
            infra: infra.into(),
            accepted: policy.to_string(),
        })
    }
}

/// Backend routes: `/` and `/whoami`.
pub fn router(state: Arc<BackendState>) -> Router {
    Router::new()
        .route("/", get(info_handler))
        .route("/whoami", get(whoami_handler))
        .with_state(state)
}

async fn info_handler(State(state): State<Arc<BackendState>>) -> Json<Value> {
    Json(json!({
        "svid": state.svid,
        "name": state.name,
        "infra": state.infra,
        "acceptedSvids": state.accepted,
    }))
}

async fn whoami_handler(
    State(state): State<Arc<BackendState>>,
) -> Result<Json<StatusDocument>, (StatusCode, Json<Value>)> {
    match state.reporter.status() {
        Ok(status) => Ok(Json(status.to_document(WHOAMI_NOTE))),
        Err(e) => Err((
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "error": e.to_string() })),
        )),
    }
}

/// Builds the acceptor: clients must present an identity accepted by `policy`.
pub fn tls_acceptor(
    source: IdentitySource,
    policy: AuthorizationPolicy,
) -> workload_mtls::Result<TlsAcceptor> {
    let config = mtls_server(source)
        .authorize(policy)
        .with_alpn_protocols([&b"h2"[..], &b"http/1.1"[..]])
        .build()?;
    Ok(TlsAcceptor::new(Arc::new(config)))
}

/// Accepts connections until `shutdown` fires. Each connection is handled on its own task.
pub async fn serve(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    app: Router,
    shutdown: CancellationToken,
) {
    let shutdown = shutdown.cancelled_owned();
    tokio::pin!(shutdown);

    loop {
        let (tcp, remote) = tokio::select! {
            () = &mut shutdown => break,
            accepted = listener.accept() => match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    error!(error = %e, "Failed to accept TCP connection");
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    continue;
                }
            },
        };

        let acceptor = acceptor.clone();
        let app = app.clone();
        tokio::spawn(serve_connection(tcp, remote, acceptor, app));
    }

    debug!("Accept loop stopped");
}

async fn serve_connection(tcp: TcpStream, remote: SocketAddr, acceptor: TlsAcceptor, app: Router) {
    let (tls, peer) = match tokio::time::timeout(HANDSHAKE_TIMEOUT, acceptor.accept(tcp)).await {
        Ok(Ok(accepted)) => accepted,
        Ok(Err(e)) => {
            warn!(%remote, kind = ?e.kind(), error = %e, "Rejected mTLS handshake");
            return;
        }
        Err(_) => {
            warn!(%remote, "mTLS handshake timed out");
            return;
        }
    };
    debug!(%remote, peer = %peer.subject_id(), "Accepted mTLS connection");

    let mut builder = auto::Builder::new(TokioExecutor::new());
    builder
        .http1()
        .timer(TokioTimer::new())
        .header_read_timeout(HEADER_READ_TIMEOUT);

    if let Err(e) = builder
        .serve_connection(TokioIo::new(tls), TowerToHyperService::new(app))
        .await
    {
        debug!(%remote, error = %e, "Connection ended with error");
    }
}

/// Runs the backend role until `shutdown` fires.
pub async fn run(
    args: &ServerArgs,
    initial_fetch_timeout: Duration,
    shutdown: CancellationToken,
) -> Result<()> {
    let policy = AuthorizationPolicy::from_subject_ids(&args.approved_client_ids)
        .context("invalid approved client ids")?;
    let source = open_source(args.workload_socket(), initial_fetch_timeout).await?;

    let state = BackendState::new(source.clone(), &args.name, &args.infra, &policy)?;
    let acceptor = tls_acceptor(source.clone(), policy.clone())
        .context("unable to build the mTLS server configuration")?;

    let addr = SocketAddr::from(([0, 0, 0, 0], args.port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, accepted = %policy, "Backend listening with mTLS");

    serve(listener, acceptor, router(Arc::new(state)), shutdown).await;

    source
        .close_configured()
        .await
        .context("workload identity source did not shut down cleanly")?;
    info!("Backend stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;
    use workload_identity::test_support::{
        CertificateAuthority, FakeUpdate, FakeWorkloadApi, IdentityParams,
    };

    async fn backend() -> (Router, FakeWorkloadApi, IdentitySource) {
        let ca = CertificateAuthority::new("example.org");
        let issued = ca.issue(
            &IdentityParams::new("spiffe://example.org/backend")
                .lifetime(time::Duration::minutes(10)),
        );
        let api = FakeWorkloadApi::start().await;
        api.push(FakeUpdate::new().identity(&issued, &ca));
        let source = IdentitySource::open(api.endpoint()).await.unwrap();

        let policy =
            AuthorizationPolicy::from_subject_ids(["spiffe://example.org/web"]).unwrap();
        let state = BackendState::new(source.clone(), "backend-1", "k8s", &policy).unwrap();
        (router(Arc::new(state)), api, source)
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, Value) {
        let response = app
            .oneshot(Request::get(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn index_describes_the_backend() {
        let (app, _api, _source) = backend().await;

        let (status, body) = get_json(app, "/").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["svid"], "spiffe://example.org/backend");
        assert_eq!(body["name"], "backend-1");
        assert_eq!(body["infra"], "k8s");
        assert_eq!(body["acceptedSvids"], "spiffe://example.org/web");
    }

    #[tokio::test]
    async fn whoami_reports_live_identity() {
        let (app, _api, _source) = backend().await;

        let (status, body) = get_json(app, "/whoami").await;
        assert_eq!(status, StatusCode::OK);
        let doc: StatusDocument = serde_json::from_value(body).unwrap();
        assert_eq!(doc.spiffe_id, "spiffe://example.org/backend");
        assert_eq!(doc.note, WHOAMI_NOTE);
        assert!(doc.expires_in.ends_with('s'));
        assert!(doc.not_after.contains('T'));
    }

    #[tokio::test]
    async fn whoami_is_unavailable_after_close() {
        let (app, _api, source) = backend().await;
        source.close().await;

        let (status, body) = get_json(app, "/whoami").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(body["error"].is_string());
    }
}
