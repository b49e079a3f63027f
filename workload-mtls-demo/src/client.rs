//! Web front role: a plain HTTP service that calls the backend over mTLS.
//!
//! The HTTP client presents this workload's identity and only talks to a backend whose
//! subject id matches the configured one. `/status` still answers when the backend is
//! down, with `backend_status: null`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use workload_identity::{AggregateStatus, IdentitySource, StatusDocument, StatusReporter};
use workload_mtls::{mtls_client, AuthorizationPolicy};

use crate::cli::ClientArgs;
use crate::identity::open_source;

/// Remark attached to `/backend` responses.
pub const BACKEND_NOTE: &str = "Authentication via mTLS client certificate, not API key";

const AUTHENTICATION_METHOD: &str = "Direct mTLS via workload identity";
const AUTO_ROTATION: &str = "managed by the workload API agent";
const STATUS_NOTE: &str = "No TLS sidecar needed - direct SPIFFE-to-SPIFFE mTLS";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Builds an HTTP client that authenticates with `source` and only accepts a server
/// presenting `backend_id`.
pub fn backend_client(source: IdentitySource, backend_id: &str) -> Result<reqwest::Client> {
    let policy = AuthorizationPolicy::from_subject_ids([backend_id])
        .with_context(|| format!("invalid backend id {backend_id:?}"))?;

    let tls = mtls_client(source)
        .authorize(policy)
        .with_alpn_protocols([b"http/1.1"])
        .build()
        .context("unable to build the mTLS client configuration")?;

    reqwest::Client::builder()
        .use_preconfigured_tls(tls)
        .timeout(REQUEST_TIMEOUT)
        .build()
        .context("failed to build HTTP client")
}

/// State shared by the web front handlers.
#[derive(Debug, Clone)]
pub struct WebState {
    reporter: StatusReporter,
    http: reqwest::Client,
    backend_url: String,
}

impl WebState {
    pub fn new(source: IdentitySource, http: reqwest::Client, backend_url: &str) -> Self {
        Self {
            reporter: StatusReporter::new(source),
            http,
            backend_url: backend_url.trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.backend_url)
    }

    async fn fetch_whoami(&self) -> reqwest::Result<StatusDocument> {
        self.http
            .get(self.url("/whoami"))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
    }
}

/// Web front routes: `/status` and `/backend` (also served as `/backend1` and `/backend2`).
pub fn router(state: Arc<WebState>) -> Router {
    Router::new()
        .route("/status", get(status_handler))
        .route("/backend", get(backend_handler))
        .route("/backend1", get(backend_handler))
        .route("/backend2", get(backend_handler))
        .with_state(state)
}

fn error_body(status: StatusCode, message: String) -> (StatusCode, Json<Value>) {
    (status, Json(json!({ "error": message })))
}

async fn backend_handler(State(state): State<Arc<WebState>>) -> (StatusCode, Json<Value>) {
    let response = match state
        .http
        .get(state.url("/"))
        .send()
        .await
        .and_then(reqwest::Response::error_for_status)
    {
        Ok(response) => response,
        Err(e) => {
            let e = anyhow::Error::new(e);
            warn!(error = %format!("{e:#}"), "Backend request failed");
            return error_body(
                StatusCode::SERVICE_UNAVAILABLE,
                format!("backend unavailable: {e}"),
            );
        }
    };

    match response.json::<Value>().await {
        Ok(body) => (
            StatusCode::OK,
            Json(json!({ "backend1": body, "note": BACKEND_NOTE })),
        ),
        Err(e) => {
            warn!(error = %e, "Backend returned an unreadable body");
            error_body(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("invalid backend response: {e}"),
            )
        }
    }
}

async fn status_handler(
    State(state): State<Arc<WebState>>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let local = state
        .reporter
        .status()
        .map_err(|e| error_body(StatusCode::SERVICE_UNAVAILABLE, e.to_string()))?;

    let status = AggregateStatus::collect(local, state.fetch_whoami()).await;

    Ok(Json(json!({
        "authentication_method": AUTHENTICATION_METHOD,
        "no_api_keys": true,
        "certificate_status": {
            "web_spiffe_id": status.local.subject_id.to_string(),
            "web_expires_in": status.local.expires_in_display(),
            "backend_status": status.remote,
            "auto_rotation": AUTO_ROTATION,
        },
        "note": STATUS_NOTE,
    })))
}

/// Runs the web front role until `shutdown` fires.
pub async fn run(
    args: &ClientArgs,
    initial_fetch_timeout: Duration,
    shutdown: CancellationToken,
) -> Result<()> {
    info!(
        backend_url = %args.backend_url,
        backend_id = %args.backend_id,
        port = args.port,
        "Web front configuration"
    );

    let source = open_source(args.workload_socket(), initial_fetch_timeout).await?;
    let http = backend_client(source.clone(), &args.backend_id)?;
    let state = WebState::new(source.clone(), http, &args.backend_url);

    let addr = SocketAddr::from(([0, 0, 0, 0], args.port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, "Web front listening");

    axum::serve(listener, router(Arc::new(state)))
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
        .context("web front server failed")?;

    source
        .close_configured()
        .await
        .context("workload identity source did not shut down cleanly")?;
    info!("Web front stopped");
    Ok(())
}
