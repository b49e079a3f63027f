use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::Value;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;
use workload_identity::test_support::{
    CertificateAuthority, FakeUpdate, FakeWorkloadApi, IdentityParams,
};
use workload_identity::{IdentitySource, StatusDocument};
use workload_mtls::AuthorizationPolicy;
use workload_mtls_demo::{client, server};

const BACKEND_ID: &str = "spiffe://example.org/backend";
const CLIENT_ID: &str = "spiffe://example.org/client";

struct Workload {
    source: IdentitySource,
    _api: FakeWorkloadApi,
}

async fn workload(ca: &CertificateAuthority, subject_id: &str) -> Workload {
    let issued =
        ca.issue(&IdentityParams::new(subject_id).lifetime(time::Duration::minutes(10)));
    let api = FakeWorkloadApi::start().await;
    api.push(FakeUpdate::new().identity(&issued, ca));
    let source = IdentitySource::open(api.endpoint()).await.unwrap();
    Workload { source, _api: api }
}

struct Backend {
    addr: SocketAddr,
    shutdown: CancellationToken,
    _workload: Workload,
}

impl Drop for Backend {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn start_backend(ca: &CertificateAuthority) -> Backend {
    let workload = workload(ca, BACKEND_ID).await;
    let policy = AuthorizationPolicy::from_subject_ids([CLIENT_ID]).unwrap();

    let state =
        server::BackendState::new(workload.source.clone(), "backend-1", "test", &policy).unwrap();
    let acceptor = server::tls_acceptor(workload.source.clone(), policy).unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let shutdown = CancellationToken::new();
    tokio::spawn(server::serve(
        listener,
        acceptor,
        server::router(Arc::new(state)),
        shutdown.clone(),
    ));

    Backend {
        addr,
        shutdown,
        _workload: workload,
    }
}

fn web(workload: &Workload, backend: &Backend) -> (Router, reqwest::Client) {
    let http = client::backend_client(workload.source.clone(), BACKEND_ID).unwrap();
    let state = client::WebState::new(
        workload.source.clone(),
        http.clone(),
        &format!("https://{}/", backend.addr),
    );
    (client::router(Arc::new(state)), http)
}

async fn get_json(app: &Router, uri: &str) -> (StatusCode, Value) {
    let response = app
        .clone()
        .oneshot(Request::get(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, serde_json::from_slice(&body).unwrap())
}

fn seconds(expires_in: &str) -> u64 {
    let mut total = 0;
    let mut digits = String::new();
    for c in expires_in.chars() {
        if c.is_ascii_digit() {
            digits.push(c);
            continue;
        }
        let n: u64 = digits.parse().unwrap();
        digits.clear();
        total += match c {
            'h' => n * 3600,
            'm' => n * 60,
            's' => n,
            other => panic!("unexpected unit {other:?} in {expires_in}"),
        };
    }
    total
}

#[tokio::test]
async fn approved_client_reaches_backend_over_mtls() {
    let ca = CertificateAuthority::new("example.org");
    let backend = start_backend(&ca).await;
    let web_workload = workload(&ca, CLIENT_ID).await;
    let (app, http) = web(&web_workload, &backend);

    let (status, body) = get_json(&app, "/backend").await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["backend1"]["svid"], BACKEND_ID);
    assert_eq!(body["backend1"]["acceptedSvids"], CLIENT_ID);
    assert_eq!(body["note"], client::BACKEND_NOTE);

    let (status, body) = get_json(&app, "/backend2").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["backend1"]["name"], "backend-1");

    let whoami = format!("https://{}/whoami", backend.addr);
    let first: StatusDocument = http.get(&whoami).send().await.unwrap().json().await.unwrap();
    tokio::time::sleep(Duration::from_millis(1100)).await;
    let second: StatusDocument = http.get(&whoami).send().await.unwrap().json().await.unwrap();

    assert_eq!(first.spiffe_id, BACKEND_ID);
    assert_eq!(second.spiffe_id, BACKEND_ID);
    assert_eq!(first.note, server::WHOAMI_NOTE);
    assert!(seconds(&second.expires_in) < seconds(&first.expires_in));
    assert!(seconds(&first.expires_in) <= 600);
}

#[tokio::test]
async fn status_includes_backend_identity() {
    let ca = CertificateAuthority::new("example.org");
    let backend = start_backend(&ca).await;
    let web_workload = workload(&ca, CLIENT_ID).await;
    let (app, _http) = web(&web_workload, &backend);

    let (status, body) = get_json(&app, "/status").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["no_api_keys"], true);

    let certs = &body["certificate_status"];
    assert_eq!(certs["web_spiffe_id"], CLIENT_ID);
    assert!(seconds(certs["web_expires_in"].as_str().unwrap()) > 0);
    assert_eq!(certs["backend_status"]["spiffe_id"], BACKEND_ID);
}

#[tokio::test]
async fn unapproved_client_is_refused_and_backend_keeps_serving() {
    let ca = CertificateAuthority::new("example.org");
    let backend = start_backend(&ca).await;

    let intruder = workload(&ca, "spiffe://example.org/intruder").await;
    let (intruder_app, _http) = web(&intruder, &backend);

    let (status, body) = get_json(&intruder_app, "/backend").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert!(body["error"].is_string());

    let (status, body) = get_json(&intruder_app, "/status").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body["certificate_status"]["web_spiffe_id"],
        "spiffe://example.org/intruder"
    );
    assert!(body["certificate_status"]["backend_status"].is_null());

    let approved = workload(&ca, CLIENT_ID).await;
    let (app, _http) = web(&approved, &backend);
    let (status, _) = get_json(&app, "/backend").await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn client_refuses_unexpected_backend() {
    let ca = CertificateAuthority::new("example.org");
    let backend = start_backend(&ca).await;
    let web_workload = workload(&ca, CLIENT_ID).await;

    let http =
        client::backend_client(web_workload.source.clone(), "spiffe://example.org/other").unwrap();
    let state = client::WebState::new(
        web_workload.source.clone(),
        http,
        &format!("https://{}", backend.addr),
    );
    let app = client::router(Arc::new(state));

    let (status, _) = get_json(&app, "/backend1").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn stopped_backend_degrades_status() {
    let ca = CertificateAuthority::new("example.org");
    let backend = start_backend(&ca).await;
    let web_workload = workload(&ca, CLIENT_ID).await;
    let (app, _http) = web(&web_workload, &backend);

    backend.shutdown.cancel();
    // Let the accept loop observe the cancellation and drop the listener.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let (status, body) = get_json(&app, "/status").await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["certificate_status"]["backend_status"].is_null());

    let (status, _) = get_json(&app, "/backend").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
}
