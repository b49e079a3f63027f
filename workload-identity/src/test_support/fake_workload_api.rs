use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures::{Stream, StreamExt as _};
use tempfile::TempDir;
use tokio::net::UnixListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{UnixListenerStream, WatchStream};
use tokio_util::sync::CancellationToken;
use tonic::{Code, Request, Response, Status};

use super::{CertificateAuthority, IssuedIdentity};
use crate::workload_api::client::has_workload_header;
use crate::workload_api::pb::spiffe_workload_api_server::{
    SpiffeWorkloadApi, SpiffeWorkloadApiServer,
};
use crate::workload_api::pb::{
    X509BundlesRequest, X509BundlesResponse, X509svid, X509svidRequest, X509svidResponse,
};

/// One message the fake pushes to every open stream.
#[derive(Debug, Clone, Default)]
pub struct FakeUpdate {
    svids: Vec<X509svid>,
    federated: HashMap<String, Vec<u8>>,
}

impl FakeUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an identity with `ca`'s root as its bundle.
    #[must_use]
    pub fn identity(self, issued: &IssuedIdentity, ca: &CertificateAuthority) -> Self {
        self.hinted_identity(issued, ca, "")
    }

    #[must_use]
    pub fn hinted_identity(
        mut self,
        issued: &IssuedIdentity,
        ca: &CertificateAuthority,
        hint: &str,
    ) -> Self {
        self.svids.push(X509svid {
            spiffe_id: issued.subject_id.clone(),
            x509_svid: issued.chain_der(),
            x509_svid_key: issued.key_der.clone(),
            bundle: ca.cert_der().to_vec(),
            hint: hint.to_string(),
        });
        self
    }

    /// Adds a federated bundle.
    #[must_use]
    pub fn federated(mut self, ca: &CertificateAuthority) -> Self {
        self.federated
            .insert(ca.trust_domain().id_string(), ca.cert_der().to_vec());
        self
    }

    fn into_response(self) -> X509svidResponse {
        X509svidResponse {
            svids: self.svids,
            crl: Vec::new(),
            federated_bundles: self.federated,
        }
    }
}

#[derive(Debug, Clone)]
enum Reply {
    NoIdentityIssued,
    Response(X509svidResponse),
    Error(Code, String),
}

#[derive(Debug, Clone)]
struct State {
    // Open streams end when the epoch moves on.
    epoch: u64,
    reply: Reply,
}

/// An in-process Workload API served over a unix socket in a temporary directory.
///
/// It starts in the "no identity issued" state. Every [`FakeWorkloadApi::push`] is sent
/// to all open streams and becomes the first message of streams opened later.
#[derive(Debug)]
pub struct FakeWorkloadApi {
    state: watch::Sender<State>,
    calls: Arc<AtomicUsize>,
    socket_path: PathBuf,
    shutdown: CancellationToken,
    server: Option<JoinHandle<()>>,
    _dir: TempDir,
}

impl FakeWorkloadApi {
    pub async fn start() -> Self {
        let dir = tempfile::tempdir().expect("create temp dir");
        let socket_path = dir.path().join("workload.sock");
        let listener = UnixListener::bind(&socket_path).expect("bind unix socket");

        let (state, rx) = watch::channel(State {
            epoch: 0,
            reply: Reply::NoIdentityIssued,
        });
        let calls = Arc::new(AtomicUsize::new(0));
        let service = FakeService {
            state: rx,
            calls: Arc::clone(&calls),
        };

        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        let server = tokio::spawn(async move {
            let _ = tonic::transport::Server::builder()
                .add_service(SpiffeWorkloadApiServer::new(service))
                .serve_with_incoming_shutdown(
                    UnixListenerStream::new(listener),
                    token.cancelled_owned(),
                )
                .await;
        });

        Self {
            state,
            calls,
            socket_path,
            shutdown,
            server: Some(server),
            _dir: dir,
        }
    }

    /// Endpoint string for clients, `unix://<socket path>`.
    pub fn endpoint(&self) -> String {
        format!("unix://{}", self.socket_path.display())
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Number of `FetchX509SVID` calls received so far.
    pub fn fetch_calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn push(&self, update: FakeUpdate) {
        self.set_reply(Reply::Response(update.into_response()));
    }

    /// Sends a message whose certificate bytes cannot be parsed.
    pub fn push_malformed(&self, subject_id: &str) {
        self.set_reply(Reply::Response(X509svidResponse {
            svids: vec![X509svid {
                spiffe_id: subject_id.to_string(),
                x509_svid: b"not a certificate".to_vec(),
                x509_svid_key: b"not a key".to_vec(),
                bundle: Vec::new(),
                hint: String::new(),
            }],
            crl: Vec::new(),
            federated_bundles: HashMap::new(),
        }));
    }

    /// New calls fail with "no identity issued".
    pub fn set_no_identity(&self) {
        self.set_reply(Reply::NoIdentityIssued);
    }

    /// Open streams receive `code`; new calls fail with it.
    pub fn fail_with(&self, code: Code, message: &str) {
        self.set_reply(Reply::Error(code, message.to_string()));
    }

    /// Ends every open stream without changing the current reply.
    pub fn disconnect(&self) {
        self.state.send_modify(|state| state.epoch += 1);
    }

    /// Stops serving and waits for the server task.
    pub async fn stop(mut self) {
        self.shutdown.cancel();
        if let Some(server) = self.server.take() {
            let _ = server.await;
        }
    }

    fn set_reply(&self, reply: Reply) {
        self.state.send_modify(|state| state.reply = reply);
    }
}

impl Drop for FakeWorkloadApi {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

struct FakeService {
    state: watch::Receiver<State>,
    calls: Arc<AtomicUsize>,
}

type ResponseStream<T> = Pin<Box<dyn Stream<Item = Result<T, Status>> + Send>>;

impl FakeService {
    fn check_header<T>(request: &Request<T>) -> Result<(), Status> {
        if has_workload_header(request.metadata()) {
            Ok(())
        } else {
            Err(Status::invalid_argument("security header missing from request"))
        }
    }

    fn reply_stream(&self) -> Result<ResponseStream<X509svidResponse>, Status> {
        let current = self.state.borrow().clone();
        match current.reply {
            Reply::NoIdentityIssued => return Err(no_identity_issued()),
            Reply::Error(code, message) => return Err(Status::new(code, message)),
            Reply::Response(_) => {}
        }

        let epoch = current.epoch;
        let stream = WatchStream::new(self.state.clone())
            .take_while(move |state| futures::future::ready(state.epoch == epoch))
            .map(|state| match state.reply {
                Reply::Response(response) => Ok(response),
                Reply::NoIdentityIssued => Err(no_identity_issued()),
                Reply::Error(code, message) => Err(Status::new(code, message)),
            });
        let stream: ResponseStream<X509svidResponse> = Box::pin(stream);
        Ok(stream)
    }
}

fn no_identity_issued() -> Status {
    Status::permission_denied("no identity issued")
}

#[tonic::async_trait]
impl SpiffeWorkloadApi for FakeService {
    type FetchX509SVIDStream = ResponseStream<X509svidResponse>;
    type FetchX509BundlesStream = ResponseStream<X509BundlesResponse>;

    async fn fetch_x509svid(
        &self,
        request: Request<X509svidRequest>,
    ) -> Result<Response<Self::FetchX509SVIDStream>, Status> {
        Self::check_header(&request)?;
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(Response::new(self.reply_stream()?))
    }

    async fn fetch_x509_bundles(
        &self,
        request: Request<X509BundlesRequest>,
    ) -> Result<Response<Self::FetchX509BundlesStream>, Status> {
        Self::check_header(&request)?;
        let stream = self.reply_stream()?.map(|item| {
            item.map(|response| {
                let mut bundles = response.federated_bundles;
                for svid in response.svids {
                    if let Ok(id) = crate::SubjectId::new(&svid.spiffe_id) {
                        bundles.insert(id.trust_domain().id_string(), svid.bundle);
                    }
                }
                X509BundlesResponse {
                    crl: Vec::new(),
                    bundles,
                }
            })
        });
        let stream: Self::FetchX509BundlesStream = Box::pin(stream);
        Ok(Response::new(stream))
    }
}
