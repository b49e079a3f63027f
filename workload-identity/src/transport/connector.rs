//! Builds a `tonic` channel from a parsed [`Endpoint`].

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use hyper_util::rt::TokioIo;
#[cfg(unix)]
use tokio::net::UnixStream;
use tonic::transport::{Channel, Endpoint as TonicEndpoint, Uri};
use tower::service_fn;

use crate::transport::endpoint::Endpoint;
use crate::transport::TransportError;

// tonic requires a syntactically valid URI even when a custom connector ignores it.
const PLACEHOLDER_URI: &str = "http://[::]:50051";

/// Connects to the identity provider and returns a gRPC channel.
pub async fn connect(endpoint: &Endpoint) -> Result<Channel, TransportError> {
    match endpoint {
        Endpoint::Unix(path) => connect_unix(path).await,
        Endpoint::Tcp { host, port } => connect_tcp(*host, *port).await,
    }
}

async fn connect_tcp(host: IpAddr, port: u16) -> Result<Channel, TransportError> {
    let uri = match host {
        IpAddr::V4(v4) => format!("http://{v4}:{port}"),
        IpAddr::V6(v6) => format!("http://[{v6}]:{port}"),
    };
    Ok(TonicEndpoint::try_from(uri)?.connect().await?)
}

#[cfg(unix)]
async fn connect_unix(path: &Path) -> Result<Channel, TransportError> {
    let path: Arc<PathBuf> = Arc::new(path.to_path_buf());

    let channel = TonicEndpoint::try_from(PLACEHOLDER_URI)?
        .connect_with_connector(service_fn(move |_: Uri| {
            let path = Arc::clone(&path);
            async move {
                let stream = UnixStream::connect(path.as_path()).await?;
                Ok::<_, std::io::Error>(TokioIo::new(stream))
            }
        }))
        .await?;

    Ok(channel)
}

#[cfg(not(unix))]
async fn connect_unix(_path: &Path) -> Result<Channel, TransportError> {
    Err(TransportError::UnsupportedEndpointTransport { scheme: "unix" })
}
