//! Workload API client.
//!
//! A workload may be issued several identities; the provider can attach a hint to
//! each one. Hints carry no security meaning.

mod header;
mod x509;

#[cfg(any(test, feature = "test-support"))]
pub(crate) use header::has_workload_header;

use tonic::service::interceptor::InterceptedService;
use tonic::transport::Channel;

use crate::transport::{connect, Endpoint};
use crate::workload_api::client::header::MetadataAdder;
use crate::workload_api::error::WorkloadApiError;
use crate::workload_api::pb::spiffe_workload_api_client::SpiffeWorkloadApiClient;

/// Client for the SPIFFE Workload API.
///
/// Cheap to clone; clones share the underlying channel.
#[derive(Debug, Clone)]
pub struct WorkloadApiClient {
    endpoint: Endpoint,
    client: SpiffeWorkloadApiClient<InterceptedService<Channel, MetadataAdder>>,
}

impl WorkloadApiClient {
    /// Returns the endpoint this client is connected to.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Connects to `endpoint`.
    pub async fn connect(endpoint: Endpoint) -> Result<Self, WorkloadApiError> {
        let channel = connect(&endpoint).await?;
        Ok(Self::new_with_channel(endpoint, channel))
    }

    /// Parses `endpoint` and connects to it.
    ///
    /// Accepts `unix:///path`, `unix:/path`, `tcp://IP:port` or a bare socket path.
    pub async fn connect_to(endpoint: impl AsRef<str>) -> Result<Self, WorkloadApiError> {
        let endpoint = Endpoint::parse(endpoint.as_ref())?;
        Self::connect(endpoint).await
    }

    /// Wraps an existing channel. `endpoint` is informational.
    pub fn new_with_channel(endpoint: Endpoint, channel: Channel) -> Self {
        Self {
            endpoint,
            client: SpiffeWorkloadApiClient::with_interceptor(channel, MetadataAdder),
        }
    }

    async fn first_message<T>(mut stream: tonic::Streaming<T>) -> Result<T, WorkloadApiError> {
        stream
            .message()
            .await?
            .ok_or(WorkloadApiError::EmptyResponse)
    }
}
