use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use super::errors::SourceError;
use super::source::{IdentitySource, SourceConfig};
use super::types::{ClientFactory, IdentityPicker};
use crate::workload_api::WorkloadApiClient;

/// Default bound on the initial fetch.
pub const DEFAULT_INITIAL_FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Reconnect backoff range. Backoff doubles from `min_backoff` up to `max_backoff`
/// with up to 10% jitter. An inverted range is swapped when the source is built.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReconnectConfig {
    /// First retry delay.
    pub min_backoff: Duration,
    /// Largest retry delay.
    pub max_backoff: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            min_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(10),
        }
    }
}

impl ReconnectConfig {
    pub(crate) fn normalize(mut self) -> Self {
        if self.min_backoff > self.max_backoff {
            std::mem::swap(&mut self.min_backoff, &mut self.max_backoff);
        }
        self
    }
}

/// Upper bounds checked on every update before it is published. `None` disables a bound.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResourceLimits {
    /// Identities per update.
    pub max_identities: Option<usize>,
    /// Trust bundles per update.
    pub max_bundles: Option<usize>,
    /// Summed DER bytes of the authorities of a single bundle.
    pub max_bundle_der_bytes: Option<usize>,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_identities: Some(100),
            max_bundles: Some(200),
            max_bundle_der_bytes: Some(4 * 1024 * 1024),
        }
    }
}

impl ResourceLimits {
    /// No bounds at all.
    pub const fn unlimited() -> Self {
        Self {
            max_identities: None,
            max_bundles: None,
            max_bundle_der_bytes: None,
        }
    }
}

/// Builder for [`IdentitySource`].
///
/// ```no_run
/// use std::time::Duration;
/// use workload_identity::IdentitySource;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let source = IdentitySource::builder()
///     .endpoint("unix:///run/tbot/workload.sock")
///     .initial_fetch_timeout(Duration::from_secs(5))
///     .reconnect_backoff(Duration::from_millis(500), Duration::from_secs(30))
///     .build()
///     .await?;
/// # Ok(())
/// # }
/// ```
pub struct IdentitySourceBuilder {
    make_client: Option<ClientFactory>,
    picker: Option<Box<dyn IdentityPicker>>,
    initial_fetch_timeout: Duration,
    reconnect: ReconnectConfig,
    limits: ResourceLimits,
    shutdown_timeout: Option<Duration>,
}

impl Debug for IdentitySourceBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentitySourceBuilder")
            .field("make_client", &self.make_client.as_ref().map(|_| "<ClientFactory>"))
            .field("picker", &self.picker.as_ref().map(|_| "<IdentityPicker>"))
            .field("initial_fetch_timeout", &self.initial_fetch_timeout)
            .field("reconnect", &self.reconnect)
            .field("limits", &self.limits)
            .field("shutdown_timeout", &self.shutdown_timeout)
            .finish()
    }
}

impl Default for IdentitySourceBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl IdentitySourceBuilder {
    /// Creates a builder with default settings and no endpoint.
    pub fn new() -> Self {
        Self {
            make_client: None,
            picker: None,
            initial_fetch_timeout: DEFAULT_INITIAL_FETCH_TIMEOUT,
            reconnect: ReconnectConfig::default(),
            limits: ResourceLimits::default(),
            shutdown_timeout: Some(Duration::from_secs(30)),
        }
    }

    /// Sets the Workload API endpoint. It is parsed on every connection attempt, so an
    /// invalid value surfaces from [`IdentitySourceBuilder::build`].
    #[must_use]
    pub fn endpoint(mut self, endpoint: impl AsRef<str>) -> Self {
        let endpoint: Arc<str> = Arc::from(endpoint.as_ref());

        let factory: ClientFactory = Arc::new(move || {
            let endpoint = Arc::clone(&endpoint);
            Box::pin(async move { WorkloadApiClient::connect_to(&*endpoint).await })
        });

        self.make_client = Some(factory);
        self
    }

    /// Sets a custom client factory, replacing any endpoint.
    #[must_use]
    pub fn client_factory(mut self, factory: ClientFactory) -> Self {
        self.make_client = Some(factory);
        self
    }

    /// Sets the identity selection strategy.
    #[must_use]
    pub fn picker<P: IdentityPicker>(mut self, picker: P) -> Self {
        self.picker = Some(Box::new(picker));
        self
    }

    /// Bounds the whole initial fetch, retries included.
    #[must_use]
    pub const fn initial_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.initial_fetch_timeout = timeout;
        self
    }

    /// Sets the reconnect backoff range.
    #[must_use]
    pub const fn reconnect_backoff(mut self, min_backoff: Duration, max_backoff: Duration) -> Self {
        self.reconnect = ReconnectConfig {
            min_backoff,
            max_backoff,
        };
        self
    }

    /// Sets the resource limits.
    #[must_use]
    pub const fn resource_limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Sets the timeout used by [`IdentitySource::close_configured`]. `None` waits forever.
    #[must_use]
    pub const fn shutdown_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Performs the initial fetch and starts the background supervisor.
    ///
    /// # Errors
    ///
    /// - a `Connection`-kind error when no identity could be fetched within the initial
    ///   fetch timeout; it carries the last underlying failure;
    /// - an `IdentityFormat`-kind error as soon as the provider returns unusable material;
    /// - a `Configuration`-kind error when no endpoint was set or it is invalid.
    pub async fn build(self) -> Result<IdentitySource, SourceError> {
        let make_client = self.make_client.unwrap_or_else(|| {
            Arc::new(|| {
                Box::pin(async {
                    Err(crate::transport::EndpointError::Empty.into())
                })
            })
        });

        IdentitySource::build_with(SourceConfig {
            make_client,
            picker: self.picker,
            initial_fetch_timeout: self.initial_fetch_timeout,
            reconnect: self.reconnect.normalize(),
            limits: self.limits,
            shutdown_timeout: self.shutdown_timeout,
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reconnect_config_normalization() {
        let config = ReconnectConfig {
            min_backoff: Duration::from_secs(10),
            max_backoff: Duration::from_secs(1),
        };
        let normalized = config.normalize();
        assert_eq!(normalized.min_backoff, Duration::from_secs(1));
        assert_eq!(normalized.max_backoff, Duration::from_secs(10));

        let config = ReconnectConfig::default();
        assert_eq!(config.normalize(), config);
    }

    #[test]
    fn reconnect_setter_stores_raw_values() {
        let builder = IdentitySourceBuilder::new()
            .reconnect_backoff(Duration::from_secs(10), Duration::from_secs(1));
        assert_eq!(builder.reconnect.min_backoff, Duration::from_secs(10));
        assert_eq!(builder.reconnect.max_backoff, Duration::from_secs(1));
    }

    #[test]
    fn defaults() {
        let builder = IdentitySourceBuilder::new();
        assert_eq!(builder.initial_fetch_timeout, Duration::from_secs(10));
        assert_eq!(builder.shutdown_timeout, Some(Duration::from_secs(30)));
        assert_eq!(builder.limits.max_identities, Some(100));
        assert_eq!(builder.limits.max_bundles, Some(200));
        assert_eq!(builder.limits.max_bundle_der_bytes, Some(4 * 1024 * 1024));
        assert_eq!(ResourceLimits::unlimited().max_identities, None);
    }

    #[tokio::test]
    async fn build_without_endpoint_is_a_configuration_error() {
        let err = IdentitySourceBuilder::new().build().await.unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Configuration);
    }
}
