use std::sync::LazyLock;

use tonic::metadata::{Ascii, MetadataKey, MetadataValue};

const WORKLOAD_HEADER_KEY: &str = "workload.spiffe.io";
const WORKLOAD_HEADER_VALUE: &str = "true";

static PARSED_HEADER_KEY: LazyLock<MetadataKey<Ascii>> = LazyLock::new(|| {
    #[allow(clippy::expect_used)]
    MetadataKey::from_bytes(WORKLOAD_HEADER_KEY.as_bytes())
        .expect("WORKLOAD_HEADER_KEY must be valid ASCII")
});

static PARSED_HEADER_VALUE: LazyLock<MetadataValue<Ascii>> =
    LazyLock::new(|| MetadataValue::from_static(WORKLOAD_HEADER_VALUE));

/// Adds the metadata header every Workload API server requires.
#[derive(Debug, Clone)]
pub(crate) struct MetadataAdder;

impl tonic::service::Interceptor for MetadataAdder {
    fn call(
        &mut self,
        mut request: tonic::Request<()>,
    ) -> Result<tonic::Request<()>, tonic::Status> {
        request
            .metadata_mut()
            .insert(PARSED_HEADER_KEY.clone(), PARSED_HEADER_VALUE.clone());
        Ok(request)
    }
}

/// Returns `true` when a request carries the Workload API header.
#[cfg(any(test, feature = "test-support"))]
pub(crate) fn has_workload_header(metadata: &tonic::metadata::MetadataMap) -> bool {
    metadata
        .get(WORKLOAD_HEADER_KEY)
        .is_some_and(|v| v == WORKLOAD_HEADER_VALUE)
}
