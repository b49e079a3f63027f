//! Opening the workload identity source at startup.

use std::time::Duration;

use anyhow::{Context, Result};
use tracing::info;
use workload_identity::{IdentitySource, StatusReporter};

/// Opens `endpoint`, waiting at most `initial_fetch_timeout` for the first identity, and
/// logs what was obtained.
pub async fn open_source(
    endpoint: &str,
    initial_fetch_timeout: Duration,
) -> Result<IdentitySource> {
    info!(endpoint, "Using workload API socket");

    let source = IdentitySource::builder()
        .endpoint(endpoint)
        .initial_fetch_timeout(initial_fetch_timeout)
        .build()
        .await
        .with_context(|| format!("unable to obtain a workload identity from {endpoint}"))?;

    let status = StatusReporter::new(source.clone())
        .status()
        .context("workload identity source closed during startup")?;
    info!(
        spiffe_id = %status.subject_id,
        not_after = %status.not_after_rfc3339(),
        expires_in = %status.expires_in_display(),
        "Obtained workload identity"
    );

    Ok(source)
}
