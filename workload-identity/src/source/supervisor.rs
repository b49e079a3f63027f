use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt as _;
use tokio_util::sync::CancellationToken;

use super::builder::{ReconnectConfig, ResourceLimits};
use super::errors::SourceError;
use super::limits::validate_context;
use super::source::{IdentitySnapshot, Inner};
use super::types::{ClientFactory, IdentityPicker};
use crate::error::ErrorKind;
use crate::prelude::{debug, info, warn};
use crate::workload_api::supervisor_common::{
    next_backoff, next_backoff_for_no_identity, sleep_or_cancel, ErrorKey, ErrorTracker,
    StreamPhase, MAX_CONSECUTIVE_SAME_ERROR,
};
use crate::workload_api::{IdentityContext, WorkloadApiClient, WorkloadApiError};

/// Creates a client, logging failures through `error_tracker`.
async fn try_create_client(
    make_client: &ClientFactory,
    backoff: Duration,
    error_tracker: &mut ErrorTracker,
) -> Result<WorkloadApiClient, WorkloadApiError> {
    match (make_client)().await {
        Ok(c) => {
            if error_tracker.last_error_kind() == Some(ErrorKey::ClientCreation) {
                if error_tracker.consecutive_count() >= MAX_CONSECUTIVE_SAME_ERROR {
                    debug!(
                        "Client creation recovered after {} consecutive failures",
                        error_tracker.consecutive_count()
                    );
                }
                error_tracker.reset();
            }
            Ok(c)
        }
        Err(e) => {
            if error_tracker.record_error(ErrorKey::ClientCreation) {
                warn!(
                    "Failed to create Workload API client; retrying: error={}, backoff_ms={}",
                    e,
                    backoff.as_millis()
                );
            } else {
                debug!(
                    "Failed to create Workload API client (repeated); retrying: error={}, backoff_ms={}, consecutive_failures={}",
                    e,
                    backoff.as_millis(),
                    error_tracker.consecutive_count()
                );
            }
            Err(e)
        }
    }
}

/// Opens the update stream, logging failures through `error_tracker`.
async fn try_connect_stream(
    client: &WorkloadApiClient,
    backoff: Duration,
    error_tracker: &mut ErrorTracker,
    phase: StreamPhase,
    supervisor_id: Option<u64>,
) -> Result<
    impl futures::Stream<Item = Result<IdentityContext, WorkloadApiError>> + Send + 'static + use<>,
    WorkloadApiError,
> {
    match client.stream_identity_contexts().await {
        Ok(s) => {
            let id_suffix = supervisor_id.map_or_else(String::new, |id| format!(", id={id}"));

            if error_tracker.last_error_kind() == Some(ErrorKey::StreamConnect)
                && error_tracker.consecutive_count() > 0
            {
                info!(
                    "Stream connection recovered after {} consecutive failures (phase={:?}{})",
                    error_tracker.consecutive_count(),
                    phase,
                    id_suffix
                );
            }
            error_tracker.reset();
            info!(
                "Connected to Workload API identity stream (phase={:?}{}, endpoint={})",
                phase,
                id_suffix,
                client.endpoint()
            );
            Ok(s)
        }
        Err(WorkloadApiError::NoIdentityIssued) => {
            if error_tracker.record_error(ErrorKey::NoIdentityIssued) {
                warn!("No identity issued yet; waiting before retry");
            } else {
                debug!(
                    "No identity issued yet (repeated); waiting before retry: consecutive_failures={}",
                    error_tracker.consecutive_count()
                );
            }
            Err(WorkloadApiError::NoIdentityIssued)
        }
        Err(e) => {
            if error_tracker.record_error(ErrorKey::StreamConnect) {
                warn!(
                    "Failed to connect to Workload API stream; retrying: error={}, backoff_ms={}",
                    e,
                    backoff.as_millis()
                );
            } else {
                debug!(
                    "Failed to connect to Workload API stream (repeated); retrying: error={}, backoff_ms={}, consecutive_failures={}",
                    e,
                    backoff.as_millis(),
                    error_tracker.consecutive_count()
                );
            }
            Err(e)
        }
    }
}

/// Performs the initial fetch, retrying transient failures until `timeout` elapses.
pub(super) async fn initial_sync(
    make_client: &ClientFactory,
    picker: Option<&dyn IdentityPicker>,
    cancel: &CancellationToken,
    reconnect: ReconnectConfig,
    limits: ResourceLimits,
    timeout: Duration,
) -> Result<IdentitySnapshot, SourceError> {
    let mut last_error = None;

    let attempt = initial_sync_with_retry(
        make_client,
        picker,
        cancel,
        reconnect,
        limits,
        &mut last_error,
    );

    let outcome = tokio::time::timeout(timeout, attempt).await;
    match outcome {
        Ok(result) => result,
        Err(_) => {
            warn!(
                "Initial identity fetch timed out: timeout_ms={}, last_error={}",
                timeout.as_millis(),
                last_error
                    .as_ref()
                    .map_or_else(|| "none".to_string(), ToString::to_string)
            );
            Err(SourceError::InitialFetchTimeout {
                timeout,
                last_error: last_error.map(Box::new),
            })
        }
    }
}

async fn initial_sync_with_retry(
    make_client: &ClientFactory,
    picker: Option<&dyn IdentityPicker>,
    cancel: &CancellationToken,
    reconnect: ReconnectConfig,
    limits: ResourceLimits,
    last_error: &mut Option<SourceError>,
) -> Result<IdentitySnapshot, SourceError> {
    let mut backoff = reconnect.min_backoff;
    let mut error_tracker = ErrorTracker::new(MAX_CONSECUTIVE_SAME_ERROR);

    loop {
        if cancel.is_cancelled() {
            return Err(SourceError::Closed);
        }

        match try_sync_once(make_client, picker, limits, backoff, &mut error_tracker).await {
            Ok(snapshot) => return Ok(snapshot),
            // Unusable material or a bad endpoint will not fix itself.
            Err(e) if e.kind() != ErrorKind::Connection => return Err(e),
            Err(e) => {
                let no_identity = matches!(e, SourceError::Source(WorkloadApiError::NoIdentityIssued));
                *last_error = Some(e);

                if sleep_or_cancel(cancel, backoff).await {
                    return Err(SourceError::Closed);
                }
                backoff = if no_identity {
                    next_backoff_for_no_identity(backoff)
                } else {
                    next_backoff(backoff, reconnect.max_backoff)
                };
            }
        }
    }
}

async fn try_sync_once(
    make_client: &ClientFactory,
    picker: Option<&dyn IdentityPicker>,
    limits: ResourceLimits,
    backoff: Duration,
    error_tracker: &mut ErrorTracker,
) -> Result<IdentitySnapshot, SourceError> {
    let client = try_create_client(make_client, backoff, error_tracker).await?;

    let mut stream =
        try_connect_stream(&client, backoff, error_tracker, StreamPhase::InitialSync, None).await?;

    match stream.next().await {
        Some(Ok(ctx)) => {
            let identity = validate_context(&ctx, picker, limits).inspect_err(|e| {
                warn!("Initial identity update rejected: error={e}");
            })?;
            info!(
                "Obtained workload identity: subject_id={}, not_after={}",
                identity.subject_id(),
                identity.not_after()
            );
            Ok(IdentitySnapshot::new(0, identity, Arc::clone(ctx.bundles())))
        }
        Some(Err(e)) => {
            warn!("Initial sync: Workload API stream error: error={e}");
            Err(SourceError::Source(e))
        }
        None => {
            warn!("Initial sync: Workload API stream ended immediately; will retry");
            Err(SourceError::StreamEnded)
        }
    }
}

/// Outcome of draining one stream.
struct StreamResult {
    cancelled: bool,
    had_successful_update: bool,
}

impl Inner {
    pub(super) async fn run_update_supervisor(&self, cancellation_token: CancellationToken) {
        let supervisor_id = fastrand::u64(..);
        info!("Starting update supervisor: id={}", supervisor_id);

        let mut backoff = self.reconnect().min_backoff;
        let mut error_tracker = ErrorTracker::new(MAX_CONSECUTIVE_SAME_ERROR);

        loop {
            if cancellation_token.is_cancelled() {
                debug!("Cancellation signal received; stopping updates");
                return;
            }

            let Ok(client) =
                try_create_client(self.make_client(), backoff, &mut error_tracker).await
            else {
                self.mark_stale();
                if sleep_or_cancel(&cancellation_token, backoff).await {
                    return;
                }
                backoff = next_backoff(backoff, self.reconnect().max_backoff);
                continue;
            };

            match try_connect_stream(
                &client,
                backoff,
                &mut error_tracker,
                StreamPhase::Supervisor,
                Some(supervisor_id),
            )
            .await
            {
                Ok(mut stream) => {
                    let result = self
                        .process_stream_updates(
                            &mut stream,
                            &cancellation_token,
                            &mut error_tracker,
                            supervisor_id,
                        )
                        .await;
                    if result.cancelled {
                        return;
                    }

                    // Only a stream that delivered something resets the backoff.
                    if result.had_successful_update {
                        backoff = self.reconnect().min_backoff;
                    }

                    if sleep_or_cancel(&cancellation_token, backoff).await {
                        return;
                    }
                    if !result.had_successful_update {
                        backoff = next_backoff(backoff, self.reconnect().max_backoff);
                    }
                }
                Err(stream_err) => {
                    self.mark_stale();
                    backoff = match stream_err {
                        WorkloadApiError::NoIdentityIssued => next_backoff_for_no_identity(backoff),
                        _ => next_backoff(backoff, self.reconnect().max_backoff),
                    };

                    if sleep_or_cancel(&cancellation_token, backoff).await {
                        return;
                    }
                }
            }
        }
    }

    /// Applies updates until the stream ends or fails, or cancellation is requested.
    async fn process_stream_updates(
        &self,
        stream: &mut (impl futures::Stream<Item = Result<IdentityContext, WorkloadApiError>>
                  + Unpin
                  + Send
                  + 'static),
        cancellation_token: &CancellationToken,
        error_tracker: &mut ErrorTracker,
        supervisor_id: u64,
    ) -> StreamResult {
        let mut rejection_tracker = ErrorTracker::new(MAX_CONSECUTIVE_SAME_ERROR);
        let mut had_successful_update = false;

        loop {
            let item = tokio::select! {
                () = cancellation_token.cancelled() => {
                    debug!("Cancellation signal received; stopping update loop");
                    return StreamResult { cancelled: true, had_successful_update };
                }
                v = stream.next() => v,
            };

            let rejected = match item {
                Some(Ok(ctx)) => match self.apply_update(&ctx) {
                    Ok(generation) => {
                        had_successful_update = true;
                        if error_tracker.last_error_kind() == Some(ErrorKey::StreamError) {
                            info!(
                                "Workload API stream recovered after {} consecutive errors",
                                error_tracker.consecutive_count(),
                            );
                            error_tracker.reset();
                        }
                        if rejection_tracker.consecutive_count() > 0 {
                            info!(
                                "Update validation recovered after {} consecutive failures",
                                rejection_tracker.consecutive_count(),
                            );
                            rejection_tracker.reset();
                        }
                        info!("Workload identity updated: generation={}", generation);
                        None
                    }
                    Err(e) => Some(e),
                },
                // A message that does not parse is a rejected update, not a broken stream.
                Some(Err(e)) if e.is_format_error() => {
                    self.mark_stale();
                    Some(SourceError::Source(e))
                }
                Some(Err(e)) => {
                    self.mark_stale();
                    if error_tracker.record_error(ErrorKey::StreamError) {
                        warn!(
                            "Workload API stream error; reconnecting: id={}, error={}",
                            supervisor_id, e
                        );
                    } else {
                        debug!(
                            "Workload API stream error (repeated); reconnecting: id={}, error={}, consecutive_failures={}",
                            supervisor_id,
                            e,
                            error_tracker.consecutive_count()
                        );
                    }
                    return StreamResult {
                        cancelled: false,
                        had_successful_update,
                    };
                }
                None => {
                    self.mark_stale();
                    warn!("Workload API stream ended; reconnecting: id={supervisor_id}");
                    return StreamResult {
                        cancelled: false,
                        had_successful_update,
                    };
                }
            };

            if let Some(e) = rejected {
                if rejection_tracker.record_error(ErrorKey::UpdateRejected) {
                    warn!("Rejected identity update; serving previous identity: error={e}");
                } else {
                    debug!(
                        "Rejected identity update (repeated): error={}, consecutive_rejections={}",
                        e,
                        rejection_tracker.consecutive_count()
                    );
                }
            }
        }
    }
}
