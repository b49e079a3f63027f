//! Read-only reporting on the current identity: subject, expiry and remaining lifetime.
//!
//! [`StatusReporter`] reads the [`IdentitySource`] at call time, so two calls straddling a
//! rotation report different identities. [`AggregateStatus`] combines the local status
//! with a peer's, degrading to local-only when the peer cannot be reached.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::prelude::warn;
use crate::source::{IdentitySource, SourceError};
use crate::subject_id::SubjectId;

/// Remaining lifetime below which an identity is reported as near expiry.
pub const DEFAULT_NEAR_EXPIRY_THRESHOLD: Duration = Duration::from_secs(2 * 60);

/// Status of the current identity at one instant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityStatus {
    /// Subject of the current identity.
    pub subject_id: SubjectId,
    /// Leaf expiry.
    pub not_after: OffsetDateTime,
    /// Time left until `not_after`, zero once it has passed.
    pub expires_in: Duration,
    /// The identity has expired or the source could not refresh it.
    pub stale: bool,
    /// `expires_in` is below the reporter's threshold.
    pub near_expiry: bool,
}

impl IdentityStatus {
    /// `not_after` as RFC 3339.
    pub fn not_after_rfc3339(&self) -> String {
        self.not_after
            .format(&Rfc3339)
            .unwrap_or_else(|_| self.not_after.to_string())
    }

    /// `expires_in` rendered by [`format_duration`].
    pub fn expires_in_display(&self) -> String {
        format_duration(self.expires_in)
    }

    /// The JSON document peers exchange about this status.
    pub fn to_document(&self, note: impl Into<String>) -> StatusDocument {
        StatusDocument {
            spiffe_id: self.subject_id.to_string(),
            not_after: self.not_after_rfc3339(),
            expires_in: self.expires_in_display(),
            note: note.into(),
        }
    }
}

/// Identity status as published over HTTP and read back from peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusDocument {
    /// Subject id of the reporting workload.
    pub spiffe_id: String,
    /// RFC 3339 expiry.
    pub not_after: String,
    /// Remaining lifetime, see [`format_duration`].
    pub expires_in: String,
    /// Free-form remark.
    #[serde(default)]
    pub note: String,
}

/// Computes [`IdentityStatus`] from an [`IdentitySource`].
#[derive(Debug, Clone)]
pub struct StatusReporter {
    source: IdentitySource,
    near_expiry_threshold: Duration,
}

impl StatusReporter {
    /// Creates a reporter with the default near-expiry threshold.
    pub fn new(source: IdentitySource) -> Self {
        Self {
            source,
            near_expiry_threshold: DEFAULT_NEAR_EXPIRY_THRESHOLD,
        }
    }

    /// Overrides [`DEFAULT_NEAR_EXPIRY_THRESHOLD`].
    #[must_use]
    pub fn near_expiry_threshold(mut self, threshold: Duration) -> Self {
        self.near_expiry_threshold = threshold;
        self
    }

    /// The source being reported on.
    pub fn source(&self) -> &IdentitySource {
        &self.source
    }

    /// Status of the current identity now.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::Closed`] once the source is closed.
    pub fn status(&self) -> Result<IdentityStatus, SourceError> {
        self.status_at(OffsetDateTime::now_utc())
    }

    /// Status of the current identity at `now`.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::Closed`] once the source is closed.
    pub fn status_at(&self, now: OffsetDateTime) -> Result<IdentityStatus, SourceError> {
        let identity = self.source.current()?;
        let not_after = identity.not_after();

        let expires_in = Duration::try_from(not_after - now).unwrap_or(Duration::ZERO);
        let stale = expires_in.is_zero() || self.source.is_stale_at(now);
        let near_expiry = expires_in < self.near_expiry_threshold;

        if near_expiry {
            warn!(
                "Workload identity is close to expiry: subject_id={}, expires_in={}, stale={}",
                identity.subject_id(),
                format_duration(expires_in),
                stale
            );
        }

        Ok(IdentityStatus {
            subject_id: identity.subject_id().clone(),
            not_after,
            expires_in,
            stale,
            near_expiry,
        })
    }
}

/// Formats `d` truncated to whole seconds: `0s`, `45s`, `1m30s`, `5m0s`, `10h0m0s`.
pub fn format_duration(d: Duration) -> String {
    let total = d.as_secs();
    let (hours, minutes, seconds) = (total / 3600, total / 60 % 60, total % 60);

    if hours > 0 {
        format!("{hours}h{minutes}m{seconds}s")
    } else if minutes > 0 {
        format!("{minutes}m{seconds}s")
    } else {
        format!("{seconds}s")
    }
}

/// Local status plus, when reachable, the peer's.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregateStatus<R> {
    /// Status of this workload.
    pub local: IdentityStatus,
    /// `None` when the peer could not be queried.
    pub remote: Option<R>,
}

impl<R> AggregateStatus<R> {
    /// Awaits `remote` and merges it with `local`. A failed fetch is logged and reported as
    /// `remote: None`; it never fails the aggregate.
    pub async fn collect<F, E>(local: IdentityStatus, remote: F) -> Self
    where
        F: Future<Output = Result<R, E>>,
        E: Display,
    {
        let remote = match remote.await {
            Ok(status) => Some(status),
            Err(_e) => {
                warn!("Peer status unavailable; reporting local status only: error={}", _e);
                None
            }
        };
        Self { local, remote }
    }
}
