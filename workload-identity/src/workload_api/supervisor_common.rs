//! Reconnect helpers shared by the identity source supervisor.

use std::time::Duration;

use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

/// Consecutive identical failures logged at WARN before dropping to DEBUG.
pub(crate) const MAX_CONSECUTIVE_SAME_ERROR: u32 = 3;

/// Which part of the source lifecycle opened a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StreamPhase {
    InitialSync,
    Supervisor,
}

/// Failure categories for log suppression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum ErrorKey {
    ClientCreation,
    StreamConnect,
    StreamError,
    UpdateRejected,
    NoIdentityIssued,
}

/// Counts consecutive failures of the same category.
///
/// The first [`MAX_CONSECUTIVE_SAME_ERROR`] occurrences of a category warrant a WARN;
/// later repeats are reported at DEBUG. A different category starts a new run.
#[derive(Debug)]
pub(crate) struct ErrorTracker {
    last: Option<ErrorKey>,
    consecutive: u32,
    max_consecutive: u32,
}

impl ErrorTracker {
    pub(crate) fn new(max_consecutive: u32) -> Self {
        Self {
            last: None,
            consecutive: 0,
            max_consecutive,
        }
    }

    /// Records a failure and returns whether it should be logged at WARN.
    pub(crate) fn record_error(&mut self, key: ErrorKey) -> bool {
        if self.last == Some(key) {
            self.consecutive = self.consecutive.saturating_add(1);
        } else {
            self.last = Some(key);
            self.consecutive = 1;
        }
        self.consecutive <= self.max_consecutive
    }

    pub(crate) fn consecutive_count(&self) -> u32 {
        self.consecutive
    }

    pub(crate) fn last_error_kind(&self) -> Option<ErrorKey> {
        self.last
    }

    pub(crate) fn reset(&mut self) {
        self.last = None;
        self.consecutive = 0;
    }
}

/// Sleeps for `dur`; returns `true` if `token` was cancelled first.
pub(crate) async fn sleep_or_cancel(token: &CancellationToken, dur: Duration) -> bool {
    tokio::select! {
        () = token.cancelled() => true,
        () = sleep(dur) => false,
    }
}

/// Doubles `current`, clamps to `max` and adds up to 10% jitter.
#[allow(clippy::cast_possible_truncation)]
pub(crate) fn next_backoff(current: Duration, max: Duration) -> Duration {
    let cur = current.as_millis().min(u128::from(u64::MAX)) as u64;
    let max = max.as_millis().min(u128::from(u64::MAX)) as u64;

    let base = cur.saturating_mul(2).min(max);
    if base == 0 {
        return Duration::ZERO;
    }

    let jitter = base / 10;
    let add = if jitter > 0 { fastrand::u64(0..=jitter) } else { 0 };

    Duration::from_millis(base.saturating_add(add).min(max))
}

/// Gentler policy for "no identity issued": 1s growing to 10s.
pub(crate) fn next_backoff_for_no_identity(current: Duration) -> Duration {
    const MIN: Duration = Duration::from_secs(1);
    const MAX: Duration = Duration::from_secs(10);

    next_backoff(current.max(MIN), MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracker_warns_three_times_then_suppresses() {
        let mut tracker = ErrorTracker::new(MAX_CONSECUTIVE_SAME_ERROR);

        assert!(tracker.record_error(ErrorKey::StreamConnect));
        assert!(tracker.record_error(ErrorKey::StreamConnect));
        assert!(tracker.record_error(ErrorKey::StreamConnect));
        assert!(!tracker.record_error(ErrorKey::StreamConnect));

        // A different failure starts a new run.
        assert!(tracker.record_error(ErrorKey::ClientCreation));

        assert_eq!(tracker.last_error_kind(), Some(ErrorKey::ClientCreation));
        assert_eq!(tracker.consecutive_count(), 1);

        tracker.reset();
        assert_eq!(tracker.last_error_kind(), None);
        assert!(tracker.record_error(ErrorKey::ClientCreation));
    }

    #[test]
    fn stream_errors_are_counted_apart_from_connect_failures() {
        let mut tracker = ErrorTracker::new(MAX_CONSECUTIVE_SAME_ERROR);

        for _ in 0..MAX_CONSECUTIVE_SAME_ERROR {
            assert!(tracker.record_error(ErrorKey::StreamError));
        }
        assert!(!tracker.record_error(ErrorKey::StreamError));
        assert_eq!(tracker.consecutive_count(), 4);

        assert!(tracker.record_error(ErrorKey::StreamConnect));
        assert!(tracker.record_error(ErrorKey::StreamError));
        assert_eq!(tracker.consecutive_count(), 1);
    }

    #[test]
    fn backoff_grows_and_is_clamped() {
        let max = Duration::from_secs(10);
        let next = next_backoff(Duration::from_millis(200), max);
        assert!(next >= Duration::from_millis(400) && next <= Duration::from_millis(440));

        assert_eq!(next_backoff(Duration::from_secs(8), max), max);
        assert_eq!(next_backoff(Duration::ZERO, max), Duration::ZERO);
    }

    #[test]
    fn no_identity_backoff_starts_at_two_seconds() {
        let next = next_backoff_for_no_identity(Duration::from_millis(200));
        assert!(next >= Duration::from_secs(2) && next <= Duration::from_millis(2200));
        assert_eq!(
            next_backoff_for_no_identity(Duration::from_secs(60)),
            Duration::from_secs(10)
        );
    }
}
