use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use time::OffsetDateTime;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, DropGuard};

use super::builder::{IdentitySourceBuilder, ReconnectConfig, ResourceLimits};
use super::errors::SourceError;
use super::limits::validate_context;
use super::supervisor::initial_sync;
use super::types::{ClientFactory, IdentityPicker};
use crate::bundle::{TrustBundle, TrustBundleSet};
use crate::identity::Identity;
use crate::prelude::warn;
use crate::subject_id::TrustDomain;
use crate::workload_api::IdentityContext;

/// The unit of the atomic swap: one identity and the bundles delivered with it.
///
/// `generation` is 0 after the initial fetch and grows by one with every accepted update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentitySnapshot {
    generation: u64,
    identity: Arc<Identity>,
    bundles: Arc<TrustBundleSet>,
}

impl IdentitySnapshot {
    pub(super) fn new(generation: u64, identity: Arc<Identity>, bundles: Arc<TrustBundleSet>) -> Self {
        Self {
            generation,
            identity,
            bundles,
        }
    }

    /// Number of accepted updates since the initial fetch.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// The selected identity.
    pub fn identity(&self) -> &Arc<Identity> {
        &self.identity
    }

    /// Trust bundles that arrived together with the identity.
    pub fn bundles(&self) -> &Arc<TrustBundleSet> {
        &self.bundles
    }
}

/// Receives update notifications from an [`IdentitySource`].
///
/// Each notification carries the generation of the snapshot that was published. A slow
/// receiver only sees the latest generation; intermediate ones may be skipped.
///
/// ```no_run
/// # use workload_identity::IdentitySource;
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let source = IdentitySource::open("unix:///run/tbot/workload.sock").await?;
/// let mut updates = source.updated();
///
/// updates.changed().await?;
/// println!("rotated to generation {}", updates.last());
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct IdentityUpdates {
    rx: watch::Receiver<u64>,
    cancel: CancellationToken,
}

impl IdentityUpdates {
    /// Waits for the next accepted update and returns its generation.
    ///
    /// The initial fetch does not notify.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::Closed`] once the source is closed or its background task
    /// has terminated.
    pub async fn changed(&mut self) -> Result<u64, SourceError> {
        // The sender lives as long as any source handle, so closing is signalled by the
        // cancellation token.
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => return Err(SourceError::Closed),
            changed = self.rx.changed() => changed.map_err(|_| SourceError::Closed)?,
        }
        Ok(*self.rx.borrow())
    }

    /// Returns the last seen generation without waiting.
    pub fn last(&self) -> u64 {
        *self.rx.borrow()
    }

    /// Waits until the generation satisfies `f`, returning immediately if it already does.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::Closed`] if the source is closed while waiting.
    pub async fn wait_for<F>(&mut self, mut f: F) -> Result<u64, SourceError>
    where
        F: FnMut(&u64) -> bool,
    {
        let current = self.last();
        if f(&current) {
            return Ok(current);
        }
        loop {
            let generation = self.changed().await?;
            if f(&generation) {
                return Ok(generation);
            }
        }
    }
}

/// A live, self-refreshing X.509 identity obtained from a Workload API endpoint.
///
/// Opening performs the initial fetch; afterwards a single background task keeps the
/// identity and bundles current. Readers never block on it: every read returns a complete
/// snapshot, and handles obtained before a rotation keep pointing at the old identity.
///
/// When the stream fails, the source keeps serving the last accepted snapshot, reports
/// itself as stale and reconnects with backoff.
///
/// Clones share the same state. Close it with [`IdentitySource::close`] or
/// [`IdentitySource::close_configured`]; dropping the last handle cancels the background
/// task without waiting for it.
#[derive(Clone)]
pub struct IdentitySource {
    inner: Arc<Inner>,
    // Shared by clones only; the supervisor task does not hold it.
    _guard: Arc<DropGuard>,
}

impl Debug for IdentitySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Debug::fmt(&self.inner, f)
    }
}

pub(super) struct SourceConfig {
    pub(super) make_client: ClientFactory,
    pub(super) picker: Option<Box<dyn IdentityPicker>>,
    pub(super) initial_fetch_timeout: Duration,
    pub(super) reconnect: ReconnectConfig,
    pub(super) limits: ResourceLimits,
    pub(super) shutdown_timeout: Option<Duration>,
}

pub(super) struct Inner {
    // Last accepted snapshot.
    snapshot: ArcSwap<IdentitySnapshot>,

    picker: Option<Box<dyn IdentityPicker>>,
    limits: ResourceLimits,

    reconnect: ReconnectConfig,
    make_client: ClientFactory,

    // Set on stream failure or rejected update, cleared by the next accepted update.
    stale: AtomicBool,

    closed: AtomicBool,
    cancel: CancellationToken,
    shutdown_timeout: Option<Duration>,

    update_tx: watch::Sender<u64>,
    update_rx: watch::Receiver<u64>,

    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl Inner {
    pub(super) fn reconnect(&self) -> ReconnectConfig {
        self.reconnect
    }

    pub(super) fn make_client(&self) -> &ClientFactory {
        &self.make_client
    }
}

impl Debug for Inner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentitySource")
            .field("generation", &self.snapshot.load().generation)
            .field("picker", &self.picker.as_ref().map(|_| "<IdentityPicker>"))
            .field("limits", &self.limits)
            .field("reconnect", &self.reconnect)
            .field("make_client", &"<ClientFactory>")
            .field("stale", &self.stale.load(Ordering::Relaxed))
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .field("shutdown_timeout", &self.shutdown_timeout)
            .finish_non_exhaustive()
    }
}

impl IdentitySource {
    /// Opens a source on `endpoint` with default settings.
    ///
    /// `endpoint` accepts `unix:///path`, `unix:/path`, `tcp://IP:port` or a bare socket path.
    ///
    /// # Errors
    ///
    /// See [`IdentitySourceBuilder::build`].
    pub async fn open(endpoint: impl AsRef<str>) -> Result<Self, SourceError> {
        IdentitySourceBuilder::new().endpoint(endpoint).build().await
    }

    /// Creates a builder.
    pub fn builder() -> IdentitySourceBuilder {
        IdentitySourceBuilder::new()
    }

    /// Returns the current identity.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::Closed`] after the source has been closed.
    pub fn current(&self) -> Result<Arc<Identity>, SourceError> {
        self.assert_open()?;
        Ok(Arc::clone(&self.inner.snapshot.load().identity))
    }

    /// Returns the current identity, bundles and generation from the same swap.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::Closed`] after the source has been closed.
    pub fn snapshot(&self) -> Result<Arc<IdentitySnapshot>, SourceError> {
        self.assert_open()?;
        Ok(self.inner.snapshot.load_full())
    }

    /// Returns the current trust bundle set.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::Closed`] after the source has been closed.
    pub fn bundle_set(&self) -> Result<Arc<TrustBundleSet>, SourceError> {
        self.assert_open()?;
        Ok(Arc::clone(&self.inner.snapshot.load().bundles))
    }

    /// Returns the current bundle for `trust_domain`, if the provider sent one.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::Closed`] after the source has been closed.
    pub fn bundle_for(
        &self,
        trust_domain: &TrustDomain,
    ) -> Result<Option<Arc<TrustBundle>>, SourceError> {
        self.assert_open()?;
        Ok(self.inner.snapshot.load().bundles.get(trust_domain))
    }

    /// Returns `true` when the served snapshot may be out of date: the update stream failed
    /// or ended since the last accepted update, the last update was rejected, or the current
    /// identity is past its `not_after`.
    pub fn is_stale(&self) -> bool {
        self.is_stale_at(OffsetDateTime::now_utc())
    }

    pub(crate) fn is_stale_at(&self, now: OffsetDateTime) -> bool {
        self.inner.stale.load(Ordering::Acquire)
            || self.inner.snapshot.load().identity.is_expired_at(now)
    }

    /// Returns `true` if the source is open and holds an identity that has not expired.
    ///
    /// The answer is best-effort; the source may be closed right after it is computed.
    pub fn is_healthy(&self) -> bool {
        if self.assert_open().is_err() {
            return false;
        }
        !self
            .inner
            .snapshot
            .load()
            .identity
            .is_expired_at(OffsetDateTime::now_utc())
    }

    /// Returns a handle for update notifications. Its initial generation is 0.
    pub fn updated(&self) -> IdentityUpdates {
        IdentityUpdates {
            rx: self.inner.update_rx.clone(),
            cancel: self.inner.cancel.clone(),
        }
    }

    /// Cancels the background task and waits for it to finish. Idempotent.
    ///
    /// This may wait indefinitely; prefer [`IdentitySource::close_with_timeout`] or
    /// [`IdentitySource::close_configured`].
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.cancel.cancel();

        if let Some(handle) = self.inner.supervisor.lock().await.take() {
            if let Err(_e) = handle.await {
                warn!("Error joining supervisor task during close: error={}", _e);
            }
        }
    }

    /// Cancels the background task and waits up to `timeout`, aborting it afterwards.
    /// Idempotent.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::ShutdownTimeout`] if the task had to be aborted.
    pub async fn close_with_timeout(&self, timeout: Duration) -> Result<(), SourceError> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.inner.cancel.cancel();

        let Some(mut handle) = self.inner.supervisor.lock().await.take() else {
            return Ok(());
        };

        match tokio::time::timeout(timeout, &mut handle).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_e)) => {
                warn!("Error joining supervisor task during close: error={}", _e);
                Ok(())
            }
            Err(_) => {
                warn!("Close timeout exceeded; aborting supervisor task");
                handle.abort();
                let _ = handle.await;
                Err(SourceError::ShutdownTimeout)
            }
        }
    }

    /// Closes using the timeout configured on the builder, or waits indefinitely if none.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::ShutdownTimeout`] if the configured timeout is exceeded.
    pub async fn close_configured(&self) -> Result<(), SourceError> {
        if let Some(timeout) = self.inner.shutdown_timeout {
            self.close_with_timeout(timeout).await
        } else {
            self.close().await;
            Ok(())
        }
    }
}

impl IdentitySource {
    pub(super) async fn build_with(config: SourceConfig) -> Result<IdentitySource, SourceError> {
        let SourceConfig {
            make_client,
            picker,
            initial_fetch_timeout,
            reconnect,
            limits,
            shutdown_timeout,
        } = config;

        let (update_tx, update_rx) = watch::channel(0u64);
        let cancel = CancellationToken::new();

        let initial = initial_sync(
            &make_client,
            picker.as_deref(),
            &cancel,
            reconnect,
            limits,
            initial_fetch_timeout,
        )
        .await?;

        let inner = Arc::new(Inner {
            snapshot: ArcSwap::from_pointee(initial),
            picker,
            limits,
            reconnect,
            make_client,
            stale: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            cancel,
            shutdown_timeout,
            update_tx,
            update_rx,
            supervisor: Mutex::new(None),
        });

        let task_inner = Arc::clone(&inner);
        let token = task_inner.cancel.clone();
        let handle = tokio::spawn(async move {
            task_inner.run_update_supervisor(token).await;
        });

        *inner.supervisor.lock().await = Some(handle);

        let guard = Arc::new(inner.cancel.clone().drop_guard());
        Ok(Self {
            inner,
            _guard: guard,
        })
    }

    /// Creates a source around an initial snapshot without a supervisor task.
    #[cfg(test)]
    pub(crate) fn new_for_test(
        identity: Arc<Identity>,
        bundles: Arc<TrustBundleSet>,
        limits: ResourceLimits,
    ) -> IdentitySource {
        use crate::workload_api::WorkloadApiError;

        let (update_tx, update_rx) = watch::channel(0u64);
        let make_client: ClientFactory =
            Arc::new(|| Box::pin(async move { Err(WorkloadApiError::EmptyResponse) }));

        let cancel = CancellationToken::new();
        let inner = Inner {
            snapshot: ArcSwap::from_pointee(IdentitySnapshot::new(0, identity, bundles)),
            picker: None,
            limits,
            reconnect: ReconnectConfig::default(),
            make_client,
            stale: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            cancel: cancel.clone(),
            shutdown_timeout: None,
            update_tx,
            update_rx,
            supervisor: Mutex::new(None),
        };

        Self {
            inner: Arc::new(inner),
            _guard: Arc::new(cancel.drop_guard()),
        }
    }

    #[cfg(test)]
    pub(crate) fn apply_update_for_test(&self, ctx: IdentityContext) -> Result<u64, SourceError> {
        self.inner.apply_update(&ctx)
    }

    fn assert_open(&self) -> Result<(), SourceError> {
        if self.inner.closed.load(Ordering::Acquire) || self.inner.cancel.is_cancelled() {
            return Err(SourceError::Closed);
        }
        Ok(())
    }
}

impl Inner {
    /// Validates `ctx` and publishes it. Returns the new generation.
    ///
    /// A rejected update leaves the current snapshot in place and marks the source stale.
    pub(super) fn apply_update(&self, ctx: &IdentityContext) -> Result<u64, SourceError> {
        let result = self.validate_update(ctx);
        match result {
            Ok(identity) => {
                let generation = self.snapshot.load().generation + 1;
                self.snapshot.store(Arc::new(IdentitySnapshot::new(
                    generation,
                    identity,
                    Arc::clone(ctx.bundles()),
                )));
                self.stale.store(false, Ordering::Release);
                let _ = self.update_tx.send(generation);
                Ok(generation)
            }
            Err(e) => {
                self.mark_stale();
                Err(e)
            }
        }
    }

    fn validate_update(&self, ctx: &IdentityContext) -> Result<Arc<Identity>, SourceError> {
        let identity = validate_context(ctx, self.picker.as_deref(), self.limits)?;

        // A byte-identical leaf is a bundle-only refresh.
        let current = self.snapshot.load();
        if identity.leaf() != current.identity.leaf()
            && identity.not_after() <= current.identity.not_after()
        {
            return Err(SourceError::NotAfterRegression {
                current: current.identity.not_after(),
                new: identity.not_after(),
            });
        }

        Ok(identity)
    }

    pub(super) fn mark_stale(&self) {
        self.stale.store(true, Ordering::Release);
    }
}
