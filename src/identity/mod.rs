//! Workload identity lifecycle.
//!
//! [`IdentityManager`] holds exactly one current [`WorkloadIdentity`] behind
//! an `Arc` swap, so readers always see a matching certificate and key. A
//! background worker refreshes the credential well before it expires and
//! publishes [`IdentityEvent`]s to subscribers such as the transport layer.
//!
//! Timing: the refresh is scheduled `max(ttl * rotation_fraction, min_buffer)`
//! before expiry. Failed fetches back off exponentially, but the delay is
//! capped at half of the remaining validity so another attempt always lands
//! before the identity actually expires. If expiry passes anyway the identity
//! is marked stale and [`IdentityManager::get_current_identity`] fails until a
//! refresh succeeds.

mod source;
mod x509;

use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;

use crate::audit::AuditLogger;
use crate::types::SpiffeId;

pub use source::{
    identity_from_der, identity_from_pem, FileIdentitySource, IdentitySource,
    IdentitySourceError, IdentityStream, SVID_CERT_FILE, SVID_KEY_FILE,
};
pub(crate) use x509::spiffe_id_of;

const EVENT_CAPACITY: usize = 64;
const MIN_RETRY_DELAY: Duration = Duration::from_millis(10);
// Validity beyond this is tracked as if it ended here.
const MAX_TRACKED_VALIDITY: Duration = Duration::from_secs(10 * 365 * 24 * 3600);

// ---------------------------------------------------------------------------
// WorkloadIdentity
// ---------------------------------------------------------------------------

/// Shared handle to a private key. `Debug` never prints key material.
#[derive(Clone)]
pub struct PrivateKeyHandle(Arc<PrivateKeyDer<'static>>);

impl PrivateKeyHandle {
    /// Wrap a DER private key.
    pub fn new(key: PrivateKeyDer<'static>) -> Self {
        Self(Arc::new(key))
    }

    /// An owned copy of the key for handing to TLS configuration.
    pub fn key_der(&self) -> PrivateKeyDer<'static> {
        self.0.clone_key()
    }
}

impl std::fmt::Debug for PrivateKeyHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("PrivateKeyHandle([REDACTED])")
    }
}

/// A short-lived workload credential: SPIFFE ID, certificate chain and key.
#[derive(Debug, Clone)]
pub struct WorkloadIdentity {
    spiffe_id: SpiffeId,
    cert_chain: Vec<CertificateDer<'static>>,
    private_key: PrivateKeyHandle,
    not_before: DateTime<Utc>,
    not_after: DateTime<Utc>,
}

impl WorkloadIdentity {
    /// Assemble an identity.
    ///
    /// # Errors
    ///
    /// Returns [`IdentityError::Invalid`] when the chain is empty or the
    /// validity window is empty.
    pub fn new(
        spiffe_id: SpiffeId,
        cert_chain: Vec<CertificateDer<'static>>,
        private_key: PrivateKeyHandle,
        not_before: DateTime<Utc>,
        not_after: DateTime<Utc>,
    ) -> Result<Self, IdentityError> {
        if cert_chain.is_empty() {
            return Err(IdentityError::Invalid("empty certificate chain".to_owned()));
        }
        if not_before >= not_after {
            return Err(IdentityError::Invalid(
                "not_before must precede not_after".to_owned(),
            ));
        }
        Ok(Self {
            spiffe_id,
            cert_chain,
            private_key,
            not_before,
            not_after,
        })
    }

    /// The workload's SPIFFE ID.
    pub fn spiffe_id(&self) -> &SpiffeId {
        &self.spiffe_id
    }

    /// Trust domain of the SPIFFE ID.
    pub fn trust_domain(&self) -> &str {
        self.spiffe_id.trust_domain()
    }

    /// DER certificate chain, leaf first.
    pub fn cert_chain(&self) -> &[CertificateDer<'static>] {
        &self.cert_chain
    }

    /// Handle to the private key matching the leaf.
    pub fn private_key(&self) -> &PrivateKeyHandle {
        &self.private_key
    }

    /// Start of validity.
    pub fn not_before(&self) -> DateTime<Utc> {
        self.not_before
    }

    /// End of validity.
    pub fn not_after(&self) -> DateTime<Utc> {
        self.not_after
    }

    /// Full validity window length.
    pub fn ttl(&self) -> Duration {
        self.not_after
            .signed_duration_since(self.not_before)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }

    /// Validity left at `now`; zero once expired.
    pub fn remaining_at(&self, now: DateTime<Utc>) -> Duration {
        self.not_after
            .signed_duration_since(now)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }
}

// ---------------------------------------------------------------------------
// Errors and events
// ---------------------------------------------------------------------------

/// Why no identity can be handed out.
#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    /// No identity has been fetched yet.
    #[error("no workload identity has been fetched")]
    NotFetched,
    /// The held identity expired before a refresh succeeded.
    #[error("workload identity {spiffe_id} expired at {expired_at}")]
    Expired {
        /// Identity that expired.
        spiffe_id: SpiffeId,
        /// When it expired.
        expired_at: DateTime<Utc>,
    },
    /// The identity source failed.
    #[error(transparent)]
    Source(#[from] IdentitySourceError),
    /// A fetched identity was rejected.
    #[error("invalid workload identity: {0}")]
    Invalid(String),
    /// Fetching took longer than the configured timeout.
    #[error("identity fetch timed out after {0:?}")]
    FetchTimeout(Duration),
    /// The manager was shut down.
    #[error("identity manager is shut down")]
    ShutDown,
}

/// Published to [`IdentityManager::watch`] subscribers.
#[derive(Debug, Clone)]
pub enum IdentityEvent {
    /// A new identity became current.
    Rotated(Arc<WorkloadIdentity>),
    /// The current identity expired without a successful refresh.
    Expired {
        /// Identity that expired.
        spiffe_id: SpiffeId,
        /// When it expired.
        expired_at: DateTime<Utc>,
    },
}

/// Stream returned by [`IdentityManager::watch`].
pub type IdentityEvents = Pin<Box<dyn Stream<Item = IdentityEvent> + Send>>;

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

/// Rotation schedule.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RotationSettings {
    /// Fraction of the total lifetime to keep as lead time before expiry.
    pub rotation_fraction: f64,
    /// Minimum lead time before expiry.
    pub min_buffer: Duration,
    /// Bound on a single fetch.
    pub fetch_timeout: Duration,
    /// First retry delay after a failed fetch.
    pub initial_backoff: Duration,
    /// Largest retry delay after repeated failures.
    pub max_backoff: Duration,
}

impl Default for RotationSettings {
    fn default() -> Self {
        Self {
            rotation_fraction: 0.5,
            min_buffer: Duration::from_secs(30),
            fetch_timeout: Duration::from_secs(10),
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
        }
    }
}

impl RotationSettings {
    /// Lead time before expiry at which a refresh is scheduled.
    pub fn lead_time(&self, ttl: Duration) -> Duration {
        let fraction = self.rotation_fraction.clamp(0.0, 1.0);
        ttl.mul_f64(fraction).max(self.min_buffer).min(ttl)
    }
}

// ---------------------------------------------------------------------------
// IdentityManager
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct Current {
    identity: Arc<WorkloadIdentity>,
    expires_at: Instant,
    refresh_at: Instant,
    stale: bool,
}

enum Wake {
    Cancelled,
    Pushed(Option<Result<WorkloadIdentity, IdentitySourceError>>),
    Timer,
}

/// Owns the process's current workload identity and rotates it.
pub struct IdentityManager {
    source: Arc<dyn IdentitySource>,
    settings: RotationSettings,
    current: RwLock<Option<Current>>,
    events: broadcast::Sender<IdentityEvent>,
    cancel: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
    refresh_attempts: AtomicU64,
    audit: Option<Arc<AuditLogger>>,
}

impl IdentityManager {
    /// Manager over `source`. Nothing is fetched until [`initialize`](Self::initialize).
    pub fn new(source: Arc<dyn IdentitySource>, settings: RotationSettings) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            source,
            settings,
            current: RwLock::new(None),
            events,
            cancel: CancellationToken::new(),
            worker: Mutex::new(None),
            refresh_attempts: AtomicU64::new(0),
            audit: None,
        }
    }

    /// Record rotations and expiries in `audit`.
    #[must_use]
    pub fn with_audit(mut self, audit: Arc<AuditLogger>) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Startup fetch. A failure here is fatal for the process.
    ///
    /// # Errors
    ///
    /// Propagates the source failure or rejection of the fetched credential.
    pub async fn initialize(&self) -> Result<Arc<WorkloadIdentity>, IdentityError> {
        let identity = self.refresh_now().await?;
        tracing::info!(
            spiffe_id = %identity.spiffe_id(),
            not_after = %identity.not_after(),
            "workload identity initialized",
        );
        Ok(identity)
    }

    /// Spawn the rotation worker. Calling it twice has no effect.
    pub fn start(self: &Arc<Self>) {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            tracing::debug!("identity rotation worker already running");
            return;
        }
        let pushed = self.source.watch();
        let this = Arc::clone(self);
        *worker = Some(tokio::spawn(async move { this.run(pushed).await }));
    }

    /// The current identity.
    ///
    /// # Errors
    ///
    /// [`IdentityError::NotFetched`] before the first fetch,
    /// [`IdentityError::Expired`] once the identity is stale, and
    /// [`IdentityError::ShutDown`] after shutdown.
    pub fn get_current_identity(&self) -> Result<Arc<WorkloadIdentity>, IdentityError> {
        let current = self.current.read();
        let Some(current) = current.as_ref() else {
            if self.cancel.is_cancelled() {
                return Err(IdentityError::ShutDown);
            }
            return Err(IdentityError::NotFetched);
        };
        if current.stale || Instant::now() >= current.expires_at {
            return Err(IdentityError::Expired {
                spiffe_id: current.identity.spiffe_id().clone(),
                expired_at: current.identity.not_after(),
            });
        }
        Ok(Arc::clone(&current.identity))
    }

    /// Subscribe to identity events from now on.
    ///
    /// The stream is infinite until the manager is dropped; a subscriber that
    /// falls behind skips the events it missed.
    pub fn watch(&self) -> IdentityEvents {
        let stream = BroadcastStream::new(self.events.subscribe()).filter_map(|event| match event {
            Ok(event) => Some(event),
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "identity event subscriber lagged");
                None
            }
        });
        Box::pin(stream)
    }

    /// Fetch from the source now and install the result if it is newer.
    ///
    /// # Errors
    ///
    /// Source failure, timeout, or rejection of the fetched credential.
    pub async fn refresh_now(&self) -> Result<Arc<WorkloadIdentity>, IdentityError> {
        if self.cancel.is_cancelled() {
            return Err(IdentityError::ShutDown);
        }
        self.refresh_attempts.fetch_add(1, Ordering::Relaxed);

        let hint = self
            .current
            .read()
            .as_ref()
            .map(|c| c.identity.spiffe_id().clone());
        let fetched = tokio::time::timeout(self.settings.fetch_timeout, self.source.fetch(hint.as_ref()))
            .await
            .map_err(|_| IdentityError::FetchTimeout(self.settings.fetch_timeout))??;
        self.install(fetched)
    }

    /// Number of fetch attempts made so far (startup, worker and manual).
    pub fn refresh_attempts(&self) -> u64 {
        self.refresh_attempts.load(Ordering::Relaxed)
    }

    /// Stop the worker and drop the current identity.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let worker = self.worker.lock().take();
        if let Some(handle) = worker {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "identity rotation worker ended abnormally");
            }
        }
        *self.current.write() = None;
        tracing::info!("identity manager shut down");
    }

    fn install(&self, identity: WorkloadIdentity) -> Result<Arc<WorkloadIdentity>, IdentityError> {
        let remaining = identity.remaining_at(Utc::now());
        if remaining.is_zero() {
            return Err(IdentityError::Invalid(format!(
                "credential for {} already expired at {}",
                identity.spiffe_id(),
                identity.not_after()
            )));
        }

        let now = Instant::now();
        let lead = self.settings.lead_time(identity.ttl());
        let tracked = remaining.min(MAX_TRACKED_VALIDITY);
        let expires_at = now.checked_add(tracked).unwrap_or(now);
        let refresh_at = now.checked_add(tracked.saturating_sub(lead)).unwrap_or(now);

        let identity = Arc::new(identity);
        {
            let mut current = self.current.write();
            if let Some(existing) = current.as_ref() {
                if identity.not_after() <= existing.identity.not_after() {
                    return Err(IdentityError::Invalid(format!(
                        "credential is not newer than the current one (not_after {})",
                        identity.not_after()
                    )));
                }
                if identity.spiffe_id() != existing.identity.spiffe_id() {
                    tracing::warn!(
                        previous = %existing.identity.spiffe_id(),
                        current = %identity.spiffe_id(),
                        "workload SPIFFE ID changed on rotation",
                    );
                }
            }
            *current = Some(Current {
                identity: Arc::clone(&identity),
                expires_at,
                refresh_at,
                stale: false,
            });
        }

        tracing::info!(
            spiffe_id = %identity.spiffe_id(),
            not_after = %identity.not_after(),
            refresh_in_ms = u64::try_from(tracked.saturating_sub(lead).as_millis()).unwrap_or(u64::MAX),
            "workload identity rotated",
        );
        if let Some(audit) = &self.audit {
            if let Err(e) = audit.log_identity_rotated(&identity) {
                tracing::warn!(error = %e, "failed to write identity rotation audit entry");
            }
        }
        // No subscribers is fine.
        let _ = self.events.send(IdentityEvent::Rotated(Arc::clone(&identity)));
        Ok(identity)
    }

    /// Mark the current identity stale once its expiry has passed.
    fn check_expiry(&self) {
        let expired = {
            let mut current = self.current.write();
            match current.as_mut() {
                Some(c) if !c.stale && Instant::now() >= c.expires_at => {
                    c.stale = true;
                    Some((c.identity.spiffe_id().clone(), c.identity.not_after()))
                }
                _ => None,
            }
        };
        let Some((spiffe_id, expired_at)) = expired else {
            return;
        };

        tracing::warn!(
            spiffe_id = %spiffe_id,
            expired_at = %expired_at,
            "workload identity expired before a refresh succeeded",
        );
        if let Some(audit) = &self.audit {
            if let Err(e) = audit.log_identity_expired(&spiffe_id, expired_at) {
                tracing::warn!(error = %e, "failed to write identity expiry audit entry");
            }
        }
        let _ = self.events.send(IdentityEvent::Expired {
            spiffe_id,
            expired_at,
        });
    }

    /// When the next fetch should happen after a failure.
    fn retry_at(&self, failure_delay: Duration) -> Instant {
        let now = Instant::now();
        let delay = match self.current.read().as_ref() {
            Some(c) if !c.stale => {
                let remaining = c.expires_at.saturating_duration_since(now);
                failure_delay.min(remaining / 2).max(MIN_RETRY_DELAY)
            }
            _ => failure_delay.max(MIN_RETRY_DELAY),
        };
        now.checked_add(delay).unwrap_or(now)
    }

    fn next_expiry(&self) -> Option<Instant> {
        self.current
            .read()
            .as_ref()
            .filter(|c| !c.stale)
            .map(|c| c.expires_at)
    }

    fn scheduled_refresh(&self) -> Instant {
        self.current
            .read()
            .as_ref()
            .filter(|c| !c.stale)
            .map_or_else(Instant::now, |c| c.refresh_at)
    }

    async fn run(self: Arc<Self>, mut pushed: Option<IdentityStream>) {
        tracing::debug!("identity rotation worker started");
        let mut next_attempt = self.scheduled_refresh();
        let mut failure_delay = self.settings.initial_backoff;

        loop {
            let wake_at = match self.next_expiry() {
                Some(expiry) => next_attempt.min(expiry),
                None => next_attempt,
            };

            let wake = tokio::select! {
                () = self.cancel.cancelled() => Wake::Cancelled,
                item = next_pushed(&mut pushed) => Wake::Pushed(item),
                () = tokio::time::sleep_until(wake_at) => Wake::Timer,
            };

            match wake {
                Wake::Cancelled => break,
                Wake::Pushed(None) => {
                    tracing::debug!("identity source push stream ended; polling only");
                    pushed = None;
                }
                Wake::Pushed(Some(Ok(identity))) => match self.install(identity) {
                    Ok(_) => {
                        failure_delay = self.settings.initial_backoff;
                        next_attempt = self.scheduled_refresh();
                    }
                    Err(e) => tracing::debug!(error = %e, "ignored pushed identity"),
                },
                Wake::Pushed(Some(Err(e))) => {
                    tracing::warn!(error = %e, "identity source push stream reported an error");
                }
                Wake::Timer => {
                    self.check_expiry();
                    if Instant::now() < next_attempt {
                        continue;
                    }
                    let refreshed = tokio::select! {
                        () = self.cancel.cancelled() => break,
                        result = self.refresh_now() => result,
                    };
                    match refreshed {
                        Ok(_) => {
                            failure_delay = self.settings.initial_backoff;
                            next_attempt = self.scheduled_refresh();
                        }
                        Err(IdentityError::ShutDown) => break,
                        Err(e) => {
                            next_attempt = self.retry_at(failure_delay);
                            tracing::warn!(
                                error = %e,
                                retry_in_ms = u64::try_from(
                                    next_attempt.saturating_duration_since(Instant::now()).as_millis()
                                ).unwrap_or(u64::MAX),
                                "identity refresh failed",
                            );
                            failure_delay = failure_delay
                                .saturating_mul(2)
                                .min(self.settings.max_backoff);
                        }
                    }
                }
            }
        }
        tracing::debug!("identity rotation worker stopped");
    }
}

async fn next_pushed(
    stream: &mut Option<IdentityStream>,
) -> Option<Result<WorkloadIdentity, IdentitySourceError>> {
    match stream {
        Some(stream) => stream.next().await,
        None => std::future::pending().await,
    }
}

impl std::fmt::Debug for IdentityManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityManager")
            .field("settings", &self.settings)
            .field("refresh_attempts", &self.refresh_attempts())
            .finish_non_exhaustive()
    }
}
