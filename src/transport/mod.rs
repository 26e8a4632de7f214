//! Pooled, mutually authenticated channels to destination workloads.
//!
//! Every destination identity gets a pool entry with a concurrency bound,
//! an idle list and its own circuit breaker. A dial is accepted only when the
//! handshake-presented identity belongs to the destination's trust domain and
//! equals the expected destination exactly; a mismatch is a security event and
//! is never retried.
//!
//! Rotation of the local identity bumps a material generation: idle channels
//! from older generations are closed and new dials pick up the new material.

mod pool;
mod tls;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use rustls::pki_types::CertificateDer;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::audit::AuditLogger;
use crate::breaker::BreakerSettings;
use crate::identity::{IdentityError, IdentityEvent, IdentityManager, WorkloadIdentity};
use crate::retry::{RetryPolicy, Retryable};
use crate::trust::{FederationError, TrustBundle, TrustBundleStore};
use crate::types::SpiffeId;

pub use pool::{ChannelLease, PoolStats};
pub use tls::{read_frame, write_frame, Endpoint, InboundServer, MtlsConnector, MAX_FRAME_LEN};

use pool::DestinationPool;

const MIN_JANITOR_INTERVAL: Duration = Duration::from_millis(100);

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Transport failures.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Dial or I/O failure.
    #[error("connection failed: {0}")]
    Connection(String),
    /// A bounded operation did not finish in time.
    #[error("{operation} timed out")]
    Timeout {
        /// Operation that timed out.
        operation: &'static str,
    },
    /// The peer is not who we expected.
    #[error("peer verification failed: expected {expected}, presented {}", presented_label(.presented))]
    PeerVerification {
        /// Identity we dialed.
        expected: SpiffeId,
        /// Identity the handshake produced, if any.
        presented: Option<SpiffeId>,
    },
    /// The destination breaker is open.
    #[error("circuit open for destination")]
    CircuitOpen,
    /// Concurrency bound reached and queueing is off or full.
    #[error("connection pool exhausted")]
    PoolExhausted,
    /// Malformed frame.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// An inbound peer's certificate did not verify against the trust bundle.
    #[error("untrusted peer: {0}")]
    UntrustedPeer(String),
    /// No trust bundle for the destination's domain.
    #[error(transparent)]
    Federation(#[from] FederationError),
    /// No usable local identity.
    #[error(transparent)]
    Identity(#[from] IdentityError),
    /// No endpoint is known for the destination.
    #[error("no endpoint for {0}")]
    UnknownDestination(SpiffeId),
    /// Local TLS configuration could not be built.
    #[error("tls configuration error: {0}")]
    Tls(String),
    /// The transport was shut down.
    #[error("transport is shut down")]
    ShutDown,
}

fn presented_label(presented: &Option<SpiffeId>) -> String {
    presented
        .as_ref()
        .map_or_else(|| "no valid identity".to_owned(), ToString::to_string)
}

impl TransportError {
    /// Whether this failure says something about the destination's health.
    pub fn counts_against_breaker(&self) -> bool {
        matches!(
            self,
            Self::Connection(_) | Self::Timeout { .. } | Self::PeerVerification { .. }
        )
    }
}

impl Retryable for TransportError {
    fn is_transient(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::Timeout { .. })
    }
}

// ---------------------------------------------------------------------------
// Channel and connector seams
// ---------------------------------------------------------------------------

/// One established, authenticated, bidirectional frame channel.
#[async_trait]
pub trait Channel: Send {
    /// Identity the peer proved during the handshake.
    fn peer_identity(&self) -> &SpiffeId;

    /// Whether the channel can still carry frames.
    fn is_healthy(&self) -> bool;

    /// Write one frame.
    async fn send(&mut self, frame: &[u8]) -> Result<(), TransportError>;

    /// Read one frame.
    async fn recv(&mut self) -> Result<Vec<u8>, TransportError>;
}

/// Everything a connector needs to dial one destination.
#[derive(Debug, Clone)]
pub struct DialTarget {
    /// Identity expected on the other end.
    pub destination: SpiffeId,
    /// Anchors of the destination's trust domain.
    pub bundle: Arc<TrustBundle>,
    /// Local identity to present.
    pub identity: Arc<WorkloadIdentity>,
}

/// Establishes channels. The TLS implementation is [`MtlsConnector`].
#[async_trait]
pub trait Connector: Send + Sync {
    /// Dial and handshake. The returned channel reports the identity the
    /// peer presented; the manager compares it with the destination.
    async fn connect(&self, target: DialTarget) -> Result<Box<dyn Channel>, TransportError>;

    /// The local identity rotated; drop cached material.
    fn refresh_material(&self, _identity: &WorkloadIdentity) {}
}

/// Receives frames from the inbound listener.
#[async_trait]
pub trait InboundHandler: Send + Sync {
    /// Handle one request frame and produce the response frame.
    async fn handle_frame(&self, peer: &VerifiedPeer, frame: Vec<u8>) -> Vec<u8>;
}

/// A peer identity established by certificate verification.
///
/// Only produced by the inbound TLS handshake or by
/// [`VerifiedPeer::from_certificates`], which checks the chain against a
/// trust bundle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedPeer {
    spiffe_id: SpiffeId,
}

impl VerifiedPeer {
    pub(crate) fn new(spiffe_id: SpiffeId) -> Self {
        Self { spiffe_id }
    }

    /// Verify `chain` (leaf first) against `bundle` as a client certificate
    /// and take the SPIFFE ID from the leaf.
    ///
    /// # Errors
    ///
    /// [`TransportError::UntrustedPeer`] when the chain does not verify or
    /// the leaf belongs to another trust domain.
    pub fn from_certificates(
        chain: &[CertificateDer<'static>],
        bundle: &TrustBundle,
    ) -> Result<Self, TransportError> {
        tls::verify_client_chain(chain, bundle).map(Self::new)
    }

    /// The verified identity.
    pub fn spiffe_id(&self) -> &SpiffeId {
        &self.spiffe_id
    }
}

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

/// Behavior when a destination is at its concurrency bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueMode {
    /// Fail immediately with [`TransportError::PoolExhausted`].
    FailFast,
    /// Wait for a slot.
    Queue {
        /// Callers allowed to wait at once.
        max_waiters: usize,
        /// Longest wait for a slot.
        max_wait: Duration,
    },
}

/// Transport configuration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransportSettings {
    /// Concurrent channels per destination.
    pub max_channels_per_destination: usize,
    /// Idle channels older than this are closed.
    pub idle_timeout: Duration,
    /// Behavior at the concurrency bound.
    pub queue_mode: QueueMode,
    /// Bound on dial plus handshake.
    pub dial_timeout: Duration,
    /// Retry of transient dial and send failures.
    pub retry: RetryPolicy,
    /// Per-destination breaker thresholds.
    pub breaker: BreakerSettings,
    /// Period of the idle-channel janitor.
    pub janitor_interval: Duration,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            max_channels_per_destination: 4,
            idle_timeout: Duration::from_secs(300),
            queue_mode: QueueMode::Queue {
                max_waiters: 16,
                max_wait: Duration::from_secs(5),
            },
            dial_timeout: Duration::from_secs(10),
            retry: RetryPolicy::default(),
            breaker: BreakerSettings::default(),
            janitor_interval: Duration::from_secs(30),
        }
    }
}

/// Transport-wide counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransportStats {
    /// Completed dials (handshake finished, before identity comparison).
    pub dials: u64,
    /// Retries after transient failures.
    pub retries: u64,
    /// Leases served from the idle pool.
    pub reuses: u64,
    /// Dials rejected for presenting the wrong identity.
    pub peer_verification_failures: u64,
    /// Current TLS material generation.
    pub generation: u64,
}

// ---------------------------------------------------------------------------
// TransportManager
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct Counters {
    dials: AtomicU64,
    retries: AtomicU64,
    reuses: AtomicU64,
    peer_verification_failures: AtomicU64,
}

/// Owns all outbound channel pools.
pub struct TransportManager {
    connector: Arc<dyn Connector>,
    trust: Arc<TrustBundleStore>,
    identity: Arc<IdentityManager>,
    settings: TransportSettings,
    pools: RwLock<HashMap<SpiffeId, Arc<DestinationPool>>>,
    generation: Arc<AtomicU64>,
    counters: Counters,
    audit: Option<Arc<AuditLogger>>,
    cancel: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl TransportManager {
    /// Manager dialing through `connector`.
    pub fn new(
        connector: Arc<dyn Connector>,
        trust: Arc<TrustBundleStore>,
        identity: Arc<IdentityManager>,
        settings: TransportSettings,
    ) -> Self {
        Self {
            connector,
            trust,
            identity,
            settings,
            pools: RwLock::new(HashMap::new()),
            generation: Arc::new(AtomicU64::new(0)),
            counters: Counters::default(),
            audit: None,
            cancel: CancellationToken::new(),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Record peer verification failures in `audit`.
    #[must_use]
    pub fn with_audit(mut self, audit: Arc<AuditLogger>) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Spawn the janitor and the identity-rotation listener.
    pub fn start(self: &Arc<Self>) {
        let mut workers = self.workers.lock();
        if !workers.is_empty() {
            return;
        }

        let this = Arc::clone(self);
        workers.push(tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(this.settings.janitor_interval.max(MIN_JANITOR_INTERVAL));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    () = this.cancel.cancelled() => break,
                    _ = ticker.tick() => { this.sweep(); }
                }
            }
        }));

        let this = Arc::clone(self);
        let mut events = self.identity.watch();
        workers.push(tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    () = this.cancel.cancelled() => break,
                    event = events.next() => event,
                };
                match event {
                    Some(IdentityEvent::Rotated(identity)) => this.on_rotation(&identity),
                    Some(IdentityEvent::Expired { spiffe_id, .. }) => {
                        tracing::warn!(
                            spiffe_id = %spiffe_id,
                            "local identity expired; new dials will fail until it is refreshed",
                        );
                    }
                    None => break,
                }
            }
        }));
    }

    /// Lease a channel to `destination`, reusing an idle one when possible.
    ///
    /// # Errors
    ///
    /// [`TransportError::CircuitOpen`] and [`TransportError::PoolExhausted`]
    /// fail fast without a network attempt. Dial failures are retried when
    /// transient; [`TransportError::PeerVerification`] never is.
    pub async fn acquire_channel(&self, destination: &SpiffeId) -> Result<ChannelLease, TransportError> {
        if self.cancel.is_cancelled() {
            return Err(TransportError::ShutDown);
        }
        let domain = destination.trust_domain();
        if !self.trust.is_configured(domain) {
            // Channels pooled while the domain was trusted must not be reused.
            self.close_domain(domain);
            return Err(FederationError::NotConfigured {
                domain: domain.to_owned(),
            }
            .into());
        }
        let pool = self.pool_for(destination);

        let permit = pool.breaker().try_acquire().map_err(|open| {
            tracing::debug!(destination = %destination, breaker = %open.state, "destination breaker open");
            TransportError::CircuitOpen
        })?;
        let slot = pool.acquire_slot(self.settings.queue_mode).await?;

        let generation = self.generation.load(Ordering::SeqCst);
        if let Some(channel) = pool.take_idle(generation, self.settings.idle_timeout) {
            self.counters.reuses.fetch_add(1, Ordering::Relaxed);
            return Ok(ChannelLease::new(
                pool,
                slot,
                permit,
                channel,
                generation,
                Arc::clone(&self.generation),
                true,
            ));
        }

        match self.dial_with_retry(destination).await {
            Ok((channel, generation)) => Ok(ChannelLease::new(
                pool,
                slot,
                permit,
                channel,
                generation,
                Arc::clone(&self.generation),
                false,
            )),
            Err(e) => {
                if e.counts_against_breaker() {
                    permit.failure();
                }
                Err(e)
            }
        }
    }

    /// Send `frame` on the lease, retrying transient failures on a freshly
    /// dialed channel with non-decreasing backoff.
    ///
    /// # Errors
    ///
    /// The last error once attempts are exhausted, or the first
    /// non-retryable error.
    pub async fn send_with_retry(&self, lease: &mut ChannelLease, frame: &[u8]) -> Result<(), TransportError> {
        let attempts = self.settings.retry.attempts();
        let mut backoff = self.settings.retry.backoff();

        loop {
            let result = self.send_once(lease, frame).await;
            let err = match result {
                Ok(()) => return Ok(()),
                Err(err) => err,
            };

            if !err.is_transient() || lease.attempts() >= attempts {
                tracing::debug!(
                    destination = %lease.destination(),
                    attempts = lease.attempts(),
                    error = %err,
                    "send failed",
                );
                lease.fail(&err);
                return Err(err);
            }

            lease.discard_channel();
            self.counters.retries.fetch_add(1, Ordering::Relaxed);
            let delay = backoff.next_delay();
            tracing::debug!(
                destination = %lease.destination(),
                attempt = lease.attempts(),
                max_attempts = attempts,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                error = %err,
                "transient send failure, retrying after backoff",
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// Wait for the response frame until `deadline`.
    ///
    /// # Errors
    ///
    /// [`TransportError::Timeout`] at the deadline, or the channel failure.
    pub async fn receive(&self, lease: &mut ChannelLease, deadline: Instant) -> Result<Vec<u8>, TransportError> {
        let result = match lease.channel_mut() {
            Some(channel) => tokio::time::timeout_at(deadline, channel.recv())
                .await
                .unwrap_or(Err(TransportError::Timeout {
                    operation: "receive",
                })),
            None => Err(TransportError::Connection("lease holds no channel".to_owned())),
        };
        match result {
            Ok(frame) => {
                lease.complete_exchange();
                Ok(frame)
            }
            Err(e) => {
                lease.fail(&e);
                Err(e)
            }
        }
    }

    /// Tear down a destination's pool entry and breaker. Outstanding leases
    /// close their channels on drop.
    pub fn remove_destination(&self, destination: &SpiffeId) -> bool {
        let removed = self.pools.write().remove(destination);
        match removed {
            Some(pool) => {
                pool.close();
                tracing::info!(destination = %destination, "destination removed from transport");
                true
            }
            None => false,
        }
    }

    /// Stop trusting a federated domain and close every pool to destinations
    /// in it. Returns the number of destinations torn down.
    pub fn remove_trust_domain(&self, domain: &str) -> usize {
        self.trust.remove_domain(domain);
        self.close_domain(domain)
    }

    fn close_domain(&self, domain: &str) -> usize {
        let mut closed = 0usize;
        self.pools.write().retain(|destination, pool| {
            if destination.trust_domain() != domain {
                return true;
            }
            pool.close();
            closed = closed.saturating_add(1);
            false
        });
        if closed > 0 {
            tracing::info!(
                trust_domain = domain,
                destinations = closed,
                "closed pools for untrusted domain",
            );
        }
        closed
    }

    /// Pool snapshot for one destination.
    pub fn pool_stats(&self, destination: &SpiffeId) -> Option<PoolStats> {
        self.pools.read().get(destination).map(|pool| pool.stats())
    }

    /// Transport-wide counters.
    pub fn stats(&self) -> TransportStats {
        TransportStats {
            dials: self.counters.dials.load(Ordering::Relaxed),
            retries: self.counters.retries.load(Ordering::Relaxed),
            reuses: self.counters.reuses.load(Ordering::Relaxed),
            peer_verification_failures: self
                .counters
                .peer_verification_failures
                .load(Ordering::Relaxed),
            generation: self.generation.load(Ordering::SeqCst),
        }
    }

    /// Close idle-expired and stale channels and forget unused destinations.
    /// Returns the number of channels closed.
    pub fn sweep(&self) -> usize {
        let generation = self.generation.load(Ordering::SeqCst);
        let mut closed = 0usize;
        let mut pools = self.pools.write();
        pools.retain(|destination, pool| {
            closed = closed.saturating_add(pool.evict_idle(generation, self.settings.idle_timeout));
            let keep = !pool.is_evictable();
            if !keep {
                tracing::debug!(destination = %destination, "forgetting unused destination");
            }
            keep
        });
        if closed > 0 {
            tracing::debug!(closed, "janitor closed idle channels");
        }
        closed
    }

    /// Stop background workers and close every pooled channel.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let workers: Vec<_> = self.workers.lock().drain(..).collect();
        for handle in workers {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "transport worker ended abnormally");
            }
        }
        for pool in self.pools.write().drain().map(|(_, pool)| pool) {
            pool.close();
        }
        tracing::info!("transport shut down");
    }

    fn pool_for(&self, destination: &SpiffeId) -> Arc<DestinationPool> {
        if let Some(pool) = self.pools.read().get(destination) {
            return Arc::clone(pool);
        }
        let mut pools = self.pools.write();
        Arc::clone(pools.entry(destination.clone()).or_insert_with(|| {
            Arc::new(DestinationPool::new(
                destination.clone(),
                self.settings.max_channels_per_destination,
                self.settings.breaker,
            ))
        }))
    }

    fn on_rotation(&self, identity: &WorkloadIdentity) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst).saturating_add(1);
        self.connector.refresh_material(identity);
        let closed: usize = self.pools.read().values().map(|pool| pool.clear_idle()).sum();
        tracing::info!(
            spiffe_id = %identity.spiffe_id(),
            generation,
            closed_idle = closed,
            "transport material refreshed after identity rotation",
        );
    }

    async fn send_once(&self, lease: &mut ChannelLease, frame: &[u8]) -> Result<(), TransportError> {
        lease.note_attempt();
        if lease.channel_mut().is_none() {
            let destination = lease.destination().clone();
            let (channel, generation) = self.dial(&destination).await?;
            lease.replace_channel(channel, generation);
        }
        lease.begin_exchange();
        match lease.channel_mut() {
            Some(channel) => channel.send(frame).await,
            None => Err(TransportError::Connection("lease holds no channel".to_owned())),
        }
    }

    async fn dial_with_retry(
        &self,
        destination: &SpiffeId,
    ) -> Result<(Box<dyn Channel>, u64), TransportError> {
        let attempts = self.settings.retry.attempts();
        let mut backoff = self.settings.retry.backoff();
        let mut attempt = 1u32;
        loop {
            match self.dial(destination).await {
                Ok(dialed) => return Ok(dialed),
                Err(e) if e.is_transient() && attempt < attempts => {
                    self.counters.retries.fetch_add(1, Ordering::Relaxed);
                    let delay = backoff.next_delay();
                    tracing::debug!(
                        destination = %destination,
                        attempt,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %e,
                        "transient dial failure, retrying after backoff",
                    );
                    attempt = attempt.saturating_add(1);
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn dial(&self, destination: &SpiffeId) -> Result<(Box<dyn Channel>, u64), TransportError> {
        let generation = self.generation.load(Ordering::SeqCst);
        let identity = self.identity.get_current_identity()?;
        let bundle = self.trust.get_bundle(destination.trust_domain()).await?;
        let target = DialTarget {
            destination: destination.clone(),
            bundle: Arc::clone(&bundle),
            identity,
        };

        let channel = tokio::time::timeout(self.settings.dial_timeout, self.connector.connect(target))
            .await
            .map_err(|_| TransportError::Timeout { operation: "dial" })?;
        let channel = match channel {
            Ok(channel) => channel,
            Err(TransportError::PeerVerification { presented, .. }) => {
                let err = TransportError::PeerVerification {
                    expected: destination.clone(),
                    presented,
                };
                self.report_peer_mismatch(&err, "handshake rejected peer certificate");
                return Err(err);
            }
            Err(e) => return Err(e),
        };
        self.counters.dials.fetch_add(1, Ordering::Relaxed);

        let presented = channel.peer_identity();
        if presented.trust_domain() != bundle.trust_domain() || presented != destination {
            let err = TransportError::PeerVerification {
                expected: destination.clone(),
                presented: Some(presented.clone()),
            };
            self.report_peer_mismatch(&err, "presented identity differs from destination");
            return Err(err);
        }
        Ok((channel, generation))
    }

    fn report_peer_mismatch(&self, err: &TransportError, detail: &str) {
        self.counters
            .peer_verification_failures
            .fetch_add(1, Ordering::Relaxed);
        let TransportError::PeerVerification { expected, presented } = err else {
            return;
        };
        tracing::warn!(
            security_event = "peer_verification_failed",
            expected = %expected,
            presented = %presented
                .as_ref()
                .map_or_else(|| "none".to_owned(), ToString::to_string),
            detail,
            "peer identity verification failed",
        );
        if let Some(audit) = &self.audit {
            if let Err(e) = audit.log_peer_verification_failed(expected, presented.as_ref(), detail) {
                tracing::warn!(error = %e, "failed to write peer verification audit entry");
            }
        }
    }
}

impl std::fmt::Debug for TransportManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportManager")
            .field("settings", &self.settings)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}
