//! Per-destination channel pool and the lease handed to callers.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;

use super::{Channel, QueueMode, TransportError};
use crate::breaker::{BreakerMetrics, BreakerPermit, BreakerSettings, CircuitBreaker};
use crate::types::SpiffeId;

struct IdleChannel {
    channel: Box<dyn Channel>,
    idle_since: Instant,
    generation: u64,
}

/// Pool state for one destination identity.
pub(crate) struct DestinationPool {
    destination: SpiffeId,
    max_channels: usize,
    slots: Arc<Semaphore>,
    waiters: AtomicUsize,
    idle: Mutex<Vec<IdleChannel>>,
    breaker: Arc<CircuitBreaker>,
    closed: AtomicBool,
}

impl DestinationPool {
    pub(crate) fn new(destination: SpiffeId, max_channels: usize, breaker: BreakerSettings) -> Self {
        let max_channels = max_channels.max(1);
        Self {
            breaker: Arc::new(CircuitBreaker::new(destination.to_string(), breaker)),
            destination,
            max_channels,
            slots: Arc::new(Semaphore::new(max_channels)),
            waiters: AtomicUsize::new(0),
            idle: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub(crate) fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Reserve one of the destination's concurrent-channel slots.
    pub(crate) async fn acquire_slot(&self, mode: QueueMode) -> Result<OwnedSemaphorePermit, TransportError> {
        if let Ok(permit) = Arc::clone(&self.slots).try_acquire_owned() {
            return Ok(permit);
        }
        let (max_waiters, max_wait) = match mode {
            QueueMode::FailFast => return Err(TransportError::PoolExhausted),
            QueueMode::Queue {
                max_waiters,
                max_wait,
            } => (max_waiters, max_wait),
        };

        let queued = self
            .waiters
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < max_waiters).then(|| n.saturating_add(1))
            })
            .is_ok();
        if !queued {
            return Err(TransportError::PoolExhausted);
        }
        let _waiting = WaiterGuard(&self.waiters);

        match tokio::time::timeout(max_wait, Arc::clone(&self.slots).acquire_owned()).await {
            Ok(Ok(permit)) => Ok(permit),
            Ok(Err(_)) => Err(TransportError::ShutDown),
            Err(_) => Err(TransportError::PoolExhausted),
        }
    }

    /// Newest idle channel that is healthy, current and not idle-expired.
    /// Everything unusable found on the way is closed.
    pub(crate) fn take_idle(&self, generation: u64, idle_timeout: Duration) -> Option<Box<dyn Channel>> {
        let mut idle = self.idle.lock();
        while let Some(entry) = idle.pop() {
            if entry.generation == generation
                && entry.channel.is_healthy()
                && entry.idle_since.elapsed() < idle_timeout
            {
                return Some(entry.channel);
            }
            tracing::debug!(destination = %self.destination, "closing unusable idle channel");
        }
        None
    }

    fn put_idle(&self, channel: Box<dyn Channel>, generation: u64) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        self.idle.lock().push(IdleChannel {
            channel,
            idle_since: Instant::now(),
            generation,
        });
    }

    /// Close idle channels that are expired, unhealthy or from an older
    /// generation. Returns how many were closed.
    pub(crate) fn evict_idle(&self, generation: u64, idle_timeout: Duration) -> usize {
        let mut idle = self.idle.lock();
        let before = idle.len();
        idle.retain(|entry| {
            entry.generation == generation
                && entry.channel.is_healthy()
                && entry.idle_since.elapsed() < idle_timeout
        });
        before.saturating_sub(idle.len())
    }

    pub(crate) fn clear_idle(&self) -> usize {
        let mut idle = self.idle.lock();
        let closed = idle.len();
        idle.clear();
        closed
    }

    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.clear_idle();
    }

    pub(crate) fn in_use(&self) -> usize {
        self.max_channels.saturating_sub(self.slots.available_permits())
    }

    /// Nothing idle, nothing leased, nobody waiting and a healthy breaker.
    pub(crate) fn is_unused(&self) -> bool {
        let metrics = self.breaker.metrics();
        self.idle.lock().is_empty()
            && self.in_use() == 0
            && self.waiters.load(Ordering::SeqCst) == 0
            && metrics.failure_count == 0
            && metrics.state == crate::breaker::CircuitState::Closed
    }

    /// Unused, and referenced only by the caller's handle. A caller between
    /// looking the pool up and taking a slot holds its own reference.
    pub(crate) fn is_evictable(self: &Arc<Self>) -> bool {
        Arc::strong_count(self) == 1 && self.is_unused()
    }

    pub(crate) fn stats(&self) -> PoolStats {
        PoolStats {
            idle: self.idle.lock().len(),
            in_use: self.in_use(),
            waiters: self.waiters.load(Ordering::SeqCst),
            max_channels: self.max_channels,
            breaker: self.breaker.metrics(),
        }
    }
}

struct WaiterGuard<'a>(&'a AtomicUsize);

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Snapshot of one destination's pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Channels parked in the pool.
    pub idle: usize,
    /// Slots currently leased.
    pub in_use: usize,
    /// Callers queued for a slot.
    pub waiters: usize,
    /// Concurrent-channel bound.
    pub max_channels: usize,
    /// Destination breaker counters.
    pub breaker: BreakerMetrics,
}

/// Exclusive use of one channel to a destination.
///
/// Dropping the lease releases the concurrency slot. The channel goes back to
/// the pool only if the last exchange completed cleanly; a lease dropped
/// between send and receive (for example on cancellation) discards it.
pub struct ChannelLease {
    pool: Arc<DestinationPool>,
    channel: Option<Box<dyn Channel>>,
    generation: u64,
    current_generation: Arc<AtomicU64>,
    breaker: Option<BreakerPermit>,
    in_flight: bool,
    dirty: bool,
    attempts: u32,
    reused: bool,
    _slot: OwnedSemaphorePermit,
}

impl ChannelLease {
    pub(crate) fn new(
        pool: Arc<DestinationPool>,
        slot: OwnedSemaphorePermit,
        breaker: BreakerPermit,
        channel: Box<dyn Channel>,
        generation: u64,
        current_generation: Arc<AtomicU64>,
        reused: bool,
    ) -> Self {
        Self {
            pool,
            channel: Some(channel),
            generation,
            current_generation,
            breaker: Some(breaker),
            in_flight: false,
            dirty: false,
            attempts: 0,
            reused,
            _slot: slot,
        }
    }

    /// Destination this lease talks to.
    pub fn destination(&self) -> &SpiffeId {
        &self.pool.destination
    }

    /// Verified identity of the connected peer, if a channel is held.
    pub fn peer_identity(&self) -> Option<&SpiffeId> {
        self.channel.as_ref().map(|c| c.peer_identity())
    }

    /// Send attempts made through this lease.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Whether the channel came from the idle pool rather than a fresh dial.
    pub fn reused(&self) -> bool {
        self.reused
    }

    /// Mark the exchange failed. The channel will not be pooled and, when the
    /// error reflects destination health, the breaker records a failure.
    pub fn fail(&mut self, err: &TransportError) {
        self.dirty = true;
        if let Some(permit) = self.breaker.take() {
            if err.counts_against_breaker() {
                permit.failure();
            }
        }
    }

    pub(crate) fn channel_mut(&mut self) -> Option<&mut Box<dyn Channel>> {
        self.channel.as_mut()
    }

    pub(crate) fn replace_channel(&mut self, channel: Box<dyn Channel>, generation: u64) {
        self.channel = Some(channel);
        self.generation = generation;
        self.in_flight = false;
        self.reused = false;
    }

    pub(crate) fn discard_channel(&mut self) {
        if self.channel.take().is_some() {
            tracing::debug!(destination = %self.pool.destination, "discarding broken channel");
        }
        self.in_flight = false;
    }

    pub(crate) fn note_attempt(&mut self) {
        self.attempts = self.attempts.saturating_add(1);
    }

    pub(crate) fn begin_exchange(&mut self) {
        self.in_flight = true;
    }

    /// Response received: the channel is reusable and the destination healthy.
    pub(crate) fn complete_exchange(&mut self) {
        self.in_flight = false;
        if let Some(permit) = self.breaker.take() {
            permit.success();
        }
    }
}

impl Drop for ChannelLease {
    fn drop(&mut self) {
        let Some(channel) = self.channel.take() else {
            return;
        };
        let current = self.current_generation.load(Ordering::SeqCst);
        if !self.in_flight && !self.dirty && channel.is_healthy() && self.generation == current {
            self.pool.put_idle(channel, self.generation);
        } else {
            tracing::debug!(
                destination = %self.pool.destination,
                in_flight = self.in_flight,
                dirty = self.dirty,
                stale = self.generation != current,
                "closing channel instead of pooling it",
            );
        }
    }
}

impl std::fmt::Debug for ChannelLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelLease")
            .field("destination", &self.pool.destination)
            .field("generation", &self.generation)
            .field("attempts", &self.attempts)
            .field("in_flight", &self.in_flight)
            .finish_non_exhaustive()
    }
}
