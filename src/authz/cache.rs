//! Bounded TTL cache of policy decisions with invalidation fencing.
//!
//! Every invalidation bumps a generation counter. An evaluation records the
//! generation before it calls the policy service and may only insert its
//! result if the generation is unchanged, so a decision computed against a
//! policy that was invalidated mid-flight never lands in the cache.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

use super::AuthorizationDecision;
use crate::types::SpiffeId;

/// Cache key. Context is deliberately not part of it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    /// Calling workload.
    pub caller: SpiffeId,
    /// Called workload.
    pub resource: SpiffeId,
    /// Requested action.
    pub action: String,
}

#[derive(Debug)]
struct Entry {
    decision: AuthorizationDecision,
    expires_at: Instant,
    seq: u64,
}

#[derive(Debug, Default)]
struct Inner {
    entries: HashMap<CacheKey, Entry>,
    generation: u64,
    next_seq: u64,
}

#[derive(Debug)]
pub(crate) struct DecisionCache {
    capacity: usize,
    inner: Mutex<Inner>,
}

impl DecisionCache {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(Inner::default()),
        }
    }

    /// A live entry for `key`. Expired entries are dropped on the way.
    pub(crate) fn get(&self, key: &CacheKey) -> Option<AuthorizationDecision> {
        let mut inner = self.inner.lock();
        let expired = match inner.entries.get(key) {
            Some(entry) if Instant::now() < entry.expires_at => {
                return Some(entry.decision.clone());
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            inner.entries.remove(key);
        }
        None
    }

    pub(crate) fn generation(&self) -> u64 {
        self.inner.lock().generation
    }

    /// Insert unless an invalidation happened since `generation` was read.
    pub(crate) fn insert_if_current(
        &self,
        key: CacheKey,
        decision: AuthorizationDecision,
        ttl: Duration,
        generation: u64,
    ) -> bool {
        if ttl.is_zero() {
            return false;
        }
        let now = Instant::now();
        let Some(expires_at) = now.checked_add(ttl) else {
            return false;
        };

        let mut inner = self.inner.lock();
        if inner.generation != generation {
            return false;
        }

        if !inner.entries.contains_key(&key) && inner.entries.len() >= self.capacity {
            inner.entries.retain(|_, entry| now < entry.expires_at);
            if inner.entries.len() >= self.capacity {
                let oldest = inner
                    .entries
                    .iter()
                    .min_by_key(|(_, entry)| entry.seq)
                    .map(|(key, _)| key.clone());
                if let Some(oldest) = oldest {
                    inner.entries.remove(&oldest);
                }
            }
        }

        let seq = inner.next_seq;
        inner.next_seq = seq.saturating_add(1);
        inner.entries.insert(
            key,
            Entry {
                decision,
                expires_at,
                seq,
            },
        );
        true
    }

    /// Drop every entry matching `predicate` and fence in-flight evaluations.
    pub(crate) fn invalidate(&self, predicate: impl Fn(&CacheKey) -> bool) -> usize {
        let mut inner = self.inner.lock();
        inner.generation = inner.generation.saturating_add(1);
        let before = inner.entries.len();
        inner.entries.retain(|key, _| !predicate(key));
        before.saturating_sub(inner.entries.len())
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }
}
