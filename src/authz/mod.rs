//! Authorization decisions against a remote policy service.
//!
//! [`AuthorizationEngine::check`] is fail-closed: a cached decision is served
//! without a network call; otherwise an open breaker or any service failure
//! yields a deny with outcome [`DecisionOutcome::Unavailable`], regardless of
//! the configured default action or mode. "No matching rule" is a separate
//! outcome that resolves to the configured default action.

mod cache;
mod client;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::audit::AuditLogger;
use crate::breaker::{BreakerMetrics, BreakerSettings, CircuitBreaker};
use crate::types::SpiffeId;

use cache::DecisionCache;
pub use cache::CacheKey;
pub use client::{HttpPolicyService, PolicyInput, PolicyService, PolicyServiceError, PolicyVerdict};

/// Reason attached to every infrastructure-failure deny.
pub const UNAVAILABLE_REASON: &str = "policy engine unavailable";

// ---------------------------------------------------------------------------
// Decision
// ---------------------------------------------------------------------------

/// How a decision was reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionOutcome {
    /// A rule allowed the call.
    Allowed,
    /// A rule denied the call.
    Denied,
    /// No rule matched; the default action applied.
    NoMatchingRule,
    /// The policy service could not be consulted.
    Unavailable,
    /// A policy deny was turned into an allow by log-only mode.
    LogOnlyOverride,
}

/// Result of an authorization check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizationDecision {
    /// Whether the call may proceed.
    pub allow: bool,
    /// How the decision was reached.
    pub outcome: DecisionOutcome,
    /// Human-readable explanation.
    pub reason: String,
    /// Rule that decided, when one matched.
    pub policy_id: Option<String>,
    /// When the policy service produced the decision.
    pub evaluated_at: DateTime<Utc>,
    /// How long the decision may be cached.
    pub ttl: Duration,
}

impl AuthorizationDecision {
    fn unavailable(detail: &str) -> Self {
        Self {
            allow: false,
            outcome: DecisionOutcome::Unavailable,
            reason: format!("{UNAVAILABLE_REASON}: {detail}"),
            policy_id: None,
            evaluated_at: Utc::now(),
            ttl: Duration::ZERO,
        }
    }

    /// Whether the deny came from infrastructure rather than policy.
    pub fn is_unavailable(&self) -> bool {
        self.outcome == DecisionOutcome::Unavailable
    }
}

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

/// Enforcement mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthzMode {
    /// Denials are enforced.
    #[default]
    Enforce,
    /// Policy denials are logged and allowed. Development only.
    LogOnly,
}

/// What "no matching rule" resolves to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DefaultAction {
    /// Deny when nothing matched.
    #[default]
    Deny,
    /// Allow when nothing matched.
    Allow,
}

/// Engine configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthzSettings {
    /// Bound on one policy service call.
    pub timeout: Duration,
    /// Resolution of "no matching rule".
    pub default_action: DefaultAction,
    /// Enforce or log-only.
    pub mode: AuthzMode,
    /// Cache lifetime when the service does not specify one.
    pub default_ttl: Duration,
    /// Upper bound on any cache lifetime.
    pub max_ttl: Duration,
    /// Maximum number of cached decisions.
    pub cache_capacity: usize,
    /// Policy service breaker thresholds.
    pub breaker: BreakerSettings,
}

impl Default for AuthzSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(2),
            default_action: DefaultAction::Deny,
            mode: AuthzMode::Enforce,
            default_ttl: Duration::from_secs(60),
            max_ttl: Duration::from_secs(300),
            cache_capacity: 10_000,
            breaker: BreakerSettings::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Evaluates (caller, resource, action, context) with caching and fail-closed
/// error handling.
pub struct AuthorizationEngine {
    service: Arc<dyn PolicyService>,
    settings: AuthzSettings,
    cache: DecisionCache,
    breaker: Arc<CircuitBreaker>,
    evaluations: AtomicU64,
    audit: Option<Arc<AuditLogger>>,
}

impl AuthorizationEngine {
    /// Engine consulting `service`.
    pub fn new(service: Arc<dyn PolicyService>, settings: AuthzSettings) -> Self {
        Self {
            service,
            cache: DecisionCache::new(settings.cache_capacity),
            breaker: Arc::new(CircuitBreaker::new("policy_service", settings.breaker)),
            settings,
            evaluations: AtomicU64::new(0),
            audit: None,
        }
    }

    /// Record log-only overrides in `audit`.
    #[must_use]
    pub fn with_audit(mut self, audit: Arc<AuditLogger>) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Configured mode.
    pub fn mode(&self) -> AuthzMode {
        self.settings.mode
    }

    /// Decide whether `caller` may perform `action` on `resource`.
    pub async fn check(
        &self,
        caller: &SpiffeId,
        resource: &SpiffeId,
        action: &str,
        context: &serde_json::Value,
    ) -> AuthorizationDecision {
        let key = CacheKey {
            caller: caller.clone(),
            resource: resource.clone(),
            action: action.to_owned(),
        };

        if let Some(decision) = self.cache.get(&key) {
            tracing::debug!(
                caller = %caller,
                resource = %resource,
                action,
                allow = decision.allow,
                "authorization cache hit",
            );
            return self.apply_mode(&key, decision);
        }

        let permit = match self.breaker.try_acquire() {
            Ok(permit) => permit,
            Err(open) => {
                tracing::debug!(
                    caller = %caller,
                    resource = %resource,
                    action,
                    breaker = %open.state,
                    "policy service breaker open, denying",
                );
                return AuthorizationDecision::unavailable("circuit open");
            }
        };

        let generation = self.cache.generation();
        self.evaluations.fetch_add(1, Ordering::Relaxed);
        let input = PolicyInput {
            caller: caller.clone(),
            resource: resource.clone(),
            action: action.to_owned(),
            context: context.clone(),
        };

        let verdict = match tokio::time::timeout(self.settings.timeout, self.service.evaluate(&input)).await {
            Ok(Ok(verdict)) => {
                permit.success();
                verdict
            }
            Ok(Err(e)) => {
                permit.failure();
                tracing::warn!(error = %e, action, "policy service call failed, denying");
                return AuthorizationDecision::unavailable("request failed");
            }
            Err(_) => {
                permit.failure();
                tracing::warn!(
                    timeout_ms = u64::try_from(self.settings.timeout.as_millis()).unwrap_or(u64::MAX),
                    action,
                    "policy service call timed out, denying",
                );
                return AuthorizationDecision::unavailable("timed out");
            }
        };

        let decision = self.resolve(verdict);
        if self
            .cache
            .insert_if_current(key.clone(), decision.clone(), decision.ttl, generation)
        {
            tracing::debug!(
                caller = %caller,
                resource = %resource,
                action,
                ttl_ms = u64::try_from(decision.ttl.as_millis()).unwrap_or(u64::MAX),
                "authorization decision cached",
            );
        }
        self.apply_mode(&key, decision)
    }

    /// Drop cached decisions matching `predicate`. Evaluations in flight at
    /// the time of the call will not be cached. Returns the number removed.
    pub fn invalidate(&self, predicate: impl Fn(&CacheKey) -> bool) -> usize {
        let removed = self.cache.invalidate(predicate);
        tracing::info!(removed, "authorization cache invalidated");
        removed
    }

    /// Drop every cached decision (policy update).
    pub fn invalidate_all(&self) -> usize {
        self.invalidate(|_| true)
    }

    /// Drop decisions where `caller` is the caller (identity revocation).
    pub fn invalidate_caller(&self, caller: &SpiffeId) -> usize {
        self.invalidate(|key| &key.caller == caller)
    }

    /// Drop decisions targeting `resource` (destination removal).
    pub fn invalidate_resource(&self, resource: &SpiffeId) -> usize {
        self.invalidate(|key| &key.resource == resource)
    }

    /// Number of cached decisions.
    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }

    /// Policy service breaker counters.
    pub fn breaker_metrics(&self) -> BreakerMetrics {
        self.breaker.metrics()
    }

    /// Policy service calls made (successful or not).
    pub fn evaluations(&self) -> u64 {
        self.evaluations.load(Ordering::Relaxed)
    }

    fn resolve(&self, verdict: PolicyVerdict) -> AuthorizationDecision {
        let ttl = verdict
            .ttl_secs
            .map_or(self.settings.default_ttl, Duration::from_secs)
            .min(self.settings.max_ttl);
        let evaluated_at = Utc::now();

        match verdict.policy_id {
            None => AuthorizationDecision {
                allow: self.settings.default_action == DefaultAction::Allow,
                outcome: DecisionOutcome::NoMatchingRule,
                reason: if verdict.reason.is_empty() {
                    "no matching rule".to_owned()
                } else {
                    verdict.reason
                },
                policy_id: None,
                evaluated_at,
                ttl,
            },
            Some(policy_id) => AuthorizationDecision {
                allow: verdict.allow,
                outcome: if verdict.allow {
                    DecisionOutcome::Allowed
                } else {
                    DecisionOutcome::Denied
                },
                reason: verdict.reason,
                policy_id: Some(policy_id),
                evaluated_at,
                ttl,
            },
        }
    }

    /// Log-only mode turns policy denials into audited allows. Infrastructure
    /// denials are never overridden.
    fn apply_mode(&self, key: &CacheKey, decision: AuthorizationDecision) -> AuthorizationDecision {
        let overridable = matches!(
            decision.outcome,
            DecisionOutcome::Denied | DecisionOutcome::NoMatchingRule
        );
        if decision.allow || !overridable || self.settings.mode != AuthzMode::LogOnly {
            return decision;
        }

        tracing::warn!(
            caller = %key.caller,
            resource = %key.resource,
            action = %key.action,
            reason = %decision.reason,
            "log-only mode: allowing denied call",
        );
        if let Some(audit) = &self.audit {
            if let Err(e) =
                audit.log_log_only_allow(&key.caller, &key.resource, &key.action, &decision.reason)
            {
                tracing::warn!(error = %e, "failed to write log-only audit entry");
            }
        }
        AuthorizationDecision {
            allow: true,
            outcome: DecisionOutcome::LogOnlyOverride,
            reason: format!("log-only override: {}", decision.reason),
            ..decision
        }
    }
}

impl std::fmt::Debug for AuthorizationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthorizationEngine")
            .field("settings", &self.settings)
            .field("cache_len", &self.cache.len())
            .finish_non_exhaustive()
    }
}
