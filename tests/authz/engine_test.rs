//! Tests for `AuthorizationEngine`: caching, fail-closed handling, breaker,
//! invalidation and log-only mode.

use std::sync::Arc;
use std::time::Duration;

use meshgate::audit::AuditLogger;
use meshgate::authz::{
    AuthorizationEngine, AuthzMode, AuthzSettings, DecisionOutcome, DefaultAction, PolicyService,
    PolicyVerdict,
};
use meshgate::breaker::{BreakerSettings, CircuitState};

use crate::common::{id, FakePolicyService, SharedBuf};

fn engine(policy: &Arc<FakePolicyService>, settings: AuthzSettings) -> Arc<AuthorizationEngine> {
    Arc::new(AuthorizationEngine::new(
        Arc::clone(policy) as Arc<dyn PolicyService>,
        settings,
    ))
}

fn ctx() -> serde_json::Value {
    serde_json::json!({})
}

#[tokio::test(start_paused = true)]
async fn allow_is_cached_for_its_ttl() {
    let policy = Arc::new(FakePolicyService::with_verdict(
        PolicyVerdict::matched(true, "search-allowed", "search is open").with_ttl_secs(30),
    ));
    let engine = engine(&policy, AuthzSettings::default());
    let (caller, resource) = (id("agent/caller"), id("agent/search"));

    let first = engine.check(&caller, &resource, "search", &ctx()).await;
    assert!(first.allow);
    assert_eq!(first.outcome, DecisionOutcome::Allowed);
    assert_eq!(first.policy_id.as_deref(), Some("search-allowed"));
    assert_eq!(first.ttl, Duration::from_secs(30));

    let second = engine.check(&caller, &resource, "search", &ctx()).await;
    assert!(second.allow);
    assert_eq!(policy.calls(), 1, "second check must be a cache hit");
    assert_eq!(engine.cache_len(), 1);

    tokio::time::advance(Duration::from_secs(31)).await;
    engine.check(&caller, &resource, "search", &ctx()).await;
    assert_eq!(policy.calls(), 2, "expired entry must be re-evaluated");
}

#[tokio::test]
async fn ttl_is_clamped_to_maximum() {
    let policy = Arc::new(FakePolicyService::with_verdict(
        PolicyVerdict::matched(true, "p", "ok").with_ttl_secs(86_400),
    ));
    let engine = engine(
        &policy,
        AuthzSettings {
            max_ttl: Duration::from_secs(300),
            ..AuthzSettings::default()
        },
    );
    let decision = engine
        .check(&id("agent/a"), &id("agent/b"), "search", &ctx())
        .await;
    assert_eq!(decision.ttl, Duration::from_secs(300));
}

#[tokio::test]
async fn explicit_deny() {
    let policy = Arc::new(FakePolicyService::denying());
    let engine = engine(&policy, AuthzSettings::default());
    let decision = engine
        .check(&id("agent/a"), &id("agent/b"), "delete", &ctx())
        .await;
    assert!(!decision.allow);
    assert_eq!(decision.outcome, DecisionOutcome::Denied);
    assert_eq!(decision.policy_id.as_deref(), Some("deny-all"));
}

#[tokio::test]
async fn no_matching_rule_uses_default_action() {
    let policy = Arc::new(FakePolicyService::no_rule());

    let deny_engine = engine(&policy, AuthzSettings::default());
    let decision = deny_engine
        .check(&id("agent/a"), &id("agent/b"), "search", &ctx())
        .await;
    assert!(!decision.allow);
    assert_eq!(decision.outcome, DecisionOutcome::NoMatchingRule);

    let allow_engine = engine(
        &policy,
        AuthzSettings {
            default_action: DefaultAction::Allow,
            ..AuthzSettings::default()
        },
    );
    let decision = allow_engine
        .check(&id("agent/a"), &id("agent/b"), "search", &ctx())
        .await;
    assert!(decision.allow);
    assert_eq!(decision.outcome, DecisionOutcome::NoMatchingRule);
}

#[tokio::test]
async fn service_failure_denies_even_with_default_allow() {
    let policy = Arc::new(FakePolicyService::allowing());
    policy.set_failing(true);
    let engine = engine(
        &policy,
        AuthzSettings {
            default_action: DefaultAction::Allow,
            ..AuthzSettings::default()
        },
    );

    let decision = engine
        .check(&id("agent/a"), &id("agent/b"), "search", &ctx())
        .await;
    assert!(!decision.allow);
    assert!(decision.is_unavailable());
    assert!(decision.reason.starts_with("policy engine unavailable"));
    assert_eq!(engine.cache_len(), 0, "failures are never cached");

    policy.set_failing(false);
    let decision = engine
        .check(&id("agent/a"), &id("agent/b"), "search", &ctx())
        .await;
    assert!(decision.allow);
    assert_eq!(policy.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn slow_service_times_out_as_deny() {
    let policy = Arc::new(FakePolicyService::allowing());
    policy.set_delay(Some(Duration::from_secs(5)));
    let engine = engine(
        &policy,
        AuthzSettings {
            timeout: Duration::from_secs(2),
            ..AuthzSettings::default()
        },
    );

    let started = tokio::time::Instant::now();
    let decision = engine
        .check(&id("agent/a"), &id("agent/b"), "search", &ctx())
        .await;
    assert!(!decision.allow);
    assert_eq!(decision.outcome, DecisionOutcome::Unavailable);
    assert!(started.elapsed() < Duration::from_secs(3));
}

#[tokio::test(start_paused = true)]
async fn breaker_opens_fails_fast_and_recovers_through_one_trial() {
    let policy = Arc::new(FakePolicyService::allowing());
    policy.set_failing(true);
    let engine = engine(
        &policy,
        AuthzSettings {
            breaker: BreakerSettings {
                failure_threshold: 3,
                recovery_timeout: Duration::from_secs(10),
            },
            ..AuthzSettings::default()
        },
    );
    let (a, b) = (id("agent/a"), id("agent/b"));

    for _ in 0..3 {
        assert!(engine.check(&a, &b, "search", &ctx()).await.is_unavailable());
    }
    assert_eq!(engine.breaker_metrics().state, CircuitState::Open);

    let decision = engine.check(&a, &b, "search", &ctx()).await;
    assert!(decision.is_unavailable());
    assert_eq!(policy.calls(), 3, "open breaker must not call the service");

    tokio::time::advance(Duration::from_secs(11)).await;
    policy.set_failing(false);
    let decision = engine.check(&a, &b, "search", &ctx()).await;
    assert!(decision.allow);
    assert_eq!(policy.calls(), 4);
    assert_eq!(engine.breaker_metrics().state, CircuitState::Closed);
}

#[tokio::test]
async fn context_is_not_part_of_the_cache_key() {
    let policy = Arc::new(FakePolicyService::allowing());
    let engine = engine(&policy, AuthzSettings::default());
    let (a, b) = (id("agent/a"), id("agent/b"));

    engine
        .check(&a, &b, "search", &serde_json::json!({"tenant": "t1"}))
        .await;
    engine
        .check(&a, &b, "search", &serde_json::json!({"tenant": "t2"}))
        .await;
    assert_eq!(policy.calls(), 1);
    assert_eq!(policy.inputs()[0].context["tenant"], "t1");
}

#[tokio::test]
async fn invalidation_by_caller_and_resource() {
    let policy = Arc::new(FakePolicyService::allowing());
    let engine = engine(&policy, AuthzSettings::default());
    let (a, b, c) = (id("agent/a"), id("agent/b"), id("agent/c"));

    engine.check(&a, &b, "search", &ctx()).await;
    engine.check(&c, &b, "search", &ctx()).await;
    engine.check(&c, &a, "search", &ctx()).await;
    assert_eq!(engine.cache_len(), 3);

    assert_eq!(engine.invalidate_caller(&a), 1);
    assert_eq!(engine.cache_len(), 2);
    assert_eq!(engine.invalidate_resource(&b), 1);
    assert_eq!(engine.cache_len(), 1);

    engine.check(&a, &b, "search", &ctx()).await;
    assert_eq!(policy.calls(), 4, "invalidated entry must be re-evaluated");

    assert_eq!(engine.invalidate_all(), 2);
    assert_eq!(engine.cache_len(), 0);
}

#[tokio::test(start_paused = true)]
async fn invalidation_during_evaluation_is_not_undone() {
    let policy = Arc::new(FakePolicyService::allowing());
    policy.set_delay(Some(Duration::from_millis(500)));
    let engine = engine(&policy, AuthzSettings::default());

    let in_flight = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move {
            engine
                .check(&id("agent/a"), &id("agent/b"), "search", &serde_json::json!({}))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    engine.invalidate_all();

    let decision = in_flight.await.expect("check task");
    assert!(decision.allow, "the caller still gets its answer");
    assert_eq!(engine.cache_len(), 0, "stale answer must not be cached");
}

#[tokio::test]
async fn log_only_allows_policy_denials_and_audits_them() {
    let policy = Arc::new(FakePolicyService::denying());
    let sink = SharedBuf::default();
    let engine = AuthorizationEngine::new(
        Arc::clone(&policy) as Arc<dyn PolicyService>,
        AuthzSettings {
            mode: AuthzMode::LogOnly,
            ..AuthzSettings::default()
        },
    )
    .with_audit(Arc::new(AuditLogger::from_writer(Box::new(sink.clone()))));

    let decision = engine
        .check(&id("agent/a"), &id("agent/b"), "delete", &ctx())
        .await;
    assert!(decision.allow);
    assert_eq!(decision.outcome, DecisionOutcome::LogOnlyOverride);

    let entries = sink.lines();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0]["event_type"], "log_only_allow");
}

#[tokio::test]
async fn log_only_never_overrides_unavailable() {
    let policy = Arc::new(FakePolicyService::allowing());
    policy.set_failing(true);
    let engine = engine(
        &policy,
        AuthzSettings {
            mode: AuthzMode::LogOnly,
            ..AuthzSettings::default()
        },
    );
    let decision = engine
        .check(&id("agent/a"), &id("agent/b"), "search", &ctx())
        .await;
    assert!(!decision.allow);
    assert!(decision.is_unavailable());
}
