//! Outbound call state machine, end to end over the in-process connector.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use meshgate::audit::AuditLogger;
use meshgate::authz::AuthzSettings;
use meshgate::error::{ErrorCode, Stage};
use meshgate::orchestrator::{
    AuthorizedRequest, CallOrchestrator, CallOutcome, HandlerError, HandlerSpec, OutboundCall,
    TaskHandler,
};
use meshgate::transport::InboundHandler;

use crate::common::{
    id, id_in, FakeConnector, FakePolicyService, Harness, HarnessOptions, SharedBuf, TestPki,
    DOMAIN,
};

/// Answers with the verified caller and the query it was sent.
struct Search;

#[async_trait]
impl TaskHandler for Search {
    async fn handle(&self, request: AuthorizedRequest) -> Result<serde_json::Value, HandlerError> {
        Ok(serde_json::json!({
            "caller": request.caller().to_string(),
            "hits": [request.payload()["q"]],
        }))
    }
}

/// A caller wired straight into a search workload's inbound dispatch.
async fn caller_and_server(pki: &TestPki, caller: HarnessOptions) -> (Harness, Harness) {
    let server = Harness::new(pki, "agent/search").await;
    server
        .registry
        .register("search", HandlerSpec::requiring("search"), Arc::new(Search))
        .expect("register");
    let client = Harness::with_options(pki, "agent/caller", caller).await;
    client
        .connector
        .set_handler(Arc::clone(&server.orchestrator) as Arc<dyn InboundHandler>);
    (client, server)
}

fn search() -> OutboundCall {
    OutboundCall::new(id("agent/search"), "search").with_payload(serde_json::json!({"q": "rust"}))
}

fn stages(outcome: &CallOutcome) -> Vec<Stage> {
    outcome.stages.iter().map(|t| t.stage).collect()
}

#[tokio::test]
async fn allowed_call_runs_every_stage_and_reaches_the_handler() {
    let pki = TestPki::new(DOMAIN);
    let (client, server) = caller_and_server(&pki, HarnessOptions::default()).await;

    let outcome = client.orchestrator.call(search()).await;
    let result = outcome.result.clone().expect("call succeeds");
    assert_eq!(result["caller"], "spiffe://example.org/agent/caller");
    assert_eq!(result["hits"][0], "rust");
    assert_eq!(
        stages(&outcome),
        vec![
            Stage::ResolveIdentity,
            Stage::CheckOutboundAuthz,
            Stage::AcquireChannel,
            Stage::Send,
            Stage::AwaitResponse,
            Stage::Decode,
        ]
    );
    assert_eq!(outcome.send_attempts, 1);
    assert_eq!(outcome.retries(), 0);
    assert!(outcome.stage_duration(Stage::Remote).is_none());

    // Outbound check: caller asks about the target.
    let outbound = client.policy.inputs();
    assert_eq!(outbound.len(), 1);
    assert_eq!(outbound[0].caller, id("agent/caller"));
    assert_eq!(outbound[0].resource, id("agent/search"));
    assert_eq!(outbound[0].action, "search");

    // Inbound check: the server asks about itself, with the capability.
    let inbound = server.policy.inputs();
    assert_eq!(inbound.len(), 1);
    assert_eq!(inbound[0].caller, id("agent/caller"));
    assert_eq!(inbound[0].resource, id("agent/search"));
    assert_eq!(inbound[0].context["direction"], "inbound");
    assert_eq!(inbound[0].context["required_capability"], "search");

    assert_eq!(server.orchestrator.inbound_stats().dispatched, 1);
}

#[tokio::test]
async fn repeated_call_within_ttl_skips_both_policy_round_trips() {
    let pki = TestPki::new(DOMAIN);
    let (client, server) = caller_and_server(&pki, HarnessOptions::default()).await;

    let first = client.orchestrator.call(search()).await;
    assert!(first.is_success(), "first call failed: {:?}", first.result);
    assert_eq!(client.policy.calls(), 1);
    assert_eq!(server.policy.calls(), 1);

    let second = client.orchestrator.call(search()).await;
    assert!(second.is_success(), "second call failed: {:?}", second.result);
    assert_eq!(client.policy.calls(), 1, "outbound decision served from cache");
    assert_eq!(server.policy.calls(), 1, "inbound decision served from cache");
    assert_eq!(server.orchestrator.inbound_stats().dispatched, 2);
    assert_eq!(client.transport.stats().reuses, 1);
}

#[tokio::test]
async fn denied_call_never_touches_the_network() {
    let pki = TestPki::new(DOMAIN);
    let (client, server) = caller_and_server(
        &pki,
        HarnessOptions {
            policy: FakePolicyService::denying(),
            ..HarnessOptions::default()
        },
    )
    .await;
    let sink = SharedBuf::default();
    let orchestrator = CallOrchestrator::new(
        Arc::clone(&client.identity),
        Arc::clone(&client.authz),
        Arc::clone(&client.transport),
        Arc::clone(&client.registry),
    )
    .with_audit(Arc::new(AuditLogger::from_writer(Box::new(sink.clone()))));

    let outcome = orchestrator.call(search()).await;
    let err = outcome.result.clone().expect_err("denied");
    assert_eq!(err.code, ErrorCode::AuthorizationDenied);
    assert_eq!(err.stage, Stage::CheckOutboundAuthz);
    assert!(!err.is_retryable());
    assert_eq!(
        stages(&outcome),
        vec![Stage::ResolveIdentity, Stage::CheckOutboundAuthz]
    );
    assert_eq!(outcome.send_attempts, 0);
    assert_eq!(client.connector.connects(), 0);
    assert_eq!(server.orchestrator.inbound_stats().dispatched, 0);

    let entries = sink.lines();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0]["event_type"], "authorization_denied");
    assert_eq!(entries[0]["request_id"], outcome.request_id.to_string());
    assert_eq!(entries[0]["details"]["policy_id"], "deny-all");
}

#[tokio::test]
async fn impersonating_destination_fails_at_channel_acquisition() {
    let pki = TestPki::new(DOMAIN);
    let (client, server) = caller_and_server(&pki, HarnessOptions::default()).await;
    client
        .connector
        .impersonate(id("agent/search"), id("agent/imposter"));

    let outcome = client.orchestrator.call(search()).await;
    let err = outcome.result.clone().expect_err("imposter");
    assert_eq!(err.code, ErrorCode::PeerVerificationFailed);
    assert_eq!(err.stage, Stage::AcquireChannel);
    assert!(!err.message.contains("imposter"), "message leaks detail: {}", err.message);
    assert_eq!(outcome.send_attempts, 0);
    assert_eq!(client.connector.sends(), 0);
    assert_eq!(server.orchestrator.inbound_stats().dispatched, 0);
}

#[tokio::test]
async fn unavailable_policy_service_fails_closed() {
    let pki = TestPki::new(DOMAIN);
    let policy = FakePolicyService::allowing();
    policy.set_failing(true);
    let (client, _server) = caller_and_server(
        &pki,
        HarnessOptions {
            policy,
            ..HarnessOptions::default()
        },
    )
    .await;

    let outcome = client.orchestrator.call(search()).await;
    let err = outcome.result.expect_err("fail closed");
    assert_eq!(err.code, ErrorCode::PolicyServiceUnavailable);
    assert_eq!(err.stage, Stage::CheckOutboundAuthz);
    assert!(err.is_retryable());
    assert_eq!(client.connector.connects(), 0);
}

#[tokio::test]
async fn missing_identity_stops_before_authorization() {
    let pki = TestPki::new(DOMAIN);
    let (client, _server) = caller_and_server(&pki, HarnessOptions::default()).await;
    client.identity.shutdown().await;

    let outcome = client.orchestrator.call(search()).await;
    let err = outcome.result.clone().expect_err("no identity");
    assert_eq!(err.code, ErrorCode::IdentityUnavailable);
    assert_eq!(err.stage, Stage::ResolveIdentity);
    assert_eq!(stages(&outcome), vec![Stage::ResolveIdentity]);
    assert_eq!(client.policy.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn slow_policy_service_hits_the_call_deadline() {
    let pki = TestPki::new(DOMAIN);
    let policy = FakePolicyService::allowing();
    policy.set_delay(Some(Duration::from_secs(5)));
    let (client, _server) = caller_and_server(
        &pki,
        HarnessOptions {
            policy,
            authz: AuthzSettings {
                timeout: Duration::from_secs(10),
                ..AuthzSettings::default()
            },
            ..HarnessOptions::default()
        },
    )
    .await;

    let outcome = client
        .orchestrator
        .call(search().with_timeout(Duration::from_secs(1)))
        .await;
    let err = outcome.result.expect_err("deadline");
    assert_eq!(err.code, ErrorCode::Timeout);
    assert_eq!(err.stage, Stage::CheckOutboundAuthz);
    assert_eq!(client.connector.connects(), 0);
}

#[tokio::test(start_paused = true)]
async fn response_timeout_closes_the_channel() {
    let pki = TestPki::new(DOMAIN);
    let (client, _server) = caller_and_server(&pki, HarnessOptions::default()).await;
    client.connector.hang(true);

    let outcome = client
        .orchestrator
        .call(search().with_timeout(Duration::from_secs(2)))
        .await;
    let err = outcome.result.clone().expect_err("no response");
    assert_eq!(err.code, ErrorCode::Timeout);
    assert_eq!(err.stage, Stage::AwaitResponse);
    assert_eq!(outcome.send_attempts, 1);

    let stats = client.transport.pool_stats(&id("agent/search")).expect("pool");
    assert_eq!(stats.in_use, 0);
    assert_eq!(stats.idle, 0, "a channel with an unanswered request is not reused");
    assert_eq!(stats.breaker.failure_count, 1);
    assert_eq!(client.connector.closed(), 1);
}

#[tokio::test(start_paused = true)]
async fn cancelled_call_releases_its_slot() {
    let pki = TestPki::new(DOMAIN);
    let (client, _server) = caller_and_server(&pki, HarnessOptions::default()).await;
    client.connector.hang(true);

    let call = {
        let orchestrator = Arc::clone(&client.orchestrator);
        tokio::spawn(async move { orchestrator.call(search()).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(
        client.transport.pool_stats(&id("agent/search")).expect("pool").in_use,
        1
    );

    call.abort();
    let joined = call.await;
    assert!(joined.expect_err("aborted").is_cancelled());

    let stats = client.transport.pool_stats(&id("agent/search")).expect("pool");
    assert_eq!(stats.in_use, 0);
    assert_eq!(stats.idle, 0);
    assert_eq!(stats.breaker.failure_count, 0, "cancellation is not a destination failure");
    assert_eq!(client.connector.closed(), 1);
}

#[tokio::test]
async fn transient_send_failure_is_retried() {
    let pki = TestPki::new(DOMAIN);
    let (client, server) = caller_and_server(&pki, HarnessOptions::default()).await;
    client.connector.fail_sends(1);

    let outcome = client.orchestrator.call(search()).await;
    assert!(outcome.is_success(), "got {:?}", outcome.result);
    assert_eq!(outcome.send_attempts, 2);
    assert_eq!(outcome.retries(), 1);
    assert_eq!(server.orchestrator.inbound_stats().dispatched, 1);
}

#[tokio::test]
async fn remote_rejection_is_reported_with_its_code() {
    let pki = TestPki::new(DOMAIN);
    let (client, server) = caller_and_server(&pki, HarnessOptions::default()).await;

    let outcome = client
        .orchestrator
        .call(OutboundCall::new(id("agent/search"), "translate"))
        .await;
    let err = outcome.result.clone().expect_err("unknown action");
    assert_eq!(err.code, ErrorCode::UnknownAction);
    assert_eq!(err.stage, Stage::Remote);
    assert_eq!(stages(&outcome).last(), Some(&Stage::Decode));
    assert_eq!(server.orchestrator.inbound_stats().rejected, 1);
}

#[tokio::test]
async fn remote_denial_surfaces_as_authorization_denied() {
    let pki = TestPki::new(DOMAIN);
    let (client, server) = caller_and_server(&pki, HarnessOptions::default()).await;
    server
        .policy
        .set_verdict(meshgate::authz::PolicyVerdict::matched(false, "no-search", "closed"));

    let outcome = client.orchestrator.call(search()).await;
    let err = outcome.result.expect_err("remote deny");
    assert_eq!(err.code, ErrorCode::AuthorizationDenied);
    assert_eq!(err.stage, Stage::Remote);
    assert_eq!(server.orchestrator.inbound_stats().dispatched, 0);
}

#[tokio::test]
async fn unfederated_destination_fails_peer_verification() {
    let pki = TestPki::new(DOMAIN);
    let client = Harness::with_options(
        &pki,
        "agent/caller",
        HarnessOptions {
            connector: FakeConnector::echo(),
            ..HarnessOptions::default()
        },
    )
    .await;

    let outcome = client
        .orchestrator
        .call(OutboundCall::new(id_in("stranger.org", "agent/search"), "search"))
        .await;
    let err = outcome.result.expect_err("not federated");
    assert_eq!(err.code, ErrorCode::PeerVerificationFailed);
    assert_eq!(err.stage, Stage::AcquireChannel);
    assert_eq!(client.connector.connects(), 0);
}

#[tokio::test]
async fn removing_a_destination_drops_channels_and_decisions() {
    let pki = TestPki::new(DOMAIN);
    let (client, _server) = caller_and_server(&pki, HarnessOptions::default()).await;
    let target = id("agent/search");

    assert!(client.orchestrator.call(search()).await.is_success());
    assert_eq!(client.authz.cache_len(), 1);
    assert_eq!(client.transport.pool_stats(&target).expect("pool").idle, 1);

    assert!(client.orchestrator.remove_destination(&target));
    assert_eq!(client.authz.cache_len(), 0);
    assert!(client.transport.pool_stats(&target).is_none());

    assert!(client.orchestrator.call(search()).await.is_success());
    assert_eq!(client.policy.calls(), 2);
    assert_eq!(client.connector.connects(), 2);
}
