//! Inbound dispatch guard: every rejection happens before the handler runs.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use meshgate::audit::AuditLogger;
use meshgate::error::ErrorCode;
use meshgate::orchestrator::{
    AuthorizedRequest, CallOrchestrator, HandlerError, HandlerSpec, TaskHandler,
};
use meshgate::transport::VerifiedPeer;
use meshgate::types::{SpiffeId, TaskRequest, TaskResponse, TaskStatus};

use crate::common::{id, FakePolicyService, Harness, HarnessOptions, SharedBuf, TestPki, DOMAIN};

/// Records what it was given; fails when the payload asks it to.
#[derive(Default)]
struct Recorder {
    calls: AtomicUsize,
    last: std::sync::Mutex<Option<AuthorizedRequest>>,
}

#[async_trait]
impl TaskHandler for Recorder {
    async fn handle(&self, request: AuthorizedRequest) -> Result<serde_json::Value, HandlerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let fail = request.payload()["fail"].as_bool().unwrap_or(false);
        *self.last.lock().expect("lock") = Some(request);
        if fail {
            return Err(HandlerError::new("index offline"));
        }
        Ok(serde_json::json!({"ok": true}))
    }
}

impl Recorder {
    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

struct Fixture {
    harness: Harness,
    orchestrator: CallOrchestrator,
    handler: Arc<Recorder>,
    audit: SharedBuf,
    peer: VerifiedPeer,
}

/// The search workload with a recording handler for `search`, and a verified
/// peer for `agent/caller`.
async fn fixture(policy: FakePolicyService, spec: HandlerSpec) -> Fixture {
    let pki = TestPki::new(DOMAIN);
    let harness = Harness::with_options(
        &pki,
        "agent/search",
        HarnessOptions {
            policy,
            ..HarnessOptions::default()
        },
    )
    .await;
    let handler = Arc::new(Recorder::default());
    harness
        .registry
        .register("search", spec, Arc::clone(&handler) as Arc<dyn TaskHandler>)
        .expect("register");

    let audit = SharedBuf::default();
    let orchestrator = CallOrchestrator::new(
        Arc::clone(&harness.identity),
        Arc::clone(&harness.authz),
        Arc::clone(&harness.transport),
        Arc::clone(&harness.registry),
    )
    .with_audit(Arc::new(AuditLogger::from_writer(Box::new(audit.clone()))));

    let (chain, _key) = pki.issue_der("agent/caller");
    let peer = VerifiedPeer::from_certificates(&chain, &pki.bundle(1)).expect("verified peer");

    Fixture {
        harness,
        orchestrator,
        handler,
        audit,
        peer,
    }
}

fn request(caller: &SpiffeId, action: &str, payload: serde_json::Value) -> (Uuid, Vec<u8>) {
    let request_id = Uuid::new_v4();
    let frame = serde_json::to_vec(&TaskRequest {
        task_type: action.to_owned(),
        payload,
        caller_id: caller.clone(),
        request_id,
    })
    .expect("encode request");
    (request_id, frame)
}

async fn handle(fixture: &Fixture, frame: &[u8]) -> TaskResponse {
    let bytes = fixture.orchestrator.handle_inbound(&fixture.peer, frame).await;
    serde_json::from_slice(&bytes).expect("response envelope")
}

fn error_code(response: &TaskResponse) -> ErrorCode {
    assert_eq!(response.status, TaskStatus::Failed);
    response.error.as_ref().expect("error detail").code
}

#[tokio::test]
async fn authorized_request_reaches_the_handler() {
    let fx = fixture(FakePolicyService::allowing(), HandlerSpec::requiring("search")).await;
    let (request_id, frame) = request(&id("agent/caller"), "search", serde_json::json!({"q": "rust"}));

    let response = handle(&fx, &frame).await;
    assert_eq!(response.status, TaskStatus::Completed);
    assert_eq!(response.request_id, request_id);
    assert_eq!(response.result, Some(serde_json::json!({"ok": true})));

    let seen = fx.handler.last.lock().expect("lock").clone().expect("dispatched");
    assert_eq!(seen.caller(), &id("agent/caller"));
    assert_eq!(seen.action(), "search");
    assert_eq!(seen.payload()["q"], "rust");
    assert_eq!(seen.request_id(), request_id);
    assert_eq!(seen.policy_id(), Some("allow-all"));

    let stats = fx.orchestrator.inbound_stats();
    assert_eq!(stats.dispatched, 1);
    assert_eq!(stats.rejected, 0);
    assert!(fx.audit.contents().is_empty());
}

#[tokio::test]
async fn malformed_envelope_is_a_protocol_violation() {
    let fx = fixture(FakePolicyService::allowing(), HandlerSpec::default()).await;

    let response = handle(&fx, b"{not json").await;
    assert_eq!(error_code(&response), ErrorCode::ProtocolViolation);
    assert_eq!(response.request_id, Uuid::nil());
    assert_eq!(fx.handler.calls(), 0);
    assert_eq!(fx.harness.policy.calls(), 0);
}

#[tokio::test]
async fn claimed_caller_must_match_the_handshake_identity() {
    let fx = fixture(FakePolicyService::allowing(), HandlerSpec::default()).await;
    let (request_id, frame) = request(&id("agent/admin"), "search", serde_json::json!({}));

    let response = handle(&fx, &frame).await;
    assert_eq!(error_code(&response), ErrorCode::PeerVerificationFailed);
    assert_eq!(response.request_id, request_id);
    assert_eq!(fx.handler.calls(), 0);
    assert_eq!(fx.harness.policy.calls(), 0, "no policy call for a spoofed caller");

    let entries = fx.audit.lines();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0]["event_type"], "inbound_rejected");
    assert_eq!(entries[0]["details"]["peer"], "spiffe://example.org/agent/caller");
    assert_eq!(entries[0]["details"]["code"], "peer_verification_failed");
}

#[tokio::test]
async fn unknown_action_is_rejected() {
    let fx = fixture(FakePolicyService::allowing(), HandlerSpec::default()).await;
    let (_, frame) = request(&id("agent/caller"), "delete_index", serde_json::json!({}));

    let response = handle(&fx, &frame).await;
    assert_eq!(error_code(&response), ErrorCode::UnknownAction);
    assert_eq!(fx.harness.policy.calls(), 0);
    assert_eq!(fx.orchestrator.inbound_stats().rejected, 1);
}

#[tokio::test]
async fn caller_allow_list_is_enforced_before_policy() {
    let fx = fixture(
        FakePolicyService::allowing(),
        HandlerSpec::requiring("search").allow_callers([id("agent/planner")]),
    )
    .await;
    let (_, frame) = request(&id("agent/caller"), "search", serde_json::json!({}));

    let response = handle(&fx, &frame).await;
    assert_eq!(error_code(&response), ErrorCode::AuthorizationDenied);
    assert_eq!(fx.harness.policy.calls(), 0);
    assert_eq!(fx.handler.calls(), 0);
}

#[tokio::test]
async fn policy_denial_is_audited_and_never_dispatched() {
    let fx = fixture(FakePolicyService::denying(), HandlerSpec::requiring("search")).await;
    let (request_id, frame) = request(&id("agent/caller"), "search", serde_json::json!({}));

    let response = handle(&fx, &frame).await;
    assert_eq!(error_code(&response), ErrorCode::AuthorizationDenied);
    let message = &response.error.as_ref().expect("error").message;
    assert!(!message.contains("deny-all"), "policy internals leaked: {message}");
    assert_eq!(fx.handler.calls(), 0);

    let input = &fx.harness.policy.inputs()[0];
    assert_eq!(input.caller, id("agent/caller"));
    assert_eq!(input.resource, id("agent/search"));
    assert_eq!(input.context["required_capability"], "search");

    let events: Vec<_> = fx
        .audit
        .lines()
        .into_iter()
        .map(|entry| entry["event_type"].as_str().unwrap_or_default().to_owned())
        .collect();
    assert_eq!(events, vec!["authorization_denied", "inbound_rejected"]);
    assert_eq!(fx.audit.lines()[0]["request_id"], request_id.to_string());
}

#[tokio::test]
async fn unavailable_policy_service_rejects_inbound() {
    let policy = FakePolicyService::allowing();
    policy.set_failing(true);
    let fx = fixture(policy, HandlerSpec::default()).await;
    let (_, frame) = request(&id("agent/caller"), "search", serde_json::json!({}));

    let response = handle(&fx, &frame).await;
    assert_eq!(error_code(&response), ErrorCode::PolicyServiceUnavailable);
    assert_eq!(fx.handler.calls(), 0);
}

#[tokio::test]
async fn handler_failure_is_reported_to_the_caller() {
    let fx = fixture(FakePolicyService::allowing(), HandlerSpec::default()).await;
    let (_, frame) = request(&id("agent/caller"), "search", serde_json::json!({"fail": true}));

    let response = handle(&fx, &frame).await;
    assert_eq!(error_code(&response), ErrorCode::HandlerFailed);
    assert_eq!(response.error.expect("error").message, "index offline");

    let stats = fx.orchestrator.inbound_stats();
    assert_eq!(stats.dispatched, 1);
    assert_eq!(stats.handler_failures, 1);
}

#[tokio::test]
async fn duplicate_registration_is_refused() {
    let fx = fixture(FakePolicyService::allowing(), HandlerSpec::default()).await;
    let err = fx
        .harness
        .registry
        .register("search", HandlerSpec::default(), Arc::new(Recorder::default()))
        .expect_err("duplicate");
    assert_eq!(err.0, "search");
    assert_eq!(fx.harness.registry.actions(), vec!["search".to_owned()]);
}
