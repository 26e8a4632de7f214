//! Call orchestration.
//!
//! Outbound: resolve identity, check outbound authorization, acquire a
//! channel, send (with retry and breaker), await the response, decode. Each
//! step runs under the caller's deadline and maps its failure into a
//! [`CallError`] tagged with the [`Stage`] that failed.
//!
//! Inbound: see [`CallOrchestrator::handle_inbound`].

mod inbound;
mod registry;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use uuid::Uuid;

use crate::audit::AuditLogger;
use crate::authz::{AuthorizationDecision, AuthorizationEngine};
use crate::error::{CallError, ErrorCode, Stage};
use crate::identity::IdentityManager;
use crate::transport::{InboundHandler, TransportError, TransportManager, VerifiedPeer};
use crate::trust::FederationError;
use crate::types::{SpiffeId, TaskRequest, TaskResponse, TaskStatus};

pub use registry::{
    AuthorizedRequest, DuplicateHandler, HandlerError, HandlerRegistry, HandlerSpec, TaskHandler,
};

/// Deadline applied when a call does not set one.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

// ---------------------------------------------------------------------------
// Call and outcome
// ---------------------------------------------------------------------------

/// An outbound request to another workload.
#[derive(Debug, Clone)]
pub struct OutboundCall {
    target: SpiffeId,
    action: String,
    payload: serde_json::Value,
    context: serde_json::Value,
    deadline: Option<Instant>,
    timeout: Duration,
}

impl OutboundCall {
    /// Call `action` on `target` with an empty payload.
    pub fn new(target: SpiffeId, action: impl Into<String>) -> Self {
        Self {
            target,
            action: action.into(),
            payload: serde_json::Value::Null,
            context: serde_json::Value::Object(serde_json::Map::new()),
            deadline: None,
            timeout: DEFAULT_CALL_TIMEOUT,
        }
    }

    /// Business payload.
    #[must_use]
    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    /// Extra context passed to the policy service.
    #[must_use]
    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = context;
        self
    }

    /// Deadline relative to the start of the call.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self.deadline = None;
        self
    }

    /// Absolute deadline.
    #[must_use]
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Destination identity.
    pub fn target(&self) -> &SpiffeId {
        &self.target
    }

    /// Requested action.
    pub fn action(&self) -> &str {
        &self.action
    }
}

/// Time spent in one stage of a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageTiming {
    /// The stage.
    pub stage: Stage,
    /// Wall time spent in it.
    pub elapsed: Duration,
}

/// Result of [`CallOrchestrator::call`].
#[derive(Debug, Clone)]
pub struct CallOutcome {
    /// Correlation id sent in the envelope.
    pub request_id: Uuid,
    /// Remote result or the typed failure.
    pub result: Result<serde_json::Value, CallError>,
    /// Stages entered, in order, with their durations.
    pub stages: Vec<StageTiming>,
    /// Send attempts made, including retries. Zero if no send happened.
    pub send_attempts: u32,
}

impl CallOutcome {
    /// Whether the remote handler completed.
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }

    /// Time spent in `stage`, if it was entered.
    pub fn stage_duration(&self, stage: Stage) -> Option<Duration> {
        self.stages.iter().find(|t| t.stage == stage).map(|t| t.elapsed)
    }

    /// Retries after the first send attempt.
    pub fn retries(&self) -> u32 {
        self.send_attempts.saturating_sub(1)
    }
}

/// Inbound request counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InboundStats {
    /// Requests dispatched to a handler.
    pub dispatched: u64,
    /// Requests rejected before dispatch.
    pub rejected: u64,
    /// Dispatched requests whose handler failed.
    pub handler_failures: u64,
}

#[derive(Debug, Default)]
struct InboundCounters {
    dispatched: AtomicU64,
    rejected: AtomicU64,
    handler_failures: AtomicU64,
}

// ---------------------------------------------------------------------------
// CallOrchestrator
// ---------------------------------------------------------------------------

/// Drives outbound calls and guards inbound dispatch.
pub struct CallOrchestrator {
    identity: Arc<IdentityManager>,
    authz: Arc<AuthorizationEngine>,
    transport: Arc<TransportManager>,
    registry: Arc<HandlerRegistry>,
    audit: Option<Arc<AuditLogger>>,
    inbound: InboundCounters,
}

impl CallOrchestrator {
    /// Orchestrator over the given components.
    pub fn new(
        identity: Arc<IdentityManager>,
        authz: Arc<AuthorizationEngine>,
        transport: Arc<TransportManager>,
        registry: Arc<HandlerRegistry>,
    ) -> Self {
        Self {
            identity,
            authz,
            transport,
            registry,
            audit: None,
            inbound: InboundCounters::default(),
        }
    }

    /// Record denials and inbound rejections in `audit`.
    #[must_use]
    pub fn with_audit(mut self, audit: Arc<AuditLogger>) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Handler registry consulted for inbound requests.
    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }

    /// Inbound counters.
    pub fn inbound_stats(&self) -> InboundStats {
        InboundStats {
            dispatched: self.inbound.dispatched.load(Ordering::Relaxed),
            rejected: self.inbound.rejected.load(Ordering::Relaxed),
            handler_failures: self.inbound.handler_failures.load(Ordering::Relaxed),
        }
    }

    /// Stop talking to `destination`: close its channels, forget its breaker
    /// and drop cached decisions that target it.
    pub fn remove_destination(&self, destination: &SpiffeId) -> bool {
        let removed = self.transport.remove_destination(destination);
        self.authz.invalidate_resource(destination);
        removed
    }

    /// Run one outbound call to completion.
    ///
    /// Dropping the returned future releases any leased channel slot; the
    /// channel itself is closed rather than pooled if a request was in flight.
    pub async fn call(&self, call: OutboundCall) -> CallOutcome {
        let started = Instant::now();
        let deadline = call
            .deadline
            .unwrap_or_else(|| started.checked_add(call.timeout).unwrap_or(started));
        let request_id = Uuid::new_v4();
        let mut run = CallRun {
            stages: Vec::with_capacity(6),
            send_attempts: 0,
        };

        let result = self.run_outbound(&call, request_id, deadline, &mut run).await;

        let total_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        match &result {
            Ok(_) => tracing::debug!(
                request_id = %request_id,
                target = %call.target,
                action = %call.action,
                total_ms,
                send_attempts = run.send_attempts,
                stages = ?run.stages,
                "outbound call completed",
            ),
            Err(e) => tracing::info!(
                request_id = %request_id,
                target = %call.target,
                action = %call.action,
                code = %e.code,
                stage = %e.stage,
                total_ms,
                send_attempts = run.send_attempts,
                stages = ?run.stages,
                "outbound call failed",
            ),
        }

        CallOutcome {
            request_id,
            result,
            stages: run.stages,
            send_attempts: run.send_attempts,
        }
    }

    async fn run_outbound(
        &self,
        call: &OutboundCall,
        request_id: Uuid,
        deadline: Instant,
        run: &mut CallRun,
    ) -> Result<serde_json::Value, CallError> {
        // Resolve identity.
        let mark = Instant::now();
        let identity = self.identity.get_current_identity();
        run.record(Stage::ResolveIdentity, mark);
        let identity = identity.map_err(|e| {
            tracing::warn!(error = %e, "no usable local identity for outbound call");
            CallError::new(
                ErrorCode::IdentityUnavailable,
                Stage::ResolveIdentity,
                "no valid workload identity",
            )
        })?;
        let caller = identity.spiffe_id().clone();

        // Outbound authorization.
        let mark = Instant::now();
        let decision = tokio::time::timeout_at(
            deadline,
            self.authz
                .check(&caller, &call.target, &call.action, &call.context),
        )
        .await;
        run.record(Stage::CheckOutboundAuthz, mark);
        let decision = decision.map_err(|_| deadline_exceeded(Stage::CheckOutboundAuthz))?;
        if !decision.allow {
            self.audit_denial(request_id, &caller, &call.target, &call.action, &decision);
            return Err(denial_error(&decision, Stage::CheckOutboundAuthz));
        }

        // Acquire channel.
        let mark = Instant::now();
        let lease = tokio::time::timeout_at(deadline, self.transport.acquire_channel(&call.target)).await;
        run.record(Stage::AcquireChannel, mark);
        let mut lease = match lease {
            Ok(Ok(lease)) => lease,
            Ok(Err(e)) => return Err(transport_error(&e, Stage::AcquireChannel)),
            Err(_) => return Err(deadline_exceeded(Stage::AcquireChannel)),
        };

        // Send.
        let request = TaskRequest {
            task_type: call.action.clone(),
            payload: call.payload.clone(),
            caller_id: caller,
            request_id,
        };
        let frame = serde_json::to_vec(&request).map_err(|e| {
            tracing::warn!(error = %e, "failed to encode request envelope");
            CallError::new(
                ErrorCode::ProtocolViolation,
                Stage::Send,
                "request could not be encoded",
            )
        })?;
        let mark = Instant::now();
        let sent = tokio::time::timeout_at(deadline, self.transport.send_with_retry(&mut lease, &frame)).await;
        run.record(Stage::Send, mark);
        run.send_attempts = lease.attempts();
        match sent {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(transport_error(&e, Stage::Send)),
            Err(_) => {
                lease.fail(&TransportError::Timeout { operation: "send" });
                return Err(deadline_exceeded(Stage::Send));
            }
        }

        // Await response.
        let mark = Instant::now();
        let received = self.transport.receive(&mut lease, deadline).await;
        run.record(Stage::AwaitResponse, mark);
        let bytes = received.map_err(|e| transport_error(&e, Stage::AwaitResponse))?;
        drop(lease);

        // Decode.
        let mark = Instant::now();
        let decoded = decode_response(&bytes, request_id);
        run.record(Stage::Decode, mark);
        let response = decoded?;

        match response.status {
            TaskStatus::Completed => Ok(response.result.unwrap_or(serde_json::Value::Null)),
            TaskStatus::Failed => {
                let (code, message) = response.error.map_or_else(
                    || (ErrorCode::HandlerFailed, "remote reported failure".to_owned()),
                    |e| (e.code, e.message),
                );
                Err(CallError::new(code, Stage::Remote, message))
            }
        }
    }

    fn audit_denial(
        &self,
        request_id: Uuid,
        caller: &SpiffeId,
        resource: &SpiffeId,
        action: &str,
        decision: &AuthorizationDecision,
    ) {
        if let Some(audit) = &self.audit {
            if let Err(e) = audit.log_authorization_denied(Some(request_id), caller, resource, action, decision) {
                tracing::warn!(error = %e, "failed to write authorization audit entry");
            }
        }
    }
}

#[async_trait]
impl InboundHandler for CallOrchestrator {
    async fn handle_frame(&self, peer: &VerifiedPeer, frame: Vec<u8>) -> Vec<u8> {
        self.handle_inbound(peer, &frame).await
    }
}

impl std::fmt::Debug for CallOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallOrchestrator")
            .field("registry", &self.registry)
            .field("inbound", &self.inbound_stats())
            .finish_non_exhaustive()
    }
}

struct CallRun {
    stages: Vec<StageTiming>,
    send_attempts: u32,
}

impl CallRun {
    fn record(&mut self, stage: Stage, started: Instant) {
        self.stages.push(StageTiming {
            stage,
            elapsed: started.elapsed(),
        });
    }
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

fn deadline_exceeded(stage: Stage) -> CallError {
    CallError::new(ErrorCode::Timeout, stage, "call deadline exceeded")
}

fn denial_error(decision: &AuthorizationDecision, stage: Stage) -> CallError {
    if decision.is_unavailable() {
        CallError::new(
            ErrorCode::PolicyServiceUnavailable,
            stage,
            "policy service unavailable",
        )
    } else {
        CallError::new(ErrorCode::AuthorizationDenied, stage, "not authorized")
    }
}

fn transport_error(err: &TransportError, stage: Stage) -> CallError {
    let (code, message) = match err {
        TransportError::PeerVerification { .. } => {
            (ErrorCode::PeerVerificationFailed, "peer identity verification failed")
        }
        TransportError::Federation(FederationError::NotConfigured { .. }) => (
            ErrorCode::PeerVerificationFailed,
            "destination trust domain is not federated",
        ),
        TransportError::Federation(_) => (ErrorCode::TransportFailed, "destination trust bundle unavailable"),
        TransportError::Identity(_) => (ErrorCode::IdentityUnavailable, "no valid workload identity"),
        TransportError::Timeout { .. } => (ErrorCode::Timeout, "transport operation timed out"),
        TransportError::Protocol(_) => (ErrorCode::ProtocolViolation, "malformed frame"),
        TransportError::CircuitOpen => (ErrorCode::TransportFailed, "destination circuit open"),
        TransportError::PoolExhausted => (ErrorCode::TransportFailed, "connection pool exhausted"),
        TransportError::UnknownDestination(_) => (ErrorCode::TransportFailed, "destination has no known endpoint"),
        TransportError::Connection(_)
        | TransportError::UntrustedPeer(_)
        | TransportError::Tls(_)
        | TransportError::ShutDown => (ErrorCode::TransportFailed, "transport failure"),
    };
    tracing::debug!(stage = %stage, error = %err, code = %code, "transport failure mapped");
    CallError::new(code, stage, message)
}

fn decode_response(bytes: &[u8], request_id: Uuid) -> Result<TaskResponse, CallError> {
    let response: TaskResponse = serde_json::from_slice(bytes).map_err(|e| {
        tracing::warn!(error = %e, "malformed response envelope");
        CallError::new(
            ErrorCode::ProtocolViolation,
            Stage::Decode,
            "malformed response envelope",
        )
    })?;
    if response.request_id != request_id {
        tracing::warn!(
            expected = %request_id,
            received = %response.request_id,
            "response correlation id mismatch",
        );
        return Err(CallError::new(
            ErrorCode::ProtocolViolation,
            Stage::Decode,
            "response does not match request",
        ));
    }
    Ok(response)
}
