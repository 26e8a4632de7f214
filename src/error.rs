//! Boundary error taxonomy.
//!
//! Every failure that leaves the [`CallOrchestrator`](crate::orchestrator::CallOrchestrator)
//! is a [`CallError`]: a machine-readable [`ErrorCode`], the [`Stage`] that
//! failed, and a caller-safe message. Component error types never cross this
//! boundary; internal detail stays in the logs.

use serde::{Deserialize, Serialize};

/// Machine-readable error code carried on the wire and in [`CallError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// No valid workload identity (never fetched, or expired and not refreshed).
    IdentityUnavailable,
    /// The policy service explicitly denied the call, or no rule matched.
    AuthorizationDenied,
    /// The policy service could not be consulted; treated as a deny.
    PolicyServiceUnavailable,
    /// The peer's handshake identity did not match what was expected.
    PeerVerificationFailed,
    /// Dial or send failure, open circuit, or exhausted pool.
    TransportFailed,
    /// A deadline elapsed.
    Timeout,
    /// Malformed envelope or frame.
    ProtocolViolation,
    /// The requested action has no registered handler.
    UnknownAction,
    /// The business handler returned an error.
    HandlerFailed,
}

impl ErrorCode {
    /// Stable snake_case name used in logs and on the wire.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::IdentityUnavailable => "identity_unavailable",
            Self::AuthorizationDenied => "authorization_denied",
            Self::PolicyServiceUnavailable => "policy_service_unavailable",
            Self::PeerVerificationFailed => "peer_verification_failed",
            Self::TransportFailed => "transport_failed",
            Self::Timeout => "timeout",
            Self::ProtocolViolation => "protocol_violation",
            Self::UnknownAction => "unknown_action",
            Self::HandlerFailed => "handler_failed",
        }
    }

    /// Whether a caller may reasonably retry the whole call later.
    ///
    /// Denials, verification failures and protocol violations are final.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::IdentityUnavailable
                | Self::PolicyServiceUnavailable
                | Self::TransportFailed
                | Self::Timeout
        )
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A step of the outbound or inbound call state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Outbound: obtain the current workload identity.
    ResolveIdentity,
    /// Outbound: ask the policy service whether we may call the target.
    CheckOutboundAuthz,
    /// Outbound: lease a pooled channel or dial a new one.
    AcquireChannel,
    /// Outbound: write the request frame (with retry and breaker).
    Send,
    /// Outbound: wait for the response frame.
    AwaitResponse,
    /// Outbound: parse the response envelope.
    Decode,
    /// Outbound: the remote peer reported a failure.
    Remote,
    /// Inbound: check the handshake identity against the envelope.
    VerifyPeerIdentity,
    /// Inbound: ask the policy service whether the caller may invoke the action.
    CheckInboundAuthz,
    /// Inbound: run the registered handler.
    DispatchToHandler,
    /// Inbound: serialize the response envelope.
    EncodeResponse,
}

impl Stage {
    /// Stable snake_case name used in logs.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ResolveIdentity => "resolve_identity",
            Self::CheckOutboundAuthz => "check_outbound_authz",
            Self::AcquireChannel => "acquire_channel",
            Self::Send => "send",
            Self::AwaitResponse => "await_response",
            Self::Decode => "decode",
            Self::Remote => "remote",
            Self::VerifyPeerIdentity => "verify_peer_identity",
            Self::CheckInboundAuthz => "check_inbound_authz",
            Self::DispatchToHandler => "dispatch_to_handler",
            Self::EncodeResponse => "encode_response",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The single failure type returned by the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{code} during {stage}: {message}")]
pub struct CallError {
    /// Machine-readable failure kind.
    pub code: ErrorCode,
    /// The state machine step that failed.
    pub stage: Stage,
    /// Caller-safe description. Never contains certificate or policy internals.
    pub message: String,
}

impl CallError {
    /// Build a call error.
    pub fn new(code: ErrorCode, stage: Stage, message: impl Into<String>) -> Self {
        Self {
            code,
            stage,
            message: message.into(),
        }
    }

    /// Shorthand for [`ErrorCode::is_retryable`].
    pub fn is_retryable(&self) -> bool {
        self.code.is_retryable()
    }
}
