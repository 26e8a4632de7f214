//! Inbound dispatch guard.

use std::sync::atomic::Ordering;

use uuid::Uuid;

use super::{denial_error, AuthorizedRequest, CallOrchestrator};
use crate::error::{CallError, ErrorCode, Stage};
use crate::transport::VerifiedPeer;
use crate::types::{TaskRequest, TaskResponse};

impl CallOrchestrator {
    /// Handle one request frame from a handshake-verified peer.
    ///
    /// Order: decode the envelope, require `caller_id` to equal the verified
    /// peer, look the action up in the registry, check inbound authorization
    /// with this workload as the resource, then dispatch. Every rejection
    /// happens before the handler is called and is audited. The return value
    /// is always an encoded [`TaskResponse`].
    pub async fn handle_inbound(&self, peer: &VerifiedPeer, frame: &[u8]) -> Vec<u8> {
        let response = match self.admit(peer, frame).await {
            Ok((registration, request)) => {
                self.inbound.dispatched.fetch_add(1, Ordering::Relaxed);
                let request_id = request.request_id();
                let action = request.action().to_owned();
                match registration.handler.handle(request).await {
                    Ok(result) => {
                        tracing::debug!(
                            request_id = %request_id,
                            peer = %peer.spiffe_id(),
                            action = %action,
                            "inbound request completed",
                        );
                        TaskResponse::completed(request_id, result)
                    }
                    Err(e) => {
                        self.inbound.handler_failures.fetch_add(1, Ordering::Relaxed);
                        tracing::info!(
                            request_id = %request_id,
                            peer = %peer.spiffe_id(),
                            action = %action,
                            error = %e,
                            "inbound handler failed",
                        );
                        TaskResponse::failed(request_id, ErrorCode::HandlerFailed, e.message)
                    }
                }
            }
            Err((request_id, err)) => {
                self.inbound.rejected.fetch_add(1, Ordering::Relaxed);
                TaskResponse::failed(request_id, err.code, err.message)
            }
        };
        encode_response(&response)
    }

    async fn admit(
        &self,
        peer: &VerifiedPeer,
        frame: &[u8],
    ) -> Result<(super::registry::Registration, AuthorizedRequest), (Uuid, CallError)> {
        let request: TaskRequest = match serde_json::from_slice(frame) {
            Ok(request) => request,
            Err(e) => {
                tracing::debug!(peer = %peer.spiffe_id(), error = %e, "undecodable inbound envelope");
                let err = CallError::new(
                    ErrorCode::ProtocolViolation,
                    Stage::VerifyPeerIdentity,
                    "malformed request envelope",
                );
                return Err(self.reject(peer, None, None, err));
            }
        };
        let request_id = request.request_id;
        let action = request.task_type.as_str();

        if &request.caller_id != peer.spiffe_id() {
            tracing::warn!(
                security_event = "peer_verification_failed",
                peer = %peer.spiffe_id(),
                claimed = %request.caller_id,
                request_id = %request_id,
                "envelope caller does not match handshake identity",
            );
            let err = CallError::new(
                ErrorCode::PeerVerificationFailed,
                Stage::VerifyPeerIdentity,
                "caller identity does not match the authenticated peer",
            );
            return Err(self.reject(peer, Some(request_id), Some(action), err));
        }

        let Some(registration) = self.registry.lookup(action) else {
            let err = CallError::new(
                ErrorCode::UnknownAction,
                Stage::DispatchToHandler,
                "unknown action",
            );
            return Err(self.reject(peer, Some(request_id), Some(action), err));
        };
        if !registration.spec.permits(peer.spiffe_id()) {
            let err = CallError::new(
                ErrorCode::AuthorizationDenied,
                Stage::CheckInboundAuthz,
                "not authorized",
            );
            return Err(self.reject(peer, Some(request_id), Some(action), err));
        }

        let own = match self.identity.get_current_identity() {
            Ok(identity) => identity,
            Err(e) => {
                tracing::warn!(error = %e, "no usable local identity for inbound authorization");
                let err = CallError::new(
                    ErrorCode::IdentityUnavailable,
                    Stage::CheckInboundAuthz,
                    "no valid workload identity",
                );
                return Err(self.reject(peer, Some(request_id), Some(action), err));
            }
        };

        let context = serde_json::json!({
            "direction": "inbound",
            "required_capability": registration.spec.required_capability,
        });
        let decision = self
            .authz
            .check(peer.spiffe_id(), own.spiffe_id(), action, &context)
            .await;
        if !decision.allow {
            self.audit_denial(request_id, peer.spiffe_id(), own.spiffe_id(), action, &decision);
            let err = denial_error(&decision, Stage::CheckInboundAuthz);
            return Err(self.reject(peer, Some(request_id), Some(action), err));
        }

        let authorized = AuthorizedRequest::new(
            request.caller_id,
            request.task_type,
            request.payload,
            request_id,
            decision.policy_id,
        );
        Ok((registration, authorized))
    }

    fn reject(
        &self,
        peer: &VerifiedPeer,
        request_id: Option<Uuid>,
        action: Option<&str>,
        err: CallError,
    ) -> (Uuid, CallError) {
        tracing::info!(
            peer = %peer.spiffe_id(),
            request_id = ?request_id,
            action = ?action,
            code = %err.code,
            stage = %err.stage,
            "inbound request rejected",
        );
        if let Some(audit) = &self.audit {
            if let Err(e) = audit.log_inbound_rejected(request_id, peer.spiffe_id(), action, err.code, &err.message) {
                tracing::warn!(error = %e, "failed to write inbound rejection audit entry");
            }
        }
        (request_id.unwrap_or_else(Uuid::nil), err)
    }
}

fn encode_response(response: &TaskResponse) -> Vec<u8> {
    match serde_json::to_vec(response) {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::warn!(error = %e, "failed to encode response envelope");
            let fallback = TaskResponse::failed(
                response.request_id,
                ErrorCode::HandlerFailed,
                "response could not be encoded",
            );
            serde_json::to_vec(&fallback).unwrap_or_default()
        }
    }
}
