//! Inbound action registry.
//!
//! Maps an action name to its handler plus the metadata the orchestrator
//! checks before dispatch. Handlers only ever see an [`AuthorizedRequest`],
//! which nothing outside the orchestrator can construct.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use uuid::Uuid;

use crate::types::SpiffeId;

/// A request that passed peer verification and inbound authorization.
#[derive(Debug, Clone)]
pub struct AuthorizedRequest {
    caller: SpiffeId,
    action: String,
    payload: serde_json::Value,
    request_id: Uuid,
    policy_id: Option<String>,
}

impl AuthorizedRequest {
    pub(super) fn new(
        caller: SpiffeId,
        action: String,
        payload: serde_json::Value,
        request_id: Uuid,
        policy_id: Option<String>,
    ) -> Self {
        Self {
            caller,
            action,
            payload,
            request_id,
            policy_id,
        }
    }

    /// Handshake-verified identity of the caller.
    pub fn caller(&self) -> &SpiffeId {
        &self.caller
    }

    /// Authorized action.
    pub fn action(&self) -> &str {
        &self.action
    }

    /// Business payload.
    pub fn payload(&self) -> &serde_json::Value {
        &self.payload
    }

    /// Correlation id from the envelope.
    pub fn request_id(&self) -> Uuid {
        self.request_id
    }

    /// Policy rule that allowed the call, if one matched.
    pub fn policy_id(&self) -> Option<&str> {
        self.policy_id.as_deref()
    }
}

/// Failure reported by a handler. The message is sent to the caller as is.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct HandlerError {
    /// Caller-safe description.
    pub message: String,
}

impl HandlerError {
    /// Handler error with `message`.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Business logic behind one action.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Run the action.
    async fn handle(&self, request: AuthorizedRequest) -> Result<serde_json::Value, HandlerError>;
}

/// Dispatch metadata for a registered action.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HandlerSpec {
    /// Capability the action represents. Sent to the policy service as
    /// `context.required_capability`.
    pub required_capability: Option<String>,
    /// When set, only these callers may invoke the action, whatever the
    /// policy says.
    pub allowed_callers: Option<HashSet<SpiffeId>>,
}

impl HandlerSpec {
    /// Spec requiring `capability`.
    pub fn requiring(capability: impl Into<String>) -> Self {
        Self {
            required_capability: Some(capability.into()),
            allowed_callers: None,
        }
    }

    /// Restrict the action to `callers`.
    #[must_use]
    pub fn allow_callers(mut self, callers: impl IntoIterator<Item = SpiffeId>) -> Self {
        self.allowed_callers = Some(callers.into_iter().collect());
        self
    }

    pub(super) fn permits(&self, caller: &SpiffeId) -> bool {
        self.allowed_callers
            .as_ref()
            .map_or(true, |allowed| allowed.contains(caller))
    }
}

/// The action already has a handler.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("handler already registered for action '{0}'")]
pub struct DuplicateHandler(pub String);

#[derive(Clone)]
pub(super) struct Registration {
    pub(super) handler: Arc<dyn TaskHandler>,
    pub(super) spec: HandlerSpec,
}

/// Action name to handler mapping.
#[derive(Default)]
pub struct HandlerRegistry {
    entries: RwLock<HashMap<String, Registration>>,
}

impl HandlerRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `action`.
    ///
    /// # Errors
    ///
    /// [`DuplicateHandler`] if the action is taken.
    pub fn register(
        &self,
        action: impl Into<String>,
        spec: HandlerSpec,
        handler: Arc<dyn TaskHandler>,
    ) -> Result<(), DuplicateHandler> {
        let action = action.into();
        let mut entries = self.entries.write();
        if entries.contains_key(&action) {
            return Err(DuplicateHandler(action));
        }
        tracing::info!(action = %action, capability = ?spec.required_capability, "handler registered");
        entries.insert(action, Registration { handler, spec });
        Ok(())
    }

    /// Remove the handler for `action`.
    pub fn unregister(&self, action: &str) -> bool {
        self.entries.write().remove(action).is_some()
    }

    /// Registered action names, sorted.
    pub fn actions(&self) -> Vec<String> {
        let mut actions: Vec<_> = self.entries.read().keys().cloned().collect();
        actions.sort();
        actions
    }

    /// Whether `action` has a handler.
    pub fn contains(&self, action: &str) -> bool {
        self.entries.read().contains_key(action)
    }

    pub(super) fn lookup(&self, action: &str) -> Option<Registration> {
        self.entries.read().get(action).cloned()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("actions", &self.actions())
            .finish()
    }
}
