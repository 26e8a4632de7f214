//! Shared value types: workload identifiers and the task envelope.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ErrorCode;

const SPIFFE_SCHEME: &str = "spiffe://";

// ---------------------------------------------------------------------------
// SpiffeId
// ---------------------------------------------------------------------------

/// Error returned when a workload identifier cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid workload id '{raw}': {reason}")]
pub struct InvalidSpiffeId {
    /// The rejected input.
    pub raw: String,
    /// Why it was rejected.
    pub reason: &'static str,
}

/// A workload identifier of the form `spiffe://<trust-domain>/<path>`.
///
/// Comparison is exact: two ids are equal only when trust domain and path
/// match byte for byte.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SpiffeId {
    trust_domain: String,
    path: String,
}

impl SpiffeId {
    /// Parse a `spiffe://` URI.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidSpiffeId`] when the scheme, trust domain or path is
    /// malformed. Workload ids must carry a non-empty path.
    pub fn parse(raw: &str) -> Result<Self, InvalidSpiffeId> {
        let invalid = |reason| InvalidSpiffeId {
            raw: raw.to_owned(),
            reason,
        };

        let rest = raw
            .strip_prefix(SPIFFE_SCHEME)
            .ok_or_else(|| invalid("missing spiffe:// scheme"))?;
        let (domain, path) = match rest.find('/') {
            Some(idx) => rest.split_at(idx),
            None => return Err(invalid("missing workload path")),
        };

        if domain.is_empty() {
            return Err(invalid("empty trust domain"));
        }
        if !domain
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '.' | '-' | '_'))
        {
            return Err(invalid("trust domain has invalid characters"));
        }

        // `path` starts with '/'; skip it and validate each segment.
        let segments = path.get(1..).unwrap_or("");
        if segments.is_empty() {
            return Err(invalid("missing workload path"));
        }
        for segment in segments.split('/') {
            if segment.is_empty() || segment == "." || segment == ".." {
                return Err(invalid("path has an empty or relative segment"));
            }
            if !segment
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
            {
                return Err(invalid("path has invalid characters"));
            }
        }

        Ok(Self {
            trust_domain: domain.to_owned(),
            path: path.to_owned(),
        })
    }

    /// Build an id from a trust domain and a path such as `agent/search`.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidSpiffeId`] when the combination does not parse.
    pub fn from_parts(trust_domain: &str, path: &str) -> Result<Self, InvalidSpiffeId> {
        let path = path.trim_start_matches('/');
        Self::parse(&format!("{SPIFFE_SCHEME}{trust_domain}/{path}"))
    }

    /// The trust domain, e.g. `example.org`.
    pub fn trust_domain(&self) -> &str {
        &self.trust_domain
    }

    /// The workload path including its leading slash, e.g. `/agent/search`.
    pub fn path(&self) -> &str {
        &self.path
    }
}

impl std::fmt::Display for SpiffeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{SPIFFE_SCHEME}{}{}", self.trust_domain, self.path)
    }
}

impl std::str::FromStr for SpiffeId {
    type Err = InvalidSpiffeId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for SpiffeId {
    type Error = InvalidSpiffeId;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<SpiffeId> for String {
    fn from(id: SpiffeId) -> Self {
        id.to_string()
    }
}

// ---------------------------------------------------------------------------
// Task envelope
// ---------------------------------------------------------------------------

/// Request envelope sent over an authenticated channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRequest {
    /// Action name, looked up in the remote handler registry.
    pub task_type: String,
    /// Opaque business payload.
    pub payload: serde_json::Value,
    /// Identity of the calling workload. Must match the handshake identity.
    pub caller_id: SpiffeId,
    /// Correlation id echoed in the response.
    pub request_id: Uuid,
}

/// Terminal status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// The handler produced a result.
    Completed,
    /// The request was rejected or the handler failed.
    Failed,
}

/// Error payload of a failed task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireError {
    /// Machine-readable failure kind.
    pub code: ErrorCode,
    /// Caller-safe description.
    pub message: String,
}

/// Response envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResponse {
    /// Correlation id copied from the request.
    pub request_id: Uuid,
    /// Completed or failed.
    pub status: TaskStatus,
    /// Handler output when completed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    /// Failure detail when failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<WireError>,
}

impl TaskResponse {
    /// A completed response carrying `result`.
    pub fn completed(request_id: Uuid, result: serde_json::Value) -> Self {
        Self {
            request_id,
            status: TaskStatus::Completed,
            result: Some(result),
            error: None,
        }
    }

    /// A failed response carrying a code and a caller-safe message.
    pub fn failed(request_id: Uuid, code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            request_id,
            status: TaskStatus::Failed,
            result: None,
            error: Some(WireError {
                code,
                message: message.into(),
            }),
        }
    }
}
