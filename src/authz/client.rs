//! Policy service boundary and its HTTP client.

use serde::{Deserialize, Serialize};
use url::Url;

use crate::types::SpiffeId;

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

/// The document a policy is evaluated against.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PolicyInput {
    /// Workload asking.
    pub caller: SpiffeId,
    /// Workload being called.
    pub resource: SpiffeId,
    /// Action requested.
    pub action: String,
    /// Additional attributes for the policy.
    pub context: serde_json::Value,
}

/// The policy service's answer.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PolicyVerdict {
    /// Whether the matched rule allows the call.
    pub allow: bool,
    /// Human-readable explanation.
    #[serde(default)]
    pub reason: String,
    /// Rule that decided. `None` means no rule matched.
    #[serde(default)]
    pub policy_id: Option<String>,
    /// How long the decision may be cached, in seconds.
    #[serde(default)]
    pub ttl_secs: Option<u64>,
}

impl PolicyVerdict {
    /// A verdict from a matching rule.
    pub fn matched(allow: bool, policy_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            allow,
            reason: reason.into(),
            policy_id: Some(policy_id.into()),
            ttl_secs: None,
        }
    }

    /// The verdict for "no rule matched".
    pub fn no_matching_rule() -> Self {
        Self {
            allow: false,
            reason: "no matching rule".to_owned(),
            policy_id: None,
            ttl_secs: None,
        }
    }

    /// Override the cache lifetime.
    #[must_use]
    pub fn with_ttl_secs(mut self, ttl_secs: u64) -> Self {
        self.ttl_secs = Some(ttl_secs);
        self
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Failures talking to the policy service. All of them are treated as deny.
#[derive(Debug, thiserror::Error)]
pub enum PolicyServiceError {
    /// HTTP transport failure.
    #[error("policy request failed: {0}")]
    Request(#[from] reqwest::Error),
    /// The service answered with a non-success status.
    #[error("policy service returned status {status}: {body}")]
    HttpStatus {
        /// HTTP status code.
        status: u16,
        /// Truncated response body.
        body: String,
    },
    /// The response did not match the expected schema.
    #[error("policy response parse error: {0}")]
    Parse(String),
    /// The service cannot be reached for another reason.
    #[error("policy service unavailable: {0}")]
    Unavailable(String),
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Remote policy decision point.
#[async_trait::async_trait]
pub trait PolicyService: Send + Sync {
    /// Evaluate one input document.
    async fn evaluate(&self, input: &PolicyInput) -> Result<PolicyVerdict, PolicyServiceError>;
}

// ---------------------------------------------------------------------------
// HTTP implementation
// ---------------------------------------------------------------------------

const MAX_ERROR_BODY_CHARS: usize = 256;

#[derive(Serialize)]
struct PolicyRequest<'a> {
    input: &'a PolicyInput,
}

#[derive(Deserialize)]
struct PolicyResponse {
    #[serde(default)]
    result: Option<PolicyVerdict>,
}

/// POSTs `{"input": ...}` to a policy endpoint and reads `{"result": ...}`.
#[derive(Debug, Clone)]
pub struct HttpPolicyService {
    client: reqwest::Client,
    endpoint: Url,
}

impl HttpPolicyService {
    /// Client for `endpoint`. Timeouts are enforced by the engine.
    pub fn new(client: reqwest::Client, endpoint: Url) -> Self {
        Self { client, endpoint }
    }

    /// The configured endpoint.
    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

#[async_trait::async_trait]
impl PolicyService for HttpPolicyService {
    async fn evaluate(&self, input: &PolicyInput) -> Result<PolicyVerdict, PolicyServiceError> {
        let response = self
            .client
            .post(self.endpoint.clone())
            .header("content-type", "application/json")
            .json(&PolicyRequest { input })
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(PolicyServiceError::HttpStatus {
                status: status.as_u16(),
                body: truncate(&body),
            });
        }
        parse_response(&body)
    }
}

/// Parse a policy service response body. An absent `result` means the
/// policy defines nothing for this input.
pub(crate) fn parse_response(body: &str) -> Result<PolicyVerdict, PolicyServiceError> {
    let response: PolicyResponse =
        serde_json::from_str(body).map_err(|e| PolicyServiceError::Parse(e.to_string()))?;
    Ok(response
        .result
        .unwrap_or_else(PolicyVerdict::no_matching_rule))
}

fn truncate(raw: &str) -> String {
    let collapsed = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.chars().count() > MAX_ERROR_BODY_CHARS {
        let shortened: String = collapsed.chars().take(MAX_ERROR_BODY_CHARS).collect();
        return format!("{shortened}...[truncated]");
    }
    collapsed
}
