//! Tracing setup for the runtime and for one-shot commands.
//!
//! `start` installs three layers over one filter:
//! - a daily-rotated JSON file with every event, tagged with the runtime span
//!   (environment and trust domain)
//! - a daily-rotated JSON file holding only security events
//! - human-readable output on stderr
//!
//! Security events (peer verification failures, inbound rejections, breaker
//! transitions, stale identity) are emitted at `warn` with a
//! [`SECURITY_EVENT_FIELD`] field naming the event. They never carry
//! certificate or key material; the JSONL audit log in [`crate::audit`] is the
//! durable record, this is the operator's view.

use std::path::Path;

use anyhow::Context;
use tracing::Metadata;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::filter_fn;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Filter used when neither `RUST_LOG` nor `[logging] filter` is set. TLS and
/// HTTP client internals are noisy at `info`.
pub const DEFAULT_DIRECTIVES: &str = "info,rustls=warn,reqwest=warn,hyper_util=warn";

/// File name prefix of the rotated JSON log.
pub const LOG_FILE_PREFIX: &str = "meshgate.log";

/// File name prefix of the rotated security event log.
pub const SECURITY_LOG_PREFIX: &str = "meshgate-security.log";

/// Field that marks an event as security relevant.
pub const SECURITY_EVENT_FIELD: &str = "security_event";

/// Keeps the non-blocking file writers alive.
///
/// Dropping it flushes pending entries and closes both files, so hold it for
/// the life of the process.
pub struct LoggingGuard {
    _events: WorkerGuard,
    _security: WorkerGuard,
}

/// Filter precedence: `RUST_LOG`, then the configured directives, then
/// [`DEFAULT_DIRECTIVES`]. Unparseable configured directives fall back to the
/// default.
pub fn env_filter(configured: Option<&str>) -> EnvFilter {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }
    configured
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_DIRECTIVES))
}

/// Whether the event declares a [`SECURITY_EVENT_FIELD`].
pub fn is_security_event(metadata: &Metadata<'_>) -> bool {
    metadata.is_event() && metadata.fields().field(SECURITY_EVENT_FIELD).is_some()
}

/// Root span for the running process. Events logged inside it carry the
/// deployment environment and the local trust domain in the JSON log.
pub fn runtime_span(environment: &str, trust_domain: &str) -> tracing::Span {
    tracing::info_span!("meshgate", environment = %environment, trust_domain = %trust_domain)
}

/// Initialise logging for `start`.
///
/// Writes `{logs_dir}/meshgate.log.YYYY-MM-DD` and
/// `{logs_dir}/meshgate-security.log.YYYY-MM-DD`, and mirrors events to
/// stderr. `filter` is the `[logging] filter` setting.
///
/// # Errors
///
/// Returns an error if the logs directory cannot be created or a global
/// subscriber is already installed.
pub fn init_production(logs_dir: &Path, filter: Option<&str>) -> anyhow::Result<LoggingGuard> {
    std::fs::create_dir_all(logs_dir)
        .with_context(|| format!("failed to create logs directory {}", logs_dir.display()))?;

    let (events, events_guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::daily(logs_dir, LOG_FILE_PREFIX));
    let (security, security_guard) = tracing_appender::non_blocking(
        tracing_appender::rolling::daily(logs_dir, SECURITY_LOG_PREFIX),
    );

    let json_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(false)
        .with_writer(events);

    let security_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(false)
        .with_writer(security)
        .with_filter(filter_fn(is_security_event));

    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);

    tracing_subscriber::registry()
        .with(env_filter(filter))
        .with(json_layer)
        .with(security_layer)
        .with(console_layer)
        .try_init()
        .context("failed to install tracing subscriber")?;

    Ok(LoggingGuard {
        _events: events_guard,
        _security: security_guard,
    })
}

/// Initialise stderr-only logging for `check-config`. Calling it when a
/// subscriber is already installed has no effect.
pub fn init_cli() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter(None))
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}
