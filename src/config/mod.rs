//! Configuration loading and validation.
//!
//! Loads meshgate configuration from `./meshgate.toml` (or
//! `$MESHGATE_CONFIG_PATH`). Environment variables override file values; file
//! values override defaults. Components never read configuration themselves:
//! each section converts into the typed settings struct of its component.
//!
//! Precedence: env vars > config file > defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use url::Url;

use crate::authz::{AuthzMode, AuthzSettings, DefaultAction};
use crate::breaker::BreakerSettings;
use crate::identity::RotationSettings;
use crate::retry::RetryPolicy;
use crate::transport::{QueueMode, TransportSettings};
use crate::trust::TrustSettings;
use crate::types::SpiffeId;

/// Default config file name in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "meshgate.toml";

/// Environment name in which log-only authorization is refused.
pub const PRODUCTION: &str = "production";

/// A configuration value is out of range or inconsistent.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// A single field is invalid.
    #[error("invalid {field}: {reason}")]
    Invalid {
        /// Dotted path of the field.
        field: &'static str,
        /// What is wrong with it.
        reason: String,
    },
    /// `log_only` authorization was requested in production.
    #[error("authz.mode = \"log_only\" is not allowed when environment = \"production\"")]
    LogOnlyInProduction,
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

// ── Top-level config ────────────────────────────────────────────

/// Top-level configuration loaded from TOML.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    /// Deployment environment. `production` forbids log-only authorization.
    pub environment: String,
    /// Workload identity source and rotation.
    pub identity: IdentityConfig,
    /// Trust domains and bundle refresh.
    pub trust: TrustConfig,
    /// Policy service and decision cache.
    pub authz: AuthzConfig,
    /// Outbound channel pooling and retry.
    pub transport: TransportConfig,
    /// Inbound listener.
    pub server: ServerConfig,
    /// Log and audit destinations.
    pub logging: LoggingConfig,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            environment: "development".to_owned(),
            identity: IdentityConfig::default(),
            trust: TrustConfig::default(),
            authz: AuthzConfig::default(),
            transport: TransportConfig::default(),
            server: ServerConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl MeshConfig {
    /// Load configuration with precedence: env vars > TOML file > defaults.
    ///
    /// Config file path: `$MESHGATE_CONFIG_PATH` or `./meshgate.toml`.
    /// A missing file yields defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load() -> Result<Self> {
        Self::load_with(|key| std::env::var(key).ok())
    }

    /// [`load`](Self::load) with a custom env resolver (for testing).
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_with(env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let path = Self::config_path_with(&env);
        let mut config = Self::load_from_file(&path)?;
        config.apply_overrides(&env);
        Ok(config)
    }

    /// Load from a TOML file only, no env overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(contents) => {
                tracing::info!(path = %path.display(), "loading config from file");
                Self::from_toml(&contents)
                    .with_context(|| format!("failed to parse {}", path.display()))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "no config file found, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(anyhow::anyhow!("failed to read config file {}: {e}", path.display())),
        }
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error on malformed TOML or unknown enum values.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str).context("failed to parse config TOML")
    }

    fn config_path_with(env: impl Fn(&str) -> Option<String>) -> PathBuf {
        env("MESHGATE_CONFIG_PATH").map_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE), PathBuf::from)
    }

    /// Apply environment variable overrides (env > config > defaults).
    ///
    /// Takes a resolver function for testability (avoids unsafe `set_var` in tests).
    pub fn apply_overrides(&mut self, env: impl Fn(&str) -> Option<String>) {
        if let Some(v) = env("MESHGATE_ENVIRONMENT") {
            self.environment = v;
        }
        if let Some(v) = env("MESHGATE_TRUST_DOMAIN") {
            self.trust.local_domain = v;
        }
        if let Some(v) = env("MESHGATE_SVID_DIR") {
            self.identity.svid_dir = v;
        }
        if let Some(v) = env("MESHGATE_POLICY_ENDPOINT") {
            self.authz.policy_endpoint = v;
        }
        if let Some(v) = env("MESHGATE_POLICY_TIMEOUT_MS") {
            match v.parse() {
                Ok(n) => self.authz.timeout_ms = n,
                Err(_) => tracing::warn!(
                    var = "MESHGATE_POLICY_TIMEOUT_MS",
                    value = %v,
                    "ignoring invalid env override"
                ),
            }
        }
        if let Some(v) = env("MESHGATE_AUTHZ_MODE") {
            match v.as_str() {
                "enforce" => self.authz.mode = AuthzMode::Enforce,
                "log_only" => self.authz.mode = AuthzMode::LogOnly,
                _ => tracing::warn!(
                    var = "MESHGATE_AUTHZ_MODE",
                    value = %v,
                    "ignoring invalid env override"
                ),
            }
        }
        if let Some(v) = env("MESHGATE_LISTEN_ADDR") {
            self.server.listen_addr = v;
        }
        if let Some(v) = env("MESHGATE_AUDIT_LOG") {
            self.logging.audit_log = v;
        }
    }

    /// Whether this is a production deployment.
    pub fn is_production(&self) -> bool {
        self.environment.eq_ignore_ascii_case(PRODUCTION)
    }

    /// Check ranges and cross-field rules.
    ///
    /// # Errors
    ///
    /// The first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let fraction = self.identity.rotation_fraction;
        if !(fraction > 0.0 && fraction < 1.0) {
            return Err(invalid(
                "identity.rotation_fraction",
                format!("{fraction} is not in (0, 1)"),
            ));
        }
        if self.identity.fetch_timeout_secs == 0 {
            return Err(invalid("identity.fetch_timeout_secs", "must be non-zero"));
        }
        if self.identity.initial_backoff_ms == 0 {
            return Err(invalid("identity.initial_backoff_ms", "must be non-zero"));
        }
        if self.identity.max_backoff_secs == 0 {
            return Err(invalid("identity.max_backoff_secs", "must be non-zero"));
        }

        if self.trust.local_domain.is_empty() {
            return Err(invalid("trust.local_domain", "must be set"));
        }
        SpiffeId::from_parts(&self.trust.local_domain, "workload")
            .map_err(|e| invalid("trust.local_domain", e.to_string()))?;
        for federated in &self.trust.federated {
            if federated.domain == self.trust.local_domain {
                return Err(invalid(
                    "trust.federated",
                    format!("'{}' is the local domain", federated.domain),
                ));
            }
            Url::parse(&federated.bundle_endpoint)
                .map_err(|e| invalid("trust.federated.bundle_endpoint", e.to_string()))?;
        }
        if self.trust.refresh_interval_secs == 0 {
            return Err(invalid("trust.refresh_interval_secs", "must be non-zero"));
        }

        Url::parse(&self.authz.policy_endpoint)
            .map_err(|e| invalid("authz.policy_endpoint", e.to_string()))?;
        if self.authz.timeout_ms == 0 {
            return Err(invalid("authz.timeout_ms", "must be non-zero"));
        }
        if self.authz.cache_capacity == 0 {
            return Err(invalid("authz.cache_capacity", "must be non-zero"));
        }
        if self.authz.breaker_failure_threshold == 0 {
            return Err(invalid("authz.breaker_failure_threshold", "must be non-zero"));
        }
        if self.authz.mode == AuthzMode::LogOnly && self.is_production() {
            return Err(ConfigError::LogOnlyInProduction);
        }

        let transport = &self.transport;
        if transport.max_channels_per_destination == 0 {
            return Err(invalid("transport.max_channels_per_destination", "must be non-zero"));
        }
        if transport.retry_max_attempts == 0 {
            return Err(invalid("transport.retry_max_attempts", "must be non-zero"));
        }
        if !(0.0..=1.0).contains(&transport.retry_jitter) {
            return Err(invalid("transport.retry_jitter", "must be in [0, 1]"));
        }
        if transport.breaker_failure_threshold == 0 {
            return Err(invalid("transport.breaker_failure_threshold", "must be non-zero"));
        }
        if transport.dial_timeout_secs == 0 {
            return Err(invalid("transport.dial_timeout_secs", "must be non-zero"));
        }
        if transport.janitor_interval_secs == 0 {
            return Err(invalid("transport.janitor_interval_secs", "must be non-zero"));
        }
        if let Some(filter) = &self.logging.filter {
            tracing_subscriber::EnvFilter::try_new(filter)
                .map_err(|e| invalid("logging.filter", e.to_string()))?;
        }

        for destination in &transport.destinations {
            SpiffeId::parse(&destination.spiffe_id)
                .map_err(|e| invalid("transport.destinations.spiffe_id", e.to_string()))?;
            if destination.address.is_empty() {
                return Err(invalid("transport.destinations.address", "must be set"));
            }
        }

        Ok(())
    }
}

// ── [identity] ──────────────────────────────────────────────────

/// Workload identity settings (`[identity]`).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Directory holding `svid.pem` and `svid_key.pem`.
    pub svid_dir: String,
    /// Fraction of the lifetime kept as lead time before expiry.
    pub rotation_fraction: f64,
    /// Minimum lead time before expiry, in seconds.
    pub min_buffer_secs: u64,
    /// Bound on one fetch, in seconds.
    pub fetch_timeout_secs: u64,
    /// First retry delay after a failed fetch, in milliseconds.
    pub initial_backoff_ms: u64,
    /// Largest retry delay, in seconds.
    pub max_backoff_secs: u64,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        let rotation = RotationSettings::default();
        Self {
            svid_dir: "/run/meshgate/svid".to_owned(),
            rotation_fraction: rotation.rotation_fraction,
            min_buffer_secs: rotation.min_buffer.as_secs(),
            fetch_timeout_secs: rotation.fetch_timeout.as_secs(),
            initial_backoff_ms: u64::try_from(rotation.initial_backoff.as_millis()).unwrap_or(u64::MAX),
            max_backoff_secs: rotation.max_backoff.as_secs(),
        }
    }
}

impl IdentityConfig {
    /// Rotation schedule for the identity manager.
    pub fn rotation_settings(&self) -> RotationSettings {
        RotationSettings {
            rotation_fraction: self.rotation_fraction,
            min_buffer: Duration::from_secs(self.min_buffer_secs),
            fetch_timeout: Duration::from_secs(self.fetch_timeout_secs),
            initial_backoff: Duration::from_millis(self.initial_backoff_ms),
            max_backoff: Duration::from_secs(self.max_backoff_secs),
        }
    }
}

// ── [trust] ─────────────────────────────────────────────────────

/// Trust domain settings (`[trust]`).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TrustConfig {
    /// This workload's trust domain.
    pub local_domain: String,
    /// PEM anchors of the local domain. Defaults to `bundle.pem` in the SVID directory.
    pub local_bundle_path: Option<String>,
    /// Federated domains and their bundle endpoints.
    pub federated: Vec<FederatedDomainConfig>,
    /// Bundle refresh period, in seconds.
    pub refresh_interval_secs: u64,
    /// Bound on one bundle fetch, in seconds.
    pub fetch_timeout_secs: u64,
}

/// One federated trust domain.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FederatedDomainConfig {
    /// Trust domain name.
    pub domain: String,
    /// URL serving the domain's PEM anchors.
    pub bundle_endpoint: String,
}

impl Default for TrustConfig {
    fn default() -> Self {
        let settings = TrustSettings::default();
        Self {
            local_domain: "example.org".to_owned(),
            local_bundle_path: None,
            federated: Vec::new(),
            refresh_interval_secs: settings.refresh_interval.as_secs(),
            fetch_timeout_secs: settings.fetch_timeout.as_secs(),
        }
    }
}

impl TrustConfig {
    /// Refresh timing for the bundle store.
    pub fn trust_settings(&self) -> TrustSettings {
        TrustSettings {
            refresh_interval: Duration::from_secs(self.refresh_interval_secs),
            fetch_timeout: Duration::from_secs(self.fetch_timeout_secs),
        }
    }

    /// Path of the local bundle, given the SVID directory.
    pub fn local_bundle_path(&self, svid_dir: &str) -> PathBuf {
        self.local_bundle_path
            .as_ref()
            .map_or_else(|| Path::new(svid_dir).join("bundle.pem"), PathBuf::from)
    }
}

// ── [authz] ─────────────────────────────────────────────────────

/// Authorization settings (`[authz]`).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuthzConfig {
    /// Policy service evaluation URL.
    pub policy_endpoint: String,
    /// Bound on one policy call, in milliseconds.
    pub timeout_ms: u64,
    /// Resolution of "no matching rule".
    pub default_action: DefaultAction,
    /// `enforce` or `log_only`.
    pub mode: AuthzMode,
    /// Cache lifetime when the service gives none, in seconds.
    pub default_ttl_secs: u64,
    /// Upper bound on cache lifetime, in seconds.
    pub max_ttl_secs: u64,
    /// Maximum cached decisions.
    pub cache_capacity: usize,
    /// Consecutive failures that open the policy breaker.
    pub breaker_failure_threshold: u32,
    /// Open duration before a trial call, in seconds.
    pub breaker_recovery_secs: u64,
}

impl Default for AuthzConfig {
    fn default() -> Self {
        let settings = AuthzSettings::default();
        Self {
            policy_endpoint: "http://127.0.0.1:8181/v1/data/meshgate/authz".to_owned(),
            timeout_ms: u64::try_from(settings.timeout.as_millis()).unwrap_or(u64::MAX),
            default_action: settings.default_action,
            mode: settings.mode,
            default_ttl_secs: settings.default_ttl.as_secs(),
            max_ttl_secs: settings.max_ttl.as_secs(),
            cache_capacity: settings.cache_capacity,
            breaker_failure_threshold: settings.breaker.failure_threshold,
            breaker_recovery_secs: settings.breaker.recovery_timeout.as_secs(),
        }
    }
}

impl AuthzConfig {
    /// Engine settings.
    pub fn authz_settings(&self) -> AuthzSettings {
        AuthzSettings {
            timeout: Duration::from_millis(self.timeout_ms),
            default_action: self.default_action,
            mode: self.mode,
            default_ttl: Duration::from_secs(self.default_ttl_secs),
            max_ttl: Duration::from_secs(self.max_ttl_secs),
            cache_capacity: self.cache_capacity,
            breaker: BreakerSettings {
                failure_threshold: self.breaker_failure_threshold,
                recovery_timeout: Duration::from_secs(self.breaker_recovery_secs),
            },
        }
    }
}

// ── [transport] ─────────────────────────────────────────────────

/// Outbound transport settings (`[transport]`).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Concurrent channels per destination.
    pub max_channels_per_destination: usize,
    /// Idle channel lifetime, in seconds.
    pub idle_timeout_secs: u64,
    /// Fail immediately at the concurrency bound instead of queueing.
    pub fail_fast: bool,
    /// Callers allowed to queue per destination.
    pub max_waiters: usize,
    /// Longest queue wait, in milliseconds.
    pub max_wait_ms: u64,
    /// Bound on dial plus handshake, in seconds.
    pub dial_timeout_secs: u64,
    /// Total attempts for transient failures.
    pub retry_max_attempts: u32,
    /// First retry delay, in milliseconds.
    pub retry_initial_backoff_ms: u64,
    /// Largest retry delay, in milliseconds.
    pub retry_max_backoff_ms: u64,
    /// Jitter fraction in `[0, 1]`.
    pub retry_jitter: f64,
    /// Consecutive failures that open a destination breaker.
    pub breaker_failure_threshold: u32,
    /// Open duration before a trial dial, in seconds.
    pub breaker_recovery_secs: u64,
    /// Idle sweep period, in seconds.
    pub janitor_interval_secs: u64,
    /// Known destinations.
    pub destinations: Vec<DestinationConfig>,
}

/// Where a destination workload listens.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DestinationConfig {
    /// Expected SPIFFE ID.
    pub spiffe_id: String,
    /// `host:port`.
    pub address: String,
    /// TLS server name; defaults to the trust domain.
    #[serde(default)]
    pub server_name: Option<String>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        let settings = TransportSettings::default();
        let (max_waiters, max_wait) = match settings.queue_mode {
            QueueMode::Queue {
                max_waiters,
                max_wait,
            } => (max_waiters, max_wait),
            QueueMode::FailFast => (0, Duration::ZERO),
        };
        Self {
            max_channels_per_destination: settings.max_channels_per_destination,
            idle_timeout_secs: settings.idle_timeout.as_secs(),
            fail_fast: false,
            max_waiters,
            max_wait_ms: u64::try_from(max_wait.as_millis()).unwrap_or(u64::MAX),
            dial_timeout_secs: settings.dial_timeout.as_secs(),
            retry_max_attempts: settings.retry.max_attempts,
            retry_initial_backoff_ms: u64::try_from(settings.retry.initial_backoff.as_millis())
                .unwrap_or(u64::MAX),
            retry_max_backoff_ms: u64::try_from(settings.retry.max_backoff.as_millis())
                .unwrap_or(u64::MAX),
            retry_jitter: settings.retry.jitter,
            breaker_failure_threshold: settings.breaker.failure_threshold,
            breaker_recovery_secs: settings.breaker.recovery_timeout.as_secs(),
            janitor_interval_secs: settings.janitor_interval.as_secs(),
            destinations: Vec::new(),
        }
    }
}

impl TransportConfig {
    /// Transport manager settings.
    pub fn transport_settings(&self) -> TransportSettings {
        TransportSettings {
            max_channels_per_destination: self.max_channels_per_destination,
            idle_timeout: Duration::from_secs(self.idle_timeout_secs),
            queue_mode: if self.fail_fast {
                QueueMode::FailFast
            } else {
                QueueMode::Queue {
                    max_waiters: self.max_waiters,
                    max_wait: Duration::from_millis(self.max_wait_ms),
                }
            },
            dial_timeout: Duration::from_secs(self.dial_timeout_secs),
            retry: RetryPolicy {
                max_attempts: self.retry_max_attempts,
                initial_backoff: Duration::from_millis(self.retry_initial_backoff_ms),
                max_backoff: Duration::from_millis(self.retry_max_backoff_ms),
                jitter: self.retry_jitter,
            },
            breaker: BreakerSettings {
                failure_threshold: self.breaker_failure_threshold,
                recovery_timeout: Duration::from_secs(self.breaker_recovery_secs),
            },
            janitor_interval: Duration::from_secs(self.janitor_interval_secs),
        }
    }
}

// ── [server] / [logging] ────────────────────────────────────────

/// Inbound listener settings (`[server]`).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Whether to accept inbound calls.
    pub enabled: bool,
    /// Bind address.
    pub listen_addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen_addr: "0.0.0.0:8443".to_owned(),
        }
    }
}

/// Log and audit destinations (`[logging]`).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Directory for rotated JSON logs.
    pub logs_dir: String,
    /// Audit JSONL file. Empty disables the audit log.
    pub audit_log: String,
    /// `tracing` filter directives used when `RUST_LOG` is unset.
    pub filter: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            logs_dir: "logs".to_owned(),
            audit_log: "logs/audit.jsonl".to_owned(),
            filter: None,
        }
    }
}
