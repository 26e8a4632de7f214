//! Coverage for config parsing, env overrides and validation.

use std::collections::HashMap;
use std::time::Duration;

use meshgate::authz::{AuthzMode, DefaultAction};
use meshgate::config::{ConfigError, MeshConfig};
use meshgate::transport::QueueMode;

fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let map: HashMap<String, String> = pairs
        .iter()
        .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
        .collect();
    move |key| map.get(key).cloned()
}

fn parse(toml_str: &str) -> MeshConfig {
    match MeshConfig::from_toml(toml_str) {
        Ok(config) => config,
        Err(err) => panic!("config should parse: {err:#}"),
    }
}

#[test]
fn defaults_are_valid() {
    let config = MeshConfig::default();
    assert!(config.validate().is_ok());
    assert!(!config.is_production());
    assert_eq!(config.authz.mode, AuthzMode::Enforce);
    assert_eq!(config.authz.default_action, DefaultAction::Deny);
}

#[test]
fn parse_full_config() {
    let config = parse(
        r#"
environment = "staging"

[identity]
svid_dir = "/var/run/svid"
rotation_fraction = 0.4
min_buffer_secs = 45

[trust]
local_domain = "prod.example.org"
refresh_interval_secs = 120

[[trust.federated]]
domain = "partner.org"
bundle_endpoint = "https://bundles.partner.org/bundle.pem"

[authz]
policy_endpoint = "http://opa.local:8181/v1/data/mesh/allow"
timeout_ms = 750
default_action = "allow"
mode = "log_only"
max_ttl_secs = 120

[transport]
max_channels_per_destination = 8
fail_fast = true
retry_max_attempts = 5

[[transport.destinations]]
spiffe_id = "spiffe://prod.example.org/agent/search"
address = "search.internal:8443"
server_name = "search.internal"

[server]
listen_addr = "127.0.0.1:9443"

[logging]
audit_log = "/var/log/meshgate/audit.jsonl"
"#,
    );

    assert_eq!(config.environment, "staging");
    assert_eq!(config.identity.svid_dir, "/var/run/svid");
    let rotation = config.identity.rotation_settings();
    assert!((rotation.rotation_fraction - 0.4).abs() < f64::EPSILON);
    assert_eq!(rotation.min_buffer, Duration::from_secs(45));

    assert_eq!(config.trust.local_domain, "prod.example.org");
    assert_eq!(config.trust.federated.len(), 1);
    assert_eq!(config.trust.federated[0].domain, "partner.org");
    assert_eq!(
        config.trust.trust_settings().refresh_interval,
        Duration::from_secs(120)
    );

    let authz = config.authz.authz_settings();
    assert_eq!(authz.timeout, Duration::from_millis(750));
    assert_eq!(authz.default_action, DefaultAction::Allow);
    assert_eq!(authz.mode, AuthzMode::LogOnly);
    assert_eq!(authz.max_ttl, Duration::from_secs(120));

    let transport = config.transport.transport_settings();
    assert_eq!(transport.max_channels_per_destination, 8);
    assert_eq!(transport.queue_mode, QueueMode::FailFast);
    assert_eq!(transport.retry.max_attempts, 5);
    assert_eq!(config.transport.destinations.len(), 1);
    assert_eq!(
        config.transport.destinations[0].server_name.as_deref(),
        Some("search.internal")
    );

    assert_eq!(config.server.listen_addr, "127.0.0.1:9443");
    assert_eq!(config.logging.audit_log, "/var/log/meshgate/audit.jsonl");
    assert!(config.validate().is_ok());
}

#[test]
fn unknown_mode_is_a_parse_error() {
    let result = MeshConfig::from_toml("[authz]\nmode = \"permissive\"\n");
    assert!(result.is_err());
}

#[test]
fn log_only_is_refused_in_production() {
    let config = parse("environment = \"production\"\n[authz]\nmode = \"log_only\"\n");
    assert!(config.is_production());
    assert_eq!(config.validate(), Err(ConfigError::LogOnlyInProduction));

    let enforcing = parse("environment = \"Production\"\n");
    assert!(enforcing.validate().is_ok());
}

#[test]
fn rotation_fraction_must_be_a_proper_fraction() {
    for fraction in ["0.0", "1.0", "1.5", "-0.2"] {
        let config = parse(&format!("[identity]\nrotation_fraction = {fraction}\n"));
        match config.validate() {
            Err(ConfigError::Invalid { field, .. }) => {
                assert_eq!(field, "identity.rotation_fraction");
            }
            other => panic!("fraction {fraction} should be rejected, got {other:?}"),
        }
    }
}

#[test]
fn malformed_trust_domain_is_rejected() {
    let config = parse("[trust]\nlocal_domain = \"Bad Domain\"\n");
    assert!(matches!(
        config.validate(),
        Err(ConfigError::Invalid {
            field: "trust.local_domain",
            ..
        })
    ));
}

#[test]
fn local_domain_cannot_be_federated() {
    let config = parse(
        r#"
[trust]
local_domain = "example.org"

[[trust.federated]]
domain = "example.org"
bundle_endpoint = "https://example.org/bundle"
"#,
    );
    assert!(matches!(
        config.validate(),
        Err(ConfigError::Invalid {
            field: "trust.federated",
            ..
        })
    ));
}

#[test]
fn federated_endpoint_must_be_a_url() {
    let config = parse(
        r#"
[[trust.federated]]
domain = "partner.org"
bundle_endpoint = "not a url"
"#,
    );
    assert!(matches!(
        config.validate(),
        Err(ConfigError::Invalid {
            field: "trust.federated.bundle_endpoint",
            ..
        })
    ));
}

#[test]
fn destination_needs_a_spiffe_id() {
    let config = parse(
        r#"
[[transport.destinations]]
spiffe_id = "https://search.internal"
address = "search.internal:8443"
"#,
    );
    assert!(matches!(
        config.validate(),
        Err(ConfigError::Invalid {
            field: "transport.destinations.spiffe_id",
            ..
        })
    ));
}

#[test]
fn zero_limits_are_rejected() {
    let config = parse("[transport]\nmax_channels_per_destination = 0\n");
    assert!(config.validate().is_err());
    let config = parse("[authz]\ntimeout_ms = 0\n");
    assert!(config.validate().is_err());
}

#[test]
fn env_overrides_file_values() {
    let mut config = parse("environment = \"staging\"\n[authz]\ntimeout_ms = 900\n");
    config.apply_overrides(env(&[
        ("MESHGATE_ENVIRONMENT", "production"),
        ("MESHGATE_TRUST_DOMAIN", "prod.example.org"),
        ("MESHGATE_POLICY_TIMEOUT_MS", "250"),
        ("MESHGATE_AUTHZ_MODE", "log_only"),
        ("MESHGATE_LISTEN_ADDR", "127.0.0.1:7443"),
    ]));

    assert!(config.is_production());
    assert_eq!(config.trust.local_domain, "prod.example.org");
    assert_eq!(config.authz.timeout_ms, 250);
    assert_eq!(config.authz.mode, AuthzMode::LogOnly);
    assert_eq!(config.server.listen_addr, "127.0.0.1:7443");
    assert_eq!(config.validate(), Err(ConfigError::LogOnlyInProduction));
}

#[test]
fn invalid_env_values_are_ignored() {
    let mut config = parse("[authz]\ntimeout_ms = 900\n");
    config.apply_overrides(env(&[
        ("MESHGATE_POLICY_TIMEOUT_MS", "soon"),
        ("MESHGATE_AUTHZ_MODE", "yolo"),
    ]));
    assert_eq!(config.authz.timeout_ms, 900);
    assert_eq!(config.authz.mode, AuthzMode::Enforce);
}

#[test]
fn missing_file_yields_defaults() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = MeshConfig::load_from_file(&dir.path().join("absent.toml")).expect("defaults");
    assert_eq!(config.trust.local_domain, MeshConfig::default().trust.local_domain);
}

#[test]
fn load_reads_the_file_named_by_env() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("mesh.toml");
    std::fs::write(&path, "[trust]\nlocal_domain = \"file.example.org\"\n").expect("write config");
    let path = path.to_string_lossy().into_owned();

    let config = MeshConfig::load_with(env(&[
        ("MESHGATE_CONFIG_PATH", path.as_str()),
        ("MESHGATE_SVID_DIR", "/tmp/svid"),
    ]))
    .expect("load");
    assert_eq!(config.trust.local_domain, "file.example.org");
    assert_eq!(config.identity.svid_dir, "/tmp/svid");
}

#[test]
fn malformed_file_is_an_error() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("broken.toml");
    std::fs::write(&path, "[trust\nlocal_domain = ").expect("write config");
    assert!(MeshConfig::load_from_file(&path).is_err());
}

#[test]
fn zero_intervals_are_rejected() {
    for (toml_str, expected) in [
        ("[transport]\njanitor_interval_secs = 0\n", "transport.janitor_interval_secs"),
        ("[identity]\ninitial_backoff_ms = 0\n", "identity.initial_backoff_ms"),
        ("[identity]\nmax_backoff_secs = 0\n", "identity.max_backoff_secs"),
    ] {
        match parse(toml_str).validate() {
            Err(ConfigError::Invalid { field, .. }) => assert_eq!(field, expected),
            other => panic!("{expected} = 0 should be rejected, got {other:?}"),
        }
    }
}

#[test]
fn logging_filter_must_parse() {
    let config = parse("[logging]\nfilter = \"meshgate=debug,rustls=warn\"\n");
    assert_eq!(config.logging.filter.as_deref(), Some("meshgate=debug,rustls=warn"));
    assert!(config.validate().is_ok());

    let config = parse("[logging]\nfilter = \"meshgate=loud\"\n");
    assert!(matches!(
        config.validate(),
        Err(ConfigError::Invalid {
            field: "logging.filter",
            ..
        })
    ));
}
