//! meshgate CLI entry point.
//!
//! Provides `start` (run the mediation runtime with its inbound listener) and
//! `check-config` (load and validate configuration, then exit).

#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use tokio_stream::StreamExt;
use tracing::{info, warn, Instrument};
use url::Url;

use meshgate::audit::AuditLogger;
use meshgate::authz::{AuthorizationEngine, HttpPolicyService};
use meshgate::config::MeshConfig;
use meshgate::identity::{FileIdentitySource, IdentityEvent, IdentityManager};
use meshgate::orchestrator::{
    AuthorizedRequest, CallOrchestrator, HandlerError, HandlerRegistry, HandlerSpec, TaskHandler,
};
use meshgate::transport::{Endpoint, InboundHandler, InboundServer, MtlsConnector, TransportManager};
use meshgate::trust::{BundleSource, ChainedBundleSource, FileBundleSource, HttpBundleSource, TrustBundleStore};
use meshgate::types::SpiffeId;

/// meshgate: zero-trust call mediation for agent processes.
#[derive(Parser)]
#[command(name = "meshgate", version, about)]
struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Command,
}

/// Available CLI subcommands.
#[derive(Subcommand)]
enum Command {
    /// Run the runtime until Ctrl-C.
    Start,
    /// Load and validate configuration, then exit.
    CheckConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Start => handle_start().await,
        Command::CheckConfig => handle_check_config(),
    }
}

/// Built-in liveness action.
struct PingHandler;

#[async_trait]
impl TaskHandler for PingHandler {
    async fn handle(&self, request: AuthorizedRequest) -> Result<serde_json::Value, HandlerError> {
        Ok(serde_json::json!({
            "pong": true,
            "caller": request.caller().to_string(),
        }))
    }
}

/// Load, validate and summarize the configuration.
fn handle_check_config() -> anyhow::Result<()> {
    meshgate::logging::init_cli();
    let config = MeshConfig::load().context("failed to load configuration")?;
    config.validate().context("invalid configuration")?;

    println!("configuration OK");
    println!("  environment:    {}", config.environment);
    println!("  trust domain:   {}", config.trust.local_domain);
    println!("  federated:      {}", config.trust.federated.len());
    println!("  policy:         {}", config.authz.policy_endpoint);
    println!("  authz mode:     {:?}", config.authz.mode);
    println!("  destinations:   {}", config.transport.destinations.len());
    if config.server.enabled {
        println!("  listen:         {}", config.server.listen_addr);
    }
    Ok(())
}

/// Run the runtime.
async fn handle_start() -> anyhow::Result<()> {
    let config = MeshConfig::load().context("failed to load configuration")?;
    config.validate().context("invalid configuration")?;

    let _logging_guard = meshgate::logging::init_production(
        Path::new(&config.logging.logs_dir),
        config.logging.filter.as_deref(),
    )?;
    let span = meshgate::logging::runtime_span(&config.environment, &config.trust.local_domain);
    run(config).instrument(span).await
}

/// Build the components, serve until Ctrl-C, then shut down.
async fn run(config: MeshConfig) -> anyhow::Result<()> {
    info!(version = env!("CARGO_PKG_VERSION"), "meshgate starting");

    let audit = Arc::new(if config.logging.audit_log.is_empty() {
        AuditLogger::disabled()
    } else {
        AuditLogger::new(&config.logging.audit_log)
            .with_context(|| format!("failed to open audit log {}", config.logging.audit_log))?
    });

    // Identity.
    let identity = Arc::new(
        IdentityManager::new(
            Arc::new(FileIdentitySource::new(&config.identity.svid_dir)),
            config.identity.rotation_settings(),
        )
        .with_audit(Arc::clone(&audit)),
    );
    identity
        .initialize()
        .await
        .context("initial workload identity fetch failed")?;
    identity.start();

    // Trust bundles: local anchors from disk, federated ones over HTTP.
    let local_domain = config.trust.local_domain.clone();
    let http = reqwest::Client::builder()
        .build()
        .context("failed to build HTTP client")?;
    let mut endpoints = HashMap::new();
    for federated in &config.trust.federated {
        let url = Url::parse(&federated.bundle_endpoint)
            .with_context(|| format!("bad bundle endpoint for {}", federated.domain))?;
        endpoints.insert(federated.domain.clone(), url);
    }
    let bundle_sources: Vec<Arc<dyn BundleSource>> = vec![
        Arc::new(FileBundleSource::new().with_file(
            local_domain.clone(),
            config.trust.local_bundle_path(&config.identity.svid_dir),
        )),
        Arc::new(HttpBundleSource::new(http.clone(), endpoints)),
    ];
    let trust = Arc::new(TrustBundleStore::new(
        Arc::new(ChainedBundleSource::new(bundle_sources)),
        config.trust.trust_settings(),
        local_domain.clone(),
        config.trust.federated.iter().map(|f| f.domain.clone()),
    ));
    trust
        .get_bundle(&local_domain)
        .await
        .context("failed to load local trust bundle")?;
    trust.start();

    // Authorization.
    let policy_endpoint =
        Url::parse(&config.authz.policy_endpoint).context("invalid policy endpoint")?;
    let authz = Arc::new(
        AuthorizationEngine::new(
            Arc::new(HttpPolicyService::new(http, policy_endpoint)),
            config.authz.authz_settings(),
        )
        .with_audit(Arc::clone(&audit)),
    );

    // Transport.
    let connector = Arc::new(MtlsConnector::new());
    for destination in &config.transport.destinations {
        let id = SpiffeId::parse(&destination.spiffe_id)
            .with_context(|| format!("bad destination id {}", destination.spiffe_id))?;
        connector.add_endpoint(
            id,
            Endpoint {
                address: destination.address.clone(),
                server_name: destination.server_name.clone(),
            },
        );
    }
    let transport = Arc::new(
        TransportManager::new(
            connector,
            Arc::clone(&trust),
            Arc::clone(&identity),
            config.transport.transport_settings(),
        )
        .with_audit(Arc::clone(&audit)),
    );
    transport.start();

    // Orchestrator and handlers.
    let registry = Arc::new(HandlerRegistry::new());
    registry
        .register("ping", HandlerSpec::requiring("health.ping"), Arc::new(PingHandler))
        .context("failed to register built-in handlers")?;
    let orchestrator = Arc::new(
        CallOrchestrator::new(
            Arc::clone(&identity),
            Arc::clone(&authz),
            Arc::clone(&transport),
            registry,
        )
        .with_audit(Arc::clone(&audit)),
    );

    // Inbound listener.
    let server = if config.server.enabled {
        let own = identity.get_current_identity()?;
        let bundle = trust.get_bundle(&local_domain).await?;
        let handler: Arc<dyn InboundHandler> = Arc::clone(&orchestrator) as Arc<dyn InboundHandler>;
        let server = Arc::new(
            InboundServer::bind(&config.server.listen_addr, &own, &bundle, handler)
                .await
                .context("failed to start inbound listener")?,
        );
        tokio::spawn(Arc::clone(&server).serve());
        spawn_material_updater(
            Arc::clone(&server),
            Arc::clone(&identity),
            Arc::clone(&trust),
            config.trust.trust_settings().refresh_interval,
        );
        info!(addr = %server.local_addr()?, "inbound listener ready");
        Some(server)
    } else {
        None
    };

    info!("meshgate running, press Ctrl-C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    info!("shutdown requested");

    if let Some(server) = server {
        server.cancel_token().cancel();
    }
    transport.shutdown().await;
    trust.shutdown().await;
    identity.shutdown().await;
    info!("meshgate stopped");
    Ok(())
}

/// Keep the listener's certificate and client anchors current: on identity
/// rotation, and when the local bundle's sequence changes.
fn spawn_material_updater(
    server: Arc<InboundServer>,
    identity: Arc<IdentityManager>,
    trust: Arc<TrustBundleStore>,
    poll: std::time::Duration,
) {
    let cancel = server.cancel_token();
    let mut events = identity.watch();
    tokio::spawn(async move {
        let local_domain = trust.local_domain().to_owned();
        let mut applied_sequence = trust.cached(&local_domain).map(|b| b.sequence());
        let mut ticker = tokio::time::interval(poll);
        ticker.tick().await;
        loop {
            let rotated = tokio::select! {
                () = cancel.cancelled() => break,
                event = events.next() => match event {
                    Some(IdentityEvent::Rotated(_)) => true,
                    Some(IdentityEvent::Expired { .. }) => continue,
                    None => break,
                },
                _ = ticker.tick() => false,
            };
            let Some(bundle) = trust.cached(&local_domain) else {
                continue;
            };
            if !rotated && applied_sequence == Some(bundle.sequence()) {
                continue;
            }
            let own = match identity.get_current_identity() {
                Ok(own) => own,
                Err(e) => {
                    warn!(error = %e, "cannot refresh inbound TLS material");
                    continue;
                }
            };
            match server.update_material(&own, &bundle) {
                Ok(()) => applied_sequence = Some(bundle.sequence()),
                Err(e) => warn!(error = %e, "failed to refresh inbound TLS material"),
            }
        }
    });
}
