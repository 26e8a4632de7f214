//! Trust bundles per trust domain, including federated domains.
//!
//! Bundles are held as `Arc<TrustBundle>` in a map and swapped whole, so a
//! reader never observes a half-updated anchor set. A bundle with a lower
//! sequence number never replaces a newer one, and a failed refresh keeps
//! serving the bundle already held.

mod source;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::CertificateDer;
use rustls::RootCertStore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub use source::{
    BundleSource, ChainedBundleSource, FileBundleSource, HttpBundleSource, StaticBundleSource,
};

/// Verification anchors for one trust domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrustBundle {
    trust_domain: String,
    anchors: Vec<CertificateDer<'static>>,
    sequence: u64,
    refreshed_at: DateTime<Utc>,
}

impl TrustBundle {
    /// Build a bundle stamped with the current time.
    ///
    /// # Errors
    ///
    /// Returns [`FederationError::Invalid`] when `anchors` is empty.
    pub fn new(
        trust_domain: impl Into<String>,
        anchors: Vec<CertificateDer<'static>>,
        sequence: u64,
    ) -> Result<Self, FederationError> {
        let trust_domain = trust_domain.into();
        if anchors.is_empty() {
            return Err(FederationError::Invalid {
                domain: trust_domain,
                reason: "bundle has no trust anchors".to_owned(),
            });
        }
        Ok(Self {
            trust_domain,
            anchors,
            sequence,
            refreshed_at: Utc::now(),
        })
    }

    /// Build a bundle from concatenated PEM certificates.
    ///
    /// # Errors
    ///
    /// Returns [`FederationError::Invalid`] for unparseable PEM or no anchors.
    pub fn from_pem(
        trust_domain: impl Into<String>,
        pem: &[u8],
        sequence: u64,
    ) -> Result<Self, FederationError> {
        let trust_domain = trust_domain.into();
        let anchors = CertificateDer::pem_slice_iter(pem)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| FederationError::Invalid {
                domain: trust_domain.clone(),
                reason: format!("unparseable PEM: {e}"),
            })?;
        Self::new(trust_domain, anchors, sequence)
    }

    /// Trust domain the anchors belong to.
    pub fn trust_domain(&self) -> &str {
        &self.trust_domain
    }

    /// DER trust anchors.
    pub fn anchors(&self) -> &[CertificateDer<'static>] {
        &self.anchors
    }

    /// Monotonic version number.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// When this version was fetched.
    pub fn refreshed_at(&self) -> DateTime<Utc> {
        self.refreshed_at
    }

    /// The anchors as a rustls root store.
    ///
    /// # Errors
    ///
    /// Returns [`FederationError::Invalid`] if an anchor is not a usable CA.
    pub fn root_store(&self) -> Result<RootCertStore, FederationError> {
        let mut roots = RootCertStore::empty();
        for anchor in &self.anchors {
            roots.add(anchor.clone()).map_err(|e| FederationError::Invalid {
                domain: self.trust_domain.clone(),
                reason: format!("unusable trust anchor: {e}"),
            })?;
        }
        Ok(roots)
    }
}

/// Failure to obtain verification material for a trust domain.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FederationError {
    /// The domain is neither local nor federated.
    #[error("trust domain '{domain}' is not configured")]
    NotConfigured {
        /// Requested domain.
        domain: String,
    },
    /// The bundle endpoint could not be reached.
    #[error("trust bundle for '{domain}' unavailable: {reason}")]
    Unavailable {
        /// Requested domain.
        domain: String,
        /// Underlying failure.
        reason: String,
    },
    /// The endpoint returned an unusable bundle.
    #[error("trust bundle for '{domain}' invalid: {reason}")]
    Invalid {
        /// Requested domain.
        domain: String,
        /// What was wrong.
        reason: String,
    },
}

/// Store timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrustSettings {
    /// Period of the background refresh.
    pub refresh_interval: Duration,
    /// Bound on a single bundle fetch.
    pub fetch_timeout: Duration,
}

impl Default for TrustSettings {
    fn default() -> Self {
        Self {
            refresh_interval: Duration::from_secs(300),
            fetch_timeout: Duration::from_secs(10),
        }
    }
}

/// Trust bundles for the local domain and every federated domain.
pub struct TrustBundleStore {
    source: Arc<dyn BundleSource>,
    settings: TrustSettings,
    local_domain: String,
    federated: RwLock<HashSet<String>>,
    bundles: RwLock<HashMap<String, Arc<TrustBundle>>>,
    cancel: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl TrustBundleStore {
    /// Store for `local_domain` plus the given federated domains.
    pub fn new(
        source: Arc<dyn BundleSource>,
        settings: TrustSettings,
        local_domain: impl Into<String>,
        federated: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            source,
            settings,
            local_domain: local_domain.into(),
            federated: RwLock::new(federated.into_iter().collect()),
            bundles: RwLock::new(HashMap::new()),
            cancel: CancellationToken::new(),
            worker: Mutex::new(None),
        }
    }

    /// The process's own trust domain.
    pub fn local_domain(&self) -> &str {
        &self.local_domain
    }

    /// Whether `domain` is local or federated.
    pub fn is_configured(&self, domain: &str) -> bool {
        domain == self.local_domain || self.federated.read().contains(domain)
    }

    /// Local domain followed by federated domains in sorted order.
    pub fn domains(&self) -> Vec<String> {
        let mut federated: Vec<String> = self.federated.read().iter().cloned().collect();
        federated.sort();
        let mut domains = vec![self.local_domain.clone()];
        domains.extend(federated);
        domains
    }

    /// Bundle for `domain`, fetching it on first use.
    ///
    /// # Errors
    ///
    /// [`FederationError::NotConfigured`] for unknown domains; fetch failures
    /// when nothing is cached yet.
    pub async fn get_bundle(&self, domain: &str) -> Result<Arc<TrustBundle>, FederationError> {
        if !self.is_configured(domain) {
            return Err(FederationError::NotConfigured {
                domain: domain.to_owned(),
            });
        }
        if let Some(bundle) = self.cached(domain) {
            return Ok(bundle);
        }
        tracing::debug!(trust_domain = domain, "trust bundle cache miss, fetching");
        self.refresh(domain).await
    }

    /// The held bundle, without fetching.
    pub fn cached(&self, domain: &str) -> Option<Arc<TrustBundle>> {
        self.bundles.read().get(domain).cloned()
    }

    /// Fetch `domain` now. On failure the held bundle (if any) stays in place.
    ///
    /// # Errors
    ///
    /// The fetch failure.
    pub async fn refresh(&self, domain: &str) -> Result<Arc<TrustBundle>, FederationError> {
        if !self.is_configured(domain) {
            return Err(FederationError::NotConfigured {
                domain: domain.to_owned(),
            });
        }
        let fetched = tokio::time::timeout(self.settings.fetch_timeout, self.source.fetch(domain))
            .await
            .map_err(|_| FederationError::Unavailable {
                domain: domain.to_owned(),
                reason: format!("fetch timed out after {:?}", self.settings.fetch_timeout),
            })
            .and_then(|result| result);

        match fetched {
            Ok(bundle) if bundle.trust_domain() != domain => Err(FederationError::Invalid {
                domain: domain.to_owned(),
                reason: format!("source returned bundle for '{}'", bundle.trust_domain()),
            }),
            Ok(bundle) => self.install(bundle),
            Err(e) => {
                tracing::warn!(
                    trust_domain = domain,
                    error = %e,
                    kept_previous = self.cached(domain).is_some(),
                    "trust bundle refresh failed",
                );
                Err(e)
            }
        }
    }

    /// Refresh every configured domain, logging failures.
    pub async fn refresh_all(&self) {
        for domain in self.domains() {
            // Failures are logged by `refresh` and the previous bundle stays.
            let _ = self.refresh(&domain).await;
        }
    }

    /// A federation partner announced new anchors for `domain`.
    ///
    /// # Errors
    ///
    /// Same as [`refresh`](Self::refresh).
    pub async fn notify_federation_update(
        &self,
        domain: &str,
    ) -> Result<Arc<TrustBundle>, FederationError> {
        tracing::info!(trust_domain = domain, "federation update notification");
        self.refresh(domain).await
    }

    /// Start trusting a federated domain. Returns `false` if already configured.
    pub fn add_federated_domain(&self, domain: impl Into<String>) -> bool {
        let domain = domain.into();
        if domain == self.local_domain {
            return false;
        }
        self.federated.write().insert(domain)
    }

    /// Stop trusting a federated domain and drop its bundle. The local domain
    /// cannot be removed. Returns whether the domain was present.
    pub fn remove_domain(&self, domain: &str) -> bool {
        if domain == self.local_domain {
            return false;
        }
        // Same lock order as `install`, so an in-flight refresh cannot
        // reinstall the bundle after removal.
        let mut bundles = self.bundles.write();
        let removed = self.federated.write().remove(domain);
        bundles.remove(domain);
        drop(bundles);
        if removed {
            tracing::info!(trust_domain = domain, "federated trust domain removed");
        }
        removed
    }

    /// Install `bundle` unless a newer one is already held. Returns the
    /// bundle that is current afterwards.
    ///
    /// # Errors
    ///
    /// [`FederationError::NotConfigured`] if the bundle's domain is not (or
    /// no longer) trusted.
    pub fn install(&self, bundle: TrustBundle) -> Result<Arc<TrustBundle>, FederationError> {
        let mut bundles = self.bundles.write();
        if !self.is_configured(bundle.trust_domain()) {
            tracing::debug!(
                trust_domain = bundle.trust_domain(),
                "dropping bundle for unconfigured trust domain",
            );
            return Err(FederationError::NotConfigured {
                domain: bundle.trust_domain().to_owned(),
            });
        }
        if let Some(existing) = bundles.get(bundle.trust_domain()) {
            if existing.sequence() > bundle.sequence() {
                tracing::debug!(
                    trust_domain = bundle.trust_domain(),
                    held = existing.sequence(),
                    offered = bundle.sequence(),
                    "ignoring older trust bundle",
                );
                return Ok(Arc::clone(existing));
            }
        }
        let domain = bundle.trust_domain().to_owned();
        let bundle = Arc::new(bundle);
        tracing::debug!(
            trust_domain = %domain,
            sequence = bundle.sequence(),
            anchors = bundle.anchors().len(),
            "trust bundle installed",
        );
        bundles.insert(domain, Arc::clone(&bundle));
        Ok(bundle)
    }

    /// Spawn the periodic refresh worker. Calling it twice has no effect.
    pub fn start(self: &Arc<Self>) {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return;
        }
        let this = Arc::clone(self);
        *worker = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.settings.refresh_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    () = this.cancel.cancelled() => break,
                    _ = ticker.tick() => this.refresh_all().await,
                }
            }
            tracing::debug!("trust bundle refresh worker stopped");
        }));
    }

    /// Stop the refresh worker.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let worker = self.worker.lock().take();
        if let Some(handle) = worker {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "trust bundle worker ended abnormally");
            }
        }
    }
}

impl std::fmt::Debug for TrustBundleStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrustBundleStore")
            .field("local_domain", &self.local_domain)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}
