//! Where trust bundles come from.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use url::Url;

use super::{FederationError, TrustBundle};

/// Fetches the current bundle for one trust domain.
#[async_trait]
pub trait BundleSource: Send + Sync {
    /// Fetch the bundle for `trust_domain`.
    async fn fetch(&self, trust_domain: &str) -> Result<TrustBundle, FederationError>;
}

/// Serves bundles held in memory. Used for the local domain when anchors are
/// configured on disk, and in tests.
#[derive(Debug, Default)]
pub struct StaticBundleSource {
    bundles: RwLock<HashMap<String, TrustBundle>>,
}

impl StaticBundleSource {
    /// Empty source.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a bundle.
    #[must_use]
    pub fn with_bundle(self, bundle: TrustBundle) -> Self {
        self.set(bundle);
        self
    }

    /// Add or replace a bundle in place.
    pub fn set(&self, bundle: TrustBundle) {
        self.bundles
            .write()
            .insert(bundle.trust_domain().to_owned(), bundle);
    }

    /// Forget a domain.
    pub fn remove(&self, trust_domain: &str) {
        self.bundles.write().remove(trust_domain);
    }
}

#[async_trait]
impl BundleSource for StaticBundleSource {
    async fn fetch(&self, trust_domain: &str) -> Result<TrustBundle, FederationError> {
        self.bundles
            .read()
            .get(trust_domain)
            .cloned()
            .ok_or_else(|| FederationError::Unavailable {
                domain: trust_domain.to_owned(),
                reason: "no static bundle".to_owned(),
            })
    }
}

/// Fetches PEM anchors over HTTPS from a per-domain bundle endpoint.
#[derive(Debug)]
pub struct HttpBundleSource {
    client: reqwest::Client,
    endpoints: HashMap<String, Url>,
    last_sequence: AtomicU64,
}

impl HttpBundleSource {
    /// Source with one endpoint per trust domain.
    pub fn new(client: reqwest::Client, endpoints: HashMap<String, Url>) -> Self {
        Self {
            client,
            endpoints,
            last_sequence: AtomicU64::new(0),
        }
    }

    /// Sequence numbers follow wall-clock milliseconds but never repeat.
    fn next_sequence(&self) -> u64 {
        let now = u64::try_from(Utc::now().timestamp_millis()).unwrap_or(0);
        let previous = self
            .last_sequence
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(now.max(last.saturating_add(1)))
            })
            .unwrap_or(0);
        now.max(previous.saturating_add(1))
    }
}

#[async_trait]
impl BundleSource for HttpBundleSource {
    async fn fetch(&self, trust_domain: &str) -> Result<TrustBundle, FederationError> {
        let url = self
            .endpoints
            .get(trust_domain)
            .ok_or_else(|| FederationError::NotConfigured {
                domain: trust_domain.to_owned(),
            })?;
        let unavailable = |reason: String| FederationError::Unavailable {
            domain: trust_domain.to_owned(),
            reason,
        };

        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| unavailable(e.to_string()))?;
        if !response.status().is_success() {
            return Err(unavailable(format!("bundle endpoint returned {}", response.status())));
        }
        let body = response
            .bytes()
            .await
            .map_err(|e| unavailable(e.to_string()))?;

        TrustBundle::from_pem(trust_domain, &body, self.next_sequence())
    }
}

/// Reads PEM anchors from one file per trust domain. The sequence is the
/// file's modification time in milliseconds, so rewriting the file yields a
/// newer bundle.
#[derive(Debug, Default)]
pub struct FileBundleSource {
    paths: HashMap<String, PathBuf>,
}

impl FileBundleSource {
    /// Source with no files.
    pub fn new() -> Self {
        Self::default()
    }

    /// Read `trust_domain`'s anchors from `path`.
    #[must_use]
    pub fn with_file(mut self, trust_domain: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        self.paths.insert(trust_domain.into(), path.into());
        self
    }
}

#[async_trait]
impl BundleSource for FileBundleSource {
    async fn fetch(&self, trust_domain: &str) -> Result<TrustBundle, FederationError> {
        let path = self
            .paths
            .get(trust_domain)
            .ok_or_else(|| FederationError::NotConfigured {
                domain: trust_domain.to_owned(),
            })?;
        let unavailable = |e: std::io::Error| FederationError::Unavailable {
            domain: trust_domain.to_owned(),
            reason: format!("{}: {e}", path.display()),
        };
        let pem = tokio::fs::read(path).await.map_err(unavailable)?;
        let sequence = tokio::fs::metadata(path)
            .await
            .and_then(|meta| meta.modified())
            .ok()
            .and_then(|modified| modified.duration_since(std::time::UNIX_EPOCH).ok())
            .and_then(|since| u64::try_from(since.as_millis()).ok())
            .unwrap_or(0);
        TrustBundle::from_pem(trust_domain, &pem, sequence)
    }
}

/// Tries each source in order and returns the first bundle obtained.
///
/// A source answering [`FederationError::NotConfigured`] is skipped; any other
/// failure is remembered and returned if no later source succeeds.
pub struct ChainedBundleSource {
    sources: Vec<Arc<dyn BundleSource>>,
}

impl ChainedBundleSource {
    /// Chain over `sources`, first match wins.
    pub fn new(sources: Vec<Arc<dyn BundleSource>>) -> Self {
        Self { sources }
    }
}

#[async_trait]
impl BundleSource for ChainedBundleSource {
    async fn fetch(&self, trust_domain: &str) -> Result<TrustBundle, FederationError> {
        let mut last = FederationError::NotConfigured {
            domain: trust_domain.to_owned(),
        };
        for source in &self.sources {
            match source.fetch(trust_domain).await {
                Ok(bundle) => return Ok(bundle),
                Err(FederationError::NotConfigured { .. }) => {}
                Err(e) => last = e,
            }
        }
        Err(last)
    }
}

impl std::fmt::Debug for ChainedBundleSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainedBundleSource")
            .field("sources", &self.sources.len())
            .finish()
    }
}

#[async_trait]
impl<T: BundleSource + ?Sized> BundleSource for Arc<T> {
    async fn fetch(&self, trust_domain: &str) -> Result<TrustBundle, FederationError> {
        (**self).fetch(trust_domain).await
    }
}
