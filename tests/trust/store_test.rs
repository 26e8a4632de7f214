//! Tests for `TrustBundleStore`: caching, sequencing, federation changes.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use meshgate::trust::{
    BundleSource, FederationError, StaticBundleSource, TrustBundle, TrustBundleStore,
    TrustSettings,
};

use crate::common::{TestPki, DOMAIN};

const PARTNER: &str = "partner.org";

/// Counts fetches and delegates to a static source.
struct CountingSource {
    inner: StaticBundleSource,
    fetches: AtomicUsize,
}

impl CountingSource {
    fn new(inner: StaticBundleSource) -> Self {
        Self {
            inner,
            fetches: AtomicUsize::new(0),
        }
    }

    fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BundleSource for CountingSource {
    async fn fetch(&self, trust_domain: &str) -> Result<TrustBundle, FederationError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.inner.fetch(trust_domain).await
    }
}

fn store(source: Arc<dyn BundleSource>, settings: TrustSettings) -> Arc<TrustBundleStore> {
    Arc::new(TrustBundleStore::new(
        source,
        settings,
        DOMAIN,
        vec![PARTNER.to_owned()],
    ))
}

#[tokio::test]
async fn first_use_fetches_then_serves_from_cache() {
    let local = TestPki::new(DOMAIN);
    let source = Arc::new(CountingSource::new(
        StaticBundleSource::new().with_bundle(local.bundle(1)),
    ));
    let store = store(Arc::clone(&source) as Arc<dyn BundleSource>, TrustSettings::default());

    assert!(store.cached(DOMAIN).is_none());
    let first = store.get_bundle(DOMAIN).await.expect("bundle");
    let second = store.get_bundle(DOMAIN).await.expect("bundle");
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(first.anchors(), &[local.ca_der()]);
    assert_eq!(source.fetches(), 1);
}

#[tokio::test]
async fn unconfigured_domain_is_rejected_without_fetching() {
    let source = Arc::new(CountingSource::new(StaticBundleSource::new()));
    let store = store(Arc::clone(&source) as Arc<dyn BundleSource>, TrustSettings::default());

    let err = store.get_bundle("stranger.org").await.expect_err("unknown");
    assert_eq!(
        err,
        FederationError::NotConfigured {
            domain: "stranger.org".to_owned()
        }
    );
    assert_eq!(source.fetches(), 0);
}

#[tokio::test]
async fn older_sequence_never_replaces_newer() {
    let local = TestPki::new(DOMAIN);
    let store = store(Arc::new(StaticBundleSource::new()), TrustSettings::default());

    store.install(local.bundle(5)).expect("install");
    let current = store.install(local.bundle(3)).expect("install");
    assert_eq!(current.sequence(), 5);
    assert_eq!(store.cached(DOMAIN).expect("cached").sequence(), 5);

    let current = store.install(local.bundle(6)).expect("install");
    assert_eq!(current.sequence(), 6);
}

#[tokio::test]
async fn failed_refresh_keeps_previous_bundle() {
    let local = TestPki::new(DOMAIN);
    let source = Arc::new(StaticBundleSource::new().with_bundle(local.bundle(1)));
    let store = store(Arc::clone(&source) as Arc<dyn BundleSource>, TrustSettings::default());
    store.get_bundle(DOMAIN).await.expect("bundle");

    source.remove(DOMAIN);
    let err = store.refresh(DOMAIN).await.expect_err("source lost the domain");
    assert!(matches!(err, FederationError::Unavailable { .. }), "got {err:?}");

    let held = store.get_bundle(DOMAIN).await.expect("still served");
    assert_eq!(held.sequence(), 1);
}

#[tokio::test]
async fn federation_update_notification_installs_new_anchors() {
    let partner = TestPki::new(PARTNER);
    let rotated = TestPki::new(PARTNER);
    let source = Arc::new(StaticBundleSource::new().with_bundle(partner.bundle(1)));
    let store = store(Arc::clone(&source) as Arc<dyn BundleSource>, TrustSettings::default());
    store.get_bundle(PARTNER).await.expect("bundle");

    source.set(rotated.bundle(2));
    let updated = store.notify_federation_update(PARTNER).await.expect("update");
    assert_eq!(updated.sequence(), 2);
    assert_eq!(updated.anchors(), &[rotated.ca_der()]);
}

#[tokio::test]
async fn federated_domains_can_be_added_and_removed() {
    let other = TestPki::new("other.org");
    let source = Arc::new(StaticBundleSource::new().with_bundle(other.bundle(1)));
    let store = store(Arc::clone(&source) as Arc<dyn BundleSource>, TrustSettings::default());

    assert!(store.get_bundle("other.org").await.is_err());
    assert!(store.add_federated_domain("other.org"));
    assert!(!store.add_federated_domain("other.org"));
    assert!(!store.add_federated_domain(DOMAIN), "local domain is not federated");
    store.get_bundle("other.org").await.expect("now configured");
    assert_eq!(
        store.domains(),
        vec![DOMAIN.to_owned(), "other.org".to_owned(), PARTNER.to_owned()]
    );

    assert!(store.remove_domain("other.org"));
    assert!(store.cached("other.org").is_none());
    assert!(matches!(
        store.get_bundle("other.org").await,
        Err(FederationError::NotConfigured { .. })
    ));
    assert!(!store.remove_domain(DOMAIN), "local domain cannot be removed");
}

#[tokio::test]
async fn bundle_arriving_after_removal_is_not_installed() {
    let other = TestPki::new("other.org");
    let source = Arc::new(StaticBundleSource::new().with_bundle(other.bundle(1)));
    let store = store(Arc::clone(&source) as Arc<dyn BundleSource>, TrustSettings::default());
    assert!(store.add_federated_domain("other.org"));
    store.get_bundle("other.org").await.expect("configured");

    // A refresh that fetched before the removal lands afterwards.
    assert!(store.remove_domain("other.org"));
    let err = store.install(other.bundle(2)).expect_err("domain removed");
    assert!(matches!(err, FederationError::NotConfigured { .. }), "got {err:?}");
    assert!(store.cached("other.org").is_none());
}

/// Returns a bundle for the wrong domain.
struct MisroutedSource(TrustBundle);

#[async_trait]
impl BundleSource for MisroutedSource {
    async fn fetch(&self, _trust_domain: &str) -> Result<TrustBundle, FederationError> {
        Ok(self.0.clone())
    }
}

#[tokio::test]
async fn bundle_for_another_domain_is_refused() {
    let partner = TestPki::new(PARTNER);
    let store = store(
        Arc::new(MisroutedSource(partner.bundle(1))),
        TrustSettings::default(),
    );
    let err = store.get_bundle(DOMAIN).await.expect_err("misrouted");
    assert!(matches!(err, FederationError::Invalid { .. }), "got {err:?}");
    assert!(store.cached(DOMAIN).is_none());
}

/// Never answers.
struct StalledSource;

#[async_trait]
impl BundleSource for StalledSource {
    async fn fetch(&self, _trust_domain: &str) -> Result<TrustBundle, FederationError> {
        std::future::pending().await
    }
}

#[tokio::test(start_paused = true)]
async fn stalled_fetch_times_out_as_unavailable() {
    let store = store(
        Arc::new(StalledSource),
        TrustSettings {
            refresh_interval: Duration::from_secs(300),
            fetch_timeout: Duration::from_secs(2),
        },
    );
    let err = store.get_bundle(PARTNER).await.expect_err("timeout");
    assert!(matches!(err, FederationError::Unavailable { .. }), "got {err:?}");
}

#[tokio::test(start_paused = true)]
async fn background_refresh_picks_up_new_bundles() {
    let local = TestPki::new(DOMAIN);
    let partner = TestPki::new(PARTNER);
    let source = Arc::new(
        StaticBundleSource::new()
            .with_bundle(local.bundle(1))
            .with_bundle(partner.bundle(1)),
    );
    let store = store(
        Arc::clone(&source) as Arc<dyn BundleSource>,
        TrustSettings {
            refresh_interval: Duration::from_secs(60),
            fetch_timeout: Duration::from_secs(5),
        },
    );
    store.get_bundle(DOMAIN).await.expect("bundle");
    store.start();

    source.set(local.bundle(2));
    tokio::time::sleep(Duration::from_secs(61)).await;

    assert_eq!(store.cached(DOMAIN).expect("local").sequence(), 2);
    assert_eq!(store.cached(PARTNER).expect("partner").sequence(), 1);
    store.shutdown().await;
}
