//! Pull-through manifest store.
//!
//! Unlike blobs, manifests are small and re-requested often, so the whole
//! payload is cached locally before serving.  The store is read-only
//! towards clients: `put` is always rejected, and `exists`/`delete` act on
//! the local cache only.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, instrument};

use crate::digest::{Descriptor, Digest};
use crate::error::{Error, Result};
use crate::metrics::{CacheLabels, CacheStatus, MetricsRegistry};
use crate::reference::CanonicalReference;
use crate::registry::{LocalRepository, Manifest};
use crate::scheduler::TtlScheduler;
use crate::upstream::{RemoteAuthChallenger, RemoteRepository};

pub struct ProxyManifestStore {
    local: LocalRepository,
    remote: Arc<dyn RemoteRepository>,
    scheduler: TtlScheduler,
    challenger: Arc<RemoteAuthChallenger>,
    ttl: Option<Duration>,
    metrics: MetricsRegistry,
}

impl ProxyManifestStore {
    pub fn new(
        local: LocalRepository,
        remote: Arc<dyn RemoteRepository>,
        scheduler: TtlScheduler,
        challenger: Arc<RemoteAuthChallenger>,
        ttl: Option<Duration>,
        metrics: MetricsRegistry,
    ) -> Self {
        ProxyManifestStore {
            local,
            remote,
            scheduler,
            challenger,
            ttl,
            metrics,
        }
    }

    /// Serve a manifest, fetching and caching from upstream on a miss.
    #[instrument(skip(self), fields(repo = %self.local.name(), %digest))]
    pub async fn get(&self, digest: &Digest) -> Result<Manifest> {
        match self.local.manifests().get(digest).await {
            Ok(manifest) => {
                self.metrics.metrics.manifest_requests.get_or_create(&CacheLabels {
                    status: CacheStatus::Hit,
                }).inc();
                self.schedule_ttl(digest);
                return Ok(manifest);
            }
            Err(Error::ManifestUnknown(_)) => {}
            Err(e) => return Err(e),
        }

        self.metrics.metrics.manifest_requests.get_or_create(&CacheLabels {
            status: CacheStatus::Miss,
        }).inc();

        self.challenger.try_establish_challenges().await?;
        let manifest = self.remote.get_manifest(digest).await?;
        self.local
            .manifests()
            .put(manifest.payload.clone(), &manifest.media_type)
            .await?;
        debug!(size = manifest.payload.len(), "manifest cached from upstream");
        self.schedule_ttl(digest);
        Ok(manifest)
    }

    /// The proxy is read-only for manifests.
    pub async fn put(&self, _payload: Bytes, _media_type: &str) -> Result<Descriptor> {
        Err(Error::Unsupported)
    }

    /// Local cache membership only; the upstream is not probed.
    pub async fn exists(&self, digest: &Digest) -> Result<bool> {
        self.local.manifests().exists(digest).await
    }

    /// Delete from the local cache only.
    pub async fn delete(&self, digest: &Digest) -> Result<()> {
        self.local.manifests().delete(digest).await
    }

    fn schedule_ttl(&self, digest: &Digest) {
        if let Some(ttl) = self.ttl {
            let reference = CanonicalReference::new(self.local.name().clone(), digest.clone());
            self.scheduler.add_manifest(&reference, ttl);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::OCTET_STREAM;
    use crate::registry::LocalRegistry;
    use crate::scheduler::{EntryKind, ExpiryCallback};
    use crate::storage::FilesystemDriver;
    use crate::upstream::{ByteStream, CredentialStore};
    use async_trait::async_trait;
    use futures::FutureExt;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const OCI_MANIFEST_TYPE: &str = "application/vnd.oci.image.manifest.v1+json";

    struct MockRemote {
        manifests: HashMap<Digest, Bytes>,
        fetches: AtomicUsize,
    }

    impl MockRemote {
        fn new(payloads: Vec<Bytes>) -> Self {
            MockRemote {
                manifests: payloads
                    .into_iter()
                    .map(|p| (Digest::from_bytes(&p), p))
                    .collect(),
                fetches: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl RemoteRepository for MockRemote {
        async fn stat_blob(&self, digest: &Digest) -> Result<Descriptor> {
            Err(Error::BlobUnknown(digest.clone()))
        }

        async fn open_blob(&self, digest: &Digest) -> Result<(Descriptor, ByteStream)> {
            Err(Error::BlobUnknown(digest.clone()))
        }

        async fn get_manifest(&self, digest: &Digest) -> Result<Manifest> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            let payload = self
                .manifests
                .get(digest)
                .cloned()
                .ok_or_else(|| Error::ManifestUnknown(digest.to_string()))?;
            Ok(Manifest {
                digest: digest.clone(),
                media_type: OCI_MANIFEST_TYPE.to_string(),
                payload,
            })
        }

        async fn resolve_tag(&self, tag: &str) -> Result<Descriptor> {
            Err(Error::ManifestUnknown(tag.to_string()))
        }

        async fn all_tags(&self) -> Result<Vec<String>> {
            Ok(Vec::new())
        }
    }

    struct Fixture {
        _temp: tempfile::TempDir,
        registry: LocalRegistry,
        scheduler: TtlScheduler,
        remote: Arc<MockRemote>,
    }

    async fn fixture(remote: MockRemote) -> (Fixture, ProxyManifestStore) {
        let temp = tempfile::tempdir().unwrap();
        let driver = Arc::new(
            FilesystemDriver::new(temp.path().join("registry"))
                .await
                .unwrap(),
        );
        let registry = LocalRegistry::new(driver.clone());

        let noop: ExpiryCallback = Arc::new(|_| async { Ok(()) }.boxed());
        let scheduler = TtlScheduler::new(driver, "scheduler-state.json", noop.clone(), noop);
        scheduler.start().await.unwrap();

        let challenger = Arc::new(
            RemoteAuthChallenger::new(
                &"http://upstream.invalid".parse().unwrap(),
                reqwest::Client::new(),
                CredentialStore::default(),
            )
            .unwrap(),
        );
        challenger
            .manager()
            .record(challenger.endpoint(), Vec::new());

        let remote = Arc::new(remote);
        let store = ProxyManifestStore::new(
            registry.repository("library/app".parse().unwrap()),
            remote.clone() as Arc<dyn RemoteRepository>,
            scheduler.clone(),
            challenger,
            Some(Duration::from_secs(3600)),
            MetricsRegistry::new(),
        );

        (
            Fixture {
                _temp: temp,
                registry,
                scheduler,
                remote,
            },
            store,
        )
    }

    #[tokio::test]
    async fn miss_fetches_caches_and_schedules() {
        let payload = Bytes::from_static(br#"{"schemaVersion":2,"layers":[]}"#);
        let digest = Digest::from_bytes(&payload);
        let (fx, store) = fixture(MockRemote::new(vec![payload.clone()])).await;

        let manifest = store.get(&digest).await.unwrap();
        assert_eq!(manifest.payload, payload);
        assert_eq!(manifest.media_type, OCI_MANIFEST_TYPE);
        assert_eq!(fx.remote.fetches.load(Ordering::SeqCst), 1);

        let local = fx
            .registry
            .repository("library/app".parse().unwrap())
            .manifests();
        assert!(local.exists(&digest).await.unwrap());

        let pending = fx.scheduler.pending();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].kind, EntryKind::Manifest);
    }

    #[tokio::test]
    async fn hit_serves_local_and_refreshes_ttl() {
        let payload = Bytes::from_static(br#"{"schemaVersion":2}"#);
        let digest = Digest::from_bytes(&payload);
        let (fx, store) = fixture(MockRemote::new(vec![payload.clone()])).await;

        store.get(&digest).await.unwrap();
        let first_expiry = fx.scheduler.pending()[0].expiry;

        let manifest = store.get(&digest).await.unwrap();
        assert_eq!(manifest.payload, payload);
        assert_eq!(fx.remote.fetches.load(Ordering::SeqCst), 1, "hit must not refetch");
        assert!(fx.scheduler.pending()[0].expiry >= first_expiry);
    }

    #[tokio::test]
    async fn put_is_rejected_and_leaves_state_unchanged() {
        let (fx, store) = fixture(MockRemote::new(Vec::new())).await;
        let payload = Bytes::from_static(br#"{"schemaVersion":2}"#);
        let digest = Digest::from_bytes(&payload);

        let err = store.put(payload, OCI_MANIFEST_TYPE).await.unwrap_err();
        assert!(matches!(err, Error::Unsupported));

        let local = fx
            .registry
            .repository("library/app".parse().unwrap())
            .manifests();
        assert!(!local.exists(&digest).await.unwrap());
        assert!(fx.scheduler.pending().is_empty());
    }

    #[tokio::test]
    async fn exists_and_delete_are_local_only() {
        let payload = Bytes::from_static(br#"{"schemaVersion":2,"tag":"x"}"#);
        let digest = Digest::from_bytes(&payload);
        let (fx, store) = fixture(MockRemote::new(vec![payload])).await;

        assert!(!store.exists(&digest).await.unwrap());
        assert_eq!(
            fx.remote.fetches.load(Ordering::SeqCst),
            0,
            "exists must not probe upstream"
        );

        store.get(&digest).await.unwrap();
        assert!(store.exists(&digest).await.unwrap());

        store.delete(&digest).await.unwrap();
        assert!(!store.exists(&digest).await.unwrap());
    }

    #[tokio::test]
    async fn unknown_manifest_propagates() {
        let (_fx, store) = fixture(MockRemote::new(Vec::new())).await;
        let digest = Digest::from_bytes(b"no-such-manifest");
        assert!(matches!(
            store.get(&digest).await,
            Err(Error::ManifestUnknown(_))
        ));
    }

    #[tokio::test]
    async fn octet_stream_not_served_for_manifests() {
        // A cached manifest keeps the media type the upstream declared.
        let payload = Bytes::from_static(br#"{"schemaVersion":2,"config":{}}"#);
        let digest = Digest::from_bytes(&payload);
        let (_fx, store) = fixture(MockRemote::new(vec![payload])).await;

        store.get(&digest).await.unwrap();
        let cached = store.get(&digest).await.unwrap();
        assert_eq!(cached.media_type, OCI_MANIFEST_TYPE);
        assert_ne!(cached.media_type, OCTET_STREAM);
    }
}
