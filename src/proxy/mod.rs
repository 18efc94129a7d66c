//! The proxied registry: composes per-repository pull-through blob,
//! manifest, and tag services over the embedded local namespace, one shared
//! TTL scheduler, and one shared upstream auth challenger.
//!
//! Expiry callbacks are registered at construction: a fired blob entry
//! unlinks the blob from its repository, drops its descriptor record, and
//! vacuums the CAS data; a fired manifest entry does the same for the
//! manifest revision.  After the scheduler starts, a supervised background
//! scan marks every blob already present locally as `public=true`, seeding
//! auto-mount eligibility for content cached by previous runs.

pub mod blobs;
pub mod manifests;
pub mod tags;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context as _;
use futures::FutureExt;
use reqwest::Url;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::ProxyConfig;
use crate::digest::Digest;
use crate::error::Error;
use crate::metrics::{ArtifactKind, ExpiryLabels, MetricsRegistry};
use crate::reference::RepositoryName;
use crate::registry::{blob_data_path, LocalRegistry};
use crate::scheduler::{ExpiryCallback, TtlScheduler};
use crate::upstream::{
    CredentialStore, HttpRemoteRepository, RemoteAuthChallenger, RemoteRepository, TokenSource,
};

pub use blobs::{ProxyBlobStore, SetPublicFn};
pub use manifests::ProxyManifestStore;
pub use tags::ProxyTagService;

/// Storage-driver key of the scheduler snapshot.
const SCHEDULER_STATE_PATH: &str = "scheduler-state.json";

/// A repository's pull-through service set.
pub struct ProxiedRepository {
    pub blobs: ProxyBlobStore,
    pub manifests: ProxyManifestStore,
    pub tags: ProxyTagService,
}

/// Registry acting as a pull-through cache in front of one upstream.
pub struct ProxiedRegistry {
    local: LocalRegistry,
    scheduler: TtlScheduler,
    challenger: Arc<RemoteAuthChallenger>,
    remote_url: Url,
    client: reqwest::Client,
    ttl: Option<Duration>,
    metrics: MetricsRegistry,
    scan: Mutex<Option<JoinHandle<()>>>,
    stop: CancellationToken,
}

impl ProxiedRegistry {
    /// Build the registry, start the scheduler, and launch the startup
    /// public-blob scan.
    pub async fn new(
        config: &ProxyConfig,
        local: LocalRegistry,
        client: reqwest::Client,
        metrics: MetricsRegistry,
    ) -> anyhow::Result<Self> {
        let remote_url: Url = config
            .remoteurl
            .parse()
            .with_context(|| format!("invalid proxy.remoteurl: {}", config.remoteurl))?;

        let scheduler = TtlScheduler::new(
            Arc::clone(local.driver()),
            SCHEDULER_STATE_PATH,
            Self::blob_expiry(&local, &metrics),
            Self::manifest_expiry(&local, &metrics),
        );
        scheduler
            .start()
            .await
            .context("failed to start ttl scheduler")?;

        let credentials =
            CredentialStore::new(config.username.clone(), config.password.clone());
        let challenger = Arc::new(
            RemoteAuthChallenger::new(&remote_url, client.clone(), credentials)
                .map_err(|e| anyhow::anyhow!("challenger setup failed: {e}"))?,
        );

        let stop = CancellationToken::new();
        let scan = {
            let local = local.clone();
            let token = stop.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = token.cancelled() => {}
                    _ = set_blobs_public(local) => {}
                }
            })
        };

        info!(remote = %remote_url, ttl = ?config.ttl(), "proxied registry ready");
        Ok(ProxiedRegistry {
            local,
            scheduler,
            challenger,
            remote_url,
            client,
            ttl: config.ttl(),
            metrics,
            scan: Mutex::new(Some(scan)),
            stop,
        })
    }

    /// The pull-through service set for one repository, wired to a
    /// token-authorized upstream transport scoped `repository:<name>:pull`.
    pub fn repository(&self, name: RepositoryName) -> ProxiedRepository {
        let local = self.local.repository(name.clone());
        let tokens = TokenSource::new(
            self.client.clone(),
            Arc::clone(&self.challenger),
            format!("repository:{name}:pull"),
        );
        let remote: Arc<dyn RemoteRepository> = Arc::new(HttpRemoteRepository::new(
            self.client.clone(),
            self.remote_url.clone(),
            name,
            tokens,
        ));

        let set_public: SetPublicFn = {
            let descriptors = self.local.descriptors().clone();
            Arc::new(move |digest: Digest, size: u64| {
                let descriptors = descriptors.clone();
                async move {
                    match descriptors.set_public(&digest, size).await {
                        Ok(true) => info!(%digest, "tagged public blob in descriptor cache"),
                        Ok(false) => {}
                        Err(e) => error!(%digest, error = %e, "error setting blob public"),
                    }
                }
                .boxed()
            })
        };

        ProxiedRepository {
            blobs: ProxyBlobStore::new(
                local.clone(),
                Arc::clone(&remote),
                self.scheduler.clone(),
                Arc::clone(&self.challenger),
                set_public,
                self.ttl,
                self.metrics.clone(),
            ),
            manifests: ProxyManifestStore::new(
                local.clone(),
                Arc::clone(&remote),
                self.scheduler.clone(),
                Arc::clone(&self.challenger),
                self.ttl,
                self.metrics.clone(),
            ),
            tags: ProxyTagService::new(local, remote, Arc::clone(&self.challenger)),
        }
    }

    pub fn scheduler(&self) -> &TtlScheduler {
        &self.scheduler
    }

    /// Stop the background scan and the scheduler; the final snapshot is
    /// flushed before this returns.
    pub async fn shutdown(&self) {
        self.stop.cancel();
        let scan = self.scan.lock().unwrap().take();
        if let Some(handle) = scan {
            let _ = handle.await;
        }
        self.scheduler.stop().await;
    }

    fn blob_expiry(local: &LocalRegistry, metrics: &MetricsRegistry) -> ExpiryCallback {
        let local = local.clone();
        let metrics = metrics.clone();
        Arc::new(move |reference| {
            let local = local.clone();
            let metrics = metrics.clone();
            async move {
                metrics
                    .metrics
                    .expirations
                    .get_or_create(&ExpiryLabels {
                        kind: ArtifactKind::Blob,
                    })
                    .inc();
                let blobs = local.repository(reference.name).blobs();
                match blobs.delete(&reference.digest).await {
                    Ok(()) | Err(Error::BlobUnknown(_)) => {}
                    Err(e) => return Err(e),
                }
                local.descriptors().remove(&reference.digest).await?;
                local.remove_blob_data(&reference.digest).await
            }
            .boxed()
        })
    }

    fn manifest_expiry(local: &LocalRegistry, metrics: &MetricsRegistry) -> ExpiryCallback {
        let local = local.clone();
        let metrics = metrics.clone();
        Arc::new(move |reference| {
            let local = local.clone();
            let metrics = metrics.clone();
            async move {
                metrics
                    .metrics
                    .expirations
                    .get_or_create(&ExpiryLabels {
                        kind: ArtifactKind::Manifest,
                    })
                    .inc();
                let manifests = local.repository(reference.name).manifests();
                match manifests.delete(&reference.digest).await {
                    Ok(()) | Err(Error::ManifestUnknown(_)) => {}
                    Err(e) => return Err(e),
                }
                local.remove_blob_data(&reference.digest).await
            }
            .boxed()
        })
    }
}

/// Mark every blob already in the local namespace as public in the
/// descriptor cache, so content cached before this process began is
/// auto-mountable.
async fn set_blobs_public(local: LocalRegistry) {
    info!("scanning for public blobs in descriptor cache");
    let digests = match local.enumerate_blobs().await {
        Ok(digests) => digests,
        Err(e) => {
            warn!(error = %e, "public blob scan failed");
            return;
        }
    };

    let mut tagged = 0usize;
    let total = digests.len();
    for digest in digests {
        let size = match local.driver().stat(&blob_data_path(&digest)).await {
            Ok(info) => info.size,
            Err(_) => 0,
        };
        match local.descriptors().set_public(&digest, size).await {
            Ok(true) => tagged += 1,
            Ok(false) => {}
            Err(e) => error!(%digest, error = %e, "error setting blob public"),
        }
    }
    info!(scanned = total, tagged, "public blob scan finished");
}
