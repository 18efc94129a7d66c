//! Pull-through blob store.
//!
//! Serving order for a GET: local link, then the cross-repository mount of
//! an already-cached public blob, then a single-flight upstream fetch that
//! streams bytes to the client while persisting them locally.  At most one
//! upstream fetch runs per digest across all callers of this store; joiners
//! wait for the in-flight fetch and then serve from the local store.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::Body;
use axum::http::header::{HeaderName, HeaderValue};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::io::ReaderStream;
use tracing::{debug, instrument, warn};

use crate::digest::{Descriptor, Digest};
use crate::error::{Error, Result};
use crate::metrics::{CacheLabels, CacheStatus, MetricsRegistry};
use crate::reference::CanonicalReference;
use crate::registry::{CreateOptions, LocalRepository};
use crate::scheduler::TtlScheduler;
use crate::upstream::{RemoteAuthChallenger, RemoteRepository};

/// Records the `public=true` annotation for a freshly committed blob.
pub type SetPublicFn =
    Arc<dyn Fn(Digest, u64) -> futures::future::BoxFuture<'static, ()> + Send + Sync>;

const DOCKER_CONTENT_DIGEST: HeaderName = HeaderName::from_static("docker-content-digest");

type InflightMap = Arc<Mutex<HashMap<Digest, watch::Receiver<bool>>>>;

pub struct ProxyBlobStore {
    local: LocalRepository,
    remote: Arc<dyn RemoteRepository>,
    scheduler: TtlScheduler,
    challenger: Arc<RemoteAuthChallenger>,
    set_public: SetPublicFn,
    ttl: Option<Duration>,
    inflight: InflightMap,
    metrics: MetricsRegistry,
}

enum FlightRole {
    Leader(watch::Sender<bool>),
    Follower(watch::Receiver<bool>),
}

/// Removes the in-flight entry and wakes waiters when the leader finishes,
/// no matter how it finishes.
struct FlightGuard {
    map: InflightMap,
    digest: Digest,
    tx: watch::Sender<bool>,
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        self.map.lock().unwrap().remove(&self.digest);
        let _ = self.tx.send(true);
    }
}

impl ProxyBlobStore {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        local: LocalRepository,
        remote: Arc<dyn RemoteRepository>,
        scheduler: TtlScheduler,
        challenger: Arc<RemoteAuthChallenger>,
        set_public: SetPublicFn,
        ttl: Option<Duration>,
        metrics: MetricsRegistry,
    ) -> Self {
        ProxyBlobStore {
            local,
            remote,
            scheduler,
            challenger,
            set_public,
            ttl,
            inflight: Arc::new(Mutex::new(HashMap::new())),
            metrics,
        }
    }

    /// Stat locally first; on a miss, establish upstream auth and stat the
    /// remote.  A remote hit is not materialized locally.
    pub async fn stat(&self, digest: &Digest) -> Result<Descriptor> {
        match self.local.blobs().stat(digest).await {
            Ok(descriptor) => return Ok(descriptor),
            Err(Error::BlobUnknown(_)) => {}
            Err(e) => return Err(e),
        }
        self.challenger.try_establish_challenges().await?;
        self.remote.stat_blob(digest).await
    }

    /// Serve a blob, fetching from upstream on a local miss.  `HEAD`
    /// requests (`head = true`) walk the identical mount and fetch-on-miss
    /// path and only suppress the response body.
    #[instrument(skip(self), fields(repo = %self.local.name(), %digest))]
    pub async fn serve_blob(&self, digest: &Digest, head: bool) -> Result<Response> {
        // 1. Local hit.
        match self.serve_local(digest, head).await {
            Ok(response) => {
                self.metrics.metrics.blob_requests.get_or_create(&CacheLabels {
                    status: CacheStatus::Hit,
                }).inc();
                self.schedule_ttl(digest);
                return Ok(response);
            }
            Err(Error::BlobUnknown(_)) => {}
            Err(e) => return Err(e),
        }

        // 2. Cross-repository mount of an already-cached public blob; no
        //    network involved.
        match self
            .local
            .blobs()
            .create(CreateOptions::mount(digest.clone()))
            .await
        {
            Err(Error::BlobMounted(descriptor)) => {
                debug!(size = descriptor.size, "auto-mounted public blob");
                self.metrics.metrics.blob_mounts.inc();
                self.schedule_ttl(digest);
                return self.serve_local(digest, head).await;
            }
            Err(Error::BlobUnknown(_)) => {}
            Err(e) => warn!(error = %e, "auto-mount attempt failed"),
            Ok(writer) => writer.cancel().await,
        }

        self.metrics.metrics.blob_requests.get_or_create(&CacheLabels {
            status: CacheStatus::Miss,
        }).inc();

        // 3. Single-flight upstream fetch.
        match self.join_flight(digest) {
            FlightRole::Follower(mut rx) => {
                let _ = rx.changed().await;
                match self.serve_local(digest, head).await {
                    Ok(response) => {
                        self.schedule_ttl(digest);
                        Ok(response)
                    }
                    Err(Error::BlobUnknown(_)) => Err(Error::UpstreamUnavailable(
                        "concurrent upstream fetch failed".to_string(),
                    )),
                    Err(e) => Err(e),
                }
            }
            FlightRole::Leader(tx) => self.fetch_and_serve(digest, tx, head).await,
        }
    }

    /// Delete this repository's link to a blob in the local cache; the
    /// upstream is never touched.
    pub async fn delete(&self, digest: &Digest) -> Result<()> {
        self.local.blobs().delete(digest).await
    }

    fn join_flight(&self, digest: &Digest) -> FlightRole {
        let mut map = self.inflight.lock().unwrap();
        if let Some(rx) = map.get(digest) {
            FlightRole::Follower(rx.clone())
        } else {
            let (tx, rx) = watch::channel(false);
            map.insert(digest.clone(), rx);
            FlightRole::Leader(tx)
        }
    }

    /// Leader path: open the upstream blob and stream it to the client
    /// while persisting locally.  The local write commits only on a clean
    /// EOF with a matching digest.  For `HEAD` the response carries the
    /// headers alone; the fetch still persists the blob.
    async fn fetch_and_serve(
        &self,
        digest: &Digest,
        tx: watch::Sender<bool>,
        head: bool,
    ) -> Result<Response> {
        let guard = FlightGuard {
            map: Arc::clone(&self.inflight),
            digest: digest.clone(),
            tx,
        };

        // The blob may have been committed between our miss and taking
        // leadership.
        if let Ok(response) = self.serve_local(digest, head).await {
            self.schedule_ttl(digest);
            return Ok(response);
        }

        self.challenger.try_establish_challenges().await?;
        self.metrics.metrics.upstream_fetches.inc();

        let (descriptor, mut stream) = self.remote.open_blob(digest).await?;
        let mut writer = self
            .local
            .blobs()
            .create(CreateOptions::for_digest(digest))
            .await?;

        let (body_tx, response) = if head {
            (None, blob_response(&descriptor, Body::empty()))
        } else {
            let (body_tx, body_rx) = mpsc::channel::<std::io::Result<Bytes>>(8);
            let body = Body::from_stream(ReceiverStream::new(body_rx));
            (Some(body_tx), blob_response(&descriptor, body))
        };

        let digest = digest.clone();
        let local = self.local.clone();
        let scheduler = self.scheduler.clone();
        let set_public = Arc::clone(&self.set_public);
        let ttl = self.ttl;
        let metrics = self.metrics.clone();
        tokio::spawn(async move {
            let mut failure: Option<Error> = None;
            loop {
                match stream.next().await {
                    Some(Ok(chunk)) => {
                        if let Err(e) = writer.write(&chunk).await {
                            failure = Some(e);
                            break;
                        }
                        if let Some(body_tx) = &body_tx {
                            if body_tx.send(Ok(chunk)).await.is_err() {
                                failure = Some(Error::UpstreamUnavailable(
                                    "client disconnected mid-stream".to_string(),
                                ));
                                break;
                            }
                        }
                    }
                    Some(Err(e)) => {
                        failure = Some(e);
                        break;
                    }
                    None => break,
                }
            }

            match failure {
                None => match writer.commit(&digest).await {
                    Ok(committed) => {
                        debug!(%digest, size = committed.size, "blob committed from upstream");
                        (set_public)(digest.clone(), committed.size).await;
                        if let Some(ttl) = ttl {
                            let reference =
                                CanonicalReference::new(local.name().clone(), digest.clone());
                            scheduler.add_blob(&reference, ttl);
                        }
                    }
                    Err(e) => {
                        warn!(%digest, error = %e, "discarding upstream blob");
                        metrics.metrics.upstream_fetch_failures.inc();
                        if let Some(body_tx) = &body_tx {
                            let _ =
                                body_tx.send(Err(std::io::Error::other(e.to_string()))).await;
                        }
                    }
                },
                Some(e) => {
                    warn!(%digest, error = %e, "upstream blob fetch aborted");
                    metrics.metrics.upstream_fetch_failures.inc();
                    writer.cancel().await;
                    if let Some(body_tx) = &body_tx {
                        let _ = body_tx.send(Err(std::io::Error::other(e.to_string()))).await;
                    }
                }
            }

            drop(guard);
        });

        Ok(response)
    }

    async fn serve_local(&self, digest: &Digest, head: bool) -> Result<Response> {
        if head {
            let descriptor = self.local.blobs().stat(digest).await?;
            return Ok(blob_response(&descriptor, Body::empty()));
        }
        let (descriptor, reader) = self.local.blobs().open(digest).await?;
        Ok(blob_response(
            &descriptor,
            Body::from_stream(ReaderStream::new(reader)),
        ))
    }

    fn schedule_ttl(&self, digest: &Digest) {
        if let Some(ttl) = self.ttl {
            let reference = CanonicalReference::new(self.local.name().clone(), digest.clone());
            self.scheduler.add_blob(&reference, ttl);
        }
    }
}

/// Build a 200 response with registry headers for a blob body.
fn blob_response(descriptor: &Descriptor, body: Body) -> Response {
    let mut response = (StatusCode::OK, body).into_response();
    let headers = response.headers_mut();
    insert_header(headers, header::CONTENT_TYPE, &descriptor.media_type);
    if descriptor.size > 0 {
        insert_header(headers, header::CONTENT_LENGTH, &descriptor.size.to_string());
    }
    insert_header(headers, DOCKER_CONTENT_DIGEST, &descriptor.digest.to_string());
    insert_header(headers, header::ETAG, &format!("\"{}\"", descriptor.digest));
    response
}

fn insert_header(headers: &mut axum::http::HeaderMap, name: HeaderName, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        headers.insert(name, value);
    }
}
