//! Read-through tag service.
//!
//! Tags are mutable upstream, so reads consult the remote first and cache
//! the resolution locally; the local copy answers when the upstream is
//! unreachable.  Writes are rejected.

use std::sync::Arc;

use tracing::{debug, instrument, warn};

use crate::digest::Descriptor;
use crate::error::{Error, Result};
use crate::registry::LocalRepository;
use crate::upstream::{RemoteAuthChallenger, RemoteRepository};

pub struct ProxyTagService {
    local: LocalRepository,
    remote: Arc<dyn RemoteRepository>,
    challenger: Arc<RemoteAuthChallenger>,
}

impl ProxyTagService {
    pub fn new(
        local: LocalRepository,
        remote: Arc<dyn RemoteRepository>,
        challenger: Arc<RemoteAuthChallenger>,
    ) -> Self {
        ProxyTagService {
            local,
            remote,
            challenger,
        }
    }

    /// Resolve a tag upstream-first, remembering the result locally so the
    /// fallback path has data.
    #[instrument(skip(self), fields(repo = %self.local.name(), tag))]
    pub async fn get(&self, tag: &str) -> Result<Descriptor> {
        if self.challenger.try_establish_challenges().await.is_ok() {
            match self.remote.resolve_tag(tag).await {
                Ok(descriptor) => {
                    self.local.tags().tag(tag, &descriptor).await?;
                    return Ok(descriptor);
                }
                Err(Error::ManifestUnknown(_)) => {
                    // Authoritative answer: the tag does not exist upstream.
                    return Err(Error::ManifestUnknown(format!(
                        "{}:{tag}",
                        self.local.name()
                    )));
                }
                Err(e) => {
                    warn!(error = %e, "upstream tag lookup failed; trying local cache");
                }
            }
        }
        debug!("serving tag from local cache");
        self.local.tags().get(tag).await
    }

    /// List tags upstream-first, falling back to the locally cached set.
    pub async fn all(&self) -> Result<Vec<String>> {
        if self.challenger.try_establish_challenges().await.is_ok() {
            match self.remote.all_tags().await {
                Ok(mut tags) => {
                    tags.sort();
                    return Ok(tags);
                }
                Err(e) => {
                    warn!(repo = %self.local.name(), error = %e, "upstream tag listing failed; trying local cache");
                }
            }
        }
        self.local.tags().all().await
    }

    /// Tags pointing at the given descriptor.  The tag list is taken
    /// upstream-first; each candidate resolves against the local cache.
    pub async fn lookup(&self, descriptor: &Descriptor) -> Result<Vec<String>> {
        let mut found = Vec::new();
        for tag in self.all().await? {
            if let Ok(resolved) = self.local.tags().get(&tag).await {
                if resolved.digest == descriptor.digest {
                    found.push(tag);
                }
            }
        }
        Ok(found)
    }

    /// The proxy never writes tags upstream.
    pub async fn tag(&self, _tag: &str, _descriptor: &Descriptor) -> Result<()> {
        Err(Error::Unsupported)
    }

    pub async fn untag(&self, _tag: &str) -> Result<()> {
        Err(Error::Unsupported)
    }
}
