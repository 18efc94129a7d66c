//! Remote repository client.
//!
//! Speaks the pull subset of the OCI Distribution v1 API against the
//! upstream registry, attaching `Authorization` headers supplied by the
//! per-repository [`TokenSource`].  The proxy stores depend on the
//! [`RemoteRepository`] trait rather than this concrete client.

use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt, TryStreamExt};
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE};
use reqwest::{Response, StatusCode, Url};
use serde::Deserialize;
use tracing::debug;

use crate::digest::{Descriptor, Digest, Digester, OCTET_STREAM};
use crate::error::{Error, Result};
use crate::reference::RepositoryName;
use crate::registry::Manifest;

use super::TokenSource;

/// Stream of blob bytes from the upstream.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// Manifest media types the proxy accepts from upstream.
const MANIFEST_ACCEPT: &str = "application/vnd.docker.distribution.manifest.v2+json, \
     application/vnd.docker.distribution.manifest.list.v2+json, \
     application/vnd.oci.image.manifest.v1+json, \
     application/vnd.oci.image.index.v1+json";

const DOCKER_CONTENT_DIGEST: &str = "Docker-Content-Digest";

/// Read-only view of one repository on the upstream registry.
#[async_trait]
pub trait RemoteRepository: Send + Sync {
    /// Stat a blob without fetching its bytes.
    async fn stat_blob(&self, digest: &Digest) -> Result<Descriptor>;

    /// Open a streaming read of a blob.
    async fn open_blob(&self, digest: &Digest) -> Result<(Descriptor, ByteStream)>;

    /// Fetch a manifest by digest; the payload is digest-verified.
    async fn get_manifest(&self, digest: &Digest) -> Result<Manifest>;

    /// Resolve a tag to the descriptor of the manifest it names.
    async fn resolve_tag(&self, tag: &str) -> Result<Descriptor>;

    /// List every tag in the repository.
    async fn all_tags(&self) -> Result<Vec<String>>;
}

#[derive(Debug, Deserialize)]
struct TagList {
    #[allow(dead_code)]
    name: String,
    #[serde(default)]
    tags: Vec<String>,
}

/// HTTP implementation of [`RemoteRepository`].
pub struct HttpRemoteRepository {
    client: reqwest::Client,
    base: Url,
    name: RepositoryName,
    tokens: TokenSource,
}

impl HttpRemoteRepository {
    pub fn new(
        client: reqwest::Client,
        base: Url,
        name: RepositoryName,
        tokens: TokenSource,
    ) -> Self {
        HttpRemoteRepository {
            client,
            base,
            name,
            tokens,
        }
    }

    fn url(&self, suffix: &str) -> Result<Url> {
        self.base
            .join(&format!("/v2/{}/{suffix}", self.name))
            .map_err(|e| Error::UpstreamUnavailable(format!("invalid upstream url: {e}")))
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<Response> {
        let request = match self.tokens.authorization().await? {
            Some(value) => request.header(AUTHORIZATION, value),
            None => request,
        };
        Ok(request.send().await?)
    }

    /// Map a non-success upstream status onto the registry error domain.
    fn check_status(&self, response: &Response, unknown: impl FnOnce() -> Error) -> Result<()> {
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        Err(match status {
            StatusCode::NOT_FOUND => unknown(),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Error::Unauthorized(format!(
                "upstream refused {} with {status}",
                response.url()
            )),
            _ => Error::UpstreamUnavailable(format!(
                "upstream returned {status} for {}",
                response.url()
            )),
        })
    }
}

fn header_size(response: &Response) -> u64 {
    response
        .headers()
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
}

fn header_media_type(response: &Response) -> String {
    response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| OCTET_STREAM.to_string())
}

#[async_trait]
impl RemoteRepository for HttpRemoteRepository {
    async fn stat_blob(&self, digest: &Digest) -> Result<Descriptor> {
        let url = self.url(&format!("blobs/{digest}"))?;
        let response = self.send(self.client.head(url)).await?;
        self.check_status(&response, || Error::BlobUnknown(digest.clone()))?;
        Ok(Descriptor::new(
            digest.clone(),
            header_size(&response),
            header_media_type(&response),
        ))
    }

    async fn open_blob(&self, digest: &Digest) -> Result<(Descriptor, ByteStream)> {
        let url = self.url(&format!("blobs/{digest}"))?;
        let response = self.send(self.client.get(url)).await?;
        self.check_status(&response, || Error::BlobUnknown(digest.clone()))?;

        let descriptor = Descriptor::new(
            digest.clone(),
            header_size(&response),
            header_media_type(&response),
        );
        debug!(repo = %self.name, %digest, size = descriptor.size, "opened upstream blob");
        let stream = response.bytes_stream().map_err(Error::from).boxed();
        Ok((descriptor, stream))
    }

    async fn get_manifest(&self, digest: &Digest) -> Result<Manifest> {
        let url = self.url(&format!("manifests/{digest}"))?;
        let response = self
            .send(self.client.get(url).header(ACCEPT, MANIFEST_ACCEPT))
            .await?;
        self.check_status(&response, || Error::ManifestUnknown(digest.to_string()))?;

        let media_type = header_media_type(&response);
        let payload = response.bytes().await?;

        let mut digester = Digester::new(digest.algorithm());
        digester.update(&payload);
        let computed = digester.finalize();
        if computed != *digest {
            return Err(Error::DigestInvalid(format!(
                "upstream manifest digest {computed} does not match requested {digest}"
            )));
        }

        Ok(Manifest {
            digest: digest.clone(),
            media_type,
            payload,
        })
    }

    async fn resolve_tag(&self, tag: &str) -> Result<Descriptor> {
        let url = self.url(&format!("manifests/{tag}"))?;

        // HEAD first; fall back to a GET when the upstream does not answer
        // with a digest header.
        let response = self
            .send(self.client.head(url.clone()).header(ACCEPT, MANIFEST_ACCEPT))
            .await?;
        self.check_status(&response, || {
            Error::ManifestUnknown(format!("{}:{tag}", self.name))
        })?;

        if let Some(digest) = response
            .headers()
            .get(DOCKER_CONTENT_DIGEST)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<Digest>().ok())
        {
            return Ok(Descriptor::new(
                digest,
                header_size(&response),
                header_media_type(&response),
            ));
        }

        let response = self
            .send(self.client.get(url).header(ACCEPT, MANIFEST_ACCEPT))
            .await?;
        self.check_status(&response, || {
            Error::ManifestUnknown(format!("{}:{tag}", self.name))
        })?;
        let media_type = header_media_type(&response);
        let payload = response.bytes().await?;
        Ok(Descriptor::new(
            Digest::from_bytes(&payload),
            payload.len() as u64,
            media_type,
        ))
    }

    async fn all_tags(&self) -> Result<Vec<String>> {
        let url = self.url("tags/list")?;
        let response = self.send(self.client.get(url)).await?;
        self.check_status(&response, || {
            Error::ManifestUnknown(format!("{}: no tags", self.name))
        })?;
        let list: TagList = response.json().await?;
        Ok(list.tags)
    }
}
