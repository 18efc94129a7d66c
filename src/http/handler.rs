//! Main axum router and HTTP request handlers for the caching proxy.
//!
//! Routes:
//! - `GET  /v2/`                              - API version check
//! - `GET|HEAD /v2/<name>/blobs/<digest>`     - serve blob (fetch-on-miss, auto-mount)
//! - `DELETE   /v2/<name>/blobs/<digest>`     - delete from local cache
//! - `GET|HEAD /v2/<name>/manifests/<ref>`    - serve manifest by tag or digest
//! - `DELETE   /v2/<name>/manifests/<digest>` - delete from local cache
//! - `PUT|PATCH /v2/<name>/manifests/<ref>`   - always rejected (UNSUPPORTED)
//! - `GET  /v2/<name>/tags/list`              - proxied tag listing
//! - `GET  /healthz`                          - health check
//! - `GET  /metrics`                          - Prometheus metrics

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use axum::{Json, Router};
use serde::Serialize;
use tracing::{debug, error, instrument, warn};

use crate::error::Error;
use crate::registry::Manifest;
use crate::AppState;

use super::{parse_v2_path, ManifestReference, V2Request};

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the axum [`Router`] with all HTTP routes and shared state.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v2/", get(handle_api_base))
        .route("/v2/{*rest}", any(handle_v2))
        .route("/healthz", get(handle_health))
        .route("/metrics", get(handle_metrics))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// `GET /v2/`
///
/// The version check clients use to discover a v2-compatible registry.
async fn handle_api_base() -> impl IntoResponse {
    (
        StatusCode::OK,
        [
            ("docker-distribution-api-version", "registry/2.0"),
            ("content-type", "application/json"),
        ],
        "{}",
    )
}

/// Dispatcher for everything under `/v2/`.
#[instrument(skip(state), fields(%method, %rest))]
async fn handle_v2(
    State(state): State<Arc<AppState>>,
    method: Method,
    Path(rest): Path<String>,
) -> Result<Response, ApiError> {
    match parse_v2_path(&rest)? {
        V2Request::Blob { name, digest } => {
            let repo = state.registry.repository(name);
            if method == Method::GET || method == Method::HEAD {
                // GET and HEAD share the mount + fetch-on-miss path; HEAD
                // only suppresses the body.
                Ok(repo
                    .blobs
                    .serve_blob(&digest, method == Method::HEAD)
                    .await?)
            } else if method == Method::DELETE {
                debug!(%digest, "deleting blob from local cache");
                repo.blobs.delete(&digest).await?;
                Ok(accepted())
            } else {
                Err(Error::Unsupported.into())
            }
        }
        V2Request::Manifest { name, reference } => {
            let repo = state.registry.repository(name);
            if method == Method::GET || method == Method::HEAD {
                let digest = match reference {
                    ManifestReference::Digest(digest) => digest,
                    ManifestReference::Tag(tag) => repo.tags.get(&tag).await?.digest,
                };
                let manifest = repo.manifests.get(&digest).await?;
                Ok(manifest_response(manifest, method == Method::HEAD))
            } else if method == Method::DELETE {
                match reference {
                    ManifestReference::Digest(digest) => {
                        debug!(%digest, "deleting manifest from local cache");
                        repo.manifests.delete(&digest).await?;
                        Ok(accepted())
                    }
                    ManifestReference::Tag(_) => Err(Error::Unsupported.into()),
                }
            } else {
                // The proxy is read-only: pushes are rejected outright.
                Err(Error::Unsupported.into())
            }
        }
        V2Request::TagsList { name } => {
            if method != Method::GET {
                return Err(Error::Unsupported.into());
            }
            let repo = state.registry.repository(name.clone());
            let tags = repo.tags.all().await?;
            Ok(Json(TagListBody {
                name: name.to_string(),
                tags,
            })
            .into_response())
        }
    }
}

/// `GET /healthz`
async fn handle_health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

/// `GET /metrics`
///
/// Returns Prometheus metrics collected by the proxy.
async fn handle_metrics(State(state): State<Arc<AppState>>) -> Result<Response, ApiError> {
    state
        .metrics
        .metrics
        .scheduler_entries
        .set(state.registry.scheduler().pending().len() as i64);

    let mut buf = String::new();
    prometheus_client::encoding::text::encode(&mut buf, &state.metrics.registry).map_err(|e| {
        error!(error = %e, "metrics encoding failed");
        ApiError(Error::Storage(crate::storage::StorageError::Io(
            std::io::Error::other(e),
        )))
    })?;

    Ok((
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            "application/openmetrics-text; version=1.0.0; charset=utf-8",
        )],
        buf,
    )
        .into_response())
}

// ---------------------------------------------------------------------------
// Response helpers
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct TagListBody {
    name: String,
    tags: Vec<String>,
}

fn accepted() -> Response {
    (StatusCode::ACCEPTED, [(header::CONTENT_LENGTH, "0")]).into_response()
}

fn manifest_response(manifest: Manifest, head: bool) -> Response {
    let body = if head {
        Body::empty()
    } else {
        Body::from(manifest.payload.clone())
    };
    let mut response = (StatusCode::OK, body).into_response();
    let headers = response.headers_mut();
    if let Ok(value) = manifest.media_type.parse() {
        headers.insert(header::CONTENT_TYPE, value);
    }
    if let Ok(value) = manifest.payload.len().to_string().parse() {
        headers.insert(header::CONTENT_LENGTH, value);
    }
    if let Ok(value) = manifest.digest.to_string().parse() {
        headers.insert("docker-content-digest", value);
    }
    response
}

// ---------------------------------------------------------------------------
// Error envelope
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct ErrorEnvelope {
    errors: Vec<ErrorEntry>,
}

#[derive(Debug, Serialize)]
struct ErrorEntry {
    code: &'static str,
    message: String,
}

/// Wrapper mapping the registry error domain onto the OCI error envelope.
#[derive(Debug)]
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::BlobUnknown(_) | Error::ManifestUnknown(_) => StatusCode::NOT_FOUND,
            Error::DigestInvalid(_) | Error::NameInvalid(_) | Error::TagInvalid(_) => {
                StatusCode::BAD_REQUEST
            }
            Error::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Error::Unsupported => StatusCode::METHOD_NOT_ALLOWED,
            Error::UpstreamUnavailable(_) => StatusCode::BAD_GATEWAY,
            Error::BlobMounted(_) => {
                // Control-flow sentinel; reaching the wire is a bug.
                warn!("blob-mounted sentinel escaped to the HTTP layer");
                StatusCode::INTERNAL_SERVER_ERROR
            }
            Error::Storage(e) => {
                error!(error = %e, "storage failure while serving request");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        let envelope = ErrorEnvelope {
            errors: vec![ErrorEntry {
                code: self.0.code(),
                message: self.0.to_string(),
            }],
        };
        (status, Json(envelope)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::Digest;

    async fn envelope_of(response: Response) -> serde_json::Value {
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn blob_unknown_renders_404_envelope() {
        let response =
            ApiError(Error::BlobUnknown(Digest::from_bytes(b"x"))).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let envelope = envelope_of(response).await;
        assert_eq!(envelope["errors"][0]["code"], "BLOB_UNKNOWN");
    }

    #[tokio::test]
    async fn unsupported_renders_405() {
        let response = ApiError(Error::Unsupported).into_response();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
        let envelope = envelope_of(response).await;
        assert_eq!(envelope["errors"][0]["code"], "UNSUPPORTED");
    }

    #[tokio::test]
    async fn digest_invalid_renders_400() {
        let response = ApiError(Error::DigestInvalid("bad".to_string())).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn upstream_unavailable_renders_502() {
        let response =
            ApiError(Error::UpstreamUnavailable("down".to_string())).into_response();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn unauthorized_renders_401() {
        let response = ApiError(Error::Unauthorized("denied".to_string())).into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let envelope = envelope_of(response).await;
        assert_eq!(envelope["errors"][0]["code"], "UNAUTHORIZED");
    }
}
