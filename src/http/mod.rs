//! HTTP dispatch layer for the pull subset of the OCI Distribution v1 API.
//!
//! Repository names may contain any number of path segments, so the router
//! matches a single `/v2/{*rest}` wildcard and this module parses the
//! remainder into a typed request.

pub mod handler;

use std::str::FromStr;

use crate::digest::Digest;
use crate::error::{Error, Result};
use crate::reference::{is_valid_tag, RepositoryName};

/// A parsed `/v2/...` request path.
#[derive(Debug, PartialEq, Eq)]
pub enum V2Request {
    Blob {
        name: RepositoryName,
        digest: Digest,
    },
    Manifest {
        name: RepositoryName,
        reference: ManifestReference,
    },
    TagsList {
        name: RepositoryName,
    },
}

/// A manifest is addressed by digest or by tag.
#[derive(Debug, PartialEq, Eq)]
pub enum ManifestReference {
    Digest(Digest),
    Tag(String),
}

impl FromStr for ManifestReference {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.contains(':') {
            return Ok(ManifestReference::Digest(s.parse()?));
        }
        if !is_valid_tag(s) {
            return Err(Error::TagInvalid(s.to_string()));
        }
        Ok(ManifestReference::Tag(s.to_string()))
    }
}

/// Parse the path remainder after `/v2/`.
pub fn parse_v2_path(rest: &str) -> Result<V2Request> {
    let rest = rest.trim_matches('/');

    if let Some(name) = rest.strip_suffix("/tags/list") {
        return Ok(V2Request::TagsList {
            name: name.parse()?,
        });
    }

    if let Some(idx) = rest.rfind("/manifests/") {
        let name = rest[..idx].parse()?;
        let reference = rest[idx + "/manifests/".len()..].parse()?;
        return Ok(V2Request::Manifest { name, reference });
    }

    if let Some(idx) = rest.rfind("/blobs/") {
        let name = rest[..idx].parse()?;
        let digest = rest[idx + "/blobs/".len()..].parse()?;
        return Ok(V2Request::Blob { name, digest });
    }

    Err(Error::NameInvalid(rest.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_blob_path() {
        let digest = Digest::from_bytes(b"layer");
        let request = parse_v2_path(&format!("library/ubuntu/blobs/{digest}")).unwrap();
        assert_eq!(
            request,
            V2Request::Blob {
                name: "library/ubuntu".parse().unwrap(),
                digest,
            }
        );
    }

    #[test]
    fn parses_multi_segment_name() {
        let digest = Digest::from_bytes(b"layer");
        let request = parse_v2_path(&format!("org/team/service/blobs/{digest}")).unwrap();
        match request {
            V2Request::Blob { name, .. } => assert_eq!(name.as_str(), "org/team/service"),
            other => panic!("unexpected request: {other:?}"),
        }
    }

    #[test]
    fn parses_manifest_by_tag_and_digest() {
        let request = parse_v2_path("library/ubuntu/manifests/latest").unwrap();
        assert_eq!(
            request,
            V2Request::Manifest {
                name: "library/ubuntu".parse().unwrap(),
                reference: ManifestReference::Tag("latest".to_string()),
            }
        );

        let digest = Digest::from_bytes(b"manifest");
        let request = parse_v2_path(&format!("library/ubuntu/manifests/{digest}")).unwrap();
        assert_eq!(
            request,
            V2Request::Manifest {
                name: "library/ubuntu".parse().unwrap(),
                reference: ManifestReference::Digest(digest),
            }
        );
    }

    #[test]
    fn parses_tags_list() {
        let request = parse_v2_path("library/ubuntu/tags/list").unwrap();
        assert_eq!(
            request,
            V2Request::TagsList {
                name: "library/ubuntu".parse().unwrap(),
            }
        );
    }

    #[test]
    fn rejects_bad_digest_and_tag() {
        assert!(matches!(
            parse_v2_path("library/ubuntu/blobs/not-a-digest"),
            Err(Error::DigestInvalid(_))
        ));
        assert!(matches!(
            parse_v2_path("library/ubuntu/manifests/.bad.tag"),
            Err(Error::TagInvalid(_))
        ));
    }

    #[test]
    fn rejects_unroutable_paths() {
        assert!(parse_v2_path("library/ubuntu").is_err());
        assert!(parse_v2_path("").is_err());
        assert!(matches!(
            parse_v2_path("UPPER/blobs/sha256:00"),
            Err(Error::NameInvalid(_) | Error::DigestInvalid(_))
        ));
    }
}
