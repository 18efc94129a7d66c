//! Content digests and descriptors.
//!
//! A digest is the canonical address of a piece of content: an algorithm
//! name and the lowercase hex encoding of the hash, rendered as
//! `sha256:<hex>`.  Equality is defined bit-exactly on the canonical string
//! form.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256, Sha512};

use crate::error::Error;

/// Hash algorithms the registry accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Algorithm {
    Sha256,
    Sha512,
}

impl Algorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::Sha256 => "sha256",
            Algorithm::Sha512 => "sha512",
        }
    }

    /// Length of the hex encoding produced by this algorithm.
    fn hex_len(&self) -> usize {
        match self {
            Algorithm::Sha256 => 64,
            Algorithm::Sha512 => 128,
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Algorithm {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sha256" => Ok(Algorithm::Sha256),
            "sha512" => Ok(Algorithm::Sha512),
            other => Err(Error::DigestInvalid(format!(
                "unsupported digest algorithm: {other}"
            ))),
        }
    }
}

/// An algorithm-qualified content address, e.g. `sha256:abc...`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Digest {
    algorithm: Algorithm,
    hex: String,
}

impl Digest {
    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    pub fn hex(&self) -> &str {
        &self.hex
    }

    /// Compute the sha256 digest of a byte slice.
    pub fn from_bytes(data: &[u8]) -> Self {
        let mut digester = Digester::new(Algorithm::Sha256);
        digester.update(data);
        digester.finalize()
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.hex)
    }
}

impl FromStr for Digest {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (algo, hex) = s
            .split_once(':')
            .ok_or_else(|| Error::DigestInvalid(format!("missing algorithm prefix: {s}")))?;

        let algorithm: Algorithm = algo.parse()?;
        if hex.len() != algorithm.hex_len() {
            return Err(Error::DigestInvalid(format!(
                "{algo} digest must be {} hex characters, got {}",
                algorithm.hex_len(),
                hex.len()
            )));
        }
        if !hex.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase()) {
            return Err(Error::DigestInvalid(format!(
                "digest is not lowercase hex: {s}"
            )));
        }

        Ok(Digest {
            algorithm,
            hex: hex.to_string(),
        })
    }
}

impl Serialize for Digest {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Incremental digest computation over a byte stream.
pub struct Digester {
    algorithm: Algorithm,
    inner: DigesterInner,
}

enum DigesterInner {
    Sha256(Sha256),
    Sha512(Sha512),
}

impl Digester {
    pub fn new(algorithm: Algorithm) -> Self {
        let inner = match algorithm {
            Algorithm::Sha256 => DigesterInner::Sha256(Sha256::new()),
            Algorithm::Sha512 => DigesterInner::Sha512(Sha512::new()),
        };
        Digester { algorithm, inner }
    }

    pub fn update(&mut self, data: &[u8]) {
        match &mut self.inner {
            DigesterInner::Sha256(h) => h.update(data),
            DigesterInner::Sha512(h) => h.update(data),
        }
    }

    pub fn finalize(self) -> Digest {
        let hex = match self.inner {
            DigesterInner::Sha256(h) => format!("{:x}", h.finalize()),
            DigesterInner::Sha512(h) => format!("{:x}", h.finalize()),
        };
        Digest {
            algorithm: self.algorithm,
            hex,
        }
    }
}

/// Media type assigned to blobs whose upstream type is unknown.
pub const OCTET_STREAM: &str = "application/octet-stream";

/// A small record describing a blob or manifest.
///
/// The `public=true` annotation marks a blob as eligible for the
/// cross-repository auto-mount path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Descriptor {
    pub digest: Digest,
    pub size: u64,
    #[serde(rename = "mediaType")]
    pub media_type: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub annotations: HashMap<String, String>,
}

impl Descriptor {
    pub fn new(digest: Digest, size: u64, media_type: impl Into<String>) -> Self {
        Descriptor {
            digest,
            size,
            media_type: media_type.into(),
            annotations: HashMap::new(),
        }
    }

    /// Whether this descriptor carries the `public=true` annotation.
    pub fn is_public(&self) -> bool {
        self.annotations.get("public").map(String::as_str) == Some("true")
    }
}
