//! Repository names, tags, and canonical references.
//!
//! Repository names follow the distribution grammar: one or more lowercase
//! path components separated by `/`.  A canonical reference pairs a
//! repository name with a digest and is rendered `name@algorithm:hex`; it is
//! the key format used by the TTL scheduler.

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;

use crate::digest::Digest;
use crate::error::Error;

static NAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^[a-z0-9]+(?:(?:\.|_|__|-+)[a-z0-9]+)*(?:/[a-z0-9]+(?:(?:\.|_|__|-+)[a-z0-9]+)*)*$",
    )
    .expect("repository name regex")
});

static TAG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_][A-Za-z0-9._-]{0,127}$").expect("tag regex"));

const NAME_MAX_LEN: usize = 255;

/// A validated repository name, possibly with multiple path components.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RepositoryName(String);

impl RepositoryName {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RepositoryName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for RepositoryName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() || s.len() > NAME_MAX_LEN || !NAME_RE.is_match(s) {
            return Err(Error::NameInvalid(s.to_string()));
        }
        Ok(RepositoryName(s.to_string()))
    }
}

/// Validate a tag string.
pub fn is_valid_tag(tag: &str) -> bool {
    TAG_RE.is_match(tag)
}

/// A repository name paired with a digest; the only reference form the
/// scheduler accepts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalReference {
    pub name: RepositoryName,
    pub digest: Digest,
}

impl CanonicalReference {
    pub fn new(name: RepositoryName, digest: Digest) -> Self {
        CanonicalReference { name, digest }
    }
}

impl fmt::Display for CanonicalReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.digest)
    }
}

impl FromStr for CanonicalReference {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (name, digest) = s
            .split_once('@')
            .ok_or_else(|| Error::NameInvalid(format!("not a canonical reference: {s}")))?;
        Ok(CanonicalReference {
            name: name.parse()?,
            digest: digest.parse()?,
        })
    }
}
