//! Shared data model types used across components.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A stable, filesystem-safe, path-traversal-free string identifying one
/// cached object, relative to the cache root. Constructed only by
/// [`crate::classify`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheKey(String);

impl CacheKey {
    /// Wraps an already-sanitized relative path. Only [`crate::classify`]
    /// should call this directly; everything else should go through
    /// `classify::classify`.
    pub(crate) fn new_unchecked(path: impl Into<String>) -> Self {
        CacheKey(path.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Digest algorithms recognized in `by-hash/<ALG>/<hex>` URLs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HashAlgorithm {
    Sha256,
    Sha1,
    Md5,
}

impl HashAlgorithm {
    pub fn from_path_segment(segment: &str) -> Option<Self> {
        match segment {
            "SHA256" => Some(HashAlgorithm::Sha256),
            "SHA1" => Some(HashAlgorithm::Sha1),
            "MD5Sum" | "MD5" => Some(HashAlgorithm::Md5),
            _ => None,
        }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HashAlgorithm::Sha256 => write!(f, "SHA256"),
            HashAlgorithm::Sha1 => write!(f, "SHA1"),
            HashAlgorithm::Md5 => write!(f, "MD5"),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn cache_key_displays_as_its_path() {
        let key = CacheKey::new_unchecked("apt/example.com/dists/stable/Release");
        assert_eq!(key.to_string(), "apt/example.com/dists/stable/Release");
    }

    #[test]
    fn hash_algorithm_recognizes_apt_and_apk_spellings() {
        assert_eq!(
            HashAlgorithm::from_path_segment("SHA256"),
            Some(HashAlgorithm::Sha256)
        );
        assert_eq!(
            HashAlgorithm::from_path_segment("MD5Sum"),
            Some(HashAlgorithm::Md5)
        );
        assert_eq!(HashAlgorithm::from_path_segment("bogus"), None);
    }
}
