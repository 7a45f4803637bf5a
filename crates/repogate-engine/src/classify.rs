//! Classifies a request path as APK, APT, or opaque, and flags index and
//! hash-addressed paths.

use crate::types::{CacheKey, HashAlgorithm};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ClassifyError {
    #[error("malformed by-hash url: {0}")]
    InvalidHashUrl(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Apk,
    Apt,
    Opaque,
}

const INDEX_SUFFIXES: &[&str] = &[
    "APKINDEX.tar.gz",
    "InRelease",
    "Release",
    "Packages",
    "Packages.gz",
    "Sources",
    "Sources.gz",
];

/// The result of classifying one request path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub kind: Kind,
    pub is_index: bool,
    pub hash_addressed: Option<(HashAlgorithm, String)>,
    pub key: CacheKey,
}

/// Classifies `path` (already percent-decoded, leading `/`) for `host`.
/// `host` is only used to build the APT cache key; APK paths are cached
/// directly under their URL path.
pub fn classify(host: &str, path: &str) -> Result<Classification, ClassifyError> {
    let hash_addressed = extract_hash_addressed(path)?;
    let kind = classify_kind(path);
    let is_index = INDEX_SUFFIXES
        .iter()
        .any(|suffix| path.ends_with(suffix));

    let key = match kind {
        Kind::Apk => CacheKey::new_unchecked(path.trim_start_matches('/')),
        Kind::Apt => {
            let sanitized_host = sanitize_host(host);
            CacheKey::new_unchecked(format!(
                "apt/{sanitized_host}/{}",
                path.trim_start_matches('/')
            ))
        }
        Kind::Opaque => CacheKey::new_unchecked(path.trim_start_matches('/')),
    };

    Ok(Classification {
        kind,
        is_index,
        hash_addressed,
        key,
    })
}

fn classify_kind(path: &str) -> Kind {
    if path.ends_with(".apk") || path.ends_with("APKINDEX.tar.gz") || path.contains("/alpine/") {
        return Kind::Apk;
    }
    if path.ends_with(".deb")
        || path.contains("/dists/")
        || path.contains("/pool/")
        || path.contains("/by-hash/")
        || path.starts_with("/debian/")
        || path.starts_with("/ubuntu/")
    {
        return Kind::Apt;
    }
    Kind::Opaque
}

/// Replaces filesystem-unsafe characters and `..` traversal sequences
/// with `_`. Idempotent: `sanitize_host(sanitize_host(h)) == sanitize_host(h)`.
pub fn sanitize_host(host: &str) -> String {
    let mut out = String::with_capacity(host.len());
    let mut chars = host.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '.' && chars.peek() == Some(&'.') {
            out.push('_');
            out.push('_');
            chars.next();
            continue;
        }
        match c {
            ':' | '/' | '\\' | '*' | '?' | '"' | '<' | '>' | '|' => out.push('_'),
            _ => out.push(c),
        }
    }
    out
}

fn extract_hash_addressed(path: &str) -> Result<Option<(HashAlgorithm, String)>, ClassifyError> {
    let Some(pos) = path.find("/by-hash/") else {
        return Ok(None);
    };
    let rest = &path[pos + "/by-hash/".len()..];
    let mut segments = rest.split('/');
    let alg_segment = segments
        .next()
        .ok_or_else(|| ClassifyError::InvalidHashUrl(path.to_string()))?;
    let digest_segment = segments
        .next()
        .ok_or_else(|| ClassifyError::InvalidHashUrl(path.to_string()))?;

    let algorithm = HashAlgorithm::from_path_segment(alg_segment)
        .ok_or_else(|| ClassifyError::InvalidHashUrl(path.to_string()))?;

    if digest_segment.is_empty() || !digest_segment.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(ClassifyError::InvalidHashUrl(path.to_string()));
    }

    Ok(Some((algorithm, digest_segment.to_ascii_lowercase())))
}

#[cfg(test)]
mod test {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("/x/y.apk", Kind::Apk)]
    #[case("/alpine/v3.20/main/x86_64/APKINDEX.tar.gz", Kind::Apk)]
    #[case("/debian/pool/main/h/hello/hello_2.10-2_amd64.deb", Kind::Apt)]
    #[case("/ubuntu/dists/jammy/InRelease", Kind::Apt)]
    #[case("/some/unrelated/file.txt", Kind::Opaque)]
    fn classifies_kind(#[case] path: &str, #[case] expected: Kind) {
        let classification = classify("example.com", path).unwrap();
        assert_eq!(classification.kind, expected);
    }

    #[rstest]
    #[case("/debian/dists/stable/Release", true)]
    #[case("/debian/dists/stable/InRelease", true)]
    #[case("/debian/pool/main/h/hello/hello_2.10-2_amd64.deb", false)]
    #[case("/alpine/v3.20/main/x86_64/APKINDEX.tar.gz", true)]
    fn flags_index_files(#[case] path: &str, #[case] expected: bool) {
        let classification = classify("example.com", path).unwrap();
        assert_eq!(classification.is_index, expected);
    }

    #[test]
    fn extracts_hash_addressed_segments() {
        let classification = classify(
            "example.com",
            "/debian/dists/trixie/main/by-hash/SHA256/deadbeef00",
        )
        .unwrap();
        assert_eq!(
            classification.hash_addressed,
            Some((HashAlgorithm::Sha256, "deadbeef00".to_string()))
        );
    }

    #[test]
    fn rejects_malformed_hash_url() {
        let err = classify("example.com", "/debian/by-hash/SHA256").unwrap_err();
        assert_eq!(
            err,
            ClassifyError::InvalidHashUrl("/debian/by-hash/SHA256".to_string())
        );

        let err = classify("example.com", "/debian/by-hash/NOTANALG/abcd").unwrap_err();
        assert!(matches!(err, ClassifyError::InvalidHashUrl(_)));
    }

    #[test]
    fn sanitize_host_is_idempotent() {
        let host = "evil:..//host";
        let once = sanitize_host(host);
        let twice = sanitize_host(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn apt_cache_key_uses_sanitized_host() {
        let classification = classify("evil:../host", "/debian/dists/stable/Release").unwrap();
        assert_eq!(
            classification.key.as_str(),
            "apt/evil____host/debian/dists/stable/Release"
        );
    }
}
