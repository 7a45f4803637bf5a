//! Records and verifies content digests, with trust-on-first-use for
//! unknown keys and repository-declared digests taking priority for APT
//! indices and hash-addressed URLs.
//!
//! The `Generic` verification shape (hash-then-compare, repair by
//! deleting) follows a package-directory validation pattern; the
//! APT-aware layer generalizes the idea that upstream-declared metadata
//! should be preferred over a self-recorded digest, the same principle
//! the conditional-request cache-header handling applies to
//! `ETag`/`Last-Modified`.

use crate::types::CacheKey;
use parking_lot::RwLock;
use repogate_digest::{compute_file_digest, parse_digest_from_hex, Sha256};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IntegrityError {
    #[error("io error reading {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyResult {
    Ok,
    Corrupt,
    /// No digest on file; caller should self-register (generic store
    /// does this automatically in `verify`).
    Unknown,
}

/// `key → hex sha256`, plus an APT by-hash index `hash → key` so a
/// `by-hash/SHA256/<h>` URL resolves to its canonical path.
#[derive(Default)]
struct DigestMaps {
    by_key: HashMap<CacheKey, String>,
    by_hash: HashMap<String, CacheKey>,
    corrupt: HashSet<CacheKey>,
}

/// Generic (non-APT-aware) integrity store: one self-recorded digest per
/// key, trust-on-first-use unless the caller supplies an authoritative
/// expected digest (hash-addressed URLs).
pub struct IntegrityStore {
    cache_root: PathBuf,
    maps: RwLock<DigestMaps>,
    sweeps_repaired: std::sync::atomic::AtomicUsize,
}

impl IntegrityStore {
    pub fn new(cache_root: impl Into<PathBuf>) -> Self {
        Self {
            cache_root: cache_root.into(),
            maps: RwLock::new(DigestMaps::default()),
            sweeps_repaired: std::sync::atomic::AtomicUsize::new(0),
        }
    }

    fn file_path(&self, key: &CacheKey) -> PathBuf {
        self.cache_root.join(key.as_str())
    }

    /// Records the digest of bytes already known (e.g. just streamed and
    /// buffered by the fetch coordinator) without rereading the file.
    pub fn record_digest(&self, key: &CacheKey, hex_digest: String) {
        let mut maps = self.maps.write();
        maps.by_hash
            .insert(format!("SHA256:{hex_digest}"), key.clone());
        maps.by_key.insert(key.clone(), hex_digest);
        maps.corrupt.remove(key);
    }

    /// Computes and records the SHA-256 of the file currently at `key`.
    pub fn record(&self, key: &CacheKey) -> Result<(), IntegrityError> {
        let path = self.file_path(key);
        let digest =
            compute_file_digest::<Sha256>(&path).map_err(|source| IntegrityError::Io {
                path: path.clone(),
                source,
            })?;
        self.record_digest(key, format!("{digest:x}"));
        Ok(())
    }

    /// Pre-populates digests parsed from an APT `Release`/`Packages` SHA-256
    /// table (`relative-path -> hex digest`) ahead of any fetch.
    pub fn preload_apt_digests(&self, entries: impl IntoIterator<Item = (String, String)>) {
        let mut maps = self.maps.write();
        for (path, digest) in entries {
            let key = CacheKey::new_unchecked(path);
            maps.by_hash.insert(format!("SHA256:{digest}"), key.clone());
            maps.by_key.insert(key, digest);
        }
    }

    /// Looks up the canonical key for a `by-hash/SHA256/<hex>` digest.
    pub fn resolve_by_hash(&self, hex_digest: &str) -> Option<CacheKey> {
        self.maps
            .read()
            .by_hash
            .get(&format!("SHA256:{hex_digest}"))
            .cloned()
    }

    /// Verifies `key` against its recorded digest (or `expected_digest` if
    /// supplied by a hash-addressed URL, which always wins). Trust-on-
    /// first-use applies only when there is no authoritative
    /// `expected_digest`.
    pub fn verify(
        &self,
        key: &CacheKey,
        expected_digest: Option<&str>,
    ) -> Result<VerifyResult, IntegrityError> {
        let path = self.file_path(key);
        let actual =
            compute_file_digest::<Sha256>(&path).map_err(|source| IntegrityError::Io {
                path: path.clone(),
                source,
            })?;
        let actual_hex = format!("{actual:x}");

        if let Some(expected) = expected_digest {
            if parse_digest_from_hex::<Sha256>(expected).is_none() {
                return Ok(VerifyResult::Corrupt);
            }
            return Ok(if actual_hex.eq_ignore_ascii_case(expected) {
                VerifyResult::Ok
            } else {
                VerifyResult::Corrupt
            });
        }

        let recorded = self.maps.read().by_key.get(key).cloned();
        match recorded {
            Some(recorded) if recorded == actual_hex => Ok(VerifyResult::Ok),
            Some(_) => Ok(VerifyResult::Corrupt),
            None => {
                // Trust-on-first-use: self-register and report ok.
                self.record_digest(key, actual_hex);
                Ok(VerifyResult::Ok)
            }
        }
    }

    /// Deletes the file and its digest record, marking the repair as
    /// handled (spec: delete file, remove digest + corrupt marks,
    /// increment a counter).
    pub fn repair(&self, key: &CacheKey) -> Result<(), IntegrityError> {
        let path = self.file_path(key);
        if path.exists() {
            std::fs::remove_file(&path).map_err(|source| IntegrityError::Io {
                path: path.clone(),
                source,
            })?;
        }
        self.remove(key);
        self.sweeps_repaired
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        Ok(())
    }

    pub fn remove(&self, key: &CacheKey) {
        let mut maps = self.maps.write();
        if let Some(digest) = maps.by_key.remove(key) {
            maps.by_hash.remove(&format!("SHA256:{digest}"));
        }
        maps.corrupt.remove(key);
    }

    pub fn mark_corrupt(&self, key: &CacheKey) {
        self.maps.write().corrupt.insert(key.clone());
    }

    /// Verifies every recorded key against its stored digest; repairs
    /// auto-repairable corruption if `auto_repair`. Returns `(checked,
    /// corrupt)`.
    pub fn sweep(&self, auto_repair: bool) -> Result<(usize, usize), IntegrityError> {
        let keys: Vec<CacheKey> = self.maps.read().by_key.keys().cloned().collect();
        let mut checked = 0;
        let mut corrupt = 0;
        for key in keys {
            checked += 1;
            match self.verify(&key, None) {
                Ok(VerifyResult::Ok) => {}
                Ok(VerifyResult::Corrupt) => {
                    corrupt += 1;
                    self.mark_corrupt(&key);
                    if auto_repair {
                        self.repair(&key)?;
                    }
                }
                Ok(VerifyResult::Unknown) => {}
                Err(_) => {
                    // File missing or unreadable: treat like an orphan,
                    // cleaned up separately by orphan_sweep.
                }
            }
        }
        Ok((checked, corrupt))
    }

    /// Removes digest records whose backing file no longer exists.
    pub fn orphan_sweep(&self) -> usize {
        let path_of = |key: &CacheKey| self.cache_root.join(key.as_str());
        let orphaned: Vec<CacheKey> = self
            .maps
            .read()
            .by_key
            .keys()
            .filter(|key| !path_of(key).exists())
            .cloned()
            .collect();
        for key in &orphaned {
            self.remove(key);
        }
        orphaned.len()
    }

    pub fn is_corrupt(&self, key: &CacheKey) -> bool {
        self.maps.read().corrupt.contains(key)
    }
}

/// Parses a SHA-256 table out of an APT `Release`/`InRelease`/`Packages`
/// file's `SHA256:` section: lines of `<hex digest>  <size>  <path>`.
pub fn parse_apt_sha256_table(text: &str) -> Vec<(String, String)> {
    let mut entries = Vec::new();
    let mut in_section = false;
    for line in text.lines() {
        if line.starts_with("SHA256:") {
            in_section = true;
            continue;
        }
        if in_section {
            if !line.starts_with(' ') {
                break;
            }
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() == 3 {
                entries.push((fields[2].to_string(), fields[0].to_string()));
            }
        }
    }
    entries
}

#[cfg(test)]
mod test {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn trust_on_first_use_then_detects_mismatch() {
        let dir = tempdir().unwrap();
        let store = IntegrityStore::new(dir.path());
        let key = CacheKey::new_unchecked("x.apk");
        std::fs::write(dir.path().join("x.apk"), b"hello").unwrap();

        assert_eq!(store.verify(&key, None).unwrap(), VerifyResult::Ok);

        std::fs::write(dir.path().join("x.apk"), b"tampered").unwrap();
        assert_eq!(store.verify(&key, None).unwrap(), VerifyResult::Corrupt);
    }

    #[test]
    fn hash_addressed_expected_digest_overrides_stored() {
        let dir = tempdir().unwrap();
        let store = IntegrityStore::new(dir.path());
        let key = CacheKey::new_unchecked("by-hash/SHA256/x");
        std::fs::write(dir.path().join("by-hash/SHA256/x"), b"hello").unwrap();
        let real_digest = format!(
            "{:x}",
            repogate_digest::compute_bytes_digest::<Sha256>("hello")
        );

        assert_eq!(
            store.verify(&key, Some(&real_digest)).unwrap(),
            VerifyResult::Ok
        );
        assert_eq!(
            store.verify(&key, Some("deadbeef")).unwrap(),
            VerifyResult::Corrupt
        );
    }

    #[test]
    fn repair_deletes_file_and_record() {
        let dir = tempdir().unwrap();
        let store = IntegrityStore::new(dir.path());
        let key = CacheKey::new_unchecked("x.apk");
        let file_path = dir.path().join("x.apk");
        std::fs::write(&file_path, b"hello").unwrap();
        store.record(&key).unwrap();

        store.repair(&key).unwrap();
        assert!(!file_path.exists());
        assert!(store.verify(&key, None).is_err());
    }

    #[test]
    fn orphan_sweep_removes_records_for_missing_files() {
        let dir = tempdir().unwrap();
        let store = IntegrityStore::new(dir.path());
        let key = CacheKey::new_unchecked("x.apk");
        store.record_digest(&key, "deadbeef".to_string());
        assert_eq!(store.orphan_sweep(), 1);
        assert!(store.resolve_by_hash("deadbeef").is_none());
    }

    #[test]
    fn parses_apt_sha256_table() {
        let text = "Origin: Debian\nSHA256:\n abcd1234 1024 main/binary-amd64/Packages\n deadbeef 2048 main/binary-amd64/Packages.gz\nSHA1:\n ignored\n";
        let entries = parse_apt_sha256_table(text);
        assert_eq!(
            entries,
            vec![
                (
                    "main/binary-amd64/Packages".to_string(),
                    "abcd1234".to_string()
                ),
                (
                    "main/binary-amd64/Packages.gz".to_string(),
                    "deadbeef".to_string()
                ),
            ]
        );
    }
}
