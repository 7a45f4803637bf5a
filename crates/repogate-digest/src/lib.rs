#![deny(missing_docs)]

//! Hashing helpers used to compute and verify content digests.
//!
//! Wraps the [RustCrypto/hashes](https://github.com/RustCrypto/hashes)
//! `Digest` trait with a few conveniences: hashing a whole file or byte
//! slice in one call, parsing a hex digest string, and a [`HashingWriter`] /
//! [`HashingReader`] pair that compute a digest incrementally as bytes
//! stream through them, so a download can be hashed without a second pass
//! over the data.
//!
//! # Examples
//!
//! ```no_run
//! use repogate_digest::{compute_bytes_digest, compute_file_digest, Sha256};
//!
//! let digest = compute_bytes_digest::<Sha256>("Hello, world!");
//! println!("sha256: {digest:x}");
//!
//! let digest = compute_file_digest::<Sha256>("somefile.txt").unwrap();
//! println!("sha256: {digest:x}");
//! ```

#[cfg(feature = "tokio")]
mod tokio;

#[cfg(feature = "serde")]
pub mod serde;

pub use digest;

use digest::{Digest, Output};
use std::io::Read;
use std::{fs::File, io::Write, path::Path};

pub use sha2::Sha256;

/// A type alias for the output of a SHA256 hash.
pub type Sha256Hash = sha2::digest::Output<Sha256>;

/// Compute a hash of the file at the specified location.
pub fn compute_file_digest<D: Digest + Default + Write>(
    path: impl AsRef<Path>,
) -> Result<Output<D>, std::io::Error> {
    let mut file = File::open(path)?;
    let mut hasher = D::default();
    std::io::copy(&mut file, &mut hasher)?;
    Ok(hasher.finalize())
}

/// Compute a hash of the specified bytes.
pub fn compute_bytes_digest<D: Digest + Default + Write>(bytes: impl AsRef<[u8]>) -> Output<D> {
    let mut hasher = D::default();
    hasher.update(bytes);
    hasher.finalize()
}

/// Parses a hash hex string to a digest. Returns `None` if `str` is not
/// valid hex or is the wrong length for `D`.
pub fn parse_digest_from_hex<D: Digest>(str: &str) -> Option<Output<D>> {
    let mut hash = <Output<D>>::default();
    match hex::decode_to_slice(str, &mut hash) {
        Ok(()) => Some(hash),
        Err(_) => None,
    }
}

/// Formats a digest as a lowercase hex string.
pub fn format_digest<D: Digest>(output: &Output<D>) -> String
where
    for<'a> &'a Output<D>: std::fmt::LowerHex,
{
    format!("{output:x}")
}

/// A [`Write`] wrapper that hashes the bytes written to it as they pass
/// through. Call [`HashingWriter::finalize`] to recover the wrapped writer
/// and the digest of everything written.
///
/// With the `tokio` feature enabled this also implements
/// [`::tokio::io::AsyncWrite`].
pub struct HashingWriter<W, D: Digest> {
    writer: W,
    hasher: D,
}

impl<W, D: Digest + Default> HashingWriter<W, D> {
    /// Constructs a new instance from a writer and a new (empty) hasher.
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            hasher: Default::default(),
        }
    }
}

impl<W, D: Digest> HashingWriter<W, D> {
    /// Consumes this instance and returns the original writer and the hash
    /// of all bytes written to this instance.
    pub fn finalize(self) -> (W, Output<D>) {
        (self.writer, self.hasher.finalize())
    }
}

impl<W: Write, D: Digest> Write for HashingWriter<W, D> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let bytes = self.writer.write(buf)?;
        self.hasher.update(&buf[..bytes]);
        Ok(bytes)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.writer.flush()
    }
}

/// A [`Read`] wrapper that hashes the bytes read from it as they pass
/// through. Call [`HashingReader::finalize`] to recover the wrapped reader
/// and the digest of everything read.
///
/// With the `tokio` feature enabled this also implements
/// [`::tokio::io::AsyncRead`].
pub struct HashingReader<R, D: Digest> {
    reader: R,
    hasher: D,
}

impl<R, D: Digest + Default> HashingReader<R, D> {
    /// Constructs a new instance from a reader and a new (empty) hasher.
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            hasher: Default::default(),
        }
    }
}

impl<R, D: Digest> HashingReader<R, D> {
    /// Consumes this instance and returns the original reader and the hash
    /// of all bytes read from this instance.
    pub fn finalize(self) -> (R, Output<D>) {
        (self.reader, self.hasher.finalize())
    }
}

impl<R: Read, D: Digest> Read for HashingReader<R, D> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let bytes_read = self.reader.read(buf)?;
        self.hasher.update(&buf[..bytes_read]);
        Ok(bytes_read)
    }
}

#[cfg(test)]
mod test {
    use super::HashingReader;
    use rstest::rstest;
    use sha2::Sha256;
    use std::io::Read;

    #[rstest]
    #[case(
        "1234567890",
        "c775e7b757ede630cd0aa1113bd102661ab38829ca52a6422ab782862f268646"
    )]
    #[case(
        "Hello, world!",
        "315f5bdb76d078c43b8ac0064e4a0164612b1fce77c869345bfc94c75894edd3"
    )]
    fn test_compute_file_sha256(#[case] input: &str, #[case] expected_hash: &str) {
        let temp_dir = tempfile::tempdir().unwrap();
        let file_path = temp_dir.path().join("test");
        std::fs::write(&file_path, input).unwrap();
        let hash = super::compute_file_digest::<Sha256>(&file_path).unwrap();
        assert_eq!(format!("{hash:x}"), expected_hash);
    }

    #[rstest]
    #[case(
        "1234567890",
        "c775e7b757ede630cd0aa1113bd102661ab38829ca52a6422ab782862f268646"
    )]
    #[case(
        "Hello, world!",
        "315f5bdb76d078c43b8ac0064e4a0164612b1fce77c869345bfc94c75894edd3"
    )]
    fn test_hashing_reader_sha256(#[case] input: &str, #[case] expected_hash: &str) {
        let mut cursor = HashingReader::<_, Sha256>::new(std::io::Cursor::new(input));
        let mut cursor_string = String::new();
        cursor.read_to_string(&mut cursor_string).unwrap();
        assert_eq!(&cursor_string, input);
        let (_, hash) = cursor.finalize();
        assert_eq!(format!("{hash:x}"), expected_hash);
    }

    #[test]
    fn test_parse_digest_from_hex_rejects_garbage() {
        assert!(super::parse_digest_from_hex::<Sha256>("not-hex").is_none());
        assert!(super::parse_digest_from_hex::<Sha256>("ab").is_none());
    }
}
