//! Content hashing for regular-file payloads and whole-archive fingerprints

use std::fmt;
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;

/// Length in bytes of a [`ContentHash`] as carried in index entries.
pub const HASH_LEN: usize = 20;

/// Fixed-size fingerprint of a file's full payload.
///
/// BLAKE3 extendable output truncated to [`HASH_LEN`] bytes. Used purely for
/// equality between the server's copy and a local candidate.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContentHash([u8; HASH_LEN]);

impl ContentHash {
    /// Parse a hash from exactly [`HASH_LEN`] bytes.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; HASH_LEN] = bytes.try_into().ok()?;
        Some(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8; HASH_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", self.to_hex())
    }
}

/// Hash everything readable from `reader` without buffering it in memory.
pub fn hash_reader<R: Read>(mut reader: R) -> io::Result<ContentHash> {
    let mut hasher = blake3::Hasher::new();
    io::copy(&mut reader, &mut hasher)?;
    let mut out = [0u8; HASH_LEN];
    hasher.finalize_xof().fill(&mut out);
    Ok(ContentHash(out))
}

/// Hash the contents of a file on disk.
pub fn hash_file(path: &Path) -> io::Result<ContentHash> {
    let file = File::open(path)?;
    hash_reader(BufReader::with_capacity(256 * 1024, file))
}

/// Hex digest of a stored archive file, byte for byte.
///
/// The server hands this out with every index so a later diff request can
/// prove it was computed against the same archive.
pub fn fingerprint_file(path: &Path) -> io::Result<String> {
    let file = File::open(path)?;
    let mut reader = BufReader::with_capacity(256 * 1024, file);
    let mut hasher = blake3::Hasher::new();
    io::copy(&mut reader, &mut hasher)?;
    Ok(hasher.finalize().to_hex().to_string())
}
