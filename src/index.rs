//! IndexBuilder: rewrite an archive into its hash-only form.
//!
//! Every counted regular file keeps its header but its payload becomes the
//! 20-byte content hash (and its size 20). Everything else passes through
//! untouched, so the index has the same entries in the same order.

use crate::checksum::{hash_reader, HASH_LEN};
use crate::config::Verbosity;
use crate::error::{DiffError, DiffResult};
use crate::tar_stream::{append_entry, EntryMeta};
use std::io::{Read, Write};
use tar::{Archive, Builder};
use tracing::debug;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct IndexStats {
    /// Entries written to the index
    pub entries: u64,
    /// Regular files replaced by their hash
    pub hashed: u64,
    /// Payload bytes read while hashing
    pub bytes_hashed: u64,
}

/// Stream the index of the tar read from `archive` into `out`.
///
/// Read failures on the source surface as [`DiffError::InvalidArchive`];
/// failures writing `out` as [`DiffError::Io`].
pub fn build_index<R: Read, W: Write>(
    archive: R,
    out: &mut Builder<W>,
    verbosity: Verbosity,
) -> DiffResult<IndexStats> {
    let mut archive = Archive::new(archive);
    let mut stats = IndexStats::default();

    for entry in archive.entries().map_err(DiffError::InvalidArchive)? {
        let mut entry = entry.map_err(DiffError::InvalidArchive)?;
        let mut meta = EntryMeta::read(&entry).map_err(DiffError::InvalidArchive)?;

        if meta.is_counted() {
            let hash = hash_reader(&mut entry).map_err(DiffError::InvalidArchive)?;
            stats.hashed += 1;
            stats.bytes_hashed += meta.size;

            meta.size = HASH_LEN as u64;
            append_entry(out, &meta, &hash.as_bytes()[..])?;

            if verbosity.entries() {
                debug!("{} : {}", hash, meta.name());
            }
        } else {
            append_entry(out, &meta, &mut entry)?;
        }
        stats.entries += 1;
    }

    Ok(stats)
}
