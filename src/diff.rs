//! DiffServer: select the files a client asked for.
//!
//! Re-walks the source archive, numbering regular files with the same
//! [`RegularFileCounter`] rule the client used on the index, and streams every
//! entry whose bit is set. Nothing else is emitted.

use crate::bitmap::PresenceBitmap;
use crate::config::Verbosity;
use crate::counter::RegularFileCounter;
use crate::error::{DiffError, DiffResult};
use crate::tar_stream::{append_entry, EntryMeta};
use std::io::{Read, Write};
use tar::{Archive, Builder};
use tracing::debug;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DiffStats {
    /// Counted regular files in the source archive
    pub regular_files: u64,
    /// Entries streamed to the client
    pub sent: u64,
    pub bytes_sent: u64,
}

/// Stream the entries selected by `bitmap` from the tar `archive` into `out`.
///
/// A bitmap too short for the archive fails with
/// [`DiffError::BitmapOutOfBounds`] at the first file it cannot address.
pub fn serve_diff<R: Read, W: Write>(
    archive: R,
    bitmap: &PresenceBitmap,
    out: &mut Builder<W>,
    verbosity: Verbosity,
) -> DiffResult<DiffStats> {
    let mut archive = Archive::new(archive);
    let mut counter = RegularFileCounter::new();
    let mut stats = DiffStats::default();

    for entry in archive.entries().map_err(DiffError::InvalidArchive)? {
        let mut entry = entry.map_err(DiffError::InvalidArchive)?;
        let Some(value) = counter.assign(entry.header().entry_type(), entry.size()) else {
            continue;
        };
        stats.regular_files += 1;

        if !bitmap.get(value)? {
            continue;
        }

        let meta = EntryMeta::read(&entry).map_err(DiffError::InvalidArchive)?;
        append_entry(out, &meta, &mut entry)?;
        stats.sent += 1;
        stats.bytes_sent += meta.size;

        if verbosity.entries() {
            debug!("+ {}", meta.name());
        }
    }

    Ok(stats)
}
