//! LocalDiffScanner: match an index against a local reference tree.
//!
//! Walks the index in order. Non-regular entries are copied to the output as
//! they are. Each counted regular file is looked up under the reference root;
//! if a local copy with the same content hash exists it is written to the
//! output with the local size, otherwise its bit is set in the presence
//! bitmap and its position is remembered for the merge step.

use crate::bitmap::{BitmapBuilder, PresenceBitmap};
use crate::checksum::{hash_file, ContentHash, HASH_LEN};
use crate::config::Verbosity;
use crate::counter::RegularFileCounter;
use crate::error::{DiffError, DiffResult};
use crate::logger::{Logger, MissReason};
use crate::paths::reference_candidate;
use crate::tar_stream::{append_entry, EntryMeta};
use std::fs::{self, File};
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};
use tar::{Archive, Builder};
use tracing::debug;

/// A regular file the scan could not satisfy locally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissingEntry {
    /// Position of the entry in the index (0-based, all entry kinds)
    pub position: u64,
    /// Counter value the bitmap uses for it
    pub counter: u64,
    pub path: PathBuf,
}

/// What the merge step needs to put fetched entries back in place.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergePlan {
    /// Entries in the index
    pub total_entries: u64,
    /// Missing entries in ascending position order
    pub missing: Vec<MissingEntry>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanStats {
    pub entries: u64,
    pub regular_files: u64,
    pub reused: u64,
    pub missing: u64,
    pub bytes_reused: u64,
}

#[derive(Debug)]
pub struct ScanOutcome {
    pub bitmap: PresenceBitmap,
    pub plan: MergePlan,
    pub stats: ScanStats,
}

pub struct LocalDiffScanner<'a> {
    reference: &'a Path,
    scratch: &'a Path,
    verbosity: Verbosity,
    logger: &'a dyn Logger,
}

impl<'a> LocalDiffScanner<'a> {
    /// `scratch` receives one short-lived `<hash>.tmp` copy per candidate.
    pub fn new(
        reference: &'a Path,
        scratch: &'a Path,
        verbosity: Verbosity,
        logger: &'a dyn Logger,
    ) -> Self {
        Self {
            reference,
            scratch,
            verbosity,
            logger,
        }
    }

    /// Scan the tar stream `index`, writing satisfied and non-regular entries
    /// to `out` in index order.
    pub fn scan<R: Read, W: Write>(&self, index: R, out: &mut Builder<W>) -> DiffResult<ScanOutcome> {
        let mut archive = Archive::new(index);
        let mut counter = RegularFileCounter::new();
        let mut bits = BitmapBuilder::new();
        let mut plan = MergePlan::default();
        let mut stats = ScanStats::default();

        for (position, entry) in archive
            .entries()
            .map_err(DiffError::InvalidArchive)?
            .enumerate()
        {
            let mut entry = entry.map_err(DiffError::InvalidArchive)?;
            let mut meta = EntryMeta::read(&entry).map_err(DiffError::InvalidArchive)?;
            stats.entries += 1;

            let Some(counter_value) = counter.assign(meta.entry_type(), meta.size) else {
                append_entry(out, &meta, &mut entry)?;
                continue;
            };
            stats.regular_files += 1;

            let hash = read_index_hash(&mut entry, &meta)?;
            match self.resolve_local(&meta.path, &hash) {
                Ok((scratch_file, local_size)) => {
                    meta.size = local_size;
                    let written = File::open(&scratch_file)
                        .and_then(|f| append_entry(out, &meta, BufReader::new(f)));
                    let _ = fs::remove_file(&scratch_file);
                    written?;

                    bits.push(false);
                    stats.reused += 1;
                    stats.bytes_reused += local_size;
                    self.logger.reused(&meta.name(), local_size);
                    if self.verbosity.entries() {
                        debug!("> {}", meta.name());
                    }
                }
                Err(reason) => {
                    bits.push(true);
                    stats.missing += 1;
                    plan.missing.push(MissingEntry {
                        position: position as u64,
                        counter: counter_value,
                        path: meta.path.clone(),
                    });
                    self.logger.missing(&meta.name(), reason);
                    if self.verbosity.entries() {
                        debug!("missing ({}): {}", reason, meta.name());
                    }
                }
            }
        }

        plan.total_entries = stats.entries;
        Ok(ScanOutcome {
            bitmap: bits.finish(),
            plan,
            stats,
        })
    }

    /// Copy the local candidate to scratch, size it and hash it.
    ///
    /// The output is written from the scratch copy, i.e. from the bytes that
    /// were hashed.
    fn resolve_local(&self, name: &Path, expected: &ContentHash) -> Result<(PathBuf, u64), MissReason> {
        let candidate = reference_candidate(self.reference, name).ok_or(MissReason::NotFound)?;
        match fs::metadata(&candidate) {
            Ok(md) if md.is_file() => {}
            _ => return Err(MissReason::NotFound),
        }

        let scratch_file = self.scratch.join(format!("{}.tmp", expected.to_hex()));
        let checked = fs::copy(&candidate, &scratch_file)
            .and_then(|_| fs::metadata(&scratch_file))
            .and_then(|md| Ok((md.len(), hash_file(&scratch_file)?)));

        match checked {
            Ok((size, actual)) if actual == *expected => Ok((scratch_file, size)),
            Ok(_) => {
                let _ = fs::remove_file(&scratch_file);
                Err(MissReason::HashMismatch)
            }
            Err(_) => {
                let _ = fs::remove_file(&scratch_file);
                Err(MissReason::Unreadable)
            }
        }
    }
}

fn read_index_hash<R: Read>(entry: &mut R, meta: &EntryMeta) -> DiffResult<ContentHash> {
    if meta.size != HASH_LEN as u64 {
        return Err(DiffError::MalformedIndex {
            name: meta.name(),
            reason: format!("expected {} byte hash, entry has {} bytes", HASH_LEN, meta.size),
        });
    }
    let mut buf = [0u8; HASH_LEN];
    entry
        .read_exact(&mut buf)
        .map_err(|e| DiffError::MalformedIndex {
            name: meta.name(),
            reason: e.to_string(),
        })?;
    ContentHash::from_slice(&buf).ok_or_else(|| DiffError::MalformedIndex {
        name: meta.name(),
        reason: "unknown hash format".to_string(),
    })
}
