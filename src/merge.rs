//! MergeDiff: combine locally satisfied entries with fetched ones.
//!
//! The server streams requested files in counter order, which is also the
//! order the scan recorded them in, so both merge strategies are a single
//! forward pass over each input.

use crate::config::Verbosity;
use crate::error::{DiffError, DiffResult};
use crate::logger::Logger;
use crate::scan::MergePlan;
use crate::tar_stream::{append_entry, EntryMeta};
use std::io::{Read, Write};
use tar::{Archive, Builder, Entries};
use tracing::debug;

/// Append every fetched entry after what the scan already wrote.
///
/// The diff must contain exactly as many entries as the plan marked missing.
pub fn append_fetched<D: Read, W: Write>(
    diff: D,
    plan: &MergePlan,
    out: &mut Builder<W>,
    verbosity: Verbosity,
    logger: &dyn Logger,
) -> DiffResult<u64> {
    let mut archive = Archive::new(diff);
    let mut fetched = 0u64;
    for entry in archive.entries().map_err(DiffError::InvalidArchive)? {
        let mut entry = entry.map_err(DiffError::InvalidArchive)?;
        let meta = EntryMeta::read(&entry).map_err(DiffError::InvalidArchive)?;
        append_entry(out, &meta, &mut entry)?;
        fetched += 1;
        logger.fetched(&meta.name(), meta.size);
        if verbosity.entries() {
            debug!("< {}", meta.name());
        }
    }

    let expected = plan.missing.len() as u64;
    if fetched != expected {
        return Err(DiffError::MalformedResponse(format!(
            "expected {} entries, server sent {}",
            expected, fetched
        )));
    }
    Ok(fetched)
}

/// Rebuild the archive in source order from the scan's `partial` output and
/// the server's `diff`.
///
/// Walks every index position: positions in the plan take the next fetched
/// entry (whose name must match), all others take the next partial entry.
pub fn splice_fetched<P: Read, D: Read, W: Write>(
    partial: P,
    diff: D,
    plan: &MergePlan,
    out: &mut Builder<W>,
    verbosity: Verbosity,
    logger: &dyn Logger,
) -> DiffResult<u64> {
    let mut partial = Archive::new(partial);
    let mut diff = Archive::new(diff);
    let mut local_entries = partial.entries().map_err(DiffError::InvalidArchive)?;
    let mut fetched_entries = diff.entries().map_err(DiffError::InvalidArchive)?;
    let mut missing = plan.missing.iter().peekable();
    let mut fetched = 0u64;

    for position in 0..plan.total_entries {
        match missing.next_if(|m| m.position == position) {
            Some(wanted) => {
                let mut entry = next_entry(&mut fetched_entries)?.ok_or_else(|| {
                    DiffError::MalformedResponse(format!(
                        "diff ended before {}",
                        wanted.path.display()
                    ))
                })?;
                let meta = EntryMeta::read(&entry).map_err(DiffError::InvalidArchive)?;
                if meta.path != wanted.path {
                    return Err(DiffError::MalformedResponse(format!(
                        "expected {} but server sent {}",
                        wanted.path.display(),
                        meta.path.display()
                    )));
                }
                append_entry(out, &meta, &mut entry)?;
                fetched += 1;
                logger.fetched(&meta.name(), meta.size);
                if verbosity.entries() {
                    debug!("< {}", meta.name());
                }
            }
            None => {
                let mut entry = next_entry(&mut local_entries)?.ok_or_else(|| {
                    DiffError::MalformedResponse(format!(
                        "partial archive ended at entry {}",
                        position
                    ))
                })?;
                let meta = EntryMeta::read(&entry).map_err(DiffError::InvalidArchive)?;
                append_entry(out, &meta, &mut entry)?;
            }
        }
    }

    if next_entry(&mut fetched_entries)?.is_some() {
        return Err(DiffError::MalformedResponse(
            "server sent entries that were not requested".to_string(),
        ));
    }
    Ok(fetched)
}

fn next_entry<'a, R: Read>(
    entries: &mut Entries<'a, R>,
) -> DiffResult<Option<tar::Entry<'a, R>>> {
    entries.next().transpose().map_err(DiffError::InvalidArchive)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::NoopLogger;
    use crate::scan::MissingEntry;
    use std::path::PathBuf;
    use tar::{EntryType, Header};

    fn tar_of(entries: &[(&str, &str)]) -> Vec<u8> {
        let mut b = Builder::new(Vec::new());
        for (name, body) in entries {
            let mut h = Header::new_gnu();
            h.set_entry_type(EntryType::Regular);
            h.set_size(body.len() as u64);
            b.append_data(&mut h, name, body.as_bytes()).unwrap();
        }
        b.into_inner().unwrap()
    }

    fn contents(tar: &[u8]) -> Vec<(String, String)> {
        let mut archive = Archive::new(tar);
        archive
            .entries()
            .unwrap()
            .map(|e| {
                let mut e = e.unwrap();
                let name = e.path().unwrap().to_string_lossy().into_owned();
                let mut body = String::new();
                e.read_to_string(&mut body).unwrap();
                (name, body)
            })
            .collect()
    }

    fn plan(total: u64, missing: &[(u64, &str)]) -> MergePlan {
        MergePlan {
            total_entries: total,
            missing: missing
                .iter()
                .enumerate()
                .map(|(i, (position, name))| MissingEntry {
                    position: *position,
                    counter: i as u64,
                    path: PathBuf::from(name),
                })
                .collect(),
        }
    }

    fn pairs(items: &[(&str, &str)]) -> Vec<(String, String)> {
        items
            .iter()
            .map(|(a, b)| (a.to_string(), b.to_string()))
            .collect()
    }

    #[test]
    fn test_splice_restores_source_order() {
        let partial = tar_of(&[("b", "2"), ("d", "4")]);
        let diff = tar_of(&[("a", "1"), ("c", "3"), ("e", "5")]);
        let plan = plan(5, &[(0, "a"), (2, "c"), (4, "e")]);

        let mut out = Builder::new(Vec::new());
        let fetched =
            splice_fetched(&partial[..], &diff[..], &plan, &mut out, Verbosity::Quiet, &NoopLogger)
                .unwrap();
        assert_eq!(fetched, 3);
        assert_eq!(
            contents(&out.into_inner().unwrap()),
            pairs(&[("a", "1"), ("b", "2"), ("c", "3"), ("d", "4"), ("e", "5")])
        );
    }

    #[test]
    fn test_splice_rejects_wrong_name() {
        let partial = tar_of(&[("a", "1")]);
        let diff = tar_of(&[("z", "9")]);
        let plan = plan(2, &[(1, "b")]);

        let mut out = Builder::new(Vec::new());
        let err =
            splice_fetched(&partial[..], &diff[..], &plan, &mut out, Verbosity::Quiet, &NoopLogger)
                .unwrap_err();
        assert!(matches!(err, DiffError::MalformedResponse(_)));
    }

    #[test]
    fn test_splice_rejects_short_and_long_diffs() {
        let partial = tar_of(&[("a", "1")]);
        let plan_two = plan(3, &[(1, "b"), (2, "c")]);
        let short = tar_of(&[("b", "2")]);
        let mut out = Builder::new(Vec::new());
        assert!(splice_fetched(&partial[..], &short[..], &plan_two, &mut out, Verbosity::Quiet, &NoopLogger).is_err());

        let plan_one = plan(2, &[(1, "b")]);
        let long = tar_of(&[("b", "2"), ("c", "3")]);
        let mut out = Builder::new(Vec::new());
        let err = splice_fetched(&partial[..], &long[..], &plan_one, &mut out, Verbosity::Quiet, &NoopLogger)
            .unwrap_err();
        assert!(err.to_string().contains("not requested"));
    }

    #[test]
    fn test_append_keeps_received_order() {
        let mut out = Builder::new(Vec::new());
        let head = tar_of(&[("b", "2")]);
        let mut archive = Archive::new(&head[..]);
        for entry in archive.entries().unwrap() {
            let mut entry = entry.unwrap();
            let meta = EntryMeta::read(&entry).unwrap();
            append_entry(&mut out, &meta, &mut entry).unwrap();
        }

        let diff = tar_of(&[("a", "1"), ("c", "3")]);
        let plan = plan(3, &[(0, "a"), (2, "c")]);
        let fetched = append_fetched(&diff[..], &plan, &mut out, Verbosity::Debug, &NoopLogger).unwrap();
        assert_eq!(fetched, 2);
        assert_eq!(
            contents(&out.into_inner().unwrap()),
            pairs(&[("b", "2"), ("a", "1"), ("c", "3")])
        );
    }

    #[test]
    fn test_append_checks_count() {
        let diff = tar_of(&[("a", "1")]);
        let plan = plan(3, &[(0, "a"), (2, "c")]);
        let mut out = Builder::new(Vec::new());
        assert!(append_fetched(&diff[..], &plan, &mut out, Verbosity::Quiet, &NoopLogger).is_err());
    }
}
