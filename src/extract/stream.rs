//! Sequential streaming strategy.
//!
//! Used when no byte offsets exist (typically a compressed archive).
//! Every worker reads the whole archive from offset zero; entry `i` is
//! written to disk only by worker `i % ranks`. Decode cost is paid by all
//! workers, so this path scales until I/O saturates, not beyond.

use std::fs::{self, File};
use std::io::{self, BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use log::warn;

use crate::collective::Comm;
use crate::error::{ArchiveError, Result};
use crate::flist::{safe_join, EntryKind};
use crate::fsx;
use crate::header::{parse_entry, ParsedEntry};
use crate::options::ArchiveOptions;
use crate::progress::{ProgressTracker, WorkerMetrics};

use super::GZIP_MAGIC;

/// Directory metadata deferred until every worker has finished writing.
struct DirFix {
    path: PathBuf,
    mode: u32,
    mtime: u64,
}

pub(crate) fn extract_stream(
    comm: &Comm,
    archive: &Path,
    anchor: &Path,
    opts: &ArchiveOptions,
    tracker: &ProgressTracker,
    mut local_err: Option<ArchiveError>,
) -> Result<()> {
    let metrics = tracker.worker(comm.rank());
    let mut dirs: Vec<DirFix> = Vec::new();

    if local_err.is_none() {
        if let Err(e) = stream_pass(comm, archive, anchor, opts, tracker, &metrics, &mut dirs) {
            local_err = Some(e);
        }
    }

    // All entries exist everywhere before directory metadata lands.
    comm.barrier();
    for dir in dirs {
        if let Err(e) = fsx::set_unix_permissions(&dir.path, dir.mode)
            .and_then(|_| fsx::set_mtime(&dir.path, dir.mtime))
        {
            local_err.get_or_insert(ArchiveError::io(e, dir.path));
        }
    }

    let failed = comm.any_failed(local_err.is_some());
    comm.barrier();
    match local_err {
        Some(e) => Err(e),
        None if failed => Err(ArchiveError::Failed {
            ranks: comm.ranks(),
        }),
        None => Ok(()),
    }
}

fn stream_pass(
    comm: &Comm,
    archive: &Path,
    anchor: &Path,
    opts: &ArchiveOptions,
    tracker: &ProgressTracker,
    metrics: &std::sync::Arc<WorkerMetrics>,
    dirs: &mut Vec<DirFix>,
) -> Result<()> {
    let mut file = File::open(archive).map_err(|e| ArchiveError::io(e, archive))?;
    let mut magic = [0u8; 2];
    let got = file.read(&mut magic).map_err(|e| ArchiveError::io(e, archive))?;
    file.seek(SeekFrom::Start(0))
        .map_err(|e| ArchiveError::io(e, archive))?;

    let mut reader: Box<dyn Read> = if got == 2 && magic == GZIP_MAGIC {
        Box::new(GzDecoder::new(BufReader::new(file)))
    } else {
        Box::new(BufReader::new(file))
    };

    let ranks = comm.ranks() as u64;
    let rank = comm.rank() as u64;
    let mut index: u64 = 0;
    loop {
        let entry = match parse_entry(&mut reader)? {
            Some(entry) => entry,
            None => break,
        };
        if index % ranks == rank {
            materialize(&mut reader, &entry, anchor, opts, dirs)?;
            metrics.record(entry.size);
            tracker.maybe_emit();
        } else {
            skip_bytes(&mut reader, entry.padded_size())?;
        }
        index += 1;
    }
    Ok(())
}

/// Write one owned entry to disk, consuming its (padded) data region from
/// the stream.
fn materialize<R: Read>(
    reader: &mut R,
    entry: &ParsedEntry,
    anchor: &Path,
    opts: &ArchiveOptions,
    dirs: &mut Vec<DirFix>,
) -> Result<()> {
    let padded = entry.padded_size();
    let Some(path) = safe_join(anchor, &entry.name) else {
        warn!("skipping entry '{}' outside the extraction root", entry.name);
        return skip_bytes(reader, padded);
    };

    match entry.kind {
        EntryKind::Dir => {
            fs::create_dir_all(&path).map_err(|e| ArchiveError::io(e, &path))?;
            dirs.push(DirFix {
                path,
                mode: entry.mode,
                mtime: entry.mtime,
            });
        }
        EntryKind::Symlink => {
            let target = entry.link_target.as_deref().ok_or_else(|| {
                ArchiveError::Format(format!("symlink entry '{}' carries no target", entry.name))
            })?;
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).map_err(|e| ArchiveError::io(e, parent))?;
            }
            fsx::symlink(target, &path).map_err(|e| ArchiveError::io(e, &path))?;
        }
        EntryKind::File => {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).map_err(|e| ArchiveError::io(e, parent))?;
            }
            let mut out = File::create(&path).map_err(|e| ArchiveError::io(e, &path))?;
            let copied = io::copy(&mut (&mut *reader).take(entry.size), &mut out)
                .map_err(|e| ArchiveError::io(e, &path))?;
            if copied != entry.size {
                return Err(ArchiveError::Format(format!(
                    "archive ends inside the data of '{}'",
                    entry.name
                )));
            }
            drop(out);
            skip_bytes(reader, padded - entry.size)?;
            fsx::set_unix_permissions(&path, entry.mode)
                .and_then(|_| fsx::set_mtime(&path, entry.mtime))
                .map_err(|e| ArchiveError::io(e, &path))?;
            if opts.preserve {
                for (key, value) in &entry.xattrs {
                    if let Err(e) = fsx::set_xattr(&path, key, value) {
                        warn!("cannot restore xattr '{key}' on '{}': {e}", path.display());
                    }
                }
            }
        }
        EntryKind::Other => {
            warn!("skipping unsupported entry '{}'", entry.name);
            skip_bytes(reader, padded)?;
        }
    }
    Ok(())
}

pub(crate) fn skip_bytes<R: Read>(reader: &mut R, count: u64) -> Result<()> {
    let skipped = io::copy(&mut (&mut *reader).take(count), &mut io::sink())
        .map_err(|e| ArchiveError::Format(format!("archive read failed: {e}")))?;
    if skipped != count {
        return Err(ArchiveError::Format("archive ends mid-entry".into()));
    }
    Ok(())
}
