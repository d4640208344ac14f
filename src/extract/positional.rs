//! Direct positional strategy.
//!
//! Rank 0 pre-creates every regular file empty; the global byte range of
//! file data is then cut into fixed-size chunks distributed round-robin,
//! each doing one positional read from the archive and one positional
//! write into the target file. Symlinks get a dedicated pass, and file
//! metadata is applied once the data is in place.

use std::fs::{self, File};
use std::path::Path;

use log::warn;

use crate::collective::Comm;
use crate::create::chunk_count;
use crate::error::ArchiveError;
use crate::fdcache::FdCache;
use crate::flist::{safe_join, EntryKind};
use crate::fsx;
use crate::options::ArchiveOptions;
use crate::progress::ProgressTracker;

use super::{FileSlot, OwnedEntry};

pub(crate) fn extract_data(
    comm: &Comm,
    archive: &Path,
    anchor: &Path,
    owned: &[OwnedEntry],
    files: &[FileSlot],
    opts: &ArchiveOptions,
    tracker: &ProgressTracker,
) -> Option<ArchiveError> {
    let metrics = tracker.worker(comm.rank());
    let mut err: Option<ArchiveError> = None;

    // Rank 0 pre-creates all regular files (empty, truncating leftovers
    // from a previous extraction).
    if comm.rank() == 0 {
        for slot in files {
            let Some(path) = safe_join(anchor, &slot.name) else {
                warn!("skipping file '{}' outside the extraction root", slot.name);
                continue;
            };
            let created = path
                .parent()
                .map(fs::create_dir_all)
                .unwrap_or(Ok(()))
                .and_then(|_| File::create(&path).map(drop));
            if let Err(e) = created {
                err.get_or_insert(ArchiveError::io(e, path));
                break;
            }
        }
    }
    comm.barrier();

    // Round-robin chunk copy across the global file list.
    let archive_file = match File::open(archive) {
        Ok(f) => Some(f),
        Err(e) => {
            err.get_or_insert(ArchiveError::io(e, archive));
            None
        }
    };
    let chunk_size = opts.chunk_size.max(1);
    let ranks = comm.ranks() as u64;
    let rank = comm.rank() as u64;
    let mut cache = FdCache::new();
    let mut buf = vec![0u8; opts.buf_size.max(4096)];
    let mut global_chunk: u64 = 0;

    for slot in files {
        let chunks = chunk_count(slot.size, chunk_size);
        let Some(target) = safe_join(anchor, &slot.name) else {
            global_chunk += chunks;
            continue;
        };
        for chunk_index in 0..chunks {
            if global_chunk % ranks == rank {
                if let (Some(src), None) = (&archive_file, &err) {
                    let start = chunk_index * chunk_size;
                    let end = (start + chunk_size).min(slot.size);
                    let copied = copy_chunk(
                        src,
                        &mut cache,
                        &target,
                        slot.data_offset,
                        start,
                        end,
                        &mut buf,
                    );
                    match copied {
                        Ok(()) => {
                            metrics.record(end - start);
                            tracker.maybe_emit();
                        }
                        Err(e) => {
                            err.get_or_insert(e);
                        }
                    }
                }
            }
            global_chunk += 1;
        }
    }
    if let Err(e) = cache.close() {
        err.get_or_insert(e);
    }
    comm.barrier();

    // File metadata once the bytes are down.
    for entry in owned.iter().filter(|o| o.meta.kind == EntryKind::File) {
        let Some(path) = safe_join(anchor, &entry.meta.name) else {
            continue;
        };
        if let Err(e) = fsx::set_unix_permissions(&path, entry.meta.mode)
            .and_then(|_| fsx::set_mtime(&path, entry.meta.mtime))
        {
            err.get_or_insert(ArchiveError::io(e, path.clone()));
        }
        if opts.preserve {
            for (key, value) in &entry.meta.xattrs {
                if let Err(e) = fsx::set_xattr(&path, key, value) {
                    warn!("cannot restore xattr '{key}' on '{}': {e}", path.display());
                }
            }
        }
    }

    // Dedicated symlink pass: targets come from the entries' own headers,
    // not from the gathered file list.
    for entry in owned.iter().filter(|o| o.meta.kind == EntryKind::Symlink) {
        let Some(path) = safe_join(anchor, &entry.meta.name) else {
            warn!(
                "skipping symlink '{}' outside the extraction root",
                entry.meta.name
            );
            continue;
        };
        let Some(target) = entry.meta.link_target.as_deref() else {
            err.get_or_insert(ArchiveError::Format(format!(
                "symlink entry '{}' carries no target",
                entry.meta.name
            )));
            continue;
        };
        let linked = path
            .parent()
            .map(fs::create_dir_all)
            .unwrap_or(Ok(()))
            .and_then(|_| fsx::symlink(target, &path));
        if let Err(e) = linked {
            err.get_or_insert(ArchiveError::io(e, path));
        }
    }

    err
}

/// One positional read from the archive's data region and one positional
/// write into the target file, in buffer-sized pieces.
fn copy_chunk(
    archive: &File,
    cache: &mut FdCache,
    target: &Path,
    data_offset: u64,
    start: u64,
    end: u64,
    buf: &mut [u8],
) -> Result<(), ArchiveError> {
    let mut pos = start;
    while pos < end {
        let want = ((end - pos) as usize).min(buf.len());
        fsx::pread_exact(archive, &mut buf[..want], data_offset + pos)
            .map_err(|e| ArchiveError::io(e, target))?;
        let out = cache.dest(target)?;
        fsx::pwrite_all(out, &buf[..want], pos).map_err(|e| ArchiveError::io(e, target))?;
        pos += want as u64;
    }
    Ok(())
}
