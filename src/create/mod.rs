//! Create engine.
//!
//! Phases, in order: plan, preallocate, headers, data, terminator,
//! close + reduce. A barrier separates the header phase from the data
//! phase; everything else is ordered by the collectives themselves. The
//! two data backends ([`steal`], [`chunks`]) produce byte-identical
//! archives because plan, headers, padding, and terminator are shared.

pub mod chunks;
pub mod steal;

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::Path;
use std::thread;
use std::time::Duration;

use crate::collective::Comm;
use crate::error::{ArchiveError, Result};
use crate::fdcache::FdCache;
use crate::flist::FileList;
use crate::fsx;
use crate::header::pad512;
use crate::index;
use crate::layout;
use crate::options::{ArchiveOptions, CreateBackend};
use crate::progress::{ProgressCallback, ProgressTracker};

const PROGRESS_INTERVAL: Duration = Duration::from_millis(500);

/// Archive the inventoried tree at `opts.dest`.
pub fn create_archive(flist: &FileList, opts: &ArchiveOptions) -> Result<()> {
    create_archive_with_progress(flist, opts, None)
}

pub fn create_archive_with_progress(
    flist: &FileList,
    opts: &ArchiveOptions,
    callback: Option<Box<ProgressCallback>>,
) -> Result<()> {
    let ranks = opts.worker_count();
    let tracker = ProgressTracker::new(ranks, PROGRESS_INTERVAL, callback);
    tracker.set_total_bytes(flist.total_file_bytes());

    let comms = Comm::group(ranks);
    let results: Vec<Result<()>> = thread::scope(|s| {
        let tracker = &tracker;
        let handles: Vec<_> = comms
            .into_iter()
            .map(|comm| s.spawn(move || worker_create(comm, flist, opts, tracker)))
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().unwrap_or(Err(ArchiveError::Panicked)))
            .collect()
    });
    tracker.emit();
    first_error(results)
}

/// Fold per-rank results, preferring a concrete error over the generic
/// whole-operation failure every rank reports after the reduce.
pub(crate) fn first_error(results: Vec<Result<()>>) -> Result<()> {
    let mut fallback = None;
    for result in results {
        match result {
            Ok(()) => {}
            Err(e @ ArchiveError::Failed { .. }) => {
                fallback.get_or_insert(e);
            }
            Err(e) => return Err(e),
        }
    }
    match fallback {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

fn worker_create(
    comm: Comm,
    flist: &FileList,
    opts: &ArchiveOptions,
    tracker: &ProgressTracker,
) -> Result<()> {
    let archive = opts.dest.as_path();

    // Phase 1: layout. Encoding failures are carried to the close
    // reduction instead of aborting the group mid-collective.
    let mut plan = layout::plan(flist, &comm);
    let mut local_err: Option<ArchiveError> = plan.error.take();

    // Phase 2: rank 0 replaces the archive and reserves its full extent.
    if comm.rank() == 0 {
        if let Err(e) = prepare_archive_file(archive, plan.total_size()) {
            local_err.get_or_insert(e);
        }
    }
    comm.barrier();

    let archive_file = match OpenOptions::new().write(true).open(archive) {
        Ok(f) => Some(f),
        Err(e) => {
            local_err.get_or_insert(ArchiveError::io(e, archive));
            None
        }
    };

    // Phase 3: every worker writes its headers at their global offsets.
    // The ranges are disjoint, so no coordination is needed within the
    // phase.
    if let (Some(file), None) = (&archive_file, &local_err) {
        for record in &plan.records {
            if record.header.is_empty() {
                continue;
            }
            if let Err(e) = fsx::pwrite_all(file, &record.header, record.global_offset) {
                local_err.get_or_insert(ArchiveError::io(e, archive));
                break;
            }
        }
    }
    comm.barrier();

    // Phase 4: data. A worker that already failed still enters the
    // backend so the group's collectives stay aligned.
    let healthy_file = if local_err.is_none() {
        archive_file.as_ref()
    } else {
        None
    };
    let data_err = match opts.create_backend() {
        CreateBackend::Steal => steal::copy_data(&comm, flist, &plan, healthy_file, opts, tracker),
        CreateBackend::Chunks => chunks::copy_data(&comm, flist, &plan, healthy_file, opts, tracker),
    };
    if let Some(e) = data_err {
        local_err.get_or_insert(e);
    }

    // Phase 5: terminator.
    if comm.rank() == 0 && local_err.is_none() {
        if let Some(file) = &archive_file {
            if let Err(e) = fsx::pwrite_all(file, &[0u8; layout::TERMINATOR_LEN as usize], plan.body_size)
            {
                local_err.get_or_insert(ArchiveError::io(e, archive));
            }
        }
    }

    // Phase 6: close, reduce, index.
    drop(archive_file);
    let failed = comm.any_failed(local_err.is_some());
    if !failed {
        let offsets: Vec<u64> = plan.records.iter().map(|r| r.global_offset).collect();
        if let Err(e) = index::write_index(archive, &comm, &offsets) {
            local_err.get_or_insert(e);
        }
    }
    comm.barrier();

    match local_err {
        Some(e) => Err(e),
        None if failed => Err(ArchiveError::Failed {
            ranks: comm.ranks(),
        }),
        None => Ok(()),
    }
}

fn prepare_archive_file(archive: &Path, total_size: u64) -> Result<()> {
    match fs::remove_file(archive) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(ArchiveError::io(e, archive)),
    }
    let file = OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(archive)
        .map_err(|e| ArchiveError::io(e, archive))?;
    file.set_len(total_size)
        .map_err(|e| ArchiveError::io(e, archive))?;
    fsx::preallocate(&file, total_size).map_err(|e| ArchiveError::io(e, archive))?;
    Ok(())
}

pub(crate) fn chunk_count(size: u64, chunk_size: u64) -> u64 {
    size.div_ceil(chunk_size)
}

/// Copy one chunk of `source` into the archive's data region, appending
/// the trailing zero padding when this is the file's final chunk. Returns
/// the data bytes copied.
#[allow(clippy::too_many_arguments)]
pub(crate) fn copy_file_chunk(
    cache: &mut FdCache,
    archive: &File,
    source: &Path,
    file_size: u64,
    data_offset: u64,
    chunk_index: u64,
    chunk_size: u64,
    buf: &mut [u8],
) -> Result<u64> {
    let start = chunk_index * chunk_size;
    let end = (start + chunk_size).min(file_size);

    let src = cache.source(source)?;
    let mut pos = start;
    while pos < end {
        let want = ((end - pos) as usize).min(buf.len());
        // A source that shrank since the plan is a hard failure: the
        // layout is fixed. A source that grew just has its tail ignored.
        fsx::pread_exact(src, &mut buf[..want], pos).map_err(|e| ArchiveError::io(e, source))?;
        fsx::pwrite_all(archive, &buf[..want], data_offset + pos)
            .map_err(|e| ArchiveError::io(e, source))?;
        pos += want as u64;
    }

    if end == file_size {
        let padding = (pad512(file_size) - file_size) as usize;
        if padding > 0 {
            let zeros = [0u8; 512];
            fsx::pwrite_all(archive, &zeros[..padding], data_offset + file_size)
                .map_err(|e| ArchiveError::io(e, source))?;
        }
    }
    Ok(end - start)
}
