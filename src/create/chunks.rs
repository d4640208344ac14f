//! Static-chunk data phase.
//!
//! The union of all file data regions is cut into fixed-size chunks and
//! chunk `k` belongs to worker `k % ranks`. Each chunk carries its own
//! absolute source and archive offsets, so a worker's chunks can be
//! written in any order and no coordination happens inside the phase.

use std::fs::File;

use crate::collective::Comm;
use crate::error::ArchiveError;
use crate::fdcache::FdCache;
use crate::flist::{EntryKind, FileList};
use crate::layout::Layout;
use crate::options::ArchiveOptions;
use crate::progress::ProgressTracker;

use super::{chunk_count, copy_file_chunk};

pub(crate) fn copy_data(
    comm: &Comm,
    flist: &FileList,
    plan: &Layout,
    archive: Option<&File>,
    opts: &ArchiveOptions,
    tracker: &ProgressTracker,
) -> Option<ArchiveError> {
    let metrics = tracker.worker(comm.rank());
    let chunk_size = opts.chunk_size.max(1);
    let ranks = comm.ranks() as u64;
    let rank = comm.rank() as u64;

    // Every worker needs every file's data offset: partitions are
    // contiguous and gathered in rank order, so the flattened vector is
    // already in global entry order.
    let local: Vec<(u64, u64)> = plan
        .records
        .iter()
        .filter(|r| {
            r.entry_size() > 0
                && flist.get(r.index).kind == EntryKind::File
                && flist.get(r.index).size > 0
        })
        .map(|r| (r.index as u64, r.data_offset()))
        .collect();
    let files: Vec<(u64, u64)> = comm.all_gather(local).into_iter().flatten().collect();

    let mut err: Option<ArchiveError> = None;
    let mut cache = FdCache::new();
    let mut buf = vec![0u8; opts.buf_size.max(4096)];
    let mut global_chunk: u64 = 0;

    for (index, data_offset) in files {
        let entry = flist.get(index as usize);
        for chunk_index in 0..chunk_count(entry.size, chunk_size) {
            if global_chunk % ranks == rank {
                if let (Some(file), None) = (archive, &err) {
                    match copy_file_chunk(
                        &mut cache,
                        file,
                        &entry.path,
                        entry.size,
                        data_offset,
                        chunk_index,
                        chunk_size,
                        &mut buf,
                    ) {
                        Ok(copied) => {
                            metrics.record(copied);
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
    err
}
