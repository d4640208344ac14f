//! Work-stealing data phase.
//!
//! Every worker enqueues one encoded item per chunk of every regular file
//! it owns, then the whole group drains the shared queue. Because all
//! items are in the queue before the drain barrier, an empty queue means
//! the phase is done; workers block only on I/O, never on each other.

use std::fs::File;

use crossbeam_channel::{Receiver, Sender};

use crate::collective::Comm;
use crate::error::ArchiveError;
use crate::fdcache::FdCache;
use crate::flist::{EntryKind, FileList};
use crate::layout::Layout;
use crate::options::ArchiveOptions;
use crate::progress::ProgressTracker;
use crate::workitem::{WorkItem, OP_COPY_DATA};

use super::{chunk_count, copy_file_chunk};

type Queue = (Sender<Vec<u8>>, Receiver<Vec<u8>>);

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
    let mut err: Option<ArchiveError> = None;

    // Rank 0 owns the queue; everyone shares its endpoints.
    let (tx, rx): Queue = comm.broadcast(
        if comm.rank() == 0 {
            Some(crossbeam_channel::unbounded())
        } else {
            None
        },
        0,
    );

    // Insert one item per chunk of every owned file.
    for record in &plan.records {
        if record.entry_size() == 0 {
            continue;
        }
        let entry = flist.get(record.index);
        if entry.kind != EntryKind::File || entry.size == 0 {
            continue;
        }
        for chunk_index in 0..chunk_count(entry.size, chunk_size) {
            let item = WorkItem {
                op: OP_COPY_DATA,
                file_size: entry.size,
                chunk_index,
                data_offset: record.data_offset(),
                source: entry.path.clone(),
            };
            match item.encode() {
                Ok(bytes) => {
                    if tx.send(bytes).is_err() {
                        err.get_or_insert(ArchiveError::Queue("queue closed early".into()));
                    }
                }
                Err(e) => {
                    err.get_or_insert(e);
                }
            }
        }
    }

    // Every chunk item is queued before anyone starts stealing.
    comm.barrier();

    let mut cache = FdCache::new();
    let mut buf = vec![0u8; opts.buf_size.max(4096)];
    while let Ok(bytes) = rx.try_recv() {
        let item = match WorkItem::decode(&bytes) {
            Ok(item) => item,
            Err(e) => {
                // Corrupt queue: fatal, stop consuming.
                err.get_or_insert(e);
                break;
            }
        };
        if err.is_some() {
            continue; // keep draining so the queue still empties
        }
        let Some(file) = archive else { continue };
        match copy_file_chunk(
            &mut cache,
            file,
            &item.source,
            item.file_size,
            item.data_offset,
            item.chunk_index,
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

    if let Err(e) = cache.close() {
        err.get_or_insert(e);
    }
    err
}
