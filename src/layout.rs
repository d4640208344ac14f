//! Two-pass archive layout: encode every local header once, prefix-sum the
//! local byte counts, then shift by the group-wide exclusive scan so every
//! entry lands at one deterministic byte offset before anything is written.

use log::warn;

use crate::collective::Comm;
use crate::error::ArchiveError;
use crate::flist::{EntryKind, FileList};
use crate::header::{self, pad512};

/// Two zero blocks terminate every archive.
pub const TERMINATOR_LEN: u64 = 1024;

/// One entry's place in the archive. The encoded header bytes are kept so
/// the header phase writes exactly what the planner measured.
pub struct LayoutRecord {
    /// Global index into the file list.
    pub index: usize,
    /// Encoded header bytes; empty for skipped entries.
    pub header: Vec<u8>,
    /// Zero for non-files; `ceil(size/512)*512` for files.
    pub padded_data: u64,
    /// Absolute byte position of this entry's header in the archive.
    pub global_offset: u64,
}

impl LayoutRecord {
    pub fn entry_size(&self) -> u64 {
        self.header.len() as u64 + self.padded_data
    }

    /// Absolute byte position of the entry's data region.
    pub fn data_offset(&self) -> u64 {
        self.global_offset + self.header.len() as u64
    }
}

pub struct Layout {
    /// Records for this worker's contiguous partition, in entry order.
    pub records: Vec<LayoutRecord>,
    /// Σ entry_size across all workers, excluding the terminator.
    pub body_size: u64,
    /// First per-entry failure hit while encoding; the worker folds it
    /// into the close reduction rather than aborting other entries.
    pub error: Option<ArchiveError>,
}

impl Layout {
    pub fn total_size(&self) -> u64 {
        self.body_size + TERMINATOR_LEN
    }
}

/// Plan this worker's partition and agree on global offsets. Every rank
/// must call this together: it enters the scan and reduce collectives.
pub fn plan(flist: &FileList, comm: &Comm) -> Layout {
    let range = flist.partition(comm.rank(), comm.ranks());
    let mut records = Vec::with_capacity(range.len());
    let mut error = None;
    let mut local_bytes = 0u64;

    for index in range {
        let entry = flist.get(index);
        let (header, padded_data) = match entry.kind {
            EntryKind::Other => {
                warn!("skipping unsupported entry '{}'", entry.name);
                (Vec::new(), 0)
            }
            EntryKind::File => match header::encode_header(entry) {
                Ok(bytes) => (bytes, pad512(entry.size)),
                Err(e) => {
                    error.get_or_insert(e);
                    (Vec::new(), 0)
                }
            },
            EntryKind::Dir | EntryKind::Symlink => match header::encode_header(entry) {
                Ok(bytes) => (bytes, 0),
                Err(e) => {
                    error.get_or_insert(e);
                    (Vec::new(), 0)
                }
            },
        };
        let record = LayoutRecord {
            index,
            header,
            padded_data,
            global_offset: local_bytes,
        };
        local_bytes += record.entry_size();
        records.push(record);
    }

    let base = comm.exscan_sum(local_bytes);
    let body_size = comm.all_reduce_sum(local_bytes);
    for record in &mut records {
        record.global_offset += base;
    }

    Layout {
        records,
        body_size,
        error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collective::Comm;
    use crate::flist::{Entry, FileList};
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::thread;

    fn entry(name: &str, kind: EntryKind, size: u64) -> Entry {
        Entry {
            path: PathBuf::from("/src").join(name),
            name: name.to_string(),
            kind,
            size,
            mode: 0o644,
            uid: 0,
            gid: 0,
            uname: "root".into(),
            gname: "root".into(),
            mtime: 1_700_000_000,
            link_target: None,
            xattrs: Vec::new(),
        }
    }

    fn plan_group(flist: Arc<FileList>, ranks: usize) -> Vec<Layout> {
        let comms = Comm::group(ranks);
        thread::scope(|s| {
            let handles: Vec<_> = comms
                .into_iter()
                .map(|comm| {
                    let flist = Arc::clone(&flist);
                    s.spawn(move || plan(&flist, &comm))
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        })
    }

    #[test]
    fn offsets_are_monotone_and_aligned() {
        let mut flist = FileList::new();
        flist.push(entry("dir", EntryKind::Dir, 0));
        flist.push(entry("dir/a", EntryKind::File, 3));
        flist.push(entry("dir/b", EntryKind::File, 513));
        flist.push(entry("dir/c", EntryKind::File, 0));
        flist.push(entry("dir/d", EntryKind::File, 512));
        let flist = Arc::new(flist);

        for ranks in [1usize, 2, 3, 5] {
            let layouts = plan_group(Arc::clone(&flist), ranks);
            let mut all: Vec<&LayoutRecord> =
                layouts.iter().flat_map(|l| l.records.iter()).collect();
            all.sort_by_key(|r| r.index);

            let mut expected = 0u64;
            for rec in &all {
                assert_eq!(rec.global_offset, expected, "ranks={ranks}");
                assert_eq!(rec.global_offset % 512, 0);
                expected += rec.entry_size();
            }
            for layout in &layouts {
                assert_eq!(layout.body_size, expected);
                assert_eq!(layout.total_size(), expected + TERMINATOR_LEN);
            }
        }
    }

    #[test]
    fn padding_follows_the_block_rule() {
        let flist = Arc::new({
            let mut l = FileList::new();
            l.push(entry("a", EntryKind::File, 513));
            l
        });
        let layouts = plan_group(flist, 1);
        let rec = &layouts[0].records[0];
        assert_eq!(rec.padded_data, 1024); // 511 bytes of padding
        assert_eq!(rec.header.len(), 512);
    }

    #[test]
    fn unsupported_entries_occupy_no_bytes() {
        let flist = Arc::new({
            let mut l = FileList::new();
            l.push(entry("fifo", EntryKind::Other, 0));
            l.push(entry("real", EntryKind::File, 10));
            l
        });
        let layouts = plan_group(flist, 1);
        let recs = &layouts[0].records;
        assert_eq!(recs[0].entry_size(), 0);
        assert_eq!(recs[1].global_offset, 0);
        assert!(layouts[0].error.is_none());
    }

    #[test]
    fn empty_list_plans_only_the_terminator() {
        let layouts = plan_group(Arc::new(FileList::new()), 2);
        for layout in layouts {
            assert_eq!(layout.body_size, 0);
            assert_eq!(layout.total_size(), TERMINATOR_LEN);
        }
    }
}
