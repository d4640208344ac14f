//! Extract engine.
//!
//! Offsets are located in fallback order: sidecar index, rank-0 scan of
//! the archive, and finally the sequential streaming path for archives
//! that cannot be seeked (compressed input). With offsets in hand every
//! worker seeks straight to its contiguous slice of entries; directories
//! are created before any file, and directory metadata is finalized after
//! every file exists.

pub mod positional;
pub mod stream;

use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::thread;
use std::time::Duration;

use log::{info, warn};

use crate::collective::Comm;
use crate::create::first_error;
use crate::error::{ArchiveError, Result};
use crate::flist::{partition_range, safe_join, EntryKind};
use crate::fsx;
use crate::header::{parse_entry, ParsedEntry, BLOCK_SIZE};
use crate::index;
use crate::options::ArchiveOptions;
use crate::progress::{ProgressCallback, ProgressTracker};

const PROGRESS_INTERVAL: Duration = Duration::from_millis(500);

pub(crate) const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// One entry this worker is responsible for, with its parsed header.
pub(crate) struct OwnedEntry {
    pub offset: u64,
    pub meta: ParsedEntry,
}

impl OwnedEntry {
    pub fn data_offset(&self) -> u64 {
        self.offset + self.meta.header_size
    }
}

/// The slice of a regular file's metadata every worker needs to address
/// its data region, exchanged through an all-gather.
#[derive(Clone)]
pub(crate) struct FileSlot {
    pub name: String,
    pub size: u64,
    pub data_offset: u64,
}

/// Restore an archive under `opts.dest`.
pub fn extract_archive(archive: &Path, opts: &ArchiveOptions) -> Result<()> {
    extract_archive_with_progress(archive, opts, None)
}

pub fn extract_archive_with_progress(
    archive: &Path,
    opts: &ArchiveOptions,
    callback: Option<Box<ProgressCallback>>,
) -> Result<()> {
    let ranks = opts.worker_count();
    let tracker = ProgressTracker::new(ranks, PROGRESS_INTERVAL, callback);

    let comms = Comm::group(ranks);
    let results: Vec<Result<()>> = thread::scope(|s| {
        let tracker = &tracker;
        let handles: Vec<_> = comms
            .into_iter()
            .map(|comm| s.spawn(move || worker_extract(comm, archive, opts, tracker)))
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().unwrap_or(Err(ArchiveError::Panicked)))
            .collect()
    });
    tracker.emit();
    first_error(results)
}

fn worker_extract(
    comm: Comm,
    archive: &Path,
    opts: &ArchiveOptions,
    tracker: &ProgressTracker,
) -> Result<()> {
    let anchor = opts.dest.as_path();
    let mut local_err: Option<ArchiveError> = None;

    if comm.rank() == 0 {
        if let Err(e) = fs::create_dir_all(anchor) {
            local_err = Some(ArchiveError::io(e, anchor));
        }
    }
    comm.barrier();

    // Locate entry offsets: sidecar index, then a rank-0 scan, then give
    // up on offsets and stream.
    let mut have_index = true;
    let mut offsets = index::read_index(archive, &comm);
    if offsets.is_none() {
        have_index = false;
        let scanned = if comm.rank() == 0 {
            Some(match scan_offsets(archive) {
                Ok(v) => Some(v),
                Err(e) => {
                    info!("offset scan unavailable ({e}); falling back to streaming");
                    None
                }
            })
        } else {
            None
        };
        offsets = comm.broadcast(scanned, 0);
    }

    match offsets {
        Some(offsets) => worker_with_offsets(
            &comm, archive, anchor, &offsets, have_index, opts, tracker, local_err,
        ),
        None => stream::extract_stream(&comm, archive, anchor, opts, tracker, local_err),
    }
}

#[allow(clippy::too_many_arguments)]
fn worker_with_offsets(
    comm: &Comm,
    archive: &Path,
    anchor: &Path,
    offsets: &[u64],
    have_index: bool,
    opts: &ArchiveOptions,
    tracker: &ProgressTracker,
    mut local_err: Option<ArchiveError>,
) -> Result<()> {
    let metrics = tracker.worker(comm.rank());
    let range = partition_range(offsets.len(), comm.rank(), comm.ranks());
    let archive_len = fs::metadata(archive).map(|m| m.len()).unwrap_or(0);

    // Metadata pass: seek to each owned offset and parse the header
    // there. Anything inconsistent means the index is stale.
    let mut owned: Vec<OwnedEntry> = Vec::with_capacity(range.len());
    if local_err.is_none() {
        match File::open(archive) {
            Ok(mut file) => {
                for i in range.clone() {
                    let offset = offsets[i];
                    if offset % BLOCK_SIZE != 0 || offset >= archive_len {
                        local_err.get_or_insert(ArchiveError::StaleIndex(format!(
                            "entry {i} at offset {offset} is outside the {archive_len}-byte archive"
                        )));
                        break;
                    }
                    if let Err(e) = file.seek(SeekFrom::Start(offset)) {
                        local_err.get_or_insert(ArchiveError::io(e, archive));
                        break;
                    }
                    match parse_entry(&mut file) {
                        Ok(Some(meta)) => owned.push(OwnedEntry { offset, meta }),
                        Ok(None) => {
                            local_err.get_or_insert(ArchiveError::StaleIndex(format!(
                                "index lists {} entries but the archive ends at entry {i}",
                                offsets.len()
                            )));
                            break;
                        }
                        Err(e) => {
                            local_err.get_or_insert(match e {
                                ArchiveError::Format(msg) => ArchiveError::StaleIndex(msg),
                                other => other,
                            });
                            break;
                        }
                    }
                }
            }
            Err(e) => {
                local_err.get_or_insert(ArchiveError::io(e, archive));
            }
        }
    }

    // All-gather the regular-file slots so every worker can look up any
    // entry's data region by global position.
    let local_files: Vec<FileSlot> = owned
        .iter()
        .filter(|o| o.meta.kind == EntryKind::File)
        .map(|o| FileSlot {
            name: o.meta.name.clone(),
            size: o.meta.size,
            data_offset: o.data_offset(),
        })
        .collect();
    let files: Vec<FileSlot> = comm.all_gather(local_files).into_iter().flatten().collect();
    tracker.set_total_bytes(files.iter().map(|f| f.size).sum());

    // A stale index fails the operation cleanly, before anything is
    // written.
    if comm.any_failed(local_err.is_some()) {
        return Err(local_err.unwrap_or(ArchiveError::Failed {
            ranks: comm.ranks(),
        }));
    }

    // Directories first, so file creation never races a missing parent.
    for entry in owned.iter().filter(|o| o.meta.kind == EntryKind::Dir) {
        match safe_join(anchor, &entry.meta.name) {
            Some(path) => {
                if let Err(e) = fs::create_dir_all(&path) {
                    local_err.get_or_insert(ArchiveError::io(e, path));
                }
            }
            None => warn!(
                "skipping directory '{}' outside the extraction root",
                entry.meta.name
            ),
        }
    }
    comm.barrier();

    // File contents.
    let content_err = if opts.lib_extract {
        library_pass(archive, anchor, &owned, opts, tracker, &metrics)
    } else {
        positional::extract_data(comm, archive, anchor, &owned, &files, opts, tracker)
    };
    if let Some(e) = content_err {
        local_err.get_or_insert(e);
    }
    comm.barrier();

    // Directory metadata last: creating children perturbed the mtimes.
    for entry in owned.iter().filter(|o| o.meta.kind == EntryKind::Dir) {
        let Some(path) = safe_join(anchor, &entry.meta.name) else {
            continue;
        };
        if let Err(e) = fsx::set_unix_permissions(&path, entry.meta.mode)
            .and_then(|_| fsx::set_mtime(&path, entry.meta.mtime))
        {
            local_err.get_or_insert(ArchiveError::io(e, path));
        }
    }

    let failed = comm.any_failed(local_err.is_some());
    if !failed && !have_index {
        // The scan paid for these offsets; persist them so the next
        // extraction can seek.
        if let Err(e) = index::write_index(archive, comm, &offsets[range]) {
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

/// Library-driven strategy: seek to each owned entry and let the tar
/// reader unpack it. Large files are not subdivided across workers.
fn library_pass(
    archive: &Path,
    anchor: &Path,
    owned: &[OwnedEntry],
    opts: &ArchiveOptions,
    tracker: &ProgressTracker,
    metrics: &std::sync::Arc<crate::progress::WorkerMetrics>,
) -> Option<ArchiveError> {
    let mut err: Option<ArchiveError> = None;
    for entry in owned {
        if err.is_some() {
            break;
        }
        if entry.meta.kind == EntryKind::Dir {
            continue; // created in the directory phase
        }
        let result = (|| -> Result<bool> {
            let mut file = File::open(archive).map_err(|e| ArchiveError::io(e, archive))?;
            file.seek(SeekFrom::Start(entry.offset))
                .map_err(|e| ArchiveError::io(e, archive))?;
            let mut reader = tar::Archive::new(file);
            reader.set_overwrite(true);
            reader.set_preserve_permissions(true);
            reader.set_preserve_mtime(true);
            let mut entries = reader
                .entries()
                .map_err(|e| ArchiveError::Format(format!("tar reader: {e}")))?;
            let mut item = match entries.next() {
                Some(item) => item.map_err(|e| ArchiveError::Format(format!("tar reader: {e}")))?,
                None => {
                    return Err(ArchiveError::Format(
                        "no entry at indexed offset".into(),
                    ))
                }
            };
            item.unpack_in(anchor).map_err(|e| ArchiveError::io(e, anchor))
        })();
        match result {
            Ok(true) => {
                if opts.preserve {
                    if let Some(path) = safe_join(anchor, &entry.meta.name) {
                        for (key, value) in &entry.meta.xattrs {
                            if let Err(e) = fsx::set_xattr(&path, key, value) {
                                warn!("cannot restore xattr '{key}' on '{}': {e}", path.display());
                            }
                        }
                    }
                }
                metrics.record(entry.meta.size);
                tracker.maybe_emit();
            }
            Ok(false) => warn!(
                "skipping entry '{}' outside the extraction root",
                entry.meta.name
            ),
            Err(e) => {
                err = Some(e);
            }
        }
    }
    err
}

/// Walk the archive once on rank 0, recording each entry's header byte
/// position. Compressed archives have no usable byte offsets.
pub(crate) fn scan_offsets(archive: &Path) -> Result<Vec<u64>> {
    let mut file = File::open(archive).map_err(|e| ArchiveError::io(e, archive))?;
    let mut magic = [0u8; 2];
    let got = file.read(&mut magic).map_err(|e| ArchiveError::io(e, archive))?;
    if got == 2 && magic == GZIP_MAGIC {
        return Err(ArchiveError::Format(
            "compressed archive has no byte offsets".into(),
        ));
    }
    file.seek(SeekFrom::Start(0))
        .map_err(|e| ArchiveError::io(e, archive))?;

    let mut reader = std::io::BufReader::new(file);
    let mut offsets = Vec::new();
    let mut pos: u64 = 0;
    while let Some(entry) = parse_entry(&mut reader)? {
        offsets.push(pos);
        pos += entry.header_size + entry.padded_size();
        reader
            .seek_relative(entry.padded_size() as i64)
            .map_err(|e| ArchiveError::io(e, archive))?;
    }
    Ok(offsets)
}

/// Print the archive's members without extracting.
pub fn list_archive(archive: &Path) -> Result<()> {
    let mut file = File::open(archive).map_err(|e| ArchiveError::io(e, archive))?;
    let mut magic = [0u8; 2];
    let got = file.read(&mut magic).map_err(|e| ArchiveError::io(e, archive))?;
    file.seek(SeekFrom::Start(0))
        .map_err(|e| ArchiveError::io(e, archive))?;

    let mut reader: Box<dyn Read> = if got == 2 && magic == GZIP_MAGIC {
        Box::new(flate2::read::GzDecoder::new(std::io::BufReader::new(file)))
    } else {
        Box::new(std::io::BufReader::new(file))
    };

    let mut count = 0u64;
    while let Some(entry) = parse_entry(&mut reader)? {
        println!("- {} ({} bytes)", entry.name, entry.size);
        stream::skip_bytes(&mut reader, entry.padded_size())?;
        count += 1;
    }
    println!("[partar] {count} entries");
    Ok(())
}
