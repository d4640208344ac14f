//! Sidecar offset index.
//!
//! `<archive>.idx` holds one big-endian u64 per entry, in entry order: the
//! absolute byte offset of that entry's header in the archive. There is no
//! header or version tag; the entry count is the file size divided by 8.

use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, warn};

use crate::collective::Comm;
use crate::error::{ArchiveError, Result};

/// Sidecar path for an archive: the archive path with `.idx` appended.
pub fn index_path(archive: &Path) -> PathBuf {
    let mut os = archive.as_os_str().to_os_string();
    os.push(".idx");
    PathBuf::from(os)
}

/// Gather every worker's per-entry offsets and have rank 0 write the
/// sidecar. A write failure on rank 0 fails the operation on every rank.
pub fn write_index(archive: &Path, comm: &Comm, local_offsets: &[u64]) -> Result<()> {
    let gathered = comm.all_gather(local_offsets.to_vec());

    let mut result = Ok(());
    if comm.rank() == 0 {
        let path = index_path(archive);
        let mut bytes = Vec::with_capacity(gathered.iter().map(Vec::len).sum::<usize>() * 8);
        for offset in gathered.iter().flatten() {
            bytes.extend_from_slice(&offset.to_be_bytes());
        }
        result = fs::write(&path, &bytes).map_err(|e| ArchiveError::io(e, &path));
    }

    let failed = comm.any_failed(result.is_err());
    if failed && result.is_ok() {
        result = Err(ArchiveError::Failed {
            ranks: comm.ranks(),
        });
    }
    result
}

/// Load the sidecar on rank 0 and broadcast it. `None` means the index is
/// missing or unreadable, which is not an error: the extractor falls back
/// to scanning.
pub fn read_index(archive: &Path, comm: &Comm) -> Option<Vec<u64>> {
    let loaded = if comm.rank() == 0 {
        Some(read_local(&index_path(archive)))
    } else {
        None
    };
    comm.broadcast(loaded, 0)
}

fn read_local(path: &Path) -> Option<Vec<u64>> {
    let bytes = match fs::read(path) {
        Ok(b) => b,
        Err(e) => {
            debug!("no offset index at '{}': {e}", path.display());
            return None;
        }
    };
    if bytes.len() % 8 != 0 {
        warn!(
            "offset index '{}' has a truncated tail; falling back to scan",
            path.display()
        );
        return None;
    }
    let offsets = bytes
        .chunks_exact(8)
        .map(|c| u64::from_be_bytes(c.try_into().unwrap()))
        .collect();
    Some(offsets)
}
