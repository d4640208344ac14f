//! Single-slot descriptor cache.
//!
//! Consecutive work items are very often chunks of the same file, so each
//! worker keeps at most one open source and one open destination
//! descriptor and only reopens when the path changes. Destination slots
//! are fsynced on eviction.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use crate::error::{ArchiveError, Result};

#[derive(Default)]
pub struct FdCache {
    source: Option<(PathBuf, File)>,
    dest: Option<(PathBuf, File)>,
}

impl FdCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read descriptor for `path`, reused if the previous item touched the
    /// same file.
    pub fn source(&mut self, path: &Path) -> Result<&File> {
        let hit = matches!(&self.source, Some((p, _)) if p == path);
        if !hit {
            let file = File::open(path).map_err(|e| ArchiveError::io(e, path))?;
            self.source = Some((path.to_path_buf(), file));
        }
        Ok(&self.source.as_ref().unwrap().1)
    }

    /// Write descriptor for `path`. The evicted descriptor is flushed to
    /// disk before the new one opens.
    pub fn dest(&mut self, path: &Path) -> Result<&File> {
        let hit = matches!(&self.dest, Some((p, _)) if p == path);
        if !hit {
            self.flush_dest()?;
            let file = OpenOptions::new()
                .write(true)
                .open(path)
                .map_err(|e| ArchiveError::io(e, path))?;
            self.dest = Some((path.to_path_buf(), file));
        }
        Ok(&self.dest.as_ref().unwrap().1)
    }

    fn flush_dest(&mut self) -> Result<()> {
        if let Some((path, file)) = self.dest.take() {
            file.sync_all().map_err(|e| ArchiveError::io(e, path))?;
        }
        Ok(())
    }

    /// Drop both slots, flushing the destination.
    pub fn close(&mut self) -> Result<()> {
        self.source = None;
        self.flush_dest()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn source_slot_is_reused_until_the_path_changes() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        std::fs::write(&a, b"aa").unwrap();
        std::fs::write(&b, b"bb").unwrap();

        let mut cache = FdCache::new();
        cache.source(&a).unwrap();
        let first = cache.source(&a).unwrap() as *const File;
        let again = cache.source(&a).unwrap() as *const File;
        assert_eq!(first, again);

        cache.source(&b).unwrap();
        let mut buf = [0u8; 2];
        crate::fsx::pread_exact(cache.source(&b).unwrap(), &mut buf, 0).unwrap();
        assert_eq!(&buf, b"bb");
    }

    #[test]
    fn dest_slot_writes_land_on_disk_after_close() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out");
        File::create(&path).unwrap().write_all(&[0u8; 4]).unwrap();

        let mut cache = FdCache::new();
        crate::fsx::pwrite_all(cache.dest(&path).unwrap(), b"data", 0).unwrap();
        cache.close().unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"data");
    }

    #[test]
    fn missing_source_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = FdCache::new();
        assert!(matches!(
            cache.source(&dir.path().join("absent")),
            Err(ArchiveError::Io { .. })
        ));
    }
}
