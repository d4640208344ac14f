//! Inventory of source items for the create engine, and of parsed archive
//! members for the extract engine.
//!
//! The list is globally sorted by archive member name and every worker owns
//! one contiguous partition of it, so offsets computed by an exclusive scan
//! over partitions are monotone in name order across the whole archive.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};

use rayon::prelude::*;
use walkdir::WalkDir;

use crate::error::{ArchiveError, Result};
use crate::fsx;

/// What an entry is. Only regular files contribute data bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Dir,
    Symlink,
    /// Sockets, fifos, devices. Warned and skipped by the engines.
    Other,
}

/// One inventoried item: metadata only, no file content.
#[derive(Debug, Clone)]
pub struct Entry {
    /// Absolute (or caller-relative) path on the source file system.
    pub path: PathBuf,
    /// Archive member name: relative to the anchor, forward slashes, no
    /// leading separator, no trailing slash.
    pub name: String,
    pub kind: EntryKind,
    /// Size in bytes; 0 for non-files.
    pub size: u64,
    pub mode: u32,
    pub uid: u64,
    pub gid: u64,
    pub uname: String,
    pub gname: String,
    pub mtime: u64,
    /// Symlink target, if the entry is a symlink.
    pub link_target: Option<PathBuf>,
    /// Extended attributes captured when preserve mode is on.
    pub xattrs: Vec<(String, Vec<u8>)>,
}

/// Normalize a member name: forward slashes, no `./`, no doubled or
/// leading slashes.
pub fn normalize_name(name: &str) -> String {
    let s = name.replace('\\', "/");
    let s = s.strip_prefix("./").unwrap_or(&s);
    let s = s.trim_start_matches('/');
    let mut out = s.replace("//", "/");
    while out.ends_with('/') {
        out.pop();
    }
    out
}

/// Returns the longest common ancestor directory shared by all provided
/// paths. Used as the working-directory anchor for member names.
pub fn common_parent(paths: &[PathBuf]) -> PathBuf {
    if paths.is_empty() {
        return PathBuf::new();
    }

    let mut prefix: Vec<Component> = paths[0].components().collect();
    for p in &paths[1..] {
        let comps: Vec<Component> = p.components().collect();
        let mut idx = 0usize;
        while idx < prefix.len() && idx < comps.len() && prefix[idx] == comps[idx] {
            idx += 1;
        }
        prefix.truncate(idx);
        if prefix.is_empty() {
            break;
        }
    }

    let mut out = PathBuf::new();
    for c in prefix {
        out.push(c.as_os_str());
    }

    // If the inputs share nothing (or a single file was given), anchor at
    // the first path's parent.
    if out.as_os_str().is_empty() || out == paths[0] {
        if let Some(par) = paths[0].parent() {
            return par.to_path_buf();
        }
    }

    out
}

#[derive(Debug, Default)]
pub struct FileList {
    entries: Vec<Entry>,
}

impl FileList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inventory every item under `inputs`, capturing the metadata a pax
    /// header needs. With `preserve`, extended attributes are read here
    /// once; the header encoder reuses them without touching the file
    /// again.
    pub fn walk(inputs: &[PathBuf], preserve: bool) -> Result<FileList> {
        let anchor = common_parent(inputs);
        let mut list = FileList::new();
        let mut names: HashMap<u64, String> = HashMap::new();
        let mut groups: HashMap<u64, String> = HashMap::new();

        for input in inputs {
            for item in WalkDir::new(input).follow_links(false) {
                let item = item.map_err(|e| {
                    let path = e.path().unwrap_or(input).to_path_buf();
                    match e.into_io_error() {
                        Some(io) => ArchiveError::io(io, path),
                        None => ArchiveError::Format("file walk cycle".into()),
                    }
                })?;
                let path = item.path().to_path_buf();
                let rel = path.strip_prefix(&anchor).unwrap_or(&path);
                let name = normalize_name(&rel.to_string_lossy());
                if name.is_empty() {
                    continue;
                }
                list.push_from_fs(path, name, preserve, &mut names, &mut groups)?;
            }
        }

        list.sort_by_name();
        Ok(list)
    }

    fn push_from_fs(
        &mut self,
        path: PathBuf,
        name: String,
        preserve: bool,
        names: &mut HashMap<u64, String>,
        groups: &mut HashMap<u64, String>,
    ) -> Result<()> {
        let meta = path
            .symlink_metadata()
            .map_err(|e| ArchiveError::io(e, &path))?;
        let ftype = meta.file_type();
        let kind = if ftype.is_symlink() {
            EntryKind::Symlink
        } else if ftype.is_dir() {
            EntryKind::Dir
        } else if ftype.is_file() {
            EntryKind::File
        } else {
            EntryKind::Other
        };

        let (uid, gid) = fsx::owner_ids(&meta);
        let uname = names
            .entry(uid)
            .or_insert_with(|| fsx::user_name(uid).unwrap_or_default())
            .clone();
        let gname = groups
            .entry(gid)
            .or_insert_with(|| fsx::group_name(gid).unwrap_or_default())
            .clone();

        let link_target = if kind == EntryKind::Symlink {
            Some(
                std::fs::read_link(&path).map_err(|e| ArchiveError::io(e, &path))?,
            )
        } else {
            None
        };

        let xattrs = if preserve && kind != EntryKind::Other {
            fsx::list_xattrs(&path).map_err(|e| ArchiveError::io(e, &path))?
        } else {
            Vec::new()
        };

        self.entries.push(Entry {
            size: if kind == EntryKind::File { meta.len() } else { 0 },
            mode: fsx::unix_mode(&meta),
            uid,
            gid,
            uname,
            gname,
            mtime: fsx::mtime_secs(&meta),
            link_target,
            xattrs,
            path,
            name,
            kind,
        });
        Ok(())
    }

    pub fn push(&mut self, entry: Entry) {
        self.entries.push(entry);
    }

    /// Sort by member name, ascending. Parents always precede their
    /// children because a parent's name is a strict prefix.
    pub fn sort_by_name(&mut self) {
        self.entries
            .par_sort_unstable_by(|a, b| a.name.cmp(&b.name));
    }

    pub fn global_count(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, index: usize) -> &Entry {
        &self.entries[index]
    }

    pub fn iter(&self) -> impl Iterator<Item = &Entry> {
        self.entries.iter()
    }

    /// Total data bytes contributed by regular files.
    pub fn total_file_bytes(&self) -> u64 {
        self.entries
            .iter()
            .filter(|e| e.kind == EntryKind::File)
            .map(|e| e.size)
            .sum()
    }

    /// Contiguous partition of the entry range owned by `rank`, with the
    /// remainder spread over the lowest ranks.
    pub fn partition(&self, rank: usize, ranks: usize) -> std::ops::Range<usize> {
        partition_range(self.entries.len(), rank, ranks)
    }
}

/// Worker `rank`'s contiguous slice of `n` items among `ranks` workers.
pub fn partition_range(n: usize, rank: usize, ranks: usize) -> std::ops::Range<usize> {
    let q = n / ranks;
    let rem = n % ranks;
    let start = rank * q + rank.min(rem);
    let len = q + usize::from(rank < rem);
    start..start + len
}

/// Reject member names that would escape the extraction anchor.
pub fn safe_join(anchor: &Path, name: &str) -> Option<PathBuf> {
    let rel = Path::new(name);
    for comp in rel.components() {
        match comp {
            Component::Normal(_) | Component::CurDir => {}
            _ => return None,
        }
    }
    Some(anchor.join(rel))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partitions_are_disjoint_and_complete() {
        for n in [0usize, 1, 2, 7, 16, 100, 101] {
            for ranks in [1usize, 2, 3, 4, 7, 13] {
                let mut covered = 0usize;
                let mut prev_end = 0usize;
                for r in 0..ranks {
                    let range = partition_range(n, r, ranks);
                    assert_eq!(range.start, prev_end, "n={n} ranks={ranks} r={r}");
                    prev_end = range.end;
                    covered += range.len();
                }
                assert_eq!(prev_end, n);
                assert_eq!(covered, n);
            }
        }
    }

    #[test]
    fn remainder_goes_to_lowest_ranks() {
        // 10 items over 4 ranks: 3, 3, 2, 2.
        let lens: Vec<usize> = (0..4).map(|r| partition_range(10, r, 4).len()).collect();
        assert_eq!(lens, vec![3, 3, 2, 2]);
    }

    #[test]
    fn normalize_strips_leading_and_doubled_separators() {
        assert_eq!(normalize_name("./dir1/dir2/file.txt"), "dir1/dir2/file.txt");
        assert_eq!(normalize_name("/abs/path"), "abs/path");
        assert_eq!(normalize_name("a//b/"), "a/b");
    }

    #[test]
    fn sorted_parents_precede_children() {
        let mut list = FileList::new();
        for name in ["dir/b", "dir", "dir/a", "dir/a/x"] {
            list.push(Entry {
                path: PathBuf::from(name),
                name: name.to_string(),
                kind: EntryKind::Dir,
                size: 0,
                mode: 0o755,
                uid: 0,
                gid: 0,
                uname: String::new(),
                gname: String::new(),
                mtime: 0,
                link_target: None,
                xattrs: Vec::new(),
            });
        }
        list.sort_by_name();
        let names: Vec<&str> = list.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["dir", "dir/a", "dir/a/x", "dir/b"]);
    }

    #[test]
    fn safe_join_rejects_escapes() {
        let anchor = Path::new("/out");
        assert!(safe_join(anchor, "a/b").is_some());
        assert!(safe_join(anchor, "../evil").is_none());
        assert!(safe_join(anchor, "/abs").is_none());
    }
}
