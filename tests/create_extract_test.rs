use std::fs::{self, File};
use std::path::{Path, PathBuf};

use partar::create::create_archive;
use partar::extract::extract_archive;
use partar::flist::FileList;
use partar::index::index_path;
use partar::options::ArchiveOptions;
use tempfile::tempdir;

fn opts(dest: &Path, ranks: usize) -> ArchiveOptions {
    ArchiveOptions {
        dest: dest.to_path_buf(),
        ranks,
        ..Default::default()
    }
}

/// The canonical three-entry tree: dir/, dir/a (3 bytes), dir/b (513
/// bytes of 0xFF).
fn scenario_tree(root: &Path) -> PathBuf {
    let dir = root.join("dir");
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join("a"), b"abc").unwrap();
    fs::write(dir.join("b"), vec![0xFFu8; 513]).unwrap();
    dir
}

/// Flat description of a tree: sorted (relative path, kind/content digest)
/// pairs, symlinks by target.
fn tree_manifest(root: &Path) -> Vec<(String, String)> {
    let mut out = Vec::new();
    for item in walkdir::WalkDir::new(root).min_depth(1) {
        let item = item.unwrap();
        let rel = item
            .path()
            .strip_prefix(root)
            .unwrap()
            .to_string_lossy()
            .into_owned();
        let meta = item.path().symlink_metadata().unwrap();
        let desc = if meta.file_type().is_symlink() {
            format!("link:{}", fs::read_link(item.path()).unwrap().display())
        } else if meta.is_dir() {
            "dir".to_string()
        } else {
            let data = fs::read(item.path()).unwrap();
            let digest = data
                .iter()
                .fold(0u64, |acc, b| acc.wrapping_mul(31).wrapping_add(*b as u64));
            format!("file:{}:{:016x}", data.len(), digest)
        };
        out.push((rel, desc));
    }
    out.sort();
    out
}

#[test]
fn layout_matches_the_block_rules() {
    let src = tempdir().unwrap();
    let dir = scenario_tree(src.path());
    let work = tempdir().unwrap();
    let archive = work.path().join("t.tar");

    let flist = FileList::walk(&[dir], false).unwrap();
    assert_eq!(flist.global_count(), 3);
    create_archive(&flist, &opts(&archive, 2)).unwrap();

    let bytes = fs::read(&archive).unwrap();
    // dir header, dir/a header + 512-byte data region, dir/b header +
    // 1024-byte data region, then the two zero blocks.
    assert_eq!(bytes.len(), 4096);
    assert_eq!(&bytes[1024..1027], b"abc");
    assert!(bytes[1027..1536].iter().all(|&b| b == 0));
    assert!(bytes[2048..2561].iter().all(|&b| b == 0xFF));
    assert!(bytes[2561..3072].iter().all(|&b| b == 0));
    assert!(bytes[3072..4096].iter().all(|&b| b == 0));

    let idx = fs::read(index_path(&archive)).unwrap();
    let offsets: Vec<u64> = idx
        .chunks_exact(8)
        .map(|c| u64::from_be_bytes(c.try_into().unwrap()))
        .collect();
    assert_eq!(offsets, vec![0, 512, 1536]);

    // Cross-check with an independent tar parser.
    let mut reader = tar::Archive::new(File::open(&archive).unwrap());
    let mut names = Vec::new();
    for entry in reader.entries().unwrap() {
        names.push(entry.unwrap().path().unwrap().into_owned());
    }
    assert_eq!(
        names,
        vec![
            PathBuf::from("dir/"),
            PathBuf::from("dir/a"),
            PathBuf::from("dir/b")
        ]
    );
}

#[test]
fn roundtrip_restores_contents() {
    let src = tempdir().unwrap();
    let dir = scenario_tree(src.path());
    let work = tempdir().unwrap();
    let archive = work.path().join("t.tar");
    let out = tempdir().unwrap();

    let flist = FileList::walk(&[dir], false).unwrap();
    create_archive(&flist, &opts(&archive, 2)).unwrap();
    extract_archive(&archive, &opts(out.path(), 2)).unwrap();

    assert_eq!(tree_manifest(src.path()), tree_manifest(out.path()));
    assert!(out.path().join("dir").is_dir());
}

#[test]
fn library_backed_extract_matches() {
    let src = tempdir().unwrap();
    let dir = scenario_tree(src.path());
    let work = tempdir().unwrap();
    let archive = work.path().join("t.tar");
    let out = tempdir().unwrap();

    let flist = FileList::walk(&[dir], false).unwrap();
    create_archive(&flist, &opts(&archive, 2)).unwrap();

    let mut extract_opts = opts(out.path(), 3);
    extract_opts.lib_extract = true;
    extract_archive(&archive, &extract_opts).unwrap();

    assert_eq!(tree_manifest(src.path()), tree_manifest(out.path()));
}

#[test]
fn extract_is_idempotent() {
    let src = tempdir().unwrap();
    let dir = scenario_tree(src.path());
    let work = tempdir().unwrap();
    let archive = work.path().join("t.tar");
    let out = tempdir().unwrap();

    let flist = FileList::walk(&[dir], false).unwrap();
    create_archive(&flist, &opts(&archive, 2)).unwrap();

    extract_archive(&archive, &opts(out.path(), 2)).unwrap();
    let first = tree_manifest(out.path());
    extract_archive(&archive, &opts(out.path(), 2)).unwrap();
    assert_eq!(first, tree_manifest(out.path()));
    assert_eq!(first, tree_manifest(src.path()));
}

#[test]
fn boundary_sizes_roundtrip() {
    let src = tempdir().unwrap();
    let dir = src.path().join("tree");
    fs::create_dir_all(dir.join("empty")).unwrap();
    fs::write(dir.join("zero"), b"").unwrap();
    fs::write(dir.join("block"), vec![7u8; 512]).unwrap();
    fs::write(dir.join("block_plus_one"), vec![9u8; 513]).unwrap();
    fs::write(dir.join("odd"), vec![1u8; 1000]).unwrap();

    let work = tempdir().unwrap();
    let archive = work.path().join("b.tar");
    let flist = FileList::walk(&[dir], false).unwrap();
    create_archive(&flist, &opts(&archive, 4)).unwrap();

    // Every entry is 512-aligned, so the archive size must be too.
    assert_eq!(fs::metadata(&archive).unwrap().len() % 512, 0);

    let out = tempdir().unwrap();
    extract_archive(&archive, &opts(out.path(), 4)).unwrap();
    assert_eq!(tree_manifest(src.path()), tree_manifest(out.path()));
    assert_eq!(fs::metadata(out.path().join("tree/zero")).unwrap().len(), 0);
    assert_eq!(
        fs::metadata(out.path().join("tree/block")).unwrap().len(),
        512
    );
}

#[test]
fn empty_file_list_archives_only_the_terminator() {
    let work = tempdir().unwrap();
    let archive = work.path().join("empty.tar");
    let flist = FileList::new();
    create_archive(&flist, &opts(&archive, 3)).unwrap();

    assert_eq!(fs::read(&archive).unwrap(), vec![0u8; 1024]);
    assert_eq!(fs::read(index_path(&archive)).unwrap().len(), 0);

    let out = tempdir().unwrap();
    extract_archive(&archive, &opts(out.path(), 2)).unwrap();
    assert!(tree_manifest(out.path()).is_empty());
}

#[test]
fn long_member_names_roundtrip() {
    let src = tempdir().unwrap();
    let dir = src.path().join("deep");
    let long_component = "x".repeat(150);
    let nested = dir.join(&long_component);
    fs::create_dir_all(&nested).unwrap();
    fs::write(nested.join("y".repeat(120)), b"payload").unwrap();

    let work = tempdir().unwrap();
    let archive = work.path().join("long.tar");
    let flist = FileList::walk(&[dir], false).unwrap();
    create_archive(&flist, &opts(&archive, 2)).unwrap();

    let out = tempdir().unwrap();
    extract_archive(&archive, &opts(out.path(), 2)).unwrap();
    assert_eq!(tree_manifest(src.path()), tree_manifest(out.path()));
}

#[cfg(unix)]
#[test]
fn modes_and_mtimes_survive_roundtrip() {
    use std::os::unix::fs::PermissionsExt;

    let src = tempdir().unwrap();
    let dir = src.path().join("tree");
    fs::create_dir_all(&dir).unwrap();
    let file = dir.join("exec.sh");
    fs::write(&file, b"#!/bin/sh\n").unwrap();
    fs::set_permissions(&file, fs::Permissions::from_mode(0o754)).unwrap();

    let work = tempdir().unwrap();
    let archive = work.path().join("m.tar");
    let flist = FileList::walk(&[dir.clone()], false).unwrap();
    create_archive(&flist, &opts(&archive, 2)).unwrap();

    let out = tempdir().unwrap();
    extract_archive(&archive, &opts(out.path(), 2)).unwrap();

    let restored = out.path().join("tree/exec.sh");
    let mode = fs::metadata(&restored).unwrap().permissions().mode() & 0o7777;
    assert_eq!(mode, 0o754);

    let src_mtime = fs::metadata(&file)
        .unwrap()
        .modified()
        .unwrap()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_secs();
    let out_mtime = fs::metadata(&restored)
        .unwrap()
        .modified()
        .unwrap()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_secs();
    assert_eq!(src_mtime, out_mtime);
}

#[cfg(unix)]
#[test]
fn symlinks_roundtrip() {
    let src = tempdir().unwrap();
    let dir = src.path().join("tree");
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join("target.txt"), b"pointed at").unwrap();
    std::os::unix::fs::symlink("target.txt", dir.join("alias")).unwrap();

    let work = tempdir().unwrap();
    let archive = work.path().join("s.tar");
    let flist = FileList::walk(&[dir], false).unwrap();
    create_archive(&flist, &opts(&archive, 2)).unwrap();

    let out = tempdir().unwrap();
    extract_archive(&archive, &opts(out.path(), 2)).unwrap();

    let alias = out.path().join("tree/alias");
    assert!(alias.symlink_metadata().unwrap().file_type().is_symlink());
    assert_eq!(fs::read_link(&alias).unwrap(), PathBuf::from("target.txt"));
    assert_eq!(fs::read(out.path().join("tree/target.txt")).unwrap(), b"pointed at");
}

#[test]
fn missing_source_fails_create_but_archive_stays_scannable() {
    let src = tempdir().unwrap();
    let dir = src.path().join("tree");
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join("keep"), vec![5u8; 700]).unwrap();
    fs::write(dir.join("vanishes"), vec![6u8; 700]).unwrap();

    let work = tempdir().unwrap();
    let archive = work.path().join("f.tar");
    let flist = FileList::walk(&[dir.clone()], false).unwrap();

    // The file disappears between planning and the data phase.
    fs::remove_file(dir.join("vanishes")).unwrap();
    assert!(create_archive(&flist, &opts(&archive, 2)).is_err());

    // Headers are already down and the rest of the extent is zeroed, so a
    // subsequent extraction must complete: the vanished file comes back as
    // zeroes of its planned length.
    let out = tempdir().unwrap();
    extract_archive(&archive, &opts(out.path(), 2)).unwrap();
    assert_eq!(fs::read(out.path().join("tree/keep")).unwrap(), vec![5u8; 700]);
    assert_eq!(
        fs::metadata(out.path().join("tree/vanishes")).unwrap().len(),
        700
    );
}
