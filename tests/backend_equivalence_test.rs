use std::fs;
use std::path::Path;

use partar::create::create_archive;
use partar::extract::extract_archive;
use partar::flist::FileList;
use partar::index::index_path;
use partar::options::ArchiveOptions;
use rand::{thread_rng, Rng};
use tempfile::tempdir;

/// 16 files of varying sizes across a couple of directories, including
/// sizes that straddle chunk boundaries.
fn varied_tree(root: &Path) -> std::path::PathBuf {
    let dir = root.join("data");
    fs::create_dir_all(dir.join("sub")).unwrap();
    let mut rng = thread_rng();
    for i in 0..16usize {
        let size = match i {
            0 => 0,
            1 => 1,
            2 => 512,
            3 => 513,
            4 => 4096,
            5 => 4097,
            _ => i * 1337 + 11,
        };
        let name = if i % 3 == 0 {
            dir.join(format!("f{i:02}.bin"))
        } else {
            dir.join("sub").join(format!("f{i:02}.bin"))
        };
        let mut buf = vec![0u8; size];
        rng.fill(&mut buf[..]);
        fs::write(name, buf).unwrap();
    }
    dir
}

#[test]
fn steal_and_chunk_backends_are_byte_identical() {
    let src = tempdir().unwrap();
    let dir = varied_tree(src.path());
    let work = tempdir().unwrap();

    let flist = FileList::walk(&[dir], false).unwrap();

    let steal_path = work.path().join("steal.tar");
    let steal_opts = ArchiveOptions {
        dest: steal_path.clone(),
        ranks: 4,
        chunk_size: 4096,
        steal_create: true,
        ..Default::default()
    };
    create_archive(&flist, &steal_opts).unwrap();

    let chunk_path = work.path().join("chunk.tar");
    let chunk_opts = ArchiveOptions {
        dest: chunk_path.clone(),
        ranks: 4,
        chunk_size: 4096,
        steal_create: false,
        ..Default::default()
    };
    create_archive(&flist, &chunk_opts).unwrap();

    let steal_bytes = fs::read(&steal_path).unwrap();
    let chunk_bytes = fs::read(&chunk_path).unwrap();
    assert_eq!(steal_bytes.len(), chunk_bytes.len());
    assert_eq!(steal_bytes, chunk_bytes);
    assert_eq!(
        fs::read(index_path(&steal_path)).unwrap(),
        fs::read(index_path(&chunk_path)).unwrap()
    );
}

#[test]
fn work_stealing_create_roundtrips() {
    let src = tempdir().unwrap();
    let dir = varied_tree(src.path());
    let work = tempdir().unwrap();
    let archive = work.path().join("ws.tar");

    let flist = FileList::walk(&[dir.clone()], false).unwrap();
    let opts = ArchiveOptions {
        dest: archive.clone(),
        ranks: 3,
        chunk_size: 2048,
        steal_create: true,
        ..Default::default()
    };
    create_archive(&flist, &opts).unwrap();

    let out = tempdir().unwrap();
    let extract_opts = ArchiveOptions {
        dest: out.path().to_path_buf(),
        ranks: 3,
        chunk_size: 2048,
        ..Default::default()
    };
    extract_archive(&archive, &extract_opts).unwrap();

    for item in walkdir::WalkDir::new(&dir) {
        let item = item.unwrap();
        if !item.file_type().is_file() {
            continue;
        }
        let rel = item.path().strip_prefix(src.path()).unwrap();
        assert_eq!(
            fs::read(item.path()).unwrap(),
            fs::read(out.path().join(rel)).unwrap(),
            "content mismatch for {rel:?}"
        );
    }
}

#[test]
fn backend_equivalence_holds_across_rank_counts() {
    let src = tempdir().unwrap();
    let dir = varied_tree(src.path());
    let work = tempdir().unwrap();
    let flist = FileList::walk(&[dir], false).unwrap();

    let mut archives = Vec::new();
    for (label, ranks, steal) in [("a", 1, false), ("b", 2, true), ("c", 7, false), ("d", 5, true)]
    {
        let path = work.path().join(format!("{label}.tar"));
        let opts = ArchiveOptions {
            dest: path.clone(),
            ranks,
            chunk_size: 1024,
            steal_create: steal,
            ..Default::default()
        };
        create_archive(&flist, &opts).unwrap();
        archives.push(fs::read(&path).unwrap());
    }
    for other in &archives[1..] {
        assert_eq!(&archives[0], other);
    }
}
