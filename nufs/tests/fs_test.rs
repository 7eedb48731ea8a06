use std::collections::{BTreeSet, HashMap};

use nufs::io::{BlockStorage, FileBlockEmulator, FileBlockEmulatorBuilder, MemoryBlockEmulator};
use nufs::layout::{BLOCK_SIZE, DOT, DOTDOT, FILE_MODE, INODE_COUNT};
use nufs::{BlockPool, InodeTable, Nufs, NufsError};
use tempfile::NamedTempFile;

fn fresh() -> Nufs<MemoryBlockEmulator> {
    Nufs::create(MemoryBlockEmulator::new(256)).unwrap()
}

fn owned(names: &[&str]) -> BTreeSet<String> {
    names.iter().map(|s| s.to_string()).collect()
}

fn read_all<T: BlockStorage>(fs: &mut Nufs<T>, path: &str) -> Vec<u8> {
    let size = fs.stat(path).unwrap().size as usize;
    let mut buf = vec![0; size];
    let n = fs.read(path, &mut buf, 0).unwrap();
    buf.truncate(n);
    buf
}

/// Counts, for every inode reachable from the root, how many live entries name it.
fn count_references<T: BlockStorage>(fs: &mut Nufs<T>) -> HashMap<u32, u16> {
    let mut counts = HashMap::new();
    let mut pending = vec!["/".to_string()];
    let mut seen = BTreeSet::new();
    while let Some(dir) = pending.pop() {
        for entry in fs.read_dir(&dir).unwrap() {
            *counts.entry(entry.attr.inum).or_insert(0) += 1;
            if entry.name == DOT || entry.name == DOTDOT {
                continue;
            }
            if entry.attr.is_dir() && seen.insert(entry.attr.inum) {
                pending.push(format!("{}/{}", dir.trim_end_matches('/'), entry.name));
            }
        }
    }
    counts
}

fn assert_referential_integrity<T: BlockStorage>(fs: &mut Nufs<T>) {
    for (inum, count) in count_references(fs) {
        assert_eq!(
            fs.inode(inum).unwrap().ref_count,
            count,
            "ref_count of inode {}",
            inum
        );
    }
}

#[test]
fn can_initialize_disk_with_filesystem() {
    let tf = NamedTempFile::new().unwrap();

    // Prepare the block with filesystem layout.
    let dev = FileBlockEmulatorBuilder::from(tf.reopen().unwrap())
        .with_block_count(64)
        .build()
        .unwrap();
    let fs = Nufs::create(dev).unwrap();
    let root = fs.root();
    fs.into_device().unwrap();

    // Open filesystem and verify init layout.
    let mut fs = Nufs::open(FileBlockEmulator::open_disk(tf.path(), 64).unwrap()).unwrap();
    assert_eq!(fs.root(), root);
    assert_eq!(fs.list_directory("/").unwrap(), vec!["."]);
}

#[test]
fn unformatted_image_is_bootstrapped_once() {
    let tf = NamedTempFile::new().unwrap();
    let mut fs = Nufs::open(FileBlockEmulator::open_disk(tf.path(), 32).unwrap()).unwrap();
    fs.write("/a", b"first mount", 0).unwrap();
    fs.into_device().unwrap();

    let mut fs = Nufs::open(FileBlockEmulator::open_disk(tf.path(), 32).unwrap()).unwrap();
    assert_eq!(read_all(&mut fs, "/a"), b"first mount");
}

#[test]
fn root_is_stable_across_mutations() {
    let mut fs = fresh();
    let root = fs.resolve("/").unwrap();
    assert_eq!(fs.resolve("/.").unwrap(), root);

    fs.create_directory("/d").unwrap();
    fs.write("/d/f", b"x", 0).unwrap();
    fs.rename("/d/f", "/g").unwrap();
    fs.unlink("/g").unwrap();

    assert_eq!(fs.resolve("/").unwrap(), root);
    assert_eq!(fs.resolve("").unwrap(), root);
    assert_eq!(fs.resolve("/.").unwrap(), root);
    assert_eq!(fs.resolve("/d/..").unwrap(), root);
}

#[test]
fn scenario_create_write_read_unlink() {
    let mut fs = fresh();
    fs.find_or_create("/a", FILE_MODE).unwrap();
    assert_eq!(fs.write("/a", b"hello", 0).unwrap(), 5);
    assert_eq!(fs.stat("/a").unwrap().size, 5);

    let mut buf = [0; 5];
    assert_eq!(fs.read("/a", &mut buf, 0).unwrap(), 5);
    assert_eq!(&buf, b"hello");

    fs.unlink("/a").unwrap();
    assert!(matches!(fs.resolve("/a"), Err(NufsError::NotFound)));
}

#[test]
fn scenario_nested_directories() {
    let mut fs = fresh();
    fs.create_directory("/d").unwrap();
    let names: BTreeSet<String> = fs.list_directory("/d").unwrap().into_iter().collect();
    assert_eq!(names, owned(&[".", ".."]));

    fs.create_directory("/d/e").unwrap();
    let names: BTreeSet<String> = fs.list_directory("/d").unwrap().into_iter().collect();
    assert_eq!(names, owned(&[".", "..", "e"]));
    assert_referential_integrity(&mut fs);
}

#[test]
fn scenario_hard_link_survives_unlink() {
    let mut fs = fresh();
    fs.write("/a", b"X", 0).unwrap();
    fs.link("/a", "/b").unwrap();
    assert_eq!(fs.stat("/a").unwrap().ref_count, 2);

    fs.unlink("/a").unwrap();
    assert!(fs.exists("/b"));
    assert_eq!(fs.stat("/b").unwrap().ref_count, 1);
    assert_eq!(read_all(&mut fs, "/b"), b"X");
}

#[test]
fn scenario_inode_exhaustion_leaves_no_partial_inode() {
    let mut pool = BlockPool::open(MemoryBlockEmulator::new(256)).unwrap();
    pool.reserve_metadata().unwrap();
    let mut inodes = InodeTable::load(&mut pool).unwrap();

    let mut allocated = Vec::new();
    loop {
        match inodes.allocate(&mut pool, FILE_MODE) {
            Ok(inum) => allocated.push(inum),
            Err(NufsError::OutOfInodes) => break,
            Err(e) => panic!("unexpected error: {}", e),
        }
    }
    assert_eq!(allocated.len(), INODE_COUNT);
    assert_eq!(inodes.free_count(), 0);
    let free_blocks = pool.free_blocks();

    // The failed attempt took no block with it.
    assert!(matches!(
        inodes.allocate(&mut pool, FILE_MODE),
        Err(NufsError::OutOfInodes)
    ));
    assert_eq!(pool.free_blocks(), free_blocks);

    inodes.free(&mut pool, allocated[7]).unwrap();
    assert_eq!(inodes.allocate(&mut pool, FILE_MODE).unwrap(), allocated[7]);
}

#[test]
fn filesystem_reports_out_of_inodes() {
    let mut fs = fresh();
    let mut created = Vec::new();
    'fill: for d in 0..4 {
        let dir = format!("/d{}", d);
        fs.create_directory(&dir).unwrap();
        for f in 0..60 {
            let path = format!("{}/f{}", dir, f);
            match fs.write(&path, b"", 0) {
                Ok(_) => created.push(path),
                Err(NufsError::OutOfInodes) => break 'fill,
                Err(e) => panic!("unexpected error: {}", e),
            }
        }
    }
    assert_eq!(fs.statfs().free_inodes, 0);
    assert!(matches!(fs.write("/d0/extra", b"", 0), Err(NufsError::OutOfInodes)));
    assert!(!fs.exists("/d0/extra"));

    fs.unlink(&created[0]).unwrap();
    fs.write("/d0/extra", b"ok", 0).unwrap();
    assert_referential_integrity(&mut fs);
}

#[test]
fn round_trip_up_to_one_block() {
    let mut fs = fresh();
    for &len in &[0, 1, 100, BLOCK_SIZE - 1, BLOCK_SIZE] {
        let path = format!("/f{}", len);
        let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        assert_eq!(fs.write(&path, &data, 0).unwrap(), len);
        let mut buf = vec![0; len];
        assert_eq!(fs.read(&path, &mut buf, 0).unwrap(), len);
        assert_eq!(buf, data);
    }
}

#[test]
fn excess_past_block_boundary_is_clamped() {
    let mut fs = fresh();
    let data = vec![7; 300];
    fs.write("/f", &vec![1; BLOCK_SIZE - 100], 0).unwrap();
    assert_eq!(fs.write("/f", &data, BLOCK_SIZE - 100).unwrap(), 100);
    assert_eq!(fs.stat("/f").unwrap().size as usize, BLOCK_SIZE);

    let mut buf = vec![0; 300];
    assert_eq!(fs.read("/f", &mut buf, BLOCK_SIZE - 100).unwrap(), 100);
    assert_eq!(&buf[..100], &data[..100]);
}

#[test]
fn listing_is_stable_without_mutation() {
    let mut fs = fresh();
    for name in &["c", "a", "b"] {
        fs.write(&format!("/{}", name), b"", 0).unwrap();
    }
    fs.unlink("/a").unwrap();
    fs.write("/z", b"", 0).unwrap();

    let first = fs.list_directory("/").unwrap();
    let second = fs.list_directory("/").unwrap();
    assert_eq!(first, second);
    let names: BTreeSet<&str> = first.iter().map(String::as_str).collect();
    assert_eq!(names, [".", "b", "c", "z"].iter().copied().collect::<BTreeSet<&str>>());
}

#[test]
fn reference_counts_match_tree_after_mixed_operations() {
    let mut fs = fresh();
    fs.create_directory("/docs").unwrap();
    fs.create_directory("/docs/old").unwrap();
    fs.write("/docs/a", b"a", 0).unwrap();
    fs.link("/docs/a", "/a-link").unwrap();
    fs.link("/docs/a", "/docs/old/a-too").unwrap();
    fs.rename("/docs/old", "/old").unwrap();
    fs.unlink("/docs/a").unwrap();
    fs.write("/tmp", b"t", 0).unwrap();
    fs.unlink("/tmp").unwrap();

    assert_referential_integrity(&mut fs);
    assert_eq!(fs.stat("/a-link").unwrap().ref_count, 2);
    assert_eq!(fs.resolve("/old/..").unwrap(), fs.root());
}

#[test]
fn unlinked_file_is_unreachable_and_reclaimed() {
    let mut fs = fresh();
    let before = fs.statfs();
    fs.write("/a", b"abc", 0).unwrap();
    let inum = fs.resolve("/a").unwrap();
    fs.unlink("/a").unwrap();

    assert!(matches!(fs.resolve("/a"), Err(NufsError::NotFound)));
    assert_eq!(fs.inode(inum).unwrap().ref_count, 0);
    assert_eq!(fs.statfs(), before);
}

#[test]
fn rename_leaves_exactly_one_binding() {
    let mut fs = fresh();
    fs.write("/from", b"payload", 0).unwrap();
    let inum = fs.resolve("/from").unwrap();
    fs.rename("/from", "/to").unwrap();

    assert!(!fs.exists("/from"));
    assert_eq!(fs.resolve("/to").unwrap(), inum);
    assert_eq!(fs.stat("/to").unwrap().ref_count, 1);
    assert_eq!(read_all(&mut fs, "/to"), b"payload");
}

#[test]
fn rename_into_full_directory_changes_nothing() {
    let mut fs = fresh();
    fs.create_directory("/full").unwrap();
    fs.write("/full/f", b"", 0).unwrap();
    // ".", "..", "f" plus links fill every slot.
    for i in 3..nufs::layout::DIR_CAPACITY {
        fs.link("/full/f", &format!("/full/l{}", i)).unwrap();
    }
    fs.write("/mover", b"m", 0).unwrap();

    assert!(matches!(
        fs.rename("/mover", "/full/mover"),
        Err(NufsError::DirectoryFull)
    ));
    assert!(fs.exists("/mover"));
    assert_eq!(fs.stat("/mover").unwrap().ref_count, 1);
}
