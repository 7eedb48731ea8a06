//! Directory blocks.
//!
//! A directory is a single data block: a 64 byte header followed by
//! [`DIR_CAPACITY`] fixed-width entries. Removing an entry clears its `present`
//! flag and leaves the slot in place so a later insert can reuse it. The header
//! carries two counters: `num_entries`, the number of live entries, and
//! `high_water`, one past the highest slot ever written. Scans always run to the
//! high-water mark since tombstones below it do not count towards `num_entries`.

use crate::alloc::BlockPool;
use crate::error::{NufsError, Result};
use crate::io::BlockStorage;
use crate::layout::{
    BLOCK_SIZE, DIR_CAPACITY, DIR_ENTRY_SIZE, DIR_HEADER_SIZE, DIR_NAME_LENGTH, DOT, NAME_MAX,
};
use crate::node::InodeTable;

use log::{debug, trace};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

#[repr(C)]
#[derive(AsBytes, FromBytes, FromZeroes, Clone, Copy, Debug)]
pub struct DirHeader {
    pub num_entries: u32,
    pub high_water: u32,
    _reserved: [u32; 14],
}

#[repr(C)]
#[derive(AsBytes, FromBytes, FromZeroes, Clone, Copy, Debug)]
pub struct DirEntry {
    /// NUL padded.
    name: [u8; DIR_NAME_LENGTH],
    pub inum: u32,
    present: u32,
    _reserved: [u8; 8],
}

impl DirEntry {
    fn new(name: &str, inum: u32) -> Self {
        let mut entry = Self::new_zeroed();
        entry.name[..name.len()].copy_from_slice(name.as_bytes());
        entry.inum = inum;
        entry.present = 1;
        entry
    }

    pub fn is_present(&self) -> bool {
        self.present != 0
    }

    pub fn name(&self) -> String {
        let end = self
            .name
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(DIR_NAME_LENGTH);
        String::from_utf8_lossy(&self.name[..end]).into_owned()
    }

    fn name_eq(&self, name: &str) -> bool {
        let stored = &self.name[..];
        let wanted = name.as_bytes();
        stored.get(..wanted.len()) == Some(wanted)
            && stored.get(wanted.len()).map_or(true, |&b| b == 0)
    }
}

/// Checks that `name` fits an entry: non-empty, no separators, no NULs, and short
/// enough to keep a terminating NUL.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.contains('/') || name.contains('\0') {
        return Err(NufsError::InvalidArgument(format!(
            "invalid file name {:?}",
            name
        )));
    }
    if name.len() > NAME_MAX {
        return Err(NufsError::NameTooLong);
    }
    Ok(())
}

/// An owned copy of one directory block. Header and entries are only reached
/// through the accessors below, which copy in and out of the byte buffer.
pub struct DirBlock {
    buf: Vec<u8>,
}

impl DirBlock {
    #[cfg(test)]
    fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < BLOCK_SIZE {
            return Err(NufsError::InvalidArgument(
                "directory buffer shorter than a block".to_string(),
            ));
        }
        Ok(Self {
            buf: bytes[..BLOCK_SIZE].to_vec(),
        })
    }

    pub fn read<T: BlockStorage>(pool: &mut BlockPool<T>, block: usize) -> Result<Self> {
        let mut buf = vec![0; BLOCK_SIZE];
        pool.read_block(block, &mut buf)?;
        Ok(Self { buf })
    }

    pub fn write<T: BlockStorage>(&self, pool: &mut BlockPool<T>, block: usize) -> Result<()> {
        pool.write_block(block, &self.buf)
    }

    pub fn header(&self) -> DirHeader {
        let mut header = DirHeader::read_from(&self.buf[..DIR_HEADER_SIZE])
            .unwrap_or_else(DirHeader::new_zeroed);
        // Never trust a mark past the end of the block.
        header.high_water = header.high_water.min(DIR_CAPACITY as u32);
        header
    }

    fn set_header(&mut self, header: &DirHeader) {
        self.buf[..DIR_HEADER_SIZE].copy_from_slice(header.as_bytes());
    }

    fn slot_range(slot: usize) -> std::ops::Range<usize> {
        let start = DIR_HEADER_SIZE + slot * DIR_ENTRY_SIZE;
        start..start + DIR_ENTRY_SIZE
    }

    pub fn entry(&self, slot: usize) -> DirEntry {
        DirEntry::read_from(&self.buf[Self::slot_range(slot)]).unwrap_or_else(DirEntry::new_zeroed)
    }

    fn set_entry(&mut self, slot: usize, entry: &DirEntry) {
        self.buf[Self::slot_range(slot)].copy_from_slice(entry.as_bytes());
    }

    /// Live entries with their slot numbers, in slot order.
    pub fn live(&self) -> impl Iterator<Item = (usize, DirEntry)> + '_ {
        (0..self.header().high_water as usize)
            .map(move |slot| (slot, self.entry(slot)))
            .filter(|(_, entry)| entry.is_present())
    }

    pub fn find(&self, name: &str) -> Option<(usize, DirEntry)> {
        self.live().find(|(_, entry)| entry.name_eq(name))
    }

    /// Binds `name` in the first tombstoned slot, or at the high-water mark.
    fn insert(&mut self, name: &str, inum: u32) -> Result<usize> {
        let mut header = self.header();
        let high_water = header.high_water as usize;
        let slot = match (0..high_water).find(|&slot| !self.entry(slot).is_present()) {
            Some(slot) => slot,
            None if high_water < DIR_CAPACITY => {
                header.high_water += 1;
                high_water
            }
            None => return Err(NufsError::DirectoryFull),
        };
        self.set_entry(slot, &DirEntry::new(name, inum));
        header.num_entries += 1;
        self.set_header(&header);
        Ok(slot)
    }

    fn tombstone(&mut self, slot: usize) {
        let mut entry = self.entry(slot);
        entry.present = 0;
        self.set_entry(slot, &entry);
        let mut header = self.header();
        header.num_entries = header.num_entries.saturating_sub(1);
        self.set_header(&header);
    }
}

fn dir_block<T: BlockStorage>(
    pool: &mut BlockPool<T>,
    inodes: &InodeTable,
    dir: u32,
) -> Result<(usize, DirBlock)> {
    let node = inodes.get(dir)?;
    if !node.is_dir() {
        return Err(NufsError::NotADirectory);
    }
    let block = node.block as usize;
    Ok((block, DirBlock::read(pool, block)?))
}

/// Resets the directory stored in `block` to no entries.
pub fn init<T: BlockStorage>(pool: &mut BlockPool<T>, block: usize) -> Result<()> {
    let mut dir = DirBlock::read(pool, block)?;
    dir.set_header(&DirHeader::new_zeroed());
    dir.write(pool, block)
}

/// Finds the inode bound to `name` in directory `dir`.
pub fn lookup<T: BlockStorage>(
    pool: &mut BlockPool<T>,
    inodes: &InodeTable,
    dir: u32,
    name: &str,
) -> Result<u32> {
    let (_, block) = dir_block(pool, inodes, dir)?;
    block
        .find(name)
        .map(|(_, entry)| entry.inum)
        .ok_or(NufsError::NotFound)
}

/// Binds `name` to `inum` in `dir` and takes a reference on `inum`. Duplicate
/// names are not detected here.
pub fn put<T: BlockStorage>(
    pool: &mut BlockPool<T>,
    inodes: &mut InodeTable,
    dir: u32,
    name: &str,
    inum: u32,
) -> Result<()> {
    validate_name(name)?;
    let refs = inodes.get(inum)?.ref_count;
    if refs == u16::MAX {
        return Err(NufsError::InvalidArgument(format!(
            "inode {} has too many links",
            inum
        )));
    }

    let (block_nr, mut block) = dir_block(pool, inodes, dir)?;
    let slot = block.insert(name, inum)?;
    block.write(pool, block_nr)?;

    inodes.get_mut(inum)?.ref_count = refs + 1;
    trace!("put {} -> {} in dir {} slot {}", name, inum, dir, slot);
    Ok(())
}

/// Tombstones `name` in `dir` and drops its reference, freeing the inode once no
/// entry names it.
pub fn delete<T: BlockStorage>(
    pool: &mut BlockPool<T>,
    inodes: &mut InodeTable,
    dir: u32,
    name: &str,
) -> Result<()> {
    let (block_nr, mut block) = dir_block(pool, inodes, dir)?;
    let (slot, entry) = block.find(name).ok_or(NufsError::NotFound)?;
    block.tombstone(slot);
    block.write(pool, block_nr)?;

    let node = inodes.get_mut(entry.inum)?;
    node.ref_count = node.ref_count.saturating_sub(1);
    trace!(
        "delete {} -> {} from dir {} ({} refs left)",
        name,
        entry.inum,
        dir,
        node.ref_count
    );
    if node.ref_count == 0 {
        inodes.free(pool, entry.inum)?;
    }
    Ok(())
}

/// Live entries of `dir` as (name, inum) pairs, in slot order.
pub fn entries<T: BlockStorage>(
    pool: &mut BlockPool<T>,
    inodes: &InodeTable,
    dir: u32,
) -> Result<Vec<(String, u32)>> {
    let (_, block) = dir_block(pool, inodes, dir)?;
    Ok(block
        .live()
        .map(|(_, entry)| (entry.name(), entry.inum))
        .collect())
}

pub fn list<T: BlockStorage>(
    pool: &mut BlockPool<T>,
    inodes: &InodeTable,
    dir: u32,
) -> Result<Vec<String>> {
    Ok(entries(pool, inodes, dir)?
        .into_iter()
        .map(|(name, _)| name)
        .collect())
}

/// The inode a directory block names as ".", i.e. its own inode number.
pub fn root_binding(block: &DirBlock) -> Option<u32> {
    let inum = block.find(DOT).map(|(_, entry)| entry.inum);
    debug!("root binding -> {:?}", inum);
    inum
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::MemoryBlockEmulator;
    use crate::layout::{DIRECTORY_MODE, FILE_MODE};

    struct Fixture {
        pool: BlockPool<MemoryBlockEmulator>,
        inodes: InodeTable,
        dir: u32,
    }

    impl Fixture {
        fn new() -> Self {
            let mut pool = BlockPool::open(MemoryBlockEmulator::new(256)).unwrap();
            pool.reserve_metadata().unwrap();
            let mut inodes = InodeTable::load(&mut pool).unwrap();
            let dir = inodes.allocate(&mut pool, DIRECTORY_MODE).unwrap();
            let block = inodes.get(dir).unwrap().block as usize;
            init(&mut pool, block).unwrap();
            put(&mut pool, &mut inodes, dir, DOT, dir).unwrap();
            Self { pool, inodes, dir }
        }

        fn file(&mut self) -> u32 {
            self.inodes.allocate(&mut self.pool, FILE_MODE).unwrap()
        }

        fn put(&mut self, name: &str, inum: u32) -> Result<()> {
            put(&mut self.pool, &mut self.inodes, self.dir, name, inum)
        }

        fn delete(&mut self, name: &str) -> Result<()> {
            delete(&mut self.pool, &mut self.inodes, self.dir, name)
        }

        fn lookup(&mut self, name: &str) -> Result<u32> {
            lookup(&mut self.pool, &self.inodes, self.dir, name)
        }

        fn header(&mut self) -> DirHeader {
            let block = self.inodes.get(self.dir).unwrap().block as usize;
            DirBlock::read(&mut self.pool, block).unwrap().header()
        }
    }

    #[test]
    fn header_and_entry_are_64_bytes() {
        assert_eq!(std::mem::size_of::<DirHeader>(), DIR_HEADER_SIZE);
        assert_eq!(std::mem::size_of::<DirEntry>(), DIR_ENTRY_SIZE);
        assert_eq!(DIR_CAPACITY, 63);
    }

    #[test]
    fn put_then_lookup_finds_inode_and_counts_reference() {
        let mut fx = Fixture::new();
        let file = fx.file();
        fx.put("hello.txt", file).unwrap();

        assert_eq!(fx.lookup("hello.txt").unwrap(), file);
        assert_eq!(fx.inodes.get(file).unwrap().ref_count, 1);
        assert!(matches!(fx.lookup("hello"), Err(NufsError::NotFound)));
        assert!(matches!(fx.lookup("hello.txt2"), Err(NufsError::NotFound)));
    }

    #[test]
    fn lookup_in_regular_file_is_not_a_directory() {
        let mut fx = Fixture::new();
        let file = fx.file();
        let result = lookup(&mut fx.pool, &fx.inodes, file, "x");
        assert!(matches!(result, Err(NufsError::NotADirectory)));
    }

    #[test]
    fn delete_frees_inode_when_last_reference_goes() {
        let mut fx = Fixture::new();
        let file = fx.file();
        fx.put("a", file).unwrap();
        fx.put("b", file).unwrap();

        fx.delete("a").unwrap();
        assert!(fx.inodes.is_allocated(file));
        assert_eq!(fx.inodes.get(file).unwrap().ref_count, 1);

        fx.delete("b").unwrap();
        assert!(!fx.inodes.is_allocated(file));
        assert!(matches!(fx.delete("b"), Err(NufsError::NotFound)));
    }

    #[test]
    fn lookup_scans_past_tombstones_to_high_water_mark() {
        let mut fx = Fixture::new();
        let files: Vec<u32> = (0..4).map(|_| fx.file()).collect();
        for (i, &file) in files.iter().enumerate() {
            fx.put(&format!("f{}", i), file).unwrap();
        }
        // Live count drops below the slot of f3 once two earlier slots are dead.
        fx.delete("f0").unwrap();
        fx.delete("f1").unwrap();
        fx.delete("f2").unwrap();

        let header = fx.header();
        assert_eq!(header.num_entries, 2);
        assert_eq!(header.high_water, 5);
        assert_eq!(fx.lookup("f3").unwrap(), files[3]);
    }

    #[test]
    fn put_reuses_first_tombstone() {
        let mut fx = Fixture::new();
        let a = fx.file();
        let b = fx.file();
        let c = fx.file();
        fx.put("a", a).unwrap();
        fx.put("b", b).unwrap();
        fx.delete("a").unwrap();
        fx.put("c", c).unwrap();

        let header = fx.header();
        assert_eq!(header.high_water, 3);
        assert_eq!(header.num_entries, 3);
        let names = list(&mut fx.pool, &fx.inodes, fx.dir).unwrap();
        assert_eq!(names, vec![".", "c", "b"]);
    }

    #[test]
    fn full_directory_rejects_put_without_side_effects() {
        let mut fx = Fixture::new();
        let file = fx.file();
        for i in 1..DIR_CAPACITY {
            fx.put(&format!("n{}", i), file).unwrap();
        }
        let refs = fx.inodes.get(file).unwrap().ref_count;
        assert!(matches!(fx.put("one-too-many", file), Err(NufsError::DirectoryFull)));
        assert_eq!(fx.inodes.get(file).unwrap().ref_count, refs);

        // A tombstone makes room again.
        fx.delete("n1").unwrap();
        fx.put("one-too-many", file).unwrap();
    }

    #[test]
    fn names_are_validated() {
        let mut fx = Fixture::new();
        let file = fx.file();
        assert!(matches!(
            fx.put(&"x".repeat(NAME_MAX + 1), file),
            Err(NufsError::NameTooLong)
        ));
        assert!(matches!(fx.put("a/b", file), Err(NufsError::InvalidArgument(_))));
        assert!(matches!(fx.put("", file), Err(NufsError::InvalidArgument(_))));

        let longest = "y".repeat(NAME_MAX);
        fx.put(&longest, file).unwrap();
        assert_eq!(fx.lookup(&longest).unwrap(), file);
    }

    #[test]
    fn root_binding_reads_dot_entry() {
        let mut fx = Fixture::new();
        let block = fx.inodes.get(fx.dir).unwrap().block as usize;
        let dir = DirBlock::read(&mut fx.pool, block).unwrap();
        assert_eq!(root_binding(&dir), Some(fx.dir));

        let empty = DirBlock::from_bytes(&[0; BLOCK_SIZE]).unwrap();
        assert_eq!(root_binding(&empty), None);
    }
}
