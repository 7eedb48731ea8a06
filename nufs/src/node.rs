use crate::alloc::{Bitmap, BlockPool, State};
use crate::error::{NufsError, Result};
use crate::io::BlockStorage;
use crate::layout::{BLOCK_SIZE, INODE_BMP, INODE_COUNT, INODE_SIZE, INODE_TABLE, S_IFDIR, S_IFMT};

use log::{debug, trace};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

#[repr(C)]
#[derive(AsBytes, FromBytes, FromZeroes, Copy, Clone, Debug, Default, PartialEq)]
/// This structure __must be exactly 32 bytes.__
pub struct Inode {
    /// Type and permission bits (e.g. drwxr-xr-x).
    pub mode: u16,
    /// Number of live directory entries naming this inode.
    pub ref_count: u16,
    /// Valid bytes in the data block.
    pub size: u32,
    /// The single data block owned by this inode.
    pub block: u32,
    /// Reserved for single indirection. Always zero.
    pub iblock: u32,
    /// Reserved for double indirection. Always zero.
    pub iiblock: u32,
    padding: [u16; 6],
}

impl Inode {
    fn new(mode: u16, block: u32) -> Self {
        Self {
            mode,
            block,
            ..Self::default()
        }
    }

    pub fn is_dir(&self) -> bool {
        self.mode & S_IFMT == S_IFDIR
    }
}

/// All inode slots of the image plus their allocation map. The table is one block,
/// kept resident and written back with [`InodeTable::flush`].
pub struct InodeTable {
    nodes: Vec<Inode>,
    alloc_tracker: Bitmap,
    dirty: bool,
}

impl InodeTable {
    /// Loads the inode bitmap and table blocks.
    pub fn load<T: BlockStorage>(pool: &mut BlockPool<T>) -> Result<Self> {
        let mut buf = vec![0; BLOCK_SIZE];
        pool.read_block(INODE_BMP, &mut buf)?;
        let alloc_tracker = Bitmap::parse(&buf).ok_or_else(|| NufsError::Corruption {
            block: INODE_BMP,
            detail: "short inode bitmap".to_string(),
        })?;

        pool.read_block(INODE_TABLE, &mut buf)?;
        let nodes = buf
            .chunks_exact(INODE_SIZE)
            .map(|raw| Inode::read_from(raw).unwrap_or_default())
            .collect();

        Ok(Self {
            nodes,
            alloc_tracker,
            dirty: false,
        })
    }

    /// Writes the bitmap and table back if anything changed since the last flush.
    pub fn flush<T: BlockStorage>(&mut self, pool: &mut BlockPool<T>) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        pool.write_block(INODE_BMP, self.alloc_tracker.serialize())?;
        pool.write_block(INODE_TABLE, &self.serialize_block())?;
        self.dirty = false;
        Ok(())
    }

    /// Claims the first free slot and its data block. The block is zeroed so a new
    /// file never exposes a previous owner's bytes.
    pub fn allocate<T: BlockStorage>(&mut self, pool: &mut BlockPool<T>, mode: u16) -> Result<u32> {
        let inum = self
            .alloc_tracker
            .first_free(INODE_COUNT)
            .ok_or(NufsError::OutOfInodes)?;

        // The slot is only marked once the block is secured, so a failure here
        // leaves nothing half-initialized behind.
        let block = pool.allocate_block()?;
        if let Err(e) = pool.zero_block(block) {
            pool.free_block(block)?;
            return Err(e);
        }

        self.alloc_tracker.set_reserved(inum);
        self.nodes[inum] = Inode::new(mode, block as u32);
        self.dirty = true;
        debug!("alloc inode {} mode {:o} -> block {}", inum, mode, block);
        Ok(inum as u32)
    }

    pub fn get(&self, inum: u32) -> Result<&Inode> {
        self.nodes
            .get(inum as usize)
            .ok_or(NufsError::InvalidInum(inum))
    }

    pub fn get_mut(&mut self, inum: u32) -> Result<&mut Inode> {
        let node = self
            .nodes
            .get_mut(inum as usize)
            .ok_or(NufsError::InvalidInum(inum))?;
        self.dirty = true;
        Ok(node)
    }

    pub fn is_allocated(&self, inum: u32) -> bool {
        (inum as usize) < INODE_COUNT && self.alloc_tracker.get(inum as usize) == State::Used
    }

    /// Releases the data block and the slot. The caller guarantees no directory
    /// entry still names the inode.
    pub fn free<T: BlockStorage>(&mut self, pool: &mut BlockPool<T>, inum: u32) -> Result<()> {
        let node = *self.get(inum)?;
        debug_assert_eq!(node.ref_count, 0, "freeing referenced inode {}", inum);
        // Only one block per file is supported.
        if node.iblock != 0 || node.iiblock != 0 {
            return Err(NufsError::Corruption {
                block: INODE_TABLE,
                detail: format!("inode {} has indirect blocks", inum),
            });
        }
        pool.free_block(node.block as usize)?;
        self.alloc_tracker.set_free(inum as usize);
        self.nodes[inum as usize] = Inode::default();
        self.dirty = true;
        debug!("free inode {} (block {})", inum, node.block);
        Ok(())
    }

    /// Adds `delta` bytes to the file size.
    pub fn grow(&mut self, inum: u32, delta: u32) -> Result<u32> {
        let node = self.get_mut(inum)?;
        let size = node
            .size
            .checked_add(delta)
            .filter(|&size| size as usize <= BLOCK_SIZE)
            .ok_or(NufsError::FileTooLarge)?;
        node.size = size;
        trace!("grow inode {} by {} -> {}", inum, delta, size);
        Ok(size)
    }

    /// Removes `delta` bytes from the file size, stopping at zero.
    pub fn shrink(&mut self, inum: u32, delta: u32) -> Result<u32> {
        let node = self.get_mut(inum)?;
        node.size = node.size.saturating_sub(delta);
        trace!("shrink inode {} by {} -> {}", inum, delta, node.size);
        Ok(node.size)
    }

    pub fn free_count(&self) -> usize {
        INODE_COUNT - self.alloc_tracker.count_used(INODE_COUNT)
    }

    /// Serializes the entire inode table block for writing to disk.
    fn serialize_block(&self) -> Vec<u8> {
        let mut block_buf = vec![0; BLOCK_SIZE];
        for (chunk, node) in block_buf.chunks_exact_mut(INODE_SIZE).zip(self.nodes.iter()) {
            chunk.copy_from_slice(node.as_bytes());
        }
        block_buf
    }
}
