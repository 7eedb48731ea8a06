use crate::error::{NufsError, Result};
use crate::io::BlockStorage;
use crate::layout::{BLOCK_SIZE, DATA_REGION_BMP, MAX_BLOCK_COUNT, RESERVED_BLOCKS};

use log::trace;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

#[derive(Debug, PartialEq)]
pub enum State {
    Free,
    Used,
}

#[repr(C)]
#[derive(AsBytes, FromBytes, FromZeroes, Clone, Copy, Debug, PartialEq)]
pub struct Bitmap {
    /// Stores 4096 bytes mapping each bit to a logical slot. A 4K bitmap
    /// supports tracking up to 4096 * 8 slots per bitmap block.
    bitmap: [u64; BLOCK_SIZE / 8],
}

impl Default for Bitmap {
    fn default() -> Self {
        Self::new()
    }
}

impl Bitmap {
    pub fn new() -> Self {
        Self {
            bitmap: [0; BLOCK_SIZE / 8],
        }
    }

    /// Reads a bitmap from the first block's worth of `buf`.
    pub fn parse(buf: &[u8]) -> Option<Self> {
        Self::read_from(buf.get(..BLOCK_SIZE)?)
    }

    pub fn serialize(&self) -> &[u8] {
        self.as_bytes()
    }

    pub fn get(&self, slot: usize) -> State {
        assert!(slot < MAX_BLOCK_COUNT, "bitmap slot {} out of range", slot);
        // Grab the u64 containing the significant bit.
        let word = self.bitmap[slot / 64];
        let mask = 1_u64 << (slot % 64);
        if word & mask == 0 {
            State::Free
        } else {
            State::Used
        }
    }

    pub fn set_reserved(&mut self, slot: usize) {
        assert!(slot < MAX_BLOCK_COUNT, "bitmap slot {} out of range", slot);
        self.bitmap[slot / 64] |= 1_u64 << (slot % 64);
    }

    pub fn set_free(&mut self, slot: usize) {
        assert!(slot < MAX_BLOCK_COUNT, "bitmap slot {} out of range", slot);
        self.bitmap[slot / 64] &= !(1_u64 << (slot % 64));
    }

    /// The lowest free slot below `cap`.
    pub fn first_free(&self, cap: usize) -> Option<usize> {
        (0..cap.min(MAX_BLOCK_COUNT)).find(|&slot| self.get(slot) == State::Free)
    }

    pub fn count_used(&self, cap: usize) -> usize {
        (0..cap.min(MAX_BLOCK_COUNT))
            .filter(|&slot| self.get(slot) == State::Used)
            .count()
    }
}

/// The device plus the allocation map of its blocks. Every allocation change is
/// written through to the bitmap block immediately.
pub struct BlockPool<T: BlockStorage> {
    dev: T,
    bitmap: Bitmap,
    block_count: usize,
}

impl<T: BlockStorage> BlockPool<T> {
    /// Loads the block bitmap from the device. Blocks past the device end are never
    /// handed out.
    pub fn open(mut dev: T) -> Result<Self> {
        let block_count = dev.block_count().min(MAX_BLOCK_COUNT);
        let mut buf = vec![0; BLOCK_SIZE];
        dev.read_block(DATA_REGION_BMP, &mut buf)?;
        let bitmap = Bitmap::parse(&buf).ok_or_else(|| NufsError::Corruption {
            block: DATA_REGION_BMP,
            detail: "short block bitmap".to_string(),
        })?;
        Ok(Self {
            dev,
            bitmap,
            block_count,
        })
    }

    /// Marks the bitmap and inode table blocks used. Returns false if they already
    /// were.
    pub fn reserve_metadata(&mut self) -> Result<bool> {
        if RESERVED_BLOCKS
            .iter()
            .all(|&block| self.bitmap.get(block) == State::Used)
        {
            return Ok(false);
        }
        for &block in RESERVED_BLOCKS.iter() {
            self.bitmap.set_reserved(block);
        }
        self.flush_bitmap()?;
        Ok(true)
    }

    pub fn is_allocated(&self, block: usize) -> bool {
        block < self.block_count && self.bitmap.get(block) == State::Used
    }

    /// Hands out the lowest free block id.
    pub fn allocate_block(&mut self) -> Result<usize> {
        let block = self
            .bitmap
            .first_free(self.block_count)
            .ok_or(NufsError::OutOfBlocks)?;
        self.bitmap.set_reserved(block);
        if let Err(e) = self.flush_bitmap() {
            self.bitmap.set_free(block);
            return Err(e);
        }
        trace!("allocated block {}", block);
        Ok(block)
    }

    pub fn free_block(&mut self, block: usize) -> Result<()> {
        if block >= self.block_count || RESERVED_BLOCKS.contains(&block) {
            return Err(NufsError::Corruption {
                block,
                detail: "freeing a block outside the data region".to_string(),
            });
        }
        self.bitmap.set_free(block);
        self.flush_bitmap()?;
        trace!("freed block {}", block);
        Ok(())
    }

    pub fn read_block(&mut self, block: usize, buf: &mut [u8]) -> Result<()> {
        self.dev.read_block(block, buf)?;
        Ok(())
    }

    pub fn write_block(&mut self, block: usize, buf: &[u8]) -> Result<()> {
        self.dev.write_block(block, buf)?;
        Ok(())
    }

    pub fn zero_block(&mut self, block: usize) -> Result<()> {
        self.write_block(block, &[0; BLOCK_SIZE])
    }

    pub fn block_count(&self) -> usize {
        self.block_count
    }

    pub fn free_blocks(&self) -> usize {
        self.block_count - self.bitmap.count_used(self.block_count)
    }

    pub fn sync(&mut self) -> Result<()> {
        self.dev.sync_disk()?;
        Ok(())
    }

    pub fn into_device(self) -> T {
        self.dev
    }

    fn flush_bitmap(&mut self) -> Result<()> {
        self.dev.write_block(DATA_REGION_BMP, self.bitmap.serialize())?;
        Ok(())
    }
}
