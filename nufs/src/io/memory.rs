use super::block::{BlockNumber, BlockStorage};
use super::diskemu::{check_buffer, check_range};
use crate::layout::BLOCK_SIZE;

use std::io::ErrorKind;
use std::path::Path;

/// Keeps every block on the heap. Nothing survives the process; useful when a
/// test does not care about the image file.
pub struct MemoryBlockEmulator {
    blocks: Vec<[u8; BLOCK_SIZE]>,
}

impl MemoryBlockEmulator {
    pub fn new(block_count: usize) -> Self {
        Self {
            blocks: vec![[0; BLOCK_SIZE]; block_count],
        }
    }
}

impl BlockStorage for MemoryBlockEmulator {
    /// Memory devices have no backing path; the argument only exists to satisfy the
    /// trait and is rejected.
    fn open_disk<P: AsRef<Path>>(_path: P, _nblocks: usize) -> std::io::Result<Self> {
        Err(std::io::Error::new(
            ErrorKind::Unsupported,
            "memory devices cannot be opened from a path",
        ))
    }

    fn read_block(&mut self, blocknr: BlockNumber, buf: &mut [u8]) -> std::io::Result<()> {
        check_range(blocknr, self.blocks.len())?;
        check_buffer(buf)?;
        buf[..BLOCK_SIZE].copy_from_slice(&self.blocks[blocknr]);
        Ok(())
    }

    fn write_block(&mut self, blocknr: BlockNumber, buf: &[u8]) -> std::io::Result<()> {
        check_range(blocknr, self.blocks.len())?;
        let max = buf.len().min(BLOCK_SIZE);
        self.blocks[blocknr][..max].copy_from_slice(&buf[..max]);
        Ok(())
    }

    fn sync_disk(&mut self) -> std::io::Result<()> {
        Ok(())
    }

    fn block_count(&self) -> usize {
        self.blocks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocks_start_zeroed_and_keep_writes() {
        let mut dev = MemoryBlockEmulator::new(3);
        let mut buf = vec![0xff; BLOCK_SIZE];
        dev.read_block(2, &mut buf).unwrap();
        assert_eq!(buf, vec![0; BLOCK_SIZE]);

        dev.write_block(2, &[7; BLOCK_SIZE]).unwrap();
        dev.read_block(2, &mut buf).unwrap();
        assert_eq!(buf, vec![7; BLOCK_SIZE]);
    }

    #[test]
    fn out_of_range_is_invalid_input() {
        let mut dev = MemoryBlockEmulator::new(1);
        let err = dev.write_block(1, &[0; BLOCK_SIZE]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }
}
