use super::block::{BlockNumber, BlockStorage};
use crate::layout::BLOCK_SIZE;

use std::fs::{File, OpenOptions};
use std::io::prelude::*;
use std::io::{BufWriter, ErrorKind, SeekFrom};
use std::path::Path;

use log::debug;

pub(crate) fn check_range(blocknr: BlockNumber, block_count: usize) -> std::io::Result<()> {
    if blocknr >= block_count {
        return Err(std::io::Error::new(
            ErrorKind::InvalidInput,
            format!("block {} out of range (device has {})", blocknr, block_count),
        ));
    }
    Ok(())
}

pub(crate) fn check_buffer(buf: &[u8]) -> std::io::Result<()> {
    if buf.len() < BLOCK_SIZE {
        return Err(std::io::Error::new(
            ErrorKind::InvalidInput,
            "buffer does not contain enough space to hold a block",
        ));
    }
    Ok(())
}

/// Emulates block disk/flash storage in userspace using a file as block storage.
/// This is the backing store for a mounted image.
pub struct FileBlockEmulator {
    /// The file must be a fixed-size file some exact multiple of the size of a block.
    fd: File,
    /// The total number of blocks available in the file store.
    block_count: usize,
}

impl FileBlockEmulator {
    /// Returns ownership of the underlying file descriptor to the caller.
    pub fn into_file(self) -> File {
        self.fd
    }
}

impl BlockStorage for FileBlockEmulator {
    fn open_disk<P: AsRef<Path>>(dest: P, nblocks: usize) -> std::io::Result<Self>
    where
        Self: std::marker::Sized,
    {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(dest.as_ref())?;
        // Grow short images, never shrink. Existing blocks keep their contents.
        let want = (nblocks * BLOCK_SIZE) as u64;
        if file.metadata()?.len() < want {
            file.set_len(want)?;
        }
        debug!(
            "opened image {} with {} blocks",
            dest.as_ref().display(),
            nblocks
        );

        Ok(FileBlockEmulator {
            fd: file,
            block_count: nblocks,
        })
    }

    fn read_block(&mut self, blocknr: BlockNumber, buf: &mut [u8]) -> std::io::Result<()> {
        check_range(blocknr, self.block_count)?;
        check_buffer(buf)?;
        self.fd
            .seek(SeekFrom::Start((blocknr * BLOCK_SIZE) as u64))?;
        // Limit the read to just the block specified.
        self.fd.read_exact(&mut buf[..BLOCK_SIZE])
    }

    /// This method truncates writes that exceed the total block size.
    fn write_block(&mut self, blocknr: BlockNumber, buf: &[u8]) -> std::io::Result<()> {
        check_range(blocknr, self.block_count)?;
        self.fd
            .seek(SeekFrom::Start((blocknr * BLOCK_SIZE) as u64))?;

        let max = buf.len().min(BLOCK_SIZE);
        self.fd.write_all(&buf[0..max])
    }

    fn sync_disk(&mut self) -> std::io::Result<()> {
        self.fd.sync_all()
    }

    fn block_count(&self) -> usize {
        self.block_count
    }
}

pub struct FileBlockEmulatorBuilder {
    fd: File,
    block_count: usize,
    clear: bool,
}

impl From<File> for FileBlockEmulatorBuilder {
    fn from(fd: File) -> Self {
        FileBlockEmulatorBuilder {
            fd,
            block_count: crate::layout::DEFAULT_BLOCK_COUNT,
            clear: true,
        }
    }
}

impl FileBlockEmulatorBuilder {
    /// Sets the number of desired blocks in the block store device.
    pub fn with_block_count(mut self, blocks: usize) -> Self {
        self.block_count = blocks;
        self
    }

    /// Whether to zero the medium on build. Turn this off to reattach to an
    /// image that already holds a filesystem.
    pub fn clear_medium(mut self, clear: bool) -> Self {
        self.clear = clear;
        self
    }

    /// This builder assumes ownership of the file descriptor used and, unless told
    /// otherwise, does destructive things to prepare the file for use. Ownership
    /// of the file is transfered to the emulator meaning this builder can only
    /// be used to create one emulator.
    pub fn build(mut self) -> std::io::Result<FileBlockEmulator> {
        if self.block_count == 0 {
            return Err(std::io::Error::new(
                ErrorKind::InvalidInput,
                "block device needs at least one block",
            ));
        }
        if self.clear {
            self.zero_blocks()?;
        } else if self.fd.metadata()?.len() < (self.block_count * BLOCK_SIZE) as u64 {
            self.fd.set_len((self.block_count * BLOCK_SIZE) as u64)?;
        }
        Ok(FileBlockEmulator {
            fd: self.fd,
            block_count: self.block_count,
        })
    }

    fn zero_blocks(&mut self) -> std::io::Result<()> {
        self.fd.seek(SeekFrom::Start(0))?;
        let mut bfd = BufWriter::new(&self.fd);
        // Zero out the "disk" block, buffering each write to prevent excessive reads.
        let zeroes = [0x00; BLOCK_SIZE];
        for _ in 0..self.block_count {
            bfd.write_all(&zeroes)?;
        }
        bfd.flush()
    }
}
