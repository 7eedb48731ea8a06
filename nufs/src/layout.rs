//! Fixed geometry of a nufs image.
//!
//! # Layout
//! ==========================================================================
//! | Inode bitmap | Block bitmap | Inode table | Root directory | Data ... |
//! ==========================================================================
//!
//! Every region is exactly one block. The data region runs from
//! [`FIRST_DATA_BLOCK`] to the end of the device.

/// 4k blocks. A file never spans more than one of them.
pub const BLOCK_SIZE: usize = 4096;

/// Default image size, 1 MiB.
pub const DEFAULT_BLOCK_COUNT: usize = 256;

/// A bitmap is a single block, so no image can address more blocks than this.
pub const MAX_BLOCK_COUNT: usize = BLOCK_SIZE * 8;

/// Known locations.
pub const INODE_BMP: usize = 0;
pub const DATA_REGION_BMP: usize = 1;
pub const INODE_TABLE: usize = 2;
pub const ROOT_BLOCK: usize = 3;
pub const FIRST_DATA_BLOCK: usize = ROOT_BLOCK;

/// Blocks that are never handed out by the pool.
pub const RESERVED_BLOCKS: [usize; 3] = [INODE_BMP, DATA_REGION_BMP, INODE_TABLE];

pub const INODE_SIZE: usize = 32;
pub const INODE_COUNT: usize = BLOCK_SIZE / INODE_SIZE;

/// Type bits of the mode field.
pub const S_IFMT: u16 = 0o170_000;
pub const S_IFDIR: u16 = 0o040_000;
pub const S_IFREG: u16 = 0o100_000;

pub const DIRECTORY_MODE: u16 = S_IFDIR | 0o755;
pub const FILE_MODE: u16 = S_IFREG | 0o644;

pub const DIR_HEADER_SIZE: usize = 64;
pub const DIR_ENTRY_SIZE: usize = 64;
pub const DIR_NAME_LENGTH: usize = 48;
/// One byte of the name field is kept for the terminating NUL.
pub const NAME_MAX: usize = DIR_NAME_LENGTH - 1;
pub const DIR_CAPACITY: usize = (BLOCK_SIZE - DIR_HEADER_SIZE) / DIR_ENTRY_SIZE;

pub const DOT: &str = ".";
pub const DOTDOT: &str = "..";
