//! A small single-image filesystem engine.
//!
//! Files and directories each own exactly one 4k data block. Directories are
//! arrays of fixed-width name to inode bindings, and every inode counts the
//! directory entries that name it; the inode and its block are released as soon
//! as that count reaches zero.
//!
//! ```no_run
//! use nufs::io::{BlockStorage, FileBlockEmulator};
//! use nufs::Nufs;
//!
//! let dev = FileBlockEmulator::open_disk("disk.img", nufs::layout::DEFAULT_BLOCK_COUNT)?;
//! let mut fs = Nufs::open(dev)?;
//! fs.write("/hello", b"hello", 0)?;
//! # Ok::<(), nufs::NufsError>(())
//! ```

mod alloc;
pub mod dir;
mod error;
mod fs;
pub mod io;
pub mod layout;
mod node;
pub mod path;

pub use crate::alloc::{Bitmap, BlockPool, State};
pub use crate::error::{NufsError, Result};
pub use crate::fs::{DirEntryInfo, FileAttr, FsStats, Nufs};
pub use crate::node::{Inode, InodeTable};
