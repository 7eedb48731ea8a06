//! Path-based callback layer between a userspace filesystem protocol and a
//! [`Nufs`] image.
//!
//! Each callback takes the path the kernel hands over, runs one engine
//! operation under a lock, logs `op(args) -> rv`, and reports failures as a
//! positive errno.
//!
//! This crate does not link libfuse or start a kernel session. A session
//! loop forwards its requests to [`NufsOps`].

use std::fmt;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use libc::c_int;
use log::{debug, error, warn};
use nufs::io::{BlockStorage, FileBlockEmulator};
use nufs::layout::{BLOCK_SIZE, S_IFDIR, S_IFMT, S_IFREG};
use nufs::{FileAttr, Nufs, NufsError};
use thiserror::Error;

/// Callback outcome; the error is a positive errno.
pub type OpResult<T> = std::result::Result<T, c_int>;

#[derive(Error, Debug)]
pub enum FuseError {
    #[error("cannot open image: {0}")]
    Io(#[from] std::io::Error),
    #[error("cannot load filesystem: {0}")]
    Mount(#[from] NufsError),
}

/// Maps an engine error to the errno reported to the kernel.
pub fn to_errno(err: &NufsError) -> c_int {
    match err {
        NufsError::NotFound => libc::ENOENT,
        NufsError::NotADirectory => libc::ENOTDIR,
        NufsError::IsADirectory => libc::EISDIR,
        NufsError::AlreadyExists => libc::EEXIST,
        NufsError::OutOfInodes | NufsError::OutOfBlocks | NufsError::DirectoryFull => {
            libc::ENOSPC
        }
        NufsError::FileTooLarge => libc::EFBIG,
        NufsError::InvalidOffset | NufsError::InvalidInum(_) | NufsError::InvalidArgument(_) => {
            libc::EINVAL
        }
        NufsError::NameTooLong => libc::ENAMETOOLONG,
        NufsError::Corruption { .. } | NufsError::RenameIncomplete { .. } => libc::EIO,
        NufsError::InvalidBlock(err) => err.raw_os_error().unwrap_or(libc::EIO),
    }
}

/// The subset of `struct stat` the engine can fill in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stat {
    pub ino: u64,
    pub mode: u32,
    pub nlink: u32,
    pub size: u64,
    pub blksize: u32,
    /// 512-byte sectors held by the file.
    pub blocks: u64,
}

impl From<FileAttr> for Stat {
    fn from(attr: FileAttr) -> Self {
        Stat {
            ino: u64::from(attr.inum),
            mode: u32::from(attr.mode),
            nlink: u32::from(attr.ref_count),
            size: u64::from(attr.size),
            blksize: BLOCK_SIZE as u32,
            blocks: (BLOCK_SIZE / 512) as u64,
        }
    }
}

/// The subset of `struct statvfs` the engine can fill in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatVfs {
    pub bsize: u64,
    pub blocks: u64,
    pub bfree: u64,
    pub files: u64,
    pub ffree: u64,
    pub namemax: u64,
}

pub struct NufsOps<T: BlockStorage> {
    fs: Mutex<Nufs<T>>,
}

impl NufsOps<FileBlockEmulator> {
    /// Opens the image at `image`, formatting it first if it holds no
    /// filesystem yet.
    pub fn open_image<P: AsRef<Path>>(image: P, blocks: usize) -> Result<Self, FuseError> {
        let dev = FileBlockEmulator::open_disk(image, blocks)?;
        Ok(NufsOps::new(Nufs::open(dev)?))
    }
}

impl<T: BlockStorage> NufsOps<T> {
    pub fn new(fs: Nufs<T>) -> Self {
        NufsOps { fs: Mutex::new(fs) }
    }

    /// Releases the lock and hands back the engine.
    pub fn into_inner(self) -> Nufs<T> {
        self.fs.into_inner().unwrap_or_else(PoisonError::into_inner)
    }

    fn fs(&self) -> MutexGuard<'_, Nufs<T>> {
        self.fs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Every file is readable and writable by its owner, so only existence
    /// is checked.
    pub fn access(&self, path: &str, mask: c_int) -> OpResult<()> {
        let rv = self.fs().resolve(path).map(|_| ());
        reply("access", format_args!("{}, {:04o}", path, mask), rv)
    }

    pub fn getattr(&self, path: &str) -> OpResult<Stat> {
        let rv = self.fs().stat(path).map(Stat::from);
        reply("getattr", format_args!("{}", path), rv)
    }

    pub fn readdir(&self, path: &str) -> OpResult<Vec<(String, Stat)>> {
        let rv = self.fs().read_dir(path).map(|entries| {
            entries
                .into_iter()
                .map(|entry| (entry.name, Stat::from(entry.attr)))
                .collect()
        });
        reply("readdir", format_args!("{}", path), rv)
    }

    /// Creates a regular file. A mode without type bits is taken as a
    /// regular file; directory modes are routed to `mkdir`.
    ///
    /// A path that already exists is left untouched and reported as success,
    /// not `EEXIST`.
    pub fn mknod(&self, path: &str, mode: u32) -> OpResult<()> {
        let kind = u32::from(S_IFMT) & mode;
        let rv = if kind == u32::from(S_IFDIR) {
            self.fs().create_directory(path).map(|_| ())
        } else if kind == 0 || kind == u32::from(S_IFREG) {
            let mode = (mode & 0o7777) as u16 | S_IFREG;
            self.fs().find_or_create(path, mode).map(|_| ())
        } else {
            Err(NufsError::InvalidArgument(format!(
                "unsupported file type {:o}",
                kind
            )))
        };
        reply("mknod", format_args!("{}, {:04o}", path, mode), rv)
    }

    /// The requested permission bits are ignored; directories are always
    /// created with the default directory mode.
    pub fn mkdir(&self, path: &str, mode: u32) -> OpResult<()> {
        let rv = self.fs().create_directory(path).map(|_| ());
        reply("mkdir", format_args!("{}, {:04o}", path, mode), rv)
    }

    pub fn unlink(&self, path: &str) -> OpResult<()> {
        let rv = self.fs().unlink(path);
        reply("unlink", format_args!("{}", path), rv)
    }

    pub fn rmdir(&self, path: &str) -> OpResult<()> {
        let rv = self.fs().unlink(path);
        reply("rmdir", format_args!("{}", path), rv)
    }

    pub fn link(&self, from: &str, to: &str) -> OpResult<()> {
        let rv = self.fs().link(from, to);
        reply("link", format_args!("{} => {}", from, to), rv)
    }

    pub fn rename(&self, from: &str, to: &str) -> OpResult<()> {
        let rv = self.fs().rename(from, to);
        reply("rename", format_args!("{} => {}", from, to), rv)
    }

    /// Accepted for any existing path; modes are not persisted.
    pub fn chmod(&self, path: &str, mode: u32) -> OpResult<()> {
        let rv = self.fs().resolve(path).map(|_| ());
        reply("chmod", format_args!("{}, {:04o}", path, mode), rv)
    }

    pub fn truncate(&self, path: &str, size: i64) -> OpResult<()> {
        let rv = match usize_arg("size", size) {
            Ok(size) => self.fs().truncate(path, size),
            Err(e) => Err(e),
        };
        reply("truncate", format_args!("{}, {}", path, size), rv)
    }

    /// Succeeds for any existing path; no handle state is kept.
    pub fn open(&self, path: &str) -> OpResult<()> {
        let rv = self.fs().resolve(path).map(|_| ());
        reply("open", format_args!("{}", path), rv)
    }

    pub fn read(&self, path: &str, buf: &mut [u8], offset: i64) -> OpResult<usize> {
        let len = buf.len();
        let rv = match usize_arg("offset", offset) {
            Ok(offset) => self.fs().read(path, buf, offset),
            Err(e) => Err(e),
        };
        reply("read", format_args!("{}, {} bytes, @+{}", path, len, offset), rv)
    }

    /// Creates the file when it is missing. Writes past the single data
    /// block are clamped and the short count is returned.
    pub fn write(&self, path: &str, data: &[u8], offset: i64) -> OpResult<usize> {
        let rv = match usize_arg("offset", offset) {
            Ok(offset) => self.fs().write(path, data, offset),
            Err(e) => Err(e),
        };
        reply(
            "write",
            format_args!("{}, {} bytes, @+{}", path, data.len(), offset),
            rv,
        )
    }

    /// Timestamps are not stored; accepted for any existing path.
    pub fn utimens(&self, path: &str, atime: i64, mtime: i64) -> OpResult<()> {
        let rv = self.fs().resolve(path).map(|_| ());
        reply(
            "utimens",
            format_args!("{}, [{}, {}]", path, atime, mtime),
            rv,
        )
    }

    pub fn statfs(&self, path: &str) -> OpResult<StatVfs> {
        let stats = self.fs().statfs();
        let rv = Ok(StatVfs {
            bsize: stats.block_size as u64,
            blocks: stats.total_blocks as u64,
            bfree: stats.free_blocks as u64,
            files: stats.total_inodes as u64,
            ffree: stats.free_inodes as u64,
            namemax: stats.name_max as u64,
        });
        reply("statfs", format_args!("{}", path), rv)
    }

    /// Flushes the image to its backing storage.
    pub fn fsync(&self, path: &str) -> OpResult<()> {
        let rv = self.fs().sync();
        reply("fsync", format_args!("{}", path), rv)
    }
}

fn usize_arg(name: &str, value: i64) -> nufs::Result<usize> {
    if value < 0 {
        return Err(NufsError::InvalidArgument(format!(
            "negative {}: {}",
            name, value
        )));
    }
    Ok(value as usize)
}

fn reply<R>(op: &str, args: fmt::Arguments<'_>, rv: nufs::Result<R>) -> OpResult<R> {
    match rv {
        Ok(value) => {
            debug!("{}({}) -> 0", op, args);
            Ok(value)
        }
        Err(err) => {
            let errno = to_errno(&err);
            match err {
                NufsError::Corruption { .. } | NufsError::RenameIncomplete { .. } => {
                    error!("{}({}) -> -{}: {}", op, args, errno, err)
                }
                _ => warn!("{}({}) -> -{}: {}", op, args, errno, err),
            }
            Err(errno)
        }
    }
}
