use crate::alloc::BlockPool;
use crate::dir::{self, DirBlock};
use crate::error::{NufsError, Result};
use crate::io::BlockStorage;
use crate::layout::{
    BLOCK_SIZE, DIRECTORY_MODE, DOT, DOTDOT, FILE_MODE, FIRST_DATA_BLOCK, INODE_BMP, INODE_COUNT,
    INODE_TABLE, NAME_MAX, ROOT_BLOCK, S_IFDIR, S_IFMT,
};
use crate::node::{Inode, InodeTable};
use crate::path;

use log::{debug, info, trace, warn};

/// What `stat` reports about a file or directory.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FileAttr {
    pub inum: u32,
    pub mode: u16,
    pub size: u32,
    pub ref_count: u16,
}

impl FileAttr {
    fn from_inode(inum: u32, node: &Inode) -> Self {
        Self {
            inum,
            mode: node.mode,
            size: node.size,
            ref_count: node.ref_count,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.mode & S_IFMT == S_IFDIR
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DirEntryInfo {
    pub name: String,
    pub attr: FileAttr,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FsStats {
    pub block_size: usize,
    pub total_blocks: usize,
    pub free_blocks: usize,
    pub total_inodes: usize,
    pub free_inodes: usize,
    pub name_max: usize,
}

/// A mounted image. Owns the device, both allocation maps and the inode table;
/// every operation takes `&mut self`, so callers serialize access.
///
/// Each file owns exactly one data block, so no file grows past [`BLOCK_SIZE`].
pub struct Nufs<T: BlockStorage> {
    pool: BlockPool<T>,
    inodes: InodeTable,
    root: u32,
}

impl<T: BlockStorage> Nufs<T> {
    /// Formats the device, discarding whatever filesystem it held, and mounts it.
    pub fn create(mut dev: T) -> Result<Self> {
        Self::check_geometry(&dev)?;
        let zeroes = [0; BLOCK_SIZE];
        for block in INODE_BMP..=ROOT_BLOCK {
            dev.write_block(block, &zeroes)?;
        }
        info!("formatted device with {} blocks", dev.block_count());
        Self::open(dev)
    }

    /// Mounts the device, initializing the metadata blocks and root directory if
    /// the image does not have them yet. Opening an initialized image never
    /// touches its root.
    pub fn open(dev: T) -> Result<Self> {
        Self::check_geometry(&dev)?;
        let mut pool = BlockPool::open(dev)?;
        if pool.reserve_metadata()? {
            info!("reserved bitmap and inode table blocks");
        }
        let mut inodes = InodeTable::load(&mut pool)?;

        if !pool.is_allocated(ROOT_BLOCK) {
            Self::init_root(&mut pool, &mut inodes)?;
            inodes.flush(&mut pool)?;
        }

        let root = dir::root_binding(&DirBlock::read(&mut pool, ROOT_BLOCK)?).ok_or_else(|| {
            NufsError::Corruption {
                block: ROOT_BLOCK,
                detail: "root directory has no \".\" entry".to_string(),
            }
        })?;
        if !inodes.is_allocated(root) || !inodes.get(root)?.is_dir() {
            return Err(NufsError::Corruption {
                block: INODE_TABLE,
                detail: format!("root inode {} is not an allocated directory", root),
            });
        }

        info!(
            "mounted image: root inode {}, {} free blocks, {} free inodes",
            root,
            pool.free_blocks(),
            inodes.free_count()
        );
        Ok(Self { pool, inodes, root })
    }

    fn check_geometry(dev: &T) -> Result<()> {
        if dev.block_count() <= FIRST_DATA_BLOCK {
            return Err(NufsError::InvalidArgument(format!(
                "device has {} blocks, need at least {}",
                dev.block_count(),
                FIRST_DATA_BLOCK + 1
            )));
        }
        Ok(())
    }

    /// The first inode allocated on a fresh image becomes the root; its block has
    /// to be the well-known root block.
    fn init_root(pool: &mut BlockPool<T>, inodes: &mut InodeTable) -> Result<()> {
        let inum = inodes.allocate(pool, DIRECTORY_MODE)?;
        let block = inodes.get(inum)?.block as usize;
        if block != ROOT_BLOCK {
            return Err(NufsError::Corruption {
                block,
                detail: format!("root directory landed outside block {}", ROOT_BLOCK),
            });
        }
        dir::init(pool, block)?;
        dir::put(pool, inodes, inum, DOT, inum)?;
        info!("initialized root directory at inode {}", inum);
        Ok(())
    }

    pub fn root(&self) -> u32 {
        self.root
    }

    /// Runs a mutation and writes the inode table back whether or not it
    /// succeeded, so the image mirrors memory.
    fn mutate<R>(&mut self, op: impl FnOnce(&mut Self) -> Result<R>) -> Result<R> {
        let result = op(self);
        self.inodes.flush(&mut self.pool)?;
        result
    }

    pub fn resolve(&mut self, path: &str) -> Result<u32> {
        path::resolve(&mut self.pool, &self.inodes, self.root, path)
    }

    /// Like `resolve`, but a missing path is `None` rather than an error.
    fn try_resolve(&mut self, path: &str) -> Result<Option<u32>> {
        match self.resolve(path) {
            Ok(inum) => Ok(Some(inum)),
            Err(NufsError::NotFound) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn exists(&mut self, path: &str) -> bool {
        self.resolve(path).is_ok()
    }

    pub fn stat(&mut self, path: &str) -> Result<FileAttr> {
        let inum = self.resolve(path)?;
        Ok(FileAttr::from_inode(inum, self.inodes.get(inum)?))
    }

    pub fn inode(&self, inum: u32) -> Result<Inode> {
        self.inodes.get(inum).map(|node| *node)
    }

    /// Copies up to `buf.len()` bytes starting at `offset`. Reads never cross the
    /// end of the block; an offset past the end of the file reads nothing.
    pub fn read(&mut self, path: &str, buf: &mut [u8], offset: usize) -> Result<usize> {
        let inum = self.resolve(path)?;
        let node = *self.inodes.get(inum)?;
        if node.is_dir() {
            return Err(NufsError::IsADirectory);
        }
        if offset > node.size as usize {
            return Ok(0);
        }

        let count = buf.len().min(BLOCK_SIZE - offset);
        let mut block = vec![0; BLOCK_SIZE];
        self.pool.read_block(node.block as usize, &mut block)?;
        buf[..count].copy_from_slice(&block[offset..offset + count]);
        trace!("read {} bytes of {} @+{}", count, path, offset);
        Ok(count)
    }

    /// Writes `data` at `offset`, creating a regular file if `path` is unbound. The
    /// file ends where the write ends afterwards. Bytes past the block end are
    /// dropped.
    pub fn write(&mut self, path: &str, data: &[u8], offset: usize) -> Result<usize> {
        self.mutate(|fs| {
            let inum = match fs.try_resolve(path)? {
                Some(inum) => inum,
                // A new file is empty, so any other offset would leave a hole.
                None if offset > 0 => return Err(NufsError::InvalidOffset),
                None => fs.find_or_create_unflushed(path, FILE_MODE)?,
            };
            let node = *fs.inodes.get(inum)?;
            if node.is_dir() {
                return Err(NufsError::IsADirectory);
            }
            if offset > node.size as usize {
                return Err(NufsError::InvalidOffset);
            }

            let count = data.len().min(BLOCK_SIZE - offset);
            let end = offset + count;
            fs.rewrite_block(&node, |block| {
                block[offset..end].copy_from_slice(&data[..count]);
            })?;
            fs.set_size(inum, &node, end)?;
            trace!("wrote {} bytes to {} @+{}", count, path, offset);
            Ok(count)
        })
    }

    /// Sets the size of the file. Bytes cut off by a shrink are zeroed.
    pub fn truncate(&mut self, path: &str, size: usize) -> Result<()> {
        self.mutate(|fs| {
            let inum = fs.resolve(path)?;
            if size > BLOCK_SIZE {
                return Err(NufsError::FileTooLarge);
            }
            let node = *fs.inodes.get(inum)?;
            if node.is_dir() {
                return Err(NufsError::IsADirectory);
            }
            fs.set_size(inum, &node, size)
        })
    }

    /// Read-modify-write of a file's data block.
    fn rewrite_block(&mut self, node: &Inode, edit: impl FnOnce(&mut [u8])) -> Result<()> {
        let mut block = vec![0; BLOCK_SIZE];
        self.pool.read_block(node.block as usize, &mut block)?;
        edit(&mut block);
        self.pool.write_block(node.block as usize, &block)
    }

    /// Moves the end of file, zeroing the tail when it shrinks so bytes past the
    /// end of file are always zero.
    fn set_size(&mut self, inum: u32, node: &Inode, size: usize) -> Result<()> {
        let old = node.size as usize;
        if size < old {
            self.rewrite_block(node, |block| {
                block[size..old].iter_mut().for_each(|b| *b = 0);
            })?;
            self.inodes.shrink(inum, (old - size) as u32)?;
        } else {
            self.inodes.grow(inum, (size - old) as u32)?;
        }
        Ok(())
    }

    /// Returns the inode at `path`, creating it with `mode` in the parent directory
    /// if it does not exist.
    pub fn find_or_create(&mut self, path: &str, mode: u16) -> Result<u32> {
        self.mutate(|fs| fs.find_or_create_unflushed(path, mode))
    }

    fn find_or_create_unflushed(&mut self, path: &str, mode: u16) -> Result<u32> {
        if let Some(inum) = self.try_resolve(path)? {
            return Ok(inum);
        }
        let (parent, leaf) = self.parent_of(path)?;
        let inum = self.inodes.allocate(&mut self.pool, mode)?;
        if let Err(e) = dir::put(&mut self.pool, &mut self.inodes, parent, leaf, inum) {
            self.inodes.free(&mut self.pool, inum)?;
            return Err(e);
        }
        debug!("created {} as inode {} (mode {:o})", path, inum, mode);
        Ok(inum)
    }

    /// Resolves the directory that holds `path` and validates its leaf name.
    fn parent_of<'p>(&mut self, path: &'p str) -> Result<(u32, &'p str)> {
        let (parent, leaf) = path::split(path)?;
        if leaf == DOT || leaf == DOTDOT {
            return Err(NufsError::InvalidArgument(format!(
                "{:?} cannot be created or removed",
                leaf
            )));
        }
        dir::validate_name(leaf)?;
        let parent = self.resolve(parent)?;
        if !self.inodes.get(parent)?.is_dir() {
            return Err(NufsError::NotADirectory);
        }
        Ok((parent, leaf))
    }

    /// Creates an empty directory holding "." and "..".
    pub fn create_directory(&mut self, path: &str) -> Result<u32> {
        self.mutate(|fs| {
            if fs.try_resolve(path)?.is_some() {
                return Err(NufsError::AlreadyExists);
            }
            let (parent, leaf) = fs.parent_of(path)?;
            let inum = fs.inodes.allocate(&mut fs.pool, DIRECTORY_MODE)?;
            let block = fs.inodes.get(inum)?.block as usize;

            let built = dir::init(&mut fs.pool, block)
                .and_then(|_| dir::put(&mut fs.pool, &mut fs.inodes, inum, DOT, inum))
                .and_then(|_| dir::put(&mut fs.pool, &mut fs.inodes, inum, DOTDOT, parent))
                .and_then(|_| dir::put(&mut fs.pool, &mut fs.inodes, parent, leaf, inum));
            if let Err(e) = built {
                fs.discard_directory(inum)?;
                return Err(e);
            }
            debug!("created directory {} as inode {}", path, inum);
            Ok(inum)
        })
    }

    /// Releases a directory that no other entry names: drops its ".." and "."
    /// bindings, which frees the inode once its self reference goes.
    fn discard_directory(&mut self, inum: u32) -> Result<()> {
        for name in [DOTDOT, DOT].iter() {
            match dir::delete(&mut self.pool, &mut self.inodes, inum, name) {
                Ok(()) | Err(NufsError::NotFound) => (),
                Err(e) => return Err(e),
            }
        }
        if self.inodes.is_allocated(inum) && self.inodes.get(inum)?.ref_count == 0 {
            self.inodes.free(&mut self.pool, inum)?;
        }
        Ok(())
    }

    /// Binds `to` to the inode at `from`.
    pub fn link(&mut self, from: &str, to: &str) -> Result<()> {
        self.mutate(|fs| {
            let inum = fs.resolve(from)?;
            if fs.try_resolve(to)?.is_some() {
                return Err(NufsError::AlreadyExists);
            }
            let (parent, leaf) = fs.parent_of(to)?;
            dir::put(&mut fs.pool, &mut fs.inodes, parent, leaf, inum)?;
            debug!("linked {} -> {} (inode {})", to, from, inum);
            Ok(())
        })
    }

    /// Removes the binding at `path`. The inode goes once nothing names it.
    ///
    /// An empty directory is taken apart first so the inode can be reclaimed.
    /// Directories with children are unlinked as they are; their subtree stays
    /// allocated.
    pub fn unlink(&mut self, path: &str) -> Result<()> {
        self.mutate(|fs| {
            if path::is_root(path) {
                return Err(NufsError::InvalidArgument(
                    "cannot unlink the root directory".to_string(),
                ));
            }
            let inum = fs.resolve(path)?;
            let (parent, leaf) = fs.parent_of(path)?;

            let node = *fs.inodes.get(inum)?;
            if node.is_dir() && node.ref_count <= 2 {
                let names = dir::list(&mut fs.pool, &fs.inodes, inum)?;
                if names.iter().all(|name| name == DOT || name == DOTDOT) {
                    for name in names.iter().filter(|name| name.as_str() != DOT) {
                        dir::delete(&mut fs.pool, &mut fs.inodes, inum, name)?;
                    }
                    dir::delete(&mut fs.pool, &mut fs.inodes, inum, DOT)?;
                } else {
                    warn!("unlinking non-empty directory {}", path);
                }
            }

            dir::delete(&mut fs.pool, &mut fs.inodes, parent, leaf)?;
            debug!("unlinked {} (inode {})", path, inum);
            Ok(())
        })
    }

    /// Moves the entry at `from` to `to`.
    ///
    /// The new name is bound first and the old one removed second. If the removal
    /// fails the new binding is rolled back; only if that also fails does the
    /// caller see [`NufsError::RenameIncomplete`], with both names bound.
    pub fn rename(&mut self, from: &str, to: &str) -> Result<()> {
        self.mutate(|fs| {
            if path::is_root(from) {
                return Err(NufsError::InvalidArgument(
                    "cannot rename the root directory".to_string(),
                ));
            }
            let inum = fs.resolve(from)?;
            if fs.try_resolve(to)?.is_some() {
                return Err(NufsError::AlreadyExists);
            }
            let (from_parent, from_leaf) = fs.parent_of(from)?;
            let (to_parent, to_leaf) = fs.parent_of(to)?;

            let is_dir = fs.inodes.get(inum)?.is_dir();
            if is_dir && fs.is_ancestor(inum, to_parent)? {
                return Err(NufsError::InvalidArgument(format!(
                    "cannot move {} into itself",
                    from
                )));
            }

            dir::put(&mut fs.pool, &mut fs.inodes, to_parent, to_leaf, inum)?;
            if let Err(e) = dir::delete(&mut fs.pool, &mut fs.inodes, from_parent, from_leaf) {
                warn!("rename {} -> {}: unbinding source failed: {}", from, to, e);
                if dir::delete(&mut fs.pool, &mut fs.inodes, to_parent, to_leaf).is_err() {
                    return Err(NufsError::RenameIncomplete {
                        from: from.to_string(),
                        to: to.to_string(),
                        source: Box::new(e),
                    });
                }
                return Err(e);
            }

            if is_dir && from_parent != to_parent {
                dir::delete(&mut fs.pool, &mut fs.inodes, inum, DOTDOT)?;
                dir::put(&mut fs.pool, &mut fs.inodes, inum, DOTDOT, to_parent)?;
            }
            debug!("renamed {} -> {} (inode {})", from, to, inum);
            Ok(())
        })
    }

    /// Whether directory `start` is `node` or lies beneath it, following ".."
    /// up to the root.
    fn is_ancestor(&mut self, node: u32, start: u32) -> Result<bool> {
        let mut cur = start;
        for _ in 0..INODE_COUNT {
            if cur == node {
                return Ok(true);
            }
            if cur == self.root {
                return Ok(false);
            }
            cur = dir::lookup(&mut self.pool, &self.inodes, cur, DOTDOT)?;
        }
        Err(NufsError::Corruption {
            block: INODE_TABLE,
            detail: format!("\"..\" chain from inode {} never reaches the root", start),
        })
    }

    /// Names of the live entries in the directory at `path`, in slot order.
    pub fn list_directory(&mut self, path: &str) -> Result<Vec<String>> {
        let inum = self.resolve(path)?;
        dir::list(&mut self.pool, &self.inodes, inum)
    }

    /// Live entries of the directory at `path` along with their attributes.
    pub fn read_dir(&mut self, path: &str) -> Result<Vec<DirEntryInfo>> {
        let inum = self.resolve(path)?;
        dir::entries(&mut self.pool, &self.inodes, inum)?
            .into_iter()
            .map(|(name, inum)| -> Result<DirEntryInfo> {
                let attr = FileAttr::from_inode(inum, self.inodes.get(inum)?);
                Ok(DirEntryInfo { name, attr })
            })
            .collect()
    }

    pub fn statfs(&self) -> FsStats {
        FsStats {
            block_size: BLOCK_SIZE,
            total_blocks: self.pool.block_count(),
            free_blocks: self.pool.free_blocks(),
            total_inodes: INODE_COUNT,
            free_inodes: self.inodes.free_count(),
            name_max: NAME_MAX,
        }
    }

    pub fn sync(&mut self) -> Result<()> {
        self.inodes.flush(&mut self.pool)?;
        self.pool.sync()
    }

    /// Unmounts, handing the device back.
    pub fn into_device(mut self) -> Result<T> {
        self.sync()?;
        Ok(self.pool.into_device())
    }
}
