use thiserror::Error;

#[derive(Error, Debug)]
pub enum NufsError {
    #[error("found no file at path")]
    NotFound,
    #[error("not a directory")]
    NotADirectory,
    #[error("is a directory")]
    IsADirectory,
    #[error("file already exists")]
    AlreadyExists,
    #[error("no free inodes")]
    OutOfInodes,
    #[error("no free data blocks")]
    OutOfBlocks,
    #[error("directory has no free entry slots")]
    DirectoryFull,
    #[error("file would exceed one block")]
    FileTooLarge,
    #[error("offset is past the end of the file")]
    InvalidOffset,
    #[error("inode number {0} out of range")]
    InvalidInum(u32),
    #[error("file name exceeds {} bytes", crate::layout::NAME_MAX)]
    NameTooLong,
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// On-disk state contradicts an invariant the engine relies on. The image
    /// should not be written to again.
    #[error("corrupt image at block {block}: {detail}")]
    Corruption { block: usize, detail: String },
    /// The new name was bound but neither the old binding could be removed
    /// nor the new one rolled back. Both names now reference the inode.
    #[error("rename {from} -> {to} left both names bound")]
    RenameIncomplete {
        from: String,
        to: String,
        #[source]
        source: Box<NufsError>,
    },
    #[error("invalid file system block layout")]
    InvalidBlock(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, NufsError>;
