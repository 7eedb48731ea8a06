//! Path splitting and resolution.
//!
//! Paths are absolute and slash separated. Empty segments are ignored, so
//! `"/a//b"` and `"a/b"` name the same file as `"/a/b"`.

use crate::alloc::BlockPool;
use crate::dir;
use crate::error::{NufsError, Result};
use crate::io::BlockStorage;
use crate::node::InodeTable;

pub const ROOT_PATH: &str = "/";

/// The non-empty segments of `path`.
pub fn components(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|segment| !segment.is_empty())
}

pub fn is_root(path: &str) -> bool {
    components(path).next().is_none()
}

/// Splits `path` into its parent directory path and leaf name at the last "/".
/// A path with no "/" lives in the root directory.
///
/// # Errors
///
/// The root itself and paths ending in "/" have no leaf and are rejected.
pub fn split(path: &str) -> Result<(&str, &str)> {
    let (parent, leaf) = match path.rfind('/') {
        Some(idx) => (&path[..idx], &path[idx + 1..]),
        None => (ROOT_PATH, path),
    };
    if leaf.is_empty() {
        return Err(NufsError::InvalidArgument(format!(
            "{:?} does not name a file",
            path
        )));
    }
    let parent = if is_root(parent) { ROOT_PATH } else { parent };
    Ok((parent, leaf))
}

/// Walks `path` from `root`, failing on the first segment that is not bound.
pub fn resolve<T: BlockStorage>(
    pool: &mut BlockPool<T>,
    inodes: &InodeTable,
    root: u32,
    path: &str,
) -> Result<u32> {
    components(path).try_fold(root, |inum, segment| {
        dir::lookup(pool, inodes, inum, segment)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_nested_path() {
        assert_eq!(split("/a/b/c").unwrap(), ("/a/b", "c"));
    }

    #[test]
    fn split_top_level_path_has_root_parent() {
        assert_eq!(split("/a").unwrap(), ("/", "a"));
        assert_eq!(split("a").unwrap(), ("/", "a"));
        assert_eq!(split("//a").unwrap(), ("/", "a"));
    }

    #[test]
    fn split_rejects_paths_without_leaf() {
        assert!(matches!(split("/"), Err(NufsError::InvalidArgument(_))));
        assert!(matches!(split(""), Err(NufsError::InvalidArgument(_))));
        assert!(matches!(split("/a/"), Err(NufsError::InvalidArgument(_))));
    }

    #[test]
    fn components_skip_empty_segments() {
        let parts: Vec<&str> = components("//a///b/").collect();
        assert_eq!(parts, vec!["a", "b"]);
        assert!(is_root(""));
        assert!(is_root("///"));
        assert!(!is_root("/a"));
    }
}
