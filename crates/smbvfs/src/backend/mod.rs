//! Filesystem backends.
//!
//! A [`Backend`] exposes one method per filesystem primitive. Callers resolve
//! names and handles before calling in; backends perform no policy checks of
//! their own and report every failure as a [`VfsError`](crate::error::VfsError).
//!
//! Two implementations ship with the crate:
//! - [`local::LocalBackend`] passes operations through to a host directory
//! - [`memory::MemoryBackend`] keeps the whole tree in memory

pub mod local;
pub mod memory;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use bitflags::bitflags;

use crate::attr::AttrChangeSet;
use crate::error::VfsResult;

pub const S_IFMT: u32 = 0o170_000;
pub const S_IFREG: u32 = 0o100_000;
pub const S_IFDIR: u32 = 0o040_000;
pub const S_IFLNK: u32 = 0o120_000;

/// Identity of a filesystem object, stable across renames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId {
    pub dev: u64,
    pub ino: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Regular,
    Directory,
    Symlink,
    Other,
}

impl FileKind {
    pub fn from_mode(mode: u32) -> Self {
        match mode & S_IFMT {
            S_IFREG => FileKind::Regular,
            S_IFDIR => FileKind::Directory,
            S_IFLNK => FileKind::Symlink,
            _ => FileKind::Other,
        }
    }
}

/// Snapshot of an object's metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attributes {
    pub node: NodeId,
    pub kind: FileKind,
    /// Full mode including file-type bits.
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub nlink: u64,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
}

impl Attributes {
    pub fn is_dir(&self) -> bool {
        self.kind == FileKind::Directory
    }

    /// Permission and special bits only.
    pub fn permissions(&self) -> u32 {
        self.mode & !S_IFMT
    }
}

/// One entry produced by directory iteration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub ino: u64,
    pub kind: FileKind,
}

/// How an object is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OpenMode {
    pub read: bool,
    pub write: bool,
}

impl OpenMode {
    pub const READ: OpenMode = OpenMode {
        read: true,
        write: false,
    };
    pub const READ_WRITE: OpenMode = OpenMode {
        read: true,
        write: true,
    };
}

bitflags! {
    /// setxattr flags (XATTR_CREATE / XATTR_REPLACE).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct XattrFlags: u32 {
        /// Fail if the attribute already exists.
        const CREATE = 0x1;
        /// Fail if the attribute does not exist.
        const REPLACE = 0x2;
    }
}

/// Object an operation applies to: a share path or an open backend file.
#[derive(Debug)]
pub enum Target<'a, F> {
    Path(&'a Path),
    File(&'a F),
}

impl<F> Clone for Target<'_, F> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<F> Copy for Target<'_, F> {}

/// Filesystem primitives. Paths are share-relative and already normalized.
///
/// Path-addressed operations never follow a symlink in the final component.
pub trait Backend: Send + Sync {
    /// Open-file state kept inside an `OpenHandle`.
    type File: Send + Sync + 'static;

    /// Create a regular file; fails with `Exists` if the name is taken.
    fn create(&self, path: &Path, mode: u32) -> VfsResult<()>;
    fn mkdir(&self, path: &Path, mode: u32) -> VfsResult<()>;
    fn rmdir(&self, path: &Path) -> VfsResult<()>;
    fn unlink(&self, path: &Path) -> VfsResult<()>;
    /// Replace `to` if it exists, like rename(2).
    fn rename(&self, from: &Path, to: &Path) -> VfsResult<()>;
    fn link(&self, existing: &Path, new: &Path) -> VfsResult<()>;
    fn symlink(&self, target: &Path, link: &Path) -> VfsResult<()>;
    fn readlink(&self, path: &Path) -> VfsResult<PathBuf>;
    fn lookup(&self, path: &Path) -> VfsResult<Attributes>;

    fn open(&self, path: &Path, mode: OpenMode) -> VfsResult<Self::File>;
    fn getattr(&self, file: &Self::File) -> VfsResult<Attributes>;
    /// Positional read; may return fewer bytes than requested at end of file.
    fn read(&self, file: &Self::File, buf: &mut [u8], offset: u64) -> VfsResult<usize>;
    fn write(&self, file: &Self::File, data: &[u8], offset: u64) -> VfsResult<usize>;
    fn fsync(&self, file: &Self::File) -> VfsResult<()>;
    /// Flush `[offset, offset + len)` to stable storage.
    fn fsync_range(&self, file: &Self::File, offset: u64, len: u64) -> VfsResult<()>;
    /// Reserve space without changing the file size.
    fn allocate(&self, file: &Self::File, len: u64) -> VfsResult<()>;
    fn read_dir(&self, file: &Self::File) -> VfsResult<Vec<DirEntry>>;
    /// Where an open object currently lives in the share. Fails with
    /// `NotFound` once it has no name left.
    fn path_of(&self, file: &Self::File) -> VfsResult<PathBuf>;

    fn truncate(&self, target: Target<'_, Self::File>, size: u64) -> VfsResult<()>;
    /// Apply a sanitized change set. The kill-privilege flags clear set-id bits
    /// after any ownership change has been applied.
    fn setattr(&self, target: Target<'_, Self::File>, changes: &AttrChangeSet) -> VfsResult<()>;
    /// Persist metadata of the target.
    fn sync_metadata(&self, target: Target<'_, Self::File>) -> VfsResult<()>;

    /// NUL-separated attribute names. Fails with `RangeTooLarge` if the list
    /// does not fit in `capacity` bytes.
    fn listxattr(&self, target: Target<'_, Self::File>, capacity: usize) -> VfsResult<Vec<u8>>;
    /// Length of an attribute value without reading it.
    fn xattr_len(&self, target: Target<'_, Self::File>, name: &str) -> VfsResult<usize>;
    fn getxattr(
        &self,
        target: Target<'_, Self::File>,
        name: &str,
        capacity: usize,
    ) -> VfsResult<Vec<u8>>;
    fn setxattr(
        &self,
        target: Target<'_, Self::File>,
        name: &str,
        value: &[u8],
        flags: XattrFlags,
    ) -> VfsResult<()>;
    fn removexattr(&self, target: Target<'_, Self::File>, name: &str) -> VfsResult<()>;
}

/// Several shares may export one backend.
impl<T: Backend> Backend for Arc<T> {
    type File = T::File;

    fn create(&self, path: &Path, mode: u32) -> VfsResult<()> {
        (**self).create(path, mode)
    }
    fn mkdir(&self, path: &Path, mode: u32) -> VfsResult<()> {
        (**self).mkdir(path, mode)
    }
    fn rmdir(&self, path: &Path) -> VfsResult<()> {
        (**self).rmdir(path)
    }
    fn unlink(&self, path: &Path) -> VfsResult<()> {
        (**self).unlink(path)
    }
    fn rename(&self, from: &Path, to: &Path) -> VfsResult<()> {
        (**self).rename(from, to)
    }
    fn link(&self, existing: &Path, new: &Path) -> VfsResult<()> {
        (**self).link(existing, new)
    }
    fn symlink(&self, target: &Path, link: &Path) -> VfsResult<()> {
        (**self).symlink(target, link)
    }
    fn readlink(&self, path: &Path) -> VfsResult<PathBuf> {
        (**self).readlink(path)
    }
    fn lookup(&self, path: &Path) -> VfsResult<Attributes> {
        (**self).lookup(path)
    }
    fn open(&self, path: &Path, mode: OpenMode) -> VfsResult<Self::File> {
        (**self).open(path, mode)
    }
    fn getattr(&self, file: &Self::File) -> VfsResult<Attributes> {
        (**self).getattr(file)
    }
    fn read(&self, file: &Self::File, buf: &mut [u8], offset: u64) -> VfsResult<usize> {
        (**self).read(file, buf, offset)
    }
    fn write(&self, file: &Self::File, data: &[u8], offset: u64) -> VfsResult<usize> {
        (**self).write(file, data, offset)
    }
    fn fsync(&self, file: &Self::File) -> VfsResult<()> {
        (**self).fsync(file)
    }
    fn fsync_range(&self, file: &Self::File, offset: u64, len: u64) -> VfsResult<()> {
        (**self).fsync_range(file, offset, len)
    }
    fn allocate(&self, file: &Self::File, len: u64) -> VfsResult<()> {
        (**self).allocate(file, len)
    }
    fn read_dir(&self, file: &Self::File) -> VfsResult<Vec<DirEntry>> {
        (**self).read_dir(file)
    }
    fn path_of(&self, file: &Self::File) -> VfsResult<PathBuf> {
        (**self).path_of(file)
    }
    fn truncate(&self, target: Target<'_, Self::File>, size: u64) -> VfsResult<()> {
        (**self).truncate(target, size)
    }
    fn setattr(&self, target: Target<'_, Self::File>, changes: &AttrChangeSet) -> VfsResult<()> {
        (**self).setattr(target, changes)
    }
    fn sync_metadata(&self, target: Target<'_, Self::File>) -> VfsResult<()> {
        (**self).sync_metadata(target)
    }
    fn listxattr(&self, target: Target<'_, Self::File>, capacity: usize) -> VfsResult<Vec<u8>> {
        (**self).listxattr(target, capacity)
    }
    fn xattr_len(&self, target: Target<'_, Self::File>, name: &str) -> VfsResult<usize> {
        (**self).xattr_len(target, name)
    }
    fn getxattr(
        &self,
        target: Target<'_, Self::File>,
        name: &str,
        capacity: usize,
    ) -> VfsResult<Vec<u8>> {
        (**self).getxattr(target, name, capacity)
    }
    fn setxattr(
        &self,
        target: Target<'_, Self::File>,
        name: &str,
        value: &[u8],
        flags: XattrFlags,
    ) -> VfsResult<()> {
        (**self).setxattr(target, name, value, flags)
    }
    fn removexattr(&self, target: Target<'_, Self::File>, name: &str) -> VfsResult<()> {
        (**self).removexattr(target, name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_from_mode() {
        assert_eq!(FileKind::from_mode(S_IFREG | 0o644), FileKind::Regular);
        assert_eq!(FileKind::from_mode(S_IFDIR | 0o755), FileKind::Directory);
        assert_eq!(FileKind::from_mode(S_IFLNK | 0o777), FileKind::Symlink);
        assert_eq!(FileKind::from_mode(0o010_000), FileKind::Other);
    }
}
