//! The share facade the protocol layer calls into.
//!
//! `ShareVfs` owns the lock table, the lease trigger and the directory locks
//! for one exported share, and borrows open handles from an external
//! [`HandleTable`]. Read/write/truncate live in `io.rs`, rename in
//! `rename.rs` and setattr in `attr.rs`; everything else is here.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use smbvfs_core::config::{GlobalSettings, ShareSettings};
use smbvfs_core::paths::{self, split_parent_leaf, to_share_path};
use tracing::{debug, error, info, warn};

use crate::backend::{Attributes, Backend, DirEntry, FileKind, OpenMode, Target, XattrFlags};
use crate::error::{VfsError, VfsResult};
use crate::handle::{HandleTable, IoHints, OpenHandle, OpenedFile, SessionId};
use crate::lease::{LeaseBreaker, LeaseTable};
use crate::locks::{ByteRange, LockCommand, LockOutcome, LockOwner, LockTable};
use crate::rename::DirLocks;

/// Prefix of attributes a client may create and remove freely.
pub const USER_XATTR_PREFIX: &str = "user.";

/// Per-share behaviour switches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VfsOptions {
    /// Break leases before handle truncates. When off, a handle truncate
    /// probes the byte-range locks instead.
    pub leases_enabled: bool,
    /// Largest attribute name list returned by `listxattr`.
    pub xattr_list_max: usize,
    pub read_only: bool,
}

impl Default for VfsOptions {
    fn default() -> Self {
        Self::from_settings(&GlobalSettings::default(), None)
    }
}

impl VfsOptions {
    pub fn from_settings(global: &GlobalSettings, share: Option<&ShareSettings>) -> Self {
        VfsOptions {
            leases_enabled: global.oplocks,
            xattr_list_max: global.xattr_list_max,
            read_only: share.is_some_and(|s| s.read_only),
        }
    }
}

/// Object an operation addresses: a client-supplied name or an open handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileRef<'a> {
    Path(&'a str),
    Handle(SessionId, u64),
}

/// A [`FileRef`] after name normalization or handle lookup.
pub(crate) enum Resolved<F> {
    Path(PathBuf),
    Handle(Arc<OpenHandle<F>>),
}

impl<F> Resolved<F> {
    pub(crate) fn target(&self) -> Target<'_, F> {
        match self {
            Resolved::Path(path) => Target::Path(path),
            Resolved::Handle(handle) => Target::File(handle.file()),
        }
    }

    pub(crate) fn owner(&self) -> Option<LockOwner> {
        match self {
            Resolved::Path(_) => None,
            Resolved::Handle(handle) => Some(handle.owner()),
        }
    }

    pub(crate) fn label(&self) -> String {
        match self {
            Resolved::Path(path) => paths::display(path),
            Resolved::Handle(handle) => {
                format!("{} (fid {})", paths::display(&handle.path()), handle.fid())
            }
        }
    }
}

pub struct ShareVfs<B: Backend> {
    pub(crate) backend: B,
    pub(crate) handles: Arc<dyn HandleTable<B::File>>,
    pub(crate) locks: LockTable,
    pub(crate) leases: LeaseTable,
    pub(crate) dir_locks: DirLocks,
    pub(crate) options: VfsOptions,
}

impl<B: Backend> ShareVfs<B> {
    pub fn new(
        backend: B,
        handles: Arc<dyn HandleTable<B::File>>,
        breaker: Arc<dyn LeaseBreaker>,
        options: VfsOptions,
    ) -> Self {
        ShareVfs {
            backend,
            handles,
            locks: LockTable::new(),
            leases: LeaseTable::new(breaker, options.leases_enabled),
            dir_locks: DirLocks::new(),
            options,
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn options(&self) -> &VfsOptions {
        &self.options
    }

    pub fn lock_table(&self) -> &LockTable {
        &self.locks
    }

    /// Look up an open handle. Unknown or stale ids are `NotFound`.
    pub fn resolve(&self, session: SessionId, fid: u64) -> VfsResult<Arc<OpenHandle<B::File>>> {
        self.handles.lookup(session, fid).ok_or_else(|| {
            VfsError::NotFound(format!("no open file {fid} in session {}", session.0))
        })
    }

    pub(crate) fn resolve_ref(&self, target: FileRef<'_>) -> VfsResult<Resolved<B::File>> {
        match target {
            FileRef::Path(name) => Ok(Resolved::Path(share_path(name)?)),
            FileRef::Handle(session, fid) => Ok(Resolved::Handle(self.resolve(session, fid)?)),
        }
    }

    pub(crate) fn attrs_of(&self, resolved: &Resolved<B::File>) -> VfsResult<Attributes> {
        match resolved {
            Resolved::Path(path) => self.backend.lookup(path),
            Resolved::Handle(handle) => self.backend.getattr(handle.file()),
        }
    }

    pub(crate) fn ensure_writable(&self) -> VfsResult<()> {
        if self.options.read_only {
            return Err(VfsError::PermissionDenied("share is read-only".into()));
        }
        Ok(())
    }

    pub fn create(&self, name: &str, mode: u32) -> VfsResult<()> {
        self.ensure_writable()?;
        let (dir, leaf) = split_name(name)?;
        let path = dir.join(&leaf);
        let _guard = self.dir_locks.lock_one(&dir);
        self.backend.create(&path, mode).inspect_err(|e| {
            if !matches!(e, VfsError::Exists(_)) {
                error!("Failed to create {}: {}", paths::display(&path), e);
            }
        })?;
        debug!("Created file {}", paths::display(&path));
        Ok(())
    }

    pub fn mkdir(&self, name: &str, mode: u32) -> VfsResult<()> {
        self.ensure_writable()?;
        let (dir, leaf) = split_name(name)?;
        let path = dir.join(&leaf);
        let _guard = self.dir_locks.lock_one(&dir);
        self.backend.mkdir(&path, mode).inspect_err(|e| {
            if !matches!(e, VfsError::Exists(_)) {
                error!("Failed to create directory {}: {}", paths::display(&path), e);
            }
        })?;
        debug!("Created directory {}", paths::display(&path));
        Ok(())
    }

    pub fn rmdir(&self, name: &str) -> VfsResult<()> {
        self.ensure_writable()?;
        let (dir, leaf) = split_name(name)?;
        let path = dir.join(&leaf);
        let _guard = self.dir_locks.lock_one(&dir);
        match self.backend.rmdir(&path) {
            Ok(()) => {
                info!("Removed directory {}", paths::display(&path));
                Ok(())
            }
            // Clients probe with rmdir before emptying a tree.
            Err(e @ VfsError::NotEmpty(_)) => {
                debug!("rmdir {}: {}", paths::display(&path), e);
                Err(e)
            }
            Err(e) => {
                error!("Failed to remove directory {}: {}", paths::display(&path), e);
                Err(e)
            }
        }
    }

    pub fn unlink(&self, name: &str) -> VfsResult<()> {
        self.ensure_writable()?;
        let (dir, leaf) = split_name(name)?;
        let path = dir.join(&leaf);
        let _guard = self.dir_locks.lock_one(&dir);
        if self.backend.lookup(&path)?.is_dir() {
            return Err(VfsError::IsDirectory(paths::display(&path)));
        }
        match self.backend.unlink(&path) {
            Ok(()) => {
                info!("Removed {}", paths::display(&path));
                Ok(())
            }
            Err(VfsError::NotFound(_)) => {
                debug!("{} already removed", paths::display(&path));
                Ok(())
            }
            Err(e) => {
                error!("Failed to remove {}: {}", paths::display(&path), e);
                Err(e)
            }
        }
    }

    /// Remove a file or an empty directory, whichever the name refers to.
    pub fn remove_file(&self, name: &str) -> VfsResult<()> {
        let path = share_path(name)?;
        if self.backend.lookup(&path)?.is_dir() {
            self.rmdir(name)
        } else {
            self.unlink(name)
        }
    }

    /// Hard link `new` to the existing object `old`.
    pub fn link(&self, old: &str, new: &str) -> VfsResult<()> {
        self.ensure_writable()?;
        let existing = share_path(old)?;
        let (dir, leaf) = split_name(new)?;
        let path = dir.join(&leaf);
        if self.backend.lookup(&existing)?.is_dir() {
            return Err(VfsError::PermissionDenied(format!(
                "cannot hard link directory {}",
                paths::display(&existing)
            )));
        }
        let _guard = self.dir_locks.lock_one(&dir);
        self.backend.link(&existing, &path)?;
        debug!(
            "Linked {} -> {}",
            paths::display(&path),
            paths::display(&existing)
        );
        Ok(())
    }

    /// Create a symlink `linkname` whose content is `target`, stored verbatim.
    pub fn symlink(&self, target: &str, linkname: &str) -> VfsResult<()> {
        self.ensure_writable()?;
        if target.is_empty() {
            return Err(VfsError::InvalidName("empty symlink target".into()));
        }
        let (dir, leaf) = split_name(linkname)?;
        let path = dir.join(&leaf);
        let _guard = self.dir_locks.lock_one(&dir);
        self.backend.symlink(Path::new(target), &path)?;
        debug!("Symlinked {} -> {}", paths::display(&path), target);
        Ok(())
    }

    pub fn readlink(&self, name: &str) -> VfsResult<String> {
        let path = share_path(name)?;
        if self.backend.lookup(&path)?.kind != FileKind::Symlink {
            return Err(VfsError::InvalidOperation(format!(
                "{} is not a symlink",
                paths::display(&path)
            )));
        }
        let target = self.backend.readlink(&path)?;
        Ok(target.to_string_lossy().into_owned())
    }

    /// Metadata of a name, without following a final symlink.
    pub fn stat(&self, name: &str) -> VfsResult<Attributes> {
        self.backend.lookup(&share_path(name)?)
    }

    pub fn getattr(&self, session: SessionId, fid: u64) -> VfsResult<Attributes> {
        let handle = self.resolve(session, fid)?;
        self.backend.getattr(handle.file())
    }

    pub fn fsync(&self, session: SessionId, fid: u64) -> VfsResult<()> {
        let handle = self.resolve(session, fid)?;
        self.backend.fsync(handle.file()).inspect_err(|e| {
            error!("fsync failed on {}: {}", paths::display(&handle.path()), e);
        })
    }

    pub fn readdir(&self, session: SessionId, fid: u64) -> VfsResult<Vec<DirEntry>> {
        let handle = self.resolve(session, fid)?;
        if !handle.is_dir() {
            return Err(VfsError::NotDirectory(paths::display(&handle.path())));
        }
        self.backend.read_dir(handle.file())
    }

    /// Open a name. The caller binds the result to a file id in its handle
    /// table.
    pub fn open(&self, name: &str, mode: OpenMode) -> VfsResult<OpenedFile<B::File>> {
        if mode.write {
            self.ensure_writable()?;
        }
        let path = share_path(name)?;
        let file = self.backend.open(&path, mode)?;
        let attrs = self.backend.getattr(&file)?;
        debug!("Opened {} ({:?})", paths::display(&path), mode);
        Ok(OpenedFile { file, attrs, path })
    }

    /// Release what a handle holds in this share. The caller has already
    /// removed it from its handle table.
    pub fn close(&self, handle: Arc<OpenHandle<B::File>>) {
        let released = self.locks.release_owner(handle.owner());
        if released > 0 {
            debug!(
                "Released {} byte-range locks of {}",
                released,
                paths::display(&handle.path())
            );
        }
    }

    /// Apply caching hints from SMB2 CreateOptions to an open handle.
    pub fn set_io_hints(&self, session: SessionId, fid: u64, create_options: u32) -> VfsResult<IoHints> {
        let handle = self.resolve(session, fid)?;
        let hints = handle.hints().with_create_options(create_options);
        handle.set_hints(hints);
        Ok(hints)
    }

    /// Byte-range lock request on an open handle. Zero-length ranges lock
    /// nothing and never conflict.
    pub fn lock(
        &self,
        session: SessionId,
        fid: u64,
        cmd: LockCommand,
        offset: u64,
        len: u64,
    ) -> VfsResult<LockOutcome> {
        let handle = self.resolve(session, fid)?;
        let Some(range) = ByteRange::from_offset_len(offset, len)? else {
            return Ok(match cmd {
                LockCommand::Set { .. } => LockOutcome::Granted,
                LockCommand::Unlock => LockOutcome::Released,
                LockCommand::Test(_) => LockOutcome::Free,
            });
        };
        let (node, owner) = (handle.node(), handle.owner());
        match cmd {
            LockCommand::Set { kind, wait: false } => {
                self.locks.set(node, owner, kind, range)?;
                Ok(LockOutcome::Granted)
            }
            LockCommand::Set { kind, wait: true } => {
                self.locks.set_wait(node, owner, kind, range);
                Ok(LockOutcome::Granted)
            }
            LockCommand::Unlock => {
                self.locks.unlock(node, owner, range);
                Ok(LockOutcome::Released)
            }
            LockCommand::Test(kind) => Ok(match self.locks.test(node, owner, kind, range) {
                Some(record) => LockOutcome::Blocked(record),
                None => LockOutcome::Free,
            }),
        }
    }

    /// Names of the extended attributes of an object.
    pub fn listxattr(&self, target: FileRef<'_>) -> VfsResult<Vec<String>> {
        let resolved = self.resolve_ref(target)?;
        let raw = self
            .backend
            .listxattr(resolved.target(), self.options.xattr_list_max)
            .inspect_err(|e| {
                if matches!(e, VfsError::RangeTooLarge(_)) {
                    warn!("Attribute list of {} exceeds limit", resolved.label());
                }
            })?;
        Ok(raw
            .split(|b| *b == 0)
            .filter(|name| !name.is_empty())
            .map(|name| String::from_utf8_lossy(name).into_owned())
            .collect())
    }

    /// Value of one attribute. A value longer than `capacity` is an error,
    /// never a truncated result.
    pub fn getxattr(&self, target: FileRef<'_>, name: &str, capacity: usize) -> VfsResult<Vec<u8>> {
        let resolved = self.resolve_ref(target)?;
        let len = self.backend.xattr_len(resolved.target(), name)?;
        if len > capacity {
            return Err(VfsError::BufferTooSmall {
                needed: len,
                capacity,
            });
        }
        self.backend.getxattr(resolved.target(), name, len)
    }

    pub fn setxattr(
        &self,
        target: FileRef<'_>,
        name: &str,
        value: &[u8],
        flags: XattrFlags,
    ) -> VfsResult<()> {
        self.ensure_writable()?;
        let resolved = self.resolve_ref(target)?;
        self.backend
            .setxattr(resolved.target(), name, value, flags)
            .inspect_err(|e| debug!("setxattr {} on {}: {}", name, resolved.label(), e))
    }

    pub fn removexattr(&self, target: FileRef<'_>, name: &str) -> VfsResult<()> {
        self.ensure_writable()?;
        let resolved = self.resolve_ref(target)?;
        self.backend.removexattr(resolved.target(), name)
    }

    /// Remove every `user.` attribute. Returns how many were removed.
    pub fn truncate_xattrs(&self, target: FileRef<'_>) -> VfsResult<usize> {
        self.ensure_writable()?;
        let names = self.listxattr(target)?;
        let resolved = self.resolve_ref(target)?;
        let mut removed = 0;
        for name in names.iter().filter(|n| n.starts_with(USER_XATTR_PREFIX)) {
            match self.backend.removexattr(resolved.target(), name) {
                Ok(()) => removed += 1,
                Err(VfsError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(removed)
    }
}

impl<B: Backend + std::fmt::Debug> std::fmt::Debug for ShareVfs<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShareVfs")
            .field("backend", &self.backend)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

fn share_path(name: &str) -> VfsResult<PathBuf> {
    to_share_path(name).ok_or_else(|| VfsError::InvalidName(name.to_string()))
}

fn split_name(name: &str) -> VfsResult<(PathBuf, String)> {
    split_parent_leaf(name).ok_or_else(|| VfsError::InvalidName(name.to_string()))
}
