//! Attribute change sets and the setattr path.

use std::time::SystemTime;

use tracing::debug;

use crate::backend::{Attributes, Backend, FileKind, S_IFMT};
use crate::error::{VfsError, VfsResult};
use crate::locks::{ByteRange, LockKind};
use crate::vfs::{FileRef, ShareVfs};

pub const S_ISUID: u32 = 0o4000;
pub const S_ISGID: u32 = 0o2000;
pub const S_IXGRP: u32 = 0o0010;
/// Permission and special bits a client may change.
pub const MODE_MASK: u32 = 0o7777;

/// New value for a timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetTime {
    Now,
    At(SystemTime),
}

/// Sparse set of attribute changes. Absent fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttrChangeSet {
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub size: Option<u64>,
    pub atime: Option<SetTime>,
    pub mtime: Option<SetTime>,
    /// Clear S_ISUID after applying ownership.
    pub kill_suid: bool,
    /// Clear S_ISGID after applying ownership, if group-execute is set.
    pub kill_sgid: bool,
}

impl AttrChangeSet {
    pub fn is_empty(&self) -> bool {
        self.mode.is_none()
            && self.uid.is_none()
            && self.gid.is_none()
            && self.size.is_none()
            && self.atime.is_none()
            && self.mtime.is_none()
            && !self.kill_suid
            && !self.kill_sgid
    }

    /// Full mode the object ends up with, given its current full mode.
    pub fn resulting_mode(&self, current: u32) -> u32 {
        let mut mode = match self.mode {
            Some(m) => (current & S_IFMT) | (m & MODE_MASK),
            None => current,
        };
        if self.kill_suid {
            mode &= !S_ISUID;
        }
        if self.kill_sgid && mode & S_IXGRP != 0 {
            mode &= !S_ISGID;
        }
        mode
    }

    fn changes_owner(&self, current: &Attributes) -> bool {
        self.uid.is_some_and(|u| u != current.uid) || self.gid.is_some_and(|g| g != current.gid)
    }
}

/// Normalize a requested change set against the object's current metadata.
///
/// The returned set never alters file-type bits, never carries a mode for a
/// symlink, and revokes set-id bits when a non-directory changes owner.
pub fn sanitize(current: &Attributes, requested: &AttrChangeSet) -> AttrChangeSet {
    let mut changes = requested.clone();

    if current.kind == FileKind::Symlink {
        changes.mode = None;
    }
    if let Some(mode) = changes.mode {
        changes.mode = Some((current.mode & S_IFMT) | (mode & MODE_MASK));
    }

    if current.kind != FileKind::Directory && changes.changes_owner(current) {
        match changes.mode.as_mut() {
            Some(mode) => {
                *mode &= !S_ISUID;
                if *mode & S_IXGRP != 0 {
                    *mode &= !S_ISGID;
                }
            }
            None => {
                changes.kill_suid = true;
                changes.kill_sgid = true;
            }
        }
    }

    changes
}

impl<B: Backend> ShareVfs<B> {
    /// Apply attribute changes to a path or an open handle.
    ///
    /// Either every sanitized field is applied or none is: validation and the
    /// truncate lock probe run before the backend sees the change set.
    pub fn setattr(&self, target: FileRef<'_>, requested: &AttrChangeSet) -> VfsResult<()> {
        self.ensure_writable()?;
        let resolved = self.resolve_ref(target)?;
        let current = self.attrs_of(&resolved)?;

        let changes = sanitize(&current, requested);
        if changes.is_empty() {
            debug!("setattr {}: nothing to change", resolved.label());
            return Ok(());
        }

        if let Some(size) = changes.size {
            match current.kind {
                FileKind::Regular => {}
                FileKind::Directory => return Err(VfsError::IsDirectory(resolved.label())),
                _ => return Err(VfsError::InvalidOperation(resolved.label())),
            }
            let (low, high) = if size < current.size {
                (size, current.size)
            } else {
                (current.size, size)
            };
            if let Some(range) = ByteRange::from_offset_len(low, high - low)? {
                self.locks
                    .check(current.node, range, LockKind::Write, resolved.owner())?;
            }
        }

        self.backend.setattr(resolved.target(), &changes)?;
        self.backend.sync_metadata(resolved.target())?;
        debug!("setattr {}: {:?}", resolved.label(), changes);
        Ok(())
    }
}
