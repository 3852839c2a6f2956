//! Passthrough backend over a host directory.
//!
//! Share paths are joined onto the export root. A final symlink is never
//! followed: path operations use the `l*` syscalls or `O_NOFOLLOW`, and open
//! files use the `f*` syscalls on their descriptor.

#![allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]

use std::ffi::CString;
use std::fs::{self, DirBuilder, File, OpenOptions, Permissions};
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{DirBuilderExt, FileExt, MetadataExt, OpenOptionsExt, PermissionsExt};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::debug;

use super::{Attributes, Backend, DirEntry, FileKind, NodeId, OpenMode, Target, XattrFlags};
use crate::attr::{AttrChangeSet, SetTime, MODE_MASK};
use crate::error::{VfsError, VfsResult};

/// Backend rooted at a host directory.
#[derive(Debug, Clone)]
pub struct LocalBackend {
    root: PathBuf,
}

/// Open host file plus the share path it was opened under.
#[derive(Debug)]
pub struct LocalFile {
    file: File,
    path: PathBuf,
}

impl LocalFile {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Where a raw syscall should be aimed.
enum Raw {
    Path(CString),
    Fd(libc::c_int),
}

fn cstring(bytes: &[u8]) -> VfsResult<CString> {
    CString::new(bytes).map_err(|_| VfsError::InvalidName("embedded NUL".into()))
}

fn check(ret: libc::ssize_t) -> VfsResult<usize> {
    if ret < 0 {
        Err(io::Error::last_os_error().into())
    } else {
        Ok(ret as usize)
    }
}

fn check_unit(ret: libc::c_int) -> VfsResult<()> {
    if ret < 0 {
        Err(io::Error::last_os_error().into())
    } else {
        Ok(())
    }
}

fn system_time(secs: i64, nsec: i64) -> SystemTime {
    if secs >= 0 {
        UNIX_EPOCH + Duration::new(secs as u64, nsec.clamp(0, 999_999_999) as u32)
    } else {
        UNIX_EPOCH
            .checked_sub(Duration::from_secs(secs.unsigned_abs()))
            .unwrap_or(UNIX_EPOCH)
    }
}

fn timespec(time: Option<SetTime>) -> libc::timespec {
    match time {
        None => libc::timespec {
            tv_sec: 0,
            tv_nsec: libc::UTIME_OMIT,
        },
        Some(SetTime::Now) => libc::timespec {
            tv_sec: 0,
            tv_nsec: libc::UTIME_NOW,
        },
        Some(SetTime::At(t)) => {
            let d = t.duration_since(UNIX_EPOCH).unwrap_or_default();
            libc::timespec {
                tv_sec: d.as_secs() as libc::time_t,
                tv_nsec: libc::c_long::from(d.subsec_nanos() as i32),
            }
        }
    }
}

fn attributes(meta: &fs::Metadata) -> Attributes {
    Attributes {
        node: NodeId {
            dev: meta.dev(),
            ino: meta.ino(),
        },
        kind: FileKind::from_mode(meta.mode()),
        mode: meta.mode(),
        uid: meta.uid(),
        gid: meta.gid(),
        size: meta.size(),
        nlink: meta.nlink(),
        atime: system_time(meta.atime(), meta.atime_nsec()),
        mtime: system_time(meta.mtime(), meta.mtime_nsec()),
        ctime: system_time(meta.ctime(), meta.ctime_nsec()),
    }
}

fn kind_of(file_type: fs::FileType) -> FileKind {
    if file_type.is_dir() {
        FileKind::Directory
    } else if file_type.is_symlink() {
        FileKind::Symlink
    } else if file_type.is_file() {
        FileKind::Regular
    } else {
        FileKind::Other
    }
}

/// Refuse ownership changes the host would reject, before any other field
/// of the change set is applied. Only root may give a file away; only root or
/// the owner may change its group. Group membership is left to the host.
fn check_chown(euid: u32, current: &Attributes, changes: &AttrChangeSet) -> VfsResult<()> {
    if euid == 0 {
        return Ok(());
    }
    let uid_change = changes.uid.is_some_and(|uid| uid != current.uid);
    let gid_change = changes.gid.is_some_and(|gid| gid != current.gid);
    if uid_change || (gid_change && euid != current.uid) {
        return Err(VfsError::PermissionDenied(format!(
            "cannot change owner of inode {} to {:?}:{:?}",
            current.node.ino, changes.uid, changes.gid
        )));
    }
    Ok(())
}

impl LocalBackend {
    pub fn new(root: impl Into<PathBuf>) -> VfsResult<Self> {
        let root = root.into();
        let meta = fs::metadata(&root)?;
        if !meta.is_dir() {
            return Err(VfsError::NotDirectory(root.display().to_string()));
        }
        Ok(LocalBackend { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn host(&self, path: &Path) -> PathBuf {
        self.root.join(path)
    }

    /// The descriptor as seen through procfs. Opening it reaches the same
    /// object no matter where it has moved since.
    fn fd_path(file: &LocalFile) -> PathBuf {
        PathBuf::from(format!("/proc/self/fd/{}", file.file.as_raw_fd()))
    }

    fn raw(&self, target: Target<'_, LocalFile>) -> VfsResult<Raw> {
        Ok(match target {
            Target::Path(path) => Raw::Path(cstring(self.host(path).as_os_str().as_bytes())?),
            Target::File(file) => Raw::Fd(file.file.as_raw_fd()),
        })
    }

    fn stat(&self, target: Target<'_, LocalFile>) -> VfsResult<Attributes> {
        match target {
            Target::Path(path) => self.lookup(path),
            Target::File(file) => self.getattr(file),
        }
    }

    fn set_times(&self, target: Target<'_, LocalFile>, changes: &AttrChangeSet) -> VfsResult<()> {
        let times = [timespec(changes.atime), timespec(changes.mtime)];
        let ret = match self.raw(target)? {
            // SAFETY: `c` is a valid NUL-terminated path and `times` has two entries.
            Raw::Path(c) => unsafe {
                libc::utimensat(
                    libc::AT_FDCWD,
                    c.as_ptr(),
                    times.as_ptr(),
                    libc::AT_SYMLINK_NOFOLLOW,
                )
            },
            // SAFETY: `fd` is open for the lifetime of the borrowed file.
            Raw::Fd(fd) => unsafe { libc::futimens(fd, times.as_ptr()) },
        };
        check_unit(ret)
    }
}

impl Backend for LocalBackend {
    type File = LocalFile;

    fn create(&self, path: &Path, mode: u32) -> VfsResult<()> {
        OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(mode & MODE_MASK)
            .custom_flags(libc::O_NOFOLLOW)
            .open(self.host(path))?;
        Ok(())
    }

    fn mkdir(&self, path: &Path, mode: u32) -> VfsResult<()> {
        DirBuilder::new()
            .mode(mode & MODE_MASK)
            .create(self.host(path))?;
        Ok(())
    }

    fn rmdir(&self, path: &Path) -> VfsResult<()> {
        fs::remove_dir(self.host(path))?;
        Ok(())
    }

    fn unlink(&self, path: &Path) -> VfsResult<()> {
        fs::remove_file(self.host(path))?;
        Ok(())
    }

    fn rename(&self, from: &Path, to: &Path) -> VfsResult<()> {
        fs::rename(self.host(from), self.host(to))?;
        Ok(())
    }

    fn link(&self, existing: &Path, new: &Path) -> VfsResult<()> {
        fs::hard_link(self.host(existing), self.host(new))?;
        Ok(())
    }

    fn symlink(&self, target: &Path, link: &Path) -> VfsResult<()> {
        std::os::unix::fs::symlink(target, self.host(link))?;
        Ok(())
    }

    fn readlink(&self, path: &Path) -> VfsResult<PathBuf> {
        Ok(fs::read_link(self.host(path))?)
    }

    fn lookup(&self, path: &Path) -> VfsResult<Attributes> {
        Ok(attributes(&fs::symlink_metadata(self.host(path))?))
    }

    fn open(&self, path: &Path, mode: OpenMode) -> VfsResult<LocalFile> {
        let file = OpenOptions::new()
            .read(mode.read || !mode.write)
            .write(mode.write)
            .custom_flags(libc::O_NOFOLLOW)
            .open(self.host(path))?;
        Ok(LocalFile {
            file,
            path: path.to_path_buf(),
        })
    }

    fn getattr(&self, file: &LocalFile) -> VfsResult<Attributes> {
        Ok(attributes(&file.file.metadata()?))
    }

    fn read(&self, file: &LocalFile, buf: &mut [u8], offset: u64) -> VfsResult<usize> {
        let mut total = 0;
        while total < buf.len() {
            match file.file.read_at(&mut buf[total..], offset + total as u64) {
                Ok(0) => break,
                Ok(n) => total += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(total)
    }

    fn write(&self, file: &LocalFile, data: &[u8], offset: u64) -> VfsResult<usize> {
        file.file.write_all_at(data, offset)?;
        Ok(data.len())
    }

    fn fsync(&self, file: &LocalFile) -> VfsResult<()> {
        file.file.sync_all()?;
        Ok(())
    }

    fn fsync_range(&self, file: &LocalFile, offset: u64, len: u64) -> VfsResult<()> {
        // Linux has no durable ranged flush; fdatasync covers the range.
        debug!(
            "fdatasync {} for [{}, +{})",
            file.path.display(),
            offset,
            len
        );
        file.file.sync_data()?;
        Ok(())
    }

    fn allocate(&self, file: &LocalFile, len: u64) -> VfsResult<()> {
        let len = libc::off_t::try_from(len)
            .map_err(|_| VfsError::RangeTooLarge(format!("allocation of {len} bytes")))?;
        // SAFETY: the descriptor is owned by `file`.
        let ret =
            unsafe { libc::fallocate(file.file.as_raw_fd(), libc::FALLOC_FL_KEEP_SIZE, 0, len) };
        check_unit(ret)
    }

    fn read_dir(&self, file: &LocalFile) -> VfsResult<Vec<DirEntry>> {
        use std::os::unix::fs::DirEntryExt;

        let mut entries = Vec::new();
        for entry in fs::read_dir(Self::fd_path(file))? {
            let entry = entry?;
            entries.push(DirEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                ino: entry.ino(),
                kind: kind_of(entry.file_type()?),
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    fn path_of(&self, file: &LocalFile) -> VfsResult<PathBuf> {
        let host = fs::read_link(Self::fd_path(file))?;
        let gone = || {
            VfsError::NotFound(format!("{} is no longer in the share", file.path.display()))
        };
        let bytes = host.as_os_str().as_bytes();
        if bytes.ends_with(b" (deleted)") {
            return Err(gone());
        }
        let root = fs::canonicalize(&self.root)?;
        host.strip_prefix(&root)
            .map(Path::to_path_buf)
            .map_err(|_| gone())
    }

    fn truncate(&self, target: Target<'_, LocalFile>, size: u64) -> VfsResult<()> {
        match target {
            Target::Path(path) => OpenOptions::new()
                .write(true)
                .custom_flags(libc::O_NOFOLLOW)
                .open(self.host(path))?
                .set_len(size)?,
            Target::File(file) => file.file.set_len(size)?,
        }
        Ok(())
    }

    /// Applies ownership, mode, size and times in that order. Ownership is
    /// checked against the server's credentials before anything changes, and
    /// the size is only touched once ownership and mode have been applied.
    /// The host offers no atomic setattr, so an I/O failure part way still
    /// leaves earlier steps applied.
    fn setattr(&self, target: Target<'_, LocalFile>, changes: &AttrChangeSet) -> VfsResult<()> {
        let before = self.stat(target)?;
        // SAFETY: geteuid has no preconditions and cannot fail.
        check_chown(unsafe { libc::geteuid() }, &before, changes)?;

        if changes.uid.is_some() || changes.gid.is_some() {
            match target {
                Target::Path(path) => {
                    std::os::unix::fs::lchown(self.host(path), changes.uid, changes.gid)?
                }
                Target::File(file) => std::os::unix::fs::fchown(&file.file, changes.uid, changes.gid)?,
            }
        }

        let current = self.stat(target)?;
        let mode = changes.resulting_mode(current.mode);
        if mode != current.mode && current.kind != FileKind::Symlink {
            let perms = Permissions::from_mode(mode & MODE_MASK);
            match target {
                Target::Path(path) => fs::set_permissions(self.host(path), perms)?,
                Target::File(file) => file.file.set_permissions(perms)?,
            }
        }

        if let Some(size) = changes.size {
            self.truncate(target, size)?;
        }

        if changes.atime.is_some() || changes.mtime.is_some() {
            self.set_times(target, changes)?;
        }
        Ok(())
    }

    fn sync_metadata(&self, target: Target<'_, LocalFile>) -> VfsResult<()> {
        match target {
            Target::Path(path) => {
                if self.lookup(path)?.kind == FileKind::Symlink {
                    return Ok(());
                }
                File::open(self.host(path))?.sync_all()?;
            }
            Target::File(file) => file.file.sync_all()?,
        }
        Ok(())
    }

    fn listxattr(&self, target: Target<'_, LocalFile>, capacity: usize) -> VfsResult<Vec<u8>> {
        let raw = self.raw(target)?;
        let list = |buf: *mut libc::c_char, size: usize| -> VfsResult<usize> {
            // SAFETY: `buf` is null with size 0 or points at `size` writable bytes.
            check(unsafe {
                match &raw {
                    Raw::Path(c) => libc::llistxattr(c.as_ptr(), buf, size),
                    Raw::Fd(fd) => libc::flistxattr(*fd, buf, size),
                }
            })
        };

        let needed = list(std::ptr::null_mut(), 0)?;
        if needed > capacity {
            return Err(VfsError::RangeTooLarge(format!(
                "attribute list is {needed} bytes, limit {capacity}"
            )));
        }
        let mut buf = vec![0u8; needed];
        let n = list(buf.as_mut_ptr().cast(), buf.len())?;
        buf.truncate(n);
        Ok(buf)
    }

    fn xattr_len(&self, target: Target<'_, LocalFile>, name: &str) -> VfsResult<usize> {
        let raw = self.raw(target)?;
        let name = cstring(name.as_bytes())?;
        // SAFETY: a null buffer with size 0 only queries the length.
        check(unsafe {
            match &raw {
                Raw::Path(c) => libc::lgetxattr(c.as_ptr(), name.as_ptr(), std::ptr::null_mut(), 0),
                Raw::Fd(fd) => libc::fgetxattr(*fd, name.as_ptr(), std::ptr::null_mut(), 0),
            }
        })
    }

    fn getxattr(
        &self,
        target: Target<'_, LocalFile>,
        name: &str,
        capacity: usize,
    ) -> VfsResult<Vec<u8>> {
        let raw = self.raw(target)?;
        let cname = cstring(name.as_bytes())?;
        let mut buf = vec![0u8; capacity];
        let ptr: *mut libc::c_void = buf.as_mut_ptr().cast();
        // SAFETY: `buf` has `capacity` writable bytes.
        let n = check(unsafe {
            match &raw {
                Raw::Path(c) => libc::lgetxattr(c.as_ptr(), cname.as_ptr(), ptr, capacity),
                Raw::Fd(fd) => libc::fgetxattr(*fd, cname.as_ptr(), ptr, capacity),
            }
        })?;
        buf.truncate(n);
        Ok(buf)
    }

    fn setxattr(
        &self,
        target: Target<'_, LocalFile>,
        name: &str,
        value: &[u8],
        flags: XattrFlags,
    ) -> VfsResult<()> {
        let raw = self.raw(target)?;
        let cname = cstring(name.as_bytes())?;
        let ptr: *const libc::c_void = value.as_ptr().cast();
        let flags = flags.bits() as libc::c_int;
        // SAFETY: `value` is valid for `value.len()` bytes.
        check_unit(unsafe {
            match &raw {
                Raw::Path(c) => libc::lsetxattr(c.as_ptr(), cname.as_ptr(), ptr, value.len(), flags),
                Raw::Fd(fd) => libc::fsetxattr(*fd, cname.as_ptr(), ptr, value.len(), flags),
            }
        })
    }

    fn removexattr(&self, target: Target<'_, LocalFile>, name: &str) -> VfsResult<()> {
        let raw = self.raw(target)?;
        let cname = cstring(name.as_bytes())?;
        // SAFETY: both strings are NUL-terminated.
        check_unit(unsafe {
            match &raw {
                Raw::Path(c) => libc::lremovexattr(c.as_ptr(), cname.as_ptr()),
                Raw::Fd(fd) => libc::fremovexattr(*fd, cname.as_ptr()),
            }
        })
    }
}
