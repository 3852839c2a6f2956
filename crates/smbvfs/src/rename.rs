//! Directory locking and rename.
//!
//! Directory locks are keyed by share path. Operations that change a single
//! directory (create, unlink, rmdir, same-directory rename) take that
//! directory's lock alone. A cross-directory rename first takes the share-wide
//! rename mutex and then both parent locks, ancestor first, so two renames
//! moving entries between the same directories in opposite directions cannot
//! deadlock.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::lock_api::ArcMutexGuard;
use parking_lot::{Mutex, RawMutex};
use smbvfs_core::paths::{self, child_toward, is_ancestor, split_parent_leaf, split_share_path};
use tracing::{debug, info};

use crate::backend::{Backend, FileKind, NodeId};
use crate::error::{VfsError, VfsResult};
use crate::handle::{OpenHandle, SessionId};
use crate::vfs::ShareVfs;

type DirGuard = ArcMutexGuard<RawMutex, ()>;

#[derive(Debug, Default)]
pub struct DirLocks {
    rename_mutex: Arc<Mutex<()>>,
    dirs: DashMap<PathBuf, Arc<Mutex<()>>>,
}

impl DirLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn dir_mutex(&self, dir: &Path) -> Arc<Mutex<()>> {
        self.dirs.entry(dir.to_path_buf()).or_default().clone()
    }

    /// Lock one directory whose entries are about to change.
    pub fn lock_one(&self, dir: &Path) -> DirLockGuard<'_> {
        let guard = self.dir_mutex(dir).lock_arc();
        DirLockGuard {
            locks: self,
            held: vec![(dir.to_path_buf(), guard)],
            rename: None,
            trap: None,
        }
    }

    /// Lock the parents of a rename's source and destination.
    ///
    /// When one parent is an ancestor of the other, the returned guard's trap
    /// is the ancestor's child on the path down to the other parent.
    pub fn lock_pair(&self, src_dir: &Path, dst_dir: &Path) -> DirLockGuard<'_> {
        if src_dir == dst_dir {
            return self.lock_one(src_dir);
        }

        let rename = self.rename_mutex.lock_arc();
        let (first, second, trap) = if is_ancestor(src_dir, dst_dir) {
            (src_dir, dst_dir, child_toward(src_dir, dst_dir))
        } else if is_ancestor(dst_dir, src_dir) {
            (dst_dir, src_dir, child_toward(dst_dir, src_dir))
        } else if src_dir < dst_dir {
            (src_dir, dst_dir, None)
        } else {
            (dst_dir, src_dir, None)
        };

        let first_guard = self.dir_mutex(first).lock_arc();
        let second_guard = self.dir_mutex(second).lock_arc();
        DirLockGuard {
            locks: self,
            held: vec![
                (first.to_path_buf(), first_guard),
                (second.to_path_buf(), second_guard),
            ],
            rename: Some(rename),
            trap,
        }
    }

    fn forget(&self, dir: &Path) {
        self.dirs
            .remove_if(dir, |_, mutex| Arc::strong_count(mutex) == 1);
    }

    #[cfg(test)]
    fn tracked(&self) -> usize {
        self.dirs.len()
    }
}

/// Held directory locks. Dropping releases them in reverse order of
/// acquisition, then the rename mutex.
pub struct DirLockGuard<'a> {
    locks: &'a DirLocks,
    held: Vec<(PathBuf, DirGuard)>,
    rename: Option<DirGuard>,
    trap: Option<PathBuf>,
}

impl DirLockGuard<'_> {
    pub fn trap(&self) -> Option<&Path> {
        self.trap.as_deref()
    }
}

impl Drop for DirLockGuard<'_> {
    fn drop(&mut self) {
        while let Some((dir, guard)) = self.held.pop() {
            drop(guard);
            self.locks.forget(&dir);
        }
        self.rename.take();
    }
}

impl<B: Backend> ShareVfs<B> {
    /// Rename `old` to `new`, replacing `new` if it exists.
    pub fn rename(&self, old: &str, new: &str) -> VfsResult<()> {
        self.ensure_writable()?;
        let (src_dir, src_leaf) =
            split_parent_leaf(old).ok_or_else(|| VfsError::InvalidName(old.to_string()))?;
        let (dst_dir, dst_leaf) =
            split_parent_leaf(new).ok_or_else(|| VfsError::InvalidName(new.to_string()))?;
        self.rename_locked(&src_dir, &src_leaf, &dst_dir, &dst_leaf, None)?;
        Ok(())
    }

    /// Rename the object behind an open handle to `new`.
    pub fn rename_by_id(&self, session: SessionId, fid: u64, new: &str) -> VfsResult<()> {
        self.ensure_writable()?;
        let handle = self.resolve(session, fid)?;
        let current = self.current_path(&handle)?;
        let (src_dir, src_leaf) = split_share_path(&current)
            .ok_or_else(|| VfsError::InvalidOperation("cannot rename the share root".into()))?;
        let (dst_dir, dst_leaf) =
            split_parent_leaf(new).ok_or_else(|| VfsError::InvalidName(new.to_string()))?;

        let renamed =
            self.rename_locked(&src_dir, &src_leaf, &dst_dir, &dst_leaf, Some(handle.node()))?;
        handle.set_path(&renamed);
        Ok(())
    }

    fn rename_locked(
        &self,
        src_dir: &Path,
        src_leaf: &str,
        dst_dir: &Path,
        dst_leaf: &str,
        expected: Option<NodeId>,
    ) -> VfsResult<PathBuf> {
        self.require_dir(src_dir)?;
        self.require_dir(dst_dir)?;

        let guard = self.dir_locks.lock_pair(src_dir, dst_dir);

        let src = src_dir.join(src_leaf);
        let src_attrs = self.backend.lookup(&src)?;
        if let Some(node) = expected {
            if src_attrs.node != node {
                return Err(VfsError::NotFound(format!(
                    "{} no longer refers to the open file",
                    paths::display(&src)
                )));
            }
        }
        if guard.trap() == Some(src.as_path()) {
            return Err(VfsError::InvalidOperation(format!(
                "cannot move {} into itself",
                paths::display(&src)
            )));
        }

        let dst = dst_dir.join(dst_leaf);
        if guard.trap() == Some(dst.as_path()) {
            return Err(VfsError::NotEmpty(format!(
                "{} is an ancestor of the source",
                paths::display(&dst)
            )));
        }
        match self.backend.lookup(&dst) {
            Ok(existing) if existing.node == src_attrs.node => {
                debug!("rename {} -> {}: same object", paths::display(&src), paths::display(&dst));
                return Ok(dst);
            }
            Ok(_) | Err(VfsError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }

        self.backend.rename(&src, &dst)?;
        info!("Renamed {} -> {}", paths::display(&src), paths::display(&dst));
        Ok(dst)
    }

    /// Where an open handle's object lives now. The cached name is kept while
    /// it still refers to the same node, so the hard link the client opened
    /// is the one that moves.
    fn current_path(&self, handle: &OpenHandle<B::File>) -> VfsResult<PathBuf> {
        let cached = handle.path();
        match self.backend.lookup(&cached) {
            Ok(attrs) if attrs.node == handle.node() => return Ok(cached),
            Ok(_) | Err(VfsError::NotFound(_)) | Err(VfsError::NotDirectory(_)) => {}
            Err(e) => return Err(e),
        }
        let moved = self.backend.path_of(handle.file())?;
        debug!(
            "fid {} moved from {} to {}",
            handle.fid(),
            paths::display(&cached),
            paths::display(&moved)
        );
        handle.set_path(&moved);
        Ok(moved)
    }

    pub(crate) fn require_dir(&self, dir: &Path) -> VfsResult<()> {
        let attrs = self.backend.lookup(dir)?;
        if attrs.kind != FileKind::Directory {
            return Err(VfsError::NotDirectory(paths::display(dir)));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::HandleTable;
    use crate::testutil::{memory_vfs, open_rw};

    #[test]
    fn test_same_dir_takes_no_rename_mutex() {
        let locks = DirLocks::new();
        let guard = locks.lock_pair(Path::new("a"), Path::new("a"));
        assert!(guard.trap().is_none());
        assert!(locks.rename_mutex.try_lock().is_some());
    }

    #[test]
    fn test_trap_is_child_of_ancestor() {
        let locks = DirLocks::new();
        let guard = locks.lock_pair(Path::new("a"), Path::new("a/b/c"));
        assert_eq!(guard.trap(), Some(Path::new("a/b")));
        drop(guard);

        let guard = locks.lock_pair(Path::new("x/y"), Path::new(""));
        assert_eq!(guard.trap(), Some(Path::new("x")));
    }

    #[test]
    fn test_unrelated_dirs_have_no_trap() {
        let locks = DirLocks::new();
        let guard = locks.lock_pair(Path::new("b"), Path::new("a"));
        assert!(guard.trap().is_none());
    }

    #[test]
    fn test_guard_releases_everything() {
        let locks = DirLocks::new();
        {
            let _guard = locks.lock_pair(Path::new("a"), Path::new("b"));
            assert_eq!(locks.tracked(), 2);
            assert!(locks.rename_mutex.try_lock().is_none());
        }
        assert_eq!(locks.tracked(), 0);
        assert!(locks.rename_mutex.try_lock().is_some());
    }

    #[test]
    fn test_rename_file() {
        let (vfs, _, _) = memory_vfs();
        vfs.mkdir("a", 0o755).unwrap();
        vfs.create("a/f", 0o644).unwrap();
        vfs.rename("\\a\\f", "\\g").unwrap();
        assert!(vfs.stat("g").is_ok());
        assert!(matches!(vfs.stat("a/f"), Err(VfsError::NotFound(_))));
    }

    #[test]
    fn test_rename_rejects_empty_leaf() {
        let (vfs, backend, _) = memory_vfs();
        vfs.create("f", 0o644).unwrap();
        assert!(matches!(
            vfs.rename("f", "dir\\"),
            Err(VfsError::InvalidName(_))
        ));
        assert_eq!(backend.op_count("rename"), 0);
    }

    #[test]
    fn test_rename_missing_source() {
        let (vfs, _, _) = memory_vfs();
        assert!(matches!(
            vfs.rename("nope", "other"),
            Err(VfsError::NotFound(_))
        ));
    }

    #[test]
    fn test_rename_into_own_descendant_fails() {
        let (vfs, backend, _) = memory_vfs();
        vfs.mkdir("a", 0o755).unwrap();
        vfs.mkdir("a/b", 0o755).unwrap();
        vfs.mkdir("a/b/c", 0o755).unwrap();

        for dst in ["a/b/c/a", "a/b/a", "a/a"] {
            let err = vfs.rename("a", dst).unwrap_err();
            assert!(matches!(err, VfsError::InvalidOperation(_)), "{dst}: {err}");
        }
        assert_eq!(backend.op_count("rename"), 0);
        assert!(vfs.stat("a/b/c").unwrap().is_dir());
    }

    #[test]
    fn test_rename_onto_ancestor_fails() {
        let (vfs, backend, _) = memory_vfs();
        vfs.mkdir("a", 0o755).unwrap();
        vfs.mkdir("a/b", 0o755).unwrap();
        vfs.create("a/b/f", 0o644).unwrap();

        let err = vfs.rename("a/b/f", "a").unwrap_err();
        assert!(matches!(err, VfsError::NotEmpty(_)));
        assert_eq!(backend.op_count("rename"), 0);
    }

    #[test]
    fn test_rename_through_file_parent() {
        let (vfs, _, _) = memory_vfs();
        vfs.create("f", 0o644).unwrap();
        vfs.create("g", 0o644).unwrap();
        assert!(matches!(
            vfs.rename("g", "f/g"),
            Err(VfsError::NotDirectory(_))
        ));
    }

    #[test]
    fn test_opposite_renames_terminate() {
        let (vfs, _, _) = memory_vfs();
        vfs.mkdir("x", 0o755).unwrap();
        vfs.mkdir("y", 0o755).unwrap();

        for _ in 0..50 {
            vfs.create("x/A", 0o644).unwrap();
            vfs.create("y/B", 0o644).unwrap();

            let (ab, ba) = rayon::join(|| vfs.rename("x/A", "y/B"), || vfs.rename("y/B", "x/A"));
            ab.unwrap();
            ba.unwrap();

            let a = vfs.stat("x/A").is_ok();
            let b = vfs.stat("y/B").is_ok();
            assert!(a ^ b, "exactly one name must survive");
            let _ = vfs.remove_file("x/A");
            let _ = vfs.remove_file("y/B");
        }
    }

    #[test]
    fn test_rename_by_id_updates_handle_path() {
        let (vfs, _, handles) = memory_vfs();
        let s = SessionId(1);
        vfs.mkdir("d", 0o755).unwrap();
        vfs.create("d/f", 0o644).unwrap();
        let h = open_rw(&vfs, &handles, s, "d/f");

        vfs.rename_by_id(s, h.fid(), "\\moved").unwrap();
        assert_eq!(
            handles.lookup(s, h.fid()).unwrap().path(),
            PathBuf::from("moved")
        );
        assert!(vfs.stat("moved").is_ok());
    }

    #[test]
    fn test_rename_by_id_after_path_renames() {
        let (vfs, _, handles) = memory_vfs();
        let s = SessionId(1);
        vfs.create("f", 0o644).unwrap();
        let h = open_rw(&vfs, &handles, s, "f");

        vfs.rename("f", "g").unwrap();
        vfs.rename_by_id(s, h.fid(), "h").unwrap();
        assert_eq!(vfs.stat("h").unwrap().node, h.node());
        assert_eq!(h.path(), PathBuf::from("h"));

        vfs.mkdir("a", 0o755).unwrap();
        vfs.rename("h", "a/h").unwrap();
        vfs.rename("a", "b").unwrap();
        vfs.rename_by_id(s, h.fid(), "top").unwrap();
        assert_eq!(vfs.stat("top").unwrap().node, h.node());
        assert!(matches!(vfs.stat("b/h"), Err(VfsError::NotFound(_))));
    }

    #[test]
    fn test_rename_by_id_detects_replaced_source() {
        let (vfs, _, handles) = memory_vfs();
        let s = SessionId(1);
        vfs.create("f", 0o644).unwrap();
        let h = open_rw(&vfs, &handles, s, "f");
        vfs.unlink("f").unwrap();
        vfs.create("f", 0o644).unwrap();

        assert!(matches!(
            vfs.rename_by_id(s, h.fid(), "g"),
            Err(VfsError::NotFound(_))
        ));
    }

    #[test]
    fn test_rename_by_unknown_id() {
        let (vfs, _, _) = memory_vfs();
        assert!(matches!(
            vfs.rename_by_id(SessionId(1), 99, "g"),
            Err(VfsError::NotFound(_))
        ));
    }
}
