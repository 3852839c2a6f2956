//! Read, write and truncate.
//!
//! Each entry point runs the byte-range gate first, then the lease trigger
//! where the data is about to change, then the backend call.

use smbvfs_core::paths;
use tracing::{debug, error, warn};

use crate::backend::{Backend, Target};
use crate::error::{VfsError, VfsResult};
use crate::handle::{IoHints, SessionId};
use crate::locks::{ByteRange, LockKind};
use crate::vfs::{FileRef, Resolved, ShareVfs};

impl<B: Backend> ShareVfs<B> {
    /// Read up to `count` bytes at `offset`. The returned buffer holds exactly
    /// the bytes read.
    pub fn read(&self, session: SessionId, fid: u64, count: usize, offset: u64) -> VfsResult<Vec<u8>> {
        let handle = self.resolve(session, fid)?;
        if handle.is_dir() {
            return Err(VfsError::IsDirectory(paths::display(&handle.path())));
        }
        if count == 0 {
            return Ok(Vec::new());
        }

        if let Some(range) = ByteRange::from_offset_len(offset, count as u64)? {
            self.locks
                .check(handle.node(), range, LockKind::Read, Some(handle.owner()))?;
        }

        // Reads always go through the page cache.
        handle.clear_hints(IoHints::NO_BUFFERING);

        let mut buf = Vec::new();
        buf.try_reserve_exact(count).map_err(|_| {
            VfsError::NoMemory(format!("cannot allocate {count} byte read buffer"))
        })?;
        buf.resize(count, 0);

        let n = self
            .backend
            .read(handle.file(), &mut buf, offset)
            .inspect_err(|e| {
                error!("Read of {} failed: {}", paths::display(&handle.path()), e);
            })?;
        buf.truncate(n);
        Ok(buf)
    }

    /// Write `data` at `offset`. With `durable`, or when the handle was opened
    /// write-through, the written range is flushed before returning.
    pub fn write(
        &self,
        session: SessionId,
        fid: u64,
        data: &[u8],
        offset: u64,
        durable: bool,
    ) -> VfsResult<usize> {
        self.ensure_writable()?;
        let handle = self.resolve(session, fid)?;
        if handle.is_dir() {
            return Err(VfsError::IsDirectory(paths::display(&handle.path())));
        }
        if data.is_empty() {
            return Ok(0);
        }

        if let Some(range) = ByteRange::from_offset_len(offset, data.len() as u64)? {
            self.locks
                .check(handle.node(), range, LockKind::Write, Some(handle.owner()))?;
        }

        self.leases.break_conflicting(&handle);

        let written = self
            .backend
            .write(handle.file(), data, offset)
            .inspect_err(|e| {
                error!("Write to {} failed: {}", paths::display(&handle.path()), e);
            })?;

        if durable || handle.hints().contains(IoHints::WRITE_THROUGH) {
            self.backend
                .fsync_range(handle.file(), offset, written as u64)
                .map_err(|e| {
                    warn!(
                        "Flush of {} failed after {} bytes written: {}",
                        paths::display(&handle.path()),
                        written,
                        e
                    );
                    VfsError::FlushFailure(e.to_string())
                })?;
        }
        Ok(written)
    }

    /// Set the size of a file addressed by name or by handle.
    pub fn truncate(&self, target: FileRef<'_>, size: u64) -> VfsResult<()> {
        self.ensure_writable()?;
        match self.resolve_ref(target)? {
            Resolved::Path(path) => {
                // No open handle, so no lease or lock to honour.
                self.backend.truncate(Target::Path(&path), size)?;
                debug!("Truncated {} to {}", paths::display(&path), size);
            }
            Resolved::Handle(handle) => {
                if handle.is_dir() {
                    return Err(VfsError::IsDirectory(paths::display(&handle.path())));
                }
                if self.leases.enabled() {
                    self.leases.break_conflicting(&handle);
                } else {
                    let old = self.backend.getattr(handle.file())?.size;
                    let (low, high) = if size < old { (size, old) } else { (old, size) };
                    if let Some(range) = ByteRange::from_offset_len(low, high - low)? {
                        self.locks.check(
                            handle.node(),
                            range,
                            LockKind::Write,
                            Some(handle.owner()),
                        )?;
                    }
                }
                self.backend.truncate(Target::File(handle.file()), size)?;
                debug!(
                    "Truncated {} (fid {}) to {}",
                    paths::display(&handle.path()),
                    handle.fid(),
                    size
                );
            }
        }
        Ok(())
    }

    /// Reserve `len` bytes for an open file without changing its size.
    pub fn allocate(&self, session: SessionId, fid: u64, len: u64) -> VfsResult<()> {
        self.ensure_writable()?;
        let handle = self.resolve(session, fid)?;
        if handle.is_dir() {
            return Err(VfsError::IsDirectory(paths::display(&handle.path())));
        }
        self.backend.allocate(handle.file(), len)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::backend::memory::MemoryBackend;
    use crate::backend::OpenMode;
    use crate::handle::{create_options, SessionHandles};
    use crate::locks::LockCommand;
    use crate::testutil::{memory_vfs, open_rw, RecordingBreaker};
    use crate::vfs::VfsOptions;

    fn vfs_with_breaker(
        leases_enabled: bool,
    ) -> (
        ShareVfs<Arc<MemoryBackend>>,
        Arc<MemoryBackend>,
        Arc<SessionHandles<<MemoryBackend as Backend>::File>>,
        Arc<RecordingBreaker>,
    ) {
        let backend = Arc::new(MemoryBackend::new());
        let handles = Arc::new(SessionHandles::new());
        let breaker = Arc::new(RecordingBreaker::default());
        let options = VfsOptions {
            leases_enabled,
            ..VfsOptions::default()
        };
        let vfs = ShareVfs::new(backend.clone(), handles.clone(), breaker.clone(), options);
        (vfs, backend, handles, breaker)
    }

    #[test]
    fn test_write_then_read() {
        let (vfs, _, handles) = memory_vfs();
        let s = SessionId(1);
        vfs.create("f", 0o644).unwrap();
        let h = open_rw(&vfs, &handles, s, "f");

        assert_eq!(vfs.write(s, h.fid(), b"hello world", 0, false).unwrap(), 11);
        assert_eq!(vfs.read(s, h.fid(), 5, 6).unwrap(), b"world");
        assert_eq!(vfs.read(s, h.fid(), 100, 0).unwrap().len(), 11);
        assert!(vfs.read(s, h.fid(), 10, 50).unwrap().is_empty());
        assert!(vfs.read(s, h.fid(), 0, 0).unwrap().is_empty());
    }

    #[test]
    fn test_write_at_end_of_offset_space() {
        let (vfs, backend, handles) = memory_vfs();
        let s = SessionId(1);
        vfs.create("f", 0o644).unwrap();
        let h = open_rw(&vfs, &handles, s, "f");

        assert!(matches!(
            vfs.write(s, h.fid(), b"x", u64::MAX - 1, false),
            Err(VfsError::RangeTooLarge(_))
        ));
        assert_eq!(backend.op_count("write"), 1);
        assert!(matches!(
            vfs.truncate(FileRef::Handle(s, h.fid()), u64::MAX),
            Err(VfsError::RangeTooLarge(_))
        ));
        assert_eq!(vfs.getattr(s, h.fid()).unwrap().size, 0);
    }

    #[test]
    fn test_directory_read_skips_backend() {
        let (vfs, backend, handles) = memory_vfs();
        let s = SessionId(1);
        vfs.mkdir("d", 0o755).unwrap();
        let d = handles.register(s, vfs.open("d", OpenMode::READ).unwrap());

        assert!(matches!(
            vfs.read(s, d.fid(), 10, 0),
            Err(VfsError::IsDirectory(_))
        ));
        assert_eq!(backend.op_count("read"), 0);
    }

    #[test]
    fn test_read_clears_no_buffering() {
        let (vfs, _, handles) = memory_vfs();
        let s = SessionId(1);
        vfs.create("f", 0o644).unwrap();
        let h = open_rw(&vfs, &handles, s, "f");
        vfs.set_io_hints(s, h.fid(), create_options::FILE_NO_INTERMEDIATE_BUFFERING)
            .unwrap();
        assert!(h.hints().contains(IoHints::NO_BUFFERING));
        vfs.read(s, h.fid(), 1, 0).unwrap();
        assert!(!h.hints().contains(IoHints::NO_BUFFERING));
    }

    #[test]
    fn test_read_blocked_by_foreign_write_lock() {
        let (vfs, backend, handles) = memory_vfs();
        vfs.create("f", 0o644).unwrap();
        let a = open_rw(&vfs, &handles, SessionId(1), "f");
        let b = open_rw(&vfs, &handles, SessionId(2), "f");
        vfs.lock(SessionId(1), a.fid(), LockCommand::set(LockKind::Write), 0, 100)
            .unwrap();

        assert!(matches!(
            vfs.read(SessionId(2), b.fid(), 10, 50),
            Err(VfsError::LockConflict(_))
        ));
        assert_eq!(backend.op_count("read"), 0);
        assert!(vfs.read(SessionId(1), a.fid(), 10, 50).is_ok());
    }

    #[test]
    fn test_failed_read_returns_no_buffer() {
        let (vfs, backend, handles) = memory_vfs();
        let s = SessionId(1);
        vfs.create("f", 0o644).unwrap();
        let h = open_rw(&vfs, &handles, s, "f");
        backend.inject_failure("read", VfsError::IoFailure("disk".into()));
        assert!(matches!(
            vfs.read(s, h.fid(), 10, 0),
            Err(VfsError::IoFailure(_))
        ));
    }

    #[test]
    fn test_durable_write_conflict_makes_no_lease_call() {
        let (vfs, backend, handles, breaker) = vfs_with_breaker(true);
        vfs.create("f", 0o644).unwrap();
        let reader = open_rw(&vfs, &handles, SessionId(1), "f");
        let writer = open_rw(&vfs, &handles, SessionId(2), "f");
        vfs.lock(SessionId(1), reader.fid(), LockCommand::set(LockKind::Read), 512, 16)
            .unwrap();

        let err = vfs
            .write(SessionId(2), writer.fid(), &[0u8; 1024], 0, true)
            .unwrap_err();
        assert!(matches!(err, VfsError::LockConflict(_)));
        assert!(err.is_retryable());
        assert!(breaker.calls().is_empty());
        assert_eq!(backend.op_count("write"), 0);
        assert_eq!(backend.op_count("fsync_range"), 0);
        assert_eq!(vfs.stat("f").unwrap().size, 0);
    }

    #[test]
    fn test_write_breaks_leases_then_flushes() {
        let (vfs, backend, handles, breaker) = vfs_with_breaker(true);
        vfs.create("f", 0o644).unwrap();
        let w = open_rw(&vfs, &handles, SessionId(2), "f");

        assert_eq!(vfs.write(SessionId(2), w.fid(), b"data", 0, true).unwrap(), 4);
        assert_eq!(breaker.calls(), vec![(SessionId(2), w.node(), w.fid())]);
        assert_eq!(backend.op_count("fsync_range"), 1);

        vfs.write(SessionId(2), w.fid(), b"more", 4, false).unwrap();
        assert_eq!(backend.op_count("fsync_range"), 1);
    }

    #[test]
    fn test_write_through_hint_flushes() {
        let (vfs, backend, handles) = memory_vfs();
        let s = SessionId(1);
        vfs.create("f", 0o644).unwrap();
        let h = open_rw(&vfs, &handles, s, "f");
        vfs.set_io_hints(s, h.fid(), create_options::FILE_WRITE_THROUGH)
            .unwrap();
        vfs.write(s, h.fid(), b"x", 0, false).unwrap();
        assert_eq!(backend.op_count("fsync_range"), 1);
    }

    #[test]
    fn test_flush_failure_is_distinct() {
        let (vfs, backend, handles) = memory_vfs();
        let s = SessionId(1);
        vfs.create("f", 0o644).unwrap();
        let h = open_rw(&vfs, &handles, s, "f");
        backend.inject_failure("fsync_range", VfsError::IoFailure("cache".into()));

        let err = vfs.write(s, h.fid(), b"abc", 0, true).unwrap_err();
        assert!(matches!(err, VfsError::FlushFailure(_)));
        assert_eq!(vfs.stat("f").unwrap().size, 3);
    }

    #[test]
    fn test_truncate_by_path_skips_locks_and_leases() {
        let (vfs, backend, handles, breaker) = vfs_with_breaker(false);
        vfs.mkdir("share", 0o755).unwrap();
        vfs.create("share/a.txt", 0o644).unwrap();
        let h = open_rw(&vfs, &handles, SessionId(1), "share/a.txt");
        vfs.write(SessionId(1), h.fid(), &[1u8; 64], 0, false).unwrap();
        vfs.lock(SessionId(1), h.fid(), LockCommand::set(LockKind::Write), 0, 64)
            .unwrap();

        let getattrs = backend.op_count("getattr");
        vfs.truncate(FileRef::Path("/share/a.txt"), 0).unwrap();
        assert_eq!(backend.op_count("truncate"), 1);
        assert_eq!(backend.op_count("getattr"), getattrs);
        assert!(breaker.calls().is_empty());
        assert_eq!(vfs.stat("share/a.txt").unwrap().size, 0);
    }

    #[test]
    fn test_handle_truncate_probes_locks_without_leases() {
        let (vfs, backend, handles, breaker) = vfs_with_breaker(false);
        vfs.create("f", 0o644).unwrap();
        let a = open_rw(&vfs, &handles, SessionId(1), "f");
        let b = open_rw(&vfs, &handles, SessionId(2), "f");
        vfs.write(SessionId(1), a.fid(), &[1u8; 100], 0, false).unwrap();
        vfs.lock(SessionId(2), b.fid(), LockCommand::set(LockKind::Read), 90, 5)
            .unwrap();

        assert!(matches!(
            vfs.truncate(FileRef::Handle(SessionId(1), a.fid()), 50),
            Err(VfsError::LockConflict(_))
        ));
        assert_eq!(backend.op_count("truncate"), 0);

        vfs.truncate(FileRef::Handle(SessionId(1), a.fid()), 95)
            .unwrap();
        assert_eq!(vfs.stat("f").unwrap().size, 95);
        assert!(breaker.calls().is_empty());
    }

    #[test]
    fn test_handle_truncate_breaks_leases_when_enabled() {
        let (vfs, _, handles, breaker) = vfs_with_breaker(true);
        vfs.create("f", 0o644).unwrap();
        let a = open_rw(&vfs, &handles, SessionId(1), "f");
        vfs.truncate(FileRef::Handle(SessionId(1), a.fid()), 10)
            .unwrap();
        assert_eq!(breaker.calls().len(), 1);
        assert_eq!(vfs.stat("f").unwrap().size, 10);
    }

    #[test]
    fn test_disjoint_concurrent_writes() {
        let (vfs, _, handles) = memory_vfs();
        vfs.create("f", 0o644).unwrap();
        let a = open_rw(&vfs, &handles, SessionId(1), "f");
        let b = open_rw(&vfs, &handles, SessionId(2), "f");
        vfs.lock(SessionId(1), a.fid(), LockCommand::set(LockKind::Write), 0, 4096)
            .unwrap();
        vfs.lock(SessionId(2), b.fid(), LockCommand::set(LockKind::Write), 4096, 4096)
            .unwrap();

        let (ra, rb) = rayon::join(
            || {
                (0..64u64).try_for_each(|i| {
                    vfs.write(SessionId(1), a.fid(), &[0xAA; 64], i * 64, false)
                        .map(|_| ())
                })
            },
            || {
                (0..64u64).try_for_each(|i| {
                    vfs.write(SessionId(2), b.fid(), &[0xBB; 64], 4096 + i * 64, false)
                        .map(|_| ())
                })
            },
        );
        ra.unwrap();
        rb.unwrap();

        let data = vfs.read(SessionId(1), a.fid(), 8192, 0);
        assert!(matches!(data, Err(VfsError::LockConflict(_))));
        let first = vfs.read(SessionId(1), a.fid(), 4096, 0).unwrap();
        assert!(first.iter().all(|b| *b == 0xAA));
    }
}
