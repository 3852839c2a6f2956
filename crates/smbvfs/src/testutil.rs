//! Shared fixtures for unit tests.

use std::sync::Arc;
use std::time::UNIX_EPOCH;

use parking_lot::Mutex;

use crate::backend::memory::{MemFile, MemoryBackend};
use crate::backend::{Attributes, FileKind, NodeId, OpenMode};
use crate::handle::{OpenHandle, OpenedFile, SessionHandles, SessionId};
use crate::lease::{LeaseBreaker, NoLeases};
use crate::vfs::{ShareVfs, VfsOptions};

pub(crate) type MemVfs = ShareVfs<Arc<MemoryBackend>>;

/// A share over a fresh in-memory tree, with leases off.
pub(crate) fn memory_vfs() -> (MemVfs, Arc<MemoryBackend>, Arc<SessionHandles<MemFile>>) {
    let backend = Arc::new(MemoryBackend::new());
    let handles = Arc::new(SessionHandles::new());
    let vfs = ShareVfs::new(
        backend.clone(),
        handles.clone(),
        Arc::new(NoLeases),
        VfsOptions::default(),
    );
    (vfs, backend, handles)
}

pub(crate) fn open_rw(
    vfs: &MemVfs,
    handles: &SessionHandles<MemFile>,
    session: SessionId,
    name: &str,
) -> Arc<OpenHandle<MemFile>> {
    handles.register(session, vfs.open(name, OpenMode::READ_WRITE).unwrap())
}

/// An opened regular file with no backend behind it.
pub(crate) fn opened(ino: u64) -> OpenedFile<()> {
    OpenedFile {
        file: (),
        attrs: Attributes {
            node: NodeId { dev: 1, ino },
            kind: FileKind::Regular,
            mode: 0o100_644,
            uid: 0,
            gid: 0,
            size: 0,
            nlink: 1,
            atime: UNIX_EPOCH,
            mtime: UNIX_EPOCH,
            ctime: UNIX_EPOCH,
        },
        path: format!("f{ino}").into(),
    }
}

/// Remembers every break request.
#[derive(Debug, Default)]
pub(crate) struct RecordingBreaker {
    calls: Mutex<Vec<(SessionId, NodeId, u64)>>,
}

impl RecordingBreaker {
    pub(crate) fn calls(&self) -> Vec<(SessionId, NodeId, u64)> {
        self.calls.lock().clone()
    }
}

impl LeaseBreaker for RecordingBreaker {
    fn break_level2(&self, session: SessionId, node: NodeId, exclude_fid: u64) {
        self.calls.lock().push((session, node, exclude_fid));
    }
}
