//! Open handles and the per-session handle table.
//!
//! A handle binds a numeric file id, scoped to one session, to an open backend
//! file. The table owns handles; operations borrow an `Arc` for the duration of
//! one call and drop it before returning.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use bitflags::bitflags;
use dashmap::DashMap;
use parking_lot::RwLock;

use crate::backend::{Attributes, FileKind, NodeId};
use crate::locks::LockOwner;

/// Identity of one client connection/session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

/// SMB2 CreateOptions bits that carry caching hints.
pub mod create_options {
    pub const FILE_WRITE_THROUGH: u32 = 0x0000_0002;
    pub const FILE_SEQUENTIAL_ONLY: u32 = 0x0000_0004;
    pub const FILE_NO_INTERMEDIATE_BUFFERING: u32 = 0x0000_0008;
    pub const FILE_RANDOM_ACCESS: u32 = 0x0000_0800;
}

bitflags! {
    /// Client-requested I/O behaviour for a handle.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct IoHints: u32 {
        /// Every write is flushed before it is acknowledged.
        const WRITE_THROUGH = 0x1;
        /// Client asked for unbuffered transfers. The read path clears it.
        const NO_BUFFERING = 0x2;
        const SEQUENTIAL = 0x4;
        const RANDOM = 0x8;
    }
}

impl IoHints {
    /// Fold CreateOptions into the current hints. Only the first matching
    /// option is honoured, in the order write-through, no-buffering,
    /// sequential, random.
    pub fn with_create_options(self, options: u32) -> IoHints {
        use create_options::*;

        if options & FILE_WRITE_THROUGH != 0 {
            self | IoHints::WRITE_THROUGH
        } else if options & FILE_NO_INTERMEDIATE_BUFFERING != 0 {
            self | IoHints::NO_BUFFERING
        } else if options & FILE_SEQUENTIAL_ONLY != 0 {
            (self | IoHints::SEQUENTIAL) - IoHints::RANDOM
        } else if options & FILE_RANDOM_ACCESS != 0 {
            self | IoHints::RANDOM
        } else {
            self
        }
    }
}

/// Result of opening an object, before it is bound to a file id.
#[derive(Debug)]
pub struct OpenedFile<F> {
    pub file: F,
    pub attrs: Attributes,
    pub path: PathBuf,
}

/// One client's open reference to a filesystem object.
#[derive(Debug)]
pub struct OpenHandle<F> {
    fid: u64,
    session: SessionId,
    file: F,
    node: NodeId,
    kind: FileKind,
    /// Last known share path. Diagnostics and rename-by-id only.
    path: RwLock<PathBuf>,
    hints: AtomicU32,
}

impl<F> OpenHandle<F> {
    pub fn new(fid: u64, session: SessionId, opened: OpenedFile<F>) -> Self {
        OpenHandle {
            fid,
            session,
            file: opened.file,
            node: opened.attrs.node,
            kind: opened.attrs.kind,
            path: RwLock::new(opened.path),
            hints: AtomicU32::new(IoHints::empty().bits()),
        }
    }

    pub fn fid(&self) -> u64 {
        self.fid
    }

    pub fn session(&self) -> SessionId {
        self.session
    }

    pub fn file(&self) -> &F {
        &self.file
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn kind(&self) -> FileKind {
        self.kind
    }

    pub fn is_dir(&self) -> bool {
        self.kind == FileKind::Directory
    }

    pub fn path(&self) -> PathBuf {
        self.path.read().clone()
    }

    pub(crate) fn set_path(&self, path: &Path) {
        *self.path.write() = path.to_path_buf();
    }

    /// Lock owner identity for byte-range locks taken through this handle.
    pub fn owner(&self) -> LockOwner {
        LockOwner {
            session: self.session,
            fid: self.fid,
        }
    }

    pub fn hints(&self) -> IoHints {
        IoHints::from_bits_truncate(self.hints.load(Ordering::Acquire))
    }

    pub(crate) fn set_hints(&self, hints: IoHints) {
        self.hints.store(hints.bits(), Ordering::Release);
    }

    pub(crate) fn clear_hints(&self, hints: IoHints) {
        self.hints.fetch_and(!hints.bits(), Ordering::AcqRel);
    }
}

/// Lookup interface into whatever owns the open handles.
pub trait HandleTable<F>: Send + Sync {
    fn lookup(&self, session: SessionId, fid: u64) -> Option<Arc<OpenHandle<F>>>;
}

/// Concurrent handle table keyed by (session, file id).
#[derive(Debug)]
pub struct SessionHandles<F> {
    handles: DashMap<(SessionId, u64), Arc<OpenHandle<F>>>,
    /// Next file id. Ids are never reused while the table lives.
    next_fid: AtomicU64,
}

impl<F> SessionHandles<F> {
    pub fn new() -> Self {
        SessionHandles {
            handles: DashMap::new(),
            next_fid: AtomicU64::new(1),
        }
    }

    /// Bind an opened file to a fresh id in `session`.
    pub fn register(&self, session: SessionId, opened: OpenedFile<F>) -> Arc<OpenHandle<F>> {
        let fid = self.next_fid.fetch_add(1, Ordering::Relaxed);
        let handle = Arc::new(OpenHandle::new(fid, session, opened));
        self.handles.insert((session, fid), handle.clone());
        handle
    }

    /// Remove a handle. The caller closes it through `ShareVfs::close`.
    pub fn remove(&self, session: SessionId, fid: u64) -> Option<Arc<OpenHandle<F>>> {
        self.handles.remove(&(session, fid)).map(|(_, h)| h)
    }

    /// Remove every handle of a session (logoff / disconnect).
    pub fn remove_session(&self, session: SessionId) -> Vec<Arc<OpenHandle<F>>> {
        let fids: Vec<u64> = self
            .handles
            .iter()
            .filter(|e| e.key().0 == session)
            .map(|e| e.key().1)
            .collect();
        fids.into_iter()
            .filter_map(|fid| self.remove(session, fid))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}

impl<F> Default for SessionHandles<F> {
    fn default() -> Self {
        Self::new()
    }
}

impl<F: Send + Sync> HandleTable<F> for SessionHandles<F> {
    fn lookup(&self, session: SessionId, fid: u64) -> Option<Arc<OpenHandle<F>>> {
        self.handles.get(&(session, fid)).map(|h| h.value().clone())
    }
}
