//! Filesystem core of an SMB file server.
//!
//! [`ShareVfs`] turns protocol requests addressed by name or by
//! (session, file id) into calls on a [`Backend`]. On the way it enforces what
//! the backend does not: byte-range locks before I/O, lease breaks before
//! writes, deadlock-free rename across directories, and sanitized attribute
//! changes.

pub mod attr;
pub mod backend;
pub mod error;
pub mod handle;
pub mod io;
pub mod lease;
pub mod locks;
pub mod rename;
pub mod vfs;

#[cfg(test)]
pub(crate) mod testutil;

pub use attr::{sanitize, AttrChangeSet, SetTime};
pub use backend::local::{LocalBackend, LocalFile};
pub use backend::memory::{MemFile, MemoryBackend};
pub use backend::{Attributes, Backend, DirEntry, FileKind, NodeId, OpenMode, Target, XattrFlags};
pub use error::{NtStatus, VfsError, VfsResult};
pub use handle::{HandleTable, IoHints, OpenHandle, OpenedFile, SessionHandles, SessionId};
pub use lease::{LeaseBreaker, LeaseTable, NoLeases};
pub use locks::{ByteRange, LockCommand, LockKind, LockOutcome, LockOwner, LockRecord, LockTable};
pub use vfs::{FileRef, ShareVfs, VfsOptions};
