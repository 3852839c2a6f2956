//! Byte-range locks.
//!
//! The table records the locks clients took through `ShareVfs::lock` and acts
//! as the gate every read, write and truncate passes before touching data.
//! The gate itself never blocks: a conflict is reported immediately.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace};

use crate::backend::NodeId;
use crate::error::{VfsError, VfsResult};
use crate::handle::SessionId;

/// Inclusive byte range `[start, end]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn new(start: u64, end: u64) -> Option<Self> {
        (start <= end).then_some(ByteRange { start, end })
    }

    /// Range covering `len` bytes at `offset`. Zero-length ranges cover
    /// nothing and yield `None`.
    pub fn from_offset_len(offset: u64, len: u64) -> VfsResult<Option<Self>> {
        if len == 0 {
            return Ok(None);
        }
        let end = offset.checked_add(len - 1).ok_or_else(|| {
            VfsError::RangeTooLarge(format!("offset {offset} + length {len} overflows"))
        })?;
        Ok(Some(ByteRange { start: offset, end }))
    }

    pub fn overlaps(&self, other: &ByteRange) -> bool {
        self.start <= other.end && other.start <= self.end
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockKind {
    Read,
    Write,
}

/// The handle a lock belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LockOwner {
    pub session: SessionId,
    pub fid: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockRecord {
    pub owner: LockOwner,
    pub kind: LockKind,
    pub range: ByteRange,
}

impl LockRecord {
    /// Whether an access of `kind` over `range` by `owner` is blocked by this
    /// record. A missing owner conflicts with every lock.
    fn blocks(&self, range: &ByteRange, kind: LockKind, owner: Option<LockOwner>) -> bool {
        Some(self.owner) != owner
            && self.range.overlaps(range)
            && (kind == LockKind::Write || self.kind == LockKind::Write)
    }
}

/// Client lock request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockCommand {
    /// Take a lock. With `wait`, block until conflicting locks go away.
    Set { kind: LockKind, wait: bool },
    Unlock,
    /// Report the first lock that would block a request of this kind.
    Test(LockKind),
}

impl LockCommand {
    pub fn set(kind: LockKind) -> Self {
        LockCommand::Set { kind, wait: false }
    }

    pub fn set_wait(kind: LockKind) -> Self {
        LockCommand::Set { kind, wait: true }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOutcome {
    Granted,
    Released,
    /// A test found nothing in the way.
    Free,
    /// A test found this lock in the way.
    Blocked(LockRecord),
}

/// Byte-range locks of every object in the share.
#[derive(Debug, Default)]
pub struct LockTable {
    records: Mutex<HashMap<NodeId, Vec<LockRecord>>>,
    released: Condvar,
    /// Total records across all objects. Zero means the gate has nothing to
    /// check.
    count: AtomicUsize,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Gate an access of `kind` over `range` of `node`.
    pub fn check(
        &self,
        node: NodeId,
        range: ByteRange,
        kind: LockKind,
        owner: Option<LockOwner>,
    ) -> VfsResult<()> {
        if self.count.load(Ordering::Acquire) == 0 {
            return Ok(());
        }
        let records = self.records.lock();
        match find_blocker(records.get(&node), &range, kind, owner) {
            Some(blocker) => {
                debug!(
                    "Lock conflict on ino {}: {:?} [{}, {}] blocked by {:?}",
                    node.ino, kind, range.start, range.end, blocker
                );
                Err(VfsError::LockConflict(format!(
                    "[{}, {}] held by session {} fid {}",
                    blocker.range.start,
                    blocker.range.end,
                    blocker.owner.session.0,
                    blocker.owner.fid
                )))
            }
            None => Ok(()),
        }
    }

    /// Take a lock without waiting.
    pub fn set(
        &self,
        node: NodeId,
        owner: LockOwner,
        kind: LockKind,
        range: ByteRange,
    ) -> VfsResult<()> {
        let mut records = self.records.lock();
        if let Some(blocker) = find_blocker(records.get(&node), &range, kind, Some(owner)) {
            return Err(VfsError::LockConflict(format!(
                "[{}, {}] held by session {} fid {}",
                blocker.range.start, blocker.range.end, blocker.owner.session.0, blocker.owner.fid
            )));
        }
        self.insert(&mut records, node, LockRecord { owner, kind, range });
        Ok(())
    }

    /// Take a lock, waiting for conflicting locks to be released.
    pub fn set_wait(&self, node: NodeId, owner: LockOwner, kind: LockKind, range: ByteRange) {
        let mut records = self.records.lock();
        while find_blocker(records.get(&node), &range, kind, Some(owner)).is_some() {
            trace!("Waiting for [{}, {}] on ino {}", range.start, range.end, node.ino);
            self.released.wait(&mut records);
        }
        self.insert(&mut records, node, LockRecord { owner, kind, range });
    }

    /// Release whatever part of `range` the owner holds.
    pub fn unlock(&self, node: NodeId, owner: LockOwner, range: ByteRange) {
        let mut records = self.records.lock();
        if let Some(list) = records.get_mut(&node) {
            let before = list.len();
            carve(list, owner, &range);
            self.adjust(before, list.len());
            if list.is_empty() {
                records.remove(&node);
            }
        }
        self.released.notify_all();
    }

    /// First lock that would block the request, if any.
    pub fn test(
        &self,
        node: NodeId,
        owner: LockOwner,
        kind: LockKind,
        range: ByteRange,
    ) -> Option<LockRecord> {
        let records = self.records.lock();
        find_blocker(records.get(&node), &range, kind, Some(owner)).copied()
    }

    /// Drop every lock held by `owner`. Called when its handle closes.
    pub fn release_owner(&self, owner: LockOwner) -> usize {
        let mut records = self.records.lock();
        let mut removed = 0;
        records.retain(|_, list| {
            let before = list.len();
            list.retain(|r| r.owner != owner);
            removed += before - list.len();
            !list.is_empty()
        });
        if removed > 0 {
            self.count.fetch_sub(removed, Ordering::AcqRel);
            self.released.notify_all();
        }
        removed
    }

    /// Number of locks recorded on `node`.
    pub fn locks_on(&self, node: NodeId) -> usize {
        self.records.lock().get(&node).map_or(0, Vec::len)
    }

    fn insert(&self, records: &mut HashMap<NodeId, Vec<LockRecord>>, node: NodeId, record: LockRecord) {
        let list = records.entry(node).or_default();
        let before = list.len();
        // A new lock replaces whatever the same owner held under it.
        carve(list, record.owner, &record.range);
        list.push(record);
        self.adjust(before, list.len());
    }

    fn adjust(&self, before: usize, after: usize) {
        if after > before {
            self.count.fetch_add(after - before, Ordering::AcqRel);
        } else if before > after {
            self.count.fetch_sub(before - after, Ordering::AcqRel);
        }
    }
}

fn find_blocker<'a>(
    list: Option<&'a Vec<LockRecord>>,
    range: &ByteRange,
    kind: LockKind,
    owner: Option<LockOwner>,
) -> Option<&'a LockRecord> {
    list?.iter().find(|r| r.blocks(range, kind, owner))
}

/// Remove `range` from every record of `owner`, splitting records that
/// straddle it.
fn carve(list: &mut Vec<LockRecord>, owner: LockOwner, range: &ByteRange) {
    let mut kept = Vec::with_capacity(list.len());
    for record in list.drain(..) {
        if record.owner != owner || !record.range.overlaps(range) {
            kept.push(record);
            continue;
        }
        if record.range.start < range.start {
            kept.push(LockRecord {
                range: ByteRange {
                    start: record.range.start,
                    end: range.start - 1,
                },
                ..record
            });
        }
        if record.range.end > range.end {
            kept.push(LockRecord {
                range: ByteRange {
                    start: range.end + 1,
                    end: record.range.end,
                },
                ..record
            });
        }
    }
    *list = kept;
}
