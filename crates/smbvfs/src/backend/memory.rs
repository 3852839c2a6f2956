//! In-memory backend.
//!
//! Every primitive is counted per operation name, and any primitive can be
//! made to fail with a chosen error. Unlinked nodes stay reachable through
//! files that still have them open and are reclaimed by the next namespace
//! change after the last such file is dropped.

use std::collections::{BTreeMap, HashMap};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::trace;

use super::{
    Attributes, Backend, DirEntry, FileKind, NodeId, OpenMode, Target, XattrFlags, S_IFDIR,
    S_IFLNK, S_IFMT, S_IFREG,
};
use crate::attr::{AttrChangeSet, SetTime};
use crate::error::{VfsError, VfsResult};

const ROOT_INO: u64 = 1;
const DEV: u64 = 1;

#[derive(Debug)]
struct Node {
    kind: FileKind,
    mode: u32,
    uid: u32,
    gid: u32,
    nlink: u64,
    data: Vec<u8>,
    children: BTreeMap<String, u64>,
    link_target: PathBuf,
    xattrs: BTreeMap<String, Vec<u8>>,
    atime: SystemTime,
    mtime: SystemTime,
    ctime: SystemTime,
    /// One extra strong count per open [`MemFile`].
    pins: Arc<()>,
}

impl Node {
    fn new(kind: FileKind, mode: u32) -> Self {
        let now = SystemTime::now();
        let type_bits = match kind {
            FileKind::Directory => S_IFDIR,
            FileKind::Symlink => S_IFLNK,
            _ => S_IFREG,
        };
        Node {
            kind,
            mode: type_bits | (mode & !S_IFMT),
            uid: 0,
            gid: 0,
            nlink: if kind == FileKind::Directory { 2 } else { 1 },
            data: Vec::new(),
            children: BTreeMap::new(),
            link_target: PathBuf::new(),
            xattrs: BTreeMap::new(),
            atime: now,
            mtime: now,
            ctime: now,
            pins: Arc::new(()),
        }
    }

    fn is_orphan(&self) -> bool {
        self.nlink == 0 && Arc::strong_count(&self.pins) == 1
    }

    fn attrs(&self, ino: u64) -> Attributes {
        Attributes {
            node: NodeId { dev: DEV, ino },
            kind: self.kind,
            mode: self.mode,
            uid: self.uid,
            gid: self.gid,
            size: match self.kind {
                FileKind::Symlink => self.link_target.as_os_str().len() as u64,
                _ => self.data.len() as u64,
            },
            nlink: self.nlink,
            atime: self.atime,
            mtime: self.mtime,
            ctime: self.ctime,
        }
    }
}

#[derive(Debug)]
struct Tree {
    nodes: HashMap<u64, Node>,
    next_ino: u64,
}

impl Tree {
    fn node(&self, ino: u64) -> VfsResult<&Node> {
        self.nodes
            .get(&ino)
            .ok_or_else(|| VfsError::NotFound(format!("inode {ino}")))
    }

    fn node_mut(&mut self, ino: u64) -> VfsResult<&mut Node> {
        self.nodes
            .get_mut(&ino)
            .ok_or_else(|| VfsError::NotFound(format!("inode {ino}")))
    }

    fn resolve(&self, path: &Path) -> VfsResult<u64> {
        let mut ino = ROOT_INO;
        for component in path.components() {
            let Component::Normal(name) = component else {
                return Err(VfsError::InvalidName(path.display().to_string()));
            };
            let node = self.node(ino)?;
            if node.kind != FileKind::Directory {
                return Err(VfsError::NotDirectory(path.display().to_string()));
            }
            let name = name.to_string_lossy();
            ino = *node
                .children
                .get(&*name)
                .ok_or_else(|| VfsError::NotFound(path.display().to_string()))?;
        }
        Ok(ino)
    }

    /// Directory inode and leaf name of a path.
    fn parent_of(&self, path: &Path) -> VfsResult<(u64, String)> {
        let leaf = path
            .file_name()
            .ok_or_else(|| VfsError::InvalidName(path.display().to_string()))?
            .to_string_lossy()
            .into_owned();
        let dir = self.resolve(path.parent().unwrap_or(Path::new("")))?;
        if self.node(dir)?.kind != FileKind::Directory {
            return Err(VfsError::NotDirectory(path.display().to_string()));
        }
        Ok((dir, leaf))
    }

    fn insert(&mut self, path: &Path, node: Node) -> VfsResult<u64> {
        self.reap();
        let (dir, leaf) = self.parent_of(path)?;
        if self.node(dir)?.children.contains_key(&leaf) {
            return Err(VfsError::Exists(path.display().to_string()));
        }
        let ino = self.next_ino;
        self.next_ino += 1;
        self.nodes.insert(ino, node);
        self.attach(dir, leaf, ino)?;
        Ok(ino)
    }

    fn attach(&mut self, dir: u64, leaf: String, ino: u64) -> VfsResult<()> {
        let now = SystemTime::now();
        let parent = self.node_mut(dir)?;
        parent.children.insert(leaf, ino);
        parent.mtime = now;
        parent.ctime = now;
        Ok(())
    }

    fn detach(&mut self, dir: u64, leaf: &str) -> VfsResult<u64> {
        let now = SystemTime::now();
        let parent = self.node_mut(dir)?;
        let ino = parent
            .children
            .remove(leaf)
            .ok_or_else(|| VfsError::NotFound(leaf.to_string()))?;
        parent.mtime = now;
        parent.ctime = now;
        Ok(ino)
    }

    fn drop_link(&mut self, ino: u64) -> VfsResult<()> {
        let node = self.node_mut(ino)?;
        node.nlink = node.nlink.saturating_sub(1);
        node.ctime = SystemTime::now();
        Ok(())
    }

    /// First name of `ino` below directory `dir`, in name order.
    fn path_of(&self, dir: u64, ino: u64) -> Option<PathBuf> {
        let node = self.nodes.get(&dir)?;
        for (name, &child) in &node.children {
            if child == ino {
                return Some(PathBuf::from(name));
            }
            if self.nodes.get(&child).is_some_and(|n| n.kind == FileKind::Directory) {
                if let Some(rest) = self.path_of(child, ino) {
                    return Some(Path::new(name).join(rest));
                }
            }
        }
        None
    }

    /// Drop unlinked nodes that no open file refers to.
    fn reap(&mut self) {
        self.nodes.retain(|_, node| !node.is_orphan());
    }
}

/// Grow or shrink file data, refusing sizes the allocator cannot hold.
fn resize_data(data: &mut Vec<u8>, len: u64) -> VfsResult<()> {
    let len = usize::try_from(len)
        .ok()
        .filter(|&len| len <= isize::MAX as usize)
        .ok_or_else(|| VfsError::RangeTooLarge(format!("file size {len}")))?;
    if len > data.len() {
        data.try_reserve_exact(len - data.len())
            .map_err(|_| VfsError::NoSpace(format!("cannot grow file to {len} bytes")))?;
    }
    data.resize(len, 0);
    Ok(())
}

/// Open state of a [`MemoryBackend`] object.
#[derive(Debug, Clone)]
pub struct MemFile {
    ino: u64,
    mode: OpenMode,
    _pin: Arc<()>,
}

#[derive(Debug)]
pub struct MemoryBackend {
    tree: RwLock<Tree>,
    ops: DashMap<&'static str, usize>,
    failures: DashMap<&'static str, VfsError>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    /// An empty share with a root directory.
    pub fn new() -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(ROOT_INO, Node::new(FileKind::Directory, 0o755));
        MemoryBackend {
            tree: RwLock::new(Tree {
                nodes,
                next_ino: ROOT_INO + 1,
            }),
            ops: DashMap::new(),
            failures: DashMap::new(),
        }
    }

    /// How many times a primitive was called, including injected failures.
    pub fn op_count(&self, op: &str) -> usize {
        self.ops.get(op).map_or(0, |n| *n)
    }

    /// Make every later call of `op` fail with `err`.
    pub fn inject_failure(&self, op: &'static str, err: VfsError) {
        self.failures.insert(op, err);
    }

    pub fn clear_failure(&self, op: &str) {
        self.failures.remove(op);
    }

    fn enter(&self, op: &'static str) -> VfsResult<()> {
        *self.ops.entry(op).or_insert(0) += 1;
        trace!("memory backend: {op}");
        match self.failures.get(op) {
            Some(err) => Err(err.value().clone()),
            None => Ok(()),
        }
    }

    fn target_ino(tree: &Tree, target: Target<'_, MemFile>) -> VfsResult<u64> {
        match target {
            Target::Path(path) => tree.resolve(path),
            Target::File(file) => {
                tree.node(file.ino)?;
                Ok(file.ino)
            }
        }
    }
}

fn apply_time(slot: &mut SystemTime, time: Option<SetTime>, now: SystemTime) {
    match time {
        Some(SetTime::Now) => *slot = now,
        Some(SetTime::At(t)) => *slot = t,
        None => {}
    }
}

impl Backend for MemoryBackend {
    type File = MemFile;

    fn create(&self, path: &Path, mode: u32) -> VfsResult<()> {
        self.enter("create")?;
        self.tree
            .write()
            .insert(path, Node::new(FileKind::Regular, mode))?;
        Ok(())
    }

    fn mkdir(&self, path: &Path, mode: u32) -> VfsResult<()> {
        self.enter("mkdir")?;
        self.tree
            .write()
            .insert(path, Node::new(FileKind::Directory, mode))?;
        Ok(())
    }

    fn rmdir(&self, path: &Path) -> VfsResult<()> {
        self.enter("rmdir")?;
        let mut tree = self.tree.write();
        let (dir, leaf) = tree.parent_of(path)?;
        let ino = tree.resolve(path)?;
        let node = tree.node(ino)?;
        if node.kind != FileKind::Directory {
            return Err(VfsError::NotDirectory(path.display().to_string()));
        }
        if !node.children.is_empty() {
            return Err(VfsError::NotEmpty(path.display().to_string()));
        }
        tree.detach(dir, &leaf)?;
        tree.node_mut(ino)?.nlink = 0;
        tree.reap();
        Ok(())
    }

    fn unlink(&self, path: &Path) -> VfsResult<()> {
        self.enter("unlink")?;
        let mut tree = self.tree.write();
        let (dir, leaf) = tree.parent_of(path)?;
        let ino = tree.resolve(path)?;
        if tree.node(ino)?.kind == FileKind::Directory {
            return Err(VfsError::IsDirectory(path.display().to_string()));
        }
        tree.detach(dir, &leaf)?;
        tree.drop_link(ino)?;
        tree.reap();
        Ok(())
    }

    fn rename(&self, from: &Path, to: &Path) -> VfsResult<()> {
        self.enter("rename")?;
        let mut tree = self.tree.write();
        let (src_dir, src_leaf) = tree.parent_of(from)?;
        let (dst_dir, dst_leaf) = tree.parent_of(to)?;
        let ino = tree.resolve(from)?;
        let is_dir = tree.node(ino)?.kind == FileKind::Directory;
        if is_dir && to.starts_with(from) {
            return Err(VfsError::InvalidOperation(format!(
                "{} is inside {}",
                to.display(),
                from.display()
            )));
        }

        if let Some(&existing) = tree.node(dst_dir)?.children.get(&dst_leaf) {
            if existing == ino {
                return Ok(());
            }
            let victim = tree.node(existing)?;
            match (is_dir, victim.kind == FileKind::Directory) {
                (true, false) => return Err(VfsError::NotDirectory(to.display().to_string())),
                (false, true) => return Err(VfsError::IsDirectory(to.display().to_string())),
                (true, true) if !victim.children.is_empty() => {
                    return Err(VfsError::NotEmpty(to.display().to_string()))
                }
                _ => {}
            }
            tree.detach(dst_dir, &dst_leaf)?;
            if is_dir {
                tree.node_mut(existing)?.nlink = 0;
            } else {
                tree.drop_link(existing)?;
            }
        }

        tree.detach(src_dir, &src_leaf)?;
        tree.attach(dst_dir, dst_leaf, ino)?;
        tree.node_mut(ino)?.ctime = SystemTime::now();
        tree.reap();
        Ok(())
    }

    fn link(&self, existing: &Path, new: &Path) -> VfsResult<()> {
        self.enter("link")?;
        let mut tree = self.tree.write();
        let ino = tree.resolve(existing)?;
        if tree.node(ino)?.kind == FileKind::Directory {
            return Err(VfsError::PermissionDenied(existing.display().to_string()));
        }
        let (dir, leaf) = tree.parent_of(new)?;
        if tree.node(dir)?.children.contains_key(&leaf) {
            return Err(VfsError::Exists(new.display().to_string()));
        }
        tree.attach(dir, leaf, ino)?;
        let node = tree.node_mut(ino)?;
        node.nlink += 1;
        node.ctime = SystemTime::now();
        Ok(())
    }

    fn symlink(&self, target: &Path, link: &Path) -> VfsResult<()> {
        self.enter("symlink")?;
        let mut node = Node::new(FileKind::Symlink, 0o777);
        node.link_target = target.to_path_buf();
        self.tree.write().insert(link, node)?;
        Ok(())
    }

    fn readlink(&self, path: &Path) -> VfsResult<PathBuf> {
        self.enter("readlink")?;
        let tree = self.tree.read();
        let node = tree.node(tree.resolve(path)?)?;
        if node.kind != FileKind::Symlink {
            return Err(VfsError::InvalidOperation(path.display().to_string()));
        }
        Ok(node.link_target.clone())
    }

    fn lookup(&self, path: &Path) -> VfsResult<Attributes> {
        self.enter("lookup")?;
        let tree = self.tree.read();
        let ino = tree.resolve(path)?;
        Ok(tree.node(ino)?.attrs(ino))
    }

    fn open(&self, path: &Path, mode: OpenMode) -> VfsResult<MemFile> {
        self.enter("open")?;
        let tree = self.tree.read();
        let ino = tree.resolve(path)?;
        match tree.node(ino)?.kind {
            FileKind::Symlink => Err(VfsError::InvalidName(format!(
                "{} is a symlink",
                path.display()
            ))),
            FileKind::Directory if mode.write => {
                Err(VfsError::IsDirectory(path.display().to_string()))
            }
            _ => Ok(MemFile {
                ino,
                mode,
                _pin: Arc::clone(&tree.node(ino)?.pins),
            }),
        }
    }

    fn getattr(&self, file: &MemFile) -> VfsResult<Attributes> {
        self.enter("getattr")?;
        let tree = self.tree.read();
        Ok(tree.node(file.ino)?.attrs(file.ino))
    }

    fn read(&self, file: &MemFile, buf: &mut [u8], offset: u64) -> VfsResult<usize> {
        self.enter("read")?;
        if !file.mode.read {
            return Err(VfsError::InvalidOperation("not open for reading".into()));
        }
        let tree = self.tree.read();
        let node = tree.node(file.ino)?;
        if node.kind == FileKind::Directory {
            return Err(VfsError::IsDirectory(format!("inode {}", file.ino)));
        }
        let Ok(start) = usize::try_from(offset) else {
            return Ok(0);
        };
        if start >= node.data.len() {
            return Ok(0);
        }
        let n = buf.len().min(node.data.len() - start);
        buf[..n].copy_from_slice(&node.data[start..start + n]);
        Ok(n)
    }

    fn write(&self, file: &MemFile, data: &[u8], offset: u64) -> VfsResult<usize> {
        self.enter("write")?;
        if !file.mode.write {
            return Err(VfsError::InvalidOperation("not open for writing".into()));
        }
        if data.is_empty() {
            return Ok(0);
        }
        let end = offset
            .checked_add(data.len() as u64)
            .ok_or_else(|| VfsError::RangeTooLarge(format!("offset {offset}")))?;
        let mut tree = self.tree.write();
        let node = tree.node_mut(file.ino)?;
        if (node.data.len() as u64) < end {
            resize_data(&mut node.data, end)?;
        }
        // `end` fits in the buffer, so both bounds fit in usize.
        let start = offset as usize;
        node.data[start..start + data.len()].copy_from_slice(data);
        let now = SystemTime::now();
        node.mtime = now;
        node.ctime = now;
        Ok(data.len())
    }

    fn fsync(&self, file: &MemFile) -> VfsResult<()> {
        self.enter("fsync")?;
        self.tree.read().node(file.ino)?;
        Ok(())
    }

    fn fsync_range(&self, file: &MemFile, _offset: u64, _len: u64) -> VfsResult<()> {
        self.enter("fsync_range")?;
        self.tree.read().node(file.ino)?;
        Ok(())
    }

    fn allocate(&self, file: &MemFile, _len: u64) -> VfsResult<()> {
        self.enter("allocate")?;
        if !file.mode.write {
            return Err(VfsError::InvalidOperation("not open for writing".into()));
        }
        self.tree.read().node(file.ino)?;
        Ok(())
    }

    fn read_dir(&self, file: &MemFile) -> VfsResult<Vec<DirEntry>> {
        self.enter("read_dir")?;
        let tree = self.tree.read();
        let dir = tree.node(file.ino)?;
        if dir.kind != FileKind::Directory {
            return Err(VfsError::NotDirectory(format!("inode {}", file.ino)));
        }
        dir.children
            .iter()
            .map(|(name, &ino)| {
                Ok(DirEntry {
                    name: name.clone(),
                    ino,
                    kind: tree.node(ino)?.kind,
                })
            })
            .collect()
    }

    fn path_of(&self, file: &MemFile) -> VfsResult<PathBuf> {
        self.enter("path_of")?;
        let tree = self.tree.read();
        if file.ino == ROOT_INO {
            return Ok(PathBuf::new());
        }
        tree.path_of(ROOT_INO, file.ino)
            .ok_or_else(|| VfsError::NotFound(format!("inode {} has no name", file.ino)))
    }

    fn truncate(&self, target: Target<'_, MemFile>, size: u64) -> VfsResult<()> {
        self.enter("truncate")?;
        let mut tree = self.tree.write();
        let ino = Self::target_ino(&tree, target)?;
        let node = tree.node_mut(ino)?;
        match node.kind {
            FileKind::Regular => {}
            FileKind::Directory => return Err(VfsError::IsDirectory(format!("inode {ino}"))),
            _ => return Err(VfsError::InvalidOperation(format!("inode {ino}"))),
        }
        resize_data(&mut node.data, size)?;
        let now = SystemTime::now();
        node.mtime = now;
        node.ctime = now;
        Ok(())
    }

    fn setattr(&self, target: Target<'_, MemFile>, changes: &AttrChangeSet) -> VfsResult<()> {
        self.enter("setattr")?;
        let mut tree = self.tree.write();
        let ino = Self::target_ino(&tree, target)?;
        let node = tree.node_mut(ino)?;

        if changes.size.is_some() && node.kind != FileKind::Regular {
            return Err(VfsError::InvalidOperation(format!("inode {ino}")));
        }

        // The size is the only step that can fail, so it goes first.
        let now = SystemTime::now();
        if let Some(size) = changes.size {
            resize_data(&mut node.data, size)?;
            node.mtime = now;
        }
        if let Some(uid) = changes.uid {
            node.uid = uid;
        }
        if let Some(gid) = changes.gid {
            node.gid = gid;
        }
        node.mode = changes.resulting_mode(node.mode);
        apply_time(&mut node.atime, changes.atime, now);
        apply_time(&mut node.mtime, changes.mtime, now);
        node.ctime = now;
        Ok(())
    }

    fn sync_metadata(&self, target: Target<'_, MemFile>) -> VfsResult<()> {
        self.enter("sync_metadata")?;
        Self::target_ino(&self.tree.read(), target)?;
        Ok(())
    }

    fn listxattr(&self, target: Target<'_, MemFile>, capacity: usize) -> VfsResult<Vec<u8>> {
        self.enter("listxattr")?;
        let tree = self.tree.read();
        let node = tree.node(Self::target_ino(&tree, target)?)?;
        let mut list = Vec::new();
        for name in node.xattrs.keys() {
            list.extend_from_slice(name.as_bytes());
            list.push(0);
        }
        if list.len() > capacity {
            return Err(VfsError::RangeTooLarge(format!(
                "attribute list is {} bytes, limit {}",
                list.len(),
                capacity
            )));
        }
        Ok(list)
    }

    fn xattr_len(&self, target: Target<'_, MemFile>, name: &str) -> VfsResult<usize> {
        self.enter("xattr_len")?;
        let tree = self.tree.read();
        let node = tree.node(Self::target_ino(&tree, target)?)?;
        node.xattrs
            .get(name)
            .map(Vec::len)
            .ok_or_else(|| VfsError::NotFound(name.to_string()))
    }

    fn getxattr(
        &self,
        target: Target<'_, MemFile>,
        name: &str,
        capacity: usize,
    ) -> VfsResult<Vec<u8>> {
        self.enter("getxattr")?;
        let tree = self.tree.read();
        let node = tree.node(Self::target_ino(&tree, target)?)?;
        let value = node
            .xattrs
            .get(name)
            .ok_or_else(|| VfsError::NotFound(name.to_string()))?;
        if value.len() > capacity {
            return Err(VfsError::RangeTooLarge(name.to_string()));
        }
        Ok(value.clone())
    }

    fn setxattr(
        &self,
        target: Target<'_, MemFile>,
        name: &str,
        value: &[u8],
        flags: XattrFlags,
    ) -> VfsResult<()> {
        self.enter("setxattr")?;
        if name.is_empty() {
            return Err(VfsError::InvalidOperation("empty attribute name".into()));
        }
        let mut tree = self.tree.write();
        let ino = Self::target_ino(&tree, target)?;
        let node = tree.node_mut(ino)?;
        let exists = node.xattrs.contains_key(name);
        if exists && flags.contains(XattrFlags::CREATE) {
            return Err(VfsError::Exists(name.to_string()));
        }
        if !exists && flags.contains(XattrFlags::REPLACE) {
            return Err(VfsError::NotFound(name.to_string()));
        }
        node.xattrs.insert(name.to_string(), value.to_vec());
        node.ctime = SystemTime::now();
        Ok(())
    }

    fn removexattr(&self, target: Target<'_, MemFile>, name: &str) -> VfsResult<()> {
        self.enter("removexattr")?;
        let mut tree = self.tree.write();
        let ino = Self::target_ino(&tree, target)?;
        let node = tree.node_mut(ino)?;
        node.xattrs
            .remove(name)
            .ok_or_else(|| VfsError::NotFound(name.to_string()))?;
        node.ctime = SystemTime::now();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(s: &str) -> &Path {
        Path::new(s)
    }

    #[test]
    fn test_tree_basics() {
        let fs = MemoryBackend::new();
        fs.mkdir(p("d"), 0o750).unwrap();
        fs.create(p("d/f"), 0o600).unwrap();
        let attrs = fs.lookup(p("d/f")).unwrap();
        assert_eq!(attrs.mode, S_IFREG | 0o600);
        assert_eq!(fs.lookup(p("")).unwrap().kind, FileKind::Directory);
        assert!(matches!(fs.lookup(p("d/f/x")), Err(VfsError::NotDirectory(_))));
        assert!(matches!(fs.lookup(p("d/g")), Err(VfsError::NotFound(_))));
    }

    #[test]
    fn test_open_file_survives_unlink() {
        let fs = MemoryBackend::new();
        fs.create(p("f"), 0o644).unwrap();
        let file = fs.open(p("f"), OpenMode::READ_WRITE).unwrap();
        fs.write(&file, b"abc", 0).unwrap();
        fs.unlink(p("f")).unwrap();

        let mut buf = [0u8; 8];
        assert_eq!(fs.read(&file, &mut buf, 0).unwrap(), 3);
        assert_eq!(fs.getattr(&file).unwrap().nlink, 0);
    }

    #[test]
    fn test_rename_replaces_and_checks_types() {
        let fs = MemoryBackend::new();
        fs.create(p("a"), 0o644).unwrap();
        fs.create(p("b"), 0o644).unwrap();
        fs.mkdir(p("d"), 0o755).unwrap();
        fs.create(p("d/x"), 0o644).unwrap();
        fs.mkdir(p("e"), 0o755).unwrap();

        let a = fs.lookup(p("a")).unwrap().node;
        fs.rename(p("a"), p("b")).unwrap();
        assert_eq!(fs.lookup(p("b")).unwrap().node, a);

        assert!(matches!(fs.rename(p("b"), p("d")), Err(VfsError::IsDirectory(_))));
        assert!(matches!(fs.rename(p("e"), p("b")), Err(VfsError::NotDirectory(_))));
        assert!(matches!(fs.rename(p("e"), p("d")), Err(VfsError::NotEmpty(_))));
        assert!(matches!(
            fs.rename(p("d"), p("d/x/y")),
            Err(VfsError::InvalidOperation(_))
        ));
    }

    #[test]
    fn test_setattr_is_all_or_nothing() {
        let fs = MemoryBackend::new();
        fs.mkdir(p("d"), 0o755).unwrap();
        let changes = AttrChangeSet {
            mode: Some(S_IFDIR | 0o700),
            size: Some(1),
            ..Default::default()
        };
        assert!(fs.setattr(Target::Path(p("d")), &changes).is_err());
        assert_eq!(fs.lookup(p("d")).unwrap().mode, S_IFDIR | 0o755);
    }

    #[test]
    fn test_xattr_flags() {
        let fs = MemoryBackend::new();
        fs.create(p("f"), 0o644).unwrap();
        let f = Target::Path(p("f"));
        assert!(matches!(
            fs.setxattr(f, "user.a", b"1", XattrFlags::REPLACE),
            Err(VfsError::NotFound(_))
        ));
        fs.setxattr(f, "user.a", b"1", XattrFlags::CREATE).unwrap();
        fs.setxattr(f, "user.a", b"22", XattrFlags::REPLACE).unwrap();
        assert_eq!(fs.xattr_len(f, "user.a").unwrap(), 2);
        assert!(matches!(
            fs.getxattr(f, "user.a", 1),
            Err(VfsError::RangeTooLarge(_))
        ));
        assert_eq!(fs.listxattr(f, 64).unwrap(), b"user.a\0");
    }

    #[test]
    fn test_huge_sizes_are_refused() {
        let fs = MemoryBackend::new();
        fs.create(p("f"), 0o644).unwrap();
        let file = fs.open(p("f"), OpenMode::READ_WRITE).unwrap();
        assert!(matches!(
            fs.write(&file, b"x", u64::MAX - 1),
            Err(VfsError::RangeTooLarge(_))
        ));
        assert!(matches!(
            fs.write(&file, b"xy", u64::MAX),
            Err(VfsError::RangeTooLarge(_))
        ));
        assert!(matches!(
            fs.truncate(Target::File(&file), u64::MAX),
            Err(VfsError::RangeTooLarge(_))
        ));
        let changes = AttrChangeSet {
            size: Some(u64::MAX / 2 + 1),
            mode: Some(S_IFREG | 0o600),
            ..Default::default()
        };
        assert!(fs.setattr(Target::File(&file), &changes).is_err());

        let attrs = fs.getattr(&file).unwrap();
        assert_eq!(attrs.size, 0);
        assert_eq!(attrs.mode, S_IFREG | 0o644);
    }

    #[test]
    fn test_unlinked_nodes_are_reclaimed_after_close() {
        let fs = MemoryBackend::new();
        fs.create(p("open"), 0o644).unwrap();
        fs.create(p("closed"), 0o644).unwrap();
        fs.mkdir(p("d"), 0o755).unwrap();
        let file = fs.open(p("open"), OpenMode::READ).unwrap();
        let nodes = || fs.tree.read().nodes.len();
        assert_eq!(nodes(), 4);

        fs.unlink(p("closed")).unwrap();
        fs.rmdir(p("d")).unwrap();
        fs.unlink(p("open")).unwrap();
        assert_eq!(nodes(), 2);

        drop(file);
        fs.create(p("g"), 0o644).unwrap();
        assert_eq!(nodes(), 2);
    }

    #[test]
    fn test_path_of_follows_renames() {
        let fs = MemoryBackend::new();
        fs.mkdir(p("a"), 0o755).unwrap();
        fs.create(p("a/f"), 0o644).unwrap();
        let file = fs.open(p("a/f"), OpenMode::READ).unwrap();
        fs.rename(p("a"), p("b")).unwrap();
        assert_eq!(fs.path_of(&file).unwrap(), PathBuf::from("b/f"));
        fs.unlink(p("b/f")).unwrap();
        assert!(matches!(fs.path_of(&file), Err(VfsError::NotFound(_))));
    }

    #[test]
    fn test_injected_failure_is_counted() {
        let fs = MemoryBackend::new();
        fs.inject_failure("mkdir", VfsError::NoSpace("full".into()));
        assert!(matches!(fs.mkdir(p("d"), 0o755), Err(VfsError::NoSpace(_))));
        assert_eq!(fs.op_count("mkdir"), 1);
        fs.clear_failure("mkdir");
        fs.mkdir(p("d"), 0o755).unwrap();
    }
}
