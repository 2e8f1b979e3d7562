//! The ext-style filesystem: inode table, directories, symlinks and hard
//! links. Trees live in memory (on-disk format compatibility is out of
//! scope); the backing device is remembered for `stat` and diagnostics.

use alloc::{
    collections::btree_map::BTreeMap,
    string::{String, ToString},
    sync::Arc,
    vec::Vec,
};

use axerrno::{LinuxError, LinuxResult};
use slab::Slab;
use spin::Mutex;

use super::{AccessMode, DirEntryInfo, FileStat, FsHandle, FsOps, NodeType, TimeSpec};
use crate::config::SYMLINK_HOPS;

enum NodeKind {
    File(Vec<u8>),
    Dir {
        entries: BTreeMap<String, usize>,
        parent: usize,
    },
    Symlink(String),
    CharDev(u32),
    BlockDev(u32),
}

struct Node {
    kind: NodeKind,
    mode: u32,
    nlink: u32,
    atime: TimeSpec,
    mtime: TimeSpec,
    ctime: TimeSpec,
}

impl Node {
    fn new(kind: NodeKind, mode: u32) -> Self {
        let now = TimeSpec::now();
        Self {
            kind,
            mode,
            nlink: 1,
            atime: now,
            mtime: now,
            ctime: now,
        }
    }

    fn node_type(&self) -> NodeType {
        match &self.kind {
            NodeKind::File(_) => NodeType::Regular,
            NodeKind::Dir { .. } => NodeType::Directory,
            NodeKind::Symlink(_) => NodeType::Symlink,
            NodeKind::CharDev(_) => NodeType::CharDevice,
            NodeKind::BlockDev(_) => NodeType::BlockDevice,
        }
    }

    fn size(&self) -> u64 {
        match &self.kind {
            NodeKind::File(data) => data.len() as u64,
            NodeKind::Dir { entries, .. } => entries.len() as u64,
            NodeKind::Symlink(target) => target.len() as u64,
            _ => 0,
        }
    }
}

struct OpenNode {
    node: usize,
    path: String,
}

struct Inner {
    nodes: Slab<Node>,
    handles: Slab<OpenNode>,
    root: usize,
}

impl Inner {
    /// Walk `path` from the root. Intermediate symlinks are spliced within
    /// this filesystem; the final component is never followed.
    fn resolve(&self, path: &str) -> LinuxResult<usize> {
        self.resolve_from(self.root, path, 0)
    }

    fn resolve_from(&self, start: usize, path: &str, depth: usize) -> LinuxResult<usize> {
        if depth > SYMLINK_HOPS {
            return Err(LinuxError::ELOOP);
        }
        let mut at = start;
        let mut components = path.split('/').filter(|c| !c.is_empty()).peekable();
        while let Some(comp) = components.next() {
            let node = self.nodes.get(at).ok_or(LinuxError::ENOENT)?;
            let NodeKind::Dir { entries, parent } = &node.kind else {
                return Err(LinuxError::ENOTDIR);
            };
            let next = match comp {
                "." => at,
                ".." => *parent,
                name => *entries.get(name).ok_or(LinuxError::ENOENT)?,
            };
            // Follow symlinks only in the middle of the path.
            if components.peek().is_some()
                && let Some(Node {
                    kind: NodeKind::Symlink(target),
                    ..
                }) = self.nodes.get(next)
            {
                let base = if target.starts_with('/') {
                    self.root
                } else {
                    at
                };
                let rest: String = components.collect::<Vec<_>>().join("/");
                let mut full = target.clone();
                full.push('/');
                full.push_str(&rest);
                return self.resolve_from(base, &full, depth + 1);
            }
            at = next;
        }
        Ok(at)
    }

    /// Resolve the parent directory of `path` and the final name.
    fn resolve_parent<'a>(&self, path: &'a str) -> LinuxResult<(usize, &'a str)> {
        let name = super::path::file_name(path);
        if name.is_empty() || name == "." || name == ".." {
            return Err(LinuxError::EINVAL);
        }
        let parent = self.resolve(super::path::parent(path))?;
        match self.nodes.get(parent).map(|n| &n.kind) {
            Some(NodeKind::Dir { .. }) => Ok((parent, name)),
            Some(_) => Err(LinuxError::ENOTDIR),
            None => Err(LinuxError::ENOENT),
        }
    }

    fn handle_refs(&self, node: usize) -> usize {
        self.handles.iter().filter(|(_, o)| o.node == node).count()
    }

    /// Drop a node once nothing names it and nothing holds it open.
    fn reap(&mut self, node: usize) {
        let dead =
            self.nodes.get(node).is_some_and(|n| n.nlink == 0) && self.handle_refs(node) == 0;
        if dead {
            self.nodes.remove(node);
        }
    }
}

/// An ext-style filesystem instance.
pub struct ExtFs {
    inner: Mutex<Inner>,
    device: u32,
}

impl ExtFs {
    /// A fresh, empty filesystem backed by device `device`.
    pub fn new(device: u32) -> Arc<Self> {
        let mut nodes = Slab::new();
        let root = nodes.insert(Node::new(
            NodeKind::Dir {
                entries: BTreeMap::new(),
                parent: 0,
            },
            0o755,
        ));
        // The root is its own parent.
        if let Some(Node {
            kind: NodeKind::Dir { parent, .. },
            ..
        }) = nodes.get_mut(root)
        {
            *parent = root;
        }
        Arc::new(Self {
            inner: Mutex::new(Inner {
                nodes,
                handles: Slab::new(),
                root,
            }),
            device,
        })
    }

    /// The backing device handle.
    pub fn device(&self) -> u32 {
        self.device
    }

    fn stat_node(&self, node: &Node, ino: u64) -> FileStat {
        let rdev = match node.kind {
            NodeKind::CharDev(dev) | NodeKind::BlockDev(dev) => dev,
            _ => 0,
        };
        FileStat {
            ino,
            mode: node.mode,
            node_type: node.node_type(),
            nlink: node.nlink,
            rdev,
            size: node.size(),
            atime: node.atime,
            mtime: node.mtime,
            ctime: node.ctime,
            io_block_size: 4096,
            io_block_count: node.size().div_ceil(4096),
        }
    }

    /// Pull the device handle out of a device node, releasing the lock
    /// before the registry is called (device locks order before fs locks).
    fn device_of(&self, handle: FsHandle) -> Option<u32> {
        let inner = self.inner.lock();
        let open = inner.handles.get(handle as usize)?;
        match inner.nodes.get(open.node)?.kind {
            NodeKind::CharDev(dev) | NodeKind::BlockDev(dev) => Some(dev),
            _ => None,
        }
    }
}

impl FsOps for ExtFs {
    fn kind(&self) -> &'static str {
        "ext"
    }

    fn open(&self, path: &str, _mode: AccessMode) -> LinuxResult<FsHandle> {
        let mut inner = self.inner.lock();
        let node = inner.resolve(path)?;
        Ok(inner.handles.insert(OpenNode {
            node,
            path: path.to_string(),
        }) as FsHandle)
    }

    fn close(&self, handle: FsHandle) {
        let mut inner = self.inner.lock();
        if inner.handles.contains(handle as usize) {
            let open = inner.handles.remove(handle as usize);
            inner.reap(open.node);
        }
    }

    fn read(&self, handle: FsHandle, offset: u64, buf: &mut [u8]) -> LinuxResult<usize> {
        if let Some(dev) = self.device_of(handle) {
            return crate::dev::read(dev, offset, buf);
        }
        let inner = self.inner.lock();
        let open = inner.handles.get(handle as usize).ok_or(LinuxError::EBADF)?;
        let node = inner.nodes.get(open.node).ok_or(LinuxError::ENOENT)?;
        match &node.kind {
            NodeKind::File(data) => {
                let start = (offset as usize).min(data.len());
                let n = buf.len().min(data.len() - start);
                buf[..n].copy_from_slice(&data[start..start + n]);
                Ok(n)
            }
            NodeKind::Dir { .. } => Err(LinuxError::EISDIR),
            _ => Err(LinuxError::EINVAL),
        }
    }

    fn write(&self, handle: FsHandle, offset: u64, buf: &[u8]) -> LinuxResult<usize> {
        if let Some(dev) = self.device_of(handle) {
            return crate::dev::write(dev, offset, buf);
        }
        let mut inner = self.inner.lock();
        let open = inner.handles.get(handle as usize).ok_or(LinuxError::EBADF)?;
        let node_idx = open.node;
        let node = inner.nodes.get_mut(node_idx).ok_or(LinuxError::ENOENT)?;
        match &mut node.kind {
            NodeKind::File(data) => {
                let end = offset as usize + buf.len();
                if data.len() < end {
                    data.resize(end, 0);
                }
                data[offset as usize..end].copy_from_slice(buf);
                node.mtime = TimeSpec::now();
                Ok(buf.len())
            }
            NodeKind::Dir { .. } => Err(LinuxError::EISDIR),
            _ => Err(LinuxError::EINVAL),
        }
    }

    fn stat(&self, handle: FsHandle) -> LinuxResult<FileStat> {
        let inner = self.inner.lock();
        let open = inner.handles.get(handle as usize).ok_or(LinuxError::EBADF)?;
        let node = inner.nodes.get(open.node).ok_or(LinuxError::ENOENT)?;
        Ok(self.stat_node(node, open.node as u64 + 2))
    }

    fn ioctl(&self, handle: FsHandle, cmd: u32, arg: usize) -> LinuxResult<usize> {
        match self.device_of(handle) {
            Some(dev) => crate::dev::ioctl(dev, cmd, arg),
            None => Err(LinuxError::ENOTTY),
        }
    }

    fn mmap(&self, handle: FsHandle, offset: u64, len: usize) -> LinuxResult<u64> {
        match self.device_of(handle) {
            Some(dev) => crate::dev::mmap(dev, offset, len),
            None => Err(LinuxError::EOPNOTSUPP),
        }
    }

    fn munmap(&self, handle: FsHandle, offset: u64, len: usize) -> LinuxResult<()> {
        match self.device_of(handle) {
            Some(dev) => crate::dev::munmap(dev, offset, len),
            None => Ok(()),
        }
    }

    fn truncate(&self, handle: FsHandle, size: u64) -> LinuxResult<()> {
        let mut inner = self.inner.lock();
        let open = inner.handles.get(handle as usize).ok_or(LinuxError::EBADF)?;
        let node_idx = open.node;
        let node = inner.nodes.get_mut(node_idx).ok_or(LinuxError::ENOENT)?;
        match &mut node.kind {
            NodeKind::File(data) => {
                data.resize(size as usize, 0);
                node.mtime = TimeSpec::now();
                Ok(())
            }
            _ => Err(LinuxError::EINVAL),
        }
    }

    fn unlink(&self, path: &str) -> LinuxResult<()> {
        let mut inner = self.inner.lock();
        let (parent, name) = inner.resolve_parent(path)?;
        let Some(NodeKind::Dir { entries, .. }) =
            inner.nodes.get_mut(parent).map(|n| &mut n.kind)
        else {
            return Err(LinuxError::ENOTDIR);
        };
        let target = *entries.get(name).ok_or(LinuxError::ENOENT)?;
        if let Some(Node {
            kind: NodeKind::Dir { entries: sub, .. },
            ..
        }) = inner.nodes.get(target)
            && !sub.is_empty()
        {
            return Err(LinuxError::ENOTEMPTY);
        }
        if let Some(NodeKind::Dir { entries, .. }) =
            inner.nodes.get_mut(parent).map(|n| &mut n.kind)
        {
            entries.remove(name);
        }
        if let Some(node) = inner.nodes.get_mut(target) {
            node.nlink = node.nlink.saturating_sub(1);
            node.ctime = TimeSpec::now();
        }
        inner.reap(target);
        Ok(())
    }

    fn rename(&self, src: &str, dst: &str, keep: bool) -> LinuxResult<()> {
        if src == dst {
            return Ok(());
        }
        let mut inner = self.inner.lock();
        let (src_parent, src_name) = inner.resolve_parent(src)?;
        let (dst_parent, dst_name) = inner.resolve_parent(dst)?;

        let moved = {
            let Some(NodeKind::Dir { entries, .. }) =
                inner.nodes.get_mut(src_parent).map(|n| &mut n.kind)
            else {
                return Err(LinuxError::ENOTDIR);
            };
            *entries.get(src_name).ok_or(LinuxError::ENOENT)?
        };

        let replaced = {
            let Some(NodeKind::Dir { entries, .. }) =
                inner.nodes.get_mut(dst_parent).map(|n| &mut n.kind)
            else {
                return Err(LinuxError::ENOTDIR);
            };
            if keep && entries.contains_key(dst_name) {
                return Err(LinuxError::EEXIST);
            }
            entries.insert(dst_name.to_string(), moved)
        };

        if let Some(NodeKind::Dir { entries, .. }) =
            inner.nodes.get_mut(src_parent).map(|n| &mut n.kind)
        {
            entries.remove(src_name);
        }
        if let Some(old) = replaced
            && old != moved
        {
            if let Some(node) = inner.nodes.get_mut(old) {
                node.nlink = node.nlink.saturating_sub(1);
            }
            inner.reap(old);
        }
        Ok(())
    }

    fn create_node(&self, path: &str, node_type: NodeType, mode: u32) -> LinuxResult<()> {
        let mut inner = self.inner.lock();
        let (parent, name) = inner.resolve_parent(path)?;
        {
            let Some(NodeKind::Dir { entries, .. }) = inner.nodes.get(parent).map(|n| &n.kind)
            else {
                return Err(LinuxError::ENOTDIR);
            };
            if entries.contains_key(name) {
                return Err(LinuxError::EEXIST);
            }
        }
        let kind = match node_type {
            NodeType::Regular => NodeKind::File(Vec::new()),
            NodeType::Directory => NodeKind::Dir {
                entries: BTreeMap::new(),
                parent,
            },
            // Device nodes carry their handle in the low mode bits, as
            // written by `mknod`.
            NodeType::CharDevice => NodeKind::CharDev(mode >> 16),
            NodeType::BlockDevice => NodeKind::BlockDev(mode >> 16),
            NodeType::Symlink => return Err(LinuxError::EINVAL),
        };
        let node = inner.nodes.insert(Node::new(kind, mode & 0o7777));
        if let Some(NodeKind::Dir { entries, .. }) =
            inner.nodes.get_mut(parent).map(|n| &mut n.kind)
        {
            entries.insert(name.to_string(), node);
        }
        Ok(())
    }

    fn create_symlink(&self, path: &str, target: &str) -> LinuxResult<()> {
        let mut inner = self.inner.lock();
        let (parent, name) = inner.resolve_parent(path)?;
        {
            let Some(NodeKind::Dir { entries, .. }) = inner.nodes.get(parent).map(|n| &n.kind)
            else {
                return Err(LinuxError::ENOTDIR);
            };
            if entries.contains_key(name) {
                return Err(LinuxError::EEXIST);
            }
        }
        let node = inner
            .nodes
            .insert(Node::new(NodeKind::Symlink(target.to_string()), 0o777));
        if let Some(NodeKind::Dir { entries, .. }) =
            inner.nodes.get_mut(parent).map(|n| &mut n.kind)
        {
            entries.insert(name.to_string(), node);
        }
        Ok(())
    }

    fn create_hard_link(&self, path: &str, target: &str) -> LinuxResult<()> {
        let mut inner = self.inner.lock();
        let target_node = inner.resolve(target)?;
        if matches!(
            inner.nodes.get(target_node).map(|n| &n.kind),
            Some(NodeKind::Dir { .. })
        ) {
            return Err(LinuxError::EPERM);
        }
        let (parent, name) = inner.resolve_parent(path)?;
        {
            let Some(NodeKind::Dir { entries, .. }) = inner.nodes.get(parent).map(|n| &n.kind)
            else {
                return Err(LinuxError::ENOTDIR);
            };
            if entries.contains_key(name) {
                return Err(LinuxError::EEXIST);
            }
        }
        if let Some(NodeKind::Dir { entries, .. }) =
            inner.nodes.get_mut(parent).map(|n| &mut n.kind)
        {
            entries.insert(name.to_string(), target_node);
        }
        if let Some(node) = inner.nodes.get_mut(target_node) {
            node.nlink += 1;
            node.ctime = TimeSpec::now();
        }
        Ok(())
    }

    fn read_symbolic_link(&self, path: &str) -> LinuxResult<String> {
        let inner = self.inner.lock();
        let node = inner.resolve(path)?;
        match inner.nodes.get(node).map(|n| &n.kind) {
            Some(NodeKind::Symlink(target)) => Ok(target.clone()),
            Some(_) => Err(LinuxError::EINVAL),
            None => Err(LinuxError::ENOENT),
        }
    }

    fn read_entries(&self, handle: FsHandle) -> LinuxResult<Vec<DirEntryInfo>> {
        let inner = self.inner.lock();
        let open = inner.handles.get(handle as usize).ok_or(LinuxError::EBADF)?;
        let node = inner.nodes.get(open.node).ok_or(LinuxError::ENOENT)?;
        let NodeKind::Dir { entries, parent } = &node.kind else {
            return Err(LinuxError::ENOTDIR);
        };
        let mut out = Vec::with_capacity(entries.len() + 2);
        out.push(DirEntryInfo {
            ino: open.node as u64 + 2,
            name: ".".to_string(),
            node_type: NodeType::Directory,
        });
        out.push(DirEntryInfo {
            ino: *parent as u64 + 2,
            name: "..".to_string(),
            node_type: NodeType::Directory,
        });
        for (name, idx) in entries {
            let node_type = inner
                .nodes
                .get(*idx)
                .map_or(NodeType::Regular, Node::node_type);
            out.push(DirEntryInfo {
                ino: *idx as u64 + 2,
                name: name.clone(),
                node_type,
            });
        }
        Ok(out)
    }

    fn get_path(&self, handle: FsHandle) -> LinuxResult<String> {
        let inner = self.inner.lock();
        inner
            .handles
            .get(handle as usize)
            .map(|o| o.path.clone())
            .ok_or(LinuxError::EBADF)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fs() -> Arc<ExtFs> {
        ExtFs::new(0)
    }

    fn write_file(fs: &ExtFs, path: &str, data: &[u8]) {
        fs.create_node(path, NodeType::Regular, 0o644).unwrap();
        let h = fs.open(path, AccessMode::WRITE).unwrap();
        assert_eq!(fs.write(h, 0, data).unwrap(), data.len());
        fs.close(h);
    }

    #[test]
    fn create_write_read() {
        let fs = fs();
        write_file(&fs, "/motd", b"hello");
        let h = fs.open("/motd", AccessMode::READ).unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(fs.read(h, 0, &mut buf).unwrap(), 5);
        assert_eq!(&buf[..5], b"hello");
        assert_eq!(fs.read(h, 5, &mut buf).unwrap(), 0);
        assert_eq!(fs.stat(h).unwrap().size, 5);
        fs.close(h);
    }

    #[test]
    fn directories_and_entries() {
        let fs = fs();
        fs.create_node("/etc", NodeType::Directory, 0o755).unwrap();
        write_file(&fs, "/etc/motd", b"x");
        let h = fs.open("/etc", AccessMode::READ).unwrap();
        let names: Vec<_> = fs
            .read_entries(h)
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names, [".", "..", "motd"]);
        fs.close(h);
        assert!(matches!(
            fs.create_node("/etc/motd", NodeType::Regular, 0o644),
            Err(LinuxError::EEXIST)
        ));
    }

    #[test]
    fn symlinks_resolve_in_the_middle() {
        let fs = fs();
        fs.create_node("/usr", NodeType::Directory, 0o755).unwrap();
        fs.create_node("/usr/bin", NodeType::Directory, 0o755)
            .unwrap();
        write_file(&fs, "/usr/bin/sh", b"#!");
        fs.create_symlink("/bin", "/usr/bin").unwrap();

        let h = fs.open("/bin/sh", AccessMode::READ).unwrap();
        assert_eq!(fs.stat(h).unwrap().node_type, NodeType::Regular);
        fs.close(h);

        // Final component is not followed.
        let h = fs.open("/bin", AccessMode::READ).unwrap();
        assert_eq!(fs.stat(h).unwrap().node_type, NodeType::Symlink);
        fs.close(h);
        assert_eq!(fs.read_symbolic_link("/bin").unwrap(), "/usr/bin");
    }

    #[test]
    fn hard_links_share_the_node() {
        let fs = fs();
        write_file(&fs, "/a", b"shared");
        fs.create_hard_link("/b", "/a").unwrap();

        let h = fs.open("/b", AccessMode::READ).unwrap();
        assert_eq!(fs.stat(h).unwrap().nlink, 2);
        fs.close(h);

        fs.unlink("/a").unwrap();
        let h = fs.open("/b", AccessMode::READ).unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(fs.read(h, 0, &mut buf).unwrap(), 6);
        assert_eq!(fs.stat(h).unwrap().nlink, 1);
        fs.close(h);
    }

    #[test]
    fn rename_with_keep() {
        let fs = fs();
        write_file(&fs, "/a", b"1");
        write_file(&fs, "/b", b"2");
        assert!(matches!(
            fs.rename("/a", "/b", true),
            Err(LinuxError::EEXIST)
        ));
        fs.rename("/a", "/c", true).unwrap();
        assert!(fs.open("/a", AccessMode::READ).is_err());
        fs.rename("/c", "/b", false).unwrap();
        let h = fs.open("/b", AccessMode::READ).unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(fs.read(h, 0, &mut buf).unwrap(), 1);
        assert_eq!(buf[0], b'1');
        fs.close(h);
    }

    #[test]
    fn unlink_refuses_nonempty_dirs() {
        let fs = fs();
        fs.create_node("/d", NodeType::Directory, 0o755).unwrap();
        write_file(&fs, "/d/f", b"x");
        assert!(matches!(fs.unlink("/d"), Err(LinuxError::ENOTEMPTY)));
        fs.unlink("/d/f").unwrap();
        fs.unlink("/d").unwrap();
        assert!(fs.open("/d", AccessMode::READ).is_err());
    }
}
