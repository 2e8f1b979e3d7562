//! The FAT-style filesystem: flat files and directories with
//! case-insensitive names. No symlinks, no hard links, no device nodes;
//! those operations report `not supported` instead of faking success.

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

const FAT_NAME_MAX: usize = 255;

enum NodeKind {
    File(Vec<u8>),
    Dir {
        entries: BTreeMap<String, usize>,
        parent: usize,
    },
}

struct Node {
    kind: NodeKind,
    mtime: TimeSpec,
    ctime: TimeSpec,
}

impl Node {
    fn new(kind: NodeKind) -> Self {
        let now = TimeSpec::now();
        Self {
            kind,
            mtime: now,
            ctime: now,
        }
    }

    fn node_type(&self) -> NodeType {
        match self.kind {
            NodeKind::File(_) => NodeType::Regular,
            NodeKind::Dir { .. } => NodeType::Directory,
        }
    }

    fn size(&self) -> u64 {
        match &self.kind {
            NodeKind::File(data) => data.len() as u64,
            NodeKind::Dir { entries, .. } => entries.len() as u64,
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

fn lookup(entries: &BTreeMap<String, usize>, name: &str) -> Option<usize> {
    entries.iter().find_map(|(key, idx)| {
        if key.eq_ignore_ascii_case(name) {
            Some(*idx)
        } else {
            None
        }
    })
}

impl Inner {
    fn resolve(&self, path: &str) -> LinuxResult<usize> {
        let mut at = self.root;
        for comp in path.split('/').filter(|c| !c.is_empty()) {
            let node = self.nodes.get(at).ok_or(LinuxError::ENOENT)?;
            let NodeKind::Dir { entries, parent } = &node.kind else {
                return Err(LinuxError::ENOTDIR);
            };
            at = match comp {
                "." => at,
                ".." => *parent,
                name => lookup(entries, name).ok_or(LinuxError::ENOENT)?,
            };
        }
        Ok(at)
    }

    fn resolve_parent<'a>(&self, path: &'a str) -> LinuxResult<(usize, &'a str)> {
        let name = super::path::file_name(path);
        if name.is_empty() || name == "." || name == ".." {
            return Err(LinuxError::EINVAL);
        }
        if name.len() > FAT_NAME_MAX {
            return Err(LinuxError::ENAMETOOLONG);
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
}

/// A FAT-style filesystem instance.
pub struct FatFs {
    inner: Mutex<Inner>,
    device: u32,
}

impl FatFs {
    /// A fresh, empty filesystem backed by device `device`.
    pub fn new(device: u32) -> Arc<Self> {
        let mut nodes = Slab::new();
        let root = nodes.insert(Node::new(NodeKind::Dir {
            entries: BTreeMap::new(),
            parent: 0,
        }));
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

    pub fn device(&self) -> u32 {
        self.device
    }
}

impl FsOps for FatFs {
    fn kind(&self) -> &'static str {
        "fat"
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
            inner.handles.remove(handle as usize);
        }
    }

    fn read(&self, handle: FsHandle, offset: u64, buf: &mut [u8]) -> LinuxResult<usize> {
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
        }
    }

    fn write(&self, handle: FsHandle, offset: u64, buf: &[u8]) -> LinuxResult<usize> {
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
        }
    }

    fn stat(&self, handle: FsHandle) -> LinuxResult<FileStat> {
        let inner = self.inner.lock();
        let open = inner.handles.get(handle as usize).ok_or(LinuxError::EBADF)?;
        let node = inner.nodes.get(open.node).ok_or(LinuxError::ENOENT)?;
        Ok(FileStat {
            ino: open.node as u64 + 2,
            mode: 0o777,
            node_type: node.node_type(),
            nlink: 1,
            rdev: 0,
            size: node.size(),
            atime: node.mtime,
            mtime: node.mtime,
            ctime: node.ctime,
            io_block_size: 512,
            io_block_count: node.size().div_ceil(512),
        })
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
            NodeKind::Dir { .. } => Err(LinuxError::EINVAL),
        }
    }

    fn unlink(&self, path: &str) -> LinuxResult<()> {
        let mut inner = self.inner.lock();
        let (parent, name) = inner.resolve_parent(path)?;
        let target = {
            let Some(NodeKind::Dir { entries, .. }) = inner.nodes.get(parent).map(|n| &n.kind)
            else {
                return Err(LinuxError::ENOTDIR);
            };
            lookup(entries, name).ok_or(LinuxError::ENOENT)?
        };
        if let Some(NodeKind::Dir { entries, .. }) = inner.nodes.get(target).map(|n| &n.kind)
            && !entries.is_empty()
        {
            return Err(LinuxError::ENOTEMPTY);
        }
        if inner.handle_refs(target) > 0 {
            return Err(LinuxError::EBUSY);
        }
        if let Some(NodeKind::Dir { entries, .. }) =
            inner.nodes.get_mut(parent).map(|n| &mut n.kind)
        {
            entries.retain(|key, _| !key.eq_ignore_ascii_case(name));
        }
        inner.nodes.remove(target);
        Ok(())
    }

    fn rename(&self, src: &str, dst: &str, keep: bool) -> LinuxResult<()> {
        if src.eq_ignore_ascii_case(dst) {
            return Ok(());
        }
        let mut inner = self.inner.lock();
        let (src_parent, src_name) = inner.resolve_parent(src)?;
        let (dst_parent, dst_name) = inner.resolve_parent(dst)?;

        let moved = {
            let Some(NodeKind::Dir { entries, .. }) = inner.nodes.get(src_parent).map(|n| &n.kind)
            else {
                return Err(LinuxError::ENOTDIR);
            };
            lookup(entries, src_name).ok_or(LinuxError::ENOENT)?
        };
        let replaced = {
            let Some(NodeKind::Dir { entries, .. }) = inner.nodes.get(dst_parent).map(|n| &n.kind)
            else {
                return Err(LinuxError::ENOTDIR);
            };
            let existing = lookup(entries, dst_name);
            if keep && existing.is_some() {
                return Err(LinuxError::EEXIST);
            }
            existing
        };
        if let Some(NodeKind::Dir { entries, .. }) =
            inner.nodes.get_mut(dst_parent).map(|n| &mut n.kind)
        {
            entries.retain(|key, _| !key.eq_ignore_ascii_case(dst_name));
            entries.insert(dst_name.to_string(), moved);
        }
        if let Some(NodeKind::Dir { entries, .. }) =
            inner.nodes.get_mut(src_parent).map(|n| &mut n.kind)
        {
            entries.retain(|key, _| !key.eq_ignore_ascii_case(src_name));
        }
        if let Some(old) = replaced
            && old != moved
        {
            inner.nodes.remove(old);
        }
        Ok(())
    }

    fn create_node(&self, path: &str, node_type: NodeType, _mode: u32) -> LinuxResult<()> {
        let kind = match node_type {
            NodeType::Regular => NodeKind::File(Vec::new()),
            NodeType::Directory => NodeKind::Dir {
                entries: BTreeMap::new(),
                parent: 0,
            },
            _ => return Err(LinuxError::EOPNOTSUPP),
        };
        let mut inner = self.inner.lock();
        let (parent, name) = inner.resolve_parent(path)?;
        {
            let Some(NodeKind::Dir { entries, .. }) = inner.nodes.get(parent).map(|n| &n.kind)
            else {
                return Err(LinuxError::ENOTDIR);
            };
            if lookup(entries, name).is_some() {
                return Err(LinuxError::EEXIST);
            }
        }
        let mut node = Node::new(kind);
        if let NodeKind::Dir { parent: p, .. } = &mut node.kind {
            *p = parent;
        }
        let idx = inner.nodes.insert(node);
        if let Some(NodeKind::Dir { entries, .. }) =
            inner.nodes.get_mut(parent).map(|n| &mut n.kind)
        {
            entries.insert(name.to_string(), idx);
        }
        Ok(())
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

    #[test]
    fn names_are_case_insensitive() {
        let fs = FatFs::new(0);
        fs.create_node("/Readme.TXT", NodeType::Regular, 0).unwrap();
        let h = fs.open("/readme.txt", AccessMode::WRITE).unwrap();
        assert_eq!(fs.write(h, 0, b"ok").unwrap(), 2);
        fs.close(h);
        assert!(matches!(
            fs.create_node("/README.txt", NodeType::Regular, 0),
            Err(LinuxError::EEXIST)
        ));
    }

    #[test]
    fn unsupported_operations_say_so() {
        let fs = FatFs::new(0);
        assert!(matches!(
            fs.create_symlink("/link", "/target"),
            Err(LinuxError::EOPNOTSUPP)
        ));
        assert!(matches!(
            fs.create_hard_link("/link", "/target"),
            Err(LinuxError::EOPNOTSUPP)
        ));
        assert!(matches!(
            fs.create_node("/dev0", NodeType::CharDevice, 0),
            Err(LinuxError::EOPNOTSUPP)
        ));
    }
}
