use serde::{Deserialize, Serialize};

use crate::fs::OpenMode;

/// Stable, arena-slot identifier for a `Node`. Parent links are plain
/// `NodeId`s rather than owned references, which sidesteps the
/// reference-cycle problem a directory tree with back-pointers would
/// otherwise create (spec.md 9, "Parent pointers").
pub type NodeId = usize;

/// A directory: an ordered set of named children plus a back-pointer
/// to its parent. The root directory has no parent and is never
/// deletable (enforced by `MemoryFS::delete`, not here).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirNode {
    pub name: String,
    pub parent: Option<NodeId>,
    pub children: std::collections::BTreeMap<String, NodeId>,
}

/// A file's contents and open state. Only one concurrent opener is
/// permitted (enforced by `MemoryFS::open`); re-opening after a close
/// is fine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileNode {
    pub name: String,
    pub parent: Option<NodeId>,
    pub contents: Vec<u8>,
    pub offset: i64,
    pub is_open: bool,
    pub open_mode: Option<OpenMode>,
    /// Set when `Delete` unlinks this file while it was still open. The
    /// node stays alive in the arena (its existing fd is still valid
    /// for read/write/close) until the last close frees it, mirroring
    /// a POSIX unlink of an open file.
    pub orphaned: bool,
}

/// A node in the filesystem tree: either a `Directory` or a `File`.
/// This is the tagged-sum replacement for the original's runtime type
/// assertions on an interface value (spec.md 9).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Node {
    Directory(DirNode),
    File(FileNode),
}

impl Node {
    pub fn name(&self) -> &str {
        match self {
            Node::Directory(d) => &d.name,
            Node::File(f) => &f.name,
        }
    }

    pub fn parent(&self) -> Option<NodeId> {
        match self {
            Node::Directory(d) => d.parent,
            Node::File(f) => f.parent,
        }
    }

    pub fn is_directory(&self) -> bool {
        matches!(self, Node::Directory(_))
    }

    pub fn as_dir(&self) -> Option<&DirNode> {
        match self {
            Node::Directory(d) => Some(d),
            Node::File(_) => None,
        }
    }

    pub fn as_dir_mut(&mut self) -> Option<&mut DirNode> {
        match self {
            Node::Directory(d) => Some(d),
            Node::File(_) => None,
        }
    }

    pub fn as_file(&self) -> Option<&FileNode> {
        match self {
            Node::File(f) => Some(f),
            Node::Directory(_) => None,
        }
    }

    pub fn as_file_mut(&mut self) -> Option<&mut FileNode> {
        match self {
            Node::File(f) => Some(f),
            Node::Directory(_) => None,
        }
    }
}
