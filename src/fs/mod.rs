//! The in-memory, POSIX-flavored filesystem state machine (spec.md
//! component 4.4). A `MemoryFS` is applied to deterministically by every
//! raft node from the committed command stream, so every method here is
//! a plain synchronous function over owned state -- no I/O, no locking,
//! no async.

pub mod directory;
pub mod error;
pub mod file;
pub mod node;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::fs::error::FsError;
use crate::fs::node::{DirNode, FileNode, Node, NodeId};

/// The root directory always lives at slot 0 and is never freed.
const ROOT_ID: NodeId = 0;

/// fds below this are reserved (stdin/stdout/stderr in the original's
/// host-process fd space); the first fd handed out is 3.
pub const FIRST_FD: i64 = 3;

/// Caps the number of simultaneously open files per filesystem instance
/// (spec.md 4.4, "Resource limits").
pub const MAX_ACTIVE_FDS: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpenMode {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SeekMode {
    FromBeginning,
    FromCurrent,
    FromEnd,
}

/// A small bitmask of open-time modifiers. Kept as a hand-rolled
/// newtype over `u8` rather than pulling in a flags crate, since only
/// three bits are ever needed and the wire format is just the byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct OpenFlags(u8);

impl OpenFlags {
    pub const APPEND: OpenFlags = OpenFlags(1 << 0);
    pub const CREATE: OpenFlags = OpenFlags(1 << 1);
    pub const TRUNCATE: OpenFlags = OpenFlags(1 << 2);
    /// Clerk-side only: never reaches `MemoryFS::open`. `Clerk::open`
    /// strips it and retries the open every 100ms while it keeps
    /// seeing `AlreadyOpen`, instead of surfacing the error.
    pub const BLOCK: OpenFlags = OpenFlags(1 << 3);

    pub fn empty() -> Self {
        OpenFlags(0)
    }

    pub fn contains(&self, other: OpenFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn without(&self, other: OpenFlags) -> OpenFlags {
        OpenFlags(self.0 & !other.0)
    }
}

impl std::ops::BitOr for OpenFlags {
    type Output = OpenFlags;
    fn bitor(self, rhs: OpenFlags) -> OpenFlags {
        OpenFlags(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for OpenFlags {
    fn bitor_assign(&mut self, rhs: OpenFlags) {
        self.0 |= rhs.0;
    }
}

/// An arena-backed directory tree plus an fd table. `nodes[id]` is
/// `None` for freed slots, which lets `NodeId`s recorded elsewhere
/// (parent pointers, fd entries) stay stable without ever shifting.
///
/// `fds` is deliberately included in the serialized snapshot: a
/// follower that installs a snapshot must end up with the exact same
/// open-file bookkeeping the leader had at that point, not an
/// empty one, since a later `Close`/`Read`/`Write` against one of
/// those fds is still a valid committed command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryFS {
    nodes: Vec<Option<Node>>,
    free_slots: Vec<NodeId>,
    fds: HashMap<i64, NodeId>,
}

impl Default for MemoryFS {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryFS {
    pub fn new() -> Self {
        let root = Node::Directory(DirNode::new("/", None));
        MemoryFS { nodes: vec![Some(root)], free_slots: Vec::new(), fds: HashMap::new() }
    }

    fn get(&self, id: NodeId) -> &Node {
        self.nodes[id].as_ref().expect("dangling NodeId")
    }

    fn get_mut(&mut self, id: NodeId) -> &mut Node {
        self.nodes[id].as_mut().expect("dangling NodeId")
    }

    fn alloc(&mut self, node: Node) -> NodeId {
        if let Some(id) = self.free_slots.pop() {
            self.nodes[id] = Some(node);
            id
        } else {
            self.nodes.push(Some(node));
            self.nodes.len() - 1
        }
    }

    fn free(&mut self, id: NodeId) {
        self.nodes[id] = None;
        self.free_slots.push(id);
    }

    fn smallest_available_fd(&self) -> Option<i64> {
        let mut candidate = FIRST_FD;
        loop {
            if !self.fds.contains_key(&candidate) {
                return Some(candidate);
            }
            candidate += 1;
        }
    }

    /// Splits `path` into its directory components, resolves each in
    /// turn starting at the root, and returns the id of the final
    /// component's *parent* directory plus the final component's own
    /// name. Absolute paths only; a path that doesn't start with `/`,
    /// or that resolves through a non-final component that's a file,
    /// is `ParentDoesNotExist` (spec.md 4.4), surfaced here as `NotFound`
    /// like every other missing-parent case.
    fn follow_parent(&self, path: &str) -> Result<(NodeId, String), FsError> {
        let trimmed = path.strip_prefix('/').ok_or(FsError::NotFound)?;
        let mut parts: Vec<&str> = trimmed.split('/').filter(|s| !s.is_empty()).collect();
        let leaf = parts.pop().ok_or(FsError::NotFound)?;
        let mut current = ROOT_ID;
        for part in parts {
            let dir = self.get(current).as_dir().ok_or(FsError::NotFound)?;
            current = dir.child_named(part).ok_or(FsError::NotFound)?;
            if !self.get(current).is_directory() {
                return Err(FsError::NotFound);
            }
        }
        Ok((current, leaf.to_string()))
    }

    /// Resolves `path` all the way to its own node id.
    fn follow_path(&self, path: &str) -> Result<NodeId, FsError> {
        if path == "/" {
            return Ok(ROOT_ID);
        }
        let (parent, leaf) = self.follow_parent(path)?;
        let dir = self.get(parent).as_dir().ok_or(FsError::NotFound)?;
        dir.child_named(&leaf).ok_or(FsError::NotFound)
    }

    pub fn mkdir(&mut self, path: &str) -> Result<(), FsError> {
        let (parent, leaf) = self.follow_parent(path)?;
        {
            let dir = self.get(parent).as_dir().ok_or(FsError::NotFound)?;
            if dir.has_child_named(&leaf) {
                return Err(FsError::AlreadyExists);
            }
        }
        let id = self.alloc(Node::Directory(DirNode::new(leaf.clone(), Some(parent))));
        self.get_mut(parent).as_dir_mut().unwrap().insert_child(leaf, id);
        Ok(())
    }

    pub fn open(&mut self, path: &str, mode: OpenMode, flags: OpenFlags) -> Result<i64, FsError> {
        if self.fds.len() >= MAX_ACTIVE_FDS {
            return Err(FsError::TooManyFDsOpen);
        }
        let (parent, leaf) = self.follow_parent(path)?;
        let node_id = {
            let dir = self.get(parent).as_dir().ok_or(FsError::NotFound)?;
            dir.child_named(&leaf)
        };
        let node_id = match node_id {
            Some(id) => id,
            None => {
                if !flags.contains(OpenFlags::CREATE) {
                    return Err(FsError::NotFound);
                }
                let id = self.alloc(Node::File(FileNode::new(leaf.clone(), Some(parent))));
                self.get_mut(parent).as_dir_mut().unwrap().insert_child(leaf, id);
                id
            }
        };
        let file = self.get_mut(node_id).as_file_mut().ok_or(FsError::IsDirectory)?;
        file.open(mode, flags)?;
        let fd = self.smallest_available_fd().ok_or(FsError::TooManyFDsOpen)?;
        self.fds.insert(fd, node_id);
        Ok(fd)
    }

    fn fd_to_file(&mut self, fd: i64) -> Result<&mut FileNode, FsError> {
        let node_id = *self.fds.get(&fd).ok_or(FsError::InactiveFD)?;
        self.get_mut(node_id).as_file_mut().ok_or(FsError::InactiveFD)
    }

    pub fn close(&mut self, fd: i64) -> Result<(), FsError> {
        let node_id = *self.fds.get(&fd).ok_or(FsError::InactiveFD)?;
        let orphaned = {
            let file = self.get_mut(node_id).as_file_mut().ok_or(FsError::InactiveFD)?;
            file.close();
            file.orphaned
        };
        self.fds.remove(&fd);
        if orphaned {
            self.free(node_id);
        }
        Ok(())
    }

    pub fn seek(&mut self, fd: i64, offset: i64, whence: SeekMode) -> Result<i64, FsError> {
        self.fd_to_file(fd)?.seek(offset, whence)
    }

    pub fn read(&mut self, fd: i64, num_bytes: i64) -> Result<(i64, Vec<u8>), FsError> {
        self.fd_to_file(fd)?.read(num_bytes)
    }

    pub fn write(&mut self, fd: i64, num_bytes: i64, data: &[u8]) -> Result<i64, FsError> {
        self.fd_to_file(fd)?.write(num_bytes, data)
    }

    pub fn delete(&mut self, path: &str) -> Result<(), FsError> {
        if path == "/" {
            return Err(FsError::IllegalArgument);
        }
        let (parent, leaf) = self.follow_parent(path)?;
        let node_id = {
            let dir = self.get(parent).as_dir().ok_or(FsError::NotFound)?;
            dir.child_named(&leaf).ok_or(FsError::NotFound)?
        };
        if let Node::Directory(d) = self.get(node_id) {
            if !d.is_empty() {
                return Err(FsError::DirectoryNotEmpty);
            }
        }
        self.get_mut(parent).as_dir_mut().unwrap().remove_child(&leaf);

        // An open file unlinks like any other node (spec.md 4.4: "...
        // unlinks from parent otherwise"); it just can't be freed yet --
        // its fd is still valid for read/write/close until the last
        // close, same as a POSIX unlink of an open file.
        let still_open = matches!(self.get(node_id), Node::File(f) if f.is_open);
        if still_open {
            self.get_mut(node_id).as_file_mut().unwrap().mark_orphaned();
        } else {
            self.free(node_id);
        }
        Ok(())
    }

    /// Encodes the whole tree (including open fds) into a single byte
    /// blob suitable for `Persister::save_state_and_snapshot`.
    pub fn to_snapshot_bytes(&self) -> Vec<u8> {
        bincode::serialize(self).expect("MemoryFS is always serializable")
    }

    pub fn from_snapshot_bytes(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mkdir_then_open_create_then_write_read() {
        let mut fs = MemoryFS::new();
        fs.mkdir("/a").unwrap();
        let fd = fs.open("/a/f.txt", OpenMode::ReadWrite, OpenFlags::CREATE).unwrap();
        assert_eq!(fd, FIRST_FD);
        assert_eq!(fs.write(fd, 5, b"hello").unwrap(), 5);
        fs.seek(fd, 0, SeekMode::FromBeginning).unwrap();
        let (n, data) = fs.read(fd, 5).unwrap();
        assert_eq!(n, 5);
        assert_eq!(data, b"hello");
    }

    #[test]
    fn open_missing_without_create_fails() {
        let mut fs = MemoryFS::new();
        assert!(matches!(
            fs.open("/nope", OpenMode::ReadOnly, OpenFlags::empty()),
            Err(FsError::NotFound)
        ));
    }

    #[test]
    fn mkdir_duplicate_fails() {
        let mut fs = MemoryFS::new();
        fs.mkdir("/a").unwrap();
        assert!(matches!(fs.mkdir("/a"), Err(FsError::AlreadyExists)));
    }

    #[test]
    fn fds_are_allocated_lowest_first_and_reused_after_close() {
        let mut fs = MemoryFS::new();
        let fd1 = fs.open("/a", OpenMode::ReadWrite, OpenFlags::CREATE).unwrap();
        let fd2 = fs.open("/b", OpenMode::ReadWrite, OpenFlags::CREATE).unwrap();
        assert_eq!(fd1, FIRST_FD);
        assert_eq!(fd2, FIRST_FD + 1);
        fs.close(fd1).unwrap();
        let fd3 = fs.open("/c", OpenMode::ReadWrite, OpenFlags::CREATE).unwrap();
        assert_eq!(fd3, fd1);
    }

    #[test]
    fn delete_nonempty_directory_fails() {
        let mut fs = MemoryFS::new();
        fs.mkdir("/a").unwrap();
        fs.open("/a/f", OpenMode::ReadWrite, OpenFlags::CREATE).unwrap();
        assert!(matches!(fs.delete("/a"), Err(FsError::DirectoryNotEmpty)));
    }

    #[test]
    fn deleting_an_open_file_unlinks_it_but_keeps_the_fd_usable_until_close() {
        let mut fs = MemoryFS::new();
        let fd = fs.open("/f", OpenMode::ReadWrite, OpenFlags::CREATE).unwrap();
        fs.write(fd, 3, b"abc").unwrap();

        assert!(fs.delete("/f").is_ok());
        assert!(matches!(fs.open("/f", OpenMode::ReadOnly, OpenFlags::empty()), Err(FsError::NotFound)));

        fs.seek(fd, 0, SeekMode::FromBeginning).unwrap();
        let (n, data) = fs.read(fd, 3).unwrap();
        assert_eq!(n, 3);
        assert_eq!(data, b"abc");

        assert!(fs.close(fd).is_ok());
        assert!(matches!(fs.read(fd, 1), Err(FsError::InactiveFD)));
    }

    #[test]
    fn operating_on_a_directory_as_a_file_is_rejected() {
        let mut fs = MemoryFS::new();
        fs.mkdir("/a").unwrap();
        assert!(matches!(
            fs.open("/a", OpenMode::ReadOnly, OpenFlags::empty()),
            Err(FsError::IsDirectory)
        ));
    }

    #[test]
    fn too_many_open_fds_is_rejected() {
        let mut fs = MemoryFS::new();
        for i in 0..MAX_ACTIVE_FDS {
            fs.open(&format!("/f{i}"), OpenMode::ReadWrite, OpenFlags::CREATE).unwrap();
        }
        assert!(matches!(
            fs.open("/one_too_many", OpenMode::ReadWrite, OpenFlags::CREATE),
            Err(FsError::TooManyFDsOpen)
        ));
    }

    #[test]
    fn closed_fd_is_inactive() {
        let mut fs = MemoryFS::new();
        let fd = fs.open("/f", OpenMode::ReadWrite, OpenFlags::CREATE).unwrap();
        fs.close(fd).unwrap();
        assert!(matches!(fs.read(fd, 1), Err(FsError::InactiveFD)));
    }

    #[test]
    fn snapshot_round_trip_preserves_tree_and_open_fds() {
        let mut fs = MemoryFS::new();
        fs.mkdir("/a").unwrap();
        let fd = fs.open("/a/f", OpenMode::ReadWrite, OpenFlags::CREATE).unwrap();
        fs.write(fd, 5, b"hello").unwrap();

        let bytes = fs.to_snapshot_bytes();
        let mut restored = MemoryFS::from_snapshot_bytes(&bytes).unwrap();

        let (n, data) = restored.read(fd, 5).unwrap();
        assert_eq!(n, 0); // offset is already at 5 after the write
        assert!(data.is_empty());
        restored.seek(fd, 0, SeekMode::FromBeginning).unwrap();
        let (n, data) = restored.read(fd, 5).unwrap();
        assert_eq!(n, 5);
        assert_eq!(data, b"hello");
    }
}
