use crate::fs::error::FsError;
use crate::fs::node::{FileNode, NodeId};
use crate::fs::{OpenFlags, OpenMode, SeekMode};

impl FileNode {
    pub fn new(name: impl Into<String>, parent: Option<NodeId>) -> Self {
        FileNode {
            name: name.into(),
            parent,
            contents: Vec::new(),
            offset: 0,
            is_open: false,
            open_mode: None,
            orphaned: false,
        }
    }

    /// Open this file with `mode`/`flags`. Caller (`MemoryFS::open`) is
    /// responsible for the path-level decisions (`Create`, `IsDirectory`,
    /// `NotFound`) -- this only knows about the file's own open state.
    pub fn open(&mut self, mode: OpenMode, flags: OpenFlags) -> Result<(), FsError> {
        if self.is_open {
            return Err(FsError::AlreadyOpen);
        }
        self.is_open = true;
        self.open_mode = Some(mode);
        if flags.contains(OpenFlags::TRUNCATE) {
            self.contents.clear();
            self.offset = 0;
        }
        if flags.contains(OpenFlags::APPEND) {
            self.offset = self.contents.len() as i64;
        }
        Ok(())
    }

    /// Marks the file closed. The caller is responsible for having
    /// verified the fd was active; closing an already-closed file is a
    /// programming error in this implementation (mirroring the
    /// original's `panic` in `File::Close`), since a dead fd can't
    /// reach here -- `MemoryFS::close` maps `InactiveFD` before ever
    /// calling this.
    pub fn close(&mut self) -> bool {
        debug_assert!(self.is_open, "close() called on an already-closed file");
        self.is_open = false;
        self.open_mode = None;
        true
    }

    /// Marks this file unlinked-while-open, per `MemoryFS::delete`.
    pub fn mark_orphaned(&mut self) {
        self.orphaned = true;
    }

    pub fn seek(&mut self, offset: i64, whence: SeekMode) -> Result<i64, FsError> {
        let base = match whence {
            SeekMode::FromBeginning => 0,
            SeekMode::FromCurrent => self.offset,
            SeekMode::FromEnd => self.contents.len() as i64,
        };
        let new_offset = base.checked_add(offset).ok_or(FsError::IllegalArgument)?;
        if new_offset < 0 {
            return Err(FsError::IllegalArgument);
        }
        self.offset = new_offset;
        Ok(self.offset)
    }

    pub fn read(&mut self, num_bytes: i64) -> Result<(i64, Vec<u8>), FsError> {
        if num_bytes < 0 {
            return Err(FsError::IllegalArgument);
        }
        if self.open_mode == Some(OpenMode::WriteOnly) {
            return Err(FsError::WrongMode);
        }
        let len = self.contents.len() as i64;
        if num_bytes == 0 || self.offset >= len {
            return Ok((0, Vec::new()));
        }
        let available = len - self.offset;
        let to_read = num_bytes.min(available) as usize;
        let start = self.offset as usize;
        let data = self.contents[start..start + to_read].to_vec();
        self.offset += to_read as i64;
        Ok((to_read as i64, data))
    }

    /// Writes up to `min(num_bytes, data.len())` bytes at the current
    /// offset, pre-extending `contents` with zero bytes if the write
    /// starts or lands past the current end -- this is what realizes a
    /// hole created by a prior `Seek` past EOF (spec.md 4.4's sparse
    /// write property).
    pub fn write(&mut self, num_bytes: i64, data: &[u8]) -> Result<i64, FsError> {
        if num_bytes < 0 {
            return Err(FsError::IllegalArgument);
        }
        if self.open_mode == Some(OpenMode::ReadOnly) {
            return Err(FsError::WrongMode);
        }
        let to_write = (num_bytes as usize).min(data.len());
        let start = self.offset as usize;
        let end = start + to_write;
        if end > self.contents.len() {
            self.contents.resize(end, 0);
        }
        self.contents[start..end].copy_from_slice(&data[..to_write]);
        self.offset += to_write as i64;
        Ok(to_write as i64)
    }
}
