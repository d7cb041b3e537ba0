//! The operation codec: tagged operation records and their matching
//! reply shapes (spec.md 4.6).
//!
//! Every client-visible filesystem operation is flattened into a single
//! `OperationRequest` that rides through the raft log as one `LogEntry`
//! command (after `bincode` encoding), and every reply is a
//! `ReplyValue` variant whose shape is fixed per `OpKind` -- the
//! dispatcher in `server.rs` picks the variant by `OpKind` and the
//! clerk destructures the matching variant, exactly as spec.md 9's
//! "Reply tuple polymorphism" design note recommends.

use serde::{Deserialize, Serialize};

use crate::fs::error::FsError;
use crate::fs::{OpenFlags, OpenMode, SeekMode};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpKind {
    Mkdir,
    Open,
    Close,
    Seek,
    Read,
    Write,
    Delete,
}

impl std::fmt::Display for OpKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            OpKind::Mkdir => "Mkdir",
            OpKind::Open => "Open",
            OpKind::Close => "Close",
            OpKind::Seek => "Seek",
            OpKind::Read => "Read",
            OpKind::Write => "Write",
            OpKind::Delete => "Delete",
        };
        write!(f, "{s}")
    }
}

/// The arguments to one filesystem operation, shaped per `OpKind`.
/// Unused fields for a given op kind are left at their defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationArgs {
    pub op: OpKind,
    pub path: Option<String>,
    pub fd: Option<i64>,
    pub mode: Option<OpenMode>,
    pub flags: Option<OpenFlags>,
    pub offset: Option<i64>,
    pub whence: Option<SeekMode>,
    pub num_bytes: Option<i64>,
    pub data: Option<Vec<u8>>,
}

impl OperationArgs {
    pub fn mkdir(path: impl Into<String>) -> Self {
        Self::bare(OpKind::Mkdir).with_path(path)
    }

    pub fn open(path: impl Into<String>, mode: OpenMode, flags: OpenFlags) -> Self {
        let mut a = Self::bare(OpKind::Open).with_path(path);
        a.mode = Some(mode);
        a.flags = Some(flags);
        a
    }

    pub fn close(fd: i64) -> Self {
        let mut a = Self::bare(OpKind::Close);
        a.fd = Some(fd);
        a
    }

    pub fn seek(fd: i64, offset: i64, whence: SeekMode) -> Self {
        let mut a = Self::bare(OpKind::Seek);
        a.fd = Some(fd);
        a.offset = Some(offset);
        a.whence = Some(whence);
        a
    }

    pub fn read(fd: i64, num_bytes: i64) -> Self {
        let mut a = Self::bare(OpKind::Read);
        a.fd = Some(fd);
        a.num_bytes = Some(num_bytes);
        a
    }

    pub fn write(fd: i64, num_bytes: i64, data: Vec<u8>) -> Self {
        let mut a = Self::bare(OpKind::Write);
        a.fd = Some(fd);
        a.num_bytes = Some(num_bytes);
        a.data = Some(data);
        a
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::bare(OpKind::Delete).with_path(path)
    }

    fn bare(op: OpKind) -> Self {
        OperationArgs {
            op,
            path: None,
            fd: None,
            mode: None,
            flags: None,
            offset: None,
            whence: None,
            num_bytes: None,
            data: None,
        }
    }

    fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }
}

/// A request as it appears on the wire / in the raft log: the
/// operation plus the clerk-identity fields needed for deduplication.
///
/// `birthday_ns` exists purely to break ties between two otherwise
/// identical `OperationRequest`s (same clerk, same sequence number,
/// same args) so that equality comparisons used for detecting a
/// silently-lost leadership (spec.md 4.5.e) never spuriously match a
/// *different* submission that happens to look the same.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationRequest {
    pub args: OperationArgs,
    pub clerk_id: u64,
    pub clerk_seq: u64,
    pub birthday_ns: i64,
}

/// The per-op-kind reply payload. The dispatcher asserts the variant
/// matches the request's `OpKind` before delivering it to a waiting
/// clerk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ReplyValue {
    Mkdir { success: bool, err: Option<FsError> },
    Open { fd: i64, err: Option<FsError> },
    Close { success: bool, err: Option<FsError> },
    Seek { new_offset: i64, err: Option<FsError> },
    Read { n: i64, data: Vec<u8>, err: Option<FsError> },
    Write { n: i64, err: Option<FsError> },
    Delete { success: bool, err: Option<FsError> },
}

impl ReplyValue {
    pub fn kind(&self) -> OpKind {
        match self {
            ReplyValue::Mkdir { .. } => OpKind::Mkdir,
            ReplyValue::Open { .. } => OpKind::Open,
            ReplyValue::Close { .. } => OpKind::Close,
            ReplyValue::Seek { .. } => OpKind::Seek,
            ReplyValue::Read { .. } => OpKind::Read,
            ReplyValue::Write { .. } => OpKind::Write,
            ReplyValue::Delete { .. } => OpKind::Delete,
        }
    }

    pub fn err(&self) -> Option<&FsError> {
        match self {
            ReplyValue::Mkdir { err, .. }
            | ReplyValue::Open { err, .. }
            | ReplyValue::Close { err, .. }
            | ReplyValue::Seek { err, .. }
            | ReplyValue::Read { err, .. }
            | ReplyValue::Write { err, .. }
            | ReplyValue::Delete { err, .. } => err.as_ref(),
        }
    }
}

/// Status of a completed `Operation` RPC (spec.md 3, 4.6). Distinct
/// from `FsError`: this is about the raft layer (did we even commit
/// this command?), not about the filesystem outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplyStatus {
    Ok,
    NotLeader,
    Killed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationReply {
    pub status: ReplyStatus,
    pub return_value: Option<ReplyValue>,
}

impl OperationReply {
    pub fn not_leader() -> Self {
        OperationReply { status: ReplyStatus::NotLeader, return_value: None }
    }

    pub fn killed() -> Self {
        OperationReply { status: ReplyStatus::Killed, return_value: None }
    }

    pub fn ok(value: ReplyValue) -> Self {
        OperationReply { status: ReplyStatus::Ok, return_value: Some(value) }
    }
}
