use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error kinds surfaced through the `FileSystem` API (spec.md 7).
///
/// These travel inside `ReplyValue` and are serialized straight through
/// the raft commit/apply pipeline -- they are filesystem outcomes, not
/// raft-layer failures (`ReplyStatus` carries those separately).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Error)]
pub enum FsError {
    #[error("no such file or directory")]
    NotFound,
    #[error("is a directory")]
    IsDirectory,
    #[error("too many file descriptors open")]
    TooManyFDsOpen,
    #[error("file descriptor is not active")]
    InactiveFD,
    #[error("illegal argument")]
    IllegalArgument,
    #[error("try again")]
    TryAgain,
    #[error("I/O error")]
    IOError,
    #[error("file too large")]
    FileTooLarge,
    #[error("no space left")]
    NoMoreSpace,
    #[error("directory not empty")]
    DirectoryNotEmpty,
    #[error("already exists")]
    AlreadyExists,
    #[error("already open")]
    AlreadyOpen,
    #[error("write too large")]
    WriteTooLarge,
    #[error("wrong mode for this operation")]
    WrongMode,
}
