use thiserror::Error;

/// Failures internal to the log/raft layer.
///
/// Most of these correspond to conditions the original Go implementation
/// treated as panics (programming errors, not recoverable client-facing
/// conditions) -- see spec.md 7 "Fatal". They are kept as a `Result`
/// here instead of `panic!` so callers in this crate can assert on them
/// in tests, but production call sites should treat them as invariant
/// violations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RaftError {
    #[error("index {0} has already been compressed into the snapshot")]
    AlreadyCompressed(u64),

    #[error("index {index} is out of range (last_index={last_index})")]
    IndexOutOfRange { index: u64, last_index: u64 },

    #[error("illegal index {0}")]
    IllegalIndex(u64),

    #[error("compress_upto({k}) is not ahead of the current snapshot (last_compressed_index={last_compressed_index})")]
    CompressNotAhead { k: u64, last_compressed_index: u64 },
}
