use serde::{Deserialize, Serialize};

use super::error::RaftError;

/// A single entry in the replicated log.
///
/// `index` is kept on the entry itself (not just implied by position)
/// so that conflict-backtracking in `append_entries` can assert the
/// position it is about to write matches what the leader claims.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub term: u64,
    pub index: u64,
    pub command: Vec<u8>,
}

/// An append-only, 1-indexed log with prefix compaction into a snapshot head.
///
/// Ported from the original `LogOne` abstraction: a log that can forget
/// entries before some index while still answering `last_index`/`last_term`
/// queries about the compacted prefix via `last_compressed_term`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RaftLog {
    /// Index of the first entry still held uncompressed.
    first_uncompressed_index: u64,
    /// Term of the last entry folded into the snapshot prefix.
    last_compressed_term: u64,
    /// Entries at indices `[first_uncompressed_index, last_index()]`.
    entries: Vec<LogEntry>,
}

impl Default for RaftLog {
    fn default() -> Self {
        Self::new()
    }
}

impl RaftLog {
    pub fn new() -> Self {
        RaftLog {
            first_uncompressed_index: 1,
            last_compressed_term: 0,
            entries: Vec::new(),
        }
    }

    pub fn append(&mut self, entry: LogEntry) {
        self.entries.push(entry);
    }

    pub fn append_all(&mut self, entries: impl IntoIterator<Item = LogEntry>) {
        self.entries.extend(entries);
    }

    /// Highest index in the log, including the compressed prefix.
    /// Zero for a brand new, empty log.
    pub fn last_index(&self) -> u64 {
        self.first_uncompressed_index + self.entries.len() as u64 - 1
    }

    pub fn last_compressed_index(&self) -> u64 {
        self.first_uncompressed_index - 1
    }

    pub fn last_compressed_term(&self) -> u64 {
        self.last_compressed_term
    }

    /// Force-sets the compressed-prefix term. Used when installing a
    /// leader's snapshot, where the prefix term comes from the
    /// snapshot's metadata rather than anything derivable from our own
    /// (possibly unrelated) log entries.
    pub fn set_last_compressed_term(&mut self, term: u64) {
        self.last_compressed_term = term;
    }

    pub fn first_uncompressed_index(&self) -> u64 {
        self.first_uncompressed_index
    }

    pub fn index_is_compressed(&self, index: u64) -> bool {
        index < self.first_uncompressed_index
    }

    /// Term of the entry at `last_index()`, or the compressed prefix's
    /// term if the whole log is compressed (and 0 for a brand-new log).
    pub fn last_term(&self) -> u64 {
        if self.entries.is_empty() {
            self.last_compressed_term
        } else {
            self.entries.last().unwrap().term
        }
    }

    /// Fetch the entry at `index`. Fails if `index` is already
    /// compressed or beyond `last_index()`.
    pub fn get(&self, index: u64) -> Result<&LogEntry, RaftError> {
        self.assert_accessible(index)?;
        let offset = (index - self.first_uncompressed_index) as usize;
        self.entries
            .get(offset)
            .ok_or(RaftError::IndexOutOfRange { index, last_index: self.last_index() })
    }

    /// Entries at `[index, last_index()]`. Fails if `index` is compressed.
    pub fn slice_from(&self, index: u64) -> Result<Vec<LogEntry>, RaftError> {
        self.assert_accessible(index)?;
        if index > self.last_index() {
            return Ok(Vec::new());
        }
        let offset = (index - self.first_uncompressed_index) as usize;
        Ok(self.entries[offset..].to_vec())
    }

    /// Discard entries after `k`. No-op if `k >= last_index()`.
    /// Fails if `k` is already compressed (except `k ==
    /// last_compressed_index()`, which legally empties the tail).
    pub fn truncate_after(&mut self, k: u64) -> Result<(), RaftError> {
        if k >= self.last_index() {
            return Ok(());
        }
        if k == self.last_compressed_index() {
            self.entries.clear();
            return Ok(());
        }
        self.assert_accessible(k)?;
        let keep = (k - self.first_uncompressed_index + 1) as usize;
        self.entries.truncate(keep);
        Ok(())
    }

    /// Fold all entries up to and including `k` into the compressed
    /// prefix. Legal even when `k > last_index()` (compresses
    /// everything and records the log's current last term). Fails if
    /// `k` is already compressed.
    pub fn compress_upto(&mut self, k: u64) -> Result<(), RaftError> {
        if k <= self.last_compressed_index() {
            return Err(RaftError::CompressNotAhead { k, last_compressed_index: self.last_compressed_index() });
        }
        if k < self.last_index() {
            let num_to_compress = (k - self.first_uncompressed_index + 1) as usize;
            self.last_compressed_term = self.entries[num_to_compress - 1].term;
            self.entries.drain(0..num_to_compress);
        } else if !self.entries.is_empty() {
            self.last_compressed_term = self.entries.last().unwrap().term;
            self.entries.clear();
        }
        self.first_uncompressed_index = k + 1;
        Ok(())
    }

    fn assert_accessible(&self, index: u64) -> Result<(), RaftError> {
        if index == 0 {
            return Err(RaftError::IllegalIndex(index));
        }
        if self.index_is_compressed(index) {
            return Err(RaftError::AlreadyCompressed(index));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(term: u64, index: u64) -> LogEntry {
        LogEntry { term, index, command: vec![] }
    }

    #[test]
    fn empty_log_has_last_index_zero() {
        let log = RaftLog::new();
        assert_eq!(log.last_index(), 0);
        assert_eq!(log.last_term(), 0);
        assert_eq!(log.last_compressed_index(), 0);
    }

    #[test]
    fn append_and_get_round_trip() {
        let mut log = RaftLog::new();
        log.append(entry(1, 1));
        log.append(entry(1, 2));
        log.append(entry(2, 3));
        assert_eq!(log.last_index(), 3);
        assert_eq!(log.last_term(), 2);
        assert_eq!(log.get(2).unwrap().term, 1);
    }

    #[test]
    fn get_below_compacted_fails() {
        let mut log = RaftLog::new();
        log.append_all([entry(1, 1), entry(1, 2), entry(2, 3)]);
        log.compress_upto(2).unwrap();
        assert_eq!(log.last_compressed_index(), 2);
        assert_eq!(log.last_compressed_term(), 1);
        assert!(matches!(log.get(2), Err(RaftError::AlreadyCompressed(2))));
        assert_eq!(log.get(3).unwrap().term, 2);
    }

    #[test]
    fn compress_beyond_last_index_uses_current_last_term() {
        let mut log = RaftLog::new();
        log.append_all([entry(1, 1), entry(3, 2)]);
        log.compress_upto(5).unwrap();
        assert_eq!(log.last_compressed_term(), 3);
        assert_eq!(log.last_index(), 5);
        assert_eq!(log.last_term(), 3);
    }

    #[test]
    fn truncate_after_last_compressed_index_empties_tail() {
        let mut log = RaftLog::new();
        log.append_all([entry(1, 1), entry(1, 2), entry(2, 3)]);
        log.compress_upto(1).unwrap();
        log.truncate_after(1).unwrap();
        assert_eq!(log.last_index(), 1);
        assert!(log.slice_from(2).unwrap().is_empty() || log.last_index() < 2);
    }

    #[test]
    fn truncate_after_no_op_past_last_index() {
        let mut log = RaftLog::new();
        log.append_all([entry(1, 1), entry(1, 2)]);
        log.truncate_after(10).unwrap();
        assert_eq!(log.last_index(), 2);
    }

    #[test]
    fn truncate_below_compacted_fails() {
        let mut log = RaftLog::new();
        log.append_all([entry(1, 1), entry(1, 2), entry(2, 3)]);
        log.compress_upto(2).unwrap();
        assert!(matches!(log.truncate_after(1), Err(RaftError::AlreadyCompressed(1))));
    }

    #[test]
    fn slice_from_returns_suffix() {
        let mut log = RaftLog::new();
        log.append_all([entry(1, 1), entry(1, 2), entry(2, 3)]);
        let tail = log.slice_from(2).unwrap();
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].index, 2);
    }
}
