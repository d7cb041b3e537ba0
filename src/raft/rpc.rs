use serde::{Deserialize, Serialize};

use super::log::LogEntry;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteArgs {
    pub term: u64,
    pub candidate_id: String,
    pub last_log_index: u64,
    pub last_log_term: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteReply {
    pub term: u64,
    pub vote_granted: bool,
    pub voter_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesArgs {
    pub term: u64,
    pub leader_id: String,
    pub prev_log_index: u64,
    pub prev_log_term: u64,
    pub entries: Vec<LogEntry>,
    pub leader_commit: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesReply {
    pub term: u64,
    pub success: bool,
    /// Term of the conflicting entry, or `None` if there is no such entry.
    pub conflicting_term: Option<u64>,
    /// Index of the first entry of `conflicting_term`, or `None`.
    pub first_index_of_conflicting_term: Option<u64>,
    /// If set, the leader should send starting at exactly this index,
    /// bypassing the conflicting-term search (set when the rejection
    /// reason is about compaction or already-committed entries rather
    /// than a term mismatch).
    pub desired_next_index: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallSnapshotArgs {
    pub term: u64,
    pub leader_id: String,
    pub last_included_index: u64,
    pub last_included_term: u64,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallSnapshotReply {
    pub term: u64,
}
