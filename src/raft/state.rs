use std::collections::{HashMap, HashSet};
use std::time::Instant;

use serde::{Deserialize, Serialize};

use super::log::RaftLog;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RaftRole {
    Follower,
    Candidate,
    Leader,
}

/// Static configuration for one raft peer. Never mutated after construction.
#[derive(Debug, Clone)]
pub struct RaftConfig {
    pub id: String,
    pub peers: Vec<String>,
    pub election_timeout_min_ms: u64,
    pub election_timeout_max_ms: u64,
    pub heartbeat_interval_ms: u64,
}

impl RaftConfig {
    pub fn cluster_size(&self) -> usize {
        self.peers.len() + 1
    }

    pub fn majority(&self) -> usize {
        self.cluster_size() / 2 + 1
    }
}

/// The subset of `RaftState` that must be flushed to stable storage
/// before any RPC reply that could affect election safety is sent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistentState {
    pub current_term: u64,
    pub voted_for: Option<String>,
    pub log: RaftLog,
}

/// All mutable state for one raft peer, guarded by a single mutex in
/// `RaftNode`. Mirrors `raft_structs.go`'s `Raft` struct fields, minus
/// the channels (which live alongside the node, not inside the state).
pub struct RaftState {
    // persistent
    pub current_term: u64,
    pub voted_for: Option<String>,
    pub log: RaftLog,

    // volatile
    pub role: RaftRole,
    pub commit_index: u64,
    pub last_applied: u64,
    pub leader_id: Option<String>,
    pub election_deadline: Instant,
    pub votes_received: HashSet<String>,

    // leader-only volatile
    pub next_index: HashMap<String, u64>,
    pub match_index: HashMap<String, u64>,

    pub alive: bool,
}

impl RaftState {
    pub fn new() -> Self {
        RaftState {
            current_term: 0,
            voted_for: None,
            log: RaftLog::new(),
            role: RaftRole::Follower,
            commit_index: 0,
            last_applied: 0,
            leader_id: None,
            election_deadline: Instant::now(),
            votes_received: HashSet::new(),
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            alive: true,
        }
    }

    pub fn restore(&mut self, persisted: PersistentState) {
        self.current_term = persisted.current_term;
        self.voted_for = persisted.voted_for;
        self.log = persisted.log;
        // Maintain 0 <= last_compressed_index <= last_applied <= commit_index <= last_log_index
        // across a restart: anything folded into the snapshot prefix
        // is, by definition, already applied and committed.
        self.last_applied = self.log.last_compressed_index();
        self.commit_index = self.last_applied;
    }

    pub fn persistent_snapshot(&self) -> PersistentState {
        PersistentState {
            current_term: self.current_term,
            voted_for: self.voted_for.clone(),
            log: self.log.clone(),
        }
    }

    pub fn last_log_index(&self) -> u64 {
        self.log.last_index()
    }

    pub fn last_log_term(&self) -> u64 {
        self.log.last_term()
    }

    pub fn become_follower(&mut self, term: u64) {
        self.current_term = term;
        self.role = RaftRole::Follower;
        self.voted_for = None;
        self.leader_id = None;
    }
}

impl Default for RaftState {
    fn default() -> Self {
        Self::new()
    }
}
