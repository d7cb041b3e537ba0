//! Raft replication engine (spec.md component 4.1/4.2).
//!
//! Ported from the original's `raft` package: `raft.go` (the three
//! liveness threads plus `Make`/`Start`/`Kill`), `raft_requestvote.go`,
//! `raft_appendentries.go`, `raft_install_snapshot.go` and
//! `raft_persist.go`. The original coordinates its threads with three
//! handshake channels (`becomeLeader`, `becomeFollower`, `toApply`);
//! here the same three responsibilities are three tokio tasks that
//! each periodically take the node's single mutex and act on whatever
//! they find, which needs no handshake at all since the role check and
//! the action happen under one lock acquisition.

pub mod append_entries;
pub mod election;
pub mod error;
pub mod install_snapshot;
pub mod log;
pub mod persist;
pub mod rpc;
pub mod state;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ::log::{debug, trace};
use rand::Rng;
use tokio::sync::{mpsc, Mutex, Notify};

use self::log::LogEntry;
use self::state::{RaftConfig, RaftRole, RaftState};
use crate::persister::Persister;
use crate::transport::RaftTransport;

/// One committed (or snapshot-reset) unit of state-machine input,
/// delivered in strict index order to whoever owns `apply_rx`.
#[derive(Debug, Clone)]
pub struct ApplyMsg {
    pub data: Vec<u8>,
    pub index: u64,
    pub term: u64,
    pub purpose: ApplyPurpose,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyPurpose {
    /// `data` is one `bincode`-encoded `OperationRequest`.
    Command,
    /// `data` is an opaque state-machine snapshot; the consumer should
    /// discard whatever state it has and restore from `data`.
    StateReset,
}

pub struct RaftNode {
    config: RaftConfig,
    state: Mutex<RaftState>,
    persister: Arc<dyn Persister>,
    transport: Arc<dyn RaftTransport>,
    apply_tx: mpsc::UnboundedSender<ApplyMsg>,
    apply_notify: Notify,
    started: AtomicBool,
}

impl RaftNode {
    pub fn new(
        config: RaftConfig,
        persister: Arc<dyn Persister>,
        transport: Arc<dyn RaftTransport>,
        apply_tx: mpsc::UnboundedSender<ApplyMsg>,
    ) -> Arc<Self> {
        let mut state = RaftState::new();
        let saved = persister.raft_state();
        if !saved.is_empty() {
            match persist::decode_persistent_state(&saved) {
                Ok(persisted) => state.restore(persisted),
                Err(e) => {
                    ::log::error!("{}: failed to decode persisted raft state: {e}", config.id);
                }
            }
        }
        state.election_deadline = Instant::now() + Self::random_election_timeout(&config);

        let node = Arc::new(RaftNode {
            config,
            state: Mutex::new(state),
            persister,
            transport,
            apply_tx,
            apply_notify: Notify::new(),
            started: AtomicBool::new(false),
        });
        node.persist_sync();
        node
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    /// Spawns the election, heartbeat, and applier tasks. Idempotent:
    /// calling it twice on the same node is a no-op.
    pub fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let election = Arc::clone(self);
        tokio::spawn(async move { election.election_loop().await });

        let heartbeat = Arc::clone(self);
        tokio::spawn(async move { heartbeat.heartbeat_loop().await });

        let applier = Arc::clone(self);
        tokio::spawn(async move { applier.applier_loop().await });
    }

    pub async fn kill(&self) {
        let mut state = self.state.lock().await;
        debug!("{}: dying", self.config.id);
        state.alive = false;
        drop(state);
        self.apply_notify.notify_one();
    }

    pub async fn get_state(&self) -> (u64, bool) {
        let state = self.state.lock().await;
        (state.current_term, state.role == RaftRole::Leader)
    }

    pub async fn leader_id(&self) -> Option<String> {
        self.state.lock().await.leader_id.clone()
    }

    /// Mirrors `Raft.Start`: appends `command` to the log if this node
    /// is the leader, fans the new entry out to every peer, and
    /// returns the index it was assigned. Returns `None` if this node
    /// is not the leader.
    pub async fn start_command(self: &Arc<Self>, command: Vec<u8>) -> Option<(u64, u64)> {
        let mut state = self.state.lock().await;
        if state.role != RaftRole::Leader {
            trace!("{}: rejecting Start() because I am not the leader", self.config.id);
            return None;
        }
        let index = state.log.last_index() + 1;
        let term = state.current_term;
        state.log.append(LogEntry { term, index, command });
        state.match_index.insert(self.config.id.clone(), index);
        self.persist(&state);
        drop(state);

        for peer in self.config.peers.clone() {
            let me = Arc::clone(self);
            tokio::spawn(async move { me.send_append_entries(&peer, true).await });
        }
        Some((index, term))
    }

    /// Compacts the log up through `up_to_index`, replacing it with
    /// `snapshot_data` (an opaque, already-serialized state-machine
    /// snapshot). Called by the dispatcher once it decides the log has
    /// grown large enough to warrant compaction (spec.md 4.5.d).
    pub async fn snapshot(&self, up_to_index: u64, snapshot_data: Vec<u8>) {
        let mut state = self.state.lock().await;
        if up_to_index <= state.log.last_compressed_index() || up_to_index > state.last_applied {
            return;
        }
        if state.log.compress_upto(up_to_index).is_err() {
            return;
        }
        self.persister
            .save_state_and_snapshot(persist::encode_persistent_state(&state.persistent_snapshot()), snapshot_data);
    }

    fn random_election_timeout(config: &RaftConfig) -> Duration {
        let ms = rand::thread_rng()
            .gen_range(config.election_timeout_min_ms..=config.election_timeout_max_ms);
        Duration::from_millis(ms)
    }

    async fn election_loop(self: Arc<Self>) {
        loop {
            let sleep_for = {
                let mut state = self.state.lock().await;
                if !state.alive {
                    return;
                }
                let now = Instant::now();
                if state.role != RaftRole::Leader && now >= state.election_deadline {
                    state.election_deadline = now + Self::random_election_timeout(&self.config);
                    let me = Arc::clone(&self);
                    tokio::spawn(async move { me.run_election().await });
                }
                state.election_deadline.saturating_duration_since(Instant::now())
            };
            tokio::time::sleep(sleep_for.max(Duration::from_millis(5))).await;
        }
    }

    async fn heartbeat_loop(self: Arc<Self>) {
        loop {
            {
                let state = self.state.lock().await;
                if !state.alive {
                    return;
                }
                if state.role == RaftRole::Leader {
                    trace!(
                        "{}: sending heartbeats, commit_index={}",
                        self.config.id, state.commit_index
                    );
                    for peer in self.config.peers.clone() {
                        let me = Arc::clone(&self);
                        tokio::spawn(async move { me.send_append_entries(&peer, true).await });
                    }
                }
            }
            tokio::time::sleep(Duration::from_millis(self.config.heartbeat_interval_ms)).await;
        }
    }

    async fn applier_loop(self: Arc<Self>) {
        loop {
            self.apply_notify.notified().await;
            loop {
                let next;
                let term;
                {
                    let state = self.state.lock().await;
                    if !state.alive {
                        return;
                    }
                    if state.last_applied >= state.commit_index {
                        break;
                    }
                    next = state.last_applied + 1;
                    term = state.current_term;
                }
                let entry = {
                    let state = self.state.lock().await;
                    match state.log.get(next) {
                        Ok(e) => e.clone(),
                        Err(e) => {
                            ::log::error!("{}: applier could not fetch index {next}: {e}", self.config.id);
                            return;
                        }
                    }
                };
                let msg = ApplyMsg { data: entry.command, index: next, term, purpose: ApplyPurpose::Command };
                {
                    let mut state = self.state.lock().await;
                    state.last_applied = next;
                }
                if self.apply_tx.send(msg).is_err() {
                    return;
                }
            }
        }
    }

    fn notify_apply(&self) {
        // `notify_one` (not `notify_waiters`) latches a permit when the
        // applier isn't currently parked on `notified()` -- e.g. still
        // draining its inner loop -- so a commit landing in that window
        // isn't lost until some unrelated later commit wakes it.
        self.apply_notify.notify_one();
    }

    fn persist(&self, state: &RaftState) {
        self.persister.save_raft_state(persist::encode_persistent_state(&state.persistent_snapshot()));
    }

    fn persist_sync(&self) {
        let state = self.state.try_lock().expect("no contention during construction");
        self.persist(&state);
    }

    pub fn config(&self) -> &RaftConfig {
        &self.config
    }
}

#[async_trait::async_trait]
impl crate::transport::RaftRpcHandler for RaftNode {
    async fn on_request_vote(&self, args: rpc::RequestVoteArgs) -> rpc::RequestVoteReply {
        self.handle_request_vote(args).await
    }

    async fn on_append_entries(&self, args: rpc::AppendEntriesArgs) -> rpc::AppendEntriesReply {
        self.handle_append_entries(args).await
    }

    async fn on_install_snapshot(&self, args: rpc::InstallSnapshotArgs) -> rpc::InstallSnapshotReply {
        self.handle_install_snapshot(args).await
    }
}
