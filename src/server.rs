//! The replicated application layer: the RPC entrypoint a clerk talks
//! to, deduplication, commit routing, and snapshot triggering. Ported
//! from `fs_server.go`'s `Operation` handler and the original's
//! `applierThread`-consumer loop, minus the reflection-based
//! `[]interface{}` reply shape (see `crate::ops` for the replacement).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, Mutex as AsyncMutex};

use crate::fs::{MemoryFS, OpenFlags, OpenMode, SeekMode};
use crate::ops::{OpKind, OperationArgs, OperationReply, OperationRequest, ReplyStatus, ReplyValue};
use crate::persister::Persister;
use crate::raft::{ApplyMsg, ApplyPurpose, RaftNode};

/// How long a submitted operation waits for its commit to come back
/// around through the apply loop before concluding leadership was
/// lost mid-flight.
const APPLY_TIMEOUT: Duration = Duration::from_secs(2);

struct PendingReply {
    clerk_id: u64,
    clerk_seq: u64,
    term: u64,
    reply_tx: oneshot::Sender<OperationReply>,
}

/// The state-machine-serialized payload a snapshot carries: the
/// filesystem tree plus the dedup bookkeeping, so that a node which
/// restores from a snapshot sees the exact same "have I already run
/// this (clerk_id, clerk_seq)?" answers as the node that produced it
/// (spec.md 9, "Global dedup maps ... must round-trip through
/// snapshots").
#[derive(Serialize, Deserialize)]
struct ServerSnapshot {
    fs: MemoryFS,
    clerk_seq_executed: HashMap<u64, u64>,
    last_command_index_executed: u64,
}

struct Dispatcher {
    fs: MemoryFS,
    /// Highest `clerk_seq` this dispatcher has executed per clerk
    /// (spec.md 3's `ServerState.clerk_seq_executed`).
    clerk_seq_executed: HashMap<u64, u64>,
    /// The reply produced for each clerk's most recently executed
    /// `clerk_seq`, cached so a retried duplicate can be answered
    /// without re-running it against `fs`.
    last_reply_per_clerk: HashMap<u64, OperationReply>,
    /// Highest raft log index whose command has actually been run
    /// against `fs` (spec.md 3's `ServerState.last_command_index_executed`).
    last_command_index_executed: u64,
    pending: HashMap<u64, PendingReply>,
}

impl Dispatcher {
    fn executed_seq(&self, clerk_id: u64) -> u64 {
        self.clerk_seq_executed.get(&clerk_id).copied().unwrap_or(0)
    }
}

pub struct FileServer {
    raft: Arc<RaftNode>,
    persister: Arc<dyn Persister>,
    dispatcher: AsyncMutex<Dispatcher>,
    max_raft_state_bytes: Option<usize>,
}

impl FileServer {
    /// Builds a server around an already-constructed `RaftNode`,
    /// restoring the filesystem from any persisted snapshot, and
    /// spawns the task that drains `apply_rx` forever.
    pub fn new(
        raft: Arc<RaftNode>,
        persister: Arc<dyn Persister>,
        apply_rx: tokio::sync::mpsc::UnboundedReceiver<ApplyMsg>,
        max_raft_state_bytes: Option<usize>,
    ) -> Arc<Self> {
        let snapshot = persister.snapshot();
        let (fs, clerk_seq_executed, last_command_index_executed) = if snapshot.is_empty() {
            (MemoryFS::new(), HashMap::new(), 0)
        } else {
            match decode_server_snapshot(&snapshot) {
                Ok(s) => (s.fs, s.clerk_seq_executed, s.last_command_index_executed),
                Err(e) => {
                    error!("failed to restore filesystem from snapshot: {e}, starting empty");
                    (MemoryFS::new(), HashMap::new(), 0)
                }
            }
        };

        let server = Arc::new(FileServer {
            raft,
            persister,
            dispatcher: AsyncMutex::new(Dispatcher {
                fs,
                clerk_seq_executed,
                last_reply_per_clerk: HashMap::new(),
                last_command_index_executed,
                pending: HashMap::new(),
            }),
            max_raft_state_bytes,
        });

        let me = Arc::clone(&server);
        tokio::spawn(async move { me.apply_loop(apply_rx).await });
        server
    }

    pub async fn kill(&self) {
        self.raft.kill().await;
        let mut d = self.dispatcher.lock().await;
        for (_, pending) in d.pending.drain() {
            let _ = pending.reply_tx.send(OperationReply::killed());
        }
    }

    /// The single RPC entrypoint: submit one operation, wait for it to
    /// commit and apply, and return its reply. Deduplicates against
    /// the clerk's last submission before ever touching raft.
    pub async fn operation(&self, req: OperationRequest) -> OperationReply {
        {
            let d = self.dispatcher.lock().await;
            if d.executed_seq(req.clerk_id) == req.clerk_seq {
                if let Some(reply) = d.last_reply_per_clerk.get(&req.clerk_id) {
                    return reply.clone();
                }
            }
        }

        let (_, is_leader) = self.raft.get_state().await;
        if !is_leader {
            return OperationReply::not_leader();
        }

        let encoded = bincode::serialize(&req).expect("OperationRequest is always serializable");
        let (index, term) = match self.raft.start_command(encoded).await {
            Some(pair) => pair,
            None => return OperationReply::not_leader(),
        };

        let (tx, rx) = oneshot::channel();
        {
            let mut d = self.dispatcher.lock().await;
            d.pending.insert(
                index,
                PendingReply { clerk_id: req.clerk_id, clerk_seq: req.clerk_seq, term, reply_tx: tx },
            );
        }

        match tokio::time::timeout(APPLY_TIMEOUT, rx).await {
            Ok(Ok(reply)) => reply,
            _ => {
                let mut d = self.dispatcher.lock().await;
                d.pending.remove(&index);
                OperationReply::not_leader()
            }
        }
    }

    async fn apply_loop(self: Arc<Self>, mut apply_rx: tokio::sync::mpsc::UnboundedReceiver<ApplyMsg>) {
        while let Some(msg) = apply_rx.recv().await {
            match msg.purpose {
                ApplyPurpose::Command => self.apply_command(msg).await,
                ApplyPurpose::StateReset => self.apply_state_reset(msg).await,
            }
        }
    }

    /// Runs one committed command against `fs`, per spec.md 4.5's
    /// applier-loop steps a-c: a duplicate (by `clerk_seq` or by
    /// `apply_index`) is skipped rather than re-executed; a genuinely
    /// new command must land at exactly
    /// `last_command_index_executed + 1` / `clerk_seq_executed + 1`,
    /// which we check rather than assume, since an out-of-order apply
    /// would otherwise silently desync the replicas.
    async fn apply_command(&self, msg: ApplyMsg) {
        let req: OperationRequest = match bincode::deserialize(&msg.data) {
            Ok(req) => req,
            Err(e) => {
                error!("failed to decode committed operation at index {}: {e}", msg.index);
                return;
            }
        };

        let mut d = self.dispatcher.lock().await;
        let executed_seq = d.executed_seq(req.clerk_id);
        let is_duplicate = req.clerk_seq <= executed_seq || msg.index <= d.last_command_index_executed;

        if is_duplicate {
            if req.clerk_seq == executed_seq {
                if let Some(reply) = d.last_reply_per_clerk.get(&req.clerk_id).cloned() {
                    self.deliver(&mut d, msg.index, req.clerk_id, req.clerk_seq, reply);
                }
            }
            return;
        }

        debug_assert_eq!(
            msg.index,
            d.last_command_index_executed + 1,
            "apply index must increase by exactly one per non-duplicate command"
        );
        debug_assert_eq!(
            req.clerk_seq,
            executed_seq + 1,
            "clerk_seq must increase by exactly one per non-duplicate command from that clerk"
        );

        let reply_value = apply_to_fs(&mut d.fs, &req.args);
        let reply = OperationReply::ok(reply_value);
        d.clerk_seq_executed.insert(req.clerk_id, req.clerk_seq);
        d.last_reply_per_clerk.insert(req.clerk_id, reply.clone());
        d.last_command_index_executed = msg.index;
        self.deliver(&mut d, msg.index, req.clerk_id, req.clerk_seq, reply);
        drop(d);

        if let Some(max_bytes) = self.max_raft_state_bytes {
            if self.persister.raft_state_size() > max_bytes {
                let snapshot = {
                    let d = self.dispatcher.lock().await;
                    encode_server_snapshot(&d)
                };
                self.raft.snapshot(msg.index, snapshot).await;
            }
        }
    }

    /// Handles an `ApplyPurpose::StateReset` message (spec.md 4.2's
    /// `InstallSnapshot` cases 3-5): only replaces state if the
    /// snapshot is actually ahead of what we've already executed,
    /// otherwise it's a stale/duplicate reset and is ignored.
    async fn apply_state_reset(&self, msg: ApplyMsg) {
        let mut d = self.dispatcher.lock().await;
        if msg.index <= d.last_command_index_executed {
            trace_ignored_state_reset(msg.index, d.last_command_index_executed);
            return;
        }
        let restored = match decode_server_snapshot(&msg.data) {
            Ok(s) => s,
            Err(e) => {
                error!("failed to apply InstallSnapshot state reset at index {}: {e}", msg.index);
                return;
            }
        };
        d.fs = restored.fs;
        d.clerk_seq_executed = restored.clerk_seq_executed;
        d.last_command_index_executed = d.last_command_index_executed.max(msg.index);
        d.last_reply_per_clerk.clear();
        self.persister.save_state_and_snapshot(self.persister.raft_state(), msg.data.clone());
        info!("filesystem state reset from snapshot ending at index {}", msg.index);
        for (_, pending) in d.pending.drain() {
            let _ = pending.reply_tx.send(OperationReply::not_leader());
        }
    }

    /// Hands the reply to whichever in-flight `operation()` call is
    /// waiting on this index. If some *other* in-progress call is
    /// registered at the same index, this leader silently lost
    /// leadership between submission and commit (someone else's
    /// command landed where ours was expected) -- per spec.md 4.5.e,
    /// every other in-progress call is failed too, since none of them
    /// can trust their own expected index any more either.
    fn deliver(&self, d: &mut Dispatcher, index: u64, clerk_id: u64, clerk_seq: u64, reply: OperationReply) {
        let Some(pending) = d.pending.remove(&index) else { return };
        if pending.clerk_id == clerk_id && pending.clerk_seq == clerk_seq {
            let _ = pending.reply_tx.send(reply);
            return;
        }
        warn!(
            "index {index} committed a different operation than the one awaited on this node \
             (expected clerk {}/{}, got {}/{}); this leader silently lost leadership, failing all in-progress ops",
            pending.clerk_id, pending.clerk_seq, clerk_id, clerk_seq
        );
        let _ = pending.reply_tx.send(OperationReply::not_leader());
        for (_, other) in d.pending.drain() {
            let _ = other.reply_tx.send(OperationReply::not_leader());
        }
    }
}

/// Bundles the filesystem plus dedup bookkeeping into one snapshot
/// payload (spec.md 9, "Global dedup maps").
fn encode_server_snapshot(d: &Dispatcher) -> Vec<u8> {
    let snapshot = ServerSnapshot {
        fs: d.fs.clone(),
        clerk_seq_executed: d.clerk_seq_executed.clone(),
        last_command_index_executed: d.last_command_index_executed,
    };
    bincode::serialize(&snapshot).expect("ServerSnapshot is always serializable")
}

fn decode_server_snapshot(bytes: &[u8]) -> Result<ServerSnapshot, bincode::Error> {
    bincode::deserialize(bytes)
}

fn trace_ignored_state_reset(snapshot_index: u64, already_executed: u64) {
    log::trace!(
        "ignoring stale state reset ending at index {snapshot_index}; already executed through {already_executed}"
    );
}

/// Applies one decoded operation to the filesystem state machine and
/// builds the matching `ReplyValue`. This is the deterministic core
/// that every node in the cluster runs identically over the same
/// committed log, so it must never consult the clock, RNG, or any
/// other ambient state.
fn apply_to_fs(fs: &mut MemoryFS, args: &OperationArgs) -> ReplyValue {
    match args.op {
        OpKind::Mkdir => {
            let path = args.path.as_deref().unwrap_or_default();
            match fs.mkdir(path) {
                Ok(()) => ReplyValue::Mkdir { success: true, err: None },
                Err(e) => ReplyValue::Mkdir { success: false, err: Some(e) },
            }
        }
        OpKind::Open => {
            let path = args.path.as_deref().unwrap_or_default();
            let mode = args.mode.unwrap_or(OpenMode::ReadOnly);
            let flags = args.flags.unwrap_or_else(OpenFlags::empty);
            match fs.open(path, mode, flags) {
                Ok(fd) => ReplyValue::Open { fd, err: None },
                Err(e) => ReplyValue::Open { fd: -1, err: Some(e) },
            }
        }
        OpKind::Close => {
            let fd = args.fd.unwrap_or(-1);
            match fs.close(fd) {
                Ok(()) => ReplyValue::Close { success: true, err: None },
                Err(e) => ReplyValue::Close { success: false, err: Some(e) },
            }
        }
        OpKind::Seek => {
            let fd = args.fd.unwrap_or(-1);
            let offset = args.offset.unwrap_or(0);
            let whence = args.whence.unwrap_or(SeekMode::FromBeginning);
            match fs.seek(fd, offset, whence) {
                Ok(new_offset) => ReplyValue::Seek { new_offset, err: None },
                Err(e) => ReplyValue::Seek { new_offset: -1, err: Some(e) },
            }
        }
        OpKind::Read => {
            let fd = args.fd.unwrap_or(-1);
            let num_bytes = args.num_bytes.unwrap_or(0);
            match fs.read(fd, num_bytes) {
                Ok((n, data)) => ReplyValue::Read { n, data, err: None },
                Err(e) => ReplyValue::Read { n: 0, data: Vec::new(), err: Some(e) },
            }
        }
        OpKind::Write => {
            let fd = args.fd.unwrap_or(-1);
            let num_bytes = args.num_bytes.unwrap_or(0);
            let empty = Vec::new();
            let data = args.data.as_ref().unwrap_or(&empty);
            match fs.write(fd, num_bytes, data) {
                Ok(n) => ReplyValue::Write { n, err: None },
                Err(e) => ReplyValue::Write { n: 0, err: Some(e) },
            }
        }
        OpKind::Delete => {
            let path = args.path.as_deref().unwrap_or_default();
            match fs.delete(path) {
                Ok(()) => ReplyValue::Delete { success: true, err: None },
                Err(e) => ReplyValue::Delete { success: false, err: Some(e) },
            }
        }
    }
}

#[async_trait::async_trait]
impl crate::transport::ClientRpcHandler for FileServer {
    async fn on_operation(&self, req: OperationRequest) -> OperationReply {
        self.operation(req).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::error::FsError;

    #[test]
    fn apply_mkdir_then_open_create_then_write() {
        let mut fs = MemoryFS::new();
        let reply = apply_to_fs(&mut fs, &OperationArgs::mkdir("/a"));
        assert!(matches!(reply, ReplyValue::Mkdir { success: true, err: None }));

        let reply = apply_to_fs(&mut fs, &OperationArgs::open("/a/f", OpenMode::ReadWrite, OpenFlags::CREATE));
        let fd = match reply {
            ReplyValue::Open { fd, err: None } => fd,
            other => panic!("unexpected reply {other:?}"),
        };

        let reply = apply_to_fs(&mut fs, &OperationArgs::write(fd, 3, b"abc".to_vec()));
        assert!(matches!(reply, ReplyValue::Write { n: 3, err: None }));
    }

    #[test]
    fn apply_open_missing_path_surfaces_not_found() {
        let mut fs = MemoryFS::new();
        let reply = apply_to_fs(&mut fs, &OperationArgs::open("/nope", OpenMode::ReadOnly, OpenFlags::empty()));
        assert!(matches!(reply, ReplyValue::Open { fd: -1, err: Some(FsError::NotFound) }));
    }
}
