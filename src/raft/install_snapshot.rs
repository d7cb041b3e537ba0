//! Snapshot installation: the leader-side sender and the follower-side
//! five-case handler. Ported from `raft_install_snapshot.go`.

use std::sync::Arc;
use std::time::Instant;

use log::trace;

use super::rpc::{InstallSnapshotArgs, InstallSnapshotReply};
use super::state::RaftRole;
use super::{ApplyMsg, ApplyPurpose, RaftNode};

impl RaftNode {
    pub(super) async fn send_install_snapshot(self: Arc<Self>, peer: &str) {
        let args = {
            let state = self.state.lock().await;
            if !state.alive || state.role != RaftRole::Leader {
                return;
            }
            InstallSnapshotArgs {
                term: state.current_term,
                leader_id: self.config().id.clone(),
                last_included_index: state.log.last_compressed_index(),
                last_included_term: state.log.last_compressed_term(),
                data: self.persister.snapshot(),
            }
        };
        trace!(
            "{}: sending InstallSnapshot to {peer}, last_included_index={}",
            self.config().id, args.last_included_index
        );

        let reply = match self.transport.install_snapshot(peer, args.clone()).await {
            Ok(r) => r,
            Err(e) => {
                trace!("{}: InstallSnapshot to {peer} failed: {e}", self.config().id);
                return;
            }
        };

        let mut state = self.state.lock().await;
        if !state.alive || state.role != RaftRole::Leader {
            return;
        }
        self.maybe_step_down(&mut state, reply.term);
        if state.role == RaftRole::Leader {
            state.match_index.insert(peer.to_string(), args.last_included_index);
            state.next_index.insert(peer.to_string(), args.last_included_index + 1);
        }
    }

    /// Five-way split on where `args.last_included_index` falls
    /// relative to our own compacted/applied/committed/log-end marks,
    /// exactly as the original enumerates them.
    pub(super) async fn handle_install_snapshot(&self, args: InstallSnapshotArgs) -> InstallSnapshotReply {
        let mut state = self.state.lock().await;
        let reply_term = state.current_term;
        if args.term < reply_term {
            return InstallSnapshotReply { term: reply_term };
        }

        self.maybe_step_down(&mut state, args.term);
        state.election_deadline = Instant::now() + Self::random_election_timeout(self.config());

        let last_in_snapshot = state.log.last_compressed_index();

        if args.last_included_index <= last_in_snapshot {
            trace!(
                "{}: ignoring stale InstallSnapshot ending at {}, already compacted to {last_in_snapshot}",
                self.config().id, args.last_included_index
            );
            return InstallSnapshotReply { term: state.current_term };
        }

        if last_in_snapshot < args.last_included_index && args.last_included_index <= state.last_applied {
            self.persister
                .save_state_and_snapshot(bincode::serialize(&state.persistent_snapshot()).unwrap(), args.data.clone());
            return InstallSnapshotReply { term: state.current_term };
        }

        let reset_needed = state.last_applied < args.last_included_index;
        if state.last_applied < args.last_included_index && args.last_included_index <= state.commit_index {
            state.last_applied = args.last_included_index;
        } else if state.commit_index < args.last_included_index && args.last_included_index < state.log.last_index() {
            state.last_applied = args.last_included_index;
            state.commit_index = args.last_included_index;
        } else if state.log.last_index() <= args.last_included_index {
            state.last_applied = args.last_included_index;
            state.commit_index = args.last_included_index;
        }

        let _ = state.log.compress_upto(args.last_included_index);
        state.log.set_last_compressed_term(args.last_included_term);
        self.persister
            .save_state_and_snapshot(bincode::serialize(&state.persistent_snapshot()).unwrap(), args.data.clone());

        let reply = InstallSnapshotReply { term: state.current_term };
        drop(state);

        if reset_needed {
            let msg = ApplyMsg {
                data: args.data,
                index: args.last_included_index,
                term: args.last_included_term,
                purpose: ApplyPurpose::StateReset,
            };
            let _ = self.apply_tx.send(msg);
        }
        reply
    }
}
