//! Log replication and commit-index advancement. Ported from
//! `raft_appendentries.go`, including its conflict-term-optimized
//! backtracking (`ConflictingTerm`/`FirstIndexOfConflictingTerm`) and
//! its snapshot-boundary rejection cases.

use std::sync::Arc;
use std::time::Instant;

use log::trace;

use super::log::LogEntry;
use super::rpc::{AppendEntriesArgs, AppendEntriesReply};
use super::state::RaftRole;
use super::RaftNode;

impl RaftNode {
    /// Sends one AppendEntries (heartbeat if `include_entries` is
    /// false) to `peer` and folds the reply back into leader state:
    /// advances `next_index`/`match_index` on success, retries with a
    /// smaller `next_index` on a conflict, or switches to
    /// InstallSnapshot if the peer needs entries already compacted
    /// away.
    pub(super) async fn send_append_entries(self: Arc<Self>, peer: &str, include_entries: bool) {
        let args = {
            let state = self.state.lock().await;
            if !state.alive || state.role != RaftRole::Leader {
                return;
            }
            let next_index = *state.next_index.get(peer).unwrap_or(&(state.log.last_index() + 1));
            let prev_log_index = next_index.saturating_sub(1);
            if prev_log_index < state.log.last_compressed_index() {
                trace!(
                    "{}: {peer} needs index {prev_log_index} but I've compacted up to {}, sending InstallSnapshot instead",
                    self.config().id, state.log.last_compressed_index()
                );
                let me = Arc::clone(&self);
                let peer = peer.to_string();
                tokio::spawn(async move { me.send_install_snapshot(&peer).await });
                return;
            }
            let prev_log_term = if prev_log_index == state.log.last_compressed_index() {
                state.log.last_compressed_term()
            } else {
                state.log.get(prev_log_index).map(|e| e.term).unwrap_or(0)
            };
            let entries: Vec<LogEntry> = if include_entries {
                state.log.slice_from(next_index).unwrap_or_default()
            } else {
                Vec::new()
            };
            AppendEntriesArgs {
                term: state.current_term,
                leader_id: self.config().id.clone(),
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit: state.commit_index,
            }
        };

        let last_index_sent = args.prev_log_index + args.entries.len() as u64;
        let reply = match self.transport.append_entries(peer, args.clone()).await {
            Ok(r) => r,
            Err(e) => {
                trace!("{}: AppendEntries to {peer} failed: {e}", self.config().id);
                return;
            }
        };

        let mut state = self.state.lock().await;
        self.maybe_step_down(&mut state, reply.term);
        if !state.alive || state.role != RaftRole::Leader || state.current_term != args.term {
            return;
        }

        if reply.success {
            state.next_index.insert(peer.to_string(), last_index_sent + 1);
            state.match_index.insert(peer.to_string(), last_index_sent);
            self.advance_commit_index(&mut state);
        } else {
            let new_next_index = self.resolve_conflict(&state, peer, &reply);
            state.next_index.insert(peer.to_string(), new_next_index.max(1));
            drop(state);
            let me = Arc::clone(&self);
            let peer = peer.to_string();
            tokio::spawn(async move { me.send_append_entries(&peer, include_entries).await });
        }
    }

    fn resolve_conflict(&self, state: &super::state::RaftState, peer: &str, reply: &AppendEntriesReply) -> u64 {
        if let Some(desired) = reply.desired_next_index {
            trace!("{}: {peer} asked for next_index={desired}", self.config().id);
            return desired;
        }
        let conflicting_term = reply.conflicting_term.unwrap_or(0);
        let mut i = state.log.last_index();
        let mut last_index_with_conflicting_term = None;
        while i > state.log.last_compressed_index() {
            match state.log.get(i) {
                Ok(entry) if entry.term == conflicting_term => {
                    last_index_with_conflicting_term = Some(i);
                    break;
                }
                _ => {}
            }
            i -= 1;
        }
        match last_index_with_conflicting_term {
            Some(idx) => idx,
            None => reply.first_index_of_conflicting_term.unwrap_or(1),
        }
    }

    /// Advances `commit_index` to the highest `N` for which a majority
    /// of `match_index` entries are `>= N` and `log[N].term ==
    /// current_term` (the Figure 8 safety rule), then wakes the
    /// applier if it moved.
    pub(super) fn advance_commit_index(&self, state: &mut super::state::RaftState) {
        let mut n = state.commit_index + 1;
        let last = state.log.last_index();
        let majority = self.config().majority();
        let mut new_commit_index = state.commit_index;
        while n <= last {
            let term_matches = state.log.get(n).map(|e| e.term == state.current_term).unwrap_or(false);
            if term_matches {
                let count = state.match_index.values().filter(|&&m| m >= n).count();
                if count >= majority {
                    new_commit_index = n;
                } else {
                    break;
                }
            }
            n += 1;
        }
        if new_commit_index > state.commit_index {
            state.commit_index = new_commit_index;
            self.notify_apply();
        }
    }

    pub(super) async fn handle_append_entries(&self, args: AppendEntriesArgs) -> AppendEntriesReply {
        let mut state = self.state.lock().await;
        if !state.alive {
            return AppendEntriesReply {
                term: state.current_term,
                success: false,
                conflicting_term: None,
                first_index_of_conflicting_term: None,
                desired_next_index: None,
            };
        }
        self.maybe_step_down(&mut state, args.term);

        let mut reply = AppendEntriesReply {
            term: state.current_term,
            success: false,
            conflicting_term: None,
            first_index_of_conflicting_term: None,
            desired_next_index: None,
        };

        if args.term < state.current_term {
            return reply;
        }
        if state.log.last_index() < args.prev_log_index {
            return reply;
        }
        if args.prev_log_index < state.log.last_compressed_index() {
            reply.desired_next_index = Some(state.log.last_compressed_index() + 1);
            return reply;
        }
        if args.prev_log_index == state.log.last_compressed_index()
            && state.log.last_compressed_index() < state.commit_index
        {
            reply.desired_next_index = Some(state.commit_index + 1);
            return reply;
        }
        if !state.log.index_is_compressed(args.prev_log_index) {
            if let Ok(entry) = state.log.get(args.prev_log_index) {
                if entry.term != args.prev_log_term {
                    return reply;
                }
            }
        }

        state.role = RaftRole::Follower;
        state.leader_id = Some(args.leader_id.clone());
        state.election_deadline = Instant::now() + Self::random_election_timeout(self.config());
        reply.success = true;

        for new_entry in &args.entries {
            let index_in_log = new_entry.index;
            if index_in_log <= state.log.last_index() {
                if let Ok(existing) = state.log.get(index_in_log) {
                    if existing.term != new_entry.term {
                        reply.conflicting_term = Some(existing.term);
                        let mut i = index_in_log;
                        while i > 0 && !state.log.index_is_compressed(i) {
                            match state.log.get(i) {
                                Ok(e) if e.term == existing.term => i -= 1,
                                _ => break,
                            }
                        }
                        reply.first_index_of_conflicting_term = Some(i + 1);
                        let _ = state.log.truncate_after(index_in_log - 1);
                        self.persist(&state);
                    }
                }
            }
        }

        let already_have: Vec<LogEntry> = args
            .entries
            .iter()
            .filter(|e| e.index <= state.log.last_index())
            .cloned()
            .collect();
        let to_append: Vec<LogEntry> = args
            .entries
            .into_iter()
            .filter(|e| !already_have.iter().any(|existing| existing == e))
            .collect();
        if !to_append.is_empty() {
            state.log.append_all(to_append);
            self.persist(&state);
        }

        if args.leader_commit > state.commit_index {
            state.commit_index = args.leader_commit.min(state.log.last_index());
            if state.commit_index > state.last_applied {
                self.notify_apply();
            }
        }

        reply.term = state.current_term;
        reply
    }
}
