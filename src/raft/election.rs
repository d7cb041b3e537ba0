//! Leader election: candidate-side campaigning and the follower-side
//! vote-granting rule. Ported from `raft_requestvote.go`.

use std::sync::Arc;
use std::time::Instant;

use log::{debug, trace};
use tokio::sync::mpsc;

use super::rpc::{RequestVoteArgs, RequestVoteReply};
use super::state::RaftRole;
use super::RaftNode;

impl RaftNode {
    /// Runs one election to completion: votes for itself, fans
    /// `RequestVote` out to every peer, and becomes leader as soon as
    /// a majority of yes votes is in (or reverts to follower on a
    /// majority of no votes, or the election becomes stale).
    pub(super) async fn run_election(self: Arc<Self>) {
        let (election_term, args) = {
            let mut state = self.state.lock().await;
            if !state.alive {
                return;
            }
            state.current_term += 1;
            state.role = RaftRole::Candidate;
            state.voted_for = Some(self.config().id.clone());
            state.votes_received = std::iter::once(self.config().id.clone()).collect();
            debug!("{}: starting election for term {}", self.config().id, state.current_term);
            self.persist(&state);
            let args = RequestVoteArgs {
                term: state.current_term,
                candidate_id: self.config().id.clone(),
                last_log_index: state.last_log_index(),
                last_log_term: state.last_log_term(),
            };
            (state.current_term, args)
        };

        let (tx, mut rx) = mpsc::unbounded_channel::<RequestVoteReply>();
        for peer in self.config().peers.clone() {
            let me = Arc::clone(&self);
            let tx = tx.clone();
            let args = args.clone();
            tokio::spawn(async move {
                if let Some(reply) = me.send_request_vote(&peer, args).await {
                    let _ = tx.send(reply);
                }
            });
        }
        drop(tx);

        let majority = self.config().majority();
        let mut yes_votes = 1usize;
        let mut no_votes = 0usize;
        while let Some(reply) = rx.recv().await {
            let mut state = self.state.lock().await;
            if state.current_term != election_term || state.role != RaftRole::Candidate {
                trace!("{}: abandoning stale election for term {election_term}", self.config().id);
                return;
            }
            self.maybe_step_down(&mut state, reply.term);
            if state.current_term != election_term {
                return;
            }
            if reply.vote_granted {
                state.votes_received.insert(reply.voter_id);
                yes_votes = state.votes_received.len();
            } else {
                no_votes += 1;
            }
            if yes_votes >= majority {
                debug!("{}: won election for term {election_term}", self.config().id);
                state.role = RaftRole::Leader;
                state.leader_id = Some(self.config().id.clone());
                for peer in &self.config().peers {
                    state.next_index.insert(peer.clone(), state.log.last_index() + 1);
                    state.match_index.insert(peer.clone(), 0);
                }
                state.match_index.insert(self.config().id.clone(), state.log.last_index());
                self.persist(&state);
                drop(state);
                for peer in self.config().peers.clone() {
                    let me = Arc::clone(&self);
                    tokio::spawn(async move { me.send_append_entries(&peer, true).await });
                }
                return;
            }
            if no_votes >= majority {
                debug!("{}: lost election for term {election_term}", self.config().id);
                state.role = RaftRole::Follower;
                self.persist(&state);
                return;
            }
        }
    }

    async fn send_request_vote(&self, peer: &str, args: RequestVoteArgs) -> Option<RequestVoteReply> {
        match self.transport.request_vote(peer, args).await {
            Ok(reply) => Some(reply),
            Err(e) => {
                trace!("{}: RequestVote to {peer} failed: {e}", self.config().id);
                None
            }
        }
    }

    /// Reverts to follower in `term` if `term` is ahead of our own,
    /// mirroring `updateTermIfNecessary`. Returns whether it stepped down.
    pub(super) fn maybe_step_down(&self, state: &mut super::state::RaftState, term: u64) -> bool {
        if term > state.current_term {
            state.become_follower(term);
            state.election_deadline = Instant::now() + Self::random_election_timeout(self.config());
            self.persist(state);
            true
        } else {
            false
        }
    }

    pub(super) async fn handle_request_vote(&self, args: RequestVoteArgs) -> RequestVoteReply {
        let mut state = self.state.lock().await;
        if !state.alive {
            return RequestVoteReply { term: state.current_term, vote_granted: false, voter_id: self.config().id.clone() };
        }
        self.maybe_step_down(&mut state, args.term);

        let my_last_term = state.last_log_term();
        let my_last_index = state.last_log_index();
        let vote_granted = if args.term < state.current_term {
            false
        } else if state.voted_for.is_some() && state.voted_for.as_deref() != Some(args.candidate_id.as_str()) {
            false
        } else if my_last_term > args.last_log_term {
            false
        } else if my_last_term == args.last_log_term && my_last_index > args.last_log_index {
            false
        } else {
            true
        };

        if vote_granted {
            state.voted_for = Some(args.candidate_id.clone());
            state.election_deadline = Instant::now() + Self::random_election_timeout(self.config());
            trace!("{}: voting for {}", self.config().id, args.candidate_id);
        }
        self.persist(&state);
        RequestVoteReply { term: state.current_term, vote_granted, voter_id: self.config().id.clone() }
    }
}
