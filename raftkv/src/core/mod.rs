//! The node state machine (§4.3): role transitions, the vote-granting rule,
//! and the follower side of `AppendEntries`/`RequestVote` handling.
//!
//! Grounded on the teacher's `handle_append_entries_request` shape (reset
//! the election timer first, validate the term, then validate log
//! continuity, then commit) but rewritten against `raftkv`'s own `Log`/
//! `Command` types rather than openraft's generic `AppData`/`RaftStorage`.
//! This module owns no I/O and no channels; `Node` drives it.

use std::collections::HashSet;
use std::time::Duration;
use std::time::Instant;

use crate::address::NodeId;
use crate::command::Index;
use crate::command::Term;
use crate::error::StorageError;
use crate::log::Log;
use crate::message::AppendEntriesRequest;
use crate::message::AppendEntriesResponse;
use crate::message::VoteRequest;
use crate::message::VoteResponse;
use crate::state::Role;
use crate::store::Applied;
use crate::store::PersistentStore;

/// The full state a node's own task owns exclusively (§3 Ownership): role,
/// term, vote, known leader, and peer set. `Log` is tracked alongside it but
/// lives in its own type since `PeerReplicator`s hold a shared, read-only
/// reference to it.
pub struct NodeState {
    pub id: NodeId,
    pub role: Role,
    pub current_term: Term,
    pub voted_for: Option<NodeId>,
    pub current_leader: Option<NodeId>,
    pub peers: HashSet<NodeId>,
    weakened_until: Option<Instant>,
}

impl NodeState {
    pub fn new(id: NodeId, current_term: Term, voted_for: Option<NodeId>, peers: HashSet<NodeId>) -> Self {
        Self {
            id,
            role: Role::Follower,
            current_term,
            voted_for,
            current_leader: None,
            peers,
            weakened_until: None,
        }
    }

    /// If `term` is strictly newer than ours, adopt it and revert to
    /// Follower, resetting `voted_for` (§3: "Voting state resets whenever
    /// term increases"). Returns whether a step-down happened.
    pub fn observe_term(&mut self, term: Term) -> bool {
        if term > self.current_term {
            self.current_term = term;
            self.voted_for = None;
            self.role = Role::Follower;
            true
        } else {
            false
        }
    }

    pub fn become_candidate(&mut self) {
        self.current_term += 1;
        self.role = Role::Candidate;
        self.voted_for = Some(self.id.clone());
        self.current_leader = None;
    }

    pub fn become_leader(&mut self) {
        self.role = Role::Leader;
        self.current_leader = Some(self.id.clone());
    }

    pub fn become_follower(&mut self) {
        self.role = Role::Follower;
    }

    pub fn weaken(&mut self, duration: Duration) {
        self.role = Role::Weakened;
        self.weakened_until = Some(Instant::now() + duration);
    }

    /// Whether a deadline set by `weaken` has passed (§4.3: "Weakened →
    /// Follower | weakened interval elapses").
    pub fn weakened_elapsed(&self) -> bool {
        match self.weakened_until {
            Some(deadline) => Instant::now() >= deadline,
            None => true,
        }
    }

    pub fn recover_from_weakened(&mut self) {
        self.weakened_until = None;
        self.role = Role::Follower;
    }
}

/// The vote-granting rule (§4.3 `isGrantableVote`).
///
/// Grant iff `msg.term >= myTerm` AND (`msg.term > myTerm` OR `votedFor ==
/// None` OR `votedFor == Some(candidate)`) AND the candidate's log is at
/// least as up to date as ours by lexicographic `(term, index)` order.
pub fn is_grantable_vote(
    state: &NodeState,
    my_last_applied_term: Term,
    my_last_applied_index: Index,
    req: &VoteRequest,
) -> bool {
    if req.term < state.current_term {
        return false;
    }
    let term_ok = req.term > state.current_term
        || state.voted_for.is_none()
        || state.voted_for.as_ref() == Some(&req.candidate_id);
    if !term_ok {
        return false;
    }
    (req.last_log_term, req.last_log_index) >= (my_last_applied_term, my_last_applied_index)
}

/// Handle an inbound `RequestVote` (§4.3). Mutates `state`'s term/vote/role
/// on grant. Callers are responsible for persisting the updated term/vote
/// before replying (§4.2 durability invariant) and for restarting the
/// heartbeat timer on grant.
#[tracing::instrument(level = "debug", skip(state, req), fields(candidate = %req.candidate_id, term = req.term))]
pub fn handle_request_vote(
    state: &mut NodeState,
    my_last_applied_term: Term,
    my_last_applied_index: Index,
    req: &VoteRequest,
) -> VoteResponse {
    state.observe_term(req.term);
    let granted = is_grantable_vote(state, my_last_applied_term, my_last_applied_index, req);
    if granted {
        state.voted_for = Some(req.candidate_id.clone());
        state.role = Role::Follower;
    }
    VoteResponse {
        term: state.current_term,
        vote_granted: granted,
    }
}

/// The outcome of handling an inbound `AppendEntries`, including any
/// entries the caller should apply via `PersistentStore` (§4.2: topology
/// commands are handed back to `Node`).
pub struct AppendEntriesOutcome {
    pub response: AppendEntriesResponse,
    pub applied: Vec<(Index, Applied)>,
    pub stepped_down: bool,
}

/// Handle an inbound `AppendEntries` (§4.3 steps 1–6). Resets the caller's
/// heartbeat timer is the caller's responsibility (steps 2 and 4 both touch
/// it, and only `Node` holds the timer).
#[tracing::instrument(level = "debug", skip(state, log, store, req), fields(leader = %req.leader_id, term = req.term, prev_log_index = req.prev_log_index))]
pub async fn handle_append_entries(
    state: &mut NodeState,
    log: &mut Log,
    store: &dyn PersistentStore,
    req: AppendEntriesRequest,
) -> Result<AppendEntriesOutcome, StorageError> {
    if req.term < state.current_term {
        return Ok(AppendEntriesOutcome {
            response: AppendEntriesResponse {
                term: state.current_term,
                success: false,
                next_log_index: log.last_index() + 1,
                reason: Some("stale term".into()),
            },
            applied: Vec::new(),
            stepped_down: false,
        });
    }

    let stepped_down = state.observe_term(req.term);
    if state.current_leader.as_ref() != Some(&req.leader_id) {
        state.current_leader = Some(req.leader_id.clone());
    }
    if !matches!(state.role, Role::Follower) {
        state.role = Role::Follower;
    }

    match log.append_after(req.prev_log_index, req.prev_log_term, req.term, req.entries) {
        Ok(()) => {
            let applied = if req.leader_commit > log.committed_index() {
                log.commit(req.leader_commit.min(log.last_index()), store).await?
            } else {
                Vec::new()
            };
            Ok(AppendEntriesOutcome {
                response: AppendEntriesResponse {
                    term: state.current_term,
                    success: true,
                    next_log_index: log.last_index() + 1,
                    reason: None,
                },
                applied,
                stepped_down,
            })
        }
        Err(continuity) => Ok(AppendEntriesOutcome {
            response: AppendEntriesResponse {
                term: state.current_term,
                success: false,
                next_log_index: continuity.next_log_index,
                reason: Some(format!("continuity error: {continuity}")),
            },
            applied: Vec::new(),
            stepped_down,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Command;

    fn node(port: u16) -> NodeId {
        NodeId::parse(&format!("/ip4/127.0.0.1/tcp/{port}")).unwrap()
    }

    #[test]
    fn grants_vote_when_unvoted_and_log_current() {
        let state = NodeState::new(node(9101), 1, None, HashSet::new());
        let req = VoteRequest {
            term: 1,
            candidate_id: node(9102),
            last_log_index: 0,
            last_log_term: 0,
        };
        assert!(is_grantable_vote(&state, 0, 0, &req));
    }

    #[test]
    fn refuses_vote_for_stale_log() {
        let state = NodeState::new(node(9101), 1, None, HashSet::new());
        let req = VoteRequest {
            term: 1,
            candidate_id: node(9102),
            last_log_index: 0,
            last_log_term: 0,
        };
        // We're ahead: last_applied (1, 5) > candidate's (0, 0).
        assert!(!is_grantable_vote(&state, 1, 5, &req));
    }

    #[test]
    fn refuses_second_vote_in_same_term() {
        let mut state = NodeState::new(node(9101), 1, None, HashSet::new());
        state.voted_for = Some(node(9102));
        let req = VoteRequest {
            term: 1,
            candidate_id: node(9103),
            last_log_index: 0,
            last_log_term: 0,
        };
        assert!(!is_grantable_vote(&state, 0, 0, &req));
    }

    #[test]
    fn grants_again_for_same_candidate_same_term() {
        let mut state = NodeState::new(node(9101), 1, None, HashSet::new());
        state.voted_for = Some(node(9102));
        let req = VoteRequest {
            term: 1,
            candidate_id: node(9102),
            last_log_index: 0,
            last_log_term: 0,
        };
        assert!(is_grantable_vote(&state, 0, 0, &req));
    }

    #[tokio::test]
    async fn append_entries_rejects_stale_term() {
        let mut state = NodeState::new(node(9101), 5, None, HashSet::new());
        let mut log = Log::new(100);
        let store = crate::store::test_support::TestStore::default();
        let req = AppendEntriesRequest {
            term: 3,
            leader_id: node(9102),
            prev_log_index: 0,
            prev_log_term: 0,
            entries: vec![],
            leader_commit: 0,
        };
        let outcome = handle_append_entries(&mut state, &mut log, &store, req).await.unwrap();
        assert!(!outcome.response.success);
        assert_eq!(outcome.response.term, 5);
        assert_eq!(state.current_term, 5);
    }

    #[tokio::test]
    async fn append_entries_adopts_higher_term_and_commits() {
        let mut state = NodeState::new(node(9101), 1, None, HashSet::new());
        let mut log = Log::new(100);
        let store = crate::store::test_support::TestStore::default();
        let entries = vec![crate::command::LogEntry {
            index: 1,
            term: 2,
            command: Command::Put {
                key: "a".into(),
                value: vec![1],
            },
        }];
        let req = AppendEntriesRequest {
            term: 2,
            leader_id: node(9102),
            prev_log_index: 0,
            prev_log_term: 0,
            entries,
            leader_commit: 1,
        };
        let outcome = handle_append_entries(&mut state, &mut log, &store, req).await.unwrap();
        assert!(outcome.response.success);
        assert_eq!(state.current_term, 2);
        assert_eq!(state.current_leader, Some(node(9102)));
        assert_eq!(log.committed_index(), 1);
        assert_eq!(outcome.applied.len(), 1);
    }
}
