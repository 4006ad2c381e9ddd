//! Observability feed for a running `Node`, modeled on `openraft`'s
//! `RaftMetrics`/`watch::Receiver` pattern. Not named by the spec, but an
//! ambient concern every node in the corpus exposes in some form — `Client`
//! uses it to pick a recipient (§4.7) instead of guessing blind.

use tokio::sync::watch;

use crate::address::NodeId;
use crate::command::Index;
use crate::command::Term;
use crate::state::Role;

/// A point-in-time snapshot of a node's Raft-level state.
#[derive(Clone, Debug, PartialEq)]
pub struct NodeMetrics {
    pub id: NodeId,
    pub role: Role,
    pub current_term: Term,
    /// Lowest index still retained in memory (§4.1 retention window); lets
    /// tests observe compaction without reaching into `Log` directly.
    pub first_log_index: Index,
    pub last_log_index: Index,
    pub last_applied_index: Index,
    pub committed_index: Index,
    pub current_leader: Option<NodeId>,
}

impl NodeMetrics {
    pub fn new_initial(id: NodeId) -> Self {
        Self {
            id,
            role: Role::Follower,
            current_term: 0,
            first_log_index: 1,
            last_log_index: 0,
            last_applied_index: 0,
            committed_index: 0,
            current_leader: None,
        }
    }
}

/// The writer half, held by `Node`.
pub struct MetricsReporter {
    tx: watch::Sender<NodeMetrics>,
}

impl MetricsReporter {
    pub fn new(id: NodeId) -> (Self, watch::Receiver<NodeMetrics>) {
        let (tx, rx) = watch::channel(NodeMetrics::new_initial(id));
        (Self { tx }, rx)
    }

    pub fn report(&self, f: impl FnOnce(&mut NodeMetrics)) {
        self.tx.send_modify(f);
    }
}
