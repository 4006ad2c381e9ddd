//! A small, lock-guarded view of term/role/peers shared between a node's own
//! task and the actors it spawns (§5: "PeerReplicators hold a shared
//! reference to Log ... but never mutate the Log" — the same read-mostly
//! sharing applies here, so `PeerReplicator`, `Client`, and the consensus
//! seek can read current term/leader/peers without round-tripping through
//! the node's mailbox).
//!
//! Only `Node` ever takes the write lock; every other holder only reads.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::address::NodeId;
use crate::command::Term;
use crate::state::Role;

#[derive(Clone, Debug)]
pub struct SharedView {
    pub current_term: Term,
    pub role: Role,
    pub current_leader: Option<NodeId>,
    pub peers: HashSet<NodeId>,
}

pub type Shared = Arc<RwLock<SharedView>>;

pub fn new_shared(current_term: Term, peers: HashSet<NodeId>) -> Shared {
    Arc::new(RwLock::new(SharedView {
        current_term,
        role: Role::Follower,
        current_leader: None,
        peers,
    }))
}
