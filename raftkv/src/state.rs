//! The node role enum (§4.3). Kept separate from `core` so `metrics` and
//! `client` can depend on it without pulling in the state machine itself.

use serde::Deserialize;
use serde::Serialize;

/// A node's current position in the Raft state machine.
///
/// Transition table (§4.3):
///
/// | From → To | Trigger |
/// |-----------|---------|
/// | any → Follower | higher term seen; valid AppendEntries from current-term leader |
/// | Follower → Candidate | heartbeat timeout |
/// | Candidate → Candidate | election timeout without majority (new term) |
/// | Candidate → Leader | majority of granted votes including self |
/// | Candidate → Follower | AppendEntries for current or newer term |
/// | Leader → Follower | higher term seen |
/// | any → Weakened | explicit `weaken(duration)` |
/// | Weakened → Follower | weakened interval elapses |
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
    Weakened,
}

impl Role {
    pub fn is_leader(&self) -> bool {
        matches!(self, Role::Leader)
    }

    pub fn is_follower(&self) -> bool {
        matches!(self, Role::Follower)
    }

    pub fn is_candidate(&self) -> bool {
        matches!(self, Role::Candidate)
    }

    pub fn is_weakened(&self) -> bool {
        matches!(self, Role::Weakened)
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Role::Follower => "follower",
            Role::Candidate => "candidate",
            Role::Leader => "leader",
            Role::Weakened => "weakened",
        };
        f.write_str(s)
    }
}
