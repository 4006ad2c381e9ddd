//! The wire message schema (§6). `Transport` impls are responsible for
//! framing and serializing `Envelope`; this module only defines the shape.

use serde::Deserialize;
use serde::Serialize;
use uuid::Uuid;

use crate::address::NodeId;
use crate::command::Command;
use crate::command::CommandResult;
use crate::command::Index;
use crate::command::LogEntry;
use crate::command::Term;
use crate::error::ErrorCode;

/// A self-delimiting request or reply sent between two nodes over a single
/// `Transport` connection.
#[derive(Debug, Serialize, Deserialize)]
pub struct Envelope {
    pub from: NodeId,
    pub to: NodeId,
    pub id: Uuid,
    pub body: Body,
}

impl Envelope {
    pub fn request(from: NodeId, to: NodeId, action: Action) -> Self {
        Self {
            from,
            to,
            id: Uuid::new_v4(),
            body: Body::Request(action),
        }
    }

    pub fn reply(&self, from: NodeId, result: RpcResult) -> Self {
        Self {
            from,
            to: self.from.clone(),
            id: self.id,
            body: Body::Reply(result),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub enum Body {
    Request(Action),
    Reply(RpcResult),
}

/// The request-side payload variants (§6).
#[derive(Debug, Serialize, Deserialize)]
pub enum Action {
    RequestVote(VoteRequest),
    AppendEntries(AppendEntriesRequest),
    InstallSnapshot(InstallSnapshotRequest),
    Command(CommandRequest),
}

/// The reply-side payload variants, one per `Action`, or a carried error.
#[derive(Debug, Serialize, Deserialize)]
pub enum RpcResult {
    Vote(VoteResponse),
    AppendEntries(AppendEntriesResponse),
    InstallSnapshot(InstallSnapshotResponse),
    Command(CommandResponse),
    Error(RpcError),
}

/// An error envelope: a stable `code` plus an optional leader hint so the
/// forwarding `Client` can route a retry without downcasting a string (§6,
/// §4.7).
#[derive(Debug, Serialize, Deserialize)]
pub struct RpcError {
    pub message: String,
    pub code: ErrorCode,
    pub leader: Option<NodeId>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct VoteRequest {
    pub term: Term,
    pub candidate_id: NodeId,
    pub last_log_index: Index,
    pub last_log_term: Term,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct VoteResponse {
    pub term: Term,
    pub vote_granted: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    pub term: Term,
    pub leader_id: NodeId,
    pub prev_log_index: Index,
    pub prev_log_term: Term,
    pub entries: Vec<LogEntry>,
    pub leader_commit: Index,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    pub term: Term,
    pub success: bool,
    pub next_log_index: Index,
    pub reason: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct InstallSnapshotRequest {
    pub term: Term,
    pub leader_id: NodeId,
    pub offset: u64,
    pub data: Vec<(String, Vec<u8>)>,
    pub done: bool,
    pub last_index: Option<Index>,
    pub last_term: Option<Term>,
    pub peers: Option<Vec<NodeId>>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct InstallSnapshotResponse {
    pub term: Term,
    pub cancel: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CommandRequest {
    pub command: Command,
    /// Addresses that must explicitly confirm the command in addition to
    /// quorum (§4.4 `alsoWaitFor`).
    pub also_wait_for: Vec<NodeId>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CommandResponse {
    pub result: CommandResult,
}
