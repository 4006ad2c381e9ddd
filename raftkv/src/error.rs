//! Error kinds (§7). Propagation rules live with the code that recovers from
//! each kind; this module only defines the vocabulary.

use thiserror::Error;

use crate::address::NodeId;
use crate::command::Index;

/// Errors surfaced by the storage backend (§4.2). Fatal to the in-flight
/// command, logged, but never terminates the node (§7).
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage io error: {0}")]
    Io(String),
    #[error("storage corruption: {0}")]
    Corrupt(String),
}

/// Errors surfaced by the transport layer (§6). Recovered at the transport
/// layer by retrying on the next heartbeat/reconnect attempt (§7).
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("not connected to {0}")]
    NotConnected(NodeId),
    #[error("connection reset")]
    ConnectionReset,
    #[error("connection refused")]
    ConnectionRefused,
    #[error("request timed out")]
    Timeout,
    #[error("malformed message: {0}")]
    Malformed(String),
}

/// The follower rejected an `appendAfter` due to a continuity gap (§4.1).
#[derive(Debug, Error)]
#[error("log continuity error, retry from index {next_log_index}")]
pub struct ContinuityError {
    pub next_log_index: Index,
}

/// Errors surfaced to a command caller (§7, §8).
#[derive(Debug, Error)]
pub enum RaftError {
    #[error("not leader{}", .leader_hint.as_ref().map(|l| format!(", try {l}")).unwrap_or_default())]
    NotLeader { leader_hint: Option<NodeId> },

    #[error("no majority of voters confirmed the operation")]
    NoMajority,

    #[error("term is outdated, reverting to follower")]
    OutdatedTerm,

    #[error("operation timed out")]
    Timeout,

    #[error("not connected to peer")]
    NotConnected,

    #[error(transparent)]
    Continuity(#[from] ContinuityError),

    #[error("snapshot transfer was cancelled")]
    SnapshotCancelled,

    #[error("malformed message: {0}")]
    MalformedMessage(String),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("node is shutting down")]
    ShuttingDown,
}

impl From<TransportError> for RaftError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::NotConnected(_) => RaftError::NotConnected,
            TransportError::ConnectionReset => RaftError::NotConnected,
            TransportError::ConnectionRefused => RaftError::NotConnected,
            TransportError::Timeout => RaftError::Timeout,
            TransportError::Malformed(m) => RaftError::MalformedMessage(m),
        }
    }
}

/// A stable, wire-friendly classification of `RaftError`, carried on the
/// `error` field of a reply `Envelope` (§6) so a forwarding `Client` can
/// decide whether to retry without downcasting strings.
#[derive(Clone, Copy, Debug, Eq, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum ErrorCode {
    NotLeader,
    NoMajority,
    OutdatedTerm,
    Timeout,
    NotConnected,
    ContinuityError,
    SnapshotCancelled,
    MalformedMessage,
    StorageError,
    ShuttingDown,
}

impl RaftError {
    pub fn code(&self) -> ErrorCode {
        match self {
            RaftError::NotLeader { .. } => ErrorCode::NotLeader,
            RaftError::NoMajority => ErrorCode::NoMajority,
            RaftError::OutdatedTerm => ErrorCode::OutdatedTerm,
            RaftError::Timeout => ErrorCode::Timeout,
            RaftError::NotConnected => ErrorCode::NotConnected,
            RaftError::Continuity(_) => ErrorCode::ContinuityError,
            RaftError::SnapshotCancelled => ErrorCode::SnapshotCancelled,
            RaftError::MalformedMessage(_) => ErrorCode::MalformedMessage,
            RaftError::Storage(_) => ErrorCode::StorageError,
            RaftError::ShuttingDown => ErrorCode::ShuttingDown,
        }
    }

    pub fn leader_hint(&self) -> Option<&NodeId> {
        match self {
            RaftError::NotLeader { leader_hint } => leader_hint.as_ref(),
            _ => None,
        }
    }
}

pub type RaftResult<T> = Result<T, RaftError>;
