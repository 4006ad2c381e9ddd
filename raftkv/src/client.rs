//! Leader-forwarding client (§4.7): sends a `Command` to the node believed
//! to be leader, falling back to a uniformly random cluster address when no
//! leader is known, and classifies reply errors into retry-now / retry-
//! delayed / surface-to-caller per spec.md §4.7.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use rand::seq::SliceRandom;
use tokio::sync::RwLock;

use crate::address::NodeId;
use crate::command::Command;
use crate::command::CommandResult;
use crate::error::ContinuityError;
use crate::error::ErrorCode;
use crate::error::RaftError;
use crate::error::RaftResult;
use crate::error::StorageError;
use crate::message::Action;
use crate::message::CommandRequest;
use crate::message::RpcError;
use crate::message::RpcResult;
use crate::node::Node;
use crate::transport::Transport;
use crate::Config;

/// Forwards commands to whichever node is currently leader, retrying per
/// §4.7's error classification. Safe to share across tasks: `RwLock` guards
/// the one piece of mutable state (the last-known leader hint).
pub struct Client {
    config: Config,
    transport: Arc<dyn Transport>,
    known_addresses: Vec<NodeId>,
    current_leader: RwLock<Option<NodeId>>,
    local: Option<Arc<Node>>,
}

impl Client {
    /// `known_addresses` is every cluster member's address, used only as the
    /// random-fallback pool when no leader is known yet (§4.7).
    pub fn new(known_addresses: Vec<NodeId>, transport: Arc<dyn Transport>, config: Config) -> Self {
        Self {
            config,
            transport,
            known_addresses,
            current_leader: RwLock::new(None),
            local: None,
        }
    }

    /// Colocate this client with a `Node`: when the pick recipient is this
    /// node's own id, `command` calls it directly rather than round
    /// tripping over the transport (§4.7: "If recipient is self, call
    /// `node.command(cmd)` locally").
    pub fn with_local_node(mut self, node: Arc<Node>) -> Self {
        self.local = Some(node);
        self
    }

    pub async fn command(&self, cmd: Command) -> RaftResult<CommandResult> {
        self.command_with(cmd, HashSet::new()).await
    }

    pub async fn command_with(&self, cmd: Command, also_wait_for: HashSet<NodeId>) -> RaftResult<CommandResult> {
        let mut last_err = RaftError::Timeout;
        let max_attempts = self.config.client_max_retries.max(1);
        for attempt in 0..max_attempts {
            let recipient = self.pick_recipient().await;
            match self.try_once(&recipient, &cmd, &also_wait_for).await {
                Ok(result) => return Ok(result),
                Err(err) => {
                    let retry_delayed = self.classify(&err).await;
                    last_err = err;
                    match retry_delayed {
                        None => return Err(last_err),
                        Some(true) if attempt + 1 < max_attempts => {
                            tokio::time::sleep(Duration::from_millis(self.config.client_retry_rpc_timeout_ms)).await;
                        }
                        Some(_) => {}
                    }
                }
            }
        }
        Err(last_err)
    }

    /// Classify an error per §4.7. Returns `None` if the error should
    /// surface to the caller immediately, `Some(true)` to retry after
    /// `clientRetryRPCTimeout`, `Some(false)` to retry immediately.
    async fn classify(&self, err: &RaftError) -> Option<bool> {
        match err {
            RaftError::NotConnected | RaftError::Timeout => Some(true),
            RaftError::NotLeader { leader_hint: Some(hint) } => {
                *self.current_leader.write().await = Some(hint.clone());
                Some(false)
            }
            RaftError::NotLeader { leader_hint: None } => Some(true),
            RaftError::NoMajority | RaftError::OutdatedTerm => {
                let has_hint = self.current_leader.read().await.is_some();
                Some(!has_hint)
            }
            _ => None,
        }
    }

    async fn pick_recipient(&self) -> NodeId {
        if let Some(leader) = self.current_leader.read().await.clone() {
            return leader;
        }
        let mut candidates = self.known_addresses.clone();
        if let Some(local) = &self.local {
            if !candidates.contains(local.id()) {
                candidates.push(local.id().clone());
            }
        }
        candidates
            .choose(&mut rand::thread_rng())
            .cloned()
            .unwrap_or_else(|| self.local.as_ref().expect("client has no known addresses").id().clone())
    }

    async fn try_once(&self, recipient: &NodeId, cmd: &Command, also_wait_for: &HashSet<NodeId>) -> RaftResult<CommandResult> {
        if let Some(node) = &self.local {
            if node.id() == recipient {
                return node.command_with(cmd.clone(), also_wait_for.clone()).await;
            }
        }

        let req = CommandRequest {
            command: cmd.clone(),
            also_wait_for: also_wait_for.iter().cloned().collect(),
        };
        match self.transport.send_request(recipient, Action::Command(req)).await {
            Ok(RpcResult::Command(resp)) => Ok(resp.result),
            Ok(RpcResult::Error(err)) => Err(rehydrate(err)),
            Ok(_) => Err(RaftError::MalformedMessage("unexpected reply kind for Command".into())),
            Err(transport_err) => Err(transport_err.into()),
        }
    }
}

fn rehydrate(err: RpcError) -> RaftError {
    match err.code {
        ErrorCode::NotLeader => RaftError::NotLeader { leader_hint: err.leader },
        ErrorCode::NoMajority => RaftError::NoMajority,
        ErrorCode::OutdatedTerm => RaftError::OutdatedTerm,
        ErrorCode::Timeout => RaftError::Timeout,
        ErrorCode::NotConnected => RaftError::NotConnected,
        ErrorCode::ContinuityError => RaftError::Continuity(ContinuityError { next_log_index: 0 }),
        ErrorCode::SnapshotCancelled => RaftError::SnapshotCancelled,
        ErrorCode::MalformedMessage => RaftError::MalformedMessage(err.message),
        ErrorCode::StorageError => RaftError::Storage(StorageError::Io(err.message)),
        ErrorCode::ShuttingDown => RaftError::ShuttingDown,
    }
}
