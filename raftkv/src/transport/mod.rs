//! The node-to-node transport contract (§6, §9): "ordered, connection-
//! oriented, object-mode request/reply streams between nodes". This module
//! defines only the contract; `tcp` is the production implementation and
//! `loopback` is the in-process fake network used by tests (§9 ambient
//! test tooling).

#[cfg(feature = "tcp-transport")]
pub mod tcp;

pub mod loopback;

use async_trait::async_trait;

use crate::address::NodeId;
use crate::error::TransportError;
use crate::message::Action;
use crate::message::RpcResult;

/// An inbound request handed to a node by its transport's listener, paired
/// with a sink the node uses to push the matching reply back onto the same
/// connection (§9: "replies carry the request id so ordering across RPCs is
/// not required").
pub struct InboundMessage {
    pub from: NodeId,
    pub id: uuid::Uuid,
    pub action: Action,
    pub reply: ReplySink,
}

/// A handle back to the connection an `InboundMessage` arrived on. Cloneable
/// and cheap so it can be carried into the node's request-handling future.
#[derive(Clone)]
pub struct ReplySink {
    tx: tokio::sync::mpsc::UnboundedSender<(uuid::Uuid, RpcResult)>,
}

impl ReplySink {
    pub fn new(tx: tokio::sync::mpsc::UnboundedSender<(uuid::Uuid, RpcResult)>) -> Self {
        Self { tx }
    }

    /// Best-effort: if the connection already dropped, the reply is simply
    /// discarded (the peer will retry on its own schedule, §4.5/§4.7).
    pub fn send(&self, id: uuid::Uuid, result: RpcResult) {
        let _ = self.tx.send((id, result));
    }
}

/// Send a request to `to` and await its reply, or fail with a
/// `TransportError` after the implementation's own timeout/reconnect policy
/// gives up. One in-flight call per peer is the caller's responsibility to
/// enforce where required (§4.5: "at most one in-flight AppendEntries per
/// peer"); `Transport` itself permits concurrent calls to different peers.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send_request(&self, to: &NodeId, action: Action) -> Result<RpcResult, TransportError>;

    /// Drop any cached connection/state for `to` (§4.3 Leave: "schedules
    /// removal after `waitBeforeLeaveMS`"). A no-op for implementations that
    /// keep no per-peer state.
    async fn disconnect(&self, to: &NodeId);
}
