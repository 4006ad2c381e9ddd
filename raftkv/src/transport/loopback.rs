//! An in-process fake network: the "no real sockets in unit tests" pattern
//! used throughout the corpus (e.g. `stores/memstore` stands in for
//! `rocksdb_store` the same way). Every registered node's inbound queue is
//! just an `mpsc::Sender`; `send_request` looks the recipient up by
//! `NodeId` and hands it an `InboundMessage` directly, with no serialization
//! round-trip. This is what `tests/` uses to run the multi-node scenarios of
//! spec.md §8 without binding TCP ports.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::address::NodeId;
use crate::error::TransportError;
use crate::message::Action;
use crate::message::RpcResult;
use crate::transport::InboundMessage;
use crate::transport::ReplySink;
use crate::transport::Transport;

/// The shared switchboard: maps a registered `NodeId` to the `mpsc::Sender`
/// its `Node` reads inbound requests from.
pub struct LoopbackNetwork {
    routes: Mutex<HashMap<NodeId, mpsc::Sender<InboundMessage>>>,
}

impl LoopbackNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            routes: Mutex::new(HashMap::new()),
        })
    }

    pub fn register(&self, id: NodeId, inbound_tx: mpsc::Sender<InboundMessage>) {
        self.routes.lock().unwrap().insert(id, inbound_tx);
    }

    pub fn unregister(&self, id: &NodeId) {
        self.routes.lock().unwrap().remove(id);
    }

    /// Build a `Transport` handle for `from` on this switchboard.
    pub fn transport_for(self: &Arc<Self>, from: NodeId) -> LoopbackTransport {
        LoopbackTransport {
            from,
            network: self.clone(),
        }
    }
}

#[derive(Clone)]
pub struct LoopbackTransport {
    from: NodeId,
    network: Arc<LoopbackNetwork>,
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn send_request(&self, to: &NodeId, action: Action) -> Result<RpcResult, TransportError> {
        let inbound_tx = self
            .network
            .routes
            .lock()
            .unwrap()
            .get(to)
            .cloned()
            .ok_or_else(|| TransportError::NotConnected(to.clone()))?;

        let id = uuid::Uuid::new_v4();
        let (reply_tx, mut reply_rx) = mpsc::unbounded_channel();
        let message = InboundMessage {
            from: self.from.clone(),
            id,
            action,
            reply: ReplySink::new(reply_tx),
        };
        inbound_tx
            .send(message)
            .await
            .map_err(|_| TransportError::NotConnected(to.clone()))?;

        match reply_rx.recv().await {
            Some((reply_id, result)) if reply_id == id => Ok(result),
            Some(_) => Err(TransportError::Malformed("reply id mismatch".into())),
            None => Err(TransportError::ConnectionReset),
        }
    }

    async fn disconnect(&self, _to: &NodeId) {}
}
