//! The `PersistentStore` contract (§4.2): durable log/meta/state triples.
//!
//! THE CORE treats the concrete storage engine as an external collaborator
//! (spec.md §1) — only this trait's key/value/batch/stream shape is
//! load-bearing. `rocksdb_store` is the default production backend, grounded
//! on the teacher's own `openraft-rocksstore` example crate; `stores/memstore`
//! provides a fast in-memory implementation for tests.

#[cfg(feature = "rocksdb-store")]
pub mod rocksdb_store;

pub mod keyspace;

use async_trait::async_trait;

use crate::address::NodeId;
use crate::command::Command;
use crate::command::CommandResult;
use crate::command::LogEntry;
use crate::command::LogId;
use crate::command::Term;
use crate::command::Value;
use crate::error::StorageError;

/// What `PersistentStore::load` reconstructs at startup (§4.2).
#[derive(Debug, Default)]
pub struct LoadedState {
    pub entries: Vec<LogEntry>,
    pub current_term: Term,
    pub voted_for: Option<NodeId>,
    pub peers: Vec<NodeId>,
}

/// The result of applying one committed log entry (§4.2): either a state
/// mutation result, or a topology command handed back to the `Node` callback.
#[derive(Debug)]
pub enum Applied {
    State(CommandResult),
    Topology(Command),
}

/// Durable storage for a node's log, meta, and application state (§4.2).
///
/// Implementations must make `persist_node` atomic: log entry writes, log
/// entry deletes, `current_term`, and `voted_for` land in a single batch, so
/// a crash never leaves term/vote out of sync with the entries the node has
/// acknowledged to a leader.
#[async_trait]
pub trait PersistentStore: Send + Sync {
    /// Reconstruct in-memory state at startup.
    async fn load(&self) -> Result<LoadedState, StorageError>;

    /// Atomically persist the given log entries, delete the given
    /// now-stale keys (typically ones this node had in storage that are no
    /// longer in memory, e.g. after a conflicting truncation), and update
    /// `current_term` / `voted_for`.
    async fn persist_node(
        &self,
        entries_to_add: &[LogEntry],
        log_ids_to_delete: &[LogId],
        current_term: Term,
        voted_for: Option<NodeId>,
    ) -> Result<(), StorageError>;

    /// Persist the current peer set (written whenever a topology command is
    /// applied).
    async fn persist_peers(&self, peers: &[NodeId]) -> Result<(), StorageError>;

    /// Apply a contiguous run of committed entries. Topology commands
    /// (`Join`/`Leave`) are not applied to the state namespace; they come
    /// back as `Applied::Topology` for the caller (`Node`) to act on. State
    /// commands (`Put`/`Delete`, and batches of them) are applied atomically.
    async fn apply_committed_commands(
        &self,
        entries: &[LogEntry],
    ) -> Result<Vec<Applied>, StorageError>;

    /// Read a single key. Callers must have already crossed a
    /// read-consensus barrier (§4.4) before calling this.
    async fn run_read_command(&self, key: &str) -> Result<Option<Value>, StorageError>;

    /// Materialize the entire `state` namespace for `InstallSnapshot`
    /// streaming (§4.5), in key order.
    async fn snapshot_state(&self) -> Result<Vec<(String, Value)>, StorageError>;

    /// Drop the entire `state` namespace, used before installing a
    /// snapshot (§4.5: "Peer clears its state namespace when it receives
    /// `offset=0`").
    async fn clear_state(&self) -> Result<(), StorageError>;

    /// Write one `InstallSnapshot` chunk directly into the `state`
    /// namespace, bypassing the log entirely (§4.5): the receiving peer has
    /// no log entries for this data, only the leader's word that it is
    /// committed.
    async fn install_snapshot_chunk(&self, data: &[(String, Value)]) -> Result<(), StorageError>;
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    use super::*;

    /// A trivial in-process store used only by this crate's own unit tests;
    /// the full-featured in-memory backend lives in `stores/memstore` so
    /// integration tests and examples can depend on it too.
    #[derive(Default)]
    pub struct TestStore {
        inner: Mutex<Inner>,
    }

    #[derive(Default)]
    struct Inner {
        entries: BTreeMap<LogId, LogEntry>,
        current_term: Term,
        voted_for: Option<NodeId>,
        peers: Vec<NodeId>,
        state: BTreeMap<String, Value>,
    }

    #[async_trait]
    impl PersistentStore for TestStore {
        async fn load(&self) -> Result<LoadedState, StorageError> {
            let inner = self.inner.lock().unwrap();
            Ok(LoadedState {
                entries: inner.entries.values().cloned().collect(),
                current_term: inner.current_term,
                voted_for: inner.voted_for.clone(),
                peers: inner.peers.clone(),
            })
        }

        async fn persist_node(
            &self,
            entries_to_add: &[LogEntry],
            log_ids_to_delete: &[LogId],
            current_term: Term,
            voted_for: Option<NodeId>,
        ) -> Result<(), StorageError> {
            let mut inner = self.inner.lock().unwrap();
            for id in log_ids_to_delete {
                inner.entries.remove(id);
            }
            for e in entries_to_add {
                inner.entries.insert(e.log_id(), e.clone());
            }
            inner.current_term = current_term;
            inner.voted_for = voted_for;
            Ok(())
        }

        async fn persist_peers(&self, peers: &[NodeId]) -> Result<(), StorageError> {
            self.inner.lock().unwrap().peers = peers.to_vec();
            Ok(())
        }

        async fn apply_committed_commands(
            &self,
            entries: &[LogEntry],
        ) -> Result<Vec<Applied>, StorageError> {
            let mut inner = self.inner.lock().unwrap();
            let mut out = Vec::with_capacity(entries.len());
            for e in entries {
                out.push(apply_one(&mut inner.state, &e.command));
            }
            Ok(out)
        }

        async fn run_read_command(&self, key: &str) -> Result<Option<Value>, StorageError> {
            Ok(self.inner.lock().unwrap().state.get(key).cloned())
        }

        async fn snapshot_state(&self) -> Result<Vec<(String, Value)>, StorageError> {
            Ok(self
                .inner
                .lock()
                .unwrap()
                .state
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect())
        }

        async fn clear_state(&self) -> Result<(), StorageError> {
            self.inner.lock().unwrap().state.clear();
            Ok(())
        }

        async fn install_snapshot_chunk(&self, data: &[(String, Value)]) -> Result<(), StorageError> {
            let mut inner = self.inner.lock().unwrap();
            for (k, v) in data {
                inner.state.insert(k.clone(), v.clone());
            }
            Ok(())
        }
    }

    fn apply_one(state: &mut BTreeMap<String, Value>, command: &Command) -> Applied {
        use crate::command::BatchOp;
        match command {
            Command::Put { key, value } => {
                state.insert(key.clone(), value.clone());
                Applied::State(CommandResult::Ack)
            }
            Command::Delete { key } => {
                state.remove(key);
                Applied::State(CommandResult::Ack)
            }
            Command::Batch(ops) => {
                for op in ops {
                    match op {
                        BatchOp::Put { key, value } => {
                            state.insert(key.clone(), value.clone());
                        }
                        BatchOp::Delete { key } => {
                            state.remove(key);
                        }
                    }
                }
                Applied::State(CommandResult::Ack)
            }
            Command::Join { peer } => Applied::Topology(Command::Join { peer: peer.clone() }),
            Command::Leave { peer } => Applied::Topology(Command::Leave { peer: peer.clone() }),
            Command::Get { .. } | Command::Read => {
                unreachable!("Get/Read never produce log entries (spec.md §3)")
            }
        }
    }
}
