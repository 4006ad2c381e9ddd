//! An in-memory `PersistentStore`, the public counterpart of `raftkv`'s own
//! `store::test_support::TestStore` (which stays crate-private so `raftkv`'s
//! own unit tests don't reach across the workspace). Grounded on the same
//! "log/meta/state in one map, no real I/O" shape the teacher's in-memory
//! example stores use, split into its own crate so `tests/` and example
//! binaries can depend on it without enabling `rocksdb-store`.

use std::collections::BTreeMap;

use async_trait::async_trait;
use raftkv::Applied;
use raftkv::BatchOp;
use raftkv::Command;
use raftkv::CommandResult;
use raftkv::LoadedState;
use raftkv::LogEntry;
use raftkv::LogId;
use raftkv::NodeId;
use raftkv::PersistentStore;
use raftkv::StorageError;
use raftkv::Term;
use raftkv::Value;
use tokio::sync::RwLock;

/// An in-memory, non-durable `PersistentStore`. All state lives behind a
/// single `RwLock`, matching `persist_node`'s atomicity contract trivially
/// since every write takes the writer half of the lock.
#[derive(Default)]
pub struct MemStore {
    inner: RwLock<Inner>,
}

#[derive(Default)]
struct Inner {
    entries: BTreeMap<LogId, LogEntry>,
    current_term: Term,
    voted_for: Option<NodeId>,
    peers: Vec<NodeId>,
    state: BTreeMap<String, Value>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PersistentStore for MemStore {
    async fn load(&self) -> Result<LoadedState, StorageError> {
        let inner = self.inner.read().await;
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
        let mut inner = self.inner.write().await;
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
        self.inner.write().await.peers = peers.to_vec();
        Ok(())
    }

    async fn apply_committed_commands(&self, entries: &[LogEntry]) -> Result<Vec<Applied>, StorageError> {
        let mut inner = self.inner.write().await;
        let mut out = Vec::with_capacity(entries.len());
        for e in entries {
            out.push(apply_one(&mut inner.state, &e.command));
        }
        Ok(out)
    }

    async fn run_read_command(&self, key: &str) -> Result<Option<Value>, StorageError> {
        Ok(self.inner.read().await.state.get(key).cloned())
    }

    async fn snapshot_state(&self) -> Result<Vec<(String, Value)>, StorageError> {
        Ok(self
            .inner
            .read()
            .await
            .state
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn clear_state(&self) -> Result<(), StorageError> {
        self.inner.write().await.state.clear();
        Ok(())
    }

    async fn install_snapshot_chunk(&self, data: &[(String, Value)]) -> Result<(), StorageError> {
        let mut inner = self.inner.write().await;
        for (k, v) in data {
            inner.state.insert(k.clone(), v.clone());
        }
        Ok(())
    }
}

fn apply_one(state: &mut BTreeMap<String, Value>, command: &Command) -> Applied {
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
            unreachable!("Get/Read never produce log entries")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn persists_and_reloads_term_and_vote() {
        let store = MemStore::new();
        let voter = NodeId::parse("/ip4/127.0.0.1/tcp/9101").unwrap();
        store.persist_node(&[], &[], 7, Some(voter.clone())).await.unwrap();

        let loaded = store.load().await.unwrap();
        assert_eq!(loaded.current_term, 7);
        assert_eq!(loaded.voted_for, Some(voter));
    }

    #[tokio::test]
    async fn applies_put_then_reads_it_back() {
        let store = MemStore::new();
        let entry = LogEntry {
            index: 1,
            term: 1,
            command: Command::Put {
                key: "a".into(),
                value: b"1".to_vec(),
            },
        };
        store.apply_committed_commands(&[entry]).await.unwrap();
        assert_eq!(store.run_read_command("a").await.unwrap(), Some(b"1".to_vec()));
    }

    #[tokio::test]
    async fn clears_and_installs_snapshot_chunks() {
        let store = MemStore::new();
        store
            .install_snapshot_chunk(&[("a".into(), b"1".to_vec()), ("b".into(), b"2".to_vec())])
            .await
            .unwrap();
        assert_eq!(store.snapshot_state().await.unwrap().len(), 2);

        store.clear_state().await.unwrap();
        assert_eq!(store.snapshot_state().await.unwrap().len(), 0);
    }
}
