//! A `rocksdb`-backed `PersistentStore`, grounded on the teacher's own
//! `openraft-rocksstore` example crate (same backing crate, same "one engine,
//! byte-ordered keys" shape). `rocksdb::DB`'s API is synchronous, so every
//! call here is dispatched through `tokio::task::spawn_blocking`, the
//! standard way to keep blocking I/O off the async executor.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use byteorder::ByteOrder;
use byteorder::LittleEndian;
use rocksdb::IteratorMode;
use rocksdb::Options;
use rocksdb::WriteBatch;
use rocksdb::DB;

use crate::address::NodeId;
use crate::command::Command;
use crate::command::CommandResult;
use crate::command::LogEntry;
use crate::command::LogId;
use crate::command::Term;
use crate::command::Value;
use crate::error::StorageError;
use crate::store::keyspace;
use crate::store::Applied;
use crate::store::LoadedState;
use crate::store::PersistentStore;

/// A single rocksdb-backed store serving the `log`, `meta`, and `state`
/// namespaces described in spec.md §6, disambiguated by key prefix rather
/// than column family, matching the keyspace layout literally.
pub struct RocksStore {
    db: Arc<DB>,
}

impl RocksStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        let db = DB::open(&opts, path).map_err(|e| StorageError::Io(e.to_string()))?;
        Ok(Self { db: Arc::new(db) })
    }

    async fn blocking<F, T>(&self, f: F) -> Result<T, StorageError>
    where
        F: FnOnce(&DB) -> Result<T, StorageError> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || f(&db))
            .await
            .map_err(|e| StorageError::Io(format!("blocking task panicked: {e}")))?
    }
}

#[async_trait]
impl PersistentStore for RocksStore {
    async fn load(&self) -> Result<LoadedState, StorageError> {
        self.blocking(|db| {
            let mut entries = Vec::new();
            let iter = db.prefix_iterator(keyspace::LOG_PREFIX.as_bytes());
            for item in iter {
                let (k, v) = item.map_err(|e| StorageError::Io(e.to_string()))?;
                if !k.starts_with(keyspace::LOG_PREFIX.as_bytes()) {
                    break;
                }
                let entry: LogEntry = bincode::deserialize(&v)
                    .map_err(|e| StorageError::Corrupt(e.to_string()))?;
                entries.push(entry);
            }
            entries.sort_by_key(|e| (e.term, e.index));

            let current_term = db
                .get(keyspace::META_CURRENT_TERM)
                .map_err(|e| StorageError::Io(e.to_string()))?
                .map(|bytes| LittleEndian::read_u64(&bytes))
                .unwrap_or(0);

            let voted_for = db
                .get(keyspace::META_VOTED_FOR)
                .map_err(|e| StorageError::Io(e.to_string()))?
                .map(|bytes| {
                    String::from_utf8(bytes)
                        .map_err(|e| StorageError::Corrupt(e.to_string()))
                        .and_then(|s| NodeId::parse(&s).map_err(|e| StorageError::Corrupt(e.to_string())))
                })
                .transpose()?;

            let peers = db
                .get(keyspace::META_PEERS)
                .map_err(|e| StorageError::Io(e.to_string()))?
                .map(|bytes| bincode::deserialize::<Vec<String>>(&bytes))
                .transpose()
                .map_err(|e| StorageError::Corrupt(e.to_string()))?
                .unwrap_or_default()
                .into_iter()
                .map(|s| NodeId::parse(&s).map_err(|e| StorageError::Corrupt(e.to_string())))
                .collect::<Result<Vec<_>, _>>()?;

            Ok(LoadedState {
                entries,
                current_term,
                voted_for,
                peers,
            })
        })
        .await
    }

    async fn persist_node(
        &self,
        entries_to_add: &[LogEntry],
        log_ids_to_delete: &[LogId],
        current_term: Term,
        voted_for: Option<NodeId>,
    ) -> Result<(), StorageError> {
        let entries_to_add = entries_to_add.to_vec();
        let log_ids_to_delete = log_ids_to_delete.to_vec();
        self.blocking(move |db| {
            let mut batch = WriteBatch::default();
            for id in &log_ids_to_delete {
                batch.delete(keyspace::log_key(id.term, id.index));
            }
            for e in &entries_to_add {
                let bytes = bincode::serialize(e).map_err(|e| StorageError::Corrupt(e.to_string()))?;
                batch.put(keyspace::log_key(e.term, e.index), bytes);
            }
            let mut term_bytes = [0u8; 8];
            LittleEndian::write_u64(&mut term_bytes, current_term);
            batch.put(keyspace::META_CURRENT_TERM, term_bytes);
            match &voted_for {
                Some(id) => batch.put(keyspace::META_VOTED_FOR, id.as_str().as_bytes()),
                None => batch.delete(keyspace::META_VOTED_FOR),
            }
            db.write(batch).map_err(|e| StorageError::Io(e.to_string()))
        })
        .await
    }

    async fn persist_peers(&self, peers: &[NodeId]) -> Result<(), StorageError> {
        let peers: Vec<String> = peers.iter().map(|p| p.as_str().to_string()).collect();
        self.blocking(move |db| {
            let bytes = bincode::serialize(&peers).map_err(|e| StorageError::Corrupt(e.to_string()))?;
            db.put(keyspace::META_PEERS, bytes)
                .map_err(|e| StorageError::Io(e.to_string()))
        })
        .await
    }

    async fn apply_committed_commands(
        &self,
        entries: &[LogEntry],
    ) -> Result<Vec<Applied>, StorageError> {
        let entries = entries.to_vec();
        self.blocking(move |db| {
            let mut batch = WriteBatch::default();
            let mut results = Vec::with_capacity(entries.len());
            for e in &entries {
                results.push(stage_one(&mut batch, &e.command));
            }
            db.write(batch).map_err(|e| StorageError::Io(e.to_string()))?;
            Ok(results)
        })
        .await
    }

    async fn run_read_command(&self, key: &str) -> Result<Option<Value>, StorageError> {
        let key = keyspace::state_key(key);
        self.blocking(move |db| db.get(&key).map_err(|e| StorageError::Io(e.to_string())))
            .await
    }

    async fn snapshot_state(&self) -> Result<Vec<(String, Value)>, StorageError> {
        self.blocking(|db| {
            let mut out = Vec::new();
            let iter = db.prefix_iterator(keyspace::STATE_PREFIX.as_bytes());
            for item in iter {
                let (k, v) = item.map_err(|e| StorageError::Io(e.to_string()))?;
                if !k.starts_with(keyspace::STATE_PREFIX.as_bytes()) {
                    break;
                }
                let key = String::from_utf8(k.to_vec()).map_err(|e| StorageError::Corrupt(e.to_string()))?;
                let user_key = keyspace::strip_state_prefix(&key)
                    .ok_or_else(|| StorageError::Corrupt("missing state/ prefix".into()))?
                    .to_string();
                out.push((user_key, v.to_vec()));
            }
            Ok(out)
        })
        .await
    }

    async fn clear_state(&self) -> Result<(), StorageError> {
        self.blocking(|db| {
            let mut batch = WriteBatch::default();
            let iter = db.iterator(IteratorMode::From(
                keyspace::STATE_PREFIX.as_bytes(),
                rocksdb::Direction::Forward,
            ));
            for item in iter {
                let (k, _) = item.map_err(|e| StorageError::Io(e.to_string()))?;
                if !k.starts_with(keyspace::STATE_PREFIX.as_bytes()) {
                    break;
                }
                batch.delete(k);
            }
            db.write(batch).map_err(|e| StorageError::Io(e.to_string()))
        })
        .await
    }

    async fn install_snapshot_chunk(&self, data: &[(String, Value)]) -> Result<(), StorageError> {
        let data = data.to_vec();
        self.blocking(move |db| {
            let mut batch = WriteBatch::default();
            for (k, v) in &data {
                batch.put(keyspace::state_key(k), v);
            }
            db.write(batch).map_err(|e| StorageError::Io(e.to_string()))
        })
        .await
    }
}

fn stage_one(batch: &mut WriteBatch, command: &Command) -> Applied {
    use crate::command::BatchOp;
    match command {
        Command::Put { key, value } => {
            batch.put(keyspace::state_key(key), value);
            Applied::State(CommandResult::Ack)
        }
        Command::Delete { key } => {
            batch.delete(keyspace::state_key(key));
            Applied::State(CommandResult::Ack)
        }
        Command::Batch(ops) => {
            for op in ops {
                match op {
                    BatchOp::Put { key, value } => batch.put(keyspace::state_key(key), value),
                    BatchOp::Delete { key } => batch.delete(keyspace::state_key(key)),
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

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn persists_and_reloads_term_and_vote() {
        let dir = tempfile::tempdir().unwrap();
        let store = RocksStore::open(dir.path()).unwrap();
        let voter = NodeId::parse("/ip4/127.0.0.1/tcp/9101").unwrap();
        store.persist_node(&[], &[], 7, Some(voter.clone())).await.unwrap();

        let loaded = store.load().await.unwrap();
        assert_eq!(loaded.current_term, 7);
        assert_eq!(loaded.voted_for, Some(voter));
    }

    #[tokio::test]
    async fn applies_put_then_reads_it_back() {
        let dir = tempfile::tempdir().unwrap();
        let store = RocksStore::open(dir.path()).unwrap();
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
}
