//! A Raft-replicated key-value engine.
//!
//! Modeled on `openraft`'s shape: a single writer task per node owns all
//! mutable state, callers interact through message-passing handles
//! (`Node`, `Client`), and storage/transport are pluggable traits so the
//! engine itself never assumes RocksDB or TCP.

pub mod address;
pub mod client;
pub mod command;
pub mod config;
pub mod consensus;
pub mod core;
pub mod error;
pub mod log;
mod mailbox;
pub mod message;
pub mod metrics;
pub mod node;
pub mod peer_replicator;
pub mod quorum;
mod shared;
pub mod state;
pub mod store;
pub mod timer;
pub mod transport;

pub use address::NodeId;
pub use client::Client;
pub use command::BatchOp;
pub use command::Command;
pub use command::CommandResult;
pub use command::Index;
pub use command::LogEntry;
pub use command::LogId;
pub use command::Term;
pub use command::Value;
pub use config::Config;
pub use config::ConfigError;
pub use error::ErrorCode;
pub use error::RaftError;
pub use error::RaftResult;
pub use error::StorageError;
pub use error::TransportError;
pub use metrics::NodeMetrics;
pub use node::Node;
pub use state::Role;
pub use store::Applied;
pub use store::LoadedState;
pub use store::PersistentStore;
pub use transport::InboundMessage;
pub use transport::ReplySink;
pub use transport::Transport;
