//! Per-follower replication state, leader-only (§4.5). One actor per peer —
//! "an explicit actor per peer with a mailbox of `{TrySend, Reply, Timer,
//! Stop}`" (§9) — holding a shared reference to `Log` it never mutates, and
//! at most one in-flight `AppendEntries` at a time.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::sync::watch;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

use crate::address::NodeId;
use crate::command::Index;
use crate::command::Term;
use crate::config::Config;
use crate::error::TransportError;
use crate::log::Log;
use crate::message::Action;
use crate::message::AppendEntriesRequest;
use crate::message::InstallSnapshotRequest;
use crate::message::RpcResult;
use crate::shared::Shared;
use crate::store::PersistentStore;
use crate::timer::HeartbeatTicker;
use crate::transport::Transport;

enum ReplicatorMsg {
    TrySend,
    Stop,
}

/// The leader-side handle to a running replicator actor.
pub struct PeerReplicatorHandle {
    tx: mpsc::UnboundedSender<ReplicatorMsg>,
    /// The `committed(index)` signal (§4.4): consensus-seek subscribes to
    /// this to count the peer's vote for a given log index.
    pub match_index: watch::Receiver<Index>,
    join: JoinHandle<()>,
}

impl PeerReplicatorHandle {
    /// Nudge the replicator to send immediately (e.g. right after `push`),
    /// instead of waiting for its next heartbeat tick.
    pub fn notify(&self) {
        let _ = self.tx.send(ReplicatorMsg::TrySend);
    }

    pub async fn stop(self) {
        let _ = self.tx.send(ReplicatorMsg::Stop);
        let _ = self.join.await;
    }
}

#[allow(clippy::too_many_arguments)]
pub fn spawn(
    peer: NodeId,
    leader_id: NodeId,
    log: Arc<RwLock<Log>>,
    store: Arc<dyn PersistentStore>,
    transport: Arc<dyn Transport>,
    shared: Shared,
    config: Config,
    higher_term_tx: mpsc::UnboundedSender<Term>,
) -> PeerReplicatorHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let (match_index_tx, match_index_rx) = watch::channel(0);
    let state = ReplicatorState {
        peer,
        leader_id,
        log,
        store,
        transport,
        shared,
        config,
        higher_term_tx,
        peer_latest_log_index: 0,
        match_index_tx,
        appending: false,
    };
    let join = tokio::spawn(run(state, rx));
    PeerReplicatorHandle {
        tx,
        match_index: match_index_rx,
        join,
    }
}

struct ReplicatorState {
    peer: NodeId,
    leader_id: NodeId,
    log: Arc<RwLock<Log>>,
    store: Arc<dyn PersistentStore>,
    transport: Arc<dyn Transport>,
    shared: Shared,
    config: Config,
    higher_term_tx: mpsc::UnboundedSender<Term>,
    /// Highest index this peer is known to have (`peerLatestLogIndex`).
    peer_latest_log_index: Index,
    match_index_tx: watch::Sender<Index>,
    /// At most one in-flight/queued AppendEntries; further triggers coalesce
    /// into the cycle already running (§4.5, §5).
    appending: bool,
}

async fn run(mut state: ReplicatorState, mut rx: mpsc::UnboundedReceiver<ReplicatorMsg>) {
    let mut ticker = HeartbeatTicker::new(state.config.append_entries_interval_ms);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                state.cycle().await;
            }
            msg = rx.recv() => {
                match msg {
                    Some(ReplicatorMsg::TrySend) => {
                        state.cycle().await;
                        ticker.restart(state.config.append_entries_interval_ms);
                    }
                    Some(ReplicatorMsg::Stop) | None => return,
                }
            }
        }
    }
}

impl ReplicatorState {
    async fn cycle(&mut self) {
        if self.appending {
            return;
        }
        self.appending = true;
        self.send_append_entries().await;
        self.appending = false;
    }

    async fn send_append_entries(&mut self) {
        let term = self.shared.read().await.current_term;
        let (leader_commit, prev_index, prev_term, entries) = {
            let log = self.log.read().await;
            let leader_commit = log.committed_index();
            let from = self.peer_latest_log_index + 1;
            let entries = match log.entries_from(from, self.config.batch_entries_limit) {
                Some(e) => e,
                None => {
                    drop(log);
                    self.run_snapshot().await;
                    return;
                }
            };
            let (prev_index, prev_term) = if self.peer_latest_log_index == 0 {
                (0, 0)
            } else {
                match log.at_index(self.peer_latest_log_index) {
                    Some(e) => (e.index, e.term),
                    None => (log.last_applied_index(), log.last_applied_term()),
                }
            };
            (leader_commit, prev_index, prev_term, entries)
        };

        let req = AppendEntriesRequest {
            term,
            leader_id: self.leader_id.clone(),
            prev_log_index: prev_index,
            prev_log_term: prev_term,
            entries: entries.clone(),
            leader_commit,
        };

        match self.transport.send_request(&self.peer, Action::AppendEntries(req)).await {
            Ok(RpcResult::AppendEntries(resp)) => {
                if resp.term > term {
                    let _ = self.higher_term_tx.send(resp.term);
                    return;
                }
                if resp.success {
                    if let Some(last) = entries.last() {
                        self.peer_latest_log_index = last.index;
                    }
                    // Emit the peer's acknowledged index (§4.5 "emit
                    // committed(peerLatestLogIndex)"), not capped by
                    // leaderCommit: leaderCommit only advances once this
                    // signal has already carried the index past quorum, so
                    // capping here would make consensus-seek wait on a value
                    // that can never reach the index it's waiting for.
                    self.match_index_tx.send_replace(self.peer_latest_log_index);
                } else {
                    self.peer_latest_log_index = resp.next_log_index.saturating_sub(1);
                }
            }
            Ok(_) => {
                tracing::warn!(peer = %self.peer, "unexpected reply kind to AppendEntries");
            }
            Err(TransportError::NotConnected(_))
            | Err(TransportError::ConnectionReset)
            | Err(TransportError::ConnectionRefused) => {
                // Keep probing without thrashing: back off the watermark by
                // one instead of resetting to zero (§4.5).
                self.peer_latest_log_index = self.peer_latest_log_index.saturating_sub(1);
            }
            Err(TransportError::Timeout) => {
                tracing::debug!(peer = %self.peer, "AppendEntries timed out");
            }
            Err(TransportError::Malformed(reason)) => {
                tracing::warn!(peer = %self.peer, %reason, "malformed AppendEntries reply");
            }
        }
    }

    /// Stream the entire state namespace to a peer that has fallen behind
    /// the retained log window (§4.5).
    async fn run_snapshot(&mut self) {
        let state = match self.store.snapshot_state().await {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(peer = %self.peer, %e, "failed to read snapshot state");
                return;
            }
        };

        let (term, last_index, last_term, peers) = {
            let shared = self.shared.read().await;
            let log = self.log.read().await;
            (
                shared.current_term,
                log.last_applied_index(),
                log.last_applied_term(),
                shared.peers.clone(),
            )
        };

        let chunk_size = self.config.install_snapshot_chunk_size.max(1);
        let total = state.len();
        let mut offset = 0u64;
        let mut chunks = state.chunks(chunk_size).peekable();
        if chunks.peek().is_none() {
            // Empty state still needs one "done" chunk to hand over
            // (last_index, last_term, peers).
            self.send_snapshot_chunk(term, 0, &[], true, last_index, last_term, &peers)
                .await;
        } else {
            while let Some(chunk) = chunks.next() {
                let done = offset as usize + chunk.len() >= total;
                if !self
                    .send_snapshot_chunk(term, offset, chunk, done, last_index, last_term, &peers)
                    .await
                {
                    return;
                }
                offset += chunk.len() as u64;
            }
        }

        self.peer_latest_log_index = last_index;
        self.match_index_tx.send_replace(last_index);
    }

    #[allow(clippy::too_many_arguments)]
    async fn send_snapshot_chunk(
        &mut self,
        term: Term,
        offset: u64,
        chunk: &[(String, Vec<u8>)],
        done: bool,
        last_index: Index,
        last_term: Term,
        peers: &HashSet<NodeId>,
    ) -> bool {
        let req = InstallSnapshotRequest {
            term,
            leader_id: self.leader_id.clone(),
            offset,
            data: chunk.to_vec(),
            done,
            last_index: done.then_some(last_index),
            last_term: done.then_some(last_term),
            peers: done.then(|| peers.iter().cloned().collect()),
        };
        match self.transport.send_request(&self.peer, Action::InstallSnapshot(req)).await {
            Ok(RpcResult::InstallSnapshot(resp)) => {
                if resp.term > term {
                    let _ = self.higher_term_tx.send(resp.term);
                    return false;
                }
                if resp.cancel {
                    tracing::debug!(peer = %self.peer, "snapshot transfer cancelled");
                    return false;
                }
                true
            }
            _ => {
                tracing::warn!(peer = %self.peer, "snapshot transfer failed, will retry later");
                false
            }
        }
    }
}
