//! Node orchestration (§4.6): the single-task actor that owns a node's
//! `Log`, `PersistentStore` handle, peer set, and `NodeState`, and drives
//! every Raft-level transition (election, replication fan-out, membership
//! change, weaken/recover).
//!
//! Grounded on the teacher's `RaftCore` main loop shape (one task, a
//! `tokio::select!` over timers and inbound channels, state mutated only
//! from inside that loop) but collapsed to THE CORE's own concrete
//! `Command`/`NodeId` types rather than `openraft`'s generic
//! `RaftTypeConfig`.
//!
//! §4.6 describes two dispatchers (requests and replies). Because
//! `Transport::send_request` here is already a request/reply future rather
//! than an event-emitter pair, the reply dispatcher collapses into a plain
//! `.await` at the call site; only the inbound-request dispatcher remains
//! as an explicit queue (see `mailbox`). §5's "single-in-flight lock on
//! persist" likewise falls out for free: everything below runs on the one
//! actor task, so there is never a second `persist` call in flight to guard
//! against.

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

use crate::address::NodeId;
use crate::command::Command;
use crate::command::CommandResult;
use crate::command::LogId;
use crate::command::Term;
use crate::consensus;
use crate::core;
use crate::core::NodeState;
use crate::error::RaftError;
use crate::error::RaftResult;
use crate::log::Log;
use crate::mailbox;
use crate::message::Action;
use crate::message::AppendEntriesRequest;
use crate::message::CommandResponse;
use crate::message::InstallSnapshotRequest;
use crate::message::InstallSnapshotResponse;
use crate::message::RpcError;
use crate::message::RpcResult;
use crate::message::VoteRequest;
use crate::metrics::MetricsReporter;
use crate::metrics::NodeMetrics;
use crate::peer_replicator;
use crate::peer_replicator::PeerReplicatorHandle;
use crate::shared;
use crate::shared::Shared;
use crate::state::Role;
use crate::store::Applied;
use crate::store::PersistentStore;
use crate::timer::RandomizedTimer;
use crate::transport::InboundMessage;
use crate::transport::Transport;
use crate::Config;

/// A handle to a running node. Cheap to clone pieces of (`metrics`), but the
/// handle itself is single-owner: `stop` consumes it.
pub struct Node {
    id: NodeId,
    shared: Shared,
    metrics_rx: watch::Receiver<NodeMetrics>,
    command_tx: mpsc::Sender<CommandJob>,
    control_tx: mpsc::UnboundedSender<Control>,
    stop_tx: watch::Sender<bool>,
    join: Option<JoinHandle<()>>,
}

type CommandJob = (Command, HashSet<NodeId>, oneshot::Sender<RaftResult<CommandResult>>);

enum Control {
    Weaken(Duration),
}

impl Node {
    /// Load persistent state and enter Follower (§3: "A Node is created
    /// stopped; `start` loads persistent state, then enters Follower").
    ///
    /// Returns the handle plus the `mpsc::Sender` a `Transport`'s listener
    /// should feed inbound requests into.
    pub async fn start(
        id: NodeId,
        config: Config,
        store: Arc<dyn PersistentStore>,
        transport: Arc<dyn Transport>,
    ) -> RaftResult<(Node, mpsc::Sender<InboundMessage>)> {
        config
            .validate()
            .map_err(|e| RaftError::MalformedMessage(e.to_string()))?;

        let loaded = store.load().await?;
        let peers: HashSet<NodeId> = loaded.peers.into_iter().filter(|p| *p != id).collect();
        let log = Log::from_loaded(loaded.entries, config.max_log_retention);
        let persisted_log_ids: HashSet<LogId> = log.iter().map(|e| e.log_id()).collect();
        let state = NodeState::new(id.clone(), loaded.current_term, loaded.voted_for, peers.clone());
        let shared = shared::new_shared(state.current_term, peers);
        let (metrics, metrics_rx) = MetricsReporter::new(id.clone());

        let (raw_inbound_tx, raw_inbound_rx) = mpsc::channel::<InboundMessage>(config.max_pending.max(1));
        let (mailbox_tx, mailbox_rx) = mailbox::bounded::<InboundMessage>(config.max_pending.max(1));
        // Transport's own channel must never drop (§5); the drop-oldest
        // policy lives one hop downstream, in the mailbox.
        tokio::spawn(async move {
            let mut raw_inbound_rx = raw_inbound_rx;
            while let Some(msg) = raw_inbound_rx.recv().await {
                mailbox_tx.push(msg);
            }
        });

        let (command_tx, command_rx) = mpsc::channel::<CommandJob>(64);
        let (control_tx, control_rx) = mpsc::unbounded_channel::<Control>();
        let (higher_term_tx, higher_term_rx) = mpsc::unbounded_channel::<Term>();
        let (stop_tx, stop_rx) = watch::channel(false);

        let mut heartbeat_timer = RandomizedTimer::new(config.heartbeat_timeout_min_ms, config.heartbeat_timeout_max_ms);
        let mut candidate_timer = RandomizedTimer::new(config.election_timeout_min_ms, config.election_timeout_max_ms);
        candidate_timer.suspend();
        heartbeat_timer.reset();

        let actor = Actor {
            id: id.clone(),
            config,
            log: Arc::new(RwLock::new(log)),
            store,
            transport,
            shared: shared.clone(),
            metrics,
            state,
            persisted_log_ids,
            replicators: HashMap::new(),
            election: None,
            weaken_deadline: None,
            heartbeat_timer,
            candidate_timer,
            higher_term_tx,
            higher_term_rx,
            inbound_rx: mailbox_rx,
            command_rx,
            control_rx,
            stop_rx,
        };

        let join = tokio::spawn(actor.run());

        Ok((
            Node {
                id,
                shared,
                metrics_rx,
                command_tx,
                control_tx,
                stop_tx,
                join: Some(join),
            },
            raw_inbound_tx,
        ))
    }

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    /// A live feed of this node's role/term/log position (ambient
    /// observability, SPEC_FULL.md §3).
    pub fn metrics(&self) -> watch::Receiver<NodeMetrics> {
        self.metrics_rx.clone()
    }

    pub async fn current_leader(&self) -> Option<NodeId> {
        self.shared.read().await.current_leader.clone()
    }

    /// Submit a command for this node to process as leader (§4.4). Returns
    /// `RaftError::NotLeader` if this node isn't currently the leader; the
    /// forwarding `Client` decides what to do with that.
    pub async fn command(&self, cmd: Command) -> RaftResult<CommandResult> {
        self.command_with(cmd, HashSet::new()).await
    }

    /// Like `command`, but with explicit additional demanded voters (§4.4
    /// `alsoWaitFor`).
    pub async fn command_with(&self, cmd: Command, also_wait_for: HashSet<NodeId>) -> RaftResult<CommandResult> {
        let (tx, rx) = oneshot::channel();
        self.command_tx
            .send((cmd, also_wait_for, tx))
            .await
            .map_err(|_| RaftError::ShuttingDown)?;
        rx.await.map_err(|_| RaftError::ShuttingDown)?
    }

    /// Explicitly suppress candidacy for `duration` (§4.3 `weaken`), used by
    /// tests to steer elections.
    pub fn weaken(&self, duration: Duration) {
        let _ = self.control_tx.send(Control::Weaken(duration));
    }

    /// Terminate timers, transports, and replicators; release every
    /// resource on every exit path (§3, §5).
    pub async fn stop(mut self) {
        let _ = self.stop_tx.send(true);
        if let Some(join) = self.join.take() {
            let _ = join.await;
        }
    }
}

/// One in-flight election: per-peer `RequestVote` replies arrive over
/// `votes_rx`; `term` pins this election to the term it was started in so a
/// stray reply from a stale election can never be miscounted.
struct ElectionInFlight {
    votes_rx: mpsc::UnboundedReceiver<VoteReplyEvent>,
    granted: usize,
    total_voters: usize,
    term: Term,
}

enum VoteReplyEvent {
    Granted,
    HigherTerm(Term),
    NoVote,
}

struct Actor {
    id: NodeId,
    config: Config,
    log: Arc<RwLock<Log>>,
    store: Arc<dyn PersistentStore>,
    transport: Arc<dyn Transport>,
    shared: Shared,
    metrics: MetricsReporter,
    state: NodeState,
    /// `(term, index)` pairs already written to `store`, tracked so
    /// `persist` only ships the delta (§4.2 `persistNode`).
    persisted_log_ids: HashSet<LogId>,
    /// Leader-only: one `PeerReplicator` per current peer (§3 lifecycle).
    replicators: HashMap<NodeId, PeerReplicatorHandle>,
    election: Option<ElectionInFlight>,
    weaken_deadline: Option<tokio::time::Instant>,
    heartbeat_timer: RandomizedTimer,
    candidate_timer: RandomizedTimer,
    higher_term_tx: mpsc::UnboundedSender<Term>,
    higher_term_rx: mpsc::UnboundedReceiver<Term>,
    inbound_rx: mailbox::MailboxReceiver<InboundMessage>,
    command_rx: mpsc::Receiver<CommandJob>,
    control_rx: mpsc::UnboundedReceiver<Control>,
    stop_rx: watch::Receiver<bool>,
}

async fn next_vote(election: &mut Option<ElectionInFlight>) -> Option<VoteReplyEvent> {
    match election {
        Some(e) => e.votes_rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn next_weaken_wake(deadline: &Option<tokio::time::Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(*d).await,
        None => std::future::pending().await,
    }
}

impl Actor {
    async fn run(mut self) {
        loop {
            tokio::select! {
                biased;

                changed = self.stop_rx.changed() => {
                    // An error means the `Node` handle (and its `stop_tx`)
                    // was dropped without calling `stop()`; shut down
                    // rather than spin re-polling a dead sender.
                    if changed.is_err() || *self.stop_rx.borrow() {
                        break;
                    }
                }

                msg = self.inbound_rx.recv() => {
                    self.handle_inbound(msg).await;
                }

                Some((cmd, also_wait_for, reply_tx)) = self.command_rx.recv() => {
                    let result = self.do_command(cmd, also_wait_for).await;
                    let _ = reply_tx.send(result);
                }

                Some(ctrl) = self.control_rx.recv() => {
                    self.handle_control(ctrl).await;
                }

                Some(term) = self.higher_term_rx.recv() => {
                    self.observe_higher_term(term).await;
                }

                Some(event) = next_vote(&mut self.election) => {
                    self.handle_vote_reply(event).await;
                }

                _ = self.heartbeat_timer.elapsed(), if self.state.role.is_follower() => {
                    self.start_election().await;
                }

                _ = self.candidate_timer.elapsed(), if self.state.role.is_candidate() => {
                    self.start_election().await;
                }

                _ = next_weaken_wake(&self.weaken_deadline), if self.weaken_deadline.is_some() => {
                    self.recover_from_weakened().await;
                }
            }
        }
        self.teardown_leadership().await;
    }

    // -- inbound RPC dispatch (§4.6) -----------------------------------

    #[tracing::instrument(level = "debug", skip(self, msg), fields(id = %self.id, from = %msg.from))]
    async fn handle_inbound(&mut self, msg: InboundMessage) {
        let InboundMessage { from: _, id, action, reply } = msg;
        let result = match action {
            Action::RequestVote(req) => self.handle_request_vote(req).await,
            Action::AppendEntries(req) => self.handle_append_entries(req).await,
            Action::InstallSnapshot(req) => self.handle_install_snapshot(req).await,
            Action::Command(req) => {
                match self.do_command(req.command, req.also_wait_for.into_iter().collect()).await {
                    Ok(result) => RpcResult::Command(CommandResponse { result }),
                    Err(err) => RpcResult::Error(RpcError {
                        message: err.to_string(),
                        code: err.code(),
                        leader: err.leader_hint().cloned(),
                    }),
                }
            }
        };
        reply.send(id, result);
    }

    async fn handle_request_vote(&mut self, req: VoteRequest) -> RpcResult {
        let (last_applied_term, last_applied_index) = {
            let log = self.log.read().await;
            (log.last_applied_term(), log.last_applied_index())
        };
        let resp = core::handle_request_vote(&mut self.state, last_applied_term, last_applied_index, &req);
        let _ = self.persist().await;
        if resp.vote_granted {
            self.heartbeat_timer.reset();
            self.candidate_timer.suspend();
            self.election = None;
        }
        self.sync_shared().await;
        RpcResult::Vote(resp)
    }

    async fn handle_append_entries(&mut self, req: AppendEntriesRequest) -> RpcResult {
        self.heartbeat_timer.reset();
        let was_leader = self.state.role.is_leader();

        let outcome = {
            let mut log = self.log.write().await;
            core::handle_append_entries(&mut self.state, &mut log, self.store.as_ref(), req).await
        };

        match outcome {
            Ok(outcome) => {
                if outcome.response.success {
                    self.candidate_timer.suspend();
                    self.election = None;
                }
                if was_leader && !self.state.role.is_leader() {
                    self.teardown_leadership().await;
                }
                let _ = self.persist().await;
                for (_, applied) in &outcome.applied {
                    if let Applied::Topology(cmd) = applied {
                        self.apply_topology(cmd.clone()).await;
                    }
                }
                self.sync_shared().await;
                RpcResult::AppendEntries(outcome.response)
            }
            Err(storage_err) => {
                tracing::error!(%storage_err, "storage error applying AppendEntries");
                RpcResult::Error(RpcError {
                    message: storage_err.to_string(),
                    code: crate::error::ErrorCode::StorageError,
                    leader: None,
                })
            }
        }
    }

    async fn handle_install_snapshot(&mut self, req: InstallSnapshotRequest) -> RpcResult {
        if req.term < self.state.current_term {
            return RpcResult::InstallSnapshot(InstallSnapshotResponse {
                term: self.state.current_term,
                cancel: true,
            });
        }
        self.state.observe_term(req.term);
        self.state.current_leader = Some(req.leader_id.clone());
        if self.state.role.is_leader() {
            self.teardown_leadership().await;
        }
        self.state.role = Role::Follower;
        self.heartbeat_timer.reset();
        self.candidate_timer.suspend();
        self.election = None;

        if req.offset == 0 {
            if let Err(e) = self.store.clear_state().await {
                tracing::error!(%e, "failed to clear state before snapshot install");
                return RpcResult::InstallSnapshot(InstallSnapshotResponse {
                    term: self.state.current_term,
                    cancel: true,
                });
            }
        }
        if let Err(e) = self.store.install_snapshot_chunk(&req.data).await {
            tracing::error!(%e, "failed to install snapshot chunk");
            return RpcResult::InstallSnapshot(InstallSnapshotResponse {
                term: self.state.current_term,
                cancel: true,
            });
        }

        if req.done {
            let last_index = req.last_index.unwrap_or(0);
            let last_term = req.last_term.unwrap_or(0);
            {
                let mut log = self.log.write().await;
                log.reset_after_snapshot(last_index, last_term);
            }
            self.persisted_log_ids.clear();
            if let Some(peers) = req.peers {
                self.state.peers = peers.into_iter().filter(|p| *p != self.id).collect();
                let _ = self
                    .store
                    .persist_peers(&self.state.peers.iter().cloned().collect::<Vec<_>>())
                    .await;
            }
        }

        let _ = self.persist().await;
        self.sync_shared().await;
        RpcResult::InstallSnapshot(InstallSnapshotResponse {
            term: self.state.current_term,
            cancel: false,
        })
    }

    async fn handle_control(&mut self, ctrl: Control) {
        match ctrl {
            Control::Weaken(duration) => {
                self.election = None;
                if self.state.role.is_leader() {
                    self.teardown_leadership().await;
                }
                self.state.weaken(duration);
                self.weaken_deadline = Some(tokio::time::Instant::now() + duration);
                self.heartbeat_timer.suspend();
                self.candidate_timer.suspend();
                self.sync_shared().await;
            }
        }
    }

    async fn recover_from_weakened(&mut self) {
        self.weaken_deadline = None;
        self.state.recover_from_weakened();
        self.heartbeat_timer.reset();
        self.sync_shared().await;
    }

    // -- election (§4.3) ------------------------------------------------

    #[tracing::instrument(level = "debug", skip(self), fields(id = %self.id, term = self.state.current_term))]
    async fn start_election(&mut self) {
        self.state.become_candidate();
        let _ = self.persist().await;
        self.heartbeat_timer.suspend();
        self.candidate_timer.reset();
        self.sync_shared().await;
        tracing::info!(term = self.state.current_term, "starting election");

        let peers: Vec<NodeId> = self.state.peers.iter().cloned().collect();
        let total_voters = peers.len() + 1;
        let term = self.state.current_term;

        let (last_applied_term, last_applied_index) = {
            let log = self.log.read().await;
            (log.last_applied_term(), log.last_applied_index())
        };

        let (votes_tx, votes_rx) = mpsc::unbounded_channel();
        for peer in peers {
            let transport = self.transport.clone();
            let votes_tx = votes_tx.clone();
            let req = VoteRequest {
                term,
                candidate_id: self.id.clone(),
                last_log_index: last_applied_index,
                last_log_term: last_applied_term,
            };
            let timeout = Duration::from_millis(self.config.rpc_timeout_ms);
            tokio::spawn(async move {
                let event = match tokio::time::timeout(timeout, transport.send_request(&peer, Action::RequestVote(req))).await {
                    Ok(Ok(RpcResult::Vote(v))) if v.term > term => VoteReplyEvent::HigherTerm(v.term),
                    Ok(Ok(RpcResult::Vote(v))) if v.vote_granted => VoteReplyEvent::Granted,
                    _ => VoteReplyEvent::NoVote,
                };
                let _ = votes_tx.send(event);
            });
        }

        self.election = Some(ElectionInFlight {
            votes_rx,
            granted: 1,
            total_voters,
            term,
        });

        if crate::quorum::has_quorum(1, total_voters) {
            self.become_leader().await;
        }
    }

    async fn handle_vote_reply(&mut self, event: VoteReplyEvent) {
        let Some(election) = &mut self.election else { return };
        if election.term != self.state.current_term || !self.state.role.is_candidate() {
            self.election = None;
            return;
        }
        match event {
            VoteReplyEvent::Granted => {
                election.granted += 1;
                if crate::quorum::has_quorum(election.granted, election.total_voters) {
                    self.become_leader().await;
                }
            }
            VoteReplyEvent::HigherTerm(term) => {
                self.observe_higher_term(term).await;
            }
            VoteReplyEvent::NoVote => {}
        }
    }

    async fn become_leader(&mut self) {
        self.election = None;
        self.state.become_leader();
        self.heartbeat_timer.suspend();
        self.candidate_timer.suspend();
        self.sync_shared().await;
        tracing::info!(term = self.state.current_term, "became leader");

        for peer in self.state.peers.clone() {
            self.spawn_replicator(peer);
        }

        let committed = self.log.read().await.committed_index();
        let consensus_set = self.state.peers.clone();
        let timeout = Duration::from_millis(self.config.rpc_timeout_ms);
        if let Err(e) = consensus::wait_for_consensus(&self.id, &consensus_set, &HashSet::new(), &self.replicators, committed, timeout).await {
            tracing::warn!(%e, "leadership confirmation barrier failed (non-fatal)");
        }
    }

    async fn observe_higher_term(&mut self, term: Term) {
        if self.state.observe_term(term) {
            self.election = None;
            self.teardown_leadership().await;
            let _ = self.persist().await;
            self.heartbeat_timer.reset();
            self.candidate_timer.suspend();
            self.sync_shared().await;
        }
    }

    fn spawn_replicator(&mut self, peer: NodeId) {
        if self.replicators.contains_key(&peer) {
            return;
        }
        let handle = peer_replicator::spawn(
            peer.clone(),
            self.id.clone(),
            self.log.clone(),
            self.store.clone(),
            self.transport.clone(),
            self.shared.clone(),
            self.config.clone(),
            self.higher_term_tx.clone(),
        );
        self.replicators.insert(peer, handle);
    }

    async fn teardown_leadership(&mut self) {
        for (_, handle) in self.replicators.drain() {
            handle.stop().await;
        }
    }

    // -- persistence (§4.2, §5) -----------------------------------------

    /// Persist the delta between the in-memory log and what's already on
    /// disk, plus current term/vote, as a single atomic batch (§4.2).
    async fn persist(&mut self) -> RaftResult<()> {
        let log = self.log.read().await;
        let current_ids: HashSet<LogId> = log.iter().map(|e| e.log_id()).collect();
        let to_add: Vec<_> = log
            .iter()
            .filter(|e| !self.persisted_log_ids.contains(&e.log_id()))
            .cloned()
            .collect();
        let to_delete: Vec<LogId> = self.persisted_log_ids.difference(&current_ids).cloned().collect();
        drop(log);

        self.store
            .persist_node(&to_add, &to_delete, self.state.current_term, self.state.voted_for.clone())
            .await?;

        for id in &to_delete {
            self.persisted_log_ids.remove(id);
        }
        for e in &to_add {
            self.persisted_log_ids.insert(e.log_id());
        }
        Ok(())
    }

    async fn sync_shared(&self) {
        {
            let mut shared = self.shared.write().await;
            shared.current_term = self.state.current_term;
            shared.role = self.state.role;
            shared.current_leader = self.state.current_leader.clone();
            shared.peers = self.state.peers.clone();
        }
        let stats = self.log.read().await.stats();
        let role = self.state.role;
        let term = self.state.current_term;
        let leader = self.state.current_leader.clone();
        self.metrics.report(move |m| {
            m.role = role;
            m.current_term = term;
            m.current_leader = leader;
            m.first_log_index = stats.first_index;
            m.last_log_index = stats.last_index;
            m.last_applied_index = stats.last_applied_index;
            m.committed_index = stats.committed_index;
        });
    }

    // -- commands (§4.4, §4.3 membership change) -------------------------

    #[tracing::instrument(level = "debug", skip(self, cmd, also_wait_for), fields(id = %self.id))]
    async fn do_command(&mut self, cmd: Command, also_wait_for: HashSet<NodeId>) -> RaftResult<CommandResult> {
        if !self.state.role.is_leader() {
            return Err(RaftError::NotLeader {
                leader_hint: self.state.current_leader.clone(),
            });
        }
        match cmd {
            Command::Get { key } => {
                self.read_barrier(also_wait_for).await?;
                let value = self.store.run_read_command(&key).await?;
                Ok(CommandResult::Value(value))
            }
            Command::Read => {
                self.read_barrier(also_wait_for).await?;
                Ok(CommandResult::Value(None))
            }
            Command::Join { peer } => self.handle_join(peer).await,
            Command::Leave { peer } => self.handle_leave(peer).await,
            other => self.replicate_write(other, also_wait_for).await,
        }
    }

    fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.config.rpc_timeout_ms)
    }

    async fn read_barrier(&mut self, also_wait_for: HashSet<NodeId>) -> RaftResult<()> {
        let index = self.log.read().await.committed_index();
        let consensus_set = self.state.peers.clone();
        let timeout = self.rpc_timeout();
        consensus::wait_for_consensus(&self.id, &consensus_set, &also_wait_for, &self.replicators, index, timeout).await
    }

    async fn replicate_write(&mut self, cmd: Command, also_wait_for: HashSet<NodeId>) -> RaftResult<CommandResult> {
        let term = self.state.current_term;
        let index = {
            let mut log = self.log.write().await;
            log.push(term, cmd)
        };
        self.persist().await?;
        for r in self.replicators.values() {
            r.notify();
        }

        let consensus_set = self.state.peers.clone();
        let timeout = self.rpc_timeout();
        consensus::wait_for_consensus(&self.id, &consensus_set, &also_wait_for, &self.replicators, index, timeout).await?;

        let applied = {
            let mut log = self.log.write().await;
            log.commit(index, self.store.as_ref()).await?
        };
        self.sync_shared().await;

        Ok(applied
            .into_iter()
            .find_map(|(_, a)| match a {
                Applied::State(r) => Some(r),
                Applied::Topology(_) => None,
            })
            .unwrap_or(CommandResult::Ack))
    }

    /// Membership change, two sequential consensuses (§4.3): a majority
    /// over the *current* peer set, then a majority over the *projected*
    /// peer set with the joining peer temporarily admitted.
    #[tracing::instrument(level = "debug", skip(self), fields(id = %self.id, %peer))]
    async fn handle_join(&mut self, peer: NodeId) -> RaftResult<CommandResult> {
        let timeout = self.rpc_timeout();
        let current_set = self.state.peers.clone();
        let committed = self.log.read().await.committed_index();
        consensus::wait_for_consensus(&self.id, &current_set, &HashSet::new(), &self.replicators, committed, timeout).await?;

        let already_present = self.state.peers.contains(&peer);
        if !already_present {
            self.state.peers.insert(peer.clone());
            self.spawn_replicator(peer.clone());
            self.sync_shared().await;
        }
        let projected_set = self.state.peers.clone();

        let term = self.state.current_term;
        let index = {
            let mut log = self.log.write().await;
            log.push(term, Command::Join { peer: peer.clone() })
        };
        self.persist().await?;
        for r in self.replicators.values() {
            r.notify();
        }

        match consensus::wait_for_consensus(&self.id, &projected_set, &HashSet::new(), &self.replicators, index, timeout).await {
            Ok(()) => {
                {
                    let mut log = self.log.write().await;
                    log.commit(index, self.store.as_ref()).await?;
                }
                self.store
                    .persist_peers(&self.state.peers.iter().cloned().collect::<Vec<_>>())
                    .await?;
                self.sync_shared().await;
                Ok(CommandResult::Ack)
            }
            Err(err) => {
                if !already_present {
                    self.state.peers.remove(&peer);
                    if let Some(handle) = self.replicators.remove(&peer) {
                        handle.stop().await;
                    }
                    self.transport.disconnect(&peer).await;
                    self.sync_shared().await;
                }
                Err(err)
            }
        }
    }

    #[tracing::instrument(level = "debug", skip(self), fields(id = %self.id, %peer))]
    async fn handle_leave(&mut self, peer: NodeId) -> RaftResult<CommandResult> {
        let timeout = self.rpc_timeout();
        let current_set = self.state.peers.clone();
        let committed = self.log.read().await.committed_index();
        consensus::wait_for_consensus(&self.id, &current_set, &HashSet::new(), &self.replicators, committed, timeout).await?;

        let mut projected_set = current_set.clone();
        projected_set.remove(&peer);

        let term = self.state.current_term;
        let index = {
            let mut log = self.log.write().await;
            log.push(term, Command::Leave { peer: peer.clone() })
        };
        self.persist().await?;
        for r in self.replicators.values() {
            r.notify();
        }

        consensus::wait_for_consensus(&self.id, &projected_set, &HashSet::new(), &self.replicators, index, timeout).await?;

        {
            let mut log = self.log.write().await;
            log.commit(index, self.store.as_ref()).await?;
        }
        self.state.peers.remove(&peer);
        self.store
            .persist_peers(&self.state.peers.iter().cloned().collect::<Vec<_>>())
            .await?;
        self.sync_shared().await;

        // Drop the transport/replicator only after a grace period so
        // in-flight RPCs to the leaving peer can drain (§4.3, §6
        // `waitBeforeLeaveMS`).
        if let Some(handle) = self.replicators.remove(&peer) {
            let transport = self.transport.clone();
            let wait = Duration::from_millis(self.config.wait_before_leave_ms);
            let peer = peer.clone();
            tokio::spawn(async move {
                tokio::time::sleep(wait).await;
                handle.stop().await;
                transport.disconnect(&peer).await;
            });
        }
        Ok(CommandResult::Ack)
    }

    /// Apply a topology command observed via a committed `AppendEntries`
    /// (follower side, or leader side via its own commit path never routes
    /// here since `handle_join`/`handle_leave` already updated `peers`).
    async fn apply_topology(&mut self, cmd: Command) {
        match cmd {
            Command::Join { peer } => {
                if peer != self.id && self.state.peers.insert(peer.clone()) {
                    if self.state.role.is_leader() {
                        self.spawn_replicator(peer);
                    }
                    let _ = self
                        .store
                        .persist_peers(&self.state.peers.iter().cloned().collect::<Vec<_>>())
                        .await;
                }
            }
            Command::Leave { peer } => {
                if self.state.peers.remove(&peer) {
                    if let Some(handle) = self.replicators.remove(&peer) {
                        tokio::spawn(async move { handle.stop().await });
                    }
                    let _ = self
                        .store
                        .persist_peers(&self.state.peers.iter().cloned().collect::<Vec<_>>())
                        .await;
                }
            }
            _ => {}
        }
        self.sync_shared().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_support::TestStore;
    use crate::transport::loopback::LoopbackNetwork;

    fn addr(port: u16) -> NodeId {
        NodeId::parse(&format!("/ip4/127.0.0.1/tcp/{port}")).unwrap()
    }

    #[tokio::test]
    async fn single_node_becomes_leader_and_accepts_a_put() {
        let network = LoopbackNetwork::new();
        let id = addr(9101);
        let store = Arc::new(TestStore::default());
        let transport = Arc::new(network.transport_for(id.clone()));
        let mut config = Config::default();
        config.heartbeat_timeout_min_ms = 10;
        config.heartbeat_timeout_max_ms = 20;

        let (node, inbound_tx) = Node::start(id.clone(), config, store, transport).await.unwrap();
        network.register(id.clone(), inbound_tx);

        // Wait for the node to win its own single-node election.
        let mut metrics = node.metrics();
        loop {
            if metrics.borrow().role.is_leader() {
                break;
            }
            metrics.changed().await.unwrap();
        }

        let result = node
            .command(Command::Put {
                key: "a".into(),
                value: b"1".to_vec(),
            })
            .await
            .unwrap();
        assert_eq!(result, CommandResult::Ack);

        let got = node.command(Command::Get { key: "a".into() }).await.unwrap();
        assert_eq!(got, CommandResult::Value(Some(b"1".to_vec())));

        node.stop().await;
    }

    #[tokio::test]
    async fn follower_rejects_command_with_leader_hint() {
        let network = LoopbackNetwork::new();
        let id = addr(9102);
        let store = Arc::new(TestStore::default());
        let transport = Arc::new(network.transport_for(id.clone()));
        // Long election timeout: stays Follower for the duration of the test.
        let mut config = Config::default();
        config.heartbeat_timeout_min_ms = 60_000;
        config.heartbeat_timeout_max_ms = 60_001;

        let (node, inbound_tx) = Node::start(id.clone(), config, store, transport).await.unwrap();
        network.register(id, inbound_tx);

        let err = node.command(Command::Read).await.unwrap_err();
        assert!(matches!(err, RaftError::NotLeader { leader_hint: None }));
        node.stop().await;
    }
}
