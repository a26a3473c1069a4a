//! The replicated-log engine: leader election, log replication, commit,
//! local apply, and the rollback protocol.
//!
//! One [`ConsensusEngine`] exists per cluster peer. It owns the peer's Raft
//! role and term, its log, and its local [`PinStore`]; the only way State
//! mutates is through [`peerpin_state::apply`] on committed entries.

use crate::config::ConsensusConfig;
use crate::error::{ConsensusError, Result};
use crate::log::{LogEntry, LogStore};
use crate::transport::{
    AppendEntriesArgs, AppendEntriesReply, InboundRpc, ProposeArgs, ProposeReply, RequestVoteArgs, RequestVoteReply,
    Transport,
};
use peerpin_state::{HardApplyFailure, LogOperation, PinStore};
use peerpin_telemetry::Logger;
use parking_lot::Mutex;
use rand::Rng;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// A peer's position in the Raft state machine.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

/// Asynchronous notifications the engine produces as it applies committed
/// entries: the outbound stream an Agent consumes to drive the pin tracker
/// and to observe leadership/rollback activity.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    Effect(peerpin_state::Effect),
    RollbackRequested { reason: String },
    LeaderChanged(Option<crate::transport::PeerId>),
}

struct RetainedSnapshot {
    through_index: u64,
    #[allow(dead_code)]
    bytes: Vec<u8>,
}

struct Core {
    role: Role,
    current_term: u64,
    voted_for: Option<crate::transport::PeerId>,
    leader_id: Option<crate::transport::PeerId>,
    commit_index: u64,
    last_applied: u64,
    next_index: HashMap<crate::transport::PeerId, u64>,
    match_index: HashMap<crate::transport::PeerId, u64>,
    log: Box<dyn LogStore>,
    retained_snapshots: VecDeque<RetainedSnapshot>,
    /// Indices whose local apply hit a hard failure, with the reason.
    /// Checked by a waiting `propose_as_leader` so a caller whose own
    /// submission triggered a rollback sees `RollbackRequested` rather
    /// than a bare `Ok`.
    failed_applies: HashMap<u64, String>,
}

/// One cluster peer's consensus engine: log, role, and the local applied
/// State it is the sole mutator of.
pub struct ConsensusEngine {
    config: ConsensusConfig,
    core: Mutex<Core>,
    state: Mutex<Box<dyn PinStore>>,
    transport: Arc<dyn Transport>,
    events: mpsc::Sender<EngineEvent>,
    commit_watch: watch::Sender<u64>,
    cancel: watch::Sender<bool>,
    logger: Logger,
}

/// Handle to a running engine's background tasks.
pub struct EngineHandle {
    cancel: watch::Sender<bool>,
    main_task: JoinHandle<()>,
}

impl EngineHandle {
    /// Cancel all scopes, let the main loop drain, and return. Idempotent:
    /// a second call observes the channel already closed/true and returns
    /// immediately.
    pub async fn shutdown(self) {
        let _ = self.cancel.send(true);
        let _ = self.main_task.await;
    }
}

impl ConsensusEngine {
    pub fn new(
        config: ConsensusConfig,
        transport: Arc<dyn Transport>,
        log: Box<dyn LogStore>,
        state: Box<dyn PinStore>,
        events: mpsc::Sender<EngineEvent>,
    ) -> Arc<Self> {
        let logger = Logger::new("consensus", transport.local_id().to_string());
        let (cancel, _) = watch::channel(false);
        let (commit_watch, _) = watch::channel(0);

        Arc::new(ConsensusEngine {
            config,
            core: Mutex::new(Core {
                role: Role::Follower,
                current_term: 0,
                voted_for: None,
                leader_id: None,
                commit_index: 0,
                last_applied: 0,
                next_index: HashMap::new(),
                match_index: HashMap::new(),
                log,
                retained_snapshots: VecDeque::new(),
                failed_applies: HashMap::new(),
            }),
            state: Mutex::new(state),
            transport,
            events,
            commit_watch,
            cancel,
            logger,
        })
    }

    pub fn local_id(&self) -> crate::transport::PeerId {
        self.transport.local_id().clone()
    }

    pub fn role(&self) -> Role {
        self.core.lock().role
    }

    /// `Leader() -> peer-id`.
    pub fn leader(&self) -> Option<crate::transport::PeerId> {
        self.core.lock().leader_id.clone()
    }

    /// `GetLogHead() -> state`: a consistent snapshot of the locally
    /// applied State.
    pub fn get_log_head(&self) -> Vec<u8> {
        self.state.lock().snapshot()
    }

    pub fn has(&self, cid: &peerpin_cid::Cid) -> bool {
        self.state.lock().has(cid)
    }

    pub fn list(&self) -> Vec<peerpin_cid::Cid> {
        self.state.lock().list()
    }

    /// `(AppliedIndex, LastIndex)`, polled by the Agent's catch-up loop.
    pub fn progress(&self) -> (u64, u64) {
        let core = self.core.lock();
        (core.last_applied, core.log.last_index())
    }

    /// Spawn the engine's election/heartbeat/inbound-RPC loop. Returns a
    /// handle whose `shutdown` cancels it.
    pub fn spawn(self: &Arc<Self>, mut inbound: mpsc::Receiver<InboundRpc>) -> EngineHandle {
        let engine = Arc::clone(self);
        let cancel_tx = self.cancel.clone();
        let mut cancel_rx = self.cancel.subscribe();

        if self.config.single_node {
            self.become_single_node_leader();
        }

        let main_task = tokio::spawn(async move {
            let mut deadline = engine.new_election_deadline();
            loop {
                tokio::select! {
                    _ = cancel_rx.changed() => {
                        if *cancel_rx.borrow() {
                            break;
                        }
                    }
                    maybe_rpc = inbound.recv() => {
                        match maybe_rpc {
                            Some(rpc) => {
                                engine.handle_inbound(rpc, &mut deadline).await;
                            }
                            None => break,
                        }
                    }
                    _ = tokio::time::sleep(deadline_remaining(deadline)) => {
                        engine.on_election_timeout(&mut deadline).await;
                    }
                }
            }
        });

        EngineHandle { cancel: cancel_tx, main_task }
    }

    fn become_single_node_leader(&self) {
        let mut core = self.core.lock();
        core.current_term += 1;
        core.role = Role::Leader;
        core.leader_id = Some(self.local_id());
        core.voted_for = Some(self.local_id());
    }

    fn new_election_deadline(&self) -> std::time::Instant {
        let jitter = rand::thread_rng().gen_range(0..self.config.election_timeout_ms);
        std::time::Instant::now() + Duration::from_millis(self.config.election_timeout_ms + jitter)
    }

    async fn handle_inbound(&self, rpc: InboundRpc, deadline: &mut std::time::Instant) {
        match rpc {
            InboundRpc::RequestVote(args, reply) => {
                let response = self.on_request_vote(args, deadline);
                let _ = reply.send(response);
            }
            InboundRpc::AppendEntries(args, reply) => {
                let response = self.on_append_entries(args, deadline);
                self.apply_committed().await;
                let _ = reply.send(response);
            }
            InboundRpc::Propose(args, reply) => {
                let result = self.commit_locally_or_reject(args.operation).await;
                let _ = reply.send(ProposeReply { result: result.map_err(|e| e.to_string()) });
            }
        }
    }

    fn on_request_vote(&self, args: RequestVoteArgs, deadline: &mut std::time::Instant) -> RequestVoteReply {
        let mut core = self.core.lock();
        if args.term < core.current_term {
            return RequestVoteReply { term: core.current_term, vote_granted: false };
        }
        if args.term > core.current_term {
            core.current_term = args.term;
            core.role = Role::Follower;
            core.voted_for = None;
            core.leader_id = None;
        }

        let our_last_term = core.last_log_term(&core.log);
        let up_to_date = args.last_log_term > our_last_term
            || (args.last_log_term == our_last_term && args.last_log_index >= core.log.last_index());

        let can_vote = core.voted_for.is_none() || core.voted_for.as_ref() == Some(&args.candidate_id);
        let grant = can_vote && up_to_date;
        if grant {
            core.voted_for = Some(args.candidate_id.clone());
            *deadline = self.new_election_deadline();
        }
        RequestVoteReply { term: core.current_term, vote_granted: grant }
    }

    fn on_append_entries(&self, args: AppendEntriesArgs, deadline: &mut std::time::Instant) -> AppendEntriesReply {
        let mut core = self.core.lock();
        if args.term < core.current_term {
            return AppendEntriesReply { term: core.current_term, success: false, match_index: core.log.last_index() };
        }

        core.current_term = args.term;
        core.role = Role::Follower;
        core.leader_id = Some(args.leader_id.clone());
        *deadline = self.new_election_deadline();

        if args.prev_log_index > 0 {
            match core.log.term_at(args.prev_log_index) {
                Some(term) if term == args.prev_log_term => {}
                _ => {
                    return AppendEntriesReply { term: core.current_term, success: false, match_index: core.log.last_index() };
                }
            }
        }

        for entry in &args.entries {
            if let Some(existing_term) = core.log.term_at(entry.index) {
                if existing_term != entry.term {
                    core.log.truncate_from(entry.index);
                }
            }
        }
        let new_entries: Vec<LogEntry> = args
            .entries
            .into_iter()
            .filter(|e| core.log.term_at(e.index).is_none())
            .collect();
        core.log.append(&new_entries);

        let last_new_index = core.log.last_index();
        if args.leader_commit > core.commit_index {
            core.commit_index = args.leader_commit.min(last_new_index);
        }

        AppendEntriesReply { term: core.current_term, success: true, match_index: last_new_index }
    }

    async fn on_election_timeout(&self, deadline: &mut std::time::Instant) {
        let should_run = {
            let core = self.core.lock();
            core.role != Role::Leader
        };
        if !should_run {
            *deadline = self.new_election_deadline();
            return;
        }
        self.run_election(deadline).await;
    }

    async fn run_election(&self, deadline: &mut std::time::Instant) {
        let (term, candidate, last_log_index, last_log_term) = {
            let mut core = self.core.lock();
            core.current_term += 1;
            core.role = Role::Candidate;
            core.voted_for = Some(self.local_id());
            core.leader_id = None;
            (core.current_term, self.local_id(), core.log.last_index(), core.last_log_term(&core.log))
        };
        *deadline = self.new_election_deadline();

        let peers = self.transport.peers();
        let mut votes = 1usize;
        let needed = peers.len() / 2 + 1;

        let mut futures = Vec::new();
        for peer in &peers {
            let args = RequestVoteArgs {
                term,
                candidate_id: candidate.clone(),
                last_log_index,
                last_log_term,
            };
            futures.push(self.transport.request_vote(peer, args));
        }
        let results = futures::future::join_all(futures).await;

        for result in results {
            if let Ok(reply) = result {
                if reply.term > term {
                    let mut core = self.core.lock();
                    if reply.term > core.current_term {
                        core.current_term = reply.term;
                        core.role = Role::Follower;
                        core.voted_for = None;
                    }
                    return;
                }
                if reply.vote_granted {
                    votes += 1;
                }
            }
        }

        let still_candidate = {
            let core = self.core.lock();
            core.role == Role::Candidate && core.current_term == term
        };
        if still_candidate && votes >= needed {
            self.become_leader(term);
        }
    }

    fn become_leader(self: &Self, term: u64) {
        let leader_id = self.local_id();
        {
            let mut core = self.core.lock();
            if core.current_term != term || core.role != Role::Candidate {
                return;
            }
            core.role = Role::Leader;
            core.leader_id = Some(leader_id.clone());
            let next = core.log.last_index() + 1;
            for peer in self.transport.peers() {
                core.next_index.insert(peer.clone(), next);
                core.match_index.insert(peer, 0);
            }
        }
        let _ = self.events.try_send(EngineEvent::LeaderChanged(Some(leader_id)));
        self.logger.in_scope(|| tracing::info!(term, "became leader"));
    }

    /// `CommitOp(op) -> applied-op | error`.
    pub async fn commit(&self, operation: LogOperation) -> Result<u64> {
        self.commit_locally_or_reject(operation).await
    }

    async fn commit_locally_or_reject(&self, operation: LogOperation) -> Result<u64> {
        let (role, leader_id) = {
            let core = self.core.lock();
            (core.role, core.leader_id.clone())
        };

        if role == Role::Leader {
            return self.propose_as_leader(operation).await;
        }

        match leader_id {
            Some(leader) if leader != self.local_id() => {
                let reply = self
                    .transport
                    .propose(&leader, ProposeArgs { operation })
                    .await
                    .map_err(ConsensusError::Transport)?;
                reply.result.map_err(ConsensusError::Forwarded)
            }
            _ => Err(ConsensusError::NoLeader),
        }
    }

    /// Leader-side check for an incoming `Rollback`: the carried snapshot
    /// must actually restore against the local `PinStore` kind before this
    /// peer commits a cluster-wide restore to it. Applies to both a
    /// locally-originated rollback and one forwarded here from a follower.
    fn validate_rollback_snapshot(&self, snapshot: &[u8]) -> std::result::Result<(), String> {
        self.state.lock().validate_restore(snapshot).map_err(|e| e.to_string())
    }

    async fn propose_as_leader(&self, operation: LogOperation) -> Result<u64> {
        if let LogOperation::Rollback { snapshot, .. } = &operation {
            self.validate_rollback_snapshot(snapshot).map_err(ConsensusError::RollbackRejected)?;
        }
        let (index, term) = {
            let mut core = self.core.lock();
            let index = core.log.last_index() + 1;
            let term = core.current_term;
            core.log.append(&[LogEntry { index, term, operation }]);
            (index, term)
        };
        // A cluster of one is its own quorum: nothing to wait on a peer for.
        // Larger clusters still need `replicate_tick` to hear back from
        // followers before this can advance.
        let peers = self.transport.peers();
        if peers.is_empty() {
            self.advance_commit_index(term, &peers);
        }
        self.apply_committed().await;

        let mut commit_rx = self.commit_watch.subscribe();
        let wait = async {
            loop {
                if *commit_rx.borrow() >= index {
                    return Ok(index);
                }
                if commit_rx.changed().await.is_err() {
                    return Err(ConsensusError::ShuttingDown);
                }
            }
        };
        let outcome = match tokio::time::timeout(Duration::from_millis(self.config.election_timeout_ms * 20), wait).await {
            Ok(result) => result,
            Err(_) => Err(ConsensusError::CommitTimeout),
        };

        match outcome {
            Ok(index) => match self.core.lock().failed_applies.remove(&index) {
                Some(reason) => Err(ConsensusError::RollbackRequested(reason)),
                None => Ok(index),
            },
            Err(e) => Err(e),
        }
    }

    /// `Rollback(state) -> ok|error`: issued by a leader in response to a
    /// hard apply failure, logged like any other operation.
    pub async fn rollback(&self, snapshot: Vec<u8>) -> Result<u64> {
        self.commit(LogOperation::Rollback { snapshot, client_request_id: Uuid::new_v4() }).await
    }

    /// Leader-side replication tick: send `AppendEntries` to every peer,
    /// advance `commit_index` on quorum, and apply newly committed
    /// entries. Call on a fixed interval while this peer is leader.
    pub async fn replicate_tick(&self) {
        let is_leader = { self.core.lock().role == Role::Leader };
        if !is_leader {
            return;
        }

        let peers = self.transport.peers();
        let term = { self.core.lock().current_term };

        for peer in &peers {
            let (prev_log_index, prev_log_term, entries) = {
                let core = self.core.lock();
                let next = *core.next_index.get(peer).unwrap_or(&1);
                let prev_log_index = next.saturating_sub(1);
                let prev_log_term = core.log.term_at(prev_log_index).unwrap_or(0);
                (prev_log_index, prev_log_term, core.log.entries_from(next))
            };
            let leader_commit = { self.core.lock().commit_index };

            let args = AppendEntriesArgs {
                term,
                leader_id: self.local_id(),
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit,
            };

            match self.transport.append_entries(peer, args).await {
                Ok(reply) if reply.success => {
                    let mut core = self.core.lock();
                    core.match_index.insert(peer.clone(), reply.match_index);
                    core.next_index.insert(peer.clone(), reply.match_index + 1);
                }
                Ok(reply) => {
                    if reply.term > term {
                        let mut core = self.core.lock();
                        if reply.term > core.current_term {
                            core.current_term = reply.term;
                            core.role = Role::Follower;
                            core.leader_id = None;
                        }
                        return;
                    }
                    let mut core = self.core.lock();
                    let next = core.next_index.entry(peer.clone()).or_insert(1);
                    *next = next.saturating_sub(1).max(1);
                }
                Err(_) => {}
            }
        }

        self.advance_commit_index(term, &peers);
        self.apply_committed().await;
    }

    fn advance_commit_index(&self, term: u64, peers: &[crate::transport::PeerId]) {
        let mut core = self.core.lock();
        let last_index = core.log.last_index();
        let quorum = peers.len() / 2 + 1;

        let mut candidate_index = core.commit_index;
        for index in (core.commit_index + 1)..=last_index {
            if core.log.term_at(index) != Some(term) {
                continue;
            }
            let acks = 1 + peers
                .iter()
                .filter(|p| *core.match_index.get(*p).unwrap_or(&0) >= index)
                .count();
            if acks >= quorum {
                candidate_index = index;
            }
        }
        if candidate_index > core.commit_index {
            core.commit_index = candidate_index;
        }
    }

    /// Apply every committed-but-unapplied entry to local State, emitting
    /// effects and, on a hard failure, the rollback protocol.
    async fn apply_committed(&self) {
        let entries = {
            let core = self.core.lock();
            if core.commit_index <= core.last_applied {
                return;
            }
            core.log.entries_from(core.last_applied + 1)
                .into_iter()
                .take_while(|e| e.index <= core.commit_index)
                .collect::<Vec<_>>()
        };

        for entry in entries {
            let outcome = {
                let mut state = self.state.lock();
                peerpin_state::apply(&entry.operation, state.as_mut())
            };

            {
                let mut core = self.core.lock();
                core.last_applied = entry.index;
            }
            let _ = self.commit_watch.send(entry.index);

            match outcome {
                Ok(effect) => {
                    if !matches!(effect, peerpin_state::Effect::None) {
                        let _ = self.events.try_send(EngineEvent::Effect(effect));
                    }
                }
                Err(HardApplyFailure { pre_apply_snapshot, reason }) => {
                    self.logger.in_scope(|| tracing::warn!(reason = %reason, "hard apply failure, requesting rollback"));
                    self.core.lock().failed_applies.insert(entry.index, reason.clone());
                    let _ = self
                        .events
                        .try_send(EngineEvent::RollbackRequested { reason: reason.clone() });
                    self.route_rollback(pre_apply_snapshot).await;
                }
            }
        }

        self.maintain_snapshot_retention();
    }

    async fn route_rollback(&self, snapshot: Vec<u8>) {
        let (role, leader_id) = {
            let core = self.core.lock();
            (core.role, core.leader_id.clone())
        };
        match role {
            Role::Leader => {
                if let Err(e) = self.rollback(snapshot).await {
                    self.logger.in_scope(|| tracing::error!(error = %e, "leader rejected its own rollback request"));
                }
            }
            _ => {
                if let Some(leader) = leader_id {
                    if leader != self.local_id() {
                        let _ = self
                            .transport
                            .propose(
                                &leader,
                                ProposeArgs {
                                    operation: LogOperation::Rollback { snapshot, client_request_id: Uuid::new_v4() },
                                },
                            )
                            .await;
                    }
                }
            }
        }
    }

    fn maintain_snapshot_retention(&self) {
        let mut core = self.core.lock();
        let through_index = core.last_applied;
        if through_index == 0 {
            return;
        }
        if core.retained_snapshots.back().map(|s| s.through_index) == Some(through_index) {
            return;
        }
        let bytes = self.state.lock().snapshot();
        core.retained_snapshots.push_back(RetainedSnapshot { through_index, bytes });

        let max = self.config.max_snapshots as usize;
        while core.retained_snapshots.len() > max {
            core.retained_snapshots.pop_front();
        }
        if let Some(oldest) = core.retained_snapshots.front() {
            let compact_before = oldest.through_index;
            core.log.compact_before(compact_before);
            core.failed_applies.retain(|index, _| *index >= compact_before);
        }
    }

    /// Number of snapshots currently retained (bounded by `max_snapshots`).
    pub fn retained_snapshot_count(&self) -> usize {
        self.core.lock().retained_snapshots.len()
    }
}

impl Core {
    fn last_log_term(&self, log: &dyn LogStore) -> u64 {
        log.term_at(log.last_index()).unwrap_or(0)
    }
}

fn deadline_remaining(deadline: std::time::Instant) -> Duration {
    deadline.saturating_duration_since(std::time::Instant::now())
}
