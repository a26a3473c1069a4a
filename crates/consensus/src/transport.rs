//! Peer-to-peer delivery of consensus RPCs.
//!
//! The engine is transport-agnostic: it drives elections and replication
//! purely against the [`Transport`] trait. [`InProcessTransport`] is the
//! only concrete implementation shipped here, used by single-node
//! bootstrap and by the test suite's simulated clusters.

use crate::log::LogEntry;
use async_trait::async_trait;
use peerpin_state::LogOperation;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

/// A cluster peer's transport-level identity.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        PeerId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        PeerId(s.to_string())
    }
}

impl From<String> for PeerId {
    fn from(s: String) -> Self {
        PeerId(s)
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("peer {0} is unreachable")]
    Unreachable(PeerId),
    #[error("request to peer {0} timed out")]
    Timeout(PeerId),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RequestVoteArgs {
    pub term: u64,
    pub candidate_id: PeerId,
    pub last_log_index: u64,
    pub last_log_term: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RequestVoteReply {
    pub term: u64,
    pub vote_granted: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppendEntriesArgs {
    pub term: u64,
    pub leader_id: PeerId,
    pub prev_log_index: u64,
    pub prev_log_term: u64,
    pub entries: Vec<LogEntry>,
    pub leader_commit: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppendEntriesReply {
    pub term: u64,
    pub success: bool,
    /// Highest index this follower's log now agrees with the leader on.
    pub match_index: u64,
}

/// Forwards a submission to the peer this node believes is the leader.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProposeArgs {
    pub operation: LogOperation,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProposeReply {
    pub result: Result<u64, String>,
}

/// Peer-to-peer delivery of the three consensus RPCs. Implementations only
/// need to get bytes to the named peer and back; retry and timeout policy
/// belongs to the engine, not the transport.
#[async_trait]
pub trait Transport: Send + Sync {
    fn local_id(&self) -> &PeerId;
    fn peers(&self) -> Vec<PeerId>;
    async fn request_vote(&self, peer: &PeerId, args: RequestVoteArgs) -> Result<RequestVoteReply, TransportError>;
    async fn append_entries(&self, peer: &PeerId, args: AppendEntriesArgs) -> Result<AppendEntriesReply, TransportError>;
    async fn propose(&self, peer: &PeerId, args: ProposeArgs) -> Result<ProposeReply, TransportError>;
}

/// A single RPC delivered to a peer's inbound queue, carrying its own reply
/// channel.
pub enum InboundRpc {
    RequestVote(RequestVoteArgs, oneshot::Sender<RequestVoteReply>),
    AppendEntries(AppendEntriesArgs, oneshot::Sender<AppendEntriesReply>),
    Propose(ProposeArgs, oneshot::Sender<ProposeReply>),
}

/// A shared in-process "network" multiple [`InProcessTransport`] handles
/// register against. Stands in for a real socket layer in tests and in
/// single-process deployments.
#[derive(Clone, Default)]
pub struct InProcessNetwork {
    inboxes: Arc<dashmap::DashMap<PeerId, mpsc::Sender<InboundRpc>>>,
    /// Explicit `false` entries model a cut link; absence means connected.
    links: Arc<dashmap::DashMap<(PeerId, PeerId), bool>>,
}

impl InProcessNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `id` on the network and get back its transport handle plus
    /// the receiver its owner must drain to answer inbound RPCs.
    pub fn join(&self, id: PeerId, peers: Vec<PeerId>) -> (InProcessTransport, mpsc::Receiver<InboundRpc>) {
        let (tx, rx) = mpsc::channel(256);
        self.inboxes.insert(id.clone(), tx);
        let transport = InProcessTransport {
            local_id: id,
            peers,
            inboxes: self.inboxes.clone(),
            links: self.links.clone(),
        };
        (transport, rx)
    }

    /// Simulate a network partition between `a` and `b`: RPCs in either
    /// direction fail as unreachable until [`InProcessNetwork::heal`].
    pub fn cut(&self, a: &PeerId, b: &PeerId) {
        self.links.insert((a.clone(), b.clone()), false);
        self.links.insert((b.clone(), a.clone()), false);
    }

    /// Restore connectivity cut by [`InProcessNetwork::cut`].
    pub fn heal(&self, a: &PeerId, b: &PeerId) {
        self.links.remove(&(a.clone(), b.clone()));
        self.links.remove(&(b.clone(), a.clone()));
    }

    /// Remove a peer's inbox entirely, simulating a crashed process: every
    /// other peer's RPCs to it now fail as unreachable.
    pub fn evict(&self, id: &PeerId) {
        self.inboxes.remove(id);
    }
}

pub struct InProcessTransport {
    local_id: PeerId,
    peers: Vec<PeerId>,
    inboxes: Arc<dashmap::DashMap<PeerId, mpsc::Sender<InboundRpc>>>,
    links: Arc<dashmap::DashMap<(PeerId, PeerId), bool>>,
}

impl InProcessTransport {
    fn connected_to(&self, peer: &PeerId) -> bool {
        !matches!(self.links.get(&(self.local_id.clone(), peer.clone())), Some(up) if !*up)
    }

    fn inbox(&self, peer: &PeerId) -> Result<mpsc::Sender<InboundRpc>, TransportError> {
        if !self.connected_to(peer) {
            return Err(TransportError::Unreachable(peer.clone()));
        }
        self.inboxes
            .get(peer)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| TransportError::Unreachable(peer.clone()))
    }
}

#[async_trait]
impl Transport for InProcessTransport {
    fn local_id(&self) -> &PeerId {
        &self.local_id
    }

    fn peers(&self) -> Vec<PeerId> {
        self.peers.clone()
    }

    async fn request_vote(&self, peer: &PeerId, args: RequestVoteArgs) -> Result<RequestVoteReply, TransportError> {
        let sender = self.inbox(peer)?;
        let (tx, rx) = oneshot::channel();
        sender
            .send(InboundRpc::RequestVote(args, tx))
            .await
            .map_err(|_| TransportError::Unreachable(peer.clone()))?;
        rx.await.map_err(|_| TransportError::Unreachable(peer.clone()))
    }

    async fn append_entries(&self, peer: &PeerId, args: AppendEntriesArgs) -> Result<AppendEntriesReply, TransportError> {
        let sender = self.inbox(peer)?;
        let (tx, rx) = oneshot::channel();
        sender
            .send(InboundRpc::AppendEntries(args, tx))
            .await
            .map_err(|_| TransportError::Unreachable(peer.clone()))?;
        rx.await.map_err(|_| TransportError::Unreachable(peer.clone()))
    }

    async fn propose(&self, peer: &PeerId, args: ProposeArgs) -> Result<ProposeReply, TransportError> {
        let sender = self.inbox(peer)?;
        let (tx, rx) = oneshot::channel();
        sender
            .send(InboundRpc::Propose(args, tx))
            .await
            .map_err(|_| TransportError::Unreachable(peer.clone()))?;
        rx.await.map_err(|_| TransportError::Unreachable(peer.clone()))
    }
}

/// Convenience: build every peer's transport handle for a fixed cluster in
/// one call, useful for tests and single-process bootstrap.
pub fn in_process_cluster(ids: &[PeerId]) -> (InProcessNetwork, HashMap<PeerId, (InProcessTransport, mpsc::Receiver<InboundRpc>)>) {
    let network = InProcessNetwork::new();
    let mut handles = HashMap::new();
    for id in ids {
        let peers = ids.iter().filter(|p| *p != id).cloned().collect();
        handles.insert(id.clone(), network.join(id.clone(), peers));
    }
    (network, handles)
}
