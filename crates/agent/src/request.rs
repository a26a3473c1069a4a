use peerpin_cid::Cid;

/// A message on the Agent's outbound request channel.
///
/// A neutral type: both the consensus engine (producer) and the pin
/// tracker (consumer, out of this core's scope) depend on this type, not
/// on each other, so there is no cyclic crate dependency between
/// replication and tracking.
#[derive(Debug, Clone)]
pub enum Request {
    /// A CID was pinned; the tracker should start reconciling it with the
    /// local content store.
    Track(Cid),
    /// A CID was unpinned; the tracker should stop tracking it.
    Untrack(Cid),
    /// Bootstrap has caught up (or timed out catching up); the tracker
    /// should reconcile its local store against the whole of `State`.
    LocalSync,
    /// `inner` must be handled by whichever peer is currently leader, not
    /// necessarily the one that produced this request.
    LeaderEnvelope { inner: Box<Request> },
    /// A hard apply failure was observed; restore `State` from `snapshot`
    /// cluster-wide. Only meaningful when unwrapped from a
    /// [`Request::LeaderEnvelope`] and handled by the leader.
    Rollback { snapshot: Vec<u8> },
}

impl Request {
    /// Wrap this request so only the current leader acts on it.
    pub fn to_leader(self) -> Request {
        Request::LeaderEnvelope { inner: Box::new(self) }
    }
}
