use crate::transport::TransportError;
use thiserror::Error;

/// Errors surfaced by the consensus engine's public operations.
#[derive(Debug, Error)]
pub enum ConsensusError {
    /// No leader is currently known; the caller may retry with backoff.
    #[error("no leader known")]
    NoLeader,

    /// `CommitOp` was appended but no quorum acknowledged it before the
    /// caller's timeout elapsed. Outcome is unknown; the operation may
    /// still commit later.
    #[error("commit timed out waiting for quorum")]
    CommitTimeout,

    /// The peer the operation was forwarded to reported a failure.
    #[error("leader rejected forwarded operation: {0}")]
    Forwarded(String),

    /// A transport-level failure while forwarding or replicating.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// The engine has been shut down.
    #[error("engine is shutting down")]
    ShuttingDown,

    /// The current leader received a `Rollback` but the carried snapshot
    /// did not restore cleanly against the local `PinStore` kind, so it was
    /// never appended to the replicated log.
    #[error("rollback rejected: {0}")]
    RollbackRejected(String),

    /// The entry this `CommitOp` call submitted committed, but applying it
    /// locally hit a hard failure and a cluster-wide restore was issued.
    /// The pin/unpin itself is not in effect; the caller should treat it
    /// as failed, not as a transient error to retry verbatim.
    #[error("apply failed after commit, rollback requested: {0}")]
    RollbackRequested(String),
}

pub type Result<T> = std::result::Result<T, ConsensusError>;
