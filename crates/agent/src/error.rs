use peerpin_cid::CidError;
use peerpin_consensus::ConsensusError;
use thiserror::Error;

/// Errors surfaced from the Agent Controller's public operations surface.
#[derive(Debug, Error)]
pub enum AgentError {
    /// A CID string handed to `Pin`/`Unpin` could not be parsed.
    #[error(transparent)]
    NotDecodable(#[from] CidError),

    /// Propagated from the consensus engine (`NoLeader`, `CommitTimeout`,
    /// `RollbackRequested`'s underlying transport/forwarding failures, ...).
    #[error(transparent)]
    Consensus(#[from] ConsensusError),

    /// The controller has already been shut down.
    #[error("agent has been shut down")]
    ShuttingDown,
}
