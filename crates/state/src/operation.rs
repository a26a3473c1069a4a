use peerpin_cid::Cid;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A single entry in the replicated log.
///
/// Operations carry no mutable state of their own; ordering across
/// different CIDs comes entirely from log order, not submission order.
/// Each variant carries a `client_request_id` so a submitter can
/// correlate a commit with its original `CommitOp` call across retries,
/// without that id affecting equality of the pinned set.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum LogOperation {
    /// Commit the cluster's intent to retain `cid`.
    Pin {
        cid: Cid,
        client_request_id: Uuid,
    },
    /// Commit the cluster's intent to release `cid`.
    Unpin {
        cid: Cid,
        client_request_id: Uuid,
    },
    /// Cluster-wide restore of State from a prior snapshot, issued by the
    /// leader in response to a hard apply failure on some peer. Logged
    /// like any other operation so every peer converges in commit order.
    Rollback {
        snapshot: Vec<u8>,
        client_request_id: Uuid,
    },
}

/// A tag identifying the kind of [`LogOperation`] without its payload;
/// useful for logging and metrics call sites.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LogOperationKind {
    Pin,
    Unpin,
    Rollback,
}

impl LogOperation {
    /// The operation's kind, independent of its payload.
    pub fn kind(&self) -> LogOperationKind {
        match self {
            LogOperation::Pin { .. } => LogOperationKind::Pin,
            LogOperation::Unpin { .. } => LogOperationKind::Unpin,
            LogOperation::Rollback { .. } => LogOperationKind::Rollback,
        }
    }

    /// The request id the submitter attached, for correlating retries.
    pub fn client_request_id(&self) -> Uuid {
        match self {
            LogOperation::Pin { client_request_id, .. }
            | LogOperation::Unpin { client_request_id, .. }
            | LogOperation::Rollback { client_request_id, .. } => *client_request_id,
        }
    }
}

/// The asynchronous follow-up work an applied operation produces.
/// Emitted on the Agent's outbound request channel; the applier never
/// blocks waiting for a consumer to drain it.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Effect {
    /// Ask the tracker to start reconciling `cid` with the local store.
    Track(Cid),
    /// Ask the tracker to stop tracking `cid`.
    Untrack(Cid),
    /// No follow-up work (soft failures, rollback application, unknown
    /// operation kinds).
    None,
}
