use peerpin_cid::Cid;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::HashSet;
use std::fmt;
use thiserror::Error;

/// Errors from the [`PinStore`] capability set.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StateError {
    /// `Remove` was called for a CID that is not currently pinned.
    #[error("not pinned")]
    NotPinned,
    /// Snapshot bytes could not be restored into this implementation.
    #[error("snapshot could not be restored: {0}")]
    RestoreFailed(String),
    /// The apply boundary received a state kind it does not recognize.
    /// An explicit match arm in place of a cast panic.
    #[error("state type mismatch: expected {expected}, found {actual}")]
    TypeMismatch { expected: String, actual: String },
}

/// Identifies which concrete [`PinStore`] implementation is active, so the
/// apply boundary can recognize a mismatch explicitly instead of via a
/// language-level downcast.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum StateKind {
    /// The default `HashSet`-backed implementation.
    InMemory,
    /// The `test-support` fault-injection harness. Distinct from `InMemory`
    /// even though it wraps one, so the apply boundary's downcast tags it
    /// correctly rather than mistaking it for a plain `InMemoryState`.
    #[cfg(feature = "test-support")]
    Failing,
}

impl fmt::Display for StateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StateKind::InMemory => write!(f, "in_memory"),
            #[cfg(feature = "test-support")]
            StateKind::Failing => write!(f, "failing"),
        }
    }
}

/// The authoritative set of pinned CIDs.
///
/// `Add` is idempotent: adding an already-pinned CID returns success
/// without changing the set. `Remove` of an absent CID fails with
/// [`StateError::NotPinned`]. `Snapshot` must be deterministic for a given
/// logical state so two peers that applied the same log prefix produce
/// byte-identical snapshots.
pub trait PinStore: fmt::Debug + Send + Sync {
    /// Add `cid` to the pinned set. Idempotent.
    fn add(&mut self, cid: Cid) -> Result<(), StateError>;
    /// Remove `cid` from the pinned set. Fails with `NotPinned` if absent.
    fn remove(&mut self, cid: &Cid) -> Result<(), StateError>;
    /// Whether `cid` is currently pinned.
    fn has(&self, cid: &Cid) -> bool;
    /// All pinned CIDs. Order is unspecified but stable between calls
    /// absent intervening mutation.
    fn list(&self) -> Vec<Cid>;
    /// A deterministic serialization of the current state.
    fn snapshot(&self) -> Vec<u8>;
    /// Replace the current state with one deserialized from `bytes`.
    fn restore(&mut self, bytes: &[u8]) -> Result<(), StateError>;
    /// Dry-run a [`Self::restore`] against a scratch instance of the same
    /// kind, without mutating `self`. Used by the consensus engine's
    /// leader-side rollback validation so a malformed snapshot is rejected
    /// before it is ever committed to the replicated log.
    fn validate_restore(&self, bytes: &[u8]) -> Result<(), StateError>;
    /// Number of pinned CIDs.
    fn len(&self) -> usize {
        self.list().len()
    }
    /// Whether the pinned set is empty.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
    /// Which concrete implementation this is.
    fn kind(&self) -> StateKind;
    /// Type-erased view of `self`, for the apply boundary's tagged downcast.
    /// See [`crate::AppliedState::tag`].
    fn as_any(&self) -> &dyn Any;
    /// Mutable type-erased view of `self`.
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct SnapshotPayload {
    cids: Vec<Vec<u8>>,
}

/// Default `HashSet`-backed [`PinStore`].
#[derive(Debug, Default, Clone)]
pub struct InMemoryState {
    pinned: HashSet<Cid>,
}

impl InMemoryState {
    /// An empty pin set.
    pub fn new() -> Self {
        Self { pinned: HashSet::new() }
    }
}

impl PinStore for InMemoryState {
    fn add(&mut self, cid: Cid) -> Result<(), StateError> {
        self.pinned.insert(cid);
        Ok(())
    }

    fn remove(&mut self, cid: &Cid) -> Result<(), StateError> {
        if self.pinned.remove(cid) {
            Ok(())
        } else {
            Err(StateError::NotPinned)
        }
    }

    fn has(&self, cid: &Cid) -> bool {
        self.pinned.contains(cid)
    }

    fn list(&self) -> Vec<Cid> {
        self.pinned.iter().cloned().collect()
    }

    fn snapshot(&self) -> Vec<u8> {
        let mut cids: Vec<Vec<u8>> = self.pinned.iter().map(|c| c.as_bytes().to_vec()).collect();
        cids.sort();
        let payload = SnapshotPayload { cids };
        bincode::serialize(&payload).expect("snapshot payload is always serializable")
    }

    fn restore(&mut self, bytes: &[u8]) -> Result<(), StateError> {
        let payload: SnapshotPayload = bincode::deserialize(bytes)
            .map_err(|e| StateError::RestoreFailed(e.to_string()))?;
        self.pinned = payload
            .cids
            .into_iter()
            .map(Cid::from_canonical_bytes)
            .collect::<Result<HashSet<_>, _>>()
            .map_err(|e| StateError::RestoreFailed(e.to_string()))?;
        Ok(())
    }

    fn validate_restore(&self, bytes: &[u8]) -> Result<(), StateError> {
        InMemoryState::new().restore(bytes)
    }

    fn kind(&self) -> StateKind {
        StateKind::InMemory
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cid(seed: &str) -> Cid {
        Cid::new(peerpin_cid::DEFAULT_CODEC, seed.as_bytes())
    }

    #[test]
    fn add_is_idempotent() {
        let mut s = InMemoryState::new();
        let c = cid("idempotent");
        s.add(c.clone()).unwrap();
        s.add(c.clone()).unwrap();
        assert_eq!(s.len(), 1);
    }

    #[test]
    fn remove_absent_is_not_pinned() {
        let mut s = InMemoryState::new();
        assert_eq!(s.remove(&cid("ghost")), Err(StateError::NotPinned));
    }

    #[test]
    fn snapshot_is_order_independent() {
        let mut a = InMemoryState::new();
        a.add(cid("1")).unwrap();
        a.add(cid("2")).unwrap();

        let mut b = InMemoryState::new();
        b.add(cid("2")).unwrap();
        b.add(cid("1")).unwrap();

        assert_eq!(a.snapshot(), b.snapshot());
    }
}
