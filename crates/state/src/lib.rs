//! The authoritative set of cluster-pinned CIDs and the log-apply
//! semantics that mutate it.
//!
//! [`PinStore`] is the "State" capability set: `Add`, `Remove`, `Has`,
//! `List`, `Snapshot`, `Restore`. It is fed only by [`apply`], which is
//! the sole mutator the Consensus Engine is allowed to call on the
//! local peer.

mod operation;
mod pin_store;
#[cfg(feature = "test-support")]
pub mod test_support;

pub use operation::{Effect, LogOperation, LogOperationKind};
pub use pin_store::{InMemoryState, PinStore, StateError, StateKind};

use tracing::{trace, warn};

/// A hard apply failure: the pre-apply snapshot is carried along so the
/// caller can build a rollback request without ever needing a "nil state"
/// sentinel.
#[derive(Debug, Clone)]
pub struct HardApplyFailure {
    /// Snapshot bytes taken immediately before the failed mutation.
    pub pre_apply_snapshot: Vec<u8>,
    /// Human-readable reason, surfaced in logs and in the rollback request.
    pub reason: String,
}

/// A tagged view onto the concrete [`PinStore`] behind the apply boundary's
/// `&mut dyn PinStore`, so a state-kind mismatch is an explicit match arm
/// instead of a `downcast` panic.
pub enum AppliedState<'a> {
    InMemory(&'a mut InMemoryState),
    #[cfg(feature = "test-support")]
    Failing(&'a mut test_support::FailingState),
}

impl<'a> AppliedState<'a> {
    /// Tag `store` by its advertised [`StateKind`], then downcast to confirm
    /// the concrete type actually matches. A mismatch means `kind()` lied
    /// about its own type — a bug in a `PinStore` impl, not a runtime fault
    /// in well-behaved state — and is reported as
    /// [`StateError::TypeMismatch`] rather than causing a downcast panic.
    pub fn tag(store: &'a mut dyn PinStore) -> Result<Self, StateError> {
        let kind = store.kind();
        let actual = format!("{store:?}");
        match kind {
            StateKind::InMemory => store
                .as_any_mut()
                .downcast_mut::<InMemoryState>()
                .map(AppliedState::InMemory)
                .ok_or_else(|| StateError::TypeMismatch { expected: kind.to_string(), actual }),
            #[cfg(feature = "test-support")]
            StateKind::Failing => store
                .as_any_mut()
                .downcast_mut::<test_support::FailingState>()
                .map(AppliedState::Failing)
                .ok_or_else(|| StateError::TypeMismatch { expected: kind.to_string(), actual }),
        }
    }

    /// Un-tag back to the trait-object form the apply mutation arms use.
    pub fn into_pin_store(self) -> &'a mut dyn PinStore {
        match self {
            AppliedState::InMemory(s) => s,
            #[cfg(feature = "test-support")]
            AppliedState::Failing(s) => s,
        }
    }
}

/// Apply a single log operation to `state`, producing the follow-up effect
/// to emit on the Agent's outbound request channel.
///
/// Semantics:
/// - `Pin(c)`: `state.add(c)`; success emits `Track(c)`. `Add` is
///   idempotent, so replay is safe. Any failure here is a hard failure —
///   `Add` is not expected to fail for a previously-validated CID, so a
///   failure indicates the local store has diverged — and triggers
///   rollback.
/// - `Unpin(c)`: `state.remove(c)`; success emits `Untrack(c)`. A
///   `NotPinned` failure is **soft**: the log is authoritative, so a
///   repeated unpin across replays returns success with no effect.
/// - `Rollback`: restores `state` from the carried snapshot; never fails
///   softly — a restore failure is itself a hard failure (there is nowhere
///   further to roll back to from here).
pub fn apply(op: &LogOperation, state: &mut dyn PinStore) -> Result<Effect, HardApplyFailure> {
    let state = match AppliedState::tag(&mut *state) {
        Ok(tagged) => tagged.into_pin_store(),
        Err(mismatch) => {
            return Err(HardApplyFailure {
                pre_apply_snapshot: state.snapshot(),
                reason: format!("apply boundary: {mismatch}"),
            });
        }
    };
    match op {
        LogOperation::Pin { cid, .. } => match state.add(cid.clone()) {
            Ok(()) => {
                trace!(cid = %cid, "pin applied");
                Ok(Effect::Track(cid.clone()))
            }
            Err(e) => Err(HardApplyFailure {
                pre_apply_snapshot: state.snapshot(),
                reason: format!("pin {cid} failed to apply: {e}"),
            }),
        },
        LogOperation::Unpin { cid, .. } => match state.remove(cid) {
            Ok(()) => {
                trace!(cid = %cid, "unpin applied");
                Ok(Effect::Untrack(cid.clone()))
            }
            Err(StateError::NotPinned) => {
                warn!(cid = %cid, "unpin of absent cid, treating as soft failure");
                Ok(Effect::None)
            }
            Err(e) => Err(HardApplyFailure {
                pre_apply_snapshot: state.snapshot(),
                reason: format!("unpin {cid} failed to apply: {e}"),
            }),
        },
        LogOperation::Rollback { snapshot, .. } => {
            let pre_apply_snapshot = state.snapshot();
            match state.restore(snapshot) {
                Ok(()) => {
                    warn!("state restored from rollback snapshot");
                    Ok(Effect::None)
                }
                Err(e) => Err(HardApplyFailure {
                    pre_apply_snapshot,
                    reason: format!("rollback restore failed: {e}"),
                }),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use peerpin_cid::Cid;
    use uuid::Uuid;

    fn cid(seed: &str) -> Cid {
        Cid::new(peerpin_cid::DEFAULT_CODEC, seed.as_bytes())
    }

    #[test]
    fn pin_then_unpin_round_trip() {
        let mut state = InMemoryState::new();
        let c = cid("a");

        let pin = LogOperation::Pin { cid: c.clone(), client_request_id: Uuid::nil() };
        let effect = apply(&pin, &mut state).unwrap();
        assert_eq!(effect, Effect::Track(c.clone()));
        assert!(state.has(&c));

        let unpin = LogOperation::Unpin { cid: c.clone(), client_request_id: Uuid::nil() };
        let effect = apply(&unpin, &mut state).unwrap();
        assert_eq!(effect, Effect::Untrack(c.clone()));
        assert!(!state.has(&c));
    }

    #[test]
    fn repeated_unpin_is_soft_and_idempotent() {
        let mut state = InMemoryState::new();
        let c = cid("b");
        let unpin = LogOperation::Unpin { cid: c, client_request_id: Uuid::nil() };

        let effect = apply(&unpin, &mut state).unwrap();
        assert_eq!(effect, Effect::None);
        let effect = apply(&unpin, &mut state).unwrap();
        assert_eq!(effect, Effect::None);
    }

    #[test]
    fn repeated_pin_is_idempotent_and_re_emits_track() {
        let mut state = InMemoryState::new();
        let c = cid("c");
        let pin = LogOperation::Pin { cid: c.clone(), client_request_id: Uuid::nil() };

        apply(&pin, &mut state).unwrap();
        let effect = apply(&pin, &mut state).unwrap();
        assert_eq!(effect, Effect::Track(c));
        assert_eq!(state.len(), 1);
    }

    #[test]
    fn snapshot_restore_round_trip_is_deterministic() {
        let mut state = InMemoryState::new();
        for seed in ["x", "y", "z"] {
            state.add(cid(seed)).unwrap();
        }
        let snap = state.snapshot();

        let mut restored = InMemoryState::new();
        restored.restore(&snap).unwrap();

        let mut a: Vec<_> = state.list().into_iter().map(|c| c.to_string()).collect();
        let mut b: Vec<_> = restored.list().into_iter().map(|c| c.to_string()).collect();
        a.sort();
        b.sort();
        assert_eq!(a, b);
        assert_eq!(snap, restored.snapshot());
    }

    /// A `PinStore` whose `kind()` claims `InMemory` but whose concrete type
    /// is not `InMemoryState`, so `AppliedState::tag` must reject it rather
    /// than trust the claim.
    #[derive(Debug, Default)]
    struct LyingState {
        inner: InMemoryState,
    }

    impl PinStore for LyingState {
        fn add(&mut self, cid: Cid) -> Result<(), StateError> {
            self.inner.add(cid)
        }
        fn remove(&mut self, cid: &Cid) -> Result<(), StateError> {
            self.inner.remove(cid)
        }
        fn has(&self, cid: &Cid) -> bool {
            self.inner.has(cid)
        }
        fn list(&self) -> Vec<Cid> {
            self.inner.list()
        }
        fn snapshot(&self) -> Vec<u8> {
            self.inner.snapshot()
        }
        fn restore(&mut self, bytes: &[u8]) -> Result<(), StateError> {
            self.inner.restore(bytes)
        }
        fn validate_restore(&self, bytes: &[u8]) -> Result<(), StateError> {
            self.inner.validate_restore(bytes)
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

    #[test]
    fn apply_boundary_rejects_a_kind_that_does_not_match_its_concrete_type() {
        let mut state = LyingState::default();
        let pin = LogOperation::Pin { cid: cid("mismatch"), client_request_id: Uuid::nil() };

        let failure = apply(&pin, &mut state).unwrap_err();
        assert!(failure.reason.contains("apply boundary"));
    }

    #[test]
    fn applied_state_tag_reports_type_mismatch_directly() {
        let mut state = LyingState::default();
        let err = AppliedState::tag(&mut state).unwrap_err();
        assert!(matches!(err, StateError::TypeMismatch { .. }));
    }
}
