//! A [`PinStore`] that fails `add` deterministically on a chosen call,
//! for exercising the hard-failure/rollback path from outside this crate.
//! Gated behind the `test-support` feature; never built into a release lib.

use crate::{InMemoryState, PinStore, StateError, StateKind};
use peerpin_cid::Cid;

/// Wraps an [`InMemoryState`] and fails the `n`th call to `add` (1-indexed)
/// with [`StateError::RestoreFailed`], then behaves normally thereafter.
#[derive(Debug)]
pub struct FailingState {
    inner: InMemoryState,
    calls: usize,
    fail_on_call: usize,
}

impl FailingState {
    /// `fail_on_call` is 1-indexed: `FailingState::new(5)` fails the fifth
    /// `add` and leaves every other call (including earlier `add`s and all
    /// `remove`s) to behave like a plain [`InMemoryState`].
    pub fn new(fail_on_call: usize) -> Self {
        Self { inner: InMemoryState::new(), calls: 0, fail_on_call }
    }
}

impl PinStore for FailingState {
    fn add(&mut self, cid: Cid) -> Result<(), StateError> {
        self.calls += 1;
        if self.calls == self.fail_on_call {
            return Err(StateError::RestoreFailed(format!("simulated failure on call {}", self.calls)));
        }
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
        StateKind::Failing
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}
