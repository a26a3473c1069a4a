use peerpin_state::LogOperation;
use serde::{Deserialize, Serialize};
use std::fmt;

/// One entry in a peer's replicated log.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LogEntry {
    pub index: u64,
    pub term: u64,
    pub operation: LogOperation,
}

/// Durable storage for a peer's replicated log. `InMemoryLogStore` is the
/// default; a disk-backed implementation (e.g. an embedded key-value store)
/// is left to deployments that need durability across restarts.
pub trait LogStore: fmt::Debug + Send + Sync {
    /// Append `entries` after the current tail. Callers are responsible for
    /// having truncated any conflicting suffix first.
    fn append(&mut self, entries: &[LogEntry]);
    /// Drop every entry with index >= `index`, used to resolve a log
    /// inconsistency discovered during `AppendEntries`.
    fn truncate_from(&mut self, index: u64);
    /// The entry at `index`, if still retained.
    fn entry(&self, index: u64) -> Option<LogEntry>;
    /// All retained entries with index >= `index`, in order.
    fn entries_from(&self, index: u64) -> Vec<LogEntry>;
    /// The highest index appended so far, or 0 if the log is empty.
    fn last_index(&self) -> u64;
    /// The term of the entry at `index`, if retained.
    fn term_at(&self, index: u64) -> Option<u64>;
    /// Drop every entry with index < `index`: the entries a retained
    /// snapshot has subsumed.
    fn compact_before(&mut self, index: u64);
}

/// `Vec`-backed log store. Entries are kept in index order; compaction
/// simply drops a prefix, so lookups are by binary search on `index`
/// rather than by direct offset.
#[derive(Debug, Default)]
pub struct InMemoryLogStore {
    entries: Vec<LogEntry>,
}

impl InMemoryLogStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn position(&self, index: u64) -> Result<usize, usize> {
        self.entries.binary_search_by_key(&index, |e| e.index)
    }
}

impl LogStore for InMemoryLogStore {
    fn append(&mut self, entries: &[LogEntry]) {
        self.entries.extend_from_slice(entries);
    }

    fn truncate_from(&mut self, index: u64) {
        self.entries.retain(|e| e.index < index);
    }

    fn entry(&self, index: u64) -> Option<LogEntry> {
        self.position(index).ok().map(|i| self.entries[i].clone())
    }

    fn entries_from(&self, index: u64) -> Vec<LogEntry> {
        self.entries.iter().filter(|e| e.index >= index).cloned().collect()
    }

    fn last_index(&self) -> u64 {
        self.entries.last().map(|e| e.index).unwrap_or(0)
    }

    fn term_at(&self, index: u64) -> Option<u64> {
        self.entry(index).map(|e| e.term)
    }

    fn compact_before(&mut self, index: u64) {
        self.entries.retain(|e| e.index >= index);
    }
}
