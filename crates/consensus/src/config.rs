/// Runtime tuning for one [`crate::ConsensusEngine`] instance.
///
/// Distinct from `peerpin_config::ConsensusComponentConfig`, which is the
/// JSON-facing settings object the config manager loads and persists:
/// the Agent Controller builds one of these from the loaded component
/// before constructing the engine.
#[derive(Clone, Debug)]
pub struct ConsensusConfig {
    /// Base election timeout; the engine adds a random jitter of the same
    /// magnitude on top of this for each new deadline.
    pub election_timeout_ms: u64,
    /// Interval a leader should call [`crate::ConsensusEngine::replicate_tick`] at.
    pub heartbeat_interval_ms: u64,
    /// Snapshots retained on disk before the subsumed log prefix is
    /// garbage-collected.
    pub max_snapshots: u32,
    /// Whether this peer bootstraps a one-node cluster that commits
    /// without waiting for quorum. Defaults to `false`: multi-peer unless
    /// explicitly opted in.
    pub single_node: bool,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            election_timeout_ms: 150,
            heartbeat_interval_ms: 50,
            max_snapshots: 5,
            single_node: false,
        }
    }
}
