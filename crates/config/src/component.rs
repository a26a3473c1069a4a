use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use tokio::sync::watch;

/// A single registered sub-component's configuration.
///
/// Components are registered before load (`RegisterComponent`); loading
/// overlays the document's JSON onto the registered default, so a
/// component absent from the document still ends up with sane defaults
/// and is flagged `undefined` via [`crate::ConfigManager::is_loaded_from_json`].
pub trait ComponentConfig: fmt::Debug + Send + Sync {
    /// The section type this component belongs to (`"consensus"`, `"state"`, ...).
    fn section_type(&self) -> &str;
    /// The component's name within its section.
    fn name(&self) -> &str;
    /// Overlay `value` onto this component's current settings.
    fn load_from_json(&mut self, value: &serde_json::Value) -> Result<(), String>;
    /// Serialize this component back to JSON for `Save`/round-trip.
    fn to_json(&self) -> serde_json::Value;
    /// Serialize this component with hidden fields redacted, for `ToDisplayJSON`.
    fn to_display_json(&self) -> serde_json::Value {
        self.to_json()
    }
    /// Overlay this component's recognized environment variables.
    fn apply_env_vars(&mut self) {}
    /// Component-local validation.
    fn validate(&self) -> Result<(), String> {
        Ok(())
    }
    /// Paths in this component's configuration are relative to `dir`.
    fn set_base_dir(&mut self, _dir: &Path) {}
    /// A receiver that ticks whenever this component wants the document
    /// persisted. The Manager fans all registered components' receivers
    /// into a single debounce loop.
    fn save_signal(&self) -> watch::Receiver<u64>;
}

/// A passthrough component for sections this core does not interpret
/// (`api`, `ipfs_connector`, `pin_tracker`, `monitor`, `allocator`,
/// `informer`, `observations`, `datastore`). Stores whatever JSON blob it
/// was given verbatim so `Save(Load(doc)) == doc` holds for sections
/// outside the core's scope.
#[derive(Debug, Clone)]
pub struct OpaqueComponentConfig {
    section_type: String,
    name: String,
    blob: serde_json::Value,
    save_tx: watch::Sender<u64>,
    save_rx: watch::Receiver<u64>,
}

impl OpaqueComponentConfig {
    pub fn new(section_type: impl Into<String>, name: impl Into<String>) -> Self {
        let (save_tx, save_rx) = watch::channel(0);
        Self {
            section_type: section_type.into(),
            name: name.into(),
            blob: serde_json::Value::Object(Default::default()),
            save_tx,
            save_rx,
        }
    }
}

impl ComponentConfig for OpaqueComponentConfig {
    fn section_type(&self) -> &str {
        &self.section_type
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn load_from_json(&mut self, value: &serde_json::Value) -> Result<(), String> {
        self.blob = value.clone();
        Ok(())
    }

    fn to_json(&self) -> serde_json::Value {
        self.blob.clone()
    }

    fn save_signal(&self) -> watch::Receiver<u64> {
        self.save_rx.clone()
    }
}

fn default_watch() -> (watch::Sender<u64>, watch::Receiver<u64>) {
    watch::channel(0)
}

/// Configuration for one named consensus engine instance (section
/// `"consensus"`).
///
/// Each field is tracked as "explicitly set in the document" or "defaulted"
/// so that `Save(Load(doc)) == doc` holds for a document that only sets a
/// subset of these fields (testable property #4): an unset field reads
/// through its default via the accessor methods below, but is not written
/// back out on `Save`.
#[derive(Debug)]
pub struct ConsensusComponentConfig {
    name: String,
    election_timeout_ms: Option<u64>,
    heartbeat_interval_ms: Option<u64>,
    max_snapshots: Option<u32>,
    rpc_max_queue: Option<usize>,
    #[allow(clippy::type_complexity)]
    save: (watch::Sender<u64>, watch::Receiver<u64>),
}

fn default_election_timeout_ms() -> u64 {
    150
}
fn default_heartbeat_interval_ms() -> u64 {
    50
}
fn default_max_snapshots() -> u32 {
    5
}
fn default_rpc_max_queue() -> usize {
    1024
}

impl ConsensusComponentConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            election_timeout_ms: None,
            heartbeat_interval_ms: None,
            max_snapshots: None,
            rpc_max_queue: None,
            save: default_watch(),
        }
    }

    /// Effective election timeout: the document's value, or the default.
    pub fn election_timeout_ms(&self) -> u64 {
        self.election_timeout_ms.unwrap_or_else(default_election_timeout_ms)
    }

    /// Effective heartbeat interval: the document's value, or the default.
    pub fn heartbeat_interval_ms(&self) -> u64 {
        self.heartbeat_interval_ms.unwrap_or_else(default_heartbeat_interval_ms)
    }

    /// Effective snapshot retention: the document's value, or the default.
    pub fn max_snapshots(&self) -> u32 {
        self.max_snapshots.unwrap_or_else(default_max_snapshots)
    }

    /// Effective RPC queue depth: the document's value, or the default.
    pub fn rpc_max_queue(&self) -> usize {
        self.rpc_max_queue.unwrap_or_else(default_rpc_max_queue)
    }
}

impl ComponentConfig for ConsensusComponentConfig {
    fn section_type(&self) -> &'static str {
        "consensus"
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn load_from_json(&mut self, value: &serde_json::Value) -> Result<(), String> {
        let parsed: PartialConsensusConfig =
            serde_json::from_value(value.clone()).map_err(|e| e.to_string())?;
        if parsed.election_timeout_ms.is_some() {
            self.election_timeout_ms = parsed.election_timeout_ms;
        }
        if parsed.heartbeat_interval_ms.is_some() {
            self.heartbeat_interval_ms = parsed.heartbeat_interval_ms;
        }
        if parsed.max_snapshots.is_some() {
            self.max_snapshots = parsed.max_snapshots;
        }
        if parsed.rpc_max_queue.is_some() {
            self.rpc_max_queue = parsed.rpc_max_queue;
        }
        let _ = self.save.0.send(self.save.1.borrow().wrapping_add(1));
        Ok(())
    }

    fn to_json(&self) -> serde_json::Value {
        let mut fields = serde_json::Map::new();
        if let Some(v) = self.election_timeout_ms {
            fields.insert("election_timeout_ms".to_string(), v.into());
        }
        if let Some(v) = self.heartbeat_interval_ms {
            fields.insert("heartbeat_interval_ms".to_string(), v.into());
        }
        if let Some(v) = self.max_snapshots {
            fields.insert("max_snapshots".to_string(), v.into());
        }
        if let Some(v) = self.rpc_max_queue {
            fields.insert("rpc_max_queue".to_string(), v.into());
        }
        serde_json::Value::Object(fields)
    }

    fn validate(&self) -> Result<(), String> {
        let heartbeat_interval_ms = self.heartbeat_interval_ms();
        let election_timeout_ms = self.election_timeout_ms();
        if heartbeat_interval_ms >= election_timeout_ms {
            return Err(format!(
                "heartbeat_interval_ms ({heartbeat_interval_ms}) must be less than election_timeout_ms ({election_timeout_ms})"
            ));
        }
        if self.max_snapshots() == 0 {
            return Err("max_snapshots must be at least 1".to_string());
        }
        Ok(())
    }

    fn save_signal(&self) -> watch::Receiver<u64> {
        self.save.1.clone()
    }
}

#[derive(Debug, Default, Deserialize)]
struct PartialConsensusConfig {
    election_timeout_ms: Option<u64>,
    heartbeat_interval_ms: Option<u64>,
    max_snapshots: Option<u32>,
    rpc_max_queue: Option<usize>,
}

/// Configuration for one named `State` implementation (section `"state"`).
#[derive(Debug, Clone)]
pub struct StateComponentConfig {
    name: String,
    pub kind: String,
    base_dir: PathBuf,
    save: (watch::Sender<u64>, watch::Receiver<u64>),
}

impl StateComponentConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: "in_memory".to_string(),
            base_dir: PathBuf::new(),
            save: default_watch(),
        }
    }
}

impl ComponentConfig for StateComponentConfig {
    fn section_type(&self) -> &'static str {
        "state"
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn load_from_json(&mut self, value: &serde_json::Value) -> Result<(), String> {
        if let Some(kind) = value.get("kind").and_then(|v| v.as_str()) {
            self.kind = kind.to_string();
        }
        Ok(())
    }

    fn to_json(&self) -> serde_json::Value {
        serde_json::json!({ "kind": self.kind })
    }

    fn validate(&self) -> Result<(), String> {
        match self.kind.as_str() {
            "in_memory" => Ok(()),
            other => Err(format!("unknown state kind: {other}")),
        }
    }

    fn set_base_dir(&mut self, dir: &Path) {
        self.base_dir = dir.to_path_buf();
    }

    fn save_signal(&self) -> watch::Receiver<u64> {
        self.save.1.clone()
    }
}
