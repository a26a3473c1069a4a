use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A section is a mapping from component name to its opaque JSON blob.
pub type Section = BTreeMap<String, serde_json::Value>;

/// The known non-singular section types, in the order they appear in the
/// reference document shape. Downstream sections this core doesn't
/// interpret (`api`, `ipfs_connector`, `pin_tracker`, `monitor`,
/// `allocator`, `informer`, `observations`, `datastore`) are still parsed
/// and round-tripped losslessly as opaque blobs.
pub const SECTION_TYPES: &[&str] = &[
    "consensus",
    "api",
    "ipfs_connector",
    "state",
    "pin_tracker",
    "monitor",
    "allocator",
    "informer",
    "observations",
    "datastore",
];

/// The wire representation of the configuration document. Parsed once
/// on load; `source`'s presence and non-emptiness determines whether
/// the rest of the document is interpreted locally or replaced by a
/// remote fetch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawDocument {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default)]
    pub cluster: serde_json::Value,
    #[serde(default, flatten)]
    pub sections: BTreeMap<String, Section>,
}

impl RawDocument {
    /// Whether `source` is present and non-empty: when it is, it must be
    /// the only non-empty field.
    pub fn has_source(&self) -> bool {
        self.source.as_deref().is_some_and(|s| !s.is_empty())
    }
}

/// The cluster section. A top-level section that is special and
/// singular.
///
/// Fields a document leaves unset are skipped on serialization (not just
/// defaulted on load), so `Save(Load(doc)) == doc` holds for a document
/// that only sets a subset of these fields (testable property #4).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// This peer's stable identifier.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub peer_id: String,
    /// Listen multiaddrs for the peer-to-peer transport.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub listen_multiaddrs: Vec<String>,
    /// Shared cluster secret (hex-encoded), redacted in `ToDisplayJSON`.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub secret: String,
    /// Whether this peer bootstraps a single-node cluster. Defaults to
    /// multi-peer.
    #[serde(default, skip_serializing_if = "is_false")]
    pub single_node: bool,
}

fn is_false(b: &bool) -> bool {
    !*b
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            peer_id: String::new(),
            listen_multiaddrs: Vec::new(),
            secret: String::new(),
            single_node: false,
        }
    }
}

impl ClusterConfig {
    /// A copy with `secret` redacted for display purposes.
    pub fn to_display_json(&self) -> serde_json::Value {
        let mut value = serde_json::to_value(self).expect("ClusterConfig always serializes");
        if let Some(obj) = value.as_object_mut() {
            if !self.secret.is_empty() {
                obj.insert("secret".to_string(), serde_json::Value::String("<hidden>".to_string()));
            }
        }
        value
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.peer_id.is_empty() {
            return Err("cluster.peer_id must not be empty".to_string());
        }
        Ok(())
    }
}
