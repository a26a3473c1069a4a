use crate::component::{ComponentConfig, OpaqueComponentConfig};
use crate::error::ConfigError;
use crate::schema::{ClusterConfig, RawDocument, Section};
use parking_lot::RwLock;
use peerpin_telemetry::Logger;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

type ComponentKey = (String, String);

struct Document {
    /// `Some(url)` when the document was loaded via a `source` redirect;
    /// in that case `Save` writes back only `{"source": url}`.
    source: Option<String>,
    cluster: ClusterConfig,
}

/// Loads, validates, persists, and debounces the save path for a
/// structured JSON configuration document.
///
/// The Manager owns the parsed document exclusively; individual component
/// configurations are owned by their registering caller through the
/// `Box<dyn ComponentConfig>` handed to [`ConfigManager::register_component`],
/// with lifetime bounded by the Manager's own.
pub struct ConfigManager {
    document: RwLock<Document>,
    components: RwLock<BTreeMap<ComponentKey, Box<dyn ComponentConfig>>>,
    loaded_from_json: RwLock<HashSet<ComponentKey>>,
    base_dir: RwLock<PathBuf>,
    logger: Logger,
    http: reqwest::Client,
}

impl ConfigManager {
    /// A manager with no components registered yet, rooted at `base_dir`
    /// (paths in the document resolve relative to it until a load
    /// supplies a different directory).
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        let http = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .expect("reqwest client with no-redirect policy always builds");

        ConfigManager {
            document: RwLock::new(Document { source: None, cluster: ClusterConfig::default() }),
            components: RwLock::new(BTreeMap::new()),
            loaded_from_json: RwLock::new(HashSet::new()),
            base_dir: RwLock::new(base_dir.into()),
            logger: Logger::for_component("config_manager"),
            http,
        }
    }

    /// Register a component's configuration before loading. Keyed by
    /// `(section_type, name)`: registering the same key twice is an error
    /// rather than a silent replacement of the prior registration.
    pub fn register_component(&self, mut component: Box<dyn ComponentConfig>) -> Result<(), ConfigError> {
        let key = (component.section_type().to_string(), component.name().to_string());
        let mut components = self.components.write();
        if components.contains_key(&key) {
            return Err(ConfigError::AlreadyRegistered { section: key.0, name: key.1 });
        }
        component.set_base_dir(&self.base_dir.read().clone());
        components.insert(key, component);
        Ok(())
    }

    /// Load the document from `path`, resolving relative paths in
    /// registered components against its parent directory.
    pub async fn load_from_file(&self, path: &Path) -> Result<(), ConfigError> {
        let bytes = tokio::fs::read(path).await?;
        if let Some(dir) = path.parent() {
            *self.base_dir.write() = dir.to_path_buf();
            for component in self.components.write().values_mut() {
                component.set_base_dir(dir);
            }
        }
        self.load_from_bytes(&bytes).await
    }

    /// Load the document by fetching `url` directly (as opposed to a
    /// document that merely *points at* a `source`).
    pub async fn load_from_url(&self, url: &str) -> Result<(), ConfigError> {
        let bytes = self.fetch(url).await?;
        self.load_from_bytes(&bytes).await
    }

    /// Load the document from already-read bytes. If the document has a
    /// non-empty `source`, fetches that URL once and uses its body
    /// instead; a second-level `source` in the fetched body fails with
    /// [`ConfigError::SourceRedirect`].
    pub async fn load_from_bytes(&self, bytes: &[u8]) -> Result<(), ConfigError> {
        let first: RawDocument = serde_json::from_slice(bytes)?;

        let (raw, used_source) = if first.has_source() {
            let url = first.source.clone().expect("has_source implies Some");
            let fetched = self.fetch(&url).await?;
            let second: RawDocument = serde_json::from_slice(&fetched)?;
            if second.has_source() {
                return Err(ConfigError::SourceRedirect);
            }
            (second, Some(url))
        } else {
            (first, None)
        };

        self.populate(raw, used_source);
        Ok(())
    }

    async fn fetch(&self, url: &str) -> Result<Vec<u8>, ConfigError> {
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| ConfigError::FetchingSource { url: url.to_string(), reason: e.to_string() })?;

        if !response.status().is_success() {
            return Err(ConfigError::FetchingSource {
                url: url.to_string(),
                reason: format!("status {}", response.status()),
            });
        }

        response
            .bytes()
            .await
            .map(|b| b.to_vec())
            .map_err(|e| ConfigError::FetchingSource { url: url.to_string(), reason: e.to_string() })
    }

    fn populate(&self, raw: RawDocument, used_source: Option<String>) {
        {
            let mut document = self.document.write();
            document.source = used_source;
            document.cluster = serde_json::from_value(raw.cluster).unwrap_or_default();
        }

        let mut components = self.components.write();
        let mut loaded = self.loaded_from_json.write();

        for (section_type, section) in raw.sections {
            for (name, blob) in section {
                let key = (section_type.clone(), name.clone());
                let component = components.entry(key.clone()).or_insert_with(|| {
                    // Unregistered component present in the document: keep it
                    // as an opaque passthrough so round-tripping stays lossless
                    // for sections this core does not interpret.
                    Box::new(OpaqueComponentConfig::new(section_type.clone(), name.clone()))
                });
                if let Err(reason) = component.load_from_json(&blob) {
                    warn!(section = %key.0, name = %key.1, reason, "component rejected its JSON blob, keeping prior value");
                    continue;
                }
                loaded.insert(key);
            }
        }
    }

    /// Overlay each registered component's recognized environment
    /// variables. Name and precedence are component-local.
    pub fn apply_env_vars(&self) {
        for component in self.components.write().values_mut() {
            component.apply_env_vars();
        }
    }

    /// Require a cluster section and a passing `Validate()` from every
    /// registered component.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.document
            .read()
            .cluster
            .validate()
            .map_err(|reason| ConfigError::ValidationFailed {
                section: "cluster".to_string(),
                name: String::new(),
                reason,
            })?;

        for ((section, name), component) in self.components.read().iter() {
            component.validate().map_err(|reason| ConfigError::ValidationFailed {
                section: section.clone(),
                name: name.clone(),
                reason,
            })?;
        }
        Ok(())
    }

    /// Whether `(section, name)` was populated from the loaded document,
    /// as opposed to left at its registered default.
    pub fn is_loaded_from_json(&self, section: &str, name: &str) -> bool {
        self.loaded_from_json
            .read()
            .contains(&(section.to_string(), name.to_string()))
    }

    fn build_json(&self, redact: bool) -> serde_json::Value {
        let document = self.document.read();
        let mut sections: BTreeMap<String, Section> = BTreeMap::new();
        for ((section, name), component) in self.components.read().iter() {
            let blob = if redact { component.to_display_json() } else { component.to_json() };
            sections.entry(section.clone()).or_default().insert(name.clone(), blob);
        }

        let cluster = if redact { document.cluster.to_display_json() } else { serde_json::to_value(&document.cluster).unwrap_or_default() };

        let mut root = serde_json::Map::new();
        root.insert("cluster".to_string(), cluster);
        for (section, blobs) in sections {
            root.insert(section, serde_json::to_value(blobs).unwrap_or_default());
        }
        serde_json::Value::Object(root)
    }

    /// Serialize the document the way it would be written to disk, with
    /// every component's hidden fields redacted (`ToDisplayJSON`). Unlike
    /// `Save`, this always expands a `source` document into its fetched
    /// contents, since the display surface is meant for operators, not
    /// for round-tripping.
    pub fn to_display_json(&self) -> serde_json::Value {
        self.build_json(true)
    }

    /// Persist the document to `path` (defaulting to the path it was
    /// loaded from, if any). Mode `0600`; written atomically via a
    /// same-directory temp file and rename. When the document was loaded
    /// via a `source`, only `{"source": url}` is written back.
    pub async fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let body = {
            let document = self.document.read();
            match &document.source {
                Some(url) => serde_json::json!({ "source": url }),
                None => self.build_json(false),
            }
        };
        let serialized = serde_json::to_vec_pretty(&body)?;

        let tmp_path = path.with_extension("tmp");
        tokio::fs::write(&tmp_path, &serialized).await?;
        set_owner_only_permissions(&tmp_path).await?;
        tokio::fs::rename(&tmp_path, path).await?;

        info!(path = %path.display(), "configuration saved");
        Ok(())
    }

    /// Fan in every registered component's save-signal channel and
    /// persist on a debounced ticker: a burst of signals within one
    /// interval collapses to a single write. Returns the task handle;
    /// drop or abort it to stop.
    pub fn spawn_save_loop(self: &Arc<Self>, path: PathBuf, interval: Duration) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            let mut last_seen: BTreeMap<ComponentKey, u64> = BTreeMap::new();

            loop {
                ticker.tick().await;

                let mut dirty = false;
                let signals: Vec<(ComponentKey, tokio::sync::watch::Receiver<u64>)> = manager
                    .components
                    .read()
                    .iter()
                    .map(|(key, component)| (key.clone(), component.save_signal()))
                    .collect();

                for (key, rx) in signals {
                    let current = *rx.borrow();
                    if last_seen.get(&key) != Some(&current) {
                        last_seen.insert(key, current);
                        dirty = true;
                    }
                }

                if dirty {
                    if let Err(e) = manager.save(&path).await {
                        error!(error = %e, "debounced configuration save failed, will retry next tick");
                    }
                }
            }
        })
    }

    pub fn logger(&self) -> &Logger {
        &self.logger
    }
}

#[cfg(unix)]
async fn set_owner_only_permissions(path: &Path) -> Result<(), ConfigError> {
    use std::os::unix::fs::PermissionsExt;
    let perms = std::fs::Permissions::from_mode(0o600);
    tokio::fs::set_permissions(path, perms).await?;
    Ok(())
}

#[cfg(not(unix))]
async fn set_owner_only_permissions(_path: &Path) -> Result<(), ConfigError> {
    Ok(())
}
