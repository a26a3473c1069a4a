//! Pluggable JSON configuration document for a peerpin cluster peer.
//!
//! Loads and validates the structured document, offers each
//! sub-component a save-signal channel, and collapses bursts of save
//! requests via a periodic debounced writer.

mod component;
mod error;
mod manager;
mod schema;

pub use component::{ComponentConfig, ConsensusComponentConfig, OpaqueComponentConfig, StateComponentConfig};
pub use error::ConfigError;
pub use manager::ConfigManager;
pub use schema::{ClusterConfig, RawDocument, Section, SECTION_TYPES};

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn sample_doc() -> serde_json::Value {
        serde_json::json!({
            "cluster": { "peer_id": "12D3peer1", "single_node": true },
            "consensus": {
                "raft": { "election_timeout_ms": 300, "heartbeat_interval_ms": 100 }
            },
            "state": {
                "default": { "kind": "in_memory" }
            },
            "pin_tracker": {
                "maptracker": { "concurrency": 10 }
            }
        })
    }

    fn manager_with_defaults(dir: &std::path::Path) -> ConfigManager {
        let manager = ConfigManager::new(dir);
        manager
            .register_component(Box::new(ConsensusComponentConfig::new("raft")))
            .unwrap();
        manager
            .register_component(Box::new(StateComponentConfig::new("default")))
            .unwrap();
        manager
    }

    #[tokio::test]
    async fn load_overlays_registered_components_and_flags_loaded() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_with_defaults(dir.path());

        let bytes = serde_json::to_vec(&sample_doc()).unwrap();
        manager.load_from_bytes(&bytes).await.unwrap();

        assert!(manager.is_loaded_from_json("consensus", "raft"));
        assert!(manager.is_loaded_from_json("state", "default"));
        // Unregistered but present in the document: kept as opaque passthrough.
        assert!(manager.is_loaded_from_json("pin_tracker", "maptracker"));
        // Registered components absent from the document are not flagged.
        assert!(!manager.is_loaded_from_json("state", "never-registered"));

        manager.validate().unwrap();
    }

    #[tokio::test]
    async fn unregistered_component_round_trips_losslessly() {
        let dir = tempfile::tempdir().unwrap();
        let manager = ConfigManager::new(dir.path());
        let bytes = serde_json::to_vec(&sample_doc()).unwrap();
        manager.load_from_bytes(&bytes).await.unwrap();

        let display = manager.to_display_json();
        assert_eq!(display["pin_tracker"]["maptracker"]["concurrency"], 10);
    }

    /// Testable property #4: `Save(Load(doc)) == doc` modulo whitespace,
    /// for a doc that sets only a subset of each section's fields (as
    /// `sample_doc` deliberately does for `cluster` and `consensus.raft`)
    /// and does not use `source`. This checks equality against the
    /// original document, not just idempotency across repeated saves.
    #[tokio::test]
    async fn save_then_load_round_trips_to_the_original_doc() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_with_defaults(dir.path());
        let original = sample_doc();
        manager.load_from_bytes(&serde_json::to_vec(&original).unwrap()).await.unwrap();

        let path = dir.path().join("config.json");
        manager.save(&path).await.unwrap();

        let reloaded = manager_with_defaults(dir.path());
        reloaded.load_from_file(&path).await.unwrap();
        let after = reloaded.to_display_json();

        assert_eq!(after["cluster"], original["cluster"]);
        assert_eq!(after["consensus"], original["consensus"]);
        assert_eq!(after["state"], original["state"]);
        assert_eq!(after["pin_tracker"], original["pin_tracker"]);

        let perms = std::fs::metadata(&path).unwrap().permissions();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            assert_eq!(perms.mode() & 0o777, 0o600);
        }
        let _ = perms;
    }

    #[tokio::test]
    async fn validate_requires_cluster_peer_id() {
        let dir = tempfile::tempdir().unwrap();
        let manager = ConfigManager::new(dir.path());
        assert!(manager.validate().is_err());
    }

    #[tokio::test]
    async fn display_json_redacts_cluster_secret() {
        let dir = tempfile::tempdir().unwrap();
        let manager = ConfigManager::new(dir.path());
        let bytes = serde_json::to_vec(&serde_json::json!({
            "cluster": { "peer_id": "p1", "secret": "super-secret" }
        }))
        .unwrap();
        manager.load_from_bytes(&bytes).await.unwrap();

        let display = manager.to_display_json();
        assert_ne!(display["cluster"]["secret"], "super-secret");
    }

    #[tokio::test]
    async fn second_level_source_is_rejected() {
        let mut server = mockito_like_server().await;
        server.respond_with(serde_json::json!({ "source": "http://example.invalid/again" }));

        let dir = tempfile::tempdir().unwrap();
        let manager = ConfigManager::new(dir.path());
        let bytes = serde_json::to_vec(&serde_json::json!({ "source": server.url() })).unwrap();

        let result = manager.load_from_bytes(&bytes).await;
        assert!(matches!(result, Err(ConfigError::SourceRedirect)));
    }

    #[tokio::test]
    async fn debounced_save_collapses_a_burst_into_one_write() {
        let dir = tempfile::tempdir().unwrap();
        let manager = Arc::new(manager_with_defaults(dir.path()));
        let bytes = serde_json::to_vec(&sample_doc()).unwrap();
        manager.load_from_bytes(&bytes).await.unwrap();

        let path = dir.path().join("config.json");
        let handle = manager.spawn_save_loop(path.clone(), Duration::from_millis(50));

        // Burst of edits within a single debounce interval.
        for _ in 0..5 {
            manager
                .load_from_bytes(&serde_json::to_vec(&sample_doc()).unwrap())
                .await
                .unwrap();
        }

        tokio::time::sleep(Duration::from_millis(120)).await;
        handle.abort();

        assert!(path.exists());
    }

    /// A minimal in-process HTTP stand-in for the one `source`-fetch test
    /// above, so the suite does not depend on an external network
    /// service. Spawns a single-shot listener that serves exactly one
    /// response.
    async fn mockito_like_server() -> OneShotServer {
        OneShotServer::bind().await
    }

    struct OneShotServer {
        addr: std::net::SocketAddr,
        listener: Option<tokio::net::TcpListener>,
    }

    impl OneShotServer {
        async fn bind() -> Self {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            OneShotServer { addr, listener: Some(listener) }
        }

        fn url(&self) -> String {
            format!("http://{}/cfg.json", self.addr)
        }

        fn respond_with(&mut self, body: serde_json::Value) {
            let listener = self.listener.take().unwrap();
            tokio::spawn(async move {
                use tokio::io::{AsyncReadExt, AsyncWriteExt};
                if let Ok((mut socket, _)) = listener.accept().await {
                    let mut buf = [0u8; 1024];
                    let _ = socket.read(&mut buf).await;
                    let payload = serde_json::to_vec(&body).unwrap();
                    let response = format!(
                        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                        payload.len()
                    );
                    let _ = socket.write_all(response.as_bytes()).await;
                    let _ = socket.write_all(&payload).await;
                    let _ = socket.shutdown().await;
                }
            });
        }
    }
}
