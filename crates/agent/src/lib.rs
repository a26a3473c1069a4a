//! The Agent Controller: wires the consensus engine, local pin state, and
//! outbound request channel into the public operations surface upper
//! layers (a REST API, a CLI) call into.
//!
//! This crate owns none of the transport, persistence, or tracking
//! concerns — those are supplied by the caller or left to collaborators
//! outside this core's scope. What it owns is bootstrap sequencing, the
//! catch-up heuristic, and the shutdown barrier.

mod controller;
mod error;
mod request;

pub use controller::{AgentController, BootstrapConfig, StateView, CATCH_UP_POLL_INTERVAL, FIRST_SYNC_DELAY, RPC_MAX_QUEUE};
pub use error::AgentError;
pub use request::Request;

#[cfg(test)]
mod tests {
    use super::*;
    use peerpin_consensus::{in_process_cluster, ConsensusConfig, PeerId};
    use peerpin_state::InMemoryState;
    use std::sync::Arc;
    use std::time::Duration;

    fn single_node_bootstrap() -> Arc<AgentController> {
        let id = PeerId::new("solo");
        let (_network, mut handles) = in_process_cluster(&[id.clone()]);
        let (transport, inbound) = handles.remove(&id).unwrap();

        let config = BootstrapConfig {
            consensus: ConsensusConfig { single_node: true, ..ConsensusConfig::default() },
            first_sync_delay: Duration::from_millis(50),
            catch_up_poll_interval: Duration::from_millis(10),
            ..BootstrapConfig::default()
        };

        AgentController::bootstrap(
            Arc::new(transport),
            inbound,
            Box::new(peerpin_consensus::InMemoryLogStore::new()),
            Box::new(InMemoryState::new()),
            config,
        )
    }

    #[tokio::test]
    async fn single_peer_pin_unpin_scenario() {
        let agent = single_node_bootstrap();
        let mut requests = agent.requests().expect("first caller gets the receiver");

        agent.pin("1234").await.unwrap();
        assert!(agent.state().contains(&peerpin_cid::Cid::decode("1234").unwrap()));

        agent.unpin("1234").await.unwrap();
        assert!(agent.state().is_empty());

        // Repeated unpin is a soft, idempotent no-op.
        agent.unpin("1234").await.unwrap();

        let mut tracked = 0;
        let mut untracked = 0;
        while let Ok(req) = tokio::time::timeout(Duration::from_millis(200), requests.recv()).await {
            match req {
                Some(Request::Track(_)) => tracked += 1,
                Some(Request::Untrack(_)) => untracked += 1,
                Some(Request::LocalSync) => {}
                _ => {}
            }
            if tracked >= 1 && untracked >= 1 {
                break;
            }
        }
        assert_eq!(tracked, 1);
        assert_eq!(untracked, 1);

        agent.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn requests_can_only_be_taken_once() {
        let agent = single_node_bootstrap();
        assert!(agent.requests().is_some());
        assert!(agent.requests().is_none());
        agent.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn catch_up_emits_local_sync_once_applied_equals_last() {
        let agent = single_node_bootstrap();
        let mut requests = agent.requests().unwrap();

        let saw_local_sync = tokio::time::timeout(Duration::from_millis(500), async {
            loop {
                if let Some(Request::LocalSync) = requests.recv().await {
                    return true;
                }
            }
        })
        .await
        .unwrap_or(false);

        assert!(saw_local_sync);
        agent.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_is_idempotent() {
        let agent = single_node_bootstrap();
        agent.shutdown().await.unwrap();
        agent.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn pin_rejects_undecodable_cid() {
        let agent = single_node_bootstrap();
        let result = agent.pin("not hex!!").await;
        assert!(matches!(result, Err(AgentError::NotDecodable(_))));
        agent.shutdown().await.unwrap();
    }
}
