//! Replicated-log consensus engine for peerpin cluster peers.
//!
//! One [`ConsensusEngine`] runs per cluster peer. It drives a leader-based,
//! Raft-family election/replication loop over the [`transport::Transport`]
//! trait, persists an ordered [`log::LogEntry`] sequence behind the
//! [`log::LogStore`] trait, and is the sole mutator of the local
//! [`peerpin_state::PinStore`] — it applies each committed entry via
//! [`peerpin_state::apply`] and never lets State change any other way.
//!
//! Submissions on a follower are forwarded to the leader; with no leader
//! known, `commit` fails with [`error::ConsensusError::NoLeader`] and the
//! caller may retry with backoff. A one-node cluster
//! ([`config::ConsensusConfig::single_node`]) commits immediately without
//! waiting on a quorum, for bootstrap and tests.

#![warn(missing_docs)]

mod config;
mod engine;
mod error;
mod log;
mod transport;

pub use config::ConsensusConfig;
pub use engine::{ConsensusEngine, EngineEvent, EngineHandle, Role};
pub use error::{ConsensusError, Result};
pub use log::{InMemoryLogStore, LogEntry, LogStore};
pub use transport::{
    in_process_cluster, AppendEntriesArgs, AppendEntriesReply, InProcessNetwork, InProcessTransport, InboundRpc,
    PeerId, ProposeArgs, ProposeReply, RequestVoteArgs, RequestVoteReply, Transport, TransportError,
};

#[cfg(test)]
mod tests {
    use super::*;
    use peerpin_cid::Cid;
    use peerpin_state::{InMemoryState, LogOperation};
    use std::sync::Arc;
    use std::time::Duration;
    use uuid::Uuid;

    fn pin(cid: Cid) -> LogOperation {
        LogOperation::Pin { cid, client_request_id: Uuid::new_v4() }
    }

    async fn spin_up_single_node() -> (Arc<ConsensusEngine>, EngineHandle, tokio::sync::mpsc::Receiver<EngineEvent>) {
        let id = PeerId::new("solo");
        let (_network, mut handles) = in_process_cluster(&[id.clone()]);
        let (transport, inbound) = handles.remove(&id).unwrap();
        let (events_tx, events_rx) = tokio::sync::mpsc::channel(64);

        let config = ConsensusConfig { single_node: true, ..ConsensusConfig::default() };
        let engine = ConsensusEngine::new(
            config,
            Arc::new(transport),
            Box::new(InMemoryLogStore::new()),
            Box::new(InMemoryState::new()),
            events_tx,
        );
        let handle = engine.spawn(inbound);
        (engine, handle, events_rx)
    }

    #[tokio::test]
    async fn single_node_commits_without_quorum() {
        let (engine, handle, mut events) = spin_up_single_node().await;

        let c = Cid::new(peerpin_cid::DEFAULT_CODEC, b"single-node-cid");
        engine.commit(pin(c.clone())).await.unwrap();

        assert!(engine.has(&c));
        assert_eq!(engine.leader(), Some(engine.local_id()));

        match tokio::time::timeout(Duration::from_millis(200), events.recv()).await {
            Ok(Some(EngineEvent::Effect(peerpin_state::Effect::Track(tracked)))) => assert_eq!(tracked, c),
            other => panic!("expected a Track effect, got {other:?}"),
        }

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn submission_without_a_leader_fails_with_no_leader() {
        let id = PeerId::new("lonely-follower");
        let (_network, mut handles) = in_process_cluster(&[id.clone()]);
        let (transport, inbound) = handles.remove(&id).unwrap();
        let (events_tx, _events_rx) = tokio::sync::mpsc::channel(64);

        let engine = ConsensusEngine::new(
            ConsensusConfig::default(),
            Arc::new(transport),
            Box::new(InMemoryLogStore::new()),
            Box::new(InMemoryState::new()),
            events_tx,
        );
        let handle = engine.spawn(inbound);

        let c = Cid::new(peerpin_cid::DEFAULT_CODEC, b"no-leader-cid");
        let result = engine.commit(pin(c)).await;
        assert!(matches!(result, Err(ConsensusError::NoLeader)));

        handle.shutdown().await;
    }

    /// A hard apply failure mid-commit routes through the rollback protocol:
    /// the caller sees `RollbackRequested` rather than a bare `Ok`, and State
    /// ends up restored to its pre-failure snapshot.
    #[tokio::test]
    async fn hard_apply_failure_triggers_rollback_and_is_surfaced_to_the_committer() {
        let id = PeerId::new("solo");
        let (_network, mut handles) = in_process_cluster(&[id.clone()]);
        let (transport, inbound) = handles.remove(&id).unwrap();
        let (events_tx, mut events_rx) = tokio::sync::mpsc::channel(64);

        let config = ConsensusConfig { single_node: true, ..ConsensusConfig::default() };
        // The second `add` fails: the first `Pin` below succeeds, the
        // second hits the simulated failure and triggers a rollback.
        let state: Box<dyn peerpin_state::PinStore> = Box::new(peerpin_state::test_support::FailingState::new(2));
        let engine = ConsensusEngine::new(config, Arc::new(transport), Box::new(InMemoryLogStore::new()), state, events_tx);
        let handle = engine.spawn(inbound);

        let first = Cid::new(peerpin_cid::DEFAULT_CODEC, b"rollback-first");
        let second = Cid::new(peerpin_cid::DEFAULT_CODEC, b"rollback-second");

        engine.commit(pin(first.clone())).await.unwrap();

        let result = engine.commit(pin(second)).await;
        assert!(matches!(result, Err(ConsensusError::RollbackRequested(_))), "got {result:?}");

        let saw_rollback_event = tokio::time::timeout(Duration::from_millis(200), async {
            loop {
                match events_rx.recv().await {
                    Some(EngineEvent::RollbackRequested { .. }) => return true,
                    Some(_) => continue,
                    None => return false,
                }
            }
        })
        .await
        .unwrap_or(false);
        assert!(saw_rollback_event);

        // Rollback restores the pre-failure snapshot, which already had
        // `first` pinned — the failed second pin never takes effect.
        assert!(engine.has(&first));

        handle.shutdown().await;
    }

    /// A fresh engine restored from a prior peer's snapshot and fed the
    /// remainder of that peer's log converges to the same State — the
    /// "replay after reboot" path. `Add`/`Unpin`'s idempotent and soft
    /// semantics make re-applying the already-snapshotted prefix safe.
    #[tokio::test]
    async fn state_restored_from_snapshot_converges_after_replaying_the_log() {
        let (engine, handle, _events) = spin_up_single_node().await;

        let a = Cid::new(peerpin_cid::DEFAULT_CODEC, b"reboot-a");
        let b = Cid::new(peerpin_cid::DEFAULT_CODEC, b"reboot-b");
        engine.commit(pin(a.clone())).await.unwrap();
        let snapshot = engine.get_log_head();
        engine.commit(pin(b.clone())).await.unwrap();
        handle.shutdown().await;

        // A second peer starts from `snapshot` (as if restored from disk on
        // boot) and is fed the same ops a follower would have replicated.
        let mut restored = InMemoryState::new();
        restored.restore(&snapshot).unwrap();
        assert!(restored.has(&a));
        assert!(!restored.has(&b));

        let id = PeerId::new("rebooted");
        let (_network, mut handles) = in_process_cluster(&[id.clone()]);
        let (transport, inbound) = handles.remove(&id).unwrap();
        let (events_tx, _events_rx) = tokio::sync::mpsc::channel(64);
        let config = ConsensusConfig { single_node: true, ..ConsensusConfig::default() };
        let rebooted = ConsensusEngine::new(
            config,
            Arc::new(transport),
            Box::new(InMemoryLogStore::new()),
            Box::new(restored),
            events_tx,
        );
        let rebooted_handle = rebooted.spawn(inbound);

        rebooted.commit(pin(a.clone())).await.unwrap();
        rebooted.commit(pin(b.clone())).await.unwrap();
        assert!(rebooted.has(&a));
        assert!(rebooted.has(&b));

        rebooted_handle.shutdown().await;
    }

    fn spawn_heartbeats(engines: &[Arc<ConsensusEngine>]) -> Vec<tokio::task::JoinHandle<()>> {
        engines
            .iter()
            .map(|engine| {
                let engine = Arc::clone(engine);
                tokio::spawn(async move {
                    let mut ticker = tokio::time::interval(Duration::from_millis(10));
                    loop {
                        ticker.tick().await;
                        engine.replicate_tick().await;
                    }
                })
            })
            .collect()
    }

    async fn wait_for_a_leader(engines: &[Arc<ConsensusEngine>]) -> PeerId {
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                for engine in engines {
                    if engine.role() == Role::Leader {
                        return engine.local_id();
                    }
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("a leader should emerge within the timeout")
    }

    /// Three peers elect a leader, commit through it, and — once that
    /// leader is partitioned away — elect a new one and keep committing.
    #[tokio::test]
    async fn three_peer_cluster_fails_over_to_a_new_leader() {
        let ids = vec![PeerId::new("n1"), PeerId::new("n2"), PeerId::new("n3")];
        let (network, mut handles) = in_process_cluster(&ids);

        let config = ConsensusConfig { election_timeout_ms: 40, heartbeat_interval_ms: 10, ..ConsensusConfig::default() };

        let mut engines = Vec::new();
        let mut engine_handles = Vec::new();
        for id in &ids {
            let (transport, inbound) = handles.remove(id).unwrap();
            let (events_tx, _events_rx) = tokio::sync::mpsc::channel(64);
            let engine = ConsensusEngine::new(
                config.clone(),
                Arc::new(transport),
                Box::new(InMemoryLogStore::new()),
                Box::new(InMemoryState::new()),
                events_tx,
            );
            engine_handles.push(engine.spawn(inbound));
            engines.push(engine);
        }
        let heartbeats = spawn_heartbeats(&engines);

        let first_leader = wait_for_a_leader(&engines).await;
        let leader_engine = engines.iter().find(|e| e.local_id() == first_leader).unwrap();

        let c = Cid::new(peerpin_cid::DEFAULT_CODEC, b"failover-cid");
        leader_engine.commit(pin(c.clone())).await.unwrap();
        assert!(engines.iter().all(|e| e.has(&c)));

        // Partition the leader away from the other two; it can no longer
        // hear heartbeat acks or win an election, so they time out and
        // elect a successor among themselves.
        for id in &ids {
            if *id != first_leader {
                network.cut(&first_leader, id);
            }
        }

        let second_leader = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                for engine in &engines {
                    if engine.local_id() != first_leader && engine.role() == Role::Leader {
                        return engine.local_id();
                    }
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("a successor leader should emerge after partition");
        assert_ne!(second_leader, first_leader);

        let successor = engines.iter().find(|e| e.local_id() == second_leader).unwrap();
        let d = Cid::new(peerpin_cid::DEFAULT_CODEC, b"post-failover-cid");
        successor.commit(pin(d.clone())).await.unwrap();
        assert!(engines
            .iter()
            .filter(|e| e.local_id() != first_leader)
            .all(|e| e.has(&d)));

        for heartbeat in heartbeats {
            heartbeat.abort();
        }
        for handle in engine_handles {
            handle.shutdown().await;
        }
    }

    /// The leader validates a `Rollback`'s snapshot before committing it:
    /// garbage bytes never reach the replicated log.
    #[tokio::test]
    async fn leader_rejects_a_rollback_with_an_unrestorable_snapshot() {
        let (engine, handle, _events) = spin_up_single_node().await;

        let result = engine.rollback(b"not a valid snapshot".to_vec()).await;
        assert!(matches!(result, Err(ConsensusError::RollbackRejected(_))), "got {result:?}");
        assert_eq!(engine.get_log_head(), InMemoryState::new().snapshot());

        handle.shutdown().await;
    }
}
