//! Single-node commit latency: end-to-end `commit()` time with no network
//! round trip, i.e. the floor the multi-peer path can never beat.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use peerpin_cid::Cid;
use peerpin_consensus::{in_process_cluster, ConsensusConfig, ConsensusEngine, InMemoryLogStore, PeerId};
use peerpin_state::{InMemoryState, LogOperation};
use std::sync::Arc;
use uuid::Uuid;

fn bench_single_node_commit(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("single_node_commit", |b| {
        b.to_async(&rt).iter(|| async {
            let id = PeerId::new("bench-solo");
            let (_network, mut handles) = in_process_cluster(&[id.clone()]);
            let (transport, inbound) = handles.remove(&id).unwrap();
            let (events_tx, _events_rx) = tokio::sync::mpsc::channel(64);

            let config = ConsensusConfig { single_node: true, ..ConsensusConfig::default() };
            let engine = ConsensusEngine::new(
                config,
                Arc::new(transport),
                Box::new(InMemoryLogStore::new()),
                Box::new(InMemoryState::new()),
                events_tx,
            );
            let handle = engine.spawn(inbound);

            let op = LogOperation::Pin {
                cid: Cid::new(peerpin_cid::DEFAULT_CODEC, b"bench-cid"),
                client_request_id: Uuid::new_v4(),
            };
            let result = black_box(engine.commit(op).await);
            handle.shutdown().await;
            result.unwrap();
        });
    });
}

criterion_group!(benches, bench_single_node_commit);
criterion_main!(benches);
