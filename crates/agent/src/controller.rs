use crate::error::AgentError;
use crate::request::Request;
use parking_lot::Mutex;
use peerpin_cid::Cid;
use peerpin_consensus::{
    ConsensusConfig, ConsensusEngine, EngineEvent, EngineHandle, InboundRpc, LogStore, PeerId, Transport,
};
use peerpin_state::{Effect, LogOperation, PinStore};
use peerpin_telemetry::Logger;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// `FirstSyncDelay`: if catch-up hasn't observed `AppliedIndex == LastIndex`
/// by this point, the Agent goes live anyway and asks the tracker to
/// reconcile against a possibly-partial State — availability over
/// completeness at start.
pub const FIRST_SYNC_DELAY: Duration = Duration::from_secs(10);
/// Catch-up poll interval for `(AppliedIndex, LastIndex)`.
pub const CATCH_UP_POLL_INTERVAL: Duration = Duration::from_millis(500);
/// Default bound on the outbound request channel.
pub const RPC_MAX_QUEUE: usize = 1024;

/// Everything [`AgentController::bootstrap`] needs beyond the transport and
/// storage handles, which are constructed by the caller (peer-to-peer
/// transport wiring and log/state persistence choices are out of this
/// core's scope).
#[derive(Clone, Debug)]
pub struct BootstrapConfig {
    pub consensus: ConsensusConfig,
    /// Bytes from the last retained snapshot, restored into `State` before
    /// consensus starts (bootstrap step 2). `None` on a fresh peer.
    pub initial_snapshot: Option<Vec<u8>>,
    pub first_sync_delay: Duration,
    pub catch_up_poll_interval: Duration,
    pub rpc_max_queue: usize,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            consensus: ConsensusConfig::default(),
            initial_snapshot: None,
            first_sync_delay: FIRST_SYNC_DELAY,
            catch_up_poll_interval: CATCH_UP_POLL_INTERVAL,
            rpc_max_queue: RPC_MAX_QUEUE,
        }
    }
}

/// A read-only view of the locally applied pin set, returned by
/// [`AgentController::state`]. A shallow snapshot: a `List()` taken at one
/// point in time, not a live handle onto the engine's State.
#[derive(Debug, Clone, Default)]
pub struct StateView {
    cids: Vec<Cid>,
}

impl StateView {
    pub fn list(&self) -> &[Cid] {
        &self.cids
    }

    pub fn contains(&self, cid: &Cid) -> bool {
        self.cids.iter().any(|c| c == cid)
    }

    pub fn len(&self) -> usize {
        self.cids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cids.is_empty()
    }
}

struct Tasks {
    engine: EngineHandle,
    bridge: JoinHandle<()>,
    catch_up: JoinHandle<()>,
    heartbeat: JoinHandle<()>,
}

/// Wires the consensus engine, state, and outbound request channel for one
/// cluster peer; the public operations surface upper layers (an API
/// server, a CLI) call into.
///
/// `Pin`/`Unpin`/`State`/`Leader` forward to the engine. `Requests` hands
/// out the outbound channel's receiving half exactly once — the tracker
/// and any other consumer share one stream, not one each. `Shutdown` runs
/// a drain-and-stop barrier and is safe to call more than once.
pub struct AgentController {
    engine: Arc<ConsensusEngine>,
    requests_tx: mpsc::Sender<Request>,
    requests_rx: Mutex<Option<mpsc::Receiver<Request>>>,
    tasks: Mutex<Option<Tasks>>,
    shutdown: watch::Sender<bool>,
    logger: Logger,
}

impl AgentController {
    /// Bootstrap sequence: (1) the caller has already built `transport`;
    /// (2) `initial_snapshot` (if any) is restored into `state` before the
    /// engine ever sees it; (3) the engine's election/replication loop is
    /// spawned; (4) a catch-up task polls `(AppliedIndex, LastIndex)` every
    /// `catch_up_poll_interval` and emits [`Request::LocalSync`] once they
    /// match or `first_sync_delay` elapses, whichever comes first.
    pub fn bootstrap(
        transport: Arc<dyn Transport>,
        inbound: mpsc::Receiver<InboundRpc>,
        log_store: Box<dyn LogStore>,
        mut state: Box<dyn PinStore>,
        config: BootstrapConfig,
    ) -> Arc<Self> {
        let logger = Logger::new("agent", transport.local_id().to_string());

        if let Some(bytes) = &config.initial_snapshot {
            if let Err(e) = state.restore(bytes) {
                logger.in_scope(|| tracing::warn!(error = %e, "failed to restore initial snapshot, starting empty"));
            }
        }

        let (requests_tx, requests_rx) = mpsc::channel(config.rpc_max_queue);
        let (engine_events_tx, engine_events_rx) = mpsc::channel(config.rpc_max_queue);

        let engine = ConsensusEngine::new(config.consensus.clone(), transport, log_store, state, engine_events_tx);
        let engine_handle = engine.spawn(inbound);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let bridge = tokio::spawn(bridge_loop(
            Arc::clone(&engine),
            engine_events_rx,
            requests_tx.clone(),
            shutdown_rx.clone(),
        ));
        let catch_up = tokio::spawn(catch_up_loop(
            Arc::clone(&engine),
            requests_tx.clone(),
            config.first_sync_delay,
            config.catch_up_poll_interval,
            shutdown_rx.clone(),
        ));
        let heartbeat = tokio::spawn(heartbeat_loop(
            Arc::clone(&engine),
            config.consensus.heartbeat_interval_ms,
            shutdown_rx.clone(),
        ));

        Arc::new(AgentController {
            engine,
            requests_tx,
            requests_rx: Mutex::new(Some(requests_rx)),
            tasks: Mutex::new(Some(Tasks { engine: engine_handle, bridge, catch_up, heartbeat })),
            shutdown: shutdown_tx,
            logger,
        })
    }

    /// `Pin(cid) -> ok|error`.
    pub async fn pin(&self, cid: &str) -> Result<(), AgentError> {
        let cid = Cid::decode(cid)?;
        self.engine
            .commit(LogOperation::Pin { cid, client_request_id: Uuid::new_v4() })
            .await?;
        Ok(())
    }

    /// `Unpin(cid) -> ok|error`.
    pub async fn unpin(&self, cid: &str) -> Result<(), AgentError> {
        let cid = Cid::decode(cid)?;
        self.engine
            .commit(LogOperation::Unpin { cid, client_request_id: Uuid::new_v4() })
            .await?;
        Ok(())
    }

    /// `State() -> state-snapshot`.
    pub fn state(&self) -> StateView {
        StateView { cids: self.engine.list() }
    }

    /// `Leader() -> peer-id`.
    pub fn leader(&self) -> Option<PeerId> {
        self.engine.leader()
    }

    /// `Requests() -> channel<Request>`: takes the receiving half of the
    /// outbound channel. Returns `None` on every call after the first —
    /// there is exactly one consumer side to hand out.
    pub fn requests(&self) -> Option<mpsc::Receiver<Request>> {
        self.requests_rx.lock().take()
    }

    /// Shutdown barrier: cancel submission, take a final snapshot, stop
    /// consensus, and wait for every background task to drain. Idempotent
    /// — a second call observes the tasks already taken and returns
    /// immediately.
    pub async fn shutdown(&self) -> Result<(), AgentError> {
        let _ = self.shutdown.send(true);

        let tasks = self.tasks.lock().take();
        let Some(tasks) = tasks else {
            return Ok(());
        };

        // Final snapshot: the engine already retains one from its last
        // apply, so this is a best-effort re-read rather than a fallible
        // disk write; "nothing new" (no entries applied since the last
        // retained snapshot) is not an error here.
        let _ = self.engine.get_log_head();

        tasks.engine.shutdown().await;
        let _ = tasks.bridge.await;
        let _ = tasks.catch_up.await;
        let _ = tasks.heartbeat.await;

        self.logger.in_scope(|| tracing::info!("agent shutdown complete"));
        Ok(())
    }
}

async fn bridge_loop(
    engine: Arc<ConsensusEngine>,
    mut engine_events: mpsc::Receiver<EngineEvent>,
    requests_tx: mpsc::Sender<Request>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    return;
                }
            }
            maybe_event = engine_events.recv() => {
                match maybe_event {
                    Some(EngineEvent::Effect(Effect::Track(cid))) => {
                        let _ = requests_tx.try_send(Request::Track(cid));
                    }
                    Some(EngineEvent::Effect(Effect::Untrack(cid))) => {
                        let _ = requests_tx.try_send(Request::Untrack(cid));
                    }
                    Some(EngineEvent::Effect(Effect::None)) => {}
                    Some(EngineEvent::RollbackRequested { .. }) => {
                        let snapshot = engine.get_log_head();
                        let _ = requests_tx.try_send(Request::Rollback { snapshot }.to_leader());
                    }
                    Some(EngineEvent::LeaderChanged(_)) => {}
                    None => return,
                }
            }
        }
    }
}

async fn catch_up_loop(
    engine: Arc<ConsensusEngine>,
    requests_tx: mpsc::Sender<Request>,
    first_sync_delay: Duration,
    poll_interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let deadline = tokio::time::Instant::now() + first_sync_delay;
    loop {
        let (applied, last) = engine.progress();
        if applied >= last || tokio::time::Instant::now() >= deadline {
            let _ = requests_tx.try_send(Request::LocalSync);
            return;
        }

        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    return;
                }
            }
            _ = tokio::time::sleep(poll_interval) => {}
        }
    }
}

async fn heartbeat_loop(engine: Arc<ConsensusEngine>, interval_ms: u64, mut shutdown_rx: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms.max(1)));
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    return;
                }
            }
            _ = ticker.tick() => {
                engine.replicate_tick().await;
            }
        }
    }
}
