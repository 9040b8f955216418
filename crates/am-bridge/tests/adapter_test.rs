use std::sync::Arc;
use std::time::Duration;

use am_bridge::adapter::{AttachedViewer, ConnectRequest, PumpSettings, SharedRegistry, TransportAdapter};
use am_bridge::connection::{Outbound, ViewerConnection};
use am_bridge::flow_control::PauseState;
use am_bridge::protocol::ServerMessage;
use am_core::config::AgentsConfig;
use am_core::types::{AgentKind, WorkKey};
use am_session::launch::ConfigLaunchResolver;
use am_session::pty::{ProcessSpawner, SpawnRequest, TerminalProcess};
use am_session::registry::SessionRegistry;
use am_session::scrollback::{Dimensions, ScrollbackSerializer, SharedTerminal, Snapshot};
use am_session::snapshot_store::{MemorySnapshotStore, SnapshotStore};
use am_session::testing::{ScriptedProcess, ScriptedSpawner};
use chrono::Utc;
use tokio::sync::Mutex;
use tokio::time::Instant;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

struct Harness {
    adapter: TransportAdapter,
    registry: SharedRegistry,
    spawner: Arc<ScriptedSpawner>,
}

fn harness() -> Harness {
    let spawner = Arc::new(ScriptedSpawner::new());
    harness_with(SessionRegistry::new(spawner.clone()), spawner)
}

fn harness_with(registry: SessionRegistry<ViewerConnection>, spawner: Arc<ScriptedSpawner>) -> Harness {
    let registry: SharedRegistry = Arc::new(Mutex::new(registry));
    let resolver = Arc::new(ConfigLaunchResolver::new("/tmp", AgentsConfig::default()));
    let adapter = TransportAdapter::new(registry.clone(), resolver, PumpSettings::default());
    Harness {
        adapter,
        registry,
        spawner,
    }
}

fn request(work_key: &str) -> ConnectRequest {
    ConnectRequest {
        work_key: WorkKey::new(work_key).unwrap(),
        agent_kind: AgentKind::Claude,
        cols: 80,
        rows: 24,
    }
}

async fn connect(h: &Harness, work_key: &str) -> (AttachedViewer, flume::Receiver<Outbound>) {
    let (conn, rx) = ViewerConnection::new();
    let viewer = h.adapter.connect(request(work_key), conn).await.unwrap();
    (viewer, rx)
}

async fn next(rx: &flume::Receiver<Outbound>) -> Outbound {
    tokio::time::timeout(Duration::from_secs(60), rx.recv_async())
        .await
        .expect("timed out waiting for outbound item")
        .expect("outbound channel closed")
}

fn process(h: &Harness) -> Arc<ScriptedProcess> {
    h.spawner.last().expect("a process was spawned")
}

// ---------------------------------------------------------------------------
// Connect / handshake
// ---------------------------------------------------------------------------

#[tokio::test]
async fn first_connect_spawns_and_handshakes() {
    let h = harness();
    let (viewer, rx) = connect(&h, "feat").await;

    match next(&rx).await {
        Outbound::Control(ServerMessage::Session { id, name, takeover }) => {
            assert_eq!(id, viewer.session_id());
            assert_eq!(name, "feat [claude]");
            assert!(!takeover);
        }
        other => panic!("expected handshake, got {other:?}"),
    }
    assert_eq!(h.spawner.spawn_count(), 1);
    let (req, cwd) = &h.spawner.requests()[0];
    assert_eq!(req.command, "claude");
    assert_eq!((req.cols, req.rows), (80, 24));
    assert_eq!(cwd, &std::path::PathBuf::from("/tmp"));
}

/// Records whether the registry lock was free while a process was forked.
struct LockCheckingSpawner {
    inner: ScriptedSpawner,
    registry: std::sync::OnceLock<SharedRegistry>,
    lock_free: std::sync::Mutex<Vec<bool>>,
}

impl ProcessSpawner for LockCheckingSpawner {
    fn spawn(
        &self,
        request: &SpawnRequest,
        working_directory: &std::path::Path,
        mirror: Option<SharedTerminal>,
    ) -> am_session::pty::Result<Arc<dyn TerminalProcess>> {
        let free = self
            .registry
            .get()
            .is_some_and(|registry| registry.try_lock().is_ok());
        self.lock_free.lock().unwrap().push(free);
        self.inner.spawn(request, working_directory, mirror)
    }
}

#[tokio::test]
async fn spawn_runs_without_registry_lock() {
    let spawner = Arc::new(LockCheckingSpawner {
        inner: ScriptedSpawner::new(),
        registry: std::sync::OnceLock::new(),
        lock_free: std::sync::Mutex::new(Vec::new()),
    });
    let registry: SharedRegistry = Arc::new(Mutex::new(SessionRegistry::new(spawner.clone())));
    spawner.registry.set(registry.clone()).ok();
    let resolver = Arc::new(ConfigLaunchResolver::new("/tmp", AgentsConfig::default()));
    let adapter = TransportAdapter::new(registry.clone(), resolver, PumpSettings::default());

    let (conn, rx) = ViewerConnection::new();
    let viewer = adapter.connect(request("feat"), conn).await.unwrap();
    assert!(matches!(
        next(&rx).await,
        Outbound::Control(ServerMessage::Session { .. })
    ));
    assert_eq!(*spawner.lock_free.lock().unwrap(), vec![true]);

    let registry = registry.lock().await;
    assert!(registry.process(viewer.session_id()).unwrap().is_some());
    assert!(registry.is_active_viewer(viewer.session_id(), viewer.connection().id()));
}

#[tokio::test]
async fn spawn_failure_leaves_session_detached() {
    let h = harness();
    h.spawner.fail_spawns(true);
    let (conn, _rx) = ViewerConnection::new();
    assert!(h.adapter.connect(request("feat"), conn).await.is_err());

    let registry = h.registry.lock().await;
    let id = registry.find(&WorkKey::new("feat").unwrap(), AgentKind::Claude).unwrap();
    assert!(!registry.get(id).unwrap().viewer().connected);
}

// ---------------------------------------------------------------------------
// Batching
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn small_chunks_merge_within_window() {
    let h = harness();
    let (_viewer, rx) = connect(&h, "feat").await;
    next(&rx).await; // handshake
    let p = process(&h);

    p.emit(&[b'a'; 10]);
    p.emit(&[b'b'; 20]);
    p.emit(&[b'c'; 5]);

    match next(&rx).await {
        Outbound::Data(data) => {
            assert_eq!(data.len(), 35);
            assert!(data.starts_with(&[b'a'; 10]));
            assert!(data.ends_with(&[b'c'; 5]));
        }
        other => panic!("expected one merged batch, got {other:?}"),
    }

    // A large chunk goes out without waiting for a batch window.
    p.emit(&[b'x'; 1000]);
    let item = tokio::time::timeout(Duration::from_millis(1), rx.recv_async())
        .await
        .expect("large chunk should be sent immediately")
        .unwrap();
    assert_eq!(item, Outbound::Data(vec![b'x'; 1000]));
}

#[tokio::test(start_paused = true)]
async fn large_chunk_flushes_pending_batch_first() {
    let h = harness();
    let (_viewer, rx) = connect(&h, "feat").await;
    next(&rx).await;
    let p = process(&h);

    p.emit(&[b'a'; 10]);
    p.emit(&[b'b'; 20]);
    p.emit(&[b'c'; 5]);
    p.emit(&[b'x'; 1000]);

    assert!(matches!(next(&rx).await, Outbound::Data(d) if d.len() == 35));
    assert!(matches!(next(&rx).await, Outbound::Data(d) if d.len() == 1000));
}

// ---------------------------------------------------------------------------
// Backpressure
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn backpressure_resumes_after_timeout() {
    let h = harness();
    let (_viewer, rx) = connect(&h, "feat").await;
    next(&rx).await;
    let p = process(&h);
    let start = Instant::now();

    // Nobody drains the queue, so the backlog stays above the high-water mark.
    p.emit(&vec![b'z'; 1_100_000]);

    assert!(matches!(next(&rx).await, Outbound::Data(d) if d.len() == 1_100_000));
    assert_eq!(
        next(&rx).await,
        Outbound::Control(ServerMessage::Status { paused: true })
    );
    assert!(p.is_paused());

    assert_eq!(
        next(&rx).await,
        Outbound::Control(ServerMessage::Status { paused: false })
    );
    assert!(start.elapsed() >= Duration::from_secs(30));
    assert!(!p.is_paused());
    assert_eq!(p.pause_calls(), 1);
    assert_eq!(p.resume_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn backpressure_resumes_on_drain() {
    let h = harness();
    let (viewer, rx) = connect(&h, "feat").await;
    next(&rx).await;
    let p = process(&h);
    let start = Instant::now();

    p.emit(&vec![b'z'; 1_100_000]);
    assert!(matches!(next(&rx).await, Outbound::Data(_)));
    assert_eq!(
        next(&rx).await,
        Outbound::Control(ServerMessage::Status { paused: true })
    );

    tokio::time::sleep(Duration::from_secs(1)).await;
    viewer.connection().mark_sent(1_000_000);

    assert_eq!(
        next(&rx).await,
        Outbound::Control(ServerMessage::Status { paused: false })
    );
    assert!(start.elapsed() < Duration::from_secs(30));
    assert!(!p.is_paused());
}

#[tokio::test(start_paused = true)]
async fn client_pause_survives_backpressure_release() {
    let h = harness();
    let (viewer, rx) = connect(&h, "feat").await;
    next(&rx).await;
    let p = process(&h);

    p.emit(&vec![b'z'; 1_100_000]);
    assert!(matches!(next(&rx).await, Outbound::Data(_)));
    assert_eq!(
        next(&rx).await,
        Outbound::Control(ServerMessage::Status { paused: true })
    );

    h.adapter.handle_inbound(&viewer, br#"{"type":"pause"}"#);
    viewer.connection().mark_sent(1_100_000);
    assert_eq!(
        next(&rx).await,
        Outbound::Control(ServerMessage::Status { paused: false })
    );
    assert!(p.is_paused(), "client still wants output paused");

    h.adapter.handle_inbound(&viewer, br#"{"type":"resume"}"#);
    assert!(!p.is_paused());
}

// ---------------------------------------------------------------------------
// Inbound
// ---------------------------------------------------------------------------

#[tokio::test]
async fn inbound_frames_are_dispatched() {
    let h = harness();
    let (viewer, _rx) = connect(&h, "feat").await;
    let p = process(&h);

    h.adapter.handle_inbound(&viewer, b"git status\r");
    h.adapter.handle_inbound(&viewer, br#"{"type":"resize","cols":132,"rows":50}"#);
    h.adapter.handle_inbound(&viewer, br#"{"type":"resize","cols":0,"rows":50}"#);
    h.adapter.handle_inbound(&viewer, br#"{"type":"bogus"}"#);
    h.adapter.handle_inbound(&viewer, br#"{"type":"pause"}"#);

    assert_eq!(p.written(), b"git status\r");
    assert_eq!(p.resizes(), vec![(132, 50)]);
    assert!(p.is_paused());
}

// ---------------------------------------------------------------------------
// Takeover / disconnect
// ---------------------------------------------------------------------------

#[tokio::test]
async fn second_viewer_takes_over() {
    let h = harness();
    let (first, rx1) = connect(&h, "feat").await;
    next(&rx1).await;
    let p = process(&h);
    h.adapter.handle_inbound(&first, br#"{"type":"pause"}"#);
    assert!(p.is_paused());

    let (second, rx2) = connect(&h, "feat").await;
    assert_eq!(next(&rx1).await, Outbound::Control(ServerMessage::Takeover));
    assert_eq!(next(&rx1).await, Outbound::Close);
    match next(&rx2).await {
        Outbound::Control(ServerMessage::Session { takeover, .. }) => assert!(takeover),
        other => panic!("expected handshake, got {other:?}"),
    }

    // Same process, reset to resumed, now feeding only the new viewer.
    assert_eq!(h.spawner.spawn_count(), 1);
    assert!(!p.is_paused());
    assert_eq!(p.listener_count(), 1);
    p.emit(&[b'y'; 600]);
    assert_eq!(next(&rx2).await, Outbound::Data(vec![b'y'; 600]));

    // Input from the displaced viewer is dropped.
    h.adapter.handle_inbound(&first, b"stale");
    assert!(p.written().is_empty());

    // The displaced viewer's disconnect must not detach its successor.
    let resumes = p.resume_calls();
    h.adapter.disconnect(first).await;
    {
        let registry = h.registry.lock().await;
        assert!(registry.is_active_viewer(second.session_id(), second.connection().id()));
    }
    assert_eq!(p.resume_calls(), resumes);
}

#[tokio::test(start_paused = true)]
async fn displaced_viewer_cannot_leave_process_paused() {
    let h = harness();
    let (first, rx1) = connect(&h, "feat").await;
    next(&rx1).await;
    let p = process(&h);

    // The first viewer never drains, so its pump stalls in backpressure
    // with most of the burst still queued behind it.
    for _ in 0..250 {
        p.emit(&[b'z'; 10 * 1024]);
    }
    loop {
        match next(&rx1).await {
            Outbound::Control(ServerMessage::Status { paused: true }) => break,
            Outbound::Data(_) => {}
            other => panic!("expected output then a pause, got {other:?}"),
        }
    }
    assert!(p.is_paused());

    let (second, _rx2) = connect(&h, "feat").await;
    assert!(!p.is_paused());

    // Well past the backpressure timeout of the stalled pump.
    tokio::time::sleep(Duration::from_secs(31)).await;
    assert!(!p.is_paused());
    assert_eq!(p.pause_calls(), 1);

    h.adapter.disconnect(first).await;
    assert!(!p.is_paused());
    assert_eq!(second.flow().state(), PauseState::default());

    // The successor still owns pausing.
    h.adapter.handle_inbound(&second, br#"{"type":"pause"}"#);
    assert!(p.is_paused());
    h.adapter.handle_inbound(&second, br#"{"type":"resume"}"#);
    assert!(!p.is_paused());
}

#[tokio::test]
async fn disconnect_keeps_process_and_reconnect_reuses_it() {
    let h = harness();
    let (viewer, _rx) = connect(&h, "feat").await;
    let session_id = viewer.session_id();
    let p = process(&h);
    h.adapter.handle_inbound(&viewer, br#"{"type":"pause"}"#);

    h.adapter.disconnect(viewer).await;
    assert!(!p.is_paused(), "an unwatched process must not stay paused");
    {
        let registry = h.registry.lock().await;
        let session = registry.get(session_id).unwrap();
        assert!(!session.viewer().connected);
        assert!(session.viewer().disconnected_at.is_some());
    }
    assert!(p.is_alive());
    assert_eq!(p.kill_calls(), 0);
    assert_eq!(p.listener_count(), 0);

    let (again, rx) = connect(&h, "feat").await;
    assert_eq!(again.session_id(), session_id);
    assert_eq!(h.spawner.spawn_count(), 1);
    assert!(!p.is_paused());
    match next(&rx).await {
        Outbound::Control(ServerMessage::Session { takeover, .. }) => assert!(!takeover),
        other => panic!("expected handshake, got {other:?}"),
    }
}

#[tokio::test]
async fn process_exit_flushes_and_closes() {
    let h = harness();
    let (_viewer, rx) = connect(&h, "feat").await;
    next(&rx).await;
    let p = process(&h);

    p.emit(b"bye\r\n");
    p.finish(7);

    assert_eq!(next(&rx).await, Outbound::Data(b"bye\r\n".to_vec()));
    assert_eq!(
        next(&rx).await,
        Outbound::Control(ServerMessage::Exit { code: Some(7) })
    );
    assert_eq!(next(&rx).await, Outbound::Close);
}

// ---------------------------------------------------------------------------
// Recovered scrollback
// ---------------------------------------------------------------------------

#[tokio::test]
async fn first_viewer_sees_recovered_scrollback_once() {
    let store = Arc::new(MemorySnapshotStore::new());
    store
        .save(&Snapshot {
            session_id: Uuid::new_v4(),
            buffer_lines: vec!["$ cargo test".into(), "ok".into()],
            dimensions: Dimensions { cols: 80, rows: 24 },
            timestamp: Utc::now(),
            work_key: Some(WorkKey::new("feat").unwrap()),
            agent_kind: Some(AgentKind::Claude),
        })
        .unwrap();
    let spawner = Arc::new(ScriptedSpawner::new());
    let mut registry: SessionRegistry<ViewerConnection> = SessionRegistry::new(spawner.clone())
        .with_scrollback(Arc::new(ScrollbackSerializer::new(store.clone())), true);
    assert_eq!(registry.stage_recovery(), 1);
    let h = harness_with(registry, spawner);

    let (viewer, rx) = connect(&h, "feat").await;
    assert!(matches!(
        next(&rx).await,
        Outbound::Control(ServerMessage::Session { .. })
    ));
    assert_eq!(next(&rx).await, Outbound::Data(b"$ cargo test\r\nok\r\n".to_vec()));
    process(&h).emit(&[b'y'; 600]);
    assert_eq!(next(&rx).await, Outbound::Data(vec![b'y'; 600]));

    // Saved under the new session's id.
    let session_id = viewer.session_id();
    assert!(store.load(session_id).unwrap().is_some());

    h.adapter.disconnect(viewer).await;
    let (_again, rx) = connect(&h, "feat").await;
    next(&rx).await;
    process(&h).emit(&[b'q'; 600]);
    assert_eq!(next(&rx).await, Outbound::Data(vec![b'q'; 600]));
}
