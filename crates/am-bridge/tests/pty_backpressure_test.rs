//! Backpressure against a real pseudo-terminal. Kernel pty reads come back
//! a few KiB at a time, so this exercises burst detection end to end.

#![cfg(unix)]

use std::sync::Arc;
use std::time::Duration;

use am_bridge::adapter::{ConnectRequest, PumpSettings, SharedRegistry, TransportAdapter};
use am_bridge::connection::{Outbound, ViewerConnection};
use am_bridge::protocol::ServerMessage;
use am_core::config::{AgentCommandConfig, AgentsConfig};
use am_core::types::{AgentKind, WorkKey};
use am_session::launch::ConfigLaunchResolver;
use am_session::pty::{PtySpawner, TerminalProcess};
use am_session::registry::SessionRegistry;
use tokio::sync::Mutex;

#[tokio::test]
async fn flooding_process_is_paused_for_a_stalled_viewer() {
    let mut agents = AgentsConfig::default();
    agents.shell = AgentCommandConfig {
        command: "head".into(),
        args: vec!["-c".into(), "6000000".into(), "/dev/zero".into()],
    };
    let registry: SharedRegistry = Arc::new(Mutex::new(SessionRegistry::new(Arc::new(PtySpawner))));
    let resolver = Arc::new(ConfigLaunchResolver::new(std::env::temp_dir(), agents));
    let adapter = TransportAdapter::new(registry.clone(), resolver, PumpSettings::default());

    // Nothing is ever marked sent, so the backlog only grows.
    let (conn, rx) = ViewerConnection::new();
    let request = ConnectRequest {
        work_key: WorkKey::new("flood").unwrap(),
        agent_kind: AgentKind::Shell,
        cols: 80,
        rows: 24,
    };
    let viewer = adapter.connect(request, conn).await.expect("spawn head on a pty");

    let paused = tokio::time::timeout(Duration::from_secs(20), async {
        loop {
            match rx.recv_async().await {
                Ok(Outbound::Control(ServerMessage::Status { paused: true })) => return true,
                Ok(Outbound::Control(ServerMessage::Exit { .. })) | Err(_) => return false,
                Ok(_) => {}
            }
        }
    })
    .await
    .unwrap_or(false);

    assert!(paused, "a stalled viewer should pause the flooding process");
    assert!(viewer.process().is_paused());
    assert!(viewer.connection().backlog() > PumpSettings::default().high_water);

    adapter.disconnect(viewer).await;
    registry.lock().await.kill_all();
}
